//! Runs configured sources one after another
//!
//! A failing source is logged and reported; the remaining sources still run.

use crate::config::{HarvestConfig, PipelineConfig, SourceConfig};
use crate::harvester::{build_harvester, HarvestSession, Harvester};
use crate::pipeline::{DocumentConverter, Pipeline, PipelineStats, XmlFieldExtractor};
use crate::storage::{IndexStore, SqliteIndex};
use crate::HarvestError;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Outcome of one source's run
#[derive(Debug, Clone)]
pub struct SourceReport {
    pub source_id: String,
    /// Documents handed to the pipeline
    pub harvested: usize,
    /// Pipeline counts of a successful run
    pub stats: Option<PipelineStats>,
    pub error: Option<String>,
}

impl SourceReport {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Harvests one source into `store`
///
/// The pipeline is closed clean when the harvester succeeds and dirty
/// otherwise, so a failed run never moves the cursor.
pub fn harvest_source(
    harvester: &mut dyn Harvester,
    config: &PipelineConfig,
    store: Box<dyn IndexStore>,
    converter: Arc<dyn DocumentConverter>,
) -> Result<(usize, PipelineStats), HarvestError> {
    let pipeline = Pipeline::open(harvester.source_id(), config, store, converter)?;
    let mut session = HarvestSession::new(pipeline, config.harvest_message_step);

    match harvester.harvest(&mut session) {
        Ok(()) => {
            let harvested = session.harvested();
            let stats = session.finish(true)?;
            Ok((harvested, stats))
        }
        Err(err) => {
            if let Err(close_err) = session.finish(false) {
                debug!(
                    "Closing pipeline of {} after failure: {}",
                    harvester.source_id(),
                    close_err
                );
            }
            Err(err)
        }
    }
}

/// Runs every configured source (or only `only`) with the given store factory
pub fn run_harvest_with<F>(
    config: &HarvestConfig,
    only: Option<&str>,
    converter: Arc<dyn DocumentConverter>,
    mut open_store: F,
) -> Result<Vec<SourceReport>, HarvestError>
where
    F: FnMut(&SourceConfig) -> Result<Box<dyn IndexStore>, HarvestError>,
{
    let sources: Vec<&SourceConfig> = config
        .sources
        .iter()
        .filter(|source| only.map_or(true, |id| source.id == id))
        .collect();

    if let Some(id) = only {
        if sources.is_empty() {
            return Err(HarvestError::UnknownSource(id.to_string()));
        }
    }

    let mut reports = Vec::with_capacity(sources.len());
    for source in sources {
        let started = Instant::now();
        info!("Starting harvest of {}", source.id);

        let result = build_harvester(source, &config.user_agent).and_then(|mut harvester| {
            let store = open_store(source)?;
            harvest_source(harvester.as_mut(), &source.pipeline, store, converter.clone())
        });

        let report = match result {
            Ok((harvested, stats)) => {
                info!(
                    "Finished harvest of {} in {:.1}s",
                    source.id,
                    started.elapsed().as_secs_f64()
                );
                SourceReport {
                    source_id: source.id.clone(),
                    harvested,
                    stats: Some(stats),
                    error: None,
                }
            }
            Err(err) => {
                error!("Harvest of {} failed: {}", source.id, err);
                SourceReport {
                    source_id: source.id.clone(),
                    harvested: 0,
                    stats: None,
                    error: Some(err.to_string()),
                }
            }
        };
        reports.push(report);
    }

    let failed = reports.iter().filter(|r| !r.is_success()).count();
    if failed > 0 {
        warn!("{} of {} sources failed", failed, reports.len());
    }
    Ok(reports)
}

/// Runs sources into the configured SQLite index with the default converter
pub fn run_harvest(
    config: &HarvestConfig,
    only: Option<&str>,
) -> Result<Vec<SourceReport>, HarvestError> {
    let database = Path::new(&config.storage.database_path);
    run_harvest_with(config, only, Arc::new(XmlFieldExtractor), |source| {
        let index = SqliteIndex::open(database, &source.id)?;
        Ok(Box::new(index) as Box<dyn IndexStore>)
    })
}
