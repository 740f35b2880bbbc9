//! Harvest drivers
//!
//! Every source type has a [`Harvester`] that walks the source and hands
//! records to a [`HarvestSession`]. [`build_harvester`] maps a configured
//! source type to its driver.

mod directory;
mod runner;
mod session;

pub use directory::DirectoryHarvester;
pub use runner::{harvest_source, run_harvest, run_harvest_with, SourceReport};
pub use session::{HarvestSession, Tally};

use crate::config::{SourceConfig, SourceKind, UserAgentConfig};
use crate::oai::{OaiHarvester, StaticRepositoryHarvester};
use crate::{ConfigError, HarvestError};

/// A producer of document records for one source
pub trait Harvester {
    fn source_id(&self) -> &str;

    /// Walks the source once, feeding `session`
    ///
    /// Returning an error makes the caller close the pipeline dirty, leaving
    /// the cursor and the index's reconciliation state untouched.
    fn harvest(&mut self, session: &mut HarvestSession) -> Result<(), HarvestError>;
}

/// Creates the driver for a configured source
pub fn build_harvester(
    source: &SourceConfig,
    user_agent: &UserAgentConfig,
) -> Result<Box<dyn Harvester>, HarvestError> {
    let missing = |section: &str| {
        ConfigError::Validation(format!(
            "source '{}' has no [source.{}] section",
            source.id, section
        ))
    };

    let harvester: Box<dyn Harvester> = match source.kind {
        SourceKind::OaiPmh => {
            let oai = source.oai.as_ref().ok_or_else(|| missing("oai"))?;
            Box::new(OaiHarvester::from_config(&source.id, oai, user_agent)?)
        }
        SourceKind::OaiStatic => {
            let oai = source.oai.as_ref().ok_or_else(|| missing("oai"))?;
            Box::new(StaticRepositoryHarvester::from_config(
                &source.id, oai, user_agent,
            )?)
        }
        SourceKind::Directory => {
            let directory = source.directory.as_ref().ok_or_else(|| missing("directory"))?;
            Box::new(DirectoryHarvester::new(&source.id, directory.clone()))
        }
    };
    Ok(harvester)
}
