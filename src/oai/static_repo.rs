//! OAI static repositories
//!
//! A static repository is one XML document holding every record. It is
//! fetched with `If-Modified-Since` set to the stored cursor; an unmodified
//! document ends the run without touching the index.

use crate::config::{validate_oai_config, OaiConfig, UserAgentConfig};
use crate::harvester::{HarvestSession, Harvester};
use crate::oai::parser::{parse_static_repository, PageSummary};
use crate::oai::{to_document, OaiError};
use crate::transport::{FetchOutcome, Transport, TransportSettings};
use crate::HarvestError;
use chrono::{DateTime, Utc};
use std::io::BufReader;
use tracing::{info, warn};
use url::Url;

pub struct StaticRepositoryHarvester {
    source_id: String,
    config: OaiConfig,
    transport: Transport,
    url: Url,
    sets: Vec<String>,
}

impl StaticRepositoryHarvester {
    pub fn new(source_id: &str, config: &OaiConfig, transport: Transport) -> Result<Self, OaiError> {
        let url = Url::parse(&config.base_url)?;
        Ok(Self {
            source_id: source_id.to_string(),
            config: config.clone(),
            transport,
            url,
            sets: config.sets(),
        })
    }

    pub fn from_config(
        source_id: &str,
        config: &OaiConfig,
        user_agent: &UserAgentConfig,
    ) -> Result<Self, HarvestError> {
        validate_oai_config(config)?;
        let transport = Transport::new(user_agent, TransportSettings::from(config))?;
        Ok(Self::new(source_id, config, transport)?)
    }
}

impl Harvester for StaticRepositoryHarvester {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn harvest(&mut self, session: &mut HarvestSession) -> Result<(), HarvestError> {
        session.set_variable("metadataPrefix", &self.config.metadata_prefix);
        if self.config.delete_missing_documents {
            session.enable_deletion_tracking();
        }

        let since = if self.config.ignore_datestamps {
            None
        } else {
            session.from_reference()
        };
        info!("Harvesting static repository {}", self.url);

        let prefix = self.config.identifier_prefix.as_str();
        let metadata_prefix = self.config.metadata_prefix.as_str();
        let sets = self.sets.as_slice();

        let tally = session.tally();
        let fetched: Option<(PageSummary, Option<DateTime<Utc>>)> =
            self.transport.fetch_with(&self.url, since, |outcome| match outcome {
                FetchOutcome::NotModified => Ok::<_, OaiError>(None),
                FetchOutcome::Fetched(stream) => {
                    session.rewind(tally);
                    let last_modified = stream.last_modified();
                    let charset = stream.charset().map(str::to_string);
                    let summary = parse_static_repository(
                        BufReader::new(stream),
                        charset.as_deref(),
                        metadata_prefix,
                        |record| {
                            session
                                .add_document(to_document(record, prefix, sets))
                                .map_err(OaiError::from)
                        },
                    )?;
                    Ok(Some((summary, last_modified)))
                }
            })?;

        match fetched {
            None => {
                session.cancel_deletion_tracking();
                info!(
                    "{}: static repository not modified, nothing to harvest",
                    self.source_id
                );
            }
            Some((summary, last_modified)) => {
                match last_modified {
                    Some(ts) => session.propose_cursor(ts),
                    None => warn!(
                        "{}: response has no Last-Modified header, the next run will be a full harvest",
                        self.source_id
                    ),
                }
                info!(
                    "{}: {} records in static repository",
                    self.source_id, summary.records
                );
            }
        }
        Ok(())
    }
}
