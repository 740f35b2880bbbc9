//! OAI-PMH `ListRecords` harvesting
//!
//! One run is `Identify`, then `ListRecords` pages until the server stops
//! returning a resumption token. The new watermark is the `responseDate` of
//! the first page, so records changed while the listing was paged through
//! are picked up again by the next run.

use crate::config::{validate_oai_config, OaiConfig, UserAgentConfig};
use crate::harvester::{HarvestSession, Harvester};
use crate::oai::dates::Granularity;
use crate::oai::parser::{parse_response, PageSummary, ResumptionToken};
use crate::oai::{to_document, OaiError};
use crate::transport::{FetchOutcome, Transport, TransportSettings};
use crate::HarvestError;
use chrono::{DateTime, Utc};
use std::io::BufReader;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

/// Incremental harvester for one OAI-PMH repository
pub struct OaiHarvester {
    source_id: String,
    config: OaiConfig,
    transport: Transport,
    base_url: Url,
    sets: Vec<String>,
}

impl OaiHarvester {
    pub fn new(source_id: &str, config: &OaiConfig, transport: Transport) -> Result<Self, OaiError> {
        let base_url = Url::parse(&config.base_url)?;
        Ok(Self {
            source_id: source_id.to_string(),
            config: config.clone(),
            transport,
            base_url,
            sets: config.sets(),
        })
    }

    /// Validates `config` and builds a transport from it
    pub fn from_config(
        source_id: &str,
        config: &OaiConfig,
        user_agent: &UserAgentConfig,
    ) -> Result<Self, HarvestError> {
        validate_oai_config(config)?;
        let transport = Transport::new(user_agent, TransportSettings::from(config))?;
        Ok(Self::new(source_id, config, transport)?)
    }

    /// Asks the repository for its datestamp granularity
    ///
    /// Repositories that do not announce one get day granularity, which
    /// every OAI-PMH 2.0 server must accept.
    pub fn identify(&self) -> Result<Granularity, OaiError> {
        let mut url = self.base_url.clone();
        url.query_pairs_mut().append_pair("verb", "Identify");

        let summary = self.transport.fetch_with(&url, None, |outcome| match outcome {
            FetchOutcome::Fetched(stream) => {
                let charset = stream.charset().map(str::to_string);
                parse_response(BufReader::new(stream), charset.as_deref(), |_| Ok(()))
            }
            FetchOutcome::NotModified => Err(unexpected_not_modified(&url)),
        })?;

        match summary.granularity {
            Some(granularity) => {
                debug!("{} uses {:?} granularity", self.source_id, granularity);
                Ok(granularity)
            }
            None => {
                warn!(
                    "{} did not announce a datestamp granularity, assuming days",
                    self.source_id
                );
                Ok(Granularity::Day)
            }
        }
    }

    /// URL of one `ListRecords` page
    ///
    /// Follow-up pages carry only the resumption token.
    pub fn list_records_url(
        &self,
        granularity: Granularity,
        from: Option<DateTime<Utc>>,
        resumption_token: Option<&str>,
    ) -> Url {
        let mut url = self.base_url.clone();
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("verb", "ListRecords");
            match resumption_token {
                Some(token) => {
                    query.append_pair("resumptionToken", token);
                }
                None => {
                    query.append_pair("metadataPrefix", &self.config.metadata_prefix);
                    if let [set] = self.sets.as_slice() {
                        query.append_pair("set", set);
                    }
                    if let Some(from) = from {
                        query.append_pair("from", &granularity.format(from));
                    }
                }
            }
        }
        url
    }

    /// Fetches and parses one page, feeding its records to `session`
    ///
    /// Each retry re-requests the page and parses it with a new parser.
    fn harvest_page(&self, url: &Url, session: &mut HarvestSession) -> Result<PageSummary, OaiError> {
        let prefix = self.config.identifier_prefix.as_str();
        let sets = self.sets.as_slice();

        let tally = session.tally();
        self.transport.fetch_with(url, None, |outcome| match outcome {
            FetchOutcome::Fetched(stream) => {
                session.rewind(tally);
                let charset = stream.charset().map(str::to_string);
                parse_response(BufReader::new(stream), charset.as_deref(), |record| {
                    session
                        .add_document(to_document(record, prefix, sets))
                        .map_err(OaiError::from)
                })
            }
            FetchOutcome::NotModified => Err(unexpected_not_modified(url)),
        })
    }
}

impl Harvester for OaiHarvester {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn harvest(&mut self, session: &mut HarvestSession) -> Result<(), HarvestError> {
        session.set_variable("metadataPrefix", &self.config.metadata_prefix);

        let committed = Arc::new(AtomicUsize::new(0));
        {
            let committed = committed.clone();
            let source_id = self.source_id.clone();
            session.register_commit_listener(move |identifiers| {
                let total = committed.fetch_add(identifiers.len(), Ordering::Relaxed)
                    + identifiers.len();
                debug!("{}: {} documents committed so far", source_id, total);
            });
        }

        let from = if self.config.ignore_datestamps {
            None
        } else {
            session.from_reference()
        };
        if from.is_none() && self.config.delete_missing_documents {
            session.enable_deletion_tracking();
        }
        if self.sets.len() > 1 {
            info!(
                "{}: harvesting all sets, keeping only {}",
                self.source_id,
                self.sets.join(", ")
            );
        }

        let granularity = self.identify()?;
        let started = Utc::now();

        match from {
            Some(from) => info!(
                "{}: incremental harvest from {}",
                self.source_id,
                granularity.format(from)
            ),
            None => info!("{}: full harvest", self.source_id),
        }

        let mut token: Option<String> = None;
        let mut pages = 0usize;
        loop {
            let url = self.list_records_url(granularity, from, token.as_deref());
            info!("Harvesting {}", url);

            let summary = self.harvest_page(&url, session)?;
            pages += 1;

            if pages == 1 {
                session.propose_cursor(summary.response_date.unwrap_or(started));
            }
            if summary.no_records_match {
                info!("{}: no records match the request", self.source_id);
            }

            let Some(next) = summary.resumption_token else {
                break;
            };
            if token.as_deref() == Some(next.token.as_str()) {
                return Err(OaiError::RepeatedToken(next.token).into());
            }
            if let (Some(cursor), Some(size)) = (next.cursor, next.complete_list_size) {
                debug!("{}: at {} of {} records", self.source_id, cursor, size);
            }

            session.check_buffer(token_wait(&next, summary.response_date))?;
            token = Some(next.token);
        }

        info!(
            "{}: listing complete after {} pages",
            self.source_id, pages
        );
        Ok(())
    }
}

/// Longest backpressure wait before requesting the page behind `token`
///
/// Half of the token's remaining lifetime, so the token cannot expire while
/// the pipeline drains. Unbounded when the server gives no expiration.
fn token_wait(token: &ResumptionToken, response_date: Option<DateTime<Utc>>) -> Option<Duration> {
    let expiration = token.expiration?;
    let now = response_date.unwrap_or_else(Utc::now);
    Some(
        (expiration - now)
            .to_std()
            .map(|lifetime| lifetime / 2)
            .unwrap_or(Duration::ZERO),
    )
}

fn unexpected_not_modified(url: &Url) -> OaiError {
    OaiError::InvalidResponse(format!("{} answered 304 to an unconditional request", url))
}
