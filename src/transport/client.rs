//! HTTP transport
//!
//! This module performs one resilient fetch of a harvestable resource:
//! - identifying User-Agent and content negotiation headers
//! - conditional requests through `If-Modified-Since`
//! - gzip / deflate / identity transfer decoding
//! - 503 `Retry-After` handling and bounded retries

use crate::config::{OaiConfig, UserAgentConfig};
use crate::transport::error::TransportError;
use crate::transport::retry::{run_with_retry, RetryPolicy, RetryableError};
use chrono::{DateTime, Utc};
use flate2::read::{GzDecoder, ZlibDecoder};
use reqwest::blocking::{Client, Response};
use reqwest::header::{
    HeaderMap, ACCEPT, ACCEPT_CHARSET, ACCEPT_ENCODING, AUTHORIZATION, CONTENT_ENCODING,
    CONTENT_TYPE, IF_MODIFIED_SINCE, LAST_MODIFIED, RETRY_AFTER,
};
use reqwest::StatusCode;
use std::fmt;
use std::io::Read;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

const ACCEPT_VALUE: &str = "text/xml, application/xml, *;q=0.1";
const ACCEPT_CHARSET_VALUE: &str = "UTF-8, *;q=0.1";
const ACCEPT_ENCODING_VALUE: &str = "gzip, deflate, identity;q=0.3, *;q=0";

/// Sleep function used between attempts
pub type Sleeper = Arc<dyn Fn(Duration) + Send + Sync>;

/// Request behaviour of a [`Transport`]
#[derive(Debug, Clone)]
pub struct TransportSettings {
    pub policy: RetryPolicy,
    /// Whole-request timeout
    pub timeout: Duration,
    /// Sent verbatim as the `Authorization` header
    pub authorization: Option<String>,
}

impl From<&OaiConfig> for TransportSettings {
    fn from(config: &OaiConfig) -> Self {
        Self {
            policy: RetryPolicy {
                retry_count: config.retry_count,
                retry_after: Duration::from_secs(config.retry_after_seconds),
                backoff: config.retry_backoff,
            },
            timeout: Duration::from_secs(config.timeout_after_seconds),
            authorization: config.authorization_header.clone(),
        }
    }
}

/// A successfully opened, already decoded response body
pub struct FetchedStream {
    url: String,
    body: Box<dyn Read + Send>,
    last_modified: Option<DateTime<Utc>>,
    charset: Option<String>,
}

impl FetchedStream {
    pub fn url(&self) -> &str {
        &self.url
    }

    /// `Last-Modified` of the response, the next conditional-fetch reference
    pub fn last_modified(&self) -> Option<DateTime<Utc>> {
        self.last_modified
    }

    /// Charset from `Content-Type`; an XML declaration in the body may override it
    pub fn charset(&self) -> Option<&str> {
        self.charset.as_deref()
    }
}

impl Read for FetchedStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.body.read(buf)
    }
}

impl fmt::Debug for FetchedStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchedStream")
            .field("url", &self.url)
            .field("last_modified", &self.last_modified)
            .field("charset", &self.charset)
            .finish_non_exhaustive()
    }
}

/// Result of one fetch
#[derive(Debug)]
pub enum FetchOutcome {
    Fetched(FetchedStream),
    /// The conditional request matched; there is no body
    NotModified,
}

/// Blocking HTTP transport with retry
pub struct Transport {
    client: Client,
    settings: TransportSettings,
    sleeper: Sleeper,
}

/// Formats the User-Agent header value
///
/// Format: Name/Version (+Contact)
pub fn user_agent_string(config: &UserAgentConfig) -> String {
    format!("{}/{} (+{})", config.name, config.version, config.contact)
}

impl Transport {
    /// Builds a transport with its own HTTP client
    ///
    /// The client does not decompress on its own; `Content-Encoding` is
    /// handled by [`Transport::fetch`] so unsupported encodings can be rejected.
    pub fn new(
        user_agent: &UserAgentConfig,
        settings: TransportSettings,
    ) -> Result<Self, TransportError> {
        let client = Client::builder()
            .user_agent(user_agent_string(user_agent))
            .timeout(settings.timeout)
            .connect_timeout(settings.timeout.min(Duration::from_secs(30)))
            .build()
            .map_err(TransportError::Client)?;

        Ok(Self {
            client,
            settings,
            sleeper: Arc::new(std::thread::sleep),
        })
    }

    /// Replaces the function used to wait between attempts
    pub fn with_sleeper(mut self, sleeper: impl Fn(Duration) + Send + Sync + 'static) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }

    pub fn settings(&self) -> &TransportSettings {
        &self.settings
    }

    /// Fetches `url`, retrying transient failures per the retry policy
    ///
    /// With `if_modified_since` set, a 304 answer yields
    /// [`FetchOutcome::NotModified`].
    pub fn fetch(
        &self,
        url: &Url,
        if_modified_since: Option<DateTime<Utc>>,
    ) -> Result<FetchOutcome, TransportError> {
        run_with_retry(
            &self.settings.policy,
            url.as_str(),
            |delay| (self.sleeper)(delay),
            |_| self.fetch_once(url, if_modified_since),
        )
    }

    /// Fetches `url` and hands the outcome to `consume`, retrying both together
    ///
    /// Every attempt opens a fresh response stream and calls `consume` again,
    /// so a consumer that builds its decoder inside the closure never reuses a
    /// partially-read decoder after a failure.
    pub fn fetch_with<T, E, F>(
        &self,
        url: &Url,
        if_modified_since: Option<DateTime<Utc>>,
        mut consume: F,
    ) -> Result<T, E>
    where
        E: RetryableError + From<TransportError>,
        F: FnMut(FetchOutcome) -> Result<T, E>,
    {
        run_with_retry(
            &self.settings.policy,
            url.as_str(),
            |delay| (self.sleeper)(delay),
            |_| {
                let outcome = self.fetch_once(url, if_modified_since)?;
                consume(outcome)
            },
        )
    }

    fn fetch_once(
        &self,
        url: &Url,
        if_modified_since: Option<DateTime<Utc>>,
    ) -> Result<FetchOutcome, TransportError> {
        debug!("GET {}", url);

        let mut request = self
            .client
            .get(url.as_str())
            .header(ACCEPT, ACCEPT_VALUE)
            .header(ACCEPT_CHARSET, ACCEPT_CHARSET_VALUE)
            .header(ACCEPT_ENCODING, ACCEPT_ENCODING_VALUE);

        if let Some(authorization) = &self.settings.authorization {
            request = request.header(AUTHORIZATION, authorization.as_str());
        }
        if let Some(since) = if_modified_since {
            request = request.header(IF_MODIFIED_SINCE, format_http_date(since));
        }

        let response = request.send().map_err(|source| TransportError::Request {
            url: url.to_string(),
            source,
        })?;

        let status = response.status();
        if status == StatusCode::NOT_MODIFIED {
            if if_modified_since.is_none() {
                return Err(TransportError::UnexpectedNotModified {
                    url: url.to_string(),
                });
            }
            info!("{} not modified since last harvest", url);
            return Ok(FetchOutcome::NotModified);
        }

        if !status.is_success() {
            let retry_after = if status == StatusCode::SERVICE_UNAVAILABLE {
                parse_retry_after(response.headers())
            } else {
                None
            };
            return Err(TransportError::Status {
                url: url.to_string(),
                status: status.as_u16(),
                retry_after,
            });
        }

        let headers = response.headers();
        let last_modified = header_str(headers, LAST_MODIFIED.as_str()).and_then(parse_http_date);
        let charset = header_str(headers, CONTENT_TYPE.as_str()).and_then(charset_from_content_type);
        let encoding = header_str(headers, CONTENT_ENCODING.as_str())
            .map(|value| value.trim().to_ascii_lowercase());

        if let Some(charset) = &charset {
            debug!("{} declares charset {}", url, charset);
        }

        let body = decode_body(url, response, encoding.as_deref())?;

        Ok(FetchOutcome::Fetched(FetchedStream {
            url: url.to_string(),
            body,
            last_modified,
            charset,
        }))
    }
}

fn decode_body(
    url: &Url,
    response: Response,
    encoding: Option<&str>,
) -> Result<Box<dyn Read + Send>, TransportError> {
    match encoding {
        None | Some("") | Some("identity") => Ok(Box::new(response)),
        Some("gzip") | Some("x-gzip") => Ok(Box::new(GzDecoder::new(response))),
        Some("deflate") => Ok(Box::new(ZlibDecoder::new(response))),
        Some(other) => Err(TransportError::UnsupportedEncoding {
            url: url.to_string(),
            encoding: other.to_string(),
        }),
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let value = header_str(headers, RETRY_AFTER.as_str())?.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }
    let at = parse_http_date(value)?;
    Some((at - Utc::now()).to_std().unwrap_or(Duration::ZERO))
}

/// Extracts the `charset` parameter of a `Content-Type` value
pub fn charset_from_content_type(content_type: &str) -> Option<String> {
    content_type.split(';').skip(1).find_map(|param| {
        let (name, value) = param.split_once('=')?;
        if name.trim().eq_ignore_ascii_case("charset") {
            let value = value.trim().trim_matches('"');
            (!value.is_empty()).then(|| value.to_string())
        } else {
            None
        }
    })
}

/// Formats a timestamp as an RFC 1123 HTTP date
pub fn format_http_date(ts: DateTime<Utc>) -> String {
    ts.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Parses an RFC 1123 HTTP date
pub fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(value.trim())
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}
