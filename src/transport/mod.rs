//! Transport layer
//!
//! One resilient fetch of a remote resource, with conditional requests,
//! transfer decoding and bounded retries.

mod client;
mod error;
mod retry;

pub use client::{
    charset_from_content_type, format_http_date, parse_http_date, user_agent_string,
    FetchOutcome, FetchedStream, Sleeper, Transport, TransportSettings,
};
pub use error::TransportError;
pub use retry::{run_with_retry, Backoff, RetryPolicy, RetryableError};
