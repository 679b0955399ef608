use std::time::Duration;

use crate::batch::DEFAULT_BATCH_INTERVAL;
use crate::decode::DEFAULT_STREAM_FIELD;
use crate::errors::StreamError;
use crate::frame::DEFAULT_MAX_PENDING_BYTES;
use crate::transport::TransportKind;

/// Configuration for a `StreamClient`.
#[derive(Clone, Debug)]
pub struct StreamClientConfig {
    /// For `EventStream`, the GraphQL endpoint that negotiates the stream.
    /// For `ChunkedBody`, the URL whose response body is streamed.
    pub url: String,
    /// Transport shape used by every session of the client.
    pub transport_kind: TransportKind,
    /// Field read from `{ "data": { <field>: "..." } }` chunked payloads.
    pub stream_field: String,
    /// Delta coalescing window.
    pub batch_interval: Duration,
    /// TCP/TLS connect timeout.
    pub connect_timeout: Duration,
    /// Optional whole-request timeout; includes reading the stream body.
    pub timeout: Option<Duration>,
    /// Upper bound on buffered, unterminated input per session.
    pub max_pending_bytes: usize,
}

impl StreamClientConfig {
    /// Creates a config with defaults for the given URL and transport.
    pub fn new(url: impl Into<String>, transport_kind: TransportKind) -> Self {
        Self {
            url: url.into(),
            transport_kind,
            stream_field: DEFAULT_STREAM_FIELD.to_string(),
            batch_interval: DEFAULT_BATCH_INTERVAL,
            connect_timeout: Duration::from_secs(10),
            timeout: None,
            max_pending_bytes: DEFAULT_MAX_PENDING_BYTES,
        }
    }

    /// Builds a config from `DELTA_STREAM_*` environment variables.
    ///
    /// - `DELTA_STREAM_URL` (required)
    /// - `DELTA_STREAM_TRANSPORT`: `sse`/`event-stream` (default) or `chunked`
    /// - `DELTA_STREAM_FIELD`: chunked envelope field
    /// - `DELTA_STREAM_BATCH_MS`: batching window in milliseconds
    /// - `DELTA_STREAM_TIMEOUT_SECS`: whole-request timeout in seconds
    pub fn from_env() -> Result<Self, StreamError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, StreamError> {
        let read = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let url = read("DELTA_STREAM_URL")
            .ok_or_else(|| StreamError::Config("missing DELTA_STREAM_URL".into()))?;
        let transport_kind = match read("DELTA_STREAM_TRANSPORT") {
            Some(raw) => raw.parse()?,
            None => TransportKind::EventStream,
        };
        let mut config = Self::new(url.trim(), transport_kind);
        if let Some(field) = read("DELTA_STREAM_FIELD") {
            config.stream_field = field.trim().to_string();
        }
        if let Some(raw) = read("DELTA_STREAM_BATCH_MS") {
            config.batch_interval = Duration::from_millis(parse_u64("DELTA_STREAM_BATCH_MS", &raw)?);
        }
        if let Some(raw) = read("DELTA_STREAM_TIMEOUT_SECS") {
            config.timeout = Some(Duration::from_secs(parse_u64(
                "DELTA_STREAM_TIMEOUT_SECS",
                &raw,
            )?));
        }
        config.validate()?;
        Ok(config)
    }

    /// Overrides the chunked envelope field.
    pub fn stream_field(mut self, field: impl Into<String>) -> Self {
        self.stream_field = field.into();
        self
    }

    /// Overrides the batching window.
    pub fn batch_interval(mut self, interval: Duration) -> Self {
        self.batch_interval = interval;
        self
    }

    /// Overrides the connect timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets a whole-request timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Overrides the carry-over bound.
    pub fn max_pending_bytes(mut self, max: usize) -> Self {
        self.max_pending_bytes = max;
        self
    }

    /// Checks that the config can drive a session.
    pub fn validate(&self) -> Result<(), StreamError> {
        reqwest::Url::parse(&self.url)
            .map_err(|e| StreamError::Config(format!("invalid url {:?}: {e}", self.url)))?;
        if self.stream_field.trim().is_empty() {
            return Err(StreamError::Config("stream_field must not be empty".into()));
        }
        if self.batch_interval.is_zero() {
            return Err(StreamError::Config(
                "batch_interval must be greater than 0".into(),
            ));
        }
        if self.max_pending_bytes == 0 {
            return Err(StreamError::Config(
                "max_pending_bytes must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

fn parse_u64(key: &str, raw: &str) -> Result<u64, StreamError> {
    raw.trim()
        .parse()
        .map_err(|e| StreamError::Config(format!("invalid {key} value {raw:?}: {e}")))
}
