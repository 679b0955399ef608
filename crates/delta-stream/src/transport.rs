//! Transport capability interface and its reqwest implementation.
//!
//! Sessions only see a byte stream; which parser reads it is chosen by
//! [`TransportKind`].

use std::fmt;
use std::pin::Pin;
use std::str::FromStr;

use futures::StreamExt as _;
use tracing::debug;

use crate::config::StreamClientConfig;
use crate::errors::StreamError;
use crate::negotiate::Endpoint;

/// Raw response body as delivered by the transport.
pub type ByteStream =
    Pin<Box<dyn futures::Stream<Item = Result<bytes::Bytes, StreamError>> + Send + 'static>>;

/// Wire shape of a stream, fixed per session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum TransportKind {
    /// `text/event-stream` with named events, opened after negotiation.
    EventStream,
    /// Streaming response body with newline-delimited `data:` records.
    ChunkedBody,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EventStream => f.write_str("event-stream"),
            Self::ChunkedBody => f.write_str("chunked"),
        }
    }
}

impl FromStr for TransportKind {
    type Err = StreamError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "sse" | "event-stream" | "eventstream" => Ok(Self::EventStream),
            "chunked" | "chunked-body" | "chunkedbody" => Ok(Self::ChunkedBody),
            other => Err(StreamError::Config(format!(
                "unknown transport kind: {other}"
            ))),
        }
    }
}

/// Opens the byte stream behind a negotiated endpoint.
#[async_trait::async_trait]
pub trait StreamTransport: Send + Sync {
    /// Opens a server-push event channel against the endpoint.
    async fn open_event_channel(&self, endpoint: &Endpoint) -> Result<ByteStream, StreamError>;

    /// Issues the streaming request and returns its body as it arrives.
    async fn open_chunked_read(&self, endpoint: &Endpoint) -> Result<ByteStream, StreamError>;
}

/// HTTP transport backed by `reqwest`.
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    /// Builds a transport with the config's timeouts.
    pub fn new(config: &StreamClientConfig) -> Result<Self, StreamError> {
        Ok(Self::with_client(build_http_client(config)?))
    }

    /// Wraps an existing client.
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

pub(crate) fn build_http_client(
    config: &StreamClientConfig,
) -> Result<reqwest::Client, StreamError> {
    let mut builder = reqwest::Client::builder().connect_timeout(config.connect_timeout);
    if let Some(timeout) = config.timeout {
        builder = builder.timeout(timeout);
    }
    builder
        .build()
        .map_err(|e| StreamError::Config(format!("failed to build HTTP client: {e}")))
}

#[async_trait::async_trait]
impl StreamTransport for HttpTransport {
    async fn open_event_channel(&self, endpoint: &Endpoint) -> Result<ByteStream, StreamError> {
        debug!(url = %endpoint.url, "opening event channel");
        let response = self
            .client
            .get(endpoint.url.as_str())
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .header(reqwest::header::CACHE_CONTROL, "no-cache")
            .send()
            .await
            .map_err(|e| StreamError::transport(format!("event channel request failed: {e}")))?;
        into_byte_stream(response).await
    }

    async fn open_chunked_read(&self, endpoint: &Endpoint) -> Result<ByteStream, StreamError> {
        debug!(url = %endpoint.url, "opening chunked read");
        let mut request = self.client.post(endpoint.url.as_str());
        if let Some(body) = &endpoint.request_body {
            request = request.json(body);
        }
        let response = request
            .send()
            .await
            .map_err(|e| StreamError::transport(format!("streaming request failed: {e}")))?;
        into_byte_stream(response).await
    }
}

async fn into_byte_stream(response: reqwest::Response) -> Result<ByteStream, StreamError> {
    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "<unreadable body>".to_string());
        return Err(StreamError::transport_status(
            format!("stream request failed with status {status}: {body}"),
            status.as_u16(),
        ));
    }
    let stream = response
        .bytes_stream()
        .map(|chunk| chunk.map_err(|e| StreamError::transport(format!("stream read failed: {e}"))));
    Ok(Box::pin(stream))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_kind_parses_aliases() {
        assert_eq!("SSE".parse::<TransportKind>().ok(), Some(TransportKind::EventStream));
        assert_eq!(
            " chunked ".parse::<TransportKind>().ok(),
            Some(TransportKind::ChunkedBody)
        );
        assert!("websocket".parse::<TransportKind>().is_err());
    }

    #[test]
    fn transport_kind_display_round_trips() {
        for kind in [TransportKind::EventStream, TransportKind::ChunkedBody] {
            assert_eq!(kind.to_string().parse::<TransportKind>().ok(), Some(kind));
        }
    }
}
