//! Stream handle negotiation.
//!
//! Before a stream is opened, one request/response exchange produces the
//! [`Endpoint`] the transport connects to. The exchange itself is pluggable
//! through [`Negotiator`].

use serde_json::{Value, json};
use tracing::debug;

use crate::config::StreamClientConfig;
use crate::errors::StreamError;
use crate::transport::build_http_client;

/// Mutation that returns a stream id and an event-stream URL.
pub const START_STREAM_MUTATION: &str = "mutation StartStream($content: String!) {\n  startStream(content: $content) {\n    streamId\n    sseEndpoint\n  }\n}";

/// Mutation whose response body streams `data:` records directly.
pub const SEND_MESSAGE_STREAM_MUTATION: &str =
    "mutation SendMessageStream($content: String!) {\n  sendMessageStream(content: $content)\n}";

/// Payload carried by the negotiation call.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct StreamRequest {
    /// Text the user sent.
    pub content: String,
}

impl StreamRequest {
    /// Creates a request for the given text.
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
        }
    }
}

/// Opaque descriptor of where and how to open the stream.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Endpoint {
    /// Absolute URL of the stream.
    pub url: String,
    /// Server-assigned stream id, when the negotiation returned one.
    pub stream_id: Option<String>,
    /// JSON body POSTed by the chunked transport.
    pub request_body: Option<Value>,
}

impl Endpoint {
    /// Creates an endpoint with only a URL.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            stream_id: None,
            request_body: None,
        }
    }
}

/// Performs the handle-acquisition exchange.
#[async_trait::async_trait]
pub trait Negotiator: Send + Sync {
    /// Returns the endpoint for `request`, or a `Negotiation` error.
    async fn negotiate(&self, request: &StreamRequest) -> Result<Endpoint, StreamError>;
}

/// Negotiates through the `startStream` GraphQL mutation.
pub struct GraphqlNegotiator {
    client: reqwest::Client,
    url: reqwest::Url,
}

impl GraphqlNegotiator {
    /// Creates a negotiator for the config's GraphQL URL.
    pub fn new(config: &StreamClientConfig) -> Result<Self, StreamError> {
        Self::with_client(build_http_client(config)?, &config.url)
    }

    /// Creates a negotiator that reuses an existing client.
    pub fn with_client(client: reqwest::Client, url: &str) -> Result<Self, StreamError> {
        let url = reqwest::Url::parse(url)
            .map_err(|e| StreamError::Config(format!("invalid GraphQL url {url:?}: {e}")))?;
        Ok(Self { client, url })
    }
}

#[async_trait::async_trait]
impl Negotiator for GraphqlNegotiator {
    async fn negotiate(&self, request: &StreamRequest) -> Result<Endpoint, StreamError> {
        debug!(url = %self.url, "negotiating stream endpoint");
        let body = json!({
            "query": START_STREAM_MUTATION,
            "variables": { "content": request.content },
        });
        let response = self
            .client
            .post(self.url.clone())
            .json(&body)
            .send()
            .await
            .map_err(|e| StreamError::negotiation(format!("startStream request failed: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            let text = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(StreamError::negotiation(format!(
                "startStream failed with status {status}: {text}"
            )));
        }
        let value: Value = response
            .json()
            .await
            .map_err(|e| StreamError::negotiation(format!("invalid startStream response: {e}")))?;
        parse_start_stream_response(&self.url, &value)
    }
}

pub(crate) fn parse_start_stream_response(
    base: &reqwest::Url,
    value: &Value,
) -> Result<Endpoint, StreamError> {
    if let Some(errors) = value.get("errors").and_then(Value::as_array)
        && !errors.is_empty()
    {
        let message = errors
            .iter()
            .filter_map(|err| err.get("message").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("; ");
        return Err(StreamError::negotiation(if message.is_empty() {
            "startStream returned errors".to_string()
        } else {
            format!("startStream returned errors: {message}")
        }));
    }

    let start = value.pointer("/data/startStream");
    let sse_endpoint = start
        .and_then(|s| s.get("sseEndpoint"))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| StreamError::negotiation("missing sseEndpoint from startStream response"))?;
    let url = base.join(sse_endpoint).map_err(|e| {
        StreamError::negotiation(format!("unusable sseEndpoint {sse_endpoint:?}: {e}"))
    })?;
    let stream_id = start
        .and_then(|s| s.get("streamId"))
        .and_then(Value::as_str)
        .map(ToOwned::to_owned);

    Ok(Endpoint {
        url: url.to_string(),
        stream_id,
        request_body: None,
    })
}

/// Endpoint known up front; the stream request itself carries the message.
#[derive(Clone, Debug)]
pub struct FixedEndpoint {
    url: String,
    query: String,
}

impl FixedEndpoint {
    /// Streams from `url` using the `sendMessageStream` mutation body.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            query: SEND_MESSAGE_STREAM_MUTATION.to_string(),
        }
    }

    /// Overrides the GraphQL document sent with the stream request.
    pub fn query(mut self, query: impl Into<String>) -> Self {
        self.query = query.into();
        self
    }
}

#[async_trait::async_trait]
impl Negotiator for FixedEndpoint {
    async fn negotiate(&self, request: &StreamRequest) -> Result<Endpoint, StreamError> {
        if self.url.trim().is_empty() {
            return Err(StreamError::negotiation("no stream endpoint configured"));
        }
        Ok(Endpoint {
            url: self.url.clone(),
            stream_id: None,
            request_body: Some(json!({
                "query": self.query,
                "variables": { "content": request.content },
            })),
        })
    }
}
