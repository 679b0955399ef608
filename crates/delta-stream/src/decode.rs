//! Frame payload decoding.
//!
//! The remote service has emitted several payload shapes over time and more
//! than one can be live at once, so decoding is an ordered fallback chain
//! rather than a single schema.

use serde_json::Value;
use tracing::debug;

use crate::frame::{DEFAULT_EVENT_NAME, Frame};

/// Literal payload that ends a chunked stream.
pub const DONE_SENTINEL: &str = "[DONE]";

/// Field read from `{ "data": { <field>: "..." } }` chunked payloads.
pub const DEFAULT_STREAM_FIELD: &str = "sendMessageStream";

/// Message used when an `error` event carries no readable `message`.
pub const GENERIC_REMOTE_ERROR: &str = "stream server error";

/// Uniform result of decoding one frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodedEvent {
    /// A fragment of assistant output.
    Delta { text: String },
    /// Terminal success.
    Done,
    /// Terminal failure reported by the remote side.
    Error { message: String },
    /// Nothing actionable (keep-alives, connection notices).
    Ignored,
}

impl DecodedEvent {
    /// Returns true for `Done` and `Error`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Error { .. })
    }
}

/// Stateless decoder for frame payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadDecoder {
    stream_field: String,
}

impl Default for PayloadDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_STREAM_FIELD)
    }
}

impl PayloadDecoder {
    /// Creates a decoder that reads `data.<stream_field>` from chunked payloads.
    pub fn new(stream_field: impl Into<String>) -> Self {
        Self {
            stream_field: stream_field.into(),
        }
    }

    /// Field name read from the chunked `data` envelope.
    pub fn stream_field(&self) -> &str {
        &self.stream_field
    }

    /// Decodes one frame. First match wins:
    ///
    /// 1. A `done` event or `[DONE]` data is `Done`. Events other than
    ///    `message`, `delta` and `error` (`connected`, keep-alives, usage
    ///    reports) are `Ignored` without looking at their data.
    /// 2. Data is parsed as JSON; on failure skip to 5.
    /// 3. Non-empty `delta` string.
    /// 4. Non-empty `content` string, then `data.<stream_field>`, then a bare
    ///    JSON string.
    /// 5. An `error` event becomes `Error` with the `message` field or a
    ///    generic message.
    /// 6. Non-empty plain text not starting with `{`, `[` or `"` is a delta.
    /// 7. Anything else is `Ignored`.
    pub fn decode(&self, frame: &Frame) -> DecodedEvent {
        let data = frame.data.as_str();
        match frame.event_name.as_str() {
            "done" => return DecodedEvent::Done,
            DEFAULT_EVENT_NAME | "delta" | "error" => {}
            other => {
                debug!(event = other, "ignoring non-text event");
                return DecodedEvent::Ignored;
            }
        }
        if data == DONE_SENTINEL {
            return DecodedEvent::Done;
        }

        let parsed = match serde_json::from_str::<Value>(data) {
            Ok(value) => Some(value),
            Err(err) => {
                if !data.trim().is_empty() {
                    debug!(event = %frame.event_name, error = %err, "payload is not JSON, trying fallbacks");
                }
                None
            }
        };

        if let Some(value) = &parsed
            && let Some(text) = self.structured_text(value)
        {
            return DecodedEvent::Delta {
                text: text.to_string(),
            };
        }

        if frame.event_name == "error" {
            let message = parsed
                .as_ref()
                .and_then(|value| non_empty_str(value.get("message")))
                .unwrap_or(GENERIC_REMOTE_ERROR);
            return DecodedEvent::Error {
                message: message.to_string(),
            };
        }

        // Bare text is a delta. This also masks a truncated JSON payload.
        if !data.trim().is_empty() && !data.trim_start().starts_with(['{', '[', '"']) {
            return DecodedEvent::Delta {
                text: data.to_string(),
            };
        }

        if parsed.is_none() && !data.trim().is_empty() {
            debug!(event = %frame.event_name, "dropping undecodable structured payload");
        }
        DecodedEvent::Ignored
    }

    fn structured_text<'a>(&self, value: &'a Value) -> Option<&'a str> {
        non_empty_str(value.get("delta"))
            .or_else(|| non_empty_str(value.get("content")))
            .or_else(|| {
                non_empty_str(
                    value
                        .get("data")
                        .and_then(|envelope| envelope.get(self.stream_field.as_str())),
                )
            })
            .or_else(|| value.as_str().filter(|text| !text.is_empty()))
    }
}

fn non_empty_str(value: Option<&Value>) -> Option<&str> {
    value
        .and_then(Value::as_str)
        .filter(|text| !text.is_empty())
}

/// Decodes a frame with the default stream field.
pub fn decode(frame: &Frame) -> DecodedEvent {
    PayloadDecoder::default().decode(frame)
}
