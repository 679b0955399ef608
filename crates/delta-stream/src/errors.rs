/// Fatal errors surfaced through `StreamCallbacks::on_error` or returned while
/// building a client.
///
/// Payload decode anomalies are deliberately absent: the decoder recovers from
/// them locally and the stream continues.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    /// Handle acquisition failed or returned no usable endpoint.
    #[error("negotiation error: {message}")]
    Negotiation { message: String },
    /// Connection failed, was refused, or closed before a terminal frame.
    #[error("transport error: {message}")]
    Transport {
        message: String,
        status_code: Option<u16>,
    },
    /// The remote side sent an explicit `error` event.
    #[error("remote error: {message}")]
    RemoteSignaled { message: String },
    /// The byte stream cannot be framed (for example an unterminated record
    /// that outgrew the carry-over limit).
    #[error("malformed stream: {message}")]
    MalformedStream { message: String },
    /// Invalid client configuration.
    #[error("config error: {0}")]
    Config(String),
}

impl StreamError {
    /// Creates a negotiation error.
    pub fn negotiation(message: impl Into<String>) -> Self {
        Self::Negotiation {
            message: message.into(),
        }
    }

    /// Creates a transport error without an HTTP status.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            status_code: None,
        }
    }

    /// Creates a transport error for a non-success HTTP status.
    pub fn transport_status(message: impl Into<String>, status_code: u16) -> Self {
        Self::Transport {
            message: message.into(),
            status_code: Some(status_code),
        }
    }

    /// Creates an error for a remote `error` event.
    pub fn remote(message: impl Into<String>) -> Self {
        Self::RemoteSignaled {
            message: message.into(),
        }
    }

    /// Creates a malformed-stream error.
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedStream {
            message: message.into(),
        }
    }

    /// Returns the human-readable message for this error.
    pub fn message(&self) -> &str {
        match self {
            Self::Negotiation { message }
            | Self::Transport { message, .. }
            | Self::RemoteSignaled { message }
            | Self::MalformedStream { message } => message,
            Self::Config(message) => message,
        }
    }

    /// Returns the HTTP status code when the error came from a non-success response.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Transport { status_code, .. } => *status_code,
            _ => None,
        }
    }
}
