use tokio::sync::mpsc;

use crate::errors::StreamError;
use crate::negotiate::StreamRequest;
use crate::session::{CancelHandle, SessionState, StreamCallbacks, StreamClient, StreamHandle};

/// Session output as a sequence of events, for consumers that prefer polling
/// to callbacks.
#[derive(Clone, Debug, PartialEq)]
pub enum StreamEvent {
    /// A batch of assistant text.
    Chunk { text: String },
    /// Terminal success.
    Completed,
    /// Terminal failure.
    Error { error: StreamError },
}

impl StreamEvent {
    /// Returns true for `Completed` and `Error`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Error { .. })
    }
}

struct ChannelCallbacks {
    tx: mpsc::UnboundedSender<StreamEvent>,
}

impl StreamCallbacks for ChannelCallbacks {
    fn on_chunk(&mut self, text: &str) {
        let _ = self.tx.send(StreamEvent::Chunk { text: text.into() });
    }

    fn on_complete(&mut self) {
        let _ = self.tx.send(StreamEvent::Completed);
    }

    fn on_error(&mut self, error: StreamError) {
        let _ = self.tx.send(StreamEvent::Error { error });
    }
}

/// Polling handle returned by [`StreamClient::start_event_stream`].
///
/// The channel closes after the terminal event or after cancellation.
pub struct EventStream {
    handle: StreamHandle,
    rx: mpsc::UnboundedReceiver<StreamEvent>,
}

impl EventStream {
    /// Waits for the next event; `None` once the session has ended.
    pub async fn next_event(&mut self) -> Option<StreamEvent> {
        self.rx.recv().await
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.handle.state()
    }

    /// Returns a handle that can cancel the session.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.handle.cancel_handle()
    }

    /// Drains the stream and returns the concatenated text.
    ///
    /// Returns the session's error if it failed, or `Transport` if it was
    /// cancelled before finishing.
    pub async fn collect_text(mut self) -> Result<String, StreamError> {
        let mut text = String::new();
        while let Some(event) = self.rx.recv().await {
            match event {
                StreamEvent::Chunk { text: chunk } => text.push_str(&chunk),
                StreamEvent::Completed => return Ok(text),
                StreamEvent::Error { error } => return Err(error),
            }
        }
        let state = self.handle.wait().await;
        Err(StreamError::transport(format!(
            "stream ended without terminal event (state {state:?})"
        )))
    }
}

impl StreamClient {
    /// Starts a session whose output is read through [`EventStream`].
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start_event_stream(&self, request: StreamRequest) -> EventStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = self.start_stream(request, ChannelCallbacks { tx });
        EventStream { handle, rx }
    }
}
