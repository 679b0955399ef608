//! Stream session lifecycle.
//!
//! Each `start_stream` call spawns one task that owns the whole session:
//! negotiation, the transport, the frame parser, the payload decoder and the
//! delta batcher. The only input from outside is the cancel flag, which the
//! callback gate checks before every delivery.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::StreamExt as _;
use tokio::sync::watch;
use tracing::{Instrument as _, debug, info, info_span, warn};

use crate::batch::DeltaBatcher;
use crate::config::StreamClientConfig;
use crate::decode::{DecodedEvent, PayloadDecoder};
use crate::errors::StreamError;
use crate::frame::{ChunkedFrameParser, FeedError, Frame, FrameParser, SseFrameParser};
use crate::negotiate::{Endpoint, FixedEndpoint, GraphqlNegotiator, Negotiator, StreamRequest};
use crate::transport::{ByteStream, HttpTransport, StreamTransport, TransportKind};

/// Lifecycle of one stream session.
///
/// `Completed`, `Failed` and `Cancelled` are terminal; once reached the state
/// never changes again.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum SessionState {
    Idle,
    Negotiating,
    Connected,
    Streaming,
    Completed,
    Failed,
    Cancelled,
}

impl SessionState {
    /// Returns true for `Completed`, `Failed` and `Cancelled`.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Consumer contract of a session.
///
/// `on_chunk` fires zero or more times with non-empty text in stream order,
/// then at most one of `on_complete` / `on_error`. Nothing fires after the
/// terminal callback or after cancellation.
pub trait StreamCallbacks: Send + 'static {
    /// A batch of assistant text.
    fn on_chunk(&mut self, text: &str);
    /// The stream finished cleanly.
    fn on_complete(&mut self);
    /// The stream failed.
    fn on_error(&mut self, error: StreamError);
}

/// `StreamCallbacks` built from three closures.
pub struct FnCallbacks<C, D, E> {
    on_chunk: C,
    on_complete: D,
    on_error: E,
}

impl<C, D, E> FnCallbacks<C, D, E>
where
    C: FnMut(&str) + Send + 'static,
    D: FnMut() + Send + 'static,
    E: FnMut(StreamError) + Send + 'static,
{
    /// Wraps the chunk, completion and error closures.
    pub fn new(on_chunk: C, on_complete: D, on_error: E) -> Self {
        Self {
            on_chunk,
            on_complete,
            on_error,
        }
    }
}

impl<C, D, E> StreamCallbacks for FnCallbacks<C, D, E>
where
    C: FnMut(&str) + Send + 'static,
    D: FnMut() + Send + 'static,
    E: FnMut(StreamError) + Send + 'static,
{
    fn on_chunk(&mut self, text: &str) {
        (self.on_chunk)(text)
    }

    fn on_complete(&mut self) {
        (self.on_complete)()
    }

    fn on_error(&mut self, error: StreamError) {
        (self.on_error)(error)
    }
}

/// Wraps the caller's callbacks and enforces the delivery contract.
struct CallbackGate<C> {
    callbacks: C,
    cancel_rx: watch::Receiver<bool>,
    terminated: bool,
}

impl<C: StreamCallbacks> CallbackGate<C> {
    fn is_open(&self) -> bool {
        !self.terminated && !*self.cancel_rx.borrow()
    }

    fn chunk(&mut self, text: &str) {
        if text.is_empty() || !self.is_open() {
            return;
        }
        self.callbacks.on_chunk(text);
    }

    fn complete(&mut self) {
        if !self.is_open() {
            return;
        }
        self.terminated = true;
        self.callbacks.on_complete();
    }

    fn fail(&mut self, error: StreamError) {
        if !self.is_open() {
            return;
        }
        self.terminated = true;
        self.callbacks.on_error(error);
    }
}

type SharedGate<C> = Arc<Mutex<CallbackGate<C>>>;

fn with_gate<C, R>(gate: &SharedGate<C>, f: impl FnOnce(&mut CallbackGate<C>) -> R) -> R {
    let mut guard = gate.lock().unwrap_or_else(PoisonError::into_inner);
    f(&mut guard)
}

/// Cancels a running session. Cloneable and idempotent.
#[derive(Clone)]
pub struct CancelHandle {
    cancel_tx: Arc<watch::Sender<bool>>,
    state: Arc<watch::Sender<SessionState>>,
}

impl CancelHandle {
    /// Closes the transport and suppresses every further callback.
    ///
    /// No-op once the session is terminal.
    pub fn cancel(&self) {
        let moved = self.state.send_if_modified(|state| {
            if state.is_terminal() {
                return false;
            }
            *state = SessionState::Cancelled;
            true
        });
        if moved {
            self.cancel_tx.send_replace(true);
        }
    }
}

/// Handle to a running session.
///
/// Dropping the handle does not stop the session; call [`cancel`] for that.
///
/// [`cancel`]: StreamHandle::cancel
pub struct StreamHandle {
    session_id: uuid::Uuid,
    cancel: CancelHandle,
    task: tokio::task::JoinHandle<()>,
}

impl StreamHandle {
    /// Id attached to this session's log records.
    pub fn session_id(&self) -> uuid::Uuid {
        self.session_id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        *self.cancel.state.borrow()
    }

    /// Receiver that observes every state transition.
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.cancel.state.subscribe()
    }

    /// See [`CancelHandle::cancel`].
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Returns a cloneable cancel handle.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Waits for the session task to end and returns the final state.
    ///
    /// Every callback has run by the time this resolves.
    pub async fn wait(self) -> SessionState {
        if let Err(err) = self.task.await {
            warn!(session_id = %self.session_id, error = %err, "stream session task aborted");
        }
        *self.cancel.state.borrow()
    }
}

/// Entry point for starting stream sessions.
#[derive(Clone)]
pub struct StreamClient {
    negotiator: Arc<dyn Negotiator>,
    transport: Arc<dyn StreamTransport>,
    transport_kind: TransportKind,
    decoder: PayloadDecoder,
    batch_interval: Duration,
    max_pending_bytes: usize,
}

impl StreamClient {
    /// Starts a builder; HTTP adapters are used unless overridden.
    pub fn builder(config: StreamClientConfig) -> StreamClientBuilder {
        StreamClientBuilder {
            config,
            negotiator: None,
            transport: None,
        }
    }

    /// Builds a client with the default HTTP adapters for the config.
    pub fn from_config(config: StreamClientConfig) -> Result<Self, StreamError> {
        Self::builder(config).build()
    }

    /// Transport shape used by this client's sessions.
    pub fn transport_kind(&self) -> TransportKind {
        self.transport_kind
    }

    /// Starts a session and returns immediately.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start_stream(
        &self,
        request: StreamRequest,
        callbacks: impl StreamCallbacks,
    ) -> StreamHandle {
        let session_id = uuid::Uuid::new_v4();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let state = Arc::new(watch::channel(SessionState::Idle).0);
        let gate = Arc::new(Mutex::new(CallbackGate {
            callbacks,
            cancel_rx: cancel_rx.clone(),
            terminated: false,
        }));

        let task = SessionTask {
            kind: self.transport_kind,
            negotiator: self.negotiator.clone(),
            transport: self.transport.clone(),
            decoder: self.decoder.clone(),
            batch_interval: self.batch_interval,
            max_pending_bytes: self.max_pending_bytes,
            gate,
            state: state.clone(),
            cancel_rx,
        };
        let span = info_span!("stream_session", session_id = %session_id, transport = %self.transport_kind);
        let join = tokio::spawn(task.run(request).instrument(span));

        StreamHandle {
            session_id,
            cancel: CancelHandle {
                cancel_tx: Arc::new(cancel_tx),
                state,
            },
            task: join,
        }
    }
}

/// Builder for [`StreamClient`].
pub struct StreamClientBuilder {
    config: StreamClientConfig,
    negotiator: Option<Arc<dyn Negotiator>>,
    transport: Option<Arc<dyn StreamTransport>>,
}

impl StreamClientBuilder {
    /// Replaces the negotiation step.
    pub fn negotiator(mut self, negotiator: Arc<dyn Negotiator>) -> Self {
        self.negotiator = Some(negotiator);
        self
    }

    /// Replaces the transport.
    pub fn transport(mut self, transport: Arc<dyn StreamTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Validates the config and builds the client.
    ///
    /// Without overrides, `EventStream` negotiates through
    /// [`GraphqlNegotiator`] and `ChunkedBody` streams from the config URL
    /// through [`FixedEndpoint`].
    pub fn build(self) -> Result<StreamClient, StreamError> {
        let config = self.config;
        config.validate()?;
        let negotiator: Arc<dyn Negotiator> = match self.negotiator {
            Some(negotiator) => negotiator,
            None => match config.transport_kind {
                TransportKind::EventStream => Arc::new(GraphqlNegotiator::new(&config)?),
                TransportKind::ChunkedBody => Arc::new(FixedEndpoint::new(config.url.clone())),
            },
        };
        let transport: Arc<dyn StreamTransport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(HttpTransport::new(&config)?),
        };
        Ok(StreamClient {
            negotiator,
            transport,
            transport_kind: config.transport_kind,
            decoder: PayloadDecoder::new(config.stream_field),
            batch_interval: config.batch_interval,
            max_pending_bytes: config.max_pending_bytes,
        })
    }
}

enum Termination {
    Completed,
    Failed(StreamError),
    Cancelled,
}

struct SessionTask<C> {
    kind: TransportKind,
    negotiator: Arc<dyn Negotiator>,
    transport: Arc<dyn StreamTransport>,
    decoder: PayloadDecoder,
    batch_interval: Duration,
    max_pending_bytes: usize,
    gate: SharedGate<C>,
    state: Arc<watch::Sender<SessionState>>,
    cancel_rx: watch::Receiver<bool>,
}

impl<C: StreamCallbacks> SessionTask<C> {
    async fn run(mut self, request: StreamRequest) {
        let termination = self.drive(request).await;
        match termination {
            Termination::Completed => {
                if self.transition(SessionState::Completed) {
                    info!("stream completed");
                    with_gate(&self.gate, |gate| gate.complete());
                }
            }
            Termination::Failed(error) => {
                if self.transition(SessionState::Failed) {
                    warn!(error = %error, "stream failed");
                    with_gate(&self.gate, |gate| gate.fail(error));
                }
            }
            Termination::Cancelled => {
                info!("stream cancelled");
                self.transition(SessionState::Cancelled);
            }
        }
    }

    async fn drive(&mut self, request: StreamRequest) -> Termination {
        self.transition(SessionState::Negotiating);
        let negotiated = tokio::select! {
            biased;
            _ = wait_cancelled(&mut self.cancel_rx) => return Termination::Cancelled,
            result = self.negotiator.negotiate(&request) => result,
        };
        let endpoint = match negotiated {
            Ok(endpoint) if !endpoint.url.trim().is_empty() => endpoint,
            Ok(_) => {
                return Termination::Failed(StreamError::negotiation(
                    "negotiation returned an empty endpoint",
                ));
            }
            Err(err) => return Termination::Failed(as_negotiation_error(err)),
        };
        debug!(url = %endpoint.url, stream_id = ?endpoint.stream_id, "stream endpoint negotiated");

        self.transition(SessionState::Connected);
        let opened = tokio::select! {
            biased;
            _ = wait_cancelled(&mut self.cancel_rx) => return Termination::Cancelled,
            result = open_transport(self.transport.as_ref(), self.kind, &endpoint) => result,
        };
        let mut bytes = match opened {
            Ok(bytes) => bytes,
            Err(err) => return Termination::Failed(err),
        };

        self.transition(SessionState::Streaming);
        let mut parser: Box<dyn FrameParser> = match self.kind {
            TransportKind::EventStream => Box::new(SseFrameParser::new(self.max_pending_bytes)),
            TransportKind::ChunkedBody => {
                Box::new(ChunkedFrameParser::new(self.max_pending_bytes))
            }
        };
        let gate = self.gate.clone();
        let mut batcher = DeltaBatcher::new(self.batch_interval, move |batch: String| {
            with_gate(&gate, |gate| gate.chunk(&batch));
        });

        let termination = self.pump(&mut bytes, parser.as_mut(), &mut batcher).await;
        match termination {
            Termination::Cancelled => batcher.dispose(),
            _ => batcher.flush_now(),
        }
        termination
    }

    async fn pump<F>(
        &mut self,
        bytes: &mut ByteStream,
        parser: &mut dyn FrameParser,
        batcher: &mut DeltaBatcher<F>,
    ) -> Termination
    where
        F: FnMut(String),
    {
        loop {
            let frames = tokio::select! {
                biased;
                _ = wait_cancelled(&mut self.cancel_rx) => return Termination::Cancelled,
                _ = batcher.wait_due(), if batcher.is_pending() => {
                    batcher.expire();
                    continue;
                }
                next = bytes.next() => match next {
                    Some(Ok(chunk)) => match parser.feed(&chunk) {
                        Ok(frames) => frames,
                        Err(FeedError { frames, error }) => {
                            return self
                                .apply_frames(frames, batcher)
                                .unwrap_or(Termination::Failed(error));
                        }
                    },
                    Some(Err(err)) => return Termination::Failed(err),
                    None => {
                        let frames = parser.finish();
                        return self.apply_frames(frames, batcher).unwrap_or_else(|| {
                            Termination::Failed(StreamError::transport(
                                "stream closed before terminal frame",
                            ))
                        });
                    }
                },
            };
            if let Some(termination) = self.apply_frames(frames, batcher) {
                return termination;
            }
        }
    }

    /// Decodes frames in order; stops at the first terminal event and drops
    /// the rest.
    fn apply_frames<F>(
        &self,
        frames: Vec<Frame>,
        batcher: &mut DeltaBatcher<F>,
    ) -> Option<Termination>
    where
        F: FnMut(String),
    {
        for frame in frames {
            match self.decoder.decode(&frame) {
                DecodedEvent::Delta { text } => batcher.append(&text),
                DecodedEvent::Done => return Some(Termination::Completed),
                DecodedEvent::Error { message } => {
                    return Some(Termination::Failed(StreamError::remote(message)));
                }
                DecodedEvent::Ignored => {
                    debug!(event = %frame.event_name, "ignoring frame");
                }
            }
        }
        None
    }

    /// Moves to `next` unless the session is already terminal. Returns false
    /// when the state did not change, e.g. because `cancel` got there first.
    fn transition(&self, next: SessionState) -> bool {
        self.state.send_if_modified(|state| {
            if state.is_terminal() || *state == next {
                return false;
            }
            let from = *state;
            debug!(?from, to = ?next, "session state");
            *state = next;
            true
        })
    }
}

async fn open_transport(
    transport: &dyn StreamTransport,
    kind: TransportKind,
    endpoint: &Endpoint,
) -> Result<ByteStream, StreamError> {
    match kind {
        TransportKind::EventStream => transport.open_event_channel(endpoint).await,
        TransportKind::ChunkedBody => transport.open_chunked_read(endpoint).await,
    }
}

fn as_negotiation_error(err: StreamError) -> StreamError {
    match err {
        StreamError::Negotiation { .. } => err,
        other => StreamError::negotiation(other.to_string()),
    }
}

/// Resolves once the cancel flag is set; never resolves if the sender is gone.
async fn wait_cancelled(cancel_rx: &mut watch::Receiver<bool>) {
    loop {
        if *cancel_rx.borrow_and_update() {
            return;
        }
        if cancel_rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use futures::stream;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone, PartialEq)]
    enum Seen {
        Chunk(String),
        Complete,
        Error(StreamError),
    }

    #[derive(Clone, Default)]
    struct Recorder(Arc<Mutex<Vec<Seen>>>);

    impl Recorder {
        fn events(&self) -> Vec<Seen> {
            self.0.lock().expect("recorder").clone()
        }

        fn text(&self) -> String {
            self.events()
                .into_iter()
                .filter_map(|seen| match seen {
                    Seen::Chunk(text) => Some(text),
                    _ => None,
                })
                .collect()
        }

        fn terminals(&self) -> usize {
            self.events()
                .iter()
                .filter(|seen| !matches!(seen, Seen::Chunk(_)))
                .count()
        }
    }

    impl StreamCallbacks for Recorder {
        fn on_chunk(&mut self, text: &str) {
            self.0.lock().expect("recorder").push(Seen::Chunk(text.into()));
        }

        fn on_complete(&mut self) {
            self.0.lock().expect("recorder").push(Seen::Complete);
        }

        fn on_error(&mut self, error: StreamError) {
            self.0.lock().expect("recorder").push(Seen::Error(error));
        }
    }

    enum NegotiatorBehavior {
        Endpoint(Endpoint),
        Fail(StreamError),
        Pending,
    }

    struct FakeNegotiator {
        behavior: NegotiatorBehavior,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl Negotiator for FakeNegotiator {
        async fn negotiate(&self, _request: &StreamRequest) -> Result<Endpoint, StreamError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.behavior {
                NegotiatorBehavior::Endpoint(endpoint) => Ok(endpoint.clone()),
                NegotiatorBehavior::Fail(err) => Err(err.clone()),
                NegotiatorBehavior::Pending => std::future::pending().await,
            }
        }
    }

    enum TransportBehavior {
        Chunks(Vec<Result<Bytes, StreamError>>),
        ChunksThenPending(Vec<Result<Bytes, StreamError>>),
        Refuse(StreamError),
    }

    struct FakeTransport {
        behavior: TransportBehavior,
        opened: Arc<Mutex<Vec<(TransportKind, Endpoint)>>>,
    }

    impl FakeTransport {
        fn open(&self, kind: TransportKind, endpoint: &Endpoint) -> Result<ByteStream, StreamError> {
            self.opened
                .lock()
                .expect("opened")
                .push((kind, endpoint.clone()));
            match &self.behavior {
                TransportBehavior::Chunks(chunks) => Ok(Box::pin(stream::iter(chunks.clone()))),
                TransportBehavior::ChunksThenPending(chunks) => {
                    Ok(Box::pin(stream::iter(chunks.clone()).chain(stream::pending())))
                }
                TransportBehavior::Refuse(err) => Err(err.clone()),
            }
        }
    }

    #[async_trait::async_trait]
    impl StreamTransport for FakeTransport {
        async fn open_event_channel(&self, endpoint: &Endpoint) -> Result<ByteStream, StreamError> {
            self.open(TransportKind::EventStream, endpoint)
        }

        async fn open_chunked_read(&self, endpoint: &Endpoint) -> Result<ByteStream, StreamError> {
            self.open(TransportKind::ChunkedBody, endpoint)
        }
    }

    struct Fixture {
        client: StreamClient,
        negotiations: Arc<AtomicUsize>,
        opened: Arc<Mutex<Vec<(TransportKind, Endpoint)>>>,
    }

    fn fixture(
        kind: TransportKind,
        negotiator: NegotiatorBehavior,
        transport: TransportBehavior,
    ) -> Fixture {
        let negotiations = Arc::new(AtomicUsize::new(0));
        let opened = Arc::new(Mutex::new(Vec::new()));
        let client = StreamClient::builder(StreamClientConfig::new("http://localhost/graphql", kind))
            .negotiator(Arc::new(FakeNegotiator {
                behavior: negotiator,
                calls: negotiations.clone(),
            }))
            .transport(Arc::new(FakeTransport {
                behavior: transport,
                opened: opened.clone(),
            }))
            .build()
            .expect("client");
        Fixture {
            client,
            negotiations,
            opened,
        }
    }

    fn endpoint() -> NegotiatorBehavior {
        NegotiatorBehavior::Endpoint(Endpoint::new("http://localhost/sse/1"))
    }

    fn chunks(parts: &[&[u8]]) -> Vec<Result<Bytes, StreamError>> {
        parts
            .iter()
            .map(|part| Ok(Bytes::copy_from_slice(part)))
            .collect()
    }

    async fn run(fixture: &Fixture) -> (SessionState, Recorder) {
        let recorder = Recorder::default();
        let handle = fixture
            .client
            .start_stream(StreamRequest::new("hello"), recorder.clone());
        let state = handle.wait().await;
        (state, recorder)
    }

    #[tokio::test]
    async fn event_stream_delivers_deltas_then_completes() {
        let fixture = fixture(
            TransportKind::EventStream,
            endpoint(),
            TransportBehavior::Chunks(chunks(&[
                b"event: connected\ndata: {\"streamId\":\"1\"}\n\n",
                b"event: delta\ndata: {\"delta\":\"Hel\"}\n\nevent: delta\ndata: {\"content\":\"lo\"}\n\n",
                b"event: done\ndata: {}\n\n",
            ])),
        );
        let (state, recorder) = run(&fixture).await;
        assert_eq!(state, SessionState::Completed);
        assert_eq!(recorder.text(), "Hello");
        assert_eq!(recorder.events().last(), Some(&Seen::Complete));
        assert_eq!(recorder.terminals(), 1);

        let opened = fixture.opened.lock().expect("opened").clone();
        assert_eq!(opened.len(), 1);
        assert_eq!(opened[0].0, TransportKind::EventStream);
        assert_eq!(opened[0].1.url, "http://localhost/sse/1");
    }

    #[tokio::test]
    async fn event_stream_skips_keep_alive_and_usage_events() {
        let fixture = fixture(
            TransportKind::EventStream,
            endpoint(),
            TransportBehavior::Chunks(chunks(&[
                b"event: delta\ndata: {\"delta\":\"Hi\"}\n\n",
                b"event: ping\ndata: keep-alive\n\n",
                b"event: usage\ndata: {\"content\":\"tokens=42\"}\n\n",
                b"event: done\ndata: {}\n\n",
            ])),
        );
        let (state, recorder) = run(&fixture).await;
        assert_eq!(state, SessionState::Completed);
        assert_eq!(
            recorder.events(),
            vec![Seen::Chunk("Hi".into()), Seen::Complete]
        );
    }

    #[tokio::test]
    async fn event_stream_drops_half_received_event_at_close() {
        let fixture = fixture(
            TransportKind::EventStream,
            endpoint(),
            TransportBehavior::Chunks(chunks(&[
                b"event: delta\ndata: {\"delta\":\"Hi\"}\n\nevent: delta\ndata: half a sent",
            ])),
        );
        let (state, recorder) = run(&fixture).await;
        assert_eq!(state, SessionState::Failed);
        let events = recorder.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], Seen::Chunk("Hi".into()));
        assert!(matches!(&events[1], Seen::Error(StreamError::Transport { .. })));
    }

    #[tokio::test]
    async fn chunked_body_survives_arbitrary_byte_splits() {
        let logical = "Grüße, 世界! 👋 done";
        let mut body = Vec::new();
        for word in logical.split_inclusive(' ') {
            body.extend_from_slice(
                format!("data: {}\n\n", serde_json::json!({ "content": word })).as_bytes(),
            );
        }
        body.extend_from_slice(b"data: [DONE]\n");

        for (a, b) in [(1, 2), (7, 31), (13, body.len() - 3), (40, 41)] {
            let fixture = fixture(
                TransportKind::ChunkedBody,
                endpoint(),
                TransportBehavior::Chunks(chunks(&[&body[..a], &body[a..b], &body[b..]])),
            );
            let (state, recorder) = run(&fixture).await;
            assert_eq!(state, SessionState::Completed, "split {a}/{b}");
            assert_eq!(recorder.text(), logical, "split {a}/{b}");
            assert_eq!(recorder.terminals(), 1);
        }
    }

    #[tokio::test]
    async fn nothing_is_delivered_after_done() {
        let fixture = fixture(
            TransportKind::ChunkedBody,
            endpoint(),
            TransportBehavior::ChunksThenPending(chunks(&[
                b"data: {\"content\":\"kept\"}\ndata: [DONE]\ndata: {\"content\":\"late\"}\n",
                b"data: {\"content\":\"later\"}\n",
            ])),
        );
        let (state, recorder) = run(&fixture).await;
        assert_eq!(state, SessionState::Completed);
        assert_eq!(
            recorder.events(),
            vec![Seen::Chunk("kept".into()), Seen::Complete]
        );
    }

    #[tokio::test]
    async fn remote_error_event_fails_after_flushing_text() {
        let fixture = fixture(
            TransportKind::EventStream,
            endpoint(),
            TransportBehavior::ChunksThenPending(chunks(&[
                b"event: delta\ndata: partial\n\nevent: error\ndata: {\"message\":\"model overloaded\"}\n\n",
            ])),
        );
        let (state, recorder) = run(&fixture).await;
        assert_eq!(state, SessionState::Failed);
        assert_eq!(
            recorder.events(),
            vec![
                Seen::Chunk("partial".into()),
                Seen::Error(StreamError::remote("model overloaded")),
            ]
        );
    }

    #[tokio::test]
    async fn negotiation_failure_never_opens_transport() {
        let fixture = fixture(
            TransportKind::EventStream,
            NegotiatorBehavior::Fail(StreamError::transport("connection refused")),
            TransportBehavior::Chunks(Vec::new()),
        );
        let (state, recorder) = run(&fixture).await;
        assert_eq!(state, SessionState::Failed);
        assert!(fixture.opened.lock().expect("opened").is_empty());
        let events = recorder.events();
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], Seen::Error(StreamError::Negotiation { message }) if message.contains("connection refused")));
    }

    #[tokio::test]
    async fn empty_endpoint_is_negotiation_error() {
        let fixture = fixture(
            TransportKind::EventStream,
            NegotiatorBehavior::Endpoint(Endpoint::new("")),
            TransportBehavior::Chunks(Vec::new()),
        );
        let (state, recorder) = run(&fixture).await;
        assert_eq!(state, SessionState::Failed);
        assert!(matches!(
            recorder.events().as_slice(),
            [Seen::Error(StreamError::Negotiation { .. })]
        ));
    }

    #[tokio::test]
    async fn refused_transport_is_transport_error() {
        let fixture = fixture(
            TransportKind::ChunkedBody,
            endpoint(),
            TransportBehavior::Refuse(StreamError::transport_status("bad gateway", 502)),
        );
        let (state, recorder) = run(&fixture).await;
        assert_eq!(state, SessionState::Failed);
        assert_eq!(
            recorder.events(),
            vec![Seen::Error(StreamError::transport_status("bad gateway", 502))]
        );
    }

    #[tokio::test]
    async fn stream_closing_without_terminal_frame_fails() {
        let fixture = fixture(
            TransportKind::ChunkedBody,
            endpoint(),
            TransportBehavior::Chunks(chunks(&[b"data: {\"content\":\"cut\"}\n"])),
        );
        let (state, recorder) = run(&fixture).await;
        assert_eq!(state, SessionState::Failed);
        let events = recorder.events();
        assert_eq!(events[0], Seen::Chunk("cut".into()));
        assert!(matches!(&events[1], Seen::Error(StreamError::Transport { .. })));
        assert_eq!(events.len(), 2);
    }

    #[tokio::test]
    async fn unterminated_done_at_end_of_body_completes() {
        let fixture = fixture(
            TransportKind::ChunkedBody,
            endpoint(),
            TransportBehavior::Chunks(chunks(&[b"data: {\"data\":{\"sendMessageStream\":\"x\"}}\ndata: [DONE]"])),
        );
        let (state, recorder) = run(&fixture).await;
        assert_eq!(state, SessionState::Completed);
        assert_eq!(recorder.text(), "x");
    }

    #[tokio::test]
    async fn mid_stream_read_error_fails_once() {
        let mut parts = chunks(&[b"data: a\n"]);
        parts.push(Err(StreamError::transport("connection reset")));
        parts.extend(chunks(&[b"data: b\n", b"data: [DONE]\n"]));
        let fixture = fixture(
            TransportKind::ChunkedBody,
            endpoint(),
            TransportBehavior::Chunks(parts),
        );
        let (state, recorder) = run(&fixture).await;
        assert_eq!(state, SessionState::Failed);
        assert_eq!(
            recorder.events(),
            vec![
                Seen::Chunk("a".into()),
                Seen::Error(StreamError::transport("connection reset")),
            ]
        );
    }

    #[tokio::test]
    async fn oversized_record_is_malformed_stream() {
        let negotiations = Arc::new(AtomicUsize::new(0));
        let client = StreamClient::builder(
            StreamClientConfig::new("http://localhost/stream", TransportKind::ChunkedBody)
                .max_pending_bytes(16),
        )
        .negotiator(Arc::new(FakeNegotiator {
            behavior: endpoint(),
            calls: negotiations.clone(),
        }))
        .transport(Arc::new(FakeTransport {
            behavior: TransportBehavior::ChunksThenPending(chunks(&[
                b"data: 0123456789abcdef",
            ])),
            opened: Arc::new(Mutex::new(Vec::new())),
        }))
        .build()
        .expect("client");
        let recorder = Recorder::default();
        let state = client
            .start_stream(StreamRequest::new("hi"), recorder.clone())
            .wait()
            .await;
        assert_eq!(state, SessionState::Failed);
        assert!(matches!(
            recorder.events().as_slice(),
            [Seen::Error(StreamError::MalformedStream { .. })]
        ));
    }

    #[tokio::test]
    async fn done_before_oversized_tail_still_completes() {
        let client = StreamClient::builder(
            StreamClientConfig::new("http://localhost/stream", TransportKind::ChunkedBody)
                .max_pending_bytes(16),
        )
        .negotiator(Arc::new(FixedEndpoint::new("http://localhost/stream")))
        .transport(Arc::new(FakeTransport {
            behavior: TransportBehavior::ChunksThenPending(chunks(&[
                b"data: kept\ndata: [DONE]\ndata: 0123456789abcdef",
            ])),
            opened: Arc::new(Mutex::new(Vec::new())),
        }))
        .build()
        .expect("client");
        let recorder = Recorder::default();
        let state = client
            .start_stream(StreamRequest::new("hi"), recorder.clone())
            .wait()
            .await;
        assert_eq!(state, SessionState::Completed);
        assert_eq!(
            recorder.events(),
            vec![Seen::Chunk("kept".into()), Seen::Complete]
        );
    }

    #[tokio::test]
    async fn text_before_oversized_tail_is_flushed_before_failure() {
        let client = StreamClient::builder(
            StreamClientConfig::new("http://localhost/stream", TransportKind::ChunkedBody)
                .max_pending_bytes(16),
        )
        .negotiator(Arc::new(FixedEndpoint::new("http://localhost/stream")))
        .transport(Arc::new(FakeTransport {
            behavior: TransportBehavior::ChunksThenPending(chunks(&[
                b"data: kept\ndata: 0123456789abcdef",
            ])),
            opened: Arc::new(Mutex::new(Vec::new())),
        }))
        .build()
        .expect("client");
        let recorder = Recorder::default();
        let state = client
            .start_stream(StreamRequest::new("hi"), recorder.clone())
            .wait()
            .await;
        assert_eq!(state, SessionState::Failed);
        let events = recorder.events();
        assert_eq!(events[0], Seen::Chunk("kept".into()));
        assert!(matches!(&events[1], Seen::Error(StreamError::MalformedStream { .. })));
        assert_eq!(events.len(), 2);
    }

    #[tokio::test]
    async fn cancel_before_negotiation_resolves_fires_nothing() {
        let fixture = fixture(
            TransportKind::EventStream,
            NegotiatorBehavior::Pending,
            TransportBehavior::Chunks(Vec::new()),
        );
        let recorder = Recorder::default();
        let handle = fixture
            .client
            .start_stream(StreamRequest::new("hello"), recorder.clone());
        handle.cancel();
        assert_eq!(handle.state(), SessionState::Cancelled);
        assert_eq!(handle.wait().await, SessionState::Cancelled);
        assert!(recorder.events().is_empty());
        assert!(fixture.opened.lock().expect("opened").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_mid_stream_suppresses_buffered_text() {
        let fixture = fixture(
            TransportKind::ChunkedBody,
            endpoint(),
            TransportBehavior::ChunksThenPending(chunks(&[b"data: {\"content\":\"buffered\"}\n"])),
        );
        let recorder = Recorder::default();
        let handle = fixture
            .client
            .start_stream(StreamRequest::new("hello"), recorder.clone());
        let mut states = handle.subscribe_state();
        states
            .wait_for(|state| *state == SessionState::Streaming)
            .await
            .expect("streaming");
        tokio::task::yield_now().await;

        handle.cancel();
        handle.cancel();
        assert_eq!(handle.wait().await, SessionState::Cancelled);
        assert!(recorder.events().is_empty());
        assert_eq!(fixture.negotiations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancel_after_completion_is_a_no_op() {
        let fixture = fixture(
            TransportKind::ChunkedBody,
            endpoint(),
            TransportBehavior::Chunks(chunks(&[b"data: [DONE]\n"])),
        );
        let recorder = Recorder::default();
        let handle = fixture
            .client
            .start_stream(StreamRequest::new("hello"), recorder.clone());
        let cancel = handle.cancel_handle();
        assert_eq!(handle.wait().await, SessionState::Completed);
        cancel.cancel();
        assert_eq!(recorder.events(), vec![Seen::Complete]);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_stream_is_delivered_in_interval_batches() {
        let (tx, rx) = futures::channel::mpsc::unbounded::<Result<Bytes, StreamError>>();

        struct ChannelTransport(Mutex<Option<futures::channel::mpsc::UnboundedReceiver<Result<Bytes, StreamError>>>>);

        #[async_trait::async_trait]
        impl StreamTransport for ChannelTransport {
            async fn open_event_channel(&self, _: &Endpoint) -> Result<ByteStream, StreamError> {
                Err(StreamError::transport("unused"))
            }

            async fn open_chunked_read(&self, _: &Endpoint) -> Result<ByteStream, StreamError> {
                let rx = self
                    .0
                    .lock()
                    .expect("rx")
                    .take()
                    .ok_or_else(|| StreamError::transport("already opened"))?;
                Ok(Box::pin(rx))
            }
        }

        let client = StreamClient::builder(StreamClientConfig::new(
            "http://localhost/stream",
            TransportKind::ChunkedBody,
        ))
        .negotiator(Arc::new(FixedEndpoint::new("http://localhost/stream")))
        .transport(Arc::new(ChannelTransport(Mutex::new(Some(rx)))))
        .build()
        .expect("client");

        let recorder = Recorder::default();
        let handle = client.start_stream(StreamRequest::new("hi"), recorder.clone());

        let send = |text: &str| {
            tx.unbounded_send(Ok(Bytes::from(format!("data: {text}\n"))))
                .expect("send");
        };
        send("a");
        send("b");
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(recorder.events(), vec![Seen::Chunk("ab".into())]);

        send("c");
        tokio::time::sleep(Duration::from_millis(10)).await;
        send("d");
        tokio::time::sleep(Duration::from_millis(60)).await;
        send("e");
        send("[DONE]");

        assert_eq!(handle.wait().await, SessionState::Completed);
        assert_eq!(
            recorder.events(),
            vec![
                Seen::Chunk("ab".into()),
                Seen::Chunk("cd".into()),
                Seen::Chunk("e".into()),
                Seen::Complete,
            ]
        );
    }
}
