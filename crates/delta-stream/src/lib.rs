//! Client-side streaming ingestion for incrementally generated assistant replies.
//!
//! A session negotiates a stream, opens it over one of two transport shapes,
//! reconstructs frames from arbitrarily split bytes, decodes each payload into
//! a delta or a terminal signal, and hands text to the caller in coalesced
//! batches.
//!
//! # Callback usage
//!
//! ```no_run
//! use delta_stream::prelude::*;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), StreamError> {
//! let config = StreamClientConfig::new("http://localhost:4000/graphql", TransportKind::EventStream);
//! let client = StreamClient::from_config(config)?;
//!
//! let handle = client.start_stream(
//!     StreamRequest::new("Say hello"),
//!     FnCallbacks::new(
//!         |text: &str| print!("{text}"),
//!         || println!(),
//!         |err: StreamError| eprintln!("stream failed: {err}"),
//!     ),
//! );
//! let state = handle.wait().await;
//! println!("session ended as {state:?}");
//! # Ok(())
//! # }
//! ```
//!
//! # Polling usage
//!
//! ```no_run
//! use delta_stream::prelude::*;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), StreamError> {
//! let config = StreamClientConfig::new("http://localhost:4000/graphql/stream", TransportKind::ChunkedBody);
//! let text = StreamClient::from_config(config)?
//!     .start_event_stream(StreamRequest::new("Say hello"))
//!     .collect_text()
//!     .await?;
//! println!("{text}");
//! # Ok(())
//! # }
//! ```

/// Time-window coalescing of deltas.
pub mod batch;
/// Client configuration and environment loading.
pub mod config;
/// Payload decoding into deltas and terminal signals.
pub mod decode;
/// Public error type.
pub mod errors;
/// Frame parsers for line-delimited and event-stream bodies.
pub mod frame;
/// Stream endpoint negotiation.
pub mod negotiate;
/// Process-wide tracing setup.
pub mod observability;
/// Common imports for typical usage.
pub mod prelude;
/// Session lifecycle, callbacks and cancellation.
pub mod session;
/// Channel-based consumption of session output.
pub mod stream;
/// Transport capability interface and HTTP implementation.
pub mod transport;

pub use batch::{DEFAULT_BATCH_INTERVAL, DeltaBatcher};
pub use config::StreamClientConfig;
pub use decode::{DecodedEvent, PayloadDecoder, decode};
pub use errors::StreamError;
pub use frame::{
    ChunkedFrameParser, FeedError, Frame, FrameParser, SseFrameParser, Utf8StreamDecoder,
};
pub use negotiate::{Endpoint, FixedEndpoint, GraphqlNegotiator, Negotiator, StreamRequest};
pub use observability::{LogSettings, init_logging, init_observability};
pub use session::{
    CancelHandle, FnCallbacks, SessionState, StreamCallbacks, StreamClient, StreamClientBuilder,
    StreamHandle,
};
pub use stream::{EventStream, StreamEvent};
pub use transport::{ByteStream, HttpTransport, StreamTransport, TransportKind};
