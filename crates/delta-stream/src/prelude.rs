//! Common imports for typical usage.
pub use crate::{
    CancelHandle, EventStream, FnCallbacks, SessionState, StreamCallbacks, StreamClient,
    StreamClientConfig, StreamError, StreamEvent, StreamHandle, StreamRequest, TransportKind,
};
