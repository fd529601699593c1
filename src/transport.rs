//! # Transport Adapter Contract
//!
//! The bridge wraps a native HTTP transport behind a fixed interface: push
//! callbacks in, pause/resume and body supply out. Platform-specific
//! transports become swappable adapters satisfying this contract instead of
//! parallel reimplementations of the bridge logic.
//!
//! An adapter's responsibilities per task:
//!
//! - deliver response metadata via [`ResponseSink::headers`] before any call
//!   to [`ResponseSink::body_chunk`]
//! - honor [`ChunkOutcome::Pause`] by awaiting [`ResponseSink::resumed`]
//! - pull request-body bytes from [`BodySource::stream`], re-requesting with
//!   a byte offset when a redirect or retry needs the body again
//! - raise redirects and credential challenges through the [`EventSink`] and
//!   await their decisions; a closed decision channel means "reject"
//! - observe the request's cancellation token
//! - call [`ResponseSink::finish`] exactly once, then drop the sink and the
//!   event sink so the request driver can complete
//!
//! [`ChunkOutcome::Pause`]: crate::response::ChunkOutcome::Pause

use std::future::Future;

use tokio_util::sync::CancellationToken;

use crate::body::BodySource;
use crate::config::SessionConfig;
use crate::error::Error;
use crate::events::{EventSink, RequestHead};
use crate::response::ResponseSink;

/// Everything an adapter needs to run one request task.
pub struct TaskRequest {
    /// Request metadata; the body travels separately.
    pub head: RequestHead,
    /// Request body supply, if the request has a body.
    pub body: Option<BodySource>,
    /// Cancelling this token must terminate the task promptly.
    pub cancel: CancellationToken,
}

/// One pooled native-transport handle.
///
/// A handle is created per distinct [`SessionConfig`] and shared by every
/// request resolved to that configuration until the pool evicts it.
pub trait TransportHandle: Send + Sync + 'static {
    /// Starts a data-producing task for the given request.
    ///
    /// The call returns once the task is launched; delivery happens through
    /// the sinks from the adapter's own background tasks.
    fn start(
        &self,
        request: TaskRequest,
        sink: ResponseSink,
        events: EventSink,
    ) -> Result<(), Error>;

    /// Gracefully closes the handle, resolving once every in-flight task has
    /// reached terminal closure. Awaited by the pool's shutdown barrier.
    fn close(&self) -> impl Future<Output = ()> + Send;
}

/// Factory for native-transport handles.
pub trait TransportAdapter: Send + Sync + 'static {
    /// The pooled handle type this adapter produces.
    type Handle: TransportHandle;

    /// Creates a native handle for the given configuration.
    ///
    /// Called lazily by the pool, at most once per distinct configuration
    /// key at a time.
    fn open(&self, config: &SessionConfig) -> Result<Self::Handle, Error>;
}
