//! Scripted in-memory transport adapter for exercising the bridge.
//!
//! [`mock_transport`] returns an adapter to hand to a `weir` client and a
//! controller the test drives: each started task surfaces as a [`MockTask`]
//! whose methods push metadata, chunks, events, and completions exactly as a
//! native transport would.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::Bytes;
use http::{HeaderMap, StatusCode, Version};
use tokio::sync::{mpsc, oneshot};

use weir::body::BodySource;
use weir::error::{Error, TransportError};
use weir::events::{
    Challenge, ChallengeChoice, EventSink, RedirectChoice, RequestHead, ResponseHead,
};
use weir::response::{ChunkOutcome, ResponseSink};
use weir::transport::{TaskRequest, TransportAdapter, TransportHandle};
use weir::{AsyncRuntime, SessionConfig};

/// Spawns onto the ambient tokio runtime.
#[derive(Clone, Copy, Debug, Default)]
pub struct TokioRuntime;

impl AsyncRuntime for TokioRuntime {
    fn spawn<F>(&self, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        tokio::spawn(future);
    }
}

/// Creates a mock transport and the controller that scripts it.
pub fn mock_transport() -> (MockTransport, MockController) {
    let (tx, rx) = mpsc::unbounded_channel();
    let counters = Arc::new(Counters::default());
    (
        MockTransport {
            tasks: tx,
            counters: counters.clone(),
        },
        MockController { rx, counters },
    )
}

#[derive(Default)]
struct Counters {
    opened: AtomicUsize,
    closed: AtomicUsize,
}

/// Adapter half: hand this to the client.
#[derive(Clone)]
pub struct MockTransport {
    tasks: mpsc::UnboundedSender<MockTask>,
    counters: Arc<Counters>,
}

impl TransportAdapter for MockTransport {
    type Handle = MockHandle;

    fn open(&self, config: &SessionConfig) -> Result<Self::Handle, Error> {
        self.counters.opened.fetch_add(1, Ordering::SeqCst);
        Ok(MockHandle {
            config: config.clone(),
            tasks: self.tasks.clone(),
            counters: self.counters.clone(),
        })
    }
}

/// One pooled mock session handle.
pub struct MockHandle {
    config: SessionConfig,
    tasks: mpsc::UnboundedSender<MockTask>,
    counters: Arc<Counters>,
}

impl TransportHandle for MockHandle {
    fn start(
        &self,
        request: TaskRequest,
        sink: ResponseSink,
        events: EventSink,
    ) -> Result<(), Error> {
        self.tasks
            .send(MockTask {
                session: self.config.clone(),
                request,
                sink,
                events,
            })
            .map_err(|_| {
                Error::Transport(TransportError::connect(std::io::Error::other(
                    "mock controller dropped",
                )))
            })
    }

    async fn close(&self) {
        self.counters.closed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Controller half: receives every started task.
pub struct MockController {
    rx: mpsc::UnboundedReceiver<MockTask>,
    counters: Arc<Counters>,
}

impl MockController {
    /// Waits for the next task started through the adapter.
    pub async fn next_task(&mut self) -> MockTask {
        self.rx.recv().await.expect("mock transport dropped")
    }

    /// Number of native handles opened so far.
    pub fn opened(&self) -> usize {
        self.counters.opened.load(Ordering::SeqCst)
    }

    /// Number of handles that confirmed closure.
    pub fn closed(&self) -> usize {
        self.counters.closed.load(Ordering::SeqCst)
    }
}

/// One started transport task, ready to be scripted.
pub struct MockTask {
    /// Configuration of the session the task was started on.
    pub session: SessionConfig,
    /// The request as handed to the adapter.
    pub request: TaskRequest,
    /// Push side of the read bridge.
    pub sink: ResponseSink,
    /// Out-of-band event pipeline.
    pub events: EventSink,
}

impl MockTask {
    /// Builds plain response metadata.
    pub fn head(status: u16) -> ResponseHead {
        ResponseHead {
            status: StatusCode::from_u16(status).expect("valid status"),
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
        }
    }

    /// Delivers response metadata.
    pub fn respond(&self, status: u16) {
        self.sink.headers(Self::head(status)).expect("single head");
    }

    /// Delivers one body chunk, returning the bridge's directive.
    pub fn chunk(&self, bytes: impl Into<Bytes>) -> ChunkOutcome {
        self.sink.body_chunk(bytes.into())
    }

    /// Waits until delivery is resumed after a pause directive.
    pub async fn resumed(&self) {
        self.sink.resumed().await
    }

    /// Completes the response without trailers.
    pub fn finish(&self) {
        self.sink.finish(Ok(None));
    }

    /// Completes the response with trailers.
    pub fn finish_with_trailers(&self, trailers: HeaderMap) {
        self.sink.finish(Ok(Some(trailers)));
    }

    /// Fails the task.
    pub fn fail(&self, error: Error) {
        self.sink.fail(error);
    }

    /// Proposes a redirect and returns the decision receiver.
    pub fn propose_redirect(
        &self,
        response: ResponseHead,
        proposed: RequestHead,
    ) -> oneshot::Receiver<RedirectChoice> {
        self.events.redirect(response, proposed)
    }

    /// Raises a credential challenge and returns the decision receiver.
    pub fn raise_challenge(&self, challenge: Challenge) -> oneshot::Receiver<ChallengeChoice> {
        self.events.challenge(challenge)
    }

    /// Pulls the complete request body by draining a fresh producer run.
    pub async fn collect_body(&self, offset: u64) -> Result<Vec<u8>, Error> {
        let source = self.request.body.as_ref().expect("request has a body");
        let mut rx = source.stream(offset);
        let mut collected = Vec::new();
        while let Some(chunk) = rx.read(None).await? {
            collected.extend_from_slice(&chunk);
        }
        Ok(collected)
    }

    /// The request's body source, if any.
    pub fn body(&self) -> Option<&BodySource> {
        self.request.body.as_ref()
    }
}
