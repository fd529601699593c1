//! Ordered pipeline of out-of-band transport events.
//!
//! The wrapped transport emits metadata-sized events (response received,
//! redirect proposed, credential challenge, terminal error) faster than the
//! caller may consume them, so the producer side is unbounded while the
//! single consumer drains in FIFO order.
//!
//! Redirect and challenge events carry a [`Decision`]: a one-shot resolution
//! whose `resolve` consumes the value, making a second resolution a
//! compile-time impossibility. Dropping an unresolved decision is the safe
//! default — the transport side observes the closed channel and treats it as
//! a rejection.

use http::{HeaderMap, Method, StatusCode, Uri, Version};
use tokio::sync::{mpsc, oneshot};

use crate::error::Error;

/// Response metadata as delivered by the transport, ahead of any body bytes.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status: StatusCode,
    pub version: Version,
    pub headers: HeaderMap,
}

/// Request metadata, used when the transport proposes a follow-up request.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
}

/// A credential challenge raised by the transport.
#[derive(Debug, Clone)]
pub struct Challenge {
    /// Authentication scheme (e.g. `Basic`, `Bearer`).
    pub scheme: String,
    /// Protection space, when the transport reports one.
    pub realm: Option<String>,
}

/// Caller's verdict on a proposed redirect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedirectChoice {
    /// Re-issue the proposed request, replaying the body from its start.
    Follow,
    /// Deliver the redirect response itself to the caller.
    Stop,
}

/// Caller's verdict on a credential challenge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeChoice {
    /// Continue without credentials and deliver whatever the server sent.
    Proceed,
    /// Abort the request.
    Cancel,
}

/// A resolution that must be provided exactly once.
///
/// `resolve` moves the value out, so the type system rules out double use.
#[derive(Debug)]
pub struct Decision<T> {
    tx: oneshot::Sender<T>,
}

impl<T> Decision<T> {
    pub(crate) fn new() -> (Self, oneshot::Receiver<T>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx }, rx)
    }

    /// Resolves the decision, unblocking the transport task.
    pub fn resolve(self, choice: T) {
        // The transport side may have given up waiting; that is its call.
        let _ = self.tx.send(choice);
    }
}

/// One entry in the pre-response event pipeline.
#[derive(Debug)]
pub enum TransportEvent {
    /// Response metadata arrived; body streaming follows.
    Response(ResponseHead),
    /// The transport proposes following a redirect.
    Redirect {
        response: ResponseHead,
        proposed: RequestHead,
        decision: Decision<RedirectChoice>,
    },
    /// The transport relays a credential challenge.
    Challenge {
        challenge: Challenge,
        decision: Decision<ChallengeChoice>,
    },
    /// The request failed before or during delivery.
    Failed(Error),
}

/// Creates the event pipeline for one request.
pub fn pipeline() -> (EventSink, EventStream) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventSink { tx }, EventStream { rx })
}

/// Producer side of the pipeline, held by the transport adapter.
///
/// Dropping the sink closes the pipeline and signals that no further events
/// will arrive for this request.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<TransportEvent>,
}

impl EventSink {
    /// Publishes response metadata.
    pub fn response(&self, head: ResponseHead) {
        let _ = self.tx.send(TransportEvent::Response(head));
    }

    /// Proposes a redirect and returns the receiver for the caller's verdict.
    ///
    /// A closed receiver means the consumer is gone or declined to answer;
    /// treat it as [`RedirectChoice::Stop`].
    pub fn redirect(
        &self,
        response: ResponseHead,
        proposed: RequestHead,
    ) -> oneshot::Receiver<RedirectChoice> {
        let (decision, rx) = Decision::new();
        let _ = self.tx.send(TransportEvent::Redirect {
            response,
            proposed,
            decision,
        });
        rx
    }

    /// Relays a challenge and returns the receiver for the caller's verdict.
    ///
    /// A closed receiver is equivalent to [`ChallengeChoice::Cancel`].
    pub fn challenge(&self, challenge: Challenge) -> oneshot::Receiver<ChallengeChoice> {
        let (decision, rx) = Decision::new();
        let _ = self.tx.send(TransportEvent::Challenge {
            challenge,
            decision,
        });
        rx
    }

    /// Reports a terminal failure.
    pub fn failed(&self, error: Error) {
        let _ = self.tx.send(TransportEvent::Failed(error));
    }
}

/// Consumer side of the pipeline, drained by the request driver.
pub struct EventStream {
    rx: mpsc::UnboundedReceiver<TransportEvent>,
}

impl EventStream {
    /// Receives the next event, or `None` once the sink is dropped.
    pub async fn recv(&mut self) -> Option<TransportEvent> {
        self.rx.recv().await
    }
}

/// Caller-supplied policy consulted for redirect and challenge events.
///
/// This is mechanism, not policy bookkeeping: the bridge never retries on its
/// own, it only routes each event to this handler exactly once, before the
/// response body is available. Events arriving after that point are answered
/// with the safe default instead.
pub trait EventPolicy: Send + Sync + 'static {
    /// Called when the transport proposes following a redirect.
    fn on_redirect(&self, response: &ResponseHead, proposed: &RequestHead) -> RedirectChoice {
        let _ = (response, proposed);
        RedirectChoice::Follow
    }

    /// Called when the transport relays a credential challenge.
    fn on_challenge(&self, challenge: &Challenge) -> ChallengeChoice {
        let _ = challenge;
        ChallengeChoice::Proceed
    }
}

/// Follows redirects and proceeds without credentials.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultPolicy;

impl EventPolicy for DefaultPolicy {}
