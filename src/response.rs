//! Read-side bridge: the response state machine.
//!
//! Reconciles three event sources into one coherent pull-based reader:
//!
//! - the transport's push deliveries (metadata, body chunks, completion)
//! - the caller's pull calls ([`BodyReader::read`])
//! - cancellation of the logical request
//!
//! Both sides run under a single mutex per request. The transport is paused
//! once buffered bytes reach the high watermark and resumed when the caller
//! drains below the low watermark, so unconsumed bytes stay bounded by the
//! high watermark plus one in-flight chunk.

use std::collections::VecDeque;
use std::future::poll_fn;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

use bytes::{Bytes, BytesMut};
use http::HeaderMap;
use tokio::sync::{Notify, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::{Error, TransportError};
use crate::events::{EventSink, ResponseHead};

/// Directive returned to the transport after each chunk delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum ChunkOutcome {
    /// Keep delivering.
    Continue,
    /// Stop delivering until [`ResponseSink::resumed`] resolves.
    Pause,
    /// The request is finished or cancelled; abandon delivery.
    Stop,
}

enum Machine {
    /// No response metadata yet.
    AwaitingResponse,
    /// Metadata delivered; body bytes buffer here until consumed.
    Consuming(Consuming),
}

#[derive(Default)]
struct Consuming {
    chunks: VecDeque<Bytes>,
    buffered: usize,
    complete: bool,
    error: Option<Error>,
    trailers: Option<HeaderMap>,
    paused: bool,
}

struct StateInner {
    machine: Machine,
    /// At most one parked reader per request.
    parked: Option<Waker>,
}

struct Shared {
    state: Mutex<StateInner>,
    resume: Notify,
    cancel: CancellationToken,
    low: usize,
    high: usize,
}

impl Shared {
    fn wake_parked(state: &mut StateInner) {
        if let Some(waker) = state.parked.take() {
            waker.wake();
        }
    }

    /// Marks the request terminal, recording the error and trailers.
    ///
    /// Returns the error recorded when the request ends before metadata was
    /// delivered, so the caller can publish it on the event pipeline.
    fn finish(&self, result: Result<Option<HeaderMap>, Error>) -> Option<Error> {
        let mut state = self.state.lock().unwrap();
        let publish = match &mut state.machine {
            Machine::AwaitingResponse => {
                // Completion without metadata: either the transport failed
                // before headers, or it violated the delivery order.
                let error = match result {
                    Err(err) => err,
                    Ok(_) => Error::Transport(TransportError::Protocol(
                        "transport completed without delivering response metadata",
                    )),
                };
                state.machine = Machine::Consuming(Consuming {
                    complete: true,
                    error: Some(error.clone()),
                    ..Consuming::default()
                });
                Some(error)
            }
            Machine::Consuming(consuming) => {
                if !consuming.complete {
                    consuming.complete = true;
                    match result {
                        Ok(trailers) => consuming.trailers = trailers,
                        Err(err) => consuming.error = Some(err),
                    }
                }
                None
            }
        };
        Self::wake_parked(&mut state);
        publish
    }

    fn poll_read(&self, cx: &mut Context<'_>, max: Option<usize>) -> Poll<Result<Bytes, Error>> {
        let mut state = self.state.lock().unwrap();
        // The reader is only handed out once metadata has arrived, but a
        // poll racing that hand-off simply parks.
        if matches!(state.machine, Machine::AwaitingResponse) {
            return Self::park(&mut state, cx);
        }

        let mut resume = false;
        let ready = {
            let consuming = match &mut state.machine {
                Machine::Consuming(consuming) => consuming,
                Machine::AwaitingResponse => unreachable!(),
            };
            if let Some(mut chunk) = consuming.chunks.pop_front() {
                if let Some(max) = max {
                    if chunk.len() > max {
                        let rest = chunk.split_off(max);
                        consuming.chunks.push_front(rest);
                    }
                }
                consuming.buffered -= chunk.len();
                if consuming.paused && consuming.buffered < self.low {
                    consuming.paused = false;
                    resume = true;
                    trace!(buffered = consuming.buffered, "resuming chunk delivery");
                }
                Some(Ok(chunk))
            } else if consuming.complete {
                match &consuming.error {
                    Some(err) => Some(Err(err.clone())),
                    // Terminal empty span; repeated reads keep returning it.
                    None => Some(Ok(Bytes::new())),
                }
            } else {
                None
            }
        };

        if resume {
            self.resume.notify_one();
        }
        match ready {
            Some(out) => {
                state.parked = None;
                Poll::Ready(out)
            }
            None => Self::park(&mut state, cx),
        }
    }

    fn park(state: &mut StateInner, cx: &mut Context<'_>) -> Poll<Result<Bytes, Error>> {
        if let Some(existing) = &state.parked {
            // A second reader parked from a different task is a caller bug;
            // queueing it silently would reorder the stream.
            assert!(
                existing.will_wake(cx.waker()),
                "concurrent read on a response body: at most one pending read is permitted",
            );
        }
        state.parked = Some(cx.waker().clone());
        Poll::Pending
    }

    fn trailers(&self) -> Option<HeaderMap> {
        match &self.state.lock().unwrap().machine {
            Machine::Consuming(consuming) => consuming.trailers.clone(),
            Machine::AwaitingResponse => None,
        }
    }
}

/// Creates the read bridge for one request.
///
/// Returns the push-facing sink for the transport adapter, the pull-facing
/// reader for the caller, and the completion slot the request driver fills
/// once late events are drained and every body-producer run has been joined.
pub(crate) fn bridge(
    events: EventSink,
    cancel: CancellationToken,
    low: usize,
    high: usize,
) -> (ResponseSink, BodyReader, oneshot::Sender<Result<(), Error>>) {
    let shared = Arc::new(Shared {
        state: Mutex::new(StateInner {
            machine: Machine::AwaitingResponse,
            parked: None,
        }),
        resume: Notify::new(),
        cancel: cancel.clone(),
        low,
        high,
    });
    let (done_tx, done_rx) = oneshot::channel();
    (
        ResponseSink {
            shared: shared.clone(),
            events,
        },
        BodyReader {
            shared,
            completion: Some(done_rx),
        },
        done_tx,
    )
}

/// Push-facing half handed to the transport adapter.
///
/// All methods may be called from the adapter's own tasks; they synchronize
/// with the caller's pull side internally.
#[derive(Clone)]
pub struct ResponseSink {
    shared: Arc<Shared>,
    events: EventSink,
}

impl ResponseSink {
    /// Delivers response metadata, publishing it on the event pipeline.
    ///
    /// Fails if metadata was already delivered — the transport must not
    /// deliver a second head — in which case the request is failed and the
    /// adapter should abandon the task.
    pub fn headers(&self, head: ResponseHead) -> Result<(), Error> {
        {
            let mut state = self.shared.state.lock().unwrap();
            match &state.machine {
                Machine::AwaitingResponse => {
                    debug!(status = %head.status, "response metadata arrived");
                    state.machine = Machine::Consuming(Consuming::default());
                    Shared::wake_parked(&mut state);
                }
                Machine::Consuming(_) => {
                    drop(state);
                    let err = Error::Transport(TransportError::Protocol(
                        "response metadata delivered twice",
                    ));
                    self.fail(err.clone());
                    return Err(err);
                }
            }
        }
        self.events.response(head);
        Ok(())
    }

    /// Delivers one body chunk.
    ///
    /// A chunk arriving before metadata is an out-of-order delivery: the
    /// request is failed and [`ChunkOutcome::Stop`] is returned.
    pub fn body_chunk(&self, chunk: Bytes) -> ChunkOutcome {
        let mut state = self.shared.state.lock().unwrap();
        let consuming = match &mut state.machine {
            Machine::AwaitingResponse => {
                drop(state);
                self.fail(Error::Transport(TransportError::Protocol(
                    "body data delivered before response metadata",
                )));
                return ChunkOutcome::Stop;
            }
            Machine::Consuming(consuming) => consuming,
        };
        if consuming.complete || self.shared.cancel.is_cancelled() {
            return ChunkOutcome::Stop;
        }

        consuming.buffered += chunk.len();
        consuming.chunks.push_back(chunk);
        // Fast path: a parked reader takes the chunk immediately.
        Shared::wake_parked(&mut state);

        let consuming = match &mut state.machine {
            Machine::Consuming(consuming) => consuming,
            Machine::AwaitingResponse => unreachable!(),
        };
        if consuming.buffered >= self.shared.high && !consuming.paused {
            consuming.paused = true;
            trace!(buffered = consuming.buffered, "pausing chunk delivery");
            ChunkOutcome::Pause
        } else {
            ChunkOutcome::Continue
        }
    }

    /// Resolves once the consumer has drained below the low watermark after
    /// a [`ChunkOutcome::Pause`].
    pub async fn resumed(&self) {
        self.shared.resume.notified().await;
    }

    /// Marks delivery complete, optionally with trailers or a terminal error.
    pub fn finish(&self, result: Result<Option<HeaderMap>, Error>) {
        // A request ending before metadata must surface on the event
        // pipeline too, or the caller would wait for a response that never
        // comes.
        if let Some(err) = self.shared.finish(result) {
            self.events.failed(err);
        }
    }

    /// Fails the request with a terminal error.
    pub fn fail(&self, error: Error) {
        self.finish(Err(error));
    }
}

/// Pull-facing half of the bridge: the caller's response body reader.
///
/// The exclusive receiver on [`read`](BodyReader::read) rules out concurrent
/// reads at compile time; the internal assertion guards the same invariant
/// against misuse through raw polling.
pub struct BodyReader {
    shared: Arc<Shared>,
    completion: Option<oneshot::Receiver<Result<(), Error>>>,
}

impl BodyReader {
    /// Reads up to `max` body bytes (an arbitrary amount if `None`).
    ///
    /// An empty [`Bytes`] signals end-of-stream and keeps being returned on
    /// subsequent calls. Cancellation takes priority over buffered data and
    /// recorded errors once it has been requested.
    pub async fn read(&mut self, max: Option<usize>) -> Result<Bytes, Error> {
        // A zero cap would yield an empty span indistinguishable from the
        // end-of-stream marker; always hand out at least one byte.
        let max = max.map(|max| max.max(1));
        let shared = self.shared.clone();
        tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => Err(Error::Cancelled),
            out = poll_fn(|cx| shared.poll_read(cx, max)) => out,
        }
    }

    /// Collects body bytes until end-of-stream or `limit` bytes, whichever
    /// comes first.
    pub async fn collect(&mut self, limit: usize) -> Result<Bytes, Error> {
        let mut out = BytesMut::new();
        while out.len() < limit {
            let chunk = self.read(Some(limit - out.len())).await?;
            if chunk.is_empty() {
                break;
            }
            out.extend_from_slice(&chunk);
        }
        Ok(out.freeze())
    }

    /// Concludes the stream: drains any unread body bytes, waits for the
    /// request to fully complete (late events answered, every body-producer
    /// run joined), and yields the trailing metadata.
    pub async fn finish(mut self) -> Result<Option<HeaderMap>, Error> {
        let mut drain_error = None;
        loop {
            match self.read(None).await {
                Ok(chunk) if chunk.is_empty() => break,
                Ok(_) => continue,
                Err(err) => {
                    drain_error = Some(err);
                    break;
                }
            }
        }

        let completion = self.completion.take().expect("finish consumes the reader");
        let body_outcome = tokio::select! {
            biased;
            _ = self.shared.cancel.cancelled() => return Err(Error::Cancelled),
            outcome = completion => outcome.unwrap_or(Ok(())),
        };

        if self.shared.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        // "My code failed" outranks the transport's echo of the same
        // failure; the write bridge already suppressed the converse case.
        if let Err(err @ Error::BodyProducer(_)) = body_outcome {
            return Err(err);
        }
        if let Some(err) = drain_error {
            return Err(err);
        }
        body_outcome?;
        Ok(self.shared.trailers())
    }
}

impl Drop for BodyReader {
    fn drop(&mut self) {
        // An abandoned reader would leave the transport parked and the
        // session leased forever; cancelling the request tears both down.
        // `finish` takes the completion slot, so a concluded request is
        // left alone.
        if self.completion.is_some() {
            self.shared.cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{TransportEvent, pipeline};
    use http::{StatusCode, Version};
    use std::sync::Arc;
    use std::task::Wake;

    fn head() -> ResponseHead {
        ResponseHead {
            status: StatusCode::OK,
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
        }
    }

    fn parts() -> (ResponseSink, BodyReader, oneshot::Sender<Result<(), Error>>) {
        let (events, _stream) = pipeline();
        bridge(events, CancellationToken::new(), 8, 16)
    }

    struct CountingWake;
    impl Wake for CountingWake {
        fn wake(self: Arc<Self>) {}
    }

    #[tokio::test]
    async fn metadata_precedes_body_and_eof_is_idempotent() {
        let (sink, mut reader, _done) = parts();
        sink.headers(head()).unwrap();
        assert_eq!(sink.body_chunk(Bytes::from_static(b"abc")), ChunkOutcome::Continue);
        sink.finish(Ok(None));

        assert_eq!(reader.read(None).await.unwrap(), &b"abc"[..]);
        assert!(reader.read(None).await.unwrap().is_empty());
        // The terminal empty span keeps being returned.
        assert!(reader.read(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn chunk_before_metadata_is_a_protocol_error() {
        let (events, mut stream) = pipeline();
        let (sink, mut reader, _done) =
            bridge(events, CancellationToken::new(), 8, 16);

        assert_eq!(sink.body_chunk(Bytes::from_static(b"early")), ChunkOutcome::Stop);
        assert!(matches!(
            reader.read(None).await,
            Err(Error::Transport(TransportError::Protocol(_)))
        ));
        // The failure is visible on the event pipeline for phase-one consumers.
        assert!(matches!(stream.recv().await, Some(TransportEvent::Failed(_))));
    }

    #[tokio::test]
    async fn duplicate_metadata_is_a_protocol_error() {
        let (sink, _reader, _done) = parts();
        sink.headers(head()).unwrap();
        assert!(sink.headers(head()).is_err());
    }

    #[tokio::test]
    async fn delivery_pauses_at_high_watermark_and_resumes_after_drain() {
        let (sink, mut reader, _done) = parts();
        sink.headers(head()).unwrap();

        assert_eq!(sink.body_chunk(Bytes::from(vec![0u8; 10])), ChunkOutcome::Continue);
        // Crossing the high watermark of 16 pauses delivery.
        assert_eq!(sink.body_chunk(Bytes::from(vec![0u8; 10])), ChunkOutcome::Pause);

        let resumed = tokio::spawn({
            let sink = sink.clone();
            async move { sink.resumed().await }
        });

        // Draining below the low watermark of 8 resumes the producer.
        let mut drained = 0;
        while drained < 14 {
            drained += reader.read(Some(7)).await.unwrap().len();
        }
        resumed.await.unwrap();
    }

    #[tokio::test]
    async fn parked_reader_takes_chunk_on_arrival() {
        let (sink, mut reader, _done) = parts();
        sink.headers(head()).unwrap();

        let deliver = tokio::spawn({
            let sink = sink.clone();
            async move {
                tokio::task::yield_now().await;
                let _ = sink.body_chunk(Bytes::from_static(b"late"));
            }
        });
        assert_eq!(reader.read(None).await.unwrap(), &b"late"[..]);
        deliver.await.unwrap();
    }

    #[tokio::test]
    async fn cancellation_unblocks_parked_reader() {
        let cancel = CancellationToken::new();
        let (events, _stream) = pipeline();
        let (sink, mut reader, _done) = bridge(events, cancel.clone(), 8, 16);
        sink.headers(head()).unwrap();

        let canceller = tokio::spawn(async move {
            tokio::task::yield_now().await;
            cancel.cancel();
        });
        // No completion callback ever arrives; the reader must not hang.
        assert!(matches!(reader.read(None).await, Err(Error::Cancelled)));
        canceller.await.unwrap();
    }

    #[tokio::test]
    async fn cancellation_outranks_recorded_errors() {
        let cancel = CancellationToken::new();
        let (events, _stream) = pipeline();
        let (sink, mut reader, _done) = bridge(events, cancel.clone(), 8, 16);
        sink.headers(head()).unwrap();
        sink.fail(Error::Transport(TransportError::terminated(
            std::io::Error::other("reset"),
        )));
        cancel.cancel();
        assert!(matches!(reader.read(None).await, Err(Error::Cancelled)));
    }

    #[test]
    fn second_parked_reader_panics() {
        let (sink, reader, _done) = parts();
        sink.headers(head()).unwrap();
        drop(sink);

        let waker_a = Waker::from(Arc::new(CountingWake));
        let waker_b = Waker::from(Arc::new(CountingWake));
        let shared = reader.shared.clone();

        let mut cx_a = Context::from_waker(&waker_a);
        assert!(shared.poll_read(&mut cx_a, None).is_pending());

        let mut cx_b = Context::from_waker(&waker_b);
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _ = shared.poll_read(&mut cx_b, None);
        }));
        assert!(outcome.is_err());
    }

    #[tokio::test]
    async fn finish_yields_trailers_after_terminal_read() {
        let (sink, mut reader, done) = parts();
        sink.headers(head()).unwrap();
        let _ = sink.body_chunk(Bytes::from_static(b"tail"));
        let mut trailers = HeaderMap::new();
        trailers.insert("x-checksum", "ab12".parse().unwrap());
        sink.finish(Ok(Some(trailers)));
        done.send(Ok(())).unwrap();

        assert_eq!(reader.read(None).await.unwrap(), &b"tail"[..]);
        assert!(reader.read(None).await.unwrap().is_empty());
        let trailers = reader.finish().await.unwrap().unwrap();
        assert_eq!(trailers.get("x-checksum").unwrap(), "ab12");
    }

    #[tokio::test]
    async fn finish_surfaces_body_producer_failure() {
        let (sink, reader, done) = parts();
        sink.headers(head()).unwrap();
        sink.finish(Ok(None));
        done.send(Err(Error::body_producer(std::io::Error::other(
            "producer exploded",
        ))))
        .unwrap();

        assert!(matches!(reader.finish().await, Err(Error::BodyProducer(_))));
    }

    #[tokio::test]
    async fn completion_without_metadata_fails_the_request() {
        let (events, mut stream) = pipeline();
        let (sink, mut reader, _done) = bridge(events, CancellationToken::new(), 8, 16);
        sink.finish(Ok(None));
        // The failure reaches both halves: the event pipeline and the reader.
        match stream.recv().await {
            Some(TransportEvent::Failed(Error::Transport(TransportError::Protocol(_)))) => {}
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(matches!(
            reader.read(None).await,
            Err(Error::Transport(TransportError::Protocol(_)))
        ));
    }

    #[tokio::test]
    async fn zero_cap_read_still_yields_bytes() {
        let (sink, mut reader, _done) = parts();
        sink.headers(head()).unwrap();
        let _ = sink.body_chunk(Bytes::from_static(b"ab"));

        // A zero cap must not mimic the end-of-stream marker.
        let chunk = reader.read(Some(0)).await.unwrap();
        assert_eq!(chunk, &b"a"[..]);
        assert_eq!(reader.read(None).await.unwrap(), &b"b"[..]);
    }

    #[tokio::test]
    async fn dropping_the_reader_cancels_the_request() {
        let cancel = CancellationToken::new();
        let (events, _stream) = pipeline();
        let (sink, reader, _done) = bridge(events, cancel.clone(), 8, 16);
        sink.headers(head()).unwrap();

        drop(reader);
        assert!(cancel.is_cancelled());
        // Delivery after abandonment is refused.
        assert_eq!(sink.body_chunk(Bytes::from_static(b"x")), ChunkOutcome::Stop);
    }
}
