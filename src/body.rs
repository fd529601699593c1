//! Request body descriptors and the write-side bridge.
//!
//! A [`RequestBody`] describes how to (re)produce request bytes. The bridge
//! runs the producer on a background task and exposes the bytes to the
//! transport as the pull half of a bounded byte channel, so the producer is
//! throttled by the transport's consumption.
//!
//! Two failure channels stay distinct: the producer routine failing is a
//! [`Error::BodyProducer`], while a failed transport write marks the run so
//! the producer's own downstream error (usually a broken pipe echo) is not
//! double-reported.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::{Bytes, BytesMut};
use tokio::sync::oneshot;
use tracing::debug;

use crate::RuntimeHandle;
use crate::channel::{ByteChanReceiver, ByteChanSender, channel};
use crate::error::{BoxError, Error, TransportError};

/// Caller-appended elements are staged and flushed as one transport write.
const STAGING_CAPACITY: usize = 1024;

/// Boxed future returned by a body producer invocation.
pub type BodyFuture<'a> = Pin<Box<dyn Future<Output = Result<(), BoxError>> + Send + 'a>>;

/// A routine that produces request-body bytes through a [`BodyWriter`].
///
/// The routine may be invoked more than once: on redirects and retries the
/// transport re-requests the body. `offset` is the byte position to resume
/// from; restartable descriptors only ever see `0`.
pub trait ProduceBody: Send + Sync + 'static {
    fn produce<'a>(&'a self, offset: u64, writer: &'a mut BodyWriter) -> BodyFuture<'a>;
}

/// Describes how request-body bytes can be (re)produced.
#[derive(Clone)]
pub enum RequestBody {
    /// The producer can only replay from the start. Asking it to resume from
    /// a nonzero offset is a programming-contract violation.
    Restartable {
        producer: Arc<dyn ProduceBody>,
        length: Option<u64>,
    },
    /// The producer accepts an explicit start offset (0 on first use).
    Seekable {
        producer: Arc<dyn ProduceBody>,
        length: Option<u64>,
    },
}

impl fmt::Debug for RequestBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestBody::Restartable { length, .. } => {
                f.debug_struct("Restartable").field("length", length).finish()
            }
            RequestBody::Seekable { length, .. } => {
                f.debug_struct("Seekable").field("length", length).finish()
            }
        }
    }
}

struct BytesProducer(Bytes);

impl ProduceBody for BytesProducer {
    fn produce<'a>(&'a self, offset: u64, writer: &'a mut BodyWriter) -> BodyFuture<'a> {
        Box::pin(async move {
            let data = self.0.slice(offset as usize..);
            writer.write(&data).await?;
            Ok(())
        })
    }
}

impl RequestBody {
    /// A restartable body backed by an in-memory buffer, with known length.
    pub fn bytes(data: impl Into<Bytes>) -> Self {
        let data = data.into();
        let length = Some(data.len() as u64);
        RequestBody::Restartable {
            producer: Arc::new(BytesProducer(data)),
            length,
        }
    }

    /// A seekable body backed by an in-memory buffer, with known length.
    pub fn seekable_bytes(data: impl Into<Bytes>) -> Self {
        let data = data.into();
        let length = Some(data.len() as u64);
        RequestBody::Seekable {
            producer: Arc::new(BytesProducer(data)),
            length,
        }
    }

    /// A restartable body from a custom producer routine.
    pub fn restartable(producer: impl ProduceBody, length: Option<u64>) -> Self {
        RequestBody::Restartable {
            producer: Arc::new(producer),
            length,
        }
    }

    /// A seekable body from a custom producer routine.
    pub fn seekable(producer: impl ProduceBody, length: Option<u64>) -> Self {
        RequestBody::Seekable {
            producer: Arc::new(producer),
            length,
        }
    }

    /// The total body length, when known up front.
    pub fn length(&self) -> Option<u64> {
        match self {
            RequestBody::Restartable { length, .. } | RequestBody::Seekable { length, .. } => {
                *length
            }
        }
    }

    fn producer(&self) -> Arc<dyn ProduceBody> {
        match self {
            RequestBody::Restartable { producer, .. } | RequestBody::Seekable { producer, .. } => {
                producer.clone()
            }
        }
    }
}

/// Staged writer handed to body producer routines.
///
/// Appended bytes accumulate in a fixed-capacity staging buffer and are
/// flushed to the transport-facing channel once full; the bridge performs a
/// final flush when the routine completes.
pub struct BodyWriter {
    chan: ByteChanSender,
    staging: BytesMut,
    write_failed: Arc<AtomicBool>,
}

impl BodyWriter {
    fn new(chan: ByteChanSender, write_failed: Arc<AtomicBool>) -> Self {
        Self {
            chan,
            staging: BytesMut::with_capacity(STAGING_CAPACITY),
            write_failed,
        }
    }

    /// Appends bytes, flushing the staging buffer whenever it fills.
    pub async fn write(&mut self, mut bytes: &[u8]) -> Result<(), Error> {
        while !bytes.is_empty() {
            let room = STAGING_CAPACITY - self.staging.len();
            if room == 0 {
                self.flush().await?;
                continue;
            }
            let n = room.min(bytes.len());
            self.staging.extend_from_slice(&bytes[..n]);
            bytes = &bytes[n..];
        }
        Ok(())
    }

    /// Flushes staged bytes as one transport write.
    pub async fn flush(&mut self) -> Result<(), Error> {
        if self.staging.is_empty() {
            return Ok(());
        }
        let out = self.staging.split();
        if let Err(err) = self.chan.write(&out).await {
            self.write_failed.store(true, Ordering::SeqCst);
            return Err(err);
        }
        Ok(())
    }

    async fn finish(mut self) -> Result<(), Error> {
        self.flush().await?;
        // Closing with zero bytes written still signals a clean end of body;
        // an empty body must terminate on the wire rather than stall.
        self.chan.close();
        Ok(())
    }

    fn abort(mut self) {
        self.chan.abort();
    }
}

/// Completion handle for one background producer run.
///
/// The run is awaited, never cancelled-and-forgotten, so producer cleanup
/// executes before the request is reported complete.
pub struct BodyTaskHandle {
    rx: oneshot::Receiver<Result<(), Error>>,
}

impl BodyTaskHandle {
    /// Waits for the producer run to finish and returns its outcome.
    pub async fn join(self) -> Result<(), Error> {
        match self.rx.await {
            Ok(outcome) => outcome,
            // The task was torn down without reporting; treat as a failed
            // producer so the loss is visible.
            Err(_) => Err(Error::body_producer(std::io::Error::other(
                "request body task terminated without reporting",
            ))),
        }
    }
}

/// Adapter-facing body supply for one request.
///
/// Each [`stream`](BodySource::stream) call starts a fresh producer run —
/// the transport re-requests the body on redirects and resumable retries —
/// and registers its completion handle so the request driver can await every
/// run before declaring the request complete.
pub struct BodySource {
    body: RequestBody,
    runtime: RuntimeHandle,
    low: usize,
    high: usize,
    handles: Arc<Mutex<Vec<BodyTaskHandle>>>,
}

impl BodySource {
    pub(crate) fn new(body: RequestBody, runtime: RuntimeHandle, low: usize, high: usize) -> Self {
        Self {
            body,
            runtime,
            low,
            high,
            handles: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// The total body length, when known up front.
    pub fn length(&self) -> Option<u64> {
        self.body.length()
    }

    /// Starts a producer run from `offset` and returns the pull half the
    /// transport reads request bytes from.
    ///
    /// # Panics
    ///
    /// Panics if the descriptor is restartable and `offset` is nonzero;
    /// resuming a restartable body mid-stream is a caller bug, not a
    /// recoverable error.
    pub fn stream(&self, offset: u64) -> ByteChanReceiver {
        if matches!(self.body, RequestBody::Restartable { .. }) && offset != 0 {
            panic!("restartable request body cannot resume from offset {offset}");
        }
        debug!(offset, "starting request body producer run");

        let (tx, rx) = channel(self.low, self.high);
        let (done_tx, done_rx) = oneshot::channel();
        let producer = self.body.producer();
        let write_failed = Arc::new(AtomicBool::new(false));

        self.runtime.spawn(async move {
            let mut writer = BodyWriter::new(tx, write_failed.clone());
            let outcome = match producer.produce(offset, &mut writer).await {
                Ok(()) => writer.finish().await,
                Err(err) => {
                    writer.abort();
                    if write_failed.load(Ordering::SeqCst) {
                        // The producer error is a downstream symptom of the
                        // failed write; report the write failure instead.
                        Err(Error::Transport(TransportError::write(
                            std::io::Error::other("transport closed the request body stream"),
                        )))
                    } else {
                        Err(Error::body_producer(err))
                    }
                }
            };
            let _ = done_tx.send(outcome);
        });

        self.handles
            .lock()
            .unwrap()
            .push(BodyTaskHandle { rx: done_rx });
        rx
    }

    /// Takes the completion handles of every run started so far.
    #[cfg(test)]
    fn take_handles(&self) -> Vec<BodyTaskHandle> {
        std::mem::take(&mut self.handles.lock().unwrap())
    }

    /// A handle the request driver keeps for joining every producer run
    /// after the transport side has finished.
    pub(crate) fn completions(&self) -> BodyCompletions {
        BodyCompletions {
            handles: self.handles.clone(),
        }
    }
}

/// Joins every producer run of one request.
pub(crate) struct BodyCompletions {
    handles: Arc<Mutex<Vec<BodyTaskHandle>>>,
}

impl BodyCompletions {
    /// Empty set, for requests without a body.
    pub(crate) fn none() -> Self {
        Self {
            handles: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Awaits every registered run.
    ///
    /// A run the transport abandoned for a replay fails its write when the
    /// pull half drops; only the final run's transport outcome counts. A
    /// genuine producer failure surfaces from any run and wins over
    /// write-failure echoes, so the caller sees "my code failed" when that
    /// is what happened.
    pub(crate) async fn join_all(&self) -> Result<(), Error> {
        let handles = std::mem::take(&mut *self.handles.lock().unwrap());
        let count = handles.len();
        let mut first: Option<Error> = None;
        for (index, handle) in handles.into_iter().enumerate() {
            if let Err(err) = handle.join().await {
                let superseded = index + 1 < count;
                if superseded && !matches!(err, Error::BodyProducer(_)) {
                    continue;
                }
                if first.is_none() || matches!(err, Error::BodyProducer(_)) {
                    first = Some(err);
                }
            }
        }
        match first {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TokioTestRuntime;

    struct FailingProducer;

    impl ProduceBody for FailingProducer {
        fn produce<'a>(&'a self, _offset: u64, writer: &'a mut BodyWriter) -> BodyFuture<'a> {
            Box::pin(async move {
                writer.write(b"partial").await?;
                Err("disk vanished".into())
            })
        }
    }

    fn source(body: RequestBody) -> BodySource {
        BodySource::new(body, RuntimeHandle::new(TokioTestRuntime), 1024, 4096)
    }

    #[tokio::test]
    async fn bytes_body_streams_fully() {
        let src = source(RequestBody::bytes("Hello World"));
        let mut rx = src.stream(0);
        let mut collected = Vec::new();
        while let Some(chunk) = rx.read(None).await.unwrap() {
            collected.extend_from_slice(&chunk);
        }
        assert_eq!(collected, b"Hello World");
        for handle in src.take_handles() {
            handle.join().await.unwrap();
        }
    }

    #[tokio::test]
    async fn seekable_body_resumes_from_offset() {
        let src = source(RequestBody::seekable_bytes("Hello World"));
        let mut rx = src.stream(6);
        let chunk = rx.read(None).await.unwrap().unwrap();
        assert_eq!(&chunk[..], b"World");
    }

    #[tokio::test]
    #[should_panic(expected = "restartable request body cannot resume")]
    async fn restartable_body_rejects_nonzero_offset() {
        let src = source(RequestBody::bytes("Hello World"));
        let _ = src.stream(6);
    }

    #[tokio::test]
    async fn restartable_body_replays_from_start() {
        let src = source(RequestBody::bytes("abc"));
        for _ in 0..2 {
            let mut rx = src.stream(0);
            let chunk = rx.read(None).await.unwrap().unwrap();
            assert_eq!(&chunk[..], b"abc");
        }
        assert_eq!(src.take_handles().len(), 2);
    }

    #[tokio::test]
    async fn producer_error_is_reported_distinctly() {
        let src = source(RequestBody::restartable(FailingProducer, None));
        let mut rx = src.stream(0);
        // Drain what was produced before the failure.
        while let Ok(Some(_)) = rx.read(None).await {}
        let outcome = src.take_handles().pop().unwrap().join().await;
        assert!(matches!(outcome, Err(Error::BodyProducer(_))));
    }

    #[tokio::test]
    async fn producer_error_is_suppressed_after_write_failure() {
        struct SlowFail;
        impl ProduceBody for SlowFail {
            fn produce<'a>(&'a self, _offset: u64, writer: &'a mut BodyWriter) -> BodyFuture<'a> {
                Box::pin(async move {
                    // More than the channel can hold, so the write parks
                    // until the transport side closes underneath it.
                    writer.write(&[9u8; 16 * 1024]).await?;
                    Ok(())
                })
            }
        }

        let src = BodySource::new(
            RequestBody::restartable(SlowFail, None),
            RuntimeHandle::new(TokioTestRuntime),
            128,
            512,
        );
        let mut rx = src.stream(0);
        let _ = rx.read(Some(64)).await.unwrap();
        // Transport aborts its read side mid-body.
        rx.close();
        let outcome = src.take_handles().pop().unwrap().join().await;
        assert!(matches!(
            outcome,
            Err(Error::Transport(TransportError::Write(_)))
        ));
    }

    #[tokio::test]
    async fn abandoned_run_does_not_fail_a_completed_replay() {
        let src = BodySource::new(
            RequestBody::bytes(vec![6u8; 16 * 1024]),
            RuntimeHandle::new(TokioTestRuntime),
            128,
            512,
        );
        // First run: the transport reads a little, then drops the pull half
        // in favor of a full replay (a redirect does exactly this).
        let mut rx = src.stream(0);
        let _ = rx.read(Some(64)).await.unwrap();
        drop(rx);

        let mut rx = src.stream(0);
        let mut collected = 0;
        while let Some(chunk) = rx.read(None).await.unwrap() {
            collected += chunk.len();
        }
        assert_eq!(collected, 16 * 1024);

        // The abandoned run's write failure is not the request's failure.
        src.completions().join_all().await.unwrap();
    }

    #[tokio::test]
    async fn producer_failure_in_a_superseded_run_still_surfaces() {
        let src = source(RequestBody::restartable(FailingProducer, None));
        let mut rx = src.stream(0);
        while let Ok(Some(_)) = rx.read(None).await {}
        drop(rx);

        let mut rx = src.stream(0);
        while let Ok(Some(_)) = rx.read(None).await {}

        let outcome = src.completions().join_all().await;
        assert!(matches!(outcome, Err(Error::BodyProducer(_))));
    }
}
