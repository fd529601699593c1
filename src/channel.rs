//! Bounded single-producer/single-consumer byte channel.
//!
//! This is the unit of backpressure for both the read and write bridges. The
//! producer parks once the buffered length reaches the high watermark and is
//! woken when the consumer drains below the low watermark; every wakeup
//! re-checks the actual space condition, so spurious wakes are harmless.
//!
//! Closing from the consumer side makes any parked or future `write` fail
//! with a cancellation-class error instead of blocking forever.

use std::future::poll_fn;
use std::sync::{Arc, Mutex};
use std::task::{Poll, Waker};

use bytes::{Bytes, BytesMut};

use crate::error::{Error, TransportError};

struct ChannelState {
    buf: BytesMut,
    low: usize,
    high: usize,
    /// Consumer side is gone; producer writes must fail.
    read_closed: bool,
    /// Producer side is done; consumer drains and then sees end-of-stream.
    write_closed: bool,
    /// Producer side terminated abnormally, remaining bytes are garbage.
    aborted: bool,
    read_waker: Option<Waker>,
    write_waker: Option<Waker>,
}

impl ChannelState {
    fn wake_reader(&mut self) {
        if let Some(waker) = self.read_waker.take() {
            waker.wake();
        }
    }

    fn wake_writer(&mut self) {
        if let Some(waker) = self.write_waker.take() {
            waker.wake();
        }
    }
}

/// Creates a bounded byte channel with the given watermarks.
///
/// # Panics
///
/// Panics unless `low < high`.
pub fn channel(low: usize, high: usize) -> (ByteChanSender, ByteChanReceiver) {
    assert!(low < high, "low watermark must be below high watermark");
    let shared = Arc::new(Mutex::new(ChannelState {
        buf: BytesMut::new(),
        low,
        high,
        read_closed: false,
        write_closed: false,
        aborted: false,
        read_waker: None,
        write_waker: None,
    }));
    (
        ByteChanSender {
            shared: shared.clone(),
        },
        ByteChanReceiver { shared },
    )
}

/// Producer half of a bounded byte channel.
pub struct ByteChanSender {
    shared: Arc<Mutex<ChannelState>>,
}

impl ByteChanSender {
    /// Writes all of `bytes`, parking whenever the buffer is at or above the
    /// high watermark.
    ///
    /// Partial progress is made in steps of `min(remaining_capacity, input)`.
    /// Fails with [`Error::Cancelled`] once the receiver has closed.
    pub async fn write(&mut self, mut bytes: &[u8]) -> Result<(), Error> {
        while !bytes.is_empty() {
            let written = poll_fn(|cx| {
                let mut state = self.shared.lock().unwrap();
                if state.read_closed {
                    return Poll::Ready(Err(Error::Cancelled));
                }
                let space = state.high.saturating_sub(state.buf.len());
                if space == 0 {
                    state.write_waker = Some(cx.waker().clone());
                    return Poll::Pending;
                }
                let n = space.min(bytes.len());
                state.buf.extend_from_slice(&bytes[..n]);
                state.wake_reader();
                Poll::Ready(Ok(n))
            })
            .await?;
            bytes = &bytes[written..];
        }
        Ok(())
    }

    /// Marks the end of the stream. Buffered bytes remain readable.
    pub fn close(&mut self) {
        let mut state = self.shared.lock().unwrap();
        state.write_closed = true;
        state.wake_reader();
    }

    /// Terminates the stream abnormally: the consumer's next read fails
    /// instead of observing a truncated body as complete.
    pub fn abort(&mut self) {
        let mut state = self.shared.lock().unwrap();
        state.write_closed = true;
        state.aborted = true;
        state.wake_reader();
    }
}

impl Drop for ByteChanSender {
    fn drop(&mut self) {
        self.close();
    }
}

/// Consumer half of a bounded byte channel.
pub struct ByteChanReceiver {
    shared: Arc<Mutex<ChannelState>>,
}

impl ByteChanReceiver {
    /// Reads up to `max` buffered bytes (all of them if `None`), parking
    /// while the channel is empty and open.
    ///
    /// Returns `Ok(None)` at end-of-stream and an error if the producer
    /// aborted.
    pub async fn read(&mut self, max: Option<usize>) -> Result<Option<Bytes>, Error> {
        poll_fn(|cx| {
            let mut state = self.shared.lock().unwrap();
            if !state.buf.is_empty() {
                let n = max.unwrap_or(usize::MAX).min(state.buf.len());
                let out = state.buf.split_to(n).freeze();
                if state.buf.len() < state.low {
                    state.wake_writer();
                }
                return Poll::Ready(Ok(Some(out)));
            }
            if state.aborted {
                return Poll::Ready(Err(Error::Transport(TransportError::terminated(
                    std::io::Error::other("request body stream aborted"),
                ))));
            }
            if state.write_closed {
                return Poll::Ready(Ok(None));
            }
            state.read_waker = Some(cx.waker().clone());
            Poll::Pending
        })
        .await
    }

    /// Closes the consumer side; parked and future writes fail.
    pub fn close(&mut self) {
        let mut state = self.shared.lock().unwrap();
        state.read_closed = true;
        state.wake_writer();
    }
}

impl Drop for ByteChanReceiver {
    fn drop(&mut self) {
        self.close();
    }
}
