//! Session pool with idle eviction and a waitable shutdown barrier.
//!
//! Sessions are created lazily per distinct configuration key, reference
//! counted by in-flight request count, and evicted after sitting idle past a
//! threshold. The lookup-or-create and the task-count increment happen in the
//! same critical section, so the eviction timer can never invalidate a
//! session a caller is about to use.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::RuntimeHandle;
use crate::config::{PoolConfig, SessionConfig, SessionKey};
use crate::error::Error;
use crate::transport::{TransportAdapter, TransportHandle};

struct Slot<T: TransportAdapter> {
    handle: Arc<T::Handle>,
    active: usize,
    /// Set if and only if `active == 0`; always updated together with it.
    idle_since: Option<Instant>,
}

struct PoolState<T: TransportAdapter> {
    sessions: HashMap<SessionKey, Slot<T>>,
    /// Sessions whose close sequence has begun but not yet confirmed.
    draining: usize,
    is_shutdown: bool,
}

struct PoolInner<T: TransportAdapter> {
    adapter: T,
    config: PoolConfig,
    runtime: RuntimeHandle,
    state: Mutex<PoolState<T>>,
    /// Signalled whenever the active map or draining count shrinks.
    barrier: Notify,
    /// Stops the idle eviction timer.
    shutdown: CancellationToken,
}

/// A registry of pooled transport sessions, keyed by configuration.
pub struct Pool<T: TransportAdapter> {
    inner: Arc<PoolInner<T>>,
}

impl<T: TransportAdapter> Clone for Pool<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: TransportAdapter> Pool<T> {
    /// Creates a pool and starts its idle eviction timer.
    pub fn new(adapter: T, config: PoolConfig, runtime: RuntimeHandle) -> Self {
        config.assert_watermarks();
        let inner = Arc::new(PoolInner {
            adapter,
            config,
            runtime: runtime.clone(),
            state: Mutex::new(PoolState {
                sessions: HashMap::new(),
                draining: 0,
                is_shutdown: false,
            }),
            barrier: Notify::new(),
            shutdown: CancellationToken::new(),
        });

        // Fire at 80% of the idle timeout so eviction reliably happens
        // before the full timeout elapses.
        let period = inner.config.idle_timeout.mul_f64(0.8);
        let weak = Arc::downgrade(&inner);
        let shutdown = inner.shutdown.clone();
        runtime.spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(period) => {}
                }
                let Some(inner) = weak.upgrade() else { break };
                inner.evict_idle(period);
            }
            trace!("idle eviction timer stopped");
        });

        Self { inner }
    }

    /// The pool-wide configuration.
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Resolves (or lazily creates) the session for `config` and reserves it
    /// for one task.
    ///
    /// # Panics
    ///
    /// Panics if the pool has been shut down: requesting a session after the
    /// pool's scope ended is a programming error.
    pub fn checkout(&self, config: &SessionConfig) -> Result<SessionLease<T>, Error> {
        let key = config.key();
        let mut state = self.inner.state.lock().unwrap();
        assert!(
            !state.is_shutdown,
            "connection pool used after it was shut down"
        );

        if !state.sessions.contains_key(&key) {
            debug!(?key, "creating session");
            let handle = Arc::new(self.inner.adapter.open(config)?);
            state.sessions.insert(
                key.clone(),
                Slot {
                    handle,
                    active: 0,
                    idle_since: None,
                },
            );
        }
        let slot = state.sessions.get_mut(&key).expect("session just resolved");
        // Reserve before releasing the lock; the eviction timer never sees
        // this session idle while the caller holds the lease.
        slot.active += 1;
        slot.idle_since = None;
        let handle = slot.handle.clone();

        Ok(SessionLease {
            pool: self.inner.clone(),
            key,
            handle,
            released: false,
        })
    }

    /// Number of sessions currently in the active map.
    pub fn session_count(&self) -> usize {
        self.inner.state.lock().unwrap().sessions.len()
    }

    /// Shuts the pool down: no new sessions may be created, every current
    /// session is invalidated, and the call resolves once each has confirmed
    /// terminal closure.
    pub async fn drain_and_close(&self) {
        let handles: Vec<Arc<T::Handle>> = {
            let mut state = self.inner.state.lock().unwrap();
            if state.is_shutdown {
                Vec::new()
            } else {
                state.is_shutdown = true;
                let drained: Vec<_> = state
                    .sessions
                    .drain()
                    .map(|(_, slot)| slot.handle)
                    .collect();
                state.draining += drained.len();
                drained
            }
        };
        self.inner.shutdown.cancel();
        debug!(sessions = handles.len(), "draining pool");

        for handle in handles {
            handle.close().await;
            self.inner.confirm_closed();
        }

        // Eviction-initiated closures may still be in flight; wait for the
        // counted set to empty out as well.
        loop {
            let notified = self.inner.barrier.notified();
            {
                let state = self.inner.state.lock().unwrap();
                if state.sessions.is_empty() && state.draining == 0 {
                    break;
                }
            }
            notified.await;
        }
        debug!("pool shut down");
    }
}

impl<T: TransportAdapter> PoolInner<T> {
    /// Evicts every session idle for longer than `threshold`.
    fn evict_idle(self: &Arc<Self>, threshold: Duration) {
        let now = Instant::now();
        let evicted: Vec<Arc<T::Handle>> = {
            let mut state = self.state.lock().unwrap();
            let expired: Vec<SessionKey> = state
                .sessions
                .iter()
                .filter(|(_, slot)| {
                    slot.active == 0
                        && slot
                            .idle_since
                            .is_some_and(|since| now.duration_since(since) >= threshold)
                })
                .map(|(key, _)| key.clone())
                .collect();
            let handles = expired
                .iter()
                .map(|key| {
                    debug!(?key, "evicting idle session");
                    state.sessions.remove(key).expect("expired key present").handle
                })
                .collect::<Vec<_>>();
            state.draining += handles.len();
            handles
        };

        for handle in evicted {
            let inner = self.clone();
            self.runtime.spawn(async move {
                handle.close().await;
                inner.confirm_closed();
            });
        }
    }

    fn confirm_closed(&self) {
        let mut state = self.state.lock().unwrap();
        state.draining -= 1;
        drop(state);
        self.barrier.notify_waiters();
    }

    fn release(&self, key: &SessionKey) {
        let mut state = self.state.lock().unwrap();
        if let Some(slot) = state.sessions.get_mut(key) {
            slot.active -= 1;
            if slot.active == 0 {
                slot.idle_since = Some(Instant::now());
            }
        }
        // A session drained at shutdown is no longer in the map; its handle
        // stays alive until the last lease drops, nothing to record.
    }
}

/// A reservation of one pooled session for one in-flight request.
///
/// Dropping the lease releases the reservation; when the count reaches zero
/// the session's idle clock starts.
pub struct SessionLease<T: TransportAdapter> {
    pool: Arc<PoolInner<T>>,
    key: SessionKey,
    handle: Arc<T::Handle>,
    released: bool,
}

impl<T: TransportAdapter> SessionLease<T> {
    /// The native transport handle backing this session.
    pub fn handle(&self) -> &T::Handle {
        &self.handle
    }

    /// True when two leases are backed by the same pooled session.
    pub fn shares_session_with(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.handle, &other.handle)
    }

    /// Releases the reservation explicitly.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if !self.released {
            self.released = true;
            self.pool.release(&self.key);
        }
    }
}

impl<T: TransportAdapter> Drop for SessionLease<T> {
    fn drop(&mut self) {
        self.release_inner();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TokioTestRuntime;
    use crate::config::TlsVersion;
    use crate::events::EventSink;
    use crate::response::ResponseSink;
    use crate::transport::TaskRequest;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct StubAdapter {
        opened: Arc<AtomicUsize>,
    }

    struct StubHandle {
        closed: Arc<AtomicUsize>,
    }

    impl TransportHandle for StubHandle {
        fn start(
            &self,
            _request: TaskRequest,
            _sink: ResponseSink,
            _events: EventSink,
        ) -> Result<(), Error> {
            unimplemented!("pool tests never start tasks")
        }

        async fn close(&self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl TransportAdapter for StubAdapter {
        type Handle = StubHandle;

        fn open(&self, _config: &SessionConfig) -> Result<Self::Handle, Error> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            Ok(StubHandle {
                closed: Arc::new(AtomicUsize::new(0)),
            })
        }
    }

    fn pool() -> Pool<StubAdapter> {
        Pool::new(
            StubAdapter::default(),
            PoolConfig::default(),
            RuntimeHandle::new(TokioTestRuntime),
        )
    }

    #[tokio::test]
    async fn identical_configs_share_a_session() {
        let pool = pool();
        let a = pool.checkout(&SessionConfig::default()).unwrap();
        let b = pool.checkout(&SessionConfig::default()).unwrap();
        assert!(a.shares_session_with(&b));
        assert_eq!(pool.session_count(), 1);
    }

    #[tokio::test]
    async fn differing_tls_bounds_get_distinct_sessions() {
        let pool = pool();
        let a = pool.checkout(&SessionConfig::default()).unwrap();
        let strict = SessionConfig {
            tls_min: TlsVersion::Tls13,
            ..SessionConfig::default()
        };
        let b = pool.checkout(&strict).unwrap();
        assert!(!a.shares_session_with(&b));
        assert_eq!(pool.session_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_session_is_evicted_after_threshold() {
        let pool = pool();
        let lease = pool.checkout(&SessionConfig::default()).unwrap();
        drop(lease);
        assert_eq!(pool.session_count(), 1);

        // One timer period at 80% of the idle timeout is enough.
        tokio::time::sleep(pool.config().idle_timeout).await;
        tokio::task::yield_now().await;
        assert_eq!(pool.session_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn active_session_is_never_evicted() {
        let pool = pool();
        let _lease = pool.checkout(&SessionConfig::default()).unwrap();

        tokio::time::sleep(pool.config().idle_timeout * 10).await;
        tokio::task::yield_now().await;
        assert_eq!(pool.session_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn releasing_last_lease_starts_the_idle_clock() {
        let pool = pool();
        let a = pool.checkout(&SessionConfig::default()).unwrap();
        let b = pool.checkout(&SessionConfig::default()).unwrap();
        drop(a);

        // Still reserved by `b`: survives well past the threshold.
        tokio::time::sleep(pool.config().idle_timeout * 2).await;
        tokio::task::yield_now().await;
        assert_eq!(pool.session_count(), 1);

        drop(b);
        tokio::time::sleep(pool.config().idle_timeout * 2).await;
        tokio::task::yield_now().await;
        assert_eq!(pool.session_count(), 0);
    }

    #[tokio::test]
    async fn drain_and_close_waits_for_every_session() {
        let pool = pool();
        let _ = pool.checkout(&SessionConfig::default()).unwrap();
        let strict = SessionConfig {
            tls_min: TlsVersion::Tls13,
            ..SessionConfig::default()
        };
        let _ = pool.checkout(&strict).unwrap();
        assert_eq!(pool.session_count(), 2);

        pool.drain_and_close().await;
        assert_eq!(pool.session_count(), 0);
    }

    #[tokio::test]
    #[should_panic(expected = "used after it was shut down")]
    async fn checkout_after_shutdown_panics() {
        let pool = pool();
        pool.drain_and_close().await;
        let _ = pool.checkout(&SessionConfig::default());
    }
}
