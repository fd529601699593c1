#![doc = include_str!("../README.md")]

pub use bytes;
pub use http;
pub use tokio_util::sync::CancellationToken;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use http::{Method, Uri, request::Builder as HttpBuilder};
use tracing::debug;

pub mod body;
pub mod channel;
pub mod config;
pub mod error;
pub mod events;
pub mod pool;
pub mod response;
pub mod transport;

pub use crate::body::{BodyWriter, ProduceBody, RequestBody};
pub use crate::config::{PoolConfig, PoolMode, SessionConfig, TlsVersion};
pub use crate::error::{BoxError, Error, TransportError};
pub use crate::events::{
    Challenge, ChallengeChoice, DefaultPolicy, EventPolicy, RedirectChoice, RequestHead,
    ResponseHead, TransportEvent,
};
pub use crate::pool::Pool;
pub use crate::response::BodyReader;

use crate::body::{BodyCompletions, BodySource};
use crate::events::{EventStream, pipeline};
use crate::pool::SessionLease;
use crate::response::bridge;
use crate::transport::{TaskRequest, TransportAdapter, TransportHandle};

/// Defines the runtime capabilities required by the client.
///
/// This allows the bridge to be runtime-agnostic (e.g. Tokio, async-std),
/// provided the runtime can spawn background tasks.
pub trait AsyncRuntime: Send + Sync + 'static {
    /// Spawns a future onto the background runtime.
    fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static;
}

/// A type-erased spawner, so internals can launch background tasks without
/// carrying the runtime type parameter around.
#[derive(Clone)]
pub struct RuntimeHandle {
    spawn: Arc<dyn Fn(Pin<Box<dyn Future<Output = ()> + Send>>) + Send + Sync>,
}

impl RuntimeHandle {
    /// Wraps a runtime implementation.
    pub fn new(runtime: impl AsyncRuntime) -> Self {
        Self {
            spawn: Arc::new(move |future| runtime.spawn(future)),
        }
    }

    /// Spawns a future onto the wrapped runtime.
    pub fn spawn(&self, future: impl Future<Output = ()> + Send + 'static) {
        (self.spawn)(Box::pin(future));
    }
}

struct ClientInner<T: TransportAdapter> {
    pool: Pool<T>,
    policy: Arc<dyn EventPolicy>,
    runtime: RuntimeHandle,
}

/// The primary entry point: resolves pooled sessions, launches transport
/// tasks, and bridges their push-style delivery into pull-style responses.
///
/// Cheaply clonable; clones share the same pool.
pub struct Client<T: TransportAdapter> {
    inner: Arc<ClientInner<T>>,
}

impl<T: TransportAdapter> Clone for Client<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

macro_rules! http_method {
    ($name:ident, $variant:expr) => {
        #[doc = concat!("Initiates a `", stringify!($variant), "` request to the given URI.")]
        #[inline]
        pub fn $name<U>(&self, uri: U) -> RequestBuilder<T>
        where
            U: TryInto<Uri>,
            http::Error: From<<U as TryInto<Uri>>::Error>,
        {
            self.request($variant, uri)
        }
    };
}

impl<T: TransportAdapter> Client<T> {
    /// Creates a client with default pool configuration and event policy.
    pub fn new(adapter: T, runtime: impl AsyncRuntime) -> Self {
        Self::configured(adapter, PoolConfig::default(), DefaultPolicy, runtime)
    }

    /// Creates a fully configured client.
    pub fn configured(
        adapter: T,
        config: PoolConfig,
        policy: impl EventPolicy,
        runtime: impl AsyncRuntime,
    ) -> Self {
        let runtime = RuntimeHandle::new(runtime);
        Self {
            inner: Arc::new(ClientInner {
                pool: Pool::new(adapter, config, runtime.clone()),
                policy: Arc::new(policy),
                runtime,
            }),
        }
    }

    /// The session pool backing this client.
    pub fn pool(&self) -> &Pool<T> {
        &self.inner.pool
    }

    /// Shuts the pool down and waits for every session to close.
    pub async fn shutdown(&self) {
        self.inner.pool.drain_and_close().await;
    }

    /// Creates a request builder with a specific HTTP method and URI.
    pub fn request<U>(&self, method: Method, uri: U) -> RequestBuilder<T>
    where
        U: TryInto<Uri>,
        http::Error: From<<U as TryInto<Uri>>::Error>,
    {
        RequestBuilder {
            inner: http::Request::builder().method(method).uri(uri),
            body: None,
            session: SessionConfig::default(),
            cancel: None,
            client: self.clone(),
        }
    }

    http_method!(head, Method::HEAD);
    http_method!(get, Method::GET);
    http_method!(post, Method::POST);
    http_method!(put, Method::PUT);
    http_method!(patch, Method::PATCH);
    http_method!(delete, Method::DELETE);
}

/// A builder for constructing an HTTP request bound to a [`Client`].
pub struct RequestBuilder<T: TransportAdapter> {
    inner: HttpBuilder,
    body: Option<RequestBody>,
    session: SessionConfig,
    cancel: Option<CancellationToken>,
    client: Client<T>,
}

impl<T: TransportAdapter> RequestBuilder<T> {
    /// Appends a header to the request.
    pub fn header<K, V>(mut self, key: K, value: V) -> Self
    where
        http::header::HeaderName: TryFrom<K>,
        <http::header::HeaderName as TryFrom<K>>::Error: Into<http::Error>,
        http::header::HeaderValue: TryFrom<V>,
        <http::header::HeaderValue as TryFrom<V>>::Error: Into<http::Error>,
    {
        self.inner = self.inner.header(key, value);
        self
    }

    /// Attaches a request body descriptor.
    pub fn body(mut self, body: RequestBody) -> Self {
        self.body = Some(body);
        self
    }

    /// Overrides the session configuration used to resolve the pooled
    /// session for this request.
    pub fn session_config(mut self, session: SessionConfig) -> Self {
        self.session = session;
        self
    }

    /// Attaches a cancellation token; cancelling it terminates the request.
    pub fn cancel_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Validates the accumulated parts into a request ready for execution.
    pub fn build(self) -> Result<BoundRequest<T>, http::Error> {
        let (parts, ()) = self.inner.body(())?.into_parts();
        Ok(BoundRequest {
            head: RequestHead {
                method: parts.method,
                uri: parts.uri,
                headers: parts.headers,
            },
            body: self.body,
            session: self.session,
            cancel: self.cancel,
            client: self.client,
        })
    }

    /// Builds and executes in one step.
    pub async fn send(self) -> Result<ResponseHandle, Error> {
        let request = self
            .build()
            .map_err(|err| Error::Transport(TransportError::connect(err)))?;
        request.send().await
    }
}

/// A fully formed HTTP request awaiting execution.
pub struct BoundRequest<T: TransportAdapter> {
    head: RequestHead,
    body: Option<RequestBody>,
    session: SessionConfig,
    cancel: Option<CancellationToken>,
    client: Client<T>,
}

impl<T: TransportAdapter> BoundRequest<T> {
    /// Executes the request.
    ///
    /// Resolves once response metadata has arrived — after the caller's
    /// event policy has answered any redirects or challenges raised before
    /// it — with the body still streaming through the returned reader.
    pub async fn send(self) -> Result<ResponseHandle, Error> {
        let client = self.client.inner.clone();
        let lease = client.pool.checkout(&self.session)?;
        // Per-request token descended from the caller's: their cancel
        // propagates in, while abandoning the response tears down only this
        // request.
        let cancel = self.cancel.unwrap_or_default().child_token();
        let pool_config = client.pool.config();

        let (event_sink, mut event_stream) = pipeline();
        let (sink, reader, done) = bridge(
            event_sink.clone(),
            cancel.clone(),
            pool_config.low_watermark,
            pool_config.high_watermark,
        );

        let (source, completions) = match self.body {
            Some(body) => {
                let source = BodySource::new(
                    body,
                    client.runtime.clone(),
                    pool_config.low_watermark,
                    pool_config.high_watermark,
                );
                let completions = source.completions();
                (Some(source), completions)
            }
            None => (None, BodyCompletions::none()),
        };

        debug!(method = %self.head.method, uri = %self.head.uri, "starting transport task");
        lease.handle().start(
            TaskRequest {
                head: self.head,
                body: source,
                cancel: cancel.clone(),
            },
            sink,
            event_sink,
        )?;

        // Phase one: drain events until the response metadata arrives,
        // routing redirects and challenges through the caller's policy.
        let head = loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    conclude(&client.runtime, event_stream, completions, lease, done, &cancel)
                        .await;
                    return Err(Error::Cancelled);
                }
                event = event_stream.recv() => event,
            };
            match event {
                Some(TransportEvent::Response(head)) => break head,
                Some(TransportEvent::Redirect {
                    response,
                    proposed,
                    decision,
                }) => decision.resolve(client.policy.on_redirect(&response, &proposed)),
                Some(TransportEvent::Challenge {
                    challenge,
                    decision,
                }) => decision.resolve(client.policy.on_challenge(&challenge)),
                Some(TransportEvent::Failed(err)) => {
                    conclude(&client.runtime, event_stream, completions, lease, done, &cancel)
                        .await;
                    return Err(err);
                }
                None => {
                    conclude(&client.runtime, event_stream, completions, lease, done, &cancel)
                        .await;
                    return Err(Error::Transport(TransportError::terminated(
                        std::io::Error::other("transport task ended without a response"),
                    )));
                }
            }
        };

        // Phase two runs in the background: late events get safe defaults
        // and every body-producer run is joined before the request is
        // considered complete.
        spawn_driver(&client.runtime, event_stream, completions, lease, done);
        Ok(ResponseHandle { head, body: reader })
    }
}

/// Drains late events with safe defaults, joins body-producer runs, and
/// releases the session lease once the request is fully complete.
fn spawn_driver<T: TransportAdapter>(
    runtime: &RuntimeHandle,
    mut events: EventStream,
    completions: BodyCompletions,
    lease: SessionLease<T>,
    done: tokio::sync::oneshot::Sender<Result<(), Error>>,
) {
    runtime.spawn(async move {
        drain_events(&mut events).await;
        let outcome = completions.join_all().await;
        drop(lease);
        let _ = done.send(outcome);
    });
}

/// Concludes a request that failed or was cancelled during phase one.
///
/// Producer runs are joined before the caller sees the outcome, so their
/// cleanup has executed by the time `send` returns; a cancellation keeps
/// priority so the caller is never held up past its own abort. Remaining
/// events are drained and the lease released in the background.
async fn conclude<T: TransportAdapter>(
    runtime: &RuntimeHandle,
    mut events: EventStream,
    completions: BodyCompletions,
    lease: SessionLease<T>,
    done: tokio::sync::oneshot::Sender<Result<(), Error>>,
    cancel: &CancellationToken,
) {
    let outcome = tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled),
        outcome = completions.join_all() => outcome,
    };
    runtime.spawn(async move {
        drain_events(&mut events).await;
        let _ = completions.join_all().await;
        drop(lease);
        let _ = done.send(outcome);
    });
}

/// Answers events arriving after the request's outcome is already decided.
async fn drain_events(events: &mut EventStream) {
    while let Some(event) = events.recv().await {
        match event {
            // A response already reached the caller (or the request
            // already failed); these can no longer be acted upon.
            TransportEvent::Redirect { decision, .. } => decision.resolve(RedirectChoice::Stop),
            TransportEvent::Challenge { decision, .. } => {
                decision.resolve(ChallengeChoice::Cancel)
            }
            TransportEvent::Response(_) | TransportEvent::Failed(_) => {}
        }
    }
}

/// Response metadata plus the streaming body reader.
pub struct ResponseHandle {
    /// Status, version, and headers as delivered by the transport.
    pub head: ResponseHead,
    /// Pull-based body reader; conclude it with [`BodyReader::finish`] to
    /// obtain the trailers.
    pub body: BodyReader,
}

impl ResponseHandle {
    /// The response status code.
    pub fn status(&self) -> http::StatusCode {
        self.head.status
    }

    /// Splits the handle into metadata and body reader.
    pub fn into_parts(self) -> (ResponseHead, BodyReader) {
        (self.head, self.body)
    }
}

/// Spawns onto the ambient tokio runtime; unit tests only.
#[cfg(test)]
#[derive(Clone, Copy)]
pub(crate) struct TokioTestRuntime;

#[cfg(test)]
impl AsyncRuntime for TokioTestRuntime {
    fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        tokio::spawn(future);
    }
}
