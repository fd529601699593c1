//! # Tokio + Hyper Transport Adapter
//!
//! A native transport backed by `tokio::net::TcpStream` and the `hyper`
//! HTTP/1.1 client connection machinery.
//!
//! Each started task dials the request's authority, performs the Hyper
//! handshake, and pumps the exchange through the bridge sinks:
//!
//! - request-body bytes are pulled from the task's [`BodySource`] and fed to
//!   Hyper through an [`http_body::Body`] implementation
//! - redirects and credential challenges are raised as events and acted on
//!   according to the caller's verdict, replaying the body from its start
//!   when a redirect is followed
//! - response frames are pushed through the [`ResponseSink`], pausing
//!   delivery whenever the bridge asks for it
//!
//! Limitations:
//!
//! - Only plain `http` URIs are supported; TLS is not wired up
//! - HTTP/1.1 only, one TCP connection per task

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use http::header::{CONTENT_LENGTH, HOST, LOCATION, WWW_AUTHENTICATE};
use http::uri::PathAndQuery;
use http::{HeaderMap, StatusCode, Uri};
use http_body::{Body, Frame, SizeHint};
use http_body_util::BodyExt;
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use tokio_util::task::TaskTracker;
use tracing::debug;

use weir::AsyncRuntime;
use weir::SessionConfig;
use weir::body::BodySource;
use weir::channel::ByteChanReceiver;
use weir::error::{Error, TransportError};
use weir::events::{
    Challenge, ChallengeChoice, EventSink, RedirectChoice, RequestHead, ResponseHead,
};
use weir::response::{ChunkOutcome, ResponseSink};
use weir::transport::{TaskRequest, TransportAdapter, TransportHandle};

/// Cap on policy-approved redirect hops for a single request.
const MAX_REDIRECTS: usize = 10;

/// Tokio-based async runtime adapter.
///
/// Lets a `weir` client spawn background tasks onto a Tokio runtime without
/// depending directly on Tokio types.
#[derive(Clone, Copy, Default, Debug)]
pub struct TokioRuntime;

impl AsyncRuntime for TokioRuntime {
    fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        tokio::spawn(future);
    }
}

/// Hyper-backed transport adapter.
#[derive(Clone, Copy, Default)]
pub struct HyperTransport;

impl HyperTransport {
    pub fn new() -> Self {
        Self
    }
}

impl TransportAdapter for HyperTransport {
    type Handle = HyperHandle;

    fn open(&self, _config: &SessionConfig) -> Result<Self::Handle, Error> {
        Ok(HyperHandle {
            tasks: TaskTracker::new(),
        })
    }
}

/// One pooled Hyper session handle.
///
/// Tracks every task started on it so closure can wait for their terminal
/// completion.
pub struct HyperHandle {
    tasks: TaskTracker,
}

impl TransportHandle for HyperHandle {
    fn start(
        &self,
        request: TaskRequest,
        sink: ResponseSink,
        events: EventSink,
    ) -> Result<(), Error> {
        if self.tasks.is_closed() {
            return Err(Error::Transport(TransportError::connect(
                std::io::Error::other("transport handle is closing"),
            )));
        }
        self.tasks.spawn(run_task(request, sink, events));
        Ok(())
    }

    async fn close(&self) {
        self.tasks.close();
        self.tasks.wait().await;
    }
}

/// Runs one request task to terminal closure.
///
/// Cancellation wins over transport progress; `finish` is called exactly
/// once, after which both sinks drop.
async fn run_task(request: TaskRequest, sink: ResponseSink, events: EventSink) {
    let cancel = request.cancel.clone();
    let outcome = tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled),
        outcome = drive(&request, &sink, &events) => outcome,
    };
    sink.finish(outcome);
}

/// Performs the exchange, following policy-approved redirects.
async fn drive(
    request: &TaskRequest,
    sink: &ResponseSink,
    events: &EventSink,
) -> Result<Option<HeaderMap>, Error> {
    let mut head = request.head.clone();
    let mut hops = 0;

    let response = loop {
        let response = exchange(&head, request.body.as_ref()).await?;

        match classify(&response, &head.uri) {
            Classified::Redirect(next) if hops < MAX_REDIRECTS => {
                let proposed = RequestHead {
                    method: head.method.clone(),
                    uri: next,
                    headers: head.headers.clone(),
                };
                let verdict = events.redirect(response_head(&response), proposed.clone());
                // A closed decision channel reads as "stop here".
                match verdict.await.unwrap_or(RedirectChoice::Stop) {
                    RedirectChoice::Follow => {
                        debug!(uri = %proposed.uri, "following redirect");
                        head = proposed;
                        hops += 1;
                        // The next attempt replays the body from its start.
                        continue;
                    }
                    RedirectChoice::Stop => break response,
                }
            }
            Classified::Challenge(challenge) => {
                let verdict = events.challenge(challenge);
                match verdict.await.unwrap_or(ChallengeChoice::Cancel) {
                    ChallengeChoice::Proceed => break response,
                    ChallengeChoice::Cancel => return Err(Error::Cancelled),
                }
            }
            _ => break response,
        }
    };

    deliver(response, sink).await
}

enum Classified {
    Redirect(Uri),
    Challenge(Challenge),
    Plain,
}

fn classify(response: &http::Response<hyper::body::Incoming>, base: &Uri) -> Classified {
    if response.status().is_redirection() {
        if let Some(next) = response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|location| resolve_location(base, location))
        {
            return Classified::Redirect(next);
        }
    }
    if response.status() == StatusCode::UNAUTHORIZED {
        if let Some(value) = response
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
        {
            return Classified::Challenge(parse_challenge(value));
        }
    }
    Classified::Plain
}

fn response_head(response: &http::Response<hyper::body::Incoming>) -> ResponseHead {
    ResponseHead {
        status: response.status(),
        version: response.version(),
        headers: response.headers().clone(),
    }
}

/// Resolves a `Location` value against the request URI, keeping the original
/// scheme and authority when the target is relative.
fn resolve_location(base: &Uri, location: &str) -> Option<Uri> {
    let uri: Uri = location.parse().ok()?;
    if uri.scheme().is_some() {
        return Some(uri);
    }
    let mut parts = uri.into_parts();
    parts.scheme = base.scheme().cloned();
    parts.authority = base.authority().cloned();
    Uri::from_parts(parts).ok()
}

/// Extracts scheme and `realm` from a `WWW-Authenticate` value.
fn parse_challenge(value: &str) -> Challenge {
    let mut parts = value.splitn(2, ' ');
    let scheme = parts.next().unwrap_or_default().to_owned();
    let realm = parts.next().and_then(|params| {
        params.split(',').find_map(|param| {
            let (key, val) = param.split_once('=')?;
            key.trim()
                .eq_ignore_ascii_case("realm")
                .then(|| val.trim().trim_matches('"').to_owned())
        })
    });
    Challenge { scheme, realm }
}

/// Dials the authority and performs one request/response exchange, resolving
/// once response metadata is in hand.
async fn exchange(
    head: &RequestHead,
    body: Option<&BodySource>,
) -> Result<http::Response<hyper::body::Incoming>, Error> {
    if head.uri.scheme_str() == Some("https") {
        return Err(Error::Transport(TransportError::connect(
            std::io::Error::other("https is not supported by this transport"),
        )));
    }
    let host = head.uri.host().ok_or(Error::Transport(TransportError::Protocol(
        "request URI has no host",
    )))?;
    let port = head.uri.port_u16().unwrap_or(80);

    let tcp = TcpStream::connect((host, port))
        .await
        .map_err(|e| Error::Transport(TransportError::connect(e)))?;
    let _ = tcp.set_nodelay(true);

    let (mut sender, conn) = http1::handshake(TokioIo::new(tcp))
        .await
        .map_err(|e| Error::Transport(TransportError::connect(e)))?;
    tokio::spawn(async move {
        if let Err(error) = conn.await {
            debug!(%error, "hyper connection ended with an error");
        }
    });

    // Origin-form request target; Host carries the authority.
    let mut parts = http::uri::Parts::default();
    parts.path_and_query = Some(
        head.uri
            .path_and_query()
            .cloned()
            .unwrap_or_else(|| PathAndQuery::from_static("/")),
    );
    let target = Uri::from_parts(parts).map_err(|e| Error::Transport(TransportError::connect(e)))?;
    let mut builder = http::Request::builder()
        .method(head.method.clone())
        .uri(target);
    for (name, value) in &head.headers {
        builder = builder.header(name, value);
    }
    if !head.headers.contains_key(HOST) {
        if let Some(authority) = head.uri.authority() {
            builder = builder.header(HOST, authority.as_str());
        }
    }
    if let Some(length) = body.and_then(BodySource::length) {
        if !head.headers.contains_key(CONTENT_LENGTH) {
            builder = builder.header(CONTENT_LENGTH, length);
        }
    }

    let pull = match body {
        Some(source) => PullBody::new(source.stream(0), source.length()),
        None => PullBody::empty(),
    };
    let request = builder
        .body(pull)
        .map_err(|e| Error::Transport(TransportError::connect(e)))?;

    sender
        .ready()
        .await
        .map_err(|e| Error::Transport(TransportError::terminated(e)))?;
    sender
        .send_request(request)
        .await
        .map_err(|e| Error::Transport(TransportError::terminated(e)))
}

/// Pushes response metadata and body frames through the sink, honoring pause
/// directives.
async fn deliver(
    response: http::Response<hyper::body::Incoming>,
    sink: &ResponseSink,
) -> Result<Option<HeaderMap>, Error> {
    sink.headers(response_head(&response))?;

    let mut body = response.into_body();
    let mut trailers = None;
    while let Some(frame) = body.frame().await {
        let frame = frame.map_err(|e| Error::Transport(TransportError::terminated(e)))?;
        match frame.into_data() {
            Ok(data) => match sink.body_chunk(data) {
                ChunkOutcome::Continue => {}
                ChunkOutcome::Pause => sink.resumed().await,
                // The consumer is gone; no point pulling further frames.
                ChunkOutcome::Stop => return Ok(None),
            },
            Err(frame) => {
                if let Ok(map) = frame.into_trailers() {
                    trailers = Some(map);
                }
            }
        }
    }
    Ok(trailers)
}

enum PullState {
    Idle(ByteChanReceiver),
    Reading(Pin<Box<dyn Future<Output = (ByteChanReceiver, Result<Option<Bytes>, Error>)> + Send>>),
    Done,
}

/// Adapts the pull side of the write bridge into an [`http_body::Body`].
///
/// Hyper polls frames; each poll drains the next chunk from the byte
/// channel, ending the stream when the channel closes cleanly.
struct PullBody {
    state: PullState,
    length: Option<u64>,
}

impl PullBody {
    fn new(receiver: ByteChanReceiver, length: Option<u64>) -> Self {
        Self {
            state: PullState::Idle(receiver),
            length,
        }
    }

    fn empty() -> Self {
        Self {
            state: PullState::Done,
            length: Some(0),
        }
    }
}

impl Body for PullBody {
    type Data = Bytes;
    type Error = weir::BoxError;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        loop {
            match std::mem::replace(&mut self.state, PullState::Done) {
                PullState::Idle(mut receiver) => {
                    self.state = PullState::Reading(Box::pin(async move {
                        let out = receiver.read(None).await;
                        (receiver, out)
                    }));
                }
                PullState::Reading(mut fut) => match fut.as_mut().poll(cx) {
                    Poll::Pending => {
                        self.state = PullState::Reading(fut);
                        return Poll::Pending;
                    }
                    Poll::Ready((receiver, Ok(Some(chunk)))) => {
                        self.state = PullState::Idle(receiver);
                        return Poll::Ready(Some(Ok(Frame::data(chunk))));
                    }
                    Poll::Ready((_, Ok(None))) => return Poll::Ready(None),
                    Poll::Ready((_, Err(err))) => return Poll::Ready(Some(Err(err.into()))),
                },
                PullState::Done => return Poll::Ready(None),
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        matches!(self.state, PullState::Done)
    }

    fn size_hint(&self) -> SizeHint {
        match self.length {
            Some(length) => SizeHint::with_exact(length),
            None => SizeHint::default(),
        }
    }
}
