use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::{Response, header};
use axum::response::Redirect;
use axum::routing::{get, post};
use futures_lite::StreamExt;
use tokio::net::TcpListener;

use weir::bytes::Bytes;
use weir::{CancellationToken, Client, Error, RequestBody};
use weir_hyper::{HyperTransport, TokioRuntime};

async fn with_server(app: Router, run: impl AsyncFnOnce(String)) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();

    let server = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    run(address).await;

    server.abort();
    let _ = server.await;
}

fn client() -> Client<HyperTransport> {
    Client::new(HyperTransport::new(), TokioRuntime)
}

#[tokio::test]
async fn get_round_trip() {
    let app = Router::new().route("/", get(async || "Hello, World!"));

    with_server(app, async |address| {
        let client = client();
        let response = client
            .get(format!("http://{address}/"))
            .send()
            .await
            .expect("request failed");
        assert_eq!(response.status(), 200);

        let (_, mut body) = response.into_parts();
        let bytes = body.collect(64 * 1024).await.unwrap();
        assert_eq!(&bytes[..], b"Hello, World!");
        assert!(body.finish().await.unwrap().is_none());

        client.shutdown().await;
    })
    .await;
}

#[tokio::test]
async fn post_echoes_a_streamed_body() {
    let app = Router::new().route("/echo", post(async |body: String| body));

    with_server(app, async |address| {
        let client = client();
        let response = client
            .post(format!("http://{address}/echo"))
            .body(RequestBody::bytes("Hello World"))
            .send()
            .await
            .expect("request failed");
        assert_eq!(response.status(), 200);

        let (_, mut body) = response.into_parts();
        let bytes = body.collect(1024).await.unwrap();
        assert_eq!(&bytes[..], b"Hello World");
        body.finish().await.unwrap();
    })
    .await;
}

#[tokio::test]
async fn concurrent_requests_share_one_session() {
    let app = Router::new().route("/", get(async || "ok"));

    with_server(app, async |address| {
        let client = client();
        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..100 {
            let client = client.clone();
            let uri = format!("http://{address}/");
            tasks.spawn(async move {
                let response = client.get(uri).send().await?;
                let (_, mut body) = response.into_parts();
                let bytes = body.collect(64).await?;
                body.finish().await?;
                Ok::<_, Error>(bytes)
            });
        }

        while let Some(result) = tasks.join_next().await {
            let bytes = result.unwrap().expect("request failed");
            assert_eq!(&bytes[..], b"ok");
        }
        assert_eq!(client.pool().session_count(), 1);
    })
    .await;
}

#[tokio::test]
async fn cancellation_before_headers_resolves_promptly() {
    let app = Router::new().route(
        "/slow",
        get(async || {
            tokio::time::sleep(Duration::from_secs(60)).await;
            "late"
        }),
    );

    with_server(app, async |address| {
        let client = client();
        let cancel = CancellationToken::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            canceller.cancel();
        });

        let outcome = tokio::time::timeout(
            Duration::from_secs(5),
            client
                .get(format!("http://{address}/slow"))
                .cancel_token(cancel)
                .send(),
        )
        .await
        .expect("cancellation did not resolve the send");
        assert!(matches!(outcome, Err(Error::Cancelled)));
    })
    .await;
}

#[tokio::test]
async fn cancellation_mid_body_does_not_hang() {
    // Headers and a partial chunk, then the stream stalls forever.
    let app = Router::new().route(
        "/stall",
        get(async || {
            let stream = futures_lite::stream::once(Ok::<_, std::io::Error>(Bytes::from_static(
                b"partial",
            )))
            .chain(futures_lite::stream::pending());
            Response::builder()
                .header(header::CONTENT_LENGTH, 1000)
                .body(Body::from_stream(stream))
                .unwrap()
        }),
    );

    with_server(app, async |address| {
        let client = client();
        let cancel = CancellationToken::new();

        let response = client
            .get(format!("http://{address}/stall"))
            .cancel_token(cancel.clone())
            .send()
            .await
            .expect("request failed");
        let (_, mut body) = response.into_parts();
        assert_eq!(&body.read(None).await.unwrap()[..], b"partial");

        cancel.cancel();
        let outcome = tokio::time::timeout(Duration::from_secs(5), body.read(None))
            .await
            .expect("cancellation did not interrupt the read");
        assert!(matches!(outcome, Err(Error::Cancelled)));
        assert!(matches!(body.finish().await, Err(Error::Cancelled)));
    })
    .await;
}

#[tokio::test]
async fn followed_redirect_replays_the_request_body() {
    let app = Router::new()
        .route("/old", post(async || Redirect::temporary("/new")))
        .route("/new", post(async |body: String| body));

    with_server(app, async |address| {
        let client = client();
        let response = client
            .post(format!("http://{address}/old"))
            .body(RequestBody::bytes("Hello World"))
            .send()
            .await
            .expect("request failed");
        assert_eq!(response.status(), 200);

        let (_, mut body) = response.into_parts();
        let bytes = body.collect(1024).await.unwrap();
        assert_eq!(&bytes[..], b"Hello World");
        body.finish().await.unwrap();
    })
    .await;
}

#[tokio::test]
async fn unanswered_challenge_delivers_the_response() {
    let app = Router::new().route(
        "/guarded",
        get(async || {
            Response::builder()
                .status(401)
                .header(header::WWW_AUTHENTICATE, "Basic realm=\"vault\"")
                .body(Body::from("denied"))
                .unwrap()
        }),
    );

    with_server(app, async |address| {
        // The default policy proceeds without credentials, so the 401
        // reaches the caller as a plain response.
        let client = client();
        let response = client
            .get(format!("http://{address}/guarded"))
            .send()
            .await
            .expect("request failed");
        assert_eq!(response.status(), 401);

        let (_, mut body) = response.into_parts();
        let bytes = body.collect(64).await.unwrap();
        assert_eq!(&bytes[..], b"denied");
        body.finish().await.unwrap();
    })
    .await;
}
