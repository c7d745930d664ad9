//! End-to-end scenarios for the record/replay proxy (S1-S6).
//!
//! Each test spins up a tiny in-process upstream (standing in for the real
//! HTTP dependency) and a `Player` pointed at it, then drives the Player's
//! control API and sends live requests through it with a plain hyper
//! client -- the same shape a test harness driving this proxy would use.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use tempfile::TempDir;
use tokio::net::TcpListener;

use vcrplay::cassette::Cassette;
use vcrplay::player::Player;

/// A canned `(status, body)` upstream keyed by path.
type Canned = HashMap<&'static str, (u16, &'static str)>;

async fn spawn_mock_upstream(responses: Canned) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let responses = Arc::new(responses);

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let io = TokioIo::new(stream);
            let responses = Arc::clone(&responses);
            tokio::spawn(async move {
                let service = service_fn(move |req: Request<Incoming>| {
                    let responses = Arc::clone(&responses);
                    async move {
                        let path = req.uri().path().to_string();
                        let (status, body) = responses
                            .get(path.as_str())
                            .copied()
                            .unwrap_or((404, "not found"));
                        Ok::<_, Infallible>(
                            Response::builder()
                                .status(status)
                                .body(Full::new(Bytes::from(body)))
                                .unwrap(),
                        )
                    }
                });
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(io, service)
                    .await;
            });
        }
    });

    port
}

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn test_client() -> Client<HttpConnector, Full<Bytes>> {
    Client::builder(TokioExecutor::new()).build_http()
}

async fn send(
    client: &Client<HttpConnector, Full<Bytes>>,
    base: &str,
    method: &str,
    path: &str,
) -> (u16, String) {
    let uri = format!("{base}{}", path.trim_start_matches('/'));
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .body(Full::new(Bytes::new()))
        .unwrap();

    let response = client.request(request).await.unwrap();
    let status = response.status().as_u16();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, String::from_utf8_lossy(&body).into_owned())
}

/// S1: record then replay.
#[tokio::test]
async fn s1_record_then_replay() {
    let upstream_port =
        spawn_mock_upstream(HashMap::from([("/users/u1", (200, r#"{"id":"u1"}"#))])).await;
    let dir = TempDir::new().unwrap();
    let cassette_path = dir.path().join("cassette.json");

    let player_port = free_port();
    let base = format!("http://127.0.0.1:{player_port}/");
    let remote = format!("http://127.0.0.1:{upstream_port}");

    let player = Player::new(&base, &remote).unwrap();
    player.start().await.unwrap();
    player.load(Cassette::open(&cassette_path).unwrap()).await;
    player.record("r1").await.unwrap();

    let client = test_client();
    let (status, body) = send(&client, &base, "GET", "/users/u1").await;
    assert_eq!(status, 200);
    assert_eq!(body, r#"{"id":"u1"}"#);

    player.stop().await.unwrap();

    player.play("r1").await.unwrap();
    let (status, body) = send(&client, &base, "GET", "/users/u1").await;
    assert_eq!(status, 200);
    assert_eq!(body, r#"{"id":"u1"}"#);

    player.close().await.unwrap();
}

/// S2: replay mismatch.
#[tokio::test]
async fn s2_replay_mismatch() {
    let upstream_port =
        spawn_mock_upstream(HashMap::from([("/users/u1", (200, r#"{"id":"u1"}"#))])).await;
    let dir = TempDir::new().unwrap();
    let cassette_path = dir.path().join("cassette.json");

    let player_port = free_port();
    let base = format!("http://127.0.0.1:{player_port}/");
    let remote = format!("http://127.0.0.1:{upstream_port}");

    let player = Player::new(&base, &remote).unwrap();
    player.start().await.unwrap();
    player.load(Cassette::open(&cassette_path).unwrap()).await;
    player.record("r1").await.unwrap();

    let client = test_client();
    send(&client, &base, "GET", "/users/u1").await;
    player.stop().await.unwrap();

    player.play("r1").await.unwrap();
    let (status, body) = send(&client, &base, "GET", "/users/u2").await;
    assert_eq!(status, 454);
    assert!(body.contains("Player request mismatch"));
    assert!(body.contains("/users/u2"));

    player.close().await.unwrap();
}

/// S3: end of record.
#[tokio::test]
async fn s3_end_of_record() {
    let upstream_port =
        spawn_mock_upstream(HashMap::from([("/users/u1", (200, r#"{"id":"u1"}"#))])).await;
    let dir = TempDir::new().unwrap();
    let cassette_path = dir.path().join("cassette.json");

    let player_port = free_port();
    let base = format!("http://127.0.0.1:{player_port}/");
    let remote = format!("http://127.0.0.1:{upstream_port}");

    let player = Player::new(&base, &remote).unwrap();
    player.start().await.unwrap();
    player.load(Cassette::open(&cassette_path).unwrap()).await;
    player.record("r1").await.unwrap();

    let client = test_client();
    send(&client, &base, "GET", "/users/u1").await;
    player.stop().await.unwrap();

    player.play("r1").await.unwrap();
    let (status, _) = send(&client, &base, "GET", "/users/u1").await;
    assert_eq!(status, 200);

    let (status, _) = send(&client, &base, "GET", "/users/u1").await;
    assert_eq!(status, 551);

    player.close().await.unwrap();
}

/// S4: missing record.
#[tokio::test]
async fn s4_missing_record() {
    let dir = TempDir::new().unwrap();
    let cassette_path = dir.path().join("cassette.json");

    let player = Player::new(
        &format!("http://127.0.0.1:{}/", free_port()),
        "http://127.0.0.1:1",
    )
    .unwrap();
    player.start().await.unwrap();
    player.load(Cassette::open(&cassette_path).unwrap()).await;

    let err = player.play("none").await.unwrap_err();
    assert!(matches!(err, vcrplay::PlayerError::RecordNotFound(name) if name == "none"));

    player.close().await.unwrap();
}

/// S5: bad state.
#[tokio::test]
async fn s5_bad_state() {
    let player = Player::new(
        &format!("http://127.0.0.1:{}/", free_port()),
        "http://127.0.0.1:1",
    )
    .unwrap();

    let err = player.play("r1").await.unwrap_err();
    assert!(matches!(err, vcrplay::PlayerError::InvalidState(_)));
}

/// S6: Keep-Alive tolerance -- record a request with `Connection: Keep-Alive`,
/// replay the same request omitting that header, expect a match.
#[tokio::test]
async fn s6_keep_alive_tolerance() {
    let upstream_port = spawn_mock_upstream(HashMap::from([("/ping", (200, "pong"))])).await;
    let dir = TempDir::new().unwrap();
    let cassette_path = dir.path().join("cassette.json");

    let player_port = free_port();
    let base = format!("http://127.0.0.1:{player_port}/");
    let remote = format!("http://127.0.0.1:{upstream_port}");

    let player = Player::new(&base, &remote).unwrap();
    player.start().await.unwrap();
    player.load(Cassette::open(&cassette_path).unwrap()).await;
    player.record("r1").await.unwrap();

    let client = test_client();
    let request = Request::builder()
        .method("GET")
        .uri(format!("{base}ping"))
        .header("connection", "keep-alive")
        .body(Full::new(Bytes::new()))
        .unwrap();
    let response = client.request(request).await.unwrap();
    assert_eq!(response.status(), 200);

    player.stop().await.unwrap();
    player.play("r1").await.unwrap();

    // Plain hyper clients over a fresh connection don't reliably emit
    // `Connection: Keep-Alive` themselves -- this is exactly the case the
    // tolerance rule exists for.
    let (status, body) = send(&client, &base, "GET", "/ping").await;
    assert_eq!(status, 200);
    assert_eq!(body, "pong");

    player.close().await.unwrap();
}
