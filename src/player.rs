//! The Player: state machine, proxy loop, and control API.
//!
//! A single `tokio::sync::Mutex` (`statelock` in spirit) guards both the
//! state field and the per-request dispatch body, so control-API calls
//! (`play`/`record`/`stop`/`close`) can never interleave with an in-flight
//! request -- a request that begins processing completes before a mode
//! change is observed. See `SPEC_FULL.md` §5.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::ext::ReasonPhrase;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::cassette::Cassette;
use crate::config::LimitsConfig;
use crate::mock::{requests_match, Cookie, MockRequest, MockResponse};
use crate::record::{Exchange, Record};
use crate::{PlayerError, Result};

/// Player state machine states (§4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Constructed but never started.
    Off,
    /// Started, no cassette operation currently active.
    Idle,
    /// Replaying exchanges from the current Record.
    Playing,
    /// Capturing exchanges into the current Record.
    Recording,
}

impl State {
    /// The dispatch-state label used to pick a Player-error response code.
    fn label(self) -> &'static str {
        match self {
            State::Off => "off",
            State::Idle => "idle",
            State::Playing => "play",
            State::Recording => "record",
        }
    }
}

struct Shared {
    state: State,
    cassette: Option<Cassette>,
    current: Option<Record>,
}

struct ListenerHandle {
    shutdown: broadcast::Sender<()>,
    task: JoinHandle<()>,
}

/// Record/replay HTTP proxy: owns the listener, the state machine, and the
/// proxy loop that dispatches each incoming request according to current
/// mode.
pub struct Player {
    base_address: String,
    listen_addr: SocketAddr,
    remote_base: String,
    upstream_authority: String,
    upstream_host: String,
    limits: LimitsConfig,
    shared: Arc<Mutex<Shared>>,
    listener_ctl: std::sync::Mutex<Option<ListenerHandle>>,
}

impl Player {
    /// Construct a Player bound to `base_address` and forwarding to
    /// `remote_address` while recording. Neither address is started yet;
    /// call [`Player::start`] to begin accepting connections.
    ///
    /// # Errors
    ///
    /// Returns [`PlayerError::InvalidArgument`] if either address is empty
    /// or cannot be parsed into a host/port.
    pub fn new(base_address: &str, remote_address: &str) -> Result<Self> {
        if base_address.trim().is_empty() {
            return Err(PlayerError::InvalidArgument(
                "base_address is required".to_string(),
            ));
        }
        if remote_address.trim().is_empty() {
            return Err(PlayerError::InvalidArgument(
                "remote_address is required".to_string(),
            ));
        }

        let base_address = if base_address.ends_with('/') {
            base_address.to_string()
        } else {
            format!("{base_address}/")
        };

        let base_uri: Uri = base_address
            .parse()
            .map_err(|e| PlayerError::InvalidArgument(format!("invalid base_address: {e}")))?;
        let host = base_uri
            .host()
            .ok_or_else(|| PlayerError::InvalidArgument("base_address has no host".to_string()))?;
        let port = base_uri.port_u16().unwrap_or(80);
        let listen_addr: SocketAddr = format!("{host}:{port}")
            .parse()
            .map_err(|e| PlayerError::InvalidArgument(format!("invalid base_address: {e}")))?;

        let remote_uri: Uri = remote_address
            .parse()
            .map_err(|e| PlayerError::InvalidArgument(format!("invalid remote_address: {e}")))?;
        let upstream_authority = remote_uri
            .authority()
            .ok_or_else(|| {
                PlayerError::InvalidArgument("remote_address has no authority".to_string())
            })?
            .to_string();
        let upstream_host = remote_uri
            .host()
            .ok_or_else(|| PlayerError::InvalidArgument("remote_address has no host".to_string()))?
            .to_string();

        Ok(Self {
            base_address,
            listen_addr,
            remote_base: remote_address.to_string(),
            upstream_authority,
            upstream_host,
            limits: LimitsConfig::default(),
            shared: Arc::new(Mutex::new(Shared {
                state: State::Off,
                cassette: None,
                current: None,
            })),
            listener_ctl: std::sync::Mutex::new(None),
        })
    }

    /// Apply resource limits (max body size, max header count) to requests
    /// and responses the proxy loop handles. Replaces the built-in default;
    /// call before [`Player::start`].
    #[must_use]
    pub fn with_limits(mut self, limits: LimitsConfig) -> Self {
        self.limits = limits;
        self
    }

    /// The local address the Player listens on once started.
    #[must_use]
    pub fn base_address(&self) -> &str {
        &self.base_address
    }

    /// Current state, for diagnostics and tests.
    pub async fn state(&self) -> State {
        self.shared.lock().await.state
    }

    /// Set (or replace) the loaded Cassette. May be called in any state;
    /// takes effect for subsequent `play`/`record` calls.
    pub async fn load(&self, cassette: Cassette) {
        let mut shared = self.shared.lock().await;
        shared.cassette = Some(cassette);
    }

    /// Start the listener and launch the proxy loop. State must be `Off`.
    ///
    /// # Errors
    ///
    /// Returns [`PlayerError::InvalidState`] unless currently `Off`, or
    /// [`PlayerError::IoFailure`] if the listener cannot bind.
    pub async fn start(&self) -> Result<()> {
        {
            let mut shared = self.shared.lock().await;
            if shared.state != State::Off {
                return Err(PlayerError::InvalidState(format!(
                    "start requires Off, found {:?}",
                    shared.state
                )));
            }
            shared.state = State::Idle;
        }

        let listener = TcpListener::bind(self.listen_addr).await?;
        info!(addr = %self.listen_addr, "player listening");

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let task = spawn_accept_loop(
            listener,
            Arc::clone(&self.shared),
            self.remote_base.clone(),
            self.upstream_authority.clone(),
            self.upstream_host.clone(),
            self.limits.clone(),
            shutdown_rx,
        );

        *self
            .listener_ctl
            .lock()
            .expect("listener_ctl mutex poisoned") = Some(ListenerHandle {
            shutdown: shutdown_tx,
            task,
        });

        Ok(())
    }

    /// Begin replaying the named Record. State must be `Idle`, a cassette
    /// must be loaded, and the cassette must contain `name`.
    ///
    /// # Errors
    ///
    /// Returns [`PlayerError::InvalidState`], [`PlayerError::CassetteNotLoaded`],
    /// or [`PlayerError::RecordNotFound`].
    pub async fn play(&self, name: &str) -> Result<()> {
        let mut shared = self.shared.lock().await;
        if shared.state != State::Idle {
            return Err(PlayerError::InvalidState(format!(
                "play requires Idle, found {:?}",
                shared.state
            )));
        }
        let cassette = shared
            .cassette
            .as_ref()
            .ok_or(PlayerError::CassetteNotLoaded)?;
        let record = cassette
            .find(name)
            .ok_or_else(|| PlayerError::RecordNotFound(name.to_string()))?;

        shared.current = Some(record);
        shared.state = State::Playing;
        info!(record = name, "player playing");
        Ok(())
    }

    /// Begin recording into a fresh Record named `name`. State must be
    /// `Idle` and a cassette must be loaded.
    ///
    /// # Errors
    ///
    /// Returns [`PlayerError::InvalidState`] or [`PlayerError::CassetteNotLoaded`].
    pub async fn record(&self, name: &str) -> Result<()> {
        let mut shared = self.shared.lock().await;
        if shared.state != State::Idle {
            return Err(PlayerError::InvalidState(format!(
                "record requires Idle, found {:?}",
                shared.state
            )));
        }
        if shared.cassette.is_none() {
            return Err(PlayerError::CassetteNotLoaded);
        }

        shared.current = Some(Record::new(name));
        shared.state = State::Recording;
        info!(record = name, "player recording");
        Ok(())
    }

    /// Stop playing or recording: rewind the current Record (saving it to
    /// the cassette first if recording) and return to `Idle`. State must
    /// not be `Off`.
    ///
    /// # Errors
    ///
    /// Returns [`PlayerError::InvalidState`] if currently `Off`, or a
    /// cassette I/O error if saving fails.
    pub async fn stop(&self) -> Result<()> {
        let mut shared = self.shared.lock().await;
        stop_locked(&mut shared)
    }

    /// Idempotent on `Off`. Performs the same cleanup as [`Player::stop`]
    /// (including save if recording), then shuts down the listener.
    ///
    /// # Errors
    ///
    /// Returns an error only if saving the cassette fails.
    pub async fn close(&self) -> Result<()> {
        {
            let mut shared = self.shared.lock().await;
            if shared.state != State::Off {
                stop_locked(&mut shared)?;
                shared.state = State::Off;
            }
        }

        let handle = self
            .listener_ctl
            .lock()
            .expect("listener_ctl mutex poisoned")
            .take();
        if let Some(handle) = handle {
            let _ = handle.shutdown.send(());
            let _ = handle.task.await;
        }

        info!("player closed");
        Ok(())
    }
}

fn stop_locked(shared: &mut Shared) -> Result<()> {
    if shared.state == State::Off {
        return Err(PlayerError::InvalidState(
            "stop requires a started Player".to_string(),
        ));
    }

    if let Some(mut record) = shared.current.take() {
        record.rewind();
        if shared.state == State::Recording {
            let cassette = shared
                .cassette
                .as_mut()
                .ok_or(PlayerError::CassetteNotLoaded)?;
            cassette.save(&record)?;
        }
    }

    shared.state = State::Idle;
    Ok(())
}

#[allow(clippy::too_many_lines)]
fn spawn_accept_loop(
    listener: TcpListener,
    shared: Arc<Mutex<Shared>>,
    remote_base: String,
    upstream_authority: String,
    upstream_host: String,
    limits: LimitsConfig,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    let client: Client<HttpConnector, Full<Bytes>> =
        Client::builder(TokioExecutor::new()).build_http();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.recv() => {
                    info!("player listener shutting down");
                    break;
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            debug!(%peer, "accepted connection");
                            let io = TokioIo::new(stream);
                            let shared = Arc::clone(&shared);
                            let remote_base = remote_base.clone();
                            let upstream_authority = upstream_authority.clone();
                            let upstream_host = upstream_host.clone();
                            let limits = limits.clone();
                            let client = client.clone();

                            let service = service_fn(move |req: Request<Incoming>| {
                                let shared = Arc::clone(&shared);
                                let remote_base = remote_base.clone();
                                let upstream_authority = upstream_authority.clone();
                                let upstream_host = upstream_host.clone();
                                let limits = limits.clone();
                                let client = client.clone();
                                async move {
                                    Ok::<_, Infallible>(
                                        dispatch(
                                            &shared,
                                            &client,
                                            &remote_base,
                                            &upstream_authority,
                                            &upstream_host,
                                            &limits,
                                            req,
                                        )
                                        .await,
                                    )
                                }
                            });

                            // Serve this connection to completion before accepting the
                            // next one: there is no parallelism among requests (§5).
                            // Keep-alive is off so a connection closes after its one
                            // request instead of leaving this task parked waiting on
                            // a client that never sends another one -- otherwise a
                            // lingering idle connection could stall `close()`.
                            if let Err(e) = hyper::server::conn::http1::Builder::new()
                                .keep_alive(false)
                                .serve_connection(io, service)
                                .await
                            {
                                warn!(error = %e, "connection error");
                            }
                        }
                        Err(e) => {
                            error!(error = %e, "accept error");
                        }
                    }
                }
            }
        }
    })
}

/// Dispatch one accepted request according to current mode, holding
/// `shared`'s lock across the whole body so the Record cursor and the
/// state field advance atomically with the request-response it describes.
async fn dispatch(
    shared: &Arc<Mutex<Shared>>,
    client: &Client<HttpConnector, Full<Bytes>>,
    remote_base: &str,
    upstream_authority: &str,
    upstream_host: &str,
    limits: &LimitsConfig,
    req: Request<Incoming>,
) -> Response<Full<Bytes>> {
    let path_and_query = path_and_query_of(&req);
    let mut guard = shared.lock().await;
    let state = guard.state;

    let outcome = if req.headers().len() > limits.max_headers {
        Err(PlayerError::PayloadTooLarge(format!(
            "request has {} headers, limit is {}",
            req.headers().len(),
            limits.max_headers
        )))
    } else {
        match state {
            State::Playing => {
                handle_playing(&mut guard, remote_base, upstream_authority, upstream_host, limits, req)
                    .await
            }
            State::Recording => {
                handle_recording(
                    &mut guard,
                    client,
                    remote_base,
                    upstream_authority,
                    upstream_host,
                    limits,
                    req,
                )
                .await
            }
            State::Idle | State::Off => Err(PlayerError::InvalidState(
                "Player is not in operation".to_string(),
            )),
        }
    };

    match outcome {
        Ok(response) => response,
        Err(err) => {
            let code = err.response_code(state.label());
            warn!(error = %err, path = %path_and_query, code, "player error");
            player_error_response(code, &path_and_query, Some(&err.to_string()))
        }
    }
}

async fn handle_playing(
    guard: &mut Shared,
    remote_base: &str,
    upstream_authority: &str,
    upstream_host: &str,
    limits: &LimitsConfig,
    req: Request<Incoming>,
) -> Result<Response<Full<Bytes>>> {
    let path_and_query = path_and_query_of(&req);
    let live = build_mock_request(remote_base, upstream_authority, upstream_host, limits, req).await?;

    let record = guard
        .current
        .as_mut()
        .expect("Playing state implies a current record");
    let exchange = record.read()?.clone();

    if requests_match(&live, &exchange.request) {
        exchange.response.to_outbound()
    } else {
        Ok(player_error_response(454, &path_and_query, None))
    }
}

async fn handle_recording(
    guard: &mut Shared,
    client: &Client<HttpConnector, Full<Bytes>>,
    remote_base: &str,
    upstream_authority: &str,
    upstream_host: &str,
    limits: &LimitsConfig,
    req: Request<Incoming>,
) -> Result<Response<Full<Bytes>>> {
    let live = build_mock_request(remote_base, upstream_authority, upstream_host, limits, req).await?;
    let outbound = live.to_outbound()?;

    // Only a transport-level failure (no response object at all) aborts the
    // record; an HTTP-level error status still arrives as `Ok` and is
    // captured like any other response (§4.4, design note on `WebException`).
    let upstream_response = client
        .request(outbound)
        .await
        .map_err(PlayerError::Client)?;

    if upstream_response.headers().len() > limits.max_headers {
        return Err(PlayerError::PayloadTooLarge(format!(
            "response has {} headers, limit is {}",
            upstream_response.headers().len(),
            limits.max_headers
        )));
    }

    let mock_response = build_mock_response(upstream_response, limits).await?;
    let outbound_response = mock_response.to_outbound()?;

    let record = guard
        .current
        .as_mut()
        .expect("Recording state implies a current record");
    record.write(Exchange {
        request: live,
        response: mock_response,
    });

    Ok(outbound_response)
}

async fn build_mock_request(
    remote_base: &str,
    upstream_authority: &str,
    upstream_host: &str,
    limits: &LimitsConfig,
    req: Request<Incoming>,
) -> Result<MockRequest> {
    let method = req.method().as_str().to_string();
    let path_and_query = path_and_query_of(&req);
    check_declared_body_size(req.headers(), limits)?;

    // Cookie is pulled out into `cookies` below the same way Set-Cookie is on
    // the response side, so a literal-text comparison of `headers` never
    // rides along on top of the structural `cookies_match`.
    let headers: Vec<(String, String)> = req
        .headers()
        .iter()
        .filter(|(name, _)| *name != hyper::header::COOKIE)
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                value.to_str().unwrap_or_default().to_string(),
            )
        })
        .collect();

    let cookies: Vec<Cookie> = req
        .headers()
        .get_all(hyper::header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(Cookie::parse_request_header)
        .collect();

    let body = req
        .into_body()
        .collect()
        .await
        .map_err(|e| PlayerError::UpstreamFailure(format!("failed to read request body: {e}")))?
        .to_bytes();
    if body.len() > limits.max_body_size {
        return Err(PlayerError::PayloadTooLarge(format!(
            "request body is {} bytes, limit is {}",
            body.len(),
            limits.max_body_size
        )));
    }
    let content = if body.is_empty() {
        None
    } else {
        Some(String::from_utf8_lossy(&body).into_owned())
    };

    Ok(MockRequest::from_live(
        &method,
        remote_base,
        &path_and_query,
        upstream_authority,
        upstream_host,
        &headers,
        &cookies,
        content,
    ))
}

async fn build_mock_response(resp: Response<Incoming>, limits: &LimitsConfig) -> Result<MockResponse> {
    check_declared_body_size(resp.headers(), limits)?;

    let status_code = resp.status().as_u16();
    // Prefer the upstream's literal reason phrase over the canonical one for
    // the status code: a non-standard description must survive the round
    // trip (§3, §8 invariant 2), not get normalized away.
    let status_description = resp
        .extensions()
        .get::<ReasonPhrase>()
        .and_then(|r| std::str::from_utf8(r).ok())
        .map(str::to_string)
        .unwrap_or_else(|| resp.status().canonical_reason().unwrap_or("").to_string());

    let headers: Vec<(String, String)> = resp
        .headers()
        .iter()
        .filter(|(name, _)| *name != hyper::header::SET_COOKIE)
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                value.to_str().unwrap_or_default().to_string(),
            )
        })
        .collect();

    let cookies: Vec<Cookie> = resp
        .headers()
        .get_all(hyper::header::SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .filter_map(Cookie::parse_set_cookie)
        .collect();

    let body = resp
        .into_body()
        .collect()
        .await
        .map_err(|e| PlayerError::UpstreamFailure(format!("failed to read response body: {e}")))?
        .to_bytes();
    if body.len() > limits.max_body_size {
        return Err(PlayerError::PayloadTooLarge(format!(
            "response body is {} bytes, limit is {}",
            body.len(),
            limits.max_body_size
        )));
    }

    // The source gates body capture on a positive Content-Length; a buffered
    // read makes that distinction moot here, so an empty body is simply
    // absent regardless of which header announced it (deviation noted in
    // DESIGN.md).
    let content = if body.is_empty() {
        None
    } else {
        Some(String::from_utf8_lossy(&body).into_owned())
    };

    Ok(MockResponse::from_live(
        status_code,
        &status_description,
        &headers,
        &cookies,
        content,
    ))
}

fn path_and_query_of(req: &Request<Incoming>) -> String {
    req.uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string())
}

/// Fail fast on a declared `Content-Length` over the limit, before buffering
/// the body; the actual byte count is still checked again after `collect()`
/// for bodies that omit `Content-Length` (e.g. chunked transfer-encoding).
fn check_declared_body_size(headers: &hyper::HeaderMap, limits: &LimitsConfig) -> Result<()> {
    let declared = headers
        .get(hyper::header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok());

    match declared {
        Some(len) if len > limits.max_body_size => Err(PlayerError::PayloadTooLarge(format!(
            "declared body is {len} bytes, limit is {}",
            limits.max_body_size
        ))),
        _ => Ok(()),
    }
}

/// Build a Player-error response (§6/§7): the diagnostic message is both the
/// body text and, where the wire allows it, the literal reason phrase.
fn player_error_response(
    code: u16,
    path_and_query: &str,
    detail: Option<&str>,
) -> Response<Full<Bytes>> {
    let description = match code {
        454 => "Player request mismatch",
        551 => "PlayException",
        552 => "RecordException",
        _ => "Exception",
    };

    let body = match detail {
        Some(detail) => format!("{description}: {path_and_query} ({detail})"),
        None => format!("{description}: {path_and_query}"),
    };

    let mut response = Response::builder()
        .status(StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR))
        .body(Full::new(Bytes::from(body)))
        .expect("player-error response always builds");

    if let Ok(reason) = ReasonPhrase::from_bytes(description.as_bytes()) {
        response.extensions_mut().insert(reason);
    }

    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_rejects_empty_addresses() {
        assert!(matches!(
            Player::new("", "https://api.example.com"),
            Err(PlayerError::InvalidArgument(_))
        ));
        assert!(matches!(
            Player::new("http://127.0.0.1:0/", ""),
            Err(PlayerError::InvalidArgument(_))
        ));
    }

    #[test]
    fn new_appends_trailing_slash() {
        let player = Player::new("http://127.0.0.1:0", "https://api.example.com").unwrap();
        assert_eq!(player.base_address(), "http://127.0.0.1:0/");
    }

    #[tokio::test]
    async fn play_before_start_is_invalid_state() {
        let player = Player::new("http://127.0.0.1:0/", "https://api.example.com").unwrap();
        let err = player.play("r1").await.unwrap_err();
        assert!(matches!(err, PlayerError::InvalidState(_)));
    }

    #[tokio::test]
    async fn play_without_cassette_fails() {
        let player = Player::new("http://127.0.0.1:0/", "https://api.example.com").unwrap();
        player.start().await.unwrap();
        let err = player.play("r1").await.unwrap_err();
        assert!(matches!(err, PlayerError::CassetteNotLoaded));
        player.close().await.unwrap();
    }

    #[tokio::test]
    async fn record_then_stop_then_close_round_trips_state() {
        let dir = tempfile::TempDir::new().unwrap();
        let cassette = Cassette::open(dir.path().join("c.json")).unwrap();

        let player = Player::new("http://127.0.0.1:0/", "https://api.example.com").unwrap();
        player.start().await.unwrap();
        player.load(cassette).await;
        player.record("r1").await.unwrap();
        assert_eq!(player.state().await, State::Recording);

        player.stop().await.unwrap();
        assert_eq!(player.state().await, State::Idle);

        player.close().await.unwrap();
        assert_eq!(player.state().await, State::Off);
    }
}
