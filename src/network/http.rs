//! HTTP API
//!
//! Minimal HTTP/1.1 listener for the balance and audit endpoints.
//!
//! | Route                     | Response                                  |
//! |---------------------------|-------------------------------------------|
//! | `GET /api/balance`        | `{ok, ton, stars, version}`               |
//! | `GET /api/balance/stream` | `text/event-stream` of balance snapshots  |
//! | `GET /api/round`          | current round snapshot                    |
//! | `GET /api/audit[?nonce]`  | revealed seed records                     |
//!
//! One request per connection. Only the request head is read; bodies are
//! never needed. Identity comes from `?userId=` plus a bearer token
//! (`Authorization` header, or `?token=` for `EventSource` clients).

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::core::amount::to_float;
use crate::fair::seed::SeedManager;
use crate::ledger::balance::UserId;
use crate::ledger::book::BalanceLedger;
use crate::network::auth::{AuthError, Authenticator};
use crate::network::publisher::LiveUpdatePublisher;
use crate::round::engine::RoundHandle;

/// Largest accepted request head.
pub const MAX_HEAD_BYTES: usize = 8 * 1024;

/// Time allowed for a client to send its request head.
pub const HEAD_TIMEOUT: Duration = Duration::from_secs(10);

const SSE_HEAD: &str = "HTTP/1.1 200 OK\r\n\
    Content-Type: text/event-stream\r\n\
    Cache-Control: no-cache\r\n\
    Connection: keep-alive\r\n\
    Access-Control-Allow-Origin: *\r\n\r\n";

/// HTTP layer errors.
#[derive(Debug, Error)]
pub enum HttpError {
    /// Socket failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Request head exceeded [`MAX_HEAD_BYTES`].
    #[error("request head too large")]
    HeadTooLarge,
    /// Client closed or stalled before finishing the head.
    #[error("incomplete request")]
    Incomplete,
    /// Unparsable request line or header.
    #[error("malformed request: {0}")]
    Malformed(String),
}

/// Parsed request head.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Method, as sent.
    pub method: String,
    /// Decoded path without the query.
    pub path: String,
    /// Decoded query parameters.
    pub query: BTreeMap<String, String>,
    /// Headers keyed by lowercase name.
    pub headers: BTreeMap<String, String>,
}

impl Request {
    /// Parse a request head (request line plus headers).
    pub fn parse(head: &str) -> Result<Self, HttpError> {
        let mut lines = head.split("\r\n");
        let request_line = lines.next().unwrap_or_default();
        let mut parts = request_line.split_whitespace();
        let (Some(method), Some(target), Some(version)) = (parts.next(), parts.next(), parts.next()) else {
            return Err(HttpError::Malformed(format!("request line {:?}", request_line)));
        };
        if !version.starts_with("HTTP/1.") {
            return Err(HttpError::Malformed(format!("version {:?}", version)));
        }

        let (path, query) = match target.split_once('?') {
            Some((path, query)) => (path, parse_query(query)),
            None => (target, BTreeMap::new()),
        };

        let mut headers = BTreeMap::new();
        for line in lines.take_while(|l| !l.is_empty()) {
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| HttpError::Malformed(format!("header {:?}", line)))?;
            headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
        }

        Ok(Self {
            method: method.to_string(),
            path: percent_decode(path),
            query,
            headers,
        })
    }

    /// Query parameter by name.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.query.get(name).map(String::as_str)
    }

    /// Bearer token from `Authorization`, falling back to `?token=`.
    pub fn bearer_token(&self) -> Option<&str> {
        self.headers
            .get("authorization")
            .and_then(|v| v.strip_prefix("Bearer ").or_else(|| v.strip_prefix("bearer ")))
            .map(str::trim)
            .or_else(|| self.param("token"))
    }
}

fn parse_query(query: &str) -> BTreeMap<String, String> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) => (percent_decode(k), percent_decode(v)),
            None => (percent_decode(pair), String::new()),
        })
        .collect()
}

/// Decode `%XX` escapes and `+`. Invalid escapes pass through.
pub fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' => match bytes.get(i + 1..i + 3).and_then(|h| hex::decode(h).ok()) {
                Some(decoded) => {
                    out.extend(decoded);
                    i += 3;
                }
                None => {
                    out.push(b'%');
                    i += 1;
                }
            },
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Escape everything but unreserved characters for a query component.
pub fn percent_encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for &b in s.as_bytes() {
        if b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b'~') {
            out.push(b as char);
        } else {
            out.push('%');
            out.push_str(&hex::encode_upper([b]));
        }
    }
    out
}

/// Read a request head, up to the blank line.
pub async fn read_head<R: AsyncRead + Unpin>(reader: &mut R) -> Result<String, HttpError> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Err(HttpError::Incomplete);
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(end) = find_head_end(&buf) {
            buf.truncate(end);
            return String::from_utf8(buf).map_err(|_| HttpError::Malformed("non-UTF-8 head".into()));
        }
        if buf.len() > MAX_HEAD_BYTES {
            return Err(HttpError::HeadTooLarge);
        }
    }
}

/// Offset of the `\r\n\r\n` terminator, if present.
pub fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

/// `GET /api/balance` body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceResponse {
    /// Always true on success.
    pub ok: bool,
    /// TON balance.
    pub ton: f64,
    /// Stars balance.
    pub stars: f64,
    /// Ledger version.
    #[serde(default)]
    pub version: u64,
}

/// What a route produced.
#[derive(Debug)]
pub enum Reply {
    /// A complete JSON response.
    Json(u16, Value),
    /// Switch the connection to an event stream for this user.
    Stream(UserId),
}

impl Reply {
    fn error(status: u16, code: &str, message: impl Into<String>) -> Self {
        Reply::Json(status, json!({ "ok": false, "error": code, "message": message.into() }))
    }

    fn auth_error(err: AuthError) -> Self {
        let (status, code) = match err {
            AuthError::MissingUserId => (400, "InvalidInput"),
            AuthError::UserMismatch => (403, "UserMismatch"),
            AuthError::Expired => (401, "TokenExpired"),
            AuthError::MissingToken => (401, "NotAuthenticated"),
            _ => (401, "InvalidToken"),
        };
        Reply::error(status, code, err.to_string())
    }
}

/// Everything the routes read from.
pub struct ApiState {
    /// Balances.
    pub ledger: Arc<BalanceLedger>,
    /// Per-user live streams.
    pub publisher: Arc<LiveUpdatePublisher>,
    /// Round engine handle.
    pub rounds: RoundHandle,
    /// Seed audit log.
    pub seeds: Arc<SeedManager>,
    /// Identity check.
    pub auth: Arc<Authenticator>,
}

/// Resolve a request to a reply.
pub async fn route(state: &ApiState, req: &Request) -> Reply {
    if req.method != "GET" {
        return Reply::error(405, "MethodNotAllowed", format!("{} not supported", req.method));
    }

    match req.path.trim_end_matches('/') {
        "/api/balance" => match state.auth.authorize(req.param("userId"), req.bearer_token()) {
            Ok(user_id) => {
                let balance = state.ledger.read(&user_id).await;
                let body = BalanceResponse {
                    ok: true,
                    ton: to_float(balance.ton),
                    stars: to_float(balance.stars),
                    version: balance.version,
                };
                Reply::Json(200, json!(body))
            }
            Err(e) => Reply::auth_error(e),
        },
        "/api/balance/stream" => match state.auth.authorize(req.param("userId"), req.bearer_token()) {
            Ok(user_id) => Reply::Stream(user_id),
            Err(e) => Reply::auth_error(e),
        },
        "/api/round" => match state.rounds.snapshot() {
            Some(snapshot) => Reply::Json(200, json!({ "ok": true, "round": snapshot })),
            None => Reply::error(503, "NoRound", "no round has started"),
        },
        "/api/audit" => match req.param("nonce") {
            Some(raw) => match raw.parse::<u64>() {
                Ok(nonce) => match state.seeds.audit_record(nonce).await {
                    Some(record) => Reply::Json(200, json!({ "ok": true, "record": record })),
                    None => Reply::error(404, "NotRevealed", format!("nonce {} not revealed", nonce)),
                },
                Err(_) => Reply::error(400, "InvalidInput", "nonce must be an integer"),
            },
            None => {
                let records = state.seeds.audit_log().await;
                let commitment = state.seeds.current_commitment().await;
                Reply::Json(200, json!({ "ok": true, "commitment": commitment, "records": records }))
            }
        },
        _ => Reply::error(404, "NotFound", format!("no route for {}", req.path)),
    }
}

fn status_text(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        413 => "Payload Too Large",
        503 => "Service Unavailable",
        _ => "Internal Server Error",
    }
}

/// Write a complete JSON response.
pub async fn write_json<W: AsyncWrite + Unpin>(writer: &mut W, status: u16, body: &Value) -> std::io::Result<()> {
    let body = body.to_string();
    let head = format!(
        "HTTP/1.1 {} {}\r\n\
         Content-Type: application/json\r\n\
         Content-Length: {}\r\n\
         Access-Control-Allow-Origin: *\r\n\
         Connection: close\r\n\r\n",
        status,
        status_text(status),
        body.len()
    );
    writer.write_all(head.as_bytes()).await?;
    writer.write_all(body.as_bytes()).await?;
    writer.flush().await
}

/// The HTTP listener.
pub struct ApiServer {
    state: Arc<ApiState>,
    shutdown_tx: broadcast::Sender<()>,
}

impl ApiServer {
    /// Create a listener over `state`. Open streams end when `shutdown_tx` fires.
    pub fn new(state: Arc<ApiState>, shutdown_tx: broadcast::Sender<()>) -> Self {
        Self { state, shutdown_tx }
    }

    /// Accept connections until shutdown.
    pub async fn run(&self, listener: TcpListener) -> Result<(), HttpError> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        info!("HTTP API listening on {}", listener.local_addr()?);

        loop {
            tokio::select! {
                result = listener.accept() => match result {
                    Ok((stream, addr)) => self.handle_connection(stream, addr),
                    Err(e) => error!("HTTP accept error: {}", e),
                },
                _ = shutdown_rx.recv() => {
                    info!("HTTP API shutting down");
                    break;
                }
            }
        }
        Ok(())
    }

    fn handle_connection(&self, mut stream: TcpStream, addr: SocketAddr) {
        let state = self.state.clone();
        let shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let head = match tokio::time::timeout(HEAD_TIMEOUT, read_head(&mut stream)).await {
                Ok(Ok(head)) => head,
                Ok(Err(HttpError::HeadTooLarge)) => {
                    let _ = write_json(&mut stream, 413, &json!({ "ok": false, "error": "HeadTooLarge" })).await;
                    return;
                }
                Ok(Err(e)) => {
                    debug!("Bad request from {}: {}", addr, e);
                    return;
                }
                Err(_) => {
                    debug!("Request head timeout from {}", addr);
                    return;
                }
            };

            let req = match Request::parse(&head) {
                Ok(req) => req,
                Err(e) => {
                    let _ = write_json(&mut stream, 400, &json!({ "ok": false, "error": e.to_string() })).await;
                    return;
                }
            };
            debug!(method = %req.method, path = %req.path, "HTTP request from {}", addr);

            let result = match route(&state, &req).await {
                Reply::Json(status, body) => write_json(&mut stream, status, &body).await,
                Reply::Stream(user_id) => stream_balance(stream, &state, user_id, shutdown_rx).await,
            };
            if let Err(e) = result {
                debug!("HTTP connection {} ended: {}", addr, e);
            }
        });
    }
}

/// Pump a user's live updates as server-sent events until either side closes.
async fn stream_balance(
    mut stream: TcpStream,
    state: &ApiState,
    user_id: UserId,
    mut shutdown: broadcast::Receiver<()>,
) -> std::io::Result<()> {
    stream.write_all(SSE_HEAD.as_bytes()).await?;
    let mut sub = state.publisher.subscribe(user_id.clone()).await;
    info!(user = %user_id, "Balance stream opened");

    let result = loop {
        tokio::select! {
            event = sub.events.recv() => match event {
                Some(event) => {
                    if let Err(e) = stream.write_all(event.to_sse_frame().as_bytes()).await {
                        break Err(e);
                    }
                }
                None => break Ok(()),
            },
            _ = shutdown.recv() => break Ok(()),
        }
    };

    state.publisher.unsubscribe(&user_id, sub.id).await;
    if result.is_err() {
        warn!(user = %user_id, "Balance stream dropped");
    } else {
        info!(user = %user_id, "Balance stream closed");
    }
    result
}

// =============================================================================
// TESTS
// =============================================================================
