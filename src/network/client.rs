//! Balance Stream Client
//!
//! Consumer side of `GET /api/balance/stream`.
//!
//! ```text
//!   connect ──ok──► read frames ──closed/idle──► Disconnected ─┐
//!      ▲                                                        │
//!      └────────────── backoff(attempt) ◄───────────────────────┘
//!                          │ attempts exhausted
//!                          ▼
//!                   poll GET /api/balance
//! ```
//!
//! Heartbeat comment frames only refresh the idle timer. A connection that
//! delivered its response head resets the attempt counter.

use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::network::http::{find_head_end, percent_encode, BalanceResponse};
use crate::network::publisher::{BalanceSnapshot, StreamEvent};

/// Capped exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    /// Delay before the first retry.
    pub initial: Duration,
    /// Upper bound on any delay.
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(30),
        }
    }
}

impl Backoff {
    /// Delay after `attempt` consecutive failures (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        self.initial.saturating_mul(factor).min(self.max)
    }
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct StreamClientConfig {
    /// Server `host:port`.
    pub addr: String,
    /// User to follow.
    pub user_id: String,
    /// Bearer token, when the server checks tokens.
    pub token: Option<String>,
    /// Reconnect delays.
    pub backoff: Backoff,
    /// Consecutive failed connects before falling back to polling.
    pub max_attempts: u32,
    /// Silence after which a stream counts as dropped.
    pub idle_timeout: Duration,
    /// Polling period once on the fallback.
    pub poll_interval: Duration,
}

impl StreamClientConfig {
    /// Defaults for following `user_id` on `addr`.
    pub fn new(addr: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            user_id: user_id.into(),
            token: None,
            backoff: Backoff::default(),
            max_attempts: 5,
            idle_timeout: Duration::from_secs(45),
            poll_interval: Duration::from_secs(5),
        }
    }
}

/// Stream failures.
#[derive(Debug, Error)]
pub enum StreamError {
    /// The stream ended or went silent.
    #[error("stream disconnected")]
    Disconnected,
    /// Could not reach the server.
    #[error("connect failed: {0}")]
    Connect(#[source] std::io::Error),
    /// Server answered with a non-200 status.
    #[error("server returned status {0}")]
    Status(u16),
    /// Response was not HTTP or not the expected JSON.
    #[error("bad response: {0}")]
    BadResponse(String),
}

/// What the client reports to its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// Stream established.
    Connected,
    /// Fresh balance, pushed or polled.
    Balance(BalanceSnapshot),
    /// Stream lost; a reconnect follows after the given delay.
    Disconnected {
        /// Consecutive failures so far.
        attempt: u32,
        /// Delay before the next try.
        retry_in: Duration,
    },
    /// Reconnects exhausted; polling from now on.
    Polling,
}

/// One parsed server-sent-events frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseFrame {
    /// Joined `data:` lines.
    Data(String),
    /// Comment-only frame (heartbeat).
    Comment,
}

/// Incremental server-sent-events parser.
///
/// Bytes are buffered until a frame is complete, so a character split
/// across reads decodes intact.
#[derive(Debug, Default)]
pub struct SseParser {
    buf: Vec<u8>,
}

/// End of the first complete frame: (block length, bytes consumed).
fn frame_end(buf: &[u8]) -> Option<(usize, usize)> {
    (0..buf.len()).find_map(|i| {
        let rest = &buf[i..];
        if rest.starts_with(b"\n\n") {
            Some((i, i + 2))
        } else if rest.starts_with(b"\r\n\r\n") {
            Some((i, i + 4))
        } else {
            None
        }
    })
}

impl SseParser {
    /// Feed raw bytes and return every frame they complete.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<SseFrame> {
        self.buf.extend_from_slice(bytes);

        let mut frames = Vec::new();
        while let Some((end, consumed)) = frame_end(&self.buf) {
            let raw: Vec<u8> = self.buf.drain(..consumed).collect();
            let block = String::from_utf8_lossy(&raw[..end]);
            let mut data: Vec<&str> = Vec::new();
            for line in block.lines() {
                if let Some(value) = line.strip_prefix("data:") {
                    data.push(value.strip_prefix(' ').unwrap_or(value));
                }
            }
            if data.is_empty() {
                frames.push(SseFrame::Comment);
            } else {
                frames.push(SseFrame::Data(data.join("\n")));
            }
        }
        frames
    }
}

/// Follows one user's balance over SSE with reconnects and a polling fallback.
pub struct BalanceStreamClient {
    config: StreamClientConfig,
    events: mpsc::Sender<ClientEvent>,
}

impl BalanceStreamClient {
    /// Create a client reporting to `events`.
    pub fn new(config: StreamClientConfig, events: mpsc::Sender<ClientEvent>) -> Self {
        Self { config, events }
    }

    fn target(&self, path: &str) -> String {
        let mut target = format!("{}?userId={}", path, percent_encode(&self.config.user_id));
        if let Some(ref token) = self.config.token {
            target.push_str("&token=");
            target.push_str(&percent_encode(token));
        }
        target
    }

    async fn send_request(&self, path: &str) -> Result<TcpStream, StreamError> {
        let mut stream = TcpStream::connect(&self.config.addr).await.map_err(StreamError::Connect)?;
        let request = format!(
            "GET {} HTTP/1.1\r\nHost: {}\r\nAccept: */*\r\n\r\n",
            self.target(path),
            self.config.addr
        );
        stream.write_all(request.as_bytes()).await.map_err(StreamError::Connect)?;
        Ok(stream)
    }

    /// Read the response head; returns the status and any body bytes already read.
    async fn read_response_head(&self, stream: &mut TcpStream) -> Result<(u16, Vec<u8>), StreamError> {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 2048];
        let end = loop {
            let n = timeout(self.config.idle_timeout, stream.read(&mut chunk))
                .await
                .map_err(|_| StreamError::Disconnected)?
                .map_err(|_| StreamError::Disconnected)?;
            if n == 0 {
                return Err(StreamError::Disconnected);
            }
            buf.extend_from_slice(&chunk[..n]);
            if let Some(end) = find_head_end(&buf) {
                break end;
            }
        };

        let head = String::from_utf8_lossy(&buf[..end]).into_owned();
        let status = head
            .split_whitespace()
            .nth(1)
            .and_then(|s| s.parse::<u16>().ok())
            .ok_or_else(|| StreamError::BadResponse(head.lines().next().unwrap_or_default().to_string()))?;
        Ok((status, buf.split_off(end + 4)))
    }

    /// One stream session. Returns when the stream drops.
    async fn stream_once(&self) -> Result<(), StreamError> {
        let mut stream = self.send_request("/api/balance/stream").await?;
        let (status, rest) = self.read_response_head(&mut stream).await?;
        if status != 200 {
            return Err(StreamError::Status(status));
        }
        let _ = self.events.send(ClientEvent::Connected).await;
        info!(user = %self.config.user_id, "Balance stream connected");

        let mut parser = SseParser::default();
        let mut pending = parser.push(&rest);
        let mut chunk = [0u8; 4096];
        loop {
            for frame in pending.drain(..) {
                self.handle_frame(frame).await;
            }
            let n = match timeout(self.config.idle_timeout, stream.read(&mut chunk)).await {
                Ok(Ok(n)) if n > 0 => n,
                Ok(Ok(_)) | Ok(Err(_)) => return Ok(()),
                Err(_) => {
                    warn!(user = %self.config.user_id, "Balance stream idle, dropping");
                    return Ok(());
                }
            };
            pending = parser.push(&chunk[..n]);
        }
    }

    async fn handle_frame(&self, frame: SseFrame) {
        let SseFrame::Data(json) = frame else {
            return;
        };
        match serde_json::from_str::<StreamEvent>(&json) {
            Ok(StreamEvent::Balance(snapshot)) => {
                let _ = self.events.send(ClientEvent::Balance(snapshot)).await;
            }
            Ok(_) => {}
            Err(e) => debug!("Ignoring unparsable stream frame: {}", e),
        }
    }

    /// One `GET /api/balance` poll.
    pub async fn poll_once(&self) -> Result<BalanceSnapshot, StreamError> {
        let mut stream = self.send_request("/api/balance").await?;
        let (status, mut body) = self.read_response_head(&mut stream).await?;
        if status != 200 {
            return Err(StreamError::Status(status));
        }
        timeout(self.config.idle_timeout, stream.read_to_end(&mut body))
            .await
            .map_err(|_| StreamError::Disconnected)?
            .map_err(|_| StreamError::Disconnected)?;

        let response: BalanceResponse =
            serde_json::from_slice(&body).map_err(|e| StreamError::BadResponse(e.to_string()))?;
        if !response.ok {
            return Err(StreamError::BadResponse("ok=false".into()));
        }
        Ok(BalanceSnapshot {
            ton: response.ton,
            stars: response.stars,
            timestamp: Utc::now().timestamp_millis(),
            version: response.version,
        })
    }

    /// Follow the stream until `shutdown` fires or the receiver goes away.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let mut attempt = 0u32;

        while attempt < self.config.max_attempts {
            let result = tokio::select! {
                result = self.stream_once() => result,
                _ = shutdown.recv() => return,
            };
            match result {
                // A session that got a 200 counts as a fresh start
                Ok(()) => attempt = 1,
                Err(e) => {
                    debug!(user = %self.config.user_id, "Stream attempt failed: {}", e);
                    attempt += 1;
                }
            }
            if attempt >= self.config.max_attempts {
                break;
            }

            let retry_in = self.config.backoff.delay(attempt - 1);
            let event = ClientEvent::Disconnected { attempt, retry_in };
            if self.events.send(event).await.is_err() {
                return;
            }
            tokio::select! {
                _ = sleep(retry_in) => {}
                _ = shutdown.recv() => return,
            }
        }

        warn!(user = %self.config.user_id, attempts = attempt, "Stream unavailable, polling");
        if self.events.send(ClientEvent::Polling).await.is_err() {
            return;
        }
        loop {
            match self.poll_once().await {
                Ok(snapshot) => {
                    if self.events.send(ClientEvent::Balance(snapshot)).await.is_err() {
                        return;
                    }
                }
                Err(e) => debug!(user = %self.config.user_id, "Poll failed: {}", e),
            }
            tokio::select! {
                _ = sleep(self.config.poll_interval) => {}
                _ = shutdown.recv() => return,
            }
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
