//! Network Layer
//!
//! WebSocket game protocol, HTTP balance API and live balance streams.
//! Nothing here decides an outcome; bets and cash-outs are forwarded to the
//! round engine as intents.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         NETWORK                             │
//! ├─────────────────────────────────────────────────────────────┤
//! │  server.rs    - WebSocket server, task wiring               │
//! │  http.rs      - /api/balance, /api/balance/stream, audit    │
//! │  publisher.rs - Per-user live balance fan-out               │
//! │  client.rs    - SSE consumer with backoff and polling       │
//! │  protocol.rs  - Message types                               │
//! │  auth.rs      - JWT identity check                          │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod auth;
pub mod client;
pub mod http;
pub mod protocol;
pub mod publisher;
pub mod server;

pub use auth::{AuthConfig, AuthError, Authenticator, TokenClaims};
pub use client::{Backoff, BalanceStreamClient, ClientEvent, StreamClientConfig, StreamError};
pub use http::{ApiServer, ApiState, HttpError};
pub use protocol::{ClientMessage, CompactCommand, ErrorCode, ServerMessage};
pub use publisher::{BalanceSnapshot, LiveUpdatePublisher, PublisherConfig, StreamEvent, Subscription};
pub use server::{GameServer, GameServerError, ServerConfig};
