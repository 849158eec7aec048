//! Duplex framed-message transports.
//!
//! A transport moves one [`JsonRpcMessage`] at a time in each direction.
//! Lifecycle is three one-way states: constructed handles are inert
//! (*Unopened*, parameter capture only), `open()` allocates every
//! channel and task (*Open*), and `close()` tears them down (*Closed*,
//! idempotent). Allocating runtime primitives at construction time is
//! forbidden: a handle built while another scope on the same runtime is
//! mid-poll must stay inert until it is opened.

pub mod http;
pub mod sse;
pub mod stdio;

use async_trait::async_trait;
use tether_protocol::message::JsonRpcMessage;

use crate::error::ClientError;

pub use http::HttpTransport;
pub use sse::SseTransport;
pub use stdio::{StdioServerParams, StdioTransport};

#[async_trait]
pub trait Transport: Send + Sync {
    /// Transition Unopened -> Open: connect, spawn I/O tasks, allocate
    /// channels. A no-op when already open; fails once closed.
    async fn open(&self) -> Result<(), ClientError>;

    /// Queue one frame for delivery. Frames are written in call order.
    async fn send(&self, message: &JsonRpcMessage) -> Result<(), ClientError>;

    /// Next inbound frame, or `None` once the peer is gone.
    async fn receive(&self) -> Result<Option<JsonRpcMessage>, ClientError>;

    /// Transition to Closed, releasing the connection and all tasks.
    /// Safe to call more than once, and on every exit path.
    async fn close(&self) -> Result<(), ClientError>;
}

/// Observable transport lifecycle. Transitions are one-way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Lifecycle {
    Unopened,
    Open,
    Closed,
}
