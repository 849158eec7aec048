//! Model Context Protocol client.
//!
//! The pieces compose bottom-up: a [`transport::Transport`] carries
//! frames, the [`correlator::Correlator`] matches responses to
//! requests, [`retry`] wraps submissions with bounded reissue, the
//! [`initialize`] handshake negotiates a protocol version, and
//! [`client::Client`] puts a typed, capability-gated API on top.
//!
//! ```no_run
//! use std::sync::Arc;
//! use tether_client::{Client, ClientOptions, StdioServerParams, StdioTransport};
//!
//! # async fn run() -> Result<(), tether_client::ClientError> {
//! let params = StdioServerParams::new("my-mcp-server", vec!["--stdio".into()]);
//! let transport = Arc::new(StdioTransport::new(params));
//! let client = Client::connect(transport, ClientOptions::default()).await?;
//! let tools = client.list_tools(None).await?;
//! println!("{} tools", tools.tools.len());
//! client.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod correlator;
pub mod error;
pub mod initialize;
pub mod notifications;
pub mod registry;
pub mod retry;
pub mod transport;

#[cfg(test)]
pub(crate) mod test_support;

pub use client::{Client, ClientOptions};
pub use correlator::Correlator;
pub use error::{ClientError, TransientError};
pub use initialize::{SessionContext, HANDSHAKE_TIMEOUT};
pub use notifications::NotificationDispatcher;
pub use registry::{ClientRegistry, ServerConfig, ServerStatus};
pub use retry::{CancellationToken, IsRetryable, RetryPolicy};
pub use transport::{HttpTransport, SseTransport, StdioServerParams, StdioTransport, Transport};
