//! Caller-visible error taxonomy.
//!
//! Collaborators branch on the variant, never on message text: a
//! `Retryable` initialize failure triggers re-authentication, a
//! `VersionMismatch` triggers a downgrade or an abort, and so on. The
//! one exception is [`classify_rpc_error`], which sniffs server error
//! payloads for authentication signals so that a 401 surfaced inside a
//! generic JSON-RPC error still comes back `Retryable`.

use serde_json::Value;
use tether_protocol::error_codes;
use tether_protocol::message::FrameError;

use crate::retry::IsRetryable;

#[derive(Debug, Clone, thiserror::Error)]
pub enum ClientError {
    #[error("protocol version mismatch: requested {requested}, server offered {offered}")]
    VersionMismatch { requested: String, offered: String },

    #[error("deadline exceeded")]
    Timeout,

    #[error("transient failure: {0}")]
    Retryable(#[source] TransientError),

    #[error("server error {code}: {message}")]
    NonRetryable { code: i64, message: String },

    #[error("request cancelled")]
    Cancelled,

    #[error("malformed frame: {0}")]
    Parse(String),

    #[error("server does not advertise the {0} capability")]
    CapabilityMissing(String),

    #[error("transport is closed")]
    TransportClosed,
}

/// The transient failures wrapped by [`ClientError::Retryable`].
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransientError {
    #[error("transport closed with the request in flight")]
    TransportClosed,

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("server error {code}: {message}")]
    Rpc {
        code: i64,
        message: String,
        data: Option<Value>,
    },
}

impl ClientError {
    pub(crate) fn transport(message: impl Into<String>) -> Self {
        ClientError::Retryable(TransientError::Transport(message.into()))
    }
}

impl From<FrameError> for ClientError {
    fn from(error: FrameError) -> Self {
        ClientError::Parse(error.to_string())
    }
}

impl IsRetryable for ClientError {
    fn is_retryable(&self) -> Option<String> {
        match self {
            ClientError::Retryable(inner) => Some(inner.to_string()),
            _ => None,
        }
    }
}

/// Map a JSON-RPC error response to a caller-visible kind.
///
/// Codes in the implementation-defined range are transient by default.
/// Anything that smells like an expired or missing credential is also
/// transient, so callers can refresh and resubmit.
pub(crate) fn classify_rpc_error(code: i64, message: &str, data: Option<&Value>) -> ClientError {
    if looks_like_auth_failure(message, data) || error_codes::is_server_defined(code) {
        return ClientError::Retryable(TransientError::Rpc {
            code,
            message: message.to_string(),
            data: data.cloned(),
        });
    }
    ClientError::NonRetryable {
        code,
        message: message.to_string(),
    }
}

fn looks_like_auth_failure(message: &str, data: Option<&Value>) -> bool {
    let mut haystack = message.to_lowercase();
    if let Some(data) = data {
        haystack.push(' ');
        haystack.push_str(&data.to_string().to_lowercase());
    }
    haystack.contains("401")
        || haystack.contains("unauthorized")
        || haystack.contains("invalid_token")
}
