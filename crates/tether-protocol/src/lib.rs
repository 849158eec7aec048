//! Wire-level types for the Model Context Protocol.
//!
//! This crate is transport-agnostic: it defines the JSON-RPC 2.0 frame
//! union, the protocol version table, capability sets, and the typed
//! parameter/result shapes for the standard MCP operations. Everything
//! here serializes with `serde` and tolerates unknown fields so newer
//! servers keep working against older clients.

pub mod capabilities;
pub mod error_codes;
pub mod message;
pub mod types;
pub mod version;

pub use capabilities::{ClientCapabilities, ServerCapabilities};
pub use message::{
    ErrorObject, FrameError, JsonRpcErrorResponse, JsonRpcMessage, JsonRpcNotification,
    JsonRpcRequest, JsonRpcResponse, RequestId,
};
pub use version::{LATEST_PROTOCOL_VERSION, SUPPORTED_PROTOCOL_VERSIONS};
