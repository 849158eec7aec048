//! `initialize` handshake shapes.

use serde::{Deserialize, Serialize};

use super::Implementation;
use crate::capabilities::{ClientCapabilities, ServerCapabilities};
use crate::version::LATEST_PROTOCOL_VERSION;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    pub protocol_version: String,
    pub client_info: Implementation,
    pub capabilities: ClientCapabilities,
}

impl Default for InitializeParams {
    fn default() -> Self {
        Self {
            protocol_version: LATEST_PROTOCOL_VERSION.to_string(),
            client_info: Implementation::new("tether", env!("CARGO_PKG_VERSION")),
            capabilities: ClientCapabilities::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    pub protocol_version: String,
    pub server_info: Implementation,
    pub capabilities: ServerCapabilities,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}
