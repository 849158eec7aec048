//! Configuration loader for MCP server launch parameters.
//!
//! Reads the conventional `mcpServers` document:
//!
//! ```jsonc
//! {
//!   "mcpServers": {
//!     "files": {
//!       "command": "mcp-files",
//!       "args": ["--root", "."],
//!       "env": { "TOKEN": "${FILES_TOKEN}" },
//!       "timeout": 30
//!     }
//!   }
//! }
//! ```
//!
//! Comments and trailing commas are tolerated. Values are handed to the
//! client verbatim; `${NAME}` references in `env` are resolved by the
//! stdio transport at spawn time, not here.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use jsonc_parser::{parse_to_serde_value, ParseOptions};
use serde::{Deserialize, Serialize};
use tracing::debug;

use tether_client::StdioServerParams;

// ---------------------------------------------------------------------------
// Document shapes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct McpServersConfig {
    #[serde(default, rename = "mcpServers")]
    pub mcp_servers: HashMap<String, ServerEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerEntry {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<HashMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
    /// Per-server request timeout, seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disabled: Option<bool>,
}

impl ServerEntry {
    pub fn is_disabled(&self) -> bool {
        self.disabled.unwrap_or(false)
    }

    pub fn launch_params(&self) -> StdioServerParams {
        StdioServerParams {
            command: self.command.clone(),
            args: self.args.clone(),
            env: self.env.clone(),
            cwd: self.cwd.clone(),
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout.map(Duration::from_secs_f64)
    }
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

pub fn parse_config(content: &str) -> Result<McpServersConfig> {
    let options = ParseOptions {
        allow_trailing_commas: true,
        ..Default::default()
    };
    let value = parse_to_serde_value(content, &options)
        .with_context(|| "failed to parse config JSONC")?
        .context("config content is empty")?;
    serde_json::from_value(value).with_context(|| "failed to deserialize config document")
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<McpServersConfig> {
    let path = path.as_ref();
    debug!(path = %path.display(), "loading config");
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

/// Launch parameters and optional timeout for one named server.
pub fn load_server<P: AsRef<Path>>(
    path: P,
    server_name: &str,
) -> Result<(StdioServerParams, Option<Duration>)> {
    let config = load_config(path)?;
    let entry = config
        .mcp_servers
        .get(server_name)
        .with_context(|| format!("server {server_name:?} not found in configuration"))?;
    debug!(
        server = server_name,
        command = %entry.command,
        "resolved server config"
    );
    Ok((entry.launch_params(), entry.timeout()))
}
