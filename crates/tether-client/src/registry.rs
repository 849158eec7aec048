//! Named multi-server management.
//!
//! Tracks per-server status independently of whether a connection
//! exists, keeps a short event log per server, and remembers connect
//! configs so a server can be restarted in place.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::client::{Client, ClientOptions};
use crate::error::ClientError;
use crate::retry::RetryPolicy;
use crate::transport::stdio::{StdioServerParams, StdioTransport};

// ---------------------------------------------------------------------------
// ServerStatus
// ---------------------------------------------------------------------------

/// Connection status of a configured server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ServerStatus {
    Connected,
    Disabled,
    Failed { error: String },
}

impl ServerStatus {
    pub fn is_connected(&self) -> bool {
        matches!(self, ServerStatus::Connected)
    }
}

impl std::fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerStatus::Connected => write!(f, "connected"),
            ServerStatus::Disabled => write!(f, "disabled"),
            ServerStatus::Failed { error } => write!(f, "failed: {error}"),
        }
    }
}

// ---------------------------------------------------------------------------
// ServerConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub name: String,
    pub params: StdioServerParams,
    /// Per-request deadline override, milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

// ---------------------------------------------------------------------------
// ClientRegistry
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct ClientRegistry {
    clients: RwLock<HashMap<String, Arc<Client>>>,
    /// Per-server status, including servers that failed to connect.
    /// Entries here may not have a corresponding client.
    statuses: RwLock<HashMap<String, ServerStatus>>,
    configs: RwLock<HashMap<String, ServerConfig>>,
    logs: RwLock<HashMap<String, Vec<String>>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // -- Status helpers ------------------------------------------------------

    pub async fn set_status(&self, name: &str, status: ServerStatus) {
        self.statuses.write().await.insert(name.to_string(), status);
    }

    pub async fn get_status(&self, name: &str) -> Option<ServerStatus> {
        self.statuses.read().await.get(name).cloned()
    }

    /// All configured servers with their current status, connected or
    /// not.
    pub async fn list_with_status(&self) -> Vec<(String, ServerStatus)> {
        self.statuses
            .read()
            .await
            .iter()
            .map(|(name, status)| (name.clone(), status.clone()))
            .collect()
    }

    async fn log_event(&self, name: &str, message: impl Into<String>) {
        let line = format!("[{}] {}", Utc::now().to_rfc3339(), message.into());
        self.logs
            .write()
            .await
            .entry(name.to_string())
            .or_default()
            .push(line);
    }

    pub async fn get_logs(&self, name: &str) -> Vec<String> {
        self.logs
            .read()
            .await
            .get(name)
            .cloned()
            .unwrap_or_default()
    }

    // -- Client management ---------------------------------------------------

    /// Connect a stdio server under its configured name.
    pub async fn add_stdio(&self, config: ServerConfig) -> Result<Arc<Client>, ClientError> {
        let name = config.name.clone();
        self.configs
            .write()
            .await
            .insert(name.clone(), config.clone());
        self.log_event(&name, "Connecting via stdio").await;

        let mut options = ClientOptions::default();
        if let Some(timeout_ms) = config.timeout_ms {
            options.retry = RetryPolicy {
                deadline: Duration::from_millis(timeout_ms),
                ..options.retry
            };
        }

        let transport = Arc::new(StdioTransport::new(config.params));
        match Client::connect(transport, options).await {
            Ok(client) => {
                let client = Arc::new(client);
                self.set_status(&name, ServerStatus::Connected).await;
                self.clients.write().await.insert(name.clone(), client.clone());
                self.log_event(&name, "Connected").await;
                Ok(client)
            }
            Err(error) => {
                self.set_status(
                    &name,
                    ServerStatus::Failed {
                        error: error.to_string(),
                    },
                )
                .await;
                self.log_event(&name, format!("Connect failed: {error}"))
                    .await;
                Err(error)
            }
        }
    }

    pub async fn get(&self, name: &str) -> Option<Arc<Client>> {
        self.clients.read().await.get(name).cloned()
    }

    pub async fn list(&self) -> Vec<(String, Arc<Client>)> {
        self.clients
            .read()
            .await
            .iter()
            .map(|(name, client)| (name.clone(), client.clone()))
            .collect()
    }

    /// Disconnect a server and mark it disabled. Its config stays, so
    /// it can be restarted.
    pub async fn remove(&self, name: &str) -> Result<(), ClientError> {
        let client = self.clients.write().await.remove(name);
        if let Some(client) = client {
            client.close().await?;
        }
        self.set_status(name, ServerStatus::Disabled).await;
        self.log_event(name, "Disconnected").await;
        Ok(())
    }

    /// Tear down and reconnect using the stored config.
    pub async fn restart(&self, name: &str) -> Result<Arc<Client>, ClientError> {
        self.log_event(name, "Restart requested").await;

        let config = self
            .configs
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| ClientError::Parse(format!("no restart config for {name}")))?;

        if let Some(client) = self.clients.write().await.remove(name) {
            client.close().await?;
        }

        self.add_stdio(config).await
    }
}
