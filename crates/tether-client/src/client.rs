//! Typed client surface over the correlator, retry engine, and session
//! context.
//!
//! Every operation except `ping` is gated on the capabilities the
//! server declared at initialize; calling an operation the server never
//! advertised fails locally with `CapabilityMissing`, without touching
//! the wire.

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::warn;

use tether_protocol::capabilities::ClientCapabilities;
use tether_protocol::message::{JsonRpcNotification, JsonRpcRequest};
use tether_protocol::types::completion::{CompleteParams, CompleteResult};
use tether_protocol::types::initialize::InitializeParams;
use tether_protocol::types::prompts::{GetPromptParams, ListPromptsParams, ListPromptsResult};
use tether_protocol::types::prompts::GetPromptResult;
use tether_protocol::types::resources::{
    ListResourcesParams, ListResourcesResult, ReadResourceParams, ReadResourceResult,
    SubscribeResourceParams, UnsubscribeResourceParams,
};
use tether_protocol::types::roots::ListRootsResult;
use tether_protocol::types::sampling::{CreateMessageParams, CreateMessageResult};
use tether_protocol::types::tools::{CallToolParams, CallToolResult, ListToolsParams, ListToolsResult};
use tether_protocol::types::Implementation;
use tether_protocol::version::LATEST_PROTOCOL_VERSION;

use crate::correlator::Correlator;
use crate::error::ClientError;
use crate::initialize::{initialize, SessionContext, HANDSHAKE_TIMEOUT};
use crate::notifications::NotificationDispatcher;
use crate::retry::{sleep_cancellable, with_retry, CancellationToken, IsRetryable, RetryPolicy};
use crate::transport::Transport;

// ---------------------------------------------------------------------------
// ClientOptions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub client_info: Implementation,
    pub capabilities: ClientCapabilities,
    pub preferred_version: String,
    pub handshake_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            client_info: Implementation::new("tether", env!("CARGO_PKG_VERSION")),
            capabilities: ClientCapabilities::default(),
            preferred_version: LATEST_PROTOCOL_VERSION.to_string(),
            handshake_timeout: HANDSHAKE_TIMEOUT,
            retry: RetryPolicy::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct Client {
    correlator: Arc<Correlator>,
    dispatcher: Arc<NotificationDispatcher>,
    session: SessionContext,
    retry: RetryPolicy,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client").finish_non_exhaustive()
    }
}

impl Client {
    /// Open the transport, run the handshake, and return a ready
    /// session. On any handshake failure the transport is closed before
    /// the error propagates.
    pub async fn connect(
        transport: Arc<dyn Transport>,
        options: ClientOptions,
    ) -> Result<Self, ClientError> {
        transport.open().await?;
        let dispatcher = Arc::new(NotificationDispatcher::new());
        let correlator = Arc::new(Correlator::new(transport, dispatcher.clone()));

        let params = InitializeParams {
            protocol_version: options.preferred_version.clone(),
            client_info: options.client_info.clone(),
            capabilities: options.capabilities.clone(),
        };
        match initialize(&correlator, params, options.handshake_timeout).await {
            Ok(session) => Ok(Self {
                correlator,
                dispatcher,
                session,
                retry: options.retry,
            }),
            Err(error) => {
                if let Err(close_error) = correlator.close().await {
                    warn!(%close_error, "cleanup after failed handshake");
                }
                Err(error)
            }
        }
    }

    /// The immutable result of the handshake.
    pub fn session(&self) -> &SessionContext {
        &self.session
    }

    /// Subscribe to server notifications for one method.
    pub fn subscribe_notifications(
        &self,
        method: &str,
    ) -> broadcast::Receiver<JsonRpcNotification> {
        self.dispatcher.subscribe(method)
    }

    /// Receive server-issued requests instead of having them refused
    /// with method-not-found.
    pub fn incoming_requests(&self, capacity: usize) -> mpsc::Receiver<JsonRpcRequest> {
        let (tx, rx) = mpsc::channel(capacity);
        self.correlator.set_incoming_request_sink(tx);
        rx
    }

    pub async fn close(&self) -> Result<(), ClientError> {
        self.correlator.close().await
    }

    // -- Request plumbing ----------------------------------------------------

    fn require_capability(&self, name: &'static str) -> Result<(), ClientError> {
        let caps = &self.session.server_capabilities;
        let present = match name {
            "tools" => caps.tools.is_some(),
            "resources" => caps.resources.is_some(),
            "prompts" => caps.prompts.is_some(),
            "sampling" => caps.sampling.is_some(),
            "completions" => caps.completions.is_some(),
            "roots" => caps.roots.is_some(),
            "logging" => caps.logging.is_some(),
            _ => false,
        };
        if present {
            Ok(())
        } else {
            Err(ClientError::CapabilityMissing(name.to_string()))
        }
    }

    fn require_resource_subscriptions(&self) -> Result<(), ClientError> {
        self.require_capability("resources")?;
        if self
            .session
            .server_capabilities
            .supports_resource_subscriptions()
        {
            Ok(())
        } else {
            Err(ClientError::CapabilityMissing(
                "resources.subscribe".to_string(),
            ))
        }
    }

    async fn request_raw(
        &self,
        method: &str,
        params: Option<Value>,
        cancel: Option<watch::Receiver<bool>>,
    ) -> Result<Value, ClientError> {
        with_retry(&self.retry, cancel.clone(), || {
            let params = params.clone();
            let cancel = cancel.clone();
            async move {
                self.correlator
                    .submit_with_cancel(method, params, cancel)
                    .await
            }
        })
        .await
    }

    async fn request<R: DeserializeOwned>(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<R, ClientError> {
        let value = self.request_raw(method, params, None).await?;
        serde_json::from_value(value)
            .map_err(|e| ClientError::Parse(format!("invalid {method} result: {e}")))
    }

    /// One submission whose deadline restarts whenever the server shows
    /// signs of life via `notifications/progress`.
    async fn submit_with_progress_deadline(
        &self,
        method: &str,
        params: Option<Value>,
        cancel: Option<watch::Receiver<bool>>,
    ) -> Result<Value, ClientError> {
        let mut progress = self.dispatcher.subscribe("notifications/progress");
        let quiet = self.retry.deadline;
        let submit = self.correlator.submit_with_cancel(method, params, cancel);
        tokio::pin!(submit);
        loop {
            tokio::select! {
                outcome = &mut submit => return outcome,
                event = progress.recv() => {
                    match event {
                        Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => {
                            return match tokio::time::timeout(quiet, &mut submit).await {
                                Ok(outcome) => outcome,
                                Err(_) => Err(ClientError::Timeout),
                            };
                        }
                    }
                }
                _ = tokio::time::sleep(quiet) => return Err(ClientError::Timeout),
            }
        }
    }

    // -- Typed wrappers ------------------------------------------------------

    /// Liveness check. Always available, no capability gate.
    pub async fn ping(&self) -> Result<(), ClientError> {
        self.request_raw("ping", None, None).await.map(|_| ())
    }

    pub async fn list_tools(&self, cursor: Option<String>) -> Result<ListToolsResult, ClientError> {
        self.require_capability("tools")?;
        self.request("tools/list", to_params(&ListToolsParams { cursor })?)
            .await
    }

    pub async fn call_tool(&self, params: CallToolParams) -> Result<CallToolResult, ClientError> {
        self.call_tool_with_cancel(params, None).await
    }

    /// Like [`Client::call_tool`], cancellable. The deadline is a quiet
    /// period: progress notifications reset it.
    pub async fn call_tool_with_cancel(
        &self,
        params: CallToolParams,
        cancel: Option<&CancellationToken>,
    ) -> Result<CallToolResult, ClientError> {
        self.require_capability("tools")?;
        let cancel = cancel.map(CancellationToken::watch);
        let params = to_params(&params)?;

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let outcome = self
                .submit_with_progress_deadline("tools/call", params.clone(), cancel.clone())
                .await;
            match outcome {
                Ok(value) => {
                    return serde_json::from_value(value)
                        .map_err(|e| ClientError::Parse(format!("invalid tools/call result: {e}")))
                }
                Err(error) => {
                    if attempt >= self.retry.max_attempts {
                        return Err(error);
                    }
                    let Some(reason) = error.is_retryable() else {
                        return Err(error);
                    };
                    warn!(
                        attempt,
                        max = self.retry.max_attempts,
                        reason = %reason,
                        "retrying tool call after transient error"
                    );
                    if sleep_cancellable(self.retry.delay_ms(attempt), cancel.clone()).await {
                        return Err(ClientError::Cancelled);
                    }
                }
            }
        }
    }

    pub async fn list_resources(
        &self,
        cursor: Option<String>,
    ) -> Result<ListResourcesResult, ClientError> {
        self.require_capability("resources")?;
        self.request(
            "resources/list",
            to_params(&ListResourcesParams { cursor })?,
        )
        .await
    }

    pub async fn read_resource(&self, uri: &str) -> Result<ReadResourceResult, ClientError> {
        self.require_capability("resources")?;
        self.request(
            "resources/read",
            to_params(&ReadResourceParams {
                uri: uri.to_string(),
            })?,
        )
        .await
    }

    pub async fn subscribe_resource(&self, uri: &str) -> Result<(), ClientError> {
        self.require_resource_subscriptions()?;
        self.request_raw(
            "resources/subscribe",
            to_params(&SubscribeResourceParams {
                uri: uri.to_string(),
            })?,
            None,
        )
        .await
        .map(|_| ())
    }

    pub async fn unsubscribe_resource(&self, uri: &str) -> Result<(), ClientError> {
        self.require_resource_subscriptions()?;
        self.request_raw(
            "resources/unsubscribe",
            to_params(&UnsubscribeResourceParams {
                uri: uri.to_string(),
            })?,
            None,
        )
        .await
        .map(|_| ())
    }

    pub async fn list_prompts(
        &self,
        cursor: Option<String>,
    ) -> Result<ListPromptsResult, ClientError> {
        self.require_capability("prompts")?;
        self.request("prompts/list", to_params(&ListPromptsParams { cursor })?)
            .await
    }

    pub async fn get_prompt(&self, params: GetPromptParams) -> Result<GetPromptResult, ClientError> {
        self.require_capability("prompts")?;
        self.request("prompts/get", to_params(&params)?).await
    }

    pub async fn create_message(
        &self,
        params: CreateMessageParams,
    ) -> Result<CreateMessageResult, ClientError> {
        self.require_capability("sampling")?;
        self.request("sampling/createMessage", to_params(&params)?)
            .await
    }

    pub async fn complete(&self, params: CompleteParams) -> Result<CompleteResult, ClientError> {
        self.require_capability("completions")?;
        self.request("completion/complete", to_params(&params)?).await
    }

    pub async fn list_roots(&self) -> Result<ListRootsResult, ClientError> {
        self.require_capability("roots")?;
        self.request("roots/list", None).await
    }
}

fn to_params<P: Serialize>(params: &P) -> Result<Option<Value>, ClientError> {
    serde_json::to_value(params)
        .map(Some)
        .map_err(|e| ClientError::Parse(e.to_string()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
