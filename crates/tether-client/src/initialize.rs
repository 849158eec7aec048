//! The `initialize` handshake.
//!
//! Runs exactly once per connection, before anything else. Failure is
//! always an error with a classified kind, never an empty result:
//! callers branch on the kind to re-authenticate (`Retryable`),
//! downgrade or abort (`VersionMismatch`), or give up (`NonRetryable`,
//! `Timeout`).

use std::time::Duration;

use tracing::debug;

use tether_protocol::capabilities::{ClientCapabilities, ServerCapabilities};
use tether_protocol::types::initialize::{InitializeParams, InitializeResult};
use tether_protocol::types::Implementation;
use tether_protocol::version;

use crate::correlator::Correlator;
use crate::error::ClientError;

/// Handshake budget, separate from the per-request retry deadline.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// The immutable outcome of a successful handshake.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub protocol_version: String,
    pub server_info: Implementation,
    pub server_capabilities: ServerCapabilities,
    pub client_capabilities: ClientCapabilities,
    pub instructions: Option<String>,
}

pub(crate) async fn initialize(
    correlator: &Correlator,
    params: InitializeParams,
    timeout: Duration,
) -> Result<SessionContext, ClientError> {
    let requested = params.protocol_version.clone();
    let client_capabilities = params.capabilities.clone();
    let params_value =
        serde_json::to_value(&params).map_err(|e| ClientError::Parse(e.to_string()))?;

    let outcome = tokio::time::timeout(
        timeout,
        correlator.submit("initialize", Some(params_value)),
    )
    .await;
    let raw = match outcome {
        Ok(result) => result?,
        // At this layer the handshake deadline is final, whatever the
        // lower layers would have said about retrying.
        Err(_) => return Err(ClientError::Timeout),
    };

    let result: InitializeResult = serde_json::from_value(raw)
        .map_err(|e| ClientError::Parse(format!("invalid initialize result: {e}")))?;

    if !version::is_supported(&result.protocol_version) {
        return Err(ClientError::VersionMismatch {
            requested,
            offered: result.protocol_version,
        });
    }

    correlator.notify("notifications/initialized", None).await?;

    debug!(
        version = %result.protocol_version,
        server = %result.server_info.name,
        "session established"
    );

    Ok(SessionContext {
        protocol_version: result.protocol_version,
        server_info: result.server_info,
        server_capabilities: result.capabilities,
        client_capabilities,
        instructions: result.instructions,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransientError;
    use crate::notifications::NotificationDispatcher;
    use crate::test_support::MockTransport;
    use serde_json::json;
    use std::sync::Arc;
    use tether_protocol::message::JsonRpcMessage;

    fn handshake_reply(version: &str) -> serde_json::Value {
        json!({
            "protocolVersion": version,
            "serverInfo": { "name": "stub", "version": "1.0.0" },
            "capabilities": { "tools": {} }
        })
    }

    fn correlator_over(transport: Arc<MockTransport>) -> Correlator {
        Correlator::new(transport, Arc::new(NotificationDispatcher::new()))
    }

    #[tokio::test]
    async fn happy_path_produces_a_session_and_emits_initialized() {
        let transport = Arc::new(MockTransport::connected());
        let reply = handshake_reply("2025-06-18");
        transport.reply_with(move |request| {
            vec![(
                Duration::ZERO,
                JsonRpcMessage::response(request.id.clone(), reply.clone()),
            )]
        });
        let correlator = correlator_over(transport.clone());

        let session = initialize(&correlator, InitializeParams::default(), HANDSHAKE_TIMEOUT)
            .await
            .expect("handshake");
        assert_eq!(session.protocol_version, "2025-06-18");
        assert_eq!(session.server_info.name, "stub");
        assert!(session.server_capabilities.tools.is_some());

        let sent = transport.sent();
        assert_eq!(sent[0].method(), Some("initialize"));
        let JsonRpcMessage::Notification(initialized) = &sent[1] else {
            panic!("expected the initialized notification, got {:?}", sent[1]);
        };
        assert_eq!(initialized.method, "notifications/initialized");
    }

    #[tokio::test]
    async fn downgrade_within_the_accepted_set_is_fine() {
        let transport = Arc::new(MockTransport::connected());
        let reply = handshake_reply("2024-11-05");
        transport.reply_with(move |request| {
            vec![(
                Duration::ZERO,
                JsonRpcMessage::response(request.id.clone(), reply.clone()),
            )]
        });
        let correlator = correlator_over(transport);

        let session = initialize(&correlator, InitializeParams::default(), HANDSHAKE_TIMEOUT)
            .await
            .expect("handshake");
        assert_eq!(session.protocol_version, "2024-11-05");
    }

    #[tokio::test]
    async fn unknown_version_is_a_mismatch_carrying_both_versions() {
        let transport = Arc::new(MockTransport::connected());
        let reply = handshake_reply("1999-01-01");
        transport.reply_with(move |request| {
            vec![(
                Duration::ZERO,
                JsonRpcMessage::response(request.id.clone(), reply.clone()),
            )]
        });
        let correlator = correlator_over(transport.clone());

        let err = initialize(&correlator, InitializeParams::default(), HANDSHAKE_TIMEOUT)
            .await
            .expect_err("mismatch");
        let ClientError::VersionMismatch { requested, offered } = err else {
            panic!("expected version mismatch, got {err:?}");
        };
        assert_eq!(requested, "2025-06-18");
        assert_eq!(offered, "1999-01-01");

        // No initialized notification after a failed handshake.
        assert_eq!(transport.sent().len(), 1);
    }

    #[tokio::test]
    async fn auth_like_errors_surface_retryable_with_the_message() {
        let transport = Arc::new(MockTransport::connected());
        transport.reply_with(|request| {
            vec![(
                Duration::ZERO,
                JsonRpcMessage::error_response(
                    request.id.clone(),
                    -32001,
                    "401 unauthorized",
                    None,
                ),
            )]
        });
        let correlator = correlator_over(transport);

        let err = initialize(&correlator, InitializeParams::default(), HANDSHAKE_TIMEOUT)
            .await
            .expect_err("auth failure");
        let ClientError::Retryable(TransientError::Rpc { message, .. }) = err else {
            panic!("expected retryable rpc error, got {err:?}");
        };
        assert!(message.contains("401"));
    }

    #[tokio::test]
    async fn structural_errors_surface_non_retryable() {
        let transport = Arc::new(MockTransport::connected());
        transport.reply_with(|request| {
            vec![(
                Duration::ZERO,
                JsonRpcMessage::error_response(
                    request.id.clone(),
                    -32602,
                    "unsupported protocol version",
                    None,
                ),
            )]
        });
        let correlator = correlator_over(transport);

        let err = initialize(&correlator, InitializeParams::default(), HANDSHAKE_TIMEOUT)
            .await
            .expect_err("structural failure");
        assert!(matches!(err, ClientError::NonRetryable { code: -32602, .. }));
    }

    #[tokio::test]
    async fn a_silent_server_times_out() {
        let transport = Arc::new(MockTransport::connected());
        let correlator = correlator_over(transport);

        let err = initialize(
            &correlator,
            InitializeParams::default(),
            Duration::from_millis(50),
        )
        .await
        .expect_err("timeout");
        assert!(matches!(err, ClientError::Timeout));
    }

    #[tokio::test]
    async fn a_garbled_result_is_a_parse_error() {
        let transport = Arc::new(MockTransport::connected());
        transport.reply_with(|request| {
            vec![(
                Duration::ZERO,
                JsonRpcMessage::response(request.id.clone(), json!({ "nope": true })),
            )]
        });
        let correlator = correlator_over(transport);

        let err = initialize(&correlator, InitializeParams::default(), HANDSHAKE_TIMEOUT)
            .await
            .expect_err("parse failure");
        assert!(matches!(err, ClientError::Parse(_)));
    }
}
