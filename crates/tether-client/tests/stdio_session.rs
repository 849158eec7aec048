//! End-to-end stdio sessions against shell stub servers.
//!
//! Each stub is a `sh` script that reads the client's frames line by
//! line and prints canned responses. Request ids are deterministic: the
//! correlator numbers requests from 1, so `initialize` is always id 1.

#![cfg(unix)]

use std::sync::Arc;

use tether_client::error::TransientError;
use tether_client::{
    Client, ClientError, ClientOptions, StdioServerParams, StdioTransport, Transport,
};

fn stub(script: &str) -> StdioServerParams {
    StdioServerParams::new("sh", vec!["-c".to_string(), script.to_string()])
}

const HANDSHAKE_OK: &str = r#"
read line
printf '{"jsonrpc":"2.0","id":1,"result":{"protocolVersion":"2025-06-18","serverInfo":{"name":"stub","version":"1.0.0"},"capabilities":{"tools":{}}}}\n'
read line
"#;

#[tokio::test]
async fn happy_path_initialize_then_list_tools() {
    let script = r#"
read line
printf '{"jsonrpc":"2.0","id":1,"result":{"protocolVersion":"2025-06-18","serverInfo":{"name":"stub","version":"1.0.0"},"capabilities":{"tools":{}}}}\n'
read line
read line
printf '{"jsonrpc":"2.0","id":2,"result":{"tools":[]}}\n'
read line
"#;
    let transport = Arc::new(StdioTransport::new(stub(script)));
    let client = Client::connect(transport, ClientOptions::default())
        .await
        .expect("handshake");

    assert_eq!(client.session().protocol_version, "2025-06-18");
    assert_eq!(client.session().server_info.name, "stub");

    let tools = client.list_tools(None).await.expect("tools/list");
    assert!(tools.tools.is_empty());

    client.close().await.expect("close");
}

#[tokio::test]
async fn server_may_downgrade_within_the_accepted_set() {
    let script = r#"
read line
printf '{"jsonrpc":"2.0","id":1,"result":{"protocolVersion":"2024-11-05","serverInfo":{"name":"stub","version":"1.0.0"},"capabilities":{}}}\n'
read line
read line
"#;
    let transport = Arc::new(StdioTransport::new(stub(script)));
    let client = Client::connect(transport, ClientOptions::default())
        .await
        .expect("handshake");
    assert_eq!(client.session().protocol_version, "2024-11-05");
    client.close().await.expect("close");
}

#[tokio::test]
async fn unknown_server_version_fails_the_handshake() {
    let script = r#"
read line
printf '{"jsonrpc":"2.0","id":1,"result":{"protocolVersion":"1999-01-01","serverInfo":{"name":"stub","version":"1.0.0"},"capabilities":{}}}\n'
read line
"#;
    let transport = Arc::new(StdioTransport::new(stub(script)));
    let err = Client::connect(transport, ClientOptions::default())
        .await
        .expect_err("mismatch");
    let ClientError::VersionMismatch { requested, offered } = err else {
        panic!("expected version mismatch, got {err:?}");
    };
    assert_eq!(requested, "2025-06-18");
    assert_eq!(offered, "1999-01-01");
}

#[tokio::test]
async fn auth_like_initialize_errors_are_retryable_and_inspectable() {
    let script = r#"
read line
printf '{"jsonrpc":"2.0","id":1,"error":{"code":-32001,"message":"401 unauthorized"}}\n'
read line
"#;
    let transport = Arc::new(StdioTransport::new(stub(script)));
    let err = Client::connect(transport, ClientOptions::default())
        .await
        .expect_err("auth failure");
    let ClientError::Retryable(TransientError::Rpc { code, message, .. }) = err else {
        panic!("expected retryable rpc error, got {err:?}");
    };
    assert_eq!(code, -32001);
    assert!(message.contains("401"));
}

#[tokio::test]
async fn malformed_lines_are_skipped_without_killing_the_session() {
    let script = r#"
read line
printf 'this is not json\n'
printf '\n'
printf '{"jsonrpc":"2.0","id":1,"result":{"protocolVersion":"2025-06-18","serverInfo":{"name":"stub","version":"1.0.0"},"capabilities":{}}}\n'
read line
read line
"#;
    let transport = Arc::new(StdioTransport::new(stub(script)));
    let client = Client::connect(transport, ClientOptions::default())
        .await
        .expect("handshake survives garbage");
    client.close().await.expect("close");
}

#[tokio::test]
async fn server_death_fails_in_flight_requests_retryably() {
    // The stub answers the handshake and then exits mid-request.
    let script = r#"
read line
printf '{"jsonrpc":"2.0","id":1,"result":{"protocolVersion":"2025-06-18","serverInfo":{"name":"stub","version":"1.0.0"},"capabilities":{"tools":{}}}}\n'
read line
read line
exit 0
"#;
    let transport = Arc::new(StdioTransport::new(stub(script)));
    let client = Client::connect(transport, ClientOptions::default())
        .await
        .expect("handshake");

    let err = client.list_tools(None).await.expect_err("server died");
    assert!(matches!(err, ClientError::Retryable(_)));
    client.close().await.expect("close");
}

#[tokio::test]
async fn interleaved_construction_and_open_do_not_interfere() {
    // Regression test for deferred allocation: constructing one handle
    // while another is already live on the same runtime must be safe.
    let ping_script = r#"
read line
printf '{"jsonrpc":"2.0","id":1,"result":{"protocolVersion":"2025-06-18","serverInfo":{"name":"stub","version":"1.0.0"},"capabilities":{}}}\n'
read line
read line
printf '{"jsonrpc":"2.0","id":2,"result":{}}\n'
read line
"#;

    let transport_a = Arc::new(StdioTransport::new(stub(ping_script)));
    transport_a.open().await.expect("open a");
    let transport_b = Arc::new(StdioTransport::new(stub(ping_script)));
    transport_b.open().await.expect("open b");
    let transport_c = Arc::new(StdioTransport::new(stub(ping_script)));
    transport_c.open().await.expect("open c");

    let a = Client::connect(transport_a, ClientOptions::default())
        .await
        .expect("connect a");
    let b = Client::connect(transport_b, ClientOptions::default())
        .await
        .expect("connect b");
    let c = Client::connect(transport_c, ClientOptions::default())
        .await
        .expect("connect c");

    let (ra, rb, rc) = tokio::join!(a.ping(), b.ping(), c.ping());
    ra.expect("ping a");
    rb.expect("ping b");
    rc.expect("ping c");

    for client in [a, b, c] {
        client.close().await.expect("close");
    }
}

#[tokio::test]
async fn a_hundred_unopened_handles_cost_nothing() {
    let transports: Vec<_> = (0..100)
        .map(|_| StdioTransport::new(StdioServerParams::new("cat", Vec::new())))
        .collect();

    // Nothing was spawned yet; opening and closing each one in turn
    // must succeed.
    for transport in &transports {
        transport.open().await.expect("open");
        transport.close().await.expect("close");
    }
}

#[tokio::test]
async fn close_is_idempotent_and_final() {
    let transport = Arc::new(StdioTransport::new(stub(HANDSHAKE_OK)));
    transport.open().await.expect("open");
    transport.close().await.expect("close");
    transport.close().await.expect("close again");
    assert!(matches!(
        transport.open().await,
        Err(ClientError::TransportClosed)
    ));
}

#[tokio::test]
async fn registry_connects_and_restarts_servers() {
    use tether_client::{ClientRegistry, ServerConfig};

    let registry = ClientRegistry::new();
    let config = ServerConfig {
        name: "stub".to_string(),
        params: stub(HANDSHAKE_OK),
        timeout_ms: Some(5_000),
    };

    let client = registry.add_stdio(config).await.expect("connect");
    assert_eq!(client.session().protocol_version, "2025-06-18");
    assert!(registry
        .get_status("stub")
        .await
        .expect("status")
        .is_connected());

    let client = registry.restart("stub").await.expect("restart");
    assert_eq!(client.session().protocol_version, "2025-06-18");

    registry.remove("stub").await.expect("remove");
    assert_eq!(
        registry.get_status("stub").await,
        Some(tether_client::ServerStatus::Disabled)
    );
    assert!(registry.get("stub").await.is_none());

    let logs = registry.get_logs("stub").await;
    assert!(logs.iter().any(|line| line.contains("Restart requested")));
    assert!(logs.iter().any(|line| line.contains("Disconnected")));
}

#[tokio::test]
async fn env_values_are_expanded_at_spawn_time() {
    std::env::set_var("TETHER_E2E_SECRET", "hunter2");
    // The stub leaks the env var back through the serverInfo name.
    let script = r#"
read line
printf '{"jsonrpc":"2.0","id":1,"result":{"protocolVersion":"2025-06-18","serverInfo":{"name":"'"$TOKEN"'","version":"1.0.0"},"capabilities":{}}}\n'
read line
read line
"#;
    let mut params = stub(script);
    params.env = Some(
        [("TOKEN".to_string(), "${TETHER_E2E_SECRET}".to_string())]
            .into_iter()
            .collect(),
    );

    let transport = Arc::new(StdioTransport::new(params));
    let client = Client::connect(transport, ClientOptions::default())
        .await
        .expect("handshake");
    assert_eq!(client.session().server_info.name, "hunter2");
    client.close().await.expect("close");
    std::env::remove_var("TETHER_E2E_SECRET");
}
