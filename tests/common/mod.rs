use std::sync::Arc;
use std::time::Duration;

use beacon_server::auth::{PassportConfig, TokenVerifier};
use beacon_server::config::{Config, PersistBackend, SocketMiddleware};
use beacon_server::gateway::handler::{build_dispatcher, GatewayState};
use beacon_server::gateway::GatewayConnections;
use beacon_server::message::core::MessageCore;
use beacon_server::registry::{Identity, Registry};
use beacon_server::store::memory::MemoryStore;
use beacon_server::store::Store;
use futures::FutureExt;

pub fn test_config() -> Arc<Config> {
    Arc::new(Config {
        server_host: "127.0.0.1".into(),
        server_port: 0,
        client_url: None,
        passport_path: None,
        database_url: None,
        persist_backend: PersistBackend::Memory,
        socket_middleware: SocketMiddleware::Test,
        app_env: "test".into(),
        max_total_connections: 1000,
        inactivity_threshold: Duration::from_secs(3600),
        inactivity_check_interval: Duration::from_secs(60),
        default_request_timeout: Duration::from_millis(500),
        message_ack_timeout: Duration::from_millis(100),
        pending_reconcile_window_days: 7,
        public_message_expire_days: 30,
        db_max_connections: 3,
    })
}

pub async fn test_gateway_state() -> GatewayState {
    let config = test_config();
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let registry = Registry::new(store.clone(), config.max_total_connections, config.inactivity_threshold);
    let connections = GatewayConnections::new();

    let emit_connections = connections.clone();
    let emit = Arc::new(
        move |socket_id: String, event: &'static str, data: serde_json::Value, timeout: Duration| {
            let connections = emit_connections.clone();
            async move { connections.emit_with_ack(&socket_id, event, data, timeout).await }.boxed()
        },
    );

    let message_core = Arc::new(MessageCore::new(
        registry.clone(),
        store.clone(),
        emit,
        config.message_ack_timeout,
        config.pending_reconcile_window_days,
        config.public_message_expire_days,
    ));
    let dispatcher = Arc::new(build_dispatcher(
        message_core.clone(),
        registry.clone(),
        config.default_request_timeout,
    ));
    let token_verifier = Arc::new(TokenVerifier::new(PassportConfig::default()));

    GatewayState {
        config,
        registry,
        connections,
        message_core,
        dispatcher,
        token_verifier,
    }
}

/// Registers a connected-and-authenticated socket directly against the
/// registry and connection manager, bypassing the real websocket upgrade —
/// the dispatcher and registry are transport-agnostic by design, so this
/// exercises the same code path a live socket would hit. The spawned task
/// plays the part of a well-behaved client: it immediately acks every
/// emitted event, so delivery attempts resolve to `delivered` instead of
/// timing out.
pub async fn connect_user(state: &GatewayState, socket_id: &str, user_id: &str) {
    state
        .registry
        .store_user(
            socket_id,
            Identity {
                user_id: user_id.to_string(),
                user_name: format!("name-{user_id}"),
            },
            true,
        )
        .await
        .unwrap();

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<String>();
    state.connections.add(socket_id.to_string(), tx).await;

    let connections = state.connections.clone();
    tokio::spawn(async move {
        while let Some(raw) = rx.recv().await {
            let parsed: serde_json::Value = match serde_json::from_str(&raw) {
                Ok(v) => v,
                Err(_) => continue,
            };
            if let Some(ack_id) = parsed
                .get("data")
                .and_then(|d| d.get("ackId"))
                .and_then(|v| v.as_str())
            {
                connections
                    .resolve_ack(ack_id, serde_json::json!({"success": true, "message": "received"}))
                    .await;
            }
        }
    });
}
