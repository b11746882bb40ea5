//! Wires config, persistence, registry, transport, message core, and
//! dispatcher into the [`crate::gateway::handler::GatewayState`] axum
//! shares across every connection.

use std::error::Error;
use std::sync::Arc;

use futures::FutureExt;

use crate::auth::{PassportConfig, TokenVerifier};
use crate::config::{Config, PersistBackend, SocketMiddleware};
use crate::gateway::handler::{build_dispatcher, GatewayState};
use crate::gateway::GatewayConnections;
use crate::message::core::MessageCore;
use crate::registry::Registry;
use crate::store::memory::MemoryStore;
use crate::store::postgres::PostgresStore;
use crate::store::Store;

pub type BootResult<T> = Result<T, Box<dyn Error + Send + Sync>>;

pub async fn build_gateway_state(config: Arc<Config>) -> BootResult<GatewayState> {
    let store: Arc<dyn Store> = match config.persist_backend {
        PersistBackend::Memory => Arc::new(MemoryStore::new()),
        PersistBackend::Postgresql => {
            let database_url = config
                .database_url
                .as_deref()
                .expect("Config::from_env guarantees DATABASE_URL when backend is postgresql");
            let postgres = PostgresStore::connect(database_url, config.db_max_connections).await?;
            postgres.run_migrations().await?;
            postgres.health_check().await?;
            Arc::new(postgres)
        }
    };

    let registry = Registry::new(store.clone(), config.max_total_connections, config.inactivity_threshold);
    let connections = GatewayConnections::new();

    let emit_connections = connections.clone();
    let emit = Arc::new(
        move |socket_id: String, event: &'static str, data: serde_json::Value, timeout: std::time::Duration| {
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

    // The `Passport` middleware rejects every token against an empty trust
    // store, so its config must actually be loaded from disk before the
    // verifier is built (§4.2). A `Passport` boot with no `PASSPORT_PATH`
    // would otherwise come up healthy and silently reject every connection.
    let passport_config = match config.socket_middleware {
        SocketMiddleware::Passport => {
            let path = config
                .passport_path
                .as_deref()
                .ok_or("PASSPORT_PATH must be set when SOCKET_MIDDLEWARE=passport")?;
            PassportConfig::from_file(path)?
        }
        SocketMiddleware::Test => PassportConfig::default(),
    };
    let token_verifier = Arc::new(TokenVerifier::new(passport_config));

    Ok(GatewayState {
        config,
        registry,
        connections,
        message_core,
        dispatcher,
        token_verifier,
    })
}
