use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use serde_json::json;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::set_header::SetResponseHeaderLayer;
use tower_governor::{governor::GovernorConfigBuilder, GovernorLayer};
use tracing::info;
use tracing_subscriber::EnvFilter;

use beacon_server::config::Config;
use beacon_server::gateway::handler::{health_check, websocket_handler, GatewayState};
use beacon_server::state::build_gateway_state;

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    if config.is_production() {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

/// Background sweep that disconnects sessions idle past `INACTIVITY_THRESHOLD`
/// and broadcasts `user_disconnected` for anyone it takes fully offline.
fn spawn_inactivity_sweep(state: GatewayState) {
    let mut interval = tokio::time::interval(state.config.inactivity_check_interval);
    tokio::spawn(async move {
        loop {
            interval.tick().await;
            let outcomes = state.registry.check_inactivity().await;
            for (socket_id, outcome) in outcomes {
                state.connections.remove(&socket_id).await;
                if outcome.went_offline {
                    let socket_ids = state.connections.connected_socket_ids().await;
                    state
                        .connections
                        .broadcast_to_sockets(
                            &socket_ids,
                            beacon_server::gateway::handler::EVENT_USER_DISCONNECTED,
                            json!({
                                "userId": outcome.user.user_id,
                                "userName": outcome.user.user_name,
                                "state": outcome.user.state.to_string(),
                                "reason": "inactivity",
                            }),
                        )
                        .await;
                }
            }
        }
    });
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("Failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let config = Arc::new(Config::from_env()?);
    init_tracing(&config);
    info!(app_env = %config.app_env, "Starting beacon gateway");

    let gateway_state = build_gateway_state(config.clone()).await?;
    spawn_inactivity_sweep(gateway_state.clone());

    let cors = if config.is_production() {
        match config.client_url.as_deref() {
            Some(origin) => CorsLayer::new().allow_origin(origin.parse::<axum::http::HeaderValue>()?),
            None => CorsLayer::new().allow_origin(AllowOrigin::exact("null".parse()?)),
        }
    } else {
        CorsLayer::permissive()
    };

    let governor_config = Arc::new(
        GovernorConfigBuilder::default()
            .per_second(10)
            .burst_size(20)
            .finish()
            .expect("Governor config is valid by construction"),
    );

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/ws", get(websocket_handler))
        .layer(GovernorLayer {
            config: governor_config,
        })
        .layer(SetResponseHeaderLayer::if_not_present(
            axum::http::header::X_CONTENT_TYPE_OPTIONS,
            axum::http::HeaderValue::from_static("nosniff"),
        ))
        .layer(cors)
        .with_state(gateway_state);

    let addr: SocketAddr = config.server_addr().parse()?;
    info!(%addr, "Listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}
