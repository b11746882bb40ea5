//! Connection lifecycle for the single `/ws` upgrade endpoint, grounded on
//! the teacher's `websocket/handler.rs` (pre-upgrade token check, a
//! send/receive task pair driven by `tokio::select!`, READY-before-register
//! ordering) but built around this crate's registry/message-core/dispatcher
//! stack instead of the teacher's Discord-style gateway ops.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::auth::TokenVerifier;
use crate::config::{Config, SocketMiddleware};
use crate::dispatcher::{DispatchContext, EventDispatcher};
use crate::message::core::{MessageCore, SendMessageInput};
use crate::registry::{DisconnectReason, Registry};
use crate::store::MarkReadTarget;

use super::protocol::ClientFrame;
use super::GatewayConnections;

pub const EVENT_MESSAGE_SEND: &str = "sendMessage";
pub const EVENT_MESSAGE_READ: &str = "markMessagesAsRead";
pub const EVENT_MESSAGE_DELIVERED: &str = "markMessagesAsDelivered";
pub const EVENT_TYPING: &str = "typing";
pub const EVENT_STOP_TYPING: &str = "stopTyping";
pub const EVENT_PUBLIC_SEND: &str = "broadcastPublicMessage";
pub const EVENT_PUBLIC_HISTORY: &str = "getPublicMessages";
pub const EVENT_CONVERSATIONS_LIST: &str = "getUserConversationsList";
pub const EVENT_MESSAGES_HISTORY: &str = "getUserConversation";
pub const EVENT_USERS_LIST: &str = "getUsersList";
pub const EVENT_CONNECTION_METRICS: &str = "getUserConnectionMetrics";
pub const EVENT_ACK: &str = "ack";

pub const EVENT_USER_AUTHENTICATED: &str = "user_authenticated";
pub const EVENT_UPDATE_MESSAGE_STATUS: &str = "update_message_status";
pub const EVENT_PUBLIC_MESSAGE: &str = "public_message";
pub const EVENT_TYPING_INDICATOR: &str = "typingIndicator";
pub const EVENT_USER_DISCONNECTED: &str = "user_disconnected";

#[derive(Clone)]
pub struct GatewayState {
    pub config: Arc<Config>,
    pub registry: Registry,
    pub connections: GatewayConnections,
    pub message_core: Arc<MessageCore>,
    pub dispatcher: Arc<EventDispatcher>,
    pub token_verifier: Arc<TokenVerifier>,
}

#[derive(Debug, Deserialize)]
pub struct WsParams {
    pub token: String,
}

/// `GET /health`: liveness plus the cumulative counters ops dashboards poll
/// (§6.2) — connection/session gauges from the registry, dispatch counters
/// from the dispatcher.
pub async fn health_check(State(state): State<GatewayState>) -> axum::Json<serde_json::Value> {
    use std::sync::atomic::Ordering;

    axum::Json(json!({
        "status": "ok",
        "message": "beacon gateway is running",
        "timestamp": chrono::Utc::now(),
        "metrics": {
            "activeConnections": state.connections.connection_count().await,
            "activeUsers": state.registry.active_users().await,
            "totalConnections": state.registry.metrics.total_connections.load(Ordering::Relaxed),
            "disconnections": state.registry.metrics.disconnections.load(Ordering::Relaxed),
            "errors": state.registry.metrics.errors.load(Ordering::Relaxed),
            "handled": state.dispatcher.counters.handled.load(Ordering::Relaxed),
            "predictableErrors": state.dispatcher.counters.predictable_errors.load(Ordering::Relaxed),
            "fatalErrors": state.dispatcher.counters.fatal_errors.load(Ordering::Relaxed),
        },
    }))
}

/// Pre-upgrade auth gate: the token is verified for real before the 101
/// response goes out, so a bad token never occupies a connection slot —
/// rejection happens inside the upgrade callback only because the
/// `Passport` path needs an async JWKS fetch, not because the gate itself
/// is soft.
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    State(state): State<GatewayState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        let identity = match state.config.socket_middleware {
            SocketMiddleware::Test => state.token_verifier.verify_test_token(&params.token),
            SocketMiddleware::Passport => state.token_verifier.verify_token(&params.token).await,
        };

        match identity {
            Ok(identity) => handle_socket(socket, state, identity, true).await,
            Err(e) => {
                tracing::warn!(error = %e, "Rejected websocket upgrade: token verification failed");
                reject_socket(socket).await;
            }
        }
    })
}

async fn reject_socket(mut socket: WebSocket) {
    let _ = socket
        .send(WsMessage::Text(
            json!({"type":"error","error":"Authentication failed"}).to_string(),
        ))
        .await;
    let _ = socket.close().await;
}

async fn handle_socket(socket: WebSocket, state: GatewayState, identity: crate::registry::Identity, authenticated: bool) {
    let socket_id = Uuid::new_v4().to_string();
    let (mut ws_sink, mut ws_stream) = socket.split();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<String>();

    let user = match state
        .registry
        .store_user(&socket_id, identity.clone(), authenticated)
        .await
    {
        Ok(user) => user,
        Err(e) => {
            tracing::warn!(error = %e, "Rejected connection: registry capacity or storage error");
            let _ = ws_sink
                .send(WsMessage::Text(json!({"type":"error","error": e.reason()}).to_string()))
                .await;
            return;
        }
    };
    state.connections.add(socket_id.clone(), tx.clone()).await;

    // user_authenticated goes out once per session, before pending
    // reconciliation starts redelivering anything.
    let authenticated_payload = json!({
        "success": true,
        "userId": user.user_id,
        "userName": user.user_name,
    });
    let _ = tx.send(
        super::protocol::ServerFrame::event(EVENT_USER_AUTHENTICATED, authenticated_payload).to_json(),
    );

    if let Err(e) = state.message_core.reconcile_pending(&user.user_id).await {
        tracing::warn!(user_id = %user.user_id, error = %e, "Failed to reconcile pending messages on reconnect");
    }

    let send_task = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if ws_sink.send(WsMessage::Text(text)).await.is_err() {
                break;
            }
        }
    });

    let recv_state = state.clone();
    let recv_socket_id = socket_id.clone();
    let recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_stream.next().await {
            match msg {
                WsMessage::Text(text) => {
                    if !handle_client_frame(&recv_state, &recv_socket_id, &text).await {
                        break;
                    }
                }
                WsMessage::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = send_task => {}
        _ = recv_task => {}
    }

    state.connections.remove(&socket_id).await;
    if let Some(outcome) = state
        .registry
        .disconnect_user(&socket_id, DisconnectReason::Manual)
        .await
    {
        if outcome.went_offline {
            let socket_ids = state.connections.connected_socket_ids().await;
            state
                .connections
                .broadcast_to_sockets(
                    &socket_ids,
                    EVENT_USER_DISCONNECTED,
                    json!({
                        "userId": outcome.user.user_id,
                        "userName": outcome.user.user_name,
                        "state": outcome.user.state.to_string(),
                        "reason": DisconnectReason::Manual.as_str(),
                    }),
                )
                .await;
        }
    }
}

/// Returns `false` when the connection must close — a [`CoreError::Fatal`]
/// out of the dispatcher means the handler hit a broken invariant, and the
/// recv loop's caller tears the socket down rather than keep serving a
/// connection behind something that's already gone wrong.
async fn handle_client_frame(state: &GatewayState, socket_id: &str, text: &str) -> bool {
    let frame: ClientFrame = match serde_json::from_str(text) {
        Ok(f) => f,
        Err(e) => {
            tracing::debug!(error = %e, "Dropped malformed client frame");
            return true;
        }
    };

    if frame.event == EVENT_ACK {
        if let (Some(ack_id), Some(payload)) = (
            frame.data.get("ackId").and_then(|v| v.as_str()),
            frame.data.get("payload"),
        ) {
            state.connections.resolve_ack(ack_id, payload.clone()).await;
        }
        return true;
    }

    state.registry.touch(socket_id).await;

    let ctx = DispatchContext {
        socket_id: socket_id.to_string(),
        event: frame.event.clone(),
    };
    match state.dispatcher.dispatch(ctx, frame.data).await {
        Ok(outcome) => {
            if let Some(ack_id) = frame.ack_id {
                let server_frame = match outcome {
                    crate::dispatcher::DispatchOutcome::Ok { data } => super::protocol::ServerFrame::Ack {
                        ack_id,
                        success: true,
                        data: Some(data),
                        error: None,
                    },
                    crate::dispatcher::DispatchOutcome::Err { error } => super::protocol::ServerFrame::Ack {
                        ack_id,
                        success: false,
                        data: None,
                        error: Some(error),
                    },
                };
                let _ = state.connections.send_frame(socket_id, &server_frame).await;
            }
            true
        }
        Err(fatal) => {
            tracing::error!(socket_id, error = %fatal, "Fatal dispatcher error; closing connection");
            state.registry.metrics.record_error();
            false
        }
    }
}

/// Registers every event handler the spec's dispatcher exposes (§4.3, §4.4).
/// Split out from connection-lifecycle wiring so it can be unit-exercised
/// without standing up a real socket.
pub fn build_dispatcher(message_core: Arc<MessageCore>, registry: Registry, ack_timeout: Duration) -> EventDispatcher {
    let mut dispatcher = EventDispatcher::new(ack_timeout);

    {
        let core = message_core.clone();
        let registry = registry.clone();
        dispatcher.register(
            EVENT_MESSAGE_SEND,
            Arc::new(move |ctx, data| {
                let core = core.clone();
                let registry = registry.clone();
                Box::pin(async move {
                    let user = registry.fail_insecure_socket_id(&ctx.socket_id).await?;
                    let recipient_id = data
                        .get("toUserId")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string();
                    let content = data
                        .get("content")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string();
                    let client_timeout = data
                        .get("clientTimeout")
                        .and_then(|v| v.as_u64())
                        .map(Duration::from_millis);
                    let message = core
                        .send_message(
                            &user.user_id,
                            &user.user_name,
                            SendMessageInput {
                                recipient_id,
                                content,
                                client_timeout,
                            },
                        )
                        .await?;
                    Ok(json!({
                        "messageId": message.message_id,
                        "status": message.status.to_string(),
                    }))
                })
            }),
        );
    }

    {
        let core = message_core.clone();
        let registry = registry.clone();
        dispatcher.register(
            EVENT_MESSAGE_READ,
            Arc::new(move |ctx, data| {
                let core = core.clone();
                let registry = registry.clone();
                Box::pin(async move {
                    let user = registry.fail_insecure_socket_id(&ctx.socket_id).await?;
                    let message_ids: Option<Vec<String>> = data.get("messageIds").and_then(|v| v.as_array()).map(|arr| {
                        arr.iter().filter_map(|v| v.as_str().map(String::from)).collect()
                    });
                    let target = match message_ids {
                        Some(ids) => MarkReadTarget::MessageIds(ids),
                        None => {
                            let peer_id = data
                                .get("senderId")
                                .and_then(|v| v.as_str())
                                .unwrap_or_default()
                                .to_string();
                            MarkReadTarget::Sender(peer_id)
                        }
                    };
                    let updated = core.mark_messages_as_read(&user.user_id, target).await?;
                    Ok(json!({ "updated": updated }))
                })
            }),
        );
    }

    {
        let core = message_core.clone();
        let registry = registry.clone();
        dispatcher.register(
            EVENT_TYPING,
            Arc::new(move |ctx, data| {
                let core = core.clone();
                let registry = registry.clone();
                Box::pin(async move {
                    let user = registry.fail_insecure_socket_id(&ctx.socket_id).await?;
                    let recipient_id = data
                        .get("recipientId")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string();
                    core.typing_indicator(&user.user_id, &recipient_id, true).await?;
                    Ok(json!({ "ok": true }))
                })
            }),
        );
    }

    {
        let core = message_core.clone();
        let registry = registry.clone();
        dispatcher.register(
            EVENT_STOP_TYPING,
            Arc::new(move |ctx, data| {
                let core = core.clone();
                let registry = registry.clone();
                Box::pin(async move {
                    let user = registry.fail_insecure_socket_id(&ctx.socket_id).await?;
                    let recipient_id = data
                        .get("recipientId")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string();
                    core.typing_indicator(&user.user_id, &recipient_id, false).await?;
                    Ok(json!({ "ok": true }))
                })
            }),
        );
    }

    {
        let core = message_core.clone();
        let registry = registry.clone();
        dispatcher.register(
            EVENT_MESSAGE_DELIVERED,
            Arc::new(move |ctx, data| {
                let core = core.clone();
                let registry = registry.clone();
                Box::pin(async move {
                    let user = registry.fail_insecure_socket_id(&ctx.socket_id).await?;
                    let message_ids: Vec<String> = data
                        .get("messageIds")
                        .and_then(|v| v.as_array())
                        .map(|arr| arr.iter().filter_map(|v| v.as_str().map(String::from)).collect())
                        .unwrap_or_default();
                    let marked = core.mark_messages_as_delivered(&user.user_id, &message_ids).await?;
                    Ok(json!({ "marked": marked }))
                })
            }),
        );
    }

    {
        let registry = registry.clone();
        dispatcher.register(
            EVENT_USERS_LIST,
            Arc::new(move |ctx, data| {
                let registry = registry.clone();
                Box::pin(async move {
                    registry.fail_insecure_socket_id(&ctx.socket_id).await?;
                    let limit = data.get("limit").and_then(|v| v.as_u64()).map(|n| n as usize);
                    let offset = data.get("offset").and_then(|v| v.as_u64()).map(|n| n as usize);
                    let users = registry
                        .get_users(crate::registry::GetUsersOptions {
                            states: None,
                            limit,
                            offset,
                        })
                        .await?;
                    Ok(json!({
                        "users": users
                            .iter()
                            .map(|u| json!({
                                "userId": u.user_id,
                                "userName": u.user_name,
                                "state": u.state.to_string(),
                            }))
                            .collect::<Vec<_>>(),
                    }))
                })
            }),
        );
    }

    {
        let registry = registry.clone();
        dispatcher.register(
            EVENT_CONNECTION_METRICS,
            Arc::new(move |ctx, data| {
                let registry = registry.clone();
                Box::pin(async move {
                    registry.fail_insecure_socket_id(&ctx.socket_id).await?;
                    let user_id = data
                        .get("userId")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string();
                    let sockets = registry.get_user_sockets(&user_id).await;
                    Ok(json!({
                        "userId": user_id,
                        "sessionCount": sockets.len(),
                        "sessions": sockets
                            .iter()
                            .map(|s| json!({
                                "socketId": s.socket_id,
                                "connectedAt": s.connected_at,
                                "lastActivity": s.last_activity,
                                "state": s.state.to_string(),
                            }))
                            .collect::<Vec<_>>(),
                    }))
                })
            }),
        );
    }

    {
        let core = message_core.clone();
        let registry = registry.clone();
        dispatcher.register(
            EVENT_PUBLIC_SEND,
            Arc::new(move |ctx, data| {
                let core = core.clone();
                let registry = registry.clone();
                Box::pin(async move {
                    let user = registry.fail_insecure_socket_id(&ctx.socket_id).await?;
                    let content = data
                        .get("content")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string();
                    let message = core.public_broadcast(&user.user_id, &user.user_name, content).await?;
                    Ok(json!({ "messageId": message.message_id }))
                })
            }),
        );
    }

    {
        let core = message_core.clone();
        dispatcher.register(
            EVENT_PUBLIC_HISTORY,
            Arc::new(move |_ctx, data| {
                let core = core.clone();
                Box::pin(async move {
                    let limit = data.get("limit").and_then(|v| v.as_u64()).unwrap_or(50) as usize;
                    let messages = core.get_public_messages(limit).await?;
                    Ok(json!({ "messages": messages }))
                })
            }),
        );
    }

    {
        let core = message_core.clone();
        let registry = registry.clone();
        dispatcher.register(
            EVENT_CONVERSATIONS_LIST,
            Arc::new(move |ctx, data| {
                let core = core.clone();
                let registry = registry.clone();
                Box::pin(async move {
                    let user = registry.fail_insecure_socket_id(&ctx.socket_id).await?;
                    let limit = data.get("limit").and_then(|v| v.as_u64()).unwrap_or(20) as usize;
                    let conversations = core.get_conversations(&user.user_id, limit).await?;
                    Ok(json!({ "conversations": conversations }))
                })
            }),
        );
    }

    {
        let core = message_core.clone();
        let registry = registry.clone();
        dispatcher.register(
            EVENT_MESSAGES_HISTORY,
            Arc::new(move |ctx, data| {
                let core = core.clone();
                let registry = registry.clone();
                Box::pin(async move {
                    let user = registry.fail_insecure_socket_id(&ctx.socket_id).await?;
                    let peer_id = data
                        .get("peerId")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string();
                    let limit = data.get("limit").and_then(|v| v.as_u64()).unwrap_or(50) as usize;
                    let result = core
                        .get_messages(crate::store::GetMessagesOptions {
                            user_id: user.user_id,
                            peer_id,
                            before: None,
                            limit,
                        })
                        .await?;
                    Ok(json!({ "messages": result.messages, "hasMore": result.has_more }))
                })
            }),
        );
    }

    dispatcher
}
