//! Orchestration layer sitting above the raw status state machine: owns the
//! send/track/reconcile/read flows described in §4.3.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use validator::Validate;

use crate::error::{CoreError, CoreResult};
use crate::registry::{Registry, EVERY_ONE_ONLINE};
use crate::store::{
    ConversationsOptions, GetMessagesOptions, GetMessagesResult, MarkReadTarget, Store,
};

use super::{
    allowed_from_statuses, get_request_timeouts, get_safe_timeouts, Direction, Message, MessageStatus,
    RequestTimeouts,
};

const MAX_CONTENT_LEN: u64 = 4096;

#[derive(Debug, Validate)]
pub struct SendMessageInput {
    #[validate(length(min = 1, message = "recipient_id must not be empty"))]
    pub recipient_id: String,
    #[validate(length(min = 1, max = 4096, message = "content must be 1-4096 characters"))]
    pub content: String,
    pub client_timeout: Option<Duration>,
}

/// The fan-out function the gateway layer supplies for actually pushing a
/// named event to a socket and awaiting its ack; kept generic here so this
/// module stays transport-agnostic and test-friendly.
pub type EmitFn = Arc<
    dyn Fn(
            String,
            &'static str,
            serde_json::Value,
            Duration,
        ) -> futures::future::BoxFuture<'static, CoreResult<()>>
        + Send
        + Sync,
>;

pub const EVENT_UPDATE_MESSAGE_STATUS: &str = "update_message_status";
pub const EVENT_TYPING_INDICATOR: &str = "typingIndicator";
pub const EVENT_PUBLIC_MESSAGE: &str = "public_message";

pub struct MessageCore {
    registry: Registry,
    store: Arc<dyn Store>,
    emit: EmitFn,
    message_ack_timeout: Duration,
    pending_reconcile_window: chrono::Duration,
    public_expire_window: chrono::Duration,
}

impl MessageCore {
    pub fn new(
        registry: Registry,
        store: Arc<dyn Store>,
        emit: EmitFn,
        delivery_timeout: Duration,
        pending_reconcile_window_days: i64,
        public_message_expire_days: i64,
    ) -> Self {
        MessageCore {
            registry,
            store,
            emit,
            message_ack_timeout: delivery_timeout,
            pending_reconcile_window: chrono::Duration::days(pending_reconcile_window_days),
            public_expire_window: chrono::Duration::days(public_message_expire_days),
        }
    }

    fn request_timeouts(&self, client_timeout: Option<Duration>) -> RequestTimeouts {
        get_request_timeouts(client_timeout, self.message_ack_timeout)
    }

    /// The per-socket ack budget for status-push notifications that have no
    /// request-scoped `RequestTimeouts` of their own (read receipts, public
    /// broadcasts, typing pings) — the same small `per_emit_timeout` the
    /// delivery path uses, so a handful of non-acking sockets can never add
    /// up past the dispatcher's own handler timeout for the call.
    fn default_per_emit_timeout(&self) -> Duration {
        get_safe_timeouts(self.message_ack_timeout).per_emit_timeout
    }

    /// §4.3.1/§4.3.2 step 4: validate, persist both copies of the pair as
    /// `sent`, then hand the sender's `outgoing` copy off to delivery
    /// tracking. Returns the sender's view of the message regardless of
    /// delivery outcome — delivery failure degrades status, it never fails
    /// the send.
    pub async fn send_message(
        &self,
        from_user_id: &str,
        from_user_name: &str,
        input: SendMessageInput,
    ) -> CoreResult<Message> {
        input
            .validate()
            .map_err(|e| CoreError::Validation(e.to_string()))?;

        let (outgoing, incoming) = Message::new_private_pair(
            from_user_id.to_string(),
            from_user_name.to_string(),
            input.recipient_id,
            input.content,
        );
        self.store.store_message(&outgoing).await?;
        self.store.store_message(&incoming).await?;

        let timeouts = self.request_timeouts(input.client_timeout);
        let tracked = self.track_message_delivery(outgoing, timeouts).await;
        Ok(tracked)
    }

    /// §4.3.2/§4.3.3: advances the pair to `pending` and notifies the
    /// sender's own sockets immediately, then attempts delivery to every
    /// live recipient socket within the per-emit timeout, advancing to
    /// `delivered` and notifying both sender and recipient sockets of the
    /// final status.
    pub async fn track_message_delivery(&self, mut message: Message, timeouts: RequestTimeouts) -> Message {
        let now = Utc::now();
        let _ = self
            .store
            .update_message_status(
                &message.sender_id,
                &message.message_id,
                MessageStatus::Pending,
                allowed_from_statuses(MessageStatus::Pending),
                now,
            )
            .await;
        message.status = MessageStatus::Pending;
        message.updated_at = now;
        self.notify_sender(&message, timeouts.delivery.per_emit_timeout).await;

        let sockets = self.registry.get_user_sockets(&message.recipient_id).await;
        let mut delivered = false;
        if !sockets.is_empty() {
            let payload = self.update_status_payload(&message, Direction::Incoming);
            for session in sockets {
                let result = (self.emit)(
                    session.socket_id.clone(),
                    EVENT_UPDATE_MESSAGE_STATUS,
                    payload.clone(),
                    timeouts.delivery.per_emit_timeout,
                )
                .await;
                if result.is_ok() {
                    delivered = true;
                }
            }
        }

        if delivered {
            let now = Utc::now();
            let _ = self
                .store
                .update_message_status(
                    &message.sender_id,
                    &message.message_id,
                    MessageStatus::Delivered,
                    allowed_from_statuses(MessageStatus::Delivered),
                    now,
                )
                .await;
            message.status = MessageStatus::Delivered;
            message.updated_at = now;
            self.notify_sender(&message, timeouts.delivery.per_emit_timeout).await;
            self.notify_recipient(&message, timeouts.delivery.per_emit_timeout).await;
        }

        message
    }

    /// Pushes `update_message_status` (carrying `status`/`direction`, §6.1)
    /// to every one of the sender's own live sockets, so the originating
    /// session sees `pending` then `delivered` as two separate pushes
    /// (§4.3.3). `per_emit_timeout` bounds each socket's ack wait so a
    /// handful of non-acking sessions can't outlast the caller's own
    /// handler timeout.
    async fn notify_sender(&self, message: &Message, per_emit_timeout: Duration) {
        let payload = self.update_status_payload(message, Direction::Outgoing);
        for session in self.registry.get_user_sockets(&message.sender_id).await {
            let _ = (self.emit)(
                session.socket_id,
                EVENT_UPDATE_MESSAGE_STATUS,
                payload.clone(),
                per_emit_timeout,
            )
            .await;
        }
    }

    async fn notify_recipient(&self, message: &Message, per_emit_timeout: Duration) {
        let payload = self.update_status_payload(message, Direction::Incoming);
        for session in self.registry.get_user_sockets(&message.recipient_id).await {
            let _ = (self.emit)(
                session.socket_id,
                EVENT_UPDATE_MESSAGE_STATUS,
                payload.clone(),
                per_emit_timeout,
            )
            .await;
        }
    }

    fn update_status_payload(&self, message: &Message, direction: Direction) -> serde_json::Value {
        serde_json::json!({
            "messageId": message.message_id,
            "fromUserId": message.sender_id,
            "content": message.content,
            "createdAt": message.created_at,
            "status": message.status.to_string(),
            "direction": direction.to_string(),
        })
    }

    /// §4.3.4: on reconnect, re-attempts delivery for everything still
    /// short of `delivered` within the reconcile window.
    pub async fn reconcile_pending(&self, user_id: &str) -> CoreResult<usize> {
        let since = Utc::now() - self.pending_reconcile_window;
        let pending = self.store.get_pending_messages(user_id, since).await?;
        let timeouts = self.request_timeouts(None);
        let mut reconciled = 0;
        for message in pending {
            let result = self.track_message_delivery(message, timeouts).await;
            if result.status == MessageStatus::Delivered {
                reconciled += 1;
            }
        }
        Ok(reconciled)
    }

    /// §4.3.5: marks the `incoming` rows matched by `target` (either an
    /// explicit message-id set or a whole-conversation sweep against one
    /// sender) as read, then notifies the sender's live sockets so their UI
    /// can reflect the read receipt.
    pub async fn mark_messages_as_read(&self, user_id: &str, target: MarkReadTarget) -> CoreResult<usize> {
        let sender_hint = match &target {
            MarkReadTarget::Sender(peer_id) => Some(peer_id.clone()),
            MarkReadTarget::MessageIds(_) => None,
        };

        let outcome = self.store.mark_messages_read(user_id, target).await?;
        if outcome.updated_message_ids.is_empty() {
            return Ok(0);
        }

        let payload = serde_json::json!({
            "readerId": user_id,
            "messageIds": outcome.updated_message_ids,
        });

        let notify_targets: Vec<String> = match sender_hint {
            Some(peer_id) => vec![peer_id],
            None => {
                let mut senders = Vec::new();
                for message_id in &outcome.updated_message_ids {
                    if let Some(message) = self.store.get_message(message_id, Direction::Incoming).await? {
                        senders.push(message.sender_id);
                    }
                }
                senders.sort();
                senders.dedup();
                senders
            }
        };

        let per_emit_timeout = self.default_per_emit_timeout();
        for peer_id in notify_targets {
            for session in self.registry.get_user_sockets(&peer_id).await {
                let _ = (self.emit)(
                    session.socket_id,
                    EVENT_UPDATE_MESSAGE_STATUS,
                    payload.clone(),
                    per_emit_timeout,
                )
                .await;
            }
        }
        Ok(outcome.updated_message_ids.len())
    }

    /// Client-invoked counterpart to the automatic reconcile sweep's last
    /// step (§4.3.4): marks specific message ids delivered, but only while
    /// they are still `pending` — already-delivered or already-read rows
    /// are left untouched.
    pub async fn mark_messages_as_delivered(&self, user_id: &str, message_ids: &[String]) -> CoreResult<usize> {
        let outcome = self.store.mark_messages_delivered(user_id, message_ids).await?;
        Ok(outcome.updated_message_ids.len())
    }

    pub async fn get_messages(&self, opts: GetMessagesOptions) -> CoreResult<GetMessagesResult> {
        self.store.get_messages(opts).await
    }

    pub async fn get_conversations(&self, user_id: &str, limit: usize) -> CoreResult<Vec<crate::store::ConversationSummary>> {
        self.store
            .get_conversations(ConversationsOptions {
                user_id: user_id.to_string(),
                limit,
            })
            .await
    }

    /// §4.3.7: broadcasts to every currently-connected socket and persists
    /// the message pair so late joiners can backfill via
    /// `get_public_messages`.
    pub async fn public_broadcast(&self, from_user_id: &str, from_user_name: &str, content: String) -> CoreResult<Message> {
        if content.trim().is_empty() || content.len() as u64 > MAX_CONTENT_LEN {
            return Err(CoreError::Validation("content must be 1-4096 characters".into()));
        }

        let (outgoing, incoming) = Message::new_public_pair(from_user_id.to_string(), from_user_name.to_string(), content);
        self.store.store_public_message(&outgoing).await?;
        self.store.store_public_message(&incoming).await?;

        let payload = serde_json::json!({
            "messageId": outgoing.message_id,
            "fromUserId": outgoing.sender_id,
            "content": outgoing.content,
            "createdAt": outgoing.created_at,
        });
        let per_emit_timeout = self.default_per_emit_timeout();
        for user in self.registry.get_users(Default::default()).await? {
            if user.user_id == from_user_id {
                continue;
            }
            for session in user.sockets {
                let _ = (self.emit)(
                    session.socket_id,
                    EVENT_PUBLIC_MESSAGE,
                    payload.clone(),
                    per_emit_timeout,
                )
                .await;
            }
        }
        Ok(outgoing)
    }

    pub async fn get_public_messages(&self, limit: usize) -> CoreResult<Vec<Message>> {
        let since = Utc::now() - self.public_expire_window;
        self.store.get_public_messages(since, limit).await
    }

    /// Lightweight presence ping with no persistence and no ack requirement,
    /// fire-and-forget to every co-connected socket except the sender's own.
    /// Covers both `typing` and `stopTyping` — the only difference is the
    /// `is_typing` flag threaded through to the recipient.
    pub async fn typing_indicator(&self, from_user_id: &str, to_user_id: &str, is_typing: bool) -> CoreResult<()> {
        if to_user_id == EVERY_ONE_ONLINE {
            return Err(CoreError::Validation("typing indicator is not supported in the public room".into()));
        }
        let payload = serde_json::json!({
            "success": true,
            "event": EVENT_TYPING_INDICATOR,
            "sender": from_user_id,
            "isTyping": is_typing,
            "timestamp": Utc::now(),
        });
        let per_emit_timeout = self.default_per_emit_timeout();
        for session in self.registry.get_user_sockets(to_user_id).await {
            let _ = (self.emit)(
                session.socket_id,
                EVENT_TYPING_INDICATOR,
                payload.clone(),
                per_emit_timeout,
            )
            .await;
        }
        Ok(())
    }
}
