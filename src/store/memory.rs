//! In-memory `Store` backing `development`/`test` (`USER_MANAGER_PERSIST`
//! unset or anything other than `postgresql`).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::error::CoreResult;
use crate::message::{Direction, Message, MessageStatus};
use crate::registry::{User, UserState};

use super::{
    ConversationSummary, ConversationsOptions, GetMessagesOptions, GetMessagesResult,
    GetUsersQuery, MarkReadOutcome, MarkReadTarget, Store,
};

#[derive(Default)]
struct Inner {
    users: HashMap<String, User>,
    messages: HashMap<(String, Direction), Message>,
    public_messages: Vec<Message>,
}

pub struct MemoryStore {
    inner: Arc<RwLock<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore {
            inner: Arc::new(RwLock::new(Inner::default())),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn store_user(&self, user: &User) -> CoreResult<()> {
        self.inner
            .write()
            .await
            .users
            .insert(user.user_id.clone(), user.clone());
        Ok(())
    }

    async fn get_users(&self, query: GetUsersQuery) -> CoreResult<Vec<User>> {
        let inner = self.inner.read().await;
        let mut users: Vec<User> = inner
            .users
            .values()
            .filter(|u| {
                query
                    .states
                    .as_ref()
                    .map(|states| states.contains(&u.state))
                    .unwrap_or(true)
            })
            .cloned()
            .collect();
        users.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        let offset = query.offset.unwrap_or(0);
        let limit = query.limit.unwrap_or(users.len());
        Ok(users.into_iter().skip(offset).take(limit).collect())
    }

    async fn get_user(&self, user_id: &str) -> CoreResult<Option<User>> {
        Ok(self.inner.read().await.users.get(user_id).cloned())
    }

    async fn store_message(&self, message: &Message) -> CoreResult<()> {
        self.inner
            .write()
            .await
            .messages
            .insert((message.message_id.clone(), message.direction), message.clone());
        Ok(())
    }

    async fn get_message(&self, message_id: &str, direction: Direction) -> CoreResult<Option<Message>> {
        Ok(self
            .inner
            .read()
            .await
            .messages
            .get(&(message_id.to_string(), direction))
            .cloned())
    }

    async fn update_message_status(
        &self,
        sender_id: &str,
        message_id: &str,
        status: MessageStatus,
        from_statuses: &[MessageStatus],
        at: DateTime<Utc>,
    ) -> CoreResult<bool> {
        let mut inner = self.inner.write().await;
        let mut updated = false;
        for direction in [Direction::Outgoing, Direction::Incoming] {
            if let Some(message) = inner.messages.get_mut(&(message_id.to_string(), direction)) {
                if message.sender_id == sender_id && from_statuses.contains(&message.status) {
                    message.status = status;
                    message.updated_at = at;
                    if status == MessageStatus::Read {
                        message.read_at = Some(at);
                    }
                    updated = true;
                }
            }
        }
        Ok(updated)
    }

    async fn get_pending_messages(
        &self,
        user_id: &str,
        since: DateTime<Utc>,
    ) -> CoreResult<Vec<Message>> {
        let inner = self.inner.read().await;
        let mut pending: Vec<Message> = inner
            .messages
            .values()
            .filter(|m| {
                m.direction == Direction::Incoming
                    && m.recipient_id == user_id
                    && m.created_at >= since
                    && matches!(m.status, MessageStatus::Sent | MessageStatus::Pending)
            })
            .cloned()
            .collect();
        pending.sort_by_key(|m| m.created_at);
        Ok(pending)
    }

    async fn get_messages(&self, opts: GetMessagesOptions) -> CoreResult<GetMessagesResult> {
        let inner = self.inner.read().await;
        // Only the sender's `outgoing` copy is read back, one row per
        // logical message, to avoid double-counting its `incoming` twin.
        let mut conversation: Vec<Message> = inner
            .messages
            .values()
            .filter(|m| m.direction == Direction::Outgoing)
            .filter(|m| {
                (m.sender_id == opts.user_id && m.recipient_id == opts.peer_id)
                    || (m.sender_id == opts.peer_id && m.recipient_id == opts.user_id)
            })
            .filter(|m| opts.before.map(|b| m.created_at < b).unwrap_or(true))
            .cloned()
            .collect();
        conversation.sort_by_key(|m| std::cmp::Reverse(m.updated_at));

        let has_more = conversation.len() > opts.limit;
        conversation.truncate(opts.limit);
        Ok(GetMessagesResult {
            messages: conversation,
            has_more,
        })
    }

    async fn mark_messages_read(&self, user_id: &str, target: MarkReadTarget) -> CoreResult<MarkReadOutcome> {
        let mut inner = self.inner.write().await;
        let mut updated = Vec::new();
        for message in inner.messages.values_mut() {
            if message.direction != Direction::Incoming || message.recipient_id != user_id || message.read_at.is_some()
            {
                continue;
            }
            let matches = match &target {
                MarkReadTarget::Sender(peer_id) => &message.sender_id == peer_id,
                MarkReadTarget::MessageIds(ids) => ids.contains(&message.message_id),
            };
            if matches {
                let now = Utc::now();
                message.status = MessageStatus::Read;
                message.read_at = Some(now);
                message.updated_at = now;
                updated.push(message.message_id.clone());
            }
        }
        Ok(MarkReadOutcome {
            updated_message_ids: updated,
        })
    }

    async fn mark_messages_delivered(&self, user_id: &str, message_ids: &[String]) -> CoreResult<MarkReadOutcome> {
        let mut inner = self.inner.write().await;
        let mut updated = Vec::new();
        for message_id in message_ids {
            if let Some(message) = inner.messages.get_mut(&(message_id.clone(), Direction::Incoming)) {
                if message.recipient_id == user_id && message.status == MessageStatus::Pending {
                    let now = Utc::now();
                    message.status = MessageStatus::Delivered;
                    message.updated_at = now;
                    updated.push(message.message_id.clone());
                }
            }
        }
        Ok(MarkReadOutcome {
            updated_message_ids: updated,
        })
    }

    async fn get_conversations(
        &self,
        opts: ConversationsOptions,
    ) -> CoreResult<Vec<ConversationSummary>> {
        let inner = self.inner.read().await;
        let mut by_peer: HashMap<String, ConversationSummary> = HashMap::new();
        for message in inner.messages.values().filter(|m| m.direction == Direction::Outgoing) {
            let peer_id = if message.sender_id == opts.user_id {
                message.recipient_id.clone()
            } else if message.recipient_id == opts.user_id {
                message.sender_id.clone()
            } else {
                continue;
            };
            let entry = by_peer.entry(peer_id.clone()).or_insert(ConversationSummary {
                peer_id,
                last_message_at: message.updated_at,
                unread_count: 0,
            });
            if message.updated_at > entry.last_message_at {
                entry.last_message_at = message.updated_at;
            }
        }
        for message in inner.messages.values().filter(|m| {
            m.direction == Direction::Incoming && m.recipient_id == opts.user_id && m.status != MessageStatus::Read
        }) {
            if let Some(entry) = by_peer.get_mut(&message.sender_id) {
                entry.unread_count += 1;
            }
        }
        let mut summaries: Vec<ConversationSummary> = by_peer.into_values().collect();
        summaries.sort_by_key(|c| std::cmp::Reverse(c.last_message_at));
        summaries.truncate(opts.limit);
        Ok(summaries)
    }

    async fn get_public_messages(&self, since: DateTime<Utc>, limit: usize) -> CoreResult<Vec<Message>> {
        let inner = self.inner.read().await;
        let mut messages: Vec<Message> = inner
            .public_messages
            .iter()
            .filter(|m| m.direction == Direction::Outgoing && m.updated_at >= since)
            .cloned()
            .collect();
        messages.sort_by_key(|m| std::cmp::Reverse(m.updated_at));
        messages.truncate(limit);
        Ok(messages)
    }

    async fn store_public_message(&self, message: &Message) -> CoreResult<()> {
        self.inner.write().await.public_messages.push(message.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageType;

    fn user(id: &str) -> User {
        User {
            user_id: id.to_string(),
            user_name: format!("name-{id}"),
            state: UserState::Authenticated,
            sockets: Vec::new(),
            connected_at: Utc::now(),
            last_activity: Utc::now(),
        }
    }

    async fn store_private(store: &MemoryStore, sender: &str, recipient: &str, content: &str) -> Message {
        let (outgoing, incoming) = Message::new_private_pair(
            sender.to_string(),
            format!("name-{sender}"),
            recipient.to_string(),
            content.to_string(),
        );
        store.store_message(&outgoing).await.unwrap();
        store.store_message(&incoming).await.unwrap();
        outgoing
    }

    #[tokio::test]
    async fn store_and_fetch_user_roundtrips() {
        let store = MemoryStore::new();
        store.store_user(&user("alice")).await.unwrap();
        let fetched = store.get_user("alice").await.unwrap().unwrap();
        assert_eq!(fetched.user_id, "alice");
    }

    #[tokio::test]
    async fn store_message_persists_both_copies() {
        let store = MemoryStore::new();
        let outgoing = store_private(&store, "a", "b", "hi").await;

        let fetched_outgoing = store
            .get_message(&outgoing.message_id, Direction::Outgoing)
            .await
            .unwrap()
            .unwrap();
        let fetched_incoming = store
            .get_message(&outgoing.message_id, Direction::Incoming)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fetched_outgoing.sender_id, "a");
        assert_eq!(fetched_incoming.recipient_id, "b");
        assert_eq!(fetched_outgoing.message_id, fetched_incoming.message_id);
    }

    #[tokio::test]
    async fn update_message_status_advances_both_copies_together() {
        let store = MemoryStore::new();
        let outgoing = store_private(&store, "a", "b", "hi").await;

        let updated = store
            .update_message_status(
                "a",
                &outgoing.message_id,
                MessageStatus::Pending,
                &[MessageStatus::Sent],
                Utc::now(),
            )
            .await
            .unwrap();
        assert!(updated);

        let out = store
            .get_message(&outgoing.message_id, Direction::Outgoing)
            .await
            .unwrap()
            .unwrap();
        let inc = store
            .get_message(&outgoing.message_id, Direction::Incoming)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(out.status, MessageStatus::Pending);
        assert_eq!(inc.status, MessageStatus::Pending);
    }

    #[tokio::test]
    async fn update_message_status_rejects_wrong_sender_or_status() {
        let store = MemoryStore::new();
        let outgoing = store_private(&store, "a", "b", "hi").await;

        let wrong_sender = store
            .update_message_status(
                "b",
                &outgoing.message_id,
                MessageStatus::Pending,
                &[MessageStatus::Sent],
                Utc::now(),
            )
            .await
            .unwrap();
        assert!(!wrong_sender);

        let wrong_from_status = store
            .update_message_status(
                "a",
                &outgoing.message_id,
                MessageStatus::Delivered,
                &[MessageStatus::Pending],
                Utc::now(),
            )
            .await
            .unwrap();
        assert!(!wrong_from_status);
    }

    #[tokio::test]
    async fn pending_messages_excludes_delivered() {
        let store = MemoryStore::new();
        store_private(&store, "a", "b", "hi").await;
        let delivered = store_private(&store, "a", "b", "yo").await;
        store
            .update_message_status(
                "a",
                &delivered.message_id,
                MessageStatus::Pending,
                &[MessageStatus::Sent],
                Utc::now(),
            )
            .await
            .unwrap();
        store
            .update_message_status(
                "a",
                &delivered.message_id,
                MessageStatus::Delivered,
                &[MessageStatus::Pending],
                Utc::now(),
            )
            .await
            .unwrap();

        let pending = store
            .get_pending_messages("b", Utc::now() - chrono::Duration::days(1))
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
    }

    #[tokio::test]
    async fn get_messages_paginates_newest_first_and_dedupes_copies() {
        let store = MemoryStore::new();
        for i in 0..5 {
            store_private(&store, "a", "b", &format!("msg-{i}")).await;
        }
        let result = store
            .get_messages(GetMessagesOptions {
                user_id: "a".into(),
                peer_id: "b".into(),
                before: None,
                limit: 3,
            })
            .await
            .unwrap();
        assert_eq!(result.messages.len(), 3);
        assert!(result.has_more);
    }

    #[tokio::test]
    async fn mark_messages_read_by_sender_updates_only_incoming_copy() {
        let store = MemoryStore::new();
        let outgoing = store_private(&store, "peer", "me", "hi").await;

        let outcome = store
            .mark_messages_read("me", MarkReadTarget::Sender("peer".into()))
            .await
            .unwrap();
        assert_eq!(outcome.updated_message_ids.len(), 1);

        let incoming = store
            .get_message(&outgoing.message_id, Direction::Incoming)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(incoming.status, MessageStatus::Read);

        let still_sent = store
            .get_message(&outgoing.message_id, Direction::Outgoing)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(still_sent.status, MessageStatus::Sent);
    }

    #[tokio::test]
    async fn mark_messages_read_by_explicit_ids() {
        let store = MemoryStore::new();
        let first = store_private(&store, "peer", "me", "hi").await;
        let second = store_private(&store, "peer", "me", "yo").await;

        let outcome = store
            .mark_messages_read("me", MarkReadTarget::MessageIds(vec![first.message_id.clone()]))
            .await
            .unwrap();
        assert_eq!(outcome.updated_message_ids, vec![first.message_id]);

        let untouched = store
            .get_message(&second.message_id, Direction::Incoming)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(untouched.status, MessageStatus::Sent);
    }

    #[tokio::test]
    async fn public_messages_are_isolated_from_private_store() {
        let store = MemoryStore::new();
        let (outgoing, incoming) = Message::new_public_pair("alice".into(), "Alice".into(), "hello everyone".into());
        assert_eq!(outgoing.message_type, MessageType::Public);
        store.store_public_message(&outgoing).await.unwrap();
        store.store_public_message(&incoming).await.unwrap();

        let since = Utc::now() - chrono::Duration::minutes(1);
        let messages = store.get_public_messages(since, 50).await.unwrap();
        assert_eq!(messages.len(), 1);

        let private = store
            .get_messages(GetMessagesOptions {
                user_id: "alice".into(),
                peer_id: crate::registry::EVERY_ONE_ONLINE.into(),
                before: None,
                limit: 50,
            })
            .await
            .unwrap();
        assert!(private.messages.is_empty());
    }
}
