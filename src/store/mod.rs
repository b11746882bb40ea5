//! Persistence abstraction (§4.5): one async trait, two implementations.
//!
//! [`memory::MemoryStore`] backs `development`/`test` environments.
//! [`postgres::PostgresStore`] backs `production`, in the teacher's direct
//! sqlx idiom (`query_as!`-free, bind-chained queries against a connection
//! pool — no ORM layer).

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::CoreResult;
use crate::message::{Direction, Message, MessageStatus};
use crate::registry::{User, UserState};

#[derive(Debug, Default, Clone)]
pub struct GetUsersQuery {
    pub states: Option<Vec<UserState>>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct GetMessagesOptions {
    pub user_id: String,
    pub peer_id: String,
    pub before: Option<DateTime<Utc>>,
    pub limit: usize,
}

#[derive(Debug, Clone)]
pub struct GetMessagesResult {
    pub messages: Vec<Message>,
    pub has_more: bool,
}

#[derive(Debug, Clone)]
pub struct ConversationsOptions {
    pub user_id: String,
    pub limit: usize,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ConversationSummary {
    pub peer_id: String,
    pub last_message_at: DateTime<Utc>,
    pub unread_count: i64,
}

#[derive(Debug, Clone)]
pub struct MarkReadOutcome {
    pub updated_message_ids: Vec<String>,
}

/// §4.5: `markMessagesAsRead` accepts either an explicit set of message ids
/// or a whole-conversation sweep against one sender.
#[derive(Debug, Clone)]
pub enum MarkReadTarget {
    Sender(String),
    MessageIds(Vec<String>),
}

/// Everything the gateway core needs from durable storage. Implementations
/// must be `Send + Sync` so a single `Arc<dyn Store>` can be shared across
/// every connection task.
#[async_trait]
pub trait Store: Send + Sync {
    async fn store_user(&self, user: &User) -> CoreResult<()>;
    async fn get_users(&self, query: GetUsersQuery) -> CoreResult<Vec<User>>;
    async fn get_user(&self, user_id: &str) -> CoreResult<Option<User>>;

    /// Upserts one row of a message pair, keyed by `(message_id, direction)`
    /// (§3, §6.4). A private send calls this twice — once per copy.
    async fn store_message(&self, message: &Message) -> CoreResult<()>;

    async fn get_message(&self, message_id: &str, direction: Direction) -> CoreResult<Option<Message>>;

    /// Conditional update restricted to `sender_id = sender_id AND
    /// message_id = message_id AND status IN from_statuses` (§4.5). Both
    /// directions share `sender_id`/`message_id`, so one call advances both
    /// copies together without ever naming `direction` in the guard.
    /// Returns whether a row was actually updated.
    async fn update_message_status(
        &self,
        sender_id: &str,
        message_id: &str,
        status: MessageStatus,
        from_statuses: &[MessageStatus],
        at: DateTime<Utc>,
    ) -> CoreResult<bool>;

    /// Messages addressed to `user_id` (incoming, private) still short of
    /// `delivered`, used by the reconnect-time reconciliation sweep (§4.3.4).
    /// Bounded to the `PENDING_RECONCILE_WINDOW_DAYS` window by the caller.
    async fn get_pending_messages(
        &self,
        user_id: &str,
        since: DateTime<Utc>,
    ) -> CoreResult<Vec<Message>>;

    async fn get_messages(&self, opts: GetMessagesOptions) -> CoreResult<GetMessagesResult>;

    /// §4.3.5: marks unread `incoming` rows as read, filtered by either
    /// conversation partner or an explicit id set.
    async fn mark_messages_read(&self, user_id: &str, target: MarkReadTarget) -> CoreResult<MarkReadOutcome>;

    /// Advances specific `incoming` rows to `delivered`, but only while they
    /// are still short of it — already-delivered/read rows are untouched.
    async fn mark_messages_delivered(&self, user_id: &str, message_ids: &[String]) -> CoreResult<MarkReadOutcome>;

    async fn get_conversations(
        &self,
        opts: ConversationsOptions,
    ) -> CoreResult<Vec<ConversationSummary>>;

    /// Public-room history (§4.3.7), capped at `PUBLIC_MESSAGE_EXPIRE_DAYS`.
    async fn get_public_messages(&self, since: DateTime<Utc>, limit: usize) -> CoreResult<Vec<Message>>;

    async fn store_public_message(&self, message: &Message) -> CoreResult<()>;
}
