//! `Store` backed by PostgreSQL, used when `USER_MANAGER_PERSIST=postgresql`.
//!
//! Follows the teacher's direct-sqlx idiom: bind-chained `query`/
//! `query_scalar` calls against a shared [`sqlx::PgPool`], no ORM layer.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use std::str::FromStr;
use std::time::Duration as StdDuration;

use crate::error::{CoreError, CoreResult};
use crate::message::{Direction, Message, MessageStatus, MessageType};
use crate::registry::{Session, User, UserState};

use super::{
    ConversationSummary, ConversationsOptions, GetMessagesOptions, GetMessagesResult,
    GetUsersQuery, MarkReadOutcome, MarkReadTarget, Store,
};

const UNIQUE_VIOLATION: &str = "23505";

pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> CoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(StdDuration::from_secs(5))
            .connect(database_url)
            .await
            .map_err(CoreError::from)?;
        Ok(PostgresStore { pool })
    }

    pub async fn run_migrations(&self) -> CoreResult<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| CoreError::Storage(e.to_string()))?;
        Ok(())
    }

    pub async fn health_check(&self) -> CoreResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(CoreError::from)?;
        Ok(())
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some(UNIQUE_VIOLATION))
}

fn row_to_message(row: &sqlx::postgres::PgRow) -> Result<Message, sqlx::Error> {
    let status_str: String = row.try_get("status")?;
    let type_str: String = row.try_get("message_type")?;
    let direction_str: String = row.try_get("direction")?;
    Ok(Message {
        message_id: row.try_get("message_id")?,
        sender_id: row.try_get("sender_id")?,
        sender_name: row.try_get("sender_name")?,
        recipient_id: row.try_get("recipient_id")?,
        content: row.try_get("content")?,
        message_type: MessageType::from_str(&type_str).unwrap_or(MessageType::Private),
        status: MessageStatus::from_str(&status_str).unwrap_or(MessageStatus::Sent),
        direction: Direction::from_str(&direction_str).unwrap_or(Direction::Outgoing),
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        read_at: row.try_get("read_at")?,
    })
}

#[async_trait]
impl Store for PostgresStore {
    async fn store_user(&self, user: &User) -> CoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO user_sessions (user_id, user_name, state, connected_at, last_activity)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (user_id) DO UPDATE
              SET user_name = EXCLUDED.user_name,
                  state = EXCLUDED.state,
                  last_activity = EXCLUDED.last_activity
            "#,
        )
        .bind(&user.user_id)
        .bind(&user.user_name)
        .bind(user.state.to_string())
        .bind(user.connected_at)
        .bind(user.last_activity)
        .execute(&self.pool)
        .await
        .map_err(CoreError::from)?;
        Ok(())
    }

    async fn get_users(&self, query: GetUsersQuery) -> CoreResult<Vec<User>> {
        let limit = query.limit.unwrap_or(100) as i64;
        let offset = query.offset.unwrap_or(0) as i64;
        let state_filter: Option<Vec<String>> = query
            .states
            .map(|states| states.iter().map(|s| s.to_string()).collect());

        let rows = sqlx::query(
            r#"
            SELECT user_id, user_name, state, connected_at, last_activity
            FROM user_sessions
            WHERE $1::text[] IS NULL OR state = ANY($1)
            ORDER BY user_id
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(state_filter)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
        .map_err(CoreError::from)?;

        let mut users = Vec::with_capacity(rows.len());
        for row in rows {
            let state_str: String = row.try_get("state").map_err(CoreError::from)?;
            users.push(User {
                user_id: row.try_get("user_id").map_err(CoreError::from)?,
                user_name: row.try_get("user_name").map_err(CoreError::from)?,
                state: UserState::from_str(&state_str).unwrap_or(UserState::Offline),
                sockets: Vec::<Session>::new(),
                connected_at: row.try_get("connected_at").map_err(CoreError::from)?,
                last_activity: row.try_get("last_activity").map_err(CoreError::from)?,
            });
        }
        Ok(users)
    }

    async fn get_user(&self, user_id: &str) -> CoreResult<Option<User>> {
        let row = sqlx::query(
            r#"
            SELECT user_id, user_name, state, connected_at, last_activity
            FROM user_sessions WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(CoreError::from)?;

        match row {
            None => Ok(None),
            Some(row) => {
                let state_str: String = row.try_get("state").map_err(CoreError::from)?;
                Ok(Some(User {
                    user_id: row.try_get("user_id").map_err(CoreError::from)?,
                    user_name: row.try_get("user_name").map_err(CoreError::from)?,
                    state: UserState::from_str(&state_str).unwrap_or(UserState::Offline),
                    sockets: Vec::new(),
                    connected_at: row.try_get("connected_at").map_err(CoreError::from)?,
                    last_activity: row.try_get("last_activity").map_err(CoreError::from)?,
                }))
            }
        }
    }

    async fn store_message(&self, message: &Message) -> CoreResult<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO messages
                (message_id, sender_id, sender_name, recipient_id, content, message_type,
                 status, direction, created_at, updated_at, read_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (message_id, direction) DO UPDATE
              SET content = EXCLUDED.content,
                  status = EXCLUDED.status,
                  updated_at = EXCLUDED.updated_at,
                  read_at = EXCLUDED.read_at
            "#,
        )
        .bind(&message.message_id)
        .bind(&message.sender_id)
        .bind(&message.sender_name)
        .bind(&message.recipient_id)
        .bind(&message.content)
        .bind(message.message_type.to_string())
        .bind(message.status.to_string())
        .bind(message.direction.to_string())
        .bind(message.created_at)
        .bind(message.updated_at)
        .bind(message.read_at)
        .execute(&self.pool)
        .await;

        // A re-issued storeMessage for an id already upserted by a racing
        // call collapses to a benign no-op rather than an error (§10.2).
        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Ok(()),
            Err(e) => Err(CoreError::from(e)),
        }
    }

    async fn get_message(&self, message_id: &str, direction: Direction) -> CoreResult<Option<Message>> {
        let row = sqlx::query("SELECT * FROM messages WHERE message_id = $1 AND direction = $2")
            .bind(message_id)
            .bind(direction.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(CoreError::from)?;
        row.as_ref()
            .map(row_to_message)
            .transpose()
            .map_err(CoreError::from)
    }

    async fn update_message_status(
        &self,
        sender_id: &str,
        message_id: &str,
        status: MessageStatus,
        from_statuses: &[MessageStatus],
        at: DateTime<Utc>,
    ) -> CoreResult<bool> {
        let from_statuses: Vec<String> = from_statuses.iter().map(|s| s.to_string()).collect();
        let read_at: Option<DateTime<Utc>> = (status == MessageStatus::Read).then_some(at);

        // Restricted to sender_id + message_id + status ∈ from_statuses;
        // both `incoming` and `outgoing` copies share those columns, so one
        // statement advances both without naming `direction`.
        let rows = sqlx::query(
            r#"
            UPDATE messages
            SET status = $1,
                updated_at = $2,
                read_at = COALESCE($3, read_at)
            WHERE sender_id = $4
              AND message_id = $5
              AND status = ANY($6)
            "#,
        )
        .bind(status.to_string())
        .bind(at)
        .bind(read_at)
        .bind(sender_id)
        .bind(message_id)
        .bind(from_statuses)
        .execute(&self.pool)
        .await
        .map_err(CoreError::from)?;

        Ok(rows.rows_affected() > 0)
    }

    async fn get_pending_messages(
        &self,
        user_id: &str,
        since: DateTime<Utc>,
    ) -> CoreResult<Vec<Message>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM messages
            WHERE recipient_id = $1
              AND direction = 'incoming'
              AND created_at >= $2
              AND status IN ('sent', 'pending')
            ORDER BY created_at ASC
            "#,
        )
        .bind(user_id)
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .map_err(CoreError::from)?;

        rows.iter()
            .map(row_to_message)
            .collect::<Result<Vec<_>, _>>()
            .map_err(CoreError::from)
    }

    async fn get_messages(&self, opts: GetMessagesOptions) -> CoreResult<GetMessagesResult> {
        let limit = opts.limit as i64;
        // Only the `outgoing` copy is read back, one row per logical
        // message, to avoid double-counting its `incoming` twin.
        let rows = sqlx::query(
            r#"
            SELECT * FROM messages
            WHERE direction = 'outgoing'
              AND ((sender_id = $1 AND recipient_id = $2)
                OR (sender_id = $2 AND recipient_id = $1))
              AND ($3::timestamptz IS NULL OR created_at < $3)
            ORDER BY created_at DESC
            LIMIT $4
            "#,
        )
        .bind(&opts.user_id)
        .bind(&opts.peer_id)
        .bind(opts.before)
        .bind(limit + 1)
        .fetch_all(&self.pool)
        .await
        .map_err(CoreError::from)?;

        let mut messages = rows
            .iter()
            .map(row_to_message)
            .collect::<Result<Vec<_>, _>>()
            .map_err(CoreError::from)?;
        let has_more = messages.len() as i64 > limit;
        messages.truncate(opts.limit);
        Ok(GetMessagesResult { messages, has_more })
    }

    async fn mark_messages_read(&self, user_id: &str, target: MarkReadTarget) -> CoreResult<MarkReadOutcome> {
        let rows = match target {
            MarkReadTarget::Sender(peer_id) => {
                sqlx::query(
                    r#"
                    UPDATE messages
                    SET status = 'read', read_at = now(), updated_at = now()
                    WHERE recipient_id = $1
                      AND direction = 'incoming'
                      AND sender_id = $2
                      AND status <> 'read'
                    RETURNING message_id
                    "#,
                )
                .bind(user_id)
                .bind(peer_id)
                .fetch_all(&self.pool)
                .await
            }
            MarkReadTarget::MessageIds(message_ids) => {
                sqlx::query(
                    r#"
                    UPDATE messages
                    SET status = 'read', read_at = now(), updated_at = now()
                    WHERE recipient_id = $1
                      AND direction = 'incoming'
                      AND message_id = ANY($2)
                      AND status <> 'read'
                    RETURNING message_id
                    "#,
                )
                .bind(user_id)
                .bind(message_ids)
                .fetch_all(&self.pool)
                .await
            }
        }
        .map_err(CoreError::from)?;

        let updated_message_ids = rows
            .iter()
            .map(|r| r.try_get::<String, _>("message_id"))
            .collect::<Result<Vec<_>, _>>()
            .map_err(CoreError::from)?;
        Ok(MarkReadOutcome { updated_message_ids })
    }

    async fn mark_messages_delivered(&self, user_id: &str, message_ids: &[String]) -> CoreResult<MarkReadOutcome> {
        let rows = sqlx::query(
            r#"
            UPDATE messages
            SET status = 'delivered', updated_at = now()
            WHERE recipient_id = $1
              AND direction = 'incoming'
              AND message_id = ANY($2)
              AND status = 'pending'
            RETURNING message_id
            "#,
        )
        .bind(user_id)
        .bind(message_ids)
        .fetch_all(&self.pool)
        .await
        .map_err(CoreError::from)?;

        let updated_message_ids = rows
            .iter()
            .map(|r| r.try_get::<String, _>("message_id"))
            .collect::<Result<Vec<_>, _>>()
            .map_err(CoreError::from)?;
        Ok(MarkReadOutcome { updated_message_ids })
    }

    async fn get_conversations(
        &self,
        opts: ConversationsOptions,
    ) -> CoreResult<Vec<ConversationSummary>> {
        let limit = opts.limit as i64;
        let rows = sqlx::query(
            r#"
            SELECT
                peer_id,
                MAX(last_message_at) AS last_message_at,
                COALESCE(SUM(unread_count), 0) AS unread_count
            FROM (
                SELECT recipient_id AS peer_id, MAX(created_at) AS last_message_at, 0::bigint AS unread_count
                FROM messages
                WHERE direction = 'outgoing' AND sender_id = $1
                GROUP BY recipient_id

                UNION ALL

                SELECT sender_id AS peer_id, MAX(created_at) AS last_message_at,
                       COUNT(*) FILTER (WHERE status <> 'read') AS unread_count
                FROM messages
                WHERE direction = 'incoming' AND recipient_id = $1
                GROUP BY sender_id
            ) AS combined
            GROUP BY peer_id
            ORDER BY last_message_at DESC
            LIMIT $2
            "#,
        )
        .bind(&opts.user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(CoreError::from)?;

        let mut summaries = Vec::with_capacity(rows.len());
        for row in rows {
            summaries.push(ConversationSummary {
                peer_id: row.try_get("peer_id").map_err(CoreError::from)?,
                last_message_at: row.try_get("last_message_at").map_err(CoreError::from)?,
                unread_count: row.try_get("unread_count").map_err(CoreError::from)?,
            });
        }
        Ok(summaries)
    }

    async fn get_public_messages(&self, since: DateTime<Utc>, limit: usize) -> CoreResult<Vec<Message>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM messages
            WHERE message_type = 'public' AND direction = 'outgoing' AND updated_at >= $1
            ORDER BY updated_at DESC
            LIMIT $2
            "#,
        )
        .bind(since)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(CoreError::from)?;

        rows.iter()
            .map(row_to_message)
            .collect::<Result<Vec<_>, _>>()
            .map_err(CoreError::from)
    }

    async fn store_public_message(&self, message: &Message) -> CoreResult<()> {
        self.store_message(message).await
    }
}
