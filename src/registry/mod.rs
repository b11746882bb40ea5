//! The user registry: single source of truth for live connection topology.
//!
//! Owns the in-memory `userId -> User` map and the `socketId -> userId`
//! index exclusively — no other module reaches into these maps directly.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::store::Store;

/// Reserved recipient id for the single public room.
pub const EVERY_ONE_ONLINE: &str = "EVERY_ONE_ONLINE";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum SessionState {
    Connected,
    Authenticated,
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum UserState {
    Connected,
    Authenticated,
    Disconnected,
    Offline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    Manual,
    Inactivity,
}

impl DisconnectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DisconnectReason::Manual => "manual",
            DisconnectReason::Inactivity => "inactivity",
        }
    }
}

/// The identity claim produced by the token verifier, handed to
/// [`Registry::store_user`] on a successful auth gate pass.
#[derive(Debug, Clone)]
pub struct Identity {
    pub user_id: String,
    pub user_name: String,
}

/// One live transport connection belonging to one user.
#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub socket_id: String,
    pub session_id: Uuid,
    pub connected_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub state: SessionState,
}

impl Session {
    fn new(socket_id: String, authenticated: bool) -> Self {
        let now = Utc::now();
        Session {
            socket_id,
            session_id: Uuid::new_v4(),
            connected_at: now,
            last_activity: now,
            state: if authenticated {
                SessionState::Authenticated
            } else {
                SessionState::Connected
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct User {
    pub user_id: String,
    pub user_name: String,
    pub state: UserState,
    pub sockets: Vec<Session>,
    pub connected_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

impl User {
    fn new(identity: &Identity) -> Self {
        let now = Utc::now();
        User {
            user_id: identity.user_id.clone(),
            user_name: identity.user_name.clone(),
            state: UserState::Offline,
            sockets: Vec::new(),
            connected_at: now,
            last_activity: now,
        }
    }

    /// State reduction rule (§4.1): `offline` if empty; `authenticated` if
    /// any session authenticated; `connected` if any session connected;
    /// otherwise `disconnected`.
    fn recompute_state(&mut self) {
        self.state = if self.sockets.is_empty() {
            UserState::Offline
        } else if self
            .sockets
            .iter()
            .any(|s| s.state == SessionState::Authenticated)
        {
            UserState::Authenticated
        } else if self
            .sockets
            .iter()
            .any(|s| s.state == SessionState::Connected)
        {
            UserState::Connected
        } else {
            UserState::Disconnected
        };
        if let Some(latest) = self.sockets.iter().map(|s| s.last_activity).max() {
            self.last_activity = latest;
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct GetUsersOptions {
    pub states: Option<Vec<UserState>>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

/// Cumulative connection counters backing `GET /health`.
#[derive(Debug, Default)]
pub struct Metrics {
    pub total_connections: AtomicU64,
    pub disconnections: AtomicU64,
    pub errors: AtomicU64,
}

impl Metrics {
    pub fn record_connect(&self) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
    }
    pub fn record_disconnect(&self) {
        self.disconnections.fetch_add(1, Ordering::Relaxed);
    }
    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }
}

pub struct DisconnectOutcome {
    pub user: User,
    /// True when this disconnect emptied the user's session list —
    /// the caller should broadcast `user_disconnected`.
    pub went_offline: bool,
}

struct RegistryInner {
    users: HashMap<String, User>,
    socket_index: HashMap<String, String>,
}

/// Cheaply cloneable — all clones share the same underlying state via `Arc`.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<RwLock<RegistryInner>>,
    store: Arc<dyn Store>,
    max_total_connections: usize,
    inactivity_threshold: Duration,
    /// Below this cached-user count, `get_users` reloads from persistence
    /// before answering — keeps cold-start queries correct.
    cold_cache_threshold: usize,
    pub metrics: Arc<Metrics>,
}

impl Registry {
    pub fn new(store: Arc<dyn Store>, max_total_connections: usize, inactivity_threshold: Duration) -> Self {
        Registry {
            inner: Arc::new(RwLock::new(RegistryInner {
                users: HashMap::new(),
                socket_index: HashMap::new(),
            })),
            store,
            max_total_connections,
            inactivity_threshold,
            cold_cache_threshold: 1,
            metrics: Arc::new(Metrics::default()),
        }
    }

    /// Total live sockets across every user — the quantity capped by
    /// `MAX_TOTAL_CONNECTIONS`.
    pub async fn active_connections(&self) -> usize {
        self.inner.read().await.socket_index.len()
    }

    pub async fn active_users(&self) -> usize {
        self.inner
            .read()
            .await
            .users
            .values()
            .filter(|u| u.state != UserState::Offline)
            .count()
    }

    /// Creates or updates a user and appends/replaces the session for
    /// `socket_id`. Enforces `MAX_TOTAL_CONNECTIONS`; rolls back the
    /// in-memory mutation if persistence fails.
    pub async fn store_user(
        &self,
        socket_id: &str,
        identity: Identity,
        authenticated: bool,
    ) -> CoreResult<User> {
        let mut inner = self.inner.write().await;

        // Reattaching the same socket id replaces its session in place
        // rather than double-counting it against the capacity cap.
        let already_present = inner.socket_index.contains_key(socket_id);
        if !already_present && inner.socket_index.len() >= self.max_total_connections {
            return Err(CoreError::CapacityExceeded);
        }
        if let Some(prev_user_id) = inner.socket_index.get(socket_id).cloned() {
            if let Some(prev_user) = inner.users.get_mut(&prev_user_id) {
                prev_user.sockets.retain(|s| s.socket_id != socket_id);
                prev_user.recompute_state();
            }
        }

        let is_new_user = !inner.users.contains_key(&identity.user_id);
        let user = inner
            .users
            .entry(identity.user_id.clone())
            .or_insert_with(|| User::new(&identity));
        user.user_name = identity.user_name.clone();
        user.sockets.push(Session::new(socket_id.to_string(), authenticated));
        user.recompute_state();
        let snapshot = user.clone();

        inner
            .socket_index
            .insert(socket_id.to_string(), identity.user_id.clone());

        // Release the lock before the (possibly slow) persistence call —
        // roll back the in-memory mutation below on failure.
        drop(inner);

        if let Err(e) = self.store.store_user(&snapshot).await {
            let mut inner = self.inner.write().await;
            inner.socket_index.remove(socket_id);
            if let Some(user) = inner.users.get_mut(&identity.user_id) {
                user.sockets.retain(|s| s.socket_id != socket_id);
                user.recompute_state();
                if is_new_user && user.sockets.is_empty() {
                    inner.users.remove(&identity.user_id);
                }
            }
            return Err(e);
        }

        self.metrics.record_connect();
        Ok(snapshot)
    }

    /// Removes the session tied to `socket_id`. Returns `None` if the
    /// socket is unknown. Emits a `went_offline` signal in the outcome when
    /// the user's last session just closed.
    pub async fn disconnect_user(
        &self,
        socket_id: &str,
        _reason: DisconnectReason,
    ) -> Option<DisconnectOutcome> {
        let mut inner = self.inner.write().await;
        let user_id = inner.socket_index.remove(socket_id)?;
        let user = inner.users.get_mut(&user_id)?;
        user.sockets.retain(|s| s.socket_id != socket_id);
        user.recompute_state();
        let went_offline = user.state == UserState::Offline;
        let snapshot = user.clone();
        drop(inner);

        self.metrics.record_disconnect();
        if let Err(e) = self.store.store_user(&snapshot).await {
            tracing::warn!(user_id = %snapshot.user_id, error = ?e, "Failed to persist disconnect; in-memory state already updated");
        }

        Some(DisconnectOutcome {
            user: snapshot,
            went_offline,
        })
    }

    pub async fn get_user_by_socket_id(&self, socket_id: &str) -> Option<User> {
        let inner = self.inner.read().await;
        let user_id = inner.socket_index.get(socket_id)?;
        inner.users.get(user_id).cloned()
    }

    pub async fn get_user(&self, user_id: &str) -> Option<User> {
        self.inner.read().await.users.get(user_id).cloned()
    }

    pub async fn get_user_sockets(&self, user_id: &str) -> Vec<Session> {
        self.inner
            .read()
            .await
            .users
            .get(user_id)
            .map(|u| u.sockets.clone())
            .unwrap_or_default()
    }

    /// Paginated query over the in-memory cache, lazily reloaded from
    /// persistence when the cache looks too cold to answer faithfully.
    pub async fn get_users(&self, opts: GetUsersOptions) -> CoreResult<Vec<User>> {
        if self.inner.read().await.users.len() < self.cold_cache_threshold {
            self.reload_from_store().await?;
        }

        let inner = self.inner.read().await;
        let mut users: Vec<User> = inner
            .users
            .values()
            .filter(|u| {
                opts.states
                    .as_ref()
                    .map(|states| states.contains(&u.state))
                    .unwrap_or(true)
            })
            .cloned()
            .collect();
        users.sort_by(|a, b| a.user_id.cmp(&b.user_id));

        let offset = opts.offset.unwrap_or(0);
        let limit = opts.limit.unwrap_or(users.len());
        Ok(users.into_iter().skip(offset).take(limit).collect())
    }

    async fn reload_from_store(&self) -> CoreResult<()> {
        let persisted = self
            .store
            .get_users(crate::store::GetUsersQuery::default())
            .await?;
        let mut inner = self.inner.write().await;
        for user in persisted {
            inner.users.entry(user.user_id.clone()).or_insert(user);
        }
        Ok(())
    }

    /// Guard run at the top of every message-core operation: resolves the
    /// authenticated user for a socket, or fails with `Auth`/`NotFound`.
    pub async fn fail_insecure_socket_id(&self, socket_id: &str) -> CoreResult<User> {
        let inner = self.inner.read().await;
        let user_id = inner
            .socket_index
            .get(socket_id)
            .ok_or_else(|| CoreError::NotFound("Unknown socket".into()))?;
        let user = inner
            .users
            .get(user_id)
            .expect("socket_index entry without a matching user");
        let session = user
            .sockets
            .iter()
            .find(|s| s.socket_id == socket_id)
            .expect("socket_index entry without a matching session");
        if session.state != SessionState::Authenticated {
            return Err(CoreError::Auth("Not authenticated".into()));
        }
        Ok(user.clone())
    }

    /// Updates `lastActivity` for the session and its owning user.
    pub async fn touch(&self, socket_id: &str) {
        let mut inner = self.inner.write().await;
        if let Some(user_id) = inner.socket_index.get(socket_id).cloned() {
            if let Some(user) = inner.users.get_mut(&user_id) {
                let now = Utc::now();
                if let Some(session) = user.sockets.iter_mut().find(|s| s.socket_id == socket_id) {
                    session.last_activity = now;
                }
                user.last_activity = now;
            }
        }
    }

    /// Periodic sweep: removes sessions idle longer than
    /// `INACTIVITY_THRESHOLD`. Returns the outcomes for sockets that were
    /// removed, so the caller can broadcast `user_disconnected` where
    /// warranted.
    pub async fn check_inactivity(&self) -> Vec<(String, DisconnectOutcome)> {
        let now = Utc::now();
        let stale_sockets: Vec<String> = {
            let inner = self.inner.read().await;
            inner
                .users
                .values()
                .flat_map(|u| u.sockets.iter())
                .filter(|s| {
                    now.signed_duration_since(s.last_activity)
                        .to_std()
                        .map(|idle| idle > self.inactivity_threshold)
                        .unwrap_or(false)
                })
                .map(|s| s.socket_id.clone())
                .collect()
        };

        let mut results = Vec::with_capacity(stale_sockets.len());
        for socket_id in stale_sockets {
            if let Some(outcome) = self.disconnect_user(&socket_id, DisconnectReason::Inactivity).await {
                results.push((socket_id, outcome));
            }
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    fn registry() -> Registry {
        Registry::new(Arc::new(MemoryStore::new()), 1000, Duration::from_secs(3600))
    }

    fn identity(id: &str) -> Identity {
        Identity {
            user_id: id.to_string(),
            user_name: format!("user-{id}"),
        }
    }

    #[tokio::test]
    async fn store_user_creates_authenticated_user() {
        let reg = registry();
        let user = reg.store_user("sock-1", identity("alice"), true).await.unwrap();
        assert_eq!(user.state, UserState::Authenticated);
        assert_eq!(user.sockets.len(), 1);
    }

    #[tokio::test]
    async fn second_session_keeps_user_authenticated() {
        let reg = registry();
        reg.store_user("sock-1", identity("alice"), true).await.unwrap();
        let user = reg.store_user("sock-2", identity("alice"), true).await.unwrap();
        assert_eq!(user.sockets.len(), 2);
        assert_eq!(user.state, UserState::Authenticated);
    }

    #[tokio::test]
    async fn disconnect_one_of_two_sessions_keeps_user_authenticated() {
        let reg = registry();
        reg.store_user("sock-1", identity("alice"), true).await.unwrap();
        reg.store_user("sock-2", identity("alice"), true).await.unwrap();

        let outcome = reg
            .disconnect_user("sock-1", DisconnectReason::Manual)
            .await
            .unwrap();
        assert!(!outcome.went_offline);
        assert_eq!(outcome.user.state, UserState::Authenticated);
        assert_eq!(outcome.user.sockets.len(), 1);
    }

    #[tokio::test]
    async fn disconnect_last_session_goes_offline() {
        let reg = registry();
        reg.store_user("sock-1", identity("alice"), true).await.unwrap();

        let outcome = reg
            .disconnect_user("sock-1", DisconnectReason::Manual)
            .await
            .unwrap();
        assert!(outcome.went_offline);
        assert_eq!(outcome.user.state, UserState::Offline);
    }

    #[tokio::test]
    async fn disconnect_unknown_socket_returns_none() {
        let reg = registry();
        assert!(reg
            .disconnect_user("ghost", DisconnectReason::Manual)
            .await
            .is_none());
    }

    #[tokio::test]
    async fn capacity_cap_rejects_over_limit_connections() {
        let reg = Registry::new(Arc::new(MemoryStore::new()), 2, Duration::from_secs(3600));
        reg.store_user("sock-1", identity("a"), true).await.unwrap();
        reg.store_user("sock-2", identity("b"), true).await.unwrap();

        let result = reg.store_user("sock-3", identity("c"), true).await;
        assert!(matches!(result, Err(CoreError::CapacityExceeded)));
        assert_eq!(reg.active_connections().await, 2);
    }

    #[tokio::test]
    async fn fail_insecure_socket_id_rejects_unknown_socket() {
        let reg = registry();
        let result = reg.fail_insecure_socket_id("ghost").await;
        assert!(matches!(result, Err(CoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn fail_insecure_socket_id_accepts_authenticated_session() {
        let reg = registry();
        reg.store_user("sock-1", identity("alice"), true).await.unwrap();
        let user = reg.fail_insecure_socket_id("sock-1").await.unwrap();
        assert_eq!(user.user_id, "alice");
    }

    #[tokio::test]
    async fn get_user_by_socket_id_is_o1_lookup() {
        let reg = registry();
        reg.store_user("sock-1", identity("alice"), true).await.unwrap();
        let user = reg.get_user_by_socket_id("sock-1").await.unwrap();
        assert_eq!(user.user_id, "alice");
        assert!(reg.get_user_by_socket_id("sock-missing").await.is_none());
    }

    #[tokio::test]
    async fn get_users_filters_by_state() {
        let reg = registry();
        reg.store_user("sock-1", identity("alice"), true).await.unwrap();
        reg.disconnect_user("sock-1", DisconnectReason::Manual).await;
        reg.store_user("sock-2", identity("bob"), true).await.unwrap();

        let authed = reg
            .get_users(GetUsersOptions {
                states: Some(vec![UserState::Authenticated]),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(authed.len(), 1);
        assert_eq!(authed[0].user_id, "bob");
    }

    #[tokio::test]
    async fn check_inactivity_disconnects_stale_sessions() {
        let reg = Registry::new(Arc::new(MemoryStore::new()), 1000, Duration::from_millis(0));
        reg.store_user("sock-1", identity("alice"), true).await.unwrap();
        // Every session is immediately "stale" relative to a zero threshold.
        tokio::time::sleep(Duration::from_millis(5)).await;

        let outcomes = reg.check_inactivity().await;
        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].1.went_offline);
        assert_eq!(reg.active_connections().await, 0);
    }
}
