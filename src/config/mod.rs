use std::env;
use std::time::Duration;

/// Which persistence backend [`crate::store`] should wire up at startup.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PersistBackend {
    Memory,
    Postgresql,
}

/// Which auth middleware the gateway installs on new connections.
///
/// `Test` accepts a bare `userId`/`userName` pair with no signature check —
/// used only when `APP_ENV=test`, never in production.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SocketMiddleware {
    Passport,
    Test,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub server_host: String,
    pub server_port: u16,
    pub client_url: Option<String>,
    pub passport_path: Option<String>,
    pub database_url: Option<String>,
    pub persist_backend: PersistBackend,
    pub socket_middleware: SocketMiddleware,
    pub app_env: String,
    pub max_total_connections: usize,
    pub inactivity_threshold: Duration,
    pub inactivity_check_interval: Duration,
    pub default_request_timeout: Duration,
    pub message_ack_timeout: Duration,
    pub pending_reconcile_window_days: i64,
    pub public_message_expire_days: i64,
    pub db_max_connections: u32,
}

impl Config {
    pub fn from_env() -> Result<Self, env::VarError> {
        dotenvy::dotenv().ok();

        let app_env = env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());

        let persist_backend = match env::var("USER_MANAGER_PERSIST").as_deref() {
            Ok("postgresql") => PersistBackend::Postgresql,
            _ => PersistBackend::Memory,
        };

        // `Test` bypasses signature verification entirely (§4.2), so honoring
        // it outside `APP_ENV=test` would let anyone authenticate as any
        // user in a live deployment — fall back to `Passport` instead of
        // trusting the env var alone.
        let socket_middleware = match (env::var("SOCKET_MIDDLEWARE").as_deref(), app_env.as_str()) {
            (Ok("test"), "test") => SocketMiddleware::Test,
            (Ok("test"), _) => {
                tracing::warn!(
                    app_env = %app_env,
                    "SOCKET_MIDDLEWARE=test ignored outside APP_ENV=test; falling back to passport"
                );
                SocketMiddleware::Passport
            }
            _ => SocketMiddleware::Passport,
        };

        let database_url = env::var("DATABASE_URL").ok();
        if persist_backend == PersistBackend::Postgresql && database_url.is_none() {
            panic!("DATABASE_URL is required when USER_MANAGER_PERSIST=postgresql");
        }

        Ok(Config {
            server_host: env::var("SERVER_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            server_port: env::var("PORT")
                .unwrap_or_else(|_| "3001".to_string())
                .parse()
                .unwrap_or(3001),
            client_url: env::var("CLIENT_URL").ok(),
            passport_path: env::var("PASSPORT_PATH").ok(),
            database_url,
            persist_backend,
            socket_middleware,
            db_max_connections: env::var("DB_MAX_CONNECTIONS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(|| default_pool_size(&app_env)),
            max_total_connections: env::var("MAX_TOTAL_CONNECTIONS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(1000),
            inactivity_threshold: Duration::from_millis(
                env::var("INACTIVITY_THRESHOLD")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(3_600_000),
            ),
            inactivity_check_interval: Duration::from_millis(
                env::var("INACTIVITY_CHECK_INTERVAL")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(60_000),
            ),
            default_request_timeout: Duration::from_millis(
                env::var("DEFAULT_REQUEST_TIMEOUT")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(5_000),
            ),
            message_ack_timeout: Duration::from_millis(
                env::var("MESSAGE_ACKNOWLEDGEMENT_TIMEOUT")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(3_000),
            ),
            pending_reconcile_window_days: env::var("PENDING_RECONCILE_WINDOW_DAYS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(7),
            public_message_expire_days: env::var("PUBLIC_MESSAGE_EXPIRE_DAYS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
            app_env,
        })
    }

    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server_host, self.server_port)
    }

    pub fn is_production(&self) -> bool {
        self.app_env == "production"
    }

    pub fn is_test(&self) -> bool {
        self.app_env == "test"
    }
}

fn default_pool_size(app_env: &str) -> u32 {
    match app_env {
        "production" => 20,
        "test" => 3,
        _ => 10,
    }
}
