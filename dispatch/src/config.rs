use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite database holding environments, sessions and deployments
    pub database_url: String,
    /// Topic the executor consumes deployment tasks from
    pub tasks_topic: String,
    /// Topic the results server consumes final results from
    pub results_topic: String,
    /// Topic the notification server consumes progress notifications from
    pub notifications_topic: String,
    /// How long `deliver_result` waits for ingestion to finish
    pub rpc_timeout: Duration,
    /// Retention of undelivered messages on agent result queues
    pub results_queue_ttl: Duration,
    /// Upper bound of a single blocking pull
    pub receive_poll: Duration,
    /// Identity of this server instance in logs
    pub server_id: String,
    /// Key fragments redacted before payloads are logged
    pub sanitize_keys: Vec<String>,
    /// Emit JSON log lines instead of human-readable ones
    pub log_json: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: "sqlite:./data/dispatch.db".to_string(),
            tasks_topic: "murano.tasks".to_string(),
            results_topic: "murano.results".to_string(),
            notifications_topic: "murano.notifications".to_string(),
            rpc_timeout: Duration::from_secs(15),
            results_queue_ttl: Duration::from_secs(24 * 60 * 60),
            receive_poll: Duration::from_millis(1000),
            server_id: uuid::Uuid::new_v4().to_string(),
            sanitize_keys: vec![
                "token".to_string(),
                "pass".to_string(),
                "trustedby".to_string(),
            ],
            log_json: false,
        }
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        let defaults = Self::default();

        Ok(Self {
            database_url: env_str("DISPATCH_DATABASE_URL", &defaults.database_url),
            tasks_topic: env_str("DISPATCH_TASKS_TOPIC", &defaults.tasks_topic),
            results_topic: env_str("DISPATCH_RESULTS_TOPIC", &defaults.results_topic),
            notifications_topic: env_str(
                "DISPATCH_NOTIFICATIONS_TOPIC",
                &defaults.notifications_topic,
            ),
            rpc_timeout: Duration::from_secs(env_parse("DISPATCH_RPC_TIMEOUT_SECS", 15)?),
            results_queue_ttl: Duration::from_secs(env_parse(
                "DISPATCH_RESULTS_QUEUE_TTL_SECS",
                86_400,
            )?),
            receive_poll: Duration::from_millis(env_parse("DISPATCH_RECEIVE_POLL_MS", 1000)?),
            server_id: env_str("DISPATCH_SERVER_ID", &defaults.server_id),
            sanitize_keys: env_csv("DISPATCH_SANITIZE_KEYS", &["token", "pass", "trustedby"]),
            log_json: env_flag("DISPATCH_LOG_JSON", false),
        })
    }
}

fn env_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> anyhow::Result<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(val) => val
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("Failed to parse env var {key}={val}: {e}")),
        Err(_) => Ok(default),
    }
}

fn env_csv(key: &str, default: &[&str]) -> Vec<String> {
    match std::env::var(key) {
        Ok(raw) => raw
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(ToString::to_string)
            .collect(),
        Err(_) => default.iter().map(|s| (*s).to_string()).collect(),
    }
}

fn env_flag(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .map(|v| {
            let normalized = v.trim().to_ascii_lowercase();
            normalized == "1" || normalized == "true" || normalized == "yes"
        })
        .unwrap_or(default)
}
