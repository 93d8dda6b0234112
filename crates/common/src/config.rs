use std::collections::HashMap;
use std::path::PathBuf;

use serde::Deserialize;

/// Upper bound for `POLL_INTERVAL_SECS` and `BACKOFF_STEP_SECS`.
pub const MAX_INTERVAL_SECS: u64 = 86_400;

/// Upper bound for `MAX_BACKOFF_STEPS`.
pub const MAX_BACKOFF_STEPS_LIMIT: u32 = 1_000;

/// Global application configuration loaded from environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// PostgreSQL connection string for the queue store
    pub database_url: String,

    /// Name of the dequeue function, optionally schema-qualified
    pub dequeue_procedure: String,

    /// Seconds the store-side long-poll waits for work (default: 60)
    pub poll_interval_secs: u64,

    /// Base URL of the default push gateway endpoint
    pub transport_url: String,

    /// Directory searched for `<icon>.png` application icons
    pub icons_dir: PathBuf,

    /// Icon file used when a notification names no icon
    pub default_icon: String,

    /// Backoff added per consecutive failed iteration, in seconds (default: 5)
    pub backoff_step_secs: u64,

    /// Upper bound for the consecutive-error counter (default: 12)
    pub max_backoff_steps: u32,

    /// How long `stop` waits for the worker before aborting it (default: 10)
    pub stop_timeout_secs: u64,
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let vars: HashMap<String, String> = std::env::vars().collect();
        Self::from_map(&vars)
    }

    /// Build configuration from a key/value map using the environment variable names.
    pub fn from_map(vars: &HashMap<String, String>) -> anyhow::Result<Self> {
        let get = |key: &str, default: &str| {
            vars.get(key)
                .cloned()
                .unwrap_or_else(|| default.to_string())
        };

        let dequeue_procedure = get("DEQUEUE_PROCEDURE", "dequeue_notification");
        if !is_valid_procedure_name(&dequeue_procedure) {
            anyhow::bail!(
                "DEQUEUE_PROCEDURE '{}' must be a plain or schema-qualified identifier",
                dequeue_procedure
            );
        }

        let config = Self {
            database_url: vars
                .get("DATABASE_URL")
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("DATABASE_URL environment variable is required"))?,
            dequeue_procedure,
            poll_interval_secs: get("POLL_INTERVAL_SECS", "60")
                .parse()
                .map_err(|_| anyhow::anyhow!("POLL_INTERVAL_SECS must be a valid u64"))?,
            transport_url: get("TRANSPORT_URL", "http://localhost:23053"),
            icons_dir: PathBuf::from(get("ICONS_DIR", "icons")),
            default_icon: get("DEFAULT_ICON", "default.png"),
            backoff_step_secs: get("BACKOFF_STEP_SECS", "5")
                .parse()
                .map_err(|_| anyhow::anyhow!("BACKOFF_STEP_SECS must be a valid u64"))?,
            max_backoff_steps: get("MAX_BACKOFF_STEPS", "12")
                .parse()
                .map_err(|_| anyhow::anyhow!("MAX_BACKOFF_STEPS must be a valid u32"))?,
            stop_timeout_secs: get("STOP_TIMEOUT_SECS", "10")
                .parse()
                .map_err(|_| anyhow::anyhow!("STOP_TIMEOUT_SECS must be a valid u64"))?,
        };

        if config.poll_interval_secs > MAX_INTERVAL_SECS {
            anyhow::bail!("POLL_INTERVAL_SECS must not exceed {}", MAX_INTERVAL_SECS);
        }
        if config.backoff_step_secs > MAX_INTERVAL_SECS {
            anyhow::bail!("BACKOFF_STEP_SECS must not exceed {}", MAX_INTERVAL_SECS);
        }
        if config.max_backoff_steps > MAX_BACKOFF_STEPS_LIMIT {
            anyhow::bail!("MAX_BACKOFF_STEPS must not exceed {}", MAX_BACKOFF_STEPS_LIMIT);
        }

        Ok(config)
    }
}

/// The procedure name is spliced into SQL text, so only `name` or `schema.name`
/// made of ASCII alphanumerics and underscores is accepted.
fn is_valid_procedure_name(name: &str) -> bool {
    let parts: Vec<&str> = name.split('.').collect();
    parts.len() <= 2
        && parts.iter().all(|part| {
            !part.is_empty()
                && !part.starts_with(|c: char| c.is_ascii_digit())
                && part.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        })
}
