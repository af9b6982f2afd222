use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

use crate::orchestrator::OrchestratorConfig;
use crate::retry::RetryConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Postgres URL; the in-memory store is used when unset
    pub database_url: Option<String>,
    pub port: u16,
    /// Bearer token for the admin routes; open when unset
    pub admin_token: Option<String>,
    pub agent_timeout_secs: u64,
    pub verify_timeout_secs: u64,
    pub verify_attempts: u32,
    pub verify_initial_delay_ms: u64,
    pub heartbeat_timeout_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: None,
            port: 8080,
            admin_token: None,
            agent_timeout_secs: 30,
            verify_timeout_secs: 60,
            verify_attempts: 10,
            verify_initial_delay_ms: 500,
            heartbeat_timeout_secs: 90,
            sweep_interval_secs: 30,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            database_url: non_empty("COREFLEET_DATABASE_URL"),
            port: parsed("COREFLEET_PORT", defaults.port),
            admin_token: non_empty("COREFLEET_ADMIN_TOKEN"),
            agent_timeout_secs: parsed("COREFLEET_AGENT_TIMEOUT_SECS", defaults.agent_timeout_secs),
            verify_timeout_secs: parsed("COREFLEET_VERIFY_TIMEOUT_SECS", defaults.verify_timeout_secs),
            verify_attempts: parsed("COREFLEET_VERIFY_ATTEMPTS", defaults.verify_attempts),
            verify_initial_delay_ms: parsed(
                "COREFLEET_VERIFY_INITIAL_DELAY_MS",
                defaults.verify_initial_delay_ms,
            ),
            heartbeat_timeout_secs: parsed(
                "COREFLEET_HEARTBEAT_TIMEOUT_SECS",
                defaults.heartbeat_timeout_secs,
            ),
            sweep_interval_secs: parsed("COREFLEET_SWEEP_INTERVAL_SECS", defaults.sweep_interval_secs),
        }
    }

    pub fn agent_timeout(&self) -> Duration {
        Duration::from_secs(self.agent_timeout_secs)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn orchestrator(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            verify_timeout: Duration::from_secs(self.verify_timeout_secs),
            verify_retry: RetryConfig::with_max_attempts(self.verify_attempts.max(1))
                .with_initial_delay(Duration::from_millis(self.verify_initial_delay_ms)),
            reload_retry: RetryConfig::default(),
        }
    }
}

fn non_empty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parsed<T: FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            log::warn!("Ignoring unparsable {}={:?}", key, raw);
            default
        }),
        Err(_) => default,
    }
}
