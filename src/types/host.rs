use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{HostId, HostStatus};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentHost {
    pub id: HostId,
    pub name: String,
    /// Base URL of the agent control API, e.g. `http://10.0.0.5:9527`
    pub address: String,
    /// Shared secret for both directions. Only returned to the admin at creation.
    #[serde(skip_serializing, default)]
    pub token: String,
    pub status: HostStatus,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub metrics: Option<HostMetrics>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Capacity figures pushed by the agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostMetrics {
    pub cpu_percent: f64,
    pub mem_percent: f64,
    pub disk_percent: f64,
    pub traffic_up: u64,
    pub traffic_down: u64,
    #[serde(default = "Utc::now")]
    pub reported_at: DateTime<Utc>,
}

impl AgentHost {
    pub fn new(name: String, address: String) -> Self {
        let now = Utc::now();
        Self {
            id: HostId::new_v4(),
            name,
            address,
            token: generate_token(),
            status: HostStatus::Offline,
            last_heartbeat_at: None,
            metrics: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether the last heartbeat is older than `cutoff` (or never arrived).
    pub fn is_stale(&self, cutoff: DateTime<Utc>) -> bool {
        match self.last_heartbeat_at {
            Some(seen) => seen < cutoff,
            None => true,
        }
    }
}

fn generate_token() -> String {
    format!(
        "{}{}",
        uuid::Uuid::new_v4().simple(),
        uuid::Uuid::new_v4().simple()
    )
}
