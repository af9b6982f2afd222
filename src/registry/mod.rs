//! Agent host registry: admin CRUD plus the agent-pushed liveness paths.

use chrono::Utc;
use log::{debug, info, warn};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::storage::Storage;
use crate::types::{AgentHost, HostId, HostMetrics};

#[derive(Debug, Clone, Deserialize)]
pub struct HostDraft {
    pub name: String,
    pub address: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HostUpdate {
    pub name: Option<String>,
    pub address: Option<String>,
}

/// Creation response; the only place the token is ever returned.
#[derive(Debug, Clone, Serialize)]
pub struct CreatedHost {
    #[serde(flatten)]
    pub host: AgentHost,
    pub token: String,
}

#[derive(Clone)]
pub struct AgentRegistry {
    storage: Arc<dyn Storage>,
    heartbeat_timeout: Duration,
}

impl AgentRegistry {
    pub fn new(storage: Arc<dyn Storage>, heartbeat_timeout: Duration) -> Self {
        Self {
            storage,
            heartbeat_timeout,
        }
    }

    pub async fn create(&self, draft: HostDraft) -> Result<CreatedHost> {
        let name = validate_name(&draft.name)?;
        let address = validate_address(&draft.address)?;

        let host = AgentHost::new(name, address);
        self.storage.create_host(&host).await?;
        info!("Registered agent host {} ({})", host.id, host.name);

        let token = host.token.clone();
        Ok(CreatedHost { host, token })
    }

    pub async fn get(&self, id: HostId) -> Result<AgentHost> {
        self.storage
            .get_host(id)
            .await?
            .ok_or_else(|| Error::not_found(format!("agent host {}", id)))
    }

    pub async fn list(&self) -> Result<Vec<AgentHost>> {
        self.storage.list_hosts().await
    }

    pub async fn update(&self, id: HostId, update: HostUpdate) -> Result<AgentHost> {
        let mut host = self.get(id).await?;
        if let Some(name) = update.name {
            host.name = validate_name(&name)?;
        }
        if let Some(address) = update.address {
            host.address = validate_address(&address)?;
        }
        host.updated_at = Utc::now();
        self.storage.update_host(&host).await?;
        Ok(host)
    }

    /// Removes the host and everything it owns. Refused while a switch holds
    /// the host's claim.
    pub async fn delete(&self, id: HostId) -> Result<()> {
        self.get(id).await?;
        if self.storage.get_active_switch(id).await?.is_some() {
            return Err(Error::SwitchInProgress { host_id: id });
        }
        self.storage.delete_host(id).await?;
        info!("Deleted agent host {}", id);
        Ok(())
    }

    pub async fn authenticate(&self, token: &str) -> Result<AgentHost> {
        if token.is_empty() {
            return Err(Error::InvalidToken);
        }
        self.storage
            .get_host_by_token(token)
            .await?
            .ok_or(Error::InvalidToken)
    }

    pub async fn heartbeat(&self, token: &str) -> Result<HostId> {
        if token.is_empty() {
            return Err(Error::InvalidToken);
        }
        let id = self
            .storage
            .record_heartbeat(token, Utc::now())
            .await?
            .ok_or(Error::InvalidToken)?;
        debug!("Heartbeat from agent host {}", id);
        Ok(id)
    }

    pub async fn report_metrics(&self, token: &str, metrics: HostMetrics) -> Result<HostId> {
        if token.is_empty() {
            return Err(Error::InvalidToken);
        }
        for (field, value) in [
            ("cpu_percent", metrics.cpu_percent),
            ("mem_percent", metrics.mem_percent),
            ("disk_percent", metrics.disk_percent),
        ] {
            if !(0.0..=100.0).contains(&value) {
                return Err(Error::invalid_input(format!(
                    "{} must be within 0-100, got {}",
                    field, value
                )));
            }
        }
        self.storage
            .record_metrics(token, &metrics)
            .await?
            .ok_or(Error::InvalidToken)
    }

    /// Mark hosts whose last heartbeat is older than the timeout as offline.
    pub async fn sweep_offline(&self) -> Result<Vec<HostId>> {
        let timeout = chrono::Duration::milliseconds(self.heartbeat_timeout.as_millis() as i64);
        let changed = self.storage.mark_stale_offline(Utc::now() - timeout).await?;
        for id in &changed {
            warn!("Agent host {} missed heartbeats, marked offline", id);
        }
        Ok(changed)
    }

    pub fn spawn_sweeper(&self, every: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(every);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = registry.sweep_offline().await {
                            warn!("Liveness sweep failed: {}", e);
                        }
                    }
                    _ = shutdown.cancelled() => {
                        debug!("Liveness sweeper stopped");
                        break;
                    }
                }
            }
        })
    }
}

fn validate_name(name: &str) -> Result<String> {
    let name = name.trim();
    if name.is_empty() {
        return Err(Error::invalid_input("name must not be empty"));
    }
    Ok(name.to_string())
}

fn validate_address(address: &str) -> Result<String> {
    let address = address.trim();
    let url = Url::parse(address)
        .map_err(|e| Error::invalid_input(format!("invalid address '{}': {}", address, e)))?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return Err(Error::invalid_input(format!(
            "address '{}' must be an http(s) URL",
            address
        )));
    }
    Ok(address.trim_end_matches('/').to_string())
}
