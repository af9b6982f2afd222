//! Core instance lifecycle and the zero-downtime core switch.
//!
//! All remote effects go through [`AgentTransport`]; all durable state goes
//! through [`Storage`]. A switch holds the host's durable claim from the
//! moment it is accepted until it reaches a terminal status.

pub mod audit;
pub mod lifecycle;
pub mod state_machine;
pub mod switch;

use log::warn;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::convert::{Conversion, ConverterRegistry};
use crate::error::{Error, Result};
use crate::retry::{retry_with_backoff, RetryConfig};
use crate::storage::Storage;
use crate::transport::{AgentTransport, ApplyError, ApplyStage, TransportFactory};
use crate::types::{AgentHost, CoreInstance, CoreType, HostId};

pub use audit::SwitchAuditLog;
pub use lifecycle::{CreateInstanceRequest, TemplateDraft};
pub use state_machine::{SwitchEvent, SwitchPhase, SwitchStateMachine};
pub use switch::{SwitchOutcome, SwitchRequest};

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Overall bound on switch verification
    pub verify_timeout: Duration,
    pub verify_retry: RetryConfig,
    /// Applied to reloads only; writes are never re-sent
    pub reload_retry: RetryConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            verify_timeout: Duration::from_secs(60),
            verify_retry: RetryConfig::with_max_attempts(10)
                .with_initial_delay(Duration::from_millis(500)),
            reload_retry: RetryConfig::default(),
        }
    }
}

#[derive(Clone)]
pub struct CoreOrchestrator {
    storage: Arc<dyn Storage>,
    transports: Arc<dyn TransportFactory>,
    converters: Arc<ConverterRegistry>,
    config: OrchestratorConfig,
}

impl CoreOrchestrator {
    pub fn new(
        storage: Arc<dyn Storage>,
        transports: Arc<dyn TransportFactory>,
        converters: Arc<ConverterRegistry>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            storage,
            transports,
            converters,
            config,
        }
    }

    /// Stateless conversion between two core configuration schemas.
    pub fn convert(&self, source: &str, target: &str, document: &Value) -> Result<Conversion> {
        let source: CoreType = source.parse()?;
        let target: CoreType = target.parse()?;
        self.converters.convert(source, target, document)
    }

    async fn host(&self, host_id: HostId) -> Result<AgentHost> {
        self.storage
            .get_host(host_id)
            .await?
            .ok_or_else(|| Error::not_found(format!("agent host {}", host_id)))
    }

    async fn instance(&self, host_id: HostId, instance_id: &str) -> Result<CoreInstance> {
        self.storage
            .get_instance(host_id, instance_id)
            .await?
            .ok_or_else(|| Error::not_found(format!("core instance {}", instance_id)))
    }

    /// Fails with `PortConflict` if an enabled rule or another instance
    /// (other than those in `ignore`) already holds one of `ports`.
    async fn ensure_ports_free(&self, host_id: HostId, ports: &[u16], ignore: &[&str]) -> Result<()> {
        if ports.is_empty() {
            return Ok(());
        }

        let (rules, _) = self.storage.list_rules(host_id).await?;
        if let Some(rule) = rules
            .iter()
            .find(|r| r.enabled && ports.contains(&r.listen_port))
        {
            return Err(Error::PortConflict {
                port: rule.listen_port,
            });
        }

        for instance in self.storage.list_instances(host_id).await? {
            if ignore.contains(&instance.instance_id.as_str()) {
                continue;
            }
            if let Some(port) = instance.listen_ports.iter().find(|p| ports.contains(p)) {
                return Err(Error::PortConflict { port: *port });
            }
        }
        Ok(())
    }

    /// Completes a write+reload step, retrying only the reload when the
    /// write already landed.
    async fn settle_reload(
        &self,
        transport: &dyn AgentTransport,
        outcome: std::result::Result<(), ApplyError>,
    ) -> Result<()> {
        match outcome {
            Ok(()) => Ok(()),
            Err(e) if e.stage == ApplyStage::Reload => {
                warn!("Agent reload failed after write, retrying: {}", e.source);
                retry_with_backoff(&self.config.reload_retry, "agent reload", move || {
                    transport.reload_service()
                })
                .await
                .map_err(Error::from)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn remove_remote(&self, transport: &dyn AgentTransport, filename: &str) -> Result<()> {
        let outcome = transport.delete_config(filename).await;
        self.settle_reload(transport, outcome).await
    }

    async fn apply_document(
        &self,
        transport: &dyn AgentTransport,
        filename: &str,
        body: &[u8],
    ) -> Result<()> {
        let outcome = transport.apply_config(filename, body).await;
        self.settle_reload(transport, outcome).await
    }
}

/// Listen ports as submitted by clients, validated into range.
pub(crate) fn parse_ports(ports: &[i64]) -> Result<Vec<u16>> {
    let mut parsed = Vec::with_capacity(ports.len());
    for port in ports {
        match u16::try_from(*port) {
            Ok(p) if p != 0 => {
                if !parsed.contains(&p) {
                    parsed.push(p);
                }
            }
            _ => {
                return Err(Error::invalid_input(format!(
                    "listen port {} is out of range",
                    port
                )))
            }
        }
    }
    parsed.sort_unstable();
    Ok(parsed)
}

/// Runs `operation` unless `cancel` fires first.
pub(crate) async fn cancellable<F, T>(cancel: &CancellationToken, operation: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled),
        result = operation => result,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ports() {
        assert_eq!(parse_ports(&[8443, 443, 443]).unwrap(), vec![443, 8443]);
        assert!(parse_ports(&[]).unwrap().is_empty());
        assert!(matches!(parse_ports(&[0]), Err(Error::InvalidInput(_))));
        assert!(matches!(parse_ports(&[70000]), Err(Error::InvalidInput(_))));
        assert!(matches!(parse_ports(&[-1]), Err(Error::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_cancellable_prefers_cancellation() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = cancellable(&cancel, async { Ok(1) }).await;
        assert!(matches!(result, Err(Error::Cancelled)));

        let live = CancellationToken::new();
        assert_eq!(cancellable(&live, async { Ok(2) }).await.unwrap(), 2);
    }

    #[test]
    fn test_default_config() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.verify_timeout, Duration::from_secs(60));
        assert_eq!(config.verify_retry.max_attempts, 10);
    }
}
