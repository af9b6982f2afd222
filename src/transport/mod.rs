//! Client side of the agent control API.
//!
//! Every remote capability is one method on [`AgentTransport`]. Writes and
//! reloads are separate primitives; the composite `apply_*`/`delete_config`
//! helpers run them as two explicit steps and report which step failed, so a
//! failed reload can be retried without re-sending the configuration body.

pub mod http;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use crate::error::Result;
use crate::types::{AgentHost, ConfigTemplate};

pub use http::{HttpAgentTransport, HttpTransportFactory};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// No response from the agent; safe to retry with backoff
    #[error("agent unreachable: {0}")]
    Unreachable(String),

    /// Agent answered with a non-success status
    #[error("agent rejected request with status {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("agent request timed out: {0}")]
    Timeout(String),
}

impl TransportError {
    /// Timeouts are handled exactly like unreachable agents by orchestration.
    pub fn is_unreachable(&self) -> bool {
        matches!(
            self,
            TransportError::Unreachable(_) | TransportError::Timeout(_)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyStage {
    Write,
    Reload,
}

impl fmt::Display for ApplyStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApplyStage::Write => f.write_str("write"),
            ApplyStage::Reload => f.write_str("reload"),
        }
    }
}

/// Failure of a two-step write+reload operation.
#[derive(Debug, Clone, Error)]
#[error("{stage} step failed: {source}")]
pub struct ApplyError {
    pub stage: ApplyStage,
    #[source]
    pub source: TransportError,
}

impl ApplyError {
    fn write(source: TransportError) -> Self {
        Self {
            stage: ApplyStage::Write,
            source,
        }
    }

    fn reload(source: TransportError) -> Self {
        Self {
            stage: ApplyStage::Reload,
            source,
        }
    }

    /// Whether the agent may hold the file despite the failure.
    pub fn may_have_written(&self) -> bool {
        self.stage == ApplyStage::Reload || matches!(self.source, TransportError::Timeout(_))
    }
}

impl From<ApplyError> for crate::error::Error {
    fn from(err: ApplyError) -> Self {
        crate::error::Error::Transport(err.source)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigFileInfo {
    pub filename: String,
    pub modified_at: DateTime<Utc>,
    pub size: u64,
    pub hash: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundInfo {
    pub tag: String,
    pub protocol: String,
    pub port: u16,
    pub filename: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub running: bool,
}

/// Body of `POST /api/v1/protocols/template`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateRequest {
    pub filename: String,
    pub template: String,
    pub content: Value,
    pub variables: Map<String, Value>,
}

#[async_trait]
pub trait AgentTransport: Send + Sync {
    async fn list_configs(&self) -> std::result::Result<Vec<ConfigFileInfo>, TransportError>;
    async fn list_inbounds(&self) -> std::result::Result<Vec<InboundInfo>, TransportError>;
    async fn get_config(&self, filename: &str) -> std::result::Result<Vec<u8>, TransportError>;
    async fn write_config(
        &self,
        filename: &str,
        content: &[u8],
    ) -> std::result::Result<(), TransportError>;
    async fn write_template(
        &self,
        request: &TemplateRequest,
    ) -> std::result::Result<(), TransportError>;
    async fn remove_config(&self, filename: &str) -> std::result::Result<(), TransportError>;
    async fn service_status(&self) -> std::result::Result<ServiceStatus, TransportError>;
    async fn reload_service(&self) -> std::result::Result<(), TransportError>;
    /// Liveness only; a non-2xx probe is `Ok(false)`.
    async fn health(&self) -> std::result::Result<bool, TransportError>;

    async fn apply_config(
        &self,
        filename: &str,
        content: &[u8],
    ) -> std::result::Result<(), ApplyError> {
        self.write_config(filename, content)
            .await
            .map_err(ApplyError::write)?;
        self.reload_service().await.map_err(ApplyError::reload)
    }

    async fn apply_template(
        &self,
        filename: &str,
        template: &ConfigTemplate,
        variables: &Map<String, Value>,
    ) -> std::result::Result<(), ApplyError> {
        let request = TemplateRequest {
            filename: filename.to_string(),
            template: template.name.clone(),
            content: template.document.clone(),
            variables: variables.clone(),
        };
        self.write_template(&request)
            .await
            .map_err(ApplyError::write)?;
        self.reload_service().await.map_err(ApplyError::reload)
    }

    async fn delete_config(&self, filename: &str) -> std::result::Result<(), ApplyError> {
        self.remove_config(filename)
            .await
            .map_err(ApplyError::write)?;
        self.reload_service().await.map_err(ApplyError::reload)
    }
}

/// Builds the transport for a given host. Tests swap in recording fakes.
pub trait TransportFactory: Send + Sync {
    fn connect(&self, host: &AgentHost) -> Result<Arc<dyn AgentTransport>>;
}
