use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::{
    AgentHost, ConfigTemplate, CoreInstance, ForwardingRule, HostId, HostMetrics, RuleId, RuleLog,
    SwitchLog, SwitchStatus, TemplateId,
};

pub const DEFAULT_PAGE_LIMIT: u32 = 20;
pub const MAX_PAGE_LIMIT: u32 = 200;

/// Limit/offset window shared by the log queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    pub limit: u32,
    pub offset: u32,
}

impl Page {
    pub fn new(limit: Option<u32>, offset: Option<u32>) -> Self {
        Self {
            limit: limit.unwrap_or(DEFAULT_PAGE_LIMIT).clamp(1, MAX_PAGE_LIMIT),
            offset: offset.unwrap_or(0),
        }
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new(None, None)
    }
}

#[derive(Debug, Clone, Default)]
pub struct RuleLogQuery {
    pub rule_id: Option<RuleId>,
    pub start_at: Option<DateTime<Utc>>,
    pub end_at: Option<DateTime<Utc>>,
    pub page: Page,
}

impl RuleLogQuery {
    pub fn matches(&self, log: &RuleLog) -> bool {
        self.rule_id.map_or(true, |id| log.rule_id == id)
            && self.start_at.map_or(true, |start| log.created_at >= start)
            && self.end_at.map_or(true, |end| log.created_at <= end)
    }
}

#[derive(Debug, Clone, Default)]
pub struct SwitchLogQuery {
    pub status: Option<SwitchStatus>,
    pub start_at: Option<DateTime<Utc>>,
    pub end_at: Option<DateTime<Utc>>,
    pub page: Page,
}

impl SwitchLogQuery {
    pub fn matches(&self, log: &SwitchLog) -> bool {
        self.status.map_or(true, |status| log.status == status)
            && self.start_at.map_or(true, |start| log.started_at >= start)
            && self.end_at.map_or(true, |end| log.started_at <= end)
    }
}

/// Persistence contract for the control plane.
///
/// Rule mutations are atomic with the host's version bump and rule log;
/// `claim_switch` is the durable per-host switch lock.
#[async_trait]
pub trait Storage: Send + Sync {
    // Host operations
    async fn create_host(&self, host: &AgentHost) -> Result<()>;
    async fn get_host(&self, id: HostId) -> Result<Option<AgentHost>>;
    async fn get_host_by_token(&self, token: &str) -> Result<Option<AgentHost>>;
    async fn list_hosts(&self) -> Result<Vec<AgentHost>>;
    async fn update_host(&self, host: &AgentHost) -> Result<()>;
    /// Removes the host with its rules, rule logs, version counter and instances.
    async fn delete_host(&self, id: HostId) -> Result<bool>;

    // Agent-pushed liveness, never blocked by switch claims
    async fn record_heartbeat(&self, token: &str, at: DateTime<Utc>) -> Result<Option<HostId>>;
    async fn record_metrics(&self, token: &str, metrics: &HostMetrics) -> Result<Option<HostId>>;
    async fn mark_stale_offline(&self, cutoff: DateTime<Utc>) -> Result<Vec<HostId>>;

    // Forwarding rules; each mutation returns the host's new version
    async fn create_rule(&self, rule: &ForwardingRule) -> Result<u64>;
    async fn update_rule(&self, rule: &ForwardingRule) -> Result<u64>;
    async fn delete_rule(&self, host_id: HostId, rule_id: RuleId) -> Result<u64>;
    async fn get_rule(&self, host_id: HostId, rule_id: RuleId) -> Result<Option<ForwardingRule>>;
    async fn list_rules(&self, host_id: HostId) -> Result<(Vec<ForwardingRule>, u64)>;
    async fn rule_version(&self, host_id: HostId) -> Result<u64>;
    async fn list_rule_logs(
        &self,
        host_id: HostId,
        query: &RuleLogQuery,
    ) -> Result<(Vec<RuleLog>, u64)>;

    // Core instances
    async fn insert_instance(&self, instance: &CoreInstance) -> Result<()>;
    async fn get_instance(&self, host_id: HostId, instance_id: &str)
        -> Result<Option<CoreInstance>>;
    async fn list_instances(&self, host_id: HostId) -> Result<Vec<CoreInstance>>;
    async fn update_instance(&self, instance: &CoreInstance) -> Result<()>;
    async fn delete_instance(&self, host_id: HostId, instance_id: &str) -> Result<bool>;

    // Config templates
    async fn create_template(&self, template: &ConfigTemplate) -> Result<()>;
    async fn get_template(&self, id: TemplateId) -> Result<Option<ConfigTemplate>>;
    async fn list_templates(&self) -> Result<Vec<ConfigTemplate>>;

    // Switch claims and audit log
    /// Insert an `in_progress` record. Fails with `SwitchInProgress` if the
    /// host already holds a claim and with `Conflict` on a duplicate switch id.
    async fn claim_switch(&self, claim: &SwitchLog) -> Result<()>;
    /// Move an `in_progress` record to its terminal status, releasing the claim.
    async fn finalize_switch(
        &self,
        host_id: HostId,
        switch_id: &str,
        status: SwitchStatus,
        error: Option<String>,
        finished_at: DateTime<Utc>,
    ) -> Result<()>;
    async fn get_active_switch(&self, host_id: HostId) -> Result<Option<SwitchLog>>;
    async fn list_active_switches(&self) -> Result<Vec<SwitchLog>>;
    async fn list_switch_logs(
        &self,
        host_id: HostId,
        query: &SwitchLogQuery,
    ) -> Result<(Vec<SwitchLog>, u64)>;
}
