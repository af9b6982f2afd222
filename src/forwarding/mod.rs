//! Per-host forwarding rules and their version counter.
//!
//! Agents compare the version they last applied with [`ForwardingRuleStore::version_for_agent`]
//! and re-pull the rule set when it moved.

use chrono::Utc;
use log::info;
use serde::Serialize;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::storage::{RuleLogQuery, Storage};
use crate::types::{ForwardingRule, HostId, RuleDraft, RuleId, RuleLog};

/// Rules of one host together with the version they were read at.
#[derive(Debug, Clone, Serialize)]
pub struct RuleSet {
    pub rules: Vec<ForwardingRule>,
    pub version: u64,
}

/// Answer to an agent's pull: rules are only included when `changed`.
#[derive(Debug, Clone, Serialize)]
pub struct RuleSync {
    pub changed: bool,
    pub version: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rules: Option<Vec<ForwardingRule>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RuleMutation {
    pub rule: ForwardingRule,
    pub version: u64,
}

#[derive(Clone)]
pub struct ForwardingRuleStore {
    storage: Arc<dyn Storage>,
}

impl ForwardingRuleStore {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    pub async fn create(&self, host_id: HostId, draft: RuleDraft) -> Result<RuleMutation> {
        let rule = draft.into_rule(host_id)?;
        let version = self.storage.create_rule(&rule).await?;
        info!(
            "Created forwarding rule {} on host {} (port {}), version {}",
            rule.id, host_id, rule.listen_port, version
        );
        Ok(RuleMutation { rule, version })
    }

    pub async fn update(
        &self,
        host_id: HostId,
        rule_id: RuleId,
        draft: RuleDraft,
    ) -> Result<RuleMutation> {
        let existing = self
            .storage
            .get_rule(host_id, rule_id)
            .await?
            .ok_or_else(|| Error::not_found(format!("forwarding rule {}", rule_id)))?;

        let mut rule = draft.into_rule(host_id)?;
        rule.id = existing.id;
        rule.created_at = existing.created_at;
        rule.updated_at = Utc::now();

        let version = self.storage.update_rule(&rule).await?;
        info!(
            "Updated forwarding rule {} on host {}, version {}",
            rule.id, host_id, version
        );
        Ok(RuleMutation { rule, version })
    }

    pub async fn delete(&self, host_id: HostId, rule_id: RuleId) -> Result<u64> {
        let version = self.storage.delete_rule(host_id, rule_id).await?;
        info!(
            "Deleted forwarding rule {} on host {}, version {}",
            rule_id, host_id, version
        );
        Ok(version)
    }

    pub async fn get(&self, host_id: HostId, rule_id: RuleId) -> Result<ForwardingRule> {
        self.storage
            .get_rule(host_id, rule_id)
            .await?
            .ok_or_else(|| Error::not_found(format!("forwarding rule {}", rule_id)))
    }

    pub async fn list_by_agent(&self, host_id: HostId) -> Result<RuleSet> {
        let (rules, version) = self.storage.list_rules(host_id).await?;
        Ok(RuleSet { rules, version })
    }

    pub async fn version_for_agent(&self, host_id: HostId) -> Result<u64> {
        self.storage.rule_version(host_id).await
    }

    /// Rules for an agent that last applied `known_version`.
    pub async fn sync(&self, host_id: HostId, known_version: Option<u64>) -> Result<RuleSync> {
        let set = self.list_by_agent(host_id).await?;
        if known_version == Some(set.version) {
            return Ok(RuleSync {
                changed: false,
                version: set.version,
                rules: None,
            });
        }
        Ok(RuleSync {
            changed: true,
            version: set.version,
            rules: Some(set.rules),
        })
    }

    pub async fn logs(&self, host_id: HostId, query: &RuleLogQuery) -> Result<(Vec<RuleLog>, u64)> {
        if let (Some(start), Some(end)) = (query.start_at, query.end_at) {
            if start > end {
                return Err(Error::invalid_input("start_at must not be after end_at"));
            }
        }
        // Distinguish an unknown host from an empty log
        self.storage.rule_version(host_id).await?;
        self.storage.list_rule_logs(host_id, query).await
    }
}
