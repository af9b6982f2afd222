use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use super::traits::{RuleLogQuery, Storage, SwitchLogQuery};
use crate::error::{Error, Result};
use crate::types::{
    AgentHost, ConfigTemplate, CoreInstance, ForwardingRule, HostId, HostMetrics, HostStatus,
    RuleAction, RuleId, RuleLog, SwitchLog, SwitchStatus, TemplateId,
};

/// Rules, version counter and log of one host, guarded together so a
/// mutation and its version bump are never observed apart.
#[derive(Debug, Default)]
struct HostRules {
    rules: HashMap<RuleId, ForwardingRule>,
    version: u64,
    logs: Vec<RuleLog>,
}

impl HostRules {
    fn conflicting(&self, rule: &ForwardingRule) -> Option<&ForwardingRule> {
        self.rules.values().find(|other| rule.collides_with(other))
    }

    fn commit(&mut self, rule: &ForwardingRule, action: RuleAction) -> u64 {
        self.version += 1;
        self.logs.push(RuleLog::record(rule, action, self.version));
        self.version
    }
}

/// Process-local backend. Each concern has its own lock so agent heartbeats
/// never wait on rule edits or switch claims.
#[derive(Clone)]
pub struct InMemoryStore {
    hosts: Arc<RwLock<HashMap<HostId, AgentHost>>>,
    rules: Arc<RwLock<HashMap<HostId, HostRules>>>,
    instances: Arc<RwLock<HashMap<HostId, BTreeMap<String, CoreInstance>>>>,
    templates: Arc<RwLock<HashMap<TemplateId, ConfigTemplate>>>,
    switches: Arc<RwLock<Vec<SwitchLog>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            hosts: Arc::new(RwLock::new(HashMap::new())),
            rules: Arc::new(RwLock::new(HashMap::new())),
            instances: Arc::new(RwLock::new(HashMap::new())),
            templates: Arc::new(RwLock::new(HashMap::new())),
            switches: Arc::new(RwLock::new(Vec::new())),
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn host_not_found(id: HostId) -> Error {
    Error::not_found(format!("agent host {}", id))
}

fn paginate<T: Clone>(items: Vec<&T>, query_page: super::traits::Page) -> (Vec<T>, u64) {
    let total = items.len() as u64;
    let page = items
        .into_iter()
        .skip(query_page.offset as usize)
        .take(query_page.limit as usize)
        .cloned()
        .collect();
    (page, total)
}

#[async_trait]
impl Storage for InMemoryStore {
    async fn create_host(&self, host: &AgentHost) -> Result<()> {
        let mut hosts = self.hosts.write();
        if hosts.contains_key(&host.id) {
            return Err(Error::conflict(format!("agent host {} already exists", host.id)));
        }
        if hosts.values().any(|h| h.token == host.token) {
            return Err(Error::conflict("agent token already in use"));
        }
        hosts.insert(host.id, host.clone());
        self.rules.write().insert(host.id, HostRules::default());
        self.instances.write().insert(host.id, BTreeMap::new());
        Ok(())
    }

    async fn get_host(&self, id: HostId) -> Result<Option<AgentHost>> {
        Ok(self.hosts.read().get(&id).cloned())
    }

    async fn get_host_by_token(&self, token: &str) -> Result<Option<AgentHost>> {
        Ok(self
            .hosts
            .read()
            .values()
            .find(|h| h.token == token)
            .cloned())
    }

    async fn list_hosts(&self) -> Result<Vec<AgentHost>> {
        let mut hosts: Vec<AgentHost> = self.hosts.read().values().cloned().collect();
        hosts.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.name.cmp(&b.name)));
        Ok(hosts)
    }

    async fn update_host(&self, host: &AgentHost) -> Result<()> {
        let mut hosts = self.hosts.write();
        match hosts.get_mut(&host.id) {
            Some(existing) => {
                *existing = host.clone();
                Ok(())
            }
            None => Err(host_not_found(host.id)),
        }
    }

    async fn delete_host(&self, id: HostId) -> Result<bool> {
        let removed = self.hosts.write().remove(&id).is_some();
        if removed {
            self.rules.write().remove(&id);
            self.instances.write().remove(&id);
        }
        Ok(removed)
    }

    async fn record_heartbeat(&self, token: &str, at: DateTime<Utc>) -> Result<Option<HostId>> {
        let mut hosts = self.hosts.write();
        Ok(hosts.values_mut().find(|h| h.token == token).map(|host| {
            host.status = HostStatus::Online;
            host.last_heartbeat_at = Some(at);
            host.id
        }))
    }

    async fn record_metrics(&self, token: &str, metrics: &HostMetrics) -> Result<Option<HostId>> {
        let mut hosts = self.hosts.write();
        Ok(hosts.values_mut().find(|h| h.token == token).map(|host| {
            host.metrics = Some(metrics.clone());
            host.id
        }))
    }

    async fn mark_stale_offline(&self, cutoff: DateTime<Utc>) -> Result<Vec<HostId>> {
        let mut hosts = self.hosts.write();
        let now = Utc::now();
        let mut changed = Vec::new();
        for host in hosts.values_mut() {
            if host.status == HostStatus::Online && host.is_stale(cutoff) {
                host.status = HostStatus::Offline;
                host.updated_at = now;
                changed.push(host.id);
            }
        }
        Ok(changed)
    }

    async fn create_rule(&self, rule: &ForwardingRule) -> Result<u64> {
        let mut rules = self.rules.write();
        let host_rules = rules
            .get_mut(&rule.host_id)
            .ok_or_else(|| host_not_found(rule.host_id))?;
        if host_rules.rules.contains_key(&rule.id) {
            return Err(Error::conflict(format!("rule {} already exists", rule.id)));
        }
        if let Some(existing) = host_rules.conflicting(rule) {
            return Err(Error::PortConflict {
                port: existing.listen_port,
            });
        }
        host_rules.rules.insert(rule.id, rule.clone());
        Ok(host_rules.commit(rule, RuleAction::Create))
    }

    async fn update_rule(&self, rule: &ForwardingRule) -> Result<u64> {
        let mut rules = self.rules.write();
        let host_rules = rules
            .get_mut(&rule.host_id)
            .ok_or_else(|| host_not_found(rule.host_id))?;
        if !host_rules.rules.contains_key(&rule.id) {
            return Err(Error::not_found(format!("forwarding rule {}", rule.id)));
        }
        if let Some(existing) = host_rules.conflicting(rule) {
            return Err(Error::PortConflict {
                port: existing.listen_port,
            });
        }
        host_rules.rules.insert(rule.id, rule.clone());
        Ok(host_rules.commit(rule, RuleAction::Update))
    }

    async fn delete_rule(&self, host_id: HostId, rule_id: RuleId) -> Result<u64> {
        let mut rules = self.rules.write();
        let host_rules = rules
            .get_mut(&host_id)
            .ok_or_else(|| host_not_found(host_id))?;
        let removed = host_rules
            .rules
            .remove(&rule_id)
            .ok_or_else(|| Error::not_found(format!("forwarding rule {}", rule_id)))?;
        Ok(host_rules.commit(&removed, RuleAction::Delete))
    }

    async fn get_rule(&self, host_id: HostId, rule_id: RuleId) -> Result<Option<ForwardingRule>> {
        Ok(self
            .rules
            .read()
            .get(&host_id)
            .and_then(|r| r.rules.get(&rule_id).cloned()))
    }

    async fn list_rules(&self, host_id: HostId) -> Result<(Vec<ForwardingRule>, u64)> {
        let rules = self.rules.read();
        let host_rules = rules.get(&host_id).ok_or_else(|| host_not_found(host_id))?;
        let mut list: Vec<ForwardingRule> = host_rules.rules.values().cloned().collect();
        list.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.listen_port.cmp(&b.listen_port))
                .then(a.created_at.cmp(&b.created_at))
        });
        Ok((list, host_rules.version))
    }

    async fn rule_version(&self, host_id: HostId) -> Result<u64> {
        self.rules
            .read()
            .get(&host_id)
            .map(|r| r.version)
            .ok_or_else(|| host_not_found(host_id))
    }

    async fn list_rule_logs(
        &self,
        host_id: HostId,
        query: &RuleLogQuery,
    ) -> Result<(Vec<RuleLog>, u64)> {
        let rules = self.rules.read();
        let host_rules = rules.get(&host_id).ok_or_else(|| host_not_found(host_id))?;
        let matching: Vec<&RuleLog> = host_rules
            .logs
            .iter()
            .rev()
            .filter(|log| query.matches(log))
            .collect();
        Ok(paginate(matching, query.page))
    }

    async fn insert_instance(&self, instance: &CoreInstance) -> Result<()> {
        let mut instances = self.instances.write();
        let host_instances = instances
            .get_mut(&instance.host_id)
            .ok_or_else(|| host_not_found(instance.host_id))?;
        if host_instances.contains_key(&instance.instance_id) {
            return Err(Error::conflict(format!(
                "core instance '{}' already exists on host {}",
                instance.instance_id, instance.host_id
            )));
        }
        host_instances.insert(instance.instance_id.clone(), instance.clone());
        Ok(())
    }

    async fn get_instance(
        &self,
        host_id: HostId,
        instance_id: &str,
    ) -> Result<Option<CoreInstance>> {
        Ok(self
            .instances
            .read()
            .get(&host_id)
            .and_then(|i| i.get(instance_id).cloned()))
    }

    async fn list_instances(&self, host_id: HostId) -> Result<Vec<CoreInstance>> {
        let instances = self.instances.read();
        let host_instances = instances
            .get(&host_id)
            .ok_or_else(|| host_not_found(host_id))?;
        Ok(host_instances.values().cloned().collect())
    }

    async fn update_instance(&self, instance: &CoreInstance) -> Result<()> {
        let mut instances = self.instances.write();
        let existing = instances
            .get_mut(&instance.host_id)
            .and_then(|i| i.get_mut(&instance.instance_id))
            .ok_or_else(|| Error::not_found(format!("core instance '{}'", instance.instance_id)))?;
        *existing = instance.clone();
        Ok(())
    }

    async fn delete_instance(&self, host_id: HostId, instance_id: &str) -> Result<bool> {
        Ok(self
            .instances
            .write()
            .get_mut(&host_id)
            .and_then(|i| i.remove(instance_id))
            .is_some())
    }

    async fn create_template(&self, template: &ConfigTemplate) -> Result<()> {
        let mut templates = self.templates.write();
        if templates.values().any(|t| t.name == template.name) {
            return Err(Error::conflict(format!(
                "config template '{}' already exists",
                template.name
            )));
        }
        templates.insert(template.id, template.clone());
        Ok(())
    }

    async fn get_template(&self, id: TemplateId) -> Result<Option<ConfigTemplate>> {
        Ok(self.templates.read().get(&id).cloned())
    }

    async fn list_templates(&self) -> Result<Vec<ConfigTemplate>> {
        let mut templates: Vec<ConfigTemplate> = self.templates.read().values().cloned().collect();
        templates.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(templates)
    }

    async fn claim_switch(&self, claim: &SwitchLog) -> Result<()> {
        let mut switches = self.switches.write();
        if switches
            .iter()
            .any(|s| s.host_id == claim.host_id && s.status == SwitchStatus::InProgress)
        {
            return Err(Error::SwitchInProgress {
                host_id: claim.host_id,
            });
        }
        if switches
            .iter()
            .any(|s| s.host_id == claim.host_id && s.switch_id == claim.switch_id)
        {
            return Err(Error::conflict(format!(
                "switch id '{}' was already used on this host",
                claim.switch_id
            )));
        }
        switches.push(claim.clone());
        Ok(())
    }

    async fn finalize_switch(
        &self,
        host_id: HostId,
        switch_id: &str,
        status: SwitchStatus,
        error: Option<String>,
        finished_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut switches = self.switches.write();
        let record = switches
            .iter_mut()
            .find(|s| {
                s.host_id == host_id
                    && s.switch_id == switch_id
                    && s.status == SwitchStatus::InProgress
            })
            .ok_or_else(|| Error::not_found(format!("in-progress switch '{}'", switch_id)))?;
        record.status = status;
        record.error = error;
        record.finished_at = Some(finished_at);
        Ok(())
    }

    async fn get_active_switch(&self, host_id: HostId) -> Result<Option<SwitchLog>> {
        Ok(self
            .switches
            .read()
            .iter()
            .find(|s| s.host_id == host_id && s.status == SwitchStatus::InProgress)
            .cloned())
    }

    async fn list_active_switches(&self) -> Result<Vec<SwitchLog>> {
        Ok(self
            .switches
            .read()
            .iter()
            .filter(|s| s.status == SwitchStatus::InProgress)
            .cloned()
            .collect())
    }

    async fn list_switch_logs(
        &self,
        host_id: HostId,
        query: &SwitchLogQuery,
    ) -> Result<(Vec<SwitchLog>, u64)> {
        let switches = self.switches.read();
        let matching: Vec<&SwitchLog> = switches
            .iter()
            .rev()
            .filter(|s| s.host_id == host_id && query.matches(s))
            .collect();
        Ok(paginate(matching, query.page))
    }
}
