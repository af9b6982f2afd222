use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};

use crate::error::{Error, Result};
use crate::storage::traits::{RuleLogQuery, Storage, SwitchLogQuery};
use crate::types::{
    AgentHost, ConfigTemplate, CoreInstance, ForwardingRule, HostId, HostMetrics, RuleAction,
    RuleId, RuleLog, SwitchLog, SwitchStatus, TemplateId,
};

const ONE_IN_PROGRESS: &str = "core_switch_logs_one_in_progress";
const ENABLED_PORT: &str = "forwarding_rules_enabled_port";

pub struct PostgresStorage {
    pool: PgPool,
}

impl PostgresStorage {
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::raw_sql(include_str!("../../migrations/V001__initial_schema.sql"))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Lock the host's version row for the rest of the transaction.
    async fn lock_version(tx: &mut Transaction<'_, Postgres>, host_id: HostId) -> Result<u64> {
        let row = sqlx::query(
            r#"
            SELECT version
            FROM forwarding_rule_versions
            WHERE host_id = $1
            FOR UPDATE
            "#,
        )
        .bind(host_id)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or_else(|| Error::not_found(format!("agent host {}", host_id)))?;
        Ok(row.get::<i64, _>("version") as u64)
    }

    async fn check_port(tx: &mut Transaction<'_, Postgres>, rule: &ForwardingRule) -> Result<()> {
        if !rule.enabled {
            return Ok(());
        }
        let taken = sqlx::query(
            r#"
            SELECT 1
            FROM forwarding_rules
            WHERE host_id = $1 AND listen_port = $2 AND enabled AND id <> $3
            "#,
        )
        .bind(rule.host_id)
        .bind(rule.listen_port as i32)
        .bind(rule.id)
        .fetch_optional(&mut **tx)
        .await?;
        match taken {
            Some(_) => Err(Error::PortConflict {
                port: rule.listen_port,
            }),
            None => Ok(()),
        }
    }

    /// Bump the version and append the log entry inside `tx`.
    async fn commit_rule_change(
        tx: &mut Transaction<'_, Postgres>,
        rule: &ForwardingRule,
        action: RuleAction,
    ) -> Result<u64> {
        let row = sqlx::query(
            r#"
            UPDATE forwarding_rule_versions
            SET version = version + 1
            WHERE host_id = $1
            RETURNING version
            "#,
        )
        .bind(rule.host_id)
        .fetch_one(&mut **tx)
        .await?;
        let version = row.get::<i64, _>("version") as u64;

        let log = RuleLog::record(rule, action, version);
        sqlx::query(
            r#"
            INSERT INTO forwarding_rule_logs (id, host_id, rule_id, action, version, snapshot, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(log.id)
        .bind(log.host_id)
        .bind(log.rule_id)
        .bind(log.action.as_str())
        .bind(log.version as i64)
        .bind(&log.snapshot)
        .bind(log.created_at)
        .execute(&mut **tx)
        .await?;
        Ok(version)
    }
}

fn violated_constraint(err: &sqlx::Error) -> Option<&str> {
    match err {
        sqlx::Error::Database(db) if db.is_unique_violation() => db.constraint(),
        _ => None,
    }
}

fn rule_write_error(err: sqlx::Error, rule: &ForwardingRule) -> Error {
    match violated_constraint(&err) {
        Some(ENABLED_PORT) => Error::PortConflict {
            port: rule.listen_port,
        },
        Some(_) => Error::conflict(format!("rule {} already exists", rule.id)),
        None => err.into(),
    }
}

#[async_trait]
impl Storage for PostgresStorage {
    async fn create_host(&self, host: &AgentHost) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO agent_hosts (id, name, address, token, status, last_heartbeat_at, metrics, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(host.id)
        .bind(&host.name)
        .bind(&host.address)
        .bind(&host.token)
        .bind(host.status.as_str())
        .bind(host.last_heartbeat_at)
        .bind(host.metrics.as_ref().map(serde_json::to_value).transpose()?)
        .bind(host.created_at)
        .bind(host.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| match violated_constraint(&e) {
            Some(_) => Error::conflict(format!("agent host {} already exists", host.id)),
            None => e.into(),
        })?;

        sqlx::query("INSERT INTO forwarding_rule_versions (host_id, version) VALUES ($1, 0)")
            .bind(host.id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn get_host(&self, id: HostId) -> Result<Option<AgentHost>> {
        let row = sqlx::query(
            r#"
            SELECT id, name, address, token, status, last_heartbeat_at, metrics, created_at, updated_at
            FROM agent_hosts
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_host).transpose()
    }

    async fn get_host_by_token(&self, token: &str) -> Result<Option<AgentHost>> {
        let row = sqlx::query(
            r#"
            SELECT id, name, address, token, status, last_heartbeat_at, metrics, created_at, updated_at
            FROM agent_hosts
            WHERE token = $1
            "#,
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_host).transpose()
    }

    async fn list_hosts(&self) -> Result<Vec<AgentHost>> {
        let rows = sqlx::query(
            r#"
            SELECT id, name, address, token, status, last_heartbeat_at, metrics, created_at, updated_at
            FROM agent_hosts
            ORDER BY created_at ASC, name ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_host).collect()
    }

    async fn update_host(&self, host: &AgentHost) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE agent_hosts
            SET name = $2, address = $3, status = $4, last_heartbeat_at = $5, metrics = $6, updated_at = $7
            WHERE id = $1
            "#,
        )
        .bind(host.id)
        .bind(&host.name)
        .bind(&host.address)
        .bind(host.status.as_str())
        .bind(host.last_heartbeat_at)
        .bind(host.metrics.as_ref().map(serde_json::to_value).transpose()?)
        .bind(host.updated_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::not_found(format!("agent host {}", host.id)));
        }
        Ok(())
    }

    async fn delete_host(&self, id: HostId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM agent_hosts WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn record_heartbeat(&self, token: &str, at: DateTime<Utc>) -> Result<Option<HostId>> {
        let row = sqlx::query(
            r#"
            UPDATE agent_hosts
            SET status = 'online', last_heartbeat_at = $2
            WHERE token = $1
            RETURNING id
            "#,
        )
        .bind(token)
        .bind(at)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.get("id")))
    }

    async fn record_metrics(&self, token: &str, metrics: &HostMetrics) -> Result<Option<HostId>> {
        let row = sqlx::query(
            r#"
            UPDATE agent_hosts
            SET metrics = $2
            WHERE token = $1
            RETURNING id
            "#,
        )
        .bind(token)
        .bind(serde_json::to_value(metrics)?)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.get("id")))
    }

    async fn mark_stale_offline(&self, cutoff: DateTime<Utc>) -> Result<Vec<HostId>> {
        let rows = sqlx::query(
            r#"
            UPDATE agent_hosts
            SET status = 'offline', updated_at = NOW()
            WHERE status = 'online'
              AND (last_heartbeat_at IS NULL OR last_heartbeat_at < $1)
            RETURNING id
            "#,
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(|r| r.get("id")).collect())
    }

    async fn create_rule(&self, rule: &ForwardingRule) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        Self::lock_version(&mut tx, rule.host_id).await?;
        Self::check_port(&mut tx, rule).await?;

        sqlx::query(
            r#"
            INSERT INTO forwarding_rules (
                id, host_id, name, protocol, listen_port, target_address, target_port,
                enabled, priority, remark, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(rule.id)
        .bind(rule.host_id)
        .bind(&rule.name)
        .bind(rule.protocol.as_str())
        .bind(rule.listen_port as i32)
        .bind(&rule.target_address)
        .bind(rule.target_port as i32)
        .bind(rule.enabled)
        .bind(rule.priority)
        .bind(&rule.remark)
        .bind(rule.created_at)
        .bind(rule.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| rule_write_error(e, rule))?;

        let version = Self::commit_rule_change(&mut tx, rule, RuleAction::Create).await?;
        tx.commit().await?;
        Ok(version)
    }

    async fn update_rule(&self, rule: &ForwardingRule) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        Self::lock_version(&mut tx, rule.host_id).await?;
        Self::check_port(&mut tx, rule).await?;

        let result = sqlx::query(
            r#"
            UPDATE forwarding_rules
            SET name = $3, protocol = $4, listen_port = $5, target_address = $6, target_port = $7,
                enabled = $8, priority = $9, remark = $10, updated_at = $11
            WHERE id = $1 AND host_id = $2
            "#,
        )
        .bind(rule.id)
        .bind(rule.host_id)
        .bind(&rule.name)
        .bind(rule.protocol.as_str())
        .bind(rule.listen_port as i32)
        .bind(&rule.target_address)
        .bind(rule.target_port as i32)
        .bind(rule.enabled)
        .bind(rule.priority)
        .bind(&rule.remark)
        .bind(rule.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| rule_write_error(e, rule))?;

        if result.rows_affected() == 0 {
            return Err(Error::not_found(format!("forwarding rule {}", rule.id)));
        }

        let version = Self::commit_rule_change(&mut tx, rule, RuleAction::Update).await?;
        tx.commit().await?;
        Ok(version)
    }

    async fn delete_rule(&self, host_id: HostId, rule_id: RuleId) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        Self::lock_version(&mut tx, host_id).await?;

        let row = sqlx::query(
            r#"
            DELETE FROM forwarding_rules
            WHERE id = $1 AND host_id = $2
            RETURNING id, host_id, name, protocol, listen_port, target_address, target_port,
                      enabled, priority, remark, created_at, updated_at
            "#,
        )
        .bind(rule_id)
        .bind(host_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| Error::not_found(format!("forwarding rule {}", rule_id)))?;
        let removed = row_to_rule(&row)?;

        let version = Self::commit_rule_change(&mut tx, &removed, RuleAction::Delete).await?;
        tx.commit().await?;
        Ok(version)
    }

    async fn get_rule(&self, host_id: HostId, rule_id: RuleId) -> Result<Option<ForwardingRule>> {
        let row = sqlx::query(
            r#"
            SELECT id, host_id, name, protocol, listen_port, target_address, target_port,
                   enabled, priority, remark, created_at, updated_at
            FROM forwarding_rules
            WHERE id = $1 AND host_id = $2
            "#,
        )
        .bind(rule_id)
        .bind(host_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_rule).transpose()
    }

    async fn list_rules(&self, host_id: HostId) -> Result<(Vec<ForwardingRule>, u64)> {
        // Read rules and version from one snapshot
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ")
            .execute(&mut *tx)
            .await?;

        let version = sqlx::query("SELECT version FROM forwarding_rule_versions WHERE host_id = $1")
            .bind(host_id)
            .fetch_optional(&mut *tx)
            .await?
            .map(|r| r.get::<i64, _>("version") as u64)
            .ok_or_else(|| Error::not_found(format!("agent host {}", host_id)))?;

        let rows = sqlx::query(
            r#"
            SELECT id, host_id, name, protocol, listen_port, target_address, target_port,
                   enabled, priority, remark, created_at, updated_at
            FROM forwarding_rules
            WHERE host_id = $1
            ORDER BY priority DESC, listen_port ASC, created_at ASC
            "#,
        )
        .bind(host_id)
        .fetch_all(&mut *tx)
        .await?;
        tx.commit().await?;

        let rules = rows.iter().map(row_to_rule).collect::<Result<Vec<_>>>()?;
        Ok((rules, version))
    }

    async fn rule_version(&self, host_id: HostId) -> Result<u64> {
        sqlx::query("SELECT version FROM forwarding_rule_versions WHERE host_id = $1")
            .bind(host_id)
            .fetch_optional(&self.pool)
            .await?
            .map(|r| r.get::<i64, _>("version") as u64)
            .ok_or_else(|| Error::not_found(format!("agent host {}", host_id)))
    }

    async fn list_rule_logs(
        &self,
        host_id: HostId,
        query: &RuleLogQuery,
    ) -> Result<(Vec<RuleLog>, u64)> {
        let total: i64 = sqlx::query(
            r#"
            SELECT COUNT(*) AS total
            FROM forwarding_rule_logs
            WHERE host_id = $1
              AND ($2::uuid IS NULL OR rule_id = $2)
              AND ($3::timestamptz IS NULL OR created_at >= $3)
              AND ($4::timestamptz IS NULL OR created_at <= $4)
            "#,
        )
        .bind(host_id)
        .bind(query.rule_id)
        .bind(query.start_at)
        .bind(query.end_at)
        .fetch_one(&self.pool)
        .await?
        .get("total");

        let rows = sqlx::query(
            r#"
            SELECT id, host_id, rule_id, action, version, snapshot, created_at
            FROM forwarding_rule_logs
            WHERE host_id = $1
              AND ($2::uuid IS NULL OR rule_id = $2)
              AND ($3::timestamptz IS NULL OR created_at >= $3)
              AND ($4::timestamptz IS NULL OR created_at <= $4)
            ORDER BY version DESC
            LIMIT $5 OFFSET $6
            "#,
        )
        .bind(host_id)
        .bind(query.rule_id)
        .bind(query.start_at)
        .bind(query.end_at)
        .bind(query.page.limit as i64)
        .bind(query.page.offset as i64)
        .fetch_all(&self.pool)
        .await?;

        let logs = rows
            .iter()
            .map(|r| {
                let action: String = r.get("action");
                Ok(RuleLog {
                    id: r.get("id"),
                    host_id: r.get("host_id"),
                    rule_id: r.get("rule_id"),
                    action: action.parse()?,
                    version: r.get::<i64, _>("version") as u64,
                    snapshot: r.get("snapshot"),
                    created_at: r.get("created_at"),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok((logs, total as u64))
    }

    async fn insert_instance(&self, instance: &CoreInstance) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO core_instances (host_id, instance_id, core_type, config, listen_ports, active, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(instance.host_id)
        .bind(&instance.instance_id)
        .bind(instance.core_type.as_str())
        .bind(serde_json::to_value(&instance.config)?)
        .bind(ports_to_sql(&instance.listen_ports))
        .bind(instance.active)
        .bind(instance.created_at)
        .bind(instance.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if violated_constraint(&e).is_some() {
                return Error::conflict(format!(
                    "core instance '{}' already exists on host {}",
                    instance.instance_id, instance.host_id
                ));
            }
            let missing_host = matches!(
                &e,
                sqlx::Error::Database(db) if db.is_foreign_key_violation()
            );
            if missing_host {
                return Error::not_found(format!("agent host {}", instance.host_id));
            }
            e.into()
        })?;
        Ok(())
    }

    async fn get_instance(
        &self,
        host_id: HostId,
        instance_id: &str,
    ) -> Result<Option<CoreInstance>> {
        let row = sqlx::query(
            r#"
            SELECT host_id, instance_id, core_type, config, listen_ports, active, created_at, updated_at
            FROM core_instances
            WHERE host_id = $1 AND instance_id = $2
            "#,
        )
        .bind(host_id)
        .bind(instance_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_instance).transpose()
    }

    async fn list_instances(&self, host_id: HostId) -> Result<Vec<CoreInstance>> {
        let rows = sqlx::query(
            r#"
            SELECT host_id, instance_id, core_type, config, listen_ports, active, created_at, updated_at
            FROM core_instances
            WHERE host_id = $1
            ORDER BY instance_id ASC
            "#,
        )
        .bind(host_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_instance).collect()
    }

    async fn update_instance(&self, instance: &CoreInstance) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE core_instances
            SET core_type = $3, config = $4, listen_ports = $5, active = $6, updated_at = $7
            WHERE host_id = $1 AND instance_id = $2
            "#,
        )
        .bind(instance.host_id)
        .bind(&instance.instance_id)
        .bind(instance.core_type.as_str())
        .bind(serde_json::to_value(&instance.config)?)
        .bind(ports_to_sql(&instance.listen_ports))
        .bind(instance.active)
        .bind(instance.updated_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::not_found(format!(
                "core instance '{}'",
                instance.instance_id
            )));
        }
        Ok(())
    }

    async fn delete_instance(&self, host_id: HostId, instance_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM core_instances WHERE host_id = $1 AND instance_id = $2")
            .bind(host_id)
            .bind(instance_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn create_template(&self, template: &ConfigTemplate) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO config_templates (id, name, core_type, document, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(template.id)
        .bind(&template.name)
        .bind(template.core_type.as_str())
        .bind(&template.document)
        .bind(template.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| match violated_constraint(&e) {
            Some(_) => Error::conflict(format!(
                "config template '{}' already exists",
                template.name
            )),
            None => e.into(),
        })?;
        Ok(())
    }

    async fn get_template(&self, id: TemplateId) -> Result<Option<ConfigTemplate>> {
        let row = sqlx::query(
            r#"
            SELECT id, name, core_type, document, created_at
            FROM config_templates
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_template).transpose()
    }

    async fn list_templates(&self) -> Result<Vec<ConfigTemplate>> {
        let rows = sqlx::query(
            r#"
            SELECT id, name, core_type, document, created_at
            FROM config_templates
            ORDER BY name ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_template).collect()
    }

    async fn claim_switch(&self, claim: &SwitchLog) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO core_switch_logs (
                id, host_id, switch_id, from_instance_id, to_instance_id, to_core_type,
                zero_downtime, status, error, started_at, finished_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(claim.id)
        .bind(claim.host_id)
        .bind(&claim.switch_id)
        .bind(&claim.from_instance_id)
        .bind(&claim.to_instance_id)
        .bind(claim.to_core_type.as_str())
        .bind(claim.zero_downtime)
        .bind(claim.status.as_str())
        .bind(&claim.error)
        .bind(claim.started_at)
        .bind(claim.finished_at)
        .execute(&self.pool)
        .await
        .map_err(|e| match violated_constraint(&e) {
            Some(ONE_IN_PROGRESS) => Error::SwitchInProgress {
                host_id: claim.host_id,
            },
            Some(_) => Error::conflict(format!(
                "switch id '{}' was already used on this host",
                claim.switch_id
            )),
            None => e.into(),
        })?;
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
        let result = sqlx::query(
            r#"
            UPDATE core_switch_logs
            SET status = $3, error = $4, finished_at = $5
            WHERE host_id = $1 AND switch_id = $2 AND status = 'in_progress'
            "#,
        )
        .bind(host_id)
        .bind(switch_id)
        .bind(status.as_str())
        .bind(error)
        .bind(finished_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::not_found(format!("in-progress switch '{}'", switch_id)));
        }
        Ok(())
    }

    async fn get_active_switch(&self, host_id: HostId) -> Result<Option<SwitchLog>> {
        let row = sqlx::query(
            r#"
            SELECT id, host_id, switch_id, from_instance_id, to_instance_id, to_core_type,
                   zero_downtime, status, error, started_at, finished_at
            FROM core_switch_logs
            WHERE host_id = $1 AND status = 'in_progress'
            "#,
        )
        .bind(host_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_switch).transpose()
    }

    async fn list_active_switches(&self) -> Result<Vec<SwitchLog>> {
        let rows = sqlx::query(
            r#"
            SELECT id, host_id, switch_id, from_instance_id, to_instance_id, to_core_type,
                   zero_downtime, status, error, started_at, finished_at
            FROM core_switch_logs
            WHERE status = 'in_progress'
            ORDER BY started_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_switch).collect()
    }

    async fn list_switch_logs(
        &self,
        host_id: HostId,
        query: &SwitchLogQuery,
    ) -> Result<(Vec<SwitchLog>, u64)> {
        let status = query.status.map(|s| s.as_str());

        let total: i64 = sqlx::query(
            r#"
            SELECT COUNT(*) AS total
            FROM core_switch_logs
            WHERE host_id = $1
              AND ($2::text IS NULL OR status = $2)
              AND ($3::timestamptz IS NULL OR started_at >= $3)
              AND ($4::timestamptz IS NULL OR started_at <= $4)
            "#,
        )
        .bind(host_id)
        .bind(status)
        .bind(query.start_at)
        .bind(query.end_at)
        .fetch_one(&self.pool)
        .await?
        .get("total");

        let rows = sqlx::query(
            r#"
            SELECT id, host_id, switch_id, from_instance_id, to_instance_id, to_core_type,
                   zero_downtime, status, error, started_at, finished_at
            FROM core_switch_logs
            WHERE host_id = $1
              AND ($2::text IS NULL OR status = $2)
              AND ($3::timestamptz IS NULL OR started_at >= $3)
              AND ($4::timestamptz IS NULL OR started_at <= $4)
            ORDER BY started_at DESC
            LIMIT $5 OFFSET $6
            "#,
        )
        .bind(host_id)
        .bind(status)
        .bind(query.start_at)
        .bind(query.end_at)
        .bind(query.page.limit as i64)
        .bind(query.page.offset as i64)
        .fetch_all(&self.pool)
        .await?;

        let logs = rows.iter().map(row_to_switch).collect::<Result<Vec<_>>>()?;
        Ok((logs, total as u64))
    }
}

fn ports_to_sql(ports: &[u16]) -> Vec<i32> {
    ports.iter().map(|p| *p as i32).collect()
}

fn row_to_host(r: &PgRow) -> Result<AgentHost> {
    let status: String = r.get("status");
    let metrics: Option<serde_json::Value> = r.get("metrics");
    let metrics = metrics
        .map(serde_json::from_value::<HostMetrics>)
        .transpose()?;

    Ok(AgentHost {
        id: r.get("id"),
        name: r.get("name"),
        address: r.get("address"),
        token: r.get("token"),
        status: status.parse()?,
        last_heartbeat_at: r.get("last_heartbeat_at"),
        metrics,
        created_at: r.get("created_at"),
        updated_at: r.get("updated_at"),
    })
}

fn row_to_rule(r: &PgRow) -> Result<ForwardingRule> {
    let protocol: String = r.get("protocol");

    Ok(ForwardingRule {
        id: r.get("id"),
        host_id: r.get("host_id"),
        name: r.get("name"),
        protocol: protocol.parse().map_err(|_| {
            Error::storage(format!("stored rule has unknown protocol '{}'", protocol))
        })?,
        listen_port: r.get::<i32, _>("listen_port") as u16,
        target_address: r.get("target_address"),
        target_port: r.get::<i32, _>("target_port") as u16,
        enabled: r.get("enabled"),
        priority: r.get("priority"),
        remark: r.get("remark"),
        created_at: r.get("created_at"),
        updated_at: r.get("updated_at"),
    })
}

fn row_to_instance(r: &PgRow) -> Result<CoreInstance> {
    let core_type: String = r.get("core_type");
    let ports: Vec<i32> = r.get("listen_ports");

    Ok(CoreInstance {
        host_id: r.get("host_id"),
        instance_id: r.get("instance_id"),
        core_type: core_type.parse()?,
        config: serde_json::from_value(r.get("config"))?,
        listen_ports: ports.into_iter().map(|p| p as u16).collect(),
        active: r.get("active"),
        created_at: r.get("created_at"),
        updated_at: r.get("updated_at"),
    })
}

fn row_to_template(r: &PgRow) -> Result<ConfigTemplate> {
    let core_type: String = r.get("core_type");

    Ok(ConfigTemplate {
        id: r.get("id"),
        name: r.get("name"),
        core_type: core_type.parse()?,
        document: r.get("document"),
        created_at: r.get("created_at"),
    })
}

fn row_to_switch(r: &PgRow) -> Result<SwitchLog> {
    let core_type: String = r.get("to_core_type");
    let status: String = r.get("status");

    Ok(SwitchLog {
        id: r.get("id"),
        host_id: r.get("host_id"),
        switch_id: r.get("switch_id"),
        from_instance_id: r.get("from_instance_id"),
        to_instance_id: r.get("to_instance_id"),
        to_core_type: core_type.parse()?,
        zero_downtime: r.get("zero_downtime"),
        status: status.parse()?,
        error: r.get("error"),
        started_at: r.get("started_at"),
        finished_at: r.get("finished_at"),
    })
}
