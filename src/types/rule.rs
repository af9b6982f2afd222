use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use super::{HostId, RuleId};
use crate::error::{Error, Result};

/// Protocols a forwarding rule may declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RuleProtocol {
    #[serde(rename = "tcp")]
    Tcp,
    #[serde(rename = "udp")]
    Udp,
    #[serde(rename = "tcp+udp")]
    TcpUdp,
    #[serde(rename = "vmess")]
    Vmess,
    #[serde(rename = "vless")]
    Vless,
    #[serde(rename = "trojan")]
    Trojan,
    #[serde(rename = "shadowsocks")]
    Shadowsocks,
    #[serde(rename = "socks")]
    Socks,
    #[serde(rename = "http")]
    Http,
}

impl RuleProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleProtocol::Tcp => "tcp",
            RuleProtocol::Udp => "udp",
            RuleProtocol::TcpUdp => "tcp+udp",
            RuleProtocol::Vmess => "vmess",
            RuleProtocol::Vless => "vless",
            RuleProtocol::Trojan => "trojan",
            RuleProtocol::Shadowsocks => "shadowsocks",
            RuleProtocol::Socks => "socks",
            RuleProtocol::Http => "http",
        }
    }
}

impl FromStr for RuleProtocol {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tcp" => Ok(RuleProtocol::Tcp),
            "udp" => Ok(RuleProtocol::Udp),
            "tcp+udp" => Ok(RuleProtocol::TcpUdp),
            "vmess" => Ok(RuleProtocol::Vmess),
            "vless" => Ok(RuleProtocol::Vless),
            "trojan" => Ok(RuleProtocol::Trojan),
            "shadowsocks" => Ok(RuleProtocol::Shadowsocks),
            "socks" => Ok(RuleProtocol::Socks),
            "http" => Ok(RuleProtocol::Http),
            other => Err(Error::invalid_input(format!(
                "protocol '{}' is not allowed",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForwardingRule {
    pub id: RuleId,
    pub host_id: HostId,
    pub name: String,
    pub protocol: RuleProtocol,
    pub listen_port: u16,
    pub target_address: String,
    pub target_port: u16,
    pub enabled: bool,
    pub priority: i32,
    pub remark: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ForwardingRule {
    /// Whether this rule and `other` would both hold the same listen port.
    pub fn collides_with(&self, other: &ForwardingRule) -> bool {
        self.id != other.id
            && self.host_id == other.host_id
            && self.enabled
            && other.enabled
            && self.listen_port == other.listen_port
    }
}

/// Unvalidated rule fields as submitted by an admin.
///
/// Ports are wide integers so out-of-range values reach validation instead
/// of failing deserialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleDraft {
    pub name: String,
    pub protocol: String,
    pub listen_port: i64,
    pub target_address: String,
    pub target_port: i64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub remark: String,
}

fn default_enabled() -> bool {
    true
}

impl RuleDraft {
    /// Validate and turn the draft into a rule owned by `host_id`.
    pub fn into_rule(self, host_id: HostId) -> Result<ForwardingRule> {
        let name = self.name.trim().to_string();
        if name.is_empty() {
            return Err(Error::invalid_input("name must not be empty"));
        }
        let protocol: RuleProtocol = self.protocol.parse()?;
        let listen_port = validate_port("listen_port", self.listen_port)?;
        let target_port = validate_port("target_port", self.target_port)?;
        let target_address = self.target_address.trim().to_string();
        if target_address.is_empty() {
            return Err(Error::invalid_input("target_address must not be empty"));
        }

        let now = Utc::now();
        Ok(ForwardingRule {
            id: RuleId::new_v4(),
            host_id,
            name,
            protocol,
            listen_port,
            target_address,
            target_port,
            enabled: self.enabled,
            priority: self.priority,
            remark: self.remark,
            created_at: now,
            updated_at: now,
        })
    }
}

fn validate_port(field: &str, value: i64) -> Result<u16> {
    if (1..=65535).contains(&value) {
        Ok(value as u16)
    } else {
        Err(Error::invalid_input(format!(
            "{} must be within 1-65535, got {}",
            field, value
        )))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleAction {
    Create,
    Update,
    Delete,
}

impl RuleAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleAction::Create => "create",
            RuleAction::Update => "update",
            RuleAction::Delete => "delete",
        }
    }
}

impl FromStr for RuleAction {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "create" => Ok(RuleAction::Create),
            "update" => Ok(RuleAction::Update),
            "delete" => Ok(RuleAction::Delete),
            other => Err(Error::storage(format!("unknown rule action '{}'", other))),
        }
    }
}

/// One config-affecting rule mutation, written with the mutation itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleLog {
    pub id: uuid::Uuid,
    pub host_id: HostId,
    pub rule_id: RuleId,
    pub action: RuleAction,
    /// Host rule version after the mutation
    pub version: u64,
    pub snapshot: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl RuleLog {
    pub fn record(rule: &ForwardingRule, action: RuleAction, version: u64) -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            host_id: rule.host_id,
            rule_id: rule.id,
            action,
            version,
            snapshot: serde_json::to_value(rule).unwrap_or(serde_json::Value::Null),
            created_at: Utc::now(),
        }
    }
}
