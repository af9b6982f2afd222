pub mod host;
pub mod instance;
pub mod rule;
pub mod switch;

pub use host::{AgentHost, HostMetrics};
pub use instance::{ConfigTemplate, CoreInstance, InstanceConfig};
pub use rule::{ForwardingRule, RuleAction, RuleDraft, RuleLog, RuleProtocol};
pub use switch::{SwitchLog, SwitchStatus};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::Error;

pub type HostId = Uuid;
pub type RuleId = Uuid;
pub type TemplateId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostStatus {
    Online,
    Offline,
}

impl HostStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HostStatus::Online => "online",
            HostStatus::Offline => "offline",
        }
    }
}

impl FromStr for HostStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "online" => Ok(HostStatus::Online),
            "offline" => Ok(HostStatus::Offline),
            other => Err(Error::invalid_input(format!("unknown host status '{}'", other))),
        }
    }
}

/// Proxy engine implementation an instance runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CoreType {
    Xray,
    #[serde(alias = "singbox", alias = "sing_box")]
    SingBox,
}

impl CoreType {
    pub const ALL: [CoreType; 2] = [CoreType::Xray, CoreType::SingBox];

    pub fn as_str(&self) -> &'static str {
        match self {
            CoreType::Xray => "xray",
            CoreType::SingBox => "sing-box",
        }
    }
}

impl fmt::Display for CoreType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CoreType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "xray" => Ok(CoreType::Xray),
            "sing-box" | "singbox" | "sing_box" => Ok(CoreType::SingBox),
            other => Err(Error::invalid_input(format!("unknown core type '{}'", other))),
        }
    }
}
