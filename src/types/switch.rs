use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use super::{CoreType, HostId};
use crate::error::Error;

/// Outcome of a switch attempt as recorded in the audit log.
///
/// `InProgress` rows are the durable per-host claim; at most one exists per
/// host at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwitchStatus {
    InProgress,
    Succeeded,
    Failed,
    /// Failed after the old instance had been released, and the old
    /// instance was restored.
    RolledBack,
}

impl SwitchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SwitchStatus::InProgress => "in_progress",
            SwitchStatus::Succeeded => "succeeded",
            SwitchStatus::Failed => "failed",
            SwitchStatus::RolledBack => "rolled_back",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, SwitchStatus::InProgress)
    }
}

impl FromStr for SwitchStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in_progress" => Ok(SwitchStatus::InProgress),
            "succeeded" => Ok(SwitchStatus::Succeeded),
            "failed" => Ok(SwitchStatus::Failed),
            "rolled_back" | "rolled-back" => Ok(SwitchStatus::RolledBack),
            other => Err(Error::invalid_input(format!(
                "unknown switch status '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwitchLog {
    pub id: uuid::Uuid,
    pub host_id: HostId,
    pub switch_id: String,
    pub from_instance_id: String,
    /// Instance the switch provisions; used by recovery to clean up.
    pub to_instance_id: String,
    pub to_core_type: CoreType,
    pub zero_downtime: bool,
    pub status: SwitchStatus,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl SwitchLog {
    pub fn claim(
        host_id: HostId,
        switch_id: String,
        from_instance_id: String,
        to_instance_id: String,
        to_core_type: CoreType,
        zero_downtime: bool,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            host_id,
            switch_id,
            from_instance_id,
            to_instance_id,
            to_core_type,
            zero_downtime,
            status: SwitchStatus::InProgress,
            error: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Whether this attempt touches the given instance.
    pub fn involves(&self, instance_id: &str) -> bool {
        self.from_instance_id == instance_id || self.to_instance_id == instance_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_parsing_accepts_both_spellings() {
        assert_eq!(
            "rolled-back".parse::<SwitchStatus>().unwrap(),
            SwitchStatus::RolledBack
        );
        assert_eq!(
            "rolled_back".parse::<SwitchStatus>().unwrap(),
            SwitchStatus::RolledBack
        );
        assert!("done".parse::<SwitchStatus>().is_err());
    }

    #[test]
    fn test_claim_starts_in_progress() {
        let log = SwitchLog::claim(
            HostId::new_v4(),
            "sw-1".to_string(),
            "old".to_string(),
            "new".to_string(),
            CoreType::SingBox,
            true,
        );
        assert_eq!(log.status, SwitchStatus::InProgress);
        assert!(!log.status.is_terminal());
        assert!(log.finished_at.is_none());
        assert!(log.involves("old"));
        assert!(log.involves("new"));
        assert!(!log.involves("other"));
    }
}
