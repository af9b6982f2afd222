use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwitchPhase {
    Idle,
    Claimed,
    Provisioning,
    Verifying,
    Cutover,
    Cleanup,
    Completed,
    RollingBack,
    Failed,
}

impl SwitchPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SwitchPhase::Completed | SwitchPhase::Failed)
    }
}

impl fmt::Display for SwitchPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SwitchEvent {
    ClaimAcquired,
    ProvisionStarted,
    Provisioned,
    Verified,
    OldReleased,
    Finished,
    Failure,
    RollbackDone,
}

/// Phase tracker for one switch attempt.
#[derive(Debug)]
pub struct SwitchStateMachine {
    phase: SwitchPhase,
}

impl SwitchStateMachine {
    pub fn new() -> Self {
        Self {
            phase: SwitchPhase::Idle,
        }
    }

    pub fn phase(&self) -> SwitchPhase {
        self.phase
    }

    pub fn transition(&mut self, event: SwitchEvent) -> Result<SwitchPhase> {
        let next = match (self.phase, event) {
            (SwitchPhase::Idle, SwitchEvent::ClaimAcquired) => SwitchPhase::Claimed,
            (SwitchPhase::Claimed, SwitchEvent::ProvisionStarted) => SwitchPhase::Provisioning,
            (SwitchPhase::Provisioning, SwitchEvent::Provisioned) => SwitchPhase::Verifying,
            (SwitchPhase::Verifying, SwitchEvent::Verified) => SwitchPhase::Cutover,
            (SwitchPhase::Cutover, SwitchEvent::OldReleased) => SwitchPhase::Cleanup,
            (SwitchPhase::Cleanup, SwitchEvent::Finished) => SwitchPhase::Completed,

            (
                SwitchPhase::Claimed
                | SwitchPhase::Provisioning
                | SwitchPhase::Verifying
                | SwitchPhase::Cutover
                | SwitchPhase::Cleanup,
                SwitchEvent::Failure,
            ) => SwitchPhase::RollingBack,
            (SwitchPhase::RollingBack, SwitchEvent::RollbackDone) => SwitchPhase::Failed,

            (from, event) => {
                return Err(Error::InvalidTransition {
                    from: from.to_string(),
                    event: format!("{:?}", event),
                });
            }
        };

        self.phase = next;
        Ok(next)
    }
}

impl Default for SwitchStateMachine {
    fn default() -> Self {
        Self::new()
    }
}
