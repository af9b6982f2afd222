use std::sync::Arc;

use crate::error::{Error, Result};
use crate::storage::{Storage, SwitchLogQuery};
use crate::types::{HostId, SwitchLog};

/// Read side of the switch audit trail. Records are written only by the
/// orchestrator's claim and finalize steps.
#[derive(Clone)]
pub struct SwitchAuditLog {
    storage: Arc<dyn Storage>,
}

impl SwitchAuditLog {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    /// Newest first. Records outlive their host, so an unknown host simply
    /// has none.
    pub async fn list(&self, host_id: HostId, query: &SwitchLogQuery) -> Result<(Vec<SwitchLog>, u64)> {
        if let (Some(start), Some(end)) = (query.start_at, query.end_at) {
            if start > end {
                return Err(Error::invalid_input("start_at must not be after end_at"));
            }
        }
        self.storage.list_switch_logs(host_id, query).await
    }

    pub async fn active(&self, host_id: HostId) -> Result<Option<SwitchLog>> {
        self.storage.get_active_switch(host_id).await
    }
}
