use chrono::Utc;
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::state_machine::{SwitchEvent, SwitchStateMachine};
use super::{cancellable, parse_ports, CoreOrchestrator};
use crate::convert;
use crate::error::{Error, Result};
use crate::retry::retry_with_backoff;
use crate::transport::AgentTransport;
use crate::types::instance::{instance_filename, validate_instance_id};
use crate::types::{CoreInstance, CoreType, HostId, InstanceConfig, SwitchLog, SwitchStatus};

fn default_zero_downtime() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct SwitchRequest {
    pub from_instance_id: String,
    pub to_core_type: String,
    /// Target configuration; converted from the live source config when absent
    #[serde(default)]
    pub config: Option<Value>,
    #[serde(default)]
    pub switch_id: Option<String>,
    #[serde(default)]
    pub listen_ports: Vec<i64>,
    #[serde(default = "default_zero_downtime")]
    pub zero_downtime: bool,
    #[serde(default)]
    pub to_instance_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SwitchOutcome {
    pub switch_id: String,
    pub status: SwitchStatus,
    pub from_instance_id: String,
    pub to_instance_id: String,
    pub to_core_type: CoreType,
    /// Fields the conversion could not carry over
    pub warnings: Vec<String>,
}

/// Everything rollback needs to know about how far a switch got.
struct SwitchRun {
    host_id: HostId,
    switch_id: String,
    old: CoreInstance,
    to_core: CoreType,
    to_instance_id: String,
    zero_downtime: bool,
    requested_ports: Vec<u16>,
    snapshot: Option<Vec<u8>>,
    warnings: Vec<String>,
    old_released: bool,
    old_record_removed: bool,
    new_record: Option<CoreInstance>,
    new_file_sent: bool,
}

impl SwitchRun {
    fn new_filename(&self) -> String {
        instance_filename(self.to_core, &self.to_instance_id)
    }
}

impl CoreOrchestrator {
    /// Replace `from_instance_id` with a new instance of another core.
    ///
    /// Validation failures return before a claim is taken and leave no audit
    /// record. Once claimed, every failure (including cancellation) is rolled
    /// back and finalized, and the triggering error is returned.
    pub async fn switch_core(
        &self,
        host_id: HostId,
        request: SwitchRequest,
        cancel: CancellationToken,
    ) -> Result<SwitchOutcome> {
        let host = self.host(host_id).await?;
        let old = self.instance(host_id, &request.from_instance_id).await?;
        let to_core: CoreType = request.to_core_type.parse()?;
        let requested_ports = parse_ports(&request.listen_ports)?;
        if let Some(config) = &request.config {
            convert::validate(to_core, config)?;
        }

        let to_instance_id = match &request.to_instance_id {
            Some(id) => {
                validate_instance_id(id)?;
                id.clone()
            }
            None => format!("{}-{}", to_core.as_str(), &Uuid::new_v4().simple().to_string()[..8]),
        };
        if to_instance_id == old.instance_id
            || self
                .storage
                .get_instance(host_id, &to_instance_id)
                .await?
                .is_some()
        {
            return Err(Error::conflict(format!(
                "core instance '{}' already exists",
                to_instance_id
            )));
        }

        let switch_id = match &request.switch_id {
            Some(id) => {
                validate_switch_id(id)?;
                id.clone()
            }
            None => format!("sw-{}", Uuid::new_v4().simple()),
        };

        let transport = self.transports.connect(&host)?;

        let claim = SwitchLog::claim(
            host_id,
            switch_id.clone(),
            old.instance_id.clone(),
            to_instance_id.clone(),
            to_core,
            request.zero_downtime,
        );
        self.storage.claim_switch(&claim).await?;

        let mut machine = SwitchStateMachine::new();
        machine.transition(SwitchEvent::ClaimAcquired)?;
        info!(
            "[host {} switch {}] claimed: {} ({}) -> {} ({}), zero_downtime={}",
            host_id,
            switch_id,
            old.instance_id,
            old.core_type,
            to_instance_id,
            to_core,
            request.zero_downtime
        );

        let mut run = SwitchRun {
            host_id,
            switch_id,
            old,
            to_core,
            to_instance_id,
            zero_downtime: request.zero_downtime,
            requested_ports,
            snapshot: None,
            warnings: Vec::new(),
            old_released: false,
            old_record_removed: false,
            new_record: None,
            new_file_sent: false,
        };

        let driven = self
            .drive(
                &mut machine,
                &mut run,
                transport.as_ref(),
                request.config,
                &cancel,
            )
            .await;

        match driven {
            Ok(()) => {
                // Cutover already happened; a lost finalize must not report failure
                let storage = &self.storage;
                let switch_id = run.switch_id.as_str();
                let finalized = retry_with_backoff(
                    &self.config.reload_retry,
                    "switch finalize",
                    move || {
                        storage.finalize_switch(
                            host_id,
                            switch_id,
                            SwitchStatus::Succeeded,
                            None,
                            Utc::now(),
                        )
                    },
                )
                .await;
                if let Err(e) = finalized {
                    error!(
                        "[host {} switch {}] completed but could not be finalized: {}",
                        host_id, run.switch_id, e
                    );
                }
                info!("[host {} switch {}] completed", host_id, run.switch_id);
                Ok(SwitchOutcome {
                    switch_id: run.switch_id,
                    status: SwitchStatus::Succeeded,
                    from_instance_id: run.old.instance_id,
                    to_instance_id: run.to_instance_id,
                    to_core_type: to_core,
                    warnings: run.warnings,
                })
            }
            Err(trigger) => {
                let failed_in = machine.phase();
                machine.transition(SwitchEvent::Failure)?;
                warn!(
                    "[host {} switch {}] failed during {}: {}, rolling back",
                    host_id, run.switch_id, failed_in, trigger
                );

                let status = self.roll_back(&mut run, transport.as_ref()).await;
                machine.transition(SwitchEvent::RollbackDone)?;

                if let Err(e) = self
                    .storage
                    .finalize_switch(
                        host_id,
                        &run.switch_id,
                        status,
                        Some(trigger.to_string()),
                        Utc::now(),
                    )
                    .await
                {
                    error!(
                        "[host {} switch {}] could not finalize as {}: {}",
                        host_id,
                        run.switch_id,
                        status.as_str(),
                        e
                    );
                }
                info!(
                    "[host {} switch {}] finished as {}",
                    host_id,
                    run.switch_id,
                    status.as_str()
                );
                Err(trigger)
            }
        }
    }

    async fn drive(
        &self,
        machine: &mut SwitchStateMachine,
        run: &mut SwitchRun,
        transport: &dyn AgentTransport,
        config: Option<Value>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let old_id = run.old.instance_id.clone();
        self.ensure_ports_free(run.host_id, &run.requested_ports, &[old_id.as_str()])
            .await?;

        machine.transition(SwitchEvent::ProvisionStarted)?;
        self.provision(run, transport, config, cancel).await?;

        machine.transition(SwitchEvent::Provisioned)?;
        info!(
            "[host {} switch {}] verifying {}",
            run.host_id,
            run.switch_id,
            run.new_filename()
        );
        let filename = run.new_filename();
        cancellable(cancel, self.verify(transport, &filename)).await?;

        machine.transition(SwitchEvent::Verified)?;
        if !run.old_released {
            info!(
                "[host {} switch {}] cutover: releasing {}",
                run.host_id,
                run.switch_id,
                run.old.filename()
            );
            // A delete that lands but whose reload fails still counts as released
            run.old_released = true;
            self.remove_remote(transport, &run.old.filename()).await?;
        }

        machine.transition(SwitchEvent::OldReleased)?;
        if self
            .storage
            .delete_instance(run.host_id, &run.old.instance_id)
            .await?
        {
            run.old_record_removed = true;
        }
        if let Some(new) = run.new_record.as_mut() {
            new.active = true;
            new.updated_at = Utc::now();
            self.storage.update_instance(new).await?;
        }

        machine.transition(SwitchEvent::Finished)?;
        Ok(())
    }

    async fn provision(
        &self,
        run: &mut SwitchRun,
        transport: &dyn AgentTransport,
        config: Option<Value>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let old_filename = run.old.filename();
        let snapshot = cancellable(cancel, async {
            transport.get_config(&old_filename).await.map_err(Error::from)
        })
        .await?;

        let document = match config {
            Some(document) => document,
            None => {
                let source: Value = serde_json::from_slice(&snapshot)?;
                let conversion = self
                    .converters
                    .convert(run.old.core_type, run.to_core, &source)?;
                run.warnings = conversion.warnings;
                conversion.document
            }
        };
        run.snapshot = Some(snapshot);
        convert::validate(run.to_core, &document)?;

        let ports = if run.requested_ports.is_empty() {
            convert::listen_ports(run.to_core, &document)
        } else {
            run.requested_ports.clone()
        };
        let old_id = run.old.instance_id.clone();
        self.ensure_ports_free(run.host_id, &ports, &[old_id.as_str()])
            .await?;

        if !run.zero_downtime {
            info!(
                "[host {} switch {}] releasing {} before provisioning",
                run.host_id, run.switch_id, old_filename
            );
            run.old_released = true;
            cancellable(cancel, self.remove_remote(transport, &old_filename)).await?;
        }

        let mut new = CoreInstance::new(
            run.host_id,
            run.to_instance_id.clone(),
            run.to_core,
            InstanceConfig::Document { document },
            ports,
        );
        new.active = false;
        self.storage.insert_instance(&new).await?;
        run.new_record = Some(new.clone());

        info!(
            "[host {} switch {}] provisioning {}",
            run.host_id,
            run.switch_id,
            new.filename()
        );
        run.new_file_sent = true;
        cancellable(cancel, self.apply_instance(transport, &new)).await
    }

    /// Health, service state and presence of the new file, retried with
    /// backoff under the overall verification timeout.
    async fn verify(&self, transport: &dyn AgentTransport, filename: &str) -> Result<()> {
        let verify_retry = &self.config.verify_retry;
        let attempts = retry_with_backoff(verify_retry, "switch verification", move || async move {
            if !transport.health().await? {
                return Err(Error::verification("agent health check failed"));
            }
            if !transport.service_status().await?.running {
                return Err(Error::verification("core service is not running"));
            }
            let configs = transport.list_configs().await?;
            if !configs.iter().any(|c| c.filename == filename) {
                return Err(Error::verification(format!(
                    "{} is not present on the agent",
                    filename
                )));
            }
            Ok::<(), Error>(())
        });

        match tokio::time::timeout(self.config.verify_timeout, attempts).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e @ Error::VerificationFailed(_))) => Err(e),
            Ok(Err(e)) => Err(Error::verification(e.to_string())),
            Err(_) => Err(Error::verification(format!(
                "not verified within {:?}",
                self.config.verify_timeout
            ))),
        }
    }

    /// Undo whatever the switch managed to do. Never cancelled.
    async fn roll_back(&self, run: &mut SwitchRun, transport: &dyn AgentTransport) -> SwitchStatus {
        let tag = format!("[host {} switch {}]", run.host_id, run.switch_id);

        if run.new_file_sent {
            if let Err(e) = self.remove_remote(transport, &run.new_filename()).await {
                warn!("{} could not remove {} from agent: {}", tag, run.new_filename(), e);
            }
        }
        if run.new_record.take().is_some() {
            if let Err(e) = self
                .storage
                .delete_instance(run.host_id, &run.to_instance_id)
                .await
            {
                error!("{} could not delete instance {}: {}", tag, run.to_instance_id, e);
            }
        }
        if run.old_record_removed {
            if let Err(e) = self.storage.insert_instance(&run.old).await {
                error!("{} could not restore instance record {}: {}", tag, run.old.instance_id, e);
            }
        }

        if !run.old_released {
            return SwitchStatus::Failed;
        }

        let Some(snapshot) = run.snapshot.as_deref() else {
            return SwitchStatus::Failed;
        };
        match self
            .apply_document(transport, &run.old.filename(), snapshot)
            .await
        {
            Ok(()) => {
                info!("{} restored {}", tag, run.old.filename());
                SwitchStatus::RolledBack
            }
            Err(e) => {
                error!("{} could not restore {}: {}", tag, run.old.filename(), e);
                SwitchStatus::Failed
            }
        }
    }

    /// Finalizes switches left `in_progress` by a previous process, removing
    /// any inactive instance they had provisioned.
    pub async fn recover_abandoned_switches(&self) -> Result<usize> {
        let abandoned = self.storage.list_active_switches().await?;

        for claim in &abandoned {
            warn!(
                "[host {} switch {}] abandoned in progress, recovering",
                claim.host_id, claim.switch_id
            );

            let provisioned = self
                .storage
                .get_instance(claim.host_id, &claim.to_instance_id)
                .await?
                .filter(|instance| !instance.active);

            if let Some(instance) = provisioned {
                if let Some(host) = self.storage.get_host(claim.host_id).await? {
                    match self.transports.connect(&host) {
                        Ok(transport) => {
                            if let Err(e) = self
                                .remove_remote(transport.as_ref(), &instance.filename())
                                .await
                            {
                                warn!(
                                    "[host {} switch {}] could not remove {}: {}",
                                    claim.host_id,
                                    claim.switch_id,
                                    instance.filename(),
                                    e
                                );
                            }
                        }
                        Err(e) => warn!("Could not reach host {}: {}", claim.host_id, e),
                    }
                }
                self.storage
                    .delete_instance(claim.host_id, &instance.instance_id)
                    .await?;
            }

            self.storage
                .finalize_switch(
                    claim.host_id,
                    &claim.switch_id,
                    SwitchStatus::Failed,
                    Some("abandoned: control plane stopped before the switch finished".to_string()),
                    Utc::now(),
                )
                .await?;
        }

        if !abandoned.is_empty() {
            info!("Recovered {} abandoned switch(es)", abandoned.len());
        }
        Ok(abandoned.len())
    }
}

fn validate_switch_id(switch_id: &str) -> Result<()> {
    if switch_id.is_empty()
        || switch_id.len() > 64
        || !switch_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
    {
        return Err(Error::invalid_input(format!(
            "switch_id '{}' must be 1-64 characters of letters, digits, '-', '_' or '.'",
            switch_id
        )));
    }
    Ok(())
}
