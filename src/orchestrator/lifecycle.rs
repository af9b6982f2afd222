use log::{info, warn};
use serde::Deserialize;
use serde_json::{Map, Value};

use super::{parse_ports, CoreOrchestrator};
use crate::convert;
use crate::error::{Error, Result};
use crate::transport::{AgentTransport, ApplyError};
use crate::types::instance::validate_instance_id;
use crate::types::{ConfigTemplate, CoreInstance, CoreType, HostId, InstanceConfig, TemplateId};

#[derive(Debug, Clone, Deserialize)]
pub struct CreateInstanceRequest {
    pub instance_id: String,
    pub core_type: String,
    #[serde(default)]
    pub template_id: Option<TemplateId>,
    #[serde(default)]
    pub variables: Map<String, Value>,
    #[serde(default)]
    pub config: Option<Value>,
    /// Overrides the ports derived from the configuration
    #[serde(default)]
    pub listen_ports: Option<Vec<i64>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TemplateDraft {
    pub name: String,
    pub core_type: String,
    pub document: Value,
}

impl CoreOrchestrator {
    pub async fn list_instances(&self, host_id: HostId) -> Result<Vec<CoreInstance>> {
        self.host(host_id).await?;
        self.storage.list_instances(host_id).await
    }

    pub async fn get_instance(&self, host_id: HostId, instance_id: &str) -> Result<CoreInstance> {
        self.host(host_id).await?;
        self.instance(host_id, instance_id).await
    }

    /// Persists the instance and applies it on the agent. The local record is
    /// removed again if the agent never accepts the configuration.
    pub async fn create_instance(
        &self,
        host_id: HostId,
        request: CreateInstanceRequest,
    ) -> Result<CoreInstance> {
        let core_type: CoreType = request.core_type.parse()?;
        validate_instance_id(&request.instance_id)?;
        let host = self.host(host_id).await?;

        let (config, derived_ports) = match (request.template_id, request.config) {
            (Some(_), Some(_)) => {
                return Err(Error::invalid_input(
                    "specify either template_id or config, not both",
                ))
            }
            (None, None) => {
                return Err(Error::invalid_input("either template_id or config is required"))
            }
            (None, Some(document)) => {
                convert::validate(core_type, &document)?;
                let ports = convert::listen_ports(core_type, &document);
                (InstanceConfig::Document { document }, ports)
            }
            (Some(template_id), None) => {
                let template = self.template(template_id).await?;
                if template.core_type != core_type {
                    return Err(Error::invalid_input(format!(
                        "template '{}' is for {}, not {}",
                        template.name, template.core_type, core_type
                    )));
                }
                let ports = convert::listen_ports(core_type, &template.document);
                (
                    InstanceConfig::Template {
                        template_id,
                        variables: request.variables,
                    },
                    ports,
                )
            }
        };

        let listen_ports = match request.listen_ports {
            Some(ports) => parse_ports(&ports)?,
            None => derived_ports,
        };

        if self
            .storage
            .get_instance(host_id, &request.instance_id)
            .await?
            .is_some()
        {
            return Err(Error::conflict(format!(
                "core instance '{}' already exists",
                request.instance_id
            )));
        }
        self.ensure_ports_free(host_id, &listen_ports, &[]).await?;

        let instance = CoreInstance::new(
            host_id,
            request.instance_id,
            core_type,
            config,
            listen_ports,
        );
        let transport = self.transports.connect(&host)?;
        self.storage.insert_instance(&instance).await?;

        let mut written = false;
        let applied = match self.send_instance(transport.as_ref(), &instance).await {
            Ok(outcome) => {
                written = outcome
                    .as_ref()
                    .err()
                    .map_or(true, ApplyError::may_have_written);
                self.settle_reload(transport.as_ref(), outcome).await
            }
            Err(e) => Err(e),
        };
        if let Err(e) = applied {
            warn!(
                "Applying core instance {} on host {} failed, discarding record: {}",
                instance.instance_id, host_id, e
            );
            if written {
                if let Err(cleanup) = self
                    .remove_remote(transport.as_ref(), &instance.filename())
                    .await
                {
                    warn!(
                        "Could not remove {} from host {}: {}",
                        instance.filename(),
                        host_id,
                        cleanup
                    );
                }
            }
            if let Err(cleanup) = self
                .storage
                .delete_instance(host_id, &instance.instance_id)
                .await
            {
                warn!(
                    "Could not discard core instance {}: {}",
                    instance.instance_id, cleanup
                );
            }
            return Err(e);
        }

        info!(
            "Created {} instance {} on host {} (ports {:?})",
            core_type, instance.instance_id, host_id, instance.listen_ports
        );
        Ok(instance)
    }

    /// Remote removal first; the local record only goes once the agent has
    /// dropped the file.
    pub async fn delete_instance(&self, host_id: HostId, instance_id: &str) -> Result<()> {
        let host = self.host(host_id).await?;
        let instance = self.instance(host_id, instance_id).await?;

        if let Some(active) = self.storage.get_active_switch(host_id).await? {
            if active.involves(instance_id) {
                return Err(Error::SwitchInProgress { host_id });
            }
        }

        let transport = self.transports.connect(&host)?;
        self.remove_remote(transport.as_ref(), &instance.filename())
            .await?;
        self.storage.delete_instance(host_id, instance_id).await?;

        info!("Deleted core instance {} on host {}", instance_id, host_id);
        Ok(())
    }

    pub async fn create_template(&self, draft: TemplateDraft) -> Result<ConfigTemplate> {
        let core_type: CoreType = draft.core_type.parse()?;
        let name = draft.name.trim();
        if name.is_empty() {
            return Err(Error::invalid_input("template name must not be empty"));
        }
        // Placeholders may stand in for any value, so only the shape is checked
        if !draft.document.is_object() {
            return Err(Error::invalid_input("template document must be a JSON object"));
        }

        let template = ConfigTemplate::new(name.to_string(), core_type, draft.document);
        self.storage.create_template(&template).await?;
        info!("Created {} config template '{}'", core_type, template.name);
        Ok(template)
    }

    pub async fn list_templates(&self) -> Result<Vec<ConfigTemplate>> {
        self.storage.list_templates().await
    }

    pub(super) async fn template(&self, id: TemplateId) -> Result<ConfigTemplate> {
        self.storage
            .get_template(id)
            .await?
            .ok_or_else(|| Error::not_found(format!("config template {}", id)))
    }

    pub(super) async fn apply_instance(
        &self,
        transport: &dyn AgentTransport,
        instance: &CoreInstance,
    ) -> Result<()> {
        let outcome = self.send_instance(transport, instance).await?;
        self.settle_reload(transport, outcome).await
    }

    /// Write and reload once; the outer error means nothing was sent.
    async fn send_instance(
        &self,
        transport: &dyn AgentTransport,
        instance: &CoreInstance,
    ) -> Result<std::result::Result<(), ApplyError>> {
        let filename = instance.filename();
        let outcome = match &instance.config {
            InstanceConfig::Document { document } => {
                let body = serde_json::to_vec_pretty(document)?;
                transport.apply_config(&filename, &body).await
            }
            InstanceConfig::Template {
                template_id,
                variables,
            } => {
                let template = self.template(*template_id).await?;
                transport
                    .apply_template(&filename, &template, variables)
                    .await
            }
        };
        Ok(outcome)
    }
}
