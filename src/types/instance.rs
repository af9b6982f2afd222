use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{CoreType, HostId, TemplateId};
use crate::error::{Error, Result};

/// Where an instance's configuration comes from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum InstanceConfig {
    /// Explicit core configuration document
    Document { document: Value },
    /// Rendered agent-side from a stored template
    Template {
        template_id: TemplateId,
        #[serde(default)]
        variables: Map<String, Value>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoreInstance {
    pub host_id: HostId,
    pub instance_id: String,
    pub core_type: CoreType,
    pub config: InstanceConfig,
    pub listen_ports: Vec<u16>,
    /// The host's serving instance for its role. Switch targets stay
    /// inactive until the switch completes.
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CoreInstance {
    pub fn new(
        host_id: HostId,
        instance_id: String,
        core_type: CoreType,
        config: InstanceConfig,
        listen_ports: Vec<u16>,
    ) -> Self {
        let now = Utc::now();
        Self {
            host_id,
            instance_id,
            core_type,
            config,
            listen_ports,
            active: true,
            created_at: now,
            updated_at: now,
        }
    }

    /// Name of the configuration file this instance owns on the agent.
    pub fn filename(&self) -> String {
        instance_filename(self.core_type, &self.instance_id)
    }
}

pub fn instance_filename(core_type: CoreType, instance_id: &str) -> String {
    format!("{}-{}.json", core_type.as_str(), instance_id)
}

/// Instance ids end up in agent file names, so keep them path-safe.
pub fn validate_instance_id(instance_id: &str) -> Result<()> {
    if instance_id.is_empty() || instance_id.len() > 64 {
        return Err(Error::invalid_input(
            "instance_id must be between 1 and 64 characters",
        ));
    }
    if !instance_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(Error::invalid_input(format!(
            "instance_id '{}' may only contain letters, digits, '-' and '_'",
            instance_id
        )));
    }
    Ok(())
}

/// Reusable configuration rendered by the agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigTemplate {
    pub id: TemplateId,
    pub name: String,
    pub core_type: CoreType,
    pub document: Value,
    pub created_at: DateTime<Utc>,
}

impl ConfigTemplate {
    pub fn new(name: String, core_type: CoreType, document: Value) -> Self {
        Self {
            id: TemplateId::new_v4(),
            name,
            core_type,
            document,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_filename_includes_core_and_id() {
        let instance = CoreInstance::new(
            HostId::new_v4(),
            "main".to_string(),
            CoreType::SingBox,
            InstanceConfig::Document { document: json!({}) },
            vec![443],
        );
        assert_eq!(instance.filename(), "sing-box-main.json");
    }

    #[test]
    fn test_instance_id_validation() {
        assert!(validate_instance_id("edge_1-a").is_ok());
        assert!(validate_instance_id("").is_err());
        assert!(validate_instance_id("../etc/passwd").is_err());
        assert!(validate_instance_id(&"x".repeat(65)).is_err());
    }

    #[test]
    fn test_instance_config_tagging() {
        let config: InstanceConfig =
            serde_json::from_value(json!({"source": "document", "document": {"inbounds": []}}))
                .unwrap();
        assert!(matches!(config, InstanceConfig::Document { .. }));

        let template_id = TemplateId::new_v4();
        let config: InstanceConfig = serde_json::from_value(json!({
            "source": "template",
            "template_id": template_id,
        }))
        .unwrap();
        match config {
            InstanceConfig::Template {
                template_id: parsed,
                variables,
            } => {
                assert_eq!(parsed, template_id);
                assert!(variables.is_empty());
            }
            other => panic!("expected a template config, got {:?}", other),
        }
    }
}
