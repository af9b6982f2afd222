#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Notify, Semaphore};

use corefleet::convert::ConverterRegistry;
use corefleet::orchestrator::{CoreOrchestrator, OrchestratorConfig};
use corefleet::retry::RetryConfig;
use corefleet::storage::{InMemoryStore, Storage};
use corefleet::transport::{
    AgentTransport, ConfigFileInfo, InboundInfo, ServiceStatus, TemplateRequest, TransportError,
    TransportFactory,
};
use corefleet::types::{AgentHost, CoreInstance, CoreType, InstanceConfig};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Get(String),
    Write(String),
    Template(String),
    Remove(String),
    Reload,
    Status,
    Health,
    List,
}

#[derive(Debug, Default)]
pub struct Faults {
    /// Writes to these filenames are rejected
    pub reject_writes: HashSet<String>,
    /// Number of upcoming reloads that fail
    pub failing_reloads: u32,
    pub unhealthy: bool,
    pub stopped: bool,
    /// `list_configs` reports nothing
    pub hide_files: bool,
    /// Moved into `failing_reloads` by the next removal
    pub reloads_fail_after_remove: u32,
}

/// In-process agent that keeps files in memory and records every call.
#[derive(Default)]
pub struct MockAgent {
    files: Mutex<BTreeMap<String, Vec<u8>>>,
    calls: Mutex<Vec<Call>>,
    pub faults: Mutex<Faults>,
    write_gate: Mutex<Option<Arc<Semaphore>>>,
    /// Signalled when a write reaches the agent
    pub write_started: Notify,
}

impl MockAgent {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn put_file(&self, filename: &str, document: &Value) {
        self.files
            .lock()
            .unwrap()
            .insert(filename.to_string(), serde_json::to_vec(document).unwrap());
    }

    pub fn file(&self, filename: &str) -> Option<Value> {
        self.files
            .lock()
            .unwrap()
            .get(filename)
            .map(|bytes| serde_json::from_slice(bytes).unwrap())
    }

    pub fn filenames(&self) -> Vec<String> {
        self.files.lock().unwrap().keys().cloned().collect()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn position(&self, call: &Call) -> Option<usize> {
        self.calls().iter().position(|c| c == call)
    }

    /// Hold every write until `release_writes` is called.
    pub fn hold_writes(&self) {
        *self.write_gate.lock().unwrap() = Some(Arc::new(Semaphore::new(0)));
    }

    pub fn release_writes(&self) {
        if let Some(gate) = self.write_gate.lock().unwrap().take() {
            gate.add_permits(Semaphore::MAX_PERMITS);
        }
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    async fn store(&self, filename: &str, content: Vec<u8>) -> Result<(), TransportError> {
        self.write_started.notify_one();
        let gate = self.write_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            let _permit = gate.acquire().await.unwrap();
        }
        if self.faults.lock().unwrap().reject_writes.contains(filename) {
            return Err(TransportError::Rejected {
                status: 422,
                body: format!("cannot write {}", filename),
            });
        }
        self.files
            .lock()
            .unwrap()
            .insert(filename.to_string(), content);
        Ok(())
    }
}

#[async_trait]
impl AgentTransport for MockAgent {
    async fn list_configs(&self) -> Result<Vec<ConfigFileInfo>, TransportError> {
        self.record(Call::List);
        if self.faults.lock().unwrap().hide_files {
            return Ok(vec![]);
        }
        Ok(self
            .files
            .lock()
            .unwrap()
            .iter()
            .map(|(name, body)| ConfigFileInfo {
                filename: name.clone(),
                modified_at: Utc::now(),
                size: body.len() as u64,
                hash: format!("{:x}", body.len()),
            })
            .collect())
    }

    async fn list_inbounds(&self) -> Result<Vec<InboundInfo>, TransportError> {
        Ok(vec![])
    }

    async fn get_config(&self, filename: &str) -> Result<Vec<u8>, TransportError> {
        self.record(Call::Get(filename.to_string()));
        self.files
            .lock()
            .unwrap()
            .get(filename)
            .cloned()
            .ok_or_else(|| TransportError::Rejected {
                status: 404,
                body: format!("{} not found", filename),
            })
    }

    async fn write_config(&self, filename: &str, content: &[u8]) -> Result<(), TransportError> {
        self.record(Call::Write(filename.to_string()));
        self.store(filename, content.to_vec()).await
    }

    async fn write_template(&self, request: &TemplateRequest) -> Result<(), TransportError> {
        self.record(Call::Template(request.filename.clone()));
        let rendered = serde_json::to_vec(&request.content).unwrap();
        self.store(&request.filename, rendered).await
    }

    async fn remove_config(&self, filename: &str) -> Result<(), TransportError> {
        self.record(Call::Remove(filename.to_string()));
        self.files.lock().unwrap().remove(filename);
        let mut faults = self.faults.lock().unwrap();
        let armed = std::mem::take(&mut faults.reloads_fail_after_remove);
        faults.failing_reloads += armed;
        Ok(())
    }

    async fn service_status(&self) -> Result<ServiceStatus, TransportError> {
        self.record(Call::Status);
        Ok(ServiceStatus {
            running: !self.faults.lock().unwrap().stopped,
        })
    }

    async fn reload_service(&self) -> Result<(), TransportError> {
        self.record(Call::Reload);
        let mut faults = self.faults.lock().unwrap();
        if faults.failing_reloads > 0 {
            faults.failing_reloads -= 1;
            return Err(TransportError::Rejected {
                status: 500,
                body: "reload failed".to_string(),
            });
        }
        Ok(())
    }

    async fn health(&self) -> Result<bool, TransportError> {
        self.record(Call::Health);
        Ok(!self.faults.lock().unwrap().unhealthy)
    }
}

pub struct MockFactory {
    pub agent: Arc<MockAgent>,
}

impl TransportFactory for MockFactory {
    fn connect(&self, _host: &AgentHost) -> corefleet::Result<Arc<dyn AgentTransport>> {
        let transport: Arc<dyn AgentTransport> = self.agent.clone();
        Ok(transport)
    }
}

pub struct Harness {
    pub storage: Arc<InMemoryStore>,
    pub agent: Arc<MockAgent>,
    pub orchestrator: CoreOrchestrator,
    pub host: AgentHost,
}

pub fn fast_config() -> OrchestratorConfig {
    let quick = RetryConfig {
        max_attempts: 3,
        initial_delay: Duration::from_millis(5),
        max_delay: Duration::from_millis(20),
        backoff_multiplier: 2.0,
    };
    OrchestratorConfig {
        verify_timeout: Duration::from_secs(2),
        verify_retry: quick.clone(),
        reload_retry: quick,
    }
}

pub async fn harness() -> Harness {
    let storage = Arc::new(InMemoryStore::new());
    let agent = MockAgent::new();
    let host = AgentHost::new("edge-1".to_string(), "http://10.0.0.1:9527".to_string());
    storage.create_host(&host).await.unwrap();

    let orchestrator = CoreOrchestrator::new(
        storage.clone(),
        Arc::new(MockFactory {
            agent: agent.clone(),
        }),
        Arc::new(ConverterRegistry::new()),
        fast_config(),
    );

    Harness {
        storage,
        agent,
        orchestrator,
        host,
    }
}

pub fn xray_document(port: u16) -> Value {
    serde_json::json!({
        "log": {"loglevel": "warning"},
        "inbounds": [{
            "tag": "vless-in",
            "protocol": "vless",
            "listen": "0.0.0.0",
            "port": port,
            "settings": {"clients": [{"id": "6f1b8c1e-0000-4000-8000-000000000001"}]},
        }],
        "outbounds": [{"tag": "direct", "protocol": "freedom"}],
    })
}

impl Harness {
    /// An instance that is already live on the agent.
    pub async fn seed_instance(&self, instance_id: &str, core: CoreType, document: Value) -> CoreInstance {
        let ports = corefleet::convert::listen_ports(core, &document);
        let instance = CoreInstance::new(
            self.host.id,
            instance_id.to_string(),
            core,
            InstanceConfig::Document {
                document: document.clone(),
            },
            ports,
        );
        self.storage.insert_instance(&instance).await.unwrap();
        self.agent.put_file(&instance.filename(), &document);
        instance
    }
}
