use async_trait::async_trait;
use reqwest::{RequestBuilder, Response, Url};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;

use super::{
    AgentTransport, ConfigFileInfo, InboundInfo, ServiceStatus, TemplateRequest, TransportError,
    TransportFactory,
};
use crate::error::{Error, Result};
use crate::types::AgentHost;

/// Bearer-authenticated client for one agent's control API.
#[derive(Debug, Clone)]
pub struct HttpAgentTransport {
    base_url: Url,
    token: String,
    client: reqwest::Client,
}

impl HttpAgentTransport {
    pub fn new(address: &str, token: String, timeout: Duration) -> Result<Self> {
        let base_url = Url::parse(address)
            .map_err(|e| Error::invalid_input(format!("invalid agent address '{}': {}", address, e)))?;
        if base_url.cannot_be_a_base() {
            return Err(Error::invalid_input(format!(
                "agent address '{}' cannot be used as a base URL",
                address
            )));
        }

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("corefleet/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| {
                Error::Transport(TransportError::Unreachable(format!(
                    "failed to build http client: {}",
                    e
                )))
            })?;

        Ok(Self {
            base_url,
            token,
            client,
        })
    }

    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        // cannot_be_a_base was rejected in new()
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    async fn send(&self, request: RequestBuilder) -> std::result::Result<Response, TransportError> {
        let response = request
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(classify)?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            log::warn!("Agent {} rejected request: {} {}", self.base_url, status, body);
            return Err(TransportError::Rejected { status, body });
        }

        Ok(response)
    }

    async fn read_json<T: DeserializeOwned>(
        &self,
        response: Response,
    ) -> std::result::Result<T, TransportError> {
        let status = response.status().as_u16();
        let bytes = response.bytes().await.map_err(classify)?;
        serde_json::from_slice(&bytes).map_err(|e| TransportError::Rejected {
            status,
            body: format!("malformed response: {}", e),
        })
    }
}

fn classify(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout(err.to_string())
    } else {
        TransportError::Unreachable(err.to_string())
    }
}

#[async_trait]
impl AgentTransport for HttpAgentTransport {
    async fn list_configs(&self) -> std::result::Result<Vec<ConfigFileInfo>, TransportError> {
        let url = self.url(&["api", "v1", "protocols"]);
        let response = self.send(self.client.get(url)).await?;
        self.read_json(response).await
    }

    async fn list_inbounds(&self) -> std::result::Result<Vec<InboundInfo>, TransportError> {
        let url = self.url(&["api", "v1", "protocols", "inbounds"]);
        let response = self.send(self.client.get(url)).await?;
        self.read_json(response).await
    }

    async fn get_config(&self, filename: &str) -> std::result::Result<Vec<u8>, TransportError> {
        let url = self.url(&["api", "v1", "protocols", filename]);
        let response = self.send(self.client.get(url)).await?;
        let bytes = response.bytes().await.map_err(classify)?;
        Ok(bytes.to_vec())
    }

    async fn write_config(
        &self,
        filename: &str,
        content: &[u8],
    ) -> std::result::Result<(), TransportError> {
        let url = self.url(&["api", "v1", "protocols", filename]);
        let request = self
            .client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(content.to_vec());
        self.send(request).await?;
        Ok(())
    }

    async fn write_template(
        &self,
        request: &TemplateRequest,
    ) -> std::result::Result<(), TransportError> {
        let url = self.url(&["api", "v1", "protocols", "template"]);
        self.send(self.client.post(url).json(request)).await?;
        Ok(())
    }

    async fn remove_config(&self, filename: &str) -> std::result::Result<(), TransportError> {
        let url = self.url(&["api", "v1", "protocols", filename]);
        self.send(self.client.delete(url)).await?;
        Ok(())
    }

    async fn service_status(&self) -> std::result::Result<ServiceStatus, TransportError> {
        let url = self.url(&["api", "v1", "service", "status"]);
        let response = self.send(self.client.get(url)).await?;
        self.read_json(response).await
    }

    async fn reload_service(&self) -> std::result::Result<(), TransportError> {
        let url = self.url(&["api", "v1", "service", "reload"]);
        self.send(self.client.post(url)).await?;
        Ok(())
    }

    async fn health(&self) -> std::result::Result<bool, TransportError> {
        let url = self.url(&["health"]);
        let response = self.client.get(url).send().await.map_err(classify)?;
        Ok(response.status().is_success())
    }
}

/// Builds one [`HttpAgentTransport`] per host from its address and token.
#[derive(Debug, Clone)]
pub struct HttpTransportFactory {
    timeout: Duration,
}

impl HttpTransportFactory {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl TransportFactory for HttpTransportFactory {
    fn connect(&self, host: &AgentHost) -> Result<Arc<dyn AgentTransport>> {
        let transport = HttpAgentTransport::new(&host.address, host.token.clone(), self.timeout)?;
        Ok(Arc::new(transport))
    }
}
