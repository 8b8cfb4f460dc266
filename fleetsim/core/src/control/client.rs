use std::time::{Duration, SystemTime};

use fleetsim_configs::{CommandKind, NodeSpec};
use reqwest::Client;
use thiserror::Error;

use crate::protocol::{
    CommandsResponse, HealthReport, HeartbeatRequest, InjectedFailure, IssueCommandRequest,
    ListNodesResponse, NodeCommand, NodeInfo, RegisterNodeRequest, unix_millis,
};

const READY_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("control plane request failed")]
    Transport(#[from] reqwest::Error),
    #[error("control plane rejected {operation} ({status}): {message}")]
    Rejected {
        operation: &'static str,
        status: u16,
        message: String,
    },
    #[error("control plane not reachable after {attempts} attempts")]
    NotReady { attempts: usize },
}

/// JSON-over-HTTP client for the control-plane API.
#[derive(Clone, Debug)]
pub struct ControlPlaneClient {
    base_url: String,
    http: Client,
}

impl ControlPlaneClient {
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            http: Client::new(),
        }
    }

    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Polls the list endpoint until the server answers.
    pub async fn wait_ready(&self, attempts: usize) -> Result<(), ClientError> {
        for _ in 0..attempts {
            if self.list_nodes().await.is_ok() {
                return Ok(());
            }
            tokio::time::sleep(READY_POLL_INTERVAL).await;
        }
        Err(ClientError::NotReady { attempts })
    }

    pub async fn register_node(&self, spec: &NodeSpec) -> Result<NodeInfo, ClientError> {
        let response = self
            .http
            .post(format!("{}/api/v1/nodes", self.base_url))
            .json(&RegisterNodeRequest { spec: spec.clone() })
            .send()
            .await?;
        decode("register_node", response).await
    }

    pub async fn send_heartbeat(&self, id: &str) -> Result<(), ClientError> {
        let response = self
            .http
            .post(format!("{}/api/v1/nodes/{id}/heartbeat", self.base_url))
            .json(&HeartbeatRequest {
                timestamp_ms: unix_millis(SystemTime::now()),
            })
            .send()
            .await?;
        expect_success("send_heartbeat", response).await
    }

    pub async fn report_health(
        &self,
        id: &str,
        failures: &[InjectedFailure],
    ) -> Result<NodeInfo, ClientError> {
        let response = self
            .http
            .post(format!("{}/api/v1/nodes/{id}/health", self.base_url))
            .json(&HealthReport {
                failures: failures.to_vec(),
                reported_at_ms: unix_millis(SystemTime::now()),
            })
            .send()
            .await?;
        decode("report_health", response).await
    }

    pub async fn get_node(&self, id: &str) -> Result<NodeInfo, ClientError> {
        let response = self
            .http
            .get(format!("{}/api/v1/nodes/{id}", self.base_url))
            .send()
            .await?;
        decode("get_node", response).await
    }

    pub async fn list_nodes(&self) -> Result<Vec<NodeInfo>, ClientError> {
        let response = self
            .http
            .get(format!("{}/api/v1/nodes", self.base_url))
            .send()
            .await?;
        let listed: ListNodesResponse = decode("list_nodes", response).await?;
        Ok(listed.nodes)
    }

    pub async fn issue_command(
        &self,
        id: &str,
        command: CommandKind,
        reason: impl Into<String>,
    ) -> Result<NodeCommand, ClientError> {
        let response = self
            .http
            .post(format!("{}/api/v1/nodes/{id}/commands", self.base_url))
            .json(&IssueCommandRequest {
                command,
                reason: reason.into(),
            })
            .send()
            .await?;
        decode("issue_command", response).await
    }

    pub async fn get_node_commands(&self, id: &str) -> Result<Vec<NodeCommand>, ClientError> {
        let response = self
            .http
            .get(format!("{}/api/v1/nodes/{id}/commands", self.base_url))
            .send()
            .await?;
        let commands: CommandsResponse = decode("get_node_commands", response).await?;
        Ok(commands.commands)
    }
}

async fn decode<T: serde::de::DeserializeOwned>(
    operation: &'static str,
    response: reqwest::Response,
) -> Result<T, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response.json().await?);
    }
    let message = response.text().await.unwrap_or_default();
    Err(ClientError::Rejected {
        operation,
        status: status.as_u16(),
        message,
    })
}

async fn expect_success(
    operation: &'static str,
    response: reqwest::Response,
) -> Result<(), ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    let message = response.text().await.unwrap_or_default();
    Err(ClientError::Rejected {
        operation,
        status: status.as_u16(),
        message,
    })
}
