//! Client for the admin API, used by the `fleetd` admin subcommands and by
//! peer servers running `fleetd join`.
//!
//! One HTTP/1 connection per request, driven by hyper directly.

use std::time::Duration;

use bytes::Bytes;
use http::{Method, Request};
use http_body_util::{BodyExt, Full};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::debug;

use fleet_events::{AgentRegistration, FailoverAssignments, ServerRegistration, ServerStatus};
use fleet_state::{ExecutionStatus, OperationMode, PartitionEvent, ServerEntry, ServerInfo};

use crate::handlers::{AgentRegistered, ApiResponse};

/// Errors talking to a fleet daemon.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("cannot reach fleetd at {endpoint}: {reason}")]
    Connect { endpoint: String, reason: String },

    #[error("request to {0} timed out")]
    Timeout(String),

    #[error("http error: {0}")]
    Http(String),

    /// The daemon answered with a non-2xx status.
    #[error("{message} (HTTP {status})")]
    Api { status: u16, message: String },

    #[error("json error: {0}")]
    Json(String),
}

pub type ClientResult<T> = Result<T, ClientError>;

/// Admin API client bound to one `host:port` endpoint.
#[derive(Debug, Clone)]
pub struct ApiClient {
    endpoint: String,
    timeout: Duration,
}

impl ApiClient {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            timeout: Duration::from_secs(30),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    // ── Cloud ──────────────────────────────────────────────────

    pub async fn status(&self) -> ClientResult<Vec<ServerStatus>> {
        self.get("/status").await
    }

    pub async fn repartition(&self, detail: &str) -> ClientResult<FailoverAssignments> {
        self.post("/repartition", &json!({ "detail": detail })).await
    }

    pub async fn events(&self, status: Option<ExecutionStatus>) -> ClientResult<Vec<PartitionEvent>> {
        match status {
            Some(status) => self.get(&format!("/events?status={status}")).await,
            None => self.get("/events").await,
        }
    }

    // ── Servers ────────────────────────────────────────────────

    pub async fn register_server(&self, registration: &ServerRegistration) -> ClientResult<ServerInfo> {
        self.post("/servers", registration).await
    }

    pub async fn delete_server(&self, name: &str) -> ClientResult<Value> {
        self.send(Method::DELETE, &format!("/servers/{}", segment(name)), None)
            .await
    }

    pub async fn heartbeat(&self, name: &str) -> ClientResult<Value> {
        self.post(&format!("/servers/{}/heartbeat", segment(name)), &json!({}))
            .await
    }

    pub async fn set_server_affinity(&self, name: &str, group: Option<String>) -> ClientResult<Value> {
        self.put(&format!("/servers/{}/affinity", segment(name)), &json!({ "group": group }))
            .await
    }

    pub async fn set_operation_mode(&self, names: &[String], mode: OperationMode) -> ClientResult<Value> {
        self.post("/operation-mode", &json!({ "mode": mode, "names": names }))
            .await
    }

    // ── Agents ─────────────────────────────────────────────────

    pub async fn register_agent(&self, registration: &AgentRegistration) -> ClientResult<AgentRegistered> {
        self.post("/agents", registration).await
    }

    pub async fn agent_connected(&self, agent: &str, server: &str) -> ClientResult<Value> {
        self.post(&format!("/agents/{}/connect", segment(agent)), &json!({ "server": server }))
            .await
    }

    pub async fn agent_shutdown(&self, agent: &str) -> ClientResult<Value> {
        self.post(&format!("/agents/{}/shutdown", segment(agent)), &json!({}))
            .await
    }

    pub async fn set_agent_affinity(&self, name: &str, group: Option<String>) -> ClientResult<Value> {
        self.put(&format!("/agents/{}/affinity", segment(name)), &json!({ "group": group }))
            .await
    }

    pub async fn failover_list(&self, agent: &str) -> ClientResult<Vec<ServerEntry>> {
        self.get(&format!("/agents/{}/failover-list", segment(agent)))
            .await
    }

    // ── Transport ──────────────────────────────────────────────

    async fn get<T: DeserializeOwned>(&self, path: &str) -> ClientResult<T> {
        self.send(Method::GET, path, None).await
    }

    async fn post<B: Serialize + ?Sized, T: DeserializeOwned>(&self, path: &str, body: &B) -> ClientResult<T> {
        let body = serde_json::to_vec(body).map_err(|e| ClientError::Json(e.to_string()))?;
        self.send(Method::POST, path, Some(body)).await
    }

    async fn put<B: Serialize + ?Sized, T: DeserializeOwned>(&self, path: &str, body: &B) -> ClientResult<T> {
        let body = serde_json::to_vec(body).map_err(|e| ClientError::Json(e.to_string()))?;
        self.send(Method::PUT, path, Some(body)).await
    }

    async fn send<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> ClientResult<T> {
        let uri = format!("http://{}/api/v1{path}", self.endpoint);
        match tokio::time::timeout(self.timeout, self.exchange(method, &uri, body)).await {
            Ok(result) => result,
            Err(_) => Err(ClientError::Timeout(uri)),
        }
    }

    async fn exchange<T: DeserializeOwned>(
        &self,
        method: Method,
        uri: &str,
        body: Option<Vec<u8>>,
    ) -> ClientResult<T> {
        let stream = tokio::net::TcpStream::connect(&self.endpoint)
            .await
            .map_err(|e| ClientError::Connect {
                endpoint: self.endpoint.clone(),
                reason: e.to_string(),
            })?;

        let io = TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| ClientError::Http(e.to_string()))?;

        // Drive the connection in the background.
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!(error = %e, "admin connection closed");
            }
        });

        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("host", &self.endpoint)
            .header("user-agent", concat!("fleetd/", env!("CARGO_PKG_VERSION")));
        if body.is_some() {
            builder = builder.header("content-type", "application/json");
        }
        let req = builder
            .body(Full::new(Bytes::from(body.unwrap_or_default())))
            .map_err(|e| ClientError::Http(e.to_string()))?;

        let resp = sender
            .send_request(req)
            .await
            .map_err(|e| ClientError::Http(e.to_string()))?;
        let status = resp.status();
        let bytes = resp
            .into_body()
            .collect()
            .await
            .map_err(|e| ClientError::Http(e.to_string()))?
            .to_bytes();

        if !status.is_success() {
            // Extractor rejections come back as plain text, not the envelope.
            let message = serde_json::from_slice::<ApiResponse<Value>>(&bytes)
                .ok()
                .and_then(|r| r.error)
                .unwrap_or_else(|| String::from_utf8_lossy(&bytes).trim().to_string());
            return Err(ClientError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let envelope: ApiResponse<T> =
            serde_json::from_slice(&bytes).map_err(|e| ClientError::Json(e.to_string()))?;
        match (envelope.success, envelope.data) {
            (true, Some(data)) => Ok(data),
            _ => Err(ClientError::Api {
                status: status.as_u16(),
                message: envelope.error.unwrap_or_else(|| "response carried no data".to_string()),
            }),
        }
    }
}

fn segment(name: &str) -> String {
    urlencoding::encode(name).into_owned()
}
