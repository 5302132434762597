//! One-shot admin commands. Each sends one request to the running daemon's
//! admin API and prints the outcome as JSON on stdout.

use tracing::info;

use fleet_api::ApiClient;
use fleet_core::FleetConfig;
use fleet_events::{AgentRegistration, ServerRegistration};
use fleet_state::{ExecutionStatus, OperationMode};

pub fn client(config: &FleetConfig) -> ApiClient {
    ApiClient::new(config.api.client_endpoint())
}

fn print(value: &impl serde::Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub async fn server_register(client: &ApiClient, registration: ServerRegistration) -> anyhow::Result<()> {
    print(&client.register_server(&registration).await?)
}

pub async fn server_delete(client: &ApiClient, name: &str) -> anyhow::Result<()> {
    print(&client.delete_server(name).await?)
}

pub async fn server_mode(client: &ApiClient, names: &[String], mode: OperationMode) -> anyhow::Result<()> {
    print(&client.set_operation_mode(names, mode).await?)
}

pub async fn server_heartbeat(client: &ApiClient, name: &str) -> anyhow::Result<()> {
    print(&client.heartbeat(name).await?)
}

pub async fn server_affinity(client: &ApiClient, name: &str, group: Option<String>) -> anyhow::Result<()> {
    print(&client.set_server_affinity(name, group).await?)
}

pub async fn agent_register(client: &ApiClient, registration: AgentRegistration) -> anyhow::Result<()> {
    print(&client.register_agent(&registration).await?)
}

pub async fn agent_connect(client: &ApiClient, agent: &str, server: &str) -> anyhow::Result<()> {
    print(&client.agent_connected(agent, server).await?)
}

pub async fn agent_shutdown(client: &ApiClient, agent: &str) -> anyhow::Result<()> {
    print(&client.agent_shutdown(agent).await?)
}

pub async fn agent_affinity(client: &ApiClient, name: &str, group: Option<String>) -> anyhow::Result<()> {
    print(&client.set_agent_affinity(name, group).await?)
}

pub async fn repartition(client: &ApiClient, detail: &str) -> anyhow::Result<()> {
    let assignments = client.repartition(detail).await?;
    info!(agents = assignments.len(), "manual repartition complete");
    print(&assignments)
}

pub async fn list(client: &ApiClient, agent: &str) -> anyhow::Result<()> {
    print(&client.failover_list(agent).await?)
}

pub async fn status(client: &ApiClient) -> anyhow::Result<()> {
    print(&client.status().await?)
}

pub async fn events(client: &ApiClient, status: Option<ExecutionStatus>) -> anyhow::Result<()> {
    print(&client.events(status).await?)
}
