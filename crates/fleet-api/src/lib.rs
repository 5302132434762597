//! fleet-api: admin HTTP API for a fleet daemon.
//!
//! `fleetd run` owns the state database and serves these routes; every
//! other `fleetd` subcommand (and every peer server) talks to it through
//! [`client::ApiClient`] instead of opening the database itself.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/api/v1/status` | Cloud status summary |
//! | POST | `/api/v1/servers` | Register (or refresh) a server |
//! | DELETE | `/api/v1/servers/{name}` | Delete a server out of the cloud |
//! | POST | `/api/v1/servers/{name}/heartbeat` | Record a heartbeat |
//! | PUT | `/api/v1/servers/{name}/affinity` | Set a server's affinity group |
//! | POST | `/api/v1/operation-mode` | Set the mode of several servers |
//! | POST | `/api/v1/agents` | Register an agent, returning its list |
//! | POST | `/api/v1/agents/{name}/connect` | Record an agent connection |
//! | POST | `/api/v1/agents/{name}/shutdown` | Record an agent shutdown |
//! | PUT | `/api/v1/agents/{name}/affinity` | Set an agent's affinity group |
//! | GET | `/api/v1/agents/{name}/failover-list` | Stored failover list |
//! | POST | `/api/v1/repartition` | Fleet-wide MANUAL_REQUEST |
//! | GET | `/api/v1/events` | Partition events, `?status=` filter |

pub mod client;
pub mod handlers;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post, put};

use fleet_events::CloudManager;
use fleet_state::{EventLog, StateStore};

pub use client::{ApiClient, ClientError};
pub use handlers::ApiResponse;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub cloud: Arc<CloudManager>,
    pub events: Arc<dyn EventLog>,
}

impl ApiState {
    /// State over one store, sharing the caller's cloud manager.
    pub fn new(cloud: Arc<CloudManager>, store: StateStore) -> Self {
        Self {
            cloud,
            events: Arc::new(store),
        }
    }
}

/// Build the complete admin router.
pub fn build_router(state: ApiState) -> Router {
    let api_routes = Router::new()
        .route("/status", get(handlers::cloud_status))
        .route("/servers", post(handlers::register_server))
        .route("/servers/{name}", axum::routing::delete(handlers::delete_server))
        .route("/servers/{name}/heartbeat", post(handlers::heartbeat))
        .route("/servers/{name}/affinity", put(handlers::set_server_affinity))
        .route("/operation-mode", post(handlers::set_operation_mode))
        .route("/agents", post(handlers::register_agent))
        .route("/agents/{name}/connect", post(handlers::agent_connected))
        .route("/agents/{name}/shutdown", post(handlers::agent_shutdown))
        .route("/agents/{name}/affinity", put(handlers::set_agent_affinity))
        .route("/agents/{name}/failover-list", get(handlers::failover_list))
        .route("/repartition", post(handlers::repartition))
        .route("/events", get(handlers::list_events))
        .with_state(state);

    Router::new().nest("/api/v1", api_routes)
}
