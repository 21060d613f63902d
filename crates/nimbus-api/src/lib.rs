//! nimbus-api — REST API for Nimbus.
//!
//! Provides axum route handlers for instance lifecycle, cluster health
//! and capacity, node administration, and user quotas.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | POST | `/api/v1/instances` | Create an instance |
//! | GET | `/api/v1/instances` | List instances (`?user_id=&status=`) |
//! | GET | `/api/v1/instances/{id}` | Get instance details |
//! | POST | `/api/v1/instances/{id}/stop` | Stop a running instance |
//! | POST | `/api/v1/instances/{id}/start` | Restart a stopped instance |
//! | DELETE | `/api/v1/instances/{id}` | Terminate an instance |
//! | GET | `/api/v1/cluster/health` | Probe the fleet, aggregate verdict |
//! | GET | `/api/v1/cluster/capacity` | Max shape + placeable options |
//! | GET | `/api/v1/cluster/resources` | Advisory utilization snapshot |
//! | GET | `/api/v1/nodes` | List nodes |
//! | POST | `/api/v1/nodes` | Register a node |
//! | GET | `/api/v1/nodes/{id}` | Get node details |
//! | DELETE | `/api/v1/nodes/{id}` | Remove a node |
//! | GET | `/api/v1/users/{id}/quota` | Quota limits + usage |
//! | PUT | `/api/v1/users/{id}/quota` | Set quota limits |
//! | GET | `/api/v1/users/{id}/billing` | Month-to-date usage and cost |

pub mod handlers;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use nimbus_billing::BillingService;
use nimbus_health::HealthMonitor;
use nimbus_manager::InstanceManager;
use nimbus_ports::PortAllocator;
use nimbus_quota::QuotaService;
use nimbus_registry::NodeRegistry;
use nimbus_scheduler::{CapacityScheduler, ResourceSnapshot};

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub manager: Arc<InstanceManager>,
    pub monitor: HealthMonitor,
    pub registry: NodeRegistry,
    pub quotas: Arc<QuotaService>,
    pub scheduler: CapacityScheduler,
    pub ports: Arc<PortAllocator>,
    pub billing: Arc<BillingService>,
    pub telemetry: Arc<dyn ResourceSnapshot>,
}

/// Build the complete API router.
pub fn build_router(state: ApiState) -> Router {
    let api_routes = Router::new()
        .route(
            "/instances",
            get(handlers::list_instances).post(handlers::create_instance),
        )
        .route(
            "/instances/{id}",
            get(handlers::get_instance).delete(handlers::terminate_instance),
        )
        .route("/instances/{id}/stop", post(handlers::stop_instance))
        .route("/instances/{id}/start", post(handlers::start_instance))
        .route("/cluster/health", get(handlers::cluster_health))
        .route("/cluster/capacity", get(handlers::cluster_capacity))
        .route("/cluster/resources", get(handlers::cluster_resources))
        .route("/nodes", get(handlers::list_nodes).post(handlers::add_node))
        .route(
            "/nodes/{id}",
            get(handlers::get_node).delete(handlers::remove_node),
        )
        .route(
            "/users/{id}/quota",
            get(handlers::get_quota).put(handlers::set_quota),
        )
        .route("/users/{id}/billing", get(handlers::get_billing))
        .with_state(state);

    Router::new().nest("/api/v1", api_routes)
}
