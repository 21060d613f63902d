//! REST API handlers.
//!
//! Each handler delegates to the orchestration services and maps their
//! typed errors onto HTTP status codes with a structured error body
//! `{code, message, detail}`.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use nimbus_health::HealthError;
use nimbus_manager::{CreateRequest, ManagerError};
use nimbus_quota::QuotaError;
use nimbus_registry::RegistryError;
use nimbus_scheduler::{SchedulerError, DEFAULT_CPU_STEPS, DEFAULT_MEMORY_STEPS};
use nimbus_state::{InstanceStatus, NodeRecord, NodeRole, QuotaRecord};

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(serde::Serialize)]
struct ApiResponse<T: serde::Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<ApiErrorBody>,
}

#[derive(serde::Serialize)]
struct ApiErrorBody {
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<serde_json::Value>,
}

impl<T: serde::Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(
    status: StatusCode,
    code: &'static str,
    message: String,
    detail: Option<serde_json::Value>,
) -> impl IntoResponse {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(ApiErrorBody {
                code,
                message,
                detail,
            }),
        }),
    )
}

/// Map a manager error onto status code + error body.
fn manager_error(e: ManagerError) -> axum::response::Response {
    let message = e.to_string();
    let (status, code, detail) = match &e {
        ManagerError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found", None),
        ManagerError::InvalidTransition { from, .. } => (
            StatusCode::CONFLICT,
            "invalid_transition",
            Some(json!({ "current_status": from })),
        ),
        ManagerError::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "invalid_request", None),
        ManagerError::Quota(QuotaError::Exceeded { failed, .. }) => (
            StatusCode::CONFLICT,
            "quota_exceeded",
            Some(json!({ "dimensions": failed })),
        ),
        ManagerError::Scheduler(SchedulerError::InsufficientCapacity {
            requested_cpu,
            requested_memory,
            max_cpu_available,
            max_memory_available,
        }) => (
            StatusCode::CONFLICT,
            "insufficient_capacity",
            Some(json!({
                "requested_cpu": requested_cpu,
                "requested_memory": requested_memory,
                "max_cpu_available": max_cpu_available,
                "max_memory_available": max_memory_available,
            })),
        ),
        ManagerError::Port(_) => (StatusCode::CONFLICT, "port_exhausted", None),
        ManagerError::RuntimeFailure { .. } => (StatusCode::BAD_GATEWAY, "runtime_failure", None),
        ManagerError::Quota(QuotaError::State(_))
        | ManagerError::Scheduler(SchedulerError::State(_))
        | ManagerError::State(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal", None),
    };
    error_response(status, code, message, detail).into_response()
}

fn registry_error(e: RegistryError) -> axum::response::Response {
    let message = e.to_string();
    let (status, code) = match &e {
        RegistryError::NodeNotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
        RegistryError::DuplicateNode(_) => (StatusCode::CONFLICT, "duplicate_node"),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
    };
    error_response(status, code, message, None).into_response()
}

fn internal(message: String) -> axum::response::Response {
    error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal", message, None).into_response()
}

// ── Instances ──────────────────────────────────────────────────

/// Acting-user scope for single-instance operations. Absent means an
/// operator call with no ownership check.
#[derive(Deserialize, Default)]
pub struct ActorQuery {
    pub user_id: Option<String>,
}

#[derive(Deserialize, Default)]
pub struct ListQuery {
    pub user_id: Option<String>,
    pub status: Option<InstanceStatus>,
}

/// POST /api/v1/instances
pub async fn create_instance(
    State(state): State<ApiState>,
    Json(request): Json<CreateRequest>,
) -> impl IntoResponse {
    match state.manager.create(request).await {
        Ok(instance) => (StatusCode::CREATED, ApiResponse::ok(instance)).into_response(),
        Err(e) => manager_error(e),
    }
}

/// GET /api/v1/instances
pub async fn list_instances(
    State(state): State<ApiState>,
    Query(query): Query<ListQuery>,
) -> impl IntoResponse {
    match state.manager.list(query.user_id.as_deref(), query.status) {
        Ok(instances) => ApiResponse::ok(instances).into_response(),
        Err(e) => manager_error(e),
    }
}

/// GET /api/v1/instances/{id}
pub async fn get_instance(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Query(actor): Query<ActorQuery>,
) -> impl IntoResponse {
    match state.manager.get(actor.user_id.as_deref(), &id) {
        Ok(instance) => ApiResponse::ok(instance).into_response(),
        Err(e) => manager_error(e),
    }
}

/// POST /api/v1/instances/{id}/stop
pub async fn stop_instance(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Query(actor): Query<ActorQuery>,
) -> impl IntoResponse {
    match state.manager.stop(actor.user_id.as_deref(), &id).await {
        Ok(instance) => ApiResponse::ok(instance).into_response(),
        Err(e) => manager_error(e),
    }
}

/// POST /api/v1/instances/{id}/start
pub async fn start_instance(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Query(actor): Query<ActorQuery>,
) -> impl IntoResponse {
    match state.manager.start(actor.user_id.as_deref(), &id).await {
        Ok(instance) => ApiResponse::ok(instance).into_response(),
        Err(e) => manager_error(e),
    }
}

/// DELETE /api/v1/instances/{id}
pub async fn terminate_instance(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Query(actor): Query<ActorQuery>,
) -> impl IntoResponse {
    match state.manager.terminate(actor.user_id.as_deref(), &id).await {
        Ok(instance) => ApiResponse::ok(instance).into_response(),
        Err(e) => manager_error(e),
    }
}

// ── Cluster ────────────────────────────────────────────────────

/// GET /api/v1/cluster/health
///
/// Probes the whole fleet before answering, so the verdict is current.
pub async fn cluster_health(State(state): State<ApiState>) -> impl IntoResponse {
    match state.monitor.cluster_view(true).await {
        Ok(view) => ApiResponse::ok(view).into_response(),
        Err(HealthError::NoNodes) => error_response(
            StatusCode::NOT_FOUND,
            "no_nodes",
            "no nodes registered".to_string(),
            None,
        )
        .into_response(),
        Err(e) => internal(e.to_string()),
    }
}

/// GET /api/v1/cluster/capacity
pub async fn cluster_capacity(State(state): State<ApiState>) -> impl IntoResponse {
    let max = match state.scheduler.max_capacity() {
        Ok(max) => max,
        Err(e) => return internal(e.to_string()),
    };
    let options = match state
        .scheduler
        .capacity_options(&DEFAULT_CPU_STEPS, &DEFAULT_MEMORY_STEPS)
    {
        Ok(options) => options,
        Err(e) => return internal(e.to_string()),
    };
    let fleet = match state.scheduler.fleet_capacity() {
        Ok(fleet) => fleet,
        Err(e) => return internal(e.to_string()),
    };

    ApiResponse::ok(json!({
        "max_cpu_available": max.0,
        "max_memory_available": max.1,
        "options": options,
        "fleet": fleet,
    }))
    .into_response()
}

/// GET /api/v1/cluster/resources
///
/// Advisory utilization passthrough; an empty list means no telemetry
/// source is configured.
pub async fn cluster_resources(State(state): State<ApiState>) -> impl IntoResponse {
    let usage = state.telemetry.sample().await;
    ApiResponse::ok(usage).into_response()
}

// ── Nodes ──────────────────────────────────────────────────────

/// Body for POST /api/v1/nodes.
#[derive(Deserialize)]
pub struct AddNodeRequest {
    pub id: String,
    pub hostname: String,
    pub address: String,
    #[serde(default = "default_role")]
    pub role: NodeRole,
    pub cpu_cores: u32,
    pub memory_gb: u32,
    #[serde(default)]
    pub tags: Vec<String>,
}

fn default_role() -> NodeRole {
    NodeRole::Worker
}

/// GET /api/v1/nodes
pub async fn list_nodes(State(state): State<ApiState>) -> impl IntoResponse {
    match state.registry.list() {
        Ok(nodes) => ApiResponse::ok(nodes).into_response(),
        Err(e) => registry_error(e),
    }
}

/// GET /api/v1/nodes/{id}
pub async fn get_node(State(state): State<ApiState>, Path(id): Path<String>) -> impl IntoResponse {
    match state.registry.get(&id) {
        Ok(node) => ApiResponse::ok(node).into_response(),
        Err(e) => registry_error(e),
    }
}

/// POST /api/v1/nodes
pub async fn add_node(
    State(state): State<ApiState>,
    Json(request): Json<AddNodeRequest>,
) -> impl IntoResponse {
    let mut node = NodeRecord::new(
        request.id,
        request.hostname,
        request.address,
        request.role,
        request.cpu_cores,
        request.memory_gb,
    );
    node.tags = request.tags;

    match state.registry.add(node.clone()) {
        Ok(()) => (StatusCode::CREATED, ApiResponse::ok(node)).into_response(),
        Err(e) => registry_error(e),
    }
}

/// DELETE /api/v1/nodes/{id}
///
/// Removing a node also drops its port reservations; any instances
/// still recorded against it keep their records but cannot restart.
pub async fn remove_node(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.registry.remove(&id) {
        Ok(()) => {
            let dropped_ports = state.ports.forget_node(&id).await;
            ApiResponse::ok(json!({ "removed": id, "dropped_ports": dropped_ports }))
                .into_response()
        }
        Err(e) => registry_error(e),
    }
}

// ── Quotas ─────────────────────────────────────────────────────

/// Body for PUT /api/v1/users/{id}/quota.
#[derive(Deserialize)]
pub struct SetQuotaRequest {
    pub max_instances: u32,
    pub max_cpu: u32,
    pub max_memory: u32,
}

/// GET /api/v1/users/{id}/quota
pub async fn get_quota(State(state): State<ApiState>, Path(id): Path<String>) -> impl IntoResponse {
    match state.quotas.view(&id).await {
        Ok(view) => ApiResponse::ok(view).into_response(),
        Err(e) => internal(e.to_string()),
    }
}

/// PUT /api/v1/users/{id}/quota
pub async fn set_quota(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(request): Json<SetQuotaRequest>,
) -> impl IntoResponse {
    let record = QuotaRecord::new(
        id,
        request.max_instances,
        request.max_cpu,
        request.max_memory,
    );
    match state.quotas.set_limits(&record) {
        Ok(()) => ApiResponse::ok(record).into_response(),
        Err(e) => internal(e.to_string()),
    }
}

// ── Billing ────────────────────────────────────────────────────

/// GET /api/v1/users/{id}/billing
pub async fn get_billing(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.billing.summary(&id).await {
        Ok(summary) => ApiResponse::ok(summary).into_response(),
        Err(e) => internal(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build_router;
    use nimbus_billing::{BillingService, Pricing};
    use nimbus_health::{HealthMonitor, MonitorConfig, TcpPinger};
    use nimbus_manager::{InstanceManager, ManagerConfig, NoopRuntime};
    use nimbus_ports::{PortAllocator, PortRange};
    use nimbus_quota::{DefaultLimits, QuotaService};
    use nimbus_registry::NodeRegistry;
    use nimbus_scheduler::{CapacityScheduler, NoTelemetry};
    use nimbus_state::{NodeHealth, StateStore};
    use std::sync::Arc;
    use std::time::Duration;

    fn test_state() -> ApiState {
        let store = StateStore::open_in_memory().unwrap();
        let registry = NodeRegistry::new(store.clone());
        let scheduler = CapacityScheduler::new(store.clone());
        let ports = Arc::new(PortAllocator::new(PortRange::default()));
        let quotas = Arc::new(QuotaService::new(store.clone(), DefaultLimits::default()));
        let monitor = HealthMonitor::new(
            registry.clone(),
            Arc::new(TcpPinger::default()),
            MonitorConfig {
                interval: Duration::from_secs(30),
                probe_timeout: Duration::from_millis(200),
                ..MonitorConfig::default()
            },
        );
        let billing = Arc::new(BillingService::new(store.clone(), Pricing::default()));
        let manager = Arc::new(InstanceManager::new(
            store,
            scheduler.clone(),
            Arc::clone(&ports),
            Arc::clone(&quotas),
            Arc::new(NoopRuntime),
            ManagerConfig::default(),
        ));
        ApiState {
            manager,
            monitor,
            registry,
            quotas,
            scheduler,
            ports,
            billing,
            telemetry: Arc::new(NoTelemetry),
        }
    }

    fn seed_worker(state: &ApiState, id: &str) {
        let mut node = NodeRecord::new(id, format!("{id}.fleet"), "127.0.0.1", NodeRole::Worker, 16, 32);
        node.is_online = true;
        node.health = NodeHealth::Healthy;
        state.registry.add(node).unwrap();
    }

    fn create_body(user: &str, name: &str) -> Json<CreateRequest> {
        Json(CreateRequest {
            user_id: user.to_string(),
            name: name.to_string(),
            image: "ubuntu:22.04".to_string(),
            cpu: 2,
            memory: 4,
        })
    }

    fn actor(user: &str) -> Query<ActorQuery> {
        Query(ActorQuery {
            user_id: Some(user.to_string()),
        })
    }

    #[tokio::test]
    async fn create_instance_returns_created() {
        let state = test_state();
        seed_worker(&state, "w-1");

        let resp = create_instance(State(state), create_body("alice", "web"))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::CREATED);
    }

    #[tokio::test]
    async fn create_without_capacity_is_conflict() {
        let state = test_state();
        // No nodes registered at all.
        let resp = create_instance(State(state), create_body("alice", "web"))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn quota_exhaustion_is_conflict() {
        let state = test_state();
        seed_worker(&state, "w-1");
        seed_worker(&state, "w-2");

        // Default cpu quota is 16; 2 cpu per instance, but only 5
        // instances allowed.
        for i in 0..5 {
            let resp = create_instance(
                State(state.clone()),
                create_body("alice", &format!("web-{i}")),
            )
            .await
            .into_response();
            assert_eq!(resp.status(), StatusCode::CREATED);
        }

        let resp = create_instance(State(state), create_body("alice", "web-5"))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn get_unknown_instance_is_not_found() {
        let state = test_state();
        let resp = get_instance(
            State(state),
            Path("nope".to_string()),
            Query(ActorQuery::default()),
        )
        .await
        .into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn foreign_user_sees_not_found() {
        let state = test_state();
        seed_worker(&state, "w-1");

        let created = state
            .manager
            .create(CreateRequest {
                user_id: "alice".to_string(),
                name: "web".to_string(),
                image: "ubuntu:22.04".to_string(),
                cpu: 2,
                memory: 4,
            })
            .await
            .unwrap();

        let resp = get_instance(State(state), Path(created.id), actor("bob"))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn stop_a_stopped_instance_is_conflict() {
        let state = test_state();
        seed_worker(&state, "w-1");
        let created = state
            .manager
            .create(CreateRequest {
                user_id: "alice".to_string(),
                name: "web".to_string(),
                image: "ubuntu:22.04".to_string(),
                cpu: 2,
                memory: 4,
            })
            .await
            .unwrap();
        state.manager.stop(Some("alice"), &created.id).await.unwrap();

        let resp = stop_instance(State(state), Path(created.id), actor("alice"))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn terminate_twice_is_ok() {
        let state = test_state();
        seed_worker(&state, "w-1");
        let created = state
            .manager
            .create(CreateRequest {
                user_id: "alice".to_string(),
                name: "web".to_string(),
                image: "ubuntu:22.04".to_string(),
                cpu: 2,
                memory: 4,
            })
            .await
            .unwrap();

        for _ in 0..2 {
            let resp = terminate_instance(
                State(state.clone()),
                Path(created.id.clone()),
                actor("alice"),
            )
            .await
            .into_response();
            assert_eq!(resp.status(), StatusCode::OK);
        }
    }

    #[tokio::test]
    async fn cluster_health_without_nodes_is_not_found() {
        let state = test_state();
        let resp = cluster_health(State(state)).await.into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn cluster_capacity_reports_options() {
        let state = test_state();
        seed_worker(&state, "w-1");
        let resp = cluster_capacity(State(state)).await.into_response();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn cluster_resources_defaults_to_empty() {
        let state = test_state();
        let resp = cluster_resources(State(state)).await.into_response();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn node_crud_round_trip() {
        let state = test_state();

        let body = AddNodeRequest {
            id: "w-1".to_string(),
            hostname: "w-1.fleet".to_string(),
            address: "100.64.0.1".to_string(),
            role: NodeRole::Worker,
            cpu_cores: 8,
            memory_gb: 32,
            tags: vec!["gpu".to_string()],
        };
        let resp = add_node(State(state.clone()), Json(body)).await.into_response();
        assert_eq!(resp.status(), StatusCode::CREATED);

        let resp = get_node(State(state.clone()), Path("w-1".to_string()))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = remove_node(State(state.clone()), Path("w-1".to_string()))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = get_node(State(state), Path("w-1".to_string()))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn quota_get_and_set() {
        let state = test_state();

        let resp = get_quota(State(state.clone()), Path("alice".to_string()))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = set_quota(
            State(state.clone()),
            Path("alice".to_string()),
            Json(SetQuotaRequest {
                max_instances: 10,
                max_cpu: 32,
                max_memory: 64,
            }),
        )
        .await
        .into_response();
        assert_eq!(resp.status(), StatusCode::OK);

        let view = state.quotas.view("alice").await.unwrap();
        assert_eq!(view.max_instances, 10);
    }

    #[tokio::test]
    async fn billing_summary_is_ok_even_for_unbilled_users() {
        let state = test_state();

        let resp = get_billing(State(state.clone()), Path("alice".to_string()))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::OK);

        state.billing.record_usage("alice", 4, 8, 2.0).await.unwrap();
        let summary = state.billing.summary("alice").await.unwrap();
        assert_eq!(summary.usage.cpu_hours, 8.0);
    }

    #[tokio::test]
    async fn router_builds() {
        let _router = build_router(test_state());
    }
}
