//! Control-plane HTTP surface
//!
//! JSON in, JSON out. 200 on success, 400 for bad input, 404 for unknown
//! entities, 500 for store failures. The test-only reset endpoint is
//! guarded by an API key from the environment.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use super::executor::Executor;
use super::models::{Heartbeat, JobSpec, JobStatus, Node, TemplateSpec};
use super::node_manager::NodeManager;
use super::resource_manager::ResourceManager;
use super::scheduler::Scheduler;
use super::transport::AgentTransport;

/// Environment variable holding the secret for `POST /test/clear-all`.
pub const TEST_API_KEY_ENV: &str = "RUDDER_TEST_API_KEY";

/// Shared state for the control-plane API.
#[derive(Clone)]
pub struct ControlPlaneState {
    pub node_manager: Arc<NodeManager>,
    pub scheduler: Scheduler,
    pub executor: Arc<Executor>,
    pub resource_manager: Arc<ResourceManager>,
    pub transport: Arc<AgentTransport>,
}

/// Create the control-plane router.
pub fn create_control_plane_router(state: ControlPlaneState) -> Router {
    Router::new()
        // Agent-facing
        .route("/register", post(register_node))
        .route("/heartbeat", post(handle_heartbeat))
        // Jobs
        .route("/jobs", get(get_all_jobs).post(submit_job))
        .route("/jobs/{id}", get(get_job).put(update_job).delete(stop_job))
        .route("/jobs/{id}/delete", post(delete_job))
        .route("/jobs/{id}/restart", post(restart_job))
        // Nodes
        .route("/nodes", get(get_nodes))
        // Templates
        .route("/templates", get(list_templates).post(create_template))
        .route(
            "/templates/{id}",
            get(get_template).put(update_template).delete(delete_template),
        )
        // Test-only reset
        .route("/test/clear-all", post(clear_all))
        // Health check
        .route("/health", get(health_check))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct MessageResponse {
    message: String,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

fn message(text: impl Into<String>) -> Json<MessageResponse> {
    Json(MessageResponse {
        message: text.into(),
    })
}

fn error_body(text: impl ToString) -> Json<ErrorResponse> {
    Json(ErrorResponse {
        error: text.to_string(),
    })
}

fn internal_error(e: impl std::fmt::Display) -> (StatusCode, Json<ErrorResponse>) {
    error!(error = %e, "internal error");
    (StatusCode::INTERNAL_SERVER_ERROR, error_body(e))
}

// ============================================================================
// Health
// ============================================================================

async fn health_check() -> impl IntoResponse {
    StatusCode::OK
}

// ============================================================================
// Agent-facing endpoints
// ============================================================================

async fn register_node(
    State(state): State<ControlPlaneState>,
    Json(node): Json<Node>,
) -> impl IntoResponse {
    if node.node_id.is_empty() || node.endpoint.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            error_body("node_id and endpoint are required"),
        )
            .into_response();
    }
    match state.node_manager.register_node(&node) {
        Ok(()) => {
            state.transport.register(&node.node_id, &node.endpoint);
            (StatusCode::OK, message("Node registered successfully")).into_response()
        }
        Err(e) => internal_error(e).into_response(),
    }
}

async fn handle_heartbeat(
    State(state): State<ControlPlaneState>,
    Json(heartbeat): Json<Heartbeat>,
) -> impl IntoResponse {
    match state.resource_manager.handle_heartbeat(&heartbeat) {
        Ok(()) => (StatusCode::OK, message("Heartbeat received")).into_response(),
        Err(e) => internal_error(e).into_response(),
    }
}

// ============================================================================
// Job endpoints
// ============================================================================

async fn submit_job(
    State(state): State<ControlPlaneState>,
    Json(mut spec): Json<JobSpec>,
) -> impl IntoResponse {
    // A submission may reference a stored template instead of carrying its
    // own task groups.
    if let Some(template_id) = spec.template_id.clone() {
        match state.node_manager.get_template(&template_id) {
            Ok(Some(template)) => {
                if spec.task_groups.is_empty() {
                    spec.task_groups = template.task_groups;
                }
                if spec.constraints.is_empty() {
                    spec.constraints = template.constraints;
                }
            }
            Ok(None) => {
                return (
                    StatusCode::NOT_FOUND,
                    error_body(format!("template '{template_id}' not found")),
                )
                    .into_response()
            }
            Err(e) => return internal_error(e).into_response(),
        }
    }

    if spec.task_groups.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            error_body("task_groups are required"),
        )
            .into_response();
    }

    // Submissions always create a fresh job; updates go through PUT.
    spec.job_id = None;
    match state.scheduler.create_evaluation(spec, None) {
        Ok((job_id, evaluation_id)) => {
            info!(%job_id, %evaluation_id, "job submitted");
            (
                StatusCode::OK,
                Json(json!({
                    "job_id": job_id,
                    "evaluation_id": evaluation_id,
                    "message": "evaluation enqueued",
                })),
            )
                .into_response()
        }
        Err(e) => internal_error(e).into_response(),
    }
}

async fn update_job(
    State(state): State<ControlPlaneState>,
    Path(job_id): Path<String>,
    Json(spec): Json<JobSpec>,
) -> impl IntoResponse {
    match state.node_manager.get_job(&job_id) {
        Ok(Some(_)) => {}
        Ok(None) => {
            return (StatusCode::NOT_FOUND, error_body("job not found")).into_response()
        }
        Err(e) => return internal_error(e).into_response(),
    }
    if spec.task_groups.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            error_body("task_groups are required"),
        )
            .into_response();
    }

    match state.scheduler.create_evaluation(spec, Some(job_id)) {
        Ok((job_id, evaluation_id)) => (
            StatusCode::OK,
            Json(json!({
                "job_id": job_id,
                "evaluation_id": evaluation_id,
                "message": "update evaluation enqueued",
            })),
        )
            .into_response(),
        Err(e) => internal_error(e).into_response(),
    }
}

async fn stop_job(
    State(state): State<ControlPlaneState>,
    Path(job_id): Path<String>,
) -> impl IntoResponse {
    match state.node_manager.get_job(&job_id) {
        Ok(Some(_)) => {}
        Ok(None) => {
            return (StatusCode::NOT_FOUND, error_body("job not found")).into_response()
        }
        Err(e) => return internal_error(e).into_response(),
    }
    match state.executor.stop_job(&job_id).await {
        Ok(()) => (StatusCode::OK, message(format!("job {job_id} stopped"))).into_response(),
        Err(e) => internal_error(e).into_response(),
    }
}

async fn delete_job(
    State(state): State<ControlPlaneState>,
    Path(job_id): Path<String>,
) -> impl IntoResponse {
    match state.node_manager.get_job(&job_id) {
        Ok(Some(_)) => {}
        Ok(None) => {
            return (StatusCode::NOT_FOUND, error_body("job not found")).into_response()
        }
        Err(e) => return internal_error(e).into_response(),
    }
    match state.executor.delete_job(&job_id).await {
        Ok(()) => (StatusCode::OK, message(format!("job {job_id} deleted"))).into_response(),
        Err(e) => internal_error(e).into_response(),
    }
}

async fn restart_job(
    State(state): State<ControlPlaneState>,
    Path(job_id): Path<String>,
) -> impl IntoResponse {
    let job = match state.node_manager.get_job(&job_id) {
        Ok(Some(job)) => job,
        Ok(None) => {
            return (StatusCode::NOT_FOUND, error_body("job not found")).into_response()
        }
        Err(e) => return internal_error(e).into_response(),
    };
    if job.status != JobStatus::Dead {
        return (
            StatusCode::BAD_REQUEST,
            error_body("only dead jobs can be restarted"),
        )
            .into_response();
    }

    if let Err(e) = state
        .node_manager
        .set_job_status(&job_id, JobStatus::Pending)
    {
        return internal_error(e).into_response();
    }

    let spec = JobSpec {
        job_id: Some(job_id.clone()),
        task_groups: job.task_groups,
        constraints: job.constraints,
        template_id: None,
    };
    match state.scheduler.create_evaluation(spec, Some(job_id)) {
        Ok((job_id, evaluation_id)) => (
            StatusCode::OK,
            Json(json!({
                "job_id": job_id,
                "evaluation_id": evaluation_id,
                "message": "restart evaluation enqueued",
            })),
        )
            .into_response(),
        Err(e) => internal_error(e).into_response(),
    }
}

async fn get_all_jobs(State(state): State<ControlPlaneState>) -> impl IntoResponse {
    match state.node_manager.get_all_jobs() {
        Ok(jobs) => (
            StatusCode::OK,
            Json(json!({"count": jobs.len(), "jobs": jobs})),
        )
            .into_response(),
        Err(e) => internal_error(e).into_response(),
    }
}

async fn get_job(
    State(state): State<ControlPlaneState>,
    Path(job_id): Path<String>,
) -> impl IntoResponse {
    match state.node_manager.get_job_info(&job_id) {
        Ok(Some(detail)) => (StatusCode::OK, Json(detail)).into_response(),
        Ok(None) => (StatusCode::NOT_FOUND, error_body("job not found")).into_response(),
        Err(e) => internal_error(e).into_response(),
    }
}

// ============================================================================
// Node endpoints
// ============================================================================

async fn get_nodes(State(state): State<ControlPlaneState>) -> impl IntoResponse {
    match state.node_manager.get_nodes_with_allocations() {
        Ok(nodes) => (
            StatusCode::OK,
            Json(json!({"count": nodes.len(), "nodes": nodes})),
        )
            .into_response(),
        Err(e) => internal_error(e).into_response(),
    }
}

// ============================================================================
// Template endpoints
// ============================================================================

async fn create_template(
    State(state): State<ControlPlaneState>,
    Json(spec): Json<TemplateSpec>,
) -> impl IntoResponse {
    if spec.name.is_empty() || spec.task_groups.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            error_body("name and task_groups are required"),
        )
            .into_response();
    }
    match state.node_manager.create_template(&spec) {
        Ok(template) => (StatusCode::OK, Json(template)).into_response(),
        Err(e) => internal_error(e).into_response(),
    }
}

async fn list_templates(State(state): State<ControlPlaneState>) -> impl IntoResponse {
    match state.node_manager.list_templates() {
        Ok(templates) => (
            StatusCode::OK,
            Json(json!({"count": templates.len(), "templates": templates})),
        )
            .into_response(),
        Err(e) => internal_error(e).into_response(),
    }
}

async fn get_template(
    State(state): State<ControlPlaneState>,
    Path(template_id): Path<String>,
) -> impl IntoResponse {
    match state.node_manager.get_template(&template_id) {
        Ok(Some(template)) => (StatusCode::OK, Json(template)).into_response(),
        Ok(None) => (StatusCode::NOT_FOUND, error_body("template not found")).into_response(),
        Err(e) => internal_error(e).into_response(),
    }
}

async fn update_template(
    State(state): State<ControlPlaneState>,
    Path(template_id): Path<String>,
    Json(spec): Json<TemplateSpec>,
) -> impl IntoResponse {
    match state.node_manager.update_template(&template_id, &spec) {
        Ok(true) => (StatusCode::OK, message("template updated")).into_response(),
        Ok(false) => (StatusCode::NOT_FOUND, error_body("template not found")).into_response(),
        Err(e) => internal_error(e).into_response(),
    }
}

async fn delete_template(
    State(state): State<ControlPlaneState>,
    Path(template_id): Path<String>,
) -> impl IntoResponse {
    match state.node_manager.delete_template(&template_id) {
        Ok(true) => (StatusCode::OK, message("template deleted")).into_response(),
        Ok(false) => (StatusCode::NOT_FOUND, error_body("template not found")).into_response(),
        Err(e) => internal_error(e).into_response(),
    }
}

// ============================================================================
// Test-only reset
// ============================================================================

async fn clear_all(
    State(state): State<ControlPlaneState>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let Ok(secret) = std::env::var(TEST_API_KEY_ENV) else {
        return (
            StatusCode::UNAUTHORIZED,
            error_body("test reset is disabled"),
        )
            .into_response();
    };
    let provided = headers.get("x-api-key").and_then(|v| v.to_str().ok());
    if provided != Some(secret.as_str()) {
        return (StatusCode::UNAUTHORIZED, error_body("invalid api key")).into_response();
    }

    match state.node_manager.clear_all() {
        Ok(()) => {
            state.transport.clear_cache();
            info!("all cluster data cleared");
            (StatusCode::OK, message("all data cleared")).into_response()
        }
        Err(e) => internal_error(e).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::executor::spawn_executor;
    use crate::cluster::resource_manager::ResourceManagerConfig;
    use crate::cluster::scheduler::spawn_scheduler;
    use crate::store::Store;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use serde_json::Value;
    use tokio::sync::mpsc;
    use tower::ServiceExt;

    /// Keeps the scratch database and worker shutdown handles alive for
    /// the duration of a test.
    struct TestHarness {
        _dir: tempfile::TempDir,
        _shutdowns: Vec<tokio::sync::watch::Sender<bool>>,
    }

    fn create_test_state() -> (ControlPlaneState, TestHarness) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("test.db")).unwrap();
        let node_manager = Arc::new(NodeManager::new(store));
        let transport = Arc::new(AgentTransport::new(node_manager.clone()));
        let executor = Arc::new(Executor::new(node_manager.clone(), transport.clone()));
        let (plan_tx, plan_rx) = mpsc::unbounded_channel();
        let executor_shutdown = spawn_executor(executor.clone(), plan_rx);
        let (scheduler, scheduler_shutdown) = spawn_scheduler(node_manager.clone(), plan_tx);
        let resource_manager = Arc::new(ResourceManager::new(
            node_manager.clone(),
            ResourceManagerConfig::default(),
        ));
        (
            ControlPlaneState {
                node_manager,
                scheduler,
                executor,
                resource_manager,
                transport,
            },
            TestHarness {
                _dir: dir,
                _shutdowns: vec![executor_shutdown, scheduler_shutdown],
            },
        )
    }

    fn create_test_app() -> (Router, TestHarness) {
        let (state, harness) = create_test_state();
        (create_control_plane_router(state), harness)
    }

    async fn request(
        app: &Router,
        method: &str,
        uri: &str,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(json) => {
                builder = builder.header("content-type", "application/json");
                builder.body(Body::from(json.to_string())).unwrap()
            }
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, value)
    }

    fn node_json(node_id: &str) -> Value {
        json!({
            "node_id": node_id,
            "ip_address": "10.0.0.1",
            "resources": {"cpu": 1000, "memory": 4096, "cpu_used": 0, "memory_used": 0},
            "healthy": true,
            "endpoint": "http://10.0.0.1:8501"
        })
    }

    fn job_json() -> Value {
        json!({
            "task_groups": [{
                "name": "web",
                "tasks": [{
                    "name": "nginx",
                    "resources": {"cpu": 300, "memory": 512},
                    "config": {"image": "nginx:latest", "port": 80}
                }]
            }],
            "constraints": {"region": "us-west"}
        })
    }

    #[tokio::test]
    async fn test_health_check() {
        let (app, _harness) = create_test_app();
        let (status, _) = request(&app, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_register_and_list_nodes() {
        let (app, _harness) = create_test_app();

        let (status, _) = request(&app, "POST", "/register", Some(node_json("n1"))).await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = request(&app, "GET", "/nodes", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["count"], 1);
        assert_eq!(body["nodes"][0]["node_id"], "n1");
        assert_eq!(body["nodes"][0]["healthy"], true);
    }

    #[tokio::test]
    async fn test_submit_job_returns_ids() {
        let (app, _harness) = create_test_app();
        request(&app, "POST", "/register", Some(node_json("n1"))).await;

        let (status, body) = request(&app, "POST", "/jobs", Some(job_json())).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["job_id"].is_string());
        assert!(body["evaluation_id"].is_string());
    }

    #[tokio::test]
    async fn test_submit_job_without_groups_is_rejected() {
        let (app, _harness) = create_test_app();
        let (status, _) = request(&app, "POST", "/jobs", Some(json!({"task_groups": []}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_update_unknown_job_is_404() {
        let (app, _harness) = create_test_app();
        let (status, _) = request(&app, "PUT", "/jobs/ghost", Some(job_json())).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_stop_unknown_job_is_404() {
        let (app, _harness) = create_test_app();
        let (status, _) = request(&app, "DELETE", "/jobs/ghost", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_get_job_roundtrip() {
        let (app, _harness) = create_test_app();
        request(&app, "POST", "/register", Some(node_json("n1"))).await;
        let (_, body) = request(&app, "POST", "/jobs", Some(job_json())).await;
        let job_id = body["job_id"].as_str().unwrap();

        let (status, body) = request(&app, "GET", &format!("/jobs/{job_id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["job_id"], job_id);
        assert_eq!(body["task_groups"][0]["name"], "web");

        let (status, body) = request(&app, "GET", "/jobs", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["count"], 1);
    }

    #[tokio::test]
    async fn test_restart_requires_dead_job() {
        let (app, _harness) = create_test_app();
        request(&app, "POST", "/register", Some(node_json("n1"))).await;
        let (_, body) = request(&app, "POST", "/jobs", Some(job_json())).await;
        let job_id = body["job_id"].as_str().unwrap().to_string();

        // Still pending: restart refused.
        let (status, _) = request(&app, "POST", &format!("/jobs/{job_id}/restart"), None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        // Stop it, then restart succeeds.
        let (status, _) = request(&app, "DELETE", &format!("/jobs/{job_id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        let (status, body) =
            request(&app, "POST", &format!("/jobs/{job_id}/restart"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["job_id"], job_id);
    }

    #[tokio::test]
    async fn test_delete_job_removes_rows() {
        let (app, _harness) = create_test_app();
        request(&app, "POST", "/register", Some(node_json("n1"))).await;
        let (_, body) = request(&app, "POST", "/jobs", Some(job_json())).await;
        let job_id = body["job_id"].as_str().unwrap().to_string();

        let (status, _) = request(&app, "POST", &format!("/jobs/{job_id}/delete"), None).await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = request(&app, "GET", &format!("/jobs/{job_id}"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_heartbeat_endpoint() {
        let (app, _harness) = create_test_app();
        request(&app, "POST", "/register", Some(node_json("n1"))).await;

        let heartbeat = json!({
            "node_id": "n1",
            "resources": {"cpu": 900, "memory": 4000, "cpu_used": 100, "memory_used": 96},
            "healthy": true,
            "timestamp": crate::cluster::models::now_ts(),
            "allocations": {}
        });
        let (status, _) = request(&app, "POST", "/heartbeat", Some(heartbeat)).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_template_crud_and_submit_from_template() {
        let (app, _harness) = create_test_app();
        request(&app, "POST", "/register", Some(node_json("n1"))).await;

        let template = json!({
            "name": "web",
            "description": "standard web stack",
            "task_groups": job_json()["task_groups"],
        });
        let (status, body) = request(&app, "POST", "/templates", Some(template)).await;
        assert_eq!(status, StatusCode::OK);
        let template_id = body["template_id"].as_str().unwrap().to_string();

        let (status, body) = request(&app, "GET", "/templates", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["count"], 1);

        let (status, body) = request(
            &app,
            "POST",
            "/jobs",
            Some(json!({"template_id": template_id})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["job_id"].is_string());

        let (status, _) =
            request(&app, "DELETE", &format!("/templates/{template_id}"), None).await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = request(
            &app,
            "POST",
            "/jobs",
            Some(json!({"template_id": template_id})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_clear_all_requires_api_key() {
        let (app, _harness) = create_test_app();
        std::env::set_var(TEST_API_KEY_ENV, "sekrit");

        let (status, _) = request(&app, "POST", "/test/clear-all", None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let authed = Request::builder()
            .method("POST")
            .uri("/test/clear-all")
            .header("x-api-key", "sekrit")
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(authed).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        std::env::remove_var(TEST_API_KEY_ENV);
    }
}
