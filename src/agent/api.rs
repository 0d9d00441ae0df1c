//! Agent directive listener
//!
//! Three operations: place an allocation, query its local status, stop and
//! remove it. The payload of a placement is the allocation value the
//! executor dispatched, task definitions included.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    routing::post,
    Json, Router,
};
use serde_json::json;
use tower_http::trace::TraceLayer;

use crate::cluster::models::Allocation;

use super::supervisor::{SupervisorError, TaskSupervisor};

/// Shared state for the agent API.
#[derive(Clone)]
pub struct AgentState {
    pub supervisor: Arc<TaskSupervisor>,
}

/// Create the agent router.
pub fn create_agent_router(state: AgentState) -> Router {
    Router::new()
        .route("/allocations", post(place_allocation))
        .route(
            "/allocations/{id}",
            get(get_allocation).delete(stop_allocation),
        )
        .route("/health", get(health_check))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_check() -> impl IntoResponse {
    StatusCode::OK
}

async fn place_allocation(
    State(state): State<AgentState>,
    Json(allocation): Json<Allocation>,
) -> impl IntoResponse {
    let allocation_id = allocation.allocation_id.clone();
    match state.supervisor.place(allocation).await {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({
                "message": "Allocation accepted",
                "allocation_id": allocation_id,
            })),
        )
            .into_response(),
        Err(e @ SupervisorError::AlreadyPlaced(_)) => (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": e.to_string()})),
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": e.to_string()})),
        )
            .into_response(),
    }
}

async fn get_allocation(
    State(state): State<AgentState>,
    Path(allocation_id): Path<String>,
) -> impl IntoResponse {
    match state.supervisor.get(&allocation_id).await {
        Some(view) => (StatusCode::OK, Json(view)).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "Allocation not found"})),
        )
            .into_response(),
    }
}

async fn stop_allocation(
    State(state): State<AgentState>,
    Path(allocation_id): Path<String>,
) -> impl IntoResponse {
    match state.supervisor.stop(&allocation_id).await {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({
                "message": format!("Allocation {allocation_id} stopped and removed"),
            })),
        )
            .into_response(),
        Err(SupervisorError::NotFound(_)) => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "Allocation not found"})),
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": e.to_string()})),
        )
            .into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use serde_json::Value;
    use tower::ServiceExt;

    fn create_test_app() -> Router {
        create_agent_router(AgentState {
            supervisor: Arc::new(TaskSupervisor::new()),
        })
    }

    fn placement(allocation_id: &str, command: &str) -> Value {
        json!({
            "allocation_id": allocation_id,
            "job_id": "job-1",
            "node_id": "node-1",
            "task_group": {
                "name": "workers",
                "tasks": [{
                    "name": "worker",
                    "resources": {"cpu": 100, "memory": 64},
                    "config": {"command": command}
                }]
            },
            "status": "pending"
        })
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
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn test_health_check() {
        let app = create_test_app();
        let (status, _) = request(&app, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_unknown_allocation_is_404() {
        let app = create_test_app();
        let (status, _) = request(&app, "GET", "/allocations/ghost", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = request(&app, "DELETE", "/allocations/ghost", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_place_query_stop_roundtrip() {
        let app = create_test_app();

        let (status, body) = request(
            &app,
            "POST",
            "/allocations",
            Some(placement("a1", "sleep 30")),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["allocation_id"], "a1");

        let (status, body) = request(&app, "GET", "/allocations/a1", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "running");
        assert_eq!(body["tasks"]["worker"]["status"], "running");

        let (status, _) = request(&app, "DELETE", "/allocations/a1", None).await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = request(&app, "GET", "/allocations/a1", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_duplicate_placement_is_rejected() {
        let app = create_test_app();

        let (status, _) = request(
            &app,
            "POST",
            "/allocations",
            Some(placement("a1", "sleep 30")),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = request(
            &app,
            "POST",
            "/allocations",
            Some(placement("a1", "sleep 30")),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("already placed"));

        // Clean up the spawned process.
        let _ = request(&app, "DELETE", "/allocations/a1", None).await;
    }
}
