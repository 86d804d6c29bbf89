//! HTTP surface: the `/dts/api` task routes.
//!
//! The request payloads keep wire compatibility with the original service:
//! the host field is spelled `domin` and the port travels as a string.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::error::DtsError;
use crate::service::DtsService;
use crate::task::{Endpoint, TableRef, Task};

/// Build the router over a shared service handle.
pub fn router(service: Arc<DtsService>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/dts/api/tasks", post(create_task).get(list_tasks))
        .route(
            "/dts/api/tasks/:task_id",
            get(task_status).delete(delete_task),
        )
        .route("/dts/api/tasks/:task_id/status", get(task_status))
        .route("/dts/api/tasks/:task_id/start", post(start_task))
        .route("/dts/api/tasks/:task_id/stop", post(stop_task))
        .route("/dts/api/tasks/:task_id/pause", post(pause_task))
        .route("/dts/api/tasks/:task_id/resume", post(resume_task))
        .route("/dts/api/tasks/:task_id/switch", post(switch_task))
        .layer(TraceLayer::new_for_http())
        // request-scoped deadline; workers never inherit it
        .layer(TimeoutLayer::new(std::time::Duration::from_secs(15)))
        .with_state(service)
}

/// Connection half of a create request. `domin` is not a typo here: the
/// wire format predates this implementation.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionInfo {
    pub domin: String,
    pub port: String,
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub database: String,
}

impl ConnectionInfo {
    /// Port defaults to 5432, database to the user name.
    pub fn into_endpoint(self) -> Endpoint {
        let port = self.port.trim().parse().unwrap_or(5432);
        let database = if self.database.is_empty() {
            self.username.clone()
        } else {
            self.database
        };
        Endpoint {
            host: self.domin,
            port,
            user: self.username,
            password: self.password,
            database,
            ssl_mode: "disable".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateTaskRequest {
    pub task_id: String,
    #[serde(default)]
    pub database_type: Option<String>,
    pub source: ConnectionInfo,
    pub dest: ConnectionInfo,
    #[serde(default)]
    pub tables: Vec<String>,
    #[serde(default)]
    pub table_suffix: String,
}

#[derive(Debug, Serialize)]
struct ApiResponse {
    state: &'static str,
    message: String,
}

impl ApiResponse {
    fn ok(message: impl Into<String>) -> (StatusCode, Json<ApiResponse>) {
        (
            StatusCode::OK,
            Json(ApiResponse {
                state: "OK",
                message: message.into(),
            }),
        )
    }

    fn error(status: StatusCode, message: impl Into<String>) -> (StatusCode, Json<ApiResponse>) {
        (
            status,
            Json(ApiResponse {
                state: "ERROR",
                message: message.into(),
            }),
        )
    }
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    state: &'static str,
    message: String,
    stage: &'static str,
    duration: i64,
    delay: i64,
}

fn status_for(err: &DtsError) -> StatusCode {
    match err {
        DtsError::NotFound(_) => StatusCode::NOT_FOUND,
        e if e.is_client_error() => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(err: DtsError) -> Response {
    if matches!(err, DtsError::Db(_) | DtsError::Pool { .. }) {
        warn!(error = %err, "request failed");
    }
    ApiResponse::error(status_for(&err), err.to_string()).into_response()
}

async fn healthz() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

/// POST /dts/api/tasks — create the task and start it.
async fn create_task(
    State(service): State<Arc<DtsService>>,
    body: axum::body::Bytes,
) -> Response {
    // Decode by hand so malformed bodies are a 400, not a 422.
    let req: CreateTaskRequest = match serde_json::from_slice(&body) {
        Ok(req) => req,
        Err(e) => {
            return ApiResponse::error(
                StatusCode::BAD_REQUEST,
                format!("invalid request body: {e}"),
            )
            .into_response();
        }
    };

    if let Some(ref db_type) = req.database_type {
        if db_type != "postgresql" {
            return ApiResponse::error(
                StatusCode::BAD_REQUEST,
                format!("unsupported database_type '{db_type}'"),
            )
            .into_response();
        }
    }

    let mut tables = Vec::with_capacity(req.tables.len());
    for name in &req.tables {
        match name.parse::<TableRef>() {
            Ok(table) => tables.push(table),
            Err(e) => {
                return ApiResponse::error(StatusCode::BAD_REQUEST, e.to_string())
                    .into_response();
            }
        }
    }

    let task = Task::new(
        req.task_id,
        req.source.into_endpoint(),
        req.dest.into_endpoint(),
        tables,
        req.table_suffix,
    );

    match service.create(task).await {
        Ok(()) => ApiResponse::ok("task created and started").into_response(),
        Err(e) => error_response(e),
    }
}

/// GET /dts/api/tasks — most recent tasks.
async fn list_tasks(State(service): State<Arc<DtsService>>) -> Response {
    match service.list(100, 0).await {
        Ok(tasks) => {
            let ids: Vec<serde_json::Value> = tasks
                .iter()
                .map(|t| {
                    serde_json::json!({
                        "task_id": t.task_id,
                        "state": t.state.as_str(),
                        "progress": t.progress,
                        "created_at": t.created_at,
                    })
                })
                .collect();
            Json(serde_json::json!({ "state": "OK", "message": "", "tasks": ids }))
                .into_response()
        }
        Err(e) => error_response(e),
    }
}

/// GET /dts/api/tasks/:task_id[/status]
async fn task_status(
    State(service): State<Arc<DtsService>>,
    Path(task_id): Path<String>,
) -> Response {
    match service.status(&task_id).await {
        Ok(status) => (
            StatusCode::OK,
            Json(StatusResponse {
                state: "OK",
                message: status.last_error,
                stage: status.stage.as_str(),
                duration: status.duration_ms,
                delay: status.delay_ms,
            }),
        )
            .into_response(),
        Err(e) => (
            status_for(&e),
            Json(StatusResponse {
                state: "ERROR",
                message: e.to_string(),
                stage: "none",
                duration: -1,
                delay: -1,
            }),
        )
            .into_response(),
    }
}

async fn start_task(
    State(service): State<Arc<DtsService>>,
    Path(task_id): Path<String>,
) -> Response {
    match service.start(&task_id).await {
        Ok(()) => ApiResponse::ok("task started").into_response(),
        Err(e) => error_response(e),
    }
}

async fn stop_task(
    State(service): State<Arc<DtsService>>,
    Path(task_id): Path<String>,
) -> Response {
    match service.stop(&task_id).await {
        Ok(()) => ApiResponse::ok("task stopped").into_response(),
        Err(e) => error_response(e),
    }
}

async fn pause_task(
    State(service): State<Arc<DtsService>>,
    Path(task_id): Path<String>,
) -> Response {
    match service.pause(&task_id).await {
        Ok(()) => ApiResponse::ok("task paused").into_response(),
        Err(e) => error_response(e),
    }
}

async fn resume_task(
    State(service): State<Arc<DtsService>>,
    Path(task_id): Path<String>,
) -> Response {
    match service.resume(&task_id).await {
        Ok(()) => ApiResponse::ok("task resumed").into_response(),
        Err(e) => error_response(e),
    }
}

async fn switch_task(
    State(service): State<Arc<DtsService>>,
    Path(task_id): Path<String>,
) -> Response {
    match service.switch(&task_id).await {
        Ok(()) => ApiResponse::ok("switchover triggered").into_response(),
        Err(e) => error_response(e),
    }
}

async fn delete_task(
    State(service): State<Arc<DtsService>>,
    Path(task_id): Path<String>,
) -> Response {
    match service.delete(&task_id).await {
        Ok(()) => ApiResponse::ok("task deleted").into_response(),
        Err(e) => error_response(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_info_defaults() {
        let info = ConnectionInfo {
            domin: "db.example.com".into(),
            port: "".into(),
            username: "app".into(),
            password: "pw".into(),
            database: "".into(),
        };
        let ep = info.into_endpoint();
        assert_eq!(ep.host, "db.example.com");
        assert_eq!(ep.port, 5432);
        assert_eq!(ep.database, "app"); // defaults to the user name
        assert_eq!(ep.ssl_mode, "disable");
    }

    #[test]
    fn test_connection_info_explicit_values() {
        let info = ConnectionInfo {
            domin: "h".into(),
            port: "5433".into(),
            username: "u".into(),
            password: "p".into(),
            database: "shop".into(),
        };
        let ep = info.into_endpoint();
        assert_eq!(ep.port, 5433);
        assert_eq!(ep.database, "shop");
    }

    #[test]
    fn test_create_request_wire_format() {
        // the misspelled `domin` and string port are part of the wire format
        let body = r#"{
            "task_id": "t1",
            "source": {"domin": "s", "port": "5432", "username": "u", "password": "p"},
            "dest": {"domin": "d", "port": "5432", "username": "u", "password": "p", "database": "x"},
            "tables": ["a", "sales.b"]
        }"#;
        let req: CreateTaskRequest = serde_json::from_str(body).unwrap();
        assert_eq!(req.task_id, "t1");
        assert_eq!(req.source.domin, "s");
        assert_eq!(req.dest.database, "x");
        assert_eq!(req.tables.len(), 2);
        assert!(req.database_type.is_none());
        assert!(req.table_suffix.is_empty());
    }

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(
            status_for(&DtsError::NotFound("t".into())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_for(&DtsError::Validation("v".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_for(&DtsError::IllegalTransition {
                from: "waiting".into(),
                reason: "x".into()
            }),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_for(&DtsError::Replication("r".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
