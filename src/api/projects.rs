//! Control-plane routes (component J, routing half): `/projects/*`. Every
//! handler here delegates straight to the Project Manager (component I) and
//! wraps the result in the `{success, data?, error?}` envelope; auth is
//! applied once, as a layer, in `main.rs`.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{delete, get, post, put};
use axum::Router;
use serde::{Deserialize, Serialize};

use crate::error::OrchestratorError;
use crate::project::{CreateProjectRequest, FileUpdate};
use crate::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", post(create_project))
        .route("/{id}", get(get_status).delete(delete_project))
        .route("/{id}/files", put(update_files).get(list_files))
        .route("/{id}/files/{*path}", get(read_file))
        .route("/{id}/preview/start", post(start_preview))
        .route("/{id}/preview/stop", post(stop_preview))
        .route("/{id}/reinstall", post(reinstall_dependencies))
        .route("/{id}/dependencies", post(add_dependency))
        .route("/{id}/dependencies/{package}", delete(remove_dependency))
}

#[derive(Serialize)]
struct Envelope<T: Serialize> {
    success: bool,
    data: T,
}

fn ok<T: Serialize>(data: T) -> Response {
    Json(Envelope { success: true, data }).into_response()
}

async fn create_project(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateProjectRequest>,
) -> Result<Response, OrchestratorError> {
    let result = state.project.create(req).await?;
    Ok(ok(result))
}

async fn get_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Response, OrchestratorError> {
    let status = state.project.get_status(&id).await?;
    Ok(ok(status))
}

async fn delete_project(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Response, OrchestratorError> {
    state.project.delete(&id).await?;
    Ok(ok(serde_json::json!({ "deleted": true })))
}

#[derive(Deserialize)]
struct UpdateFilesRequest {
    updates: Vec<FileUpdate>,
}

async fn update_files(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<UpdateFilesRequest>,
) -> Result<Response, OrchestratorError> {
    state.project.update_files(&id, req.updates).await?;
    Ok(ok(serde_json::json!({ "updated": true })))
}

async fn list_files(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Response, OrchestratorError> {
    let files = state.project.list_files(&id).await?;
    Ok(ok(files))
}

async fn read_file(
    State(state): State<Arc<AppState>>,
    Path((id, path)): Path<(String, String)>,
) -> Result<Response, OrchestratorError> {
    let content = state.project.read_file(&id, &path).await?;
    Ok(ok(serde_json::json!({ "path": path, "content": content })))
}

async fn start_preview(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Response, OrchestratorError> {
    let result = state.project.start_preview(&id).await?;
    Ok(ok(result))
}

async fn stop_preview(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Response, OrchestratorError> {
    state.project.stop_preview(&id).await?;
    Ok(ok(serde_json::json!({ "stopped": true })))
}

async fn reinstall_dependencies(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Response, OrchestratorError> {
    state.project.reinstall_dependencies(&id).await?;
    Ok(ok(serde_json::json!({ "reinstalled": true })))
}

#[derive(Deserialize)]
struct AddDependencyRequest {
    package: String,
    #[serde(default)]
    dev: bool,
}

async fn add_dependency(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<AddDependencyRequest>,
) -> Result<Response, OrchestratorError> {
    if req.package.trim().is_empty() {
        return Err(OrchestratorError::BadRequest("package is required".into()));
    }
    state.project.add_dependency(&id, &req.package, req.dev).await?;
    Ok(ok(serde_json::json!({ "added": req.package })))
}

async fn remove_dependency(
    State(state): State<Arc<AppState>>,
    Path((id, package)): Path<(String, String)>,
) -> Result<Response, OrchestratorError> {
    state.project.remove_dependency(&id, &package).await?;
    Ok(ok(serde_json::json!({ "removed": package })))
}
