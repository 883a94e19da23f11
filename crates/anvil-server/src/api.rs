//! HTTP API: operator CRUD for templates, hardware and workflows, plus
//! the worker dispatch surface.

use crate::AppState;
use anvil_common::models::{ActionReport, Workflow, WorkflowContext};
use anvil_common::Error;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use tracing::error;
use uuid::Uuid;

pub fn api_router() -> Router<AppState> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/templates", get(list_templates).post(create_template))
        .route(
            "/templates/{key}",
            get(get_template).put(update_template).delete(delete_template),
        )
        .route("/hardware", get(list_hardware).post(push_hardware))
        .route("/hardware/{id}", get(hardware_by_id).delete(delete_hardware))
        .route("/hardware/mac/{mac}", get(hardware_by_mac))
        .route("/hardware/ip/{ip}", get(hardware_by_ip))
        .route("/workflows", get(list_workflows).post(create_workflow))
        .route("/workflows/{id}", get(get_workflow).delete(delete_workflow))
        .route(
            "/workflows/{id}/events",
            get(workflow_events).post(report_action_status),
        )
        .route("/workflows/{id}/context", get(workflow_context))
        .route("/workflows/{id}/actions", get(workflow_actions))
        .route(
            "/workflows/{id}/data",
            get(get_workflow_data).put(put_workflow_data),
        )
        .route("/workers/{worker}/workflows", get(workflows_for_worker))
}

/// JSON error body, paired with the canonical status code for the
/// taxonomy variant.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::Parse(_) | Error::Render { .. } | Error::InvalidArgument(_) => {
                StatusCode::BAD_REQUEST
            }
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::AlreadyExists(_)
            | Error::OutOfOrder(_)
            | Error::AlreadyTerminal(_)
            | Error::VersionConflict { .. } => StatusCode::CONFLICT,
            Error::Database(_) | Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        // Database causes stay in the logs; clients get the label only.
        let message = match &self.0 {
            Error::Database(cause) => {
                error!("database error: {}", cause);
                "database error".to_string()
            }
            other => other.to_string(),
        };

        (
            status,
            Json(ErrorResponse {
                error: self.0.label().to_string(),
                message,
            }),
        )
            .into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

async fn healthz() -> impl IntoResponse {
    StatusCode::OK
}

// === Templates ===

#[derive(Debug, Deserialize)]
struct CreateTemplateRequest {
    name: String,
    data: String,
}

#[derive(Debug, Serialize)]
struct CreatedResponse {
    id: Uuid,
}

async fn create_template(
    State(state): State<AppState>,
    Json(req): Json<CreateTemplateRequest>,
) -> ApiResult<impl IntoResponse> {
    let template = state.db.create_template(&req.name, &req.data).await?;
    Ok((StatusCode::CREATED, Json(CreatedResponse { id: template.id })))
}

#[derive(Debug, Deserialize)]
struct ListTemplatesQuery {
    name: Option<String>,
}

async fn list_templates(
    State(state): State<AppState>,
    Query(query): Query<ListTemplatesQuery>,
) -> ApiResult<impl IntoResponse> {
    let templates = state.db.list_templates(query.name.as_deref()).await?;
    Ok(Json(templates))
}

#[derive(Debug, Deserialize)]
struct GetTemplateQuery {
    #[serde(default)]
    include_deleted: bool,
}

async fn get_template(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Query(query): Query<GetTemplateQuery>,
) -> ApiResult<impl IntoResponse> {
    let template = state.db.get_template(&key, query.include_deleted).await?;
    Ok(Json(template))
}

#[derive(Debug, Deserialize)]
struct UpdateTemplateRequest {
    data: String,
}

async fn update_template(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateTemplateRequest>,
) -> ApiResult<impl IntoResponse> {
    let template = state.db.update_template(id, &req.data).await?;
    Ok(Json(template))
}

async fn delete_template(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    state.db.delete_template(&name).await?;
    Ok(StatusCode::NO_CONTENT)
}

// === Hardware ===

async fn push_hardware(
    State(state): State<AppState>,
    Json(data): Json<serde_json::Value>,
) -> ApiResult<impl IntoResponse> {
    let hardware = state.db.push_hardware(data).await?;
    Ok((StatusCode::CREATED, Json(hardware)))
}

async fn list_hardware(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.db.list_hardware().await?))
}

async fn hardware_by_id(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.db.hardware_by_id(&id).await?))
}

async fn hardware_by_mac(
    State(state): State<AppState>,
    Path(mac): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.db.hardware_by_mac(&mac).await?))
}

async fn hardware_by_ip(
    State(state): State<AppState>,
    Path(ip): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.db.hardware_by_ip(&ip).await?))
}

async fn delete_hardware(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    state.db.delete_hardware(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// === Workflows ===

#[derive(Debug, Deserialize)]
struct CreateWorkflowRequest {
    template_id: Uuid,
    hardware_id: String,
}

async fn create_workflow(
    State(state): State<AppState>,
    Json(req): Json<CreateWorkflowRequest>,
) -> ApiResult<impl IntoResponse> {
    let workflow = state
        .db
        .create_workflow(req.template_id, &req.hardware_id)
        .await?;
    Ok((StatusCode::CREATED, Json(CreatedResponse { id: workflow.id })))
}

async fn list_workflows(State(state): State<AppState>) -> ApiResult<Json<Vec<Workflow>>> {
    Ok(Json(state.db.list_workflows().await?))
}

async fn get_workflow(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Workflow>> {
    Ok(Json(state.db.get_workflow(id).await?))
}

async fn delete_workflow(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    state.db.delete_workflow(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn workflow_events(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.db.workflow_events(id).await?))
}

async fn report_action_status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(report): Json<ActionReport>,
) -> ApiResult<Json<WorkflowContext>> {
    Ok(Json(state.db.report_action_status(id, &report).await?))
}

async fn workflow_context(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<WorkflowContext>> {
    Ok(Json(state.db.workflow_context(id).await?))
}

async fn workflow_actions(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.db.workflow_actions(id).await?))
}

// === Workflow data blob ===

#[derive(Debug, Serialize)]
struct WorkflowDataResponse {
    version: i64,
    data: String,
}

async fn get_workflow_data(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<WorkflowDataResponse>> {
    let (data, version) = state.db.workflow_data(id).await?;
    Ok(Json(WorkflowDataResponse {
        version,
        data: BASE64.encode(data),
    }))
}

#[derive(Debug, Deserialize)]
struct PutWorkflowDataRequest {
    expected_version: i64,
    data: String,
}

#[derive(Debug, Serialize)]
struct PutWorkflowDataResponse {
    version: i64,
}

async fn put_workflow_data(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<PutWorkflowDataRequest>,
) -> ApiResult<Json<PutWorkflowDataResponse>> {
    let data = BASE64
        .decode(req.data.as_bytes())
        .map_err(|e| Error::InvalidArgument(format!("data is not valid base64: {}", e)))?;
    let version = state
        .db
        .put_workflow_data(id, data, req.expected_version)
        .await?;
    Ok(Json(PutWorkflowDataResponse { version }))
}

// === Worker dispatch ===

async fn workflows_for_worker(
    State(state): State<AppState>,
    Path(worker): Path<String>,
) -> ApiResult<Json<Vec<Uuid>>> {
    Ok(Json(state.db.workflows_for_worker(&worker).await?))
}
