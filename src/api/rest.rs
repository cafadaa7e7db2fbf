//! REST handlers for task management.

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use uuid::Uuid;

use crate::error::Error;
use crate::tasks::model::{Page, TaskFilter, TaskPriority, TaskStatusView};
use crate::tasks::service::{NewTask, UpdateTask};
use crate::tasks::state::TaskStatus;

use super::AppState;

/// Error wrapper mapping the crate taxonomy onto status codes and a stable
/// `{error, message}` body.
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Conflict(_) => StatusCode::CONFLICT,
            Error::Store(e) => match e {
                crate::error::StoreError::NotFound { .. } => StatusCode::NOT_FOUND,
                crate::error::StoreError::VersionConflict { .. }
                | crate::error::StoreError::IllegalTransition { .. } => StatusCode::CONFLICT,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = Json(serde_json::json!({
            "error": self.0.kind(),
            "message": self.0.to_string(),
        }));

        (status, body).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

pub async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "taskhub",
    }))
}

pub async fn create_task(
    State(state): State<AppState>,
    Path(instance_id): Path<String>,
    Json(body): Json<NewTask>,
) -> ApiResult<impl IntoResponse> {
    let task = state.service.submit(&instance_id, body).await?;
    Ok((StatusCode::CREATED, Json(task)))
}

/// Listing query parameters. `status` accepts a comma-separated set.
#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    pub status: Option<String>,
    pub priority: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub scheduled_from: Option<DateTime<Utc>>,
    pub scheduled_to: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

pub async fn list_tasks(
    State(state): State<AppState>,
    Path(instance_id): Path<String>,
    Query(query): Query<ListQuery>,
) -> ApiResult<impl IntoResponse> {
    let mut filter = TaskFilter {
        priority: query
            .priority
            .as_deref()
            .map(TaskPriority::parse)
            .transpose()
            .map_err(Error::from)?,
        created_from: query.from,
        created_to: query.to,
        scheduled_from: query.scheduled_from,
        scheduled_to: query.scheduled_to,
        ..Default::default()
    };

    if let Some(ref statuses) = query.status {
        for raw in statuses.split(',').filter(|s| !s.is_empty()) {
            filter.statuses.push(TaskStatus::parse(raw).map_err(Error::from)?);
        }
    }

    let page = Page::new(query.limit.unwrap_or(50), query.offset.unwrap_or(0));
    let tasks = state.service.list(&instance_id, &filter, &page).await?;

    Ok(Json(serde_json::json!({
        "tasks": tasks,
        "limit": page.limit,
        "offset": page.offset,
    })))
}

pub async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let task = state.service.get(id).await?;
    Ok(Json(task))
}

pub async fn get_task_status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let task = state.service.get(id).await?;
    Ok(Json(TaskStatusView::from(&task)))
}

pub async fn update_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<UpdateTask>,
) -> ApiResult<impl IntoResponse> {
    let task = state.service.update(id, body).await?;
    Ok(Json(task))
}

pub async fn cancel_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let task = state.service.cancel(id).await?;
    Ok(Json(task))
}

pub async fn retry_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let task = state.service.force_retry(id).await?;
    Ok(Json(task))
}

#[derive(Debug, Deserialize)]
pub struct ReviewRequest {
    pub approved: bool,
    #[serde(default)]
    pub note: Option<String>,
}

pub async fn review_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<ReviewRequest>,
) -> ApiResult<impl IntoResponse> {
    let task = state.service.review(id, body.approved, body.note).await?;
    Ok(Json(task))
}

pub async fn delete_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    state.service.delete(id).await?;
    Ok(StatusCode::NO_CONTENT)
}
