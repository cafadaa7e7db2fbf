//! HTTP surface: REST task management + WebSocket event subscriptions.

pub mod rest;
pub mod ws;

use std::sync::Arc;

use axum::Router;
use axum::routing::{delete, get, patch, post};
use tower_http::cors::CorsLayer;

use crate::tasks::service::TaskService;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<TaskService>,
}

/// Build the Axum router with REST and WebSocket routes.
pub fn task_routes(service: Arc<TaskService>) -> Router {
    let state = AppState { service };

    Router::new()
        .route("/health", get(rest::health))
        .route("/instances/{instance_id}/tasks", post(rest::create_task))
        .route("/instances/{instance_id}/tasks", get(rest::list_tasks))
        .route("/tasks/{id}", get(rest::get_task))
        .route("/tasks/{id}", patch(rest::update_task))
        .route("/tasks/{id}", delete(rest::delete_task))
        .route("/tasks/{id}/status", get(rest::get_task_status))
        .route("/tasks/{id}/cancel", post(rest::cancel_task))
        .route("/tasks/{id}/retry", post(rest::retry_task))
        .route("/tasks/{id}/review", post(rest::review_task))
        .route("/ws/events", get(ws::ws_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
