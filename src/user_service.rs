//! Example user management service wired up with the full instrumentation
//! stack.
//!
//! Every handler logs through `tracing`, records a business operation and
//! times itself; the router layers add the request scope, server span and
//! RED metrics.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower::ServiceBuilder;

use crate::{
    metrics::Metrics,
    middleware::{MetricsLayer, TracingLayer},
    setup::Telemetry,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: u64,
    pub username: String,
    pub email: String,
    #[serde(default)]
    pub full_name: Option<String>,
}

/// Body of `POST /users`.
#[derive(Debug, Clone, Deserialize)]
pub struct UserCreate {
    pub username: String,
    pub email: String,
    #[serde(default)]
    pub full_name: Option<String>,
}

/// State shared by all handlers.
#[derive(Clone)]
pub struct AppState {
    service_name: Arc<str>,
    metrics: Metrics,
    users: Arc<RwLock<Vec<User>>>,
}

impl AppState {
    pub fn new(service_name: impl Into<Arc<str>>, metrics: Metrics) -> Self {
        Self {
            service_name: service_name.into(),
            metrics,
            users: Arc::new(RwLock::new(seed_users())),
        }
    }

    pub fn users(&self) -> Vec<User> {
        self.users.read().clone()
    }
}

fn seed_users() -> Vec<User> {
    vec![
        User {
            id: 1,
            username: "john_doe".to_string(),
            email: "john@example.com".to_string(),
            full_name: Some("John Doe".to_string()),
        },
        User {
            id: 2,
            username: "jane_smith".to_string(),
            email: "jane@example.com".to_string(),
            full_name: Some("Jane Smith".to_string()),
        },
    ]
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("User not found")]
    NotFound,
    #[error("Username already exists")]
    UsernameTaken,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self {
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::UsernameTaken => StatusCode::CONFLICT,
        };
        (status, Json(json!({ "detail": self.to_string() }))).into_response()
    }
}

/// Builds the service's router on a fresh store.
pub fn router(telemetry: &Telemetry) -> Router {
    let state = AppState::new(telemetry.config.service_name.as_str(), telemetry.metrics.clone());
    router_with_state(telemetry, state)
}

/// Builds the service's router around an existing state.
pub fn router_with_state(telemetry: &Telemetry, state: AppState) -> Router {
    Router::new()
        .route("/", get(health))
        .route("/metrics", get(metrics))
        .route("/users", get(list_users).post(create_user))
        .route("/users/{user_id}", get(get_user).delete(delete_user))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TracingLayer::new(
                    telemetry.spans.clone(),
                    telemetry.config.correlation_header.clone(),
                ))
                .layer(MetricsLayer::new(telemetry.metrics.clone())),
        )
}

#[tracing::instrument(skip_all)]
async fn health(State(state): State<AppState>) -> Json<Value> {
    tracing::info!("Health check requested");
    Json(json!({ "service": &*state.service_name, "status": "healthy" }))
}

#[tracing::instrument(skip_all)]
async fn metrics(State(state): State<AppState>) -> Response {
    state.metrics.exposition()
}

#[tracing::instrument(skip_all)]
async fn list_users(State(state): State<AppState>) -> Json<Vec<User>> {
    let _timer = state.metrics.time_operation("list_users");
    let users = state.users();
    tracing::info!(user_count = users.len(), "Listing all users");
    state.metrics.record_operation("list_users", "success");
    Json(users)
}

#[tracing::instrument(skip(state))]
async fn get_user(
    State(state): State<AppState>,
    Path(user_id): Path<u64>,
) -> Result<Json<User>, ApiError> {
    tracing::info!(user_id, "Fetching user");
    let _timer = state.metrics.time_operation("get_user");

    let user = state
        .users
        .read()
        .iter()
        .find(|user| user.id == user_id)
        .cloned();
    let Some(user) = user else {
        tracing::warn!(user_id, "User not found");
        state.metrics.record_operation("get_user", "not_found");
        return Err(ApiError::NotFound);
    };

    state.metrics.record_operation("get_user", "success");
    Ok(Json(user))
}

#[tracing::instrument(skip_all)]
async fn create_user(
    State(state): State<AppState>,
    Json(payload): Json<UserCreate>,
) -> Result<(StatusCode, Json<User>), ApiError> {
    tracing::info!(username = %payload.username, "Creating user");
    let _timer = state.metrics.time_operation("create_user");

    let user = {
        let mut users = state.users.write();
        if users.iter().any(|user| user.username == payload.username) {
            drop(users);
            tracing::warn!(username = %payload.username, "Username already exists");
            state.metrics.record_operation("create_user", "conflict");
            return Err(ApiError::UsernameTaken);
        }

        let id = users.iter().map(|user| user.id).max().unwrap_or(0) + 1;
        let user = User {
            id,
            username: payload.username,
            email: payload.email,
            full_name: payload.full_name,
        };
        users.push(user.clone());
        user
    };

    tracing::info!(user_id = user.id, "User created successfully");
    state.metrics.record_operation("create_user", "success");
    Ok((StatusCode::CREATED, Json(user)))
}

#[tracing::instrument(skip(state))]
async fn delete_user(
    State(state): State<AppState>,
    Path(user_id): Path<u64>,
) -> Result<StatusCode, ApiError> {
    tracing::info!(user_id, "Deleting user");
    let _timer = state.metrics.time_operation("delete_user");

    let removed = {
        let mut users = state.users.write();
        users
            .iter()
            .position(|user| user.id == user_id)
            .map(|index| users.remove(index))
    };
    if removed.is_none() {
        tracing::warn!(user_id, "User not found for deletion");
        state.metrics.record_operation("delete_user", "not_found");
        return Err(ApiError::NotFound);
    }

    tracing::info!(user_id, "User deleted successfully");
    state.metrics.record_operation("delete_user", "success");
    Ok(StatusCode::NO_CONTENT)
}
