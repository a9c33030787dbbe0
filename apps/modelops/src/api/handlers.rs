//! # Serving Shell Handlers

use super::{
    AppState,
    types::{HealthResponse, ModelResponse},
};
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};

/// Health check endpoint.
pub async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(HealthResponse::for_served(&state.served))
}

/// Stage holder metadata.
pub async fn model_handler(State(state): State<AppState>) -> impl IntoResponse {
    (StatusCode::OK, Json(ModelResponse::from(state.served.as_ref())))
}
