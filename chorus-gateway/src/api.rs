//! HTTP surface of the client gateway, with the status-code mapping for
//! terminal outcomes: 409 not-leader (with a hint), 503 retriable, 504
//! deadline.

use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use chorus_core::messages::{
    ErrorBody, GatewayReadRequest, SubscribeRequest, UnsubscribeRequest, WriteRequest,
};

use crate::routing::{Gateway, GatewayError};

#[derive(Clone)]
pub struct ApiState {
    pub gateway: Arc<Gateway>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/write", post(write))
        .route("/read", post(read))
        .route("/subscribe", post(subscribe))
        .route("/unsubscribe", post(unsubscribe))
        .route("/status", get(status))
        .route("/health", get(health))
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let (code, message) = match self {
            Self::NoLeader(hint) => (
                StatusCode::CONFLICT,
                hint.map_or_else(
                    || "no leader known".to_owned(),
                    |id| format!("not leader; try proposer {id}"),
                ),
            ),
            Self::Unavailable(reason) => (StatusCode::SERVICE_UNAVAILABLE, reason.to_owned()),
            Self::Deadline => (
                StatusCode::GATEWAY_TIMEOUT,
                "deadline expired, retry".to_owned(),
            ),
            Self::Failed(message) => (StatusCode::SERVICE_UNAVAILABLE, message),
        };
        (code, axum::Json(ErrorBody { error: message })).into_response()
    }
}

async fn write(
    State(state): State<ApiState>,
    axum::Json(request): axum::Json<WriteRequest>,
) -> Response {
    match state
        .gateway
        .write(request.key, request.value, request.client_id)
        .await
    {
        Ok(response) => axum::Json(response).into_response(),
        Err(error) => error.into_response(),
    }
}

async fn read(
    State(state): State<ApiState>,
    axum::Json(request): axum::Json<GatewayReadRequest>,
) -> Response {
    match state
        .gateway
        .read(request.key, request.consistency_level, request.client_id)
        .await
    {
        Ok(response) => axum::Json(response).into_response(),
        Err(error) => error.into_response(),
    }
}

async fn subscribe(
    State(state): State<ApiState>,
    axum::Json(request): axum::Json<SubscribeRequest>,
) -> Response {
    match state.gateway.subscribe(request).await {
        Ok(response) => axum::Json(response).into_response(),
        Err(error) => error.into_response(),
    }
}

async fn unsubscribe(
    State(state): State<ApiState>,
    axum::Json(request): axum::Json<UnsubscribeRequest>,
) -> Response {
    match state.gateway.unsubscribe(request).await {
        Ok(response) => axum::Json(response).into_response(),
        Err(error) => error.into_response(),
    }
}

async fn status(State(state): State<ApiState>) -> Response {
    axum::Json(state.gateway.status()).into_response()
}
