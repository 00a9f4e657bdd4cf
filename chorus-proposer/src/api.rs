//! HTTP surface of the proposer.

use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use chorus_core::messages::{
    HeartbeatRequest, LeaderReadRequest, LeaderReadResponse, ProposeRequest, ProposeResponse,
};

use crate::election;
use crate::node::ProposerNode;

#[derive(Clone)]
pub struct ApiState {
    pub node: Arc<ProposerNode>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/propose", post(propose))
        .route("/read", post(read))
        .route("/heartbeat", post(heartbeat))
        .route("/status", get(status))
        .route("/health", get(health))
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

async fn propose(
    State(state): State<ApiState>,
    axum::Json(request): axum::Json<ProposeRequest>,
) -> Response {
    let response = state.node.propose(request.key, request.value).await;
    let code = match &response {
        ProposeResponse::Ok { .. } => StatusCode::OK,
        ProposeResponse::NotLeader { .. } => StatusCode::CONFLICT,
        ProposeResponse::NoQuorum | ProposeResponse::Backpressure => {
            StatusCode::SERVICE_UNAVAILABLE
        }
    };
    (code, axum::Json(response)).into_response()
}

async fn read(
    State(state): State<ApiState>,
    axum::Json(request): axum::Json<LeaderReadRequest>,
) -> Response {
    let response = state.node.strong_read(request.key).await;
    let code = match &response {
        LeaderReadResponse::Ok { .. } => StatusCode::OK,
        LeaderReadResponse::NotLeader { .. } => StatusCode::CONFLICT,
        LeaderReadResponse::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
    };
    (code, axum::Json(response)).into_response()
}

async fn heartbeat(
    State(state): State<ApiState>,
    axum::Json(request): axum::Json<HeartbeatRequest>,
) -> Response {
    axum::Json(election::handle_heartbeat(&state.node, request)).into_response()
}

async fn status(State(state): State<ApiState>) -> Response {
    axum::Json(state.node.status()).into_response()
}
