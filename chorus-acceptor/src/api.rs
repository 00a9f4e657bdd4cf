//! HTTP surface of the acceptor.

use axum::Router;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use chorus_core::messages::{
    AcceptRequest, AcceptedQuery, AcceptorStatus, ErrorBody, PrepareRequest,
};
use chorus_core::Slot;
use tracing::error;

use crate::metrics::SharedMetrics;
use crate::service::AcceptorService;

#[derive(Clone)]
pub struct ApiState {
    pub service: AcceptorService,
    pub metrics: SharedMetrics,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/prepare", post(prepare))
        .route("/accept", post(accept))
        .route("/accepted", get(accepted))
        .route("/status", get(status))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

/// A store failure means the node may no longer vote: its memory can run
/// ahead of disk, so every later reply would be suspect. Reply
/// non-affirmative and take the process down for the operator to restart.
fn durability_failure(error: &error_stack::Report<chorus_core::StoreFatal>) -> Response {
    error!(?error, "durable store failure; shutting down");
    tokio::spawn(async {
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        std::process::exit(1);
    });
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        axum::Json(ErrorBody {
            error: "durable store failure".into(),
        }),
    )
        .into_response()
}

async fn prepare(
    State(state): State<ApiState>,
    axum::Json(request): axum::Json<PrepareRequest>,
) -> Response {
    match state.service.handle_prepare(request).await {
        Ok(response) => axum::Json(response).into_response(),
        Err(error) => durability_failure(&error),
    }
}

async fn accept(
    State(state): State<ApiState>,
    axum::Json(request): axum::Json<AcceptRequest>,
) -> Response {
    match state.service.handle_accept(request).await {
        Ok(response) => axum::Json(response).into_response(),
        Err(error) => durability_failure(&error),
    }
}

async fn accepted(
    State(state): State<ApiState>,
    Query(query): Query<AcceptedQuery>,
) -> Response {
    let entries = state
        .service
        .accepted_range(Slot(query.from), Slot(query.to));
    axum::Json(entries).into_response()
}

async fn status(State(state): State<ApiState>) -> Response {
    let store = state.service.store();
    axum::Json(AcceptorStatus {
        acceptor_id: state.service.id,
        recorded_slots: store.recorded_slots(),
        highest_slot: store.highest_log_slot(),
    })
    .into_response()
}

async fn metrics(State(state): State<ApiState>) -> Response {
    let body = state.metrics.encode().await;
    (
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        body,
    )
        .into_response()
}
