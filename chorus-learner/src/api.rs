//! HTTP surface of the learner.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Router;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use chorus_core::messages::{
    ErrorBody, NotifyRequest, NotifyResponse, ProposerStatus, ReadRequest, ReadResponse,
    SubscribeRequest, SubscribeResponse, SyncRequest, UnsubscribeRequest, UnsubscribeResponse,
};
use chorus_core::{Consistency, Role, Slot};
use tracing::debug;

use crate::service::LearnerService;

/// How long a session or strong read may block on the commit prefix.
const READ_WAIT: Duration = Duration::from_secs(5);
const LEADER_STATUS_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Clone)]
pub struct ApiState {
    pub service: Arc<LearnerService>,
    /// Proposer directory, ordered by id, for the learner-side strong path.
    pub proposer_urls: Arc<[String]>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/notify", post(notify))
        .route("/read", post(read))
        .route("/sync", post(sync))
        .route("/subscribe", post(subscribe))
        .route("/unsubscribe", post(unsubscribe))
        .route("/notifications", get(notifications))
        .route("/status", get(status))
        .route("/health", get(health))
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

async fn notify(
    State(state): State<ApiState>,
    axum::Json(request): axum::Json<NotifyRequest>,
) -> Response {
    state.service.handle_notify(&request);
    axum::Json(NotifyResponse { ack: true }).into_response()
}

fn timed_out() -> Response {
    (
        StatusCode::GATEWAY_TIMEOUT,
        axum::Json(ErrorBody {
            error: "read deadline expired before the commit prefix caught up".into(),
        }),
    )
        .into_response()
}

fn unavailable(reason: &str) -> Response {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        axum::Json(ErrorBody {
            error: reason.into(),
        }),
    )
        .into_response()
}

async fn read(
    State(state): State<ApiState>,
    axum::Json(request): axum::Json<ReadRequest>,
) -> Response {
    let service = &state.service;
    let deadline = Instant::now() + READ_WAIT;

    // Strong reads normally go through the gateway to the leader; served
    // here directly, confirm the commit index with the current leader first.
    let floor = match request.consistency_level {
        Consistency::Strong if request.min_slot.is_none() => {
            match leader_commit_floor(&state).await {
                Some(floor) => Some(floor),
                None => return unavailable("cannot confirm leadership for strong read"),
            }
        }
        Consistency::Session => {
            let carried = request.min_slot;
            request
                .client_id
                .as_ref()
                .map(|client| service.ledger.session_floor(client, carried))
                .or(carried)
        }
        _ => request.min_slot,
    };

    if let Some(floor) = floor.filter(|floor| *floor > Slot(0)) {
        if !service.ledger.wait_for_commit(floor, deadline).await {
            return timed_out();
        }
        if let Some(client) = &request.client_id {
            service.ledger.update_session(client, floor);
        }
    }

    let (value, slot) = service.ledger.read(&request.key);
    axum::Json(ReadResponse { value, slot }).into_response()
}

/// Ask the current leader how far the log reaches, so a direct strong read
/// never returns a value older than an acknowledged write. The epoch check
/// is the leader's own role report.
async fn leader_commit_floor(state: &ApiState) -> Option<Slot> {
    let (leader, _) = state.service.ledger.leader();
    let index = (leader?.0 as usize).checked_sub(1)?;
    let url = state.proposer_urls.get(index)?;

    let status: ProposerStatus = state
        .service
        .rpc
        .get_json(&format!("{url}/status"), LEADER_STATUS_TIMEOUT)
        .await
        .ok()?;
    if status.role != Role::Leader {
        return None;
    }
    Some(status.next_slot.prev())
}

async fn sync(
    State(state): State<ApiState>,
    axum::Json(request): axum::Json<SyncRequest>,
) -> Response {
    let entries = state.service.ledger.snapshot_range(request.from, request.to);
    debug!(from = %request.from, to = %request.to, count = entries.len(), "served sync");
    axum::Json(entries).into_response()
}

async fn subscribe(
    State(state): State<ApiState>,
    axum::Json(request): axum::Json<SubscribeRequest>,
) -> Response {
    let id = state
        .service
        .subscriptions
        .subscribe(request.client_id, request.patterns);
    axum::Json(SubscribeResponse {
        subscription_id: id,
        learner: None,
    })
    .into_response()
}

async fn unsubscribe(
    State(state): State<ApiState>,
    axum::Json(request): axum::Json<UnsubscribeRequest>,
) -> Response {
    let removed = state
        .service
        .subscriptions
        .unsubscribe(&request.subscription_id);
    let response = if removed {
        UnsubscribeResponse::Removed
    } else {
        UnsubscribeResponse::NotFound
    };
    axum::Json(response).into_response()
}

async fn notifications(
    State(state): State<ApiState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let Some(id) = params.get("subscriptionId") else {
        return (
            StatusCode::BAD_REQUEST,
            axum::Json(ErrorBody {
                error: "subscriptionId query parameter is required".into(),
            }),
        )
            .into_response();
    };
    match state.service.subscriptions.drain(id) {
        Some(events) => axum::Json(events).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            axum::Json(ErrorBody {
                error: "unknown subscription".into(),
            }),
        )
            .into_response(),
    }
}

async fn status(State(state): State<ApiState>) -> Response {
    axum::Json(state.service.status()).into_response()
}
