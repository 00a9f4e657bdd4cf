//! JSON bodies exchanged between the cluster roles.
//!
//! Every endpoint speaks `application/json`. Field names follow the wire
//! convention (`proposalNum`, `committedUpTo`, ...) rather than Rust casing.

use serde::{Deserialize, Serialize};

use crate::types::{
    AcceptorId, ClientId, Command, Consistency, Epoch, LearnerId, ProposalNum, ProposerId, Role,
    Slot,
};

// ---------------------------------------------------------------------------
// Acceptor surface
// ---------------------------------------------------------------------------

/// `POST /prepare`.
///
/// With `from_slot` set this is the once-per-epoch ranged Phase 1: the
/// acceptor installs a floor promise covering every slot >= `from_slot` and
/// reports all values it has accepted in that range.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrepareRequest {
    pub slot: Slot,
    pub epoch: Epoch,
    pub proposal_num: ProposalNum,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_slot: Option<Slot>,
}

/// One accepted `(slot, proposal, value)` triple, as reported by an acceptor.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcceptedEntry {
    pub slot: Slot,
    pub accepted_num: ProposalNum,
    pub accepted_val: Command,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PrepareResponse {
    #[serde(rename_all = "camelCase")]
    Promise {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        accepted_num: Option<ProposalNum>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        accepted_val: Option<Command>,
        /// Ranged form only: accepted values at slots >= `from_slot`.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        accepted: Vec<AcceptedEntry>,
    },
    Nack { promised: ProposalNum },
}

/// `POST /accept`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcceptRequest {
    pub slot: Slot,
    pub epoch: Epoch,
    pub proposal_num: ProposalNum,
    pub value: Command,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AcceptResponse {
    Accepted,
    Nack { promised: ProposalNum },
}

/// `GET /accepted?from=&to=` query, used by learner catch-up.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct AcceptedQuery {
    pub from: u64,
    pub to: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcceptorStatus {
    pub acceptor_id: AcceptorId,
    pub recorded_slots: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub highest_slot: Option<Slot>,
}

// ---------------------------------------------------------------------------
// Proposer surface
// ---------------------------------------------------------------------------

/// `POST /propose`. A missing `value` deletes the key.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProposeRequest {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    pub client_id: ClientId,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ProposeResponse {
    Ok {
        slot: Slot,
    },
    NotLeader {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        leader: Option<ProposerId>,
    },
    NoQuorum,
    Backpressure,
}

/// `POST /read` on the proposer: the strong, read-through-log path.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderReadRequest {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<ClientId>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LeaderReadResponse {
    #[serde(rename_all = "camelCase")]
    Ok {
        #[serde(default)]
        value: Option<String>,
        slot: Slot,
    },
    NotLeader {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        leader: Option<ProposerId>,
    },
    Unavailable,
}

/// `POST /heartbeat`, leader to proposer peers.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatRequest {
    pub proposer_id: ProposerId,
    pub epoch: Epoch,
    pub committed_up_to: Slot,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub ack: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProposerStatus {
    pub proposer_id: ProposerId,
    pub role: Role,
    pub epoch: Epoch,
    pub next_slot: Slot,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leader: Option<ProposerId>,
    pub committed_up_to: Slot,
    pub inflight: usize,
}

// ---------------------------------------------------------------------------
// Learner surface
// ---------------------------------------------------------------------------

/// `POST /notify`, fanned out by acceptors on every durable accept.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotifyRequest {
    pub slot: Slot,
    pub epoch: Epoch,
    pub acceptor_id: AcceptorId,
    pub proposal_num: ProposalNum,
    pub value: Command,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct NotifyResponse {
    pub ack: bool,
}

/// `POST /read` on a learner.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadRequest {
    pub key: String,
    pub consistency_level: Consistency,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<ClientId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_slot: Option<Slot>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadResponse {
    #[serde(default)]
    pub value: Option<String>,
    pub slot: Slot,
}

/// `POST /sync` between learners.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct SyncRequest {
    pub from: Slot,
    pub to: Slot,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SyncEntry {
    pub slot: Slot,
    pub value: Command,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LearnerStatus {
    pub learner_id: LearnerId,
    pub committed_up_to: Slot,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub highest_seen: Option<Slot>,
    pub keys: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leader: Option<ProposerId>,
    pub epoch: Epoch,
    pub subscriptions: usize,
}

// ---------------------------------------------------------------------------
// Subscriptions
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeRequest {
    pub client_id: ClientId,
    /// Key patterns; a trailing `*` matches any suffix.
    pub patterns: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeResponse {
    pub subscription_id: String,
    /// Address of the learner owning the subscription, filled by the gateway.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub learner: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnsubscribeRequest {
    pub subscription_id: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum UnsubscribeResponse {
    Removed,
    NotFound,
}

/// A committed event delivered to a subscriber, in slot order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationEvent {
    pub slot: Slot,
    pub key: String,
    #[serde(default)]
    pub value: Option<String>,
}

// ---------------------------------------------------------------------------
// Gateway surface
// ---------------------------------------------------------------------------

/// `POST /write` at the gateway. A missing `value` deletes the key.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteRequest {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<ClientId>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteResponse {
    pub slot: Slot,
    pub leader: ProposerId,
}

/// `POST /read` at the gateway.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayReadRequest {
    pub key: String,
    pub consistency_level: Consistency,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<ClientId>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leader: Option<ProposerId>,
    pub epoch: Epoch,
    pub proposers: usize,
    pub learners: usize,
}

/// Error body attached to non-success HTTP statuses.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prepare_response_wire_shape() {
        let promise = PrepareResponse::Promise {
            accepted_num: Some(ProposalNum::new(3, ProposerId(1))),
            accepted_val: Some(Command::Noop),
            accepted: vec![],
        };
        let json = serde_json::to_value(&promise).unwrap();
        assert_eq!(json["status"], "promise");
        assert_eq!(json["acceptedNum"]["round"], 3);

        let nack = PrepareResponse::Nack {
            promised: ProposalNum::new(7, ProposerId(2)),
        };
        let json = serde_json::to_value(&nack).unwrap();
        assert_eq!(json["status"], "nack");
        assert_eq!(json["promised"]["round"], 7);
    }

    #[test]
    fn read_request_defaults_optional_fields() {
        let req: ReadRequest =
            serde_json::from_str(r#"{"key":"k","consistencyLevel":"eventual"}"#).unwrap();
        assert_eq!(req.consistency_level, Consistency::Eventual);
        assert!(req.client_id.is_none());
        assert!(req.min_slot.is_none());
    }

    #[test]
    fn propose_response_roundtrip() {
        let resp = ProposeResponse::NotLeader {
            leader: Some(ProposerId(2)),
        };
        let json = serde_json::to_string(&resp).unwrap();
        let back: ProposeResponse = serde_json::from_str(&json).unwrap();
        assert_eq!(back, resp);
    }
}
