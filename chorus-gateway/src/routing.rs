//! Leader discovery, retry policy, and consistency-based routing.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use chorus_core::messages::{
    GatewayStatus, LeaderReadRequest, LeaderReadResponse, ProposeRequest, ProposeResponse,
    ProposerStatus, ReadRequest, ReadResponse, SubscribeRequest, SubscribeResponse,
    UnsubscribeRequest, UnsubscribeResponse, WriteResponse,
};
use chorus_core::{ClientId, Consistency, Epoch, ProposerId, RpcClient, Slot};
use tracing::{debug, info, trace, warn};

/// Outer deadline the gateway enforces on a client call.
const CALL_DEADLINE: Duration = Duration::from_secs(10);
const RPC_TIMEOUT: Duration = Duration::from_secs(9);
const STATUS_TIMEOUT: Duration = Duration::from_secs(1);

/// Terminal outcomes surfaced to the HTTP layer.
#[derive(Debug)]
pub enum GatewayError {
    /// No leader could be confirmed; carries the best known hint.
    NoLeader(Option<ProposerId>),
    /// The cluster refused retriably (no quorum or backpressure).
    Unavailable(&'static str),
    /// The outer deadline expired.
    Deadline,
    /// A learner-side failure with a reason.
    Failed(String),
}

pub struct Gateway {
    proposer_urls: Vec<String>,
    learner_urls: Vec<String>,
    leader: Mutex<Option<(ProposerId, Epoch)>>,
    next_learner: AtomicUsize,
    /// Session tokens: highest slot each client has written through us.
    sessions: Mutex<HashMap<ClientId, Slot>>,
    /// Which learner owns each subscription we placed.
    subscriptions: Mutex<HashMap<String, String>>,
    rpc: RpcClient,
}

impl Gateway {
    #[must_use]
    pub fn new(proposer_urls: Vec<String>, learner_urls: Vec<String>) -> Self {
        Self {
            proposer_urls,
            learner_urls,
            leader: Mutex::new(None),
            next_learner: AtomicUsize::new(0),
            sessions: Mutex::new(HashMap::new()),
            subscriptions: Mutex::new(HashMap::new()),
            rpc: RpcClient::new(),
        }
    }

    fn leader_url(&self, id: ProposerId) -> Option<&str> {
        let index = (id.0 as usize).checked_sub(1)?;
        self.proposer_urls.get(index).map(String::as_str)
    }

    fn pick_learner(&self) -> Option<&str> {
        if self.learner_urls.is_empty() {
            return None;
        }
        let index = self.next_learner.fetch_add(1, Ordering::Relaxed) % self.learner_urls.len();
        Some(&self.learner_urls[index])
    }

    fn cached_leader(&self) -> Option<ProposerId> {
        self.leader.lock().unwrap().map(|(id, _)| id)
    }

    fn cache_leader(&self, id: ProposerId, epoch: Epoch) {
        let mut cached = self.leader.lock().unwrap();
        if cached.is_none_or(|(_, seen)| epoch >= seen) {
            *cached = Some((id, epoch));
        }
    }

    fn forget_leader(&self) {
        *self.leader.lock().unwrap() = None;
    }

    async fn current_leader(&self) -> Option<ProposerId> {
        if let Some(leader) = self.cached_leader() {
            return Some(leader);
        }
        self.discover_leader().await
    }

    /// Scan every proposer's status and adopt the LEADER with the highest
    /// epoch, falling back to any reported leader hint.
    pub async fn discover_leader(&self) -> Option<ProposerId> {
        let mut best: Option<(ProposerId, Epoch)> = None;
        let mut hint: Option<(ProposerId, Epoch)> = None;

        for url in &self.proposer_urls {
            let status: Result<ProposerStatus, _> = self
                .rpc
                .get_json(&format!("{url}/status"), STATUS_TIMEOUT)
                .await;
            let Ok(status) = status else { continue };

            if status.role == chorus_core::Role::Leader
                && best.is_none_or(|(_, epoch)| status.epoch > epoch)
            {
                best = Some((status.proposer_id, status.epoch));
            }
            if let Some(leader) = status.leader
                && hint.is_none_or(|(_, epoch)| status.epoch > epoch)
            {
                hint = Some((leader, status.epoch));
            }
        }

        let found = best.or(hint);
        if let Some((id, epoch)) = found {
            debug!(leader = %id, %epoch, "leader discovered");
            self.cache_leader(id, epoch);
        }
        found.map(|(id, _)| id)
    }

    /// Route a write to the leader, chasing `not_leader` hints until the
    /// outer deadline.
    ///
    /// # Errors
    ///
    /// See [`GatewayError`].
    pub async fn write(
        &self,
        key: String,
        value: Option<String>,
        client_id: Option<ClientId>,
    ) -> Result<WriteResponse, GatewayError> {
        let client = client_id.unwrap_or_else(|| ClientId("anonymous".into()));
        let deadline = Instant::now() + CALL_DEADLINE;
        let request = ProposeRequest {
            key,
            value,
            client_id: client.clone(),
        };

        loop {
            if Instant::now() >= deadline {
                return Err(GatewayError::Deadline);
            }

            let Some(leader) = self.current_leader().await else {
                return Err(GatewayError::NoLeader(None));
            };
            let Some(url) = self.leader_url(leader) else {
                self.forget_leader();
                return Err(GatewayError::NoLeader(Some(leader)));
            };

            let response: Result<ProposeResponse, _> = self
                .rpc
                .post_json(&format!("{url}/propose"), &request, RPC_TIMEOUT)
                .await;

            match response {
                Ok(ProposeResponse::Ok { slot }) => {
                    self.record_session(&client, slot);
                    return Ok(WriteResponse { slot, leader });
                }
                Ok(ProposeResponse::NotLeader { leader: hint }) => {
                    trace!(tried = %leader, ?hint, "not the leader, retrying");
                    self.forget_leader();
                    if let Some(hint) = hint.filter(|hint| *hint != leader) {
                        self.cache_leader(hint, Epoch(0));
                    }
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
                Ok(ProposeResponse::NoQuorum) => {
                    return Err(GatewayError::Unavailable("no quorum"));
                }
                Ok(ProposeResponse::Backpressure) => {
                    return Err(GatewayError::Unavailable("write window full"));
                }
                Err(report) => {
                    trace!(url, ?report, "leader unreachable, rediscovering");
                    self.forget_leader();
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            }
        }
    }

    /// Route a read by its consistency level.
    ///
    /// # Errors
    ///
    /// See [`GatewayError`].
    pub async fn read(
        &self,
        key: String,
        consistency: Consistency,
        client_id: Option<ClientId>,
    ) -> Result<ReadResponse, GatewayError> {
        match consistency {
            Consistency::Strong => self.strong_read(key).await,
            Consistency::Session | Consistency::Eventual => {
                let Some(url) = self.pick_learner() else {
                    return Err(GatewayError::Unavailable("no learners configured"));
                };
                let min_slot = match (&consistency, &client_id) {
                    (Consistency::Session, Some(client)) => self.session_floor(client),
                    _ => None,
                };
                let request = ReadRequest {
                    key,
                    consistency_level: consistency,
                    client_id,
                    min_slot,
                };
                self.rpc
                    .post_json::<_, ReadResponse>(&format!("{url}/read"), &request, RPC_TIMEOUT)
                    .await
                    .map_err(|report| {
                        warn!(?report, "learner read failed");
                        GatewayError::Deadline
                    })
            }
        }
    }

    async fn strong_read(&self, key: String) -> Result<ReadResponse, GatewayError> {
        let deadline = Instant::now() + CALL_DEADLINE;
        let request = LeaderReadRequest {
            key,
            client_id: None,
        };

        loop {
            if Instant::now() >= deadline {
                return Err(GatewayError::Deadline);
            }

            let Some(leader) = self.current_leader().await else {
                return Err(GatewayError::NoLeader(None));
            };
            let Some(url) = self.leader_url(leader) else {
                self.forget_leader();
                return Err(GatewayError::NoLeader(Some(leader)));
            };

            let response: Result<LeaderReadResponse, _> = self
                .rpc
                .post_json(&format!("{url}/read"), &request, RPC_TIMEOUT)
                .await;

            match response {
                Ok(LeaderReadResponse::Ok { value, slot }) => {
                    return Ok(ReadResponse { value, slot });
                }
                Ok(LeaderReadResponse::NotLeader { leader: hint }) => {
                    self.forget_leader();
                    if let Some(hint) = hint.filter(|hint| *hint != leader) {
                        self.cache_leader(hint, Epoch(0));
                    }
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
                Ok(LeaderReadResponse::Unavailable) => {
                    return Err(GatewayError::Unavailable("strong read unavailable"));
                }
                Err(report) => {
                    trace!(url, ?report, "leader unreachable for strong read");
                    self.forget_leader();
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            }
        }
    }

    /// Place a subscription on one learner and remember the placement.
    ///
    /// # Errors
    ///
    /// See [`GatewayError`].
    pub async fn subscribe(
        &self,
        request: SubscribeRequest,
    ) -> Result<SubscribeResponse, GatewayError> {
        let Some(url) = self.pick_learner() else {
            return Err(GatewayError::Unavailable("no learners configured"));
        };
        let response: SubscribeResponse = self
            .rpc
            .post_json(&format!("{url}/subscribe"), &request, RPC_TIMEOUT)
            .await
            .map_err(|report| GatewayError::Failed(format!("subscribe failed: {report}")))?;

        info!(subscription = %response.subscription_id, url, "subscription placed");
        self.subscriptions
            .lock()
            .unwrap()
            .insert(response.subscription_id.clone(), url.to_owned());

        Ok(SubscribeResponse {
            learner: Some(url.to_owned()),
            ..response
        })
    }

    /// Remove a subscription from its owning learner (or, when the owner is
    /// unknown, from whichever learner recognizes it).
    ///
    /// # Errors
    ///
    /// See [`GatewayError`].
    pub async fn unsubscribe(
        &self,
        request: UnsubscribeRequest,
    ) -> Result<UnsubscribeResponse, GatewayError> {
        let owner = self
            .subscriptions
            .lock()
            .unwrap()
            .remove(&request.subscription_id);

        let targets: Vec<String> = match owner {
            Some(url) => vec![url],
            None => self.learner_urls.clone(),
        };

        for url in targets {
            let response: Result<UnsubscribeResponse, _> = self
                .rpc
                .post_json(&format!("{url}/unsubscribe"), &request, RPC_TIMEOUT)
                .await;
            if let Ok(UnsubscribeResponse::Removed) = response {
                return Ok(UnsubscribeResponse::Removed);
            }
        }
        Ok(UnsubscribeResponse::NotFound)
    }

    #[must_use]
    pub fn status(&self) -> GatewayStatus {
        let cached = *self.leader.lock().unwrap();
        GatewayStatus {
            leader: cached.map(|(id, _)| id),
            epoch: cached.map_or(Epoch(0), |(_, epoch)| epoch),
            proposers: self.proposer_urls.len(),
            learners: self.learner_urls.len(),
        }
    }

    fn record_session(&self, client: &ClientId, slot: Slot) {
        let mut sessions = self.sessions.lock().unwrap();
        let entry = sessions.entry(client.clone()).or_insert(Slot(0));
        *entry = (*entry).max(slot);
    }

    fn session_floor(&self, client: &ClientId) -> Option<Slot> {
        self.sessions.lock().unwrap().get(client).copied()
    }
}
