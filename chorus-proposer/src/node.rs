//! The proposer node: Multi-Paxos write pipeline, epoch establishment, and
//! the strong-read path.
//!
//! Under stable leadership a client command costs one Phase 2 round: the
//! once-per-epoch ranged Phase 1 installed a floor promise on the acceptors,
//! so fresh slots are bound with `accept(slot, n*, v)` alone. Any NACK drops
//! the slot back to a full per-slot Phase 1 with a fresh proposal number.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chorus_consensus::{AcceptStep, PrepareStep, SlotInstance};
use chorus_core::messages::{
    AcceptRequest, AcceptResponse, LeaderReadResponse, LearnerStatus, PrepareRequest,
    PrepareResponse, ProposeResponse, ProposerStatus, ReadRequest, ReadResponse,
};
use chorus_core::{
    AcceptorId, Command, Consistency, Epoch, ProposalNum, ProposerId, Role, RpcClient, RpcError,
    Slot,
};
use error_stack::Report;
use futures::StreamExt;
use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info, instrument, trace, warn};

use crate::state::{CoreState, RoundStore};

/// Per-attempt RPC budget inside a phase.
const PER_TRY: Duration = Duration::from_secs(1);
/// Outer budget for binding one client command, rebinds included.
const WRITE_DEADLINE: Duration = Duration::from_secs(8);
/// Budget for completing slots adopted at the start of an epoch.
const ADOPTION_DEADLINE: Duration = Duration::from_secs(5);
/// Budget for the strong-read commit wait.
const READ_DEADLINE: Duration = Duration::from_secs(5);
const STATUS_TIMEOUT: Duration = Duration::from_secs(1);

pub struct NodeConfig {
    pub id: ProposerId,
    pub acceptor_urls: Vec<String>,
    /// All proposers, ordered by id (`index i` hosts `ProposerId(i + 1)`).
    pub proposer_urls: Vec<String>,
    pub learner_urls: Vec<String>,
    pub quorum: usize,
    pub heartbeat_interval: Duration,
    pub leader_timeout: Duration,
    pub pipeline_window: usize,
}

pub struct ProposerNode {
    pub config: NodeConfig,
    pub(crate) rounds: RoundStore,
    pub(crate) state: Mutex<CoreState>,
    pub(crate) rpc: RpcClient,
    /// Log slots claimed but never bound (no quorum at the time); the
    /// reclaim loop fills them so the commit prefix cannot stall on a hole.
    pub(crate) unbound: Mutex<Vec<Slot>>,
}

/// Terminal outcome of binding one command.
#[derive(Debug)]
pub(crate) enum BindOutcome {
    Bound(Slot),
    NotLeader(Option<ProposerId>),
    NoQuorum,
    Backpressure,
}

/// Outcome of driving a single slot to a decision.
#[derive(Debug)]
enum DriveOutcome {
    /// The slot is chosen. `displaced` means an adopted value won instead of
    /// the caller's command.
    Chosen { displaced: bool },
    NotLeader,
    NoQuorum,
}

enum Phase1Run {
    Ready { displaced: bool },
    Superseded(ProposalNum),
    NoQuorum,
}

enum Phase2Run {
    Chosen,
    Superseded(ProposalNum),
    NoQuorum,
}

impl ProposerNode {
    #[must_use]
    pub fn new(config: NodeConfig, rounds: RoundStore) -> Arc<Self> {
        Arc::new(Self {
            config,
            rounds,
            state: Mutex::new(CoreState::new()),
            rpc: RpcClient::new(),
            unbound: Mutex::new(Vec::new()),
        })
    }

    #[must_use]
    pub fn status(&self) -> ProposerStatus {
        let state = self.state.lock().unwrap();
        ProposerStatus {
            proposer_id: self.config.id,
            role: state.role,
            epoch: state.epoch,
            next_slot: state.next_slot,
            leader: state.leader,
            committed_up_to: state.committed_up_to,
            inflight: state.inflight,
        }
    }

    pub(crate) fn is_current_leader(&self, epoch: Epoch) -> bool {
        let state = self.state.lock().unwrap();
        state.role == Role::Leader && state.epoch == epoch
    }

    fn known_leader(&self) -> Option<ProposerId> {
        self.state.lock().unwrap().leader
    }

    // -- client write path --------------------------------------------------

    /// Serve one `POST /propose`.
    pub async fn propose(&self, key: String, value: Option<String>) -> ProposeResponse {
        let command = match value {
            Some(value) => Command::Put { key, value },
            None => Command::Del { key },
        };
        match self.bind_command(command).await {
            BindOutcome::Bound(slot) => ProposeResponse::Ok { slot },
            BindOutcome::NotLeader(leader) => ProposeResponse::NotLeader { leader },
            BindOutcome::NoQuorum => ProposeResponse::NoQuorum,
            BindOutcome::Backpressure => ProposeResponse::Backpressure,
        }
    }

    /// Bind `command` to the next unused slot, rebinding past any slot where
    /// Phase 1 forced adoption of an earlier value.
    pub(crate) async fn bind_command(&self, command: Command) -> BindOutcome {
        let deadline = Instant::now() + WRITE_DEADLINE;
        loop {
            let (slot, epoch, n_star) = match self.claim_slot() {
                Ok(claim) => claim,
                Err(outcome) => return outcome,
            };

            let drive = self
                .drive_slot(slot, epoch, n_star, command.clone(), false, deadline)
                .await;
            self.release_slot();

            match drive {
                DriveOutcome::Chosen { displaced: false } => return BindOutcome::Bound(slot),
                DriveOutcome::Chosen { displaced: true } => {
                    debug!(%slot, "slot went to an adopted value, rebinding command");
                }
                DriveOutcome::NotLeader => return BindOutcome::NotLeader(self.known_leader()),
                DriveOutcome::NoQuorum => {
                    self.unbound.lock().unwrap().push(slot);
                    return BindOutcome::NoQuorum;
                }
            }
        }
    }

    fn claim_slot(&self) -> Result<(Slot, Epoch, ProposalNum), BindOutcome> {
        let mut state = self.state.lock().unwrap();
        if state.role != Role::Leader {
            return Err(BindOutcome::NotLeader(state.leader));
        }
        let Some(n_star) = state.n_star else {
            // Elected but the epoch is not established yet.
            return Err(BindOutcome::NoQuorum);
        };
        if state.inflight >= self.config.pipeline_window {
            return Err(BindOutcome::Backpressure);
        }
        let slot = state.next_slot;
        state.next_slot = slot.next();
        state.inflight += 1;
        Ok((slot, state.epoch, n_star))
    }

    fn release_slot(&self) {
        let mut state = self.state.lock().unwrap();
        state.inflight = state.inflight.saturating_sub(1);
    }

    /// Drive one slot to a decision: Phase 2 under the epoch's floor, falling
    /// back to per-slot Phase 1 with a fresh number whenever a NACK shows a
    /// higher promise.
    #[instrument(skip_all, fields(%slot, %epoch))]
    async fn drive_slot(
        &self,
        slot: Slot,
        epoch: Epoch,
        n_star: ProposalNum,
        command: Command,
        phase1_first: bool,
        deadline: Instant,
    ) -> DriveOutcome {
        let mut proposal = n_star;
        let mut needs_phase1 = phase1_first;
        let mut displaced = false;
        let mut retries = 0u32;

        loop {
            if !self.is_current_leader(epoch) {
                trace!("epoch no longer current, dropping slot work");
                return DriveOutcome::NotLeader;
            }
            if Instant::now() >= deadline {
                return DriveOutcome::NoQuorum;
            }

            let mut instance = if needs_phase1 {
                SlotInstance::new(proposal, command.clone(), self.config.quorum)
            } else {
                SlotInstance::new_accepting(proposal, command.clone(), self.config.quorum)
            };

            let superseded = if needs_phase1 {
                match self.run_phase1(&mut instance, slot, epoch, deadline).await {
                    Phase1Run::Ready { displaced: d } => {
                        displaced |= d;
                        match self.run_phase2(&mut instance, slot, epoch, deadline).await {
                            Phase2Run::Chosen => return DriveOutcome::Chosen { displaced },
                            Phase2Run::Superseded(promised) => promised,
                            Phase2Run::NoQuorum => return DriveOutcome::NoQuorum,
                        }
                    }
                    Phase1Run::Superseded(promised) => promised,
                    Phase1Run::NoQuorum => return DriveOutcome::NoQuorum,
                }
            } else {
                match self.run_phase2(&mut instance, slot, epoch, deadline).await {
                    Phase2Run::Chosen => return DriveOutcome::Chosen { displaced },
                    Phase2Run::Superseded(promised) => promised,
                    Phase2Run::NoQuorum => return DriveOutcome::NoQuorum,
                }
            };

            // Outranked: absorb the round, back off, restart with Phase 1.
            debug!(%superseded, "slot superseded, restarting with phase 1");
            if let Err(report) = self.rounds.observe(superseded.round).await {
                warn!(?report, "failed to persist observed round");
                return DriveOutcome::NoQuorum;
            }
            let pause = {
                let mut rng = rand::rng();
                chorus_core::BackoffConfig::default().duration(retries, &mut rng)
            };
            tokio::time::sleep(pause).await;
            retries += 1;

            proposal = match self.rounds.next_proposal(self.config.id).await {
                Ok(proposal) => proposal,
                Err(report) => {
                    warn!(?report, "failed to persist next proposal round");
                    return DriveOutcome::NoQuorum;
                }
            };
            needs_phase1 = true;
        }
    }

    async fn run_phase1(
        &self,
        instance: &mut SlotInstance,
        slot: Slot,
        epoch: Epoch,
        deadline: Instant,
    ) -> Phase1Run {
        let request = PrepareRequest {
            slot,
            epoch,
            proposal_num: instance.proposal(),
            from_slot: None,
        };
        let mut pending = self.broadcast::<_, PrepareResponse>("/prepare", &request, deadline);

        while let Some((acceptor, result)) = pending.next().await {
            let Ok(response) = result else { continue };
            match response {
                PrepareResponse::Promise {
                    accepted_num,
                    accepted_val,
                    ..
                } => {
                    let accepted = accepted_num.zip(accepted_val);
                    if let PrepareStep::Ready { displaced, .. } =
                        instance.on_promise(acceptor, accepted)
                    {
                        return Phase1Run::Ready { displaced };
                    }
                }
                PrepareResponse::Nack { promised } => {
                    if let Some(promised) = instance.on_nack(promised) {
                        return Phase1Run::Superseded(promised);
                    }
                }
            }
        }
        Phase1Run::NoQuorum
    }

    async fn run_phase2(
        &self,
        instance: &mut SlotInstance,
        slot: Slot,
        epoch: Epoch,
        deadline: Instant,
    ) -> Phase2Run {
        let request = AcceptRequest {
            slot,
            epoch,
            proposal_num: instance.proposal(),
            value: instance.value().clone(),
        };
        let mut pending = self.broadcast::<_, AcceptResponse>("/accept", &request, deadline);

        while let Some((acceptor, result)) = pending.next().await {
            let Ok(response) = result else { continue };
            match response {
                AcceptResponse::Accepted => {
                    if let AcceptStep::Chosen { .. } = instance.on_accepted(acceptor) {
                        return Phase2Run::Chosen;
                    }
                }
                AcceptResponse::Nack { promised } => {
                    if let Some(promised) = instance.on_nack(promised) {
                        return Phase2Run::Superseded(promised);
                    }
                }
            }
        }
        Phase2Run::NoQuorum
    }

    /// Fan a request out to every acceptor. Each RPC retries transport
    /// failures with backoff until `deadline`; responses arrive in completion
    /// order tagged with the acceptor's directory index.
    pub(crate) fn broadcast<Req, Resp>(
        &self,
        path: &str,
        request: &Req,
        deadline: Instant,
    ) -> FuturesUnordered<BoxFuture<'static, (AcceptorId, Result<Resp, Report<RpcError>>)>>
    where
        Req: Serialize + Clone + Send + Sync + 'static,
        Resp: DeserializeOwned + Send + 'static,
    {
        self.config
            .acceptor_urls
            .iter()
            .enumerate()
            .map(|(index, url)| {
                let rpc = self.rpc.clone();
                let url = format!("{url}{path}");
                let request = request.clone();
                let future = async move {
                    #[allow(clippy::cast_possible_truncation)]
                    let id = AcceptorId(index as u32);
                    (
                        id,
                        rpc.post_json_retry::<_, Resp>(&url, &request, PER_TRY, deadline)
                            .await,
                    )
                };
                Box::pin(future) as BoxFuture<'static, _>
            })
            .collect()
    }

    // -- epoch establishment ------------------------------------------------

    /// The once-per-epoch ranged Phase 1, run right after winning the
    /// election: install a floor promise from the first unused slot, then
    /// complete every partially accepted value the quorum revealed, filling
    /// the holes between them with no-ops so the commit prefix stays dense.
    ///
    /// Returns false when the epoch could not be established; the caller
    /// must step down.
    #[instrument(skip_all, fields(%epoch))]
    pub(crate) async fn establish_epoch(&self, epoch: Epoch, elected: ProposalNum) -> bool {
        let mut n_star = elected;

        for attempt in 0..3u32 {
            if !self.is_current_leader(epoch) {
                return false;
            }
            let from = {
                let state = self.state.lock().unwrap();
                state.committed_up_to.next()
            };
            let deadline = Instant::now() + ADOPTION_DEADLINE;
            let request = PrepareRequest {
                slot: from,
                epoch,
                proposal_num: n_star,
                from_slot: Some(from),
            };

            let mut promises = 0usize;
            let mut adopted: BTreeMap<Slot, (ProposalNum, Command)> = BTreeMap::new();
            let mut highest_nack: Option<ProposalNum> = None;

            let mut pending = self.broadcast::<_, PrepareResponse>("/prepare", &request, deadline);
            while let Some((_, result)) = pending.next().await {
                let Ok(response) = result else { continue };
                match response {
                    PrepareResponse::Promise { accepted, .. } => {
                        promises += 1;
                        for entry in accepted {
                            match adopted.get(&entry.slot) {
                                Some((seen, _)) if *seen >= entry.accepted_num => {}
                                _ => {
                                    adopted.insert(
                                        entry.slot,
                                        (entry.accepted_num, entry.accepted_val),
                                    );
                                }
                            }
                        }
                        if promises >= self.config.quorum {
                            break;
                        }
                    }
                    PrepareResponse::Nack { promised } => {
                        highest_nack = highest_nack.max(Some(promised));
                    }
                }
            }
            drop(pending);

            if promises < self.config.quorum {
                if let Some(promised) = highest_nack.filter(|p| *p > n_star) {
                    debug!(%promised, attempt, "ranged phase 1 outranked, retrying higher");
                    if self.rounds.observe(promised.round).await.is_err() {
                        return false;
                    }
                    match self.rounds.next_proposal(self.config.id).await {
                        Ok(next) => n_star = next,
                        Err(_) => return false,
                    }
                    continue;
                }
                warn!(attempt, "no quorum for ranged phase 1");
                return false;
            }

            let highest_adopted = adopted.keys().next_back().copied();
            {
                let mut state = self.state.lock().unwrap();
                if state.role != Role::Leader || state.epoch != epoch {
                    return false;
                }
                state.n_star = Some(n_star);
                state.next_slot = highest_adopted.map_or(from, Slot::next).max(from);
            }
            info!(%from, ?highest_adopted, %n_star, "epoch established");

            return self.complete_adopted(epoch, n_star, from, adopted).await;
        }
        false
    }

    /// Finish Phase 2 for every revealed value and no-op the gaps between
    /// them. A previously chosen value is never rewritten: Phase 2 carries
    /// the highest accepted value each slot revealed.
    async fn complete_adopted(
        &self,
        epoch: Epoch,
        n_star: ProposalNum,
        from: Slot,
        adopted: BTreeMap<Slot, (ProposalNum, Command)>,
    ) -> bool {
        let Some(highest) = adopted.keys().next_back().copied() else {
            return true;
        };
        let deadline = Instant::now() + ADOPTION_DEADLINE;

        for slot in (from.0..=highest.0).map(Slot) {
            let value = adopted
                .get(&slot)
                .map_or(Command::Noop, |(_, value)| value.clone());
            let needs_phase1 = !adopted.contains_key(&slot);
            match self
                .drive_slot(slot, epoch, n_star, value, needs_phase1, deadline)
                .await
            {
                DriveOutcome::Chosen { .. } => {}
                DriveOutcome::NotLeader => return false,
                DriveOutcome::NoQuorum => {
                    warn!(%slot, "could not complete adopted slot");
                    return false;
                }
            }
        }
        true
    }

    // -- observation --------------------------------------------------------

    /// Fold a learner's status into our view: commit progress, and any
    /// higher-epoch leadership we should defer to.
    pub fn observe_learner_status(&self, status: &LearnerStatus) {
        let mut state = self.state.lock().unwrap();
        state.committed_up_to = state.committed_up_to.max(status.committed_up_to);
        if state.role != Role::Leader {
            // Never propose below a commit index a learner has reported.
            state.next_slot = state.next_slot.max(state.committed_up_to.next());
        }

        if status.epoch > state.epoch && status.leader != Some(self.config.id) {
            if state.role == Role::Leader {
                info!(epoch = %status.epoch, "stepping down: learner reports higher epoch");
            }
            state.follow(status.leader, status.epoch);
        }
    }

    /// Wait until some learner has committed through `slot`; returns that
    /// learner's base URL.
    pub(crate) async fn wait_for_commit(&self, slot: Slot, deadline: Instant) -> Option<String> {
        loop {
            for url in &self.config.learner_urls {
                let status: Result<LearnerStatus, _> = self
                    .rpc
                    .get_json(&format!("{url}/status"), STATUS_TIMEOUT)
                    .await;
                if let Ok(status) = status {
                    self.observe_learner_status(&status);
                    if status.committed_up_to >= slot {
                        return Some(url.clone());
                    }
                }
            }
            if Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    // -- strong reads -------------------------------------------------------

    /// Read through the log: bind a no-op, wait for a learner to commit past
    /// it, and read the key there. Never returns a value older than any
    /// acknowledged write.
    pub async fn strong_read(&self, key: String) -> LeaderReadResponse {
        match self.bind_command(Command::Noop).await {
            BindOutcome::Bound(slot) => {
                let deadline = Instant::now() + READ_DEADLINE;
                let Some(url) = self.wait_for_commit(slot, deadline).await else {
                    return LeaderReadResponse::Unavailable;
                };
                let request = ReadRequest {
                    key,
                    consistency_level: Consistency::Eventual,
                    client_id: None,
                    min_slot: Some(slot),
                };
                match self
                    .rpc
                    .post_json::<_, ReadResponse>(&format!("{url}/read"), &request, PER_TRY)
                    .await
                {
                    Ok(response) => LeaderReadResponse::Ok {
                        value: response.value,
                        slot: response.slot,
                    },
                    Err(report) => {
                        warn!(?report, "strong read failed at learner");
                        LeaderReadResponse::Unavailable
                    }
                }
            }
            BindOutcome::NotLeader(leader) => LeaderReadResponse::NotLeader { leader },
            BindOutcome::NoQuorum | BindOutcome::Backpressure => LeaderReadResponse::Unavailable,
        }
    }

    // -- hole reclaim -------------------------------------------------------

    /// Rebind slots that failed without a decision. Runs Phase 1 first so a
    /// value that did land on some acceptors is completed, not overwritten;
    /// truly empty slots get a no-op so the commit prefix can pass them.
    pub(crate) async fn reclaim_unbound(&self) {
        let slots: Vec<Slot> = std::mem::take(&mut *self.unbound.lock().unwrap());
        if slots.is_empty() {
            return;
        }
        let (epoch, n_star) = {
            let state = self.state.lock().unwrap();
            if state.role != Role::Leader {
                return;
            }
            match state.n_star {
                Some(n_star) => (state.epoch, n_star),
                None => return,
            }
        };

        for slot in slots {
            let committed = self.state.lock().unwrap().committed_up_to;
            if slot <= committed {
                continue;
            }
            let deadline = Instant::now() + ADOPTION_DEADLINE;
            match self
                .drive_slot(slot, epoch, n_star, Command::Noop, true, deadline)
                .await
            {
                DriveOutcome::Chosen { .. } => debug!(%slot, "reclaimed unbound slot"),
                DriveOutcome::NotLeader => return,
                DriveOutcome::NoQuorum => {
                    self.unbound.lock().unwrap().push(slot);
                }
            }
        }
    }
}
