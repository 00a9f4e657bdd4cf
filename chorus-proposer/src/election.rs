//! Leader election and the background loops that keep a proposer alive:
//! failure detection, heartbeats, learner polling, and hole reclaim.
//!
//! Election is ordinary Paxos on the slot-0 instance of the next epoch. A
//! candidate that adopts a rival's LEADER value completes it (helping the
//! rival win) and follows; a candidate whose own value is chosen takes the
//! epoch and establishes it over the log.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chorus_consensus::{AcceptStep, PrepareStep, SlotInstance};
use chorus_core::messages::{
    AcceptRequest, AcceptResponse, HeartbeatRequest, HeartbeatResponse, LearnerStatus,
    PrepareRequest, PrepareResponse,
};
use chorus_core::{Command, Epoch, ProposalNum, ProposerId, Role, Slot};
use futures::StreamExt;
use rand::Rng;
use tracing::{debug, info, instrument, trace, warn};

use crate::node::ProposerNode;

const ELECTION_DEADLINE: Duration = Duration::from_secs(3);
const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(1);

/// Spawn the proposer's background tasks. The returned handles let a harness
/// silence the node completely; a server just drops them.
pub fn spawn_background(node: Arc<ProposerNode>) -> Vec<tokio::task::JoinHandle<()>> {
    vec![
        tokio::spawn(election_monitor(node.clone())),
        tokio::spawn(heartbeat_loop(node.clone())),
        tokio::spawn(learner_poll_loop(node.clone())),
        tokio::spawn(reclaim_loop(node)),
    ]
}

/// Watch for leader silence and stand for election after a jittered pause,
/// so two candidates do not collide forever.
async fn election_monitor(node: Arc<ProposerNode>) {
    let timeout = node.config.leader_timeout;
    let check = (timeout / 4).max(Duration::from_millis(10));

    loop {
        tokio::time::sleep(check).await;

        if !heartbeat_stale(&node, timeout) {
            continue;
        }

        let jitter = {
            let mut rng = rand::rng();
            node.config
                .heartbeat_interval
                .mul_f64(rng.random_range(0.0..1.0))
        };
        tokio::time::sleep(jitter).await;

        if heartbeat_stale(&node, timeout) {
            run_election(&node).await;
        }
    }
}

fn heartbeat_stale(node: &ProposerNode, timeout: Duration) -> bool {
    let state = node.state.lock().unwrap();
    state.role == Role::Follower && state.last_heartbeat.elapsed() >= timeout
}

/// One full election attempt on `(slot 0, next epoch)`.
#[instrument(skip_all, fields(id = %node.config.id))]
async fn run_election(node: &Arc<ProposerNode>) {
    let target = {
        let mut state = node.state.lock().unwrap();
        if state.role != Role::Follower {
            return;
        }
        state.role = Role::Candidate;
        state.epoch.next()
    };
    info!(epoch = %target, "leader timeout, standing for election");

    if let Some(elected) = try_election(node, target).await {
        if node.establish_epoch(target, elected).await {
            info!(epoch = %target, "leadership established");
            return;
        }
        warn!(epoch = %target, "failed to establish epoch, stepping down");
    }

    let mut state = node.state.lock().unwrap();
    if state.role == Role::Candidate || (state.role == Role::Leader && state.epoch == target) {
        state.role = Role::Follower;
        state.n_star = None;
    }
}

/// Run Paxos on the election instance. Returns the winning proposal number
/// when our own LEADER value was chosen.
async fn try_election(node: &Arc<ProposerNode>, target: Epoch) -> Option<ProposalNum> {
    let id = node.config.id;
    let proposal = match node.rounds.next_proposal(id).await {
        Ok(proposal) => proposal,
        Err(report) => {
            warn!(?report, "could not persist election round");
            return None;
        }
    };
    let our_value = Command::Leader {
        proposer: id,
        epoch: target,
    };
    let mut instance = SlotInstance::new(proposal, our_value, node.config.quorum);
    let deadline = Instant::now() + ELECTION_DEADLINE;

    // Phase 1 on the election instance.
    let request = PrepareRequest {
        slot: Slot::ELECTION,
        epoch: target,
        proposal_num: proposal,
        from_slot: None,
    };
    let mut ready = false;
    let mut pending = node.broadcast::<_, PrepareResponse>("/prepare", &request, deadline);
    while let Some((acceptor, result)) = pending.next().await {
        let Ok(response) = result else { continue };
        match response {
            PrepareResponse::Promise {
                accepted_num,
                accepted_val,
                ..
            } => {
                let accepted = accepted_num.zip(accepted_val);
                if let PrepareStep::Ready { .. } = instance.on_promise(acceptor, accepted) {
                    ready = true;
                    break;
                }
            }
            PrepareResponse::Nack { promised } => {
                if let Some(promised) = instance.on_nack(promised) {
                    debug!(%promised, "election outranked in phase 1");
                    let _ = node.rounds.observe(promised.round).await;
                    return None;
                }
            }
        }
    }
    drop(pending);
    if !ready {
        debug!("no quorum of promises for election");
        return None;
    }

    // Phase 2 with whichever LEADER value Phase 1 settled on.
    let value = instance.value().clone();
    let request = AcceptRequest {
        slot: Slot::ELECTION,
        epoch: target,
        proposal_num: proposal,
        value: value.clone(),
    };
    let mut chosen = false;
    let mut pending = node.broadcast::<_, AcceptResponse>("/accept", &request, deadline);
    while let Some((acceptor, result)) = pending.next().await {
        let Ok(response) = result else { continue };
        match response {
            AcceptResponse::Accepted => {
                if let AcceptStep::Chosen { .. } = instance.on_accepted(acceptor) {
                    chosen = true;
                    break;
                }
            }
            AcceptResponse::Nack { promised } => {
                if let Some(promised) = instance.on_nack(promised) {
                    debug!(%promised, "election outranked in phase 2");
                    let _ = node.rounds.observe(promised.round).await;
                    return None;
                }
            }
        }
    }
    drop(pending);
    if !chosen {
        debug!("no quorum of accepts for election");
        return None;
    }

    match value {
        Command::Leader { proposer, epoch } if proposer == id => {
            let mut state = node.state.lock().unwrap();
            if state.role != Role::Candidate {
                return None;
            }
            state.role = Role::Leader;
            state.leader = Some(id);
            state.epoch = epoch;
            state.next_slot = state.next_slot.max(state.committed_up_to.next());
            state.last_heartbeat = Instant::now();
            Some(proposal)
        }
        Command::Leader { proposer, epoch } => {
            // We completed a rival's election; follow them.
            info!(leader = %proposer, %epoch, "adopted rival's election, following");
            node.state.lock().unwrap().follow(Some(proposer), epoch);
            None
        }
        _ => {
            warn!("election instance chose a non-leader value");
            None
        }
    }
}

/// Announce leadership every `HEARTBEAT_INTERVAL`. The loop runs for the
/// node's lifetime and checks the role each tick, so a deposed leader never
/// sends another beat.
async fn heartbeat_loop(node: Arc<ProposerNode>) {
    let mut interval = tokio::time::interval(node.config.heartbeat_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        interval.tick().await;

        let heartbeat = {
            let state = node.state.lock().unwrap();
            if state.role != Role::Leader {
                continue;
            }
            HeartbeatRequest {
                proposer_id: node.config.id,
                epoch: state.epoch,
                committed_up_to: state.committed_up_to,
            }
        };

        for (index, url) in node.config.proposer_urls.iter().enumerate() {
            #[allow(clippy::cast_possible_truncation)]
            let peer = ProposerId(index as u32 + 1);
            if peer == node.config.id {
                continue;
            }
            let rpc = node.rpc.clone();
            let url = format!("{url}/heartbeat");
            tokio::spawn(async move {
                match rpc
                    .post_json::<_, HeartbeatResponse>(&url, &heartbeat, HEARTBEAT_TIMEOUT)
                    .await
                {
                    Ok(_) => trace!(url, "heartbeat acked"),
                    Err(report) => trace!(url, ?report, "heartbeat undelivered"),
                }
            });
        }
    }
}

/// Apply an incoming heartbeat to the role state machine.
pub fn handle_heartbeat(node: &ProposerNode, heartbeat: HeartbeatRequest) -> HeartbeatResponse {
    let mut state = node.state.lock().unwrap();

    if heartbeat.epoch > state.epoch {
        if state.role == Role::Leader {
            info!(
                from = %heartbeat.proposer_id,
                epoch = %heartbeat.epoch,
                "heartbeat from higher epoch, stepping down"
            );
        }
        state.follow(Some(heartbeat.proposer_id), heartbeat.epoch);
    } else if heartbeat.epoch == state.epoch && state.role != Role::Leader {
        state.leader = Some(heartbeat.proposer_id);
        state.last_heartbeat = Instant::now();
        if state.role == Role::Candidate {
            state.role = Role::Follower;
        }
    }

    state.committed_up_to = state.committed_up_to.max(heartbeat.committed_up_to);
    if state.role != Role::Leader {
        state.next_slot = state.next_slot.max(state.committed_up_to.next());
    }

    HeartbeatResponse { ack: true }
}

/// Track commit progress (and any newer leadership) from learner status.
async fn learner_poll_loop(node: Arc<ProposerNode>) {
    let period = node.config.heartbeat_interval.max(Duration::from_millis(100));
    loop {
        tokio::time::sleep(period).await;
        for url in &node.config.learner_urls {
            let status: Result<LearnerStatus, _> = node
                .rpc
                .get_json(&format!("{url}/status"), HEARTBEAT_TIMEOUT)
                .await;
            if let Ok(status) = status {
                node.observe_learner_status(&status);
            }
        }
    }
}

/// Periodically rebind slots that failed without a decision.
async fn reclaim_loop(node: Arc<ProposerNode>) {
    loop {
        tokio::time::sleep(Duration::from_secs(1)).await;
        node.reclaim_unbound().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeConfig;
    use crate::state::RoundStore;

    async fn test_node() -> Arc<ProposerNode> {
        let dir = tempfile::tempdir().unwrap();
        let rounds = RoundStore::open(dir.path()).await.unwrap();
        ProposerNode::new(
            NodeConfig {
                id: ProposerId(1),
                acceptor_urls: vec![],
                proposer_urls: vec!["http://p1:1".into(), "http://p2:2".into()],
                learner_urls: vec![],
                quorum: 2,
                heartbeat_interval: Duration::from_millis(50),
                leader_timeout: Duration::from_millis(150),
                pipeline_window: 4,
            },
            rounds,
        )
    }

    #[tokio::test]
    async fn heartbeat_with_higher_epoch_demotes_leader() {
        let node = test_node().await;
        {
            let mut state = node.state.lock().unwrap();
            state.role = Role::Leader;
            state.epoch = Epoch(1);
            state.leader = Some(ProposerId(1));
        }

        let response = handle_heartbeat(
            &node,
            HeartbeatRequest {
                proposer_id: ProposerId(2),
                epoch: Epoch(2),
                committed_up_to: Slot(5),
            },
        );
        assert!(response.ack);

        let status = node.status();
        assert_eq!(status.role, Role::Follower);
        assert_eq!(status.epoch, Epoch(2));
        assert_eq!(status.leader, Some(ProposerId(2)));
        assert_eq!(status.committed_up_to, Slot(5));
        // Never propose below a reported commit index.
        assert!(status.next_slot >= Slot(6));
    }

    #[tokio::test]
    async fn stale_heartbeat_does_not_reset_leadership() {
        let node = test_node().await;
        {
            let mut state = node.state.lock().unwrap();
            state.role = Role::Leader;
            state.epoch = Epoch(3);
            state.leader = Some(ProposerId(1));
        }

        handle_heartbeat(
            &node,
            HeartbeatRequest {
                proposer_id: ProposerId(2),
                epoch: Epoch(2),
                committed_up_to: Slot(0),
            },
        );

        let status = node.status();
        assert_eq!(status.role, Role::Leader);
        assert_eq!(status.epoch, Epoch(3));
    }

    #[tokio::test]
    async fn candidate_returns_to_follower_on_current_heartbeat() {
        let node = test_node().await;
        {
            let mut state = node.state.lock().unwrap();
            state.role = Role::Candidate;
            state.epoch = Epoch(2);
        }

        handle_heartbeat(
            &node,
            HeartbeatRequest {
                proposer_id: ProposerId(2),
                epoch: Epoch(2),
                committed_up_to: Slot(0),
            },
        );

        assert_eq!(node.status().role, Role::Follower);
        assert_eq!(node.status().leader, Some(ProposerId(2)));
    }
}
