//! End-to-end cluster scenarios: real HTTP between in-process nodes.
//!
//! Timings are deliberately loose (short heartbeats, long polling windows)
//! so the tests stay stable on slow machines.

use std::time::Duration;

use chorus_core::messages::{
    AcceptRequest, AcceptResponse, GatewayReadRequest, LearnerStatus, NotificationEvent,
    ProposerStatus, ReadResponse, SubscribeRequest, SubscribeResponse, UnsubscribeRequest,
    UnsubscribeResponse, WriteRequest, WriteResponse,
};
use chorus_core::{ClientId, Command, Consistency, Epoch, ProposalNum, ProposerId, Role, Slot};
use chorus_testing::{ClusterOptions, TestCluster, init_tracing, wait_for};

const RPC: Duration = Duration::from_secs(2);
/// Gateway calls carry their own 10s deadline; give them room.
const CALL: Duration = Duration::from_secs(12);
const SETTLE: Duration = Duration::from_secs(15);

async fn wait_for_leader(cluster: &TestCluster) -> (ProposerId, Epoch) {
    wait_for(SETTLE, || async {
        for url in &cluster.proposer_urls {
            let status = cluster
                .rpc
                .get_json::<ProposerStatus>(&format!("{url}/status"), RPC)
                .await;
            if let Ok(status) = status
                && status.role == Role::Leader
            {
                return Some((status.proposer_id, status.epoch));
            }
        }
        None
    })
    .await
    .expect("a leader should emerge")
}

async fn write(
    cluster: &TestCluster,
    key: &str,
    value: &str,
    client: Option<&str>,
) -> WriteResponse {
    let request = WriteRequest {
        key: key.into(),
        value: Some(value.into()),
        client_id: client.map(|c| ClientId(c.into())),
    };
    let url = format!("{}/write", cluster.gateway_url);
    wait_for(SETTLE, || async {
        cluster
            .rpc
            .post_json::<_, WriteResponse>(&url, &request, CALL)
            .await
            .ok()
    })
    .await
    .expect("write should succeed")
}

async fn read(
    cluster: &TestCluster,
    key: &str,
    consistency: Consistency,
    client: Option<&str>,
) -> ReadResponse {
    let request = GatewayReadRequest {
        key: key.into(),
        consistency_level: consistency,
        client_id: client.map(|c| ClientId(c.into())),
    };
    let url = format!("{}/read", cluster.gateway_url);
    wait_for(SETTLE, || async {
        cluster
            .rpc
            .post_json::<_, ReadResponse>(&url, &request, CALL)
            .await
            .ok()
    })
    .await
    .expect("read should succeed")
}

async fn learner_status(cluster: &TestCluster, index: usize) -> Option<LearnerStatus> {
    let url = format!("{}/status", cluster.learner_urls[index]);
    cluster.rpc.get_json(&url, RPC).await.ok()
}

#[tokio::test(flavor = "multi_thread")]
async fn single_write_commits_everywhere() {
    let _guard = init_tracing();
    let cluster = TestCluster::start(ClusterOptions::default()).await;
    wait_for_leader(&cluster).await;

    let ack = write(&cluster, "x", "1", Some("c1")).await;
    assert!(ack.slot >= Slot(1));

    // A strong read immediately after the write must see it.
    let response = read(&cluster, "x", Consistency::Strong, Some("c1")).await;
    assert_eq!(response.value.as_deref(), Some("1"));

    // Both learners converge on the committed slot.
    for index in 0..2 {
        let caught_up = wait_for(SETTLE, || async {
            let status = learner_status(&cluster, index).await?;
            (status.committed_up_to >= ack.slot).then_some(())
        })
        .await;
        assert!(caught_up.is_some(), "learner {index} never committed");
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn acceptor_failure_is_tolerated() {
    let _guard = init_tracing();
    let mut cluster = TestCluster::start(ClusterOptions::default()).await;
    wait_for_leader(&cluster).await;

    write(&cluster, "x", "1", None).await;

    // One acceptor down leaves a quorum of two.
    cluster.stop_acceptor(2);

    let ack = write(&cluster, "x", "2", None).await;
    let response = read(&cluster, "x", Consistency::Strong, None).await;
    assert_eq!(response.value.as_deref(), Some("2"));
    assert!(response.slot >= ack.slot);
}

#[tokio::test(flavor = "multi_thread")]
async fn leader_failover_elects_new_epoch() {
    let _guard = init_tracing();
    let mut cluster = TestCluster::start(ClusterOptions::default()).await;
    let (old_leader, old_epoch) = wait_for_leader(&cluster).await;

    write(&cluster, "x", "1", None).await;

    // Silence the leader entirely; the survivor must take over.
    cluster.stop_proposer(old_leader.0 as usize - 1);

    let (new_leader, new_epoch) = wait_for(SETTLE, || async {
        for url in &cluster.proposer_urls {
            let status = cluster
                .rpc
                .get_json::<ProposerStatus>(&format!("{url}/status"), RPC)
                .await;
            if let Ok(status) = status
                && status.role == Role::Leader
                && status.proposer_id != old_leader
            {
                return Some((status.proposer_id, status.epoch));
            }
        }
        None
    })
    .await
    .expect("a new leader should emerge after failover");

    assert_ne!(new_leader, old_leader);
    assert!(new_epoch > old_epoch);

    // Writes keep working through the new leader; nothing committed is lost.
    write(&cluster, "y", "a", None).await;
    let x = read(&cluster, "x", Consistency::Strong, None).await;
    assert_eq!(x.value.as_deref(), Some("1"));
    let y = read(&cluster, "y", Consistency::Strong, None).await;
    assert_eq!(y.value.as_deref(), Some("a"));
}

#[tokio::test(flavor = "multi_thread")]
async fn partially_accepted_value_is_adopted_by_new_leader() {
    let _guard = init_tracing();
    let mut cluster = TestCluster::start(ClusterOptions::default()).await;
    let (leader, epoch) = wait_for_leader(&cluster).await;

    let ack = write(&cluster, "k1", "v1", None).await;
    for index in 0..2 {
        wait_for(SETTLE, || async {
            let status = learner_status(&cluster, index).await?;
            (status.committed_up_to >= ack.slot).then_some(())
        })
        .await
        .expect("learners commit the first write");
    }

    // Stop the acceptor we will NOT seed, so any later promise quorum must
    // include the seeded one.
    cluster.stop_acceptor(2);

    // A value accepted by a single acceptor: not chosen, invisible to the
    // learners, but a new leader's Phase 1 must adopt and complete it.
    let seed = AcceptRequest {
        slot: ack.slot.next(),
        epoch,
        proposal_num: ProposalNum::new(500, ProposerId(9)),
        value: Command::Put {
            key: "k2".into(),
            value: "adopted".into(),
        },
    };
    let seeded: AcceptResponse = cluster
        .rpc
        .post_json(
            &format!("{}/accept", cluster.acceptor_urls[0]),
            &seed,
            RPC,
        )
        .await
        .expect("seed accept");
    assert_eq!(seeded, AcceptResponse::Accepted);

    cluster.stop_proposer(leader.0 as usize - 1);

    // The new leader completes the adopted value; both learners commit it.
    let response = wait_for(SETTLE, || async {
        let response = read(&cluster, "k2", Consistency::Eventual, None).await;
        response.value.is_some().then_some(response)
    })
    .await
    .expect("adopted value should commit");
    assert_eq!(response.value.as_deref(), Some("adopted"));
    assert_eq!(response.slot, ack.slot.next());

    // New client commands land after the adopted slot.
    let next = write(&cluster, "k3", "v3", None).await;
    assert!(next.slot > ack.slot.next());
}

#[tokio::test(flavor = "multi_thread")]
async fn restarted_learner_catches_up_via_sync() {
    let _guard = init_tracing();
    let mut cluster = TestCluster::start(ClusterOptions {
        delayed_learners: vec![1],
        ..ClusterOptions::default()
    })
    .await;
    wait_for_leader(&cluster).await;

    let mut last = Slot(0);
    for i in 0..10 {
        let ack = write(&cluster, &format!("key{i}"), &format!("value{i}"), None).await;
        last = last.max(ack.slot);
    }

    // Let the acceptors' notify retries toward the dark learner expire, so
    // convergence below comes from learner-to-learner sync.
    tokio::time::sleep(Duration::from_secs(6)).await;

    cluster.serve_learner(1);

    let status = wait_for(SETTLE, || async {
        let status = learner_status(&cluster, 1).await?;
        (status.committed_up_to >= last).then_some(status)
    })
    .await
    .expect("late learner should converge");

    let reference = learner_status(&cluster, 0).await.expect("learner 0 status");
    assert_eq!(status.committed_up_to, reference.committed_up_to);
    assert_eq!(status.keys, reference.keys);

    // All ten writes are readable from the caught-up learner, in order.
    for i in 0..10 {
        let request = chorus_core::messages::ReadRequest {
            key: format!("key{i}"),
            consistency_level: Consistency::Eventual,
            client_id: None,
            min_slot: None,
        };
        let response: ReadResponse = cluster
            .rpc
            .post_json(
                &format!("{}/read", cluster.learner_urls[1]),
                &request,
                RPC,
            )
            .await
            .expect("direct learner read");
        assert_eq!(response.value, Some(format!("value{i}")));
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn session_read_observes_own_write() {
    let _guard = init_tracing();
    let cluster = TestCluster::start(ClusterOptions::default()).await;
    wait_for_leader(&cluster).await;

    let ack = write(&cluster, "mine", "fresh", Some("session-client")).await;
    let response = read(&cluster, "mine", Consistency::Session, Some("session-client")).await;
    assert_eq!(response.value.as_deref(), Some("fresh"));
    assert!(response.slot >= ack.slot);
}

#[tokio::test(flavor = "multi_thread")]
async fn quorum_loss_blocks_writes() {
    let _guard = init_tracing();
    let mut cluster = TestCluster::start(ClusterOptions::default()).await;
    wait_for_leader(&cluster).await;

    write(&cluster, "x", "1", None).await;

    // One acceptor is below quorum: the write must fail with a retriable
    // error instead of hanging forever.
    cluster.stop_acceptor(1);
    cluster.stop_acceptor(2);

    let request = WriteRequest {
        key: "x".into(),
        value: Some("2".into()),
        client_id: None,
    };
    let result = cluster
        .rpc
        .post_json::<_, WriteResponse>(&format!("{}/write", cluster.gateway_url), &request, CALL)
        .await;
    assert!(result.is_err(), "write without quorum must not be acked");

    // Already-chosen state is still served.
    let response = read(&cluster, "x", Consistency::Eventual, None).await;
    assert_eq!(response.value.as_deref(), Some("1"));
}

#[tokio::test(flavor = "multi_thread")]
async fn subscriptions_deliver_committed_events_in_order() {
    let _guard = init_tracing();
    let cluster = TestCluster::start(ClusterOptions::default()).await;
    wait_for_leader(&cluster).await;

    let subscribe = SubscribeRequest {
        client_id: ClientId("watcher".into()),
        patterns: vec!["user:*".into()],
    };
    let placed: SubscribeResponse = cluster
        .rpc
        .post_json(
            &format!("{}/subscribe", cluster.gateway_url),
            &subscribe,
            RPC,
        )
        .await
        .expect("subscribe");
    let learner = placed.learner.clone().expect("owning learner");

    write(&cluster, "user:1", "alice", None).await;
    write(&cluster, "ignored", "zzz", None).await;
    write(&cluster, "user:2", "bob", None).await;

    let drain_url = format!(
        "{learner}/notifications?subscriptionId={}",
        placed.subscription_id
    );
    let deadline = std::time::Instant::now() + SETTLE;
    let mut seen: Vec<NotificationEvent> = Vec::new();
    loop {
        let events: Vec<NotificationEvent> = cluster
            .rpc
            .get_json(&drain_url, RPC)
            .await
            .unwrap_or_default();
        seen.extend(events);
        if seen.len() >= 2 {
            break;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "subscription should deliver both matching events"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    assert_eq!(seen[0].key, "user:1");
    assert_eq!(seen[1].key, "user:2");
    assert!(seen[0].slot < seen[1].slot);
    assert!(seen.iter().all(|event| event.key.starts_with("user:")));

    let removed: UnsubscribeResponse = cluster
        .rpc
        .post_json(
            &format!("{}/unsubscribe", cluster.gateway_url),
            &UnsubscribeRequest {
                subscription_id: placed.subscription_id,
            },
            RPC,
        )
        .await
        .expect("unsubscribe");
    assert_eq!(removed, UnsubscribeResponse::Removed);
}
