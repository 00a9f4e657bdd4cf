//! Gap detection and catch-up.
//!
//! A periodic task watches for two situations: a chosen slot waiting beyond
//! a gap in our own log, and a peer whose commit prefix is ahead of ours
//! (which also covers a learner restarting from empty). Either way we first
//! ask peer learners to fill the range; whatever they cannot prove chosen is
//! re-derived from a quorum of acceptors via `queryAccepted`.

use std::sync::Arc;
use std::time::Duration;

use chorus_consensus::chosen_from_query;
use chorus_core::messages::{AcceptedEntry, LearnerStatus, SyncEntry, SyncRequest};
use chorus_core::{AcceptorId, Slot};
use tracing::{debug, info, trace, warn};

use crate::service::LearnerService;

const SYNC_PERIOD: Duration = Duration::from_secs(1);
const RPC_TIMEOUT: Duration = Duration::from_secs(2);

pub fn spawn(service: Arc<LearnerService>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(run(service))
}

async fn run(service: Arc<LearnerService>) {
    loop {
        tokio::time::sleep(SYNC_PERIOD).await;
        tick(&service).await;
    }
}

async fn tick(service: &LearnerService) {
    // A peer ahead of us defines a target even when our own log is silent.
    let mut target = service.ledger.gap_range().map(|(_, to)| to);
    for url in &service.peer_urls {
        let status: Result<LearnerStatus, _> = service
            .rpc
            .get_json(&format!("{url}/status"), RPC_TIMEOUT)
            .await;
        if let Ok(status) = status {
            target = target.max(Some(status.committed_up_to));
        }
    }

    let committed = service.ledger.committed_up_to();
    let Some(target) = target.filter(|target| *target > committed) else {
        return;
    };

    let from = committed.next();
    debug!(%from, %target, "catching up");
    sync_from_peers(service, from, target).await;

    // Anything peers could not prove chosen is re-derived from acceptors.
    let missing = service.ledger.missing_in(from, target);
    if !missing.is_empty() {
        query_acceptors(service, &missing).await;
    }
}

async fn sync_from_peers(service: &LearnerService, from: Slot, to: Slot) {
    let request = SyncRequest { from, to };
    for url in &service.peer_urls {
        let entries: Result<Vec<SyncEntry>, _> = service
            .rpc
            .post_json(&format!("{url}/sync"), &request, RPC_TIMEOUT)
            .await;
        match entries {
            Ok(entries) if !entries.is_empty() => {
                trace!(url, count = entries.len(), "peer sync delivered");
                service.apply_synced(entries);
                if service.ledger.missing_in(from, to).is_empty() {
                    return;
                }
            }
            Ok(_) => {}
            Err(report) => trace!(url, ?report, "peer sync failed"),
        }
    }
}

/// The fallback choice rule: a slot is provably chosen iff one value carries
/// the same proposal number on a quorum of acceptors.
async fn query_acceptors(service: &LearnerService, missing: &[Slot]) {
    let Some((&first, &last)) = missing.first().zip(missing.last()) else {
        return;
    };

    let mut per_acceptor: Vec<Vec<AcceptedEntry>> = Vec::new();
    for url in &service.acceptor_urls {
        let url = format!("{url}/accepted?from={}&to={}", first.0, last.0);
        match service.rpc.get_json::<Vec<AcceptedEntry>>(&url, RPC_TIMEOUT).await {
            Ok(entries) => per_acceptor.push(entries),
            Err(report) => {
                trace!(url, ?report, "queryAccepted failed");
                per_acceptor.push(vec![]);
            }
        }
    }

    for &slot in missing {
        let votes: Vec<_> = per_acceptor
            .iter()
            .enumerate()
            .flat_map(|(index, entries)| {
                entries
                    .iter()
                    .filter(move |entry| entry.slot == slot)
                    .map(move |entry| {
                        #[allow(clippy::cast_possible_truncation)]
                        let id = AcceptorId(index as u32);
                        (id, entry.accepted_num, entry.accepted_val.clone())
                    })
            })
            .collect();

        if let Some(value) = chosen_from_query(&votes, service.quorum) {
            info!(%slot, "slot re-derived from acceptors");
            let events = service.ledger.record_chosen(slot, value);
            service.subscriptions.publish(&events);
        } else {
            warn!(%slot, votes = votes.len(), "slot not provably chosen yet");
        }
    }
}
