//! Glue between the ledger, the subscription registry, and the cluster.

use std::sync::Arc;

use chorus_core::messages::{LearnerStatus, NotifyRequest, SyncEntry};
use chorus_core::{LearnerId, RpcClient};

use crate::ledger::Ledger;
use crate::notify::SubscriptionRegistry;

pub struct LearnerService {
    pub id: LearnerId,
    pub ledger: Ledger,
    pub subscriptions: SubscriptionRegistry,
    /// Peer learners (self excluded), used for sync.
    pub peer_urls: Vec<String>,
    pub acceptor_urls: Vec<String>,
    pub quorum: usize,
    pub rpc: RpcClient,
}

impl LearnerService {
    #[must_use]
    pub fn new(
        id: LearnerId,
        quorum: usize,
        peer_urls: Vec<String>,
        acceptor_urls: Vec<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            ledger: Ledger::new(quorum),
            subscriptions: SubscriptionRegistry::new(),
            peer_urls,
            acceptor_urls,
            quorum,
            rpc: RpcClient::new(),
        })
    }

    /// Apply one accept notification and publish whatever it committed.
    pub fn handle_notify(&self, notify: &NotifyRequest) {
        let events = self.ledger.observe_accept(notify);
        self.subscriptions.publish(&events);
    }

    /// Apply entries another learner proved chosen.
    pub fn apply_synced(&self, entries: Vec<SyncEntry>) {
        for entry in entries {
            let events = self.ledger.record_chosen(entry.slot, entry.value);
            self.subscriptions.publish(&events);
        }
    }

    #[must_use]
    pub fn status(&self) -> LearnerStatus {
        let (leader, epoch) = self.ledger.leader();
        LearnerStatus {
            learner_id: self.id,
            committed_up_to: self.ledger.committed_up_to(),
            highest_seen: self.ledger.highest_seen(),
            keys: self.ledger.keys(),
            leader,
            epoch,
            subscriptions: self.subscriptions.count(),
        }
    }
}
