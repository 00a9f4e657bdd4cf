//! Request handling for the acceptor: decisions via the durable store, plus
//! the ACCEPTED fan-out that keeps learners fed.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chorus_consensus::{AcceptOutcome, PrepareOutcome, RangedOutcome};
use chorus_core::messages::{
    AcceptRequest, AcceptResponse, AcceptedEntry, NotifyRequest, NotifyResponse, PrepareRequest,
    PrepareResponse,
};
use chorus_core::{AcceptorId, InstanceId, RpcClient, Slot, StoreFatal};
use error_stack::Report;
use tracing::{debug, instrument, trace, warn};

use crate::metrics::SharedMetrics;
use crate::store::SlotStore;

/// How long the fan-out keeps retrying one learner before giving up.
/// Delivery is at-least-once only in the aggregate; learner catch-up covers
/// anything dropped here.
const NOTIFY_DEADLINE: Duration = Duration::from_secs(5);
const NOTIFY_PER_TRY: Duration = Duration::from_secs(1);

#[derive(Clone)]
pub struct AcceptorService {
    pub id: AcceptorId,
    store: SlotStore,
    learners: Arc<[String]>,
    rpc: RpcClient,
    metrics: SharedMetrics,
}

impl AcceptorService {
    #[must_use]
    pub fn new(
        id: AcceptorId,
        store: SlotStore,
        learner_urls: Vec<String>,
        metrics: SharedMetrics,
    ) -> Self {
        Self {
            id,
            store,
            learners: learner_urls.into(),
            rpc: RpcClient::new(),
            metrics,
        }
    }

    #[must_use]
    pub fn store(&self) -> &SlotStore {
        &self.store
    }

    /// # Errors
    ///
    /// Returns [`StoreFatal`] when the promise could not be made durable.
    #[instrument(skip_all, fields(slot = %request.slot, n = %request.proposal_num))]
    pub async fn handle_prepare(
        &self,
        request: PrepareRequest,
    ) -> Result<PrepareResponse, Report<StoreFatal>> {
        self.metrics.metrics.prepares_total.inc();

        if let Some(from) = request.from_slot {
            return self.handle_prepare_ranged(from, request).await;
        }

        let id = InstanceId::from_wire(request.slot, request.epoch);
        match self.store.prepare(id, request.proposal_num).await? {
            PrepareOutcome::Promised { accepted } => {
                debug!("promised");
                self.metrics.metrics.promises_total.inc();
                let (accepted_num, accepted_val) = match accepted {
                    Some((num, value)) => (Some(num), Some(value)),
                    None => (None, None),
                };
                Ok(PrepareResponse::Promise {
                    accepted_num,
                    accepted_val,
                    accepted: vec![],
                })
            }
            PrepareOutcome::Nacked { promised } => {
                trace!(%promised, "prepare nacked");
                self.metrics.metrics.nacks_total.inc();
                Ok(PrepareResponse::Nack { promised })
            }
        }
    }

    async fn handle_prepare_ranged(
        &self,
        from: Slot,
        request: PrepareRequest,
    ) -> Result<PrepareResponse, Report<StoreFatal>> {
        match self.store.prepare_ranged(from, request.proposal_num).await? {
            RangedOutcome::Promised { accepted } => {
                debug!(%from, reported = accepted.len(), "ranged promise installed");
                self.metrics.metrics.promises_total.inc();
                let accepted = accepted
                    .into_iter()
                    .map(|(slot, accepted_num, accepted_val)| AcceptedEntry {
                        slot,
                        accepted_num,
                        accepted_val,
                    })
                    .collect();
                Ok(PrepareResponse::Promise {
                    accepted_num: None,
                    accepted_val: None,
                    accepted,
                })
            }
            RangedOutcome::Nacked { promised } => {
                trace!(%promised, "ranged prepare nacked");
                self.metrics.metrics.nacks_total.inc();
                Ok(PrepareResponse::Nack { promised })
            }
        }
    }

    /// # Errors
    ///
    /// Returns [`StoreFatal`] when the accept could not be made durable.
    #[instrument(skip_all, fields(slot = %request.slot, n = %request.proposal_num))]
    pub async fn handle_accept(
        &self,
        request: AcceptRequest,
    ) -> Result<AcceptResponse, Report<StoreFatal>> {
        self.metrics.metrics.accepts_total.inc();

        let id = InstanceId::from_wire(request.slot, request.epoch);
        match self
            .store
            .accept(id, request.proposal_num, request.value.clone())
            .await?
        {
            AcceptOutcome::Accepted => {
                debug!("accepted");
                self.metrics.metrics.accepted_total.inc();
                self.notify_learners(request);
                Ok(AcceptResponse::Accepted)
            }
            AcceptOutcome::Nacked { promised } => {
                trace!(%promised, "accept nacked");
                self.metrics.metrics.nacks_total.inc();
                Ok(AcceptResponse::Nack { promised })
            }
        }
    }

    /// Broadcast ACCEPTED to every learner. Fire-and-forget with bounded
    /// retries; the reply to the proposer never waits on this.
    fn notify_learners(&self, request: AcceptRequest) {
        let notify = NotifyRequest {
            slot: request.slot,
            epoch: request.epoch,
            acceptor_id: self.id,
            proposal_num: request.proposal_num,
            value: request.value,
        };

        for url in self.learners.iter() {
            let rpc = self.rpc.clone();
            let url = format!("{url}/notify");
            let notify = notify.clone();
            let metrics = self.metrics.clone();
            tokio::spawn(async move {
                let deadline = Instant::now() + NOTIFY_DEADLINE;
                match rpc
                    .post_json_retry::<_, NotifyResponse>(&url, &notify, NOTIFY_PER_TRY, deadline)
                    .await
                {
                    Ok(_) => trace!(url, slot = %notify.slot, "notified learner"),
                    Err(error) => {
                        metrics.metrics.notify_failures_total.inc();
                        warn!(url, slot = %notify.slot, ?error, "learner notify failed");
                    }
                }
            });
        }
    }

    #[must_use]
    pub fn accepted_range(&self, from: Slot, to: Slot) -> Vec<AcceptedEntry> {
        self.store
            .accepted_range(from, to)
            .into_iter()
            .map(|(slot, accepted_num, accepted_val)| AcceptedEntry {
                slot,
                accepted_num,
                accepted_val,
            })
            .collect()
    }
}
