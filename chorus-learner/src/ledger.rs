//! The learner's replicated-log state: accept tallies, the chosen-slot log,
//! its key-value projection, and the dense commit prefix.
//!
//! A single commit path advances `committed_up_to`; readers observe it
//! through a watch channel so blocked session and strong reads wake without
//! polling.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Instant;

use chorus_consensus::TallyBook;
use chorus_core::messages::{NotificationEvent, NotifyRequest, SyncEntry};
use chorus_core::{ClientId, Command, Epoch, InstanceId, ProposerId, Slot};
use tokio::sync::watch;
use tracing::{debug, trace, warn};

struct LedgerInner {
    tallies: TallyBook,
    /// Chosen values: a dense prefix up to `committed_up_to`, sparse beyond.
    log: BTreeMap<Slot, Command>,
    /// `key -> (value, slot of the write)`, the fold of the committed prefix.
    kv: HashMap<String, (String, Slot)>,
    committed_up_to: Slot,
    highest_seen: Option<Slot>,
    session_index: HashMap<ClientId, Slot>,
    leader: Option<ProposerId>,
    leader_epoch: Epoch,
}

pub struct Ledger {
    inner: Mutex<LedgerInner>,
    commit_tx: watch::Sender<Slot>,
}

impl Ledger {
    #[must_use]
    pub fn new(quorum: usize) -> Self {
        let (commit_tx, _) = watch::channel(Slot(0));
        Self {
            inner: Mutex::new(LedgerInner {
                tallies: TallyBook::new(quorum),
                log: BTreeMap::new(),
                kv: HashMap::new(),
                committed_up_to: Slot(0),
                highest_seen: None,
                session_index: HashMap::new(),
                leader: None,
                leader_epoch: Epoch(0),
            }),
            commit_tx,
        }
    }

    /// Feed one ACCEPTED notification. Returns the events committed as a
    /// consequence, in slot order.
    pub fn observe_accept(&self, notify: &NotifyRequest) -> Vec<NotificationEvent> {
        let instance = InstanceId::from_wire(notify.slot, notify.epoch);
        let mut inner = self.inner.lock().unwrap();

        if let InstanceId::Log(slot) = instance {
            inner.highest_seen = inner.highest_seen.max(Some(slot));
        }

        let Some((proposal, value)) = inner.tallies.record(
            instance,
            notify.acceptor_id,
            notify.proposal_num,
            notify.value.clone(),
        ) else {
            return vec![];
        };
        trace!(slot = %notify.slot, %proposal, "value chosen");

        match instance {
            InstanceId::Election(epoch) => {
                inner.track_leader(epoch, &value);
                vec![]
            }
            InstanceId::Log(slot) => {
                let events = inner.record_chosen(slot, value);
                self.publish_commit(&inner);
                events
            }
        }
    }

    /// Record a value already known to be chosen (peer sync or acceptor
    /// catch-up). Returns newly committed events, in slot order.
    pub fn record_chosen(&self, slot: Slot, value: Command) -> Vec<NotificationEvent> {
        if slot.is_election() {
            return vec![];
        }
        let mut inner = self.inner.lock().unwrap();
        inner.highest_seen = inner.highest_seen.max(Some(slot));
        let events = inner.record_chosen(slot, value);
        self.publish_commit(&inner);
        events
    }

    fn publish_commit(&self, inner: &LedgerInner) {
        self.commit_tx.send_if_modified(|current| {
            if *current == inner.committed_up_to {
                false
            } else {
                *current = inner.committed_up_to;
                true
            }
        });
    }

    /// Block until the commit prefix reaches `min`, or `deadline` passes.
    pub async fn wait_for_commit(&self, min: Slot, deadline: Instant) -> bool {
        let mut rx = self.commit_tx.subscribe();
        loop {
            if *rx.borrow_and_update() >= min {
                return true;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            match tokio::time::timeout(remaining, rx.changed()).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) | Err(_) => {
                    return *rx.borrow() >= min;
                }
            }
        }
    }

    /// `kv[key]` with the slot the value was written at (or the commit index
    /// when the key is absent).
    #[must_use]
    pub fn read(&self, key: &str) -> (Option<String>, Slot) {
        let inner = self.inner.lock().unwrap();
        match inner.kv.get(key) {
            Some((value, slot)) => (Some(value.clone()), *slot),
            None => (None, inner.committed_up_to),
        }
    }

    #[must_use]
    pub fn committed_up_to(&self) -> Slot {
        self.inner.lock().unwrap().committed_up_to
    }

    #[must_use]
    pub fn highest_seen(&self) -> Option<Slot> {
        self.inner.lock().unwrap().highest_seen
    }

    #[must_use]
    pub fn keys(&self) -> usize {
        self.inner.lock().unwrap().kv.len()
    }

    #[must_use]
    pub fn leader(&self) -> (Option<ProposerId>, Epoch) {
        let inner = self.inner.lock().unwrap();
        (inner.leader, inner.leader_epoch)
    }

    /// Session floor for a client: the larger of what the gateway carried
    /// and what this learner remembers.
    #[must_use]
    pub fn session_floor(&self, client: &ClientId, carried: Option<Slot>) -> Slot {
        let inner = self.inner.lock().unwrap();
        let stored = inner.session_index.get(client).copied().unwrap_or(Slot(0));
        stored.max(carried.unwrap_or(Slot(0)))
    }

    pub fn update_session(&self, client: &ClientId, slot: Slot) {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner.session_index.entry(client.clone()).or_insert(Slot(0));
        *entry = (*entry).max(slot);
    }

    /// Chosen entries in `[from, to]`, for peer sync.
    #[must_use]
    pub fn snapshot_range(&self, from: Slot, to: Slot) -> Vec<SyncEntry> {
        let inner = self.inner.lock().unwrap();
        inner
            .log
            .range(from..=to)
            .map(|(slot, value)| SyncEntry {
                slot: *slot,
                value: value.clone(),
            })
            .collect()
    }

    /// The missing stretch while a chosen slot waits beyond a gap:
    /// `(committed_up_to + 1, highest chosen - 1)`.
    #[must_use]
    pub fn gap_range(&self) -> Option<(Slot, Slot)> {
        let inner = self.inner.lock().unwrap();
        let highest = inner.log.keys().next_back().copied()?;
        (highest > inner.committed_up_to.next())
            .then(|| (inner.committed_up_to.next(), highest.prev()))
    }

    /// Slots in `[from, to]` with no chosen value yet.
    #[must_use]
    pub fn missing_in(&self, from: Slot, to: Slot) -> Vec<Slot> {
        let inner = self.inner.lock().unwrap();
        (from.0..=to.0)
            .map(Slot)
            .filter(|slot| !inner.log.contains_key(slot))
            .collect()
    }
}

impl LedgerInner {
    fn track_leader(&mut self, epoch: Epoch, value: &Command) {
        if let Command::Leader {
            proposer,
            epoch: named,
        } = value
        {
            if *named >= self.leader_epoch {
                debug!(leader = %proposer, epoch = %named, "leader chosen");
                self.leader = Some(*proposer);
                self.leader_epoch = *named;
            }
        } else {
            warn!(%epoch, "election instance chose a non-leader value");
        }
    }

    /// Insert a chosen value and advance the dense prefix as far as it goes.
    fn record_chosen(&mut self, slot: Slot, value: Command) -> Vec<NotificationEvent> {
        if slot <= self.committed_up_to {
            return vec![];
        }
        // Agreement makes a second chosen value at the same slot identical;
        // keep the first.
        self.log.entry(slot).or_insert(value);

        let mut events = Vec::new();
        loop {
            let next = self.committed_up_to.next();
            let Some(value) = self.log.get(&next).cloned() else {
                break;
            };
            if let Some(event) = self.apply(next, &value) {
                events.push(event);
            }
            self.committed_up_to = next;
            self.tallies.discard(InstanceId::Log(next));
        }
        events
    }

    fn apply(&mut self, slot: Slot, value: &Command) -> Option<NotificationEvent> {
        match value {
            Command::Put { key, value } => {
                trace!(%slot, key, "applied put");
                self.kv.insert(key.clone(), (value.clone(), slot));
                Some(NotificationEvent {
                    slot,
                    key: key.clone(),
                    value: Some(value.clone()),
                })
            }
            Command::Del { key } => {
                trace!(%slot, key, "applied delete");
                self.kv.remove(key);
                Some(NotificationEvent {
                    slot,
                    key: key.clone(),
                    value: None,
                })
            }
            Command::Noop => None,
            // A LEADER value never lands in a log slot; elections are
            // tracked separately.
            Command::Leader { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use chorus_core::{AcceptorId, ProposalNum, ProposerId};

    use super::*;

    fn notify(slot: u64, acceptor: u32, round: u64, value: Command) -> NotifyRequest {
        NotifyRequest {
            slot: Slot(slot),
            epoch: Epoch(1),
            acceptor_id: AcceptorId(acceptor),
            proposal_num: ProposalNum::new(round, ProposerId(1)),
            value,
        }
    }

    fn put(key: &str, value: &str) -> Command {
        Command::Put {
            key: key.into(),
            value: value.into(),
        }
    }

    #[test]
    fn commits_in_slot_order() {
        let ledger = Ledger::new(2);

        // Slot 2 reaches quorum before slot 1: it must wait in the log.
        assert!(ledger.observe_accept(&notify(2, 1, 1, put("b", "2"))).is_empty());
        assert!(ledger.observe_accept(&notify(2, 2, 1, put("b", "2"))).is_empty());
        assert_eq!(ledger.committed_up_to(), Slot(0));

        assert!(ledger.observe_accept(&notify(1, 1, 1, put("a", "1"))).is_empty());
        let events = ledger.observe_accept(&notify(1, 2, 1, put("a", "1")));

        // Both slots commit at once, in order.
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].slot, Slot(1));
        assert_eq!(events[1].slot, Slot(2));
        assert_eq!(ledger.committed_up_to(), Slot(2));
        assert_eq!(ledger.read("a").0, Some("1".into()));
        assert_eq!(ledger.read("b").0, Some("2".into()));
    }

    #[test]
    fn read_reports_write_slot() {
        let ledger = Ledger::new(1);
        ledger.observe_accept(&notify(1, 1, 1, put("x", "1")));
        ledger.observe_accept(&notify(2, 1, 1, put("x", "2")));
        assert_eq!(ledger.read("x"), (Some("2".into()), Slot(2)));
        assert_eq!(ledger.read("missing"), (None, Slot(2)));
    }

    #[test]
    fn delete_removes_key() {
        let ledger = Ledger::new(1);
        ledger.observe_accept(&notify(1, 1, 1, put("x", "1")));
        let events = ledger.observe_accept(&notify(2, 1, 1, Command::Del { key: "x".into() }));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].value, None);
        assert_eq!(ledger.read("x").0, None);
    }

    #[test]
    fn election_updates_leader_only() {
        let ledger = Ledger::new(1);
        let leader = Command::Leader {
            proposer: ProposerId(2),
            epoch: Epoch(1),
        };
        let events = ledger.observe_accept(&NotifyRequest {
            slot: Slot::ELECTION,
            epoch: Epoch(1),
            acceptor_id: AcceptorId(1),
            proposal_num: ProposalNum::new(1, ProposerId(2)),
            value: leader,
        });
        assert!(events.is_empty());
        assert_eq!(ledger.leader(), (Some(ProposerId(2)), Epoch(1)));
        assert_eq!(ledger.committed_up_to(), Slot(0));
        assert_eq!(ledger.keys(), 0);
    }

    #[test]
    fn gap_detection() {
        let ledger = Ledger::new(1);
        ledger.observe_accept(&notify(1, 1, 1, put("a", "1")));
        assert_eq!(ledger.gap_range(), None);

        ledger.observe_accept(&notify(4, 1, 1, put("d", "4")));
        assert_eq!(ledger.gap_range(), Some((Slot(2), Slot(3))));
        assert_eq!(ledger.missing_in(Slot(2), Slot(3)), vec![Slot(2), Slot(3)]);

        // Filling the gap commits through the waiting slot.
        ledger.record_chosen(Slot(2), put("b", "2"));
        ledger.record_chosen(Slot(3), Command::Noop);
        assert_eq!(ledger.committed_up_to(), Slot(4));
        assert_eq!(ledger.gap_range(), None);
    }

    #[test]
    fn noop_commits_without_event() {
        let ledger = Ledger::new(1);
        let events = ledger.observe_accept(&notify(1, 1, 1, Command::Noop));
        assert!(events.is_empty());
        assert_eq!(ledger.committed_up_to(), Slot(1));
    }

    #[test]
    fn session_floor_prefers_higher() {
        let ledger = Ledger::new(1);
        let client = ClientId("c1".into());
        assert_eq!(ledger.session_floor(&client, None), Slot(0));
        ledger.update_session(&client, Slot(5));
        assert_eq!(ledger.session_floor(&client, Some(Slot(3))), Slot(5));
        assert_eq!(ledger.session_floor(&client, Some(Slot(9))), Slot(9));
    }

    #[tokio::test]
    async fn wait_for_commit_wakes_on_advance() {
        let ledger = std::sync::Arc::new(Ledger::new(1));

        let waiter = {
            let ledger = ledger.clone();
            tokio::spawn(async move {
                let deadline = Instant::now() + std::time::Duration::from_secs(2);
                ledger.wait_for_commit(Slot(1), deadline).await
            })
        };

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        ledger.observe_accept(&notify(1, 1, 1, put("x", "1")));
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn wait_for_commit_times_out() {
        let ledger = Ledger::new(1);
        let deadline = Instant::now() + std::time::Duration::from_millis(30);
        assert!(!ledger.wait_for_commit(Slot(5), deadline).await);
    }
}
