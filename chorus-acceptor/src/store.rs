//! Persistent acceptor state using fjall.
//!
//! The voting state lives in memory ([`AcceptorCore`]) and is written through
//! to three keyspaces before any affirmative reply leaves the node: `slots`
//! (big-endian slot -> record), `elections` (big-endian epoch -> record), and
//! `meta` (the ranged-promise floor). The LSM's own write-ahead log plus
//! compaction provides the journal-and-compacted-state layout; a restart
//! rebuilds the core exactly by scanning the keyspaces.
//!
//! Every write is a scoped critical section: take the core lock, decide,
//! write, fsync (`PersistMode::SyncAll`), release, and only then reply. The
//! lock is never held across network I/O.

use std::path::Path;
use std::sync::{Arc, Mutex};

use chorus_consensus::{AcceptOutcome, AcceptorCore, PrepareOutcome, RangedOutcome, SlotRecord};
use chorus_core::{Command, Epoch, InstanceId, ProposalNum, Slot, StoreFatal};
use error_stack::{Report, ResultExt};
use fjall::{Database, Keyspace, PersistMode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const FLOOR_KEY: &[u8] = b"floor";

#[derive(Debug, Serialize, Deserialize)]
struct DiskRecord {
    promised: Option<ProposalNum>,
    accepted: Option<(ProposalNum, Command)>,
}

impl From<&SlotRecord> for DiskRecord {
    fn from(record: &SlotRecord) -> Self {
        Self {
            promised: record.promised,
            accepted: record.accepted.clone(),
        }
    }
}

impl From<DiskRecord> for SlotRecord {
    fn from(disk: DiskRecord) -> Self {
        Self {
            promised: disk.promised,
            accepted: disk.accepted,
        }
    }
}

/// Disk space used per keyspace, reported by `/metrics`.
#[derive(Debug, Clone, Copy)]
pub struct StorageSizes {
    pub slots_bytes: u64,
    pub elections_bytes: u64,
    pub meta_bytes: u64,
}

struct StoreInner {
    db: Database,
    slots: Keyspace,
    elections: Keyspace,
    meta: Keyspace,
    core: Mutex<AcceptorCore>,
}

/// Shared handle to the durable voting state.
#[derive(Clone)]
pub struct SlotStore {
    inner: Arc<StoreInner>,
}

impl SlotStore {
    /// Open (or create) the store and replay persisted records.
    ///
    /// # Errors
    ///
    /// Returns [`StoreFatal`] if the database cannot be opened or decoded.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, Report<StoreFatal>> {
        let path = path.as_ref().to_owned();
        tokio::task::spawn_blocking(move || Self::open_sync(&path))
            .await
            .expect("spawn_blocking panicked")
    }

    fn open_sync(path: &Path) -> Result<Self, Report<StoreFatal>> {
        let db = Database::builder(path)
            .open()
            .change_context(StoreFatal)
            .attach_printable_lazy(|| format!("opening {}", path.display()))?;

        let slots = db
            .keyspace("slots", fjall::KeyspaceCreateOptions::default)
            .change_context(StoreFatal)?;
        let elections = db
            .keyspace("elections", fjall::KeyspaceCreateOptions::default)
            .change_context(StoreFatal)?;
        let meta = db
            .keyspace("meta", fjall::KeyspaceCreateOptions::default)
            .change_context(StoreFatal)?;

        let mut records = BTreeMap::new();
        for guard in slots.iter() {
            let (key, value) = guard.into_inner().change_context(StoreFatal)?;
            let slot = parse_u64_key(&key).ok_or_else(|| Report::new(StoreFatal))?;
            let disk: DiskRecord = postcard::from_bytes(&value).change_context(StoreFatal)?;
            records.insert(InstanceId::Log(Slot(slot)), disk.into());
        }
        for guard in elections.iter() {
            let (key, value) = guard.into_inner().change_context(StoreFatal)?;
            let epoch = parse_u64_key(&key).ok_or_else(|| Report::new(StoreFatal))?;
            let disk: DiskRecord = postcard::from_bytes(&value).change_context(StoreFatal)?;
            records.insert(InstanceId::Election(Epoch(epoch)), disk.into());
        }

        let floor = match meta.get(FLOOR_KEY).change_context(StoreFatal)? {
            Some(bytes) => {
                Some(postcard::from_bytes::<(Slot, ProposalNum)>(&bytes).change_context(StoreFatal)?)
            }
            None => None,
        };

        let core = AcceptorCore::from_parts(records, floor);

        Ok(Self {
            inner: Arc::new(StoreInner {
                db,
                slots,
                elections,
                meta,
                core: Mutex::new(core),
            }),
        })
    }

    /// Phase 1 for a single instance. Durable before the outcome is returned.
    ///
    /// # Errors
    ///
    /// Returns [`StoreFatal`] if persistence fails; no affirmative reply may
    /// be sent in that case.
    pub async fn prepare(
        &self,
        id: InstanceId,
        proposal: ProposalNum,
    ) -> Result<PrepareOutcome, Report<StoreFatal>> {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let mut core = inner.core.lock().unwrap();
            let outcome = core.prepare(id, proposal);
            if matches!(outcome, PrepareOutcome::Promised { .. }) {
                inner.persist_record(id, &core.record(id))?;
            }
            Ok(outcome)
        })
        .await
        .expect("spawn_blocking panicked")
    }

    /// Ranged Phase 1: raise the floor over every log slot >= `from`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreFatal`] if persistence fails.
    pub async fn prepare_ranged(
        &self,
        from: Slot,
        proposal: ProposalNum,
    ) -> Result<RangedOutcome, Report<StoreFatal>> {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let mut core = inner.core.lock().unwrap();
            let outcome = core.prepare_ranged(from, proposal);
            if matches!(outcome, RangedOutcome::Promised { .. }) {
                let floor = core.floor().expect("floor set by successful ranged prepare");
                let bytes = postcard::to_allocvec(&floor).change_context(StoreFatal)?;
                inner.meta.insert(FLOOR_KEY, &bytes).change_context(StoreFatal)?;
                inner
                    .db
                    .persist(PersistMode::SyncAll)
                    .change_context(StoreFatal)?;
            }
            Ok(outcome)
        })
        .await
        .expect("spawn_blocking panicked")
    }

    /// Phase 2 for a single instance. Durable before the outcome is returned.
    ///
    /// # Errors
    ///
    /// Returns [`StoreFatal`] if persistence fails.
    pub async fn accept(
        &self,
        id: InstanceId,
        proposal: ProposalNum,
        value: Command,
    ) -> Result<AcceptOutcome, Report<StoreFatal>> {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let mut core = inner.core.lock().unwrap();
            let outcome = core.accept(id, proposal, value);
            if matches!(outcome, AcceptOutcome::Accepted) {
                inner.persist_record(id, &core.record(id))?;
            }
            Ok(outcome)
        })
        .await
        .expect("spawn_blocking panicked")
    }

    /// Read-only scan of accepted log slots for learner catch-up.
    #[must_use]
    pub fn accepted_range(&self, from: Slot, to: Slot) -> Vec<(Slot, ProposalNum, Command)> {
        self.inner.core.lock().unwrap().accepted_range(from, to)
    }

    #[must_use]
    pub fn recorded_slots(&self) -> u64 {
        self.inner.core.lock().unwrap().recorded_slots()
    }

    #[must_use]
    pub fn highest_log_slot(&self) -> Option<Slot> {
        self.inner.core.lock().unwrap().highest_log_slot()
    }

    #[must_use]
    pub fn storage_sizes(&self) -> StorageSizes {
        StorageSizes {
            slots_bytes: self.inner.slots.disk_space(),
            elections_bytes: self.inner.elections.disk_space(),
            meta_bytes: self.inner.meta.disk_space(),
        }
    }
}

impl StoreInner {
    /// Write one instance record and fsync. Called with the core lock held so
    /// no later decision can observe un-persisted state.
    fn persist_record(
        &self,
        id: InstanceId,
        record: &SlotRecord,
    ) -> Result<(), Report<StoreFatal>> {
        let bytes =
            postcard::to_allocvec(&DiskRecord::from(record)).change_context(StoreFatal)?;
        match id {
            InstanceId::Log(slot) => self
                .slots
                .insert(slot.0.to_be_bytes(), &bytes)
                .change_context(StoreFatal)?,
            InstanceId::Election(epoch) => self
                .elections
                .insert(epoch.0.to_be_bytes(), &bytes)
                .change_context(StoreFatal)?,
        }
        self.db
            .persist(PersistMode::SyncAll)
            .change_context(StoreFatal)
    }
}

fn parse_u64_key(key: &[u8]) -> Option<u64> {
    let bytes: [u8; 8] = key.try_into().ok()?;
    Some(u64::from_be_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use chorus_core::ProposerId;

    use super::*;

    fn n(round: u64, proposer: u32) -> ProposalNum {
        ProposalNum::new(round, ProposerId(proposer))
    }

    fn put(value: &str) -> Command {
        Command::Put {
            key: "k".into(),
            value: value.into(),
        }
    }

    #[tokio::test]
    async fn promise_and_accept_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = SlotStore::open(dir.path()).await.unwrap();
        let id = InstanceId::Log(Slot(1));

        let outcome = store.prepare(id, n(1, 1)).await.unwrap();
        assert!(matches!(outcome, PrepareOutcome::Promised { accepted: None }));

        let outcome = store.accept(id, n(1, 1), put("a")).await.unwrap();
        assert_eq!(outcome, AcceptOutcome::Accepted);

        let range = store.accepted_range(Slot(1), Slot(1));
        assert_eq!(range, vec![(Slot(1), n(1, 1), put("a"))]);
    }

    #[tokio::test]
    async fn restart_reconstructs_state_exactly() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = SlotStore::open(dir.path()).await.unwrap();
            store
                .prepare(InstanceId::Log(Slot(3)), n(2, 1))
                .await
                .unwrap();
            store
                .accept(InstanceId::Log(Slot(3)), n(2, 1), put("persisted"))
                .await
                .unwrap();
            store
                .accept(
                    InstanceId::Election(Epoch(1)),
                    n(1, 2),
                    Command::Leader {
                        proposer: ProposerId(2),
                        epoch: Epoch(1),
                    },
                )
                .await
                .unwrap();
            let RangedOutcome::Promised { .. } =
                store.prepare_ranged(Slot(4), n(5, 1)).await.unwrap()
            else {
                panic!("expected ranged promise");
            };
        }

        let store = SlotStore::open(dir.path()).await.unwrap();

        // The old promise still binds after restart.
        let outcome = store.prepare(InstanceId::Log(Slot(3)), n(1, 2)).await.unwrap();
        assert_eq!(outcome, PrepareOutcome::Nacked { promised: n(2, 1) });

        // The accepted value survives and is reported on a higher prepare.
        let outcome = store.prepare(InstanceId::Log(Slot(3)), n(9, 2)).await.unwrap();
        assert_eq!(
            outcome,
            PrepareOutcome::Promised {
                accepted: Some((n(2, 1), put("persisted")))
            }
        );

        // The floor survives too: low accepts in its range are refused.
        let outcome = store
            .accept(InstanceId::Log(Slot(40)), n(4, 2), put("late"))
            .await
            .unwrap();
        assert_eq!(outcome, AcceptOutcome::Nacked { promised: n(5, 1) });
    }

    #[tokio::test]
    async fn nacks_are_not_persisted_as_progress() {
        let dir = tempfile::tempdir().unwrap();
        let store = SlotStore::open(dir.path()).await.unwrap();
        let id = InstanceId::Log(Slot(1));

        store.prepare(id, n(5, 1)).await.unwrap();
        let outcome = store.accept(id, n(1, 2), put("stale")).await.unwrap();
        assert!(matches!(outcome, AcceptOutcome::Nacked { .. }));

        let range = store.accepted_range(Slot(1), Slot(1));
        assert!(range.is_empty());
    }
}
