//! Proposer-local state: the persisted round counter and the in-memory
//! leadership core.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chorus_core::{Epoch, ProposalNum, ProposerId, Role, Slot, StoreFatal};
use error_stack::{Report, ResultExt};
use fjall::{Database, Keyspace, PersistMode};

const MAX_ROUND_KEY: &[u8] = b"max_round_seen";

struct RoundInner {
    db: Database,
    meta: Keyspace,
    cached: Mutex<u64>,
}

/// Durable `max_round_seen`. Proposal numbers must stay unique and monotonic
/// across restarts, so the round is persisted before any proposal built from
/// it leaves the node.
#[derive(Clone)]
pub struct RoundStore {
    inner: Arc<RoundInner>,
}

impl RoundStore {
    /// # Errors
    ///
    /// Returns [`StoreFatal`] if the database cannot be opened.
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
        let meta = db
            .keyspace("meta", fjall::KeyspaceCreateOptions::default)
            .change_context(StoreFatal)?;

        let cached = match meta.get(MAX_ROUND_KEY).change_context(StoreFatal)? {
            Some(bytes) => {
                let raw: [u8; 8] = bytes
                    .as_ref()
                    .try_into()
                    .map_err(|_| Report::new(StoreFatal))?;
                u64::from_be_bytes(raw)
            }
            None => 0,
        };

        Ok(Self {
            inner: Arc::new(RoundInner {
                db,
                meta,
                cached: Mutex::new(cached),
            }),
        })
    }

    #[must_use]
    pub fn max_round_seen(&self) -> u64 {
        *self.inner.cached.lock().unwrap()
    }

    /// Record a round observed in any acceptor response. Durable before the
    /// next proposal can be generated from it.
    ///
    /// # Errors
    ///
    /// Returns [`StoreFatal`] if the round cannot be persisted.
    pub async fn observe(&self, round: u64) -> Result<(), Report<StoreFatal>> {
        if round <= self.max_round_seen() {
            return Ok(());
        }
        self.persist_round(round).await
    }

    /// `(max_round_seen + 1, id)`, persisted before it is returned.
    ///
    /// # Errors
    ///
    /// Returns [`StoreFatal`] if the round cannot be persisted.
    pub async fn next_proposal(&self, id: ProposerId) -> Result<ProposalNum, Report<StoreFatal>> {
        let round = self.max_round_seen() + 1;
        self.persist_round(round).await?;
        Ok(ProposalNum::new(round, id))
    }

    async fn persist_round(&self, round: u64) -> Result<(), Report<StoreFatal>> {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            inner
                .meta
                .insert(MAX_ROUND_KEY, &round.to_be_bytes())
                .change_context(StoreFatal)?;
            inner
                .db
                .persist(PersistMode::SyncAll)
                .change_context(StoreFatal)?;

            let mut cached = inner.cached.lock().unwrap();
            if round > *cached {
                *cached = round;
            }
            Ok(())
        })
        .await
        .expect("spawn_blocking panicked")
    }
}

/// Mutable leadership core, guarded by one mutex with short critical
/// sections. Updates never block on I/O while the lock is held.
#[derive(Debug)]
pub struct CoreState {
    pub role: Role,
    pub epoch: Epoch,
    pub leader: Option<ProposerId>,
    /// Next log slot the leader will bind. Always >= 1.
    pub next_slot: Slot,
    /// The elected proposal number Phase 2 runs under in this epoch.
    pub n_star: Option<ProposalNum>,
    pub inflight: usize,
    /// Highest commit index any learner has reported.
    pub committed_up_to: Slot,
    pub last_heartbeat: Instant,
}

impl CoreState {
    #[must_use]
    pub fn new() -> Self {
        Self {
            role: Role::Follower,
            epoch: Epoch(0),
            leader: None,
            next_slot: Slot(1),
            n_star: None,
            inflight: 0,
            committed_up_to: Slot(0),
            last_heartbeat: Instant::now(),
        }
    }

    /// Step down into an epoch led by someone else. Inflight work for the
    /// old epoch is discarded by the epoch gate on its completion paths.
    pub fn follow(&mut self, leader: Option<ProposerId>, epoch: Epoch) {
        self.role = Role::Follower;
        self.leader = leader;
        self.epoch = epoch;
        self.n_star = None;
        self.last_heartbeat = Instant::now();
    }
}

impl Default for CoreState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rounds_are_monotonic_and_persisted() {
        let dir = tempfile::tempdir().unwrap();

        {
            let rounds = RoundStore::open(dir.path()).await.unwrap();
            let n1 = rounds.next_proposal(ProposerId(1)).await.unwrap();
            let n2 = rounds.next_proposal(ProposerId(1)).await.unwrap();
            assert!(n2 > n1);
            rounds.observe(100).await.unwrap();
        }

        // A restart must not reuse any previously generated round.
        let rounds = RoundStore::open(dir.path()).await.unwrap();
        let n3 = rounds.next_proposal(ProposerId(1)).await.unwrap();
        assert_eq!(n3.round, 101);
    }

    #[tokio::test]
    async fn observe_ignores_lower_rounds() {
        let dir = tempfile::tempdir().unwrap();
        let rounds = RoundStore::open(dir.path()).await.unwrap();
        rounds.observe(5).await.unwrap();
        rounds.observe(3).await.unwrap();
        assert_eq!(rounds.max_round_seen(), 5);
    }
}
