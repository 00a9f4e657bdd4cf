//! Pure acceptor state machine: no I/O, no async, no synchronization.
//!
//! The durable store wraps this: it loads the relevant records, applies a
//! decision here, and persists the result before the reply leaves the node.

use std::collections::BTreeMap;

use chorus_core::{Command, InstanceId, ProposalNum, Slot};

/// Pure decision functions for the per-slot protocol rules.
///
/// - **Promise (Phase 1)**: succeeds only if `n > promised`; a tie is a NACK.
/// - **Accept (Phase 2)**: succeeds if `n >= promised`.
pub mod decision {
    use chorus_core::ProposalNum;

    #[must_use]
    pub fn should_promise(proposal: ProposalNum, current_promised: Option<ProposalNum>) -> bool {
        current_promised.is_none_or(|promised| proposal > promised)
    }

    #[must_use]
    pub fn should_accept(proposal: ProposalNum, current_promised: Option<ProposalNum>) -> bool {
        current_promised.is_none_or(|promised| proposal >= promised)
    }
}

/// Per-instance acceptor record.
///
/// Invariant: `accepted` never carries a proposal above `promised`, and
/// `promised` only grows.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SlotRecord {
    pub promised: Option<ProposalNum>,
    pub accepted: Option<(ProposalNum, Command)>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum PrepareOutcome {
    Promised {
        accepted: Option<(ProposalNum, Command)>,
    },
    Nacked {
        promised: ProposalNum,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub enum RangedOutcome {
    Promised {
        /// Every accepted `(slot, proposal, value)` at or beyond the range
        /// start, for the new leader to adopt and complete.
        accepted: Vec<(Slot, ProposalNum, Command)>,
    },
    Nacked {
        promised: ProposalNum,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub enum AcceptOutcome {
    Accepted,
    Nacked { promised: ProposalNum },
}

/// The acceptor's full voting state: one record per touched instance, plus a
/// floor promise standing in for every log slot at or beyond its start.
///
/// The floor is what makes the once-per-epoch ranged Phase 1 sound: a new
/// leader's promise covers slots it has never been asked about, so a rival
/// cannot slip a Phase 2 into an untouched slot with an older number.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AcceptorCore {
    records: BTreeMap<InstanceId, SlotRecord>,
    floor: Option<(Slot, ProposalNum)>,
}

impl AcceptorCore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from persisted state on restart.
    #[must_use]
    pub fn from_parts(
        records: BTreeMap<InstanceId, SlotRecord>,
        floor: Option<(Slot, ProposalNum)>,
    ) -> Self {
        Self { records, floor }
    }

    #[must_use]
    pub fn floor(&self) -> Option<(Slot, ProposalNum)> {
        self.floor
    }

    #[must_use]
    pub fn record(&self, id: InstanceId) -> SlotRecord {
        self.records.get(&id).cloned().unwrap_or_default()
    }

    #[must_use]
    pub fn recorded_slots(&self) -> u64 {
        self.records.len() as u64
    }

    #[must_use]
    pub fn highest_log_slot(&self) -> Option<Slot> {
        self.records
            .keys()
            .filter_map(|id| match id {
                InstanceId::Log(slot) => Some(*slot),
                InstanceId::Election(_) => None,
            })
            .max()
    }

    /// The promise in force for an instance: its own record, raised to the
    /// floor for log slots the floor covers.
    #[must_use]
    pub fn effective_promised(&self, id: InstanceId) -> Option<ProposalNum> {
        let recorded = self.records.get(&id).and_then(|r| r.promised);
        let floored = match id {
            InstanceId::Log(slot) => self
                .floor
                .filter(|(from, _)| slot >= *from)
                .map(|(_, n)| n),
            InstanceId::Election(_) => None,
        };
        recorded.max(floored)
    }

    pub fn prepare(&mut self, id: InstanceId, proposal: ProposalNum) -> PrepareOutcome {
        let current = self.effective_promised(id);
        if decision::should_promise(proposal, current) {
            let record = self.records.entry(id).or_default();
            record.promised = Some(proposal);
            PrepareOutcome::Promised {
                accepted: record.accepted.clone(),
            }
        } else {
            PrepareOutcome::Nacked {
                // `should_promise` only fails against an existing promise.
                promised: current.unwrap_or(proposal),
            }
        }
    }

    /// Ranged Phase 1 over every log slot at or beyond `from`.
    ///
    /// Succeeds only if `proposal` beats the promise in force at every slot
    /// in the range; on success the floor is raised and all accepted values
    /// in the range are returned for adoption.
    pub fn prepare_ranged(&mut self, from: Slot, proposal: ProposalNum) -> RangedOutcome {
        let in_range = |id: &InstanceId| matches!(id, InstanceId::Log(slot) if *slot >= from);

        let highest_in_force = self
            .records
            .iter()
            .filter(|(id, _)| in_range(id))
            .filter_map(|(_, record)| record.promised)
            .max()
            .max(self.floor.map(|(_, n)| n));

        if !decision::should_promise(proposal, highest_in_force) {
            return RangedOutcome::Nacked {
                promised: highest_in_force.unwrap_or(proposal),
            };
        }

        self.floor = Some((from, proposal));
        let accepted = self
            .records
            .iter()
            .filter_map(|(id, record)| match (id, &record.accepted) {
                (InstanceId::Log(slot), Some((num, value))) if *slot >= from => {
                    Some((*slot, *num, value.clone()))
                }
                _ => None,
            })
            .collect();
        RangedOutcome::Promised { accepted }
    }

    pub fn accept(&mut self, id: InstanceId, proposal: ProposalNum, value: Command) -> AcceptOutcome {
        let current = self.effective_promised(id);
        if decision::should_accept(proposal, current) {
            let record = self.records.entry(id).or_default();
            record.promised = Some(record.promised.map_or(proposal, |p| p.max(proposal)));
            record.accepted = Some((proposal, value));
            AcceptOutcome::Accepted
        } else {
            AcceptOutcome::Nacked {
                promised: current.unwrap_or(proposal),
            }
        }
    }

    /// Read-only range scan over accepted log slots, for learner catch-up.
    /// An inverted range is empty.
    #[must_use]
    pub fn accepted_range(&self, from: Slot, to: Slot) -> Vec<(Slot, ProposalNum, Command)> {
        if from > to {
            return Vec::new();
        }
        self.records
            .range(InstanceId::Log(from)..=InstanceId::Log(to))
            .filter_map(|(id, record)| match (id, &record.accepted) {
                (InstanceId::Log(slot), Some((num, value))) => Some((*slot, *num, value.clone())),
                _ => None,
            })
            .collect()
    }
}
