//! Pure per-slot proposer state machine.
//!
//! One instance drives one slot through Phase 1 and Phase 2. The service
//! layer owns networking, retries, and the decision of which slot to bind a
//! command to; this type only tracks responses and detects quorum or
//! supersession.

use std::collections::BTreeSet;

use chorus_core::{AcceptorId, Command, ProposalNum};

#[derive(Clone, Debug, PartialEq)]
enum Phase {
    Preparing {
        promises: BTreeSet<AcceptorId>,
        /// Highest accepted pair reported by any promise so far.
        adopted: Option<(ProposalNum, Command)>,
    },
    Accepting {
        accepts: BTreeSet<AcceptorId>,
    },
    Chosen,
    Superseded,
}

/// Result of feeding a Phase 1 response into the instance. Supersession is
/// reported through [`SlotInstance::on_nack`], not here.
#[derive(Clone, Debug, PartialEq)]
pub enum PrepareStep {
    Pending,
    /// Quorum of promises; run Phase 2 with `value`. When `displaced` is set
    /// the value was adopted from an earlier proposal and the caller's own
    /// command must be retried at another slot.
    Ready { value: Command, displaced: bool },
}

/// Result of feeding a Phase 2 response into the instance.
#[derive(Clone, Debug, PartialEq)]
pub enum AcceptStep {
    Pending,
    /// Quorum of accepts; the value is chosen at this slot.
    Chosen { value: Command },
}

#[derive(Clone, Debug)]
pub struct SlotInstance {
    proposal: ProposalNum,
    /// Value Phase 2 will carry. May be replaced by adoption.
    value: Command,
    /// The command the caller asked to bind, kept to detect displacement.
    original: Command,
    phase: Phase,
    quorum: usize,
}

impl SlotInstance {
    /// Start at Phase 1.
    #[must_use]
    pub fn new(proposal: ProposalNum, value: Command, quorum: usize) -> Self {
        Self {
            proposal,
            original: value.clone(),
            value,
            phase: Phase::Preparing {
                promises: BTreeSet::new(),
                adopted: None,
            },
            quorum,
        }
    }

    /// Start directly at Phase 2, the steady state under an established
    /// floor promise, where Phase 1 was amortized at the start of the epoch.
    #[must_use]
    pub fn new_accepting(proposal: ProposalNum, value: Command, quorum: usize) -> Self {
        Self {
            proposal,
            original: value.clone(),
            value,
            phase: Phase::Accepting {
                accepts: BTreeSet::new(),
            },
            quorum,
        }
    }

    #[must_use]
    pub fn proposal(&self) -> ProposalNum {
        self.proposal
    }

    #[must_use]
    pub fn value(&self) -> &Command {
        &self.value
    }

    #[must_use]
    pub fn is_chosen(&self) -> bool {
        matches!(self.phase, Phase::Chosen)
    }

    /// A promise for our proposal number arrived from `acceptor`.
    pub fn on_promise(
        &mut self,
        acceptor: AcceptorId,
        accepted: Option<(ProposalNum, Command)>,
    ) -> PrepareStep {
        let Phase::Preparing { promises, adopted } = &mut self.phase else {
            return PrepareStep::Pending;
        };

        promises.insert(acceptor);
        if let Some((num, value)) = accepted
            && adopted.as_ref().is_none_or(|(seen, _)| num > *seen)
        {
            *adopted = Some((num, value));
        }

        if promises.len() < self.quorum {
            return PrepareStep::Pending;
        }

        // Quorum: adopt the highest previously accepted value, or keep ours.
        let displaced = match adopted.take() {
            Some((_, value)) if value != self.original => {
                self.value = value;
                true
            }
            _ => false,
        };
        self.phase = Phase::Accepting {
            accepts: BTreeSet::new(),
        };
        PrepareStep::Ready {
            value: self.value.clone(),
            displaced,
        }
    }

    /// An ACCEPTED for our proposal number arrived from `acceptor`.
    pub fn on_accepted(&mut self, acceptor: AcceptorId) -> AcceptStep {
        let Phase::Accepting { accepts } = &mut self.phase else {
            return AcceptStep::Pending;
        };

        accepts.insert(acceptor);
        if accepts.len() >= self.quorum {
            self.phase = Phase::Chosen;
            AcceptStep::Chosen {
                value: self.value.clone(),
            }
        } else {
            AcceptStep::Pending
        }
    }

    /// A NACK arrived carrying the promise that beat us. Returns the higher
    /// number when the instance is genuinely superseded; stale NACKs from
    /// lower proposals are ignored.
    pub fn on_nack(&mut self, promised: ProposalNum) -> Option<ProposalNum> {
        if promised <= self.proposal || matches!(self.phase, Phase::Chosen) {
            return None;
        }
        self.phase = Phase::Superseded;
        Some(promised)
    }
}

#[cfg(test)]
mod tests {
    use chorus_core::ProposerId;

    use super::*;

    fn n(round: u64, proposer: u32) -> ProposalNum {
        ProposalNum::new(round, ProposerId(proposer))
    }

    fn put(key: &str, value: &str) -> Command {
        Command::Put {
            key: key.into(),
            value: value.into(),
        }
    }

    #[test]
    fn phase1_quorum_keeps_own_value_when_unconstrained() {
        let mut instance = SlotInstance::new(n(1, 1), put("x", "1"), 2);

        assert_eq!(instance.on_promise(AcceptorId(1), None), PrepareStep::Pending);
        let step = instance.on_promise(AcceptorId(2), None);
        assert_eq!(
            step,
            PrepareStep::Ready {
                value: put("x", "1"),
                displaced: false
            }
        );
    }

    #[test]
    fn phase1_adopts_highest_accepted_value() {
        let mut instance = SlotInstance::new(n(3, 2), put("x", "mine"), 2);

        let _ = instance.on_promise(AcceptorId(1), Some((n(1, 1), put("x", "old"))));
        let step = instance.on_promise(AcceptorId(2), Some((n(2, 1), put("x", "newer"))));

        assert_eq!(
            step,
            PrepareStep::Ready {
                value: put("x", "newer"),
                displaced: true
            }
        );
        assert_eq!(instance.value(), &put("x", "newer"));
    }

    #[test]
    fn duplicate_promises_do_not_fake_quorum() {
        let mut instance = SlotInstance::new(n(1, 1), put("x", "1"), 2);
        assert_eq!(instance.on_promise(AcceptorId(1), None), PrepareStep::Pending);
        assert_eq!(instance.on_promise(AcceptorId(1), None), PrepareStep::Pending);
    }

    #[test]
    fn phase2_quorum_chooses() {
        let mut instance = SlotInstance::new_accepting(n(1, 1), put("x", "1"), 2);
        assert_eq!(instance.on_accepted(AcceptorId(1)), AcceptStep::Pending);
        assert_eq!(
            instance.on_accepted(AcceptorId(3)),
            AcceptStep::Chosen {
                value: put("x", "1")
            }
        );
        assert!(instance.is_chosen());
    }

    #[test]
    fn nack_supersedes_only_on_higher_number() {
        let mut instance = SlotInstance::new_accepting(n(5, 1), put("x", "1"), 2);
        assert_eq!(instance.on_nack(n(4, 2)), None);
        assert_eq!(instance.on_nack(n(6, 2)), Some(n(6, 2)));
        assert_eq!(instance.on_accepted(AcceptorId(1)), AcceptStep::Pending);
        assert_eq!(instance.on_accepted(AcceptorId(2)), AcceptStep::Pending);
    }

    #[test]
    fn late_responses_after_chosen_are_ignored() {
        let mut instance = SlotInstance::new_accepting(n(1, 1), put("x", "1"), 1);
        assert!(matches!(
            instance.on_accepted(AcceptorId(1)),
            AcceptStep::Chosen { .. }
        ));
        assert_eq!(instance.on_nack(n(9, 2)), None);
        assert_eq!(instance.on_accepted(AcceptorId(2)), AcceptStep::Pending);
    }
}
