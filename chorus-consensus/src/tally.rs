//! Learner-side accept aggregation.
//!
//! Each instance gets a tally of `(acceptor, proposal, value)` entries; an
//! acceptor's entry is replaced when it reports a higher proposal (the lower
//! one is irrelevant). A value is chosen once the highest proposal present
//! has entries from a quorum of distinct acceptors.

use std::collections::BTreeMap;

use chorus_core::{AcceptorId, Command, InstanceId, ProposalNum};
use tracing::trace;

#[derive(Clone, Debug, Default)]
pub struct AcceptTally {
    entries: BTreeMap<AcceptorId, (ProposalNum, Command)>,
}

impl AcceptTally {
    /// Record one accept notification. Returns the chosen pair once the
    /// highest proposal in the tally has `quorum` distinct acceptors.
    pub fn record(
        &mut self,
        acceptor: AcceptorId,
        proposal: ProposalNum,
        value: Command,
        quorum: usize,
    ) -> Option<(ProposalNum, Command)> {
        match self.entries.get(&acceptor) {
            Some((existing, _)) if *existing >= proposal => {}
            _ => {
                self.entries.insert(acceptor, (proposal, value));
            }
        }

        let (highest, value) = self
            .entries
            .values()
            .max_by_key(|(num, _)| *num)
            .cloned()?;
        let votes = self
            .entries
            .values()
            .filter(|(num, _)| *num == highest)
            .count();
        trace!(?highest, votes, quorum, "tallied accept");
        (votes >= quorum).then_some((highest, value))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Tallies for all instances still awaiting quorum. Entries are dropped the
/// moment their slot is decided.
#[derive(Clone, Debug)]
pub struct TallyBook {
    tallies: BTreeMap<InstanceId, AcceptTally>,
    quorum: usize,
}

impl TallyBook {
    #[must_use]
    pub fn new(quorum: usize) -> Self {
        Self {
            tallies: BTreeMap::new(),
            quorum,
        }
    }

    #[must_use]
    pub fn quorum(&self) -> usize {
        self.quorum
    }

    pub fn record(
        &mut self,
        instance: InstanceId,
        acceptor: AcceptorId,
        proposal: ProposalNum,
        value: Command,
    ) -> Option<(ProposalNum, Command)> {
        let chosen = self
            .tallies
            .entry(instance)
            .or_default()
            .record(acceptor, proposal, value, self.quorum);
        if chosen.is_some() {
            self.tallies.remove(&instance);
        }
        chosen
    }

    pub fn discard(&mut self, instance: InstanceId) {
        self.tallies.remove(&instance);
    }

    #[must_use]
    pub fn pending(&self) -> usize {
        self.tallies.len()
    }
}

/// The catch-up choice rule over a `queryAccepted` snapshot: a slot is
/// provably chosen iff some value appears with the same proposal number from
/// a quorum of acceptors.
#[must_use]
pub fn chosen_from_query(
    entries: &[(AcceptorId, ProposalNum, Command)],
    quorum: usize,
) -> Option<Command> {
    let mut counts: BTreeMap<ProposalNum, (usize, &Command)> = BTreeMap::new();
    for (_, num, value) in entries {
        counts.entry(*num).or_insert((0, value)).0 += 1;
    }
    counts
        .into_iter()
        .rev()
        .find(|(_, (count, _))| *count >= quorum)
        .map(|(_, (_, value))| value.clone())
}

#[cfg(test)]
mod tests {
    use chorus_core::{ProposerId, Slot};

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

    #[test]
    fn quorum_on_same_proposal_chooses() {
        let mut tally = AcceptTally::default();
        assert_eq!(tally.record(AcceptorId(1), n(1, 1), put("a"), 2), None);
        assert_eq!(
            tally.record(AcceptorId(2), n(1, 1), put("a"), 2),
            Some((n(1, 1), put("a")))
        );
    }

    #[test]
    fn duplicate_acceptor_counts_once() {
        let mut tally = AcceptTally::default();
        assert_eq!(tally.record(AcceptorId(1), n(1, 1), put("a"), 2), None);
        assert_eq!(tally.record(AcceptorId(1), n(1, 1), put("a"), 2), None);
    }

    #[test]
    fn higher_proposal_replaces_acceptor_entry() {
        let mut tally = AcceptTally::default();
        let _ = tally.record(AcceptorId(1), n(1, 1), put("a"), 2);
        let _ = tally.record(AcceptorId(2), n(2, 2), put("b"), 2);
        // Acceptor 1 moves to the newer proposal; quorum forms on it.
        assert_eq!(
            tally.record(AcceptorId(1), n(2, 2), put("b"), 2),
            Some((n(2, 2), put("b")))
        );
    }

    #[test]
    fn stale_notification_does_not_downgrade() {
        let mut tally = AcceptTally::default();
        let _ = tally.record(AcceptorId(1), n(2, 2), put("b"), 2);
        let _ = tally.record(AcceptorId(1), n(1, 1), put("a"), 2);
        assert_eq!(
            tally.record(AcceptorId(2), n(2, 2), put("b"), 2),
            Some((n(2, 2), put("b")))
        );
    }

    #[test]
    fn split_votes_below_quorum_choose_nothing() {
        let mut tally = AcceptTally::default();
        assert_eq!(tally.record(AcceptorId(1), n(1, 1), put("a"), 2), None);
        assert_eq!(tally.record(AcceptorId(2), n(2, 2), put("b"), 2), None);
    }

    #[test]
    fn book_discards_decided_instances() {
        let mut book = TallyBook::new(2);
        let slot = InstanceId::Log(Slot(3));
        assert_eq!(book.record(slot, AcceptorId(1), n(1, 1), put("a")), None);
        assert_eq!(book.pending(), 1);
        assert!(book.record(slot, AcceptorId(2), n(1, 1), put("a")).is_some());
        assert_eq!(book.pending(), 0);
    }

    #[test]
    fn query_choice_rule() {
        let entries = vec![
            (AcceptorId(1), n(2, 1), put("b")),
            (AcceptorId(2), n(2, 1), put("b")),
            (AcceptorId(3), n(1, 1), put("a")),
        ];
        assert_eq!(chosen_from_query(&entries, 2), Some(put("b")));
        assert_eq!(chosen_from_query(&entries, 3), None);
        assert_eq!(chosen_from_query(&[], 2), None);
    }
}
