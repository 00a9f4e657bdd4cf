//! Protocol identifiers and the replicated command type.

use core::fmt;

use serde::{Deserialize, Serialize};

macro_rules! id_type {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash,
            Serialize, Deserialize,
        )]
        pub struct $name(pub u32);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

id_type! {
    /// Identity of an acceptor within the cluster.
    AcceptorId
}
id_type! {
    /// Identity of a proposer within the cluster.
    ProposerId
}
id_type! {
    /// Identity of a learner within the cluster.
    LearnerId
}

/// Opaque client identity, carried for session consistency.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClientId(pub String);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A position in the replicated log. Slot 0 is reserved for leader election;
/// slots >= 1 carry client commands.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Slot(pub u64);

impl Slot {
    pub const ELECTION: Slot = Slot(0);

    #[must_use]
    pub fn is_election(self) -> bool {
        self == Self::ELECTION
    }

    #[must_use]
    pub fn next(self) -> Slot {
        Slot(self.0 + 1)
    }

    #[must_use]
    pub fn prev(self) -> Slot {
        Slot(self.0.saturating_sub(1))
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A leadership reign. Epochs increase monotonically; each epoch runs its own
/// election instance on slot 0.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Epoch(pub u64);

impl Epoch {
    #[must_use]
    pub fn next(self) -> Epoch {
        Epoch(self.0 + 1)
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Totally ordered proposal number, compared as `(round, proposer)`.
///
/// The derived ordering is lexicographic over the field order, which gives
/// exactly the tie-break the protocol needs: rounds dominate, proposer ids
/// break ties, and no two proposers ever share a number.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ProposalNum {
    pub round: u64,
    pub proposer: ProposerId,
}

impl ProposalNum {
    #[must_use]
    pub fn new(round: u64, proposer: ProposerId) -> Self {
        Self { round, proposer }
    }
}

impl fmt::Display for ProposalNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.round, self.proposer)
    }
}

/// Key of a single Paxos instance.
///
/// Log slots are independent instances; elections re-run slot 0 once per
/// epoch, so election instances are namespaced by the epoch they decide.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum InstanceId {
    Election(Epoch),
    Log(Slot),
}

impl InstanceId {
    /// Resolve the instance addressed by a wire message carrying `(slot, epoch)`.
    #[must_use]
    pub fn from_wire(slot: Slot, epoch: Epoch) -> Self {
        if slot.is_election() {
            Self::Election(epoch)
        } else {
            Self::Log(slot)
        }
    }
}

/// A command bound to a log slot.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Command {
    Put { key: String, value: String },
    Del { key: String },
    /// Filler command used by the strong-read path; applies no state change.
    Noop,
    /// Election value chosen at slot 0; never applied to the key space.
    Leader { proposer: ProposerId, epoch: Epoch },
}

/// Read consistency requested by a client.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Consistency {
    Eventual,
    Session,
    Strong,
}

/// Proposer role in the leadership state machine.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    Follower,
    Candidate,
    Leader,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proposal_num_orders_round_first() {
        let low = ProposalNum::new(1, ProposerId(9));
        let high = ProposalNum::new(2, ProposerId(1));
        assert!(low < high);
    }

    #[test]
    fn proposal_num_breaks_ties_by_proposer() {
        let a = ProposalNum::new(3, ProposerId(1));
        let b = ProposalNum::new(3, ProposerId(2));
        assert!(a < b);
        assert_ne!(a, b);
    }

    #[test]
    fn election_instances_namespaced_by_epoch() {
        let e1 = InstanceId::from_wire(Slot::ELECTION, Epoch(1));
        let e2 = InstanceId::from_wire(Slot::ELECTION, Epoch(2));
        assert_ne!(e1, e2);

        let log = InstanceId::from_wire(Slot(4), Epoch(1));
        assert_eq!(log, InstanceId::Log(Slot(4)));
    }

    #[test]
    fn command_wire_shape() {
        let cmd = Command::Put {
            key: "x".into(),
            value: "1".into(),
        };
        let json = serde_json::to_value(&cmd).unwrap();
        assert_eq!(json["kind"], "put");
        assert_eq!(json["key"], "x");
    }
}
