//! Pure Multi-Paxos state machines for the chorus store.
//!
//! Nothing in this crate does I/O, async, or synchronization. The acceptor
//! core decides promises and accepts per slot, the proposer core drives
//! Phase 1 / Phase 2 for a single slot, and the tally aggregates accept
//! notifications on the learner side. The services wrap these in durability
//! and networking.

#![warn(clippy::pedantic)]

pub mod acceptor;
pub mod proposer;
pub mod tally;

pub use acceptor::{AcceptOutcome, AcceptorCore, PrepareOutcome, RangedOutcome, SlotRecord};
pub use proposer::{AcceptStep, PrepareStep, SlotInstance};
pub use tally::{AcceptTally, TallyBook, chosen_from_query};
