//! Swarm control: per-peer accounting, the choking algorithm, and the
//! candidate address pool.
//!
//! Sessions publish their counters into a shared [`PeerRecord`] registry;
//! every ten seconds the [`Choker`] reads the registry, runs the
//! Tit-for-Tat round, and returns the choke flips for the engine to
//! deliver. [`CandidatePool`] holds not-yet-connected addresses with
//! reconnect backoff and ban state.

mod candidates;
mod choker;
mod record;

pub use candidates::CandidatePool;
pub use choker::{ChokeDecision, Choker};
pub use record::{PeerRecord, PeerRegistry};

#[cfg(test)]
mod tests;
