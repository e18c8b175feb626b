use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::time::Instant;

use rand::Rng as _;

use crate::constants::{
    BAN_FAILURE_COUNT, BAN_WINDOW, OPTIMISTIC_ROUND_PERIOD, TRUST_PENALTY_ROUNDS, UPLOAD_SLOTS,
};

use super::record::PeerRegistry;

/// One choke flip to deliver to a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChokeDecision {
    pub addr: SocketAddr,
    pub choke: bool,
}

/// The Tit-for-Tat choking algorithm.
///
/// Every round, interested peers are ranked by download rate while
/// leeching or upload rate while seeding; the top `UPLOAD_SLOTS - 1` are
/// unchoked, and every third round one additional peer is unchoked at
/// random to probe for better partners. Hash failures halve a peer's score
/// for a few rounds, and repeated failures inside an hour ban it outright.
pub struct Choker {
    round: u64,
    optimistic: Option<SocketAddr>,
    penalties: HashMap<SocketAddr, u32>,
    failures: HashMap<SocketAddr, Vec<Instant>>,
    banned: HashSet<SocketAddr>,
}

impl Choker {
    pub fn new() -> Self {
        Self {
            round: 0,
            optimistic: None,
            penalties: HashMap::new(),
            failures: HashMap::new(),
            banned: HashSet::new(),
        }
    }

    /// Registers a hash failure against a contributing peer. Returns true
    /// when this failure crosses the ban threshold.
    pub fn record_hash_failure(&mut self, addr: SocketAddr, now: Instant) -> bool {
        self.penalties.insert(addr, TRUST_PENALTY_ROUNDS);
        let history = self.failures.entry(addr).or_default();
        history.push(now);
        history.retain(|at| now.duration_since(*at) <= BAN_WINDOW);
        if history.len() as u32 >= BAN_FAILURE_COUNT {
            self.banned.insert(addr);
            tracing::warn!(%addr, "peer banned after repeated hash failures");
            true
        } else {
            false
        }
    }

    pub fn is_banned(&self, addr: &SocketAddr) -> bool {
        self.banned.contains(addr)
    }

    /// Forgets per-peer state when a session closes (the ban list is kept).
    pub fn peer_gone(&mut self, addr: &SocketAddr) {
        self.penalties.remove(addr);
        if self.optimistic == Some(*addr) {
            self.optimistic = None;
        }
    }

    /// Runs one choke round and returns only the flips whose state
    /// actually changes.
    pub fn run_round(
        &mut self,
        registry: &PeerRegistry,
        seeding: bool,
        now: Instant,
    ) -> Vec<ChokeDecision> {
        self.round += 1;
        let optimistic_round = self.round % OPTIMISTIC_ROUND_PERIOD == 0;

        struct Ranked {
            addr: SocketAddr,
            score: f64,
            snubbed: bool,
        }

        let mut interested: Vec<Ranked> = Vec::new();
        let mut all: Vec<(SocketAddr, bool)> = Vec::new();
        for entry in registry.iter() {
            let record = entry.value();
            record.sample_rates(now);
            let unchoked = !record.am_choking();
            all.push((record.addr, unchoked));

            if !record.peer_interested() || self.banned.contains(&record.addr) {
                continue;
            }
            let mut score = if seeding {
                record.upload_rate()
            } else {
                record.download_rate()
            };
            if self.penalties.contains_key(&record.addr) {
                score /= 2.0;
            }
            interested.push(Ranked {
                addr: record.addr,
                score,
                snubbed: record.is_snubbed(now),
            });
        }

        interested.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));

        let mut unchoke: HashSet<SocketAddr> = interested
            .iter()
            .filter(|r| !r.snubbed)
            .take(UPLOAD_SLOTS - 1)
            .map(|r| r.addr)
            .collect();

        if optimistic_round {
            let pool: Vec<SocketAddr> = interested
                .iter()
                .filter(|r| !unchoke.contains(&r.addr))
                .map(|r| r.addr)
                .collect();
            self.optimistic = if pool.is_empty() {
                None
            } else {
                Some(pool[rand::rng().random_range(0..pool.len())])
            };
        } else if let Some(current) = self.optimistic {
            let still_valid = interested.iter().any(|r| r.addr == current);
            if !still_valid {
                self.optimistic = None;
            }
        }
        if let Some(optimistic) = self.optimistic {
            unchoke.insert(optimistic);
        }

        // Penalties age out one round at a time.
        self.penalties.retain(|_, rounds| {
            *rounds -= 1;
            *rounds > 0
        });

        all.iter()
            .filter_map(|(addr, currently_unchoked)| {
                let want_unchoked = unchoke.contains(addr);
                (want_unchoked != *currently_unchoked).then_some(ChokeDecision {
                    addr: *addr,
                    choke: !want_unchoked,
                })
            })
            .collect()
    }

    /// The current optimistic unchoke pick, for diagnostics and tests.
    pub fn optimistic(&self) -> Option<SocketAddr> {
        self.optimistic
    }
}

impl Default for Choker {
    fn default() -> Self {
        Self::new()
    }
}
