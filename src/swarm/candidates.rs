use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::time::Instant;

use crate::constants::{BACKOFF_MAX, BACKOFF_MIN, MAX_CANDIDATES};

#[derive(Debug)]
struct Candidate {
    failures: u32,
    next_attempt: Instant,
    connected: bool,
    last_good: Option<Instant>,
}

/// Not-yet-connected peer addresses from trackers, PEX, and magnet hints.
///
/// Deduplicated by address and capped; failed sessions re-enter with
/// exponential backoff (30s doubling up to 30min) that a verified piece
/// resets. Banned addresses are refused permanently for the run.
pub struct CandidatePool {
    entries: HashMap<SocketAddr, Candidate>,
    banned: HashSet<SocketAddr>,
}

impl CandidatePool {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            banned: HashSet::new(),
        }
    }

    /// Adds a discovered address. Duplicates and banned addresses are
    /// dropped, as is anything past the pool cap.
    pub fn add(&mut self, addr: SocketAddr) -> bool {
        if self.banned.contains(&addr) || self.entries.len() >= MAX_CANDIDATES {
            return false;
        }
        if self.entries.contains_key(&addr) {
            return false;
        }
        self.entries.insert(
            addr,
            Candidate {
                failures: 0,
                next_attempt: Instant::now(),
                connected: false,
                last_good: None,
            },
        );
        true
    }

    /// Checks out one dialable address, marking it connected.
    pub fn checkout(&mut self, now: Instant) -> Option<SocketAddr> {
        let addr = self
            .entries
            .iter()
            .filter(|(_, c)| !c.connected && c.next_attempt <= now)
            .map(|(addr, _)| *addr)
            .next()?;
        if let Some(candidate) = self.entries.get_mut(&addr) {
            candidate.connected = true;
        }
        Some(addr)
    }

    /// Marks an inbound connection so the address is not dialed twice.
    pub fn note_inbound(&mut self, addr: SocketAddr) {
        self.entries
            .entry(addr)
            .or_insert(Candidate {
                failures: 0,
                next_attempt: Instant::now(),
                connected: true,
                last_good: None,
            })
            .connected = true;
    }

    /// Returns a session's address to the pool. A failed session backs
    /// off exponentially; a session that delivered a verified piece
    /// re-enters immediately.
    pub fn release(&mut self, addr: SocketAddr, failed: bool, now: Instant) {
        let Some(candidate) = self.entries.get_mut(&addr) else {
            return;
        };
        candidate.connected = false;
        if failed {
            candidate.failures += 1;
            let exponent = candidate.failures.saturating_sub(1).min(16);
            let delay = BACKOFF_MIN
                .checked_mul(1u32 << exponent)
                .map(|d| d.min(BACKOFF_MAX))
                .unwrap_or(BACKOFF_MAX);
            candidate.next_attempt = now + delay;
        } else {
            candidate.failures = 0;
            candidate.next_attempt = now;
            candidate.last_good = Some(now);
        }
    }

    /// Clears the backoff after a verified piece from this peer.
    pub fn reset_backoff(&mut self, addr: SocketAddr, now: Instant) {
        if let Some(candidate) = self.entries.get_mut(&addr) {
            candidate.failures = 0;
            candidate.last_good = Some(now);
        }
    }

    /// Bans an address for the rest of the run; it never comes back.
    pub fn ban(&mut self, addr: SocketAddr) {
        self.entries.remove(&addr);
        self.banned.insert(addr);
    }

    pub fn is_banned(&self, addr: &SocketAddr) -> bool {
        self.banned.contains(addr)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Addresses that recently produced verified data, most recent first,
    /// for the resume record's peer hint.
    pub fn recently_good(&self, limit: usize) -> Vec<SocketAddr> {
        let mut good: Vec<(SocketAddr, Instant)> = self
            .entries
            .iter()
            .filter_map(|(addr, c)| c.last_good.map(|at| (*addr, at)))
            .collect();
        good.sort_by(|a, b| b.1.cmp(&a.1));
        good.into_iter().take(limit).map(|(addr, _)| addr).collect()
    }

    /// Earliest time a currently backed-off candidate becomes dialable.
    pub fn next_attempt_at(&self) -> Option<Instant> {
        self.entries
            .values()
            .filter(|c| !c.connected)
            .map(|c| c.next_attempt)
            .min()
    }
}

impl Default for CandidatePool {
    fn default() -> Self {
        Self::new()
    }
}
