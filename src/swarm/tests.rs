use super::*;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

fn addr(n: u8) -> SocketAddr {
    format!("10.2.0.{}:6881", n).parse().unwrap()
}

/// Builds a registry of interested peers with distinct download rates.
/// Rates are seeded through the estimators so ordering matches `kb_rates`.
fn registry_with_rates(kb_rates: &[(u8, u64)]) -> PeerRegistry {
    let registry = PeerRegistry::new();
    let now = Instant::now();
    for &(n, kb) in kb_rates {
        let record = PeerRecord::new(addr(n));
        record.set_peer_interested(true);
        record.note_downloaded((kb * 1024) as usize);
        record.sample_rates(now + Duration::from_secs(1));
        registry.insert(addr(n), record);
    }
    registry
}

fn apply(registry: &PeerRegistry, decisions: &[ChokeDecision]) {
    for decision in decisions {
        if let Some(record) = registry.get(&decision.addr) {
            record.set_am_choking(decision.choke);
        }
    }
}

#[test]
fn test_choke_round_top_three_by_download_rate() {
    // The classic round: rates 100/80/60/40 KB/s with four interested
    // peers; three regular slots.
    let registry = registry_with_rates(&[(1, 100), (2, 80), (3, 60), (4, 40)]);
    let mut choker = Choker::new();

    let decisions = choker.run_round(&registry, false, Instant::now());
    apply(&registry, &decisions);

    let unchoked: Vec<SocketAddr> = decisions
        .iter()
        .filter(|d| !d.choke)
        .map(|d| d.addr)
        .collect();
    assert_eq!(unchoked.len(), 3);
    assert!(unchoked.contains(&addr(1)));
    assert!(unchoked.contains(&addr(2)));
    assert!(unchoked.contains(&addr(3)));
    assert!(registry.get(&addr(4)).unwrap().am_choking());

    // Second regular round: nothing changes, nothing is emitted.
    let decisions = choker.run_round(&registry, false, Instant::now());
    assert!(decisions.is_empty());
}

#[test]
fn test_optimistic_round_unchokes_fourth_then_keeps_it() {
    let registry = registry_with_rates(&[(1, 100), (2, 80), (3, 60), (4, 40)]);
    let mut choker = Choker::new();

    for _ in 0..2 {
        let decisions = choker.run_round(&registry, false, Instant::now());
        apply(&registry, &decisions);
    }
    assert!(registry.get(&addr(4)).unwrap().am_choking());

    // Third round is the optimistic one; the only remaining interested
    // peer is the fourth.
    let decisions = choker.run_round(&registry, false, Instant::now());
    apply(&registry, &decisions);
    assert_eq!(choker.optimistic(), Some(addr(4)));
    assert!(!registry.get(&addr(4)).unwrap().am_choking());

    // The pick persists through the following regular round.
    let decisions = choker.run_round(&registry, false, Instant::now());
    assert!(decisions.is_empty());
    assert_eq!(choker.optimistic(), Some(addr(4)));
}

#[test]
fn test_trust_penalty_halves_score() {
    let registry = registry_with_rates(&[(1, 100), (2, 90), (3, 85), (4, 80)]);
    let mut choker = Choker::new();

    // Peer 1's halved score (50) drops it below everyone else.
    let banned = choker.record_hash_failure(addr(1), Instant::now());
    assert!(!banned);

    let decisions = choker.run_round(&registry, false, Instant::now());
    apply(&registry, &decisions);
    assert!(registry.get(&addr(1)).unwrap().am_choking());
    assert!(!registry.get(&addr(2)).unwrap().am_choking());
    assert!(!registry.get(&addr(3)).unwrap().am_choking());
    assert!(!registry.get(&addr(4)).unwrap().am_choking());
}

#[test]
fn test_repeated_hash_failures_ban() {
    let mut choker = Choker::new();
    let now = Instant::now();
    assert!(!choker.record_hash_failure(addr(9), now));
    assert!(!choker.record_hash_failure(addr(9), now + Duration::from_secs(1)));
    assert!(choker.record_hash_failure(addr(9), now + Duration::from_secs(2)));
    assert!(choker.is_banned(&addr(9)));

    // Banned peers never appear in the unchoke set.
    let registry = registry_with_rates(&[(9, 1000)]);
    let decisions = choker.run_round(&registry, false, Instant::now());
    assert!(decisions.iter().all(|d| d.choke || d.addr != addr(9)));
}

#[test]
fn test_snubbed_peer_excluded_from_top_slots() {
    let registry = registry_with_rates(&[(1, 100), (2, 80), (3, 60), (4, 40)]);
    let mut choker = Choker::new();
    let now = Instant::now();

    let decisions = choker.run_round(&registry, false, now);
    apply(&registry, &decisions);
    assert!(!registry.get(&addr(1)).unwrap().am_choking());

    // Peer 1 goes quiet past the snub window; the next round drops it
    // from the regular slots and promotes peer 4.
    let later = now + Duration::from_secs(45);
    let decisions = choker.run_round(&registry, false, later);
    apply(&registry, &decisions);
    assert!(registry.get(&addr(1)).unwrap().am_choking());
    assert!(!registry.get(&addr(4)).unwrap().am_choking());
}

#[test]
fn test_seeding_ranks_by_upload_rate() {
    let registry = PeerRegistry::new();
    let now = Instant::now();
    for (n, kb) in [(1u8, 10u64), (2, 500)] {
        let record = PeerRecord::new(addr(n));
        record.set_peer_interested(true);
        record.note_uploaded((kb * 1024) as usize);
        record.sample_rates(now + Duration::from_secs(1));
        registry.insert(addr(n), record);
    }

    let mut choker = Choker::new();
    let decisions = choker.run_round(&registry, true, Instant::now());
    apply(&registry, &decisions);
    assert!(!registry.get(&addr(2)).unwrap().am_choking());
}

// ---------------------------------------------------------------------
// Candidate pool
// ---------------------------------------------------------------------

#[test]
fn test_pool_dedup_and_checkout() {
    let mut pool = CandidatePool::new();
    assert!(pool.add(addr(1)));
    assert!(!pool.add(addr(1)), "duplicate accepted");
    assert_eq!(pool.len(), 1);

    let now = Instant::now();
    assert_eq!(pool.checkout(now), Some(addr(1)));
    assert_eq!(pool.checkout(now), None, "checked-out address re-dialed");
}

#[test]
fn test_pool_backoff_doubles() {
    let mut pool = CandidatePool::new();
    pool.add(addr(1));
    let now = Instant::now();

    pool.checkout(now).unwrap();
    pool.release(addr(1), true, now);
    assert_eq!(pool.checkout(now), None);
    assert_eq!(pool.checkout(now + Duration::from_secs(29)), None);
    assert_eq!(
        pool.checkout(now + Duration::from_secs(31)),
        Some(addr(1)),
        "first backoff is 30s"
    );

    pool.release(addr(1), true, now);
    assert_eq!(pool.checkout(now + Duration::from_secs(31)), None);
    assert_eq!(
        pool.checkout(now + Duration::from_secs(61)),
        Some(addr(1)),
        "second backoff is 60s"
    );
}

#[test]
fn test_pool_success_resets_backoff() {
    let mut pool = CandidatePool::new();
    pool.add(addr(1));
    let now = Instant::now();

    pool.checkout(now).unwrap();
    pool.release(addr(1), true, now);
    pool.checkout(now + Duration::from_secs(31)).unwrap();
    pool.reset_backoff(addr(1), now);
    pool.release(addr(1), false, now);

    // Immediately dialable again.
    assert_eq!(pool.checkout(now), Some(addr(1)));
}

#[test]
fn test_pool_ban_is_permanent() {
    let mut pool = CandidatePool::new();
    pool.add(addr(1));
    pool.ban(addr(1));
    assert!(pool.is_banned(&addr(1)));
    assert!(!pool.add(addr(1)));
    assert_eq!(pool.checkout(Instant::now()), None);
}

#[test]
fn test_recently_good_ordering() {
    let mut pool = CandidatePool::new();
    let now = Instant::now();
    for n in 1..=3u8 {
        pool.add(addr(n));
    }
    pool.reset_backoff(addr(2), now);
    pool.reset_backoff(addr(3), now + Duration::from_secs(5));

    let good = pool.recently_good(10);
    assert_eq!(good, vec![addr(3), addr(2)]);
}
