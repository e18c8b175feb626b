use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::constants::SNUB_TIMEOUT;
use crate::peer::RateEstimator;

/// Live counters for one connected peer, shared between its session task
/// and the choker.
///
/// Sessions write; the choker and the engine read. Totals are atomics,
/// rates live behind a small mutex sampled once per housekeeping tick.
pub struct PeerRecord {
    pub addr: SocketAddr,
    peer_interested: AtomicBool,
    peer_choking: AtomicBool,
    am_choking: AtomicBool,
    am_interested: AtomicBool,
    downloaded: AtomicU64,
    uploaded: AtomicU64,
    rates: Mutex<Rates>,
}

struct Rates {
    download: RateEstimator,
    upload: RateEstimator,
    last_payload: Option<Instant>,
    unchoked_at: Option<Instant>,
    download_rate: f64,
    upload_rate: f64,
}

impl PeerRecord {
    pub fn new(addr: SocketAddr) -> Arc<Self> {
        Arc::new(Self {
            addr,
            peer_interested: AtomicBool::new(false),
            peer_choking: AtomicBool::new(true),
            am_choking: AtomicBool::new(true),
            am_interested: AtomicBool::new(false),
            downloaded: AtomicU64::new(0),
            uploaded: AtomicU64::new(0),
            rates: Mutex::new(Rates {
                download: RateEstimator::new(),
                upload: RateEstimator::new(),
                last_payload: None,
                unchoked_at: None,
                download_rate: 0.0,
                upload_rate: 0.0,
            }),
        })
    }

    pub fn note_downloaded(&self, bytes: usize) {
        self.downloaded.fetch_add(bytes as u64, Ordering::Relaxed);
        let mut rates = self.rates.lock();
        rates.download.record(bytes);
        rates.last_payload = Some(Instant::now());
    }

    pub fn note_uploaded(&self, bytes: usize) {
        self.uploaded.fetch_add(bytes as u64, Ordering::Relaxed);
        self.rates.lock().upload.record(bytes);
    }

    /// Folds pending byte counts into the rate averages.
    pub fn sample_rates(&self, now: Instant) {
        let mut rates = self.rates.lock();
        rates.download_rate = rates.download.sample(now);
        rates.upload_rate = rates.upload.sample(now);
    }

    pub fn download_rate(&self) -> f64 {
        self.rates.lock().download_rate
    }

    pub fn upload_rate(&self) -> f64 {
        self.rates.lock().upload_rate
    }

    pub fn downloaded(&self) -> u64 {
        self.downloaded.load(Ordering::Relaxed)
    }

    pub fn uploaded(&self) -> u64 {
        self.uploaded.load(Ordering::Relaxed)
    }

    pub fn peer_interested(&self) -> bool {
        self.peer_interested.load(Ordering::Relaxed)
    }

    pub fn set_peer_interested(&self, value: bool) {
        self.peer_interested.store(value, Ordering::Relaxed);
    }

    pub fn peer_choking(&self) -> bool {
        self.peer_choking.load(Ordering::Relaxed)
    }

    pub fn set_peer_choking(&self, value: bool) {
        self.peer_choking.store(value, Ordering::Relaxed);
    }

    pub fn am_choking(&self) -> bool {
        self.am_choking.load(Ordering::Relaxed)
    }

    pub fn set_am_choking(&self, value: bool) {
        self.am_choking.store(value, Ordering::Relaxed);
        if !value {
            self.rates.lock().unchoked_at = Some(Instant::now());
        }
    }

    pub fn am_interested(&self) -> bool {
        self.am_interested.load(Ordering::Relaxed)
    }

    pub fn set_am_interested(&self, value: bool) {
        self.am_interested.store(value, Ordering::Relaxed);
    }

    /// A peer we unchoked that has delivered nothing for the snub window.
    pub fn is_snubbed(&self, now: Instant) -> bool {
        if self.am_choking() {
            return false;
        }
        let rates = self.rates.lock();
        let reference = match (rates.last_payload, rates.unchoked_at) {
            (Some(payload), Some(unchoked)) => payload.max(unchoked),
            (Some(payload), None) => payload,
            (None, Some(unchoked)) => unchoked,
            (None, None) => return false,
        };
        now.duration_since(reference) > SNUB_TIMEOUT
    }
}

/// Registry of live peer records, keyed by address.
pub type PeerRegistry = DashMap<SocketAddr, Arc<PeerRecord>>;
