use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::info;

use crate::blocklist::Blocklist;
use crate::cache::CacheStore;

/// Process wide state shared by every session and the console.
pub struct ProxyState {
    pub blocklist: Blocklist,
    pub cache: CacheStore,
    pub flags: RuntimeFlags,
    pub stats: Stats,
}

impl ProxyState {
    pub fn new(blocklist: Blocklist, flags: RuntimeFlags) -> Self {
        Self {
            blocklist,
            cache: CacheStore::new(),
            flags,
            stats: Stats::new(),
        }
    }
}

/// Operator toggles, flipped by the console and read on every request.
pub struct RuntimeFlags {
    caching: AtomicBool,
    verbose: AtomicBool,
    timing: AtomicBool,
}

impl RuntimeFlags {
    pub fn new(caching: bool, verbose: bool, timing: bool) -> Self {
        Self {
            caching: AtomicBool::new(caching),
            verbose: AtomicBool::new(verbose),
            timing: AtomicBool::new(timing),
        }
    }

    pub fn caching(&self) -> bool {
        self.caching.load(Ordering::Relaxed)
    }

    pub fn set_caching(&self, on: bool) {
        self.caching.store(on, Ordering::Relaxed);
    }

    pub fn verbose(&self) -> bool {
        self.verbose.load(Ordering::Relaxed)
    }

    pub fn set_verbose(&self, on: bool) {
        self.verbose.store(on, Ordering::Relaxed);
    }

    pub fn timing(&self) -> bool {
        self.timing.load(Ordering::Relaxed)
    }

    pub fn set_timing(&self, on: bool) {
        self.timing.store(on, Ordering::Relaxed);
    }
}

impl Default for RuntimeFlags {
    fn default() -> Self {
        Self::new(true, false, false)
    }
}

pub struct Stats {
    pub total: AtomicU64,
    pub active: AtomicU64,
    pub blocked: AtomicU64,
    pub failed: AtomicU64,
    pub tunnels: AtomicU64,
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub bytes_in: AtomicU64,
    pub bytes_out: AtomicU64,
}

impl Stats {
    pub fn new() -> Self {
        Self {
            total: AtomicU64::new(0),
            active: AtomicU64::new(0),
            blocked: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            tunnels: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
        }
    }

    pub fn print(&self, cache: &CacheStore) {
        info!(
            "total={} active={} blocked={} failed={} tunnels={} hits={} misses={} cached={}B/{} entries saved={}B in={}MB out={}MB",
            self.total.load(Ordering::Relaxed),
            self.active.load(Ordering::Relaxed),
            self.blocked.load(Ordering::Relaxed),
            self.failed.load(Ordering::Relaxed),
            self.tunnels.load(Ordering::Relaxed),
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
            cache.current_size(),
            cache.len(),
            cache.bytes_saved(),
            self.bytes_in.load(Ordering::Relaxed) / 1_000_000,
            self.bytes_out.load(Ordering::Relaxed) / 1_000_000,
        );
    }
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

/// Wall clock in whole seconds since the Unix epoch.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
