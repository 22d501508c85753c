use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

/// Point-in-time snapshot of the meter, suitable for embedding in a
/// caller's own diagnostics endpoint.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Varz {
    pub start: u64,
    pub puts: u64,
    pub gets: u64,
    pub dels: u64,
    pub syncs: u64,
    pub recovers: u64,
    pub in_msgs: u64,
    pub out_msgs: u64,
    pub in_bytes: u64,
    pub out_bytes: u64,
    pub mem_size: u64,
    pub count: u64,
}

/// Operation counters updated on the hot paths.
#[derive(Debug, Default)]
pub struct Meter {
    start: u64,
    pub puts: AtomicU64,
    pub gets: AtomicU64,
    pub dels: AtomicU64,
    pub syncs: AtomicU64,
    pub recovers: AtomicU64,
    pub in_msgs: AtomicU64,
    pub out_msgs: AtomicU64,
    pub in_bytes: AtomicU64,
    pub out_bytes: AtomicU64,
}

impl Meter {
    pub fn new() -> Self {
        Self {
            start: unix_now(),
            ..Default::default()
        }
    }

    pub fn snapshot(&self) -> Varz {
        Varz {
            start: self.start,
            puts: self.puts.load(Ordering::Relaxed),
            gets: self.gets.load(Ordering::Relaxed),
            dels: self.dels.load(Ordering::Relaxed),
            syncs: self.syncs.load(Ordering::Relaxed),
            recovers: self.recovers.load(Ordering::Relaxed),
            in_msgs: self.in_msgs.load(Ordering::Relaxed),
            out_msgs: self.out_msgs.load(Ordering::Relaxed),
            in_bytes: self.in_bytes.load(Ordering::Relaxed),
            out_bytes: self.out_bytes.load(Ordering::Relaxed),
            mem_size: 0,
            count: 0,
        }
    }
}

/// Wall clock in unix seconds.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Wall clock in unix nanoseconds.
pub fn unix_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}
