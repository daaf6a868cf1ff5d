//! `stratum-stats`: clocks and rolling throughput counters for the
//! receiver diagnostics. Counters are updated with relaxed atomics on the
//! hot path and turned into per-second rates on the (cold) query side.

use std::sync::atomic::{AtomicU64, Ordering};

/// Current monotonic time in nanoseconds.
#[inline(always)]
#[cfg(target_os = "macos")]
#[allow(deprecated)]
pub fn now_ns() -> u64 {
    use std::sync::OnceLock;
    static TIMEBASE: OnceLock<(u64, u64)> = OnceLock::new();
    let (numer, denom) = *TIMEBASE.get_or_init(|| {
        let mut info = libc::mach_timebase_info_data_t { numer: 0, denom: 0 };
        let rc = unsafe { libc::mach_timebase_info(&mut info) };
        if rc != 0 || info.denom == 0 {
            (1, 1)
        } else {
            (info.numer as u64, info.denom as u64)
        }
    });
    let t = unsafe { libc::mach_absolute_time() } as u128;
    ((t * numer as u128) / denom as u128) as u64
}

/// Current monotonic time in nanoseconds.
#[inline(always)]
#[cfg(not(target_os = "macos"))]
pub fn now_ns() -> u64 {
    let mut ts: libc::timespec = unsafe { core::mem::zeroed() };
    unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

/// Wall-clock Unix time in seconds, fractional.
#[inline(always)]
pub fn unix_now() -> f64 {
    let mut ts: libc::timespec = unsafe { core::mem::zeroed() };
    unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut ts) };
    ts.tv_sec as f64 + ts.tv_nsec as f64 * 1e-9
}

/// Hot-path interface counters. One instance per receiver interface,
/// shared with the diagnostics side behind an `Arc`.
#[derive(Debug, Default)]
pub struct ThroughputCounters {
    bytes: AtomicU64,
    packets: AtomicU64,
    drops: AtomicU64,
}

/// A point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub bytes: u64,
    pub packets: u64,
    pub drops: u64,
}

/// Per-second rates between two snapshots.
#[derive(Debug, Clone, Copy, Default)]
pub struct Rates {
    pub bytes_per_sec: f64,
    pub packets_per_sec: f64,
    pub drops_per_sec: f64,
}

impl ThroughputCounters {
    #[inline(always)]
    pub fn record_packet(&self, bytes: usize) {
        self.bytes.fetch_add(bytes as u64, Ordering::Relaxed);
        self.packets.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_drop(&self) {
        self.drops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            bytes: self.bytes.load(Ordering::Relaxed),
            packets: self.packets.load(Ordering::Relaxed),
            drops: self.drops.load(Ordering::Relaxed),
        }
    }
}

/// Rolling-rate window: remembers the previous snapshot and timestamp,
/// yielding per-second deltas each time it is sampled.
#[derive(Debug)]
pub struct RateWindow {
    last_ns: u64,
    last: Snapshot,
}

impl RateWindow {
    pub fn new(counters: &ThroughputCounters) -> Self {
        Self {
            last_ns: now_ns(),
            last: counters.snapshot(),
        }
    }

    pub fn sample(&mut self, counters: &ThroughputCounters) -> Rates {
        let now = now_ns();
        let snap = counters.snapshot();
        let dt = (now.saturating_sub(self.last_ns)) as f64 * 1e-9;
        let rates = if dt > 0.0 {
            Rates {
                bytes_per_sec: (snap.bytes - self.last.bytes) as f64 / dt,
                packets_per_sec: (snap.packets - self.last.packets) as f64 / dt,
                drops_per_sec: (snap.drops - self.last.drops) as f64 / dt,
            }
        } else {
            Rates::default()
        };
        self.last_ns = now;
        self.last = snap;
        rates
    }
}
