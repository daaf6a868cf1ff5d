use crate::ring::{RingConfig, seq_to_index};
use parking_lot::{Condvar, Mutex};
use std::cell::UnsafeCell;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Shared ring state. Slot bytes live in one contiguous allocation;
/// per-slot committed lengths sit beside it. The producer owns slots in
/// `[write_seq, read_seq + capacity)`, the consumer owns
/// `[read_seq, write_seq)`; the sequence counters are the only
/// synchronisation on the hot path.
struct Shared {
    cfg: RingConfig,
    mask: u64,
    /// capacity × slot_size bytes. Written only by the producer, and only
    /// for slots it currently owns; the cells keep the disjoint producer
    /// and consumer views legal.
    buf: Box<[UnsafeCell<u8>]>,
    /// Committed payload length per slot. Written by the producer before
    /// the slot is published, read by the consumer after.
    lens: Box<[UnsafeCell<u32>]>,
    /// Count of committed slots. Store is Release so the consumer's
    /// Acquire load sees the slot bytes and length.
    write_seq: AtomicU64,
    /// Count of released slots.
    read_seq: AtomicU64,
    /// Packets rejected because the ring was full.
    dropped: AtomicU64,
    /// Wakeup for a consumer blocked in `pull_timeout`.
    lock: Mutex<()>,
    cond: Condvar,
}

// SAFETY: the sequence counters partition slot ownership between exactly
// one producer and one consumer; neither side touches a slot it does not
// own, and publication/release go through Release/Acquire pairs.
unsafe impl Send for Shared {}
unsafe impl Sync for Shared {}

/// Creates a ring and splits it into its two handles.
pub fn channel(cfg: RingConfig) -> (RingProducer, RingConsumer) {
    let shared = Arc::new(Shared {
        cfg,
        mask: cfg.mask(),
        buf: (0..cfg.capacity * cfg.slot_size)
            .map(|_| UnsafeCell::new(0))
            .collect::<Vec<_>>()
            .into_boxed_slice(),
        lens: (0..cfg.capacity)
            .map(|_| UnsafeCell::new(0))
            .collect::<Vec<_>>()
            .into_boxed_slice(),
        write_seq: AtomicU64::new(0),
        read_seq: AtomicU64::new(0),
        dropped: AtomicU64::new(0),
        lock: Mutex::new(()),
        cond: Condvar::new(),
    });
    (
        RingProducer {
            shared: shared.clone(),
        },
        RingConsumer { shared },
    )
}

impl Shared {
    #[inline(always)]
    fn slot_range(&self, seq: u64) -> std::ops::Range<usize> {
        let idx = seq_to_index(seq, self.mask) as usize;
        let start = idx * self.cfg.slot_size;
        start..start + self.cfg.slot_size
    }

    #[inline(always)]
    fn occupancy(&self) -> usize {
        (self.write_seq.load(Ordering::Acquire) - self.read_seq.load(Ordering::Acquire)) as usize
    }
}

/// Producer side. One per ring, held by the network receiver.
pub struct RingProducer {
    shared: Arc<Shared>,
}

impl RingProducer {
    /// Returns the next writable slot, or `None` (and bumps the dropped
    /// counter) when the ring is full. Non-blocking.
    #[inline(always)]
    pub fn reserve(&mut self) -> Option<&mut [u8]> {
        let w = self.shared.write_seq.load(Ordering::Relaxed);
        let r = self.shared.read_seq.load(Ordering::Acquire);
        if w - r == self.shared.cfg.capacity as u64 {
            self.shared.dropped.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        let range = self.shared.slot_range(w);
        // SAFETY: slot `w` is outside [read_seq, write_seq), so the
        // consumer cannot observe it until commit() publishes it, and we
        // are the sole producer.
        unsafe {
            Some(std::slice::from_raw_parts_mut(
                self.shared.buf[range.start].get(),
                self.shared.cfg.slot_size,
            ))
        }
    }

    /// Publishes the slot reserved by the last `reserve()` with the given
    /// payload length.
    #[inline(always)]
    pub fn commit(&mut self, len: usize) {
        debug_assert!(len <= self.shared.cfg.slot_size);
        let w = self.shared.write_seq.load(Ordering::Relaxed);
        let idx = seq_to_index(w, self.shared.mask) as usize;
        // SAFETY: same ownership argument as reserve(); the Release store
        // below publishes this write.
        unsafe { *self.shared.lens[idx].get() = len as u32 };
        self.shared.write_seq.store(w + 1, Ordering::Release);
        // Take the lock so a consumer between its empty-check and its wait
        // cannot miss this wakeup.
        let _g = self.shared.lock.lock();
        self.shared.cond.notify_one();
    }

    /// Packets rejected so far because the ring was full.
    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    /// Committed-but-unreleased slot count.
    pub fn occupancy(&self) -> usize {
        self.shared.occupancy()
    }
}

/// Consumer side. One per ring, held by the consumer thread.
pub struct RingConsumer {
    shared: Arc<Shared>,
}

impl RingConsumer {
    /// Blocks up to `dt` for a readable slot. Returns `None` on timeout.
    /// The returned guard releases the slot when dropped.
    pub fn pull_timeout(&mut self, dt: Duration) -> Option<PacketSlot<'_>> {
        let r = self.shared.read_seq.load(Ordering::Relaxed);
        if self.shared.write_seq.load(Ordering::Acquire) == r {
            let mut g = self.shared.lock.lock();
            // Re-check under the lock; commit() notifies while holding it.
            if self.shared.write_seq.load(Ordering::Acquire) == r {
                self.shared.cond.wait_for(&mut g, dt);
            }
            drop(g);
            if self.shared.write_seq.load(Ordering::Acquire) == r {
                return None;
            }
        }
        let idx = seq_to_index(r, self.shared.mask) as usize;
        // SAFETY: slot `r` is inside [read_seq, write_seq): published by
        // the producer's Release store and not yet released by us.
        let len = unsafe { *self.shared.lens[idx].get() } as usize;
        let range = self.shared.slot_range(r);
        let bytes = unsafe {
            std::slice::from_raw_parts(self.shared.buf[range.start].get() as *const u8, len)
        };
        Some(PacketSlot {
            shared: &self.shared,
            seq: r,
            bytes,
        })
    }

    pub fn occupancy(&self) -> usize {
        self.shared.occupancy()
    }
}

/// A readable slot. Dereferences to the committed packet bytes; dropping
/// it marks the slot free and hands it back to the producer.
pub struct PacketSlot<'a> {
    shared: &'a Shared,
    seq: u64,
    bytes: &'a [u8],
}

impl Deref for PacketSlot<'_> {
    type Target = [u8];

    #[inline(always)]
    fn deref(&self) -> &[u8] {
        self.bytes
    }
}

impl Drop for PacketSlot<'_> {
    #[inline(always)]
    fn drop(&mut self) {
        self.shared
            .read_seq
            .store(self.seq + 1, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push(prod: &mut RingProducer, payload: &[u8]) -> bool {
        match prod.reserve() {
            Some(slot) => {
                slot[..payload.len()].copy_from_slice(payload);
                prod.commit(payload.len());
                true
            }
            None => false,
        }
    }

    #[test]
    fn fifo_order_and_lengths() {
        let (mut p, mut c) = channel(RingConfig::new(4, 64));
        for i in 0u8..3 {
            assert!(push(&mut p, &[i; 5]));
        }
        for i in 0u8..3 {
            let slot = c.pull_timeout(Duration::from_millis(10)).unwrap();
            assert_eq!(&*slot, &[i; 5]);
        }
        assert!(c.pull_timeout(Duration::from_millis(1)).is_none());
    }

    #[test]
    fn full_ring_drops_on_producer_side() {
        let (mut p, mut c) = channel(RingConfig::new(2, 16));
        assert!(push(&mut p, b"a"));
        assert!(push(&mut p, b"b"));
        assert!(!push(&mut p, b"c"));
        assert!(!push(&mut p, b"d"));
        assert_eq!(p.dropped(), 2);
        assert_eq!(p.occupancy(), 2);

        // Releasing one slot frees exactly one reservation, and the
        // dropped packets are gone for good.
        drop(c.pull_timeout(Duration::from_millis(1)).unwrap());
        assert!(push(&mut p, b"e"));
        let slot = c.pull_timeout(Duration::from_millis(1)).unwrap();
        assert_eq!(&*slot, b"b");
    }

    #[test]
    fn pull_timeout_expires_when_empty() {
        let (_p, mut c) = channel(RingConfig::new(2, 16));
        let t0 = std::time::Instant::now();
        assert!(c.pull_timeout(Duration::from_millis(20)).is_none());
        assert!(t0.elapsed() >= Duration::from_millis(15));
    }

    #[test]
    fn blocked_consumer_wakes_on_commit() {
        let (mut p, mut c) = channel(RingConfig::new(4, 16));
        let h = std::thread::spawn(move || {
            let slot = c.pull_timeout(Duration::from_secs(5)).expect("woken");
            slot.to_vec()
        });
        std::thread::sleep(Duration::from_millis(20));
        assert!(push(&mut p, b"wake"));
        assert_eq!(h.join().unwrap(), b"wake");
    }
}
