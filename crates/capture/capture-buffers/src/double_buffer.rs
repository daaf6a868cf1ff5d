//! N-slot double buffer between a reassembly state machine and its
//! persister thread.
//!
//! The producer keeps two epochs open at once: the slot it is filling and
//! the previous one, which still accepts late packets. Advancing an epoch
//! finalises the slot two behind the new producer position as `Ready`.
//! Each slot carries its own mutex and condvar; the producer takes a slot
//! lock only for state transitions and payload writes, the consumer holds
//! it while the persister drains the slot. A producer that catches up
//! with an unreleased slot waits a bounded interval for the consumer and
//! then reclaims the slot, counting a lost push.

use parking_lot::{Condvar, Mutex, MutexGuard};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use stratum_mem::{MemError, PinnedBuffer, Sample, SampleStore};
use tracing::warn;

/// How long the producer waits for the consumer to release a slot before
/// overwriting it.
const BUSY_SLOT_WAIT: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Empty,
    Producing,
    Ready,
    Consuming,
}

/// Where a write landed, for accounting and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Into the current epoch.
    Current,
    /// Late packet, into the previous epoch.
    Previous,
    /// Older than the previous epoch's base; dropped silently.
    DroppedTooLate,
    /// The next slot never became free within the bounded wait.
    DroppedBusy,
}

struct DbSlot<T: Sample> {
    store: SampleStore<T>,
    state: SlotState,
    /// Minimum packet time absorbed into this slot.
    ref_time: f64,
    /// Generational sequence number, assigned when the slot is claimed.
    seq: u64,
    /// First key of the epoch held by this slot.
    epoch_base: u64,
    /// Logical channel or sample index recorded by the producer.
    index: u64,
    packets: u64,
    samples: u64,
}

impl<T: Sample> DbSlot<T> {
    fn reset(&mut self) {
        self.store.clear();
        self.state = SlotState::Empty;
        self.ref_time = f64::MAX;
        self.epoch_base = 0;
        self.index = 0;
        self.packets = 0;
        self.samples = 0;
    }
}

struct SharedDb<T: Sample> {
    slots: Vec<(Mutex<DbSlot<T>>, Condvar)>,
    lost_pushes: AtomicU64,
}

#[derive(Debug, Clone, Copy)]
pub struct DoubleBufferConfig {
    /// Slot count; power of two, typically 4–8.
    pub nof_slots: usize,
    /// Samples per slot.
    pub slot_len: usize,
    /// Keys per epoch: a write whose key is `epoch_size` past the slot's
    /// base finalises the epoch.
    pub epoch_size: u64,
}

/// Creates a double buffer with owned pinned slot memory.
pub fn double_buffer<T: Sample>(
    cfg: DoubleBufferConfig,
) -> Result<(DbProducer<T>, DbConsumer<T>), MemError> {
    let mut stores = Vec::with_capacity(cfg.nof_slots);
    for _ in 0..cfg.nof_slots {
        stores.push(SampleStore::Owned(PinnedBuffer::alloc(cfg.slot_len)?));
    }
    Ok(double_buffer_with_stores(cfg, stores))
}

/// Creates a double buffer over caller-supplied slot backing — the GPU
/// path hands in externally allocated write-combined pinned memory here.
pub fn double_buffer_with_stores<T: Sample>(
    cfg: DoubleBufferConfig,
    stores: Vec<SampleStore<T>>,
) -> (DbProducer<T>, DbConsumer<T>) {
    assert!(cfg.nof_slots.is_power_of_two(), "slot count must be power of 2");
    assert!(cfg.nof_slots >= 2 && cfg.epoch_size > 0);
    assert_eq!(stores.len(), cfg.nof_slots);
    let shared = Arc::new(SharedDb {
        slots: stores
            .into_iter()
            .map(|store| {
                (
                    Mutex::new(DbSlot {
                        store,
                        state: SlotState::Empty,
                        ref_time: f64::MAX,
                        seq: 0,
                        epoch_base: 0,
                        index: 0,
                        packets: 0,
                        samples: 0,
                    }),
                    Condvar::new(),
                )
            })
            .collect(),
        lost_pushes: AtomicU64::new(0),
    });
    (
        DbProducer {
            shared: shared.clone(),
            cfg,
            current: 0,
            started: false,
            next_seq: 0,
        },
        DbConsumer { shared, current: 0 },
    )
}

/// Producer side; owned by the consumer state machine thread.
pub struct DbProducer<T: Sample> {
    shared: Arc<SharedDb<T>>,
    cfg: DoubleBufferConfig,
    current: usize,
    started: bool,
    next_seq: u64,
}

impl<T: Sample> DbProducer<T> {
    /// Writes one packet's worth of samples for `key` (the rollover-
    /// corrected packet/sample counter). `fill` receives the slot's
    /// sample array and the slot's epoch base, and returns the number of
    /// samples written.
    pub fn write_data<F>(&mut self, key: u64, index: u64, time: f64, fill: F) -> WriteOutcome
    where
        F: FnOnce(&mut [T], u64) -> u64,
    {
        let n = self.cfg.nof_slots;

        if !self.started {
            self.claim_slot(self.current, key, index);
            self.started = true;
            let (m, _) = &self.shared.slots[self.current];
            Self::emit(&mut m.lock(), time, fill);
            return WriteOutcome::Current;
        }

        let cur_base = {
            let (m, _) = &self.shared.slots[self.current];
            m.lock().epoch_base
        };

        // A jump far beyond the open epochs means the counter restarted
        // (or the packet is garbage that still parsed). Flush what is
        // open and re-base rather than rotating through it.
        if key > cur_base && (key - cur_base) / self.cfg.epoch_size > (2 * n) as u64 {
            self.finalise_open_epochs();
            self.claim_slot(self.current, key, index);
            self.started = true;
            let (m, _) = &self.shared.slots[self.current];
            Self::emit(&mut m.lock(), time, fill);
            return WriteOutcome::Current;
        }

        // Late packet: before the current epoch. Goes to the previous
        // slot when it belongs there, otherwise it is dropped silently.
        if key < cur_base {
            let prev = (self.current + n - 1) % n;
            let (m, _) = &self.shared.slots[prev];
            let mut slot = m.lock();
            if slot.state == SlotState::Producing && key >= slot.epoch_base {
                Self::emit(&mut slot, time, fill);
                return WriteOutcome::Previous;
            }
            return WriteOutcome::DroppedTooLate;
        }

        // Epoch advance(s). Each advance finalises the slot two behind
        // the new producer position and claims the next slot.
        while {
            let (m, _) = &self.shared.slots[self.current];
            key - m.lock().epoch_base >= self.cfg.epoch_size
        } {
            let two_behind = (self.current + n - 1) % n;
            {
                let (m, c) = &self.shared.slots[two_behind];
                let mut slot = m.lock();
                if slot.state == SlotState::Producing {
                    slot.state = SlotState::Ready;
                    c.notify_one();
                }
            }

            let new_base = {
                let (m, _) = &self.shared.slots[self.current];
                // The slot left behind stays Producing for late packets.
                m.lock().epoch_base + self.cfg.epoch_size
            };

            self.current = (self.current + 1) % n;
            self.claim_slot(self.current, new_base, index);
        }

        let (m, _) = &self.shared.slots[self.current];
        let mut slot = m.lock();
        Self::emit(&mut slot, time, fill);
        WriteOutcome::Current
    }

    /// Finalises the current and previous epochs regardless of fill —
    /// stream-end flush. The producer position moves past the flushed
    /// slots so it stays aligned with the consumer's read order.
    pub fn finalise_open_epochs(&mut self) {
        if !self.started {
            return;
        }
        let n = self.cfg.nof_slots;
        for idx in [(self.current + n - 1) % n, self.current] {
            let (m, c) = &self.shared.slots[idx];
            let mut slot = m.lock();
            if slot.state == SlotState::Producing && slot.packets > 0 {
                slot.state = SlotState::Ready;
                c.notify_one();
            } else if slot.state == SlotState::Producing {
                slot.reset();
            }
        }
        self.current = (self.current + 1) % n;
        self.started = false;
    }

    pub fn lost_pushes(&self) -> u64 {
        self.shared.lost_pushes.load(Ordering::Relaxed)
    }

    /// Locks slot `idx`, waits a bounded interval if the consumer still
    /// owns it (reclaiming on timeout), and claims it for a new epoch.
    fn claim_slot(&mut self, idx: usize, base: u64, index: u64) {
        let (m, c) = &self.shared.slots[idx];
        let mut slot = m.lock();
        if slot.state != SlotState::Empty {
            c.wait_for(&mut slot, BUSY_SLOT_WAIT);
            if slot.state != SlotState::Empty {
                warn!(
                    seq = slot.seq,
                    state = ?slot.state,
                    "double-buffer slot not released in time, overwriting"
                );
                self.shared.lost_pushes.fetch_add(1, Ordering::Relaxed);
                slot.reset();
            }
        }
        slot.state = SlotState::Producing;
        slot.epoch_base = base;
        slot.index = index;
        slot.seq = self.next_seq;
        self.next_seq += 1;
    }

    fn emit<F>(slot: &mut DbSlot<T>, time: f64, fill: F)
    where
        F: FnOnce(&mut [T], u64) -> u64,
    {
        let base = slot.epoch_base;
        let written = fill(slot.store.as_mut_slice(), base);
        slot.packets += 1;
        slot.samples += written;
        if time < slot.ref_time {
            slot.ref_time = time;
        }
    }
}

/// Consumer side; owned by the persister thread.
pub struct DbConsumer<T: Sample> {
    shared: Arc<SharedDb<T>>,
    current: usize,
}

impl<T: Sample> DbConsumer<T> {
    /// Returns the next slot if it is ready, else `None` (the persister
    /// sleeps briefly and retries). Dropping the returned guard clears
    /// the slot and advances the read position.
    pub fn read_buffer(&mut self) -> Option<ReadySlot<'_, T>> {
        let n = self.shared.slots.len();
        let (m, c) = &self.shared.slots[self.current];
        let mut guard = m.lock();
        if guard.state != SlotState::Ready {
            return None;
        }
        guard.state = SlotState::Consuming;
        Some(ReadySlot {
            guard,
            cond: c,
            cursor: &mut self.current,
            nof_slots: n,
        })
    }
}

/// A drained double-buffer slot. Dereferencing yields the sample bytes;
/// dropping the guard releases the slot back to the producer — also on
/// panic inside the callback, so an unwinding sink cannot wedge a slot in
/// `Consuming`.
pub struct ReadySlot<'a, T: Sample> {
    guard: MutexGuard<'a, DbSlot<T>>,
    cond: &'a Condvar,
    cursor: &'a mut usize,
    nof_slots: usize,
}

impl<T: Sample> ReadySlot<'_, T> {
    pub fn as_bytes(&self) -> &[u8] {
        self.guard.store.as_bytes()
    }

    pub fn as_samples(&self) -> &[T] {
        self.guard.store.as_slice()
    }

    pub fn ref_time(&self) -> f64 {
        if self.guard.ref_time == f64::MAX {
            0.0
        } else {
            self.guard.ref_time
        }
    }

    pub fn seq(&self) -> u64 {
        self.guard.seq
    }

    /// Logical channel or sample index recorded by the producer.
    pub fn index(&self) -> u64 {
        self.guard.index
    }

    pub fn epoch_base(&self) -> u64 {
        self.guard.epoch_base
    }

    pub fn packets(&self) -> u64 {
        self.guard.packets
    }

    pub fn samples(&self) -> u64 {
        self.guard.samples
    }
}

impl<T: Sample> Drop for ReadySlot<'_, T> {
    fn drop(&mut self) {
        self.guard.reset();
        self.cond.notify_one();
        *self.cursor = (*self.cursor + 1) % self.nof_slots;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(nof_slots: usize, slot_len: usize, epoch_size: u64) -> DoubleBufferConfig {
        DoubleBufferConfig {
            nof_slots,
            slot_len,
            epoch_size,
        }
    }

    /// Writes `v` at the key's offset within the epoch.
    fn stamp(v: u16) -> impl FnOnce(&mut [u16], u64) -> u64 {
        move |slot, _base| {
            slot[v as usize % slot.len()] = v;
            1
        }
    }

    #[test]
    fn epochs_become_ready_in_sequence() {
        let (mut p, mut c) = double_buffer::<u16>(cfg(4, 16, 8)).unwrap();

        for key in 0..8 {
            assert_eq!(p.write_data(key, 0, 100.0 + key as f64, stamp(key as u16)), WriteOutcome::Current);
        }
        // Nothing ready yet: epoch 0 is still open for late packets.
        assert!(c.read_buffer().is_none());

        // Crossing into epoch 1 then epoch 2 finalises epoch 0.
        for key in 8..24 {
            p.write_data(key, 0, 100.0 + key as f64, stamp(key as u16));
        }
        let slot = c.read_buffer().expect("epoch 0 ready");
        assert_eq!(slot.seq(), 0);
        assert_eq!(slot.epoch_base(), 0);
        assert_eq!(slot.packets(), 8);
        assert_eq!(slot.ref_time(), 100.0);
        drop(slot);

        // Force the next two epochs out.
        for key in 24..40 {
            p.write_data(key, 0, 100.0 + key as f64, stamp(key as u16));
        }
        let slot = c.read_buffer().expect("epoch 1 ready");
        assert_eq!(slot.seq(), 1);
        assert_eq!(slot.epoch_base(), 8);
        drop(slot);
        let slot = c.read_buffer().expect("epoch 2 ready");
        assert_eq!(slot.seq(), 2);
        assert_eq!(slot.epoch_base(), 16);
    }

    #[test]
    fn late_packets_land_in_previous_epoch() {
        let (mut p, mut c) = double_buffer::<u16>(cfg(4, 16, 8)).unwrap();
        for key in 0..12 {
            p.write_data(key, 0, 1.0, stamp(key as u16));
        }
        // Key 5 precedes the current epoch (base 8) but fits the previous.
        assert_eq!(p.write_data(5, 0, 1.0, stamp(5)), WriteOutcome::Previous);

        // Force epoch 0 ready; its packet count includes the late packet.
        for key in 16..24 {
            p.write_data(key, 0, 1.0, stamp(key as u16));
        }
        let slot = c.read_buffer().unwrap();
        assert_eq!(slot.epoch_base(), 0);
        assert_eq!(slot.packets(), 9);
        drop(slot);

        // A key older than the previous epoch's base is dropped silently.
        assert_eq!(p.write_data(2, 0, 1.0, stamp(2)), WriteOutcome::DroppedTooLate);
    }

    #[test]
    fn unreleased_slot_is_reclaimed_and_counted() {
        // Two slots: the producer laps the consumer immediately.
        let (mut p, _c) = double_buffer::<u16>(cfg(2, 16, 4)).unwrap();
        for key in 0..32 {
            p.write_data(key, 0, 1.0, stamp(key as u16));
        }
        // Slots were finalised but never consumed; every advance past a
        // Ready slot is a lost push.
        assert!(p.lost_pushes() > 0);
    }

    #[test]
    fn flush_finalises_partial_epochs() {
        let (mut p, mut c) = double_buffer::<u16>(cfg(4, 16, 8)).unwrap();
        for key in 0..3 {
            p.write_data(key, 7, 5.0, stamp(key as u16));
        }
        assert!(c.read_buffer().is_none());
        p.finalise_open_epochs();
        let slot = c.read_buffer().expect("flushed epoch ready");
        assert_eq!(slot.packets(), 3);
        assert_eq!(slot.index(), 7);
        drop(slot);
        assert!(c.read_buffer().is_none());
    }

    #[test]
    fn external_store_reaches_the_consumer() {
        let mut host = vec![0u16; 32];
        let ptr = host.as_mut_ptr();
        let stores = vec![
            SampleStore::External(unsafe { stratum_mem::ExternalBuffer::from_raw_parts(ptr, 16) }),
            SampleStore::External(unsafe {
                stratum_mem::ExternalBuffer::from_raw_parts(ptr.wrapping_add(16), 16)
            }),
            SampleStore::Owned(PinnedBuffer::alloc(16).unwrap()),
            SampleStore::Owned(PinnedBuffer::alloc(16).unwrap()),
        ];
        let (mut p, mut c) = double_buffer_with_stores::<u16>(cfg(4, 16, 4), stores);
        for key in 0..12 {
            p.write_data(key, 0, 1.0, |slot, base| {
                slot[(key - base) as usize] = key as u16;
                1
            });
        }
        let slot = c.read_buffer().unwrap();
        assert_eq!(&slot.as_samples()[..4], &[0, 1, 2, 3]);
    }
}
