//! `stratum-ring`: bounded SPSC packet ring between the receiver thread
//! and one consumer thread.
//!
//! One ring per consumer. The receiver owns the producer handle and the
//! consumer thread owns the consumer handle — single producer and single
//! consumer are guaranteed by construction, not by runtime checks.
//!
//! # Protocol
//!
//! **Producer:** `reserve()` → copy the packet into the slot → `commit(len)`.
//! When the ring is full, `reserve()` returns `None` and bumps the dropped
//! counter; the oldest unread slot is never overwritten.
//!
//! **Consumer:** `pull_timeout(dt)` blocks up to `dt` for a readable slot
//! and returns a guard; dropping the guard releases the slot back to the
//! producer.
//!
//! # Ordering
//!
//! FIFO. A slot is written exactly once before it becomes readable and
//! read exactly once before it becomes free again.

mod ring;
mod spsc;

pub use ring::{RingConfig, seq_to_index};
pub use spsc::{PacketSlot, RingConsumer, RingProducer, channel};
