//! `capture-receiver`: the network side of the station.
//!
//! One receiver thread per interface. The thread owns one non-blocking
//! UDP socket per configured port, multiplexed with `poll(2)`; each
//! datagram is read once into a scratch buffer, classified against the
//! registered per-consumer packet filters, and copied into every matching
//! consumer's SPSC ring. Ports can be added while the thread runs.

mod filter;
mod receiver;

pub use filter::PacketFilter;
pub use receiver::{ConsumerPort, Receiver, ReceiverConfig, ReceiverError};
