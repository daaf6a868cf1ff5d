//! `capture-buffers`: the reassembly side of the station.
//!
//! Consumer state machines write decoded packet payloads into typed
//! multi-dimensional containers (one dense backing array per mode, pinned
//! and page-aligned), or straight into an N-slot double buffer for the
//! flows that hand whole epochs to a persister thread. Containers are
//! single-threaded (consumer-only); double-buffer slots are shared with
//! the persister under a per-slot mutex.

mod callback;
mod containers;
mod double_buffer;
mod ring;
mod tile_map;

pub use callback::{
    AntennaBufferMeta, BeamMeta, CallbackMeta, ChannelMeta, CorrelatorMeta, DataCallback,
    DynamicCallback, RawMeta, SimpleCallback, StationBeamMeta, StreamMeta,
};
pub use containers::{
    AntennaBufferContainer, BeamBurstContainer, BeamIntegratedContainer, ChannelContainer,
    RawContainer,
};
pub use double_buffer::{
    DbConsumer, DbProducer, DoubleBufferConfig, ReadySlot, WriteOutcome, double_buffer,
    double_buffer_with_stores,
};
pub use ring::ContainerRing;
pub use tile_map::TileMap;
