//! `capture-consumers`: the per-mode reassembly state machines.
//!
//! A consumer owns the read side of one SPSC packet ring and one set of
//! reassembly buffers. Its thread loops on `pull_timeout`; every packet is
//! parsed, indexed and placed, and epoch boundaries trigger a handoff —
//! either a direct `persist` into the data callback (container modes) or
//! a double-buffer slot drained by a persister thread (station beam,
//! correlator).
//!
//! All consumers share the failure semantics of the wire: a packet that
//! does not parse, lacks a required item or does not fit its container is
//! dropped after the ring slot is released, without surfacing an error.

mod antenna_buffer;
mod burst_beam;
mod burst_channel;
mod consumer;
mod continuous_channel;
mod correlator;
mod integrated_beam;
mod integrated_channel;
mod persister;
mod raw;
mod station_beam;

pub use antenna_buffer::AntennaBufferConsumer;
pub use burst_beam::BurstBeamConsumer;
pub use burst_channel::BurstChannelConsumer;
pub use consumer::{Consumer, ConsumerError, ConsumerRunner, PULL_TIMEOUT};
pub use continuous_channel::ContinuousChannelConsumer;
pub use correlator::CorrelatorConsumer;
pub use integrated_beam::IntegratedBeamConsumer;
pub use integrated_channel::IntegratedChannelConsumer;
pub use persister::Persister;
pub use raw::RawConsumer;
pub use station_beam::StationBeamConsumer;

use capture_config::ConsumerConfig;

/// Registered consumer kinds, name → factory. The registry resolves
/// `load(name)` against this table.
pub fn builtin_factories() -> Vec<(
    &'static str,
    fn(&ConsumerConfig) -> Result<Box<dyn Consumer>, ConsumerError>,
)> {
    vec![
        ("raw", raw::factory),
        ("burst_channel", burst_channel::factory),
        ("continuous_channel", continuous_channel::factory),
        ("integrated_channel", integrated_channel::factory),
        ("burst_beam", burst_beam::factory),
        ("integrated_beam", integrated_beam::factory),
        ("station_beam", station_beam::factory),
        ("antenna_buffer", antenna_buffer::factory),
        ("correlator", correlator::factory),
    ]
}
