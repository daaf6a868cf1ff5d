//! `stratum-spead`: allocation-free SPEAD-64-48 packet parsing.
//!
//! TPMs emit one SPEAD heap per UDP datagram: an 8-byte header, a table of
//! 8-byte item pointers, then the payload. Everything here is a pure
//! function over a borrowed byte slice — no allocation, no side effects.
//! Pointer arithmetic stays inside this crate; callers only ever see typed
//! views decoded by value.
//!
//! # Wire layout
//!
//! ```text
//! ┌────────┬─────────┬───────────┬───────────┬──────────┬──────────┐
//! │ magic  │ version │ item-ptr  │ heap-addr │ reserved │ n_items  │  (8 B)
//! │ 0x53   │ 0x04    │ width 2   │ width 6   │ (2 B)    │ (u16 BE) │
//! ├────────┴─────────┴───────────┴───────────┴──────────┴──────────┤
//! │ item pointer 0:  imm(1) | id(15) | value(48)          (u64 BE) │
//! │ item pointer 1                                                 │
//! │ ...                                                            │
//! ├────────────────────────────────────────────────────────────────┤
//! │ payload                                                        │
//! └────────────────────────────────────────────────────────────────┘
//! ```

mod items;
mod parser;
mod sim;

pub use items::{
    AntennaBufferInfo, BeamInfo, CaptureMode, ChannelInfo, FlowKind, HeapCounter, PacketSummary,
    RawAntennaInfo, StationBeamInfo, TileInfo, item_id,
};
pub use parser::{HEADER_LEN, ITEM_LEN, Item, ItemIter, SpeadPacket};
pub use sim::PacketBuilder;

/// Seconds per TPM timestamp tick for the channel, beam, raw and
/// antenna-buffer flows.
pub const TPM_TICK_SECONDS: f64 = 1.08e-6;

/// Seconds per station-beam timestamp tick (default scale).
pub const STATION_TICK_SECONDS: f64 = 1.0e-9;

/// Seconds per station-beam timestamp tick when a scan id (item 0x3010)
/// is present.
pub const STATION_SCAN_TICK_SECONDS: f64 = 1.0e-8;
