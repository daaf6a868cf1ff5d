//! Shared fixtures for the capture benches.

use stratum_spead::{ChannelInfo, PacketBuilder, TileInfo, item_id};

/// A representative burst-channel packet: full item table plus an
/// 8 KB payload, the shape the receiver classifies at line rate.
pub fn sample_packet() -> Vec<u8> {
    PacketBuilder::new()
        .item(item_id::HEAP_COUNTER, 42)
        .item(item_id::PAYLOAD_LENGTH, 8192)
        .item(item_id::SYNC_TIME, 1_700_000_000)
        .item(item_id::TIMESTAMP, 123_456)
        .item(
            item_id::TILE_INFO,
            TileInfo {
                station_id: 1,
                tile_id: 3,
                fpga_id: 0,
            }
            .to_value(),
        )
        .item(
            item_id::CHANNEL_INFO,
            ChannelInfo {
                start_channel: 128,
                nof_channels: 1,
                start_antenna: 0,
                nof_included_antennas: 16,
            }
            .to_value(),
        )
        .item(item_id::CAPTURE_MODE, 0x4)
        .payload(&vec![0xA5u8; 8192])
        .build()
}
