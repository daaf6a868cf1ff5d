use crate::parser::SpeadPacket;

/// Item ids recognised by the station. Anything else is carried through
/// the parser untouched and ignored by the consumers.
pub mod item_id {
    /// Heap counter: packet counter + packet index.
    pub const HEAP_COUNTER: u16 = 0x0001;
    /// Payload length in bytes.
    pub const PAYLOAD_LENGTH: u16 = 0x0004;
    /// Absolute RF frequency. Presence marks a station-beam packet.
    pub const FREQUENCY: u16 = 0x1011;
    /// Sync time, Unix seconds.
    pub const SYNC_TIME: u16 = 0x1027;
    /// Timestamp, ticks since sync.
    pub const TIMESTAMP: u16 = 0x1600;
    /// Raw-antenna info: start antenna + included count.
    pub const RAW_ANTENNA_INFO: u16 = 0x2000;
    /// Tile info: station, tile, polarisation/FPGA id.
    pub const TILE_INFO: u16 = 0x2001;
    /// Channel/antenna info for channelised data.
    pub const CHANNEL_INFO: u16 = 0x2002;
    /// Tile info for beam data.
    pub const BEAM_TILE_INFO: u16 = 0x2003;
    /// Capture mode: identifies the flow.
    pub const CAPTURE_MODE: u16 = 0x2004;
    /// Beam-channel info.
    pub const BEAM_INFO: u16 = 0x2005;
    /// Antenna-buffer antenna info.
    pub const ANTENNA_BUFFER_INFO: u16 = 0x2006;
    /// Station-beam antenna/channel info.
    pub const STATION_BEAM_INFO: u16 = 0x3000;
    /// Station-beam tile info.
    pub const STATION_TILE_INFO: u16 = 0x3001;
    /// Scan id; presence also selects the 10 ns timestamp scale.
    pub const SCAN_ID: u16 = 0x3010;
    /// Offset of this packet's payload within the logical payload.
    pub const PAYLOAD_OFFSET: u16 = 0x3300;
}

/// Capture-mode values carried in item 0x2004.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CaptureMode {
    RawSingleAntenna = 0x0,
    RawMultiAntenna = 0x1,
    BurstChannel = 0x4,
    ContinuousChannel = 0x5,
    IntegratedChannel = 0x6,
    ContinuousChannelAlt = 0x7,
    BurstBeam = 0x8,
    IntegratedBeam = 0x9,
    IntegratedBeamAlt = 0x11,
    AntennaBuffer = 0xC,
}

impl CaptureMode {
    /// Decodes item 0x2004. `None` for mode values this station does not
    /// reassemble.
    pub fn from_value(v: u64) -> Option<Self> {
        Some(match v {
            0x0 => Self::RawSingleAntenna,
            0x1 => Self::RawMultiAntenna,
            0x4 => Self::BurstChannel,
            0x5 => Self::ContinuousChannel,
            0x6 => Self::IntegratedChannel,
            0x7 => Self::ContinuousChannelAlt,
            0x8 => Self::BurstBeam,
            0x9 => Self::IntegratedBeam,
            0x11 => Self::IntegratedBeamAlt,
            0xC => Self::AntennaBuffer,
            _ => return None,
        })
    }

    pub fn flow(self) -> FlowKind {
        match self {
            Self::RawSingleAntenna | Self::RawMultiAntenna => FlowKind::Raw,
            Self::BurstChannel => FlowKind::BurstChannel,
            Self::ContinuousChannel | Self::ContinuousChannelAlt => FlowKind::ContinuousChannel,
            Self::IntegratedChannel => FlowKind::IntegratedChannel,
            Self::BurstBeam => FlowKind::BurstBeam,
            Self::IntegratedBeam | Self::IntegratedBeamAlt => FlowKind::IntegratedBeam,
            Self::AntennaBuffer => FlowKind::AntennaBuffer,
        }
    }
}

/// The reassembly flow a packet belongs to. Station beam has no mode item;
/// it is identified by the presence of items 0x1011/0x3010.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlowKind {
    Raw,
    BurstChannel,
    ContinuousChannel,
    IntegratedChannel,
    BurstBeam,
    IntegratedBeam,
    AntennaBuffer,
    StationBeam,
}

impl FlowKind {
    /// Maps a capture-mode value to its flow. `None` for unknown modes.
    pub fn from_mode(mode: u64) -> Option<Self> {
        CaptureMode::from_value(mode).map(CaptureMode::flow)
    }
}

/// Heap counter (item 0x0001): packet counter in the low bits, packet
/// index above. Counter width is 24 bits for the TPM flows and 32 bits
/// for station beam.
#[derive(Debug, Clone, Copy)]
pub struct HeapCounter(pub u64);

impl HeapCounter {
    #[inline(always)]
    pub fn counter24(self) -> u64 {
        self.0 & 0x00FF_FFFF
    }

    #[inline(always)]
    pub fn index24(self) -> u64 {
        (self.0 >> 24) & 0x00FF_FFFF
    }

    #[inline(always)]
    pub fn counter32(self) -> u64 {
        self.0 & 0xFFFF_FFFF
    }

    #[inline(always)]
    pub fn index32(self) -> u64 {
        self.0 >> 32
    }
}

/// Tile info (items 0x2001 / 0x2003 / 0x3001).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileInfo {
    pub station_id: u16,
    pub tile_id: u16,
    /// Polarisation/FPGA id: 0 or 1 for the raw and antenna-buffer flows.
    pub fpga_id: u16,
}

impl TileInfo {
    #[inline(always)]
    pub fn from_value(v: u64) -> Self {
        Self {
            station_id: ((v >> 32) & 0xFFFF) as u16,
            tile_id: ((v >> 16) & 0xFFFF) as u16,
            fpga_id: (v & 0xFFFF) as u16,
        }
    }

    pub fn to_value(self) -> u64 {
        ((self.station_id as u64) << 32) | ((self.tile_id as u64) << 16) | self.fpga_id as u64
    }
}

/// Raw-antenna info (item 0x2000).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawAntennaInfo {
    pub start_antenna: u16,
    pub nof_included_antennas: u16,
}

impl RawAntennaInfo {
    #[inline(always)]
    pub fn from_value(v: u64) -> Self {
        Self {
            start_antenna: (v & 0xFFFF) as u16,
            nof_included_antennas: ((v >> 16) & 0xFFFF) as u16,
        }
    }

    pub fn to_value(self) -> u64 {
        ((self.nof_included_antennas as u64) << 16) | self.start_antenna as u64
    }
}

/// Channel/antenna info for channelised data (item 0x2002). Four fields
/// of 12 bits each fill the 48-bit immediate exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelInfo {
    pub start_channel: u16,
    /// Channels carried by this packet.
    pub nof_channels: u16,
    pub start_antenna: u16,
    pub nof_included_antennas: u16,
}

impl ChannelInfo {
    #[inline(always)]
    pub fn from_value(v: u64) -> Self {
        Self {
            start_channel: ((v >> 36) & 0xFFF) as u16,
            nof_channels: ((v >> 24) & 0xFFF) as u16,
            start_antenna: ((v >> 12) & 0xFFF) as u16,
            nof_included_antennas: (v & 0xFFF) as u16,
        }
    }

    pub fn to_value(self) -> u64 {
        ((self.start_channel as u64 & 0xFFF) << 36)
            | ((self.nof_channels as u64 & 0xFFF) << 24)
            | ((self.start_antenna as u64 & 0xFFF) << 12)
            | (self.nof_included_antennas as u64 & 0xFFF)
    }
}

/// Beam-channel info (item 0x2005).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BeamInfo {
    pub beam_id: u16,
    pub start_channel: u16,
    pub nof_channels: u16,
}

impl BeamInfo {
    #[inline(always)]
    pub fn from_value(v: u64) -> Self {
        Self {
            beam_id: ((v >> 32) & 0xFFFF) as u16,
            start_channel: ((v >> 16) & 0xFFFF) as u16,
            nof_channels: (v & 0xFFFF) as u16,
        }
    }

    pub fn to_value(self) -> u64 {
        ((self.beam_id as u64) << 32)
            | ((self.start_channel as u64) << 16)
            | self.nof_channels as u64
    }
}

/// Antenna-buffer antenna info (item 0x2006).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AntennaBufferInfo {
    pub start_antenna: u16,
    pub nof_included_antennas: u16,
}

impl AntennaBufferInfo {
    #[inline(always)]
    pub fn from_value(v: u64) -> Self {
        Self {
            start_antenna: ((v >> 16) & 0xFFFF) as u16,
            nof_included_antennas: (v & 0xFFFF) as u16,
        }
    }

    pub fn to_value(self) -> u64 {
        ((self.start_antenna as u64) << 16) | self.nof_included_antennas as u64
    }
}

/// Station-beam antenna/channel info (item 0x3000).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StationBeamInfo {
    pub nof_contributing_antennas: u16,
    pub logical_channel_id: u16,
    pub nof_channels: u16,
}

impl StationBeamInfo {
    #[inline(always)]
    pub fn from_value(v: u64) -> Self {
        Self {
            nof_contributing_antennas: ((v >> 32) & 0xFFFF) as u16,
            logical_channel_id: ((v >> 16) & 0xFFFF) as u16,
            nof_channels: (v & 0xFFFF) as u16,
        }
    }

    pub fn to_value(self) -> u64 {
        ((self.nof_contributing_antennas as u64) << 32)
            | ((self.logical_channel_id as u64) << 16)
            | self.nof_channels as u64
    }
}

/// All standard fields of one packet, gathered in a single pass over the
/// item table. Consumers read what their mode needs; absent items stay
/// `None` and the consumer drops the packet.
#[derive(Debug, Clone, Copy, Default)]
pub struct PacketSummary {
    pub heap_counter: Option<u64>,
    pub payload_length: Option<u64>,
    pub frequency: Option<u64>,
    pub sync_time: Option<u64>,
    pub timestamp: Option<u64>,
    pub raw_antenna_info: Option<u64>,
    pub tile_info: Option<u64>,
    pub channel_info: Option<u64>,
    pub beam_tile_info: Option<u64>,
    pub capture_mode: Option<u64>,
    pub beam_info: Option<u64>,
    pub antenna_buffer_info: Option<u64>,
    pub station_beam_info: Option<u64>,
    pub station_tile_info: Option<u64>,
    pub scan_id: Option<u64>,
    pub payload_offset: Option<u64>,
}

impl PacketSummary {
    pub fn scan(packet: &SpeadPacket<'_>) -> Self {
        let mut s = Self::default();
        for it in packet.items() {
            let slot = match it.id {
                item_id::HEAP_COUNTER => &mut s.heap_counter,
                item_id::PAYLOAD_LENGTH => &mut s.payload_length,
                item_id::FREQUENCY => &mut s.frequency,
                item_id::SYNC_TIME => &mut s.sync_time,
                item_id::TIMESTAMP => &mut s.timestamp,
                item_id::RAW_ANTENNA_INFO => &mut s.raw_antenna_info,
                item_id::TILE_INFO => &mut s.tile_info,
                item_id::CHANNEL_INFO => &mut s.channel_info,
                item_id::BEAM_TILE_INFO => &mut s.beam_tile_info,
                item_id::CAPTURE_MODE => &mut s.capture_mode,
                item_id::BEAM_INFO => &mut s.beam_info,
                item_id::ANTENNA_BUFFER_INFO => &mut s.antenna_buffer_info,
                item_id::STATION_BEAM_INFO => &mut s.station_beam_info,
                item_id::STATION_TILE_INFO => &mut s.station_tile_info,
                item_id::SCAN_ID => &mut s.scan_id,
                item_id::PAYLOAD_OFFSET => &mut s.payload_offset,
                _ => continue,
            };
            if slot.is_none() {
                *slot = Some(it.value);
            }
        }
        s
    }

    /// The flow this packet belongs to: station beam when the frequency or
    /// scan-id item is present, otherwise by capture mode.
    pub fn flow(&self) -> Option<FlowKind> {
        if self.frequency.is_some() || self.scan_id.is_some() {
            return Some(FlowKind::StationBeam);
        }
        FlowKind::from_mode(self.capture_mode?)
    }

    /// Packet time in Unix seconds given the per-mode tick scale.
    #[inline(always)]
    pub fn packet_time(&self, tick_seconds: f64) -> Option<f64> {
        Some(self.sync_time? as f64 + self.timestamp? as f64 * tick_seconds)
    }

    /// Station-beam tick scale: 10 ns when a scan id is present, 1 ns
    /// otherwise.
    #[inline(always)]
    pub fn station_tick_seconds(&self) -> f64 {
        if self.scan_id.is_some() {
            crate::STATION_SCAN_TICK_SECONDS
        } else {
            crate::STATION_TICK_SECONDS
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::PacketBuilder;

    #[test]
    fn composite_items_pack_and_unpack() {
        let t = TileInfo {
            station_id: 3,
            tile_id: 17,
            fpga_id: 1,
        };
        assert_eq!(TileInfo::from_value(t.to_value()), t);

        let c = ChannelInfo {
            start_channel: 204,
            nof_channels: 8,
            start_antenna: 8,
            nof_included_antennas: 4,
        };
        assert_eq!(ChannelInfo::from_value(c.to_value()), c);

        let b = StationBeamInfo {
            nof_contributing_antennas: 256,
            logical_channel_id: 7,
            nof_channels: 8,
        };
        assert_eq!(StationBeamInfo::from_value(b.to_value()), b);
    }

    #[test]
    fn heap_counter_widths() {
        let hc = HeapCounter((42 << 24) | 0x00AB_CDEF);
        assert_eq!(hc.counter24(), 0x00AB_CDEF);
        assert_eq!(hc.index24(), 42);

        let hc = HeapCounter((5 << 32) | 0xFFFF_FFFF);
        assert_eq!(hc.counter32(), 0xFFFF_FFFF);
        assert_eq!(hc.index32(), 5);
    }

    #[test]
    fn flow_classification() {
        for (mode, flow) in [
            (0x0, FlowKind::Raw),
            (0x1, FlowKind::Raw),
            (0x4, FlowKind::BurstChannel),
            (0x5, FlowKind::ContinuousChannel),
            (0x7, FlowKind::ContinuousChannel),
            (0x6, FlowKind::IntegratedChannel),
            (0x8, FlowKind::BurstBeam),
            (0x9, FlowKind::IntegratedBeam),
            (0x11, FlowKind::IntegratedBeam),
            (0xC, FlowKind::AntennaBuffer),
        ] {
            assert_eq!(FlowKind::from_mode(mode), Some(flow));
        }
        assert_eq!(FlowKind::from_mode(0x2), None);

        // Station beam: no mode item, identified by the frequency item.
        let pkt = PacketBuilder::new()
            .item(item_id::FREQUENCY, 229_687_500)
            .item(item_id::STATION_BEAM_INFO, 0)
            .build();
        let p = crate::SpeadPacket::parse(&pkt).unwrap();
        assert_eq!(PacketSummary::scan(&p).flow(), Some(FlowKind::StationBeam));
    }

    #[test]
    fn summary_single_scan_and_time() {
        let pkt = PacketBuilder::new()
            .item(item_id::SYNC_TIME, 1_700_000_000)
            .item(item_id::TIMESTAMP, 1_000_000)
            .item(item_id::CAPTURE_MODE, 0x4)
            .build();
        let p = crate::SpeadPacket::parse(&pkt).unwrap();
        let s = PacketSummary::scan(&p);
        assert_eq!(s.flow(), Some(FlowKind::BurstChannel));
        let t = s.packet_time(crate::TPM_TICK_SECONDS).unwrap();
        assert!((t - (1_700_000_000.0 + 1.08)).abs() < 1e-6);
        assert_eq!(s.station_tick_seconds(), crate::STATION_TICK_SECONDS);
    }
}
