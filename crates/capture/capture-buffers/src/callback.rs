//! Data-callback signatures and the per-mode metadata handed to dynamic
//! callbacks. Callbacks are plain function values owned by the consumer;
//! they hold no references back into the engine.

/// Fields every mode reports.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StreamMeta {
    pub station_id: u16,
    /// Payload length of the packets of this stream, bytes.
    pub payload_length: u32,
    /// Sync time of the stream, Unix seconds.
    pub sync_time: u64,
    /// Packets absorbed into the delivered buffer.
    pub nof_packets: u64,
    pub first_packet_counter: u64,
    pub last_packet_counter: u64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawMeta {
    pub stream: StreamMeta,
    /// FPGA ids observed for this tile (0, 1).
    pub fpga_ids: Vec<u16>,
    pub start_antenna: u16,
    pub nof_antennas: u16,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ChannelMeta {
    pub stream: StreamMeta,
    pub start_channel: u16,
    pub nof_channels: u16,
    /// Sample word width, bits.
    pub bitwidth: u32,
    /// Continuous mode: epoch sequence number of the delivered buffer.
    pub buffer_counter: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BeamMeta {
    pub stream: StreamMeta,
    pub beam_id: u16,
    pub nof_beams: u16,
    pub nof_channels: u16,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StationBeamMeta {
    pub stream: StreamMeta,
    /// First logical channel in the delivered buffer.
    pub start_channel: u16,
    pub nof_channels: u16,
    pub nof_samples: u64,
    /// RF frequency from item 0x1011.
    pub frequency: u64,
    pub scan_id: Option<u64>,
    /// Double-buffer slot sequence number; gaps mean lost epochs.
    pub buffer_counter: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AntennaBufferMeta {
    pub stream: StreamMeta,
    pub start_antenna: u16,
    pub nof_antennas: u16,
    /// Discovery-phase base: first global sample of buffer index 0.
    pub base_sample: u64,
    pub buffer_index: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CorrelatorMeta {
    pub stream: StreamMeta,
    pub channel_id: u16,
    pub nof_fine_channels: u32,
    pub buffer_counter: u64,
}

/// Mode-specific metadata delivered by the dynamic callback signature.
#[derive(Debug, Clone, PartialEq)]
pub enum CallbackMeta {
    Raw(RawMeta),
    Channel(ChannelMeta),
    Beam(BeamMeta),
    StationBeam(StationBeamMeta),
    AntennaBuffer(AntennaBufferMeta),
    Correlator(CorrelatorMeta),
}

/// Simple signature: data, timestamp, tile id, continuous-channel id.
pub type SimpleCallback = Box<dyn FnMut(&[u8], f64, u16, u16) + Send>;

/// Dynamic signature: data, timestamp, mode-specific metadata.
pub type DynamicCallback = Box<dyn FnMut(&[u8], f64, &CallbackMeta) + Send>;

/// A registered data callback in either signature.
pub enum DataCallback {
    Simple(SimpleCallback),
    Dynamic(DynamicCallback),
}

impl DataCallback {
    /// Invokes the callback with whichever arguments its signature takes.
    #[inline]
    pub fn invoke(&mut self, data: &[u8], timestamp: f64, tile: u16, channel: u16, meta: &CallbackMeta) {
        match self {
            Self::Simple(f) => f(data, timestamp, tile, channel),
            Self::Dynamic(f) => f(data, timestamp, meta),
        }
    }
}

impl std::fmt::Debug for DataCallback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Simple(_) => f.write_str("DataCallback::Simple"),
            Self::Dynamic(_) => f.write_str("DataCallback::Dynamic"),
        }
    }
}
