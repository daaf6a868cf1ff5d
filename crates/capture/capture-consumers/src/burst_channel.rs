use crate::consumer::{Consumer, ConsumerError, StreamTracker, standard};
use capture_buffers::{CallbackMeta, ChannelContainer, ChannelMeta, DataCallback};
use capture_config::{Bitwidth, ConsumerConfig};
use capture_receiver::PacketFilter;
use stratum_mem::{Sample, decode_samples};
use stratum_spead::{ChannelInfo, FlowKind, PacketSummary, SpeadPacket, TPM_TICK_SECONDS, TileInfo};
use tracing::debug;

/// Burst channelised consumer (capture mode 0x4).
///
/// Packets carry a contiguous (channel × sample × antenna × pol) block;
/// the epoch has no counter-based boundary and persists on stream end.
pub struct BurstChannelConsumer<T: Sample> {
    nof_pols: usize,
    nof_samples: usize,
    bitwidth: u32,
    container: ChannelContainer<T>,
    callback: Option<DataCallback>,
    tracker: StreamTracker,
    first_channel: Option<u16>,
    scratch: Vec<T>,
}

pub(crate) fn factory(cfg: &ConsumerConfig) -> Result<Box<dyn Consumer>, ConsumerError> {
    match cfg.bitwidth() {
        Bitwidth::Bits16 => Ok(Box::new(BurstChannelConsumer::<u16>::new(cfg)?)),
        Bitwidth::Bits32 => Ok(Box::new(BurstChannelConsumer::<u32>::new(cfg)?)),
    }
}

impl<T: Sample> BurstChannelConsumer<T> {
    pub fn new(cfg: &ConsumerConfig) -> Result<Self, ConsumerError> {
        let dims = cfg.require(&[
            "nof_tiles",
            "nof_channels",
            "nof_samples",
            "nof_antennas",
            "nof_pols",
        ])?;
        Ok(Self {
            nof_pols: dims["nof_pols"],
            nof_samples: dims["nof_samples"],
            bitwidth: cfg.bitwidth,
            container: ChannelContainer::new(
                dims["nof_tiles"],
                dims["nof_channels"],
                dims["nof_samples"],
                dims["nof_antennas"],
                dims["nof_pols"],
            )?,
            callback: None,
            tracker: StreamTracker::default(),
            first_channel: None,
            scratch: Vec::new(),
        })
    }

    fn persist(&mut self) {
        if !self.container.has_data() {
            return;
        }
        let stream = self.tracker.snapshot();
        let start_channel = self.first_channel.unwrap_or(0);
        let bitwidth = self.bitwidth;
        self.container.persist(&mut self.callback, 0, |_tile, packets| {
            let mut stream = stream;
            stream.nof_packets = packets;
            CallbackMeta::Channel(ChannelMeta {
                stream,
                start_channel,
                nof_channels: 0,
                bitwidth,
                buffer_counter: 0,
            })
        });
        self.tracker.reset_epoch();
        self.first_channel = None;
    }
}

impl<T: Sample> Consumer for BurstChannelConsumer<T> {
    fn filter(&self) -> PacketFilter {
        PacketFilter::flows(&[FlowKind::BurstChannel])
    }

    fn set_callback(&mut self, callback: DataCallback) {
        self.callback = Some(callback);
    }

    fn process_packet(&mut self, packet: &[u8]) {
        let Some(parsed) = SpeadPacket::parse(packet) else {
            return;
        };
        let s = PacketSummary::scan(&parsed);
        let (Some(tile_v), Some(chan_v)) = (s.tile_info, s.channel_info) else {
            return;
        };
        let Some(std) = standard(&s, TPM_TICK_SECONDS) else {
            return;
        };
        let tile = TileInfo::from_value(tile_v);
        let info = ChannelInfo::from_value(chan_v);
        if info.nof_channels == 0 || info.nof_included_antennas == 0 {
            return;
        }

        let payload = parsed.payload();
        let end = std.payload_length.min(payload.len());
        if std.payload_offset >= end {
            return;
        }
        decode_samples(&payload[std.payload_offset..end], &mut self.scratch);

        let block = info.nof_channels as usize * info.nof_included_antennas as usize * self.nof_pols;
        let samples = self.scratch.len() / block;
        if samples == 0 {
            return;
        }
        let counter = std.counter.counter24();
        let start_sample = (counter as usize * samples) % self.nof_samples;

        if !self.container.add_data(
            tile.tile_id,
            info.start_channel as usize,
            info.nof_channels as usize,
            start_sample,
            samples,
            info.start_antenna as usize,
            info.nof_included_antennas as usize,
            &self.scratch,
            std.time,
        ) {
            debug!(counter, "burst-channel packet did not fit its container");
            return;
        }

        self.tracker.observe(tile.station_id, &std, counter);
        if self.first_channel.is_none() {
            self.first_channel = Some(info.start_channel);
        }
    }

    fn on_stream_end(&mut self) {
        self.persist();
    }

    fn cleanup(&mut self) {
        self.container.clear();
    }
}
