use crate::consumer::{Consumer, ConsumerError, StreamTracker, standard};
use capture_buffers::{CallbackMeta, ChannelContainer, ChannelMeta, DataCallback};
use capture_config::{Bitwidth, ConsumerConfig};
use capture_receiver::PacketFilter;
use stratum_mem::{Sample, decode_samples};
use stratum_spead::{ChannelInfo, FlowKind, PacketSummary, SpeadPacket, TPM_TICK_SECONDS, TileInfo};
use tracing::debug;

/// Integrated channelised consumer (capture mode 0x6).
///
/// One container with a single sample slot; every packet is one
/// polarisation's spectrum for an antenna group. The epoch closes when
/// the packet count reaches antennas × pols × tiles / included_antennas.
pub struct IntegratedChannelConsumer<T: Sample> {
    nof_tiles: usize,
    nof_antennas: usize,
    nof_pols: usize,
    nof_channels: usize,
    bitwidth: u32,
    container: ChannelContainer<T>,
    callback: Option<DataCallback>,
    tracker: StreamTracker,
    scratch: Vec<T>,
}

pub(crate) fn factory(cfg: &ConsumerConfig) -> Result<Box<dyn Consumer>, ConsumerError> {
    match cfg.bitwidth() {
        Bitwidth::Bits16 => Ok(Box::new(IntegratedChannelConsumer::<u16>::new(cfg)?)),
        Bitwidth::Bits32 => Ok(Box::new(IntegratedChannelConsumer::<u32>::new(cfg)?)),
    }
}

impl<T: Sample> IntegratedChannelConsumer<T> {
    pub fn new(cfg: &ConsumerConfig) -> Result<Self, ConsumerError> {
        let dims = cfg.require(&["nof_tiles", "nof_channels", "nof_antennas", "nof_pols"])?;
        Ok(Self {
            nof_tiles: dims["nof_tiles"],
            nof_antennas: dims["nof_antennas"],
            nof_pols: dims["nof_pols"],
            nof_channels: dims["nof_channels"],
            bitwidth: cfg.bitwidth,
            container: ChannelContainer::new(
                dims["nof_tiles"],
                dims["nof_channels"],
                1,
                dims["nof_antennas"],
                dims["nof_pols"],
            )?,
            callback: None,
            tracker: StreamTracker::default(),
            scratch: Vec::new(),
        })
    }

    fn persist(&mut self) {
        if !self.container.has_data() {
            return;
        }
        let stream = self.tracker.snapshot();
        let nof_channels = self.nof_channels as u16;
        let bitwidth = self.bitwidth;
        self.container.persist(&mut self.callback, 0, |_tile, packets| {
            let mut stream = stream;
            stream.nof_packets = packets;
            CallbackMeta::Channel(ChannelMeta {
                stream,
                start_channel: 0,
                nof_channels,
                bitwidth,
                buffer_counter: 0,
            })
        });
        self.tracker.reset_epoch();
    }
}

impl<T: Sample> Consumer for IntegratedChannelConsumer<T> {
    fn filter(&self) -> PacketFilter {
        PacketFilter::flows(&[FlowKind::IntegratedChannel])
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
        let included = info.nof_included_antennas as usize;
        let pol = (tile.fpga_id as usize) % self.nof_pols.max(1);

        let payload = parsed.payload();
        let end = std.payload_length.min(payload.len());
        if std.payload_offset >= end {
            return;
        }
        decode_samples(&payload[std.payload_offset..end], &mut self.scratch);
        if self.scratch.len() < info.nof_channels as usize * included {
            return;
        }

        if !self.container.add_pol_data(
            tile.tile_id,
            info.start_channel as usize,
            info.nof_channels as usize,
            0,
            info.start_antenna as usize,
            included,
            pol,
            &self.scratch,
            std.time,
        ) {
            debug!("integrated-channel packet did not fit");
            return;
        }
        self.tracker.observe(tile.station_id, &std, std.counter.counter24());

        let target = (self.nof_antennas * self.nof_pols * self.nof_tiles / included) as u64;
        if self.container.total_packets() >= target {
            self.persist();
        }
    }

    fn on_stream_end(&mut self) {
        self.persist();
    }

    fn cleanup(&mut self) {
        self.container.clear();
    }
}
