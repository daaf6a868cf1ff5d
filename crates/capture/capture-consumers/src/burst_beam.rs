use crate::consumer::{Consumer, ConsumerError, StreamTracker, standard};
use capture_buffers::{BeamBurstContainer, BeamMeta, CallbackMeta, DataCallback};
use capture_config::ConsumerConfig;
use capture_receiver::PacketFilter;
use stratum_mem::decode_samples;
use stratum_spead::{FlowKind, PacketSummary, SpeadPacket, TPM_TICK_SECONDS, TileInfo};
use tracing::debug;

/// Burst beam consumer (capture mode 0x8).
///
/// Each packet contributes a contiguous slab of 32-bit complex words at
/// the offset carried by item 0x3300; consecutive words interleave the
/// two polarisations. Persists on stream end.
pub struct BurstBeamConsumer {
    nof_channels: usize,
    container: BeamBurstContainer<u32>,
    callback: Option<DataCallback>,
    tracker: StreamTracker,
    scratch: Vec<u32>,
}

pub(crate) fn factory(cfg: &ConsumerConfig) -> Result<Box<dyn Consumer>, ConsumerError> {
    Ok(Box::new(BurstBeamConsumer::new(cfg)?))
}

impl BurstBeamConsumer {
    pub fn new(cfg: &ConsumerConfig) -> Result<Self, ConsumerError> {
        let dims = cfg.require(&["nof_tiles", "nof_channels", "nof_samples", "nof_pols"])?;
        Ok(Self {
            nof_channels: dims["nof_channels"],
            container: BeamBurstContainer::new(
                dims["nof_tiles"],
                dims["nof_pols"],
                dims["nof_samples"],
                dims["nof_channels"],
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
        self.container.persist(&mut self.callback, |_tile, packets| {
            let mut stream = stream;
            stream.nof_packets = packets;
            CallbackMeta::Beam(BeamMeta {
                stream,
                beam_id: 0,
                nof_beams: 1,
                nof_channels,
            })
        });
        self.tracker.reset_epoch();
    }
}

impl Consumer for BurstBeamConsumer {
    fn filter(&self) -> PacketFilter {
        PacketFilter::flows(&[FlowKind::BurstBeam])
    }

    fn set_callback(&mut self, callback: DataCallback) {
        self.callback = Some(callback);
    }

    fn process_packet(&mut self, packet: &[u8]) {
        let Some(parsed) = SpeadPacket::parse(packet) else {
            return;
        };
        let s = PacketSummary::scan(&parsed);
        let Some(tile_v) = s.beam_tile_info.or(s.tile_info) else {
            return;
        };
        let Some(std) = standard(&s, TPM_TICK_SECONDS) else {
            return;
        };
        let tile = TileInfo::from_value(tile_v);

        let payload = parsed.payload();
        let end = std.payload_length.min(payload.len());
        decode_samples(&payload[..end], &mut self.scratch);
        if self.scratch.is_empty() {
            return;
        }

        // 0x3300 is the slab's byte offset in the tile's element stream.
        let offset = std.payload_offset / size_of::<u32>();
        if !self
            .container
            .add_slab(tile.tile_id, offset, &self.scratch, std.time)
        {
            debug!(offset, "burst-beam slab did not fit");
            return;
        }
        self.tracker.observe(tile.station_id, &std, std.counter.counter24());
    }

    fn on_stream_end(&mut self) {
        self.persist();
    }

    fn cleanup(&mut self) {
        self.container.clear();
    }
}
