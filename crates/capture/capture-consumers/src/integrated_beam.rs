use crate::consumer::{Consumer, ConsumerError, StreamTracker, standard};
use capture_buffers::{BeamIntegratedContainer, BeamMeta, CallbackMeta, DataCallback};
use capture_config::ConsumerConfig;
use capture_receiver::PacketFilter;
use stratum_mem::decode_samples;
use stratum_spead::{BeamInfo, FlowKind, PacketSummary, SpeadPacket, TPM_TICK_SECONDS, TileInfo};
use tracing::debug;

/// Integrated beam consumer (capture modes 0x9 and 0x11).
///
/// A saved packet counter fixes the epoch base; each packet carries one
/// polarisation's spectrum for (beam, sample = counter − saved). The
/// epoch persists when the packet count reaches pols × tiles × samples ×
/// beams, or when an incoming counter runs nof_samples past the base.
pub struct IntegratedBeamConsumer {
    nof_tiles: usize,
    nof_beams: usize,
    nof_samples: usize,
    nof_pols: usize,
    nof_channels: usize,
    container: BeamIntegratedContainer<u32>,
    callback: Option<DataCallback>,
    tracker: StreamTracker,
    saved_counter: Option<u64>,
    scratch: Vec<u32>,
}

pub(crate) fn factory(cfg: &ConsumerConfig) -> Result<Box<dyn Consumer>, ConsumerError> {
    Ok(Box::new(IntegratedBeamConsumer::new(cfg)?))
}

impl IntegratedBeamConsumer {
    pub fn new(cfg: &ConsumerConfig) -> Result<Self, ConsumerError> {
        let dims = cfg.require(&[
            "nof_tiles",
            "nof_beams",
            "nof_channels",
            "nof_samples",
            "nof_pols",
        ])?;
        Ok(Self {
            nof_tiles: dims["nof_tiles"],
            nof_beams: dims["nof_beams"],
            nof_samples: dims["nof_samples"],
            nof_pols: dims["nof_pols"],
            nof_channels: dims["nof_channels"],
            container: BeamIntegratedContainer::new(
                dims["nof_tiles"],
                dims["nof_beams"],
                dims["nof_channels"],
                dims["nof_samples"],
                dims["nof_pols"],
            )?,
            callback: None,
            tracker: StreamTracker::default(),
            saved_counter: None,
            scratch: Vec::new(),
        })
    }

    fn target_packets(&self) -> u64 {
        (self.nof_pols * self.nof_tiles * self.nof_samples * self.nof_beams) as u64
    }

    fn persist(&mut self) {
        if !self.container.has_data() {
            return;
        }
        let stream = self.tracker.snapshot();
        let nof_beams = self.nof_beams as u16;
        let nof_channels = self.nof_channels as u16;
        self.container.persist(&mut self.callback, |_tile, packets| {
            let mut stream = stream;
            stream.nof_packets = packets;
            CallbackMeta::Beam(BeamMeta {
                stream,
                beam_id: 0,
                nof_beams,
                nof_channels,
            })
        });
        self.tracker.reset_epoch();
    }
}

impl Consumer for IntegratedBeamConsumer {
    fn filter(&self) -> PacketFilter {
        PacketFilter::flows(&[FlowKind::IntegratedBeam])
    }

    fn set_callback(&mut self, callback: DataCallback) {
        self.callback = Some(callback);
    }

    fn process_packet(&mut self, packet: &[u8]) {
        let Some(parsed) = SpeadPacket::parse(packet) else {
            return;
        };
        let s = PacketSummary::scan(&parsed);
        let (Some(tile_v), Some(beam_v)) = (s.beam_tile_info.or(s.tile_info), s.beam_info) else {
            return;
        };
        let Some(std) = standard(&s, TPM_TICK_SECONDS) else {
            return;
        };
        let tile = TileInfo::from_value(tile_v);
        let beam = BeamInfo::from_value(beam_v);
        if beam.nof_channels == 0 {
            return;
        }
        let pol = (tile.fpga_id as usize) % self.nof_pols.max(1);
        let counter = std.counter.counter24();

        let saved = *self.saved_counter.get_or_insert(counter);
        if counter.saturating_sub(saved) >= self.nof_samples as u64 {
            // The incoming packet opens the next integration window.
            self.persist();
            self.saved_counter = Some(counter);
        }
        let saved = self.saved_counter.unwrap_or(counter);
        // Counters behind the window base are leftovers of a persisted
        // epoch.
        let Some(sample) = counter.checked_sub(saved) else {
            return;
        };
        let sample = sample as usize;

        let payload = parsed.payload();
        let end = std.payload_length.min(payload.len());
        if std.payload_offset >= end {
            return;
        }
        decode_samples(&payload[std.payload_offset..end], &mut self.scratch);
        if self.scratch.len() < beam.nof_channels as usize {
            return;
        }

        if !self.container.add_spectrum(
            tile.tile_id,
            beam.beam_id as usize % self.nof_beams,
            beam.start_channel as usize,
            beam.nof_channels as usize,
            sample,
            pol,
            &self.scratch,
            std.time,
        ) {
            debug!(counter, "integrated-beam spectrum did not fit");
            return;
        }
        self.tracker.observe(tile.station_id, &std, counter);

        if self.container.total_packets() >= self.target_packets() {
            self.persist();
            // The next counter starts a fresh window.
            self.saved_counter = Some(counter + 1);
        }
    }

    fn on_stream_end(&mut self) {
        self.persist();
        self.saved_counter = None;
    }

    fn cleanup(&mut self) {
        self.container.clear();
    }
}
