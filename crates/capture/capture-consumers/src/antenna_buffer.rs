use crate::consumer::{Consumer, ConsumerError, StreamTracker, standard};
use capture_buffers::{
    AntennaBufferContainer, AntennaBufferMeta, CallbackMeta, ContainerRing, DataCallback,
};
use capture_config::ConsumerConfig;
use capture_receiver::PacketFilter;
use stratum_mem::decode_samples;
use stratum_spead::{
    AntennaBufferInfo, FlowKind, PacketSummary, SpeadPacket, TPM_TICK_SECONDS, TileInfo,
};
use stratum_stats::now_ns;
use tracing::debug;

const NOF_CONTAINERS: usize = 4;

/// Samples per timestamp tick for the antenna-buffer stream: each tick
/// covers 864 × 256 / 8 ADC samples.
const SAMPLES_PER_TICK: u64 = 864 * 256 / 8;

/// Discovery phase length: wait this long for the first packet from every
/// FPGA before fixing the base sample.
const DISCOVERY_NS: u64 = 100_000;

/// Bound on packets stashed during discovery.
const DISCOVERY_STASH: usize = 4096;

/// Antenna-buffer consumer (capture mode 0xC).
///
/// A short discovery phase watches for the first packet from each of the
/// 2 × nof_tiles FPGAs and fixes `base_sample` as the maximum of their
/// first global sample indices; everything older is dropped. After
/// discovery, the global sample index maps to (buffer index, offset);
/// advancing the buffer index persists the outgoing container, one-behind
/// packets land in the previous container, older ones are dropped.
pub struct AntennaBufferConsumer {
    nof_tiles: usize,
    nof_antennas: usize,
    nof_pols: usize,
    nof_samples: usize,
    ring: ContainerRing<AntennaBufferContainer<i8>>,
    callback: Option<DataCallback>,
    tracker: StreamTracker,
    /// Discovery state: (tile, fpga) → first global sample seen.
    firsts: Vec<((u16, u16), u64)>,
    stash: Vec<Vec<u8>>,
    discovery_start_ns: Option<u64>,
    base_sample: Option<u64>,
    current_buffer: u64,
    scratch: Vec<i8>,
}

pub(crate) fn factory(cfg: &ConsumerConfig) -> Result<Box<dyn Consumer>, ConsumerError> {
    Ok(Box::new(AntennaBufferConsumer::new(cfg)?))
}

impl AntennaBufferConsumer {
    pub fn new(cfg: &ConsumerConfig) -> Result<Self, ConsumerError> {
        let dims = cfg.require(&["nof_tiles", "nof_antennas", "nof_samples", "nof_pols"])?;
        let mut containers = Vec::with_capacity(NOF_CONTAINERS);
        for _ in 0..NOF_CONTAINERS {
            containers.push(AntennaBufferContainer::new(
                dims["nof_tiles"],
                dims["nof_antennas"],
                dims["nof_samples"],
                dims["nof_pols"],
            )?);
        }
        Ok(Self {
            nof_tiles: dims["nof_tiles"],
            nof_antennas: dims["nof_antennas"],
            nof_pols: dims["nof_pols"],
            nof_samples: dims["nof_samples"],
            ring: ContainerRing::new(containers),
            callback: None,
            tracker: StreamTracker::default(),
            firsts: Vec::new(),
            stash: Vec::new(),
            discovery_start_ns: None,
            base_sample: None,
            current_buffer: 0,
            scratch: Vec::new(),
        })
    }

    pub fn base_sample(&self) -> Option<u64> {
        self.base_sample
    }

    fn global_sample(std_timestamp: u64, counter: u64, samples_per_packet: u64) -> u64 {
        std_timestamp * SAMPLES_PER_TICK + counter * samples_per_packet
    }

    fn persist_container(&mut self, idx: usize, buffer_index: u64) {
        if !self.ring.at_mut(idx).has_data() {
            return;
        }
        let _seq = self.ring.take_seq();
        let stream = self.tracker.snapshot();
        let base_sample = self.base_sample.unwrap_or(0);
        let nof_antennas = self.nof_antennas as u16;
        let container = self.ring.at_mut(idx);
        container.persist(&mut self.callback, 0, |_tile, packets| {
            let mut stream = stream;
            stream.nof_packets = packets;
            CallbackMeta::AntennaBuffer(AntennaBufferMeta {
                stream,
                start_antenna: 0,
                nof_antennas,
                base_sample,
                buffer_index,
            })
        });
        self.tracker.reset_epoch();
    }

    /// Fixes the base sample and replays the packets stashed while the
    /// discovery phase ran.
    fn finish_discovery(&mut self) {
        let base = self.firsts.iter().map(|&(_, g)| g).max().unwrap_or(0);
        self.base_sample = Some(base);
        debug!(base, fpgas = self.firsts.len(), "antenna-buffer discovery complete");
        let stash = std::mem::take(&mut self.stash);
        for packet in &stash {
            self.place_packet(packet);
        }
    }

    /// Post-discovery placement path.
    fn place_packet(&mut self, packet: &[u8]) {
        let Some(parsed) = SpeadPacket::parse(packet) else {
            return;
        };
        let s = PacketSummary::scan(&parsed);
        let (Some(tile_v), Some(info_v)) = (s.tile_info, s.antenna_buffer_info) else {
            return;
        };
        let Some(std) = standard(&s, TPM_TICK_SECONDS) else {
            return;
        };
        let tile = TileInfo::from_value(tile_v);
        let info = AntennaBufferInfo::from_value(info_v);
        if info.nof_included_antennas == 0 {
            return;
        }

        let payload = parsed.payload();
        let end = std.payload_length.min(payload.len());
        if std.payload_offset >= end {
            return;
        }
        decode_samples(&payload[std.payload_offset..end], &mut self.scratch);
        let included = info.nof_included_antennas as usize;
        let samples = self.scratch.len() / (included * self.nof_pols);
        if samples == 0 {
            return;
        }

        let counter = std.counter.counter24();
        let global = Self::global_sample(s.timestamp.unwrap_or(0), counter, samples as u64);
        let base = self.base_sample.unwrap_or(0);
        if global < base {
            return;
        }
        let offset = global - base;
        let buffer_index = offset / self.nof_samples as u64;
        let start_sample = (offset % self.nof_samples as u64) as usize;

        // Late by one buffer: previous container. Later than that: gone.
        let container = if buffer_index + 1 == self.current_buffer {
            self.ring.previous_mut()
        } else if buffer_index < self.current_buffer {
            return;
        } else {
            if buffer_index > self.current_buffer {
                // Advancing persists every outgoing buffer in order.
                while self.current_buffer < buffer_index {
                    let outgoing = self.ring.advance();
                    let outgoing_index = self.current_buffer;
                    self.persist_container(outgoing, outgoing_index);
                    self.ring.at_mut((outgoing + 1) % NOF_CONTAINERS).clear();
                    self.current_buffer += 1;
                }
            }
            self.ring.current_mut()
        };

        if !container.add_multi_antenna(
            tile.tile_id,
            info.start_antenna as usize,
            included,
            start_sample,
            samples,
            &self.scratch,
            std.time,
        ) {
            debug!(counter, "antenna-buffer packet did not fit");
            return;
        }
        self.tracker.observe(tile.station_id, &std, counter);
    }
}

impl Consumer for AntennaBufferConsumer {
    fn filter(&self) -> PacketFilter {
        PacketFilter::flows(&[FlowKind::AntennaBuffer])
    }

    fn set_callback(&mut self, callback: DataCallback) {
        self.callback = Some(callback);
    }

    fn process_packet(&mut self, packet: &[u8]) {
        if self.base_sample.is_some() {
            self.place_packet(packet);
            return;
        }

        // Discovery: record each FPGA's first global sample index.
        let Some(parsed) = SpeadPacket::parse(packet) else {
            return;
        };
        let s = PacketSummary::scan(&parsed);
        let (Some(tile_v), Some(info_v)) = (s.tile_info, s.antenna_buffer_info) else {
            return;
        };
        let Some(std) = standard(&s, TPM_TICK_SECONDS) else {
            return;
        };
        let tile = TileInfo::from_value(tile_v);
        let info = AntennaBufferInfo::from_value(info_v);
        if info.nof_included_antennas == 0 {
            return;
        }

        let payload_bytes = std
            .payload_length
            .min(parsed.payload().len())
            .saturating_sub(std.payload_offset);
        let samples = payload_bytes / (info.nof_included_antennas as usize * self.nof_pols);
        if samples == 0 {
            return;
        }
        let global =
            Self::global_sample(s.timestamp.unwrap_or(0), std.counter.counter24(), samples as u64);

        let fpga_key = (tile.tile_id, tile.fpga_id);
        if !self.firsts.iter().any(|&(k, _)| k == fpga_key) {
            self.firsts.push((fpga_key, global));
        }
        if self.stash.len() < DISCOVERY_STASH {
            self.stash.push(packet.to_vec());
        }
        let now = now_ns();
        let started = *self.discovery_start_ns.get_or_insert(now);

        let all_seen = self.firsts.len() >= 2 * self.nof_tiles;
        if all_seen || now.saturating_sub(started) >= DISCOVERY_NS {
            self.finish_discovery();
        }
    }

    fn on_stream_end(&mut self) {
        // A stream that went quiet mid-discovery still gets its base.
        if self.base_sample.is_none() && !self.firsts.is_empty() {
            self.finish_discovery();
        }
        let n = self.ring.len();
        let current = self.ring.current_index();
        let previous = (current + n - 1) % n;
        let current_index = self.current_buffer;
        self.persist_container(previous, current_index.saturating_sub(1));
        self.persist_container(current, current_index);
    }

    fn cleanup(&mut self) {
        for idx in 0..self.ring.len() {
            self.ring.at_mut(idx).clear();
        }
    }
}
