use crate::consumer::{Consumer, ConsumerError, standard};
use crate::persister::Persister;
use capture_buffers::{
    CallbackMeta, CorrelatorMeta, DataCallback, DbConsumer, DbProducer, DoubleBufferConfig,
    double_buffer, double_buffer_with_stores,
};
use capture_config::ConsumerConfig;
use capture_receiver::PacketFilter;
use parking_lot::Mutex;
use std::sync::Arc;
use stratum_mem::{SampleStore, decode_samples};
use stratum_spead::{ChannelInfo, FlowKind, PacketSummary, SpeadPacket, TPM_TICK_SECONDS, TileInfo};
use tracing::debug;

const NOF_SLOTS: usize = 4;

/// GPU-correlator ingest consumer.
///
/// Continuous-channel packets for one coarse channel are written straight
/// into a double buffer whose slots the correlator may back with its own
/// write-combined pinned host memory (via [`CorrelatorConsumer::with_stores`]).
/// One slot holds nof_samples × nof_antennas × nof_pols complex words;
/// the persister hands ready slots to the correlator callback.
pub struct CorrelatorConsumer {
    nof_antennas: usize,
    nof_pols: usize,
    nof_samples: usize,
    nof_fine_channels: u32,
    producer: DbProducer<u16>,
    drain: Option<DbConsumer<u16>>,
    callback: Option<DataCallback>,
    meta: Arc<Mutex<CorrelatorMeta>>,
    rollover: u64,
    started: bool,
    first_tile: Option<u16>,
    scratch: Vec<u16>,
}

pub(crate) fn factory(cfg: &ConsumerConfig) -> Result<Box<dyn Consumer>, ConsumerError> {
    Ok(Box::new(CorrelatorConsumer::new(cfg)?))
}

impl CorrelatorConsumer {
    pub fn new(cfg: &ConsumerConfig) -> Result<Self, ConsumerError> {
        let dims = Self::dims(cfg)?;
        let (producer, drain) = double_buffer(Self::geometry(&dims))?;
        Ok(Self::build(dims, producer, drain))
    }

    /// As `new`, but over caller-allocated slot backing (the GPU path).
    pub fn with_stores(
        cfg: &ConsumerConfig,
        stores: Vec<SampleStore<u16>>,
    ) -> Result<Self, ConsumerError> {
        let dims = Self::dims(cfg)?;
        let (producer, drain) = double_buffer_with_stores(Self::geometry(&dims), stores);
        Ok(Self::build(dims, producer, drain))
    }

    fn dims(
        cfg: &ConsumerConfig,
    ) -> Result<std::collections::HashMap<&'static str, usize>, ConsumerError> {
        Ok(cfg.require(&[
            "nof_antennas",
            "nof_pols",
            "nof_samples",
            "nof_fine_channels",
        ])?)
    }

    fn geometry(dims: &std::collections::HashMap<&'static str, usize>) -> DoubleBufferConfig {
        DoubleBufferConfig {
            nof_slots: NOF_SLOTS,
            slot_len: dims["nof_samples"] * dims["nof_antennas"] * dims["nof_pols"],
            epoch_size: dims["nof_samples"] as u64,
        }
    }

    fn build(
        dims: std::collections::HashMap<&'static str, usize>,
        producer: DbProducer<u16>,
        drain: DbConsumer<u16>,
    ) -> Self {
        Self {
            nof_antennas: dims["nof_antennas"],
            nof_pols: dims["nof_pols"],
            nof_samples: dims["nof_samples"],
            nof_fine_channels: dims["nof_fine_channels"] as u32,
            producer,
            drain: Some(drain),
            callback: None,
            meta: Arc::new(Mutex::new(CorrelatorMeta {
                nof_fine_channels: dims["nof_fine_channels"] as u32,
                ..Default::default()
            })),
            rollover: 0,
            started: false,
            first_tile: None,
            scratch: Vec::new(),
        }
    }
}

impl Consumer for CorrelatorConsumer {
    fn filter(&self) -> PacketFilter {
        PacketFilter::flows(&[FlowKind::ContinuousChannel])
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
        if info.nof_included_antennas == 0 {
            return;
        }

        if self.first_tile.is_none() {
            self.first_tile = Some(tile.tile_id);
        }
        let c24 = std.counter.counter24();
        if self.started && c24 == 0 && self.first_tile == Some(tile.tile_id) && tile.fpga_id == 0 {
            self.rollover += 1;
        }
        self.started = true;
        let counter = c24 + (self.rollover << 24);

        let payload = parsed.payload();
        let end = std.payload_length.min(payload.len());
        if std.payload_offset >= end {
            return;
        }
        decode_samples(&payload[std.payload_offset..end], &mut self.scratch);
        let row = self.nof_antennas * self.nof_pols;
        let samples = self.scratch.len() / row;
        if samples == 0 {
            return;
        }

        {
            let mut meta = self.meta.lock();
            meta.channel_id = info.start_channel;
            meta.nof_fine_channels = self.nof_fine_channels;
            meta.stream.station_id = tile.station_id;
            meta.stream.payload_length = std.payload_length as u32;
            meta.stream.sync_time = std.sync_time;
            meta.stream.last_packet_counter = counter;
        }

        let key = counter * samples as u64;
        let (samples_dim, scratch) = (self.nof_samples, &self.scratch);
        let outcome = self
            .producer
            .write_data(key, info.start_channel as u64, std.time, |slot, base| {
                let offset = (key - base) as usize;
                let mut written = 0u64;
                for j in 0..samples {
                    if offset + j >= samples_dim {
                        break;
                    }
                    let dst = (offset + j) * row;
                    slot[dst..dst + row].copy_from_slice(&scratch[j * row..(j + 1) * row]);
                    written += row as u64;
                }
                written
            });
        if outcome == capture_buffers::WriteOutcome::DroppedTooLate {
            debug!(key, "correlator packet older than the open epochs");
        }
    }

    fn on_stream_end(&mut self) {
        self.producer.finalise_open_epochs();
    }

    fn start_persister(&mut self) -> Option<Persister> {
        let drain = self.drain.take()?;
        let callback = self.callback.take();
        let template = self.meta.clone();
        Some(Persister::spawn("correlator", drain, callback, move |slot| {
            let mut meta = template.lock().clone();
            meta.buffer_counter = slot.seq();
            meta.stream.nof_packets = slot.packets();
            let channel = slot.index() as u16;
            (CallbackMeta::Correlator(meta), 0, channel)
        }))
    }
}
