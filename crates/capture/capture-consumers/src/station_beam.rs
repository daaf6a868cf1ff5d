use crate::consumer::{Consumer, ConsumerError, standard};
use crate::persister::Persister;
use capture_buffers::{
    CallbackMeta, DataCallback, DbConsumer, DbProducer, DoubleBufferConfig, StationBeamMeta,
    double_buffer,
};
use capture_config::ConsumerConfig;
use capture_receiver::PacketFilter;
use parking_lot::Mutex;
use std::sync::Arc;
use stratum_mem::decode_samples;
use stratum_spead::{FlowKind, PacketSummary, SpeadPacket, StationBeamInfo, TileInfo};
use tracing::debug;

/// Station-beam sample cadence, seconds. Packet timestamps tick at 1 ns
/// (10 ns during scans); samples advance at the TPM frame rate.
const SAMPLING_SECONDS: f64 = 1.08e-6;

const NOF_SLOTS: usize = 4;

/// Raw station-beam consumer.
///
/// Identified by the presence of item 0x1011 (or 0x3010) rather than a
/// capture mode. Packets carry one or more logical channels of 16-bit
/// complex beam samples; accepted channels inside the configured window
/// are written straight into a dedicated double buffer keyed by the
/// 64-bit sample index recovered from the 32-bit packet counter and a
/// rollover counter. A persister thread drains the ready slots.
pub struct StationBeamConsumer {
    start_channel: usize,
    nof_channels: usize,
    nof_samples: usize,
    nof_pols: usize,
    transpose: bool,
    capture_start: Option<f64>,
    producer: DbProducer<u16>,
    drain: Option<DbConsumer<u16>>,
    callback: Option<DataCallback>,
    meta: Arc<Mutex<StationBeamMeta>>,
    rollover: u64,
    last_counter32: Option<u64>,
    scratch: Vec<u16>,
}

pub(crate) fn factory(cfg: &ConsumerConfig) -> Result<Box<dyn Consumer>, ConsumerError> {
    Ok(Box::new(StationBeamConsumer::new(cfg)?))
}

impl StationBeamConsumer {
    pub fn new(cfg: &ConsumerConfig) -> Result<Self, ConsumerError> {
        let dims = cfg.require(&["nof_channels", "nof_samples", "nof_pols"])?;
        let (channels, samples, pols) = (
            dims["nof_channels"],
            dims["nof_samples"],
            dims["nof_pols"],
        );
        let start_channel = cfg.start_channel.unwrap_or(0);
        let (producer, drain) = double_buffer(DoubleBufferConfig {
            nof_slots: NOF_SLOTS,
            slot_len: samples * channels * pols,
            epoch_size: samples as u64,
        })?;
        Ok(Self {
            start_channel,
            nof_channels: channels,
            nof_samples: samples,
            nof_pols: pols,
            transpose: cfg.transpose_samples != 0,
            capture_start: cfg.capture_start_time,
            producer,
            drain: Some(drain),
            callback: None,
            meta: Arc::new(Mutex::new(StationBeamMeta {
                start_channel: start_channel as u16,
                nof_channels: channels as u16,
                ..Default::default()
            })),
            rollover: 0,
            last_counter32: None,
            scratch: Vec::new(),
        })
    }
}

impl Consumer for StationBeamConsumer {
    fn filter(&self) -> PacketFilter {
        PacketFilter::flows(&[FlowKind::StationBeam])
    }

    fn set_callback(&mut self, callback: DataCallback) {
        self.callback = Some(callback);
    }

    fn process_packet(&mut self, packet: &[u8]) {
        let Some(parsed) = SpeadPacket::parse(packet) else {
            return;
        };
        let s = PacketSummary::scan(&parsed);
        let Some(info_v) = s.station_beam_info else {
            return;
        };
        let Some(std) = standard(&s, s.station_tick_seconds()) else {
            return;
        };
        let info = StationBeamInfo::from_value(info_v);
        let logical = info.logical_channel_id as usize;
        let channels_in_packet = (info.nof_channels as usize).max(1);

        // Recover the 64-bit counter before any window filtering: channel
        // zero drives the rollover even when it is not captured. The
        // rollover addition is applied on every path, wrap or not.
        let counter32 = std.counter.counter32();
        if logical == 0 {
            if let Some(last) = self.last_counter32 {
                if counter32 < last {
                    self.rollover += 1;
                }
            }
            self.last_counter32 = Some(counter32);
        }
        let counter = counter32 + (self.rollover << 32);

        if logical < self.start_channel
            || logical + channels_in_packet > self.start_channel + self.nof_channels
        {
            return;
        }

        let payload = parsed.payload();
        let end = std.payload_length.min(payload.len());
        if std.payload_offset >= end {
            return;
        }
        decode_samples(&payload[std.payload_offset..end], &mut self.scratch);
        let samples_in_packet = self.scratch.len() / (channels_in_packet * self.nof_pols);
        if samples_in_packet == 0 {
            return;
        }

        // A capture start inside the packet's span trims the leading
        // samples; a packet that ends before the start is discarded.
        let mut first = 0usize;
        if let Some(t0) = self.capture_start {
            let span = samples_in_packet as f64 * SAMPLING_SECONDS;
            if std.time + span <= t0 {
                return;
            }
            if std.time < t0 {
                first = ((t0 - std.time) / SAMPLING_SECONDS).round() as usize;
                if first >= samples_in_packet {
                    return;
                }
            }
        }

        {
            let mut meta = self.meta.lock();
            meta.frequency = s.frequency.unwrap_or(meta.frequency);
            meta.scan_id = s.scan_id.or(meta.scan_id);
            if let Some(tile_v) = s.station_tile_info {
                meta.stream.station_id = TileInfo::from_value(tile_v).station_id;
            }
            meta.stream.payload_length = std.payload_length as u32;
            meta.stream.sync_time = std.sync_time;
            meta.stream.last_packet_counter = counter;
        }

        let key = counter * samples_in_packet as u64 + first as u64;
        let time = std.time + first as f64 * SAMPLING_SECONDS;
        let n_write = samples_in_packet - first;
        let (ch_base, ch_dim, pols, samples_dim, transpose) = (
            logical - self.start_channel,
            self.nof_channels,
            self.nof_pols,
            self.nof_samples,
            self.transpose,
        );
        let scratch = &self.scratch;

        let outcome = self.producer.write_data(key, logical as u64, time, |slot, base| {
            let offset = (key - base) as usize;
            let mut written = 0u64;
            for c in 0..channels_in_packet {
                let dst_channel = ch_base + c;
                for j in 0..n_write {
                    let dst_sample = offset + j;
                    if dst_sample >= samples_dim {
                        break;
                    }
                    // Time-major puts samples adjacent with channels
                    // strided by pols; channel-major keeps each channel's
                    // time series contiguous, matching the packet order.
                    let dst_base = if transpose {
                        (dst_sample * ch_dim + dst_channel) * pols
                    } else {
                        (dst_channel * samples_dim + dst_sample) * pols
                    };
                    let src_base = (c * (n_write + first) + first + j) * pols;
                    for p in 0..pols {
                        slot[dst_base + p] = scratch[src_base + p];
                    }
                    written += pols as u64;
                }
            }
            written
        });
        if matches!(
            outcome,
            capture_buffers::WriteOutcome::DroppedTooLate | capture_buffers::WriteOutcome::DroppedBusy
        ) {
            debug!(key, ?outcome, "station-beam packet not written");
        }
    }

    fn on_stream_end(&mut self) {
        self.producer.finalise_open_epochs();
    }

    fn start_persister(&mut self) -> Option<Persister> {
        let drain = self.drain.take()?;
        let callback = self.callback.take();
        let template = self.meta.clone();
        Some(Persister::spawn("station_beam", drain, callback, move |slot| {
            let mut meta = template.lock().clone();
            meta.nof_samples = slot.samples();
            meta.buffer_counter = slot.seq();
            meta.stream.nof_packets = slot.packets();
            let channel = slot.index() as u16;
            (CallbackMeta::StationBeam(meta), 0, channel)
        }))
    }
}
