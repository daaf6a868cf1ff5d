use crate::consumer::{Consumer, ConsumerError, StreamTracker, standard};
use capture_buffers::{CallbackMeta, ChannelContainer, ChannelMeta, ContainerRing, DataCallback};
use capture_config::{Bitwidth, ConsumerConfig};
use capture_receiver::PacketFilter;
use stratum_mem::{Sample, decode_samples};
use stratum_spead::{ChannelInfo, FlowKind, PacketSummary, SpeadPacket, TPM_TICK_SECONDS, TileInfo};
use tracing::debug;

const NOF_CONTAINERS: usize = 4;

/// Continuous channelised consumer (capture modes 0x5 and 0x7).
///
/// Keeps a ring of four containers: the epoch being filled, the previous
/// epoch (still open for late packets) and the one behind that, which is
/// persisted when a boundary closes it. Epoch boundaries are declared by
/// a tile-0/pol-0 packet whose counter lands on a nof_samples window
/// start, once the wall clock has moved a full window past the reference
/// time and at least 2 × nof_tiles packets sit in the current epoch.
/// A 24-bit packet counter is widened through a rollover counter bumped
/// at every tile-0/pol-0 zero crossing.
pub struct ContinuousChannelConsumer<T: Sample> {
    nof_tiles: usize,
    nof_channels: usize,
    nof_samples: usize,
    nof_pols: usize,
    nof_buffer_skips: usize,
    start_time: Option<f64>,
    bitwidth: u32,
    sampling_time: f64,
    ring: ContainerRing<ChannelContainer<T>>,
    keep: [bool; NOF_CONTAINERS],
    callback: Option<DataCallback>,
    tracker: StreamTracker,
    rollover: u64,
    started: bool,
    first_tile: Option<u16>,
    reference_time: f64,
    have_reference: bool,
    epoch_counter: u64,
    epoch_packets: u64,
    channel_id: u16,
    scratch: Vec<T>,
}

pub(crate) fn factory(cfg: &ConsumerConfig) -> Result<Box<dyn Consumer>, ConsumerError> {
    match cfg.bitwidth() {
        Bitwidth::Bits16 => Ok(Box::new(ContinuousChannelConsumer::<u16>::new(cfg)?)),
        Bitwidth::Bits32 => Ok(Box::new(ContinuousChannelConsumer::<u32>::new(cfg)?)),
    }
}

impl<T: Sample> ContinuousChannelConsumer<T> {
    pub fn new(cfg: &ConsumerConfig) -> Result<Self, ConsumerError> {
        let dims = cfg.require(&[
            "nof_tiles",
            "nof_channels",
            "nof_samples",
            "nof_antennas",
            "nof_pols",
        ])?;
        let mut containers = Vec::with_capacity(NOF_CONTAINERS);
        for _ in 0..NOF_CONTAINERS {
            containers.push(ChannelContainer::new(
                dims["nof_tiles"],
                dims["nof_channels"],
                dims["nof_samples"],
                dims["nof_antennas"],
                dims["nof_pols"],
            )?);
        }
        Ok(Self {
            nof_tiles: dims["nof_tiles"],
            nof_channels: dims["nof_channels"],
            nof_samples: dims["nof_samples"],
            nof_pols: dims["nof_pols"],
            nof_buffer_skips: cfg.nof_buffer_skips,
            start_time: cfg.start_time,
            bitwidth: cfg.bitwidth,
            sampling_time: TPM_TICK_SECONDS,
            ring: ContainerRing::new(containers),
            keep: [true; NOF_CONTAINERS],
            callback: None,
            tracker: StreamTracker::default(),
            rollover: 0,
            started: false,
            first_tile: None,
            reference_time: 0.0,
            have_reference: false,
            epoch_counter: 0,
            epoch_packets: 0,
            channel_id: 0,
            scratch: Vec::new(),
        })
    }

    fn epoch_kept(&self, epoch: u64) -> bool {
        epoch % (self.nof_buffer_skips.max(1) as u64) == 0
    }

    fn persist_container(&mut self, idx: usize) {
        if !self.ring.at_mut(idx).has_data() {
            return;
        }
        if !self.keep[idx] {
            self.ring.at_mut(idx).clear();
            return;
        }
        let seq = self.ring.take_seq();
        let stream = self.tracker.snapshot();
        let channel_id = self.channel_id;
        let nof_channels = self.nof_channels as u16;
        let bitwidth = self.bitwidth;
        let container = self.ring.at_mut(idx);
        container.persist(&mut self.callback, channel_id, |_tile, packets| {
            let mut stream = stream;
            stream.nof_packets = packets;
            CallbackMeta::Channel(ChannelMeta {
                stream,
                start_channel: channel_id,
                nof_channels,
                bitwidth,
                buffer_counter: seq,
            })
        });
    }

    /// Closes the current epoch: rotate, persist the container two behind
    /// the new current one, advance the reference time.
    fn advance_epoch(&mut self) {
        let n = self.ring.len();
        let outgoing = self.ring.advance();
        let two_behind = (outgoing + n - 1) % n;
        self.persist_container(two_behind);

        self.epoch_counter += 1;
        let kept = self.epoch_kept(self.epoch_counter);
        let current = (outgoing + 1) % n;
        self.keep[current] = kept;
        self.ring.at_mut(current).clear();

        self.reference_time += self.nof_samples as f64 * self.sampling_time;
        self.epoch_packets = 0;
        self.tracker.reset_epoch();
    }
}

impl<T: Sample> Consumer for ContinuousChannelConsumer<T> {
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
        if let Some(t0) = self.start_time {
            if std.time < t0 {
                return;
            }
        }
        let tile = TileInfo::from_value(tile_v);
        let info = ChannelInfo::from_value(chan_v);
        if info.nof_channels == 0 || info.nof_included_antennas == 0 {
            return;
        }

        if self.first_tile.is_none() {
            self.first_tile = Some(tile.tile_id);
            self.channel_id = info.start_channel;
        }
        let tile0_pol0 = self.first_tile == Some(tile.tile_id) && tile.fpga_id == 0;

        // 24-bit counter widening: every zero crossing at tile 0 / pol 0
        // after the stream started bumps the top byte.
        let c24 = std.counter.counter24();
        if self.started && c24 == 0 && tile0_pol0 {
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
        let block = info.nof_channels as usize * info.nof_included_antennas as usize * self.nof_pols;
        let samples = self.scratch.len() / block;
        if samples == 0 {
            return;
        }

        if !self.have_reference {
            self.reference_time = std.time;
            self.have_reference = true;
        }

        // Boundary: a window-aligned counter at tile 0 / pol 0, a full
        // window past the reference time, with a settled epoch behind it.
        let window_start = (counter as usize * samples) % self.nof_samples == 0;
        if window_start
            && tile0_pol0
            && std.time >= self.reference_time + self.nof_samples as f64 * self.sampling_time
            && self.epoch_packets >= 2 * self.nof_tiles as u64
        {
            self.advance_epoch();
        }

        let start_sample = (counter as usize * samples) % self.nof_samples;
        let channel_idx = if self.nof_channels == 1 {
            0
        } else {
            info.start_channel as usize % self.nof_channels
        };

        // A packet older than the running epoch belongs to the previous
        // container; when epochs are being skipped there is no previous
        // epoch to complete, so it is dropped.
        let late = std.time < self.reference_time;
        if late && self.nof_buffer_skips > 0 {
            return;
        }
        let container = if late {
            self.ring.previous_mut()
        } else {
            self.ring.current_mut()
        };
        if !container.add_data(
            tile.tile_id,
            channel_idx,
            info.nof_channels as usize,
            start_sample,
            samples,
            info.start_antenna as usize,
            info.nof_included_antennas as usize,
            &self.scratch,
            std.time,
        ) {
            debug!(counter, "continuous-channel packet did not fit");
            return;
        }
        if !late {
            self.epoch_packets += 1;
        }
        self.tracker.observe(tile.station_id, &std, counter);
    }

    fn on_stream_end(&mut self) {
        // Flush in age order: previous epoch, then the current one, both
        // in place. The stream re-references itself when packets return.
        let n = self.ring.len();
        let current = self.ring.current_index();
        let previous = (current + n - 1) % n;
        self.persist_container(previous);
        self.persist_container(current);
        self.have_reference = false;
        self.epoch_packets = 0;
        self.tracker.reset_epoch();
    }

    fn cleanup(&mut self) {
        for idx in 0..self.ring.len() {
            self.ring.at_mut(idx).clear();
        }
    }
}
