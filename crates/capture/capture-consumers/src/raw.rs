use crate::consumer::{Consumer, ConsumerError, StreamTracker, standard};
use capture_buffers::{CallbackMeta, DataCallback, RawContainer, RawMeta};
use capture_config::ConsumerConfig;
use capture_receiver::PacketFilter;
use stratum_mem::decode_samples;
use stratum_spead::{
    FlowKind, PacketSummary, RawAntennaInfo, SpeadPacket, TPM_TICK_SECONDS, TileInfo,
};
use tracing::debug;

/// Raw ADC consumer (capture modes 0x0 and 0x1).
///
/// Mode 0x0 carries one antenna per packet, placed contiguously; mode 0x1
/// carries a run of antennas, scattered into the antenna-major container.
/// The epoch closes when the absorbed sample count across tiles reaches
/// tiles × antennas × samples_per_buffer.
pub struct RawConsumer {
    nof_antennas: usize,
    nof_pols: usize,
    samples_per_buffer: usize,
    container: RawContainer<i8>,
    callback: Option<DataCallback>,
    tracker: StreamTracker,
    fpga_ids: Vec<u16>,
    start_antenna: u16,
    scratch: Vec<i8>,
}

pub(crate) fn factory(cfg: &ConsumerConfig) -> Result<Box<dyn Consumer>, ConsumerError> {
    Ok(Box::new(RawConsumer::new(cfg)?))
}

impl RawConsumer {
    pub fn new(cfg: &ConsumerConfig) -> Result<Self, ConsumerError> {
        let dims = cfg.require(&[
            "nof_tiles",
            "nof_antennas",
            "nof_pols",
            "samples_per_buffer",
        ])?;
        let (tiles, antennas, pols, samples) = (
            dims["nof_tiles"],
            dims["nof_antennas"],
            dims["nof_pols"],
            dims["samples_per_buffer"],
        );
        Ok(Self {
            nof_antennas: antennas,
            nof_pols: pols,
            samples_per_buffer: samples,
            container: RawContainer::new(tiles, antennas, samples, pols)?,
            callback: None,
            tracker: StreamTracker::default(),
            fpga_ids: Vec::new(),
            start_antenna: 0,
            scratch: Vec::new(),
        })
    }

    fn persist(&mut self) {
        if !self.container.has_data() {
            return;
        }
        let stream = self.tracker.snapshot();
        let fpga_ids = self.fpga_ids.clone();
        let start_antenna = self.start_antenna;
        let nof_antennas = self.nof_antennas as u16;
        self.container.persist(&mut self.callback, 0, |_tile, packets| {
            let mut stream = stream;
            stream.nof_packets = packets;
            CallbackMeta::Raw(RawMeta {
                stream,
                fpga_ids: fpga_ids.clone(),
                start_antenna,
                nof_antennas,
            })
        });
        self.tracker.reset_epoch();
        self.fpga_ids.clear();
    }
}

impl Consumer for RawConsumer {
    fn filter(&self) -> PacketFilter {
        PacketFilter::flows(&[FlowKind::Raw])
    }

    fn set_callback(&mut self, callback: DataCallback) {
        self.callback = Some(callback);
    }

    fn process_packet(&mut self, packet: &[u8]) {
        let Some(parsed) = SpeadPacket::parse(packet) else {
            return;
        };
        let s = PacketSummary::scan(&parsed);
        let (Some(mode), Some(tile_v)) = (s.capture_mode, s.tile_info) else {
            return;
        };
        let Some(std) = standard(&s, TPM_TICK_SECONDS) else {
            return;
        };
        let tile = TileInfo::from_value(tile_v);
        let info = s.raw_antenna_info.map(RawAntennaInfo::from_value);

        let payload = parsed.payload();
        let end = std.payload_length.min(payload.len());
        if std.payload_offset >= end {
            return;
        }
        decode_samples(&payload[std.payload_offset..end], &mut self.scratch);

        let counter = std.counter.counter24();
        let placed = match mode {
            0x0 => {
                let Some(info) = info else { return };
                let samples = self.scratch.len() / self.nof_pols;
                if samples == 0 {
                    return;
                }
                let dst = (counter as usize * samples) % self.samples_per_buffer;
                self.container.add_single_antenna(
                    tile.tile_id,
                    info.start_antenna as usize,
                    dst,
                    samples,
                    &self.scratch,
                    std.time,
                )
            }
            0x1 => {
                let (start, included) = match info {
                    Some(i) if i.nof_included_antennas > 0 => {
                        (i.start_antenna as usize, i.nof_included_antennas as usize)
                    }
                    _ => (0, self.nof_antennas),
                };
                let samples = self.scratch.len() / (included * self.nof_pols);
                if samples == 0 {
                    return;
                }
                let dst = (counter as usize * samples) % self.samples_per_buffer;
                self.container.add_multi_antenna(
                    tile.tile_id,
                    start,
                    included,
                    dst,
                    samples,
                    &self.scratch,
                    std.time,
                )
            }
            _ => return,
        };
        if !placed {
            debug!(mode, counter, "raw packet did not fit its container");
            return;
        }

        self.tracker.observe(tile.station_id, &std, counter);
        if !self.fpga_ids.contains(&tile.fpga_id) {
            self.fpga_ids.push(tile.fpga_id);
        }
        if let Some(i) = info {
            self.start_antenna = self.start_antenna.min(i.start_antenna);
        }

        if self.container.is_complete() {
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

#[cfg(test)]
mod tests {
    use super::*;
    use capture_buffers::DataCallback;
    use std::sync::{Arc, Mutex};
    use stratum_spead::{PacketBuilder, item_id};

    fn raw_packet(mode: u64, tile: u16, counter: u64, payload: &[u8]) -> Vec<u8> {
        PacketBuilder::new()
            .item(item_id::HEAP_COUNTER, counter)
            .item(item_id::PAYLOAD_LENGTH, payload.len() as u64)
            .item(item_id::SYNC_TIME, 1_700_000_000)
            .item(item_id::TIMESTAMP, 1000)
            .item(
                item_id::TILE_INFO,
                TileInfo {
                    station_id: 1,
                    tile_id: tile,
                    fpga_id: 0,
                }
                .to_value(),
            )
            .item(
                item_id::RAW_ANTENNA_INFO,
                RawAntennaInfo {
                    start_antenna: 0,
                    nof_included_antennas: 2,
                }
                .to_value(),
            )
            .item(item_id::CAPTURE_MODE, mode)
            .payload(payload)
            .build()
    }

    #[test]
    fn single_antenna_epoch_completes() {
        // 1 tile, 2 antennas, 4 samples, 1 pol: two mode-0x0 packets of
        // 4 samples fill the buffer.
        let cfg = ConsumerConfig {
            nof_tiles: Some(1),
            nof_antennas: Some(2),
            nof_pols: Some(1),
            samples_per_buffer: Some(4),
            ..Default::default()
        };
        let mut consumer = RawConsumer::new(&cfg).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        consumer.set_callback(DataCallback::Simple(Box::new(move |data, ts, tile, _| {
            sink.lock().unwrap().push((data.to_vec(), ts, tile));
        })));

        // Antenna 0 then antenna 1; counter 0 places at sample 0.
        let mut pkt = raw_packet(0x0, 9, 0, &[1, 2, 3, 4]);
        consumer.process_packet(&pkt);
        assert!(seen.lock().unwrap().is_empty());

        pkt = PacketBuilder::new()
            .item(item_id::HEAP_COUNTER, 0)
            .item(item_id::PAYLOAD_LENGTH, 4)
            .item(item_id::SYNC_TIME, 1_700_000_000)
            .item(item_id::TIMESTAMP, 1000)
            .item(
                item_id::TILE_INFO,
                TileInfo {
                    station_id: 1,
                    tile_id: 9,
                    fpga_id: 1,
                }
                .to_value(),
            )
            .item(
                item_id::RAW_ANTENNA_INFO,
                RawAntennaInfo {
                    start_antenna: 1,
                    nof_included_antennas: 1,
                }
                .to_value(),
            )
            .item(item_id::CAPTURE_MODE, 0x0)
            .payload(&[5, 6, 7, 8])
            .build();
        consumer.process_packet(&pkt);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        let (data, ts, tile) = &seen[0];
        assert_eq!(tile, &9);
        assert_eq!(data, &vec![1, 2, 3, 4, 5, 6, 7, 8]);
        let expected = 1_700_000_000.0 + 1000.0 * TPM_TICK_SECONDS;
        assert!((ts - expected).abs() < 1e-9);
    }

    #[test]
    fn malformed_packets_are_dropped_silently() {
        let cfg = ConsumerConfig {
            nof_tiles: Some(1),
            nof_antennas: Some(2),
            nof_pols: Some(1),
            samples_per_buffer: Some(4),
            ..Default::default()
        };
        let mut consumer = RawConsumer::new(&cfg).unwrap();
        consumer.process_packet(&[0u8; 40]); // bad magic
        let mut pkt = raw_packet(0x1, 0, 0, &[0; 8]);
        pkt[1] = 0xEE; // bad version
        consumer.process_packet(&pkt);
        // Missing tile info.
        let pkt = PacketBuilder::new()
            .item(item_id::CAPTURE_MODE, 0x1)
            .item(item_id::HEAP_COUNTER, 0)
            .payload(&[0; 8])
            .build();
        consumer.process_packet(&pkt);
        assert!(!consumer.container.has_data());
    }

    #[test]
    fn missing_required_keys_fail_init() {
        let cfg = ConsumerConfig {
            nof_tiles: Some(1),
            ..Default::default()
        };
        assert!(matches!(
            RawConsumer::new(&cfg),
            Err(ConsumerError::Config(_))
        ));
    }
}
