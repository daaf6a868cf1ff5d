//! Typed reassembly containers, one dense backing array per mode in that
//! mode's canonical axis order. All placement arithmetic lives here so the
//! consumer state machines deal only in wire-level quantities (tile id,
//! start channel, start sample, payload slice).
//!
//! A container is single-threaded: only its consumer thread touches it.
//! `persist` hands each tile's region to the registered callback and then
//! clears the container for the next epoch; the tile map survives clears.

use crate::callback::{CallbackMeta, DataCallback};
use crate::tile_map::TileMap;
use stratum_mem::{MemError, PinnedBuffer, Sample};

/// Raw ADC container: tile / antenna / sample / pol.
pub struct RawContainer<T: Sample> {
    nof_antennas: usize,
    nof_samples: usize,
    nof_pols: usize,
    data: PinnedBuffer<T>,
    tile_map: TileMap,
    ref_time: f64,
    tile_packets: Vec<u64>,
    /// Σ samples × antennas over absorbed packets; drives epoch detection.
    absorbed_samples: u64,
}

/// Antenna-buffer data shares the raw axis order and placement rules.
pub type AntennaBufferContainer<T> = RawContainer<T>;

impl<T: Sample> RawContainer<T> {
    pub fn new(
        nof_tiles: usize,
        nof_antennas: usize,
        nof_samples: usize,
        nof_pols: usize,
    ) -> Result<Self, MemError> {
        Ok(Self {
            nof_antennas,
            nof_samples,
            nof_pols,
            data: PinnedBuffer::alloc(nof_tiles * nof_antennas * nof_samples * nof_pols)?,
            tile_map: TileMap::new(nof_tiles),
            ref_time: f64::MAX,
            tile_packets: vec![0; nof_tiles],
            absorbed_samples: 0,
        })
    }

    #[inline(always)]
    fn tile_stride(&self) -> usize {
        self.nof_antennas * self.nof_samples * self.nof_pols
    }

    /// Mode 0x0: one antenna per packet, samples × pols contiguous in the
    /// payload. Returns false when the tile map is full or the placement
    /// does not fit.
    pub fn add_single_antenna(
        &mut self,
        tile_id: u16,
        antenna: usize,
        start_sample: usize,
        samples: usize,
        src: &[T],
        time: f64,
    ) -> bool {
        let Some(tile) = self.tile_map.resolve(tile_id) else {
            return false;
        };
        if antenna >= self.nof_antennas || start_sample + samples > self.nof_samples {
            return false;
        }
        let p = self.nof_pols;
        let base = (tile * self.nof_antennas + antenna) * self.nof_samples * p + start_sample * p;
        self.data.as_mut_slice()[base..base + samples * p].copy_from_slice(&src[..samples * p]);
        self.absorb(tile, samples as u64, time);
        true
    }

    /// Mode 0x1: a run of antennas per packet, payload sample-major
    /// ([sample][antenna][pol]); scattered into the antenna-major layout.
    pub fn add_multi_antenna(
        &mut self,
        tile_id: u16,
        start_antenna: usize,
        nof_included: usize,
        start_sample: usize,
        samples: usize,
        src: &[T],
        time: f64,
    ) -> bool {
        let Some(tile) = self.tile_map.resolve(tile_id) else {
            return false;
        };
        if start_antenna + nof_included > self.nof_antennas
            || start_sample + samples > self.nof_samples
            || src.len() < samples * nof_included * self.nof_pols
        {
            return false;
        }
        let p = self.nof_pols;
        let dst = self.data.as_mut_slice();
        for a in 0..nof_included {
            let dst_base =
                (tile * self.nof_antennas + start_antenna + a) * self.nof_samples * p
                    + start_sample * p;
            for s in 0..samples {
                for pol in 0..p {
                    dst[dst_base + s * p + pol] = src[(s * nof_included + a) * p + pol];
                }
            }
        }
        self.absorb(tile, (samples * nof_included) as u64, time);
        true
    }

    fn absorb(&mut self, tile: usize, samples: u64, time: f64) {
        self.tile_packets[tile] += 1;
        self.absorbed_samples += samples;
        if time < self.ref_time {
            self.ref_time = time;
        }
    }

    /// Whether every (tile, antenna, sample) cell has been written.
    pub fn is_complete(&self) -> bool {
        self.absorbed_samples
            >= (self.tile_packets.len() * self.nof_antennas * self.nof_samples) as u64
    }

    pub fn has_data(&self) -> bool {
        self.absorbed_samples > 0
    }

    pub fn ref_time(&self) -> f64 {
        if self.ref_time == f64::MAX { 0.0 } else { self.ref_time }
    }

    pub fn tile_packets(&self, dense: usize) -> u64 {
        self.tile_packets[dense]
    }

    pub fn tile_samples(&self, dense: usize) -> &[T] {
        let stride = self.tile_stride();
        &self.data.as_slice()[dense * stride..(dense + 1) * stride]
    }

    /// Invokes the callback once per tile that received data, then clears.
    pub fn persist<F>(&mut self, callback: &mut Option<DataCallback>, channel_id: u16, mut meta: F)
    where
        F: FnMut(u16, u64) -> CallbackMeta,
    {
        let stride = self.tile_stride();
        let elem = size_of::<T>();
        for dense in 0..self.tile_map.len() {
            if self.tile_packets[dense] == 0 {
                continue;
            }
            let tile_id = self.tile_map.id_at(dense);
            let bytes = &self.data.as_bytes()[dense * stride * elem..(dense + 1) * stride * elem];
            if let Some(cb) = callback.as_mut() {
                let m = meta(tile_id, self.tile_packets[dense]);
                let time = if self.ref_time == f64::MAX { 0.0 } else { self.ref_time };
                cb.invoke(bytes, time, tile_id, channel_id, &m);
            }
        }
        self.clear();
    }

    pub fn clear(&mut self) {
        self.data.clear();
        self.ref_time = f64::MAX;
        self.tile_packets.fill(0);
        self.absorbed_samples = 0;
    }
}

/// Channelised container: tile / channel / sample / antenna / pol.
/// Shared by the burst, continuous and integrated channel flows (the
/// integrated flow uses nof_samples = 1).
pub struct ChannelContainer<T: Sample> {
    nof_channels: usize,
    nof_samples: usize,
    nof_antennas: usize,
    nof_pols: usize,
    data: PinnedBuffer<T>,
    tile_map: TileMap,
    ref_time: f64,
    tile_packets: Vec<u64>,
    total_packets: u64,
}

impl<T: Sample> ChannelContainer<T> {
    pub fn new(
        nof_tiles: usize,
        nof_channels: usize,
        nof_samples: usize,
        nof_antennas: usize,
        nof_pols: usize,
    ) -> Result<Self, MemError> {
        Ok(Self {
            nof_channels,
            nof_samples,
            nof_antennas,
            nof_pols,
            data: PinnedBuffer::alloc(
                nof_tiles * nof_channels * nof_samples * nof_antennas * nof_pols,
            )?,
            tile_map: TileMap::new(nof_tiles),
            ref_time: f64::MAX,
            tile_packets: vec![0; nof_tiles],
            total_packets: 0,
        })
    }

    #[inline(always)]
    fn tile_stride(&self) -> usize {
        self.nof_channels * self.nof_samples * self.nof_antennas * self.nof_pols
    }

    /// Places a contiguous (channel × sample × antenna × pol) block. The
    /// payload is channel-major: [channel][sample][antenna][pol].
    #[allow(clippy::too_many_arguments)]
    pub fn add_data(
        &mut self,
        tile_id: u16,
        start_channel: usize,
        nof_channels: usize,
        start_sample: usize,
        nof_samples: usize,
        start_antenna: usize,
        nof_antennas: usize,
        src: &[T],
        time: f64,
    ) -> bool {
        let Some(tile) = self.tile_map.resolve(tile_id) else {
            return false;
        };
        if start_channel + nof_channels > self.nof_channels
            || start_sample + nof_samples > self.nof_samples
            || start_antenna + nof_antennas > self.nof_antennas
            || src.len() < nof_channels * nof_samples * nof_antennas * self.nof_pols
        {
            return false;
        }
        let (a_dim, p) = (self.nof_antennas, self.nof_pols);
        let tile_base = tile * self.tile_stride();
        let dst = self.data.as_mut_slice();
        for c in 0..nof_channels {
            for s in 0..nof_samples {
                let dst_base = tile_base
                    + (((start_channel + c) * self.nof_samples + start_sample + s) * a_dim
                        + start_antenna)
                        * p;
                let src_base = ((c * nof_samples + s) * nof_antennas) * p;
                dst[dst_base..dst_base + nof_antennas * p]
                    .copy_from_slice(&src[src_base..src_base + nof_antennas * p]);
            }
        }
        self.tile_packets[tile] += 1;
        self.total_packets += 1;
        if time < self.ref_time {
            self.ref_time = time;
        }
        true
    }

    /// Places a single-pol spectrum ([channel][antenna] payload) — the
    /// integrated flow sends one polarisation per packet.
    #[allow(clippy::too_many_arguments)]
    pub fn add_pol_data(
        &mut self,
        tile_id: u16,
        start_channel: usize,
        nof_channels: usize,
        sample: usize,
        start_antenna: usize,
        nof_antennas: usize,
        pol: usize,
        src: &[T],
        time: f64,
    ) -> bool {
        let Some(tile) = self.tile_map.resolve(tile_id) else {
            return false;
        };
        if start_channel + nof_channels > self.nof_channels
            || sample >= self.nof_samples
            || start_antenna + nof_antennas > self.nof_antennas
            || pol >= self.nof_pols
            || src.len() < nof_channels * nof_antennas
        {
            return false;
        }
        let (a_dim, p) = (self.nof_antennas, self.nof_pols);
        let tile_base = tile * self.tile_stride();
        let dst = self.data.as_mut_slice();
        for c in 0..nof_channels {
            for a in 0..nof_antennas {
                let dst_idx = tile_base
                    + (((start_channel + c) * self.nof_samples + sample) * a_dim
                        + start_antenna
                        + a)
                        * p
                    + pol;
                dst[dst_idx] = src[c * nof_antennas + a];
            }
        }
        self.tile_packets[tile] += 1;
        self.total_packets += 1;
        if time < self.ref_time {
            self.ref_time = time;
        }
        true
    }

    pub fn has_data(&self) -> bool {
        self.total_packets > 0
    }

    pub fn total_packets(&self) -> u64 {
        self.total_packets
    }

    pub fn ref_time(&self) -> f64 {
        if self.ref_time == f64::MAX { 0.0 } else { self.ref_time }
    }

    pub fn tile_samples(&self, dense: usize) -> &[T] {
        let stride = self.tile_stride();
        &self.data.as_slice()[dense * stride..(dense + 1) * stride]
    }

    pub fn persist<F>(&mut self, callback: &mut Option<DataCallback>, channel_id: u16, mut meta: F)
    where
        F: FnMut(u16, u64) -> CallbackMeta,
    {
        let stride = self.tile_stride();
        let elem = size_of::<T>();
        for dense in 0..self.tile_map.len() {
            if self.tile_packets[dense] == 0 {
                continue;
            }
            let tile_id = self.tile_map.id_at(dense);
            let bytes = &self.data.as_bytes()[dense * stride * elem..(dense + 1) * stride * elem];
            if let Some(cb) = callback.as_mut() {
                let m = meta(tile_id, self.tile_packets[dense]);
                let time = if self.ref_time == f64::MAX { 0.0 } else { self.ref_time };
                cb.invoke(bytes, time, tile_id, channel_id, &m);
            }
        }
        self.clear();
    }

    pub fn clear(&mut self) {
        self.data.clear();
        self.ref_time = f64::MAX;
        self.tile_packets.fill(0);
        self.total_packets = 0;
    }
}

/// Burst-beam container: tile / pol / sample / channel. Packets carry a
/// contiguous slab of 32-bit words; element 2k belongs to pol 0 and
/// element 2k+1 to pol 1.
pub struct BeamBurstContainer<T: Sample> {
    nof_pols: usize,
    nof_samples: usize,
    nof_channels: usize,
    data: PinnedBuffer<T>,
    tile_map: TileMap,
    ref_time: f64,
    tile_packets: Vec<u64>,
}

impl<T: Sample> BeamBurstContainer<T> {
    pub fn new(
        nof_tiles: usize,
        nof_pols: usize,
        nof_samples: usize,
        nof_channels: usize,
    ) -> Result<Self, MemError> {
        Ok(Self {
            nof_pols,
            nof_samples,
            nof_channels,
            data: PinnedBuffer::alloc(nof_tiles * nof_pols * nof_samples * nof_channels)?,
            tile_map: TileMap::new(nof_tiles),
            ref_time: f64::MAX,
            tile_packets: vec![0; nof_tiles],
        })
    }

    #[inline(always)]
    fn tile_stride(&self) -> usize {
        self.nof_pols * self.nof_samples * self.nof_channels
    }

    /// Places the slab [offset, offset + src.len()) of the tile's
    /// pol-interleaved element stream.
    pub fn add_slab(&mut self, tile_id: u16, offset: usize, src: &[T], time: f64) -> bool {
        let Some(tile) = self.tile_map.resolve(tile_id) else {
            return false;
        };
        let (c_dim, s_dim, p_dim) = (self.nof_channels, self.nof_samples, self.nof_pols);
        if (offset + src.len()) > c_dim * s_dim * p_dim {
            return false;
        }
        let tile_base = tile * self.tile_stride();
        let dst = self.data.as_mut_slice();
        for (i, &v) in src.iter().enumerate() {
            let g = offset + i;
            let pol = g % p_dim;
            let j = g / p_dim;
            let channel = j % c_dim;
            let sample = j / c_dim;
            dst[tile_base + (pol * s_dim + sample) * c_dim + channel] = v;
        }
        self.tile_packets[tile] += 1;
        if time < self.ref_time {
            self.ref_time = time;
        }
        true
    }

    pub fn has_data(&self) -> bool {
        self.tile_packets.iter().any(|&n| n > 0)
    }

    pub fn ref_time(&self) -> f64 {
        if self.ref_time == f64::MAX { 0.0 } else { self.ref_time }
    }

    pub fn tile_samples(&self, dense: usize) -> &[T] {
        let stride = self.tile_stride();
        &self.data.as_slice()[dense * stride..(dense + 1) * stride]
    }

    pub fn persist<F>(&mut self, callback: &mut Option<DataCallback>, mut meta: F)
    where
        F: FnMut(u16, u64) -> CallbackMeta,
    {
        let stride = self.tile_stride();
        let elem = size_of::<T>();
        for dense in 0..self.tile_map.len() {
            if self.tile_packets[dense] == 0 {
                continue;
            }
            let tile_id = self.tile_map.id_at(dense);
            let bytes = &self.data.as_bytes()[dense * stride * elem..(dense + 1) * stride * elem];
            if let Some(cb) = callback.as_mut() {
                let m = meta(tile_id, self.tile_packets[dense]);
                let time = if self.ref_time == f64::MAX { 0.0 } else { self.ref_time };
                cb.invoke(bytes, time, tile_id, 0, &m);
            }
        }
        self.clear();
    }

    pub fn clear(&mut self) {
        self.data.clear();
        self.ref_time = f64::MAX;
        self.tile_packets.fill(0);
    }
}

/// Integrated-beam container: tile / beam / channel / sample / pol.
pub struct BeamIntegratedContainer<T: Sample> {
    nof_beams: usize,
    nof_channels: usize,
    nof_samples: usize,
    nof_pols: usize,
    data: PinnedBuffer<T>,
    tile_map: TileMap,
    ref_time: f64,
    tile_packets: Vec<u64>,
    total_packets: u64,
}

impl<T: Sample> BeamIntegratedContainer<T> {
    pub fn new(
        nof_tiles: usize,
        nof_beams: usize,
        nof_channels: usize,
        nof_samples: usize,
        nof_pols: usize,
    ) -> Result<Self, MemError> {
        Ok(Self {
            nof_beams,
            nof_channels,
            nof_samples,
            nof_pols,
            data: PinnedBuffer::alloc(
                nof_tiles * nof_beams * nof_channels * nof_samples * nof_pols,
            )?,
            tile_map: TileMap::new(nof_tiles),
            ref_time: f64::MAX,
            tile_packets: vec![0; nof_tiles],
            total_packets: 0,
        })
    }

    #[inline(always)]
    fn tile_stride(&self) -> usize {
        self.nof_beams * self.nof_channels * self.nof_samples * self.nof_pols
    }

    /// Places one single-pol spectrum ([channel] payload) at the given
    /// sample index of a beam.
    #[allow(clippy::too_many_arguments)]
    pub fn add_spectrum(
        &mut self,
        tile_id: u16,
        beam: usize,
        start_channel: usize,
        nof_channels: usize,
        sample: usize,
        pol: usize,
        src: &[T],
        time: f64,
    ) -> bool {
        let Some(tile) = self.tile_map.resolve(tile_id) else {
            return false;
        };
        if beam >= self.nof_beams
            || start_channel + nof_channels > self.nof_channels
            || sample >= self.nof_samples
            || pol >= self.nof_pols
            || src.len() < nof_channels
        {
            return false;
        }
        let (s_dim, p) = (self.nof_samples, self.nof_pols);
        let tile_base = tile * self.tile_stride();
        let dst = self.data.as_mut_slice();
        for c in 0..nof_channels {
            let dst_idx = tile_base
                + (((beam * self.nof_channels) + start_channel + c) * s_dim + sample) * p
                + pol;
            dst[dst_idx] = src[c];
        }
        self.tile_packets[tile] += 1;
        self.total_packets += 1;
        if time < self.ref_time {
            self.ref_time = time;
        }
        true
    }

    pub fn has_data(&self) -> bool {
        self.total_packets > 0
    }

    pub fn total_packets(&self) -> u64 {
        self.total_packets
    }

    pub fn ref_time(&self) -> f64 {
        if self.ref_time == f64::MAX { 0.0 } else { self.ref_time }
    }

    pub fn tile_samples(&self, dense: usize) -> &[T] {
        let stride = self.tile_stride();
        &self.data.as_slice()[dense * stride..(dense + 1) * stride]
    }

    pub fn persist<F>(&mut self, callback: &mut Option<DataCallback>, mut meta: F)
    where
        F: FnMut(u16, u64) -> CallbackMeta,
    {
        let stride = self.tile_stride();
        let elem = size_of::<T>();
        for dense in 0..self.tile_map.len() {
            if self.tile_packets[dense] == 0 {
                continue;
            }
            let tile_id = self.tile_map.id_at(dense);
            let bytes = &self.data.as_bytes()[dense * stride * elem..(dense + 1) * stride * elem];
            if let Some(cb) = callback.as_mut() {
                let m = meta(tile_id, self.tile_packets[dense]);
                let time = if self.ref_time == f64::MAX { 0.0 } else { self.ref_time };
                cb.invoke(bytes, time, tile_id, 0, &m);
            }
        }
        self.clear();
    }

    pub fn clear(&mut self) {
        self.data.clear();
        self.ref_time = f64::MAX;
        self.tile_packets.fill(0);
        self.total_packets = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callback::{CallbackMeta, ChannelMeta, DataCallback};
    use std::sync::{Arc, Mutex};

    #[test]
    fn raw_multi_antenna_scatter() {
        // 1 tile, 2 antennas, 4 samples, 2 pols.
        let mut c = RawContainer::<i8>::new(1, 2, 4, 2).unwrap();
        // Payload sample-major: [s][a][p].
        let src: Vec<i8> = (0..16).collect();
        assert!(c.add_multi_antenna(5, 0, 2, 0, 4, &src, 100.0));
        // Antenna 0, sample 1, pol 0 is src[(1*2+0)*2+0] = 4.
        assert_eq!(c.tile_samples(0)[1 * 2], 4);
        // Antenna 1, sample 0, pol 1 is src[(0*2+1)*2+1] = 3;
        // dst index = (antenna 1)*4*2 + 0*2 + 1 = 9.
        assert_eq!(c.tile_samples(0)[9], 3);
        assert!(c.is_complete());
    }

    #[test]
    fn raw_completion_counts_samples_across_tiles() {
        let mut c = RawContainer::<i8>::new(2, 1, 4, 1).unwrap();
        let src = [1i8; 4];
        assert!(c.add_single_antenna(0, 0, 0, 4, &src, 10.0));
        assert!(!c.is_complete());
        assert!(c.add_single_antenna(1, 0, 0, 4, &src, 9.0));
        assert!(c.is_complete());
        assert_eq!(c.ref_time(), 9.0);
    }

    #[test]
    fn channel_placement_and_persist() {
        // 1 tile, 2 channels, 2 samples, 2 antennas, 1 pol.
        let mut c = ChannelContainer::<u16>::new(1, 2, 2, 2, 1).unwrap();
        let src: Vec<u16> = (0..8).collect(); // [c][s][a]
        assert!(c.add_data(3, 0, 2, 0, 2, 0, 2, &src, 50.0));

        // channel 1, sample 0, antenna 1 → src[(1*2+0)*2+1] = 5,
        // dst = ((1*2+0)*2+1) = 5 in tile-local indexing.
        assert_eq!(c.tile_samples(0)[5], 5);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let mut cb = Some(DataCallback::Simple(Box::new(move |data, ts, tile, ch| {
            sink.lock().unwrap().push((data.len(), ts, tile, ch));
        })));
        c.persist(&mut cb, 7, |_, packets| {
            CallbackMeta::Channel(ChannelMeta {
                stream: Default::default(),
                start_channel: 0,
                nof_channels: 2,
                bitwidth: 16,
                buffer_counter: packets,
            })
        });

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0], (16, 50.0, 3, 7));
        assert!(!c.has_data());
        assert!(c.tile_samples(0).iter().all(|&v| v == 0));
    }

    #[test]
    fn rejects_out_of_range_and_full_tile_map() {
        let mut c = ChannelContainer::<u16>::new(1, 2, 2, 2, 1).unwrap();
        let src = [0u16; 8];
        assert!(!c.add_data(1, 1, 2, 0, 2, 0, 2, &src, 0.0)); // channel range
        assert!(c.add_data(1, 0, 2, 0, 2, 0, 2, &src, 0.0));
        // Second tile id does not fit a 1-tile map.
        assert!(!c.add_data(2, 0, 2, 0, 2, 0, 2, &src, 0.0));
    }

    #[test]
    fn beam_burst_interleave() {
        // 1 tile, 2 pols, 2 samples, 2 channels.
        let mut c = BeamBurstContainer::<u32>::new(1, 2, 2, 2).unwrap();
        let src: Vec<u32> = (0..8).collect();
        assert!(c.add_slab(0, 0, &src, 1.0));
        // Element g: pol = g%2, j = g/2, channel = j%2, sample = j/2.
        // dst = (pol*2 + sample)*2 + channel.
        // g=5 → pol1, j=2 → channel 0, sample 1 → dst (1*2+1)*2+0 = 6.
        assert_eq!(c.tile_samples(0)[6], 5);
        // g=2 → pol0, j=1 → channel 1, sample 0 → dst (0*2+0)*2+1 = 1.
        assert_eq!(c.tile_samples(0)[1], 2);
    }

    #[test]
    fn beam_integrated_spectrum_placement() {
        // 1 tile, 2 beams, 3 channels, 2 samples, 2 pols.
        let mut c = BeamIntegratedContainer::<u32>::new(1, 2, 3, 2, 2).unwrap();
        let src: Vec<u32> = (10..13).collect(); // [c], one pol
        assert!(c.add_spectrum(0, 1, 0, 3, 1, 0, &src, 2.0));
        // beam 1, channel 2, sample 1, pol 0 → src[2] = 12;
        // dst = ((1*3+2)*2+1)*2 = 22.
        assert_eq!(c.tile_samples(0)[22], 12);
        assert!(!c.add_spectrum(0, 2, 0, 3, 0, 0, &src, 2.0)); // beam oob
    }

    #[test]
    fn channel_single_pol_spectrum() {
        // 1 tile, 2 channels, 1 sample, 2 antennas, 2 pols.
        let mut c = ChannelContainer::<u32>::new(1, 2, 1, 2, 2).unwrap();
        let src: Vec<u32> = vec![1, 2, 3, 4]; // [c][a]
        assert!(c.add_pol_data(0, 0, 2, 0, 0, 2, 1, &src, 3.0));
        // channel 1, antenna 0, pol 1 → src[1*2+0] = 3;
        // dst = ((1*1+0)*2+0)*2 + 1 = 5.
        assert_eq!(c.tile_samples(0)[5], 3);
        assert!(!c.add_pol_data(0, 0, 2, 0, 0, 2, 2, &src, 3.0)); // pol oob
    }
}
