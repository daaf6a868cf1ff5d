//! `stratum-mem`: pinned, page-aligned sample memory for the reassembly
//! containers and double buffers.
//!
//! Backing storage is an anonymous memory map, so it is page-aligned by
//! construction, and locked into RAM (`mlock`) so reassembly never takes a
//! page fault mid-epoch. Locking needs `CAP_IPC_LOCK` or a generous
//! `RLIMIT_MEMLOCK`; when it is refused the buffer degrades to an unlocked
//! mapping with a warning, mirroring how the receiver degrades its socket
//! buffer request when unprivileged.
//!
//! GPU-bound double buffers can instead wrap externally allocated
//! write-combined pinned host memory via [`ExternalBuffer`].

use memmap2::MmapMut;
use std::marker::PhantomData;
use tracing::warn;

#[derive(Debug, thiserror::Error)]
pub enum MemError {
    #[error("failed to map {bytes} bytes of sample memory")]
    Map {
        bytes: usize,
        #[source]
        source: std::io::Error,
    },
}

/// Marker for types that are plain sample words: any bit pattern is a
/// valid value and byte views are meaningful.
///
/// # Safety
/// Implementors must be `repr(C)`/primitive with no padding and no
/// invalid bit patterns.
pub unsafe trait Sample: Copy + Default + Send + 'static {}

unsafe impl Sample for u8 {}
unsafe impl Sample for i8 {}
unsafe impl Sample for u16 {}
unsafe impl Sample for i16 {}
unsafe impl Sample for u32 {}
unsafe impl Sample for i32 {}
unsafe impl Sample for u64 {}
unsafe impl Sample for f32 {}

/// A typed, zero-initialised, page-aligned and (best effort) mlocked
/// allocation of `len` samples.
pub struct PinnedBuffer<T: Sample> {
    mmap: MmapMut,
    len: usize,
    locked: bool,
    _pd: PhantomData<T>,
}

impl<T: Sample> PinnedBuffer<T> {
    pub fn alloc(len: usize) -> Result<Self, MemError> {
        let bytes = (len * size_of::<T>()).max(1);
        let mut mmap = MmapMut::map_anon(bytes).map_err(|source| MemError::Map { bytes, source })?;
        let locked = match mmap.lock() {
            Ok(()) => true,
            Err(e) => {
                warn!(bytes, error = %e, "mlock refused, sample memory left unpinned");
                false
            }
        };
        Ok(Self {
            mmap,
            len,
            locked,
            _pd: PhantomData,
        })
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether the mapping is actually locked into RAM.
    pub fn is_locked(&self) -> bool {
        self.locked
    }

    #[inline(always)]
    pub fn as_slice(&self) -> &[T] {
        // SAFETY: the mapping holds len * size_of::<T>() zero-initialised
        // bytes, page alignment satisfies T's alignment, and T::Sample
        // admits any bit pattern.
        unsafe { std::slice::from_raw_parts(self.mmap.as_ptr() as *const T, self.len) }
    }

    #[inline(always)]
    pub fn as_mut_slice(&mut self) -> &mut [T] {
        // SAFETY: as as_slice, plus exclusive access through &mut self.
        unsafe { std::slice::from_raw_parts_mut(self.mmap.as_mut_ptr() as *mut T, self.len) }
    }

    /// Raw byte view, as handed to data callbacks.
    #[inline(always)]
    pub fn as_bytes(&self) -> &[u8] {
        &self.mmap[..self.len * size_of::<T>()]
    }

    /// Zeroes the buffer (epoch clear).
    pub fn clear(&mut self) {
        self.as_mut_slice().fill(T::default());
    }
}

/// Copies a native-endian byte stream into a typed scratch vector.
///
/// Packet payloads sit at arbitrary alignment inside ring slots, so
/// consumers decode through a reused scratch buffer instead of casting
/// the bytes in place. Trailing bytes that do not fill a whole sample are
/// ignored.
pub fn decode_samples<T: Sample>(bytes: &[u8], scratch: &mut Vec<T>) {
    let n = bytes.len() / size_of::<T>();
    scratch.clear();
    scratch.resize(n, T::default());
    // SAFETY: scratch holds n initialised samples; we overwrite exactly
    // n * size_of::<T>() bytes, and Sample admits any bit pattern.
    unsafe {
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), scratch.as_mut_ptr() as *mut u8, n * size_of::<T>());
    }
}

/// Externally owned sample memory, e.g. CUDA write-combined pinned host
/// allocations handed over by the correlator. The region must outlive the
/// buffer and must not be accessed by the allocator while the station
/// writes to it.
pub struct ExternalBuffer<T: Sample> {
    ptr: *mut T,
    len: usize,
}

// SAFETY: the constructor contract gives the buffer exclusive use of the
// region for its lifetime.
unsafe impl<T: Sample> Send for ExternalBuffer<T> {}

impl<T: Sample> ExternalBuffer<T> {
    /// # Safety
    /// `ptr` must point to `len` properly aligned, writable samples that
    /// stay valid and exclusively owned by this buffer until it is dropped.
    pub unsafe fn from_raw_parts(ptr: *mut T, len: usize) -> Self {
        Self { ptr, len }
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Slot backing for a double buffer: owned pinned memory, or an external
/// (GPU pinned) region selected by the allocation-policy flag.
pub enum SampleStore<T: Sample> {
    Owned(PinnedBuffer<T>),
    External(ExternalBuffer<T>),
}

impl<T: Sample> SampleStore<T> {
    pub fn len(&self) -> usize {
        match self {
            Self::Owned(b) => b.len(),
            Self::External(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline(always)]
    pub fn as_slice(&self) -> &[T] {
        match self {
            Self::Owned(b) => b.as_slice(),
            // SAFETY: constructor contract of ExternalBuffer.
            Self::External(b) => unsafe { std::slice::from_raw_parts(b.ptr, b.len) },
        }
    }

    #[inline(always)]
    pub fn as_mut_slice(&mut self) -> &mut [T] {
        match self {
            Self::Owned(b) => b.as_mut_slice(),
            // SAFETY: constructor contract plus &mut self.
            Self::External(b) => unsafe { std::slice::from_raw_parts_mut(b.ptr, b.len) },
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        let s = self.as_slice();
        // SAFETY: Sample admits byte views; length in bytes fits the slice.
        unsafe { std::slice::from_raw_parts(s.as_ptr() as *const u8, size_of_val(s)) }
    }

    pub fn clear(&mut self) {
        self.as_mut_slice().fill(T::default());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_is_zeroed_and_typed() {
        let mut buf = PinnedBuffer::<u16>::alloc(1024).unwrap();
        assert_eq!(buf.len(), 1024);
        assert!(buf.as_slice().iter().all(|&v| v == 0));

        buf.as_mut_slice()[7] = 0xBEEF;
        assert_eq!(buf.as_slice()[7], 0xBEEF);
        assert_eq!(buf.as_bytes().len(), 2048);

        buf.clear();
        assert!(buf.as_slice().iter().all(|&v| v == 0));
    }

    #[test]
    fn page_alignment() {
        let buf = PinnedBuffer::<u32>::alloc(16).unwrap();
        assert_eq!(buf.as_slice().as_ptr() as usize % 4096, 0);
    }

    #[test]
    fn decode_samples_handles_any_alignment() {
        let bytes = [0x01u8, 0x02, 0x03, 0x04, 0x05, 0x06];
        let mut scratch: Vec<u16> = Vec::new();
        // Offset by one to force a misaligned source; the trailing odd
        // byte is ignored.
        decode_samples(&bytes[1..], &mut scratch);
        assert_eq!(
            scratch,
            vec![
                u16::from_ne_bytes([0x02, 0x03]),
                u16::from_ne_bytes([0x04, 0x05]),
            ]
        );
    }

    #[test]
    fn external_store_round_trip() {
        let mut host = vec![0i8; 256];
        let store = {
            let ext = unsafe { ExternalBuffer::from_raw_parts(host.as_mut_ptr(), host.len()) };
            let mut store = SampleStore::External(ext);
            store.as_mut_slice()[3] = -5;
            store
        };
        assert_eq!(store.as_slice()[3], -5);
        drop(store);
        assert_eq!(host[3], -5);
    }
}
