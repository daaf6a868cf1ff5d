//! Synthetic SPEAD packet construction, used by the test suites and the
//! benches to exercise the reassembly pipeline without a TPM on the wire.

use crate::parser::{HEAP_ADDR_WIDTH, ITEM_POINTER_WIDTH, SPEAD_MAGIC, SPEAD_VERSION};

/// Builds one SPEAD-64-48 packet: header, item pointers in insertion
/// order, then the payload.
#[derive(Debug, Default, Clone)]
pub struct PacketBuilder {
    items: Vec<(u16, u64)>,
    payload: Vec<u8>,
}

impl PacketBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an immediate item. The value is truncated to 48 bits.
    pub fn item(mut self, id: u16, value: u64) -> Self {
        self.items.push((id, value & 0x0000_FFFF_FFFF_FFFF));
        self
    }

    pub fn payload(mut self, bytes: &[u8]) -> Self {
        self.payload.extend_from_slice(bytes);
        self
    }

    pub fn build(self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + self.items.len() * 8 + self.payload.len());
        out.extend_from_slice(&[
            SPEAD_MAGIC,
            SPEAD_VERSION,
            ITEM_POINTER_WIDTH,
            HEAP_ADDR_WIDTH,
            0,
            0,
        ]);
        out.extend_from_slice(&(self.items.len() as u16).to_be_bytes());
        for (id, value) in &self.items {
            let w = (1u64 << 63) | ((*id as u64 & 0x7FFF) << 48) | value;
            out.extend_from_slice(&w.to_be_bytes());
        }
        out.extend_from_slice(&self.payload);
        out
    }
}
