use stratum_spead::{FlowKind, PacketSummary};

/// Per-consumer packet classification.
///
/// A filter accepts the flows its consumer reassembles. Classification
/// looks only at the capture-mode item (0x2004) — or, for station beam,
/// at the presence of the frequency/scan items — so it runs once per
/// packet on the receiver thread without touching the payload.
#[derive(Debug, Clone)]
pub struct PacketFilter {
    flows: Vec<FlowKind>,
}

impl PacketFilter {
    pub fn flows(flows: &[FlowKind]) -> Self {
        Self {
            flows: flows.to_vec(),
        }
    }

    #[inline(always)]
    pub fn matches(&self, summary: &PacketSummary) -> bool {
        match summary.flow() {
            Some(flow) => self.flows.contains(&flow),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stratum_spead::{PacketBuilder, SpeadPacket, item_id};

    fn summary_of(bytes: &[u8]) -> Option<PacketSummary> {
        SpeadPacket::parse(bytes).map(|p| PacketSummary::scan(&p))
    }

    #[test]
    fn accepts_own_modes_only() {
        let f = PacketFilter::flows(&[FlowKind::BurstChannel]);

        let burst = PacketBuilder::new().item(item_id::CAPTURE_MODE, 0x4).build();
        assert!(f.matches(&summary_of(&burst).unwrap()));

        let raw = PacketBuilder::new().item(item_id::CAPTURE_MODE, 0x1).build();
        assert!(!f.matches(&summary_of(&raw).unwrap()));

        // No mode item at all.
        let bare = PacketBuilder::new().item(item_id::TIMESTAMP, 1).build();
        assert!(!f.matches(&summary_of(&bare).unwrap()));
    }

    #[test]
    fn station_beam_matches_on_item_presence() {
        let f = PacketFilter::flows(&[FlowKind::StationBeam]);
        let pkt = PacketBuilder::new()
            .item(item_id::FREQUENCY, 150_000_000)
            .build();
        assert!(f.matches(&summary_of(&pkt).unwrap()));

        let scan = PacketBuilder::new().item(item_id::SCAN_ID, 12).build();
        assert!(f.matches(&summary_of(&scan).unwrap()));
    }

    #[test]
    fn malformed_packets_never_classify() {
        // Bad magic byte: the parser rejects before any filter runs.
        let mut pkt = PacketBuilder::new().item(item_id::CAPTURE_MODE, 0x4).build();
        pkt[0] = 0x00;
        assert!(summary_of(&pkt).is_none());
    }
}
