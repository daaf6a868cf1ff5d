//! Whole-station exercise over the loopback interface: UDP in, data
//! callback out, lifecycle status codes checked along the way.

use capture_registry::{DataCallback, Station, Status};
use std::net::UdpSocket;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use stratum_spead::{ChannelInfo, PacketBuilder, TileInfo, item_id};

fn free_port() -> u16 {
    let s = UdpSocket::bind("127.0.0.1:0").unwrap();
    s.local_addr().unwrap().port()
}

fn burst_packet(tile: u16, counter: u64, start_channel: u16, payload: &[u8]) -> Vec<u8> {
    PacketBuilder::new()
        .item(item_id::HEAP_COUNTER, counter)
        .item(item_id::PAYLOAD_LENGTH, payload.len() as u64)
        .item(item_id::SYNC_TIME, 1_700_000_000)
        .item(item_id::TIMESTAMP, 4242)
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
            item_id::CHANNEL_INFO,
            ChannelInfo {
                start_channel,
                nof_channels: 1,
                start_antenna: 0,
                nof_included_antennas: 2,
            }
            .to_value(),
        )
        .item(item_id::CAPTURE_MODE, 0x4)
        .payload(payload)
        .build()
}

#[test]
fn station_delivers_burst_channel_buffers() {
    let mut station = Station::new();
    assert_eq!(
        station.start_receiver("lo", "127.0.0.1", 9000, 4, 8),
        Status::Success
    );
    let port = free_port();
    assert_eq!(station.add_receiver_port(port), Status::Success);

    // Lifecycle guards: unknown names and wrong states come back typed.
    assert_eq!(station.load_consumer("no_such_mode"), Status::NotFound);
    assert_eq!(station.start_consumer("burst_channel"), Status::NotFound);

    assert_eq!(station.load_consumer("burst_channel"), Status::Success);
    assert_eq!(
        station.initialise_consumer("burst_channel", r#"{"nof_tiles": 1}"#),
        Status::Rejected,
        "missing keys are rejected at init"
    );
    let config = r#"{
        "nof_tiles": 1,
        "nof_channels": 4,
        "nof_samples": 8,
        "nof_antennas": 2,
        "nof_pols": 2
    }"#;
    assert_eq!(
        station.initialise_consumer("burst_channel", config),
        Status::Success
    );

    let seen: Arc<Mutex<Vec<(usize, u16)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    assert_eq!(
        station.set_consumer_callback(
            "burst_channel",
            DataCallback::Simple(Box::new(move |data, _ts, tile, _ch| {
                sink.lock().unwrap().push((data.len(), tile));
            })),
        ),
        Status::Success
    );
    assert_eq!(station.start_consumer("burst_channel"), Status::Success);
    assert_eq!(
        station.start_consumer("burst_channel"),
        Status::NotAllowed,
        "double start is refused"
    );

    // One packet per channel: 8 samples × 2 antennas × 2 pols, 16-bit.
    let tx = UdpSocket::bind("127.0.0.1:0").unwrap();
    let payload = vec![0x11u8; 8 * 2 * 2 * 2];
    for channel in 0..4 {
        let pkt = burst_packet(0, channel as u64, channel, &payload);
        tx.send_to(&pkt, ("127.0.0.1", port)).unwrap();
    }

    // Burst mode flushes after the ring goes quiet for the pull timeout.
    let deadline = Instant::now() + Duration::from_secs(10);
    while seen.lock().unwrap().is_empty() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(50));
    }

    {
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1, "one tile, one callback");
        let (len, tile) = seen[0];
        assert_eq!(tile, 0);
        // 4 channels × 8 samples × 2 antennas × 2 pols × 2 bytes.
        assert_eq!(len, 4 * 8 * 2 * 2 * 2);
    }

    let stats = station.receiver_stats().unwrap();
    assert_eq!(stats.packets, 4);

    assert_eq!(station.stop_consumer("burst_channel"), Status::Success);
    assert_eq!(station.stop_consumer("burst_channel"), Status::NotAllowed);
    assert_eq!(station.teardown_consumer("burst_channel"), Status::Success);
    assert_eq!(station.teardown_consumer("burst_channel"), Status::NotFound);
    assert_eq!(station.stop_receiver(), Status::Success);
    assert_eq!(station.stop_receiver(), Status::NotAllowed);
}
