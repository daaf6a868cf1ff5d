use capture_perf::sample_packet;
use criterion::{Criterion, black_box, criterion_group, criterion_main};
use stratum_spead::{PacketSummary, SpeadPacket};

fn bench_parse(c: &mut Criterion) {
    let packet = sample_packet();

    c.bench_function("spead_header_parse", |b| {
        b.iter(|| SpeadPacket::parse(black_box(&packet)).unwrap())
    });

    c.bench_function("spead_summary_scan", |b| {
        b.iter(|| {
            let p = SpeadPacket::parse(black_box(&packet)).unwrap();
            PacketSummary::scan(&p)
        })
    });

    c.bench_function("spead_classify", |b| {
        b.iter(|| {
            let p = SpeadPacket::parse(black_box(&packet)).unwrap();
            PacketSummary::scan(&p).flow()
        })
    });
}

criterion_group!(benches, bench_parse);
criterion_main!(benches);
