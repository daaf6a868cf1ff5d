use capture_perf::sample_packet;
use criterion::{Criterion, black_box, criterion_group, criterion_main};
use std::time::Duration;
use stratum_ring::{RingConfig, channel};

fn bench_ring(c: &mut Criterion) {
    let packet = sample_packet();

    c.bench_function("ring_reserve_commit_pull", |b| {
        let (mut prod, mut cons) = channel(RingConfig::new(1 << 10, 9000));
        b.iter(|| {
            let slot = prod.reserve().unwrap();
            slot[..packet.len()].copy_from_slice(&packet);
            prod.commit(packet.len());
            let read = cons.pull_timeout(Duration::from_millis(1)).unwrap();
            black_box(read.len());
        })
    });

    c.bench_function("ring_full_rejection", |b| {
        let (mut prod, _cons) = channel(RingConfig::new(2, 9000));
        let slot = prod.reserve().unwrap();
        slot[0] = 1;
        prod.commit(1);
        let slot = prod.reserve().unwrap();
        slot[0] = 2;
        prod.commit(1);
        b.iter(|| black_box(prod.reserve().is_none()))
    });
}

criterion_group!(benches, bench_ring);
criterion_main!(benches);
