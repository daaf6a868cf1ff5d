use capture_buffers::ChannelContainer;
use criterion::{Criterion, black_box, criterion_group, criterion_main};

fn bench_container(c: &mut Criterion) {
    // One tile, one channel, the continuous-channel hot path.
    let mut container = ChannelContainer::<u16>::new(1, 1, 1 << 16, 16, 2).unwrap();
    let samples = vec![0x55AAu16; 256 * 16 * 2];

    let mut counter = 0usize;
    c.bench_function("channel_container_add_data", |b| {
        b.iter(|| {
            let start = (counter * 256) % (1 << 16);
            counter += 1;
            black_box(container.add_data(0, 0, 1, start, 256, 0, 16, &samples, 1.0))
        })
    });
}

criterion_group!(benches, bench_container);
criterion_main!(benches);
