use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use wireless_audio_relay::audio::{Sample, SampleRing};
use wireless_audio_relay::network::Channel;
use wireless_audio_relay::protocol::{DrainPolicy, FrameEncoder, FrameLayout, SequenceWidth};

fn ring_write_read(c: &mut Criterion) {
    let mut group = c.benchmark_group("ring");

    for block in [48usize, 256] {
        let ring = SampleRing::new(1024).unwrap();
        let input: Vec<Sample> = (0..block as i16).collect();
        let mut output = vec![0; block];

        group.throughput(Throughput::Elements(block as u64));
        group.bench_with_input(BenchmarkId::new("write_read", block), &block, |b, _| {
            b.iter(|| {
                ring.write_bulk(black_box(&input));
                ring.read_into(black_box(&mut output))
            })
        });
    }

    group.finish();
}

fn frame_prepare_parse(c: &mut Criterion) {
    let layout = FrameLayout::new(SequenceWidth::U32, 48).unwrap();
    let ring = SampleRing::new(1024).unwrap();
    let input: Vec<Sample> = (0..48).collect();
    let mut encoder = FrameEncoder::new(layout);

    c.bench_function("frame_prepare_parse", |b| {
        b.iter(|| {
            ring.write_bulk(&input);
            encoder.prepare(Channel::Unicast, &ring, DrainPolicy::Filler);
            layout.parse(black_box(encoder.frame())).map(|f| f.sequence)
        })
    });
}

criterion_group!(benches, ring_write_read, frame_prepare_parse);
criterion_main!(benches);
