use criterion::{Criterion, Throughput, black_box, criterion_group, criterion_main};
use quickbeam_perf::{bench_ring_name, make_payload};
use quickbeam_rb::{RbFlags, RingBuffer};

const RING_BYTES: usize = 1 << 20;
const PAYLOAD_BYTES: usize = 256;

fn bench_chunk_write(c: &mut Criterion) {
    let name = bench_ring_name("write");
    let rb = RingBuffer::open(
        "/tmp",
        &name,
        RING_BYTES,
        RbFlags::CREATE | RbFlags::OVERWRITE | RbFlags::NO_SEMAPHORE,
        0,
    )
    .expect("failed to create ring");
    let payload = make_payload(PAYLOAD_BYTES);

    let mut group = c.benchmark_group("ring");
    group.throughput(Throughput::Bytes(PAYLOAD_BYTES as u64));
    group.bench_function("chunk_write (overwrite)", |b| {
        b.iter(|| rb.chunk_write(black_box(&payload)).unwrap());
    });
    drop(group);
}

fn bench_write_read_pair(c: &mut Criterion) {
    let name = bench_ring_name("pair");
    let rb = RingBuffer::open(
        "/tmp",
        &name,
        RING_BYTES,
        RbFlags::CREATE | RbFlags::NO_SEMAPHORE,
        0,
    )
    .expect("failed to create ring");
    let payload = make_payload(PAYLOAD_BYTES);
    let mut out = vec![0u8; PAYLOAD_BYTES];

    let mut group = c.benchmark_group("ring");
    group.throughput(Throughput::Bytes(PAYLOAD_BYTES as u64));
    group.bench_function("chunk_write + chunk_read", |b| {
        b.iter(|| {
            rb.chunk_write(black_box(&payload)).unwrap();
            black_box(rb.chunk_read(&mut out, 0).unwrap());
        });
    });
    drop(group);
}

fn bench_peek_empty(c: &mut Criterion) {
    let name = bench_ring_name("empty");
    let rb = RingBuffer::open(
        "/tmp",
        &name,
        RING_BYTES,
        RbFlags::CREATE | RbFlags::NO_SEMAPHORE,
        0,
    )
    .expect("failed to create ring");

    let mut group = c.benchmark_group("ring");
    group.bench_function("chunk_peek (empty)", |b| {
        b.iter(|| black_box(rb.chunk_peek(0).unwrap()));
    });
    drop(group);
}

criterion_group!(
    benches,
    bench_chunk_write,
    bench_write_read_pair,
    bench_peek_empty
);
criterion_main!(benches);
