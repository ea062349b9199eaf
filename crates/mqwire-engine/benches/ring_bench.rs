//! Ring buffer hot-path benchmarks.
//!
//! Covers the three costs the loops pay per frame: the claim/advance
//! cursor dance on one thread, the full producer/consumer handoff across
//! threads, and the reading-gate bookkeeping.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

use mqwire_core::CancellationToken;
use mqwire_engine::ring::{RingBuffer, RingByteReader, RingByteWriter};

const CHUNK: usize = 64;

fn bench_claim_advance(c: &mut Criterion) {
    let mut group = c.benchmark_group("ring_claim");
    group.throughput(Throughput::Bytes(CHUNK as u64));

    group.bench_function("write_read_64b", |b| {
        let ring = RingBuffer::new(64 * 1024);
        let payload = [7u8; CHUNK];
        let mut sink = [0u8; CHUNK];

        b.iter(|| {
            let (pos, avail) = ring.space_to_write(CHUNK as u32);
            ring.write_at(pos, &payload[..avail as usize]);
            ring.advance_write(avail);

            let (pos, avail) = ring.space_to_read(CHUNK as u32);
            ring.read_at(pos, &mut sink[..avail as usize]);
            ring.advance_read(avail);
            black_box(sink[0]);
        });
    });

    group.finish();
}

fn bench_cross_thread_stream(c: &mut Criterion) {
    let mut group = c.benchmark_group("ring_stream");
    group.throughput(Throughput::Bytes(4096));

    group.bench_function("producer_consumer_4k", |b| {
        let ring = Arc::new(RingBuffer::new(64 * 1024));
        let cancel = CancellationToken::new();
        let park = Duration::from_millis(1);

        let mut writer = RingByteWriter::new(ring.clone(), cancel.clone(), park);
        let mut reader = RingByteReader::new(ring.clone(), cancel.clone(), park);

        let stop = Arc::new(AtomicBool::new(false));
        let stop_consumer = stop.clone();
        let consumer = thread::spawn(move || {
            let mut sink = [0u8; 4096];
            while !stop_consumer.load(Ordering::Relaxed) {
                if reader.read(&mut sink).is_err() {
                    break;
                }
            }
        });

        let payload = [42u8; 4096];
        b.iter(|| {
            writer.write_all(black_box(&payload)).unwrap();
        });

        stop.store(true, Ordering::Relaxed);
        cancel.cancel();
        consumer.join().unwrap();
    });

    group.finish();
}

fn bench_reading_gates(c: &mut Criterion) {
    let mut group = c.benchmark_group("ring_gates");
    group.throughput(Throughput::Elements(1));

    group.bench_function("add_remove", |b| {
        let ring = RingBuffer::new(4096);
        let (pos, avail) = ring.space_to_write(512);
        ring.write_at(pos, &[1u8; 512][..avail as usize]);
        ring.advance_write(avail);

        b.iter(|| {
            let gate = ring.add_reading_gate(64).unwrap();
            ring.remove_reading_gate(black_box(&gate));
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_claim_advance,
    bench_cross_thread_stream,
    bench_reading_gates
);
criterion_main!(benches);
