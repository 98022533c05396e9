//! Benchmarks for the hot path: framing and fan-out
//!
//! Run with: cargo bench

use bytes::BytesMut;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use pktflow::ingest::{CircularBuffer, RawSource, WaitOutcome};
use pktflow::pipeline::{
    write_packet, BatchNode, DispatchGraph, Framer, FramingLimits, KindFilter, NodeContext,
    PacketBatch, PacketHeader, PacketKind, RawBuffer, HEADER_SIZE,
};
use std::sync::Arc;
use std::time::Duration;

fn stream(count: usize, total_length: usize) -> RawBuffer {
    let mut buf = BytesMut::with_capacity(count * total_length);
    let payload = vec![0x5Au8; total_length - HEADER_SIZE];
    for i in 0..count {
        let header = PacketHeader::new(PacketKind((i % 4) as u16), 0).with_sequence(i as u32);
        write_packet(&mut buf, header, &payload);
    }
    RawBuffer::new(buf.freeze())
}

fn bench_framer(c: &mut Criterion) {
    let mut group = c.benchmark_group("framer");
    let framer = Framer::default();

    for size in [32usize, 256, 1024] {
        let raw = stream(1000, size);
        group.throughput(Throughput::Bytes(raw.len() as u64));
        group.bench_with_input(BenchmarkId::new("frame", size), &raw, |b, raw| {
            let mut out = Vec::with_capacity(1000);
            b.iter(|| {
                out.clear();
                black_box(framer.frame_into(raw, &mut out).ok());
            })
        });
    }

    group.finish();
}

fn bench_batch_reset(c: &mut Criterion) {
    let raw = stream(1000, 64);
    let limits = FramingLimits::default();
    let batch = PacketBatch::new();

    c.bench_function("batch_reset_1000x64", |b| {
        b.iter(|| {
            let summary = batch.reset(raw.clone(), &limits).ok();
            batch.release();
            black_box(summary)
        })
    });
}

struct Count(u64);

impl BatchNode for Count {
    fn name(&self) -> &str {
        "count"
    }

    fn on_batch(&mut self, batch: &PacketBatch, ctx: &mut NodeContext) {
        let packets = batch.packets();
        self.0 += ctx.matching(&packets).count() as u64;
    }
}

fn bench_fan_out(c: &mut Criterion) {
    let mut group = c.benchmark_group("fan_out");

    for subscribers in [1usize, 4, 16] {
        let graph = DispatchGraph::new();
        let source = graph.add_source("bench");
        for _ in 0..subscribers {
            if let Ok(id) = graph.add_node(Count(0)) {
                let _ = graph.subscribe(source, id, KindFilter::only([1u16, 2]));
            }
        }
        let batch = Arc::new(PacketBatch::new());
        let _ = batch.reset(stream(256, 64), &FramingLimits::default());

        group.bench_with_input(
            BenchmarkId::new("inline", subscribers),
            &subscribers,
            |b, _| b.iter(|| black_box(graph.publish(source, &batch).ok())),
        );
        batch.release();
        graph.shutdown();
    }

    group.finish();
}

fn bench_buffer_cycle(c: &mut Criterion) {
    let buffer = CircularBuffer::new(1 << 20);
    let chunk = vec![0u8; 4096];

    c.bench_function("buffer_push_wait_consume_4k", |b| {
        b.iter(|| {
            buffer.push(&chunk);
            if let Ok(WaitOutcome::Ready(raw)) = buffer.wait(Duration::ZERO) {
                let _ = buffer.consume(raw.len());
            }
        })
    });
}

criterion_group!(
    benches,
    bench_framer,
    bench_batch_reset,
    bench_fan_out,
    bench_buffer_cycle
);
criterion_main!(benches);
