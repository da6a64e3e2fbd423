//! Frame codec micro-benchmarks.

use bytes::BytesMut;
use criterion::{Criterion, Throughput, black_box, criterion_group, criterion_main};

use asock::websocket::{FrameDecoder, FrameEncoder, FrameKind, MaskPolicy, WireFormat, apply_mask};

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode");
    for size in [64usize, 1024, 65536] {
        let payload = vec![0xA5u8; size];
        group.throughput(Throughput::Bytes(size as u64));

        group.bench_function(format!("unmasked/{size}"), |b| {
            let mut enc = FrameEncoder::new(MaskPolicy::none(), WireFormat::Binary).unwrap();
            b.iter(|| black_box(enc.encode_data(FrameKind::Binary, black_box(&payload))));
        });

        group.bench_function(format!("masked/{size}"), |b| {
            let mut enc = FrameEncoder::new(MaskPolicy::client(), WireFormat::Binary).unwrap();
            b.iter(|| black_box(enc.encode_data(FrameKind::Binary, black_box(&payload))));
        });
    }
    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode");
    for size in [64usize, 1024, 65536] {
        let payload = vec![0xA5u8; size];
        let mut enc = FrameEncoder::new(MaskPolicy::client(), WireFormat::Binary).unwrap();
        let wire = enc.encode_data(FrameKind::Binary, &payload);
        group.throughput(Throughput::Bytes(size as u64));

        group.bench_function(format!("masked/{size}"), |b| {
            b.iter(|| {
                let mut dec =
                    FrameDecoder::new(MaskPolicy::server(), WireFormat::Binary, 1 << 24, 1 << 26);
                let mut socket_buf = BytesMut::from(&wire[..]);
                let mut decode_buf = BytesMut::new();
                let mut events = Vec::new();
                dec.decode(&mut socket_buf, &mut decode_buf, &mut events)
                    .unwrap();
                black_box(decode_buf)
            });
        });
    }
    group.finish();
}

fn bench_masking(c: &mut Criterion) {
    let mut group = c.benchmark_group("mask");
    for size in [64usize, 1024, 65536] {
        let mask = [0x37, 0xfa, 0x21, 0x3d];
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_function(format!("apply/{size}"), |b| {
            let mut data = vec![0xA5u8; size];
            b.iter(|| apply_mask(black_box(&mut data), mask));
        });
    }
    group.finish();
}

criterion_group!(benches, bench_encode, bench_decode, bench_masking);
criterion_main!(benches);
