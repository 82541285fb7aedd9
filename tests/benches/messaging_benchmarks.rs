//! # Messaging Benchmarks
//!
//! | Path | Operation |
//! |------|-----------|
//! | sv-01 Frame Codec | Encode one frame |
//! | sv-01 Frame Codec | Reassemble frames from split reads |
//! | sv-01 Envelope | Classify incoming messages |

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use serde_json::json;
use sv_01_pipe_messaging::{encode_frame, Envelope, FrameAssembler, MAX_PAYLOAD_LEN};

// ============================================================================
// sv-01: Frame Codec
// ============================================================================

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| b'a' + (i % 26) as u8).collect()
}

fn bench_encode_frame(c: &mut Criterion) {
    let mut group = c.benchmark_group("sv-01-encode-frame");

    for size in [16, 1024, MAX_PAYLOAD_LEN] {
        let bytes = payload(size);
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &bytes, |b, bytes| {
            b.iter(|| black_box(encode_frame(bytes).is_ok()))
        });
    }

    group.finish();
}

fn bench_frame_reassembly(c: &mut Criterion) {
    let mut group = c.benchmark_group("sv-01-frame-reassembly");

    // 64 frames of 1 KiB delivered in reads of varying size.
    let mut stream = Vec::new();
    for _ in 0..64 {
        stream.extend(encode_frame(&payload(1024)).unwrap_or_default());
    }
    group.throughput(Throughput::Bytes(stream.len() as u64));

    for read_size in [1, 7, 512, 4096, stream.len()] {
        group.bench_with_input(
            BenchmarkId::new("read_size", read_size),
            &read_size,
            |b, &read_size| {
                b.iter(|| {
                    let mut assembler = FrameAssembler::new();
                    let mut frames = 0;
                    for chunk in stream.chunks(read_size) {
                        frames += assembler.push(chunk).map(|f| f.len()).unwrap_or(0);
                    }
                    black_box(frames)
                })
            },
        );
    }

    group.finish();
}

// ============================================================================
// sv-01: Envelope
// ============================================================================

fn bench_envelope_parse(c: &mut Criterion) {
    let mut group = c.benchmark_group("sv-01-envelope");

    let messages = [
        ("request", json!({ "request": "3", "requestType": "status" })),
        ("response", json!({ "response": "3", "data": { "isRunning": true } })),
        ("error", json!({ "error": "3", "data": { "message": "nope" } })),
        ("other", json!({ "note": "unsolicited" })),
    ];
    for (name, message) in &messages {
        group.bench_with_input(BenchmarkId::from_parameter(name), message, |b, message| {
            b.iter(|| black_box(Envelope::parse(message)))
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_encode_frame,
    bench_frame_reassembly,
    bench_envelope_parse,
);

criterion_main!(benches);
