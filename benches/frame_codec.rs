//! Frame codec benchmark suite.
//!
//! Benchmarks message encoding and decoding at different scales:
//! - Payload sizes: 64 B, 4 KiB, 64 KiB, 1 MiB
//! - Fragment sizes: whole message, 16 KiB fragments
//!
//! Run with: cargo bench --bench frame_codec
//! Results saved to: target/criterion/

use bytes::BytesMut;
use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};

use cdp_wire::{FrameCodec, Message, Role};

// ============================================================================
// Benchmark Parameters
// ============================================================================

const PAYLOAD_SIZES: &[usize] = &[64, 4 * 1024, 64 * 1024, 1024 * 1024];
const FRAGMENT_SIZE: usize = 16 * 1024;
const MASK_KEY: [u8; 4] = [0x37, 0xfa, 0x21, 0x3d];

fn payload(size: usize) -> String {
    let body = "x".repeat(size.saturating_sub(32));
    format!("{{\"id\":1,\"result\":{{\"v\":\"{body}\"}}}}")
}

fn encoded(codec: &FrameCodec, text: &str, fragment: Option<usize>) -> BytesMut {
    let mut buf = BytesMut::new();
    codec
        .encode_message(&Message::Text(text.to_string()), fragment, &mut buf)
        .expect("encode");
    buf
}

// ============================================================================
// Benchmark: Encode
// ============================================================================

fn bench_encode(c: &mut Criterion) {
    let client = FrameCodec::new(Role::Client).with_mask_key(MASK_KEY);

    let mut group = c.benchmark_group("encode");

    for &size in PAYLOAD_SIZES {
        let text = payload(size);
        let message = Message::Text(text);
        group.throughput(Throughput::Bytes(size as u64));

        group.bench_with_input(BenchmarkId::new("masked", size), &message, |b, message| {
            let mut buf = BytesMut::with_capacity(size + 16);
            b.iter(|| {
                buf.clear();
                client.encode_message(message, None, &mut buf).expect("encode");
            });
        });

        group.bench_with_input(
            BenchmarkId::new("masked_fragmented", size),
            &message,
            |b, message| {
                let mut buf = BytesMut::with_capacity(size + 64);
                b.iter(|| {
                    buf.clear();
                    client
                        .encode_message(message, Some(FRAGMENT_SIZE), &mut buf)
                        .expect("encode");
                });
            },
        );
    }

    group.finish();
}

// ============================================================================
// Benchmark: Decode
// ============================================================================

fn bench_decode(c: &mut Criterion) {
    let server = FrameCodec::new(Role::Server);
    let client = FrameCodec::new(Role::Client).with_mask_key(MASK_KEY);

    let mut group = c.benchmark_group("decode");

    for &size in PAYLOAD_SIZES {
        let text = payload(size);
        group.throughput(Throughput::Bytes(size as u64));

        // Server to client: unmasked.
        let unmasked = encoded(&server, &text, None);
        group.bench_with_input(BenchmarkId::new("unmasked", size), &unmasked, |b, wire| {
            let mut codec = FrameCodec::new(Role::Client);
            b.iter(|| {
                let mut buf = wire.clone();
                codec.decode(&mut buf).expect("decode").expect("message")
            });
        });

        let fragmented = encoded(&server, &text, Some(FRAGMENT_SIZE));
        group.bench_with_input(
            BenchmarkId::new("unmasked_fragmented", size),
            &fragmented,
            |b, wire| {
                let mut codec = FrameCodec::new(Role::Client);
                b.iter(|| {
                    let mut buf = wire.clone();
                    codec.decode(&mut buf).expect("decode").expect("message")
                });
            },
        );

        // Client to server: masked.
        let masked = encoded(&client, &text, None);
        group.bench_with_input(BenchmarkId::new("masked", size), &masked, |b, wire| {
            let mut codec = FrameCodec::new(Role::Server);
            b.iter(|| {
                let mut buf = wire.clone();
                codec.decode(&mut buf).expect("decode").expect("message")
            });
        });
    }

    group.finish();
}

// ============================================================================
// Criterion Setup
// ============================================================================

criterion_group!(benches, bench_encode, bench_decode);
criterion_main!(benches);
