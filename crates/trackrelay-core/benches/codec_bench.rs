//! Criterion benchmarks for the trackrelay binary codec.
//!
//! Measures encode and decode latency of state updates at every protocol
//! version, plus the cost of decoding in the opposite byte order (the path a
//! receiver takes when the sender's endianness differs).
//!
//! Run with:
//! ```bash
//! cargo bench --package trackrelay-core --bench codec_bench
//! ```

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use trackrelay_core::protocol::codec::{decode_frame, encode_frame};
use trackrelay_core::protocol::messages::{DeviceUpdate, Message, StateUpdate};
use trackrelay_core::protocol::version::Capabilities;
use trackrelay_core::transport::ByteOrder;
use trackrelay_core::{Pose, Quat, Vec3, Velocity};

// ── Message fixtures ──────────────────────────────────────────────────────────

fn make_update(devices: u16) -> Message {
    Message::StateUpdate(StateUpdate::new(
        (0..devices)
            .map(|i| {
                let t = f32::from(i);
                DeviceUpdate::new(i)
                    .with_pose(Pose::new(Vec3::new(t, 1.5, -t), Quat::from_yaw(t * 0.1)))
                    .with_velocity(Velocity {
                        linear: Vec3::new(0.1, 0.0, 0.0),
                        angular: Vec3::new(0.0, 0.2, 0.0),
                    })
                    .with_buttons(vec![i % 2 == 0; 4])
                    .with_valuators(vec![0.5, -0.5])
                    .with_time_stamp(1_000 + u64::from(i))
                    .with_valid(true)
            })
            .collect(),
    ))
}

/// Benchmarks `encode_frame` for a 16-device update at every version.
fn bench_encode(c: &mut Criterion) {
    let msg = make_update(16);
    let mut group = c.benchmark_group("encode_state_update");
    for version in 1..=4u32 {
        let caps = Capabilities::for_version(version);
        group.bench_with_input(BenchmarkId::new("version", version), &caps, |b, &caps| {
            b.iter(|| {
                encode_frame(black_box(&msg), caps, ByteOrder::native())
                    .expect("encode must succeed")
            })
        });
    }
    group.finish();
}

/// Benchmarks `decode_frame` for a 16-device update at every version.
fn bench_decode(c: &mut Criterion) {
    let msg = make_update(16);
    let mut group = c.benchmark_group("decode_state_update");
    for version in 1..=4u32 {
        let caps = Capabilities::for_version(version);
        let bytes = encode_frame(&msg, caps, ByteOrder::native())
            .expect("encode must succeed for benchmark setup");
        group.bench_with_input(BenchmarkId::new("version", version), &bytes, |b, bytes| {
            b.iter(|| {
                decode_frame(black_box(bytes), caps, ByteOrder::native())
                    .expect("decode must succeed")
            })
        });
    }
    group.finish();
}

/// Benchmarks decoding frames written by a peer of the opposite byte order.
fn bench_decode_swapped(c: &mut Criterion) {
    let caps = Capabilities::for_version(4);
    let foreign = ByteOrder::native().reversed();
    let mut group = c.benchmark_group("decode_swapped");
    for devices in [1u16, 16, 128] {
        let bytes = encode_frame(&make_update(devices), caps, foreign)
            .expect("encode must succeed for benchmark setup");
        group.bench_with_input(BenchmarkId::new("devices", devices), &bytes, |b, bytes| {
            b.iter(|| decode_frame(black_box(bytes), caps, foreign).expect("decode must succeed"))
        });
    }
    group.finish();
}

criterion_group!(benches, bench_encode, bench_decode, bench_decode_swapped);
criterion_main!(benches);
