//! Benchmarks for the copy-both codec.
//!
//! Run with: `cargo bench --bench protocol_bench`

use bytes::{BufMut, Bytes, BytesMut};
use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use pgwire_walreceiver::lsn::Lsn;
use pgwire_walreceiver::protocol::framing::BackendMessage;
use pgwire_walreceiver::protocol::replication::{StatusReply, decode};
use pgwire_walreceiver::state::ReplicationState;

fn wal_frame(data_size: usize) -> Bytes {
    let mut v = Vec::with_capacity(25 + data_size);
    v.push(b'w');
    v.extend_from_slice(&0x0000_0001_0300_0000u64.to_be_bytes());
    v.extend_from_slice(&0x0000_0001_0400_0000u64.to_be_bytes());
    v.extend_from_slice(&774_000_000_000_000i64.to_be_bytes());
    v.resize(25 + data_size, 0x42);
    Bytes::from(v)
}

fn keepalive_frame() -> Bytes {
    let mut v = Vec::with_capacity(18);
    v.push(b'k');
    v.extend_from_slice(&0x0000_0001_0400_0000u64.to_be_bytes());
    v.extend_from_slice(&774_000_000_000_000i64.to_be_bytes());
    v.push(1);
    Bytes::from(v)
}

fn bench_decode_wal_data(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode_wal_data");

    // 8 KiB is one WAL page; walsender sends up to 128 KiB per message
    for size in [256, 8192, 131_072] {
        let frame = wal_frame(size);
        group.throughput(Throughput::Bytes(frame.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &frame, |b, frame| {
            b.iter(|| decode(black_box(frame.clone())));
        });
    }

    group.finish();
}

fn bench_decode_keepalive(c: &mut Criterion) {
    let frame = keepalive_frame();
    c.bench_function("decode_keepalive", |b| {
        b.iter(|| decode(black_box(frame.clone())));
    });
}

fn bench_status_reply(c: &mut Criterion) {
    c.bench_function("status_reply_encode", |b| {
        b.iter(|| {
            StatusReply::at(black_box(Lsn(0x1_0400_0000)), black_box(774_000_000), false).encode()
        });
    });
}

fn bench_apply_and_reply(c: &mut Criterion) {
    let msg = decode(keepalive_frame()).unwrap();
    c.bench_function("state_apply_and_reply", |b| {
        let mut state = ReplicationState::new();
        b.iter(|| {
            state.apply(black_box(&msg));
            state.reply(false).encode()
        });
    });
}

fn bench_split_copy_data(c: &mut Criterion) {
    // a read buffer holding 32 back-to-back CopyData messages
    let frame = wal_frame(8192);
    let mut input = BytesMut::new();
    for _ in 0..32 {
        input.put_u8(b'd');
        input.put_i32(frame.len() as i32 + 4);
        input.extend_from_slice(&frame);
    }
    let input = input.freeze();

    let mut group = c.benchmark_group("split_copy_data");
    group.throughput(Throughput::Bytes(input.len() as u64));
    group.bench_function("32x8k", |b| {
        b.iter(|| {
            let mut buf = BytesMut::from(&input[..]);
            let mut n = 0;
            while let Ok(Some(msg)) = BackendMessage::try_parse(&mut buf) {
                n += msg.payload.len();
            }
            n
        });
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_decode_wal_data,
    bench_decode_keepalive,
    bench_status_reply,
    bench_apply_and_reply,
    bench_split_copy_data,
);
criterion_main!(benches);
