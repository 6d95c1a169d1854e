//! MBAP codec and slave cycle benchmarks
//!
//! Run with `cargo bench --bench throughput`

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use modbus_ip::mbap::{encode_frame, encode_header, inspect_frame, MbapHeader};
use modbus_ip::{ModbusPdu, PduBuilder, DEFAULT_MAX_FRAME};

const READ_REQUEST: [u8; 12] = [
    0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x01, 0x03, 0x00, 0x00, 0x00, 0x01,
];

fn bench_header(c: &mut Criterion) {
    let mut group = c.benchmark_group("mbap_header");
    group.throughput(Throughput::Bytes(7));

    group.bench_function("encode", |b| {
        b.iter(|| encode_header(black_box(0x1234), black_box(1), black_box(5)))
    });

    let raw = encode_header(0x1234, 1, 5);
    group.bench_function("decode", |b| {
        b.iter(|| {
            let header = MbapHeader::decode(black_box(&raw)).unwrap();
            header.pdu_len().unwrap()
        })
    });

    group.finish();
}

fn bench_frame(c: &mut Criterion) {
    let mut group = c.benchmark_group("mbap_frame");

    for pdu_len in [5usize, 64, DEFAULT_MAX_FRAME] {
        let pdu = vec![0x10u8; pdu_len];
        let frame = encode_frame(1, 1, &pdu);
        group.throughput(Throughput::Bytes(frame.len() as u64));

        group.bench_function(format!("encode_{}", pdu_len), |b| {
            b.iter(|| encode_frame(black_box(1), black_box(1), black_box(&pdu)))
        });

        group.bench_function(format!("inspect_{}", pdu_len), |b| {
            b.iter(|| inspect_frame(black_box(&frame), DEFAULT_MAX_FRAME))
        });
    }

    group.finish();
}

fn bench_request_cycle(c: &mut Criterion) {
    // Strip header, build reply PDU, re-frame: the CPU side of one slave cycle
    c.bench_function("request_reply_cycle", |b| {
        b.iter_batched(
            || READ_REQUEST,
            |request| {
                let header = MbapHeader::decode(&request[..7].try_into().unwrap()).unwrap();
                let mut pdu = ModbusPdu::from_slice(&request[7..]).unwrap();
                pdu.replace(&[0x03, 0x02, 0x00, 0x2A]).unwrap();
                black_box(encode_frame(header.transaction_id, header.unit_id, pdu.as_slice()))
            },
            BatchSize::SmallInput,
        )
    });

    c.bench_function("build_write_single_register", |b| {
        b.iter(|| PduBuilder::build_write_single_register(black_box(10), black_box(42)).unwrap())
    });
}

criterion_group!(benches, bench_header, bench_frame, bench_request_cycle);
criterion_main!(benches);
