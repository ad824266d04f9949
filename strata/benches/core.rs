use criterion::{criterion_group, criterion_main, Criterion};
use strata::logger::shim::ShimBackend;
use strata::logger::{DataLogger, LoggerConfig};
use strata::wire::{DataAck, DataHeader};

fn logger_write(c: &mut Criterion) {
    let shim = ShimBackend::new(1024, 256, 16);
    let logger = DataLogger::new(Box::new(shim), LoggerConfig::default(), None).unwrap();
    let payload = [0x5Au8; 200];

    c.bench_function("logger_write_200b", |b| {
        b.iter(|| {
            if logger.current_block() + 1 >= logger.logical_blocks() {
                logger.erase(true, None).unwrap();
            }

            logger.write(1, &payload).unwrap();
        })
    });
}

fn logger_write_staged(c: &mut Criterion) {
    let shim = ShimBackend::new(1024, 256, 16);
    let logger = DataLogger::new(
        Box::new(shim),
        LoggerConfig {
            ram_blocks: 16,
            offload_depth: 0,
        },
        None,
    )
    .unwrap();
    let payload = [0x5Au8; 200];

    c.bench_function("logger_write_200b_staged", |b| {
        b.iter(|| {
            if logger.current_block() + 32 >= logger.logical_blocks() {
                logger.erase(true, None).unwrap();
            }

            logger.write(1, &payload).unwrap();
        })
    });
}

fn wire_codec(c: &mut Criterion) {
    let ack = DataAck {
        request_id: 7,
        offsets: vec![0, 64, 128, 192, 256, 320, 384, 448],
    };

    c.bench_function("data_ack_roundtrip", |b| {
        b.iter(|| {
            let mut raw = Vec::with_capacity(36);
            ack.write(&mut raw).unwrap();
            DataAck::read(&raw).unwrap()
        })
    });

    let header = DataHeader {
        request_id: 42,
        offset: 4096,
    };

    c.bench_function("data_header_roundtrip", |b| {
        b.iter(|| {
            let mut raw = [0u8; DataHeader::SIZE];
            header.write(&mut raw[..]).unwrap();
            DataHeader::read(&raw).unwrap()
        })
    });
}

criterion_group!(benches, logger_write, logger_write_staged, wire_codec);
criterion_main!(benches);
