//! Performance benchmarks for the transfer pipeline.
//!
//! These benchmarks measure the hot paths in the daemon:
//! - Envelope encoding and decoding
//! - Path and extension validation
//! - Checksum computation

use std::collections::HashMap;

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use daemon::files::{ExtensionValidator, PathValidator};
use protocol::messages::{Envelope, FilesExistResponse, Message, Ping};
use protocol::transfer::{checksum_hex, FILES_EXIST_BATCH_SIZE, TRANSFER_CHUNK_SIZE};

fn bench_envelope_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("envelope_codec");

    let ping = Envelope::new(
        "bench",
        Message::Ping(Ping {
            timestamp: 1,
            payload: Vec::new(),
        }),
    );
    group.bench_function("ping_encode", |b| {
        b.iter(|| black_box(&ping).to_msgpack().unwrap());
    });

    // Largest files-exist reply the client asks for in one call
    let exists: HashMap<String, bool> = (0..FILES_EXIST_BATCH_SIZE)
        .map(|i| (format!("file-{i:04}.dat"), i % 2 == 0))
        .collect();
    let batch = Envelope::new(
        "bench",
        Message::FilesExistResponse(FilesExistResponse { exists }),
    );
    let encoded = batch.to_msgpack().unwrap();
    group.throughput(Throughput::Bytes(encoded.len() as u64));
    group.bench_function("files_exist_encode", |b| {
        b.iter(|| black_box(&batch).to_msgpack().unwrap());
    });
    group.bench_function("files_exist_decode", |b| {
        b.iter(|| Envelope::from_msgpack(black_box(&encoded)).unwrap());
    });

    group.finish();
}

fn bench_validation(c: &mut Criterion) {
    let mut group = c.benchmark_group("validation");
    let temp_dir = tempfile::TempDir::new().unwrap();
    let validator = PathValidator::new(temp_dir.path()).unwrap();

    group.bench_function("path_nested", |b| {
        b.iter(|| validator.validate_path(black_box("projects/app/logs/today.log")));
    });
    group.bench_function("path_traversal", |b| {
        b.iter(|| validator.validate_path(black_box("logs/../../../etc/passwd")));
    });

    let allowed = vec!["txt".to_string(), "log".to_string(), "json".to_string()];
    let extensions = ExtensionValidator::new(Some(&allowed));
    group.bench_function("extension", |b| {
        b.iter(|| extensions.validate_extension(black_box("report.final.JSON")));
    });

    group.finish();
}

fn bench_checksum(c: &mut Criterion) {
    let mut group = c.benchmark_group("checksum");

    for (name, size) in [("chunk", TRANSFER_CHUNK_SIZE), ("1MB", 1024 * 1024)] {
        let data = vec![0xA5u8; size];
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_function(name, |b| {
            b.iter(|| checksum_hex(black_box(&data)));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_envelope_codec, bench_validation, bench_checksum);
criterion_main!(benches);
