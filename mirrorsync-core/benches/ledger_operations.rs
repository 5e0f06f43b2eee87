use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use mirrorsync_core::core_ledger::{SqlLedger, SyncLedger};
use mirrorsync_core::core_sync::{content_hash, SyncMessage};
use mirrorsync_core::core_comms::{decode_frame, encode_frame};
use mirrorsync_core::SyncRecord;
use std::time::Duration;
use tempfile::TempDir;

fn seeded_ledger(dir: &TempDir, paths: usize, versions: usize) -> SqlLedger {
    let ledger = SqlLedger::open(dir.path().join("ledger.db")).unwrap();
    for version in 0..versions {
        for i in 0..paths {
            let record = SyncRecord::new(
                format!("src/file_{}.rs", i),
                content_hash(format!("{}-{}", i, version).as_bytes()),
                version as f64,
                "bench",
                64,
            );
            ledger.record(&record).unwrap();
        }
    }
    ledger
}

fn bench_ledger_writes(c: &mut Criterion) {
    let mut group = c.benchmark_group("ledger_write");
    group.measurement_time(Duration::from_secs(10));

    let dir = TempDir::new().unwrap();
    let ledger = SqlLedger::open(dir.path().join("ledger.db")).unwrap();
    let mut counter = 0u64;

    group.bench_function("record", |b| {
        b.iter(|| {
            counter += 1;
            let record = SyncRecord::new(
                format!("file_{}.txt", counter % 512),
                content_hash(&counter.to_le_bytes()),
                counter as f64,
                "bench",
                8,
            );
            ledger.record(black_box(&record)).unwrap();
        });
    });

    group.finish();
}

fn bench_ledger_reads(c: &mut Criterion) {
    let mut group = c.benchmark_group("ledger_read");

    for paths in [100usize, 1000] {
        let dir = TempDir::new().unwrap();
        let ledger = seeded_ledger(&dir, paths, 5);

        group.bench_with_input(BenchmarkId::new("current", paths), &paths, |b, &paths| {
            let mut i = 0;
            b.iter(|| {
                i = (i + 1) % paths;
                black_box(ledger.current(&format!("src/file_{}.rs", i)).unwrap())
            });
        });

        group.throughput(Throughput::Elements(paths as u64));
        group.bench_with_input(BenchmarkId::new("all_current", paths), &paths, |b, _| {
            b.iter(|| black_box(ledger.all_current().unwrap()));
        });
    }

    group.finish();
}

fn bench_frame_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_codec");

    for size in [1024usize, 64 * 1024, 1024 * 1024] {
        let content: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
        let record = SyncRecord::new("blob.bin", content_hash(&content), 1.0, "bench", size as u64);
        let message = SyncMessage::file_sync(&record, &content);

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("encode", size), &message, |b, message| {
            b.iter(|| black_box(encode_frame(message, 32 * 1024 * 1024).unwrap()));
        });

        let frame = encode_frame(&message, 32 * 1024 * 1024).unwrap();
        let body = frame[4..].to_vec();
        group.bench_with_input(BenchmarkId::new("decode", size), &body, |b, body| {
            b.iter(|| black_box(decode_frame(body).unwrap()));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_ledger_writes, bench_ledger_reads, bench_frame_codec);
criterion_main!(benches);
