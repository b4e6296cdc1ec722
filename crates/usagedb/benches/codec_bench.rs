//! Benchmarks for UsageDB codecs and store operations.
//!
//! Run with: cargo bench --package alopex-usagedb
//!
//! ## Benchmark Categories
//!
//! - **Codecs**: Encode/decode of the legacy and compact formats
//! - **Store**: Put, range query and backup export

use alopex_usagedb::codec::{CompactCodec, LegacyCodec, StatsCodec};
use alopex_usagedb::{
    event_type, Event, IntervalStats, IntervalType, UsageStatsDatabase, KEY_USAGE_STATS,
};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tempfile::TempDir;

const DAY: i64 = 86_400_000;
const NOW: i64 = 1_700_000_000_000;

/// Generate a typical daily snapshot (a few dozen packages, one event each).
fn generate_snapshot(begin: i64, packages: usize) -> IntervalStats {
    let mut stats = IntervalStats::new(begin, begin + DAY);
    let mut events = Vec::with_capacity(packages);
    for i in 0..packages {
        let name = format!("com.example.app{}", i);
        let pkg = stats.package_mut(&name);
        pkg.last_time_used = begin + (i as i64) * 60_000;
        pkg.total_time_in_foreground = (i as i64) * 1_000;
        pkg.launch_count = i as u32;
        pkg.last_event = event_type::MOVE_TO_BACKGROUND;

        let mut event = Event::new(name, begin + (i as i64) * 1_000, event_type::MOVE_TO_FOREGROUND);
        event.class_name = Some("MainActivity".to_string());
        events.push(event);
    }
    stats.events = Some(events);
    stats
}

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode");
    let codecs: [&dyn StatsCodec; 2] = [&LegacyCodec, &CompactCodec];

    for size in [10usize, 100, 1000].iter() {
        let stats = generate_snapshot(NOW, *size);
        group.throughput(Throughput::Elements(*size as u64));
        for codec in codecs {
            group.bench_with_input(BenchmarkId::new(codec.name(), size), &stats, |b, stats| {
                b.iter(|| codec.encode(black_box(stats)).unwrap())
            });
        }
    }

    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode");
    let codecs: [&dyn StatsCodec; 2] = [&LegacyCodec, &CompactCodec];

    for size in [10usize, 100, 1000].iter() {
        let stats = generate_snapshot(NOW, *size);
        group.throughput(Throughput::Elements(*size as u64));
        for codec in codecs {
            let bytes = codec.encode(&stats).unwrap();
            group.bench_with_input(BenchmarkId::new(codec.name(), size), &bytes, |b, bytes| {
                b.iter(|| codec.decode(black_box(bytes), NOW).unwrap())
            });
        }
    }

    group.finish();
}

fn bench_compact_size(c: &mut Criterion) {
    let stats = generate_snapshot(NOW, 100);
    let legacy = LegacyCodec.encode(&stats).unwrap();
    let compact = CompactCodec.encode(&stats).unwrap();
    println!(
        "100-package snapshot: legacy {} bytes, compact {} bytes ({:.1}x)",
        legacy.len(),
        compact.len(),
        legacy.len() as f64 / compact.len() as f64
    );

    c.bench_function("compact_roundtrip_100", |b| {
        b.iter(|| {
            let bytes = CompactCodec.encode(black_box(&stats)).unwrap();
            CompactCodec.decode(&bytes, NOW).unwrap()
        })
    });
}

fn open_with_days(days: i64) -> (TempDir, UsageStatsDatabase) {
    let temp_dir = TempDir::new().unwrap();
    let db = UsageStatsDatabase::new(temp_dir.path(), "bench");
    db.init(NOW).unwrap();
    for day in 0..days {
        let mut stats = generate_snapshot(NOW - (day + 1) * DAY, 20);
        db.put_usage_stats(IntervalType::Daily, &mut stats).unwrap();
    }
    (temp_dir, db)
}

fn bench_put(c: &mut Criterion) {
    let (_temp_dir, db) = open_with_days(0);
    let mut stats = generate_snapshot(NOW - DAY, 50);

    c.bench_function("put_usage_stats_50_packages", |b| {
        b.iter(|| db.put_usage_stats(IntervalType::Daily, &mut stats).unwrap())
    });
}

fn bench_query(c: &mut Criterion) {
    let mut group = c.benchmark_group("query_usage_stats");
    let (_temp_dir, db) = open_with_days(10);

    for days in [1i64, 5, 10].iter() {
        group.throughput(Throughput::Elements(*days as u64));
        group.bench_with_input(BenchmarkId::from_parameter(days), days, |b, &days| {
            b.iter(|| {
                db.query_usage_stats(
                    IntervalType::Daily,
                    NOW - days * DAY,
                    NOW,
                    |stats: &IntervalStats, _: bool, out: &mut Vec<usize>| {
                        out.push(stats.package_stats.len())
                    },
                )
            })
        });
    }

    group.finish();
}

fn bench_backup_payload(c: &mut Criterion) {
    let (_temp_dir, db) = open_with_days(10);

    c.bench_function("backup_payload_10_days", |b| {
        b.iter(|| db.backup_payload_at(KEY_USAGE_STATS, NOW).unwrap())
    });
}

criterion_group!(
    benches,
    // Codecs
    bench_encode,
    bench_decode,
    bench_compact_size,
    // Store
    bench_put,
    bench_query,
    bench_backup_payload,
);
criterion_main!(benches);
