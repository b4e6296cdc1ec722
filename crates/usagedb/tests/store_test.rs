//! Integration tests for the snapshot store lifecycle.
//!
//! These tests exercise the public database API end to end:
//! - init, put, latest and range queries
//! - bucket selection
//! - wall-clock shifts and future-file cleanup
//! - daily checkin
//! - shared use across threads

use alopex_usagedb::{IntervalStats, IntervalType, UsageStats, UsageStatsDatabase};
use std::fs;
use std::sync::Arc;
use std::thread;
use tempfile::TempDir;

const DAY: i64 = 86_400_000;
const NOW: i64 = 1_700_000_000_000;

fn open(dir: &TempDir) -> UsageStatsDatabase {
    let db = UsageStatsDatabase::new(dir.path(), "14;REL;1");
    db.init(NOW).unwrap();
    db
}

fn put(db: &UsageStatsDatabase, interval: IntervalType, begin: i64, end: i64) {
    let mut stats = IntervalStats::new(begin, end);
    stats.package_mut("com.example").launch_count = 1;
    db.put_usage_stats(interval, &mut stats).unwrap();
}

fn begin_times(db: &UsageStatsDatabase, interval: IntervalType, begin: i64, end: i64) -> Option<Vec<i64>> {
    db.query_usage_stats(
        interval,
        begin,
        end,
        |stats: &IntervalStats, mutable: bool, out: &mut Vec<i64>| {
            assert!(!mutable);
            out.push(stats.begin_time);
        },
    )
}

fn file_names(db: &UsageStatsDatabase, interval: IntervalType) -> Vec<String> {
    db.layout()
        .list_stats_files(interval)
        .unwrap()
        .iter()
        .map(|p| p.file_name().unwrap().to_str().unwrap().to_string())
        .collect()
}

#[test]
fn test_put_then_latest_roundtrip() {
    let temp_dir = TempDir::new().unwrap();
    let db = open(&temp_dir);

    let mut stats = IntervalStats::new(NOW - DAY, NOW);
    let pkg = stats.package_mut("com.example.mail");
    pkg.launch_count = 7;
    pkg.total_time_in_foreground = 60_000;
    db.put_usage_stats(IntervalType::Weekly, &mut stats).unwrap();

    let latest = db.latest_usage_stats(IntervalType::Weekly).unwrap();
    assert_eq!(latest.package_stats, stats.package_stats);
    assert_eq!(latest.last_time_saved, stats.last_time_saved);
    assert!(db.latest_usage_stats(IntervalType::Daily).is_none());
}

#[test]
fn test_query_is_half_open() {
    let temp_dir = TempDir::new().unwrap();
    let db = open(&temp_dir);
    put(&db, IntervalType::Daily, 0, 10);
    put(&db, IntervalType::Daily, 10, 20);
    put(&db, IntervalType::Daily, 20, 30);

    assert_eq!(begin_times(&db, IntervalType::Daily, 5, 20), Some(vec![0, 10]));
    assert_eq!(begin_times(&db, IntervalType::Daily, 10, 11), Some(vec![10]));
    assert_eq!(begin_times(&db, IntervalType::Daily, 25, 100), Some(vec![20]));
    assert_eq!(begin_times(&db, IntervalType::Daily, 20, 20), None);
    assert_eq!(begin_times(&db, IntervalType::Daily, 30, 10), None);
}

#[test]
fn test_query_skips_snapshots_ending_before_begin() {
    let temp_dir = TempDir::new().unwrap();
    let db = open(&temp_dir);
    // A short snapshot that ends well before the next one begins.
    put(&db, IntervalType::Daily, 0, 5);
    put(&db, IntervalType::Daily, 10, 20);

    assert_eq!(begin_times(&db, IntervalType::Daily, 7, 15), Some(vec![10]));
    assert_eq!(begin_times(&db, IntervalType::Daily, 6, 8), Some(vec![]));
}

#[test]
fn test_query_skips_unreadable_snapshots() {
    let temp_dir = TempDir::new().unwrap();
    let db = open(&temp_dir);
    put(&db, IntervalType::Daily, 0, 10);
    put(&db, IntervalType::Daily, 20, 30);
    fs::write(db.layout().stats_path(IntervalType::Daily, 10), b"corrupt").unwrap();
    db.init(NOW).unwrap();

    assert_eq!(begin_times(&db, IntervalType::Daily, 0, 30), Some(vec![0, 20]));
}

#[test]
fn test_query_collects_packages() {
    let temp_dir = TempDir::new().unwrap();
    let db = open(&temp_dir);
    put(&db, IntervalType::Monthly, 0, 100);

    let packages = db
        .query_usage_stats(
            IntervalType::Monthly,
            0,
            50,
            |stats: &IntervalStats, _: bool, out: &mut Vec<UsageStats>| {
                out.extend(stats.package_stats.values().cloned());
            },
        )
        .unwrap();
    assert_eq!(packages.len(), 1);
    assert_eq!(packages[0].package_name, "com.example");
}

#[test]
fn test_find_best_fit_bucket() {
    let temp_dir = TempDir::new().unwrap();
    let db = open(&temp_dir);
    assert_eq!(db.find_best_fit_bucket(NOW - DAY, NOW), None);

    put(&db, IntervalType::Yearly, NOW - 300 * DAY, NOW);
    put(&db, IntervalType::Weekly, NOW - 3 * DAY, NOW);
    put(&db, IntervalType::Daily, NOW - DAY, NOW);

    assert_eq!(
        db.find_best_fit_bucket(NOW - DAY, NOW),
        Some(IntervalType::Daily)
    );
    assert_eq!(
        db.find_best_fit_bucket(NOW - 2 * DAY, NOW),
        Some(IntervalType::Weekly)
    );
    assert_eq!(
        db.find_best_fit_bucket(NOW - 100 * DAY, NOW),
        Some(IntervalType::Yearly)
    );
}

#[test]
fn test_init_deletes_future_snapshots() {
    let temp_dir = TempDir::new().unwrap();
    let db = open(&temp_dir);
    put(&db, IntervalType::Daily, NOW - DAY, NOW);
    put(&db, IntervalType::Daily, NOW, NOW + DAY);
    put(&db, IntervalType::Yearly, NOW + 5 * DAY, NOW + 6 * DAY);

    let reopened = open(&temp_dir);
    assert_eq!(
        file_names(&reopened, IntervalType::Daily),
        vec![(NOW - DAY).to_string()]
    );
    assert!(file_names(&reopened, IntervalType::Yearly).is_empty());
    assert!(!reopened.is_new_update());
    assert!(!reopened.is_first_update());
}

#[test]
fn test_time_change_shifts_and_deletes() {
    let temp_dir = TempDir::new().unwrap();
    let db = open(&temp_dir);
    put(&db, IntervalType::Daily, 100, 200);
    put(&db, IntervalType::Daily, 200, 300);
    put(&db, IntervalType::Daily, 5_000, 6_000);
    assert!(db.checkin_daily(|_: &IntervalStats| true));
    assert_eq!(
        file_names(&db, IntervalType::Daily),
        vec!["100.cp", "200.cp", "5000"]
    );

    db.on_time_changed(-150).unwrap();
    assert_eq!(
        file_names(&db, IntervalType::Daily),
        vec!["4850", "50.cp"]
    );
    assert_eq!(begin_times(&db, IntervalType::Daily, 0, 10_000), Some(vec![50, 4850]));
}

#[test]
fn test_forward_time_change_does_not_clobber() {
    let temp_dir = TempDir::new().unwrap();
    let db = open(&temp_dir);
    put(&db, IntervalType::Weekly, 100, 200);
    put(&db, IntervalType::Weekly, 200, 300);

    db.on_time_changed(100).unwrap();
    assert_eq!(file_names(&db, IntervalType::Weekly), vec!["200", "300"]);
    let latest = db.latest_usage_stats(IntervalType::Weekly).unwrap();
    assert_eq!(latest.begin_time, 300);
}

#[test]
fn test_checkin_is_monotonic() {
    let temp_dir = TempDir::new().unwrap();
    let db = open(&temp_dir);
    for day in 0..4 {
        put(&db, IntervalType::Daily, day * DAY, (day + 1) * DAY);
    }

    let mut handed_off = Vec::new();
    assert!(db.checkin_daily(|stats: &IntervalStats| {
        handed_off.push(stats.begin_time);
        true
    }));
    put(&db, IntervalType::Daily, 4 * DAY, 5 * DAY);
    assert!(db.checkin_daily(|stats: &IntervalStats| {
        handed_off.push(stats.begin_time);
        true
    }));

    // Every finished day exactly once, the newest never.
    assert_eq!(handed_off, vec![0, DAY, 2 * DAY, 3 * DAY]);
}

#[test]
fn test_concurrent_access() {
    let temp_dir = TempDir::new().unwrap();
    let db = Arc::new(open(&temp_dir));

    let handles: Vec<_> = (0..4)
        .map(|worker| {
            let db = Arc::clone(&db);
            thread::spawn(move || {
                for i in 0..10 {
                    let begin = (worker * 10 + i) * 1_000;
                    put(&db, IntervalType::Daily, begin, begin + 1_000);
                    db.latest_usage_stats(IntervalType::Daily);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let all = begin_times(&db, IntervalType::Daily, 0, i64::MAX).unwrap();
    assert_eq!(all.len(), 40);
    assert!(all.windows(2).all(|pair| pair[0] < pair[1]));
}
