//! Retention policies and the pruning pass.

use crate::codec::StatsCodec;
use crate::error::Result;
use crate::stats::{IntervalType, Timestamp};
use crate::store::atomic::AtomicFile;
use crate::store::layout::{FileKey, StoreLayout};
use crate::store::{read_snapshot, write_snapshot};
use std::time::Duration;
use tracing::{debug, error};

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Retention policy deciding when a snapshot has expired.
pub trait RetentionPolicy: Send + Sync {
    /// Returns the retention duration.
    fn retention_duration(&self) -> Duration;

    /// Oldest begin time that is still retained at `now`.
    fn cutoff(&self, now: Timestamp) -> Timestamp {
        let retention_millis =
            i64::try_from(self.retention_duration().as_millis()).unwrap_or(i64::MAX);
        now.saturating_sub(retention_millis)
    }

    /// Returns true if a snapshot beginning at `begin_time` is expired at `now`.
    fn is_expired(&self, begin_time: Timestamp, now: Timestamp) -> bool {
        begin_time < self.cutoff(now)
    }
}

/// How long whole snapshots of one bucket are kept.
///
/// Calendar units have fixed lengths: a year is 365 days and a month 30.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntervalRetention {
    interval: IntervalType,
    retention: Duration,
}

impl IntervalRetention {
    /// Default window for `interval`: yearly 3 years, monthly 6 months,
    /// weekly 4 weeks, daily 10 days.
    pub fn for_interval(interval: IntervalType) -> Self {
        let days = match interval {
            IntervalType::Yearly => 3 * 365,
            IntervalType::Monthly => 6 * 30,
            IntervalType::Weekly => 4 * 7,
            IntervalType::Daily => 10,
        };
        Self {
            interval,
            retention: DAY * days,
        }
    }

    /// Bucket the policy applies to.
    pub fn interval(&self) -> IntervalType {
        self.interval
    }
}

impl RetentionPolicy for IntervalRetention {
    fn retention_duration(&self) -> Duration {
        self.retention
    }
}

/// How long chooser counts are kept inside retained snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectionLogRetention {
    retention: Duration,
}

impl SelectionLogRetention {
    /// Creates a policy with a custom duration.
    pub fn new(retention: Duration) -> Self {
        Self { retention }
    }
}

impl Default for SelectionLogRetention {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_SELECTION_LOG_RETENTION)
    }
}

impl RetentionPolicy for SelectionLogRetention {
    fn retention_duration(&self) -> Duration {
        self.retention
    }
}

/// Outcome of one pruning pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruneReport {
    /// Snapshot files deleted.
    pub deleted: usize,
    /// Snapshot files rewritten without chooser counts.
    pub scrubbed: usize,
}

/// Applies the retention policies to the files on disk.
///
/// The caller re-indexes afterwards.
pub struct RetentionManager<'a> {
    layout: &'a StoreLayout,
    codec: &'static dyn StatsCodec,
    version: u32,
    selection_log: SelectionLogRetention,
}

impl<'a> RetentionManager<'a> {
    /// Creates a manager reading and writing snapshots with `codec`.
    pub fn new(
        layout: &'a StoreLayout,
        codec: &'static dyn StatsCodec,
        version: u32,
        selection_log: SelectionLogRetention,
    ) -> Self {
        Self {
            layout,
            codec,
            version,
            selection_log,
        }
    }

    /// Deletes expired snapshots, then scrubs chooser counts from old ones.
    ///
    /// Individual failures are logged and skipped.
    pub fn run(&self, now: Timestamp) -> Result<PruneReport> {
        let mut report = PruneReport::default();

        for interval in IntervalType::ALL.iter().rev().copied() {
            let policy = IntervalRetention::for_interval(interval);
            report.deleted += self.prune_files(interval, &policy, now)?;
        }

        for interval in IntervalType::ALL {
            report.scrubbed += self.prune_chooser_counts(interval, now)?;
        }

        debug!(
            "Pruned {} files and scrubbed {} files at {}",
            report.deleted, report.scrubbed, now
        );
        Ok(report)
    }

    fn prune_files(
        &self,
        interval: IntervalType,
        policy: &dyn RetentionPolicy,
        now: Timestamp,
    ) -> Result<usize> {
        let mut deleted = 0;
        for path in self.layout.list_files(interval, |_| true)? {
            // Names that do not parse are treated as begin time 0.
            let begin_time = FileKey::parse_path(&path).unwrap_or(0);
            if !policy.is_expired(begin_time, now) {
                continue;
            }
            match AtomicFile::new(&path).delete() {
                Ok(()) => deleted += 1,
                Err(err) => error!("Failed to delete {}: {:?}", path.display(), err),
            }
        }
        Ok(deleted)
    }

    fn prune_chooser_counts(&self, interval: IntervalType, now: Timestamp) -> Result<usize> {
        let mut scrubbed = 0;
        for path in self.layout.list_stats_files(interval)? {
            let begin_time = FileKey::parse_path(&path).unwrap_or(0);
            if !self.selection_log.is_expired(begin_time, now) {
                continue;
            }

            let file = AtomicFile::new(&path);
            let scrub = || -> Result<bool> {
                let mut stats = read_snapshot(&file, self.codec, self.version)?;
                let has_counts = stats
                    .package_stats
                    .values()
                    .any(|pkg| !pkg.chooser_counts.is_empty());
                if !has_counts {
                    return Ok(false);
                }
                stats.clear_chooser_counts();
                write_snapshot(&file, self.codec, &mut stats)?;
                Ok(true)
            };
            match scrub() {
                Ok(true) => scrubbed += 1,
                Ok(false) => {}
                Err(err) => error!(
                    "Failed to delete chooser counts from usage stats file {}: {}",
                    path.display(),
                    err
                ),
            }
        }
        Ok(scrubbed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::default_codec;
    use crate::codec::DEFAULT_CURRENT_VERSION;
    use crate::stats::IntervalStats;
    use std::fs;
    use tempfile::TempDir;

    const DAY_MS: i64 = 86_400_000;

    #[derive(Debug, Clone)]
    struct FixedPolicy(Duration);

    impl RetentionPolicy for FixedPolicy {
        fn retention_duration(&self) -> Duration {
            self.0
        }
    }

    fn put(layout: &StoreLayout, interval: IntervalType, stats: &mut IntervalStats) {
        let file = AtomicFile::new(layout.stats_path(interval, stats.begin_time));
        write_snapshot(&file, default_codec(), stats).unwrap();
    }

    #[test]
    fn test_policy_expiry_boundaries() {
        let policy = FixedPolicy(Duration::from_secs(10));
        assert_eq!(policy.cutoff(20_000), 10_000);
        assert!(!policy.is_expired(10_000, 20_000));
        assert!(policy.is_expired(9_999, 20_000));
        assert_eq!(policy.cutoff(i64::MIN), i64::MIN);
    }

    #[test]
    fn test_interval_windows() {
        let days = |interval| {
            IntervalRetention::for_interval(interval)
                .retention_duration()
                .as_secs()
                / 86_400
        };
        assert_eq!(days(IntervalType::Yearly), 1095);
        assert_eq!(days(IntervalType::Monthly), 180);
        assert_eq!(days(IntervalType::Weekly), 28);
        assert_eq!(days(IntervalType::Daily), 10);
        assert_eq!(
            SelectionLogRetention::default().retention_duration(),
            Duration::from_secs(14 * 86_400)
        );
    }

    #[test]
    fn test_prune_deletes_expired_and_malformed() {
        let temp_dir = TempDir::new().unwrap();
        let layout = StoreLayout::new(temp_dir.path());
        layout.create_dirs().unwrap();

        let now = 100 * DAY_MS;
        put(&layout, IntervalType::Daily, &mut IntervalStats::new(now - 11 * DAY_MS, now));
        put(&layout, IntervalType::Daily, &mut IntervalStats::new(now - 10 * DAY_MS, now));
        put(&layout, IntervalType::Weekly, &mut IntervalStats::new(now - 20 * DAY_MS, now));
        fs::write(layout.interval_dir(IntervalType::Daily).join("junk"), b"").unwrap();

        let manager = RetentionManager::new(
            &layout,
            default_codec(),
            DEFAULT_CURRENT_VERSION,
            SelectionLogRetention::default(),
        );
        let report = manager.run(now).unwrap();
        assert_eq!(report.deleted, 2);

        let daily = layout.list_stats_files(IntervalType::Daily).unwrap();
        assert_eq!(daily.len(), 1);
        assert_eq!(FileKey::parse_path(&daily[0]).unwrap(), now - 10 * DAY_MS);
        assert_eq!(layout.list_stats_files(IntervalType::Weekly).unwrap().len(), 1);
    }

    #[test]
    fn test_prune_scrubs_old_chooser_counts() {
        let temp_dir = TempDir::new().unwrap();
        let layout = StoreLayout::new(temp_dir.path());
        layout.create_dirs().unwrap();

        let now = 400 * DAY_MS;
        let mut old = IntervalStats::new(now - 20 * DAY_MS, now - 19 * DAY_MS);
        old.package_mut("com.example")
            .chooser_counts
            .entry("android.intent.action.SEND".to_string())
            .or_default()
            .insert("text/plain".to_string(), 3);
        old.package_mut("com.example").launch_count = 4;
        let mut recent = old.clone();
        recent.begin_time = now - DAY_MS;
        put(&layout, IntervalType::Monthly, &mut old);
        put(&layout, IntervalType::Monthly, &mut recent);

        let manager = RetentionManager::new(
            &layout,
            default_codec(),
            DEFAULT_CURRENT_VERSION,
            SelectionLogRetention::default(),
        );
        let report = manager.run(now).unwrap();
        assert_eq!(report.scrubbed, 1);

        let read = |begin| {
            let file = AtomicFile::new(layout.stats_path(IntervalType::Monthly, begin));
            read_snapshot(&file, default_codec(), DEFAULT_CURRENT_VERSION).unwrap()
        };
        let old = read(now - 20 * DAY_MS);
        assert!(old.package_stats["com.example"].chooser_counts.is_empty());
        assert_eq!(old.package_stats["com.example"].launch_count, 4);
        let recent = read(now - DAY_MS);
        assert!(!recent.package_stats["com.example"].chooser_counts.is_empty());
    }
}
