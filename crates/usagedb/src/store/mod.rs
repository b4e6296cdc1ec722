//! Persistent, bucketed snapshot store.
//!
//! A [`UsageStatsDatabase`] owns one directory tree:
//! - One subdirectory per [`IntervalType`], holding one file per snapshot
//! - A version file recording the schema version and build fingerprint
//! - A breadcrumb present only while an upgrade is in flight
//!
//! Every public operation runs under a single lock, so callers may share the
//! database across threads.

use crate::codec::{codec_for_version, default_codec, StatsCodec, COMPACT_VERSION};
use crate::config::{BuildFingerprint, DatabaseConfig};
use crate::error::{Result, UsageError};
use crate::stats::{IntervalStats, IntervalType, Timestamp};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, error, info, warn};

pub mod atomic;
pub mod backup;
pub mod checkin;
pub mod index;
pub mod layout;
pub mod migration;
pub mod query;
pub mod retention;

use atomic::AtomicFile;
use index::StatsIndex;
use layout::{FileKey, StoreLayout};
use migration::{MigrationEngine, MigrationReport};
use retention::{PruneReport, RetentionManager, SelectionLogRetention};

pub use checkin::CheckinAction;
pub use query::StatCombiner;

/// Persistent store of usage snapshots for one user.
///
/// # Examples
///
/// ```rust,ignore
/// use alopex_usagedb::{IntervalStats, IntervalType, UsageStats, UsageStatsDatabase};
///
/// let db = UsageStatsDatabase::new("/data/usagestats/0", "14;REL;eng.1234");
/// db.init(now)?;
///
/// let mut stats = IntervalStats::new(day_start, day_start + DAY);
/// db.put_usage_stats(IntervalType::Daily, &mut stats)?;
///
/// let packages = db.query_usage_stats(
///     IntervalType::Daily,
///     begin,
///     end,
///     |stats: &IntervalStats, _: bool, out: &mut Vec<UsageStats>| {
///         out.extend(stats.package_stats.values().cloned());
///     },
/// );
/// ```
pub struct UsageStatsDatabase {
    layout: StoreLayout,
    config: DatabaseConfig,
    codec: &'static dyn StatsCodec,
    fingerprint: Box<dyn BuildFingerprint>,
    state: Mutex<DatabaseState>,
}

#[derive(Debug, Default)]
struct DatabaseState {
    index: StatsIndex,
    report: MigrationReport,
}

impl UsageStatsDatabase {
    /// Creates a database rooted at `root` with the default configuration.
    ///
    /// Nothing is touched on disk until [`init`](Self::init).
    pub fn new(root: impl AsRef<Path>, fingerprint: impl BuildFingerprint + 'static) -> Self {
        Self {
            layout: StoreLayout::new(root),
            config: DatabaseConfig::default(),
            codec: default_codec(),
            fingerprint: Box::new(fingerprint),
            state: Mutex::new(DatabaseState::default()),
        }
    }

    /// Creates a database rooted at `root` with an explicit configuration.
    ///
    /// # Errors
    ///
    /// Returns `UsageError::UnsupportedVersion` if no codec exists for
    /// `config.current_version`.
    pub fn with_config(
        root: impl AsRef<Path>,
        config: DatabaseConfig,
        fingerprint: impl BuildFingerprint + 'static,
    ) -> Result<Self> {
        let codec = codec_for_version(config.current_version)?;
        Ok(Self {
            layout: StoreLayout::new(root),
            config,
            codec,
            fingerprint: Box::new(fingerprint),
            state: Mutex::new(DatabaseState::default()),
        })
    }

    /// Returns the on-disk layout.
    pub fn layout(&self) -> &StoreLayout {
        &self.layout
    }

    /// Returns the configuration.
    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    /// Schema version files are written with.
    pub fn current_version(&self) -> u32 {
        self.config.current_version
    }

    fn lock_state(&self) -> MutexGuard<'_, DatabaseState> {
        self.state.lock().unwrap_or_else(|err| err.into_inner())
    }

    /// Opens the store: creates directories, migrates, indexes, and deletes
    /// snapshots that begin at or after `now`.
    ///
    /// # Errors
    ///
    /// Returns `UsageError::DirectoryCreation` if a bucket directory cannot be
    /// created, and `UsageError::Migration` if an interrupted or new upgrade
    /// cannot complete. The store must not be used after a failed init.
    pub fn init(&self, now: Timestamp) -> Result<()> {
        let mut state = self.lock_state();
        self.layout.create_dirs()?;

        let engine = MigrationEngine::new(
            &self.layout,
            self.config.current_version,
            self.config.keep_versioned_backups,
        );
        state.report = engine.run(&self.fingerprint.fingerprint())?;
        state.index.reindex(&self.layout)?;

        for interval in IntervalType::ALL {
            for (begin_time, file) in state.index.bucket_mut(interval).split_off(now) {
                debug!(
                    "Deleting future {} snapshot {} (now {})",
                    interval, begin_time, now
                );
                if let Err(err) = file.delete() {
                    error!("Failed to delete {}: {:?}", file.path().display(), err);
                }
            }
        }
        Ok(())
    }

    /// True if no build fingerprint had ever been recorded before `init`.
    pub fn is_first_update(&self) -> bool {
        self.lock_state().report.first_update
    }

    /// True if the running build differs from the one that last opened the store.
    pub fn is_new_update(&self) -> bool {
        self.lock_state().report.new_update
    }

    /// Details of the version check performed by the last `init`.
    pub fn migration_report(&self) -> MigrationReport {
        self.lock_state().report
    }

    /// Writes `stats` to its bucket, replacing any snapshot with the same
    /// begin time, and updates `stats.last_time_saved`.
    ///
    /// # Errors
    ///
    /// Returns `UsageError::NegativeBeginTime` for snapshots starting before
    /// the epoch; nothing is written.
    pub fn put_usage_stats(&self, interval: IntervalType, stats: &mut IntervalStats) -> Result<()> {
        let mut state = self.lock_state();
        self.put_locked(&mut state, interval, stats)
    }

    fn put_locked(
        &self,
        state: &mut DatabaseState,
        interval: IntervalType,
        stats: &mut IntervalStats,
    ) -> Result<()> {
        // File names carry the begin time as unsigned digits.
        if stats.begin_time < 0 {
            return Err(UsageError::NegativeBeginTime(stats.begin_time));
        }
        let bucket = state.index.bucket_mut(interval);
        let file = match bucket.get(stats.begin_time) {
            Some(file) => file.clone(),
            None => {
                let file = AtomicFile::new(self.layout.stats_path(interval, stats.begin_time));
                bucket.insert(stats.begin_time, file.clone());
                file
            }
        };
        write_snapshot(&file, self.codec, stats)
    }

    /// Returns the snapshot with the greatest begin time, if any can be read.
    pub fn latest_usage_stats(&self, interval: IntervalType) -> Option<IntervalStats> {
        let state = self.lock_state();
        self.latest_locked(&state, interval)
    }

    fn latest_locked(&self, state: &DatabaseState, interval: IntervalType) -> Option<IntervalStats> {
        let (_, file) = state.index.bucket(interval).last()?;
        match self.read_file(file) {
            Ok(stats) => Some(stats),
            Err(err) => {
                error!("Failed to read usage stats file {}: {}", file.path().display(), err);
                None
            }
        }
    }

    /// Deletes expired snapshots and scrubs old chooser counts.
    ///
    /// Windows: yearly 3 years, monthly 6 months, weekly 4 weeks, daily 10
    /// days; chooser counts per [`DatabaseConfig::selection_log_retention`].
    pub fn prune(&self, now: Timestamp) -> Result<PruneReport> {
        let mut state = self.lock_state();
        self.prune_locked(&mut state, now)
    }

    fn prune_locked(&self, state: &mut DatabaseState, now: Timestamp) -> Result<PruneReport> {
        let manager = RetentionManager::new(
            &self.layout,
            self.codec,
            self.config.current_version,
            SelectionLogRetention::new(self.config.selection_log_retention),
        );
        let report = manager.run(now);
        state.index.reindex(&self.layout)?;
        report
    }

    /// Shifts every snapshot by `delta` milliseconds after a wall-clock change.
    ///
    /// Snapshots whose shifted begin time would be negative are deleted. The
    /// checked-in marker survives the rename.
    pub fn on_time_changed(&self, delta: i64) -> Result<()> {
        let mut state = self.lock_state();
        let mut moved = 0usize;
        let mut deleted = 0usize;

        for interval in IntervalType::ALL {
            let dir = self.layout.interval_dir(interval);
            let mut files: Vec<(Timestamp, AtomicFile)> = state
                .index
                .bucket(interval)
                .iter()
                .map(|(ts, file)| (ts, file.clone()))
                .collect();
            // Move in the direction of the shift so no rename lands on a file
            // that has not moved yet.
            if delta > 0 {
                files.reverse();
            }

            for (begin_time, file) in files {
                let new_time = begin_time.saturating_add(delta);
                if new_time < 0 {
                    match file.delete() {
                        Ok(()) => deleted += 1,
                        Err(err) => error!("Failed to delete {}: {:?}", file.path().display(), err),
                    }
                    continue;
                }
                let new_name = FileKey::shifted_name(file.file_name(), new_time);
                match file.rename_to(dir.join(new_name)) {
                    Ok(_) => moved += 1,
                    Err(err) => error!("Failed to move {}: {:?}", file.path().display(), err),
                }
            }
        }

        info!(
            "Time changed by {} ms: moved {} files, deleted {} files",
            delta, moved, deleted
        );
        state.index.reindex(&self.layout)
    }

    /// Decodes an indexed file with the current codec.
    fn read_file(&self, file: &AtomicFile) -> Result<IntervalStats> {
        read_snapshot(file, self.codec, self.config.current_version)
    }
}

/// Reads one snapshot file.
///
/// The begin time comes from the file name and `last_time_saved` from its
/// modification time. Files at the compact version or newer are checked
/// against the snapshot invariants; violations are logged, not fatal.
pub(crate) fn read_snapshot(
    file: &AtomicFile,
    codec: &dyn StatsCodec,
    version: u32,
) -> Result<IntervalStats> {
    let begin_time = FileKey::parse_begin_time(file.file_name())?;
    let bytes = file.read()?;
    let mut stats = codec.decode(&bytes, begin_time)?;
    stats.begin_time = begin_time;
    stats.last_time_saved = file.last_modified_time()?;

    if version >= COMPACT_VERSION {
        for problem in stats.validate() {
            warn!("{}: {}", file.path().display(), problem);
        }
    }
    Ok(stats)
}

/// Writes one snapshot file and refreshes `stats.last_time_saved`.
pub(crate) fn write_snapshot(
    file: &AtomicFile,
    codec: &dyn StatsCodec,
    stats: &mut IntervalStats,
) -> Result<()> {
    let bytes = codec.encode(stats)?;
    file.write(&bytes)?;
    stats.last_time_saved = file.last_modified_time()?;
    Ok(())
}

pub(crate) fn current_time_millis() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|since| since.as_millis() as i64)
        .unwrap_or(0)
}
