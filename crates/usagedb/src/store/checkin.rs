//! Hand-off of finished daily snapshots to an external consumer.

use crate::stats::{IntervalStats, IntervalType};
use crate::store::layout::{FileKey, CHECKED_IN_SUFFIX};
use crate::store::UsageStatsDatabase;
use tracing::{debug, error};

/// Consumer of daily snapshots during [`UsageStatsDatabase::checkin_daily`].
///
/// Implemented for any `FnMut(&IntervalStats) -> bool`.
pub trait CheckinAction {
    /// Handles one snapshot. Returning `false` stops the checkin.
    fn checkin(&mut self, stats: &IntervalStats) -> bool;
}

impl<F> CheckinAction for F
where
    F: FnMut(&IntervalStats) -> bool,
{
    fn checkin(&mut self, stats: &IntervalStats) -> bool {
        self(stats)
    }
}

impl UsageStatsDatabase {
    /// Feeds every daily snapshot not yet checked in to `action`, oldest
    /// first, and marks each accepted file as checked in.
    ///
    /// Scanning starts after the newest checked-in file. The newest daily file
    /// is never offered, since it may still be written to. Returns `false` if
    /// a snapshot cannot be read or `action` rejects one; the files accepted
    /// before that stay checked in.
    pub fn checkin_daily<A>(&self, mut action: A) -> bool
    where
        A: CheckinAction,
    {
        let mut state = self.lock_state();
        let daily = state.index.bucket(IntervalType::Daily);

        // The newest file is excluded from both the scan and the checkin.
        let Some((newest, _)) = daily.last() else {
            return true;
        };
        let start = daily
            .iter()
            .filter(|(ts, file)| *ts < newest && FileKey::is_checked_in(file.file_name()))
            .map(|(ts, _)| ts)
            .last();
        let pending: Vec<_> = daily
            .iter()
            .filter(|(ts, _)| *ts < newest && start.map_or(true, |start| *ts > start))
            .map(|(ts, file)| (ts, file.clone()))
            .collect();
        if pending.is_empty() {
            return true;
        }

        let dir = self.layout.interval_dir(IntervalType::Daily);
        for (begin_time, file) in pending {
            let stats = match self.read_file(&file) {
                Ok(stats) => stats,
                Err(err) => {
                    error!("Failed to check in {}: {}", file.path().display(), err);
                    return false;
                }
            };
            if !action.checkin(&stats) {
                debug!("Checkin stopped at daily snapshot {}", begin_time);
                return false;
            }

            let checked_in = dir.join(format!("{}{}", file.file_name(), CHECKED_IN_SUFFIX));
            match file.rename_to(checked_in) {
                Ok(renamed) => state
                    .index
                    .bucket_mut(IntervalType::Daily)
                    .insert(begin_time, renamed),
                Err(err) => {
                    error!(
                        "Failed to mark file {} as checked-in: {:?}",
                        file.path().display(),
                        err
                    );
                    return true;
                }
            }
        }
        true
    }
}
