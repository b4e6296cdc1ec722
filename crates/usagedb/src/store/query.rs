//! Range queries over a bucket and bucket selection.

use crate::stats::{IntervalStats, IntervalType, Timestamp};
use crate::store::atomic::AtomicFile;
use crate::store::index::{IntervalIndex, StatsIndex};
use crate::store::UsageStatsDatabase;
use tracing::error;

/// Folds a snapshot into query results.
///
/// Implemented for any `FnMut(&IntervalStats, bool, &mut Vec<T>)`. The flag
/// tells whether the snapshot may be modified in place; it is always `false`
/// for snapshots read from disk.
pub trait StatCombiner<T> {
    /// Appends whatever the caller wants from `stats` to `out`.
    fn combine(&mut self, stats: &IntervalStats, mutable: bool, out: &mut Vec<T>);
}

impl<T, F> StatCombiner<T> for F
where
    F: FnMut(&IntervalStats, bool, &mut Vec<T>),
{
    fn combine(&mut self, stats: &IntervalStats, mutable: bool, out: &mut Vec<T>) {
        self(stats, mutable, out)
    }
}

/// Files a query over `[begin, end)` has to visit, in begin-time order.
///
/// Starts at the snapshot covering `begin` (or the first one) and stops at
/// the last snapshot starting strictly before `end`. `None` when the range is
/// empty or every snapshot starts at or after `end`.
pub(crate) fn select_files(
    index: &IntervalIndex,
    begin: Timestamp,
    end: Timestamp,
) -> Option<Vec<&AtomicFile>> {
    if end <= begin {
        return None;
    }
    let (last_key, _) = index.lower(end)?;
    let first_key = index
        .floor(begin)
        .or_else(|| index.first())
        .map(|(ts, _)| ts)?;
    Some(
        index
            .range_inclusive(first_key, last_key)
            .map(|(_, file)| file)
            .collect(),
    )
}

/// Bucket whose snapshot on or before `begin` starts closest to `begin`.
///
/// Buckets are scanned from yearly down to daily and a later bucket only
/// wins on a strictly smaller distance.
pub(crate) fn best_fit_bucket(index: &StatsIndex, begin: Timestamp) -> Option<IntervalType> {
    let mut best: Option<(IntervalType, u64)> = None;
    for interval in IntervalType::ALL.iter().rev().copied() {
        if let Some((key, _)) = index.bucket(interval).floor(begin) {
            let diff = key.abs_diff(begin);
            if best.map_or(true, |(_, smallest)| diff < smallest) {
                best = Some((interval, diff));
            }
        }
    }
    best.map(|(interval, _)| interval)
}

impl UsageStatsDatabase {
    /// Folds every snapshot of `interval` overlapping `[begin, end)` through
    /// `combiner`.
    ///
    /// Returns `None` if `end <= begin` or no snapshot starts before `end`.
    /// Snapshots that cannot be read are logged and skipped, as are snapshots
    /// that end at or before `begin`.
    pub fn query_usage_stats<T, C>(
        &self,
        interval: IntervalType,
        begin: Timestamp,
        end: Timestamp,
        mut combiner: C,
    ) -> Option<Vec<T>>
    where
        C: StatCombiner<T>,
    {
        let state = self.lock_state();
        let files = select_files(state.index.bucket(interval), begin, end)?;

        let mut results = Vec::new();
        for file in files {
            let stats = match self.read_file(file) {
                Ok(stats) => stats,
                Err(err) => {
                    error!(
                        "Failed to read usage stats file {}: {}",
                        file.path().display(),
                        err
                    );
                    continue;
                }
            };
            if begin < stats.end_time {
                combiner.combine(&stats, false, &mut results);
            }
        }
        Some(results)
    }

    /// Picks the bucket best suited to a query starting at `begin`.
    ///
    /// `end` does not influence the choice.
    pub fn find_best_fit_bucket(&self, begin: Timestamp, _end: Timestamp) -> Option<IntervalType> {
        let state = self.lock_state();
        best_fit_bucket(&state.index, begin)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index_of(times: &[Timestamp]) -> IntervalIndex {
        let mut index = IntervalIndex::new();
        for &ts in times {
            index.insert(ts, AtomicFile::new(ts.to_string()));
        }
        index
    }

    fn selected(index: &IntervalIndex, begin: Timestamp, end: Timestamp) -> Option<Vec<String>> {
        select_files(index, begin, end)
            .map(|files| files.iter().map(|f| f.file_name().to_string()).collect())
    }

    #[test]
    fn test_select_half_open_range() {
        let index = index_of(&[0, 10, 20]);
        assert_eq!(selected(&index, 5, 20), Some(vec!["0".to_string(), "10".to_string()]));
        assert_eq!(selected(&index, 10, 21), Some(vec!["10".to_string(), "20".to_string()]));
        assert_eq!(selected(&index, 0, 10), Some(vec!["0".to_string()]));
    }

    #[test]
    fn test_select_empty_cases() {
        let index = index_of(&[10, 20]);
        assert_eq!(selected(&index, 5, 5), None);
        assert_eq!(selected(&index, 6, 5), None);
        assert_eq!(selected(&index, 0, 10), None);
        assert_eq!(selected(&IntervalIndex::new(), 0, 100), None);
        // No snapshot covers `begin`, so the scan starts at the first one.
        assert_eq!(selected(&index, 0, 15), Some(vec!["10".to_string()]));
    }

    #[test]
    fn test_best_fit_prefers_closest_floor() {
        let mut index = StatsIndex::new();
        for (interval, times) in [
            (IntervalType::Yearly, vec![0]),
            (IntervalType::Monthly, vec![0, 900]),
            (IntervalType::Weekly, vec![900]),
            (IntervalType::Daily, vec![990, 2000]),
        ] {
            *index.bucket_mut(interval) = index_of(&times);
        }
        assert_eq!(best_fit_bucket(&index, 1000), Some(IntervalType::Daily));
        assert_eq!(best_fit_bucket(&index, 950), Some(IntervalType::Monthly));
        assert_eq!(best_fit_bucket(&index, 100), Some(IntervalType::Yearly));
        assert_eq!(best_fit_bucket(&StatsIndex::new(), 100), None);
    }
}
