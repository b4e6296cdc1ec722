//! Time-ordered index of the snapshot files in each bucket.

use crate::error::Result;
use crate::stats::{IntervalType, Timestamp};
use crate::store::atomic::AtomicFile;
use crate::store::layout::{FileKey, StoreLayout};
use std::collections::BTreeMap;
use std::ops::Bound;
use tracing::{debug, error};

/// Sorted `begin_time -> file` map for one bucket.
#[derive(Debug, Clone, Default)]
pub struct IntervalIndex {
    files: BTreeMap<Timestamp, AtomicFile>,
}

impl IntervalIndex {
    /// Creates an empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of indexed files.
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// Returns true if nothing is indexed.
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Returns the file starting exactly at `begin_time`.
    pub fn get(&self, begin_time: Timestamp) -> Option<&AtomicFile> {
        self.files.get(&begin_time)
    }

    /// Adds or replaces the file starting at `begin_time`.
    pub fn insert(&mut self, begin_time: Timestamp, file: AtomicFile) {
        self.files.insert(begin_time, file);
    }

    /// Drops every entry.
    pub fn clear(&mut self) {
        self.files.clear();
    }

    /// Closest entry starting on or before `time`.
    pub fn floor(&self, time: Timestamp) -> Option<(Timestamp, &AtomicFile)> {
        self.files
            .range(..=time)
            .next_back()
            .map(|(ts, file)| (*ts, file))
    }

    /// Closest entry starting on or after `time`.
    pub fn ceil(&self, time: Timestamp) -> Option<(Timestamp, &AtomicFile)> {
        self.files.range(time..).next().map(|(ts, file)| (*ts, file))
    }

    /// Closest entry starting strictly before `time`.
    pub fn lower(&self, time: Timestamp) -> Option<(Timestamp, &AtomicFile)> {
        self.files
            .range(..time)
            .next_back()
            .map(|(ts, file)| (*ts, file))
    }

    /// Entry with the earliest begin time.
    pub fn first(&self) -> Option<(Timestamp, &AtomicFile)> {
        self.files.iter().next().map(|(ts, file)| (*ts, file))
    }

    /// Entry with the latest begin time.
    pub fn last(&self) -> Option<(Timestamp, &AtomicFile)> {
        self.files.iter().next_back().map(|(ts, file)| (*ts, file))
    }

    /// Entries in ascending begin-time order.
    pub fn iter(&self) -> impl Iterator<Item = (Timestamp, &AtomicFile)> + '_ {
        self.files.iter().map(|(ts, file)| (*ts, file))
    }

    /// Entries with `start <= begin_time <= end`, ascending.
    pub fn range_inclusive(
        &self,
        start: Timestamp,
        end: Timestamp,
    ) -> impl Iterator<Item = (Timestamp, &AtomicFile)> + '_ {
        self.files
            .range((Bound::Included(start), Bound::Included(end.max(start))))
            .map(|(ts, file)| (*ts, file))
    }

    /// Removes and returns every entry starting on or after `time`.
    pub fn split_off(&mut self, time: Timestamp) -> Vec<(Timestamp, AtomicFile)> {
        self.files.split_off(&time).into_iter().collect()
    }

    /// Rebuilds the index from the files of `interval` under `layout`.
    ///
    /// Files whose names do not start with a begin time are logged and
    /// skipped; the rest of the bucket is still indexed.
    pub fn rebuild(&mut self, layout: &StoreLayout, interval: IntervalType) -> Result<()> {
        self.files.clear();
        let files = layout.list_stats_files(interval)?;
        debug!("Found {} stat files for interval {}", files.len(), interval);

        for path in files {
            match FileKey::parse_path(&path) {
                Ok(begin_time) => {
                    self.files.insert(begin_time, AtomicFile::new(path));
                }
                Err(err) => error!("Failed to index file {}: {}", path.display(), err),
            }
        }
        Ok(())
    }
}

/// Indices for all four buckets.
#[derive(Debug, Clone, Default)]
pub struct StatsIndex {
    buckets: [IntervalIndex; 4],
}

impl StatsIndex {
    /// Creates empty indices.
    pub fn new() -> Self {
        Self::default()
    }

    /// Index for one bucket.
    pub fn bucket(&self, interval: IntervalType) -> &IntervalIndex {
        &self.buckets[interval.index()]
    }

    /// Mutable index for one bucket.
    pub fn bucket_mut(&mut self, interval: IntervalType) -> &mut IntervalIndex {
        &mut self.buckets[interval.index()]
    }

    /// Re-scans every interval directory. Safe to call repeatedly.
    pub fn reindex(&mut self, layout: &StoreLayout) -> Result<()> {
        for interval in IntervalType::ALL {
            self.bucket_mut(interval).rebuild(layout, interval)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn index_of(times: &[Timestamp]) -> IntervalIndex {
        let mut index = IntervalIndex::new();
        for &ts in times {
            index.insert(ts, AtomicFile::new(FileKey::file_name(ts)));
        }
        index
    }

    #[test]
    fn test_floor_and_ceil() {
        let index = index_of(&[0, 10, 20]);
        assert_eq!(index.floor(15).map(|(ts, _)| ts), Some(10));
        assert_eq!(index.floor(10).map(|(ts, _)| ts), Some(10));
        assert_eq!(index.floor(-1), None);
        assert_eq!(index.ceil(15).map(|(ts, _)| ts), Some(20));
        assert_eq!(index.ceil(21), None);
        assert_eq!(index.last().map(|(ts, _)| ts), Some(20));
        assert_eq!(index.first().map(|(ts, _)| ts), Some(0));
        assert_eq!(index.lower(20).map(|(ts, _)| ts), Some(10));
        assert_eq!(index.lower(0), None);
    }

    #[test]
    fn test_range_inclusive() {
        let index = index_of(&[0, 10, 20, 30]);
        let times: Vec<_> = index.range_inclusive(10, 20).map(|(ts, _)| ts).collect();
        assert_eq!(times, vec![10, 20]);
        assert_eq!(index.range_inclusive(25, 5).count(), 0);
    }

    #[test]
    fn test_split_off() {
        let mut index = index_of(&[0, 10, 20]);
        let removed: Vec<_> = index.split_off(10).into_iter().map(|(ts, _)| ts).collect();
        assert_eq!(removed, vec![10, 20]);
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_reindex_skips_malformed_names() {
        let temp_dir = TempDir::new().unwrap();
        let layout = StoreLayout::new(temp_dir.path());
        layout.create_dirs().unwrap();
        let daily = layout.interval_dir(IntervalType::Daily);
        fs::write(daily.join("200"), b"").unwrap();
        fs::write(daily.join("100.cp"), b"").unwrap();
        fs::write(daily.join("bad_name"), b"").unwrap();
        fs::write(daily.join("300.1.3.vak"), b"").unwrap();

        let mut index = StatsIndex::new();
        index.reindex(&layout).unwrap();
        index.reindex(&layout).unwrap();

        let daily_index = index.bucket(IntervalType::Daily);
        let times: Vec<_> = daily_index.iter().map(|(ts, _)| ts).collect();
        assert_eq!(times, vec![100, 200]);
        assert_eq!(daily_index.get(100).unwrap().file_name(), "100.cp");
        assert!(index.bucket(IntervalType::Weekly).is_empty());
    }
}
