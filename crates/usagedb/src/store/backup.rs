//! Backup payload export and restore.
//!
//! # Payload format
//!
//! All integers are big-endian.
//!
//! ```text
//! i32 version
//! for bucket in [daily, weekly, monthly, yearly]:
//!     i32 count
//!     count x { i32 len; len bytes record }
//! record = i64 begin_time + snapshot encoded with the current codec
//! ```
//!
//! A zero-length record stands for a snapshot that could not be read.

use crate::codec::StatsCodec;
use crate::error::{Result, UsageError};
use crate::stats::{merge_device_config, IntervalStats, IntervalType, Timestamp};
use crate::store::{current_time_millis, UsageStatsDatabase};
use tracing::{debug, error, warn};

/// Current payload version.
pub const BACKUP_VERSION: i32 = 1;

/// Only backup key this store serves.
pub const KEY_USAGE_STATS: &str = "usage_stats";

const RECORD_PREFIX_LEN: usize = 8;

/// Encodes one sanitized snapshot as a backup record.
pub fn encode_record(stats: &IntervalStats, codec: &dyn StatsCodec) -> Result<Vec<u8>> {
    let body = codec.encode(stats)?;
    let mut record = Vec::with_capacity(RECORD_PREFIX_LEN + body.len());
    record.extend_from_slice(&stats.begin_time.to_be_bytes());
    record.extend_from_slice(&body);
    Ok(record)
}

/// Decodes a backup record; `None` for empty or undecodable records.
pub fn decode_record(record: &[u8], codec: &dyn StatsCodec) -> Option<IntervalStats> {
    if record.len() < RECORD_PREFIX_LEN {
        if !record.is_empty() {
            warn!("Skipping truncated backup record of {} bytes", record.len());
        }
        return None;
    }
    let (prefix, body) = record.split_at(RECORD_PREFIX_LEN);
    let mut begin = [0u8; RECORD_PREFIX_LEN];
    begin.copy_from_slice(prefix);
    let begin_time = Timestamp::from_be_bytes(begin);

    match codec.decode(body, begin_time) {
        Ok(mut stats) => {
            stats.begin_time = begin_time;
            Some(stats)
        }
        Err(err) => {
            error!("Failed to decode backup record at {}: {}", begin_time, err);
            None
        }
    }
}

#[derive(Debug, Default)]
struct PayloadWriter {
    buf: Vec<u8>,
}

impl PayloadWriter {
    fn put_i32(&mut self, value: i32) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    fn put_len(&mut self, len: usize) {
        self.put_i32(i32::try_from(len).unwrap_or(i32::MAX));
    }

    fn put_record(&mut self, record: &[u8]) {
        self.put_len(record.len());
        self.buf.extend_from_slice(record);
    }
}

struct PayloadReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> PayloadReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, len: usize, what: &'static str) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.buf.len())
            .ok_or(UsageError::Truncated(what))?;
        let bytes = &self.buf[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn get_i32(&mut self, what: &'static str) -> Result<i32> {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(self.take(4, what)?);
        Ok(i32::from_be_bytes(raw))
    }

    fn get_len(&mut self, what: &'static str) -> Result<usize> {
        let len = self.get_i32(what)?;
        usize::try_from(len).map_err(|_| UsageError::Decode(format!("negative {}: {}", what, len)))
    }

    fn get_record(&mut self) -> Result<&'a [u8]> {
        let len = self.get_len("backup record length")?;
        self.take(len, "backup record")
    }
}

impl UsageStatsDatabase {
    /// Builds the backup payload for `key`, pruning first at the current time.
    ///
    /// Keys other than [`KEY_USAGE_STATS`] yield an empty payload.
    pub fn backup_payload(&self, key: &str) -> Result<Vec<u8>> {
        self.backup_payload_at(key, current_time_millis())
    }

    /// Builds the backup payload for `key`, pruning at `now` first.
    ///
    /// Snapshots are sanitized before encoding. A snapshot that cannot be read
    /// is written as an empty record.
    pub fn backup_payload_at(&self, key: &str, now: Timestamp) -> Result<Vec<u8>> {
        if key != KEY_USAGE_STATS {
            return Ok(Vec::new());
        }
        let mut state = self.lock_state();
        self.prune_locked(&mut state, now)?;

        let mut out = PayloadWriter::default();
        out.put_i32(BACKUP_VERSION);
        for interval in IntervalType::ALL {
            let bucket = state.index.bucket(interval);
            out.put_len(bucket.len());
            for (begin_time, file) in bucket.iter() {
                let record = self.read_file(file).and_then(|mut stats| {
                    stats.sanitize_for_backup();
                    encode_record(&stats, self.codec)
                });
                match record {
                    Ok(record) => out.put_record(&record),
                    Err(err) => {
                        error!(
                            "Failed to back up {} snapshot {}: {}",
                            interval, begin_time, err
                        );
                        out.put_record(&[]);
                    }
                }
            }
        }
        debug!("Built {} byte backup payload", out.buf.len());
        Ok(out.buf)
    }

    /// Replaces every bucket with the snapshots in `payload`.
    ///
    /// The device's latest snapshot of each bucket, read before anything is
    /// deleted, supplies the configuration and event detail backups omit.
    /// Payloads of an unknown version are ignored. Records that cannot be
    /// decoded are skipped. The index is rebuilt even if the payload is cut
    /// short.
    pub fn apply_restored_payload(&self, key: &str, payload: &[u8]) -> Result<()> {
        if key != KEY_USAGE_STATS {
            return Ok(());
        }
        let mut state = self.lock_state();

        let config_sources: Vec<Option<IntervalStats>> = IntervalType::ALL
            .iter()
            .map(|interval| self.latest_locked(&state, *interval))
            .collect();

        let mut restore = || -> Result<usize> {
            let mut reader = PayloadReader::new(payload);
            let version = reader.get_i32("backup version")?;
            if !(1..=BACKUP_VERSION).contains(&version) {
                warn!("Ignoring backup payload of version {}", version);
                return Ok(0);
            }

            self.layout.clear_interval_dirs()?;
            for interval in IntervalType::ALL {
                state.index.bucket_mut(interval).clear();
            }

            let mut restored = 0;
            for interval in IntervalType::ALL {
                let count = reader.get_len("backup record count")?;
                let source = config_sources[interval.index()].as_ref();
                for _ in 0..count {
                    let record = reader.get_record()?;
                    let stats = merge_device_config(decode_record(record, self.codec), source);
                    if let Some(mut stats) = stats {
                        self.put_locked(&mut state, interval, &mut stats)?;
                        restored += 1;
                    }
                }
            }
            Ok(restored)
        };

        let result = restore();
        state.index.reindex(&self.layout)?;
        match result {
            Ok(restored) => {
                debug!("Restored {} snapshots from backup", restored);
                Ok(())
            }
            Err(err) => {
                error!("Failed to apply restored payload: {}", err);
                Err(err)
            }
        }
    }
}
