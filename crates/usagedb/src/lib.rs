//! Alopex UsageDB - persistent store for per-user app usage statistics
//!
//! This crate keeps time-bucketed usage snapshots on disk and provides the
//! operations a usage-tracking service needs on top of them.
//!
//! # Components
//!
//! - [`UsageStatsDatabase`]: Bucketed snapshot store (daily, weekly, monthly, yearly)
//! - [`codec`]: Versioned snapshot codecs (legacy text, compact binary)
//! - [`store::migration`]: Crash-resumable schema upgrades
//! - [`store::retention`]: Age-based pruning of snapshots and chooser counts
//! - [`store::backup`]: Backup payload export and restore
//!
//! # Example
//!
//! ```rust,ignore
//! use alopex_usagedb::{BuildInfo, IntervalStats, IntervalType, UsageStatsDatabase};
//!
//! let db = UsageStatsDatabase::new("/data/usagestats/0", BuildInfo::new("14", "REL", "1234"));
//! db.init(now)?;
//!
//! // Persist today's snapshot
//! let mut today = IntervalStats::new(day_start, now);
//! today.package_mut("com.example.app").launch_count += 1;
//! db.put_usage_stats(IntervalType::Daily, &mut today)?;
//!
//! // Housekeeping
//! db.prune(now)?;
//! ```

#![deny(missing_docs)]

pub mod codec;
pub mod config;
pub mod error;
pub mod stats;
pub mod store;

pub use codec::{codec_for_version, StatsCodec};
pub use config::{BuildFingerprint, BuildInfo, DatabaseConfig};
pub use error::{Result, UsageError};
pub use stats::{
    event_type, Configuration, ConfigurationStats, Event, IntervalStats, IntervalType,
    Timestamp, UsageStats,
};
pub use store::backup::{BACKUP_VERSION, KEY_USAGE_STATS};
pub use store::migration::MigrationReport;
pub use store::retention::PruneReport;
pub use store::{CheckinAction, StatCombiner, UsageStatsDatabase};
