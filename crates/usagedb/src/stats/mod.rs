//! In-memory model of one usage snapshot.
//!
//! An [`IntervalStats`] covers `[begin_time, end_time)` for a single
//! [`IntervalType`] bucket and aggregates per-package usage, per-configuration
//! usage and (optionally) the raw event stream for that window.

use std::collections::BTreeMap;
use std::fmt;

pub mod event_type;

/// Milliseconds since the Unix epoch.
pub type Timestamp = i64;

/// Highest valid event type code.
pub const MAX_EVENT_TYPE: i32 = event_type::KEYGUARD_HIDDEN;

/// Event flag: the package is an instant app.
pub const FLAG_IS_PACKAGE_INSTANT_APP: u32 = 1;

/// Mask of every flag bit an event may carry.
pub const VALID_FLAG_BITS: u32 = FLAG_IS_PACKAGE_INSTANT_APP;

/// Maximum number of invariant violations described per snapshot.
const VALIDATION_LOG_LIMIT: usize = 10;

/// Snapshot cadence. Each bucket is backed by its own directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum IntervalType {
    /// One snapshot per day.
    Daily = 0,
    /// One snapshot per week.
    Weekly = 1,
    /// One snapshot per month.
    Monthly = 2,
    /// One snapshot per year.
    Yearly = 3,
}

impl IntervalType {
    /// All buckets in their fixed on-disk and backup order.
    pub const ALL: [IntervalType; 4] = [
        IntervalType::Daily,
        IntervalType::Weekly,
        IntervalType::Monthly,
        IntervalType::Yearly,
    ];

    /// Returns the bucket for a numeric index (0 = daily .. 3 = yearly).
    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    /// Returns the numeric index of this bucket.
    pub fn index(self) -> usize {
        self as usize
    }

    /// Directory name for this bucket under the database root.
    pub fn dir_name(self) -> &'static str {
        match self {
            Self::Daily => "daily",
            Self::Weekly => "weekly",
            Self::Monthly => "monthly",
            Self::Yearly => "yearly",
        }
    }
}

impl fmt::Display for IntervalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// Device configuration descriptor that usage can be attributed to.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Configuration {
    /// BCP-47 locale list, comma separated.
    pub locales: String,
    /// Screen width in dp.
    pub screen_width_dp: u32,
    /// Screen height in dp.
    pub screen_height_dp: u32,
    /// Screen density in dpi.
    pub density_dpi: u32,
    /// Orientation code (0 undefined, 1 portrait, 2 landscape).
    pub orientation: u8,
    /// UI mode bits (night mode, car, desk, ...).
    pub ui_mode: u32,
}

/// Aggregated usage while a [`Configuration`] was active.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigurationStats {
    /// Last time this configuration was active.
    pub last_time_active: Timestamp,
    /// Total time this configuration was active, in milliseconds.
    pub total_time_active: i64,
    /// Number of times this configuration became active.
    pub activation_count: u32,
}

/// Per-package usage record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UsageStats {
    /// Package name.
    pub package_name: String,
    /// Start of the window this record covers.
    pub begin_time_stamp: Timestamp,
    /// End of the window this record covers.
    pub end_time_stamp: Timestamp,
    /// Last time the package was used.
    pub last_time_used: Timestamp,
    /// Total time in the foreground, in milliseconds.
    pub total_time_in_foreground: i64,
    /// Number of launches.
    pub launch_count: u32,
    /// Type code of the last event seen for the package.
    pub last_event: i32,
    /// How often the package was chosen as a target: action -> category -> count.
    pub chooser_counts: BTreeMap<String, BTreeMap<String, u32>>,
}

impl UsageStats {
    /// Creates an empty record for `package_name`.
    pub fn new(package_name: impl Into<String>) -> Self {
        Self {
            package_name: package_name.into(),
            ..Self::default()
        }
    }
}

/// A single usage event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Event {
    /// Package that produced the event.
    pub package: String,
    /// Activity or component class, when known.
    pub class_name: Option<String>,
    /// Time of the event.
    pub time_stamp: Timestamp,
    /// Event type code, see [`event_type`].
    pub event_type: i32,
    /// Flag bits, a subset of [`VALID_FLAG_BITS`].
    pub flags: u32,
    /// New configuration for configuration-change events.
    pub configuration: Option<Configuration>,
}

impl Event {
    /// Creates an event without class name, flags or configuration.
    pub fn new(package: impl Into<String>, time_stamp: Timestamp, event_type: i32) -> Self {
        Self {
            package: package.into(),
            time_stamp,
            event_type,
            ..Self::default()
        }
    }
}

/// Aggregated usage for one bucket over `[begin_time, end_time)`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IntervalStats {
    /// Start of the window; matches the on-disk file name.
    pub begin_time: Timestamp,
    /// End of the window.
    pub end_time: Timestamp,
    /// Last on-disk modification time. Derived, never encoded.
    pub last_time_saved: Timestamp,
    /// Usage per package.
    pub package_stats: BTreeMap<String, UsageStats>,
    /// Usage per device configuration.
    pub configurations: BTreeMap<Configuration, ConfigurationStats>,
    /// Configuration in effect at the end of the window.
    pub active_configuration: Option<Configuration>,
    /// Event stream, absent for snapshots that do not carry events.
    pub events: Option<Vec<Event>>,
}

impl IntervalStats {
    /// Creates an empty snapshot covering `[begin_time, end_time)`.
    pub fn new(begin_time: Timestamp, end_time: Timestamp) -> Self {
        Self {
            begin_time,
            end_time,
            ..Self::default()
        }
    }

    /// Returns the record for `package_name`, creating it if needed.
    pub fn package_mut(&mut self, package_name: &str) -> &mut UsageStats {
        let begin = self.begin_time;
        let end = self.end_time;
        self.package_stats
            .entry(package_name.to_string())
            .or_insert_with(|| UsageStats {
                package_name: package_name.to_string(),
                begin_time_stamp: begin,
                end_time_stamp: end,
                ..UsageStats::default()
            })
    }

    /// Drops the chooser counts of every package, keeping the rest of the usage.
    pub fn clear_chooser_counts(&mut self) {
        for stats in self.package_stats.values_mut() {
            stats.chooser_counts.clear();
        }
    }

    /// Strips configuration and event detail that backups do not carry.
    pub fn sanitize_for_backup(&mut self) {
        self.active_configuration = None;
        self.configurations.clear();
        if let Some(events) = self.events.as_mut() {
            events.clear();
        }
    }

    /// Checks the snapshot invariants and describes the violations found.
    ///
    /// At most ten violations are described; when more exist a final entry
    /// reports the total.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        let mut failures = 0usize;
        let mut report = |message: String| {
            if failures < VALIDATION_LOG_LIMIT {
                problems.push(message);
            }
            failures += 1;
        };

        for stat in self.package_stats.values() {
            if stat.package_name.is_empty() {
                report("unexpected empty package name".to_string());
            }
            for (label, ts) in [
                ("begin", stat.begin_time_stamp),
                ("end", stat.end_time_stamp),
                ("last used", stat.last_time_used),
            ] {
                if ts > self.end_time {
                    report(format!(
                        "package {} {} timestamp {} after end time {}",
                        stat.package_name, label, ts, self.end_time
                    ));
                }
            }
        }

        for event in self.events.iter().flatten() {
            if event.package.is_empty() {
                report("unexpected empty event package name".to_string());
            }
            if event.time_stamp < self.begin_time || event.time_stamp > self.end_time {
                report(format!(
                    "event timestamp {} outside [{}, {}]",
                    event.time_stamp, self.begin_time, self.end_time
                ));
            }
            if event.event_type < 0 || event.event_type > MAX_EVENT_TYPE {
                report(format!("unexpected event type {}", event.event_type));
            }
            if event.flags & !VALID_FLAG_BITS != 0 {
                report(format!("unexpected event flag bits {:#b}", event.flags));
            }
        }

        if failures > VALIDATION_LOG_LIMIT {
            problems.push(format!("{} total violations found", failures));
        }
        problems
    }
}

/// Backfills a restored snapshot with the device's own configuration detail.
///
/// Returns `restored` unchanged when there is no on-device source, and `None`
/// when the restored snapshot itself is missing.
pub fn merge_device_config(
    restored: Option<IntervalStats>,
    on_device: Option<&IntervalStats>,
) -> Option<IntervalStats> {
    let Some(on_device) = on_device else {
        return restored;
    };
    let mut restored = restored?;
    restored.active_configuration = on_device.active_configuration.clone();
    restored.configurations.extend(
        on_device
            .configurations
            .iter()
            .map(|(config, stats)| (config.clone(), stats.clone())),
    );
    restored.events = on_device.events.clone();
    Some(restored)
}
