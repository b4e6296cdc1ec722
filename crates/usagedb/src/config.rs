//! Database configuration and build identity.

use crate::codec::DEFAULT_CURRENT_VERSION;
use std::env;
use std::time::Duration;
use tracing::warn;

/// Environment variable overriding the chooser-count retention, in days.
pub const CHOOSER_RETENTION_ENV: &str = "USAGEDB_CHOOSER_RETENTION_DAYS";

/// Default retention of chooser counts: 14 days.
pub const DEFAULT_SELECTION_LOG_RETENTION: Duration = Duration::from_secs(14 * 24 * 60 * 60);

/// Configuration for a [`UsageStatsDatabase`](crate::UsageStatsDatabase).
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Schema version that files are migrated to and written with.
    ///
    /// Default: 4 (compact binary format).
    pub current_version: u32,

    /// Keep `.vak` versioned backups after a successful upgrade.
    ///
    /// Useful when diagnosing a bad migration. Default: false.
    pub keep_versioned_backups: bool,

    /// Age after which chooser counts are scrubbed from snapshots.
    ///
    /// Default: 14 days.
    pub selection_log_retention: Duration,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            current_version: DEFAULT_CURRENT_VERSION,
            keep_versioned_backups: false,
            selection_log_retention: DEFAULT_SELECTION_LOG_RETENTION,
        }
    }
}

impl DatabaseConfig {
    /// Default configuration with overrides read from the environment.
    ///
    /// `USAGEDB_CHOOSER_RETENTION_DAYS` sets the chooser-count retention.
    /// Values that are not a day count are logged and ignored.
    pub fn from_env() -> Self {
        let config = Self::default();
        match env::var(CHOOSER_RETENTION_ENV) {
            Ok(raw) => match raw.trim().parse::<u64>() {
                Ok(days) => config.with_selection_log_retention(Duration::from_secs(
                    days.saturating_mul(24 * 60 * 60),
                )),
                Err(_) => {
                    warn!("Ignoring invalid {}={:?}", CHOOSER_RETENTION_ENV, raw);
                    config
                }
            },
            Err(_) => config,
        }
    }

    /// Sets the schema version files are written with.
    pub fn with_current_version(mut self, version: u32) -> Self {
        self.current_version = version;
        self
    }

    /// Keeps versioned backups after an upgrade.
    pub fn with_keep_versioned_backups(mut self, keep: bool) -> Self {
        self.keep_versioned_backups = keep;
        self
    }

    /// Sets the chooser-count retention.
    pub fn with_selection_log_retention(mut self, retention: Duration) -> Self {
        self.selection_log_retention = retention;
        self
    }
}

/// Supplies the identity of the running build.
///
/// The fingerprint is only compared for equality with the one stored in the
/// version file, to tell a new build from a plain restart.
pub trait BuildFingerprint: Send + Sync {
    /// Returns the build fingerprint.
    fn fingerprint(&self) -> String;
}

/// Release, codename and incremental build identifiers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildInfo {
    /// Release name, e.g. `14`.
    pub release: String,
    /// Codename, e.g. `REL`.
    pub codename: String,
    /// Incremental build identifier.
    pub incremental: String,
}

impl BuildInfo {
    /// Creates build info from its three components.
    pub fn new(
        release: impl Into<String>,
        codename: impl Into<String>,
        incremental: impl Into<String>,
    ) -> Self {
        Self {
            release: release.into(),
            codename: codename.into(),
            incremental: incremental.into(),
        }
    }
}

impl BuildFingerprint for BuildInfo {
    fn fingerprint(&self) -> String {
        format!("{};{};{}", self.release, self.codename, self.incremental)
    }
}

impl BuildFingerprint for String {
    fn fingerprint(&self) -> String {
        self.clone()
    }
}

impl BuildFingerprint for &'static str {
    fn fingerprint(&self) -> String {
        (*self).to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = DatabaseConfig::default();
        assert_eq!(config.current_version, 4);
        assert!(!config.keep_versioned_backups);
        assert_eq!(
            config.selection_log_retention,
            Duration::from_secs(14 * 86_400)
        );
    }

    #[test]
    fn test_builders() {
        let config = DatabaseConfig::default()
            .with_current_version(3)
            .with_keep_versioned_backups(true)
            .with_selection_log_retention(Duration::from_secs(86_400));
        assert_eq!(config.current_version, 3);
        assert!(config.keep_versioned_backups);
        assert_eq!(config.selection_log_retention, Duration::from_secs(86_400));
    }

    #[test]
    fn test_from_env_chooser_retention() {
        let saved = env::var(CHOOSER_RETENTION_ENV).ok();

        env::set_var(CHOOSER_RETENTION_ENV, "3");
        assert_eq!(
            DatabaseConfig::from_env().selection_log_retention,
            Duration::from_secs(3 * 86_400)
        );

        // Not a day count: logged and ignored.
        env::set_var(CHOOSER_RETENTION_ENV, "abc");
        assert_eq!(
            DatabaseConfig::from_env().selection_log_retention,
            DEFAULT_SELECTION_LOG_RETENTION
        );

        env::remove_var(CHOOSER_RETENTION_ENV);
        assert_eq!(
            DatabaseConfig::from_env().selection_log_retention,
            DEFAULT_SELECTION_LOG_RETENTION
        );

        if let Some(value) = saved {
            env::set_var(CHOOSER_RETENTION_ENV, value);
        }
    }

    #[test]
    fn test_build_info_fingerprint() {
        let info = BuildInfo::new("14", "REL", "eng.1234");
        assert_eq!(info.fingerprint(), "14;REL;eng.1234");
        assert_eq!("fixed".fingerprint(), "fixed");
    }
}
