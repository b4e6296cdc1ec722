//! Crash-resumable schema migration.
//!
//! The upgrade runs once, at [`init`](crate::UsageStatsDatabase::init), in
//! this order:
//! 1. Rename every snapshot to a versioned backup `<name>.<token>.<from>.vak`
//! 2. Write the breadcrumb `(token, from)`
//! 3. Decode each versioned backup with the `from` codec and write it back to
//!    its canonical name with the current codec
//! 4. Write the version file `(current, fingerprint)`
//! 5. Delete the versioned backups (unless configured to keep them)
//! 6. Delete the breadcrumb
//!
//! A crash before step 2 leaves only `.vak` files behind; the next attempt
//! finds them and reuses their token. A crash after step 2 repeats step 3
//! from the same immutable backups, which produces the same output.

use crate::codec::{codec_for_version, MIN_MIGRATABLE_VERSION};
use crate::error::{Result, UsageError};
use crate::stats::{IntervalType, Timestamp};
use crate::store::atomic::AtomicFile;
use crate::store::current_time_millis;
use crate::store::layout::{FileKey, StoreLayout, VERSIONED_BACKUP_SUFFIX};
use std::fs;
use std::io;
use std::path::Path;
use tracing::{debug, error, info};

/// Schema version and build fingerprint persisted in the version file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionInfo {
    /// Schema version of the files on disk; 0 when unknown.
    pub version: u32,
    /// Fingerprint of the build that last wrote the file.
    pub fingerprint: Option<String>,
}

impl VersionInfo {
    /// Reads `"<version>\n<fingerprint>\n"`.
    ///
    /// A missing or unparsable file reads as version 0 without fingerprint.
    pub fn read(path: &Path) -> Self {
        let unknown = Self {
            version: 0,
            fingerprint: None,
        };
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(_) => return unknown,
        };
        let mut lines = text.lines();
        let version = match lines.next().map(|line| line.trim().parse::<u32>()) {
            Some(Ok(version)) => version,
            _ => return unknown,
        };
        Self {
            version,
            fingerprint: lines.next().map(str::to_string),
        }
    }

    /// Durably writes the version file.
    ///
    /// # Errors
    ///
    /// Returns `UsageError::IoError` if the write fails.
    pub fn write(&self, path: &Path) -> Result<()> {
        let contents = format!(
            "{}\n{}\n",
            self.version,
            self.fingerprint.as_deref().unwrap_or_default()
        );
        AtomicFile::new(path).write(contents.as_bytes()).map_err(|err| {
            error!("Failed to write new version: {}", err);
            err
        })
    }
}

/// Marker persisted while an upgrade is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Breadcrumb {
    /// Token embedded in the versioned backup names of this upgrade.
    pub token: i64,
    /// Schema version the backups were written with.
    pub previous_version: u32,
}

impl Breadcrumb {
    /// Reads `"<token>\n<previousVersion>\n"`; `None` if there is no breadcrumb.
    ///
    /// # Errors
    ///
    /// Returns `UsageError::MalformedBreadcrumb` if the file exists but cannot
    /// be read or parsed.
    pub fn read(path: &Path) -> Result<Option<Self>> {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(UsageError::MalformedBreadcrumb(format!(
                    "{}: {}",
                    path.display(),
                    err
                )))
            }
        };
        let mut lines = text.lines().map(str::trim);
        let token = lines.next().and_then(|line| line.parse::<i64>().ok());
        let previous_version = lines.next().and_then(|line| line.parse::<u32>().ok());
        match (token, previous_version) {
            (Some(token), Some(previous_version)) => Ok(Some(Self {
                token,
                previous_version,
            })),
            _ => {
                error!("Failed to read version upgrade breadcrumb");
                Err(UsageError::MalformedBreadcrumb(format!(
                    "{}: {:?}",
                    path.display(),
                    text
                )))
            }
        }
    }

    /// Durably writes the breadcrumb.
    pub fn write(&self, path: &Path) -> Result<()> {
        let contents = format!("{}\n{}\n", self.token, self.previous_version);
        AtomicFile::new(path).write(contents.as_bytes()).map_err(|err| {
            error!("Failed to write new version upgrade breadcrumb: {}", err);
            err
        })
    }

    /// File-name suffix shared by this upgrade's versioned backups.
    pub fn backup_suffix(&self) -> String {
        FileKey::versioned_backup_suffix(self.token, self.previous_version)
    }
}

/// Where the on-disk data stands relative to the current schema version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradeState {
    /// Files are already at the current version.
    Clean,
    /// Files are at `from` and no upgrade has started.
    NeedsUpgrade {
        /// Stored schema version.
        from: u32,
    },
    /// An upgrade away from `from` was interrupted after its backups were made.
    UpgradeInProgress {
        /// Token of the interrupted upgrade.
        token: i64,
        /// Schema version of its versioned backups.
        from: u32,
    },
}

impl UpgradeState {
    /// Derives the state from the stored version and the breadcrumb file.
    pub fn detect(layout: &StoreLayout, stored_version: u32, current_version: u32) -> Result<Self> {
        if stored_version == current_version {
            return Ok(Self::Clean);
        }
        Ok(match Breadcrumb::read(&layout.breadcrumb_file())? {
            Some(crumb) => Self::UpgradeInProgress {
                token: crumb.token,
                from: crumb.previous_version,
            },
            None => Self::NeedsUpgrade {
                from: stored_version,
            },
        })
    }
}

/// Outcome of the startup version check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MigrationReport {
    /// No fingerprint had ever been recorded.
    pub first_update: bool,
    /// The running build differs from the one that last wrote the version file.
    pub new_update: bool,
    /// Schema version the files were upgraded from, if an upgrade ran.
    pub upgraded_from: Option<u32>,
    /// Number of snapshots re-encoded.
    pub files_upgraded: usize,
}

/// Runs the version check and, when needed, the resumable upgrade.
#[derive(Debug)]
pub struct MigrationEngine<'a> {
    layout: &'a StoreLayout,
    current_version: u32,
    keep_versioned_backups: bool,
}

impl<'a> MigrationEngine<'a> {
    /// Creates an engine that migrates files under `layout` to `current_version`.
    pub fn new(layout: &'a StoreLayout, current_version: u32, keep_versioned_backups: bool) -> Self {
        Self {
            layout,
            current_version,
            keep_versioned_backups,
        }
    }

    /// Brings every file to the current version.
    ///
    /// # Errors
    ///
    /// Any rename, decode, encode or write failure aborts the migration. The
    /// breadcrumb is left in place so the next run resumes.
    pub fn run(&self, fingerprint: &str) -> Result<MigrationReport> {
        // Fail before touching anything if the target version has no codec.
        codec_for_version(self.current_version)?;

        let stored = VersionInfo::read(&self.layout.version_file());
        let mut report = MigrationReport {
            first_update: stored.fingerprint.is_none(),
            new_update: stored.fingerprint.as_deref() != Some(fingerprint),
            ..MigrationReport::default()
        };

        match UpgradeState::detect(self.layout, stored.version, self.current_version)? {
            UpgradeState::Clean => {}
            UpgradeState::NeedsUpgrade { from } => {
                info!("Upgrading from version {} to {}", from, self.current_version);
                report.upgraded_from = Some(from);
                if let Some(crumb) = self.begin_upgrade(from)? {
                    report.files_upgraded = self.resume_upgrade(&crumb)?;
                }
            }
            UpgradeState::UpgradeInProgress { token, from } => {
                info!("Version upgrade breadcrumb found on disk! Continuing version upgrade");
                report.upgraded_from = Some(from);
                let crumb = Breadcrumb {
                    token,
                    previous_version: from,
                };
                report.files_upgraded = self.resume_upgrade(&crumb)?;
            }
        }

        if stored.version != self.current_version || report.new_update {
            VersionInfo {
                version: self.current_version,
                fingerprint: Some(fingerprint.to_string()),
            }
            .write(&self.layout.version_file())?;
        }

        self.finish()?;
        Ok(report)
    }

    /// Moves every snapshot aside as a versioned backup and writes the breadcrumb.
    ///
    /// Data older than version 2 is discarded instead, and `None` is returned.
    pub fn begin_upgrade(&self, from: u32) -> Result<Option<Breadcrumb>> {
        if from < MIN_MIGRATABLE_VERSION {
            info!("Deleting all usage stats files");
            self.layout.clear_interval_dirs()?;
            return Ok(None);
        }

        let token = match self.interrupted_backup_token(from)? {
            Some(token) => {
                info!("Reusing versioned backups of interrupted upgrade {}", token);
                token
            }
            None => current_time_millis(),
        };

        for interval in IntervalType::ALL {
            let dir = self.layout.interval_dir(interval);
            for path in self.layout.list_stats_files(interval)? {
                let name = path
                    .file_name()
                    .and_then(|name| name.to_str())
                    .unwrap_or_default();
                let backup = dir.join(FileKey::versioned_backup_name(name, token, from));
                debug!(
                    "Creating versioned ({}) backup of {} for interval {} to {}",
                    from,
                    path.display(),
                    interval,
                    backup.display()
                );
                match fs::remove_file(&backup) {
                    Ok(()) => {}
                    Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                    Err(err) => return Err(err.into()),
                }
                fs::rename(&path, &backup).map_err(|err| {
                    error!("Failed to back up file: {}", path.display());
                    err
                })?;
            }
        }

        let crumb = Breadcrumb {
            token,
            previous_version: from,
        };
        crumb.write(&self.layout.breadcrumb_file())?;
        Ok(Some(crumb))
    }

    /// Re-encodes every versioned backup of `crumb` with the current codec.
    ///
    /// Returns the number of snapshots written.
    pub fn resume_upgrade(&self, crumb: &Breadcrumb) -> Result<usize> {
        let from_codec = codec_for_version(crumb.previous_version)?;
        let to_codec = codec_for_version(self.current_version)?;
        let suffix = crumb.backup_suffix();
        let mut upgraded = 0;

        for interval in IntervalType::ALL {
            let dir = self.layout.interval_dir(interval);
            let backups = self
                .layout
                .list_files(interval, |name| name.ends_with(suffix.as_str()))?;
            for path in backups {
                debug!(
                    "Upgrading {} to version ({}) for interval {}",
                    path.display(),
                    self.current_version,
                    interval
                );
                let upgrade = || -> Result<()> {
                    let begin_time = FileKey::parse_path(&path)?;
                    let bytes = AtomicFile::new(&path).read()?;
                    let stats = from_codec.decode(&bytes, begin_time)?;
                    let encoded = to_codec.encode(&stats)?;
                    let original = path
                        .file_name()
                        .and_then(|name| name.to_str())
                        .and_then(|name| name.strip_suffix(suffix.as_str()))
                        .unwrap_or_default();
                    let target = dir.join(FileKey::shifted_name(original, stats.begin_time));
                    AtomicFile::new(target).write(&encoded)
                };
                upgrade().map_err(|err| {
                    error!("Failed to upgrade versioned backup file: {}", path.display());
                    UsageError::migration(&path, err)
                })?;
                upgraded += 1;
            }
        }
        Ok(upgraded)
    }

    /// Removes upgrade leftovers once the version file is current.
    pub fn finish(&self) -> Result<()> {
        let breadcrumb = self.layout.breadcrumb_file();
        if !breadcrumb.exists() {
            return Ok(());
        }
        if !self.keep_versioned_backups {
            self.remove_versioned_backups()?;
        }
        fs::remove_file(&breadcrumb)?;
        Ok(())
    }

    fn remove_versioned_backups(&self) -> Result<()> {
        for interval in IntervalType::ALL {
            for path in self
                .layout
                .list_files(interval, |name| name.ends_with(VERSIONED_BACKUP_SUFFIX))?
            {
                debug!("Removing {} for interval {}", path.display(), interval);
                if let Err(err) = fs::remove_file(&path) {
                    error!("Failed to delete file {}: {:?}", path.display(), err);
                }
            }
        }
        Ok(())
    }

    /// Token of versioned backups left by an upgrade that died before writing
    /// its breadcrumb.
    ///
    /// Backups from a completed upgrade predate the version file written when
    /// it finished, so only tokens newer than the version file qualify.
    fn interrupted_backup_token(&self, from: u32) -> Result<Option<i64>> {
        let version_written: Option<Timestamp> = AtomicFile::new(self.layout.version_file())
            .last_modified_time()
            .ok();
        let tail = format!(".{}{}", from, VERSIONED_BACKUP_SUFFIX);
        let mut newest: Option<i64> = None;

        for interval in IntervalType::ALL {
            for path in self
                .layout
                .list_files(interval, |name| name.ends_with(tail.as_str()))?
            {
                let token = path
                    .file_name()
                    .and_then(|name| name.to_str())
                    .and_then(|name| name.strip_suffix(tail.as_str()))
                    .and_then(|rest| rest.rsplit('.').next())
                    .and_then(|token| token.parse::<i64>().ok());
                if let Some(token) = token {
                    if version_written.map_or(true, |written| token > written) {
                        newest = newest.max(Some(token));
                    }
                }
            }
        }
        Ok(newest)
    }
}
