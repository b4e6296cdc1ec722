//! On-disk layout of a usage database and the file-name key codec.
//!
//! ```text
//! <root>/
//!   daily/    <beginTime>[.cp]
//!   weekly/   <beginTime>[.cp]
//!   monthly/  <beginTime>[.cp]
//!   yearly/   <beginTime>[.cp]
//!   version
//!   breadcrumb
//!   */<name>.<token>.<version>.vak
//! ```

use crate::error::{Result, UsageError};
use crate::stats::{IntervalType, Timestamp};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Marks a daily file that has been checked in.
pub const CHECKED_IN_SUFFIX: &str = ".cp";

/// Suffix of versioned backups created during an upgrade.
pub const VERSIONED_BACKUP_SUFFIX: &str = ".vak";

/// Suffix of legacy backup files.
pub const BACKUP_SUFFIX: &str = ".bak";

/// Suffix of in-flight atomic writes.
pub const TEMP_SUFFIX: &str = ".tmp";

const VERSION_FILE: &str = "version";
const BREADCRUMB_FILE: &str = "breadcrumb";

/// Formats and parses snapshot file names.
///
/// A file name starts with the decimal begin time of the snapshot it holds,
/// so indexing never needs to decode file contents.
///
/// # Examples
/// ```rust,ignore
/// use alopex_usagedb::store::layout::FileKey;
///
/// let name = FileKey::file_name(1_700_000_000_000);
/// assert_eq!(FileKey::parse_begin_time(&name)?, 1_700_000_000_000);
/// ```
#[derive(Debug, Clone, Copy)]
pub struct FileKey;

impl FileKey {
    /// Builds the canonical file name for a snapshot.
    pub fn file_name(begin_time: Timestamp) -> String {
        begin_time.to_string()
    }

    /// Parses the leading decimal digits of `name` as a begin time.
    ///
    /// # Errors
    ///
    /// Returns `UsageError::MalformedFileName` if `name` does not start with
    /// a digit or the number does not fit a timestamp.
    pub fn parse_begin_time(name: &str) -> Result<Timestamp> {
        let digits_end = name
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(name.len());
        name[..digits_end]
            .parse::<Timestamp>()
            .map_err(|_| UsageError::MalformedFileName(name.to_string()))
    }

    /// Parses the begin time from the final component of `path`.
    pub fn parse_path(path: &Path) -> Result<Timestamp> {
        let name = path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| UsageError::MalformedFileName(path.display().to_string()))?;
        Self::parse_begin_time(name)
    }

    /// Returns true if the file has been marked as checked in.
    pub fn is_checked_in(name: &str) -> bool {
        name.ends_with(CHECKED_IN_SUFFIX)
    }

    /// Returns true for backup and temporary files, which are never indexed.
    pub fn is_transient(name: &str) -> bool {
        name.ends_with(BACKUP_SUFFIX)
            || name.ends_with(VERSIONED_BACKUP_SUFFIX)
            || name.ends_with(TEMP_SUFFIX)
    }

    /// Name of the versioned backup of `name` for an upgrade identified by
    /// `token` away from `version`.
    pub fn versioned_backup_name(name: &str, token: i64, version: u32) -> String {
        format!("{}{}", name, Self::versioned_backup_suffix(token, version))
    }

    /// Suffix shared by every versioned backup of one upgrade.
    pub fn versioned_backup_suffix(token: i64, version: u32) -> String {
        format!(".{}.{}{}", token, version, VERSIONED_BACKUP_SUFFIX)
    }

    /// Renames `name` to start at `begin_time`, keeping the checked-in marker.
    pub fn shifted_name(name: &str, begin_time: Timestamp) -> String {
        let mut shifted = Self::file_name(begin_time);
        if Self::is_checked_in(name) {
            shifted.push_str(CHECKED_IN_SUFFIX);
        }
        shifted
    }
}

/// Provides the paths of a usage database rooted at one directory.
///
/// # Examples
/// ```rust,ignore
/// use alopex_usagedb::store::layout::StoreLayout;
/// use alopex_usagedb::IntervalType;
///
/// let layout = StoreLayout::new("/data/usagestats/0");
/// let daily = layout.interval_dir(IntervalType::Daily);
/// ```
#[derive(Debug, Clone)]
pub struct StoreLayout {
    root: PathBuf,
}

impl StoreLayout {
    /// Creates a layout for the given root directory.
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// Returns the root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the directory backing an interval bucket.
    pub fn interval_dir(&self, interval: IntervalType) -> PathBuf {
        self.root.join(interval.dir_name())
    }

    /// Returns the path of the schema version file.
    pub fn version_file(&self) -> PathBuf {
        self.root.join(VERSION_FILE)
    }

    /// Returns the path of the upgrade breadcrumb.
    pub fn breadcrumb_file(&self) -> PathBuf {
        self.root.join(BREADCRUMB_FILE)
    }

    /// Returns the canonical path of a snapshot file.
    pub fn stats_path(&self, interval: IntervalType, begin_time: Timestamp) -> PathBuf {
        self.interval_dir(interval)
            .join(FileKey::file_name(begin_time))
    }

    /// Creates every interval directory.
    ///
    /// # Errors
    ///
    /// Returns `UsageError::DirectoryCreation` if a directory cannot be created.
    pub fn create_dirs(&self) -> Result<()> {
        for interval in IntervalType::ALL {
            let dir = self.interval_dir(interval);
            if fs::create_dir_all(&dir).is_err() || !dir.is_dir() {
                return Err(UsageError::DirectoryCreation(dir));
            }
        }
        Ok(())
    }

    /// Lists the files of a bucket whose names satisfy `filter`.
    ///
    /// A missing directory yields an empty list. Results are sorted by name.
    pub fn list_files<F>(&self, interval: IntervalType, filter: F) -> Result<Vec<PathBuf>>
    where
        F: Fn(&str) -> bool,
    {
        let dir = self.interval_dir(interval);
        let mut files = Vec::new();

        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(files),
            Err(err) => return Err(err.into()),
        };

        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let name = match path.file_name().and_then(|name| name.to_str()) {
                Some(name) => name,
                None => continue,
            };
            if filter(name) {
                files.push(path);
            }
        }

        files.sort();
        Ok(files)
    }

    /// Lists the snapshot files of a bucket, skipping backup and temp files.
    pub fn list_stats_files(&self, interval: IntervalType) -> Result<Vec<PathBuf>> {
        self.list_files(interval, |name| !FileKey::is_transient(name))
    }

    /// Removes everything inside every interval directory.
    pub fn clear_interval_dirs(&self) -> Result<()> {
        for interval in IntervalType::ALL {
            let dir = self.interval_dir(interval);
            let entries = match fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
                Err(err) => return Err(err.into()),
            };
            for entry in entries {
                let path = entry?.path();
                if path.is_dir() {
                    fs::remove_dir_all(&path)?;
                } else {
                    fs::remove_file(&path)?;
                }
            }
        }
        Ok(())
    }
}
