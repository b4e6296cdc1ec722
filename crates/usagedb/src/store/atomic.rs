//! Crash-safe single-file replacement.
//!
//! Writes follow the flush durability contract:
//! 1. Write the new contents to `<name>.tmp`
//! 2. fsync the temp file
//! 3. Atomic rename over `<name>`
//! 4. fsync the directory (rename persistence)
//!
//! A crash at any point leaves either the previous contents or the new ones
//! at `<name>`, never a partial file. A stray `.tmp` from an interrupted write
//! is discarded on the next read or write.

use crate::error::Result;
use crate::stats::Timestamp;
use crate::store::layout::TEMP_SUFFIX;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use tracing::warn;

/// Handle to a file replaced atomically on every write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AtomicFile {
    path: PathBuf,
}

impl AtomicFile {
    /// Creates a handle for `path`. Nothing is touched on disk.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Returns the path of the file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the final path component, or an empty string if it is not UTF-8.
    pub fn file_name(&self) -> &str {
        self.path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or_default()
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_os_string();
        name.push(TEMP_SUFFIX);
        PathBuf::from(name)
    }

    /// Returns true if the file exists.
    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// Reads the whole file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing or unreadable.
    pub fn read(&self) -> Result<Vec<u8>> {
        self.discard_temp();
        Ok(fs::read(&self.path)?)
    }

    /// Replaces the contents of the file with `bytes`.
    ///
    /// # Errors
    ///
    /// Returns an error if any step fails; the previous contents are kept.
    pub fn write(&self, bytes: &[u8]) -> Result<()> {
        let tmp_path = self.temp_path();
        let result = self.write_via(&tmp_path, bytes);
        if result.is_err() {
            self.discard_temp();
        }
        result
    }

    fn write_via(&self, tmp_path: &Path, bytes: &[u8]) -> Result<()> {
        // 1. Write to temp file, 2. fsync it
        {
            let mut file = File::create(tmp_path)?;
            file.write_all(bytes)?;
            file.sync_all()?;
        }

        // 3. Atomic rename
        fs::rename(tmp_path, &self.path)?;

        // 4. fsync directory (rename persistence)
        if let Some(dir) = self.path.parent() {
            sync_dir(dir)?;
        }
        Ok(())
    }

    /// Deletes the file and any in-flight temp file. Missing files are fine.
    pub fn delete(&self) -> Result<()> {
        self.discard_temp();
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Renames the file to `new_path` and returns a handle for it.
    pub fn rename_to(&self, new_path: impl Into<PathBuf>) -> Result<AtomicFile> {
        let new_path = new_path.into();
        self.discard_temp();
        fs::rename(&self.path, &new_path)?;
        Ok(AtomicFile::new(new_path))
    }

    /// Returns the modification time of the file in milliseconds since the epoch.
    pub fn last_modified_time(&self) -> Result<Timestamp> {
        let modified = fs::metadata(&self.path)?.modified()?;
        let millis = match modified.duration_since(UNIX_EPOCH) {
            Ok(since) => since.as_millis() as i64,
            Err(err) => -(err.duration().as_millis() as i64),
        };
        Ok(millis)
    }

    fn discard_temp(&self) {
        let tmp_path = self.temp_path();
        match fs::remove_file(&tmp_path) {
            Ok(()) => warn!("Discarded interrupted write {}", tmp_path.display()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => warn!("Failed to remove {}: {:?}", tmp_path.display(), err),
        }
    }
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> Result<()> {
    File::open(dir)?.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_then_read() {
        let temp_dir = TempDir::new().unwrap();
        let file = AtomicFile::new(temp_dir.path().join("100"));
        assert!(!file.exists());

        file.write(b"first").unwrap();
        file.write(b"second").unwrap();
        assert_eq!(file.read().unwrap(), b"second");
        assert_eq!(file.file_name(), "100");
    }

    #[test]
    fn test_no_temp_file_after_write() {
        let temp_dir = TempDir::new().unwrap();
        let file = AtomicFile::new(temp_dir.path().join("100"));
        file.write(b"data").unwrap();

        let tmp_file = temp_dir.path().join("100.tmp");
        assert!(
            !tmp_file.exists(),
            "Temp file {tmp_file:?} should not remain after successful write"
        );
    }

    #[test]
    fn test_interrupted_write_keeps_previous_contents() {
        let temp_dir = TempDir::new().unwrap();
        let file = AtomicFile::new(temp_dir.path().join("100"));
        file.write(b"committed").unwrap();

        // Simulate a crash between writing the temp file and the rename.
        fs::write(temp_dir.path().join("100.tmp"), b"partial").unwrap();

        assert_eq!(file.read().unwrap(), b"committed");
        assert!(!temp_dir.path().join("100.tmp").exists());
    }

    #[test]
    fn test_delete_and_rename() {
        let temp_dir = TempDir::new().unwrap();
        let file = AtomicFile::new(temp_dir.path().join("100"));
        file.write(b"data").unwrap();

        let renamed = file.rename_to(temp_dir.path().join("100.cp")).unwrap();
        assert!(!file.exists());
        assert_eq!(renamed.read().unwrap(), b"data");

        renamed.delete().unwrap();
        assert!(!renamed.exists());
        renamed.delete().unwrap();
    }

    #[test]
    fn test_last_modified_time_is_recent() {
        let temp_dir = TempDir::new().unwrap();
        let file = AtomicFile::new(temp_dir.path().join("100"));
        file.write(b"data").unwrap();
        assert!(file.last_modified_time().unwrap() > 1_600_000_000_000);
    }
}
