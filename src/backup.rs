use std::fs::{self, FileTimes};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Local};
use log::{debug, info};
use tempfile::{Builder, NamedTempFile};
use thiserror::Error;

use crate::existence::Outcome;

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Failed to remove former mail {path}: {source}")]
    Remove { path: PathBuf, source: io::Error },

    #[error("Failed to create directory {path}: {source}")]
    CreateDir { path: PathBuf, source: io::Error },

    #[error("Failed to write mail {path}: {source}")]
    Write { path: PathBuf, source: io::Error },
}

/// Persists messages according to an [`Outcome`].
#[derive(Debug, Clone, Default)]
pub struct BackupWriter {
    folder_info: String,
}

impl BackupWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Prefix log lines with the folder the current message came from.
    pub fn set_folder(&mut self, folder: &str) {
        self.folder_info = format!("folder '{}' - ", folder);
    }

    /// Carry out `outcome`. Returns the written path, or `None` for a skip.
    pub fn apply(
        &self,
        outcome: &Outcome,
        raw: &[u8],
        date: DateTime<Local>,
    ) -> Result<Option<PathBuf>, BackupError> {
        let path = match outcome {
            Outcome::Skip(_) => return Ok(None),
            Outcome::Write(path) => path,
            Outcome::OverwriteThenWrite(path) => {
                self.remove_former(path)?;
                path
            }
        };

        debug!("{}backup mail ({}).", self.folder_info, path.display());
        write_atomic(path, raw, date)?;
        Ok(Some(path.clone()))
    }

    fn remove_former(&self, path: &Path) -> Result<(), BackupError> {
        match fs::remove_file(path) {
            Ok(()) => {
                info!("{}remove former mail ({}).", self.folder_info, path.display());
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(BackupError::Remove {
                path: path.to_path_buf(),
                source,
            }),
        }
    }
}

/// Write `raw` next to `path` and rename it into place, stamped with `date`.
fn write_atomic(path: &Path, raw: &[u8], date: DateTime<Local>) -> Result<(), BackupError> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir).map_err(|source| BackupError::CreateDir {
        path: dir.to_path_buf(),
        source,
    })?;

    let write_err = |source: io::Error| BackupError::Write {
        path: path.to_path_buf(),
        source,
    };

    let mut tmp = temp_file_in(dir).map_err(write_err)?;
    tmp.write_all(raw).map_err(write_err)?;

    let stamp = SystemTime::from(date);
    tmp.as_file()
        .set_times(FileTimes::new().set_accessed(stamp).set_modified(stamp))
        .map_err(write_err)?;
    tmp.as_file().sync_all().map_err(write_err)?;

    tmp.persist(path).map_err(|e| write_err(e.error))?;
    Ok(())
}

/// Temp file created with the same mode a plain `File::create` would get.
#[cfg(unix)]
fn temp_file_in(dir: &Path) -> io::Result<NamedTempFile> {
    use std::os::unix::fs::PermissionsExt;

    // 0o666 is filtered by the process umask at creation
    Builder::new()
        .permissions(fs::Permissions::from_mode(0o666))
        .tempfile_in(dir)
}

#[cfg(not(unix))]
fn temp_file_in(dir: &Path) -> io::Result<NamedTempFile> {
    Builder::new().tempfile_in(dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::existence::SkipReason;
    use chrono::TimeZone;

    fn mail_date() -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 1, 15, 9, 0, 0).unwrap()
    }

    #[test]
    fn test_write_creates_directories_and_sets_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("2024-01").join("mail.eml");
        let writer = BackupWriter::new();

        let written = writer
            .apply(&Outcome::Write(path.clone()), b"raw mail", mail_date())
            .unwrap();

        assert_eq!(written, Some(path.clone()));
        assert_eq!(fs::read(&path).unwrap(), b"raw mail");
        let modified = fs::metadata(&path).unwrap().modified().unwrap();
        assert_eq!(modified, SystemTime::from(mail_date()));
    }

    #[test]
    fn test_overwrite_replaces_existing_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mail.eml");
        fs::write(&path, b"completely different and much longer content").unwrap();

        let mut writer = BackupWriter::new();
        writer.set_folder("INBOX");
        writer
            .apply(&Outcome::OverwriteThenWrite(path.clone()), b"new", mail_date())
            .unwrap();

        assert_eq!(fs::read(&path).unwrap(), b"new");
    }

    #[cfg(unix)]
    #[test]
    fn test_written_mail_gets_default_file_mode() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mail.eml");
        let plain = dir.path().join("plain.eml");
        fs::write(&plain, b"x").unwrap();

        BackupWriter::new()
            .apply(&Outcome::Write(path.clone()), b"raw", mail_date())
            .unwrap();

        let mode = |p: &Path| fs::metadata(p).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode(&path), mode(&plain));
    }

    #[test]
    fn test_skip_touches_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mail.eml");
        fs::write(&path, b"old").unwrap();

        let written = BackupWriter::new()
            .apply(&Outcome::Skip(SkipReason::Exists), b"new", mail_date())
            .unwrap();

        assert_eq!(written, None);
        assert_eq!(fs::read(&path).unwrap(), b"old");
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }
}
