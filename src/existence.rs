use std::ffi::OsString;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use log::{debug, warn};
use serde::{Deserialize, Serialize};

/// Number of candidate names probed for one message, the base path included.
pub const MAX_VARIANTS: usize = 5;

/// What to do when a backup file already sits at the formatted path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExistsPolicy {
    /// Compare raw bytes and fall back to numbered variants on a mismatch.
    #[default]
    #[serde(alias = "COMPARE", alias = "Compare")]
    Compare,
    /// Remove the existing file and write the new message in its place.
    #[serde(alias = "OVERWRITE", alias = "Overwrite")]
    Overwrite,
    /// Leave the existing file alone without looking at it.
    #[serde(alias = "SKIP", alias = "Skip")]
    Skip,
}

impl fmt::Display for ExistsPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExistsPolicy::Compare => "compare",
            ExistsPolicy::Overwrite => "overwrite",
            ExistsPolicy::Skip => "skip",
        };
        f.write_str(name)
    }
}

impl FromStr for ExistsPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "compare" => Ok(ExistsPolicy::Compare),
            "overwrite" => Ok(ExistsPolicy::Overwrite),
            "skip" => Ok(ExistsPolicy::Skip),
            other => Err(format!("unknown existence policy '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// A file exists and the policy says not to touch it.
    Exists,
    /// Byte-identical content was found at this path.
    Duplicate(PathBuf),
    /// Every variant name is taken by different content.
    CollisionLimit,
}

/// Decision for one message. Applying it is left to the backup writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Write(PathBuf),
    OverwriteThenWrite(PathBuf),
    Skip(SkipReason),
}

impl Outcome {
    /// Path the message ends up at, if it gets written at all.
    pub fn target(&self) -> Option<&Path> {
        match self {
            Outcome::Write(path) | Outcome::OverwriteThenWrite(path) => Some(path),
            Outcome::Skip(_) => None,
        }
    }

    pub fn is_skip(&self) -> bool {
        matches!(self, Outcome::Skip(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanResult {
    /// Nothing lives at this variant yet.
    Free(PathBuf),
    /// The message is already backed up here.
    Duplicate(PathBuf),
    /// All variants are occupied by other content.
    Exhausted,
}

impl ScanResult {
    /// `Some(path)` when the message should be written, `None` when it is skipped.
    pub fn into_path(self) -> Option<PathBuf> {
        match self {
            ScanResult::Free(path) => Some(path),
            ScanResult::Duplicate(_) | ScanResult::Exhausted => None,
        }
    }
}

/// Read-only view of the backup tree.
pub trait FileProbe {
    /// `Ok(false)` when nothing is there; other failures are errors.
    fn is_file(&self, path: &Path) -> io::Result<bool>;

    fn read(&self, path: &Path) -> io::Result<Vec<u8>>;
}

/// `FileProbe` backed by the local filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFs;

impl FileProbe for LocalFs {
    fn is_file(&self, path: &Path) -> io::Result<bool> {
        match fs::metadata(path) {
            Ok(metadata) => Ok(metadata.is_file()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        fs::read(path)
    }
}

/// Name of the `index`-th variant of `base`. Index 1 is `base` itself,
/// higher indices get `.N` inserted before the final extension.
pub fn variant_path(base: &Path, index: usize) -> PathBuf {
    if index <= 1 {
        return base.to_path_buf();
    }

    let mut name = OsString::from(base.file_stem().unwrap_or_default());
    name.push(format!(".{}", index));
    if let Some(extension) = base.extension() {
        name.push(".");
        name.push(extension);
    }
    base.with_file_name(name)
}

/// The bounded sequence of candidate names for `base`.
pub fn variants(base: &Path) -> impl Iterator<Item = PathBuf> + '_ {
    (1..=MAX_VARIANTS).map(move |index| variant_path(base, index))
}

/// Probe the variants of `base` for a free slot or a byte-identical copy of `raw`.
pub fn scan<P: FileProbe + ?Sized>(probe: &P, raw: &[u8], base: &Path) -> io::Result<ScanResult> {
    for candidate in variants(base) {
        if !probe.is_file(&candidate)? {
            return Ok(ScanResult::Free(candidate));
        }

        if probe.read(&candidate)? == raw {
            if candidate == base {
                debug!("skip existing mail ({}).", base.display());
            } else {
                debug!(
                    "skip existing mail (expected: {}, found as: {}).",
                    base.display(),
                    candidate.display()
                );
            }
            return Ok(ScanResult::Duplicate(candidate));
        }
    }

    warn!(
        "cannot find other path for existing mail ({}). loop ({}) exceeded!",
        base.display(),
        MAX_VARIANTS
    );
    Ok(ScanResult::Exhausted)
}

/// Decide what to do with a message whose formatted path is `candidate`.
pub fn resolve<P: FileProbe + ?Sized>(
    probe: &P,
    raw: &[u8],
    candidate: &Path,
    policy: ExistsPolicy,
) -> io::Result<Outcome> {
    if !probe.is_file(candidate)? {
        return Ok(Outcome::Write(candidate.to_path_buf()));
    }

    let outcome = match policy {
        ExistsPolicy::Overwrite => Outcome::OverwriteThenWrite(candidate.to_path_buf()),
        ExistsPolicy::Skip => {
            debug!("skip existing file ({}).", candidate.display());
            Outcome::Skip(SkipReason::Exists)
        }
        ExistsPolicy::Compare => match scan(probe, raw, candidate)? {
            ScanResult::Free(path) => Outcome::Write(path),
            ScanResult::Duplicate(path) => Outcome::Skip(SkipReason::Duplicate(path)),
            ScanResult::Exhausted => Outcome::Skip(SkipReason::CollisionLimit),
        },
    };
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::HashMap;
    use std::sync::{Mutex, Once};

    /// Keeps every warning emitted while tests run.
    struct WarnCapture;

    static WARNINGS: Mutex<Vec<String>> = Mutex::new(Vec::new());
    static CAPTURE: WarnCapture = WarnCapture;
    static INSTALL: Once = Once::new();

    impl log::Log for WarnCapture {
        fn enabled(&self, metadata: &log::Metadata) -> bool {
            metadata.level() <= log::Level::Warn
        }

        fn log(&self, record: &log::Record) {
            if self.enabled(record.metadata()) {
                WARNINGS.lock().unwrap().push(record.args().to_string());
            }
        }

        fn flush(&self) {}
    }

    fn capture_warnings() {
        INSTALL.call_once(|| {
            log::set_logger(&CAPTURE).unwrap();
            log::set_max_level(log::LevelFilter::Warn);
        });
    }

    #[derive(Default)]
    struct FakeProbe {
        files: HashMap<PathBuf, Vec<u8>>,
        checked: RefCell<Vec<PathBuf>>,
        reads: RefCell<Vec<PathBuf>>,
        unreadable: Option<PathBuf>,
    }

    impl FakeProbe {
        fn with(files: &[(&str, &[u8])]) -> Self {
            Self {
                files: files
                    .iter()
                    .map(|(path, data)| (PathBuf::from(path), data.to_vec()))
                    .collect(),
                ..Default::default()
            }
        }
    }

    impl FileProbe for FakeProbe {
        fn is_file(&self, path: &Path) -> io::Result<bool> {
            self.checked.borrow_mut().push(path.to_path_buf());
            Ok(self.files.contains_key(path))
        }

        fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
            self.reads.borrow_mut().push(path.to_path_buf());
            if self.unreadable.as_deref() == Some(path) {
                return Err(io::Error::new(io::ErrorKind::PermissionDenied, "denied"));
            }
            self.files
                .get(path)
                .cloned()
                .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))
        }
    }

    #[test]
    fn test_variant_path_inserts_before_extension() {
        let base = Path::new("2024-01/20240115-0900-42-Subject.eml");
        assert_eq!(variant_path(base, 1), base);
        assert_eq!(
            variant_path(base, 2),
            PathBuf::from("2024-01/20240115-0900-42-Subject.2.eml")
        );
        assert_eq!(variant_path(Path::new("a.b/mail"), 3), PathBuf::from("a.b/mail.3"));
        assert_eq!(variants(base).count(), MAX_VARIANTS);
    }

    #[test]
    fn test_missing_file_is_written_under_every_policy() {
        let probe = FakeProbe::default();
        for policy in [ExistsPolicy::Compare, ExistsPolicy::Overwrite, ExistsPolicy::Skip] {
            let outcome = resolve(&probe, b"mail", Path::new("A.eml"), policy).unwrap();
            assert_eq!(outcome, Outcome::Write(PathBuf::from("A.eml")));
        }
        assert!(probe.reads.borrow().is_empty());
    }

    #[test]
    fn test_skip_policy_never_reads_content() {
        let probe = FakeProbe::with(&[("A.eml", b"other")]);
        let outcome = resolve(&probe, b"mail", Path::new("A.eml"), ExistsPolicy::Skip).unwrap();

        assert_eq!(outcome, Outcome::Skip(SkipReason::Exists));
        assert!(probe.reads.borrow().is_empty());
    }

    #[test]
    fn test_overwrite_policy_targets_existing_path() {
        let probe = FakeProbe::with(&[("A.eml", b"something else entirely")]);
        let outcome = resolve(&probe, b"mail", Path::new("A.eml"), ExistsPolicy::Overwrite).unwrap();

        assert_eq!(outcome, Outcome::OverwriteThenWrite(PathBuf::from("A.eml")));
        assert!(probe.reads.borrow().is_empty());
    }

    #[test]
    fn test_scan_finds_free_slot() {
        let probe = FakeProbe::with(&[("A.eml", b"unrelated")]);
        let result = scan(&probe, b"mail", Path::new("A.eml")).unwrap();

        assert_eq!(result, ScanResult::Free(PathBuf::from("A.2.eml")));
        assert_eq!(result.into_path(), Some(PathBuf::from("A.2.eml")));
    }

    #[test]
    fn test_scan_finds_duplicate_at_base_without_looking_further() {
        let probe = FakeProbe::with(&[
            ("A.eml", b"mail"),
            ("A.2.eml", b"x"),
            ("A.3.eml", b"y"),
        ]);
        let result = scan(&probe, b"mail", Path::new("A.eml")).unwrap();

        assert_eq!(result, ScanResult::Duplicate(PathBuf::from("A.eml")));
        assert_eq!(*probe.reads.borrow(), vec![PathBuf::from("A.eml")]);
    }

    #[test]
    fn test_scan_finds_duplicate_at_later_variant() {
        let probe = FakeProbe::with(&[
            ("A.eml", b"one"),
            ("A.2.eml", b"two"),
            ("A.3.eml", b"mail"),
        ]);
        let outcome = resolve(&probe, b"mail", Path::new("A.eml"), ExistsPolicy::Compare).unwrap();

        assert_eq!(
            outcome,
            Outcome::Skip(SkipReason::Duplicate(PathBuf::from("A.3.eml")))
        );
    }

    #[test]
    fn test_scan_stops_after_five_variants() {
        capture_warnings();
        let probe = FakeProbe::with(&[
            ("full/A.eml", b"1"),
            ("full/A.2.eml", b"2"),
            ("full/A.3.eml", b"3"),
            ("full/A.4.eml", b"4"),
            ("full/A.5.eml", b"5"),
        ]);
        let base = Path::new("full/A.eml");
        let outcome = resolve(&probe, b"mail", base, ExistsPolicy::Compare).unwrap();

        assert_eq!(outcome, Outcome::Skip(SkipReason::CollisionLimit));
        assert!(!probe.checked.borrow().contains(&PathBuf::from("full/A.6.eml")));
        assert_eq!(probe.reads.borrow().len(), MAX_VARIANTS);

        let expected = format!(
            "cannot find other path for existing mail ({}). loop ({}) exceeded!",
            base.display(),
            MAX_VARIANTS
        );
        assert!(WARNINGS.lock().unwrap().contains(&expected));
    }

    #[test]
    fn test_read_failure_aborts_scan() {
        let mut probe = FakeProbe::with(&[("A.eml", b"one"), ("A.2.eml", b"two")]);
        probe.unreadable = Some(PathBuf::from("A.eml"));

        let err = resolve(&probe, b"mail", Path::new("A.eml"), ExistsPolicy::Compare).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::PermissionDenied);
        assert!(!probe.checked.borrow().contains(&PathBuf::from("A.2.eml")));
    }

    #[test]
    fn test_compare_is_idempotent_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("2024-01").join("mail.eml");

        let first = resolve(&LocalFs, b"raw mail", &path, ExistsPolicy::Compare).unwrap();
        assert_eq!(first, Outcome::Write(path.clone()));

        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, b"raw mail").unwrap();

        let second = resolve(&LocalFs, b"raw mail", &path, ExistsPolicy::Compare).unwrap();
        assert_eq!(second, Outcome::Skip(SkipReason::Duplicate(path)));
    }

    #[test]
    fn test_local_fs_treats_directory_as_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!LocalFs.is_file(dir.path()).unwrap());
        assert!(!LocalFs.is_file(&dir.path().join("absent.eml")).unwrap());
    }

    #[test]
    fn test_policy_parsing() {
        assert_eq!("Overwrite".parse::<ExistsPolicy>(), Ok(ExistsPolicy::Overwrite));
        assert_eq!(" skip ".parse::<ExistsPolicy>(), Ok(ExistsPolicy::Skip));
        assert!("append".parse::<ExistsPolicy>().is_err());

        let policy: ExistsPolicy = serde_yaml::from_str("COMPARE").unwrap();
        assert_eq!(policy, ExistsPolicy::Compare);
        assert_eq!(ExistsPolicy::default(), ExistsPolicy::Compare);
    }
}
