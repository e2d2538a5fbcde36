use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use log::LevelFilter;

use crate::config::Config;

/// Map the configured level name onto a filter. Unknown names fall back to info.
pub fn parse_level(value: Option<&str>) -> LevelFilter {
    let Some(value) = value else {
        return LevelFilter::Info;
    };
    match value.trim().to_lowercase().as_str() {
        "debug" => LevelFilter::Debug,
        "info" => LevelFilter::Info,
        "warning" | "warn" => LevelFilter::Warn,
        "error" => LevelFilter::Error,
        other => {
            eprintln!("cannot parse 'log_level' ({})!", other);
            LevelFilter::Info
        }
    }
}

/// Size-capped log file keeping `max_count` rotated copies (`file.1` is newest).
pub struct RotatingFile {
    path: PathBuf,
    max_bytes: u64,
    max_count: usize,
    file: File,
    written: u64,
}

impl RotatingFile {
    pub fn open(path: &Path, max_bytes: u64, max_count: usize) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let written = file.metadata()?.len();
        Ok(Self {
            path: path.to_path_buf(),
            max_bytes,
            max_count,
            file,
            written,
        })
    }

    fn backup_path(&self, index: usize) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(format!(".{}", index));
        PathBuf::from(name)
    }

    fn rotate(&mut self) -> io::Result<()> {
        self.file.flush()?;
        if self.max_count == 0 {
            self.file = File::create(&self.path)?;
        } else {
            for index in (1..self.max_count).rev() {
                let from = self.backup_path(index);
                if from.exists() {
                    fs::rename(&from, self.backup_path(index + 1))?;
                }
            }
            fs::rename(&self.path, self.backup_path(1))?;
            self.file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        }
        self.written = 0;
        Ok(())
    }
}

impl Write for RotatingFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.max_bytes > 0 && self.written > 0 && self.written + buf.len() as u64 > self.max_bytes {
            self.rotate()?;
        }
        let n = self.file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

/// Log destination: the rotating file, stderr, or both.
struct LogSink {
    file: Option<RotatingFile>,
    console: bool,
}

impl Write for LogSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if let Some(file) = self.file.as_mut() {
            file.write_all(buf)?;
        }
        if self.console {
            io::stderr().write_all(buf)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if let Some(file) = self.file.as_mut() {
            file.flush()?;
        }
        if self.console {
            io::stderr().flush()?;
        }
        Ok(())
    }
}

/// Initialize the global logger from the config.
pub fn init(config: &Config) -> io::Result<()> {
    let level = parse_level(config.log_level.as_deref());

    let file = match config.log_file_path() {
        Some(path) => Some(RotatingFile::open(
            &path,
            config.log_max_bytes,
            config.log_max_count,
        )?),
        None => None,
    };
    let console = file.is_none() || config.log_print;

    env_logger::Builder::new()
        .filter_level(level)
        .format(|buf, record| {
            writeln!(
                buf,
                "{} {:<5} {}: {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .target(env_logger::Target::Pipe(Box::new(LogSink { file, console })))
        .init();

    Ok(())
}
