use std::io;
use std::path::PathBuf;

use chrono::{Local, NaiveDate};
use log::{debug, error, info, warn};
use thiserror::Error;

use crate::backup::{BackupError, BackupWriter};
use crate::config::Config;
use crate::existence::{self, FileProbe, LocalFs, Outcome, SkipReason};
use crate::imap_session::{DateFilter, MailSource, SessionError};
use crate::message::MailMessage;
use crate::naming::{self, Attributes, NamingError};
use crate::shutdown::Shutdown;

#[derive(Error, Debug)]
pub enum RunError {
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Path template error: {0}")]
    Naming(#[from] NamingError),

    #[error("Cannot check existing mail {path}: {source}")]
    Probe { path: PathBuf, source: io::Error },

    #[error("Backup error: {0}")]
    Backup(#[from] BackupError),
}

pub type RunResult<T> = std::result::Result<T, RunError>;

/// Counters reported at the end of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunStats {
    pub found: usize,
    pub saved: usize,
    pub skipped: usize,
}

/// Drives folders and messages through the existence resolver and the writer.
pub struct Runner<P: FileProbe = LocalFs> {
    config: Config,
    shutdown: Shutdown,
    probe: P,
    writer: BackupWriter,
    stats: RunStats,
}

impl Runner<LocalFs> {
    pub fn new(config: Config, shutdown: Shutdown) -> Self {
        Self::with_probe(config, shutdown, LocalFs)
    }
}

impl<P: FileProbe> Runner<P> {
    pub fn with_probe(config: Config, shutdown: Shutdown, probe: P) -> Self {
        Self {
            config,
            shutdown,
            probe,
            writer: BackupWriter::new(),
            stats: RunStats::default(),
        }
    }

    pub fn stats(&self) -> RunStats {
        self.stats
    }

    /// Back up every folder of `source`.
    pub fn run<S: MailSource + ?Sized>(&mut self, source: &mut S) -> RunResult<RunStats> {
        self.run_at(source, Local::now().date_naive())
    }

    fn run_at<S: MailSource + ?Sized>(&mut self, source: &mut S, today: NaiveDate) -> RunResult<RunStats> {
        let folders = source.list_folders()?;
        info!("found mail folders = {:?}", folders);

        let filter = DateFilter::from_days(self.config.last_days, self.config.limit_days, today);

        for folder in &folders {
            if self.shutdown.is_requested() {
                break;
            }
            if let Err(e) = self.backup_folder(source, folder, &filter) {
                error!("error in folder: {}", folder);
                return Err(e);
            }
        }

        info!(
            "success: {} mails saved (of {} found; {} skipped for legal reasons, e.g. already exists).",
            self.stats.saved, self.stats.found, self.stats.skipped
        );
        Ok(self.stats)
    }

    fn backup_folder<S: MailSource + ?Sized>(
        &mut self,
        source: &mut S,
        folder: &str,
        filter: &DateFilter,
    ) -> RunResult<()> {
        self.writer.set_folder(folder);
        let uids = source.search(folder, filter)?;
        debug!("folder '{}' - {} messages to check", folder, uids.len());

        for uid in uids {
            if let Some(mail) = source.fetch(uid)? {
                let outcome = self.handle_mail(&mail, folder)?;

                if self.config.delete {
                    if outcome == Outcome::Skip(SkipReason::CollisionLimit) {
                        warn!("folder '{}' - keep mail {} on server, it was not backed up.", folder, uid);
                    } else {
                        source.delete(uid)?;
                    }
                }
            }

            if self.shutdown.is_requested() {
                break;
            }
        }
        Ok(())
    }

    /// Resolve and persist one message; returns the decision taken.
    pub fn handle_mail(&mut self, mail: &MailMessage, folder: &str) -> RunResult<Outcome> {
        let mail_path = self.mail_path(mail, folder)?;
        self.stats.found += 1;

        let outcome = existence::resolve(&self.probe, &mail.raw, &mail_path, self.config.when_exists)
            .map_err(|source| RunError::Probe {
                path: mail_path.clone(),
                source,
            })?;

        match self.writer.apply(&outcome, &mail.raw, mail.date)? {
            Some(_) => self.stats.saved += 1,
            None => self.stats.skipped += 1,
        }
        Ok(outcome)
    }

    fn mail_path(&self, mail: &MailMessage, folder: &str) -> RunResult<PathBuf> {
        let attributes = Attributes::extract(mail, &self.config.imap_username, folder);
        let formatted = naming::format_path(&self.config.path_template(), &attributes)?;
        Ok(naming::join_path(&self.config.pivot_path, &formatted))
    }
}
