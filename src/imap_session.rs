use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};

use chrono::{Duration, NaiveDate};
use imap::Session;
use log::debug;
use native_tls::TlsConnector;
use thiserror::Error;

use crate::config::{Config, ImapSecurity};
use crate::message::MailMessage;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Host ({host_info}) not found! Error: {reason}")]
    HostNotFound { host_info: String, reason: String },

    #[error("IMAP error: {0}")]
    ImapError(#[from] imap::error::Error),

    #[error("Login failed for {username}: {reason}")]
    LoginError { username: String, reason: String },

    #[error("TLS error: {0}")]
    TlsError(#[from] native_tls::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Server-side date window of a fetch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DateFilter {
    /// Messages on or after this day.
    pub since: Option<NaiveDate>,
    /// Messages strictly before this day.
    pub before: Option<NaiveDate>,
}

impl DateFilter {
    /// Non-positive day counts leave that side of the window open.
    pub fn from_days(last_days: Option<i64>, limit_days: Option<i64>, today: NaiveDate) -> Self {
        let days_ago = |days: Option<i64>| {
            days.filter(|d| *d > 0)
                .and_then(|d| today.checked_sub_signed(Duration::days(d)))
        };
        Self {
            since: days_ago(last_days),
            before: days_ago(limit_days),
        }
    }

    /// IMAP SEARCH criteria for this window.
    pub fn to_query(&self) -> String {
        let mut criteria = Vec::new();
        if let Some(since) = self.since {
            criteria.push(format!("SINCE {}", since.format("%d-%b-%Y")));
        }
        if let Some(before) = self.before {
            criteria.push(format!("BEFORE {}", before.format("%d-%b-%Y")));
        }
        if criteria.is_empty() {
            "ALL".to_string()
        } else {
            criteria.join(" ")
        }
    }
}

/// The remote side of a backup run.
pub trait MailSource {
    fn list_folders(&mut self) -> Result<Vec<String>, SessionError>;

    /// Select `folder` and return the UIDs inside `filter`, ascending.
    fn search(&mut self, folder: &str, filter: &DateFilter) -> Result<Vec<u32>, SessionError>;

    /// Fetch one message of the selected folder without setting `\Seen`.
    fn fetch(&mut self, uid: u32) -> Result<Option<MailMessage>, SessionError>;

    /// Delete one message of the selected folder.
    fn delete(&mut self, uid: u32) -> Result<(), SessionError>;

    fn logout(&mut self) -> Result<(), SessionError>;
}

/// An authenticated IMAP session over any stream.
pub struct ImapMailbox<T: Read + Write> {
    session: Session<T>,
}

impl<T: Read + Write> ImapMailbox<T> {
    pub fn new(session: Session<T>) -> Self {
        Self { session }
    }
}

impl<T: Read + Write> MailSource for ImapMailbox<T> {
    fn list_folders(&mut self) -> Result<Vec<String>, SessionError> {
        let folders = self.session.list(Some(""), Some("*"))?;
        Ok(folders
            .iter()
            .map(|f| String::from_utf8_lossy(f.name().as_bytes()).into_owned())
            .collect())
    }

    fn search(&mut self, folder: &str, filter: &DateFilter) -> Result<Vec<u32>, SessionError> {
        let mailbox = self.session.select(folder)?;
        debug!("Folder '{}' has {} messages", folder, mailbox.exists);
        if mailbox.exists == 0 {
            return Ok(Vec::new());
        }

        let mut uids: Vec<u32> = self.session.uid_search(filter.to_query())?.into_iter().collect();
        uids.sort_unstable();
        Ok(uids)
    }

    fn fetch(&mut self, uid: u32) -> Result<Option<MailMessage>, SessionError> {
        let messages = self
            .session
            .uid_fetch(uid.to_string(), "(UID INTERNALDATE BODY.PEEK[])")?;

        let message = messages
            .iter()
            .find(|m| m.uid == Some(uid))
            .and_then(|m| m.body().map(|body| (body.to_vec(), m.internal_date())));

        match message {
            Some((raw, internal_date)) => Ok(Some(MailMessage::from_raw(uid, raw, internal_date))),
            None => {
                debug!("Message {} has no body", uid);
                Ok(None)
            }
        }
    }

    fn delete(&mut self, uid: u32) -> Result<(), SessionError> {
        self.session.uid_store(uid.to_string(), "+FLAGS (\\Deleted)")?;
        self.session.expunge()?;
        Ok(())
    }

    fn logout(&mut self) -> Result<(), SessionError> {
        self.session.logout()?;
        Ok(())
    }
}

fn resolve_host(config: &Config) -> Result<Vec<SocketAddr>, SessionError> {
    let host_not_found = |reason: String| SessionError::HostNotFound {
        host_info: config.host_info(),
        reason,
    };

    let addrs: Vec<SocketAddr> = (config.imap_host.as_str(), config.port())
        .to_socket_addrs()
        .map_err(|e| host_not_found(e.to_string()))?
        .collect();
    if addrs.is_empty() {
        return Err(host_not_found("no addresses".to_string()));
    }
    Ok(addrs)
}

fn login<T: Read + Write>(
    client: imap::Client<T>,
    username: &str,
    password: &str,
) -> Result<Session<T>, SessionError> {
    client
        .login(username, password)
        .map_err(|e| SessionError::LoginError {
            username: username.to_string(),
            reason: e.0.to_string(),
        })
}

/// Connect and log in according to `config.imap_security`.
pub fn connect(config: &Config, password: &str) -> Result<Box<dyn MailSource>, SessionError> {
    let addrs = resolve_host(config)?;
    let domain = config.imap_host.as_str();
    let username = config.imap_username.as_str();

    let source: Box<dyn MailSource> = match config.imap_security {
        ImapSecurity::SSL => {
            let tls = TlsConnector::builder().build()?;
            let client = imap::connect(addrs.as_slice(), domain, &tls)?;
            Box::new(ImapMailbox::new(login(client, username, password)?))
        }
        ImapSecurity::StartTLS => {
            let tls = TlsConnector::builder().build()?;
            let client = imap::connect_starttls(addrs.as_slice(), domain, &tls)?;
            Box::new(ImapMailbox::new(login(client, username, password)?))
        }
        ImapSecurity::None => {
            let tcp_stream = TcpStream::connect(addrs.as_slice())?;
            let mut client = imap::Client::new(tcp_stream);
            client.read_greeting()?;
            Box::new(ImapMailbox::new(login(client, username, password)?))
        }
    };

    log::info!("logged in ({}@{})", username, config.host_info());
    Ok(source)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_date_filter_from_days() {
        let today = day(2024, 3, 10);

        let filter = DateFilter::from_days(Some(10), Some(2), today);
        assert_eq!(filter.since, Some(day(2024, 2, 29)));
        assert_eq!(filter.before, Some(day(2024, 3, 8)));

        let open = DateFilter::from_days(Some(0), None, today);
        assert_eq!(open, DateFilter::default());
    }

    #[test]
    fn test_date_filter_query() {
        assert_eq!(DateFilter::default().to_query(), "ALL");

        let filter = DateFilter {
            since: Some(day(2024, 1, 5)),
            before: Some(day(2024, 2, 1)),
        };
        assert_eq!(filter.to_query(), "SINCE 05-Jan-2024 BEFORE 01-Feb-2024");
    }

    #[test]
    fn test_unknown_host_is_reported() {
        let config = Config {
            imap_host: "host.invalid".to_string(),
            imap_port: Some(993),
            ..Config::default()
        };
        match resolve_host(&config) {
            Err(SessionError::HostNotFound { host_info, .. }) => {
                assert_eq!(host_info, "host.invalid:993")
            }
            other => panic!("expected HostNotFound, got {:?}", other.map(|a| a.len())),
        }
    }
}
