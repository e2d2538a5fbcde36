use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

use crate::existence::ExistsPolicy;
use crate::naming::DEFAULT_PATH_TEMPLATE;

pub const DEFAULT_CONF_FILE: &str = "./mail-backup.yaml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("config file ({0}) does not exist!")]
    NotFound(String),

    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("Failed to parse config file: {0}")]
    JsonError(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ImapSecurity {
    None,
    StartTLS,
    #[default]
    SSL,
}

impl ImapSecurity {
    pub fn default_port(&self) -> u16 {
        match self {
            ImapSecurity::SSL => 993,
            ImapSecurity::StartTLS | ImapSecurity::None => 143,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub imap_host: String,
    pub imap_port: Option<u16>,
    pub imap_security: ImapSecurity,
    pub imap_username: String,
    pub imap_password: Option<String>,

    /// Path template for backed up messages.
    pub path: String,
    /// Only fetch messages from the last N days.
    #[serde(deserialize_with = "flexible_int")]
    pub last_days: Option<i64>,
    /// Only fetch messages older than N days.
    #[serde(deserialize_with = "flexible_int")]
    pub limit_days: Option<i64>,
    #[serde(deserialize_with = "flexible_bool")]
    pub delete: bool,
    pub when_exists: ExistsPolicy,

    pub log_file: Option<String>,
    pub log_level: Option<String>,
    pub log_max_bytes: u64,
    pub log_max_count: usize,
    #[serde(deserialize_with = "flexible_bool")]
    pub log_print: bool,

    /// Directory of the config file; relative paths are resolved against it.
    #[serde(skip)]
    pub pivot_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            imap_host: String::new(),
            imap_port: None,
            imap_security: ImapSecurity::SSL,
            imap_username: String::new(),
            imap_password: None,
            path: DEFAULT_PATH_TEMPLATE.to_string(),
            last_days: None,
            limit_days: None,
            delete: false,
            when_exists: ExistsPolicy::Compare,
            log_file: None,
            log_level: None,
            log_max_bytes: 10 * 1024 * 1024,
            log_max_count: 5,
            log_print: false,
            pivot_path: PathBuf::from("."),
        }
    }
}

/// Settings given on the command line; they win over the config file.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub log_file: Option<String>,
    pub log_level: Option<String>,
    pub log_print: bool,
    pub imap_password: Option<String>,
}

impl Config {
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let path = Path::new(path);
        if !path.is_file() {
            return Err(ConfigError::NotFound(path.display().to_string()));
        }

        let content = fs::read_to_string(path)?;
        let mut config: Config = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&content)?,
            _ => serde_yaml::from_str(&content)?,
        };

        let absolute = fs::canonicalize(path)?;
        config.pivot_path = absolute
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("/"));

        Ok(config)
    }

    /// Pick the config file: the given path, or the per-user one when the
    /// default `./mail-backup.yaml` is absent.
    pub fn locate(conf_file: &str) -> String {
        let expanded = shellexpand::tilde(conf_file).into_owned();
        if conf_file != DEFAULT_CONF_FILE || Path::new(&expanded).exists() {
            return expanded;
        }

        dirs::config_dir()
            .map(|dir| dir.join("mailbackup").join("mail-backup.yaml"))
            .filter(|candidate| candidate.is_file())
            .map(|candidate| candidate.to_string_lossy().into_owned())
            .unwrap_or(expanded)
    }

    pub fn apply_cli(&mut self, cli: CliOverrides) {
        if cli.log_file.is_some() {
            self.log_file = cli.log_file;
        }
        if cli.log_level.is_some() {
            self.log_level = cli.log_level;
        }
        if cli.log_print {
            self.log_print = true;
        }
        if cli.imap_password.is_some() {
            self.imap_password = cli.imap_password;
        }
    }

    pub fn port(&self) -> u16 {
        self.imap_port
            .unwrap_or_else(|| self.imap_security.default_port())
    }

    /// `host:port` as shown in log lines and errors.
    pub fn host_info(&self) -> String {
        match self.imap_port {
            Some(port) => format!("{}:{}", self.imap_host, port),
            None => self.imap_host.clone(),
        }
    }

    /// Copy safe to log at debug level.
    pub fn redacted(&self) -> Config {
        let mut cloned = self.clone();
        if cloned.imap_password.is_some() {
            cloned.imap_password = Some("***".to_string());
        }
        cloned
    }

    /// Path template with `~` expanded.
    pub fn path_template(&self) -> String {
        shellexpand::tilde(&self.path).into_owned()
    }

    pub fn log_file_path(&self) -> Option<PathBuf> {
        self.log_file.as_ref().map(|file| {
            let expanded = shellexpand::tilde(file).into_owned();
            self.pivot_path.join(expanded)
        })
    }
}

/// Accept real booleans as well as `on`/`off`, `1`/`0`, `active`/`inactive`.
fn flexible_bool<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flexible {
        Bool(bool),
        Int(i64),
        Text(String),
    }

    match Flexible::deserialize(deserializer)? {
        Flexible::Bool(value) => Ok(value),
        Flexible::Int(value) => Ok(value != 0),
        Flexible::Text(text) => match text.trim().to_lowercase().as_str() {
            "true" | "1" | "on" | "active" | "yes" => Ok(true),
            "false" | "0" | "off" | "inactive" | "no" | "" => Ok(false),
            other => Err(serde::de::Error::custom(format!(
                "cannot parse '{}' as bool!",
                other
            ))),
        },
    }
}

/// Accept numbers as well as numeric strings, including `0x`/`0o`/`0b` prefixes.
fn flexible_int<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flexible {
        Int(i64),
        Text(String),
    }

    let text = match Option::<Flexible>::deserialize(deserializer)? {
        None => return Ok(None),
        Some(Flexible::Int(value)) => return Ok(Some(value)),
        Some(Flexible::Text(text)) => text,
    };

    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    parse_int(trimmed)
        .map(Some)
        .ok_or_else(|| serde::de::Error::custom(format!("cannot parse '{}' as int!", trimmed)))
}

fn parse_int(text: &str) -> Option<i64> {
    let (negative, digits) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text.strip_prefix('+').unwrap_or(text)),
    };

    let prefix = digits.get(..2).map(str::to_ascii_lowercase);
    let (radix, digits) = match prefix.as_deref() {
        Some("0x") => (16, &digits[2..]),
        Some("0o") => (8, &digits[2..]),
        Some("0b") => (2, &digits[2..]),
        _ => (10, digits),
    };
    if digits.is_empty() || digits.starts_with(['+', '-']) {
        return None;
    }

    let value = i64::from_str_radix(digits, radix).ok()?;
    Some(if negative { -value } else { value })
}
