use anyhow::{bail, Context, Result};
use keyring::{Entry, Error as KeyringError};

use crate::config::Config;

const SERVICE: &str = "mailbackup-imap";

/// IMAP passwords kept in the system keyring, one entry per username.
#[derive(Clone)]
pub struct CredentialManager {
    service: String,
}

impl Default for CredentialManager {
    fn default() -> Self {
        Self {
            service: SERVICE.to_string(),
        }
    }
}

impl CredentialManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store_password(&self, username: &str, password: &str) -> Result<()> {
        let entry = Entry::new(&self.service, username)
            .context("Failed to create keyring entry")?;
        entry
            .set_password(password)
            .context("Failed to store password in keyring")?;

        log::debug!("Password stored in keyring for {}", username);
        Ok(())
    }

    pub fn get_password(&self, username: &str) -> Result<Option<String>> {
        let entry = Entry::new(&self.service, username)
            .context("Failed to create keyring entry")?;

        match entry.get_password() {
            Ok(password) => Ok(Some(password)),
            Err(KeyringError::NoEntry) => Ok(None),
            Err(e) => Err(anyhow::anyhow!("Failed to retrieve password: {}", e)),
        }
    }

    pub fn delete_password(&self, username: &str) -> Result<()> {
        let entry = Entry::new(&self.service, username)
            .context("Failed to create keyring entry")?;

        match entry.delete_password() {
            Ok(()) | Err(KeyringError::NoEntry) => {
                log::debug!("Password deleted for {}", username);
                Ok(())
            }
            Err(e) => Err(anyhow::anyhow!("Failed to delete password: {}", e)),
        }
    }
}

pub fn prompt_password(username: &str) -> Result<String> {
    rpassword::prompt_password(format!("Enter your IMAP password for {}: ", username))
        .context("Failed to read password")
}

/// Find the IMAP password: config/CLI first, then the keyring, then ask.
pub fn resolve_password(config: &Config, manager: &CredentialManager) -> Result<String> {
    let username = config.imap_username.as_str();

    let password = match config.imap_password.as_deref().filter(|p| !p.is_empty()) {
        Some(password) => password.to_string(),
        None => match manager.get_password(username) {
            Ok(Some(password)) => password,
            Ok(None) => prompt_password(username)?,
            Err(e) => {
                log::warn!("{}", e);
                prompt_password(username)?
            }
        },
    };

    check_credentials(config, &password)?;
    Ok(password)
}

pub fn check_credentials(config: &Config, password: &str) -> Result<()> {
    if config.imap_host.is_empty() || config.imap_username.is_empty() || password.is_empty() {
        bail!("empty IMAP credentials!");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn configured() -> Config {
        Config {
            imap_host: "imap.example.com".to_string(),
            imap_username: "me@example.com".to_string(),
            imap_password: Some("hunter2".to_string()),
            ..Config::default()
        }
    }

    #[test]
    fn test_configured_password_wins() {
        let password = resolve_password(&configured(), &CredentialManager::new()).unwrap();
        assert_eq!(password, "hunter2");
    }

    #[test]
    fn test_empty_credentials_are_rejected() {
        let mut config = configured();
        assert!(check_credentials(&config, "").is_err());

        config.imap_host.clear();
        let err = check_credentials(&config, "pw").unwrap_err();
        assert_eq!(err.to_string(), "empty IMAP credentials!");
    }
}
