pub mod backup;
pub mod config;
pub mod credentials;
pub mod existence;
pub mod imap_session;
pub mod logging;
pub mod message;
pub mod naming;
pub mod runner;
pub mod shutdown;

// Re-export commonly used types
pub use config::{Config, ImapSecurity};
pub use existence::{resolve, scan, ExistsPolicy, Outcome};
pub use imap_session::{MailSource, SessionError};
pub use message::MailMessage;
pub use runner::{RunError, RunStats, Runner};
