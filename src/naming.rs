use std::collections::HashMap;
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;

use chrono::{Datelike, Timelike};
use thiserror::Error;

use crate::message::MailMessage;

pub const MAX_ATTRIBUTE_LENGTH: usize = 32;
pub const MAX_SUBJECT_LENGTH: usize = 50;

pub const DEFAULT_PATH_TEMPLATE: &str =
    "./downloads/{YEAR}-{MONTH}/{YEAR}{MONTH}{DAY}-{HOUR}{MINUTE}-{UID}-{SUBJECT}.eml";

const SUBJECT_PREFIXES: [&str; 4] = ["fw:", "fwd:", "re:", "aw:"];

#[derive(Error, Debug, PartialEq, Eq)]
pub enum NamingError {
    #[error("unknown placeholder '{{{0}}}' in path template")]
    UnknownKey(String),

    #[error("unbalanced brace in path template: {0}")]
    Unbalanced(String),
}

/// Placeholders a path template may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NamingKey {
    Year,
    Month,
    Day,
    Hour,
    Minute,
    Uid,
    Subject,
    To1,
    From,
    Folder,
}

impl NamingKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            NamingKey::Year => "YEAR",
            NamingKey::Month => "MONTH",
            NamingKey::Day => "DAY",
            NamingKey::Hour => "HOUR",
            NamingKey::Minute => "MINUTE",
            NamingKey::Uid => "UID",
            NamingKey::Subject => "SUBJECT",
            NamingKey::To1 => "TO1",
            NamingKey::From => "FROM",
            NamingKey::Folder => "FOLDER",
        }
    }
}

impl fmt::Display for NamingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NamingKey {
    type Err = NamingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let key = match s {
            "YEAR" => NamingKey::Year,
            "MONTH" => NamingKey::Month,
            "DAY" => NamingKey::Day,
            "HOUR" => NamingKey::Hour,
            "MINUTE" => NamingKey::Minute,
            "UID" => NamingKey::Uid,
            "SUBJECT" => NamingKey::Subject,
            "TO1" => NamingKey::To1,
            "FROM" => NamingKey::From,
            "FOLDER" => NamingKey::Folder,
            other => return Err(NamingError::UnknownKey(other.to_string())),
        };
        Ok(key)
    }
}

/// Sanitized values for every placeholder of one message.
#[derive(Debug, Clone, Default)]
pub struct Attributes(HashMap<NamingKey, String>);

impl Attributes {
    pub fn get(&self, key: NamingKey) -> &str {
        self.0.get(&key).map(String::as_str).unwrap_or("")
    }

    pub fn insert(&mut self, key: NamingKey, value: impl Into<String>) {
        self.0.insert(key, value.into());
    }

    fn insert_text(&mut self, key: NamingKey, value: &str, max_length: usize) {
        self.insert(key, prepare_text(value, max_length));
    }

    /// Derive all placeholder values from a message fetched out of `folder`.
    pub fn extract(mail: &MailMessage, username: &str, folder: &str) -> Self {
        let mut attributes = Attributes::default();

        // Mirror the server's folder structure below the account name
        let folder = prepare_path(&folder.replace("INBOX.", ""), MAX_ATTRIBUTE_LENGTH);
        let folder_value = if folder.is_empty() {
            username.to_string()
        } else {
            format!("{}/{}", username, folder)
        };
        attributes.insert(NamingKey::Folder, folder_value);

        attributes.insert_text(NamingKey::Uid, &mail.uid.to_string(), MAX_ATTRIBUTE_LENGTH);
        attributes.insert_text(
            NamingKey::From,
            &prepare_email(mail.from.as_deref()),
            MAX_ATTRIBUTE_LENGTH,
        );
        attributes.insert_text(
            NamingKey::To1,
            &prepare_email(mail.to.as_deref()),
            MAX_ATTRIBUTE_LENGTH,
        );
        attributes.insert_text(
            NamingKey::Subject,
            prepare_subject(&mail.subject),
            MAX_SUBJECT_LENGTH,
        );

        let date = mail.date;
        attributes.insert(NamingKey::Year, format!("{:04}", date.year()));
        attributes.insert(NamingKey::Month, format!("{:02}", date.month()));
        attributes.insert(NamingKey::Day, format!("{:02}", date.day()));
        attributes.insert(NamingKey::Hour, format!("{:02}", date.hour()));
        attributes.insert(NamingKey::Minute, format!("{:02}", date.minute()));

        attributes
    }
}

/// Substitute `{KEY}` placeholders; `{{` and `}}` produce literal braces.
pub fn format_path(template: &str, attributes: &Attributes) -> Result<String, NamingError> {
    let mut output = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                output.push('{');
            }
            '{' => {
                let mut name = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some(ch) => name.push(ch),
                        None => return Err(NamingError::Unbalanced(template.to_string())),
                    }
                }
                let key: NamingKey = name.parse()?;
                output.push_str(attributes.get(key));
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                output.push('}');
            }
            '}' => return Err(NamingError::Unbalanced(template.to_string())),
            _ => output.push(c),
        }
    }

    Ok(output)
}

/// Anchor a relative mail path at `pivot`; absolute paths are kept.
pub fn join_path(pivot: &Path, mail_path: &str) -> PathBuf {
    let mail_path = Path::new(mail_path);
    let joined = if mail_path.is_absolute() {
        mail_path.to_path_buf()
    } else {
        pivot.join(mail_path)
    };
    normalize(&joined)
}

/// Lexically drop `.` and fold `..` components.
fn normalize(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if matches!(normalized.components().next_back(), Some(Component::Normal(_))) {
                    normalized.pop();
                } else {
                    normalized.push(component);
                }
            }
            other => normalized.push(other),
        }
    }
    normalized
}

fn replace_all(mut text: String, old: &str, new: &str) -> String {
    while text.contains(old) {
        text = text.replace(old, new);
    }
    text
}

fn truncate(text: &str, max_length: usize) -> String {
    text.chars().take(max_length).collect()
}

/// Reduce free text to a safe file name fragment of `[A-Za-z0-9.-]`.
pub fn prepare_text(value: &str, max_length: usize) -> String {
    let mut value = deunicode::deunicode(value.trim());

    value = replace_all(value, "_", ".");
    value = replace_all(value, " ", ".");
    value = replace_all(value, ".-", "-");
    value = replace_all(value, "-.", "-");

    value = value
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '.' })
        .collect();

    value = replace_all(value, "..", ".");

    truncate(&value, max_length).trim_matches('.').to_string()
}

/// Turn a server folder name such as `Archive.2023` into `Archive/2023`.
pub fn prepare_path(value: &str, max_length: usize) -> String {
    let value = deunicode::deunicode(value.trim()).replace('.', "/");

    let value: String = value
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '/'))
        .collect();

    truncate(&value, max_length).trim_matches('.').to_string()
}

pub fn prepare_email(value: Option<&str>) -> String {
    value.unwrap_or_default().trim().replace('@', ".")
}

/// Strip any stack of reply/forward prefixes.
pub fn prepare_subject(value: &str) -> &str {
    let mut value = value.trim();
    'strip: loop {
        for prefix in SUBJECT_PREFIXES {
            let matches = value
                .get(..prefix.len())
                .is_some_and(|head| head.eq_ignore_ascii_case(prefix));
            if matches {
                value = value[prefix.len()..].trim();
                continue 'strip;
            }
        }
        return value;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Local, TimeZone};

    fn sample_mail() -> MailMessage {
        MailMessage {
            uid: 42,
            raw: b"raw".to_vec(),
            date: Local.with_ymd_and_hms(2024, 1, 15, 9, 5, 0).unwrap(),
            subject: "Re: FWD: Über die Brücke_next week".to_string(),
            from: Some("alice@example.com".to_string()),
            to: Some("bob@example.org".to_string()),
        }
    }

    #[test]
    fn test_prepare_text() {
        assert_eq!(prepare_text("  Hello World  ", 32), "Hello.World");
        assert_eq!(prepare_text("a - b", 32), "a-b");
        assert_eq!(prepare_text("what?!", 32), "what");
        assert_eq!(prepare_text("Grüße", 32), "Grusse");
        assert_eq!(prepare_text("abcdefghij", 4), "abcd");
        assert_eq!(prepare_text("", 32), "");
    }

    #[test]
    fn test_prepare_subject_strips_stacked_prefixes() {
        assert_eq!(prepare_subject("Re: Fwd: AW: hello"), "hello");
        assert_eq!(prepare_subject("Review"), "Review");
        assert_eq!(prepare_subject("  fw:re:x "), "x");
    }

    #[test]
    fn test_prepare_path_and_email() {
        assert_eq!(prepare_path("Archive.2023", 32), "Archive/2023");
        assert_eq!(prepare_path("Sent Items", 32), "SentItems");
        assert_eq!(prepare_email(Some("a@b.c")), "a.b.c");
        assert_eq!(prepare_email(None), "");
    }

    #[test]
    fn test_extract_and_format_default_template() {
        let attributes = Attributes::extract(&sample_mail(), "me@example.com", "INBOX.Archive");

        assert_eq!(attributes.get(NamingKey::Folder), "me@example.com/Archive");
        assert_eq!(attributes.get(NamingKey::From), "alice.example.com");
        assert_eq!(attributes.get(NamingKey::Subject), "Uber.die.Brucke.next.week");

        let path = format_path(DEFAULT_PATH_TEMPLATE, &attributes).unwrap();
        assert_eq!(
            path,
            "./downloads/2024-01/20240115-0905-42-Uber.die.Brucke.next.week.eml"
        );
    }

    #[test]
    fn test_folder_is_nested_under_username() {
        let attributes = Attributes::extract(&sample_mail(), "me", "INBOX");
        assert_eq!(attributes.get(NamingKey::Folder), "me/INBOX");

        let attributes = Attributes::extract(&sample_mail(), "me", "");
        assert_eq!(attributes.get(NamingKey::Folder), "me");
    }

    #[test]
    fn test_format_path_errors_and_escapes() {
        let attributes = Attributes::default();
        assert_eq!(
            format_path("{NOPE}.eml", &attributes),
            Err(NamingError::UnknownKey("NOPE".to_string()))
        );
        assert!(matches!(
            format_path("{YEAR", &attributes),
            Err(NamingError::Unbalanced(_))
        ));
        assert_eq!(format_path("{{x}}", &attributes).unwrap(), "{x}");
    }

    #[test]
    fn test_join_path() {
        let pivot = Path::new("/srv/backup");
        assert_eq!(
            join_path(pivot, "./downloads/a.eml"),
            PathBuf::from("/srv/backup/downloads/a.eml")
        );
        assert_eq!(join_path(pivot, "/tmp/x/../a.eml"), PathBuf::from("/tmp/a.eml"));
    }
}
