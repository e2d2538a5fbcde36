use chrono::{DateTime, Datelike, FixedOffset, Local, Utc};
use mail_parser::HeaderValue;

/// A fetched message: its raw RFC 822 bytes plus the header fields used for naming.
#[derive(Debug, Clone)]
pub struct MailMessage {
    pub uid: u32,
    pub raw: Vec<u8>,
    pub date: DateTime<Local>,
    pub subject: String,
    pub from: Option<String>,
    pub to: Option<String>,
}

impl MailMessage {
    /// Build a message from the bytes the server returned.
    ///
    /// The `Date:` header wins over the server's internal date; messages
    /// with neither, or dated before 1971, are stamped with the Unix epoch.
    pub fn from_raw(uid: u32, raw: Vec<u8>, internal_date: Option<DateTime<FixedOffset>>) -> Self {
        let (subject, from, to, header_date) = match mail_parser::Message::parse(&raw) {
            Some(parsed) => {
                let header_date = parsed
                    .date()
                    .and_then(|date| DateTime::<Utc>::from_timestamp(date.to_timestamp(), 0));
                (
                    parsed.subject().unwrap_or_default().to_string(),
                    first_address(parsed.from()),
                    first_address(parsed.to()),
                    header_date,
                )
            }
            None => {
                log::debug!("Message {} could not be parsed by mail_parser", uid);
                (String::new(), None, None, None)
            }
        };

        let date = header_date
            .or_else(|| internal_date.map(|d| d.with_timezone(&Utc)))
            .unwrap_or_default();

        Self {
            uid,
            raw,
            date: normalize_date(date),
            subject,
            from,
            to,
        }
    }
}

/// Clamp implausibly old dates to the epoch and move to local time.
pub fn normalize_date(date: DateTime<Utc>) -> DateTime<Local> {
    let date = if date.year() < 1971 { DateTime::<Utc>::default() } else { date };
    date.with_timezone(&Local)
}

fn first_address(value: &HeaderValue) -> Option<String> {
    let addr = match value {
        HeaderValue::Address(addr) => Some(addr),
        HeaderValue::AddressList(addrs) => addrs.first(),
        _ => None,
    }?;
    addr.address
        .as_ref()
        .map(|s| s.to_string())
        .filter(|s| !s.is_empty())
}
