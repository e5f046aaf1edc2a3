//! Captured message model
//!
//! A message is immutable once stored: the raw source bytes are kept
//! verbatim as received on the wire, and `subject`/`date` are extracted
//! from the headers once, at store time. The `seen` flag is the only
//! attribute that changes afterwards.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use mailparse::MailHeaderMap;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Headers-only view of a captured message, as returned by listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct MessageSummary {
    pub mailbox: String,
    pub id: String,
    pub from: String,
    pub to: Vec<String>,
    pub subject: String,
    pub date: DateTime<Utc>,
    pub size: u64,
    pub seen: bool,
}

/// A captured message including its raw source.
#[derive(Debug, Clone)]
pub struct Message {
    pub summary: MessageSummary,
    /// The complete DATA payload as received (after dot-unstuffing).
    pub source: Vec<u8>,
}

/// Envelope plus source captured on the ingress path, not yet assigned
/// an id. Construction extracts `subject` and `date` from the headers.
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub mailbox: String,
    pub from: String,
    pub to: Vec<String>,
    pub subject: String,
    pub date: DateTime<Utc>,
    pub source: Vec<u8>,
}

impl IncomingMessage {
    /// Capture a message addressed to one canonical mailbox.
    ///
    /// `from` and `to` are the SMTP envelope participants, not values
    /// taken from the headers. Header extraction is best-effort: a
    /// missing or unparseable `Date:` falls back to the receive time.
    #[must_use]
    pub fn capture(mailbox: String, from: &str, to: &[String], source: Vec<u8>) -> Self {
        let (subject, date) = extract_headers(&source);
        Self {
            mailbox,
            from: from.to_string(),
            to: to.to_vec(),
            subject,
            date: date.unwrap_or_else(Utc::now),
            source,
        }
    }

    /// Finalize into a stored message once the backend has assigned an id.
    #[must_use]
    pub fn into_message(self, id: String) -> Message {
        let size = self.source.len() as u64;
        Message {
            summary: MessageSummary {
                mailbox: self.mailbox,
                id,
                from: self.from,
                to: self.to,
                subject: self.subject,
                date: self.date,
                size,
                seen: false,
            },
            source: self.source,
        }
    }
}

/// Parsed view of a message for the REST API: the summary fields plus
/// best-effort text/html bodies and a header multimap. The stored
/// source is never re-encoded; this is a read-side projection only.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct ParsedMessage {
    #[serde(flatten)]
    pub summary: MessageSummary,
    pub body_text: String,
    pub body_html: String,
    pub headers: BTreeMap<String, Vec<String>>,
}

impl ParsedMessage {
    pub fn from_message(message: &Message) -> Result<Self> {
        let mail = mailparse::parse_mail(&message.source)
            .map_err(|e| Error::BadInput(format!("unparseable message source: {e}")))?;

        let mut headers: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for header in &mail.headers {
            headers
                .entry(header.get_key())
                .or_default()
                .push(header.get_value());
        }

        let mut body_text = String::new();
        let mut body_html = String::new();
        collect_bodies(&mail, &mut body_text, &mut body_html);

        Ok(Self {
            summary: message.summary.clone(),
            body_text,
            body_html,
            headers,
        })
    }
}

/// Walk the MIME tree and pick the first text/plain and text/html parts.
fn collect_bodies(part: &mailparse::ParsedMail<'_>, text: &mut String, html: &mut String) {
    if part.subparts.is_empty() {
        match part.ctype.mimetype.as_str() {
            "text/plain" if text.is_empty() => {
                *text = part.get_body().unwrap_or_default();
            }
            "text/html" if html.is_empty() => {
                *html = part.get_body().unwrap_or_default();
            }
            _ => {}
        }
        return;
    }
    for sub in &part.subparts {
        collect_bodies(sub, text, html);
    }
}

/// Best-effort `Subject:` and `Date:` extraction from raw source.
fn extract_headers(source: &[u8]) -> (String, Option<DateTime<Utc>>) {
    let Ok(mail) = mailparse::parse_mail(source) else {
        return (String::new(), None);
    };

    let subject = mail.headers.get_first_value("Subject").unwrap_or_default();
    let date = mail
        .headers
        .get_first_value("Date")
        .and_then(|raw| mailparse::dateparse(&raw).ok())
        .and_then(|secs| DateTime::from_timestamp(secs, 0));

    (subject, date)
}
