//! # Message envelope
//!
//! Builds the RFC 5322 text that is written during the DATA phase. Field
//! values end up inside header lines and SMTP commands, so anything that
//! could start a new line there is rejected when the envelope is built.

use std::borrow::Cow;
use std::sync::LazyLock;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use rand::distributions::{Alphanumeric, DistString};
use regex::Regex;
use thiserror::Error;

// Tab is the only control character allowed in a header value.
static HEADER_UNSAFE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[\x00-\x08\x0A-\x1F\x7F]").expect("valid header regex")
});

static ADDRESS_UNSAFE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[\s<>\x00-\x1F\x7F]").expect("valid address regex")
});

/// Raw bytes per RFC 2047 encoded word, keeps every word under 76 chars.
const ENCODED_WORD_CHUNK: usize = 45;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("sender address contains characters not allowed in a header")]
    Sender,
    #[error("recipient address contains whitespace, angle brackets or control characters")]
    Recipient,
    #[error("subject contains line breaks or control characters")]
    Subject,
}

/// A single rendered-on-demand message, built once per request.
#[derive(Debug, Clone)]
pub struct MailEnvelope {
    from: String,
    to: String,
    subject: String,
    body: String,
    date: DateTime<Utc>,
    message_id: String,
}

impl MailEnvelope {
    pub fn new(
        from: &str,
        to: &str,
        subject: &str,
        body: &str,
    ) -> Result<Self, EnvelopeError> {
        let from = from.trim();
        let to = to.trim();

        if ADDRESS_UNSAFE.is_match(from) {
            return Err(EnvelopeError::Sender);
        }
        if ADDRESS_UNSAFE.is_match(to) {
            return Err(EnvelopeError::Recipient);
        }
        if HEADER_UNSAFE.is_match(subject) {
            return Err(EnvelopeError::Subject);
        }

        let domain = from
            .rsplit_once('@')
            .map(|(_, domain)| domain)
            .filter(|domain| !domain.is_empty())
            .unwrap_or("localhost");
        let message_id = format!(
            "<{}@{}>",
            Alphanumeric.sample_string(&mut rand::thread_rng(), 24),
            domain
        );

        Ok(MailEnvelope {
            from: from.to_owned(),
            to: to.to_owned(),
            subject: subject.to_owned(),
            body: normalize_line_endings(body),
            date: Utc::now(),
            message_id,
        })
    }

    pub fn from(&self) -> &str {
        &self.from
    }

    pub fn to(&self) -> &str {
        &self.to
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    /// The full message as sent after `DATA`, without dot-stuffing.
    pub fn render(&self) -> Vec<u8> {
        format!(
            concat!(
                "From: {}\r\n",
                "To: {}\r\n",
                "Subject: {}\r\n",
                "Date: {}\r\n",
                "Message-ID: {}\r\n",
                "MIME-Version: 1.0\r\n",
                "Content-Type: text/plain; charset=\"utf-8\"\r\n",
                "Content-Transfer-Encoding: 8bit\r\n",
                "\r\n",
                "{}"
            ),
            self.from,
            self.to,
            encode_header_value(&self.subject),
            self.date.to_rfc2822(),
            self.message_id,
            self.body
        )
        .into_bytes()
    }
}

/// Turns every `\n`, `\r` and `\r\n` into `\r\n`.
///
/// ```
/// # use mail_relay::envelope::normalize_line_endings;
/// assert_eq!(normalize_line_endings("a\nb\r\nc\rd"), "a\r\nb\r\nc\r\nd");
/// ```
pub fn normalize_line_endings(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + text.len() / 16);
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\r' => {
                if chars.peek() == Some(&'\n') {
                    chars.next();
                }
                out.push_str("\r\n");
            }
            '\n' => out.push_str("\r\n"),
            _ => out.push(c),
        }
    }
    out
}

/// RFC 2047 `B` encoding for header values that are not plain ASCII.
fn encode_header_value(value: &str) -> Cow<'_, str> {
    if value.is_ascii() {
        return Cow::Borrowed(value);
    }

    let mut words = Vec::new();
    let mut chunk = String::new();
    for c in value.chars() {
        if chunk.len() + c.len_utf8() > ENCODED_WORD_CHUNK {
            words.push(format!("=?utf-8?B?{}?=", STANDARD.encode(&chunk)));
            chunk.clear();
        }
        chunk.push(c);
    }
    if !chunk.is_empty() {
        words.push(format!("=?utf-8?B?{}?=", STANDARD.encode(&chunk)));
    }

    Cow::Owned(words.join("\r\n "))
}
