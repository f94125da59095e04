//! Email records as they arrive from the mail source and as they leave the normalizer.


use anyhow::{Context, Result};
use base64::Engine as _;
use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::Path;
use tracing::{debug, warn};

pub const UNKNOWN_SENDER: &str = "Unknown";
pub const NO_SUBJECT: &str = "No Subject";

/// Metadata fields longer than this are cut before being stored
pub const MAX_METADATA_CHARS: usize = 100;

const URL_SAFE_LENIENT: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// One fetched email, exactly as the mail source hands it over.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RawEmail {
    pub id: String,
    #[serde(default, alias = "from")]
    pub sender: String,
    #[serde(default)]
    pub subject: String,
    /// Date header, RFC 2822 or RFC 3339
    #[serde(default, alias = "timestamp")]
    pub date: Option<String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub content_type: Option<String>,
    /// MIME parts, used when `body` is absent
    #[serde(default)]
    pub parts: Vec<BodyPart>,
    #[serde(default)]
    pub labels: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BodyPart {
    pub mime_type: String,
    pub data: String,
    #[serde(default)]
    pub encoding: BodyEncoding,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BodyEncoding {
    #[default]
    Plain,
    Base64url,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedBody {
    pub text: String,
    pub is_html: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BodySelection {
    pub body: Option<SelectedBody>,
    /// Parts that were skipped because their payload could not be decoded
    pub undecodable_parts: usize,
}

impl RawEmail {
    /// Pick the body to normalize: the inline body if present, otherwise the first
    /// decodable `text/plain` part, otherwise the first decodable `text/html` part.
    #[inline]
    pub fn select_body(&self) -> BodySelection {
        if let Some(body) = self.body.as_ref().filter(|b| !b.trim().is_empty()) {
            let is_html = self
                .content_type
                .as_deref()
                .is_some_and(|ct| ct.to_ascii_lowercase().contains("html"));
            return BodySelection {
                body: Some(SelectedBody {
                    text: body.clone(),
                    is_html,
                }),
                undecodable_parts: 0,
            };
        }

        let mut undecodable_parts = 0;
        let mut plain = None;
        let mut html = None;

        for part in &self.parts {
            let mime = part.mime_type.to_ascii_lowercase();
            let slot = if mime.starts_with("text/plain") {
                &mut plain
            } else if mime.starts_with("text/html") {
                &mut html
            } else {
                continue;
            };
            if slot.is_some() {
                continue;
            }
            match part.decode() {
                Some(text) => *slot = Some(text),
                None => {
                    debug!("Could not decode {} part of {}", part.mime_type, self.id);
                    undecodable_parts += 1;
                }
            }
        }

        let body = plain
            .map(|text| SelectedBody {
                text,
                is_html: false,
            })
            .or_else(|| {
                html.map(|text| SelectedBody {
                    text,
                    is_html: true,
                })
            });

        BodySelection {
            body,
            undecodable_parts,
        }
    }
}

impl BodyPart {
    /// Decode the payload. Invalid UTF-8 is replaced rather than rejected.
    #[inline]
    pub fn decode(&self) -> Option<String> {
        match self.encoding {
            BodyEncoding::Plain => Some(self.data.clone()),
            BodyEncoding::Base64url => {
                let compact: String = self.data.split_whitespace().collect();
                URL_SAFE_LENIENT
                    .decode(compact.as_bytes())
                    .ok()
                    .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
            }
        }
    }
}

/// A normalized email. Immutable once built; a changed email with the same id
/// produces a new `Message` that supersedes the old one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: String,
    pub sender: String,
    pub subject: String,
    pub timestamp: Option<DateTime<Utc>>,
    pub labels: Vec<String>,
    pub raw_body: String,
    pub normalized_text: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct EmailMetadata {
    pub sender: String,
    pub subject: String,
    pub timestamp: Option<DateTime<Utc>>,
    pub labels: Vec<String>,
}

impl Message {
    /// Text handed to the embedder. The subject is included so that emails with
    /// an empty body are still searchable.
    #[inline]
    pub fn embedding_text(&self) -> String {
        if self.normalized_text.is_empty() {
            format!("Subject: {}", self.subject)
        } else {
            format!("Subject: {}\n\n{}", self.subject, self.normalized_text)
        }
    }

    /// Whether there is anything worth embedding beyond the placeholder subject
    #[inline]
    pub fn has_content(&self) -> bool {
        !self.normalized_text.trim().is_empty() || self.subject != NO_SUBJECT
    }

    #[inline]
    pub fn metadata(&self) -> EmailMetadata {
        EmailMetadata {
            sender: self.sender.clone(),
            subject: self.subject.clone(),
            timestamp: self.timestamp,
            labels: self.labels.clone(),
        }
    }

    /// Hex SHA-256 over everything that ends up in an index entry.
    #[inline]
    pub fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.sender.as_bytes());
        hasher.update([0]);
        hasher.update(self.subject.as_bytes());
        hasher.update([0]);
        if let Some(timestamp) = self.timestamp {
            hasher.update(timestamp.to_rfc3339().as_bytes());
        }
        hasher.update([0]);
        for label in &self.labels {
            hasher.update(label.as_bytes());
            hasher.update([1]);
        }
        hasher.update([0]);
        hasher.update(self.normalized_text.as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

/// Parse a Date header the way mail clients write them.
///
/// Tries RFC 2822, RFC 2822 with a trailing `(zone comment)` removed, RFC 3339,
/// and finally the RFC 2822 layout without a zone, read as UTC.
#[inline]
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }

    if let Ok(parsed) = DateTime::parse_from_rfc2822(value) {
        return Some(parsed.with_timezone(&Utc));
    }

    let without_comment = value.split('(').next().unwrap_or(value).trim();
    if let Ok(parsed) = DateTime::parse_from_rfc2822(without_comment) {
        return Some(parsed.with_timezone(&Utc));
    }

    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Some(parsed.with_timezone(&Utc));
    }

    NaiveDateTime::parse_from_str(without_comment, "%a, %d %b %Y %H:%M:%S")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Cut to at most `max_chars` characters on a char boundary.
#[inline]
pub fn truncate_chars(value: &str, max_chars: usize) -> String {
    value.chars().take(max_chars).collect()
}

/// Read a mailbox export: a JSON array of emails, or one email per line for
/// `.jsonl` / `.ndjson` files. Malformed lines are logged and skipped.
#[inline]
pub fn read_emails(path: &Path) -> Result<Vec<RawEmail>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read mailbox file: {}", path.display()))?;

    let is_line_delimited = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("jsonl") || ext.eq_ignore_ascii_case("ndjson"));

    if is_line_delimited {
        Ok(parse_json_lines(&content))
    } else {
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse mailbox file: {}", path.display()))
    }
}

#[inline]
pub fn parse_json_lines(content: &str) -> Vec<RawEmail> {
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .filter_map(|(number, line)| match serde_json::from_str(line) {
            Ok(email) => Some(email),
            Err(e) => {
                warn!("Skipping malformed email on line {}: {}", number + 1, e);
                None
            }
        })
        .collect()
}
