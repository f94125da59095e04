//! Turns raw email bodies into clean text suitable for embedding.
//!
//! Normalization never fails. Problems are recorded on the result as a
//! [`NormalizationDegraded`] and the best text that could be recovered is kept.


use fancy_regex::Regex;
use itertools::Itertools;
use scraper::node::{Element, Node};
use scraper::{ElementRef, Html};
use std::borrow::Cow;
use std::sync::LazyLock;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::IndexingConfig;
use crate::email::{
    MAX_METADATA_CHARS, Message, NO_SUBJECT, RawEmail, UNKNOWN_SENDER, parse_timestamp,
    truncate_chars,
};

/// Lines longer than this are not treated as part of a signature block
const SIGNATURE_LINE_MAX_CHARS: usize = 72;

const SKIPPED_TAGS: &[&str] = &["script", "style", "head", "noscript", "template", "title"];

const BLOCK_TAGS: &[&str] = &[
    "address", "article", "aside", "blockquote", "div", "dl", "dt", "dd", "footer", "form", "h1",
    "h2", "h3", "h4", "h5", "h6", "header", "hr", "li", "main", "nav", "ol", "p", "pre", "section",
    "table", "tbody", "thead", "tfoot", "tr", "ul",
];

const QUOTE_CONTAINER_CLASSES: &[&str] = &["gmail_quote", "yahoo_quoted", "moz-cite-prefix"];
const QUOTE_CONTAINER_IDS: &[&str] = &["divRplyFwdMsg", "appendonsend"];

static HTML_SNIFF: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)<(?:!doctype|html|head|body|div|p|br|table|span|a|font|td)\b[^>]*>")
        .expect("valid regex")
});

// An unclosed block runs to the end of the input.
static SCRIPT_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<script\b[^>]*>.*?(?:</script\s*>|\z)").expect("valid regex")
});

static STYLE_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<style\b[^>]*>.*?(?:</style\s*>|\z)").expect("valid regex")
});

static ANY_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<[^>]*>").expect("valid regex"));

static REPLY_HEADER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(?:on\s.{1,300}\bwrote:|-{2,}\s*original message\s*-{2,})$")
        .expect("valid regex")
});

static OUTLOOK_HEADER_FIELD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^(?:sent|date|to|subject):\s").expect("valid regex"));

static SENT_FROM_TRAILER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(?:sent from my\s.+|get outlook for\s.+)$").expect("valid regex")
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizerOptions {
    pub strip_quoted_replies: bool,
    pub strip_signatures: bool,
    pub max_signature_lines: usize,
}

impl Default for NormalizerOptions {
    fn default() -> Self {
        Self {
            strip_quoted_replies: true,
            strip_signatures: true,
            max_signature_lines: 6,
        }
    }
}

impl From<&IndexingConfig> for NormalizerOptions {
    #[inline]
    fn from(config: &IndexingConfig) -> Self {
        Self {
            strip_quoted_replies: config.strip_quoted_replies,
            strip_signatures: config.strip_signatures,
            max_signature_lines: config.max_signature_lines,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DegradeReason {
    #[error("{0} body part(s) could not be decoded")]
    UndecodableBody(usize),
    #[error("HTML body yielded no text, tags were stripped instead")]
    HtmlFallback,
    #[error("unparseable date {0:?}")]
    UnparseableTimestamp(String),
    #[error("body is empty after cleaning")]
    EmptyBody,
    #[error("sender is missing")]
    MissingSender,
    #[error("subject is missing")]
    MissingSubject,
}

/// Non-fatal: the message is still indexed with whatever text survived.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("email {id} normalized with degradations: {}", .reasons.iter().join("; "))]
pub struct NormalizationDegraded {
    pub id: String,
    pub reasons: Vec<DegradeReason>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Normalized {
    pub message: Message,
    pub degraded: Option<NormalizationDegraded>,
}

#[inline]
pub fn normalize(raw: &RawEmail) -> Normalized {
    normalize_with(raw, &NormalizerOptions::default())
}

#[inline]
pub fn normalize_with(raw: &RawEmail, options: &NormalizerOptions) -> Normalized {
    let mut reasons = Vec::new();

    let sender = raw.sender.trim();
    let sender = if sender.is_empty() {
        reasons.push(DegradeReason::MissingSender);
        UNKNOWN_SENDER.to_string()
    } else {
        truncate_chars(sender, MAX_METADATA_CHARS)
    };

    let subject = raw.subject.split_whitespace().join(" ");
    let subject = if subject.is_empty() {
        reasons.push(DegradeReason::MissingSubject);
        NO_SUBJECT.to_string()
    } else {
        truncate_chars(&subject, MAX_METADATA_CHARS)
    };

    let timestamp = raw.date.as_deref().and_then(|date| {
        let parsed = parse_timestamp(date);
        if parsed.is_none() && !date.trim().is_empty() {
            reasons.push(DegradeReason::UnparseableTimestamp(date.to_string()));
        }
        parsed
    });

    let selection = raw.select_body();
    if selection.undecodable_parts > 0 {
        reasons.push(DegradeReason::UndecodableBody(selection.undecodable_parts));
    }

    let (raw_body, normalized_text) = match selection.body {
        Some(body) => {
            let text = if body.is_html || looks_like_html(&body.text) {
                let extracted = html_to_text(&body.text, options.strip_quoted_replies);
                if extracted.trim().is_empty() {
                    let stripped = strip_tags(&body.text);
                    if !stripped.trim().is_empty() {
                        reasons.push(DegradeReason::HtmlFallback);
                    }
                    stripped
                } else {
                    extracted
                }
            } else {
                body.text.clone()
            };
            (body.text, clean_text(&text, options))
        }
        None => (String::new(), String::new()),
    };

    if normalized_text.is_empty() {
        reasons.push(DegradeReason::EmptyBody);
    }

    let degraded = if reasons.is_empty() {
        None
    } else {
        let degraded = NormalizationDegraded {
            id: raw.id.clone(),
            reasons,
        };
        warn!("{}", degraded);
        Some(degraded)
    };

    debug!(
        "Normalized email {} ({} -> {} chars)",
        raw.id,
        raw_body.len(),
        normalized_text.len()
    );

    Normalized {
        message: Message {
            id: raw.id.clone(),
            sender,
            subject,
            timestamp,
            labels: raw.labels.clone(),
            raw_body,
            normalized_text,
        },
        degraded,
    }
}

fn looks_like_html(text: &str) -> bool {
    HTML_SNIFF.is_match(text).unwrap_or(false)
}

/// Visible text of an HTML document, one line per block element.
#[inline]
pub fn html_to_text(html: &str, skip_quotes: bool) -> String {
    let document = Html::parse_document(html);
    let mut out = String::new();
    collect_text(document.root_element(), skip_quotes, &mut out);
    out
}

fn collect_text(element: ElementRef<'_>, skip_quotes: bool, out: &mut String) {
    for child in element.children() {
        match child.value() {
            Node::Text(text) => push_inline_text(out, text),
            Node::Element(el) => {
                let name = el.name();
                if SKIPPED_TAGS.contains(&name) || (skip_quotes && is_quote_container(el)) {
                    continue;
                }
                if name == "br" {
                    trim_trailing_spaces(out);
                    out.push('\n');
                    continue;
                }
                let Some(child_element) = ElementRef::wrap(child) else {
                    continue;
                };
                let is_block = BLOCK_TAGS.contains(&name);
                if is_block {
                    push_line_break(out);
                }
                if matches!(name, "td" | "th") {
                    push_inline_text(out, " ");
                }
                collect_text(child_element, skip_quotes, out);
                if is_block {
                    push_line_break(out);
                }
            }
            _ => {}
        }
    }
}

/// Append text with HTML whitespace semantics: any run of whitespace is one space.
fn push_inline_text(out: &mut String, text: &str) {
    for c in text.chars() {
        if c.is_whitespace() {
            if !(out.is_empty() || out.ends_with('\n') || out.ends_with(' ')) {
                out.push(' ');
            }
        } else {
            out.push(c);
        }
    }
}

fn trim_trailing_spaces(out: &mut String) {
    while out.ends_with(' ') {
        out.pop();
    }
}

fn push_line_break(out: &mut String) {
    trim_trailing_spaces(out);
    if !out.is_empty() && !out.ends_with('\n') {
        out.push('\n');
    }
}

fn is_quote_container(el: &Element) -> bool {
    el.name() == "blockquote"
        || el
            .classes()
            .any(|class| QUOTE_CONTAINER_CLASSES.contains(&class))
        || el.id().is_some_and(|id| QUOTE_CONTAINER_IDS.contains(&id))
}

/// Regex tag stripping for markup the HTML walker could not make sense of.
#[inline]
pub fn strip_tags(html: &str) -> String {
    let without_scripts = replace_or_keep(&SCRIPT_BLOCK, html);
    let without_styles = replace_or_keep(&STYLE_BLOCK, &without_scripts);
    let without_tags = replace_or_keep(&ANY_TAG, &without_styles);
    decode_basic_entities(&without_tags)
}

fn replace_or_keep<'t>(pattern: &Regex, text: &'t str) -> Cow<'t, str> {
    pattern.try_replacen(text, 0, " ").unwrap_or_else(|e| {
        warn!("Tag stripping skipped a pass on {} bytes: {}", text.len(), e);
        Cow::Borrowed(text)
    })
}

fn decode_basic_entities(text: &str) -> String {
    text.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

/// Line-level cleanup shared by plain-text and extracted HTML bodies.
#[inline]
pub fn clean_text(text: &str, options: &NormalizerOptions) -> String {
    let text = text.replace("\r\n", "\n").replace('\r', "\n");
    let mut lines: Vec<&str> = text.lines().collect();

    if options.strip_quoted_replies {
        lines = strip_quoted_replies(&lines);
    }
    if options.strip_signatures {
        lines = strip_signature(lines, options.max_signature_lines);
    }

    collapse_whitespace(&lines)
}

fn strip_quoted_replies<'a>(lines: &[&'a str]) -> Vec<&'a str> {
    let mut kept = Vec::with_capacity(lines.len());

    for (i, line) in lines.iter().enumerate() {
        let trimmed = line.trim();

        if REPLY_HEADER.is_match(trimmed).unwrap_or(false) {
            break;
        }

        // Reply headers wrapped by the sending client: "On Tue, ... Alice" / "<alice@x> wrote:"
        if trimmed.starts_with("On ")
            && lines
                .get(i + 1)
                .is_some_and(|next| next.trim_end().ends_with("wrote:"))
        {
            break;
        }

        // Outlook: "From: ..." immediately followed by "Sent:" / "To:" fields
        if trimmed.starts_with("From:")
            && lines.get(i + 1).is_some_and(|next| {
                OUTLOOK_HEADER_FIELD
                    .is_match(next.trim())
                    .unwrap_or(false)
            })
        {
            while kept
                .last()
                .is_some_and(|prev: &&str| is_rule_line(prev.trim()))
            {
                kept.pop();
            }
            break;
        }

        if trimmed.starts_with('>') {
            continue;
        }

        kept.push(*line);
    }

    kept
}

fn is_rule_line(line: &str) -> bool {
    line.len() >= 5 && line.chars().all(|c| c == '_' || c == '-')
}

fn is_signature_separator(line: &str) -> bool {
    line == "-- " || matches!(line.trim(), "--" | "__")
}

fn strip_signature(mut lines: Vec<&str>, max_lines: usize) -> Vec<&str> {
    if let Some(pos) = lines.iter().rposition(|line| is_signature_separator(line)) {
        let is_short_block = {
            let tail: Vec<&str> = lines
                .iter()
                .skip(pos + 1)
                .map(|line| line.trim())
                .filter(|line| !line.is_empty())
                .collect();
            tail.len() <= max_lines
                && tail
                    .iter()
                    .all(|line| line.chars().count() <= SIGNATURE_LINE_MAX_CHARS)
        };
        if is_short_block {
            lines.truncate(pos);
        }
    }

    loop {
        while lines.last().is_some_and(|line| line.trim().is_empty()) {
            lines.pop();
        }
        match lines.last() {
            Some(line) if SENT_FROM_TRAILER.is_match(line.trim()).unwrap_or(false) => {
                lines.pop();
            }
            _ => break,
        }
    }

    lines
}

fn collapse_whitespace(lines: &[&str]) -> String {
    let mut out = String::new();
    let mut pending_break = false;

    for line in lines {
        let collapsed = line.split_whitespace().join(" ");
        if collapsed.is_empty() {
            pending_break = !out.is_empty();
            continue;
        }
        if !out.is_empty() {
            out.push_str(if pending_break { "\n\n" } else { "\n" });
        }
        out.push_str(&collapsed);
        pending_break = false;
    }

    out
}
