//! Feature extraction
//!
//! Pure, deterministic transformation from the raw message fields to the
//! `Features` block every heuristic scorer reads. No I/O, no shared state;
//! extracting twice from the same message yields identical output.

use crate::Message;
use serde::Serialize;
use zpam_common::config::ListsConfig;
use zpam_common::{extract_address, extract_domain};

/// Header names whose presence marks bulk-mailer tooling
const SUSPICIOUS_HEADERS: &[&str] = &[
    "x-advertisement",
    "x-bulk-email",
    "x-mass-mailing",
    "x-distribution",
    "x-spam-flag",
    "x-campaign-id",
];

/// Structural and statistical features of one message
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Features {
    pub subject_length: usize,
    pub subject_caps_ratio: f64,
    pub subject_exclamations: usize,
    pub body_length: usize,
    pub body_caps_ratio: f64,
    pub body_exclamations: usize,
    pub url_count: usize,
    pub html_tag_density: f64,
    pub attachment_count: usize,
    pub suspicious_header_count: usize,
    pub has_encoding_issues: bool,
    pub from_to_mismatch: bool,
    pub reputable_domain: bool,
}

pub struct FeatureExtractor {
    trusted_domains: Vec<String>,
}

impl FeatureExtractor {
    pub fn new(lists: &ListsConfig) -> Self {
        Self {
            trusted_domains: lists
                .trusted_domains
                .iter()
                .map(|d| d.to_lowercase())
                .collect(),
        }
    }

    pub fn extract(&self, message: &Message) -> Features {
        let subject = message.subject();
        let body = message.body_text();

        let from_address = extract_address(message.from_header());
        let from_to_mismatch = !from_address.is_empty()
            && !message.envelope.sender.is_empty()
            && from_address != message.envelope.sender;

        let sender_domain = if message.envelope.sender.is_empty() {
            extract_domain(&from_address)
        } else {
            message.sender_domain()
        };

        Features {
            subject_length: subject.chars().count(),
            subject_caps_ratio: caps_ratio(subject),
            subject_exclamations: subject.matches('!').count(),
            body_length: body.chars().count(),
            body_caps_ratio: caps_ratio(&body),
            body_exclamations: body.matches('!').count(),
            url_count: count_urls(&body),
            html_tag_density: html_tag_density(&body),
            attachment_count: message.attachments.len(),
            suspicious_header_count: count_suspicious_headers(message),
            has_encoding_issues: has_encoding_issues(subject) || has_encoding_issues(&body),
            from_to_mismatch,
            reputable_domain: self
                .trusted_domains
                .iter()
                .any(|d| d == &sender_domain),
        }
    }
}

/// Uppercase letters over total letters; 0 when there are no letters.
fn caps_ratio(text: &str) -> f64 {
    let mut letters = 0usize;
    let mut upper = 0usize;
    for c in text.chars() {
        if c.is_alphabetic() {
            letters += 1;
            if c.is_uppercase() {
                upper += 1;
            }
        }
    }
    if letters == 0 {
        0.0
    } else {
        upper as f64 / letters as f64
    }
}

/// Case-insensitive occurrences of the URL scheme markers.
fn count_urls(text: &str) -> usize {
    let lower = text.to_lowercase();
    ["http://", "https://", "ftp://", "www."]
        .iter()
        .map(|marker| lower.matches(marker).count())
        .sum()
}

/// Angle brackets over body length; 0 for an empty body.
fn html_tag_density(body: &str) -> f64 {
    let len = body.chars().count();
    if len == 0 {
        return 0.0;
    }
    let brackets = body.chars().filter(|c| *c == '<' || *c == '>').count();
    brackets as f64 / len as f64
}

fn count_suspicious_headers(message: &Message) -> usize {
    message
        .headers
        .raw()
        .iter()
        .filter(|(name, _)| {
            let lower = name.to_lowercase();
            SUSPICIOUS_HEADERS.contains(&lower.as_str())
        })
        .count()
}

/// MIME encoded-word markers or the replacement character surviving decode.
fn has_encoding_issues(text: &str) -> bool {
    text.contains("=?") || text.contains("?=") || text.contains('\u{FFFD}')
}
