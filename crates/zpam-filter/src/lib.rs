//! ZPAM classification core
//!
//! Everything between the milter session and the wire: the message model,
//! feature extraction, the authentication validator, the frequency tracker,
//! the plugin orchestrator, and the score aggregator that fans all of them
//! out per message and folds the results into one normalized 1-5 verdict.

use mail_parser::MimeHeaders;
use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use zpam_bayes::BayesStore;
use zpam_common::config::ZpamConfig;
use zpam_common::{extract_domain, normalize_address};
use zpam_dns::DnsCache;

pub mod aggregator;
pub mod auth;
pub mod features;
pub mod frequency;
pub mod keywords;
pub mod plugin;

pub use aggregator::normalize_score;
pub use auth::{AuthResult, AuthValidator};
pub use features::{FeatureExtractor, Features};
pub use frequency::{FrequencyResult, FrequencyTracker};
pub use keywords::KeywordMatcher;
pub use plugin::{PluginOrchestrator, PluginResult, ScorerPlugin};

// =============================================================================
// Message model
// =============================================================================

/// SMTP envelope captured from the milter session
#[derive(Debug, Clone, Default)]
pub struct Envelope {
    /// Normalized (lowercased, bracket-stripped) envelope sender
    pub sender: String,
    pub recipients: Vec<String>,
    pub helo: String,
    pub peer_host: Option<String>,
    pub peer_addr: Option<IpAddr>,
}

/// Case-insensitive header map.
///
/// The map keeps the last value written for each name, which is what the
/// inspected fields want; the raw ordered list is retained for routing
/// analysis over the full `Received` chain.
#[derive(Debug, Clone, Default)]
pub struct HeaderMap {
    map: HashMap<String, String>,
    raw: Vec<(String, String)>,
}

impl HeaderMap {
    pub fn insert(&mut self, name: &str, value: &str) {
        self.map.insert(name.to_lowercase(), value.to_string());
        self.raw.push((name.to_string(), value.to_string()));
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.map.get(&name.to_lowercase()).map(|v| v.as_str())
    }

    /// Headers in arrival order with original casing
    pub fn raw(&self) -> &[(String, String)] {
        &self.raw
    }

    /// All `Received` values, top-down
    pub fn received(&self) -> Vec<&str> {
        self.raw
            .iter()
            .filter(|(name, _)| name.eq_ignore_ascii_case("received"))
            .map(|(_, value)| value.as_str())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.raw.len()
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct Attachment {
    pub filename: String,
    pub content_type: String,
    pub size_bytes: usize,
}

/// The unit of classification.
///
/// Created on MAIL FROM, mutated through the session events, finalized at
/// end-of-message and owned exclusively by its session handler.
#[derive(Debug, Clone)]
pub struct Message {
    pub id: String,
    pub envelope: Envelope,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
    pub attachments: Vec<Attachment>,
    pub received_at: chrono::DateTime<chrono::Utc>,
}

impl Message {
    pub fn subject(&self) -> &str {
        self.headers.get("subject").unwrap_or("")
    }

    pub fn from_header(&self) -> &str {
        self.headers.get("from").unwrap_or("")
    }

    pub fn body_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    pub fn sender_domain(&self) -> String {
        extract_domain(&self.envelope.sender)
    }
}

/// Event-by-event accumulator for the session handler
#[derive(Debug, Default)]
pub struct MessageBuilder {
    envelope: Envelope,
    headers: HeaderMap,
    body: Vec<u8>,
}

impl MessageBuilder {
    pub fn new(peer_host: Option<String>, peer_addr: Option<IpAddr>, helo: String) -> Self {
        Self {
            envelope: Envelope {
                peer_host,
                peer_addr,
                helo,
                ..Default::default()
            },
            headers: HeaderMap::default(),
            body: Vec::new(),
        }
    }

    pub fn set_sender(&mut self, sender: &str) {
        self.envelope.sender = normalize_address(sender);
    }

    pub fn add_recipient(&mut self, recipient: &str) {
        self.envelope.recipients.push(normalize_address(recipient));
    }

    pub fn add_header(&mut self, name: &str, value: &str) {
        self.headers.insert(name, value);
    }

    pub fn append_body(&mut self, chunk: &[u8]) {
        self.body.extend_from_slice(chunk);
    }

    pub fn sender(&self) -> &str {
        &self.envelope.sender
    }

    /// Finalize into a Message, parsing attachments out of the MIME tree.
    pub fn finalize(self) -> Message {
        let attachments = parse_attachments(&self.headers, &self.body);
        Message {
            id: uuid::Uuid::new_v4().to_string(),
            envelope: self.envelope,
            headers: self.headers,
            body: self.body,
            attachments,
            received_at: chrono::Utc::now(),
        }
    }
}

/// Reassemble the raw message and let mail-parser walk the MIME tree.
///
/// A body that fails to parse yields no attachments; the message still
/// scores on its remaining features.
fn parse_attachments(headers: &HeaderMap, body: &[u8]) -> Vec<Attachment> {
    if body.is_empty() {
        return Vec::new();
    }
    let mut raw = Vec::with_capacity(body.len() + headers.len() * 64);
    for (name, value) in headers.raw() {
        raw.extend_from_slice(name.as_bytes());
        raw.extend_from_slice(b": ");
        raw.extend_from_slice(value.as_bytes());
        raw.extend_from_slice(b"\r\n");
    }
    raw.extend_from_slice(b"\r\n");
    raw.extend_from_slice(body);

    let parsed = match mail_parser::MessageParser::new().parse(&raw) {
        Some(parsed) => parsed,
        None => {
            tracing::debug!("attachment scan: message did not parse as MIME");
            return Vec::new();
        }
    };

    parsed
        .attachments()
        .map(|part| {
            let content_type = part
                .content_type()
                .map(|ct| match ct.subtype() {
                    Some(subtype) => format!("{}/{}", ct.ctype(), subtype),
                    None => ct.ctype().to_string(),
                })
                .unwrap_or_else(|| "application/octet-stream".to_string());
            Attachment {
                filename: part.attachment_name().unwrap_or("unnamed").to_string(),
                content_type,
                size_bytes: part.contents().len(),
            }
        })
        .collect()
}

// =============================================================================
// Score outcome
// =============================================================================

/// Reason the aggregator skipped the scorer fan-out entirely
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShortCircuit {
    Whitelisted,
    Blacklisted,
}

/// What one evaluation produced
#[derive(Debug, Clone)]
pub struct ScoreOutcome {
    /// Weighted sum of all component scores
    pub raw_score: f64,
    /// Raw score folded into 1..=5
    pub normalized: u8,
    /// Weighted contribution per component, sorted by name
    pub breakdown: BTreeMap<String, f64>,
    /// Normalized score reached the configured spam threshold
    pub is_spam: bool,
    pub short_circuit: Option<ShortCircuit>,
    pub auth: Option<AuthResult>,
    pub bayes_probability: Option<f64>,
    pub duration_ms: u64,
}

// =============================================================================
// Engine
// =============================================================================

/// Process-wide scoring facade.
///
/// Owns the shared services (DNS cache, frequency tracker, Bayes store,
/// plugin registry) and fans scoring out per message. Constructed once at
/// startup; sessions hold it behind an Arc.
pub struct ScoreEngine {
    pub(crate) config: ZpamConfig,
    pub(crate) extractor: FeatureExtractor,
    pub(crate) keywords: KeywordMatcher,
    pub(crate) frequency: FrequencyTracker,
    pub(crate) auth: AuthValidator,
    pub(crate) plugins: PluginOrchestrator,
    pub(crate) bayes: Option<Arc<dyn BayesStore>>,
    stats: EngineStats,
}

#[derive(Debug, Default)]
struct EngineStats {
    processed: AtomicU64,
    spam: AtomicU64,
    clean: AtomicU64,
    rejected: AtomicU64,
    quarantined: AtomicU64,
    total_duration_ms: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct EngineStatsSnapshot {
    pub processed: u64,
    pub spam: u64,
    pub clean: u64,
    pub rejected: u64,
    pub quarantined: u64,
    pub avg_duration_ms: f64,
}

impl ScoreEngine {
    pub fn new(
        config: ZpamConfig,
        dns: Arc<DnsCache>,
        bayes: Option<Arc<dyn BayesStore>>,
    ) -> Self {
        Self {
            extractor: FeatureExtractor::new(&config.lists),
            keywords: KeywordMatcher::new(&config.detection.keywords),
            frequency: FrequencyTracker::new(frequency::FrequencyConfig {
                max_senders: config.performance.cache_size,
                ..Default::default()
            }),
            auth: AuthValidator::new(Arc::clone(&dns), config.headers.clone()),
            plugins: PluginOrchestrator::new(&config.plugins),
            bayes,
            config,
            stats: EngineStats::default(),
        }
    }

    pub fn config(&self) -> &ZpamConfig {
        &self.config
    }

    /// Register an external scorer plugin
    pub fn register_plugin(
        &mut self,
        plugin: Arc<dyn ScorerPlugin>,
        entry: &zpam_common::config::PluginEntryConfig,
    ) {
        self.plugins.register(plugin, entry);
    }

    /// Score one finalized message.
    pub async fn evaluate(self: &Arc<Self>, message: Arc<Message>) -> ScoreOutcome {
        let start = Instant::now();
        let mut outcome = aggregator::aggregate(self, &message).await;
        outcome.duration_ms = start.elapsed().as_millis() as u64;
        outcome.is_spam = outcome.normalized >= self.config.detection.spam_threshold;

        self.stats.processed.fetch_add(1, Ordering::Relaxed);
        self.stats
            .total_duration_ms
            .fetch_add(outcome.duration_ms, Ordering::Relaxed);
        if outcome.is_spam {
            self.stats.spam.fetch_add(1, Ordering::Relaxed);
            // Burst tracking learns which senders keep producing spam.
            self.frequency.mark_spam(&message.envelope.sender);
        } else {
            self.stats.clean.fetch_add(1, Ordering::Relaxed);
        }
        outcome
    }

    pub fn record_rejected(&self) {
        self.stats.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_quarantined(&self) {
        self.stats.quarantined.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> EngineStatsSnapshot {
        let processed = self.stats.processed.load(Ordering::Relaxed);
        let total_ms = self.stats.total_duration_ms.load(Ordering::Relaxed);
        EngineStatsSnapshot {
            processed,
            spam: self.stats.spam.load(Ordering::Relaxed),
            clean: self.stats.clean.load(Ordering::Relaxed),
            rejected: self.stats.rejected.load(Ordering::Relaxed),
            quarantined: self.stats.quarantined.load(Ordering::Relaxed),
            avg_duration_ms: if processed == 0 {
                0.0
            } else {
                total_ms as f64 / processed as f64
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_map_is_case_insensitive_and_last_write_wins() {
        let mut headers = HeaderMap::default();
        headers.insert("Subject", "first");
        headers.insert("SUBJECT", "second");
        assert_eq!(headers.get("subject"), Some("second"));
        assert_eq!(headers.raw().len(), 2);
    }

    #[test]
    fn test_received_preserves_order() {
        let mut headers = HeaderMap::default();
        headers.insert("Received", "from a by b");
        headers.insert("Subject", "x");
        headers.insert("Received", "from c by d");
        assert_eq!(headers.received(), vec!["from a by b", "from c by d"]);
    }

    #[test]
    fn test_builder_normalizes_envelope() {
        let mut builder = MessageBuilder::new(None, None, "mx.example.com".into());
        builder.set_sender("<Alice@Example.COM>");
        builder.add_recipient("<bob@test.org>");
        builder.add_header("Subject", "hello");
        builder.append_body(b"body text");

        let message = builder.finalize();
        assert_eq!(message.envelope.sender, "alice@example.com");
        assert_eq!(message.envelope.recipients, vec!["bob@test.org"]);
        assert_eq!(message.subject(), "hello");
        assert_eq!(message.body_text(), "body text");
    }

    #[test]
    fn test_attachment_parsing_from_multipart() {
        let mut builder = MessageBuilder::new(None, None, String::new());
        builder.set_sender("a@b.c");
        builder.add_header("From", "a@b.c");
        builder.add_header("Subject", "files");
        builder.add_header("MIME-Version", "1.0");
        builder.add_header(
            "Content-Type",
            "multipart/mixed; boundary=\"XYZ\"",
        );
        let body = concat!(
            "--XYZ\r\n",
            "Content-Type: text/plain\r\n",
            "\r\n",
            "see attachment\r\n",
            "--XYZ\r\n",
            "Content-Type: application/octet-stream\r\n",
            "Content-Disposition: attachment; filename=\"invoice.exe\"\r\n",
            "\r\n",
            "MZbinary\r\n",
            "--XYZ--\r\n",
        );
        builder.append_body(body.as_bytes());

        let message = builder.finalize();
        assert_eq!(message.attachments.len(), 1);
        assert_eq!(message.attachments[0].filename, "invoice.exe");
    }

    #[test]
    fn test_unparseable_body_yields_no_attachments() {
        let mut builder = MessageBuilder::new(None, None, String::new());
        builder.set_sender("a@b.c");
        builder.append_body(&[0xff, 0xfe, 0x00, 0x01]);
        let message = builder.finalize();
        assert!(message.attachments.is_empty());
    }
}
