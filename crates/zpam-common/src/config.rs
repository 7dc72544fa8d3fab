//! ZPAM Configuration
//!
//! Hierarchical YAML configuration loaded once at startup and validated
//! before the engine accepts any connection.

use crate::error::{ZpamError, ZpamResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Top-level ZPAM configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ZpamConfig {
    /// Detection thresholds, weights, keywords and feature toggles
    pub detection: DetectionConfig,
    /// Whitelists, blacklists and trusted domains
    pub lists: ListsConfig,
    /// Performance limits
    pub performance: PerformanceConfig,
    /// Bayesian learning settings
    pub learning: LearningConfig,
    /// Header authentication (SPF/DKIM/DMARC) settings
    pub headers: HeadersConfig,
    /// Milter server settings
    pub milter: MilterConfig,
    /// Plugin orchestration settings
    pub plugins: PluginsConfig,
    /// Logging settings
    pub logging: LoggingConfig,
}

impl ZpamConfig {
    /// Load from a YAML file
    pub fn load(path: &str) -> ZpamResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)
            .map_err(|e| ZpamError::Config(format!("{}: {}", path, e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Save to a YAML file
    pub fn save(&self, path: &str) -> ZpamResult<()> {
        let content = serde_yaml::to_string(self)
            .map_err(|e| ZpamError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Validate the loaded configuration.
    ///
    /// Invalid configuration is fatal before any connection is accepted.
    pub fn validate(&self) -> ZpamResult<()> {
        if !(1..=5).contains(&self.detection.spam_threshold) {
            return Err(ZpamError::Config(format!(
                "detection.spam_threshold must be in [1,5], got {}",
                self.detection.spam_threshold
            )));
        }
        if self.milter.quarantine_enabled
            && self.milter.quarantine_threshold >= self.milter.reject_threshold
        {
            return Err(ZpamError::Config(format!(
                "milter.quarantine_threshold ({}) must be below reject_threshold ({})",
                self.milter.quarantine_threshold, self.milter.reject_threshold
            )));
        }
        match self.logging.level.as_str() {
            "debug" | "info" | "warn" | "error" => {}
            other => {
                return Err(ZpamError::Config(format!(
                    "logging.level must be one of debug/info/warn/error, got {:?}",
                    other
                )))
            }
        }
        if self.milter.enabled && self.milter.address.is_empty() {
            return Err(ZpamError::Config(
                "milter.address must be set when the milter is enabled".into(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Detection
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DetectionConfig {
    /// Normalized score at which a message is tagged as spam (1..5)
    pub spam_threshold: u8,
    /// Per-component score weights
    pub weights: WeightsConfig,
    /// Risk-tiered keyword lists
    pub keywords: KeywordsConfig,
    /// Per-feature-group enable flags
    pub features: FeatureToggles,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            spam_threshold: 4,
            weights: WeightsConfig::default(),
            keywords: KeywordsConfig::default(),
            features: FeatureToggles::default(),
        }
    }
}

/// Multiplier applied to each component score before summation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WeightsConfig {
    pub keywords: f64,
    pub caps_ratio: f64,
    pub exclamations: f64,
    pub url_density: f64,
    pub html_ratio: f64,
    pub suspicious_headers: f64,
    pub attachment_risk: f64,
    pub domain_reputation: f64,
    pub encoding_issues: f64,
    pub from_to_mismatch: f64,
    pub subject_length: f64,
    pub frequency: f64,
    pub bayes: f64,
    pub auth: f64,
    pub plugins: f64,
}

impl Default for WeightsConfig {
    fn default() -> Self {
        Self {
            keywords: 1.0,
            caps_ratio: 1.0,
            exclamations: 1.0,
            url_density: 1.0,
            html_ratio: 1.0,
            suspicious_headers: 1.0,
            attachment_risk: 1.0,
            domain_reputation: 1.0,
            encoding_issues: 1.0,
            from_to_mismatch: 1.0,
            subject_length: 1.0,
            frequency: 1.0,
            bayes: 1.0,
            auth: 1.0,
            plugins: 1.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct KeywordsConfig {
    pub high_risk: Vec<String>,
    pub medium_risk: Vec<String>,
    pub low_risk: Vec<String>,
}

impl Default for KeywordsConfig {
    fn default() -> Self {
        Self {
            high_risk: [
                "lottery",
                "free money",
                "click here",
                "congratulations",
                "viagra",
                "inheritance",
                "act now",
                "wire transfer",
                "you have won",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            medium_risk: [
                "winner",
                "limited time",
                "risk free",
                "no obligation",
                "order now",
                "make money fast",
                "work from home",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            low_risk: ["unsubscribe", "opt out", "special offer", "discount"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FeatureToggles {
    pub keywords: bool,
    pub caps_ratio: bool,
    pub exclamations: bool,
    pub url_density: bool,
    pub html_ratio: bool,
    pub suspicious_headers: bool,
    pub attachment_risk: bool,
    pub domain_reputation: bool,
    pub encoding_issues: bool,
    pub from_to_mismatch: bool,
    pub subject_length: bool,
    pub frequency: bool,
    pub bayes: bool,
    pub auth: bool,
    pub plugins: bool,
}

impl Default for FeatureToggles {
    fn default() -> Self {
        Self {
            keywords: true,
            caps_ratio: true,
            exclamations: true,
            url_density: true,
            html_ratio: true,
            suspicious_headers: true,
            attachment_risk: true,
            domain_reputation: true,
            encoding_issues: true,
            from_to_mismatch: true,
            subject_length: true,
            frequency: true,
            bayes: true,
            auth: true,
            plugins: true,
        }
    }
}

// =============================================================================
// Lists
// =============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ListsConfig {
    pub whitelist: AddressList,
    pub blacklist: AddressList,
    /// Domains considered reputable by the feature extractor
    pub trusted_domains: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AddressList {
    pub emails: Vec<String>,
    pub domains: Vec<String>,
}

impl AddressList {
    /// Case-insensitive membership check for a normalized address.
    pub fn contains(&self, address: &str, domain: &str) -> bool {
        self.emails.iter().any(|e| e.eq_ignore_ascii_case(address))
            || self.domains.iter().any(|d| d.eq_ignore_ascii_case(domain))
    }
}

// =============================================================================
// Performance
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PerformanceConfig {
    /// Concurrent message evaluations
    pub max_concurrent_emails: usize,
    /// Global per-operation timeout
    pub timeout_ms: u64,
    /// Entry cap for internal caches
    pub cache_size: usize,
    /// Batch size for pipelined store operations
    pub batch_size: usize,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            max_concurrent_emails: 10,
            timeout_ms: 5000,
            cache_size: 1000,
            batch_size: 50,
        }
    }
}

// =============================================================================
// Learning
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LearningConfig {
    pub enabled: bool,
    /// Storage backend for token statistics
    pub backend: LearningBackend,
    pub tokenizer: TokenizerSettings,
    pub file: FileBackendConfig,
    pub redis: RedisBackendConfig,
}

impl Default for LearningConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            backend: LearningBackend::File,
            tokenizer: TokenizerSettings::default(),
            file: FileBackendConfig::default(),
            redis: RedisBackendConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LearningBackend {
    File,
    Redis,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TokenizerSettings {
    pub min_token_length: usize,
    pub max_token_length: usize,
    pub case_sensitive: bool,
    /// OSB sliding window size
    pub osb_window: usize,
    /// Hard cap on tokens emitted per message
    pub max_tokens: usize,
}

impl Default for TokenizerSettings {
    fn default() -> Self {
        Self {
            min_token_length: 3,
            max_token_length: 32,
            case_sensitive: false,
            osb_window: 5,
            max_tokens: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FileBackendConfig {
    /// Vocabulary snapshot location
    pub model_path: String,
    /// Spam probability above which this component flags the message
    pub threshold: f64,
    /// Tokens with fewer total observations are skipped
    pub min_token_count: u64,
    /// Smoothing factor applied to per-token probabilities
    pub smoothing_factor: f64,
    /// Vocabulary cap per user; least-informative tokens drop first
    pub max_vocabulary: usize,
}

impl Default for FileBackendConfig {
    fn default() -> Self {
        Self {
            model_path: "zpam-model.json".into(),
            threshold: 0.7,
            min_token_count: 2,
            smoothing_factor: 1.0,
            max_vocabulary: 100_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RedisBackendConfig {
    pub url: String,
    pub key_prefix: String,
    pub threshold: f64,
    pub min_token_count: u64,
    pub smoothing_factor: f64,
    /// Read-through cache TTL for token counts
    pub local_cache_ttl_secs: u64,
}

impl Default for RedisBackendConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".into(),
            key_prefix: "zpam".into(),
            threshold: 0.95,
            min_token_count: 2,
            smoothing_factor: 1.0,
            local_cache_ttl_secs: 300,
        }
    }
}

// =============================================================================
// Header authentication
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HeadersConfig {
    pub enable_spf: bool,
    pub enable_dkim: bool,
    pub enable_dmarc: bool,
    /// Per-query DNS timeout
    pub dns_timeout_secs: u64,
    /// Hop count above which routing looks suspicious
    pub max_hop_count: usize,
    /// Substrings that mark a Received hop as suspicious
    pub suspicious_servers: Vec<String>,
    /// Substrings that mark a Received hop as an open-relay pattern
    pub open_relay_patterns: Vec<String>,
    /// Score penalties fed into the auth component
    pub penalties: AuthPenalties,
    pub cache: DnsCacheSettings,
}

impl Default for HeadersConfig {
    fn default() -> Self {
        Self {
            enable_spf: true,
            enable_dkim: true,
            enable_dmarc: true,
            dns_timeout_secs: 5,
            max_hop_count: 10,
            suspicious_servers: ["unknown", "localhost", "dynamic", "dial-up", "dsl-pool"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            open_relay_patterns: ["open relay", "may be forged", "unverified"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            penalties: AuthPenalties::default(),
            cache: DnsCacheSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AuthPenalties {
    pub spf_fail: f64,
    pub spf_softfail: f64,
    pub dkim_missing: f64,
    pub dkim_invalid: f64,
    pub dmarc_missing: f64,
    pub dmarc_fail: f64,
    /// Fraction of the 0-100 suspicion score added to the component score
    pub suspicion_factor: f64,
}

impl Default for AuthPenalties {
    fn default() -> Self {
        Self {
            spf_fail: 0.9,
            spf_softfail: 0.45,
            dkim_missing: 1.0,
            dkim_invalid: 1.2,
            dmarc_missing: 1.5,
            dmarc_fail: 2.0,
            suspicion_factor: 0.05,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DnsCacheSettings {
    pub enabled: bool,
    pub ttl_secs: u64,
    pub max_entries: usize,
    pub cleanup_interval_secs: u64,
    pub workers: usize,
}

impl Default for DnsCacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_secs: 1800,
            max_entries: 1000,
            cleanup_interval_secs: 120,
            workers: 10,
        }
    }
}

// =============================================================================
// Milter
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MilterConfig {
    pub enabled: bool,
    pub network: MilterNetwork,
    /// `host:port` for tcp, socket path for unix
    pub address: String,
    pub read_timeout_secs: u64,
    pub write_timeout_secs: u64,
    /// Events the handler asks the MTA not to send
    pub skip: SkipEvents,
    /// Mutations the handler negotiates with the MTA
    pub actions: ActionFlags,
    /// Normalized score strictly above which the message is rejected
    pub reject_threshold: u8,
    /// Normalized score at or above which the message is quarantined
    pub quarantine_threshold: u8,
    pub quarantine_enabled: bool,
    pub reject_code: u16,
    pub reject_message: String,
    /// Prefix for added headers
    pub header_prefix: String,
    pub max_connections: usize,
    pub graceful_shutdown_timeout_secs: u64,
}

impl Default for MilterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            network: MilterNetwork::Tcp,
            address: "127.0.0.1:7357".into(),
            read_timeout_secs: 10,
            write_timeout_secs: 10,
            skip: SkipEvents::default(),
            actions: ActionFlags::default(),
            reject_threshold: 5,
            quarantine_threshold: 4,
            quarantine_enabled: true,
            reject_code: 550,
            reject_message: "Message rejected as spam".into(),
            header_prefix: "X-ZPAM-".into(),
            max_connections: 10,
            graceful_shutdown_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MilterNetwork {
    Tcp,
    Unix,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SkipEvents {
    pub helo: bool,
    pub rcpt_to: bool,
    pub data: bool,
    pub body: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ActionFlags {
    pub add_headers: bool,
    pub change_headers: bool,
    pub quarantine: bool,
    pub change_body: bool,
    pub add_recipients: bool,
    pub remove_recipients: bool,
    pub change_from: bool,
}

impl Default for ActionFlags {
    fn default() -> Self {
        Self {
            add_headers: true,
            change_headers: true,
            quarantine: true,
            change_body: false,
            add_recipients: false,
            remove_recipients: false,
            change_from: false,
        }
    }
}

// =============================================================================
// Plugins
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PluginsConfig {
    pub enabled: bool,
    /// Default per-plugin timeout
    pub timeout_ms: u64,
    pub max_concurrent: usize,
    pub combine_method: CombineMethod,
    /// Score above which a plugin "votes spam" under the consensus policy
    pub consensus_threshold: f64,
    pub plugins: HashMap<String, PluginEntryConfig>,
}

impl Default for PluginsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_ms: 5000,
            max_concurrent: 4,
            combine_method: CombineMethod::Weighted,
            consensus_threshold: 5.0,
            plugins: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CombineMethod {
    Weighted,
    Max,
    Average,
    Consensus,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PluginEntryConfig {
    pub enabled: bool,
    pub weight: f64,
    pub priority: i32,
    pub timeout_ms: u64,
    pub settings: HashMap<String, serde_yaml::Value>,
}

impl Default for PluginEntryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            weight: 1.0,
            priority: 0,
            timeout_ms: 5000,
            settings: HashMap::new(),
        }
    }
}

// =============================================================================
// Logging
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// debug, info, warn or error
    pub level: String,
    /// text or json
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        ZpamConfig::default().validate().unwrap();
    }

    #[test]
    fn test_threshold_out_of_range_rejected() {
        let mut config = ZpamConfig::default();
        config.detection.spam_threshold = 6;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_quarantine_must_be_below_reject() {
        let mut config = ZpamConfig::default();
        config.milter.quarantine_threshold = 5;
        config.milter.reject_threshold = 5;
        assert!(config.validate().is_err());

        config.milter.quarantine_enabled = false;
        config.validate().unwrap();
    }

    #[test]
    fn test_invalid_log_level_rejected() {
        let mut config = ZpamConfig::default();
        config.logging.level = "verbose".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_milter_address_required_when_enabled() {
        let mut config = ZpamConfig::default();
        config.milter.address.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("zpam.yaml");
        let path = path.to_str().unwrap();

        let mut config = ZpamConfig::default();
        config.detection.spam_threshold = 3;
        config.lists.blacklist.domains.push("phishing-site.net".into());
        config.milter.header_prefix = "X-Custom-".into();
        config.learning.backend = LearningBackend::Redis;
        config.plugins.plugins.insert(
            "rules".into(),
            PluginEntryConfig {
                weight: 2.0,
                priority: 5,
                ..Default::default()
            },
        );

        config.save(path).unwrap();
        let loaded = ZpamConfig::load(path).unwrap();
        assert_eq!(config, loaded);
    }
}
