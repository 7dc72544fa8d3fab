//! Plugin orchestration
//!
//! A registry of named scorers, each with its own weight, priority and
//! timeout. `execute_all` runs every enabled plugin under a shared
//! concurrency cap; plugins that error or exceed their deadline are logged
//! and excluded from the combined score, never blocking the pipeline.

use crate::Message;
use async_trait::async_trait;
use regex::Regex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use zpam_common::config::{CombineMethod, PluginEntryConfig, PluginsConfig};
use zpam_common::ZpamResult;

/// What one plugin reports for one message
#[derive(Debug, Clone, Default, Serialize)]
pub struct PluginResult {
    pub name: String,
    pub score: f64,
    /// Plugin's own confidence in its score, in [0, 1]
    pub confidence: f64,
    pub triggered_rules: Vec<String>,
    pub metadata: HashMap<String, String>,
    pub error: Option<String>,
}

/// An external scorer. Implementations are stateless between invocations
/// or carry only read-only configuration.
#[async_trait]
pub trait ScorerPlugin: Send + Sync {
    fn name(&self) -> &str;

    async fn score(&self, message: &Message) -> ZpamResult<PluginResult>;
}

struct RegisteredPlugin {
    plugin: Arc<dyn ScorerPlugin>,
    weight: f64,
    priority: i32,
    timeout: Duration,
}

/// Combined output of one orchestrator run
#[derive(Debug, Clone, Default)]
pub struct CombinedPluginScore {
    pub combined: f64,
    pub results: Vec<PluginResult>,
}

pub struct PluginOrchestrator {
    plugins: Vec<RegisteredPlugin>,
    semaphore: Arc<Semaphore>,
    method: CombineMethod,
    consensus_threshold: f64,
    enabled: bool,
}

impl PluginOrchestrator {
    /// Build the registry from configuration. Entries whose settings carry a
    /// `rules` list become rule scorers; anything else needs to be registered
    /// programmatically via [`register`](Self::register).
    pub fn new(config: &PluginsConfig) -> Self {
        let mut orchestrator = Self {
            plugins: Vec::new(),
            semaphore: Arc::new(Semaphore::new(config.max_concurrent.max(1))),
            method: config.combine_method,
            consensus_threshold: config.consensus_threshold,
            enabled: config.enabled,
        };
        for (name, entry) in &config.plugins {
            if !entry.enabled {
                continue;
            }
            match RuleScorer::from_settings(name, &entry.settings) {
                Some(scorer) => orchestrator.register(Arc::new(scorer), entry),
                None => {
                    tracing::warn!(plugin = %name, "no builtin for plugin entry; register it programmatically")
                }
            }
        }
        orchestrator
    }

    pub fn register(&mut self, plugin: Arc<dyn ScorerPlugin>, entry: &PluginEntryConfig) {
        self.plugins.push(RegisteredPlugin {
            plugin,
            weight: entry.weight,
            priority: entry.priority,
            timeout: Duration::from_millis(entry.timeout_ms.max(1)),
        });
        // Higher priority dispatches first.
        self.plugins.sort_by(|a, b| b.priority.cmp(&a.priority));
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Run every registered plugin and combine their scores by policy.
    pub async fn execute_all(&self, message: &Arc<Message>) -> CombinedPluginScore {
        if !self.enabled || self.plugins.is_empty() {
            return CombinedPluginScore::default();
        }

        let mut join_set = JoinSet::new();
        for registered in &self.plugins {
            let plugin = Arc::clone(&registered.plugin);
            let message = Arc::clone(message);
            let semaphore = Arc::clone(&self.semaphore);
            let timeout = registered.timeout;
            let weight = registered.weight;
            join_set.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                let name = plugin.name().to_string();
                match tokio::time::timeout(timeout, plugin.score(&message)).await {
                    Ok(Ok(result)) => (weight, result),
                    Ok(Err(e)) => {
                        tracing::warn!(plugin = %name, error = %e, "plugin failed; skipping");
                        (
                            weight,
                            PluginResult {
                                name,
                                error: Some(e.to_string()),
                                ..Default::default()
                            },
                        )
                    }
                    Err(_) => {
                        tracing::warn!(plugin = %name, "plugin timed out; skipping");
                        (
                            weight,
                            PluginResult {
                                name,
                                error: Some("timed out".into()),
                                ..Default::default()
                            },
                        )
                    }
                }
            });
        }

        let mut scored = Vec::new();
        let mut results = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((weight, result)) => {
                    if result.error.is_none() {
                        scored.push((weight, result.score));
                    }
                    results.push(result);
                }
                Err(e) => tracing::error!("plugin task panicked: {}", e),
            }
        }

        CombinedPluginScore {
            combined: combine(self.method, self.consensus_threshold, &scored),
            results,
        }
    }
}

fn combine(method: CombineMethod, consensus_threshold: f64, scored: &[(f64, f64)]) -> f64 {
    if scored.is_empty() {
        return 0.0;
    }
    let weighted = || {
        let weight_sum: f64 = scored.iter().map(|(w, _)| w).sum();
        if weight_sum == 0.0 {
            0.0
        } else {
            scored.iter().map(|(w, s)| w * s).sum::<f64>() / weight_sum
        }
    };
    match method {
        CombineMethod::Weighted => weighted(),
        CombineMethod::Max => scored.iter().map(|(_, s)| *s).fold(f64::NEG_INFINITY, f64::max),
        CombineMethod::Average => {
            scored.iter().map(|(_, s)| s).sum::<f64>() / scored.len() as f64
        }
        CombineMethod::Consensus => {
            let votes = scored
                .iter()
                .filter(|(_, s)| *s > consensus_threshold)
                .count();
            if votes * 2 >= scored.len() {
                weighted()
            } else {
                0.0
            }
        }
    }
}

// =============================================================================
// Builtin: regex rule scorer
// =============================================================================

/// Config-driven regex rules over subject and body.
///
/// Settings shape:
/// ```yaml
/// rules:
///   - name: wire-fraud
///     pattern: "(?i)wire\\s+transfer.{0,40}urgent"
///     score: 4.0
/// ```
pub struct RuleScorer {
    name: String,
    rules: Vec<ScoreRule>,
}

struct ScoreRule {
    name: String,
    pattern: Regex,
    score: f64,
}

impl RuleScorer {
    pub fn from_settings(
        name: &str,
        settings: &HashMap<String, serde_yaml::Value>,
    ) -> Option<Self> {
        let items = settings.get("rules")?.as_sequence()?;
        let mut rules = Vec::new();
        for item in items {
            let rule_name = item.get("name").and_then(|v| v.as_str()).unwrap_or("rule");
            let Some(pattern) = item.get("pattern").and_then(|v| v.as_str()) else {
                continue;
            };
            let score = item.get("score").and_then(|v| v.as_f64()).unwrap_or(1.0);
            match Regex::new(pattern) {
                Ok(pattern) => rules.push(ScoreRule {
                    name: rule_name.to_string(),
                    pattern,
                    score,
                }),
                Err(e) => {
                    tracing::warn!(plugin = %name, rule = %rule_name, error = %e, "bad rule pattern")
                }
            }
        }
        Some(Self {
            name: name.to_string(),
            rules,
        })
    }
}

#[async_trait]
impl ScorerPlugin for RuleScorer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn score(&self, message: &Message) -> ZpamResult<PluginResult> {
        let text = format!("{}\n{}", message.subject(), message.body_text());
        let mut score = 0.0;
        let mut triggered = Vec::new();
        for rule in &self.rules {
            if rule.pattern.is_match(&text) {
                score += rule.score;
                triggered.push(rule.name.clone());
            }
        }
        Ok(PluginResult {
            name: self.name.clone(),
            score,
            confidence: if triggered.is_empty() { 0.0 } else { 0.8 },
            triggered_rules: triggered,
            metadata: HashMap::new(),
            error: None,
        })
    }
}
