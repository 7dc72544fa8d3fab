//! Score aggregation
//!
//! Fans the component scorers out as independent tasks, each writing one
//! `(name, score)` pair into a bounded channel, then folds the weighted
//! contributions into a raw score and the normalized 1-5 verdict. Component
//! order never matters (the sum commutes); the breakdown map is sorted by
//! component name so explainability output is deterministic.

use crate::auth::AuthResult;
use crate::features::Features;
use crate::{Message, ScoreEngine, ScoreOutcome, ShortCircuit};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use zpam_common::config::{AuthPenalties, WeightsConfig};
use zpam_common::extract_domain;

/// Raw score a blacklisted sender saturates to
const BLACKLIST_SCORE: f64 = 25.0;

/// Attachment extensions that carry an extra risk bonus
const DANGEROUS_EXTENSIONS: &[&str] = &[".exe", ".scr", ".bat", ".com", ".pif", ".vbs", ".js"];

/// Fold a raw weighted sum into the 1..=5 verdict scale.
pub fn normalize_score(raw: f64) -> u8 {
    if raw < 5.0 {
        1
    } else if raw < 10.0 {
        2
    } else if raw < 15.0 {
        3
    } else if raw < 20.0 {
        4
    } else {
        5
    }
}

pub(crate) async fn aggregate(engine: &Arc<ScoreEngine>, message: &Arc<Message>) -> ScoreOutcome {
    let sender = message.envelope.sender.clone();
    let domain = extract_domain(&sender);

    // List short-circuits skip the fan-out entirely.
    let lists = &engine.config.lists;
    if !sender.is_empty() && lists.whitelist.contains(&sender, &domain) {
        return short_circuit_outcome(ShortCircuit::Whitelisted, 0.0, "whitelist");
    }
    if !sender.is_empty() && lists.blacklist.contains(&sender, &domain) {
        return short_circuit_outcome(ShortCircuit::Blacklisted, BLACKLIST_SCORE, "blacklist");
    }

    let features = Arc::new(engine.extractor.extract(message));
    let toggles = engine.config.detection.features.clone();
    let (tx, mut rx) = mpsc::channel::<(&'static str, f64)>(32);

    // Pure feature scorers.
    let feature_scorers: [(bool, &'static str, fn(&Features) -> f64); 9] = [
        (toggles.caps_ratio, "caps_ratio", caps_score),
        (toggles.exclamations, "exclamations", exclamation_score),
        (toggles.url_density, "url_density", url_density_score),
        (toggles.html_ratio, "html_ratio", html_score),
        (
            toggles.suspicious_headers,
            "suspicious_headers",
            suspicious_headers_score,
        ),
        (
            toggles.domain_reputation,
            "domain_reputation",
            domain_reputation_score,
        ),
        (toggles.encoding_issues, "encoding_issues", encoding_score),
        (
            toggles.from_to_mismatch,
            "from_to_mismatch",
            from_to_mismatch_score,
        ),
        (toggles.subject_length, "subject_length", subject_length_score),
    ];
    for (enabled, name, scorer) in feature_scorers {
        if !enabled {
            continue;
        }
        let tx = tx.clone();
        let features = Arc::clone(&features);
        tokio::spawn(async move {
            let _ = tx.send((name, scorer(&features))).await;
        });
    }

    if toggles.keywords {
        let tx = tx.clone();
        let engine = Arc::clone(engine);
        let message = Arc::clone(message);
        tokio::spawn(async move {
            let text = format!("{}\n{}", message.subject(), message.body_text());
            let (score, _matched) = engine.keywords.score(&text);
            let _ = tx.send(("keywords", score)).await;
        });
    }

    if toggles.attachment_risk {
        let tx = tx.clone();
        let message = Arc::clone(message);
        tokio::spawn(async move {
            let _ = tx.send(("attachment_risk", attachment_score(&message))).await;
        });
    }

    if toggles.frequency {
        let tx = tx.clone();
        let engine = Arc::clone(engine);
        let sender = sender.clone();
        let domain = domain.clone();
        tokio::spawn(async move {
            let result = engine.frequency.track(&sender, &domain, false);
            let _ = tx.send(("frequency", result.frequency_score)).await;
        });
    }

    let mut bayes_rx = None;
    if toggles.bayes && engine.config.learning.enabled {
        if let Some(store) = engine.bayes.clone() {
            let tx = tx.clone();
            let message = Arc::clone(message);
            let (probability_tx, probability_rx) = oneshot::channel();
            bayes_rx = Some(probability_rx);
            tokio::spawn(async move {
                let score = match store
                    .classify(message.subject(), &message.body_text(), "")
                    .await
                {
                    Ok(classification) => {
                        if classification.probability >= store.threshold() {
                            tracing::debug!(
                                probability = classification.probability,
                                tokens = classification.tokens_considered,
                                "bayes component flags message"
                            );
                        }
                        let _ = probability_tx.send(classification.probability);
                        bayes_component_score(classification.probability)
                    }
                    Err(e) => {
                        // Transient store trouble is "no signal", never fatal.
                        tracing::warn!(error = %e, "bayes classification unavailable");
                        0.0
                    }
                };
                let _ = tx.send(("bayes", score)).await;
            });
        }
    }

    let mut auth_rx = None;
    if toggles.auth {
        let tx = tx.clone();
        let engine_ref = Arc::clone(engine);
        let message = Arc::clone(message);
        let (result_tx, result_rx) = oneshot::channel();
        auth_rx = Some(result_rx);
        tokio::spawn(async move {
            let result = engine_ref.auth.validate(&message).await;
            let score = auth_component_score(&result, &engine_ref.config.headers.penalties);
            let _ = result_tx.send(result);
            let _ = tx.send(("auth", score)).await;
        });
    }

    if toggles.plugins && engine.config.plugins.enabled && !engine.plugins.is_empty() {
        let tx = tx.clone();
        let engine = Arc::clone(engine);
        let message = Arc::clone(message);
        tokio::spawn(async move {
            let combined = engine.plugins.execute_all(&message).await;
            let _ = tx.send(("plugins", combined.combined)).await;
        });
    }

    drop(tx);

    let weights = &engine.config.detection.weights;
    let mut breakdown = BTreeMap::new();
    let mut raw_score = 0.0;
    while let Some((name, score)) = rx.recv().await {
        let weighted = score * weight_for(weights, name);
        raw_score += weighted;
        breakdown.insert(name.to_string(), weighted);
    }

    let auth = match auth_rx {
        Some(rx) => rx.await.ok(),
        None => None,
    };
    let bayes_probability = match bayes_rx {
        Some(rx) => rx.await.ok(),
        None => None,
    };

    ScoreOutcome {
        raw_score,
        normalized: normalize_score(raw_score),
        breakdown,
        is_spam: false,
        short_circuit: None,
        auth,
        bayes_probability,
        duration_ms: 0,
    }
}

fn short_circuit_outcome(reason: ShortCircuit, raw: f64, component: &str) -> ScoreOutcome {
    let mut breakdown = BTreeMap::new();
    breakdown.insert(component.to_string(), raw);
    ScoreOutcome {
        raw_score: raw,
        normalized: normalize_score(raw),
        breakdown,
        is_spam: false,
        short_circuit: Some(reason),
        auth: None,
        bayes_probability: None,
        duration_ms: 0,
    }
}

fn weight_for(weights: &WeightsConfig, component: &'static str) -> f64 {
    match component {
        "keywords" => weights.keywords,
        "caps_ratio" => weights.caps_ratio,
        "exclamations" => weights.exclamations,
        "url_density" => weights.url_density,
        "html_ratio" => weights.html_ratio,
        "suspicious_headers" => weights.suspicious_headers,
        "attachment_risk" => weights.attachment_risk,
        "domain_reputation" => weights.domain_reputation,
        "encoding_issues" => weights.encoding_issues,
        "from_to_mismatch" => weights.from_to_mismatch,
        "subject_length" => weights.subject_length,
        "frequency" => weights.frequency,
        "bayes" => weights.bayes,
        "auth" => weights.auth,
        "plugins" => weights.plugins,
        _ => 1.0,
    }
}

// =============================================================================
// Component scorers
// =============================================================================

fn caps_score(features: &Features) -> f64 {
    let ratio = features.subject_caps_ratio.max(features.body_caps_ratio);
    if ratio >= 0.5 {
        3.0
    } else if ratio >= 0.3 {
        2.0
    } else if ratio >= 0.15 {
        1.0
    } else {
        0.0
    }
}

fn exclamation_score(features: &Features) -> f64 {
    let total = features.subject_exclamations + features.body_exclamations;
    if total > 5 {
        3.0
    } else if total > 3 {
        2.0
    } else if total > 1 {
        1.0
    } else {
        0.0
    }
}

/// URLs per 1000 body characters, tiered.
fn url_density_score(features: &Features) -> f64 {
    if features.body_length == 0 {
        return 0.0;
    }
    let per_thousand = features.url_count as f64 * 1000.0 / features.body_length as f64;
    if per_thousand > 20.0 {
        3.0
    } else if per_thousand > 10.0 {
        2.0
    } else if per_thousand > 5.0 {
        1.0
    } else {
        0.0
    }
}

fn html_score(features: &Features) -> f64 {
    let density = features.html_tag_density;
    if density > 0.3 {
        3.0
    } else if density > 0.2 {
        2.0
    } else if density > 0.1 {
        1.0
    } else {
        0.0
    }
}

fn suspicious_headers_score(features: &Features) -> f64 {
    (features.suspicious_header_count as f64 * 1.5).min(4.5)
}

fn attachment_score(message: &Message) -> f64 {
    let mut score = 0.0;
    for attachment in &message.attachments {
        score += 0.5;
        let name = attachment.filename.to_lowercase();
        if DANGEROUS_EXTENSIONS.iter().any(|ext| name.ends_with(ext)) {
            score += 3.0;
        }
    }
    score
}

fn domain_reputation_score(features: &Features) -> f64 {
    if features.reputable_domain {
        0.0
    } else {
        1.0
    }
}

fn encoding_score(features: &Features) -> f64 {
    if features.has_encoding_issues {
        2.0
    } else {
        0.0
    }
}

fn from_to_mismatch_score(features: &Features) -> f64 {
    if features.from_to_mismatch {
        1.5
    } else {
        0.0
    }
}

/// Penalties apply strictly beyond the 5..=100 character comfort zone, so
/// lengths of exactly 5 and exactly 100 sit on the zero tier.
fn subject_length_score(features: &Features) -> f64 {
    let len = features.subject_length;
    if len > 100 {
        1.5
    } else if len > 0 && len < 5 {
        1.0
    } else {
        0.0
    }
}

/// Probability above 0.5 scaled linearly onto 0..=10.
fn bayes_component_score(probability: f64) -> f64 {
    if probability > 0.5 {
        (probability - 0.5) * 20.0
    } else {
        0.0
    }
}

fn auth_component_score(result: &AuthResult, penalties: &AuthPenalties) -> f64 {
    use crate::auth::SpfResult;

    let mut score = 0.0;
    match result.spf.result {
        SpfResult::Fail => score += penalties.spf_fail,
        SpfResult::SoftFail => score += penalties.spf_softfail,
        _ => {}
    }
    if !result.dkim.present {
        score += penalties.dkim_missing;
    } else if !result.dkim.valid {
        score += penalties.dkim_invalid;
    }
    if !result.dmarc.found {
        score += penalties.dmarc_missing;
    } else if !result.dmarc.valid {
        score += penalties.dmarc_fail;
    }
    score + result.suspicion_score as f64 * penalties.suspicion_factor
}
