//! Category-weighted keyword matching
//!
//! One Aho-Corasick automaton over all three risk tiers, built once at
//! startup. Each pattern counts once per message no matter how often it
//! repeats; the summed score is capped so keywords alone cannot saturate
//! the verdict.

use aho_corasick::AhoCorasick;
use std::collections::HashSet;
use zpam_common::config::KeywordsConfig;

const HIGH_RISK_WEIGHT: f64 = 2.5;
const MEDIUM_RISK_WEIGHT: f64 = 1.5;
const LOW_RISK_WEIGHT: f64 = 0.5;
const SCORE_CAP: f64 = 10.0;

pub struct KeywordMatcher {
    automaton: AhoCorasick,
    patterns: Vec<String>,
    weights: Vec<f64>,
}

impl KeywordMatcher {
    pub fn new(config: &KeywordsConfig) -> Self {
        let mut patterns = Vec::new();
        let mut weights = Vec::new();
        for (list, weight) in [
            (&config.high_risk, HIGH_RISK_WEIGHT),
            (&config.medium_risk, MEDIUM_RISK_WEIGHT),
            (&config.low_risk, LOW_RISK_WEIGHT),
        ] {
            for keyword in list {
                patterns.push(keyword.to_lowercase());
                weights.push(weight);
            }
        }
        let automaton = AhoCorasick::builder()
            .ascii_case_insensitive(true)
            .build(&patterns)
            .expect("keyword patterns are plain substrings");
        Self {
            automaton,
            patterns,
            weights,
        }
    }

    /// Score a subject+body text, returning the capped score and the
    /// distinct keywords that hit.
    pub fn score(&self, text: &str) -> (f64, Vec<String>) {
        let mut seen = HashSet::new();
        for hit in self.automaton.find_iter(text) {
            seen.insert(hit.pattern().as_usize());
        }
        let mut matched: Vec<usize> = seen.into_iter().collect();
        matched.sort_unstable();

        let score: f64 = matched.iter().map(|&i| self.weights[i]).sum();
        let keywords = matched
            .into_iter()
            .map(|i| self.patterns[i].clone())
            .collect();
        (score.min(SCORE_CAP), keywords)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matcher() -> KeywordMatcher {
        KeywordMatcher::new(&KeywordsConfig::default())
    }

    #[test]
    fn test_clean_text_scores_zero() {
        let (score, matched) = matcher().score("please review the meeting agenda for tuesday");
        assert_eq!(score, 0.0);
        assert!(matched.is_empty());
    }

    #[test]
    fn test_repeats_count_once() {
        let (single, _) = matcher().score("free money");
        let (repeated, _) = matcher().score("free money free money free money");
        assert_eq!(single, repeated);
    }

    #[test]
    fn test_matching_is_case_insensitive() {
        let (score, matched) = matcher().score("CONGRATULATIONS! CLICK HERE to claim the LOTTERY");
        assert!(score > 0.0);
        assert!(matched.contains(&"lottery".to_string()));
        assert!(matched.contains(&"click here".to_string()));
    }

    #[test]
    fn test_score_is_capped() {
        let everything = KeywordsConfig::default()
            .high_risk
            .join(" ");
        let (score, _) = matcher().score(&everything.repeat(3));
        assert!(score <= SCORE_CAP);
    }
}
