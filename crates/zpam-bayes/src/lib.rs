//! ZPAM Bayesian classification
//!
//! OSB tokenization over subject and body text, with train/classify served by
//! one of two interchangeable stores: an in-process vocabulary with a file
//! snapshot, or a Redis-backed store shared between processes. Classification
//! is a Robinson-Fisher style combination of per-token spam probabilities,
//! accumulated in log space to avoid underflow.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod file_store;
pub mod redis_store;
pub mod tokenizer;

pub use file_store::FileStore;
pub use redis_store::RedisStore;
pub use tokenizer::Tokenizer;

/// User id applied when the caller does not specify one
pub const DEFAULT_USER: &str = "global";

pub fn user_or_default(user: &str) -> &str {
    if user.is_empty() {
        DEFAULT_USER
    } else {
        user
    }
}

#[derive(Error, Debug)]
pub enum BayesError {
    #[error("store failure: {0}")]
    Store(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// Observation counts for one token under one user
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenCounts {
    pub spam: u64,
    pub ham: u64,
    /// Unix timestamp of the last learn that touched this token
    pub last_seen: i64,
}

impl TokenCounts {
    pub fn total(&self) -> u64 {
        self.spam + self.ham
    }
}

/// Per-user learning header
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserStats {
    pub spam_learned: u64,
    pub ham_learned: u64,
    /// Distinct-token estimate
    pub token_count: u64,
}

/// Outcome of one classification
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Classification {
    /// Spam probability in [0, 1]
    pub probability: f64,
    /// Tokens that cleared the minimum-count floor
    pub tokens_considered: usize,
}

/// Train/classify contract shared by both backends
#[async_trait]
pub trait BayesStore: Send + Sync {
    async fn train_spam(&self, subject: &str, body: &str, user: &str) -> Result<(), BayesError>;

    async fn train_ham(&self, subject: &str, body: &str, user: &str) -> Result<(), BayesError>;

    async fn classify(
        &self,
        subject: &str,
        body: &str,
        user: &str,
    ) -> Result<Classification, BayesError>;

    /// Forget everything learned for one user
    async fn reset(&self, user: &str) -> Result<(), BayesError>;

    async fn stats(&self, user: &str) -> Result<UserStats, BayesError>;

    /// Spam probability above which this component flags the message
    fn threshold(&self) -> f64;

    /// Persist state where the backend has something to persist
    async fn flush(&self) -> Result<(), BayesError> {
        Ok(())
    }
}

/// Combine per-token counts into a spam probability.
///
/// `p(T) = (spam + s) / (spam + ham + 2s)`; tokens whose total count is below
/// `min_count` are skipped. The product accumulator runs in log space and is
/// normalized against the complementary product, so a token trained once as
/// spam and once as ham contributes exactly nothing.
pub(crate) fn spam_probability<I>(counts: I, smoothing: f64, min_count: u64) -> Classification
where
    I: IntoIterator<Item = TokenCounts>,
{
    let mut ln_spam = 0.0f64;
    let mut ln_ham = 0.0f64;
    let mut considered = 0usize;

    for token in counts {
        let total = token.total();
        if total < min_count {
            continue;
        }
        let p = (token.spam as f64 + smoothing) / (total as f64 + 2.0 * smoothing);
        let p = p.clamp(1e-6, 1.0 - 1e-6);
        ln_spam += p.ln();
        ln_ham += (1.0 - p).ln();
        considered += 1;
    }

    if considered == 0 {
        return Classification {
            probability: 0.5,
            tokens_considered: 0,
        };
    }

    let max = ln_spam.max(ln_ham);
    let spam = (ln_spam - max).exp();
    let ham = (ln_ham - max).exp();
    Classification {
        probability: spam / (spam + ham),
        tokens_considered: considered,
    }
}
