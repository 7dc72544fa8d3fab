//! File-backed Bayesian store
//!
//! The whole vocabulary lives in memory behind one mutex and serializes to a
//! single JSON snapshot on save. Suitable for single-process deployments.
//! When a user's vocabulary hits its cap, the least-informative token (the
//! smallest |spam - ham| spread) is dropped to make room.

use crate::tokenizer::Tokenizer;
use crate::{
    spam_probability, user_or_default, BayesError, BayesStore, Classification, TokenCounts,
    UserStats,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use zpam_common::config::{FileBackendConfig, TokenizerSettings};

pub struct FileStore {
    config: FileBackendConfig,
    tokenizer: Tokenizer,
    inner: Mutex<Vocabulary>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Vocabulary {
    users: HashMap<String, UserVocabulary>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct UserVocabulary {
    tokens: HashMap<String, TokenCounts>,
    stats: UserStats,
}

impl FileStore {
    pub fn new(config: FileBackendConfig, tokenizer: TokenizerSettings) -> Self {
        Self {
            config,
            tokenizer: Tokenizer::new(tokenizer),
            inner: Mutex::new(Vocabulary::default()),
        }
    }

    /// Create a store, loading the snapshot at `model_path` when present.
    pub fn open(config: FileBackendConfig, tokenizer: TokenizerSettings) -> Result<Self, BayesError> {
        let store = Self::new(config, tokenizer);
        let path = store.config.model_path.clone();
        if Path::new(&path).exists() {
            store.load(&path)?;
        }
        Ok(store)
    }

    pub fn load(&self, path: &str) -> Result<(), BayesError> {
        let content = std::fs::read_to_string(path)?;
        let vocabulary: Vocabulary = serde_json::from_str(&content)?;
        *self.inner.lock() = vocabulary;
        Ok(())
    }

    pub fn save(&self, path: &str) -> Result<(), BayesError> {
        let content = {
            let inner = self.inner.lock();
            serde_json::to_string(&*inner)?
        };
        std::fs::write(path, content)?;
        Ok(())
    }

    fn train(&self, subject: &str, body: &str, user: &str, is_spam: bool) {
        let mut inner = self.inner.lock();
        self.train_locked(&mut inner, subject, body, user, is_spam);
    }

    fn train_locked(
        &self,
        inner: &mut Vocabulary,
        subject: &str,
        body: &str,
        user: &str,
        is_spam: bool,
    ) {
        let tokens = self.tokenizer.tokenize(subject, body);
        let vocabulary = inner.users.entry(user_or_default(user).to_string()).or_default();
        let now = chrono::Utc::now().timestamp();

        for token in tokens {
            if !vocabulary.tokens.contains_key(&token)
                && vocabulary.tokens.len() >= self.config.max_vocabulary
            {
                Self::evict_least_informative(&mut vocabulary.tokens);
            }
            let counts = vocabulary.tokens.entry(token).or_default();
            if is_spam {
                counts.spam += 1;
            } else {
                counts.ham += 1;
            }
            counts.last_seen = now;
        }

        if is_spam {
            vocabulary.stats.spam_learned += 1;
        } else {
            vocabulary.stats.ham_learned += 1;
        }
        vocabulary.stats.token_count = vocabulary.tokens.len() as u64;
    }

    /// Train a labeled batch under a single lock acquisition.
    pub fn train_batch(&self, samples: &[(String, String, bool)], user: &str) {
        let mut inner = self.inner.lock();
        for (subject, body, is_spam) in samples {
            self.train_locked(&mut inner, subject, body, user, *is_spam);
        }
    }

    fn evict_least_informative(tokens: &mut HashMap<String, TokenCounts>) {
        let weakest = tokens
            .iter()
            .min_by_key(|(_, counts)| (counts.spam as i64 - counts.ham as i64).abs())
            .map(|(token, _)| token.clone());
        if let Some(token) = weakest {
            tokens.remove(&token);
        }
    }
}

#[async_trait]
impl BayesStore for FileStore {
    async fn train_spam(&self, subject: &str, body: &str, user: &str) -> Result<(), BayesError> {
        self.train(subject, body, user, true);
        Ok(())
    }

    async fn train_ham(&self, subject: &str, body: &str, user: &str) -> Result<(), BayesError> {
        self.train(subject, body, user, false);
        Ok(())
    }

    async fn classify(
        &self,
        subject: &str,
        body: &str,
        user: &str,
    ) -> Result<Classification, BayesError> {
        let tokens = self.tokenizer.tokenize(subject, body);
        let inner = self.inner.lock();
        let counts: Vec<TokenCounts> = match inner.users.get(user_or_default(user)) {
            Some(vocabulary) => tokens
                .iter()
                .filter_map(|t| vocabulary.tokens.get(t).copied())
                .collect(),
            None => Vec::new(),
        };
        Ok(spam_probability(
            counts,
            self.config.smoothing_factor,
            self.config.min_token_count,
        ))
    }

    async fn reset(&self, user: &str) -> Result<(), BayesError> {
        self.inner.lock().users.remove(user_or_default(user));
        Ok(())
    }

    async fn stats(&self, user: &str) -> Result<UserStats, BayesError> {
        Ok(self
            .inner
            .lock()
            .users
            .get(user_or_default(user))
            .map(|v| v.stats)
            .unwrap_or_default())
    }

    fn threshold(&self) -> f64 {
        self.config.threshold
    }

    async fn flush(&self) -> Result<(), BayesError> {
        self.save(&self.config.model_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> FileStore {
        FileStore::new(FileBackendConfig::default(), TokenizerSettings::default())
    }

    const SPAM: (&str, &str) = (
        "CONGRATULATIONS WINNER",
        "you have won the lottery claim your free money now",
    );
    const HAM: (&str, &str) = (
        "Weekly meeting notes",
        "please review the quarterly report before the team meeting",
    );

    #[tokio::test]
    async fn test_training_shifts_probability_up() {
        let store = store();
        let untrained = store.classify(SPAM.0, SPAM.1, "").await.unwrap();

        // Two passes clear the default minimum token count of 2.
        store.train_spam(SPAM.0, SPAM.1, "").await.unwrap();
        store.train_spam(SPAM.0, SPAM.1, "").await.unwrap();

        let trained = store.classify(SPAM.0, SPAM.1, "").await.unwrap();
        assert!(trained.probability > untrained.probability);
        assert!(trained.tokens_considered > 0);
    }

    #[tokio::test]
    async fn test_ham_training_shifts_probability_down() {
        let store = store();
        store.train_ham(HAM.0, HAM.1, "").await.unwrap();
        store.train_ham(HAM.0, HAM.1, "").await.unwrap();

        let result = store.classify(HAM.0, HAM.1, "").await.unwrap();
        assert!(result.probability < 0.5);
    }

    #[tokio::test]
    async fn test_spam_plus_ham_learn_is_neutral() {
        let store = store();
        store.train_spam(SPAM.0, SPAM.1, "").await.unwrap();
        store.train_ham(SPAM.0, SPAM.1, "").await.unwrap();

        let result = store.classify(SPAM.0, SPAM.1, "").await.unwrap();
        assert!((result.probability - 0.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_classification_is_deterministic() {
        let store = store();
        store.train_spam(SPAM.0, SPAM.1, "").await.unwrap();
        store.train_ham(HAM.0, HAM.1, "").await.unwrap();

        let first = store.classify(SPAM.0, SPAM.1, "").await.unwrap();
        let second = store.classify(SPAM.0, SPAM.1, "").await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_users_are_isolated() {
        let store = store();
        store.train_spam(SPAM.0, SPAM.1, "alice").await.unwrap();
        store.train_spam(SPAM.0, SPAM.1, "alice").await.unwrap();

        let alice = store.classify(SPAM.0, SPAM.1, "alice").await.unwrap();
        let fresh = store.classify(SPAM.0, SPAM.1, "bob").await.unwrap();
        assert!(alice.probability > fresh.probability);
    }

    #[tokio::test]
    async fn test_reset_forgets_user() {
        let store = store();
        store.train_spam(SPAM.0, SPAM.1, "").await.unwrap();
        store.reset("").await.unwrap();

        let stats = store.stats("").await.unwrap();
        assert_eq!(stats, UserStats::default());
        let result = store.classify(SPAM.0, SPAM.1, "").await.unwrap();
        assert_eq!(result.probability, 0.5);
    }

    #[tokio::test]
    async fn test_stats_count_learns() {
        let store = store();
        store.train_spam(SPAM.0, SPAM.1, "").await.unwrap();
        store.train_ham(HAM.0, HAM.1, "").await.unwrap();

        let stats = store.stats("").await.unwrap();
        assert_eq!(stats.spam_learned, 1);
        assert_eq!(stats.ham_learned, 1);
        assert!(stats.token_count > 0);
    }

    #[tokio::test]
    async fn test_vocabulary_cap_drops_least_informative() {
        let config = FileBackendConfig {
            max_vocabulary: 20,
            ..Default::default()
        };
        let store = FileStore::new(config, TokenizerSettings::default());

        for i in 0..30 {
            let body = format!("unique{} filler words alpha beta", i);
            store.train_spam("subject", &body, "").await.unwrap();
        }
        let stats = store.stats("").await.unwrap();
        assert!(stats.token_count <= 20);
    }

    #[tokio::test]
    async fn test_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.json");
        let path = path.to_str().unwrap();

        let store_instance = store();
        store_instance.train_spam(SPAM.0, SPAM.1, "").await.unwrap();
        store_instance.train_spam(SPAM.0, SPAM.1, "").await.unwrap();
        let before = store_instance.classify(SPAM.0, SPAM.1, "").await.unwrap();
        store_instance.save(path).unwrap();

        let restored = store();
        restored.load(path).unwrap();
        let after = restored.classify(SPAM.0, SPAM.1, "").await.unwrap();
        assert_eq!(before, after);
    }
}
