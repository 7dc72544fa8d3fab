//! Redis-backed Bayesian store
//!
//! Per-token counters live in a shared Redis so several filter processes can
//! learn and classify against the same state. Commands are pipelined to
//! amortize round trips, and a local read-through cache keeps classification
//! latency bounded when the same tokens recur.
//!
//! Key scheme:
//! - `<prefix>:token:<user>:<token>` hash {spam, ham, last_seen}
//! - `<prefix>:user:<user>` hash {spam_learned, ham_learned}
//! - `<prefix>:tokens:<user>` HyperLogLog for the distinct-token estimate

use crate::tokenizer::Tokenizer;
use crate::{
    spam_probability, user_or_default, BayesError, BayesStore, Classification, TokenCounts,
    UserStats,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use zpam_common::config::{RedisBackendConfig, TokenizerSettings};

const LOCAL_CACHE_CAP: usize = 100_000;

pub struct RedisStore {
    manager: ConnectionManager,
    config: RedisBackendConfig,
    tokenizer: Tokenizer,
    cache: Mutex<HashMap<String, CachedCounts>>,
}

#[derive(Clone, Copy)]
struct CachedCounts {
    counts: TokenCounts,
    fetched: Instant,
}

fn token_key(prefix: &str, user: &str, token: &str) -> String {
    format!("{}:token:{}:{}", prefix, user, token)
}

fn user_key(prefix: &str, user: &str) -> String {
    format!("{}:user:{}", prefix, user)
}

fn tokens_key(prefix: &str, user: &str) -> String {
    format!("{}:tokens:{}", prefix, user)
}

fn cache_key(user: &str, token: &str) -> String {
    format!("{}:{}", user, token)
}

impl RedisStore {
    pub async fn connect(
        config: RedisBackendConfig,
        tokenizer: TokenizerSettings,
    ) -> Result<Self, BayesError> {
        let client = redis::Client::open(config.url.as_str())?;
        let manager = ConnectionManager::new(client).await?;
        Ok(Self {
            manager,
            config,
            tokenizer: Tokenizer::new(tokenizer),
            cache: Mutex::new(HashMap::new()),
        })
    }

    async fn train(
        &self,
        subject: &str,
        body: &str,
        user: &str,
        is_spam: bool,
    ) -> Result<(), BayesError> {
        let user = user_or_default(user);
        let tokens = self.tokenizer.tokenize(subject, body);
        let now = chrono::Utc::now().timestamp();
        let count_field = if is_spam { "spam" } else { "ham" };
        let learned_field = if is_spam { "spam_learned" } else { "ham_learned" };

        let mut pipe = redis::pipe();
        for token in &tokens {
            let key = token_key(&self.config.key_prefix, user, token);
            pipe.cmd("HINCRBY").arg(&key).arg(count_field).arg(1).ignore();
            pipe.cmd("HSET").arg(&key).arg("last_seen").arg(now).ignore();
            pipe.cmd("PFADD")
                .arg(tokens_key(&self.config.key_prefix, user))
                .arg(token)
                .ignore();
        }
        pipe.cmd("HINCRBY")
            .arg(user_key(&self.config.key_prefix, user))
            .arg(learned_field)
            .arg(1)
            .ignore();

        let mut conn = self.manager.clone();
        pipe.query_async::<_, ()>(&mut conn).await?;

        // Counts changed upstream; drop the stale read-through entries.
        let mut cache = self.cache.lock();
        for token in &tokens {
            cache.remove(&cache_key(user, token));
        }
        Ok(())
    }
}

#[async_trait]
impl BayesStore for RedisStore {
    async fn train_spam(&self, subject: &str, body: &str, user: &str) -> Result<(), BayesError> {
        self.train(subject, body, user, true).await
    }

    async fn train_ham(&self, subject: &str, body: &str, user: &str) -> Result<(), BayesError> {
        self.train(subject, body, user, false).await
    }

    async fn classify(
        &self,
        subject: &str,
        body: &str,
        user: &str,
    ) -> Result<Classification, BayesError> {
        let user = user_or_default(user);
        let tokens = self.tokenizer.tokenize(subject, body);
        let now = Instant::now();
        let ttl = Duration::from_secs(self.config.local_cache_ttl_secs);

        let mut counts: Vec<Option<TokenCounts>> = vec![None; tokens.len()];
        let mut missing = Vec::new();
        {
            let cache = self.cache.lock();
            for (i, token) in tokens.iter().enumerate() {
                match cache.get(&cache_key(user, token)) {
                    Some(entry) if now.duration_since(entry.fetched) < ttl => {
                        counts[i] = Some(entry.counts);
                    }
                    _ => missing.push(i),
                }
            }
        }

        if !missing.is_empty() {
            let mut pipe = redis::pipe();
            for &i in &missing {
                pipe.cmd("HMGET")
                    .arg(token_key(&self.config.key_prefix, user, &tokens[i]))
                    .arg("spam")
                    .arg("ham");
            }
            let mut conn = self.manager.clone();
            let fetched: Vec<(Option<u64>, Option<u64>)> = pipe.query_async(&mut conn).await?;

            let mut cache = self.cache.lock();
            if cache.len() > LOCAL_CACHE_CAP {
                cache.clear();
            }
            for (&i, (spam, ham)) in missing.iter().zip(fetched) {
                let entry = TokenCounts {
                    spam: spam.unwrap_or(0),
                    ham: ham.unwrap_or(0),
                    last_seen: 0,
                };
                counts[i] = Some(entry);
                cache.insert(
                    cache_key(user, &tokens[i]),
                    CachedCounts {
                        counts: entry,
                        fetched: now,
                    },
                );
            }
        }

        Ok(spam_probability(
            counts.into_iter().flatten(),
            self.config.smoothing_factor,
            self.config.min_token_count,
        ))
    }

    async fn reset(&self, user: &str) -> Result<(), BayesError> {
        let user = user_or_default(user);
        let pattern = token_key(&self.config.key_prefix, user, "*");
        let mut conn = self.manager.clone();

        let mut cursor: u64 = 0;
        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(200)
                .query_async(&mut conn)
                .await?;
            if !keys.is_empty() {
                redis::cmd("DEL").arg(&keys).query_async::<_, ()>(&mut conn).await?;
            }
            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        redis::cmd("DEL")
            .arg(user_key(&self.config.key_prefix, user))
            .arg(tokens_key(&self.config.key_prefix, user))
            .query_async::<_, ()>(&mut conn)
            .await?;

        let user_prefix = format!("{}:", user);
        self.cache.lock().retain(|key, _| !key.starts_with(&user_prefix));
        Ok(())
    }

    async fn stats(&self, user: &str) -> Result<UserStats, BayesError> {
        let user = user_or_default(user);
        let mut conn = self.manager.clone();
        let fields: HashMap<String, u64> =
            conn.hgetall(user_key(&self.config.key_prefix, user)).await?;
        let token_count: u64 = redis::cmd("PFCOUNT")
            .arg(tokens_key(&self.config.key_prefix, user))
            .query_async(&mut conn)
            .await?;
        Ok(UserStats {
            spam_learned: fields.get("spam_learned").copied().unwrap_or(0),
            ham_learned: fields.get("ham_learned").copied().unwrap_or(0),
            token_count,
        })
    }

    fn threshold(&self) -> f64 {
        self.config.threshold
    }
}
