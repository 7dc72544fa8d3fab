//! OSB tokenizer
//!
//! Splits text into words, then emits orthogonal sparse bigrams: every pair
//! `(t_i, t_j)` with `i < j` and `j - i` at most the window size, with the
//! distance encoded into the token. Pairs capture phrase structure a unigram
//! vocabulary cannot, which is what lets short spam phrases ("free money")
//! outvote their harmless parts.

use zpam_common::config::TokenizerSettings;

pub struct Tokenizer {
    settings: TokenizerSettings,
}

impl Tokenizer {
    pub fn new(settings: TokenizerSettings) -> Self {
        Self { settings }
    }

    /// Tokenize subject and body as one stream.
    pub fn tokenize(&self, subject: &str, body: &str) -> Vec<String> {
        self.tokenize_parts(&[subject, body])
    }

    /// Tokenize subject, body and selected header values as one stream.
    pub fn tokenize_with_headers(
        &self,
        subject: &str,
        body: &str,
        header_values: &[&str],
    ) -> Vec<String> {
        let mut parts = vec![subject, body];
        parts.extend_from_slice(header_values);
        self.tokenize_parts(&parts)
    }

    fn tokenize_parts(&self, parts: &[&str]) -> Vec<String> {
        let mut words = Vec::new();
        for part in parts {
            self.words_into(part, &mut words);
        }
        self.emit_osb(&words)
    }

    fn words_into(&self, text: &str, out: &mut Vec<String>) {
        for word in text.split(|c: char| !c.is_alphanumeric()) {
            let len = word.chars().count();
            if len < self.settings.min_token_length || len > self.settings.max_token_length {
                continue;
            }
            if self.settings.case_sensitive {
                out.push(word.to_string());
            } else {
                out.push(word.to_lowercase());
            }
        }
    }

    /// Unigrams plus distance-encoded pairs, bounded at `max_tokens`.
    fn emit_osb(&self, words: &[String]) -> Vec<String> {
        let cap = self.settings.max_tokens;
        let window = self.settings.osb_window.max(1);
        let mut tokens = Vec::with_capacity(words.len().min(cap));

        for (i, word) in words.iter().enumerate() {
            if tokens.len() >= cap {
                break;
            }
            tokens.push(word.clone());
            for j in (i + 1)..words.len().min(i + 1 + window) {
                if tokens.len() >= cap {
                    break;
                }
                tokens.push(format!("{}~{}~{}", word, j - i, words[j]));
            }
        }
        tokens
    }
}
