//! Sender frequency tracking
//!
//! Sliding-window per-sender statistics for burst and bulk-sending
//! detection. One mutex protects the whole map; callers get defensive
//! copies, never references into it.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

/// Most timestamps kept per sender regardless of window
const WINDOW_CAP: usize = 1000;

#[derive(Debug, Clone)]
pub struct FrequencyConfig {
    /// Sliding window for the in-window count
    pub window: Duration,
    /// Sender cap; stale entries are purged when exceeded
    pub max_senders: usize,
    /// Entries idle longer than this are purged
    pub purge_age: Duration,
}

impl Default for FrequencyConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(3600),
            max_senders: 1000,
            purge_age: Duration::from_secs(86_400),
        }
    }
}

/// Per-sender sliding-window statistics
#[derive(Debug, Clone)]
pub struct SenderStats {
    pub domain: String,
    pub total_count: u64,
    pub recent: VecDeque<Instant>,
    pub first_seen: Instant,
    pub last_seen: Instant,
    pub suspicious_count: u64,
}

/// What one `track` call reports back to the aggregator
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrequencyResult {
    pub is_frequent_sender: bool,
    pub emails_in_window: usize,
    pub suspicious_ratio: f64,
    pub frequency_score: f64,
}

pub struct FrequencyTracker {
    config: FrequencyConfig,
    senders: Mutex<HashMap<String, SenderStats>>,
}

impl FrequencyTracker {
    pub fn new(config: FrequencyConfig) -> Self {
        Self {
            config,
            senders: Mutex::new(HashMap::new()),
        }
    }

    /// Record one sighting of `sender` and return its burst score.
    pub fn track(&self, sender: &str, domain: &str, was_marked_spam: bool) -> FrequencyResult {
        let now = Instant::now();
        let sender = sender.to_lowercase();
        let mut senders = self.senders.lock();

        if senders.len() >= self.config.max_senders {
            let purge_age = self.config.purge_age;
            senders.retain(|_, stats| now.duration_since(stats.last_seen) < purge_age);
        }

        let stats = senders.entry(sender).or_insert_with(|| SenderStats {
            domain: domain.to_lowercase(),
            total_count: 0,
            recent: VecDeque::new(),
            first_seen: now,
            last_seen: now,
            suspicious_count: 0,
        });

        stats.recent.push_back(now);
        while stats.recent.len() > WINDOW_CAP {
            stats.recent.pop_front();
        }
        let window = self.config.window;
        while let Some(front) = stats.recent.front() {
            if now.duration_since(*front) > window {
                stats.recent.pop_front();
            } else {
                break;
            }
        }

        stats.total_count += 1;
        stats.last_seen = now;
        if was_marked_spam {
            stats.suspicious_count += 1;
        }

        Self::score(stats, now)
    }

    /// Post-verdict feedback: the last message from this sender was spam.
    pub fn mark_spam(&self, sender: &str) {
        if let Some(stats) = self.senders.lock().get_mut(&sender.to_lowercase()) {
            stats.suspicious_count += 1;
        }
    }

    /// Defensive copy of one sender's statistics
    pub fn snapshot(&self, sender: &str) -> Option<SenderStats> {
        self.senders.lock().get(&sender.to_lowercase()).cloned()
    }

    fn score(stats: &SenderStats, now: Instant) -> FrequencyResult {
        let in_window = stats.recent.len();
        let mut score = 0.0;

        if in_window > 20 {
            score += 4.0;
        } else if in_window > 10 {
            score += 2.0;
        } else if in_window > 5 {
            score += 1.0;
        }

        let ratio = if stats.total_count == 0 {
            0.0
        } else {
            stats.suspicious_count as f64 / stats.total_count as f64
        };
        if ratio > 0.8 {
            score += 3.0;
        } else if ratio > 0.5 {
            score += 2.0;
        } else if ratio > 0.3 {
            score += 1.0;
        }

        // Brand-new sender already bursting.
        if now.duration_since(stats.first_seen) < Duration::from_secs(3600) && in_window > 5 {
            score += 2.0;
        }

        if in_window >= 2 {
            let span = stats
                .recent
                .back()
                .zip(stats.recent.front())
                .map(|(last, first)| last.duration_since(*first))
                .unwrap_or_default();
            let avg = span / (in_window as u32 - 1).max(1);
            if avg < Duration::from_secs(30) {
                score += 2.0;
            } else if avg < Duration::from_secs(120) {
                score += 1.0;
            }
        }

        FrequencyResult {
            is_frequent_sender: in_window > 5,
            emails_in_window: in_window,
            suspicious_ratio: ratio,
            frequency_score: score,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> FrequencyTracker {
        FrequencyTracker::new(FrequencyConfig::default())
    }

    #[test]
    fn test_first_sighting_scores_low_but_not_zero_information() {
        let tracker = tracker();
        let result = tracker.track("a@b.c", "b.c", false);
        assert_eq!(result.emails_in_window, 1);
        assert!(!result.is_frequent_sender);
    }

    #[test]
    fn test_score_is_monotone_in_window_count() {
        let tracker = tracker();
        let mut last = -1.0f64;
        for _ in 0..30 {
            let result = tracker.track("burst@spam.example", "spam.example", false);
            assert!(result.frequency_score >= last);
            last = result.frequency_score;
        }
        // 30 rapid-fire messages: count tier, new-sender tier and
        // inter-arrival tier all fire.
        assert!(last >= 8.0);
    }

    #[test]
    fn test_burst_exceeds_first_sighting() {
        let tracker = tracker();
        let first = tracker.track("x@y.z", "y.z", false);
        let mut latest = first;
        for _ in 0..6 {
            latest = tracker.track("x@y.z", "y.z", false);
        }
        assert!(latest.frequency_score > first.frequency_score);
        assert!(latest.is_frequent_sender);
    }

    #[test]
    fn test_suspicious_ratio_tiers() {
        let tracker = tracker();
        for _ in 0..9 {
            tracker.track("bad@bad.example", "bad.example", true);
        }
        let result = tracker.track("bad@bad.example", "bad.example", true);
        assert!(result.suspicious_ratio > 0.8);
        assert!(result.frequency_score >= 3.0);
    }

    #[test]
    fn test_mark_spam_feeds_back_into_ratio() {
        let tracker = tracker();
        tracker.track("s@d.e", "d.e", false);
        tracker.mark_spam("S@D.E");
        let snapshot = tracker.snapshot("s@d.e").unwrap();
        assert_eq!(snapshot.suspicious_count, 1);
    }

    #[test]
    fn test_senders_are_normalized() {
        let tracker = tracker();
        tracker.track("MiXeD@Case.Com", "case.com", false);
        let result = tracker.track("mixed@case.com", "case.com", false);
        assert_eq!(result.emails_in_window, 2);
    }

    #[test]
    fn test_snapshot_is_a_copy() {
        let tracker = tracker();
        tracker.track("a@b.c", "b.c", false);
        let mut snapshot = tracker.snapshot("a@b.c").unwrap();
        snapshot.total_count = 999;
        assert_eq!(tracker.snapshot("a@b.c").unwrap().total_count, 1);
    }
}
