//! Predictive preloader: scores models by recent usage and opportunistically
//! warms the top-K predicted models when admission would succeed without
//! evicting anything live (`SPEC_FULL.md` §4.8, resolving the scoring-weight
//! Open Question with `w_freq`/`w_recency` defaulting to 0.5/0.5 each).

use std::collections::HashMap;
use std::time::Duration;

use crate::domain_types::ModelId;

/// Tunables for the preloader's scoring and scheduling.
#[derive(Debug, Clone, Copy)]
pub struct PreloaderConfig {
    /// Window over which usage timestamps are retained.
    pub usage_window: Duration,
    /// How often the preloader re-scores and considers a preload.
    pub tick_interval: Duration,
    /// How many top-scoring models to consider preloading.
    pub top_k: usize,
    /// Weight applied to the frequency component of the score.
    pub w_freq: f64,
    /// Weight applied to the recency component of the score.
    pub w_recency: f64,
}

impl Default for PreloaderConfig {
    fn default() -> Self {
        Self {
            usage_window: Duration::from_secs(3600),
            tick_interval: Duration::from_secs(60),
            top_k: 3,
            w_freq: 0.5,
            w_recency: 0.5,
        }
    }
}

/// Tracks per-model usage timestamps over a rolling window and scores them.
#[derive(Debug, Default)]
pub struct UsageTracker {
    usages: HashMap<String, Vec<u64>>,
}

impl UsageTracker {
    /// Records one use of `model_id` at `at_ms`.
    pub fn record_use(&mut self, model_id: &ModelId, at_ms: u64) {
        self.usages.entry(model_id.to_string()).or_default().push(at_ms);
    }

    /// Scores every tracked model as of `now_ms`, retaining only usage
    /// samples within `window`. Score = `w_freq * count_in_window +
    /// w_recency * recency_bonus`, where `recency_bonus` decays linearly
    /// from 1.0 (just used) to 0.0 (at the edge of the window).
    #[must_use]
    pub fn score_all(&mut self, now_ms: u64, config: &PreloaderConfig) -> Vec<(String, f64)> {
        let window_ms = u64::try_from(config.usage_window.as_millis()).unwrap_or(u64::MAX);
        let mut scores = Vec::with_capacity(self.usages.len());
        self.usages.retain(|_, timestamps| {
            timestamps.retain(|&t| now_ms.saturating_sub(t) <= window_ms);
            !timestamps.is_empty()
        });
        for (model_id, timestamps) in &self.usages {
            #[allow(clippy::cast_precision_loss)]
            let frequency = timestamps.len() as f64;
            let most_recent = *timestamps.iter().max().unwrap_or(&0);
            let age_ms = now_ms.saturating_sub(most_recent);
            #[allow(clippy::cast_precision_loss)]
            let recency_bonus = 1.0 - (age_ms as f64 / window_ms.max(1) as f64).min(1.0);
            let score = config.w_freq * frequency + config.w_recency * recency_bonus;
            scores.push((model_id.clone(), score));
        }
        scores.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scores
    }

    /// Returns the top-`k` scored model ids, highest score first.
    #[must_use]
    pub fn top_k(&mut self, now_ms: u64, config: &PreloaderConfig) -> Vec<String> {
        self.score_all(now_ms, config)
            .into_iter()
            .take(config.top_k)
            .map(|(model_id, _)| model_id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frequently_and_recently_used_models_score_higher() {
        let mut tracker = UsageTracker::default();
        let hot = ModelId::try_new("hot").unwrap();
        let cold = ModelId::try_new("cold").unwrap();
        for t in [1000, 2000, 3000, 4000] {
            tracker.record_use(&hot, t);
        }
        tracker.record_use(&cold, 1000);

        let config = PreloaderConfig::default();
        let ranked = tracker.top_k(4000, &config);
        assert_eq!(ranked.first(), Some(&"hot".to_string()));
    }

    #[test]
    fn usage_outside_the_window_is_forgotten() {
        let mut tracker = UsageTracker::default();
        let stale = ModelId::try_new("stale").unwrap();
        tracker.record_use(&stale, 0);

        let config = PreloaderConfig {
            usage_window: Duration::from_secs(1),
            ..PreloaderConfig::default()
        };
        let scores = tracker.score_all(10_000, &config);
        assert!(scores.is_empty());
    }
}
