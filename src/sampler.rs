// ============================================================================
// SECTION 11: ADAPTIVE SAMPLER
// ============================================================================
// Coherent per-key sampling with a feedback-controlled keep probability.
//
// The keep decision hashes the entity key, so every record of one logical
// event gets the same answer while the probability is unchanged. Once per
// control period the measured kept rate (EWMA smoothed) is compared with the
// class target and the probability is stepped multiplicatively. Rate-limited
// feedback steps it down immediately.
// ============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use ahash::AHashMap;
use arc_swap::ArcSwap;
use compact_str::CompactString;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use xxhash_rust::xxh3::xxh3_64_with_seed;

use crate::attr;
use crate::config::SamplerConfig;
use crate::types::{EntityKey, FeedbackSignal, OutcomeKind, QueryExecutionRecord};

/// Published view of every signal class
pub type SamplerSnapshot = HashMap<String, SamplerState>;

// ----------------------------------------------------------------------------
// 11.1 Per-Class State
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplerState {
    /// Kept records per second this class aims for
    pub target_rate: f64,
    /// Smoothed kept rate
    pub ewma_rate: f64,
    pub keep_probability: f64,
    pub kept_in_period: u64,
    pub seen_in_period: u64,
    /// Control ticks applied so far
    pub ticks: u64,
}

impl SamplerState {
    fn new(target_rate: f64, initial_probability: f64) -> Self {
        Self {
            target_rate,
            ewma_rate: 0.0,
            keep_probability: initial_probability,
            kept_in_period: 0,
            seen_in_period: 0,
            ticks: 0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SamplerStats {
    pub kept: u64,
    /// Kept through the slow-query bypass
    pub kept_slow: u64,
    pub sampled_out: u64,
    pub rate_limit_steps: u64,
    pub control_ticks: u64,
}

/// Position of a key in [0, 1), stable for a given seed.
pub fn key_fraction(key: &EntityKey, seed: u64) -> f64 {
    let raw = key.to_string();
    let hash = xxh3_64_with_seed(raw.as_bytes(), seed);
    // top 53 bits keep the result strictly below 1.0
    (hash >> 11) as f64 / (1u64 << 53) as f64
}

// ----------------------------------------------------------------------------
// 11.2 Sampler
// ----------------------------------------------------------------------------

/// Owns every class's state. Mutated only by the sampler stage.
#[derive(Debug)]
pub struct AdaptiveSampler {
    config: SamplerConfig,
    classes: AHashMap<CompactString, SamplerState>,
    published: Arc<ArcSwap<SamplerSnapshot>>,
    stats: SamplerStats,
}

impl AdaptiveSampler {
    pub fn new(config: SamplerConfig) -> Self {
        Self {
            config,
            classes: AHashMap::new(),
            published: Arc::new(ArcSwap::from_pointee(SamplerSnapshot::new())),
            stats: SamplerStats::default(),
        }
    }

    /// Handle readers use to load the latest published snapshot.
    pub fn snapshot_handle(&self) -> Arc<ArcSwap<SamplerSnapshot>> {
        Arc::clone(&self.published)
    }

    pub fn stats(&self) -> &SamplerStats {
        &self.stats
    }

    pub fn keep_probability(&self, class: &str) -> f64 {
        self.classes
            .get(class)
            .map(|s| s.keep_probability)
            .unwrap_or(self.config.initial_probability)
    }

    fn state_mut(&mut self, class: &str) -> &mut SamplerState {
        let target_rate = self.config.target_rate(class);
        let initial = self.initial_probability();
        self.classes
            .entry(CompactString::from(class))
            .or_insert_with(|| SamplerState::new(target_rate, initial))
    }

    fn initial_probability(&self) -> f64 {
        self.config
            .initial_probability
            .clamp(self.config.min_floor, self.config.ceiling)
    }

    /// Keep or drop. Same key and same probability give the same answer.
    pub fn should_keep(&mut self, record: &QueryExecutionRecord) -> bool {
        let slow = match (self.config.always_keep_slow_ms, record.measurement(attr::DURATION_MS)) {
            (Some(threshold), Some(duration)) => duration >= threshold,
            _ => false,
        };
        let seed = self.config.seed;
        let fraction = key_fraction(&record.entity_key, seed);

        let state = self.state_mut(record.signal_class());
        state.seen_in_period += 1;
        let keep = slow || fraction < state.keep_probability;
        if keep {
            state.kept_in_period += 1;
        }

        match (keep, slow) {
            (true, true) => {
                self.stats.kept += 1;
                self.stats.kept_slow += 1;
            }
            (true, false) => self.stats.kept += 1,
            (false, _) => self.stats.sampled_out += 1,
        }
        keep
    }

    /// Periodic adjustment. `period` is the time since the previous tick.
    pub fn control_tick(&mut self, period: Duration) {
        let secs = period.as_secs_f64().max(f64::EPSILON);
        let cfg = &self.config;
        for (class, state) in self.classes.iter_mut() {
            let measured = state.kept_in_period as f64 / secs;
            state.ewma_rate = if state.ticks == 0 {
                measured
            } else {
                cfg.ewma_alpha * measured + (1.0 - cfg.ewma_alpha) * state.ewma_rate
            };
            state.ticks += 1;

            let before = state.keep_probability;
            if state.ewma_rate > state.target_rate * (1.0 + cfg.deadband) {
                state.keep_probability *= cfg.decrease_factor;
            } else if state.ewma_rate < state.target_rate * (1.0 - cfg.deadband) {
                state.keep_probability *= cfg.increase_factor;
            }
            state.keep_probability = state.keep_probability.clamp(cfg.min_floor, cfg.ceiling);

            if (state.keep_probability - before).abs() > f64::EPSILON {
                debug!(
                    target: "dbintel::sampler",
                    class = %class,
                    measured,
                    ewma = state.ewma_rate,
                    target_rate = state.target_rate,
                    from = before,
                    to = state.keep_probability,
                    "Keep probability adjusted"
                );
            }
            state.kept_in_period = 0;
            state.seen_in_period = 0;
        }
        self.stats.control_ticks += 1;
        self.publish();
    }

    /// Apply one feedback signal. Rate limiting steps the class down at once.
    pub fn on_feedback(&mut self, signal: &FeedbackSignal) {
        if signal.kind != OutcomeKind::RateLimited {
            return;
        }
        let backoff = self.config.rate_limit_backoff;
        let floor = self.config.min_floor;
        let state = self.state_mut(&signal.target);
        let before = state.keep_probability;
        state.keep_probability = (state.keep_probability * backoff).max(floor);
        let after = state.keep_probability;
        self.stats.rate_limit_steps += 1;
        info!(
            target: "dbintel::sampler",
            class = %signal.target,
            from = before,
            to = after,
            "Backend rate limited, keep probability stepped down"
        );
        self.publish();
    }

    /// Republish every class's state for lock-free readers.
    pub fn publish(&self) {
        let snapshot: SamplerSnapshot = self
            .classes
            .iter()
            .map(|(class, state)| (class.to_string(), state.clone()))
            .collect();
        self.published.store(Arc::new(snapshot));
    }

    /// Current probability of every known class
    pub fn probabilities(&self) -> Vec<(String, f64)> {
        let mut out: Vec<(String, f64)> = self
            .classes
            .iter()
            .map(|(class, state)| (class.to_string(), state.keep_probability))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FailureCause, Measurement, SourceSet, Timestamp, WindowId};
    use proptest::prelude::*;
    use std::collections::BTreeMap;

    fn record(db: &str, id: &str, duration_ms: Option<f64>) -> QueryExecutionRecord {
        let key = EntityKey::new(db, id);
        let mut measurements = BTreeMap::new();
        if let Some(d) = duration_ms {
            measurements.insert(attr::DURATION_MS.to_string(), Measurement::gauge(d));
        }
        QueryExecutionRecord {
            window_id: WindowId::derive(&key, Timestamp::EPOCH, 0),
            entity_key: key,
            bucket_start: Timestamp::EPOCH,
            bucket_end: Timestamp::from_secs(10),
            closed_at: Timestamp::from_secs(12),
            generation: 0,
            sources: SourceSet::empty(),
            record_count: 1,
            attributes: BTreeMap::new(),
            measurements,
            plan: None,
            downsampled: false,
        }
    }

    fn rate_limited(target: &str) -> FeedbackSignal {
        FeedbackSignal {
            at: Timestamp::from_secs(1),
            target: target.into(),
            kind: OutcomeKind::RateLimited,
            cause: FailureCause::RateLimit,
        }
    }

    #[test]
    fn test_rate_limited_signals_step_down_immediately() {
        let mut sampler = AdaptiveSampler::new(SamplerConfig::default());
        sampler.should_keep(&record("db1", "q1", None));
        sampler.should_keep(&record("db2", "q1", None));
        assert_eq!(sampler.keep_probability("db1"), 1.0);

        for _ in 0..5 {
            sampler.on_feedback(&rate_limited("db1"));
        }
        assert!((sampler.keep_probability("db1") - 0.5f64.powi(5)).abs() < 1e-12);
        assert_eq!(sampler.keep_probability("db2"), 1.0);
        assert_eq!(sampler.stats().rate_limit_steps, 5);

        // published without waiting for a control tick
        let snapshot = sampler.snapshot_handle().load_full();
        assert!(snapshot["db1"].keep_probability < 0.05);
    }

    #[test]
    fn test_backoff_respects_floor() {
        let mut sampler = AdaptiveSampler::new(SamplerConfig::default());
        for _ in 0..50 {
            sampler.on_feedback(&rate_limited("db1"));
        }
        assert_eq!(sampler.keep_probability("db1"), 0.01);
    }

    #[test]
    fn test_success_signals_are_ignored() {
        let mut sampler = AdaptiveSampler::new(SamplerConfig::default());
        let mut signal = rate_limited("db1");
        signal.kind = OutcomeKind::Success;
        signal.cause = FailureCause::None;
        sampler.on_feedback(&signal);
        assert_eq!(sampler.stats().rate_limit_steps, 0);
        assert_eq!(sampler.keep_probability("db1"), 1.0);
    }

    #[test]
    fn test_control_tick_decreases_over_target() {
        let config = SamplerConfig {
            default_target_rate: 1.0,
            ..SamplerConfig::default()
        };
        let mut sampler = AdaptiveSampler::new(config);
        for i in 0..100 {
            sampler.should_keep(&record("db1", &format!("q{}", i), None));
        }
        sampler.control_tick(Duration::from_secs(10));
        // 10/s measured against a 1/s target
        assert!((sampler.keep_probability("db1") - 0.8).abs() < 1e-12);
    }

    #[test]
    fn test_control_tick_increases_under_target_and_clamps() {
        let config = SamplerConfig {
            initial_probability: 0.5,
            ..SamplerConfig::default()
        };
        let mut sampler = AdaptiveSampler::new(config);
        sampler.should_keep(&record("db1", "q1", None));
        sampler.control_tick(Duration::from_secs(30));
        assert!((sampler.keep_probability("db1") - 0.625).abs() < 1e-12);
        for _ in 0..10 {
            sampler.control_tick(Duration::from_secs(30));
        }
        assert_eq!(sampler.keep_probability("db1"), 1.0);
    }

    #[test]
    fn test_within_deadband_is_unchanged() {
        let config = SamplerConfig {
            default_target_rate: 10.0,
            initial_probability: 0.5,
            ..SamplerConfig::default()
        };
        let mut sampler = AdaptiveSampler::new(config);
        sampler.classes.insert(
            "db1".into(),
            SamplerState {
                kept_in_period: 100,
                ..SamplerState::new(10.0, 0.5)
            },
        );
        sampler.control_tick(Duration::from_secs(10));
        assert_eq!(sampler.keep_probability("db1"), 0.5);
    }

    #[test]
    fn test_slow_queries_bypass_sampling() {
        let mut sampler = AdaptiveSampler::new(SamplerConfig::default());
        for _ in 0..50 {
            sampler.on_feedback(&rate_limited("db1"));
        }
        let kept = (0..200)
            .filter(|i| sampler.should_keep(&record("db1", &format!("q{}", i), Some(2_500.0))))
            .count();
        assert_eq!(kept, 200);
        assert_eq!(sampler.stats().kept_slow, 200);
    }

    proptest! {
        #[test]
        fn prop_keep_decision_is_deterministic(
            db in "[a-z]{1,8}",
            id in "[a-z0-9]{1,16}",
            probability in 0.01f64..1.0,
        ) {
            let config = SamplerConfig {
                initial_probability: probability,
                always_keep_slow_ms: None,
                ..SamplerConfig::default()
            };
            let mut sampler = AdaptiveSampler::new(config);
            let r = record(&db, &id, None);
            let first = sampler.should_keep(&r);
            for _ in 0..5 {
                prop_assert_eq!(sampler.should_keep(&r), first);
            }
            let expected = key_fraction(&r.entity_key, 0) < probability;
            prop_assert_eq!(first, expected);
        }
    }
}
