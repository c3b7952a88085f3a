// ============================================================================
// SECTION 12: CIRCUIT BREAKER
// ============================================================================
// One breaker per export target, driven by feedback signals.
//
//   Closed ──(threshold failures inside the window)──▶ Open
//   Open ──(cooldown elapsed, on next acquire)──▶ HalfOpen
//   HalfOpen ──(success_threshold trial successes)──▶ Closed
//   HalfOpen ──(any trial failure)──▶ Open
//   HalfOpen ──(trial budget spent, no outcome within cooldown)──▶ Open
//
// Only the export dispatcher mutates breakers. Every transition republishes
// the state map so readers never lock.
// ============================================================================

use std::collections::{HashMap, VecDeque};
use std::fmt::{self, Display, Formatter};
use std::sync::Arc;
use std::time::Duration;

use ahash::AHashMap;
use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::BreakerConfig;
use crate::types::{FeedbackSignal, TargetId, Timestamp};

/// Published breaker state per target
pub type BreakerSnapshot = HashMap<String, CircuitState>;

// ----------------------------------------------------------------------------
// 12.1 States
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation
    Closed,
    /// Allowing a trial budget through to test recovery
    HalfOpen,
    /// Export short-circuited
    Open,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::HalfOpen => "half_open",
            CircuitState::Open => "open",
        }
    }

    /// Value of the `breaker_state` gauge
    pub fn as_gauge(&self) -> i64 {
        match self {
            CircuitState::Closed => 0,
            CircuitState::HalfOpen => 1,
            CircuitState::Open => 2,
        }
    }
}

impl Display for CircuitState {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Answer to an export attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquire {
    /// Go ahead. `trial` marks a half-open trial call.
    Permit { trial: bool },
    /// Target is open (or out of trial budget); no call is made.
    ShortCircuit,
}

impl Acquire {
    pub fn is_permit(&self) -> bool {
        matches!(self, Acquire::Permit { .. })
    }
}

// ----------------------------------------------------------------------------
// 12.2 Target Breaker
// ----------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct TargetBreaker {
    state: CircuitState,
    /// Timestamps of consecutive failures still inside the window
    failures: VecDeque<Timestamp>,
    opened_at: Timestamp,
    /// When the last trial permit went out
    last_trial_at: Timestamp,
    trials_issued: u32,
    trial_successes: u32,
}

impl TargetBreaker {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failures: VecDeque::new(),
            opened_at: Timestamp::EPOCH,
            last_trial_at: Timestamp::EPOCH,
            trials_issued: 0,
            trial_successes: 0,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn consecutive_failures(&self) -> usize {
        self.failures.len()
    }

    fn open(&mut self, now: Timestamp) {
        self.state = CircuitState::Open;
        self.opened_at = now;
        self.failures.clear();
        self.trials_issued = 0;
        self.trial_successes = 0;
    }

    fn acquire(&mut self, now: Timestamp, config: &BreakerConfig) -> Acquire {
        if self.state == CircuitState::Open {
            if now.duration_since(self.opened_at) < config.cooldown {
                return Acquire::ShortCircuit;
            }
            self.state = CircuitState::HalfOpen;
            self.trials_issued = 0;
            self.trial_successes = 0;
        }
        match self.state {
            CircuitState::Closed => Acquire::Permit { trial: false },
            CircuitState::HalfOpen if self.trials_issued < config.trial_budget => {
                self.trials_issued += 1;
                self.last_trial_at = now;
                Acquire::Permit { trial: true }
            }
            CircuitState::HalfOpen if self.trial_stalled(now, config) => {
                self.open(now);
                Acquire::ShortCircuit
            }
            _ => Acquire::ShortCircuit,
        }
    }

    /// Every trial is out and none has reported back within a cooldown.
    fn trial_stalled(&self, now: Timestamp, config: &BreakerConfig) -> bool {
        self.trials_issued >= config.trial_budget && now.duration_since(self.last_trial_at) >= config.cooldown
    }

    fn record(&mut self, signal: &FeedbackSignal, config: &BreakerConfig) {
        let now = signal.at;
        match (self.state, signal.is_failure()) {
            (CircuitState::Closed, false) => self.failures.clear(),
            (CircuitState::Closed, true) => {
                let horizon = now.sub_duration(config.failure_window);
                while self.failures.front().is_some_and(|t| *t < horizon) {
                    self.failures.pop_front();
                }
                self.failures.push_back(now);
                if self.failures.len() >= config.failure_threshold as usize {
                    self.open(now);
                }
            }
            (CircuitState::HalfOpen, false) => {
                self.trial_successes += 1;
                if self.trial_successes >= config.success_threshold {
                    self.state = CircuitState::Closed;
                    self.failures.clear();
                }
            }
            (CircuitState::HalfOpen, true) => self.open(now),
            // late outcomes of batches sent before the circuit opened
            (CircuitState::Open, _) => {}
        }
    }
}

// ----------------------------------------------------------------------------
// 12.3 Breaker Registry
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerStats {
    pub permits: u64,
    pub trials: u64,
    pub short_circuited: u64,
    pub opened: u64,
    pub closed: u64,
}

/// Breakers for every target seen so far.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    targets: AHashMap<TargetId, TargetBreaker>,
    published: Arc<ArcSwap<BreakerSnapshot>>,
    stats: BreakerStats,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            targets: AHashMap::new(),
            published: Arc::new(ArcSwap::from_pointee(BreakerSnapshot::new())),
            stats: BreakerStats::default(),
        }
    }

    pub fn snapshot_handle(&self) -> Arc<ArcSwap<BreakerSnapshot>> {
        Arc::clone(&self.published)
    }

    pub fn stats(&self) -> &BreakerStats {
        &self.stats
    }

    /// State of one target (closed if never seen)
    pub fn state(&self, target: &str) -> CircuitState {
        self.targets
            .get(target)
            .map(TargetBreaker::state)
            .unwrap_or(CircuitState::Closed)
    }

    pub fn target(&self, target: &str) -> Option<&TargetBreaker> {
        self.targets.get(target)
    }

    fn breaker_mut(&mut self, target: &str) -> &mut TargetBreaker {
        self.targets
            .entry(TargetId::from(target))
            .or_insert_with(TargetBreaker::new)
    }

    /// Ask to export to `target`. Moves an open target to half-open once its
    /// cooldown has elapsed.
    pub fn try_acquire(&mut self, target: &str, now: Timestamp) -> Acquire {
        let config = self.config.clone();
        let breaker = self.breaker_mut(target);
        let before = breaker.state();
        let decision = breaker.acquire(now, &config);
        let after = breaker.state();

        match decision {
            Acquire::Permit { trial: true } => {
                self.stats.permits += 1;
                self.stats.trials += 1;
            }
            Acquire::Permit { trial: false } => self.stats.permits += 1,
            Acquire::ShortCircuit => self.stats.short_circuited += 1,
        }
        if before != after {
            if after == CircuitState::Open {
                self.stats.opened += 1;
                warn!(target: "dbintel::breaker", target_id = target, "Trial outcomes missing, circuit reopened");
            } else {
                info!(target: "dbintel::breaker", target_id = target, from = %before, to = %after, "Circuit probing");
            }
            self.publish();
        }
        decision
    }

    /// Feed one export outcome. Returns the new state if it changed.
    pub fn on_signal(&mut self, signal: &FeedbackSignal) -> Option<CircuitState> {
        let config = self.config.clone();
        let breaker = self.breaker_mut(&signal.target);
        let before = breaker.state();
        breaker.record(signal, &config);
        let after = breaker.state();
        if before == after {
            return None;
        }

        match after {
            CircuitState::Open => {
                self.stats.opened += 1;
                warn!(
                    target: "dbintel::breaker",
                    target_id = %signal.target,
                    from = %before,
                    cause = signal.cause.as_str(),
                    cooldown_ms = config.cooldown.as_millis() as u64,
                    "Circuit opened"
                );
            }
            CircuitState::Closed => {
                self.stats.closed += 1;
                info!(target: "dbintel::breaker", target_id = %signal.target, "Circuit closed");
            }
            CircuitState::HalfOpen => {}
        }
        self.publish();
        Some(after)
    }

    /// Time left before an open target may be tried again
    pub fn retry_after(&self, target: &str, now: Timestamp) -> Option<Duration> {
        let breaker = self.targets.get(target)?;
        if breaker.state != CircuitState::Open {
            return None;
        }
        let elapsed = now.duration_since(breaker.opened_at);
        Some(self.config.cooldown.saturating_sub(elapsed))
    }

    pub fn publish(&self) {
        let snapshot: BreakerSnapshot = self
            .targets
            .iter()
            .map(|(target, breaker)| (target.to_string(), breaker.state()))
            .collect();
        self.published.store(Arc::new(snapshot));
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FailureCause, OutcomeKind};

    fn signal(target: &str, kind: OutcomeKind, at_secs: i64) -> FeedbackSignal {
        let cause = match kind {
            OutcomeKind::Success => FailureCause::None,
            OutcomeKind::Failure => FailureCause::Transport,
            OutcomeKind::RateLimited => FailureCause::RateLimit,
        };
        FeedbackSignal {
            at: Timestamp::from_secs(at_secs),
            target: target.into(),
            kind,
            cause,
        }
    }

    fn config() -> BreakerConfig {
        BreakerConfig {
            failure_threshold: 3,
            failure_window: Duration::from_secs(60),
            cooldown: Duration::from_secs(30),
            trial_budget: 2,
            success_threshold: 2,
            ..BreakerConfig::default()
        }
    }

    #[test]
    fn test_opens_after_threshold_for_one_target_only() {
        let mut breaker = CircuitBreaker::new(config());
        assert!(breaker.try_acquire("db1", Timestamp::from_secs(0)).is_permit());
        assert!(breaker.try_acquire("db2", Timestamp::from_secs(0)).is_permit());

        assert_eq!(breaker.on_signal(&signal("db1", OutcomeKind::Failure, 1)), None);
        assert_eq!(breaker.on_signal(&signal("db1", OutcomeKind::RateLimited, 2)), None);
        assert_eq!(
            breaker.on_signal(&signal("db1", OutcomeKind::Failure, 3)),
            Some(CircuitState::Open)
        );

        assert_eq!(breaker.try_acquire("db1", Timestamp::from_secs(10)), Acquire::ShortCircuit);
        assert_eq!(breaker.try_acquire("db1", Timestamp::from_secs(32)), Acquire::ShortCircuit);
        assert_eq!(breaker.state("db2"), CircuitState::Closed);
        assert!(breaker.try_acquire("db2", Timestamp::from_secs(10)).is_permit());

        let snapshot = breaker.snapshot_handle().load_full();
        assert_eq!(snapshot.get("db1"), Some(&CircuitState::Open));
        assert_eq!(snapshot.get("db2"), Some(&CircuitState::Closed));
        assert_eq!(breaker.stats().short_circuited, 2);
    }

    #[test]
    fn test_success_resets_consecutive_failures() {
        let mut breaker = CircuitBreaker::new(config());
        breaker.on_signal(&signal("db1", OutcomeKind::Failure, 1));
        breaker.on_signal(&signal("db1", OutcomeKind::Failure, 2));
        breaker.on_signal(&signal("db1", OutcomeKind::Success, 3));
        breaker.on_signal(&signal("db1", OutcomeKind::Failure, 4));
        breaker.on_signal(&signal("db1", OutcomeKind::Failure, 5));
        assert_eq!(breaker.state("db1"), CircuitState::Closed);
        assert_eq!(breaker.target("db1").unwrap().consecutive_failures(), 2);
    }

    #[test]
    fn test_failures_outside_window_do_not_count() {
        let mut breaker = CircuitBreaker::new(config());
        breaker.on_signal(&signal("db1", OutcomeKind::Failure, 0));
        breaker.on_signal(&signal("db1", OutcomeKind::Failure, 10));
        breaker.on_signal(&signal("db1", OutcomeKind::Failure, 100));
        assert_eq!(breaker.state("db1"), CircuitState::Closed);
        breaker.on_signal(&signal("db1", OutcomeKind::Failure, 110));
        assert_eq!(breaker.state("db1"), CircuitState::Closed);
        breaker.on_signal(&signal("db1", OutcomeKind::Failure, 120));
        assert_eq!(breaker.state("db1"), CircuitState::Open);
    }

    #[test]
    fn test_half_open_trials_close_the_circuit() {
        let mut breaker = CircuitBreaker::new(config());
        for t in 1..=3 {
            breaker.on_signal(&signal("db1", OutcomeKind::Failure, t));
        }
        assert_eq!(breaker.retry_after("db1", Timestamp::from_secs(13)), Some(Duration::from_secs(20)));

        let trial_at = Timestamp::from_secs(33);
        assert_eq!(breaker.try_acquire("db1", trial_at), Acquire::Permit { trial: true });
        assert_eq!(breaker.state("db1"), CircuitState::HalfOpen);
        assert_eq!(breaker.try_acquire("db1", trial_at), Acquire::Permit { trial: true });
        // trial budget spent
        assert_eq!(breaker.try_acquire("db1", trial_at), Acquire::ShortCircuit);

        assert_eq!(breaker.on_signal(&signal("db1", OutcomeKind::Success, 34)), None);
        assert_eq!(
            breaker.on_signal(&signal("db1", OutcomeKind::Success, 35)),
            Some(CircuitState::Closed)
        );
        assert_eq!(breaker.try_acquire("db1", Timestamp::from_secs(36)), Acquire::Permit { trial: false });
        assert_eq!(breaker.stats().closed, 1);
    }

    #[test]
    fn test_trial_failure_reopens_and_restarts_cooldown() {
        let mut breaker = CircuitBreaker::new(config());
        for t in 1..=3 {
            breaker.on_signal(&signal("db1", OutcomeKind::Failure, t));
        }
        assert!(breaker.try_acquire("db1", Timestamp::from_secs(40)).is_permit());
        assert_eq!(
            breaker.on_signal(&signal("db1", OutcomeKind::Failure, 41)),
            Some(CircuitState::Open)
        );
        assert_eq!(breaker.try_acquire("db1", Timestamp::from_secs(60)), Acquire::ShortCircuit);
        assert!(breaker.try_acquire("db1", Timestamp::from_secs(71)).is_permit());
        assert_eq!(breaker.stats().opened, 2);
    }

    #[test]
    fn test_half_open_without_trial_outcome_reopens() {
        let mut breaker = CircuitBreaker::new(BreakerConfig {
            trial_budget: 1,
            success_threshold: 1,
            ..config()
        });
        for t in 1..=3 {
            breaker.on_signal(&signal("db1", OutcomeKind::Failure, t));
        }
        assert_eq!(breaker.try_acquire("db1", Timestamp::from_secs(33)), Acquire::Permit { trial: true });
        // the trial's outcome never arrives
        assert_eq!(breaker.try_acquire("db1", Timestamp::from_secs(50)), Acquire::ShortCircuit);
        assert_eq!(breaker.state("db1"), CircuitState::HalfOpen);

        assert_eq!(breaker.try_acquire("db1", Timestamp::from_secs(63)), Acquire::ShortCircuit);
        assert_eq!(breaker.state("db1"), CircuitState::Open);
        assert_eq!(breaker.retry_after("db1", Timestamp::from_secs(63)), Some(Duration::from_secs(30)));

        // next cooldown ends with a fresh trial
        assert_eq!(breaker.try_acquire("db1", Timestamp::from_secs(93)), Acquire::Permit { trial: true });
        assert_eq!(
            breaker.on_signal(&signal("db1", OutcomeKind::Success, 94)),
            Some(CircuitState::Closed)
        );
        assert_eq!(breaker.stats().opened, 2);
    }

    #[test]
    fn test_gauge_values() {
        assert_eq!(CircuitState::Closed.as_gauge(), 0);
        assert_eq!(CircuitState::HalfOpen.as_gauge(), 1);
        assert_eq!(CircuitState::Open.as_gauge(), 2);
    }
}
