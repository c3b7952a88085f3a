// ============================================================================
// SECTION 14: EXPORT FEEDBACK MONITOR
// ============================================================================
// Classifies every export outcome and publishes the resulting signal to each
// subscriber (the sampler) on its own small bounded queue. Publishing never
// blocks: a full subscriber loses the signal and the loss is counted. The
// signal is also returned to the caller, which is how the breaker gets it.
// ============================================================================

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use flume::{Receiver as FlumeReceiver, Sender as FlumeSender, TrySendError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::config::FeedbackConfig;
use crate::types::{ExportOutcome, FailureCause, FeedbackSignal, OutcomeKind, Timestamp};

// ----------------------------------------------------------------------------
// 14.1 Error Tracking
// ----------------------------------------------------------------------------

/// Failures seen for one cause
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CauseSummary {
    pub cause: FailureCause,
    pub count: u64,
    pub first_seen: Timestamp,
    pub last_seen: Timestamp,
    pub last_target: String,
    pub last_message: Option<String>,
    pub alerted: bool,
}

#[derive(Debug, Default)]
struct ErrorTracker {
    by_cause: BTreeMap<&'static str, CauseSummary>,
}

impl ErrorTracker {
    /// Record a failure. Returns true the first time a cause crosses the threshold.
    fn record(&mut self, signal: &FeedbackSignal, message: Option<&str>, threshold: u64) -> bool {
        let entry = self
            .by_cause
            .entry(signal.cause.as_str())
            .or_insert_with(|| CauseSummary {
                cause: signal.cause,
                count: 0,
                first_seen: signal.at,
                last_seen: signal.at,
                last_target: String::new(),
                last_message: None,
                alerted: false,
            });
        entry.count += 1;
        entry.last_seen = signal.at;
        entry.last_target = signal.target.to_string();
        entry.last_message = message.map(str::to_string);
        if !entry.alerted && entry.count >= threshold {
            entry.alerted = true;
            return true;
        }
        false
    }
}

#[derive(Debug, Default)]
pub struct FeedbackStats {
    pub observed: AtomicU64,
    pub successes: AtomicU64,
    pub failures: AtomicU64,
    pub rate_limited: AtomicU64,
    /// Signals lost to a full subscriber queue
    pub signals_dropped: AtomicU64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedbackStatsSnapshot {
    pub observed: u64,
    pub successes: u64,
    pub failures: u64,
    pub rate_limited: u64,
    pub signals_dropped: u64,
    pub subscribers: usize,
}

// ----------------------------------------------------------------------------
// 14.2 Monitor
// ----------------------------------------------------------------------------

#[derive(Debug)]
pub struct ExportFeedbackMonitor {
    config: FeedbackConfig,
    rate_limit_patterns: Vec<String>,
    cause_patterns: Vec<(FailureCause, Vec<String>)>,
    subscribers: Mutex<Vec<FlumeSender<FeedbackSignal>>>,
    tracker: Mutex<ErrorTracker>,
    stats: FeedbackStats,
}

fn lowercase_all(patterns: &[String]) -> Vec<String> {
    patterns.iter().map(|p| p.to_lowercase()).collect()
}

impl ExportFeedbackMonitor {
    pub fn new(config: FeedbackConfig) -> Self {
        let cause_patterns = vec![
            (FailureCause::Cardinality, lowercase_all(&config.cardinality_patterns)),
            (FailureCause::Auth, lowercase_all(&config.auth_patterns)),
            (FailureCause::Timeout, lowercase_all(&config.timeout_patterns)),
            (FailureCause::Transport, lowercase_all(&config.transport_patterns)),
        ];
        Self {
            rate_limit_patterns: lowercase_all(&config.rate_limit_patterns),
            cause_patterns,
            config,
            subscribers: Mutex::new(Vec::new()),
            tracker: Mutex::new(ErrorTracker::default()),
            stats: FeedbackStats::default(),
        }
    }

    /// New subscriber queue. Each subscriber sees every signal once.
    pub fn subscribe(&self) -> FlumeReceiver<FeedbackSignal> {
        let (tx, rx) = flume::bounded(self.config.signal_capacity.max(1));
        self.subscribers.lock().push(tx);
        rx
    }

    /// Kind and cause of an outcome. Failures whose detail reads like rate
    /// limiting are promoted to `RateLimited`.
    pub fn classify(&self, outcome: &ExportOutcome) -> (OutcomeKind, FailureCause) {
        let detail = outcome
            .error_detail
            .as_deref()
            .unwrap_or_default()
            .to_lowercase();
        let hit = |patterns: &[String]| patterns.iter().any(|p| detail.contains(p.as_str()));

        match outcome.kind {
            OutcomeKind::Success => (OutcomeKind::Success, FailureCause::None),
            OutcomeKind::RateLimited => (OutcomeKind::RateLimited, FailureCause::RateLimit),
            OutcomeKind::Failure if hit(self.rate_limit_patterns.as_slice()) => {
                (OutcomeKind::RateLimited, FailureCause::RateLimit)
            }
            OutcomeKind::Failure => {
                let cause = self
                    .cause_patterns
                    .iter()
                    .find(|(_, patterns)| hit(patterns.as_slice()))
                    .map(|(cause, _)| *cause)
                    .unwrap_or(FailureCause::Other);
                (OutcomeKind::Failure, cause)
            }
        }
    }

    /// Classify an outcome and publish it to every subscriber.
    pub fn observe(&self, outcome: &ExportOutcome, now: Timestamp) -> FeedbackSignal {
        let (kind, cause) = self.classify(outcome);
        let signal = FeedbackSignal {
            at: now,
            target: outcome.target.clone(),
            kind,
            cause,
        };

        self.stats.observed.fetch_add(1, AtomicOrdering::Relaxed);
        match kind {
            OutcomeKind::Success => self.stats.successes.fetch_add(1, AtomicOrdering::Relaxed),
            OutcomeKind::Failure => self.stats.failures.fetch_add(1, AtomicOrdering::Relaxed),
            OutcomeKind::RateLimited => self.stats.rate_limited.fetch_add(1, AtomicOrdering::Relaxed),
        };

        if signal.is_failure() {
            let alert = self.tracker.lock().record(
                &signal,
                outcome.error_detail.as_deref(),
                self.config.alert_threshold,
            );
            if alert {
                error!(
                    target: "dbintel::feedback",
                    cause = cause.as_str(),
                    target_id = %signal.target,
                    threshold = self.config.alert_threshold,
                    detail = outcome.error_detail.as_deref().unwrap_or(""),
                    "Export failures reached alert threshold"
                );
            }
        }

        self.publish(&signal);
        signal
    }

    fn publish(&self, signal: &FeedbackSignal) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| match tx.try_send(signal.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.stats.signals_dropped.fetch_add(1, AtomicOrdering::Relaxed);
                debug!(target: "dbintel::feedback", target_id = %signal.target, "Subscriber full, signal dropped");
                true
            }
            Err(TrySendError::Disconnected(_)) => false,
        });
    }

    /// Signals lost so far to full subscriber queues
    pub fn signals_dropped(&self) -> u64 {
        self.stats.signals_dropped.load(AtomicOrdering::Relaxed)
    }

    pub fn stats(&self) -> FeedbackStatsSnapshot {
        FeedbackStatsSnapshot {
            observed: self.stats.observed.load(AtomicOrdering::Relaxed),
            successes: self.stats.successes.load(AtomicOrdering::Relaxed),
            failures: self.stats.failures.load(AtomicOrdering::Relaxed),
            rate_limited: self.stats.rate_limited.load(AtomicOrdering::Relaxed),
            signals_dropped: self.signals_dropped(),
            subscribers: self.subscribers.lock().len(),
        }
    }

    /// Per-cause failure summary
    pub fn error_summary(&self) -> Vec<CauseSummary> {
        self.tracker.lock().by_cause.values().cloned().collect()
    }
}

// ============================================================================
// TESTS
// ============================================================================
