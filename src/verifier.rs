// ============================================================================
// SECTION 13: VERIFIER
// ============================================================================
// Last gate before export. A record that breaks any rule is quarantined:
// counted by reason, occasionally copied to a diagnostic sink, never exported.
// A bounded memory of emitted window ids rejects replays.
// ============================================================================

use std::collections::{BTreeMap, VecDeque};

use ahash::AHashSet;
use flume::Sender as FlumeSender;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::VerifierConfig;
use crate::types::{AttrValue, QueryExecutionRecord, WindowId};

// ----------------------------------------------------------------------------
// 13.1 Violations
// ----------------------------------------------------------------------------

#[derive(Error, Debug, Clone, PartialEq)]
pub enum Violation {
    #[error("entity key has an empty part")]
    EmptyKey,

    #[error("record has no contributing source")]
    NoSources,

    #[error("window merged no records")]
    EmptyWindow,

    #[error("required attribute missing: {0}")]
    MissingAttribute(String),

    #[error("required measurement missing: {0}")]
    MissingMeasurement(String),

    #[error("measurement {0} is not finite")]
    NonFinite(String),

    #[error("measurement {name} is negative: {value}")]
    Negative { name: String, value: f64 },

    #[error("{count} attributes exceed the cap of {max}")]
    TooManyAttributes { count: usize, max: usize },

    #[error("attribute {name} is {len} bytes long")]
    AttributeTooLong { name: String, len: usize },

    #[error("window {0} was already emitted")]
    DuplicateWindow(WindowId),
}

impl Violation {
    /// Label used for the quarantine counter
    pub fn reason(&self) -> &'static str {
        match self {
            Violation::EmptyKey => "empty_key",
            Violation::NoSources => "no_sources",
            Violation::EmptyWindow => "empty_window",
            Violation::MissingAttribute(_) => "missing_attribute",
            Violation::MissingMeasurement(_) => "missing_measurement",
            Violation::NonFinite(_) => "non_finite",
            Violation::Negative { .. } => "negative_value",
            Violation::TooManyAttributes { .. } => "too_many_attributes",
            Violation::AttributeTooLong { .. } => "attribute_too_long",
            Violation::DuplicateWindow(_) => "duplicate_window",
        }
    }
}

/// A quarantined record as handed to the diagnostic sink
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuarantinedRecord {
    pub reason: String,
    pub detail: String,
    pub record: QueryExecutionRecord,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifierStats {
    pub passed: u64,
    pub quarantined: u64,
    pub by_reason: BTreeMap<String, u64>,
    pub diagnostics_sent: u64,
    pub diagnostics_dropped: u64,
}

// ----------------------------------------------------------------------------
// 13.2 Verifier
// ----------------------------------------------------------------------------

#[derive(Debug)]
pub struct Verifier {
    config: VerifierConfig,
    seen_order: VecDeque<WindowId>,
    seen: AHashSet<WindowId>,
    diagnostics: Option<FlumeSender<QuarantinedRecord>>,
    stats: VerifierStats,
}

impl Verifier {
    pub fn new(config: VerifierConfig) -> Self {
        Self {
            seen_order: VecDeque::with_capacity(config.duplicate_memory.min(4096)),
            seen: AHashSet::new(),
            config,
            diagnostics: None,
            stats: VerifierStats::default(),
        }
    }

    /// Attach a sink that receives every Nth quarantined record.
    pub fn with_diagnostic_sink(mut self, sink: FlumeSender<QuarantinedRecord>) -> Self {
        self.diagnostics = Some(sink);
        self
    }

    pub fn stats(&self) -> &VerifierStats {
        &self.stats
    }

    /// Pass the record on, or quarantine it and report why.
    pub fn verify(&mut self, record: QueryExecutionRecord) -> Result<QueryExecutionRecord, Violation> {
        let outcome = self
            .check_rules(&record)
            .and_then(|()| self.check_duplicate(record.window_id));
        match outcome {
            Ok(()) => {
                self.stats.passed += 1;
                Ok(record)
            }
            Err(violation) => {
                self.quarantine(record, &violation);
                Err(violation)
            }
        }
    }

    fn check_rules(&self, record: &QueryExecutionRecord) -> Result<(), Violation> {
        let key = &record.entity_key;
        if key.database.trim().is_empty() || key.identifier.trim().is_empty() {
            return Err(Violation::EmptyKey);
        }
        if record.sources.is_empty() {
            return Err(Violation::NoSources);
        }
        if record.record_count == 0 {
            return Err(Violation::EmptyWindow);
        }

        for name in &self.config.required_attributes {
            if !record.attributes.contains_key(name) {
                return Err(Violation::MissingAttribute(name.clone()));
            }
        }
        for name in &self.config.required_measurements {
            if !record.measurements.contains_key(name) {
                return Err(Violation::MissingMeasurement(name.clone()));
            }
        }

        for (name, measurement) in &record.measurements {
            let value = measurement.value;
            if !value.is_finite() {
                return Err(Violation::NonFinite(name.clone()));
            }
            let must_be_positive =
                name.contains("duration") || self.config.non_negative.iter().any(|n| n == name);
            if must_be_positive && value < 0.0 {
                return Err(Violation::Negative {
                    name: name.clone(),
                    value,
                });
            }
        }

        if record.attributes.len() > self.config.max_attributes {
            return Err(Violation::TooManyAttributes {
                count: record.attributes.len(),
                max: self.config.max_attributes,
            });
        }
        for (name, value) in &record.attributes {
            if let AttrValue::Str(s) = value {
                if s.len() > self.config.max_attribute_len {
                    return Err(Violation::AttributeTooLong {
                        name: name.clone(),
                        len: s.len(),
                    });
                }
            }
        }
        Ok(())
    }

    fn check_duplicate(&mut self, id: WindowId) -> Result<(), Violation> {
        if !self.seen.insert(id) {
            return Err(Violation::DuplicateWindow(id));
        }
        self.seen_order.push_back(id);
        while self.seen_order.len() > self.config.duplicate_memory {
            if let Some(oldest) = self.seen_order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        Ok(())
    }

    fn quarantine(&mut self, record: QueryExecutionRecord, violation: &Violation) {
        self.stats.quarantined += 1;
        *self
            .stats
            .by_reason
            .entry(violation.reason().to_string())
            .or_insert(0) += 1;
        debug!(
            target: "dbintel::verifier",
            key = %record.entity_key,
            window = %record.window_id,
            reason = violation.reason(),
            "Record quarantined"
        );

        if (self.stats.quarantined - 1) % self.config.diagnostic_every.max(1) != 0 {
            return;
        }
        warn!(
            target: "dbintel::verifier",
            key = %record.entity_key,
            quarantined = self.stats.quarantined,
            "Quarantine sample: {}",
            violation
        );
        if let Some(sink) = &self.diagnostics {
            let sample = QuarantinedRecord {
                reason: violation.reason().to_string(),
                detail: violation.to_string(),
                record,
            };
            match sink.try_send(sample) {
                Ok(()) => self.stats.diagnostics_sent += 1,
                Err(_) => self.stats.diagnostics_dropped += 1,
            }
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EntityKey, Measurement, SourceKind, SourceSet, Timestamp};
    use test_case::test_case;

    fn record(id: &str) -> QueryExecutionRecord {
        let key = EntityKey::new("db1", id);
        let mut measurements = BTreeMap::new();
        measurements.insert("duration_ms".to_string(), Measurement::gauge(12.5));
        measurements.insert("calls".to_string(), Measurement::counter(3.0));
        let mut attributes = BTreeMap::new();
        attributes.insert("db.user".to_string(), AttrValue::from("app"));
        QueryExecutionRecord {
            window_id: crate::types::WindowId::derive(&key, Timestamp::EPOCH, 0),
            entity_key: key,
            bucket_start: Timestamp::EPOCH,
            bucket_end: Timestamp::from_secs(10),
            closed_at: Timestamp::from_secs(12),
            generation: 0,
            sources: [SourceKind::Session, SourceKind::QueryStat].into_iter().collect(),
            record_count: 2,
            attributes,
            measurements,
            plan: None,
            downsampled: false,
        }
    }

    #[test]
    fn test_valid_record_passes() {
        let mut verifier = Verifier::new(VerifierConfig::default());
        let r = record("q1");
        assert_eq!(verifier.verify(r.clone()), Ok(r));
        assert_eq!(verifier.stats().passed, 1);
    }

    #[test_case("duration_ms", -1.0, "negative_value" ; "negative duration")]
    #[test_case("lock_wait_duration", -0.5, "negative_value" ; "any duration name")]
    #[test_case("rows", -3.0, "negative_value" ; "negative rows")]
    #[test_case("cpu_time", f64::NAN, "non_finite" ; "nan")]
    #[test_case("calls", f64::INFINITY, "non_finite" ; "infinite")]
    fn test_measurement_rules(name: &str, value: f64, reason: &str) {
        let mut verifier = Verifier::new(VerifierConfig::default());
        let mut r = record("q1");
        r.measurements.insert(name.to_string(), Measurement::gauge(value));
        let violation = verifier.verify(r).unwrap_err();
        assert_eq!(violation.reason(), reason);
        assert_eq!(verifier.stats().by_reason.get(reason), Some(&1));
    }

    #[test]
    fn test_negative_unlisted_measurement_is_allowed() {
        let mut verifier = Verifier::new(VerifierConfig::default());
        let mut r = record("q1");
        r.measurements.insert("replication_lag_delta".into(), Measurement::gauge(-4.0));
        assert!(verifier.verify(r).is_ok());
    }

    #[test]
    fn test_structural_rules() {
        let mut verifier = Verifier::new(VerifierConfig {
            required_attributes: vec!["db.query.fingerprint".into()],
            ..VerifierConfig::default()
        });
        assert_eq!(
            verifier.verify(record("q1")).unwrap_err(),
            Violation::MissingAttribute("db.query.fingerprint".into())
        );

        let mut verifier = Verifier::new(VerifierConfig {
            required_measurements: vec!["rows".into()],
            ..VerifierConfig::default()
        });
        assert_eq!(verifier.verify(record("q1")).unwrap_err().reason(), "missing_measurement");

        let mut verifier = Verifier::new(VerifierConfig::default());
        let mut r = record("q2");
        r.sources = SourceSet::empty();
        assert_eq!(verifier.verify(r).unwrap_err(), Violation::NoSources);

        let mut r = record("q3");
        r.record_count = 0;
        assert_eq!(verifier.verify(r).unwrap_err(), Violation::EmptyWindow);

        let mut r = record("q4");
        r.entity_key.identifier = " ".into();
        assert_eq!(verifier.verify(r).unwrap_err(), Violation::EmptyKey);
    }

    #[test]
    fn test_attribute_caps() {
        let mut verifier = Verifier::new(VerifierConfig {
            max_attributes: 2,
            max_attribute_len: 8,
            ..VerifierConfig::default()
        });
        let mut r = record("q1");
        r.set_attribute("a", 1i64);
        r.set_attribute("b", 2i64);
        assert_eq!(
            verifier.verify(r).unwrap_err(),
            Violation::TooManyAttributes { count: 3, max: 2 }
        );

        let mut r = record("q2");
        r.set_attribute("db.user", "a-very-long-user-name");
        assert_eq!(verifier.verify(r).unwrap_err().reason(), "attribute_too_long");
    }

    #[test]
    fn test_replayed_window_is_rejected() {
        let mut verifier = Verifier::new(VerifierConfig::default());
        let r = record("q1");
        assert!(verifier.verify(r.clone()).is_ok());
        assert_eq!(
            verifier.verify(r.clone()).unwrap_err(),
            Violation::DuplicateWindow(r.window_id)
        );
        assert_eq!(verifier.stats().quarantined, 1);
    }

    #[test]
    fn test_duplicate_memory_is_bounded() {
        let mut verifier = Verifier::new(VerifierConfig {
            duplicate_memory: 2,
            ..VerifierConfig::default()
        });
        for id in ["q1", "q2", "q3"] {
            assert!(verifier.verify(record(id)).is_ok());
        }
        // q1 has been forgotten, q3 has not
        assert!(verifier.verify(record("q1")).is_ok());
        assert!(verifier.verify(record("q3")).is_err());
    }

    #[test]
    fn test_every_nth_quarantine_reaches_the_sink() {
        let (tx, rx) = flume::bounded(16);
        let mut verifier = Verifier::new(VerifierConfig {
            diagnostic_every: 3,
            ..VerifierConfig::default()
        })
        .with_diagnostic_sink(tx);

        for i in 0..7 {
            let mut r = record(&format!("q{}", i));
            r.record_count = 0;
            let _ = verifier.verify(r);
        }
        let samples: Vec<QuarantinedRecord> = rx.drain().collect();
        // 1st, 4th and 7th
        assert_eq!(samples.len(), 3);
        assert_eq!(samples[1].record.entity_key.identifier.as_str(), "q3");
        assert_eq!(samples[0].reason, "empty_window");
        assert_eq!(verifier.stats().diagnostics_sent, 3);
    }
}
