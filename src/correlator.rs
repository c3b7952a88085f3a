// ============================================================================
// SECTION 8: QUERY CORRELATOR
// ============================================================================
// Joins session samples, query statistics and kernel metrics that share an
// entity key into one QueryExecutionRecord per time bucket.
//
// Window lifecycle (one explicit state machine, driven by `sweep`):
//
//   Open ──(bucket end + grace elapsed)──► Closed ──(allowed lateness)──► Expired
//     │                                       ▲
//     └──(end_session / overflow)──► Closing ─┘
//
// A Closed window is a tombstone: its contents have been emitted, and a late
// record arriving while it is still inside the allowed lateness opens the
// next generation of the same bucket instead of touching the emitted data.
// ============================================================================

use std::collections::BTreeMap;
use std::time::Duration;

use ahash::AHashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::attr;
use crate::config::CorrelatorConfig;
use crate::error::CorrelationError;
use crate::logging::PerfTimer;
use crate::types::{
    AttrValue, EntityKey, Measurement, QueryExecutionRecord, RawPlan, SourceKind, SourceSet,
    TelemetryRecord, Timestamp, WindowId, WindowKey,
};
use crate::SLOW_SWEEP_THRESHOLD_MS;

// ----------------------------------------------------------------------------
// 8.1 Window State Machine
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowState {
    /// Accepting records until the close deadline
    Open,
    /// Marked for emission on the next sweep regardless of the deadline
    Closing,
    /// Emitted; kept as a tombstone for late records
    Closed,
    /// Past allowed lateness; removed from the index
    Expired,
}

/// Accumulated records for one entity key in one bucket.
#[derive(Debug)]
struct CorrelationWindow {
    key: EntityKey,
    bucket_start: Timestamp,
    bucket_end: Timestamp,
    generation: u32,
    state: WindowState,
    close_at: Timestamp,
    /// Tombstone removal time: bucket end + grace + allowed lateness
    expire_at: Timestamp,
    first_seq: u64,
    sources: SourceSet,
    record_count: u32,
    attributes: BTreeMap<String, AttrValue>,
    measurements: BTreeMap<String, Measurement>,
    plan: Option<RawPlan>,
}

impl CorrelationWindow {
    fn open(
        key: EntityKey,
        bucket_start: Timestamp,
        bucket_end: Timestamp,
        generation: u32,
        close_at: Timestamp,
        expire_at: Timestamp,
        seq: u64,
    ) -> Self {
        Self {
            key,
            bucket_start,
            bucket_end,
            generation,
            state: WindowState::Open,
            close_at,
            expire_at,
            first_seq: seq,
            sources: SourceSet::empty(),
            record_count: 0,
            attributes: BTreeMap::new(),
            measurements: BTreeMap::new(),
            plan: None,
        }
    }

    fn accepts_records(&self) -> bool {
        matches!(self.state, WindowState::Open | WindowState::Closing)
    }

    /// Fold one record in. Attributes are last-write-wins in arrival order,
    /// measurements follow their counter/gauge tag, the latest plan wins.
    fn merge(&mut self, record: TelemetryRecord) {
        self.sources.insert(record.source);
        self.record_count += 1;
        self.attributes.extend(record.attributes);
        for (name, sample) in record.measurements {
            self.measurements
                .entry(name)
                .and_modify(|m| m.merge(sample))
                .or_insert(sample);
        }
        if record.plan.is_some() {
            self.plan = record.plan;
        }
    }

    fn begin_closing(&mut self, now: Timestamp) {
        if self.state == WindowState::Open {
            self.state = WindowState::Closing;
            self.close_at = self.close_at.min(now);
        }
    }

    fn is_due(&self, now: Timestamp) -> bool {
        match self.state {
            WindowState::Open => now >= self.close_at,
            WindowState::Closing => true,
            WindowState::Closed | WindowState::Expired => false,
        }
    }

    /// Move to Closed, handing out the accumulated contents.
    fn close(&mut self, now: Timestamp) -> Option<QueryExecutionRecord> {
        self.state = WindowState::Closed;
        if self.record_count == 0 {
            return None;
        }
        let mut attributes = std::mem::take(&mut self.attributes);
        if !(self.sources.contains(SourceKind::Session) && self.sources.contains(SourceKind::Kernel)) {
            attributes.insert(attr::PARTIAL.to_string(), AttrValue::Bool(true));
        }
        Some(QueryExecutionRecord {
            window_id: WindowId::derive(&self.key, self.bucket_start, self.generation),
            entity_key: self.key.clone(),
            bucket_start: self.bucket_start,
            bucket_end: self.bucket_end,
            closed_at: now,
            generation: self.generation,
            sources: self.sources,
            record_count: self.record_count,
            attributes,
            measurements: std::mem::take(&mut self.measurements),
            plan: self.plan.take(),
            downsampled: false,
        })
    }
}

// ----------------------------------------------------------------------------
// 8.2 Admission & Sweep Results
// ----------------------------------------------------------------------------

/// What `admit` did with a record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admitted {
    /// Merged into an existing open window
    Merged,
    /// Started a new window
    Opened { forced_close: bool },
    /// Started a later generation of an already emitted bucket
    Reopened { generation: u32, forced_close: bool },
}

impl Admitted {
    pub fn forced_close(&self) -> bool {
        match self {
            Admitted::Merged => false,
            Admitted::Opened { forced_close } | Admitted::Reopened { forced_close, .. } => *forced_close,
        }
    }
}

/// Output of one sweep
#[derive(Debug, Default)]
pub struct SweepOutput {
    /// Emitted records, ordered by close deadline then first arrival
    pub emitted: Vec<QueryExecutionRecord>,
    pub partial: u64,
    pub empty: u64,
    pub expired: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorrelatorStats {
    pub ingested: u64,
    pub unroutable: u64,
    pub late_dropped: u64,
    pub windows_emitted: u64,
    pub windows_partial: u64,
    pub windows_empty: u64,
    pub windows_forced: u64,
    pub open_windows: usize,
    pub tracked_windows: usize,
}

// ----------------------------------------------------------------------------
// 8.3 Correlator
// ----------------------------------------------------------------------------

/// Owns the window index. Mutated only by the correlator stage.
#[derive(Debug)]
pub struct QueryCorrelator {
    bucket_width: Duration,
    grace_period: Duration,
    allowed_lateness: Duration,
    max_open_windows: usize,
    windows: AHashMap<WindowKey, CorrelationWindow>,
    open_windows: usize,
    seq: u64,
    stats: CorrelatorStats,
}

impl QueryCorrelator {
    pub fn new(config: &CorrelatorConfig) -> Self {
        Self {
            bucket_width: config.bucket_width,
            grace_period: config.grace_period,
            allowed_lateness: config.allowed_lateness,
            max_open_windows: config.max_open_windows.max(1),
            windows: AHashMap::new(),
            open_windows: 0,
            seq: 0,
            stats: CorrelatorStats::default(),
        }
    }

    pub fn stats(&self) -> CorrelatorStats {
        CorrelatorStats {
            open_windows: self.open_windows,
            tracked_windows: self.windows.len(),
            ..self.stats.clone()
        }
    }

    /// Windows still holding records that have not been emitted
    pub fn pending_windows(&self) -> usize {
        self.windows.values().filter(|w| w.accepts_records()).count()
    }

    /// Records merged into windows that have not been emitted yet
    pub fn pending_records(&self) -> usize {
        self.windows
            .values()
            .filter(|w| w.accepts_records())
            .map(|w| w.record_count as usize)
            .sum()
    }

    /// Assign a record to the window of its bucketed entity key.
    pub fn admit(&mut self, record: TelemetryRecord, now: Timestamp) -> Result<Admitted, CorrelationError> {
        let key = match EntityKey::parse(&record.entity_key) {
            Ok(key) => key,
            Err(e) => {
                self.stats.unroutable += 1;
                debug!(target: "dbintel::correlator", error = %e, "Unroutable record discarded");
                return Err(e);
            }
        };

        let bucket_start = record.timestamp.floor_to(self.bucket_width);
        let bucket_end = bucket_start.add_duration(self.bucket_width);
        let on_time_close = bucket_end.add_duration(self.grace_period);
        let expire_at = on_time_close.add_duration(self.allowed_lateness);
        let window_key = WindowKey {
            entity: key,
            bucket_start,
        };

        self.seq += 1;
        let seq = self.seq;

        let existing = self
            .windows
            .get(&window_key)
            .map(|w| (w.accepts_records(), w.state, w.generation, w.expire_at));

        let admitted = match existing {
            Some((true, _, _, _)) => {
                if let Some(window) = self.windows.get_mut(&window_key) {
                    window.merge(record);
                }
                Admitted::Merged
            }
            Some((false, WindowState::Closed, previous, tombstone_expiry)) if now < tombstone_expiry => {
                let generation = previous + 1;
                let mut next = CorrelationWindow::open(
                    window_key.entity.clone(),
                    bucket_start,
                    bucket_end,
                    generation,
                    now.add_duration(self.grace_period),
                    tombstone_expiry,
                    seq,
                );
                next.merge(record);
                trace!(
                    target: "dbintel::correlator",
                    key = %window_key.entity,
                    generation,
                    "Late record opened a new window generation"
                );
                self.windows.insert(window_key, next);
                let forced_close = self.note_opened(now);
                Admitted::Reopened { generation, forced_close }
            }
            Some(_) => return Err(self.too_late(&window_key.entity, expire_at, now)),
            None if now >= expire_at => return Err(self.too_late(&window_key.entity, expire_at, now)),
            None => {
                let close_at = if now < on_time_close {
                    on_time_close
                } else {
                    now.add_duration(self.grace_period)
                };
                let mut window = CorrelationWindow::open(
                    window_key.entity.clone(),
                    bucket_start,
                    bucket_end,
                    0,
                    close_at,
                    expire_at,
                    seq,
                );
                window.merge(record);
                self.windows.insert(window_key, window);
                let forced_close = self.note_opened(now);
                Admitted::Opened { forced_close }
            }
        };

        self.stats.ingested += 1;
        Ok(admitted)
    }

    fn too_late(&mut self, key: &EntityKey, expire_at: Timestamp, now: Timestamp) -> CorrelationError {
        self.stats.late_dropped += 1;
        let err = CorrelationError::TooLate {
            key: key.to_string(),
            late_by_ms: now.duration_since(expire_at).as_millis() as u64,
        };
        debug!(target: "dbintel::correlator", error = %err, "Late record dropped");
        err
    }

    /// Account for a freshly opened window; on overflow the oldest open
    /// window is marked Closing so the next sweep emits it early.
    fn note_opened(&mut self, now: Timestamp) -> bool {
        self.open_windows += 1;
        if self.open_windows <= self.max_open_windows {
            return false;
        }
        let oldest = self
            .windows
            .values_mut()
            .filter(|w| w.state == WindowState::Open)
            .min_by_key(|w| (w.bucket_start, w.first_seq));
        match oldest {
            Some(window) => {
                window.begin_closing(now);
                self.open_windows -= 1;
                self.stats.windows_forced += 1;
                debug!(
                    target: "dbintel::correlator",
                    key = %window.key,
                    limit = self.max_open_windows,
                    "Open window limit reached, closing oldest window early"
                );
                true
            }
            None => false,
        }
    }

    /// Mark every open window of the entity key for emission on the next
    /// sweep. Returns how many windows were marked.
    pub fn end_session(&mut self, raw_key: &str, now: Timestamp) -> Result<usize, CorrelationError> {
        let key = EntityKey::parse(raw_key).map_err(|e| {
            self.stats.unroutable += 1;
            e
        })?;
        let mut marked = 0;
        for window in self.windows.values_mut() {
            if window.key == key && window.state == WindowState::Open {
                window.begin_closing(now);
                marked += 1;
            }
        }
        self.open_windows -= marked;
        debug!(target: "dbintel::correlator", key = %key, windows = marked, "Session ended");
        Ok(marked)
    }

    /// Close every due window and expire old tombstones.
    pub fn sweep(&mut self, now: Timestamp) -> SweepOutput {
        let timer = PerfTimer::with_threshold("correlator.sweep", SLOW_SWEEP_THRESHOLD_MS);
        let mut out = SweepOutput::default();

        let mut due: Vec<(Timestamp, u64, WindowKey)> = self
            .windows
            .iter()
            .filter(|(_, w)| w.is_due(now))
            .map(|(k, w)| (w.close_at, w.first_seq, k.clone()))
            .collect();
        due.sort_unstable_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));

        for (_, _, key) in due {
            let Some(window) = self.windows.get_mut(&key) else {
                continue;
            };
            if window.state == WindowState::Open {
                self.open_windows -= 1;
            }
            match window.close(now) {
                Some(record) => {
                    if record.attributes.contains_key(attr::PARTIAL) {
                        out.partial += 1;
                    }
                    out.emitted.push(record);
                }
                None => out.empty += 1,
            }
        }

        for window in self.windows.values_mut() {
            if window.state == WindowState::Closed && now >= window.expire_at {
                window.state = WindowState::Expired;
                out.expired += 1;
            }
        }
        if out.expired > 0 {
            self.windows.retain(|_, w| w.state != WindowState::Expired);
        }

        self.stats.windows_emitted += out.emitted.len() as u64;
        self.stats.windows_partial += out.partial;
        self.stats.windows_empty += out.empty;

        let elapsed_ms = timer.stop();
        if !out.emitted.is_empty() || out.expired > 0 {
            debug!(
                target: "dbintel::correlator",
                emitted = out.emitted.len(),
                partial = out.partial,
                expired = out.expired,
                open = self.open_windows,
                elapsed_ms,
                "Sweep complete"
            );
        }
        out
    }

    /// Close everything immediately, ignoring grace periods (shutdown drain).
    pub fn flush_all(&mut self, now: Timestamp) -> SweepOutput {
        for window in self.windows.values_mut() {
            if window.state == WindowState::Open {
                window.begin_closing(now);
                self.open_windows -= 1;
            }
        }
        self.sweep(now)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn config() -> CorrelatorConfig {
        CorrelatorConfig {
            bucket_width: Duration::from_secs(10),
            grace_period: Duration::from_secs(2),
            allowed_lateness: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(1),
            max_open_windows: 1000,
        }
    }

    fn secs(s: i64) -> Timestamp {
        Timestamp::from_secs(s)
    }

    fn session(key: &str, at: i64) -> TelemetryRecord {
        TelemetryRecord::new(SourceKind::Session, key, secs(at))
            .with_attribute("db.session.state", "active")
            .with_attribute("wait_event", "IO:DataFileRead")
    }

    fn query_stat(key: &str, at: i64) -> TelemetryRecord {
        TelemetryRecord::new(SourceKind::QueryStat, key, secs(at))
            .with_attribute("db.query.text", "select * from orders where id = 42")
            .with_counter("calls", 3.0)
            .with_gauge("duration_ms", 1250.0)
    }

    fn kernel(key: &str, at: i64) -> TelemetryRecord {
        TelemetryRecord::new(SourceKind::Kernel, key, secs(at))
            .with_gauge("cpu_ms", 40.0)
            .with_counter("io_read_bytes", 8192.0)
    }

    #[test]
    fn test_three_sources_merge_into_one_record() {
        let mut correlator = QueryCorrelator::new(&config());
        correlator.admit(session("db1/q42", 101), secs(101)).unwrap();
        correlator.admit(query_stat("db1/q42", 103), secs(103)).unwrap();
        correlator.admit(kernel("db1/q42", 108), secs(108)).unwrap();

        // bucket [100, 110) closes at 110 + 2s grace
        assert!(correlator.sweep(secs(111)).emitted.is_empty());
        let out = correlator.sweep(secs(112));
        assert_eq!(out.emitted.len(), 1);
        assert_eq!(out.partial, 0);

        let record = &out.emitted[0];
        assert_eq!(record.entity_key, EntityKey::new("db1", "q42"));
        assert_eq!(record.bucket_start, secs(100));
        assert_eq!(record.bucket_end, secs(110));
        assert_eq!(record.record_count, 3);
        assert!(record.sources.is_complete());
        assert_eq!(record.measurement("duration_ms"), Some(1250.0));
        assert_eq!(record.measurement("cpu_ms"), Some(40.0));
        assert_eq!(record.attribute("wait_event"), Some(&AttrValue::from("IO:DataFileRead")));
        assert!(record.attribute(attr::PARTIAL).is_none());

        // emitted once only
        assert!(correlator.sweep(secs(113)).emitted.is_empty());
        assert_eq!(correlator.stats().windows_emitted, 1);
        assert_eq!(correlator.stats().unroutable, 0);
    }

    #[test]
    fn test_merge_rules_within_one_source() {
        let mut correlator = QueryCorrelator::new(&config());
        let first = TelemetryRecord::new(SourceKind::QueryStat, "db1/q1", secs(100))
            .with_attribute("db.user", "alice")
            .with_counter("calls", 2.0)
            .with_gauge("mem_kb", 100.0);
        let second = TelemetryRecord::new(SourceKind::QueryStat, "db1/q1", secs(105))
            .with_attribute("db.user", "bob")
            .with_counter("calls", 5.0)
            .with_gauge("mem_kb", 64.0);
        assert_eq!(correlator.admit(first, secs(100)).unwrap(), Admitted::Opened { forced_close: false });
        assert_eq!(correlator.admit(second, secs(105)).unwrap(), Admitted::Merged);

        let out = correlator.flush_all(secs(106));
        let record = &out.emitted[0];
        assert_eq!(record.attribute("db.user"), Some(&AttrValue::from("bob")));
        assert_eq!(record.measurement("calls"), Some(7.0));
        assert_eq!(record.measurement("mem_kb"), Some(64.0));
        assert_eq!(record.attribute(attr::PARTIAL), Some(&AttrValue::Bool(true)));
        assert_eq!(out.partial, 1);
    }

    #[test]
    fn test_latest_plan_wins() {
        let mut correlator = QueryCorrelator::new(&config());
        let a = query_stat("db1/q1", 100).with_plan(crate::types::PlanFormat::PostgresText, "Seq Scan on a");
        let b = query_stat("db1/q1", 101).with_plan(crate::types::PlanFormat::PostgresText, "Index Scan on a");
        let c = kernel("db1/q1", 102);
        correlator.admit(a, secs(100)).unwrap();
        correlator.admit(b, secs(101)).unwrap();
        correlator.admit(c, secs(102)).unwrap();
        let out = correlator.flush_all(secs(103));
        assert_eq!(out.emitted[0].plan.as_ref().map(|p| p.payload.as_str()), Some("Index Scan on a"));
    }

    #[test]
    fn test_unroutable_record_is_counted() {
        let mut correlator = QueryCorrelator::new(&config());
        let err = correlator.admit(session("no-separator", 100), secs(100)).unwrap_err();
        assert!(matches!(err, CorrelationError::Unroutable { .. }));
        assert_eq!(correlator.stats().unroutable, 1);
        assert_eq!(correlator.stats().ingested, 0);
        assert_eq!(correlator.stats().tracked_windows, 0);
    }

    #[test]
    fn test_late_record_opens_new_generation() {
        let mut correlator = QueryCorrelator::new(&config());
        correlator.admit(session("db1/q42", 101), secs(101)).unwrap();
        let first = correlator.sweep(secs(112)).emitted;
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].generation, 0);

        // late record for the same bucket, still within allowed lateness (expires at 142)
        let admitted = correlator.admit(kernel("db1/q42", 105), secs(120)).unwrap();
        assert_eq!(admitted, Admitted::Reopened { generation: 1, forced_close: false });

        // re-opened window closes at arrival + grace
        assert!(correlator.sweep(secs(121)).emitted.is_empty());
        let second = correlator.sweep(secs(122)).emitted;
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].generation, 1);
        assert_eq!(second[0].record_count, 1);
        assert_ne!(second[0].window_id, first[0].window_id);
    }

    #[test]
    fn test_record_past_lateness_is_dropped() {
        let mut correlator = QueryCorrelator::new(&config());
        correlator.admit(session("db1/q42", 101), secs(101)).unwrap();
        correlator.sweep(secs(112));

        let expired = correlator.sweep(secs(142));
        assert_eq!(expired.expired, 1);
        assert_eq!(correlator.stats().tracked_windows, 0);

        let err = correlator.admit(kernel("db1/q42", 105), secs(143)).unwrap_err();
        assert!(matches!(err, CorrelationError::TooLate { .. }));
        assert_eq!(correlator.stats().late_dropped, 1);
    }

    #[test]
    fn test_first_record_of_old_bucket_within_lateness() {
        let mut correlator = QueryCorrelator::new(&config());
        // bucket [100,110) would have closed at 112; arriving at 115 still inside lateness
        correlator.admit(kernel("db1/q7", 104), secs(115)).unwrap();
        assert!(correlator.sweep(secs(115)).emitted.is_empty());
        assert_eq!(correlator.sweep(secs(117)).emitted.len(), 1);
    }

    #[test]
    fn test_end_session_closes_before_grace() {
        let mut correlator = QueryCorrelator::new(&config());
        correlator.admit(session("db1/pid-9", 101), secs(101)).unwrap();
        correlator.admit(session("db1/pid-10", 101), secs(101)).unwrap();

        assert_eq!(correlator.end_session("db1/pid-9", secs(102)).unwrap(), 1);
        let out = correlator.sweep(secs(102));
        assert_eq!(out.emitted.len(), 1);
        assert_eq!(out.emitted[0].entity_key.identifier.as_str(), "pid-9");
        assert_eq!(correlator.stats().open_windows, 1);

        assert!(correlator.end_session("garbage", secs(102)).is_err());
    }

    #[test]
    fn test_emission_follows_close_time_not_arrival() {
        let mut correlator = QueryCorrelator::new(&config());
        // arrives first but belongs to the later bucket
        correlator.admit(session("db1/a", 115), secs(115)).unwrap();
        correlator.admit(session("db1/b", 105), secs(115)).unwrap();
        correlator.admit(session("db1/c", 106), secs(115)).unwrap();

        let out = correlator.flush_all(secs(130));
        let order: Vec<&str> = out.emitted.iter().map(|r| r.entity_key.identifier.as_str()).collect();
        assert_eq!(order, vec!["b", "c", "a"]);
    }

    #[test]
    fn test_open_window_limit_forces_early_close() {
        let mut cfg = config();
        cfg.max_open_windows = 2;
        let mut correlator = QueryCorrelator::new(&cfg);
        correlator.admit(session("db1/a", 100), secs(100)).unwrap();
        correlator.admit(session("db1/b", 101), secs(101)).unwrap();
        let admitted = correlator.admit(session("db1/c", 102), secs(102)).unwrap();
        assert!(admitted.forced_close());

        let out = correlator.sweep(secs(103));
        assert_eq!(out.emitted.len(), 1);
        assert_eq!(out.emitted[0].entity_key.identifier.as_str(), "a");
        let stats = correlator.stats();
        assert_eq!(stats.windows_forced, 1);
        assert_eq!(stats.open_windows, 2);
    }

    #[test]
    fn test_flush_all_drains_everything() {
        let mut correlator = QueryCorrelator::new(&config());
        for i in 0..10 {
            correlator.admit(session(&format!("db{}/q", i % 3), 100 + i), secs(100 + i)).unwrap();
        }
        assert!(correlator.pending_windows() > 0);
        let out = correlator.flush_all(secs(100));
        let total: u32 = out.emitted.iter().map(|r| r.record_count).sum();
        assert_eq!(total, 10);
        assert_eq!(correlator.pending_windows(), 0);
        assert_eq!(correlator.stats().open_windows, 0);
    }

    fn source_strategy() -> impl Strategy<Value = SourceKind> {
        prop_oneof![
            Just(SourceKind::Session),
            Just(SourceKind::QueryStat),
            Just(SourceKind::Kernel),
        ]
    }

    proptest! {
        #[test]
        fn prop_one_record_per_key_and_bucket(
            samples in prop::collection::vec((source_strategy(), 0i64..10_000), 1..40)
        ) {
            let mut correlator = QueryCorrelator::new(&config());
            for (source, offset_ms) in &samples {
                let at = Timestamp::from_millis(100_000 + offset_ms);
                let record = TelemetryRecord::new(*source, "db1/q42", at).with_counter("calls", 1.0);
                correlator.admit(record, at).unwrap();
            }
            let out = correlator.sweep(secs(112));
            prop_assert_eq!(out.emitted.len(), 1);
            prop_assert_eq!(out.emitted[0].record_count as usize, samples.len());
            prop_assert_eq!(out.emitted[0].measurement("calls"), Some(samples.len() as f64));
            prop_assert_eq!(correlator.stats().unroutable, 0);
        }
    }
}
