// ============================================================================
// SECTION 3: CORE TYPE SYSTEM
// ============================================================================
// The data that flows between stages:
// - Raw telemetry records emitted by the session, query-stat and kernel sources
// - Correlated query execution records produced by the correlator
// - Export outcomes and the feedback signals derived from them
// ============================================================================

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::fmt::{self, Display, Formatter};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use compact_str::CompactString;
use serde::{Deserialize, Serialize};
use xxhash_rust::xxh3::Xxh3;

use crate::error::CorrelationError;
use crate::MAX_ENTITY_KEY_LENGTH;

// ----------------------------------------------------------------------------
// 3.1 Timestamp Types - Nanosecond Precision Time Handling
// ----------------------------------------------------------------------------

/// High-precision timestamp in nanoseconds since Unix epoch.
/// Using i64 allows representing times from ~1677 to ~2262.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
#[repr(transparent)]
pub struct Timestamp(i64);

impl Timestamp {
    /// Create a new timestamp from nanoseconds since Unix epoch
    #[inline]
    pub const fn from_nanos(nanos: i64) -> Self {
        Self(nanos)
    }

    /// Create a new timestamp from milliseconds since Unix epoch
    #[inline]
    pub const fn from_millis(millis: i64) -> Self {
        Self(millis * 1_000_000)
    }

    /// Create a new timestamp from seconds since Unix epoch
    #[inline]
    pub const fn from_secs(secs: i64) -> Self {
        Self(secs * 1_000_000_000)
    }

    /// Get the current wall-clock timestamp
    #[inline]
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self(duration.as_nanos() as i64)
    }

    #[inline]
    pub const fn as_nanos(&self) -> i64 {
        self.0
    }

    #[inline]
    pub const fn as_millis(&self) -> i64 {
        self.0 / 1_000_000
    }

    #[inline]
    pub const fn as_secs(&self) -> i64 {
        self.0 / 1_000_000_000
    }

    /// Calculate duration between two timestamps (zero if `earlier` is later)
    #[inline]
    pub fn duration_since(&self, earlier: Timestamp) -> Duration {
        let nanos = self.0.saturating_sub(earlier.0);
        Duration::from_nanos(nanos.max(0) as u64)
    }

    #[inline]
    pub fn add_duration(&self, duration: Duration) -> Self {
        Self(self.0.saturating_add(duration.as_nanos() as i64))
    }

    #[inline]
    pub fn sub_duration(&self, duration: Duration) -> Self {
        Self(self.0.saturating_sub(duration.as_nanos() as i64))
    }

    /// Round down to the start of the bucket of the given width.
    /// Negative timestamps round towards negative infinity.
    #[inline]
    pub fn floor_to(&self, width: Duration) -> Self {
        let width = (width.as_nanos() as i64).max(1);
        Self(self.0.div_euclid(width) * width)
    }

    /// Convert to chrono DateTime<Utc>
    #[inline]
    pub fn to_datetime(&self) -> DateTime<Utc> {
        let secs = self.0.div_euclid(1_000_000_000);
        let nanos = self.0.rem_euclid(1_000_000_000) as u32;
        DateTime::from_timestamp(secs, nanos).unwrap_or_default()
    }

    /// Zero timestamp (Unix epoch)
    pub const EPOCH: Timestamp = Timestamp(0);
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_datetime().format("%Y-%m-%d %H:%M:%S%.3f UTC"))
    }
}

impl From<i64> for Timestamp {
    #[inline]
    fn from(nanos: i64) -> Self {
        Self(nanos)
    }
}

impl From<SystemTime> for Timestamp {
    fn from(st: SystemTime) -> Self {
        let duration = st.duration_since(UNIX_EPOCH).unwrap_or_default();
        Self(duration.as_nanos() as i64)
    }
}

// ----------------------------------------------------------------------------
// 3.2 Sources & Entity Keys
// ----------------------------------------------------------------------------

/// The collaborator that produced a telemetry record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// Active-session samples (wait events, session state)
    Session,
    /// Query statistics, optionally carrying an execution plan
    QueryStat,
    /// Kernel / OS level resource metrics
    Kernel,
}

impl SourceKind {
    pub const ALL: [SourceKind; 3] = [SourceKind::Session, SourceKind::QueryStat, SourceKind::Kernel];

    #[inline]
    const fn bit(self) -> u8 {
        match self {
            SourceKind::Session => 0b001,
            SourceKind::QueryStat => 0b010,
            SourceKind::Kernel => 0b100,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Session => "session",
            SourceKind::QueryStat => "query_stat",
            SourceKind::Kernel => "kernel",
        }
    }
}

impl Display for SourceKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Compact set of the sources that contributed to a window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct SourceSet(u8);

impl SourceSet {
    pub const fn empty() -> Self {
        Self(0)
    }

    #[inline]
    pub fn insert(&mut self, source: SourceKind) {
        self.0 |= source.bit();
    }

    #[inline]
    pub fn contains(&self, source: SourceKind) -> bool {
        self.0 & source.bit() != 0
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// All three sources are present
    #[inline]
    pub fn is_complete(&self) -> bool {
        SourceKind::ALL.iter().all(|s| self.contains(*s))
    }

    pub fn len(&self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn iter(&self) -> impl Iterator<Item = SourceKind> + '_ {
        SourceKind::ALL.into_iter().filter(move |s| self.contains(*s))
    }
}

impl FromIterator<SourceKind> for SourceSet {
    fn from_iter<I: IntoIterator<Item = SourceKind>>(iter: I) -> Self {
        let mut set = SourceSet::empty();
        for source in iter {
            set.insert(source);
        }
        set
    }
}

impl Serialize for SourceSet {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.iter())
    }
}

impl<'de> Deserialize<'de> for SourceSet {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let sources = Vec::<SourceKind>::deserialize(deserializer)?;
        Ok(sources.into_iter().collect())
    }
}

/// Composite identifier of one logical database event: the database id plus a
/// session or query identifier. The wire form is `"<database>/<identifier>"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityKey {
    pub database: CompactString,
    pub identifier: CompactString,
}

impl EntityKey {
    pub const SEPARATOR: char = '/';

    pub fn new(database: impl Into<CompactString>, identifier: impl Into<CompactString>) -> Self {
        Self {
            database: database.into(),
            identifier: identifier.into(),
        }
    }

    /// Parse the collaborator's raw key. Anything that cannot be routed to
    /// exactly one database and one identifier is rejected.
    pub fn parse(raw: &str) -> Result<Self, CorrelationError> {
        let unroutable = |reason: &'static str| CorrelationError::Unroutable {
            raw_key: raw.chars().take(64).collect(),
            reason,
        };

        if raw.len() > MAX_ENTITY_KEY_LENGTH {
            return Err(unroutable("key too long"));
        }
        if raw.chars().any(char::is_control) {
            return Err(unroutable("control character in key"));
        }
        let (database, identifier) = raw
            .split_once(Self::SEPARATOR)
            .ok_or_else(|| unroutable("missing separator"))?;
        let database = database.trim();
        let identifier = identifier.trim();
        if database.is_empty() {
            return Err(unroutable("empty database id"));
        }
        if identifier.is_empty() {
            return Err(unroutable("empty identifier"));
        }
        Ok(Self::new(database, identifier))
    }

    pub fn is_valid(&self) -> bool {
        !self.database.trim().is_empty() && !self.identifier.trim().is_empty()
    }
}

impl Display for EntityKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.database, Self::SEPARATOR, self.identifier)
    }
}

// ----------------------------------------------------------------------------
// 3.3 Attribute & Measurement Values
// ----------------------------------------------------------------------------

/// Typed attribute value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl AttrValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttrValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            AttrValue::Int(i) => Some(*i as f64),
            AttrValue::Float(f) => Some(*f),
            AttrValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            AttrValue::Str(_) => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AttrValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Rough serialized size, used for cost estimation
    pub fn estimated_bytes(&self) -> usize {
        match self {
            AttrValue::Str(s) => s.len(),
            _ => 8,
        }
    }
}

impl Display for AttrValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            AttrValue::Bool(b) => write!(f, "{}", b),
            AttrValue::Int(i) => write!(f, "{}", i),
            AttrValue::Float(v) => write!(f, "{}", v),
            AttrValue::Str(s) => f.write_str(s),
        }
    }
}

impl From<&str> for AttrValue {
    fn from(s: &str) -> Self {
        AttrValue::Str(s.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(s: String) -> Self {
        AttrValue::Str(s)
    }
}

impl From<i64> for AttrValue {
    fn from(v: i64) -> Self {
        AttrValue::Int(v)
    }
}

impl From<f64> for AttrValue {
    fn from(v: f64) -> Self {
        AttrValue::Float(v)
    }
}

impl From<bool> for AttrValue {
    fn from(v: bool) -> Self {
        AttrValue::Bool(v)
    }
}

/// How a measurement combines when two samples land in the same window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    /// Monotonic count over the sample interval: values are summed
    Counter,
    /// Point-in-time value: the most recent sample wins
    #[default]
    Gauge,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub value: f64,
    #[serde(default)]
    pub kind: MetricKind,
}

impl Measurement {
    pub const fn counter(value: f64) -> Self {
        Self {
            value,
            kind: MetricKind::Counter,
        }
    }

    pub const fn gauge(value: f64) -> Self {
        Self {
            value,
            kind: MetricKind::Gauge,
        }
    }

    /// Fold a later sample into this one according to the later sample's tag.
    pub fn merge(&mut self, later: Measurement) {
        match later.kind {
            MetricKind::Counter => self.value += later.value,
            MetricKind::Gauge => self.value = later.value,
        }
        self.kind = later.kind;
    }
}

// ----------------------------------------------------------------------------
// 3.4 Plans
// ----------------------------------------------------------------------------

/// Dialect discriminator carried by a raw plan payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanFormat {
    /// PostgreSQL `EXPLAIN (FORMAT JSON)`
    PostgresJson,
    /// PostgreSQL textual `EXPLAIN`
    PostgresText,
    /// MySQL `EXPLAIN FORMAT=JSON`
    #[serde(rename = "mysql_json")]
    MySqlJson,
}

impl PlanFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanFormat::PostgresJson => "postgres_json",
            PlanFormat::PostgresText => "postgres_text",
            PlanFormat::MySqlJson => "mysql_json",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawPlan {
    pub format: PlanFormat,
    pub payload: String,
}

// ----------------------------------------------------------------------------
// 3.5 Telemetry Record (collaborator input)
// ----------------------------------------------------------------------------

/// One raw sample from an upstream collaborator. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryRecord {
    pub source: SourceKind,
    /// Raw composite key, `"<database>/<identifier>"`
    pub entity_key: String,
    pub timestamp: Timestamp,
    #[serde(default)]
    pub attributes: HashMap<String, AttrValue>,
    #[serde(default)]
    pub measurements: HashMap<String, Measurement>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<RawPlan>,
}

impl TelemetryRecord {
    pub fn new(source: SourceKind, entity_key: impl Into<String>, timestamp: Timestamp) -> Self {
        Self {
            source,
            entity_key: entity_key.into(),
            timestamp,
            attributes: HashMap::new(),
            measurements: HashMap::new(),
            plan: None,
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<AttrValue>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn with_counter(mut self, name: impl Into<String>, value: f64) -> Self {
        self.measurements.insert(name.into(), Measurement::counter(value));
        self
    }

    pub fn with_gauge(mut self, name: impl Into<String>, value: f64) -> Self {
        self.measurements.insert(name.into(), Measurement::gauge(value));
        self
    }

    pub fn with_plan(mut self, format: PlanFormat, payload: impl Into<String>) -> Self {
        self.plan = Some(RawPlan {
            format,
            payload: payload.into(),
        });
        self
    }
}

// ----------------------------------------------------------------------------
// 3.6 Query Execution Record (correlator output)
// ----------------------------------------------------------------------------

/// Stable identity of one emitted correlation window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WindowId(u64);

impl WindowId {
    /// Derived from the entity key, bucket start and generation so that a
    /// replay of the same window produces the same id.
    pub fn derive(key: &EntityKey, bucket_start: Timestamp, generation: u32) -> Self {
        let mut hasher = Xxh3::new();
        hasher.update(key.database.as_bytes());
        hasher.update(&[0]);
        hasher.update(key.identifier.as_bytes());
        hasher.update(&bucket_start.as_nanos().to_le_bytes());
        hasher.update(&generation.to_le_bytes());
        Self(hasher.digest())
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Display for WindowId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// One correlated database event: everything the three sources reported for
/// one entity key inside one time bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryExecutionRecord {
    pub window_id: WindowId,
    pub entity_key: EntityKey,
    pub bucket_start: Timestamp,
    pub bucket_end: Timestamp,
    pub closed_at: Timestamp,
    /// 0 for the on-time window, incremented for windows re-opened by late records
    pub generation: u32,
    pub sources: SourceSet,
    pub record_count: u32,
    pub attributes: BTreeMap<String, AttrValue>,
    pub measurements: BTreeMap<String, Measurement>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<RawPlan>,
    #[serde(default)]
    pub downsampled: bool,
}

impl QueryExecutionRecord {
    /// Export target of this record (one breaker per database)
    pub fn target(&self) -> &str {
        &self.entity_key.database
    }

    /// Sampler signal class of this record
    pub fn signal_class(&self) -> &str {
        &self.entity_key.database
    }

    pub fn attribute(&self, key: &str) -> Option<&AttrValue> {
        self.attributes.get(key)
    }

    pub fn measurement(&self, name: &str) -> Option<f64> {
        self.measurements.get(name).map(|m| m.value)
    }

    pub fn set_attribute(&mut self, key: impl Into<String>, value: impl Into<AttrValue>) {
        self.attributes.insert(key.into(), value.into());
    }

    /// Approximate wire size used by the cost gate.
    pub fn estimated_bytes(&self) -> u64 {
        let key = self.entity_key.database.len() + self.entity_key.identifier.len();
        let attrs: usize = self
            .attributes
            .iter()
            .map(|(k, v)| k.len() + v.estimated_bytes())
            .sum();
        let measurements: usize = self.measurements.keys().map(|k| k.len() + 8).sum();
        let plan = self.plan.as_ref().map(|p| p.payload.len()).unwrap_or(0);
        // fixed overhead: ids, timestamps, counters
        (48 + key + attrs + measurements + plan) as u64
    }
}

// ----------------------------------------------------------------------------
// 3.7 Export Outcomes & Feedback Signals
// ----------------------------------------------------------------------------

/// Identifier of an export target. One database, one target.
pub type TargetId = CompactString;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    Success,
    Failure,
    RateLimited,
}

impl OutcomeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeKind::Success => "success",
            OutcomeKind::Failure => "failure",
            OutcomeKind::RateLimited => "rate_limited",
        }
    }
}

impl Display for OutcomeKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one export attempt, as reported by the exporter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportOutcome {
    pub kind: OutcomeKind,
    pub target: TargetId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
    #[serde(default)]
    pub record_count: usize,
}

impl ExportOutcome {
    pub fn success(target: impl Into<TargetId>, record_count: usize) -> Self {
        Self {
            kind: OutcomeKind::Success,
            target: target.into(),
            error_detail: None,
            record_count,
        }
    }

    pub fn failure(target: impl Into<TargetId>, detail: impl Into<String>) -> Self {
        Self {
            kind: OutcomeKind::Failure,
            target: target.into(),
            error_detail: Some(detail.into()),
            record_count: 0,
        }
    }

    pub fn rate_limited(target: impl Into<TargetId>, detail: impl Into<String>) -> Self {
        Self {
            kind: OutcomeKind::RateLimited,
            target: target.into(),
            error_detail: Some(detail.into()),
            record_count: 0,
        }
    }
}

/// Why a failure happened, as far as the monitor can tell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCause {
    None,
    RateLimit,
    Cardinality,
    Auth,
    Timeout,
    Transport,
    Other,
}

impl FailureCause {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureCause::None => "none",
            FailureCause::RateLimit => "rate_limit",
            FailureCause::Cardinality => "cardinality",
            FailureCause::Auth => "auth",
            FailureCause::Timeout => "timeout",
            FailureCause::Transport => "transport",
            FailureCause::Other => "other",
        }
    }
}

/// Classified export outcome, published to the breaker and the sampler.
/// Ephemeral: each subscriber consumes its copy once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackSignal {
    pub at: Timestamp,
    pub target: TargetId,
    pub kind: OutcomeKind,
    pub cause: FailureCause,
}

impl FeedbackSignal {
    pub fn is_failure(&self) -> bool {
        !matches!(self.kind, OutcomeKind::Success)
    }
}

/// Index key of a correlation window: entity key truncated to its time bucket.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WindowKey {
    pub entity: EntityKey,
    pub bucket_start: Timestamp,
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_floor_to_bucket() {
        let width = Duration::from_secs(10);
        assert_eq!(Timestamp::from_secs(105).floor_to(width), Timestamp::from_secs(100));
        assert_eq!(Timestamp::from_secs(100).floor_to(width), Timestamp::from_secs(100));
        assert_eq!(Timestamp::from_secs(-1).floor_to(width), Timestamp::from_secs(-10));
    }

    #[test]
    fn test_timestamp_arithmetic() {
        let ts = Timestamp::from_secs(10);
        assert_eq!(ts.add_duration(Duration::from_secs(2)), Timestamp::from_secs(12));
        assert_eq!(ts.sub_duration(Duration::from_secs(2)), Timestamp::from_secs(8));
        assert_eq!(Timestamp::from_secs(12).duration_since(ts), Duration::from_secs(2));
        assert_eq!(ts.duration_since(Timestamp::from_secs(12)), Duration::ZERO);
    }

    #[test]
    fn test_entity_key_parse() {
        let key = EntityKey::parse("db1/q42").unwrap();
        assert_eq!(key.database.as_str(), "db1");
        assert_eq!(key.identifier.as_str(), "q42");
        assert_eq!(key.to_string(), "db1/q42");

        // identifiers may themselves contain the separator
        let nested = EntityKey::parse("db1/pid/77").unwrap();
        assert_eq!(nested.identifier.as_str(), "pid/77");
    }

    #[test]
    fn test_entity_key_unroutable() {
        for raw in ["", "db1", "/q42", "db1/", "  /  ", "db1/q\u{0}"] {
            let err = EntityKey::parse(raw).unwrap_err();
            assert!(matches!(err, CorrelationError::Unroutable { .. }), "{raw:?}");
        }
        let long = format!("db/{}", "x".repeat(MAX_ENTITY_KEY_LENGTH));
        assert!(EntityKey::parse(&long).is_err());
    }

    #[test]
    fn test_source_set() {
        let mut set = SourceSet::empty();
        assert!(set.is_empty());
        set.insert(SourceKind::Session);
        set.insert(SourceKind::Session);
        assert_eq!(set.len(), 1);
        assert!(!set.is_complete());
        set.insert(SourceKind::Kernel);
        set.insert(SourceKind::QueryStat);
        assert!(set.is_complete());

        let json = serde_json::to_string(&set).unwrap();
        assert_eq!(json, r#"["session","query_stat","kernel"]"#);
        let back: SourceSet = serde_json::from_str(&json).unwrap();
        assert_eq!(back, set);
    }

    #[test]
    fn test_measurement_merge() {
        let mut calls = Measurement::counter(3.0);
        calls.merge(Measurement::counter(4.0));
        assert_eq!(calls.value, 7.0);

        let mut cpu = Measurement::gauge(0.4);
        cpu.merge(Measurement::gauge(0.9));
        assert_eq!(cpu.value, 0.9);
    }

    #[test]
    fn test_window_id_is_stable() {
        let key = EntityKey::new("db1", "q42");
        let a = WindowId::derive(&key, Timestamp::from_secs(100), 0);
        let b = WindowId::derive(&key, Timestamp::from_secs(100), 0);
        let c = WindowId::derive(&key, Timestamp::from_secs(100), 1);
        let d = WindowId::derive(&key, Timestamp::from_secs(110), 0);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
    }

    #[test]
    fn test_telemetry_record_json() {
        let json = r#"{
            "source": "query_stat",
            "entity_key": "db1/q42",
            "timestamp": 1000000000,
            "attributes": {"db.query.text": "select 1", "db.user": "app"},
            "measurements": {"calls": {"value": 2.0, "kind": "counter"}, "cpu": {"value": 0.5}},
            "plan": {"format": "postgres_json", "payload": "[]"}
        }"#;
        let record: TelemetryRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.source, SourceKind::QueryStat);
        assert_eq!(record.timestamp, Timestamp::from_secs(1));
        assert_eq!(record.measurements["calls"].kind, MetricKind::Counter);
        assert_eq!(record.measurements["cpu"].kind, MetricKind::Gauge);
        assert_eq!(record.plan.as_ref().map(|p| p.format), Some(PlanFormat::PostgresJson));
    }
}
