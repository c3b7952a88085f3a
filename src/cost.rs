// ============================================================================
// SECTION 10: COST CONTROL GATE
// ============================================================================
// Cardinality budgets per configured dimension.
//
// For each dimension a record maps to one key. A key that already holds a
// token is admitted; a new key is minted while the budget has room and new-key
// allowance left. A full budget first evicts its stalest key (only if that key
// has gone unseen for the staleness threshold), then falls back to
// downsampling onto the coarser key, then rejects.
//
// Dimensions are evaluated in configured order, coarsest first. A reject at
// any dimension rejects the record; tokens minted by earlier dimensions stay.
// Allowances reset on a fixed refill interval, never per record.
// ============================================================================

use std::time::Duration;

use ahash::AHashMap;
use compact_str::CompactString;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use xxhash_rust::xxh3::Xxh3;

use crate::attr;
use crate::config::{CostConfig, DimensionConfig, DimensionScope};
use crate::types::{QueryExecutionRecord, Timestamp};

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

// ----------------------------------------------------------------------------
// 10.1 Decisions
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdmissionDecision {
    Admit,
    Downsample,
    Reject,
}

impl AdmissionDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdmissionDecision::Admit => "admit",
            AdmissionDecision::Downsample => "downsample",
            AdmissionDecision::Reject => "reject",
        }
    }
}

/// Where a key part comes from
#[derive(Debug, Clone, PartialEq, Eq)]
enum KeyPart {
    Database,
    Identifier,
    Attribute(String),
}

impl KeyPart {
    fn parse(token: &str) -> Self {
        match token {
            DimensionConfig::DATABASE_TOKEN => KeyPart::Database,
            DimensionConfig::IDENTIFIER_TOKEN => KeyPart::Identifier,
            name => KeyPart::Attribute(name.to_string()),
        }
    }
}

// ----------------------------------------------------------------------------
// 10.2 Budgets
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
struct KeyEntry {
    last_seen: Timestamp,
}

/// Unique keys of one budget (one per dimension, or per dimension and database).
#[derive(Debug)]
struct Budget {
    keys: AHashMap<u64, KeyEntry>,
    /// Projections of admitted keys with high-cardinality parts removed
    coarse: AHashMap<u64, Timestamp>,
    allowance_left: usize,
}

impl Budget {
    fn new(allowance: usize) -> Self {
        Self {
            keys: AHashMap::new(),
            coarse: AHashMap::new(),
            allowance_left: allowance,
        }
    }

    /// Drop the key with the oldest last-seen time, if it is stale.
    fn evict_stale(&mut self, now: Timestamp, staleness: Duration) -> bool {
        let victim = self
            .keys
            .iter()
            .filter(|(_, e)| now.duration_since(e.last_seen) >= staleness)
            .min_by_key(|(_, e)| e.last_seen)
            .map(|(k, _)| *k);
        match victim {
            Some(key) => {
                self.keys.remove(&key);
                true
            }
            None => false,
        }
    }

    fn purge(&mut self, now: Timestamp, staleness: Duration) -> usize {
        let before = self.keys.len();
        self.keys.retain(|_, e| now.duration_since(e.last_seen) < staleness);
        self.coarse.retain(|_, seen| now.duration_since(*seen) < staleness);
        before - self.keys.len()
    }
}

#[derive(Debug)]
struct Dimension {
    name: CompactString,
    scope: DimensionScope,
    parts: Vec<KeyPart>,
    high_cardinality: Vec<String>,
    capacity: usize,
    allowance: usize,
    budgets: AHashMap<CompactString, Budget>,
}

/// Outcome of one dimension's check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DimensionVerdict {
    Existing,
    Minted,
    MintedAfterEviction,
    Downsample,
    Reject,
}

impl Dimension {
    fn new(config: &DimensionConfig) -> Self {
        Self {
            name: CompactString::from(config.name.as_str()),
            scope: config.scope,
            parts: config.key.iter().map(|t| KeyPart::parse(t)).collect(),
            high_cardinality: config.high_cardinality.clone(),
            capacity: config.capacity,
            allowance: config.allowance(),
            budgets: AHashMap::new(),
        }
    }

    fn scope_key<'a>(&self, record: &'a QueryExecutionRecord) -> &'a str {
        match self.scope {
            DimensionScope::Global => "",
            DimensionScope::PerDatabase => record.entity_key.database.as_str(),
        }
    }

    /// Hash of the record's key; `coarse` leaves out the high-cardinality parts.
    fn key_hash(&self, record: &QueryExecutionRecord, coarse: bool) -> u64 {
        let mut hasher = Xxh3::new();
        for part in &self.parts {
            match part {
                KeyPart::Database => hasher.update(record.entity_key.database.as_bytes()),
                KeyPart::Identifier => hasher.update(record.entity_key.identifier.as_bytes()),
                KeyPart::Attribute(name) if coarse && self.high_cardinality.contains(name) => {
                    continue;
                }
                KeyPart::Attribute(name) => match record.attributes.get(name) {
                    Some(value) => hasher.update(value.to_string().as_bytes()),
                    None => hasher.update(&[0xFE]),
                },
            }
            hasher.update(&[0xFF]);
        }
        hasher.digest()
    }

    fn check(&mut self, record: &QueryExecutionRecord, now: Timestamp, staleness: Duration) -> DimensionVerdict {
        let key = self.key_hash(record, false);
        let coarse_key = (!self.high_cardinality.is_empty()).then(|| self.key_hash(record, true));
        let capacity = self.capacity;
        let allowance = self.allowance;
        let scope = CompactString::from(self.scope_key(record));
        let budget = self.budgets.entry(scope).or_insert_with(|| Budget::new(allowance));

        if let Some(entry) = budget.keys.get_mut(&key) {
            entry.last_seen = now;
            if let Some(coarse) = coarse_key {
                budget.coarse.insert(coarse, now);
            }
            return DimensionVerdict::Existing;
        }

        let mut verdict = None;
        if budget.allowance_left > 0 {
            if budget.keys.len() < capacity {
                verdict = Some(DimensionVerdict::Minted);
            } else if budget.evict_stale(now, staleness) {
                verdict = Some(DimensionVerdict::MintedAfterEviction);
            }
        }

        if let Some(verdict) = verdict {
            budget.keys.insert(key, KeyEntry { last_seen: now });
            budget.allowance_left -= 1;
            if let Some(coarse) = coarse_key {
                if budget.coarse.len() < capacity || budget.coarse.contains_key(&coarse) {
                    budget.coarse.insert(coarse, now);
                }
            }
            return verdict;
        }

        match coarse_key {
            Some(coarse) => match budget.coarse.get_mut(&coarse) {
                Some(seen) => {
                    *seen = now;
                    DimensionVerdict::Downsample
                }
                None => DimensionVerdict::Reject,
            },
            None => DimensionVerdict::Reject,
        }
    }

    /// Remove the high-cardinality attributes from a record
    fn strip(&self, record: &mut QueryExecutionRecord) {
        for name in &self.high_cardinality {
            record.attributes.remove(name);
        }
    }

    fn usage(&self) -> DimensionUsage {
        let keys: usize = self.budgets.values().map(|b| b.keys.len()).sum();
        let fullest = self.budgets.values().map(|b| b.keys.len()).max().unwrap_or(0);
        DimensionUsage {
            name: self.name.to_string(),
            budgets: self.budgets.len(),
            keys,
            capacity: self.capacity,
            utilization: fullest as f64 / self.capacity.max(1) as f64,
        }
    }
}

// ----------------------------------------------------------------------------
// 10.3 Gate
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DimensionUsage {
    pub name: String,
    /// Budgets held (1 for global dimensions, one per database otherwise)
    pub budgets: usize,
    pub keys: usize,
    /// Capacity of each budget
    pub capacity: usize,
    /// Fill fraction of the fullest budget
    pub utilization: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CostSnapshot {
    pub dimensions: Vec<DimensionUsage>,
    pub estimated_cost_bytes: u64,
    pub estimated_cost_usd: f64,
    pub admitted: u64,
    pub downsampled: u64,
    pub rejected: u64,
    pub evicted: u64,
}

/// Owns every budget. Mutated only by the cost stage.
#[derive(Debug)]
pub struct CostControlGate {
    dimensions: Vec<Dimension>,
    staleness: Duration,
    refill_interval: Duration,
    price_per_gb: f64,
    next_refill: Option<Timestamp>,
    cost_bytes: u64,
    admitted: u64,
    downsampled: u64,
    rejected: u64,
    evicted: u64,
}

impl CostControlGate {
    pub fn new(config: &CostConfig) -> Self {
        Self {
            dimensions: config.dimensions.iter().map(Dimension::new).collect(),
            staleness: config.staleness,
            refill_interval: config.refill_interval,
            price_per_gb: config.price_per_gb,
            next_refill: None,
            cost_bytes: 0,
            admitted: 0,
            downsampled: 0,
            rejected: 0,
            evicted: 0,
        }
    }

    /// Decide admission. Never blocks; a downsampled record has its
    /// high-cardinality attributes removed in place.
    pub fn admit(&mut self, record: &mut QueryExecutionRecord, now: Timestamp) -> AdmissionDecision {
        match self.next_refill {
            None => self.next_refill = Some(now.add_duration(self.refill_interval)),
            Some(due) if now >= due => self.refill(now),
            Some(_) => {}
        }

        let mut decision = AdmissionDecision::Admit;
        for dim in &mut self.dimensions {
            match dim.check(record, now, self.staleness) {
                DimensionVerdict::Existing | DimensionVerdict::Minted => {}
                DimensionVerdict::MintedAfterEviction => self.evicted += 1,
                DimensionVerdict::Downsample => {
                    dim.strip(record);
                    decision = AdmissionDecision::Downsample;
                }
                DimensionVerdict::Reject => {
                    debug!(
                        target: "dbintel::cost",
                        key = %record.entity_key,
                        dimension = %dim.name,
                        "Record rejected over budget"
                    );
                    self.rejected += 1;
                    return AdmissionDecision::Reject;
                }
            }
        }

        if decision == AdmissionDecision::Downsample {
            record.downsampled = true;
            record.set_attribute(attr::DOWNSAMPLED, true);
            self.downsampled += 1;
        } else {
            self.admitted += 1;
        }
        self.cost_bytes += record.estimated_bytes();
        decision
    }

    /// Reset every allowance and purge keys unseen for the staleness threshold.
    pub fn refill(&mut self, now: Timestamp) {
        let mut purged = 0;
        for dim in &mut self.dimensions {
            let allowance = dim.allowance;
            for budget in dim.budgets.values_mut() {
                budget.allowance_left = allowance;
                purged += budget.purge(now, self.staleness);
            }
            dim.budgets.retain(|_, b| !b.keys.is_empty());
        }
        self.next_refill = Some(now.add_duration(self.refill_interval));
        if purged > 0 {
            info!(target: "dbintel::cost", purged, "Cost budgets refilled");
        }
    }

    pub fn estimated_cost_bytes(&self) -> u64 {
        self.cost_bytes
    }

    pub fn estimated_cost_usd(&self) -> f64 {
        self.cost_bytes as f64 / BYTES_PER_GB * self.price_per_gb
    }

    pub fn snapshot(&self) -> CostSnapshot {
        CostSnapshot {
            dimensions: self.dimensions.iter().map(Dimension::usage).collect(),
            estimated_cost_bytes: self.cost_bytes,
            estimated_cost_usd: self.estimated_cost_usd(),
            admitted: self.admitted,
            downsampled: self.downsampled,
            rejected: self.rejected,
            evicted: self.evicted,
        }
    }

    /// Largest key count of any single budget in the named dimension
    pub fn fullest_budget(&self, dimension: &str) -> Option<usize> {
        self.dimensions
            .iter()
            .find(|d| d.name == dimension)
            .map(|d| d.budgets.values().map(|b| b.keys.len()).max().unwrap_or(0))
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AttrValue, EntityKey, SourceSet, WindowId};
    use proptest::prelude::*;
    use std::collections::BTreeMap;

    fn record(db: &str, fingerprint: &str, user: &str) -> QueryExecutionRecord {
        let key = EntityKey::new(db, format!("q-{}", fingerprint));
        let mut attributes = BTreeMap::new();
        attributes.insert(attr::QUERY_FINGERPRINT.to_string(), AttrValue::from(fingerprint));
        attributes.insert(attr::DB_USER.to_string(), AttrValue::from(user));
        attributes.insert(attr::CLIENT_ADDRESS.to_string(), AttrValue::from("10.0.0.7"));
        QueryExecutionRecord {
            window_id: WindowId::derive(&key, Timestamp::EPOCH, 0),
            entity_key: key,
            bucket_start: Timestamp::EPOCH,
            bucket_end: Timestamp::from_secs(10),
            closed_at: Timestamp::from_secs(12),
            generation: 0,
            sources: SourceSet::empty(),
            record_count: 1,
            attributes,
            measurements: BTreeMap::new(),
            plan: None,
            downsampled: false,
        }
    }

    fn config_with(dimensions: Vec<DimensionConfig>) -> CostConfig {
        CostConfig {
            refill_interval: Duration::from_secs(60),
            staleness: Duration::from_secs(300),
            price_per_gb: 0.35,
            dimensions,
        }
    }

    fn fingerprint_dim(capacity: usize) -> DimensionConfig {
        let mut dim = CostConfig::default().dimensions[1].clone();
        dim.capacity = capacity;
        dim
    }

    #[test]
    fn test_101st_fingerprint_is_rejected() {
        let mut gate = CostControlGate::new(&CostConfig::default());
        let now = Timestamp::from_secs(1);
        for i in 0..100 {
            let decision = gate.admit(&mut record("db1", &format!("fp{}", i), "app"), now);
            assert_eq!(decision, AdmissionDecision::Admit, "fingerprint {}", i);
        }
        let decision = gate.admit(&mut record("db1", "fp100", "app"), now);
        assert_eq!(decision, AdmissionDecision::Reject);
        assert_eq!(gate.fullest_budget("query_fingerprint"), Some(100));

        // known keys still pass and other databases have their own budget
        assert_eq!(gate.admit(&mut record("db1", "fp5", "app"), now), AdmissionDecision::Admit);
        assert_eq!(gate.admit(&mut record("db2", "fp100", "app"), now), AdmissionDecision::Admit);
    }

    #[test]
    fn test_stale_key_is_evicted_for_new_key() {
        let mut dim = fingerprint_dim(2);
        dim.new_keys_per_interval = Some(10);
        let mut config = config_with(vec![dim]);
        config.refill_interval = Duration::from_secs(3600);
        let mut gate = CostControlGate::new(&config);
        let t0 = Timestamp::from_secs(0);
        gate.admit(&mut record("db1", "a", "app"), t0);
        gate.admit(&mut record("db1", "b", "app"), t0.add_duration(Duration::from_secs(10)));

        // nothing stale yet
        let soon = t0.add_duration(Duration::from_secs(20));
        assert_eq!(gate.admit(&mut record("db1", "c", "app"), soon), AdmissionDecision::Reject);

        // "a" is stale after 300s, "b" is not
        let later = t0.add_duration(Duration::from_secs(300));
        assert_eq!(gate.admit(&mut record("db1", "c", "app"), later), AdmissionDecision::Admit);
        assert_eq!(gate.fullest_budget("query_fingerprint"), Some(2));
        assert_eq!(gate.snapshot().evicted, 1);
        assert_eq!(gate.admit(&mut record("db1", "b", "app"), later), AdmissionDecision::Admit);
    }

    #[test]
    fn test_downsample_folds_new_user_onto_known_fingerprint() {
        let mut gate = CostControlGate::new(&config_with(vec![fingerprint_dim(1)]));
        let now = Timestamp::from_secs(1);
        assert_eq!(gate.admit(&mut record("db1", "fp1", "alice"), now), AdmissionDecision::Admit);

        let mut bob = record("db1", "fp1", "bob");
        assert_eq!(gate.admit(&mut bob, now), AdmissionDecision::Downsample);
        assert!(bob.downsampled);
        assert!(bob.attribute(attr::DB_USER).is_none());
        assert!(bob.attribute(attr::CLIENT_ADDRESS).is_none());
        assert_eq!(bob.attribute(attr::QUERY_FINGERPRINT), Some(&AttrValue::from("fp1")));
        assert_eq!(bob.attribute(attr::DOWNSAMPLED), Some(&AttrValue::Bool(true)));

        // a new fingerprint has no coarser key to fold onto
        assert_eq!(gate.admit(&mut record("db1", "fp2", "bob"), now), AdmissionDecision::Reject);
        let snapshot = gate.snapshot();
        assert_eq!((snapshot.admitted, snapshot.downsampled, snapshot.rejected), (1, 1, 1));
    }

    #[test]
    fn test_new_key_allowance_resets_on_refill() {
        let mut dim = fingerprint_dim(10);
        dim.new_keys_per_interval = Some(2);
        let mut gate = CostControlGate::new(&config_with(vec![dim]));
        let t0 = Timestamp::from_secs(0);

        assert_eq!(gate.admit(&mut record("db1", "a", "u"), t0), AdmissionDecision::Admit);
        assert_eq!(gate.admit(&mut record("db1", "b", "u"), t0), AdmissionDecision::Admit);
        assert_eq!(gate.admit(&mut record("db1", "c", "u"), t0), AdmissionDecision::Reject);

        let next_interval = t0.add_duration(Duration::from_secs(60));
        assert_eq!(gate.admit(&mut record("db1", "c", "u"), next_interval), AdmissionDecision::Admit);
    }

    #[test]
    fn test_coarse_dimension_rejects_first() {
        let mut dims = CostConfig::default().dimensions;
        dims[0].capacity = 1;
        let mut gate = CostControlGate::new(&config_with(dims));
        let now = Timestamp::from_secs(1);

        assert_eq!(gate.admit(&mut record("db1", "fp1", "u"), now), AdmissionDecision::Admit);
        assert_eq!(gate.admit(&mut record("db2", "fp1", "u"), now), AdmissionDecision::Reject);
        // db2 never reached the per-database fingerprint dimension
        let fp = gate
            .snapshot()
            .dimensions
            .into_iter()
            .find(|d| d.name == "query_fingerprint")
            .unwrap();
        assert_eq!(fp.budgets, 1);
    }

    #[test]
    fn test_cost_estimate_tracks_admitted_bytes() {
        let mut gate = CostControlGate::new(&CostConfig::default());
        let mut r = record("db1", "fp1", "app");
        let bytes = r.estimated_bytes();
        gate.admit(&mut r, Timestamp::from_secs(1));
        assert_eq!(gate.estimated_cost_bytes(), bytes);
        let expected_usd = bytes as f64 / BYTES_PER_GB * 0.35;
        assert!((gate.estimated_cost_usd() - expected_usd).abs() < 1e-12);
    }

    proptest! {
        #[test]
        fn prop_unique_keys_never_exceed_capacity(
            ops in prop::collection::vec((0u8..4, 0u16..60, 0u8..5, 0u64..400), 1..300)
        ) {
            let mut gate = CostControlGate::new(&config_with(vec![
                DimensionConfig { capacity: 3, ..CostConfig::default().dimensions[0].clone() },
                fingerprint_dim(10),
            ]));
            let mut now = Timestamp::from_secs(0);
            for (db, fp, user, advance) in ops {
                now = now.add_duration(Duration::from_secs(advance));
                let mut r = record(&format!("db{}", db), &format!("fp{}", fp), &format!("u{}", user));
                gate.admit(&mut r, now);
                prop_assert!(gate.fullest_budget("database").unwrap_or(0) <= 3);
                prop_assert!(gate.fullest_budget("query_fingerprint").unwrap_or(0) <= 10);
            }
        }
    }
}
