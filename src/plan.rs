// ============================================================================
// SECTION 9: PLAN ATTRIBUTE EXTRACTION
// ============================================================================
// Turns a raw execution plan into a bounded set of `db.plan.*` attributes and
// scrubs literals from predicates and query text.
//
// One parser per dialect, chosen by the record's plan format:
// - PostgreSQL EXPLAIN (FORMAT JSON)
// - PostgreSQL textual EXPLAIN
// - MySQL EXPLAIN FORMAT=JSON
//
// A plan that cannot be parsed never fails the record: it is flagged with
// `db.plan.unparsed` and the record moves on.
// ============================================================================

use std::borrow::Cow;
use std::fmt::Debug;

use compact_str::CompactString;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use smallvec::SmallVec;
use tracing::{debug, trace};
use xxhash_rust::xxh3::xxh3_64;

use crate::attr;
use crate::config::PlanConfig;
use crate::error::{PlanError, PlanResult};
use crate::types::{AttrValue, PlanFormat, QueryExecutionRecord, RawPlan};
use crate::REDACTION_PLACEHOLDER;

// ----------------------------------------------------------------------------
// 9.1 Literal Redaction
// ----------------------------------------------------------------------------

static STRING_LITERAL: Lazy<Regex> = Lazy::new(|| Regex::new(r"'(?:[^']|'')*'").unwrap());
static HEX_LITERAL: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b0[xX][0-9a-fA-F]+\b").unwrap());
static NUMERIC_LITERAL: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b\d+(?:\.\d+)?(?:[eE][+-]?\d+)?\b").unwrap());
static BLOCK_COMMENT: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)/\*.*?\*/").unwrap());
static LINE_COMMENT: Lazy<Regex> = Lazy::new(|| Regex::new(r"--[^\n]*").unwrap());
static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());
static PLACEHOLDER_LIST: Lazy<Regex> = Lazy::new(|| Regex::new(r"\(\s*\?(?:\s*,\s*\?)+\s*\)").unwrap());
static TEXT_COST: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"cost=(\d+(?:\.\d+)?)\.\.(\d+(?:\.\d+)?)\s+rows=(\d+)").unwrap()
});

/// Plan fields that carry predicates (and therefore literals)
const PREDICATE_KEYS: &[&str] = &[
    "Filter",
    "Index Cond",
    "Hash Cond",
    "Merge Cond",
    "Join Filter",
    "Recheck Cond",
    "TID Cond",
    "attached_condition",
];

/// Replace string, hex and numeric literals with the placeholder.
/// Returns the redacted text and whether anything changed.
pub fn redact_literals(text: &str) -> (Cow<'_, str>, bool) {
    let mut current: Option<String> = None;
    for pattern in [&*STRING_LITERAL, &*HEX_LITERAL, &*NUMERIC_LITERAL] {
        let source = current.as_deref().unwrap_or(text);
        let replaced = match pattern.replace_all(source, REDACTION_PLACEHOLDER) {
            Cow::Owned(replaced) => Some(replaced),
            Cow::Borrowed(_) => None,
        };
        if replaced.is_some() {
            current = replaced;
        }
    }
    match current {
        Some(redacted) => (Cow::Owned(redacted), true),
        None => (Cow::Borrowed(text), false),
    }
}

/// Normal form used for fingerprinting: literals redacted, comments removed,
/// whitespace collapsed, placeholder lists folded, lowercased.
pub fn normalize_query(text: &str) -> String {
    let (redacted, _) = redact_literals(text);
    let no_block = BLOCK_COMMENT.replace_all(&redacted, " ");
    let no_line = LINE_COMMENT.replace_all(&no_block, " ");
    let collapsed = WHITESPACE.replace_all(&no_line, " ");
    let folded = PLACEHOLDER_LIST.replace_all(&collapsed, "(?)");
    folded.trim().to_lowercase()
}

/// Stable fingerprint of a query's shape
pub fn fingerprint(text: &str) -> String {
    format!("{:016x}", xxh3_64(normalize_query(text).as_bytes()))
}

/// Cut `text` to at most `max_bytes` without splitting a character
pub fn truncate_utf8(text: &str, max_bytes: usize) -> &str {
    if text.len() <= max_bytes {
        return text;
    }
    let mut end = max_bytes;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

fn redact_json_predicates(value: &mut Value) -> bool {
    let mut changed = false;
    match value {
        Value::Object(map) => {
            for (key, child) in map.iter_mut() {
                if PREDICATE_KEYS.contains(&key.as_str()) {
                    if let Value::String(s) = child {
                        let (redacted, did) = redact_literals(s);
                        if did {
                            *s = redacted.into_owned();
                            changed = true;
                        }
                    }
                } else {
                    changed |= redact_json_predicates(child);
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                changed |= redact_json_predicates(item);
            }
        }
        _ => {}
    }
    changed
}

fn redact_json_payload(payload: &str) -> String {
    match serde_json::from_str::<Value>(payload) {
        Ok(mut value) => {
            redact_json_predicates(&mut value);
            serde_json::to_string(&value).unwrap_or_else(|_| redact_literals(payload).0.into_owned())
        }
        Err(_) => redact_literals(payload).0.into_owned(),
    }
}

// ----------------------------------------------------------------------------
// 9.2 Plan Summary
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinStrategy {
    #[default]
    None,
    NestedLoop,
    HashJoin,
    MergeJoin,
}

impl JoinStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            JoinStrategy::None => "none",
            JoinStrategy::NestedLoop => "nested_loop",
            JoinStrategy::HashJoin => "hash_join",
            JoinStrategy::MergeJoin => "merge_join",
        }
    }

    fn from_postgres_node(node_type: &str) -> Option<Self> {
        match node_type {
            "Nested Loop" => Some(JoinStrategy::NestedLoop),
            "Hash Join" => Some(JoinStrategy::HashJoin),
            "Merge Join" => Some(JoinStrategy::MergeJoin),
            _ => None,
        }
    }
}

/// Structured attributes extracted from one plan.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanSummary {
    pub total_cost: Option<f64>,
    pub startup_cost: Option<f64>,
    pub plan_rows: Option<f64>,
    /// Distinct operator types in first-seen order
    pub operators: SmallVec<[CompactString; 8]>,
    pub join_strategy: JoinStrategy,
    pub node_count: u32,
    pub depth: u32,
    pub has_seq_scan: bool,
}

impl PlanSummary {
    fn note_operator(&mut self, op: &str, max_operators: usize) {
        self.node_count += 1;
        if op.contains("Seq Scan") || op == "Full Table Scan" {
            self.has_seq_scan = true;
        }
        if self.join_strategy == JoinStrategy::None {
            if let Some(join) = JoinStrategy::from_postgres_node(op) {
                self.join_strategy = join;
            }
        }
        if self.operators.len() < max_operators && !self.operators.iter().any(|o| *o == op) {
            self.operators.push(CompactString::from(op));
        }
    }

    /// Write the summary into the record's `db.plan.*` attributes
    pub fn apply(&self, record: &mut QueryExecutionRecord) {
        if let Some(cost) = self.total_cost {
            record.set_attribute(attr::PLAN_TOTAL_COST, cost);
        }
        if let Some(cost) = self.startup_cost {
            record.set_attribute(attr::PLAN_STARTUP_COST, cost);
        }
        if let Some(rows) = self.plan_rows {
            record.set_attribute(attr::PLAN_ROWS, rows);
        }
        let operators: Vec<&str> = self.operators.iter().map(|o| o.as_str()).collect();
        record.set_attribute(attr::PLAN_OPERATORS, operators.join(","));
        record.set_attribute(attr::PLAN_JOIN_STRATEGY, self.join_strategy.as_str());
        record.set_attribute(attr::PLAN_NODE_COUNT, self.node_count as i64);
        record.set_attribute(attr::PLAN_DEPTH, self.depth as i64);
        record.set_attribute(attr::PLAN_HAS_SEQ_SCAN, self.has_seq_scan);
    }
}

fn json_number(value: Option<&Value>) -> Option<f64> {
    match value? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

// ----------------------------------------------------------------------------
// 9.3 Parser Capability
// ----------------------------------------------------------------------------

/// One plan dialect.
pub trait PlanParser: Send + Sync + Debug {
    fn format(&self) -> PlanFormat;

    fn parse(&self, payload: &str) -> PlanResult<PlanSummary>;

    /// Copy of the payload with literals removed from predicates
    fn redact(&self, payload: &str) -> String;
}

/// PostgreSQL `EXPLAIN (FORMAT JSON)`: `[{"Plan": {...}}]`
#[derive(Debug, Clone)]
pub struct PostgresJsonParser {
    max_operators: usize,
}

impl PostgresJsonParser {
    pub fn new(max_operators: usize) -> Self {
        Self { max_operators }
    }

    fn walk(&self, node: &Value, depth: u32, summary: &mut PlanSummary) {
        summary.depth = summary.depth.max(depth);
        if let Some(node_type) = node.get("Node Type").and_then(Value::as_str) {
            summary.note_operator(node_type, self.max_operators);
        }
        if let Some(children) = node.get("Plans").and_then(Value::as_array) {
            for child in children {
                self.walk(child, depth + 1, summary);
            }
        }
    }
}

impl PlanParser for PostgresJsonParser {
    fn format(&self) -> PlanFormat {
        PlanFormat::PostgresJson
    }

    fn parse(&self, payload: &str) -> PlanResult<PlanSummary> {
        if payload.trim().is_empty() {
            return Err(PlanError::Empty);
        }
        let value: Value = serde_json::from_str(payload)?;
        let wrapper = match &value {
            Value::Array(items) => items.first().ok_or(PlanError::Empty)?,
            other => other,
        };
        let root = wrapper
            .get("Plan")
            .ok_or(PlanError::UnexpectedShape("missing Plan object"))?;
        if !root.is_object() {
            return Err(PlanError::UnexpectedShape("Plan is not an object"));
        }

        let mut summary = PlanSummary {
            total_cost: json_number(root.get("Total Cost")),
            startup_cost: json_number(root.get("Startup Cost")),
            plan_rows: json_number(root.get("Plan Rows")),
            ..PlanSummary::default()
        };
        self.walk(root, 1, &mut summary);
        Ok(summary)
    }

    fn redact(&self, payload: &str) -> String {
        redact_json_payload(payload)
    }
}

/// PostgreSQL textual `EXPLAIN`
#[derive(Debug, Clone)]
pub struct PostgresTextParser {
    max_operators: usize,
}

impl PostgresTextParser {
    pub fn new(max_operators: usize) -> Self {
        Self { max_operators }
    }

    /// Operator name of a node line: text before the cost block, minus the
    /// relation/index part
    fn operator_name(line: &str) -> &str {
        let head = line.trim_start().trim_start_matches("->").trim_start();
        let head = head.split("  (").next().unwrap_or(head);
        let head = head.split(" (cost=").next().unwrap_or(head);
        let head = head.split(" on ").next().unwrap_or(head);
        let head = head.split(" using ").next().unwrap_or(head);
        head.trim()
    }

    fn is_noise(line: &str) -> bool {
        let trimmed = line.trim();
        trimmed.is_empty()
            || trimmed == "QUERY PLAN"
            || trimmed.chars().all(|c| c == '-')
            || (trimmed.starts_with('(') && trimmed.ends_with("rows)"))
    }
}

impl PlanParser for PostgresTextParser {
    fn format(&self) -> PlanFormat {
        PlanFormat::PostgresText
    }

    fn parse(&self, payload: &str) -> PlanResult<PlanSummary> {
        if payload.trim().is_empty() {
            return Err(PlanError::Empty);
        }
        let mut summary = PlanSummary::default();
        let mut stack: Vec<(usize, u32)> = Vec::new();
        let mut seen_root = false;

        for line in payload.lines().filter(|l| !Self::is_noise(l)) {
            let indent = line.len() - line.trim_start().len();
            let is_node = line.trim_start().starts_with("->") || !seen_root;
            if !is_node {
                continue;
            }
            let op = Self::operator_name(line);
            if op.is_empty() || op.contains(':') {
                continue;
            }

            while stack.last().map_or(false, |(i, _)| *i >= indent) {
                stack.pop();
            }
            let depth = stack.last().map_or(1, |(_, d)| d + 1);
            stack.push((indent, depth));
            summary.depth = summary.depth.max(depth);

            if !seen_root {
                if let Some(caps) = TEXT_COST.captures(line) {
                    summary.startup_cost = caps.get(1).and_then(|m| m.as_str().parse().ok());
                    summary.total_cost = caps.get(2).and_then(|m| m.as_str().parse().ok());
                    summary.plan_rows = caps.get(3).and_then(|m| m.as_str().parse().ok());
                }
                seen_root = true;
            }
            summary.note_operator(op, self.max_operators);
        }

        if summary.node_count == 0 {
            return Err(PlanError::NoOperators);
        }
        Ok(summary)
    }

    fn redact(&self, payload: &str) -> String {
        payload
            .lines()
            .map(|line| {
                let trimmed = line.trim_start();
                let is_predicate = PREDICATE_KEYS
                    .iter()
                    .any(|key| trimmed.starts_with(key) && trimmed[key.len()..].starts_with(':'));
                if is_predicate {
                    redact_literals(line).0.into_owned()
                } else {
                    line.to_string()
                }
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// MySQL `EXPLAIN FORMAT=JSON`: `{"query_block": {...}}`
#[derive(Debug, Clone)]
pub struct MySqlJsonParser {
    max_operators: usize,
}

impl MySqlJsonParser {
    pub fn new(max_operators: usize) -> Self {
        Self { max_operators }
    }

    fn access_operator(access_type: &str) -> &'static str {
        match access_type {
            "ALL" => "Full Table Scan",
            "index" => "Full Index Scan",
            "range" => "Index Range Scan",
            "ref" | "eq_ref" | "ref_or_null" => "Index Lookup",
            "const" | "system" => "Const Lookup",
            "fulltext" => "Fulltext Lookup",
            _ => "Table Access",
        }
    }

    fn walk(&self, value: &Value, depth: u32, summary: &mut PlanSummary, rows: &mut f64) {
        let Value::Object(map) = value else {
            if let Value::Array(items) = value {
                for item in items {
                    self.walk(item, depth, summary, rows);
                }
            }
            return;
        };
        summary.depth = summary.depth.max(depth);

        for (key, child) in map {
            match key.as_str() {
                "table" => {
                    let access = child.get("access_type").and_then(Value::as_str).unwrap_or("");
                    summary.note_operator(Self::access_operator(access), self.max_operators);
                    *rows += json_number(child.get("rows_examined_per_scan")).unwrap_or(0.0);
                    let join_buffer = child.get("using_join_buffer").and_then(Value::as_str).unwrap_or("");
                    if join_buffer.contains("hash join") {
                        summary.join_strategy = JoinStrategy::HashJoin;
                    }
                    self.walk(child, depth + 1, summary, rows);
                }
                "nested_loop" => {
                    if summary.join_strategy == JoinStrategy::None {
                        summary.join_strategy = JoinStrategy::NestedLoop;
                    }
                    summary.note_operator("Nested Loop", self.max_operators);
                    self.walk(child, depth + 1, summary, rows);
                }
                "ordering_operation" => {
                    summary.note_operator("Sort", self.max_operators);
                    self.walk(child, depth + 1, summary, rows);
                }
                "grouping_operation" => {
                    summary.note_operator("Aggregate", self.max_operators);
                    self.walk(child, depth + 1, summary, rows);
                }
                "duplicates_removal" => {
                    summary.note_operator("Distinct", self.max_operators);
                    self.walk(child, depth + 1, summary, rows);
                }
                _ if child.is_object() || child.is_array() => self.walk(child, depth, summary, rows),
                _ => {}
            }
        }
    }
}

impl PlanParser for MySqlJsonParser {
    fn format(&self) -> PlanFormat {
        PlanFormat::MySqlJson
    }

    fn parse(&self, payload: &str) -> PlanResult<PlanSummary> {
        if payload.trim().is_empty() {
            return Err(PlanError::Empty);
        }
        let value: Value = serde_json::from_str(payload)?;
        let block = value
            .get("query_block")
            .ok_or(PlanError::UnexpectedShape("missing query_block"))?;

        let mut summary = PlanSummary {
            total_cost: json_number(block.get("cost_info").and_then(|c| c.get("query_cost"))),
            ..PlanSummary::default()
        };
        let mut rows = 0.0;
        self.walk(block, 1, &mut summary, &mut rows);
        if summary.node_count > 0 {
            summary.plan_rows = Some(rows);
        }
        Ok(summary)
    }

    fn redact(&self, payload: &str) -> String {
        redact_json_payload(payload)
    }
}

// ----------------------------------------------------------------------------
// 9.4 Extractor
// ----------------------------------------------------------------------------

/// What happened to one record's plan and query text
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlanOutcome {
    pub had_plan: bool,
    pub parsed: bool,
    pub truncated: bool,
    pub unparsed: bool,
    pub query_redacted: bool,
    pub fingerprinted: bool,
}

#[derive(Debug)]
pub struct PlanAttributeExtractor {
    config: PlanConfig,
    postgres_json: PostgresJsonParser,
    postgres_text: PostgresTextParser,
    mysql_json: MySqlJsonParser,
}

impl PlanAttributeExtractor {
    pub fn new(config: PlanConfig) -> Self {
        let max = config.max_operators;
        Self {
            postgres_json: PostgresJsonParser::new(max),
            postgres_text: PostgresTextParser::new(max),
            mysql_json: MySqlJsonParser::new(max),
            config,
        }
    }

    pub fn parser_for(&self, format: PlanFormat) -> &dyn PlanParser {
        match format {
            PlanFormat::PostgresJson => &self.postgres_json,
            PlanFormat::PostgresText => &self.postgres_text,
            PlanFormat::MySqlJson => &self.mysql_json,
        }
    }

    /// Redact the query text, fingerprint it, and replace the raw plan with
    /// structured attributes.
    pub fn process(&self, record: &mut QueryExecutionRecord) -> PlanOutcome {
        let mut outcome = PlanOutcome::default();
        self.process_query_text(record, &mut outcome);

        let Some(raw) = record.plan.take() else {
            return outcome;
        };
        outcome.had_plan = true;

        let payload = truncate_utf8(&raw.payload, self.config.max_plan_bytes);
        if payload.len() < raw.payload.len() {
            outcome.truncated = true;
            record.set_attribute(attr::PLAN_TRUNCATED, true);
        }
        record.set_attribute(attr::PLAN_FORMAT, raw.format.as_str());

        let parser = self.parser_for(raw.format);
        match parser.parse(payload) {
            Ok(summary) => {
                outcome.parsed = true;
                summary.apply(record);
                trace!(
                    target: "dbintel::plan",
                    key = %record.entity_key,
                    nodes = summary.node_count,
                    "Plan attributes extracted"
                );
            }
            Err(e) => {
                outcome.unparsed = true;
                record.set_attribute(attr::PLAN_UNPARSED, true);
                record.set_attribute(attr::PLAN_PARSE_ERROR, e.code());
                debug!(
                    target: "dbintel::plan",
                    key = %record.entity_key,
                    format = raw.format.as_str(),
                    error = %e,
                    "Plan left unparsed"
                );
            }
        }

        if self.config.keep_raw_plan {
            record.plan = Some(RawPlan {
                format: raw.format,
                payload: parser.redact(payload),
            });
            record.set_attribute(attr::PLAN_REDACTED, true);
        }
        outcome
    }

    fn process_query_text(&self, record: &mut QueryExecutionRecord, outcome: &mut PlanOutcome) {
        let Some(text) = record
            .attribute(attr::QUERY_TEXT)
            .and_then(AttrValue::as_str)
            .map(str::to_owned)
        else {
            return;
        };

        let needs_fingerprint =
            self.config.generate_fingerprint && !record.attributes.contains_key(attr::QUERY_FINGERPRINT);
        let fp = needs_fingerprint.then(|| fingerprint(&text));

        if self.config.redact_query_text {
            let (redacted, changed) = redact_literals(&text);
            if changed {
                let redacted = redacted.into_owned();
                record.set_attribute(attr::QUERY_TEXT, redacted);
                outcome.query_redacted = true;
            }
        }
        if let Some(fp) = fp {
            record.set_attribute(attr::QUERY_FINGERPRINT, fp);
            outcome.fingerprinted = true;
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EntityKey, SourceSet, Timestamp, WindowId};
    use std::collections::BTreeMap;
    use test_case::test_case;

    const PG_JSON: &str = r#"[
      {
        "Plan": {
          "Node Type": "Hash Join",
          "Join Type": "Inner",
          "Startup Cost": 1.09,
          "Total Cost": 2.22,
          "Plan Rows": 3,
          "Hash Cond": "(o.customer_id = c.id)",
          "Plans": [
            {
              "Node Type": "Seq Scan",
              "Relation Name": "orders",
              "Filter": "(status = 'shipped'::text AND total > 100)",
              "Total Cost": 1.03,
              "Plan Rows": 3
            },
            {
              "Node Type": "Hash",
              "Plans": [
                { "Node Type": "Index Scan", "Index Cond": "(id = 42)", "Relation Name": "customers" }
              ]
            }
          ]
        }
      }
    ]"#;

    const PG_TEXT: &str = "Nested Loop  (cost=0.29..16.34 rows=1 width=72)
  ->  Index Scan using orders_pkey on orders o  (cost=0.15..8.17 rows=1 width=36)
        Index Cond: (id = 42)
  ->  Seq Scan on customers c  (cost=0.14..8.16 rows=1 width=36)
        Filter: (email = 'a@b.com'::text)";

    const MYSQL_JSON: &str = r#"{
      "query_block": {
        "select_id": 1,
        "cost_info": { "query_cost": "12.40" },
        "ordering_operation": {
          "nested_loop": [
            { "table": { "table_name": "o", "access_type": "ALL", "rows_examined_per_scan": 100,
                         "attached_condition": "(o.status = 'open')" } },
            { "table": { "table_name": "c", "access_type": "eq_ref", "rows_examined_per_scan": 1 } }
          ]
        }
      }
    }"#;

    fn record_with(plan: Option<RawPlan>) -> QueryExecutionRecord {
        let key = EntityKey::new("db1", "q42");
        let mut attributes = BTreeMap::new();
        attributes.insert(
            attr::QUERY_TEXT.to_string(),
            AttrValue::from("SELECT * FROM orders WHERE id = 42 AND note = 'secret'"),
        );
        QueryExecutionRecord {
            window_id: WindowId::derive(&key, Timestamp::from_secs(100), 0),
            entity_key: key,
            bucket_start: Timestamp::from_secs(100),
            bucket_end: Timestamp::from_secs(110),
            closed_at: Timestamp::from_secs(112),
            generation: 0,
            sources: SourceSet::empty(),
            record_count: 1,
            attributes,
            measurements: BTreeMap::new(),
            plan,
            downsampled: false,
        }
    }

    #[test]
    fn test_postgres_json_summary() {
        let summary = PostgresJsonParser::new(16).parse(PG_JSON).unwrap();
        assert_eq!(summary.total_cost, Some(2.22));
        assert_eq!(summary.startup_cost, Some(1.09));
        assert_eq!(summary.plan_rows, Some(3.0));
        assert_eq!(summary.join_strategy, JoinStrategy::HashJoin);
        assert_eq!(summary.node_count, 4);
        assert_eq!(summary.depth, 3);
        assert!(summary.has_seq_scan);
        let ops: Vec<&str> = summary.operators.iter().map(|o| o.as_str()).collect();
        assert_eq!(ops, vec!["Hash Join", "Seq Scan", "Hash", "Index Scan"]);
    }

    #[test]
    fn test_postgres_text_summary() {
        let summary = PostgresTextParser::new(16).parse(PG_TEXT).unwrap();
        assert_eq!(summary.total_cost, Some(16.34));
        assert_eq!(summary.startup_cost, Some(0.29));
        assert_eq!(summary.plan_rows, Some(1.0));
        assert_eq!(summary.join_strategy, JoinStrategy::NestedLoop);
        assert_eq!(summary.node_count, 3);
        assert_eq!(summary.depth, 2);
        assert!(summary.has_seq_scan);
        let ops: Vec<&str> = summary.operators.iter().map(|o| o.as_str()).collect();
        assert_eq!(ops, vec!["Nested Loop", "Index Scan", "Seq Scan"]);
    }

    #[test]
    fn test_mysql_json_summary() {
        let summary = MySqlJsonParser::new(16).parse(MYSQL_JSON).unwrap();
        assert_eq!(summary.total_cost, Some(12.40));
        assert_eq!(summary.plan_rows, Some(101.0));
        assert_eq!(summary.join_strategy, JoinStrategy::NestedLoop);
        assert!(summary.has_seq_scan);
        let ops: Vec<&str> = summary.operators.iter().map(|o| o.as_str()).collect();
        assert_eq!(ops, vec!["Sort", "Nested Loop", "Full Table Scan", "Index Lookup"]);
    }

    #[test]
    fn test_operator_list_is_bounded() {
        let summary = PostgresJsonParser::new(2).parse(PG_JSON).unwrap();
        assert_eq!(summary.operators.len(), 2);
        assert_eq!(summary.node_count, 4);
    }

    #[test_case("id = 42", "id = ?" ; "integer")]
    #[test_case("price > 10.5", "price > ?" ; "decimal")]
    #[test_case("name = 'O''Brien'", "name = ?" ; "quoted string with escape")]
    #[test_case("flags & 0xFF00", "flags & ?" ; "hex")]
    #[test_case("table_2.col_1 = t1.x", "table_2.col_1 = t1.x" ; "identifiers untouched")]
    fn test_redact_literals(input: &str, expected: &str) {
        assert_eq!(redact_literals(input).0, expected);
    }

    #[test]
    fn test_fingerprint_ignores_literals_and_layout() {
        let a = fingerprint("SELECT * FROM orders WHERE id = 42");
        let b = fingerprint("select *\n  from orders  /* hot */ where id = 7");
        let c = fingerprint("SELECT * FROM customers WHERE id = 42");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(
            normalize_query("SELECT 1 FROM t WHERE x IN (1, 2, 3) -- trailing"),
            "select ? from t where x in (?)"
        );
    }

    #[test]
    fn test_process_extracts_and_drops_raw_plan() {
        let extractor = PlanAttributeExtractor::new(PlanConfig::default());
        let mut record = record_with(Some(RawPlan {
            format: PlanFormat::PostgresJson,
            payload: PG_JSON.to_string(),
        }));

        let outcome = extractor.process(&mut record);
        assert!(outcome.parsed);
        assert!(outcome.query_redacted);
        assert!(outcome.fingerprinted);
        assert!(record.plan.is_none());
        assert_eq!(record.attribute(attr::PLAN_TOTAL_COST), Some(&AttrValue::Float(2.22)));
        assert_eq!(record.attribute(attr::PLAN_JOIN_STRATEGY), Some(&AttrValue::from("hash_join")));
        assert_eq!(
            record.attribute(attr::QUERY_TEXT),
            Some(&AttrValue::from("SELECT * FROM orders WHERE id = ? AND note = ?"))
        );
        assert!(record.attribute(attr::QUERY_FINGERPRINT).is_some());
        assert!(record.attribute(attr::PLAN_UNPARSED).is_none());
    }

    #[test]
    fn test_existing_fingerprint_is_kept() {
        let extractor = PlanAttributeExtractor::new(PlanConfig::default());
        let mut record = record_with(None);
        record.set_attribute(attr::QUERY_FINGERPRINT, "abc");
        let outcome = extractor.process(&mut record);
        assert!(!outcome.fingerprinted);
        assert_eq!(record.attribute(attr::QUERY_FINGERPRINT), Some(&AttrValue::from("abc")));
    }

    #[test]
    fn test_parse_failure_degrades() {
        let extractor = PlanAttributeExtractor::new(PlanConfig::default());
        let mut record = record_with(Some(RawPlan {
            format: PlanFormat::MySqlJson,
            payload: "{\"not_a_plan\": true}".to_string(),
        }));
        let outcome = extractor.process(&mut record);
        assert!(outcome.unparsed);
        assert_eq!(record.attribute(attr::PLAN_UNPARSED), Some(&AttrValue::Bool(true)));
        assert_eq!(record.attribute(attr::PLAN_PARSE_ERROR), Some(&AttrValue::from("unexpected_shape")));
        assert!(record.plan.is_none());
    }

    #[test]
    fn test_oversized_json_plan_is_truncated_and_unparsed() {
        let config = PlanConfig {
            max_plan_bytes: 64,
            ..PlanConfig::default()
        };
        let extractor = PlanAttributeExtractor::new(config);
        let mut record = record_with(Some(RawPlan {
            format: PlanFormat::PostgresJson,
            payload: PG_JSON.to_string(),
        }));
        let outcome = extractor.process(&mut record);
        assert!(outcome.truncated);
        assert!(outcome.unparsed);
        assert_eq!(record.attribute(attr::PLAN_TRUNCATED), Some(&AttrValue::Bool(true)));
        assert_eq!(record.attribute(attr::PLAN_PARSE_ERROR), Some(&AttrValue::from("invalid_json")));
    }

    #[test]
    fn test_kept_raw_plan_has_predicates_redacted() {
        let config = PlanConfig {
            keep_raw_plan: true,
            ..PlanConfig::default()
        };
        let extractor = PlanAttributeExtractor::new(config);

        let mut record = record_with(Some(RawPlan {
            format: PlanFormat::PostgresText,
            payload: PG_TEXT.to_string(),
        }));
        extractor.process(&mut record);
        let kept = record.plan.as_ref().unwrap();
        assert!(kept.payload.contains("Index Cond: (id = ?)"));
        assert!(kept.payload.contains("Filter: (email = ?::text)"));
        // costs on node lines are not predicates
        assert!(kept.payload.contains("cost=0.29..16.34"));

        let mut record = record_with(Some(RawPlan {
            format: PlanFormat::PostgresJson,
            payload: PG_JSON.to_string(),
        }));
        extractor.process(&mut record);
        let kept = &record.plan.as_ref().unwrap().payload;
        assert!(!kept.contains("shipped"));
        assert!(!kept.contains("= 42"));
        assert!(kept.contains("2.22"));
    }

    #[test]
    fn test_truncate_utf8_boundary() {
        let text = "héllo";
        assert_eq!(truncate_utf8(text, 2), "h");
        assert_eq!(truncate_utf8(text, 3), "hé");
        assert_eq!(truncate_utf8(text, 100), text);
    }
}
