//! # DbIntel Engine - Database Telemetry Admission & Correlation
//!
//! An in-process pipeline that sits between raw database telemetry collection
//! and a metrics backend. It reconstructs one logical database event from
//! samples collected independently by several collectors, and keeps ingest
//! cost bounded while the backend pushes back.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────────────┐
//! │                              DBINTEL ENGINE                                    │
//! ├───────────────────────────────────────────────────────────────────────────────┤
//! │  session ──┐                                                                   │
//! │  query_stat├─► CORRELATOR ─► PLAN ─► COST GATE ─► SAMPLER ─► VERIFIER ─► EXPORT│
//! │  kernel ───┘       ▲ sweep                           ▲                 ▲ breaker│
//! │                                                      └──── FEEDBACK ◄──┘       │
//! └───────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every arrow is a bounded queue. Each stage owns its state exclusively;
//! other stages only ever see snapshots.
//!
//! ## Features
//!
//! - **Cross-source correlation**: time-bucketed windows with grace periods and late generations
//! - **Cost control**: per-dimension cardinality budgets with eviction and downsampling
//! - **Coherent adaptive sampling**: hash-based keep decisions steered by backend feedback
//! - **Per-target circuit breaking**: one failing database never gates another
//! - **Plan extraction**: PostgreSQL and MySQL plans parsed and redacted

#![warn(rust_2018_idioms)]
#![warn(missing_debug_implementations)]

// ============================================================================
// SECTION 1: MODULES
// ============================================================================

pub mod breaker;
pub mod channel;
pub mod config;
pub mod correlator;
pub mod cost;
pub mod engine;
pub mod error;
pub mod export;
pub mod feedback;
pub mod logging;
pub mod metrics;
pub mod plan;
pub mod sampler;
pub mod types;
pub mod verifier;

pub use config::EngineConfig;
pub use engine::{Engine, EngineTask, PipelineHandle};
pub use error::{PipelineError, PipelineResult, RecoveryHint};
pub use export::{ExportBatch, Exporter, JsonLinesExporter, NullExporter};
pub use types::{
    AttrValue, EntityKey, ExportOutcome, FeedbackSignal, Measurement, OutcomeKind, PlanFormat,
    QueryExecutionRecord, SourceKind, TelemetryRecord, Timestamp,
};

// ============================================================================
// SECTION 2: CONSTANTS & VERSION INFORMATION
// ============================================================================

/// Engine version - follows semantic versioning
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const ENGINE_NAME: &str = "dbintel-engine";
pub const ENGINE_FULL_NAME: &str = "DbIntel Telemetry Engine";

// ----------------------------------------------------------------------------
// Queues & Workers
// ----------------------------------------------------------------------------

/// Capacity of each queue between two stages
pub const DEFAULT_QUEUE_CAPACITY: usize = 4096;

/// How long a producer may wait on a full stage queue
pub const DEFAULT_BACKPRESSURE_GRACE_MS: u64 = 250;

/// Records per export batch
pub const DEFAULT_BATCH_SIZE: usize = 256;

pub const DEFAULT_EXPORT_WORKERS: usize = 4;
pub const MAX_EXPORT_WORKERS: usize = 256;

// ----------------------------------------------------------------------------
// Timing & Intervals
// ----------------------------------------------------------------------------

pub const DEFAULT_BUCKET_WIDTH_SECS: u64 = 10;
pub const DEFAULT_GRACE_PERIOD_SECS: u64 = 2;
pub const DEFAULT_DRAIN_DEADLINE_SECS: u64 = 10;

/// Sweeps slower than this are logged
pub const SLOW_SWEEP_THRESHOLD_MS: u64 = 50;

// ----------------------------------------------------------------------------
// Limits
// ----------------------------------------------------------------------------

/// Longest raw entity key accepted
pub const MAX_ENTITY_KEY_LENGTH: usize = 256;

/// Distinct operator types kept per plan
pub const MAX_PLAN_OPERATORS: usize = 16;

/// Placeholder written over redacted literals
pub const REDACTION_PLACEHOLDER: &str = "?";

// ----------------------------------------------------------------------------
// Well-known attribute and measurement names
// ----------------------------------------------------------------------------

pub mod attr {
    pub const QUERY_TEXT: &str = "db.query.text";
    pub const QUERY_FINGERPRINT: &str = "db.query.fingerprint";
    pub const DB_USER: &str = "db.user";
    pub const CLIENT_ADDRESS: &str = "client.address";

    pub const PLAN_TOTAL_COST: &str = "db.plan.total_cost";
    pub const PLAN_STARTUP_COST: &str = "db.plan.startup_cost";
    pub const PLAN_ROWS: &str = "db.plan.rows";
    pub const PLAN_OPERATORS: &str = "db.plan.operators";
    pub const PLAN_JOIN_STRATEGY: &str = "db.plan.join_strategy";
    pub const PLAN_NODE_COUNT: &str = "db.plan.node_count";
    pub const PLAN_DEPTH: &str = "db.plan.depth";
    pub const PLAN_HAS_SEQ_SCAN: &str = "db.plan.has_seq_scan";
    pub const PLAN_FORMAT: &str = "db.plan.format";
    pub const PLAN_TRUNCATED: &str = "db.plan.truncated";
    pub const PLAN_UNPARSED: &str = "db.plan.unparsed";
    pub const PLAN_PARSE_ERROR: &str = "db.plan.parse_error";
    pub const PLAN_REDACTED: &str = "db.plan.redacted";

    pub const DOWNSAMPLED: &str = "dbintel.downsampled";
    pub const PARTIAL: &str = "dbintel.correlation.partial";

    /// Query duration in milliseconds
    pub const DURATION_MS: &str = "duration_ms";
}
