// ============================================================================
// SECTION 5: CONFIGURATION SYSTEM
// ============================================================================
// Configuration management with:
// - TOML file parsing
// - Environment variable overrides (DBINTEL_SECTION__FIELD)
// - Validation
// - Sensible defaults for every knob
// ============================================================================

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::{
    DEFAULT_BACKPRESSURE_GRACE_MS, DEFAULT_BATCH_SIZE, DEFAULT_BUCKET_WIDTH_SECS,
    DEFAULT_DRAIN_DEADLINE_SECS, DEFAULT_EXPORT_WORKERS, DEFAULT_GRACE_PERIOD_SECS,
    DEFAULT_QUEUE_CAPACITY, MAX_EXPORT_WORKERS, MAX_PLAN_OPERATORS,
};

// ----------------------------------------------------------------------------
// 5.1 Main Configuration Structure
// ----------------------------------------------------------------------------

/// Root configuration for the pipeline
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Queues, workers and shutdown
    #[serde(default)]
    pub pipeline: PipelineConfig,

    #[serde(default)]
    pub correlator: CorrelatorConfig,

    #[serde(default)]
    pub plan: PlanConfig,

    #[serde(default)]
    pub cost: CostConfig,

    #[serde(default)]
    pub sampler: SamplerConfig,

    #[serde(default)]
    pub breaker: BreakerConfig,

    #[serde(default)]
    pub verifier: VerifierConfig,

    #[serde(default)]
    pub feedback: FeedbackConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl EngineConfig {
    /// Environment prefix for overrides, e.g. `DBINTEL_SAMPLER__MIN_FLOOR=0.05`
    pub const ENV_PREFIX: &'static str = "DBINTEL_";

    /// Load configuration from file with environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }

        let figment = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed(Self::ENV_PREFIX).split("__"));

        let config: Self = figment.extract().map_err(|e| ConfigError::parse(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides, used when no file is given
    pub fn from_env() -> Result<Self, ConfigError> {
        let figment = Figment::from(figment::providers::Serialized::defaults(Self::default()))
            .merge(Env::prefixed(Self::ENV_PREFIX).split("__"));
        let config: Self = figment.extract().map_err(|e| ConfigError::parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from string (for testing)
    pub fn from_str(toml_str: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(toml_str).map_err(|e| ConfigError::parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.pipeline.validate()?;
        self.correlator.validate()?;
        self.plan.validate()?;
        self.cost.validate()?;
        self.sampler.validate()?;
        self.breaker.validate()?;
        self.verifier.validate()?;
        self.feedback.validate()?;
        if self.feedback.signal_capacity < self.pipeline.export_workers {
            return Err(ConfigError::invalid_value(
                "feedback.signal_capacity",
                format!(
                    "must be at least pipeline.export_workers ({})",
                    self.pipeline.export_workers
                ),
            ));
        }
        Ok(())
    }

    /// Render the defaults as a TOML document
    pub fn generate_default_config() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

fn require_nonzero_duration(field: &str, value: Duration) -> Result<(), ConfigError> {
    if value.is_zero() {
        return Err(ConfigError::invalid_value(field, "must be greater than zero"));
    }
    Ok(())
}

fn require_nonzero(field: &str, value: usize) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::invalid_value(field, "must be greater than zero"));
    }
    Ok(())
}

fn default_true() -> bool {
    true
}

// ----------------------------------------------------------------------------
// 5.2 Pipeline Configuration
// ----------------------------------------------------------------------------

/// Stage queues, export worker pool and shutdown behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Capacity of each bounded queue between stages
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// How long a producer may wait on a full queue before backpressure is escalated
    #[serde(with = "humantime_serde", default = "default_backpressure_grace")]
    pub backpressure_grace: Duration,

    /// Upper bound on the shutdown drain
    #[serde(with = "humantime_serde", default = "default_drain_deadline")]
    pub drain_deadline: Duration,

    /// Concurrent export calls
    #[serde(default = "default_export_workers")]
    pub export_workers: usize,

    /// Records per export batch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Partial batches are flushed after this long
    #[serde(with = "humantime_serde", default = "default_flush_interval")]
    pub flush_interval: Duration,

    #[serde(with = "humantime_serde", default = "default_export_timeout")]
    pub export_timeout: Duration,

    /// Retries of a failed batch while the breaker still admits
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            backpressure_grace: default_backpressure_grace(),
            drain_deadline: default_drain_deadline(),
            export_workers: default_export_workers(),
            batch_size: default_batch_size(),
            flush_interval: default_flush_interval(),
            export_timeout: default_export_timeout(),
            max_retries: default_max_retries(),
        }
    }
}

impl PipelineConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        require_nonzero("pipeline.queue_capacity", self.queue_capacity)?;
        require_nonzero("pipeline.batch_size", self.batch_size)?;
        require_nonzero("pipeline.export_workers", self.export_workers)?;
        if self.export_workers > MAX_EXPORT_WORKERS {
            return Err(ConfigError::invalid_value(
                "pipeline.export_workers",
                format!("cannot exceed {}", MAX_EXPORT_WORKERS),
            ));
        }
        require_nonzero_duration("pipeline.flush_interval", self.flush_interval)?;
        require_nonzero_duration("pipeline.export_timeout", self.export_timeout)?;
        Ok(())
    }
}

fn default_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}

fn default_backpressure_grace() -> Duration {
    Duration::from_millis(DEFAULT_BACKPRESSURE_GRACE_MS)
}

fn default_drain_deadline() -> Duration {
    Duration::from_secs(DEFAULT_DRAIN_DEADLINE_SECS)
}

fn default_export_workers() -> usize {
    DEFAULT_EXPORT_WORKERS
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_flush_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_export_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_max_retries() -> u32 {
    3
}

// ----------------------------------------------------------------------------
// 5.3 Correlator Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrelatorConfig {
    /// Width of a correlation bucket
    #[serde(with = "humantime_serde", default = "default_bucket_width")]
    pub bucket_width: Duration,

    /// How long after the bucket end a window stays open
    #[serde(with = "humantime_serde", default = "default_grace_period")]
    pub grace_period: Duration,

    /// How long after close a late record may still open a new generation
    #[serde(with = "humantime_serde", default = "default_allowed_lateness")]
    pub allowed_lateness: Duration,

    /// Sweep timer period
    #[serde(with = "humantime_serde", default = "default_sweep_interval")]
    pub sweep_interval: Duration,

    /// Open windows beyond this force the oldest one closed
    #[serde(default = "default_max_open_windows")]
    pub max_open_windows: usize,
}

impl Default for CorrelatorConfig {
    fn default() -> Self {
        Self {
            bucket_width: default_bucket_width(),
            grace_period: default_grace_period(),
            allowed_lateness: default_allowed_lateness(),
            sweep_interval: default_sweep_interval(),
            max_open_windows: default_max_open_windows(),
        }
    }
}

impl CorrelatorConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        require_nonzero_duration("correlator.bucket_width", self.bucket_width)?;
        require_nonzero_duration("correlator.sweep_interval", self.sweep_interval)?;
        require_nonzero("correlator.max_open_windows", self.max_open_windows)?;
        Ok(())
    }
}

fn default_bucket_width() -> Duration {
    Duration::from_secs(DEFAULT_BUCKET_WIDTH_SECS)
}

fn default_grace_period() -> Duration {
    Duration::from_secs(DEFAULT_GRACE_PERIOD_SECS)
}

fn default_allowed_lateness() -> Duration {
    Duration::from_secs(30)
}

fn default_sweep_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_max_open_windows() -> usize {
    100_000
}

// ----------------------------------------------------------------------------
// 5.4 Plan Extraction Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanConfig {
    /// Payloads above this are truncated before parsing
    #[serde(default = "default_max_plan_bytes")]
    pub max_plan_bytes: usize,

    /// Distinct operator types kept per plan
    #[serde(default = "default_max_operators")]
    pub max_operators: usize,

    /// Keep the (redacted) raw plan on the record after extraction
    #[serde(default)]
    pub keep_raw_plan: bool,

    /// Replace literals in `db.query.text`
    #[serde(default = "default_true")]
    pub redact_query_text: bool,

    /// Derive `db.query.fingerprint` when the source did not supply one
    #[serde(default = "default_true")]
    pub generate_fingerprint: bool,
}

impl Default for PlanConfig {
    fn default() -> Self {
        Self {
            max_plan_bytes: default_max_plan_bytes(),
            max_operators: default_max_operators(),
            keep_raw_plan: false,
            redact_query_text: true,
            generate_fingerprint: true,
        }
    }
}

impl PlanConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        require_nonzero("plan.max_plan_bytes", self.max_plan_bytes)?;
        require_nonzero("plan.max_operators", self.max_operators)?;
        Ok(())
    }
}

fn default_max_plan_bytes() -> usize {
    64 * 1024
}

fn default_max_operators() -> usize {
    MAX_PLAN_OPERATORS
}

// ----------------------------------------------------------------------------
// 5.5 Cost Control Configuration
// ----------------------------------------------------------------------------

/// Whether a dimension's budget is shared or kept per database
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DimensionScope {
    Global,
    PerDatabase,
}

/// One cardinality dimension
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DimensionConfig {
    pub name: String,

    #[serde(default = "default_scope")]
    pub scope: DimensionScope,

    /// Key parts: `$database`, `$identifier` or attribute names
    pub key: Vec<String>,

    /// Key attributes stripped when a record is downsampled
    #[serde(default)]
    pub high_cardinality: Vec<String>,

    /// Maximum unique keys held at any instant
    pub capacity: usize,

    /// New keys that may be minted per refill interval
    #[serde(default)]
    pub new_keys_per_interval: Option<usize>,
}

impl DimensionConfig {
    pub const DATABASE_TOKEN: &'static str = "$database";
    pub const IDENTIFIER_TOKEN: &'static str = "$identifier";

    /// New-key allowance per interval, defaulting to the capacity
    pub fn allowance(&self) -> usize {
        self.new_keys_per_interval.unwrap_or(self.capacity)
    }
}

fn default_scope() -> DimensionScope {
    DimensionScope::Global
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostConfig {
    /// Budget refill period
    #[serde(with = "humantime_serde", default = "default_refill_interval")]
    pub refill_interval: Duration,

    /// Keys unseen for this long may be evicted
    #[serde(with = "humantime_serde", default = "default_staleness")]
    pub staleness: Duration,

    /// Ingest price used for the running USD estimate
    #[serde(default = "default_price_per_gb")]
    pub price_per_gb: f64,

    /// Evaluated in order, coarsest first
    #[serde(default = "default_dimensions")]
    pub dimensions: Vec<DimensionConfig>,
}

impl Default for CostConfig {
    fn default() -> Self {
        Self {
            refill_interval: default_refill_interval(),
            staleness: default_staleness(),
            price_per_gb: default_price_per_gb(),
            dimensions: default_dimensions(),
        }
    }
}

impl CostConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        require_nonzero_duration("cost.refill_interval", self.refill_interval)?;
        if !(self.price_per_gb >= 0.0 && self.price_per_gb.is_finite()) {
            return Err(ConfigError::invalid_value("cost.price_per_gb", "must be a non-negative number"));
        }

        let mut names = HashSet::new();
        for dim in &self.dimensions {
            let field = format!("cost.dimensions.{}", dim.name);
            if dim.name.trim().is_empty() {
                return Err(ConfigError::invalid_value("cost.dimensions.name", "must not be empty"));
            }
            if !names.insert(dim.name.as_str()) {
                return Err(ConfigError::invalid_value(field, "duplicate dimension name"));
            }
            if dim.key.is_empty() {
                return Err(ConfigError::invalid_value(field, "key must have at least one part"));
            }
            for part in &dim.key {
                let known = part == DimensionConfig::DATABASE_TOKEN || part == DimensionConfig::IDENTIFIER_TOKEN;
                if part.starts_with('$') && !known {
                    return Err(ConfigError::invalid_value(field, format!("unknown key token '{}'", part)));
                }
                if part.trim().is_empty() {
                    return Err(ConfigError::invalid_value(field, "empty key part"));
                }
            }
            if let Some(stray) = dim.high_cardinality.iter().find(|h| !dim.key.contains(h)) {
                return Err(ConfigError::invalid_value(
                    field,
                    format!("high_cardinality attribute '{}' is not part of the key", stray),
                ));
            }
            if dim.capacity == 0 {
                return Err(ConfigError::invalid_value(field, "capacity must be greater than zero"));
            }
            if dim.new_keys_per_interval == Some(0) {
                return Err(ConfigError::invalid_value(field, "new_keys_per_interval must be greater than zero"));
            }
        }
        Ok(())
    }
}

fn default_refill_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_staleness() -> Duration {
    Duration::from_secs(300)
}

fn default_price_per_gb() -> f64 {
    0.35
}

fn default_dimensions() -> Vec<DimensionConfig> {
    vec![
        DimensionConfig {
            name: "database".into(),
            scope: DimensionScope::Global,
            key: vec![DimensionConfig::DATABASE_TOKEN.into()],
            high_cardinality: Vec::new(),
            capacity: 1000,
            new_keys_per_interval: None,
        },
        DimensionConfig {
            name: "query_fingerprint".into(),
            scope: DimensionScope::PerDatabase,
            key: vec![
                DimensionConfig::DATABASE_TOKEN.into(),
                crate::attr::QUERY_FINGERPRINT.into(),
                crate::attr::DB_USER.into(),
                crate::attr::CLIENT_ADDRESS.into(),
            ],
            high_cardinality: vec![crate::attr::DB_USER.into(), crate::attr::CLIENT_ADDRESS.into()],
            capacity: 100,
            new_keys_per_interval: None,
        },
    ]
}

// ----------------------------------------------------------------------------
// 5.6 Sampler Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplerConfig {
    /// Feedback control period
    #[serde(with = "humantime_serde", default = "default_control_period")]
    pub control_period: Duration,

    /// Target kept records per second for classes without an override
    #[serde(default = "default_target_rate")]
    pub default_target_rate: f64,

    /// Per signal class (database id) target rates
    #[serde(default)]
    pub target_rates: HashMap<String, f64>,

    #[serde(default = "default_initial_probability")]
    pub initial_probability: f64,

    #[serde(default = "default_min_floor")]
    pub min_floor: f64,

    #[serde(default = "default_ceiling")]
    pub ceiling: f64,

    /// EWMA smoothing factor for the measured rate
    #[serde(default = "default_ewma_alpha")]
    pub ewma_alpha: f64,

    /// Relative band around the target where the probability is left alone
    #[serde(default = "default_deadband")]
    pub deadband: f64,

    #[serde(default = "default_increase_factor")]
    pub increase_factor: f64,

    #[serde(default = "default_decrease_factor")]
    pub decrease_factor: f64,

    /// Immediate multiplicative step on each rate-limited signal
    #[serde(default = "default_rate_limit_backoff")]
    pub rate_limit_backoff: f64,

    /// Records at least this slow are always kept
    #[serde(default = "default_always_keep_slow_ms")]
    pub always_keep_slow_ms: Option<f64>,

    /// Seed of the coherent-sampling hash
    #[serde(default)]
    pub seed: u64,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            control_period: default_control_period(),
            default_target_rate: default_target_rate(),
            target_rates: HashMap::new(),
            initial_probability: default_initial_probability(),
            min_floor: default_min_floor(),
            ceiling: default_ceiling(),
            ewma_alpha: default_ewma_alpha(),
            deadband: default_deadband(),
            increase_factor: default_increase_factor(),
            decrease_factor: default_decrease_factor(),
            rate_limit_backoff: default_rate_limit_backoff(),
            always_keep_slow_ms: default_always_keep_slow_ms(),
            seed: 0,
        }
    }
}

impl SamplerConfig {
    /// Target rate for a signal class
    pub fn target_rate(&self, class: &str) -> f64 {
        self.target_rates.get(class).copied().unwrap_or(self.default_target_rate)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        require_nonzero_duration("sampler.control_period", self.control_period)?;
        if !(self.min_floor > 0.0 && self.min_floor <= 1.0) {
            return Err(ConfigError::invalid_value("sampler.min_floor", "must be in (0, 1]"));
        }
        if !(self.ceiling > 0.0 && self.ceiling <= 1.0) {
            return Err(ConfigError::invalid_value("sampler.ceiling", "must be in (0, 1]"));
        }
        if self.min_floor > self.ceiling {
            return Err(ConfigError::invalid_value("sampler.min_floor", "must not exceed sampler.ceiling"));
        }
        if !(self.ewma_alpha > 0.0 && self.ewma_alpha <= 1.0) {
            return Err(ConfigError::invalid_value("sampler.ewma_alpha", "must be in (0, 1]"));
        }
        if !(0.0..1.0).contains(&self.deadband) {
            return Err(ConfigError::invalid_value("sampler.deadband", "must be in [0, 1)"));
        }
        if self.increase_factor < 1.0 {
            return Err(ConfigError::invalid_value("sampler.increase_factor", "must be >= 1"));
        }
        for (field, factor) in [
            ("sampler.decrease_factor", self.decrease_factor),
            ("sampler.rate_limit_backoff", self.rate_limit_backoff),
        ] {
            if !(factor > 0.0 && factor < 1.0) {
                return Err(ConfigError::invalid_value(field, "must be in (0, 1)"));
            }
        }
        let rates = std::iter::once(("default", self.default_target_rate))
            .chain(self.target_rates.iter().map(|(k, v)| (k.as_str(), *v)));
        for (class, rate) in rates {
            if !(rate > 0.0 && rate.is_finite()) {
                return Err(ConfigError::invalid_value(
                    format!("sampler.target_rates.{}", class),
                    "must be a positive number",
                ));
            }
        }
        Ok(())
    }
}

fn default_control_period() -> Duration {
    Duration::from_secs(30)
}

fn default_target_rate() -> f64 {
    100.0
}

fn default_initial_probability() -> f64 {
    1.0
}

fn default_min_floor() -> f64 {
    0.01
}

fn default_ceiling() -> f64 {
    1.0
}

fn default_ewma_alpha() -> f64 {
    0.3
}

fn default_deadband() -> f64 {
    0.1
}

fn default_increase_factor() -> f64 {
    1.25
}

fn default_decrease_factor() -> f64 {
    0.8
}

fn default_rate_limit_backoff() -> f64 {
    0.5
}

fn default_always_keep_slow_ms() -> Option<f64> {
    Some(1000.0)
}

// ----------------------------------------------------------------------------
// 5.7 Circuit Breaker Configuration
// ----------------------------------------------------------------------------

/// What happens to records bound for an open target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpenPolicy {
    Buffer,
    Drop,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures that open the circuit
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Failures older than this do not count towards the threshold
    #[serde(with = "humantime_serde", default = "default_failure_window")]
    pub failure_window: Duration,

    /// Open duration before a half-open trial
    #[serde(with = "humantime_serde", default = "default_cooldown")]
    pub cooldown: Duration,

    /// Trial batches allowed while half-open
    #[serde(default = "default_trial_budget")]
    pub trial_budget: u32,

    /// Trial successes needed to close again
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,

    #[serde(default = "default_open_policy")]
    pub open_policy: OpenPolicy,

    /// Per-target buffer bound under the `buffer` policy
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            failure_window: default_failure_window(),
            cooldown: default_cooldown(),
            trial_budget: default_trial_budget(),
            success_threshold: default_success_threshold(),
            open_policy: default_open_policy(),
            buffer_capacity: default_buffer_capacity(),
        }
    }
}

impl BreakerConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.failure_threshold == 0 {
            return Err(ConfigError::invalid_value("breaker.failure_threshold", "must be greater than zero"));
        }
        if self.trial_budget == 0 {
            return Err(ConfigError::invalid_value("breaker.trial_budget", "must be greater than zero"));
        }
        if self.success_threshold == 0 || self.success_threshold > self.trial_budget {
            return Err(ConfigError::invalid_value(
                "breaker.success_threshold",
                "must be in [1, breaker.trial_budget]",
            ));
        }
        require_nonzero_duration("breaker.failure_window", self.failure_window)?;
        require_nonzero_duration("breaker.cooldown", self.cooldown)?;
        if self.open_policy == OpenPolicy::Buffer {
            require_nonzero("breaker.buffer_capacity", self.buffer_capacity)?;
        }
        Ok(())
    }
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_failure_window() -> Duration {
    Duration::from_secs(60)
}

fn default_cooldown() -> Duration {
    Duration::from_secs(30)
}

fn default_trial_budget() -> u32 {
    3
}

fn default_success_threshold() -> u32 {
    3
}

fn default_open_policy() -> OpenPolicy {
    OpenPolicy::Buffer
}

fn default_buffer_capacity() -> usize {
    10_000
}

// ----------------------------------------------------------------------------
// 5.8 Verifier Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifierConfig {
    #[serde(default)]
    pub required_attributes: Vec<String>,

    #[serde(default)]
    pub required_measurements: Vec<String>,

    /// Measurements that must be >= 0 (any name containing "duration" always is)
    #[serde(default = "default_non_negative")]
    pub non_negative: Vec<String>,

    #[serde(default = "default_max_attributes")]
    pub max_attributes: usize,

    #[serde(default = "default_max_attribute_len")]
    pub max_attribute_len: usize,

    /// Window ids remembered for the duplicate check
    #[serde(default = "default_duplicate_memory")]
    pub duplicate_memory: usize,

    /// Every Nth quarantined record goes to the diagnostic sink
    #[serde(default = "default_diagnostic_every")]
    pub diagnostic_every: u64,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            required_attributes: Vec::new(),
            required_measurements: Vec::new(),
            non_negative: default_non_negative(),
            max_attributes: default_max_attributes(),
            max_attribute_len: default_max_attribute_len(),
            duplicate_memory: default_duplicate_memory(),
            diagnostic_every: default_diagnostic_every(),
        }
    }
}

impl VerifierConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        require_nonzero("verifier.max_attributes", self.max_attributes)?;
        require_nonzero("verifier.max_attribute_len", self.max_attribute_len)?;
        require_nonzero("verifier.duplicate_memory", self.duplicate_memory)?;
        if self.diagnostic_every == 0 {
            return Err(ConfigError::invalid_value("verifier.diagnostic_every", "must be greater than zero"));
        }
        Ok(())
    }
}

fn default_non_negative() -> Vec<String> {
    vec!["duration_ms".into(), "calls".into(), "rows".into()]
}

fn default_max_attributes() -> usize {
    128
}

fn default_max_attribute_len() -> usize {
    4096
}

fn default_duplicate_memory() -> usize {
    65_536
}

fn default_diagnostic_every() -> u64 {
    100
}

// ----------------------------------------------------------------------------
// 5.9 Export Feedback Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackConfig {
    /// Capacity of each subscriber's signal queue
    #[serde(default = "default_signal_capacity")]
    pub signal_capacity: usize,

    /// Case-insensitive substrings that mark a failure as rate limiting
    #[serde(default = "default_rate_limit_patterns")]
    pub rate_limit_patterns: Vec<String>,

    #[serde(default = "default_cardinality_patterns")]
    pub cardinality_patterns: Vec<String>,

    #[serde(default = "default_auth_patterns")]
    pub auth_patterns: Vec<String>,

    #[serde(default = "default_timeout_patterns")]
    pub timeout_patterns: Vec<String>,

    #[serde(default = "default_transport_patterns")]
    pub transport_patterns: Vec<String>,

    /// Failures of one cause before an alert is logged
    #[serde(default = "default_alert_threshold")]
    pub alert_threshold: u64,
}

impl Default for FeedbackConfig {
    fn default() -> Self {
        Self {
            signal_capacity: default_signal_capacity(),
            rate_limit_patterns: default_rate_limit_patterns(),
            cardinality_patterns: default_cardinality_patterns(),
            auth_patterns: default_auth_patterns(),
            timeout_patterns: default_timeout_patterns(),
            transport_patterns: default_transport_patterns(),
            alert_threshold: default_alert_threshold(),
        }
    }
}

impl FeedbackConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        require_nonzero("feedback.signal_capacity", self.signal_capacity)?;
        if self.alert_threshold == 0 {
            return Err(ConfigError::invalid_value("feedback.alert_threshold", "must be greater than zero"));
        }
        Ok(())
    }
}

fn default_signal_capacity() -> usize {
    64
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn default_rate_limit_patterns() -> Vec<String> {
    strings(&["rate limit", "quota exceeded", "429", "too many requests"])
}

fn default_cardinality_patterns() -> Vec<String> {
    strings(&["cardinality", "unique time series", "too many series"])
}

fn default_auth_patterns() -> Vec<String> {
    strings(&["unauthorized", "forbidden", "401", "403", "invalid license", "api key"])
}

fn default_timeout_patterns() -> Vec<String> {
    strings(&["timeout", "timed out", "deadline exceeded"])
}

fn default_transport_patterns() -> Vec<String> {
    strings(&["connection refused", "connection reset", "broken pipe", "dns", "unreachable"])
}

fn default_alert_threshold() -> u64 {
    10
}

// ----------------------------------------------------------------------------
// 5.10 Logging Configuration
// ----------------------------------------------------------------------------

/// Logging output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Compact,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (overridden by RUST_LOG)
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default = "default_log_format")]
    pub format: LogFormat,

    /// Enable ANSI colors
    #[serde(default = "default_true")]
    pub colors: bool,

    /// Include source location
    #[serde(default)]
    pub source_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            colors: true,
            source_location: false,
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> LogFormat {
    LogFormat::Compact
}

// ============================================================================
// TESTS
// ============================================================================
