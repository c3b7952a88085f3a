// ============================================================================
// SECTION 16: ENGINE
// ============================================================================
// Wires the stages together:
//
//   handle ─▶ correlator ─▶ plan ─▶ cost ─▶ sampler ─▶ verifier ─▶ export
//              (sweep timer)                 (control timer,     (breaker,
//                                             feedback queue)     feedback queue)
//
// Each stage is one tokio task owning its component. Shutdown cancels the
// handles, the correlator drains its queue and flushes every window, then
// each stage drains its input and closes its output in turn. The drain is
// bounded by `drain_deadline`; past it every stage stops and counts what it
// still held as lost.
// ============================================================================

use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use flume::Receiver as FlumeReceiver;
use tokio::task::JoinSet;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::breaker::BreakerSnapshot;
use crate::channel::{stage_channel, StageReceiver, StageSender};
use crate::config::EngineConfig;
use crate::correlator::{QueryCorrelator, SweepOutput};
use crate::cost::{AdmissionDecision, CostControlGate};
use crate::error::{CorrelationError, PipelineError, PipelineResult};
use crate::export::{ExportDispatcher, Exporter};
use crate::feedback::ExportFeedbackMonitor;
use crate::metrics::{MetricsSnapshot, PipelineMetrics};
use crate::plan::PlanAttributeExtractor;
use crate::sampler::{AdaptiveSampler, SamplerSnapshot};
use crate::types::{EntityKey, FeedbackSignal, QueryExecutionRecord, TelemetryRecord, Timestamp};
use crate::verifier::{QuarantinedRecord, Verifier};

/// Quarantined samples kept for a diagnostic reader
const DIAGNOSTIC_CAPACITY: usize = 64;

/// Extra time stages get to notice a hard stop before they are aborted
const HARD_STOP_GRACE: Duration = Duration::from_secs(1);

/// Budget utilization gauges are refreshed every this many cost decisions
const BUDGET_GAUGE_EVERY: u64 = 128;

// ----------------------------------------------------------------------------
// 16.1 Handle
// ----------------------------------------------------------------------------

#[derive(Debug)]
enum Ingest {
    Record(TelemetryRecord),
    EndSession(String),
}

/// Producer-side access to a running pipeline. Cheap to clone.
#[derive(Debug, Clone)]
pub struct PipelineHandle {
    ingest: StageSender<Ingest>,
    grace: Duration,
    metrics: PipelineMetrics,
    breaker: Arc<ArcSwap<BreakerSnapshot>>,
    sampler: Arc<ArcSwap<SamplerSnapshot>>,
    diagnostics: FlumeReceiver<QuarantinedRecord>,
    shutdown: CancellationToken,
}

impl PipelineHandle {
    /// Hand one telemetry record to the correlator. Waits at most the
    /// backpressure grace for queue space.
    pub async fn admit(&self, record: TelemetryRecord) -> PipelineResult<()> {
        if self.shutdown.is_cancelled() {
            return Err(PipelineError::ShuttingDown);
        }
        if let Err(e) = EntityKey::parse(&record.entity_key) {
            self.metrics.records_unroutable.inc();
            return Err(e.into());
        }
        self.ingest.send_within(Ingest::Record(record), self.grace).await
    }

    /// Close every open window of a session or query without waiting for grace.
    pub async fn end_session(&self, raw_key: &str) -> PipelineResult<()> {
        if self.shutdown.is_cancelled() {
            return Err(PipelineError::ShuttingDown);
        }
        EntityKey::parse(raw_key)?;
        self.ingest
            .send_within(Ingest::EndSession(raw_key.to_string()), self.grace)
            .await
    }

    pub fn metrics(&self) -> &PipelineMetrics {
        &self.metrics
    }

    /// Current breaker state per target
    pub fn breaker_snapshot(&self) -> Arc<BreakerSnapshot> {
        self.breaker.load_full()
    }

    /// Current sampler state per signal class
    pub fn sampler_snapshot(&self) -> Arc<SamplerSnapshot> {
        self.sampler.load_full()
    }

    /// Sampled quarantined records
    pub fn diagnostics(&self) -> FlumeReceiver<QuarantinedRecord> {
        self.diagnostics.clone()
    }

    /// Stop accepting input and start the drain.
    pub fn shutdown(&self) {
        if !self.shutdown.is_cancelled() {
            info!(target: "dbintel::engine", "Shutdown requested");
        }
        self.shutdown.cancel();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

// ----------------------------------------------------------------------------
// 16.2 Engine
// ----------------------------------------------------------------------------

/// Starts pipelines.
#[derive(Debug)]
pub struct Engine;

impl Engine {
    /// Validate the config and spawn every stage on the current runtime.
    pub fn start(config: EngineConfig, exporter: Arc<dyn Exporter>) -> PipelineResult<(PipelineHandle, EngineTask)> {
        config.validate()?;
        let metrics = PipelineMetrics::new()?;
        let capacity = config.pipeline.queue_capacity;

        let (ingest_tx, ingest_rx) = stage_channel::<Ingest>("correlator", capacity);
        let (plan_tx, plan_rx) = stage_channel("plan", capacity);
        let (cost_tx, cost_rx) = stage_channel("cost", capacity);
        let (sampler_tx, sampler_rx) = stage_channel("sampler", capacity);
        let (verifier_tx, verifier_rx) = stage_channel("verifier", capacity);
        let (export_tx, export_rx) = stage_channel("export", capacity);

        let monitor = Arc::new(ExportFeedbackMonitor::new(config.feedback.clone()));
        let sampler_feedback = monitor.subscribe();
        let sampler = AdaptiveSampler::new(config.sampler.clone());
        let sampler_snapshot = sampler.snapshot_handle();
        let dispatcher = ExportDispatcher::new(
            config.pipeline.clone(),
            config.breaker.clone(),
            exporter,
            Arc::clone(&monitor),
            metrics.clone(),
        );
        let breaker_snapshot = dispatcher.breaker_snapshot();
        let (diagnostic_tx, diagnostic_rx) = flume::bounded(DIAGNOSTIC_CAPACITY);

        let shutdown = CancellationToken::new();
        let hard_stop = CancellationToken::new();
        let mut tasks = JoinSet::new();

        tasks.spawn(correlator_stage(
            QueryCorrelator::new(&config.correlator),
            ingest_rx,
            plan_tx,
            config.correlator.sweep_interval,
            metrics.clone(),
            shutdown.clone(),
            hard_stop.clone(),
        ));

        let extractor = PlanAttributeExtractor::new(config.plan.clone());
        let plan_metrics = metrics.clone();
        tasks.spawn(pump(plan_rx, cost_tx, metrics.clone(), hard_stop.clone(), move |mut record| {
            let outcome = extractor.process(&mut record);
            if outcome.unparsed {
                plan_metrics.plans_unparsed.inc();
            }
            if outcome.truncated {
                plan_metrics.plans_truncated.inc();
            }
            Some(record)
        }));

        let mut gate = CostControlGate::new(&config.cost);
        let cost_metrics = metrics.clone();
        let mut decisions = 0u64;
        tasks.spawn(pump(cost_rx, sampler_tx, metrics.clone(), hard_stop.clone(), move |mut record| {
            let decision = gate.admit(&mut record, Timestamp::now());
            decisions += 1;
            cost_metrics.cost_estimate_bytes.set(gate.estimated_cost_bytes() as i64);
            if decisions % BUDGET_GAUGE_EVERY == 1 {
                for dim in gate.snapshot().dimensions {
                    cost_metrics.set_budget_utilization(&dim.name, dim.utilization);
                }
            }
            match decision {
                AdmissionDecision::Admit => {
                    cost_metrics.records_admitted.inc();
                    Some(record)
                }
                AdmissionDecision::Downsample => {
                    cost_metrics.records_downsampled.inc();
                    Some(record)
                }
                AdmissionDecision::Reject => {
                    cost_metrics.records_rejected.inc();
                    None
                }
            }
        }));

        tasks.spawn(sampler_stage(
            sampler,
            sampler_rx,
            verifier_tx,
            sampler_feedback,
            Arc::clone(&monitor),
            config.sampler.control_period,
            metrics.clone(),
            hard_stop.clone(),
        ));

        let mut verifier = Verifier::new(config.verifier.clone()).with_diagnostic_sink(diagnostic_tx);
        let verifier_metrics = metrics.clone();
        tasks.spawn(pump(verifier_rx, export_tx, metrics.clone(), hard_stop.clone(), move |record| {
            match verifier.verify(record) {
                Ok(record) => Some(record),
                Err(violation) => {
                    verifier_metrics.quarantined(violation.reason());
                    None
                }
            }
        }));

        let export_metrics = metrics.clone();
        let export_stop = hard_stop.clone();
        tasks.spawn(async move {
            let stats = dispatcher.run(export_rx, export_stop).await;
            export_metrics.records_lost_on_shutdown.inc_by(stats.records_lost);
        });

        info!(
            target: "dbintel::engine",
            queue_capacity = capacity,
            export_workers = config.pipeline.export_workers,
            bucket_ms = config.correlator.bucket_width.as_millis() as u64,
            dimensions = config.cost.dimensions.len(),
            "Pipeline started"
        );

        let handle = PipelineHandle {
            ingest: ingest_tx,
            grace: config.pipeline.backpressure_grace,
            metrics: metrics.clone(),
            breaker: breaker_snapshot,
            sampler: sampler_snapshot,
            diagnostics: diagnostic_rx,
            shutdown: shutdown.clone(),
        };
        let task = EngineTask {
            tasks,
            shutdown,
            hard_stop,
            drain_deadline: config.pipeline.drain_deadline,
            metrics,
        };
        Ok((handle, task))
    }
}

/// The running stages. `join` returns once the pipeline has shut down.
#[derive(Debug)]
pub struct EngineTask {
    tasks: JoinSet<()>,
    shutdown: CancellationToken,
    hard_stop: CancellationToken,
    drain_deadline: Duration,
    metrics: PipelineMetrics,
}

impl EngineTask {
    /// Wait for shutdown, then for the drain (bounded by the deadline).
    pub async fn join(mut self) -> PipelineResult<MetricsSnapshot> {
        let mut failed = 0;
        tokio::select! {
            _ = self.shutdown.cancelled() => {}
            Some(result) = self.tasks.join_next() => {
                // a stage only ends early when it fails
                failed += stage_failed(result);
                self.shutdown.cancel();
            }
        }

        let started = Instant::now();
        debug!(
            target: "dbintel::engine",
            deadline_ms = self.drain_deadline.as_millis() as u64,
            "Draining pipeline"
        );
        match tokio::time::timeout(self.drain_deadline, join_all(&mut self.tasks)).await {
            Ok(n) => failed += n,
            Err(_) => {
                warn!(target: "dbintel::engine", "Drain deadline passed, stopping stages");
                self.hard_stop.cancel();
                match tokio::time::timeout(HARD_STOP_GRACE, join_all(&mut self.tasks)).await {
                    Ok(n) => failed += n,
                    Err(_) => self.tasks.abort_all(),
                }
            }
        }

        let snapshot = self.metrics.snapshot();
        info!(
            target: "dbintel::engine",
            elapsed_ms = started.elapsed().as_millis() as u64,
            exported = snapshot.get("records_exported_total"),
            lost = snapshot.get("records_lost_on_shutdown_total"),
            "Pipeline stopped"
        );
        if failed > 0 {
            return Err(PipelineError::Internal(format!("{} pipeline stage(s) failed", failed)));
        }
        Ok(snapshot)
    }

    /// Begin the shutdown from the task side.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

async fn join_all(tasks: &mut JoinSet<()>) -> usize {
    let mut failed = 0;
    while let Some(result) = tasks.join_next().await {
        failed += stage_failed(result);
    }
    failed
}

fn stage_failed(result: Result<(), tokio::task::JoinError>) -> usize {
    match result {
        Ok(()) => 0,
        Err(e) if e.is_cancelled() => 0,
        Err(e) => {
            error!(target: "dbintel::engine", error = %e, "Pipeline stage failed");
            1
        }
    }
}

// ----------------------------------------------------------------------------
// 16.3 Stages
// ----------------------------------------------------------------------------

fn ingest(correlator: &mut QueryCorrelator, item: Ingest, metrics: &PipelineMetrics) {
    let now = Timestamp::now();
    match item {
        Ingest::Record(record) => match correlator.admit(record, now) {
            Ok(admitted) => {
                metrics.records_ingested.inc();
                if admitted.forced_close() {
                    metrics.windows_forced.inc();
                }
            }
            Err(CorrelationError::Unroutable { .. }) => metrics.records_unroutable.inc(),
            Err(CorrelationError::TooLate { .. }) => metrics.records_late_dropped.inc(),
        },
        Ingest::EndSession(raw_key) => {
            if correlator.end_session(&raw_key, now).is_err() {
                metrics.records_unroutable.inc();
            }
        }
    }
}

/// Send a sweep's records downstream. False once downstream is gone.
async fn forward(
    out: SweepOutput,
    output: &StageSender<QueryExecutionRecord>,
    metrics: &PipelineMetrics,
) -> bool {
    metrics.windows_emitted.inc_by(out.emitted.len() as u64);
    metrics.windows_partial.inc_by(out.partial);
    metrics.windows_empty.inc_by(out.empty);

    let total = out.emitted.len();
    for (sent, record) in out.emitted.into_iter().enumerate() {
        if output.send(record).await.is_err() {
            metrics.records_lost_on_shutdown.inc_by((total - sent) as u64);
            return false;
        }
    }
    true
}

async fn correlator_stage(
    mut correlator: QueryCorrelator,
    input: StageReceiver<Ingest>,
    output: StageSender<QueryExecutionRecord>,
    sweep_every: Duration,
    metrics: PipelineMetrics,
    shutdown: CancellationToken,
    hard_stop: CancellationToken,
) {
    let mut sweep = interval(sweep_every);
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = hard_stop.cancelled() => {
                let lost = input.drain_ready().len() + correlator.pending_records();
                metrics.records_lost_on_shutdown.inc_by(lost as u64);
                return;
            }
            _ = shutdown.cancelled() => break,
            _ = sweep.tick() => {
                let out = correlator.sweep(Timestamp::now());
                if !forward(out, &output, &metrics).await {
                    return;
                }
            }
            item = input.recv() => match item {
                Some(item) => ingest(&mut correlator, item, &metrics),
                None => break,
            },
        }
        metrics.set_queue_depth(input.name(), input.len());
    }

    for item in input.drain_ready() {
        ingest(&mut correlator, item, &metrics);
    }
    let out = correlator.flush_all(Timestamp::now());
    info!(
        target: "dbintel::correlator",
        flushed = out.emitted.len(),
        "Correlator drained, flushing open windows"
    );
    forward(out, &output, &metrics).await;
}

/// Generic one-in, at-most-one-out stage.
async fn pump<F>(
    input: StageReceiver<QueryExecutionRecord>,
    output: StageSender<QueryExecutionRecord>,
    metrics: PipelineMetrics,
    hard_stop: CancellationToken,
    mut step: F,
) where
    F: FnMut(QueryExecutionRecord) -> Option<QueryExecutionRecord> + Send,
{
    loop {
        let record = tokio::select! {
            biased;
            _ = hard_stop.cancelled() => {
                metrics.records_lost_on_shutdown.inc_by(input.drain_ready().len() as u64);
                break;
            }
            record = input.recv() => match record {
                Some(record) => record,
                None => break,
            },
        };
        metrics.set_queue_depth(input.name(), input.len());
        if let Some(record) = step(record) {
            if output.send(record).await.is_err() {
                metrics.records_lost_on_shutdown.inc();
                break;
            }
        }
    }
    debug!(target: "dbintel::engine", stage = input.name(), "Stage stopped");
}

fn apply_feedback(
    sampler: &mut AdaptiveSampler,
    feedback: &FlumeReceiver<FeedbackSignal>,
    metrics: &PipelineMetrics,
) {
    while let Ok(signal) = feedback.try_recv() {
        sampler.on_feedback(&signal);
        metrics.set_keep_probability(&signal.target, sampler.keep_probability(&signal.target));
    }
}

#[allow(clippy::too_many_arguments)]
async fn sampler_stage(
    mut sampler: AdaptiveSampler,
    input: StageReceiver<QueryExecutionRecord>,
    output: StageSender<QueryExecutionRecord>,
    feedback: FlumeReceiver<FeedbackSignal>,
    monitor: Arc<ExportFeedbackMonitor>,
    control_period: Duration,
    metrics: PipelineMetrics,
    hard_stop: CancellationToken,
) {
    let mut control = interval(control_period);
    control.set_missed_tick_behavior(MissedTickBehavior::Delay);
    control.tick().await;
    let mut last_tick = Instant::now();
    let mut dropped_seen = 0u64;

    loop {
        tokio::select! {
            biased;
            _ = hard_stop.cancelled() => {
                metrics.records_lost_on_shutdown.inc_by(input.drain_ready().len() as u64);
                break;
            }
            Ok(signal) = feedback.recv_async() => {
                sampler.on_feedback(&signal);
                metrics.set_keep_probability(&signal.target, sampler.keep_probability(&signal.target));
            }
            _ = control.tick() => {
                apply_feedback(&mut sampler, &feedback, &metrics);
                sampler.control_tick(last_tick.elapsed());
                last_tick = Instant::now();
                for (class, p) in sampler.probabilities() {
                    metrics.set_keep_probability(&class, p);
                }
                let dropped = monitor.signals_dropped();
                metrics.feedback_signals_dropped.inc_by(dropped.saturating_sub(dropped_seen));
                dropped_seen = dropped.max(dropped_seen);
            }
            record = input.recv() => match record {
                Some(record) => {
                    metrics.set_queue_depth(input.name(), input.len());
                    apply_feedback(&mut sampler, &feedback, &metrics);
                    if !sampler.should_keep(&record) {
                        metrics.records_sampled_out.inc();
                        continue;
                    }
                    if output.send(record).await.is_err() {
                        metrics.records_lost_on_shutdown.inc();
                        break;
                    }
                }
                None => break,
            },
        }
    }
    debug!(target: "dbintel::sampler", "Sampler stage stopped");
}

// ============================================================================
// TESTS
// ============================================================================
