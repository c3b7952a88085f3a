// ============================================================================
// SECTION 15: EXPORT
// ============================================================================
// The export hop. Verified records are grouped per target into batches and
// handed to a bounded worker pool. The dispatcher owns the circuit breaker
// and the per-target buffers:
// - at most one batch per target is in flight, so per-key order holds
// - a failed batch goes back to the front of its target and is retried while
//   the breaker admits, up to `max_retries`
// - each target's backlog is bounded by `buffer_capacity`, oldest dropped
// - while a target is open its records are buffered or dropped, per
//   `open_policy`
// Workers report each outcome to the feedback monitor and hand the classified
// signal back with the completion; the breaker is fed from completions, so it
// sees every outcome. The monitor's subscriber queues serve the sampler.
// ============================================================================

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use ahash::AHashMap;
use async_trait::async_trait;
use flume::{Receiver as FlumeReceiver, Sender as FlumeSender};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex as TokioMutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::breaker::{Acquire, BreakerSnapshot, CircuitBreaker};
use crate::channel::StageReceiver;
use crate::config::{BreakerConfig, OpenPolicy, PipelineConfig};
use crate::feedback::ExportFeedbackMonitor;
use crate::metrics::PipelineMetrics;
use crate::types::{ExportOutcome, FeedbackSignal, OutcomeKind, QueryExecutionRecord, TargetId, Timestamp};

// ----------------------------------------------------------------------------
// 15.1 Exporter Seam
// ----------------------------------------------------------------------------

/// One batch of records bound for one target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportBatch {
    pub id: Uuid,
    pub target: TargetId,
    pub records: Vec<QueryExecutionRecord>,
    /// 0 on the first try
    pub attempt: u32,
}

impl ExportBatch {
    pub fn new(target: TargetId, records: Vec<QueryExecutionRecord>) -> Self {
        Self {
            id: Uuid::now_v7(),
            target,
            records,
            attempt: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Downstream collaborator. Reports every attempt as an outcome; never panics
/// on backend errors.
#[async_trait]
pub trait Exporter: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    async fn export(&self, batch: &ExportBatch) -> ExportOutcome;
}

/// Writes each record as one JSON line.
pub struct JsonLinesExporter<W> {
    writer: TokioMutex<W>,
    lines: AtomicU64,
}

impl JsonLinesExporter<tokio::io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(tokio::io::stdout())
    }
}

impl<W> JsonLinesExporter<W>
where
    W: AsyncWrite + Send + Unpin,
{
    pub fn new(writer: W) -> Self {
        Self {
            writer: TokioMutex::new(writer),
            lines: AtomicU64::new(0),
        }
    }

    pub fn lines_written(&self) -> u64 {
        self.lines.load(AtomicOrdering::Relaxed)
    }

    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }

    async fn write_batch(&self, batch: &ExportBatch) -> std::io::Result<()> {
        let mut buffer = Vec::with_capacity(batch.len() * 256);
        for record in &batch.records {
            serde_json::to_writer(&mut buffer, record)?;
            buffer.push(b'\n');
        }
        let mut writer = self.writer.lock().await;
        writer.write_all(&buffer).await?;
        writer.flush().await
    }
}

impl<W> fmt::Debug for JsonLinesExporter<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JsonLinesExporter")
            .field("lines", &self.lines.load(AtomicOrdering::Relaxed))
            .finish()
    }
}

#[async_trait]
impl<W> Exporter for JsonLinesExporter<W>
where
    W: AsyncWrite + Send + Unpin,
{
    fn name(&self) -> &str {
        "jsonl"
    }

    async fn export(&self, batch: &ExportBatch) -> ExportOutcome {
        match self.write_batch(batch).await {
            Ok(()) => {
                self.lines.fetch_add(batch.len() as u64, AtomicOrdering::Relaxed);
                ExportOutcome::success(batch.target.clone(), batch.len())
            }
            Err(e) => ExportOutcome::failure(batch.target.clone(), e.to_string()),
        }
    }
}

/// Accepts everything. Used for dry runs.
#[derive(Debug, Default)]
pub struct NullExporter {
    records: AtomicU64,
}

impl NullExporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records_seen(&self) -> u64 {
        self.records.load(AtomicOrdering::Relaxed)
    }
}

#[async_trait]
impl Exporter for NullExporter {
    fn name(&self) -> &str {
        "null"
    }

    async fn export(&self, batch: &ExportBatch) -> ExportOutcome {
        self.records.fetch_add(batch.len() as u64, AtomicOrdering::Relaxed);
        ExportOutcome::success(batch.target.clone(), batch.len())
    }
}

// ----------------------------------------------------------------------------
// 15.2 Per-Target Queue
// ----------------------------------------------------------------------------

#[derive(Debug, Default)]
struct TargetQueue {
    pending: VecDeque<QueryExecutionRecord>,
    /// Failed batch waiting to go again, ahead of `pending`
    retry: Option<ExportBatch>,
    /// Records of the batch currently with a worker
    in_flight: Option<usize>,
    oldest_pending: Option<Timestamp>,
}

impl TargetQueue {
    fn queued(&self) -> usize {
        self.pending.len() + self.retry.as_ref().map(ExportBatch::len).unwrap_or(0)
    }

    fn is_idle(&self) -> bool {
        self.queued() == 0 && self.in_flight.is_none()
    }
}

#[derive(Debug)]
struct Completion {
    batch: ExportBatch,
    outcome: ExportOutcome,
    signal: FeedbackSignal,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatcherStats {
    pub batches_sent: u64,
    pub records_exported: u64,
    pub records_dropped: u64,
    pub retries: u64,
    pub short_circuits: u64,
    /// Records still queued, buffered or in flight when a hard stop hit
    pub records_lost: u64,
}

// ----------------------------------------------------------------------------
// 15.3 Dispatcher
// ----------------------------------------------------------------------------

pub struct ExportDispatcher {
    pipeline: PipelineConfig,
    open_policy: OpenPolicy,
    buffer_capacity: usize,
    breaker: CircuitBreaker,
    exporter: Arc<dyn Exporter>,
    monitor: Arc<ExportFeedbackMonitor>,
    metrics: PipelineMetrics,
    targets: AHashMap<TargetId, TargetQueue>,
    workers: Arc<Semaphore>,
    done_tx: FlumeSender<Completion>,
    done_rx: FlumeReceiver<Completion>,
    stats: DispatcherStats,
}

impl fmt::Debug for ExportDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExportDispatcher")
            .field("exporter", &self.exporter.name())
            .field("targets", &self.targets.len())
            .field("stats", &self.stats)
            .finish()
    }
}

impl ExportDispatcher {
    pub fn new(
        pipeline: PipelineConfig,
        breaker: BreakerConfig,
        exporter: Arc<dyn Exporter>,
        monitor: Arc<ExportFeedbackMonitor>,
        metrics: PipelineMetrics,
    ) -> Self {
        let (done_tx, done_rx) = flume::unbounded();
        let workers = Arc::new(Semaphore::new(pipeline.export_workers.max(1)));
        Self {
            open_policy: breaker.open_policy,
            buffer_capacity: breaker.buffer_capacity,
            breaker: CircuitBreaker::new(breaker),
            pipeline,
            exporter,
            monitor,
            metrics,
            targets: AHashMap::new(),
            workers,
            done_tx,
            done_rx,
            stats: DispatcherStats::default(),
        }
    }

    pub fn breaker_snapshot(&self) -> Arc<arc_swap::ArcSwap<BreakerSnapshot>> {
        self.breaker.snapshot_handle()
    }

    /// Records queued, buffered or in flight
    pub fn outstanding(&self) -> usize {
        self.targets
            .values()
            .map(|q| q.queued() + q.in_flight.unwrap_or(0))
            .sum()
    }

    /// Run until the input closes and everything is exported, or until
    /// `hard_stop` fires (whatever is left is counted as lost).
    pub async fn run(
        mut self,
        input: StageReceiver<QueryExecutionRecord>,
        hard_stop: CancellationToken,
    ) -> DispatcherStats {
        let done_rx = self.done_rx.clone();
        let mut tick = interval(self.pipeline.flush_interval.min(Duration::from_millis(250)));
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut input_open = true;

        loop {
            tokio::select! {
                record = input.recv(), if input_open => match record {
                    Some(record) => self.enqueue(record),
                    None => {
                        input_open = false;
                        debug!(target: "dbintel::export", outstanding = self.outstanding(), "Export input closed, draining");
                    }
                },
                Ok(done) = done_rx.recv_async() => self.complete(done),
                _ = tick.tick() => {}
                _ = hard_stop.cancelled() => {
                    let lost = self.outstanding() as u64;
                    self.stats.records_lost += lost;
                    if lost > 0 {
                        warn!(target: "dbintel::export", lost, "Drain deadline reached, discarding export backlog");
                    }
                    break;
                }
            }
            self.dispatch(!input_open);
            if !input_open && self.targets.values().all(TargetQueue::is_idle) {
                break;
            }
        }

        info!(
            target: "dbintel::export",
            batches = self.stats.batches_sent,
            exported = self.stats.records_exported,
            dropped = self.stats.records_dropped,
            "Export dispatcher stopped"
        );
        self.stats
    }

    fn enqueue(&mut self, record: QueryExecutionRecord) {
        let now = Timestamp::now();
        let target = TargetId::from(record.target());
        let queue = self.targets.entry(target).or_default();
        if queue.pending.len() >= self.buffer_capacity {
            queue.pending.pop_front();
            self.stats.records_dropped += 1;
            self.metrics.export_dropped("buffer_overflow", 1);
        }
        queue.oldest_pending.get_or_insert(now);
        queue.pending.push_back(record);
    }

    fn complete(&mut self, done: Completion) {
        let Completion { mut batch, outcome, signal } = done;
        self.metrics.export_attempt(outcome.kind.as_str());
        if self.breaker.on_signal(&signal).is_some() {
            self.metrics
                .set_breaker_state(&signal.target, self.breaker.state(&signal.target));
        }
        let queue = self.targets.entry(batch.target.clone()).or_default();
        queue.in_flight = None;

        if outcome.kind == OutcomeKind::Success {
            self.stats.records_exported += batch.len() as u64;
            self.metrics.records_exported.inc_by(batch.len() as u64);
            return;
        }

        if batch.attempt < self.pipeline.max_retries {
            batch.attempt += 1;
            self.stats.retries += 1;
            debug!(
                target: "dbintel::export",
                target_id = %batch.target,
                attempt = batch.attempt,
                detail = outcome.error_detail.as_deref().unwrap_or(""),
                "Export failed, batch requeued"
            );
            queue.retry = Some(batch);
        } else {
            warn!(
                target: "dbintel::export",
                target_id = %batch.target,
                records = batch.len(),
                attempts = batch.attempt + 1,
                "Retries exhausted, batch dropped"
            );
            self.stats.records_dropped += batch.len() as u64;
            self.metrics.export_dropped("retries_exhausted", batch.len());
        }
    }

    /// Start a batch for every idle target that has one ready.
    fn dispatch(&mut self, draining: bool) {
        let now = Timestamp::now();
        let batch_size = self.pipeline.batch_size.max(1);
        let flush_after = self.pipeline.flush_interval;
        let ready: Vec<TargetId> = self
            .targets
            .iter()
            .filter(|(_, q)| q.in_flight.is_none())
            .filter(|(_, q)| {
                q.retry.is_some()
                    || q.pending.len() >= batch_size
                    || (!q.pending.is_empty()
                        && (draining
                            || q.oldest_pending.is_some_and(|t| now.duration_since(t) >= flush_after)))
            })
            .map(|(target, _)| target.clone())
            .collect();

        for target in ready {
            let Ok(permit) = Arc::clone(&self.workers).try_acquire_owned() else {
                break;
            };
            let decision = self.breaker.try_acquire(&target, now);
            self.metrics
                .set_breaker_state(&target, self.breaker.state(&target));
            match decision {
                Acquire::Permit { .. } => self.launch(&target, permit, now, batch_size),
                Acquire::ShortCircuit => {
                    self.stats.short_circuits += 1;
                    if self.open_policy == OpenPolicy::Drop {
                        self.drop_target_backlog(&target);
                    }
                }
            }
        }
    }

    fn drop_target_backlog(&mut self, target: &str) {
        let Some(queue) = self.targets.get_mut(target) else {
            return;
        };
        let dropped = queue.queued();
        queue.pending.clear();
        queue.retry = None;
        queue.oldest_pending = None;
        if dropped > 0 {
            self.stats.records_dropped += dropped as u64;
            self.metrics.export_dropped("circuit_open", dropped);
            debug!(target: "dbintel::export", target_id = target, dropped, "Circuit open, records dropped");
        }
    }

    fn launch(&mut self, target: &str, permit: OwnedSemaphorePermit, now: Timestamp, batch_size: usize) {
        let Some(queue) = self.targets.get_mut(target) else {
            return;
        };
        let batch = match queue.retry.take() {
            Some(batch) => batch,
            None => {
                let take = queue.pending.len().min(batch_size);
                let records: Vec<QueryExecutionRecord> = queue.pending.drain(..take).collect();
                queue.oldest_pending = if queue.pending.is_empty() { None } else { Some(now) };
                ExportBatch::new(TargetId::from(target), records)
            }
        };
        queue.in_flight = Some(batch.len());
        self.stats.batches_sent += 1;

        let exporter = Arc::clone(&self.exporter);
        let monitor = Arc::clone(&self.monitor);
        let done = self.done_tx.clone();
        let timeout = self.pipeline.export_timeout;
        tokio::spawn(async move {
            let outcome = export_once(exporter.as_ref(), &batch, timeout).await;
            drop(permit);
            let signal = monitor.observe(&outcome, Timestamp::now());
            let _ = done.send(Completion { batch, outcome, signal });
        });
    }

    pub fn stats(&self) -> &DispatcherStats {
        &self.stats
    }
}

/// One bounded export call. A timeout is reported as a failure.
pub async fn export_once(exporter: &dyn Exporter, batch: &ExportBatch, timeout: Duration) -> ExportOutcome {
    match tokio::time::timeout(timeout, exporter.export(batch)).await {
        Ok(outcome) => outcome,
        Err(_) => ExportOutcome::failure(
            batch.target.clone(),
            format!("export timed out after {}ms", timeout.as_millis()),
        ),
    }
}

// ============================================================================
// TESTS
// ============================================================================
