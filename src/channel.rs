// ============================================================================
// SECTION 7: STAGE CHANNELS & BACKPRESSURE
// ============================================================================
// One bounded flume queue per stage boundary:
// - stages block only on an empty input or a full output
// - producers outside the pipeline wait at most a grace period, then get
//   a Backpressure error
// - depth, high-water mark and backpressure events are tracked per queue
// ============================================================================

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use flume::{Receiver as FlumeReceiver, Sender as FlumeSender, TrySendError};
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, PipelineResult};

// ----------------------------------------------------------------------------
// 7.1 Channel Statistics
// ----------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct ChannelStats {
    /// Total items sent
    pub sent: AtomicU64,
    /// Total items received
    pub received: AtomicU64,
    /// Items refused after the backpressure grace expired
    pub refused: AtomicU64,
    /// High water mark (max depth seen)
    pub high_water_mark: AtomicUsize,
    /// Times a producer found the queue full
    pub backpressure_events: AtomicU64,
}

impl ChannelStats {
    pub fn record_send(&self) {
        self.sent.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub fn record_receive(&self) {
        self.received.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub fn record_refused(&self) {
        self.refused.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub fn record_backpressure(&self) {
        self.backpressure_events.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub fn update_depth(&self, depth: usize) {
        let mut hwm = self.high_water_mark.load(AtomicOrdering::Relaxed);
        while depth > hwm {
            match self.high_water_mark.compare_exchange_weak(
                hwm,
                depth,
                AtomicOrdering::Relaxed,
                AtomicOrdering::Relaxed,
            ) {
                Ok(_) => break,
                Err(h) => hwm = h,
            }
        }
    }

    pub fn snapshot(&self, depth: usize) -> ChannelStatsSnapshot {
        ChannelStatsSnapshot {
            sent: self.sent.load(AtomicOrdering::Relaxed),
            received: self.received.load(AtomicOrdering::Relaxed),
            refused: self.refused.load(AtomicOrdering::Relaxed),
            depth,
            high_water_mark: self.high_water_mark.load(AtomicOrdering::Relaxed),
            backpressure_events: self.backpressure_events.load(AtomicOrdering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelStatsSnapshot {
    pub sent: u64,
    pub received: u64,
    pub refused: u64,
    pub depth: usize,
    pub high_water_mark: usize,
    pub backpressure_events: u64,
}

// ----------------------------------------------------------------------------
// 7.2 Stage Channel
// ----------------------------------------------------------------------------

/// Create a bounded queue feeding the stage called `name`.
pub fn stage_channel<T>(name: &'static str, capacity: usize) -> (StageSender<T>, StageReceiver<T>) {
    let (tx, rx) = flume::bounded(capacity.max(1));
    let stats = Arc::new(ChannelStats::default());
    (
        StageSender {
            name,
            inner: tx,
            stats: Arc::clone(&stats),
        },
        StageReceiver { name, inner: rx, stats },
    )
}

/// Producing end of a stage queue.
#[derive(Debug)]
pub struct StageSender<T> {
    name: &'static str,
    inner: FlumeSender<T>,
    stats: Arc<ChannelStats>,
}

impl<T> Clone for StageSender<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            inner: self.inner.clone(),
            stats: Arc::clone(&self.stats),
        }
    }
}

impl<T> StageSender<T> {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn stats(&self) -> ChannelStatsSnapshot {
        self.stats.snapshot(self.inner.len())
    }

    /// Send, waiting for space as long as it takes. Used between stages.
    pub async fn send(&self, item: T) -> PipelineResult<()> {
        let item = match self.inner.try_send(item) {
            Ok(()) => {
                self.after_send();
                return Ok(());
            }
            Err(TrySendError::Disconnected(_)) => return Err(PipelineError::ShuttingDown),
            Err(TrySendError::Full(item)) => item,
        };
        self.stats.record_backpressure();
        self.inner
            .send_async(item)
            .await
            .map_err(|_| PipelineError::ShuttingDown)?;
        self.after_send();
        Ok(())
    }

    /// Send, waiting at most `grace` for space. Past the grace the item is
    /// dropped and the caller sees `Backpressure`.
    pub async fn send_within(&self, item: T, grace: Duration) -> PipelineResult<()> {
        let item = match self.inner.try_send(item) {
            Ok(()) => {
                self.after_send();
                return Ok(());
            }
            Err(TrySendError::Disconnected(_)) => return Err(PipelineError::ShuttingDown),
            Err(TrySendError::Full(item)) => item,
        };
        self.stats.record_backpressure();
        match tokio::time::timeout(grace, self.inner.send_async(item)).await {
            Ok(Ok(())) => {
                self.after_send();
                Ok(())
            }
            Ok(Err(_)) => Err(PipelineError::ShuttingDown),
            Err(_) => {
                self.stats.record_refused();
                Err(PipelineError::Backpressure {
                    stage: self.name,
                    waited_ms: grace.as_millis() as u64,
                })
            }
        }
    }

    fn after_send(&self) {
        self.stats.record_send();
        self.stats.update_depth(self.inner.len());
    }
}

/// Consuming end of a stage queue.
#[derive(Debug)]
pub struct StageReceiver<T> {
    name: &'static str,
    inner: FlumeReceiver<T>,
    stats: Arc<ChannelStats>,
}

impl<T> StageReceiver<T> {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Next item, or `None` once every sender is gone and the queue is empty.
    pub async fn recv(&self) -> Option<T> {
        let item = self.inner.recv_async().await.ok()?;
        self.stats.record_receive();
        Some(item)
    }

    pub fn try_recv(&self) -> Option<T> {
        let item = self.inner.try_recv().ok()?;
        self.stats.record_receive();
        Some(item)
    }

    /// Everything queued right now, without waiting
    pub fn drain_ready(&self) -> Vec<T> {
        let items: Vec<T> = self.inner.drain().collect();
        self.stats
            .received
            .fetch_add(items.len() as u64, AtomicOrdering::Relaxed);
        items
    }
}
