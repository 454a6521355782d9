//! Periodic drain of the accumulator into a [`BulkWriter`].

use std::{sync::Arc, time::Duration};

use serde::Deserialize;
use tokio::{sync::Mutex, task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    accumulator::Accumulator,
    sink::{BulkWriter, COLUMNS},
    Error,
};

pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_TABLE: &str = "metrics";

/// What happens to drained rows when the bulk write fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Put the rows back at the head of their buckets for the next tick.
    #[default]
    Requeue,
    /// Drop the rows. `pending` is not decremented and overstates from then on.
    Discard,
}

#[derive(Debug, Clone)]
pub struct FlushConfig {
    pub interval: Duration,
    pub timeout: Duration,
    pub table: String,
    pub on_failure: FailurePolicy,
}
impl Default for FlushConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_FLUSH_INTERVAL,
            timeout: DEFAULT_FLUSH_TIMEOUT,
            table: DEFAULT_TABLE.to_owned(),
            on_failure: FailurePolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Another flush was still running.
    Busy,
    /// Nothing pending; storage was not contacted.
    Skipped,
    /// Pending was stale and the drain came back empty.
    Empty,
    Written(usize),
    Failed { rows: usize, requeued: bool },
}

#[derive(Debug)]
pub struct Flusher<W> {
    accumulator: Arc<Accumulator>,
    writer: W,
    config: FlushConfig,
    gate: Mutex<()>,
}
impl<W: BulkWriter> Flusher<W> {
    pub fn new(accumulator: Arc<Accumulator>, writer: W, config: FlushConfig) -> Self {
        Self {
            accumulator,
            writer,
            config,
            gate: Mutex::new(()),
        }
    }

    pub fn accumulator(&self) -> &Arc<Accumulator> {
        &self.accumulator
    }
    pub fn writer(&self) -> &W {
        &self.writer
    }
    pub fn config(&self) -> &FlushConfig {
        &self.config
    }

    /// Runs one drain and bulk write unless another one is in flight.
    pub async fn flush(&self) -> FlushOutcome {
        let Ok(_gate) = self.gate.try_lock() else {
            debug!("flush already in flight");
            return FlushOutcome::Busy;
        };
        if self.accumulator.pending_count() == 0 {
            return FlushOutcome::Skipped;
        }
        let rows = self.accumulator.drain_all().into_rows();
        if rows.is_empty() {
            return FlushOutcome::Empty;
        }
        let n = rows.len();

        let write = self.writer.copy_from(&self.config.table, &COLUMNS, &rows);
        let result = match tokio::time::timeout(self.config.timeout, write).await {
            Ok(result) => result,
            Err(_) => Err(Error::FlushTimeout(self.config.timeout)),
        };
        match result {
            Ok(accepted) => {
                self.accumulator.adjust_pending(-(n as i64));
                info!(
                    rows = n,
                    accepted,
                    pending = self.accumulator.pending_count(),
                    "flushed metrics"
                );
                FlushOutcome::Written(n)
            }
            Err(e) => {
                let requeued = match self.config.on_failure {
                    FailurePolicy::Requeue => {
                        self.accumulator.requeue(rows);
                        true
                    }
                    FailurePolicy::Discard => false,
                };
                error!(error = %e, rows = n, requeued, "flush failed");
                FlushOutcome::Failed { rows: n, requeued }
            }
        }
    }

    /// Flushes every `interval` until `cancel` fires.
    ///
    /// A flush in progress when `cancel` fires runs to completion. Ticks
    /// missed while a flush was running are dropped.
    pub async fn run(&self, cancel: CancellationToken) {
        let period = self.config.interval;
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.flush().await;
                }
            }
        }
        debug!("flush timer stopped");
    }

    pub fn spawn(self: Arc<Self>) -> FlushHandle {
        let cancel = CancellationToken::new();
        let task = tokio::spawn({
            let cancel = cancel.clone();
            async move { self.run(cancel).await }
        });
        FlushHandle { cancel, task }
    }
}

/// Owner of the running flush task.
#[derive(Debug)]
pub struct FlushHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}
impl FlushHandle {
    /// Stops scheduling ticks and waits for an in-flight flush to finish.
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            warn!(error = %e, "flush task join failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::{sink::MemoryWriter, Result, Sample};

    /// Fails the first `failures` calls, then delegates to a [`MemoryWriter`].
    #[derive(Debug, Default)]
    struct FlakyWriter {
        failures: usize,
        calls: AtomicUsize,
        inner: MemoryWriter,
    }
    impl BulkWriter for FlakyWriter {
        async fn copy_from(&self, table: &str, columns: &[&str], rows: &[Sample]) -> Result<u64> {
            if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
                return Err(Error::transport("connection refused"));
            }
            self.inner.copy_from(table, columns, rows).await
        }
    }

    #[derive(Debug)]
    struct SlowWriter(Duration);
    impl BulkWriter for SlowWriter {
        async fn copy_from(&self, _: &str, _: &[&str], rows: &[Sample]) -> Result<u64> {
            tokio::time::sleep(self.0).await;
            Ok(rows.len() as u64)
        }
    }

    fn flusher<W: BulkWriter>(writer: W, config: FlushConfig) -> Flusher<W> {
        Flusher::new(Arc::new(Accumulator::new()), writer, config)
    }

    #[tokio::test]
    async fn test_skip_when_nothing_pending() {
        let flusher = flusher(MemoryWriter::new(), FlushConfig::default());
        assert_eq!(flusher.flush().await, FlushOutcome::Skipped);
        assert_eq!(flusher.writer().calls(), 0);
    }

    #[tokio::test]
    async fn test_forced_flush_writes_row() {
        let flusher = flusher(MemoryWriter::new(), FlushConfig::default());
        let sample = Sample::new(1_700_000_000_000_000_000, "cpu_usage", 75.5);
        flusher.accumulator().record(sample.clone());
        assert_eq!(flusher.accumulator().pending_count(), 1);

        assert_eq!(flusher.flush().await, FlushOutcome::Written(1));
        let batches = flusher.writer().batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].table, "metrics");
        assert_eq!(batches[0].columns, COLUMNS);
        assert_eq!(batches[0].rows, [sample]);
        assert_eq!(flusher.accumulator().pending_count(), 0);

        assert_eq!(flusher.flush().await, FlushOutcome::Skipped);
        assert_eq!(flusher.writer().calls(), 1);
    }

    #[tokio::test]
    async fn test_stale_pending_is_empty() {
        let flusher = flusher(MemoryWriter::new(), FlushConfig::default());
        flusher.accumulator().adjust_pending(3);
        assert_eq!(flusher.flush().await, FlushOutcome::Empty);
        assert_eq!(flusher.writer().calls(), 0);
    }

    #[tokio::test]
    async fn test_requeue_on_failure() {
        let writer = FlakyWriter {
            failures: 1,
            ..Default::default()
        };
        let flusher = flusher(writer, FlushConfig::default());
        let acc = flusher.accumulator().clone();
        acc.record(Sample::new(1, "a", 1.0));
        acc.record(Sample::new(2, "b", 2.0));

        assert_eq!(
            flusher.flush().await,
            FlushOutcome::Failed {
                rows: 2,
                requeued: true
            }
        );
        assert_eq!(acc.pending_count(), 2);
        assert_eq!(acc.bucket_len("a"), 1);

        acc.record(Sample::new(3, "a", 3.0));
        assert_eq!(flusher.flush().await, FlushOutcome::Written(3));
        let times: Vec<_> = flusher.writer().inner.rows().iter().map(|s| s.time).collect();
        assert_eq!(times, [1, 3, 2]);
        assert_eq!(acc.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_discard_on_failure() {
        let writer = FlakyWriter {
            failures: usize::MAX,
            ..Default::default()
        };
        let config = FlushConfig {
            on_failure: FailurePolicy::Discard,
            ..Default::default()
        };
        let flusher = flusher(writer, config);
        flusher.accumulator().record(Sample::new(1, "a", 1.0));

        assert_eq!(
            flusher.flush().await,
            FlushOutcome::Failed {
                rows: 1,
                requeued: false
            }
        );
        assert_eq!(flusher.accumulator().bucket_len("a"), 0);
        assert_eq!(flusher.accumulator().pending_count(), 1);
        assert_eq!(flusher.flush().await, FlushOutcome::Empty);
    }

    #[tokio::test]
    async fn test_timeout() {
        let config = FlushConfig {
            timeout: Duration::from_millis(20),
            ..Default::default()
        };
        let flusher = flusher(SlowWriter(Duration::from_secs(5)), config);
        flusher.accumulator().record(Sample::new(1, "a", 1.0));
        assert_eq!(
            flusher.flush().await,
            FlushOutcome::Failed {
                rows: 1,
                requeued: true
            }
        );
        assert_eq!(flusher.accumulator().bucket_len("a"), 1);
    }

    #[tokio::test]
    async fn test_overlapping_flush_is_busy() {
        let flusher = flusher(
            SlowWriter(Duration::from_millis(50)),
            FlushConfig::default(),
        );
        flusher.accumulator().record(Sample::new(1, "a", 1.0));
        let (first, second) = tokio::join!(flusher.flush(), flusher.flush());
        assert_eq!(first, FlushOutcome::Written(1));
        assert_eq!(second, FlushOutcome::Busy);
    }

    #[tokio::test]
    async fn test_timer_flushes_until_stopped() {
        let config = FlushConfig {
            interval: Duration::from_millis(20),
            ..Default::default()
        };
        let flusher = Arc::new(flusher(MemoryWriter::new(), config));
        let handle = flusher.clone().spawn();

        flusher.accumulator().record(Sample::new(1, "a", 1.0));
        tokio::time::sleep(Duration::from_millis(150)).await;
        // idle ticks after the first write are skipped
        assert_eq!(flusher.writer().calls(), 1);
        assert_eq!(flusher.writer().rows(), [Sample::new(1, "a", 1.0)]);

        handle.stop().await;
        flusher.accumulator().record(Sample::new(2, "a", 2.0));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(flusher.writer().calls(), 1);
        assert_eq!(flusher.accumulator().pending_count(), 1);
    }
}
