use std::{
    collections::BTreeMap,
    sync::atomic::{AtomicI64, Ordering},
};

use dashmap::DashMap;

use crate::{MetricKey, Sample};

/// Samples received since the last drain, bucketed by metric name.
///
/// Buckets live in a sharded map, so records for different names only
/// contend when they hash to the same shard. A bucket is never removed once
/// created; draining leaves it empty.
#[derive(Debug, Default)]
pub struct Accumulator {
    buckets: DashMap<MetricKey, Vec<Sample>>,
    pending: AtomicI64,
}
impl Accumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, sample: Sample) {
        match self.buckets.get_mut(&sample.name) {
            Some(mut bucket) => bucket.push(sample),
            None => {
                let key = sample.name.clone();
                self.buckets.entry(key).or_default().push(sample);
            }
        }
        self.pending.fetch_add(1, Ordering::Relaxed);
    }

    /// Takes every bucket's samples, leaving the buckets empty.
    ///
    /// Each bucket is swapped out under its shard lock, so a concurrent
    /// [`Self::record`] lands either in the snapshot or in the emptied bucket.
    pub fn drain_all(&self) -> Snapshot {
        let mut buckets = BTreeMap::new();
        for mut bucket in self.buckets.iter_mut() {
            if bucket.is_empty() {
                continue;
            }
            let samples = std::mem::take(bucket.value_mut());
            buckets.insert(bucket.key().clone(), samples);
        }
        Snapshot { buckets }
    }

    /// Puts drained samples back in front of anything recorded since.
    ///
    /// `pending` is left alone: the samples were never subtracted from it.
    pub fn requeue(&self, rows: Vec<Sample>) {
        let mut grouped: BTreeMap<MetricKey, Vec<Sample>> = BTreeMap::new();
        for sample in rows {
            grouped.entry(sample.name.clone()).or_default().push(sample);
        }
        for (name, mut samples) in grouped {
            let mut bucket = self.buckets.entry(name).or_default();
            samples.append(&mut *bucket);
            *bucket = samples;
        }
    }

    /// Approximate; only meant for logging and skipping idle flushes.
    pub fn pending_count(&self) -> i64 {
        self.pending.load(Ordering::Relaxed)
    }
    pub fn adjust_pending(&self, delta: i64) {
        self.pending.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn bucket_len(&self, name: impl AsRef<[u8]>) -> usize {
        self.buckets
            .get(name.as_ref())
            .map_or(0, |bucket| bucket.len())
    }
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }
}

/// Result of [`Accumulator::drain_all`]. Holds only non-empty buckets.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    buckets: BTreeMap<MetricKey, Vec<Sample>>,
}
impl Snapshot {
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
    /// Number of samples across all buckets.
    pub fn len(&self) -> usize {
        self.buckets.values().map(Vec::len).sum()
    }
    pub fn get(&self, name: impl AsRef<[u8]>) -> Option<&[Sample]> {
        self.buckets.get(name.as_ref()).map(Vec::as_slice)
    }
    pub fn buckets(&self) -> &BTreeMap<MetricKey, Vec<Sample>> {
        &self.buckets
    }

    /// Flattens into rows ordered by name, then by arrival.
    pub fn into_rows(self) -> Vec<Sample> {
        let mut rows = Vec::with_capacity(self.len());
        for (_, samples) in self.buckets {
            rows.extend(samples);
        }
        rows
    }
}
