//! Batched dispatch of samples and rollups to the store
//!
//! Buffers items until a fixed capacity is reached, flushes the whole batch,
//! and repeats; any remainder is flushed at the end. Two contracts hold:
//! a buffered item is never silently dropped, and submission order is
//! preserved within a batch. Retry/backoff policy lives at the store-client
//! boundary, not here.

use crate::store::{MetricStore, StoreError};
use crate::types::{AggregatedMetric, Granularity, MetricSample};

/// Default write batch capacity, matching the store client's batch size.
pub const DEFAULT_BATCH_SIZE: usize = 5000;

/// Progress callback invoked after each flush with the cumulative count.
pub type ProgressFn<'a> = &'a (dyn Fn(usize) + Send + Sync);

/// Incremental batcher for raw samples, used by the controller's streaming
/// extraction pass: push samples as they are extracted, then `finish` to
/// flush the remainder.
pub struct SampleBatcher<'a> {
    store: &'a dyn MetricStore,
    capacity: usize,
    buf: Vec<MetricSample>,
    written: usize,
    progress: Option<ProgressFn<'a>>,
}

impl<'a> SampleBatcher<'a> {
    pub fn new(store: &'a dyn MetricStore, capacity: usize) -> Self {
        Self {
            store,
            capacity: capacity.max(1),
            buf: Vec::new(),
            written: 0,
            progress: None,
        }
    }

    pub fn with_progress(mut self, progress: ProgressFn<'a>) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Buffer one sample, flushing if the buffer has reached capacity.
    pub async fn push(&mut self, sample: MetricSample) -> Result<(), StoreError> {
        self.buf.push(sample);
        if self.buf.len() >= self.capacity {
            self.flush().await?;
        }
        Ok(())
    }

    /// Number of samples flushed to the store so far. Buffered samples do
    /// not count until their flush succeeds.
    pub fn written(&self) -> usize {
        self.written
    }

    /// Flush the remainder and return the total number of samples written.
    pub async fn finish(&mut self) -> Result<usize, StoreError> {
        if !self.buf.is_empty() {
            self.flush().await?;
        }
        Ok(self.written)
    }

    async fn flush(&mut self) -> Result<(), StoreError> {
        let batch = std::mem::take(&mut self.buf);
        let len = batch.len();

        self.store.write_raw(batch).await?;
        self.written += len;

        if let Some(progress) = self.progress {
            progress(self.written);
        }
        Ok(())
    }
}

/// Write a full set of rollups for one granularity in capacity-bounded
/// batches. Returns the number of rollups written.
pub async fn dispatch_aggregates(
    store: &dyn MetricStore,
    granularity: Granularity,
    rollups: Vec<AggregatedMetric>,
    capacity: usize,
    progress: Option<ProgressFn<'_>>,
) -> Result<usize, StoreError> {
    let capacity = capacity.max(1);
    let mut written = 0;
    let mut buf: Vec<AggregatedMetric> = Vec::new();

    for rollup in rollups {
        buf.push(rollup);
        if buf.len() >= capacity {
            let batch = std::mem::take(&mut buf);
            written += batch.len();
            store.write_aggregates(granularity, batch).await?;
            if let Some(progress) = progress {
                progress(written);
            }
        }
    }

    if !buf.is_empty() {
        written += buf.len();
        store.write_aggregates(granularity, buf).await?;
        if let Some(progress) = progress {
            progress(written);
        }
    }

    Ok(written)
}
