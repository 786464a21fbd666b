use std::sync::{Arc, Mutex};

use log::{debug, info, warn};
use serde::Serialize;
use tokio::time::{Duration, Instant};

use crate::models::{CaptureFrame, RawSample, SampleKind};

use super::frame_cache::FrameCache;

#[derive(Debug, Clone)]
pub struct BatcherConfig {
    pub count_threshold: usize,
    pub max_batch_size: usize,
    pub time_threshold: Duration,
    pub processing_timeout: Duration,
}

impl From<&crate::settings::BatcherSettings> for BatcherConfig {
    fn from(settings: &crate::settings::BatcherSettings) -> Self {
        Self {
            count_threshold: settings.count_threshold,
            max_batch_size: settings.max_batch_size,
            time_threshold: Duration::from_secs(settings.time_threshold_secs),
            processing_timeout: Duration::from_secs(settings.processing_timeout_secs),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BatchState {
    Idle,
    ReadyToProcess,
    Processing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum BatchTrigger {
    Overflow,
    Count,
    Time,
    Flush,
}

/// Counters surfaced for ops visibility; cheap to clone.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatcherMetrics {
    pub batches_emitted: u64,
    pub overflow_flushes: u64,
    pub concurrent_trigger_attempts: u64,
    pub cache_misses: u64,
    pub timed_out_batches: u64,
}

/// One batch handed to the extraction stage. Screenshot samples are resolved
/// to their cached payloads; keyboard/mouse samples ride along untouched for
/// the activity hint.
#[derive(Debug)]
pub struct ReadyBatch {
    pub frames: Vec<CaptureFrame>,
    pub input_samples: Vec<RawSample>,
    pub trigger: BatchTrigger,
    /// Identity of the processing slot this batch holds; echo it back to
    /// [`ScreenshotBatcher::complete_batch`]. Overflow batches emitted past an
    /// in-flight one and flush batches never held the slot and carry `None`.
    pub generation: Option<u64>,
}

struct BatcherInner {
    state: BatchState,
    accumulating: Vec<RawSample>,
    processing: Vec<RawSample>,
    first_sample_at: Option<Instant>,
    processing_since: Option<Instant>,
    in_flight: Option<u64>,
    generations: u64,
    metrics: BatcherMetrics,
}

/// Turns the continuous sample stream into discrete batches.
///
/// Dual-buffer design: arrivals always append to the accumulating list; a
/// trigger atomically moves that list into the processing slot and starts a
/// fresh one, so an in-flight batch can never be mutated by later arrivals.
/// The whole state machine sits behind one mutex, which keeps it correct even
/// if capture producers ever run on more than one thread.
pub struct ScreenshotBatcher {
    config: BatcherConfig,
    cache: Arc<FrameCache>,
    inner: Mutex<BatcherInner>,
}

impl ScreenshotBatcher {
    pub fn new(config: BatcherConfig, cache: Arc<FrameCache>) -> Self {
        Self {
            config,
            cache,
            inner: Mutex::new(BatcherInner {
                state: BatchState::Idle,
                accumulating: Vec::new(),
                processing: Vec::new(),
                first_sample_at: None,
                processing_since: None,
                in_flight: None,
                generations: 0,
                metrics: BatcherMetrics::default(),
            }),
        }
    }

    /// The single mutation path for capture arrivals. Appends the sample,
    /// runs the stuck-batch watchdog, then evaluates the triggers in priority
    /// order: overflow, count, time.
    pub fn push_sample(&self, sample: RawSample) -> Option<ReadyBatch> {
        let mut inner = self.inner.lock().expect("batcher lock");

        if inner.first_sample_at.is_none() {
            inner.first_sample_at = Some(Instant::now());
        }
        inner.accumulating.push(sample);

        self.run_watchdog(&mut inner);
        self.evaluate_triggers(&mut inner)
    }

    /// Opportunistic re-check without a new arrival; lets a host ticker fire
    /// the time trigger during input lulls.
    pub fn poll(&self) -> Option<ReadyBatch> {
        let mut inner = self.inner.lock().expect("batcher lock");
        self.run_watchdog(&mut inner);
        self.evaluate_triggers(&mut inner)
    }

    /// Marks a batch finished (success or failure). Only the batch currently
    /// holding the processing slot can return the machine to `Idle`: a
    /// completion for an overflow/flush batch, or one arriving after the
    /// watchdog already discarded its batch, is ignored.
    pub fn complete_batch(&self, generation: Option<u64>) {
        let mut inner = self.inner.lock().expect("batcher lock");

        let Some(generation) = generation else {
            return;
        };
        if inner.in_flight != Some(generation) {
            debug!("ignoring completion for batch {generation}, no longer in flight");
            return;
        }

        inner.processing.clear();
        inner.processing_since = None;
        inner.in_flight = None;
        inner.state = BatchState::Idle;
    }

    /// Drains both buffers into one final batch and resets all state; used on
    /// session termination so no buffered sample is silently lost.
    pub fn flush(&self) -> Option<ReadyBatch> {
        let mut inner = self.inner.lock().expect("batcher lock");

        let mut samples = std::mem::take(&mut inner.processing);
        samples.append(&mut inner.accumulating);
        inner.first_sample_at = None;
        inner.processing_since = None;
        inner.in_flight = None;
        inner.state = BatchState::Idle;

        if samples.is_empty() {
            return None;
        }

        let (frames, input_samples) = self.generate_records(&mut inner, samples);
        if frames.is_empty() && input_samples.is_empty() {
            return None;
        }

        Some(ReadyBatch {
            frames,
            input_samples,
            trigger: BatchTrigger::Flush,
            generation: None,
        })
    }

    pub fn metrics(&self) -> BatcherMetrics {
        self.inner.lock().expect("batcher lock").metrics.clone()
    }

    /// Discards a batch stuck in processing past the hard timeout. Trades
    /// data loss for liveness; the discarded batch is not retried.
    fn run_watchdog(&self, inner: &mut BatcherInner) {
        if inner.state != BatchState::Processing {
            return;
        }
        let Some(since) = inner.processing_since else {
            return;
        };
        if since.elapsed() < self.config.processing_timeout {
            return;
        }

        warn!(
            "batch stuck in processing for {}s, discarding {} samples and resetting to idle",
            since.elapsed().as_secs(),
            inner.processing.len()
        );
        inner.processing.clear();
        inner.processing_since = None;
        inner.in_flight = None;
        inner.state = BatchState::Idle;
        inner.metrics.timed_out_batches += 1;
    }

    fn evaluate_triggers(&self, inner: &mut BatcherInner) -> Option<ReadyBatch> {
        let count = inner.accumulating.len();
        if count == 0 {
            return None;
        }

        // Overflow is last-resort backpressure and fires regardless of state.
        if count >= self.config.max_batch_size {
            warn!("batcher overflow at {count} samples, forcing flush");
            inner.metrics.overflow_flushes += 1;
            return self.emit(inner, BatchTrigger::Overflow);
        }

        let count_due = count >= self.config.count_threshold;
        let time_due = inner
            .first_sample_at
            .map(|at| at.elapsed() >= self.config.time_threshold)
            .unwrap_or(false);

        if !count_due && !time_due {
            return None;
        }

        if inner.state != BatchState::Idle {
            // No queueing: the accumulating buffer keeps growing until the
            // in-flight batch completes or overflows.
            inner.metrics.concurrent_trigger_attempts += 1;
            debug!("trigger while batch in flight, deferring ({count} samples buffered)");
            return None;
        }

        let trigger = if count_due {
            BatchTrigger::Count
        } else {
            BatchTrigger::Time
        };
        self.emit(inner, trigger)
    }

    fn emit(&self, inner: &mut BatcherInner, trigger: BatchTrigger) -> Option<ReadyBatch> {
        let overflow_while_processing =
            trigger == BatchTrigger::Overflow && inner.state == BatchState::Processing;

        let samples = std::mem::take(&mut inner.accumulating);
        inner.first_sample_at = None;

        if !overflow_while_processing {
            inner.state = BatchState::ReadyToProcess;
        }

        let (frames, input_samples) = self.generate_records(inner, samples.clone());
        if frames.is_empty() {
            info!(
                "batch of {} samples produced no usable frames, skipping",
                samples.len()
            );
            if !overflow_while_processing {
                inner.state = BatchState::Idle;
            }
            return None;
        }

        let generation = if overflow_while_processing {
            None
        } else {
            inner.generations += 1;
            inner.processing = samples;
            inner.processing_since = Some(Instant::now());
            inner.in_flight = Some(inner.generations);
            inner.state = BatchState::Processing;
            Some(inner.generations)
        };

        inner.metrics.batches_emitted += 1;
        info!(
            "batch ready ({:?}): {} frames, {} input samples",
            trigger,
            frames.len(),
            input_samples.len()
        );

        Some(ReadyBatch {
            frames,
            input_samples,
            trigger,
            generation,
        })
    }

    /// Resolves screenshot samples against the frame cache. Evicted payloads
    /// are dropped and counted; partial loss is logged, never fatal.
    fn generate_records(
        &self,
        inner: &mut BatcherInner,
        samples: Vec<RawSample>,
    ) -> (Vec<CaptureFrame>, Vec<RawSample>) {
        let mut frames = Vec::new();
        let mut input_samples = Vec::new();

        for sample in samples {
            match &sample.kind {
                SampleKind::Screenshot { phash } => match self.cache.lookup(phash) {
                    Some(png_bytes) => frames.push(CaptureFrame {
                        phash: phash.clone(),
                        timestamp: sample.timestamp,
                        png_bytes,
                    }),
                    None => {
                        inner.metrics.cache_misses += 1;
                        warn!("screenshot {phash} evicted before processing, dropping sample");
                    }
                },
                SampleKind::Keyboard { .. } | SampleKind::Mouse { .. } => {
                    input_samples.push(sample);
                }
            }
        }

        (frames, input_samples)
    }
}
