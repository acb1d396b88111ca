//! # Stream Buffer
//!
//! Per-session sliding-window accumulator of decoded float samples. Incoming
//! chunks are appended to a fixed-capacity ring (oldest samples evicted once
//! capacity is exceeded) and a processing window is emitted whenever enough
//! time has passed AND enough audio has accumulated.
//!
//! ## Windowing Policy:
//! Extraction does NOT remove samples from the ring: consecutive windows
//! deliberately share leading samples for continuity, and eviction only
//! happens through capacity overflow. Callers must not assume extraction
//! shrinks the buffer.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Configuration for stream buffer behavior.
#[derive(Debug, Clone)]
pub struct StreamBufferConfig {
    /// Audio sample rate in Hz
    pub sample_rate: u32,

    /// Duration of each processing window in seconds
    pub chunk_duration: f64,

    /// Overlap between consecutive windows in seconds; the processing
    /// interval is `chunk_duration - overlap_duration`
    pub overlap_duration: f64,

    /// Minimum buffered audio duration before a window may be emitted
    pub min_duration: f64,

    /// Ring capacity in seconds of audio
    pub max_buffer_seconds: f64,
}

impl Default for StreamBufferConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            chunk_duration: 1.0,
            overlap_duration: 0.5,
            min_duration: 0.5,
            max_buffer_seconds: 10.0,
        }
    }
}

/// Snapshot of buffer counters, merged into `stats` replies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BufferStats {
    pub buffer_size: usize,
    pub buffer_duration: f64,
    pub total_chunks_received: u64,
    pub total_chunks_processed: u64,
}

/// Sliding-window accumulator for one session's audio stream.
///
/// Mutated only by the owning session's connection task; the ring capacity is
/// fixed at construction (10 seconds at the initial sample rate) and is not
/// recomputed when the sample rate is reconfigured mid-stream.
pub struct StreamBuffer {
    samples: VecDeque<f32>,
    capacity: usize,

    sample_rate: u32,
    chunk_duration: f64,
    overlap_duration: f64,
    min_duration: f64,

    /// Unix timestamp of the last emitted window. Starts at 0.0 ("epoch
    /// zero") so the very first extraction is gated only by min_duration.
    last_emit_time: f64,

    chunks_received: u64,
    chunks_processed: u64,
}

impl StreamBuffer {
    pub fn new(config: StreamBufferConfig) -> Self {
        let capacity = (config.sample_rate as f64 * config.max_buffer_seconds) as usize;

        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
            sample_rate: config.sample_rate,
            chunk_duration: config.chunk_duration,
            overlap_duration: config.overlap_duration,
            min_duration: config.min_duration,
            last_emit_time: 0.0,
            chunks_received: 0,
            chunks_processed: 0,
        }
    }

    /// Append decoded samples to the ring.
    ///
    /// Never blocks and never fails: an empty chunk is a no-op (the received
    /// counter is not touched), and samples beyond capacity evict the oldest
    /// ones first.
    pub fn add_chunk(&mut self, samples: &[f32]) {
        if samples.is_empty() {
            return;
        }

        for &sample in samples {
            self.samples.push_back(sample);
            if self.samples.len() > self.capacity {
                self.samples.pop_front();
            }
        }

        self.chunks_received += 1;
    }

    /// Emit a processing window if both gates hold.
    ///
    /// ## Gates:
    /// 1. `now - last_emit_time ≥ chunk_duration - overlap_duration`
    /// 2. buffered sample count ≥ `min_duration × sample_rate`
    ///
    /// The window is the oldest `min(chunk_duration × sample_rate, len)`
    /// samples, copied out without removal. On emission `last_emit_time` is
    /// set to `now` and the processed counter is incremented.
    pub fn try_extract(&mut self, now: f64) -> Option<Vec<f32>> {
        let process_interval = self.chunk_duration - self.overlap_duration;
        if now - self.last_emit_time < process_interval {
            return None;
        }

        let min_samples = (self.sample_rate as f64 * self.min_duration) as usize;
        if self.samples.len() < min_samples {
            return None;
        }

        let chunk_samples = (self.sample_rate as f64 * self.chunk_duration) as usize;
        let window_len = chunk_samples.min(self.samples.len());
        let window: Vec<f32> = self.samples.iter().take(window_len).copied().collect();

        self.last_emit_time = now;
        self.chunks_processed += 1;

        Some(window)
    }

    /// Reset the ring and emission clock; used on reconfiguration.
    pub fn clear(&mut self) {
        self.samples.clear();
        self.last_emit_time = 0.0;
    }

    /// Update the sample rate in place. The ring capacity is intentionally
    /// left unchanged (fixed at construction).
    pub fn set_sample_rate(&mut self, sample_rate: u32) {
        self.sample_rate = sample_rate;
    }

    pub fn set_chunk_duration(&mut self, chunk_duration: f64) {
        self.chunk_duration = chunk_duration;
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Current buffer length in samples.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Duration of buffered audio in seconds.
    pub fn duration_seconds(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }

    pub fn stats(&self) -> BufferStats {
        BufferStats {
            buffer_size: self.samples.len(),
            buffer_duration: self.duration_seconds(),
            total_chunks_received: self.chunks_received,
            total_chunks_processed: self.chunks_processed,
        }
    }
}
