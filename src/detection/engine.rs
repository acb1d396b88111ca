//! # Detection Engine
//!
//! Bounded gateway between connection tasks and the detector. Classifier
//! calls may be slow and/or blocking, so every invocation first acquires a
//! permit from a semaphore (capping concurrent model calls) and then runs on
//! the blocking pool, keeping every connection's mailbox responsive while a
//! window is being classified.

use crate::detection::detector::{DetectionResult, Detector};
use crate::error::{AppError, AppResult};
use std::sync::{Arc, RwLock};
use std::time::Instant;
use tokio::sync::Semaphore;
use tracing::debug;

/// Running counters across all detections, surfaced by `/health`.
#[derive(Debug, Default, Clone)]
pub struct EngineMetrics {
    pub total_requests: u64,
    pub failed_requests: u64,
    pub total_processing_time_ms: f64,
}

/// Shared, bounded access to the configured detector.
pub struct DetectionEngine {
    detector: Arc<dyn Detector>,
    permits: Arc<Semaphore>,
    metrics: RwLock<EngineMetrics>,
}

impl DetectionEngine {
    pub fn new(detector: Arc<dyn Detector>, max_concurrent: usize) -> Self {
        Self {
            detector,
            permits: Arc::new(Semaphore::new(max_concurrent)),
            metrics: RwLock::new(EngineMetrics::default()),
        }
    }

    pub fn detector_name(&self) -> String {
        self.detector.name().to_string()
    }

    /// Classify one processing window.
    ///
    /// Waits for a permit (backpressure against unbounded concurrent model
    /// invocations), runs the detector on the blocking pool, and returns the
    /// verdict together with the elapsed processing time in milliseconds.
    pub async fn detect(
        &self,
        window: Vec<f32>,
        sample_rate: u32,
    ) -> AppResult<(DetectionResult, f64)> {
        let _permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| AppError::Internal(format!("Detection semaphore closed: {}", e)))?;

        let detector = self.detector.clone();
        let start = Instant::now();

        let outcome = tokio::task::spawn_blocking(move || detector.detect(&window, sample_rate))
            .await
            .map_err(|e| AppError::Internal(format!("Detection task failed: {}", e)))?;

        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
        self.record(&outcome, elapsed_ms);

        let result = outcome?;
        debug!(
            label = %result.label,
            score = result.score,
            elapsed_ms,
            "Detection completed"
        );

        Ok((result, elapsed_ms))
    }

    fn record(&self, outcome: &AppResult<DetectionResult>, elapsed_ms: f64) {
        let mut metrics = self.metrics.write().unwrap();
        metrics.total_requests += 1;
        metrics.total_processing_time_ms += elapsed_ms;
        if outcome.is_err() {
            metrics.failed_requests += 1;
        }
    }

    pub fn metrics_snapshot(&self) -> EngineMetrics {
        self.metrics.read().unwrap().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::detector::EnergyDetector;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Detector that records its peak concurrency while sleeping.
    struct SlowDetector {
        current: AtomicUsize,
        peak: AtomicUsize,
    }

    impl Detector for SlowDetector {
        fn name(&self) -> &str {
            "slow"
        }

        fn detect(&self, samples: &[f32], sample_rate: u32) -> AppResult<DetectionResult> {
            let running = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(running, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(30));
            self.current.fetch_sub(1, Ordering::SeqCst);
            EnergyDetector.detect(samples, sample_rate)
        }
    }

    #[tokio::test]
    async fn test_detect_returns_result_and_elapsed_time() {
        let engine = DetectionEngine::new(Arc::new(EnergyDetector), 2);
        let window: Vec<f32> = (0..8000).map(|i| (i as f32 * 0.01).sin()).collect();

        let (result, elapsed_ms) = engine.detect(window, 16000).await.unwrap();
        assert!(result.label == "spoof" || result.label == "bonafide");
        assert!(elapsed_ms >= 0.0);

        let metrics = engine.metrics_snapshot();
        assert_eq!(metrics.total_requests, 1);
        assert_eq!(metrics.failed_requests, 0);
    }

    #[tokio::test]
    async fn test_failures_are_counted_not_propagated_as_panic() {
        let engine = DetectionEngine::new(Arc::new(EnergyDetector), 1);
        let err = engine.detect(Vec::new(), 16000).await.unwrap_err();
        assert!(matches!(err, AppError::Detection(_)));
        assert_eq!(engine.metrics_snapshot().failed_requests, 1);
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded_by_permits() {
        let detector = Arc::new(SlowDetector {
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let engine = Arc::new(DetectionEngine::new(detector.clone(), 2));

        let mut handles = Vec::new();
        for _ in 0..6 {
            let engine = engine.clone();
            handles.push(tokio::spawn(async move {
                engine.detect(vec![0.1; 1000], 16000).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert!(detector.peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(engine.metrics_snapshot().total_requests, 6);
    }
}
