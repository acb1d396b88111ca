//! # Detector Interface
//!
//! The classifier seam of the streaming layer. A [`Detector`] maps a window
//! of float samples plus a sample rate to a spoof/bonafide verdict; the
//! streaming code treats it as opaque and possibly slow, and only ever calls
//! it through the bounded [`crate::detection::engine::DetectionEngine`].

use crate::error::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Per-class probabilities, always summing to 1.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassScores {
    pub spoof: f32,
    pub bonafide: f32,
}

/// Verdict for one processing window. Immutable once returned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionResult {
    /// Winning class: `"spoof"` or `"bonafide"`
    pub label: String,

    /// Probability of the winning class, in [0, 1]
    pub score: f32,

    pub all_scores: ClassScores,

    /// Raw pre-softmax scores, when the detector exposes them
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logits: Option<Vec<f32>>,
}

/// Opaque classifier mapping a sample window + rate to a verdict.
///
/// Implementations must be safely callable from multiple sessions at once
/// and must not mutate their inputs. Calls may block; the engine runs them
/// on the blocking pool.
pub trait Detector: Send + Sync {
    fn name(&self) -> &str;

    fn detect(&self, samples: &[f32], sample_rate: u32) -> AppResult<DetectionResult>;
}

/// Build the detector named in the configuration.
pub fn build_detector(name: &str) -> AppResult<Arc<dyn Detector>> {
    match name {
        "energy" => Ok(Arc::new(EnergyDetector)),
        other => Err(AppError::ConfigError(format!(
            "Unknown detector model: '{}'. Available: energy",
            other
        ))),
    }
}

/// Baseline detector scoring windows from short-term signal statistics.
///
/// Not a trained model: it derives pseudo-logits from RMS energy and
/// zero-crossing rate and softmaxes them into class probabilities. It exists
/// so the streaming layer has a deterministic, dependency-free classifier
/// wired end to end; swap in a real model behind the same trait.
pub struct EnergyDetector;

impl EnergyDetector {
    fn features(samples: &[f32]) -> (f32, f32) {
        let energy: f32 = samples.iter().map(|s| s * s).sum();
        let rms = (energy / samples.len() as f32).sqrt();

        let crossings = samples
            .windows(2)
            .filter(|pair| (pair[0] >= 0.0) != (pair[1] >= 0.0))
            .count();
        let zcr = if samples.len() > 1 {
            crossings as f32 / (samples.len() - 1) as f32
        } else {
            0.0
        };

        (rms, zcr)
    }
}

impl Detector for EnergyDetector {
    fn name(&self) -> &str {
        "energy"
    }

    fn detect(&self, samples: &[f32], _sample_rate: u32) -> AppResult<DetectionResult> {
        if samples.is_empty() {
            return Err(AppError::Detection(
                "Cannot classify an empty window".to_string(),
            ));
        }

        let (rms, zcr) = Self::features(samples);

        // Heuristic: flat low-energy, high-ZCR windows score toward "spoof"
        let spoof_logit = 4.0 * (zcr - 0.25) + 2.0 * (0.05 - rms);
        let bonafide_logit = -spoof_logit;

        // Two-class softmax, numerically stable around the larger logit
        let max_logit = spoof_logit.max(bonafide_logit);
        let spoof_exp = (spoof_logit - max_logit).exp();
        let bonafide_exp = (bonafide_logit - max_logit).exp();
        let total = spoof_exp + bonafide_exp;
        let spoof = spoof_exp / total;
        let bonafide = bonafide_exp / total;

        let (label, score) = if spoof >= bonafide {
            ("spoof", spoof)
        } else {
            ("bonafide", bonafide)
        };

        Ok(DetectionResult {
            label: label.to_string(),
            score,
            all_scores: ClassScores { spoof, bonafide },
            logits: Some(vec![spoof_logit, bonafide_logit]),
        })
    }
}
