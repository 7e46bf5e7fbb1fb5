//! Multi-factor passive liveness scoring.
//!
//! A single face image is scored by four independent analyzers — emotion
//! confidence, eye/landmark geometry, demographic plausibility, and texture
//! edge density — running concurrently on the blocking pool. Their five
//! signal scores are combined into one weighted liveness score and a
//! pass/fail decision.
//!
//! # Failure policy
//!
//! The check fails closed, never open:
//!
//! - an analyzer that errors, panics, or exceeds its individual timeout is
//!   replaced by its neutral default — one slow backend cannot sink the
//!   whole request beyond that substitution;
//! - a missing landmark capability fails the entire check with
//!   `(false, 0.0)`;
//! - no retries are performed — a failed probe resolves to a conservative
//!   default rather than being re-run.
//!
//! Analyzers share only read-only inputs (the downscaled face crop and its
//! RGB conversion) and communicate exclusively through return values, so no
//! locking is involved. Every check is independent of every other; the
//! engine holds no cross-request state.

use std::sync::Arc;
use std::time::Duration;

use image::DynamicImage;
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::analyzers;
use crate::providers::{FaceAnalyzer, LandmarkDetector};
use crate::types::{LivenessResult, SignalScores};

/// Score at or above which an image counts as live. Higher is stricter.
pub const DEFAULT_LIVENESS_THRESHOLD: f32 = 0.65;

/// Per-analyzer wall-clock budget.
pub const DEFAULT_ANALYZER_TIMEOUT: Duration = Duration::from_millis(3000);

/// Face crops are downscaled so their longest side does not exceed this
/// before any analysis runs.
pub const MAX_ANALYSIS_DIMENSION: u32 = 640;

/// The hand-tuned signal weight vector.
///
/// Kept as an explicit, named artifact so it can be tested and tuned
/// independently of the aggregation logic. The weights need not sum to 1 —
/// [`combine`](Self::combine) normalizes by their total.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LivenessWeights {
    pub emotion: f32,
    pub eye_aspect: f32,
    pub symmetry: f32,
    pub demographic: f32,
    pub texture: f32,
}

impl Default for LivenessWeights {
    fn default() -> Self {
        Self {
            emotion: 0.25,
            eye_aspect: 0.20,
            symmetry: 0.20,
            demographic: 0.15,
            texture: 0.20,
        }
    }
}

impl LivenessWeights {
    /// Weighted average of the five signal scores, clamped to `[0, 1]`.
    pub fn combine(&self, scores: &SignalScores) -> f32 {
        let total = self.emotion + self.eye_aspect + self.symmetry + self.demographic + self.texture;
        if total <= f32::EPSILON {
            return 0.0;
        }
        let weighted = self.emotion * scores.emotion
            + self.eye_aspect * scores.eye_aspect
            + self.symmetry * scores.symmetry
            + self.demographic * scores.demographic
            + self.texture * scores.texture;
        (weighted / total).clamp(0.0, 1.0)
    }
}

/// Tunable parameters of a [`LivenessEngine`].
#[derive(Debug, Clone)]
pub struct LivenessConfig {
    pub threshold: f32,
    pub analyzer_timeout: Duration,
    pub weights: LivenessWeights,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_LIVENESS_THRESHOLD,
            analyzer_timeout: DEFAULT_ANALYZER_TIMEOUT,
            weights: LivenessWeights::default(),
        }
    }
}

#[derive(Error, Debug)]
pub enum LivenessError {
    /// The only condition surfaced to callers as an error rather than a
    /// fail-closed decision.
    #[error("empty face image")]
    EmptyImage,
}

/// The liveness scoring engine.
///
/// Construct once with the analysis collaborators and reuse across requests;
/// `check_liveness` is safe to call concurrently.
pub struct LivenessEngine {
    analyzer: Arc<dyn FaceAnalyzer>,
    landmarks: Arc<dyn LandmarkDetector>,
    config: LivenessConfig,
}

impl LivenessEngine {
    pub fn new(
        analyzer: Arc<dyn FaceAnalyzer>,
        landmarks: Arc<dyn LandmarkDetector>,
        config: LivenessConfig,
    ) -> Self {
        Self {
            analyzer,
            landmarks,
            config,
        }
    }

    /// Score a face crop for liveness.
    ///
    /// Returns `Err` only for an empty image; every other failure mode
    /// resolves to a fail-closed or default-substituted result.
    pub async fn check_liveness(
        &self,
        image: &DynamicImage,
    ) -> Result<LivenessResult, LivenessError> {
        if image.width() == 0 || image.height() == 0 {
            return Err(LivenessError::EmptyImage);
        }

        if !self.landmarks.ready() {
            tracing::error!("landmark detector unavailable — liveness fails closed");
            return Ok(LivenessResult::fail_closed());
        }

        // One upfront downscale and one RGB conversion, shared read-only by
        // all four analyzers.
        let face = if image.width().max(image.height()) > MAX_ANALYSIS_DIMENSION {
            tracing::debug!(
                width = image.width(),
                height = image.height(),
                "downscaling face crop for analysis"
            );
            Arc::new(image.resize(
                MAX_ANALYSIS_DIMENSION,
                MAX_ANALYSIS_DIMENSION,
                image::imageops::FilterType::Triangle,
            ))
        } else {
            Arc::new(image.clone())
        };
        let rgb = Arc::new(face.to_rgb8());

        let timeout = self.config.analyzer_timeout;

        let emotion_task = {
            let analyzer = Arc::clone(&self.analyzer);
            let face = Arc::clone(&face);
            tokio::task::spawn_blocking(move || analyzers::emotion_score(analyzer.as_ref(), &face))
        };
        let landmark_task = {
            let detector = Arc::clone(&self.landmarks);
            let rgb = Arc::clone(&rgb);
            tokio::task::spawn_blocking(move || analyzers::landmark_scores(detector.as_ref(), &rgb))
        };
        let demographic_task = {
            let analyzer = Arc::clone(&self.analyzer);
            let face = Arc::clone(&face);
            tokio::task::spawn_blocking(move || {
                analyzers::demographic_score(analyzer.as_ref(), &face)
            })
        };
        let texture_task = {
            let face = Arc::clone(&face);
            tokio::task::spawn_blocking(move || analyzers::texture_score(&face))
        };

        let (emotion, (eye_aspect, symmetry), demographic, texture) = tokio::join!(
            settle(emotion_task, timeout, analyzers::EMOTION_DEFAULT, "emotion"),
            settle(landmark_task, timeout, analyzers::LANDMARK_DEFAULT, "landmarks"),
            settle(
                demographic_task,
                timeout,
                analyzers::DEMOGRAPHIC_DEFAULT,
                "demographics"
            ),
            settle(texture_task, timeout, analyzers::TEXTURE_DEFAULT, "texture"),
        );

        let scores = SignalScores {
            emotion,
            eye_aspect,
            symmetry,
            demographic,
            texture,
        };
        let score = self.config.weights.combine(&scores);
        let is_live = score >= self.config.threshold;

        tracing::info!(score, is_live, "liveness check complete");
        Ok(LivenessResult { is_live, score })
    }
}

/// Await one analyzer task with an individual timeout.
///
/// A slow, panicked, or aborted analyzer resolves to its neutral default.
/// On timeout the underlying task is abandoned — its eventual result is
/// discarded, never awaited.
async fn settle<T: Send + 'static>(
    handle: JoinHandle<T>,
    timeout: Duration,
    default: T,
    name: &'static str,
) -> T {
    match tokio::time::timeout(timeout, handle).await {
        Ok(Ok(value)) => value,
        Ok(Err(err)) => {
            tracing::warn!(analyzer = name, error = %err, "analyzer task failed");
            default
        }
        Err(_) => {
            tracing::warn!(
                analyzer = name,
                timeout_ms = timeout.as_millis() as u64,
                "analyzer timed out"
            );
            default
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::ProviderError;
    use crate::types::{DemographicAnalysis, EmotionAnalysis, FaceMesh};
    use image::{RgbImage, RgbaImage};

    struct StubAnalyzer {
        emotion_confidence: f32,
        age: f32,
        fail: bool,
    }

    impl FaceAnalyzer for StubAnalyzer {
        fn emotion(&self, _face: &DynamicImage) -> Result<EmotionAnalysis, ProviderError> {
            if self.fail {
                return Err(ProviderError::Backend("down".into()));
            }
            Ok(EmotionAnalysis {
                dominant: "happy".to_string(),
                confidence: self.emotion_confidence,
            })
        }

        fn demographics(&self, _face: &DynamicImage) -> Result<DemographicAnalysis, ProviderError> {
            if self.fail {
                return Err(ProviderError::Backend("down".into()));
            }
            Ok(DemographicAnalysis { age: self.age })
        }
    }

    struct StubLandmarks {
        mesh: Option<FaceMesh>,
        ready: bool,
        delay: Option<Duration>,
    }

    impl LandmarkDetector for StubLandmarks {
        fn ready(&self) -> bool {
            self.ready
        }

        fn detect(&self, _rgb: &RgbImage) -> Result<Option<FaceMesh>, ProviderError> {
            if let Some(delay) = self.delay {
                std::thread::sleep(delay);
            }
            Ok(self.mesh.clone())
        }
    }

    fn engine(analyzer: StubAnalyzer, landmarks: StubLandmarks, timeout_ms: u64) -> LivenessEngine {
        LivenessEngine::new(
            Arc::new(analyzer),
            Arc::new(landmarks),
            LivenessConfig {
                analyzer_timeout: Duration::from_millis(timeout_ms),
                ..LivenessConfig::default()
            },
        )
    }

    fn uniform_face() -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::new(64, 64))
    }

    #[test]
    fn unit_scores_combine_to_one() {
        let scores = SignalScores {
            emotion: 1.0,
            eye_aspect: 1.0,
            symmetry: 1.0,
            demographic: 1.0,
            texture: 1.0,
        };
        assert_eq!(LivenessWeights::default().combine(&scores), 1.0);
    }

    #[test]
    fn zero_scores_combine_to_zero() {
        let scores = SignalScores {
            emotion: 0.0,
            eye_aspect: 0.0,
            symmetry: 0.0,
            demographic: 0.0,
            texture: 0.0,
        };
        assert_eq!(LivenessWeights::default().combine(&scores), 0.0);
    }

    #[test]
    fn combine_normalizes_unnormalized_weights() {
        let weights = LivenessWeights {
            emotion: 2.0,
            eye_aspect: 2.0,
            symmetry: 2.0,
            demographic: 2.0,
            texture: 2.0,
        };
        let scores = SignalScores {
            emotion: 0.5,
            eye_aspect: 0.5,
            symmetry: 0.5,
            demographic: 0.5,
            texture: 0.5,
        };
        assert!((weights.combine(&scores) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn default_weight_vector_matches_tuning() {
        let w = LivenessWeights::default();
        assert_eq!(
            [w.emotion, w.eye_aspect, w.symmetry, w.demographic, w.texture],
            [0.25, 0.20, 0.20, 0.15, 0.20]
        );
    }

    #[tokio::test]
    async fn live_face_passes_threshold() {
        let engine = engine(
            StubAnalyzer {
                emotion_confidence: 100.0,
                age: 23.7,
                fail: false,
            },
            StubLandmarks {
                mesh: Some(crate::analyzers::ideal_mesh()),
                ready: true,
                delay: None,
            },
            3000,
        );

        let result = engine.check_liveness(&uniform_face()).await.unwrap();
        // scores: [0.95, 1.0, 1.0, 0.8, 0.4] against the default weights
        assert!((result.score - 0.8375).abs() < 1e-4, "score = {}", result.score);
        assert!(result.is_live);
    }

    #[tokio::test]
    async fn failing_backends_fall_back_to_defaults() {
        let engine = engine(
            StubAnalyzer {
                emotion_confidence: 0.0,
                age: 0.0,
                fail: true,
            },
            StubLandmarks {
                mesh: None,
                ready: true,
                delay: None,
            },
            3000,
        );

        let result = engine.check_liveness(&uniform_face()).await.unwrap();
        // scores: [0.5, 0.5, 0.5, 0.6, 0.4]
        assert!((result.score - 0.495).abs() < 1e-4, "score = {}", result.score);
        assert!(!result.is_live);
    }

    #[tokio::test]
    async fn slow_analyzer_is_bounded_by_its_timeout() {
        let engine = engine(
            StubAnalyzer {
                emotion_confidence: 100.0,
                age: 23.7,
                fail: false,
            },
            StubLandmarks {
                mesh: Some(crate::analyzers::ideal_mesh()),
                ready: true,
                delay: Some(Duration::from_millis(400)),
            },
            50,
        );

        let start = std::time::Instant::now();
        let result = engine.check_liveness(&uniform_face()).await.unwrap();
        assert!(
            start.elapsed() < Duration::from_millis(300),
            "aggregator blocked past the analyzer timeout"
        );
        // landmark pair replaced by (0.5, 0.5): [0.95, 0.5, 0.5, 0.8, 0.4]
        assert!((result.score - 0.6375).abs() < 1e-4, "score = {}", result.score);
        assert!(!result.is_live);
    }

    #[tokio::test]
    async fn missing_landmark_capability_fails_closed() {
        let engine = engine(
            StubAnalyzer {
                emotion_confidence: 100.0,
                age: 23.7,
                fail: false,
            },
            StubLandmarks {
                mesh: Some(crate::analyzers::ideal_mesh()),
                ready: false,
                delay: None,
            },
            3000,
        );

        let result = engine.check_liveness(&uniform_face()).await.unwrap();
        assert_eq!(result, LivenessResult::fail_closed());
    }

    #[tokio::test]
    async fn empty_image_is_an_error() {
        let engine = engine(
            StubAnalyzer {
                emotion_confidence: 100.0,
                age: 23.7,
                fail: false,
            },
            StubLandmarks {
                mesh: None,
                ready: true,
                delay: None,
            },
            3000,
        );

        let empty = DynamicImage::ImageRgba8(RgbaImage::new(0, 0));
        assert!(matches!(
            engine.check_liveness(&empty).await,
            Err(LivenessError::EmptyImage)
        ));
    }

    #[tokio::test]
    async fn oversized_image_is_downscaled_not_rejected() {
        let engine = engine(
            StubAnalyzer {
                emotion_confidence: 100.0,
                age: 23.7,
                fail: false,
            },
            StubLandmarks {
                mesh: Some(crate::analyzers::ideal_mesh()),
                ready: true,
                delay: None,
            },
            3000,
        );

        let big = DynamicImage::ImageRgb8(RgbImage::new(1300, 700));
        let result = engine.check_liveness(&big).await.unwrap();
        assert!((result.score - 0.8375).abs() < 1e-4);
    }
}
