//! Collaborator traits for the external analysis capabilities.
//!
//! The decision engine treats face detection, landmark extraction,
//! emotion/demographic analysis, embedding comparison, and secret checking
//! as black-box services. Implementations live outside this crate (the
//! daemon ships HTTP-backed ones); tests substitute stubs.
//!
//! All traits are object-safe and synchronous — analyzer calls run on the
//! blocking pool, never on the async executor itself.

use image::{DynamicImage, RgbImage};
use thiserror::Error;

use crate::types::{DemographicAnalysis, EmotionAnalysis, FaceBox, FaceMatchResult, FaceMesh};

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("analysis backend error: {0}")]
    Backend(String),
    #[error("malformed analysis response: {0}")]
    Response(String),
}

/// Face localization: find zero or more face bounding boxes in an image.
pub trait FaceLocator: Send + Sync {
    fn detect(&self, image: &DynamicImage) -> Result<Vec<FaceBox>, ProviderError>;
}

/// Face embedding comparison against a stored reference image.
pub trait FaceComparator: Send + Sync {
    /// Compare `probe` against `reference`. `threshold` is the embedding
    /// distance below which the faces count as the same person
    /// (lower = stricter).
    fn compare(
        &self,
        probe: &DynamicImage,
        reference: &DynamicImage,
        threshold: f32,
    ) -> Result<FaceMatchResult, ProviderError>;
}

/// Emotion and demographic analysis of a face crop.
///
/// Implementations must tolerate crops in which their own detector finds no
/// face (the equivalent of `enforce_detection = false`) rather than erroring.
pub trait FaceAnalyzer: Send + Sync {
    fn emotion(&self, face: &DynamicImage) -> Result<EmotionAnalysis, ProviderError>;
    fn demographics(&self, face: &DynamicImage) -> Result<DemographicAnalysis, ProviderError>;
}

/// Dense face landmark extraction.
pub trait LandmarkDetector: Send + Sync {
    /// Whether the landmark capability is available at all. When this returns
    /// false the liveness check fails closed instead of running.
    fn ready(&self) -> bool {
        true
    }

    /// Extract the face mesh for the most prominent face, or `None` when no
    /// face is found.
    fn detect(&self, rgb: &RgbImage) -> Result<Option<FaceMesh>, ProviderError>;
}

/// Salted-hash secret comparison. Implementations never compare plaintext.
pub trait SecretVerifier: Send + Sync {
    fn verify(&self, candidate: &str, stored_hash: &str) -> bool;
}
