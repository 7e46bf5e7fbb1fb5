//! Concrete implementations of the core's collaborator traits.
//!
//! Face detection, landmark extraction, emotion/demographic analysis, and
//! embedding comparison are served by an HTTP inference sidecar; this module
//! is the client for it. PIN checking is local: salted SHA-256 with a
//! constant-time digest comparison.

use std::io::Cursor;
use std::time::Duration;

use auracheck_core::providers::{
    FaceAnalyzer, FaceComparator, FaceLocator, LandmarkDetector, ProviderError, SecretVerifier,
};
use auracheck_core::{
    DemographicAnalysis, EmotionAnalysis, FaceBox, FaceMatchResult, FaceMesh, MeshPoint,
};
use base64::{engine::general_purpose, Engine as _};
use image::{DynamicImage, RgbImage};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// HTTP client for the face analysis sidecar.
///
/// One instance is shared by all verification requests; `ureq::Agent` pools
/// connections internally.
pub struct AnalysisClient {
    agent: ureq::Agent,
    base_url: String,
}

impl AnalysisClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        let config = ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .build();
        Self {
            agent: config.into(),
            base_url: base_url.into(),
        }
    }

    fn post_image<T: serde::de::DeserializeOwned>(
        &self,
        endpoint: &str,
        image: &DynamicImage,
    ) -> Result<T, ProviderError> {
        let bytes = encode_png(image)?;
        let url = format!("{}{}", self.base_url, endpoint);
        let mut response = self
            .agent
            .post(&url)
            .header("Content-Type", "image/png")
            .send(&bytes[..])
            .map_err(|e| ProviderError::Backend(e.to_string()))?;
        response
            .body_mut()
            .read_json()
            .map_err(|e| ProviderError::Response(e.to_string()))
    }
}

impl FaceLocator for AnalysisClient {
    fn detect(&self, image: &DynamicImage) -> Result<Vec<FaceBox>, ProviderError> {
        let response: DetectResponse = self.post_image("/detect", image)?;
        Ok(response
            .faces
            .into_iter()
            .map(|f| FaceBox {
                x1: f.x1,
                y1: f.y1,
                x2: f.x2,
                y2: f.y2,
            })
            .collect())
    }
}

impl FaceAnalyzer for AnalysisClient {
    fn emotion(&self, face: &DynamicImage) -> Result<EmotionAnalysis, ProviderError> {
        let response: EmotionResponse = self.post_image("/analyze/emotion", face)?;
        Ok(EmotionAnalysis {
            dominant: response.dominant_emotion,
            confidence: response.confidence,
        })
    }

    fn demographics(&self, face: &DynamicImage) -> Result<DemographicAnalysis, ProviderError> {
        let response: DemographicsResponse = self.post_image("/analyze/demographics", face)?;
        Ok(DemographicAnalysis { age: response.age })
    }
}

impl LandmarkDetector for AnalysisClient {
    fn ready(&self) -> bool {
        let url = format!("{}/health", self.base_url);
        let health: Result<HealthResponse, _> = self
            .agent
            .get(&url)
            .call()
            .map_err(|e| ProviderError::Backend(e.to_string()))
            .and_then(|mut r| {
                r.body_mut()
                    .read_json()
                    .map_err(|e| ProviderError::Response(e.to_string()))
            });
        match health {
            Ok(health) => health.landmarks,
            Err(err) => {
                tracing::warn!(error = %err, "analysis sidecar health check failed");
                false
            }
        }
    }

    fn detect(&self, rgb: &RgbImage) -> Result<Option<FaceMesh>, ProviderError> {
        let image = DynamicImage::ImageRgb8(rgb.clone());
        let response: LandmarksResponse = self.post_image("/landmarks", &image)?;
        Ok(response.faces.into_iter().next().map(|face| FaceMesh {
            points: face
                .points
                .into_iter()
                .map(|[x, y]| MeshPoint { x, y })
                .collect(),
        }))
    }
}

impl FaceComparator for AnalysisClient {
    fn compare(
        &self,
        probe: &DynamicImage,
        reference: &DynamicImage,
        threshold: f32,
    ) -> Result<FaceMatchResult, ProviderError> {
        let request = CompareRequest {
            probe: general_purpose::STANDARD.encode(encode_png(probe)?),
            reference: general_purpose::STANDARD.encode(encode_png(reference)?),
            threshold,
        };
        let url = format!("{}/compare", self.base_url);
        let mut response = self
            .agent
            .post(&url)
            .send_json(&request)
            .map_err(|e| ProviderError::Backend(e.to_string()))?;
        let compared: CompareResponse = response
            .body_mut()
            .read_json()
            .map_err(|e| ProviderError::Response(e.to_string()))?;
        Ok(FaceMatchResult {
            verified: compared.verified,
            distance: compared.distance,
        })
    }
}

fn encode_png(image: &DynamicImage) -> Result<Vec<u8>, ProviderError> {
    let mut buf = Cursor::new(Vec::new());
    image
        .write_to(&mut buf, image::ImageFormat::Png)
        .map_err(|e| ProviderError::Backend(format!("PNG encode failed: {e}")))?;
    Ok(buf.into_inner())
}

// ── Wire types ────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct DetectResponse {
    faces: Vec<WireBox>,
}

#[derive(Deserialize)]
struct WireBox {
    x1: i32,
    y1: i32,
    x2: i32,
    y2: i32,
}

#[derive(Deserialize)]
struct LandmarksResponse {
    faces: Vec<WireMesh>,
}

#[derive(Deserialize)]
struct WireMesh {
    points: Vec<[f32; 2]>,
}

#[derive(Deserialize)]
struct EmotionResponse {
    dominant_emotion: String,
    confidence: f32,
}

#[derive(Deserialize)]
struct DemographicsResponse {
    age: f32,
}

#[derive(Serialize)]
struct CompareRequest {
    probe: String,
    reference: String,
    threshold: f32,
}

#[derive(Deserialize)]
struct CompareResponse {
    verified: bool,
    distance: f32,
}

#[derive(Deserialize)]
struct HealthResponse {
    #[serde(default)]
    landmarks: bool,
}

// ── PIN hashing ───────────────────────────────────────────────────────────────

const PIN_SALT_LEN: usize = 16;

/// Salted SHA-256 PIN verifier. Stored format: `{salt_hex}${digest_hex}`.
pub struct PinVerifier;

/// Hash a PIN with a fresh random salt for storage.
pub fn hash_pin(pin: &str) -> String {
    let mut salt = [0u8; PIN_SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    let digest = salted_digest(&salt, pin);
    format!("{}${}", hex_encode(&salt), hex_encode(&digest))
}

impl SecretVerifier for PinVerifier {
    fn verify(&self, candidate: &str, stored_hash: &str) -> bool {
        let Some((salt_hex, digest_hex)) = stored_hash.split_once('$') else {
            return false;
        };
        let (Some(salt), Some(digest)) = (hex_decode(salt_hex), hex_decode(digest_hex)) else {
            return false;
        };
        let candidate_digest = salted_digest(&salt, candidate);
        constant_time_eq(&candidate_digest, &digest)
    }
}

fn salted_digest(salt: &[u8], pin: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(pin.as_bytes());
    hasher.finalize().into()
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn hex_decode(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(s.get(i..i + 2)?, 16).ok())
        .collect()
}
