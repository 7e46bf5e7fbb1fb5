//! The four anti-spoofing signal analyzers.
//!
//! Each analyzer is independent, side-effect-free, and deterministic given
//! its inputs and the backend it consults. A failing backend never
//! propagates: every analyzer substitutes its documented neutral default and
//! logs the failure.
//!
//! | analyzer     | signal                              | neutral default |
//! |--------------|-------------------------------------|-----------------|
//! | emotion      | dominant-emotion confidence         | 0.5             |
//! | landmarks    | eye aspect ratio + facial symmetry  | (0.5, 0.5)      |
//! | demographics | age-estimate plausibility           | 0.6             |
//! | texture      | edge-density of the face crop       | 0.6             |

use image::{DynamicImage, RgbImage};

use crate::providers::{FaceAnalyzer, LandmarkDetector};
use crate::types::{FaceMesh, MeshPoint};

/// Neutral default for the emotion signal.
pub const EMOTION_DEFAULT: f32 = 0.5;
/// Neutral default for the (eye-aspect, symmetry) pair.
pub const LANDMARK_DEFAULT: (f32, f32) = (0.5, 0.5);
/// Neutral default for the demographic-plausibility signal.
pub const DEMOGRAPHIC_DEFAULT: f32 = 0.6;
/// Neutral default for the texture signal.
pub const TEXTURE_DEFAULT: f32 = 0.6;

/// Emotion confidence is capped below certainty; a backend claiming 100%
/// confidence on a static image is no evidence of liveness.
const EMOTION_CONFIDENCE_CAP: f32 = 0.95;

/// Canny hysteresis thresholds for the texture analyzer.
const CANNY_LOW: f32 = 100.0;
const CANNY_HIGH: f32 = 200.0;

/// Eye landmark indices in the 468-point mesh convention, ordered
/// `[p0..p5]` with `p0`/`p3` the horizontal eye corners.
const LEFT_EYE_MESH: [usize; 6] = [362, 385, 387, 263, 373, 380];
const RIGHT_EYE_MESH: [usize; 6] = [33, 160, 158, 133, 153, 144];

/// Nose tip landmark used as the symmetry reference point.
const NOSE_TIP_MESH: usize = 1;

/// Bilateral landmark pairs measured for symmetry: face edges, mouth
/// corners, eyebrows.
const SYMMETRY_PAIRS: [(usize, usize); 3] = [(234, 454), (93, 323), (70, 300)];

/// Dominant-emotion confidence, scaled to `[0, 0.95]`.
pub fn emotion_score(analyzer: &dyn FaceAnalyzer, face: &DynamicImage) -> f32 {
    match analyzer.emotion(face) {
        Ok(emotion) => {
            let score = (emotion.confidence / 100.0)
                .max(0.0)
                .min(EMOTION_CONFIDENCE_CAP);
            tracing::debug!(dominant = %emotion.dominant, score, "emotion analysis");
            score
        }
        Err(err) => {
            tracing::warn!(error = %err, "emotion analysis failed");
            EMOTION_DEFAULT
        }
    }
}

/// Eye-aspect-ratio and facial-symmetry scores from the dense face mesh.
pub fn landmark_scores(detector: &dyn LandmarkDetector, rgb: &RgbImage) -> (f32, f32) {
    match detector.detect(rgb) {
        Ok(Some(mesh)) => mesh_scores(&mesh).unwrap_or_else(|| {
            tracing::debug!(points = mesh.points.len(), "face mesh unusable for geometry");
            LANDMARK_DEFAULT
        }),
        Ok(None) => {
            tracing::debug!("no face mesh detected");
            LANDMARK_DEFAULT
        }
        Err(err) => {
            tracing::warn!(error = %err, "landmark analysis failed");
            LANDMARK_DEFAULT
        }
    }
}

/// Age-estimate plausibility. Non-integer age values are characteristic of a
/// genuine regression pass over a real face.
pub fn demographic_score(analyzer: &dyn FaceAnalyzer, face: &DynamicImage) -> f32 {
    match analyzer.demographics(face) {
        Ok(demo) => {
            let score = if demo.age.fract().abs() > f32::EPSILON {
                0.8
            } else {
                0.6
            };
            tracing::debug!(age = demo.age, score, "demographic analysis");
            score
        }
        Err(err) => {
            tracing::warn!(error = %err, "demographic analysis failed");
            DEMOGRAPHIC_DEFAULT
        }
    }
}

/// Edge-density texture score. Printed photos and screens re-photographed by
/// a camera are too smooth; heavy compression artifacts are too noisy.
pub fn texture_score(face: &DynamicImage) -> f32 {
    let gray = face.to_luma8();
    if gray.width() < 3 || gray.height() < 3 {
        return TEXTURE_DEFAULT;
    }

    let edges = imageproc::edges::canny(&gray, CANNY_LOW, CANNY_HIGH);
    let total = (edges.width() * edges.height()) as f32;
    let edge_pixels = edges.pixels().filter(|p| p.0[0] > 0).count() as f32;
    let density = edge_pixels / total;

    let score = texture_score_from_density(density);
    tracing::debug!(density, score, "texture analysis");
    score
}

/// Map edge density to a bounded score.
///
/// density < 0.01 → 0.4 (too smooth, likely a flat photo or screen)
/// density > 0.30 → 0.5 (too noisy)
/// otherwise      → 0.7 + min(0.25, density)
pub(crate) fn texture_score_from_density(density: f32) -> f32 {
    if density < 0.01 {
        0.4
    } else if density > 0.3 {
        0.5
    } else {
        0.7 + density.min(0.25)
    }
}

fn mesh_scores(mesh: &FaceMesh) -> Option<(f32, f32)> {
    let left = eye_aspect_ratio(mesh, &LEFT_EYE_MESH)?;
    let right = eye_aspect_ratio(mesh, &RIGHT_EYE_MESH)?;
    let avg_ear = (left + right) / 2.0;
    let ear_score = ((avg_ear - 0.15) / 0.15).clamp(0.0, 1.0);

    let symmetry = symmetry_score(mesh)?;
    Some((ear_score, symmetry))
}

/// EAR over six ordered eye points: `(‖p1−p5‖ + ‖p2−p4‖) / (2·‖p0−p3‖)`.
fn eye_aspect_ratio(mesh: &FaceMesh, indices: &[usize; 6]) -> Option<f32> {
    let p: Vec<MeshPoint> = indices
        .iter()
        .map(|&i| mesh.points.get(i).copied())
        .collect::<Option<_>>()?;

    let v1 = dist(p[1], p[5]);
    let v2 = dist(p[2], p[4]);
    let h = dist(p[0], p[3]);
    if h <= f32::EPSILON {
        return None;
    }
    Some((v1 + v2) / (2.0 * h))
}

/// Per-pair symmetry `1 − min(l, r)/max(l, r)` measured from the nose tip,
/// averaged over the three pairs and inverted.
fn symmetry_score(mesh: &FaceMesh) -> Option<f32> {
    let nose = mesh.points.get(NOSE_TIP_MESH).copied()?;

    let mut asymmetry = 0.0;
    for (li, ri) in SYMMETRY_PAIRS {
        let left = dist(nose, mesh.points.get(li).copied()?);
        let right = dist(nose, mesh.points.get(ri).copied()?);
        let max = left.max(right);
        if max <= f32::EPSILON {
            return None;
        }
        asymmetry += 1.0 - left.min(right) / max;
    }

    Some(1.0 - asymmetry / SYMMETRY_PAIRS.len() as f32)
}

fn dist(a: MeshPoint, b: MeshPoint) -> f32 {
    ((a.x - b.x).powi(2) + (a.y - b.y).powi(2)).sqrt()
}

/// A mesh with hand-placed geometry: both eyes have vertical gaps equal to
/// the horizontal gap (EAR = 1.0) and all symmetry pairs equidistant from
/// the nose tip (symmetry = 1.0).
#[cfg(test)]
pub(crate) fn ideal_mesh() -> FaceMesh {
    let mut points = vec![MeshPoint { x: 0.0, y: 0.0 }; 468];
    points[NOSE_TIP_MESH] = MeshPoint { x: 0.5, y: 0.5 };

    let eyes = [(&LEFT_EYE_MESH, 0.30f32), (&RIGHT_EYE_MESH, 0.62f32)];
    for (indices, x0) in eyes {
        points[indices[0]] = MeshPoint { x: x0, y: 0.50 };
        points[indices[3]] = MeshPoint { x: x0 + 0.04, y: 0.50 };
        points[indices[1]] = MeshPoint { x: x0 + 0.01, y: 0.48 };
        points[indices[5]] = MeshPoint { x: x0 + 0.01, y: 0.52 };
        points[indices[2]] = MeshPoint { x: x0 + 0.03, y: 0.48 };
        points[indices[4]] = MeshPoint { x: x0 + 0.03, y: 0.52 };
    }

    let pairs = [
        (SYMMETRY_PAIRS[0], 0.20f32, 0.50f32),
        (SYMMETRY_PAIRS[1], 0.10, 0.60),
        (SYMMETRY_PAIRS[2], 0.10, 0.35),
    ];
    for ((li, ri), dx, y) in pairs {
        points[li] = MeshPoint { x: 0.5 - dx, y };
        points[ri] = MeshPoint { x: 0.5 + dx, y };
    }

    FaceMesh { points }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::ProviderError;
    use crate::types::{DemographicAnalysis, EmotionAnalysis};
    use image::RgbImage;

    struct FixedAnalyzer {
        emotion_confidence: f32,
        age: f32,
    }

    impl FaceAnalyzer for FixedAnalyzer {
        fn emotion(&self, _face: &DynamicImage) -> Result<EmotionAnalysis, ProviderError> {
            Ok(EmotionAnalysis {
                dominant: "neutral".to_string(),
                confidence: self.emotion_confidence,
            })
        }

        fn demographics(&self, _face: &DynamicImage) -> Result<DemographicAnalysis, ProviderError> {
            Ok(DemographicAnalysis { age: self.age })
        }
    }

    struct BrokenAnalyzer;

    impl FaceAnalyzer for BrokenAnalyzer {
        fn emotion(&self, _face: &DynamicImage) -> Result<EmotionAnalysis, ProviderError> {
            Err(ProviderError::Backend("connection refused".into()))
        }

        fn demographics(&self, _face: &DynamicImage) -> Result<DemographicAnalysis, ProviderError> {
            Err(ProviderError::Backend("connection refused".into()))
        }
    }

    fn blank_face() -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::new(32, 32))
    }

    struct MeshStub(Option<FaceMesh>);

    impl LandmarkDetector for MeshStub {
        fn detect(&self, _rgb: &RgbImage) -> Result<Option<FaceMesh>, ProviderError> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn ear_is_one_when_vertical_gaps_equal_horizontal() {
        let mesh = ideal_mesh();
        let left = eye_aspect_ratio(&mesh, &LEFT_EYE_MESH).unwrap();
        let right = eye_aspect_ratio(&mesh, &RIGHT_EYE_MESH).unwrap();
        assert!((left - 1.0).abs() < 1e-5, "left EAR = {left}");
        assert!((right - 1.0).abs() < 1e-5, "right EAR = {right}");
    }

    #[test]
    fn perfectly_symmetric_mesh_scores_one() {
        let mesh = ideal_mesh();
        let symmetry = symmetry_score(&mesh).unwrap();
        assert!((symmetry - 1.0).abs() < 1e-5, "symmetry = {symmetry}");
    }

    #[test]
    fn asymmetric_mesh_scores_below_one() {
        let mut mesh = ideal_mesh();
        // Pull one face edge 50% closer to the nose
        mesh.points[SYMMETRY_PAIRS[0].0] = MeshPoint { x: 0.40, y: 0.50 };
        let symmetry = symmetry_score(&mesh).unwrap();
        assert!(symmetry < 1.0);
        assert!(symmetry > 0.0);
    }

    #[test]
    fn landmark_scores_from_ideal_mesh() {
        let detector = MeshStub(Some(ideal_mesh()));
        let rgb = RgbImage::new(8, 8);
        let (ear, symmetry) = landmark_scores(&detector, &rgb);
        assert!((ear - 1.0).abs() < 1e-5);
        assert!((symmetry - 1.0).abs() < 1e-5);
    }

    #[test]
    fn landmark_scores_default_when_no_mesh() {
        let detector = MeshStub(None);
        let rgb = RgbImage::new(8, 8);
        assert_eq!(landmark_scores(&detector, &rgb), LANDMARK_DEFAULT);
    }

    #[test]
    fn landmark_scores_default_on_sparse_mesh() {
        let detector = MeshStub(Some(FaceMesh {
            points: vec![MeshPoint { x: 0.5, y: 0.5 }; 10],
        }));
        let rgb = RgbImage::new(8, 8);
        assert_eq!(landmark_scores(&detector, &rgb), LANDMARK_DEFAULT);
    }

    #[test]
    fn emotion_confidence_is_capped() {
        let analyzer = FixedAnalyzer {
            emotion_confidence: 100.0,
            age: 30.0,
        };
        assert_eq!(emotion_score(&analyzer, &blank_face()), 0.95);
    }

    #[test]
    fn emotion_failure_yields_neutral_default() {
        assert_eq!(emotion_score(&BrokenAnalyzer, &blank_face()), EMOTION_DEFAULT);
    }

    #[test]
    fn fractional_age_scores_higher() {
        let fractional = FixedAnalyzer {
            emotion_confidence: 50.0,
            age: 27.4,
        };
        let integral = FixedAnalyzer {
            emotion_confidence: 50.0,
            age: 27.0,
        };
        assert_eq!(demographic_score(&fractional, &blank_face()), 0.8);
        assert_eq!(demographic_score(&integral, &blank_face()), 0.6);
    }

    #[test]
    fn demographic_failure_yields_neutral_default() {
        assert_eq!(
            demographic_score(&BrokenAnalyzer, &blank_face()),
            DEMOGRAPHIC_DEFAULT
        );
    }

    #[test]
    fn texture_density_mapping() {
        assert_eq!(texture_score_from_density(0.0), 0.4);
        assert_eq!(texture_score_from_density(0.009), 0.4);
        assert_eq!(texture_score_from_density(0.31), 0.5);
        assert!((texture_score_from_density(0.1) - 0.8).abs() < 1e-6);
        // density above 0.25 saturates the bonus
        assert!((texture_score_from_density(0.28) - 0.95).abs() < 1e-6);
    }

    #[test]
    fn uniform_image_is_too_smooth() {
        let face = blank_face();
        assert_eq!(texture_score(&face), 0.4);
    }

    #[test]
    fn tiny_crop_yields_neutral_default() {
        let face = DynamicImage::ImageRgb8(RgbImage::new(2, 2));
        assert_eq!(texture_score(&face), TEXTURE_DEFAULT);
    }
}
