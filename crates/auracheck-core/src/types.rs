use serde::{Deserialize, Serialize};

/// A detected face bounding box in source-image pixel coordinates.
///
/// Detection backends may emit boxes that touch or cross the image border;
/// coordinates are therefore signed and clamped at extraction time.
/// Invariant: `x2 > x1` and `y2 > y1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaceBox {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

impl FaceBox {
    pub fn width(&self) -> u32 {
        (self.x2 - self.x1).max(0) as u32
    }

    pub fn height(&self) -> u32 {
        (self.y2 - self.y1).max(0) as u32
    }
}

/// The five anti-spoofing signal scores produced by one liveness check.
///
/// Each value is in `[0, 1]`. Scores are computed fresh per request and
/// never cached across requests.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SignalScores {
    pub emotion: f32,
    pub eye_aspect: f32,
    pub symmetry: f32,
    pub demographic: f32,
    pub texture: f32,
}

/// Outcome of a liveness check.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LivenessResult {
    /// Whether the image passed the anti-spoofing check.
    pub is_live: bool,
    /// Weighted liveness score in `[0, 1]`.
    pub score: f32,
}

impl LivenessResult {
    /// The fail-closed outcome used when the check cannot be evaluated.
    pub fn fail_closed() -> Self {
        Self {
            is_live: false,
            score: 0.0,
        }
    }
}

/// A point on the globe in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

/// An authorized attendance zone: a center point plus a radius in meters.
///
/// A missing radius falls back to the configured default; a missing name
/// renders as "Unnamed location" in decision messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthorizedLocation {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub radius: Option<f64>,
    #[serde(default)]
    pub name: Option<String>,
}

impl AuthorizedLocation {
    pub fn point(&self) -> GeoPoint {
        GeoPoint {
            latitude: self.latitude,
            longitude: self.longitude,
        }
    }
}

/// Outcome of the geofence check.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LocationDecision {
    pub verified: bool,
    pub message: String,
}

/// Outcome of comparing a probe face against the stored reference.
///
/// `distance` is the embedding distance reported by the comparison backend;
/// values below the configured threshold imply `verified`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FaceMatchResult {
    pub verified: bool,
    pub distance: f32,
}

/// Outcome of the optional PIN check. Present only when a PIN was submitted.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PinDecision {
    pub verified: bool,
}

/// The verification factors, in the fixed order they are reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactorKind {
    FaceRecognition,
    Liveness,
    Location,
    PinCode,
}

/// One entry of the per-factor diagnostic breakdown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationFactor {
    pub factor: FactorKind,
    pub verified: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// The fused verification decision plus its factor breakdown.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VerificationOutcome {
    pub verified: bool,
    pub factors: Vec<VerificationFactor>,
}

/// Attendance status derived from the fused verification outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttendanceStatus {
    Present,
    Absent,
}

impl AttendanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttendanceStatus::Present => "present",
            AttendanceStatus::Absent => "absent",
        }
    }
}

/// Dominant-emotion analysis reported by the face analysis backend.
///
/// `confidence` is a percentage in `[0, 100]`.
#[derive(Debug, Clone, PartialEq)]
pub struct EmotionAnalysis {
    pub dominant: String,
    pub confidence: f32,
}

/// Demographic estimate reported by the face analysis backend.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DemographicAnalysis {
    /// Estimated age. Fractional values indicate a genuine regression output.
    pub age: f32,
}

/// One landmark of a dense face mesh, in normalized image coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MeshPoint {
    pub x: f32,
    pub y: f32,
}

/// A dense face mesh (468-point convention) for one detected face.
#[derive(Debug, Clone, PartialEq)]
pub struct FaceMesh {
    pub points: Vec<MeshPoint>,
}
