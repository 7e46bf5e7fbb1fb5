//! auracheck-core — Attendance verification decision engine.
//!
//! Fuses four independent presence signals — face match, passive liveness,
//! geofenced location, and an optional PIN — into a single pass/fail
//! attendance decision with a per-factor diagnostic breakdown.
//!
//! The crate performs no I/O of its own: face detection, landmark extraction,
//! emotion/demographic analysis, embedding comparison, and secret checking
//! are all reached through the collaborator traits in [`providers`].

pub mod analyzers;
pub mod extract;
pub mod fusion;
pub mod geofence;
pub mod liveness;
pub mod providers;
pub mod record;
pub mod types;

pub use extract::extract_face_region;
pub use fusion::{evaluate_pin, face_match_confidence, fuse_verification};
pub use geofence::verify_location;
pub use liveness::{LivenessConfig, LivenessEngine, LivenessError, LivenessWeights};
pub use providers::ProviderError;
pub use record::{attendance_id, AttendanceRecord, RecordedLocation};
pub use types::{
    AttendanceStatus, AuthorizedLocation, DemographicAnalysis, EmotionAnalysis, FaceBox,
    FaceMatchResult, FaceMesh, FactorKind, GeoPoint, LivenessResult, LocationDecision, MeshPoint,
    PinDecision, SignalScores, VerificationFactor, VerificationOutcome,
};
