//! Attendance record assembly.
//!
//! A record is built exactly once per fused verification and is immutable
//! afterwards. Corrections happen through the override fields, set by a
//! separate authority — never by re-running verification.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::types::{
    AttendanceStatus, FaceMatchResult, GeoPoint, LocationDecision, VerificationFactor,
    VerificationOutcome,
};

/// Derive the deterministic attendance id for a subject and timestamp:
/// the first 20 hex characters of `sha256("{subject_id}-{rfc3339}")`.
pub fn attendance_id(subject_id: &str, timestamp: DateTime<Utc>) -> String {
    let digest = Sha256::digest(format!("{subject_id}-{}", timestamp.to_rfc3339()).as_bytes());
    let hex = format!("{digest:x}");
    hex[..20].to_string()
}

/// Location data captured on the record: the raw coordinates as submitted
/// plus the geofence decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedLocation {
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub verified: bool,
    pub message: String,
}

impl RecordedLocation {
    pub fn new(point: Option<GeoPoint>, decision: &LocationDecision) -> Self {
        Self {
            latitude: point.map(|p| p.latitude),
            longitude: point.map(|p| p.longitude),
            verified: decision.verified,
            message: decision.message.clone(),
        }
    }
}

/// The persistable attendance record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub id: String,
    pub subject_id: String,
    pub session_id: String,
    pub status: AttendanceStatus,
    /// Set only when the subject was verified present.
    pub check_in_timestamp: Option<DateTime<Utc>>,
    pub verification_factors: Vec<VerificationFactor>,
    pub face_distance: f32,
    pub device_id: Option<String>,
    pub location: RecordedLocation,
    pub is_overridden: bool,
    pub override_justification: Option<String>,
    pub override_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AttendanceRecord {
    /// Assemble a record from one fused verification pass.
    ///
    /// Consumes the outcome — the factor breakdown transfers into the
    /// record rather than being copied.
    pub fn build(
        subject_id: &str,
        session_id: &str,
        timestamp: DateTime<Utc>,
        outcome: VerificationOutcome,
        face_match: &FaceMatchResult,
        location: RecordedLocation,
        device_id: Option<String>,
    ) -> Self {
        let status = if outcome.verified {
            AttendanceStatus::Present
        } else {
            AttendanceStatus::Absent
        };

        Self {
            id: attendance_id(subject_id, timestamp),
            subject_id: subject_id.to_string(),
            session_id: session_id.to_string(),
            status,
            check_in_timestamp: outcome.verified.then_some(timestamp),
            verification_factors: outcome.factors,
            face_distance: face_match.distance,
            device_id,
            location,
            is_overridden: false,
            override_justification: None,
            override_by: None,
            created_at: timestamp,
            updated_at: timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fusion::fuse_verification;
    use crate::types::{FactorKind, LivenessResult};
    use chrono::TimeZone;

    fn fixed_timestamp() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 14, 9, 26, 53).unwrap()
    }

    fn passing_inputs() -> (LivenessResult, FaceMatchResult, LocationDecision) {
        (
            LivenessResult {
                is_live: true,
                score: 0.8,
            },
            FaceMatchResult {
                verified: true,
                distance: 0.12,
            },
            LocationDecision {
                verified: true,
                message: "Within authorized radius of Lab (4.2m)".to_string(),
            },
        )
    }

    #[test]
    fn id_is_deterministic_and_twenty_chars() {
        let ts = fixed_timestamp();
        let a = attendance_id("student-7", ts);
        let b = attendance_id("student-7", ts);
        assert_eq!(a, b);
        assert_eq!(a.len(), 20);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn id_varies_with_subject_and_time() {
        let ts = fixed_timestamp();
        assert_ne!(attendance_id("a", ts), attendance_id("b", ts));
        assert_ne!(
            attendance_id("a", ts),
            attendance_id("a", ts + chrono::Duration::seconds(1))
        );
    }

    #[test]
    fn verified_outcome_builds_present_record() {
        let (liveness, face, location) = passing_inputs();
        let outcome = fuse_verification(&liveness, &face, &location, None);
        let ts = fixed_timestamp();

        let record = AttendanceRecord::build(
            "student-7",
            "session-42",
            ts,
            outcome,
            &face,
            RecordedLocation::new(
                Some(GeoPoint {
                    latitude: 41.0,
                    longitude: 2.0,
                }),
                &location,
            ),
            Some("kiosk-3".to_string()),
        );

        assert_eq!(record.status, AttendanceStatus::Present);
        assert_eq!(record.check_in_timestamp, Some(ts));
        assert_eq!(record.verification_factors.len(), 3);
        assert_eq!(record.face_distance, 0.12);
        assert!(!record.is_overridden);
        assert_eq!(record.id, attendance_id("student-7", ts));
    }

    #[test]
    fn failed_outcome_builds_absent_record_without_check_in() {
        let (liveness, face, location) = passing_inputs();
        let failed_face = FaceMatchResult {
            verified: false,
            distance: 1.4,
        };
        let outcome = fuse_verification(&liveness, &failed_face, &location, None);

        let record = AttendanceRecord::build(
            "student-7",
            "session-42",
            fixed_timestamp(),
            outcome,
            &failed_face,
            RecordedLocation::new(None, &location),
            None,
        );

        assert_eq!(record.status, AttendanceStatus::Absent);
        assert_eq!(record.check_in_timestamp, None);
        assert!(record.location.latitude.is_none());
    }

    #[test]
    fn record_round_trips_through_json() {
        let (liveness, face, location) = passing_inputs();
        let outcome = fuse_verification(&liveness, &face, &location, None);
        let record = AttendanceRecord::build(
            "student-7",
            "session-42",
            fixed_timestamp(),
            outcome,
            &face,
            RecordedLocation::new(None, &location),
            None,
        );

        let json = serde_json::to_string(&record).unwrap();
        let back: AttendanceRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
        assert_eq!(
            back.verification_factors[0].factor,
            FactorKind::FaceRecognition
        );
    }
}
