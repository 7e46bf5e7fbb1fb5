//! Verification fusion: combine the four factor decisions into one outcome.
//!
//! Every factor is evaluated and reported even once another has failed —
//! the response always carries the full diagnostic breakdown. There is no
//! partial credit: all required factors must independently pass, and a
//! submitted PIN becomes required the moment it is submitted.

use crate::providers::SecretVerifier;
use crate::types::{
    FaceMatchResult, FactorKind, LivenessResult, LocationDecision, PinDecision,
    VerificationFactor, VerificationOutcome,
};

/// Map an embedding distance to a display confidence in `[0, 100]`.
///
/// `confidence = clamp(100 × (1 − distance/2), 0, 100)` — an explicit design
/// mapping that assumes distances range roughly over `[0, 2]`, not a learned
/// calibration. A replacement embedding backend with a different distance
/// range requires recalibrating this formula.
pub fn face_match_confidence(distance: f32) -> f64 {
    (100.0 * (1.0 - f64::from(distance) / 2.0)).clamp(0.0, 100.0)
}

/// Fuse the factor decisions into the overall verification outcome.
///
/// `overall = face_match ∧ liveness ∧ location ∧ (pin submitted ⇒ pin)`.
/// Factors are emitted in fixed order — face recognition, liveness,
/// location, then PIN only when one was submitted. An absent PIN is not a
/// failure; it is simply not a factor.
pub fn fuse_verification(
    liveness: &LivenessResult,
    face_match: &FaceMatchResult,
    location: &LocationDecision,
    pin: Option<&PinDecision>,
) -> VerificationOutcome {
    let mut factors = Vec::with_capacity(4);

    factors.push(VerificationFactor {
        factor: FactorKind::FaceRecognition,
        verified: face_match.verified,
        confidence: Some(face_match_confidence(face_match.distance)),
        message: None,
    });
    factors.push(VerificationFactor {
        factor: FactorKind::Liveness,
        verified: liveness.is_live,
        confidence: Some(f64::from(liveness.score) * 100.0),
        message: None,
    });
    factors.push(VerificationFactor {
        factor: FactorKind::Location,
        verified: location.verified,
        confidence: None,
        message: Some(location.message.clone()),
    });

    let mut verified = face_match.verified && liveness.is_live && location.verified;

    if let Some(pin) = pin {
        factors.push(VerificationFactor {
            factor: FactorKind::PinCode,
            verified: pin.verified,
            confidence: None,
            message: None,
        });
        verified = verified && pin.verified;
    }

    VerificationOutcome { verified, factors }
}

/// Evaluate the optional PIN factor.
///
/// Returns `None` when no PIN was submitted (the factor is absent, not
/// failed). A submitted PIN with no hash on file is a failed factor. The
/// comparison itself is a salted-hash check through the secret collaborator
/// — never a plaintext comparison.
pub fn evaluate_pin(
    submitted: Option<&str>,
    stored_hash: Option<&str>,
    secrets: &dyn SecretVerifier,
) -> Option<PinDecision> {
    let pin = submitted?;
    let Some(hash) = stored_hash else {
        tracing::warn!("PIN submitted but no PIN hash on file");
        return Some(PinDecision { verified: false });
    };
    Some(PinDecision {
        verified: secrets.verify(pin, hash),
    })
}
