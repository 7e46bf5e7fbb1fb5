use std::sync::Arc;

use auracheck_core::{AttendanceStatus, AuthorizedLocation, GeoPoint};
use serde::Deserialize;
use tokio::sync::Mutex;
use zbus::interface;

use crate::config::Config;
use crate::engine::{EngineHandle, VerifyRequest};
use crate::providers;
use crate::rate_limiter::RateLimiter;
use crate::store::AttendanceStore;

/// Shared state accessible by D-Bus method handlers.
pub struct AppState {
    pub config: Config,
    pub engine: EngineHandle,
    pub store: AttendanceStore,
    pub rate_limiter: RateLimiter,
}

/// D-Bus interface for the AuraCheck attendance daemon.
///
/// Bus name: org.auracheck.Attendance1
/// Object path: /org/auracheck/Attendance1
pub struct AttendanceService {
    pub state: Arc<Mutex<AppState>>,
}

/// The JSON request payload accepted by `verify_attendance`, alongside the
/// raw image bytes.
#[derive(Deserialize)]
struct VerifyParams {
    subject_id: String,
    session_id: String,
    latitude: Option<f64>,
    longitude: Option<f64>,
    #[serde(default)]
    authorized_locations: Vec<AuthorizedLocation>,
    pin_code: Option<String>,
    device_id: Option<String>,
}

#[interface(name = "org.auracheck.Attendance1")]
impl AttendanceService {
    /// Register a subject's reference face.
    ///
    /// The image must contain exactly one face and pass the liveness check.
    /// Returns a JSON object with the measured liveness score.
    async fn register_face(&self, subject_id: &str, image: Vec<u8>) -> zbus::fdo::Result<String> {
        tracing::info!(subject_id, bytes = image.len(), "register_face requested");

        let engine = {
            let state = self.state.lock().await;
            state.engine.clone()
        };

        let result = engine
            .register(subject_id.to_string(), image)
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "register_face failed");
                zbus::fdo::Error::Failed(e.to_string())
            })?;

        Ok(serde_json::json!({
            "status": "success",
            "liveness_score": result.liveness_score,
        })
        .to_string())
    }

    /// Set (or replace) a subject's attendance PIN. The PIN is salted and
    /// hashed before it reaches storage.
    async fn set_pin(&self, subject_id: &str, pin: &str) -> zbus::fdo::Result<()> {
        tracing::info!(subject_id, "set_pin requested");
        let hash = providers::hash_pin(pin);
        let state = self.state.lock().await;
        state
            .store
            .set_pin_hash(subject_id, &hash)
            .await
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    /// Run a full attendance verification.
    ///
    /// `request_json` carries the subject/session identifiers, coordinates,
    /// authorized locations, and optional PIN; `image` is the captured face
    /// image. Returns the verification response as JSON.
    async fn verify_attendance(
        &self,
        request_json: &str,
        image: Vec<u8>,
    ) -> zbus::fdo::Result<String> {
        let params: VerifyParams = serde_json::from_str(request_json)
            .map_err(|e| zbus::fdo::Error::InvalidArgs(format!("bad request: {e}")))?;

        tracing::info!(
            subject_id = %params.subject_id,
            session_id = %params.session_id,
            "verify_attendance requested"
        );

        // --- Rate limit check ---
        {
            let mut state = self.state.lock().await;
            state.rate_limiter.check(&params.subject_id).map_err(|msg| {
                tracing::warn!(subject_id = %params.subject_id, "verify: rate limited");
                zbus::fdo::Error::Failed(msg)
            })?;
        }

        let engine = {
            let state = self.state.lock().await;
            state.engine.clone()
        };

        let location = match (params.latitude, params.longitude) {
            (Some(latitude), Some(longitude)) => Some(GeoPoint {
                latitude,
                longitude,
            }),
            _ => None,
        };

        let subject_id = params.subject_id.clone();

        // Engine errors (undecodable image, backend outage) are returned as
        // Err and do NOT count toward the rate limit — only a completed
        // verification that resolved to "absent" does.
        let record = engine
            .verify(VerifyRequest {
                subject_id: params.subject_id,
                session_id: params.session_id,
                image,
                location,
                authorized_locations: params.authorized_locations,
                pin_code: params.pin_code,
                device_id: params.device_id,
            })
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "verify_attendance failed");
                zbus::fdo::Error::Failed(e.to_string())
            })?;

        let verified = record.status == AttendanceStatus::Present;

        {
            let mut state = self.state.lock().await;
            if verified {
                state.rate_limiter.record_success(&subject_id);
            } else {
                state.rate_limiter.record_failure(&subject_id);
            }
        }

        tracing::info!(
            attendance_id = %record.id,
            subject_id = %subject_id,
            verified,
            "verify_attendance complete"
        );

        Ok(serde_json::json!({
            "attendance_id": record.id,
            "timestamp": record.created_at.to_rfc3339(),
            "verified": verified,
            "verification_details": record.verification_factors,
        })
        .to_string())
    }

    /// Return a subject's attendance history as JSON, most recent first.
    async fn attendance_history(&self, subject_id: &str) -> zbus::fdo::Result<String> {
        tracing::info!(subject_id, "attendance_history requested");
        let state = self.state.lock().await;
        let records = state
            .store
            .records_for_subject(subject_id, state.config.history_limit)
            .await
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
        serde_json::to_string(&records).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    /// Return daemon status information as JSON.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let state = self.state.lock().await;
        let subjects = state.store.count_subjects().await.unwrap_or(0);
        let records = state.store.count_records().await.unwrap_or(0);

        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "analysis_url": state.config.analysis_url,
            "subjects_enrolled": subjects,
            "attendance_records": records,
            "face_match_threshold": state.config.face_match_threshold,
            "liveness_threshold": state.config.liveness_threshold,
            "allowed_location_radius": state.config.allowed_location_radius,
        })
        .to_string())
    }
}
