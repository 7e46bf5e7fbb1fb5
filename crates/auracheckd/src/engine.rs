use std::sync::Arc;

use auracheck_core::providers::{FaceComparator, FaceLocator, SecretVerifier};
use auracheck_core::{
    evaluate_pin, extract_face_region, fuse_verification, verify_location, AttendanceRecord,
    AuthorizedLocation, FaceBox, FaceMatchResult, GeoPoint, LivenessEngine, RecordedLocation,
};
use image::DynamicImage;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::store::{AttendanceStore, SecurityEvent, StoreError};

/// Distance substituted when the comparison backend fails outright; maps to
/// zero confidence and an unverified face factor.
const FAILED_MATCH_DISTANCE: f32 = 2.0;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("failed to decode image: {0}")]
    ImageDecode(String),
    #[error("no face detected in image")]
    NoFaceDetected,
    #[error("multiple faces detected — provide an image with a single face")]
    MultipleFaces,
    #[error("liveness check failed (score {score:.2})")]
    NotLive { score: f32 },
    #[error("no reference face registered for subject '{0}'")]
    NoReferenceFace(String),
    #[error("liveness error: {0}")]
    Liveness(#[from] auracheck_core::LivenessError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("analysis task failed")]
    AnalysisFailed,
    #[error("engine task exited")]
    ChannelClosed,
}

/// Result of a face registration.
#[derive(Debug)]
pub struct RegisterResult {
    pub liveness_score: f32,
}

/// One attendance verification request, as received from the service layer.
pub struct VerifyRequest {
    pub subject_id: String,
    pub session_id: String,
    pub image: Vec<u8>,
    pub location: Option<GeoPoint>,
    pub authorized_locations: Vec<AuthorizedLocation>,
    pub pin_code: Option<String>,
    pub device_id: Option<String>,
}

/// Engine tuning knobs passed down from daemon configuration.
pub struct EngineSettings {
    pub face_match_threshold: f32,
    pub allowed_location_radius: f64,
}

/// Messages sent from service handlers to the engine task.
enum EngineRequest {
    Register {
        subject_id: String,
        image: Vec<u8>,
        reply: oneshot::Sender<Result<RegisterResult, EngineError>>,
    },
    Verify {
        request: VerifyRequest,
        reply: oneshot::Sender<Result<AttendanceRecord, EngineError>>,
    },
}

/// Clone-safe handle to the engine task.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    /// Request registration: detect the face, gate on liveness, store the
    /// reference image.
    pub async fn register(
        &self,
        subject_id: String,
        image: Vec<u8>,
    ) -> Result<RegisterResult, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Register {
                subject_id,
                image,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Request attendance verification: run the full factor pipeline and
    /// persist the resulting record.
    pub async fn verify(&self, request: VerifyRequest) -> Result<AttendanceRecord, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Verify {
                request,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }
}

/// Spawn the engine task and return a handle to it.
///
/// Requests are processed one at a time; analyzer parallelism lives inside
/// the liveness engine, not across requests.
pub fn spawn_engine(
    store: AttendanceStore,
    locator: Arc<dyn FaceLocator>,
    comparator: Arc<dyn FaceComparator>,
    secrets: Arc<dyn SecretVerifier>,
    liveness: LivenessEngine,
    settings: EngineSettings,
) -> EngineHandle {
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);

    let engine = Engine {
        store,
        locator,
        comparator,
        secrets,
        liveness,
        settings,
    };

    tokio::spawn(async move {
        tracing::info!("engine task started");
        while let Some(req) = rx.recv().await {
            match req {
                EngineRequest::Register {
                    subject_id,
                    image,
                    reply,
                } => {
                    let result = engine.run_register(&subject_id, image).await;
                    let _ = reply.send(result);
                }
                EngineRequest::Verify { request, reply } => {
                    let result = engine.run_verify(request).await;
                    let _ = reply.send(result);
                }
            }
        }
        tracing::info!("engine task exiting");
    });

    EngineHandle { tx }
}

struct Engine {
    store: AttendanceStore,
    locator: Arc<dyn FaceLocator>,
    comparator: Arc<dyn FaceComparator>,
    secrets: Arc<dyn SecretVerifier>,
    liveness: LivenessEngine,
    settings: EngineSettings,
}

impl Engine {
    /// Registration: require exactly one face and a passing liveness check
    /// before the reference image enters the store.
    async fn run_register(
        &self,
        subject_id: &str,
        image_bytes: Vec<u8>,
    ) -> Result<RegisterResult, EngineError> {
        let image = decode_image(&image_bytes)?;
        let face = self.require_single_face(&image).await?;
        let face_region = extract_face_region(&image, &face);

        let liveness = self.liveness.check_liveness(&face_region).await?;
        if !liveness.is_live {
            tracing::warn!(
                subject_id,
                score = liveness.score,
                "registration rejected: liveness check failed"
            );
            self.log_security_event(SecurityEvent {
                subject_id: subject_id.to_string(),
                event_type: "registration_liveness_failed".to_string(),
                liveness_score: Some(f64::from(liveness.score)),
                device_id: None,
                latitude: None,
                longitude: None,
            })
            .await;
            return Err(EngineError::NotLive {
                score: liveness.score,
            });
        }

        self.store
            .upsert_reference_face(subject_id, &image_bytes, liveness.score)
            .await?;

        tracing::info!(subject_id, score = liveness.score, "reference face registered");
        Ok(RegisterResult {
            liveness_score: liveness.score,
        })
    }

    /// Verification: evaluate all four factors, fuse, persist the record.
    ///
    /// A failed factor does not abort the pipeline — the record always
    /// carries the full diagnostic breakdown.
    async fn run_verify(&self, req: VerifyRequest) -> Result<AttendanceRecord, EngineError> {
        let image = decode_image(&req.image)?;
        let face = self.require_single_face(&image).await?;
        let face_region = extract_face_region(&image, &face);

        // Liveness and face match are independent; run them concurrently.
        let (liveness, face_match) = tokio::join!(
            self.liveness.check_liveness(&face_region),
            self.compare_against_reference(&req.subject_id, &face_region),
        );
        let liveness = liveness?;
        let face_match = face_match?;

        if !liveness.is_live {
            self.log_security_event(SecurityEvent {
                subject_id: req.subject_id.clone(),
                event_type: "liveness_check_failed".to_string(),
                liveness_score: Some(f64::from(liveness.score)),
                device_id: req.device_id.clone(),
                latitude: req.location.map(|p| p.latitude),
                longitude: req.location.map(|p| p.longitude),
            })
            .await;
        }

        let location_decision = verify_location(
            req.location,
            &req.authorized_locations,
            self.settings.allowed_location_radius,
        );

        let pin_hash = self.store.pin_hash(&req.subject_id).await?;
        let pin = evaluate_pin(
            req.pin_code.as_deref(),
            pin_hash.as_deref(),
            self.secrets.as_ref(),
        );

        let outcome = fuse_verification(&liveness, &face_match, &location_decision, pin.as_ref());

        let timestamp = chrono::Utc::now();
        let record = AttendanceRecord::build(
            &req.subject_id,
            &req.session_id,
            timestamp,
            outcome,
            &face_match,
            RecordedLocation::new(req.location, &location_decision),
            req.device_id,
        );

        self.store.insert_record(&record).await?;

        tracing::info!(
            attendance_id = %record.id,
            subject_id = %record.subject_id,
            session_id = %record.session_id,
            status = record.status.as_str(),
            "attendance recorded"
        );
        Ok(record)
    }

    /// Detect faces and require exactly one.
    async fn require_single_face(&self, image: &DynamicImage) -> Result<FaceBox, EngineError> {
        let locator = Arc::clone(&self.locator);
        let image = image.clone();
        let faces = tokio::task::spawn_blocking(move || locator.detect(&image))
            .await
            .map_err(|_| EngineError::AnalysisFailed)?
            .map_err(|e| {
                tracing::error!(error = %e, "face detection failed");
                EngineError::AnalysisFailed
            })?;

        match faces.as_slice() {
            [] => Err(EngineError::NoFaceDetected),
            [face] => Ok(*face),
            _ => Err(EngineError::MultipleFaces),
        }
    }

    /// Compare the probe face region against the subject's stored reference.
    ///
    /// A backend failure is not fatal: the face factor fails closed with
    /// zero confidence. A missing reference is an error — the subject was
    /// never enrolled.
    async fn compare_against_reference(
        &self,
        subject_id: &str,
        probe: &DynamicImage,
    ) -> Result<FaceMatchResult, EngineError> {
        let reference_bytes = self
            .store
            .reference_face(subject_id)
            .await?
            .ok_or_else(|| EngineError::NoReferenceFace(subject_id.to_string()))?;

        let reference = image::load_from_memory(&reference_bytes)
            .map_err(|e| EngineError::ImageDecode(format!("stored reference: {e}")))?;

        let comparator = Arc::clone(&self.comparator);
        let probe = probe.clone();
        let threshold = self.settings.face_match_threshold;
        let result = tokio::task::spawn_blocking(move || {
            comparator.compare(&probe, &reference, threshold)
        })
        .await
        .map_err(|_| EngineError::AnalysisFailed)?;

        match result {
            Ok(result) => Ok(result),
            Err(err) => {
                tracing::warn!(error = %err, "face comparison failed — factor fails closed");
                Ok(FaceMatchResult {
                    verified: false,
                    distance: FAILED_MATCH_DISTANCE,
                })
            }
        }
    }

    async fn log_security_event(&self, event: SecurityEvent) {
        if let Err(err) = self.store.record_security_event(event).await {
            tracing::warn!(error = %err, "failed to record security event");
        }
    }
}

fn decode_image(bytes: &[u8]) -> Result<DynamicImage, EngineError> {
    image::load_from_memory(bytes).map_err(|e| EngineError::ImageDecode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use auracheck_core::providers::{FaceAnalyzer, LandmarkDetector, ProviderError};
    use auracheck_core::{
        AttendanceStatus, DemographicAnalysis, EmotionAnalysis, FaceMesh, FactorKind,
        LivenessConfig,
    };
    use image::{RgbImage, Rgb};
    use std::io::Cursor;
    use std::path::Path;
    use std::time::Duration;

    struct StubVision {
        faces: Vec<FaceBox>,
        match_verified: bool,
        comparator_fails: bool,
    }

    impl FaceLocator for StubVision {
        fn detect(&self, _image: &DynamicImage) -> Result<Vec<FaceBox>, ProviderError> {
            Ok(self.faces.clone())
        }
    }

    impl FaceComparator for StubVision {
        fn compare(
            &self,
            _probe: &DynamicImage,
            _reference: &DynamicImage,
            _threshold: f32,
        ) -> Result<FaceMatchResult, ProviderError> {
            if self.comparator_fails {
                return Err(ProviderError::Backend("embedding service down".into()));
            }
            Ok(FaceMatchResult {
                verified: self.match_verified,
                distance: if self.match_verified { 0.12 } else { 1.3 },
            })
        }
    }

    struct StubAnalysis;

    impl FaceAnalyzer for StubAnalysis {
        fn emotion(&self, _face: &DynamicImage) -> Result<EmotionAnalysis, ProviderError> {
            Ok(EmotionAnalysis {
                dominant: "neutral".to_string(),
                confidence: 88.0,
            })
        }

        fn demographics(&self, _face: &DynamicImage) -> Result<DemographicAnalysis, ProviderError> {
            Ok(DemographicAnalysis { age: 24.6 })
        }
    }

    struct StubLandmarks;

    impl LandmarkDetector for StubLandmarks {
        fn detect(&self, _rgb: &RgbImage) -> Result<Option<FaceMesh>, ProviderError> {
            Ok(None)
        }
    }

    struct StubSecrets;

    impl SecretVerifier for StubSecrets {
        fn verify(&self, candidate: &str, stored_hash: &str) -> bool {
            stored_hash == format!("stub${candidate}")
        }
    }

    fn png_face(width: u32, height: u32) -> Vec<u8> {
        let mut img = RgbImage::new(width, height);
        // a flat image keeps the texture analyzer deterministic (score 0.4)
        for pixel in img.pixels_mut() {
            *pixel = Rgb([120, 110, 100]);
        }
        let mut buf = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(img)
            .write_to(&mut buf, image::ImageFormat::Png)
            .unwrap();
        buf.into_inner()
    }

    fn single_face() -> Vec<FaceBox> {
        vec![FaceBox {
            x1: 8,
            y1: 8,
            x2: 56,
            y2: 56,
        }]
    }

    /// With the stub analysis backends the five signal scores are
    /// [0.88, 0.5, 0.5, 0.8, 0.4] — a liveness score of 0.6200.
    fn liveness_engine(threshold: f32) -> LivenessEngine {
        LivenessEngine::new(
            Arc::new(StubAnalysis),
            Arc::new(StubLandmarks),
            LivenessConfig {
                threshold,
                analyzer_timeout: Duration::from_millis(3000),
                ..LivenessConfig::default()
            },
        )
    }

    async fn spawn_test_engine(
        vision: StubVision,
        liveness_threshold: f32,
    ) -> (EngineHandle, AttendanceStore) {
        let store = AttendanceStore::open(Path::new(":memory:")).await.unwrap();
        let vision = Arc::new(vision);
        let handle = spawn_engine(
            store.clone(),
            vision.clone(),
            vision,
            Arc::new(StubSecrets),
            liveness_engine(liveness_threshold),
            EngineSettings {
                face_match_threshold: 0.2,
                allowed_location_radius: 100.0,
            },
        );
        (handle, store)
    }

    fn campus() -> GeoPoint {
        GeoPoint {
            latitude: 41.3874,
            longitude: 2.1686,
        }
    }

    fn campus_zone() -> AuthorizedLocation {
        AuthorizedLocation {
            latitude: 41.3874,
            longitude: 2.1686,
            radius: Some(100.0),
            name: Some("Campus".to_string()),
        }
    }

    fn verify_request(pin: Option<&str>) -> VerifyRequest {
        VerifyRequest {
            subject_id: "alice".to_string(),
            session_id: "session-9".to_string(),
            image: png_face(64, 64),
            location: Some(campus()),
            authorized_locations: vec![campus_zone()],
            pin_code: pin.map(str::to_string),
            device_id: Some("kiosk-1".to_string()),
        }
    }

    #[tokio::test]
    async fn register_stores_reference_when_live() {
        let (engine, store) = spawn_test_engine(
            StubVision {
                faces: single_face(),
                match_verified: true,
                comparator_fails: false,
            },
            0.5,
        )
        .await;

        let result = engine
            .register("alice".to_string(), png_face(64, 64))
            .await
            .unwrap();
        assert!((result.liveness_score - 0.62).abs() < 1e-3);
        assert!(store.reference_face("alice").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn register_rejects_spoofed_face() {
        let (engine, store) = spawn_test_engine(
            StubVision {
                faces: single_face(),
                match_verified: true,
                comparator_fails: false,
            },
            0.99,
        )
        .await;

        let err = engine
            .register("alice".to_string(), png_face(64, 64))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotLive { .. }));
        assert!(store.reference_face("alice").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn register_requires_exactly_one_face() {
        let (engine, _store) = spawn_test_engine(
            StubVision {
                faces: vec![],
                match_verified: true,
                comparator_fails: false,
            },
            0.5,
        )
        .await;
        let err = engine
            .register("alice".to_string(), png_face(64, 64))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NoFaceDetected));

        let (engine, _store) = spawn_test_engine(
            StubVision {
                faces: vec![
                    FaceBox {
                        x1: 0,
                        y1: 0,
                        x2: 20,
                        y2: 20,
                    },
                    FaceBox {
                        x1: 30,
                        y1: 30,
                        x2: 50,
                        y2: 50,
                    },
                ],
                match_verified: true,
                comparator_fails: false,
            },
            0.5,
        )
        .await;
        let err = engine
            .register("alice".to_string(), png_face(64, 64))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::MultipleFaces));
    }

    #[tokio::test]
    async fn undecodable_image_is_rejected() {
        let (engine, _store) = spawn_test_engine(
            StubVision {
                faces: single_face(),
                match_verified: true,
                comparator_fails: false,
            },
            0.5,
        )
        .await;
        let err = engine
            .register("alice".to_string(), b"not an image".to_vec())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::ImageDecode(_)));
    }

    #[tokio::test]
    async fn verify_records_present_when_all_factors_pass() {
        let (engine, store) = spawn_test_engine(
            StubVision {
                faces: single_face(),
                match_verified: true,
                comparator_fails: false,
            },
            0.5,
        )
        .await;

        store
            .upsert_reference_face("alice", &png_face(64, 64), 0.8)
            .await
            .unwrap();

        let record = engine.verify(verify_request(None)).await.unwrap();
        assert_eq!(record.status, AttendanceStatus::Present);
        assert!(record.check_in_timestamp.is_some());
        assert_eq!(record.verification_factors.len(), 3);
        assert!(record.location.verified);

        let stored = store.records_for_subject("alice", 10).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].id, record.id);
    }

    #[tokio::test]
    async fn verify_records_absent_on_face_mismatch() {
        let (engine, store) = spawn_test_engine(
            StubVision {
                faces: single_face(),
                match_verified: false,
                comparator_fails: false,
            },
            0.5,
        )
        .await;

        store
            .upsert_reference_face("alice", &png_face(64, 64), 0.8)
            .await
            .unwrap();

        let record = engine.verify(verify_request(None)).await.unwrap();
        assert_eq!(record.status, AttendanceStatus::Absent);
        assert!(record.check_in_timestamp.is_none());
        // all factors still reported
        assert_eq!(record.verification_factors.len(), 3);
        assert!(!record.verification_factors[0].verified);
        assert!(record.verification_factors[1].verified);
    }

    #[tokio::test]
    async fn verify_fails_closed_when_comparator_is_down() {
        let (engine, store) = spawn_test_engine(
            StubVision {
                faces: single_face(),
                match_verified: true,
                comparator_fails: true,
            },
            0.5,
        )
        .await;

        store
            .upsert_reference_face("alice", &png_face(64, 64), 0.8)
            .await
            .unwrap();

        let record = engine.verify(verify_request(None)).await.unwrap();
        assert_eq!(record.status, AttendanceStatus::Absent);
        let face_factor = &record.verification_factors[0];
        assert_eq!(face_factor.factor, FactorKind::FaceRecognition);
        assert!(!face_factor.verified);
        assert_eq!(face_factor.confidence, Some(0.0));
    }

    #[tokio::test]
    async fn verify_requires_enrollment() {
        let (engine, _store) = spawn_test_engine(
            StubVision {
                faces: single_face(),
                match_verified: true,
                comparator_fails: false,
            },
            0.5,
        )
        .await;

        let err = engine.verify(verify_request(None)).await.unwrap_err();
        assert!(matches!(err, EngineError::NoReferenceFace(_)));
    }

    #[tokio::test]
    async fn failed_liveness_still_produces_full_record() {
        let (engine, store) = spawn_test_engine(
            StubVision {
                faces: single_face(),
                match_verified: true,
                comparator_fails: false,
            },
            0.99,
        )
        .await;

        store
            .upsert_reference_face("alice", &png_face(64, 64), 0.8)
            .await
            .unwrap();

        let record = engine.verify(verify_request(None)).await.unwrap();
        assert_eq!(record.status, AttendanceStatus::Absent);
        assert_eq!(record.verification_factors.len(), 3);
        assert!(!record.verification_factors[1].verified);
        // face and location factors are evaluated and reported regardless
        assert!(record.verification_factors[0].verified);
        assert!(record.verification_factors[2].verified);
    }

    #[tokio::test]
    async fn correct_pin_adds_verified_fourth_factor() {
        let (engine, store) = spawn_test_engine(
            StubVision {
                faces: single_face(),
                match_verified: true,
                comparator_fails: false,
            },
            0.5,
        )
        .await;

        store
            .upsert_reference_face("alice", &png_face(64, 64), 0.8)
            .await
            .unwrap();
        store.set_pin_hash("alice", "stub$4921").await.unwrap();

        let record = engine.verify(verify_request(Some("4921"))).await.unwrap();
        assert_eq!(record.status, AttendanceStatus::Present);
        assert_eq!(record.verification_factors.len(), 4);
        assert!(record.verification_factors[3].verified);
    }

    #[tokio::test]
    async fn wrong_pin_rejects_even_with_biometrics_passing() {
        let (engine, store) = spawn_test_engine(
            StubVision {
                faces: single_face(),
                match_verified: true,
                comparator_fails: false,
            },
            0.5,
        )
        .await;

        store
            .upsert_reference_face("alice", &png_face(64, 64), 0.8)
            .await
            .unwrap();
        store.set_pin_hash("alice", "stub$4921").await.unwrap();

        let record = engine.verify(verify_request(Some("0000"))).await.unwrap();
        assert_eq!(record.status, AttendanceStatus::Absent);
        assert!(!record.verification_factors[3].verified);
    }

    #[tokio::test]
    async fn missing_location_fails_that_factor_only() {
        let (engine, store) = spawn_test_engine(
            StubVision {
                faces: single_face(),
                match_verified: true,
                comparator_fails: false,
            },
            0.5,
        )
        .await;

        store
            .upsert_reference_face("alice", &png_face(64, 64), 0.8)
            .await
            .unwrap();

        let mut request = verify_request(None);
        request.location = None;
        let record = engine.verify(request).await.unwrap();

        assert_eq!(record.status, AttendanceStatus::Absent);
        let location_factor = &record.verification_factors[2];
        assert!(!location_factor.verified);
        assert_eq!(
            location_factor.message.as_deref(),
            Some("Missing location data")
        );
        assert!(record.verification_factors[0].verified);
    }
}
