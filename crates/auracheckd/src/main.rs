use std::sync::Arc;

use anyhow::Result;
use tokio::sync::Mutex;
use tracing_subscriber::EnvFilter;

use auracheck_core::providers::{FaceAnalyzer, FaceComparator, FaceLocator, LandmarkDetector};
use auracheck_core::LivenessEngine;

mod config;
mod dbus_interface;
mod engine;
mod providers;
mod rate_limiter;
mod store;

use config::Config;
use dbus_interface::{AppState, AttendanceService};
use engine::EngineSettings;
use providers::{AnalysisClient, PinVerifier};
use rate_limiter::RateLimiter;
use store::AttendanceStore;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("auracheckd starting");

    let config = Config::from_env();

    let store = AttendanceStore::open(&config.db_path).await?;
    tracing::info!(db = %config.db_path.display(), "attendance store opened");

    let analysis = Arc::new(AnalysisClient::new(
        config.analysis_url.clone(),
        config.analysis_timeout(),
    ));
    tracing::info!(url = %config.analysis_url, "analysis sidecar configured");

    let analyzer: Arc<dyn FaceAnalyzer> = analysis.clone();
    let landmarks: Arc<dyn LandmarkDetector> = analysis.clone();
    let locator: Arc<dyn FaceLocator> = analysis.clone();
    let comparator: Arc<dyn FaceComparator> = analysis;

    let liveness = LivenessEngine::new(analyzer, landmarks, config.liveness_config());

    let engine = engine::spawn_engine(
        store.clone(),
        locator,
        comparator,
        Arc::new(PinVerifier),
        liveness,
        EngineSettings {
            face_match_threshold: config.face_match_threshold,
            allowed_location_radius: config.allowed_location_radius,
        },
    );

    let session_bus = config.session_bus;
    let service = AttendanceService {
        state: Arc::new(Mutex::new(AppState {
            config,
            engine,
            store,
            rate_limiter: RateLimiter::new(),
        })),
    };

    let builder = if session_bus {
        tracing::warn!("running on the session bus (development mode)");
        zbus::connection::Builder::session()?
    } else {
        zbus::connection::Builder::system()?
    };

    let _connection = builder
        .name("org.auracheck.Attendance1")?
        .serve_at("/org/auracheck/Attendance1", service)?
        .build()
        .await?;

    tracing::info!("auracheckd ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("auracheckd shutting down");

    Ok(())
}
