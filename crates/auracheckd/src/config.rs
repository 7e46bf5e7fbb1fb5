use std::path::PathBuf;
use std::time::Duration;

use auracheck_core::LivenessConfig;

/// Daemon configuration, loaded from environment variables.
pub struct Config {
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Base URL of the face analysis sidecar.
    pub analysis_url: String,
    /// HTTP timeout for sidecar calls, in seconds.
    pub analysis_timeout_secs: u64,
    /// Embedding distance below which a face match is accepted. Lower is stricter.
    pub face_match_threshold: f32,
    /// Liveness score at or above which an image counts as live. Higher is stricter.
    pub liveness_threshold: f32,
    /// Default geofence radius in meters, used when an authorized location
    /// omits its own.
    pub allowed_location_radius: f64,
    /// Per-analyzer timeout for the liveness check, in milliseconds.
    pub analyzer_timeout_ms: u64,
    /// Maximum attendance records returned by a history query.
    pub history_limit: u32,
    /// Whether the daemon is running on the session bus (development mode).
    pub session_bus: bool,
}

impl Config {
    /// Load configuration from `AURACHECK_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("auracheck");

        let db_path = std::env::var("AURACHECK_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("attendance.db"));

        Self {
            db_path,
            analysis_url: std::env::var("AURACHECK_ANALYSIS_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:8750".to_string()),
            analysis_timeout_secs: env_u64("AURACHECK_ANALYSIS_TIMEOUT_SECS", 10),
            face_match_threshold: env_f32("AURACHECK_FACE_MATCH_THRESHOLD", 0.20),
            liveness_threshold: env_f32("AURACHECK_LIVENESS_THRESHOLD", 0.65),
            allowed_location_radius: env_f64("AURACHECK_LOCATION_RADIUS", 100.0),
            analyzer_timeout_ms: env_u64("AURACHECK_ANALYZER_TIMEOUT_MS", 3000),
            history_limit: env_u64("AURACHECK_HISTORY_LIMIT", 50) as u32,
            session_bus: std::env::var("AURACHECK_SESSION_BUS").is_ok(),
        }
    }

    /// Liveness engine parameters derived from this configuration.
    pub fn liveness_config(&self) -> LivenessConfig {
        LivenessConfig {
            threshold: self.liveness_threshold,
            analyzer_timeout: Duration::from_millis(self.analyzer_timeout_ms),
            ..LivenessConfig::default()
        }
    }

    pub fn analysis_timeout(&self) -> Duration {
        Duration::from_secs(self.analysis_timeout_secs)
    }
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
