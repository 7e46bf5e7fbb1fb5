use std::path::Path;

use auracheck_core::AttendanceRecord;
use thiserror::Error;
use tokio_rusqlite::Connection;

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Key, Nonce,
};
use rand::rngs::OsRng;
use rand::RngCore;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] tokio_rusqlite::Error),
    #[error("rusqlite error: {0}")]
    Rusqlite(#[from] rusqlite::Error),
    #[error("reference image encryption failed")]
    EncryptionFailed,
    #[error("reference image decryption failed — key mismatch or corrupted data")]
    DecryptionFailed,
    #[error("invalid encrypted blob size: {0} bytes")]
    InvalidBlob(usize),
    #[error("corrupt stored record: {0}")]
    CorruptRecord(String),
    #[error("encryption key I/O error: {0}")]
    KeyIo(#[source] std::io::Error),
}

/// A security-relevant event worth keeping alongside attendance data,
/// e.g. a failed liveness check during verification.
#[derive(Debug, Clone)]
pub struct SecurityEvent {
    pub subject_id: String,
    pub event_type: String,
    pub liveness_score: Option<f64>,
    pub device_id: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

/// SQLite-backed subject and attendance storage.
///
/// Reference face images are encrypted with AES-256-GCM before storage and
/// decrypted on retrieval. A per-installation 32-byte key is generated at
/// first use and stored at `{db_dir}/.key` (mode 0600).
///
/// Attendance records are immutable once inserted — corrections go through
/// the override columns, written by a separate administrative path.
#[derive(Clone)]
pub struct AttendanceStore {
    conn: Connection,
    enc_key: [u8; 32],
}

impl AttendanceStore {
    /// Open (or create) the database at the given path and run migrations.
    pub async fn open(db_path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let enc_key = if db_path == Path::new(":memory:") {
            // In-memory DB (tests): use a fixed all-zeros key
            [0u8; 32]
        } else {
            let key_path = db_path
                .parent()
                .unwrap_or(Path::new("/var/lib/auracheck"))
                .join(".key");
            load_or_generate_key(&key_path)?
        };

        let conn = Connection::open(db_path).await?;

        conn.call(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 PRAGMA foreign_keys = ON;
                 CREATE TABLE IF NOT EXISTS subjects (
                     id TEXT PRIMARY KEY,
                     reference_face BLOB,
                     reference_updated TEXT,
                     liveness_score REAL,
                     pin_hash TEXT,
                     created_at TEXT NOT NULL,
                     updated_at TEXT NOT NULL
                 );
                 CREATE TABLE IF NOT EXISTS attendance (
                     id TEXT PRIMARY KEY,
                     subject_id TEXT NOT NULL,
                     session_id TEXT NOT NULL,
                     status TEXT NOT NULL,
                     check_in_timestamp TEXT,
                     factors TEXT NOT NULL,
                     face_distance REAL NOT NULL,
                     device_id TEXT,
                     latitude REAL,
                     longitude REAL,
                     location_verified INTEGER NOT NULL,
                     location_message TEXT NOT NULL,
                     is_overridden INTEGER NOT NULL DEFAULT 0,
                     override_justification TEXT,
                     override_by TEXT,
                     created_at TEXT NOT NULL,
                     updated_at TEXT NOT NULL
                 );
                 CREATE INDEX IF NOT EXISTS idx_attendance_subject ON attendance(subject_id);
                 CREATE INDEX IF NOT EXISTS idx_attendance_session ON attendance(session_id);
                 CREATE TABLE IF NOT EXISTS security_events (
                     id TEXT PRIMARY KEY,
                     subject_id TEXT NOT NULL,
                     event_type TEXT NOT NULL,
                     liveness_score REAL,
                     device_id TEXT,
                     latitude REAL,
                     longitude REAL,
                     created_at TEXT NOT NULL
                 );",
            )?;
            Ok(())
        })
        .await?;

        Ok(Self { conn, enc_key })
    }

    /// Store (or replace) a subject's reference face image.
    pub async fn upsert_reference_face(
        &self,
        subject_id: &str,
        image: &[u8],
        liveness_score: f32,
    ) -> Result<(), StoreError> {
        let blob = self.encrypt_blob(image)?;
        let now = chrono::Utc::now().to_rfc3339();
        let subject_id = subject_id.to_string();

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO subjects (id, reference_face, reference_updated, liveness_score, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?5)
                     ON CONFLICT(id) DO UPDATE SET
                         reference_face = excluded.reference_face,
                         reference_updated = excluded.reference_updated,
                         liveness_score = excluded.liveness_score,
                         updated_at = excluded.updated_at",
                    rusqlite::params![subject_id, blob, now, liveness_score, now],
                )?;
                Ok(())
            })
            .await?;

        Ok(())
    }

    /// Fetch and decrypt a subject's reference face image.
    pub async fn reference_face(&self, subject_id: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let subject_id = subject_id.to_string();
        let blob: Option<Vec<u8>> = self
            .conn
            .call(move |conn| {
                let mut stmt =
                    conn.prepare("SELECT reference_face FROM subjects WHERE id = ?1")?;
                let mut rows = stmt.query([&subject_id])?;
                match rows.next()? {
                    Some(row) => Ok(row.get::<_, Option<Vec<u8>>>(0)?),
                    None => Ok(None),
                }
            })
            .await?;

        match blob {
            Some(blob) => Ok(Some(self.decrypt_blob(&blob)?)),
            None => Ok(None),
        }
    }

    /// Set (or replace) a subject's PIN hash. The hash is produced by the
    /// secret verifier — never a plaintext PIN.
    pub async fn set_pin_hash(&self, subject_id: &str, pin_hash: &str) -> Result<(), StoreError> {
        let now = chrono::Utc::now().to_rfc3339();
        let subject_id = subject_id.to_string();
        let pin_hash = pin_hash.to_string();

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO subjects (id, pin_hash, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?3)
                     ON CONFLICT(id) DO UPDATE SET
                         pin_hash = excluded.pin_hash,
                         updated_at = excluded.updated_at",
                    rusqlite::params![subject_id, pin_hash, now],
                )?;
                Ok(())
            })
            .await?;

        Ok(())
    }

    /// Fetch a subject's stored PIN hash, if any.
    pub async fn pin_hash(&self, subject_id: &str) -> Result<Option<String>, StoreError> {
        let subject_id = subject_id.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare("SELECT pin_hash FROM subjects WHERE id = ?1")?;
                let mut rows = stmt.query([&subject_id])?;
                match rows.next()? {
                    Some(row) => Ok(row.get::<_, Option<String>>(0)?),
                    None => Ok(None),
                }
            })
            .await
            .map_err(StoreError::from)
    }

    /// Insert one attendance record.
    pub async fn insert_record(&self, record: &AttendanceRecord) -> Result<(), StoreError> {
        let factors = serde_json::to_string(&record.verification_factors)
            .map_err(|e| StoreError::CorruptRecord(e.to_string()))?;
        let record = record.clone();

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO attendance (
                         id, subject_id, session_id, status, check_in_timestamp,
                         factors, face_distance, device_id, latitude, longitude,
                         location_verified, location_message, is_overridden,
                         override_justification, override_by, created_at, updated_at
                     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
                    rusqlite::params![
                        record.id,
                        record.subject_id,
                        record.session_id,
                        record.status.as_str(),
                        record.check_in_timestamp.map(|t| t.to_rfc3339()),
                        factors,
                        record.face_distance,
                        record.device_id,
                        record.location.latitude,
                        record.location.longitude,
                        record.location.verified,
                        record.location.message,
                        record.is_overridden,
                        record.override_justification,
                        record.override_by,
                        record.created_at.to_rfc3339(),
                        record.updated_at.to_rfc3339(),
                    ],
                )?;
                Ok(())
            })
            .await?;

        Ok(())
    }

    /// Fetch a subject's attendance records, most recent first.
    pub async fn records_for_subject(
        &self,
        subject_id: &str,
        limit: u32,
    ) -> Result<Vec<AttendanceRecord>, StoreError> {
        let subject_id = subject_id.to_string();

        let rows: Vec<RecordRow> = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, subject_id, session_id, status, check_in_timestamp,
                            factors, face_distance, device_id, latitude, longitude,
                            location_verified, location_message, is_overridden,
                            override_justification, override_by, created_at, updated_at
                     FROM attendance WHERE subject_id = ?1
                     ORDER BY created_at DESC LIMIT ?2",
                )?;
                let rows = stmt.query_map(rusqlite::params![subject_id, limit], |row| {
                    Ok(RecordRow {
                        id: row.get(0)?,
                        subject_id: row.get(1)?,
                        session_id: row.get(2)?,
                        status: row.get(3)?,
                        check_in_timestamp: row.get(4)?,
                        factors: row.get(5)?,
                        face_distance: row.get(6)?,
                        device_id: row.get(7)?,
                        latitude: row.get(8)?,
                        longitude: row.get(9)?,
                        location_verified: row.get(10)?,
                        location_message: row.get(11)?,
                        is_overridden: row.get(12)?,
                        override_justification: row.get(13)?,
                        override_by: row.get(14)?,
                        created_at: row.get(15)?,
                        updated_at: row.get(16)?,
                    })
                })?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await?;

        rows.into_iter().map(RecordRow::into_record).collect()
    }

    /// Record a security event.
    pub async fn record_security_event(&self, event: SecurityEvent) -> Result<(), StoreError> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = chrono::Utc::now().to_rfc3339();

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO security_events
                         (id, subject_id, event_type, liveness_score, device_id, latitude, longitude, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    rusqlite::params![
                        id,
                        event.subject_id,
                        event.event_type,
                        event.liveness_score,
                        event.device_id,
                        event.latitude,
                        event.longitude,
                        now,
                    ],
                )?;
                Ok(())
            })
            .await?;

        Ok(())
    }

    /// Count enrolled subjects (those with a reference face on file).
    pub async fn count_subjects(&self) -> Result<u64, StoreError> {
        self.conn
            .call(|conn| {
                let count: u64 = conn.query_row(
                    "SELECT COUNT(*) FROM subjects WHERE reference_face IS NOT NULL",
                    [],
                    |row| row.get(0),
                )?;
                Ok(count)
            })
            .await
            .map_err(StoreError::from)
    }

    /// Count stored attendance records.
    pub async fn count_records(&self) -> Result<u64, StoreError> {
        self.conn
            .call(|conn| {
                let count: u64 =
                    conn.query_row("SELECT COUNT(*) FROM attendance", [], |row| row.get(0))?;
                Ok(count)
            })
            .await
            .map_err(StoreError::from)
    }

    // ── Encryption helpers ────────────────────────────────────────────────────

    /// Encrypt a blob with AES-256-GCM.
    ///
    /// Output: 12-byte random nonce || ciphertext || 16-byte GCM tag.
    fn encrypt_blob(&self, plaintext: &[u8]) -> Result<Vec<u8>, StoreError> {
        let mut nonce_bytes = [0u8; 12];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let key = Key::<Aes256Gcm>::from_slice(&self.enc_key);
        let cipher = Aes256Gcm::new(key);

        let ciphertext = cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| StoreError::EncryptionFailed)?;

        let mut blob = Vec::with_capacity(12 + ciphertext.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    /// Decrypt a blob produced by [`encrypt_blob`](Self::encrypt_blob).
    fn decrypt_blob(&self, blob: &[u8]) -> Result<Vec<u8>, StoreError> {
        const NONCE_LEN: usize = 12;

        if blob.len() <= NONCE_LEN {
            return Err(StoreError::InvalidBlob(blob.len()));
        }

        let (nonce_bytes, ciphertext) = blob.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);
        let key = Key::<Aes256Gcm>::from_slice(&self.enc_key);
        let cipher = Aes256Gcm::new(key);

        cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| StoreError::DecryptionFailed)
    }
}

/// Raw attendance row, converted back into a typed record off the SQLite
/// thread.
struct RecordRow {
    id: String,
    subject_id: String,
    session_id: String,
    status: String,
    check_in_timestamp: Option<String>,
    factors: String,
    face_distance: f64,
    device_id: Option<String>,
    latitude: Option<f64>,
    longitude: Option<f64>,
    location_verified: bool,
    location_message: String,
    is_overridden: bool,
    override_justification: Option<String>,
    override_by: Option<String>,
    created_at: String,
    updated_at: String,
}

impl RecordRow {
    fn into_record(self) -> Result<AttendanceRecord, StoreError> {
        use auracheck_core::{AttendanceStatus, RecordedLocation};

        let status = match self.status.as_str() {
            "present" => AttendanceStatus::Present,
            "absent" => AttendanceStatus::Absent,
            other => {
                return Err(StoreError::CorruptRecord(format!(
                    "unknown status '{other}'"
                )))
            }
        };

        let factors = serde_json::from_str(&self.factors)
            .map_err(|e| StoreError::CorruptRecord(e.to_string()))?;

        Ok(AttendanceRecord {
            id: self.id,
            subject_id: self.subject_id,
            session_id: self.session_id,
            status,
            check_in_timestamp: self
                .check_in_timestamp
                .map(|t| parse_timestamp(&t))
                .transpose()?,
            verification_factors: factors,
            face_distance: self.face_distance as f32,
            device_id: self.device_id,
            location: RecordedLocation {
                latitude: self.latitude,
                longitude: self.longitude,
                verified: self.location_verified,
                message: self.location_message,
            },
            is_overridden: self.is_overridden,
            override_justification: self.override_justification,
            override_by: self.override_by,
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
        })
    }
}

fn parse_timestamp(value: &str) -> Result<chrono::DateTime<chrono::Utc>, StoreError> {
    chrono::DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&chrono::Utc))
        .map_err(|e| StoreError::CorruptRecord(format!("bad timestamp '{value}': {e}")))
}

// ── Key management ────────────────────────────────────────────────────────────

/// Load the encryption key from disk, or generate and persist a new one.
/// Written with mode 0600 (owner-readable only).
fn load_or_generate_key(key_path: &Path) -> Result<[u8; 32], StoreError> {
    if key_path.exists() {
        let bytes = std::fs::read(key_path).map_err(StoreError::KeyIo)?;
        if bytes.len() != 32 {
            return Err(StoreError::KeyIo(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!(
                    "encryption key file has wrong length ({} bytes, expected 32)",
                    bytes.len()
                ),
            )));
        }
        let mut key = [0u8; 32];
        key.copy_from_slice(&bytes);
        tracing::debug!(path = %key_path.display(), "loaded encryption key");
        Ok(key)
    } else {
        let mut key = [0u8; 32];
        OsRng.fill_bytes(&mut key);

        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        let mut f = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(key_path)
            .map_err(StoreError::KeyIo)?;
        f.write_all(&key).map_err(StoreError::KeyIo)?;

        tracing::info!(path = %key_path.display(), "generated new AES-256 encryption key");
        Ok(key)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
