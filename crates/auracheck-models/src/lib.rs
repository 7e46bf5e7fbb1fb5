use sha2::{Digest, Sha256};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Model file descriptor: expected filename, URL, human-readable size.
pub struct ModelFile {
    pub name: &'static str,
    pub url: &'static str,
    pub size_display: &'static str,
}

// The weight files the analysis sidecar needs: recognition, detection, and
// the emotion/age models behind the liveness signal analyzers.
// Upstream publishes no digests, so integrity is pinned locally at download
// time via the lockfile (see write_lockfile / verify_lockfile).
pub const MODELS: &[ModelFile] = &[
    ModelFile {
        name: "vgg_face_weights.h5",
        url: "https://github.com/serengil/deepface_models/releases/download/v1.0/vgg_face_weights.h5",
        size_display: "580 MB",
    },
    ModelFile {
        name: "retinaface.h5",
        url: "https://github.com/serengil/deepface_models/releases/download/v1.0/retinaface.h5",
        size_display: "119 MB",
    },
    ModelFile {
        name: "facial_expression_model_weights.h5",
        url: "https://github.com/serengil/deepface_models/releases/download/v1.0/facial_expression_model_weights.h5",
        size_display: "5.9 MB",
    },
    ModelFile {
        name: "age_model_weights.h5",
        url: "https://github.com/serengil/deepface_models/releases/download/v1.0/age_model_weights.h5",
        size_display: "539 MB",
    },
];

/// Name of the integrity lockfile written next to the models.
pub const LOCKFILE_NAME: &str = "models.sha256";

#[derive(Error, Debug)]
pub enum ModelIntegrityError {
    #[error("model file not found: {name} ({path})")]
    MissingModel { name: String, path: PathBuf },

    #[error("failed to open model file: {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read model file: {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("integrity lockfile not found: {path} — run `auracheck setup` first")]
    MissingLockfile { path: PathBuf },

    #[error("malformed integrity lockfile {path} (line {line})")]
    MalformedLockfile { path: PathBuf, line: usize },

    #[error("failed to write integrity lockfile: {path}: {source}")]
    WriteLockfile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(
        "model checksum mismatch for {name} ({path})\n  expected: {expected}\n  got:      {got}"
    )]
    ChecksumMismatch {
        name: String,
        path: PathBuf,
        expected: String,
        got: String,
    },
}

/// Compute SHA-256 hex digest of a file.
pub fn sha256_file_hex(path: &Path) -> Result<String, ModelIntegrityError> {
    let mut file = fs::File::open(path).map_err(|source| ModelIntegrityError::Open {
        path: path.to_path_buf(),
        source,
    })?;

    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];

    loop {
        let n = file
            .read(&mut buf)
            .map_err(|source| ModelIntegrityError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

/// Digest every manifest model in `model_dir` and write the lockfile
/// (sha256sum format: `{digest}  {name}`). Trust-on-first-use: call this
/// once after downloading, then verify on every subsequent start.
///
/// Returns the lockfile path. Fails if any manifest model is missing.
pub fn write_lockfile(model_dir: &Path) -> Result<PathBuf, ModelIntegrityError> {
    let mut contents = String::new();

    for model in MODELS {
        let path = model_dir.join(model.name);
        if !path.exists() {
            return Err(ModelIntegrityError::MissingModel {
                name: model.name.to_string(),
                path,
            });
        }
        let digest = sha256_file_hex(&path)?;
        contents.push_str(&format!("{digest}  {}\n", model.name));
    }

    let lockfile = model_dir.join(LOCKFILE_NAME);
    fs::write(&lockfile, contents).map_err(|source| ModelIntegrityError::WriteLockfile {
        path: lockfile.clone(),
        source,
    })?;

    Ok(lockfile)
}

/// Verify every entry of the lockfile against the files in `model_dir`.
pub fn verify_lockfile(model_dir: &Path) -> Result<(), ModelIntegrityError> {
    let lockfile = model_dir.join(LOCKFILE_NAME);
    if !lockfile.exists() {
        return Err(ModelIntegrityError::MissingLockfile { path: lockfile });
    }

    let contents = fs::read_to_string(&lockfile).map_err(|source| ModelIntegrityError::Read {
        path: lockfile.clone(),
        source,
    })?;

    for (idx, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let Some((expected, name)) = line.split_once("  ") else {
            return Err(ModelIntegrityError::MalformedLockfile {
                path: lockfile,
                line: idx + 1,
            });
        };

        let path = model_dir.join(name);
        if !path.exists() {
            return Err(ModelIntegrityError::MissingModel {
                name: name.to_string(),
                path,
            });
        }

        let got = sha256_file_hex(&path)?;
        if got != expected {
            return Err(ModelIntegrityError::ChecksumMismatch {
                name: name.to_string(),
                path,
                expected: expected.to_string(),
                got,
            });
        }
    }

    Ok(())
}
