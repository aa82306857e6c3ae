//! Model weight artifacts.
//!
//! Models come either from a local directory or from a remote base URL.
//! Remote artifacts are downloaded once into `<cache_dir>/<version>/` and
//! reused afterwards; nothing is ever written back to the source.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const DETECTOR_FILE: &str = "det_10g.onnx";
pub const RECOGNIZER_FILE: &str = "w600k_r50.onnx";
pub const DEFAULT_MODEL_VERSION: &str = "buffalo_l";

#[derive(Error, Debug)]
pub enum AssetError {
    #[error("model file not found: {0}")]
    Missing(PathBuf),
    #[error("download {url}: {source}")]
    Download {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("sha256 mismatch for {path}: expected {expected}, got {actual}")]
    DigestMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Where model weights are fetched from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ModelSource {
    Local {
        dir: PathBuf,
    },
    Remote {
        base_url: String,
        cache_dir: PathBuf,
        version: String,
    },
}

/// Optional SHA-256 pins (lowercase hex) per artifact.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelPins {
    pub detector_sha256: Option<String>,
    pub recognizer_sha256: Option<String>,
}

/// Resolved on-disk locations of both models.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelPaths {
    pub detector: PathBuf,
    pub recognizer: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelAssets {
    pub source: ModelSource,
    pub pins: ModelPins,
}

impl ModelAssets {
    pub fn local(dir: impl Into<PathBuf>) -> Self {
        Self {
            source: ModelSource::Local { dir: dir.into() },
            pins: ModelPins::default(),
        }
    }

    /// Make both model files available locally and return their paths.
    pub async fn resolve(&self) -> Result<ModelPaths, AssetError> {
        match &self.source {
            ModelSource::Local { dir } => {
                let paths = ModelPaths {
                    detector: dir.join(DETECTOR_FILE),
                    recognizer: dir.join(RECOGNIZER_FILE),
                };
                for (path, pin) in [
                    (&paths.detector, &self.pins.detector_sha256),
                    (&paths.recognizer, &self.pins.recognizer_sha256),
                ] {
                    if !tokio::fs::try_exists(path).await? {
                        return Err(AssetError::Missing(path.clone()));
                    }
                    verify(path, pin.as_deref()).await?;
                }
                Ok(paths)
            }
            ModelSource::Remote {
                base_url,
                cache_dir,
                version,
            } => {
                let dir = cache_dir.join(version);
                let paths = ModelPaths {
                    detector: dir.join(DETECTOR_FILE),
                    recognizer: dir.join(RECOGNIZER_FILE),
                };
                for (file, path, pin) in [
                    (DETECTOR_FILE, &paths.detector, &self.pins.detector_sha256),
                    (RECOGNIZER_FILE, &paths.recognizer, &self.pins.recognizer_sha256),
                ] {
                    let fresh = download_to_cache(&artifact_url(base_url, version, file), path).await?;
                    if let Err(e) = verify(path, pin.as_deref()).await {
                        if fresh {
                            let _ = tokio::fs::remove_file(path).await;
                        }
                        return Err(e);
                    }
                }
                Ok(paths)
            }
        }
    }
}

fn artifact_url(base_url: &str, version: &str, file: &str) -> String {
    format!("{}/{version}/{file}", base_url.trim_end_matches('/'))
}

/// Download `url` to `dest` unless it is already cached.
///
/// Returns true when the file was fetched by this call.
async fn download_to_cache(url: &str, dest: &Path) -> Result<bool, AssetError> {
    if tokio::fs::try_exists(dest).await? {
        tracing::debug!(path = %dest.display(), "model artifact cached");
        return Ok(false);
    }

    tracing::info!(url, path = %dest.display(), "downloading model artifact");
    let download_err = |source| AssetError::Download {
        url: url.to_string(),
        source,
    };
    let bytes = reqwest::get(url)
        .await
        .and_then(|r| r.error_for_status())
        .map_err(download_err)?
        .bytes()
        .await
        .map_err(download_err)?;

    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    // Write-then-rename so an interrupted download never looks cached.
    let partial = dest.with_extension("part");
    tokio::fs::write(&partial, &bytes).await?;
    tokio::fs::rename(&partial, dest).await?;

    tracing::info!(path = %dest.display(), bytes = bytes.len(), "model artifact downloaded");
    Ok(true)
}

async fn verify(path: &Path, expected: Option<&str>) -> Result<(), AssetError> {
    let Some(expected) = expected else {
        return Ok(());
    };
    let data = tokio::fs::read(path).await?;
    let actual = sha256_hex(&data);
    if !actual.eq_ignore_ascii_case(expected) {
        return Err(AssetError::DigestMismatch {
            path: path.to_path_buf(),
            expected: expected.to_string(),
            actual,
        });
    }
    Ok(())
}

fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    const EMPTY_SHA256: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    fn write_models(dir: &Path) {
        std::fs::create_dir_all(dir).unwrap();
        std::fs::write(dir.join(DETECTOR_FILE), b"").unwrap();
        std::fs::write(dir.join(RECOGNIZER_FILE), b"").unwrap();
    }

    #[test]
    fn test_sha256_hex() {
        assert_eq!(sha256_hex(b""), EMPTY_SHA256);
    }

    #[test]
    fn test_artifact_url_trims_slash() {
        assert_eq!(
            artifact_url("https://models.example/facesift/", "buffalo_l", DETECTOR_FILE),
            "https://models.example/facesift/buffalo_l/det_10g.onnx"
        );
    }

    #[tokio::test]
    async fn test_local_missing_model() {
        let tmp = tempfile::tempdir().unwrap();
        let err = ModelAssets::local(tmp.path()).resolve().await.unwrap_err();
        assert!(matches!(err, AssetError::Missing(p) if p.ends_with(DETECTOR_FILE)));
    }

    #[tokio::test]
    async fn test_local_with_matching_pins() {
        let tmp = tempfile::tempdir().unwrap();
        write_models(tmp.path());
        let mut assets = ModelAssets::local(tmp.path());
        assets.pins.detector_sha256 = Some(EMPTY_SHA256.to_uppercase());
        let paths = assets.resolve().await.unwrap();
        assert_eq!(paths.recognizer, tmp.path().join(RECOGNIZER_FILE));
    }

    #[tokio::test]
    async fn test_local_pin_mismatch_keeps_file() {
        let tmp = tempfile::tempdir().unwrap();
        write_models(tmp.path());
        let mut assets = ModelAssets::local(tmp.path());
        assets.pins.recognizer_sha256 = Some("00".repeat(32));
        let err = assets.resolve().await.unwrap_err();
        assert!(matches!(err, AssetError::DigestMismatch { .. }));
        assert!(tmp.path().join(RECOGNIZER_FILE).exists());
    }

    #[tokio::test]
    async fn test_remote_uses_versioned_cache_without_network() {
        let tmp = tempfile::tempdir().unwrap();
        write_models(&tmp.path().join("v2"));
        let assets = ModelAssets {
            source: ModelSource::Remote {
                base_url: "http://127.0.0.1:9/unreachable".into(),
                cache_dir: tmp.path().to_path_buf(),
                version: "v2".into(),
            },
            pins: ModelPins::default(),
        };
        let paths = assets.resolve().await.unwrap();
        assert_eq!(paths.detector, tmp.path().join("v2").join(DETECTOR_FILE));
    }
}
