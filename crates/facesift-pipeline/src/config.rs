//! Runtime configuration: a TOML file with defaults, then `FACESIFT_*`
//! environment overrides.

use crate::assets::{ModelAssets, ModelPins, ModelSource, DEFAULT_MODEL_VERSION};
use crate::engine::OracleSettings;
use crate::schedule::{CooperativeYield, IdleSignalYield, Yielder};
use facesift_core::recognizer::{ARCFACE_EMBEDDING_DIM, ARCFACE_MODEL_VERSION};
use facesift_core::{DetectorOptions, Metric, RecognizerOptions, ScorerConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root for the database, blobs and the model cache.
    pub data_dir: PathBuf,
    pub models: ModelConfig,
    pub matching: MatchingConfig,
    pub runtime: RuntimeConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Local directory holding `det_10g.onnx` and `w600k_r50.onnx`.
    /// Takes precedence over `url`.
    pub dir: Option<PathBuf>,
    /// Base URL of a model mirror; artifacts live at `<url>/<version>/<file>`.
    pub url: Option<String>,
    pub version: String,
    pub embedding_dim: usize,
    pub detector_sha256: Option<String>,
    pub recognizer_sha256: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchingConfig {
    pub metric: Metric,
    /// Decision threshold; the metric's default when unset.
    pub threshold: Option<f32>,
    pub detection_threshold: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub intra_threads: usize,
    /// Pause between photos. 0 means a plain task yield; a non-zero value
    /// waits up to that long for a host idle signal.
    pub yield_max_wait_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            models: ModelConfig::default(),
            matching: MatchingConfig::default(),
            runtime: RuntimeConfig::default(),
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            dir: None,
            url: None,
            version: DEFAULT_MODEL_VERSION.to_string(),
            embedding_dim: ARCFACE_EMBEDDING_DIM,
            detector_sha256: None,
            recognizer_sha256: None,
        }
    }
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            metric: Metric::Cosine,
            threshold: None,
            detection_threshold: DetectorOptions::default().score_threshold,
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            intra_threads: 2,
            yield_max_wait_ms: 0,
        }
    }
}

impl Config {
    /// Load `path` if given, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply `FACESIFT_*` overrides read through `lookup`. Unparseable values
    /// are logged and ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("FACESIFT_DATA_DIR") {
            self.data_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("FACESIFT_MODEL_DIR") {
            self.models.dir = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("FACESIFT_MODEL_URL") {
            self.models.url = Some(v);
        }
        if let Some(m) = parsed::<Metric>(&lookup, "FACESIFT_METRIC") {
            self.matching.metric = m;
        }
        if let Some(t) = parsed::<f32>(&lookup, "FACESIFT_MATCH_THRESHOLD") {
            self.matching.threshold = Some(t);
        }
        if let Some(t) = parsed::<f32>(&lookup, "FACESIFT_DETECTION_THRESHOLD") {
            self.matching.detection_threshold = t;
        }
        if let Some(ms) = parsed::<u64>(&lookup, "FACESIFT_YIELD_MAX_WAIT_MS") {
            self.runtime.yield_max_wait_ms = ms;
        }
        if let Some(n) = parsed::<usize>(&lookup, "FACESIFT_INTRA_THREADS") {
            self.runtime.intra_threads = n;
        }
    }

    pub fn scorer_config(&self) -> ScorerConfig {
        let config = ScorerConfig::new(self.matching.metric);
        match self.matching.threshold {
            Some(t) => config.with_threshold(t),
            None => config,
        }
    }

    pub fn model_assets(&self) -> ModelAssets {
        let source = match (&self.models.dir, &self.models.url) {
            (Some(dir), _) => ModelSource::Local { dir: dir.clone() },
            (None, Some(url)) => ModelSource::Remote {
                base_url: url.clone(),
                cache_dir: self.data_dir.join("models"),
                version: self.models.version.clone(),
            },
            (None, None) => ModelSource::Local {
                dir: self.data_dir.join("models").join(&self.models.version),
            },
        };
        ModelAssets {
            source,
            pins: ModelPins {
                detector_sha256: self.models.detector_sha256.clone(),
                recognizer_sha256: self.models.recognizer_sha256.clone(),
            },
        }
    }

    pub fn oracle_settings(&self) -> OracleSettings {
        OracleSettings {
            assets: self.model_assets(),
            detector: DetectorOptions {
                score_threshold: self.matching.detection_threshold,
                intra_threads: self.runtime.intra_threads,
                ..DetectorOptions::default()
            },
            recognizer: RecognizerOptions {
                embedding_dim: self.models.embedding_dim,
                normalize: self.matching.metric.requires_unit_vectors(),
                intra_threads: self.runtime.intra_threads,
                model_version: ARCFACE_MODEL_VERSION.to_string(),
            },
        }
    }

    pub fn yield_max_wait(&self) -> Duration {
        Duration::from_millis(self.runtime.yield_max_wait_ms)
    }

    /// Scheduler for the gap between photos.
    pub fn yielder(&self) -> Arc<dyn Yielder> {
        if self.runtime.yield_max_wait_ms == 0 {
            Arc::new(CooperativeYield)
        } else {
            Arc::new(IdleSignalYield::new(self.yield_max_wait()))
        }
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("facesift.db")
    }

    pub fn blob_dir(&self) -> PathBuf {
        self.data_dir.join("blobs")
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparseable override");
            None
        }
    }
}

fn default_data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("facesift")
}
