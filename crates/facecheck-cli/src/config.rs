use facecheck_core::liveness::LivenessConfig;
use facecheck_core::{PipelineConfig, PipelineModels};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// CLI configuration: an optional TOML file overlaid by `FACECHECK_*` variables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory containing the ONNX model files.
    pub model_dir: PathBuf,
    /// JSON file holding enrolled gallery entries.
    pub gallery_path: PathBuf,
    /// Cosine similarity threshold for a positive match.
    pub similarity_threshold: f32,
    /// Timeout in seconds for a single pipeline run.
    pub timeout_secs: u64,
    pub pipeline: PipelineConfig,
    pub models: PipelineModels,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = data_dir(&|key: &str| std::env::var(key).ok());
        Self {
            model_dir: data_dir.join("models"),
            gallery_path: data_dir.join("gallery.json"),
            similarity_threshold: 0.40,
            timeout_secs: 10,
            pipeline: PipelineConfig::default(),
            models: PipelineModels::default(),
        }
    }
}

impl Config {
    /// Load from `FACECHECK_CONFIG` (if set) and then `FACECHECK_*` overrides.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_sources(|key| std::env::var(key).ok())
    }

    /// Same as [`Config::from_env`] with an injectable variable lookup.
    pub fn from_sources<F>(var: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = match var("FACECHECK_CONFIG") {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Self::default(),
        };
        config.apply_overrides(&var);
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(toml::from_str(&text)?)
    }

    fn apply_overrides(&mut self, var: &dyn Fn(&str) -> Option<String>) {
        if let Some(dir) = var("FACECHECK_MODEL_DIR") {
            self.model_dir = PathBuf::from(dir);
        }
        if let Some(path) = var("FACECHECK_GALLERY_PATH") {
            self.gallery_path = PathBuf::from(path);
        }
        set_parsed(var, "FACECHECK_SIMILARITY_THRESHOLD", &mut self.similarity_threshold);
        set_parsed(var, "FACECHECK_TIMEOUT_SECS", &mut self.timeout_secs);

        let models = &mut self.models;
        set_string(var, "FACECHECK_DETECTOR_MODEL", &mut models.detector.model.file_name);
        set_string(var, "FACECHECK_POSE_MODEL", &mut models.pose.model.file_name);
        set_string(var, "FACECHECK_EMBEDDING_MODEL", &mut models.recognizer.model.file_name);
        set_parsed(
            var,
            "FACECHECK_CONFIDENCE_THRESHOLD",
            &mut models.detector.decoder.confidence_threshold,
        );

        match var("FACECHECK_LIVENESS_ENABLED").as_deref() {
            Some("0") => models.liveness = None,
            Some(_) => {
                models.liveness.get_or_insert_with(LivenessConfig::default);
            }
            None => {}
        }
        if let Some(liveness) = models.liveness.as_mut() {
            set_string(var, "FACECHECK_LIVENESS_MODEL", &mut liveness.model.file_name);
        }

        let pipeline = &mut self.pipeline;
        set_parsed(var, "FACECHECK_BLUR_THRESHOLD", &mut pipeline.quality.blur_threshold);
        if let Some(v) = var("FACECHECK_REQUIRE_LIVE") {
            pipeline.require_live = v != "0";
        }
    }

    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.timeout_secs)
    }
}

fn data_dir(var: &dyn Fn(&str) -> Option<String>) -> PathBuf {
    var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            let home = var("HOME").unwrap_or_else(|| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("facecheck")
}

fn set_string(var: &dyn Fn(&str) -> Option<String>, key: &str, target: &mut String) {
    if let Some(v) = var(key) {
        *target = v;
    }
}

/// Unparseable values are ignored with a warning, keeping the current value.
fn set_parsed<T: std::str::FromStr>(
    var: &dyn Fn(&str) -> Option<String>,
    key: &str,
    target: &mut T,
) {
    let Some(raw) = var(key) else {
        return;
    };
    match raw.parse() {
        Ok(v) => *target = v,
        Err(_) => tracing::warn!(key, value = %raw, "ignoring unparseable setting"),
    }
}
