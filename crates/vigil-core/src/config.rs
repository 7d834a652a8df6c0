use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

const DEFAULT_CAPTION_FONT: &str = "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("reading config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Storage locations and tuning shared by every component.
///
/// Resolution order: built-in defaults, then the TOML file (if given and
/// present), then `VIGIL_*` environment variables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory of enrolled identity templates.
    pub registry_dir: PathBuf,
    /// JSON event log file.
    pub event_log: PathBuf,
    /// Directory for annotated output images.
    pub output_dir: PathBuf,
    /// Directory containing `det_10g.onnx` and `w600k_r50.onnx`.
    pub model_dir: PathBuf,
    /// Audio file played on an unauthorised face.
    pub alert_sound: PathBuf,
    /// Player command; the sound path is appended as the last argument.
    pub alert_player: String,
    pub alert_timeout_secs: u64,
    /// TrueType font for captions on annotated images.
    pub caption_font: PathBuf,
    /// Cosine similarity a match must strictly exceed.
    pub similarity_threshold: f32,
    /// Minimum detector confidence for a face to be reported.
    pub detection_threshold: f32,
}

impl Default for Config {
    fn default() -> Self {
        Self::rooted_at(&default_data_dir())
    }
}

impl Config {
    /// Defaults with every path under `root`.
    pub fn rooted_at(root: &Path) -> Self {
        Self {
            registry_dir: root.join("registered_faces"),
            event_log: root.join("logs").join("event_log.json"),
            output_dir: root.join("output_img"),
            model_dir: root.join("models"),
            alert_sound: root.join("alert").join("alert.wav"),
            alert_player: "paplay".to_string(),
            alert_timeout_secs: 5,
            caption_font: PathBuf::from(DEFAULT_CAPTION_FONT),
            similarity_threshold: crate::matcher::DEFAULT_THRESHOLD,
            detection_threshold: 0.5,
        }
    }

    /// Load from an optional TOML file and apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = Self::from_file(path)?;
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Defaults overlaid with an optional TOML file, without environment
    /// overrides. A path that does not exist falls back to defaults.
    pub fn from_file(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match path {
            Some(path) if path.exists() => {
                let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })?;
                Self::from_toml(&raw).map_err(|source| ConfigError::Parse {
                    path: path.to_path_buf(),
                    source,
                })?
            }
            Some(path) => {
                tracing::debug!(path = %path.display(), "config file absent; using defaults");
                Self::default()
            }
            None => Self::default(),
        };
        Ok(config)
    }

    pub fn from_toml(raw: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(raw)
    }

    /// Override fields from `VIGIL_*` variables. Unparseable numbers are ignored.
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(v) = var("VIGIL_REGISTRY_DIR") {
            self.registry_dir = PathBuf::from(v);
        }
        if let Some(v) = var("VIGIL_EVENT_LOG") {
            self.event_log = PathBuf::from(v);
        }
        if let Some(v) = var("VIGIL_OUTPUT_DIR") {
            self.output_dir = PathBuf::from(v);
        }
        if let Some(v) = var("VIGIL_MODEL_DIR") {
            self.model_dir = PathBuf::from(v);
        }
        if let Some(v) = var("VIGIL_ALERT_SOUND") {
            self.alert_sound = PathBuf::from(v);
        }
        if let Some(v) = var("VIGIL_ALERT_PLAYER") {
            self.alert_player = v;
        }
        if let Some(v) = var("VIGIL_CAPTION_FONT") {
            self.caption_font = PathBuf::from(v);
        }
        if let Some(v) = var("VIGIL_ALERT_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
            self.alert_timeout_secs = v;
        }
        if let Some(v) = var("VIGIL_SIMILARITY_THRESHOLD").and_then(|v| v.parse().ok()) {
            self.similarity_threshold = v;
        }
        if let Some(v) = var("VIGIL_DETECTION_THRESHOLD").and_then(|v| v.parse().ok()) {
            self.detection_threshold = v;
        }
    }

    /// Path to the SCRFD detection model.
    pub fn scrfd_model_path(&self) -> PathBuf {
        self.model_dir.join("det_10g.onnx")
    }

    /// Path to the ArcFace recognition model.
    pub fn arcface_model_path(&self) -> PathBuf {
        self.model_dir.join("w600k_r50.onnx")
    }
}

fn default_data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("vigil")
}
