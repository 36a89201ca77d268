use persona_core::analyzer::CandidatePolicy;
use persona_core::cascade::{DEFAULT_BACKEND_TIMEOUT, DEFAULT_PRIMARY_THRESHOLD, DEFAULT_SECONDARY_THRESHOLD};
use persona_core::certainty::CertaintyThresholds;
use persona_core::frame::DEFAULT_FRAME_SIZE;
use persona_core::pipeline::{DEFAULT_MAX_FRAMES, DEFAULT_MAX_WORKERS};
use persona_models::genderage::DEFAULT_ATTRIBUTE_LABELS;
use persona_models::BackendConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 60;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Daemon configuration.
///
/// Built from defaults, then the TOML file named by `PERSONA_CONFIG` (if
/// any), then `PERSONA_*` environment variables, each layer overriding the
/// previous one.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Decision labels, in tie-break priority order.
    pub labels: Vec<String>,
    /// Label names for the attribute model's two output slots.
    pub attribute_labels: [String; 2],
    /// Early-stop gate on the winning label's probability.
    pub primary_threshold: f32,
    /// Early-stop gate on face detection confidence.
    pub secondary_threshold: f32,
    pub backend_timeout: Duration,
    /// Upper bound on a whole analyze request.
    pub request_timeout: Duration,
    pub max_workers: usize,
    pub max_frames: usize,
    pub candidate_policy: CandidatePolicy,
    /// Square resize edge applied before detection; 0 disables resizing.
    pub resize: u32,
    pub certainty: CertaintyThresholds,
    /// Cascade backends in priority order.
    pub backends: Vec<BackendConfig>,
}

/// On-disk overlay. Every field is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    model_dir: Option<PathBuf>,
    labels: Option<Vec<String>>,
    attribute_labels: Option<[String; 2]>,
    primary_threshold: Option<f32>,
    secondary_threshold: Option<f32>,
    backend_timeout_ms: Option<u64>,
    request_timeout_secs: Option<u64>,
    max_workers: Option<usize>,
    max_frames: Option<usize>,
    candidate_policy: Option<CandidatePolicy>,
    resize: Option<u32>,
    certainty: Option<CertaintyThresholds>,
    backends: Option<Vec<BackendConfig>>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            model_dir: default_model_dir(|key| std::env::var(key).ok()),
            labels: vec!["man".into(), "woman".into()],
            attribute_labels: DEFAULT_ATTRIBUTE_LABELS.map(str::to_string),
            primary_threshold: DEFAULT_PRIMARY_THRESHOLD,
            secondary_threshold: DEFAULT_SECONDARY_THRESHOLD,
            backend_timeout: DEFAULT_BACKEND_TIMEOUT,
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            max_workers: DEFAULT_MAX_WORKERS,
            max_frames: DEFAULT_MAX_FRAMES,
            candidate_policy: CandidatePolicy::default(),
            resize: DEFAULT_FRAME_SIZE,
            certainty: CertaintyThresholds::default(),
            backends: BackendConfig::default_cascade(),
        }
    }
}

impl Config {
    /// Load configuration from `PERSONA_CONFIG` and `PERSONA_*` environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_with(|key| std::env::var(key).ok())
    }

    fn load_with(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self {
            model_dir: default_model_dir(&lookup),
            ..Self::default()
        };
        if let Some(path) = lookup("PERSONA_CONFIG") {
            let file = read_file(Path::new(&path))?;
            tracing::info!(path = %path, "loaded config file");
            config.apply_file(file);
        }
        config.apply_env(&lookup);
        Ok(config)
    }

    fn apply_file(&mut self, file: FileConfig) {
        if let Some(v) = file.model_dir {
            self.model_dir = v;
        }
        if let Some(v) = file.labels {
            self.labels = v;
        }
        if let Some(v) = file.attribute_labels {
            self.attribute_labels = v;
        }
        if let Some(v) = file.primary_threshold {
            self.primary_threshold = v;
        }
        if let Some(v) = file.secondary_threshold {
            self.secondary_threshold = v;
        }
        if let Some(v) = file.backend_timeout_ms {
            self.backend_timeout = Duration::from_millis(v);
        }
        if let Some(v) = file.request_timeout_secs {
            self.request_timeout = Duration::from_secs(v);
        }
        if let Some(v) = file.max_workers {
            self.max_workers = v;
        }
        if let Some(v) = file.max_frames {
            self.max_frames = v;
        }
        if let Some(v) = file.candidate_policy {
            self.candidate_policy = v;
        }
        if let Some(v) = file.resize {
            self.resize = v;
        }
        if let Some(v) = file.certainty {
            self.certainty = v;
        }
        if let Some(v) = file.backends {
            self.backends = v;
        }
    }

    fn apply_env(&mut self, lookup: &impl Fn(&str) -> Option<String>) {
        if let Some(dir) = lookup("PERSONA_MODEL_DIR") {
            self.model_dir = PathBuf::from(dir);
        }
        if let Some(labels) = lookup("PERSONA_LABELS") {
            self.labels = labels
                .split(',')
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(str::to_string)
                .collect();
        }
        self.primary_threshold = env_parse(lookup, "PERSONA_PRIMARY_THRESHOLD", self.primary_threshold);
        self.secondary_threshold = env_parse(lookup, "PERSONA_SECONDARY_THRESHOLD", self.secondary_threshold);
        self.backend_timeout = Duration::from_millis(env_parse(
            lookup,
            "PERSONA_BACKEND_TIMEOUT_MS",
            self.backend_timeout.as_millis() as u64,
        ));
        self.request_timeout = Duration::from_secs(env_parse(
            lookup,
            "PERSONA_REQUEST_TIMEOUT_SECS",
            self.request_timeout.as_secs(),
        ));
        self.max_workers = env_parse(lookup, "PERSONA_MAX_WORKERS", self.max_workers);
        self.max_frames = env_parse(lookup, "PERSONA_MAX_FRAMES", self.max_frames);
        self.candidate_policy = env_parse(lookup, "PERSONA_CANDIDATE_POLICY", self.candidate_policy);
        self.resize = env_parse(lookup, "PERSONA_RESIZE", self.resize);
    }
}

fn read_file(path: &Path) -> Result<FileConfig, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn default_model_dir(lookup: impl Fn(&str) -> Option<String>) -> PathBuf {
    lookup("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            let home = lookup("HOME").unwrap_or_else(|| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("persona/models")
}

/// Parse `key` if set; unparseable values keep the current setting.
fn env_parse<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, current: T) -> T {
    match lookup(key) {
        Some(raw) => match raw.trim().parse() {
            Ok(v) => v,
            Err(_) => {
                tracing::warn!(key, value = %raw, "ignoring unparseable setting");
                current
            }
        },
        None => current,
    }
}
