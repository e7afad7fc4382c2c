use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Which D-Bus bus the daemon registers on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    Session,
    System,
}

/// Daemon configuration.
///
/// Resolved in three layers: built-in defaults, then an optional TOML file,
/// then `FACETRACK_*` environment variables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// V4L2 device path.
    pub camera_device: String,
    /// Directory containing the detector and recognizer ONNX models.
    pub model_dir: PathBuf,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    pub bus: BusKind,
    /// Dimension every stored and live embedding must have.
    pub embedding_dim: usize,
    /// Raw Euclidean tolerance; the squared-distance threshold is its square.
    /// Defaults to the value calibrated for the bundled ArcFace model (cosine
    /// 0.40); lower it when swapping in an embedder with a tighter scale.
    pub match_tolerance: f32,
    pub cache_capacity: usize,
    pub cache_ttl_secs: u64,
    /// Pause between processed frames.
    pub frame_interval_ms: u64,
    /// Poll interval while the schedule window is closed.
    pub idle_poll_secs: u64,
    /// Pause after a failed frame read.
    pub read_retry_ms: u64,
    /// Minimum spacing of periodic status events.
    pub status_interval_secs: u64,
    /// How long stop() waits for the worker to exit.
    pub stop_timeout_secs: u64,
    /// Frames discarded after opening the camera (AGC/AE stabilization).
    pub warmup_frames: usize,
    /// Buffer of the in-process event bus.
    pub event_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| home_dir().join(".local/share"))
            .join("facetrack");

        Self {
            camera_device: "/dev/video0".to_string(),
            model_dir: data_dir.join("models"),
            db_path: data_dir.join("identities.db"),
            bus: BusKind::Session,
            embedding_dim: 512,
            match_tolerance: facetrack_core::ARCFACE_MATCH_TOLERANCE,
            cache_capacity: facetrack_core::recency::DEFAULT_CAPACITY,
            cache_ttl_secs: facetrack_core::recency::DEFAULT_TTL.as_secs(),
            frame_interval_ms: 1000,
            idle_poll_secs: 30,
            read_retry_ms: 1000,
            status_interval_secs: 5,
            stop_timeout_secs: 5,
            warmup_frames: 4,
            event_capacity: 64,
        }
    }
}

fn home_dir() -> PathBuf {
    PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string()))
}

/// Default config file location: `$XDG_CONFIG_HOME/facetrack/facetrackd.toml`.
pub fn default_config_path() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
        .join("facetrack")
        .join("facetrackd.toml")
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

impl Config {
    /// Load defaults, the config file (`FACETRACK_CONFIG` or the default
    /// path, if present) and environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let explicit = std::env::var("FACETRACK_CONFIG").ok().map(PathBuf::from);
        let path = explicit.clone().unwrap_or_else(default_config_path);

        let mut config = if explicit.is_some() || path.exists() {
            Self::from_file(&path)?
        } else {
            Self::default()
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Parse a TOML file; missing keys keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Apply `FACETRACK_*` overrides. Unparseable values are ignored with a
    /// warning.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("FACETRACK_CAMERA_DEVICE") {
            self.camera_device = v;
        }
        if let Some(v) = lookup("FACETRACK_MODEL_DIR") {
            self.model_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("FACETRACK_DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("FACETRACK_BUS") {
            match v.as_str() {
                "session" => self.bus = BusKind::Session,
                "system" => self.bus = BusKind::System,
                other => tracing::warn!(value = other, "ignoring FACETRACK_BUS"),
            }
        }
        env_parse(&lookup, "FACETRACK_EMBEDDING_DIM", &mut self.embedding_dim);
        env_parse(&lookup, "FACETRACK_MATCH_TOLERANCE", &mut self.match_tolerance);
        env_parse(&lookup, "FACETRACK_CACHE_CAPACITY", &mut self.cache_capacity);
        env_parse(&lookup, "FACETRACK_CACHE_TTL_SECS", &mut self.cache_ttl_secs);
        env_parse(&lookup, "FACETRACK_FRAME_INTERVAL_MS", &mut self.frame_interval_ms);
        env_parse(&lookup, "FACETRACK_IDLE_POLL_SECS", &mut self.idle_poll_secs);
        env_parse(&lookup, "FACETRACK_READ_RETRY_MS", &mut self.read_retry_ms);
        env_parse(&lookup, "FACETRACK_STATUS_INTERVAL_SECS", &mut self.status_interval_secs);
        env_parse(&lookup, "FACETRACK_STOP_TIMEOUT_SECS", &mut self.stop_timeout_secs);
        env_parse(&lookup, "FACETRACK_WARMUP_FRAMES", &mut self.warmup_frames);
        env_parse(&lookup, "FACETRACK_EVENT_CAPACITY", &mut self.event_capacity);
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.frame_interval_ms)
    }

    pub fn idle_poll(&self) -> Duration {
        Duration::from_secs(self.idle_poll_secs)
    }

    pub fn read_retry(&self) -> Duration {
        Duration::from_millis(self.read_retry_ms)
    }

    pub fn status_interval(&self) -> Duration {
        Duration::from_secs(self.status_interval_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }
}

fn env_parse<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    slot: &mut T,
) {
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.parse() {
        Ok(v) => *slot = v,
        Err(_) => tracing::warn!(key, value = %raw, "ignoring unparseable override"),
    }
}
