use rollgate_core::DistanceMetric;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    Read(PathBuf, std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid value {value:?} for {key}")]
    Env { key: String, value: String },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// What to do with a card scan that arrives while a session is open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictPolicy {
    /// Refuse the new scan with `SESSION_CONFLICT`.
    #[default]
    Reject,
    /// Hold the scan until the current session resolves.
    Queue,
}

impl FromStr for ConflictPolicy {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reject" => Ok(ConflictPolicy::Reject),
            "queue" => Ok(ConflictPolicy::Queue),
            _ => Err(()),
        }
    }
}

/// Exponential backoff bounds for the local retry queues.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub base_ms: u64,
    pub max_ms: u64,
    pub multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_ms: 500,
            max_ms: 60_000,
            multiplier: 2.0,
        }
    }
}

/// Daemon configuration: defaults, then an optional TOML file
/// (`ROLLGATE_CONFIG`), then `ROLLGATE_*` environment variables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Identifier stamped on every record and evidence entry.
    pub station_id: String,
    /// Maximum embedding distance for a frame to count as a match.
    pub match_threshold: f32,
    pub distance_metric: DistanceMetric,
    /// Verification window opened by a card scan.
    pub session_timeout_ms: u64,
    /// Consecutive matching frames needed to accept.
    pub required_consecutive_matches: u32,
    /// Reject after this many consecutive non-matching faces (0 = never).
    pub reject_after_mismatches: u32,
    /// Pause between frame captures while a session is open.
    pub frame_interval_ms: u64,
    /// Time box for one embed + score call.
    pub matcher_timeout_ms: u64,
    /// Time box for one call to the shared store.
    pub store_timeout_ms: u64,
    pub retry_backoff: BackoffConfig,
    pub conflict_policy: ConflictPolicy,
    /// Scans held while a session is open (queue policy only).
    pub scan_queue_depth: usize,
    /// Maximum age of a cached directory entry.
    pub directory_ttl_secs: u64,
    /// Verdicts kept for the operator view.
    pub verdict_history: usize,
    /// Camera window for grabbing a face on an unknown card (0 = off).
    pub unknown_card_capture_ms: u64,
    /// Distance under which two unknown faces share one evidence image.
    pub unknown_face_threshold: f32,
    /// V4L2 device path.
    pub camera_device: String,
    pub camera_width: u32,
    pub camera_height: u32,
    /// Keyboard-wedge reader device; scans arrive only over D-Bus when unset.
    pub reader_device: Option<String>,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Shared attendance database.
    pub db_path: PathBuf,
    /// Where stored evidence images live.
    pub evidence_dir: PathBuf,
    /// Local durable queues and spooled images.
    pub spool_dir: PathBuf,
    /// Serve on the session bus instead of the system bus.
    pub session_bus: bool,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = default_data_dir();
        Self {
            station_id: "station-1".to_string(),
            match_threshold: 0.50,
            distance_metric: DistanceMetric::Euclidean,
            session_timeout_ms: 10_000,
            required_consecutive_matches: 1,
            reject_after_mismatches: 0,
            frame_interval_ms: 100,
            matcher_timeout_ms: 2_000,
            store_timeout_ms: 5_000,
            retry_backoff: BackoffConfig::default(),
            conflict_policy: ConflictPolicy::Reject,
            scan_queue_depth: 4,
            directory_ttl_secs: 300,
            verdict_history: 50,
            unknown_card_capture_ms: 2_000,
            unknown_face_threshold: 0.50,
            camera_device: "/dev/video0".to_string(),
            camera_width: 640,
            camera_height: 480,
            reader_device: None,
            model_dir: rollgate_models::default_model_dir(),
            db_path: data_dir.join("attendance.db"),
            evidence_dir: data_dir.join("evidence"),
            spool_dir: data_dir.join("spool"),
            session_bus: false,
        }
    }
}

impl Config {
    /// Load configuration from the file named by `ROLLGATE_CONFIG` (if any)
    /// and `ROLLGATE_*` environment variables, then validate it.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var("ROLLGATE_CONFIG") {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Read(path.to_path_buf(), e))?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Overlay environment overrides. `get` abstracts the environment for tests.
    pub fn apply_env(&mut self, get: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        let get = &get;
        if let Some(v) = get("ROLLGATE_STATION_ID") {
            self.station_id = v;
        }
        env_parse(get, "ROLLGATE_MATCH_THRESHOLD", &mut self.match_threshold)?;
        if let Some(v) = get("ROLLGATE_DISTANCE_METRIC") {
            self.distance_metric = DistanceMetric::parse(&v).ok_or(ConfigError::Env {
                key: "ROLLGATE_DISTANCE_METRIC".into(),
                value: v,
            })?;
        }
        env_parse(get, "ROLLGATE_SESSION_TIMEOUT_MS", &mut self.session_timeout_ms)?;
        env_parse(get, "ROLLGATE_REQUIRED_MATCHES", &mut self.required_consecutive_matches)?;
        env_parse(get, "ROLLGATE_REJECT_AFTER_MISMATCHES", &mut self.reject_after_mismatches)?;
        env_parse(get, "ROLLGATE_FRAME_INTERVAL_MS", &mut self.frame_interval_ms)?;
        env_parse(get, "ROLLGATE_MATCHER_TIMEOUT_MS", &mut self.matcher_timeout_ms)?;
        env_parse(get, "ROLLGATE_STORE_TIMEOUT_MS", &mut self.store_timeout_ms)?;
        env_parse(get, "ROLLGATE_RETRY_BASE_MS", &mut self.retry_backoff.base_ms)?;
        env_parse(get, "ROLLGATE_RETRY_MAX_MS", &mut self.retry_backoff.max_ms)?;
        env_parse(get, "ROLLGATE_RETRY_MULTIPLIER", &mut self.retry_backoff.multiplier)?;
        env_parse(get, "ROLLGATE_CONFLICT_POLICY", &mut self.conflict_policy)?;
        env_parse(get, "ROLLGATE_SCAN_QUEUE_DEPTH", &mut self.scan_queue_depth)?;
        env_parse(get, "ROLLGATE_DIRECTORY_TTL_SECS", &mut self.directory_ttl_secs)?;
        env_parse(get, "ROLLGATE_VERDICT_HISTORY", &mut self.verdict_history)?;
        env_parse(get, "ROLLGATE_UNKNOWN_CARD_CAPTURE_MS", &mut self.unknown_card_capture_ms)?;
        env_parse(get, "ROLLGATE_UNKNOWN_FACE_THRESHOLD", &mut self.unknown_face_threshold)?;
        if let Some(v) = get("ROLLGATE_CAMERA_DEVICE") {
            self.camera_device = v;
        }
        env_parse(get, "ROLLGATE_CAMERA_WIDTH", &mut self.camera_width)?;
        env_parse(get, "ROLLGATE_CAMERA_HEIGHT", &mut self.camera_height)?;
        if let Some(v) = get("ROLLGATE_READER_DEVICE") {
            self.reader_device = (!v.is_empty()).then_some(v);
        }
        env_path(get, "ROLLGATE_MODEL_DIR", &mut self.model_dir);
        env_path(get, "ROLLGATE_DB_PATH", &mut self.db_path);
        env_path(get, "ROLLGATE_EVIDENCE_DIR", &mut self.evidence_dir);
        env_path(get, "ROLLGATE_SPOOL_DIR", &mut self.spool_dir);
        if let Some(v) = get("ROLLGATE_SESSION_BUS") {
            self.session_bus = v != "0";
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));
        if self.station_id.trim().is_empty() {
            return invalid("station_id must not be empty");
        }
        if !(self.match_threshold > 0.0) {
            return invalid("match_threshold must be positive");
        }
        if self.session_timeout_ms == 0 {
            return invalid("session_timeout_ms must be positive");
        }
        if self.required_consecutive_matches < 1 {
            return invalid("required_consecutive_matches must be at least 1");
        }
        if self.frame_interval_ms == 0 || self.matcher_timeout_ms == 0 || self.store_timeout_ms == 0 {
            return invalid("frame, matcher and store intervals must be positive");
        }
        let backoff = &self.retry_backoff;
        if backoff.base_ms == 0 || backoff.base_ms > backoff.max_ms {
            return invalid("retry_backoff requires 0 < base_ms <= max_ms");
        }
        if !(backoff.multiplier >= 1.0 && backoff.multiplier.is_finite()) {
            return invalid("retry_backoff.multiplier must be finite and at least 1.0");
        }
        if self.verdict_history == 0 {
            return invalid("verdict_history must be positive");
        }
        Ok(())
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    pub fn directory_ttl(&self) -> Duration {
        Duration::from_secs(self.directory_ttl_secs)
    }

    /// Attendance records waiting for the shared store.
    pub fn ledger_queue_path(&self) -> PathBuf {
        self.spool_dir.join("ledger.db")
    }

    /// Evidence entries waiting for the shared store.
    pub fn evidence_queue_path(&self) -> PathBuf {
        self.spool_dir.join("evidence.db")
    }

    pub fn spool_image_dir(&self) -> PathBuf {
        self.spool_dir.join("images")
    }
}

fn default_data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("rollgate")
}

fn env_parse<T: FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
    slot: &mut T,
) -> Result<(), ConfigError> {
    if let Some(value) = get(key) {
        *slot = value.trim().parse().map_err(|_| ConfigError::Env {
            key: key.to_string(),
            value,
        })?;
    }
    Ok(())
}

fn env_path(get: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut PathBuf) {
    if let Some(value) = get(key) {
        *slot = PathBuf::from(value);
    }
}
