use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Load environment variables from .env file with robust parsing.
/// Handles values with spaces without requiring quotes.
pub fn load_dotenv() {
    let env_path = Path::new(".env");
    if !env_path.exists() {
        return;
    }

    let content = match fs::read_to_string(env_path) {
        Ok(c) => c,
        Err(_) => return,
    };

    for line in content.lines() {
        let line = line.trim();

        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        if let Some(eq_pos) = line.find('=') {
            let key = line[..eq_pos].trim();
            let mut value = line[eq_pos + 1..].trim();

            if (value.starts_with('"') && value.ends_with('"'))
                || (value.starts_with('\'') && value.ends_with('\''))
            {
                value = &value[1..value.len() - 1];
            }

            // Env vars take precedence over the file
            if std::env::var(key).is_err() {
                // SAFETY: called from main before the async runtime starts any threads
                unsafe { std::env::set_var(key, value) };
            }
        }
    }
}

/// Missing fields and sections fall back to their defaults when loading.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub device_name: String,
    pub poll: PollConfig,
    pub notify: NotifyConfig,
    pub beam: BeamConfig,
    pub sources: SourceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    /// Refresh period for every proxied attribute, in milliseconds.
    pub interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    /// Per-subscriber queue bound; the oldest event is dropped on overflow.
    pub queue_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BeamConfig {
    /// Raw beam current (A) is multiplied by this to publish mA.
    pub scale_factor: f64,
    /// Beam current (mA) above which experiments may run.
    pub experiment_threshold_ma: f64,
}

/// Remote source tag for every proxied attribute.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub injection_status_tag: String,
    pub experiment_enable_tag: String,
    pub beam_current_attr: String,
    pub bim_state_tag: String,
    pub mps_state_tag: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device_name: "InformationForBeamlines".to_string(),
            poll: PollConfig::default(),
            notify: NotifyConfig::default(),
            beam: BeamConfig::default(),
            sources: SourceConfig::default(),
        }
    }
}

impl Default for PollConfig {
    fn default() -> Self {
        Self { interval_ms: 1000 }
    }
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self { queue_capacity: 64 }
    }
}

impl Default for BeamConfig {
    fn default() -> Self {
        Self {
            scale_factor: 1000.0,
            experiment_threshold_ma: 1.0,
        }
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            injection_status_tag: "mps/plc/1/InjectionStatus".to_string(),
            experiment_enable_tag: "mps/plc/1/ExperimentEnable".to_string(),
            beam_current_attr: "diag/bim/1/Current".to_string(),
            bim_state_tag: "diag/bim/1/State".to_string(),
            mps_state_tag: "mps/plc/1/State".to_string(),
        }
    }
}

impl PollConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }
}

impl Config {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    /// Load a JSON config file, then apply environment overrides on top.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let mut config: Self = serde_json::from_str(&content)?;
        config.apply_env();
        Ok(config)
    }

    /// Default config file location (`<config dir>/beamline-info-bridge/config.json`).
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("beamline-info-bridge").join("config.json"))
    }

    fn apply_env(&mut self) {
        if let Ok(name) = std::env::var("DEVICE_NAME") {
            self.device_name = name;
        }
        if let Ok(interval) = std::env::var("POLL_INTERVAL_MS")
            && let Ok(i) = interval.parse()
        {
            self.poll.interval_ms = i;
        }
        if let Ok(capacity) = std::env::var("NOTIFY_QUEUE_CAPACITY")
            && let Ok(c) = capacity.parse()
        {
            self.notify.queue_capacity = c;
        }
        if let Ok(scale) = std::env::var("BEAM_SCALE_FACTOR")
            && let Ok(s) = scale.parse()
        {
            self.beam.scale_factor = s;
        }
        if let Ok(threshold) = std::env::var("EXPERIMENT_THRESHOLD_MA")
            && let Ok(t) = threshold.parse()
        {
            self.beam.experiment_threshold_ma = t;
        }

        // Remote source tags
        if let Ok(tag) = std::env::var("INJECTION_STATUS_TAG") {
            self.sources.injection_status_tag = tag;
        }
        if let Ok(tag) = std::env::var("EXPERIMENT_ENABLE_TAG") {
            self.sources.experiment_enable_tag = tag;
        }
        if let Ok(attr) = std::env::var("BEAM_CURRENT_ATTR") {
            self.sources.beam_current_attr = attr;
        }
        if let Ok(tag) = std::env::var("BIM_STATE_TAG") {
            self.sources.bim_state_tag = tag;
        }
        if let Ok(tag) = std::env::var("MPS_STATE_TAG") {
            self.sources.mps_state_tag = tag;
        }
    }
}
