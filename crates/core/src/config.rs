use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StudioConfig {
    /// Buckets per clip waveform summary.
    pub waveform_buckets: usize,
    /// How often the display loop publishes a frame.
    pub display_refresh_ms: u64,
    /// Slots in the control → audio thread command ring.
    pub command_queue_capacity: usize,
    /// Seconds of input the capture ring can hold between polls.
    pub capture_buffer_secs: f32,
}

impl Default for StudioConfig {
    fn default() -> Self {
        Self {
            waveform_buckets: 200,
            display_refresh_ms: 16,
            command_queue_capacity: 1024,
            capture_buffer_secs: 4.0,
        }
    }
}

impl StudioConfig {
    fn config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("studio").join("config.toml"))
    }

    pub fn display_refresh(&self) -> Duration {
        Duration::from_millis(self.display_refresh_ms.max(1))
    }

    pub fn load() -> Self {
        let Some(path) = Self::config_path() else {
            return Self::default();
        };

        match fs::read_to_string(&path) {
            Ok(contents) => Self::from_toml(&contents),
            Err(_) => Self::default(),
        }
    }

    pub fn from_toml(contents: &str) -> Self {
        toml::from_str(contents).unwrap_or_else(|e| {
            log::warn!("ignoring malformed config: {e}");
            Self::default()
        })
    }

    pub fn save(&self) {
        let Some(path) = Self::config_path() else {
            return;
        };

        if let Some(parent) = path.parent() {
            let _ = fs::create_dir_all(parent);
        }

        match toml::to_string_pretty(self) {
            Ok(contents) => {
                if let Err(e) = fs::write(&path, contents) {
                    log::warn!("could not write {}: {e}", path.display());
                }
            }
            Err(e) => log::warn!("could not serialize config: {e}"),
        }
    }
}
