//! Engine settings.
//!
//! A single serde struct with per-section defaults. Loaded from an optional
//! JSON file; anything missing falls back to the defaults below. Unknown keys
//! are ignored so older config files keep working.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub protocol: ProtocolSettings,
    pub http: HttpSettings,
    pub roots: RootsSettings,
    pub trace: TraceSettings,
    pub memory: MemorySettings,
    pub llm: LlmSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            protocol: ProtocolSettings::default(),
            http: HttpSettings::default(),
            roots: RootsSettings::default(),
            trace: TraceSettings::default(),
            memory: MemorySettings::default(),
            llm: LlmSettings::default(),
        }
    }
}

impl Settings {
    /// Load from a JSON file, falling back to defaults when `path` is None.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = std::fs::read_to_string(path)?;
        let settings = serde_json::from_str(&text)?;
        Ok(settings)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProtocolSettings {
    /// Budget attached to outgoing acks.
    pub ack_wait_ms: u64,
    /// Frames above this many bytes are rejected with FRAME_TOO_LARGE.
    pub max_frame_bytes: usize,
    /// Budget applied to requests that carry none of their own.
    pub default_budget_ms: u64,
    /// Hard ceiling for any request budget.
    pub max_budget_ms: u64,
    /// Connection closes when no heartbeat arrives within this window.
    pub heartbeat_timeout_ms: u64,
    /// Advisory per-lane in-flight cap (handlers backpressure past it).
    pub max_in_flight_per_lane: usize,
}

impl Default for ProtocolSettings {
    fn default() -> Self {
        Self {
            ack_wait_ms: 250,
            max_frame_bytes: 1_000_000,
            default_budget_ms: 15_000,
            max_budget_ms: 120_000,
            heartbeat_timeout_ms: 45_000,
            max_in_flight_per_lane: 8,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HttpSettings {
    pub port: u16,
    pub cookie_same_site: String,
    pub cookie_secure: bool,
    pub cookie_max_age_sec: u64,
    /// Directory mounted at `/` (after all API routes).
    pub static_dir: String,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            port: 8300,
            cookie_same_site: "lax".into(),
            cookie_secure: false,
            cookie_max_age_sec: 60 * 60 * 24 * 30,
            static_dir: "frontend".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RootsSettings {
    /// Whether pack discovery follows symlinked directories.
    pub follow_symlinks: bool,
}

impl Default for RootsSettings {
    fn default() -> Self {
        Self {
            follow_symlinks: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TraceSettings {
    pub buffer_capacity: usize,
    pub subscriber_queue: usize,
}

impl Default for TraceSettings {
    fn default() -> Self {
        Self {
            buffer_capacity: 5000,
            subscriber_queue: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MemorySettings {
    pub max_versions_per_key: usize,
    pub save_debounce_ms: u64,
    pub save_max_interval_ms: u64,
    pub save_max_dirty_items: usize,
}

impl Default for MemorySettings {
    fn default() -> Self {
        Self {
            max_versions_per_key: 3,
            save_debounce_ms: 0,
            save_max_interval_ms: 0,
            save_max_dirty_items: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LlmSettings {
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8080/v1".into(),
            model: "default".into(),
            api_key: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_sane() {
        let settings = Settings::default();
        assert_eq!(settings.protocol.max_frame_bytes, 1_000_000);
        assert_eq!(settings.protocol.ack_wait_ms, 250);
        assert_eq!(settings.trace.buffer_capacity, 5000);
        assert_eq!(settings.memory.max_versions_per_key, 3);
    }

    #[test]
    fn partial_file_fills_missing_sections() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"http": {{"port": 9100}}, "unknownSection": 1}}"#).unwrap();
        let settings = Settings::load(Some(file.path())).unwrap();
        assert_eq!(settings.http.port, 9100);
        // Untouched sections keep defaults
        assert_eq!(settings.protocol.ack_wait_ms, 250);
    }
}
