//! Runtime configuration for a sync session.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Tunables for every time-dependent part of the sync core, plus the
/// endpoints the session talks to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Quiet period after which an undo capture window closes.
    pub undo_capture_ms: u64,
    /// Maximum number of undo units kept per actor.
    pub undo_max_steps: usize,
    /// Minimum spacing between awareness broadcasts.
    pub awareness_throttle_ms: u64,
    /// Inactivity after which a peer counts as idle.
    pub idle_threshold_ms: u64,
    /// Inactivity after which a peer's cursor is drawn faded.
    pub cursor_fade_ms: u64,
    /// Peers we have not heard from for this long are dropped.
    pub awareness_timeout_ms: u64,
    /// Quiet window for collapsing task updates sent to the backend.
    pub backend_debounce_ms: u64,
    /// How long the "reconnected" banner stays up.
    pub reconnected_banner_ms: u64,
    /// Base URL of the task REST API.
    pub api_url: String,
    /// Real-time channel endpoint.
    pub ws_url: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            undo_capture_ms: 500,
            undo_max_steps: 100,
            awareness_throttle_ms: 50,
            idle_threshold_ms: 120_000,
            cursor_fade_ms: 30_000,
            awareness_timeout_ms: 30_000,
            backend_debounce_ms: 500,
            reconnected_banner_ms: 2_500,
            api_url: "http://localhost:8000/api".to_owned(),
            ws_url: "ws://localhost:1234".to_owned(),
        }
    }
}

impl SyncConfig {
    /// Load from a `.json` or `.toml` file, dispatching on the extension.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: Self = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => {
                serde_json::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?
            }
            Some("toml") => toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?,
            other => {
                return Err(ConfigError::UnsupportedFormat(
                    other.unwrap_or("<none>").to_owned(),
                ));
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Write to a `.json` or `.toml` file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let text = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => {
                serde_json::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))?
            }
            Some("toml") => {
                toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))?
            }
            other => {
                return Err(ConfigError::UnsupportedFormat(
                    other.unwrap_or("<none>").to_owned(),
                ));
            }
        };
        std::fs::write(path, text).map_err(|source| ConfigError::Write {
            path: path.display().to_string(),
            source,
        })
    }

    /// Defaults overridden by `CANVAS_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().with_env_overrides()
    }

    /// Apply `CANVAS_*` environment overrides on top of `self`.
    pub fn with_env_overrides(self) -> Result<Self, ConfigError> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    fn with_overrides(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        fn number<T: FromStr>(
            lookup: &impl Fn(&str) -> Option<String>,
            key: &'static str,
            expected: &str,
            slot: &mut T,
        ) -> Result<(), ConfigError> {
            if let Some(raw) = lookup(key) {
                *slot = raw.trim().parse().map_err(|_| ConfigError::Invalid {
                    key,
                    message: format!("expected {expected}, got {raw:?}"),
                })?;
            }
            Ok(())
        }
        let millis = |key, slot: &mut u64| number(&lookup, key, "milliseconds", slot);

        if let Some(url) = lookup("CANVAS_API_URL") {
            self.api_url = url;
        }
        if let Some(url) = lookup("CANVAS_WS_URL") {
            self.ws_url = url;
        }
        millis("CANVAS_UNDO_CAPTURE_MS", &mut self.undo_capture_ms)?;
        millis("CANVAS_AWARENESS_THROTTLE_MS", &mut self.awareness_throttle_ms)?;
        millis("CANVAS_IDLE_THRESHOLD_MS", &mut self.idle_threshold_ms)?;
        millis("CANVAS_CURSOR_FADE_MS", &mut self.cursor_fade_ms)?;
        millis("CANVAS_AWARENESS_TIMEOUT_MS", &mut self.awareness_timeout_ms)?;
        millis("CANVAS_BACKEND_DEBOUNCE_MS", &mut self.backend_debounce_ms)?;
        millis("CANVAS_RECONNECTED_BANNER_MS", &mut self.reconnected_banner_ms)?;
        number(&lookup, "CANVAS_UNDO_MAX_STEPS", "a step count", &mut self.undo_max_steps)?;
        self.validate()?;
        Ok(self)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.cursor_fade_ms > self.idle_threshold_ms {
            return Err(ConfigError::Invalid {
                key: "cursor_fade_ms",
                message: "fade threshold must not exceed the idle threshold".to_owned(),
            });
        }
        if self.undo_max_steps == 0 {
            return Err(ConfigError::Invalid {
                key: "undo_max_steps",
                message: "must keep at least one undo step".to_owned(),
            });
        }
        Ok(())
    }

    pub fn undo_capture(&self) -> Duration {
        Duration::from_millis(self.undo_capture_ms)
    }

    pub fn awareness_throttle(&self) -> Duration {
        Duration::from_millis(self.awareness_throttle_ms)
    }

    pub fn awareness_timeout(&self) -> Duration {
        Duration::from_millis(self.awareness_timeout_ms)
    }

    pub fn backend_debounce(&self) -> Duration {
        Duration::from_millis(self.backend_debounce_ms)
    }

    pub fn reconnected_banner(&self) -> Duration {
        Duration::from_millis(self.reconnected_banner_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync.toml");
        std::fs::write(&path, "awareness_throttle_ms = 80\napi_url = \"https://tasks.test\"\n")
            .unwrap();

        let config = SyncConfig::load(&path).unwrap();
        assert_eq!(config.awareness_throttle_ms, 80);
        assert_eq!(config.api_url, "https://tasks.test");
        assert_eq!(config.undo_capture_ms, 500);
        assert_eq!(config.idle_threshold_ms, 120_000);
    }

    #[test]
    fn test_json_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync.json");
        let config = SyncConfig {
            backend_debounce_ms: 750,
            ..Default::default()
        };

        config.save(&path).unwrap();
        assert_eq!(SyncConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn test_unknown_extension_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync.yaml");
        std::fs::write(&path, "").unwrap();

        assert!(matches!(
            SyncConfig::load(&path),
            Err(ConfigError::UnsupportedFormat(ext)) if ext == "yaml"
        ));
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("CANVAS_WS_URL", "wss://rooms.test"),
            ("CANVAS_UNDO_CAPTURE_MS", "250"),
        ]
        .into_iter()
        .collect();

        let config = SyncConfig::default()
            .with_overrides(|k| vars.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.ws_url, "wss://rooms.test");
        assert_eq!(config.undo_capture_ms, 250);
    }

    #[test]
    fn test_every_tunable_has_an_env_override() {
        let vars: HashMap<&str, &str> = [
            ("CANVAS_CURSOR_FADE_MS", "10000"),
            ("CANVAS_AWARENESS_TIMEOUT_MS", "45000"),
            ("CANVAS_RECONNECTED_BANNER_MS", "4000"),
            ("CANVAS_UNDO_MAX_STEPS", "20"),
            ("CANVAS_AWARENESS_THROTTLE_MS", "100"),
            ("CANVAS_BACKEND_DEBOUNCE_MS", "900"),
        ]
        .into_iter()
        .collect();

        let config = SyncConfig::default()
            .with_overrides(|k| vars.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.cursor_fade_ms, 10_000);
        assert_eq!(config.awareness_timeout(), Duration::from_secs(45));
        assert_eq!(config.reconnected_banner(), Duration::from_secs(4));
        assert_eq!(config.undo_max_steps, 20);
        assert_eq!(config.awareness_throttle_ms, 100);
        assert_eq!(config.backend_debounce_ms, 900);
    }

    #[test]
    fn test_zero_undo_steps_from_env_rejected() {
        let result = SyncConfig::default()
            .with_overrides(|k| (k == "CANVAS_UNDO_MAX_STEPS").then(|| "0".to_owned()));
        assert!(matches!(
            result,
            Err(ConfigError::Invalid { key: "undo_max_steps", .. })
        ));
    }

    #[test]
    fn test_bad_env_value_is_invalid() {
        let result = SyncConfig::default().with_overrides(|k| {
            (k == "CANVAS_IDLE_THRESHOLD_MS").then(|| "soon".to_owned())
        });
        assert!(matches!(
            result,
            Err(ConfigError::Invalid { key: "CANVAS_IDLE_THRESHOLD_MS", .. })
        ));
    }

    #[test]
    fn test_fade_longer_than_idle_rejected() {
        let result = SyncConfig::default().with_overrides(|k| {
            (k == "CANVAS_IDLE_THRESHOLD_MS").then(|| "1000".to_owned())
        });
        assert!(matches!(
            result,
            Err(ConfigError::Invalid { key: "cursor_fade_ms", .. })
        ));
    }
}
