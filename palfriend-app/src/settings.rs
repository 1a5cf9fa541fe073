//! Persistent application settings (JSON file in app data directory).

use std::fs;
use std::path::{Path, PathBuf};

use palfriend_core::CompanionConfig;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct AppSettings {
    /// Pipeline tuning, passed through to the engine unchanged.
    pub companion: CompanionConfig,
    pub output: OutputSettings,
    pub memory: MemorySettings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputMode {
    /// JSON lines over TCP to the avatar/speech host.
    Tcp,
    /// Print each line to stdout; nothing reports speech activity.
    Console,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct OutputSettings {
    pub mode: OutputMode,
    pub host: String,
    pub port: u16,
    pub connect_attempts: u32,
    pub retry_base_ms: u64,
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            mode: OutputMode::Tcp,
            host: "127.0.0.1".into(),
            port: 9000,
            connect_attempts: 5,
            retry_base_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct MemorySettings {
    pub enabled: bool,
    /// Overrides the platform default database location.
    pub db_path: Option<PathBuf>,
    /// Viewers unseen for this many days are forgotten.
    pub decay_days: u32,
    pub prune_interval_secs: u64,
}

impl Default for MemorySettings {
    fn default() -> Self {
        Self {
            enabled: true,
            db_path: None,
            decay_days: 90,
            prune_interval_secs: 3_600,
        }
    }
}

impl AppSettings {
    pub fn normalize(&mut self) {
        self.output.host = normalize_host(&self.output.host);
        if self.output.port == 0 {
            self.output.port = OutputSettings::default().port;
        }
        self.output.connect_attempts = self.output.connect_attempts.clamp(1, 20);
        self.output.retry_base_ms = self.output.retry_base_ms.clamp(100, 30_000);
        self.memory.decay_days = self.memory.decay_days.clamp(1, 3650);
        self.memory.prune_interval_secs = self.memory.prune_interval_secs.clamp(60, 86_400);
        self.memory.db_path = self
            .memory
            .db_path
            .take()
            .filter(|p| !p.as_os_str().is_empty());
        self.companion.mic.device = self.companion.mic.device.trim().to_string();
    }

    /// Apply `PALFRIEND_*` environment overrides on top of the file values.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(host) = lookup("PALFRIEND_OUTPUT_HOST") {
            self.output.host = host;
        }
        if let Some(port) = lookup("PALFRIEND_OUTPUT_PORT") {
            match port.trim().parse() {
                Ok(port) => self.output.port = port,
                Err(_) => tracing::warn!(value = %port, "ignoring invalid PALFRIEND_OUTPUT_PORT"),
            }
        }
        if let Some(mode) = lookup("PALFRIEND_OUTPUT_MODE") {
            match mode.trim().to_ascii_lowercase().as_str() {
                "tcp" => self.output.mode = OutputMode::Tcp,
                "console" | "stdout" => self.output.mode = OutputMode::Console,
                other => tracing::warn!(value = %other, "ignoring invalid PALFRIEND_OUTPUT_MODE"),
            }
        }
        if let Some(path) = lookup("PALFRIEND_DB_PATH") {
            self.memory.db_path = Some(PathBuf::from(path));
        }
        if let Some(enabled) = lookup("PALFRIEND_MIC") {
            self.companion.mic.enabled = matches!(enabled.trim(), "1" | "true" | "on");
        }
        self.normalize();
    }

    pub fn db_path(&self) -> PathBuf {
        self.memory
            .db_path
            .clone()
            .unwrap_or_else(|| data_dir().join("palfriend.db"))
    }
}

fn normalize_host(raw: &str) -> String {
    let host = raw.trim();
    let host = host
        .strip_prefix("ws://")
        .or_else(|| host.strip_prefix("tcp://"))
        .unwrap_or(host)
        .trim_end_matches('/');
    if host.is_empty() {
        OutputSettings::default().host
    } else {
        host.to_string()
    }
}

fn data_dir() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("PalFriend")
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var_os("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                std::env::var_os("HOME")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("/tmp"))
                    .join(".local")
                    .join("share")
            })
            .join("palfriend")
    }
}

pub fn default_settings_path() -> PathBuf {
    std::env::var_os("PALFRIEND_SETTINGS")
        .map(PathBuf::from)
        .unwrap_or_else(|| data_dir().join("settings.json"))
}

/// Missing or unreadable files yield the defaults.
pub fn load_settings(path: &Path) -> AppSettings {
    let mut settings = match fs::read_to_string(path) {
        Ok(raw) => serde_json::from_str::<AppSettings>(&raw).unwrap_or_else(|e| {
            tracing::warn!(path = ?path, "settings file is invalid, using defaults: {e}");
            AppSettings::default()
        }),
        Err(_) => AppSettings::default(),
    };
    settings.normalize();
    settings
}

pub fn save_settings(path: &Path, settings: &AppSettings) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(settings).map_err(std::io::Error::other)?;
    fs::write(path, json)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn partial_file_keeps_defaults() {
        let raw = r#"{ "output": { "port": 8008 }, "companion": { "outbox": { "max_items": 4 } } }"#;
        let settings: AppSettings = serde_json::from_str(raw).expect("parse");
        assert_eq!(settings.output.port, 8008);
        assert_eq!(settings.output.host, "127.0.0.1");
        assert_eq!(settings.memory.decay_days, 90);
        assert_eq!(settings.companion.outbox.max_items, 4);
        assert_eq!(settings.companion.outbox.max_chars, 320);
    }

    #[test]
    fn normalize_clamps_and_cleans() {
        let mut settings = AppSettings::default();
        settings.output.host = "  ws://localhost/ ".into();
        settings.output.port = 0;
        settings.output.connect_attempts = 0;
        settings.memory.decay_days = 0;
        settings.memory.db_path = Some(PathBuf::new());
        settings.normalize();
        assert_eq!(settings.output.host, "localhost");
        assert_eq!(settings.output.port, 9000);
        assert_eq!(settings.output.connect_attempts, 1);
        assert_eq!(settings.memory.decay_days, 1);
        assert!(settings.memory.db_path.is_none());
    }

    #[test]
    fn env_overrides_apply() {
        let env: HashMap<&str, &str> = [
            ("PALFRIEND_OUTPUT_HOST", "10.0.0.2"),
            ("PALFRIEND_OUTPUT_PORT", "7777"),
            ("PALFRIEND_OUTPUT_MODE", "console"),
            ("PALFRIEND_DB_PATH", "/var/lib/palfriend/memory.db"),
            ("PALFRIEND_MIC", "0"),
        ]
        .into_iter()
        .collect();
        let mut settings = AppSettings::default();
        settings.apply_overrides(|key| env.get(key).map(|v| v.to_string()));
        assert_eq!(settings.output.host, "10.0.0.2");
        assert_eq!(settings.output.port, 7777);
        assert_eq!(settings.output.mode, OutputMode::Console);
        assert_eq!(settings.db_path(), PathBuf::from("/var/lib/palfriend/memory.db"));
        assert!(!settings.companion.mic.enabled);
    }

    #[test]
    fn invalid_port_override_is_ignored() {
        let mut settings = AppSettings::default();
        settings.apply_overrides(|key| (key == "PALFRIEND_OUTPUT_PORT").then(|| "nope".to_string()));
        assert_eq!(settings.output.port, 9000);
    }

    #[test]
    fn missing_file_loads_defaults() {
        let path = std::env::temp_dir().join("palfriend-missing-settings-test.json");
        let settings = load_settings(&path);
        assert_eq!(settings.output.mode, OutputMode::Tcp);
    }
}
