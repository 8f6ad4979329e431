use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

const HOME_ENV: &str = "CORPVPN_HOME";
const CONFIG_DIR: &str = "config";
const RUNTIME_DIR: &str = "runtime";
const CORE_DIR: &str = "core";
const SETTINGS_FILE: &str = "settings.json";
const STATE_FILE: &str = "state.json";
const SUBSCRIPTIONS_FILE: &str = "subscriptions.txt";
const ACTIVE_CONFIG_FILE: &str = "active-config.json";
const CORE_LOG_FILE: &str = "core.log";

#[cfg(target_os = "windows")]
const CORE_EXE: &str = "xray.exe";
#[cfg(not(target_os = "windows"))]
const CORE_EXE: &str = "xray";

#[derive(Debug, Clone)]
pub struct AppPaths {
    base_dir: PathBuf,
}

impl AppPaths {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// `CORPVPN_HOME` if set, otherwise the directory holding the executable.
    pub fn discover() -> std::io::Result<Self> {
        if let Some(home) = std::env::var_os(HOME_ENV).filter(|value| !value.is_empty()) {
            return Ok(Self::new(home));
        }
        let exe = std::env::current_exe()?;
        let dir = exe
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Ok(Self::new(dir))
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn config_dir(&self) -> PathBuf {
        self.base_dir.join(CONFIG_DIR)
    }

    pub fn runtime_dir(&self) -> PathBuf {
        self.base_dir.join(RUNTIME_DIR)
    }

    pub fn core_dir(&self) -> PathBuf {
        self.base_dir.join(CORE_DIR)
    }

    pub fn core_exe(&self) -> PathBuf {
        self.core_dir().join(CORE_EXE)
    }

    pub fn settings_path(&self) -> PathBuf {
        self.config_dir().join(SETTINGS_FILE)
    }

    pub fn state_path(&self) -> PathBuf {
        self.config_dir().join(STATE_FILE)
    }

    pub fn default_subscriptions_path(&self) -> PathBuf {
        self.config_dir().join(SUBSCRIPTIONS_FILE)
    }

    pub fn active_config_path(&self) -> PathBuf {
        self.runtime_dir().join(ACTIVE_CONFIG_FILE)
    }

    pub fn core_log_path(&self) -> PathBuf {
        self.runtime_dir().join(CORE_LOG_FILE)
    }
}

pub fn ensure_dir(dir: &Path) -> std::io::Result<()> {
    fs::create_dir_all(dir)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub socks_port: u16,
    pub http_port: u16,
    pub api_port: u16,
    pub connect_probe_timeout_ms: u64,
    pub health_probe_timeout_ms: u64,
    pub failover_margin_ms: u64,
    pub health_interval_secs: u64,
    pub speed_interval_ms: u64,
    pub core_settle_ms: u64,
    pub core_stop_timeout_ms: u64,
    pub stats_query_timeout_ms: u64,
    pub core_log_max_bytes: u64,
    pub core_log_keep_bytes: u64,
    /// Relative entries are resolved against the config directory.
    pub subscription_files: Vec<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            socks_port: 10808,
            http_port: 10809,
            api_port: 10085,
            connect_probe_timeout_ms: 1800,
            health_probe_timeout_ms: 1400,
            failover_margin_ms: 50,
            health_interval_secs: 15,
            speed_interval_ms: 1000,
            core_settle_ms: 800,
            core_stop_timeout_ms: 2000,
            stats_query_timeout_ms: 4000,
            core_log_max_bytes: 8 * 1024 * 1024,
            core_log_keep_bytes: 6 * 1024 * 1024,
            subscription_files: vec![PathBuf::from(SUBSCRIPTIONS_FILE)],
        }
    }
}

impl Settings {
    /// Missing file means defaults; a broken file is logged and ignored.
    pub fn load(paths: &AppPaths) -> Self {
        let path = paths.settings_path();
        if !path.exists() {
            return Self::default();
        }
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cannot read settings, using defaults");
                return Self::default();
            }
        };
        match serde_json::from_str(&raw) {
            Ok(settings) => settings,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "invalid settings, using defaults");
                Self::default()
            }
        }
    }

    pub fn subscription_paths(&self, paths: &AppPaths) -> Vec<PathBuf> {
        let config_dir = paths.config_dir();
        self.subscription_files
            .iter()
            .map(|file| {
                if file.is_absolute() {
                    file.clone()
                } else {
                    config_dir.join(file)
                }
            })
            .collect()
    }

    pub fn core_settle(&self) -> Duration {
        Duration::from_millis(self.core_settle_ms)
    }

    pub fn core_stop_timeout(&self) -> Duration {
        Duration::from_millis(self.core_stop_timeout_ms)
    }

    pub fn stats_query_timeout(&self) -> Duration {
        Duration::from_millis(self.stats_query_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        let paths = AppPaths::new("/opt/corpvpn");
        assert_eq!(paths.config_dir(), PathBuf::from("/opt/corpvpn/config"));
        assert_eq!(
            paths.active_config_path(),
            PathBuf::from("/opt/corpvpn/runtime/active-config.json")
        );
        assert!(paths.core_exe().starts_with("/opt/corpvpn/core"));
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::load(&AppPaths::new(dir.path()));
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.failover_margin_ms, 50);
        assert_eq!(settings.connect_probe_timeout_ms, 1800);
        assert_eq!(settings.health_probe_timeout_ms, 1400);
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let paths = AppPaths::new(dir.path());
        ensure_dir(&paths.config_dir()).unwrap();
        fs::write(
            paths.settings_path(),
            r#"{"failoverMarginMs": 80, "subscriptionFiles": ["a.txt", "/abs/b.txt"]}"#,
        )
        .unwrap();

        let settings = Settings::load(&paths);
        assert_eq!(settings.failover_margin_ms, 80);
        assert_eq!(settings.http_port, 10809);
        let subs = settings.subscription_paths(&paths);
        assert_eq!(subs[0], paths.config_dir().join("a.txt"));
        assert_eq!(subs[1], PathBuf::from("/abs/b.txt"));
    }

    #[test]
    fn test_malformed_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let paths = AppPaths::new(dir.path());
        ensure_dir(&paths.config_dir()).unwrap();
        fs::write(paths.settings_path(), "{ not json").unwrap();
        assert_eq!(Settings::load(&paths), Settings::default());
    }
}
