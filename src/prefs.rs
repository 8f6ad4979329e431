use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::settings::ensure_dir;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Preferences {
    pub tun_enabled: bool,
    pub autostart_configured: bool,
}

pub trait PreferenceStore: Send {
    /// Never fails; unreadable state means defaults.
    fn load(&self) -> Preferences;
    fn save(&self, prefs: &Preferences) -> std::io::Result<()>;
}

/// Preferences kept as pretty-printed JSON next to the settings file.
#[derive(Debug, Clone)]
pub struct JsonPreferenceStore {
    path: PathBuf,
}

impl JsonPreferenceStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl PreferenceStore for JsonPreferenceStore {
    fn load(&self) -> Preferences {
        if !self.path.exists() {
            return Preferences::default();
        }
        let raw = match fs::read_to_string(&self.path) {
            Ok(value) => value,
            Err(_) => return Preferences::default(),
        };
        serde_json::from_str(&raw).unwrap_or_default()
    }

    fn save(&self, prefs: &Preferences) -> std::io::Result<()> {
        if let Some(dir) = self.path.parent() {
            ensure_dir(dir)?;
        }
        let content = serde_json::to_string_pretty(prefs)?;
        fs::write(&self.path, content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonPreferenceStore::new(dir.path().join("config").join("state.json"));
        assert_eq!(store.load(), Preferences::default());

        let prefs = Preferences {
            tun_enabled: true,
            autostart_configured: false,
        };
        store.save(&prefs).unwrap();
        assert_eq!(store.load(), prefs);

        let raw = fs::read_to_string(dir.path().join("config").join("state.json")).unwrap();
        assert!(raw.contains("\"tunEnabled\": true"));
    }

    #[test]
    fn test_corrupt_file_loads_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, "garbage").unwrap();
        assert_eq!(JsonPreferenceStore::new(path).load(), Preferences::default());
    }
}
