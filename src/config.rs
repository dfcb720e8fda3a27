use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{fs, path::PathBuf, sync::RwLock, time::Duration};

use log::warn;

pub const DEFAULT_SYNC_INTERVAL_SECS: u64 = 300;
pub const DEFAULT_BATCH_LIMIT: u32 = 1000;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncSettings {
    pub enabled: bool,
    pub server_url: String,
    pub api_token: String,
    pub interval_secs: u64,
    pub batch_limit: u32,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            server_url: String::new(),
            api_token: String::new(),
            interval_secs: DEFAULT_SYNC_INTERVAL_SECS,
            batch_limit: DEFAULT_BATCH_LIMIT,
        }
    }
}

impl SyncSettings {
    /// The periodic uploader runs only with a full configuration.
    pub fn sync_ready(&self) -> bool {
        self.enabled && !self.server_url.is_empty() && !self.api_token.is_empty()
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct UserSettings {
    sync: SyncSettings,
}

pub struct SettingsStore {
    path: PathBuf,
    data: RwLock<UserSettings>,
}

impl SettingsStore {
    pub fn new(path: PathBuf) -> Result<Self> {
        let data = if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read settings from {}", path.display()))?;
            serde_json::from_str(&contents).unwrap_or_default()
        } else {
            UserSettings::default()
        };

        let store = Self {
            path,
            data: RwLock::new(data),
        };
        store.warn_on_insecure_endpoint();
        Ok(store)
    }

    pub fn sync(&self) -> SyncSettings {
        self.data.read().unwrap().sync.clone()
    }

    pub fn update_sync(&self, settings: SyncSettings) -> Result<()> {
        {
            let mut guard = self.data.write().unwrap();
            guard.sync = settings;
            self.persist(&guard)?;
        }
        self.warn_on_insecure_endpoint();
        Ok(())
    }

    fn warn_on_insecure_endpoint(&self) {
        let sync = self.data.read().unwrap().sync.clone();
        if sync.sync_ready()
            && !sync.server_url.starts_with("https://")
            && !sync.server_url.starts_with("http://localhost")
            && !sync.server_url.starts_with("http://127.0.0.1")
        {
            warn!(
                "Sync endpoint {} is not HTTPS; credentials will travel in the clear",
                sync.server_url
            );
        }
    }

    fn persist(&self, data: &UserSettings) -> Result<()> {
        let serialized = serde_json::to_string_pretty(data)?;
        fs::write(&self.path, serialized)
            .with_context(|| format!("Failed to write settings to {}", self.path.display()))
    }

    pub fn reload(&self) -> Result<()> {
        let contents = fs::read_to_string(&self.path)?;
        let data: UserSettings = serde_json::from_str(&contents)?;
        let mut guard = self.data.write().unwrap();
        *guard = data;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_not_sync_ready() {
        let settings = SyncSettings::default();
        assert!(!settings.sync_ready());
        assert_eq!(settings.interval(), Duration::from_secs(300));
        assert_eq!(settings.batch_limit, 1000);
    }

    #[test]
    fn sync_ready_requires_all_three_fields() {
        let mut settings = SyncSettings {
            enabled: true,
            server_url: "https://collector.example.com".into(),
            api_token: "token".into(),
            ..SyncSettings::default()
        };
        assert!(settings.sync_ready());

        settings.api_token.clear();
        assert!(!settings.sync_ready());

        settings.api_token = "token".into();
        settings.enabled = false;
        assert!(!settings.sync_ready());
    }

    #[test]
    fn settings_survive_a_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");

        let store = SettingsStore::new(path.clone()).unwrap();
        let settings = SyncSettings {
            enabled: true,
            server_url: "https://collector.example.com".into(),
            api_token: "secret".into(),
            interval_secs: 60,
            batch_limit: 250,
        };
        store.update_sync(settings.clone()).unwrap();

        let reopened = SettingsStore::new(path).unwrap();
        assert_eq!(reopened.sync(), settings);
    }

    #[test]
    fn corrupt_settings_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, "not json").unwrap();

        let store = SettingsStore::new(path).unwrap();
        assert_eq!(store.sync(), SyncSettings::default());
    }
}
