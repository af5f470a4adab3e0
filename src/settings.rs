use std::{
    env, fs, io,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::{
    domain::MonitoredProjectSettings,
    notify::{Dispatcher, Event, Handler, lock},
};

const STORAGE_DIR_NAME: &str = ".pr-monitor";
const SETTINGS_FILE: &str = "settings.json";
pub const TOKEN_ENV: &str = "PR_MONITOR_TOKEN";
const MATCH_EVERYTHING: &str = ".*";
const DEFAULT_POLL_INTERVAL_SECS: u64 = 60;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// What the monitor needs to know about its configuration.
pub trait MonitorSettings: Send + Sync {
    fn projects(&self) -> Vec<MonitoredProjectSettings>;

    /// Time between successive polls of the server.
    fn poll_interval(&self) -> Duration;

    fn on_changed(&self, handler: Handler);
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoredSettings {
    pub account: String,
    pub project_id: Uuid,
    pub repo_name_pattern: String,
    pub poll_interval_seconds: u64,
    pub request_timeout_seconds: u64,
    pub personal_access_token: Option<String>,
}

impl Default for StoredSettings {
    fn default() -> Self {
        Self {
            account: String::new(),
            project_id: Uuid::nil(),
            repo_name_pattern: MATCH_EVERYTHING.to_owned(),
            poll_interval_seconds: DEFAULT_POLL_INTERVAL_SECS,
            request_timeout_seconds: DEFAULT_REQUEST_TIMEOUT_SECS,
            personal_access_token: None,
        }
    }
}

pub struct SettingsStore {
    path: PathBuf,
}

impl SettingsStore {
    pub fn initialize() -> Result<Self, SettingsError> {
        let home = env::var("HOME").map_err(|_| SettingsError::HomeDirMissing)?;
        let dir = PathBuf::from(home).join(STORAGE_DIR_NAME);
        if !dir.exists() {
            fs::create_dir_all(&dir)?;
        }
        Ok(Self {
            path: dir.join(SETTINGS_FILE),
        })
    }

    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<StoredSettings, SettingsError> {
        match fs::read_to_string(&self.path) {
            Ok(contents) => Ok(serde_json::from_str(&contents)?),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(StoredSettings::default()),
            Err(err) => Err(err.into()),
        }
    }

    pub fn save(&self, settings: &StoredSettings) -> Result<(), SettingsError> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            fs::create_dir_all(parent)?;
        }
        let data = serde_json::to_string_pretty(settings)?;
        fs::write(&self.path, data)?;
        Ok(())
    }
}

/// Settings persisted to a JSON file. Every effective change is saved and
/// announced to observers.
pub struct FileSettings {
    store: SettingsStore,
    current: Mutex<StoredSettings>,
    changed: Event,
}

impl FileSettings {
    pub fn load(store: SettingsStore, dispatcher: Arc<dyn Dispatcher>) -> Result<Self, SettingsError> {
        let current = store.load()?;
        Ok(Self {
            store,
            current: Mutex::new(current),
            changed: Event::new(dispatcher),
        })
    }

    pub fn snapshot(&self) -> StoredSettings {
        lock(&self.current).clone()
    }

    /// The environment wins over the file.
    pub fn token(&self) -> Option<String> {
        env::var(TOKEN_ENV)
            .ok()
            .filter(|token| !token.is_empty())
            .or_else(|| lock(&self.current).personal_access_token.clone())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(lock(&self.current).request_timeout_seconds.max(1))
    }

    /// Switching account forgets the project and the repository pattern.
    pub fn set_account(&self, account: &str) -> Result<(), SettingsError> {
        let account = account.trim().to_owned();
        self.update(|settings| {
            if settings.account != account {
                settings.account = account;
                settings.project_id = Uuid::nil();
                settings.repo_name_pattern = MATCH_EVERYTHING.to_owned();
            }
        })
    }

    pub fn set_project_id(&self, project_id: Uuid) -> Result<(), SettingsError> {
        self.update(|settings| settings.project_id = project_id)
    }

    pub fn set_repo_name_pattern(&self, pattern: &str) -> Result<(), SettingsError> {
        self.update(|settings| settings.repo_name_pattern = pattern.to_owned())
    }

    pub fn set_poll_interval_seconds(&self, seconds: u64) -> Result<(), SettingsError> {
        self.update(|settings| settings.poll_interval_seconds = seconds)
    }

    fn update(&self, apply: impl FnOnce(&mut StoredSettings)) -> Result<(), SettingsError> {
        {
            let mut current = lock(&self.current);
            let mut next = current.clone();
            apply(&mut next);
            if next == *current {
                return Ok(());
            }
            self.store.save(&next)?;
            *current = next;
        }
        self.changed.raise();
        Ok(())
    }
}

impl MonitorSettings for FileSettings {
    fn projects(&self) -> Vec<MonitoredProjectSettings> {
        let current = lock(&self.current);
        if current.account.trim().is_empty() || current.project_id.is_nil() {
            return Vec::new();
        }

        vec![MonitoredProjectSettings {
            account: current.account.clone(),
            id: current.project_id,
            repo_name_pattern: Some(current.repo_name_pattern.clone())
                .filter(|pattern| !pattern.is_empty()),
        }]
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_secs(lock(&self.current).poll_interval_seconds.max(1))
    }

    fn on_changed(&self, handler: Handler) {
        self.changed.subscribe(handler);
    }
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("HOME environment variable is not set; cannot store settings under ~/.pr-monitor")]
    HomeDirMissing,
    #[error("I/O error while handling stored settings: {0}")]
    Io(#[from] io::Error),
    #[error("Failed to serialize stored settings: {0}")]
    Serialization(#[from] serde_json::Error),
}
