use std::path::PathBuf;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Settings {
    #[serde(default = "default_true")]
    pub mic_enabled_on_call: bool,
    #[serde(default)]
    pub camera_enabled_on_call: bool,
    /// Persist the counterpart id so the last conversation reopens on start.
    #[serde(default = "default_true")]
    pub remember_counterpart: bool,
}

fn default_true() -> bool {
    true
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            mic_enabled_on_call: true,
            camera_enabled_on_call: false,
            remember_counterpart: true,
        }
    }
}

pub struct SettingsStore {
    settings: Mutex<Settings>,
    file_path: PathBuf,
}

impl SettingsStore {
    pub fn new(data_dir: &str) -> Self {
        let file_path = PathBuf::from(data_dir).join("settings.json");
        let settings = Self::load(&file_path);
        Self {
            settings: Mutex::new(settings),
            file_path,
        }
    }

    pub fn get(&self) -> Settings {
        self.lock().clone()
    }

    pub fn set_mic_enabled_on_call(&self, enabled: bool) {
        self.lock().mic_enabled_on_call = enabled;
        self.save();
    }

    pub fn set_camera_enabled_on_call(&self, enabled: bool) {
        self.lock().camera_enabled_on_call = enabled;
        self.save();
    }

    pub fn set_remember_counterpart(&self, remember: bool) {
        self.lock().remember_counterpart = remember;
        self.save();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Settings> {
        self.settings.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn save(&self) {
        let settings = self.get();
        if let Some(parent) = self.file_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        if let Ok(json) = serde_json::to_string_pretty(&settings) {
            if let Err(e) = std::fs::write(&self.file_path, json) {
                tracing::warn!("failed to save settings: {e}");
            }
        }
    }

    fn load(path: &PathBuf) -> Settings {
        match std::fs::read_to_string(path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!(
                    "settings file {} is unreadable, using defaults: {e}",
                    path.display()
                );
                Settings::default()
            }),
            Err(_) => Settings::default(),
        }
    }
}
