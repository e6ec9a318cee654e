use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Stable identifier pair keying the persisted preferences location.
const ORGANIZATION: &str = "taskdock";
const APPLICATION: &str = "taskdock";

/// Persisted operator preferences, loaded once at startup and written
/// through explicit setters. Injected into the components that need it;
/// there is no ambient global.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    pub dark_mode: bool,
    pub backup_enabled: bool,
    /// Custom backup root; None means backups land under the output dir.
    pub backup_dir: Option<PathBuf>,
    /// Chosen output directory per task name.
    pub output_dirs: BTreeMap<String, PathBuf>,
    pub interpreter: String,
    pub script_extension: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            dark_mode: false,
            backup_enabled: false,
            backup_dir: None,
            output_dirs: BTreeMap::new(),
            interpreter: "python3".to_string(),
            script_extension: ".py".to_string(),
        }
    }
}

impl Settings {
    /// Canonical settings path under the platform config directory.
    pub fn path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| {
            dir.join(ORGANIZATION)
                .join(APPLICATION)
                .join("settings.toml")
        })
    }

    /// Load persisted preferences; absent or unreadable settings fall back
    /// to the defaults (a corrupt file is logged, never fatal).
    pub fn load() -> Self {
        match Self::path() {
            Some(path) => Self::load_from(&path),
            None => Self::default(),
        }
    }

    pub fn load_from(path: &Path) -> Self {
        if !path.exists() {
            return Self::default();
        }
        match std::fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(settings) => settings,
                Err(e) => {
                    warn!("malformed settings {:?}: {}", path, e);
                    Self::default()
                }
            },
            Err(e) => {
                warn!("failed to read settings {:?}: {}", path, e);
                Self::default()
            }
        }
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let path = Self::path().context("no config directory available")?;
        self.save_to(&path)
    }

    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {:?}", parent))?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).with_context(|| format!("failed to write {:?}", path))?;
        Ok(())
    }

    /// The output directory chosen for a task, falling back to the
    /// operator's home directory.
    pub fn output_dir_for(&self, task_name: &str) -> PathBuf {
        self.output_dirs
            .get(task_name)
            .cloned()
            .unwrap_or_else(|| dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")))
    }

    pub fn set_output_dir(&mut self, task_name: &str, dir: impl Into<PathBuf>) {
        self.output_dirs.insert(task_name.to_string(), dir.into());
    }
}
