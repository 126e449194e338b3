//! Per-user settings and stored program/sweep configs.
//!
//! Layout under the users directory:
//!
//! ```text
//! <users_dir>/<user>/settings.json        global settings
//! <users_dir>/<user>/program/<name>.json  last config used per program
//! <users_dir>/<user>/sweep/<name>.json    last config used per sweep
//! ```
//!
//! Global settings are cached in memory and written back by a periodic autosave
//! task when dirty. Program and sweep configs are written through immediately.

use crate::error::{AppResult, DaqError};
use crate::program::ProgramRegistry;
use crate::sweep::{StartAddress, SweepKind};
use crate::wafer::WaferCalibration;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Global settings file name inside a user directory.
pub const SETTINGS_FILE: &str = "settings.json";
/// Program config directory inside a user directory.
pub const PROGRAM_DIR: &str = "program";
/// Sweep config directory inside a user directory.
pub const SWEEP_DIR: &str = "sweep";

/// Settings a user carries between sessions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserGlobalSettings {
    /// Owner
    pub username: String,
    /// Die pitch along x, µm
    pub die_size_x: f64,
    /// Die pitch along y, µm
    pub die_size_y: f64,
    /// Die origin offset along x, µm
    pub die_offset_x: f64,
    /// Die origin offset along y, µm
    pub die_offset_y: f64,
    /// Die the chuck is currently on
    pub current_die_x: i32,
    /// Die the chuck is currently on
    pub current_die_y: i32,
    /// Device pitch along x, µm
    pub device_x: f64,
    /// Device pitch along y, µm
    pub device_y: f64,
    /// Current device row
    pub device_row: i32,
    /// Current device column
    pub device_col: i32,
    /// Root folder for saved results
    pub data_folder: String,
}

impl Default for UserGlobalSettings {
    fn default() -> Self {
        Self {
            username: String::new(),
            die_size_x: 10000.0,
            die_size_y: 10000.0,
            die_offset_x: 0.0,
            die_offset_y: 0.0,
            current_die_x: 0,
            current_die_y: 0,
            device_x: 0.0,
            device_y: 0.0,
            device_row: 0,
            device_col: 0,
            data_folder: String::new(),
        }
    }
}

impl UserGlobalSettings {
    /// Default settings for `username`.
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            ..Self::default()
        }
    }

    /// Set one field by name.
    ///
    /// Unknown fields, `username`, and values of the wrong type are rejected and
    /// leave the settings untouched.
    pub fn set(&mut self, setting: &str, value: serde_json::Value) -> AppResult<()> {
        if setting == "username" {
            return Err(DaqError::InvalidInput(
                "username cannot be changed".to_string(),
            ));
        }
        let mut fields = match serde_json::to_value(&*self)? {
            serde_json::Value::Object(map) => map,
            _ => return Err(DaqError::InvalidInput("settings are not a table".to_string())),
        };
        match fields.get_mut(setting) {
            Some(slot) => *slot = value,
            None => {
                return Err(DaqError::InvalidInput(format!(
                    "Unknown user setting '{setting}'"
                )))
            }
        }
        let updated: Self = serde_json::from_value(serde_json::Value::Object(fields))
            .map_err(|e| DaqError::InvalidInput(format!("Invalid value for '{setting}': {e}")))?;
        *self = updated;
        Ok(())
    }

    /// Current die and device as a run start address.
    pub fn start_address(&self) -> StartAddress {
        StartAddress {
            die_x: self.current_die_x,
            die_y: self.current_die_y,
            device_row: self.device_row,
            device_col: self.device_col,
        }
    }

    /// Overlay this user's die geometry onto `base`, keeping its height table.
    pub fn calibration(&self, base: &WaferCalibration) -> WaferCalibration {
        let mut calibration = base
            .clone()
            .with_die_offset(self.die_offset_x, self.die_offset_y)
            .with_device_pitch(self.device_x, self.device_y);
        calibration.die_size_x = self.die_size_x;
        calibration.die_size_y = self.die_size_y;
        calibration
    }
}

/// Cached settings of one user.
#[derive(Debug, Clone)]
pub struct UserProfile {
    /// Global settings
    pub settings: UserGlobalSettings,
    dirty: bool,
}

impl UserProfile {
    fn clean(settings: UserGlobalSettings) -> Self {
        Self {
            settings,
            dirty: false,
        }
    }

    /// Whether the settings changed since the last save.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }
}

/// File-backed store of user profiles.
pub struct UserStore {
    root: PathBuf,
    registry: Arc<ProgramRegistry>,
    profiles: Mutex<HashMap<String, UserProfile>>,
}

impl UserStore {
    /// Store rooted at `root`; nothing is read until a user is requested.
    pub fn new(root: impl Into<PathBuf>, registry: Arc<ProgramRegistry>) -> Self {
        Self {
            root: root.into(),
            registry,
            profiles: Mutex::new(HashMap::new()),
        }
    }

    /// Users directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn user_dir(&self, user: &str) -> AppResult<PathBuf> {
        let valid = !user.is_empty()
            && user != "."
            && user != ".."
            && !user.contains(['/', '\\'])
            && !user.contains('\0');
        if !valid {
            return Err(DaqError::InvalidInput(format!("Invalid user name '{user}'")));
        }
        Ok(self.root.join(user))
    }

    fn config_path(&self, user: &str, dir: &str, name: &str) -> AppResult<PathBuf> {
        if name.is_empty() || name.contains(['/', '\\', '.']) {
            return Err(DaqError::InvalidInput(format!("Invalid config name '{name}'")));
        }
        Ok(self.user_dir(user)?.join(dir).join(format!("{name}.json")))
    }

    /// Global settings of `user`, loaded from disk on first use.
    ///
    /// A user without a settings file gets defaults, written immediately.
    pub async fn settings(&self, user: &str) -> AppResult<UserGlobalSettings> {
        if let Some(profile) = self.profiles.lock().get(user) {
            return Ok(profile.settings.clone());
        }

        let path = self.user_dir(user)?.join(SETTINGS_FILE);
        let settings = match tokio::fs::read_to_string(&path).await {
            Ok(text) => {
                let mut settings: UserGlobalSettings = serde_json::from_str(&text)?;
                settings.username = user.to_string();
                settings
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(user, path = %path.display(), "creating default user settings");
                let settings = UserGlobalSettings::new(user);
                write_json(&path, &settings).await?;
                settings
            }
            Err(e) => return Err(e.into()),
        };

        let mut profiles = self.profiles.lock();
        let profile = profiles
            .entry(user.to_string())
            .or_insert_with(|| UserProfile::clean(settings));
        Ok(profile.settings.clone())
    }

    /// Change one global setting and mark the user dirty.
    pub async fn set_setting(
        &self,
        user: &str,
        setting: &str,
        value: serde_json::Value,
    ) -> AppResult<UserGlobalSettings> {
        self.settings(user).await?;
        let mut profiles = self.profiles.lock();
        let profile = profiles
            .get_mut(user)
            .ok_or_else(|| DaqError::UnknownUser(user.to_string()))?;
        profile.settings.set(setting, value)?;
        profile.dirty = true;
        debug!(user, setting, "user setting changed");
        Ok(profile.settings.clone())
    }

    /// Whether `user` has unsaved changes.
    pub fn is_dirty(&self, user: &str) -> bool {
        self.profiles
            .lock()
            .get(user)
            .map(UserProfile::is_dirty)
            .unwrap_or(false)
    }

    /// Write every dirty profile. Returns the users that were saved.
    pub async fn save_dirty(&self) -> AppResult<Vec<String>> {
        let dirty: Vec<UserGlobalSettings> = {
            let mut profiles = self.profiles.lock();
            profiles
                .values_mut()
                .filter(|p| p.dirty)
                .map(|p| {
                    p.dirty = false;
                    p.settings.clone()
                })
                .collect()
        };

        let mut saved = Vec::with_capacity(dirty.len());
        for settings in dirty {
            let path = self.user_dir(&settings.username)?.join(SETTINGS_FILE);
            if let Err(e) = write_json(&path, &settings).await {
                if let Some(profile) = self.profiles.lock().get_mut(&settings.username) {
                    profile.dirty = true;
                }
                return Err(e);
            }
            info!(user = %settings.username, "saved user settings");
            saved.push(settings.username);
        }
        saved.sort();
        Ok(saved)
    }

    /// Stored config of `program`, or its defaults (written on first access).
    pub async fn program_config(&self, user: &str, program: &str) -> AppResult<serde_json::Value> {
        let default = self.registry.default_config(program)?;
        let path = self.config_path(user, PROGRAM_DIR, program)?;
        read_or_create(&path, default).await
    }

    /// Store the config of `program`.
    pub async fn set_program_config(
        &self,
        user: &str,
        program: &str,
        config: &serde_json::Value,
    ) -> AppResult<PathBuf> {
        self.registry.get(program)?;
        let path = self.config_path(user, PROGRAM_DIR, program)?;
        write_json(&path, config).await?;
        Ok(path)
    }

    /// Stored config of `sweep`, or its defaults (written on first access).
    pub async fn sweep_config(&self, user: &str, sweep: SweepKind) -> AppResult<serde_json::Value> {
        let path = self.config_path(user, SWEEP_DIR, sweep.as_str())?;
        read_or_create(&path, sweep.default_config()).await
    }

    /// Store the config of `sweep`.
    pub async fn set_sweep_config(
        &self,
        user: &str,
        sweep: SweepKind,
        config: &serde_json::Value,
    ) -> AppResult<PathBuf> {
        let path = self.config_path(user, SWEEP_DIR, sweep.as_str())?;
        write_json(&path, config).await?;
        Ok(path)
    }

    /// Save dirty profiles every `period` until the task is aborted.
    pub fn spawn_autosave(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = store.save_dirty().await {
                    warn!(error = %e, "user settings autosave failed");
                }
            }
        })
    }
}

async fn read_or_create(path: &Path, default: serde_json::Value) -> AppResult<serde_json::Value> {
    match tokio::fs::read_to_string(path).await {
        Ok(text) => Ok(serde_json::from_str(&text)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "writing default config");
            write_json(path, &default).await?;
            Ok(default)
        }
        Err(e) => Err(e.into()),
    }
}

async fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> AppResult<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let text = serde_json::to_string_pretty(value)?;
    tokio::fs::write(path, text).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store(dir: &Path) -> Arc<UserStore> {
        Arc::new(UserStore::new(dir, Arc::new(ProgramRegistry::new())))
    }

    #[test]
    fn test_set_known_field() {
        let mut settings = UserGlobalSettings::new("public");
        settings.set("die_size_x", json!(24425.0)).unwrap();
        settings.set("current_die_y", json!(-3)).unwrap();
        settings.set("data_folder", json!("/data")).unwrap();
        assert_eq!(settings.die_size_x, 24425.0);
        assert_eq!(settings.current_die_y, -3);
        assert_eq!(settings.start_address().die_y, -3);
        assert_eq!(settings.data_folder, "/data");
    }

    #[test]
    fn test_set_rejects_unknown_and_mistyped() {
        let mut settings = UserGlobalSettings::new("public");
        assert!(settings.set("gpib", json!(3)).is_err());
        assert!(settings.set("username", json!("root")).is_err());
        assert!(settings.set("current_die_x", json!("left")).is_err());
        assert_eq!(settings, UserGlobalSettings::new("public"));
    }

    #[test]
    fn test_calibration_keeps_height_table() {
        let mut table = crate::wafer::HeightOffsetTable::new();
        table.insert(2, 0, -20.0);
        let base = WaferCalibration::default().with_height_offsets(table);
        let mut settings = UserGlobalSettings::new("public");
        settings.die_size_x = 24425.0;

        let cal = settings.calibration(&base);
        assert_eq!(cal.die_size_x, 24425.0);
        assert_eq!(cal.height_offset_table.get(2, 0), Some(-20.0));
    }

    #[tokio::test]
    async fn test_first_access_writes_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());

        let settings = store.settings("alice").await.unwrap();
        assert_eq!(settings.username, "alice");
        assert_eq!(settings.die_size_x, 10000.0);
        assert!(dir.path().join("alice").join(SETTINGS_FILE).exists());
    }

    #[tokio::test]
    async fn test_dirty_settings_saved_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());

        store
            .set_setting("alice", "die_offset_x", json!(12.5))
            .await
            .unwrap();
        assert!(store.is_dirty("alice"));
        assert_eq!(store.save_dirty().await.unwrap(), vec!["alice".to_string()]);
        assert!(!store.is_dirty("alice"));
        assert!(store.save_dirty().await.unwrap().is_empty());

        let reloaded = self::store(dir.path()).settings("alice").await.unwrap();
        assert_eq!(reloaded.die_offset_x, 12.5);
    }

    #[tokio::test]
    async fn test_program_config_defaults_then_stored() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());

        let default = store.program_config("alice", "debug").await.unwrap();
        assert_eq!(default["sweep_direction"], json!("fr"));

        let custom = json!({"v_ds": [0.1], "sweep_direction": "f"});
        let path = store
            .set_program_config("alice", "debug", &custom)
            .await
            .unwrap();
        assert!(path.ends_with("alice/program/debug.json"));
        assert_eq!(store.program_config("alice", "debug").await.unwrap(), custom);
    }

    #[tokio::test]
    async fn test_unknown_program_config_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = store(dir.path())
            .program_config("alice", "nope")
            .await
            .unwrap_err();
        assert!(matches!(err, DaqError::UnknownProgram(_)));
    }

    #[tokio::test]
    async fn test_sweep_config_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let config = store.sweep_config("alice", SweepKind::Array).await.unwrap();
        assert_eq!(config, SweepKind::Array.default_config());
        assert!(dir.path().join("alice/sweep/array.json").exists());
    }

    #[tokio::test]
    async fn test_path_traversal_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        assert!(store.settings("../etc").await.is_err());
        assert!(store.program_config("alice", "../x").await.is_err());
    }

    #[tokio::test]
    async fn test_autosave_task_flushes_dirty_profiles() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        store
            .set_setting("bob", "device_row", json!(4))
            .await
            .unwrap();

        let task = store.spawn_autosave(Duration::from_secs(10));
        for _ in 0..50 {
            if !store.is_dirty("bob") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        task.abort();
        assert!(!store.is_dirty("bob"));
    }
}
