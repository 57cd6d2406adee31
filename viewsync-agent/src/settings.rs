use std::{
    fmt, fs, io,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;
use viewsync_core::parse_view_kinds;

/// `settings.json` is expected to be tiny.
pub const MAX_SETTINGS_BYTES: u64 = 64 * 1024;
pub const SETTINGS_FILE_NAME: &str = "settings.json";

fn default_view_types() -> Vec<String> {
    vec!["pdf".to_owned()]
}

fn default_true() -> bool {
    true
}

/// Persisted preferences. Keys are camelCase so records written by other
/// clients of the same sync files load unchanged.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SyncSettings {
    #[serde(default)]
    pub own_path: String,
    #[serde(default = "default_view_types")]
    pub view_types: Vec<String>,
    #[serde(default)]
    pub watch_another: bool,
    #[serde(default)]
    pub watch_path: String,
    #[serde(default = "default_true")]
    pub accept_only_if_newer: bool,
    #[serde(default)]
    pub own_workspace_path: String,
    #[serde(default)]
    pub watch_another_workspace: bool,
    #[serde(default)]
    pub watch_workspace_path: String,
    #[serde(default = "default_true")]
    pub workspace_accept_only_if_newer: bool,
    /// Open the synced file in its associated app after an apply.
    #[serde(default)]
    pub open_after_sync: bool,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            own_path: String::new(),
            view_types: default_view_types(),
            watch_another: false,
            watch_path: String::new(),
            accept_only_if_newer: true,
            own_workspace_path: String::new(),
            watch_another_workspace: false,
            watch_workspace_path: String::new(),
            workspace_accept_only_if_newer: true,
            open_after_sync: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathSetting {
    OwnPath,
    WatchPath,
    OwnWorkspacePath,
    WatchWorkspacePath,
}

impl PathSetting {
    pub fn key(self) -> &'static str {
        match self {
            PathSetting::OwnPath => "ownPath",
            PathSetting::WatchPath => "watchPath",
            PathSetting::OwnWorkspacePath => "ownWorkspacePath",
            PathSetting::WatchWorkspacePath => "watchWorkspacePath",
        }
    }

    pub fn get(self, settings: &SyncSettings) -> &str {
        match self {
            PathSetting::OwnPath => &settings.own_path,
            PathSetting::WatchPath => &settings.watch_path,
            PathSetting::OwnWorkspacePath => &settings.own_workspace_path,
            PathSetting::WatchWorkspacePath => &settings.watch_workspace_path,
        }
    }

    pub fn set(self, settings: &mut SyncSettings, value: String) {
        let slot = match self {
            PathSetting::OwnPath => &mut settings.own_path,
            PathSetting::WatchPath => &mut settings.watch_path,
            PathSetting::OwnWorkspacePath => &mut settings.own_workspace_path,
            PathSetting::WatchWorkspacePath => &mut settings.watch_workspace_path,
        };
        *slot = value;
    }
}

impl fmt::Display for PathSetting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingKey {
    Path(PathSetting),
    ViewTypes,
    WatchAnother,
    AcceptOnlyIfNewer,
    WatchAnotherWorkspace,
    WorkspaceAcceptOnlyIfNewer,
    OpenAfterSync,
}

impl FromStr for SettingKey {
    type Err = String;

    fn from_str(key: &str) -> Result<Self, Self::Err> {
        match key {
            "ownPath" => Ok(SettingKey::Path(PathSetting::OwnPath)),
            "watchPath" => Ok(SettingKey::Path(PathSetting::WatchPath)),
            "ownWorkspacePath" => Ok(SettingKey::Path(PathSetting::OwnWorkspacePath)),
            "watchWorkspacePath" => Ok(SettingKey::Path(PathSetting::WatchWorkspacePath)),
            "viewTypes" => Ok(SettingKey::ViewTypes),
            "watchAnother" => Ok(SettingKey::WatchAnother),
            "acceptOnlyIfNewer" => Ok(SettingKey::AcceptOnlyIfNewer),
            "watchAnotherWorkspace" => Ok(SettingKey::WatchAnotherWorkspace),
            "workspaceAcceptOnlyIfNewer" => Ok(SettingKey::WorkspaceAcceptOnlyIfNewer),
            "openAfterSync" => Ok(SettingKey::OpenAfterSync),
            other => Err(format!("unknown setting '{other}'")),
        }
    }
}

fn parse_toggle(value: &str) -> Result<bool, String> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "on" | "yes" | "1" => Ok(true),
        "false" | "off" | "no" | "0" => Ok(false),
        other => Err(format!("expected a toggle value (true/false), got '{other}'")),
    }
}

impl SyncSettings {
    /// Set one field from its textual form. Path values are stored as given.
    pub fn apply(&mut self, key: SettingKey, value: &str) -> Result<(), String> {
        match key {
            SettingKey::Path(setting) => setting.set(self, value.trim().to_owned()),
            SettingKey::ViewTypes => self.view_types = parse_view_kinds(value),
            SettingKey::WatchAnother => self.watch_another = parse_toggle(value)?,
            SettingKey::AcceptOnlyIfNewer => self.accept_only_if_newer = parse_toggle(value)?,
            SettingKey::WatchAnotherWorkspace => {
                self.watch_another_workspace = parse_toggle(value)?
            }
            SettingKey::WorkspaceAcceptOnlyIfNewer => {
                self.workspace_accept_only_if_newer = parse_toggle(value)?
            }
            SettingKey::OpenAfterSync => self.open_after_sync = parse_toggle(value)?,
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum SettingsLoadError {
    #[error("settings file {} unavailable: {source}", path.display())]
    Unavailable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("settings file {} too large: {size} bytes (max {max})", path.display())]
    TooLarge { path: PathBuf, size: u64, max: u64 },
    #[error("settings file {} unreadable: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("settings file {} is not a settings record: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl SettingsLoadError {
    fn is_missing(&self) -> bool {
        matches!(
            self,
            SettingsLoadError::Unavailable { source, .. }
                if source.kind() == io::ErrorKind::NotFound
        )
    }
}

#[derive(Debug, Error)]
pub enum SettingsSaveError {
    #[error("settings serialize failed: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("config dir {} creation failed: {source}", dir.display())]
    CreateDir {
        dir: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("settings staging write to {} failed: {source}", tmp.display())]
    Stage {
        tmp: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("replacing settings file {} failed: {source}", path.display())]
    Replace {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Config directory: `VIEWSYNC_CONFIG_DIR`, else `$HOME/.config/viewsync`.
pub fn default_config_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os("VIEWSYNC_CONFIG_DIR") {
        return PathBuf::from(dir);
    }
    let home = std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    home.join(".config").join("viewsync")
}

pub fn settings_path(config_dir: &Path) -> PathBuf {
    config_dir.join(SETTINGS_FILE_NAME)
}

pub fn parse_settings_json(data: &str) -> Result<SyncSettings, serde_json::Error> {
    serde_json::from_str::<SyncSettings>(data)
}

pub fn load_settings_from_path(path: &Path) -> Result<SyncSettings, SettingsLoadError> {
    let meta = fs::metadata(path).map_err(|source| SettingsLoadError::Unavailable {
        path: path.to_path_buf(),
        source,
    })?;
    if meta.len() > MAX_SETTINGS_BYTES {
        return Err(SettingsLoadError::TooLarge {
            path: path.to_path_buf(),
            size: meta.len(),
            max: MAX_SETTINGS_BYTES,
        });
    }

    let data = fs::read_to_string(path).map_err(|source| SettingsLoadError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse_settings_json(&data).map_err(|source| SettingsLoadError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Stored settings merged over the defaults. Any failure yields the defaults.
pub fn load_settings(path: &Path) -> SyncSettings {
    match load_settings_from_path(path) {
        Ok(settings) => settings,
        Err(err) if err.is_missing() => SyncSettings::default(),
        Err(err) => {
            warn!("settings unusable, using defaults: {err}");
            SyncSettings::default()
        }
    }
}

/// Stage the record next to `path`, then rename it over the previous one.
/// Readers see either the old record or the new one, never neither.
pub fn save_settings_to_path(path: &Path, settings: &SyncSettings) -> Result<(), SettingsSaveError> {
    if let Some(dir) = path.parent()
        && !dir.as_os_str().is_empty()
    {
        fs::create_dir_all(dir).map_err(|source| SettingsSaveError::CreateDir {
            dir: dir.to_path_buf(),
            source,
        })?;
    }

    let payload = serde_json::to_string_pretty(settings)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, payload.as_bytes()).map_err(|source| SettingsSaveError::Stage {
        tmp: tmp.clone(),
        source,
    })?;

    fs::rename(&tmp, path).map_err(|source| {
        let _ = fs::remove_file(&tmp);
        SettingsSaveError::Replace {
            path: path.to_path_buf(),
            source,
        }
    })
}

/// Save with up to three attempts and exponential backoff. Serialization
/// failures are not retried.
pub fn save_settings_with_retry(
    path: &Path,
    settings: &SyncSettings,
) -> Result<(), SettingsSaveError> {
    const ATTEMPTS: u32 = 3;
    const BACKOFF_BASE: Duration = Duration::from_millis(50);

    let mut backoff = BACKOFF_BASE;
    for attempt in 1..ATTEMPTS {
        match save_settings_to_path(path, settings) {
            Ok(()) => return Ok(()),
            Err(err @ SettingsSaveError::Serialize(_)) => return Err(err),
            Err(err) => {
                warn!(attempt, "settings save failed, retrying: {err}");
                std::thread::sleep(backoff);
                backoff *= 2;
            }
        }
    }
    save_settings_to_path(path, settings)
}
