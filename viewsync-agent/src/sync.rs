use std::path::PathBuf;

use thiserror::Error;
use tracing::{debug, info, warn};
use viewsync_core::{
    ChannelKind, Clock, ContentDigest, CoreError, LayoutPayload, StateOverride, SyncRecord,
    Timestamp, ViewStatePayload, decode_record, encode_record, normalize_path,
};

use crate::{
    channel::{LayoutChannel, Recognised, ViewChannel},
    host::{HostError, PaneId, Workspace},
    select::select_target,
    settings::{PathSetting, SettingsSaveError, SyncSettings, save_settings_with_retry},
    storage::{Storage, StorageError, StorageEvent, move_file, write_file},
};

#[derive(Debug, Clone, PartialEq)]
pub enum HostEvent {
    ActivePaneChanged(Option<PaneId>),
    StateChanged {
        pane: PaneId,
        overrides: Option<StateOverride>,
    },
    LayoutChanged,
    Storage(StorageEvent),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    ChannelDisabled,
    NoViewState,
    NoLayout,
    KindNotWatched(String),
    NotActiveTarget,
    FollowDisabled,
    LayoutFollowActive,
    PathMismatch,
    Echo,
    Duplicate,
    Stale,
    NoTarget,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Published {
        channel: ChannelKind,
        path: String,
        timestamp: Timestamp,
    },
    Applied {
        channel: ChannelKind,
        timestamp: Option<Timestamp>,
        pane: Option<PaneId>,
    },
    Renamed {
        setting: PathSetting,
        path: String,
    },
    Skipped(SkipReason),
}

impl Outcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, Outcome::Applied { .. })
    }

    pub fn is_published(&self) -> bool {
        matches!(self, Outcome::Published { .. })
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Host(#[from] HostError),
    #[error("malformed {channel} record: {source}")]
    Malformed {
        channel: ChannelKind,
        #[source]
        source: CoreError,
    },
    #[error(transparent)]
    Core(#[from] CoreError),
    #[error("settings save failed: {0}")]
    Settings(#[from] SettingsSaveError),
}

pub struct ViewSync<W, S, C> {
    workspace: W,
    storage: S,
    clock: C,
    settings: SyncSettings,
    settings_path: Option<PathBuf>,
    view: ViewChannel,
    layout: LayoutChannel,
}

impl<W: Workspace, S: Storage, C: Clock> ViewSync<W, S, C> {
    pub fn new(workspace: W, storage: S, clock: C, settings: SyncSettings) -> Self {
        Self {
            view: ViewChannel::from_settings(&settings),
            layout: LayoutChannel::from_settings(&settings),
            workspace,
            storage,
            clock,
            settings,
            settings_path: None,
        }
    }

    #[must_use]
    pub fn with_settings_path(mut self, path: PathBuf) -> Self {
        self.settings_path = Some(path);
        self
    }

    pub fn workspace(&self) -> &W {
        &self.workspace
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn storage_mut(&mut self) -> &mut S {
        &mut self.storage
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    pub fn view_channel(&self) -> &ViewChannel {
        &self.view
    }

    pub fn layout_channel(&self) -> &LayoutChannel {
        &self.layout
    }

    pub fn save_settings(&self) -> Result<(), SyncError> {
        if let Some(path) = &self.settings_path {
            save_settings_with_retry(path, &self.settings)?;
        }
        Ok(())
    }

    pub fn dispatch(&mut self, event: HostEvent) -> Vec<Outcome> {
        let results = match event {
            HostEvent::ActivePaneChanged(None) => Vec::new(),
            HostEvent::ActivePaneChanged(Some(pane)) => vec![self.capture_view(&pane, None)],
            HostEvent::StateChanged { pane, overrides } => vec![
                self.capture_view(&pane, overrides.as_ref()),
                self.capture_layout(),
            ],
            HostEvent::LayoutChanged => vec![self.capture_layout()],
            HostEvent::Storage(StorageEvent::Modified(path)) => {
                vec![self.apply_view(&path), self.apply_layout(&path)]
            }
            HostEvent::Storage(StorageEvent::Renamed { from, to }) => {
                vec![self.track_rename(&from, &to)]
            }
        };

        results
            .into_iter()
            .filter_map(|result| match result {
                Ok(outcome) => Some(outcome),
                Err(err) => {
                    warn!("sync event dropped: {err}");
                    None
                }
            })
            .collect()
    }

    pub fn capture_view(
        &mut self,
        pane: &PaneId,
        overrides: Option<&StateOverride>,
    ) -> Result<Outcome, SyncError> {
        if !self.view.is_publishing() {
            return Ok(skip(ChannelKind::View, SkipReason::ChannelDisabled));
        }

        let Some(view_state) = self.workspace.view_state(pane) else {
            return Ok(skip(ChannelKind::View, SkipReason::NoViewState));
        };
        if !self.view.watches(&view_state.kind) {
            return Ok(skip(
                ChannelKind::View,
                SkipReason::KindNotWatched(view_state.kind),
            ));
        }
        if select_target(&self.workspace).as_ref() != Some(pane) {
            return Ok(skip(ChannelKind::View, SkipReason::NotActiveTarget));
        }

        let mut payload = ViewStatePayload::new(view_state, self.workspace.ephemeral_state(pane));
        if let Some(overrides) = overrides {
            payload = payload.with_override(overrides)?;
        }

        let timestamp = self.view.state.stamp(self.clock.now_ms());
        let text = encode_record(&SyncRecord::new(timestamp, payload))?;
        let digest = ContentDigest::of(&text);
        self.view.state.record_published(digest);

        let path = self.view.outbound_path.clone();
        write_file(&mut self.storage, &path, &text)?;

        info!(channel = %ChannelKind::View, %pane, %path, timestamp, %digest, "published");
        Ok(Outcome::Published {
            channel: ChannelKind::View,
            path,
            timestamp,
        })
    }

    pub fn capture_layout(&mut self) -> Result<Outcome, SyncError> {
        if !self.layout.is_publishing() {
            return Ok(skip(ChannelKind::Layout, SkipReason::ChannelDisabled));
        }

        let tree = self.workspace.layout();
        if tree.is_null() {
            return Ok(skip(ChannelKind::Layout, SkipReason::NoLayout));
        }
        let payload = LayoutPayload::new(tree);
        let timestamp = self.layout.state.stamp(self.clock.now_ms());
        let text = encode_record(&SyncRecord::new(timestamp, payload))?;
        let digest = ContentDigest::of(&text);
        self.layout.state.record_published(digest);

        let path = self.layout.outbound_path.clone();
        write_file(&mut self.storage, &path, &text)?;

        info!(channel = %ChannelKind::Layout, %path, timestamp, %digest, "published");
        Ok(Outcome::Published {
            channel: ChannelKind::Layout,
            path,
            timestamp,
        })
    }

    pub fn apply_view(&mut self, path: &str) -> Result<Outcome, SyncError> {
        if self.layout.follow {
            return Ok(skip(ChannelKind::View, SkipReason::LayoutFollowActive));
        }
        if !self.view.is_subscribed() {
            return Ok(skip(ChannelKind::View, SkipReason::FollowDisabled));
        }
        if normalize_path(path) != self.view.inbound_path {
            return Ok(skip(ChannelKind::View, SkipReason::PathMismatch));
        }

        let text = self.storage.read(&self.view.inbound_path)?;
        let digest = ContentDigest::of(&text);
        if let Some(recognised) = self.view.state.recognise(&digest) {
            return Ok(skip(ChannelKind::View, recognised.into()));
        }

        let record: SyncRecord<ViewStatePayload> =
            decode_record(&text).map_err(|source| SyncError::Malformed {
                channel: ChannelKind::View,
                source,
            })?;
        if let Some(reason) = guard_verdict(
            self.view
                .state
                .admit(record.timestamp, self.view.accept_only_if_newer),
        )? {
            return Ok(skip(ChannelKind::View, reason));
        }

        let Some(pane) = select_target(&self.workspace) else {
            return Ok(skip(ChannelKind::View, SkipReason::NoTarget));
        };
        self.workspace
            .set_view_state(&pane, &record.payload.view_state)?;
        if let Some(ephemeral) = &record.payload.ephemeral_state {
            self.workspace.set_ephemeral_state(&pane, ephemeral)?;
        }
        self.view.state.record_applied(digest);

        info!(
            channel = %ChannelKind::View,
            %pane,
            kind = %record.payload.view_kind(),
            timestamp = ?record.timestamp,
            %digest,
            "applied"
        );

        if self.settings.open_after_sync {
            match self.workspace.open_in_default_app(&pane) {
                Ok(true) => debug!(%pane, "opened in associated app"),
                Ok(false) => {}
                Err(err) => warn!(%pane, "open in associated app failed: {err}"),
            }
        }

        Ok(Outcome::Applied {
            channel: ChannelKind::View,
            timestamp: record.timestamp,
            pane: Some(pane),
        })
    }

    pub fn apply_layout(&mut self, path: &str) -> Result<Outcome, SyncError> {
        if !self.layout.is_subscribed() {
            return Ok(skip(ChannelKind::Layout, SkipReason::FollowDisabled));
        }
        if normalize_path(path) != self.layout.inbound_path {
            return Ok(skip(ChannelKind::Layout, SkipReason::PathMismatch));
        }

        let text = self.storage.read(&self.layout.inbound_path)?;
        let digest = ContentDigest::of(&text);
        if let Some(recognised) = self.layout.state.recognise(&digest) {
            return Ok(skip(ChannelKind::Layout, recognised.into()));
        }

        let record: SyncRecord<LayoutPayload> =
            decode_record(&text).map_err(|source| SyncError::Malformed {
                channel: ChannelKind::Layout,
                source,
            })?;
        if let Some(reason) = guard_verdict(
            self.layout
                .state
                .admit(record.timestamp, self.layout.accept_only_if_newer),
        )? {
            return Ok(skip(ChannelKind::Layout, reason));
        }

        self.workspace.change_layout(&record.payload.tree)?;
        self.layout.state.record_applied(digest);

        info!(channel = %ChannelKind::Layout, timestamp = ?record.timestamp, %digest, "applied");
        Ok(Outcome::Applied {
            channel: ChannelKind::Layout,
            timestamp: record.timestamp,
            pane: None,
        })
    }

    pub fn track_rename(&mut self, from: &str, to: &str) -> Result<Outcome, SyncError> {
        let from = normalize_path(from);
        if from.is_empty() || from != self.view.outbound_path {
            return Ok(Outcome::Skipped(SkipReason::PathMismatch));
        }

        let to = normalize_path(to);
        self.settings.own_path = to.clone();
        self.view.reconfigure(&self.settings);
        self.save_settings()?;

        info!(%from, %to, "outbound view file renamed; following");
        Ok(Outcome::Renamed {
            setting: PathSetting::OwnPath,
            path: to,
        })
    }

    /// Change a configured path. An existing file at the old location moves
    /// with the setting.
    pub fn set_path(&mut self, setting: PathSetting, value: &str) -> Result<(), SyncError> {
        let old = normalize_path(setting.get(&self.settings));
        let new = normalize_path(value);

        setting.set(&mut self.settings, value.trim().to_owned());
        self.view.reconfigure(&self.settings);
        self.layout.reconfigure(&self.settings);
        self.save_settings()?;

        if !old.is_empty() && !new.is_empty() && old != new && self.storage.is_file(&old) {
            move_file(&mut self.storage, &old, &new)?;
            info!(%setting, from = %old, to = %new, "moved sync file");
        } else {
            info!(%setting, path = %new, "path updated");
        }
        Ok(())
    }

    pub fn update_settings(
        &mut self,
        edit: impl FnOnce(&mut SyncSettings),
    ) -> Result<(), SyncError> {
        edit(&mut self.settings);
        self.view.reconfigure(&self.settings);
        self.layout.reconfigure(&self.settings);
        self.save_settings()
    }
}

impl From<Recognised> for SkipReason {
    fn from(recognised: Recognised) -> Self {
        match recognised {
            Recognised::Echo => SkipReason::Echo,
            Recognised::Duplicate => SkipReason::Duplicate,
        }
    }
}

fn guard_verdict(verdict: Result<(), CoreError>) -> Result<Option<SkipReason>, SyncError> {
    match verdict {
        Ok(()) => Ok(None),
        Err(CoreError::StaleRecord { .. }) => Ok(Some(SkipReason::Stale)),
        Err(other) => Err(other.into()),
    }
}

fn skip(channel: ChannelKind, reason: SkipReason) -> Outcome {
    debug!(%channel, ?reason, "skipped");
    Outcome::Skipped(reason)
}
