use viewsync_core::{ChannelClock, ContentDigest, CoreError, Timestamp, normalize_path};

use crate::settings::SyncSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recognised {
    Echo,
    Duplicate,
}

#[derive(Debug, Clone, Default)]
pub struct ChannelState {
    clock: ChannelClock,
    published: Option<ContentDigest>,
    applied: Option<ContentDigest>,
}

impl ChannelState {
    pub fn last_published(&self) -> Timestamp {
        self.clock.last_published()
    }

    pub(crate) fn stamp(&mut self, now_ms: Timestamp) -> Timestamp {
        self.clock.stamp(now_ms)
    }

    pub(crate) fn record_published(&mut self, digest: ContentDigest) {
        self.published = Some(digest);
    }

    pub(crate) fn record_applied(&mut self, digest: ContentDigest) {
        self.applied = Some(digest);
    }

    pub fn recognise(&self, digest: &ContentDigest) -> Option<Recognised> {
        if self.published.as_ref() == Some(digest) {
            Some(Recognised::Echo)
        } else if self.applied.as_ref() == Some(digest) {
            Some(Recognised::Duplicate)
        } else {
            None
        }
    }

    pub fn admit(
        &self,
        timestamp: Option<Timestamp>,
        accept_only_if_newer: bool,
    ) -> Result<(), CoreError> {
        self.clock.admit(timestamp, accept_only_if_newer)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ViewChannel {
    pub outbound_path: String,
    pub inbound_path: String,
    pub follow: bool,
    pub accept_only_if_newer: bool,
    pub watched_view_kinds: Vec<String>,
    pub(crate) state: ChannelState,
}

impl ViewChannel {
    pub fn from_settings(settings: &SyncSettings) -> Self {
        let mut channel = Self::default();
        channel.reconfigure(settings);
        channel
    }

    pub fn reconfigure(&mut self, settings: &SyncSettings) {
        self.outbound_path = normalize_path(&settings.own_path);
        self.inbound_path = normalize_path(&settings.watch_path);
        self.follow = settings.watch_another;
        self.accept_only_if_newer = settings.accept_only_if_newer;
        self.watched_view_kinds = settings.view_types.clone();
    }

    pub fn is_publishing(&self) -> bool {
        !self.outbound_path.is_empty()
    }

    pub fn is_subscribed(&self) -> bool {
        self.follow && !self.inbound_path.is_empty()
    }

    pub fn watches(&self, kind: &str) -> bool {
        self.watched_view_kinds.iter().any(|watched| watched == kind)
    }

    pub fn state(&self) -> &ChannelState {
        &self.state
    }
}

#[derive(Debug, Clone, Default)]
pub struct LayoutChannel {
    pub outbound_path: String,
    pub inbound_path: String,
    pub follow: bool,
    pub accept_only_if_newer: bool,
    pub(crate) state: ChannelState,
}

impl LayoutChannel {
    pub fn from_settings(settings: &SyncSettings) -> Self {
        let mut channel = Self::default();
        channel.reconfigure(settings);
        channel
    }

    pub fn reconfigure(&mut self, settings: &SyncSettings) {
        self.outbound_path = normalize_path(&settings.own_workspace_path);
        self.inbound_path = normalize_path(&settings.watch_workspace_path);
        self.follow = settings.watch_another_workspace;
        self.accept_only_if_newer = settings.workspace_accept_only_if_newer;
    }

    pub fn is_publishing(&self) -> bool {
        !self.outbound_path.is_empty()
    }

    pub fn is_subscribed(&self) -> bool {
        self.follow && !self.inbound_path.is_empty()
    }

    pub fn state(&self) -> &ChannelState {
        &self.state
    }
}
