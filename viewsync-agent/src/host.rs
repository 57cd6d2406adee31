use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use viewsync_core::ViewState;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PaneId(pub String);

impl PaneId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for PaneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PaneRegion {
    #[default]
    Root,
    LeftSidebar,
    RightSidebar,
    Floating,
}

#[derive(Debug, Error)]
pub enum HostError {
    #[error("unknown pane {0}")]
    UnknownPane(PaneId),
    #[error("host rejected the operation: {0}")]
    Rejected(String),
}

pub trait Workspace {
    fn active_pane(&self) -> Option<PaneId>;

    fn pane_region(&self, pane: &PaneId) -> Option<PaneRegion>;

    fn root_panes(&self) -> Vec<PaneId>;

    fn is_visible(&self, pane: &PaneId) -> bool;

    fn view_state(&self, pane: &PaneId) -> Option<ViewState>;

    fn set_view_state(&mut self, pane: &PaneId, state: &ViewState) -> Result<(), HostError>;

    /// State the view does not include in `view_state`, such as caret or
    /// in-document scroll position.
    fn ephemeral_state(&self, pane: &PaneId) -> Option<Value>;

    fn set_ephemeral_state(&mut self, pane: &PaneId, state: &Value) -> Result<(), HostError>;

    fn layout(&self) -> Value;

    fn change_layout(&mut self, layout: &Value) -> Result<(), HostError>;

    /// Hand the pane's backing file to the platform's associated app.
    /// Returns `false` when the host has no such action.
    fn open_in_default_app(&mut self, _pane: &PaneId) -> Result<bool, HostError> {
        Ok(false)
    }
}

fn default_visible() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MemoryPane {
    pub id: PaneId,
    #[serde(default)]
    pub region: PaneRegion,
    #[serde(default = "default_visible")]
    pub visible: bool,
    pub view_state: ViewState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ephemeral_state: Option<Value>,
}

impl MemoryPane {
    pub fn new(id: &str, region: PaneRegion, view_state: ViewState) -> Self {
        Self {
            id: PaneId::new(id),
            region,
            visible: true,
            view_state,
            ephemeral_state: None,
        }
    }

    #[must_use]
    pub fn hidden(mut self) -> Self {
        self.visible = false;
        self
    }

    #[must_use]
    pub fn with_ephemeral_state(mut self, state: Value) -> Self {
        self.ephemeral_state = Some(state);
        self
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MemoryWorkspace {
    #[serde(default)]
    pub panes: Vec<MemoryPane>,
    #[serde(default)]
    pub active: Option<PaneId>,
    #[serde(default)]
    pub layout: Value,
    #[serde(skip)]
    pub opened: Vec<PaneId>,
}

impl MemoryWorkspace {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_pane(mut self, pane: MemoryPane) -> Self {
        self.panes.push(pane);
        self
    }

    #[must_use]
    pub fn with_active(mut self, id: &str) -> Self {
        self.active = Some(PaneId::new(id));
        self
    }

    #[must_use]
    pub fn with_layout(mut self, layout: Value) -> Self {
        self.layout = layout;
        self
    }

    pub fn pane(&self, id: &PaneId) -> Option<&MemoryPane> {
        self.panes.iter().find(|pane| &pane.id == id)
    }

    pub fn pane_mut(&mut self, id: &PaneId) -> Option<&mut MemoryPane> {
        self.panes.iter_mut().find(|pane| &pane.id == id)
    }

    pub fn set_active(&mut self, id: Option<&str>) {
        self.active = id.map(PaneId::new);
    }

    fn pane_or_err(&mut self, id: &PaneId) -> Result<&mut MemoryPane, HostError> {
        self.pane_mut(id)
            .ok_or_else(|| HostError::UnknownPane(id.clone()))
    }
}

impl Workspace for MemoryWorkspace {
    fn active_pane(&self) -> Option<PaneId> {
        self.active.clone()
    }

    fn pane_region(&self, pane: &PaneId) -> Option<PaneRegion> {
        self.pane(pane).map(|pane| pane.region)
    }

    fn root_panes(&self) -> Vec<PaneId> {
        self.panes
            .iter()
            .filter(|pane| pane.region == PaneRegion::Root)
            .map(|pane| pane.id.clone())
            .collect()
    }

    fn is_visible(&self, pane: &PaneId) -> bool {
        self.pane(pane).is_some_and(|pane| pane.visible)
    }

    fn view_state(&self, pane: &PaneId) -> Option<ViewState> {
        self.pane(pane).map(|pane| pane.view_state.clone())
    }

    fn set_view_state(&mut self, pane: &PaneId, state: &ViewState) -> Result<(), HostError> {
        self.pane_or_err(pane)?.view_state = state.clone();
        Ok(())
    }

    fn ephemeral_state(&self, pane: &PaneId) -> Option<Value> {
        self.pane(pane).and_then(|pane| pane.ephemeral_state.clone())
    }

    fn set_ephemeral_state(&mut self, pane: &PaneId, state: &Value) -> Result<(), HostError> {
        self.pane_or_err(pane)?.ephemeral_state = Some(state.clone());
        Ok(())
    }

    fn layout(&self) -> Value {
        self.layout.clone()
    }

    fn change_layout(&mut self, layout: &Value) -> Result<(), HostError> {
        if !layout.is_object() {
            return Err(HostError::Rejected("layout must be a JSON object".to_owned()));
        }
        self.layout = layout.clone();
        Ok(())
    }

    fn open_in_default_app(&mut self, pane: &PaneId) -> Result<bool, HostError> {
        self.pane_or_err(pane)?;
        self.opened.push(pane.clone());
        Ok(true)
    }
}
