use crate::host::{PaneId, PaneRegion, Workspace};

pub fn select_target<W: Workspace + ?Sized>(workspace: &W) -> Option<PaneId> {
    if let Some(active) = workspace.active_pane()
        && workspace.pane_region(&active) == Some(PaneRegion::Root)
    {
        return Some(active);
    }

    workspace
        .root_panes()
        .into_iter()
        .find(|pane| workspace.is_visible(pane))
}

#[cfg(test)]
mod tests {
    use viewsync_core::ViewState;

    use super::*;
    use crate::host::{MemoryPane, MemoryWorkspace};

    fn pane(id: &str, region: PaneRegion) -> MemoryPane {
        MemoryPane::new(id, region, ViewState::new("markdown"))
    }

    #[test]
    fn focused_root_pane_is_selected() {
        let workspace = MemoryWorkspace::new()
            .with_pane(pane("a", PaneRegion::Root))
            .with_pane(pane("b", PaneRegion::Root))
            .with_active("b");
        assert_eq!(select_target(&workspace), Some(PaneId::new("b")));
    }

    #[test]
    fn focused_side_pane_falls_back_to_root() {
        let workspace = MemoryWorkspace::new()
            .with_pane(pane("outline", PaneRegion::RightSidebar))
            .with_pane(pane("doc", PaneRegion::Root))
            .with_active("outline");
        assert_eq!(select_target(&workspace), Some(PaneId::new("doc")));
    }

    #[test]
    fn fallback_skips_hidden_panes() {
        let workspace = MemoryWorkspace::new()
            .with_pane(pane("tab-1", PaneRegion::Root).hidden())
            .with_pane(pane("tab-2", PaneRegion::Root))
            .with_pane(pane("tab-3", PaneRegion::Root));
        assert_eq!(select_target(&workspace), Some(PaneId::new("tab-2")));
    }

    #[test]
    fn focused_pane_need_not_be_visible_to_win() {
        let workspace = MemoryWorkspace::new()
            .with_pane(pane("visible", PaneRegion::Root))
            .with_pane(pane("focused", PaneRegion::Root).hidden())
            .with_active("focused");
        assert_eq!(select_target(&workspace), Some(PaneId::new("focused")));
    }

    #[test]
    fn empty_root_selects_nothing() {
        let workspace = MemoryWorkspace::new()
            .with_pane(pane("backlinks", PaneRegion::LeftSidebar))
            .with_active("backlinks");
        assert_eq!(select_target(&workspace), None);
    }

    #[test]
    fn unknown_active_pane_falls_back() {
        let workspace = MemoryWorkspace::new()
            .with_pane(pane("doc", PaneRegion::Root))
            .with_active("closed");
        assert_eq!(select_target(&workspace), Some(PaneId::new("doc")));
    }
}
