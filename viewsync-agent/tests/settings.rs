use std::io::Write;

use viewsync_agent::{
    HostEvent, ViewSync,
    host::MemoryWorkspace,
    settings::{
        MAX_SETTINGS_BYTES, SettingsSaveError, SyncSettings, load_settings,
        load_settings_from_path, save_settings_to_path, save_settings_with_retry, settings_path,
    },
    storage::{MemoryStorage, StorageEvent},
};
use viewsync_core::ManualClock;

#[test]
fn missing_file_yields_defaults() {
    let dir = tempfile::tempdir().expect("create tempdir");
    let settings = load_settings(&settings_path(dir.path()));
    assert_eq!(settings, SyncSettings::default());
    assert_eq!(settings.view_types, vec!["pdf"]);
    assert!(settings.accept_only_if_newer);
    assert!(settings.workspace_accept_only_if_newer);
}

#[test]
fn oversized_file_is_rejected() {
    let dir = tempfile::tempdir().expect("create tempdir");
    let path = settings_path(dir.path());

    let mut file = std::fs::File::create(&path).expect("create settings.json");
    file.write_all(&vec![b' '; (MAX_SETTINGS_BYTES as usize) + 1024])
        .expect("write oversized settings.json");
    drop(file);

    let err = load_settings_from_path(&path).expect_err("oversized file should error");
    let msg = err.to_string();
    assert!(msg.contains("too large"), "unexpected error: {msg}");
    assert_eq!(load_settings(&path), SyncSettings::default());
}

#[test]
fn malformed_file_falls_back_to_defaults() {
    let dir = tempfile::tempdir().expect("create tempdir");
    let path = settings_path(dir.path());
    std::fs::write(&path, "{ownPath: oops").expect("write settings.json");

    assert!(load_settings_from_path(&path).is_err());
    assert_eq!(load_settings(&path), SyncSettings::default());
}

#[test]
fn saved_settings_load_back() {
    let dir = tempfile::tempdir().expect("create tempdir");
    let path = settings_path(&dir.path().join("nested"));
    let settings = SyncSettings {
        own_path: "sync/view-a.json".to_owned(),
        view_types: vec!["pdf".to_owned(), "markdown".to_owned()],
        watch_another: true,
        watch_path: "sync/view-b.json".to_owned(),
        accept_only_if_newer: false,
        open_after_sync: true,
        ..SyncSettings::default()
    };

    save_settings_with_retry(&path, &settings).expect("save settings");
    assert!(!path.with_extension("json.tmp").exists());
    assert_eq!(load_settings_from_path(&path).expect("load settings"), settings);

    let raw = std::fs::read_to_string(&path).expect("read settings.json");
    assert!(raw.contains("\"ownPath\""), "keys are camelCase: {raw}");
    assert!(raw.contains("\"workspaceAcceptOnlyIfNewer\""));
}

#[test]
fn startup_save_materializes_defaults() {
    let dir = tempfile::tempdir().expect("create tempdir");
    let path = settings_path(dir.path());
    let sync = ViewSync::new(
        MemoryWorkspace::new(),
        MemoryStorage::new(),
        ManualClock::new(0),
        load_settings(&path),
    )
    .with_settings_path(path.clone());

    sync.save_settings().expect("save settings");
    assert_eq!(
        load_settings_from_path(&path).expect("load settings"),
        SyncSettings::default()
    );
}

#[test]
fn tracked_rename_is_persisted() {
    let dir = tempfile::tempdir().expect("create tempdir");
    let path = settings_path(dir.path());
    let settings = SyncSettings {
        own_path: "view-a.json".to_owned(),
        ..SyncSettings::default()
    };
    let mut sync = ViewSync::new(
        MemoryWorkspace::new(),
        MemoryStorage::new(),
        ManualClock::new(0),
        settings,
    )
    .with_settings_path(path.clone());

    sync.dispatch(HostEvent::Storage(StorageEvent::Renamed {
        from: "view-a.json".to_owned(),
        to: "moved/view-a.json".to_owned(),
    }));

    let stored = load_settings_from_path(&path).expect("load settings");
    assert_eq!(stored.own_path, "moved/view-a.json");
}

#[test]
fn save_replaces_existing_record() {
    let dir = tempfile::tempdir().expect("create tempdir");
    let path = settings_path(dir.path());
    let first = SyncSettings {
        own_path: "view-a.json".to_owned(),
        ..SyncSettings::default()
    };
    let second = SyncSettings {
        own_path: "view-b.json".to_owned(),
        ..SyncSettings::default()
    };

    save_settings_to_path(&path, &first).expect("first save");
    save_settings_to_path(&path, &second).expect("second save");
    assert_eq!(load_settings_from_path(&path).expect("load settings"), second);
    assert!(!path.with_extension("json.tmp").exists());
}

#[test]
fn failed_save_keeps_previous_record() {
    let dir = tempfile::tempdir().expect("create tempdir");
    let path = settings_path(dir.path());
    let stored = SyncSettings {
        own_path: "view-a.json".to_owned(),
        watch_another: true,
        ..SyncSettings::default()
    };
    save_settings_to_path(&path, &stored).expect("initial save");

    // A directory in the staging slot makes the staging write fail.
    std::fs::create_dir(path.with_extension("json.tmp")).expect("block staging file");
    let err = save_settings_with_retry(&path, &SyncSettings::default())
        .expect_err("staging write should fail");
    assert!(matches!(err, SettingsSaveError::Stage { .. }), "unexpected error: {err}");

    assert_eq!(load_settings(&path), stored);
}
