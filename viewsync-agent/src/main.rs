use std::{
    fs::{self, OpenOptions},
    path::{Path, PathBuf},
    sync::Mutex,
};

use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use viewsync_agent::{
    HostEvent, Outcome, ViewSync,
    host::{MemoryWorkspace, Workspace},
    settings::{
        SettingKey, SyncSettings, default_config_dir, load_settings, save_settings_with_retry,
        settings_path,
    },
    storage::{FsStorage, Storage, StorageEvent},
    watch::watch_storage,
};
use viewsync_core::{
    LayoutPayload, MAX_RECORD_BYTES, SyncRecord, SystemClock, ViewStatePayload, decode_record,
};

#[derive(Parser, Debug)]
#[command(name = "viewsync", about = "Mirror view state and layout through shared files")]
struct Cli {
    /// Directory holding settings.json. Defaults to $VIEWSYNC_CONFIG_DIR or ~/.config/viewsync.
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    /// Append logs to this file instead of stderr.
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Watch the shared storage and apply incoming state to the workspace snapshot.
    Run {
        #[arg(long)]
        root: PathBuf,
        /// JSON snapshot of the local workspace.
        #[arg(long)]
        workspace: PathBuf,
    },
    /// Publish the snapshot's active view (and optionally its layout) once.
    Publish {
        #[arg(long)]
        root: PathBuf,
        #[arg(long)]
        workspace: PathBuf,
        #[arg(long, default_value_t = false)]
        layout: bool,
    },
    /// Decode a sync file and print it.
    Inspect {
        file: PathBuf,
        /// Decode as a layout record instead of a view record.
        #[arg(long, default_value_t = false)]
        layout: bool,
    },
    /// Show or edit the settings record.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    Show,
    Set {
        key: String,
        value: String,
        /// Storage root; when given, an existing sync file moves with a path setting.
        #[arg(long)]
        root: Option<PathBuf>,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.log_file.as_deref());

    let config_dir = cli.config_dir.unwrap_or_else(default_config_dir);
    let result = match cli.command {
        Command::Run { root, workspace } => run(&config_dir, &root, &workspace).await,
        Command::Publish {
            root,
            workspace,
            layout,
        } => publish(&config_dir, &root, &workspace, layout),
        Command::Inspect { file, layout } => inspect(&file, layout),
        Command::Config { action } => config(&config_dir, action),
    };

    if let Err(err) = result {
        error!("{err}");
        std::process::exit(1);
    }
}

fn init_logging(log_file: Option<&Path>) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let Some(log_path) = log_file else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .init();
        return;
    };

    match OpenOptions::new().create(true).append(true).open(log_path) {
        Ok(file) => tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_ansi(false)
            .with_writer(Mutex::new(file))
            .init(),
        Err(err) => {
            eprintln!("failed to open log file {}: {err}", log_path.display());
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

type Engine = ViewSync<MemoryWorkspace, FsStorage, SystemClock>;

fn open_engine(config_dir: &Path, root: &Path, workspace: MemoryWorkspace) -> Result<Engine, String> {
    let path = settings_path(config_dir);
    let settings = load_settings(&path);
    let storage = FsStorage::open(root).map_err(|err| err.to_string())?;
    Ok(ViewSync::new(workspace, storage, SystemClock, settings).with_settings_path(path))
}

fn load_workspace(path: &Path) -> Result<MemoryWorkspace, String> {
    let data = fs::read_to_string(path)
        .map_err(|err| format!("read workspace {}: {err}", path.display()))?;
    serde_json::from_str(&data).map_err(|err| format!("parse workspace {}: {err}", path.display()))
}

fn save_workspace(path: &Path, workspace: &MemoryWorkspace) -> Result<(), String> {
    let payload = serde_json::to_string_pretty(workspace).map_err(|err| err.to_string())?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, payload.as_bytes())
        .map_err(|err| format!("write workspace {}: {err}", tmp.display()))?;
    fs::rename(&tmp, path).map_err(|err| format!("replace workspace {}: {err}", path.display()))
}

async fn run(config_dir: &Path, root: &Path, workspace_path: &Path) -> Result<(), String> {
    let workspace = load_workspace(workspace_path)?;
    let mut sync = open_engine(config_dir, root, workspace)?;
    sync.save_settings().map_err(|err| err.to_string())?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let _watcher = watch_storage(sync.storage().root().to_path_buf(), tx)
        .map_err(|err| format!("watch {}: {err}", root.display()))?;

    let view = sync.view_channel();
    let layout = sync.layout_channel();
    info!(
        root = %sync.storage().root().display(),
        view_out = %view.outbound_path,
        view_in = %view.inbound_path,
        view_follow = view.follow,
        layout_out = %layout.outbound_path,
        layout_in = %layout.inbound_path,
        layout_follow = layout.follow,
        "agent running"
    );

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            event = rx.recv() => {
                let Some(event) = event else { break };
                handle_storage_event(&mut sync, workspace_path, event);
            }
            _ = &mut shutdown => {
                info!("shutting down");
                break;
            }
        }
    }
    Ok(())
}

fn handle_storage_event(
    sync: &mut Engine,
    workspace_path: &Path,
    event: StorageEvent,
) -> Vec<Outcome> {
    let outcomes = sync.dispatch(HostEvent::Storage(event));
    if outcomes.iter().any(Outcome::is_applied)
        && let Err(err) = save_workspace(workspace_path, sync.workspace())
    {
        warn!("workspace snapshot not saved: {err}");
    }
    outcomes
}

fn publish(
    config_dir: &Path,
    root: &Path,
    workspace_path: &Path,
    layout: bool,
) -> Result<(), String> {
    let workspace = load_workspace(workspace_path)?;
    let mut sync = open_engine(config_dir, root, workspace)?;

    let active = sync.workspace().active_pane();
    let mut outcomes = sync.dispatch(HostEvent::ActivePaneChanged(active));
    if layout {
        outcomes.extend(sync.dispatch(HostEvent::LayoutChanged));
    }

    for outcome in &outcomes {
        println!("{outcome:?}");
    }
    if outcomes.iter().any(Outcome::is_published) {
        Ok(())
    } else {
        Err("nothing was published".to_owned())
    }
}

fn inspect(file: &Path, layout: bool) -> Result<(), String> {
    let meta = fs::metadata(file).map_err(|err| format!("{}: {err}", file.display()))?;
    if meta.len() > MAX_RECORD_BYTES as u64 {
        return Err(format!("{} is too large to be a sync file", file.display()));
    }
    let text = fs::read_to_string(file).map_err(|err| format!("{}: {err}", file.display()))?;

    let (timestamp, payload) = if layout {
        let record: SyncRecord<LayoutPayload> =
            decode_record(&text).map_err(|err| err.to_string())?;
        (record.timestamp, serde_json::to_value(&record.payload))
    } else {
        let record: SyncRecord<ViewStatePayload> =
            decode_record(&text).map_err(|err| err.to_string())?;
        (record.timestamp, serde_json::to_value(&record.payload))
    };
    let payload = payload.map_err(|err| err.to_string())?;
    let pretty = serde_json::to_string_pretty(&payload).map_err(|err| err.to_string())?;

    match timestamp {
        Some(ts) => println!("timestamp: {ts}"),
        None => println!("timestamp: (none)"),
    }
    println!("{pretty}");
    Ok(())
}

fn config(config_dir: &Path, action: ConfigAction) -> Result<(), String> {
    let path = settings_path(config_dir);
    match action {
        ConfigAction::Show => {
            let settings = load_settings(&path);
            let pretty = serde_json::to_string_pretty(&settings).map_err(|err| err.to_string())?;
            println!("{pretty}");
            Ok(())
        }
        ConfigAction::Set { key, value, root } => {
            let key: SettingKey = key.parse()?;
            match (key, root) {
                (SettingKey::Path(setting), Some(root)) => {
                    let mut sync = open_engine(config_dir, &root, MemoryWorkspace::new())?;
                    sync.set_path(setting, &value).map_err(|err| err.to_string())
                }
                (key, _) => {
                    let mut settings: SyncSettings = load_settings(&path);
                    settings.apply(key, &value)?;
                    save_settings_with_retry(&path, &settings).map_err(|err| err.to_string())?;
                    info!(path = %path.display(), "settings saved");
                    Ok(())
                }
            }
        }
    }
}
