use crate::error::Result;
use crate::manager::ConnectionManager;
use mcp_types::ParsedConfig;
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

const DEBOUNCE: Duration = Duration::from_millis(200);

/// Read and parse a server configuration file.
pub async fn load_config(path: &Path) -> Result<ParsedConfig> {
    let content = tokio::fs::read_to_string(path).await?;
    Ok(ParsedConfig::from_json_str(&content)?)
}

/// Follows edits to the configuration file and applies them to a manager.
///
/// The parent directory is watched rather than the file itself so editors
/// that save by replacing the file are still noticed.
pub struct ConfigWatcher {
    _watcher: RecommendedWatcher,
    task: JoinHandle<()>,
}

impl ConfigWatcher {
    pub fn spawn(path: impl Into<PathBuf>, manager: ConnectionManager) -> Result<Self> {
        let path = path.into();
        let (tx, rx) = mpsc::unbounded_channel();

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    let _ = tx.send(event);
                }
                Err(e) => error!("Config watch error: {}", e),
            },
            Config::default(),
        )?;

        let dir = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };
        watcher.watch(&dir, RecursiveMode::NonRecursive)?;
        info!("Watching {} for changes", path.display());

        let task = tokio::spawn(reload_loop(path, rx, manager));
        Ok(Self {
            _watcher: watcher,
            task,
        })
    }

    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for ConfigWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn touches(event: &Event, path: &Path) -> bool {
    if !matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    ) {
        return false;
    }
    let Some(file_name) = path.file_name() else {
        return false;
    };
    event
        .paths
        .iter()
        .any(|changed| changed.file_name() == Some(file_name))
}

async fn reload_loop(
    path: PathBuf,
    mut events: mpsc::UnboundedReceiver<Event>,
    manager: ConnectionManager,
) {
    let mut deadline: Option<Instant> = None;

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => {
                    if touches(&event, &path) {
                        debug!("Config file event: {:?}", event.kind);
                        deadline = Some(Instant::now() + DEBOUNCE);
                    }
                }
                None => {
                    warn!("Config watch channel closed");
                    break;
                }
            },
            _ = sleep(Duration::from_millis(50)), if deadline.is_some() => {
                if deadline.is_some_and(|at| Instant::now() >= at) {
                    deadline = None;
                    reload(&path, &manager).await;
                }
            }
        }
    }
}

async fn reload(path: &Path, manager: &ConnectionManager) {
    match load_config(path).await {
        Ok(config) => {
            let diff = manager.apply_config(config).await;
            if !diff.is_empty() {
                info!("Configuration reloaded from {}", path.display());
            }
        }
        // Usually a save in progress; the next event retries
        Err(e) => warn!("Keeping current configuration, reload failed: {}", e),
    }
}
