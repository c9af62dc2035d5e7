//! Change-event sources.
//!
//! The engine trusts a user-space change-event source that produces
//! `{path, event_type}` records. Two interchangeable sources feed the same
//! channel:
//!
//! * an external native emitter process whose stdout carries one JSON
//!   record per line (killed on shutdown), or
//! * a built-in `notify` watcher over the monitored directories, bridged
//!   from the watcher callback to the channel by a dedicated thread.

use anyhow::{anyhow, Context, Result};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::Deserialize;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::Sender;
use std::time::Duration;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Deserialize)]
pub struct ChangeRecord {
    pub path: String,
    #[serde(default = "default_event_type")]
    pub event_type: String,
}

fn default_event_type() -> String {
    "created".to_string()
}

/// Keeps the active source alive; dropping or shutting down stops it.
pub struct MonitorHandle {
    child: Option<Child>,
    _watcher: Option<RecommendedWatcher>,
}

impl MonitorHandle {
    /// Kill the external emitter, if one is running. Bridge threads exit on
    /// their own once the pipe closes.
    pub fn shutdown(&mut self) {
        if let Some(child) = self.child.as_mut() {
            if let Err(e) = child.kill() {
                debug!(error = %e, "native monitor already exited");
            }
            let _ = child.wait();
            info!("native monitor stopped");
        }
    }
}

/// Launch the configured emitter binary and bridge its stdout records.
pub fn spawn_native_monitor(command: &str, tx: Sender<ChangeRecord>) -> Result<MonitorHandle> {
    let mut parts = command.split_whitespace();
    let program = parts
        .next()
        .ok_or_else(|| anyhow!("empty monitor command"))?;
    let mut child = Command::new(program)
        .args(parts)
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .with_context(|| format!("spawn native monitor: {program}"))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("native monitor has no stdout"))?;

    std::thread::Builder::new()
        .name("monitor-bridge".into())
        .spawn(move || {
            let reader = BufReader::new(stdout);
            for line in reader.lines() {
                let line = match line {
                    Ok(line) => line,
                    Err(_) => break,
                };
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<ChangeRecord>(&line) {
                    Ok(record) => {
                        if tx.send(record).is_err() {
                            debug!("ingress receiver dropped, stopping monitor bridge");
                            return;
                        }
                    }
                    Err(e) => warn!(error = %e, "unparseable monitor record"),
                }
            }
            debug!("native monitor pipe closed");
        })?;

    info!(command, "native monitor started");
    Ok(MonitorHandle {
        child: Some(child),
        _watcher: None,
    })
}

/// Built-in watcher over the monitored directories, producing the same
/// records the native emitter would.
pub fn spawn_fallback_watcher(
    paths: &[PathBuf],
    tx: Sender<ChangeRecord>,
) -> Result<MonitorHandle> {
    let (sync_tx, sync_rx) = std::sync::mpsc::channel::<notify::Result<Event>>();

    let mut watcher = RecommendedWatcher::new(
        move |res| {
            let _ = sync_tx.send(res);
        },
        Config::default().with_poll_interval(Duration::from_secs(2)),
    )?;

    for path in paths {
        if path.exists() {
            watcher.watch(path, RecursiveMode::Recursive)?;
            info!("watching: {}", path.display());
        } else {
            warn!("path does not exist, cannot watch: {}", path.display());
        }
    }

    std::thread::Builder::new()
        .name("watcher-bridge".into())
        .spawn(move || loop {
            match sync_rx.recv() {
                Ok(Ok(event)) => {
                    for record in classify_event(&event) {
                        if tx.send(record).is_err() {
                            debug!("ingress receiver dropped, stopping watcher bridge");
                            return;
                        }
                    }
                }
                Ok(Err(e)) => error!("file watcher error: {e}"),
                Err(_) => {
                    debug!("watcher channel closed");
                    return;
                }
            }
        })?;

    Ok(MonitorHandle {
        child: None,
        _watcher: Some(watcher),
    })
}

/// Creations and content modifications feed the pipeline; removals and
/// metadata churn are not capture triggers.
fn classify_event(event: &Event) -> Vec<ChangeRecord> {
    let event_type = match &event.kind {
        EventKind::Create(_) => "created",
        EventKind::Modify(modify) => {
            use notify::event::ModifyKind;
            match modify {
                ModifyKind::Metadata(_) => return vec![],
                _ => "modified",
            }
        }
        _ => return vec![],
    };
    event
        .paths
        .iter()
        .map(|p| ChangeRecord {
            path: p.to_string_lossy().to_string(),
            event_type: event_type.to_string(),
        })
        .collect()
}
