use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use tracing::{info, warn};
use vwar_core::config::EngineConfig;
use vwar_core::paths::Layout;

use vwar_service::engine::Engine;
use vwar_service::ingress::spawn_ingress;
use vwar_service::license::{activate, LicenseValidator};
use vwar_service::monitor::{spawn_fallback_watcher, spawn_native_monitor};
use vwar_service::vault::capture::CaptureEngine;
use vwar_service::vault::processor::VaultProcessor;

#[derive(Parser, Debug)]
#[command(author, version, about = "VWAR ScanVault engine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the capture/scan/route engine
    Run {
        #[arg(long)]
        root: Option<PathBuf>,
    },
    /// Print on-disk engine state (queue, quarantine, rules, license)
    Status {
        #[arg(long)]
        root: Option<PathBuf>,
    },
    /// Activate this machine with a license key
    Activate {
        #[arg(long)]
        key: String,
        #[arg(long)]
        auto_renew: bool,
        #[arg(long)]
        root: Option<PathBuf>,
    },
    /// Toggle server-side auto-renew for the activated license
    AutoRenew {
        #[arg(long)]
        enable: bool,
        #[arg(long)]
        root: Option<PathBuf>,
    },
    /// Upload one rule to the shared signature library
    InsertRule {
        #[arg(long)]
        category: String,
        #[arg(long)]
        name: String,
        /// File whose content is the rule pattern
        #[arg(long)]
        file: PathBuf,
        #[arg(long)]
        root: Option<PathBuf>,
    },
}

fn resolve_layout(root: Option<PathBuf>) -> Result<Layout> {
    match root {
        Some(root) => Ok(Layout::new(root)),
        None => Layout::discover(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();
    match cli.command {
        Commands::Run { root } => run_command(root).await,
        Commands::Status { root } => status_command(root),
        Commands::Activate {
            key,
            auto_renew,
            root,
        } => {
            let layout = resolve_layout(root)?;
            layout.ensure()?;
            let config = EngineConfig::load(&layout.config_file());
            activate::activate(&layout, &config, &key, auto_renew).await
        }
        Commands::AutoRenew { enable, root } => auto_renew_command(root, enable).await,
        Commands::InsertRule {
            category,
            name,
            file,
            root,
        } => insert_rule_command(root, &category, &name, &file).await,
    }
}

async fn run_command(root: Option<PathBuf>) -> Result<()> {
    let layout = resolve_layout(root)?;
    layout.ensure().context("create engine directories")?;
    let config = EngineConfig::load(&layout.config_file());

    let engine = Engine::bootstrap(layout, config)?;
    engine.logs.general.info("[ENGINE] Service starting");

    let client = reqwest::Client::builder()
        .user_agent("vwar-engine/0.1")
        .timeout(Duration::from_secs(10))
        .build()?;

    // Offline-first: local rules make the store ready immediately, remote
    // sync catches up in the background.
    engine.signatures.clone().startup(client.clone()).await;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Installation detector sampling loop.
    let detector_handle = engine.detector.clone().spawn_sampler(shutdown_rx.clone());

    // Sequential consumer; crash recovery first so vaulted artefacts from a
    // previous run resume processing.
    let capture = CaptureEngine::new(engine.clone());
    let processor = VaultProcessor::new(engine.clone(), capture);
    processor.auto_recover();
    let processor_handle = processor.clone().spawn(shutdown_rx.clone());

    // Change-event source feeding the ingress thread.
    let (event_tx, event_rx) = std::sync::mpsc::channel();
    let mut monitor = match engine.config.monitor_command.as_deref() {
        Some(command) => spawn_native_monitor(command, event_tx)
            .context("start native change-event emitter")?,
        None => {
            let paths = monitored_paths(&engine);
            spawn_fallback_watcher(&paths, event_tx).context("start built-in watcher")?
        }
    };
    let ingress_handle = spawn_ingress(engine.clone(), event_rx, shutdown_rx.clone());

    // License validator with adaptive polling.
    let activation_present = vwar_core::activation::ActivationStore::new(&engine.layout).exists();
    if !activation_present {
        warn!("no activation record found; license will report invalid until activation");
    }
    let validator = LicenseValidator::new(engine.clone(), client.clone());
    let license_task = tokio::spawn(validator.run(shutdown_rx.clone()));

    // Keep a UI receiver alive and mirror events into diagnostics.
    let mut ui_rx = engine.subscribe();
    let ui_task = tokio::spawn(async move {
        while let Ok(event) = ui_rx.recv().await {
            tracing::debug!(?event, "ui event");
        }
    });

    info!("service started - all subsystems online");
    signal::ctrl_c().await?;
    info!("service stopping");

    let _ = shutdown_tx.send(true);
    monitor.shutdown();
    license_task.abort();
    ui_task.abort();

    for handle in [processor_handle, ingress_handle, detector_handle] {
        let _ = handle.join();
    }

    let snapshot = engine.telemetry.render();
    if !snapshot.is_empty() {
        engine
            .logs
            .general
            .info(&format!("[ENGINE] Telemetry on shutdown:\n{snapshot}"));
    }
    engine.logs.general.info("[ENGINE] Service stopped");
    Ok(())
}

/// Configured directories, or the per-user defaults.
fn monitored_paths(engine: &Engine) -> Vec<PathBuf> {
    let configured: Vec<PathBuf> = engine
        .config
        .monitored_paths
        .iter()
        .map(PathBuf::from)
        .collect();
    if !configured.is_empty() {
        return configured;
    }
    let mut defaults = Vec::new();
    if let Some(dirs) = directories::UserDirs::new() {
        for dir in [
            dirs.download_dir(),
            dirs.desktop_dir(),
            dirs.document_dir(),
        ]
        .into_iter()
        .flatten()
        {
            defaults.push(dir.to_path_buf());
        }
    }
    defaults
}

fn status_command(root: Option<PathBuf>) -> Result<()> {
    let layout = resolve_layout(root)?;
    let config = EngineConfig::load(&layout.config_file());

    let queue = vwar_core::queue::ScanQueue::new(layout.queue_file(), config.max_queue_size);
    println!("root:            {}", layout.root().display());
    println!("queue pending:   {}", queue.pending_count());

    let quarantined = std::fs::read_dir(layout.quarantine_dir())
        .map(|rd| {
            rd.flatten()
                .filter(|e| {
                    e.file_name()
                        .to_string_lossy()
                        .ends_with(".quarantined")
                })
                .count()
        })
        .unwrap_or(0);
    println!("quarantined:     {quarantined}");

    let vaulted = std::fs::read_dir(layout.vault_dir())
        .map(|rd| {
            rd.flatten()
                .filter(|e| e.file_name().to_string_lossy().ends_with(".vaulted"))
                .count()
        })
        .unwrap_or(0);
    println!("vaulted pending: {vaulted}");

    let rules = walkdir::WalkDir::new(layout.rules_dir())
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| {
            e.file_type().is_file()
                && e.path().extension().and_then(|x| x.to_str()) == Some("rule")
        })
        .count();
    println!("local rules:     {rules}");

    let store = vwar_core::activation::ActivationStore::new(&layout);
    match store.load_cache() {
        Ok(cache) => println!(
            "license:         valid={} days_remaining={} ({})",
            cache.is_valid, cache.days_remaining, cache.network_status
        ),
        Err(_) => println!("license:         no cache"),
    }
    Ok(())
}

async fn auto_renew_command(root: Option<PathBuf>, enable: bool) -> Result<()> {
    let layout = resolve_layout(root)?;
    let config = EngineConfig::load(&layout.config_file());
    let store = vwar_core::activation::ActivationStore::new(&layout);
    let record = store.load().context("load activation record")?;
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()?;
    let ok =
        vwar_service::license::set_auto_renew_for(&client, &config.endpoints, record.id, enable)
            .await?;
    if ok {
        println!(
            "auto-renew {} for license {}",
            if enable { "enabled" } else { "disabled" },
            record.id
        );
    } else {
        anyhow::bail!("server refused auto-renew update");
    }
    Ok(())
}

async fn insert_rule_command(
    root: Option<PathBuf>,
    category: &str,
    name: &str,
    file: &PathBuf,
) -> Result<()> {
    let layout = resolve_layout(root)?;
    let config = EngineConfig::load(&layout.config_file());
    let pattern = std::fs::read_to_string(file)
        .with_context(|| format!("read pattern file {}", file.display()))?;
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()?;
    let store = vwar_service::signatures::SignatureStore::new(
        layout.rules_dir(),
        config.endpoints.clone(),
        Duration::from_secs(config.rule_match_timeout_secs),
    );
    if store
        .insert_rule(&client, category, name, pattern.trim())
        .await?
    {
        println!("rule '{name}' uploaded to category '{category}'");
        Ok(())
    } else {
        anyhow::bail!("rule upload rejected by server")
    }
}
