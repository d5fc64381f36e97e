use std::{path::PathBuf, sync::Arc};

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tether_config::{TetherConfig, CONFIG_ENV_VAR};
use tether_rpc::WebSocketOpener;
use tether_vm::{ConnectOptions, Isolate, ServiceEvent, VmService};
use tokio::sync::broadcast::error::RecvError;
use url::Url;

#[derive(Parser)]
#[command(name = "tether", version, about = "Inspect and drive a running VM service")]
struct Cli {
    /// HTTP address of the VM service, e.g. http://127.0.0.1:8181/
    #[arg(long)]
    uri: Url,
    /// Path to a TOML config file (falls back to $TETHER_CONFIG)
    #[arg(long)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the VM and its isolates
    Vm,
    /// Print the rendering views, waiting briefly for one to appear
    Views,
    /// Reload an isolate's sources
    Reload {
        /// Isolate id (defaults to the oldest isolate)
        #[arg(long)]
        isolate: Option<String>,
        /// Pause the isolate after the reload
        #[arg(long)]
        pause: bool,
    },
    /// Print events from a stream as JSON lines until the connection closes
    Listen {
        /// Stream id, e.g. Isolate, Debug, Extension, Stdout
        stream: String,
    },
}

#[derive(Serialize)]
struct VmSummary {
    name: Option<String>,
    version: Option<String>,
    pid: Option<i64>,
    embedder: Option<String>,
    isolates: Vec<IsolateSummary>,
}

#[derive(Serialize)]
struct IsolateSummary {
    id: Option<String>,
    name: Option<String>,
    start_time: Option<i64>,
    paused: bool,
}

impl IsolateSummary {
    fn of(isolate: &Isolate) -> Self {
        Self {
            id: isolate.id(),
            name: isolate.name(),
            start_time: isolate.start_time(),
            paused: isolate.is_paused(),
        }
    }
}

#[derive(Serialize)]
struct ViewSummary {
    id: Option<String>,
    isolate: Option<String>,
}

#[derive(Serialize)]
struct EventLine<'a> {
    stream: &'a str,
    kind: &'a str,
    timestamp: Option<i64>,
    isolate: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    extension_kind: Option<&'a str>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config = load_config(cli.config.clone());
    tether_config::init_tracing(&config.logging);

    if let Err(err) = run(cli, config).await {
        eprintln!("tether: {err:#}");
        std::process::exit(1);
    }
}

fn load_config(cli_path: Option<PathBuf>) -> TetherConfig {
    let path = cli_path.or_else(|| std::env::var_os(CONFIG_ENV_VAR).map(PathBuf::from));
    let Some(path) = path else {
        return TetherConfig::default();
    };

    match TetherConfig::load_from_path(&path) {
        Ok(config) => config,
        Err(err) => {
            eprintln!(
                "tether: failed to load config from {}: {err}; continuing with defaults",
                path.display()
            );
            TetherConfig::default()
        }
    }
}

async fn run(cli: Cli, config: TetherConfig) -> Result<()> {
    let opener = Arc::new(WebSocketOpener::default());
    let service = VmService::connect(
        &cli.uri,
        opener,
        ConnectOptions {
            config: config.service,
            reload_sources: None,
        },
    )
    .await
    .with_context(|| format!("connecting to {}", cli.uri))?;
    tracing::info!(target: "tether.cli", uri = %service.ws_uri(), "connected");

    let outcome = match cli.command {
        Command::Vm => print_vm(&service).await,
        Command::Views => print_views(&service).await,
        Command::Reload { isolate, pause } => reload(&service, isolate.as_deref(), pause).await,
        Command::Listen { stream } => listen(&service, &stream).await,
    };
    service.close();
    outcome
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn print_vm(service: &VmService) -> Result<()> {
    let vm = service.get_vm().await?;
    print_json(&VmSummary {
        name: vm.name(),
        version: vm.version(),
        pid: vm.pid(),
        embedder: vm.embedder(),
        isolates: vm.isolates().iter().map(IsolateSummary::of).collect(),
    })
}

async fn print_views(service: &VmService) -> Result<()> {
    service.get_vm().await?;
    let views: Vec<ViewSummary> = service
        .wait_for_views()
        .await?
        .iter()
        .map(|view| ViewSummary {
            id: view.id(),
            isolate: view.ui_isolate_id(),
        })
        .collect();
    print_json(&views)
}

async fn reload(service: &VmService, isolate_id: Option<&str>, pause: bool) -> Result<()> {
    let vm = service.get_vm().await?;
    let isolate = match isolate_id {
        Some(id) => vm.isolate(id),
        None => vm.first_isolate(),
    }
    .ok_or_else(|| anyhow!("no matching isolate"))?;

    match isolate.reload_sources(pause, None, None).await {
        Ok(report) => print_json(&report),
        Err(err) if err.is_reload_barred() => Err(anyhow!(
            "isolate {} cannot be reloaded right now",
            isolate.id().unwrap_or_default()
        )),
        Err(err) => Err(err.into()),
    }
}

fn print_event(stream: &str, event: &ServiceEvent) -> Result<()> {
    let line = EventLine {
        stream,
        kind: event.kind().as_str(),
        timestamp: event.timestamp(),
        isolate: event.isolate_id(),
        extension_kind: event.extension_kind(),
    };
    println!("{}", serde_json::to_string(&line)?);
    Ok(())
}

async fn listen(service: &VmService, stream: &str) -> Result<()> {
    let mut events = service.on_event(stream).await?;
    loop {
        tokio::select! {
            _ = service.closed() => {
                tracing::info!(target: "tether.cli", "connection closed");
                return Ok(());
            }
            event = events.recv() => match event {
                Ok(event) => print_event(stream, &event)?,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(target: "tether.cli", skipped, "dropped events");
                }
                Err(RecvError::Closed) => return Ok(()),
            },
        }
    }
}
