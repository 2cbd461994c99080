use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use pennant_api::{EngineConfig, FlagsApi, InProcApi};
use pennant_catalog::{AllowAll, FileCatalog, PermissionSet};
use pennant_core::{AggregateState, AuthorizationContext, Phase, Severity};
use pennant_exec::{JsonFileProvider, UnitRegistry};
use tokio::signal;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "pennantctl", version, about = "Pennant CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Catalog file (YAML, or JSON by extension)
    #[arg(long = "catalog", global = true, env = "PENNANT_CATALOG", default_value = "pennant.yaml")]
    catalog: PathBuf,

    /// Records file: JSON object keyed by record id, served by every provider unit
    #[arg(long = "records", global = true, env = "PENNANT_RECORDS")]
    records: Option<PathBuf>,

    /// Permission held by the caller (repeatable)
    #[arg(long = "permission", global = true, action = ArgAction::Append)]
    permissions: Vec<String>,

    /// Hold every permission
    #[arg(long = "all-permissions", global = true, action = ArgAction::SetTrue)]
    all_permissions: bool,

    /// Per-unit time limit in milliseconds (overrides PENNANT_UNIT_TIMEOUT_MS)
    #[arg(long = "timeout-ms", global = true)]
    timeout_ms: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// List the units that would run for an object type
    Units {
        /// Object type, e.g. "Account"
        object_type: String,
    },
    /// Compute flags for a record once and print the settled state
    Flags {
        record_id: String,
        #[arg(long = "object-type")]
        object_type: String,
    },
    /// Print every state change for a record, refreshing periodically
    Watch {
        record_id: String,
        #[arg(long = "object-type")]
        object_type: String,
        /// Trigger a refresh this often after each settlement
        #[arg(long = "refresh-every-ms")]
        refresh_every_ms: Option<u64>,
        /// Stop after this many settled runs
        #[arg(long = "runs")]
        runs: Option<u64>,
    },
}

fn init_tracing() {
    let env = std::env::var("PENNANT_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("PENNANT_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid PENNANT_METRICS_ADDR; expected host:port");
        }
    }
}

fn severity_tag(s: Severity) -> &'static str {
    match s {
        Severity::Normal => "normal",
        Severity::Success => "success",
        Severity::Warning => "warning",
        Severity::Error => "error",
    }
}

fn print_state(state: &AggregateState, output: Output) -> Result<()> {
    match output {
        Output::Json => println!("{}", serde_json::to_string(state)?),
        Output::Human => {
            let loading = if state.is_loading { format!(" • loading ({} pending)", state.pending) } else { String::new() };
            println!("run {} • {:?} • {} flag(s){}", state.run_id, state.phase, state.flags.len(), loading);
            for f in &state.flags {
                println!("  [{}] {}", severity_tag(f.severity), f.header);
                if let Some(body) = &f.body {
                    for line in body.lines() { println!("      {}", line); }
                }
                for a in &f.actions { println!("      -> {} ({})", a.label, a.target); }
            }
            if let Some(n) = &state.notice { println!("  notice ({:?}): {}", n.kind, n.text); }
        }
    }
    Ok(())
}

fn build_api(cli: &Cli) -> Result<InProcApi> {
    let catalog = FileCatalog::load(&cli.catalog)?;
    let mut registry = UnitRegistry::new();
    registry.register_rules(catalog.rules());
    if let Some(path) = &cli.records {
        let provider = Arc::new(JsonFileProvider::load(path)?);
        for id in catalog.provider_ids() { registry.register_provider(id.clone(), provider.clone()); }
    } else if !catalog.provider_ids().is_empty() {
        warn!(providers = ?catalog.provider_ids(), "catalog declares providers but no --records file was given");
    }
    let auth: Arc<dyn AuthorizationContext> = if cli.all_permissions {
        Arc::new(AllowAll)
    } else {
        Arc::new(PermissionSet::new(cli.permissions.iter().cloned()))
    };
    let mut cfg = EngineConfig::from_env();
    if cli.timeout_ms.is_some() { cfg = cfg.with_unit_timeout_ms(cli.timeout_ms.filter(|ms| *ms > 0)); }
    Ok(InProcApi::new(Arc::new(catalog), auth, registry, cfg))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let api = build_api(&cli).with_context(|| format!("loading catalog {}", cli.catalog.display()))?;

    match &cli.command {
        Commands::Units { object_type } => {
            info!(object_type = %object_type, "units invoked");
            let resolved = api.units(object_type).await?;
            match cli.output {
                Output::Human => {
                    match &resolved.provider {
                        Some(p) => println!("provider: {}", p.unit_id),
                        None => println!("provider: (none, fallback payload)"),
                    }
                    for u in &resolved.units {
                        let perm = u.required_permission.as_deref().unwrap_or("-");
                        println!("{:>4}  {}  perm={}", u.order, u.unit_id, perm);
                    }
                }
                Output::Json => {
                    let out = serde_json::json!({ "provider": resolved.provider, "units": resolved.units });
                    println!("{}", serde_json::to_string_pretty(&out)?);
                }
            }
        }
        Commands::Flags { record_id, object_type } => {
            let t0 = Instant::now();
            info!(record_id = %record_id, object_type = %object_type, "flags invoked");
            let state = api.start(record_id, object_type).await?.wait().await?;
            print_state(&state, cli.output)?;
            info!(took_ms = %t0.elapsed().as_millis(), flags = state.flags.len(), "flags done");
        }
        Commands::Watch { record_id, object_type, refresh_every_ms, runs } => {
            info!(record_id = %record_id, object_type = %object_type, refresh_every_ms = ?refresh_every_ms, runs = ?runs, "watch invoked");
            let mut failures = api.failures();
            let mut handle = api.state();
            api.start(record_id, object_type).await?;
            let mut settled_runs: u64 = 0;
            let mut refresh_at: Option<tokio::time::Instant> = None;
            loop {
                let refresh_due = async move {
                    match refresh_at {
                        Some(at) => tokio::time::sleep_until(at).await,
                        None => std::future::pending::<()>().await,
                    }
                };
                tokio::select! {
                    changed = handle.changed() => {
                        let Some(state) = changed else {
                            warn!("state channel closed; exiting watch loop");
                            break;
                        };
                        print_state(&state, cli.output)?;
                        if state.phase == Phase::Settled {
                            settled_runs += 1;
                            if runs.map(|k| settled_runs >= k).unwrap_or(false) { break; }
                            refresh_at = refresh_every_ms.map(|ms| tokio::time::Instant::now() + Duration::from_millis(ms));
                        }
                    }
                    Some(n) = failures.rx.recv() => {
                        if cli.output == Output::Human { eprintln!("! run {} unit {} failed: {}", n.run_id, n.unit_id, n.reason); }
                    }
                    _ = refresh_due => {
                        refresh_at = None;
                        api.on_refresh().await?;
                    }
                    _ = signal::ctrl_c() => {
                        info!("Ctrl-C received; shutting down watch loop");
                        break;
                    }
                }
            }
            failures.cancel.cancel();
            info!(settled_runs, "watch loop ended");
        }
    }
    Ok(())
}
