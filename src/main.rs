mod bucketing;
mod cache;
mod config;
mod equivalency;
mod error;
mod intensity;
mod metrics;
mod models;
mod power;
mod service;
mod storage;
mod sync;
mod synthetic;
mod workspace;

use cache::{CacheMode, UsageRequest};
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use config::{db_path, ensure_initialized, load_config, normalize_source_name, set_metrics_token};
use error::AppError;
use models::{RangeKey, SpecOverrides};
use serde::Serialize;
use service::CarbonService;
use std::process::ExitCode;
use std::time::Duration;
use storage::Storage;
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use workspace::Workspace;

#[derive(Debug, Parser)]
#[command(name = "carbon-meter")]
#[command(about = "Time-bucketed energy and carbon usage for analysis workspaces")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Args)]
struct SpecArgs {
    #[arg(long)]
    cpu_count: Option<u32>,
    #[arg(long)]
    cpu_tdp_w: Option<f64>,
    #[arg(long)]
    gpu_count: Option<u32>,
    #[arg(long)]
    gpu_tdp_w: Option<f64>,
    #[arg(long)]
    ram_w: Option<f64>,
    #[arg(long)]
    other_w: Option<f64>,
}

impl From<SpecArgs> for SpecOverrides {
    fn from(args: SpecArgs) -> Self {
        SpecOverrides {
            cpu_count: args.cpu_count,
            cpu_tdp_w: args.cpu_tdp_w,
            gpu_count: args.gpu_count,
            gpu_tdp_w: args.gpu_tdp_w,
            ram_w: args.ram_w,
            other_w: args.other_w,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    Init,
    #[command(about = "Store the metrics backend bearer token in the OS keyring")]
    SetToken { token: String },
    #[command(about = "Print the usage series for one source and range")]
    Show {
        #[arg(long)]
        source: String,
        #[arg(long, default_value = "day")]
        range: String,
        #[arg(long)]
        cache_only: bool,
        #[arg(long)]
        force: bool,
        #[command(flatten)]
        spec: SpecArgs,
    },
    #[command(about = "Warm the cache for every source and range combination")]
    Refresh {
        #[arg(long, value_delimiter = ',')]
        sources: Vec<String>,
        #[arg(long, value_delimiter = ',', default_values = ["day", "month", "year"])]
        ranges: Vec<String>,
        #[arg(long)]
        force: bool,
        #[command(flatten)]
        spec: SpecArgs,
    },
    #[command(about = "Poll active hosts and accumulate workspace energy and carbon")]
    Sync {
        #[arg(long)]
        once: bool,
        #[arg(long)]
        sleep: Option<u64>,
    },
    #[command(about = "Grid carbon intensity now, or for the half-hour slot containing --at")]
    Intensity {
        #[arg(long)]
        at: Option<DateTime<Utc>>,
    },
    Probe,
    Export {
        #[arg(long, default_value = "json")]
        format: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExportFormat {
    Json,
    Csv,
}

fn parse_export_format(input: &str) -> Result<ExportFormat, AppError> {
    match input.trim().to_ascii_lowercase().as_str() {
        "json" => Ok(ExportFormat::Json),
        "csv" => Ok(ExportFormat::Csv),
        _ => Err(AppError::Config(
            "Unsupported export format. Use json or csv".into(),
        )),
    }
}

fn parse_ranges(raw: &[String]) -> Result<Vec<RangeKey>, AppError> {
    let mut out = Vec::new();
    for item in raw {
        let range: RangeKey = item.parse()?;
        if !out.contains(&range) {
            out.push(range);
        }
    }
    Ok(out)
}

fn parse_sources(raw: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for item in raw {
        let source = normalize_source_name(item);
        if !source.is_empty() && !out.contains(&source) {
            out.push(source);
        }
    }
    out
}

fn csv_field(raw: &str) -> String {
    if raw.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", raw.replace('"', "\"\""))
    } else {
        raw.to_string()
    }
}

fn opt_csv(value: Option<f64>) -> String {
    value.map(|v| format!("{v:.3}")).unwrap_or_default()
}

#[derive(Serialize)]
struct WorkspaceExport<'a> {
    #[serde(flatten)]
    workspace: &'a Workspace,
    runtime_hours: f64,
    equivalencies: Vec<equivalency::Equivalency>,
}

fn export_json(workspaces: &[Workspace]) -> Result<String, AppError> {
    let rows: Vec<WorkspaceExport<'_>> = workspaces
        .iter()
        .map(|ws| WorkspaceExport {
            workspace: ws,
            runtime_hours: ws.runtime_hours(),
            equivalencies: equivalency::equivalencies(ws.total_kg * 1000.0),
        })
        .collect();
    Ok(serde_json::to_string_pretty(&rows)?)
}

fn export_csv(workspaces: &[Workspace]) -> String {
    let mut out = String::from(
        "source,hostname,title,started_at,runtime_hours,total_kwh,idle_kwh,total_kg,idle_kg,avg_ci_g_per_kwh,last_sampled_at\n",
    );
    for ws in workspaces {
        out.push_str(&format!(
            "{},{},{},{},{:.3},{:.6},{:.6},{:.6},{:.6},{},{}\n",
            csv_field(&ws.source),
            csv_field(&ws.hostname),
            csv_field(&ws.title),
            ws.started_at.map(|t| t.to_rfc3339()).unwrap_or_default(),
            ws.runtime_hours(),
            ws.total_kwh,
            ws.idle_kwh,
            ws.total_kg,
            ws.idle_kg,
            opt_csv(ws.avg_ci_g_per_kwh),
            ws.last_sampled_at.map(|t| t.to_rfc3339()).unwrap_or_default(),
        ));
    }
    out
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "carbon_meter=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

async fn run(cli: Cli) -> Result<(), AppError> {
    match cli.command {
        Commands::Init => {
            ensure_initialized()?;
            println!("Initialized carbon-meter config and data directories.");
        }
        Commands::SetToken { token } => {
            ensure_initialized()?;
            set_metrics_token(token.trim())?;
            println!("Metrics token stored in the OS keyring.");
        }
        Commands::Show {
            source,
            range,
            cache_only,
            force,
            spec,
        } => {
            let window = bucketing::build_window(&range, Utc::now())?;
            ensure_initialized()?;
            let svc = CarbonService::new(load_config()?)?;
            let spec = svc.resolve_spec(&spec.into())?;
            let manager = svc.cache_manager(Storage::open(&db_path()?)?);

            debug!(range = %window.range, start = %window.start, end = %window.end, "resolved window");
            let req = UsageRequest {
                source: normalize_source_name(&source),
                range: window.range,
                spec,
                mode: if cache_only {
                    CacheMode::CacheOnly
                } else {
                    CacheMode::ComputeOnMiss
                },
                force,
            };
            let entry = manager.get_or_compute(&req).await?;
            println!("{}", serde_json::to_string_pretty(&entry)?);
        }
        Commands::Refresh {
            sources,
            ranges,
            force,
            spec,
        } => {
            let ranges = parse_ranges(&ranges)?;
            ensure_initialized()?;
            let svc = CarbonService::new(load_config()?)?;
            let spec = svc.resolve_spec(&spec.into())?;
            let sources = if sources.is_empty() {
                svc.config().sources.keys().cloned().collect()
            } else {
                parse_sources(&sources)
            };
            let manager = svc.cache_manager(Storage::open(&db_path()?)?);

            let summary = svc
                .refresh(&manager, &sources, &ranges, spec, force, Utc::now())
                .await;
            println!(
                "Refreshed {} cache entries ({} failed).",
                summary.refreshed.len(),
                summary.failed.len()
            );
        }
        Commands::Sync { once, sleep } => {
            ensure_initialized()?;
            let svc = CarbonService::new(load_config()?)?;
            let sleep = Duration::from_secs(sleep.unwrap_or(svc.config().poll_seconds).max(1));
            let sources = svc.config().sources.clone();
            let mut sync = svc.workspace_sync(Storage::open(&db_path()?)?);

            loop {
                let updated = sync.sync_all(&sources, Utc::now()).await;
                info!(updated, "sync pass complete");
                if once {
                    println!("Updated {updated} workspaces.");
                    break;
                }
                tokio::time::sleep(sleep).await;
            }
        }
        Commands::Intensity { at } => {
            ensure_initialized()?;
            let svc = CarbonService::new(load_config()?)?;
            println!("{}", serde_json::to_string_pretty(&svc.intensity(at).await)?);
        }
        Commands::Probe => {
            ensure_initialized()?;
            let svc = CarbonService::new(load_config()?)?;
            let report = svc.probe().await?;
            match report.status_code {
                Some(code) => println!(
                    "Backend '{}' reachable: HTTP {} in {} ms.",
                    report.backend, code, report.duration_ms
                ),
                None => println!(
                    "Backend '{}' reachable in {} ms.",
                    report.backend, report.duration_ms
                ),
            }
        }
        Commands::Export { format } => {
            let format = parse_export_format(&format)?;
            ensure_initialized()?;
            let storage = Storage::open(&db_path()?)?;
            let workspaces = storage.list_workspaces()?;
            match format {
                ExportFormat::Json => println!("{}", export_json(&workspaces)?),
                ExportFormat::Csv => print!("{}", export_csv(&workspaces)),
            }
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}
