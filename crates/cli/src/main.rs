use std::io::Read;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use keel_apply::{create_anew_with, create_or_update, replace, ApplyContext, Recreate};
use keel_core::{duration_ms, BackoffPolicy, ObjectIdentity, Versioned};
use keel_kubehub::Manifest;
use kube::core::DynamicObject;
use metrics::counter;
use serde::Serialize;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Field manager recorded on every write keelctl makes.
const FIELD_MANAGER: &str = "keelctl";

#[derive(Parser, Debug)]
#[command(name = "keelctl", version, about = "Keel CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Total attempts per call (overrides KEEL_BACKOFF_STEPS)
    #[arg(long = "steps", global = true)]
    steps: Option<u32>,

    /// First backoff delay in milliseconds (overrides KEEL_BACKOFF_INITIAL_MS)
    #[arg(long = "initial-ms", global = true)]
    initial_ms: Option<u64>,

    /// Backoff growth factor (overrides KEEL_BACKOFF_FACTOR)
    #[arg(long = "factor", global = true)]
    factor: Option<f64>,

    /// Stretch each delay by a random amount
    #[arg(long = "jitter", global = true, action = ArgAction::SetTrue)]
    jitter: bool,

    /// Give up after this many seconds
    #[arg(long = "timeout-secs", global = true)]
    timeout_secs: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create or update the object described by a single-document YAML manifest
    Apply {
        /// Manifest path, or "-" for stdin
        #[arg(short = 'f', long = "file")]
        file: String,
        /// Namespace override (default: manifest, then current context)
        #[arg(long = "ns")]
        namespace: Option<String>,
        /// Delete and recreate instead of updating in place
        #[arg(long = "replace", action = ArgAction::SetTrue)]
        recreate: bool,
        /// Recreate only when the live object differs (implies --replace)
        #[arg(long = "if-changed", action = ArgAction::SetTrue)]
        if_changed: bool,
    },
    /// Print the effective backoff schedule
    Backoff,
}

impl Commands {
    fn name(&self) -> &'static str {
        match self {
            Commands::Apply { .. } => "apply",
            Commands::Backoff => "backoff",
        }
    }
}

fn init_tracing() {
    let env = std::env::var("KEEL_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KEEL_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid KEEL_METRICS_ADDR; expected host:port");
        }
    }
}

/// Env-derived policy with any command-line overrides applied on top.
fn backoff_policy(cli: &Cli) -> Result<BackoffPolicy> {
    let base = BackoffPolicy::from_env();
    if cli.steps.is_none() && cli.initial_ms.is_none() && cli.factor.is_none() && !cli.jitter {
        return Ok(base);
    }
    let policy = BackoffPolicy::new(
        cli.steps.unwrap_or(base.steps()),
        cli.initial_ms.map(Duration::from_millis).unwrap_or(base.initial_delay()),
        cli.factor.unwrap_or(base.factor()),
        cli.jitter || base.jitter(),
    )?;
    Ok(match base.cap() {
        Some(cap) => policy.with_cap(cap),
        None => policy,
    })
}

fn read_manifest(path: &str) -> Result<String> {
    if path == "-" {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf).context("reading manifest from stdin")?;
        return Ok(buf);
    }
    std::fs::read_to_string(path).with_context(|| format!("reading manifest {}", path))
}

#[derive(Debug, Serialize)]
struct ApplyReport {
    kind: String,
    namespace: String,
    name: String,
    result: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    uid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    version: Option<String>,
}

impl ApplyReport {
    fn new(kind: &str, id: &ObjectIdentity, result: &'static str) -> Self {
        Self { kind: kind.to_string(), namespace: id.namespace.clone(), name: id.name.clone(), result, uid: None, version: None }
    }
}

async fn run_apply(ctx: &ApplyContext, yaml: &str, ns: Option<&str>, mode: Option<Recreate>) -> Result<ApplyReport> {
    let mut manifest = Manifest::from_yaml(yaml, ns)?;
    let client = keel_kubehub::kube_client().await?;
    let api = keel_kubehub::dynamic_client(client, &mut manifest).await?.with_field_manager(FIELD_MANAGER);
    let Manifest { gvk, identity, object } = manifest;
    info!(kind = %gvk.kind, id = %identity, mode = ?mode, "apply invoked");

    let report = match mode {
        None => {
            let desired: DynamicObject = object.clone();
            let result = create_or_update(&api, ctx, object, replace(desired)).await?;
            ApplyReport::new(&gvk.kind, &identity, result.as_str())
        }
        Some(mode) => {
            let live = create_anew_with(&api, ctx, object, mode).await?;
            let mut report = ApplyReport::new(&gvk.kind, &identity, "replaced");
            report.uid = live.uid().map(str::to_string);
            report.version = live.version().map(str::to_string);
            report
        }
    };
    Ok(report)
}

#[derive(Debug, Serialize)]
struct ScheduleView {
    steps: u32,
    initial_ms: u64,
    factor: f64,
    jitter: bool,
    cap_ms: Option<u64>,
    delays_ms: Vec<u64>,
    total_ms: u64,
}

impl From<&BackoffPolicy> for ScheduleView {
    fn from(p: &BackoffPolicy) -> Self {
        let delays_ms: Vec<u64> = p.delays().into_iter().map(duration_ms).collect();
        Self {
            steps: p.steps(),
            initial_ms: duration_ms(p.initial_delay()),
            factor: p.factor(),
            jitter: p.jitter(),
            cap_ms: p.cap().map(duration_ms),
            total_ms: delays_ms.iter().fold(0u64, |acc, d| acc.saturating_add(*d)),
            delays_ms,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    counter!("keel_cli_invocations", 1u64, "command" => cli.command.name());

    let policy = backoff_policy(&cli)?;
    match &cli.command {
        Commands::Apply { file, namespace, recreate, if_changed } => {
            let cancel = CancellationToken::new();
            tokio::spawn({
                let cancel = cancel.clone();
                async move {
                    if signal::ctrl_c().await.is_ok() {
                        warn!("interrupt received; cancelling");
                        cancel.cancel();
                    }
                }
            });
            let mut ctx = ApplyContext::new(policy).with_cancel(cancel);
            if let Some(secs) = cli.timeout_secs {
                ctx = ctx.with_timeout(Duration::from_secs(secs));
            }
            let mode = match (*recreate, *if_changed) {
                (_, true) => Some(Recreate::IfChanged),
                (true, false) => Some(Recreate::Always),
                (false, false) => None,
            };

            let yaml = read_manifest(file)?;
            let report = match run_apply(&ctx, &yaml, namespace.as_deref(), mode).await {
                Ok(r) => r,
                Err(e) => {
                    error!(error = %e, "apply failed");
                    return Err(e);
                }
            };
            match cli.output {
                Output::Human => {
                    let id = if report.namespace.is_empty() { report.name.clone() } else { format!("{}/{}", report.namespace, report.name) };
                    println!("{} {} {}", report.kind.to_lowercase(), id, report.result);
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&report)?),
            }
        }
        Commands::Backoff => {
            let view = ScheduleView::from(&policy);
            match cli.output {
                Output::Human => {
                    let cap = view.cap_ms.map(|c| format!("{}ms", c)).unwrap_or_else(|| "none".to_string());
                    println!(
                        "steps={} initial={}ms factor={} jitter={} cap={}",
                        view.steps, view.initial_ms, view.factor, view.jitter, cap
                    );
                    for (i, d) in view.delays_ms.iter().enumerate() {
                        println!("  before attempt {:<3} {}ms", i + 2, d);
                    }
                    println!("worst-case sleep total: {}ms", view.total_ms);
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&view)?),
            }
        }
    }
    Ok(())
}
