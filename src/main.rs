use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use leavedesk::cache::{SqliteTier, TierKind};
use leavedesk::config::Config;
use leavedesk::{HttpBackend, Params, RequestCoordinator, Scalar};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "leavedesk")]
#[command(about = "Cached, coalescing client for the leave-management admin API")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/leavedesk/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Fetch an endpoint through the cache and print the JSON response
  Request {
    endpoint: String,
    /// Parameters as key=value
    params: Vec<String>,
  },
  /// Warm the cache for an endpoint
  Prefetch { endpoint: String, params: Vec<String> },
  /// Drop cached responses for an endpoint (all of them without params)
  Invalidate { endpoint: String, params: Vec<String> },
  /// POST a JSON body to an endpoint and invalidate affected caches
  Mutate { endpoint: String, body: String },
  /// Print cache and pipeline statistics
  Stats,
}

fn parse_params(raw: &[String]) -> Result<Params> {
  raw
    .iter()
    .map(|pair| {
      let (key, value) = pair
        .split_once('=')
        .ok_or_else(|| eyre!("Expected key=value, got {:?}", pair))?;
      Ok((key.to_string(), Scalar::parse_loose(value)))
    })
    .collect()
}

/// Log to a daily file in the data directory so stdout stays clean JSON.
fn init_logging() -> Result<WorkerGuard> {
  let log_dir = dirs::data_dir()
    .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
    .ok_or_else(|| eyre!("Could not determine data directory"))?
    .join("leavedesk");
  std::fs::create_dir_all(&log_dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", log_dir.display(), e))?;

  let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::daily(
    &log_dir,
    "leavedesk.log",
  ));
  let filter = EnvFilter::try_from_env("LEAVEDESK_LOG").unwrap_or_else(|_| EnvFilter::new("info"));

  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(writer)
    .with_ansi(false)
    .init();

  Ok(guard)
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
  println!("{}", serde_json::to_string_pretty(value)?);
  Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;
  let _log_guard = init_logging()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;

  let backend = HttpBackend::new(&config.api, Config::get_api_token())?;
  let mut builder = RequestCoordinator::builder(Arc::new(backend))
    .policies(config.policy_table())
    .namespaces(config.namespaces.clone())
    .batch_window(config.tuning.batch_window())
    .prefetch_grace(config.tuning.prefetch_grace());

  if let Some(path) = SqliteTier::default_path() {
    let tier = SqliteTier::open(&path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;
    builder = builder.tier(TierKind::Persistent, Arc::new(tier));
  }

  let coordinator = builder
    .build()
    .map_err(|e| eyre!("Failed to initialise cache: {}", e))?;

  match args.command {
    Command::Request { endpoint, params } => {
      let value: Value = coordinator.request(&endpoint, parse_params(&params)?).await?;
      print_json(&value)?;
    }
    Command::Prefetch { endpoint, params } => {
      coordinator
        .prefetch(&endpoint, parse_params(&params)?)
        .wait()
        .await;
      print_json(&coordinator.performance_stats())?;
    }
    Command::Invalidate { endpoint, params } => {
      let params = parse_params(&params)?;
      let scope = if params.is_empty() { None } else { Some(&params) };
      coordinator.invalidate(&endpoint, scope)?;
    }
    Command::Mutate { endpoint, body } => {
      let body: Value =
        serde_json::from_str(&body).map_err(|e| eyre!("Body is not valid JSON: {}", e))?;
      let response = coordinator.mutate(&endpoint, &body).await?;
      print_json(&response)?;
    }
    Command::Stats => print_json(&coordinator.performance_stats())?,
  }

  Ok(())
}
