mod shell;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use querycache::{BackendKind, Config, Engine, EndpointOptions, EndpointState, Freshness};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "querycache")]
#[command(about = "Fetch, cache and inspect endpoint data")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/querycache/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Write logs to this file instead of stderr
  #[arg(long)]
  log_file: Option<PathBuf>,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
  /// Fetch an endpoint by running a command that prints JSON
  Fetch {
    /// Endpoint key
    key: String,
    /// Fetch even if the cached data is still fresh
    #[arg(short, long)]
    force: bool,
    /// Backend to persist to: memory, local or bulk
    #[arg(short, long, default_value = "bulk")]
    backend: BackendKind,
    /// Freshness window in milliseconds, or "never"
    #[arg(long)]
    freshness: Option<Freshness>,
    /// Command to run, after `--`
    #[arg(last = true, required = true)]
    command: Vec<String>,
  },
  /// Print the cached state of an endpoint without fetching
  Show {
    key: String,
    #[arg(short, long, default_value = "bulk")]
    backend: BackendKind,
  },
  /// Remove an endpoint's cached record
  Invalidate {
    key: String,
    #[arg(short, long, default_value = "bulk")]
    backend: BackendKind,
  },
  /// Remove every cached record
  Clear,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _guard = init_logging(args.log_file.as_deref())?;

  // Load configuration
  let config = Config::load(args.config.as_deref())?;
  let engine = Engine::from_config(&config)?;

  match args.command {
    Commands::Fetch {
      key,
      force,
      backend,
      freshness,
      command,
    } => {
      let command = Arc::new(command);
      let options = EndpointOptions {
        freshness,
        backend,
      };
      engine
        .define_endpoint(
          &key,
          move || {
            let command = Arc::clone(&command);
            async move { shell::run_json(&command).await }
          },
          options,
        )
        .await;

      engine.refetch(&key, force).await;
      let state = engine.get_state(&key);
      print_state(&key, &state)?;

      if state.is_error() {
        return Err(eyre!("Fetching {} failed", key));
      }
    }
    Commands::Show { key, backend } => {
      define_offline(&engine, &key, backend).await;
      print_state(&key, &engine.get_state(&key))?;
    }
    Commands::Invalidate { key, backend } => {
      define_offline(&engine, &key, backend).await;
      engine.invalidate(&key).await;
    }
    Commands::Clear => {
      engine.clear_cache().await;
    }
  }

  Ok(())
}

/// Define an endpoint only to reach its cached record; it can never fetch.
async fn define_offline(engine: &Engine, key: &str, backend: BackendKind) {
  let owned_key = key.to_string();
  engine
    .define_endpoint(
      key,
      move || {
        let key = owned_key.clone();
        async move { Err::<serde_json::Value, _>(eyre!("No fetch command for {}", key)) }
      },
      EndpointOptions::default().with_backend(backend),
    )
    .await;
}

fn print_state(key: &str, state: &EndpointState) -> Result<()> {
  let output = json!({
    "key": key,
    "data": state.data(),
    "isLoading": state.is_loading(),
    "isError": state.is_error(),
    "error": state.error().map(|e| e.to_string()),
    "lastUpdated": state.last_updated().map(|t| t.timestamp_millis()),
  });

  let text =
    serde_json::to_string_pretty(&output).map_err(|e| eyre!("Failed to format state: {}", e))?;
  println!("{}", text);
  Ok(())
}

/// Log to stderr, or to `log_file` through a non-blocking writer.
///
/// The filter comes from QUERYCACHE_LOG, then RUST_LOG, defaulting to `warn`.
fn init_logging(log_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
  let filter = EnvFilter::try_from_env("QUERYCACHE_LOG")
    .or_else(|_| EnvFilter::try_from_default_env())
    .unwrap_or_else(|_| EnvFilter::new("warn"));

  match log_file {
    Some(path) => {
      let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
      let file_name = path
        .file_name()
        .ok_or_else(|| eyre!("Invalid log file path: {}", path.display()))?;

      let appender = tracing_appender::rolling::never(dir, file_name);
      let (writer, guard) = tracing_appender::non_blocking(appender);
      tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .init();
      Ok(Some(guard))
    }
    None => {
      tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
      Ok(None)
    }
  }
}
