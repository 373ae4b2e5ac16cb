//! hopper CLI
//!
//! Runs a single bulk-ingestion batch from a file (or stdin) against an HTTP
//! metadata endpoint and prints the batch report as JSON on stdout.
//!
//! Exit code is 0 when the batch completed, 1 otherwise.

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Parser;
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, fmt};

use hopper::{
    BatchCoordinator, BatchState, HttpSink, HttpSinkConfig, InputFormat, PipelineConfig,
};

/// Bulk-ingest file-metadata records into a downstream metadata service
#[derive(Parser)]
#[command(name = "hopper")]
#[command(version)]
#[command(about = "Validate, deduplicate and deliver bulk file-metadata uploads")]
struct Cli {
    /// Bulk input file; `-` reads stdin
    #[arg(short, long)]
    file: PathBuf,

    /// URL each record is POSTed to
    #[arg(short, long, env = "HOPPER_ENDPOINT")]
    endpoint: String,

    /// Bearer token for the endpoint
    #[arg(long, env = "HOPPER_API_KEY", hide_env_values = true, default_value = "")]
    api_key: String,

    /// Pipeline config file (TOML, YAML or JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Input format or content type; inferred from the file extension if omitted
    #[arg(long)]
    format: Option<String>,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

/// Parse arguments after loading `.env`, so it can supply the env fallbacks.
fn parse_args<I, T>(dotenv_path: Option<&Path>, args: I) -> Result<Cli, clap::Error>
where
    I: IntoIterator<Item = T>,
    T: Into<std::ffi::OsString> + Clone,
{
    // A missing .env file is fine
    let _ = match dotenv_path {
        Some(path) => dotenvy::from_path(path),
        None => dotenvy::dotenv().map(|_| ()),
    };
    Cli::try_parse_from(args)
}

fn init_tracing(verbose: u8, json: bool) {
    let filter = match verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("hopper=info")),
        1 => EnvFilter::new("hopper=debug"),
        _ => EnvFilter::new("trace"),
    };

    let builder = fmt().with_env_filter(filter).with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.with_target(true).init();
    }
}

fn resolve_format(cli: &Cli) -> anyhow::Result<InputFormat> {
    match &cli.format {
        Some(format) => Ok(format.parse()?),
        None if cli.file.as_os_str() == "-" => {
            anyhow::bail!("--format is required when reading from stdin")
        }
        None => Ok(InputFormat::from_path(&cli.file)?),
    }
}

async fn open_input(path: &Path) -> anyhow::Result<Box<dyn AsyncRead + Unpin + Send>> {
    if path.as_os_str() == "-" {
        return Ok(Box::new(tokio::io::stdin()));
    }
    let file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("Failed to open {}", path.display()))?;
    Ok(Box::new(file))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = parse_args(None, std::env::args_os()).unwrap_or_else(|e| e.exit());
    init_tracing(cli.verbose, cli.json_logs);
    hopper::telemetry::describe_metrics();

    let config = PipelineConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    let format = resolve_format(&cli)?;
    let input = open_input(&cli.file).await?;

    let sink = HttpSink::new(HttpSinkConfig {
        api_key: cli.api_key.clone(),
        timeout_ms: config.attempt_timeout_ms,
        ..HttpSinkConfig::new(cli.endpoint.clone())
    })?;
    let coordinator = BatchCoordinator::new(std::sync::Arc::new(sink), config)?;

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Interrupt received, cancelling batch");
                cancel.cancel();
            }
        }
    });

    let report = coordinator.run_batch(input, format, cancel).await;
    println!("{}", serde_json::to_string_pretty(&report)?);

    if report.state != BatchState::Completed {
        std::process::exit(1);
    }
    Ok(())
}
