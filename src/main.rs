use anyhow::{Context, Result};
use clap::Parser;
use std::io::Write;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

mod cli;

use cli::Args;
use ping_exporter::export::render_probe_response;
use ping_exporter::state::EchoIdentity;
use ping_exporter::trace::ProbeEngine;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Validate arguments
    if let Err(e) = args.validate() {
        eprintln!("Error: {}", e);
        std::process::exit(2);
    }

    init_logging(&args.log_level)?;

    let config = args.exporter_config();
    let request = config
        .build_request(&args.params())
        .context("Invalid probe request")?;
    let engine = ProbeEngine::new(Arc::new(EchoIdentity::from_process()), &config);

    // Cancellation token for graceful shutdown
    let cancel = CancellationToken::new();

    // Setup Ctrl+C handler
    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        cancel_clone.cancel();
    });

    let report = engine.probe(&request, &cancel).await;

    let mut stdout = std::io::stdout().lock();
    if args.json {
        serde_json::to_writer_pretty(&mut stdout, &report).context("Failed to write JSON")?;
        writeln!(stdout)?;
    } else {
        let response =
            render_probe_response(&request, &report).context("Failed to encode metrics")?;
        stdout.write_all(&response.body)?;
    }
    stdout.flush()?;

    std::process::exit(if report.success { 0 } else { 1 });
}

/// Install the stderr log subscriber; RUST_LOG wins over --log.level
fn init_logging(level: &str) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(level)
            .with_context(|| format!("Invalid log level: {}", level))?,
    };

    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
    Ok(())
}
