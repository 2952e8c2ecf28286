use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use edgelb::cli::{connect, execute, Cli};
use edgelb::config::{default_config_path, load_config_from};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();

    // Load .env file if specified
    if let Some(ref env_file) = cli.env_file {
        dotenvy::from_path(env_file)
            .with_context(|| format!("failed to load env file {}", env_file.display()))?;
    }

    let path = cli.config.clone().unwrap_or_else(default_config_path);
    let config = load_config_from(&path)
        .with_context(|| format!("failed to load config {}", path.display()))?;
    if cli.dry_run {
        config.validate()?;
    } else {
        config.validate_remote()?;
    }

    // Ctrl-C and the overall timeout both cancel in-flight remote calls
    let cancel = CancellationToken::new();
    let watchdog = cancel.clone();
    let timeout = Duration::from_secs(cli.timeout);
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => warn!("Interrupted, cancelling"),
            _ = tokio::time::sleep(timeout) => warn!("Timed out after {:?}, cancelling", timeout),
        }
        watchdog.cancel();
    });

    let backend = connect(&config, cli.dry_run, &cancel)
        .await
        .context("failed to connect to the edge gateway")?;
    let output = execute(&backend, &config, &cli.command, &cancel).await?;
    print!("{}", output);

    Ok(())
}
