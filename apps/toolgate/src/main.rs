use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use toolgate_core::Gateway;
use toolgate_transform::replacement::load_pipeline;
use toolgate_upstream::UpstreamClient;
use tracing::{info, warn};

mod cli;

use crate::cli::Cli;

#[tokio::main]
async fn main() {
    let env_file = dotenvy::dotenv();
    let cli = Cli::parse();
    init_tracing(cli.log_json);
    if let Ok(path) = env_file {
        info!(path = %path.display(), "env file loaded");
    }
    if let Err(err) = run(cli).await {
        eprintln!("toolgate failed: {err:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let dir = std::env::current_dir().context("failed to resolve working directory")?;
    let replacements = load_pipeline(cli.settings.as_deref(), &dir)?;
    let config = cli.gateway_config();
    info!(
        target_base_url = %config.target_base_url,
        strict = !config.disable_strict_schemas,
        force_tool_calling = config.force_tool_calling,
        replacement_rules = replacements.rules().len(),
        "config loaded"
    );

    let upstream = UpstreamClient::new().context("failed to build upstream client")?;
    let shutdown = CancellationToken::new();
    let gateway = Gateway::new(config, replacements, upstream, shutdown.clone());
    let app = gateway.router();

    let bind = format!("{}:{}", cli.host, cli.port);
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;
    info!(addr = %bind, "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown))
        .await?;
    info!("stopped");
    Ok(())
}

/// Open streams run under child tokens of `shutdown`, so they end promptly and the
/// server can drain.
async fn shutdown_signal(shutdown: CancellationToken) {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "ctrl-c handler unavailable");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
    shutdown.cancel();
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("toolgate=info,tower_http=info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}
