/// WhatsChat terminal client - main entry point
use std::env;
use tracing::info;
use tracing_subscriber::EnvFilter;
use whatschat_core::{cli_app, Config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Quiet by default so log lines do not interleave with the prompt
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("warn"))
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = env::args().collect();
    let config = Config::from_args(&args)
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;

    info!("Starting WhatsChat ({:?} backend, data in {:?})", config.backend, config.data_dir);

    cli_app::run(config).await
}
