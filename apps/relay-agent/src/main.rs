//! filerelay agent entry point.

mod app;
mod config;

use std::path::PathBuf;

use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "starting filerelay agent"
    );

    let path = match std::env::args().nth(1) {
        Some(arg) => PathBuf::from(arg),
        None => config::default_path(),
    };
    let config = config::Config::load(&path)?;
    tracing::info!(
        path = %path.display(),
        output_dir = %config.storage.output_dir,
        "configuration loaded"
    );

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(app::run(config))?;

    tracing::info!("agent shut down cleanly");
    Ok(())
}
