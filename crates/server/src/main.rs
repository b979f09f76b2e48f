//! Image gateway binary entry point

use clap::Parser;
use imgate_server::{
    config::default_config_path, load_config, logging::init_tracing, start_server, ApiState,
    Gateway,
};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "imgate", version, about = "HTTP image gateway with a lazily populated derived cache")]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, env = "IMGATE_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let path = args.config.unwrap_or_else(default_config_path);

    let mut config = load_config(&path)?;
    config.apply_env_overrides()?;
    config.validate()?;

    init_tracing(config.log_format, &config.log_level)?;
    tracing::info!(config = %path.display(), "Starting imgate");

    let bind = config.bind.clone();
    let gateway = Gateway::from_config(config).await?;
    start_server(&bind, ApiState::new(gateway)).await?;

    Ok(())
}
