//! vcrplay CLI: load a TOML config, drive a Player through Start/Load/
//! Record-or-Play, and hold it open until Ctrl-C closes it.

use std::path::PathBuf;

use anyhow::Context;
use tracing_subscriber::EnvFilter;

use vcrplay::cassette::Cassette;
use vcrplay::config::{Config, Mode};
use vcrplay::player::Player;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = std::env::args().collect();
    let Some(config_path) = args.get(1) else {
        anyhow::bail!("Usage: vcrplay <config.toml>");
    };

    run(PathBuf::from(config_path)).await
}

async fn run(config_path: PathBuf) -> anyhow::Result<()> {
    let config = Config::from_file(&config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;

    let player = Player::new(&config.base_address, &config.remote_address)?
        .with_limits(config.limits.clone());
    player.start().await.context("starting listener")?;

    let cassette = Cassette::open(&config.cassette_path).context("opening cassette")?;
    player.load(cassette).await;

    match config.mode {
        Mode::Record => player.record(&config.record_name).await?,
        Mode::Play => player.play(&config.record_name).await?,
    }

    tracing::info!(
        base = %player.base_address(),
        mode = ?config.mode,
        record = %config.record_name,
        "vcrplay running; press Ctrl-C to stop"
    );

    tokio::signal::ctrl_c()
        .await
        .context("installing Ctrl-C handler")?;

    player.close().await?;
    Ok(())
}
