//! Application entrypoint and state wiring.

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::{fmt, EnvFilter};

use device_ledger::config::{Config, LogFormat};
use device_ledger::crypto::ServerKey;
use device_ledger::{router, storage, AppState};

fn setup_logging(log_level: &str, log_format: LogFormat) -> Result<()> {
    let level = log_level.parse::<Level>().unwrap_or(Level::INFO);
    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive("hyper=warn".parse()?);

    match log_format {
        LogFormat::Json => {
            let subscriber = fmt::Subscriber::builder()
                .with_env_filter(filter)
                .json()
                .flatten_event(true)
                .with_current_span(false)
                .finish();
            tracing::subscriber::set_global_default(subscriber)
                .context("Failed to set subscriber")?;
        }
        LogFormat::Plain => {
            let subscriber = fmt::Subscriber::builder()
                .with_env_filter(filter)
                .with_target(true)
                .finish();
            tracing::subscriber::set_global_default(subscriber)
                .context("Failed to set subscriber")?;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::parse();
    setup_logging(&config.log_level, config.log_format)?;

    // 0) dirs
    storage::ensure_dir(&config.data_dir)
        .with_context(|| format!("create data dir {}", config.data_dir.display()))?;

    // 1) key persistence
    let key_path = config.data_dir.join("key.bin");
    let key = ServerKey::load_or_create(&key_path)
        .with_context(|| format!("load server key {}", key_path.display()))?;
    info!(pubkey = %key.public_hex(), "server key ready");

    // 2) load existing ledgers
    let settings = config.settings();
    let state = AppState::open(&config.data_dir, key, settings).context("open ledger store")?;
    info!(
        difficulty = settings.difficulty,
        max_segment_blocks = settings.max_segment_blocks,
        devices = state.store.devices().len(),
        "ledger ready"
    );

    // 3) serve
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("bind {}", config.listen_addr))?;
    info!(addr = %config.listen_addr, "listening");
    axum::serve(listener, app).await.context("server error")?;
    Ok(())
}
