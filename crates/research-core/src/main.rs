use anyhow::Result;
use tracing::{info, warn};

use research_core::config::Settings;
use research_core::utils::init_logger;
use research_core::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    let _log_guard = init_logger()?;

    info!("🚀 Starting research core...");

    let settings = Settings::load()?;
    info!("✅ Configuration loaded");

    let state = AppState::connect(settings).await?;

    let sweeper = state.conversations.spawn_sweeper();
    info!(
        "✅ Turn sweeper running (timeout {}s)",
        state.settings.conversation.turn_timeout_seconds
    );

    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received");

    sweeper.abort();
    if let Some(pool) = &state.db_pool {
        pool.close().await;
    }

    info!("👋 Research core stopped");
    Ok(())
}
