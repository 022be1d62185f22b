//! Idlekeeper - idle screen timeout daemon
//!
//! Watches page-show and page-interaction events on the message bus and
//! decides whether and when the resting screen should reclaim the display,
//! honouring per-page override directives.

mod bus;
mod config;
mod logging;
mod policy;
mod timer;

use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use crate::bus::{events, MessageBus};
use crate::config::Config;
use crate::logging::CloseJournal;
use crate::policy::ScreenPolicy;

/// Application version.
const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let config_path = std::env::args().nth(1).map(PathBuf::from);

    // Load configuration
    let config = Config::load(config_path.as_deref())?;
    config.validate()?;

    // Initialize tracing
    init_tracing(&config.logging.level)?;

    info!("Starting idlekeeper v{}", VERSION);
    info!(
        "Configuration loaded: default timeout={}s, bus capacity={}",
        config.policy.default_timeout_seconds, config.bus.capacity
    );

    let bus = MessageBus::new(config.bus.capacity);
    let policy = Arc::new(ScreenPolicy::new(
        bus.clone(),
        config.policy.default_timeout(),
    ));
    Arc::clone(&policy).initialize()?;

    let mut journal = CloseJournal::new(config.logging.journal_dir())?;
    journal.log_session_start(VERSION)?;

    // Journal every close decision until shutdown is requested.
    let mut journal_rx = bus.subscribe();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down...");
                break;
            }
            received = journal_rx.recv() => match received {
                Ok(message) if message.event == events::SCREEN_CLOSE_IDLE => {
                    let id = message.str_field("skill_idle_event_id");
                    if let Err(e) = journal.log_close(id) {
                        warn!("Failed to journal close event: {}", e);
                    }
                }
                Ok(_) => {}
                Err(RecvError::Lagged(missed)) => {
                    warn!(missed, "Journal fell behind the bus");
                }
                Err(RecvError::Closed) => break,
            }
        }
    }

    policy.shutdown();
    journal.log_session_end()?;

    info!("Idlekeeper shutdown complete");
    Ok(())
}

/// Initialize tracing subscriber with the given log level.
fn init_tracing(level: &str) -> Result<()> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();

    Ok(())
}
