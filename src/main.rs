//! echo-herd: a multi-worker TCP echo server.
//!
//! Demonstrates two classic UNIX dispatch strategies over the same echo
//! behavior:
//! - fork mode: pre-spawned workers contending on a shared listener via
//!   blocking accept, one detached handler per connection;
//! - epoll mode: replicated event loops multiplexing the listener and all
//!   accepted connections with edge-triggered readiness.

mod config;
mod echo;
mod listener;
mod mux;
mod pool;

use config::{Config, Mode};
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        host = %config.host,
        port = config.port,
        mode = ?config.mode,
        workers = config.workers,
        strategy = ?config.strategy,
        "Starting echo-herd"
    );

    match config.mode {
        Mode::Fork => pool::run(config)?,
        Mode::Epoll => mux::run(config)?,
    }

    Ok(())
}
