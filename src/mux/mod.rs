//! Event-driven dispatch: epoll readiness multiplexing.
//!
//! Linux only; other platforms report the mode as unsupported.

#[cfg(target_os = "linux")]
mod event_loop;
#[cfg(target_os = "linux")]
mod poller;

use crate::config::Config;

/// Run the server in epoll mode.
#[cfg(target_os = "linux")]
pub fn run(config: Config) -> std::io::Result<()> {
    event_loop::run(config)
}

#[cfg(not(target_os = "linux"))]
pub fn run(_config: Config) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "epoll mode requires Linux",
    ))
}
