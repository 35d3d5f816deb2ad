//! Listening socket setup.
//!
//! The listener is created once at startup with socket2 so the reuse
//! options can be applied before bind, then handed to the workers as a
//! plain `std::net::TcpListener`. Any setup failure is fatal; there is no
//! retry path.

use crate::config::Config;
use std::io;
use std::net::{SocketAddr, TcpListener};
use tracing::info;

/// Accept queue depth for the listening socket.
pub const LISTEN_BACKLOG: i32 = 5;

/// Create the listening socket described by `config`.
///
/// Reuse options are applied before bind, in flag order: address reuse,
/// then port reuse. `nonblocking` is set for the epoll loops and for the
/// `-n` accept strategy; the blocking accept pool leaves it off.
pub fn bind_listener(config: &Config, nonblocking: bool) -> io::Result<TcpListener> {
    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    if config.reuseaddr {
        socket.set_reuse_address(true)?;
    }
    if config.reuseport {
        socket.set_reuse_port(true)?;
    }
    if nonblocking {
        socket.set_nonblocking(true)?;
    }

    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    let listener: TcpListener = socket.into();
    info!(addr = %listener.local_addr()?, backlog = LISTEN_BACKLOG, "Listener bound");

    Ok(listener)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AcceptStrategy, Mode};

    fn loopback_config(port: u16, reuseaddr: bool) -> Config {
        Config {
            host: "127.0.0.1".to_string(),
            port,
            reuseaddr,
            reuseport: false,
            workers: 1,
            mode: Mode::Fork,
            strategy: AcceptStrategy::Plain,
            log_level: "info".to_string(),
        }
    }

    #[test]
    fn test_bind_ephemeral_port() {
        let listener = bind_listener(&loopback_config(0, false), false).unwrap();
        assert_ne!(listener.local_addr().unwrap().port(), 0);
    }

    #[test]
    fn test_reuseaddr_allows_rebind() {
        let first = bind_listener(&loopback_config(0, true), false).unwrap();
        let port = first.local_addr().unwrap().port();
        drop(first);

        // With SO_REUSEADDR the port is immediately bindable again.
        let second = bind_listener(&loopback_config(port, true), false).unwrap();
        assert_eq!(second.local_addr().unwrap().port(), port);
    }

    #[test]
    fn test_invalid_address_is_fatal() {
        let mut config = loopback_config(0, false);
        config.host = "not-an-ip".to_string();
        assert!(bind_listener(&config, false).is_err());
    }
}
