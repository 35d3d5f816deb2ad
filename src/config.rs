//! Configuration module for the echo server.
//!
//! All configuration comes from command-line flags; there is no config file.
//! Numeric flags mirror the tolerant coercion of the classic demo servers:
//! a non-positive port falls back to 80 and a non-positive worker count
//! falls back to 2 instead of being rejected.

use clap::{Parser, ValueEnum};

/// Default port used when `-p` is absent or non-positive.
pub const DEFAULT_PORT: u16 = 80;

/// Default worker count used when `-w` is absent or non-positive.
pub const DEFAULT_WORKERS: usize = 2;

/// Command-line arguments for the echo server
#[derive(Parser, Debug)]
#[command(name = "echo-herd")]
#[command(version = "0.1.0")]
#[command(about = "A multi-worker TCP echo server", long_about = None)]
pub struct CliArgs {
    /// Local IP address to bind to
    #[arg(short = 'l', long = "local-ip", default_value = "0.0.0.0")]
    pub local_ip: String,

    /// Local port to bind to (values <= 0 fall back to 80)
    #[arg(short = 'p', long = "port", default_value_t = 80, allow_negative_numbers = true)]
    pub port: i32,

    /// Enable SO_REUSEADDR on the listening socket
    #[arg(short = 'r', long = "reuseaddr")]
    pub reuseaddr: bool,

    /// Enable SO_REUSEPORT on the listening socket
    #[arg(short = 'R', long = "reuseport")]
    pub reuseport: bool,

    /// Number of worker threads contending on the listener (values <= 0 fall back to 2)
    #[arg(short = 'w', long = "workers", default_value_t = 2, allow_negative_numbers = true)]
    pub workers: i32,

    /// Dispatch mode: pre-spawned accept pool or epoll event loop
    #[arg(short = 'm', long = "mode", value_enum, default_value_t = Mode::Fork)]
    pub mode: Mode,

    /// Serialize accepts across workers with an advisory file lock (fork mode)
    #[arg(short = 'f', long = "flock", conflicts_with = "nonblocking")]
    pub flock: bool,

    /// Mark the listening socket non-blocking (fork mode)
    #[arg(short = 'n', long = "nonblocking")]
    pub nonblocking: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// Which of the two dispatch architectures to run.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Pre-spawned workers blocking on `accept` against a shared listener
    Fork,
    /// Replicated event loops multiplexing connections with epoll
    Epoll,
}

/// How an acceptor worker in fork mode obtains connections.
///
/// `Flock` and `NonBlocking` are the two herd-mitigation experiments from
/// the original demo; `Plain` is the baseline that exhibits the thundering
/// herd when several workers block on one listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptStrategy {
    Plain,
    Flock,
    NonBlocking,
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub reuseaddr: bool,
    pub reuseport: bool,
    pub workers: usize,
    pub mode: Mode,
    pub strategy: AcceptStrategy,
    pub log_level: String,
}

impl Config {
    /// Parse CLI arguments and resolve them into a `Config`.
    ///
    /// Exits with code 0 on `-h`/`--help` and with a usage error if `-f`
    /// and `-n` are combined, both handled by clap before any socket exists.
    pub fn load() -> Self {
        Self::from_args(CliArgs::parse())
    }

    fn from_args(cli: CliArgs) -> Self {
        let port = if cli.port <= 0 {
            DEFAULT_PORT
        } else {
            cli.port as u16
        };

        let workers = if cli.workers <= 0 {
            DEFAULT_WORKERS
        } else {
            cli.workers as usize
        };

        let strategy = if cli.flock {
            AcceptStrategy::Flock
        } else if cli.nonblocking {
            AcceptStrategy::NonBlocking
        } else {
            AcceptStrategy::Plain
        };

        Config {
            host: cli.local_ip,
            port,
            reuseaddr: cli.reuseaddr,
            reuseport: cli.reuseport,
            workers,
            mode: cli.mode,
            strategy,
            log_level: cli.log_level,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Config {
        let mut argv = vec!["echo-herd"];
        argv.extend_from_slice(args);
        Config::from_args(CliArgs::try_parse_from(argv).unwrap())
    }

    #[test]
    fn test_defaults() {
        let config = parse(&[]);
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 80);
        assert_eq!(config.workers, 2);
        assert_eq!(config.mode, Mode::Fork);
        assert_eq!(config.strategy, AcceptStrategy::Plain);
        assert!(!config.reuseaddr);
        assert!(!config.reuseport);
    }

    #[test]
    fn test_non_positive_port_falls_back() {
        assert_eq!(parse(&["-p", "0"]).port, 80);
        assert_eq!(parse(&["-p", "-9000"]).port, 80);
        assert_eq!(parse(&["-p", "9000"]).port, 9000);
    }

    #[test]
    fn test_non_positive_workers_fall_back() {
        assert_eq!(parse(&["-w", "0"]).workers, 2);
        assert_eq!(parse(&["-w", "-3"]).workers, 2);
        assert_eq!(parse(&["-w", "8"]).workers, 8);
    }

    #[test]
    fn test_strategy_flags() {
        assert_eq!(parse(&["-f"]).strategy, AcceptStrategy::Flock);
        assert_eq!(parse(&["-n"]).strategy, AcceptStrategy::NonBlocking);
    }

    #[test]
    fn test_flock_and_nonblocking_conflict() {
        let result = CliArgs::try_parse_from(["echo-herd", "-f", "-n"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_mode_selection() {
        assert_eq!(parse(&["-m", "epoll"]).mode, Mode::Epoll);
        assert_eq!(parse(&["-m", "fork"]).mode, Mode::Fork);
    }
}
