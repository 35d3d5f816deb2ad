//! Accept-pool dispatch: pre-spawned workers contending on one listener.
//!
//! Every worker holds its own duplicate of the listening socket and blocks
//! on `accept` against it; which worker wins a given connection is left
//! entirely to the kernel. This is the thundering-herd demonstration: no
//! user-space coordination exists unless the flock strategy is selected.
//!
//! Each accepted connection is handed to a dedicated detached handler
//! thread, mirroring the secondary fork of the classic demo. Handler
//! threads are fire-and-forget; they are reaped by process exit, never
//! joined by their acceptor.

use crate::config::{AcceptStrategy, Config};
use crate::echo::{echo_once, EchoOutcome};
use crate::listener::bind_listener;
use mio::{Events, Interest, Poll, Token};
use std::fs::{File, OpenOptions};
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::unix::io::AsRawFd;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, trace};

/// How long a connection handler waits for readability per loop turn.
const READ_WAIT: Duration = Duration::from_secs(5);

/// Back-off after losing the accept race on a non-blocking listener.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(10);

/// Shared lock file for the flock accept strategy.
const FLOCK_PATH: &str = "/tmp/.echo-herd.lock";

const CONN_TOKEN: Token = Token(0);

/// Run the accept-pool server.
///
/// Never returns success: the root thread parks on the acceptor join
/// handles, and acceptor loops only return on error, so coming back at all
/// means setup failed or every worker has died.
pub fn run(config: Config) -> io::Result<()> {
    let nonblocking = config.strategy == AcceptStrategy::NonBlocking;
    let listener = bind_listener(&config, nonblocking)?;
    serve(listener, &config)
}

/// Spawn the acceptors against `listener` and supervise them.
fn serve(listener: TcpListener, config: &Config) -> io::Result<()> {
    info!(
        workers = config.workers,
        strategy = ?config.strategy,
        "Starting accept pool"
    );

    let mut handles = Vec::with_capacity(config.workers);

    for worker_id in 0..config.workers {
        // Explicit handle duplication: each worker owns its own fd for the
        // one shared kernel accept queue.
        let listener = listener.try_clone()?;
        let strategy = config.strategy;

        let handle = thread::Builder::new()
            .name(format!("acceptor-{worker_id}"))
            .spawn(move || {
                if let Err(e) = acceptor_loop(worker_id, listener, strategy) {
                    error!(worker = worker_id, error = %e, "Acceptor failed");
                }
            })?;

        handles.push(handle);
    }

    for handle in handles {
        let _ = handle.join();
    }

    // Every acceptor has died on a runtime error; the process must not
    // exit cleanly.
    Err(io::Error::new(
        io::ErrorKind::Other,
        "all acceptors exited",
    ))
}

/// One worker's accept loop.
///
/// Accept or spawn failure terminates this worker only; its siblings keep
/// their own duplicates of the listener and continue accepting.
fn acceptor_loop(
    worker_id: usize,
    listener: TcpListener,
    strategy: AcceptStrategy,
) -> io::Result<()> {
    let lock = match strategy {
        AcceptStrategy::Flock => Some(AcceptLock::open()?),
        _ => None,
    };

    info!(worker = worker_id, "Acceptor started");

    loop {
        let (stream, peer) = match strategy {
            AcceptStrategy::Plain => listener.accept()?,
            AcceptStrategy::Flock => {
                // Hold the advisory lock across the blocking accept so only
                // one worker sits in the kernel wait queue at a time.
                let _guard = lock.as_ref().unwrap().acquire()?;
                listener.accept()?
            }
            AcceptStrategy::NonBlocking => match listener.accept() {
                Ok(pair) => pair,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    trace!(worker = worker_id, "Lost accept race");
                    thread::sleep(ACCEPT_RETRY_DELAY);
                    continue;
                }
                Err(e) => return Err(e),
            },
        };

        info!(worker = worker_id, peer = %peer, "Accepted connection");

        // Dedicated handler, detached: the acceptor goes straight back to
        // accept and never waits on its children.
        thread::Builder::new()
            .name(format!("conn-{peer}"))
            .spawn(move || {
                if let Err(e) = serve_connection(stream, peer) {
                    error!(peer = %peer, error = %e, "Connection handler failed");
                }
            })?;
    }
}

/// Service one connection with a periodic poll-then-read loop.
///
/// The readiness set contains only this connection. A poll timeout just
/// loops; a wake performs exactly one bounded read and echo. Reading once
/// per wake means more than [`crate::echo::BUF_SIZE`] bytes arriving in one
/// burst are only drained as further data triggers further wakes.
fn serve_connection(stream: TcpStream, peer: SocketAddr) -> io::Result<()> {
    stream.set_nonblocking(true)?;
    let mut stream = mio::net::TcpStream::from_std(stream);

    let mut poll = Poll::new()?;
    let mut events = Events::with_capacity(1);
    poll.registry()
        .register(&mut stream, CONN_TOKEN, Interest::READABLE)?;

    loop {
        if let Err(e) = poll.poll(&mut events, Some(READ_WAIT)) {
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(e);
        }

        if events.is_empty() {
            // Timeout: nothing to read this turn.
            continue;
        }

        match echo_once(&mut stream) {
            Ok(EchoOutcome::Echoed(n)) => {
                debug!(peer = %peer, bytes = n, "Echoed");
            }
            Ok(EchoOutcome::PeerClosed) => {
                info!(peer = %peer, "Connection closed by peer");
                return Ok(());
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Advisory file lock serializing accepts across workers (`-f`).
struct AcceptLock {
    file: File,
}

/// Held for the duration of one accept; unlocks on drop.
struct AcceptLockGuard<'a> {
    lock: &'a AcceptLock,
}

impl AcceptLock {
    fn open() -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(FLOCK_PATH)?;
        Ok(Self { file })
    }

    fn acquire(&self) -> io::Result<AcceptLockGuard<'_>> {
        if unsafe { libc::flock(self.file.as_raw_fd(), libc::LOCK_EX) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(AcceptLockGuard { lock: self })
    }
}

impl Drop for AcceptLockGuard<'_> {
    fn drop(&mut self) {
        unsafe { libc::flock(self.lock.file.as_raw_fd(), libc::LOCK_UN) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Mode;
    use std::io::{Read, Write};

    fn test_config(strategy: AcceptStrategy) -> Config {
        Config {
            host: "127.0.0.1".to_string(),
            port: 0,
            reuseaddr: false,
            reuseport: false,
            workers: 1,
            mode: Mode::Fork,
            strategy,
            log_level: "info".to_string(),
        }
    }

    /// Bind an ephemeral listener and run one acceptor on a background
    /// thread; returns the address clients should dial.
    fn spawn_acceptor(strategy: AcceptStrategy) -> SocketAddr {
        let config = test_config(strategy);
        let nonblocking = strategy == AcceptStrategy::NonBlocking;
        let listener = bind_listener(&config, nonblocking).unwrap();
        let addr = listener.local_addr().unwrap();

        thread::spawn(move || {
            let _ = acceptor_loop(0, listener, strategy);
        });

        addr
    }

    fn ping(addr: SocketAddr) {
        let mut client = TcpStream::connect(addr).unwrap();
        client.write_all(b"ping").unwrap();

        let mut reply = [0u8; 4];
        client.read_exact(&mut reply).unwrap();
        assert_eq!(&reply, b"ping");
    }

    #[test]
    fn test_echo_round_trip() {
        let addr = spawn_acceptor(AcceptStrategy::Plain);
        ping(addr);
    }

    #[test]
    fn test_accepts_after_peer_close() {
        let addr = spawn_acceptor(AcceptStrategy::Plain);

        // First client connects, echoes, disconnects.
        ping(addr);

        // Server must still accept and serve a fresh connection.
        ping(addr);
    }

    #[test]
    fn test_concurrent_connections_are_independent() {
        let addr = spawn_acceptor(AcceptStrategy::Plain);

        let mut first = TcpStream::connect(addr).unwrap();
        let mut second = TcpStream::connect(addr).unwrap();

        second.write_all(b"beta").unwrap();
        let mut reply = [0u8; 4];
        second.read_exact(&mut reply).unwrap();
        assert_eq!(&reply, b"beta");

        // Closing one connection must not disturb the other.
        drop(second);

        first.write_all(b"alpha").unwrap();
        let mut reply = [0u8; 5];
        first.read_exact(&mut reply).unwrap();
        assert_eq!(&reply, b"alpha");
    }

    #[test]
    fn test_nonblocking_strategy_round_trip() {
        let addr = spawn_acceptor(AcceptStrategy::NonBlocking);
        ping(addr);
    }

    #[test]
    fn test_flock_strategy_round_trip() {
        let addr = spawn_acceptor(AcceptStrategy::Flock);
        ping(addr);
    }

    #[test]
    fn test_serve_fails_once_all_acceptors_die() {
        let config = test_config(AcceptStrategy::Plain);
        let listener = bind_listener(&config, false).unwrap();
        let sabotage = listener.try_clone().unwrap();

        let handle = thread::spawn(move || serve(listener, &config));

        // Let the acceptor block in accept, then tear the listening socket
        // down under it; the woken accept fails and the last worker dies.
        thread::sleep(Duration::from_millis(50));
        unsafe { libc::shutdown(sabotage.as_raw_fd(), libc::SHUT_RDWR) };

        assert!(handle.join().unwrap().is_err());
    }

    #[test]
    fn test_chunk_boundaries_preserved() {
        let addr = spawn_acceptor(AcceptStrategy::Plain);
        let mut client = TcpStream::connect(addr).unwrap();

        for chunk in [&b"one"[..], &b"twotwo"[..], &b"three-three"[..]] {
            client.write_all(chunk).unwrap();
            let mut reply = vec![0u8; chunk.len()];
            client.read_exact(&mut reply).unwrap();
            assert_eq!(reply, chunk);
        }
    }
}
