//! epoll event loop: one thread multiplexing the listener and all of its
//! accepted connections.
//!
//! Each worker owns a private epoll instance and a duplicate of the shared
//! listener, registered with exclusive wake so a new connection rouses one
//! worker, not all of them. Within a worker everything is run-to-completion:
//! the loop suspends only inside `epoll_wait`.
//!
//! Per wake, a ready connection gets exactly one bounded read and echo.
//! Edge-triggered interest without a full drain means a burst larger than
//! one buffer is only serviced as later arrivals re-trigger the handle;
//! this matches the reference behavior and is a known limitation.

use crate::config::Config;
use crate::echo::{echo_once, EchoOutcome};
use crate::listener::bind_listener;
use crate::mux::poller::{Event, Poller, MAX_EVENTS};
use slab::Slab;
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::unix::io::AsRawFd;
use std::thread;
use tracing::{debug, error, info};

/// Sentinel token for the listening socket; slab keys never reach it.
const LISTENER_TOKEN: usize = usize::MAX;

/// Bounded wait per loop turn, in milliseconds.
const WAIT_TIMEOUT_MS: i32 = 5000;

/// A connection owned by one event loop.
struct MuxConnection {
    stream: TcpStream,
    peer: SocketAddr,
}

/// Run the epoll server: one event-loop thread per configured worker, all
/// sharing the listening socket. The root thread parks on the joins and
/// never returns success; coming back at all means setup failed or every
/// worker has died.
pub fn run(config: Config) -> io::Result<()> {
    let listener = bind_listener(&config, true)?;
    serve(listener, &config)
}

/// Spawn the event-loop workers against `listener` and supervise them.
fn serve(listener: TcpListener, config: &Config) -> io::Result<()> {
    info!(workers = config.workers, "Starting epoll event loops");

    let mut handles = Vec::with_capacity(config.workers);

    for worker_id in 0..config.workers {
        let listener = listener.try_clone()?;

        let handle = thread::Builder::new()
            .name(format!("mux-{worker_id}"))
            .spawn(move || {
                if let Err(e) = worker_loop(worker_id, listener) {
                    error!(worker = worker_id, error = %e, "Event loop failed");
                }
            })?;

        handles.push(handle);
    }

    for handle in handles {
        let _ = handle.join();
    }

    // Every event loop has died on a runtime error; the process must not
    // exit cleanly.
    Err(io::Error::new(
        io::ErrorKind::Other,
        "all event loops exited",
    ))
}

fn worker_loop(worker_id: usize, listener: TcpListener) -> io::Result<()> {
    let poller = Poller::new()?;
    poller.add(listener.as_raw_fd(), LISTENER_TOKEN, true)?;

    let mut connections: Slab<MuxConnection> = Slab::new();
    let mut events: Vec<Event> = Vec::with_capacity(MAX_EVENTS);

    info!(worker = worker_id, "Event loop started");

    loop {
        poller.wait(&mut events, WAIT_TIMEOUT_MS)?;

        for event in &events {
            if event.token == LISTENER_TOKEN {
                accept_one(worker_id, &listener, &poller, &mut connections)?;
            } else {
                // A fatal connection error here takes down this worker and
                // every connection it is multiplexing; there is no
                // isolation inside the loop.
                handle_ready(worker_id, event.token, &poller, &mut connections)?;
            }
        }
    }
}

/// Accept a single pending connection and register it for edge-triggered
/// reads under its slab key. One accept per wake, reference behavior.
fn accept_one(
    worker_id: usize,
    listener: &TcpListener,
    poller: &Poller,
    connections: &mut Slab<MuxConnection>,
) -> io::Result<()> {
    match listener.accept() {
        Ok((stream, peer)) => {
            stream.set_nonblocking(true)?;

            let entry = connections.vacant_entry();
            let token = entry.key();
            poller.add(stream.as_raw_fd(), token, false)?;
            entry.insert(MuxConnection { stream, peer });

            info!(worker = worker_id, conn = token, peer = %peer, "Accepted connection");
        }
        // A sibling worker won the exclusive wake.
        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
        Err(e) => return Err(e),
    }
    Ok(())
}

fn handle_ready(
    worker_id: usize,
    token: usize,
    poller: &Poller,
    connections: &mut Slab<MuxConnection>,
) -> io::Result<()> {
    let conn = match connections.get_mut(token) {
        Some(conn) => conn,
        // Stale event for an entry already closed earlier in this batch.
        None => return Ok(()),
    };

    match echo_once(&mut conn.stream) {
        Ok(EchoOutcome::Echoed(n)) => {
            debug!(worker = worker_id, conn = token, peer = %conn.peer, bytes = n, "Echoed");
        }
        Ok(EchoOutcome::PeerClosed) => {
            info!(worker = worker_id, conn = token, peer = %conn.peer, "Connection closed by peer");
            let conn = connections.remove(token);
            // Deregister before the stream drop closes the fd.
            poller.delete(conn.stream.as_raw_fd())?;
        }
        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
        Err(e) => return Err(e),
    }

    Ok(())
}
