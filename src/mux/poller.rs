//! Thin safe wrapper over the Linux epoll facility.
//!
//! All interest is registered edge-triggered. The listening socket
//! additionally carries `EPOLLEXCLUSIVE` so that, with several workers
//! sharing one listener across their epoll instances, a new connection
//! wakes only one of them instead of the whole herd.

use std::io;
use std::os::unix::io::RawFd;

/// Upper bound on ready handles returned by a single wait.
pub const MAX_EVENTS: usize = 10;

/// A readiness event for a registered file descriptor.
#[derive(Debug, Clone, Copy)]
pub struct Event {
    /// Caller-chosen identifier supplied at registration.
    pub token: usize,
}

/// An owned epoll instance.
pub struct Poller {
    epfd: RawFd,
}

impl Poller {
    pub fn new() -> io::Result<Self> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { epfd })
    }

    /// Register `fd` for edge-triggered read readiness under `token`.
    ///
    /// `exclusive` requests single-waiter wakeups for descriptors shared
    /// between several epoll instances (the listener).
    pub fn add(&self, fd: RawFd, token: usize, exclusive: bool) -> io::Result<()> {
        let mut flags = libc::EPOLLIN | libc::EPOLLET;
        if exclusive {
            flags |= libc::EPOLLEXCLUSIVE;
        }

        let mut event = libc::epoll_event {
            events: flags as u32,
            u64: token as u64,
        };

        if unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_ADD, fd, &mut event) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Remove `fd` from the interest set.
    pub fn delete(&self, fd: RawFd) -> io::Result<()> {
        let ret =
            unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut()) };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Wait up to `timeout_ms` for readiness, filling `events` with the
    /// read-ready tokens (at most [`MAX_EVENTS`]).
    ///
    /// A wait interrupted by a signal is retried transparently; any other
    /// failure is surfaced to the caller.
    pub fn wait(&self, events: &mut Vec<Event>, timeout_ms: i32) -> io::Result<()> {
        let mut raw = [libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS];

        let nfds = loop {
            let ret = unsafe {
                libc::epoll_wait(self.epfd, raw.as_mut_ptr(), MAX_EVENTS as i32, timeout_ms)
            };
            if ret >= 0 {
                break ret as usize;
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        };

        events.clear();
        for item in raw.iter().take(nfds) {
            // Error and hangup conditions are reported as readable so a
            // dead handle surfaces through the normal read path instead of
            // lingering in the interest set.
            let ready = (libc::EPOLLIN | libc::EPOLLERR | libc::EPOLLHUP) as u32;
            if item.events & ready != 0 {
                events.push(Event {
                    token: item.u64 as usize,
                });
            }
        }

        Ok(())
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        unsafe { libc::close(self.epfd) };
    }
}
