//! The echo leaf shared by both dispatch models.
//!
//! One bounded read, one exact write-back. The buffer is only ever
//! consulted up to the read count; bytes beyond it are stale and must not
//! leak into the response or the logs.

use std::io::{self, Read, Write};

/// Fixed per-read buffer size.
pub const BUF_SIZE: usize = 1024;

/// Result of servicing one readiness event on a connection.
#[derive(Debug, PartialEq, Eq)]
pub enum EchoOutcome {
    /// `n` bytes were read and the identical bytes written back.
    Echoed(usize),
    /// Zero-length read: the peer closed its side.
    PeerClosed,
}

/// Service one wake-up on a readable connection.
///
/// Reads at most [`BUF_SIZE`] bytes in a single call and writes exactly the
/// bytes read in a single call. A write that returns a different count than
/// the read is unrecoverable; there is no partial-write retry.
///
/// `WouldBlock` from the read is surfaced to the caller before any bytes
/// are consumed, and callers treat that wake as spurious. A `WouldBlock`
/// from the write is not the same situation: the read bytes are already
/// consumed and would be lost if the wake were retried, so write-side
/// backpressure is reported as the unrecoverable short-write case.
pub fn echo_once<S: Read + Write>(stream: &mut S) -> io::Result<EchoOutcome> {
    let mut buf = [0u8; BUF_SIZE];

    let n = stream.read(&mut buf)?;
    if n == 0 {
        return Ok(EchoOutcome::PeerClosed);
    }

    let written = match stream.write(&buf[..n]) {
        Ok(written) => written,
        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("write blocked with {n} bytes pending"),
            ));
        }
        Err(e) => return Err(e),
    };
    if written != n {
        return Err(io::Error::new(
            io::ErrorKind::WriteZero,
            format!("short write: {written} != {n}"),
        ));
    }

    Ok(EchoOutcome::Echoed(n))
}
