//! Synchronous request/reply over a thread's private channel.
//!
//! # Round trip
//!
//! ```text
//! caller ──block signals──► write / writev  (fixed frame + segments, one call)
//!                                │
//!                                ▼
//!                           read 64 bytes   (fixed reply)
//!                                │ reply_size > 0
//!                                ▼
//!                           read reply_size bytes into the caller's buffer
//!                                │
//!        restore signals ◄───────┘
//! ```
//!
//! Everything here is blocking. A channel carries at most one outstanding
//! request, so the reply read is always the answer to the request just
//! written.

use std::io;
use std::os::unix::io::RawFd;

use crate::constants::{MAX_REQUEST_SEGMENTS, REPLY_FIXED_SIZE};
use crate::error::TransportError;
use crate::protocol::{Reply, Request};
use crate::signals::CallSignalSet;

/// Perform one round trip: write `request` to `request_fd`, then read the
/// reply from `reply_fd` with variable data landing in `buf`.
///
/// The call signals are blocked for the duration.
pub fn round_trip(
    request_fd: RawFd,
    reply_fd: RawFd,
    signals: &CallSignalSet,
    request: &Request<'_>,
    buf: &mut [u8],
) -> Result<Reply, TransportError> {
    let _mask = signals
        .block()
        .map_err(|e| TransportError::Io { op: "pthread_sigmask", source: e })?;
    log::trace!("[call] {} ({} data bytes)", request.opcode(), request.data_len());
    send_request(request_fd, request)?;
    read_reply(reply_fd, buf)
}

/// Write a request as a single `write` (no data) or `writev` (with data).
pub fn send_request(fd: RawFd, request: &Request<'_>) -> Result<(), TransportError> {
    let fixed = request.fixed_bytes();
    let expected = request.wire_len();

    let mut iov: Vec<libc::iovec> = Vec::with_capacity(1 + MAX_REQUEST_SEGMENTS);
    iov.push(libc::iovec {
        iov_base: fixed.as_ptr() as *mut libc::c_void,
        iov_len: fixed.len(),
    });
    for seg in request.segments().iter().filter(|s| !s.is_empty()) {
        iov.push(libc::iovec {
            iov_base: seg.as_ptr() as *mut libc::c_void,
            iov_len: seg.len(),
        });
    }

    loop {
        let ret = if iov.len() == 1 {
            // SAFETY: `fixed` outlives the call and is exactly `fixed.len()` bytes.
            unsafe { libc::write(fd, fixed.as_ptr().cast::<libc::c_void>(), fixed.len()) }
        } else {
            // SAFETY: every iovec points into `fixed` or a borrowed segment,
            // all of which outlive the call.
            unsafe { libc::writev(fd, iov.as_ptr(), iov.len() as libc::c_int) }
        };
        if ret >= 0 {
            let written = ret as usize;
            if written != expected {
                return Err(TransportError::Protocol(format!(
                    "partial write of {}: {written} of {expected} bytes",
                    request.opcode()
                )));
            }
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(TransportError::from_io("write request", err));
        }
    }
}

/// Read one reply: the fixed frame, then exactly `reply_size` bytes of
/// variable data into `buf`.
pub fn read_reply(fd: RawFd, buf: &mut [u8]) -> Result<Reply, TransportError> {
    let mut fixed = [0u8; REPLY_FIXED_SIZE];
    let n = read_retrying(fd, &mut fixed, "read reply")?;
    if n == 0 {
        return Err(TransportError::BrokerGone);
    }
    if n != REPLY_FIXED_SIZE {
        return Err(TransportError::Protocol(format!(
            "partial reply: {n} of {REPLY_FIXED_SIZE} bytes"
        )));
    }

    let reply = Reply::from_fixed(fixed);
    let size = reply.declared_size() as usize;
    if size > buf.len() {
        return Err(TransportError::Protocol(format!(
            "wrong declared reply size {size} (buffer holds {})",
            buf.len()
        )));
    }
    read_exact(fd, &mut buf[..size])?;
    Ok(reply)
}

/// Fill `buf` completely. Zero-length reads mean the broker went away.
pub(crate) fn read_exact(fd: RawFd, buf: &mut [u8]) -> Result<(), TransportError> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = read_retrying(fd, &mut buf[filled..], "read reply data")?;
        if n == 0 {
            return Err(TransportError::BrokerGone);
        }
        filled += n;
    }
    Ok(())
}

fn read_retrying(fd: RawFd, buf: &mut [u8], op: &'static str) -> Result<usize, TransportError> {
    loop {
        // SAFETY: `buf` is a valid, writable slice of `buf.len()` bytes.
        let ret = unsafe { libc::read(fd, buf.as_mut_ptr().cast::<libc::c_void>(), buf.len()) };
        if ret >= 0 {
            return Ok(ret as usize);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(TransportError::from_io(op, err));
        }
    }
}
