//! Descriptor passing over the fd-exchange socket.
//!
//! # Wire format
//!
//! ```text
//! client → broker: [u32 tid][i32 fd]   + one SCM_RIGHTS descriptor
//! broker → client: [u32 handle]        + one SCM_RIGHTS descriptor
//! ```
//!
//! The `fd` field is the sender's own descriptor number; the broker uses it
//! together with `tid` to match the descriptor against the request that
//! mentions it.
//!
//! # Descriptor loss
//!
//! On some kernels an in-flight descriptor can be dropped. Receipt is
//! therefore bounded by [`FD_RECEIVE_TIMEOUT`]; expiry yields
//! [`FdError::DescriptorLost`] and the caller decides whether to ask again.
//!
//! Every descriptor returned from here is close-on-exec.

use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

use crate::constants::FD_RECEIVE_TIMEOUT;
use crate::error::{FdError, TransportError};
use crate::protocol::Handle;

/// A descriptor received from the broker together with its handle tag.
#[derive(Debug)]
pub struct ReceivedFd {
    /// Handle the broker attached to the descriptor.
    pub handle: Handle,
    /// The descriptor, already close-on-exec.
    pub fd: OwnedFd,
}

// ─── Client operations ─────────────────────────────────────────────────────

/// Hand `fd` to the broker, tagged with the sending thread's id.
///
/// Retries on `EINTR`. A closed broker (`EPIPE`, reset) is reported as
/// [`TransportError::BrokerGone`].
pub fn send_fd<S: AsRawFd>(sock: &S, tid: u32, fd: RawFd) -> Result<(), TransportError> {
    let mut msg = [0u8; 8];
    msg[0..4].copy_from_slice(&tid.to_ne_bytes());
    msg[4..8].copy_from_slice(&fd.to_ne_bytes());

    loop {
        match send_with_fd(sock.as_raw_fd(), &msg, fd) {
            Ok(n) if n == msg.len() => {
                log::trace!("[fd] sent fd {fd} for tid {tid:04x}");
                return Ok(());
            }
            Ok(n) => {
                return Err(TransportError::Protocol(format!(
                    "partial fd message: {n} of {} bytes",
                    msg.len()
                )))
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(TransportError::from_io("sendmsg", e)),
        }
    }
}

/// Wait up to [`FD_RECEIVE_TIMEOUT`] for a descriptor from the broker.
pub fn receive_fd<S: AsRawFd>(sock: &S) -> Result<ReceivedFd, FdError> {
    receive_fd_timeout(sock, FD_RECEIVE_TIMEOUT)
}

/// [`receive_fd`] with an explicit bound.
pub fn receive_fd_timeout<S: AsRawFd>(sock: &S, timeout: Duration) -> Result<ReceivedFd, FdError> {
    let raw = sock.as_raw_fd();
    if !wait_readable(raw, timeout)? {
        log::warn!("[fd] no descriptor within {timeout:?}, reporting it lost");
        return Err(FdError::DescriptorLost);
    }

    let mut buf = [0u8; 4];
    let (n, fds) = loop {
        match recv_with_fds(raw, &mut buf) {
            Ok(r) => break r,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(TransportError::from_io("recvmsg", e).into()),
        }
    };

    let mut fds = fds.into_iter();
    let Some(fd) = fds.next() else {
        if n == 0 {
            return Err(TransportError::BrokerGone.into());
        }
        return Err(TransportError::Protocol("fd message arrived without a descriptor".into()).into());
    };
    // A well-behaved broker sends exactly one; extras are closed on drop.
    let surplus = fds.len();
    if surplus != 0 {
        log::warn!("[fd] dropping {surplus} surplus descriptor(s)");
    }
    if n != buf.len() {
        return Err(TransportError::Protocol(format!("fd message of {n} bytes")).into());
    }

    set_cloexec(fd.as_raw_fd()).map_err(|e| TransportError::from_io("fcntl", e))?;
    let handle = Handle(u32::from_ne_bytes(buf));
    log::trace!("[fd] received fd {} for handle {handle}", fd.as_raw_fd());
    Ok(ReceivedFd { handle, fd })
}

/// Mark `fd` close-on-exec.
pub fn set_cloexec(fd: RawFd) -> io::Result<()> {
    // SAFETY: fcntl on an arbitrary integer is memory-safe; errors are reported.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: as above.
    if unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Whether `fd` is close-on-exec.
pub fn is_cloexec(fd: RawFd) -> io::Result<bool> {
    // SAFETY: see `set_cloexec`.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(flags & libc::FD_CLOEXEC != 0)
}

/// `poll` for readability, retrying on `EINTR`. `Ok(false)` on timeout.
fn wait_readable(fd: RawFd, timeout: Duration) -> Result<bool, TransportError> {
    let mut pfd = libc::pollfd { fd, events: libc::POLLIN, revents: 0 };
    let millis = libc::c_int::try_from(timeout.as_millis()).unwrap_or(libc::c_int::MAX);
    loop {
        // SAFETY: `pfd` is a valid pollfd for the duration of the call.
        let ret = unsafe { libc::poll(&mut pfd, 1, millis) };
        if ret >= 0 {
            return Ok(ret > 0);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(TransportError::from_io("poll", err));
        }
    }
}

// ─── SCM_RIGHTS primitives ─────────────────────────────────────────────────

#[cfg(any(target_os = "linux", target_os = "android"))]
const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const SEND_FLAGS: libc::c_int = 0;

/// Send `data` with `fd` attached via `sendmsg` + SCM_RIGHTS.
///
/// The kernel installs an independent descriptor for the same open file
/// description in the receiving process; the sender keeps its own copy.
/// Returns the number of data bytes sent.
pub fn send_with_fd(sock_fd: RawFd, data: &[u8], fd: RawFd) -> io::Result<usize> {
    let fd_size = std::mem::size_of::<libc::c_int>();
    // SAFETY: CMSG_SPACE is a pure size computation.
    let cmsg_space = unsafe { libc::CMSG_SPACE(fd_size as u32) } as usize;
    let mut cmsg_buf = vec![0u8; cmsg_space];

    let mut iov = libc::iovec {
        iov_base: data.as_ptr() as *mut libc::c_void,
        iov_len: data.len(),
    };

    // SAFETY: msghdr is plain data; zeroed is a valid initial state and keeps
    // this portable across libc layouts with private padding fields.
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr().cast::<libc::c_void>();
    msg.msg_controllen = cmsg_space as _;

    // SAFETY: the control buffer is CMSG_SPACE(sizeof(int)) bytes, so the
    // first header and its data slot are in bounds.
    unsafe {
        let cmsg = libc::CMSG_FIRSTHDR(&msg);
        (*cmsg).cmsg_level = libc::SOL_SOCKET;
        (*cmsg).cmsg_type = libc::SCM_RIGHTS;
        (*cmsg).cmsg_len = libc::CMSG_LEN(fd_size as u32) as _;
        let data_ptr = libc::CMSG_DATA(cmsg).cast::<libc::c_int>();
        std::ptr::write_unaligned(data_ptr, fd);
    }

    // SAFETY: every pointer in `msg` refers to live buffers above.
    let n = unsafe { libc::sendmsg(sock_fd, &msg, SEND_FLAGS) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

/// Receive into `buf` with `recvmsg`, collecting SCM_RIGHTS descriptors.
///
/// Returns `(bytes_read, descriptors)`. Descriptors come back as `OwnedFd`
/// so any the caller does not keep are closed.
pub fn recv_with_fds(sock_fd: RawFd, buf: &mut [u8]) -> io::Result<(usize, Vec<OwnedFd>)> {
    // SAFETY: pure size computation.
    let cmsg_space = unsafe { libc::CMSG_SPACE(std::mem::size_of::<libc::c_int>() as _) } as usize;
    let mut cmsg_buf = vec![0u8; cmsg_space * 4]; // room for a few FDs

    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr().cast::<libc::c_void>(),
        iov_len: buf.len(),
    };
    // SAFETY: see `send_with_fd`.
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr().cast::<libc::c_void>();
    msg.msg_controllen = cmsg_buf.len() as _;

    // SAFETY: `msg` points at live, correctly sized buffers.
    let n = unsafe { libc::recvmsg(sock_fd, &mut msg, 0) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }

    let mut fds = Vec::new();
    // SAFETY: the kernel filled `msg_control`; CMSG_* walk it within
    // `msg_controllen`.
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                let data = libc::CMSG_DATA(cmsg);
                let fd_count = ((*cmsg).cmsg_len as usize - libc::CMSG_LEN(0) as usize)
                    / std::mem::size_of::<libc::c_int>();
                for i in 0..fd_count {
                    let fd: libc::c_int = std::ptr::read_unaligned(
                        data.add(i * std::mem::size_of::<libc::c_int>()).cast::<libc::c_int>(),
                    );
                    fds.push(OwnedFd::from_raw_fd(fd));
                }
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }
    }

    Ok((n as usize, fds))
}

/// Create a pipe, returning `(read_end, write_end)`, both close-on-exec.
pub fn pipe_cloexec() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as libc::c_int; 2];
    // SAFETY: `pipe` writes exactly two descriptors into `fds` on success.
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: both descriptors were just created and are owned by nobody else.
    let (read, write) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
    set_cloexec(read.as_raw_fd())?;
    set_cloexec(write.as_raw_fd())?;
    Ok((read, write))
}

// ─── Tests ─────────────────────────────────────────────────────────────────
