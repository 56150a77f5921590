//! Process-wide broker connection.
//!
//! One [`Transport`] exists per process. It owns the two bootstrap sockets,
//! the signal set masked during calls, and the fast-path dispatcher. Threads
//! share it through an `Arc` and build their own
//! [`ThreadContext`](crate::thread::ThreadContext) on top.
//!
//! The command socket carries no traffic after connect; it stays open for
//! the life of the process so the broker can tell when the process is gone.
//!
//! Descriptor lookups are serialised through [`Transport::lock_fd_exchange`]:
//! the `get_handle_fd` request, the receive and the cache registration run
//! under one lock, so a descriptor always reaches the thread that asked for
//! it. A descriptor tagged for some other handle is parked until a lookup
//! for that handle claims it.

use std::collections::HashMap;
use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::bootstrap::{Bootstrap, BrokerLauncher, ProcessLauncher};
use crate::config::TransportConfig;
use crate::error::{BootstrapError, FdError, TransportError};
use crate::fastpath::{self, FastDispatcher};
use crate::fatal;
use crate::fd::{self, ReceivedFd};
use crate::protocol::Handle;
use crate::signals::{self, CallSignalSet};

/// Descriptors that arrived for a handle no lookup was waiting on.
#[derive(Debug, Default)]
pub struct ParkedFds {
    by_handle: HashMap<Handle, Vec<OwnedFd>>,
}

impl ParkedFds {
    fn park(&mut self, received: ReceivedFd) {
        self.by_handle.entry(received.handle).or_default().push(received.fd);
    }

    fn claim(&mut self, handle: Handle) -> Option<OwnedFd> {
        let fds = self.by_handle.get_mut(&handle)?;
        let fd = fds.pop();
        if fds.is_empty() {
            self.by_handle.remove(&handle);
        }
        fd
    }

    /// Number of parked descriptors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_handle.values().map(Vec::len).sum()
    }

    /// Whether nothing is parked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_handle.is_empty()
    }
}

/// The connection context shared by every thread of the process.
#[derive(Debug)]
pub struct Transport {
    // Never read; held open so the broker sees the process go.
    _command: UnixStream,
    fd_socket: UnixStream,
    server_dir: Option<PathBuf>,
    signals: CallSignalSet,
    fast: Box<dyn FastDispatcher>,
    config: TransportConfig,
    fd_exchange: Mutex<ParkedFds>,
}

impl Transport {
    /// Bootstrap a connection, launching the broker if necessary.
    pub fn connect(config: TransportConfig) -> Result<Self, BootstrapError> {
        let mut launcher = ProcessLauncher::new();
        Self::connect_with(config, &mut launcher)
    }

    /// [`Self::connect`] with a caller-supplied launcher.
    pub fn connect_with(
        config: TransportConfig,
        launcher: &mut dyn BrokerLauncher,
    ) -> Result<Self, BootstrapError> {
        let conn = Bootstrap::new(&config, launcher).connect()?;
        let fast = fastpath::select(&config, Some(conn.fd_socket.as_raw_fd()));
        let mut transport = Self::from_parts(conn.command, conn.fd_socket, config, fast);
        transport.server_dir = Some(conn.server_dir);
        Ok(transport)
    }

    /// [`Self::connect`], exiting the process with a diagnostic on failure.
    pub fn connect_or_exit(config: TransportConfig) -> Self {
        match Self::connect(config) {
            Ok(transport) => transport,
            Err(e) => fatal::bootstrap_failed(&e),
        }
    }

    /// Assemble a transport from already-connected sockets.
    #[must_use]
    pub fn from_parts(
        command: UnixStream,
        fd_socket: UnixStream,
        config: TransportConfig,
        fast: Box<dyn FastDispatcher>,
    ) -> Self {
        signals::ignore_sigpipe();
        Self {
            _command: command,
            fd_socket,
            server_dir: None,
            signals: CallSignalSet::new(),
            fast,
            config,
            fd_exchange: Mutex::new(ParkedFds::default()),
        }
    }

    /// Hand `fd` to the broker on behalf of thread `tid`.
    pub fn send_fd(&self, tid: u32, fd: RawFd) -> Result<(), TransportError> {
        fd::send_fd(&self.fd_socket, tid, fd)
    }

    /// Wait up to the receive timeout for a descriptor from the broker.
    pub fn receive_fd(&self) -> Result<ReceivedFd, FdError> {
        fd::receive_fd(&self.fd_socket)
    }

    /// Take the process-wide descriptor-lookup lock.
    ///
    /// Hold it from the request that makes the broker send a descriptor
    /// until that descriptor is registered.
    pub fn lock_fd_exchange(&self) -> MutexGuard<'_, ParkedFds> {
        // A thread torn down mid-lookup leaves the parked set consistent.
        self.fd_exchange.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Receive the descriptor for `handle`, parking any that arrive for
    /// other handles. `parked` is the guard from [`Self::lock_fd_exchange`].
    pub fn receive_fd_for(&self, parked: &mut ParkedFds, handle: Handle) -> Result<ReceivedFd, FdError> {
        if let Some(fd) = parked.claim(handle) {
            log::debug!("[transport] using parked descriptor for {handle}");
            return Ok(ReceivedFd { handle, fd });
        }
        loop {
            let received = self.receive_fd()?;
            if received.handle == handle {
                return Ok(received);
            }
            log::warn!(
                "[transport] descriptor for {} arrived while waiting for {handle}, parking it",
                received.handle
            );
            parked.park(received);
        }
    }

    /// Signals blocked during calls.
    #[must_use]
    pub fn signals(&self) -> &CallSignalSet {
        &self.signals
    }

    /// The fast-path dispatcher chosen at connect time.
    #[must_use]
    pub fn fast(&self) -> &dyn FastDispatcher {
        self.fast.as_ref()
    }

    /// Configuration this transport was built from.
    #[must_use]
    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Server directory, when connected through bootstrap.
    #[must_use]
    pub fn server_dir(&self) -> Option<&Path> {
        self.server_dir.as_deref()
    }
}
