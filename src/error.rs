//! Error types for the broker transport.
//!
//! Only [`Status`] ever reaches callers of the call APIs. The other types
//! describe transport-level faults; they are either recoverable by design
//! ([`FdError::DescriptorLost`]) or end the calling thread through
//! [`crate::fatal::terminate`].

use std::fmt;
use std::io;
use std::path::PathBuf;

/// Status code reported by the broker in a reply header.
///
/// `0` is success; everything else is an NT-style status the consumer layer
/// interprets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Status(pub u32);

impl Status {
    /// The call succeeded.
    pub const SUCCESS: Self = Self(0);
    /// The handle is not (or no longer) valid.
    pub const INVALID_HANDLE: Self = Self(0xC000_0008);
    /// The named object does not exist.
    pub const OBJECT_NAME_NOT_FOUND: Self = Self(0xC000_0034);
    /// The request could not be built (too much data, too many ranges).
    pub const INVALID_PARAMETER: Self = Self(0xC000_000D);

    /// Returns `true` for the success status.
    #[must_use]
    pub fn is_success(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "status 0x{:08x}", self.0)
    }
}

impl std::error::Error for Status {}

/// Which side of the connection is behind when protocol versions differ.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutdatedSide {
    /// The broker speaks a newer protocol than this client.
    Client,
    /// This client speaks a newer protocol than the broker.
    Server,
}

/// A transport-level fault. Never returned from the public call APIs.
#[derive(Debug)]
pub enum TransportError {
    /// The broker closed its end (`EPIPE`, reset, or end of file).
    BrokerGone,
    /// The two sides disagree about framing; nothing further can be trusted.
    Protocol(String),
    /// Client and broker were built from different protocol definitions.
    VersionMismatch {
        /// Version compiled into this client.
        client: u32,
        /// Version reported by the broker.
        server: u32,
    },
    /// An unexpected system call failure on a private channel.
    Io {
        /// The operation that failed.
        op: &'static str,
        /// Underlying OS error.
        source: io::Error,
    },
}

impl TransportError {
    /// Wrap an OS error, classifying broker-death errnos as [`Self::BrokerGone`].
    pub(crate) fn from_io(op: &'static str, source: io::Error) -> Self {
        match source.raw_os_error() {
            Some(libc::EPIPE | libc::ECONNRESET) => Self::BrokerGone,
            _ => Self::Io { op, source },
        }
    }

    /// For a version mismatch, which side is outdated.
    #[must_use]
    pub fn outdated_side(&self) -> Option<OutdatedSide> {
        match self {
            Self::VersionMismatch { client, server } if server > client => {
                Some(OutdatedSide::Client)
            }
            Self::VersionMismatch { .. } => Some(OutdatedSide::Server),
            _ => None,
        }
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BrokerGone => write!(f, "broker closed the connection"),
            Self::Protocol(msg) => write!(f, "protocol error: {msg}"),
            Self::VersionMismatch { client, server } => {
                let hint = match self.outdated_side() {
                    Some(OutdatedSide::Client) => "client is outdated, update this runtime",
                    _ => "server is outdated, restart the broker with a newer binary",
                };
                write!(f, "version mismatch {client}/{server}: {hint}")
            }
            Self::Io { op, source } => write!(f, "{op}: {source}"),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Outcome of a descriptor receipt that did not produce a descriptor.
#[derive(Debug)]
pub enum FdError {
    /// Nothing arrived within the receive timeout.
    ///
    /// Reflects a kernel race where an in-flight descriptor is dropped; the
    /// caller decides whether to ask again.
    DescriptorLost,
    /// The transport itself failed.
    Transport(TransportError),
}

impl fmt::Display for FdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DescriptorLost => write!(f, "descriptor lost in transit"),
            Self::Transport(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for FdError {}

impl From<TransportError> for FdError {
    fn from(e: TransportError) -> Self {
        Self::Transport(e)
    }
}

/// Why a handle's descriptor could not be obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleFdError {
    /// The broker refused the lookup.
    Broker(Status),
    /// The broker answered but the descriptor never arrived.
    DescriptorLost,
}

impl fmt::Display for HandleFdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Broker(status) => write!(f, "broker refused descriptor: {status}"),
            Self::DescriptorLost => write!(f, "descriptor lost in transit"),
        }
    }
}

impl std::error::Error for HandleFdError {}

impl From<Status> for HandleFdError {
    fn from(status: Status) -> Self {
        Self::Broker(status)
    }
}

/// A request that cannot be put on the wire as a single write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
    /// More variable ranges than the protocol allows.
    TooManySegments {
        /// Maximum permitted.
        max: usize,
    },
    /// Variable data exceeds the per-request cap.
    TooMuchData {
        /// Bytes requested.
        len: usize,
        /// Maximum permitted.
        max: usize,
    },
    /// Fixed fields overflow the opcode body.
    BodyOverflow,
}

impl fmt::Display for RequestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooManySegments { max } => write!(f, "more than {max} data segments"),
            Self::TooMuchData { len, max } => {
                write!(f, "{len} bytes of request data exceeds {max}")
            }
            Self::BodyOverflow => write!(f, "request fields overflow the fixed body"),
        }
    }
}

impl std::error::Error for RequestError {}

/// A fatal condition found while locating or starting the broker.
#[derive(Debug)]
pub enum BootstrapError {
    /// No usable configuration root (no prefix and no home directory).
    NoConfigRoot,
    /// The server directory path is not a directory.
    NotADirectory(PathBuf),
    /// The server directory belongs to someone else.
    NotOwned {
        /// Offending path.
        path: PathBuf,
        /// Owner found on disk.
        owner: u32,
    },
    /// The server directory is reachable by group or other.
    BadPermissions {
        /// Offending path.
        path: PathBuf,
        /// Mode bits found on disk.
        mode: u32,
    },
    /// The broker (or its preloader) could not be executed.
    CannotExec {
        /// Binary that failed.
        path: PathBuf,
        /// Underlying OS error.
        source: io::Error,
    },
    /// No broker binary was found on the search path.
    BrokerNotFound,
    /// The launched broker exited before creating its sockets.
    BrokerExited(std::process::ExitStatus),
    /// The sockets never appeared.
    NoSockets(PathBuf),
    /// The sockets exist but refuse connections, even after cleanup.
    Stale {
        /// Socket that could not be reached.
        path: PathBuf,
        /// Last connect error.
        source: io::Error,
    },
    /// Other filesystem failure.
    Io {
        /// Path involved.
        path: PathBuf,
        /// Underlying OS error.
        source: io::Error,
    },
}

impl fmt::Display for BootstrapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoConfigRoot => {
                write!(f, "could not determine the configuration directory (set WINEPREFIX or HOME)")
            }
            Self::NotADirectory(path) => write!(f, "'{}' is not a directory", path.display()),
            Self::NotOwned { path, owner } => {
                write!(f, "'{}' is not owned by you (owner uid {owner})", path.display())
            }
            Self::BadPermissions { path, mode } => write!(
                f,
                "'{}' must not be accessible by group or other (mode {:o})",
                path.display(),
                mode & 0o7777
            ),
            Self::CannotExec { path, source } => {
                write!(f, "cannot exec '{}': {source}", path.display())
            }
            Self::BrokerNotFound => write!(f, "could not find the broker binary"),
            Self::BrokerExited(status) => write!(f, "broker exited with {status}"),
            Self::NoSockets(dir) => {
                write!(f, "broker did not create its sockets in '{}'", dir.display())
            }
            Self::Stale { path, source } => {
                write!(f, "cannot connect to '{}': {source}", path.display())
            }
            Self::Io { path, source } => write!(f, "'{}': {source}", path.display()),
        }
    }
}

impl std::error::Error for BootstrapError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::CannotExec { source, .. } | Self::Stale { source, .. } | Self::Io { source, .. } => {
                Some(source)
            }
            _ => None,
        }
    }
}
