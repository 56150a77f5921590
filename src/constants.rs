//! Protocol-wide constants for the broker transport.
//!
//! This module centralizes the limits, timeouts and fixed sizes shared by
//! the bootstrap, the call engine and the descriptor-passing code.
//!
//! # Categories
//!
//! - **Protocol**: version and fixed frame sizes
//! - **Limits**: request segment count and payload caps
//! - **Timeouts**: connect backoff and descriptor receipt bounds
//! - **Filesystem**: socket and directory names

use std::time::Duration;

// ============================================================================
// Protocol
// ============================================================================

/// Protocol version compiled into this client.
///
/// Exchanged once per thread at registration; any difference from the
/// broker's value is fatal.
pub const SERVER_PROTOCOL_VERSION: u32 = 612;

/// Size of the fixed request frame (header + opcode body).
pub const REQUEST_FIXED_SIZE: usize = 64;

/// Size of the request header: `{opcode: u32, request_size: u32}`.
pub const REQUEST_HEADER_SIZE: usize = 8;

/// Size of the fixed reply frame (header + opcode body).
pub const REPLY_FIXED_SIZE: usize = 64;

/// Size of the reply header: `{error: u32, reply_size: u32}`.
pub const REPLY_HEADER_SIZE: usize = 8;

/// Bytes available to an opcode's fixed request fields.
pub const REQUEST_BODY_SIZE: usize = REQUEST_FIXED_SIZE - REQUEST_HEADER_SIZE;

/// Bytes available to an opcode's fixed reply fields.
pub const REPLY_BODY_SIZE: usize = REPLY_FIXED_SIZE - REPLY_HEADER_SIZE;

// ============================================================================
// Limits
// ============================================================================

/// Maximum number of variable-length ranges appended to one request.
pub const MAX_REQUEST_SEGMENTS: usize = 5;

/// Maximum total variable data carried by one request.
///
/// A blocking `writev` on a pipe completes the whole message unless a
/// signal interrupts it, and call signals are masked for the duration.
pub const MAX_REQUEST_DATA: usize = 64 * 1024;

/// Default capacity of a thread's scratch buffer for variable reply data.
pub const SCRATCH_CAPACITY: usize = 64 * 1024;

// ============================================================================
// Timeouts & retries
// ============================================================================

/// Number of connect attempts per bootstrap pass.
pub const MAX_CONNECT_ATTEMPTS: u32 = 3;

/// Base unit of the quadratic connect backoff (`base × attempt²`).
pub const CONNECT_BACKOFF_BASE: Duration = Duration::from_millis(100);

/// Upper bound on waiting for a descriptor on the fd-exchange socket.
///
/// Some kernels drop an in-flight `SCM_RIGHTS` descriptor under load; the
/// receive gives up after this long and reports the loss to the caller.
pub const FD_RECEIVE_TIMEOUT: Duration = Duration::from_secs(1);

/// How many times a lost descriptor is waited for again before giving up.
pub const FD_RECEIVE_RETRIES: u32 = 3;

// ============================================================================
// Filesystem
// ============================================================================

/// Name of the command socket inside the server directory.
pub const COMMAND_SOCKET_NAME: &str = "socket";

/// Name of the fd-exchange socket inside the server directory.
pub const FD_SOCKET_NAME: &str = "fd-socket";

/// Prefix of the per-host, per-user server directory.
pub const SERVER_DIR_PREFIX: &str = "wineserver";

/// Broker executable name searched for when no override is set.
pub const BROKER_BINARY_NAME: &str = "wineserver";

/// Preloader executable name searched for when no override is set.
pub const PRELOADER_BINARY_NAME: &str = "wine-preloader";

/// Default shared-memory helper library name (resolved by the dynamic loader).
pub const DEFAULT_SHM_LIBRARY: &str = "libwineshm.so";
