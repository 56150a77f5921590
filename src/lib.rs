//! srvlink - client-side transport to a local object broker.
//!
//! A process talks to its broker over a private channel per OS thread:
//! fixed 64-byte request frames (plus up to five variable-length data
//! ranges) go down a request pipe, fixed 64-byte replies (plus variable
//! data) come back on a reply pipe. Descriptors travel on a separate
//! Unix socket with `SCM_RIGHTS`.
//!
//! # Architecture
//!
//! - **Bootstrap** - finds or creates the server directory, connects to
//!   the broker's sockets, launching the broker once if nobody answers
//! - **Transport** - process-wide context shared by every thread
//! - **ThreadContext** - one registered thread and its request/reply/wait pipes
//! - **Call engine** - a blocking round trip with call signals masked
//! - **Fast path** - optional in-process dispatcher for allow-listed opcodes
//!
//! # Modules
//!
//! - [`bootstrap`] - server directory, connect loop, broker launch
//! - [`call`] - request/reply round trip
//! - [`fd`] - descriptor passing
//! - [`protocol`] - frames, opcodes and typed bodies
//! - [`thread`] - thread registration and calls
//! - [`fatal`] - fault reporting and termination

pub mod bootstrap;
pub mod call;
pub mod config;
pub mod constants;
pub mod error;
pub mod fastpath;
pub mod fatal;
pub mod fd;
pub mod protocol;
pub mod signals;
pub mod thread;
pub mod transport;

#[cfg(test)]
mod test_support;

// Re-export commonly used types
pub use config::TransportConfig;
pub use error::{BootstrapError, FdError, HandleFdError, Status, TransportError};
pub use protocol::{Handle, Opcode, Reply, Request};
pub use thread::{ChildChannel, HandleFd, ThreadContext, Wakeup};
pub use transport::Transport;
