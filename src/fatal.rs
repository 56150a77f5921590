//! Termination paths for unrecoverable transport faults.
//!
//! Nothing above this layer sees a transport error. A fault on an ordinary
//! thread unwinds that thread with a [`TransportFault`] payload (observable
//! through `JoinHandle::join`); a fault on the main or boot thread, or during
//! bootstrap, ends the process with one diagnostic line and status 1.

use std::fmt;

use crate::error::{BootstrapError, TransportError};

/// Panic payload carried by a thread terminated for a transport fault.
#[derive(Debug)]
pub struct TransportFault(pub TransportError);

impl fmt::Display for TransportFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// How far a fault propagates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// Only the calling thread is torn down.
    Thread,
    /// The whole process exits.
    Process,
}

/// Terminate the caller for `err`. Never returns.
pub fn terminate(scope: Scope, err: TransportError) -> ! {
    log::error!("[transport] fatal: {err}");
    match scope {
        Scope::Process => exit_with_diagnostic(&err),
        Scope::Thread => std::panic::resume_unwind(Box::new(TransportFault(err))),
    }
}

/// Print `err` as a single stderr line and exit with status 1.
pub fn exit_with_diagnostic(err: &dyn fmt::Display) -> ! {
    eprintln!("srvlink: {err}");
    std::process::exit(1)
}

/// Bootstrap failures are always process-fatal.
pub fn bootstrap_failed(err: &BootstrapError) -> ! {
    log::error!("[bootstrap] fatal: {err}");
    exit_with_diagnostic(err)
}

/// Extract the transport error from a joined thread's panic payload.
#[must_use]
pub fn fault_from_payload(payload: &(dyn std::any::Any + Send)) -> Option<&TransportError> {
    payload.downcast_ref::<TransportFault>().map(|f| &f.0)
}
