//! Signal masking around broker calls.
//!
//! A signal handler that itself talks to the broker would write a second
//! request on a channel that already has one outstanding. The asynchronous
//! signals below are therefore blocked on the calling thread for the whole
//! round trip and restored when the guard drops.

use std::io;
use std::marker::PhantomData;
use std::sync::Once;

/// Signals blocked during a call: timer, I/O-ready, interrupt, hangup and
/// the two user signals.
pub const CALL_SIGNALS: [libc::c_int; 6] = [
    libc::SIGALRM,
    libc::SIGIO,
    libc::SIGINT,
    libc::SIGHUP,
    libc::SIGUSR1,
    libc::SIGUSR2,
];

/// The signal set blocked during calls, built once per process.
#[derive(Clone, Copy)]
pub struct CallSignalSet {
    set: libc::sigset_t,
}

impl std::fmt::Debug for CallSignalSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallSignalSet").field("signals", &CALL_SIGNALS).finish()
    }
}

impl CallSignalSet {
    /// Build the set from [`CALL_SIGNALS`].
    #[must_use]
    pub fn new() -> Self {
        // SAFETY: sigset_t is plain data; sigemptyset initialises it.
        let mut set: libc::sigset_t = unsafe { std::mem::zeroed() };
        // SAFETY: `set` is a valid sigset_t and every signal number is valid.
        unsafe {
            libc::sigemptyset(&mut set);
            for sig in CALL_SIGNALS {
                libc::sigaddset(&mut set, sig);
            }
        }
        Self { set }
    }

    /// Block the set on the calling thread until the guard drops.
    pub fn block(&self) -> io::Result<SignalMaskGuard> {
        // SAFETY: see `new`.
        let mut previous: libc::sigset_t = unsafe { std::mem::zeroed() };
        // SAFETY: both pointers refer to valid sigset_t values.
        let ret = unsafe { libc::pthread_sigmask(libc::SIG_BLOCK, &self.set, &mut previous) };
        if ret != 0 {
            return Err(io::Error::from_raw_os_error(ret));
        }
        Ok(SignalMaskGuard { previous, _thread_bound: PhantomData })
    }
}

impl Default for CallSignalSet {
    fn default() -> Self {
        Self::new()
    }
}

/// Ignore `SIGPIPE` for the whole process, once.
///
/// A write to a dead broker must fail with `EPIPE` so only the calling
/// thread is torn down; the default disposition would kill the process.
pub fn ignore_sigpipe() {
    static IGNORE: Once = Once::new();
    IGNORE.call_once(|| {
        // SAFETY: installing SIG_IGN has no handler code to run.
        let previous = unsafe { libc::signal(libc::SIGPIPE, libc::SIG_IGN) };
        if previous == libc::SIG_ERR {
            log::warn!("[signals] cannot ignore SIGPIPE: {}", io::Error::last_os_error());
        }
    });
}

/// Whether `sig` is ignored process-wide.
#[cfg(test)]
pub(crate) fn is_ignored(sig: libc::c_int) -> io::Result<bool> {
    // SAFETY: plain data.
    let mut current: libc::sigaction = unsafe { std::mem::zeroed() };
    // SAFETY: query-only call with a valid out-pointer.
    if unsafe { libc::sigaction(sig, std::ptr::null(), &mut current) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(current.sa_sigaction == libc::SIG_IGN)
}

/// Restores the thread's previous signal mask on drop.
///
/// Not `Send`: a signal mask belongs to the thread that set it.
pub struct SignalMaskGuard {
    previous: libc::sigset_t,
    _thread_bound: PhantomData<*const ()>,
}

impl std::fmt::Debug for SignalMaskGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalMaskGuard").finish_non_exhaustive()
    }
}

impl Drop for SignalMaskGuard {
    fn drop(&mut self) {
        // SAFETY: `previous` was filled by pthread_sigmask in `block`.
        unsafe {
            libc::pthread_sigmask(libc::SIG_SETMASK, &self.previous, std::ptr::null_mut());
        }
    }
}

/// Whether `sig` is currently blocked on the calling thread.
#[cfg(test)]
pub(crate) fn is_blocked(sig: libc::c_int) -> io::Result<bool> {
    // SAFETY: plain data.
    let mut current: libc::sigset_t = unsafe { std::mem::zeroed() };
    // SAFETY: query-only call with a valid out-pointer.
    let ret = unsafe { libc::pthread_sigmask(libc::SIG_BLOCK, std::ptr::null(), &mut current) };
    if ret != 0 {
        return Err(io::Error::from_raw_os_error(ret));
    }
    // SAFETY: `current` was filled above.
    Ok(unsafe { libc::sigismember(&current, sig) } == 1)
}
