//! Shared-memory fast path.
//!
//! For allow-listed opcodes a helper library loaded at runtime can answer a
//! request directly from shared memory, skipping the socket round trip. The
//! helper is selected once per process; if anything about it is missing the
//! process uses [`Disabled`] and every request goes over the socket.
//!
//! # Helper ABI
//!
//! ```text
//! void    *shm_area(int fd_socket);
//! ssize_t  shm_dispatch(void *area, const struct iovec *req, int iovcnt,
//!                       uint8_t reply[64], uint8_t *data, size_t data_cap);
//! void     shm_set_debug_level(int level);
//! void     shm_set_context(void *area, const char *name, uint64_t value);
//! int      shm_poll_complete(void *area);
//! ```
//!
//! `shm_dispatch` takes the request exactly as it would be written to the
//! socket and fills the fixed reply frame plus up to `data_cap` bytes of
//! variable data. It returns the number of data bytes, or a negative value
//! when it produced no reply.

use std::ffi::CString;
use std::fmt;
use std::os::unix::io::RawFd;
use std::path::Path;

use crate::config::TransportConfig;
use crate::constants::{MAX_REQUEST_SEGMENTS, REPLY_FIXED_SIZE};
use crate::error::TransportError;
use crate::protocol::{Reply, Request};

type AreaFn = unsafe extern "C" fn(fd_socket: libc::c_int) -> *mut libc::c_void;
type DispatchFn = unsafe extern "C" fn(
    area: *mut libc::c_void,
    req: *const libc::iovec,
    iovcnt: libc::c_int,
    reply: *mut u8,
    data: *mut u8,
    data_cap: usize,
) -> isize;
type DebugLevelFn = unsafe extern "C" fn(level: libc::c_int);
type SetContextFn =
    unsafe extern "C" fn(area: *mut libc::c_void, name: *const libc::c_char, value: u64);
type PollCompleteFn = unsafe extern "C" fn(area: *mut libc::c_void) -> libc::c_int;

/// An in-process dispatcher for allow-listed requests.
pub trait FastDispatcher: Send + Sync + fmt::Debug {
    /// Whether requests may be routed here at all.
    fn is_active(&self) -> bool;

    /// Answer `request`, writing variable reply data into `buf`.
    ///
    /// Only called for fast-path eligible opcodes while [`Self::is_active`].
    fn dispatch(&self, request: &Request<'_>, buf: &mut [u8]) -> Result<Reply, TransportError>;

    /// Publish a per-thread context variable to the helper.
    fn set_context(&self, name: &str, value: u64);

    /// Reap completed asynchronous work; returns how many items finished.
    fn poll_complete(&self) -> usize;
}

/// Validate what a dispatcher produced and wrap it as a [`Reply`].
///
/// `produced` is the helper's return value: variable bytes written, or
/// negative for "no reply".
pub fn finish_reply(
    produced: isize,
    fixed: [u8; REPLY_FIXED_SIZE],
    buf_len: usize,
) -> Result<Reply, TransportError> {
    if produced < 0 {
        return Err(TransportError::Protocol("fast path produced no reply".into()));
    }
    let reply = Reply::from_fixed(fixed);
    let declared = reply.declared_size() as usize;
    if declared > buf_len {
        return Err(TransportError::Protocol(format!(
            "wrong declared reply size {declared} (buffer holds {buf_len})"
        )));
    }
    if declared != produced as usize {
        return Err(TransportError::Protocol(format!(
            "fast path declared {declared} reply bytes but wrote {produced}"
        )));
    }
    Ok(reply)
}

/// Log level forwarded to the broker side, derived from the `log` filter.
#[must_use]
pub fn debug_level() -> i32 {
    match log::max_level() {
        log::LevelFilter::Off => 0,
        log::LevelFilter::Error | log::LevelFilter::Warn | log::LevelFilter::Info => 1,
        log::LevelFilter::Debug => 2,
        log::LevelFilter::Trace => 3,
    }
}

// ─── Disabled ──────────────────────────────────────────────────────────────

/// No helper: every request takes the socket path.
#[derive(Debug, Default, Clone, Copy)]
pub struct Disabled;

impl FastDispatcher for Disabled {
    fn is_active(&self) -> bool {
        false
    }

    fn dispatch(&self, request: &Request<'_>, _buf: &mut [u8]) -> Result<Reply, TransportError> {
        Err(TransportError::Protocol(format!(
            "{} routed to a disabled fast path",
            request.opcode()
        )))
    }

    fn set_context(&self, _name: &str, _value: u64) {}

    fn poll_complete(&self) -> usize {
        0
    }
}

// ─── Shared memory ─────────────────────────────────────────────────────────

/// A loaded helper with its resolved entry points and mapped area.
pub struct SharedMemory {
    area: *mut libc::c_void,
    dispatch: DispatchFn,
    set_context: SetContextFn,
    poll_complete: PollCompleteFn,
    // Keeps the entry points above mapped; must outlive them.
    _lib: libloading::Library,
}

// SAFETY: the helper owns the area's concurrency control and its entry
// points are documented as callable from any thread.
unsafe impl Send for SharedMemory {}
// SAFETY: see above.
unsafe impl Sync for SharedMemory {}

impl fmt::Debug for SharedMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedMemory").field("area", &self.area).finish_non_exhaustive()
    }
}

impl SharedMemory {
    /// Load the helper at `path` and map its area for `fd_socket`.
    ///
    /// Fails if the library does not load, any entry point is missing, or
    /// the helper declines to provide an area.
    pub fn load(path: &Path, fd_socket: RawFd) -> Result<Self, String> {
        // SAFETY: loading runs the helper's initialisers; the helper is part
        // of the same installation as the broker.
        let lib = unsafe { libloading::Library::new(path) }
            .map_err(|e| format!("cannot load {}: {e}", path.display()))?;

        // SAFETY: the symbol types match the helper ABI documented above.
        let (area_fn, dispatch, debug_level_fn, set_context, poll_complete) = unsafe {
            (
                *lib.get::<AreaFn>(b"shm_area\0").map_err(|e| missing("shm_area", &e))?,
                *lib.get::<DispatchFn>(b"shm_dispatch\0").map_err(|e| missing("shm_dispatch", &e))?,
                *lib.get::<DebugLevelFn>(b"shm_set_debug_level\0")
                    .map_err(|e| missing("shm_set_debug_level", &e))?,
                *lib.get::<SetContextFn>(b"shm_set_context\0")
                    .map_err(|e| missing("shm_set_context", &e))?,
                *lib.get::<PollCompleteFn>(b"shm_poll_complete\0")
                    .map_err(|e| missing("shm_poll_complete", &e))?,
            )
        };

        // SAFETY: resolved from `lib`, which is still loaded.
        let area = unsafe { area_fn(fd_socket) };
        if area.is_null() {
            return Err("helper provided no shared-memory area".into());
        }
        // SAFETY: as above.
        unsafe { debug_level_fn(debug_level()) };

        Ok(Self { area, dispatch, set_context, poll_complete, _lib: lib })
    }
}

fn missing(symbol: &str, err: &libloading::Error) -> String {
    format!("missing entry point {symbol}: {err}")
}

impl FastDispatcher for SharedMemory {
    fn is_active(&self) -> bool {
        true
    }

    fn dispatch(&self, request: &Request<'_>, buf: &mut [u8]) -> Result<Reply, TransportError> {
        let fixed_req = request.fixed_bytes();
        let mut iov: Vec<libc::iovec> = Vec::with_capacity(1 + MAX_REQUEST_SEGMENTS);
        iov.push(libc::iovec {
            iov_base: fixed_req.as_ptr() as *mut libc::c_void,
            iov_len: fixed_req.len(),
        });
        for seg in request.segments() {
            iov.push(libc::iovec { iov_base: seg.as_ptr() as *mut libc::c_void, iov_len: seg.len() });
        }

        let mut fixed = [0u8; REPLY_FIXED_SIZE];
        // SAFETY: every pointer refers to a live buffer of the stated length;
        // the helper writes at most 64 bytes to `fixed` and `buf.len()` to `buf`.
        let produced = unsafe {
            (self.dispatch)(
                self.area,
                iov.as_ptr(),
                iov.len() as libc::c_int,
                fixed.as_mut_ptr(),
                buf.as_mut_ptr(),
                buf.len(),
            )
        };
        finish_reply(produced, fixed, buf.len())
    }

    fn set_context(&self, name: &str, value: u64) {
        let Ok(name) = CString::new(name) else {
            log::warn!("[fastpath] context name {name:?} contains a NUL byte");
            return;
        };
        // SAFETY: `name` is a valid C string for the duration of the call.
        unsafe { (self.set_context)(self.area, name.as_ptr(), value) };
    }

    fn poll_complete(&self) -> usize {
        // SAFETY: `area` came from this helper's `shm_area`.
        let n = unsafe { (self.poll_complete)(self.area) };
        usize::try_from(n).unwrap_or(0)
    }
}

/// Choose the dispatcher for this process.
///
/// Any reason the helper cannot be used is logged once and yields
/// [`Disabled`].
pub fn select(config: &TransportConfig, fd_socket: Option<RawFd>) -> Box<dyn FastDispatcher> {
    let Some(fd_socket) = fd_socket else {
        log::warn!("[fastpath] disabled: no fd-exchange socket");
        return Box::new(Disabled);
    };
    if !config.shm_enabled {
        log::info!("[fastpath] disabled by configuration");
        return Box::new(Disabled);
    }
    match SharedMemory::load(&config.shm_library, fd_socket) {
        Ok(shm) => {
            log::info!("[fastpath] active ({})", config.shm_library.display());
            Box::new(shm)
        }
        Err(reason) => {
            log::warn!("[fastpath] disabled: {reason}");
            Box::new(Disabled)
        }
    }
}
