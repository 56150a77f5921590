//! Per-thread channel and registration handshake.
//!
//! # Main thread
//!
//! ```text
//! fd-socket ──► request fd (write end of the broker's request pipe)
//! reply pipe ──send_fd(write end)──► broker          (exactly once per process)
//! wait pipe  ──send_fd(write end)──► broker
//! init_thread { pid, tid, entry, reply_fd, wait_fd } ──► { pid, server_pid, version, tid, boot }
//! boot thread only: boot_done { debug_level, coop_sched }
//! ```
//!
//! # Child threads
//!
//! The parent builds both pipes, hands the broker its ends and announces the
//! thread with `new_thread`. The resulting [`ChildChannel`] moves to the new
//! OS thread, which registers with [`ThreadContext::init_child`] and skips
//! the reply-pipe handoff.
//!
//! A thread context is `!Sync`; every call takes `&mut self`, so a channel
//! never has two requests in flight.

use std::cell::Cell;
use std::marker::PhantomData;
use std::os::unix::io::{AsRawFd, IntoRawFd, OwnedFd, RawFd};
use std::sync::Arc;

use crate::call;
use crate::constants::{FD_RECEIVE_RETRIES, SCRATCH_CAPACITY, SERVER_PROTOCOL_VERSION};
use crate::error::{FdError, HandleFdError, Status, TransportError};
use crate::fastpath;
use crate::fatal::{self, Scope};
use crate::fd::{pipe_cloexec, ReceivedFd};
use crate::protocol::requests::{
    BootDone, GetHandleFd, InitThread, InitThreadReply, NewThread, SetHandleCachedFd,
};
use crate::protocol::{Handle, Reply, ReplyBody, Request, RequestBody};
use crate::transport::Transport;

/// Size of a wake-up record on the wait fd.
const WAKEUP_RECORD_SIZE: usize = 16;

/// The client ends of a child thread's channel, created by its parent.
#[derive(Debug)]
pub struct ChildChannel {
    /// Broker handle of the new thread.
    pub handle: Handle,
    request: OwnedFd,
    reply: OwnedFd,
}

/// One wake-up delivered on the wait fd.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Wakeup {
    /// Cookie of the wait being completed.
    pub cookie: u64,
    /// Wait result.
    pub signaled: i32,
}

/// A descriptor obtained for a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandleFd {
    /// Descriptor number; owned by the process-wide cache.
    pub fd: RawFd,
    /// Object kind reported by the broker.
    pub kind: i32,
}

/// A registered thread's private broker channel.
#[derive(Debug)]
pub struct ThreadContext {
    transport: Arc<Transport>,
    tid: u32,
    pid: u32,
    server_pid: i32,
    request: OwnedFd,
    reply: OwnedFd,
    wait: OwnedFd,
    scratch: Vec<u8>,
    is_main: bool,
    is_boot: bool,
    _not_sync: PhantomData<Cell<()>>,
}

impl ThreadContext {
    /// Set up the main thread's channel and register it.
    ///
    /// Any failure ends the process.
    pub fn init_main(transport: Arc<Transport>) -> Self {
        match Self::try_init_main(transport) {
            Ok(ctx) => ctx,
            Err(e) => fatal::terminate(Scope::Process, e),
        }
    }

    pub(crate) fn try_init_main(transport: Arc<Transport>) -> Result<Self, TransportError> {
        let request = receive_initial_fd(&transport)?;
        let (reply_read, reply_write) =
            pipe_cloexec().map_err(|e| TransportError::Io { op: "pipe", source: e })?;
        transport.send_fd(0, reply_write.as_raw_fd())?;
        log::debug!("[thread] reply pipe handed to broker");

        let ctx = Self::register(transport, request, reply_read, Some(&reply_write), 0, true)?;
        // The broker holds its own copy now.
        drop(reply_write);
        Ok(ctx)
    }

    /// Register a thread on the channel its parent prepared.
    ///
    /// A transport failure unwinds this thread with a
    /// [`TransportFault`](crate::fatal::TransportFault) payload.
    pub fn init_child(transport: Arc<Transport>, channel: ChildChannel, entry: u64) -> Self {
        match Self::register(transport, channel.request, channel.reply, None, entry, false) {
            Ok(ctx) => ctx,
            Err(e) => fatal::terminate(Scope::Thread, e),
        }
    }

    fn register(
        transport: Arc<Transport>,
        request: OwnedFd,
        reply: OwnedFd,
        reply_write: Option<&OwnedFd>,
        entry: u64,
        is_main: bool,
    ) -> Result<Self, TransportError> {
        let (wait, wait_write) = new_wait_pipe(&transport)?;
        let mut ctx = Self {
            transport,
            tid: 0,
            pid: 0,
            server_pid: 0,
            request,
            reply,
            wait,
            scratch: vec![0; SCRATCH_CAPACITY],
            is_main,
            is_boot: false,
            _not_sync: PhantomData,
        };

        let mut body = InitThread {
            unix_pid: std::process::id() as i32,
            unix_tid: unix_tid(),
            entry,
            reply_fd: reply_write.map_or(-1, AsRawFd::as_raw_fd),
            wait_fd: wait_write.as_raw_fd(),
        };
        let mut wait_write = wait_write;

        let mut reply = ctx.try_request(&body)?;
        if reply.as_ref().err() == Some(&Status::INVALID_HANDLE) {
            log::warn!("[thread] init_thread: invalid handle, retrying with a fresh wait pipe");
            let (wait, fresh_write) = new_wait_pipe(&ctx.transport)?;
            ctx.wait = wait;
            wait_write = fresh_write;
            body.wait_fd = wait_write.as_raw_fd();
            reply = ctx.try_request(&body)?;
        }
        drop(wait_write);

        let info: InitThreadReply = reply.map_err(|status| {
            TransportError::Protocol(format!("init_thread refused: {status}"))
        })?;
        if info.version != SERVER_PROTOCOL_VERSION {
            return Err(TransportError::VersionMismatch {
                client: SERVER_PROTOCOL_VERSION,
                server: info.version,
            });
        }

        ctx.tid = info.tid;
        ctx.pid = info.pid;
        ctx.server_pid = info.server_pid;
        ctx.is_boot = info.boot;
        log::info!(
            "[thread] registered tid {:04x} pid {:04x} (broker pid {}){}",
            ctx.tid,
            ctx.pid,
            ctx.server_pid,
            if ctx.is_boot { ", boot thread" } else { "" }
        );

        let fast = ctx.transport.fast();
        if fast.is_active() {
            fast.set_context("tid", u64::from(ctx.tid));
        }

        if ctx.is_boot {
            let done = BootDone {
                debug_level: fastpath::debug_level(),
                coop_sched: ctx.transport.config().coop_sched,
            };
            if let Err(status) = ctx.try_request(&done)? {
                log::warn!("[thread] boot_done refused: {status}");
            }
        }
        Ok(ctx)
    }

    // ─── Calls ─────────────────────────────────────────────────────────────

    /// One round trip. Variable reply data lands in `buf`.
    ///
    /// Returns the reply when the broker reports success, otherwise its
    /// status. Transport failures never return.
    pub fn call(&mut self, request: &Request<'_>, buf: &mut [u8]) -> Result<Reply, Status> {
        match self.transact(request, buf) {
            Ok(reply) if reply.status().is_success() => Ok(reply),
            Ok(reply) => Err(reply.status()),
            Err(e) => fatal::terminate(self.fault_scope(), e),
        }
    }

    /// Encode `body`, call, and decode the typed reply.
    ///
    /// A body that cannot be encoded is answered locally with
    /// [`Status::INVALID_PARAMETER`].
    pub fn request<B: RequestBody>(&mut self, body: &B) -> Result<B::Reply, Status> {
        match self.try_request(body) {
            Ok(result) => result,
            Err(e) => fatal::terminate(self.fault_scope(), e),
        }
    }

    fn try_request<B: RequestBody>(
        &mut self,
        body: &B,
    ) -> Result<Result<B::Reply, Status>, TransportError> {
        let request = match body.encode(Request::new(B::OPCODE)) {
            Ok(request) => request,
            Err(e) => {
                log::warn!("[thread] cannot encode {}: {e}", B::OPCODE);
                return Ok(Err(Status::INVALID_PARAMETER));
            }
        };
        let mut scratch = std::mem::take(&mut self.scratch);
        let outcome = self.transact(&request, &mut scratch);
        let decoded = outcome.map(|reply| {
            if reply.status().is_success() {
                Ok(B::Reply::decode(&reply, &scratch[..reply.data_len()]))
            } else {
                Err(reply.status())
            }
        });
        self.scratch = scratch;
        decoded
    }

    fn transact(&self, request: &Request<'_>, buf: &mut [u8]) -> Result<Reply, TransportError> {
        let fast = self.transport.fast();
        if fast.is_active() {
            if request.opcode().fast_path_eligible() {
                let _mask = self
                    .transport
                    .signals()
                    .block()
                    .map_err(|e| TransportError::Io { op: "pthread_sigmask", source: e })?;
                return fast.dispatch(request, buf);
            }
            let reaped = fast.poll_complete();
            if reaped > 0 {
                log::trace!("[thread] {reaped} fast-path completions before {}", request.opcode());
            }
        }
        call::round_trip(
            self.request.as_raw_fd(),
            self.reply.as_raw_fd(),
            self.transport.signals(),
            request,
            buf,
        )
    }

    fn fault_scope(&self) -> Scope {
        if self.is_main || self.is_boot {
            Scope::Process
        } else {
            Scope::Thread
        }
    }

    // ─── Child threads ─────────────────────────────────────────────────────

    /// Create the channel for a new thread and announce it to the broker.
    ///
    /// Move the result to the new OS thread and pass it to
    /// [`Self::init_child`].
    pub fn spawn_child_channel(&mut self, suspend: bool) -> Result<ChildChannel, Status> {
        match self.try_spawn_child_channel(suspend) {
            Ok(result) => result,
            Err(e) => fatal::terminate(self.fault_scope(), e),
        }
    }

    fn try_spawn_child_channel(
        &mut self,
        suspend: bool,
    ) -> Result<Result<ChildChannel, Status>, TransportError> {
        let io = |e| TransportError::Io { op: "pipe", source: e };
        let (request_read, request_write) = pipe_cloexec().map_err(io)?;
        let (reply_read, reply_write) = pipe_cloexec().map_err(io)?;
        self.transport.send_fd(self.tid, request_read.as_raw_fd())?;
        self.transport.send_fd(self.tid, reply_write.as_raw_fd())?;

        let body = NewThread {
            request_fd: request_read.as_raw_fd(),
            reply_fd: reply_write.as_raw_fd(),
            suspend,
        };
        let reply = self.try_request(&body)?;
        // Broker ends are the broker's now; ours close here.
        drop(request_read);
        drop(reply_write);
        Ok(reply.map(|r| {
            log::debug!("[thread] new thread handle {}", r.handle);
            ChildChannel { handle: r.handle, request: request_write, reply: reply_read }
        }))
    }

    // ─── Descriptors ───────────────────────────────────────────────────────

    /// Descriptor behind `handle`, fetching and caching it if needed.
    ///
    /// The whole exchange runs under the transport's descriptor-lookup lock.
    pub fn get_handle_fd(&mut self, handle: Handle, access: u32) -> Result<HandleFd, HandleFdError> {
        let transport = Arc::clone(&self.transport);
        let mut parked = transport.lock_fd_exchange();
        let info = self.request(&GetHandleFd { handle, access })?;
        if info.fd >= 0 {
            return Ok(HandleFd { fd: info.fd, kind: info.kind });
        }

        let mut attempts = 0;
        let received = loop {
            match transport.receive_fd_for(&mut parked, handle) {
                Ok(received) => break received,
                Err(FdError::DescriptorLost) => {
                    attempts += 1;
                    log::warn!("[thread] descriptor for {handle} lost ({attempts}/{FD_RECEIVE_RETRIES})");
                    if attempts >= FD_RECEIVE_RETRIES {
                        return Err(HandleFdError::DescriptorLost);
                    }
                }
                Err(FdError::Transport(e)) => fatal::terminate(self.fault_scope(), e),
            }
        };
        let fd = self.register_received_fd(received)?;
        Ok(HandleFd { fd, kind: info.kind })
    }

    /// Record a received descriptor in the broker's cache.
    ///
    /// If another thread cached a descriptor for the same handle first, ours
    /// is closed and the winner's number returned.
    pub fn register_received_fd(&mut self, received: ReceivedFd) -> Result<RawFd, Status> {
        let ReceivedFd { handle, fd } = received;
        let ours = fd.as_raw_fd();
        let reply = self.request(&SetHandleCachedFd { handle, fd: ours })?;
        if reply.cur_fd == ours {
            Ok(fd.into_raw_fd())
        } else {
            log::debug!(
                "[thread] handle {handle} already cached as fd {}, closing fd {ours}",
                reply.cur_fd
            );
            drop(fd);
            Ok(reply.cur_fd)
        }
    }

    /// Block until the broker posts a wake-up on this thread's wait fd.
    pub fn read_wakeup(&mut self) -> Wakeup {
        let mut record = [0u8; WAKEUP_RECORD_SIZE];
        if let Err(e) = call::read_exact(self.wait.as_raw_fd(), &mut record) {
            fatal::terminate(self.fault_scope(), e);
        }
        let cookie = u64::from_ne_bytes([
            record[0], record[1], record[2], record[3], record[4], record[5], record[6], record[7],
        ]);
        let signaled = i32::from_ne_bytes([record[8], record[9], record[10], record[11]]);
        Wakeup { cookie, signaled }
    }

    // ─── Accessors ─────────────────────────────────────────────────────────

    /// Broker-assigned thread id.
    #[must_use]
    pub fn tid(&self) -> u32 {
        self.tid
    }

    /// Broker-assigned process id.
    #[must_use]
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// The broker's own OS process id.
    #[must_use]
    pub fn server_pid(&self) -> i32 {
        self.server_pid
    }

    /// Whether this is the process's first thread.
    #[must_use]
    pub fn is_main(&self) -> bool {
        self.is_main
    }

    /// Whether this thread performs the broker's one-time initialisation.
    #[must_use]
    pub fn is_boot(&self) -> bool {
        self.is_boot
    }

    /// The shared transport.
    #[must_use]
    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }
}

/// Receive the main thread's request descriptor, retrying lost ones.
fn receive_initial_fd(transport: &Transport) -> Result<OwnedFd, TransportError> {
    let mut attempts = 0;
    loop {
        match transport.receive_fd() {
            Ok(received) => return Ok(received.fd),
            Err(FdError::DescriptorLost) => {
                attempts += 1;
                log::warn!("[thread] request descriptor lost ({attempts}/{FD_RECEIVE_RETRIES})");
                if attempts >= FD_RECEIVE_RETRIES {
                    return Err(TransportError::Protocol(
                        "broker never delivered the request descriptor".into(),
                    ));
                }
            }
            Err(FdError::Transport(e)) => return Err(e),
        }
    }
}

/// Create a wait pipe and hand its write end to the broker.
fn new_wait_pipe(transport: &Transport) -> Result<(OwnedFd, OwnedFd), TransportError> {
    let (read, write) = pipe_cloexec().map_err(|e| TransportError::Io { op: "pipe", source: e })?;
    transport.send_fd(0, write.as_raw_fd())?;
    Ok((read, write))
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn unix_tid() -> i32 {
    // SAFETY: gettid takes no arguments and cannot fail.
    unsafe { libc::syscall(libc::SYS_gettid) as i32 }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn unix_tid() -> i32 {
    std::process::id() as i32
}
