//! Typed bodies for the requests the transport itself issues, plus the
//! handful of object requests its tests and the diagnostic binary use.
//!
//! Layouts are listed next to each type; every field is native-endian.

use super::opcode::Opcode;
use super::wire::{Handle, Reply, ReplyBody, Request, RequestBody};
use crate::error::RequestError;

// ─── Thread lifecycle ──────────────────────────────────────────────────────

/// `init_thread`: register the calling OS thread.
///
/// Body: `[i32 unix_pid][i32 unix_tid][u64 entry][i32 reply_fd][i32 wait_fd]`.
/// `reply_fd` is `-1` when no reply pipe is handed over with this thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitThread {
    /// OS process id.
    pub unix_pid: i32,
    /// OS thread id.
    pub unix_tid: i32,
    /// Opaque entry-point value, stored by the broker for debuggers.
    pub entry: u64,
    /// Descriptor number of the reply pipe's write end, or `-1`.
    pub reply_fd: i32,
    /// Descriptor number of the wait pipe's write end.
    pub wait_fd: i32,
}

/// Reply to [`InitThread`].
///
/// Body: `[u32 pid][i32 server_pid][u32 version][u32 tid][u32 boot]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitThreadReply {
    /// Broker-assigned process id.
    pub pid: u32,
    /// The broker's own OS process id.
    pub server_pid: i32,
    /// The broker's protocol version.
    pub version: u32,
    /// Broker-assigned thread id.
    pub tid: u32,
    /// Set for the first thread of the first client.
    pub boot: bool,
}

impl RequestBody for InitThread {
    type Reply = InitThreadReply;
    const OPCODE: Opcode = Opcode::InitThread;

    fn encode<'a>(&'a self, request: Request<'a>) -> Result<Request<'a>, RequestError> {
        request.fields(|w| {
            w.i32(self.unix_pid)
                .i32(self.unix_tid)
                .u64(self.entry)
                .i32(self.reply_fd)
                .i32(self.wait_fd);
        })
    }
}

impl ReplyBody for InitThreadReply {
    fn decode(reply: &Reply, _data: &[u8]) -> Self {
        let mut r = reply.fields();
        Self {
            pid: r.u32(),
            server_pid: r.i32(),
            version: r.u32(),
            tid: r.u32(),
            boot: r.u32() != 0,
        }
    }
}

/// `new_thread`: announce a child thread whose channel ends were just handed
/// over on the fd-exchange socket.
///
/// Body: `[i32 request_fd][i32 reply_fd][u32 suspend]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NewThread {
    /// Descriptor number of the child's request pipe read end.
    pub request_fd: i32,
    /// Descriptor number of the child's reply pipe write end.
    pub reply_fd: i32,
    /// Whether the child starts suspended.
    pub suspend: bool,
}

/// Reply to [`NewThread`]: `[u32 handle]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NewThreadReply {
    /// Handle to the new thread object.
    pub handle: Handle,
}

impl RequestBody for NewThread {
    type Reply = NewThreadReply;
    const OPCODE: Opcode = Opcode::NewThread;

    fn encode<'a>(&'a self, request: Request<'a>) -> Result<Request<'a>, RequestError> {
        request.fields(|w| {
            w.i32(self.request_fd).i32(self.reply_fd).u32(u32::from(self.suspend));
        })
    }
}

impl ReplyBody for NewThreadReply {
    fn decode(reply: &Reply, _data: &[u8]) -> Self {
        Self { handle: reply.fields().handle() }
    }
}

/// `boot_done`: sent once by the boot thread.
///
/// Body: `[i32 debug_level][u32 coop_sched]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootDone {
    /// Client debug level, mirrored by the broker's tracing.
    pub debug_level: i32,
    /// Cooperative-scheduler mode flag.
    pub coop_sched: bool,
}

impl RequestBody for BootDone {
    type Reply = ();
    const OPCODE: Opcode = Opcode::BootDone;

    fn encode<'a>(&'a self, request: Request<'a>) -> Result<Request<'a>, RequestError> {
        request.fields(|w| {
            w.i32(self.debug_level).u32(u32::from(self.coop_sched));
        })
    }
}

// ─── Descriptors ───────────────────────────────────────────────────────────

/// `get_handle_fd`: ask for the descriptor behind a handle.
///
/// Body: `[u32 handle][u32 access]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GetHandleFd {
    /// Object handle.
    pub handle: Handle,
    /// Desired access mask.
    pub access: u32,
}

/// Reply to [`GetHandleFd`]: `[i32 fd][i32 kind]`.
///
/// `fd` is the descriptor already cached for this handle in the client, or
/// `-1` when the broker is sending one on the fd-exchange socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GetHandleFdReply {
    /// Cached descriptor number, or `-1`.
    pub fd: i32,
    /// Broker-defined object kind.
    pub kind: i32,
}

impl RequestBody for GetHandleFd {
    type Reply = GetHandleFdReply;
    const OPCODE: Opcode = Opcode::GetHandleFd;

    fn encode<'a>(&'a self, request: Request<'a>) -> Result<Request<'a>, RequestError> {
        request.fields(|w| {
            w.handle(self.handle).u32(self.access);
        })
    }
}

impl ReplyBody for GetHandleFdReply {
    fn decode(reply: &Reply, _data: &[u8]) -> Self {
        let mut r = reply.fields();
        Self { fd: r.i32(), kind: r.i32() }
    }
}

/// `set_handle_cached_fd`: record a freshly received descriptor for a handle.
///
/// Body: `[u32 handle][i32 fd]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetHandleCachedFd {
    /// Object handle.
    pub handle: Handle,
    /// Descriptor number this thread received.
    pub fd: i32,
}

/// Reply to [`SetHandleCachedFd`]: `[i32 cur_fd]`, the descriptor now cached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetHandleCachedFdReply {
    /// Winning descriptor number.
    pub cur_fd: i32,
}

impl RequestBody for SetHandleCachedFd {
    type Reply = SetHandleCachedFdReply;
    const OPCODE: Opcode = Opcode::SetHandleCachedFd;

    fn encode<'a>(&'a self, request: Request<'a>) -> Result<Request<'a>, RequestError> {
        request.fields(|w| {
            w.handle(self.handle).i32(self.fd);
        })
    }
}

impl ReplyBody for SetHandleCachedFdReply {
    fn decode(reply: &Reply, _data: &[u8]) -> Self {
        Self { cur_fd: reply.fields().i32() }
    }
}

// ─── Events ────────────────────────────────────────────────────────────────

/// `open_event`. Body: `[u32 access][u32 attributes][u32 rootdir]`, then the
/// UTF-16 object name as the only data segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenEvent {
    /// Desired access mask.
    pub access: u32,
    /// Object attribute flags.
    pub attributes: u32,
    /// Directory handle the name is relative to.
    pub rootdir: Handle,
    /// Object name as native-endian UTF-16 bytes.
    pub name: Vec<u8>,
}

impl OpenEvent {
    /// Encode `name` as native-endian UTF-16.
    #[must_use]
    pub fn new(access: u32, name: &str) -> Self {
        Self {
            access,
            attributes: 0,
            rootdir: Handle(0),
            name: utf16_bytes(name),
        }
    }
}

/// Reply to [`OpenEvent`]: `[u32 handle]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenEventReply {
    /// Handle to the opened event.
    pub handle: Handle,
}

impl RequestBody for OpenEvent {
    type Reply = OpenEventReply;
    const OPCODE: Opcode = Opcode::OpenEvent;

    fn encode<'a>(&'a self, request: Request<'a>) -> Result<Request<'a>, RequestError> {
        request
            .fields(|w| {
                w.u32(self.access).u32(self.attributes).handle(self.rootdir);
            })?
            .with_data(&self.name)
    }
}

impl ReplyBody for OpenEventReply {
    fn decode(reply: &Reply, _data: &[u8]) -> Self {
        Self { handle: reply.fields().handle() }
    }
}

/// Operation applied by [`EventOp`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum EventOpKind {
    /// Pulse: wake waiters, leave non-signaled.
    Pulse = 0,
    /// Set signaled.
    Set = 1,
    /// Reset to non-signaled.
    Reset = 2,
}

/// `event_op`. Body: `[u32 handle][u32 op]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventOp {
    /// Event handle.
    pub handle: Handle,
    /// Operation.
    pub op: EventOpKind,
}

impl RequestBody for EventOp {
    type Reply = ();
    const OPCODE: Opcode = Opcode::EventOp;

    fn encode<'a>(&'a self, request: Request<'a>) -> Result<Request<'a>, RequestError> {
        request.fields(|w| {
            w.handle(self.handle).u32(self.op as u32);
        })
    }
}

/// `query_event`. Body: `[u32 handle]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryEvent {
    /// Event handle.
    pub handle: Handle,
}

/// Reply to [`QueryEvent`]: `[u32 manual_reset][u32 state]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryEventReply {
    /// Manual-reset event.
    pub manual_reset: bool,
    /// Currently signaled.
    pub signaled: bool,
}

impl RequestBody for QueryEvent {
    type Reply = QueryEventReply;
    const OPCODE: Opcode = Opcode::QueryEvent;

    fn encode<'a>(&'a self, request: Request<'a>) -> Result<Request<'a>, RequestError> {
        request.fields(|w| {
            w.handle(self.handle);
        })
    }
}

impl ReplyBody for QueryEventReply {
    fn decode(reply: &Reply, _data: &[u8]) -> Self {
        let mut r = reply.fields();
        Self { manual_reset: r.u32() != 0, signaled: r.u32() != 0 }
    }
}

// ─── Registry ──────────────────────────────────────────────────────────────

/// `get_key_value`. Body: `[u32 hkey]`, data: UTF-16 value name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetKeyValue {
    /// Key handle.
    pub hkey: Handle,
    /// Value name as native-endian UTF-16 bytes.
    pub name: Vec<u8>,
}

/// Reply to [`GetKeyValue`]: `[u32 type][u32 total]` + value data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetKeyValueReply {
    /// Registry value type.
    pub value_type: u32,
    /// Full size of the value, which may exceed the data returned.
    pub total: u32,
    /// Value bytes returned.
    pub data: Vec<u8>,
}

impl RequestBody for GetKeyValue {
    type Reply = GetKeyValueReply;
    const OPCODE: Opcode = Opcode::GetKeyValue;

    fn encode<'a>(&'a self, request: Request<'a>) -> Result<Request<'a>, RequestError> {
        request
            .fields(|w| {
                w.handle(self.hkey);
            })?
            .with_data(&self.name)
    }
}

impl ReplyBody for GetKeyValueReply {
    fn decode(reply: &Reply, data: &[u8]) -> Self {
        let mut r = reply.fields();
        Self { value_type: r.u32(), total: r.u32(), data: data.to_vec() }
    }
}

/// `set_key_value`. Body: `[u32 hkey][u32 type][u32 namelen]`, data: name
/// then value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetKeyValue {
    /// Key handle.
    pub hkey: Handle,
    /// Registry value type.
    pub value_type: u32,
    /// Value name as native-endian UTF-16 bytes.
    pub name: Vec<u8>,
    /// Value bytes.
    pub data: Vec<u8>,
}

impl RequestBody for SetKeyValue {
    type Reply = ();
    const OPCODE: Opcode = Opcode::SetKeyValue;

    fn encode<'a>(&'a self, request: Request<'a>) -> Result<Request<'a>, RequestError> {
        request
            .fields(|w| {
                w.handle(self.hkey).u32(self.value_type).u32(self.name.len() as u32);
            })?
            .with_data(&self.name)?
            .with_data(&self.data)
    }
}

/// Native-endian UTF-16 encoding of `s`, as object names travel on the wire.
#[must_use]
pub fn utf16_bytes(s: &str) -> Vec<u8> {
    s.encode_utf16().flat_map(u16::to_ne_bytes).collect()
}
