//! An in-process broker for unit tests.
//!
//! Speaks the broker side of the handshake and serves a handful of opcodes
//! from a [`BrokerState`]. The same state machine backs
//! [`SharedStateDispatcher`], so fast-path and socket replies can be
//! compared byte for byte.

use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Write};
use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crate::config::TransportConfig;
use crate::constants::{REQUEST_FIXED_SIZE, REQUEST_HEADER_SIZE, SERVER_PROTOCOL_VERSION};
use crate::error::{Status, TransportError};
use crate::fastpath::{finish_reply, Disabled, FastDispatcher};
use crate::fd::{pipe_cloexec, recv_with_fds, send_with_fd};
use crate::protocol::{FieldReader, Opcode, Reply, Request, RequestHeader};
use crate::transport::Transport;

/// Not implemented by the test broker.
const NOT_IMPLEMENTED: Status = Status(0xC000_0002);

// ─── Shared state machine ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct EventState {
    manual_reset: bool,
    signaled: bool,
}

/// Objects the test broker knows about.
#[derive(Debug, Clone, Default)]
pub(crate) struct BrokerState {
    names: HashMap<Vec<u8>, u32>,
    events: HashMap<u32, EventState>,
    keys: HashMap<u32, HashMap<Vec<u8>, (u32, Vec<u8>)>>,
}

/// Event "Ready" as handle 0x10 (manual reset, not signaled) and an empty
/// registry key as handle 0x20.
pub(crate) fn seeded_state() -> BrokerState {
    let mut state = BrokerState::default();
    state.names.insert(crate::protocol::requests::utf16_bytes("Ready"), 0x10);
    state.events.insert(0x10, EventState { manual_reset: true, signaled: false });
    state.keys.insert(0x20, HashMap::new());
    state
}

impl BrokerState {
    /// Serve one request; returns status, fixed reply body and reply data.
    pub(crate) fn handle(&mut self, op: Opcode, body: &[u8], data: &[u8]) -> (Status, Vec<u8>, Vec<u8>) {
        let mut r = FieldReader::new(body);
        match op {
            Opcode::OpenEvent => match self.names.get(data) {
                Some(handle) => (Status::SUCCESS, handle.to_ne_bytes().to_vec(), Vec::new()),
                None => (Status::OBJECT_NAME_NOT_FOUND, Vec::new(), Vec::new()),
            },
            Opcode::EventOp => {
                let handle = r.u32();
                let op = r.u32();
                let Some(event) = self.events.get_mut(&handle) else {
                    return (Status::INVALID_HANDLE, Vec::new(), Vec::new());
                };
                event.signaled = op == 1;
                (Status::SUCCESS, Vec::new(), Vec::new())
            }
            Opcode::QueryEvent => match self.events.get(&r.u32()) {
                Some(event) => {
                    let mut out = u32::from(event.manual_reset).to_ne_bytes().to_vec();
                    out.extend_from_slice(&u32::from(event.signaled).to_ne_bytes());
                    (Status::SUCCESS, out, Vec::new())
                }
                None => (Status::INVALID_HANDLE, Vec::new(), Vec::new()),
            },
            Opcode::SetKeyValue => {
                let hkey = r.u32();
                let value_type = r.u32();
                let namelen = r.u32() as usize;
                let Some(key) = self.keys.get_mut(&hkey) else {
                    return (Status::INVALID_HANDLE, Vec::new(), Vec::new());
                };
                let (name, value) = data.split_at(namelen.min(data.len()));
                key.insert(name.to_vec(), (value_type, value.to_vec()));
                (Status::SUCCESS, Vec::new(), Vec::new())
            }
            Opcode::GetKeyValue => {
                let Some(key) = self.keys.get(&r.u32()) else {
                    return (Status::INVALID_HANDLE, Vec::new(), Vec::new());
                };
                match key.get(data) {
                    Some((value_type, value)) => {
                        let mut out = value_type.to_ne_bytes().to_vec();
                        out.extend_from_slice(&(value.len() as u32).to_ne_bytes());
                        (Status::SUCCESS, out, value.clone())
                    }
                    None => (Status::OBJECT_NAME_NOT_FOUND, Vec::new(), Vec::new()),
                }
            }
            Opcode::CloseHandle => (Status::SUCCESS, Vec::new(), Vec::new()),
            _ => (NOT_IMPLEMENTED, Vec::new(), Vec::new()),
        }
    }
}

// ─── Fast-path double ──────────────────────────────────────────────────────

/// A fast dispatcher answering from a shared [`BrokerState`].
#[derive(Debug, Clone)]
pub(crate) struct SharedStateDispatcher {
    state: Arc<Mutex<BrokerState>>,
    dispatched: Arc<AtomicUsize>,
}

impl SharedStateDispatcher {
    pub(crate) fn new(state: BrokerState) -> Self {
        Self { state: Arc::new(Mutex::new(state)), dispatched: Arc::new(AtomicUsize::new(0)) }
    }

    pub(crate) fn dispatched(&self) -> usize {
        self.dispatched.load(Ordering::SeqCst)
    }
}

impl FastDispatcher for SharedStateDispatcher {
    fn is_active(&self) -> bool {
        true
    }

    fn dispatch(&self, request: &Request<'_>, buf: &mut [u8]) -> Result<Reply, TransportError> {
        self.dispatched.fetch_add(1, Ordering::SeqCst);
        let fixed = request.fixed_bytes();
        let data = request.segments().concat();
        let (status, body, out) =
            self.state.lock().expect("state lock").handle(request.opcode(), &fixed[REQUEST_HEADER_SIZE..], &data);
        let n = out.len().min(buf.len());
        buf[..n].copy_from_slice(&out[..n]);
        finish_reply(out.len() as isize, Reply::build(status, out.len() as u32, &body), buf.len())
    }

    fn set_context(&self, _name: &str, _value: u64) {}

    fn poll_complete(&self) -> usize {
        0
    }
}

// ─── Broker thread ─────────────────────────────────────────────────────────

/// Knobs for the fake broker.
#[derive(Debug, Clone)]
pub(crate) struct BrokerOptions {
    /// Tid assigned to the first registered thread.
    pub tid: u32,
    /// Version reported to the main thread.
    pub version: u32,
    /// Version reported to child threads, if different.
    pub child_version: Option<u32>,
    /// Mark the main thread as the boot thread.
    pub boot: bool,
    /// Answer the first `init_thread` with an invalid-handle status.
    pub fail_first_init: bool,
    /// Pre-cached descriptors, as (handle, fd).
    pub cached: Vec<(u32, RawFd)>,
    /// Never send descriptors for `get_handle_fd`.
    pub drop_fds: bool,
    /// Post one wake-up record right after main registration.
    pub wakeup: Option<(u64, i32)>,
    /// Queue one descriptor for this handle ahead of the first fresh
    /// `get_handle_fd` descriptor.
    pub stray_fd: Option<u32>,
}

impl Default for BrokerOptions {
    fn default() -> Self {
        Self {
            tid: 0x24,
            version: SERVER_PROTOCOL_VERSION,
            child_version: None,
            boot: false,
            fail_first_init: false,
            cached: Vec::new(),
            drop_fds: false,
            wakeup: None,
            stray_fd: None,
        }
    }
}

/// What the broker observed.
#[derive(Debug, Default)]
pub(crate) struct BrokerLog {
    pub reply_fds_received: usize,
    pub wait_fds_received: usize,
    pub init_requests: usize,
    pub boot_done: bool,
    /// Requests answered from the state machine.
    pub served: usize,
}

/// A broker thread plus the client transport connected to it.
#[derive(Debug)]
pub(crate) struct FakeBroker {
    transport: Arc<Transport>,
    thread: JoinHandle<BrokerLog>,
}

impl FakeBroker {
    pub(crate) fn start(opts: BrokerOptions) -> Self {
        Self::start_with_fast(opts, Box::new(Disabled))
    }

    pub(crate) fn start_with_fast(opts: BrokerOptions, fast: Box<dyn FastDispatcher>) -> Self {
        let (client_cmd, broker_cmd) = UnixStream::pair().expect("command socketpair");
        let (client_fd, broker_fd) = UnixStream::pair().expect("fd socketpair");
        let transport =
            Arc::new(Transport::from_parts(client_cmd, client_fd, TransportConfig::default(), fast));
        let thread = std::thread::spawn(move || {
            let _command = broker_cmd;
            Session::new(broker_fd, opts).run()
        });
        Self { transport, thread }
    }

    pub(crate) fn transport(&self) -> Arc<Transport> {
        Arc::clone(&self.transport)
    }

    /// Wait for the broker to see every channel close and return its log.
    pub(crate) fn finish(self) -> BrokerLog {
        drop(self.transport);
        self.thread.join().expect("broker thread panicked")
    }
}

struct Channel {
    request: File,
    reply: File,
    wait: Option<File>,
}

struct Session {
    sock: UnixStream,
    opts: BrokerOptions,
    state: BrokerState,
    cache: HashMap<u32, RawFd>,
    // Descriptors sent to the client stay alive on our side too.
    _sent: Vec<OwnedFd>,
    next_tid: u32,
    log: BrokerLog,
}

impl Session {
    fn new(sock: UnixStream, opts: BrokerOptions) -> Self {
        let cache = opts.cached.iter().copied().collect();
        let next_tid = opts.tid;
        Self {
            sock,
            opts,
            state: seeded_state(),
            cache,
            _sent: Vec::new(),
            next_tid,
            log: BrokerLog::default(),
        }
    }

    fn run(mut self) -> BrokerLog {
        let (request_read, request_write) = pipe_cloexec().expect("request pipe");
        send_with_fd(self.sock.as_raw_fd(), &0u32.to_ne_bytes(), request_write.as_raw_fd())
            .expect("send request fd");
        drop(request_write);

        let Some(reply_write) = self.recv_fd() else { return self.log };
        self.log.reply_fds_received += 1;
        let mut main = Channel { request: File::from(request_read), reply: File::from(reply_write), wait: None };

        let version = self.opts.version;
        if self.register(&mut main, version, true) {
            if let (Some((cookie, signaled)), Some(wait)) = (self.opts.wakeup, main.wait.as_mut()) {
                let mut record = [0u8; 16];
                record[..8].copy_from_slice(&cookie.to_ne_bytes());
                record[8..12].copy_from_slice(&signaled.to_ne_bytes());
                wait.write_all(&record).expect("post wakeup");
            }
        }
        self.serve(&mut main);
        self.log
    }

    /// Broker side of `init_thread`. Returns whether the thread registered.
    fn register(&mut self, ch: &mut Channel, version: u32, is_main: bool) -> bool {
        loop {
            let Some(wait) = self.recv_fd() else { return false };
            self.log.wait_fds_received += 1;
            ch.wait = Some(File::from(wait));

            let Some((header, _body, _data)) = read_request(&mut ch.request) else { return false };
            assert_eq!(header.opcode, Opcode::InitThread.raw(), "expected init_thread");
            self.log.init_requests += 1;

            if self.opts.fail_first_init && self.log.init_requests == 1 {
                write_reply(&mut ch.reply, Status::INVALID_HANDLE, &[], &[]);
                continue;
            }

            let tid = self.next_tid;
            self.next_tid += 4;
            let boot = is_main && self.opts.boot;
            let mut body = Vec::new();
            body.extend_from_slice(&0x20u32.to_ne_bytes());
            body.extend_from_slice(&4242i32.to_ne_bytes());
            body.extend_from_slice(&version.to_ne_bytes());
            body.extend_from_slice(&tid.to_ne_bytes());
            body.extend_from_slice(&u32::from(boot).to_ne_bytes());
            write_reply(&mut ch.reply, Status::SUCCESS, &body, &[]);

            if boot && version == SERVER_PROTOCOL_VERSION {
                let Some((header, _, _)) = read_request(&mut ch.request) else { return false };
                assert_eq!(header.opcode, Opcode::BootDone.raw(), "expected boot_done");
                self.log.boot_done = true;
                write_reply(&mut ch.reply, Status::SUCCESS, &[], &[]);
            }
            return true;
        }
    }

    fn serve(&mut self, ch: &mut Channel) {
        while let Some((header, body, data)) = read_request(&mut ch.request) {
            let op = Opcode::from_raw(header.opcode).expect("known opcode");
            let mut r = FieldReader::new(&body);
            match op {
                Opcode::NewThread => {
                    let Some(child_request) = self.recv_fd() else { return };
                    let Some(child_reply) = self.recv_fd() else { return };
                    let handle = 0x100 + self.next_tid;
                    write_reply(&mut ch.reply, Status::SUCCESS, &handle.to_ne_bytes(), &[]);

                    let mut child = Channel {
                        request: File::from(child_request),
                        reply: File::from(child_reply),
                        wait: None,
                    };
                    let version = self.opts.child_version.unwrap_or(self.opts.version);
                    self.register(&mut child, version, false);
                    self.serve(&mut child);
                }
                Opcode::GetHandleFd => {
                    let handle = r.u32();
                    let mut out = Vec::new();
                    if let Some(fd) = self.cache.get(&handle) {
                        out.extend_from_slice(&fd.to_ne_bytes());
                    } else {
                        if let Some(stray) = self.opts.stray_fd.take() {
                            self.send_object_fd(stray);
                        }
                        if !self.opts.drop_fds {
                            self.send_object_fd(handle);
                        }
                        out.extend_from_slice(&(-1i32).to_ne_bytes());
                    }
                    out.extend_from_slice(&1i32.to_ne_bytes());
                    write_reply(&mut ch.reply, Status::SUCCESS, &out, &[]);
                }
                Opcode::SetHandleCachedFd => {
                    let handle = r.u32();
                    let fd = r.i32();
                    let cur = *self.cache.entry(handle).or_insert(fd);
                    write_reply(&mut ch.reply, Status::SUCCESS, &cur.to_ne_bytes(), &[]);
                }
                _ => {
                    self.log.served += 1;
                    let (status, out, reply_data) = self.state.handle(op, &body, &data);
                    write_reply(&mut ch.reply, status, &out, &reply_data);
                }
            }
        }
    }

    /// Send a fresh pipe's read end tagged with `handle`.
    fn send_object_fd(&mut self, handle: u32) {
        let (read, write) = pipe_cloexec().expect("object pipe");
        send_with_fd(self.sock.as_raw_fd(), &handle.to_ne_bytes(), read.as_raw_fd())
            .expect("send object fd");
        self._sent.push(read);
        self._sent.push(write);
    }

    /// One `{tid, fd}` message with its descriptor, or `None` once the
    /// client has gone.
    fn recv_fd(&self) -> Option<OwnedFd> {
        let mut buf = [0u8; 8];
        let (n, mut fds) = recv_with_fds(self.sock.as_raw_fd(), &mut buf).expect("recvmsg");
        if n == 0 {
            return None;
        }
        assert_eq!(n, buf.len(), "fd message size");
        fds.pop()
    }
}

/// Read one request: header, fixed body, variable data.
fn read_request(pipe: &mut File) -> Option<(RequestHeader, Vec<u8>, Vec<u8>)> {
    let mut fixed = [0u8; REQUEST_FIXED_SIZE];
    pipe.read_exact(&mut fixed).ok()?;
    let header = RequestHeader::parse(&fixed);
    let mut data = vec![0u8; header.request_size as usize];
    pipe.read_exact(&mut data).ok()?;
    Some((header, fixed[REQUEST_HEADER_SIZE..].to_vec(), data))
}

fn write_reply(pipe: &mut File, status: Status, body: &[u8], data: &[u8]) {
    let mut frame = Reply::build(status, data.len() as u32, body).to_vec();
    frame.extend_from_slice(data);
    pipe.write_all(&frame).expect("write reply");
}
