//! End-to-end tests: bootstrap against a scripted broker, register the main
//! thread, then issue object requests through the public API.

use std::fs::File;
use std::io::{Read, Write};
use std::os::unix::io::{AsRawFd, OwnedFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;

use srvlink::bootstrap::{self, BrokerLauncher};
use srvlink::constants::{
    COMMAND_SOCKET_NAME, FD_SOCKET_NAME, REQUEST_FIXED_SIZE, SERVER_PROTOCOL_VERSION,
};
use srvlink::fd::{pipe_cloexec, recv_with_fds, send_with_fd};
use srvlink::protocol::requests::{utf16_bytes, OpenEvent};
use srvlink::protocol::RequestHeader;
use srvlink::{BootstrapError, Handle, Opcode, Reply, Status, ThreadContext, Transport, TransportConfig};
use tempfile::TempDir;

const BROKER_PID: u32 = 0x20;
const MAIN_TID: u32 = 0x24;
const EVENT_HANDLE: u32 = 0x0000_abcd;

/// What the broker saw for one object request.
#[derive(Debug)]
struct Observed {
    opcode: u32,
    request_size: u32,
    data: Vec<u8>,
}

/// Binds both sockets on launch and runs a one-client broker thread.
#[derive(Debug, Default)]
struct ScriptedLauncher {
    launches: usize,
    dir: PathBuf,
    broker: Option<JoinHandle<()>>,
    observed: Option<mpsc::Receiver<Observed>>,
}

impl BrokerLauncher for ScriptedLauncher {
    fn launch(&mut self, _config: &TransportConfig) -> Result<(), BootstrapError> {
        self.launches += 1;
        let command = UnixListener::bind(self.dir.join(COMMAND_SOCKET_NAME)).expect("bind socket");
        let fd = UnixListener::bind(self.dir.join(FD_SOCKET_NAME)).expect("bind fd-socket");
        let (tx, rx) = mpsc::channel();
        self.observed = Some(rx);
        self.broker = Some(std::thread::spawn(move || run_broker(&command, &fd, &tx)));
        Ok(())
    }

    fn exited(&mut self) -> Option<ExitStatus> {
        None
    }
}

fn run_broker(command: &UnixListener, fd: &UnixListener, tx: &mpsc::Sender<Observed>) {
    let (_command, _) = command.accept().expect("accept command");
    let (sock, _) = fd.accept().expect("accept fd-socket");

    let (request_read, request_write) = pipe_cloexec().expect("pipe");
    send_with_fd(sock.as_raw_fd(), &0u32.to_ne_bytes(), request_write.as_raw_fd()).expect("send");
    drop(request_write);

    let reply_write = recv_fd(&sock).expect("reply pipe");
    let _wait = recv_fd(&sock).expect("wait pipe");
    let mut requests = File::from(request_read);
    let mut replies = File::from(reply_write);

    let (header, _) = read_request(&mut requests).expect("init_thread");
    assert_eq!(header.opcode, Opcode::InitThread.raw());
    let mut body = Vec::new();
    for v in [BROKER_PID, 777, SERVER_PROTOCOL_VERSION, MAIN_TID, 0] {
        body.extend_from_slice(&v.to_ne_bytes());
    }
    replies.write_all(&Reply::build(Status::SUCCESS, 0, &body)).expect("init reply");

    while let Some((header, data)) = read_request(&mut requests) {
        tx.send(Observed { opcode: header.opcode, request_size: header.request_size, data: data.clone() })
            .expect("report");
        let frame = if data == utf16_bytes("Event") {
            Reply::build(Status::SUCCESS, 0, &EVENT_HANDLE.to_ne_bytes())
        } else {
            Reply::build(Status::OBJECT_NAME_NOT_FOUND, 0, &[])
        };
        replies.write_all(&frame).expect("reply");
    }
}

fn recv_fd(sock: &UnixStream) -> Option<OwnedFd> {
    let mut msg = [0u8; 8];
    let (n, mut fds) = recv_with_fds(sock.as_raw_fd(), &mut msg).expect("recvmsg");
    if n == 0 {
        return None;
    }
    fds.pop()
}

fn read_request(pipe: &mut File) -> Option<(RequestHeader, Vec<u8>)> {
    let mut fixed = [0u8; REQUEST_FIXED_SIZE];
    pipe.read_exact(&mut fixed).ok()?;
    let header = RequestHeader::parse(&fixed);
    let mut data = vec![0u8; header.request_size as usize];
    pipe.read_exact(&mut data).ok()?;
    Some((header, data))
}

fn test_config(root: &Path) -> TransportConfig {
    TransportConfig {
        config_root: Some(root.to_path_buf()),
        shm_enabled: false,
        ..TransportConfig::default()
    }
}

/// Bootstrap through a fresh launcher and register the main thread.
fn connect(root: &TempDir) -> (ScriptedLauncher, ThreadContext) {
    let config = test_config(root.path());
    let dir = bootstrap::server_dir(&config).expect("server dir");
    let mut launcher = ScriptedLauncher { dir, ..ScriptedLauncher::default() };
    let transport = Transport::connect_with(config, &mut launcher).expect("bootstrap");
    let ctx = ThreadContext::init_main(Arc::new(transport));
    (launcher, ctx)
}

#[test]
fn absent_broker_is_launched_once_and_registers_main_thread() {
    let root = TempDir::new().expect("tempdir");
    let (mut launcher, ctx) = connect(&root);

    assert_eq!(launcher.launches, 1);
    assert_eq!(ctx.tid(), MAIN_TID);
    assert_eq!(ctx.pid(), BROKER_PID);
    assert_eq!(ctx.server_pid(), 777);
    assert!(ctx.is_main());

    drop(ctx);
    launcher.broker.take().expect("broker").join().expect("broker thread");
}

#[test]
fn open_event_returns_handle_verbatim() {
    let root = TempDir::new().expect("tempdir");
    let (mut launcher, mut ctx) = connect(&root);

    let reply = ctx.request(&OpenEvent::new(0x001f_0003, "Event")).expect("open_event");
    assert_eq!(reply.handle, Handle(EVENT_HANDLE));

    let missing = ctx.request(&OpenEvent::new(0x001f_0003, "Other")).expect_err("no such event");
    assert_eq!(missing, Status::OBJECT_NAME_NOT_FOUND);

    drop(ctx);
    launcher.broker.take().expect("broker").join().expect("broker thread");

    let observed: Vec<Observed> = launcher.observed.take().expect("channel").iter().collect();
    assert_eq!(observed.len(), 2);
    assert_eq!(observed[0].opcode, Opcode::OpenEvent.raw());
    assert_eq!(observed[0].request_size, 10, "five UTF-16 code units");
    assert_eq!(observed[0].data, utf16_bytes("Event"));
}
