//! Connection bootstrap: find the broker's sockets, starting it if needed.
//!
//! # File layout
//!
//! ```text
//! <config-root>/                       $WINEPREFIX or $HOME/.wine
//!   wineserver-<host>-<user>/          mode 0700, owned by us
//!     socket                           command socket
//!     fd-socket                        descriptor-exchange socket
//! ```
//!
//! # Connect sequence
//!
//! ```text
//! verify dir ──► attempt 0..3 ──(sockets absent)──► launch broker (once) ──► re-check
//!                   │  sleep 100ms × n² between attempts
//!                   ▼
//!              connect both ──ok──► Connection
//!                   │ refused on every attempt
//!                   ▼
//!              unlink both sockets (once) ──► whole sequence again
//! ```

pub mod launcher;

use std::ffi::CStr;
use std::fs::DirBuilder;
use std::io;
use std::os::unix::fs::{DirBuilderExt, MetadataExt};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};

use crate::config::TransportConfig;
use crate::constants::{
    COMMAND_SOCKET_NAME, CONNECT_BACKOFF_BASE, FD_SOCKET_NAME, MAX_CONNECT_ATTEMPTS,
    SERVER_DIR_PREFIX,
};
use crate::error::BootstrapError;

pub use launcher::{BrokerLauncher, ProcessLauncher};

/// The two connected broker sockets.
#[derive(Debug)]
pub struct Connection {
    /// Request socket used to set up per-thread channels.
    pub command: UnixStream,
    /// Descriptor-exchange socket.
    pub fd_socket: UnixStream,
    /// Directory the sockets live in.
    pub server_dir: PathBuf,
}

/// `<config-root>/wineserver-<host>-<user>`.
pub fn server_dir(config: &TransportConfig) -> Result<PathBuf, BootstrapError> {
    let root = config.config_root()?;
    Ok(root.join(format!("{SERVER_DIR_PREFIX}-{}-{}", host_name(), user_name())))
}

fn host_name() -> String {
    match hostname::get() {
        Ok(name) => name.to_string_lossy().into_owned(),
        Err(e) => {
            log::warn!("[bootstrap] cannot read host name: {e}");
            "localhost".to_string()
        }
    }
}

/// Login name of the current uid, or the numeric uid when unknown.
fn user_name() -> String {
    // SAFETY: getuid cannot fail.
    let uid = unsafe { libc::getuid() };
    let mut buf = vec![0 as libc::c_char; 1024];
    // SAFETY: passwd is plain data; getpwuid_r fills it.
    let mut pwd: libc::passwd = unsafe { std::mem::zeroed() };
    let mut result: *mut libc::passwd = std::ptr::null_mut();
    loop {
        // SAFETY: all pointers refer to live buffers; `buf.len()` is accurate.
        let ret = unsafe { libc::getpwuid_r(uid, &mut pwd, buf.as_mut_ptr(), buf.len(), &mut result) };
        if ret == libc::ERANGE && buf.len() < 1 << 16 {
            buf.resize(buf.len() * 2, 0);
            continue;
        }
        if ret != 0 || result.is_null() || pwd.pw_name.is_null() {
            return uid.to_string();
        }
        // SAFETY: on success pw_name points into `buf` and is NUL-terminated.
        let name = unsafe { CStr::from_ptr(pwd.pw_name) };
        return name.to_string_lossy().into_owned();
    }
}

/// Create the server directory (and its parents) if missing, then check it.
pub fn prepare_server_dir(dir: &Path) -> Result<(), BootstrapError> {
    if let Err(source) = DirBuilder::new().recursive(true).mode(0o700).create(dir) {
        return Err(BootstrapError::Io { path: dir.to_path_buf(), source });
    }
    verify_server_dir(dir)
}

/// The directory must be a real directory, owned by us, closed to others.
pub fn verify_server_dir(dir: &Path) -> Result<(), BootstrapError> {
    let meta = std::fs::symlink_metadata(dir)
        .map_err(|source| BootstrapError::Io { path: dir.to_path_buf(), source })?;
    if !meta.is_dir() {
        return Err(BootstrapError::NotADirectory(dir.to_path_buf()));
    }
    // SAFETY: getuid cannot fail.
    let uid = unsafe { libc::getuid() };
    if meta.uid() != uid {
        return Err(BootstrapError::NotOwned { path: dir.to_path_buf(), owner: meta.uid() });
    }
    if meta.mode() & 0o077 != 0 {
        return Err(BootstrapError::BadPermissions { path: dir.to_path_buf(), mode: meta.mode() });
    }
    Ok(())
}

enum AttemptFailure {
    Stale { path: PathBuf, source: io::Error },
    Fatal(BootstrapError),
}

/// One process's bootstrap state: at most one broker launch.
#[derive(Debug)]
pub struct Bootstrap<'a> {
    config: &'a TransportConfig,
    launcher: &'a mut dyn BrokerLauncher,
    launched: bool,
}

impl<'a> Bootstrap<'a> {
    /// Bootstrap for `config`, starting the broker through `launcher`.
    pub fn new(config: &'a TransportConfig, launcher: &'a mut dyn BrokerLauncher) -> Self {
        Self { config, launcher, launched: false }
    }

    /// Run the full connect sequence.
    pub fn connect(&mut self) -> Result<Connection, BootstrapError> {
        let dir = server_dir(self.config)?;
        prepare_server_dir(&dir)?;
        self.connect_in(&dir)
    }

    /// Connect sequence against an already-chosen server directory.
    pub fn connect_in(&mut self, dir: &Path) -> Result<Connection, BootstrapError> {
        verify_server_dir(dir)?;
        let mut unlinked = false;
        loop {
            match self.attempts(dir) {
                Ok(conn) => return Ok(conn),
                Err(AttemptFailure::Stale { path, source }) if !unlinked => {
                    log::warn!(
                        "[bootstrap] {} refuses connections ({source}), removing stale sockets",
                        path.display()
                    );
                    remove_sockets(dir);
                    unlinked = true;
                }
                Err(AttemptFailure::Stale { path, source }) => {
                    return Err(BootstrapError::Stale { path, source })
                }
                Err(AttemptFailure::Fatal(e)) => return Err(e),
            }
        }
    }

    fn attempts(&mut self, dir: &Path) -> Result<Connection, AttemptFailure> {
        let command_path = dir.join(COMMAND_SOCKET_NAME);
        let fd_path = dir.join(FD_SOCKET_NAME);
        let mut last_refusal = None;

        for attempt in 0..MAX_CONNECT_ATTEMPTS {
            if attempt > 0 {
                std::thread::sleep(CONNECT_BACKOFF_BASE * attempt * attempt);
            }

            if !sockets_present(&command_path, &fd_path) {
                self.launch_once().map_err(AttemptFailure::Fatal)?;
                if let Some(status) = self.launcher.exited() {
                    if !status.success() {
                        return Err(AttemptFailure::Fatal(BootstrapError::BrokerExited(status)));
                    }
                }
                if !sockets_present(&command_path, &fd_path) {
                    log::debug!("[bootstrap] attempt {attempt}: sockets not there yet");
                    continue;
                }
            }

            match connect_pair(&command_path, &fd_path) {
                Ok((command, fd_socket)) => {
                    log::info!("[bootstrap] connected to broker in {}", dir.display());
                    return Ok(Connection { command, fd_socket, server_dir: dir.to_path_buf() });
                }
                Err((path, source)) => {
                    log::debug!("[bootstrap] attempt {attempt}: {}: {source}", path.display());
                    last_refusal = Some((path, source));
                }
            }
        }

        match last_refusal {
            Some((path, source)) => Err(AttemptFailure::Stale { path, source }),
            None => Err(AttemptFailure::Fatal(BootstrapError::NoSockets(dir.to_path_buf()))),
        }
    }

    fn launch_once(&mut self) -> Result<(), BootstrapError> {
        if self.launched {
            return Ok(());
        }
        self.launched = true;
        self.launcher.launch(self.config)
    }
}

fn sockets_present(command: &Path, fd: &Path) -> bool {
    command.symlink_metadata().is_ok() && fd.symlink_metadata().is_ok()
}

fn connect_pair(command: &Path, fd: &Path) -> Result<(UnixStream, UnixStream), (PathBuf, io::Error)> {
    let command_sock = UnixStream::connect(command).map_err(|e| (command.to_path_buf(), e))?;
    let fd_sock = UnixStream::connect(fd).map_err(|e| (fd.to_path_buf(), e))?;
    Ok((command_sock, fd_sock))
}

fn remove_sockets(dir: &Path) {
    for name in [COMMAND_SOCKET_NAME, FD_SOCKET_NAME] {
        let path = dir.join(name);
        if let Err(e) = std::fs::remove_file(&path) {
            if e.kind() != io::ErrorKind::NotFound {
                log::warn!("[bootstrap] cannot remove {}: {e}", path.display());
            }
        }
    }
}
