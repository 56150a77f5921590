//! Locating and starting the broker binary.
//!
//! # Search order
//!
//! ```text
//! 1. explicit override        (WINESERVER / WINEPRELOADER)
//! 2. installation bin dir     (WINE_INSTALL_DIR, or SRVLINK_BINDIR at build time)
//! 3. directory of this executable
//! 4. each PATH entry
//! 5. current directory
//! ```
//!
//! When a preloader is found the broker runs under it (`preloader broker`).

use std::ffi::OsStr;
use std::fmt;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};

use crate::config::TransportConfig;
use crate::constants::{BROKER_BINARY_NAME, PRELOADER_BINARY_NAME};
use crate::error::BootstrapError;

/// Starts the broker. A trait so tests can observe launches.
pub trait BrokerLauncher: fmt::Debug {
    /// Start the broker in the background.
    fn launch(&mut self, config: &TransportConfig) -> Result<(), BootstrapError>;

    /// Exit status of the launched broker if it has already terminated.
    ///
    /// Reaps the child; never blocks.
    fn exited(&mut self) -> Option<ExitStatus>;
}

/// Launches the real broker with `std::process::Command`.
#[derive(Debug, Default)]
pub struct ProcessLauncher {
    child: Option<Child>,
}

impl ProcessLauncher {
    /// A launcher that has not started anything yet.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl BrokerLauncher for ProcessLauncher {
    fn launch(&mut self, config: &TransportConfig) -> Result<(), BootstrapError> {
        let dirs = search_dirs(config);
        let broker = find_binary(config.broker_override.as_deref(), BROKER_BINARY_NAME, &dirs)
            .ok_or(BootstrapError::BrokerNotFound)?;
        let preloader =
            find_binary(config.preloader_override.as_deref(), PRELOADER_BINARY_NAME, &dirs);

        let (program, mut cmd) = match &preloader {
            Some(pre) => {
                let mut cmd = Command::new(pre);
                cmd.arg(&broker);
                (pre.clone(), cmd)
            }
            None => (broker.clone(), Command::new(&broker)),
        };
        if let Some(root) = &config.config_root {
            cmd.env("WINEPREFIX", root);
        }
        cmd.stdin(Stdio::null());

        log::info!(
            "[bootstrap] starting broker {}{}",
            broker.display(),
            preloader.as_ref().map(|p| format!(" via {}", p.display())).unwrap_or_default()
        );
        let child = cmd
            .spawn()
            .map_err(|source| BootstrapError::CannotExec { path: program, source })?;
        self.child = Some(child);
        Ok(())
    }

    fn exited(&mut self) -> Option<ExitStatus> {
        let child = self.child.as_mut()?;
        match child.try_wait() {
            Ok(Some(status)) => {
                self.child = None;
                Some(status)
            }
            Ok(None) => None,
            Err(e) => {
                log::warn!("[bootstrap] cannot poll broker process: {e}");
                None
            }
        }
    }
}

/// Directories probed after an explicit override, in order.
#[must_use]
pub fn search_dirs(config: &TransportConfig) -> Vec<PathBuf> {
    let exe_dir = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf));
    let path_var = std::env::var_os("PATH");
    let cwd = std::env::current_dir().ok();
    search_dirs_from(config.install_dir.as_deref(), exe_dir, path_var.as_deref(), cwd)
}

fn search_dirs_from(
    install_dir: Option<&Path>,
    exe_dir: Option<PathBuf>,
    path_var: Option<&OsStr>,
    cwd: Option<PathBuf>,
) -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    dirs.extend(install_dir.map(Path::to_path_buf));
    dirs.extend(exe_dir);
    if let Some(path_var) = path_var {
        dirs.extend(std::env::split_paths(path_var).filter(|p| !p.as_os_str().is_empty()));
    }
    dirs.extend(cwd);
    dirs
}

/// First executable named `name` in `dirs`, unless `explicit` is given.
///
/// An explicit path is returned as long as it is executable; it never falls
/// through to the search.
#[must_use]
pub fn find_binary(explicit: Option<&Path>, name: &str, dirs: &[PathBuf]) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return is_executable(path).then(|| path.to_path_buf());
    }
    dirs.iter().map(|dir| dir.join(name)).find(|candidate| is_executable(candidate))
}

fn is_executable(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}
