//! Transport configuration.
//!
//! Everything the transport reads from the environment is resolved once,
//! at process start, into a [`TransportConfig`]. Tests build one directly
//! instead of touching the process environment.
//!
//! # Environment Variables
//!
//! - `WINEPREFIX` - configuration root (default `$HOME/.wine`)
//! - `WINESERVER` - explicit broker binary
//! - `WINEPRELOADER` - explicit preloader binary
//! - `WINE_INSTALL_DIR` - installation `bin` directory searched for binaries
//! - `WINE_DISABLE_SHM` - disables the shared-memory fast path
//! - `WINE_SHM_LIBRARY` - helper library implementing the fast path
//! - `WINE_COOP_SCHED` - cooperative-scheduler flag forwarded at boot

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::constants::DEFAULT_SHM_LIBRARY;
use crate::error::BootstrapError;

/// Resolved transport configuration.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct TransportConfig {
    /// Root under which the server directory lives.
    pub config_root: Option<PathBuf>,
    /// Explicit broker binary, bypassing the search.
    pub broker_override: Option<PathBuf>,
    /// Explicit preloader binary, bypassing the search.
    pub preloader_override: Option<PathBuf>,
    /// Installation `bin` directory.
    pub install_dir: Option<PathBuf>,
    /// Whether the shared-memory fast path may be used.
    pub shm_enabled: bool,
    /// Helper library implementing the fast path.
    pub shm_library: PathBuf,
    /// Cooperative-scheduler mode, forwarded to the broker by the boot thread.
    pub coop_sched: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            config_root: dirs::home_dir().map(|h| h.join(".wine")),
            broker_override: None,
            preloader_override: None,
            install_dir: option_env!("SRVLINK_BINDIR").map(PathBuf::from),
            shm_enabled: true,
            shm_library: PathBuf::from(DEFAULT_SHM_LIBRARY),
            coop_sched: false,
        }
    }
}

impl TransportConfig {
    /// Defaults with environment overrides applied.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config
    }

    /// Apply overrides from `lookup` (the process environment in production).
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(prefix) = lookup("WINEPREFIX").filter(|p| !p.is_empty()) {
            self.config_root = Some(PathBuf::from(prefix));
        }
        if let Some(path) = lookup("WINESERVER").filter(|p| !p.is_empty()) {
            self.broker_override = Some(PathBuf::from(path));
        }
        if let Some(path) = lookup("WINEPRELOADER").filter(|p| !p.is_empty()) {
            self.preloader_override = Some(PathBuf::from(path));
        }
        if let Some(dir) = lookup("WINE_INSTALL_DIR").filter(|p| !p.is_empty()) {
            self.install_dir = Some(PathBuf::from(dir));
        }
        if let Some(flag) = lookup("WINE_DISABLE_SHM") {
            self.shm_enabled = !is_truthy(&flag);
        }
        if let Some(lib) = lookup("WINE_SHM_LIBRARY").filter(|p| !p.is_empty()) {
            self.shm_library = PathBuf::from(lib);
        }
        if let Some(flag) = lookup("WINE_COOP_SCHED") {
            self.coop_sched = is_truthy(&flag);
        }
    }

    /// The configuration root, or a bootstrap error if none could be found.
    pub fn config_root(&self) -> Result<&PathBuf, BootstrapError> {
        self.config_root.as_ref().ok_or(BootstrapError::NoConfigRoot)
    }
}

/// Interpret an installation flag value.
fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "y" | "yes" | "true" | "on"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn prefix_overrides_home_root() {
        let mut config = TransportConfig::default();
        config.apply_env_overrides(lookup_from(&[("WINEPREFIX", "/srv/prefix")]));
        assert_eq!(config.config_root, Some(PathBuf::from("/srv/prefix")));
    }

    #[test]
    fn empty_prefix_is_ignored() {
        let mut config = TransportConfig {
            config_root: Some(PathBuf::from("/home/u/.wine")),
            ..TransportConfig::default()
        };
        config.apply_env_overrides(lookup_from(&[("WINEPREFIX", "")]));
        assert_eq!(config.config_root, Some(PathBuf::from("/home/u/.wine")));
    }

    #[test]
    fn binary_overrides_and_flags() {
        let mut config = TransportConfig::default();
        config.apply_env_overrides(lookup_from(&[
            ("WINESERVER", "/opt/w/bin/wineserver"),
            ("WINEPRELOADER", "/opt/w/bin/wine-preloader"),
            ("WINE_DISABLE_SHM", "1"),
            ("WINE_COOP_SCHED", "yes"),
            ("WINE_SHM_LIBRARY", "/opt/w/lib/libwineshm.so"),
        ]));
        assert_eq!(config.broker_override, Some(PathBuf::from("/opt/w/bin/wineserver")));
        assert_eq!(
            config.preloader_override,
            Some(PathBuf::from("/opt/w/bin/wine-preloader"))
        );
        assert!(!config.shm_enabled);
        assert!(config.coop_sched);
        assert_eq!(config.shm_library, PathBuf::from("/opt/w/lib/libwineshm.so"));
    }

    #[test]
    fn falsy_disable_flag_keeps_shm() {
        let mut config = TransportConfig::default();
        config.apply_env_overrides(lookup_from(&[("WINE_DISABLE_SHM", "0")]));
        assert!(config.shm_enabled);
    }

    #[test]
    fn missing_root_is_a_bootstrap_error() {
        let config = TransportConfig { config_root: None, ..TransportConfig::default() };
        assert!(matches!(config.config_root(), Err(BootstrapError::NoConfigRoot)));
    }
}
