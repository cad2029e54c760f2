//! Daemon configuration: a small toml file for the supervisor's own
//! settings. Service declarations live in the drop-in directory and are
//! handled by the conf module.

use std::path::{Path, PathBuf};

use serde::Deserialize;

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Default target runlevel after bootstrap.
    pub cfglevel: u8,
    /// Drop-in directory with service declarations (*.conf).
    pub confdir: PathBuf,
    pub control_socket: PathBuf,
    pub fifo: PathBuf,
    pub console: PathBuf,
    /// error / warn / info / debug / trace; --debug overrides to trace.
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cfglevel: 2,
            confdir: PathBuf::from("/etc/rustyinit.d"),
            control_socket: PathBuf::from("/run/rustyinit/control.sock"),
            fifo: PathBuf::from("/run/initctl"),
            console: PathBuf::from("/dev/console"),
            log_level: "info".to_string(),
        }
    }
}

pub const DEFAULT_CONFIG_PATH: &str = "/etc/rustyinit.toml";

/// Missing file means defaults; a malformed file is reported but must not
/// keep PID 1 from booting.
pub fn load_config(path: Option<&Path>) -> Config {
    let path = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_PATH));
    match std::fs::read_to_string(path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Bad config {path:?}, using defaults: {e}");
                Config::default()
            }
        },
        Err(_) => Config::default(),
    }
}
