//! Pidfile bookkeeping under /var/run.
//!
//! The supervisor never blocks on pidfile existence; an external watcher
//! asserts the service's identity condition when the file appears. Our
//! only job is removing stale files after a reap, since daemons rarely
//! clean up on the way out.

use std::path::{Path, PathBuf};

use log::warn;

use crate::services::SvcKey;

const PID_PATH: &str = "/var/run";

#[must_use]
pub fn path_for(cmd: &Path) -> PathBuf {
    let base = cmd
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "unknown".to_string());
    Path::new(PID_PATH).join(format!("{base}.pid"))
}

/// Best effort; a file that was never written is not an error.
pub fn remove_stale(cmd: &Path) {
    let pidfile = path_for(cmd);
    if let Err(e) = std::fs::remove_file(&pidfile) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed removing stale pidfile {pidfile:?}: {e}");
        }
    }
}

/// The identity condition the external pidfile watcher asserts once the
/// service has written its pidfile, e.g. `svc/sbin/sshd`.
#[must_use]
pub fn cond_name(key: &SvcKey) -> String {
    format!("svc{}", key.cmd.display())
}
