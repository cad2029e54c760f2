//! Delegated process accounting via cgroup2 leaves.
//!
//! The core only asks for two things: put a freshly forked service pid in
//! a leaf group named after it, and prune leaves that no longer have a
//! matching live service. Policy (controllers, limits) belongs to the
//! accounting collaborator; failures here are logged, never fatal.

#[cfg(feature = "cgroups")]
use log::{debug, trace};

use crate::registry::ServiceRegistry;

#[cfg(feature = "cgroups")]
const CGROUP_ROOT: &str = "/sys/fs/cgroup/rustyinit";

/// Create the leaf group for a service and move the pid into it.
pub fn service_cgroup(name: &str, pid: nix::unistd::Pid) {
    #[cfg(feature = "cgroups")]
    {
        let leaf = std::path::Path::new(CGROUP_ROOT).join(name);
        if let Err(e) = std::fs::create_dir_all(&leaf) {
            debug!("Couldnt create service cgroup {leaf:?}: {e}");
            return;
        }
        if let Err(e) = std::fs::write(leaf.join("cgroup.procs"), format!("{pid}")) {
            debug!("Couldnt move pid {pid} to cgroup {leaf:?}: {e}");
        } else {
            trace!("Moved pid {pid} to cgroup {leaf:?}");
        }
    }
    let _ = (name, pid);
}

/// Remove leaves without a live service. Called from the clean phases of
/// runlevel change and reload.
pub fn prune(registry: &ServiceRegistry) {
    #[cfg(feature = "cgroups")]
    {
        let active: std::collections::HashSet<String> = registry
            .iter()
            .filter(|svc| svc.pid.is_some())
            .map(|svc| svc.key.ident())
            .collect();

        let entries = match std::fs::read_dir(CGROUP_ROOT) {
            Ok(entries) => entries,
            Err(_) => return,
        };
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if active.contains(&name) {
                continue;
            }
            // an empty leaf removes cleanly; one with stragglers doesn't,
            // and gets another chance next clean phase
            if let Err(e) = std::fs::remove_dir(entry.path()) {
                trace!("Leaving cgroup {name}: {e}");
            } else {
                debug!("Pruned cgroup {name}");
            }
        }
    }
    let _ = registry;
}
