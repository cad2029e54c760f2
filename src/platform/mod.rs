//! Thin platform layer: user/group resolution, privilege dropping and the
//! PID 1 oddities.

use log::warn;
use nix::unistd::{Gid, Uid};

#[derive(Clone, Debug)]
pub struct Creds {
    pub uid: Uid,
    pub gid: Gid,
    pub home: Option<String>,
}

/// Resolve a user name (or numeric uid) and optional group name to raw
/// credentials. The group defaults to the user's primary group.
pub fn resolve_user(user: &str, group: Option<&str>) -> Result<Creds, String> {
    let (uid, primary_gid, home) = if let Ok(uid) = user.parse::<u32>() {
        (Uid::from_raw(uid), None, None)
    } else {
        let entry = nix::unistd::User::from_name(user)
            .map_err(|e| format!("user lookup failed for {user}: {e}"))?
            .ok_or_else(|| format!("no such user: {user}"))?;
        let home = entry.dir.to_str().map(|s| s.to_string());
        (entry.uid, Some(entry.gid), home)
    };

    let gid = match group {
        Some(group) => {
            if let Ok(gid) = group.parse::<u32>() {
                Gid::from_raw(gid)
            } else {
                nix::unistd::Group::from_name(group)
                    .map_err(|e| format!("group lookup failed for {group}: {e}"))?
                    .ok_or_else(|| format!("no such group: {group}"))?
                    .gid
            }
        }
        None => primary_gid.unwrap_or_else(Gid::current),
    };

    Ok(Creds { uid, gid, home })
}

/// Drop to the configured credentials, group first. Only syscalls, safe
/// to call between fork and exec.
pub fn drop_privileges(creds: &Creds) -> Result<(), nix::errno::Errno> {
    if !nix::unistd::getuid().is_root() {
        // nothing to drop, run as ourselves
        return Ok(());
    }
    nix::unistd::setgroups(&[creds.gid])?;
    nix::unistd::setgid(creds.gid)?;
    nix::unistd::setuid(creds.uid)?;
    Ok(())
}

/// When not running as PID 1 (tests, supervised development runs), become
/// a subreaper so exited service children still land in our waitpid.
pub fn become_subreaper() {
    let ret = unsafe { libc::prctl(libc::PR_SET_CHILD_SUBREAPER, 1, 0, 0, 0) };
    if ret != 0 {
        warn!(
            "Could not become subreaper: {}",
            std::io::Error::last_os_error()
        );
    }
}

/// As PID 1 the inherited stdio may be dead. Reopen matching what real
/// init systems do at startup: stdin from /dev/null, stdout/stderr on the
/// console, opened O_NOCTTY so a later getty can still acquire the
/// terminal via TIOCSCTTY.
pub fn setup_pid1_stdio(console: &std::path::Path) {
    let null_fd = unsafe {
        libc::open(
            b"/dev/null\0".as_ptr().cast(),
            libc::O_RDWR | libc::O_CLOEXEC,
        )
    };
    if null_fd >= 0 {
        let _ = unsafe { libc::dup2(null_fd, libc::STDIN_FILENO) };
        if null_fd > libc::STDERR_FILENO {
            unsafe { libc::close(null_fd) };
        }
    }

    let console = match std::ffi::CString::new(console.to_string_lossy().as_bytes()) {
        Ok(console) => console,
        Err(_) => return,
    };
    let console_fd = unsafe {
        libc::open(
            console.as_ptr(),
            libc::O_WRONLY | libc::O_NOCTTY | libc::O_CLOEXEC,
        )
    };
    if console_fd >= 0 {
        let _ = unsafe { libc::dup2(console_fd, libc::STDOUT_FILENO) };
        let _ = unsafe { libc::dup2(console_fd, libc::STDERR_FILENO) };
        if console_fd > libc::STDERR_FILENO {
            unsafe { libc::close(console_fd) };
        }
    }
}
