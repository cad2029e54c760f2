//! Inetd-style on-demand services.
//!
//! An `inetd` record owns a listening socket polled by the event loop.
//! `nowait` listeners accept each connection and register a short-lived
//! connection record whose stdin is the accepted socket; `wait` listeners
//! hand the listening socket itself to a single child and stay busy until
//! that child is collected.

use std::os::unix::io::{AsRawFd, IntoRawFd};

use log::{debug, info, trace, warn};

use crate::conf::ConfError;
use crate::services::{self, Dirty, Service, ServiceKind, SvcKey};
use crate::supervisor::Supervisor;

#[derive(Clone, Eq, PartialEq, Debug)]
pub struct InetdConf {
    /// Service name or numeric port, e.g. `ssh` or `2222`.
    pub name: String,
    pub proto: String,
    pub port: u16,
    /// wait: one child owns the listener; nowait: fork per connection.
    pub wait: bool,
    /// Interfaces connections are allowed from; empty means any.
    pub allow: Vec<String>,
    pub deny: Vec<String>,
}

impl InetdConf {
    /// Parse `ssh/tcp@eth0,!eth1` or `2222/tcp`.
    pub fn parse(spec: &str, wait: bool) -> Result<Self, ConfError> {
        let (svc, ifaces) = match spec.split_once('@') {
            Some((svc, ifaces)) => (svc, Some(ifaces)),
            None => (spec, None),
        };
        let (name, proto) = svc
            .split_once('/')
            .ok_or_else(|| ConfError::BadInetd(spec.to_string()))?;
        if proto != "tcp" {
            // udp inetd services need recvfrom-style dispatch; not wired up
            return Err(ConfError::BadInetd(spec.to_string()));
        }
        let port = match name.parse::<u16>() {
            Ok(port) => port,
            Err(_) => {
                builtin_port(name).ok_or_else(|| ConfError::BadInetd(spec.to_string()))?
            }
        };

        let mut allow = Vec::new();
        let mut deny = Vec::new();
        if let Some(ifaces) = ifaces {
            for iface in ifaces.split(',').filter(|s| !s.is_empty()) {
                match iface.strip_prefix('!') {
                    Some(iface) => deny.push(iface.to_string()),
                    None => allow.push(iface.to_string()),
                }
            }
        }

        Ok(Self {
            name: name.to_string(),
            proto: proto.to_string(),
            port,
            wait,
            allow,
            deny,
        })
    }
}

/// The handful of well-known services we resolve without /etc/services.
fn builtin_port(name: &str) -> Option<u16> {
    match name {
        "echo" => Some(7),
        "discard" => Some(9),
        "daytime" => Some(13),
        "chargen" => Some(19),
        "ftp" => Some(21),
        "ssh" => Some(22),
        "telnet" => Some(23),
        "time" => Some(37),
        "http" => Some(80),
        "pop3" => Some(110),
        _ => None,
    }
}

/// Open the listening socket for an inetd record; the start path of its
/// state machine calls this instead of forking.
pub fn listener_start(sup: &mut Supervisor, key: &SvcKey) -> Result<(), String> {
    let Some(svc) = sup.registry.get_mut(key) else {
        return Ok(());
    };
    if svc.listener.is_some() {
        return Ok(());
    }
    let Some(conf) = &svc.inetd else {
        return Err(format!("{key} has no inetd configuration"));
    };

    let listener = std::net::TcpListener::bind(("0.0.0.0", conf.port))
        .map_err(|e| format!("bind port {}: {e}", conf.port))?;
    listener
        .set_nonblocking(true)
        .map_err(|e| format!("set_nonblocking: {e}"))?;

    info!("Inetd service {} listening on port {}", svc.key, conf.port);
    svc.listener = Some(listener);
    Ok(())
}

/// The event loop saw the listener readable.
pub fn handle_readable(sup: &mut Supervisor, key: &SvcKey) {
    let Some(svc) = sup.registry.get(key) else {
        return;
    };
    if svc.busy {
        return;
    }
    let Some(conf) = svc.inetd.clone() else {
        return;
    };

    let stdin_fd = if conf.wait {
        // hand the listening socket itself to the child and stop
        // polling it until the child is collected
        let Some(listener) = &svc.listener else {
            return;
        };
        let dup = unsafe { libc::dup(listener.as_raw_fd()) };
        if dup < 0 {
            warn!(
                "Could not dup listener for {key}: {}",
                std::io::Error::last_os_error()
            );
            return;
        }
        if let Some(svc) = sup.registry.get_mut(key) {
            svc.busy = true;
        }
        dup
    } else {
        let Some(listener) = &svc.listener else {
            return;
        };
        match listener.accept() {
            Ok((stream, peer)) => {
                trace!("Inetd {key}: connection from {peer}");
                stream.into_raw_fd()
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return,
            Err(e) => {
                warn!("Inetd {key}: accept failed: {e}");
                return;
            }
        }
    };

    // builtin services are answered by a plugin callback in a forked
    // child instead of an external binary; their pids are not tracked
    if let Some(callback) = sup.hooks.inetd_builtin(&conf.name) {
        match unsafe { nix::unistd::fork() } {
            Ok(nix::unistd::ForkResult::Child) => {
                let code = callback(stdin_fd);
                unsafe { libc::_exit(code) };
            }
            Ok(nix::unistd::ForkResult::Parent { child }) => {
                trace!("Inetd {key}: builtin {} answered by pid {child}", conf.name);
                unsafe { libc::close(stdin_fd) };
                if let Some(svc) = sup.registry.get_mut(key) {
                    // a listener handed to a builtin is available again
                    svc.busy = false;
                }
            }
            Err(e) => {
                warn!("Inetd {key}: fork for builtin failed: {e}");
                unsafe { libc::close(stdin_fd) };
            }
        }
        return;
    }

    spawn_connection(sup, key, stdin_fd);
}

/// Register a connection record as a child of the listener and step it
/// into RUNNING. The record is runtime-born: it is never a removal
/// candidate on reload and unregisters itself once collected.
fn spawn_connection(sup: &mut Supervisor, parent: &SvcKey, stdin_fd: std::os::unix::io::RawFd) {
    let Some(parent_svc) = sup.registry.get(parent) else {
        unsafe { libc::close(stdin_fd) };
        return;
    };

    let id = sup.registry.next_id(&parent.cmd);
    let key = SvcKey::new(parent.cmd.clone(), id);
    let mut conn = Service::new(key.clone(), ServiceKind::InetdConn);
    conn.args = parent_svc.args.clone();
    conn.username = parent_svc.username.clone();
    conn.group = parent_svc.group.clone();
    conn.runlevels = parent_svc.runlevels;
    conn.desc = parent_svc.desc.clone();
    conn.parent = Some(parent.clone());
    conn.stdin_fd = Some(stdin_fd);
    conn.dirty = Dirty::Clean;

    debug!("Inetd {parent}: spawning connection child {key}");
    sup.registry.insert(conn);
    services::service_step(sup, &key);
}
