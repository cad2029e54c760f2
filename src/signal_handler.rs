//! Child reaping and the SysV signal interface of PID 1.
//!
//! Signals arrive through the event loop's self-pipe; this module maps
//! them onto reaping, reload, and the classic runlevel transitions:
//! SIGINT (ctrl-alt-del) reboots, SIGTERM halts, SIGUSR1 drops to single
//! user, SIGUSR2 halts, SIGPWR runs the power-fail hooks and halts.

use log::{debug, trace, warn};
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

use crate::plugins::{self, HookPhase};
use crate::services;
use crate::sm;
use crate::supervisor::Supervisor;

/// How a reaped child ended.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum ChildTermination {
    Exit(i32),
    Signal(Signal),
}

impl ChildTermination {
    #[must_use]
    pub fn success(&self) -> bool {
        matches!(self, Self::Exit(0))
    }
}

impl std::fmt::Display for ChildTermination {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::Exit(code) => write!(fmt, "exit {code}"),
            Self::Signal(sig) => write!(fmt, "signal {sig}"),
        }
    }
}

pub fn dispatch_signal(sup: &mut Supervisor, signum: libc::c_int) {
    match signum {
        libc::SIGCHLD => reap_children(sup),
        libc::SIGHUP => {
            debug!("SIGHUP: reloading configuration");
            sup.service_reload_dynamic();
        }
        libc::SIGINT => {
            debug!("SIGINT: reboot requested");
            sup.service_runlevel(6);
        }
        libc::SIGTERM => {
            debug!("SIGTERM: halt requested");
            sup.service_runlevel(0);
        }
        libc::SIGUSR1 => {
            debug!("SIGUSR1: entering single user mode");
            sup.service_runlevel(1);
        }
        libc::SIGUSR2 => {
            debug!("SIGUSR2: halt requested");
            sup.service_runlevel(0);
        }
        libc::SIGPWR => {
            warn!("SIGPWR: power failure, shutting down");
            plugins::run_hooks(sup, HookPhase::PowerFail);
            sup.service_runlevel(0);
        }
        libc::SIGALRM => {
            // claimed so stray alarms can't kill PID 1
            trace!("Ignoring SIGALRM");
        }
        other => {
            warn!("Unexpected signal {other}, ignoring");
        }
    }
}

/// Drain every exited child. Non-blocking; a SIGCHLD wakeup may cover any
/// number of exits.
pub fn reap_children(sup: &mut Supervisor) {
    loop {
        match waitpid(None::<Pid>, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::Exited(pid, code)) => {
                service_monitor(sup, pid, ChildTermination::Exit(code));
            }
            Ok(WaitStatus::Signaled(pid, sig, _core)) => {
                service_monitor(sup, pid, ChildTermination::Signal(sig));
            }
            Ok(WaitStatus::StillAlive) => break,
            Ok(status) => {
                trace!("Ignoring wait status {status:?}");
            }
            Err(nix::errno::Errno::ECHILD) => break,
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => {
                warn!("waitpid failed: {e}");
                break;
            }
        }
    }
}

/// Route a collected pid back to its service and re-step both state
/// machines. The reaction of the per-service machine is observed before
/// the global machine re-evaluates its wait-state predicates.
pub fn service_monitor(sup: &mut Supervisor, lost: Pid, termination: ChildTermination) {
    if sup.sync_shutdown {
        // the shutdown driver owns reaping from here on
        return;
    }
    if lost.as_raw() <= 1 {
        return;
    }

    plugins::run_hooks(sup, HookPhase::SvcLost);

    let Some(key) = sup.registry.key_by_pid(lost) else {
        debug!("Collected unknown pid {lost}");
        return;
    };

    debug!("Collected {key} pid {lost}: {termination}");

    // services rarely clean up their own pidfile on the way out
    crate::pidfile::remove_stale(&key.cmd);

    if let Some(svc) = sup.registry.get_mut(&key) {
        svc.pid = None;
        svc.starting = false;
        svc.last_exit = Some(termination);
    }

    services::service_step(sup, &key);
    sm::sm_step(sup);
}
