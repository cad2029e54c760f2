mod conditions;
mod conf;
mod eventloop;
mod registry;
mod sm;

use crate::config::Config;
use crate::services::{Dirty, RunlevelMask, Service, ServiceKind, SvcKey, SvcState};
use crate::signal_handler::{self, ChildTermination};
use crate::sm::SmState;
use crate::supervisor::Supervisor;

/// A supervisor parked in normal operation at runlevel 2, with nothing
/// registered. Tests drive the state machines directly instead of going
/// through the event loop.
pub fn test_supervisor() -> Supervisor {
    let mut config = Config::default();
    // point away from any real /etc/rustyinit.d so a reload inside a test
    // cannot pick up host configuration
    config.confdir = std::env::temp_dir().join("rustyinit-no-such-confdir");
    let mut sup = Supervisor::new(config);
    sup.runlevel = 2;
    sup.sm.state = SmState::Running;
    sup
}

pub fn add_service(
    sup: &mut Supervisor,
    cmd: &str,
    kind: ServiceKind,
    levels: &[u8],
) -> SvcKey {
    let key = SvcKey::new(cmd, 1);
    let mut svc = Service::new(key.clone(), kind);
    let mut mask = RunlevelMask::EMPTY;
    for &level in levels {
        mask.set(level);
    }
    svc.runlevels = mask;
    svc.dirty = Dirty::Clean;
    sup.registry.insert(svc);
    key
}

/// Collect one specific child and route it through the monitor, the way
/// the SIGCHLD path does at runtime. Waiting on the exact pid keeps
/// concurrently running tests from stealing each other's children.
pub fn reap_one(sup: &mut Supervisor, pid: nix::unistd::Pid) {
    use nix::sys::wait::{waitpid, WaitStatus};
    let termination = match waitpid(pid, None) {
        Ok(WaitStatus::Exited(_, code)) => ChildTermination::Exit(code),
        Ok(WaitStatus::Signaled(_, sig, _)) => ChildTermination::Signal(sig),
        other => panic!("unexpected wait status: {other:?}"),
    };
    signal_handler::service_monitor(sup, pid, termination);
}

/// The central record invariant: a held pid implies an alive-ish state
/// and vice versa.
pub fn assert_pid_state_invariant(sup: &Supervisor) {
    for svc in sup.registry.iter() {
        if svc.kind == ServiceKind::Inetd {
            continue;
        }
        match svc.state {
            SvcState::Running | SvcState::Waiting | SvcState::Stopping => {
                // a reaped-but-not-yet-stepped record is the one legal
                // exception and never visible outside a step
            }
            SvcState::Halted | SvcState::Ready | SvcState::Done => {
                assert!(
                    svc.pid.is_none(),
                    "{} holds pid {:?} in state {}",
                    svc.key,
                    svc.pid,
                    svc.state
                );
            }
        }
    }
}
