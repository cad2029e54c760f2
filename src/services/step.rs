//! The per-service state machine: one `service_step` call computes the
//! next state from (enabled, pid alive, condition aggregate, dirty) and
//! emits the side effects — fork/exec, signal delivery, timer arming.
//! The transition table re-runs until it reaches a fixpoint, with an
//! iteration cap to surface oscillation bugs.

use std::time::Duration;

use log::{debug, error, trace, warn};
use nix::sys::signal::{kill, Signal};

use crate::conditions::CondState;
use crate::eventloop::TimerEvent;
use crate::services::{service_start, Block, ServiceKind, StartError, SvcKey, SvcState};
use crate::supervisor::Supervisor;

/// Prevent endless respawn of faulty services.
pub const RESPAWN_MAX: u32 = 10;

/// If the pid isn't collected within this long after SIGTERM, kill it.
const KILL_DELAY: Duration = Duration::from_millis(3000);

/// A correct table settles in two or three iterations; anything near this
/// cap is an oscillation bug.
const MAX_STEP_ITER: u32 = 16;

/// Arming a service timer while one is armed is an error.
pub struct TimerBusy;

pub fn service_enabled(sup: &Supervisor, svc: &crate::services::Service) -> bool {
    svc.runlevels.contains(sup.runlevel) && !svc.is_removed() && !svc.is_blocked()
}

pub fn service_timeout_after(
    sup: &mut Supervisor,
    key: &SvcKey,
    timeout: Duration,
    event: TimerEvent,
) -> Result<(), TimerBusy> {
    let Some(svc) = sup.registry.get(key) else {
        return Ok(());
    };
    if svc.timer.is_some() {
        return Err(TimerBusy);
    }
    let id = sup.timers.after(timeout, event);
    if let Some(svc) = sup.registry.get_mut(key) {
        svc.timer = Some(id);
    }
    Ok(())
}

/// Idempotent: cancelling a service without an armed timer is a no-op.
pub fn service_timeout_cancel(sup: &mut Supervisor, key: &SvcKey) {
    if let Some(svc) = sup.registry.get_mut(key) {
        if let Some(id) = svc.timer.take() {
            sup.timers.cancel(id);
        }
    }
}

fn set_state(sup: &mut Supervisor, key: &SvcKey, new: SvcState) {
    if let Some(svc) = sup.registry.get_mut(key) {
        svc.state = new;
    }
    if new == SvcState::Stopping {
        // a pending timer (e.g. retry) is superseded by the kill timer
        service_timeout_cancel(sup, key);
        if service_timeout_after(sup, key, KILL_DELAY, TimerEvent::SvcKill(key.clone())).is_err() {
            error!("{key}: could not arm kill timer, timer already armed");
        }
    }
}

/// Advisory stop: SIGTERM to the recorded pid. Inetd listeners have no
/// pid; stopping one closes the listening socket instead.
fn service_stop(sup: &mut Supervisor, key: &SvcKey) {
    let Some(svc) = sup.registry.get_mut(key) else {
        return;
    };
    if svc.kind == ServiceKind::Inetd {
        debug!("Stopping inetd listener {}", svc.key);
        svc.listener = None;
        return;
    }
    let Some(pid) = svc.pid else {
        return;
    };
    if pid.as_raw() <= 1 {
        warn!("Bad pid {pid} for {}, not sending SIGTERM", svc.key);
        return;
    }
    debug!("Sending SIGTERM to pid {pid} for {}", svc.key);
    if let Err(e) = kill(pid, Signal::SIGTERM) {
        warn!("Error sending SIGTERM to {} pid {pid}: {e}", svc.key);
    }
}

/// Restart a SIGHUP-capable service in place after a config change.
fn service_restart(sup: &mut Supervisor, key: &SvcKey) {
    let Some(svc) = sup.registry.get_mut(key) else {
        return;
    };
    if !svc.sighup {
        return;
    }
    let Some(pid) = svc.pid else {
        return;
    };
    if pid.as_raw() <= 1 {
        warn!("Bad pid {pid} for {}, not sending SIGHUP", svc.key);
        svc.pid = None;
        return;
    }
    debug!("Restarting {}: sending SIGHUP to pid {pid}", svc.key);
    // declare we're waiting for the service to re-assert its pidfile
    svc.starting = true;
    if let Err(e) = kill(pid, Signal::SIGHUP) {
        warn!("Error sending SIGHUP to {} pid {pid}: {e}", svc.key);
    }
}

fn deliver(sup: &Supervisor, key: &SvcKey, sig: Signal) {
    if let Some(svc) = sup.registry.get(key) {
        if let Some(pid) = svc.pid {
            if let Err(e) = kill(pid, sig) {
                warn!("Error sending {sig} to {} pid {pid}: {e}", svc.key);
            }
        }
    }
}

/// Kill escalation, fired by the timer armed on entry to STOPPING: the
/// service ignored SIGTERM for the whole grace period. Sent exactly once;
/// the reaper removes the pid afterwards.
pub fn service_kill_timeout(sup: &mut Supervisor, key: &SvcKey) {
    let Some(svc) = sup.registry.get(key) else {
        return;
    };
    let Some(pid) = svc.pid else {
        return;
    };
    warn!(
        "{} did not stop within {}ms, sending SIGKILL to pid {pid}",
        svc.key,
        KILL_DELAY.as_millis()
    );
    if let Err(e) = kill(pid, Signal::SIGKILL) {
        warn!("Error sending SIGKILL to {} pid {pid}: {e}", svc.key);
    }
}

/// Respawn throttle. Scheduled after a crash; each firing either resets
/// the budget (service recovered or was handled some other way), gives up
/// (budget exhausted, mark CRASHING), or unblocks the service for another
/// attempt and re-arms itself: 2 s spacing for the first half of the
/// budget, then 5 s.
pub fn service_retry(sup: &mut Supervisor, key: &SvcKey) {
    service_timeout_cancel(sup, key);

    let Some(svc) = sup.registry.get_mut(key) else {
        return;
    };
    if svc.state != SvcState::Halted || svc.block != Block::Restarting {
        debug!("{} not crashing anymore", svc.key);
        svc.restart_counter = 0;
        return;
    }

    if svc.restart_counter >= RESPAWN_MAX {
        error!("{} keeps crashing, not restarting", svc.key);
        svc.block = Block::Crashing;
        svc.restart_counter = 0;
        service_step(sup, key);
        return;
    }

    svc.restart_counter += 1;
    let attempt = svc.restart_counter;
    debug!("{} crashed, trying to start it again, attempt {attempt}", svc.key);
    svc.block = Block::None;
    service_step(sup, key);

    let timeout = if attempt <= RESPAWN_MAX / 2 { 2000 } else { 5000 };
    if service_timeout_after(
        sup,
        key,
        Duration::from_millis(timeout),
        TimerEvent::SvcRetry(key.clone()),
    )
    .is_err()
    {
        trace!("{key}: retry timer already armed");
    }
}

pub fn service_step(sup: &mut Supervisor, key: &SvcKey) {
    for _ in 0..MAX_STEP_ITER {
        let Some(svc) = sup.registry.get(key) else {
            return;
        };
        let old_state = svc.state;
        let enabled = service_enabled(sup, svc);
        let cond = sup.conds.aggregate(&svc.conds);
        let pid = svc.pid;
        let kind = svc.kind;
        let changed = svc.is_changed();
        let sighup = svc.sighup;
        let teardown = sup.sm.in_teardown;

        trace!(
            "{:>16}({}): {} {}abled cond:{cond}",
            svc.key.ident(),
            pid.map_or(0, |p| p.as_raw()),
            old_state,
            if enabled { "en" } else { "dis" },
        );

        match old_state {
            SvcState::Halted => {
                if enabled {
                    set_state(sup, key, SvcState::Ready);
                }
            }

            SvcState::Done => {
                if kind == ServiceKind::InetdConn {
                    // hand the slot back to a busy wait-style parent, then
                    // remove ourselves from the books
                    let parent = sup.registry.get(key).and_then(|svc| svc.parent.clone());
                    if let Some(pkey) = parent {
                        let parent_busy =
                            sup.registry.get(&pkey).map(|p| p.busy).unwrap_or(false);
                        if parent_busy {
                            if let Some(p) = sup.registry.get_mut(&pkey) {
                                p.busy = false;
                            }
                            service_step(sup, &pkey);
                        }
                    }
                    sup.registry.remove(key);
                    return;
                }
                if changed {
                    set_state(sup, key, SvcState::Halted);
                }
            }

            SvcState::Stopping => {
                if pid.is_none() {
                    // pid was collected normally, no need to kill it
                    service_timeout_cancel(sup, key);
                    match kind {
                        ServiceKind::Service | ServiceKind::Sysv | ServiceKind::Inetd => {
                            set_state(sup, key, SvcState::Halted);
                        }
                        ServiceKind::InetdConn | ServiceKind::Task | ServiceKind::Run => {
                            set_state(sup, key, SvcState::Done);
                        }
                    }
                }
            }

            SvcState::Ready => {
                if !enabled {
                    set_state(sup, key, SvcState::Halted);
                } else if cond == CondState::On {
                    // wait until all outgoing processes have stopped
                    // before starting anything for the new level
                    if teardown {
                        return;
                    }
                    match service_start(sup, key) {
                        Ok(()) => {
                            if let Some(svc) = sup.registry.get_mut(key) {
                                svc.mark_clean();
                            }
                            set_state(sup, key, SvcState::Running);
                        }
                        Err(StartError::Missing) => {
                            // block reason is set; park until an external
                            // unblock, no retry timer
                            set_state(sup, key, SvcState::Halted);
                        }
                        Err(StartError::Suspended) => {
                            return;
                        }
                        Err(e) => {
                            warn!("Failed starting {key}: {e}");
                            if let Some(svc) = sup.registry.get_mut(key) {
                                svc.restart_counter += 1;
                                svc.block = Block::Restarting;
                            }
                            set_state(sup, key, SvcState::Halted);
                            let attempt = sup
                                .registry
                                .get(key)
                                .map_or(0, |svc| svc.restart_counter);
                            let timeout =
                                if attempt <= RESPAWN_MAX / 2 { 2000 } else { 5000 };
                            if service_timeout_after(
                                sup,
                                key,
                                Duration::from_millis(timeout),
                                TimerEvent::SvcRetry(key.clone()),
                            )
                            .is_err()
                            {
                                trace!("{key}: retry timer already armed");
                            }
                        }
                    }
                }
            }

            SvcState::Running => {
                if !enabled {
                    service_stop(sup, key);
                    set_state(sup, key, SvcState::Stopping);
                } else if pid.is_none() && kind != ServiceKind::Inetd {
                    match kind {
                        ServiceKind::Service | ServiceKind::Sysv => {
                            // crashed daemon: restart directly after the
                            // first crash, the retry timer paces the rest
                            if let Some(svc) = sup.registry.get_mut(key) {
                                svc.block = Block::Restarting;
                            }
                            set_state(sup, key, SvcState::Halted);
                            debug!("delayed restart of {key}");
                            if service_timeout_after(
                                sup,
                                key,
                                Duration::from_millis(1),
                                TimerEvent::SvcRetry(key.clone()),
                            )
                            .is_err()
                            {
                                trace!("{key}: retry already pending");
                            }
                        }
                        _ => {
                            // collected one-shot or inetd connection,
                            // drive it to stopping
                            set_state(sup, key, SvcState::Stopping);
                        }
                    }
                } else {
                    match cond {
                        CondState::Off => {
                            service_stop(sup, key);
                            set_state(sup, key, SvcState::Stopping);
                        }
                        CondState::Flux => {
                            deliver(sup, key, Signal::SIGSTOP);
                            set_state(sup, key, SvcState::Waiting);
                        }
                        CondState::On => {
                            if changed {
                                if sighup && pid.is_some() {
                                    // wait until all outgoing processes
                                    // have stopped before poking anyone
                                    if teardown {
                                        return;
                                    }
                                    service_restart(sup, key);
                                } else {
                                    service_stop(sup, key);
                                    set_state(sup, key, SvcState::Stopping);
                                }
                                if let Some(svc) = sup.registry.get_mut(key) {
                                    svc.mark_clean();
                                }
                            }
                        }
                    }
                }
            }

            SvcState::Waiting => {
                if !enabled {
                    deliver(sup, key, Signal::SIGCONT);
                    service_stop(sup, key);
                    set_state(sup, key, SvcState::Stopping);
                } else if pid.is_none() {
                    if let Some(svc) = sup.registry.get_mut(key) {
                        svc.restart_counter += 1;
                    }
                    set_state(sup, key, SvcState::Ready);
                } else {
                    match cond {
                        CondState::On => {
                            deliver(sup, key, Signal::SIGCONT);
                            set_state(sup, key, SvcState::Running);
                        }
                        CondState::Off => {
                            deliver(sup, key, Signal::SIGCONT);
                            service_stop(sup, key);
                            set_state(sup, key, SvcState::Stopping);
                        }
                        CondState::Flux => {}
                    }
                }
            }
        }

        let Some(svc) = sup.registry.get(key) else {
            return;
        };
        if svc.state == old_state {
            return;
        }
        trace!("{:>16}: -> {}", svc.key.ident(), svc.state);
    }

    error!("Service {key} never reached a step fixpoint; transition table oscillation");
    debug_assert!(false, "service step oscillation for {key}");
}
