//! The global state machine: boot, runlevel changes, live configuration
//! reload. The wait states exist because service stop is asynchronous —
//! SIGTERM is advisory and children have their own graceful-stop timing,
//! so the next level's services must not start until the outgoing set has
//! released its resources.

use std::time::Duration;

use log::{debug, info, warn};

use crate::eventloop::TimerEvent;
use crate::plugins::{self, HookPhase};
use crate::services::{kind_mask, Dirty, INIT_LEVEL};
use crate::supervisor::Supervisor;

/// Give bootstrap run/tasks this many seconds before moving on anyway.
const BOOTSTRAP_TIMEOUT: u32 = 120;

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum SmState {
    Bootstrap,
    BootstrapWait,
    Running,
    RunlevelChange,
    RunlevelWait,
    RunlevelClean,
    ReloadChange,
    ReloadWait,
    ReloadClean,
}

impl std::fmt::Display for SmState {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.write_str(match self {
            Self::Bootstrap => "bootstrap",
            Self::BootstrapWait => "bootstrap/wait",
            Self::Running => "running",
            Self::RunlevelChange => "runlevel/change",
            Self::RunlevelWait => "runlevel/wait",
            Self::RunlevelClean => "runlevel/clean",
            Self::ReloadChange => "reload/change",
            Self::ReloadWait => "reload/wait",
            Self::ReloadClean => "reload/clean",
        })
    }
}

pub struct Sm {
    pub state: SmState,
    pub newlevel: Option<u8>,
    pub reload: bool,
    /// Prevents new service starts while the outgoing set is stopping.
    pub in_teardown: bool,
    bootstrap_left: u32,
}

impl Default for Sm {
    fn default() -> Self {
        Self::new()
    }
}

impl Sm {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: SmState::Bootstrap,
            newlevel: None,
            reload: false,
            in_teardown: false,
            bootstrap_left: BOOTSTRAP_TIMEOUT,
        }
    }
}

#[must_use]
pub fn runlevel_char(level: u8) -> char {
    if level == INIT_LEVEL {
        'S'
    } else {
        (b'0' + level.min(9)) as char
    }
}

pub fn sm_init(sup: &mut Supervisor) {
    debug!("Starting bootstrap finalize timer ...");
    sup.timers
        .after(Duration::from_millis(1000), TimerEvent::BootstrapTick);
}

pub fn sm_set_runlevel(sup: &mut Supervisor, newlevel: u8) {
    sup.sm.newlevel = Some(newlevel);
}

pub fn sm_set_reload(sup: &mut Supervisor) {
    sup.sm.reload = true;
}

/// One-second bootstrap progress check. All `run`/`task` records declared
/// for runlevel S must complete (or the watchdog expire) before we switch
/// to the configured runlevel.
pub fn sm_check_bootstrap(sup: &mut Supervisor) {
    if sup.sm.state != SmState::Bootstrap && sup.sm.state != SmState::BootstrapWait {
        return;
    }

    debug!("Step all services ...");
    sup.step_all(kind_mask::ANY);

    let pending = sup.registry.bootstrap_pending().map(|svc| svc.key.clone());
    if let Some(pending) = pending {
        if sup.sm.bootstrap_left > 0 {
            sup.sm.bootstrap_left -= 1;
            debug!(
                "Not all bootstrap run/tasks have completed yet ({pending} outstanding), {} ticks left",
                sup.sm.bootstrap_left
            );
            sup.timers
                .after(Duration::from_millis(1000), TimerEvent::BootstrapTick);
            return;
        }
        warn!("Timeout waiting for {pending} to run, resuming bootstrap");
    } else {
        debug!("All run/task have completed, resuming bootstrap.");
    }

    let level = match sup.cmdlevel {
        Some(level) => {
            debug!("Runlevel {level} requested from command line, starting all services ...");
            level
        }
        None => {
            debug!("Change to default runlevel {}, starting all services ...", sup.cfglevel);
            sup.cfglevel
        }
    };
    sup.service_runlevel(level);

    // bootstrap-only records that never got to run have no further
    // purpose, collect them during the next clean phase
    for svc in sup.registry.iter_mut() {
        let bootstrap_only = svc.runlevels.0 & !(1 << INIT_LEVEL) == 0;
        if bootstrap_only && svc.pid.is_none() && !svc.started_once {
            svc.dirty = Dirty::Removed;
        }
    }

    debug!("Running svc up hooks ...");
    plugins::run_hooks(sup, HookPhase::SvcUp);
}

pub fn sm_step(sup: &mut Supervisor) {
    loop {
        let old_state = sup.sm.state;

        debug!(
            "state: {old_state}, runlevel: {}, newlevel: {:?}, teardown: {}, reload: {}",
            runlevel_char(sup.runlevel),
            sup.sm.newlevel,
            sup.sm.in_teardown,
            sup.sm.reload,
        );

        match old_state {
            SmState::Bootstrap => {
                debug!("Bootstrapping all services in runlevel S");
                sup.step_all(kind_mask::RUNTASK | kind_mask::SERVICE | kind_mask::SYSV);
                sup.sm.state = SmState::BootstrapWait;
            }

            // Final stage of bootstrap: change to the configured runlevel,
            // run the late hooks, then bring up the respawn set (TTYs and
            // friends launch from here via hooks).
            SmState::BootstrapWait => {
                sup.step_all(kind_mask::ANY);

                // allow anything gated on bootstrap completion to start
                sup.cond_set_oneshot("int/bootstrap");

                if sup.sm.newlevel.is_none() {
                    // still waiting for run/tasks, the tick timer drives us
                } else {
                    debug!("Calling all system up hooks ...");
                    plugins::run_hooks(sup, HookPhase::SystemUp);
                    sup.step_all(kind_mask::ANY);

                    // system bootstrapped, launch the respawn set
                    sup.step_all(kind_mask::RESPAWN);
                    sup.sm.state = SmState::Running;
                }
            }

            SmState::Running => {
                sup.step_all(kind_mask::ANY);

                if let Some(newlevel) = sup.sm.newlevel {
                    if newlevel == sup.runlevel {
                        sup.sm.newlevel = None;
                    } else {
                        sup.sm.state = SmState::RunlevelChange;
                    }
                } else if sup.sm.reload {
                    sup.sm.reload = false;
                    sup.sm.state = SmState::ReloadChange;
                }
            }

            SmState::RunlevelChange => {
                let newlevel = sup.sm.newlevel.take().unwrap_or(sup.runlevel);
                sup.prevlevel = Some(sup.runlevel);
                sup.runlevel = newlevel;

                if newlevel == 0 || newlevel == 6 {
                    plugins::run_hooks(sup, HookPhase::Shutdown);
                }

                info!(
                    "Entering runlevel {} (previous {})",
                    runlevel_char(sup.runlevel),
                    sup.prevlevel.map_or('?', runlevel_char),
                );
                crate::utmp::write_runlevel_record(sup.runlevel, sup.prevlevel);
                nologin(sup);

                if newlevel != 0 && newlevel != 6 && sup.confdir.any_change() {
                    debug!("Config changed on disk, re-reading before runlevel change");
                    reload_conf(sup);
                }

                // completed one-shots run again if the new level wants them
                sup.registry.runtask_clean();

                debug!("Stopping services not allowed in new runlevel ...");
                sup.sm.in_teardown = true;
                sup.step_all(kind_mask::ANY);

                sup.sm.state = SmState::RunlevelWait;
            }

            SmState::RunlevelWait => {
                // wait for the outgoing set; the service monitor re-steps
                // us after each reap
                if let Some(svc) = sup.registry.stop_completed() {
                    debug!(
                        "Waiting to collect {} pid {:?} ...",
                        svc.key, svc.pid
                    );
                } else {
                    debug!("All services stopped, calling runlevel change hooks ...");
                    plugins::run_hooks(sup, HookPhase::RunlevelChange);

                    debug!("Starting services new to this runlevel ...");
                    sup.sm.in_teardown = false;
                    sup.step_all(kind_mask::ANY);

                    sup.sm.state = SmState::RunlevelClean;
                }
            }

            SmState::RunlevelClean => {
                if let Some(svc) = sup.registry.clean_completed() {
                    debug!("Waiting to collect cleanup child of {} ...", svc.key);
                } else {
                    let pruned = sup.registry.prune_removed();
                    if !pruned.is_empty() {
                        debug!("Pruned {} stale service(s)", pruned.len());
                    }
                    crate::cgroups::prune(&sup.registry);

                    if sup.runlevel == 0 || sup.runlevel == 6 {
                        crate::shutdown::do_shutdown(sup);
                    }
                    sup.sm.state = SmState::Running;
                }
            }

            SmState::ReloadChange => {
                reload_conf(sup);

                // mark all conditions in flux and let the per-service
                // machines move their dependents to WAITING
                debug!("Stopping services not allowed after reconf ...");
                sup.sm.in_teardown = true;
                sup.conds.reload();
                sup.step_all(kind_mask::ANY);

                sup.sm.state = SmState::ReloadWait;
            }

            SmState::ReloadWait => {
                if let Some(svc) = sup.registry.stop_completed() {
                    debug!(
                        "Waiting to collect {} pid {:?} ...",
                        svc.key, svc.pid
                    );
                } else {
                    sup.sm.in_teardown = false;
                    debug!("Starting services after reconf ...");
                    sup.step_all(kind_mask::ANY);
                    sup.sm.state = SmState::ReloadClean;
                }
            }

            SmState::ReloadClean => {
                if let Some(svc) = sup.registry.clean_completed() {
                    debug!("Waiting to collect cleanup child of {} ...", svc.key);
                } else {
                    let pruned = sup.registry.prune_removed();
                    if !pruned.is_empty() {
                        debug!("Pruned {} stale service(s)", pruned.len());
                    }
                    crate::cgroups::prune(&sup.registry);

                    debug!("Calling reconf hooks ...");
                    plugins::run_hooks(sup, HookPhase::SvcReconf);

                    debug!("Reconfiguration done");
                    sup.sm.state = SmState::Running;
                }
            }
        }

        if sup.sm.state == old_state {
            return;
        }
    }
}

fn reload_conf(sup: &mut Supervisor) {
    let mut confdir = std::mem::take(&mut sup.confdir);
    crate::conf::reload(&mut confdir, &mut sup.registry);
    sup.confdir = confdir;
}

/// Disable login in single user mode and on the way down; re-enable only
/// when coming back from those levels so an operator-managed nologin file
/// in the other runlevels is left alone.
fn nologin(sup: &Supervisor) {
    const NOLOGIN: &str = "/etc/nologin";

    let reserved = |level: u8| level == 0 || level == 1 || level == 6;

    if reserved(sup.runlevel) {
        if let Err(e) = std::fs::write(NOLOGIN, b"") {
            debug!("Could not create {NOLOGIN}: {e}");
        }
    }
    if sup.prevlevel.map(reserved).unwrap_or(false) && !reserved(sup.runlevel) {
        if let Err(e) = std::fs::remove_file(NOLOGIN) {
            if e.kind() != std::io::ErrorKind::NotFound {
                debug!("Could not remove {NOLOGIN}: {e}");
            }
        }
    }
}
