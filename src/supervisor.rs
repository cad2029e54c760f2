//! The supervisor context: one struct owning the registry, condition
//! store, timers and state machine, passed explicitly everywhere. The
//! single event-loop thread discipline is what makes this safe without
//! any locking.

use std::convert::TryFrom;
use std::os::unix::io::{AsRawFd, BorrowedFd, RawFd};
use std::time::Instant;

use log::{error, trace, warn};
use nix::poll::{PollFd, PollFlags, PollTimeout};

use crate::conditions::CondStore;
use crate::conf::ConfDir;
use crate::config::Config;
use crate::control::ControlSocket;
use crate::eventloop::{SignalPipe, TimerEvent, Timers};
use crate::fifo::Fifo;
use crate::plugins::{self, HookPhase, Hooks};
use crate::registry::ServiceRegistry;
use crate::services::{self, kind_mask, SvcKey, INIT_LEVEL};
use crate::signal_handler;
use crate::sm::{self, Sm};

pub struct Supervisor {
    pub config: Config,
    pub confdir: ConfDir,
    pub registry: ServiceRegistry,
    pub conds: CondStore,
    pub timers: Timers,
    pub sm: Sm,
    pub hooks: Hooks,

    /// Current runlevel; INIT_LEVEL (S) during bootstrap.
    pub runlevel: u8,
    pub prevlevel: Option<u8>,
    /// Default target runlevel from the config file.
    pub cfglevel: u8,
    /// Override from the kernel command line, if any.
    pub cmdlevel: Option<u8>,
    pub debug: bool,

    /// Coalesced "step all services" request. Condition mutations set
    /// this instead of recursing into the state machines, so batched
    /// asserts within one stimulus are visible atomically to one sweep.
    pub pending_tick: bool,
    /// Set when the shutdown driver owns reaping; the monitor discards
    /// collected pids while this is up.
    pub sync_shutdown: bool,
}

impl Supervisor {
    #[must_use]
    pub fn new(config: Config) -> Self {
        let confdir = ConfDir::new(config.confdir.clone());
        let cfglevel = config.cfglevel;
        Self {
            config,
            confdir,
            registry: ServiceRegistry::new(),
            conds: CondStore::new(),
            timers: Timers::new(),
            sm: Sm::new(),
            hooks: Hooks::default(),
            runlevel: INIT_LEVEL,
            prevlevel: None,
            cfglevel,
            cmdlevel: None,
            debug: false,
            pending_tick: false,
            sync_shutdown: false,
        }
    }

    // ------------------------------------------------------------------
    // Condition plumbing. Mutations queue a step-all tick on the loop
    // rather than stepping services inline.
    // ------------------------------------------------------------------

    pub fn cond_assert(&mut self, key: &str) {
        if self.conds.assert(key) {
            self.pending_tick = true;
        }
    }

    pub fn cond_deassert(&mut self, key: &str) {
        if self.conds.deassert(key) {
            self.pending_tick = true;
        }
    }

    pub fn cond_set_flux(&mut self, key: &str) {
        if self.conds.set_flux(key) {
            self.pending_tick = true;
        }
    }

    pub fn cond_set_oneshot(&mut self, key: &str) {
        if self.conds.set_oneshot(key) {
            self.pending_tick = true;
        }
    }

    /// Run the queued sweep, if any.
    pub fn drain_tick(&mut self) {
        if self.pending_tick {
            self.pending_tick = false;
            trace!("Condition changes pending, stepping all services");
            self.step_all(kind_mask::ANY);
            sm::sm_step(self);
        }
    }

    // ------------------------------------------------------------------
    // Service sweeps and the public control operations.
    // ------------------------------------------------------------------

    pub fn step_all(&mut self, mask: u32) {
        for key in self.registry.keys_by_kind(mask) {
            services::service_step(self, &key);
        }
    }

    /// Change to a new runlevel. Stops everything not in `newlevel`,
    /// starts (or keeps) everything in it.
    pub fn service_runlevel(&mut self, newlevel: u8) {
        if newlevel > 9 {
            warn!("Ignoring request for invalid runlevel {newlevel}");
            return;
        }
        sm::sm_set_runlevel(self, newlevel);
        sm::sm_step(self);
    }

    /// SIGHUP / `telinit q` / control-plane reload.
    pub fn service_reload_dynamic(&mut self) {
        sm::sm_set_reload(self);
        sm::sm_step(self);
    }

    pub fn handle_timer(&mut self, event: TimerEvent) {
        match event {
            TimerEvent::SvcRetry(key) => {
                // the fired timer is spent; drop the handle before the
                // retry logic re-arms
                if let Some(svc) = self.registry.get_mut(&key) {
                    svc.timer = None;
                }
                services::service_retry(self, &key);
                sm::sm_step(self);
            }
            TimerEvent::SvcKill(key) => {
                if let Some(svc) = self.registry.get_mut(&key) {
                    svc.timer = None;
                }
                services::service_kill_timeout(self, &key);
            }
            TimerEvent::BootstrapTick => {
                sm::sm_check_bootstrap(self);
            }
        }
    }

    /// First config load at boot.
    pub fn load_services(&mut self) {
        let mut confdir = std::mem::take(&mut self.confdir);
        crate::conf::reload(&mut confdir, &mut self.registry);
        self.confdir = confdir;
        // initial load: everything is New, nothing is a leftover
        for svc in self.registry.iter_mut() {
            svc.seen = true;
        }
    }
}

/// Signals the supervisor owns. SIGALRM is claimed so stray alarms from
/// library code cannot kill PID 1; it is dispatched as a no-op.
const OWNED_SIGNALS: [libc::c_int; 8] = [
    libc::SIGCHLD,
    libc::SIGHUP,
    libc::SIGINT,
    libc::SIGTERM,
    libc::SIGUSR1,
    libc::SIGUSR2,
    libc::SIGPWR,
    libc::SIGALRM,
];

enum Source {
    Signals,
    Control,
    Fifo,
    Inetd(SvcKey),
}

/// The main loop: serialize timers, signals, control-plane requests and
/// inetd accepts onto this one thread, stepping the state machines after
/// each stimulus. Never returns; halt/reboot exits through the shutdown
/// module.
pub fn run(mut sup: Supervisor) -> ! {
    let sigpipe = match SignalPipe::setup(&OWNED_SIGNALS) {
        Ok(pipe) => pipe,
        Err(e) => unrecoverable_error(format!("Couldnt set up signal delivery: {e}")),
    };

    let control = match ControlSocket::open(&sup.config.control_socket) {
        Ok(control) => Some(control),
        Err(e) => {
            error!("Control socket unavailable: {e}");
            None
        }
    };
    let fifo = match Fifo::open(&sup.config.fifo) {
        Ok(fifo) => Some(fifo),
        Err(e) => {
            error!("Legacy fifo unavailable: {e}");
            None
        }
    };

    plugins::run_hooks(&mut sup, HookPhase::BasefsUp);

    sup.load_services();
    sm::sm_init(&mut sup);
    sm::sm_step(&mut sup);

    loop {
        sup.drain_tick();

        // inetd listeners live in the registry; re-collect them each
        // iteration since reloads may add or remove them
        let inetd_fds: Vec<(RawFd, SvcKey)> = sup
            .registry
            .iter()
            .filter(|svc| !svc.busy)
            .filter_map(|svc| {
                svc.listener
                    .as_ref()
                    .map(|l| (l.as_raw_fd(), svc.key.clone()))
            })
            .collect();

        let mut sources: Vec<(RawFd, Source)> = vec![(sigpipe.fd(), Source::Signals)];
        if let Some(control) = &control {
            sources.push((control.fd(), Source::Control));
        }
        if let Some(fifo) = &fifo {
            sources.push((fifo.fd(), Source::Fifo));
        }
        for (fd, key) in &inetd_fds {
            sources.push((*fd, Source::Inetd(key.clone())));
        }

        let poll_timeout = match sup.timers.poll_timeout_ms(Instant::now()) {
            Some(ms) => {
                let ms = ms.min(i32::MAX as u64) as i32;
                PollTimeout::try_from(ms).unwrap_or(PollTimeout::MAX)
            }
            None => PollTimeout::NONE,
        };

        let mut ready: Vec<usize> = Vec::new();
        {
            let mut pollfds: Vec<PollFd> = sources
                .iter()
                .map(|(fd, _)| {
                    PollFd::new(
                        unsafe { BorrowedFd::borrow_raw(*fd) },
                        PollFlags::POLLIN,
                    )
                })
                .collect();
            match nix::poll::poll(&mut pollfds, poll_timeout) {
                Ok(_) => {
                    for (i, pollfd) in pollfds.iter().enumerate() {
                        let revents = pollfd.revents().unwrap_or(PollFlags::empty());
                        if revents
                            .intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR)
                        {
                            ready.push(i);
                        }
                    }
                }
                Err(nix::errno::Errno::EINTR) => {}
                Err(e) => {
                    error!("poll failed: {e}");
                }
            }
        }

        for event in sup.timers.expired(Instant::now()) {
            sup.handle_timer(event);
        }

        for i in ready {
            match &sources[i].1 {
                Source::Signals => {
                    for signum in sigpipe.drain() {
                        signal_handler::dispatch_signal(&mut sup, signum);
                    }
                }
                Source::Control => {
                    if let Some(control) = &control {
                        control.handle(&mut sup);
                    }
                }
                Source::Fifo => {
                    if let Some(fifo) = &fifo {
                        fifo.handle(&mut sup);
                    }
                }
                Source::Inetd(key) => {
                    let key = key.clone();
                    crate::inetd::handle_readable(&mut sup, &key);
                }
            }
        }
    }
}

/// Last-ditch handling when the supervisor cannot continue. As PID 1 we
/// offer a rescue shell before giving up; as an ordinary process we just
/// panic.
pub fn unrecoverable_error(error: String) -> ! {
    if nix::unistd::getpid().as_raw() == 1 {
        eprintln!("Unrecoverable error: {error}");
        for shell in ["/bin/sh", "/sbin/sh", "/usr/bin/sh"] {
            if !std::path::Path::new(shell).exists() {
                continue;
            }
            if let Ok(mut child) = std::process::Command::new(shell).spawn() {
                let _ = child.wait();
            }
        }
        let dur = std::time::Duration::from_secs(10);
        eprintln!("No rescue shell left. Will exit after sleeping: {dur:?}");
        std::thread::sleep(dur);
        std::process::exit(1);
    } else {
        panic!("{}", error);
    }
}
