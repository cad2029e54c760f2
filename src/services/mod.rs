//! The per-service record and its state machine.

mod start;
mod step;

pub use start::{service_start, StartError};
pub use step::{
    service_enabled, service_kill_timeout, service_retry, service_step, service_timeout_after,
    service_timeout_cancel, TimerBusy, RESPAWN_MAX,
};

use std::path::PathBuf;
use std::time::SystemTime;

use crate::conditions::CondSpec;
use crate::eventloop::TimerId;
use crate::inetd::InetdConf;
use crate::signal_handler::ChildTermination;

/// Runlevel 'S', the reserved bootstrap level, is carried as bit 10 of the
/// runlevel bitmap next to the regular levels 0-9.
pub const INIT_LEVEL: u8 = 10;

/// Subset of runlevels {0..9, S} a service is allowed to run in.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct RunlevelMask(pub u16);

impl RunlevelMask {
    pub const EMPTY: Self = Self(0);
    /// Default for services declared without brackets: [2345].
    pub const DEFAULT: Self = Self(0b0011_1100);

    #[must_use]
    pub const fn contains(self, level: u8) -> bool {
        level <= INIT_LEVEL && self.0 & (1 << level) != 0
    }

    pub fn set(&mut self, level: u8) {
        if level <= INIT_LEVEL {
            self.0 |= 1 << level;
        }
    }

    pub fn clear(&mut self, level: u8) {
        if level <= INIT_LEVEL {
            self.0 &= !(1 << level);
        }
    }
}

impl std::fmt::Display for RunlevelMask {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        for level in 0..=INIT_LEVEL {
            if self.contains(level) {
                if level == INIT_LEVEL {
                    fmt.write_str("S")?;
                } else {
                    write!(fmt, "{level}")?;
                }
            }
        }
        Ok(())
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ServiceKind {
    /// Daemon, respawned when it exits.
    Service,
    /// One-shot, allowed to fail.
    Task,
    /// One-shot that blocks bootstrap until it has completed.
    Run,
    /// SysV style start/stop script, monitored like a daemon.
    Sysv,
    /// Inetd listener, no pid of its own.
    Inetd,
    /// A single accepted inetd connection, child of an Inetd record.
    InetdConn,
}

impl ServiceKind {
    #[must_use]
    pub const fn mask(self) -> u32 {
        match self {
            Self::Service => kind_mask::SERVICE,
            Self::Task => kind_mask::TASK,
            Self::Run => kind_mask::RUN,
            Self::Sysv => kind_mask::SYSV,
            Self::Inetd => kind_mask::INETD,
            Self::InetdConn => kind_mask::INETD_CONN,
        }
    }

    /// Daemons are respawned on exit; everything else is one-shot or
    /// connection scoped.
    #[must_use]
    pub const fn is_daemon(self) -> bool {
        matches!(self, Self::Service | Self::Sysv)
    }

    #[must_use]
    pub const fn is_oneshot(self) -> bool {
        matches!(self, Self::Task | Self::Run)
    }
}

pub mod kind_mask {
    pub const SERVICE: u32 = 1 << 0;
    pub const TASK: u32 = 1 << 1;
    pub const RUN: u32 = 1 << 2;
    pub const SYSV: u32 = 1 << 3;
    pub const INETD: u32 = 1 << 4;
    pub const INETD_CONN: u32 = 1 << 5;

    pub const RUNTASK: u32 = TASK | RUN;
    pub const RESPAWN: u32 = SERVICE | SYSV;
    pub const ANY: u32 = SERVICE | TASK | RUN | SYSV | INETD | INETD_CONN;
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum SvcState {
    /// Not running, not currently eligible to start.
    Halted,
    /// Eligible, waiting for conditions to come On.
    Ready,
    /// Pid alive, conditions On.
    Running,
    /// Pid alive but SIGSTOPped because conditions went Flux.
    Waiting,
    /// SIGTERM sent, waiting for the reap or the forced kill.
    Stopping,
    /// One-shot completed, pending cleanup.
    Done,
}

impl std::fmt::Display for SvcState {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.write_str(match self {
            Self::Halted => "halted",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Waiting => "waiting",
            Self::Stopping => "stopping",
            Self::Done => "done",
        })
    }
}

/// Why a service is kept from starting, if anything.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Block {
    None,
    /// Operator said stop/disable via the control plane.
    Manual,
    /// Exhausted its respawn budget.
    Crashing,
    /// Between crash and the scheduled retry.
    Restarting,
    /// The binary does not exist on disk.
    Missing,
}

/// Dirty marker maintained across config reloads.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Dirty {
    Clean,
    New,
    Changed,
    /// Config line disappeared; record is collected in the clean phase.
    Removed,
}

/// Registry key: (command path, instance id). The id defaults to 1 and
/// lets the same command be registered multiple times, e.g. one DHCP
/// client per interface.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct SvcKey {
    pub cmd: PathBuf,
    pub id: u32,
}

impl SvcKey {
    #[must_use]
    pub fn new(cmd: impl Into<PathBuf>, id: u32) -> Self {
        Self {
            cmd: cmd.into(),
            id,
        }
    }

    /// Short identity for log lines and the control plane: the command
    /// basename, with `:id` appended for ids other than 1.
    #[must_use]
    pub fn ident(&self) -> String {
        let base = self
            .cmd
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.cmd.to_string_lossy().into_owned());
        if self.id == 1 {
            base
        } else {
            format!("{base}:{}", self.id)
        }
    }
}

impl std::fmt::Display for SvcKey {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.write_str(&self.ident())
    }
}

pub struct Service {
    pub key: SvcKey,
    pub kind: ServiceKind,
    /// argv\[1..\]; argv\[0\] is always the command path itself.
    pub args: Vec<String>,
    pub desc: String,
    pub username: Option<String>,
    pub group: Option<String>,
    pub runlevels: RunlevelMask,
    pub conds: Vec<CondSpec>,
    /// Service understands SIGHUP for config reload; without it a dirty
    /// running service is stopped and started instead.
    pub sighup: bool,
    /// Pipe child stdout/stderr to the system logger.
    pub log: bool,

    pub state: SvcState,
    pub pid: Option<nix::unistd::Pid>,
    pub restart_counter: u32,
    pub block: Block,
    pub dirty: Dirty,
    /// Waiting for the service to create or re-touch its pidfile; the
    /// external pidfile watcher asserts the identity condition and clears
    /// this.
    pub starting: bool,
    /// At most one armed timer per service.
    pub timer: Option<TimerId>,
    pub last_exit: Option<ChildTermination>,
    /// Set once the service has been started at least once this runlevel;
    /// bootstrap completion and RUN once-semantics key off this.
    pub started_once: bool,
    /// Modification time of the originating config file.
    pub mtime: Option<SystemTime>,
    /// Survived the last re-parse. Cleared before a reload, set again by
    /// `register`; still-cleared records are marked Removed afterwards.
    pub seen: bool,

    /// Inetd listener configuration, for kind Inetd only.
    pub inetd: Option<InetdConf>,
    /// Open listening socket of an Inetd record. Not part of the config
    /// compare on reload.
    pub listener: Option<std::net::TcpListener>,
    /// A wait-style inetd listener is busy while its child runs.
    pub busy: bool,
    /// Parent Inetd record, for kind InetdConn only. Held as a key, not a
    /// reference; validated on each use.
    pub parent: Option<SvcKey>,
    /// Accepted connection socket to become the child's stdio.
    pub stdin_fd: Option<std::os::unix::io::RawFd>,
}

impl Service {
    #[must_use]
    pub fn new(key: SvcKey, kind: ServiceKind) -> Self {
        Self {
            key,
            kind,
            args: Vec::new(),
            desc: String::new(),
            username: None,
            group: None,
            runlevels: RunlevelMask::DEFAULT,
            conds: Vec::new(),
            sighup: false,
            log: false,
            state: SvcState::Halted,
            pid: None,
            restart_counter: 0,
            block: Block::None,
            dirty: Dirty::New,
            starting: false,
            timer: None,
            last_exit: None,
            started_once: false,
            mtime: None,
            seen: true,
            inetd: None,
            listener: None,
            busy: false,
            parent: None,
            stdin_fd: None,
        }
    }

    /// Config changed since the last start, one way or another.
    #[must_use]
    pub const fn is_changed(&self) -> bool {
        matches!(self.dirty, Dirty::New | Dirty::Changed)
    }

    #[must_use]
    pub const fn is_removed(&self) -> bool {
        matches!(self.dirty, Dirty::Removed)
    }

    #[must_use]
    pub const fn is_blocked(&self) -> bool {
        !matches!(self.block, Block::None)
    }

    pub fn mark_clean(&mut self) {
        self.dirty = Dirty::Clean;
    }
}
