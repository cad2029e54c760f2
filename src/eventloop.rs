//! Single-threaded event plumbing: millisecond timers with cancellation
//! handles and self-pipe signal delivery.
//!
//! Everything the supervisor reacts to is serialized through one
//! `nix::poll` call per iteration: the signal pipe, the control socket,
//! the legacy fifo and any inetd listeners, with the poll timeout derived
//! from the earliest pending timer. Callbacks therefore run mutually
//! exclusive on the loop thread; there is no shared mutable state to lock.

use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};
use std::time::{Duration, Instant};

use log::warn;

use crate::services::SvcKey;

/// Opaque cancellation handle for a pending timer.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct TimerId(u64);

/// What to do when a timer fires. Kept as plain data instead of closures
/// so the supervisor can be borrowed mutably while timers are pending.
#[derive(Clone, Eq, PartialEq, Debug)]
pub enum TimerEvent {
    /// Respawn-throttle retry for a crashed service.
    SvcRetry(SvcKey),
    /// Kill escalation: the service did not exit within the grace period.
    SvcKill(SvcKey),
    /// One-second bootstrap progress check.
    BootstrapTick,
}

struct TimerEntry {
    id: TimerId,
    deadline: Instant,
    event: TimerEvent,
}

#[derive(Default)]
pub struct Timers {
    next_id: u64,
    entries: Vec<TimerEntry>,
}

impl Timers {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm a relative one-shot timer.
    pub fn after(&mut self, timeout: Duration, event: TimerEvent) -> TimerId {
        self.next_id += 1;
        let id = TimerId(self.next_id);
        self.entries.push(TimerEntry {
            id,
            deadline: Instant::now() + timeout,
            event,
        });
        id
    }

    /// Cancel by handle. Idempotent: cancelling a fired or already
    /// cancelled timer is a no-op.
    pub fn cancel(&mut self, id: TimerId) {
        self.entries.retain(|e| e.id != id);
    }

    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.iter().map(|e| e.deadline).min()
    }

    /// Poll timeout in milliseconds until the next deadline; None means
    /// the loop may block indefinitely.
    #[must_use]
    pub fn poll_timeout_ms(&self, now: Instant) -> Option<u64> {
        self.next_deadline()
            .map(|deadline| deadline.saturating_duration_since(now).as_millis() as u64)
    }

    /// Collect all timers due at `now`. Missed ticks collapse naturally:
    /// a timer that is long overdue still fires exactly once.
    pub fn expired(&mut self, now: Instant) -> Vec<TimerEvent> {
        let mut due = Vec::new();
        let mut keep = Vec::new();
        for entry in self.entries.drain(..) {
            if entry.deadline <= now {
                due.push((entry.deadline, entry.event));
            } else {
                keep.push(entry);
            }
        }
        self.entries = keep;
        // fire in deadline order
        due.sort_by_key(|(deadline, _)| *deadline);
        due.into_iter().map(|(_, event)| event).collect()
    }

    #[must_use]
    pub fn pending(&self) -> usize {
        self.entries.len()
    }
}

/// Self-pipe signal delivery. The async handler does exactly two
/// async-signal-safe things: set an atomic flag for the signal and write a
/// wakeup byte into a pipe. The loop thread reads the byte back out,
/// swaps the flags and does the real work; no supervisor logic ever runs
/// in signal context.
pub struct SignalPipe {
    read_end: OwnedFd,
    _write_end: OwnedFd,
    flags: Vec<(libc::c_int, std::sync::Arc<std::sync::atomic::AtomicBool>)>,
}

impl SignalPipe {
    /// Register flag and wakeup pipe for every signal the supervisor owns.
    pub fn setup(signals: &[libc::c_int]) -> Result<Self, std::io::Error> {
        let (read_end, write_end) = nix::unistd::pipe().map_err(std::io::Error::from)?;
        set_nonblocking(read_end.as_raw_fd())?;
        set_nonblocking(write_end.as_raw_fd())?;
        let mut flags = Vec::new();
        for &signum in signals {
            let flag = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
            signal_hook::flag::register(signum, flag.clone())?;
            signal_hook::low_level::pipe::register_raw(signum, write_end.try_clone()?)?;
            flags.push((signum, flag));
        }
        Ok(Self {
            read_end,
            _write_end: write_end,
            flags,
        })
    }

    #[must_use]
    pub fn fd(&self) -> RawFd {
        self.read_end.as_raw_fd()
    }

    /// Drain the wakeup pipe and return the signals that arrived since the
    /// last call. Multiple deliveries of one signal coalesce; the handlers
    /// re-check actual state (e.g. SIGCHLD reaps in a loop) so nothing is
    /// lost.
    pub fn drain(&self) -> Vec<libc::c_int> {
        let mut buf = [0u8; 64];
        loop {
            match nix::unistd::read(&self.read_end, &mut buf) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(nix::errno::Errno::EAGAIN) => break,
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => {
                    warn!("Error draining signal pipe: {e}");
                    break;
                }
            }
        }
        self.flags
            .iter()
            .filter(|(_, flag)| flag.swap(false, std::sync::atomic::Ordering::SeqCst))
            .map(|(signum, _)| *signum)
            .collect()
    }
}

pub fn set_nonblocking(fd: RawFd) -> Result<(), std::io::Error> {
    // F_SETFL via libc; nix's fcntl wants an OwnedFd here and we only
    // borrow.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(std::io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}
