//! Forking and exec'ing service processes.
//!
//! Everything the child needs — argv, environment, credentials, stdio
//! file descriptors — is prepared before the fork. The child half only
//! makes async-signal-safe calls and exits with `_exit(1)` on any
//! failure; it never returns into the supervisor's stack.

use std::ffi::CString;
use std::os::unix::io::RawFd;
use std::path::Path;

use log::{debug, error, warn};
use nix::sys::signal::{sigprocmask, SigSet, Signal, SigmaskHow};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};

use crate::platform::{self, Creds};
use crate::plugins::{self, HookPhase};
use crate::services::{Block, ServiceKind, SvcKey};
use crate::signal_handler::ChildTermination;
use crate::supervisor::Supervisor;

#[derive(Clone, Eq, PartialEq, Debug)]
pub enum StartError {
    /// Binary does not exist; the record is blocked MISSING.
    Missing,
    /// Respawns are administratively suspended (norespawn marker file).
    Suspended,
    /// Could not resolve the configured user or group.
    BadUser(String),
    Fork(String),
    Listener(String),
}

impl std::fmt::Display for StartError {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        let msg = match self {
            Self::Missing => "executable does not exist".to_string(),
            Self::Suspended => "respawn suspended by norespawn marker".to_string(),
            Self::BadUser(e) => format!("could not resolve user/group: {e}"),
            Self::Fork(e) => format!("fork failed: {e}"),
            Self::Listener(e) => format!("could not open inetd listener: {e}"),
        };
        fmt.write_str(&msg)
    }
}

/// An operator can park the whole respawn machinery by touching one of
/// these, e.g. to replace binaries on a live box.
fn is_norespawn() -> bool {
    Path::new("/mnt/norespawn").exists() || Path::new("/tmp/norespawn").exists()
}

/// How the child wires up fds 0/1/2 before exec.
enum ChildStdio {
    DevNull,
    /// Write end of a pipe drained by a forked `logger`.
    Logger(RawFd, RawFd),
    /// Accepted inetd connection socket.
    Socket(RawFd),
    Console(CString),
}

struct ChildContext {
    cmd: CString,
    argv: Vec<CString>,
    env: Vec<CString>,
    creds: Option<Creds>,
    home: Option<CString>,
    stdio: ChildStdio,
    logger_argv: Vec<CString>,
}

pub fn service_start(sup: &mut Supervisor, key: &SvcKey) -> Result<(), StartError> {
    let (kind, cmd, desc) = match sup.registry.get(key) {
        Some(svc) => (svc.kind, svc.key.cmd.clone(), svc.desc.clone()),
        None => return Ok(()),
    };

    if kind == ServiceKind::Inetd {
        return crate::inetd::listener_start(sup, key).map_err(StartError::Listener);
    }

    // don't try to start a service whose binary doesn't exist
    if !cmd.exists() {
        error!("Service {} does not exist!", cmd.display());
        if let Some(name) = cmd.file_name() {
            if let Ok(found) = which::which(name) {
                error!("A binary of that name is installed at {}", found.display());
            }
        }
        if let Some(svc) = sup.registry.get_mut(key) {
            svc.block = Block::Missing;
        }
        return Err(StartError::Missing);
    }

    if is_norespawn() {
        return Err(StartError::Suspended);
    }

    debug!("Starting {key}: {desc}");

    let ctx = prepare_child(sup, key)?;

    // Crash-window guard: block SIGCHLD while forking so the child cannot
    // be reaped before its pid is recorded. The child resets its mask.
    let mut block_mask = SigSet::empty();
    block_mask.add(Signal::SIGCHLD);
    let mut old_mask = SigSet::empty();
    if let Err(e) = sigprocmask(
        SigmaskHow::SIG_BLOCK,
        Some(&block_mask),
        Some(&mut old_mask),
    ) {
        return Err(StartError::Fork(format!("sigprocmask: {e}")));
    }

    let fork_result = unsafe { fork() };
    let result = match fork_result {
        Ok(ForkResult::Parent { child }) => {
            after_fork_parent(sup, key, child, &ctx);
            Ok(())
        }
        Ok(ForkResult::Child) => {
            after_fork_child(&ctx);
        }
        Err(e) => {
            error!("Fork for service {key} failed with: {e}");
            Err(StartError::Fork(format!("{e}")))
        }
    };

    if let Err(e) = sigprocmask(SigmaskHow::SIG_SETMASK, Some(&old_mask), None) {
        warn!("Could not restore signal mask after fork: {e}");
    }

    result
}

/// Everything allocated up front, while it is still safe to allocate.
fn prepare_child(sup: &Supervisor, key: &SvcKey) -> Result<ChildContext, StartError> {
    let svc = sup.registry.get(key).ok_or(StartError::Missing)?;

    let creds = match &svc.username {
        Some(user) => Some(
            platform::resolve_user(user, svc.group.as_deref()).map_err(StartError::BadUser)?,
        ),
        None => None,
    };

    let cmd = cstring(&svc.key.cmd.to_string_lossy());
    let mut argv = vec![cmd.clone()];
    argv.extend(svc.args.iter().map(|a| cstring(a)));

    // Root keeps the standard path; unprivileged services get the user
    // default. HOME is set when the user database knows one.
    let path = match &creds {
        Some(creds) if !creds.uid.is_root() => "/usr/local/bin:/bin:/usr/bin",
        _ => "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin",
    };
    let mut env = vec![cstring(&format!("PATH={path}"))];
    let home = creds.as_ref().and_then(|c| c.home.clone());
    if let Some(home) = &home {
        env.push(cstring(&format!("HOME={home}")));
    }
    let home = home.map(|h| cstring(&h));

    let stdio = if svc.kind == ServiceKind::InetdConn {
        match svc.stdin_fd {
            Some(fd) => ChildStdio::Socket(fd),
            None => ChildStdio::DevNull,
        }
    } else if svc.log {
        let (read_end, write_end) = nix::unistd::pipe()
            .map_err(|e| StartError::Fork(format!("log pipe: {e}")))?;
        use std::os::unix::io::IntoRawFd;
        ChildStdio::Logger(read_end.into_raw_fd(), write_end.into_raw_fd())
    } else if sup.debug {
        ChildStdio::Console(cstring(&sup.config.console.to_string_lossy()))
    } else {
        ChildStdio::DevNull
    };

    let ident = svc.key.ident();
    let logger_argv = vec![
        cstring("logger"),
        cstring("-t"),
        cstring(&ident),
        cstring("-p"),
        cstring("daemon.info"),
    ];

    Ok(ChildContext {
        cmd,
        argv,
        env,
        creds,
        home,
        stdio,
        logger_argv,
    })
}

fn cstring(s: &str) -> CString {
    let mut bytes = s.as_bytes().to_vec();
    bytes.retain(|&b| b != 0);
    // cannot fail, interior NULs were just stripped
    CString::new(bytes).expect("NUL-free bytes")
}

fn after_fork_parent(sup: &mut Supervisor, key: &SvcKey, child: Pid, ctx: &ChildContext) {
    // close our copies of fds handed to the child
    match &ctx.stdio {
        ChildStdio::Logger(read_end, write_end) => unsafe {
            libc::close(*read_end);
            libc::close(*write_end);
        },
        ChildStdio::Socket(fd) => unsafe {
            libc::close(*fd);
        },
        _ => {}
    }

    let mut blocking_run = false;
    if let Some(svc) = sup.registry.get_mut(key) {
        svc.pid = Some(child);
        svc.starting = true;
        svc.started_once = true;
        svc.stdin_fd = None;
        blocking_run = svc.kind == ServiceKind::Run;
        debug!("Started {} as pid {child}", svc.key);
    }

    crate::cgroups::service_cgroup(&key.ident(), child);
    plugins::run_hooks(sup, HookPhase::SvcStart);

    // RUN commands execute in sequence: they block bootstrap (and any
    // runlevel change) until they have completed.
    if blocking_run {
        let termination = match waitpid(child, None) {
            Ok(WaitStatus::Exited(_, code)) => Some(ChildTermination::Exit(code)),
            Ok(WaitStatus::Signaled(_, sig, _)) => Some(ChildTermination::Signal(sig)),
            Ok(status) => {
                warn!("Unexpected wait status for run command {key}: {status:?}");
                None
            }
            Err(e) => {
                warn!("Could not wait for run command {key}: {e}");
                None
            }
        };
        if let Some(svc) = sup.registry.get_mut(key) {
            svc.pid = None;
            svc.last_exit = termination;
        }
    }
}

/// The child half. Only async-signal-safe calls from here on; any failure
/// ends in `_exit(1)`.
fn after_fork_child(ctx: &ChildContext) -> ! {
    unsafe {
        // start from a clean signal mask, the parent had SIGCHLD blocked
        let empty = SigSet::empty();
        let _ = sigprocmask(SigmaskHow::SIG_SETMASK, Some(&empty), None);
        let _ = nix::unistd::setsid();

        match &ctx.stdio {
            ChildStdio::Socket(fd) => {
                libc::dup2(*fd, libc::STDIN_FILENO);
                libc::close(*fd);
                libc::dup2(libc::STDIN_FILENO, libc::STDOUT_FILENO);
                libc::dup2(libc::STDIN_FILENO, libc::STDERR_FILENO);
            }
            ChildStdio::Logger(read_end, write_end) => {
                // fork the logger first so it inherits the read end
                match fork() {
                    Ok(ForkResult::Child) => {
                        libc::close(*write_end);
                        libc::dup2(*read_end, libc::STDIN_FILENO);
                        libc::close(*read_end);
                        let argv: Vec<*const libc::c_char> = ctx
                            .logger_argv
                            .iter()
                            .map(|a| a.as_ptr())
                            .chain(std::iter::once(std::ptr::null()))
                            .collect();
                        libc::execvp(ctx.logger_argv[0].as_ptr(), argv.as_ptr());
                        libc::_exit(0);
                    }
                    Ok(ForkResult::Parent { .. }) | Err(_) => {}
                }
                libc::close(*read_end);
                libc::dup2(*write_end, libc::STDOUT_FILENO);
                libc::dup2(*write_end, libc::STDERR_FILENO);
                libc::close(*write_end);
                redirect_stdin_devnull();
            }
            ChildStdio::Console(console) => {
                let fd = libc::open(console.as_ptr(), libc::O_WRONLY | libc::O_APPEND);
                if fd >= 0 {
                    libc::dup2(fd, libc::STDOUT_FILENO);
                    libc::dup2(fd, libc::STDERR_FILENO);
                    libc::close(fd);
                }
                redirect_stdin_devnull();
            }
            ChildStdio::DevNull => {
                let fd = libc::open(b"/dev/null\0".as_ptr().cast(), libc::O_RDWR);
                if fd >= 0 {
                    libc::dup2(fd, libc::STDIN_FILENO);
                    libc::dup2(fd, libc::STDOUT_FILENO);
                    libc::dup2(fd, libc::STDERR_FILENO);
                    if fd > libc::STDERR_FILENO {
                        libc::close(fd);
                    }
                }
            }
        }

        if let Some(creds) = &ctx.creds {
            if platform::drop_privileges(creds).is_err() {
                libc::_exit(1);
            }
            if let Some(home) = &ctx.home {
                let _ = libc::chdir(home.as_ptr());
            }
        }

        let argv: Vec<*const libc::c_char> = ctx
            .argv
            .iter()
            .map(|a| a.as_ptr())
            .chain(std::iter::once(std::ptr::null()))
            .collect();
        let envp: Vec<*const libc::c_char> = ctx
            .env
            .iter()
            .map(|e| e.as_ptr())
            .chain(std::iter::once(std::ptr::null()))
            .collect();
        libc::execve(ctx.cmd.as_ptr(), argv.as_ptr(), envp.as_ptr());
        // only reached if execve fails
        libc::_exit(1);
    }
}

unsafe fn redirect_stdin_devnull() {
    let fd = libc::open(b"/dev/null\0".as_ptr().cast(), libc::O_RDONLY);
    if fd >= 0 {
        libc::dup2(fd, libc::STDIN_FILENO);
        if fd > libc::STDERR_FILENO {
            libc::close(fd);
        }
    }
}
