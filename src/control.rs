//! The control plane: a unix stream socket speaking length-prefixed
//! requests. Each request is one verb plus an optional argument; the
//! response is a length-prefixed text record followed by a single status
//! byte which doubles as the client's exit code.

use std::io::{Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, warn};
use nix::sys::signal::{kill, Signal};

use crate::services::{self, Block, ServiceKind, SvcKey};
use crate::supervisor::Supervisor;

pub const EXIT_OK: u8 = 0;
pub const EXIT_FAIL: u8 = 1;
pub const EXIT_NOENT: u8 = 2;
pub const EXIT_PERM: u8 = 3;
pub const EXIT_TIMEOUT: u8 = 4;

/// Clients that go quiet mid-request get this long before we give up on
/// them; PID 1 cannot afford to block on a stuck client.
const CLIENT_TIMEOUT: Duration = Duration::from_millis(500);

const MAX_REQUEST: u32 = 64 * 1024;

pub struct ControlSocket {
    listener: UnixListener,
    _path: PathBuf,
}

impl ControlSocket {
    pub fn open(path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        let listener = UnixListener::bind(path)?;
        listener.set_nonblocking(true)?;
        Ok(Self {
            listener,
            _path: path.to_path_buf(),
        })
    }

    #[must_use]
    pub fn fd(&self) -> RawFd {
        self.listener.as_raw_fd()
    }

    /// Accept and serve every pending connection.
    pub fn handle(&self, sup: &mut Supervisor) {
        loop {
            match self.listener.accept() {
                Ok((stream, _addr)) => handle_conn(sup, stream),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!("Control socket accept failed: {e}");
                    break;
                }
            }
        }
    }
}

fn handle_conn(sup: &mut Supervisor, mut stream: UnixStream) {
    let _ = stream.set_read_timeout(Some(CLIENT_TIMEOUT));
    let _ = stream.set_write_timeout(Some(CLIENT_TIMEOUT));

    let (text, code) = match read_request(&mut stream) {
        Ok(request) => {
            debug!("Control request: {request}");
            process_request(sup, &request)
        }
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
            (String::new(), EXIT_TIMEOUT)
        }
        Err(e) => {
            warn!("Bad control request: {e}");
            (format!("bad request: {e}"), EXIT_FAIL)
        }
    };

    if let Err(e) = write_response(&mut stream, &text, code) {
        debug!("Client went away before the response: {e}");
    }
}

/// Wire format helpers, shared with the client side.
pub fn read_request(reader: &mut impl Read) -> std::io::Result<String> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf)?;
    let len = u32::from_le_bytes(len_buf);
    if len > MAX_REQUEST {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "request too large",
        ));
    }
    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload)?;
    String::from_utf8(payload)
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidData, "request not utf-8"))
}

pub fn write_response(writer: &mut impl Write, text: &str, code: u8) -> std::io::Result<()> {
    writer.write_all(&(text.len() as u32).to_le_bytes())?;
    writer.write_all(text.as_bytes())?;
    writer.write_all(&[code])?;
    writer.flush()
}

pub fn encode_request(request: &str) -> Vec<u8> {
    let mut buf = (request.len() as u32).to_le_bytes().to_vec();
    buf.extend_from_slice(request.as_bytes());
    buf
}

pub fn decode_response(reader: &mut impl Read) -> std::io::Result<(String, u8)> {
    let text = read_request(reader)?;
    let mut code = [0u8; 1];
    reader.read_exact(&mut code)?;
    Ok((text, code[0]))
}

#[derive(serde::Serialize)]
struct SvcStatus {
    ident: String,
    cmd: String,
    id: u32,
    kind: &'static str,
    state: String,
    pid: i32,
    restarts: u32,
    block: String,
    runlevels: String,
    starting: bool,
    desc: String,
}

fn kind_str(kind: ServiceKind) -> &'static str {
    match kind {
        ServiceKind::Service => "service",
        ServiceKind::Task => "task",
        ServiceKind::Run => "run",
        ServiceKind::Sysv => "sysv",
        ServiceKind::Inetd => "inetd",
        ServiceKind::InetdConn => "inetd-conn",
    }
}

fn status_json(sup: &Supervisor, filter: Option<&SvcKey>) -> String {
    let rows: Vec<SvcStatus> = sup
        .registry
        .iter()
        .filter(|svc| filter.map(|key| svc.key == *key).unwrap_or(true))
        .map(|svc| SvcStatus {
            ident: svc.key.ident(),
            cmd: svc.key.cmd.to_string_lossy().into_owned(),
            id: svc.key.id,
            kind: kind_str(svc.kind),
            state: format!("{}", svc.state),
            pid: svc.pid.map_or(0, |p| p.as_raw()),
            restarts: svc.restart_counter,
            block: format!("{:?}", svc.block).to_lowercase(),
            runlevels: format!("{}", svc.runlevels),
            starting: svc.starting,
            desc: svc.desc.clone(),
        })
        .collect();
    serde_json::to_string_pretty(&rows).unwrap_or_else(|_| "[]".to_string())
}

/// Map a verb onto the supervision core. Verbs act through the same
/// operations the state machines use internally, so control-plane and
/// signal stimuli cannot disagree.
pub fn process_request(sup: &mut Supervisor, request: &str) -> (String, u8) {
    let mut parts = request.splitn(2, ' ');
    let verb = parts.next().unwrap_or("");
    let arg = parts.next().map(str::trim).unwrap_or("");

    match verb {
        "status" => {
            if arg.is_empty() {
                (status_json(sup, None), EXIT_OK)
            } else {
                match sup.registry.key_by_name(arg) {
                    Some(key) => (status_json(sup, Some(&key)), EXIT_OK),
                    None => (format!("no such service: {arg}"), EXIT_NOENT),
                }
            }
        }

        "start" | "enable" => with_service(sup, arg, |sup, key| {
            if let Some(svc) = sup.registry.get_mut(key) {
                svc.block = Block::None;
                svc.restart_counter = 0;
            }
            services::service_step(sup, key);
            (String::new(), EXIT_OK)
        }),

        "stop" | "disable" => with_service(sup, arg, |sup, key| {
            if let Some(svc) = sup.registry.get_mut(key) {
                svc.block = Block::Manual;
            }
            services::service_step(sup, key);
            (String::new(), EXIT_OK)
        }),

        "restart" => with_service(sup, arg, |sup, key| {
            let pid = sup.registry.get(key).and_then(|svc| svc.pid);
            if let Some(svc) = sup.registry.get_mut(key) {
                svc.block = Block::None;
            }
            match pid {
                Some(pid) => {
                    // terminate; the monitor restarts it on collection
                    if let Err(e) = kill(pid, Signal::SIGTERM) {
                        return (format!("could not signal pid {pid}: {e}"), EXIT_FAIL);
                    }
                    (String::new(), EXIT_OK)
                }
                None => {
                    services::service_step(sup, key);
                    (String::new(), EXIT_OK)
                }
            }
        }),

        "reload" => {
            sup.service_reload_dynamic();
            (String::new(), EXIT_OK)
        }

        "runlevel" => match arg.parse::<u8>() {
            Ok(level) if level <= 9 => {
                sup.service_runlevel(level);
                (String::new(), EXIT_OK)
            }
            Ok(level) => (format!("runlevel {level} not permitted"), EXIT_PERM),
            Err(_) => (format!("bad runlevel: {arg}"), EXIT_FAIL),
        },

        "emit" => {
            if arg.is_empty() {
                ("emit needs a condition".to_string(), EXIT_FAIL)
            } else if let Some(cond) = arg.strip_prefix('-') {
                sup.cond_deassert(cond);
                (String::new(), EXIT_OK)
            } else if let Some(cond) = arg.strip_prefix('~') {
                sup.cond_set_flux(cond);
                (String::new(), EXIT_OK)
            } else {
                sup.cond_assert(arg);
                (String::new(), EXIT_OK)
            }
        }

        other => (format!("unknown verb: {other}"), EXIT_FAIL),
    }
}

fn with_service(
    sup: &mut Supervisor,
    name: &str,
    action: impl FnOnce(&mut Supervisor, &SvcKey) -> (String, u8),
) -> (String, u8) {
    if name.is_empty() {
        return ("missing service name".to_string(), EXIT_FAIL);
    }
    match sup.registry.key_by_name(name) {
        Some(key) => action(sup, &key),
        None => (format!("no such service: {name}"), EXIT_NOENT),
    }
}
