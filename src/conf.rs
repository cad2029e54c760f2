//! Parsing of service declaration lines and the drop-in config directory.
//!
//! This is the parse boundary: everything behind it hands strongly typed
//! `Service` records to the registry. Malformed lines are rejected here
//! with an error; the supervision core never sees them.
//!
//! Line forms:
//!
//! ```text
//! service [@user[:group]] [runlevels] [<conditions>] [:id] [log] /path arg... -- description
//! task    ...
//! run     ...
//! sysv    ...
//! inetd   svc/proto[@ifaces] {nowait|wait} [runlevels] [@user] /path ... -- description
//! ```
//!
//! Runlevels are `[2345]` or `[!0-6,S]` (leading `!` inverts the set).
//! Conditions are `<cond1,!cond2,...>`; a `!` prefix negates the gate. A
//! bare `!` entry declares that the service does not understand SIGHUP
//! and must be stop/started on reconfiguration instead.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::SystemTime;

use log::{debug, warn};

use crate::conditions::CondSpec;
use crate::inetd::InetdConf;
use crate::services::{RunlevelMask, Service, ServiceKind, SvcKey, INIT_LEVEL};

#[derive(Clone, Eq, PartialEq, Debug)]
pub enum ConfError {
    Incomplete(String),
    BadRunlevels(String),
    BadId(String),
    BadInetd(String),
    UnknownKind(String),
    Io(String),
}

impl std::fmt::Display for ConfError {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        let msg = match self {
            Self::Incomplete(line) => format!("Incomplete service line: {line}"),
            Self::BadRunlevels(tok) => format!("Bad runlevel spec: {tok}"),
            Self::BadId(tok) => format!("Bad instance id: {tok}"),
            Self::BadInetd(tok) => format!("Bad inetd service spec: {tok}"),
            Self::UnknownKind(tok) => format!("Unknown service kind: {tok}"),
            Self::Io(e) => format!("Config io error: {e}"),
        };
        fmt.write_str(&msg)
    }
}

/// A fully parsed declaration, ready to become a registry record.
#[derive(Debug)]
pub struct ServiceLine {
    pub kind: ServiceKind,
    pub username: Option<String>,
    pub group: Option<String>,
    pub runlevels: RunlevelMask,
    pub conds: Vec<CondSpec>,
    pub sighup: bool,
    pub id: Option<u32>,
    pub log: bool,
    pub cmd: PathBuf,
    pub args: Vec<String>,
    pub desc: String,
    pub inetd: Option<InetdConf>,
}

impl ServiceLine {
    /// Build the registry record. `fallback_id` is used when the line
    /// carried no explicit `:id`.
    #[must_use]
    pub fn into_service(self, fallback_id: u32) -> Service {
        let key = SvcKey::new(self.cmd, self.id.unwrap_or(fallback_id));
        let mut svc = Service::new(key, self.kind);
        svc.username = self.username;
        svc.group = self.group;
        svc.runlevels = self.runlevels;
        svc.conds = self.conds;
        svc.sighup = self.sighup;
        svc.log = self.log;
        svc.args = self.args;
        svc.desc = self.desc;
        svc.inetd = self.inetd;
        svc
    }
}

pub fn parse_line(raw: &str) -> Result<ServiceLine, ConfError> {
    // Description is everything after the first " -- ".
    let (line, desc) = match raw.find("-- ") {
        Some(pos) => (&raw[..pos], raw[pos + 3..].trim().to_string()),
        None => (raw, String::new()),
    };

    let tokens =
        shlex::split(line.trim()).ok_or_else(|| ConfError::Incomplete(raw.to_string()))?;
    let mut tokens = tokens.into_iter();

    let kind_tok = tokens
        .next()
        .ok_or_else(|| ConfError::Incomplete(raw.to_string()))?;
    let kind = match kind_tok.as_str() {
        "service" => ServiceKind::Service,
        "task" => ServiceKind::Task,
        "run" => ServiceKind::Run,
        "sysv" => ServiceKind::Sysv,
        "inetd" => ServiceKind::Inetd,
        other => return Err(ConfError::UnknownKind(other.to_string())),
    };

    let mut username = None;
    let mut group = None;
    let mut runlevels = RunlevelMask::DEFAULT;
    let mut conds = Vec::new();
    let mut sighup = true;
    let mut id = None;
    let mut log = false;
    let mut inetd_svc: Option<String> = None;
    let mut inetd_wait = false;
    let mut cmd: Option<PathBuf> = None;

    for tok in tokens.by_ref() {
        if let Some(user_tok) = tok.strip_prefix('@') {
            match user_tok.split_once(':') {
                Some((user, grp)) => {
                    username = Some(user.to_string());
                    group = Some(grp.to_string());
                }
                None => username = Some(user_tok.to_string()),
            }
        } else if tok.starts_with('[') {
            runlevels = parse_runlevels(&tok)?;
        } else if tok.starts_with('<') {
            let (parsed, hup) = parse_conds(&tok);
            conds = parsed;
            sighup = hup;
        } else if let Some(id_tok) = tok.strip_prefix(':') {
            id = Some(
                id_tok
                    .parse::<u32>()
                    .ok()
                    .filter(|&n| n >= 1)
                    .ok_or_else(|| ConfError::BadId(tok.clone()))?,
            );
        } else if tok == "log" {
            log = true;
        } else if kind == ServiceKind::Inetd && (tok == "nowait" || tok == "wait") {
            inetd_wait = tok == "wait";
        } else if kind == ServiceKind::Inetd && !tok.starts_with('/') && tok.contains('/') {
            // e.g. ssh/tcp@eth0,!eth1 or 2222/tcp
            inetd_svc = Some(tok);
        } else {
            cmd = Some(PathBuf::from(tok));
            break;
        }
    }

    let cmd = cmd.ok_or_else(|| ConfError::Incomplete(raw.to_string()))?;
    let args: Vec<String> = tokens.collect();

    let inetd = match (kind, inetd_svc) {
        (ServiceKind::Inetd, Some(spec)) => Some(InetdConf::parse(&spec, inetd_wait)?),
        (ServiceKind::Inetd, None) => {
            return Err(ConfError::BadInetd(raw.to_string()));
        }
        _ => None,
    };

    Ok(ServiceLine {
        kind,
        username,
        group,
        runlevels,
        conds,
        sighup,
        id,
        log,
        cmd,
        args,
        desc,
        inetd,
    })
}

/// `[2345]`, `[S]`, `[!0-6,S]`. A leading `!` inverts the listed set
/// against all levels {0..9, S}. Ranges like `0-6` are expanded.
pub fn parse_runlevels(tok: &str) -> Result<RunlevelMask, ConfError> {
    let inner = tok
        .strip_prefix('[')
        .and_then(|s| s.strip_suffix(']'))
        .ok_or_else(|| ConfError::BadRunlevels(tok.to_string()))?;

    let (inner, invert) = match inner.strip_prefix('!') {
        Some(rest) => (rest, true),
        None => (inner, false),
    };

    let mut mask = RunlevelMask::EMPTY;
    let chars: Vec<char> = inner.chars().filter(|c| *c != ',').collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            '0'..='9' => {
                let lo = c as u8 - b'0';
                // range notation: 0-6
                if i + 2 < chars.len() && chars[i + 1] == '-' && chars[i + 2].is_ascii_digit() {
                    let hi = chars[i + 2] as u8 - b'0';
                    if hi < lo {
                        return Err(ConfError::BadRunlevels(tok.to_string()));
                    }
                    for level in lo..=hi {
                        mask.set(level);
                    }
                    i += 3;
                    continue;
                }
                mask.set(lo);
            }
            'S' | 's' => mask.set(INIT_LEVEL),
            _ => return Err(ConfError::BadRunlevels(tok.to_string())),
        }
        i += 1;
    }

    if invert {
        mask = RunlevelMask(!mask.0 & ((1u16 << (INIT_LEVEL + 1)) - 1));
    }
    Ok(mask)
}

/// `<cond1,!cond2,...>` with the bare-`!` no-SIGHUP marker.
pub fn parse_conds(tok: &str) -> (Vec<CondSpec>, bool) {
    let inner = tok.trim_start_matches('<').trim_end_matches('>');
    let mut conds = Vec::new();
    let mut sighup = true;
    for entry in inner.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        if entry == "!" {
            sighup = false;
            continue;
        }
        match entry.strip_prefix('!') {
            Some(name) => conds.push(CondSpec {
                name: name.to_string(),
                negated: true,
            }),
            None => conds.push(CondSpec {
                name: entry.to_string(),
                negated: false,
            }),
        }
    }
    (conds, sighup)
}

/// Options recognized on the kernel command line.
#[derive(Default, Debug, Eq, PartialEq)]
pub struct CmdlineOpts {
    /// A lone digit 1-9 overrides the configured default runlevel.
    pub cmdlevel: Option<u8>,
    pub debug: bool,
}

pub fn parse_cmdline(cmdline: &str) -> CmdlineOpts {
    let mut opts = CmdlineOpts::default();
    for tok in cmdline.split_whitespace() {
        match tok {
            "1" | "2" | "3" | "4" | "5" | "6" | "7" | "8" | "9" => {
                opts.cmdlevel = Some(tok.as_bytes()[0] - b'0');
            }
            "debug" | "rustyinit.debug" | "--debug" => opts.debug = true,
            _ => {}
        }
    }
    opts
}

/// Tracks the drop-in directory between scans so the state machine can ask
/// "did anything change on disk" before deciding to re-read configs.
#[derive(Default)]
pub struct ConfDir {
    pub dir: PathBuf,
    mtimes: HashMap<PathBuf, SystemTime>,
}

impl ConfDir {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            mtimes: HashMap::new(),
        }
    }

    fn conf_files(&self) -> Result<Vec<PathBuf>, ConfError> {
        let mut files = Vec::new();
        let entries = std::fs::read_dir(&self.dir).map_err(|e| ConfError::Io(format!("{e}")))?;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().map(|e| e == "conf").unwrap_or(false) {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    /// Any config file added, removed or touched since the last scan?
    #[must_use]
    pub fn any_change(&self) -> bool {
        let files = match self.conf_files() {
            Ok(files) => files,
            Err(_) => return false,
        };
        if files.len() != self.mtimes.len() {
            return true;
        }
        files.iter().any(|path| {
            let on_disk = path.metadata().and_then(|m| m.modified()).ok();
            on_disk.as_ref() != self.mtimes.get(path)
        })
    }

    /// Parse every *.conf in the directory. Bad lines are logged and
    /// skipped; a missing directory yields an empty set.
    pub fn scan(&mut self) -> Vec<(ServiceLine, Option<SystemTime>)> {
        let mut out = Vec::new();
        let files = match self.conf_files() {
            Ok(files) => files,
            Err(e) => {
                debug!("No service configs under {:?}: {e}", self.dir);
                self.mtimes.clear();
                return out;
            }
        };
        self.mtimes.clear();
        for path in files {
            let mtime = path.metadata().and_then(|m| m.modified()).ok();
            if let Some(t) = mtime {
                self.mtimes.insert(path.clone(), t);
            }
            let content = match std::fs::read_to_string(&path) {
                Ok(content) => content,
                Err(e) => {
                    warn!("Failed reading {path:?}: {e}");
                    continue;
                }
            };
            for raw in content.lines() {
                let raw = raw.trim();
                if raw.is_empty() || raw.starts_with('#') {
                    continue;
                }
                match parse_line(raw) {
                    Ok(line) => out.push((line, mtime)),
                    Err(e) => warn!("Skipping bad line in {path:?}: {e}"),
                }
            }
        }
        out
    }
}

/// Re-scan the drop-in dir and push every declaration through the
/// registry's three-way dirty compare. Records whose lines vanished are
/// marked Removed; pruning happens later in the state machine's clean
/// phase.
pub fn reload(confdir: &mut ConfDir, registry: &mut crate::registry::ServiceRegistry) {
    registry.mark_all_unseen();
    for (line, mtime) in confdir.scan() {
        // Without an explicit :id a line always names instance 1; two
        // unnumbered lines for the same command overwrite each other,
        // exactly like multiple DHCP clients need :1/:2 to coexist.
        let svc = line.into_service(1);
        registry.register(svc, mtime);
    }
    registry.finish_reload();
}
