//! Legacy telinit compatibility: a named pipe accepting single-byte SysV
//! commands. `0`-`6` change runlevel, `s`/`S` drop to single user,
//! `q`/`Q` reload the configuration.

use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};

use log::{debug, warn};

use crate::supervisor::Supervisor;

pub struct Fifo {
    fd: OwnedFd,
    _path: PathBuf,
}

impl Fifo {
    pub fn open(path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        match nix::unistd::mkfifo(path, nix::sys::stat::Mode::from_bits_truncate(0o600)) {
            Ok(()) => {}
            Err(nix::errno::Errno::EEXIST) => {}
            Err(e) => return Err(std::io::Error::from(e)),
        }

        // O_RDWR keeps a writer open on our own pipe, so the fd never
        // turns into a POLLHUP busy-loop when the last client closes.
        let path_c = std::ffi::CString::new(path.to_string_lossy().as_bytes())
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "bad fifo path"))?;
        let raw = unsafe { libc::open(path_c.as_ptr(), libc::O_RDWR | libc::O_NONBLOCK) };
        if raw < 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(Self {
            fd: unsafe { OwnedFd::from_raw_fd(raw) },
            _path: path.to_path_buf(),
        })
    }

    #[must_use]
    pub fn fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    pub fn handle(&self, sup: &mut Supervisor) {
        let mut buf = [0u8; 32];
        loop {
            match nix::unistd::read(&self.fd, &mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    for &byte in &buf[..n] {
                        dispatch_byte(sup, byte);
                    }
                }
                Err(nix::errno::Errno::EAGAIN) => break,
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => {
                    warn!("Error reading fifo: {e}");
                    break;
                }
            }
        }
    }
}

fn dispatch_byte(sup: &mut Supervisor, byte: u8) {
    match byte {
        b'0'..=b'6' => {
            debug!("Fifo request: runlevel {}", byte - b'0');
            sup.service_runlevel(byte - b'0');
        }
        b's' | b'S' => {
            debug!("Fifo request: single user");
            sup.service_runlevel(1);
        }
        b'q' | b'Q' => {
            debug!("Fifo request: reload");
            sup.service_reload_dynamic();
        }
        b'\n' | b' ' => {}
        other => {
            debug!("Ignoring unknown fifo command {other:#x}");
        }
    }
}
