//! utmp/wtmp runlevel records, written the way sysvinit encodes them: a
//! RUN_LVL entry whose ut_pid carries the new level in the low byte and
//! the previous one shifted up by eight.

use std::path::Path;

use log::debug;

use crate::services::INIT_LEVEL;

extern "C" {
    fn updwtmpx(file: *const libc::c_char, ut: *const libc::utmpx);
}

const WTMP_PATH: &[u8] = b"/var/log/wtmp\0";

fn runlevel_byte(level: u8) -> u8 {
    if level == INIT_LEVEL {
        b'S'
    } else {
        b'0' + level.min(9)
    }
}

fn fill_c_char_buf(buf: &mut [libc::c_char], src: &str) {
    let bytes = src.as_bytes();
    let len = bytes.len().min(buf.len() - 1);
    for (i, &b) in bytes[..len].iter().enumerate() {
        buf[i] = b as libc::c_char;
    }
}

fn has_utmp() -> bool {
    Path::new("/var/run/utmp").exists() || Path::new("/run/utmp").exists()
}

pub fn write_runlevel_record(runlevel: u8, prevlevel: Option<u8>) {
    if !has_utmp() {
        debug!("No utmp file, skipping runlevel record");
        return;
    }

    let mut ut: libc::utmpx = unsafe { std::mem::zeroed() };
    ut.ut_type = libc::RUN_LVL as libc::c_short;
    let prev = prevlevel.map_or(b'N', runlevel_byte);
    ut.ut_pid = i32::from(runlevel_byte(runlevel)) + (i32::from(prev) << 8);
    fill_c_char_buf(&mut ut.ut_user, "runlevel");
    fill_c_char_buf(&mut ut.ut_id, "~~");
    fill_c_char_buf(&mut ut.ut_line, "~");

    let now = unsafe {
        let mut tv: libc::timeval = std::mem::zeroed();
        libc::gettimeofday(&mut tv, std::ptr::null_mut());
        tv
    };
    ut.ut_tv.tv_sec = now.tv_sec as _;
    ut.ut_tv.tv_usec = now.tv_usec as _;

    unsafe {
        libc::setutxent();
        let result = libc::pututxline(&ut);
        libc::endutxent();
        if result.is_null() {
            debug!(
                "Failed to write runlevel utmp record: {}",
                std::io::Error::last_os_error()
            );
        }
        updwtmpx(WTMP_PATH.as_ptr() as *const libc::c_char, &ut);
    }
}
