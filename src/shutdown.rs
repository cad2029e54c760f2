//! The point of no return. Reached from the clean phase once runlevel 0
//! or 6 is committed; terminates everything left, syncs and hands the
//! machine back to the kernel.

use log::{error, info};
use nix::sys::reboot::RebootMode;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

use crate::supervisor::Supervisor;

pub fn do_shutdown(sup: &mut Supervisor) -> ! {
    // from here on the shutdown driver owns reaping
    sup.sync_shutdown = true;

    let mode = if sup.runlevel == 6 {
        RebootMode::RB_AUTOBOOT
    } else {
        RebootMode::RB_POWER_OFF
    };

    if nix::unistd::getpid().as_raw() != 1 {
        // a supervised development run must not take the session down
        info!("Not PID 1, exiting instead of system {mode:?}");
        std::process::exit(0);
    }

    info!("Sending SIGTERM to all processes");
    let _ = kill(Pid::from_raw(-1), Signal::SIGTERM);
    std::thread::sleep(std::time::Duration::from_secs(2));

    info!("Sending SIGKILL to all processes");
    let _ = kill(Pid::from_raw(-1), Signal::SIGKILL);

    nix::unistd::sync();

    let _ = std::process::Command::new("/bin/umount").arg("-a").status();
    nix::unistd::sync();

    match nix::sys::reboot::reboot(mode) {
        Ok(never) => match never {},
        Err(e) => {
            error!("reboot syscall failed: {e}");
            std::process::exit(1);
        }
    }
}
