use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::io;
use tokio::process::Command;
use tracing::debug;

use super::ProcessSignal;

/// Put the child in its own process group and, on Linux, have it receive
/// SIGTERM if the orchestrator dies first.
pub fn prepare_command(cmd: &mut Command) {
    // SAFETY: the closure only issues async-signal-safe syscalls between fork and exec.
    unsafe {
        cmd.pre_exec(|| {
            if set_process_group() != 0 {
                return Err(io::Error::last_os_error());
            }

            #[cfg(target_os = "linux")]
            {
                if set_parent_death_signal() != 0 {
                    return Err(io::Error::last_os_error());
                }
            }

            Ok(())
        });
    }
}

/// Check if process is alive (zombies count as alive until reaped).
pub fn process_alive(pid: u32) -> bool {
    match signal::kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => true,
        Err(errno) => errno == Errno::EPERM,
    }
}

/// Send `signal` to the whole process group led by `pid`.
///
/// Returns `false` when the group no longer exists.
pub fn signal_group(pid: u32, signal: ProcessSignal) -> bool {
    let sig = match signal {
        ProcessSignal::Terminate => Signal::SIGTERM,
        ProcessSignal::Kill => Signal::SIGKILL,
    };
    match signal::killpg(Pid::from_raw(pid as i32), sig) {
        Ok(()) => {
            debug!(pid, signal = %sig, "Signalled process group");
            true
        }
        Err(Errno::ESRCH) => false,
        Err(errno) => {
            // The group may be gone already; fall back to the leader itself.
            debug!(pid, signal = %sig, %errno, "killpg failed, signalling leader");
            signal::kill(Pid::from_raw(pid as i32), sig).is_ok()
        }
    }
}

/// Safely set process group ID
unsafe fn set_process_group() -> libc::c_int {
    unsafe { libc::setpgid(0, 0) }
}

/// Safely set parent death signal
#[cfg(target_os = "linux")]
unsafe fn set_parent_death_signal() -> libc::c_int {
    unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) }
}
