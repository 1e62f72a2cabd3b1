//! Platform specific process control.

#[cfg(unix)]
mod unix;

#[cfg(unix)]
pub use unix::{prepare_command, process_alive, signal_group};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessSignal {
    /// Polite request to stop (SIGTERM).
    Terminate,
    /// Forced termination (SIGKILL).
    Kill,
}

#[cfg(not(unix))]
pub fn prepare_command(_cmd: &mut tokio::process::Command) {}

#[cfg(not(unix))]
pub fn process_alive(_pid: u32) -> bool {
    false
}

// Children are still released through `kill_on_drop` on these platforms.
#[cfg(not(unix))]
pub fn signal_group(_pid: u32, _signal: ProcessSignal) -> bool {
    false
}
