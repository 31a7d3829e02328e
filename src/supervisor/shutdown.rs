//! Stop signalling and bounded thread joins for teardown.
//!
//! The stop sequence is interrupt, then polite terminate, then a bounded join
//! of the control thread. A forceful kill is not part of the default sequence;
//! some servers fail to release their listening port when force-killed after
//! already receiving interrupt and terminate, so the default trades a slower
//! shutdown for a clean one. Callers may opt into the kill as a final
//! escalation step.

use std::process::Child;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Send a Ctrl-C style interrupt to the child.
///
/// A child that has already exited is not an error. On platforms without
/// POSIX signals there is no interrupt delivery and this is a no-op.
pub(super) fn send_interrupt(child: &mut Child) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        signal_child(child, nix::sys::signal::Signal::SIGINT)
    }
    #[cfg(not(unix))]
    {
        let _ = child;
        Ok(())
    }
}

/// Send a polite terminate to the child.
///
/// The race with a still-landing interrupt is expected: a child that
/// disappeared between the two sends is not an error. On platforms without
/// POSIX signals the polite stop degrades to the hard kill.
pub(super) fn send_terminate(child: &mut Child) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        signal_child(child, nix::sys::signal::Signal::SIGTERM)
    }
    #[cfg(not(unix))]
    {
        hard_kill(child)
    }
}

/// Send a forceful kill to the child. Opt-in escalation only.
pub(super) fn send_kill(child: &mut Child) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        signal_child(child, nix::sys::signal::Signal::SIGKILL)
    }
    #[cfg(not(unix))]
    {
        hard_kill(child)
    }
}

#[cfg(unix)]
fn signal_child(child: &Child, signal: nix::sys::signal::Signal) -> std::io::Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let pid = Pid::from_raw(i32::try_from(child.id()).unwrap_or(i32::MAX));
    match kill(pid, signal) {
        // ESRCH means the child is already gone; benign race with its exit.
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(std::io::Error::from_raw_os_error(e as i32)),
    }
}

#[cfg(not(unix))]
fn hard_kill(child: &mut Child) -> std::io::Result<()> {
    match child.kill() {
        Ok(()) => Ok(()),
        // InvalidInput is how std reports a kill on an already-reaped child.
        Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
        Err(e) => Err(e),
    }
}

/// Join a thread within a time budget, polling `is_finished`.
///
/// Returns whether the thread finished inside the budget. The handle is left
/// in place; the unbounded reaping join happens at disposal.
pub(super) fn join_timeout(handle: &JoinHandle<()>, budget: Duration, poll: Duration) -> bool {
    let deadline = Instant::now() + budget;
    while !handle.is_finished() {
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        std::thread::sleep(poll.min(deadline - now));
    }
    true
}
