//! Process groups and signal delivery for spawned target programs
//!
//! Every probe and transfer runs in its own process group so the whole tree
//! (the shell plus `rsync`, `ssh`, ...) can be signalled at once.
//!
//! - Probes are short-lived and additionally get a death pact: if this
//!   process dies, the kernel sends them SIGTERM.
//! - Transfers deliberately do not. A transfer may run for hours, and one
//!   whose output goes to a log file survives a restart of the caller, which
//!   then finds it again through the process matcher.
//!
//! Cancellation is always the caller's decision: [`terminate_group`] sends
//! SIGTERM to a group, waits up to a grace period, then sends SIGKILL.

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::time::{Duration, Instant};

/// How a group termination ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Nothing in the group was still running
    AlreadyExited,
    /// The group emptied within the grace period after SIGTERM
    Graceful,
    /// SIGKILL was needed
    Killed,
}

/// Send a signal to a process
pub fn send_signal(pid: u32, signal: Signal) -> Result<(), nix::Error> {
    signal::kill(Pid::from_raw(pid as i32), signal)
}

/// Send a signal to an entire process group
/// Uses negative PID to signal all processes in the group, ensuring children
/// of the shell (rsync, ssh, etc.) also receive the signal
pub fn send_signal_to_group(pgid: u32, signal: Signal) -> Result<(), nix::Error> {
    signal::kill(Pid::from_raw(-(pgid as i32)), signal)
}

/// Fields of `/proc/<pid>/stat` used for liveness checks
struct ProcStat {
    state: String,
    pgrp: u32,
}

impl ProcStat {
    fn read(pid: u32) -> Option<Self> {
        let stat = std::fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
        // comm (field 2) may contain spaces, so split after its closing paren
        let (_, rest) = stat.rsplit_once(')')?;
        let mut fields = rest.split_whitespace();
        let state = fields.next()?.to_string();
        let _ppid = fields.next()?;
        let pgrp = fields.next()?.parse().ok()?;
        Some(Self { state, pgrp })
    }

    /// Z and X are not running
    fn is_running(&self) -> bool {
        !matches!(self.state.as_str(), "Z" | "X")
    }
}

/// Check if a process is still alive (not dead or zombie)
pub fn is_process_alive(pid: u32) -> bool {
    if signal::kill(Pid::from_raw(pid as i32), None).is_err() {
        return false;
    }

    // If we can't read /proc, assume alive
    ProcStat::read(pid).is_none_or(|stat| stat.is_running())
}

/// Check if any process of group `pgid` is still running.
///
/// The leader does not have to be among them. Zombies do not count.
pub fn is_group_alive(pgid: u32) -> bool {
    if signal::kill(Pid::from_raw(-(pgid as i32)), None).is_err() {
        return false;
    }

    let Ok(proc_dir) = std::fs::read_dir("/proc") else {
        return true;
    };
    proc_dir.flatten().any(|entry| {
        entry
            .file_name()
            .to_str()
            .and_then(|name| name.parse::<u32>().ok())
            .and_then(ProcStat::read)
            .is_some_and(|stat| stat.pgrp == pgid && stat.is_running())
    })
}

/// Also covers a bare pid that never became a group leader.
fn group_running(pgid: u32) -> bool {
    is_group_alive(pgid) || is_process_alive(pgid)
}

/// Terminate the process group `pgid`.
///
/// Sends SIGTERM to the group, polls until no member is running for up to
/// `grace_period`, then sends SIGKILL to whatever is left. Members that
/// outlived the leader are still signalled.
pub fn terminate_group(pgid: u32, grace_period: Duration) -> Termination {
    if !group_running(pgid) {
        tracing::debug!("Process group {} already exited", pgid);
        return Termination::AlreadyExited;
    }

    match send_signal_to_group(pgid, Signal::SIGTERM) {
        Ok(()) => tracing::debug!("Sent SIGTERM to process group {}", pgid),
        Err(e) => {
            tracing::warn!("Failed to send SIGTERM to process group {}: {}", pgid, e);
            // Fall back to direct signal if group signal fails
            match send_signal(pgid, Signal::SIGTERM) {
                Ok(()) => {}
                Err(Errno::ESRCH) if e == Errno::ESRCH => {
                    tracing::debug!("Process group {} exited before SIGTERM", pgid);
                    return Termination::AlreadyExited;
                }
                Err(e2) => tracing::warn!("Failed to send SIGTERM to PID {}: {}", pgid, e2),
            }
        }
    }

    let start = Instant::now();
    while start.elapsed() < grace_period {
        if !group_running(pgid) {
            tracing::info!("Process group {} terminated gracefully", pgid);
            return Termination::Graceful;
        }
        std::thread::sleep(Duration::from_millis(50));
    }

    tracing::warn!("Process group {} did not terminate, sending SIGKILL", pgid);
    if let Err(e) = send_signal_to_group(pgid, Signal::SIGKILL) {
        tracing::error!("Failed to send SIGKILL to process group {}: {}", pgid, e);
        let _ = send_signal(pgid, Signal::SIGKILL);
    }
    Termination::Killed
}

/// Forward SIGINT and SIGTERM to a foreground transfer.
///
/// Transfers run in their own process group, so a terminal Ctrl-C never
/// reaches them. This installs a handler thread that terminates group
/// `pgid` and then exits with 128 + signal number.
pub fn cancel_group_on_signals(pgid: u32, grace_period: Duration) -> Result<(), std::io::Error> {
    use signal_hook::consts::signal::{SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM])?;

    std::thread::spawn(move || {
        if let Some(sig) = signals.forever().next() {
            let signal_name = if sig == SIGINT { "SIGINT" } else { "SIGTERM" };
            tracing::info!("Received {}, cancelling process group {}", signal_name, pgid);
            terminate_group(pgid, grace_period);
            std::process::exit(128 + sig);
        }
    });

    Ok(())
}

/// Extension trait for std::process::Command to set up process groups
pub trait CommandProcessGroup {
    /// Run the command as leader of a new process group (PGID = child PID)
    fn in_new_process_group(&mut self) -> &mut Self;

    /// Have the kernel send SIGTERM to the child if this process dies.
    /// No-op outside Linux.
    fn with_death_pact(&mut self) -> &mut Self;
}

impl CommandProcessGroup for std::process::Command {
    fn in_new_process_group(&mut self) -> &mut Self {
        use std::os::unix::process::CommandExt;
        self.process_group(0)
    }

    #[cfg(target_os = "linux")]
    fn with_death_pact(&mut self) -> &mut Self {
        use nix::libc;
        use std::os::unix::process::CommandExt;
        // SAFETY: prctl is async-signal-safe and touches no parent state.
        unsafe {
            self.pre_exec(|| {
                if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
        self
    }

    #[cfg(not(target_os = "linux"))]
    fn with_death_pact(&mut self) -> &mut Self {
        self
    }
}
