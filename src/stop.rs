use crate::paths::Paths;
use crate::state;
use crate::status::{self, PidProbe};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use owo_colors::OwoColorize;
use std::time::Duration;
use tokio::time::Instant;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);
const POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Bounded wait after SIGKILL before giving up on stragglers.
const KILL_GRACE: Duration = Duration::from_secs(2);

// ---------------------------------------------------------------------------
// Error / outcome
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StopError {
    #[error("{0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, PartialEq, Eq)]
pub enum StopOutcome {
    Stopped {
        /// True when SIGTERM was not enough and the tree was SIGKILLed.
        forced: bool,
    },
    /// Nothing to do; informational, not an error.
    NotRunning,
}

// ---------------------------------------------------------------------------
// Stop
// ---------------------------------------------------------------------------

/// Two-phase graceful stop of a service's whole process tree: SIGTERM to
/// the recorded leader's group, poll until gone or `timeout`, then SIGKILL
/// the group and any walked descendant that left it. State files are
/// cleaned up on every successful path.
pub async fn stop(paths: &Paths, name: &str, timeout: Duration) -> Result<StopOutcome, StopError> {
    let pid = match status::probe_pid(paths, name) {
        PidProbe::Absent => return Ok(StopOutcome::NotRunning),
        PidProbe::Stale(_) => {
            eprintln!(
                "{} recorded state for '{name}' is stale, cleaning up",
                "warning:".yellow().bold()
            );
            state::clear_runtime(paths, name)?;
            return Ok(StopOutcome::NotRunning);
        }
        PidProbe::Alive(pid) => pid,
    };

    // Snapshot the tree before signaling. killpg is the primary vector;
    // the walked pids are the safety net for processes that left the group.
    let tree = status::descendant_pids(pid);

    signal_group(pid, Signal::SIGTERM);

    let deadline = Instant::now() + timeout;
    let mut forced = false;
    while any_alive(&tree) {
        if Instant::now() >= deadline {
            forced = true;
            eprintln!(
                "{} '{name}' did not exit within {}s, escalating to SIGKILL",
                "warning:".yellow().bold(),
                timeout.as_secs()
            );
            signal_group(pid, Signal::SIGKILL);
            for &member in &tree {
                if status::is_pid_alive(member) {
                    let _ = signal::kill(Pid::from_raw(member as i32), Signal::SIGKILL);
                }
            }
            let kill_deadline = Instant::now() + KILL_GRACE;
            while any_alive(&tree) && Instant::now() < kill_deadline {
                tokio::time::sleep(POLL_INTERVAL).await;
            }
            for &member in &tree {
                if status::is_pid_alive(member) {
                    eprintln!(
                        "{} process {member} of '{name}' survived SIGKILL",
                        "warning:".yellow().bold()
                    );
                }
            }
            break;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }

    state::clear_runtime(paths, name)?;
    Ok(StopOutcome::Stopped { forced })
}

fn any_alive(pids: &[u32]) -> bool {
    pids.iter().any(|&pid| status::is_pid_alive(pid))
}

fn signal_group(pid: u32, sig: Signal) {
    let leader = Pid::from_raw(pid as i32);
    match nix::unistd::getpgid(Some(leader)) {
        Ok(pgid) => {
            let _ = signal::killpg(pgid, sig);
        }
        // Group already gone; a direct kill covers the leader if it is
        // merely unreadable
        Err(_) => {
            let _ = signal::kill(leader, sig);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
