use crate::config::ServiceSpec;
use crate::paths::Paths;
use crate::state;
use crate::status::{self, PidProbe};
use chrono::Local;
use owo_colors::OwoColorize;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Command, Stdio};

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("failed to spawn '{name}': {source}")]
    Spawn {
        name: String,
        source: std::io::Error,
    },
    #[error("{0}")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Start
// ---------------------------------------------------------------------------

#[derive(Debug, PartialEq, Eq)]
pub enum StartOutcome {
    Started { pid: u32 },
    /// The service already runs; informational, not an error.
    AlreadyRunning { pid: u32 },
}

/// Launch one service generation. The child becomes the leader of a fresh
/// process group with stdout/stderr appended to its log files, stdin from
/// the null device, and exactly the effective environment computed by the
/// resolver.
pub fn start(
    paths: &Paths,
    spec: &ServiceSpec,
    env: &HashMap<String, String>,
    restart: bool,
) -> Result<StartOutcome, RunnerError> {
    paths.ensure_layout()?;

    match status::probe_pid(paths, &spec.name) {
        PidProbe::Alive(pid) => return Ok(StartOutcome::AlreadyRunning { pid }),
        PidProbe::Stale(_) => {
            eprintln!(
                "{} recorded state for '{}' is stale, cleaning up",
                "warning:".yellow().bold(),
                spec.name
            );
            state::clear_runtime(paths, &spec.name)?;
        }
        PidProbe::Absent => {}
    }

    let mut stdout_log = open_append(&paths.stdout_log(&spec.name))?;
    let mut stderr_log = open_append(&paths.stderr_log(&spec.name))?;
    append_banner(&mut stdout_log, &spec.name)?;
    append_banner(&mut stderr_log, &spec.name)?;

    let mut cmd = Command::new("/bin/sh");
    cmd.arg("-c")
        .arg(&spec.cmd)
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout_log))
        .stderr(Stdio::from(stderr_log))
        .env_clear()
        .envs(env)
        // New process group with the shell as leader, so a later killpg on
        // the recorded PID reaches the whole pipeline
        .process_group(0);
    if let Some(cwd) = &spec.cwd {
        cmd.current_dir(cwd);
    }

    let child = cmd.spawn().map_err(|e| RunnerError::Spawn {
        name: spec.name.clone(),
        source: e,
    })?;
    let pid = child.id();
    // Not reaped here: the generation outlives this short-lived CLI
    drop(child);

    if let Err(e) = state::record_start(paths, &spec.name, pid, restart) {
        // The child is up; losing state files only means the next probe
        // cannot attribute it. Do not kill it.
        eprintln!(
            "{} started '{}' (pid {pid}) but failed to record state: {e}",
            "warning:".yellow().bold(),
            spec.name
        );
    }
    Ok(StartOutcome::Started { pid })
}

fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

fn append_banner(file: &mut File, name: &str) -> io::Result<()> {
    let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S");
    writeln!(file, "\n--- Starting service '{name}' at {timestamp} ---")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
