//! On-disk runtime state for one service generation: the pid, start-time,
//! and restart-count files under `pids/`. The Process Runner is the only
//! writer, the Stop Controller the only deleter.

use crate::paths::Paths;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

pub fn now_epoch() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Replace `path` via write-to-temp-then-rename so concurrent readers see
/// either the old or the new contents, never a partial write.
pub fn write_atomic(path: &Path, contents: &str) -> io::Result<()> {
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp = PathBuf::from(tmp_name);
    std::fs::write(&tmp, contents)?;
    std::fs::rename(&tmp, path)
}

fn remove_if_present(path: &Path) -> io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

pub fn read_pid(paths: &Paths, name: &str) -> Option<u32> {
    std::fs::read_to_string(paths.pid_file(name))
        .ok()
        .and_then(|s| s.trim().parse().ok())
}

pub fn read_start_time(paths: &Paths, name: &str) -> Option<f64> {
    std::fs::read_to_string(paths.time_file(name))
        .ok()
        .and_then(|s| s.trim().parse().ok())
}

pub fn read_restarts(paths: &Paths, name: &str) -> u32 {
    std::fs::read_to_string(paths.restarts_file(name))
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(0)
}

/// Record a fresh generation. Write order is time, then restarts (only when
/// this start completes a restart), then pid last, so any observer that
/// sees the pid file also sees the start time.
pub fn record_start(paths: &Paths, name: &str, pid: u32, restart: bool) -> io::Result<()> {
    write_atomic(&paths.time_file(name), &format!("{:.6}", now_epoch()))?;
    if restart {
        let count = read_restarts(paths, name);
        write_atomic(&paths.restarts_file(name), &(count + 1).to_string())?;
    }
    write_atomic(&paths.pid_file(name), &pid.to_string())?;
    Ok(())
}

/// End a generation: remove the pid file first (flips the observable state
/// to not-running), then the time file. The restart counter is kept.
pub fn clear_runtime(paths: &Paths, name: &str) -> io::Result<()> {
    remove_if_present(&paths.pid_file(name))?;
    remove_if_present(&paths.time_file(name))
}
