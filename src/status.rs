use crate::config::ServiceSpec;
use crate::gpu;
use crate::paths::Paths;
use crate::state;
use std::collections::HashMap;
use std::fmt;
use sysinfo::{Pid, ProcessesToUpdate, System};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// A live process whose OS start time is newer than the recorded start by
/// more than this slack is a recycled PID, not our generation. sysinfo
/// reports whole seconds, so allow a little rounding room.
pub const START_TIME_SLACK_SECS: f64 = 2.0;

// ---------------------------------------------------------------------------
// Liveness
// ---------------------------------------------------------------------------

pub fn is_pid_alive(pid: u32) -> bool {
    match nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), None) {
        Ok(()) => true,
        // Exists but owned by someone we cannot signal
        Err(nix::errno::Errno::EPERM) => true,
        Err(_) => false,
    }
}

fn is_recycled(system: &System, pid: u32, recorded_start: Option<f64>) -> bool {
    let Some(recorded) = recorded_start else {
        return false;
    };
    let Some(process) = system.process(Pid::from_u32(pid)) else {
        return false;
    };
    process.start_time() as f64 > recorded + START_TIME_SLACK_SECS
}

// ---------------------------------------------------------------------------
// Recorded-state probe
// ---------------------------------------------------------------------------

/// What the recorded pid file corresponds to right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PidProbe {
    /// Recorded PID maps to the live supervised generation.
    Alive(u32),
    /// A pid file exists but the PID is dead, recycled, or unparseable.
    Stale(Option<u32>),
    /// No pid file: not running.
    Absent,
}

pub fn probe_pid(paths: &Paths, name: &str) -> PidProbe {
    if !paths.pid_file(name).exists() {
        return PidProbe::Absent;
    }
    let Some(pid) = state::read_pid(paths, name) else {
        return PidProbe::Stale(None);
    };
    if !is_pid_alive(pid) {
        return PidProbe::Stale(Some(pid));
    }
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[Pid::from_u32(pid)]), true);
    if is_recycled(&system, pid, state::read_start_time(paths, name)) {
        PidProbe::Stale(Some(pid))
    } else {
        PidProbe::Alive(pid)
    }
}

// ---------------------------------------------------------------------------
// Process tree walk
// ---------------------------------------------------------------------------

pub fn children_map(system: &System) -> HashMap<u32, Vec<u32>> {
    let mut map: HashMap<u32, Vec<u32>> = HashMap::new();
    for (pid, process) in system.processes() {
        if let Some(parent) = process.parent() {
            map.entry(parent.as_u32()).or_default().push(pid.as_u32());
        }
    }
    map
}

/// Root plus every transitive child known to the snapshot.
pub fn process_tree(children: &HashMap<u32, Vec<u32>>, root: u32) -> Vec<u32> {
    let mut tree = Vec::new();
    let mut queue = vec![root];
    while let Some(pid) = queue.pop() {
        if tree.contains(&pid) {
            continue;
        }
        tree.push(pid);
        if let Some(kids) = children.get(&pid) {
            queue.extend(kids.iter().copied());
        }
    }
    tree
}

/// Best-effort tree snapshot for a leader, from a fresh look at the process
/// table.
pub fn descendant_pids(root: u32) -> Vec<u32> {
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::All, true);
    process_tree(&children_map(&system), root)
}

// ---------------------------------------------------------------------------
// Status rows
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Running,
    Stopped,
    Stale,
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceState::Running => write!(f, "running"),
            ServiceState::Stopped => write!(f, "stopped"),
            ServiceState::Stale => write!(f, "stale"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StatusRow {
    pub name: String,
    pub state: ServiceState,
    pub pid: Option<u32>,
    pub uptime_secs: Option<f64>,
    pub restarts: u32,
    /// Summed across the process tree; not capped at 100.
    pub cpu_percent: Option<f64>,
    /// Resident set bytes summed across the process tree.
    pub mem_rss: Option<u64>,
    pub gpu_mem_mib: Option<u64>,
    pub gpu_ids: Vec<u32>,
    pub user: Option<String>,
}

/// Build one row per declared service by cross-checking recorded state
/// against the OS. Takes one process-table snapshot, refreshed twice across
/// the minimum CPU sampling interval so cpu values are real.
pub async fn status_all(paths: &Paths, specs: &[ServiceSpec]) -> Vec<StatusRow> {
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::All, true);
    tokio::time::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL).await;
    system.refresh_processes(ProcessesToUpdate::All, true);

    let children = children_map(&system);
    let gpu = gpu::snapshot();

    specs
        .iter()
        .map(|spec| build_row(paths, spec, &system, &children, gpu.as_ref()))
        .collect()
}

fn build_row(
    paths: &Paths,
    spec: &ServiceSpec,
    system: &System,
    children: &HashMap<u32, Vec<u32>>,
    gpu: Option<&gpu::GpuSnapshot>,
) -> StatusRow {
    let name = spec.name.clone();
    let restarts = state::read_restarts(paths, &spec.name);

    let mut row = StatusRow {
        name,
        state: ServiceState::Stopped,
        pid: None,
        uptime_secs: None,
        restarts,
        cpu_percent: None,
        mem_rss: None,
        gpu_mem_mib: None,
        gpu_ids: Vec::new(),
        user: None,
    };

    if !paths.pid_file(&spec.name).exists() {
        return row;
    }
    let Some(pid) = state::read_pid(paths, &spec.name) else {
        row.state = ServiceState::Stale;
        return row;
    };

    let recorded_start = state::read_start_time(paths, &spec.name);
    if !is_pid_alive(pid) || is_recycled(system, pid, recorded_start) {
        row.state = ServiceState::Stale;
        row.pid = Some(pid);
        return row;
    }

    row.state = ServiceState::Running;
    row.pid = Some(pid);
    row.uptime_secs = recorded_start.map(|t| (state::now_epoch() - t).max(0.0));

    let tree = process_tree(children, pid);
    let mut cpu = 0.0_f64;
    let mut rss = 0_u64;
    let mut seen_any = false;
    for &member in &tree {
        if let Some(process) = system.process(Pid::from_u32(member)) {
            seen_any = true;
            cpu += process.cpu_usage() as f64;
            rss += process.memory();
        }
    }
    if seen_any {
        row.cpu_percent = Some(cpu);
        row.mem_rss = Some(rss);
    }

    row.user = system
        .process(Pid::from_u32(pid))
        .and_then(|p| p.user_id())
        .and_then(|uid| users::get_user_by_uid(**uid))
        .map(|u| u.name().to_string_lossy().into_owned());

    if let Some(gpu) = gpu {
        let (mem, ids) = gpu.tree_usage(&tree);
        row.gpu_mem_mib = mem;
        row.gpu_ids = ids;
    }

    row
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
