//! NVIDIA attribution via `nvidia-smi`. Best-effort: when the tool is
//! missing or errors, the snapshot is simply absent and the status table
//! shows dashes.

use std::collections::HashMap;
use std::process::Command;

#[derive(Debug, Clone)]
pub struct GpuProcess {
    pub mem_mib: u64,
    pub device: Option<u32>,
}

#[derive(Debug, Default, Clone)]
pub struct GpuSnapshot {
    processes: HashMap<u32, GpuProcess>,
}

impl GpuSnapshot {
    /// Aggregate GPU memory and owning device indices for a process tree.
    /// Returns `(None, [])` when no member of the tree touches a GPU.
    pub fn tree_usage(&self, pids: &[u32]) -> (Option<u64>, Vec<u32>) {
        let mut total = 0_u64;
        let mut ids: Vec<u32> = Vec::new();
        let mut seen = false;
        for pid in pids {
            if let Some(proc_usage) = self.processes.get(pid) {
                seen = true;
                total += proc_usage.mem_mib;
                if let Some(device) = proc_usage.device
                    && !ids.contains(&device)
                {
                    ids.push(device);
                }
            }
        }
        ids.sort_unstable();
        if seen { (Some(total), ids) } else { (None, Vec::new()) }
    }
}

pub fn snapshot() -> Option<GpuSnapshot> {
    let devices = query(&["--query-gpu=index,gpu_bus_id", "--format=csv,noheader"])?;
    let apps = query(&[
        "--query-compute-apps=pid,used_memory,gpu_bus_id",
        "--format=csv,noheader",
    ])?;
    Some(build_snapshot(&devices, &apps))
}

fn query(args: &[&str]) -> Option<String> {
    let output = Command::new("nvidia-smi").args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    Some(String::from_utf8_lossy(&output.stdout).into_owned())
}

fn build_snapshot(devices_csv: &str, apps_csv: &str) -> GpuSnapshot {
    let mut bus_to_index: HashMap<String, u32> = HashMap::new();
    for line in devices_csv.lines() {
        let mut parts = line.splitn(2, ',');
        let (Some(index), Some(bus_id)) = (parts.next(), parts.next()) else {
            continue;
        };
        if let Ok(index) = index.trim().parse::<u32>() {
            bus_to_index.insert(bus_id.trim().to_uppercase(), index);
        }
    }

    let mut processes: HashMap<u32, GpuProcess> = HashMap::new();
    for line in apps_csv.lines() {
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        if fields.len() < 3 {
            continue;
        }
        let Ok(pid) = fields[0].parse::<u32>() else {
            continue;
        };
        let Some(mem_mib) = parse_mib(fields[1]) else {
            continue;
        };
        let device = bus_to_index.get(&fields[2].to_uppercase()).copied();
        // A process may hold memory on several devices; sum them and keep
        // the first resolved device index.
        let entry = processes.entry(pid).or_insert(GpuProcess {
            mem_mib: 0,
            device,
        });
        entry.mem_mib += mem_mib;
        if entry.device.is_none() {
            entry.device = device;
        }
    }
    GpuSnapshot { processes }
}

/// Parse nvidia-smi memory values like `2048 MiB` (or a bare number).
fn parse_mib(s: &str) -> Option<u64> {
    s.split_whitespace().next()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEVICES: &str = "0, 0000:01:00.0\n1, 0000:02:00.0\n";

    #[test]
    fn test_parse_mib_with_unit() {
        assert_eq!(parse_mib("2048 MiB"), Some(2048));
    }

    #[test]
    fn test_parse_mib_bare() {
        assert_eq!(parse_mib("512"), Some(512));
    }

    #[test]
    fn test_parse_mib_garbage() {
        assert_eq!(parse_mib("[N/A]"), None);
    }

    #[test]
    fn test_build_snapshot_maps_device_index() {
        let apps = "12345, 2048 MiB, 0000:01:00.0\n";
        let snap = build_snapshot(DEVICES, apps);
        let (mem, ids) = snap.tree_usage(&[12345]);
        assert_eq!(mem, Some(2048));
        assert_eq!(ids, vec![0]);
    }

    #[test]
    fn test_build_snapshot_sums_multi_device_process() {
        let apps = "12345, 1024 MiB, 0000:01:00.0\n12345, 512 MiB, 0000:02:00.0\n";
        let snap = build_snapshot(DEVICES, apps);
        let (mem, ids) = snap.tree_usage(&[12345]);
        assert_eq!(mem, Some(1536));
        assert_eq!(ids, vec![0]);
    }

    #[test]
    fn test_tree_usage_aggregates_across_pids() {
        let apps = "1, 100 MiB, 0000:01:00.0\n2, 200 MiB, 0000:02:00.0\n";
        let snap = build_snapshot(DEVICES, apps);
        let (mem, ids) = snap.tree_usage(&[1, 2, 3]);
        assert_eq!(mem, Some(300));
        assert_eq!(ids, vec![0, 1]);
    }

    #[test]
    fn test_tree_usage_no_gpu_processes() {
        let snap = build_snapshot(DEVICES, "");
        let (mem, ids) = snap.tree_usage(&[1, 2]);
        assert_eq!(mem, None);
        assert!(ids.is_empty());
    }

    #[test]
    fn test_build_snapshot_skips_malformed_rows() {
        let apps = "not-a-pid, 100 MiB, 0000:01:00.0\n7, [N/A], 0000:01:00.0\nshort\n";
        let snap = build_snapshot(DEVICES, apps);
        assert!(snap.processes.is_empty());
    }

    #[test]
    fn test_unknown_bus_id_has_no_device() {
        let apps = "9, 64 MiB, 0000:ff:00.0\n";
        let snap = build_snapshot(DEVICES, apps);
        let (mem, ids) = snap.tree_usage(&[9]);
        assert_eq!(mem, Some(64));
        assert!(ids.is_empty());
    }
}
