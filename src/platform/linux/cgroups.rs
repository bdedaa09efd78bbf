//! Resource-limit installation: per-run cgroup v1 directories for the
//! memory, pids, and cpuacct controllers, plus the watchdog that enforces
//! the wall-clock cap.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use nix::unistd::Pid;
use tracing::{debug, error, warn};

use crate::core::model::{CgroupLocations, ExceededCause, ResourceLimits};
use crate::platform::linux::terminator::{self, ExceededFlag, Terminator};
use crate::util::fs as fsutil;

const CGROUP_PROCS: &str = "cgroup.procs";
const MEMORY_LIMIT: &str = "memory.limit_in_bytes";
const MEMORY_PEAK: &str = "memory.max_usage_in_bytes";
const MEMORY_OOM_CONTROL: &str = "memory.oom_control";
const PIDS_MAX: &str = "pids.max";
const PIDS_EVENTS: &str = "pids.events";
const CPUACCT_USAGE: &str = "cpuacct.usage";

/// Attempts to remove a cgroup directory; the kernel can report EBUSY for a
/// short while after the last task is reaped.
const REMOVE_ATTEMPTS: u32 = 10;
const REMOVE_BACKOFF: Duration = Duration::from_millis(10);

/// Resource usage read back from the controllers after the run.
#[derive(Debug, Clone, Copy, Default)]
pub struct Usage {
    pub cpu_time_us: Option<u64>,
    pub peak_memory_bytes: Option<u64>,
}

/// The per-run controller directories, named by the child pid.
#[derive(Debug, Clone)]
pub struct CgroupSet {
    memory: PathBuf,
    pids: PathBuf,
    cpuacct: PathBuf,
}

/// Create the per-pid controller directories, write the caps, attach the
/// child, and arm the watchdog. On failure everything created here is
/// removed and the exceeded cell is marked fatal; signalling the child is
/// the caller's job.
pub fn install_limits(
    pid: Pid,
    limits: &ResourceLimits,
    locations: &CgroupLocations,
    exceeded: &Arc<ExceededFlag>,
) -> Result<(CgroupSet, Terminator)> {
    let set = CgroupSet::new(locations, pid);
    if let Err(e) = set.create().and_then(|_| {
        set.apply_limits(limits)?;
        set.attach(pid)
    }) {
        exceeded.set(ExceededCause::Fatal);
        set.remove();
        return Err(e);
    }
    debug!(
        pid = pid.as_raw(),
        memory = limits.memory_bytes,
        tasks = limits.max_tasks,
        wall_ms = limits.wall_clock_ms,
        "limits installed"
    );

    let probe_set = set.clone();
    let term = terminator::arm(
        pid,
        Duration::from_millis(limits.wall_clock_ms),
        Arc::clone(exceeded),
        move || probe_set.breach_cause(),
    );
    Ok((set, term))
}

impl CgroupSet {
    fn new(locations: &CgroupLocations, pid: Pid) -> Self {
        let name = pid.as_raw().to_string();
        Self {
            memory: locations.memory.join(&name),
            pids: locations.pids.join(&name),
            cpuacct: locations.cpuacct.join(&name),
        }
    }

    /// Test-only constructor pointing at arbitrary directories.
    #[cfg(test)]
    fn at(memory: PathBuf, pids: PathBuf, cpuacct: PathBuf) -> Self {
        Self {
            memory,
            pids,
            cpuacct,
        }
    }

    fn create(&self) -> Result<()> {
        for dir in self.dirs() {
            fsutil::ensure_dir(dir)?;
        }
        Ok(())
    }

    fn apply_limits(&self, limits: &ResourceLimits) -> Result<()> {
        fsutil::write_str(
            &self.memory.join(MEMORY_LIMIT),
            &limits.memory_bytes.to_string(),
        )
        .context("failed to set memory limit")?;
        fsutil::write_str(&self.pids.join(PIDS_MAX), &limits.max_tasks.to_string())
            .context("failed to set task limit")?;
        Ok(())
    }

    fn attach(&self, pid: Pid) -> Result<()> {
        let pid = pid.as_raw().to_string();
        for dir in self.dirs() {
            fsutil::write_str(&dir.join(CGROUP_PROCS), &pid).with_context(|| {
                format!("failed to attach pid {pid} to cgroup {}", dir.display())
            })?;
        }
        Ok(())
    }

    /// Whether the controllers have recorded a breach. Wall-clock wins races
    /// elsewhere; this only reports what the kernel itself enforced.
    pub fn breach_cause(&self) -> Option<ExceededCause> {
        if let Ok(contents) = fs::read_to_string(self.memory.join(MEMORY_OOM_CONTROL)) {
            if parse_oom_kills(&contents) > 0 {
                return Some(ExceededCause::Memory);
            }
        }
        if let Ok(contents) = fs::read_to_string(self.pids.join(PIDS_EVENTS)) {
            if parse_pids_max_events(&contents) > 0 {
                return Some(ExceededCause::Tasks);
            }
        }
        None
    }

    /// Usage counters for the report. Missing or unparsable files degrade to
    /// `None`; the run verdict never depends on these.
    pub fn usage(&self) -> Usage {
        let cpu_time_us = fs::read_to_string(self.cpuacct.join(CPUACCT_USAGE))
            .ok()
            .and_then(|s| s.trim().parse::<u64>().ok())
            .map(|ns| ns / 1_000);
        let peak_memory_bytes = fs::read_to_string(self.memory.join(MEMORY_PEAK))
            .ok()
            .and_then(|s| s.trim().parse::<u64>().ok());
        Usage {
            cpu_time_us,
            peak_memory_bytes,
        }
    }

    /// Remove the per-run directories. An orphaned cgroup directory keeps
    /// counting against the controllers, so failure here is logged loudly.
    pub fn remove(&self) {
        for dir in self.dirs() {
            if !dir.exists() {
                continue;
            }
            let mut result = fs::remove_dir(dir);
            for _ in 1..REMOVE_ATTEMPTS {
                if result.is_ok() {
                    break;
                }
                thread::sleep(REMOVE_BACKOFF);
                result = fs::remove_dir(dir);
            }
            match result {
                Ok(()) => {}
                Err(e) => error!(
                    "orphaned cgroup directory {} could not be removed: {e}",
                    dir.display()
                ),
            }
        }
    }

    fn dirs(&self) -> [&Path; 3] {
        [&self.memory, &self.pids, &self.cpuacct]
    }
}

/// Parse the `oom_kill` counter out of `memory.oom_control`.
fn parse_oom_kills(contents: &str) -> u64 {
    parse_keyed_counter(contents, "oom_kill")
}

/// Parse the `max` counter out of `pids.events` (forks denied by the limit).
fn parse_pids_max_events(contents: &str) -> u64 {
    parse_keyed_counter(contents, "max")
}

fn parse_keyed_counter(contents: &str, key: &str) -> u64 {
    for line in contents.lines() {
        let mut parts = line.split_whitespace();
        if parts.next() == Some(key) {
            if let Some(value) = parts.next() {
                return value.parse().unwrap_or_else(|_| {
                    warn!("unparsable counter line in cgroup file: '{line}'");
                    0
                });
            }
        }
    }
    0
}
