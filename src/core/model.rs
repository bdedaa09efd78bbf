use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How a sandboxed run ended, from the caller's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Outcome {
    /// The program exited on its own with limits intact.
    Ok,
    /// The program died to a signal (its own fault: crash, bad syscall, ...).
    RuntimeError,
    /// The memory cap was breached.
    MemoryExceeded,
    /// The wall-clock cap was breached.
    TimeExceeded,
    /// The task-count cap was breached.
    TaskExceeded,
    /// The sandbox itself failed; the verdict says nothing about the program.
    Failure,
}

impl Outcome {
    /// Stable process exit code for scripting callers.
    pub fn exit_code(self) -> i32 {
        match self {
            Self::Ok => 0,
            Self::Failure => 1,
            Self::RuntimeError => 2,
            Self::MemoryExceeded => 3,
            Self::TimeExceeded => 4,
            Self::TaskExceeded => 5,
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => write!(f, "ok"),
            Self::RuntimeError => write!(f, "runtime-error"),
            Self::MemoryExceeded => write!(f, "memory-exceeded"),
            Self::TimeExceeded => write!(f, "time-exceeded"),
            Self::TaskExceeded => write!(f, "task-exceeded"),
            Self::Failure => write!(f, "failure"),
        }
    }
}

/// Which cap was breached, if any. Written at most once per run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExceededCause {
    None = 0,
    Fatal = 1,
    Memory = 2,
    WallClock = 3,
    Tasks = 4,
}

impl ExceededCause {
    pub(crate) fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Fatal,
            2 => Self::Memory,
            3 => Self::WallClock,
            4 => Self::Tasks,
            _ => Self::None,
        }
    }
}

/// Resource caps for one run. All values are strictly positive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Memory cap in bytes.
    pub memory_bytes: u64,
    /// Wall-clock cap in milliseconds.
    pub wall_clock_ms: u64,
    /// Maximum number of tasks, the program's initial process included.
    pub max_tasks: u64,
}

/// Host directories of the cgroup v1 controllers under which per-run
/// directories (named by the child pid) are created.
#[derive(Debug, Clone)]
pub struct CgroupLocations {
    pub memory: PathBuf,
    pub pids: PathBuf,
    pub cpuacct: PathBuf,
}

/// Everything one sandboxed run needs. Immutable once built.
#[derive(Debug, Clone)]
pub struct SandboxSpec {
    /// Path of the executable as seen from inside the jail (post-chroot).
    pub prog: String,
    /// Jail root directory (host view, absolute).
    pub jail: PathBuf,
    /// File wired to the program's stdin (host view).
    pub input: PathBuf,
    /// File wired to the program's stdout (host view, created/truncated).
    pub output: PathBuf,
    /// Syscall whitelist file (host view).
    pub whitelist: PathBuf,
    pub cgroups: CgroupLocations,
    pub limits: ResourceLimits,
    /// UID the program runs as. Never 0.
    pub uid: u32,
    /// GID the program runs as. Never 0.
    pub gid: u32,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SpecError {
    #[error("{0} must be strictly positive")]
    ZeroLimit(&'static str),
    #[error("refusing to run the program as uid 0")]
    RootUid,
    #[error("refusing to run the program as gid 0")]
    RootGid,
    #[error("jail root '{0}' must be an absolute path")]
    JailNotAbsolute(String),
    #[error("program path '{0}' must be absolute (it is resolved inside the jail)")]
    ProgNotAbsolute(String),
}

impl SandboxSpec {
    pub fn validate(&self) -> Result<(), SpecError> {
        if self.limits.memory_bytes == 0 {
            return Err(SpecError::ZeroLimit("memory limit"));
        }
        if self.limits.wall_clock_ms == 0 {
            return Err(SpecError::ZeroLimit("wall-clock limit"));
        }
        if self.limits.max_tasks == 0 {
            return Err(SpecError::ZeroLimit("task limit"));
        }
        if self.uid == 0 {
            return Err(SpecError::RootUid);
        }
        if self.gid == 0 {
            return Err(SpecError::RootGid);
        }
        if !self.jail.is_absolute() {
            return Err(SpecError::JailNotAbsolute(self.jail.display().to_string()));
        }
        if !self.prog.starts_with('/') {
            return Err(SpecError::ProgNotAbsolute(self.prog.clone()));
        }
        Ok(())
    }
}
