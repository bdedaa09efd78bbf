//! The sandbox driver: clone the child into a new PID namespace, install
//! limits while it waits at the rendezvous, release it into the jail, reap
//! it, and classify how it died.

use std::ffi::CString;
use std::os::unix::io::AsRawFd;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use nix::errno::Errno;
use nix::sched::{clone, CloneFlags};
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;
use tracing::{debug, error};

use crate::core::model::{ExceededCause, Outcome, SandboxSpec};
use crate::core::report::RunReport;
use crate::platform::linux::cgroups;
use crate::platform::linux::channel::{self, Channel};
use crate::platform::linux::child::{self, ChildPayload, SETUP_FAILURE_STATUS};
use crate::platform::linux::terminator::ExceededFlag;

/// Stack handed to `clone` for the child. `nix` computes the stack top from
/// the buffer itself; 1 MiB is plenty for the bootstrap, which execs or
/// exits without deep recursion.
const CHILD_STACK_SIZE: usize = 1024 * 1024;

/// Run one program under full confinement and report how it ended.
///
/// `Err` is reserved for unusable configuration; every operational failure
/// (clone, limit installation, child setup, ...) comes back as a report with
/// [`Outcome::Failure`] after all resources have been cleaned up.
pub fn run(spec: &SandboxSpec) -> Result<RunReport> {
    spec.validate().context("invalid sandbox configuration")?;
    let prog = CString::new(spec.prog.as_bytes()).context("program path contains NUL")?;

    let started_at = Utc::now();
    let start = Instant::now();

    let channel = Channel::open()?;
    let payload = ChildPayload {
        prog,
        jail: spec.jail.clone(),
        input: spec.input.clone(),
        output: spec.output.clone(),
        whitelist: spec.whitelist.clone(),
        fds: channel.child_fds(),
        uid: spec.uid,
        gid: spec.gid,
    };

    let mut stack = vec![0u8; CHILD_STACK_SIZE];
    let cb = Box::new(|| child::child_main(&payload));
    // SAFETY: the child gets a copy-on-write duplicate of this address space
    // (no CLONE_VM) and either execs or `_exit`s. No other thread exists at
    // this point (the watchdog is only spawned after clone), so the
    // duplicated heap state is consistent.
    let pid = match unsafe {
        clone(
            cb,
            &mut stack,
            CloneFlags::CLONE_NEWPID,
            Some(Signal::SIGCHLD as i32),
        )
    } {
        Ok(pid) => pid,
        Err(err) => {
            error!("failed to clone sandbox child: {err}");
            return Ok(failure_report(started_at, start));
        }
    };
    debug!(pid = pid.as_raw(), "sandbox child cloned");

    // Keep only our ends; the child holds its own copies. Dropping these is
    // what turns a crashed child into EOF on `ready_rx`.
    let Channel {
        ready_rx,
        ready_tx,
        go_rx,
        go_tx,
    } = channel;
    drop(ready_tx);
    drop(go_rx);

    // Rendezvous 1: the child has its stdio wired and is waiting for limits.
    if let Err(err) = channel::recv_token(ready_rx.as_raw_fd()) {
        error!("sandbox child died before readiness: {err:#}");
        terminate_and_reap(pid);
        return Ok(failure_report(started_at, start));
    }

    let exceeded = Arc::new(ExceededFlag::new());
    let (cgroups, watchdog) =
        match cgroups::install_limits(pid, &spec.limits, &spec.cgroups, &exceeded) {
            Ok(v) => v,
            Err(err) => {
                error!("failed to install resource limits: {err:#}");
                terminate_and_reap(pid);
                return Ok(failure_report(started_at, start));
            }
        };

    // Rendezvous 2: release the child into the jail.
    if let Err(err) = channel::send_token(go_tx.as_raw_fd()) {
        error!("failed to release sandbox child: {err:#}");
        // Stand the watchdog down before the pid disappears.
        watchdog.mark_terminated();
        terminate_and_reap(pid);
        watchdog.shutdown();
        cgroups.remove();
        return Ok(failure_report(started_at, start));
    }

    // No further rendezvous; both remaining ends go away now.
    drop(ready_rx);
    drop(go_tx);

    let status = match wait_child(pid) {
        Ok(status) => status,
        Err(err) => {
            // waitpid only fails if the child is not ours to reap; give up
            // on classification but tear everything down.
            error!("failed to wait for sandbox child: {err:#}");
            watchdog.mark_terminated();
            watchdog.shutdown();
            cgroups.remove();
            return Ok(failure_report(started_at, start));
        }
    };
    debug!(pid = pid.as_raw(), ?status, "sandbox child reaped");

    // The child is gone: stop the watchdog before reading the verdict, so a
    // late fire can neither signal the dead pid nor write the cause.
    watchdog.mark_terminated();
    watchdog.shutdown();

    // A breach can race a natural death past the watchdog's last poll; give
    // the controllers a final say before the cause is read.
    if exceeded.get() == ExceededCause::None {
        if let Some(cause) = cgroups.breach_cause() {
            exceeded.set(cause);
        }
    }

    let usage = cgroups.usage();
    cgroups.remove();

    let outcome = classify(status, exceeded.get());
    let (exit_code, term_signal) = match status {
        WaitStatus::Exited(_, code) => (Some(code), None),
        WaitStatus::Signaled(_, sig, _) => (None, Some(sig as i32)),
        _ => (None, None),
    };

    Ok(RunReport {
        outcome,
        exit_code,
        term_signal,
        wall_time_ms: start.elapsed().as_millis() as u64,
        cpu_time_us: usage.cpu_time_us,
        peak_memory_bytes: usage.peak_memory_bytes,
        started_at,
    })
}

/// Map the reaped status and the recorded breach cause to an outcome.
fn classify(status: WaitStatus, cause: ExceededCause) -> Outcome {
    if matches!(status, WaitStatus::Exited(_, code) if code == SETUP_FAILURE_STATUS) {
        return Outcome::Failure;
    }
    match cause {
        ExceededCause::None => match status {
            WaitStatus::Exited(..) => Outcome::Ok,
            WaitStatus::Signaled(..) => Outcome::RuntimeError,
            _ => Outcome::Failure,
        },
        ExceededCause::Memory => Outcome::MemoryExceeded,
        ExceededCause::WallClock => Outcome::TimeExceeded,
        ExceededCause::Tasks => Outcome::TaskExceeded,
        ExceededCause::Fatal => Outcome::Failure,
    }
}

/// Blocking wait, retried on EINTR.
fn wait_child(pid: Pid) -> Result<WaitStatus> {
    loop {
        match waitpid(pid, None) {
            Ok(status) => return Ok(status),
            Err(Errno::EINTR) => continue,
            Err(err) => return Err(err).context("waitpid failed"),
        }
    }
}

/// Abort path: ask the child to die, then reap it so no zombie outlives the
/// invocation. Before the go token the child is still our own bootstrap
/// code, which never blocks SIGTERM.
fn terminate_and_reap(pid: Pid) {
    let _ = kill(pid, Signal::SIGTERM);
    loop {
        match waitpid(pid, None) {
            Ok(_) => break,
            Err(Errno::EINTR) => continue,
            Err(_) => break,
        }
    }
}

fn failure_report(started_at: DateTime<Utc>, start: Instant) -> RunReport {
    RunReport {
        outcome: Outcome::Failure,
        exit_code: None,
        term_signal: None,
        wall_time_ms: start.elapsed().as_millis() as u64,
        cpu_time_us: None,
        peak_memory_bytes: None,
        started_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exited(code: i32) -> WaitStatus {
        WaitStatus::Exited(Pid::from_raw(100), code)
    }

    fn signaled(sig: Signal) -> WaitStatus {
        WaitStatus::Signaled(Pid::from_raw(100), sig, false)
    }

    #[test]
    fn clean_exit_is_ok() {
        assert_eq!(classify(exited(0), ExceededCause::None), Outcome::Ok);
        // A nonzero exit with limits intact is still the program's own
        // answer, not a sandbox verdict.
        assert_eq!(classify(exited(1), ExceededCause::None), Outcome::Ok);
    }

    #[test]
    fn setup_sentinel_is_failure_regardless_of_cause() {
        assert_eq!(
            classify(exited(SETUP_FAILURE_STATUS), ExceededCause::None),
            Outcome::Failure
        );
        assert_eq!(
            classify(exited(SETUP_FAILURE_STATUS), ExceededCause::WallClock),
            Outcome::Failure
        );
    }

    #[test]
    fn signal_without_cause_is_runtime_error() {
        assert_eq!(
            classify(signaled(Signal::SIGSYS), ExceededCause::None),
            Outcome::RuntimeError
        );
        assert_eq!(
            classify(signaled(Signal::SIGSEGV), ExceededCause::None),
            Outcome::RuntimeError
        );
    }

    #[test]
    fn causes_map_to_their_outcomes() {
        assert_eq!(
            classify(signaled(Signal::SIGKILL), ExceededCause::Memory),
            Outcome::MemoryExceeded
        );
        assert_eq!(
            classify(signaled(Signal::SIGKILL), ExceededCause::WallClock),
            Outcome::TimeExceeded
        );
        assert_eq!(
            classify(signaled(Signal::SIGKILL), ExceededCause::Tasks),
            Outcome::TaskExceeded
        );
        assert_eq!(
            classify(signaled(Signal::SIGKILL), ExceededCause::Fatal),
            Outcome::Failure
        );
    }

    #[test]
    fn cause_outranks_a_clean_exit() {
        // e.g. the task cap was hit but the program then exited normally.
        assert_eq!(
            classify(exited(0), ExceededCause::Tasks),
            Outcome::TaskExceeded
        );
    }

    #[test]
    fn stopped_child_is_a_failure() {
        let stopped = WaitStatus::Stopped(Pid::from_raw(100), Signal::SIGSTOP);
        assert_eq!(classify(stopped, ExceededCause::None), Outcome::Failure);
    }
}
