//! Watchdog for a sandboxed child: kills it when the wall-clock budget
//! expires or when the cgroup controllers report a breach, and records the
//! cause exactly once.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tracing::debug;

use crate::core::model::ExceededCause;

/// Interval at which the watchdog re-checks the breach probe while waiting
/// for the wall-clock deadline.
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// One-shot cell for the breach cause. The first writer wins; everyone else
/// sees the stored value.
pub struct ExceededFlag(AtomicU8);

impl ExceededFlag {
    pub fn new() -> Self {
        Self(AtomicU8::new(ExceededCause::None as u8))
    }

    /// Record `cause` if nothing has been recorded yet. Returns whether this
    /// call was the one that stored it.
    pub fn set(&self, cause: ExceededCause) -> bool {
        self.0
            .compare_exchange(
                ExceededCause::None as u8,
                cause as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub fn get(&self) -> ExceededCause {
        ExceededCause::from_u8(self.0.load(Ordering::Acquire))
    }
}

impl Default for ExceededFlag {
    fn default() -> Self {
        Self::new()
    }
}

/// Watchdog lifecycle. `FiredCleaning` and `FiredDone` exist so the parent
/// can tell "still killing" from "finished" when it cancels after reaping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Armed,
    FiredCleaning,
    FiredDone,
    Cancelled,
}

struct Inner {
    state: State,
    /// Set by the parent once `waitpid` has returned. A terminated child is
    /// never signalled and never charged a breach by the watchdog.
    terminated: bool,
}

struct Shared {
    inner: Mutex<Inner>,
    cond: Condvar,
}

/// Handle held by the parent controller. Dropping it cancels the watchdog
/// and joins the thread.
pub struct Terminator {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

/// Arm a watchdog for `child`. `probe` is consulted between waits and may
/// report a memory or task breach ahead of the wall-clock deadline.
pub fn arm<P>(child: Pid, wall_clock: Duration, exceeded: Arc<ExceededFlag>, probe: P) -> Terminator
where
    P: Fn() -> Option<ExceededCause> + Send + 'static,
{
    let shared = Arc::new(Shared {
        inner: Mutex::new(Inner {
            state: State::Armed,
            terminated: false,
        }),
        cond: Condvar::new(),
    });
    let thread = {
        let shared = Arc::clone(&shared);
        thread::spawn(move || watch(child, wall_clock, exceeded, probe, shared))
    };
    Terminator {
        shared,
        thread: Some(thread),
    }
}

fn watch<P>(
    child: Pid,
    wall_clock: Duration,
    exceeded: Arc<ExceededFlag>,
    probe: P,
    shared: Arc<Shared>,
) where
    P: Fn() -> Option<ExceededCause>,
{
    let deadline = Instant::now() + wall_clock;
    let mut inner = shared.inner.lock().unwrap();
    loop {
        if inner.terminated || inner.state != State::Armed {
            if inner.state == State::Armed {
                inner.state = State::Cancelled;
            }
            shared.cond.notify_all();
            return;
        }

        let now = Instant::now();
        let cause = if now >= deadline {
            Some(ExceededCause::WallClock)
        } else {
            // Probe without holding the lock; the parent only ever waits on
            // us, never the other way around.
            drop(inner);
            let cause = probe();
            inner = shared.inner.lock().unwrap();
            cause
        };

        match cause {
            // The state may have moved while the probe ran; re-check before
            // acting on a stale verdict.
            Some(cause) if !inner.terminated && inner.state == State::Armed => {
                inner.state = State::FiredCleaning;
                exceeded.set(cause);
                debug!(pid = child.as_raw(), ?cause, "watchdog firing");
                // Kill under the lock: mark_terminated() cannot complete
                // until the signal has been sent, so the parent never
                // observes a half-fired watchdog.
                let _ = kill(child, Signal::SIGKILL);
                inner.state = State::FiredDone;
                shared.cond.notify_all();
                return;
            }
            _ => {}
        }

        let timeout = deadline
            .saturating_duration_since(Instant::now())
            .min(POLL_INTERVAL);
        let (guard, _) = shared
            .cond
            .wait_timeout(inner, timeout.max(Duration::from_millis(1)))
            .unwrap();
        inner = guard;
    }
}

impl Terminator {
    /// Tell the watchdog the child has been reaped. From this point it will
    /// neither signal the pid nor record a breach.
    pub fn mark_terminated(&self) {
        let mut inner = self.shared.inner.lock().unwrap();
        inner.terminated = true;
        self.shared.cond.notify_all();
    }

    /// Cancel the watchdog (or, if it already fired, wait for it to finish)
    /// and join the thread.
    pub fn shutdown(mut self) {
        self.cancel_and_join();
    }

    fn cancel_and_join(&mut self) {
        {
            let mut inner = self.shared.inner.lock().unwrap();
            inner.terminated = true;
            self.shared.cond.notify_all();
            // A fired watchdog finishes on its own; wait for it rather than
            // racing its cleanup.
            while inner.state == State::FiredCleaning {
                inner = self.shared.cond.wait(inner).unwrap();
            }
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for Terminator {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.cancel_and_join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::process::ExitStatusExt;
    use std::process::Command;

    fn spawn_sleeper(seconds: &str) -> std::process::Child {
        Command::new("sleep")
            .arg(seconds)
            .spawn()
            .expect("failed to spawn sleep")
    }

    #[test]
    fn fires_on_wall_clock_expiry() {
        let mut child = spawn_sleeper("5");
        let pid = Pid::from_raw(child.id() as i32);
        let exceeded = Arc::new(ExceededFlag::new());

        let term = arm(pid, Duration::from_millis(50), Arc::clone(&exceeded), || None);

        let status = child.wait().unwrap();
        assert_eq!(status.signal(), Some(libc::SIGKILL));
        term.mark_terminated();
        term.shutdown();
        assert_eq!(exceeded.get(), ExceededCause::WallClock);
    }

    #[test]
    fn fires_on_breach_before_deadline() {
        let mut child = spawn_sleeper("5");
        let pid = Pid::from_raw(child.id() as i32);
        let exceeded = Arc::new(ExceededFlag::new());

        let term = arm(pid, Duration::from_secs(60), Arc::clone(&exceeded), || {
            Some(ExceededCause::Tasks)
        });

        let status = child.wait().unwrap();
        assert_eq!(status.signal(), Some(libc::SIGKILL));
        term.mark_terminated();
        term.shutdown();
        assert_eq!(exceeded.get(), ExceededCause::Tasks);
    }

    #[test]
    fn cancelled_watchdog_leaves_child_alone() {
        let mut child = spawn_sleeper("0.2");
        let pid = Pid::from_raw(child.id() as i32);
        let exceeded = Arc::new(ExceededFlag::new());

        let term = arm(pid, Duration::from_secs(60), Arc::clone(&exceeded), || None);

        let status = child.wait().unwrap();
        term.mark_terminated();
        term.shutdown();
        assert!(status.success());
        assert_eq!(exceeded.get(), ExceededCause::None);
    }

    #[test]
    fn exceeded_flag_is_write_once() {
        let flag = ExceededFlag::new();
        assert!(flag.set(ExceededCause::WallClock));
        assert!(!flag.set(ExceededCause::Memory));
        assert_eq!(flag.get(), ExceededCause::WallClock);
    }
}
