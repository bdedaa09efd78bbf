//! The bootstrap that runs inside the cloned child, between `clone` and
//! `execve`.
//!
//! The step order is load-bearing: host files are opened before the jail is
//! entered, the rendezvous happens before any confinement so the parent can
//! still install limits on a fully visible pid, group identity is dropped
//! before user identity, and the syscall filter goes in last so that none of
//! the earlier steps need whitelisting.

use std::ffi::CString;
use std::fs::File;
use std::os::unix::io::{FromRawFd, RawFd};
use std::path::PathBuf;

use nix::fcntl::{open, OFlag};
use nix::sys::stat::Mode;
use nix::unistd::{chdir, chroot, close, dup2, execve, setgid, setgroups, setuid, Gid, Uid};

use crate::platform::linux::channel::{self, ChildFds};
use crate::platform::linux::seccomp;

/// Exit status the child uses to signal "the sandbox failed before exec".
/// Outside the 0–125 band of ordinary exits, so the parent can tell it apart
/// from anything the program says with `exit`.
pub(crate) const SETUP_FAILURE_STATUS: i32 = 127;

/// Everything the child needs, assembled by the parent before `clone`. The
/// child reads it from its copy-on-write view of the parent's memory and
/// never touches it after `execve`.
pub(crate) struct ChildPayload {
    /// Post-chroot path of the target binary, exec-ready.
    pub prog: CString,
    pub jail: PathBuf,
    pub input: PathBuf,
    pub output: PathBuf,
    pub whitelist: PathBuf,
    pub fds: ChildFds,
    pub uid: u32,
    pub gid: u32,
}

/// Evaluate a bootstrap step; on failure print one diagnostic line (file,
/// line, step, errno-bearing cause) and bail out with the setup sentinel.
/// The child cannot propagate errors anywhere else: the parent learns about
/// the failure from the exit status and handles all cleanup.
macro_rules! try_step {
    ($expr:expr, $what:expr) => {
        match $expr {
            Ok(v) => v,
            Err(err) => {
                eprintln!("jailrun[child] {}:{}: {}: {:#}", file!(), line!(), $what, err);
                return SETUP_FAILURE_STATUS as isize;
            }
        }
    };
}

/// Entry point of the cloned child. Returns only on setup failure; on
/// success `execve` replaces the process.
pub(crate) fn child_main(payload: &ChildPayload) -> isize {
    // The parent's pipe ends are not ours to keep; closing them is what
    // makes a dead parent (or child) observable as EOF on the other side.
    for fd in payload.fds.parent_ends {
        channel::close_fd(fd);
    }

    // Input and output live at host paths, so both opens must happen while
    // the host view is still there.
    let stdin_fd = try_step!(
        open(&payload.input, OFlag::O_RDONLY, Mode::empty()),
        "open input file"
    );
    let stdout_fd = try_step!(
        open(
            &payload.output,
            OFlag::O_WRONLY | OFlag::O_CREAT | OFlag::O_TRUNC,
            Mode::from_bits_truncate(0o600),
        ),
        "open output file"
    );
    try_step!(dup2(stdin_fd, 0), "wire stdin");
    try_step!(dup2(stdout_fd, 1), "wire stdout");
    try_step!(close(stdin_fd), "close input fd");
    try_step!(close(stdout_fd), "close output fd");

    // Rendezvous: announce readiness, then block until the parent has the
    // cgroups written and the watchdog armed.
    try_step!(channel::send_token(payload.fds.ready_tx), "signal readiness");
    try_step!(channel::recv_token(payload.fds.go_rx), "wait for release");
    channel::close_fd(payload.fds.ready_tx);
    channel::close_fd(payload.fds.go_rx);

    // The whitelist may live outside the jail; grab it while host paths
    // still resolve. Close-on-exec, like everything else we hold.
    let whitelist_fd = try_step!(
        open(
            &payload.whitelist,
            OFlag::O_RDONLY | OFlag::O_CLOEXEC,
            Mode::empty(),
        ),
        "open syscall whitelist"
    );
    // SAFETY: freshly opened above and owned by this process alone.
    let whitelist = unsafe { File::from_raw_fd(whitelist_fd) };

    // Anything else inherited across clone must not survive into the
    // program. Needs /proc, so it happens before chroot.
    try_step!(mark_cloexec_from(3), "mark inherited fds close-on-exec");

    try_step!(chdir(&payload.jail), "chdir into jail");
    try_step!(chroot("."), "chroot into jail");

    // Groups before uid: once the uid is unprivileged these calls are gone.
    try_step!(setgroups(&[]), "clear supplementary groups");
    try_step!(setgid(Gid::from_raw(payload.gid)), "drop gid");
    try_step!(setuid(Uid::from_raw(payload.uid)), "drop uid");

    // From here on, only whitelisted syscalls run; execve itself must be on
    // the list.
    try_step!(
        seccomp::install_from_file(whitelist),
        "install syscall filter"
    );

    let argv = [payload.prog.clone()];
    let env: [CString; 0] = [];
    match execve(&payload.prog, &argv, &env) {
        Ok(infallible) => match infallible {},
        Err(err) => {
            eprintln!(
                "jailrun[child] {}:{}: execve target: {}",
                file!(),
                line!(),
                err
            );
            SETUP_FAILURE_STATUS as isize
        }
    }
}

/// Set FD_CLOEXEC on every descriptor >= `min_fd`, so nothing the supervisor
/// had open leaks through `execve`.
fn mark_cloexec_from(min_fd: RawFd) -> std::io::Result<()> {
    for entry in std::fs::read_dir("/proc/self/fd")? {
        let entry = entry?;
        let fd: RawFd = match entry.file_name().to_string_lossy().parse() {
            Ok(fd) => fd,
            Err(_) => continue,
        };
        if fd < min_fd {
            continue;
        }
        // Flagging the read_dir iterator's own fd is harmless; it closes
        // when the iterator drops.
        unsafe {
            libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::io::AsRawFd;

    #[test]
    fn setup_failure_status_is_outside_ordinary_exit_band() {
        assert!(SETUP_FAILURE_STATUS > 125);
        assert!(SETUP_FAILURE_STATUS <= 255);
    }

    #[test]
    fn mark_cloexec_sets_the_flag() {
        let file = tempfile::tempfile().unwrap();
        // std opens with O_CLOEXEC; dup() yields a descriptor without it.
        let fd = unsafe { libc::dup(file.as_raw_fd()) };
        assert!(fd >= 3);
        let before = unsafe { libc::fcntl(fd, libc::F_GETFD) };
        assert_eq!(before & libc::FD_CLOEXEC, 0);

        mark_cloexec_from(3).unwrap();

        let after = unsafe { libc::fcntl(fd, libc::F_GETFD) };
        assert_ne!(after & libc::FD_CLOEXEC, 0);
        unsafe {
            libc::close(fd);
        }
    }
}
