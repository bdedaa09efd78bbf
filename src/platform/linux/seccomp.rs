//! Syscall whitelist: parsing, compilation to a seccomp BPF program, and
//! installation on the calling thread.
//!
//! Whitelist files are plain text, one syscall name per line; blank lines
//! and `#` comments are ignored. Anything not listed kills the program
//! (SIGSYS), which the supervisor reports as a runtime error.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;

use anyhow::{anyhow, bail, Context, Result};
use seccompiler::{BpfProgram, SeccompAction, SeccompFilter, SeccompRule};

/// Read the whole whitelist from `file` (consuming and closing the fd),
/// compile it, and apply it to the calling thread. After this returns, only
/// whitelisted syscalls are possible.
pub fn install_from_file(mut file: File) -> Result<()> {
    let mut contents = String::new();
    file.read_to_string(&mut contents)
        .context("failed to read syscall whitelist")?;
    drop(file);
    install(&contents)
}

pub fn install(contents: &str) -> Result<()> {
    let program = compile(contents)?;
    // Installing a filter without CAP_SYS_ADMIN requires the no-new-privs
    // bit, and privileges were dropped before we got here.
    let rc = unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error()).context("failed to set no_new_privs");
    }
    seccompiler::apply_filter(&program)
        .map_err(|e| anyhow!("failed to apply seccomp filter: {e}"))
}

/// Compile a whitelist into a BPF program. Names unknown on this
/// architecture are skipped; skipping only ever narrows what is allowed.
pub fn compile(contents: &str) -> Result<BpfProgram> {
    let names = parse_whitelist(contents);
    if names.is_empty() {
        bail!("syscall whitelist is empty");
    }

    let mut rules: BTreeMap<i64, Vec<SeccompRule>> = BTreeMap::new();
    for name in &names {
        if let Some(nr) = syscall_nr(name) {
            rules.insert(nr, Vec::new());
        }
    }
    if rules.is_empty() {
        bail!("no whitelisted syscall is known on this architecture");
    }

    let filter = SeccompFilter::new(
        rules,
        SeccompAction::KillProcess,
        SeccompAction::Allow,
        target_arch(),
    )
    .map_err(|e| anyhow!("failed to build seccomp filter: {e}"))?;

    filter
        .try_into()
        .map_err(|e: seccompiler::BackendError| anyhow!("failed to compile seccomp filter: {e}"))
}

/// Split a whitelist file into syscall names.
pub fn parse_whitelist(contents: &str) -> Vec<&str> {
    contents
        .lines()
        .map(|line| match line.find('#') {
            Some(idx) => line[..idx].trim(),
            None => line.trim(),
        })
        .filter(|line| !line.is_empty())
        .collect()
}

fn target_arch() -> seccompiler::TargetArch {
    #[cfg(target_arch = "x86_64")]
    {
        seccompiler::TargetArch::x86_64
    }
    #[cfg(target_arch = "aarch64")]
    {
        seccompiler::TargetArch::aarch64
    }
    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    {
        compile_error!("unsupported architecture for the seccomp filter")
    }
}

/// Map a syscall name to its number on the running architecture.
fn syscall_nr(name: &str) -> Option<i64> {
    if let Some(nr) = common_syscall_nr(name) {
        return Some(nr);
    }
    #[cfg(target_arch = "x86_64")]
    if let Some(nr) = legacy_syscall_nr(name) {
        return Some(nr);
    }
    None
}

/// Syscalls present on both x86_64 and aarch64.
fn common_syscall_nr(name: &str) -> Option<i64> {
    Some(match name {
        // program lifecycle
        "exit" => libc::SYS_exit,
        "exit_group" => libc::SYS_exit_group,
        "execve" => libc::SYS_execve,
        "execveat" => libc::SYS_execveat,
        "clone" => libc::SYS_clone,
        "clone3" => libc::SYS_clone3,
        "wait4" => libc::SYS_wait4,
        "waitid" => libc::SYS_waitid,
        // file I/O
        "read" => libc::SYS_read,
        "write" => libc::SYS_write,
        "readv" => libc::SYS_readv,
        "writev" => libc::SYS_writev,
        "pread64" => libc::SYS_pread64,
        "pwrite64" => libc::SYS_pwrite64,
        "openat" => libc::SYS_openat,
        "close" => libc::SYS_close,
        "lseek" => libc::SYS_lseek,
        "dup" => libc::SYS_dup,
        "dup3" => libc::SYS_dup3,
        "fcntl" => libc::SYS_fcntl,
        "pipe2" => libc::SYS_pipe2,
        "ioctl" => libc::SYS_ioctl,
        "fstat" => libc::SYS_fstat,
        "newfstatat" => libc::SYS_newfstatat,
        "statx" => libc::SYS_statx,
        "faccessat" => libc::SYS_faccessat,
        "readlinkat" => libc::SYS_readlinkat,
        "getdents64" => libc::SYS_getdents64,
        "getcwd" => libc::SYS_getcwd,
        "unlinkat" => libc::SYS_unlinkat,
        "mkdirat" => libc::SYS_mkdirat,
        "renameat" => libc::SYS_renameat,
        // polling
        "ppoll" => libc::SYS_ppoll,
        "pselect6" => libc::SYS_pselect6,
        // memory
        "brk" => libc::SYS_brk,
        "mmap" => libc::SYS_mmap,
        "munmap" => libc::SYS_munmap,
        "mprotect" => libc::SYS_mprotect,
        "mremap" => libc::SYS_mremap,
        "madvise" => libc::SYS_madvise,
        "mincore" => libc::SYS_mincore,
        // signals
        "rt_sigaction" => libc::SYS_rt_sigaction,
        "rt_sigprocmask" => libc::SYS_rt_sigprocmask,
        "rt_sigreturn" => libc::SYS_rt_sigreturn,
        "sigaltstack" => libc::SYS_sigaltstack,
        // threading support
        "futex" => libc::SYS_futex,
        "set_tid_address" => libc::SYS_set_tid_address,
        "set_robust_list" => libc::SYS_set_robust_list,
        "rseq" => libc::SYS_rseq,
        "sched_yield" => libc::SYS_sched_yield,
        "sched_getaffinity" => libc::SYS_sched_getaffinity,
        // identity and process info
        "getpid" => libc::SYS_getpid,
        "getppid" => libc::SYS_getppid,
        "gettid" => libc::SYS_gettid,
        "getuid" => libc::SYS_getuid,
        "geteuid" => libc::SYS_geteuid,
        "getgid" => libc::SYS_getgid,
        "getegid" => libc::SYS_getegid,
        "getgroups" => libc::SYS_getgroups,
        // time
        "clock_gettime" => libc::SYS_clock_gettime,
        "clock_getres" => libc::SYS_clock_getres,
        "clock_nanosleep" => libc::SYS_clock_nanosleep,
        "nanosleep" => libc::SYS_nanosleep,
        "gettimeofday" => libc::SYS_gettimeofday,
        // misc
        "uname" => libc::SYS_uname,
        "sysinfo" => libc::SYS_sysinfo,
        "times" => libc::SYS_times,
        "getrusage" => libc::SYS_getrusage,
        "getrandom" => libc::SYS_getrandom,
        "prctl" => libc::SYS_prctl,
        "prlimit64" => libc::SYS_prlimit64,
        "umask" => libc::SYS_umask,
        _ => return None,
    })
}

/// Legacy syscalls that exist on x86_64 but have no aarch64 counterpart.
#[cfg(target_arch = "x86_64")]
fn legacy_syscall_nr(name: &str) -> Option<i64> {
    Some(match name {
        "open" => libc::SYS_open,
        "creat" => libc::SYS_creat,
        "stat" => libc::SYS_stat,
        "lstat" => libc::SYS_lstat,
        "access" => libc::SYS_access,
        "readlink" => libc::SYS_readlink,
        "pipe" => libc::SYS_pipe,
        "dup2" => libc::SYS_dup2,
        "poll" => libc::SYS_poll,
        "select" => libc::SYS_select,
        "fork" => libc::SYS_fork,
        "vfork" => libc::SYS_vfork,
        "getdents" => libc::SYS_getdents,
        "unlink" => libc::SYS_unlink,
        "mkdir" => libc::SYS_mkdir,
        "rmdir" => libc::SYS_rmdir,
        "rename" => libc::SYS_rename,
        "time" => libc::SYS_time,
        "alarm" => libc::SYS_alarm,
        "pause" => libc::SYS_pause,
        "arch_prctl" => libc::SYS_arch_prctl,
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whitelist_parsing_skips_blanks_and_comments() {
        let contents = "\
# baseline
read
write

exit_group   # always needed
  brk
";
        assert_eq!(
            parse_whitelist(contents),
            vec!["read", "write", "exit_group", "brk"]
        );
    }

    #[test]
    fn known_syscalls_resolve() {
        for name in ["read", "write", "execve", "brk", "exit_group", "clone"] {
            assert!(syscall_nr(name).is_some(), "{name} should resolve");
        }
    }

    #[test]
    fn names_outside_the_table_do_not_resolve() {
        assert!(syscall_nr("not_a_syscall").is_none());
        // Networking is deliberately absent from the table; a whitelist
        // cannot grant what the sandbox never maps.
        assert!(syscall_nr("socket").is_none());
    }

    #[test]
    fn compile_produces_a_nonempty_program() {
        let program = compile("read\nwrite\nexit_group\nexecve\n").unwrap();
        assert!(!program.is_empty());
    }

    #[test]
    fn compile_tolerates_unknown_names() {
        // Unknown names narrow the filter, they do not break it.
        let program = compile("read\nwrite\nexit_group\nfrobnicate\n").unwrap();
        assert!(!program.is_empty());
    }

    #[test]
    fn empty_whitelist_is_an_error() {
        assert!(compile("").is_err());
        assert!(compile("# only a comment\n").is_err());
    }

    #[test]
    fn fully_unknown_whitelist_is_an_error() {
        assert!(compile("frobnicate\nblorp\n").is_err());
    }
}
