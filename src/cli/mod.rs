pub mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// jailrun: run one untrusted program in a chroot jail under resource caps
/// and a syscall whitelist.
#[derive(Parser, Debug)]
#[command(name = "jailrun", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a program inside the sandbox and report how it terminated.
    Run {
        /// Path to the jail root directory (becomes / for the program).
        #[arg(long)]
        jail: PathBuf,

        /// Host path of the file wired to the program's stdin.
        #[arg(long)]
        input: PathBuf,

        /// Host path of the file wired to the program's stdout
        /// (created/truncated, mode 0600).
        #[arg(long)]
        output: PathBuf,

        /// Host path of the syscall whitelist (one syscall name per line,
        /// `#` comments allowed).
        #[arg(long)]
        whitelist: PathBuf,

        /// Memory cap in bytes (cgroup memory.limit_in_bytes).
        #[arg(long, default_value_t = 256 * 1024 * 1024)]
        memory: u64,

        /// Wall-clock cap in milliseconds.
        #[arg(long = "wall-ms", default_value_t = 10_000)]
        wall_ms: u64,

        /// Maximum number of tasks (processes/threads), the program included.
        #[arg(long, default_value_t = 1)]
        tasks: u64,

        /// UID the program runs as. Must not be 0.
        #[arg(long)]
        uid: u32,

        /// GID the program runs as. Must not be 0.
        #[arg(long)]
        gid: u32,

        /// Memory controller directory under which the per-run cgroup is created.
        #[arg(long, default_value = "/sys/fs/cgroup/memory/jailrun")]
        cgroup_memory: PathBuf,

        /// Pids controller directory under which the per-run cgroup is created.
        #[arg(long, default_value = "/sys/fs/cgroup/pids/jailrun")]
        cgroup_pids: PathBuf,

        /// Cpuacct controller directory under which the per-run cgroup is created.
        #[arg(long, default_value = "/sys/fs/cgroup/cpuacct/jailrun")]
        cgroup_cpuacct: PathBuf,

        /// Print the run report as JSON instead of text.
        #[arg(long)]
        json: bool,

        /// Path of the program to execute, as seen from inside the jail
        /// (e.g. `/prog`).
        prog: String,
    },
}

/// Parse CLI arguments. Called from `main`.
pub fn parse() -> Cli {
    Cli::parse()
}
