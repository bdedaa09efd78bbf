use anyhow::Result;

use crate::cli::{Cli, Command};

/// Dispatch a parsed CLI command. Returns the process exit code.
pub fn dispatch(cli: Cli) -> Result<i32> {
    match cli.command {
        Command::Run {
            jail,
            input,
            output,
            whitelist,
            memory,
            wall_ms,
            tasks,
            uid,
            gid,
            cgroup_memory,
            cgroup_pids,
            cgroup_cpuacct,
            json,
            prog,
        } => {
            #[cfg(not(target_os = "linux"))]
            {
                let _ = (
                    jail, input, output, whitelist, memory, wall_ms, tasks, uid, gid,
                    cgroup_memory, cgroup_pids, cgroup_cpuacct, json, prog,
                );
                anyhow::bail!("jailrun only runs on Linux");
            }

            #[cfg(target_os = "linux")]
            {
                use crate::core::model::{CgroupLocations, ResourceLimits, SandboxSpec};

                let spec = SandboxSpec {
                    prog,
                    jail,
                    input,
                    output,
                    whitelist,
                    cgroups: CgroupLocations {
                        memory: cgroup_memory,
                        pids: cgroup_pids,
                        cpuacct: cgroup_cpuacct,
                    },
                    limits: ResourceLimits {
                        memory_bytes: memory,
                        wall_clock_ms: wall_ms,
                        max_tasks: tasks,
                    },
                    uid,
                    gid,
                };

                let report = crate::platform::linux::process::run(&spec)?;

                if json {
                    println!("{}", report.render_json()?);
                } else {
                    print!("{}", report.render_text());
                }

                Ok(report.outcome.exit_code())
            }
        }
    }
}
