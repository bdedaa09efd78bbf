use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::core::model::Outcome;

/// The result of one sandboxed run, as handed back to the caller.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub outcome: Outcome,
    /// Exit status, when the program exited normally.
    pub exit_code: Option<i32>,
    /// Terminating signal number, when the program was killed.
    pub term_signal: Option<i32>,
    /// Wall-clock time of the whole run as observed by the supervisor.
    pub wall_time_ms: u64,
    /// CPU time charged to the run's cgroup, in microseconds.
    pub cpu_time_us: Option<u64>,
    /// Peak memory usage recorded by the memory controller, in bytes.
    pub peak_memory_bytes: Option<u64>,
    pub started_at: DateTime<Utc>,
}

impl RunReport {
    pub fn render_json(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn render_text(&self) -> String {
        let mut out = format!("outcome: {}\n", self.outcome);
        if let Some(code) = self.exit_code {
            out.push_str(&format!("exit code: {code}\n"));
        }
        if let Some(sig) = self.term_signal {
            out.push_str(&format!("terminated by signal: {sig}\n"));
        }
        out.push_str(&format!("wall time: {} ms\n", self.wall_time_ms));
        if let Some(us) = self.cpu_time_us {
            out.push_str(&format!("cpu time: {us} us\n"));
        }
        if let Some(bytes) = self.peak_memory_bytes {
            out.push_str(&format!("peak memory: {bytes} bytes\n"));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_report() -> RunReport {
        RunReport {
            outcome: Outcome::Ok,
            exit_code: Some(0),
            term_signal: None,
            wall_time_ms: 12,
            cpu_time_us: Some(3021),
            peak_memory_bytes: Some(1048576),
            started_at: Utc::now(),
        }
    }

    #[test]
    fn text_report_lists_known_fields() {
        let text = sample_report().render_text();
        assert!(text.contains("outcome: ok"));
        assert!(text.contains("exit code: 0"));
        assert!(text.contains("wall time: 12 ms"));
        assert!(text.contains("cpu time: 3021 us"));
        assert!(!text.contains("signal"));
    }

    #[test]
    fn text_report_shows_signal_when_killed() {
        let mut report = sample_report();
        report.outcome = Outcome::RuntimeError;
        report.exit_code = None;
        report.term_signal = Some(9);
        let text = report.render_text();
        assert!(text.contains("outcome: runtime-error"));
        assert!(text.contains("terminated by signal: 9"));
        assert!(!text.contains("exit code"));
    }

    #[test]
    fn json_report_is_machine_readable() {
        let json = sample_report().render_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["outcome"], "ok");
        assert_eq!(value["exit_code"], 0);
        assert_eq!(value["peak_memory_bytes"], 1048576);
    }
}
