#![forbid(unsafe_code)]

use crate::command::{CommandError, format_exit_status, run_with_timeout};
use crate::config::SchedulerConfig;
use nw_core::SchedulerRow;
use std::process::Command;
use std::time::Duration;

/// `%A` job id, `%u` user, `%T` state, `%N` node list.
const SQUEUE_FORMAT: &str = "--format=%A %u %T %N";
const BACKEND_ERROR_MARKER: &str = "ERROR";

#[derive(Debug, thiserror::Error)]
pub(crate) enum SchedulerError {
    #[error("scheduler query could not run: {0}")]
    Command(#[from] CommandError),
    #[error("scheduler query failed ({status}): {stderr}")]
    Failed { status: String, stderr: String },
    #[error("scheduler reported an error: {0}")]
    Backend(String),
    #[error("unparsable scheduler line {line:?}")]
    Unparsable { line: String },
}

/// Source of the running-job listing for the configured users.
pub(crate) trait SchedulerQuery: Sync {
    fn running_jobs(&self) -> Result<Vec<SchedulerRow>, SchedulerError>;
}

#[derive(Debug, Clone)]
pub(crate) struct Squeue {
    bin: String,
    sudo: bool,
    users: Vec<String>,
    partitions: Vec<String>,
    timeout: Duration,
}

impl Squeue {
    pub(crate) fn from_config(cfg: &SchedulerConfig) -> Self {
        Self {
            bin: cfg.squeue_bin.clone(),
            sudo: cfg.sudo,
            users: cfg.users.clone(),
            partitions: cfg.partitions.clone(),
            timeout: Duration::from_secs(cfg.timeout_s),
        }
    }

    fn command(&self) -> Command {
        let mut cmd = if self.sudo {
            let mut cmd = Command::new("sudo");
            cmd.arg("-n").arg(&self.bin);
            cmd
        } else {
            Command::new(&self.bin)
        };
        cmd.arg("-u")
            .arg(self.users.join(","))
            .arg("-t")
            .arg("RUNNING");
        if !self.partitions.is_empty() {
            cmd.arg("-p").arg(self.partitions.join(","));
        }
        cmd.arg("--noheader").arg(SQUEUE_FORMAT);
        cmd
    }
}

impl SchedulerQuery for Squeue {
    fn running_jobs(&self) -> Result<Vec<SchedulerRow>, SchedulerError> {
        let out = run_with_timeout(&mut self.command(), self.timeout)?;
        if !out.status.success() {
            return Err(SchedulerError::Failed {
                status: format_exit_status(&out.status),
                stderr: out.stderr.trim().to_string(),
            });
        }
        if let Some(line) = out
            .stdout
            .lines()
            .chain(out.stderr.lines())
            .find(|line| line.contains(BACKEND_ERROR_MARKER))
        {
            return Err(SchedulerError::Backend(line.trim().to_string()));
        }
        parse_squeue_output(&out.stdout)
    }
}

/// Any line that does not split into exactly four fields fails the whole
/// listing: a half-understood snapshot must not drive finish detection.
pub(crate) fn parse_squeue_output(stdout: &str) -> Result<Vec<SchedulerRow>, SchedulerError> {
    let mut rows = Vec::new();
    for line in stdout.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let fields = trimmed.split_whitespace().collect::<Vec<_>>();
        let [job_id, user, state, node_range] = fields.as_slice() else {
            return Err(SchedulerError::Unparsable {
                line: trimmed.to_string(),
            });
        };
        rows.push(SchedulerRow {
            job_id: job_id.to_string(),
            user: user.to_string(),
            state: state.to_string(),
            node_range: node_range.to_string(),
        });
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn squeue(sudo: bool, partitions: &[&str]) -> Squeue {
        Squeue {
            bin: "squeue".to_string(),
            sudo,
            users: vec!["alice".to_string(), "bob".to_string()],
            partitions: partitions.iter().map(|p| p.to_string()).collect(),
            timeout: Duration::from_secs(5),
        }
    }

    fn args_for(cmd: &Command) -> Vec<String> {
        cmd.get_args()
            .map(|arg| arg.to_string_lossy().to_string())
            .collect::<Vec<_>>()
    }

    #[test]
    fn command_filters_users_state_and_partitions() {
        let cmd = squeue(false, &["compute", "gpu"]).command();
        assert_eq!(cmd.get_program(), "squeue");
        assert_eq!(
            args_for(&cmd),
            vec![
                "-u",
                "alice,bob",
                "-t",
                "RUNNING",
                "-p",
                "compute,gpu",
                "--noheader",
                "--format=%A %u %T %N",
            ]
        );
    }

    #[test]
    fn sudo_wraps_the_query_without_partitions() {
        let cmd = squeue(true, &[]).command();
        assert_eq!(cmd.get_program(), "sudo");
        let args = args_for(&cmd);
        assert_eq!(&args[..2], &["-n", "squeue"]);
        assert!(!args.iter().any(|a| a == "-p"), "{args:?}");
    }

    #[test]
    fn parses_listing() {
        let rows = parse_squeue_output(
            "1001 alice RUNNING nid00[010-011]\n\n  1002 bob RUNNING nid00020\n",
        )
        .expect("parse");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].job_id, "1001");
        assert_eq!(rows[0].node_range, "nid00[010-011]");
        assert_eq!(rows[1].user, "bob");
    }

    #[test]
    fn empty_listing_is_not_an_error() {
        assert!(parse_squeue_output("").expect("parse").is_empty());
    }

    #[test]
    fn short_or_long_lines_fail_the_listing() {
        assert!(matches!(
            parse_squeue_output("1001 alice RUNNING\n"),
            Err(SchedulerError::Unparsable { .. })
        ));
        assert!(matches!(
            parse_squeue_output("1001 alice RUNNING nid001 extra\n"),
            Err(SchedulerError::Unparsable { .. })
        ));
    }

    #[cfg(unix)]
    #[test]
    fn backend_error_text_fails_the_query() {
        // echo prints its arguments back, marker included.
        let query = Squeue {
            bin: "/bin/echo".to_string(),
            sudo: false,
            users: vec!["ERROR".to_string()],
            partitions: Vec::new(),
            timeout: Duration::from_secs(10),
        };
        assert!(matches!(
            query.running_jobs(),
            Err(SchedulerError::Backend(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn non_zero_exit_fails_the_query() {
        let query = Squeue {
            bin: "/bin/false".to_string(),
            sudo: false,
            users: vec!["alice".to_string()],
            partitions: Vec::new(),
            timeout: Duration::from_secs(10),
        };
        assert!(matches!(
            query.running_jobs(),
            Err(SchedulerError::Failed { .. })
        ));
    }
}
