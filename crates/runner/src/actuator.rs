#![forbid(unsafe_code)]

use crate::command::{CommandError, CommandOutput, format_exit_status, run_with_timeout};
use crate::config::{CollectionConfig, MonitorConfig};
use nw_core::artifact_file_name;
use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

/// Scheduler wrappers that show up in every job's process list.
const PLUMBING_PROCESSES: [&str; 3] = ["srun", "slurm_script", "CMD"];
const SSH_OPTIONS: [&str; 4] = ["-o", "BatchMode=yes", "-o", "ConnectTimeout=15"];
/// ssh and scp exit 255 when the connection itself failed.
const SSH_LINK_FAILURES: &[i32] = &[255];
/// rsync: protocol start, socket I/O, stream, data and connect timeouts, ssh.
const RSYNC_LINK_FAILURES: &[i32] = &[5, 10, 12, 30, 35, 255];
/// Suffix of the agent copy waiting to replace the live script.
const STAGED_SUFFIX: &str = ".new";

#[derive(Debug, thiserror::Error)]
pub(crate) enum ActuationError {
    /// The command could not be issued at all.
    #[error("{host}: {reason}")]
    Spawn { host: String, reason: String },
    #[error("{host}: timed out after {secs}s")]
    Timeout { host: String, secs: u64 },
    /// The transport failed before the remote side could act.
    #[error("{host}: unreachable ({status}): {stderr}")]
    Unreachable {
        host: String,
        status: String,
        stderr: String,
    },
    /// The command ran and the remote side refused it.
    #[error("{host}: rejected ({status}): {stderr}")]
    Rejected {
        host: String,
        status: String,
        stderr: String,
    },
}

impl ActuationError {
    /// True when nothing reached the host.
    pub(crate) fn is_unissued(&self) -> bool {
        matches!(
            self,
            ActuationError::Spawn { .. }
                | ActuationError::Timeout { .. }
                | ActuationError::Unreachable { .. }
        )
    }

    fn from_command(host: &str, err: CommandError) -> Self {
        match err {
            CommandError::Timeout { timeout, .. } => ActuationError::Timeout {
                host: host.to_string(),
                secs: timeout.as_secs(),
            },
            other => ActuationError::Spawn {
                host: host.to_string(),
                reason: other.to_string(),
            },
        }
    }
}

/// Per-host operations on the remote monitor agent.
pub(crate) trait RemoteActuator: Sync {
    fn start(&self, host: &str, user: &str, anonymized_job_id: &str) -> Result<(), ActuationError>;
    fn stop(&self, host: &str) -> Result<(), ActuationError>;
    /// Pulls the host's artifact into the collection area and returns its local path.
    fn fetch(&self, host: &str, anonymized_job_id: &str) -> Result<PathBuf, ActuationError>;
    /// Command names of `user`'s processes on `host`.
    fn process_names(&self, host: &str, user: &str) -> Result<Vec<String>, ActuationError>;
}

/// Actuates agents over `ssh`, `scp` and `rsync`.
#[derive(Debug, Clone)]
pub(crate) struct SshActuator {
    monitor: MonitorConfig,
    collection_dir: PathBuf,
    timeout: Duration,
}

fn shell_quote(raw: &str) -> String {
    format!("'{}'", raw.replace('\'', r"'\''"))
}

/// Extended regex matching `path` literally.
fn regex_literal(path: &str) -> String {
    let mut out = String::with_capacity(path.len() + 8);
    for ch in path.chars() {
        if r"\.^$*+?()[]{}|".contains(ch) {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

/// Shell loop that SIGKILLs every process whose command line mentions
/// `script`, except the shell running the loop.
fn kill_agents(script: &str) -> String {
    format!(
        r#"for pid in $(pgrep -f {}); do [ "$pid" = "$$" ] || kill -9 "$pid" 2>/dev/null; done"#,
        shell_quote(&regex_literal(script))
    )
}

impl SshActuator {
    pub(crate) fn new(monitor: &MonitorConfig, collection: &CollectionConfig, timeout: Duration) -> Self {
        Self {
            monitor: monitor.clone(),
            collection_dir: collection.dir.clone(),
            timeout,
        }
    }

    fn target(&self, host: &str) -> String {
        match &self.monitor.remote_user {
            Some(user) => format!("{user}@{host}"),
            None => host.to_string(),
        }
    }

    fn remote_path(&self, file_name: &str) -> String {
        format!("{}/{}", self.monitor.remote_dir.trim_end_matches('/'), file_name)
    }

    fn remote_script(&self) -> String {
        let name = self
            .monitor
            .agent_script
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "node_monitor".to_string());
        self.remote_path(&name)
    }

    fn ssh(&self, host: &str, remote_command: &str) -> Command {
        let mut cmd = Command::new(&self.monitor.ssh_bin);
        cmd.args(SSH_OPTIONS).arg(self.target(host)).arg(remote_command);
        cmd
    }

    fn staged_script(&self) -> String {
        format!("{}{STAGED_SUFFIX}", self.remote_script())
    }

    /// Copies the agent next to the live script; launch swaps it in.
    fn copy_agent_command(&self, host: &str) -> Command {
        let mut cmd = Command::new(&self.monitor.scp_bin);
        cmd.args(SSH_OPTIONS)
            .arg("-q")
            .arg(&self.monitor.agent_script)
            .arg(format!("{}:{}", self.target(host), self.staged_script()));
        cmd
    }

    /// Replaces any agent already running from the script, so a repeated
    /// start leaves exactly one agent on the host.
    fn launch_remote(&self, user: &str, anonymized_job_id: &str) -> String {
        let raw = self.remote_script();
        let script = shell_quote(&raw);
        format!(
            "{}; mv -f {} {script} && chmod +x {script} && \
             {{ nohup {script} -j {} -i {} -u {} </dev/null >/dev/null 2>&1 & }}",
            kill_agents(&raw),
            shell_quote(&self.staged_script()),
            shell_quote(anonymized_job_id),
            self.monitor.sample_interval_s,
            shell_quote(user),
        )
    }

    fn launch_command(&self, host: &str, user: &str, anonymized_job_id: &str) -> Command {
        self.ssh(host, &self.launch_remote(user, anonymized_job_id))
    }

    fn stop_remote(&self) -> String {
        let raw = self.remote_script();
        format!(
            "{}; rm -f {} {}",
            kill_agents(&raw),
            shell_quote(&raw),
            shell_quote(&self.staged_script())
        )
    }

    fn stop_command(&self, host: &str) -> Command {
        self.ssh(host, &self.stop_remote())
    }

    fn fetch_command(&self, host: &str, file_name: &str) -> Command {
        let mut cmd = Command::new(&self.monitor.rsync_bin);
        cmd.arg("-az")
            .arg("--remove-source-files")
            .arg("-e")
            .arg(format!("{} {}", self.monitor.ssh_bin, SSH_OPTIONS.join(" ")))
            .arg(format!("{}:{}", self.target(host), self.remote_path(file_name)))
            .arg(format!("{}/", self.collection_dir.display()));
        cmd
    }

    fn process_list_command(&self, host: &str, user: &str) -> Command {
        self.ssh(host, &format!("ps -u {} -o comm=", shell_quote(user)))
    }

    /// Runs `cmd`; exit codes in `link_failures` mean the host was never reached.
    fn run(
        &self,
        host: &str,
        mut cmd: Command,
        link_failures: &[i32],
    ) -> Result<CommandOutput, ActuationError> {
        let out = run_with_timeout(&mut cmd, self.timeout)
            .map_err(|err| ActuationError::from_command(host, err))?;
        if out.status.success() {
            return Ok(out);
        }
        let host = host.to_string();
        let status = format_exit_status(&out.status);
        let stderr = out.stderr.trim().to_string();
        if out.status.code().is_some_and(|code| link_failures.contains(&code)) {
            Err(ActuationError::Unreachable { host, status, stderr })
        } else {
            Err(ActuationError::Rejected { host, status, stderr })
        }
    }
}

impl RemoteActuator for SshActuator {
    fn start(&self, host: &str, user: &str, anonymized_job_id: &str) -> Result<(), ActuationError> {
        self.run(host, self.copy_agent_command(host), SSH_LINK_FAILURES)?;
        self.run(
            host,
            self.launch_command(host, user, anonymized_job_id),
            SSH_LINK_FAILURES,
        )?;
        Ok(())
    }

    fn stop(&self, host: &str) -> Result<(), ActuationError> {
        self.run(host, self.stop_command(host), SSH_LINK_FAILURES)
            .map(|_| ())
    }

    fn fetch(&self, host: &str, anonymized_job_id: &str) -> Result<PathBuf, ActuationError> {
        std::fs::create_dir_all(&self.collection_dir).map_err(|e| ActuationError::Spawn {
            host: host.to_string(),
            reason: format!("create {}: {e}", self.collection_dir.display()),
        })?;
        let file_name = artifact_file_name(&self.monitor.artifact_prefix, anonymized_job_id, host);
        self.run(host, self.fetch_command(host, &file_name), RSYNC_LINK_FAILURES)?;
        Ok(self.collection_dir.join(file_name))
    }

    fn process_names(&self, host: &str, user: &str) -> Result<Vec<String>, ActuationError> {
        let out = self.run(host, self.process_list_command(host, user), SSH_LINK_FAILURES)?;
        Ok(parse_process_names(&out.stdout))
    }
}

/// Distinct command names in first-seen order, scheduler plumbing removed.
pub(crate) fn parse_process_names(ps_output: &str) -> Vec<String> {
    let mut names = Vec::<String>::new();
    for line in ps_output.lines() {
        let name = line.trim();
        if name.is_empty() || PLUMBING_PROCESSES.contains(&name) {
            continue;
        }
        if !names.iter().any(|n| n == name) {
            names.push(name.to_string());
        }
    }
    names
}

/// `host:{a,b};`, appended to a job once its monitor has started.
pub(crate) fn process_names_fragment(host: &str, names: &[String]) -> String {
    format!("{host}:{{{}}};", names.join(","))
}

/// Runs `op` for every host, at most `fanout` at a time, and returns results in
/// host order.
pub(crate) fn for_each_host<T, F>(
    hosts: &[String],
    fanout: usize,
    op: F,
) -> Vec<(String, Result<T, ActuationError>)>
where
    T: Send,
    F: Fn(&str) -> Result<T, ActuationError> + Sync,
{
    let op = &op;
    let mut results = Vec::with_capacity(hosts.len());
    for chunk in hosts.chunks(fanout.max(1)) {
        if chunk.len() == 1 {
            results.push((chunk[0].clone(), op(&chunk[0])));
            continue;
        }
        std::thread::scope(|scope| {
            let handles = chunk
                .iter()
                .map(|host| (host, scope.spawn(move || op(host))))
                .collect::<Vec<_>>();
            for (host, handle) in handles {
                let result = handle.join().unwrap_or_else(|_| {
                    Err(ActuationError::Spawn {
                        host: host.clone(),
                        reason: "actuation thread panicked".to_string(),
                    })
                });
                results.push((host.clone(), result));
            }
        });
    }
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn actuator(remote_user: Option<&str>) -> SshActuator {
        let monitor = MonitorConfig {
            agent_script: PathBuf::from("/opt/nw/node_monitor.py"),
            remote_user: remote_user.map(str::to_string),
            ..MonitorConfig::default()
        };
        let collection = CollectionConfig {
            dir: PathBuf::from("/scratch/logs"),
        };
        SshActuator::new(&monitor, &collection, Duration::from_secs(5))
    }

    fn args_for(cmd: &Command) -> Vec<String> {
        cmd.get_args()
            .map(|arg| arg.to_string_lossy().to_string())
            .collect::<Vec<_>>()
    }

    #[cfg(unix)]
    fn temp_dir(test_name: &str) -> PathBuf {
        let nonce = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let dir = std::env::temp_dir().join(format!(
            "nw_runner_{test_name}_{}_{nonce}",
            std::process::id()
        ));
        std::fs::create_dir_all(&dir).expect("create temp dir");
        dir
    }

    #[cfg(unix)]
    fn write_script(path: &std::path::Path, body: &str) {
        use std::os::unix::fs::PermissionsExt;
        std::fs::write(path, body).expect("write script");
        let mut perms = std::fs::metadata(path).expect("meta").permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(path, perms).expect("chmod");
    }

    const KILL_LOOP: &str = r#"for pid in $(pgrep -f '/tmp/node_monitor\.py'); do [ "$pid" = "$$" ] || kill -9 "$pid" 2>/dev/null; done"#;

    #[test]
    fn agent_is_staged_next_to_the_live_script() {
        let args = args_for(&actuator(Some("root")).copy_agent_command("nid00010"));
        assert_eq!(args[args.len() - 2], "/opt/nw/node_monitor.py");
        assert_eq!(
            args[args.len() - 1],
            "root@nid00010:/tmp/node_monitor.py.new"
        );
    }

    #[test]
    fn launch_passes_anonymized_id_interval_and_user() {
        let cmd = actuator(None).launch_command("nid00010", "alice", "ab12cd34");
        assert_eq!(cmd.get_program(), "ssh");
        let args = args_for(&cmd);
        assert_eq!(args[args.len() - 2], "nid00010");
        let remote = &args[args.len() - 1];
        assert!(remote.contains("-j 'ab12cd34' -i 120 -u 'alice'"), "{remote}");
        assert!(remote.ends_with("2>&1 & }"), "{remote}");
    }

    #[test]
    fn launch_replaces_a_running_agent_before_starting_one() {
        let remote = actuator(None).launch_remote("alice", "ab12cd34");
        let rest = remote
            .strip_prefix(&format!("{KILL_LOOP}; "))
            .expect("kill loop runs first");
        assert!(
            rest.starts_with(
                "mv -f '/tmp/node_monitor.py.new' '/tmp/node_monitor.py' && \
                 chmod +x '/tmp/node_monitor.py' && { nohup '/tmp/node_monitor.py'"
            ),
            "{rest}"
        );
        assert_eq!(remote.matches("nohup").count(), 1);
    }

    #[test]
    fn stop_kills_agents_and_removes_both_copies() {
        let args = args_for(&actuator(None).stop_command("nid00011"));
        assert_eq!(
            args.last().cloned(),
            Some(format!(
                "{KILL_LOOP}; rm -f '/tmp/node_monitor.py' '/tmp/node_monitor.py.new'"
            ))
        );
    }

    #[test]
    fn kill_pattern_escapes_regex_metacharacters() {
        assert_eq!(regex_literal("/opt/a+b/mon[1].py"), r"/opt/a\+b/mon\[1\]\.py");
    }

    #[cfg(unix)]
    #[test]
    fn stop_kills_a_live_agent_without_killing_its_own_shell() {
        use std::os::unix::process::ExitStatusExt;

        if !crate::bin_detect::missing_commands(&["pgrep"]).is_empty() {
            return;
        }
        let dir = temp_dir("stop_live_agent");
        let script = dir.join("node_monitor.sh");
        write_script(&script, "#!/bin/sh\nwhile :; do sleep 1; done\n");
        let mut agent = Command::new(&script).spawn().expect("spawn agent");

        let monitor = MonitorConfig {
            agent_script: script.clone(),
            remote_dir: dir.to_string_lossy().into_owned(),
            ..MonitorConfig::default()
        };
        let collection = CollectionConfig { dir: dir.join("logs") };
        let remote = SshActuator::new(&monitor, &collection, Duration::from_secs(5)).stop_remote();

        let mut shell = Command::new("/bin/sh");
        shell.arg("-c").arg(&remote);
        let out = run_with_timeout(&mut shell, Duration::from_secs(10)).expect("run stop");
        let agent_status = agent.wait().expect("reap agent");

        assert!(out.status.success(), "{remote}: {:?} {}", out.status, out.stderr);
        assert_eq!(agent_status.signal(), Some(9));
        assert!(!script.exists(), "agent script left behind");

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[cfg(unix)]
    #[test]
    fn ssh_connection_failure_is_unreachable_not_rejected() {
        let dir = temp_dir("ssh_link_failure");
        let down = dir.join("ssh-down");
        write_script(
            &down,
            "#!/bin/sh\necho 'ssh: connect to host nid00010 port 22: No route to host' >&2\nexit 255\n",
        );
        let refusing = dir.join("ssh-refusing");
        write_script(&refusing, "#!/bin/sh\necho 'rm: Permission denied' >&2\nexit 1\n");

        let collection = CollectionConfig { dir: dir.join("logs") };
        let with_ssh = |ssh: &std::path::Path| {
            let monitor = MonitorConfig {
                ssh_bin: ssh.to_string_lossy().into_owned(),
                ..MonitorConfig::default()
            };
            SshActuator::new(&monitor, &collection, Duration::from_secs(5))
        };

        let err = with_ssh(down.as_path()).stop("nid00010").expect_err("host is down");
        assert!(matches!(err, ActuationError::Unreachable { .. }), "{err}");
        assert!(err.is_unissued());
        assert!(err.to_string().contains("No route to host"), "{err}");

        let err = with_ssh(refusing.as_path()).stop("nid00010").expect_err("remote refused");
        assert!(matches!(err, ActuationError::Rejected { .. }), "{err}");
        assert!(!err.is_unissued());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn fetch_moves_artifact_into_collection_dir() {
        let args = args_for(&actuator(Some("root")).fetch_command("nid00011", "pfmon-ab12-nid00011.dat"));
        assert!(args.iter().any(|a| a == "--remove-source-files"), "{args:?}");
        assert_eq!(
            args[args.len() - 2],
            "root@nid00011:/tmp/pfmon-ab12-nid00011.dat"
        );
        assert_eq!(args[args.len() - 1], "/scratch/logs/");
    }

    #[test]
    fn user_names_are_quoted_for_the_remote_shell() {
        let cmd = actuator(None).process_list_command("nid00010", "o'neil");
        let args = args_for(&cmd);
        assert_eq!(args.last().map(String::as_str), Some(r"ps -u 'o'\''neil' -o comm="));
    }

    #[test]
    fn process_names_drop_plumbing_and_duplicates() {
        let names = parse_process_names("CMD\nslurm_script\nsrun\na.out\npython\na.out\n\n");
        assert_eq!(names, vec!["a.out", "python"]);
        assert_eq!(
            process_names_fragment("nid00010", &names),
            "nid00010:{a.out,python};"
        );
        assert_eq!(process_names_fragment("nid00011", &[]), "nid00011:{};");
    }

    #[test]
    fn fan_out_keeps_host_order_and_runs_every_host() {
        let hosts = (1..=5).map(|i| format!("n{i}")).collect::<Vec<_>>();
        let calls = AtomicUsize::new(0);
        let results = for_each_host(&hosts, 2, |host| {
            calls.fetch_add(1, Ordering::SeqCst);
            if host == "n3" {
                Err(ActuationError::Rejected {
                    host: host.to_string(),
                    status: "exit=1".to_string(),
                    stderr: String::new(),
                })
            } else {
                Ok(host.len())
            }
        });
        assert_eq!(calls.load(Ordering::SeqCst), 5);
        assert_eq!(
            results.iter().map(|(h, _)| h.as_str()).collect::<Vec<_>>(),
            vec!["n1", "n2", "n3", "n4", "n5"]
        );
        assert!(results[2].1.is_err());
        assert!(results.iter().filter(|(_, r)| r.is_ok()).count() == 4);
    }

    #[test]
    fn timeouts_and_link_failures_count_as_unissued() {
        let timeout = ActuationError::Timeout {
            host: "n1".to_string(),
            secs: 1,
        };
        let unreachable = ActuationError::Unreachable {
            host: "n1".to_string(),
            status: "exit=255".to_string(),
            stderr: String::new(),
        };
        let rejected = ActuationError::Rejected {
            host: "n1".to_string(),
            status: "exit=1".to_string(),
            stderr: String::new(),
        };
        assert!(timeout.is_unissued());
        assert!(unreachable.is_unissued());
        assert!(!rejected.is_unissued());
    }
}
