#![forbid(unsafe_code)]

use std::io::Read;
use std::process::{Command, ExitStatus, Stdio};
use std::thread::{JoinHandle, sleep};
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(25);
const MAX_CAPTURE_BYTES: usize = 256 * 1024;

#[derive(Debug)]
pub(crate) struct CommandOutput {
    pub(crate) status: ExitStatus,
    pub(crate) stdout: String,
    pub(crate) stderr: String,
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum CommandError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },
    #[error("{program} timed out after {}s", timeout.as_secs())]
    Timeout { program: String, timeout: Duration },
    #[error("wait for {program} failed: {source}")]
    Wait {
        program: String,
        source: std::io::Error,
    },
}

fn capture<R: Read + Send + 'static>(stream: Option<R>) -> Option<JoinHandle<String>> {
    let stream = stream?;
    Some(std::thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = stream.take(MAX_CAPTURE_BYTES as u64).read_to_end(&mut buf);
        String::from_utf8_lossy(&buf).into_owned()
    }))
}

fn collect(handle: Option<JoinHandle<String>>) -> String {
    handle.and_then(|h| h.join().ok()).unwrap_or_default()
}

pub(crate) fn program_name(cmd: &Command) -> String {
    cmd.get_program().to_string_lossy().into_owned()
}

pub(crate) fn render(cmd: &Command) -> String {
    let mut out = program_name(cmd);
    for arg in cmd.get_args() {
        out.push(' ');
        out.push_str(&arg.to_string_lossy());
    }
    out
}

/// Runs `cmd` to completion, killing it once `timeout` elapses.
///
/// stdin is closed; stdout and stderr are captured (bounded). A non-zero
/// exit is not an error here, callers inspect `status`.
pub(crate) fn run_with_timeout(
    cmd: &mut Command,
    timeout: Duration,
) -> Result<CommandOutput, CommandError> {
    let program = program_name(cmd);
    tracing::debug!(command = %render(cmd), "exec");

    let mut child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|source| CommandError::Spawn {
            program: program.clone(),
            source,
        })?;
    let stdout = capture(child.stdout.take());
    let stderr = capture(child.stderr.take());

    let started = Instant::now();
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) => {}
            Err(source) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(CommandError::Wait { program, source });
            }
        }
        if started.elapsed() >= timeout {
            let _ = child.kill();
            let _ = child.wait();
            // Reader threads are left to finish on their own: a grandchild may
            // still hold the pipes open.
            return Err(CommandError::Timeout { program, timeout });
        }
        sleep(POLL_INTERVAL);
    };

    Ok(CommandOutput {
        status,
        stdout: collect(stdout),
        stderr: collect(stderr),
    })
}

pub(crate) fn format_exit_status(status: &ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("exit={code}"),
        None => "exit=signal".to_string(),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[test]
    fn captures_output_and_status() {
        let out = run_with_timeout(&mut sh("echo hello; echo oops >&2; exit 3"), Duration::from_secs(10))
            .expect("run");
        assert_eq!(out.status.code(), Some(3));
        assert_eq!(out.stdout.trim(), "hello");
        assert_eq!(out.stderr.trim(), "oops");
        assert_eq!(format_exit_status(&out.status), "exit=3");
    }

    #[test]
    fn slow_command_is_killed() {
        let started = Instant::now();
        let err = run_with_timeout(&mut sh("exec sleep 30"), Duration::from_millis(200))
            .expect_err("must time out");
        assert!(matches!(err, CommandError::Timeout { .. }), "{err}");
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn missing_program_is_a_spawn_error() {
        let mut cmd = Command::new("/nonexistent/nw_runner_no_such_binary");
        let err = run_with_timeout(&mut cmd, Duration::from_secs(1)).expect_err("spawn fails");
        assert!(matches!(err, CommandError::Spawn { .. }));
    }

    #[test]
    fn render_joins_program_and_args() {
        let cmd = sh("true");
        assert_eq!(render(&cmd), "/bin/sh -c true");
    }
}
