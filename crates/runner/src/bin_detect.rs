#![forbid(unsafe_code)]

use crate::config::Config;
use std::path::{Path, PathBuf};

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && (m.permissions().mode() & 0o111 != 0))
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|m| m.is_file())
        .unwrap_or(false)
}

fn find_executable_in_dirs(name: &str, dirs: &[PathBuf]) -> Option<PathBuf> {
    dirs.iter()
        .filter(|dir| !dir.as_os_str().is_empty())
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
}

fn resolves_in(cmd: &str, dirs: &[PathBuf]) -> bool {
    let trimmed = cmd.trim();
    if trimmed.is_empty() {
        return false;
    }
    if trimmed.contains(std::path::MAIN_SEPARATOR) || trimmed.contains('/') {
        return is_executable(Path::new(trimmed));
    }
    find_executable_in_dirs(trimmed, dirs).is_some()
}

fn path_dirs() -> Vec<PathBuf> {
    std::env::var_os("PATH")
        .map(|p| std::env::split_paths(&p).collect())
        .unwrap_or_default()
}

/// External programs a reconcile cycle shells out to.
pub(crate) fn required_commands(cfg: &Config) -> Vec<&str> {
    let mut cmds = Vec::new();
    if cfg.scheduler.sudo {
        cmds.push("sudo");
    }
    cmds.push(cfg.scheduler.squeue_bin.as_str());
    cmds.push(cfg.monitor.ssh_bin.as_str());
    cmds.push(cfg.monitor.scp_bin.as_str());
    cmds.push(cfg.monitor.rsync_bin.as_str());
    cmds
}

/// Entries of `cmds` that are neither an executable path nor found on `PATH`.
pub(crate) fn missing_commands<'a>(cmds: &[&'a str]) -> Vec<&'a str> {
    let dirs = path_dirs();
    cmds.iter()
        .copied()
        .filter(|cmd| !resolves_in(cmd, &dirs))
        .collect()
}
