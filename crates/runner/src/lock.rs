#![forbid(unsafe_code)]

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

pub(crate) const LOCK_FILE_NAME: &str = "nodewatch.lock";

#[derive(Debug, thiserror::Error)]
pub(crate) enum LockError {
    #[error("another run holds {} (age {age_s}s)", path.display())]
    Held { path: PathBuf, age_s: u64 },
    #[error("lock {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Exclusive run-lock file; released on drop.
#[derive(Debug)]
pub(crate) struct RunLock {
    path: PathBuf,
}

fn lock_age(path: &Path) -> std::io::Result<Duration> {
    let modified = std::fs::metadata(path)?.modified()?;
    Ok(SystemTime::now()
        .duration_since(modified)
        .unwrap_or(Duration::ZERO))
}

fn lock_body() -> String {
    format!("pid={} touched_ms={}\n", std::process::id(), crate::now_ms())
}

impl RunLock {
    pub(crate) fn acquire(dir: &Path, stale_after: Duration) -> Result<Self, LockError> {
        let path = dir.join(LOCK_FILE_NAME);
        let io = |source| LockError::Io {
            path: path.clone(),
            source,
        };
        std::fs::create_dir_all(dir).map_err(io)?;

        let mut replaced_stale = false;
        loop {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    let _ = file.write_all(lock_body().as_bytes());
                    return Ok(Self { path: path.clone() });
                }
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                    let age = match lock_age(&path) {
                        Ok(age) => age,
                        // Released between our open and stat.
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                        Err(e) => return Err(io(e)),
                    };
                    if replaced_stale || age < stale_after {
                        return Err(LockError::Held {
                            path: path.clone(),
                            age_s: age.as_secs(),
                        });
                    }
                    tracing::warn!(path = %path.display(), age_s = age.as_secs(), "replacing stale run-lock");
                    match std::fs::remove_file(&path) {
                        Ok(()) => {}
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                        Err(e) => return Err(io(e)),
                    }
                    replaced_stale = true;
                }
                Err(err) => return Err(io(err)),
            }
        }
    }

    /// Bumps the lock's mtime so a long-lived holder is never taken for stale.
    pub(crate) fn refresh(&self) -> std::io::Result<()> {
        std::fs::write(&self.path, lock_body())
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}
