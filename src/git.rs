use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::cache::TtlCache;
use crate::error::{Result, StatuslineError};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Current-branch lookup memoized per working directory.
pub struct GitBranchCache {
    cache: TtlCache<PathBuf, String>,
    timeout: Duration,
}

impl GitBranchCache {
    pub fn new(ttl: Duration, timeout: Duration) -> Self {
        Self {
            cache: TtlCache::new(ttl),
            timeout,
        }
    }

    /// Branch checked out in `project_path`, or `None` outside a repository,
    /// on a detached HEAD, or when git is slow or missing. `None` is not
    /// cached.
    pub fn branch(&self, project_path: &Path) -> Option<String> {
        if project_path.as_os_str().is_empty() || !project_path.is_dir() {
            return None;
        }
        let key = project_path.to_path_buf();
        self.cache.get_or_load(&key, || {
            match fetch_git_branch(project_path, self.timeout) {
                Ok(branch) => branch,
                Err(err) => {
                    debug!(error = %err, path = %project_path.display(), "git branch lookup failed");
                    None
                }
            }
        })
    }
}

pub fn fetch_git_branch(project_path: &Path, timeout: Duration) -> Result<Option<String>> {
    let mut command = Command::new("git");
    command
        .arg("-C")
        .arg(project_path)
        .arg("branch")
        .arg("--show-current");
    let stdout = run_with_timeout(command, timeout)?;
    let branch = stdout.trim();
    Ok((!branch.is_empty()).then(|| branch.to_string()))
}

/// Runs `command` to completion and returns its stdout, killing it once
/// `timeout` passes.
fn run_with_timeout(mut command: Command, timeout: Duration) -> Result<String> {
    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|err| StatuslineError::GitFailed(err.to_string()))?;

    let deadline = Instant::now() + timeout;
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) => {
                if Instant::now() >= deadline {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(StatuslineError::GitTimeout(timeout));
                }
                thread::sleep(POLL_INTERVAL);
            }
            Err(err) => {
                let _ = child.kill();
                return Err(StatuslineError::GitFailed(err.to_string()));
            }
        }
    };

    if !status.success() {
        return Err(StatuslineError::GitFailed(format!("exited with {status}")));
    }

    let mut stdout = String::new();
    if let Some(mut pipe) = child.stdout.take() {
        pipe.read_to_string(&mut stdout)
            .map_err(|err| StatuslineError::GitFailed(err.to_string()))?;
    }
    Ok(stdout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn git_available() -> bool {
        Command::new("git")
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    fn git(dir: &Path, args: &[&str]) {
        let status = Command::new("git")
            .arg("-C")
            .arg(dir)
            .args(args)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .expect("run git");
        assert!(status.success(), "git {args:?} failed");
    }

    #[test]
    fn missing_directory_yields_no_branch() {
        let cache = GitBranchCache::new(Duration::from_secs(5), Duration::from_secs(1));
        assert_eq!(cache.branch(Path::new("/definitely/not/here")), None);
        assert_eq!(cache.branch(Path::new("")), None);
    }

    #[test]
    fn plain_directory_yields_no_branch() {
        let tmp = TempDir::new().expect("temp dir");
        let cache = GitBranchCache::new(Duration::from_secs(5), Duration::from_secs(5));
        assert_eq!(cache.branch(tmp.path()), None);
    }

    #[test]
    fn reads_branch_of_fresh_repository() {
        if !git_available() {
            return;
        }
        let tmp = TempDir::new().expect("temp dir");
        git(tmp.path(), &["init", "-q"]);
        git(tmp.path(), &["symbolic-ref", "HEAD", "refs/heads/feature/status"]);

        let cache = GitBranchCache::new(Duration::from_secs(5), Duration::from_secs(5));
        assert_eq!(cache.branch(tmp.path()).as_deref(), Some("feature/status"));
    }

    #[cfg(unix)]
    #[test]
    fn slow_command_is_killed_after_timeout() {
        let mut command = Command::new("sleep");
        command.arg("5");
        let started = Instant::now();
        let result = run_with_timeout(command, Duration::from_millis(50));
        assert!(matches!(result, Err(StatuslineError::GitTimeout(_))));
        assert!(started.elapsed() < Duration::from_secs(4));
    }
}
