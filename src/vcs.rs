//! Git working tree operations used by the installer and the update path.

use crate::exec::{CommandOutput, CommandRunner, CommandSpec, ExecError};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum VcsError {
    #[error("git {action} failed: {reason}")]
    Command { action: &'static str, reason: String },

    #[error("git fetch of '{branch}' failed: {reason}")]
    Fetch { branch: String, reason: String },

    #[error("Not a git checkout: {0}")]
    NotARepository(PathBuf),

    #[error("Invalid branch name '{0}'")]
    InvalidBranch(String),

    #[error(transparent)]
    Exec(#[from] ExecError),
}

/// A git checkout driven through the `git` binary.
#[derive(Clone)]
pub struct Repository {
    runner: Arc<dyn CommandRunner>,
    dir: PathBuf,
    remote: String,
    fetch_depth: u32,
    fetch_timeout: Duration,
}

impl Repository {
    pub fn new(runner: Arc<dyn CommandRunner>, dir: impl Into<PathBuf>, remote: &str) -> Self {
        Self {
            runner,
            dir: dir.into(),
            remote: remote.to_string(),
            fetch_depth: 0,
            fetch_timeout: Duration::ZERO,
        }
    }

    pub fn with_fetch_depth(mut self, depth: u32) -> Self {
        self.fetch_depth = depth;
        self
    }

    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// True if the directory holds a checkout (`.git` dir or file).
    pub fn exists(&self) -> bool {
        self.dir.join(".git").exists()
    }

    /// Remote-tracking ref for a branch, e.g. `refs/remotes/origin/main`.
    pub fn remote_ref(&self, branch: &str) -> String {
        format!("refs/remotes/{}/{}", self.remote, branch)
    }

    fn git<I, S>(&self, args: I) -> CommandSpec
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        CommandSpec::new("git").current_dir(&self.dir).args(args)
    }

    async fn run_ok(&self, action: &'static str, spec: CommandSpec) -> Result<CommandOutput, VcsError> {
        let output = self.runner.run(&spec).await?;
        if output.success() {
            Ok(output)
        } else {
            Err(VcsError::Command {
                action,
                reason: output.failure_reason(),
            })
        }
    }

    /// Shallow clone of a single branch.
    pub async fn clone_from(&self, url: &str, branch: &str) -> Result<(), VcsError> {
        validate_branch(branch)?;
        let mut spec = CommandSpec::new("git").arg("clone");
        if self.fetch_depth > 0 {
            spec = spec.args(["--depth".to_string(), self.fetch_depth.to_string()]);
        }
        spec = spec
            .args(["--branch", branch, "--origin", self.remote.as_str(), url])
            .arg(self.dir.to_string_lossy().into_owned())
            .timeout(self.fetch_timeout);
        let output = self.runner.run(&spec).await?;
        if !output.success() {
            return Err(VcsError::Fetch {
                branch: branch.to_string(),
                reason: output.failure_reason(),
            });
        }
        Ok(())
    }

    /// Name of the checked-out branch.
    pub async fn current_branch(&self) -> Result<String, VcsError> {
        let out = self
            .run_ok("rev-parse", self.git(["rev-parse", "--abbrev-ref", "HEAD"]))
            .await?;
        Ok(out.stdout_trimmed().to_string())
    }

    /// Commit hash of `HEAD`.
    pub async fn head(&self) -> Result<String, VcsError> {
        self.rev_parse("HEAD").await
    }

    pub async fn rev_parse(&self, rev: &str) -> Result<String, VcsError> {
        let out = self
            .run_ok("rev-parse", self.git(["rev-parse", "--verify", rev]))
            .await?;
        Ok(out.stdout_trimmed().to_string())
    }

    /// Fetch exactly one branch by ref into its remote-tracking ref.
    ///
    /// Works against shallow single-branch clones, where a plain `pull`
    /// would only ever see the branch the clone was made from.
    pub async fn fetch_branch(&self, branch: &str) -> Result<String, VcsError> {
        validate_branch(branch)?;
        let refspec = format!("+refs/heads/{}:{}", branch, self.remote_ref(branch));
        let mut spec = self.git(["fetch", "--prune"]);
        if self.fetch_depth > 0 {
            spec = spec.args(["--depth".to_string(), self.fetch_depth.to_string()]);
        }
        spec = spec
            .args([self.remote.as_str(), refspec.as_str()])
            .timeout(self.fetch_timeout);

        let output = match self.runner.run(&spec).await {
            Ok(output) => output,
            Err(ExecError::TimedOut { timeout, .. }) => {
                return Err(VcsError::Fetch {
                    branch: branch.to_string(),
                    reason: format!("timed out after {:?}", timeout),
                })
            }
            Err(e) => return Err(e.into()),
        };
        if !output.success() {
            return Err(VcsError::Fetch {
                branch: branch.to_string(),
                reason: output.failure_reason(),
            });
        }
        self.rev_parse(&self.remote_ref(branch)).await
    }

    /// Number of commits `HEAD` is behind the fetched branch.
    ///
    /// `None` when history is too shallow to tell; the count is informational only.
    pub async fn commits_behind(&self, branch: &str) -> Option<u64> {
        let range = format!("HEAD..{}", self.remote_ref(branch));
        let out = self
            .runner
            .run(&self.git(["rev-list", "--count", range.as_str()]))
            .await
            .ok()?;
        if !out.success() {
            debug!("rev-list failed: {}", out.failure_reason());
            return None;
        }
        out.stdout_trimmed().parse().ok()
    }

    /// Tracked files with local modifications.
    pub async fn local_changes(&self) -> Result<Vec<String>, VcsError> {
        let out = self
            .run_ok("status", self.git(["status", "--porcelain", "--untracked-files=no"]))
            .await?;
        Ok(out
            .stdout
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| l.get(3..).unwrap_or(l).trim().to_string())
            .collect())
    }

    pub async fn has_local_branch(&self, branch: &str) -> Result<bool, VcsError> {
        let name = format!("refs/heads/{}", branch);
        let out = self
            .runner
            .run(&self.git(["show-ref", "--verify", "--quiet", name.as_str()]))
            .await?;
        Ok(out.success())
    }

    /// Check out `branch`, creating a tracking branch when it does not exist locally.
    pub async fn checkout(&self, branch: &str) -> Result<(), VcsError> {
        validate_branch(branch)?;
        let upstream = format!("{}/{}", self.remote, branch);
        let spec = if self.has_local_branch(branch).await? {
            self.git(["checkout", "--force", branch])
        } else {
            self.git(["checkout", "--force", "-b", branch, "--track", upstream.as_str()])
        };
        self.run_ok("checkout", spec).await?;
        Ok(())
    }

    /// Discard local state and move the branch to the fetched remote ref.
    pub async fn reset_hard(&self, branch: &str) -> Result<(), VcsError> {
        let target = self.remote_ref(branch);
        self.run_ok("reset", self.git(["reset", "--hard", target.as_str()]))
            .await?;
        Ok(())
    }

    /// Files changed between two commits, limited to `paths` when given.
    pub async fn changed_paths(
        &self,
        from: &str,
        to: &str,
        paths: &[String],
    ) -> Result<Vec<String>, VcsError> {
        let mut spec = self.git(["diff", "--name-only", from, to]);
        if !paths.is_empty() {
            spec = spec.arg("--").args(paths.iter().cloned());
        }
        let out = self.run_ok("diff", spec).await?;
        Ok(out
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect())
    }
}

/// Reject names git would read as options or that cannot be refs.
pub fn validate_branch(branch: &str) -> Result<(), VcsError> {
    let invalid = branch.is_empty()
        || branch.starts_with('-')
        || branch.contains("..")
        || branch.ends_with('/')
        || branch.ends_with(".lock")
        || branch
            .chars()
            .any(|c| c.is_whitespace() || c.is_control() || "~^:?*[\\".contains(c));
    if invalid {
        Err(VcsError::InvalidBranch(branch.to_string()))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::fake::FakeRunner;

    fn repo(runner: &Arc<FakeRunner>) -> Repository {
        Repository::new(runner.clone(), "/srv/birdnet", "origin").with_fetch_depth(1)
    }

    #[test]
    fn test_validate_branch() {
        assert!(validate_branch("main").is_ok());
        assert!(validate_branch("feature/audio-fix").is_ok());
        assert!(validate_branch("").is_err());
        assert!(validate_branch("--upload-pack=x").is_err());
        assert!(validate_branch("a..b").is_err());
        assert!(validate_branch("has space").is_err());
        assert!(validate_branch("topic.lock").is_err());
    }

    #[tokio::test]
    async fn test_fetch_uses_explicit_refspec() {
        let runner = Arc::new(FakeRunner::new());
        runner.on("rev-parse --verify refs/remotes/origin/main", CommandOutput::ok("def456\n"));
        let sha = repo(&runner).fetch_branch("main").await.unwrap();
        assert_eq!(sha, "def456");
        assert!(runner.called(
            "git fetch --prune --depth 1 origin +refs/heads/main:refs/remotes/origin/main"
        ));
    }

    #[tokio::test]
    async fn test_fetch_failure_is_fetch_error() {
        let runner = Arc::new(FakeRunner::new());
        runner.on(
            "git fetch",
            CommandOutput::failed(128, "fatal: unable to access 'https://...': Could not resolve host"),
        );
        let err = repo(&runner).fetch_branch("main").await.unwrap_err();
        assert!(matches!(err, VcsError::Fetch { .. }));
        assert!(err.to_string().contains("Could not resolve host"));
    }

    #[tokio::test]
    async fn test_fetch_timeout_is_fetch_error() {
        let runner = Arc::new(FakeRunner::new());
        runner.time_out("git fetch");
        let err = repo(&runner).fetch_branch("main").await.unwrap_err();
        assert!(matches!(err, VcsError::Fetch { .. }));
    }

    #[tokio::test]
    async fn test_commits_behind_counts() {
        let runner = Arc::new(FakeRunner::new());
        runner.on("rev-list --count", CommandOutput::ok("5\n"));
        assert_eq!(repo(&runner).commits_behind("main").await, Some(5));
    }

    #[tokio::test]
    async fn test_commits_behind_unknown_on_shallow_history() {
        let runner = Arc::new(FakeRunner::new());
        runner.on("rev-list --count", CommandOutput::failed(128, "fatal: bad revision"));
        assert_eq!(repo(&runner).commits_behind("main").await, None);
    }

    #[tokio::test]
    async fn test_checkout_creates_tracking_branch() {
        let runner = Arc::new(FakeRunner::new());
        runner.on("show-ref", CommandOutput::failed(1, ""));
        repo(&runner).checkout("develop").await.unwrap();
        assert!(runner.called("git checkout --force -b develop --track origin/develop"));
    }

    #[tokio::test]
    async fn test_checkout_existing_branch() {
        let runner = Arc::new(FakeRunner::new());
        repo(&runner).checkout("main").await.unwrap();
        assert!(runner.called("git checkout --force main"));
        assert!(!runner.called("--track"));
    }

    #[tokio::test]
    async fn test_local_changes_parses_porcelain() {
        let runner = Arc::new(FakeRunner::new());
        runner.on("status --porcelain", CommandOutput::ok(" M docker-compose.yml\nM  api/app.py\n"));
        let changes = repo(&runner).local_changes().await.unwrap();
        assert_eq!(changes, vec!["docker-compose.yml", "api/app.py"]);
    }

    #[tokio::test]
    async fn test_changed_paths_limits_to_paths() {
        let runner = Arc::new(FakeRunner::new());
        runner.on("git diff --name-only", CommandOutput::ok("supervisor/main.rs\n"));
        let changed = repo(&runner)
            .changed_paths("abc", "def", &["supervisor/".to_string()])
            .await
            .unwrap();
        assert_eq!(changed, vec!["supervisor/main.rs"]);
        assert!(runner.called("git diff --name-only abc def -- supervisor/"));
    }
}
