//! Container group lifecycle through `docker compose`.
//!
//! All operations are idempotent: starting a running group, stopping a
//! stopped one or recreating an already fresh one leaves the host as it was.

use crate::config::Config;
use crate::exec::{CommandOutput, CommandRunner, CommandSpec, ExecError};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

/// Extra time granted to `compose stop` on top of its own timeout.
const STOP_GRACE: Duration = Duration::from_secs(15);

/// Limit for kill/remove escalation steps.
const KILL_LIMIT: Duration = Duration::from_secs(60);

#[derive(Error, Debug)]
pub enum ContainerError {
    #[error("docker compose {action} failed: {reason}")]
    Command { action: &'static str, reason: String },

    #[error("Image build failed: {0}")]
    Build(String),

    #[error(transparent)]
    Exec(#[from] ExecError),
}

/// Manages the application's compose project.
#[derive(Clone)]
pub struct ContainerManager {
    runner: Arc<dyn CommandRunner>,
    project: String,
    compose_file: PathBuf,
    workdir: PathBuf,
    build_timeout: Duration,
}

impl ContainerManager {
    pub fn new(runner: Arc<dyn CommandRunner>, config: &Config) -> Self {
        Self {
            runner,
            project: config.containers.project.clone(),
            compose_file: config.compose_path(),
            workdir: config.repo.dir.clone(),
            build_timeout: config.containers.build_timeout(),
        }
    }

    fn compose<I, S>(&self, args: I) -> CommandSpec
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        CommandSpec::new("docker")
            .current_dir(&self.workdir)
            .args(["compose", "-p", self.project.as_str(), "-f"])
            .arg(self.compose_file.to_string_lossy().into_owned())
            .args(args)
    }

    async fn run_ok(&self, action: &'static str, spec: CommandSpec) -> Result<CommandOutput, ContainerError> {
        let output = self.runner.run(&spec).await?;
        if output.success() {
            Ok(output)
        } else {
            Err(ContainerError::Command {
                action,
                reason: output.failure_reason(),
            })
        }
    }

    /// Clear leftovers of an unclean shutdown, then bring the group up.
    pub async fn start(&self) -> Result<(), ContainerError> {
        self.remove_stopped().await;
        self.run_ok("up", self.compose(["up", "-d", "--remove-orphans"]))
            .await?;
        info!("Containers started ({})", self.project);
        Ok(())
    }

    /// Bring the group up with whatever images exist, never building.
    pub async fn start_without_build(&self) -> Result<(), ContainerError> {
        self.remove_stopped().await;
        self.run_ok(
            "up",
            self.compose(["up", "-d", "--no-build", "--remove-orphans"]),
        )
        .await?;
        info!("Containers started with existing images ({})", self.project);
        Ok(())
    }

    async fn remove_stopped(&self) {
        // Only stopped containers are removed; running ones are untouched.
        match self.runner.run(&self.compose(["rm", "--force"])).await {
            Ok(out) if !out.success() => warn!("compose rm failed: {}", out.failure_reason()),
            Err(e) => warn!("compose rm failed: {}", e),
            _ => {}
        }
    }

    /// Stop the group, escalating to kill + remove if the graceful stop
    /// fails or overruns. Never blocks longer than the bounded limits.
    pub async fn stop(&self, timeout: Duration) -> Result<(), ContainerError> {
        let graceful = self
            .compose([
                "stop".to_string(),
                "--timeout".to_string(),
                timeout.as_secs().to_string(),
            ])
            .timeout(timeout + STOP_GRACE);

        match self.runner.run(&graceful).await {
            Ok(out) if out.success() => {
                info!("Containers stopped ({})", self.project);
                return Ok(());
            }
            Ok(out) => warn!("Graceful stop failed: {}", out.failure_reason()),
            Err(e) => warn!("Graceful stop failed: {}", e),
        }

        warn!("Escalating to kill for project {}", self.project);
        let kill = self.compose(["kill"]).timeout(KILL_LIMIT);
        if let Err(e) = self.runner.run(&kill).await {
            warn!("compose kill failed: {}", e);
        }
        let down = self
            .compose(["down", "--remove-orphans", "--timeout", "0"])
            .timeout(KILL_LIMIT);
        let out = self.runner.run(&down).await?;
        if !out.success() {
            return Err(ContainerError::Command {
                action: "down",
                reason: out.failure_reason(),
            });
        }
        info!("Containers force-stopped ({})", self.project);
        Ok(())
    }

    /// Recreate every container so network identities are not reused.
    pub async fn restart_force_recreate(&self) -> Result<(), ContainerError> {
        self.run_ok(
            "up",
            self.compose(["up", "-d", "--force-recreate", "--remove-orphans"]),
        )
        .await?;
        info!("Containers recreated ({})", self.project);
        Ok(())
    }

    /// Build images as the given unprivileged identity.
    pub async fn build(&self, uid: u32, gid: u32, home: Option<&str>) -> Result<(), ContainerError> {
        let mut spec = self
            .compose(["build", "--pull"])
            .identity(uid, gid)
            .timeout(self.build_timeout);
        if let Some(home) = home {
            spec = spec.env("HOME", home);
        }
        info!("Building images as uid={} gid={}", uid, gid);
        match self.runner.run(&spec).await {
            Ok(out) if out.success() => Ok(()),
            Ok(out) => Err(ContainerError::Build(out.failure_reason())),
            Err(ExecError::TimedOut { timeout, .. }) => Err(ContainerError::Build(format!(
                "timed out after {:?}",
                timeout
            ))),
            Err(e) => Err(e.into()),
        }
    }

    /// Image IDs of the project's services.
    pub async fn images(&self) -> Result<Vec<String>, ContainerError> {
        let out = self.run_ok("images", self.compose(["images", "-q"])).await?;
        Ok(lines(&out.stdout))
    }

    /// IDs of the project's running containers.
    pub async fn running(&self) -> Result<Vec<String>, ContainerError> {
        let out = self
            .run_ok("ps", self.compose(["ps", "-q", "--status", "running"]))
            .await?;
        Ok(lines(&out.stdout))
    }
}

fn lines(stdout: &str) -> Vec<String> {
    let mut ids: Vec<String> = stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(String::from)
        .collect();
    ids.sort();
    ids.dedup();
    ids
}
