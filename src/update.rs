//! In-place update of the application checkout and its containers.
//!
//! One update is a straight sequence of steps. Each destructive step that
//! fails runs the rollback continuation (bring the previous containers
//! back up without building) before the error is returned.

use crate::audio::{AudioBackend, AudioError};
use crate::config::Config;
use crate::containers::{ContainerError, ContainerManager};
use crate::exec::{is_executable, CommandRunner, CommandSpec};
use crate::service::{HostConfigurator, OperatingUser, ServiceError};
use crate::signal::{SignalBus, SignalKind, UpdateStatus};
use crate::vcs::{Repository, VcsError};
use chrono::Utc;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};

/// Exit code asking systemd to restart the supervisor with new code.
pub const EXIT_FOR_RESTART: i32 = 75;

#[derive(Error, Debug)]
pub enum UpdateError {
    #[error("Fetch failed: {0}")]
    Network(#[source] VcsError),

    #[error("Source sync failed: {0}")]
    Vcs(#[source] VcsError),

    #[error("Build failed: {0}")]
    Build(#[source] ContainerError),

    #[error("Audio configuration failed: {0}")]
    Audio(#[source] AudioError),

    #[error("Reconfiguration failed: {0}")]
    Config(#[source] ServiceError),

    #[error("Container operation failed: {0}")]
    Containers(#[source] ContainerError),

    #[error("Supervisor {step} failed: {reason}")]
    SelfUpdate { step: &'static str, reason: String },

    #[error("{cause}; rollback also failed: {rollback}")]
    Rollback {
        cause: Box<UpdateError>,
        rollback: ContainerError,
    },
}

impl From<ServiceError> for UpdateError {
    fn from(e: ServiceError) -> Self {
        match e {
            ServiceError::Audio(audio) => UpdateError::Audio(audio),
            other => UpdateError::Config(other),
        }
    }
}

/// Progress through one update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateState {
    Idle,
    ContainersStopped,
    Fetched,
    NoOpSynced,
    Synced,
    Built,
    ConfigUpdated,
    Done,
    RolledBack,
}

impl UpdateState {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateState::Idle => "idle",
            UpdateState::ContainersStopped => "containers-stopped",
            UpdateState::Fetched => "fetched",
            UpdateState::NoOpSynced => "no-op-synced",
            UpdateState::Synced => "synced",
            UpdateState::Built => "built",
            UpdateState::ConfigUpdated => "config-updated",
            UpdateState::Done => "done",
            UpdateState::RolledBack => "rolled-back",
        }
    }
}

impl fmt::Display for UpdateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who is asking, which decides how the update finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateMode {
    /// Running inside the supervisor loop.
    Supervised,
    /// Running from `install --update`, outside the loop.
    Service,
}

/// What has to happen once the new code is in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// Containers were recreated; the supervisor keeps running.
    RestartContainers,
    /// Supervisor sources changed and the new binary is installed; exit
    /// with [`EXIT_FOR_RESTART`].
    ExitProcess,
    /// The unit was restarted through systemd.
    RestartService,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateReport {
    pub branch: String,
    pub from: String,
    pub to: String,
    pub commits_behind: Option<u64>,
    pub synced: bool,
    pub completion: Completion,
}

pub struct UpdateOrchestrator {
    runner: Arc<dyn CommandRunner>,
    repo: Repository,
    containers: ContainerManager,
    signals: SignalBus,
    configurator: HostConfigurator,
    audio: Arc<AudioBackend>,
    user: OperatingUser,
    config: Config,
}

impl UpdateOrchestrator {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        config: &Config,
        user: &OperatingUser,
        audio: Arc<AudioBackend>,
    ) -> Self {
        let repo = Repository::new(runner.clone(), &config.repo.dir, &config.repo.remote)
            .with_fetch_depth(config.repo.fetch_depth)
            .with_fetch_timeout(config.repo.fetch_timeout());
        Self {
            repo,
            containers: ContainerManager::new(runner.clone(), config),
            signals: SignalBus::new(&config.signals.dir),
            configurator: HostConfigurator::new(runner.clone(), config, user),
            runner,
            audio,
            user: user.clone(),
            config: config.clone(),
        }
    }

    /// Converge the checkout to `target_branch` (empty means the current
    /// branch), rebuild and restart. The update request is cleared on
    /// every path.
    pub async fn update(&self, target_branch: &str, mode: UpdateMode) -> Result<UpdateReport, UpdateError> {
        let mut tracker = StatusTracker::new(&self.signals, target_branch);
        let result = self.run(target_branch, mode, &mut tracker).await;

        if let Err(e) = self.signals.consume(SignalKind::Update) {
            warn!("Could not clear update request: {}", e);
        }

        match &result {
            Ok(report) => {
                tracker.from = Some(report.from.clone());
                tracker.to = Some(report.to.clone());
                tracker.commits_behind = report.commits_behind;
                tracker.publish(UpdateState::Done, None);
                info!(
                    "Update of '{}' finished ({} -> {}, {:?})",
                    report.branch,
                    short(&report.from),
                    short(&report.to),
                    report.completion
                );
            }
            Err(e) => {
                error!("Update failed: {}", e);
                tracker.publish(tracker.state, Some(e.to_string()));
            }
        }
        result
    }

    async fn run(
        &self,
        target_branch: &str,
        mode: UpdateMode,
        tracker: &mut StatusTracker<'_>,
    ) -> Result<UpdateReport, UpdateError> {
        // Any network call only after the containers are down.
        if let Err(e) = self
            .containers
            .stop(self.config.containers.stop_timeout())
            .await
        {
            return self.rollback(UpdateError::Containers(e), tracker).await;
        }
        tracker.publish(UpdateState::ContainersStopped, None);

        let branch = if target_branch.trim().is_empty() {
            match self.repo.current_branch().await {
                Ok(b) => b,
                Err(e) => return self.rollback(UpdateError::Vcs(e), tracker).await,
            }
        } else {
            target_branch.trim().to_string()
        };
        tracker.branch = branch.clone();

        let head = match self.repo.head().await {
            Ok(h) => h,
            Err(e) => return self.rollback(UpdateError::Vcs(e), tracker).await,
        };
        tracker.from = Some(head.clone());

        let remote = match self.repo.fetch_branch(&branch).await {
            Ok(r) => r,
            Err(e) => return self.rollback(UpdateError::Network(e), tracker).await,
        };
        tracker.to = Some(remote.clone());
        tracker.publish(UpdateState::Fetched, None);

        let synced = head != remote;
        let self_update = synced && self.supervisor_changed(&head, &remote).await;
        let commits_behind = if synced {
            self.repo.commits_behind(&branch).await
        } else {
            Some(0)
        };
        tracker.commits_behind = commits_behind;

        if synced {
            info!(
                "Updating '{}' {} -> {} ({} commits behind)",
                branch,
                short(&head),
                short(&remote),
                commits_behind.map_or_else(|| "?".to_string(), |n| n.to_string())
            );
            if let Err(e) = self.sync(&branch).await {
                return self.rollback(UpdateError::Vcs(e), tracker).await;
            }
            tracker.publish(UpdateState::Synced, None);

            let home = self.user.home.to_string_lossy();
            if let Err(e) = self
                .containers
                .build(self.user.uid, self.user.gid, Some(&*home))
                .await
            {
                warn!("Build failed, restarting with the existing images");
                return self.rollback(UpdateError::Build(e), tracker).await;
            }
            if self_update {
                if let Err(e) = self.replace_supervisor().await {
                    return self.rollback(e, tracker).await;
                }
            }
            tracker.publish(UpdateState::Built, None);
        } else {
            info!("'{}' already at {}", branch, short(&head));
            tracker.publish(UpdateState::NoOpSynced, None);
        }

        if let Err(e) = self.configurator.apply(&self.audio).await {
            return self.rollback(e.into(), tracker).await;
        }
        tracker.publish(UpdateState::ConfigUpdated, None);

        if let Err(e) = self.containers.restart_force_recreate().await {
            return self.rollback(UpdateError::Containers(e), tracker).await;
        }

        let completion = match mode {
            UpdateMode::Service => {
                self.configurator.restart_unit().await?;
                Completion::RestartService
            }
            UpdateMode::Supervised if self_update => Completion::ExitProcess,
            UpdateMode::Supervised => Completion::RestartContainers,
        };

        Ok(UpdateReport {
            branch,
            from: head,
            to: remote,
            commits_behind,
            synced,
            completion,
        })
    }

    async fn sync(&self, branch: &str) -> Result<(), VcsError> {
        let dirty = self.repo.local_changes().await?;
        if !dirty.is_empty() {
            warn!("Discarding local changes: {}", dirty.join(", "));
        }
        self.repo.checkout(branch).await?;
        self.repo.reset_hard(branch).await
    }

    /// Build the supervisor from the checkout as the operating user and
    /// swap it in at the path the unit starts. The running binary is only
    /// replaced by the final rename.
    async fn replace_supervisor(&self) -> Result<(), UpdateError> {
        let crate_dir = self.config.repo.dir.join(&self.config.repo.supervisor_dir);
        let cargo = self.user.home.join(".cargo/bin/cargo");
        let cargo = if is_executable(&cargo) {
            cargo.to_string_lossy().into_owned()
        } else {
            "cargo".to_string()
        };
        info!("Rebuilding supervisor in {}", crate_dir.display());
        let build = CommandSpec::new(cargo)
            .args(["build", "--release", "--locked"])
            .current_dir(&crate_dir)
            .env("HOME", self.user.home.to_string_lossy().into_owned())
            .identity(self.user.uid, self.user.gid)
            .timeout(self.config.containers.build_timeout());
        self.self_step("build", build).await?;

        let target = self.config.supervisor_binary();
        let staged = PathBuf::from(format!("{}.new", target.display()));
        let artifact = self.config.supervisor_artifact();
        let install = CommandSpec::new("install")
            .args(["-m", "0755"])
            .arg(artifact.to_string_lossy().into_owned())
            .arg(staged.to_string_lossy().into_owned())
            .privileged();
        self.self_step("install", install).await?;
        let swap = CommandSpec::new("mv")
            .arg("-f")
            .arg(staged.to_string_lossy().into_owned())
            .arg(target.to_string_lossy().into_owned())
            .privileged();
        self.self_step("install", swap).await?;
        info!("Installed new supervisor at {}", target.display());
        Ok(())
    }

    async fn self_step(&self, step: &'static str, spec: CommandSpec) -> Result<(), UpdateError> {
        match self.runner.run(&spec).await {
            Ok(out) if out.success() => Ok(()),
            Ok(out) => Err(UpdateError::SelfUpdate {
                step,
                reason: out.failure_reason(),
            }),
            Err(e) => Err(UpdateError::SelfUpdate {
                step,
                reason: e.to_string(),
            }),
        }
    }

    async fn supervisor_changed(&self, from: &str, to: &str) -> bool {
        match self
            .repo
            .changed_paths(from, to, &self.config.repo.supervisor_paths)
            .await
        {
            Ok(paths) if paths.is_empty() => false,
            Ok(paths) => {
                info!("Supervisor sources changed: {}", paths.join(", "));
                true
            }
            Err(e) => {
                warn!("Could not diff supervisor sources, restarting anyway: {}", e);
                true
            }
        }
    }

    /// Bring the previous containers back and return `cause`.
    async fn rollback(
        &self,
        cause: UpdateError,
        tracker: &mut StatusTracker<'_>,
    ) -> Result<UpdateReport, UpdateError> {
        warn!("Rolling back: {}", cause);
        match self.containers.start_without_build().await {
            Ok(()) => {
                tracker.state = UpdateState::RolledBack;
                Err(cause)
            }
            Err(rollback) => Err(UpdateError::Rollback {
                cause: Box::new(cause),
                rollback,
            }),
        }
    }
}

/// Publishes each transition to the status document.
struct StatusTracker<'a> {
    signals: &'a SignalBus,
    state: UpdateState,
    branch: String,
    from: Option<String>,
    to: Option<String>,
    commits_behind: Option<u64>,
}

impl<'a> StatusTracker<'a> {
    fn new(signals: &'a SignalBus, branch: &str) -> Self {
        Self {
            signals,
            state: UpdateState::Idle,
            branch: branch.to_string(),
            from: None,
            to: None,
            commits_behind: None,
        }
    }

    fn publish(&mut self, state: UpdateState, error: Option<String>) {
        self.state = state;
        let status = UpdateStatus {
            state: state.to_string(),
            branch: self.branch.clone(),
            from: self.from.clone(),
            to: self.to.clone(),
            commits_behind: self.commits_behind,
            error,
            updated_at: Utc::now(),
        };
        if let Err(e) = self.signals.write_status(&status) {
            warn!("Could not publish update status: {}", e);
        }
    }
}

fn short(sha: &str) -> &str {
    sha.get(..7).unwrap_or(sha)
}
