//! One-shot host setup.
//!
//! Stage 1 clones the checkout when it is missing and hands over to a
//! fresh process running inside it. Stage 2 brings the host to the
//! installed state. Every step checks before acting, so an interrupted
//! install is finished by simply running it again.

use crate::audio::AudioBackend;
use crate::config::Config;
use crate::containers::{ContainerError, ContainerManager};
use crate::exec::{is_executable, CommandRunner, CommandSpec, ExecError};
use crate::service::{HostConfigurator, OperatingUser, ReconfigureReport, ServiceError};
use crate::signal::{SignalBus, SignalError, SignalKind};
use crate::supervisor::{pid_file_path, running_pid};
use crate::update::{UpdateError, UpdateMode, UpdateOrchestrator, UpdateReport};
use crate::vcs::{Repository, VcsError};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Marks the re-executed stage 2 process so it never clones again.
pub const STAGE_ENV: &str = "BIRDNET_SUPERVISOR_STAGE";

const DOCKER_GROUP: &str = "docker";

#[derive(Error, Debug)]
pub enum InstallerError {
    #[error("Package installation failed: {0}")]
    Packages(String),

    #[error("{action} failed: {reason}")]
    Command { action: String, reason: String },

    #[error("Checkout missing at {0} after bootstrap")]
    MissingCheckout(PathBuf),

    #[error("Validation failed: {}", .0.join(", "))]
    Validation(Vec<String>),

    #[error(transparent)]
    Vcs(#[from] VcsError),

    #[error(transparent)]
    Containers(#[from] ContainerError),

    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error(transparent)]
    Update(#[from] UpdateError),

    #[error(transparent)]
    Signal(#[from] SignalError),

    #[error(transparent)]
    Exec(#[from] ExecError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Default)]
pub struct InstallOptions {
    /// Run the update path instead of a fresh install
    pub update: bool,
    pub branch: Option<String>,
    pub no_reboot: bool,
    pub skip_build: bool,
}

/// Result of one validation check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Check {
    pub name: &'static str,
    pub passed: bool,
}

/// What a stage 2 run did.
#[derive(Debug, Clone, Default)]
pub struct InstallReport {
    pub packages_installed: Vec<String>,
    pub docker_group_added: bool,
    pub swap_created: bool,
    pub ownership_fixed: bool,
    pub state_dirs_created: bool,
    pub images_built: bool,
    pub host: ReconfigureReport,
    pub checks: Vec<Check>,
    pub reboot_scheduled: bool,
}

impl InstallReport {
    pub fn changed(&self) -> bool {
        !self.packages_installed.is_empty()
            || self.docker_group_added
            || self.swap_created
            || self.ownership_fixed
            || self.state_dirs_created
            || self.images_built
            || self.host.changed()
    }
}

#[derive(Debug)]
pub enum InstallOutcome {
    /// The checkout was just cloned; stage 2 must run from inside it.
    Bootstrapped { repo_dir: PathBuf },
    Installed(InstallReport),
    Updated(UpdateReport),
    /// A supervisor is running; the update was queued for its loop.
    Requested { pid: i32, branch: String },
}

pub struct Installer {
    runner: Arc<dyn CommandRunner>,
    config: Config,
    user: OperatingUser,
    audio: Arc<AudioBackend>,
    meminfo: PathBuf,
    swaps: PathBuf,
}

impl Installer {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        config: &Config,
        user: &OperatingUser,
        audio: Arc<AudioBackend>,
    ) -> Self {
        Self {
            runner,
            config: config.clone(),
            user: user.clone(),
            audio,
            meminfo: PathBuf::from("/proc/meminfo"),
            swaps: PathBuf::from("/proc/swaps"),
        }
    }

    /// Read memory and swap state from other files than `/proc`.
    pub fn with_proc_files(mut self, meminfo: impl Into<PathBuf>, swaps: impl Into<PathBuf>) -> Self {
        self.meminfo = meminfo.into();
        self.swaps = swaps.into();
        self
    }

    fn repo(&self) -> Repository {
        Repository::new(self.runner.clone(), &self.config.repo.dir, &self.config.repo.remote)
            .with_fetch_depth(self.config.repo.fetch_depth)
            .with_fetch_timeout(self.config.repo.fetch_timeout())
    }

    pub async fn install(&self, options: &InstallOptions) -> Result<InstallOutcome, InstallerError> {
        let repo = self.repo();

        if options.update {
            return self.update(options).await;
        }

        if !repo.exists() {
            if std::env::var_os(STAGE_ENV).is_some() {
                return Err(InstallerError::MissingCheckout(self.config.repo.dir.clone()));
            }
            let branch = options
                .branch
                .clone()
                .unwrap_or_else(|| self.config.repo.default_branch.clone());
            if let Some(parent) = self.config.repo.dir.parent() {
                fs::create_dir_all(parent)?;
            }
            info!(
                "Cloning {} ({}) into {}",
                self.config.repo.url,
                branch,
                self.config.repo.dir.display()
            );
            repo.clone_from(&self.config.repo.url, &branch).await?;
            return Ok(InstallOutcome::Bootstrapped {
                repo_dir: self.config.repo.dir.clone(),
            });
        }

        self.stage_two(options).await.map(InstallOutcome::Installed)
    }

    /// `install --update`. Without `--branch` the branch comes from a
    /// pending update request. A live supervisor gets the request queued
    /// instead, so only its loop ever runs an update.
    async fn update(&self, options: &InstallOptions) -> Result<InstallOutcome, InstallerError> {
        if !self.repo().exists() {
            return Err(VcsError::NotARepository(self.config.repo.dir.clone()).into());
        }
        let signals = SignalBus::new(&self.config.signals.dir);
        let branch = options
            .branch
            .clone()
            .or_else(|| signals.peek(SignalKind::Update))
            .unwrap_or_default();

        if let Some(pid) = running_pid(&pid_file_path(&self.config)) {
            info!("Supervisor running (PID: {}), queueing the update", pid);
            signals.request(SignalKind::Update, &branch)?;
            return Ok(InstallOutcome::Requested { pid, branch });
        }

        let orchestrator = UpdateOrchestrator::new(
            self.runner.clone(),
            &self.config,
            &self.user,
            self.audio.clone(),
        );
        let report = orchestrator.update(&branch, UpdateMode::Service).await?;
        Ok(InstallOutcome::Updated(report))
    }

    async fn stage_two(&self, options: &InstallOptions) -> Result<InstallReport, InstallerError> {
        let mut report = InstallReport::default();

        report.packages_installed = self.install_packages().await?;
        report.docker_group_added = self.ensure_group(DOCKER_GROUP).await?;
        report.swap_created = self.ensure_swap().await?;
        report.ownership_fixed = self.fix_ownership().await?;
        report.state_dirs_created = self.ensure_state_dirs().await?;

        let containers = ContainerManager::new(self.runner.clone(), &self.config);
        if options.skip_build {
            info!("Skipping image build");
        } else if containers.images().await.map(|i| i.is_empty()).unwrap_or(true) {
            let home = self.user.home.to_string_lossy();
            containers
                .build(self.user.uid, self.user.gid, Some(&*home))
                .await?;
            report.images_built = true;
        } else {
            debug!("Images present, not rebuilding");
        }

        // Audio system config, stream env, unit, privilege rules.
        let configurator = HostConfigurator::new(self.runner.clone(), &self.config, &self.user);
        report.host = configurator.apply(&self.audio).await?;

        report.checks = self.validate(&containers, options).await;
        let failed: Vec<String> = report
            .checks
            .iter()
            .filter(|c| !c.passed)
            .map(|c| c.name.to_string())
            .collect();
        if !failed.is_empty() {
            return Err(InstallerError::Validation(failed));
        }
        info!("All {} checks passed", report.checks.len());

        if options.no_reboot {
            info!("Not rebooting (--no-reboot)");
        } else if !report.changed() {
            info!("Nothing changed, no reboot needed");
        } else {
            self.privileged("reboot", CommandSpec::new("systemctl").arg("reboot"))
                .await?;
            report.reboot_scheduled = true;
        }
        Ok(report)
    }

    async fn privileged(&self, action: &str, spec: CommandSpec) -> Result<(), InstallerError> {
        let out = self.runner.run(&spec.privileged()).await?;
        if !out.success() {
            return Err(InstallerError::Command {
                action: action.to_string(),
                reason: out.failure_reason(),
            });
        }
        Ok(())
    }

    async fn package_installed(&self, package: &str) -> Result<bool, InstallerError> {
        let out = self
            .runner
            .run(&CommandSpec::new("dpkg-query").args(["-W", "-f=${Status}", package]))
            .await?;
        Ok(out.success() && out.stdout.contains("install ok installed"))
    }

    async fn runtime_present(&self) -> bool {
        matches!(
            self.runner
                .run(&CommandSpec::new("docker").args(["compose", "version"]))
                .await,
            Ok(out) if out.success()
        )
    }

    /// Install every missing package with a single index refresh.
    async fn install_packages(&self) -> Result<Vec<String>, InstallerError> {
        let mut wanted = self.config.install.packages.clone();
        if !self.runtime_present().await {
            wanted.extend(self.config.install.runtime_packages.iter().cloned());
        }

        let mut missing = Vec::new();
        for package in wanted {
            if !missing.contains(&package) && !self.package_installed(&package).await? {
                missing.push(package);
            }
        }
        if missing.is_empty() {
            debug!("All packages present");
            return Ok(missing);
        }

        info!("Installing packages: {}", missing.join(" "));
        let update = CommandSpec::new("apt-get")
            .args(["-q", "update"])
            .env("DEBIAN_FRONTEND", "noninteractive")
            .privileged();
        let out = self.runner.run(&update).await?;
        if !out.success() {
            return Err(InstallerError::Packages(out.failure_reason()));
        }
        let install = CommandSpec::new("apt-get")
            .args(["-q", "-y", "--no-install-recommends", "install"])
            .args(missing.iter().cloned())
            .env("DEBIAN_FRONTEND", "noninteractive")
            .privileged();
        let out = self.runner.run(&install).await?;
        if !out.success() {
            return Err(InstallerError::Packages(out.failure_reason()));
        }
        Ok(missing)
    }

    async fn ensure_group(&self, group: &str) -> Result<bool, InstallerError> {
        let out = self
            .runner
            .run(&CommandSpec::new("id").args(["-nG", self.user.name.as_str()]))
            .await?;
        if out.stdout.split_whitespace().any(|g| g == group) {
            return Ok(false);
        }
        self.privileged(
            "usermod",
            CommandSpec::new("usermod").args(["-aG", group, self.user.name.as_str()]),
        )
        .await?;
        info!("Added {} to group {}", self.user.name, group);
        Ok(true)
    }

    /// Create and enable a swap file on small-memory hosts without swap.
    async fn ensure_swap(&self) -> Result<bool, InstallerError> {
        let Some(total_mb) = memory_total_mb(&self.meminfo) else {
            warn!("Could not read {}, skipping swap check", self.meminfo.display());
            return Ok(false);
        };
        if total_mb >= self.config.install.swap_below_memory_mb || swap_active(&self.swaps) {
            return Ok(false);
        }

        let file = self.config.install.swap_file.to_string_lossy().into_owned();
        let mut created = false;
        if !self.config.install.swap_file.exists() {
            info!("{} MiB of memory, creating {}", total_mb, file);
            let size = format!("{}M", self.config.install.swap_size_mb);
            self.privileged("fallocate", CommandSpec::new("fallocate").args(["-l", size.as_str(), file.as_str()]))
                .await?;
            self.privileged("chmod", CommandSpec::new("chmod").args(["600", file.as_str()]))
                .await?;
            self.privileged("mkswap", CommandSpec::new("mkswap").arg(file.as_str()))
                .await?;
            created = true;
        }
        activate_swap(self.runner.as_ref(), &self.swaps, &self.config.install.swap_file).await?;
        Ok(created)
    }

    async fn fix_ownership(&self) -> Result<bool, InstallerError> {
        let dir = &self.config.repo.dir;
        if owned_by(dir, self.user.uid, self.user.gid) {
            return Ok(false);
        }
        let owner = format!("{}:{}", self.user.uid, self.user.gid);
        self.privileged(
            "chown",
            CommandSpec::new("chown")
                .args(["-R", owner.as_str()])
                .arg(dir.to_string_lossy().into_owned()),
        )
        .await?;
        info!("Changed owner of {} to {}", dir.display(), self.user.name);
        Ok(true)
    }

    /// Signal and log directories, writable by the operating user.
    async fn ensure_state_dirs(&self) -> Result<bool, InstallerError> {
        let mut created = false;
        for dir in [&self.config.signals.dir, &self.config.logging.dir] {
            if dir.is_dir() && owned_by(dir, self.user.uid, self.user.gid) {
                continue;
            }
            self.privileged(
                "install",
                CommandSpec::new("install")
                    .args([
                        "-d".to_string(),
                        "-o".to_string(),
                        self.user.uid.to_string(),
                        "-g".to_string(),
                        self.user.gid.to_string(),
                        "-m".to_string(),
                        "0775".to_string(),
                    ])
                    .arg(dir.to_string_lossy().into_owned()),
            )
            .await?;
            created = true;
        }
        Ok(created)
    }

    /// Run the backend selection for real; a first install without a
    /// working audio socket is a failed install.
    async fn ensure_audio(&self) -> bool {
        let deadline = Duration::from_secs(self.config.audio.socket_wait_secs);
        match self.audio.ensure_socket(deadline).await {
            Ok(socket) => {
                info!("Audio socket ready: {}", socket.display());
                true
            }
            Err(e) => {
                warn!("Audio backend unavailable: {}", e);
                false
            }
        }
    }

    async fn validate(&self, containers: &ContainerManager, options: &InstallOptions) -> Vec<Check> {
        let mut checks = vec![
            Check {
                name: "container runtime",
                passed: self.runtime_present().await,
            },
            Check {
                name: "audio backend",
                passed: self.ensure_audio().await,
            },
            Check {
                name: "service unit",
                passed: self.config.service.unit_path().is_file(),
            },
            Check {
                name: "supervisor binary",
                passed: is_executable(&self.config.supervisor_binary()),
            },
        ];
        if !options.skip_build {
            checks.push(Check {
                name: "container images",
                passed: containers.images().await.map(|i| !i.is_empty()).unwrap_or(false),
            });
        }
        for check in checks.iter().filter(|c| !c.passed) {
            warn!("Check failed: {}", check.name);
        }
        checks
    }
}

/// `swapon` a swap file unless it is already active.
pub async fn activate_swap(
    runner: &dyn CommandRunner,
    swaps: &Path,
    file: &Path,
) -> Result<(), InstallerError> {
    if swap_listed(swaps, file) {
        return Ok(());
    }
    let spec = CommandSpec::new("swapon")
        .arg(file.to_string_lossy().into_owned())
        .privileged();
    let out = runner.run(&spec).await?;
    if !out.success() {
        return Err(InstallerError::Command {
            action: "swapon".into(),
            reason: out.failure_reason(),
        });
    }
    Ok(())
}

/// `MemTotal` in MiB.
fn memory_total_mb(meminfo: &Path) -> Option<u64> {
    let contents = fs::read_to_string(meminfo).ok()?;
    contents
        .lines()
        .find(|l| l.starts_with("MemTotal:"))
        .and_then(|l| l.split_whitespace().nth(1))
        .and_then(|kb| kb.parse::<u64>().ok())
        .map(|kb| kb / 1024)
}

/// Any swap device or file active (entries after the header line).
fn swap_active(swaps: &Path) -> bool {
    fs::read_to_string(swaps)
        .map(|c| c.lines().skip(1).any(|l| !l.trim().is_empty()))
        .unwrap_or(false)
}

fn swap_listed(swaps: &Path, file: &Path) -> bool {
    let file = file.to_string_lossy();
    fs::read_to_string(swaps)
        .map(|c| {
            c.lines()
                .skip(1)
                .any(|l| l.split_whitespace().next() == Some(file.as_ref()))
        })
        .unwrap_or(false)
}

fn owned_by(path: &Path, uid: u32, gid: u32) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        fs::metadata(path)
            .map(|m| m.uid() == uid && m.gid() == gid)
            .unwrap_or(false)
    }
    #[cfg(not(unix))]
    {
        let _ = (path, uid, gid);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::fake::FakeRunner;
    use crate::exec::CommandOutput;
    use crate::service::tests::sandboxed_config;
    use std::os::unix::fs::{MetadataExt, PermissionsExt};

    struct Host {
        root: tempfile::TempDir,
        config: Config,
        user: OperatingUser,
    }

    impl Host {
        /// A host that already has everything stage 2 needs except the
        /// files the configurator writes.
        fn prepared() -> Self {
            let root = tempfile::tempdir().unwrap();
            let mut config = sandboxed_config(root.path());
            fs::create_dir_all(config.repo.dir.join(".git")).unwrap();
            fs::create_dir_all(&config.signals.dir).unwrap();
            fs::create_dir_all(&config.logging.dir).unwrap();

            let binary = root.path().join("bin/birdnet-supervisor");
            fs::create_dir_all(binary.parent().unwrap()).unwrap();
            fs::write(&binary, "#!/bin/sh\n").unwrap();
            fs::set_permissions(&binary, fs::Permissions::from_mode(0o755)).unwrap();
            config.service.binary = Some(binary);

            let meta = fs::metadata(&config.repo.dir).unwrap();
            let user = OperatingUser {
                name: "pi".into(),
                group: "pi".into(),
                uid: meta.uid(),
                gid: meta.gid(),
                home: root.path().to_path_buf(),
            };
            // A system daemon already serves the socket.
            config.audio.socket_wait_secs = 0;
            let system_dir = config.audio.system_socket.parent().unwrap();
            fs::create_dir_all(system_dir).unwrap();
            fs::write(&config.audio.system_socket, "").unwrap();
            fs::write(root.path().join("meminfo"), "MemTotal:        3884812 kB\n").unwrap();
            fs::write(root.path().join("swaps"), "Filename Type Size Used Priority\n").unwrap();
            Self { root, config, user }
        }

        fn runner(&self) -> Arc<FakeRunner> {
            self.runner_with(|_| {})
        }

        /// Rules set up by `setup` take precedence over the defaults.
        fn runner_with(&self, setup: impl FnOnce(&FakeRunner)) -> Arc<FakeRunner> {
            let runner = Arc::new(FakeRunner::new());
            setup(&runner);
            runner
                .on("dpkg-query", CommandOutput::ok("install ok installed"))
                .on("id -nG", CommandOutput::ok("pi adm docker audio\n"))
                .on("images -q", CommandOutput::ok("sha256:aaa\n"));
            runner
        }

        fn installer(&self, runner: &Arc<FakeRunner>) -> Installer {
            let audio = AudioBackend::new(runner.clone(), &self.config.audio, self.user.uid)
                .with_binary_lookup(|_| None);
            Installer::new(runner.clone(), &self.config, &self.user, Arc::new(audio))
                .with_proc_files(self.root.path().join("meminfo"), self.root.path().join("swaps"))
        }
    }

    fn stage_two(outcome: InstallOutcome) -> InstallReport {
        match outcome {
            InstallOutcome::Installed(report) => report,
            other => panic!("expected stage 2, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_second_run_changes_nothing() {
        let host = Host::prepared();
        let options = InstallOptions::default();

        let first = stage_two(
            host.installer(&host.runner())
                .install(&options)
                .await
                .unwrap(),
        );
        assert!(first.changed());
        assert!(first.host.unit_changed);

        let runner = host.runner();
        let second = stage_two(host.installer(&runner).install(&options).await.unwrap());
        assert!(!second.changed());
        assert!(second.checks.iter().all(|c| c.passed));
        assert!(!second.reboot_scheduled);
        for destructive in ["apt-get", "usermod", "chown", "build --pull", "mkswap", "reboot", "visudo"] {
            assert!(!runner.called(destructive), "second run called {}", destructive);
        }
    }

    #[tokio::test]
    async fn test_missing_packages_batched() {
        let host = Host::prepared();
        let runner = Arc::new(FakeRunner::new());
        runner
            .on("dpkg-query -W -f=${Status} git", CommandOutput::failed(1, "no packages found"))
            .on("dpkg-query -W -f=${Status} curl", CommandOutput::failed(1, "no packages found"))
            .on("dpkg-query", CommandOutput::ok("install ok installed"))
            .on("id -nG", CommandOutput::ok("pi docker\n"))
            .on("images -q", CommandOutput::ok("sha256:aaa\n"));
        let options = InstallOptions {
            no_reboot: true,
            ..Default::default()
        };
        let report = stage_two(host.installer(&runner).install(&options).await.unwrap());
        assert_eq!(report.packages_installed, vec!["git", "curl"]);
        assert_eq!(runner.count("apt-get -q update"), 1);
        assert_eq!(runner.count("install git curl"), 1);
        assert!(!runner.called("reboot"));
    }

    #[tokio::test]
    async fn test_missing_runtime_joins_batch() {
        let host = Host::prepared();
        let runner = host.runner_with(|r| {
            r.once("docker compose version", CommandOutput::failed(127, "docker: not found"))
                .on("dpkg-query -W -f=${Status} docker", CommandOutput::failed(1, ""));
        });
        let options = InstallOptions {
            no_reboot: true,
            ..Default::default()
        };
        let report = stage_two(host.installer(&runner).install(&options).await.unwrap());
        assert_eq!(report.packages_installed, vec!["docker.io", "docker-compose"]);
    }

    #[tokio::test]
    async fn test_build_only_when_images_missing() {
        let host = Host::prepared();
        let runner = host.runner_with(|r| {
            r.once("images -q", CommandOutput::ok(""));
        });
        let options = InstallOptions {
            no_reboot: true,
            ..Default::default()
        };
        let report = stage_two(host.installer(&runner).install(&options).await.unwrap());
        assert!(report.images_built);
        assert!(runner.called("build --pull"));
    }

    #[tokio::test]
    async fn test_skip_build() {
        let host = Host::prepared();
        let runner = host.runner();
        let options = InstallOptions {
            no_reboot: true,
            skip_build: true,
            ..Default::default()
        };
        let report = stage_two(host.installer(&runner).install(&options).await.unwrap());
        assert!(!runner.called("build"));
        assert!(report.checks.iter().all(|c| c.name != "container images"));
    }

    #[tokio::test]
    async fn test_validation_failure_lists_checks() {
        let host = Host::prepared();
        let runner = host.runner();
        runner.on("docker compose version", CommandOutput::failed(1, "broken"));
        let options = InstallOptions {
            no_reboot: true,
            ..Default::default()
        };
        let err = host.installer(&runner).install(&options).await.unwrap_err();
        match err {
            InstallerError::Validation(failed) => assert_eq!(failed, vec!["container runtime"]),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_missing_audio_socket_fails_validation() {
        let host = Host::prepared();
        fs::remove_file(&host.config.audio.system_socket).unwrap();
        let runner = host.runner();
        let options = InstallOptions {
            no_reboot: true,
            ..Default::default()
        };
        let err = host.installer(&runner).install(&options).await.unwrap_err();
        match err {
            InstallerError::Validation(failed) => assert_eq!(failed, vec!["audio backend"]),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_update_queued_for_running_supervisor() {
        let host = Host::prepared();
        fs::write(
            pid_file_path(&host.config),
            std::process::id().to_string(),
        )
        .unwrap();
        let runner = host.runner();
        let options = InstallOptions {
            update: true,
            branch: Some("beta".into()),
            ..Default::default()
        };
        let outcome = host.installer(&runner).install(&options).await.unwrap();
        match outcome {
            InstallOutcome::Requested { pid, branch } => {
                assert_eq!(pid, std::process::id() as i32);
                assert_eq!(branch, "beta");
            }
            other => panic!("expected a queued update, got {:?}", other),
        }
        let bus = SignalBus::new(&host.config.signals.dir);
        assert_eq!(bus.peek(SignalKind::Update).as_deref(), Some("beta"));
        assert!(!runner.called("git"));
        assert!(!runner.called("compose"));
    }

    #[tokio::test]
    async fn test_update_branch_from_pending_request() {
        let host = Host::prepared();
        SignalBus::new(&host.config.signals.dir)
            .request(SignalKind::Update, "beta")
            .unwrap();
        let runner = host.runner();
        let options = InstallOptions {
            update: true,
            ..Default::default()
        };
        let outcome = host.installer(&runner).install(&options).await.unwrap();
        match outcome {
            InstallOutcome::Updated(report) => assert_eq!(report.branch, "beta"),
            other => panic!("expected an update, got {:?}", other),
        }
        assert!(runner.called("+refs/heads/beta:refs/remotes/origin/beta"));
        assert!(runner.called("systemctl restart birdnet-supervisor.service"));
    }

    #[tokio::test]
    async fn test_reboot_after_changes() {
        let host = Host::prepared();
        let runner = host.runner();
        let report = stage_two(
            host.installer(&runner)
                .install(&InstallOptions::default())
                .await
                .unwrap(),
        );
        assert!(report.reboot_scheduled);
        assert!(runner.called("systemctl reboot"));
    }

    #[tokio::test]
    async fn test_small_memory_gets_swap() {
        let host = Host::prepared();
        fs::write(host.root.path().join("meminfo"), "MemTotal:         443500 kB\n").unwrap();
        let runner = host.runner();
        let mut config = host.config.clone();
        config.install.swap_file = host.root.path().join("swapfile");
        let audio = AudioBackend::new(runner.clone(), &config.audio, host.user.uid)
            .with_binary_lookup(|_| None);
        let installer = Installer::new(runner.clone(), &config, &host.user, Arc::new(audio))
            .with_proc_files(host.root.path().join("meminfo"), host.root.path().join("swaps"));
        let options = InstallOptions {
            no_reboot: true,
            ..Default::default()
        };
        let report = stage_two(installer.install(&options).await.unwrap());
        assert!(report.swap_created);
        let fallocate = runner.position("fallocate -l 1024M").unwrap();
        let swapon = runner.position("swapon").unwrap();
        assert!(fallocate < swapon);
    }

    #[tokio::test]
    async fn test_missing_checkout_is_cloned() {
        let host = Host::prepared();
        fs::remove_dir_all(host.config.repo.dir.join(".git")).unwrap();
        let runner = host.runner();
        let options = InstallOptions {
            branch: Some("beta".into()),
            ..Default::default()
        };
        let outcome = host.installer(&runner).install(&options).await.unwrap();
        assert!(matches!(outcome, InstallOutcome::Bootstrapped { .. }));
        assert!(runner.called("git clone --depth 1 --branch beta"));
        assert!(!runner.called("dpkg-query"));
    }

    #[tokio::test]
    async fn test_state_dirs_created_for_user() {
        let host = Host::prepared();
        fs::remove_dir_all(&host.config.signals.dir).unwrap();
        let runner = host.runner();
        let options = InstallOptions {
            no_reboot: true,
            ..Default::default()
        };
        let report = stage_two(host.installer(&runner).install(&options).await.unwrap());
        assert!(report.state_dirs_created);
        let expected = format!(
            "install -d -o {} -g {} -m 0775 {}",
            host.user.uid,
            host.user.gid,
            host.config.signals.dir.display()
        );
        assert!(runner.called(&expected));
        assert_eq!(runner.count("install -d -o"), 1);
    }

    #[test]
    fn test_memory_parsing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meminfo");
        fs::write(&path, "MemTotal:        1015808 kB\nMemFree: 1 kB\n").unwrap();
        assert_eq!(memory_total_mb(&path), Some(992));
        assert_eq!(memory_total_mb(&dir.path().join("absent")), None);
    }
}
