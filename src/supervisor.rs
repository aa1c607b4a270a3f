//! The long-running supervisor loop.
//!
//! Brings audio and containers up, then polls the signal directory on a
//! fixed interval. Handlers run to completion inside the loop; there is
//! never more than one operation in flight.

use crate::audio::{AudioBackend, AudioError, AudioSocketState};
use crate::config::Config;
use crate::containers::{ContainerError, ContainerManager};
use crate::exec::CommandRunner;
use crate::installer::activate_swap;
use crate::service::OperatingUser;
use crate::signal::{SignalBus, SignalError, SignalKind, UpdateStatus};
use crate::update::{Completion, UpdateMode, UpdateOrchestrator};
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

const PID_FILE: &str = "supervisor.pid";

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("Supervisor already running (PID: {0})")]
    AlreadyRunning(i32),

    #[error("Container start failed: {0}")]
    Containers(#[from] ContainerError),

    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),

    #[error("Signal directory error: {0}")]
    Signal(#[from] SignalError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Why the loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    /// Stopped by SIGTERM or Ctrl-C; containers are down.
    Shutdown,
    /// An update changed the supervisor itself; exit so systemd restarts it.
    RestartRequested,
}

/// PID file held for the lifetime of the loop, removed on drop.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// Claim the PID file, refusing if a live process already holds it.
    pub fn acquire(path: &Path) -> Result<Self, SupervisorError> {
        if let Some(pid) = running_pid(path) {
            return Err(SupervisorError::AlreadyRunning(pid));
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, std::process::id().to_string())?;
        debug!("PID file written: {}", path.display());
        Ok(Self {
            path: path.to_path_buf(),
        })
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!("Could not remove PID file {}: {}", self.path.display(), e);
        }
    }
}

/// PID recorded in `path` if that process is still alive.
pub fn running_pid(path: &Path) -> Option<i32> {
    let pid: i32 = std::fs::read_to_string(path).ok()?.trim().parse().ok()?;
    process_alive(pid).then_some(pid)
}

#[cfg(unix)]
fn process_alive(pid: i32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;
    // EPERM still means the process exists.
    match kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        Err(nix::errno::Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
fn process_alive(_pid: i32) -> bool {
    false
}

pub fn pid_file_path(config: &Config) -> PathBuf {
    config.signals.dir.join(PID_FILE)
}

pub struct Supervisor {
    config: Config,
    runner: Arc<dyn CommandRunner>,
    audio: Arc<AudioBackend>,
    containers: ContainerManager,
    signals: SignalBus,
    orchestrator: UpdateOrchestrator,
}

impl Supervisor {
    pub fn new(runner: Arc<dyn CommandRunner>, config: &Config, user: &OperatingUser) -> Self {
        let audio = Arc::new(AudioBackend::new(runner.clone(), &config.audio, user.uid));
        Self::with_audio(runner, config, user, audio)
    }

    pub fn with_audio(
        runner: Arc<dyn CommandRunner>,
        config: &Config,
        user: &OperatingUser,
        audio: Arc<AudioBackend>,
    ) -> Self {
        Self {
            config: config.clone(),
            containers: ContainerManager::new(runner.clone(), config),
            signals: SignalBus::new(&config.signals.dir),
            orchestrator: UpdateOrchestrator::new(runner.clone(), config, user, audio.clone()),
            runner,
            audio,
        }
    }

    /// Run until SIGTERM/Ctrl-C or a self-update.
    pub async fn run(&self) -> Result<Exit, SupervisorError> {
        let _pid = PidFile::acquire(&pid_file_path(&self.config))?;
        self.run_until(shutdown_signal()).await
    }

    /// Run until `shutdown` resolves or a self-update asks for a restart.
    ///
    /// `shutdown` is honored during startup too; whatever was brought up
    /// by then is stopped again.
    pub async fn run_until<F>(&self, shutdown: F) -> Result<Exit, SupervisorError>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        tokio::select! {
            biased;
            started = self.start() => started?,
            _ = &mut shutdown => {
                info!("Shutdown requested during startup");
                self.stop().await;
                return Ok(Exit::Shutdown);
            }
        }

        let mut ticker = tokio::time::interval(self.config.signals.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            "Watching {} every {:?}",
            self.signals.dir().display(),
            self.config.signals.poll_interval()
        );

        let exit = loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    break Exit::Shutdown;
                }
                _ = ticker.tick() => {
                    if let Some(exit) = self.tick().await {
                        break exit;
                    }
                }
            }
        };

        if exit == Exit::Shutdown {
            self.stop().await;
        } else {
            info!("Exiting so the service manager restarts the updated supervisor");
        }
        Ok(exit)
    }

    async fn start(&self) -> Result<(), SupervisorError> {
        self.signals.ensure_dir()?;

        let swap = &self.config.install.swap_file;
        if swap.exists() {
            if let Err(e) = activate_swap(self.runner.as_ref(), Path::new("/proc/swaps"), swap).await {
                warn!("Could not activate swap: {}", e);
            }
        }

        // Audio trouble is reported but does not keep the containers down.
        let deadline = std::time::Duration::from_secs(self.config.audio.socket_wait_secs);
        match self.audio.ensure_socket(deadline).await {
            Ok(socket) => info!("Audio socket ready: {}", socket.display()),
            Err(e) => error!("Audio backend unavailable: {}", e),
        }

        self.containers.start().await?;
        Ok(())
    }

    async fn stop(&self) {
        if let Err(e) = self.containers.stop(self.config.containers.stop_timeout()).await {
            error!("Failed to stop containers: {}", e);
        }
        self.audio.teardown().await;
        info!("Supervisor stopped");
    }

    /// Handle at most one pending signal. Update wins over Restart.
    pub async fn tick(&self) -> Option<Exit> {
        if let Some(branch) = self.signals.peek(SignalKind::Update) {
            info!(
                "Update requested (branch: {})",
                if branch.is_empty() { "current" } else { branch.as_str() }
            );
            return match self.orchestrator.update(&branch, UpdateMode::Supervised).await {
                Ok(report) if report.completion == Completion::ExitProcess => {
                    Some(Exit::RestartRequested)
                }
                Ok(_) => None,
                Err(_) => None,
            };
        }

        if self.signals.peek(SignalKind::Restart).is_some() {
            info!("Restart requested");
            if let Err(e) = self.containers.restart_force_recreate().await {
                error!("Restart failed: {}", e);
            }
            if let Err(e) = self.signals.consume(SignalKind::Restart) {
                warn!("Could not clear restart request: {}", e);
            }
        }
        None
    }
}

/// Resolves on Ctrl-C or SIGTERM.
///
/// The SIGTERM handler is installed when this is called, not when the
/// future is first polled, so a stop during startup is not lost.
fn shutdown_signal() -> impl Future<Output = ()> {
    #[cfg(unix)]
    let term = {
        use tokio::signal::unix::{signal, SignalKind as UnixSignal};
        signal(UnixSignal::terminate())
            .map_err(|e| warn!("Cannot listen for SIGTERM: {}", e))
            .ok()
    };

    async move {
        #[cfg(unix)]
        {
            if let Some(mut term) = term {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
                return;
            }
        }
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Cannot listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

/// Snapshot shown by the `status` command.
#[derive(Debug)]
pub struct StatusReport {
    pub pid: Option<i32>,
    pub audio: AudioSocketState,
    pub pending: Vec<(SignalKind, String)>,
    pub last_update: Option<UpdateStatus>,
}

impl StatusReport {
    pub fn collect(config: &Config, audio: &AudioBackend) -> Self {
        let signals = SignalBus::new(&config.signals.dir);
        let pending = [SignalKind::Update, SignalKind::Restart]
            .into_iter()
            .filter_map(|kind| signals.peek(kind).map(|payload| (kind, payload)))
            .collect();
        Self {
            pid: running_pid(&pid_file_path(config)),
            audio: audio.state(),
            pending,
            last_update: signals.read_status(),
        }
    }
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.pid {
            Some(pid) => writeln!(f, "Supervisor: running (PID: {})", pid)?,
            None => writeln!(f, "Supervisor: not running")?,
        }
        writeln!(f, "Audio:      {}", self.audio)?;
        if self.pending.is_empty() {
            writeln!(f, "Signals:    none pending")?;
        }
        for (kind, payload) in &self.pending {
            writeln!(f, "Signals:    {} pending {}", kind.file_name(), payload)?;
        }
        match &self.last_update {
            Some(status) => {
                write!(
                    f,
                    "Update:     {} on '{}' at {}",
                    status.state,
                    status.branch,
                    status.updated_at.format("%Y-%m-%d %H:%M:%S UTC")
                )?;
                if let Some(ref error) = status.error {
                    write!(f, " ({})", error)?;
                }
                writeln!(f)
            }
            None => writeln!(f, "Update:     never"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::fake::FakeRunner;
    use crate::exec::CommandOutput;
    use crate::service::tests::{sandboxed_config, test_user};

    fn supervisor(config: &Config, runner: &Arc<FakeRunner>) -> Supervisor {
        let audio = AudioBackend::new(runner.clone(), &config.audio, 1000).with_binary_lookup(|_| None);
        Supervisor::with_audio(runner.clone(), config, &test_user(), Arc::new(audio))
    }

    fn setup() -> (tempfile::TempDir, Config) {
        let root = tempfile::tempdir().unwrap();
        let mut config = sandboxed_config(root.path());
        config.audio.socket_wait_secs = 0;
        config.install.swap_file = root.path().join("swapfile");
        (root, config)
    }

    #[tokio::test]
    async fn test_update_handled_before_restart() {
        let (_root, config) = setup();
        let runner = Arc::new(FakeRunner::new());
        let bus = SignalBus::new(&config.signals.dir);
        bus.request(SignalKind::Restart, "").unwrap();
        bus.request(SignalKind::Update, "main").unwrap();

        let sup = supervisor(&config, &runner);
        assert_eq!(sup.tick().await, None);
        assert!(runner.called("git fetch"));
        assert!(bus.peek(SignalKind::Update).is_none());
        assert!(bus.peek(SignalKind::Restart).is_some());

        sup.tick().await;
        assert!(bus.peek(SignalKind::Restart).is_none());
    }

    #[tokio::test]
    async fn test_restart_recreates_and_consumes() {
        let (_root, config) = setup();
        let runner = Arc::new(FakeRunner::new());
        let bus = SignalBus::new(&config.signals.dir);
        bus.request(SignalKind::Restart, "").unwrap();

        supervisor(&config, &runner).tick().await;
        assert!(runner.called("up -d --force-recreate"));
        assert!(bus.peek(SignalKind::Restart).is_none());
    }

    #[tokio::test]
    async fn test_failed_restart_still_consumed() {
        let (_root, config) = setup();
        let runner = Arc::new(FakeRunner::new());
        runner.on("--force-recreate", CommandOutput::failed(1, "daemon unavailable"));
        let bus = SignalBus::new(&config.signals.dir);
        bus.request(SignalKind::Restart, "").unwrap();

        supervisor(&config, &runner).tick().await;
        assert!(bus.peek(SignalKind::Restart).is_none());
    }

    #[tokio::test]
    async fn test_idle_tick_runs_nothing() {
        let (_root, config) = setup();
        let runner = Arc::new(FakeRunner::new());
        assert_eq!(supervisor(&config, &runner).tick().await, None);
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_self_update_requests_exit() {
        let (_root, config) = setup();
        let runner = Arc::new(FakeRunner::new());
        runner
            .on("rev-parse --verify HEAD", CommandOutput::ok("abc123\n"))
            .on("rev-parse --verify refs/remotes/origin/main", CommandOutput::ok("def456\n"))
            .on("diff --name-only", CommandOutput::ok("supervisor/Cargo.toml\n"));
        SignalBus::new(&config.signals.dir)
            .request(SignalKind::Update, "main")
            .unwrap();
        assert_eq!(
            supervisor(&config, &runner).tick().await,
            Some(Exit::RestartRequested)
        );
    }

    #[tokio::test]
    async fn test_shutdown_stops_containers() {
        let (_root, config) = setup();
        let runner = Arc::new(FakeRunner::new());
        let exit = supervisor(&config, &runner)
            .run_until(async {})
            .await
            .unwrap();
        assert_eq!(exit, Exit::Shutdown);
        let up = runner.position("up -d --remove-orphans").unwrap();
        let stop = runner.position("stop --timeout 30").unwrap();
        assert!(up < stop);
    }

    #[tokio::test]
    async fn test_shutdown_during_startup() {
        let (_root, config) = setup();
        let mut config = config;
        // A user session that never publishes its socket keeps startup waiting.
        config.audio.socket_wait_secs = 30;
        let runner = Arc::new(FakeRunner::new());
        let audio = AudioBackend::new(runner.clone(), &config.audio, 1000)
            .with_binary_lookup(|name| (name == "pipewire").then(|| PathBuf::from("/usr/bin/pipewire")));
        let sup = Supervisor::with_audio(runner.clone(), &config, &test_user(), Arc::new(audio));

        let exit = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            sup.run_until(tokio::time::sleep(std::time::Duration::from_millis(100))),
        )
        .await
        .expect("startup ignored the shutdown request")
        .unwrap();
        assert_eq!(exit, Exit::Shutdown);
        assert!(!runner.called("up -d"));
        assert!(runner.called("stop --timeout"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_sigterm_handler_installed_eagerly() {
        let shutdown = shutdown_signal();
        nix::sys::signal::raise(nix::sys::signal::Signal::SIGTERM).unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(5), shutdown)
            .await
            .expect("SIGTERM before the first poll was lost");
    }

    #[tokio::test]
    async fn test_container_start_failure_is_fatal() {
        let (_root, config) = setup();
        let runner = Arc::new(FakeRunner::new());
        runner.on("up -d", CommandOutput::failed(1, "Cannot connect to the Docker daemon"));
        let err = supervisor(&config, &runner)
            .run_until(async {})
            .await
            .unwrap_err();
        assert!(matches!(err, SupervisorError::Containers(_)));
    }

    #[test]
    fn test_pid_file_refuses_second_instance() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("supervisor.pid");
        let guard = PidFile::acquire(&path).unwrap();
        assert_eq!(running_pid(&path), Some(std::process::id() as i32));
        assert!(matches!(
            PidFile::acquire(&path),
            Err(SupervisorError::AlreadyRunning(_))
        ));
        drop(guard);
        assert!(!path.exists());
    }

    #[test]
    fn test_stale_pid_file_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("supervisor.pid");
        std::fs::write(&path, "not-a-pid").unwrap();
        assert!(PidFile::acquire(&path).is_ok());
    }

    #[test]
    fn test_status_report() {
        let (_root, config) = setup();
        let runner = Arc::new(FakeRunner::new());
        let bus = SignalBus::new(&config.signals.dir);
        bus.request(SignalKind::Update, "beta").unwrap();
        let audio = AudioBackend::new(runner, &config.audio, 1000);

        let report = StatusReport::collect(&config, &audio);
        assert_eq!(report.pid, None);
        assert_eq!(report.audio, AudioSocketState::Absent);
        let text = report.to_string();
        assert!(text.contains("not running"));
        assert!(text.contains("update-requested pending beta"));
        assert!(text.contains("Update:     never"));
    }
}
