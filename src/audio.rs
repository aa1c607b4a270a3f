//! Audio backend selection for the capture containers.
//!
//! Containers reach the host's sound server through a socket at a fixed
//! system path. That socket is provided either by the logged-in user's
//! session server (PipeWire/PulseAudio), bind-mounted onto the system path
//! because symlinks are not visible inside containers, or by a system-wide
//! PulseAudio daemon. Exactly one of the two may be live at a time.

use crate::config::AudioConfig;
use crate::exec::{lookup_binary, CommandRunner, CommandSpec, ExecError};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Poll cadence while waiting for the user-session socket.
const USER_SOCKET_POLL: Duration = Duration::from_millis(500);

/// How often the user-socket wait reports progress.
const PROGRESS_EVERY: Duration = Duration::from_secs(10);

/// Group granting access to the system daemon socket.
pub const PULSE_ACCESS_GROUP: &str = "pulse-access";

#[derive(Error, Debug)]
pub enum AudioError {
    #[error("User audio socket {path} did not appear within {waited:?}")]
    UserSocketTimeout { path: PathBuf, waited: Duration },

    #[error("Bind mount of {source_dir} onto {target} failed: {reason}")]
    Mount {
        source_dir: PathBuf,
        target: PathBuf,
        reason: String,
    },

    #[error("System audio daemon failed to start: {0}")]
    DaemonStart(String),

    #[error("System audio socket {path} missing after {attempts} checks")]
    DaemonSocketMissing { path: PathBuf, attempts: u32 },

    #[error("System audio daemon not responsive: {0}")]
    Unresponsive(String),

    #[error("No audio backend available: neither a user session nor a system daemon")]
    NoBackend,

    #[error(transparent)]
    Exec(#[from] ExecError),
}

/// Which backend currently provides the system socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioSocketState {
    Absent,
    UserModeBindMounted,
    SystemDaemonRunning,
}

impl std::fmt::Display for AudioSocketState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            AudioSocketState::Absent => "absent",
            AudioSocketState::UserModeBindMounted => "user session (bind mount)",
            AudioSocketState::SystemDaemonRunning => "system daemon",
        };
        f.write_str(name)
    }
}

type BinaryLookup = Box<dyn Fn(&str) -> Option<PathBuf> + Send + Sync>;

pub struct AudioBackend {
    runner: Arc<dyn CommandRunner>,
    system_socket: PathBuf,
    user_runtime_dir: PathBuf,
    mountinfo: PathBuf,
    daemon_retries: u32,
    retry_interval: Duration,
    lookup: BinaryLookup,
    mounted_by_us: AtomicBool,
}

impl AudioBackend {
    /// Backend for the user with numeric id `uid`.
    pub fn new(runner: Arc<dyn CommandRunner>, config: &AudioConfig, uid: u32) -> Self {
        Self {
            runner,
            system_socket: config.system_socket.clone(),
            user_runtime_dir: config.user_runtime_root.join(uid.to_string()),
            mountinfo: config.mountinfo.clone(),
            daemon_retries: config.daemon_start_retries.max(1),
            retry_interval: Duration::from_millis(config.daemon_retry_interval_ms),
            lookup: Box::new(lookup_binary),
            mounted_by_us: AtomicBool::new(false),
        }
    }

    /// Replace the PATH lookup used to detect installed audio servers.
    pub fn with_binary_lookup<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<PathBuf> + Send + Sync + 'static,
    {
        self.lookup = Box::new(lookup);
        self
    }

    pub fn system_socket(&self) -> &Path {
        &self.system_socket
    }

    /// Directory holding the system socket; the bind-mount target.
    pub fn system_dir(&self) -> PathBuf {
        self.system_socket
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("/run/pulse"))
    }

    /// Directory holding the user-session socket; the bind-mount source.
    pub fn user_dir(&self) -> PathBuf {
        self.user_runtime_dir.join("pulse")
    }

    pub fn user_socket(&self) -> PathBuf {
        self.user_dir().join("native")
    }

    /// A user-session sound server is installed or already running.
    pub fn compositor_present(&self) -> bool {
        self.user_runtime_dir.join("pipewire-0").exists()
            || self.user_dir().exists()
            || (self.lookup)("pipewire").is_some()
    }

    /// A system-wide daemon binary is installed.
    pub fn daemon_available(&self) -> bool {
        (self.lookup)("pulseaudio").is_some()
    }

    fn daemon_binary(&self) -> PathBuf {
        (self.lookup)("pulseaudio").unwrap_or_else(|| PathBuf::from("/usr/bin/pulseaudio"))
    }

    /// Probe the current state without side effects.
    pub fn state(&self) -> AudioSocketState {
        if is_mount_point(&self.mountinfo, &self.system_dir()) {
            AudioSocketState::UserModeBindMounted
        } else if self.system_socket.exists() {
            AudioSocketState::SystemDaemonRunning
        } else {
            AudioSocketState::Absent
        }
    }

    /// Make sure containers have a working audio socket at the system path.
    ///
    /// `deadline` bounds the wait for a user-session socket; the system
    /// daemon path is bounded by a retry count instead.
    pub async fn ensure_socket(&self, deadline: Duration) -> Result<PathBuf, AudioError> {
        let state = self.state();
        if state == AudioSocketState::UserModeBindMounted {
            debug!("{} already bind-mounted", self.system_dir().display());
            return Ok(self.system_socket.clone());
        }

        if self.compositor_present() && !self.daemon_available() {
            self.wait_for_user_socket(deadline).await?;
        }

        if self.user_socket().exists() {
            if state == AudioSocketState::SystemDaemonRunning {
                info!("User audio session found, stopping system daemon first");
                self.stop_system_daemon().await?;
            }
            self.bind_mount().await?;
            return Ok(self.system_socket.clone());
        }

        if state == AudioSocketState::SystemDaemonRunning {
            info!(
                "Reusing system audio daemon at {}",
                self.system_socket.display()
            );
            return Ok(self.system_socket.clone());
        }

        if !self.daemon_available() {
            return Err(AudioError::NoBackend);
        }
        self.start_system_daemon().await?;
        Ok(self.system_socket.clone())
    }

    async fn wait_for_user_socket(&self, deadline: Duration) -> Result<(), AudioError> {
        let socket = self.user_socket();
        let started = Instant::now();
        let mut last_report = started;
        info!("Waiting up to {:?} for {}", deadline, socket.display());

        while !socket.exists() {
            let elapsed = started.elapsed();
            if elapsed >= deadline {
                return Err(AudioError::UserSocketTimeout {
                    path: socket,
                    waited: elapsed,
                });
            }
            if last_report.elapsed() >= PROGRESS_EVERY {
                info!(
                    "Still waiting for user audio socket ({}s elapsed)",
                    elapsed.as_secs()
                );
                last_report = Instant::now();
            }
            sleep(USER_SOCKET_POLL.min(deadline - elapsed)).await;
        }
        info!("User audio socket ready after {:?}", started.elapsed());
        Ok(())
    }

    async fn bind_mount(&self) -> Result<(), AudioError> {
        let source_dir = self.user_dir();
        let target = self.system_dir();
        let mount_err = |reason: String| AudioError::Mount {
            source_dir: source_dir.clone(),
            target: target.clone(),
            reason,
        };

        let mkdir = CommandSpec::new("install")
            .args(["-d", "-m", "0755"])
            .arg(target.to_string_lossy().into_owned())
            .privileged();
        let out = self.runner.run(&mkdir).await?;
        if !out.success() {
            return Err(mount_err(out.failure_reason()));
        }

        let mount = CommandSpec::new("mount")
            .arg("--bind")
            .arg(source_dir.to_string_lossy().into_owned())
            .arg(target.to_string_lossy().into_owned())
            .privileged();
        let out = self.runner.run(&mount).await?;
        if !out.success() {
            return Err(mount_err(out.failure_reason()));
        }
        self.mounted_by_us.store(true, Ordering::SeqCst);

        if !self.system_socket.exists() {
            return Err(mount_err(format!(
                "{} not visible after mount",
                self.system_socket.display()
            )));
        }
        info!(
            "Bind-mounted {} onto {}",
            source_dir.display(),
            target.display()
        );
        Ok(())
    }

    async fn stop_system_daemon(&self) -> Result<(), AudioError> {
        let kill = CommandSpec::new("pkill")
            .args(["-x", "pulseaudio"])
            .privileged();
        let out = self.runner.run(&kill).await?;
        // pkill exits 1 when nothing matched, which is fine here.
        if !out.success() && out.code != Some(1) {
            return Err(AudioError::DaemonStart(format!(
                "could not stop system daemon: {}",
                out.failure_reason()
            )));
        }
        Ok(())
    }

    async fn start_system_daemon(&self) -> Result<(), AudioError> {
        info!("Starting system-wide audio daemon");
        let start = CommandSpec::new(self.daemon_binary().to_string_lossy().into_owned())
            .args(daemon_args())
            .privileged();
        let out = self.runner.run(&start).await?;
        if !out.success() {
            return Err(AudioError::DaemonStart(out.failure_reason()));
        }

        let mut attempts = 0;
        while !self.system_socket.exists() {
            attempts += 1;
            if attempts >= self.daemon_retries {
                return Err(AudioError::DaemonSocketMissing {
                    path: self.system_socket.clone(),
                    attempts,
                });
            }
            sleep(self.retry_interval).await;
        }

        // The socket file can outlive a crashed daemon; ask it something.
        let query = CommandSpec::new("pactl")
            .arg("-s")
            .arg(format!("unix:{}", self.system_socket.display()))
            .arg("info")
            .timeout(Duration::from_secs(5));
        match self.runner.run(&query).await {
            Ok(out) if out.success() => {
                info!("System audio daemon responsive");
                Ok(())
            }
            Ok(out) => Err(AudioError::Unresponsive(out.failure_reason())),
            Err(e) => Err(AudioError::Unresponsive(e.to_string())),
        }
    }

    /// Undo the bind mount created by this process, if any.
    pub async fn teardown(&self) {
        if !self.mounted_by_us.swap(false, Ordering::SeqCst) {
            return;
        }
        let umount = CommandSpec::new("umount")
            .arg(self.system_dir().to_string_lossy().into_owned())
            .privileged();
        match self.runner.run(&umount).await {
            Ok(out) if out.success() => info!("Unmounted {}", self.system_dir().display()),
            Ok(out) => warn!("umount failed: {}", out.failure_reason()),
            Err(e) => warn!("umount failed: {}", e),
        }
    }

    /// `tmpfiles.d` entry re-creating the socket directory at boot.
    pub fn tmpfiles_entry(&self) -> String {
        format!(
            "# Managed by birdnet-supervisor\nd {} 0755 root root -\n",
            self.system_dir().display()
        )
    }

    /// Add `user` to the daemon's access group when a system daemon could be used.
    ///
    /// Returns true if membership changed.
    pub async fn ensure_group_membership(&self, user: &str) -> Result<bool, AudioError> {
        if !self.daemon_available() {
            return Ok(false);
        }
        let out = self
            .runner
            .run(&CommandSpec::new("id").args(["-nG", user]))
            .await?;
        if out.stdout.split_whitespace().any(|g| g == PULSE_ACCESS_GROUP) {
            return Ok(false);
        }
        let add = CommandSpec::new("usermod")
            .args(["-aG", PULSE_ACCESS_GROUP, user])
            .privileged();
        let out = self.runner.run(&add).await?;
        if !out.success() {
            warn!(
                "Could not add {} to {}: {}",
                user,
                PULSE_ACCESS_GROUP,
                out.failure_reason()
            );
            return Ok(false);
        }
        info!("Added {} to {}", user, PULSE_ACCESS_GROUP);
        Ok(true)
    }
}

/// Arguments for the daemonized system-wide server.
pub fn daemon_args() -> [&'static str; 4] {
    [
        "--system",
        "--daemonize",
        "--disallow-exit",
        "--disallow-module-loading",
    ]
}

/// True if `target` is a mount point according to a mountinfo file.
pub fn is_mount_point(mountinfo: &Path, target: &Path) -> bool {
    match fs::read_to_string(mountinfo) {
        Ok(contents) => mount_points(&contents).iter().any(|p| p == target),
        Err(e) => {
            debug!("Cannot read {}: {}", mountinfo.display(), e);
            false
        }
    }
}

/// Mount points listed in `/proc/<pid>/mountinfo` format (fifth field).
fn mount_points(contents: &str) -> Vec<PathBuf> {
    contents
        .lines()
        .filter_map(|line| line.split_whitespace().nth(4))
        .map(|field| PathBuf::from(unescape_octal(field)))
        .collect()
}

/// Decode the `\040`-style escapes mountinfo uses for spaces and friends.
fn unescape_octal(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let decoded = std::str::from_utf8(&bytes[i + 1..i + 4])
                .ok()
                .and_then(|digits| u8::from_str_radix(digits, 8).ok());
            if let Some(value) = decoded {
                out.push(value);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}
