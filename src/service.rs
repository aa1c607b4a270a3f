//! Persistent host configuration: the systemd unit, the sudoers rules and
//! the environment file consumed by the compose project.
//!
//! Everything here is idempotent. Files are only rewritten when their
//! rendered content differs from what is on disk, so re-running after an
//! update without configuration changes touches nothing.

use crate::audio::{daemon_args, AudioBackend, AudioError};
use crate::config::Config;
use crate::exec::{is_root, lookup_binary, CommandRunner, CommandSpec, ExecError};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

/// Environment file written next to the compose file.
pub const ENV_FILE: &str = ".env";

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Unknown user '{0}'")]
    UnknownUser(String),

    #[error("Unknown group '{0}'")]
    UnknownGroup(String),

    #[error("Failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Privilege rules rejected by visudo: {0}")]
    InvalidSudoers(String),

    #[error("{action} failed: {reason}")]
    Command { action: String, reason: String },

    #[error("Audio configuration failed: {0}")]
    Audio(#[from] AudioError),

    #[error(transparent)]
    Exec(#[from] ExecError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// The non-root account that owns the checkout and runs the supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperatingUser {
    pub name: String,
    pub group: String,
    pub uid: u32,
    pub gid: u32,
    pub home: PathBuf,
}

impl OperatingUser {
    /// Look the configured user and group up in the system databases.
    #[cfg(unix)]
    pub fn resolve(name: &str, group: Option<&str>) -> Result<Self, ServiceError> {
        use nix::unistd::{Group, User};

        let user = User::from_name(name)
            .ok()
            .flatten()
            .ok_or_else(|| ServiceError::UnknownUser(name.to_string()))?;
        let group = match group {
            Some(g) => Group::from_name(g)
                .ok()
                .flatten()
                .ok_or_else(|| ServiceError::UnknownGroup(g.to_string()))?,
            None => Group::from_gid(user.gid)
                .ok()
                .flatten()
                .ok_or_else(|| ServiceError::UnknownGroup(user.gid.to_string()))?,
        };
        Ok(Self {
            name: user.name,
            group: group.name,
            uid: user.uid.as_raw(),
            gid: group.gid.as_raw(),
            home: user.dir,
        })
    }

    #[cfg(not(unix))]
    pub fn resolve(name: &str, _group: Option<&str>) -> Result<Self, ServiceError> {
        Err(ServiceError::UnknownUser(name.to_string()))
    }
}

/// Render the systemd unit for the supervisor loop.
pub fn render_unit(config: &Config, user: &OperatingUser, binary: &Path) -> String {
    let svc = &config.service;
    let mut exec = format!("{}", binary.display());
    if let Some(ref source) = config.source {
        exec.push_str(&format!(" --config {}", source.display()));
    }
    exec.push_str(" run");

    format!(
        r#"# Managed by birdnet-supervisor; local edits are overwritten.
[Unit]
Description=BirdNET display service supervisor
After=network-online.target docker.service sound.target
Wants=network-online.target
Requires=docker.service
StartLimitIntervalSec={interval}
StartLimitBurst={burst}

[Service]
Type=simple
User={user}
Group={group}
WorkingDirectory={workdir}
Environment=TZ={tz}
ExecStart={exec}
Restart=always
RestartSec={restart_sec}
TimeoutStopSec={stop}

[Install]
WantedBy=multi-user.target
"#,
        interval = svc.start_limit_interval_secs,
        burst = svc.start_limit_burst,
        user = user.name,
        group = user.group,
        workdir = config.repo.dir.display(),
        tz = svc.timezone,
        exec = exec,
        restart_sec = svc.restart_sec,
        stop = svc.stop_timeout_secs,
    )
}

/// Absolute path of a tool for the sudoers rules.
fn tool(name: &str) -> String {
    lookup_binary(name)
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| format!("/usr/bin/{}", name))
}

/// Render the sudoers rules: exact commands only, never a blanket grant
/// and never a wildcard argument.
pub fn render_sudoers<F>(config: &Config, user: &OperatingUser, binary: &Path, tool: F) -> String
where
    F: Fn(&str) -> String,
{
    let system_dir = config
        .audio
        .system_socket
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("/run/pulse"));
    let user_dir = config
        .audio
        .user_runtime_root
        .join(user.uid.to_string())
        .join("pulse");
    let bin = binary.display();
    let unit = format!("{}.service", config.service.name);

    let audio = format!(
        "{} {}, {} -x pulseaudio",
        tool("pulseaudio"),
        daemon_args().join(" "),
        tool("pkill")
    );
    let mount = format!(
        "{mount} --bind {src} {dst}, {umount} {dst}, {install} -d -m 0755 {dst}",
        mount = tool("mount"),
        umount = tool("umount"),
        install = tool("install"),
        src = user_dir.display(),
        dst = system_dir.display(),
    );
    let swap = format!(
        "{} {}",
        tool("swapon"),
        config.install.swap_file.display()
    );
    let invoke = match config.source {
        Some(ref source) => format!("{} --config {}", bin, source.display()),
        None => bin.to_string(),
    };
    // The branch travels through the update request file, not argv.
    let update = format!("{cmd} reconfigure, {cmd} install --update", cmd = invoke);
    let staged = format!("{}.new", bin);
    let self_install = format!(
        "{install} -m 0755 {artifact} {staged}, {mv} -f {staged} {bin}",
        install = tool("install"),
        mv = tool("mv"),
        artifact = config.supervisor_artifact().display(),
        staged = staged,
        bin = bin,
    );
    let service = format!(
        "{systemctl} restart {unit}, {systemctl} daemon-reload",
        systemctl = tool("systemctl"),
        unit = unit
    );

    format!(
        "# Managed by birdnet-supervisor; local edits are overwritten.\n\
         Cmnd_Alias BIRDNET_AUDIO = {audio}\n\
         Cmnd_Alias BIRDNET_MOUNT = {mount}\n\
         Cmnd_Alias BIRDNET_SWAP = {swap}\n\
         Cmnd_Alias BIRDNET_UPDATE = {update}\n\
         Cmnd_Alias BIRDNET_SELF = {self_install}\n\
         Cmnd_Alias BIRDNET_SERVICE = {service}\n\
         {user} ALL=(root) NOPASSWD: BIRDNET_AUDIO, BIRDNET_MOUNT, BIRDNET_SWAP, BIRDNET_UPDATE, BIRDNET_SELF, BIRDNET_SERVICE\n",
        audio = audio,
        mount = mount,
        swap = swap,
        update = update,
        self_install = self_install,
        service = service,
        user = user.name,
    )
}

/// Parse `KEY=VALUE` lines of an env file, ignoring comments.
pub fn parse_env(contents: &str) -> BTreeMap<String, String> {
    contents
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .filter_map(|l| l.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect()
}

/// Render the compose environment file.
///
/// The stream password is taken from config, else kept from the existing
/// file, else generated once.
pub fn render_env(config: &Config, user: &OperatingUser, existing: Option<&str>) -> String {
    let previous = existing.map(parse_env).unwrap_or_default();
    let password = config
        .stream
        .password
        .clone()
        .or_else(|| previous.get("ICECAST_PASSWORD").cloned())
        .filter(|p| !p.is_empty())
        .unwrap_or_else(generate_password);

    format!(
        "# Managed by birdnet-supervisor; local edits are overwritten.\n\
         TZ={tz}\n\
         STREAM_BITRATE={bitrate}\n\
         ICECAST_PASSWORD={password}\n\
         PULSE_SERVER=unix:{socket}\n\
         PUID={uid}\n\
         PGID={gid}\n",
        tz = config.service.timezone,
        bitrate = config.stream.bitrate,
        password = password,
        socket = config.audio.system_socket.display(),
        uid = user.uid,
        gid = user.gid,
    )
}

fn generate_password() -> String {
    let mut bytes = [0u8; 12];
    let from_urandom = fs::File::open("/dev/urandom")
        .and_then(|mut f| std::io::Read::read_exact(&mut f, &mut bytes))
        .is_ok();
    if !from_urandom {
        let seed = chrono::Utc::now()
            .timestamp_nanos_opt()
            .unwrap_or_default()
            .to_le_bytes();
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = seed[i % seed.len()] ^ (std::process::id() as u8).wrapping_add(i as u8);
        }
    }
    hex::encode(bytes)
}

/// Outcome of one reconfiguration pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconfigureReport {
    pub env_changed: bool,
    pub unit_changed: bool,
    pub sudoers_changed: bool,
    pub audio_changed: bool,
}

impl ReconfigureReport {
    pub fn changed(&self) -> bool {
        self.env_changed || self.unit_changed || self.sudoers_changed || self.audio_changed
    }
}

/// Applies the persistent host configuration.
pub struct HostConfigurator {
    runner: Arc<dyn CommandRunner>,
    config: Config,
    user: OperatingUser,
    binary: PathBuf,
}

impl HostConfigurator {
    pub fn new(runner: Arc<dyn CommandRunner>, config: &Config, user: &OperatingUser) -> Self {
        Self {
            runner,
            config: config.clone(),
            user: user.clone(),
            binary: config.supervisor_binary(),
        }
    }

    pub fn with_binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.binary = binary.into();
        self
    }

    /// True when this process may write the root-owned targets itself.
    pub fn can_write_system_files(&self) -> bool {
        is_root()
            || [
                self.config.service.unit_dir.as_path(),
                self.config.service.sudoers_path.parent().unwrap_or(Path::new("/")),
                self.config.audio.tmpfiles_path.parent().unwrap_or(Path::new("/")),
            ]
            .iter()
            .all(|dir| dir_writable(dir))
    }

    /// Re-materialize everything, delegating to a privileged copy of the
    /// supervisor when the system files are out of reach.
    pub async fn apply(&self, audio: &AudioBackend) -> Result<ReconfigureReport, ServiceError> {
        let mut report = ReconfigureReport {
            env_changed: self.write_env()?,
            ..Default::default()
        };

        if self.can_write_system_files() {
            let system = self.apply_system(audio).await?;
            report.unit_changed = system.unit_changed;
            report.sudoers_changed = system.sudoers_changed;
            report.audio_changed = system.audio_changed;
        } else {
            let mut spec = CommandSpec::new(self.binary.to_string_lossy().into_owned());
            if let Some(ref source) = self.config.source {
                spec = spec.arg("--config").arg(source.to_string_lossy().into_owned());
            }
            let spec = spec.arg("reconfigure").privileged();
            let out = self.runner.run(&spec).await?;
            if !out.success() {
                return Err(ServiceError::Command {
                    action: "privileged reconfigure".into(),
                    reason: out.failure_reason(),
                });
            }
            // The privileged pass reports nothing back; assume it did its job.
            debug!("Privileged reconfigure finished");
        }
        Ok(report)
    }

    /// Root-owned part of the configuration: audio, unit, sudoers.
    pub async fn apply_system(&self, audio: &AudioBackend) -> Result<ReconfigureReport, ServiceError> {
        let mut report = ReconfigureReport::default();

        report.audio_changed = write_if_changed(
            &self.config.audio.tmpfiles_path,
            &audio.tmpfiles_entry(),
            0o644,
        )?;
        if audio.ensure_group_membership(&self.user.name).await? {
            report.audio_changed = true;
        }

        let unit = render_unit(&self.config, &self.user, &self.binary);
        report.unit_changed = write_if_changed(&self.config.service.unit_path(), &unit, 0o644)?;
        if report.unit_changed {
            self.systemctl(&["daemon-reload"]).await?;
            self.systemctl(&["enable", &format!("{}.service", self.config.service.name)])
                .await?;
        }

        let rules = render_sudoers(&self.config, &self.user, &self.binary, tool);
        report.sudoers_changed = self.install_sudoers(&rules).await?;

        if report.changed() {
            info!(
                "Host configuration updated (unit: {}, sudoers: {}, audio: {})",
                report.unit_changed, report.sudoers_changed, report.audio_changed
            );
        }
        Ok(report)
    }

    /// Write the compose `.env` file into the checkout.
    pub fn write_env(&self) -> Result<bool, ServiceError> {
        let path = self.config.repo.dir.join(ENV_FILE);
        let existing = fs::read_to_string(&path).ok();
        let contents = render_env(&self.config, &self.user, existing.as_deref());
        write_if_changed(&path, &contents, 0o600)
    }

    async fn install_sudoers(&self, rules: &str) -> Result<bool, ServiceError> {
        let dest = &self.config.service.sudoers_path;
        if fs::read_to_string(dest).ok().as_deref() == Some(rules) {
            return Ok(false);
        }
        let dir = dest.parent().unwrap_or(Path::new("/"));
        // sudo ignores files containing a dot, so the staging file is inert.
        let staging = dir.join(".birdnet-supervisor.staging");
        write_file(&staging, rules, 0o440)?;

        let check = CommandSpec::new("visudo")
            .arg("-cf")
            .arg(staging.to_string_lossy().into_owned());
        let out = self.runner.run(&check).await?;
        if !out.success() {
            let _ = fs::remove_file(&staging);
            return Err(ServiceError::InvalidSudoers(out.failure_reason()));
        }
        fs::rename(&staging, dest).map_err(|source| ServiceError::Write {
            path: dest.clone(),
            source,
        })?;
        info!("Privilege rules installed: {}", dest.display());
        Ok(true)
    }

    async fn systemctl(&self, args: &[&str]) -> Result<(), ServiceError> {
        let spec = CommandSpec::new("systemctl")
            .args(args.iter().copied())
            .privileged();
        let out = self.runner.run(&spec).await?;
        if !out.success() {
            return Err(ServiceError::Command {
                action: format!("systemctl {}", args.join(" ")),
                reason: out.failure_reason(),
            });
        }
        Ok(())
    }

    /// Restart the supervisor unit so it runs freshly updated code.
    pub async fn restart_unit(&self) -> Result<(), ServiceError> {
        self.systemctl(&["restart", &format!("{}.service", self.config.service.name)])
            .await
    }
}

/// Write `contents` to `path` unless it already holds exactly that.
///
/// Returns true if the file was (re)written.
pub fn write_if_changed(path: &Path, contents: &str, mode: u32) -> Result<bool, ServiceError> {
    if fs::read_to_string(path).ok().as_deref() == Some(contents) {
        debug!("{} unchanged", path.display());
        return Ok(false);
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| ServiceError::Write {
            path: path.to_path_buf(),
            source,
        })?;
    }
    let tmp = path.with_extension("birdnet-tmp");
    write_file(&tmp, contents, mode)?;
    fs::rename(&tmp, path).map_err(|source| ServiceError::Write {
        path: path.to_path_buf(),
        source,
    })?;
    info!("Wrote {}", path.display());
    Ok(true)
}

fn write_file(path: &Path, contents: &str, mode: u32) -> Result<(), ServiceError> {
    let err = |source: std::io::Error| ServiceError::Write {
        path: path.to_path_buf(),
        source,
    };
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(mode);
    }
    let mut file = options.open(path).map_err(err)?;
    file.write_all(contents.as_bytes()).map_err(err)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(fs::Permissions::from_mode(mode))
            .map_err(err)?;
    }
    file.sync_all().map_err(err)?;
    Ok(())
}

fn dir_writable(dir: &Path) -> bool {
    #[cfg(unix)]
    {
        nix::unistd::access(dir, nix::unistd::AccessFlags::W_OK).is_ok()
    }
    #[cfg(not(unix))]
    {
        dir.metadata().map(|m| !m.permissions().readonly()).unwrap_or(false)
    }
}
