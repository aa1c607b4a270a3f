use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::info;

/// System-wide config file location.
pub const SYSTEM_CONFIG_PATH: &str = "/etc/birdnet-supervisor/config.toml";

/// Environment variable overriding the config file location.
pub const CONFIG_ENV: &str = "BIRDNET_SUPERVISOR_CONFIG";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to find config directory")]
    NoConfigDir,

    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    SerializeError(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),

    #[error("Refusing {path} under sudo: {reason}")]
    Untrusted { path: PathBuf, reason: String },
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub repo: RepoConfig,

    #[serde(default)]
    pub service: ServiceConfig,

    #[serde(default)]
    pub containers: ContainerConfig,

    #[serde(default)]
    pub audio: AudioConfig,

    /// Signal directory and polling cadence
    #[serde(default)]
    pub signals: SignalConfig,

    /// Audio stream settings passed to the compose project
    #[serde(default)]
    pub stream: StreamConfig,

    #[serde(default)]
    pub install: InstallConfig,

    /// Logging settings
    #[serde(default)]
    pub logging: LoggingConfig,

    /// File this configuration was loaded from, if any
    #[serde(skip)]
    pub source: Option<PathBuf>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RepoConfig {
    /// Clone URL of the application repository
    #[serde(default = "default_repo_url")]
    pub url: String,

    /// Local checkout
    #[serde(default = "default_repo_dir")]
    pub dir: PathBuf,

    #[serde(default = "default_remote")]
    pub remote: String,

    /// Branch used by a fresh install
    #[serde(default = "default_branch")]
    pub default_branch: String,

    /// History depth for fetches; 0 fetches full history
    #[serde(default = "default_fetch_depth")]
    pub fetch_depth: u32,

    /// Wall-clock limit for `git fetch`; 0 disables
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_secs: u64,

    /// Paths whose change means the supervisor itself must be restarted
    #[serde(default = "default_supervisor_paths")]
    pub supervisor_paths: Vec<String>,

    /// Supervisor crate inside the checkout, rebuilt on self-update
    #[serde(default = "default_supervisor_dir")]
    pub supervisor_dir: PathBuf,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ServiceConfig {
    /// systemd unit name (without `.service`)
    #[serde(default = "default_service_name")]
    pub name: String,

    /// Non-root operating user
    #[serde(default = "default_user")]
    pub user: String,

    /// Operating group, defaults to the user's primary group
    #[serde(default)]
    pub group: Option<String>,

    #[serde(default = "default_unit_dir")]
    pub unit_dir: PathBuf,

    #[serde(default = "default_sudoers_path")]
    pub sudoers_path: PathBuf,

    /// Installed supervisor binary, defaults to the running executable
    #[serde(default)]
    pub binary: Option<PathBuf>,

    #[serde(default = "default_restart_sec")]
    pub restart_sec: u32,

    #[serde(default = "default_start_limit_interval")]
    pub start_limit_interval_secs: u32,

    #[serde(default = "default_start_limit_burst")]
    pub start_limit_burst: u32,

    #[serde(default = "default_service_stop_timeout")]
    pub stop_timeout_secs: u32,

    /// Timezone exported to the unit and containers (env `TZ` wins)
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ContainerConfig {
    /// Compose file, relative to the repository checkout
    #[serde(default = "default_compose_file")]
    pub compose_file: PathBuf,

    #[serde(default = "default_project")]
    pub project: String,

    /// Graceful stop timeout before escalating to kill
    #[serde(default = "default_container_stop_timeout")]
    pub stop_timeout_secs: u64,

    /// Wall-clock limit for image builds; 0 disables
    #[serde(default = "default_build_timeout")]
    pub build_timeout_secs: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AudioConfig {
    /// Well-known socket path mounted into the containers
    #[serde(default = "default_system_socket")]
    pub system_socket: PathBuf,

    /// User-session runtime root; the socket lives at `<root>/<uid>/pulse/native`
    #[serde(default = "default_user_runtime_root")]
    pub user_runtime_root: PathBuf,

    /// Deadline for the user-session socket to appear
    #[serde(default = "default_socket_wait")]
    pub socket_wait_secs: u64,

    #[serde(default = "default_daemon_retries")]
    pub daemon_start_retries: u32,

    #[serde(default = "default_daemon_retry_interval")]
    pub daemon_retry_interval_ms: u64,

    #[serde(default = "default_mountinfo")]
    pub mountinfo: PathBuf,

    #[serde(default = "default_tmpfiles_path")]
    pub tmpfiles_path: PathBuf,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SignalConfig {
    #[serde(default = "default_signal_dir")]
    pub dir: PathBuf,

    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StreamConfig {
    /// Stream bitrate (env `STREAM_BITRATE` wins)
    #[serde(default = "default_bitrate")]
    pub bitrate: String,

    /// Stream password (env `ICECAST_PASSWORD` wins); generated when unset
    #[serde(default)]
    pub password: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct InstallConfig {
    /// OS packages installed in one batch
    #[serde(default = "default_packages")]
    pub packages: Vec<String>,

    /// Packages providing the container runtime
    #[serde(default = "default_runtime_packages")]
    pub runtime_packages: Vec<String>,

    #[serde(default = "default_swap_file")]
    pub swap_file: PathBuf,

    #[serde(default = "default_swap_size")]
    pub swap_size_mb: u64,

    /// Hosts with less memory than this get a swap file
    #[serde(default = "default_swap_threshold")]
    pub swap_below_memory_mb: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Directory for the persistent log and crash reports
    #[serde(default = "default_log_dir")]
    pub dir: PathBuf,
}

fn default_repo_url() -> String {
    "https://github.com/birdnet-display/birdnet-display.git".to_string()
}

fn default_repo_dir() -> PathBuf {
    user_home(&default_user())
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("/home/pi"))
        .join("birdnet-display")
}

/// Home directory of the operating user, not of whoever runs the installer.
#[cfg(unix)]
fn user_home(name: &str) -> Option<PathBuf> {
    nix::unistd::User::from_name(name).ok().flatten().map(|u| u.dir)
}

#[cfg(not(unix))]
fn user_home(_name: &str) -> Option<PathBuf> {
    None
}

fn default_remote() -> String {
    "origin".to_string()
}

fn default_branch() -> String {
    "main".to_string()
}

fn default_fetch_depth() -> u32 {
    1
}

fn default_fetch_timeout() -> u64 {
    300
}

fn default_supervisor_paths() -> Vec<String> {
    vec!["supervisor/".to_string()]
}

fn default_supervisor_dir() -> PathBuf {
    PathBuf::from("supervisor")
}

fn default_service_name() -> String {
    "birdnet-supervisor".to_string()
}

fn default_user() -> String {
    std::env::var("SUDO_USER")
        .or_else(|_| std::env::var("USER"))
        .ok()
        .filter(|u| !u.is_empty() && u != "root")
        .unwrap_or_else(|| "pi".to_string())
}

fn default_unit_dir() -> PathBuf {
    PathBuf::from("/etc/systemd/system")
}

fn default_sudoers_path() -> PathBuf {
    PathBuf::from("/etc/sudoers.d/birdnet-supervisor")
}

fn default_restart_sec() -> u32 {
    5
}

fn default_start_limit_interval() -> u32 {
    300
}

fn default_start_limit_burst() -> u32 {
    5
}

fn default_service_stop_timeout() -> u32 {
    90
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_compose_file() -> PathBuf {
    PathBuf::from("docker-compose.yml")
}

fn default_project() -> String {
    "birdnet".to_string()
}

fn default_container_stop_timeout() -> u64 {
    30
}

fn default_build_timeout() -> u64 {
    3600
}

fn default_system_socket() -> PathBuf {
    PathBuf::from("/run/pulse/native")
}

fn default_user_runtime_root() -> PathBuf {
    PathBuf::from("/run/user")
}

fn default_socket_wait() -> u64 {
    60
}

fn default_daemon_retries() -> u32 {
    10
}

fn default_daemon_retry_interval() -> u64 {
    500
}

fn default_mountinfo() -> PathBuf {
    PathBuf::from("/proc/self/mountinfo")
}

fn default_tmpfiles_path() -> PathBuf {
    PathBuf::from("/etc/tmpfiles.d/birdnet-pulse.conf")
}

fn default_signal_dir() -> PathBuf {
    PathBuf::from("/var/lib/birdnet-supervisor/signals")
}

fn default_poll_interval() -> u64 {
    5
}

fn default_bitrate() -> String {
    "128k".to_string()
}

fn default_packages() -> Vec<String> {
    ["git", "ca-certificates", "curl", "alsa-utils", "pulseaudio-utils"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_runtime_packages() -> Vec<String> {
    ["docker.io", "docker-compose"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_swap_file() -> PathBuf {
    PathBuf::from("/swapfile")
}

fn default_swap_size() -> u64 {
    1024
}

fn default_swap_threshold() -> u64 {
    1024
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("/var/log/birdnet-supervisor")
}

impl Default for RepoConfig {
    fn default() -> Self {
        Self {
            url: default_repo_url(),
            dir: default_repo_dir(),
            remote: default_remote(),
            default_branch: default_branch(),
            fetch_depth: default_fetch_depth(),
            fetch_timeout_secs: default_fetch_timeout(),
            supervisor_paths: default_supervisor_paths(),
            supervisor_dir: default_supervisor_dir(),
        }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            user: default_user(),
            group: None,
            unit_dir: default_unit_dir(),
            sudoers_path: default_sudoers_path(),
            binary: None,
            restart_sec: default_restart_sec(),
            start_limit_interval_secs: default_start_limit_interval(),
            start_limit_burst: default_start_limit_burst(),
            stop_timeout_secs: default_service_stop_timeout(),
            timezone: default_timezone(),
        }
    }
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            compose_file: default_compose_file(),
            project: default_project(),
            stop_timeout_secs: default_container_stop_timeout(),
            build_timeout_secs: default_build_timeout(),
        }
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            system_socket: default_system_socket(),
            user_runtime_root: default_user_runtime_root(),
            socket_wait_secs: default_socket_wait(),
            daemon_start_retries: default_daemon_retries(),
            daemon_retry_interval_ms: default_daemon_retry_interval(),
            mountinfo: default_mountinfo(),
            tmpfiles_path: default_tmpfiles_path(),
        }
    }
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            dir: default_signal_dir(),
            poll_interval_secs: default_poll_interval(),
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            bitrate: default_bitrate(),
            password: None,
        }
    }
}

impl Default for InstallConfig {
    fn default() -> Self {
        Self {
            packages: default_packages(),
            runtime_packages: default_runtime_packages(),
            swap_file: default_swap_file(),
            swap_size_mb: default_swap_size(),
            swap_below_memory_mb: default_swap_threshold(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            dir: default_log_dir(),
        }
    }
}

impl ContainerConfig {
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    pub fn build_timeout(&self) -> Duration {
        Duration::from_secs(self.build_timeout_secs)
    }
}

impl RepoConfig {
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }
}

impl SignalConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

impl ServiceConfig {
    pub fn unit_path(&self) -> PathBuf {
        self.unit_dir.join(format!("{}.service", self.name))
    }
}

impl Config {
    /// Per-user config directory, used when no system config exists
    pub fn config_dir() -> Result<PathBuf, ConfigError> {
        ProjectDirs::from("org", "birdnet", "birdnet-supervisor")
            .map(|dirs| dirs.config_dir().to_path_buf())
            .ok_or(ConfigError::NoConfigDir)
    }

    /// Resolve the config file path: env override, then system file, then user file
    pub fn config_path() -> Result<PathBuf, ConfigError> {
        if let Some(path) = std::env::var_os(CONFIG_ENV) {
            return Ok(PathBuf::from(path));
        }
        let system = PathBuf::from(SYSTEM_CONFIG_PATH);
        if system.exists() {
            return Ok(system);
        }
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load config from the resolved path; a missing file yields defaults
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            let contents = fs::read_to_string(path)?;
            let mut config: Config = toml::from_str(&contents)?;
            config.source = Some(path.to_path_buf());
            config
        } else {
            Config::default()
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Apply environment overrides (`TZ`, `STREAM_BITRATE`, `ICECAST_PASSWORD`)
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(tz) = get("TZ") {
            self.service.timezone = tz;
        }
        if let Some(bitrate) = get("STREAM_BITRATE") {
            self.stream.bitrate = bitrate;
        }
        if let Some(password) = get("ICECAST_PASSWORD") {
            self.stream.password = Some(password);
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.service.user.is_empty() || self.service.user == "root" {
            return Err(ConfigError::ValidationError(
                "service.user must name a non-root user".into(),
            ));
        }

        if !self.repo.dir.is_absolute() {
            return Err(ConfigError::ValidationError(
                "repo.dir must be an absolute path".into(),
            ));
        }

        for (name, path) in [
            ("containers.compose_file", &self.containers.compose_file),
            ("repo.supervisor_dir", &self.repo.supervisor_dir),
        ] {
            if path.is_absolute()
                || path
                    .components()
                    .any(|c| matches!(c, std::path::Component::ParentDir))
            {
                return Err(ConfigError::ValidationError(format!(
                    "{} must be relative to the repository",
                    name
                )));
            }
        }

        if self.signals.poll_interval_secs == 0 {
            return Err(ConfigError::ValidationError(
                "signals.poll_interval_secs must be positive".into(),
            ));
        }

        if self.audio.daemon_start_retries == 0 {
            return Err(ConfigError::ValidationError(
                "audio.daemon_start_retries must be positive".into(),
            ));
        }

        if self.service.start_limit_burst == 0 {
            return Err(ConfigError::ValidationError(
                "service.start_limit_burst must be positive".into(),
            ));
        }

        // Values end up in the unit file and the compose env file
        let single_line = [
            ("service.timezone", self.service.timezone.as_str()),
            ("stream.bitrate", self.stream.bitrate.as_str()),
            (
                "stream.password",
                self.stream.password.as_deref().unwrap_or(""),
            ),
        ];
        for (name, value) in single_line {
            if value.contains(['\n', '\r', '"']) {
                return Err(ConfigError::ValidationError(format!(
                    "{} contains invalid characters",
                    name
                )));
            }
        }

        if self.repo.default_branch.is_empty() || self.repo.default_branch.starts_with('-') {
            return Err(ConfigError::ValidationError(
                "repo.default_branch is not a valid branch name".into(),
            ));
        }

        Ok(())
    }

    /// Save config to the given path
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;

        info!("Config saved to: {}", path.display());
        Ok(())
    }

    /// Absolute compose file path
    pub fn compose_path(&self) -> PathBuf {
        self.repo.dir.join(&self.containers.compose_file)
    }

    /// Supervisor binary the unit and privilege rules point at
    pub fn supervisor_binary(&self) -> PathBuf {
        self.service
            .binary
            .clone()
            .or_else(|| std::env::current_exe().ok())
            .unwrap_or_else(|| PathBuf::from("/usr/bin/birdnet-supervisor"))
    }

    /// Supervisor executable produced by a release build of the checkout
    pub fn supervisor_artifact(&self) -> PathBuf {
        self.repo
            .dir
            .join(&self.repo.supervisor_dir)
            .join("target/release/birdnet-supervisor")
    }

    /// Persistent log file
    pub fn log_file(&self) -> PathBuf {
        self.logging.dir.join("supervisor.log")
    }
}

/// True when this process is root acting for another user through sudo.
pub fn elevated_by_sudo() -> bool {
    crate::exec::is_root() && std::env::var_os("SUDO_UID").is_some()
}

/// Refuse a config file that anyone but root could have written.
///
/// The file (when present) and the closest existing ancestor directory
/// must be owned by root and not group or world writable.
pub fn ensure_root_owned(path: &Path) -> Result<(), ConfigError> {
    if path.exists() {
        check_root_owned(path)?;
    }
    let mut dir = path.parent();
    while let Some(d) = dir {
        if d.exists() {
            return check_root_owned(d);
        }
        dir = d.parent();
    }
    Ok(())
}

#[cfg(unix)]
fn check_root_owned(path: &Path) -> Result<(), ConfigError> {
    use std::os::unix::fs::MetadataExt;
    let meta = fs::metadata(path)?;
    let reason = if meta.uid() != 0 {
        Some(format!("{} is owned by uid {}", path.display(), meta.uid()))
    } else if meta.mode() & 0o022 != 0 {
        Some(format!("{} is writable by non-root users", path.display()))
    } else {
        None
    };
    match reason {
        Some(reason) => Err(ConfigError::Untrusted {
            path: path.to_path_buf(),
            reason,
        }),
        None => Ok(()),
    }
}

#[cfg(not(unix))]
fn check_root_owned(_path: &Path) -> Result<(), ConfigError> {
    Ok(())
}

/// Show current configuration
pub fn show(path: Option<&Path>) -> anyhow::Result<()> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => Config::config_path()?,
    };
    let config = Config::load_from(&path)?;

    println!("Config file: {}\n", path.display());
    println!("{}", toml::to_string_pretty(&config)?);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.repo.remote, "origin");
        assert_eq!(config.repo.default_branch, "main");
        assert_eq!(config.repo.fetch_depth, 1);
        assert_eq!(config.signals.poll_interval_secs, 5);
        assert_eq!(config.service.restart_sec, 5);
        assert_eq!(config.audio.system_socket, PathBuf::from("/run/pulse/native"));
        assert_eq!(config.containers.project, "birdnet");
        assert!(config.stream.password.is_none());
    }

    #[test]
    fn test_default_validates() {
        let mut config = Config::default();
        config.service.user = "pi".into();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_root_user() {
        let mut config = Config::default();
        config.service.user = "root".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_compose_traversal() {
        let mut config = Config::default();
        config.service.user = "pi".into();
        config.containers.compose_file = PathBuf::from("../elsewhere/compose.yml");
        assert!(config.validate().is_err());
        config.containers.compose_file = PathBuf::from("/abs/compose.yml");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_newline_in_env_values() {
        let mut config = Config::default();
        config.service.user = "pi".into();
        config.stream.password = Some("abc\nINJECT=1".into());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_zero_poll_interval() {
        let mut config = Config::default();
        config.service.user = "pi".into();
        config.signals.poll_interval_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config.apply_env(|key| match key {
            "TZ" => Some("Europe/Berlin".to_string()),
            "STREAM_BITRATE" => Some("320k".to_string()),
            "ICECAST_PASSWORD" => Some("".to_string()),
            _ => None,
        });
        assert_eq!(config.service.timezone, "Europe/Berlin");
        assert_eq!(config.stream.bitrate, "320k");
        // Empty values do not override
        assert!(config.stream.password.is_none());
    }

    #[test]
    fn test_parse_partial_toml() {
        let toml = r#"
            [repo]
            dir = "/srv/birdnet"
            default_branch = "develop"

            [service]
            user = "birder"
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.repo.dir, PathBuf::from("/srv/birdnet"));
        assert_eq!(config.repo.default_branch, "develop");
        assert_eq!(config.repo.remote, "origin");
        assert_eq!(config.service.user, "birder");
        assert_eq!(config.containers.stop_timeout_secs, 30);
    }

    #[test]
    fn test_save_and_load_from() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/config.toml");
        let mut config = Config::default();
        config.service.user = "birder".into();
        config.repo.dir = PathBuf::from("/srv/birdnet");
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.service.user, "birder");
        assert_eq!(loaded.repo.dir, PathBuf::from("/srv/birdnet"));
    }

    #[test]
    fn test_validate_rejects_supervisor_dir_traversal() {
        let mut config = Config::default();
        config.service.user = "pi".into();
        config.repo.supervisor_dir = PathBuf::from("../../tmp/evil");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_supervisor_artifact() {
        let mut config = Config::default();
        config.repo.dir = PathBuf::from("/home/pi/birdnet-display");
        assert_eq!(
            config.supervisor_artifact(),
            PathBuf::from("/home/pi/birdnet-display/supervisor/target/release/birdnet-supervisor")
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_untrusted_config_writable_by_others() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[service]\nbinary = \"/tmp/evil\"\n").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o666)).unwrap();
        assert!(matches!(
            ensure_root_owned(&path),
            Err(ConfigError::Untrusted { .. })
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_untrusted_config_in_writable_dir() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        fs::set_permissions(dir.path(), fs::Permissions::from_mode(0o777)).unwrap();
        // Absent file: the directory decides, since anyone could create it.
        let path = dir.path().join("config.toml");
        assert!(matches!(
            ensure_root_owned(&path),
            Err(ConfigError::Untrusted { .. })
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_config_owner_must_be_root() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        fs::set_permissions(dir.path(), fs::Permissions::from_mode(0o755)).unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();
        assert_eq!(ensure_root_owned(&path).is_ok(), crate::exec::is_root());
    }

    #[test]
    fn test_unit_path() {
        let config = ServiceConfig {
            name: "birdnet-supervisor".into(),
            ..Default::default()
        };
        assert_eq!(
            config.unit_path(),
            PathBuf::from("/etc/systemd/system/birdnet-supervisor.service")
        );
    }
}
