//! External command execution.
//!
//! Every program the supervisor drives (git, docker, systemctl, mount,
//! pactl, apt-get, ...) goes through [`CommandRunner`]. A non-zero exit is
//! returned as a normal [`CommandOutput`]; only spawn failures and timeouts
//! are [`ExecError`]s, so each caller decides what a failure means for it.

use async_trait::async_trait;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Grace the inner `timeout` gives a command between TERM and KILL.
const INNER_KILL_AFTER: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum ExecError {
    #[error("Failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("'{command}' timed out after {timeout:?}")]
    TimedOut { command: String, timeout: Duration },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Description of one external command invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    /// Numeric identity to run as (requires the caller to be allowed to switch).
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    /// Run through `sudo -n` unless we already are root.
    pub privileged: bool,
    pub timeout: Option<Duration>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.cwd = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn identity(mut self, uid: u32, gid: u32) -> Self {
        self.uid = Some(uid);
        self.gid = Some(gid);
        self
    }

    pub fn privileged(mut self) -> Self {
        self.privileged = true;
        self
    }

    /// Bound the command by a wall-clock limit. A zero duration means no limit.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = if timeout.is_zero() {
            None
        } else {
            Some(timeout)
        };
        self
    }

    /// Program and arguments as they will be executed by a process with
    /// effective uid `euid`.
    ///
    /// A foreign identity goes through `sudo -u` rather than a bare
    /// setuid so the target user keeps its supplementary groups (docker).
    /// sudo does not relay SIGKILL, so a bounded command also gets an
    /// inner `timeout` running as the target user.
    fn argv(&self, euid: u32) -> (String, Vec<String>) {
        if let (Some(uid), Some(gid)) = (self.uid, self.gid) {
            if uid != euid {
                let mut args = vec![
                    "-n".to_string(),
                    "-H".to_string(),
                    "-u".to_string(),
                    format!("#{}", uid),
                    "-g".to_string(),
                    format!("#{}", gid),
                    "--".to_string(),
                ];
                if let Some(limit) = self.timeout {
                    args.push("timeout".to_string());
                    args.push(format!("--kill-after={}", INNER_KILL_AFTER.as_secs()));
                    args.push(limit.as_secs().max(1).to_string());
                }
                args.push(self.program.clone());
                args.extend(self.args.iter().cloned());
                return ("sudo".to_string(), args);
            }
        }
        if self.privileged && euid != 0 {
            let mut args = vec!["-n".to_string(), self.program.clone()];
            args.extend(self.args.iter().cloned());
            ("sudo".to_string(), args)
        } else {
            (self.program.clone(), self.args.clone())
        }
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.privileged {
            write!(f, "sudo -n ")?;
        }
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Captured result of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` when terminated by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    pub fn stdout_trimmed(&self) -> &str {
        self.stdout.trim()
    }

    /// Short human-readable reason for a failed command.
    pub fn failure_reason(&self) -> String {
        let detail = self
            .stderr
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .unwrap_or("")
            .trim();
        let status = match self.code {
            Some(code) => format!("exit status {}", code),
            None => "terminated by signal".to_string(),
        };
        if detail.is_empty() {
            status
        } else {
            format!("{}: {}", status, detail)
        }
    }
}

/// Seam between the supervisor logic and the host's processes.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, ExecError>;
}

/// Runs commands on the local host with `tokio::process`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl SystemRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, ExecError> {
        let (program, args) = spec.argv(effective_uid());
        debug!("exec: {}", spec);

        let mut cmd = tokio::process::Command::new(&program);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own process group, so a timeout reaches the whole tree.
        #[cfg(unix)]
        cmd.process_group(0);
        if let Some(ref dir) = spec.cwd {
            cmd.current_dir(dir);
        }
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }

        let child = cmd.spawn().map_err(|source| ExecError::Spawn {
            command: spec.to_string(),
            source,
        })?;
        let pid = child.id();

        let output = match spec.timeout {
            Some(limit) => match tokio::time::timeout(limit, child.wait_with_output()).await {
                Ok(result) => result?,
                Err(_) => {
                    // Dropping the future kills the child; the rest of its
                    // group is killed here.
                    if let Some(pid) = pid {
                        kill_process_group(pid);
                    }
                    warn!("'{}' exceeded {:?}, killed", spec, limit);
                    return Err(ExecError::TimedOut {
                        command: spec.to_string(),
                        timeout: limit,
                    });
                }
            },
            None => child.wait_with_output().await?,
        };

        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

#[cfg(unix)]
fn kill_process_group(pgid: u32) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;
    match killpg(Pid::from_raw(pgid as i32), Signal::SIGKILL) {
        Ok(()) | Err(nix::errno::Errno::ESRCH) => {}
        Err(e) => warn!("Could not kill process group {}: {}", pgid, e),
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pgid: u32) {}

/// Effective uid of the current process.
pub fn effective_uid() -> u32 {
    #[cfg(unix)]
    {
        nix::unistd::geteuid().as_raw()
    }
    #[cfg(not(unix))]
    {
        u32::MAX
    }
}

/// True when the current process runs with effective uid 0.
pub fn is_root() -> bool {
    effective_uid() == 0
}

/// Locate an executable on `PATH`.
pub fn lookup_binary(binary: &str) -> Option<PathBuf> {
    which::which(binary).ok()
}

/// True if `path` is a regular file with any execute bit set.
pub fn is_executable(path: &Path) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::metadata(path)
            .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
            .unwrap_or(false)
    }
    #[cfg(not(unix))]
    {
        path.is_file()
    }
}

/// Scripted runner for unit tests.
#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use std::sync::Mutex;

    type SideEffect = Box<dyn Fn(&CommandSpec) + Send + Sync>;

    struct Rule {
        pattern: String,
        response: Result<CommandOutput, String>,
        remaining: Option<usize>,
        effect: Option<SideEffect>,
    }

    /// Answers commands by the first rule whose pattern is a substring of
    /// the rendered command line; unmatched commands succeed with no output.
    #[derive(Default)]
    pub struct FakeRunner {
        rules: Mutex<Vec<Rule>>,
        calls: Mutex<Vec<String>>,
    }

    impl FakeRunner {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn on(&self, pattern: &str, output: CommandOutput) -> &Self {
            self.push(pattern, Ok(output), None, None)
        }

        pub fn once(&self, pattern: &str, output: CommandOutput) -> &Self {
            self.push(pattern, Ok(output), Some(1), None)
        }

        pub fn time_out(&self, pattern: &str) -> &Self {
            self.push(pattern, Err(pattern.to_string()), None, None)
        }

        pub fn on_with<F>(&self, pattern: &str, output: CommandOutput, effect: F) -> &Self
        where
            F: Fn(&CommandSpec) + Send + Sync + 'static,
        {
            self.push(pattern, Ok(output), None, Some(Box::new(effect)))
        }

        fn push(
            &self,
            pattern: &str,
            response: Result<CommandOutput, String>,
            remaining: Option<usize>,
            effect: Option<SideEffect>,
        ) -> &Self {
            self.rules.lock().unwrap().push(Rule {
                pattern: pattern.to_string(),
                response,
                remaining,
                effect,
            });
            self
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        pub fn called(&self, pattern: &str) -> bool {
            self.calls().iter().any(|c| c.contains(pattern))
        }

        pub fn count(&self, pattern: &str) -> usize {
            self.calls().iter().filter(|c| c.contains(pattern)).count()
        }

        /// Position of the first call matching `pattern`.
        pub fn position(&self, pattern: &str) -> Option<usize> {
            self.calls().iter().position(|c| c.contains(pattern))
        }
    }

    #[async_trait]
    impl CommandRunner for FakeRunner {
        async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, ExecError> {
            let line = spec.to_string();
            self.calls.lock().unwrap().push(line.clone());

            let mut rules = self.rules.lock().unwrap();
            let found = rules.iter_mut().find(|r| {
                line.contains(&r.pattern) && r.remaining.map(|n| n > 0).unwrap_or(true)
            });
            let Some(rule) = found else {
                return Ok(CommandOutput::ok(""));
            };
            if let Some(ref mut n) = rule.remaining {
                *n -= 1;
            }
            if let Some(ref effect) = rule.effect {
                effect(spec);
            }
            match &rule.response {
                Ok(output) => Ok(output.clone()),
                Err(_) => Err(ExecError::TimedOut {
                    command: line,
                    timeout: Duration::from_secs(1),
                }),
            }
        }
    }
}
