use anyhow::{bail, Context};
use birdnet_supervisor::audio::AudioBackend;
use birdnet_supervisor::config::{self, Config, LoggingConfig};
use birdnet_supervisor::exec::{effective_uid, is_root, SystemRunner};
use birdnet_supervisor::installer::{InstallOptions, InstallOutcome, Installer, STAGE_ENV};
use birdnet_supervisor::panic_handler;
use birdnet_supervisor::service::{HostConfigurator, OperatingUser};
use birdnet_supervisor::signal::{SignalBus, SignalKind};
use birdnet_supervisor::supervisor::{Exit, StatusReport, Supervisor};
use birdnet_supervisor::update::EXIT_FOR_RESTART;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "birdnet-supervisor")]
#[command(author, version, about = "Service supervisor for the BirdNET display appliance", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file (default: $BIRDNET_SUPERVISOR_CONFIG or /etc/birdnet-supervisor/config.toml)
    #[arg(short, long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the supervisor loop (what the service unit starts)
    Run,

    /// Install or update the appliance on this host
    Install {
        /// Update the existing checkout instead of installing
        #[arg(long)]
        update: bool,

        /// Branch to install or update to
        #[arg(long, value_name = "NAME")]
        branch: Option<String>,

        /// Do not reboot when the install changed something
        #[arg(long)]
        no_reboot: bool,

        /// Do not build container images
        #[arg(long)]
        skip_build: bool,
    },

    /// Rewrite root-owned host configuration (used through sudo)
    #[command(hide = true)]
    Reconfigure,

    /// Ask the running supervisor to restart or update
    Signal {
        #[arg(value_enum)]
        kind: SignalArg,

        /// Branch to update to (default: current branch)
        #[arg(long, value_name = "NAME")]
        branch: Option<String>,
    },

    /// Show supervisor, audio and update status
    Status,

    /// Inspect configuration
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,

        /// Write the default configuration if no file exists yet
        #[arg(long)]
        init: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum SignalArg {
    Restart,
    Update,
}

impl From<SignalArg> for SignalKind {
    fn from(arg: SignalArg) -> Self {
        match arg {
            SignalArg::Restart => SignalKind::Restart,
            SignalArg::Update => SignalKind::Update,
        }
    }
}

/// Set up stderr logging, plus the persistent log file when `file` is set.
///
/// The returned guard flushes the file writer on drop.
fn init_logging(verbose: bool, logging: &LoggingConfig, file: bool) -> Option<WorkerGuard> {
    let default = if verbose {
        "birdnet_supervisor=debug".to_string()
    } else {
        format!("birdnet_supervisor={}", logging.level)
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let appender = if file {
        std::fs::create_dir_all(&logging.dir)
            .map_err(|e| e.to_string())
            .and_then(|_| {
                RollingFileAppender::builder()
                    .rotation(Rotation::NEVER)
                    .filename_prefix("supervisor.log")
                    .build(&logging.dir)
                    .map_err(|e| e.to_string())
            })
            .map_err(|e| eprintln!("Persistent log unavailable in {}: {}", logging.dir.display(), e))
            .ok()
    } else {
        None
    };

    let (file_layer, guard) = match appender {
        Some(appender) => {
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();
    guard
}

fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => Config::config_path()?,
    };
    // Root acting for the operating user only reads what root wrote.
    if config::elevated_by_sudo() {
        config::ensure_root_owned(&path)?;
    }
    Config::load_from(&path).with_context(|| format!("Failed to load {}", path.display()))
}

fn operating_user(config: &Config) -> anyhow::Result<OperatingUser> {
    Ok(OperatingUser::resolve(
        &config.service.user,
        config.service.group.as_deref(),
    )?)
}

/// Hand over to stage 2 running from inside the fresh checkout.
async fn reexec_in(repo_dir: &Path) -> anyhow::Result<i32> {
    let exe = std::env::current_exe().context("Cannot locate own executable")?;
    info!("Continuing install from {}", repo_dir.display());
    let status = tokio::process::Command::new(exe)
        .args(std::env::args_os().skip(1))
        .current_dir(repo_dir)
        .env(STAGE_ENV, "2")
        .status()
        .await
        .context("Failed to re-execute installer")?;
    Ok(status.code().unwrap_or(1))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run => {
            let config = load_config(cli.config.as_deref())?;
            panic_handler::install(&config.logging.dir);
            let guard = init_logging(cli.verbose, &config.logging, true);
            info!("Starting birdnet-supervisor {}", env!("CARGO_PKG_VERSION"));

            let user = operating_user(&config)?;
            let supervisor = Supervisor::new(Arc::new(SystemRunner::new()), &config, &user);
            if supervisor.run().await? == Exit::RestartRequested {
                drop(guard);
                std::process::exit(EXIT_FOR_RESTART);
            }
        }

        Commands::Install {
            update,
            branch,
            no_reboot,
            skip_build,
        } => {
            let config = load_config(cli.config.as_deref())?;
            panic_handler::install(&config.logging.dir);
            let _guard = init_logging(cli.verbose, &config.logging, true);
            let log_file = config.log_file();

            let user = operating_user(&config)?;
            let runner = Arc::new(SystemRunner::new());
            let audio = Arc::new(AudioBackend::new(runner.clone(), &config.audio, user.uid));
            let options = InstallOptions {
                update,
                branch,
                no_reboot,
                skip_build,
            };
            let outcome = Installer::new(runner, &config, &user, audio)
                .install(&options)
                .await
                .with_context(|| format!("Install failed, see {}", log_file.display()))?;

            match outcome {
                InstallOutcome::Bootstrapped { repo_dir } => {
                    let code = reexec_in(&repo_dir).await?;
                    if code != 0 {
                        std::process::exit(code);
                    }
                }
                InstallOutcome::Installed(report) => {
                    for check in &report.checks {
                        println!("  [ok] {}", check.name);
                    }
                    if report.reboot_scheduled {
                        println!("Install complete, rebooting.");
                    } else if report.changed() {
                        println!("Install complete. Reboot to finish setup.");
                    } else {
                        println!("Already installed, nothing changed.");
                    }
                }
                InstallOutcome::Requested { pid, branch } => {
                    println!(
                        "Supervisor running (PID: {}), update of '{}' queued",
                        pid,
                        if branch.is_empty() { "current branch" } else { branch.as_str() }
                    );
                }
                InstallOutcome::Updated(report) => {
                    println!(
                        "Updated '{}' to {} ({})",
                        report.branch,
                        report.to,
                        if report.synced { "new code" } else { "already current" }
                    );
                }
            }
        }

        Commands::Reconfigure => {
            let config = load_config(cli.config.as_deref())?;
            init_logging(cli.verbose, &config.logging, false);
            if !is_root() {
                bail!("reconfigure must run as root");
            }
            let user = operating_user(&config)?;
            let runner = Arc::new(SystemRunner::new());
            let audio = AudioBackend::new(runner.clone(), &config.audio, user.uid);
            let report = HostConfigurator::new(runner, &config, &user)
                .apply_system(&audio)
                .await?;
            info!("Reconfigure finished (changed: {})", report.changed());
        }

        Commands::Signal { kind, branch } => {
            let config = load_config(cli.config.as_deref())?;
            init_logging(cli.verbose, &config.logging, false);
            let kind = SignalKind::from(kind);
            if branch.is_some() && kind == SignalKind::Restart {
                warn!("--branch only applies to update, ignoring it");
            }
            let payload = match kind {
                SignalKind::Update => branch.unwrap_or_default(),
                SignalKind::Restart => String::new(),
            };
            let bus = SignalBus::new(&config.signals.dir);
            bus.request(kind, &payload)?;
            println!("Requested {} ({})", kind.file_name(), bus.path(kind).display());
        }

        Commands::Status => {
            let config = load_config(cli.config.as_deref())?;
            init_logging(cli.verbose, &config.logging, false);
            let uid = operating_user(&config)
                .map(|u| u.uid)
                .unwrap_or_else(|_| effective_uid());
            let audio = AudioBackend::new(Arc::new(SystemRunner::new()), &config.audio, uid);
            print!("{}", StatusReport::collect(&config, &audio));
        }

        Commands::Config { show, init } => {
            let path = match cli.config {
                Some(p) => p,
                None => Config::config_path()?,
            };
            if init {
                if path.exists() {
                    println!("Config file already exists: {}", path.display());
                } else {
                    Config::default().save_to(&path)?;
                    println!("Wrote default configuration to {}", path.display());
                }
            }
            if show {
                config::show(Some(path.as_path()))?;
            } else if !init {
                let state = if path.exists() { "" } else { " (not present, using defaults)" };
                println!("Config file: {}{}", path.display(), state);
                println!("Use --show to see the effective configuration.");
            }
        }
    }

    Ok(())
}
