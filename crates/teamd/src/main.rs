//! teamd - Team network device control daemon
//!
//! Entry point for the teamd binary.

use anyhow::{bail, Context};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use teamd::daemon::{self, Daemonized, PidFile, DEFAULT_PID_FILE, KILL_WAIT_TIMEOUT};
use teamd::{runner_names, ConfigSource, ContextOptions, TeamHandleFactory, TeamdContext};

fn runners_help() -> String {
    let names: Vec<&str> = runner_names().collect();
    format!("Available runners: {}", names.join(", "))
}

/// Team network device control daemon
#[derive(Parser, Debug)]
#[command(name = "teamd")]
#[command(author, about, long_about = None)]
#[command(disable_version_flag = true)]
#[command(after_help = runners_help())]
struct Args {
    /// Daemonize after startup
    #[arg(short = 'd', long)]
    daemonize: bool,

    /// Kill running daemon instance
    #[arg(short = 'k', long, conflicts_with_all = ["check", "daemonize"])]
    kill: bool,

    /// Return 0 if a daemon is already running
    #[arg(short = 'e', long, conflicts_with = "daemonize")]
    check: bool,

    /// Show version
    #[arg(short = 'v', long)]
    version: bool,

    /// Load the specified configuration file
    #[arg(short = 'f', long = "config-file", value_name = "FILE")]
    config_file: Option<PathBuf>,

    /// Use the specified configuration text, takes precedence over --config-file
    #[arg(short = 'c', long = "config", value_name = "TEXT")]
    config: Option<String>,

    /// Use the specified PID file
    #[arg(short = 'p', long = "pid-file", value_name = "FILE", default_value = DEFAULT_PID_FILE)]
    pid_file: PathBuf,

    /// Increase verbosity (-g debug, -gg trace)
    #[arg(short = 'g', long = "debug", action = clap::ArgAction::Count)]
    debug: u8,

    /// Force team device recreation in case it already exists
    #[arg(short = 'r', long = "force-recreate")]
    force_recreate: bool,
}

/// Initializes tracing/logging subsystem
fn init_logging(debug: u8) {
    let level = match debug {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}

#[cfg(target_os = "linux")]
fn handle_factory() -> anyhow::Result<Box<dyn TeamHandleFactory>> {
    Ok(Box::new(teamd::kernel::link::LinkTeamHandleFactory))
}

#[cfg(not(target_os = "linux"))]
fn handle_factory() -> anyhow::Result<Box<dyn TeamHandleFactory>> {
    bail!("team devices are only supported on Linux")
}

fn run_daemon(args: &Args, pid_file: &PidFile) -> anyhow::Result<ExitCode> {
    if !nix::unistd::Uid::effective().is_root() {
        bail!("this program requires root privileges");
    }
    if let Some(pid) = pid_file.running()? {
        bail!("daemon already running with pid {}", pid);
    }

    let options = ContextOptions {
        config: ConfigSource {
            file: args.config_file.clone(),
            text: args.config.clone(),
        },
        force_recreate: args.force_recreate,
    };
    let mut ctx = TeamdContext::new(options, handle_factory()?);

    let status = if args.daemonize {
        match daemon::daemonize().context("Failed to daemonize")? {
            Daemonized::Parent { status } => return Ok(ExitCode::from(status)),
            Daemonized::Child(pipe) => Some(pipe),
        }
    } else {
        None
    };

    pid_file.create().context("Failed to create pid file")?;
    let result = daemon::install_termination(&mut ctx)
        .context("Failed to install termination source")
        .and_then(|()| daemon::serve(&mut ctx, status).map_err(anyhow::Error::from));
    daemon::uninstall_termination(&mut ctx);
    pid_file.remove();
    result?;
    Ok(ExitCode::SUCCESS)
}

fn run(args: Args) -> anyhow::Result<ExitCode> {
    if args.version {
        println!("teamd {}", env!("CARGO_PKG_VERSION"));
        return Ok(ExitCode::SUCCESS);
    }

    let pid_file = PidFile::new(&args.pid_file);
    if args.kill {
        pid_file
            .kill_wait(KILL_WAIT_TIMEOUT)
            .context("Failed to kill daemon")?;
        return Ok(ExitCode::SUCCESS);
    }
    if args.check {
        return Ok(match pid_file.running()? {
            Some(_) => ExitCode::SUCCESS,
            None => ExitCode::FAILURE,
        });
    }

    run_daemon(&args, &pid_file)
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.debug);

    info!("--- Starting teamd ---");
    match run(args) {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}
