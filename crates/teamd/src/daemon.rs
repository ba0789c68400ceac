//! Process-level plumbing: PID file, termination signals, daemonization
//! and the serve loop.

use crate::context::TeamdContext;
use crate::error::{TeamdError, TeamdResult};
use crate::run_loop::{self, LoopSource};
use nix::errno::Errno;
use nix::sys::signal::{kill, SigSet, Signal};
use nix::sys::signalfd::{SfdFlags, SignalFd};
use nix::unistd::{fork, setsid, ForkResult, Pid};
use std::cell::RefCell;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::os::fd::{AsFd, AsRawFd};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

pub const DEFAULT_RUN_DIR: &str = "/var/run/teamd";
pub const DEFAULT_PID_FILE: &str = "/var/run/teamd/teamd.pid";

/// How long `--kill` waits for the daemon to exit.
pub const KILL_WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// How long a daemonizing parent waits for the child's init status.
pub const INIT_STATUS_TIMEOUT: Duration = Duration::from_secs(20);

/// Loop callback name of the termination source.
pub const TERMINATION_CALLBACK: &str = "termination";

/// PID file of a running daemon.
#[derive(Debug, Clone)]
pub struct PidFile {
    path: PathBuf,
}

impl Default for PidFile {
    fn default() -> Self {
        Self::new(DEFAULT_PID_FILE)
    }
}

impl PidFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// PID recorded in the file, `None` when the file does not exist.
    pub fn read_pid(&self) -> TeamdResult<Option<Pid>> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(TeamdError::pid_file(&self.path, e.to_string())),
        };
        let pid: i32 = content
            .trim()
            .parse()
            .map_err(|_| TeamdError::pid_file(&self.path, format!("invalid content \"{}\"", content.trim())))?;
        if pid <= 0 {
            return Err(TeamdError::pid_file(&self.path, format!("invalid pid {}", pid)));
        }
        Ok(Some(Pid::from_raw(pid)))
    }

    /// PID of the live process named by the file. A stale file reads as
    /// not running.
    pub fn running(&self) -> TeamdResult<Option<Pid>> {
        let Some(pid) = self.read_pid()? else {
            return Ok(None);
        };
        Ok(process_alive(pid).then_some(pid))
    }

    /// Writes the calling process's PID, creating the parent directory.
    pub fn create(&self) -> TeamdResult<()> {
        if let Some(pid) = self.running()? {
            return Err(TeamdError::pid_file(
                &self.path,
                format!("daemon already running with pid {}", pid),
            ));
        }
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir).map_err(|e| TeamdError::pid_file(&self.path, e.to_string()))?;
        }
        let mut file = File::create(&self.path).map_err(|e| TeamdError::pid_file(&self.path, e.to_string()))?;
        writeln!(file, "{}", Pid::this()).map_err(|e| TeamdError::pid_file(&self.path, e.to_string()))?;
        debug!(path = %self.path.display(), "Created pid file");
        Ok(())
    }

    pub fn remove(&self) {
        match fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "Removed pid file"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "Failed to remove pid file"),
        }
    }

    /// Sends SIGTERM to the recorded daemon and waits for it to exit.
    pub fn kill_wait(&self, timeout: Duration) -> TeamdResult<()> {
        let pid = self
            .running()?
            .ok_or_else(|| TeamdError::pid_file(&self.path, "daemon not running"))?;
        kill(pid, Signal::SIGTERM)?;
        let deadline = Instant::now() + timeout;
        while process_alive(pid) {
            if Instant::now() >= deadline {
                return Err(TeamdError::pid_file(
                    &self.path,
                    format!("daemon with pid {} did not exit in {:?}", pid, timeout),
                ));
            }
            thread::sleep(Duration::from_millis(100));
        }
        info!(%pid, "Daemon terminated");
        Ok(())
    }
}

fn process_alive(pid: Pid) -> bool {
    !matches!(kill(pid, None), Err(Errno::ESRCH))
}

fn termination_mask() -> SigSet {
    let mut mask = SigSet::empty();
    for signal in [Signal::SIGINT, Signal::SIGQUIT, Signal::SIGTERM, Signal::SIGHUP] {
        mask.add(signal);
    }
    mask
}

fn read_termination(ctx: &mut TeamdContext, fd: &RefCell<SignalFd>) -> TeamdResult<()> {
    loop {
        let Some(info) = fd.borrow_mut().read_signal()? else {
            return Ok(());
        };
        match i32::try_from(info.ssi_signo).ok().and_then(|s| Signal::try_from(s).ok()) {
            Some(Signal::SIGHUP) => debug!("Ignoring SIGHUP"),
            Some(signal) => {
                info!(signal = signal.as_str(), "Termination requested");
                ctx.run_loop_mut().request_quit();
            }
            None => warn!(signo = info.ssi_signo, "Unexpected signal"),
        }
    }
}

/// Blocks the termination signals in the calling thread and registers a
/// signalfd reading them as the loop's termination source.
pub fn install_termination(ctx: &mut TeamdContext) -> TeamdResult<()> {
    let mask = termination_mask();
    mask.thread_block()?;
    let sfd = SignalFd::with_flags(&mask, SfdFlags::SFD_NONBLOCK | SfdFlags::SFD_CLOEXEC)?;
    let fd = sfd.as_fd().as_raw_fd();
    let sfd = Rc::new(RefCell::new(sfd));
    let owner = ctx.daemon_owner();
    ctx.run_loop_mut()
        .register(owner, TERMINATION_CALLBACK, LoopSource::Termination { fd }, move |ctx, _| {
            read_termination(ctx, &sfd)
        })
}

/// Unregisters the termination source and unblocks its signals.
pub fn uninstall_termination(ctx: &mut TeamdContext) {
    let owner = ctx.daemon_owner();
    ctx.run_loop_mut().unregister(owner, TERMINATION_CALLBACK);
    if let Err(e) = termination_mask().thread_unblock() {
        warn!(error = %e, "Failed to unblock termination signals");
    }
}

/// Child end of the daemonization status channel.
#[derive(Debug)]
pub struct StatusPipe {
    stream: UnixStream,
}

impl StatusPipe {
    /// Tells the waiting parent how initialization went.
    pub fn report(mut self, status: u8) {
        if let Err(e) = self.stream.write_all(&[status]) {
            warn!(error = %e, "Failed to report init status to parent");
        }
    }
}

/// Outcome of [`daemonize`] in each process.
#[derive(Debug)]
pub enum Daemonized {
    /// Original process; carries the status the child reported.
    Parent { status: u8 },
    /// Detached daemon process.
    Child(StatusPipe),
}

/// Forks into the background. The parent blocks until the child reports
/// its init status or [`INIT_STATUS_TIMEOUT`] passes.
pub fn daemonize() -> TeamdResult<Daemonized> {
    let (mut parent_end, child_end) = UnixStream::pair()?;

    // SAFETY: the process is still single-threaded here, so the child
    // inherits no locks held by other threads.
    match unsafe { fork() }? {
        ForkResult::Parent { child } => {
            drop(child_end);
            debug!(%child, "Waiting for daemon init status");
            parent_end.set_read_timeout(Some(INIT_STATUS_TIMEOUT))?;
            let mut status = [0u8; 1];
            match parent_end.read_exact(&mut status) {
                Ok(()) => Ok(Daemonized::Parent { status: status[0] }),
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    error!("Daemon did not report init status in time");
                    Ok(Daemonized::Parent { status: 1 })
                }
                Err(e) => {
                    error!(error = %e, "Daemon exited without reporting init status");
                    Ok(Daemonized::Parent { status: 1 })
                }
            }
        }
        ForkResult::Child => {
            drop(parent_end);
            setsid()?;
            std::env::set_current_dir("/")?;
            let null_in = File::open("/dev/null")?;
            let null_out = OpenOptions::new().write(true).open("/dev/null")?;
            nix::unistd::dup2_stdin(&null_in)?;
            nix::unistd::dup2_stdout(&null_out)?;
            // stderr stays open: it is the tracing writer, and the only
            // place a detached daemon's log goes.
            Ok(Daemonized::Child(StatusPipe { stream: child_end }))
        }
    }
}

/// Initializes the context, runs the loop until termination and tears
/// everything down. The init status goes to `status` when daemonized.
pub fn serve(ctx: &mut TeamdContext, status: Option<StatusPipe>) -> TeamdResult<()> {
    if let Err(e) = ctx.init() {
        if let Some(pipe) = status {
            pipe.report(1);
        }
        return Err(e);
    }
    if let Some(pipe) = status {
        pipe.report(0);
    }
    if let Err(e) = sd_notify::notify(true, &[sd_notify::NotifyState::Ready]) {
        warn!(error = %e, "Failed to send READY notification");
    }

    let result = run_loop::run(ctx);
    if let Err(e) = &result {
        error!(error = %e, "Run loop failed");
    }
    let _ = sd_notify::notify(true, &[sd_notify::NotifyState::Stopping]);
    ctx.fini();
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigSource;
    use crate::context::ContextOptions;
    use crate::kernel::mock::MockTeam;
    use tempfile::TempDir;

    #[test]
    fn test_pid_file_lifecycle() {
        let dir = TempDir::new().unwrap();
        let pid_file = PidFile::new(dir.path().join("run/teamd.pid"));

        assert_eq!(pid_file.read_pid().unwrap(), None);
        assert_eq!(pid_file.running().unwrap(), None);

        pid_file.create().unwrap();
        assert_eq!(pid_file.read_pid().unwrap(), Some(Pid::this()));
        assert_eq!(pid_file.running().unwrap(), Some(Pid::this()));
        assert!(matches!(pid_file.create(), Err(TeamdError::PidFile { .. })));

        pid_file.remove();
        assert!(!pid_file.path().exists());
        pid_file.remove();
    }

    #[test]
    fn test_pid_file_garbage() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("teamd.pid");
        fs::write(&path, "not a pid\n").unwrap();
        assert!(PidFile::new(&path).read_pid().is_err());
        fs::write(&path, "0\n").unwrap();
        assert!(PidFile::new(&path).read_pid().is_err());
    }

    #[test]
    fn test_kill_wait_without_daemon() {
        let dir = TempDir::new().unwrap();
        let pid_file = PidFile::new(dir.path().join("teamd.pid"));
        assert!(pid_file.kill_wait(Duration::from_millis(10)).is_err());
    }

    #[test]
    fn test_termination_signal_requests_quit() {
        let mut ctx = TeamdContext::new(ContextOptions::default(), Box::new(MockTeam::new()));
        install_termination(&mut ctx).unwrap();
        nix::sys::signal::raise(Signal::SIGHUP).unwrap();
        run_loop::run_once(&mut ctx).unwrap();
        assert!(!ctx.run_loop().quit_requested());

        nix::sys::signal::raise(Signal::SIGTERM).unwrap();
        run_loop::run_once(&mut ctx).unwrap();
        assert!(ctx.run_loop().quit_requested());
        uninstall_termination(&mut ctx);
        assert!(ctx.run_loop().is_empty());
    }

    #[test]
    fn test_serve_runs_until_quit() {
        let team = MockTeam::with_links(["eth0"]);
        let mut ctx = TeamdContext::new(
            ContextOptions {
                config: ConfigSource::text(r#"{"device": "team0", "runner": "roundrobin", "ports": ["eth0"]}"#),
                force_recreate: false,
            },
            Box::new(team.clone()),
        );
        let owner = ctx.new_owner("test");
        ctx.run_loop_mut()
            .register(
                owner,
                "stop",
                LoopSource::Timer {
                    interval: None,
                    initial: Some(Duration::from_millis(5)),
                },
                |ctx, _| {
                    ctx.run_loop_mut().request_quit();
                    Ok(())
                },
            )
            .unwrap();

        serve(&mut ctx, None).unwrap();
        assert!(!team.team_exists());
        assert_eq!(team.count("free"), 1);
        assert!(ctx.completed_stages().is_empty());
    }

    #[test]
    fn test_serve_reports_init_failure() {
        let team = MockTeam::new();
        team.fail("create");
        let mut ctx = TeamdContext::new(
            ContextOptions {
                config: ConfigSource::text(r#"{"device": "team0", "runner": "dummy"}"#),
                force_recreate: false,
            },
            Box::new(team.clone()),
        );
        let (parent, child) = UnixStream::pair().unwrap();
        let err = serve(&mut ctx, Some(StatusPipe { stream: child })).unwrap_err();
        assert_eq!(err.stage(), Some(crate::lifecycle::Stage::CreateDevice));

        let mut status = Vec::new();
        (&parent).read_to_end(&mut status).unwrap();
        assert_eq!(status, vec![1]);
    }
}
