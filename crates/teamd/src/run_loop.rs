//! Single-threaded cooperative run loop.
//!
//! Every asynchronous source of the daemon is a callback registered under
//! an (owner, name) pair: a readable/writable descriptor, a timer, or a
//! termination source. [`run`] blocks in `poll(2)` until a descriptor is
//! ready or the nearest timer deadline passes, then dispatches the ready
//! callbacks in registration order, termination sources first.
//!
//! Callbacks may register, remove, enable or disable callbacks while a
//! pass is running. Additions are parked in a pending queue and removals
//! leave a tombstone, so the pass never sees the change. Any structural
//! change marks the wait set dirty and it is rebuilt before the next wait.

use crate::context::{OwnerId, TeamdContext};
use crate::error::{TeamdError, TeamdResult};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use std::os::fd::{BorrowedFd, RawFd};
use std::rc::Rc;
use std::time::{Duration, Instant};
use tracing::{debug, error, trace, warn};

/// Callback body. Descriptor callbacks receive the returned events, timers
/// receive an empty set.
pub type LoopHandler = Rc<dyn Fn(&mut TeamdContext, PollFlags) -> TeamdResult<()>>;

/// What a callback waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopSource {
    /// Descriptor with an interest mask (`POLLIN`, `POLLOUT`, `POLLPRI`).
    Fd { fd: RawFd, interest: PollFlags },
    /// Timer firing after `initial` (or `interval` when no initial delay
    /// is given) and then every `interval`. Without an interval it fires
    /// once per arming.
    Timer {
        interval: Option<Duration>,
        initial: Option<Duration>,
    },
    /// Readable descriptor delivering termination requests. Dispatched
    /// ahead of everything else in a pass.
    Termination { fd: RawFd },
    /// Kernel notification descriptor. Any error it returns stops the loop.
    Device { fd: RawFd },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Fd,
    Timer,
    Termination,
    Device,
}

struct LoopCallback {
    owner: OwnerId,
    name: String,
    kind: Kind,
    fd: Option<RawFd>,
    interest: PollFlags,
    interval: Option<Duration>,
    initial: Option<Duration>,
    deadline: Option<Instant>,
    enabled: bool,
    removed: bool,
    handler: LoopHandler,
}

impl LoopCallback {
    fn matches(&self, owner: OwnerId, name: &str) -> bool {
        !self.removed && self.owner == owner && self.name == name
    }

    fn arm(&mut self, now: Instant) {
        self.deadline = self
            .initial
            .or(self.interval)
            .map(|d| now + d)
            .or(Some(now));
    }

    fn rearm_after_fire(&mut self, now: Instant) {
        self.deadline = self.interval.map(|d| now + d);
    }
}

/// Callback registry of one daemon context.
#[derive(Default)]
pub struct RunLoop {
    callbacks: Vec<LoopCallback>,
    pending: Vec<LoopCallback>,
    dirty: bool,
    quit: bool,
}

impl RunLoop {
    pub fn new() -> Self {
        Self::default()
    }

    fn find_mut(&mut self, owner: OwnerId, name: &str) -> Option<&mut LoopCallback> {
        self.callbacks
            .iter_mut()
            .chain(self.pending.iter_mut())
            .find(|cb| cb.matches(owner, name))
    }

    fn find(&self, owner: OwnerId, name: &str) -> Option<&LoopCallback> {
        self.callbacks
            .iter()
            .chain(self.pending.iter())
            .find(|cb| cb.matches(owner, name))
    }

    /// Registers a callback. New callbacks start enabled; timers are armed
    /// on registration.
    pub fn register<F>(
        &mut self,
        owner: OwnerId,
        name: &str,
        source: LoopSource,
        handler: F,
    ) -> TeamdResult<()>
    where
        F: Fn(&mut TeamdContext, PollFlags) -> TeamdResult<()> + 'static,
    {
        if self.find(owner, name).is_some() {
            return Err(TeamdError::AlreadyRegistered {
                owner: owner.to_string(),
                name: name.to_string(),
            });
        }

        let (kind, fd, interest, interval, initial) = match source {
            LoopSource::Fd { fd, interest } => (Kind::Fd, Some(fd), interest, None, None),
            LoopSource::Timer { interval, initial } => {
                (Kind::Timer, None, PollFlags::empty(), interval, initial)
            }
            LoopSource::Termination { fd } => (Kind::Termination, Some(fd), PollFlags::POLLIN, None, None),
            LoopSource::Device { fd } => (Kind::Device, Some(fd), PollFlags::POLLIN, None, None),
        };
        let mut callback = LoopCallback {
            owner,
            name: name.to_string(),
            kind,
            fd,
            interest,
            interval,
            initial,
            deadline: None,
            enabled: true,
            removed: false,
            handler: Rc::new(handler),
        };
        if kind == Kind::Timer {
            callback.arm(Instant::now());
        }

        debug!(owner = %owner, name, ?kind, "Registering loop callback");
        self.pending.push(callback);
        self.restart();
        Ok(())
    }

    /// Removes a callback. Removing an unknown pair is a no-op.
    pub fn unregister(&mut self, owner: OwnerId, name: &str) {
        if let Some(cb) = self.find_mut(owner, name) {
            debug!(owner = %owner, name, "Unregistering loop callback");
            cb.removed = true;
            self.restart();
        }
    }

    /// Removes every callback of an owner.
    pub fn unregister_owner(&mut self, owner: OwnerId) {
        let mut any = false;
        for cb in self.callbacks.iter_mut().chain(self.pending.iter_mut()) {
            if cb.owner == owner && !cb.removed {
                cb.removed = true;
                any = true;
            }
        }
        if any {
            self.restart();
        }
    }

    /// Enables or disables dispatch. Enabling an idle timer arms it again.
    pub fn set_enabled(&mut self, owner: OwnerId, name: &str, enabled: bool) -> TeamdResult<()> {
        let cb = self.find_mut(owner, name).ok_or_else(|| TeamdError::NotRegistered {
            owner: owner.to_string(),
            name: name.to_string(),
        })?;
        if cb.kind == Kind::Timer && enabled && (!cb.enabled || cb.deadline.is_none()) {
            cb.arm(Instant::now());
        }
        cb.enabled = enabled;
        self.restart();
        Ok(())
    }

    pub fn enable(&mut self, owner: OwnerId, name: &str) -> TeamdResult<()> {
        self.set_enabled(owner, name, true)
    }

    pub fn disable(&mut self, owner: OwnerId, name: &str) -> TeamdResult<()> {
        self.set_enabled(owner, name, false)
    }

    /// Re-arms a timer with new timing.
    pub fn timer_set(
        &mut self,
        owner: OwnerId,
        name: &str,
        interval: Option<Duration>,
        initial: Option<Duration>,
    ) -> TeamdResult<()> {
        let cb = self
            .find_mut(owner, name)
            .filter(|cb| cb.kind == Kind::Timer)
            .ok_or_else(|| TeamdError::NotRegistered {
                owner: owner.to_string(),
                name: name.to_string(),
            })?;
        cb.interval = interval;
        cb.initial = initial;
        cb.arm(Instant::now());
        self.restart();
        Ok(())
    }

    pub fn is_registered(&self, owner: OwnerId, name: &str) -> bool {
        self.find(owner, name).is_some()
    }

    pub fn is_enabled(&self, owner: OwnerId, name: &str) -> bool {
        self.find(owner, name).is_some_and(|cb| cb.enabled)
    }

    /// Number of live registrations.
    pub fn len(&self) -> usize {
        self.callbacks
            .iter()
            .chain(self.pending.iter())
            .filter(|cb| !cb.removed)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forces the wait set to be rebuilt before the next wait.
    pub fn restart(&mut self) {
        self.dirty = true;
    }

    /// Asks the loop to exit once the current pass completes.
    pub fn request_quit(&mut self) {
        self.quit = true;
    }

    pub fn quit_requested(&self) -> bool {
        self.quit
    }

    fn rebuild(&mut self) {
        self.callbacks.retain(|cb| !cb.removed);
        self.pending.retain(|cb| !cb.removed);
        self.callbacks.append(&mut self.pending);
        self.dirty = false;
        trace!(count = self.callbacks.len(), "Rebuilt loop wait set");
    }

    fn poll_timeout(&self, now: Instant) -> PollTimeout {
        let nearest = self
            .callbacks
            .iter()
            .filter(|cb| cb.kind == Kind::Timer && cb.enabled && !cb.removed)
            .filter_map(|cb| cb.deadline)
            .min();
        match nearest {
            None => PollTimeout::NONE,
            Some(deadline) => {
                let left = deadline.saturating_duration_since(now);
                // Round up so the wait never ends just before the deadline.
                let ms = left.as_millis() + u128::from(left.subsec_nanos() % 1_000_000 != 0);
                PollTimeout::from(u16::try_from(ms).unwrap_or(u16::MAX))
            }
        }
    }

    /// Ready callbacks of the built wait set, termination sources first,
    /// everything else in registration order.
    fn collect_ready(&self, slots: &[(usize, PollFlags)], now: Instant) -> Vec<(usize, PollFlags)> {
        let mut ready: Vec<(usize, PollFlags)> = Vec::new();
        for (idx, cb) in self.callbacks.iter().enumerate() {
            if !cb.enabled || cb.removed {
                continue;
            }
            match cb.kind {
                Kind::Timer => {
                    if cb.deadline.is_some_and(|d| d <= now) {
                        ready.push((idx, PollFlags::empty()));
                    }
                }
                _ => {
                    if let Some((_, revents)) = slots.iter().find(|(i, _)| *i == idx) {
                        if !revents.is_empty() {
                            ready.push((idx, *revents));
                        }
                    }
                }
            }
        }
        ready.sort_by_key(|(idx, _)| self.callbacks[*idx].kind != Kind::Termination);
        ready
    }

    /// Handler of a still-live, still-enabled callback of this pass.
    fn take_for_dispatch(&mut self, idx: usize, now: Instant) -> Option<(LoopHandler, Kind, OwnerId, String)> {
        let cb = self.callbacks.get_mut(idx)?;
        if cb.removed || !cb.enabled {
            return None;
        }
        if cb.kind == Kind::Timer {
            cb.rearm_after_fire(now);
        }
        Some((Rc::clone(&cb.handler), cb.kind, cb.owner, cb.name.clone()))
    }
}

fn wait(run_loop: &RunLoop) -> TeamdResult<Vec<(usize, PollFlags)>> {
    let watched: Vec<(usize, RawFd, PollFlags)> = run_loop
        .callbacks
        .iter()
        .enumerate()
        .filter(|(_, cb)| cb.enabled && !cb.removed)
        .filter_map(|(idx, cb)| cb.fd.map(|fd| (idx, fd, cb.interest)))
        .collect();
    let timeout = run_loop.poll_timeout(Instant::now());

    let mut fds: Vec<PollFd<'_>> = watched
        .iter()
        .map(|(_, fd, interest)| {
            // SAFETY: registered descriptors stay open until unregistered,
            // and nothing unregisters while the loop is blocked here.
            let fd = unsafe { BorrowedFd::borrow_raw(*fd) };
            PollFd::new(fd, *interest)
        })
        .collect();

    match poll(&mut fds, timeout) {
        Ok(_) => {}
        Err(Errno::EINTR) => return Ok(Vec::new()),
        Err(e) => {
            error!(error = %e, "poll() failed");
            return Err(TeamdError::Poll(e));
        }
    }

    let slots: Vec<(usize, PollFlags)> = watched
        .iter()
        .zip(fds.iter())
        .map(|((idx, _, _), pfd)| (*idx, pfd.revents().unwrap_or_else(PollFlags::empty)))
        .collect();
    Ok(run_loop.collect_ready(&slots, Instant::now()))
}

/// Runs one wait and dispatch pass.
pub fn run_once(ctx: &mut TeamdContext) -> TeamdResult<()> {
    if ctx.run_loop().dirty || !ctx.run_loop().pending.is_empty() {
        ctx.run_loop_mut().rebuild();
    }

    let ready = wait(ctx.run_loop())?;
    let now = Instant::now();
    for (idx, revents) in ready {
        // Indices stay valid for the whole pass: the wait set is only
        // compacted by rebuild().
        let Some((handler, kind, owner, name)) = ctx.run_loop_mut().take_for_dispatch(idx, now) else {
            continue;
        };
        trace!(owner = %owner, name = %name, ?revents, "Dispatching loop callback");
        if let Err(e) = (*handler)(ctx, revents) {
            if kind == Kind::Device || e.is_fatal() {
                error!(owner = %owner, name = %name, error = %e, "Loop callback failed");
                return Err(match e {
                    TeamdError::DeviceDesync(_) | TeamdError::Poll(_) => e,
                    other => TeamdError::DeviceDesync(other.to_string()),
                });
            }
            warn!(owner = %owner, name = %name, error = %e, "Loop callback failed");
        }
    }
    Ok(())
}

/// Runs until a quit request is observed after a pass.
pub fn run(ctx: &mut TeamdContext) -> TeamdResult<()> {
    debug!("Entering run loop");
    ctx.run_loop_mut().quit = false;
    while !ctx.run_loop().quit {
        run_once(ctx)?;
    }
    debug!("Leaving run loop");
    Ok(())
}
