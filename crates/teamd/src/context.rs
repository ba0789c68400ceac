//! Daemon context.
//!
//! [`TeamdContext`] owns everything the daemon manages for its single team
//! device: the kernel handle, the port registry, the event bus, the run
//! loop callbacks, the state registry and the active runner. Nothing is
//! global, so several contexts can live in one process.

use crate::config::{Config, ConfigSource};
use crate::error::{TeamdError, TeamdResult};
use crate::events::EventBus;
use crate::kernel::{TeamHandle, TeamHandleFactory};
use crate::lifecycle::Stage;
use crate::link_watch;
use crate::ports::PortRegistry;
use crate::run_loop::RunLoop;
use crate::runner::ActiveRunner;
use crate::state::StateRegistry;
use crate::state_basics;
use std::fmt;
use teamd_types::HwAddr;

/// Identity of a subsystem owning loop callbacks or port private data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OwnerId {
    id: u64,
    label: &'static str,
}

impl OwnerId {
    pub fn label(&self) -> &'static str {
        self.label
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label)
    }
}

/// Options resolved from the command line before initialization.
#[derive(Debug, Clone, Default)]
pub struct ContextOptions {
    pub config: ConfigSource,
    /// Destroy and recreate an existing team device of the same name.
    pub force_recreate: bool,
}

pub struct TeamdContext {
    options: ContextOptions,
    factory: Box<dyn TeamHandleFactory>,
    pub(crate) config: Option<Config>,
    pub(crate) team_name: Option<String>,
    pub(crate) handle: Option<Box<dyn TeamHandle>>,
    pub(crate) ifindex: u32,
    pub(crate) hwaddr: Option<HwAddr>,
    pub(crate) hwaddr_len: usize,
    pub(crate) runner: Option<ActiveRunner>,
    pub(crate) ports: PortRegistry,
    pub(crate) events: EventBus,
    pub(crate) run_loop: RunLoop,
    pub(crate) state: StateRegistry,
    pub(crate) completed: Vec<Stage>,
    next_owner: u64,
    daemon_owner: OwnerId,
    link_watch_owner: OwnerId,
}

impl TeamdContext {
    /// Creates an uninitialized context. The link watch and the
    /// `team_device` state contribution are installed right away so they
    /// precede the runner in dispatch order.
    pub fn new(options: ContextOptions, factory: Box<dyn TeamHandleFactory>) -> Self {
        let mut ctx = Self {
            options,
            factory,
            config: None,
            team_name: None,
            handle: None,
            ifindex: 0,
            hwaddr: None,
            hwaddr_len: 0,
            runner: None,
            ports: PortRegistry::new(),
            events: EventBus::new(),
            run_loop: RunLoop::new(),
            state: StateRegistry::new(),
            completed: Vec::new(),
            next_owner: 0,
            daemon_owner: OwnerId { id: 0, label: "" },
            link_watch_owner: OwnerId { id: 0, label: "" },
        };
        ctx.daemon_owner = ctx.new_owner("teamd");
        ctx.link_watch_owner = ctx.new_owner("link_watch");
        link_watch::install(&mut ctx);
        state_basics::install(&mut ctx);
        ctx
    }

    /// Allocates an owner identity unique within this context.
    pub fn new_owner(&mut self, label: &'static str) -> OwnerId {
        self.next_owner += 1;
        OwnerId {
            id: self.next_owner,
            label,
        }
    }

    /// Owner of the daemon's own loop callbacks.
    pub fn daemon_owner(&self) -> OwnerId {
        self.daemon_owner
    }

    pub(crate) fn link_watch_owner(&self) -> OwnerId {
        self.link_watch_owner
    }

    pub fn options(&self) -> &ContextOptions {
        &self.options
    }

    pub(crate) fn factory(&self) -> &dyn TeamHandleFactory {
        self.factory.as_ref()
    }

    pub fn config(&self) -> Option<&Config> {
        self.config.as_ref()
    }

    pub(crate) fn require_config(&self) -> TeamdResult<&Config> {
        self.config
            .as_ref()
            .ok_or_else(|| TeamdError::invalid_state("configuration not loaded"))
    }

    pub fn team_name(&self) -> Option<&str> {
        self.team_name.as_deref()
    }

    /// Team device ifindex, 0 before it is resolved.
    pub fn ifindex(&self) -> u32 {
        self.ifindex
    }

    pub fn hwaddr(&self) -> Option<&HwAddr> {
        self.hwaddr.as_ref()
    }

    pub fn hwaddr_len(&self) -> usize {
        self.hwaddr_len
    }

    pub fn handle(&self) -> TeamdResult<&dyn TeamHandle> {
        self.handle
            .as_deref()
            .ok_or_else(|| TeamdError::invalid_state("no kernel handle"))
    }

    pub fn handle_mut(&mut self) -> TeamdResult<&mut dyn TeamHandle> {
        match self.handle.as_mut() {
            Some(handle) => Ok(handle.as_mut()),
            None => Err(TeamdError::invalid_state("no kernel handle")),
        }
    }

    /// Name of the active runner.
    pub fn runner_name(&self) -> Option<&'static str> {
        self.runner.as_ref().map(|r| r.descriptor().name)
    }

    pub fn ports(&self) -> &PortRegistry {
        &self.ports
    }

    pub fn ports_mut(&mut self) -> &mut PortRegistry {
        &mut self.ports
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn events_mut(&mut self) -> &mut EventBus {
        &mut self.events
    }

    pub fn run_loop(&self) -> &RunLoop {
        &self.run_loop
    }

    pub fn run_loop_mut(&mut self) -> &mut RunLoop {
        &mut self.run_loop
    }

    pub fn state(&self) -> &StateRegistry {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut StateRegistry {
        &mut self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::mock::MockTeam;

    #[test]
    fn test_owner_ids_are_distinct() {
        let mut ctx = TeamdContext::new(ContextOptions::default(), Box::new(MockTeam::new()));
        let a = ctx.new_owner("same");
        let b = ctx.new_owner("same");
        assert_ne!(a, b);
        assert_eq!(a.to_string(), "same");
        assert_ne!(ctx.daemon_owner(), ctx.link_watch_owner());
    }

    #[test]
    fn test_new_context_is_idle() {
        let ctx = TeamdContext::new(ContextOptions::default(), Box::new(MockTeam::new()));
        assert!(ctx.handle().is_err());
        assert!(ctx.config().is_none());
        assert_eq!(ctx.ifindex(), 0);
        assert_eq!(ctx.runner_name(), None);
        assert!(ctx.ports().is_empty());
        assert!(ctx.run_loop().is_empty());
        assert!(ctx.state().contains("team_device"));
        assert!(ctx.state().contains("link_watches"));
    }
}
