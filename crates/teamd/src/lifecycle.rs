//! Ordered initialization and rollback.
//!
//! Initialization runs the stages of [`Stage::ALL`] in order and records
//! each completed stage. When a stage fails, the completed stages are
//! undone in reverse before the error is returned, so a failed start
//! leaves nothing behind. Shutdown uses the same unwind.

use crate::config::Config;
use crate::context::TeamdContext;
use crate::error::{TeamdError, TeamdResult};
use crate::run_loop::LoopSource;
use serde::Serialize;
use std::fmt;
use tracing::{debug, error, info, instrument, trace, warn};

/// Loop callback name of the kernel notification source.
pub const TEAM_EVENTS_CALLBACK: &str = "team_events";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    LoadConfig,
    ResolveDevice,
    AcquireHandle,
    CreateDevice,
    ResolveIfindex,
    QueryHwaddrLen,
    ReconcileHwaddr,
    InitRunner,
    AddPorts,
}

impl Stage {
    pub const ALL: [Stage; 9] = [
        Stage::LoadConfig,
        Stage::ResolveDevice,
        Stage::AcquireHandle,
        Stage::CreateDevice,
        Stage::ResolveIfindex,
        Stage::QueryHwaddrLen,
        Stage::ReconcileHwaddr,
        Stage::InitRunner,
        Stage::AddPorts,
    ];

    /// 1-based position in the init sequence.
    pub fn number(&self) -> usize {
        Stage::ALL.iter().position(|s| s == self).map_or(0, |i| i + 1)
    }

    pub const fn description(&self) -> &'static str {
        match self {
            Stage::LoadConfig => "load configuration",
            Stage::ResolveDevice => "resolve team device name",
            Stage::AcquireHandle => "acquire kernel handle",
            Stage::CreateDevice => "create team device",
            Stage::ResolveIfindex => "resolve team device ifindex",
            Stage::QueryHwaddrLen => "query hardware address length",
            Stage::ReconcileHwaddr => "set configured hardware address",
            Stage::InitRunner => "initialize runner",
            Stage::AddPorts => "add ports",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.number(), self.description())
    }
}

fn process_team_events(ctx: &mut TeamdContext) -> TeamdResult<()> {
    let changes = ctx
        .handle_mut()?
        .process_events()
        .map_err(|e| TeamdError::DeviceDesync(e.to_string()))?;
    for change in changes {
        ctx.apply_team_change(change)?;
    }
    Ok(())
}

impl TeamdContext {
    /// Brings the daemon up. On failure every completed stage has been
    /// undone and the error carries the failing stage.
    pub fn init(&mut self) -> TeamdResult<()> {
        if !self.completed.is_empty() {
            return Err(TeamdError::invalid_state("already initialized"));
        }
        for stage in Stage::ALL {
            if let Err(e) = self.acquire(stage) {
                error!(stage = %stage, error = %e, "Initialization failed");
                self.unwind();
                return Err(TeamdError::Stage {
                    stage,
                    source: Box::new(e),
                });
            }
            self.completed.push(stage);
        }
        info!(team = self.team_name().unwrap_or_default(), "Team device initialized");
        Ok(())
    }

    /// Tears everything down in reverse order.
    pub fn fini(&mut self) {
        self.unwind();
    }

    /// Stages completed so far, in order.
    pub fn completed_stages(&self) -> &[Stage] {
        &self.completed
    }

    fn unwind(&mut self) {
        while let Some(stage) = self.completed.pop() {
            debug!(stage = %stage, "Undoing stage");
            self.undo(stage);
        }
    }

    #[instrument(skip(self), fields(stage = %stage))]
    fn acquire(&mut self, stage: Stage) -> TeamdResult<()> {
        match stage {
            Stage::LoadConfig => {
                let config = Config::load(&self.options().config)?;
                if let Ok(text) = config.dump() {
                    trace!(config = %text, "Loaded configuration");
                }
                self.config = Some(config);
            }
            Stage::ResolveDevice => {
                let name = self.require_config()?.device_name()?.to_string();
                debug!(team = %name, "Using team device");
                self.team_name = Some(name);
            }
            Stage::AcquireHandle => {
                self.handle = Some(self.factory().alloc()?);
            }
            Stage::CreateDevice => {
                let name = self.team_name_required()?;
                if self.options().force_recreate {
                    self.handle_mut()?.recreate(&name)?;
                } else {
                    self.handle_mut()?.create(&name)?;
                }
            }
            Stage::ResolveIfindex => {
                let name = self.team_name_required()?;
                let ifindex = self
                    .handle()?
                    .ifname_to_ifindex(&name)?
                    .ok_or_else(|| TeamdError::kernel("ifname_to_ifindex", format!("netdevice \"{}\" not found", name)))?;
                self.handle_mut()?.init(ifindex)?;
                self.ifindex = ifindex;

                let fd = self.handle()?.event_fd();
                let owner = self.daemon_owner();
                self.run_loop_mut().register(
                    owner,
                    TEAM_EVENTS_CALLBACK,
                    LoopSource::Device { fd },
                    |ctx, _| process_team_events(ctx),
                )?;
            }
            Stage::QueryHwaddrLen => {
                self.hwaddr_len = self.handle()?.hwaddr_len(self.ifindex)?;
            }
            Stage::ReconcileHwaddr => {
                let Some(hwaddr) = self.require_config()?.hwaddr()? else {
                    return Ok(());
                };
                if hwaddr.len() != self.hwaddr_len {
                    return Err(TeamdError::config(
                        "/hwaddr",
                        format!(
                            "hardware address has different length ({}) than team device has ({})",
                            hwaddr.len(),
                            self.hwaddr_len
                        ),
                    ));
                }
                let ifindex = self.ifindex;
                self.handle_mut()?.hwaddr_set(ifindex, &hwaddr)?;
                self.hwaddr = Some(hwaddr);
            }
            Stage::InitRunner => self.runner_init()?,
            Stage::AddPorts => {
                let names = self.require_config()?.port_names()?;
                for name in names {
                    if let Err(e) = self.port_add(&name) {
                        error!(port = %name, error = %e, "Failed to add port");
                        self.remove_all_ports();
                        return Err(e);
                    }
                }
            }
        }
        Ok(())
    }

    fn undo(&mut self, stage: Stage) {
        match stage {
            Stage::AddPorts => self.remove_all_ports(),
            Stage::InitRunner => self.runner_fini(),
            Stage::ReconcileHwaddr => self.hwaddr = None,
            Stage::QueryHwaddrLen => self.hwaddr_len = 0,
            Stage::ResolveIfindex => {
                let owner = self.daemon_owner();
                self.run_loop_mut().unregister(owner, TEAM_EVENTS_CALLBACK);
                self.ifindex = 0;
            }
            Stage::CreateDevice => {
                if let Err(e) = self.handle_mut().and_then(|h| h.destroy()) {
                    warn!(error = %e, "Failed to destroy team device");
                }
            }
            Stage::AcquireHandle => {
                if let Some(handle) = self.handle.take() {
                    handle.free();
                }
            }
            Stage::ResolveDevice => self.team_name = None,
            Stage::LoadConfig => self.config = None,
        }
    }

    fn team_name_required(&self) -> TeamdResult<String> {
        self.team_name()
            .map(str::to_string)
            .ok_or_else(|| TeamdError::invalid_state("team device name not resolved"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigSource;
    use crate::context::ContextOptions;
    use crate::kernel::mock::MockTeam;

    fn context(config: &str, team: &MockTeam) -> TeamdContext {
        TeamdContext::new(
            ContextOptions {
                config: ConfigSource::text(config),
                force_recreate: false,
            },
            Box::new(team.clone()),
        )
    }

    #[test]
    fn test_stage_numbers() {
        assert_eq!(Stage::LoadConfig.number(), 1);
        assert_eq!(Stage::InitRunner.number(), 8);
        assert_eq!(Stage::AddPorts.number(), 9);
        assert_eq!(Stage::AcquireHandle.to_string(), "3 (acquire kernel handle)");
    }

    #[test]
    fn test_init_and_fini() {
        let team = MockTeam::with_links(["eth0"]);
        let mut ctx = context(r#"{"device": "team0", "runner": "dummy", "ports": ["eth0"]}"#, &team);

        ctx.init().unwrap();
        assert_eq!(ctx.completed_stages(), &Stage::ALL);
        assert!(ctx.run_loop().is_registered(ctx.daemon_owner(), TEAM_EVENTS_CALLBACK));
        assert_eq!(ctx.ports().count(), 1);
        assert!(matches!(ctx.init(), Err(TeamdError::InvalidState(_))));

        ctx.fini();
        assert!(ctx.completed_stages().is_empty());
        assert!(ctx.run_loop().is_empty());
        assert!(ctx.handle().is_err());
        assert!(!team.team_exists());
    }

    #[test]
    fn test_missing_device_fails_stage_two() {
        let team = MockTeam::new();
        let mut ctx = context(r#"{"runner": "dummy"}"#, &team);
        let err = ctx.init().unwrap_err();
        assert_eq!(err.stage(), Some(Stage::ResolveDevice));
        assert!(matches!(err.root_cause(), TeamdError::MissingConfig(_)));
        assert!(team.journal().is_empty());
        assert!(ctx.config().is_none());
    }

    #[test]
    fn test_hwaddr_length_mismatch() {
        let team = MockTeam::new();
        let mut ctx = context(
            r#"{"device": "team0", "runner": "dummy", "hwaddr": "02:00:00:00:01"}"#,
            &team,
        );
        let err = ctx.init().unwrap_err();
        assert_eq!(err.stage(), Some(Stage::ReconcileHwaddr));
        assert_eq!(team.journal(), vec!["alloc", "create team0", "init team0", "destroy team0", "free"]);
    }
}
