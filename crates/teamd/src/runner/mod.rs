//! Runner framework.
//!
//! A runner is the bonding algorithm driving the team device. The set of
//! runners is fixed at compile time in [`RUNNERS`]; configuration picks
//! one by name at initialization and it stays active until the daemon
//! exits.

mod activebackup;
mod dummy;
mod roundrobin;

pub use activebackup::ActiveBackupRunner;
pub use dummy::DummyRunner;
pub use roundrobin::RoundRobinRunner;

use crate::context::TeamdContext;
use crate::error::{TeamdError, TeamdResult};
use crate::state::StateOps;
use std::fmt;
use std::rc::Rc;
use tracing::{debug, info, warn};

/// State contribution name of the active runner.
pub const RUNNER_STATE_NAME: &str = "runner";

/// Behaviour of one bonding algorithm instance.
pub trait Runner {
    /// Registers the runner with the event bus and run loop as needed.
    fn init(&mut self, _ctx: &mut TeamdContext) -> TeamdResult<()> {
        Ok(())
    }

    /// Undoes exactly what `init` registered.
    fn fini(&mut self, _ctx: &mut TeamdContext) {}

    /// State reported under the `runner` contribution.
    fn state_ops(&self) -> Option<Rc<dyn StateOps>> {
        None
    }
}

/// Compiled-in description of a runner.
pub struct RunnerDescriptor {
    pub name: &'static str,
    /// Kernel mode the runner needs. Runners without one have no
    /// functional effect.
    pub team_mode_name: Option<&'static str>,
    create: fn() -> Box<dyn Runner>,
}

impl RunnerDescriptor {
    /// Allocates a fresh, default-initialized instance.
    pub fn create(&self) -> Box<dyn Runner> {
        (self.create)()
    }
}

impl fmt::Debug for RunnerDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunnerDescriptor")
            .field("name", &self.name)
            .field("team_mode_name", &self.team_mode_name)
            .finish()
    }
}

pub static RUNNERS: &[RunnerDescriptor] = &[
    RunnerDescriptor {
        name: "dummy",
        team_mode_name: None,
        create: dummy::create,
    },
    RunnerDescriptor {
        name: "roundrobin",
        team_mode_name: Some("roundrobin"),
        create: roundrobin::create,
    },
    RunnerDescriptor {
        name: "activebackup",
        team_mode_name: Some("activebackup"),
        create: activebackup::create,
    },
];

/// Looks a runner up by exact name.
pub fn find_runner(name: &str) -> Option<&'static RunnerDescriptor> {
    RUNNERS.iter().find(|r| r.name == name)
}

/// Names of all compiled-in runners.
pub fn runner_names() -> impl Iterator<Item = &'static str> {
    RUNNERS.iter().map(|r| r.name)
}

/// The runner instance owned by the context.
pub struct ActiveRunner {
    descriptor: &'static RunnerDescriptor,
    instance: Box<dyn Runner>,
}

impl ActiveRunner {
    pub fn descriptor(&self) -> &'static RunnerDescriptor {
        self.descriptor
    }
}

impl TeamdContext {
    /// Selects, creates and initializes the configured runner.
    pub(crate) fn runner_init(&mut self) -> TeamdResult<()> {
        if self.runner.is_some() {
            return Err(TeamdError::invalid_state("runner already initialized"));
        }
        let runner_name = self.require_config()?.runner_name()?.to_string();
        debug!(runner = %runner_name, "Using team runner");

        let descriptor =
            find_runner(&runner_name).ok_or_else(|| TeamdError::RunnerNotFound(runner_name.clone()))?;

        match descriptor.team_mode_name {
            Some(mode) => self.handle_mut()?.set_mode_name(mode)?,
            None => warn!(
                runner = %runner_name,
                "Runner does not select team mode resulting in no functionality"
            ),
        }

        let mut instance = descriptor.create();
        instance.init(self)?;
        if let Some(ops) = instance.state_ops() {
            if let Err(e) = self.state.register(RUNNER_STATE_NAME, ops) {
                instance.fini(self);
                return Err(e);
            }
        }

        info!(runner = descriptor.name, "Runner initialized");
        self.runner = Some(ActiveRunner { descriptor, instance });
        Ok(())
    }

    /// Finalizes and frees the active runner, if any.
    pub(crate) fn runner_fini(&mut self) {
        let Some(mut active) = self.runner.take() else {
            return;
        };
        self.state.unregister(RUNNER_STATE_NAME);
        active.instance.fini(self);
        debug!(runner = active.descriptor.name, "Runner finalized");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_names_are_unique() {
        let mut names: Vec<_> = runner_names().collect();
        let total = names.len();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), total);
    }

    #[test]
    fn test_find_runner() {
        assert_eq!(find_runner("activebackup").unwrap().team_mode_name, Some("activebackup"));
        assert_eq!(find_runner("dummy").unwrap().team_mode_name, None);
        assert!(find_runner("X").is_none());
        assert!(find_runner("ActiveBackup").is_none());
    }
}
