//! Round-robin runner.
//!
//! Transmit scheduling is done by the kernel `roundrobin` mode. The runner
//! only keeps each port's `enabled` option in line with its link state.

use super::Runner;
use crate::context::TeamdContext;
use crate::error::TeamdResult;
use crate::events::{EventKind, EventWatch, WatchId};
use crate::kernel::{OptionValue, TeamOption};
use crate::link_watch::link_watch_port_up;
use crate::ports::TeamdPort;
use std::rc::Rc;
use tracing::debug;

#[derive(Default)]
pub struct RoundRobinRunner {
    watch: Option<WatchId>,
}

struct PortEnabler;

impl PortEnabler {
    fn sync(&self, ctx: &mut TeamdContext, port: &TeamdPort) -> TeamdResult<()> {
        let enabled = link_watch_port_up(ctx, port.ifindex);
        debug!(port = %port.ifname, enabled, "Setting port enabled");
        ctx.handle_mut()?.set_option(&TeamOption::for_port(
            "enabled",
            port.ifindex,
            OptionValue::Bool(enabled),
        ))
    }
}

impl EventWatch for PortEnabler {
    fn name(&self) -> &str {
        "roundrobin"
    }

    fn port_added(&self, ctx: &mut TeamdContext, port: &TeamdPort) -> TeamdResult<()> {
        self.sync(ctx, port)
    }

    fn port_changed(&self, ctx: &mut TeamdContext, port: &TeamdPort) -> TeamdResult<()> {
        self.sync(ctx, port)
    }
}

impl Runner for RoundRobinRunner {
    fn init(&mut self, ctx: &mut TeamdContext) -> TeamdResult<()> {
        let id = ctx
            .events_mut()
            .subscribe(EventKind::PortAdded | EventKind::PortChanged, Rc::new(PortEnabler));
        self.watch = Some(id);
        Ok(())
    }

    fn fini(&mut self, ctx: &mut TeamdContext) {
        if let Some(id) = self.watch.take() {
            ctx.events_mut().unsubscribe(id);
        }
    }
}

pub(super) fn create() -> Box<dyn Runner> {
    Box::<RoundRobinRunner>::default()
}
