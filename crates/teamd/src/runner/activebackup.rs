//! Active-backup runner.
//!
//! Keeps exactly one port active: the current one while its link stays
//! up, otherwise the first port in join order whose link is up. The
//! choice is pushed to the kernel through the `activeport` option
//! (ifindex, 0 for none).

use super::Runner;
use crate::context::TeamdContext;
use crate::error::TeamdResult;
use crate::events::{EventKind, EventWatch, WatchId};
use crate::kernel::{OptionValue, TeamOption};
use crate::link_watch::link_watch_port_up;
use crate::ports::TeamdPort;
use crate::state::StateOps;
use serde_json::{json, Value};
use std::cell::Cell;
use std::rc::Rc;
use tracing::info;

#[derive(Default)]
pub struct ActiveBackupRunner {
    shared: Rc<ActiveBackup>,
    watch: Option<WatchId>,
}

#[derive(Default)]
struct ActiveBackup {
    active: Cell<Option<u32>>,
}

impl ActiveBackup {
    fn usable(ctx: &TeamdContext, ifindex: u32) -> bool {
        ctx.ports().find_by_ifindex(ifindex).is_some() && link_watch_port_up(ctx, ifindex)
    }

    fn set_active(&self, ctx: &mut TeamdContext, port: Option<&TeamdPort>) -> TeamdResult<()> {
        let ifindex = port.map(|p| p.ifindex);
        if ifindex == self.active.get() {
            return Ok(());
        }
        ctx.handle_mut()?.set_option(&TeamOption::new(
            "activeport",
            OptionValue::U32(ifindex.unwrap_or(0)),
        ))?;
        match port {
            Some(p) => info!(port = %p.ifname, "Changed active port"),
            None => info!("No active port"),
        }
        self.active.set(ifindex);
        Ok(())
    }

    /// Keeps the current port if usable, else picks the first usable one.
    fn reselect(&self, ctx: &mut TeamdContext) -> TeamdResult<()> {
        if self.active.get().is_some_and(|i| Self::usable(ctx, i)) {
            return Ok(());
        }
        let view: &TeamdContext = ctx;
        let best = view
            .ports()
            .iter()
            .find(|p| link_watch_port_up(view, p.ifindex))
            .cloned();
        self.set_active(ctx, best.as_ref())
    }
}

impl EventWatch for ActiveBackup {
    fn name(&self) -> &str {
        "activebackup"
    }

    fn port_added(&self, ctx: &mut TeamdContext, port: &TeamdPort) -> TeamdResult<()> {
        // The new port is not in the registry yet, so consider it directly.
        let current_usable = self.active.get().is_some_and(|i| Self::usable(ctx, i));
        if !current_usable && link_watch_port_up(ctx, port.ifindex) {
            return self.set_active(ctx, Some(port));
        }
        Ok(())
    }

    fn port_add_aborted(&self, ctx: &mut TeamdContext, port: &TeamdPort) -> TeamdResult<()> {
        // The vetoed port never joined, so it cannot stay active.
        if self.active.get() == Some(port.ifindex) {
            return self.reselect(ctx);
        }
        Ok(())
    }

    fn port_removed(&self, ctx: &mut TeamdContext, port: &TeamdPort) -> TeamdResult<()> {
        if self.active.get() == Some(port.ifindex) {
            self.active.set(None);
            return self.reselect(ctx);
        }
        Ok(())
    }

    fn port_changed(&self, ctx: &mut TeamdContext, _port: &TeamdPort) -> TeamdResult<()> {
        self.reselect(ctx)
    }
}

impl StateOps for ActiveBackup {
    fn dump(&self, ctx: &TeamdContext) -> TeamdResult<Option<Value>> {
        let active = self
            .active
            .get()
            .and_then(|i| ctx.ports().find_by_ifindex(i))
            .map(|p| p.ifname.clone());
        Ok(Some(json!({ "active_port": active })))
    }
}

impl Runner for ActiveBackupRunner {
    fn init(&mut self, ctx: &mut TeamdContext) -> TeamdResult<()> {
        let id = ctx.events_mut().subscribe(
            EventKind::PortAdded | EventKind::PortRemoved | EventKind::PortChanged,
            self.shared.clone(),
        );
        self.watch = Some(id);
        Ok(())
    }

    fn fini(&mut self, ctx: &mut TeamdContext) {
        if let Some(id) = self.watch.take() {
            ctx.events_mut().unsubscribe(id);
        }
        self.shared.active.set(None);
    }

    fn state_ops(&self) -> Option<Rc<dyn StateOps>> {
        Some(self.shared.clone())
    }
}

pub(super) fn create() -> Box<dyn Runner> {
    Box::<ActiveBackupRunner>::default()
}
