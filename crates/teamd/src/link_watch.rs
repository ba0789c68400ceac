//! Ethtool-style link watch.
//!
//! Follows the carrier the kernel reports for each port and turns it into
//! the link state runners act on. A change is accepted immediately, or
//! after `delay_up`/`delay_down` if the carrier stays in the new state for
//! that long. Once the state settles, `port_changed` is published.
//!
//! The watch subscribes when the context is created, ahead of any runner.

use crate::config::LinkWatchConfig;
use crate::context::{OwnerId, TeamdContext};
use crate::error::TeamdResult;
use crate::events::{EventKind, EventWatch};
use crate::ports::TeamdPort;
use crate::run_loop::LoopSource;
use crate::state::StateOps;
use serde_json::{json, Value};
use std::rc::Rc;
use std::time::Duration;
use tracing::{debug, error};

/// State contribution name.
pub const LINK_WATCH_STATE_NAME: &str = "link_watches";

#[derive(Debug, Clone)]
struct LinkWatchPortState {
    up: bool,
    pending: Option<bool>,
    delay_up: Duration,
    delay_down: Duration,
}

struct LinkWatch {
    owner: OwnerId,
}

fn timer_name(ifindex: u32) -> String {
    format!("link_watch_{}", ifindex)
}

pub(crate) fn install(ctx: &mut TeamdContext) {
    let watch = Rc::new(LinkWatch {
        owner: ctx.link_watch_owner(),
    });
    ctx.events_mut().subscribe(
        EventKind::PortAdded | EventKind::PortRemoved | EventKind::PortLinkChanged,
        watch.clone(),
    );
    if let Err(e) = ctx.state_mut().register(LINK_WATCH_STATE_NAME, watch) {
        error!(error = %e, "Failed to register link watch state");
    }
}

/// Link state of a port as seen by the link watch. Ports the watch does
/// not track fall back to the kernel carrier.
pub fn link_watch_port_up(ctx: &TeamdContext, ifindex: u32) -> bool {
    ctx.ports()
        .priv_get::<LinkWatchPortState>(ifindex, ctx.link_watch_owner())
        .map(|s| s.up)
        .or_else(|| ctx.ports().find_by_ifindex(ifindex).map(TeamdPort::link_up))
        .unwrap_or(false)
}

fn settle(ctx: &mut TeamdContext, owner: OwnerId, ifindex: u32) -> TeamdResult<()> {
    ctx.run_loop_mut().unregister(owner, &timer_name(ifindex));
    let Some(state) = ctx.ports_mut().priv_get_mut::<LinkWatchPortState>(ifindex, owner) else {
        return Ok(());
    };
    let Some(up) = state.pending.take() else {
        return Ok(());
    };
    state.up = up;
    debug!(ifindex, up, "Link state settled");
    if let Some(port) = ctx.ports().find_by_ifindex(ifindex).cloned() {
        ctx.emit_port_changed(&port);
    }
    Ok(())
}

impl EventWatch for LinkWatch {
    fn name(&self) -> &str {
        "link_watch"
    }

    fn port_added(&self, ctx: &mut TeamdContext, port: &TeamdPort) -> TeamdResult<()> {
        let cfg = match ctx.config() {
            Some(config) => config.link_watch()?,
            None => LinkWatchConfig::default(),
        };
        ctx.ports_mut().priv_create(
            port.ifindex,
            self.owner,
            LinkWatchPortState {
                up: port.link_up(),
                pending: None,
                delay_up: cfg.delay_up(),
                delay_down: cfg.delay_down(),
            },
        )
    }

    fn port_removed(&self, ctx: &mut TeamdContext, port: &TeamdPort) -> TeamdResult<()> {
        ctx.run_loop_mut().unregister(self.owner, &timer_name(port.ifindex));
        Ok(())
    }

    fn port_link_changed(&self, ctx: &mut TeamdContext, port: &TeamdPort) -> TeamdResult<()> {
        let owner = self.owner;
        let ifindex = port.ifindex;
        let carrier = port.link_up();
        let name = timer_name(ifindex);

        let Some(state) = ctx.ports_mut().priv_get_mut::<LinkWatchPortState>(ifindex, owner) else {
            return Ok(());
        };
        if state.up == carrier {
            // Flapped back before the delay ran out.
            state.pending = None;
            ctx.run_loop_mut().unregister(owner, &name);
            return Ok(());
        }

        let delay = if carrier { state.delay_up } else { state.delay_down };
        if delay.is_zero() {
            state.up = carrier;
            state.pending = None;
            ctx.run_loop_mut().unregister(owner, &name);
            debug!(port = %port.ifname, up = carrier, "Link state changed");
            ctx.emit_port_changed(port);
            return Ok(());
        }

        if state.pending == Some(carrier) {
            return Ok(());
        }
        state.pending = Some(carrier);
        debug!(port = %port.ifname, up = carrier, ?delay, "Delaying link state change");
        ctx.run_loop_mut().unregister(owner, &name);
        ctx.run_loop_mut().register(
            owner,
            &name,
            LoopSource::Timer {
                interval: None,
                initial: Some(delay),
            },
            move |ctx, _| settle(ctx, owner, ifindex),
        )
    }
}

impl StateOps for LinkWatch {
    fn per_port_dump(&self, ctx: &TeamdContext, port: &TeamdPort) -> TeamdResult<Option<Value>> {
        Ok(ctx
            .ports()
            .priv_get::<LinkWatchPortState>(port.ifindex, self.owner)
            .map(|s| {
                json!({
                    "name": "ethtool",
                    "up": s.up,
                    "delay_up": u64::try_from(s.delay_up.as_millis()).unwrap_or(u64::MAX),
                    "delay_down": u64::try_from(s.delay_down.as_millis()).unwrap_or(u64::MAX),
                })
            }))
    }
}
