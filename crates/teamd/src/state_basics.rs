//! `team_device` state contribution: the team device itself and the
//! kernel view of every port.

use crate::context::TeamdContext;
use crate::error::TeamdResult;
use crate::ports::TeamdPort;
use crate::state::StateOps;
use serde_json::{json, Value};
use std::rc::Rc;
use tracing::error;

pub const TEAM_DEVICE_STATE_NAME: &str = "team_device";

struct TeamDeviceState;

pub(crate) fn install(ctx: &mut TeamdContext) {
    if let Err(e) = ctx.state_mut().register(TEAM_DEVICE_STATE_NAME, Rc::new(TeamDeviceState)) {
        error!(error = %e, "Failed to register team device state");
    }
}

impl StateOps for TeamDeviceState {
    fn dump(&self, ctx: &TeamdContext) -> TeamdResult<Option<Value>> {
        Ok(Some(json!({
            "ifinfo": {
                "ifindex": ctx.ifindex(),
                "ifname": ctx.team_name(),
                "hwaddr": ctx.hwaddr().map(ToString::to_string),
                "hwaddr_len": ctx.hwaddr_len(),
            },
            "runner": ctx.runner_name(),
        })))
    }

    fn per_port_dump(&self, _ctx: &TeamdContext, port: &TeamdPort) -> TeamdResult<Option<Value>> {
        let info = &port.team_port;
        Ok(Some(json!({
            "ifinfo": {
                "ifindex": port.ifindex,
                "ifname": port.ifname,
                "hwaddr": info.hwaddr.as_ref().map(ToString::to_string),
            },
            "link": {
                "up": info.link_up,
                "speed": info.speed,
                "duplex": info.duplex,
            },
        })))
    }
}
