//! Port registry.
//!
//! Holds one [`TeamdPort`] per kernel team member, in the order the ports
//! joined, plus a side table of per-port private data. Each subsystem
//! attaches at most one block per port under its own [`OwnerId`] and can
//! only reach its own blocks. Blocks are dropped in attach order when the
//! port goes away; `Drop` is the finalizer.
//!
//! Port records are only created and destroyed through [`TeamdContext`],
//! which pairs every change with an event bus notification.

use crate::context::{OwnerId, TeamdContext};
use crate::error::{TeamdError, TeamdResult};
use crate::kernel::{TeamChange, TeamPortInfo};
use serde::Serialize;
use std::any::Any;
use tracing::{debug, info, instrument, trace, warn};

/// One member link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TeamdPort {
    pub ifindex: u32,
    /// Name as last seen by the registry; may lag a rename until the
    /// kernel notification is processed.
    pub ifname: String,
    /// Latest kernel view of the port.
    pub team_port: TeamPortInfo,
}

impl TeamdPort {
    pub fn link_up(&self) -> bool {
        self.team_port.link_up
    }
}

impl From<TeamPortInfo> for TeamdPort {
    fn from(info: TeamPortInfo) -> Self {
        Self {
            ifindex: info.ifindex,
            ifname: info.ifname.clone(),
            team_port: info,
        }
    }
}

struct PrivEntry {
    ifindex: u32,
    owner: OwnerId,
    value: Box<dyn Any>,
}

#[derive(Default)]
pub struct PortRegistry {
    ports: Vec<TeamdPort>,
    privs: Vec<PrivEntry>,
}

impl PortRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> usize {
        self.ports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }

    /// Ports in join order.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &TeamdPort> {
        self.ports.iter()
    }

    pub fn find_by_ifindex(&self, ifindex: u32) -> Option<&TeamdPort> {
        self.ports.iter().find(|p| p.ifindex == ifindex)
    }

    pub fn find_by_ifname(&self, ifname: &str) -> Option<&TeamdPort> {
        self.ports.iter().find(|p| p.ifname == ifname)
    }

    /// Attaches `owner`'s private block to a port.
    ///
    /// The port does not need to be registered yet, so `port_added`
    /// subscribers can attach data to the port being added.
    pub fn priv_create<T: Any>(&mut self, ifindex: u32, owner: OwnerId, value: T) -> TeamdResult<()> {
        if self.privs.iter().any(|e| e.ifindex == ifindex && e.owner == owner) {
            return Err(TeamdError::PrivExists {
                ifindex,
                owner: owner.to_string(),
            });
        }
        trace!(ifindex, owner = %owner, "Attaching port private data");
        self.privs.push(PrivEntry {
            ifindex,
            owner,
            value: Box::new(value),
        });
        Ok(())
    }

    pub fn priv_get<T: Any>(&self, ifindex: u32, owner: OwnerId) -> Option<&T> {
        self.privs
            .iter()
            .find(|e| e.ifindex == ifindex && e.owner == owner)
            .and_then(|e| e.value.downcast_ref())
    }

    pub fn priv_get_mut<T: Any>(&mut self, ifindex: u32, owner: OwnerId) -> Option<&mut T> {
        self.privs
            .iter_mut()
            .find(|e| e.ifindex == ifindex && e.owner == owner)
            .and_then(|e| e.value.downcast_mut())
    }

    /// Blocks attached by `owner`, in attach order, with their port ifindex.
    pub fn privs_by_owner(&self, owner: OwnerId) -> impl Iterator<Item = (u32, &dyn Any)> {
        self.privs
            .iter()
            .filter(move |e| e.owner == owner)
            .map(|e| (e.ifindex, e.value.as_ref()))
    }

    fn insert(&mut self, port: TeamdPort) {
        self.ports.push(port);
    }

    fn take(&mut self, ifindex: u32) -> Option<TeamdPort> {
        let pos = self.ports.iter().position(|p| p.ifindex == ifindex)?;
        Some(self.ports.remove(pos))
    }

    fn get_mut(&mut self, ifindex: u32) -> Option<&mut TeamdPort> {
        self.ports.iter_mut().find(|p| p.ifindex == ifindex)
    }

    /// Drops every block attached to a port, in attach order.
    fn destroy_privs(&mut self, ifindex: u32) -> usize {
        let (gone, kept): (Vec<PrivEntry>, Vec<PrivEntry>) = std::mem::take(&mut self.privs)
            .into_iter()
            .partition(|e| e.ifindex == ifindex);
        self.privs = kept;
        let count = gone.len();
        for entry in gone {
            trace!(ifindex, owner = %entry.owner, "Destroying port private data");
            drop(entry.value);
        }
        count
    }
}

impl TeamdContext {
    /// Makes `ifname` a team member and registers it.
    ///
    /// Fails without leaving a port record if the name does not resolve,
    /// the kernel refuses the port, or a `port_added` subscriber vetoes it.
    /// A vetoed port is taken out of the team again.
    #[instrument(skip(self))]
    pub fn port_add(&mut self, ifname: &str) -> TeamdResult<&TeamdPort> {
        let ifindex = self
            .handle()?
            .ifname_to_ifindex(ifname)?
            .ok_or_else(|| TeamdError::PortNotFound(ifname.to_string()))?;
        if self.ports.find_by_ifindex(ifindex).is_some() {
            return Err(TeamdError::PortExists(ifname.to_string()));
        }

        debug!(port = %ifname, ifindex, "Adding port");
        self.handle_mut()?.port_add(ifindex)?;

        let info = self.handle().and_then(|h| h.port_info(ifindex));
        let attached = info.and_then(|info| self.port_attach(info));
        if let Err(e) = attached {
            self.kernel_port_remove_quiet(ifindex);
            return Err(e);
        }

        self.ports
            .find_by_ifindex(ifindex)
            .ok_or_else(|| TeamdError::PortNotFound(ifname.to_string()))
    }

    /// Takes `ifname` out of the team and unregisters it. Ports already
    /// gone at the kernel level are unregistered all the same.
    #[instrument(skip(self))]
    pub fn port_remove(&mut self, ifname: &str) -> TeamdResult<()> {
        let ifindex = self
            .ports
            .find_by_ifname(ifname)
            .map(|p| p.ifindex)
            .ok_or_else(|| TeamdError::PortNotFound(ifname.to_string()))?;

        debug!(port = %ifname, ifindex, "Removing port");
        self.handle_mut()?.port_remove(ifindex)?;
        self.port_detach(ifindex);
        Ok(())
    }

    /// Removes every port, most recently added first.
    pub fn remove_all_ports(&mut self) {
        let names: Vec<(u32, String)> = self
            .ports
            .iter()
            .rev()
            .map(|p| (p.ifindex, p.ifname.clone()))
            .collect();
        for (ifindex, name) in names {
            if let Err(e) = self.port_remove(&name) {
                warn!(port = %name, error = %e, "Failed to remove port, dropping it anyway");
                self.port_detach(ifindex);
            }
        }
    }

    /// Publishes `port_added` and registers the port unless vetoed.
    fn port_attach(&mut self, info: TeamPortInfo) -> TeamdResult<()> {
        let port = TeamdPort::from(info);
        if let Err(e) = self.emit_port_added(&port) {
            let dropped = self.ports.destroy_privs(port.ifindex);
            warn!(port = %port.ifname, dropped, error = %e, "Port add aborted");
            return Err(e);
        }
        info!(port = %port.ifname, ifindex = port.ifindex, "Port added");
        self.ports.insert(port);
        Ok(())
    }

    /// Unregisters a port, publishes `port_removed`, then drops its
    /// private data.
    fn port_detach(&mut self, ifindex: u32) -> Option<TeamdPort> {
        let port = self.ports.take(ifindex)?;
        self.emit_port_removed(&port);
        self.ports.destroy_privs(ifindex);
        info!(port = %port.ifname, ifindex, "Port removed");
        Some(port)
    }

    fn kernel_port_remove_quiet(&mut self, ifindex: u32) {
        let removed = self.handle_mut().and_then(|h| h.port_remove(ifindex));
        if let Err(e) = removed {
            warn!(ifindex, error = %e, "Failed to take port out of the team");
        }
    }

    /// Folds one kernel notification into the registry and publishes the
    /// matching event.
    pub fn apply_team_change(&mut self, change: TeamChange) -> TeamdResult<()> {
        trace!(?change, "Team change");
        match change {
            TeamChange::PortAppeared(info) => {
                let ifindex = info.ifindex;
                if let Some(port) = self.ports.get_mut(ifindex) {
                    let link_changed = port.team_port.link_up != info.link_up;
                    port.team_port = info;
                    if link_changed {
                        let port = port.clone();
                        self.emit_port_link_changed(&port);
                    }
                } else if let Err(e) = self.port_attach(info) {
                    warn!(ifindex, error = %e, "Refused port reported by kernel");
                    self.kernel_port_remove_quiet(ifindex);
                }
            }
            TeamChange::PortDisappeared { ifindex } => {
                self.port_detach(ifindex);
            }
            TeamChange::PortChanged(info) => {
                if let Some(port) = self.ports.get_mut(info.ifindex) {
                    port.team_port.speed = info.speed;
                    port.team_port.duplex = info.duplex;
                    let port = port.clone();
                    self.emit_port_changed(&port);
                }
            }
            TeamChange::PortLinkChanged { ifindex, link_up } => {
                if let Some(port) = self.ports.get_mut(ifindex) {
                    port.team_port.link_up = link_up;
                    let port = port.clone();
                    self.emit_port_link_changed(&port);
                }
            }
            TeamChange::PortHwaddrChanged { ifindex, hwaddr } => {
                if let Some(port) = self.ports.get_mut(ifindex) {
                    port.team_port.hwaddr = Some(hwaddr);
                    let port = port.clone();
                    self.emit_port_hwaddr_changed(&port);
                }
            }
            TeamChange::PortIfnameChanged { ifindex, ifname } => {
                if let Some(port) = self.ports.get_mut(ifindex) {
                    port.ifname = ifname.clone();
                    port.team_port.ifname = ifname;
                    let port = port.clone();
                    self.emit_port_ifname_changed(&port);
                }
            }
            TeamChange::HwaddrChanged(hwaddr) => {
                self.hwaddr = Some(hwaddr);
                self.emit_hwaddr_changed();
            }
            TeamChange::IfnameChanged(ifname) => {
                self.team_name = Some(ifname);
                self.emit_ifname_changed();
            }
            TeamChange::OptionChanged(option) => {
                self.emit_option_changed(&option);
            }
        }
        Ok(())
    }
}
