//! Linux backend for the kernel communication layer.
//!
//! Link notifications arrive on an rtnetlink socket subscribed to
//! `RTNLGRP_LINK`; its descriptor is the handle's event source. Device and
//! port configuration goes through `ip` and `teamnl`. Port attributes that
//! netlink does not carry (speed, duplex, address length) are read from
//! sysfs.

use super::shell::{self, shellquote, IP_CMD, TEAMNL_CMD};
use super::{TeamChange, TeamHandle, TeamHandleFactory, TeamOption, TeamPortInfo};
use crate::error::{TeamdError, TeamdResult};
use netlink_packet_core::{NetlinkMessage, NetlinkPayload};
use netlink_packet_route::link::{LinkAttribute, LinkFlags, LinkMessage};
use netlink_packet_route::RouteNetlinkMessage;
use netlink_sys::{protocols::NETLINK_ROUTE, Socket, SocketAddr};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::ErrorKind;
use std::os::fd::{AsRawFd, RawFd};
use std::path::PathBuf;
use teamd_types::{Duplex, HwAddr};
use tracing::{debug, instrument, trace, warn};

/// Netlink group for link notifications (RTNLGRP_LINK = 1)
const RTNLGRP_LINK: u32 = 1;

const SYSFS_NET: &str = "/sys/class/net";

fn sysfs_path(ifname: &str, attr: &str) -> PathBuf {
    PathBuf::from(SYSFS_NET).join(ifname).join(attr)
}

fn sysfs_read(ifname: &str, attr: &str) -> Option<String> {
    fs::read_to_string(sysfs_path(ifname, attr))
        .ok()
        .map(|s| s.trim().to_string())
}

/// Allocates [`LinkTeamHandle`]s.
#[derive(Debug, Default, Clone, Copy)]
pub struct LinkTeamHandleFactory;

impl TeamHandleFactory for LinkTeamHandleFactory {
    fn alloc(&self) -> TeamdResult<Box<dyn TeamHandle>> {
        Ok(Box::new(LinkTeamHandle::new()?))
    }
}

#[derive(Debug, Clone)]
struct MemberCache {
    ifname: String,
    link_up: bool,
    hwaddr: Option<HwAddr>,
    speed: u32,
    duplex: Duplex,
}

/// Ports this handle took out of the team whose leave has not been seen
/// on the socket yet. Link messages queued before the removal still name
/// the team as controller and must not bring the port back.
#[derive(Debug, Default)]
struct ReleasedPorts(HashSet<u32>);

impl ReleasedPorts {
    fn release(&mut self, ifindex: u32) {
        self.0.insert(ifindex);
    }

    fn rejoin(&mut self, ifindex: u32) {
        self.0.remove(&ifindex);
    }

    /// Whether a link message predates the release. The first message
    /// without the team as controller settles the port.
    fn is_stale(&mut self, ifindex: u32, is_member: bool) -> bool {
        if !self.0.contains(&ifindex) {
            return false;
        }
        if !is_member {
            self.0.remove(&ifindex);
            return false;
        }
        true
    }
}

/// Team device handle backed by rtnetlink, sysfs and `ip`/`teamnl`.
pub struct LinkTeamHandle {
    socket: Socket,
    team_name: Option<String>,
    team_ifindex: Option<u32>,
    team_hwaddr: Option<HwAddr>,
    members: HashMap<u32, MemberCache>,
    released: ReleasedPorts,
}

impl LinkTeamHandle {
    #[instrument]
    pub fn new() -> TeamdResult<Self> {
        let mut socket = Socket::new(NETLINK_ROUTE)
            .map_err(|e| TeamdError::kernel("alloc", format!("failed to create socket: {}", e)))?;
        let addr = SocketAddr::new(0, 1 << (RTNLGRP_LINK - 1));
        socket
            .bind(&addr)
            .map_err(|e| TeamdError::kernel("alloc", format!("failed to bind socket: {}", e)))?;
        socket
            .set_non_blocking(true)
            .map_err(|e| TeamdError::kernel("alloc", format!("failed to set non-blocking: {}", e)))?;
        debug!("Netlink socket bound to RTNLGRP_LINK");

        Ok(Self {
            socket,
            team_name: None,
            team_ifindex: None,
            team_hwaddr: None,
            members: HashMap::new(),
            released: ReleasedPorts::default(),
        })
    }

    fn team_name(&self, operation: &str) -> TeamdResult<&str> {
        self.team_name
            .as_deref()
            .ok_or_else(|| TeamdError::kernel(operation, "team device not created"))
    }

    fn require_ifname(&self, operation: &str, ifindex: u32) -> TeamdResult<String> {
        self.ifindex_to_ifname(ifindex)?
            .ok_or_else(|| TeamdError::kernel(operation, format!("no interface with index {}", ifindex)))
    }

    fn read_port_info(ifindex: u32, ifname: &str) -> TeamPortInfo {
        let speed = sysfs_read(ifname, "speed")
            .and_then(|s| s.parse::<i64>().ok())
            .filter(|s| *s > 0)
            .and_then(|s| u32::try_from(s).ok())
            .unwrap_or(0);
        TeamPortInfo {
            ifindex,
            ifname: ifname.to_string(),
            hwaddr: sysfs_read(ifname, "address").and_then(|s| s.parse().ok()),
            link_up: sysfs_read(ifname, "carrier").as_deref() == Some("1"),
            speed,
            duplex: sysfs_read(ifname, "duplex")
                .and_then(|s| s.parse().ok())
                .unwrap_or_default(),
        }
    }

    fn parse_buffer(&mut self, buf: &[u8], changes: &mut Vec<TeamChange>) -> TeamdResult<()> {
        let mut offset = 0;
        while offset < buf.len() {
            let msg = NetlinkMessage::<RouteNetlinkMessage>::deserialize(&buf[offset..])
                .map_err(|e| TeamdError::DeviceDesync(format!("failed to parse message: {}", e)))?;
            let length = msg.header.length as usize;
            if length == 0 {
                break;
            }
            offset += length;
            // Align to 4 bytes (netlink alignment requirement)
            offset = (offset + 3) & !3;

            match msg.payload {
                NetlinkPayload::InnerMessage(RouteNetlinkMessage::NewLink(link)) => {
                    self.link_changed(link, false, changes)
                }
                NetlinkPayload::InnerMessage(RouteNetlinkMessage::DelLink(link)) => {
                    self.link_changed(link, true, changes)
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn link_changed(&mut self, link: LinkMessage, deleted: bool, changes: &mut Vec<TeamChange>) {
        let ifindex = link.header.index;
        let link_up = link.header.flags.contains(LinkFlags::LowerUp);
        let mut ifname = None;
        let mut controller = None;
        let mut hwaddr = None;
        for attr in link.attributes {
            match attr {
                LinkAttribute::IfName(name) => ifname = Some(name),
                LinkAttribute::Controller(index) => controller = Some(index),
                LinkAttribute::Address(bytes) => hwaddr = Some(HwAddr::new(bytes)),
                _ => {}
            }
        }
        trace!(ifindex, ?ifname, ?controller, link_up, deleted, "Link notification");

        if self.team_ifindex == Some(ifindex) {
            if let Some(name) = ifname {
                if self.team_name.as_deref() != Some(name.as_str()) {
                    self.team_name = Some(name.clone());
                    changes.push(TeamChange::IfnameChanged(name));
                }
            }
            if let Some(addr) = hwaddr {
                if self.team_hwaddr.as_ref() != Some(&addr) {
                    self.team_hwaddr = Some(addr.clone());
                    changes.push(TeamChange::HwaddrChanged(addr));
                }
            }
            return;
        }

        let is_member = !deleted && controller.is_some() && controller == self.team_ifindex;
        if self.released.is_stale(ifindex, is_member) {
            trace!(ifindex, "Dropping link notification queued before the port left");
            return;
        }
        match (self.members.get_mut(&ifindex), is_member) {
            (None, true) => {
                let name = ifname.unwrap_or_else(|| ifindex.to_string());
                let mut info = Self::read_port_info(ifindex, &name);
                info.link_up = link_up;
                if hwaddr.is_some() {
                    info.hwaddr = hwaddr;
                }
                self.members.insert(
                    ifindex,
                    MemberCache {
                        ifname: info.ifname.clone(),
                        link_up: info.link_up,
                        hwaddr: info.hwaddr.clone(),
                        speed: info.speed,
                        duplex: info.duplex,
                    },
                );
                changes.push(TeamChange::PortAppeared(info));
            }
            (Some(_), false) => {
                self.members.remove(&ifindex);
                changes.push(TeamChange::PortDisappeared { ifindex });
            }
            (Some(cached), true) => {
                if let Some(name) = ifname {
                    if name != cached.ifname {
                        cached.ifname = name.clone();
                        changes.push(TeamChange::PortIfnameChanged { ifindex, ifname: name });
                    }
                }
                if let Some(addr) = hwaddr {
                    if cached.hwaddr.as_ref() != Some(&addr) {
                        cached.hwaddr = Some(addr.clone());
                        changes.push(TeamChange::PortHwaddrChanged { ifindex, hwaddr: addr });
                    }
                }
                if cached.link_up != link_up {
                    cached.link_up = link_up;
                    changes.push(TeamChange::PortLinkChanged { ifindex, link_up });
                }
                let mut info = Self::read_port_info(ifindex, &cached.ifname);
                if info.speed != cached.speed || info.duplex != cached.duplex {
                    cached.speed = info.speed;
                    cached.duplex = info.duplex;
                    info.link_up = cached.link_up;
                    info.hwaddr = cached.hwaddr.clone();
                    changes.push(TeamChange::PortChanged(info));
                }
            }
            (None, false) => {}
        }
    }
}

impl TeamHandle for LinkTeamHandle {
    #[instrument(skip(self))]
    fn create(&mut self, team_name: &str) -> TeamdResult<()> {
        let cmd = format!("{} link add name {} type team", IP_CMD, shellquote(team_name));
        shell::exec_or_err(&cmd).map_err(|e| TeamdError::kernel("create", e.to_string()))?;
        self.team_name = Some(team_name.to_string());
        Ok(())
    }

    #[instrument(skip(self))]
    fn recreate(&mut self, team_name: &str) -> TeamdResult<()> {
        if nix::net::if_::if_nametoindex(team_name).is_ok() {
            let cmd = format!("{} link del dev {}", IP_CMD, shellquote(team_name));
            if let Err(e) = shell::exec_or_err(&cmd) {
                warn!(team = %team_name, error = %e, "Failed to remove stale team device");
            }
        }
        self.create(team_name)
    }

    fn destroy(&mut self) -> TeamdResult<()> {
        let team_name = self.team_name("destroy")?;
        let cmd = format!("{} link del dev {}", IP_CMD, shellquote(team_name));
        shell::exec_or_err(&cmd).map_err(|e| TeamdError::kernel("destroy", e.to_string()))?;
        self.members.clear();
        self.released = ReleasedPorts::default();
        self.team_ifindex = None;
        Ok(())
    }

    fn init(&mut self, ifindex: u32) -> TeamdResult<()> {
        let name = self.require_ifname("init", ifindex)?;
        self.team_hwaddr = sysfs_read(&name, "address").and_then(|s| s.parse().ok());
        self.team_name = Some(name);
        self.team_ifindex = Some(ifindex);
        Ok(())
    }

    fn ifname_to_ifindex(&self, ifname: &str) -> TeamdResult<Option<u32>> {
        match nix::net::if_::if_nametoindex(ifname) {
            Ok(index) => Ok(Some(index)),
            Err(nix::errno::Errno::ENODEV) | Err(nix::errno::Errno::ENXIO) => Ok(None),
            Err(e) => Err(TeamdError::kernel("ifname_to_ifindex", e.to_string())),
        }
    }

    fn ifindex_to_ifname(&self, ifindex: u32) -> TeamdResult<Option<String>> {
        let interfaces = nix::net::if_::if_nameindex()
            .map_err(|e| TeamdError::kernel("ifindex_to_ifname", e.to_string()))?;
        Ok(interfaces
            .iter()
            .find(|i| i.index() == ifindex)
            .map(|i| i.name().to_string_lossy().into_owned()))
    }

    fn hwaddr_len(&self, ifindex: u32) -> TeamdResult<usize> {
        let name = self.require_ifname("hwaddr_len", ifindex)?;
        sysfs_read(&name, "addr_len")
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| TeamdError::kernel("hwaddr_len", format!("no address length for {}", name)))
    }

    fn hwaddr_set(&mut self, ifindex: u32, hwaddr: &HwAddr) -> TeamdResult<()> {
        let name = self.require_ifname("hwaddr_set", ifindex)?;
        let cmd = format!(
            "{} link set dev {} address {}",
            IP_CMD,
            shellquote(&name),
            shellquote(&hwaddr.to_string())
        );
        shell::exec_or_err(&cmd).map_err(|e| TeamdError::kernel("hwaddr_set", e.to_string()))?;
        Ok(())
    }

    fn set_option(&mut self, option: &TeamOption) -> TeamdResult<()> {
        let team_name = self.team_name("set_option")?;
        let port = match option.port_ifindex {
            Some(ifindex) => format!("-p {} ", shellquote(&self.require_ifname("set_option", ifindex)?)),
            None => String::new(),
        };
        let cmd = format!(
            "{} {}{} setoption {} {}",
            TEAMNL_CMD,
            port,
            shellquote(team_name),
            shellquote(&option.name),
            shellquote(&option.value.to_string())
        );
        shell::exec_or_err(&cmd).map_err(|e| TeamdError::kernel("set_option", e.to_string()))?;
        Ok(())
    }

    #[instrument(skip(self))]
    fn port_add(&mut self, ifindex: u32) -> TeamdResult<()> {
        self.released.rejoin(ifindex);
        let team_name = self.team_name("port_add")?;
        let port = shellquote(&self.require_ifname("port_add", ifindex)?);
        let cmd = format!(
            "{ip} link set dev {port} down && {ip} link set dev {port} master {team} && {ip} link set dev {port} up",
            ip = IP_CMD,
            port = port,
            team = shellquote(team_name),
        );
        shell::exec_or_err(&cmd).map_err(|e| TeamdError::kernel("port_add", e.to_string()))?;
        Ok(())
    }

    #[instrument(skip(self))]
    fn port_remove(&mut self, ifindex: u32) -> TeamdResult<()> {
        let Some(name) = self.ifindex_to_ifname(ifindex)? else {
            debug!(ifindex, "Port already gone");
            return Ok(());
        };
        let team_name = self.team_name("port_remove")?;
        let controller = fs::read_link(sysfs_path(&name, "master"))
            .ok()
            .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()));
        if controller.as_deref() != Some(team_name) {
            debug!(port = %name, "Port is no longer a member");
            return Ok(());
        }
        let cmd = format!("{} link set dev {} nomaster", IP_CMD, shellquote(&name));
        shell::exec_or_err(&cmd).map_err(|e| TeamdError::kernel("port_remove", e.to_string()))?;
        self.members.remove(&ifindex);
        self.released.release(ifindex);
        Ok(())
    }

    fn port_info(&self, ifindex: u32) -> TeamdResult<TeamPortInfo> {
        let name = self.require_ifname("port_info", ifindex)?;
        Ok(Self::read_port_info(ifindex, &name))
    }

    fn event_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }

    fn process_events(&mut self) -> TeamdResult<Vec<TeamChange>> {
        let mut changes = Vec::new();
        loop {
            match self.socket.recv_from_full() {
                Ok((buf, _)) => self.parse_buffer(&buf, &mut changes)?,
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(TeamdError::DeviceDesync(format!("failed to receive: {}", e))),
            }
        }
        Ok(changes)
    }

    fn free(self: Box<Self>) {
        debug!("Releasing netlink socket");
    }
}
