//! Kernel communication layer.
//!
//! The daemon core only sees the [`TeamHandle`] capability set. The Linux
//! backend lives in [`link`]; [`mock`] is an in-memory backend that
//! journals every request and can fail any of them on demand.

#[cfg(target_os = "linux")]
pub mod link;
pub mod mock;
pub mod shell;

use crate::error::TeamdResult;
use serde::Serialize;
use std::os::fd::RawFd;
use teamd_types::{Duplex, HwAddr};

/// Kernel view of one team port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TeamPortInfo {
    pub ifindex: u32,
    pub ifname: String,
    pub hwaddr: Option<HwAddr>,
    pub link_up: bool,
    /// Mbit/s, 0 when unknown.
    pub speed: u32,
    pub duplex: Duplex,
}

impl TeamPortInfo {
    /// Port with link down and no speed information.
    pub fn new(ifindex: u32, ifname: impl Into<String>) -> Self {
        Self {
            ifindex,
            ifname: ifname.into(),
            hwaddr: None,
            link_up: false,
            speed: 0,
            duplex: Duplex::Unknown,
        }
    }
}

/// Team option value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum OptionValue {
    Bool(bool),
    U32(u32),
    String(String),
    Binary(Vec<u8>),
}

impl std::fmt::Display for OptionValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OptionValue::Bool(b) => write!(f, "{}", b),
            OptionValue::U32(v) => write!(f, "{}", v),
            OptionValue::String(s) => f.write_str(s),
            OptionValue::Binary(bytes) => {
                for byte in bytes {
                    write!(f, "{:02x}", byte)?;
                }
                Ok(())
            }
        }
    }
}

/// A team option, optionally scoped to one port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TeamOption {
    pub name: String,
    pub port_ifindex: Option<u32>,
    pub value: OptionValue,
}

impl TeamOption {
    /// Device-wide option.
    pub fn new(name: impl Into<String>, value: OptionValue) -> Self {
        Self {
            name: name.into(),
            port_ifindex: None,
            value,
        }
    }

    /// Option scoped to a port.
    pub fn for_port(name: impl Into<String>, ifindex: u32, value: OptionValue) -> Self {
        Self {
            name: name.into(),
            port_ifindex: Some(ifindex),
            value,
        }
    }
}

/// A change reported by the kernel since the last
/// [`TeamHandle::process_events`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TeamChange {
    /// A link became a member of the team device.
    PortAppeared(TeamPortInfo),
    /// A member left the team device.
    PortDisappeared { ifindex: u32 },
    /// Speed or duplex of a member changed.
    PortChanged(TeamPortInfo),
    /// Carrier of a member changed.
    PortLinkChanged { ifindex: u32, link_up: bool },
    PortHwaddrChanged { ifindex: u32, hwaddr: HwAddr },
    PortIfnameChanged { ifindex: u32, ifname: String },
    /// Hardware address of the team device changed.
    HwaddrChanged(HwAddr),
    /// The team device was renamed.
    IfnameChanged(String),
    OptionChanged(TeamOption),
}

/// Capability set of the kernel communication handle.
///
/// One handle serves one team device. It is released explicitly with
/// [`TeamHandle::free`] so the lifecycle can observe the release.
pub trait TeamHandle {
    /// Creates the team device; fails if it exists.
    fn create(&mut self, team_name: &str) -> TeamdResult<()>;

    /// Creates the team device, destroying a stale one first.
    fn recreate(&mut self, team_name: &str) -> TeamdResult<()>;

    /// Destroys the team device.
    fn destroy(&mut self) -> TeamdResult<()>;

    /// Binds the handle to the team device's interface index.
    fn init(&mut self, ifindex: u32) -> TeamdResult<()>;

    /// Resolves an interface name, `Ok(None)` when no such interface.
    fn ifname_to_ifindex(&self, ifname: &str) -> TeamdResult<Option<u32>>;

    fn ifindex_to_ifname(&self, ifindex: u32) -> TeamdResult<Option<String>>;

    fn hwaddr_len(&self, ifindex: u32) -> TeamdResult<usize>;

    fn hwaddr_set(&mut self, ifindex: u32, hwaddr: &HwAddr) -> TeamdResult<()>;

    fn set_option(&mut self, option: &TeamOption) -> TeamdResult<()>;

    /// Selects the kernel mode.
    fn set_mode_name(&mut self, mode: &str) -> TeamdResult<()> {
        self.set_option(&TeamOption::new("mode", OptionValue::String(mode.to_string())))
    }

    fn port_add(&mut self, ifindex: u32) -> TeamdResult<()>;

    /// Removes a member. Returns `Ok` when the port is no longer a member,
    /// including when it was already gone.
    fn port_remove(&mut self, ifindex: u32) -> TeamdResult<()>;

    fn port_info(&self, ifindex: u32) -> TeamdResult<TeamPortInfo>;

    /// Descriptor that becomes readable when kernel notifications are pending.
    fn event_fd(&self) -> RawFd;

    /// Drains pending notifications.
    fn process_events(&mut self) -> TeamdResult<Vec<TeamChange>>;

    /// Releases the handle.
    fn free(self: Box<Self>);
}

/// Allocates kernel handles.
pub trait TeamHandleFactory {
    fn alloc(&self) -> TeamdResult<Box<dyn TeamHandle>>;
}
