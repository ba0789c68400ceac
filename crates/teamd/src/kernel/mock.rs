//! In-memory kernel backend.
//!
//! `MockTeam` plays the kernel: it owns a table of interfaces, tracks team
//! membership, journals every state-changing request and fails any request
//! on demand. Cloning a `MockTeam` shares the same state, so a test keeps
//! one clone for inspection and hands another to the daemon as its
//! [`TeamHandleFactory`].
//!
//! Queued [`TeamChange`]s make the event descriptor readable, exactly like
//! pending netlink messages would.

use super::{TeamChange, TeamHandle, TeamHandleFactory, TeamOption, TeamPortInfo};
use crate::error::{TeamdError, TeamdResult};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::io::{ErrorKind, Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::rc::Rc;
use teamd_types::HwAddr;

const DEFAULT_HWADDR_LEN: usize = 6;
const FIRST_IFINDEX: u32 = 2;

#[derive(Debug)]
struct Fault {
    operation: String,
    target: Option<String>,
}

#[derive(Debug, Default)]
struct MockState {
    journal: Vec<String>,
    faults: Vec<Fault>,
    links: Vec<TeamPortInfo>,
    team: Option<u32>,
    team_hwaddr_len: usize,
    members: Vec<u32>,
    options: Vec<TeamOption>,
    next_ifindex: u32,
    pending: VecDeque<TeamChange>,
    notifier: Option<UnixStream>,
}

impl MockState {
    fn link(&self, ifindex: u32) -> Option<&TeamPortInfo> {
        self.links.iter().find(|l| l.ifindex == ifindex)
    }

    fn link_mut(&mut self, ifindex: u32) -> Option<&mut TeamPortInfo> {
        self.links.iter_mut().find(|l| l.ifindex == ifindex)
    }

    fn ifindex_of(&self, ifname: &str) -> Option<u32> {
        self.links.iter().find(|l| l.ifname == ifname).map(|l| l.ifindex)
    }

    fn name_of(&self, ifindex: u32) -> String {
        self.link(ifindex)
            .map(|l| l.ifname.clone())
            .unwrap_or_else(|| ifindex.to_string())
    }

    fn add_link(&mut self, ifname: &str) -> u32 {
        if self.next_ifindex == 0 {
            self.next_ifindex = FIRST_IFINDEX;
        }
        let ifindex = self.next_ifindex;
        self.next_ifindex += 1;
        let mut info = TeamPortInfo::new(ifindex, ifname);
        info.hwaddr = Some(HwAddr::new(vec![0x02, 0, 0, 0, 0, ifindex as u8]));
        self.links.push(info);
        ifindex
    }

    fn check(&self, operation: &str, target: &str) -> TeamdResult<()> {
        let hit = self.faults.iter().any(|f| {
            f.operation == operation && f.target.as_deref().map_or(true, |t| t == target)
        });
        if hit {
            Err(TeamdError::kernel(operation, format!("injected failure for {}", target)))
        } else {
            Ok(())
        }
    }

    fn record(&mut self, entry: String) {
        self.journal.push(entry);
    }

    fn queue(&mut self, change: TeamChange) {
        self.pending.push_back(change);
        if let Some(notifier) = self.notifier.as_mut() {
            // A full socket buffer still leaves the descriptor readable.
            let _ = notifier.write(&[1]);
        }
    }
}

/// Shared in-memory kernel.
#[derive(Debug, Clone, Default)]
pub struct MockTeam {
    state: Rc<RefCell<MockState>>,
}

impl MockTeam {
    pub fn new() -> Self {
        Self::default()
    }

    /// Kernel with the given non-member interfaces.
    pub fn with_links<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let team = Self::new();
        for name in names {
            team.add_link(name.as_ref());
        }
        team
    }

    /// Adds an interface and returns its ifindex.
    pub fn add_link(&self, ifname: &str) -> u32 {
        self.state.borrow_mut().add_link(ifname)
    }

    /// Makes every `operation` request fail.
    pub fn fail(&self, operation: &str) {
        self.state.borrow_mut().faults.push(Fault {
            operation: operation.to_string(),
            target: None,
        });
    }

    /// Makes `operation` fail for one interface or team name.
    pub fn fail_on(&self, operation: &str, target: &str) {
        self.state.borrow_mut().faults.push(Fault {
            operation: operation.to_string(),
            target: Some(target.to_string()),
        });
    }

    pub fn clear_faults(&self) {
        self.state.borrow_mut().faults.clear();
    }

    /// State-changing requests in the order they were made.
    pub fn journal(&self) -> Vec<String> {
        self.state.borrow().journal.clone()
    }

    pub fn clear_journal(&self) {
        self.state.borrow_mut().journal.clear();
    }

    /// Number of journal entries equal to `entry`.
    pub fn count(&self, entry: &str) -> usize {
        self.state.borrow().journal.iter().filter(|e| *e == entry).count()
    }

    pub fn team_exists(&self) -> bool {
        self.state.borrow().team.is_some()
    }

    /// Names of the current members in join order.
    pub fn members(&self) -> Vec<String> {
        let state = self.state.borrow();
        state.members.iter().map(|i| state.name_of(*i)).collect()
    }

    pub fn ifindex(&self, ifname: &str) -> Option<u32> {
        self.state.borrow().ifindex_of(ifname)
    }

    /// Last value set for a device-wide or port option.
    pub fn option(&self, name: &str, port_ifindex: Option<u32>) -> Option<TeamOption> {
        self.state
            .borrow()
            .options
            .iter()
            .rev()
            .find(|o| o.name == name && o.port_ifindex == port_ifindex)
            .cloned()
    }

    pub fn set_hwaddr_len(&self, len: usize) {
        self.state.borrow_mut().team_hwaddr_len = len;
    }

    /// Changes the carrier of an interface, notifying if it is a member.
    pub fn set_link(&self, ifname: &str, link_up: bool) {
        let mut state = self.state.borrow_mut();
        let Some(ifindex) = state.ifindex_of(ifname) else {
            return;
        };
        if let Some(link) = state.link_mut(ifindex) {
            link.link_up = link_up;
        }
        if state.members.contains(&ifindex) {
            state.queue(TeamChange::PortLinkChanged { ifindex, link_up });
        }
    }

    /// Makes a member leave without a request from the daemon.
    pub fn unplug(&self, ifname: &str) {
        let mut state = self.state.borrow_mut();
        let Some(ifindex) = state.ifindex_of(ifname) else {
            return;
        };
        state.members.retain(|m| *m != ifindex);
        state.queue(TeamChange::PortDisappeared { ifindex });
    }

    /// Queues an arbitrary notification.
    pub fn inject(&self, change: TeamChange) {
        self.state.borrow_mut().queue(change);
    }
}

impl TeamHandleFactory for MockTeam {
    fn alloc(&self) -> TeamdResult<Box<dyn TeamHandle>> {
        let mut state = self.state.borrow_mut();
        state.check("alloc", "")?;
        let (notifier, events) = UnixStream::pair()?;
        events.set_nonblocking(true)?;
        notifier.set_nonblocking(true)?;
        state.notifier = Some(notifier);
        state.record("alloc".to_string());
        Ok(Box::new(MockTeamHandle {
            team: self.clone(),
            team_name: None,
            events,
        }))
    }
}

/// Handle allocated by [`MockTeam`].
#[derive(Debug)]
pub struct MockTeamHandle {
    team: MockTeam,
    team_name: Option<String>,
    events: UnixStream,
}

impl MockTeamHandle {
    fn state(&self) -> std::cell::RefMut<'_, MockState> {
        self.team.state.borrow_mut()
    }
}

impl TeamHandle for MockTeamHandle {
    fn create(&mut self, team_name: &str) -> TeamdResult<()> {
        let mut state = self.state();
        state.check("create", team_name)?;
        if state.ifindex_of(team_name).is_some() {
            return Err(TeamdError::kernel("create", format!("{} exists", team_name)));
        }
        let ifindex = state.add_link(team_name);
        state.team = Some(ifindex);
        if state.team_hwaddr_len == 0 {
            state.team_hwaddr_len = DEFAULT_HWADDR_LEN;
        }
        state.record(format!("create {}", team_name));
        drop(state);
        self.team_name = Some(team_name.to_string());
        Ok(())
    }

    fn recreate(&mut self, team_name: &str) -> TeamdResult<()> {
        let mut state = self.state();
        state.check("recreate", team_name)?;
        if let Some(old) = state.ifindex_of(team_name) {
            state.links.retain(|l| l.ifindex != old);
        }
        let ifindex = state.add_link(team_name);
        state.team = Some(ifindex);
        state.members.clear();
        if state.team_hwaddr_len == 0 {
            state.team_hwaddr_len = DEFAULT_HWADDR_LEN;
        }
        state.record(format!("recreate {}", team_name));
        drop(state);
        self.team_name = Some(team_name.to_string());
        Ok(())
    }

    fn destroy(&mut self) -> TeamdResult<()> {
        let name = self.team_name.clone().unwrap_or_default();
        let mut state = self.state();
        state.check("destroy", &name)?;
        if let Some(team) = state.team.take() {
            state.links.retain(|l| l.ifindex != team);
        }
        state.members.clear();
        state.record(format!("destroy {}", name));
        Ok(())
    }

    fn init(&mut self, ifindex: u32) -> TeamdResult<()> {
        let mut state = self.state();
        let name = state.name_of(ifindex);
        state.check("init", &name)?;
        state.record(format!("init {}", name));
        Ok(())
    }

    fn ifname_to_ifindex(&self, ifname: &str) -> TeamdResult<Option<u32>> {
        let state = self.team.state.borrow();
        state.check("ifname_to_ifindex", ifname)?;
        Ok(state.ifindex_of(ifname))
    }

    fn ifindex_to_ifname(&self, ifindex: u32) -> TeamdResult<Option<String>> {
        let state = self.team.state.borrow();
        Ok(state.link(ifindex).map(|l| l.ifname.clone()))
    }

    fn hwaddr_len(&self, ifindex: u32) -> TeamdResult<usize> {
        let state = self.team.state.borrow();
        state.check("hwaddr_len", &state.name_of(ifindex))?;
        Ok(state.team_hwaddr_len)
    }

    fn hwaddr_set(&mut self, ifindex: u32, hwaddr: &HwAddr) -> TeamdResult<()> {
        let mut state = self.state();
        let name = state.name_of(ifindex);
        state.check("hwaddr_set", &name)?;
        if let Some(link) = state.link_mut(ifindex) {
            link.hwaddr = Some(hwaddr.clone());
        }
        state.record(format!("hwaddr_set {} {}", name, hwaddr));
        Ok(())
    }

    fn set_option(&mut self, option: &TeamOption) -> TeamdResult<()> {
        let mut state = self.state();
        state.check("set_option", &option.name)?;
        let entry = match option.port_ifindex {
            Some(port) => format!(
                "set_option {} {} {}",
                option.name,
                state.name_of(port),
                option.value
            ),
            None => format!("set_option {} {}", option.name, option.value),
        };
        state.options.push(option.clone());
        state.record(entry);
        Ok(())
    }

    fn port_add(&mut self, ifindex: u32) -> TeamdResult<()> {
        let mut state = self.state();
        let name = state.name_of(ifindex);
        state.check("port_add", &name)?;
        let info = state
            .link(ifindex)
            .cloned()
            .ok_or_else(|| TeamdError::kernel("port_add", format!("no interface {}", ifindex)))?;
        if state.members.contains(&ifindex) {
            return Err(TeamdError::kernel("port_add", format!("{} is busy", name)));
        }
        state.members.push(ifindex);
        state.record(format!("port_add {}", name));
        state.queue(TeamChange::PortAppeared(info));
        Ok(())
    }

    fn port_remove(&mut self, ifindex: u32) -> TeamdResult<()> {
        let mut state = self.state();
        let name = state.name_of(ifindex);
        state.check("port_remove", &name)?;
        state.record(format!("port_remove {}", name));
        if state.members.contains(&ifindex) {
            state.members.retain(|m| *m != ifindex);
            // An undelivered appearance cancels out with the removal.
            let before = state.pending.len();
            state
                .pending
                .retain(|c| !matches!(c, TeamChange::PortAppeared(info) if info.ifindex == ifindex));
            if state.pending.len() == before {
                state.queue(TeamChange::PortDisappeared { ifindex });
            }
        }
        Ok(())
    }

    fn port_info(&self, ifindex: u32) -> TeamdResult<TeamPortInfo> {
        let state = self.team.state.borrow();
        state.check("port_info", &state.name_of(ifindex))?;
        state
            .link(ifindex)
            .cloned()
            .ok_or_else(|| TeamdError::kernel("port_info", format!("no interface {}", ifindex)))
    }

    fn event_fd(&self) -> RawFd {
        self.events.as_raw_fd()
    }

    fn process_events(&mut self) -> TeamdResult<Vec<TeamChange>> {
        let mut buf = [0u8; 64];
        loop {
            match self.events.read(&mut buf) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(TeamdError::DeviceDesync(e.to_string())),
            }
        }
        let mut state = self.state();
        state.check("process_events", "")?;
        Ok(state.pending.drain(..).collect())
    }

    fn free(self: Box<Self>) {
        let mut state = self.team.state.borrow_mut();
        state.notifier = None;
        state.pending.clear();
        state.record("free".to_string());
    }
}
