//! Recording event subscribers
//!
//! [`RecordingWatch`] appends one line per notification to a shared
//! [`EventLog`], can refuse `port_added` for a chosen port and can attach
//! a [`Finalizer`] to every port it accepts. Finalizers log when their
//! private block is dropped, which makes attach/destroy order observable.

use std::cell::RefCell;
use std::rc::Rc;
use teamd::{
    EventKind, EventKinds, EventWatch, OwnerId, TeamOption, TeamdContext, TeamdError, TeamdPort,
    TeamdResult, WatchId,
};

/// Shared, ordered record of notifications.
#[derive(Debug, Clone, Default)]
pub struct EventLog(Rc<RefCell<Vec<String>>>);

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, entry: impl Into<String>) {
        self.0.borrow_mut().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.borrow().clone()
    }

    /// Entries starting with `prefix`.
    pub fn matching(&self, prefix: &str) -> Vec<String> {
        self.0
            .borrow()
            .iter()
            .filter(|e| e.starts_with(prefix))
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.0.borrow_mut().clear();
    }

    pub fn len(&self) -> usize {
        self.0.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.borrow().is_empty()
    }
}

/// Per-port private block that logs `drop <label>` when destroyed.
#[derive(Debug)]
pub struct Finalizer {
    pub label: String,
    log: EventLog,
}

impl Finalizer {
    pub fn new(label: impl Into<String>, log: &EventLog) -> Self {
        Self {
            label: label.into(),
            log: log.clone(),
        }
    }
}

impl Drop for Finalizer {
    fn drop(&mut self) {
        self.log.push(format!("drop {}", self.label));
    }
}

/// Event subscriber recording `<name> <event> <subject>` lines.
pub struct RecordingWatch {
    name: String,
    log: EventLog,
    veto: RefCell<Option<String>>,
    priv_owner: Option<OwnerId>,
    option_filter: Option<String>,
}

impl RecordingWatch {
    pub fn new(name: &str, log: &EventLog) -> Self {
        Self {
            name: name.to_string(),
            log: log.clone(),
            veto: RefCell::new(None),
            priv_owner: None,
            option_filter: None,
        }
    }

    /// Attaches a [`Finalizer`] labelled `<name>:<ifname>` under `owner`
    /// to every accepted port.
    pub fn with_priv(mut self, owner: OwnerId) -> Self {
        self.priv_owner = Some(owner);
        self
    }

    /// Only receive `option_changed` for `name`.
    pub fn with_option_filter(mut self, name: &str) -> Self {
        self.option_filter = Some(name.to_string());
        self
    }

    /// Refuses `port_added` for `ifname`.
    pub fn veto(&self, ifname: &str) {
        *self.veto.borrow_mut() = Some(ifname.to_string());
    }

    pub fn clear_veto(&self) {
        *self.veto.borrow_mut() = None;
    }

    fn record(&self, event: &str, subject: &str) {
        self.log.push(format!("{} {} {}", self.name, event, subject));
    }
}

impl EventWatch for RecordingWatch {
    fn name(&self) -> &str {
        &self.name
    }

    fn hwaddr_changed(&self, ctx: &mut TeamdContext) -> TeamdResult<()> {
        let hwaddr = ctx.hwaddr().map(|h| h.to_string()).unwrap_or_default();
        self.record("hwaddr_changed", &hwaddr);
        Ok(())
    }

    fn ifname_changed(&self, ctx: &mut TeamdContext) -> TeamdResult<()> {
        self.record("ifname_changed", ctx.team_name().unwrap_or_default());
        Ok(())
    }

    fn port_added(&self, ctx: &mut TeamdContext, port: &TeamdPort) -> TeamdResult<()> {
        if self.veto.borrow().as_deref() == Some(port.ifname.as_str()) {
            self.record("veto", &port.ifname);
            return Err(TeamdError::invalid_state(format!("{} refuses {}", self.name, port.ifname)));
        }
        self.record("port_added", &port.ifname);
        if let Some(owner) = self.priv_owner {
            let finalizer = Finalizer::new(format!("{}:{}", self.name, port.ifname), &self.log);
            ctx.ports_mut().priv_create(port.ifindex, owner, finalizer)?;
        }
        Ok(())
    }

    fn port_removed(&self, _ctx: &mut TeamdContext, port: &TeamdPort) -> TeamdResult<()> {
        self.record("port_removed", &port.ifname);
        Ok(())
    }

    fn port_changed(&self, _ctx: &mut TeamdContext, port: &TeamdPort) -> TeamdResult<()> {
        self.record("port_changed", &port.ifname);
        Ok(())
    }

    fn port_link_changed(&self, _ctx: &mut TeamdContext, port: &TeamdPort) -> TeamdResult<()> {
        self.record("port_link_changed", &port.ifname);
        Ok(())
    }

    fn port_hwaddr_changed(&self, _ctx: &mut TeamdContext, port: &TeamdPort) -> TeamdResult<()> {
        self.record("port_hwaddr_changed", &port.ifname);
        Ok(())
    }

    fn port_ifname_changed(&self, _ctx: &mut TeamdContext, port: &TeamdPort) -> TeamdResult<()> {
        self.record("port_ifname_changed", &port.ifname);
        Ok(())
    }

    fn option_changed(&self, _ctx: &mut TeamdContext, option: &TeamOption) -> TeamdResult<()> {
        self.record("option_changed", &option.name);
        Ok(())
    }

    fn option_changed_match_name(&self) -> Option<&str> {
        self.option_filter.as_deref()
    }
}

/// Subscribes a new recorder named `name` for `kinds`.
pub fn subscribe_recorder(
    ctx: &mut TeamdContext,
    name: &str,
    kinds: impl Into<EventKinds>,
    log: &EventLog,
) -> (Rc<RecordingWatch>, WatchId) {
    let watch = Rc::new(RecordingWatch::new(name, log));
    let id = ctx.events_mut().subscribe(kinds, watch.clone());
    (watch, id)
}

/// Subscribes a recorder for every event kind that attaches finalizers
/// under a fresh owner.
pub fn subscribe_priv_recorder(
    ctx: &mut TeamdContext,
    name: &'static str,
    log: &EventLog,
) -> (Rc<RecordingWatch>, OwnerId) {
    let owner = ctx.new_owner(name);
    let watch = Rc::new(RecordingWatch::new(name, log).with_priv(owner));
    ctx.events_mut().subscribe(EventKinds::all(), watch.clone());
    (watch, owner)
}

/// Port events most tests care about.
pub fn port_events() -> EventKinds {
    EventKind::PortAdded | EventKind::PortRemoved | EventKind::PortChanged | EventKind::PortLinkChanged
}
