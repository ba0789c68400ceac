//! Event bus.
//!
//! Subscribers register an [`EventWatch`] together with the set of event
//! kinds they care about and are called in subscription order. Only
//! `port_added` can fail: the first error stops the notification and
//! aborts the port add, and the subscribers that had already accepted the
//! port get `port_add_aborted`. Every other kind reports a state change
//! the kernel has already made, so subscriber errors are logged and the
//! remaining subscribers still run.

use crate::context::TeamdContext;
use crate::error::{TeamdError, TeamdResult};
use crate::kernel::TeamOption;
use crate::ports::TeamdPort;
use std::fmt;
use std::ops::BitOr;
use std::rc::Rc;
use tracing::{trace, warn};

/// Notification kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    HwaddrChanged,
    IfnameChanged,
    PortAdded,
    PortRemoved,
    PortChanged,
    PortLinkChanged,
    PortHwaddrChanged,
    PortIfnameChanged,
    OptionChanged,
}

impl EventKind {
    pub const ALL: [EventKind; 9] = [
        EventKind::HwaddrChanged,
        EventKind::IfnameChanged,
        EventKind::PortAdded,
        EventKind::PortRemoved,
        EventKind::PortChanged,
        EventKind::PortLinkChanged,
        EventKind::PortHwaddrChanged,
        EventKind::PortIfnameChanged,
        EventKind::OptionChanged,
    ];

    const fn bit(self) -> u16 {
        1 << (self as u16)
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            EventKind::HwaddrChanged => "hwaddr_changed",
            EventKind::IfnameChanged => "ifname_changed",
            EventKind::PortAdded => "port_added",
            EventKind::PortRemoved => "port_removed",
            EventKind::PortChanged => "port_changed",
            EventKind::PortLinkChanged => "port_link_changed",
            EventKind::PortHwaddrChanged => "port_hwaddr_changed",
            EventKind::PortIfnameChanged => "port_ifname_changed",
            EventKind::OptionChanged => "option_changed",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Set of [`EventKind`]s a subscriber is called for.
///
/// ```
/// use teamd::events::{EventKind, EventKinds};
///
/// let kinds = EventKind::PortAdded | EventKind::PortRemoved;
/// assert!(kinds.contains(EventKind::PortAdded));
/// assert!(!kinds.contains(EventKind::OptionChanged));
/// ```
#[derive(Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct EventKinds(u16);

impl EventKinds {
    pub const fn empty() -> Self {
        EventKinds(0)
    }

    pub const fn all() -> Self {
        EventKinds((1 << EventKind::ALL.len()) - 1)
    }

    pub const fn with(self, kind: EventKind) -> Self {
        EventKinds(self.0 | kind.bit())
    }

    pub const fn contains(self, kind: EventKind) -> bool {
        self.0 & kind.bit() != 0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn iter(self) -> impl Iterator<Item = EventKind> {
        EventKind::ALL.into_iter().filter(move |k| self.contains(*k))
    }
}

impl From<EventKind> for EventKinds {
    fn from(kind: EventKind) -> Self {
        EventKinds::empty().with(kind)
    }
}

impl FromIterator<EventKind> for EventKinds {
    fn from_iter<I: IntoIterator<Item = EventKind>>(iter: I) -> Self {
        iter.into_iter().fold(EventKinds::empty(), EventKinds::with)
    }
}

impl BitOr for EventKind {
    type Output = EventKinds;

    fn bitor(self, rhs: EventKind) -> EventKinds {
        EventKinds::from(self).with(rhs)
    }
}

impl BitOr<EventKind> for EventKinds {
    type Output = EventKinds;

    fn bitor(self, rhs: EventKind) -> EventKinds {
        self.with(rhs)
    }
}

impl fmt::Debug for EventKinds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter().map(|k| k.as_str())).finish()
    }
}

/// Event subscriber.
///
/// Only the methods for subscribed kinds are called. Subscribers hold
/// their own state behind interior mutability since they are shared with
/// the bus.
pub trait EventWatch {
    /// Name used in logs and veto errors.
    fn name(&self) -> &str;

    fn hwaddr_changed(&self, _ctx: &mut TeamdContext) -> TeamdResult<()> {
        Ok(())
    }

    fn ifname_changed(&self, _ctx: &mut TeamdContext) -> TeamdResult<()> {
        Ok(())
    }

    /// Called before `port` becomes visible in the registry. An error
    /// aborts the add.
    fn port_added(&self, _ctx: &mut TeamdContext, _port: &TeamdPort) -> TeamdResult<()> {
        Ok(())
    }

    /// Called when a later subscriber vetoed a `port_added` this one
    /// accepted. `port` never reached the registry and no `port_removed`
    /// follows; its private data is dropped right after.
    fn port_add_aborted(&self, _ctx: &mut TeamdContext, _port: &TeamdPort) -> TeamdResult<()> {
        Ok(())
    }

    /// Called after `port` has left the registry, before its private data
    /// is dropped.
    fn port_removed(&self, _ctx: &mut TeamdContext, _port: &TeamdPort) -> TeamdResult<()> {
        Ok(())
    }

    fn port_changed(&self, _ctx: &mut TeamdContext, _port: &TeamdPort) -> TeamdResult<()> {
        Ok(())
    }

    fn port_link_changed(&self, _ctx: &mut TeamdContext, _port: &TeamdPort) -> TeamdResult<()> {
        Ok(())
    }

    fn port_hwaddr_changed(&self, _ctx: &mut TeamdContext, _port: &TeamdPort) -> TeamdResult<()> {
        Ok(())
    }

    fn port_ifname_changed(&self, _ctx: &mut TeamdContext, _port: &TeamdPort) -> TeamdResult<()> {
        Ok(())
    }

    fn option_changed(&self, _ctx: &mut TeamdContext, _option: &TeamOption) -> TeamdResult<()> {
        Ok(())
    }

    /// Restricts `option_changed` to one option name.
    fn option_changed_match_name(&self) -> Option<&str> {
        None
    }
}

/// Subscription handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatchId(u64);

struct WatchEntry {
    id: WatchId,
    kinds: EventKinds,
    watch: Rc<dyn EventWatch>,
}

#[derive(Default)]
pub struct EventBus {
    watches: Vec<WatchEntry>,
    next_id: u64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a subscriber.
    pub fn subscribe(&mut self, kinds: impl Into<EventKinds>, watch: Rc<dyn EventWatch>) -> WatchId {
        let id = WatchId(self.next_id);
        self.next_id += 1;
        let kinds = kinds.into();
        trace!(watch = watch.name(), ?kinds, "Subscribing event watch");
        self.watches.push(WatchEntry { id, kinds, watch });
        id
    }

    /// Removes a subscriber. Returns false if it was not subscribed.
    pub fn unsubscribe(&mut self, id: WatchId) -> bool {
        let before = self.watches.len();
        self.watches.retain(|w| w.id != id);
        before != self.watches.len()
    }

    pub fn is_subscribed(&self, id: WatchId) -> bool {
        self.watches.iter().any(|w| w.id == id)
    }

    pub fn len(&self) -> usize {
        self.watches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.watches.is_empty()
    }

    fn snapshot(&self, kind: EventKind) -> Vec<(WatchId, Rc<dyn EventWatch>)> {
        self.watches
            .iter()
            .filter(|w| w.kinds.contains(kind))
            .map(|w| (w.id, Rc::clone(&w.watch)))
            .collect()
    }
}

impl TeamdContext {
    /// Calls `call` for every subscriber of `kind` in subscription order,
    /// logging failures. Subscribers removed by an earlier subscriber in
    /// the same notification are skipped.
    fn notify<F>(&mut self, kind: EventKind, mut call: F)
    where
        F: FnMut(&dyn EventWatch, &mut TeamdContext) -> TeamdResult<()>,
    {
        for (id, watch) in self.events.snapshot(kind) {
            if !self.events.is_subscribed(id) {
                continue;
            }
            trace!(watch = watch.name(), event = %kind, "Dispatching event");
            if let Err(e) = call(watch.as_ref(), self) {
                warn!(watch = watch.name(), event = %kind, error = %e, "Event watch failed");
            }
        }
    }

    /// Publishes `port_added`. The first failing subscriber vetoes the
    /// port; the ones that accepted it before are told the add was
    /// aborted, in subscription order.
    pub fn emit_port_added(&mut self, port: &TeamdPort) -> TeamdResult<()> {
        let kind = EventKind::PortAdded;
        let mut accepted: Vec<Rc<dyn EventWatch>> = Vec::new();
        for (id, watch) in self.events.snapshot(kind) {
            if !self.events.is_subscribed(id) {
                continue;
            }
            trace!(watch = watch.name(), event = %kind, "Dispatching event");
            if let Err(e) = watch.port_added(self, port) {
                for earlier in &accepted {
                    if let Err(e) = earlier.port_add_aborted(self, port) {
                        warn!(watch = earlier.name(), port = %port.ifname, error = %e, "Abort handler failed");
                    }
                }
                return Err(TeamdError::Vetoed {
                    subscriber: watch.name().to_string(),
                    source: Box::new(e),
                });
            }
            accepted.push(watch);
        }
        Ok(())
    }

    pub fn emit_port_removed(&mut self, port: &TeamdPort) {
        self.notify(EventKind::PortRemoved, |w, ctx| w.port_removed(ctx, port))
    }

    pub fn emit_port_changed(&mut self, port: &TeamdPort) {
        self.notify(EventKind::PortChanged, |w, ctx| w.port_changed(ctx, port))
    }

    pub fn emit_port_link_changed(&mut self, port: &TeamdPort) {
        self.notify(EventKind::PortLinkChanged, |w, ctx| w.port_link_changed(ctx, port))
    }

    pub fn emit_port_hwaddr_changed(&mut self, port: &TeamdPort) {
        self.notify(EventKind::PortHwaddrChanged, |w, ctx| w.port_hwaddr_changed(ctx, port))
    }

    pub fn emit_port_ifname_changed(&mut self, port: &TeamdPort) {
        self.notify(EventKind::PortIfnameChanged, |w, ctx| w.port_ifname_changed(ctx, port))
    }

    pub fn emit_hwaddr_changed(&mut self) {
        self.notify(EventKind::HwaddrChanged, |w, ctx| w.hwaddr_changed(ctx))
    }

    pub fn emit_ifname_changed(&mut self) {
        self.notify(EventKind::IfnameChanged, |w, ctx| w.ifname_changed(ctx))
    }

    pub fn emit_option_changed(&mut self, option: &TeamOption) {
        self.notify(EventKind::OptionChanged, |w, ctx| {
            match w.option_changed_match_name() {
                Some(name) if name != option.name => Ok(()),
                _ => w.option_changed(ctx, option),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ContextOptions, TeamdContext};
    use crate::kernel::mock::MockTeam;
    use crate::kernel::{OptionValue, TeamPortInfo};
    use std::cell::RefCell;

    type Log = Rc<RefCell<Vec<String>>>;

    struct Recorder {
        name: &'static str,
        log: Log,
        fail_add: bool,
        only_option: Option<&'static str>,
    }

    impl Recorder {
        fn new(name: &'static str, log: &Log) -> Rc<Self> {
            Rc::new(Self {
                name,
                log: log.clone(),
                fail_add: false,
                only_option: None,
            })
        }
    }

    impl EventWatch for Recorder {
        fn name(&self) -> &str {
            self.name
        }

        fn port_added(&self, _ctx: &mut TeamdContext, port: &TeamdPort) -> TeamdResult<()> {
            self.log.borrow_mut().push(format!("{} added {}", self.name, port.ifname));
            if self.fail_add {
                return Err(TeamdError::invalid_state("refused"));
            }
            Ok(())
        }

        fn port_add_aborted(&self, _ctx: &mut TeamdContext, port: &TeamdPort) -> TeamdResult<()> {
            self.log.borrow_mut().push(format!("{} aborted {}", self.name, port.ifname));
            Ok(())
        }

        fn port_removed(&self, _ctx: &mut TeamdContext, port: &TeamdPort) -> TeamdResult<()> {
            self.log.borrow_mut().push(format!("{} removed {}", self.name, port.ifname));
            Err(TeamdError::invalid_state("ignored"))
        }

        fn option_changed(&self, _ctx: &mut TeamdContext, option: &TeamOption) -> TeamdResult<()> {
            self.log.borrow_mut().push(format!("{} option {}", self.name, option.name));
            Ok(())
        }

        fn option_changed_match_name(&self) -> Option<&str> {
            self.only_option
        }
    }

    fn context() -> TeamdContext {
        TeamdContext::new(ContextOptions::default(), Box::new(MockTeam::new()))
    }

    fn eth0() -> TeamdPort {
        TeamdPort::from(TeamPortInfo::new(7, "eth0"))
    }

    #[test]
    fn test_event_kinds_set() {
        let kinds: EventKinds = [EventKind::PortAdded, EventKind::OptionChanged].into_iter().collect();
        assert!(kinds.contains(EventKind::OptionChanged));
        assert!(!kinds.contains(EventKind::PortRemoved));
        assert_eq!(kinds.iter().count(), 2);
        assert_eq!(EventKinds::all().iter().count(), EventKind::ALL.len());
        assert!(EventKinds::empty().is_empty());
        assert_eq!(format!("{:?}", kinds), r#"{"port_added", "option_changed"}"#);
    }

    #[test]
    fn test_port_added_veto_stops_dispatch() {
        let mut ctx = context();
        let log: Log = Rc::default();
        ctx.events_mut().subscribe(EventKinds::all(), Recorder::new("first", &log));
        ctx.events_mut().subscribe(
            EventKind::PortAdded,
            Rc::new(Recorder {
                name: "second",
                log: log.clone(),
                fail_add: true,
                only_option: None,
            }),
        );
        ctx.events_mut().subscribe(EventKinds::all(), Recorder::new("third", &log));

        let err = ctx.emit_port_added(&eth0()).unwrap_err();
        assert!(matches!(err, TeamdError::Vetoed { ref subscriber, .. } if subscriber == "second"));
        // Only the subscriber that accepted the port hears about the abort.
        assert_eq!(
            *log.borrow(),
            vec!["first added eth0", "second added eth0", "first aborted eth0"]
        );
    }

    #[test]
    fn test_removal_errors_do_not_stop_dispatch() {
        let mut ctx = context();
        let log: Log = Rc::default();
        ctx.events_mut().subscribe(EventKind::PortRemoved, Recorder::new("a", &log));
        ctx.events_mut().subscribe(EventKind::PortAdded, Recorder::new("skipped", &log));
        ctx.events_mut().subscribe(EventKind::PortRemoved, Recorder::new("b", &log));

        ctx.emit_port_removed(&eth0());
        assert_eq!(*log.borrow(), vec!["a removed eth0", "b removed eth0"]);
    }

    #[test]
    fn test_option_name_filter() {
        let mut ctx = context();
        let log: Log = Rc::default();
        ctx.events_mut().subscribe(EventKind::OptionChanged, Recorder::new("any", &log));
        ctx.events_mut().subscribe(
            EventKind::OptionChanged,
            Rc::new(Recorder {
                name: "mode-only",
                log: log.clone(),
                fail_add: false,
                only_option: Some("mode"),
            }),
        );

        ctx.emit_option_changed(&TeamOption::new("activeport", OptionValue::U32(3)));
        ctx.emit_option_changed(&TeamOption::new("mode", OptionValue::String("roundrobin".into())));
        assert_eq!(
            *log.borrow(),
            vec!["any option activeport", "any option mode", "mode-only option mode"]
        );
    }

    struct Unsubscriber {
        victim: RefCell<Option<WatchId>>,
    }

    impl EventWatch for Unsubscriber {
        fn name(&self) -> &str {
            "unsubscriber"
        }

        fn port_changed(&self, ctx: &mut TeamdContext, _port: &TeamdPort) -> TeamdResult<()> {
            if let Some(id) = self.victim.borrow_mut().take() {
                ctx.events_mut().unsubscribe(id);
            }
            Ok(())
        }
    }

    #[test]
    fn test_unsubscribed_mid_dispatch_is_skipped() {
        let mut ctx = context();
        let log: Log = Rc::default();
        let killer = Rc::new(Unsubscriber { victim: RefCell::new(None) });
        ctx.events_mut().subscribe(EventKind::PortChanged, killer.clone());

        struct Changed(Log);
        impl EventWatch for Changed {
            fn name(&self) -> &str {
                "changed"
            }
            fn port_changed(&self, _ctx: &mut TeamdContext, port: &TeamdPort) -> TeamdResult<()> {
                self.0.borrow_mut().push(port.ifname.clone());
                Ok(())
            }
        }
        let victim = ctx.events_mut().subscribe(EventKind::PortChanged, Rc::new(Changed(log.clone())));
        *killer.victim.borrow_mut() = Some(victim);

        ctx.emit_port_changed(&eth0());
        assert!(log.borrow().is_empty());
        assert!(!ctx.events().is_subscribed(victim));
    }
}
