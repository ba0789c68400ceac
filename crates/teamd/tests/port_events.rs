//! Port registry and event bus integration tests
//!
//! Covers port add/remove through the kernel layer, `port_added`
//! ordering and veto, private data finalization and kernel-initiated
//! topology changes.

use pretty_assertions::assert_eq;
use teamd::{EventKind, HwAddr, TeamChange, TeamdContext, TeamdError};
use teamd_test::{
    assert_absent, assert_in_order, port_events, pump_kernel_events, subscribe_priv_recorder,
    subscribe_recorder, ConfigFixture, EventLog, MockTeam,
};

fn started(team: &MockTeam) -> TeamdContext {
    let mut ctx = ConfigFixture::new("team0").context(team);
    ctx.init().unwrap();
    ctx
}

#[test]
fn test_bulk_add_and_remove() {
    let names: Vec<String> = (0..16).map(|i| format!("eth{}", i)).collect();
    let team = MockTeam::with_links(&names);
    let mut ctx = started(&team);

    for name in &names {
        let port = ctx.port_add(name).unwrap();
        assert_eq!(&port.ifname, name);
    }
    assert_eq!(ctx.ports().count(), 16);
    assert_eq!(team.members(), names);
    let registered: Vec<&str> = ctx.ports().iter().map(|p| p.ifname.as_str()).collect();
    assert_eq!(registered, names.iter().map(String::as_str).collect::<Vec<_>>());

    for name in names.iter().step_by(2) {
        ctx.port_remove(name).unwrap();
    }
    assert_eq!(ctx.ports().count(), 8);
    assert!(ctx.ports().find_by_ifname("eth0").is_none());
    assert!(ctx.ports().find_by_ifname("eth1").is_some());

    // Queued appear/disappear notifications change nothing.
    pump_kernel_events(&mut ctx).unwrap();
    assert_eq!(ctx.ports().count(), 8);
    ctx.fini();
    assert!(team.members().is_empty());
}

#[test]
fn test_add_errors() {
    let team = MockTeam::with_links(["eth0"]);
    let mut ctx = started(&team);

    assert!(matches!(ctx.port_add("nosuch"), Err(TeamdError::PortNotFound(_))));
    ctx.port_add("eth0").unwrap();
    assert!(matches!(ctx.port_add("eth0"), Err(TeamdError::PortExists(_))));
    assert!(matches!(ctx.port_remove("eth1"), Err(TeamdError::PortNotFound(_))));

    team.fail_on("port_remove", "eth0");
    assert!(ctx.port_remove("eth0").is_err());
    assert!(ctx.ports().find_by_ifname("eth0").is_some());
    team.clear_faults();
    ctx.fini();
}

#[test]
fn test_port_added_in_subscription_order() {
    let team = MockTeam::with_links(["eth0"]);
    let mut ctx = started(&team);
    let log = EventLog::new();
    subscribe_recorder(&mut ctx, "first", port_events(), &log);
    subscribe_recorder(&mut ctx, "second", EventKind::PortAdded, &log);
    subscribe_recorder(&mut ctx, "third", port_events(), &log);

    ctx.port_add("eth0").unwrap();
    ctx.port_remove("eth0").unwrap();
    assert_eq!(
        log.entries(),
        vec![
            "first port_added eth0",
            "second port_added eth0",
            "third port_added eth0",
            "first port_removed eth0",
            "third port_removed eth0",
        ]
    );
}

#[test]
fn test_veto_aborts_add() {
    let team = MockTeam::with_links(["eth0", "eth1"]);
    let mut ctx = started(&team);
    let log = EventLog::new();
    let (_a, _) = subscribe_priv_recorder(&mut ctx, "a", &log);
    let (b, _) = subscribe_priv_recorder(&mut ctx, "b", &log);
    let (_c, _) = subscribe_priv_recorder(&mut ctx, "c", &log);

    ctx.port_add("eth0").unwrap();
    log.clear();
    b.veto("eth1");

    let err = ctx.port_add("eth1").unwrap_err();
    assert!(matches!(&err, TeamdError::Vetoed { subscriber, .. } if subscriber == "b"));
    assert_eq!(log.entries(), vec!["a port_added eth1", "b veto eth1", "drop a:eth1"]);
    assert!(ctx.ports().find_by_ifname("eth1").is_none());
    assert_eq!(team.members(), vec!["eth0"]);
    assert_in_order(&team.journal(), &["port_add eth1", "port_remove eth1"]).unwrap();

    // The stale kernel notifications for eth1 do not resurrect it.
    log.clear();
    pump_kernel_events(&mut ctx).unwrap();
    assert_absent(&log.entries(), "a port_added eth1").unwrap();
    assert!(ctx.ports().find_by_ifname("eth1").is_none());

    b.clear_veto();
    ctx.port_add("eth1").unwrap();
    assert_eq!(ctx.ports().count(), 2);
}

#[test]
fn test_private_data_outlives_removal_notification() {
    let team = MockTeam::with_links(["eth0", "eth1"]);
    let mut ctx = started(&team);
    let log = EventLog::new();
    let (_a, a_owner) = subscribe_priv_recorder(&mut ctx, "a", &log);
    let (_b, _) = subscribe_priv_recorder(&mut ctx, "b", &log);

    let eth0 = ctx.port_add("eth0").unwrap().ifindex;
    ctx.port_add("eth1").unwrap();
    assert_eq!(
        ctx.ports()
            .priv_get::<teamd_test::Finalizer>(eth0, a_owner)
            .map(|f| f.label.as_str()),
        Some("a:eth0")
    );
    log.clear();

    ctx.port_remove("eth0").unwrap();
    assert_eq!(
        log.entries(),
        vec!["a port_removed eth0", "b port_removed eth0", "drop a:eth0", "drop b:eth0"]
    );
    assert!(ctx.ports().priv_get::<teamd_test::Finalizer>(eth0, a_owner).is_none());
    assert_eq!(ctx.ports().privs_by_owner(a_owner).count(), 1);

    log.clear();
    ctx.fini();
    assert_eq!(
        log.entries(),
        vec!["a port_removed eth1", "b port_removed eth1", "drop a:eth1", "drop b:eth1"]
    );
}

#[test]
fn test_kernel_initiated_changes() {
    let team = MockTeam::with_links(["eth0", "eth1", "eth2"]);
    let mut ctx = started(&team);
    let log = EventLog::new();
    subscribe_recorder(&mut ctx, "rec", teamd::EventKinds::all(), &log);

    ctx.port_add("eth0").unwrap();
    ctx.port_add("eth1").unwrap();
    pump_kernel_events(&mut ctx).unwrap();
    log.clear();

    team.unplug("eth1");
    team.set_link("eth0", true);
    let eth0 = team.ifindex("eth0").unwrap();
    team.inject(TeamChange::PortHwaddrChanged {
        ifindex: eth0,
        hwaddr: HwAddr::new(vec![0x02, 0, 0, 0, 0, 0x99]),
    });
    team.inject(TeamChange::PortIfnameChanged {
        ifindex: eth0,
        ifname: "uplink0".to_string(),
    });
    team.inject(TeamChange::HwaddrChanged(HwAddr::new(vec![0x02, 0, 0, 0, 0, 0x01])));
    assert_eq!(pump_kernel_events(&mut ctx).unwrap(), 5);
    assert_eq!(
        log.entries(),
        vec![
            "rec port_removed eth1",
            // The link watch settles first and republishes the port.
            "rec port_changed eth0",
            "rec port_link_changed eth0",
            "rec port_hwaddr_changed eth0",
            "rec port_ifname_changed uplink0",
            "rec hwaddr_changed 02:00:00:00:00:01",
        ]
    );
    assert!(ctx.ports().find_by_ifname("eth1").is_none());
    let port = ctx.ports().find_by_ifname("uplink0").unwrap();
    assert!(port.link_up());
    assert_eq!(port.ifindex, eth0);

    // A port joined behind the daemon's back is adopted.
    let eth2 = team.ifindex("eth2").unwrap();
    let info = teamd::TeamPortInfo::new(eth2, "eth2");
    team.inject(TeamChange::PortAppeared(info));
    pump_kernel_events(&mut ctx).unwrap();
    assert!(ctx.ports().find_by_ifindex(eth2).is_some());
    ctx.fini();
}

#[test]
fn test_option_changed_name_filter() {
    let team = MockTeam::new();
    let mut ctx = started(&team);
    let log = EventLog::new();
    let all = std::rc::Rc::new(teamd_test::RecordingWatch::new("all", &log));
    let mode = std::rc::Rc::new(teamd_test::RecordingWatch::new("mode", &log).with_option_filter("mode"));
    ctx.events_mut().subscribe(EventKind::OptionChanged, all);
    ctx.events_mut().subscribe(EventKind::OptionChanged, mode);

    team.inject(TeamChange::OptionChanged(teamd::TeamOption::new(
        "mcast_rejoin_count",
        teamd::OptionValue::U32(1),
    )));
    team.inject(TeamChange::OptionChanged(teamd::TeamOption::new(
        "mode",
        teamd::OptionValue::String("roundrobin".to_string()),
    )));
    pump_kernel_events(&mut ctx).unwrap();
    assert_eq!(
        log.entries(),
        vec![
            "all option_changed mcast_rejoin_count",
            "all option_changed mode",
            "mode option_changed mode",
        ]
    );
}

#[test]
fn test_unsubscribe_during_notification() {
    use std::cell::RefCell;
    use std::rc::Rc;
    use teamd::{EventWatch, TeamdPort, TeamdResult, WatchId};

    struct Unsubscriber {
        victim: RefCell<Option<WatchId>>,
    }

    impl EventWatch for Unsubscriber {
        fn name(&self) -> &str {
            "unsubscriber"
        }

        fn port_added(&self, ctx: &mut TeamdContext, _port: &TeamdPort) -> TeamdResult<()> {
            if let Some(id) = self.victim.borrow_mut().take() {
                ctx.events_mut().unsubscribe(id);
            }
            Ok(())
        }
    }

    let team = MockTeam::with_links(["eth0"]);
    let mut ctx = started(&team);
    let log = EventLog::new();
    let unsubscriber = Rc::new(Unsubscriber {
        victim: RefCell::new(None),
    });
    ctx.events_mut().subscribe(EventKind::PortAdded, unsubscriber.clone());
    let (_, victim) = subscribe_recorder(&mut ctx, "victim", EventKind::PortAdded, &log);
    *unsubscriber.victim.borrow_mut() = Some(victim);

    ctx.port_add("eth0").unwrap();
    assert!(log.is_empty());
    assert!(!ctx.events().is_subscribed(victim));
}
