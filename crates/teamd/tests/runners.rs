//! Runner, link watch and state dump integration tests

use pretty_assertions::assert_eq;
use serde_json::json;
use std::time::{Duration, Instant};
use teamd::run_loop::run_once;
use teamd::{link_watch_port_up, EventKind, OptionValue, TeamdContext};
use teamd_test::{
    assert_in_order, pump_kernel_events, subscribe_recorder, ConfigFixture, EventLog, MockTeam,
};

fn active_port(team: &MockTeam) -> Option<OptionValue> {
    team.option("activeport", None).map(|o| o.value)
}

fn started(team: &MockTeam, fixture: ConfigFixture) -> TeamdContext {
    let mut ctx = fixture.context(team);
    ctx.init().unwrap();
    pump_kernel_events(&mut ctx).unwrap();
    ctx
}

#[test]
fn test_activebackup_selects_first_up_port() {
    let team = MockTeam::with_links(["eth0", "eth1"]);
    team.set_link("eth0", true);
    team.set_link("eth1", true);
    let eth0 = team.ifindex("eth0").unwrap();
    let eth1 = team.ifindex("eth1").unwrap();

    let mut ctx = started(
        &team,
        ConfigFixture::new("team0").runner("activebackup").ports(["eth0", "eth1"]),
    );
    assert_in_order(&team.journal(), &["set_option mode activebackup", "port_add eth0"]).unwrap();
    assert_eq!(active_port(&team), Some(OptionValue::U32(eth0)));
    assert_eq!(ctx.state_dump().unwrap()["runner"], json!({"active_port": "eth0"}));

    // Losing the link moves the active role.
    team.set_link("eth0", false);
    pump_kernel_events(&mut ctx).unwrap();
    assert_eq!(active_port(&team), Some(OptionValue::U32(eth1)));

    // Coming back does not preempt the current port.
    team.set_link("eth0", true);
    pump_kernel_events(&mut ctx).unwrap();
    assert_eq!(active_port(&team), Some(OptionValue::U32(eth1)));

    ctx.port_remove("eth1").unwrap();
    assert_eq!(active_port(&team), Some(OptionValue::U32(eth0)));

    team.set_link("eth0", false);
    pump_kernel_events(&mut ctx).unwrap();
    assert_eq!(active_port(&team), Some(OptionValue::U32(0)));
    assert_eq!(ctx.state_dump().unwrap()["runner"], json!({"active_port": null}));

    ctx.fini();
    assert!(ctx.state().names().all(|n| n != "runner"));
}

#[test]
fn test_activebackup_drops_vetoed_port() {
    let team = MockTeam::with_links(["eth0", "eth1"]);
    team.set_link("eth0", true);
    team.set_link("eth1", true);
    let eth1 = team.ifindex("eth1").unwrap();

    let mut ctx = started(&team, ConfigFixture::new("team0").runner("activebackup"));
    let log = EventLog::new();
    let (gate, _) = subscribe_recorder(&mut ctx, "gate", EventKind::PortAdded, &log);
    gate.veto("eth0");

    // The runner picks eth0 before the later subscriber refuses it.
    assert!(ctx.port_add("eth0").is_err());
    assert!(team.members().is_empty());
    assert_eq!(active_port(&team), Some(OptionValue::U32(0)));
    assert_eq!(ctx.state_dump().unwrap()["runner"], json!({"active_port": null}));

    ctx.port_add("eth1").unwrap();
    assert_eq!(active_port(&team), Some(OptionValue::U32(eth1)));

    // With eth1 active a refused eth0 changes nothing.
    assert!(ctx.port_add("eth0").is_err());
    assert_eq!(active_port(&team), Some(OptionValue::U32(eth1)));
    assert_eq!(team.members(), vec!["eth1"]);
    ctx.fini();
}

#[test]
fn test_roundrobin_follows_link_state() {
    let team = MockTeam::with_links(["eth0"]);
    let eth0 = team.ifindex("eth0").unwrap();
    let mut ctx = started(&team, ConfigFixture::new("team0").runner("roundrobin").ports(["eth0"]));

    let enabled = || team.option("enabled", Some(eth0)).map(|o| o.value);
    assert_eq!(enabled(), Some(OptionValue::Bool(false)));

    team.set_link("eth0", true);
    pump_kernel_events(&mut ctx).unwrap();
    assert_eq!(enabled(), Some(OptionValue::Bool(true)));
    assert!(team.journal().iter().any(|e| e == "set_option enabled eth0 true"));
    ctx.fini();
}

#[test]
fn test_dummy_runner_sets_no_mode() {
    let team = MockTeam::new();
    let mut ctx = started(&team, ConfigFixture::new("team0"));
    assert_eq!(ctx.runner_name(), Some("dummy"));
    assert!(team.option("mode", None).is_none());
    ctx.fini();
}

#[test]
fn test_link_watch_delay_up() {
    let team = MockTeam::with_links(["eth0"]);
    let eth0 = team.ifindex("eth0").unwrap();
    let mut ctx = started(&team, ConfigFixture::new("team0").link_watch(30, 0).ports(["eth0"]));
    let log = EventLog::new();
    subscribe_recorder(&mut ctx, "rec", EventKind::PortChanged, &log);

    team.set_link("eth0", true);
    pump_kernel_events(&mut ctx).unwrap();
    assert!(ctx.ports().find_by_ifindex(eth0).unwrap().link_up());
    assert!(!link_watch_port_up(&ctx, eth0));
    assert!(log.is_empty());

    // Only the delay timer is left to fire.
    let start = Instant::now();
    run_once(&mut ctx).unwrap();
    assert!(start.elapsed() >= Duration::from_millis(25));
    assert!(link_watch_port_up(&ctx, eth0));
    assert_eq!(log.entries(), vec!["rec port_changed eth0"]);

    // Down is immediate.
    team.set_link("eth0", false);
    pump_kernel_events(&mut ctx).unwrap();
    assert!(!link_watch_port_up(&ctx, eth0));
    assert_eq!(log.len(), 2);
    ctx.fini();
}

#[test]
fn test_link_watch_flap_is_swallowed() {
    let team = MockTeam::with_links(["eth0"]);
    let eth0 = team.ifindex("eth0").unwrap();
    let mut ctx = started(&team, ConfigFixture::new("team0").link_watch(1000, 0).ports(["eth0"]));
    let log = EventLog::new();
    subscribe_recorder(&mut ctx, "rec", EventKind::PortChanged, &log);
    let callbacks = ctx.run_loop().len();

    team.set_link("eth0", true);
    pump_kernel_events(&mut ctx).unwrap();
    assert_eq!(ctx.run_loop().len(), callbacks + 1);

    team.set_link("eth0", false);
    pump_kernel_events(&mut ctx).unwrap();
    assert_eq!(ctx.run_loop().len(), callbacks);
    assert!(!link_watch_port_up(&ctx, eth0));
    assert!(log.is_empty());
    ctx.fini();
}

#[test]
fn test_link_watch_timer_dropped_with_port() {
    let team = MockTeam::with_links(["eth0"]);
    let mut ctx = started(&team, ConfigFixture::new("team0").link_watch(1000, 0).ports(["eth0"]));
    let callbacks = ctx.run_loop().len();

    team.set_link("eth0", true);
    pump_kernel_events(&mut ctx).unwrap();
    assert_eq!(ctx.run_loop().len(), callbacks + 1);

    ctx.port_remove("eth0").unwrap();
    assert_eq!(ctx.run_loop().len(), callbacks);
    ctx.fini();
}

#[test]
fn test_invalid_link_watch_refuses_ports() {
    let team = MockTeam::with_links(["eth0"]);
    let mut ctx = ConfigFixture::new("team0")
        .with("link_watch", json!({"name": "arp_ping"}))
        .ports(["eth0"])
        .context(&team);
    let err = ctx.init().unwrap_err();
    assert_eq!(err.stage(), Some(teamd::Stage::AddPorts));
    assert!(team.members().is_empty());
}

#[test]
fn test_state_dump() {
    let team = MockTeam::with_links(["eth0", "eth1"]);
    team.set_link("eth1", true);
    let ctx = started(
        &team,
        ConfigFixture::new("team0")
            .runner("activebackup")
            .hwaddr("02:00:00:00:00:aa")
            .link_watch(0, 200)
            .port_object(["eth1", "eth0"]),
    );
    let eth0 = team.ifindex("eth0").unwrap();
    let team_ifindex = ctx.ifindex();

    let dump = ctx.state_dump().unwrap();
    assert_eq!(
        dump["team_device"],
        json!({
            "ifinfo": {
                "ifindex": team_ifindex,
                "ifname": "team0",
                "hwaddr": "02:00:00:00:00:aa",
                "hwaddr_len": 6,
            },
            "runner": "activebackup",
        })
    );
    assert_eq!(dump["runner"], json!({"active_port": "eth1"}));
    assert_eq!(
        dump["ports"]["eth0"],
        json!({
            "team_device": {
                "ifinfo": {"ifindex": eth0, "ifname": "eth0", "hwaddr": "02:00:00:00:00:02"},
                "link": {"up": false, "speed": 0, "duplex": "unknown"},
            },
            "link_watches": {"name": "ethtool", "up": false, "delay_up": 0, "delay_down": 200},
        })
    );
    assert_eq!(dump["ports"]["eth1"]["link_watches"]["up"], json!(true));

    // Port order follows the configuration document.
    let ports: Vec<&String> = dump["ports"].as_object().unwrap().keys().collect();
    assert_eq!(ports, vec!["eth1", "eth0"]);
}
