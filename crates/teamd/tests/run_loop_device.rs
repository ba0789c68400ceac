//! Run loop integration tests driven by the kernel notification source

use std::cell::RefCell;
use std::io::{Read, Write};
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;
use std::rc::Rc;
use teamd::run_loop::{run, run_once};
use teamd::{EventKind, LoopSource, TeamdError};
use teamd_test::{subscribe_recorder, ConfigFixture, EventLog, MockTeam};

#[test]
fn test_device_events_are_dispatched() {
    let team = MockTeam::with_links(["eth0"]);
    let mut ctx = ConfigFixture::new("team0").ports(["eth0"]).context(&team);
    ctx.init().unwrap();
    let log = EventLog::new();
    subscribe_recorder(&mut ctx, "rec", EventKind::PortLinkChanged | EventKind::PortRemoved, &log);

    // The queued appearance of eth0 makes the descriptor readable.
    run_once(&mut ctx).unwrap();
    assert!(log.is_empty());

    team.set_link("eth0", true);
    run_once(&mut ctx).unwrap();
    assert_eq!(log.entries(), vec!["rec port_link_changed eth0"]);

    team.unplug("eth0");
    run_once(&mut ctx).unwrap();
    assert_eq!(log.entries(), vec!["rec port_link_changed eth0", "rec port_removed eth0"]);
    assert!(ctx.ports().is_empty());
    ctx.fini();
}

#[test]
fn test_device_failure_stops_the_loop() {
    let team = MockTeam::with_links(["eth0"]);
    let mut ctx = ConfigFixture::new("team0").ports(["eth0"]).context(&team);
    ctx.init().unwrap();

    team.fail("process_events");
    let err = run(&mut ctx).unwrap_err();
    assert!(matches!(err, TeamdError::DeviceDesync(_)));
    assert!(err.is_fatal());

    team.clear_faults();
    ctx.fini();
    assert_eq!(team.count("free"), 1);
}

#[test]
fn test_termination_finishes_the_pass() {
    let team = MockTeam::with_links(["eth0"]);
    let mut ctx = ConfigFixture::new("team0").ports(["eth0"]).context(&team);
    ctx.init().unwrap();

    let order = Rc::new(RefCell::new(Vec::new()));
    let (mut signal_tx, signal_rx) = UnixStream::pair().unwrap();
    let owner = ctx.new_owner("test");
    let seen = order.clone();
    let fd = signal_rx.as_raw_fd();
    ctx.run_loop_mut()
        .register(owner, "signal", LoopSource::Termination { fd }, move |ctx, _| {
            let mut buf = [0u8; 8];
            let _ = (&signal_rx).read(&mut buf);
            seen.borrow_mut().push("signal".to_string());
            ctx.run_loop_mut().request_quit();
            Ok(())
        })
        .unwrap();

    let mut peers = Vec::new();
    for i in 0..3 {
        let (tx, rx) = UnixStream::pair().unwrap();
        let seen = order.clone();
        let fd = rx.as_raw_fd();
        ctx.run_loop_mut()
            .register(
                owner,
                &format!("fd{}", i),
                LoopSource::Fd {
                    fd,
                    interest: nix::poll::PollFlags::POLLIN,
                },
                move |_, _| {
                    let mut buf = [0u8; 8];
                    let _ = (&rx).read(&mut buf);
                    seen.borrow_mut().push(format!("fd{}", i));
                    Ok(())
                },
            )
            .unwrap();
        peers.push(tx);
    }

    for tx in &mut peers {
        tx.write_all(b"x").unwrap();
    }
    signal_tx.write_all(b"q").unwrap();
    team.set_link("eth0", true);

    run(&mut ctx).unwrap();
    assert_eq!(*order.borrow(), vec!["signal", "fd0", "fd1", "fd2"]);
    // The device callback ran in the same pass.
    assert!(ctx.ports().find_by_ifname("eth0").unwrap().link_up());
    ctx.fini();
}
