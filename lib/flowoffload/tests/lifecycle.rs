// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Service bring-up, device removal and shutdown.
use flowoffload::engine::hook::HookError;
use flowoffload::engine::netdev::NotifyVerdict;
use flowoffload::engine::sweep::SweepOutcome;
use flowoffload_test_utils as common;
use std::sync::atomic::Ordering;
use std::thread;

use common::*;

fn offload(net: &TestNet, svc: &FlowOffload, flags: OffloadFlags) -> ConnRef {
    let ct = net.tcp_conn();
    svc.target(&pkt(&ct, Original), &net.param(Original, flags));
    ct
}

#[test]
fn init_registers_target() {
    let net = TestNet::new();
    let _svc = net.service();

    assert_eq!(net.filter.events(), vec![FilterEvent::RegisterTarget("FLOWOFFLOAD")]);
    let [sw, hw] = &net.stores;
    assert!(sw.inited.load(Ordering::Relaxed));
    assert!(!sw.hw.load(Ordering::Relaxed));
    assert!(hw.inited.load(Ordering::Relaxed));
    assert!(hw.hw.load(Ordering::Relaxed));
}

#[test]
fn init_rejects_bad_interval() {
    let net = TestNet::new();
    let cfg = FlowOffloadCfg { sweep_interval_ms: 25, ..Default::default() };

    let err = net.try_service(cfg).err().unwrap();
    assert!(matches!(err, OffloadError::BadState(_)));
    assert!(!net.store(TableKind::Software).inited.load(Ordering::Relaxed));
    assert!(net.filter.events().is_empty());
}

#[test]
fn sw_init_failure() {
    let net = TestNet::new();
    *net.store(TableKind::Software).fail_init.lock().unwrap() =
        Some(FlowStoreError::NoMem);

    let err = net.try_service(FlowOffloadCfg::default()).err().unwrap();
    assert!(matches!(err, OffloadError::TableInit { table: TableKind::Software, .. }));
    assert!(!net.store(TableKind::Hardware).inited.load(Ordering::Relaxed));
    assert!(net.filter.events().is_empty());
}

#[test]
fn hw_init_failure_unwinds_sw() {
    let net = TestNet::new();
    *net.store(TableKind::Hardware).fail_init.lock().unwrap() =
        Some(FlowStoreError::Other("no offload capable device".into()));

    let err = net.try_service(FlowOffloadCfg::default()).err().unwrap();
    assert!(matches!(err, OffloadError::TableInit { table: TableKind::Hardware, .. }));
    assert!(net.store(TableKind::Software).freed.load(Ordering::Relaxed));
    assert!(!net.store(TableKind::Hardware).freed.load(Ordering::Relaxed));
    assert!(net.filter.events().is_empty());
}

#[test]
fn target_failure_unwinds_both() {
    let net = TestNet::new();
    *net.filter.fail_target.lock().unwrap() =
        Some(HookError::TargetExists("FLOWOFFLOAD"));

    let err = net.try_service(FlowOffloadCfg::default()).err().unwrap();
    assert!(matches!(err, OffloadError::TargetRegister(_)));
    assert_eq!(err.to_errno(), flowoffload::api::errno::EINVAL);
    assert!(net.store(TableKind::Software).freed.load(Ordering::Relaxed));
    assert!(net.store(TableKind::Hardware).freed.load(Ordering::Relaxed));
}

#[test]
fn device_removal_spans_both_tables() {
    let net = TestNet::new();
    let svc = net.service();
    offload(&net, &svc, OffloadFlags::empty());
    offload(&net, &svc, OffloadFlags::HW);
    svc.sweep(TableKind::Software);
    svc.sweep(TableKind::Hardware);
    assert_eq!(net.filter.num_installed(), 4);

    // Anything short of removal is ignored.
    for ev in [NetdevEvent::Down, NetdevEvent::ChangeAddr, NetdevEvent::Register] {
        assert_eq!(svc.netdev_event(ev, &net.lan), NotifyVerdict::Done);
    }
    assert_eq!(net.filter.num_installed(), 4);

    assert_eq!(svc.netdev_event(NetdevEvent::Unregister, &net.lan), NotifyVerdict::Done);

    for kind in TableKind::ALL {
        assert!(svc.lookup_hook(kind, &net.lan).is_none());
        assert!(svc.lookup_hook(kind, &net.wan).is_some());
        assert!(!net.filter.is_installed(kind, net.lan.ifindex));
        assert!(net.filter.is_installed(kind, net.wan.ifindex));

        let store = net.store(kind);
        assert_eq!(*store.cleanups.lock().unwrap(), vec![net.lan.ifindex]);
        assert_eq!(store.len_flows(), 0);
    }

    // Hardware bindings go with the device.
    assert!(
        net.store(TableKind::Hardware)
            .setups()
            .iter()
            .all(|(_, cmd)| *cmd == FlowBlockCommand::Bind)
    );
    assert_eq!(svc.stats().hooks_revoked, 2);
}

#[test]
fn device_removal_drops_pending_hooks() {
    let net = TestNet::new();
    let svc = net.service();
    offload(&net, &svc, OffloadFlags::empty());

    svc.netdev_event(NetdevEvent::Unregister, &net.wan);
    assert!(svc.lookup_hook(TableKind::Software, &net.wan).is_none());
    assert!(
        net.filter
            .events()
            .iter()
            .all(|e| !matches!(e, FilterEvent::Unregister { .. }))
    );

    // The sweep installs what is left.
    assert_eq!(svc.sweep(TableKind::Software).registered, 1);
    assert!(net.filter.is_installed(TableKind::Software, net.lan.ifindex));
}

#[test]
fn device_removal_while_sweeping() {
    let net = TestNet::new();
    let cfg = FlowOffloadCfg { sweep_interval_ms: 10, ..Default::default() };
    let svc = net.try_service(cfg).unwrap();
    svc.spawn_sweepers().unwrap();

    for _ in 0..50 {
        offload(&net, &svc, OffloadFlags::empty());
        svc.netdev_event(NetdevEvent::Unregister, &net.lan);
        svc.netdev_event(NetdevEvent::Unregister, &net.wan);
    }
    svc.shutdown();

    // Every hook is gone, and none was torn down twice.
    assert_eq!(net.filter.num_installed(), 0);
    for dev in [&net.lan, &net.wan] {
        let reg = net.filter.count(&FilterEvent::Register {
            table: TableKind::Software,
            ifindex: dev.ifindex,
            net: TEST_NET,
        });
        let unreg = net.filter.count(&FilterEvent::Unregister {
            table: TableKind::Software,
            ifindex: dev.ifindex,
            net: TEST_NET,
        });
        assert_eq!(reg, unreg);
    }
}

/// The device the parked sweep is installing a hook on.
fn installing(net: &TestNet, svc: &FlowOffload, kind: TableKind) -> DevRef {
    [&net.lan, &net.wan]
        .into_iter()
        .find(|dev| {
            svc.lookup_hook(kind, dev).is_some_and(|h| !h.registered && h.net.is_some())
        })
        .cloned()
        .unwrap()
}

fn registrations(net: &TestNet, kind: TableKind, dev: &DevRef) -> (usize, usize) {
    let reg = net.filter.count(&FilterEvent::Register {
        table: kind,
        ifindex: dev.ifindex,
        net: TEST_NET,
    });
    let unreg = net.filter.count(&FilterEvent::Unregister {
        table: kind,
        ifindex: dev.ifindex,
        net: TEST_NET,
    });
    (reg, unreg)
}

#[test]
fn device_removal_during_blocked_registration() {
    let net = TestNet::new();
    let svc = net.service();
    offload(&net, &svc, OffloadFlags::empty());

    let host = net.filter.host_lock.lock().unwrap();
    thread::scope(|s| {
        let sweep = s.spawn(|| svc.sweep(TableKind::Software));
        wait_for(|| net.filter.reg_attempts.load(Ordering::SeqCst) == 1);
        let dev = installing(&net, &svc, TableKind::Software);

        // Removal is delivered with the host lock held and must not
        // wait for the parked sweep.
        for d in [&net.lan, &net.wan] {
            assert_eq!(svc.netdev_event(NetdevEvent::Unregister, d), NotifyVerdict::Done);
            assert!(svc.lookup_hook(TableKind::Software, d).is_none());
        }
        assert_eq!(svc.stats().hooks_revoked, 2);
        assert!(
            net.filter
                .events()
                .iter()
                .all(|e| !matches!(e, FilterEvent::Unregister { .. }))
        );

        drop(host);
        let out = sweep.join().unwrap();
        assert_eq!(out.registered, 1);

        // The sweep uninstalled the hook it was installing, once.
        assert_eq!(registrations(&net, TableKind::Software, &dev), (1, 1));
    });

    assert_eq!(net.filter.num_installed(), 0);
    assert_eq!(svc.dump_hooks(TableKind::Software).hooks.len(), 0);
    assert_eq!(svc.sweep(TableKind::Software), SweepOutcome::default());
}

#[test]
fn revoke_during_blocked_hw_install() {
    let net = TestNet::new();
    let svc = net.service();
    offload(&net, &svc, OffloadFlags::HW);

    let host = net.filter.host_lock.lock().unwrap();
    thread::scope(|s| {
        let sweep = s.spawn(|| svc.sweep(TableKind::Hardware));
        wait_for(|| net.filter.reg_attempts.load(Ordering::SeqCst) == 1);
        let dev = installing(&net, &svc, TableKind::Hardware);

        assert!(svc.revoke_hook(TableKind::Hardware, &dev));
        drop(host);
        sweep.join().unwrap();

        assert_eq!(registrations(&net, TableKind::Hardware, &dev), (1, 1));
        let setups: Vec<_> = net
            .store(TableKind::Hardware)
            .setups()
            .into_iter()
            .filter(|(ifindex, _)| *ifindex == dev.ifindex)
            .collect();
        assert_eq!(
            setups,
            vec![
                (dev.ifindex, FlowBlockCommand::Bind),
                (dev.ifindex, FlowBlockCommand::Unbind),
            ]
        );
    });

    // The other device's hook was installed normally and stays.
    assert_eq!(net.filter.num_installed(), 1);
    assert_eq!(svc.dump_hooks(TableKind::Hardware).hooks.len(), 1);
    assert_eq!(svc.stats().hooks_revoked, 1);
}

#[test]
fn shutdown_tears_down_everything() {
    let net = TestNet::new();
    let svc = net.service();
    offload(&net, &svc, OffloadFlags::empty());
    offload(&net, &svc, OffloadFlags::HW);
    svc.sweep(TableKind::Software);
    net.filter.clear_events();

    svc.shutdown();

    let events = net.filter.events();
    assert_eq!(events[0], FilterEvent::UnregisterTarget("FLOWOFFLOAD"));
    // Only the installed software hooks are unregistered.
    assert_eq!(events.len(), 3);
    assert_eq!(net.filter.num_installed(), 0);
    assert!(net.store(TableKind::Hardware).setups().is_empty());
    for kind in TableKind::ALL {
        assert!(net.store(kind).freed.load(Ordering::Relaxed));
        assert!(svc.dump_hooks(kind).hooks.is_empty());
    }

    // Only the first call does anything, including the one on drop.
    svc.shutdown();
    drop(svc);
    assert_eq!(net.filter.events().len(), 3);
}

#[test]
fn drop_shuts_down() {
    let net = TestNet::new();
    let svc = net.service();
    offload(&net, &svc, OffloadFlags::empty());
    svc.sweep(TableKind::Software);
    drop(svc);

    assert_eq!(net.filter.num_installed(), 0);
    assert!(net.filter.events().contains(&FilterEvent::UnregisterTarget("FLOWOFFLOAD")));
}
