// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Admission of connections into the offload tables.
use flowoffload::engine::netdev::NetDevicePath;
use flowoffload::engine::netdev::Neighbour;
use flowoffload::engine::netdev::NudState;
use flowoffload::engine::netdev::PathKind;
use flowoffload::engine::route::DstRef;
use flowoffload_test_utils as common;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use common::*;

// If we are running `cargo test`, then make sure to
// register the USDT probes before running any tests.
#[cfg(test)]
#[ctor::ctor]
fn register_usdt() {
    usdt::register_probes().unwrap();
}

fn as_conn(ct: &Arc<MockConn>) -> ConnRef {
    ct.clone()
}

fn dst_refs(dst: &DstRef) -> usize {
    Arc::strong_count(dst)
}

#[test]
fn tcp_flow_offloaded_to_sw() {
    let net = TestNet::new();
    let svc = net.service();
    let ct = net.tcp_conn();

    let res = svc.target(&pkt(&ct, Original), &net.param(Original, OffloadFlags::empty()));
    assert_eq!(res, TargetVerdict::Continue);

    let sw = net.store(TableKind::Software);
    assert!(sw.contains(&as_conn(&ct)));
    assert_eq!(net.store(TableKind::Hardware).len_flows(), 0);
    assert!(ct.status.contains(CtStatus::OFFLOAD));
    assert!(ct.liberal.load(Ordering::Relaxed));

    // Both directions are routed through the neighbour layer of the
    // port they leave by.
    let flows = sw.flows.lock().unwrap();
    let orig = flows[0].tuple(Original);
    let reply = flows[0].tuple(Reply);
    assert_eq!((orig.iifidx, orig.oifidx), (net.lan.ifindex, net.wan.ifindex));
    assert_eq!((reply.iifidx, reply.oifidx), (net.wan.ifindex, net.lan.ifindex));
    assert_eq!(orig.xmit_type, XmitType::Neigh);
    assert!(orig.dst_cache.is_some());
    drop(flows);

    // One pending hook per device, and the table bound to the
    // namespace of the packet.
    let dump = svc.dump_hooks(TableKind::Software);
    assert_eq!(dump.net, Some(TEST_NET));
    assert_eq!(dump.num_flows, 1);
    assert_eq!(dump.hooks.len(), 2);
    assert!(dump.hooks.iter().all(|h| !h.registered));
    assert!(svc.table(TableKind::Software).sweep_pending().is_some());
    assert!(svc.table(TableKind::Hardware).sweep_pending().is_none());

    let stats = svc.stats();
    assert_eq!(stats.offload_added, 1);
    assert_eq!(stats.hooks_created, 2);
    assert_eq!(stats.skipped(), 0);
}

#[test]
fn hw_flag_selects_hw_table() {
    let net = TestNet::new();
    let svc = net.service();
    let ct = net.udp_conn();

    svc.target(&pkt(&ct, Original), &net.param(Original, OffloadFlags::HW));

    assert!(net.store(TableKind::Hardware).contains(&as_conn(&ct)));
    assert_eq!(net.store(TableKind::Software).len_flows(), 0);
    assert_eq!(svc.dump_hooks(TableKind::Hardware).hooks.len(), 2);
    assert!(svc.dump_hooks(TableKind::Software).hooks.is_empty());

    // UDP has no window tracking to relax.
    assert_eq!(ct.liberal_calls.load(Ordering::Relaxed), 0);
}

#[test]
fn reply_packet_offloads_same_flow() {
    let net = TestNet::new();
    let svc = net.service();
    let ct = net.tcp_conn();

    svc.target(&pkt(&ct, Reply), &net.param(Reply, OffloadFlags::empty()));

    let sw = net.store(TableKind::Software);
    let flows = sw.flows.lock().unwrap();
    assert_eq!(flows.len(), 1);
    assert_eq!(flows[0].tuple(Original).iifidx, net.lan.ifindex);
    assert_eq!(flows[0].tuple(Reply).iifidx, net.wan.ifindex);
}

#[test]
fn route_lookups_use_opposite_tuple() {
    let net = TestNet::new();
    let svc = net.service();
    let ct = net.tcp_conn();

    svc.target(&pkt(&ct, Original), &net.param(Original, OffloadFlags::empty()));

    let lookups = net.routing.lookups.lock().unwrap();
    assert_eq!(lookups.len(), 2);

    let (n, key) = lookups[0];
    assert_eq!(n, TEST_NET);
    assert_eq!(key.daddr, WAN_IP);
    assert_eq!(key.saddr, None);
    assert_eq!(key.oif, net.wan.ifindex);

    let (_, key) = lookups[1];
    assert_eq!(key.daddr, LAN_IP);
    assert_eq!(key.oif, net.lan.ifindex);
}

#[test]
fn second_packet_is_in_progress() {
    let net = TestNet::new();
    let svc = net.service();
    let ct = net.tcp_conn();
    let par = net.param(Original, OffloadFlags::empty());

    svc.target(&pkt(&ct, Original), &par);
    svc.target(&pkt(&ct, Original), &par);
    svc.target(&pkt(&ct, Reply), &net.param(Reply, OffloadFlags::empty()));

    let stats = svc.stats();
    assert_eq!(stats.offload_added, 1);
    assert_eq!(stats.skip_in_progress, 2);
    assert_eq!(net.store(TableKind::Software).len_flows(), 1);
    assert_eq!(net.routing.lookups.lock().unwrap().len(), 2);
}

#[test]
fn concurrent_packets_offload_once() {
    let net = TestNet::new();
    let svc = net.service();
    let ct = net.tcp_conn();
    let par = net.param(Original, OffloadFlags::empty());

    std::thread::scope(|s| {
        for _ in 0..8 {
            s.spawn(|| {
                for _ in 0..16 {
                    svc.target(&pkt(&ct, Original), &par);
                }
            });
        }
    });

    let stats = svc.stats();
    assert_eq!(stats.offload_added, 1);
    assert_eq!(stats.skip_in_progress, 8 * 16 - 1);
    assert_eq!(net.store(TableKind::Software).len_flows(), 1);
    assert_eq!(ct.liberal_calls.load(Ordering::Relaxed), 1);
}

// Each ineligible packet is counted under its reason and leaves no
// trace: no route lookups, no hooks, no offload bit.
#[test]
fn ineligible_packets_have_no_side_effects() {
    let net = TestNet::new();
    let svc = net.service();
    let par = net.param(Original, OffloadFlags::empty());

    let ct = net.tcp_conn();
    let mut p = pkt(&ct, Original);
    p.sec_path = true;
    svc.target(&p, &par);

    let mut p = pkt(&ct, Original);
    p.ip_opt_len = 4;
    svc.target(&p, &par);

    let mut p = pkt(&ct, Original);
    p.ct = None;
    svc.target(&p, &par);

    let mut p = pkt(&ct, Original);
    p.tcp_flags = Some(TcpFlags::ACK | TcpFlags::FIN);
    svc.target(&p, &par);

    let mut p = pkt(&ct, Original);
    p.tcp_flags = Some(TcpFlags::RST);
    svc.target(&p, &par);

    // A truncated TCP header counts as FIN/RST.
    let mut p = pkt(&ct, Original);
    p.tcp_flags = None;
    svc.target(&p, &par);

    let mut no_in = par.clone();
    no_in.in_dev = None;
    svc.target(&pkt(&ct, Original), &no_in);

    let syn = net.tcp_conn();
    syn.set_state(TcpState::SynRecv);
    svc.target(&pkt(&syn, Original), &par);

    let helper = net.tcp_conn();
    helper.helper.store(true, Ordering::Relaxed);
    svc.target(&pkt(&helper, Original), &par);

    let nat = net.tcp_conn();
    nat.status.insert(CtStatus::SEQ_ADJUST);
    svc.target(&pkt(&nat, Original), &par);

    let unconfirmed = net.udp_conn();
    unconfirmed.status.clear(CtStatus::CONFIRMED);
    svc.target(&pkt(&unconfirmed, Original), &par);

    let icmp = MockConn::new(flowoffload::engine::conntrack::ConnTuple {
        src: LAN_IP,
        dst: WAN_IP,
        src_port: 0,
        dst_port: 0,
        proto: flowoffload::api::Protocol::Icmp,
    });
    svc.target(&pkt(&icmp, Original), &par);

    let stats = svc.stats();
    assert_eq!(stats.skip_sec_path, 1);
    assert_eq!(stats.skip_ip_options, 1);
    assert_eq!(stats.skip_no_conntrack, 1);
    assert_eq!(stats.skip_tcp_fin_rst, 3);
    assert_eq!(stats.skip_no_dev, 1);
    assert_eq!(stats.skip_tcp_state, 1);
    assert_eq!(stats.skip_helper, 1);
    assert_eq!(stats.skip_seq_adjust, 1);
    assert_eq!(stats.skip_unconfirmed, 1);
    assert_eq!(stats.skip_proto, 1);
    assert_eq!(stats.skipped(), 12);
    assert_eq!(stats.offload_added, 0);

    for ct in [&ct, &syn, &helper, &nat, &unconfirmed, &icmp] {
        assert!(!ct.status.contains(CtStatus::OFFLOAD));
        assert!(!ct.liberal.load(Ordering::Relaxed));
    }
    assert!(net.routing.lookups.lock().unwrap().is_empty());
    assert!(svc.dump_hooks(TableKind::Software).hooks.is_empty());
    assert!(svc.table(TableKind::Software).sweep_pending().is_none());
    assert_eq!(svc.table(TableKind::Software).net(), None);
}

#[test]
fn ipv6_options_length_ignored() {
    let net = TestNet::new();
    let svc = net.service();
    let ct = net.udp_conn();
    let mut par = net.param(Original, OffloadFlags::empty());
    par.family = AddrFamily::Ipv6;
    let mut p = pkt(&ct, Original);
    p.ip_opt_len = 8;

    svc.target(&p, &par);
    assert_eq!(svc.stats().skip_ip_options, 0);

    // The lookup pins the source for IPv6.
    let lookups = net.routing.lookups.lock().unwrap();
    assert_eq!(lookups[0].1.saddr, Some(LAN_IP));
}

#[test]
fn no_route_releases_claim() {
    let net = TestNet::new();
    let svc = net.service();
    let ct = net.tcp_conn();
    let par = net.param(Original, OffloadFlags::empty());
    let wan_dst = net.routing.dst(WAN_IP).unwrap();
    let before = dst_refs(&wan_dst);

    // The original direction routes, the reply direction does not.
    net.routing.remove(LAN_IP);
    svc.target(&pkt(&ct, Original), &par);

    assert_eq!(svc.stats().err_route, 1);
    assert!(!ct.status.contains(CtStatus::OFFLOAD));
    assert_eq!(dst_refs(&wan_dst), before);
    assert!(svc.dump_hooks(TableKind::Software).hooks.is_empty());

    // Once the route is back the next packet gets through.
    net.routing.add(LAN_IP, &net.lan, false);
    svc.target(&pkt(&ct, Original), &par);
    assert_eq!(svc.stats().offload_added, 1);
}

#[test]
fn alloc_failure_releases_claim() {
    let net = TestNet::new();
    let svc = net.service();
    let ct = net.tcp_conn();
    let wan_dst = net.routing.dst(WAN_IP).unwrap();
    let before = dst_refs(&wan_dst);

    net.store(TableKind::Software).fail_alloc.store(true, Ordering::Relaxed);
    svc.target(&pkt(&ct, Original), &net.param(Original, OffloadFlags::empty()));

    assert_eq!(svc.stats().err_alloc, 1);
    assert!(!ct.status.contains(CtStatus::OFFLOAD));
    assert!(!ct.liberal.load(Ordering::Relaxed));
    assert_eq!(dst_refs(&wan_dst), before);
}

#[test]
fn add_failure_releases_claim() {
    let net = TestNet::new();
    let svc = net.service();
    let ct = net.tcp_conn();
    let wan_dst = net.routing.dst(WAN_IP).unwrap();
    let before = dst_refs(&wan_dst);

    *net.store(TableKind::Software).fail_add.lock().unwrap() =
        Some(FlowStoreError::Other("table full".into()));
    svc.target(&pkt(&ct, Original), &net.param(Original, OffloadFlags::empty()));

    let stats = svc.stats();
    assert_eq!(stats.err_add, 1);
    assert_eq!(stats.hooks_created, 0);
    assert!(!ct.status.contains(CtStatus::OFFLOAD));
    assert_eq!(dst_refs(&wan_dst), before);
    assert_eq!(net.log.count(LogLevel::Warn), 1);
    assert_eq!(svc.table(TableKind::Software).net(), None);
}

// Each neighbour-transmitted direction holds exactly one reference on
// its destination for as long as the flow lives.
#[test]
fn flow_holds_one_dst_ref_per_direction() {
    let net = TestNet::new();
    let svc = net.service();
    let ct = net.tcp_conn();
    let wan_dst = net.routing.dst(WAN_IP).unwrap();
    let lan_dst = net.routing.dst(LAN_IP).unwrap();
    let (wan_before, lan_before) = (dst_refs(&wan_dst), dst_refs(&lan_dst));

    svc.target(&pkt(&ct, Original), &net.param(Original, OffloadFlags::empty()));
    assert_eq!(dst_refs(&wan_dst), wan_before + 1);
    assert_eq!(dst_refs(&lan_dst), lan_before + 1);

    net.store(TableKind::Software).expire(&as_conn(&ct));
    assert_eq!(dst_refs(&wan_dst), wan_before);
    assert_eq!(dst_refs(&lan_dst), lan_before);
}

#[test]
fn resolved_neighbour_goes_direct() {
    const PEER: MacAddr = MacAddr::from_const([0xA8, 0x40, 0x25, 0xFF, 0x00, 0x01]);

    let net = TestNet::new();
    let svc = net.service();
    let ct = net.tcp_conn();
    net.topo.add_neigh(WAN_IP, Neighbour { ha: PEER, nud_state: NudState::REACHABLE });
    net.topo.add_path(
        &net.wan,
        vec![NetDevicePath { dev: net.wan.clone(), kind: PathKind::Ethernet }],
    );

    svc.target(&pkt(&ct, Original), &net.param(Original, OffloadFlags::empty()));

    let sw = net.store(TableKind::Software);
    let flows = sw.flows.lock().unwrap();
    let orig = flows[0].tuple(Original);
    assert_eq!(orig.xmit_type, XmitType::Direct);
    assert_eq!(orig.h_dest, PEER);
    assert_eq!(orig.h_source, net.wan.dev_addr);
    assert_eq!(orig.oifidx, net.wan.ifindex);
    assert_eq!(orig.hw_ifidx, net.wan.ifindex);
    assert!(orig.dst_cache.is_none());

    // The LAN side has no neighbour entry.
    assert_eq!(flows[0].tuple(Reply).xmit_type, XmitType::Neigh);
}

#[test]
fn xfrm_route_keeps_dst() {
    let net = TestNet::new();
    let svc = net.service();
    let ct = net.tcp_conn();
    let tunnel = net.routing.add(WAN_IP, &net.wan, true);
    net.topo.add_neigh(
        WAN_IP,
        Neighbour { ha: MacAddr::BROADCAST, nud_state: NudState::PERMANENT },
    );

    svc.target(&pkt(&ct, Original), &net.param(Original, OffloadFlags::empty()));

    let sw = net.store(TableKind::Software);
    let flows = sw.flows.lock().unwrap();
    let orig = flows[0].tuple(Original);
    assert_eq!(orig.xmit_type, XmitType::Xfrm);
    assert!(Arc::ptr_eq(orig.dst_cache.as_ref().unwrap(), &tunnel));
    assert_eq!(orig.h_dest, MacAddr::ZERO);
}

#[test]
fn check_entry_rejects_unknown_flags() {
    assert_eq!(
        FlowOffload::check_entry(&TargetInfo { flags: 0 }),
        Ok(OffloadFlags::empty())
    );
    assert_eq!(
        FlowOffload::check_entry(&TargetInfo::new(OffloadFlags::HW)),
        Ok(OffloadFlags::HW)
    );

    let err = FlowOffload::check_entry(&TargetInfo { flags: 0x4 }).unwrap_err();
    assert_eq!(err, OffloadError::BadFlags(0x4));
    assert_eq!(err.to_errno(), flowoffload::api::errno::EINVAL);
}
