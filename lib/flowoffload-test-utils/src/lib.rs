// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Common routines for integration tests.
//!
//! Every collaborator of the offload service has an in-memory stand-in
//! here which records what the service asked of it and can be told to
//! fail. [`TestNet`] wires a set of them together with a
//! [`FlowOffload`] over a small two-port router.

// This type of pedantry is more trouble than it's worth here.
#![allow(dead_code)]

pub mod conn;
pub mod filter;
pub mod net;
pub mod store;

// Let's make our lives easier and pub use a bunch of stuff.
pub use conn::MockConn;
pub use filter::FilterEvent;
pub use filter::MockFilter;
pub use flowoffload::api::AddrFamily;
pub use flowoffload::api::Direction::*;
pub use flowoffload::api::FlowOffloadCfg;
pub use flowoffload::api::MacAddr;
pub use flowoffload::api::NetId;
pub use flowoffload::api::OffloadError;
pub use flowoffload::api::OffloadFlags;
pub use flowoffload::api::TableKind;
pub use flowoffload::api::TargetInfo;
pub use flowoffload::api::TcpFlags;
pub use flowoffload::api::TcpState;
pub use flowoffload::engine::Direction;
pub use flowoffload::engine::conntrack::ConnRef;
pub use flowoffload::engine::conntrack::CtStatus;
pub use flowoffload::engine::flow_store::FlowBlockCommand;
pub use flowoffload::engine::flow_store::FlowStoreError;
pub use flowoffload::engine::netdev::DevRef;
pub use flowoffload::engine::netdev::NetdevEvent;
pub use flowoffload::engine::offload::FlowOffload;
pub use flowoffload::engine::offload::NetCtx;
pub use flowoffload::engine::route::XmitType;
pub use flowoffload::engine::target::ActionParam;
pub use flowoffload::engine::target::PacketInfo;
pub use flowoffload::engine::target::TargetVerdict;
pub use flowoffload::provider::LogLevel;
pub use flowoffload::provider::LogProvider;
pub use flowoffload::provider::Providers;
pub use net::MockRouting;
pub use net::MockTopology;
pub use net::dev;
pub use store::MockStore;

use std::net::IpAddr;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use std::time::Instant;

/// The namespace every test device lives in.
pub const TEST_NET: NetId = NetId(42);

pub const LAN_IP: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));
pub const WAN_IP: IpAddr = IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1));

/// A log provider keeping every message it is handed.
#[derive(Clone, Default)]
pub struct RecordLog {
    pub msgs: Arc<Mutex<Vec<(LogLevel, String)>>>,
}

impl RecordLog {
    pub fn count(&self, level: LogLevel) -> usize {
        self.msgs.lock().unwrap().iter().filter(|(l, _)| *l == level).count()
    }
}

impl LogProvider for RecordLog {
    fn log(&self, level: LogLevel, msg: &str) {
        self.msgs.lock().unwrap().push((level, msg.to_string()));
    }
}

/// A router with a LAN port (`eth0`, ifindex 2) and a WAN port
/// (`eth1`, ifindex 3), routing [`LAN_IP`] and [`WAN_IP`] out of the
/// port of the same name, and an offload service on top.
pub struct TestNet {
    pub lan: DevRef,
    pub wan: DevRef,
    pub routing: Arc<MockRouting>,
    pub topo: Arc<MockTopology>,
    pub filter: Arc<MockFilter>,
    pub stores: [Arc<MockStore>; 2],
    pub log: RecordLog,
}

impl Default for TestNet {
    fn default() -> Self {
        Self::new()
    }
}

impl TestNet {
    pub fn new() -> Self {
        let lan = dev(2, "eth0", TEST_NET);
        let wan = dev(3, "eth1", TEST_NET);
        let routing = Arc::new(MockRouting::default());
        routing.add(LAN_IP, &lan, false);
        routing.add(WAN_IP, &wan, false);

        Self {
            lan,
            wan,
            routing,
            topo: Arc::new(MockTopology::default()),
            filter: Arc::new(MockFilter::default()),
            stores: [Arc::new(MockStore::default()), Arc::new(MockStore::default())],
            log: RecordLog::default(),
        }
    }

    pub fn ctx(&self) -> NetCtx {
        NetCtx {
            routing: self.routing.clone(),
            topology: self.topo.clone(),
            filter: self.filter.clone(),
        }
    }

    pub fn store(&self, kind: TableKind) -> &Arc<MockStore> {
        &self.stores[kind.idx()]
    }

    pub fn try_service(&self, cfg: FlowOffloadCfg) -> Result<FlowOffload, OffloadError> {
        let [sw, hw] = &self.stores;
        FlowOffload::new(
            cfg,
            self.ctx(),
            [sw.clone(), hw.clone()],
            Providers { log: Box::new(self.log.clone()) },
        )
    }

    pub fn service(&self) -> FlowOffload {
        self.try_service(FlowOffloadCfg::default()).unwrap()
    }

    /// An established TCP connection from the LAN host to the WAN
    /// host.
    pub fn tcp_conn(&self) -> Arc<MockConn> {
        MockConn::tcp(LAN_IP, 40000, WAN_IP, 443)
    }

    pub fn udp_conn(&self) -> Arc<MockConn> {
        MockConn::udp(LAN_IP, 5353, WAN_IP, 53)
    }

    /// The parameters of a packet of direction `dir`, forwarded from
    /// the port its direction arrives on to the other.
    pub fn param(&self, dir: Direction, flags: OffloadFlags) -> ActionParam {
        let (in_dev, out_dev) = match dir {
            Direction::Original => (&self.lan, &self.wan),
            Direction::Reply => (&self.wan, &self.lan),
        };

        ActionParam {
            family: AddrFamily::Ipv4,
            net: TEST_NET,
            in_dev: Some(in_dev.clone()),
            out_dev: Some(out_dev.clone()),
            info: TargetInfo::new(flags),
        }
    }
}

/// A plain ACK of direction `dir` on `ct`.
pub fn pkt(ct: &Arc<MockConn>, dir: Direction) -> PacketInfo {
    let ct: ConnRef = ct.clone();
    PacketInfo {
        sec_path: false,
        ip_opt_len: 0,
        tcp_flags: Some(TcpFlags::ACK),
        ct: Some((ct, dir)),
    }
}

/// Poll `cond` until it holds, failing the test after ten seconds.
pub fn wait_for(cond: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for condition");
        std::thread::sleep(Duration::from_millis(5));
    }
}
