// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Devices, routes and forwarding paths.
use flowoffload::api::MacAddr;
use flowoffload::api::NetId;
use flowoffload::engine::netdev::ARPHRD_ETHER;
use flowoffload::engine::netdev::DevRef;
use flowoffload::engine::netdev::DeviceTopology;
use flowoffload::engine::netdev::IfFlags;
use flowoffload::engine::netdev::NetDevice;
use flowoffload::engine::netdev::NetDevicePath;
use flowoffload::engine::netdev::Neighbour;
use flowoffload::engine::netdev::PathError;
use flowoffload::engine::netdev::PathStack;
use flowoffload::engine::route::DstEntry;
use flowoffload::engine::route::DstRef;
use flowoffload::engine::route::FlowKey;
use flowoffload::engine::route::Routing;
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::Mutex;

/// An up Ethernet device with a locally administered address derived
/// from its index.
pub fn dev(ifindex: u32, name: &str, net: NetId) -> DevRef {
    let idx = ifindex.to_be_bytes();
    Arc::new(NetDevice {
        ifindex,
        name: name.to_string(),
        flags: IfFlags::UP | IfFlags::BROADCAST,
        hw_type: ARPHRD_ETHER,
        addr_len: 6,
        dev_addr: MacAddr::from_const([0x02, 0x08, idx[0], idx[1], idx[2], idx[3]]),
        net,
    })
}

#[derive(Debug)]
pub struct MockDst {
    pub dev: DevRef,
    pub xfrm: bool,
}

impl DstEntry for MockDst {
    fn dev(&self) -> &DevRef {
        &self.dev
    }

    fn is_xfrm(&self) -> bool {
        self.xfrm
    }
}

/// A routing table keyed by destination address.
///
/// Each route is a single destination handle shared by every lookup,
/// so a test can watch its reference count.
#[derive(Default)]
pub struct MockRouting {
    routes: Mutex<BTreeMap<IpAddr, DstRef>>,
    pub lookups: Mutex<Vec<(NetId, FlowKey)>>,
}

impl MockRouting {
    pub fn add(&self, daddr: IpAddr, dev: &DevRef, xfrm: bool) -> DstRef {
        let dst: DstRef = Arc::new(MockDst { dev: dev.clone(), xfrm });
        self.routes.lock().unwrap().insert(daddr, dst.clone());
        dst
    }

    pub fn remove(&self, daddr: IpAddr) {
        self.routes.lock().unwrap().remove(&daddr);
    }

    pub fn dst(&self, daddr: IpAddr) -> Option<DstRef> {
        self.routes.lock().unwrap().get(&daddr).cloned()
    }
}

impl Routing for MockRouting {
    fn route(&self, net: NetId, key: &FlowKey) -> Option<DstRef> {
        self.lookups.lock().unwrap().push((net, *key));
        self.routes.lock().unwrap().get(&key.daddr).cloned()
    }
}

/// Neighbours keyed by address, forwarding paths keyed by the index
/// of the device they start at.
#[derive(Default)]
pub struct MockTopology {
    neighs: Mutex<BTreeMap<IpAddr, Neighbour>>,
    paths: Mutex<BTreeMap<u32, Vec<NetDevicePath>>>,
}

impl MockTopology {
    pub fn add_neigh(&self, addr: IpAddr, neigh: Neighbour) {
        self.neighs.lock().unwrap().insert(addr, neigh);
    }

    pub fn add_path(&self, dev: &DevRef, path: Vec<NetDevicePath>) {
        self.paths.lock().unwrap().insert(dev.ifindex, path);
    }
}

impl DeviceTopology for MockTopology {
    fn neigh_lookup(&self, _dst: &dyn DstEntry, daddr: IpAddr) -> Option<Neighbour> {
        self.neighs.lock().unwrap().get(&daddr).copied()
    }

    fn fill_forward_path(
        &self,
        dev: &DevRef,
        _daddr: MacAddr,
    ) -> Result<PathStack, PathError> {
        let paths = self.paths.lock().unwrap();
        let path = paths
            .get(&dev.ifindex)
            .ok_or_else(|| PathError::NoPath(dev.name.clone()))?;

        let mut stack = PathStack::new();
        for seg in path {
            stack
                .push(seg.clone())
                .map_err(|_| PathError::TooDeep(dev.name.clone()))?;
        }
        Ok(stack)
    }
}
