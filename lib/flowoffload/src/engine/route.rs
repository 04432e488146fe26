// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Routing of both directions of an offload candidate.
use super::Direction;
use super::conntrack::Conn;
use super::netdev::DevRef;
use super::netdev::DeviceTopology;
use super::path::check_path;
use alloc::sync::Arc;
use core::fmt;
use core::net::IpAddr;
use core::ops::Index;
use core::ops::IndexMut;
use flowoffload_api::AddrFamily;
use flowoffload_api::ENCAP_MAX;
use flowoffload_api::Encap;
use flowoffload_api::MacAddr;
use flowoffload_api::NetId;
use flowoffload_api::OffloadError;

/// A routed destination, as handed out by the routing collaborator.
///
/// Handles are reference counted: every [`DstRef`] held by the engine
/// is one reference, released when it is dropped.
pub trait DstEntry: Send + Sync + fmt::Debug {
    /// The device the destination is reached through.
    fn dev(&self) -> &DevRef;

    /// Is the destination an IPsec transform bundle?
    fn is_xfrm(&self) -> bool;
}

pub type DstRef = Arc<dyn DstEntry>;

/// The key of a route lookup.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FlowKey {
    pub family: AddrFamily,
    pub saddr: Option<IpAddr>,
    pub daddr: IpAddr,
    /// The output interface the route must use.
    pub oif: u32,
}

pub trait Routing: Send + Sync {
    fn route(&self, net: NetId, key: &FlowKey) -> Option<DstRef>;
}

/// How the fast path transmits one direction of a flow.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum XmitType {
    /// Hand the packet to the neighbour layer of the routed device.
    #[default]
    Neigh,
    /// Rewrite the link-layer header and transmit directly.
    Direct,
    /// Hand the packet to the IPsec transform.
    Xfrm,
}

impl fmt::Display for XmitType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Neigh => "neigh",
            Self::Direct => "direct",
            Self::Xfrm => "xfrm",
        };
        write!(f, "{s}")
    }
}

/// How packets of one direction arrive.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct IngressInfo {
    pub ifindex: u32,
    /// The encapsulation layers wrapping the packet, outermost first.
    pub encap: heapless::Vec<Encap, ENCAP_MAX>,
    /// Bit `n` set means layer `n` was stripped by hardware.
    pub ingress_vlans: u8,
}

/// How packets of one direction leave.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct EgressInfo {
    pub ifindex: u32,
    pub hw_ifindex: u32,
    pub h_source: MacAddr,
    pub h_dest: MacAddr,
}

#[derive(Clone, Debug, Default)]
pub struct RouteTuple {
    pub dst: Option<DstRef>,
    pub xmit_type: XmitType,
    pub in_: IngressInfo,
    pub out: EgressInfo,
}

/// The route of both directions of a flow, indexed by [`Direction`].
///
/// A `FlowRoute` is built for a single admission attempt. Dropping it
/// releases the destination handles it holds, so each handle is
/// released exactly once on every path out of the admission.
#[derive(Clone, Debug, Default)]
pub struct FlowRoute {
    tuple: [RouteTuple; 2],
}

impl Index<Direction> for FlowRoute {
    type Output = RouteTuple;

    fn index(&self, dir: Direction) -> &RouteTuple {
        &self.tuple[dir.idx()]
    }
}

impl IndexMut<Direction> for FlowRoute {
    fn index_mut(&mut self, dir: Direction) -> &mut RouteTuple {
        &mut self.tuple[dir.idx()]
    }
}

/// Route direction `dir` of `ct` out of interface `ifindex`.
///
/// The destination is the source of the opposite direction. For IPv6
/// the source is pinned as well, to the destination of the opposite
/// direction.
pub fn route_dir(
    routing: &dyn Routing,
    route: &mut FlowRoute,
    ct: &dyn Conn,
    dir: Direction,
    family: AddrFamily,
    net: NetId,
    ifindex: u32,
) -> Result<(), OffloadError> {
    let rev = ct.tuple(!dir);
    let key = match family {
        AddrFamily::Ipv4 => {
            FlowKey { family, saddr: None, daddr: rev.src, oif: ifindex }
        }

        AddrFamily::Ipv6 => FlowKey {
            family,
            saddr: Some(rev.dst),
            daddr: rev.src,
            oif: ifindex,
        },
    };

    let dst = routing.route(net, &key).ok_or(OffloadError::NoRoute(dir))?;

    route[dir].xmit_type =
        if dst.is_xfrm() { XmitType::Xfrm } else { XmitType::Neigh };
    route[dir].dst = Some(dst);
    Ok(())
}

/// Route both directions of `ct`, then resolve the egress path of
/// each.
///
/// `devs` holds the device each direction leaves through. The path
/// walk of one direction records the final transmitting device as the
/// device of the opposite direction, so on return `devs` names the
/// devices ingress hooks belong on.
#[allow(clippy::too_many_arguments)]
pub fn route(
    routing: &dyn Routing,
    topo: &dyn DeviceTopology,
    route: &mut FlowRoute,
    ct: &dyn Conn,
    dir: Direction,
    family: AddrFamily,
    net: NetId,
    devs: &mut [DevRef; 2],
) -> Result<(), OffloadError> {
    route_dir(routing, route, ct, dir, family, net, devs[dir.idx()].ifindex)?;
    route_dir(routing, route, ct, !dir, family, net, devs[(!dir).idx()].ifindex)?;

    let [orig_dev, reply_dev] = devs;
    let (this_dev, other_dev) = match dir {
        Direction::Original => (orig_dev, reply_dev),
        Direction::Reply => (reply_dev, orig_dev),
    };

    check_path(topo, route, ct, dir, other_dev);
    check_path(topo, route, ct, !dir, this_dev);
    Ok(())
}
