// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Egress path resolution.
//!
//! Given the routed destination of one direction, walk the forwarding
//! path of its device to find the device that finally transmits the
//! frame, the link-layer addresses to write, and the encapsulation the
//! opposite direction arrives with.
//!
//! [`check_path`] runs once per direction. Each run writes the egress
//! half of its own direction and the ingress half of the opposite
//! direction, so the two runs never touch the same fields and may run
//! in either order. Each run also reports the final device through
//! `out_dev`, which becomes the device of the opposite direction.
use super::Direction;
use super::conntrack::Conn;
use super::netdev::BridgeVlanMode;
use super::netdev::DevRef;
use super::netdev::DeviceTopology;
use super::netdev::NudState;
use super::netdev::PathKind;
use super::route::FlowRoute;
use super::route::IngressInfo;
use super::route::XmitType;
use flowoffload_api::Encap;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Walk {
    Continue,
    Stop,
}

fn push_encap(info: &mut IngressInfo, encap: Encap) -> Walk {
    match info.encap.push(encap) {
        Ok(()) => Walk::Continue,
        Err(_) => Walk::Stop,
    }
}

/// Resolve the egress path of direction `dir`.
///
/// Any precondition for a direct Ethernet rewrite that fails leaves
/// the direction on neighbour transmission, with ingress and egress
/// set to the routed device.
pub fn check_path(
    topo: &dyn DeviceTopology,
    route: &mut FlowRoute,
    ct: &dyn Conn,
    dir: Direction,
    out_dev: &mut DevRef,
) {
    let Some(dst) = route[dir].dst.clone() else {
        return;
    };
    let daddr = ct.tuple(!dir).src;
    let mut dev = dst.dev().clone();

    route[!dir].in_.ifindex = dev.ifindex;
    route[dir].out.ifindex = dev.ifindex;

    if route[dir].xmit_type == XmitType::Xfrm {
        return;
    }

    if !dev.is_valid_ether_device() {
        return;
    }

    let Some(neigh) = topo.neigh_lookup(dst.as_ref(), daddr) else {
        return;
    };

    route[dir].out.h_dest = neigh.ha;
    if !neigh.nud_state.intersects(NudState::VALID) {
        return;
    }

    let stack = match topo.fill_forward_path(&dev, route[dir].out.h_dest) {
        Ok(stack) if !stack.is_empty() => stack,
        _ => return,
    };

    // Index `stack.len()` is a terminal sentinel: reaching it ends the
    // walk with `dev` left at the last real segment.
    for i in 0..=stack.len() {
        let Some(path) = stack.get(i) else {
            break;
        };

        dev = path.dev.clone();
        if dev.is_valid_ether_device() {
            let tuple = &mut route[dir];
            if tuple.xmit_type != XmitType::Direct {
                tuple.out.h_source = dev.dev_addr;
                tuple.out.ifindex = dev.ifindex;
            }
            tuple.xmit_type = XmitType::Direct;
        }

        let in_ = &mut route[!dir].in_;
        let walk = match path.kind {
            PathKind::Vlan(encap) => push_encap(in_, encap),

            PathKind::Pppoe { encap, h_dest } => {
                let walk = push_encap(in_, encap);
                if walk == Walk::Continue {
                    route[dir].out.h_dest = h_dest;
                }
                walk
            }

            PathKind::Bridge(mode) => match mode {
                BridgeVlanMode::Tag(encap) => push_encap(in_, encap),

                BridgeVlanMode::Untag => {
                    in_.encap.pop();
                    Walk::Continue
                }

                BridgeVlanMode::UntagHw => {
                    if let Some(top) = in_.encap.len().checked_sub(1) {
                        in_.ingress_vlans |= 1 << top;
                    }
                    Walk::Continue
                }

                BridgeVlanMode::Keep => Walk::Continue,
            },

            PathKind::Ethernet | PathKind::Dsa => Walk::Stop,
        };

        if walk == Walk::Stop {
            break;
        }
    }

    route[dir].out.hw_ifindex = dev.ifindex;
    route[!dir].in_.ifindex = dev.ifindex;
    *out_dev = dev;
}
