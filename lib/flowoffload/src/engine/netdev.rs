// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Network devices and their forwarding topology.
use super::route::DstEntry;
use alloc::string::String;
use alloc::sync::Arc;
use core::fmt;
use core::net::IpAddr;
use flowoffload_api::ETH_ALEN;
use flowoffload_api::Encap;
use flowoffload_api::MacAddr;
use flowoffload_api::NetId;

/// Ethernet hardware type (`ARPHRD_ETHER`).
pub const ARPHRD_ETHER: u16 = 1;
pub const ARPHRD_LOOPBACK: u16 = 772;

/// The deepest forwarding path a device may report.
pub const NET_DEVICE_PATH_STACK_MAX: usize = 5;

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct IfFlags: u32 {
        const UP = 0x1;
        const BROADCAST = 0x2;
        const LOOPBACK = 0x8;
    }
}

/// A network device.
///
/// Devices are compared by identity ([`Arc::ptr_eq`]) wherever a hook
/// is looked up, and by `ifindex` where only the index survives, as in
/// a stored flow.
#[derive(Debug)]
pub struct NetDevice {
    pub ifindex: u32,
    pub name: String,
    pub flags: IfFlags,
    pub hw_type: u16,
    pub addr_len: u8,
    pub dev_addr: MacAddr,
    pub net: NetId,
}

pub type DevRef = Arc<NetDevice>;

impl NetDevice {
    /// A plain Ethernet device with a usable station address: the only
    /// kind of device a direct link-layer rewrite can target.
    pub fn is_valid_ether_device(&self) -> bool {
        !self.flags.contains(IfFlags::LOOPBACK)
            && self.hw_type == ARPHRD_ETHER
            && self.addr_len == ETH_ALEN
            && self.dev_addr.is_valid_ether()
    }
}

impl fmt::Display for NetDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name, self.ifindex)
    }
}

/// Device notifications delivered by the host.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NetdevEvent {
    Register,
    Up,
    Down,
    ChangeAddr,
    Unregister,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NotifyVerdict {
    Done,
    Ok,
}

bitflags::bitflags! {
    /// Neighbour cache entry states.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct NudState: u8 {
        const INCOMPLETE = 0x01;
        const REACHABLE = 0x02;
        const STALE = 0x04;
        const DELAY = 0x08;
        const PROBE = 0x10;
        const FAILED = 0x20;
        const NOARP = 0x40;
        const PERMANENT = 0x80;
    }
}

impl NudState {
    /// The states in which the link-layer address may be used.
    pub const VALID: Self = Self::PERMANENT
        .union(Self::NOARP)
        .union(Self::REACHABLE)
        .union(Self::PROBE)
        .union(Self::STALE)
        .union(Self::DELAY);
}

/// A resolved neighbour, copied out of the cache.
#[derive(Clone, Copy, Debug)]
pub struct Neighbour {
    pub ha: MacAddr,
    pub nud_state: NudState,
}

/// What a bridge does with the VLAN tag of a forwarded frame.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BridgeVlanMode {
    /// Leave the frame as is.
    Keep,
    /// Push a tag.
    Tag(Encap),
    /// Pop a tag.
    Untag,
    /// The tag is stripped by hardware on ingress.
    UntagHw,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PathKind {
    Ethernet,
    Vlan(Encap),
    Pppoe { encap: Encap, h_dest: MacAddr },
    Bridge(BridgeVlanMode),
    Dsa,
}

/// One segment of a device's forwarding path.
#[derive(Clone, Debug)]
pub struct NetDevicePath {
    pub dev: DevRef,
    pub kind: PathKind,
}

pub type PathStack = heapless::Vec<NetDevicePath, NET_DEVICE_PATH_STACK_MAX>;

#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum PathError {
    #[error("device {0} has no forwarding path")]
    NoPath(String),
    #[error("forwarding path of {0} exceeds {NET_DEVICE_PATH_STACK_MAX} segments")]
    TooDeep(String),
}

/// The host's device and neighbour state.
pub trait DeviceTopology: Send + Sync {
    /// Resolve the link-layer address of `daddr` reached through
    /// `dst`.
    fn neigh_lookup(&self, dst: &dyn DstEntry, daddr: IpAddr)
    -> Option<Neighbour>;

    /// The segments a frame sent on `dev` toward `daddr` traverses,
    /// from `dev` down to the device that finally transmits it.
    fn fill_forward_path(
        &self,
        dev: &DevRef,
        daddr: MacAddr,
    ) -> Result<PathStack, PathError>;
}

#[cfg(test)]
mod test {
    use super::*;

    fn dev(flags: IfFlags, hw_type: u16, mac: &str) -> NetDevice {
        NetDevice {
            ifindex: 2,
            name: "eth0".into(),
            flags,
            hw_type,
            addr_len: ETH_ALEN,
            dev_addr: mac.parse().unwrap(),
            net: NetId::INIT,
        }
    }

    #[test]
    fn valid_ether_device() {
        assert!(dev(IfFlags::UP, ARPHRD_ETHER, "a8:40:25:00:00:02").is_valid_ether_device());
        assert!(
            !dev(IfFlags::UP | IfFlags::LOOPBACK, ARPHRD_ETHER, "a8:40:25:00:00:02")
                .is_valid_ether_device()
        );
        assert!(!dev(IfFlags::UP, ARPHRD_LOOPBACK, "a8:40:25:00:00:02").is_valid_ether_device());
        assert!(!dev(IfFlags::UP, ARPHRD_ETHER, "ff:ff:ff:ff:ff:ff").is_valid_ether_device());

        let mut d = dev(IfFlags::UP, ARPHRD_ETHER, "a8:40:25:00:00:02");
        d.addr_len = 8;
        assert!(!d.is_valid_ether_device());
    }

    #[test]
    fn nud_valid() {
        assert!(NudState::REACHABLE.intersects(NudState::VALID));
        assert!(NudState::STALE.intersects(NudState::VALID));
        assert!(!NudState::INCOMPLETE.intersects(NudState::VALID));
        assert!(!NudState::FAILED.intersects(NudState::VALID));
    }
}
