// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

use core::fmt;
use core::fmt::Display;
use serde::Deserialize;
use serde::Serialize;

/// The maximum number of encapsulation layers an offloaded flow may
/// carry on ingress.
pub const ENCAP_MAX: usize = 2;

pub const ETH_P_IP: u16 = 0x0800;
pub const ETH_P_IPV6: u16 = 0x86DD;
pub const ETH_P_8021Q: u16 = 0x8100;
pub const ETH_P_8021AD: u16 = 0x88A8;
pub const ETH_P_PPP_SES: u16 = 0x8864;

/// One pushed header along a device's forwarding path: an 802.1Q/AD
/// tag or a PPPoE session.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq, Serialize,
)]
pub struct Encap {
    /// The VLAN ID or PPPoE session ID.
    pub id: u16,
    /// The ethertype identifying the layer.
    pub proto: u16,
}

impl Encap {
    pub const fn vlan(id: u16) -> Self {
        Self { id, proto: ETH_P_8021Q }
    }

    pub const fn pppoe(sid: u16) -> Self {
        Self { id: sid, proto: ETH_P_PPP_SES }
    }
}

impl Display for Encap {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.proto {
            ETH_P_8021Q => write!(f, "vlan {}", self.id),
            ETH_P_8021AD => write!(f, "qinq {}", self.id),
            ETH_P_PPP_SES => write!(f, "pppoe {}", self.id),
            proto => write!(f, "0x{proto:04X} {}", self.id),
        }
    }
}
