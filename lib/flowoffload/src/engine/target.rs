// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The offload action: which packets may trigger an offload.
use super::Direction;
use super::conntrack::ConnRef;
use super::conntrack::CtStatus;
use super::netdev::DevRef;
use core::fmt;
use flowoffload_api::AddrFamily;
use flowoffload_api::NetId;
use flowoffload_api::Protocol;
use flowoffload_api::TargetInfo;
use flowoffload_api::TcpFlags;
use flowoffload_api::TcpState;

/// The action always lets the packet carry on through the ruleset.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TargetVerdict {
    Continue,
}

/// The per-invocation parameters handed over by the packet-filter
/// framework.
#[derive(Clone, Debug)]
pub struct ActionParam {
    pub family: AddrFamily,
    pub net: NetId,
    pub in_dev: Option<DevRef>,
    pub out_dev: Option<DevRef>,
    pub info: TargetInfo,
}

/// What the action needs to know of the packet itself.
#[derive(Clone)]
pub struct PacketInfo {
    /// The packet is in the middle of IPsec processing.
    pub sec_path: bool,
    /// The length of the IPv4 options, zero for IPv6.
    pub ip_opt_len: u8,
    /// The TCP control bits, if a full TCP header could be read.
    pub tcp_flags: Option<TcpFlags>,
    /// The tracked connection and the direction of this packet.
    pub ct: Option<(ConnRef, Direction)>,
}

impl fmt::Debug for PacketInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketInfo")
            .field("sec_path", &self.sec_path)
            .field("ip_opt_len", &self.ip_opt_len)
            .field("tcp_flags", &self.tcp_flags)
            .field("ct", &self.ct.as_ref().map(|(ct, dir)| (ct.tuple(*dir), *dir)))
            .finish()
    }
}

/// Why a packet did not trigger an offload.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SkipReason {
    SecPath,
    IpOptions,
    NoConntrack,
    Protocol,
    TcpState,
    TcpFinRst,
    Helper,
    SeqAdjust,
    Unconfirmed,
    NoDevice,
    InProgress,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::SecPath => "sec_path",
            Self::IpOptions => "ip_options",
            Self::NoConntrack => "no_conntrack",
            Self::Protocol => "protocol",
            Self::TcpState => "tcp_state",
            Self::TcpFinRst => "tcp_fin_rst",
            Self::Helper => "helper",
            Self::SeqAdjust => "seq_adjust",
            Self::Unconfirmed => "unconfirmed",
            Self::NoDevice => "no_device",
            Self::InProgress => "in_progress",
        };
        write!(f, "{s}")
    }
}

/// A packet which passed every eligibility check.
pub struct Eligible {
    pub ct: ConnRef,
    pub dir: Direction,
    pub is_tcp: bool,
    /// The devices each direction leaves through.
    pub devs: [DevRef; 2],
}

/// Check whether the packet may offload its connection, short of
/// claiming the connection's offload bit.
///
/// Checks run in a fixed order, and none of them has a side effect.
pub fn check_eligible(
    pkt: &PacketInfo,
    par: &ActionParam,
) -> Result<Eligible, SkipReason> {
    if pkt.sec_path {
        return Err(SkipReason::SecPath);
    }

    if par.family == AddrFamily::Ipv4 && pkt.ip_opt_len != 0 {
        return Err(SkipReason::IpOptions);
    }

    let (ct, dir) = pkt.ct.clone().ok_or(SkipReason::NoConntrack)?;

    let is_tcp = match ct.protocol() {
        Protocol::Tcp => {
            if ct.tcp_state() != TcpState::Established {
                return Err(SkipReason::TcpState);
            }

            match pkt.tcp_flags {
                Some(flags)
                    if !flags.intersects(TcpFlags::FIN | TcpFlags::RST) => {}
                _ => return Err(SkipReason::TcpFinRst),
            }
            true
        }

        Protocol::Udp => false,

        _ => return Err(SkipReason::Protocol),
    };

    if ct.has_helper() {
        return Err(SkipReason::Helper);
    }

    if ct.status().contains(CtStatus::SEQ_ADJUST) {
        return Err(SkipReason::SeqAdjust);
    }

    if !ct.is_confirmed() {
        return Err(SkipReason::Unconfirmed);
    }

    // The packet leaves through the device of its own direction, and
    // came in through the device the opposite direction leaves by.
    let (Some(out_dev), Some(in_dev)) = (&par.out_dev, &par.in_dev) else {
        return Err(SkipReason::NoDevice);
    };

    let devs = match dir {
        Direction::Original => [out_dev.clone(), in_dev.clone()],
        Direction::Reply => [in_dev.clone(), out_dev.clone()],
    };

    Ok(Eligible { ct, dir, is_tcp, devs })
}
