// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The view of a tracked connection.
//!
//! The connection tracker owns its records; the engine only reads
//! their addressing and state, and flips the offload bit.
use super::Direction;
use alloc::sync::Arc;
use core::fmt;
use core::net::IpAddr;
use core::sync::atomic::AtomicU32;
use core::sync::atomic::Ordering;
use flowoffload_api::Protocol;
use flowoffload_api::TcpState;

bitflags::bitflags! {
    /// Status bits of a tracked connection.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct CtStatus: u32 {
        /// Both directions have been seen.
        const SEEN_REPLY = 1 << 1;
        /// The connection has been inserted into the tracker's table.
        const CONFIRMED = 1 << 3;
        /// TCP sequence numbers are being rewritten.
        const SEQ_ADJUST = 1 << 6;
        /// The connection is (being) offloaded.
        const OFFLOAD = 1 << 14;
    }
}

/// The status word of a tracked connection.
///
/// Every update is a single atomic operation, so concurrent packets of
/// the same connection on different CPUs race safely.
#[derive(Debug, Default)]
pub struct ConnStatus(AtomicU32);

impl ConnStatus {
    pub fn new(status: CtStatus) -> Self {
        Self(AtomicU32::new(status.bits()))
    }

    pub fn get(&self) -> CtStatus {
        CtStatus::from_bits_retain(self.0.load(Ordering::Acquire))
    }

    pub fn contains(&self, bits: CtStatus) -> bool {
        self.get().contains(bits)
    }

    pub fn insert(&self, bits: CtStatus) {
        self.0.fetch_or(bits.bits(), Ordering::AcqRel);
    }

    /// Set `bits`, returning whether they were all already set.
    pub fn test_and_set(&self, bits: CtStatus) -> bool {
        let prev = self.0.fetch_or(bits.bits(), Ordering::AcqRel);
        CtStatus::from_bits_retain(prev).contains(bits)
    }

    pub fn clear(&self, bits: CtStatus) {
        self.0.fetch_and(!bits.bits(), Ordering::AcqRel);
    }
}

/// One direction of a connection's addressing.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ConnTuple {
    pub src: IpAddr,
    pub dst: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub proto: Protocol,
}

impl fmt::Display for ConnTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}:{}",
            self.proto, self.src, self.src_port, self.dst, self.dst_port
        )
    }
}

/// A tracked connection.
pub trait Conn: Send + Sync {
    /// The addressing of the connection as seen in direction `dir`.
    fn tuple(&self, dir: Direction) -> ConnTuple;

    /// The tracker's view of the TCP state. Meaningless for other
    /// protocols.
    fn tcp_state(&self) -> TcpState;

    /// Is a protocol helper attached to the connection?
    fn has_helper(&self) -> bool;

    fn status(&self) -> &ConnStatus;

    /// Relax TCP window tracking in both directions. Once a flow is
    /// offloaded the tracker no longer sees every segment.
    fn set_tcp_be_liberal(&self);

    /// The layer 4 protocol, as recorded in the original direction.
    fn protocol(&self) -> Protocol {
        self.tuple(Direction::Original).proto
    }

    fn is_confirmed(&self) -> bool {
        self.status().contains(CtStatus::CONFIRMED)
    }

    fn is_offloaded(&self) -> bool {
        self.status().contains(CtStatus::OFFLOAD)
    }
}

pub type ConnRef = Arc<dyn Conn>;
