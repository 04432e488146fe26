// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

#![no_std]
#![deny(unreachable_patterns)]
#![deny(unused_must_use)]

#[cfg(any(feature = "std", test))]
#[macro_use]
extern crate std;

#[macro_use]
extern crate alloc;

use alloc::string::String;
use core::fmt;
use core::fmt::Display;
use core::ops::Not;
use serde::Deserialize;
use serde::Serialize;

pub mod cmd;
pub mod encap;
pub mod ip;
pub mod mac;
pub mod tcp;

pub use cmd::*;
pub use encap::*;
pub use ip::*;
pub use mac::*;
pub use tcp::*;

/// The direction of a tracked connection, as seen by the connection
/// tracker.
///
/// `Original` is the direction of the first packet the tracker saw;
/// `Reply` is the other half of the same connection. Both halves of
/// an offloaded flow are indexed by this value.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize,
)]
pub enum Direction {
    Original = 0,
    Reply = 1,
}

impl Direction {
    /// Index into any two-element array keyed on direction.
    #[inline]
    pub const fn idx(self) -> usize {
        self as usize
    }

    pub const fn reverse(self) -> Self {
        match self {
            Self::Original => Self::Reply,
            Self::Reply => Self::Original,
        }
    }
}

impl Not for Direction {
    type Output = Self;

    fn not(self) -> Self::Output {
        self.reverse()
    }
}

impl core::str::FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> core::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "original" | "orig" => Ok(Direction::Original),
            "reply" => Ok(Direction::Reply),
            _ => Err(format!("invalid direction: {}", s)),
        }
    }
}

impl Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let dirstr = match self {
            Direction::Original => "ORIGINAL",
            Direction::Reply => "REPLY",
        };

        write!(f, "{}", dirstr)
    }
}

/// The two offload tables that exist for the lifetime of the
/// service.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize,
)]
pub enum TableKind {
    /// Flows forwarded by the software fast path only.
    Software = 0,
    /// Flows additionally programmed into hardware forwarding rules.
    Hardware = 1,
}

impl TableKind {
    pub const ALL: [TableKind; 2] = [TableKind::Software, TableKind::Hardware];

    #[inline]
    pub const fn idx(self) -> usize {
        self as usize
    }

    /// Select the table for a set of action flags.
    pub fn from_flags(flags: OffloadFlags) -> Self {
        if flags.contains(OffloadFlags::HW) {
            Self::Hardware
        } else {
            Self::Software
        }
    }
}

impl Display for TableKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            TableKind::Software => "sw",
            TableKind::Hardware => "hw",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn direction_reverse() {
        assert_eq!(!Direction::Original, Direction::Reply);
        assert_eq!(!Direction::Reply, Direction::Original);
        assert_eq!(Direction::Original.idx(), 0);
        assert_eq!(Direction::Reply.idx(), 1);
        assert_eq!("reply".parse::<Direction>().unwrap(), Direction::Reply);
        assert!("sideways".parse::<Direction>().is_err());
    }

    #[test]
    fn table_from_flags() {
        assert_eq!(TableKind::from_flags(OffloadFlags::empty()), TableKind::Software);
        assert_eq!(TableKind::from_flags(OffloadFlags::HW), TableKind::Hardware);
    }
}
