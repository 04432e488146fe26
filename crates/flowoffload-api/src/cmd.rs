// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

use super::Direction;
use super::NetId;
use super::TableKind;
use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;
use core::fmt::Display;
use serde::Deserialize;
use serde::Serialize;

/// The name the offload action is registered under.
pub const TARGET_NAME: &str = "FLOWOFFLOAD";

/// The revision of the offload action.
pub const TARGET_REVISION: u8 = 0;

/// The default interval between sweeps of an offload table.
pub const SWEEP_INTERVAL_DEF_MS: u64 = 1_000;

/// The default priority of the ingress interception hooks.
pub const HOOK_PRIORITY_DEF: i32 = 10;

bitflags::bitflags! {
    /// Flags accepted by the offload action.
    #[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
    pub struct OffloadFlags: u8 {
        /// Insert flows into the hardware-offload table.
        const HW = 0x1;
    }
}

/// The per-rule configuration of the offload action, as handed over
/// by the packet-filter framework.
///
/// The raw bits are kept as given so that unknown flags can be
/// rejected when the rule is checked.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct TargetInfo {
    pub flags: u8,
}

impl TargetInfo {
    pub const fn new(flags: OffloadFlags) -> Self {
        Self { flags: flags.bits() }
    }

    /// Validate the rule configuration.
    ///
    /// # Errors
    ///
    /// Any bit outside [`OffloadFlags::all()`] is rejected.
    pub fn check(&self) -> Result<OffloadFlags, OffloadError> {
        OffloadFlags::from_bits(self.flags).ok_or(OffloadError::BadFlags(self.flags))
    }

    /// The known flags, ignoring anything unknown.
    pub fn flags(&self) -> OffloadFlags {
        OffloadFlags::from_bits_truncate(self.flags)
    }
}

/// Configuration of the offload service.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct FlowOffloadCfg {
    /// How often a table with live hooks is swept, in milliseconds.
    /// Must be a non-zero multiple of 10.
    pub sweep_interval_ms: u64,

    /// The priority the ingress hooks are registered with.
    pub hook_priority: i32,
}

impl Default for FlowOffloadCfg {
    fn default() -> Self {
        Self {
            sweep_interval_ms: SWEEP_INTERVAL_DEF_MS,
            hook_priority: HOOK_PRIORITY_DEF,
        }
    }
}

impl FlowOffloadCfg {
    pub fn validate(&self) -> Result<(), OffloadError> {
        if self.sweep_interval_ms == 0 || self.sweep_interval_ms % 10 != 0 {
            return Err(OffloadError::BadState(format!(
                "sweep interval must be a non-zero multiple of 10ms: {}",
                self.sweep_interval_ms
            )));
        }

        Ok(())
    }
}

pub mod errno {
    pub const ENOENT: i32 = 2;
    pub const EAGAIN: i32 = 11;
    pub const ENOMEM: i32 = 12;
    pub const EEXIST: i32 = 17;
    pub const EINVAL: i32 = 22;
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum OffloadError {
    /// The action was configured with unknown flag bits.
    BadFlags(u8),
    BadState(String),
    /// A flow entry already exists for this connection.
    FlowExists,
    /// The flow store refused the entry.
    FlowInsert(String),
    NoMem,
    /// No route exists for the given direction of the connection.
    NoRoute(Direction),
    /// A flow store failed to initialise.
    TableInit {
        table: TableKind,
        msg: String,
    },
    /// The packet-filter framework refused the action registration.
    TargetRegister(String),
    System {
        errno: i32,
        msg: String,
    },
}

impl OffloadError {
    /// Convert to an errno value.
    pub fn to_errno(&self) -> i32 {
        use errno::*;

        match self {
            Self::BadFlags(_) => EINVAL,
            Self::BadState(_) => EINVAL,
            Self::FlowExists => EEXIST,
            Self::FlowInsert(_) => EINVAL,
            Self::NoMem => ENOMEM,
            Self::NoRoute(_) => ENOENT,
            Self::TableInit { .. } => EINVAL,
            Self::TargetRegister(_) => EINVAL,
            Self::System { errno, .. } => *errno,
        }
    }
}

impl Display for OffloadError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::BadFlags(flags) => write!(f, "unknown flags: 0x{flags:02X}"),
            Self::BadState(msg) => write!(f, "bad state: {msg}"),
            Self::FlowExists => write!(f, "flow already offloaded"),
            Self::FlowInsert(msg) => write!(f, "flow insert failed: {msg}"),
            Self::NoMem => write!(f, "out of memory"),
            Self::NoRoute(dir) => write!(f, "no route for {dir} direction"),
            Self::TableInit { table, msg } => {
                write!(f, "{table} table init failed: {msg}")
            }
            Self::TargetRegister(msg) => {
                write!(f, "target registration failed: {msg}")
            }
            Self::System { errno, msg } => write!(f, "errno {errno}: {msg}"),
        }
    }
}

/// One device hook of an offload table.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct HookDump {
    pub ifindex: u32,
    pub name: String,
    pub registered: bool,
    pub used: bool,
    pub net: Option<NetId>,
}

/// A dump of the hooks of an offload table.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct DumpHooksResp {
    pub table: TableKind,
    /// The namespace the table was bound to by its first flow.
    pub net: Option<NetId>,
    pub num_flows: u32,
    pub hooks: Vec<HookDump>,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn check_flags() {
        assert_eq!(TargetInfo { flags: 0 }.check(), Ok(OffloadFlags::empty()));
        assert_eq!(TargetInfo { flags: 1 }.check(), Ok(OffloadFlags::HW));
        assert_eq!(TargetInfo { flags: 0x3 }.check(), Err(OffloadError::BadFlags(0x3)));
        assert_eq!(OffloadError::BadFlags(0x80).to_errno(), errno::EINVAL);
    }

    #[test]
    fn cfg_interval() {
        assert!(FlowOffloadCfg::default().validate().is_ok());
        let cfg = FlowOffloadCfg { sweep_interval_ms: 15, ..Default::default() };
        assert!(cfg.validate().is_err());
        let cfg = FlowOffloadCfg { sweep_interval_ms: 0, ..Default::default() };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn cfg_from_json() {
        let cfg: FlowOffloadCfg = serde_json::from_str(
            r#"{ "sweep_interval_ms": 500, "hook_priority": -5 }"#,
        )
        .unwrap();
        assert_eq!(cfg.sweep_interval_ms, 500);
        assert_eq!(cfg.hook_priority, -5);
        assert!(cfg.validate().is_ok());
    }
}
