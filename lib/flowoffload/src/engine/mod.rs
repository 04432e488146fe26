// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The offload engine.
//!
//! Collaborators the engine consumes but does not own (connection
//! tracking, routing, the device topology, the flow store, the
//! packet-filter framework) are reached through the traits in
//! [`conntrack`], [`route`], [`netdev`], [`flow_store`] and [`hook`].
pub mod conntrack;
pub mod flow_store;
pub mod hook;
pub mod netdev;
pub mod offload;
pub mod path;
pub mod route;
pub mod stat;
pub mod sweep;
pub mod table;
pub mod target;

pub use flowoffload_api::Direction;

use core::sync::atomic::AtomicBool;

/// When set, [`dbg!`] messages are emitted.
pub static FLOWOFFLOAD_DEBUG: AtomicBool = AtomicBool::new(false);

#[macro_export]
macro_rules! dbg_macro {
    ($s:tt) => {
        if $crate::engine::FLOWOFFLOAD_DEBUG
            .load(::core::sync::atomic::Ordering::Relaxed)
        {
            println!($s);
        }
    };
    ($s:tt, $($arg:tt)*) => {
        if $crate::engine::FLOWOFFLOAD_DEBUG
            .load(::core::sync::atomic::Ordering::Relaxed)
        {
            println!($s, $($arg)*);
        }
    };
}

#[macro_export]
macro_rules! err_macro {
    ($s:tt) => {
        println!(concat!("ERROR: ", $s));
    };
    ($s:tt, $($arg:tt)*) => {
        println!(concat!("ERROR: ", $s), $($arg)*);
    };
}

pub use dbg_macro as dbg;
pub use err_macro as err;
