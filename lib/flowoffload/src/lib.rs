// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Flow offload admission and hook lifecycle.
//!
//! A packet-filter action inspects tracked connections at a late
//! post-routing stage and, once a connection is eligible, resolves the
//! egress path of both directions and installs a fast-path entry in
//! one of two offload tables. Each table keeps a set of device ingress
//! hooks which are installed and reaped by a periodic sweep, driven by
//! which devices the live flows actually use.
#![allow(clippy::len_without_is_empty)]
#![deny(unreachable_patterns)]
#![deny(unused_must_use)]
// Enable features needed for USDT, if needed.
#![cfg_attr(all(feature = "usdt", not(usdt_stable_asm)), feature(asm))]
#![cfg_attr(
    all(feature = "usdt", target_os = "macos", not(usdt_stable_asm_sym)),
    feature(asm_sym)
)]

#[macro_use]
extern crate alloc;

#[macro_use]
extern crate cfg_if;

// This is needed so that the kstat-macro (`#[derive(KStatProvider)]`)
// can use fully-qualified type paths.
extern crate self as flowoffload;

pub mod api {
    pub use flowoffload_api::*;
}
pub mod ddi;
pub mod engine;
pub mod print;
pub mod provider;

// ================================================================
// DTrace USDT Provider
//
// Allowing us to trace hook and admission events when running in
// std/test.
// ================================================================
#[cfg(feature = "usdt")]
#[usdt::provider]
mod flowoffload_provider {
    fn hook__create(table: &str, ifindex: u32, dev: &str) {}
    fn hook__register(table: &str, ifindex: u32, dev: &str, net: u32) {}
    fn hook__reap(table: &str, ifindex: u32, dev: &str) {}
    fn hook__revoke(table: &str, ifindex: u32, dev: &str) {}
    fn offload__add(table: &str, dir: &str, iif: u32, oif: u32) {}
    fn offload__skip(dir: &str, reason: &str) {}
    fn sweep__done(table: &str, hooks: u64, resched: u8) {}
}
