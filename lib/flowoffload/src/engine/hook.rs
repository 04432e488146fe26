// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Device ingress hooks and the registry holding them.
//!
//! Every offload table keeps one hook per device its flows arrive on.
//! A hook is created pending from packet processing, installed with
//! the packet-filter framework by the table's sweep, and reaped by a
//! later sweep once no flow uses its device. The registry keeps the
//! hooks of both tables under a single lock.
//!
//! Installing or tearing down a hook may block, so it is never done
//! under the registry lock. Those walks take the lock, claim a single
//! hook, drop the lock for the blocking call and rescan from the
//! start, skipping hooks by state rather than position: the lists may
//! have changed while the lock was dropped.
//!
//! A hook claimed for installation may be revoked before the install
//! returns. Revocation never waits for the sweep: it removes the hook
//! and leaves the in-flight install for the sweep to undo once it sees
//! the hook is no longer listed.
use super::flow_store::StoreRef;
use super::netdev::DevRef;
use crate::ddi::sync::KMutex;
use crate::ddi::sync::KMutexGuard;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use flowoffload_api::AddrFamily;
use flowoffload_api::ETH_P_IP;
use flowoffload_api::ETH_P_IPV6;
use flowoffload_api::HookDump;
use flowoffload_api::NetId;
use flowoffload_api::TableKind;

/// The protocol family a hook or target is registered under.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProtocolFamily {
    Unspec,
    NetDev,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HookNum {
    Ingress,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HookVerdict {
    Accept,
    /// The fast path took the frame.
    Stolen,
}

/// An ingress frame, as handed to a device hook.
#[derive(Debug)]
pub struct Frame<'a> {
    pub ethertype: u16,
    pub data: &'a mut [u8],
}

/// A device hook's registration with the packet-filter framework.
pub struct HookOps {
    pub pf: ProtocolFamily,
    pub hooknum: HookNum,
    pub priority: i32,
    pub dev: DevRef,
    pub table: TableKind,
    store: StoreRef,
}

impl fmt::Debug for HookOps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookOps")
            .field("pf", &self.pf)
            .field("hooknum", &self.hooknum)
            .field("priority", &self.priority)
            .field("dev", &self.dev.name)
            .field("table", &self.table)
            .finish()
    }
}

impl HookOps {
    pub fn new(
        dev: DevRef,
        table: TableKind,
        priority: i32,
        store: StoreRef,
    ) -> Self {
        Self {
            pf: ProtocolFamily::NetDev,
            hooknum: HookNum::Ingress,
            priority,
            dev,
            table,
            store,
        }
    }

    /// Run the hook over an ingress frame.
    pub fn run(&self, frame: &mut Frame<'_>) -> HookVerdict {
        if self.store.is_empty() {
            return HookVerdict::Accept;
        }

        match frame.ethertype {
            ETH_P_IP => self.store.fast_path(AddrFamily::Ipv4, frame),
            ETH_P_IPV6 => self.store.fast_path(AddrFamily::Ipv6, frame),
            _ => HookVerdict::Accept,
        }
    }
}

/// A packet-filter action, as registered with the framework.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TargetReg {
    pub name: &'static str,
    pub revision: u8,
    pub family: ProtocolFamily,
}

#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum HookError {
    #[error("hook on {dev} already registered")]
    Exists { dev: String },
    #[error("device {dev} is going away")]
    DeviceGone { dev: String },
    #[error("target {0} already registered")]
    TargetExists(&'static str),
    #[error("{0}")]
    Other(String),
}

/// The packet-filter framework the engine plugs into.
pub trait PacketFilter: Send + Sync {
    /// Install `ops` in namespace `net`. The framework keeps its own
    /// reference until the hook is unregistered.
    fn register_net_hook(
        &self,
        net: NetId,
        ops: &Arc<HookOps>,
    ) -> Result<(), HookError>;

    fn unregister_net_hook(&self, net: NetId, ops: &Arc<HookOps>);

    fn register_target(&self, target: &TargetReg) -> Result<(), HookError>;

    fn unregister_target(&self, target: &TargetReg);
}

/// One device's hook in one offload table.
#[derive(Debug)]
pub struct Hook {
    pub ops: Arc<HookOps>,
    /// The namespace the hook was installed in; set once, on install.
    pub net: Option<NetId>,
    pub registered: bool,
    /// Claimed by a sweep whose install has not returned yet.
    pub installing: bool,
    pub used: bool,
}

impl Hook {
    fn new(ops: HookOps) -> Self {
        Self {
            ops: Arc::new(ops),
            net: None,
            registered: false,
            installing: false,
            used: false,
        }
    }

    pub fn dev(&self) -> &DevRef {
        &self.ops.dev
    }

    pub fn dump(&self) -> HookDump {
        HookDump {
            ifindex: self.ops.dev.ifindex,
            name: self.ops.dev.name.clone(),
            registered: self.registered,
            used: self.used,
            net: self.net,
        }
    }
}

/// A hook claimed for a blocking call outside the registry lock.
#[derive(Clone, Debug)]
pub struct Claimed {
    pub ops: Arc<HookOps>,
    pub net: NetId,
}

/// The result of [`HookRegistry::ensure()`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Ensure {
    /// The hook existed and was marked used.
    Used,
    /// A pending hook was created.
    Created,
    /// The hook could not be allocated.
    NoMem,
}

pub type HookLists = [Vec<Hook>; 2];

/// The hooks of both offload tables.
#[derive(Default)]
pub struct HookRegistry {
    lists: KMutex<HookLists>,
}

fn position(list: &[Hook], dev: &DevRef) -> Option<usize> {
    list.iter().position(|h| Arc::ptr_eq(h.dev(), dev))
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self) -> KMutexGuard<'_, HookLists> {
        self.lists.lock()
    }

    /// Mark the hook of `dev` used, creating it pending if the table
    /// has none. Allocation failure is reported, not fatal.
    pub fn ensure(
        &self,
        table: TableKind,
        dev: &DevRef,
        mk_ops: impl FnOnce() -> HookOps,
    ) -> Ensure {
        let mut lists = self.lists.lock();
        let list = &mut lists[table.idx()];

        if let Some(i) = position(list, dev) {
            list[i].used = true;
            return Ensure::Used;
        }

        if list.try_reserve(1).is_err() {
            return Ensure::NoMem;
        }

        list.push(Hook::new(mk_ops()));
        Ensure::Created
    }

    pub fn lookup(&self, table: TableKind, dev: &DevRef) -> Option<HookDump> {
        let lists = self.lists.lock();
        let list = &lists[table.idx()];
        position(list, dev).map(|i| list[i].dump())
    }

    pub fn len(&self, table: TableKind) -> usize {
        self.lists.lock()[table.idx()].len()
    }

    pub fn dump(&self, table: TableKind) -> Vec<HookDump> {
        self.lists.lock()[table.idx()].iter().map(Hook::dump).collect()
    }

    /// Claim the next pending hook of `table`, binding it to its
    /// device's namespace. The caller performs the installation after
    /// dropping the guard, then reports back with
    /// [`HookRegistry::finish_install()`].
    pub fn claim_pending(
        lists: &mut HookLists,
        table: TableKind,
    ) -> Option<Claimed> {
        let hook = lists[table.idx()]
            .iter_mut()
            .find(|h| !h.registered && !h.installing)?;
        let net = hook.ops.dev.net;
        hook.installing = true;
        hook.net = Some(net);
        Some(Claimed { ops: Arc::clone(&hook.ops), net })
    }

    /// Mark the claimed hook `ops` installed. Returns false if it was
    /// revoked while the install was in flight, in which case the
    /// caller owns undoing the install.
    pub fn finish_install(&self, table: TableKind, ops: &Arc<HookOps>) -> bool {
        let mut lists = self.lists.lock();
        match lists[table.idx()].iter_mut().find(|h| Arc::ptr_eq(&h.ops, ops)) {
            Some(hook) => {
                hook.installing = false;
                hook.registered = true;
                true
            }

            None => false,
        }
    }

    pub fn reset_used(lists: &mut HookLists, table: TableKind) {
        for hook in lists[table.idx()].iter_mut() {
            hook.used = false;
        }
    }

    /// Mark used every hook of `table` on a device with one of the
    /// given indices.
    pub fn mark_used(&self, table: TableKind, ifindex: [u32; 2]) {
        let mut lists = self.lists.lock();
        for hook in lists[table.idx()].iter_mut() {
            if ifindex.contains(&hook.ops.dev.ifindex) {
                hook.used = true;
            }
        }
    }

    /// Remove the next installed, unused hook of `table`. `active` is
    /// set if any hook passed over is still used or still pending.
    pub fn take_unused(
        &self,
        table: TableKind,
        active: &mut bool,
    ) -> Option<Hook> {
        let mut lists = self.lists.lock();
        let list = &mut lists[table.idx()];
        let mut found = None;

        for (i, hook) in list.iter().enumerate() {
            if hook.used || !hook.registered {
                *active = true;
                continue;
            }
            found = Some(i);
            break;
        }

        found.map(|i| list.swap_remove(i))
    }

    /// Remove the hooks of `dev` from both tables at once.
    pub fn take_device(&self, dev: &DevRef) -> [Option<Hook>; 2] {
        let mut lists = self.lists.lock();
        TableKind::ALL.map(|table| {
            let list = &mut lists[table.idx()];
            position(list, dev).map(|i| list.swap_remove(i))
        })
    }

    /// Remove the hook of `dev` from `table`, whatever its state.
    pub fn take(&self, table: TableKind, dev: &DevRef) -> Option<Hook> {
        let mut lists = self.lists.lock();
        let list = &mut lists[table.idx()];
        position(list, dev).map(|i| list.swap_remove(i))
    }

    /// Remove every hook of `table`.
    pub fn drain(&self, table: TableKind) -> Vec<Hook> {
        let mut lists = self.lists.lock();
        core::mem::take(&mut lists[table.idx()])
    }
}
