// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! A packet-filter framework recording every registration.
use flowoffload::api::NetId;
use flowoffload::api::TableKind;
use flowoffload::engine::hook::HookError;
use flowoffload::engine::hook::HookOps;
use flowoffload::engine::hook::PacketFilter;
use flowoffload::engine::hook::TargetReg;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum FilterEvent {
    Register { table: TableKind, ifindex: u32, net: NetId },
    Unregister { table: TableKind, ifindex: u32, net: NetId },
    RegisterTarget(&'static str),
    UnregisterTarget(&'static str),
}

#[derive(Default)]
pub struct MockFilter {
    pub events: Mutex<Vec<FilterEvent>>,
    /// The hooks currently installed.
    pub installed: Mutex<Vec<Arc<HookOps>>>,
    pub fail_hook: Mutex<Option<HookError>>,
    pub fail_target: Mutex<Option<HookError>>,
    /// Taken for the duration of every hook registration, like a host
    /// lock also held while device notifications are delivered. A test
    /// holding it parks the sweep inside registration.
    pub host_lock: Mutex<()>,
    /// Hook registrations entered, finished or not.
    pub reg_attempts: AtomicUsize,
}

impl MockFilter {
    pub fn events(&self) -> Vec<FilterEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn clear_events(&self) {
        self.events.lock().unwrap().clear();
    }

    pub fn is_installed(&self, table: TableKind, ifindex: u32) -> bool {
        self.installed
            .lock()
            .unwrap()
            .iter()
            .any(|ops| ops.table == table && ops.dev.ifindex == ifindex)
    }

    pub fn num_installed(&self) -> usize {
        self.installed.lock().unwrap().len()
    }

    pub fn count(&self, ev: &FilterEvent) -> usize {
        self.events.lock().unwrap().iter().filter(|e| *e == ev).count()
    }
}

impl PacketFilter for MockFilter {
    fn register_net_hook(
        &self,
        net: NetId,
        ops: &Arc<HookOps>,
    ) -> Result<(), HookError> {
        self.reg_attempts.fetch_add(1, Ordering::SeqCst);
        let _host = self.host_lock.lock().unwrap();

        if let Some(e) = self.fail_hook.lock().unwrap().clone() {
            return Err(e);
        }

        let mut installed = self.installed.lock().unwrap();
        if installed.iter().any(|o| Arc::ptr_eq(o, ops)) {
            return Err(HookError::Exists { dev: ops.dev.name.clone() });
        }
        installed.push(ops.clone());
        self.events.lock().unwrap().push(FilterEvent::Register {
            table: ops.table,
            ifindex: ops.dev.ifindex,
            net,
        });
        Ok(())
    }

    fn unregister_net_hook(&self, net: NetId, ops: &Arc<HookOps>) {
        self.installed.lock().unwrap().retain(|o| !Arc::ptr_eq(o, ops));
        self.events.lock().unwrap().push(FilterEvent::Unregister {
            table: ops.table,
            ifindex: ops.dev.ifindex,
            net,
        });
    }

    fn register_target(&self, target: &TargetReg) -> Result<(), HookError> {
        if let Some(e) = self.fail_target.lock().unwrap().clone() {
            return Err(e);
        }
        self.events.lock().unwrap().push(FilterEvent::RegisterTarget(target.name));
        Ok(())
    }

    fn unregister_target(&self, target: &TargetReg) {
        self.events.lock().unwrap().push(FilterEvent::UnregisterTarget(target.name));
    }
}
