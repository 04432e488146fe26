// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! A flow store keeping its entries in a list.
use flowoffload::api::AddrFamily;
use flowoffload::engine::conntrack::ConnRef;
use flowoffload::engine::flow_store::FlowBlockCommand;
use flowoffload::engine::flow_store::FlowOffloadEntry;
use flowoffload::engine::flow_store::FlowStore;
use flowoffload::engine::flow_store::FlowStoreError;
use flowoffload::engine::hook::Frame;
use flowoffload::engine::hook::HookVerdict;
use flowoffload::engine::netdev::DevRef;
use flowoffload::engine::netdev::NetDevice;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;

#[derive(Default)]
pub struct MockStore {
    pub flows: Mutex<Vec<FlowOffloadEntry>>,
    pub hw: AtomicBool,
    pub inited: AtomicBool,
    pub freed: AtomicBool,
    pub fail_init: Mutex<Option<FlowStoreError>>,
    pub fail_alloc: AtomicBool,
    pub fail_add: Mutex<Option<FlowStoreError>>,
    /// Report every walk as cut short after visiting all entries.
    pub again: AtomicBool,
    pub fail_iterate: Mutex<Option<FlowStoreError>>,
    pub setups: Mutex<Vec<(u32, FlowBlockCommand)>>,
    pub cleanups: Mutex<Vec<u32>>,
    pub fast_path_hits: AtomicU32,
}

impl MockStore {
    pub fn len_flows(&self) -> usize {
        self.flows.lock().unwrap().len()
    }

    pub fn contains(&self, ct: &ConnRef) -> bool {
        self.flows.lock().unwrap().iter().any(|f| Arc::ptr_eq(&f.ct, ct))
    }

    /// Drop the entry of `ct`, as the store would on expiry.
    pub fn expire(&self, ct: &ConnRef) {
        self.flows.lock().unwrap().retain(|f| !Arc::ptr_eq(&f.ct, ct));
    }

    pub fn setups(&self) -> Vec<(u32, FlowBlockCommand)> {
        self.setups.lock().unwrap().clone()
    }
}

impl FlowStore for MockStore {
    fn init(&self, hw: bool) -> Result<(), FlowStoreError> {
        if let Some(e) = self.fail_init.lock().unwrap().clone() {
            return Err(e);
        }
        self.hw.store(hw, Ordering::Relaxed);
        self.inited.store(true, Ordering::Relaxed);
        Ok(())
    }

    fn free(&self) {
        self.flows.lock().unwrap().clear();
        self.freed.store(true, Ordering::Relaxed);
    }

    fn alloc(&self, ct: &ConnRef) -> Option<FlowOffloadEntry> {
        if self.fail_alloc.load(Ordering::Relaxed) {
            return None;
        }
        Some(FlowOffloadEntry::new(ct.clone()))
    }

    fn add(&self, flow: FlowOffloadEntry) -> Result<(), FlowStoreError> {
        if let Some(e) = self.fail_add.lock().unwrap().clone() {
            return Err(e);
        }

        let mut flows = self.flows.lock().unwrap();
        if flows.iter().any(|f| Arc::ptr_eq(&f.ct, &flow.ct)) {
            return Err(FlowStoreError::Exists);
        }
        flows.push(flow);
        Ok(())
    }

    fn iterate(
        &self,
        f: &mut dyn FnMut(&FlowOffloadEntry),
    ) -> Result<(), FlowStoreError> {
        if let Some(e) = self.fail_iterate.lock().unwrap().clone() {
            return Err(e);
        }

        // Walk a copy so the callback may call back into the store.
        let flows = self.flows.lock().unwrap().clone();
        for flow in &flows {
            f(flow);
        }

        if self.again.load(Ordering::Relaxed) {
            return Err(FlowStoreError::Again);
        }
        Ok(())
    }

    fn len(&self) -> usize {
        self.len_flows()
    }

    fn cleanup(&self, dev: &NetDevice) {
        self.cleanups.lock().unwrap().push(dev.ifindex);
        self.flows.lock().unwrap().retain(|f| {
            !f.uses_ifindex(dev.ifindex)
                && f.tuplehash.iter().all(|t| t.oifidx != dev.ifindex)
        });
    }

    fn setup(
        &self,
        dev: &DevRef,
        cmd: FlowBlockCommand,
    ) -> Result<(), FlowStoreError> {
        self.setups.lock().unwrap().push((dev.ifindex, cmd));
        Ok(())
    }

    fn fast_path(&self, _family: AddrFamily, _frame: &mut Frame<'_>) -> HookVerdict {
        self.fast_path_hits.fetch_add(1, Ordering::Relaxed);
        HookVerdict::Stolen
    }
}
