// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! An offload table and the schedule of its sweep.
use super::flow_store::StoreRef;
use crate::ddi::sync::KCondvar;
use crate::ddi::sync::KMutex;
use crate::ddi::sync::Token;
use crate::ddi::sync::TokenLock;
use crate::ddi::time::Interval;
use crate::ddi::time::Moment;
use flowoffload_api::NetId;
use flowoffload_api::TableKind;

#[derive(Debug, Default)]
struct Schedule {
    /// When the sweep is next due; `None` while idle.
    next: Option<Moment>,
    shutdown: bool,
}

/// What a sweep runner should do next.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Wake {
    Sweep,
    Shutdown,
}

/// The bookkeeping carried by a table's sweep token.
#[derive(Debug, Default)]
pub struct SweepLog {
    pub cycles: u64,
    pub last: Option<Moment>,
}

/// One offload class: a flow store plus the schedule of the sweep
/// reconciling its hooks. The hooks themselves live in the service's
/// [`HookRegistry`](super::hook::HookRegistry).
pub struct OffloadTable {
    kind: TableKind,
    store: StoreRef,
    /// The namespace of the first flow offloaded into the table.
    net: KMutex<Option<NetId>>,
    sched: KMutex<Schedule>,
    cv: KCondvar,
    interval: Interval,
    sweep: TokenLock<SweepLog>,
}

impl OffloadTable {
    pub fn new(kind: TableKind, store: StoreRef, interval: Interval) -> Self {
        Self {
            kind,
            store,
            net: KMutex::new(None),
            sched: KMutex::new(Schedule::default()),
            cv: KCondvar::new(),
            interval,
            sweep: TokenLock::new(SweepLog::default()),
        }
    }

    pub fn kind(&self) -> TableKind {
        self.kind
    }

    pub fn store(&self) -> &StoreRef {
        &self.store
    }

    pub fn is_hw(&self) -> bool {
        self.kind == TableKind::Hardware
    }

    pub fn interval(&self) -> Interval {
        self.interval
    }

    pub fn net(&self) -> Option<NetId> {
        *self.net.lock()
    }

    /// Bind the table to `net` unless it is already bound.
    pub fn bind_net(&self, net: NetId) {
        let mut cur = self.net.lock();
        if cur.is_none() {
            *cur = Some(net);
        }
    }

    /// Run the sweep as soon as possible, pulling in any later run
    /// already queued.
    pub fn schedule_now(&self) {
        let mut sched = self.sched.lock();
        sched.next = Some(Moment::now());
        self.cv.notify_all();
    }

    /// Queue the sweep one interval from now. A run already queued is
    /// left as is.
    pub fn schedule_later(&self) {
        let mut sched = self.sched.lock();
        if sched.next.is_none() {
            sched.next = Some(Moment::now() + self.interval.as_duration());
            self.cv.notify_all();
        }
    }

    /// When the sweep is next due, if it is queued at all.
    pub fn sweep_pending(&self) -> Option<Moment> {
        self.sched.lock().next
    }

    /// Dequeue the sweep if it is due at `now`.
    pub fn take_due(&self, now: Moment) -> bool {
        let mut sched = self.sched.lock();
        match sched.next {
            Some(when) if when <= now => {
                sched.next = None;
                true
            }
            _ => false,
        }
    }

    /// Block until the sweep is due or the table shuts down. A due
    /// sweep is dequeued before returning.
    pub fn wait_due(&self) -> Wake {
        let mut sched = self.sched.lock();

        loop {
            if sched.shutdown {
                return Wake::Shutdown;
            }

            let now = Moment::now();
            match sched.next {
                None => sched = self.cv.wait(sched),

                Some(when) if when <= now => {
                    sched.next = None;
                    return Wake::Sweep;
                }

                Some(when) => {
                    sched = self.cv.wait_timeout(sched, now.saturating_until(when));
                }
            }
        }
    }

    pub fn shutdown(&self) {
        let mut sched = self.sched.lock();
        sched.shutdown = true;
        sched.next = None;
        self.cv.notify_all();
    }

    pub fn is_shutdown(&self) -> bool {
        self.sched.lock().shutdown
    }

    /// Enter the sweep. Only one sweep of a table runs at a time.
    pub fn sweep_token(&self) -> Token<'_, SweepLog> {
        self.sweep.lock()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::engine::flow_store::FlowBlockCommand;
    use crate::engine::flow_store::FlowOffloadEntry;
    use crate::engine::flow_store::FlowStore;
    use crate::engine::flow_store::FlowStoreError;
    use crate::engine::hook::Frame;
    use crate::engine::hook::HookVerdict;
    use crate::engine::netdev::DevRef;
    use crate::engine::netdev::NetDevice;
    use alloc::sync::Arc;
    use core::time::Duration;
    use flowoffload_api::AddrFamily;

    struct Empty;

    impl FlowStore for Empty {
        fn init(&self, _hw: bool) -> Result<(), FlowStoreError> {
            Ok(())
        }

        fn free(&self) {}

        fn add(&self, _flow: FlowOffloadEntry) -> Result<(), FlowStoreError> {
            Err(FlowStoreError::NoMem)
        }

        fn iterate(
            &self,
            _f: &mut dyn FnMut(&FlowOffloadEntry),
        ) -> Result<(), FlowStoreError> {
            Ok(())
        }

        fn len(&self) -> usize {
            0
        }

        fn cleanup(&self, _dev: &NetDevice) {}

        fn setup(
            &self,
            _dev: &DevRef,
            _cmd: FlowBlockCommand,
        ) -> Result<(), FlowStoreError> {
            Ok(())
        }

        fn fast_path(&self, _family: AddrFamily, _frame: &mut Frame<'_>) -> HookVerdict {
            HookVerdict::Accept
        }
    }

    fn table() -> OffloadTable {
        OffloadTable::new(
            TableKind::Software,
            Arc::new(Empty),
            Interval::from_millis(1_000).unwrap(),
        )
    }

    #[test]
    fn schedule_now_overrides_later() {
        let t = table();
        assert!(t.sweep_pending().is_none());

        t.schedule_later();
        let later = t.sweep_pending().unwrap();
        assert!(!t.take_due(Moment::now()));

        // A queued run is not pushed back.
        t.schedule_later();
        assert_eq!(t.sweep_pending(), Some(later));

        t.schedule_now();
        assert!(t.sweep_pending().unwrap() < later);
        assert!(t.take_due(Moment::now() + Duration::from_millis(1)));
        assert!(t.sweep_pending().is_none());
    }

    #[test]
    fn bind_net_once() {
        let t = table();
        t.bind_net(NetId(7));
        t.bind_net(NetId(9));
        assert_eq!(t.net(), Some(NetId(7)));
    }

    #[test]
    fn shutdown_wakes_waiter() {
        let t = Arc::new(table());
        let t2 = t.clone();
        let h = std::thread::spawn(move || t2.wait_due());
        std::thread::sleep(Duration::from_millis(20));
        t.shutdown();
        assert_eq!(h.join().unwrap(), Wake::Shutdown);
    }
}
