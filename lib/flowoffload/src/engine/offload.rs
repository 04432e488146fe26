// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The flow offload service.
//!
//! A [`FlowOffload`] owns the two offload tables (software and
//! hardware), the hooks of both, and the registration of the offload
//! action. It is the entry point for packet processing
//! ([`FlowOffload::target()`]), device notifications
//! ([`FlowOffload::netdev_event()`]) and administration.
use super::Direction;
use super::conntrack::CtStatus;
use super::flow_store::FlowStoreError;
use super::flow_store::StoreRef;
use super::hook::Ensure;
use super::hook::Hook;
use super::hook::HookOps;
use super::hook::HookRegistry;
use super::hook::PacketFilter;
use super::hook::ProtocolFamily;
use super::hook::TargetReg;
use super::netdev::DevRef;
use super::netdev::DeviceTopology;
use super::netdev::NetdevEvent;
use super::netdev::NotifyVerdict;
use super::route;
use super::route::FlowRoute;
use super::route::Routing;
use super::stat::OffloadStats;
use super::stat::OffloadStatsSnap;
use super::sweep::SweepOutcome;
use super::sweep::SweepRunner;
use super::table::OffloadTable;
use super::target::ActionParam;
use super::target::Eligible;
use super::target::PacketInfo;
use super::target::SkipReason;
use super::target::TargetVerdict;
use super::target::check_eligible;
use crate::ddi::kstat::KStatNamed;
use crate::ddi::kstat::KStatProvider;
use crate::ddi::sync::KMutex;
use crate::ddi::time::Interval;
use crate::provider::LogLevel;
use crate::provider::LogProvider;
use crate::provider::Providers;
use alloc::boxed::Box;
use alloc::string::ToString;
use alloc::sync::Arc;
use alloc::vec::Vec;
use flowoffload_api::DumpHooksResp;
use flowoffload_api::FlowOffloadCfg;
use flowoffload_api::HookDump;
use flowoffload_api::OffloadError;
use flowoffload_api::OffloadFlags;
use flowoffload_api::TARGET_NAME;
use flowoffload_api::TARGET_REVISION;
use flowoffload_api::TableKind;
use flowoffload_api::TargetInfo;
use flowoffload_api::errno;

/// The offload action as registered with the packet-filter framework.
pub const OFFLOAD_TARGET: TargetReg = TargetReg {
    name: TARGET_NAME,
    revision: TARGET_REVISION,
    family: ProtocolFamily::Unspec,
};

/// The host collaborators the service calls out to.
#[derive(Clone)]
pub struct NetCtx {
    pub routing: Arc<dyn Routing>,
    pub topology: Arc<dyn DeviceTopology>,
    pub filter: Arc<dyn PacketFilter>,
}

pub(crate) struct Inner {
    pub(crate) cfg: FlowOffloadCfg,
    pub(crate) ctx: NetCtx,
    pub(crate) tables: [OffloadTable; 2],
    pub(crate) hooks: HookRegistry,
    pub(crate) log: Box<dyn LogProvider>,
    pub(crate) stats: KMutex<KStatNamed<OffloadStats>>,
}

impl Inner {
    pub(crate) fn table(&self, kind: TableKind) -> &OffloadTable {
        &self.tables[kind.idx()]
    }
}

pub struct FlowOffload {
    inner: Arc<Inner>,
    runners: KMutex<Vec<SweepRunner>>,
    down: KMutex<bool>,
}

impl FlowOffload {
    /// Bring up both flow stores and register the offload action.
    ///
    /// `stores` is indexed by [`TableKind`]. Whatever was brought up
    /// is torn down again if a later step fails.
    pub fn new(
        cfg: FlowOffloadCfg,
        ctx: NetCtx,
        stores: [StoreRef; 2],
        providers: Providers,
    ) -> Result<Self, OffloadError> {
        cfg.validate()?;
        let interval = Interval::from_millis(cfg.sweep_interval_ms).ok_or_else(|| {
            OffloadError::BadState(format!(
                "bad sweep interval: {}ms",
                cfg.sweep_interval_ms
            ))
        })?;
        let stats = KStatNamed::new("flowoffload", "offload", OffloadStats::new())
            .map_err(|e| OffloadError::BadState(e.to_string()))?;

        let [sw, hw] = stores;

        sw.init(false).map_err(|e| OffloadError::TableInit {
            table: TableKind::Software,
            msg: e.to_string(),
        })?;

        if let Err(e) = hw.init(true) {
            sw.free();
            return Err(OffloadError::TableInit {
                table: TableKind::Hardware,
                msg: e.to_string(),
            });
        }

        if let Err(e) = ctx.filter.register_target(&OFFLOAD_TARGET) {
            hw.free();
            sw.free();
            return Err(OffloadError::TargetRegister(e.to_string()));
        }

        let tables = [
            OffloadTable::new(TableKind::Software, sw, interval),
            OffloadTable::new(TableKind::Hardware, hw, interval),
        ];

        let inner = Inner {
            cfg,
            ctx,
            tables,
            hooks: HookRegistry::new(),
            log: providers.log,
            stats: KMutex::new(stats),
        };

        Ok(Self {
            inner: Arc::new(inner),
            runners: KMutex::new(Vec::new()),
            down: KMutex::new(false),
        })
    }

    /// Validate the configuration of an offload rule.
    pub fn check_entry(info: &TargetInfo) -> Result<OffloadFlags, OffloadError> {
        info.check()
    }

    pub fn cfg(&self) -> &FlowOffloadCfg {
        &self.inner.cfg
    }

    pub fn table(&self, kind: TableKind) -> &OffloadTable {
        self.inner.table(kind)
    }

    /// The offload action.
    ///
    /// Offload the packet's connection if it is eligible. The packet
    /// itself is never touched: the verdict is always
    /// [`TargetVerdict::Continue`], and the offload only applies to
    /// later packets of the connection.
    pub fn target(&self, pkt: &PacketInfo, par: &ActionParam) -> TargetVerdict {
        let elig = match check_eligible(pkt, par) {
            Ok(elig) => elig,
            Err(reason) => {
                self.skip(reason);
                return TargetVerdict::Continue;
            }
        };

        if elig.ct.status().test_and_set(CtStatus::OFFLOAD) {
            self.skip(SkipReason::InProgress);
            return TargetVerdict::Continue;
        }

        let ct = Arc::clone(&elig.ct);
        let kind = TableKind::from_flags(par.info.flags());

        if let Err(e) = self.offload(elig, par, kind) {
            ct.status().clear(CtStatus::OFFLOAD);

            let mut stats = self.inner.stats.lock();
            match e {
                OffloadError::NoRoute(_) => stats.vals.err_route += 1,
                OffloadError::NoMem => stats.vals.err_alloc += 1,
                _ => {
                    stats.vals.err_add += 1;
                    drop(stats);
                    self.inner.log.log(
                        LogLevel::Warn,
                        &format!("{kind} table: offload failed: {e}"),
                    );
                }
            }
        }

        TargetVerdict::Continue
    }

    fn skip(&self, reason: SkipReason) {
        self.inner.stats.lock().vals.count_skip(reason);
        offload_skip_probe(reason);
    }

    fn offload(
        &self,
        elig: Eligible,
        par: &ActionParam,
        kind: TableKind,
    ) -> Result<(), OffloadError> {
        let Eligible { ct, dir, is_tcp, mut devs } = elig;
        let ctx = &self.inner.ctx;

        // Dropping the route releases its destinations, on every path
        // out of this function.
        let mut route = FlowRoute::default();
        route::route(
            ctx.routing.as_ref(),
            ctx.topology.as_ref(),
            &mut route,
            ct.as_ref(),
            dir,
            par.family,
            par.net,
            &mut devs,
        )?;

        let table = self.table(kind);
        let store = table.store();
        let mut flow = store.alloc(&ct).ok_or(OffloadError::NoMem)?;
        store
            .route_init(&mut flow, &route)
            .map_err(|e| OffloadError::FlowInsert(e.to_string()))?;

        if is_tcp {
            ct.set_tcp_be_liberal();
        }

        store.add(flow).map_err(|e| match e {
            FlowStoreError::Exists => OffloadError::FlowExists,
            FlowStoreError::NoMem => OffloadError::NoMem,
            e => OffloadError::FlowInsert(e.to_string()),
        })?;

        for dev in &devs {
            self.check_device(kind, dev);
        }

        table.bind_net(par.net);

        self.inner.stats.lock().vals.offload_added += 1;
        offload_add_probe(kind, dir, &route);
        Ok(())
    }

    /// Make sure table `kind` has a hook on `dev`, creating a pending
    /// one and kicking the sweep if it has none.
    fn check_device(&self, kind: TableKind, dev: &DevRef) {
        let table = self.table(kind);
        let priority = self.inner.cfg.hook_priority;

        let ensured = self.inner.hooks.ensure(kind, dev, || {
            HookOps::new(Arc::clone(dev), kind, priority, Arc::clone(table.store()))
        });

        match ensured {
            Ensure::Used => {}

            Ensure::Created => {
                self.inner.stats.lock().vals.hooks_created += 1;
                hook_create_probe(kind, dev);
                table.schedule_now();
            }

            Ensure::NoMem => self.inner.stats.lock().vals.hooks_alloc_fail += 1,
        }
    }

    /// Handle a device notification. Only the removal of a device is
    /// acted on: its hooks are revoked from both tables at once, then
    /// every flow store drops the entries referencing it.
    pub fn netdev_event(&self, event: NetdevEvent, dev: &DevRef) -> NotifyVerdict {
        if event != NetdevEvent::Unregister {
            return NotifyVerdict::Done;
        }

        // A hook whose install is in flight is undone by its sweep.
        let taken = self.inner.hooks.take_device(dev);
        for (kind, hook) in TableKind::ALL.into_iter().zip(taken) {
            if let Some(hook) = hook {
                self.revoked(kind, &hook);
            }
        }

        for table in &self.inner.tables {
            table.store().cleanup(dev);
        }

        NotifyVerdict::Done
    }

    /// Remove the hook of `dev` from table `kind` right away, whatever
    /// its state. Returns whether there was one.
    pub fn revoke_hook(&self, kind: TableKind, dev: &DevRef) -> bool {
        match self.inner.hooks.take(kind, dev) {
            Some(hook) => {
                self.revoked(kind, &hook);
                true
            }

            None => false,
        }
    }

    fn revoked(&self, kind: TableKind, hook: &Hook) {
        self.inner.teardown(kind, hook, false);
        self.inner.stats.lock().vals.hooks_revoked += 1;
        hook_revoke_probe(kind, hook);
    }

    /// Run one sweep cycle of table `kind` now, regardless of its
    /// schedule.
    pub fn sweep(&self, kind: TableKind) -> SweepOutcome {
        self.inner.hook_work(kind)
    }

    /// Start one background sweep runner per table. Calling this again
    /// while runners exist does nothing.
    pub fn spawn_sweepers(&self) -> Result<(), OffloadError> {
        let mut runners = self.runners.lock();
        if !runners.is_empty() {
            return Ok(());
        }

        for kind in TableKind::ALL {
            let runner = SweepRunner::spawn(Arc::clone(&self.inner), kind)
                .map_err(|e| OffloadError::System {
                    errno: e.raw_os_error().unwrap_or(errno::EAGAIN),
                    msg: format!("failed to spawn {kind} sweep runner: {e}"),
                })?;
            runners.push(runner);
        }

        Ok(())
    }

    pub fn lookup_hook(&self, kind: TableKind, dev: &DevRef) -> Option<HookDump> {
        self.inner.hooks.lookup(kind, dev)
    }

    pub fn dump_hooks(&self, kind: TableKind) -> DumpHooksResp {
        let table = self.table(kind);

        DumpHooksResp {
            table: kind,
            net: table.net(),
            num_flows: u32::try_from(table.store().len()).unwrap_or(u32::MAX),
            hooks: self.inner.hooks.dump(kind),
        }
    }

    pub fn stats(&self) -> OffloadStatsSnap {
        self.inner.stats.lock().vals.snapshot()
    }

    /// Unregister the offload action, stop the sweep runners, tear
    /// down every remaining hook and free both flow stores. Only the
    /// first call does anything.
    pub fn shutdown(&self) {
        {
            let mut down = self.down.lock();
            if *down {
                return;
            }
            *down = true;
        }

        self.inner.ctx.filter.unregister_target(&OFFLOAD_TARGET);

        for table in &self.inner.tables {
            table.shutdown();
        }

        let runners = core::mem::take(&mut *self.runners.lock());
        for runner in runners {
            runner.join();
        }

        for table in &self.inner.tables {
            let kind = table.kind();
            // Wait out a sweep started by hand.
            let _token = table.sweep_token();
            for hook in self.inner.hooks.drain(kind) {
                self.inner.teardown(kind, &hook, true);
            }
            table.store().free();
        }
    }
}

impl Drop for FlowOffload {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[allow(unused_variables)]
fn hook_create_probe(kind: TableKind, dev: &DevRef) {
    cfg_if! {
        if #[cfg(feature = "usdt")] {
            let table_s = kind.to_string();
            crate::flowoffload_provider::hook__create!(
                || (table_s.as_str(), dev.ifindex, dev.name.as_str())
            );
        }
    }
}

#[allow(unused_variables)]
fn hook_revoke_probe(kind: TableKind, hook: &Hook) {
    cfg_if! {
        if #[cfg(feature = "usdt")] {
            let table_s = kind.to_string();
            let dev = hook.dev();
            crate::flowoffload_provider::hook__revoke!(
                || (table_s.as_str(), dev.ifindex, dev.name.as_str())
            );
        }
    }
}

#[allow(unused_variables)]
fn offload_add_probe(kind: TableKind, dir: Direction, route: &FlowRoute) {
    cfg_if! {
        if #[cfg(feature = "usdt")] {
            let table_s = kind.to_string();
            let dir_s = dir.to_string();
            let iif = route[dir].in_.ifindex;
            let oif = route[dir].out.ifindex;
            crate::flowoffload_provider::offload__add!(
                || (table_s.as_str(), dir_s.as_str(), iif, oif)
            );
        }
    }
}

#[allow(unused_variables)]
fn offload_skip_probe(reason: SkipReason) {
    cfg_if! {
        if #[cfg(feature = "usdt")] {
            let reason_s = reason.to_string();
            crate::flowoffload_provider::offload__skip!(|| ("-", reason_s.as_str()));
        }
    }
}
