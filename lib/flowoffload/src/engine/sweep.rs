// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The periodic sweep of an offload table's hooks.
//!
//! One cycle runs four phases:
//!
//! 1. Install every pending hook, one at a time, outside the registry
//!    lock. A hook revoked while its install was in flight is
//!    uninstalled again right away.
//! 2. Clear `used` on every hook, still under the lock taken at the
//!    end of phase 1.
//! 3. Walk the flow store, marking used the hooks on devices any flow
//!    arrives on.
//! 4. Reap installed hooks nothing marked, one at a time, outside the
//!    registry lock.
//!
//! The cycle reschedules itself one interval later if the walk was cut
//! short or failed, or if any hook survived the reap. Otherwise the
//! table goes idle until a new hook is created.
use super::Direction;
use super::flow_store::FlowBlockCommand;
use super::flow_store::FlowOffloadEntry;
use super::flow_store::FlowStoreError;
use super::hook::Claimed;
use super::hook::Hook;
use super::hook::HookRegistry;
use super::offload::Inner;
use super::table::Wake;
use crate::ddi::time::Moment;
use crate::provider::LogLevel;
use alloc::sync::Arc;
use flowoffload_api::TableKind;
use std::thread::JoinHandle;

/// What one sweep cycle did.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct SweepOutcome {
    pub registered: u32,
    pub reaped: u32,
    /// The flow walk was interrupted or failed.
    pub walk_incomplete: bool,
    /// The cycle queued another run.
    pub rescheduled: bool,
}

impl Inner {
    /// Run one sweep cycle of table `kind`.
    pub(crate) fn hook_work(&self, kind: TableKind) -> SweepOutcome {
        let table = self.table(kind);
        let mut log = table.sweep_token();
        let mut out = SweepOutcome::default();

        let mut lists = self.hooks.lock();
        while let Some(claimed) = HookRegistry::claim_pending(&mut lists, kind) {
            drop(lists);
            self.install(kind, &claimed);
            out.registered += 1;
            lists = self.hooks.lock();
        }
        HookRegistry::reset_used(&mut lists, kind);
        drop(lists);

        let walk = table.store().iterate(&mut |flow: &FlowOffloadEntry| {
            self.hooks.mark_used(
                kind,
                [
                    flow.tuple(Direction::Original).iifidx,
                    flow.tuple(Direction::Reply).iifidx,
                ],
            );
        });

        let active = match walk {
            Ok(()) => self.reap(kind, &mut out),

            Err(FlowStoreError::Again) => {
                out.walk_incomplete = true;
                self.reap(kind, &mut out);
                true
            }

            Err(e) => {
                out.walk_incomplete = true;
                self.log.log(
                    LogLevel::Warn,
                    &format!("{kind} table: flow walk failed: {e}"),
                );
                true
            }
        };

        if active {
            table.schedule_later();
            out.rescheduled = true;
        }

        {
            let mut stats = self.stats.lock();
            stats.vals.sweep_runs += 1;
            if out.rescheduled {
                stats.vals.sweep_resched += 1;
            }
        }

        log.cycles += 1;
        log.last = Some(Moment::now());
        super::dbg!(
            "{} table sweep #{}: registered {} reaped {} resched {}",
            kind,
            log.cycles,
            out.registered,
            out.reaped,
            out.rescheduled
        );
        sweep_done_probe(kind, self.hooks.len(kind), out.rescheduled);
        out
    }

    /// Install a claimed hook and, for the hardware table, bind its
    /// device to hardware flow programming. If the hook was revoked
    /// meanwhile, undo whatever part of the install succeeded.
    fn install(&self, kind: TableKind, claimed: &Claimed) {
        let table = self.table(kind);
        let dev = &claimed.ops.dev;

        let registered = match self.ctx.filter.register_net_hook(claimed.net, &claimed.ops) {
            Ok(()) => {
                self.stats.lock().vals.hooks_registered += 1;
                hook_register_probe(kind, claimed);
                true
            }

            Err(e) => {
                self.stats.lock().vals.hooks_reg_fail += 1;
                self.log.log(
                    LogLevel::Warn,
                    &format!("{kind} table: failed to register hook on {dev}: {e}"),
                );
                false
            }
        };

        let bound = table.is_hw()
            && match table.store().setup(dev, FlowBlockCommand::Bind) {
                Ok(()) => true,
                Err(e) => {
                    self.log.log(
                        LogLevel::Warn,
                        &format!("{kind} table: failed to bind {dev}: {e}"),
                    );
                    false
                }
            };

        if self.hooks.finish_install(kind, &claimed.ops) {
            return;
        }

        super::dbg!("{} table: hook on {} revoked during install", kind, dev);

        if bound {
            if let Err(e) = table.store().setup(dev, FlowBlockCommand::Unbind) {
                self.log.log(
                    LogLevel::Warn,
                    &format!("{kind} table: failed to unbind {dev}: {e}"),
                );
            }
        }

        if registered {
            self.ctx.filter.unregister_net_hook(claimed.net, &claimed.ops);
        }
    }

    /// Reap installed hooks no flow uses. Returns whether any hook
    /// was left in place.
    fn reap(&self, kind: TableKind, out: &mut SweepOutcome) -> bool {
        let mut active = false;

        while let Some(hook) = self.hooks.take_unused(kind, &mut active) {
            self.teardown(kind, &hook, true);
            self.stats.lock().vals.hooks_reaped += 1;
            hook_reap_probe(kind, &hook);
            out.reaped += 1;
        }

        active
    }

    /// Tear down a hook already removed from the registry. Pending
    /// hooks were never installed and have nothing to tear down.
    pub(crate) fn teardown(&self, kind: TableKind, hook: &Hook, unbind: bool) {
        if !hook.registered {
            return;
        }

        let table = self.table(kind);
        if unbind && table.is_hw() {
            if let Err(e) = table.store().setup(hook.dev(), FlowBlockCommand::Unbind) {
                self.log.log(
                    LogLevel::Warn,
                    &format!("{kind} table: failed to unbind {}: {e}", hook.dev()),
                );
            }
        }

        if let Some(net) = hook.net {
            self.ctx.filter.unregister_net_hook(net, &hook.ops);
        }
    }
}

/// A background thread running the sweeps of one table on schedule.
pub struct SweepRunner {
    kind: TableKind,
    handle: JoinHandle<()>,
}

impl SweepRunner {
    pub(crate) fn spawn(
        inner: Arc<Inner>,
        kind: TableKind,
    ) -> std::io::Result<Self> {
        let handle = std::thread::Builder::new()
            .name(format!("flowoffload-{kind}"))
            .spawn(move || {
                while inner.table(kind).wait_due() == Wake::Sweep {
                    inner.hook_work(kind);
                }
            })?;

        Ok(Self { kind, handle })
    }

    pub fn kind(&self) -> TableKind {
        self.kind
    }

    /// Wait for the runner to exit. The table must already be shut
    /// down.
    pub fn join(self) {
        if self.handle.join().is_err() {
            super::err!("sweep runner of {} table panicked", self.kind);
        }
    }
}

#[allow(unused_variables)]
fn hook_register_probe(kind: TableKind, claimed: &Claimed) {
    cfg_if! {
        if #[cfg(feature = "usdt")] {
            let table_s = kind.to_string();
            let dev = &claimed.ops.dev;
            crate::flowoffload_provider::hook__register!(
                || (table_s.as_str(), dev.ifindex, dev.name.as_str(), claimed.net.0)
            );
        }
    }
}

#[allow(unused_variables)]
fn hook_reap_probe(kind: TableKind, hook: &Hook) {
    cfg_if! {
        if #[cfg(feature = "usdt")] {
            let table_s = kind.to_string();
            let dev = hook.dev();
            crate::flowoffload_provider::hook__reap!(
                || (table_s.as_str(), dev.ifindex, dev.name.as_str())
            );
        }
    }
}

#[allow(unused_variables)]
fn sweep_done_probe(kind: TableKind, hooks: usize, resched: bool) {
    cfg_if! {
        if #[cfg(feature = "usdt")] {
            let table_s = kind.to_string();
            crate::flowoffload_provider::sweep__done!(
                || (table_s.as_str(), hooks as u64, u8::from(resched))
            );
        }
    }
}
