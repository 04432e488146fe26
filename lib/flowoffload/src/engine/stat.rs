// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Offload statistics.
use super::target::SkipReason;
use crate::ddi::kstat::KStatU64;
use kstat_macro::KStatProvider;

/// Counters kept by the offload service, across both tables.
#[derive(KStatProvider)]
pub struct OffloadStats {
    /// Flows inserted into a flow store.
    pub offload_added: KStatU64,

    pub skip_sec_path: KStatU64,
    pub skip_ip_options: KStatU64,
    pub skip_no_conntrack: KStatU64,
    pub skip_proto: KStatU64,
    pub skip_tcp_state: KStatU64,
    pub skip_tcp_fin_rst: KStatU64,
    pub skip_helper: KStatU64,
    pub skip_seq_adjust: KStatU64,
    pub skip_unconfirmed: KStatU64,
    pub skip_no_dev: KStatU64,
    /// Another packet of the same connection got there first.
    pub skip_in_progress: KStatU64,

    pub err_route: KStatU64,
    pub err_alloc: KStatU64,
    pub err_add: KStatU64,

    pub hooks_created: KStatU64,
    pub hooks_alloc_fail: KStatU64,
    pub hooks_registered: KStatU64,
    pub hooks_reg_fail: KStatU64,
    pub hooks_reaped: KStatU64,
    pub hooks_revoked: KStatU64,

    pub sweep_runs: KStatU64,
    pub sweep_resched: KStatU64,
}

impl OffloadStats {
    pub fn count_skip(&mut self, reason: SkipReason) {
        let stat = match reason {
            SkipReason::SecPath => &mut self.skip_sec_path,
            SkipReason::IpOptions => &mut self.skip_ip_options,
            SkipReason::NoConntrack => &mut self.skip_no_conntrack,
            SkipReason::Protocol => &mut self.skip_proto,
            SkipReason::TcpState => &mut self.skip_tcp_state,
            SkipReason::TcpFinRst => &mut self.skip_tcp_fin_rst,
            SkipReason::Helper => &mut self.skip_helper,
            SkipReason::SeqAdjust => &mut self.skip_seq_adjust,
            SkipReason::Unconfirmed => &mut self.skip_unconfirmed,
            SkipReason::NoDevice => &mut self.skip_no_dev,
            SkipReason::InProgress => &mut self.skip_in_progress,
        };
        *stat += 1;
    }
}

impl OffloadStatsSnap {
    /// The number of packets passed over for any reason.
    pub fn skipped(&self) -> u64 {
        self.skip_sec_path
            + self.skip_ip_options
            + self.skip_no_conntrack
            + self.skip_proto
            + self.skip_tcp_state
            + self.skip_tcp_fin_rst
            + self.skip_helper
            + self.skip_seq_adjust
            + self.skip_unconfirmed
            + self.skip_no_dev
            + self.skip_in_progress
    }
}
