// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Print offload state in a human-friendly manner.
//!
//! These are shared by integration tests and any host tooling which
//! wants to show the hooks of a table.

use crate::api::DumpHooksResp;
use crate::api::HookDump;
use crate::engine::stat::OffloadStatsSnap;
use std::io::Write;
use tabwriter::TabWriter;

/// Print a [`DumpHooksResp`].
pub fn print_hooks(resp: &DumpHooksResp) -> std::io::Result<()> {
    print_hooks_into(&mut std::io::stdout(), resp)
}

/// Print a [`DumpHooksResp`] into a given writer.
pub fn print_hooks_into(
    writer: &mut impl Write,
    resp: &DumpHooksResp,
) -> std::io::Result<()> {
    let mut t = TabWriter::new(writer);
    let net = match resp.net {
        Some(net) => net.to_string(),
        None => "unbound".to_string(),
    };

    writeln!(t, "Offload table {} ({net}): {} flows", resp.table, resp.num_flows)?;
    write_hrb(&mut t)?;
    print_hook_header(&mut t)?;
    write_hr(&mut t)?;
    for hook in &resp.hooks {
        print_hook(&mut t, hook)?;
    }
    t.flush()
}

/// Print the header for the [`print_hook()`] output.
pub fn print_hook_header(t: &mut impl Write) -> std::io::Result<()> {
    writeln!(t, "IFINDEX\tDEVICE\tSTATE\tUSED\tNET")
}

pub fn print_hook(t: &mut impl Write, hook: &HookDump) -> std::io::Result<()> {
    let state = if hook.registered { "registered" } else { "pending" };
    let net = match hook.net {
        Some(net) => net.to_string(),
        None => "-".to_string(),
    };

    writeln!(
        t,
        "{}\t{}\t{state}\t{}\t{net}",
        hook.ifindex, hook.name, hook.used,
    )
}

/// Print an [`OffloadStatsSnap`].
pub fn print_stats(stats: &OffloadStatsSnap) -> std::io::Result<()> {
    print_stats_into(&mut std::io::stdout(), stats)
}

/// Print an [`OffloadStatsSnap`] into a given writer.
pub fn print_stats_into(
    writer: &mut impl Write,
    stats: &OffloadStatsSnap,
) -> std::io::Result<()> {
    let mut t = TabWriter::new(writer);

    writeln!(t, "Admission")?;
    write_hr(&mut t)?;
    writeln!(t, "added\t{}", stats.offload_added)?;
    writeln!(t, "skipped\t{}", stats.skipped())?;
    writeln!(t, "in progress\t{}", stats.skip_in_progress)?;
    writeln!(t, "route errors\t{}", stats.err_route)?;
    writeln!(t, "alloc errors\t{}", stats.err_alloc)?;
    writeln!(t, "add errors\t{}", stats.err_add)?;
    t.flush()?;

    writeln!(t, "\nHooks")?;
    write_hr(&mut t)?;
    writeln!(t, "created\t{}", stats.hooks_created)?;
    writeln!(t, "alloc failures\t{}", stats.hooks_alloc_fail)?;
    writeln!(t, "registered\t{}", stats.hooks_registered)?;
    writeln!(t, "register failures\t{}", stats.hooks_reg_fail)?;
    writeln!(t, "reaped\t{}", stats.hooks_reaped)?;
    writeln!(t, "revoked\t{}", stats.hooks_revoked)?;
    t.flush()?;

    writeln!(t, "\nSweeps")?;
    write_hr(&mut t)?;
    writeln!(t, "runs\t{}", stats.sweep_runs)?;
    writeln!(t, "rescheduled\t{}", stats.sweep_resched)?;
    t.flush()
}

/// Output a horizontal rule in bold to the given writer.
pub fn write_hrb(t: &mut impl Write) -> std::io::Result<()> {
    writeln!(t, "{:=<70}", "=")
}

/// Output a horizontal rule to the given writer.
pub fn write_hr(t: &mut impl Write) -> std::io::Result<()> {
    writeln!(t, "{:-<70}", "-")
}
