// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Print mapper dumps in human-friendly manner.
//!
//! This is mostly just a place to hang printing routines so that they
//! can be used by both flowmapadm and integration tests.

use crate::api::FlowDbDump;
use crate::api::GenTblDump;
use crate::api::ResourceDump;
use std::io::Write;
use std::string::String;
use tabwriter::TabWriter;

/// Print a [`FlowDbDump`].
pub fn print_flow_db(dump: &FlowDbDump) -> std::io::Result<()> {
    print_flow_db_into(&mut std::io::stdout(), dump)
}

/// Print a [`FlowDbDump`] into a given writer.
pub fn print_flow_db_into(
    writer: &mut impl Write,
    dump: &FlowDbDump,
) -> std::io::Result<()> {
    let mut t = TabWriter::new(writer);

    writeln!(
        t,
        "Flow DB: {} flows, {}/{} slots free",
        dump.flows.len(),
        dump.free_slots(),
        dump.num_resources,
    )?;
    write_hrb(&mut t)?;
    print_resource_header(&mut t)?;
    for flow in &dump.flows {
        let owner = format!("{} {}", flow.flow_type, flow.fid);
        if flow.resources.is_empty() {
            writeln!(t, "{owner}\t{}\t--\t--\t--\t--\t--", flow.func_id)?;
        }

        for res in &flow.resources {
            print_resource(&mut t, &owner, flow.func_id, res)?;
        }
    }
    t.flush()
}

/// Print the header for the [`print_resource()`] output.
pub fn print_resource_header(t: &mut impl Write) -> std::io::Result<()> {
    writeln!(t, "FLOW\tFUNC ID\tDIR\tRESOURCE\tTYPE\tSUBTYPE\tHANDLE")
}

/// Print a single resource record of a flow.
pub fn print_resource(
    t: &mut impl Write,
    owner: &str,
    func_id: u16,
    res: &ResourceDump,
) -> std::io::Result<()> {
    let mut func = res.func.to_string();
    if res.critical {
        func.push('*');
    }
    if res.shared {
        func.push_str(" (shared)");
    }

    writeln!(
        t,
        "{owner}\t{func_id}\t{}\t{func}\t{}\t{}\t{:#x}",
        res.direction, res.res_type, res.subtype, res.handle,
    )
}

/// Print a [`GenTblDump`].
pub fn print_gen_tbl(dump: &GenTblDump) -> std::io::Result<()> {
    print_gen_tbl_into(&mut std::io::stdout(), dump)
}

/// Print a [`GenTblDump`] into a given writer.
pub fn print_gen_tbl_into(
    writer: &mut impl Write,
    dump: &GenTblDump,
) -> std::io::Result<()> {
    let mut t = TabWriter::new(writer);

    writeln!(
        t,
        "Generic table {} ({}/{}): {}/{} entries",
        dump.name,
        dump.subtype,
        dump.direction,
        dump.entries.len(),
        dump.num_entries,
    )?;
    write_hr(&mut t)?;
    writeln!(t, "INDEX\tREFS\tKEY\tDATA\tRID")?;
    for e in &dump.entries {
        let key = e.key.as_deref().map(hex).unwrap_or_else(|| "--".into());
        let rid =
            e.nested_fid.map(|f| f.to_string()).unwrap_or_else(|| "--".into());
        writeln!(
            t,
            "{:#x}\t{}\t{key}\t{}/{}\t{rid}",
            e.index,
            e.ref_count,
            hex(&e.data),
            e.bit_len,
        )?;
    }
    t.flush()
}

/// Print counters as name/value pairs, as produced by a stats
/// snapshot.
pub fn print_stats_into(
    writer: &mut impl Write,
    name: &str,
    pairs: &[(&'static str, u64)],
) -> std::io::Result<()> {
    let mut t = TabWriter::new(writer);
    writeln!(t, "Stats {name}")?;
    write_hr(&mut t)?;
    for (stat, val) in pairs {
        writeln!(t, "{stat}\t{val}")?;
    }
    t.flush()
}

fn hex(bytes: &[u8]) -> String {
    if bytes.is_empty() {
        return "--".into();
    }
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Print a horizontal rule in bold.
pub fn write_hrb(t: &mut impl Write) -> std::io::Result<()> {
    writeln!(t, "{:=<70}", "=")
}

/// Print a horizontal rule.
pub fn write_hr(t: &mut impl Write) -> std::io::Result<()> {
    writeln!(t, "{:-<70}", "-")
}
