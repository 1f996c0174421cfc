// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

use std::io;
use std::io::Write;
use std::path::PathBuf;

use clap::Parser;
use tabwriter::TabWriter;

use flowmap::api::API_VERSION;
use flowmap::api::Direction;
use flowmap::engine::template::Template;
use flowmap::engine::template::TemplateDb;
use flowmap::print::print_flow_db;
use flowmap::print::print_gen_tbl;
use flowmap::print::print_stats_into;
use flowmap::print::write_hr;
use flowmapadm::Script;
use flowmapadm::Sim;
use flowmapadm::SimResult;
use flowmapadm::load_ron;
use flowmapadm::load_tdb;

/// Inspect flow mapper template databases and simulate flow
/// programming against them.
#[derive(Debug, Parser)]
#[command(version = pkg_version())]
enum Command {
    /// Validate a template database.
    Check {
        /// The template database, in RON.
        tdb: PathBuf,
    },

    /// List the templates of a database and their steps.
    DumpTemplates { tdb: PathBuf },

    /// Replay a script of flow operations against a simulated
    /// backend and print the resulting state.
    Simulate {
        tdb: PathBuf,

        /// The script: mapper configuration plus operations, in RON.
        script: PathBuf,

        /// Print every backend call made.
        #[arg(long)]
        trace: bool,

        /// Print mapper log messages.
        #[arg(short, long)]
        verbose: bool,
    },
}

fn pkg_version() -> String {
    format!("{} (API v{API_VERSION})", env!("CARGO_PKG_VERSION"))
}

fn print_templates(tdb: &TemplateDb) -> io::Result<()> {
    let mut t = TabWriter::new(io::stdout());
    writeln!(t, "KIND\tTID\tNAME\tSTEP\tDIR\tTABLE\tFDB")?;

    let lists =
        [("class", &tdb.class_templates), ("action", &tdb.act_templates)];
    for (kind, list) in lists {
        for tmpl in list.iter() {
            print_template(&mut t, kind, tmpl)?;
        }
    }
    t.flush()
}

fn print_template(
    t: &mut impl Write,
    kind: &str,
    tmpl: &Template,
) -> io::Result<()> {
    if tmpl.steps.is_empty() {
        return writeln!(
            t,
            "{kind}\t{}\t{}\t--\t--\t--\t--",
            tmpl.tid, tmpl.name
        );
    }

    for (i, step) in tmpl.steps.iter().enumerate() {
        let crit = if step.critical { "*" } else { "" };
        writeln!(
            t,
            "{kind}\t{}\t{}\t{i}: {}\t{}\t{}{crit}\t{:?}",
            tmpl.tid,
            tmpl.name,
            step.description,
            step.direction,
            step.kind.func(),
            step.fdb,
        )?;
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cmd = Command::parse();
    match cmd {
        Command::Check { tdb } => {
            let db = load_tdb(&tdb)?;
            println!(
                "{}: {} class templates, {} action templates, \
                 {} generic tables",
                tdb.display(),
                db.class_templates.len(),
                db.act_templates.len(),
                db.gen_tables.len(),
            );
        }

        Command::DumpTemplates { tdb } => {
            print_templates(&load_tdb(&tdb)?)?;
        }

        Command::Simulate { tdb, script, trace, verbose } => {
            let db = load_tdb(&tdb)?;
            let script: Script = load_ron(&script)?;
            let gen_tables: Vec<(u32, Direction)> = db
                .gen_tables
                .iter()
                .map(|p| (p.subtype, p.direction))
                .collect();

            let mut sim = Sim::new(db, script.cfg, verbose)?;
            let mut failed = 0;
            for (i, op) in script.ops.iter().enumerate() {
                match sim.run(op) {
                    SimResult::Created(out) => match out.shared_handle {
                        Some(h) => println!(
                            "{i}: created flow {} (shared {h:#x})",
                            out.fid
                        ),
                        None => println!("{i}: created flow {}", out.fid),
                    },
                    SimResult::Destroyed(fid) => {
                        println!("{i}: destroyed flow {fid}")
                    }
                    SimResult::Flushed(n) => {
                        println!("{i}: flushed {n} flows")
                    }
                    SimResult::Failed(e) => {
                        failed += 1;
                        println!("{i}: error: {e}");
                    }
                }
            }

            println!();
            print_flow_db(&sim.mapper().dump_flow_db())?;
            for (subtype, dir) in gen_tables {
                println!();
                print_gen_tbl(&sim.mapper().dump_gen_tbl(subtype, dir)?)?;
            }

            println!();
            let stats = sim.mapper().stats();
            let name = sim.mapper().name();
            print_stats_into(&mut io::stdout(), name, &stats.pairs())?;

            if trace {
                let mut t = TabWriter::new(io::stdout());
                writeln!(t, "\nBackend calls")?;
                write_hr(&mut t)?;
                writeln!(t, "OP\tDIR\tTYPE\tHANDLE\tBITS")?;
                for c in sim.hw_calls() {
                    writeln!(
                        t,
                        "{}\t{}\t{}\t{:#x}\t{}",
                        c.op, c.dir, c.res_type, c.handle, c.bits
                    )?;
                }
                t.flush()?;
            }

            println!("\n{} backend resources live", sim.hw_live());
            if failed > 0 {
                anyhow::bail!("{failed} operations failed");
            }
        }
    }

    Ok(())
}
