// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Mapper tests against the recording stub backend.
//!
//! Every test loads its templates from `resources/`, drives the mapper
//! through its public API and then checks both the flow database and
//! what the backend saw. The common thread is that nothing allocated
//! on a flow's behalf outlives the flow, whichever way it ends.

use flowmap::api::Fid;
use flowmap::engine::template::TemplateDb;
use flowmap_test_utils::*;
use std::sync::Arc;

const BASIC: &str = include_str!("resources/basic.ron");

// The global index entry allocated by `basic.ron`.
const GLB_TBL_TYPE: u32 = 9;

fn basic() -> TemplateDb {
    parse_tdb(BASIC)
}

/// A regular flow running the `l2-ctxt` class template and the
/// `encap` action template.
fn flow(sig: u64) -> FlowCreateParams {
    let mut p = class_params(1, &[sig, 0, 0x100 + sig, 0x0a]);
    p.act_tid = Some(10);
    p.act.act_bitmap = 0x1;
    p.act.act_props = vec![vec![0x12, 0x34]];
    p
}

fn free_ops(hw: &StubHw) -> Vec<HwOp> {
    hw.ops()
        .into_iter()
        .filter(|op| {
            matches!(
                op,
                HwOp::FreeIdent
                    | HwOp::FreeTcam
                    | HwOp::DeleteEm
                    | HwOp::FreeTbl
            )
        })
        .collect()
}

fn funcs(m: &Mapper, fid: Fid) -> Vec<(ResourceFunc, bool)> {
    m.dump_flow_db()
        .flows
        .iter()
        .find(|f| f.fid == fid.val())
        .map(|f| f.resources.iter().map(|r| (r.func, r.critical)).collect())
        .unwrap_or_default()
}

// Index alloc+write followed by a ternary alloc+write: the records are
// chained in execution order and destroy releases each exactly once.
#[test]
fn index_then_tcam() {
    let env = TestEnv::new();
    let m = env.mapper(mapper_cfg(16, 64), basic());
    let baseline = env.hw.live();
    let free = check_arena(&m);

    let p = class_params(1, &[0, 0, 0x1234_5678, 0x0a]);
    let out = m.flow_create(&p).unwrap();
    assert_eq!(out.shared_handle, None);
    assert_eq!(
        funcs(&m, out.fid),
        vec![
            (ResourceFunc::IndexTable, false),
            (ResourceFunc::Identifier, false),
            (ResourceFunc::TcamTable, false),
        ]
    );

    // The index entry holds the vnic; the row key is the svif padded
    // out to the key width, matched exactly.
    let set_tbl = env.hw.calls_of(HwOp::SetTbl);
    assert_eq!(set_tbl.len(), 1);
    assert_eq!(set_tbl[0].data, vec![0x12, 0x34, 0x56, 0x78]);
    assert_eq!(set_tbl[0].bits, 32);

    let set_tcam = env.hw.calls_of(HwOp::SetTcam);
    assert_eq!(set_tcam.len(), 1);
    assert_eq!(set_tcam[0].data, vec![0x0a, 0x00, 0x00]);
    assert_eq!(set_tcam[0].extra, vec![0xff, 0x00, 0x00]);
    assert_eq!(set_tcam[0].bits, 24);

    let idx = env.hw.calls_of(HwOp::AllocTbl).last().unwrap().handle;
    let row = env.hw.calls_of(HwOp::AllocTcam)[0].handle;
    assert!(env.hw.is_live(ResKind::Tbl, In, 2, idx));
    assert!(env.hw.is_live(ResKind::Tcam, In, 5, row));
    assert!(check_arena(&m) < free);

    m.flow_destroy(FlowType::Regular, out.fid).unwrap();
    assert_eq!(
        free_ops(&env.hw),
        vec![HwOp::FreeTbl, HwOp::FreeIdent, HwOp::FreeTcam]
    );
    assert_eq!(env.hw.calls_of(HwOp::FreeTbl)[0].handle, idx);
    assert_eq!(env.hw.calls_of(HwOp::FreeTcam)[0].handle, row);
    assert_eq!(env.hw.live(), baseline);
    assert_eq!(check_arena(&m), free);
    assert!(m.dump_flow_db().flows.is_empty());
}

#[test]
fn critical_first_then_chain() {
    let env = TestEnv::new();
    let m = env.mapper(mapper_cfg(16, 64), basic());

    let out = m.flow_create(&flow(0x77)).unwrap();
    assert_eq!(
        funcs(&m, out.fid),
        vec![
            (ResourceFunc::EmTable, true),
            (ResourceFunc::IndexTable, false),
            (ResourceFunc::Identifier, false),
            (ResourceFunc::TcamTable, false),
            (ResourceFunc::HwFid, false),
        ]
    );

    let em = env.hw.calls_of(HwOp::InsertEm);
    assert_eq!(em.len(), 1);
    assert_eq!(em[0].data, vec![0x00, 0x77]);
    assert_eq!(em[0].extra, vec![0x5a]);
    assert_eq!(env.mark.marks(), vec![((In, em[0].handle), 0x1234)]);

    let crit = m
        .query_resource(FlowType::Regular, out.fid, ResourceFunc::EmTable, 0)
        .unwrap()
        .unwrap();
    assert!(crit.critical);
    assert_eq!(crit.handle, em[0].handle);

    m.flow_destroy(FlowType::Regular, out.fid).unwrap();
    assert_eq!(
        free_ops(&env.hw),
        vec![HwOp::DeleteEm, HwOp::FreeTbl, HwOp::FreeIdent, HwOp::FreeTcam]
    );
    assert!(env.mark.marks().is_empty());

    drop(m);
    env.assert_clean();
}

#[test]
fn reverse_teardown() {
    let env = TestEnv::new();
    let mut cfg = mapper_cfg(16, 64);
    cfg.teardown = TeardownOrder::Reverse;
    let m = env.mapper(cfg, basic());

    let out = m.flow_create(&flow(1)).unwrap();
    m.flow_destroy(FlowType::Regular, out.fid).unwrap();
    assert_eq!(
        free_ops(&env.hw),
        vec![HwOp::FreeTcam, HwOp::FreeIdent, HwOp::FreeTbl, HwOp::DeleteEm]
    );
    assert!(env.mark.marks().is_empty());
}

#[test]
fn mark_skipped_without_action_bit() {
    let env = TestEnv::new();
    let m = env.mapper(mapper_cfg(16, 64), basic());

    let mut p = flow(1);
    p.act.act_bitmap = 0;
    let out = m.flow_create(&p).unwrap();
    assert!(env.mark.marks().is_empty());
    assert!(!funcs(&m, out.fid).contains(&(ResourceFunc::HwFid, false)));
}

// A write failing after its index was allocated hands the index back
// and leaves nothing recorded.
#[test]
fn index_write_failure() {
    let env = TestEnv::new();
    let m = env.mapper(mapper_cfg(16, 64), basic());
    let baseline = env.hw.live();
    let free = check_arena(&m);

    env.hw.fail(HwOp::SetTbl, HwError::Invalid);
    let err = m.flow_create(&flow(1)).unwrap_err();
    assert_eq!(err, MapperError::Hw { op: "set_tbl".to_string(), status: -22 });

    let idx = env.hw.calls_of(HwOp::AllocTbl).last().unwrap().handle;
    let freed = env.hw.calls_of(HwOp::FreeTbl);
    assert_eq!(freed.len(), 1);
    assert_eq!(freed[0].handle, idx);
    assert!(env.hw.calls_of(HwOp::AllocTcam).is_empty());

    assert_eq!(env.hw.live(), baseline);
    assert_eq!(check_arena(&m), free);
    assert!(m.dump_flow_db().flows.is_empty());
}

#[test]
fn rollback_after_partial_create() {
    // Fail each step of the flow in turn.
    for (op, skip) in [
        (HwOp::AllocIdent, 0),
        (HwOp::SetTcam, 0),
        (HwOp::InsertEm, 0),
        (HwOp::AllocTcam, 0),
    ] {
        let env = TestEnv::new();
        let m = env.mapper(mapper_cfg(16, 64), basic());
        let baseline = env.hw.live();
        let free = check_arena(&m);

        env.hw.fail_nth(op, skip, HwError::NoSpace);
        let err = m.flow_create(&flow(1)).unwrap_err();
        assert_eq!(
            err,
            MapperError::Hw { op: op.to_string(), status: -28 },
            "{op}"
        );

        assert_eq!(env.hw.live(), baseline, "{op}");
        assert_eq!(check_arena(&m), free, "{op}");
        assert!(m.dump_flow_db().flows.is_empty(), "{op}");
        assert!(env.mark.marks().is_empty(), "{op}");

        let stats = m.stats();
        assert_eq!(stats.flows_failed, 1);
        assert_eq!(stats.rollbacks, 1);
        assert_eq!(stats.flows_created, 0);
    }
}

// A rollback which cannot free everything still reports the step
// failure; what it left behind is counted.
#[test]
fn rollback_failure_keeps_step_error() {
    let env = TestEnv::new();
    let m = env.mapper(mapper_cfg(16, 64), basic());
    let baseline = env.hw.live();

    env.hw.fail(HwOp::SetTcam, HwError::Invalid);
    env.hw.fail(HwOp::FreeTbl, HwError::Status(-16));
    let err = m.flow_create(&flow(1)).unwrap_err();
    assert_eq!(
        err,
        MapperError::Hw { op: HwOp::SetTcam.to_string(), status: -22 }
    );

    let stats = m.stats();
    assert_eq!(stats.rollbacks, 1);
    assert_eq!(stats.rollback_failures, 1);
    assert_eq!(stats.free_failures, 1);

    // The flow id went back to the pool; the index entry leaked.
    assert!(m.dump_flow_db().flows.is_empty());
    let leaked = &env.hw.calls_of(HwOp::AllocTbl)[1];
    assert_eq!(leaked.res_type, 2);
    assert!(env.hw.is_live(ResKind::Tbl, In, 2, leaked.handle));
    assert_eq!(env.hw.live(), baseline + 1);

    // A clean rollback does not count as a failure.
    env.hw.fail(HwOp::SetTcam, HwError::Invalid);
    m.flow_create(&flow(2)).unwrap_err();
    let stats = m.stats();
    assert_eq!(stats.rollbacks, 2);
    assert_eq!(stats.rollback_failures, 1);
}

#[test]
fn slot_exhaustion_rolls_back() {
    let env = TestEnv::new();
    // Room for the head slot plus two chained records.
    let m = env.mapper(mapper_cfg(4, 6), basic());
    let baseline = env.hw.live();
    let free = check_arena(&m);

    let err = m.flow_create(&flow(1)).unwrap_err();
    assert_eq!(err, MapperError::ResourceExhausted);
    assert!(err.is_exhaustion());
    assert_eq!(env.hw.live(), baseline);
    assert_eq!(check_arena(&m), free);
}

#[test]
fn fid_exhaustion() {
    let env = TestEnv::new();
    let m = env.mapper(mapper_cfg(3, 64), basic());

    let a = m.flow_create(&flow(1)).unwrap();
    let b = m.flow_create(&flow(2)).unwrap();
    assert_ne!(a.fid, b.fid);
    assert_eq!(m.flow_create(&flow(3)).unwrap_err(), MapperError::FidExhausted);

    m.flow_destroy(FlowType::Regular, a.fid).unwrap();
    let c = m.flow_create(&flow(3)).unwrap();
    assert_eq!(c.fid, a.fid);
    check_arena(&m);
}

#[test]
fn template_errors() {
    let env = TestEnv::new();
    let m = env.mapper(mapper_cfg(16, 64), basic());
    let free = check_arena(&m);
    let comp = [0, 0, 0, 0x0a];

    let err = m.flow_create(&class_params(99, &comp)).unwrap_err();
    assert_eq!(
        err,
        MapperError::TemplateNotFound { kind: "class".to_string(), tid: 99 }
    );

    let err = m.flow_create(&class_params(2, &comp)).unwrap_err();
    assert_eq!(
        err,
        MapperError::TemplateRejected { kind: "class".to_string(), tid: 2 }
    );
    // Without the computed field the reject list passes.
    assert!(m.flow_create(&class_params(2, &[0, 0, 0, 0])).is_ok());

    let err = m.flow_create(&class_params(3, &comp)).unwrap_err();
    assert_eq!(err, MapperError::NoSteps { kind: "class".to_string(), tid: 3 });

    let err = m.flow_create(&class_params(4, &comp)).unwrap_err();
    assert_eq!(err, MapperError::StepReject { step: "drop".to_string() });

    let p = FlowCreateParams::new(FlowType::Regular);
    let err = m.flow_create(&p).unwrap_err();
    assert!(matches!(err, MapperError::InvalidConfig(_)));

    // Only the accepted tid 2 flow remains.
    let dump = m.dump_flow_db();
    assert_eq!(dump.flows.len(), 1);
    assert!(dump.flows[0].resources.is_empty());
    assert_eq!(check_arena(&m), free - 1);
}

#[test]
fn missing_comp_field() {
    let env = TestEnv::new();
    let m = env.mapper(mapper_cfg(16, 64), basic());
    let baseline = env.hw.live();

    // The tcam key reads computed field 3.
    let err = m.flow_create(&class_params(1, &[0, 0, 1])).unwrap_err();
    assert!(matches!(
        err,
        MapperError::Step { ref step, .. } if step == "profile tcam"
    ));
    assert_eq!(env.hw.live(), baseline);
}

#[test]
fn execute_list_skips_step() {
    let env = TestEnv::new();
    let m = env.mapper(mapper_cfg(16, 64), basic());

    let out = m.flow_create(&class_params(5, &[])).unwrap();
    let types: Vec<u32> =
        env.hw.calls_of(HwOp::AllocTbl).iter().map(|c| c.res_type).collect();
    assert_eq!(types, vec![GLB_TBL_TYPE, 3]);

    // The counter entry is registered against the flow and recorded
    // as such.
    let ctr = m
        .query_resource(FlowType::Regular, out.fid, ResourceFunc::IndexTable, 1)
        .unwrap()
        .unwrap();
    assert_eq!(ctr.res_type, 3);
    assert_eq!(env.counters.counters(), vec![((In, 3, ctr.handle), out.fid)]);

    let mut p = class_params(5, &[]);
    p.act.act_bitmap = 0x2;
    m.flow_create(&p).unwrap();
    let types: Vec<u32> =
        env.hw.calls_of(HwOp::AllocTbl).iter().map(|c| c.res_type).collect();
    assert_eq!(types, vec![GLB_TBL_TYPE, 3, 4, 3]);

    assert_eq!(m.flush(FlowType::Regular), Ok(2));
    assert!(env.counters.counters().is_empty());
}

#[test]
fn caller_supplied_fid() {
    let env = TestEnv::new();
    let m = env.mapper(mapper_cfg(16, 64), basic());
    let fid = m.alloc_fid(FlowType::Regular, 3).unwrap();

    let mut p = flow(1);
    p.fid = Some(fid);

    // A failed create keeps a fid it did not allocate.
    env.hw.fail(HwOp::InsertEm, HwError::NoSpace);
    assert!(m.flow_create(&p).is_err());
    let dump = m.dump_flow_db();
    assert_eq!(dump.flows.len(), 1);
    assert_eq!(dump.flows[0].fid, fid.val());
    assert_eq!(dump.flows[0].func_id, 3);
    assert!(dump.flows[0].resources.is_empty());

    let out = m.flow_create(&p).unwrap();
    assert_eq!(out.fid, fid);

    m.resources_free(FlowType::Regular, fid).unwrap();
    assert!(m.dump_flow_db().flows[0].resources.is_empty());
    m.free_fid(FlowType::Regular, fid).unwrap();
    assert_eq!(
        m.free_fid(FlowType::Regular, fid),
        Err(MapperError::FlowNotFound {
            flow_type: FlowType::Regular,
            fid: fid.val(),
        })
    );

    p.fid = Some(Fid::new(9));
    assert_eq!(
        m.flow_create(&p).unwrap_err(),
        MapperError::FlowNotFound { flow_type: FlowType::Regular, fid: 9 }
    );
}

#[test]
fn destroy_unknown_flow() {
    let env = TestEnv::new();
    let m = env.mapper(mapper_cfg(16, 64), basic());
    let out = m.flow_create(&flow(1)).unwrap();

    let not_found = MapperError::FlowNotFound {
        flow_type: FlowType::Default,
        fid: out.fid.val(),
    };
    assert_eq!(m.flow_destroy(FlowType::Default, out.fid), Err(not_found));

    m.flow_destroy(FlowType::Regular, out.fid).unwrap();
    assert!(matches!(
        m.flow_destroy(FlowType::Regular, out.fid),
        Err(MapperError::FlowNotFound { .. })
    ));
    assert_eq!(m.stats().flows_destroyed, 1);
}

// A resource the backend refuses to free is counted, the remaining
// resources are still released and the fid is returned.
#[test]
fn free_failure_is_best_effort() {
    let env = TestEnv::new();
    let m = env.mapper(mapper_cfg(16, 64), basic());
    let out = m.flow_create(&flow(1)).unwrap();

    env.hw.fail(HwOp::FreeIdent, HwError::Status(-5));
    let err = m.flow_destroy(FlowType::Regular, out.fid).unwrap_err();
    assert_eq!(
        err,
        MapperError::ResourceFree { fid: out.fid.val(), failed: 1 }
    );

    assert_eq!(free_ops(&env.hw).len(), 4);
    assert_eq!(env.hw.live_of(ResKind::Ident), 1);
    assert_eq!(env.hw.live_of(ResKind::Tcam), 0);
    assert!(m.dump_flow_db().flows.is_empty());

    let stats = m.stats();
    assert_eq!(stats.free_failures, 1);
    assert_eq!(stats.resources_freed, 4);
}

#[test]
fn flush_by_func() {
    let env = TestEnv::new();
    let m = env.mapper(mapper_cfg(16, 64), basic());

    for (sig, func) in [(1, 1), (2, 1), (3, 2)] {
        let mut p = flow(sig);
        p.func_id = func;
        m.flow_create(&p).unwrap();
    }

    assert_eq!(m.flush_func(1), Ok(2));
    let dump = m.dump_flow_db();
    assert_eq!(dump.flows.len(), 1);
    assert_eq!(dump.flows[0].func_id, 2);

    assert_eq!(m.flush(FlowType::Regular), Ok(1));
    assert_eq!(m.flush(FlowType::Regular), Ok(0));
    assert_eq!(m.stats().flows_destroyed, 3);

    drop(m);
    env.assert_clean();
}

#[test]
fn arena_survives_churn() {
    let env = TestEnv::new();
    let m = env.mapper(mapper_cfg(8, 40), basic());
    let free = check_arena(&m);
    let mut live = Vec::new();

    for round in 0..32u64 {
        if round % 3 == 2 {
            let fid = live.remove(0);
            m.flow_destroy(FlowType::Regular, fid).unwrap();
        } else {
            match m.flow_create(&flow(round)) {
                Ok(out) => live.push(out.fid),
                Err(e) => assert!(e.is_exhaustion(), "{e}"),
            }
        }
        check_arena(&m);
    }

    for fid in live {
        m.flow_destroy(FlowType::Regular, fid).unwrap();
    }
    assert_eq!(check_arena(&m), free);
}

#[test]
fn stats_track_lifecycle() {
    let env = TestEnv::new();
    let m = env.mapper(mapper_cfg(16, 64), basic());

    let a = m.flow_create(&flow(1)).unwrap();
    m.flow_create(&flow(2)).unwrap();
    env.hw.fail(HwOp::SetTcam, HwError::Invalid);
    m.flow_create(&flow(3)).unwrap_err();
    m.flow_destroy(FlowType::Regular, a.fid).unwrap();

    let stats = m.stats();
    assert_eq!(stats.flows_created, 2);
    assert_eq!(stats.flows_failed, 1);
    assert_eq!(stats.rollbacks, 1);
    assert_eq!(stats.rollback_failures, 0);
    assert_eq!(stats.flows_destroyed, 1);
    assert_eq!(stats.resources_freed, 5 + 2);
    assert_eq!(stats.free_failures, 0);
    assert_eq!(stats.gen_tbl_hits, 0);

    let names: Vec<&str> = stats.pairs().iter().map(|(n, _)| *n).collect();
    assert_eq!(names[0], "flows_created");
}

#[test]
fn global_registers() {
    let env = TestEnv::new();
    let m = env.mapper(mapper_cfg(16, 64), basic());
    assert_eq!(env.hw.live_of(ResKind::Tbl), 1);
    let glb = env.hw.calls_of(HwOp::AllocTbl)[0].clone();
    assert_eq!(glb.res_type, GLB_TBL_TYPE);

    drop(m);
    let freed = env.hw.calls_of(HwOp::FreeTbl);
    assert_eq!(freed.len(), 1);
    assert_eq!(freed[0].handle, glb.handle);
    env.assert_clean();

    // A failed allocation leaves the mapper unbuilt.
    let env = TestEnv::new();
    env.hw.fail(HwOp::AllocTbl, HwError::NoSpace);
    let tdb = Arc::new(basic());
    let err = Mapper::new("glb", mapper_cfg(16, 64), tdb, env.providers())
        .err()
        .unwrap();
    assert_eq!(
        err,
        MapperError::Hw { op: "alloc_tbl".to_string(), status: -28 }
    );
}

#[test]
fn bad_config() {
    let env = TestEnv::new();
    let tdb = Arc::new(basic());
    let res = Mapper::new("bad", mapper_cfg(8, 8), tdb, env.providers());
    assert!(matches!(res.err(), Some(MapperError::InvalidConfig(_))));

    let mut tdb = basic();
    tdb.class_templates[1].tid = 1;
    let res =
        Mapper::new("dup", mapper_cfg(16, 64), Arc::new(tdb), env.providers());
    assert!(matches!(res.err(), Some(MapperError::InvalidConfig(_))));
}

// The same calls against fresh mappers program identical tables.
#[test]
fn deterministic() {
    let run = || {
        let env = TestEnv::new();
        let m = env.mapper(mapper_cfg(16, 64), basic());
        let a = m.flow_create(&flow(5)).unwrap();
        m.flow_create(&flow(6)).unwrap();
        m.flow_destroy(FlowType::Regular, a.fid).unwrap();
        (env.hw.call_log(), m.dump_flow_db())
    };

    assert_eq!(run(), run());
}
