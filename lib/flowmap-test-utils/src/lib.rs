// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Common routines for integration tests.
//!
//! The centerpiece is [`StubHw`], an in-memory hardware backend which
//! records every call, tracks which resources are live, and can be
//! told to fail a given operation. Together with the collaborator
//! stubs it lets a test assert that a mapper leaves nothing behind.

// This type of pedantry is more trouble than it's worth here.
#![allow(dead_code)]

use flowmap::api::Fid;
use flowmap::ddi::sync::KMutex;
use flowmap::engine::collab::FlowCounters;
use flowmap::engine::collab::MarkDb;
use flowmap::engine::collab::PortAttr;
use flowmap::engine::collab::PortDb;
use flowmap::engine::hw::EmRecord;
use flowmap::engine::hw::HwTables;
use flowmap::engine::hw::TcamEntry;
use flowmap::provider::PrintlnLog;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;

// Let's make our lives easier and pub use a bunch of stuff.
pub use flowmap::api::Direction;
pub use flowmap::api::Direction::*;
pub use flowmap::api::FlowType;
pub use flowmap::api::MapperError;
pub use flowmap::api::ResourceFunc;
pub use flowmap::engine::flow_db::FlowDbCfg;
pub use flowmap::engine::hw::HwError;
pub use flowmap::engine::hw::HwOp;
pub use flowmap::engine::mapper::FlowCreateOutput;
pub use flowmap::engine::mapper::FlowCreateParams;
pub use flowmap::engine::mapper::Mapper;
pub use flowmap::engine::mapper::MapperCfg;
pub use flowmap::engine::mapper::TeardownOrder;
pub use flowmap::engine::template::TemplateDb;
pub use flowmap::provider::Providers;

/// The kinds of resource the stub hands out.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum ResKind {
    Ident,
    Tcam,
    Em,
    Tbl,
}

/// One call made against the stub backend.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct HwCall {
    pub op: HwOp,
    pub dir: Direction,
    pub res_type: u32,
    /// The row, index, identifier or exact-match handle involved.
    /// Zero for a failed allocation.
    pub handle: u64,
    /// Key (tcam, em) or data (index, interface) bytes.
    pub data: Vec<u8>,
    /// Mask (tcam) or result/record (tcam, em) bytes.
    pub extra: Vec<u8>,
    pub bits: usize,
}

impl HwCall {
    fn new(op: HwOp, dir: Direction, res_type: u32, handle: u64) -> Self {
        Self {
            op,
            dir,
            res_type,
            handle,
            data: vec![],
            extra: vec![],
            bits: 0,
        }
    }
}

struct Fault {
    op: HwOp,
    skip: usize,
    err: HwError,
}

type TblKey = (bool, Direction, u32, u64);

#[derive(Default)]
struct HwState {
    next: BTreeMap<ResKind, u64>,
    live: BTreeSet<(ResKind, Direction, u32, u64)>,
    limits: BTreeMap<ResKind, usize>,
    tables: BTreeMap<TblKey, Vec<u8>>,
    faults: Vec<Fault>,
    calls: Vec<HwCall>,
    allocs: usize,
    frees: usize,
}

impl HwState {
    fn fault(&mut self, op: HwOp) -> Result<(), HwError> {
        let Some(pos) = self.faults.iter().position(|f| f.op == op) else {
            return Ok(());
        };

        if self.faults[pos].skip > 0 {
            self.faults[pos].skip -= 1;
            return Ok(());
        }

        Err(self.faults.remove(pos).err)
    }

    fn alloc(
        &mut self,
        kind: ResKind,
        op: HwOp,
        dir: Direction,
        res_type: u32,
    ) -> Result<u64, HwError> {
        let mut call = HwCall::new(op, dir, res_type, 0);

        let res = self.fault(op).and_then(|_| {
            let in_use = self.live.iter().filter(|l| l.0 == kind).count();
            if self.limits.get(&kind).is_some_and(|lim| in_use >= *lim) {
                return Err(HwError::NoSpace);
            }

            let next = self.next.entry(kind).or_insert(1);
            let handle = *next;
            *next += 1;
            Ok(handle)
        });

        if let Ok(handle) = res {
            call.handle = handle;
            self.live.insert((kind, dir, res_type, handle));
            self.allocs += 1;
        }

        self.calls.push(call);
        res
    }

    fn free(
        &mut self,
        kind: ResKind,
        op: HwOp,
        dir: Direction,
        res_type: u32,
        handle: u64,
    ) -> Result<(), HwError> {
        self.calls.push(HwCall::new(op, dir, res_type, handle));
        self.fault(op)?;

        if !self.live.remove(&(kind, dir, res_type, handle)) {
            return Err(HwError::NotFound);
        }

        self.tables.remove(&(false, dir, res_type, handle));
        self.frees += 1;
        Ok(())
    }
}

/// A recording in-memory hardware backend.
///
/// Clones share state: hand one to the mapper and keep one to
/// inspect.
#[derive(Clone, Default)]
pub struct StubHw {
    inner: Arc<KMutex<HwState>>,
}

impl StubHw {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next call of `op` with `err`.
    pub fn fail(&self, op: HwOp, err: HwError) {
        self.fail_nth(op, 0, err);
    }

    /// Let `skip` calls of `op` succeed, then fail the one after.
    pub fn fail_nth(&self, op: HwOp, skip: usize, err: HwError) {
        self.inner.lock().faults.push(Fault { op, skip, err });
    }

    /// Refuse to hand out more than `n` live resources of `kind`.
    pub fn limit(&self, kind: ResKind, n: usize) {
        self.inner.lock().limits.insert(kind, n);
    }

    /// The number of live resources of every kind.
    pub fn live(&self) -> usize {
        self.inner.lock().live.len()
    }

    pub fn live_of(&self, kind: ResKind) -> usize {
        self.inner.lock().live.iter().filter(|l| l.0 == kind).count()
    }

    pub fn is_live(
        &self,
        kind: ResKind,
        dir: Direction,
        res_type: u32,
        handle: u64,
    ) -> bool {
        self.inner.lock().live.contains(&(kind, dir, res_type, handle))
    }

    /// Successful allocations, including exact-match inserts.
    pub fn allocs(&self) -> usize {
        self.inner.lock().allocs
    }

    /// Successful frees, including exact-match deletes.
    pub fn frees(&self) -> usize {
        self.inner.lock().frees
    }

    pub fn calls(&self) -> usize {
        self.inner.lock().calls.len()
    }

    pub fn call_log(&self) -> Vec<HwCall> {
        self.inner.lock().calls.clone()
    }

    pub fn calls_of(&self, op: HwOp) -> Vec<HwCall> {
        self.inner.lock().calls.iter().filter(|c| c.op == op).cloned().collect()
    }

    /// The ops called, in order.
    pub fn ops(&self) -> Vec<HwOp> {
        self.inner.lock().calls.iter().map(|c| c.op).collect()
    }

    /// Preload an index table entry for read steps.
    pub fn put_tbl(
        &self,
        dir: Direction,
        tbl_type: u32,
        idx: u64,
        data: &[u8],
    ) {
        let key = (false, dir, tbl_type, idx);
        self.inner.lock().tables.insert(key, data.to_vec());
    }

    pub fn put_if_tbl(
        &self,
        dir: Direction,
        if_type: u32,
        idx: u64,
        data: &[u8],
    ) {
        let key = (true, dir, if_type, idx);
        self.inner.lock().tables.insert(key, data.to_vec());
    }

    pub fn tbl(
        &self,
        dir: Direction,
        tbl_type: u32,
        idx: u64,
    ) -> Option<Vec<u8>> {
        self.inner.lock().tables.get(&(false, dir, tbl_type, idx)).cloned()
    }

    pub fn if_tbl(
        &self,
        dir: Direction,
        if_type: u32,
        idx: u64,
    ) -> Option<Vec<u8>> {
        self.inner.lock().tables.get(&(true, dir, if_type, idx)).cloned()
    }

    fn set(
        &self,
        is_if: bool,
        op: HwOp,
        dir: Direction,
        res_type: u32,
        idx: u64,
        data: &[u8],
        bits: usize,
    ) -> Result<(), HwError> {
        let mut st = self.inner.lock();
        let mut call = HwCall::new(op, dir, res_type, idx);
        call.data = data.to_vec();
        call.bits = bits;
        st.calls.push(call);
        st.fault(op)?;
        st.tables.insert((is_if, dir, res_type, idx), data.to_vec());
        Ok(())
    }

    fn get(
        &self,
        is_if: bool,
        op: HwOp,
        dir: Direction,
        res_type: u32,
        idx: u64,
        bits: usize,
    ) -> Result<Vec<u8>, HwError> {
        let mut st = self.inner.lock();
        st.calls.push(HwCall::new(op, dir, res_type, idx));
        st.fault(op)?;
        Ok(st
            .tables
            .get(&(is_if, dir, res_type, idx))
            .cloned()
            .unwrap_or_else(|| vec![0; bits.div_ceil(8)]))
    }
}

impl HwTables for StubHw {
    fn alloc_ident(
        &self,
        dir: Direction,
        ident_type: u32,
    ) -> Result<u64, HwError> {
        self.inner
            .lock()
            .alloc(ResKind::Ident, HwOp::AllocIdent, dir, ident_type)
    }

    fn free_ident(
        &self,
        dir: Direction,
        ident_type: u32,
        id: u64,
    ) -> Result<(), HwError> {
        self.inner
            .lock()
            .free(ResKind::Ident, HwOp::FreeIdent, dir, ident_type, id)
    }

    fn alloc_tcam(
        &self,
        dir: Direction,
        tcam_type: u32,
        _key_bits: usize,
    ) -> Result<u64, HwError> {
        self.inner.lock().alloc(ResKind::Tcam, HwOp::AllocTcam, dir, tcam_type)
    }

    fn set_tcam(
        &self,
        dir: Direction,
        tcam_type: u32,
        row: u64,
        entry: &TcamEntry<'_>,
    ) -> Result<(), HwError> {
        let mut st = self.inner.lock();
        let mut call = HwCall::new(HwOp::SetTcam, dir, tcam_type, row);
        call.data = entry.key.to_vec();
        call.extra = entry.mask.to_vec();
        call.bits = entry.key_bits;
        st.calls.push(call);
        st.fault(HwOp::SetTcam)?;

        if !st.live.contains(&(ResKind::Tcam, dir, tcam_type, row)) {
            return Err(HwError::NotFound);
        }
        Ok(())
    }

    fn free_tcam(
        &self,
        dir: Direction,
        tcam_type: u32,
        row: u64,
    ) -> Result<(), HwError> {
        self.inner
            .lock()
            .free(ResKind::Tcam, HwOp::FreeTcam, dir, tcam_type, row)
    }

    fn insert_em(
        &self,
        dir: Direction,
        em_type: u32,
        rec: &EmRecord<'_>,
    ) -> Result<u64, HwError> {
        let mut st = self.inner.lock();
        let handle = st.alloc(ResKind::Em, HwOp::InsertEm, dir, em_type)?;
        if let Some(call) = st.calls.last_mut() {
            call.data = rec.key.to_vec();
            call.extra = rec.record.to_vec();
            call.bits = rec.record_bits;
        }
        Ok(handle)
    }

    fn delete_em(
        &self,
        dir: Direction,
        em_type: u32,
        handle: u64,
    ) -> Result<(), HwError> {
        self.inner
            .lock()
            .free(ResKind::Em, HwOp::DeleteEm, dir, em_type, handle)
    }

    fn alloc_tbl(&self, dir: Direction, tbl_type: u32) -> Result<u64, HwError> {
        self.inner.lock().alloc(ResKind::Tbl, HwOp::AllocTbl, dir, tbl_type)
    }

    fn set_tbl(
        &self,
        dir: Direction,
        tbl_type: u32,
        idx: u64,
        data: &[u8],
        bits: usize,
    ) -> Result<(), HwError> {
        self.set(false, HwOp::SetTbl, dir, tbl_type, idx, data, bits)
    }

    fn get_tbl(
        &self,
        dir: Direction,
        tbl_type: u32,
        idx: u64,
        bits: usize,
    ) -> Result<Vec<u8>, HwError> {
        self.get(false, HwOp::GetTbl, dir, tbl_type, idx, bits)
    }

    fn free_tbl(
        &self,
        dir: Direction,
        tbl_type: u32,
        idx: u64,
    ) -> Result<(), HwError> {
        self.inner.lock().free(ResKind::Tbl, HwOp::FreeTbl, dir, tbl_type, idx)
    }

    fn set_if_tbl(
        &self,
        dir: Direction,
        if_type: u32,
        idx: u64,
        data: &[u8],
        bits: usize,
    ) -> Result<(), HwError> {
        self.set(true, HwOp::SetIfTbl, dir, if_type, idx, data, bits)
    }

    fn get_if_tbl(
        &self,
        dir: Direction,
        if_type: u32,
        idx: u64,
        bits: usize,
    ) -> Result<Vec<u8>, HwError> {
        self.get(true, HwOp::GetIfTbl, dir, if_type, idx, bits)
    }
}

/// Marks keyed by direction and hardware flow id.
#[derive(Clone, Default)]
pub struct StubMark {
    marks: Arc<KMutex<BTreeMap<(Direction, u64), u32>>>,
}

impl StubMark {
    pub fn marks(&self) -> Vec<((Direction, u64), u32)> {
        self.marks.lock().iter().map(|(k, v)| (*k, *v)).collect()
    }
}

impl MarkDb for StubMark {
    fn mark_add(
        &self,
        dir: Direction,
        hw_fid: u64,
        mark: u32,
    ) -> Result<(), HwError> {
        self.marks.lock().insert((dir, hw_fid), mark);
        Ok(())
    }

    fn mark_del(&self, dir: Direction, hw_fid: u64) -> Result<(), HwError> {
        self.marks
            .lock()
            .remove(&(dir, hw_fid))
            .map(|_| ())
            .ok_or(HwError::NotFound)
    }
}

/// Registered flow counters and the flow each belongs to.
#[derive(Clone, Default)]
pub struct StubCounters {
    counters: Arc<KMutex<BTreeMap<(Direction, u32, u64), Fid>>>,
}

impl StubCounters {
    pub fn counters(&self) -> Vec<((Direction, u32, u64), Fid)> {
        self.counters.lock().iter().map(|(k, v)| (*k, *v)).collect()
    }
}

impl FlowCounters for StubCounters {
    fn counter_set(
        &self,
        dir: Direction,
        tbl_type: u32,
        idx: u64,
        fid: Fid,
    ) -> Result<(), HwError> {
        self.counters.lock().insert((dir, tbl_type, idx), fid);
        Ok(())
    }

    fn counter_reset(
        &self,
        dir: Direction,
        tbl_type: u32,
        idx: u64,
    ) -> Result<(), HwError> {
        self.counters
            .lock()
            .remove(&(dir, tbl_type, idx))
            .map(|_| ())
            .ok_or(HwError::NotFound)
    }
}

#[derive(Clone, Default)]
pub struct StubPorts {
    attrs: Arc<KMutex<BTreeMap<(u64, PortAttr), u64>>>,
}

impl StubPorts {
    pub fn set(&self, port: u64, attr: PortAttr, val: u64) {
        self.attrs.lock().insert((port, attr), val);
    }
}

impl PortDb for StubPorts {
    fn port_attr(&self, port_id: u64, attr: PortAttr) -> Option<u64> {
        self.attrs.lock().get(&(port_id, attr)).copied()
    }
}

/// Every stub a mapper needs, kept so a test can inspect them after
/// handing clones to the mapper.
#[derive(Clone, Default)]
pub struct TestEnv {
    pub hw: StubHw,
    pub mark: StubMark,
    pub counters: StubCounters,
    pub ports: StubPorts,
}

impl TestEnv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn providers(&self) -> Providers {
        Providers {
            log: Box::new(PrintlnLog),
            hw: Box::new(self.hw.clone()),
            mark: Box::new(self.mark.clone()),
            port: Box::new(self.ports.clone()),
            counters: Box::new(self.counters.clone()),
        }
    }

    pub fn mapper(&self, cfg: MapperCfg, tdb: TemplateDb) -> Mapper {
        Mapper::new("test", cfg, Arc::new(tdb), self.providers()).unwrap()
    }

    /// Assert that nothing the mapper allocated for flows is still
    /// held.
    pub fn assert_clean(&self) {
        assert_eq!(self.hw.live(), 0, "live hardware resources");
        assert!(self.mark.marks().is_empty(), "marks left behind");
        assert!(self.counters.counters().is_empty(), "counters left behind");
    }
}

pub fn mapper_cfg(num_flows: u32, num_resources: u32) -> MapperCfg {
    MapperCfg {
        flow_db: FlowDbCfg { num_flows, num_resources, num_funcs: 4 },
        teardown: TeardownOrder::Forward,
    }
}

pub fn parse_tdb(s: &str) -> TemplateDb {
    ron::from_str(s).unwrap()
}

/// Flow-create parameters for a regular flow running the given class
/// template with the given computed fields.
pub fn class_params(tid: u32, comp_fields: &[u64]) -> FlowCreateParams {
    let mut p = FlowCreateParams::new(FlowType::Regular);
    p.class_tid = Some(tid);
    p.flow.comp_fields = comp_fields.to_vec();
    p
}

/// Assert the arena invariants and return the number of free slots.
pub fn check_arena(m: &Mapper) -> u32 {
    m.validate().unwrap();
    let dump = m.dump_flow_db();
    assert!(
        dump.head <= dump.tail,
        "head {} past tail {}",
        dump.head,
        dump.tail
    );
    dump.free_slots()
}
