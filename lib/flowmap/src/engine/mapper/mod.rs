// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The mapper: a template interpreter which programs flows into the
//! classification hardware and tears them down again.
//!
//! A flow is created by running its class template and then its
//! action template. Each template is a list of table steps; a step
//! builds a key and/or result from the flow's fields, writes it to one
//! hardware table and records what it allocated in the flow database.
//! Should any step fail, everything recorded so far is released and
//! the original error is returned.
//!
//! All state of a mapper instance lives behind a single lock which is
//! held for the entirety of each public call.

use super::Direction;
use super::blob::Blob;
use super::blob::BlobError;
use super::blob::ByteOrder;
use super::blob::be_to_u64;
use super::collab::FlowCounters;
use super::collab::MarkDb;
use super::collab::PortDb;
use super::cond::CondError;
use super::cond::NextStep;
use super::field;
use super::field::EvalCtx;
use super::field::FieldError;
use super::field::FieldInfo;
use super::flow_db::FlowDb;
use super::flow_db::FlowDbCfg;
use super::flow_db::FlowDbError;
use super::flow_db::ResourceRecord;
use super::flow_info::ActionParams;
use super::flow_info::ParsedFlow;
use super::gen_tbl::GenTables;
use super::gen_tbl::GenTblError;
use super::gen_tbl::Release;
use super::hw::HwError;
use super::hw::HwOp;
use super::hw::HwTables;
use super::regfile::GlbRegEntry;
use super::regfile::GlobalRegFile;
use super::regfile::RegFile;
use super::regfile::RegFileError;
use super::stats::MapperStats;
use super::stats::MapperStatsSnap;
use super::template::FdbOpc;
use super::template::GlbResource;
use super::template::INDEX_SUBTYPE_COUNTER;
use super::template::MarkOpc;
use super::template::StepKind;
use super::template::TableStep;
use super::template::Template;
use super::template::TemplateDb;
use super::template::TemplateKind;
use crate::api::Fid;
use crate::api::FlowDbDump;
use crate::api::FlowType;
use crate::api::GenTblDump;
use crate::api::MapperError;
use crate::api::ResourceDump;
use crate::api::ResourceFunc;
use crate::d_error::DError;
use crate::ddi::stat::StatNamed;
use crate::ddi::stat::StatProvider;
use crate::ddi::sync::KMutex;
use crate::provider::ExecCtx;
use crate::provider::LogLevel;
use crate::provider::LogProvider;
use crate::provider::Providers;
use alloc::boxed::Box;
use alloc::string::String;
use alloc::string::ToString;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::fmt::Display;
use serde::Deserialize;
use serde::Serialize;

mod ctrl;
mod em;
mod generic;
mod if_tbl;
mod index;
mod tcam;

/// The most steps a single template run may execute. A template whose
/// gotos loop past this is misconfigured.
pub const MAX_STEPS_PER_TEMPLATE: usize = 1024;

/// The order in which a flow's records are released.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize,
)]
pub enum TeardownOrder {
    /// The critical record first, then the chain oldest first.
    #[default]
    Forward,
    /// The chain newest first, then the critical record.
    Reverse,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct MapperCfg {
    pub flow_db: FlowDbCfg,
    #[serde(default)]
    pub teardown: TeardownOrder,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct FlowCreateParams {
    #[serde(default)]
    pub class_tid: Option<u32>,
    #[serde(default)]
    pub act_tid: Option<u32>,
    #[serde(default)]
    pub flow: ParsedFlow,
    #[serde(default)]
    pub act: ActionParams,
    pub flow_type: FlowType,
    #[serde(default)]
    pub func_id: u16,
    /// Program resources against an already allocated flow id rather
    /// than allocating a new one.
    #[serde(default)]
    pub fid: Option<Fid>,
}

impl FlowCreateParams {
    pub fn new(flow_type: FlowType) -> Self {
        Self {
            class_tid: None,
            act_tid: None,
            flow: ParsedFlow::default(),
            act: ActionParams::default(),
            flow_type,
            func_id: 0,
            fid: None,
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct FlowCreateOutput {
    pub fid: Fid,
    /// `(table index << 32) | key index` of a generic table entry
    /// written by a step asking for it.
    pub shared_handle: Option<u64>,
}

/// A failure within a single table step (or while releasing a single
/// resource).
#[derive(Clone, Copy, Debug, DError, Eq, PartialEq)]
#[derror(leaf_data = StepError::data)]
pub enum StepError {
    Field(FieldError),
    Cond(CondError),
    Blob(BlobError),
    RegFile(RegFileError),
    FlowDb(FlowDbError),
    GenTbl(GenTblError),
    GenTblFull { subtype: u32, dir: Direction },
    Hw(HwOp, HwError),
    /// The flow failed the step's acceptance test.
    Conflict,
    /// A RID owned by a released generic entry failed to tear down.
    NestedFlow { fid: u32 },
    Config { what: &'static str },
}

impl StepError {
    fn data(&self, data: &mut [u64]) {
        [data[0], data[1]] = match self {
            Self::Hw(_, e) => [e.status() as u64, 0],
            Self::GenTblFull { subtype, .. } => [u64::from(*subtype), 0],
            Self::NestedFlow { fid } => [u64::from(*fid), 0],
            _ => [0, 0],
        }
    }
}

impl Display for StepError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Field(e) => write!(f, "field: {e}"),
            Self::Cond(e) => write!(f, "condition: {e:?}"),
            Self::Blob(e) => write!(f, "blob: {e:?}"),
            Self::RegFile(e) => write!(f, "register: {e:?}"),
            Self::FlowDb(e) => write!(f, "flow database: {e}"),
            Self::GenTbl(e) => write!(f, "generic table: {e}"),
            Self::GenTblFull { subtype, dir } => {
                write!(f, "generic table {subtype}/{dir} full")
            }
            Self::Hw(op, e) => write!(f, "{op}: {e}"),
            Self::Conflict => write!(f, "conflict resolution failed"),
            Self::NestedFlow { fid } => write!(f, "nested RID {fid}"),
            Self::Config { what } => write!(f, "{what}"),
        }
    }
}

macro_rules! step_error_from {
    ($($err:ident => $var:ident),* $(,)?) => {
        $(
            impl From<$err> for StepError {
                fn from(e: $err) -> Self {
                    Self::$var(e)
                }
            }
        )*
    };
}

step_error_from! {
    FieldError => Field,
    CondError => Cond,
    BlobError => Blob,
    RegFileError => RegFile,
    FlowDbError => FlowDb,
    GenTblError => GenTbl,
}

fn hw_err(op: HwOp) -> impl Fn(HwError) -> StepError {
    move |e| StepError::Hw(op, e)
}

/// Zero pad `blob` out to the table width `bits`.
fn pad_to(blob: &mut Blob, bits: usize) -> Result<(), StepError> {
    let Some(pad) = bits.checked_sub(blob.bit_len()) else {
        return Err(StepError::Config { what: "fields wider than the table" });
    };
    Ok(blob.pad(pad)?)
}

struct MapperState {
    fdb: FlowDb,
    gen_tbls: GenTables,
    glb: GlobalRegFile,
    stats: StatNamed<MapperStats>,
}

pub struct Mapper {
    name: String,
    tdb: Arc<TemplateDb>,
    hw: Box<dyn HwTables>,
    mark: Box<dyn MarkDb>,
    port: Box<dyn PortDb>,
    counters: Box<dyn FlowCounters>,
    ectx: ExecCtx,
    teardown: TeardownOrder,
    state: KMutex<MapperState>,
}

fn alloc_glb(
    hw: &dyn HwTables,
    resources: &[GlbResource],
    glb: &mut GlobalRegFile,
) -> Result<(), MapperError> {
    let hw_fail = |op: HwOp, e: HwError| MapperError::Hw {
        op: op.to_string(),
        status: e.status(),
    };

    for r in resources {
        let val = if r.shared {
            r.value.ok_or_else(|| {
                MapperError::InvalidConfig(format!(
                    "shared global register {} has no value",
                    r.regfile_idx
                ))
            })?
        } else {
            match r.func {
                ResourceFunc::Identifier => hw
                    .alloc_ident(r.direction, r.res_type)
                    .map_err(|e| hw_fail(HwOp::AllocIdent, e))?,
                ResourceFunc::IndexTable => hw
                    .alloc_tbl(r.direction, r.res_type)
                    .map_err(|e| hw_fail(HwOp::AllocTbl, e))?,
                func => {
                    return Err(MapperError::InvalidConfig(format!(
                        "cannot allocate global {func} resource"
                    )));
                }
            }
        };

        let entry = GlbRegEntry {
            val,
            shared: r.shared,
            func: r.func,
            res_type: r.res_type,
        };

        glb.write(r.direction, r.regfile_idx, entry).map_err(|e| {
            MapperError::InvalidConfig(format!("global register: {e:?}"))
        })?;
    }

    Ok(())
}

/// Release every global register value the mapper allocated itself.
fn free_glb(hw: &dyn HwTables, log: &dyn LogProvider, glb: &mut GlobalRegFile) {
    for (dir, idx, e) in glb.drain() {
        if e.shared {
            continue;
        }

        let res = match e.func {
            ResourceFunc::Identifier => hw
                .free_ident(dir, e.res_type, e.val)
                .map_err(hw_err(HwOp::FreeIdent)),
            ResourceFunc::IndexTable => hw
                .free_tbl(dir, e.res_type, e.val)
                .map_err(hw_err(HwOp::FreeTbl)),
            _ => Ok(()),
        };

        if let Err(e) = res {
            log.log(
                LogLevel::Warn,
                &format!("failed to free global register {dir}/{idx}: {e}"),
            );
        }
    }
}

impl Mapper {
    pub fn new(
        name: &str,
        cfg: MapperCfg,
        tdb: Arc<TemplateDb>,
        providers: Providers,
    ) -> Result<Self, MapperError> {
        tdb.validate()?;

        let fdb = FlowDb::new(cfg.flow_db).map_err(|e| {
            MapperError::InvalidConfig(format!("flow database: {e}"))
        })?;
        let gen_tbls = GenTables::new(&tdb.gen_tables).map_err(|e| {
            MapperError::InvalidConfig(format!("generic tables: {e}"))
        })?;

        let Providers { log, hw, mark, port, counters } = providers;

        let mut glb = GlobalRegFile::new();
        if let Err(e) = alloc_glb(&*hw, &tdb.glb_resources, &mut glb) {
            free_glb(&*hw, &*log, &mut glb);
            return Err(e);
        }

        let stats = StatNamed::new("flowmap", name, MapperStats::new());

        Ok(Self {
            name: name.to_string(),
            tdb,
            hw,
            mark,
            port,
            counters,
            ectx: ExecCtx { log },
            teardown: cfg.teardown,
            state: KMutex::new(MapperState { fdb, gen_tbls, glb, stats }),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn template_db(&self) -> &TemplateDb {
        &self.tdb
    }

    fn log(&self, level: LogLevel, msg: &str) {
        self.ectx.log.log(level, &format!("{}: {msg}", self.name));
    }

    /// Program a flow into the hardware.
    ///
    /// The class template (if any) runs first, then the action
    /// template (if any). On failure every resource recorded against
    /// the flow is released, a newly allocated flow id is returned to
    /// the pool, and the error which caused the failure is returned.
    ///
    /// A rollback step which itself fails does not replace that error.
    /// It is logged and counted in the `rollback_failures` stat, and
    /// whatever it left behind shows up in [`Mapper::dump_flow_db()`].
    pub fn flow_create(
        &self,
        params: &FlowCreateParams,
    ) -> Result<FlowCreateOutput, MapperError> {
        self.create_entry_probe(params);

        let mut guard = self.state.lock();
        let st = &mut *guard;
        let res = self.create_locked(st, params);
        match &res {
            Ok(_) => st.stats.vals.flows_created += 1,
            Err(_) => st.stats.vals.flows_failed += 1,
        }
        drop(guard);

        self.create_return_probe(&res);
        res
    }

    fn create_locked(
        &self,
        st: &mut MapperState,
        params: &FlowCreateParams,
    ) -> Result<FlowCreateOutput, MapperError> {
        if params.class_tid.is_none() && params.act_tid.is_none() {
            return Err(MapperError::InvalidConfig(
                "flow create without templates".to_string(),
            ));
        }

        let flow_type = params.flow_type;
        let (fid, owned) = match params.fid {
            Some(fid) => {
                if fid.val() == 0 || !st.fdb.is_active(flow_type, fid) {
                    return Err(MapperError::FlowNotFound {
                        flow_type,
                        fid: fid.val(),
                    });
                }
                (fid, false)
            }

            None => {
                let fid = st
                    .fdb
                    .allocate_fid(flow_type, params.func_id)
                    .map_err(|e| self.fdb_error(e))?;
                (fid, true)
            }
        };

        let mut run = Run {
            m: self,
            st: &mut *st,
            params,
            fid,
            regfile: RegFile::new(),
            rid: None,
            shared_handle: None,
        };

        let res = run.run_templates();
        let (rid, shared_handle) = (run.rid, run.shared_handle);

        match res {
            Ok(()) => Ok(FlowCreateOutput { fid, shared_handle }),
            Err(e) => {
                self.rollback(st, flow_type, fid, owned, rid);
                Err(e)
            }
        }
    }

    fn rollback(
        &self,
        st: &mut MapperState,
        flow_type: FlowType,
        fid: Fid,
        owned: bool,
        rid: Option<Fid>,
    ) {
        st.stats.vals.rollbacks += 1;
        let mut clean = true;

        if let Some(rid) = rid {
            if let Err(e) = self.destroy_locked(st, FlowType::Rid, rid) {
                clean = false;
                self.log(
                    LogLevel::Error,
                    &format!("rollback of in-flight RID {rid}: {e}"),
                );
            }
        }

        if let Err(e) = self.free_resources_locked(st, flow_type, fid) {
            clean = false;
            self.log(
                LogLevel::Error,
                &format!("rollback of {flow_type} flow {fid}: {e}"),
            );
        }

        if owned {
            if let Err(e) = st.fdb.free_fid(flow_type, fid) {
                clean = false;
                let e = self.fdb_error(e);
                self.log(
                    LogLevel::Error,
                    &format!("rollback of {flow_type} flow id {fid}: {e}"),
                );
            }
        }

        if !clean {
            st.stats.vals.rollback_failures += 1;
        }
    }

    /// A RID owned by a live generic table entry is torn down with
    /// the entry's last reference, never directly.
    fn check_unowned(
        st: &MapperState,
        flow_type: FlowType,
        fid: Fid,
    ) -> Result<(), MapperError> {
        if flow_type != FlowType::Rid {
            return Ok(());
        }

        match st.gen_tbls.rid_owner(fid) {
            Some(handle) => {
                Err(MapperError::RidInUse { fid: fid.val(), handle })
            }
            None => Ok(()),
        }
    }

    /// Release every resource of a flow and free its flow id.
    ///
    /// A RID still owned by a generic table entry is refused with
    /// [`MapperError::RidInUse`].
    pub fn flow_destroy(
        &self,
        flow_type: FlowType,
        fid: Fid,
    ) -> Result<(), MapperError> {
        let mut guard = self.state.lock();
        let st = &mut *guard;
        let res = match Self::check_unowned(st, flow_type, fid) {
            Ok(()) => self.destroy_locked(st, flow_type, fid),
            Err(e) => Err(e),
        };
        let counted = !matches!(
            res,
            Err(MapperError::FlowNotFound { .. } | MapperError::RidInUse { .. })
        );
        if counted {
            st.stats.vals.flows_destroyed += 1;
        }
        drop(guard);

        self.destroy_probe(flow_type, fid, &res);
        res
    }

    /// Release every resource of a flow, keeping its flow id.
    pub fn resources_free(
        &self,
        flow_type: FlowType,
        fid: Fid,
    ) -> Result<(), MapperError> {
        let mut guard = self.state.lock();
        Self::check_unowned(&guard, flow_type, fid)?;
        self.free_resources_locked(&mut guard, flow_type, fid)
    }

    /// Allocate a flow id without programming anything, for callers
    /// which build a flow from several create calls.
    pub fn alloc_fid(
        &self,
        flow_type: FlowType,
        func_id: u16,
    ) -> Result<Fid, MapperError> {
        let mut guard = self.state.lock();
        guard
            .fdb
            .allocate_fid(flow_type, func_id)
            .map_err(|e| self.fdb_error(e))
    }

    /// Return a flow id obtained from [`Mapper::alloc_fid()`]. The flow
    /// must not hold any resources.
    pub fn free_fid(
        &self,
        flow_type: FlowType,
        fid: Fid,
    ) -> Result<(), MapperError> {
        let mut guard = self.state.lock();
        if !guard.fdb.is_active(flow_type, fid) {
            return Err(MapperError::FlowNotFound { flow_type, fid: fid.val() });
        }
        Self::check_unowned(&guard, flow_type, fid)?;
        guard.fdb.free_fid(flow_type, fid).map_err(|e| self.fdb_error(e))
    }

    /// Destroy every flow of the given type. All flows are visited
    /// even if some fail; the first failure is returned. RIDs owned
    /// by a generic table entry are left to that entry.
    pub fn flush(&self, flow_type: FlowType) -> Result<u32, MapperError> {
        let mut guard = self.state.lock();
        let fids = guard.fdb.active_fids(flow_type);
        self.flush_locked(&mut guard, flow_type, fids)
    }

    /// Destroy every regular flow owned by `func_id`.
    pub fn flush_func(&self, func_id: u16) -> Result<u32, MapperError> {
        let mut guard = self.state.lock();
        let fids = guard.fdb.fids_for_func(func_id);
        self.flush_locked(&mut guard, FlowType::Regular, fids)
    }

    fn flush_locked(
        &self,
        st: &mut MapperState,
        flow_type: FlowType,
        fids: Vec<Fid>,
    ) -> Result<u32, MapperError> {
        let mut first_err = None;
        let mut destroyed = 0;

        for fid in fids {
            // A RID may already have gone with the entry owning it.
            if !st.fdb.is_active(flow_type, fid)
                || Self::check_unowned(st, flow_type, fid).is_err()
            {
                continue;
            }

            match self.destroy_locked(st, flow_type, fid) {
                Ok(()) => destroyed += 1,
                Err(e) => {
                    first_err.get_or_insert(e);
                }
            }
            st.stats.vals.flows_destroyed += 1;
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(destroyed),
        }
    }

    /// Find the first resource of a flow with the given function and
    /// subtype.
    pub fn query_resource(
        &self,
        flow_type: FlowType,
        fid: Fid,
        func: ResourceFunc,
        subtype: u32,
    ) -> Result<Option<ResourceDump>, MapperError> {
        let guard = self.state.lock();
        let rec = guard
            .fdb
            .find_resource(flow_type, fid, func, subtype)
            .map_err(|e| self.fdb_error(e))?;
        Ok(rec.map(|r| r.dump()))
    }

    pub fn dump_flow_db(&self) -> FlowDbDump {
        self.state.lock().fdb.dump()
    }

    pub fn dump_gen_tbl(
        &self,
        subtype: u32,
        dir: Direction,
    ) -> Result<GenTblDump, MapperError> {
        let guard = self.state.lock();
        let tbl = guard.gen_tbls.get(subtype, dir).map_err(|_| {
            let msg = format!("no generic table {subtype}/{dir}");
            MapperError::InvalidConfig(msg)
        })?;
        Ok(tbl.dump())
    }

    pub fn stats(&self) -> MapperStatsSnap {
        self.state.lock().stats.vals.snapshot()
    }

    /// Check the flow database invariants.
    pub fn validate(&self) -> Result<(), MapperError> {
        let guard = self.state.lock();
        guard.fdb.validate().map_err(|e| self.fdb_error(e))
    }

    fn destroy_locked(
        &self,
        st: &mut MapperState,
        flow_type: FlowType,
        fid: Fid,
    ) -> Result<(), MapperError> {
        let res = self.free_resources_locked(st, flow_type, fid);
        if let Err(MapperError::FlowNotFound { .. }) = res {
            return res;
        }

        // The fid is returned even if some resources failed to free.
        st.fdb.free_fid(flow_type, fid).map_err(|e| self.fdb_error(e))?;
        res
    }

    fn pop_next(
        &self,
        st: &mut MapperState,
        flow_type: FlowType,
        fid: Fid,
    ) -> Result<Option<ResourceRecord>, FlowDbError> {
        match self.teardown {
            TeardownOrder::Forward => {
                if let Some(rec) = st.fdb.pop_resource(flow_type, fid, true)? {
                    return Ok(Some(rec));
                }
                st.fdb.pop_resource(flow_type, fid, false)
            }

            TeardownOrder::Reverse => {
                if let Some(rec) = st.fdb.pop_resource_last(flow_type, fid)? {
                    return Ok(Some(rec));
                }
                st.fdb.pop_resource(flow_type, fid, true)
            }
        }
    }

    fn free_resources_locked(
        &self,
        st: &mut MapperState,
        flow_type: FlowType,
        fid: Fid,
    ) -> Result<(), MapperError> {
        if fid.val() == 0 || !st.fdb.is_active(flow_type, fid) {
            return Err(MapperError::FlowNotFound { flow_type, fid: fid.val() });
        }

        let mut failed = 0;
        loop {
            let rec = match self.pop_next(st, flow_type, fid) {
                Ok(Some(rec)) => rec,
                Ok(None) => break,
                Err(e) => return Err(self.fdb_error(e)),
            };

            match self.free_resource(st, &rec) {
                Ok(()) => st.stats.vals.resources_freed += 1,
                Err(e) => {
                    failed += 1;
                    st.stats.vals.free_failures += 1;
                    self.free_fail(fid, &rec, &e);
                }
            }
        }

        if failed > 0 {
            return Err(MapperError::ResourceFree { fid: fid.val(), failed });
        }
        Ok(())
    }

    fn free_resource(
        &self,
        st: &mut MapperState,
        rec: &ResourceRecord,
    ) -> Result<(), StepError> {
        if rec.shared {
            return Ok(());
        }

        let dir = rec.direction;
        match rec.func {
            ResourceFunc::Invalid
            | ResourceFunc::IfTable
            | ResourceFunc::CtrlTable => Ok(()),

            ResourceFunc::Identifier => self
                .hw
                .free_ident(dir, rec.res_type, rec.handle)
                .map_err(hw_err(HwOp::FreeIdent)),

            ResourceFunc::TcamTable => self
                .hw
                .free_tcam(dir, rec.res_type, rec.handle)
                .map_err(hw_err(HwOp::FreeTcam)),

            ResourceFunc::EmTable => self
                .hw
                .delete_em(dir, rec.res_type, rec.handle)
                .map_err(hw_err(HwOp::DeleteEm)),

            ResourceFunc::IndexTable => {
                let reset = if rec.subtype == INDEX_SUBTYPE_COUNTER {
                    self.counters
                        .counter_reset(dir, rec.res_type, rec.handle)
                        .map_err(hw_err(HwOp::CounterReset))
                } else {
                    Ok(())
                };

                let free = self
                    .hw
                    .free_tbl(dir, rec.res_type, rec.handle)
                    .map_err(hw_err(HwOp::FreeTbl));
                free.and(reset)
            }

            ResourceFunc::HwFid => self
                .mark
                .mark_del(dir, rec.handle)
                .map_err(hw_err(HwOp::MarkDel)),

            ResourceFunc::GenericTable => self.release_gen(st, rec),
        }
    }

    /// Drop one reference to a generic table entry. The last
    /// reference tears down the entry's nested RID before the entry
    /// itself is reclaimed.
    fn release_gen(
        &self,
        st: &mut MapperState,
        rec: &ResourceRecord,
    ) -> Result<(), StepError> {
        let dir = rec.direction;
        let tbl = st.gen_tbls.get_mut(rec.subtype, dir)?;
        let release = tbl.release(rec.handle)?;

        let Release::Last { nested_fid } = release else {
            return Ok(());
        };

        let mut res = Ok(());
        if let Some(nested) = nested_fid {
            if st.fdb.is_active(FlowType::Rid, nested) {
                if let Err(e) = self.destroy_locked(st, FlowType::Rid, nested) {
                    self.log(
                        LogLevel::Error,
                        &format!("nested RID {nested} teardown: {e}"),
                    );
                    res = Err(StepError::NestedFlow { fid: nested.val() });
                }
            } else {
                self.log(
                    LogLevel::Warn,
                    &format!(
                        "nested RID {nested} of entry {:#x} not active",
                        rec.handle
                    ),
                );
            }
        }

        st.gen_tbls.get_mut(rec.subtype, dir)?.reclaim(rec.handle)?;
        res
    }

    fn fdb_error(&self, e: FlowDbError) -> MapperError {
        match e {
            FlowDbError::Exhausted => MapperError::FidExhausted,
            FlowDbError::ResourceExhausted => MapperError::ResourceExhausted,
            FlowDbError::Inactive { flow_type, fid } => {
                MapperError::FlowNotFound { flow_type, fid }
            }
            FlowDbError::Corrupt { .. } => {
                self.log(LogLevel::Error, &format!("flow database: {e}"));
                MapperError::Corrupt(e.to_string())
            }
            FlowDbError::BadConfig => MapperError::InvalidConfig(e.to_string()),
        }
    }

    fn step_error(&self, step: &TableStep, e: StepError) -> MapperError {
        let name = || step.description.clone();

        match e {
            StepError::Cond(CondError::InvalidGoto { step: at, delta }) => {
                MapperError::InvalidGoto { step: at, delta }
            }
            StepError::FlowDb(e) => self.fdb_error(e),
            StepError::GenTblFull { subtype, dir } => {
                let table = self
                    .tdb
                    .gen_tables
                    .iter()
                    .find(|p| p.subtype == subtype && p.direction == dir)
                    .map(|p| p.name.clone())
                    .unwrap_or_else(|| format!("{subtype}/{dir}"));
                MapperError::GenTblFull { table }
            }
            StepError::GenTbl(GenTblError::NotInUse { handle }) => {
                MapperError::GenTblNotInUse { handle }
            }
            StepError::GenTbl(GenTblError::Busy { handle }) => {
                MapperError::GenTblEntryBusy { handle }
            }
            StepError::Hw(op, e) => {
                MapperError::Hw { op: op.to_string(), status: e.status() }
            }
            StepError::Field(FieldError::Rejected) => {
                MapperError::StepReject { step: name() }
            }
            StepError::Conflict => MapperError::ConflictReject { step: name() },
            StepError::Config { what } => MapperError::InvalidConfig(format!(
                "{}: {what}",
                step.description
            )),
            e => MapperError::Step { step: name(), msg: e.to_string() },
        }
    }

    fn create_entry_probe(&self, params: &FlowCreateParams) {
        cfg_if! {
            if #[cfg(feature = "usdt")] {
                let ft_s = params.flow_type.to_string();
                let class_tid = params.class_tid.unwrap_or(0);
                let act_tid = params.act_tid.unwrap_or(0);

                crate::flowmap_provider::flow__create__entry!(
                    || (self.name.as_str(), ft_s.as_str(), class_tid, act_tid)
                );
            } else {
                let _ = params;
            }
        }
    }

    fn create_return_probe(&self, res: &Result<FlowCreateOutput, MapperError>) {
        cfg_if! {
            if #[cfg(feature = "usdt")] {
                let (fid, res_s) = match res {
                    Ok(out) => (out.fid.val(), "ok".to_string()),
                    Err(e) => (0, format!("{e:?}")),
                };

                crate::flowmap_provider::flow__create__return!(
                    || (self.name.as_str(), fid, res_s.as_str())
                );
            } else {
                let _ = res;
            }
        }
    }

    fn destroy_probe(
        &self,
        flow_type: FlowType,
        fid: Fid,
        res: &Result<(), MapperError>,
    ) {
        cfg_if! {
            if #[cfg(feature = "usdt")] {
                let ft_s = flow_type.to_string();
                let res_s = match res {
                    Ok(()) => "ok".to_string(),
                    Err(e) => format!("{e:?}"),
                };

                crate::flowmap_provider::flow__destroy!(|| (
                    self.name.as_str(),
                    ft_s.as_str(),
                    fid.val(),
                    res_s.as_str()
                ));
            } else {
                let _ = (flow_type, fid, res);
            }
        }
    }

    fn step_fail(&self, tmpl: &Template, step: &TableStep, err: &StepError) {
        self.log(
            LogLevel::Error,
            &format!("template {} step {}: {err}", tmpl.name, step.description),
        );

        cfg_if! {
            if #[cfg(feature = "usdt")] {
                let eb = crate::d_error::ErrorBlock::<8>::from_err(err)
                    .unwrap_or_else(|eb| eb)
                    .to_string();

                crate::flowmap_provider::step__fail!(|| (
                    self.name.as_str(),
                    tmpl.name.as_str(),
                    step.description.as_str(),
                    eb.as_str()
                ));
            }
        }
    }

    fn free_fail(&self, fid: Fid, rec: &ResourceRecord, err: &StepError) {
        self.log(
            LogLevel::Error,
            &format!("flow {fid}: failed to free {rec}: {err}"),
        );

        cfg_if! {
            if #[cfg(feature = "usdt")] {
                let rec_s = rec.to_string();
                let eb = crate::d_error::ErrorBlock::<8>::from_err(err)
                    .unwrap_or_else(|eb| eb)
                    .to_string();

                crate::flowmap_provider::resource__free__fail!(|| (
                    self.name.as_str(),
                    fid.val(),
                    rec_s.as_str(),
                    eb.as_str()
                ));
            }
        }
    }
}

impl Drop for Mapper {
    fn drop(&mut self) {
        let st = self.state.get_mut();
        free_glb(&*self.hw, &*self.ectx.log, &mut st.glb);
    }
}

/// The state of a single flow-create call.
pub(crate) struct Run<'a> {
    m: &'a Mapper,
    st: &'a mut MapperState,
    params: &'a FlowCreateParams,
    fid: Fid,
    regfile: RegFile,
    /// A RID allocated by this call and not yet adopted by a generic
    /// table entry.
    rid: Option<Fid>,
    shared_handle: Option<u64>,
}

impl<'a> Run<'a> {
    fn run_templates(&mut self) -> Result<(), MapperError> {
        if let Some(tid) = self.params.class_tid {
            self.run_template(TemplateKind::Class, tid)?;
        }

        if let Some(tid) = self.params.act_tid {
            self.run_template(TemplateKind::Action, tid)?;
        }

        if let Some(rid) = self.rid {
            return Err(MapperError::InvalidConfig(format!(
                "RID {rid} allocated but never adopted"
            )));
        }

        Ok(())
    }

    fn run_template(
        &mut self,
        kind: TemplateKind,
        tid: u32,
    ) -> Result<(), MapperError> {
        let m = self.m;
        let tmpl = m.tdb.template(kind, tid).ok_or_else(|| {
            MapperError::TemplateNotFound { kind: kind.to_string(), tid }
        })?;

        let dir = tmpl.steps.first().map(|s| s.direction).unwrap_or_default();
        let rejected = tmpl.reject.eval(&self.ctx(dir)).map_err(|e| {
            m.log(
                LogLevel::Error,
                &format!("template {} reject list: {e:?}", tmpl.name),
            );
            MapperError::Step {
                step: tmpl.name.clone(),
                msg: format!("reject list: {e:?}"),
            }
        })?;

        if rejected {
            return Err(MapperError::TemplateRejected {
                kind: kind.to_string(),
                tid,
            });
        }

        if tmpl.steps.is_empty() {
            return Err(MapperError::NoSteps { kind: kind.to_string(), tid });
        }

        let mut idx = 0;
        for _ in 0..MAX_STEPS_PER_TEMPLATE {
            let step = &tmpl.steps[idx];
            match self.run_step(step, idx, tmpl.steps.len()) {
                Ok(NextStep::Done) => return Ok(()),
                Ok(NextStep::Step(next)) => idx = next,
                Ok(NextStep::Reject) => {
                    m.log(
                        LogLevel::Note,
                        &format!(
                            "template {} rejected at step {}",
                            tmpl.name, step.description
                        ),
                    );
                    return Err(MapperError::StepReject {
                        step: step.description.clone(),
                    });
                }
                Err(e) => {
                    m.step_fail(tmpl, step, &e);
                    return Err(m.step_error(step, e));
                }
            }
        }

        Err(MapperError::InvalidConfig(format!(
            "{kind} template {tid} does not terminate"
        )))
    }

    fn run_step(
        &mut self,
        step: &TableStep,
        idx: usize,
        len: usize,
    ) -> Result<NextStep, StepError> {
        let dir = step.direction;

        if let Some(val) = step.func.eval(&self.ctx(dir))? {
            self.regfile.write(step.func.dst, val)?;
        }

        if !step.execute.eval(&self.ctx(dir))? {
            return Ok(step.false_goto.resolve(idx, len, &self.regfile)?);
        }

        match &step.kind {
            StepKind::Tcam { .. } => tcam::process(self, step)?,
            StepKind::Em { .. } => em::process(self, step)?,
            StepKind::Index { .. } => index::process(self, step)?,
            StepKind::IfTbl { .. } => if_tbl::process(self, step)?,
            StepKind::Generic { .. } => generic::process(self, step)?,
            StepKind::Ctrl => ctrl::process(self, step)?,
        }

        let is_generic = matches!(step.kind, StepKind::Generic { .. });
        if !step.accept.accept(&self.ctx(dir), is_generic)? {
            return Err(StepError::Conflict);
        }

        Ok(step.true_goto.resolve(idx, len, &self.regfile)?)
    }

    fn ctx(&self, dir: Direction) -> EvalCtx<'_> {
        EvalCtx {
            dir,
            flow: &self.params.flow,
            act: &self.params.act,
            regfile: &self.regfile,
            glb: &self.st.glb,
            ports: &*self.m.port,
        }
    }

    fn hw(&self) -> &'a dyn HwTables {
        &*self.m.hw
    }

    fn log(&self, level: LogLevel, msg: &str) {
        self.m.log(level, msg);
    }

    fn field_fail(
        &self,
        step: &TableStep,
        fld: &FieldInfo,
        e: FieldError,
    ) -> StepError {
        self.log(
            LogLevel::Error,
            &format!(
                "step {} field {}: {e}",
                step.description, fld.description
            ),
        );
        StepError::Field(e)
    }

    /// Build the key of a step from the spec side of its key fields.
    fn build_key(
        &self,
        step: &TableStep,
        cap: usize,
    ) -> Result<Blob, StepError> {
        let ctx = self.ctx(step.direction);
        let mut key = Blob::new(cap, ByteOrder::Big);

        for kf in &step.key_fields {
            field::write(&ctx, &kf.spec, true, &mut key)
                .map_err(|e| self.field_fail(step, &kf.spec, e))?;
        }

        Ok(key)
    }

    /// Build a key and its mask. A key field without a mask matches
    /// every bit it wrote.
    fn build_key_mask(
        &self,
        step: &TableStep,
        cap: usize,
    ) -> Result<(Blob, Blob), StepError> {
        let ctx = self.ctx(step.direction);
        let mut key = Blob::new(cap, ByteOrder::Big);
        let mut mask = Blob::new(cap, ByteOrder::Big);

        for kf in &step.key_fields {
            let start = key.bit_len();
            field::write(&ctx, &kf.spec, true, &mut key)
                .map_err(|e| self.field_fail(step, &kf.spec, e))?;
            let bits = key.bit_len() - start;

            match &kf.mask {
                Some(m) => field::write(&ctx, m, false, &mut mask)
                    .map_err(|e| self.field_fail(step, m, e))?,
                None => mask.push(bits, &vec![0xff; bits.div_ceil(8)])?,
            }

            if mask.bit_len() != key.bit_len() {
                return Err(StepError::Config {
                    what: "mask width differs from key",
                });
            }
        }

        Ok((key, mask))
    }

    fn build_result(
        &self,
        step: &TableStep,
        cap: usize,
        order: ByteOrder,
    ) -> Result<Blob, StepError> {
        let mut res = Blob::new(cap, order);
        self.write_result(step, &mut res)?;
        Ok(res)
    }

    fn write_result(
        &self,
        step: &TableStep,
        blob: &mut Blob,
    ) -> Result<(), StepError> {
        let ctx = self.ctx(step.direction);
        field::write_all(&ctx, &step.result_fields, false, blob)
            .map_err(|(i, e)| self.field_fail(step, &step.result_fields[i], e))
    }

    fn push(
        &mut self,
        flow_type: FlowType,
        fid: Fid,
        rec: ResourceRecord,
    ) -> Result<(), StepError> {
        self.st.fdb.add_resource(flow_type, fid, rec)?;
        Ok(())
    }

    fn rid_from(&self, reg: u16) -> Result<Fid, StepError> {
        let val = self.regfile.read(reg)?;
        u32::try_from(val)
            .ok()
            .filter(|v| *v != 0)
            .map(Fid::new)
            .ok_or(StepError::Config { what: "register holds no RID" })
    }

    /// Record a resource as the step's fdb opcode directs.
    fn record(
        &mut self,
        step: &TableStep,
        rec: ResourceRecord,
    ) -> Result<(), StepError> {
        match step.fdb {
            FdbOpc::Nop => Ok(()),
            FdbOpc::PushFid => self.push(self.params.flow_type, self.fid, rec),
            FdbOpc::PushRidRegFile(reg) => {
                let rid = self.rid_from(reg)?;
                self.push(FlowType::Rid, rid, rec)
            }
            FdbOpc::AllocRidRegFile(_) => Err(StepError::Config {
                what: "RID allocation outside a control step",
            }),
        }
    }

    /// Record a side resource (identifier, mark) which must always be
    /// released: a step which records nothing itself attributes it to
    /// the flow being created.
    fn record_owned(
        &mut self,
        step: &TableStep,
        rec: ResourceRecord,
    ) -> Result<(), StepError> {
        match step.fdb {
            FdbOpc::Nop => self.push(self.params.flow_type, self.fid, rec),
            _ => self.record(step, rec),
        }
    }

    fn alloc_idents(&mut self, step: &TableStep) -> Result<(), StepError> {
        let dir = step.direction;
        let hw = self.hw();

        for id in &step.idents {
            let val = hw
                .alloc_ident(dir, id.ident_type)
                .map_err(hw_err(HwOp::AllocIdent))?;

            let rec = ResourceRecord {
                direction: dir,
                func: ResourceFunc::Identifier,
                res_type: id.ident_type,
                handle: val,
                ..Default::default()
            };

            let res = self
                .regfile
                .write(id.regfile_idx, val)
                .map_err(StepError::from)
                .and_then(|_| self.record_owned(step, rec));

            if let Err(e) = res {
                if let Err(fe) = hw.free_ident(dir, id.ident_type, val) {
                    self.log(
                        LogLevel::Error,
                        &format!(
                            "step {}: free_ident {val}: {fe}",
                            step.description
                        ),
                    );
                }
                return Err(e);
            }
        }

        Ok(())
    }

    /// Decode the step's identifiers from a result read back from a
    /// table.
    fn read_idents(
        &mut self,
        step: &TableStep,
        blob: &Blob,
    ) -> Result<(), StepError> {
        for id in &step.idents {
            let pos = usize::from(id.bit_pos);
            let val = blob.extract(pos, usize::from(id.bit_size))?;
            self.regfile.write(id.regfile_idx, val)?;
        }
        Ok(())
    }

    /// Apply the step's mark opcode to the entry with hardware flow id
    /// `hw_fid`.
    fn apply_mark(
        &mut self,
        step: &TableStep,
        hw_fid: u64,
    ) -> Result<(), StepError> {
        let MarkOpc::SetIfMarkAction { act_bit, mark_prop } = step.mark else {
            return Ok(());
        };

        if act_bit >= 64 {
            return Err(StepError::Config {
                what: "mark action bit out of range",
            });
        }

        if self.params.act.act_bitmap & (1 << act_bit) == 0 {
            return Ok(());
        }

        let prop = self
            .params
            .act
            .act_props
            .get(usize::from(mark_prop))
            .ok_or(FieldError::BadIndex { src: "act_prop", idx: mark_prop })?;
        let mark = be_to_u64(prop)
            .ok()
            .and_then(|v| u32::try_from(v).ok())
            .ok_or(StepError::Config { what: "mark wider than 32 bits" })?;

        let dir = step.direction;
        self.m.mark.mark_add(dir, hw_fid, mark).map_err(hw_err(HwOp::MarkAdd))?;

        let rec = ResourceRecord {
            direction: dir,
            func: ResourceFunc::HwFid,
            handle: hw_fid,
            ..Default::default()
        };

        if let Err(e) = self.record_owned(step, rec) {
            if let Err(de) = self.m.mark.mark_del(dir, hw_fid) {
                self.log(
                    LogLevel::Error,
                    &format!(
                        "step {}: mark_del {hw_fid}: {de}",
                        step.description
                    ),
                );
            }
            return Err(e);
        }

        Ok(())
    }
}

