// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Index table steps.
//!
//! With dynamic SRAM a step names a group of size classes instead of
//! a single table type, and each entry lands in the smallest class
//! wide enough for its result.

use super::Run;
use super::StepError;
use super::hw_err;
use super::pad_to;
use crate::api::FlowType;
use crate::api::ResourceFunc;
use crate::engine::blob::Blob;
use crate::engine::blob::ByteOrder;
use crate::engine::flow_db::ResourceRecord;
use crate::engine::hw::HwOp;
use crate::engine::regfile::GlbRegEntry;
use crate::engine::template::DynGroup;
use crate::engine::template::FdbOpc;
use crate::engine::template::INDEX_SUBTYPE_COUNTER;
use crate::engine::template::IndexOpc;
use crate::engine::template::StepKind;
use crate::engine::template::TableStep;
use crate::provider::LogLevel;

struct IndexStep {
    opc: IndexOpc,
    res_type: u32,
    operand: u16,
    result_bits: usize,
    dyn_group: Option<u16>,
    counter: bool,
}

impl IndexStep {
    fn group<'a>(
        &self,
        run: &Run<'a>,
    ) -> Result<Option<&'a DynGroup>, StepError> {
        let dev = &run.m.tdb.device;
        match self.dyn_group {
            Some(id) if dev.dynamic_sram => dev
                .dyn_group(id)
                .map(Some)
                .ok_or(StepError::Config { what: "unknown dynamic group" }),
            _ => Ok(None),
        }
    }

    /// The table type for an entry of the declared result width.
    fn table_type(&self, run: &Run<'_>) -> Result<u32, StepError> {
        match self.group(run)? {
            None => Ok(self.res_type),
            Some(g) => g
                .fit(self.result_bits)
                .map(|c| c.res_type)
                .ok_or(StepError::Config { what: "result fits no size class" }),
        }
    }

    /// Build the result and pick the table type it goes to.
    fn result(
        &self,
        run: &Run<'_>,
        step: &TableStep,
    ) -> Result<(u32, Blob), StepError> {
        let Some(group) = self.group(run)? else {
            let mut res =
                run.build_result(step, self.result_bits, ByteOrder::Big)?;
            pad_to(&mut res, self.result_bits)?;
            return Ok((self.res_type, res));
        };

        let cap = group
            .classes
            .iter()
            .map(|c| usize::from(c.bits))
            .max()
            .unwrap_or(0);
        let mut res = run.build_result(step, cap, ByteOrder::Big)?;
        let class = group
            .fit(res.bit_len())
            .ok_or(StepError::Config { what: "result fits no size class" })?;
        pad_to(&mut res, usize::from(class.bits))?;
        Ok((class.res_type, res))
    }

    fn record(
        &self,
        step: &TableStep,
        tbl_type: u32,
        idx: u64,
        counted: bool,
    ) -> ResourceRecord {
        ResourceRecord {
            direction: step.direction,
            func: ResourceFunc::IndexTable,
            res_type: tbl_type,
            subtype: if counted { INDEX_SUBTYPE_COUNTER } else { 0 },
            handle: idx,
            critical: step.critical,
            shared: false,
        }
    }
}

pub(super) fn process(
    run: &mut Run<'_>,
    step: &TableStep,
) -> Result<(), StepError> {
    let StepKind::Index {
        opc,
        res_type,
        tbl_operand,
        result_bits,
        dyn_group,
        counter,
    } = step.kind
    else {
        return Err(StepError::Config { what: "not an index step" });
    };

    let ix = IndexStep {
        opc,
        res_type,
        operand: tbl_operand,
        result_bits: usize::from(result_bits),
        dyn_group,
        counter,
    };
    let dir = step.direction;
    let hw = run.hw();

    match ix.opc {
        IndexOpc::Wr => {
            let idx = run.regfile.read(ix.operand)?;
            let (ty, res) = ix.result(run, step)?;
            hw.set_tbl(dir, ty, idx, res.data(), res.bit_len())
                .map_err(hw_err(HwOp::SetTbl))
        }

        IndexOpc::WrGlb => {
            let idx = run.st.glb.read(dir, ix.operand)?.val;
            let (ty, res) = ix.result(run, step)?;
            hw.set_tbl(dir, ty, idx, res.data(), res.bit_len())
                .map_err(hw_err(HwOp::SetTbl))
        }

        IndexOpc::Rd => {
            let idx = run.regfile.read(ix.operand)?;
            let ty = ix.table_type(run)?;
            let data = hw
                .get_tbl(dir, ty, idx, ix.result_bits)
                .map_err(hw_err(HwOp::GetTbl))?;
            let blob = Blob::from_bytes(data, ix.result_bits, ByteOrder::Big);
            run.read_idents(step, &blob)
        }

        IndexOpc::Alloc | IndexOpc::AllocWr | IndexOpc::AllocWrGlb => {
            alloc(run, step, &ix)
        }
    }
}

fn alloc(
    run: &mut Run<'_>,
    step: &TableStep,
    ix: &IndexStep,
) -> Result<(), StepError> {
    let dir = step.direction;
    let hw = run.hw();

    let (ty, res) = match ix.opc {
        IndexOpc::Alloc => (ix.table_type(run)?, None),
        _ => {
            let (ty, res) = ix.result(run, step)?;
            (ty, Some(res))
        }
    };

    let idx = hw.alloc_tbl(dir, ty).map_err(hw_err(HwOp::AllocTbl))?;
    let mut counted = false;
    let res = program(run, step, ix, ty, idx, res.as_ref(), &mut counted);

    if let Err(e) = res {
        if counted {
            if let Err(ce) = run.m.counters.counter_reset(dir, ty, idx) {
                run.log(
                    LogLevel::Error,
                    &format!(
                        "step {}: counter_reset {idx}: {ce}",
                        step.description
                    ),
                );
            }
        }

        if ix.opc == IndexOpc::AllocWrGlb
            && run.st.glb.read(dir, ix.operand).is_ok_and(|e| e.val == idx)
        {
            let reset = GlbRegEntry::default();
            if let Err(ge) = run.st.glb.write(dir, ix.operand, reset) {
                run.log(
                    LogLevel::Error,
                    &format!(
                        "step {}: global register {} reset: {ge:?}",
                        step.description, ix.operand
                    ),
                );
            }
        }

        if let Err(fe) = hw.free_tbl(dir, ty, idx) {
            run.log(
                LogLevel::Error,
                &format!("step {}: free_tbl {idx}: {fe}", step.description),
            );
        }
        return Err(e);
    }

    Ok(())
}

/// Write and record a freshly allocated entry. `counted` is set once
/// the entry has been registered with the flow counters.
fn program(
    run: &mut Run<'_>,
    step: &TableStep,
    ix: &IndexStep,
    ty: u32,
    idx: u64,
    res: Option<&Blob>,
    counted: &mut bool,
) -> Result<(), StepError> {
    let dir = step.direction;

    if let Some(res) = res {
        run.hw()
            .set_tbl(dir, ty, idx, res.data(), res.bit_len())
            .map_err(hw_err(HwOp::SetTbl))?;
    }

    if ix.opc == IndexOpc::AllocWrGlb {
        let cur = run.st.glb.read(dir, ix.operand)?;
        if cur.is_valid() && !cur.shared {
            return Err(StepError::Config {
                what: "global register already owns a resource",
            });
        }

        // A recorded entry belongs to the flow; otherwise the mapper
        // releases it when torn down.
        let entry = GlbRegEntry {
            val: idx,
            shared: step.fdb != FdbOpc::Nop,
            func: ResourceFunc::IndexTable,
            res_type: ty,
        };
        run.st.glb.write(dir, ix.operand, entry)?;
    } else {
        run.regfile.write(ix.operand, idx)?;
    }

    if ix.counter && run.params.flow_type == FlowType::Regular {
        run.m
            .counters
            .counter_set(dir, ty, idx, run.fid)
            .map_err(hw_err(HwOp::CounterSet))?;
        *counted = true;
    }

    run.record(step, ix.record(step, ty, idx, *counted))
}
