// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Ternary match steps.

use super::Run;
use super::StepError;
use super::hw_err;
use super::pad_to;
use crate::api::ResourceFunc;
use crate::engine::blob::Blob;
use crate::engine::blob::ByteOrder;
use crate::engine::flow_db::ResourceRecord;
use crate::engine::hw::HwOp;
use crate::engine::hw::TcamEntry;
use crate::engine::template::DeviceParams;
use crate::engine::template::StepKind;
use crate::engine::template::TableStep;
use crate::engine::template::TcamOpc;
use crate::provider::LogLevel;

/// Spread a key (or mask) over 1, 2 or 4 wildcard slices. Each slice
/// leads with a control word: log2 of the slice count for the key,
/// all ones for the mask. Slices are then swapped into device byte
/// order.
pub(super) fn wc_repack(
    dev: &DeviceParams,
    src: &Blob,
    is_mask: bool,
) -> Result<Blob, StepError> {
    let slice = usize::from(dev.wc_slice_bits);
    let ctrl = usize::from(dev.wc_ctrl_bits);
    let payload = slice - ctrl;

    let n: usize = match src.bit_len().div_ceil(payload) {
        0 | 1 => 1,
        2 => 2,
        3 | 4 => 4,
        _ => {
            return Err(StepError::Config {
                what: "key does not fit four wildcard slices",
            });
        }
    };
    let ctrl_val =
        if is_mask { u64::MAX } else { u64::from(n.trailing_zeros()) };

    let mut out = Blob::new(n * slice, ByteOrder::Big);
    for i in 0..n {
        out.push_u64(ctrl, ctrl_val)?;
        let start = (i * payload).min(src.bit_len());
        let bits = payload.min(src.bit_len() - start);
        out.append_from(src, start, bits)?;
        out.pad(payload - bits)?;
    }

    if slice % 8 == 0 {
        out.byte_reverse(slice / 8);
    }

    Ok(out)
}

fn free_row(run: &Run<'_>, step: &TableStep, res_type: u32, row: u64) {
    if let Err(e) = run.hw().free_tcam(step.direction, res_type, row) {
        run.log(
            LogLevel::Error,
            &format!("step {}: free_tcam {row}: {e}", step.description),
        );
    }
}

pub(super) fn process(
    run: &mut Run<'_>,
    step: &TableStep,
) -> Result<(), StepError> {
    let StepKind::Tcam {
        opc,
        res_type,
        tbl_operand,
        key_bits,
        result_bits,
        wildcard,
    } = step.kind
    else {
        return Err(StepError::Config { what: "not a ternary step" });
    };

    let dir = step.direction;
    let hw = run.hw();
    let key_bits = usize::from(key_bits);
    let rec = |row| ResourceRecord {
        direction: dir,
        func: ResourceFunc::TcamTable,
        res_type,
        handle: row,
        critical: step.critical,
        ..Default::default()
    };

    if opc == TcamOpc::AllocWrRegFile {
        let row = hw
            .alloc_tcam(dir, res_type, key_bits)
            .map_err(hw_err(HwOp::AllocTcam))?;

        let res = run
            .regfile
            .write(tbl_operand, row)
            .map_err(StepError::from)
            .and_then(|_| run.record(step, rec(row)));

        if let Err(e) = res {
            free_row(run, step, res_type, row);
            return Err(e);
        }
        return Ok(());
    }

    let (mut key, mut mask) = run.build_key_mask(step, key_bits)?;
    pad_to(&mut key, key_bits)?;
    pad_to(&mut mask, key_bits)?;

    let dev = &run.m.tdb.device;
    if wildcard && dev.wc_dynamic_pad {
        key = wc_repack(dev, &key, false)?;
        mask = wc_repack(dev, &mask, true)?;
    }

    let (row, allocated) = match opc {
        TcamOpc::WrRegFile => (run.regfile.read(tbl_operand)?, false),
        _ => {
            let row = hw
                .alloc_tcam(dir, res_type, key.bit_len())
                .map_err(hw_err(HwOp::AllocTcam))?;
            (row, true)
        }
    };

    let res = program(run, step, row, allocated, &key, &mask, result_bits);
    if let Err(e) = res {
        if allocated {
            free_row(run, step, res_type, row);
        }
        return Err(e);
    }

    if allocated {
        if let Err(e) = run.record(step, rec(row)) {
            free_row(run, step, res_type, row);
            return Err(e);
        }
    }

    Ok(())
}

fn program(
    run: &mut Run<'_>,
    step: &TableStep,
    row: u64,
    allocated: bool,
    key: &Blob,
    mask: &Blob,
    result_bits: u16,
) -> Result<(), StepError> {
    let StepKind::Tcam { res_type, tbl_operand, .. } = step.kind else {
        return Err(StepError::Config { what: "not a ternary step" });
    };

    if allocated {
        run.regfile.write(tbl_operand, row)?;
        run.alloc_idents(step)?;
    }

    let result_bits = usize::from(result_bits);
    let mut result = run.build_result(step, result_bits, ByteOrder::Big)?;
    pad_to(&mut result, result_bits)?;

    let entry = TcamEntry {
        key: key.data(),
        mask: mask.data(),
        key_bits: key.bit_len(),
        result: result.data(),
        result_bits: result.bit_len(),
    };

    run.hw()
        .set_tcam(step.direction, res_type, row, &entry)
        .map_err(hw_err(HwOp::SetTcam))?;

    run.apply_mark(step, row)
}
