// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Interface table steps. Interface tables are preallocated by the
//! device, so nothing written here is ever recorded.

use super::Run;
use super::StepError;
use super::hw_err;
use super::pad_to;
use crate::engine::blob::Blob;
use crate::engine::blob::ByteOrder;
use crate::engine::hw::HwOp;
use crate::engine::template::IfOpc;
use crate::engine::template::StepKind;
use crate::engine::template::TableStep;

fn operand(op: u64) -> Result<u16, StepError> {
    u16::try_from(op)
        .map_err(|_| StepError::Config { what: "operand out of range" })
}

pub(super) fn process(
    run: &mut Run<'_>,
    step: &TableStep,
) -> Result<(), StepError> {
    let StepKind::IfTbl { opc, res_type, tbl_operand, result_bits } = step.kind
    else {
        return Err(StepError::Config { what: "not an interface step" });
    };

    let dir = step.direction;
    let idx = match opc {
        IfOpc::NotUsed => return Ok(()),
        IfOpc::WrConst => tbl_operand,
        IfOpc::WrCompField | IfOpc::RdCompField => {
            run.ctx(dir).comp_field(operand(tbl_operand)?)?
        }
        IfOpc::WrRegFile | IfOpc::RdRegFile => {
            run.regfile.read(operand(tbl_operand)?)?
        }
    };

    let bits = usize::from(result_bits);
    let hw = run.hw();

    match opc {
        IfOpc::RdCompField | IfOpc::RdRegFile => {
            let data = hw
                .get_if_tbl(dir, res_type, idx, bits)
                .map_err(hw_err(HwOp::GetIfTbl))?;
            let blob = Blob::from_bytes(data, bits, ByteOrder::Big);
            run.read_idents(step, &blob)
        }

        _ => {
            let mut res = run.build_result(step, bits, ByteOrder::Big)?;
            pad_to(&mut res, bits)?;
            hw.set_if_tbl(dir, res_type, idx, res.data(), res.bit_len())
                .map_err(hw_err(HwOp::SetIfTbl))
        }
    }
}
