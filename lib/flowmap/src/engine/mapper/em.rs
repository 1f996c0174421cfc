// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Exact-match steps.

use super::Run;
use super::StepError;
use super::hw_err;
use super::pad_to;
use crate::api::ResourceFunc;
use crate::engine::blob::Blob;
use crate::engine::blob::ByteOrder;
use crate::engine::flow_db::ResourceRecord;
use crate::engine::hw::EmRecord;
use crate::engine::hw::HwOp;
use crate::engine::template::DeviceParams;
use crate::engine::template::StepKind;
use crate::engine::template::TableStep;
use crate::provider::LogLevel;

/// Lay out a record for a device which merges the key into it: the
/// leading pad, the result, then the key in blocks each followed by
/// the same pad, aligned to the block alignment.
pub(super) fn merge_record(
    dev: &DeviceParams,
    key: &Blob,
    result: &Blob,
) -> Result<Blob, StepError> {
    let blk = usize::from(dev.em_blk_size_bits);
    let align = usize::from(dev.em_blk_align_bits);
    let pad = align - blk;
    let blocks = if blk == 0 { 1 } else { key.bit_len().div_ceil(blk) };
    let cap = pad + result.bit_len() + key.bit_len() + blocks * pad + align;

    let mut rec = Blob::new(cap, ByteOrder::Big);
    rec.pad(pad)?;
    rec.append(result)?;
    rec.merge_block(key, blk, pad)?;
    rec.pad_align(align)?;
    Ok(rec)
}

pub(super) fn process(
    run: &mut Run<'_>,
    step: &TableStep,
) -> Result<(), StepError> {
    let StepKind::Em { res_type, key_bits, result_bits, internal } = step.kind
    else {
        return Err(StepError::Config { what: "not an exact-match step" });
    };

    let dir = step.direction;
    let dev = &run.m.tdb.device;
    let key_bits = usize::from(key_bits);
    let align =
        if internal { usize::from(dev.em_key_align_bytes) * 8 } else { 0 };
    let cap = key_bits.next_multiple_of(align.max(8));

    let mut key = run.build_key(step, cap)?;
    pad_to(&mut key, key_bits)?;
    if internal {
        key.pad_align(align)?;
        let len = key.bit_len() / 8;
        key.byte_reverse(len);
    }

    let result_bits = usize::from(result_bits);
    let mut result = run.build_result(step, result_bits, ByteOrder::Big)?;
    pad_to(&mut result, result_bits)?;

    let record = if dev.em_dynamic_pad {
        let mut k = key.clone();
        k.pad_align(8)?;
        merge_record(dev, &k, &result)?
    } else {
        result
    };

    let em = EmRecord {
        key: key.data(),
        key_bits: key.bit_len(),
        record: record.data(),
        record_bits: record.bit_len(),
    };

    let hw = run.hw();
    let handle =
        hw.insert_em(dir, res_type, &em).map_err(hw_err(HwOp::InsertEm))?;

    let rec = ResourceRecord {
        direction: dir,
        func: ResourceFunc::EmTable,
        res_type,
        handle,
        critical: step.critical,
        ..Default::default()
    };

    let res = run.apply_mark(step, handle).and_then(|_| run.record(step, rec));
    if let Err(e) = res {
        if let Err(de) = hw.delete_em(dir, res_type, handle) {
            run.log(
                LogLevel::Error,
                &format!(
                    "step {}: delete_em {handle:#x}: {de}",
                    step.description
                ),
            );
        }
        return Err(e);
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn merged_layout() {
        let dev = DeviceParams {
            em_dynamic_pad: true,
            em_blk_size_bits: 8,
            em_blk_align_bits: 12,
            ..Default::default()
        };

        let mut key = Blob::new(16, ByteOrder::Big);
        key.push_u64(16, 0xaabb).unwrap();
        let mut result = Blob::new(4, ByteOrder::Big);
        result.push_u64(4, 0xc).unwrap();

        let rec = merge_record(&dev, &key, &result).unwrap();
        // pad(4) result(4) | aa pad(4) | bb pad(4), aligned to 12.
        assert_eq!(rec.bit_len(), 36);
        assert_eq!(rec.data(), &[0x0c, 0xaa, 0x0b, 0xb0, 0x00]);
    }
}
