// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Generic table steps.
//!
//! Generic tables are software tables shared between flows: the first
//! writer of a key creates the entry, later writers take a reference.
//! An entry may adopt the RID flow allocated by the call that created
//! it, in which case the RID lives exactly as long as the entry.

use super::Run;
use super::StepError;
use super::pad_to;
use crate::api::Fid;
use crate::api::ResourceFunc;
use crate::engine::blob::Blob;
use crate::engine::flow_db::ResourceRecord;
use crate::engine::gen_tbl::MAX_INDEX_KEY_BYTES;
use crate::engine::gen_tbl::Release;
use crate::engine::gen_tbl::SearchResult;
use crate::engine::gen_tbl::tbl_idx;
use crate::engine::regfile::RF_IDX_GENERIC_TBL_MISS;
use crate::engine::template::FdbOpc;
use crate::engine::template::GenOpc;
use crate::engine::template::StepKind;
use crate::engine::template::TableStep;
use crate::provider::LogLevel;

fn record(step: &TableStep, subtype: u32, handle: u64) -> ResourceRecord {
    ResourceRecord {
        direction: step.direction,
        func: ResourceFunc::GenericTable,
        res_type: tbl_idx(subtype, step.direction),
        subtype,
        handle,
        critical: step.critical,
        shared: false,
    }
}

/// Build the table key: the raw key bytes of a hash table, or the
/// big-endian entry index of a direct table.
fn table_key(
    run: &Run<'_>,
    step: &TableStep,
    key_bytes: Option<usize>,
) -> Result<Vec<u8>, StepError> {
    match key_bytes {
        Some(n) => {
            let bits = n * 8;
            let mut key = run.build_key(step, bits)?;
            pad_to(&mut key, bits)?;
            Ok(key.into_data())
        }

        None => {
            let key = run.build_key(step, MAX_INDEX_KEY_BYTES * 8)?;
            let idx = key.extract(0, key.bit_len())?;
            Ok((idx as u32).to_be_bytes().to_vec())
        }
    }
}

pub(super) fn process(
    run: &mut Run<'_>,
    step: &TableStep,
) -> Result<(), StepError> {
    let StepKind::Generic { opc, subtype, rid_regfile, return_handle } =
        step.kind
    else {
        return Err(StepError::Config { what: "not a generic step" });
    };

    let dir = step.direction;
    let (key_bytes, result_bits, order) = {
        let tbl = run.st.gen_tbls.get(subtype, dir)?;
        let p = tbl.params();
        let key_bytes = tbl.is_hashed().then_some(usize::from(p.key_bytes));
        (key_bytes, usize::from(p.result_bits), p.byte_order)
    };

    let key = table_key(run, step, key_bytes)?;

    match opc {
        GenOpc::Read => read(run, step, subtype, &key),
        GenOpc::Write => {
            let mut res = run.build_result(step, result_bits, order)?;
            pad_to(&mut res, result_bits)?;
            res.finish_le();
            write(run, step, subtype, &key, res, rid_regfile, return_handle)
        }
    }
}

fn read(
    run: &mut Run<'_>,
    step: &TableStep,
    subtype: u32,
    key: &[u8],
) -> Result<(), StepError> {
    let dir = step.direction;

    let hit = {
        let tbl = run.st.gen_tbls.get(subtype, dir)?;
        match tbl.lookup(key)? {
            Some((handle, _)) => {
                let ent = tbl.entry(handle)?;
                let mut blob = Blob::from_bytes(
                    ent.data.clone(),
                    ent.bit_len,
                    ent.byte_order,
                );
                // Undo the byte order applied when the entry was written.
                blob.finish_le();
                Some((handle, blob))
            }
            None => None,
        }
    };

    let Some((handle, blob)) = hit else {
        run.st.stats.vals.gen_tbl_misses += 1;
        run.regfile.write(RF_IDX_GENERIC_TBL_MISS, 1)?;
        return Ok(());
    };

    run.st.stats.vals.gen_tbl_hits += 1;
    run.regfile.write(RF_IDX_GENERIC_TBL_MISS, 0)?;
    run.read_idents(step, &blob)?;

    if step.fdb == FdbOpc::Nop {
        return Ok(());
    }

    run.st.gen_tbls.get_mut(subtype, dir)?.add_ref(handle)?;
    if let Err(e) = run.record(step, record(step, subtype, handle)) {
        // The entry was live before our reference; this never drops
        // the last one.
        let tbl = run.st.gen_tbls.get_mut(subtype, dir)?;
        if let Err(re) = tbl.release(handle) {
            run.log(LogLevel::Error, &format!("release {handle:#x}: {re}"));
        }
        return Err(e);
    }

    Ok(())
}

fn write(
    run: &mut Run<'_>,
    step: &TableStep,
    subtype: u32,
    key: &[u8],
    res: Blob,
    rid_regfile: Option<u16>,
    return_handle: bool,
) -> Result<(), StepError> {
    let dir = step.direction;

    let nested: Option<Fid> = match rid_regfile {
        Some(reg) => {
            let rid = run.rid_from(reg)?;
            if run.rid != Some(rid) {
                return Err(StepError::Config {
                    what: "nested RID is not the one in flight",
                });
            }
            Some(rid)
        }
        None => None,
    };

    let tbl = run.st.gen_tbls.get_mut(subtype, dir)?;
    let (handle, key_idx, missed) = match tbl.lookup_or_create(key)? {
        SearchResult::Found { handle, key_idx } => (handle, key_idx, false),
        SearchResult::Missed { handle, key_idx } => (handle, key_idx, true),
        SearchResult::Full => {
            return Err(StepError::GenTblFull { subtype, dir });
        }
    };

    let bits = res.bit_len();
    if let Err(e) = tbl.write_entry(handle, res.into_data(), bits, nested) {
        if missed {
            tbl.reclaim(handle)?;
        }
        return Err(e.into());
    }

    if missed {
        run.st.stats.vals.gen_tbl_misses += 1;
    } else {
        run.st.stats.vals.gen_tbl_hits += 1;
    }

    // The entry owns the RID from here on.
    if nested.is_some() {
        run.rid = None;
    }

    if let Err(e) = run.record(step, record(step, subtype, handle)) {
        let tbl = run.st.gen_tbls.get_mut(subtype, dir)?;
        if let Release::Last { .. } = tbl.release(handle)? {
            tbl.reclaim(handle)?;
        }
        // Hand the RID back so the rollback destroys it.
        run.rid = nested.or(run.rid);
        return Err(e);
    }

    if return_handle {
        let tbl = u64::from(tbl_idx(subtype, dir));
        run.shared_handle = Some((tbl << 32) | u64::from(key_idx));
    }

    run.regfile.write(RF_IDX_GENERIC_TBL_MISS, u64::from(missed))?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::engine::Direction;
    use crate::engine::blob::ByteOrder;

    #[test]
    fn record_carries_table_index() {
        let step = TableStep::new(
            "encap",
            Direction::Out,
            StepKind::Generic {
                opc: GenOpc::Write,
                subtype: 3,
                rid_regfile: None,
                return_handle: false,
            },
        );

        let rec = record(&step, 3, 0x11);
        assert_eq!(rec.res_type, 7);
        assert_eq!(rec.subtype, 3);
        assert_eq!(rec.func, ResourceFunc::GenericTable);
        assert_eq!(rec.handle, 0x11);
        assert!(!rec.critical);
    }

    #[test]
    fn little_endian_round_trip() {
        let mut b = Blob::new(16, ByteOrder::Little);
        b.push_u64(16, 0x1234).unwrap();
        b.finish_le();
        assert_eq!(b.data(), &[0x34, 0x12]);

        let mut back =
            Blob::from_bytes(b.data().to_vec(), 16, ByteOrder::Little);
        back.finish_le();
        assert_eq!(back.extract(0, 16), Ok(0x1234));
    }
}
