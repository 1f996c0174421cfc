// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Control steps touch no table. They exist for their function,
//! gotos and the allocation of RID flows.

use super::Run;
use super::StepError;
use crate::api::FlowType;
use crate::engine::template::FdbOpc;
use crate::engine::template::TableStep;
use crate::provider::LogLevel;

pub(super) fn process(
    run: &mut Run<'_>,
    step: &TableStep,
) -> Result<(), StepError> {
    let FdbOpc::AllocRidRegFile(reg) = step.fdb else {
        return Ok(());
    };

    // Only one RID may be in flight: it must be adopted by a generic
    // table entry before another is allocated.
    if run.rid.is_some() {
        return Err(StepError::Config { what: "second RID in one flow create" });
    }

    let rid = run.st.fdb.allocate_fid(FlowType::Rid, 0)?;
    if let Err(e) = run.regfile.write(reg, u64::from(rid.val())) {
        if let Err(fe) = run.st.fdb.free_fid(FlowType::Rid, rid) {
            run.log(LogLevel::Error, &format!("free RID {rid}: {fe}"));
        }
        return Err(e.into());
    }

    run.rid = Some(rid);
    Ok(())
}
