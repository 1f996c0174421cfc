// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Register files.
//!
//! The local register file is scratch space for a single
//! flow-create call: a value produced by one table step (an allocated
//! index, a decoded identifier, a miss flag) is consumed by a later
//! one. The global register file holds values which live for the
//! whole mapper instance.

use super::Direction;
use crate::api::ResourceFunc;
use crate::d_error::DError;
use alloc::vec::Vec;
use serde::Deserialize;
use serde::Serialize;

/// The number of slots in a local register file.
pub const REGFILE_ENTRIES: usize = 128;

/// The number of slots per direction in the global register file.
pub const GLB_REGFILE_ENTRIES: usize = 32;

/// Set by generic table steps: 1 on a miss, 0 on a hit.
pub const RF_IDX_GENERIC_TBL_MISS: u16 = 1;

/// The flow signature stored by an earlier flow, compared by
/// [`crate::engine::cond::AcceptOpc::FlowSigIdMatch`].
pub const RF_IDX_FLOW_SIG_ID: u16 = 2;

#[derive(Clone, Copy, Debug, DError, Eq, PartialEq)]
pub enum RegFileError {
    OutOfRange { idx: u16 },
    GlbOutOfRange { dir: Direction, idx: u16 },
}

/// A per-call register file. Reading a slot that was never written
/// yields zero.
#[derive(Clone, Debug)]
pub struct RegFile {
    entries: [u64; REGFILE_ENTRIES],
}

impl Default for RegFile {
    fn default() -> Self {
        Self::new()
    }
}

impl RegFile {
    pub fn new() -> Self {
        Self { entries: [0; REGFILE_ENTRIES] }
    }

    pub fn read(&self, idx: u16) -> Result<u64, RegFileError> {
        self.entries
            .get(usize::from(idx))
            .copied()
            .ok_or(RegFileError::OutOfRange { idx })
    }

    pub fn write(&mut self, idx: u16, val: u64) -> Result<(), RegFileError> {
        let slot = self
            .entries
            .get_mut(usize::from(idx))
            .ok_or(RegFileError::OutOfRange { idx })?;
        *slot = val;
        Ok(())
    }
}

/// An entry of the global register file.
///
/// Besides the value itself an entry records how it was obtained.
/// A `shared` value came from a session-wide allocation made by
/// someone else and is never released by the mapper; otherwise
/// `func`/`res_type` say how to release it when the mapper is torn
/// down.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct GlbRegEntry {
    pub val: u64,
    pub shared: bool,
    pub func: ResourceFunc,
    pub res_type: u32,
}

impl GlbRegEntry {
    pub fn is_valid(&self) -> bool {
        self.func != ResourceFunc::Invalid || self.shared
    }
}

#[derive(Clone, Debug)]
pub struct GlobalRegFile {
    entries: [Vec<GlbRegEntry>; 2],
}

impl Default for GlobalRegFile {
    fn default() -> Self {
        Self::new()
    }
}

impl GlobalRegFile {
    pub fn new() -> Self {
        Self {
            entries: [
                vec![GlbRegEntry::default(); GLB_REGFILE_ENTRIES],
                vec![GlbRegEntry::default(); GLB_REGFILE_ENTRIES],
            ],
        }
    }

    pub fn read(
        &self,
        dir: Direction,
        idx: u16,
    ) -> Result<&GlbRegEntry, RegFileError> {
        self.entries[dir.idx()]
            .get(usize::from(idx))
            .ok_or(RegFileError::GlbOutOfRange { dir, idx })
    }

    pub fn write(
        &mut self,
        dir: Direction,
        idx: u16,
        entry: GlbRegEntry,
    ) -> Result<(), RegFileError> {
        let slot = self.entries[dir.idx()]
            .get_mut(usize::from(idx))
            .ok_or(RegFileError::GlbOutOfRange { dir, idx })?;
        *slot = entry;
        Ok(())
    }

    /// Remove and return every valid entry.
    pub fn drain(&mut self) -> Vec<(Direction, u16, GlbRegEntry)> {
        let mut out = Vec::new();
        for dir in Direction::ALL {
            for (idx, e) in self.entries[dir.idx()].iter_mut().enumerate() {
                if e.is_valid() {
                    out.push((dir, idx as u16, *e));
                    *e = GlbRegEntry::default();
                }
            }
        }
        out
    }
}
