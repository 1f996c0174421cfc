// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

use super::FlowType;
use alloc::string::String;
use libc::c_int;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

/// The error returned by every public mapper operation.
///
/// Internally each component of the engine has its own error type;
/// they are all flattened into this type at the API boundary so that
/// it may be serialized and handed to tooling.
#[derive(Clone, Debug, Deserialize, Eq, Error, PartialEq, Serialize)]
pub enum MapperError {
    #[error("flow database has no free flow ids")]
    FidExhausted,

    #[error("flow database has no free resource slots")]
    ResourceExhausted,

    #[error("generic table {table} is full")]
    GenTblFull { table: String },

    #[error("{kind} template {tid} not found")]
    TemplateNotFound { kind: String, tid: u32 },

    #[error("{kind} template {tid} rejected")]
    TemplateRejected { kind: String, tid: u32 },

    #[error("{kind} template {tid} has no table steps")]
    NoSteps { kind: String, tid: u32 },

    #[error("invalid goto {delta} at step {step}")]
    InvalidGoto { step: usize, delta: i64 },

    /// A step's goto explicitly rejected the flow.
    #[error("flow rejected at step {step}")]
    StepReject { step: String },

    /// The post-write acceptance test of a step failed.
    #[error("conflict resolution failed at step {step}")]
    ConflictReject { step: String },

    #[error("step {step} failed: {msg}")]
    Step { step: String, msg: String },

    #[error("hardware {op} failed with status {status}")]
    Hw { op: String, status: i32 },

    /// The template database holds a value the engine cannot act on.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("{flow_type} flow {fid} not found")]
    FlowNotFound { flow_type: FlowType, fid: u32 },

    /// The flow database detected a violated invariant. Callers
    /// should stop using the mapper instance.
    #[error("flow database corruption: {0}")]
    Corrupt(String),

    /// Teardown could not release every resource of a flow. The flow
    /// id has still been returned to the free pool.
    #[error("{failed} resources of flow {fid} failed to free")]
    ResourceFree { fid: u32, failed: u32 },

    #[error("generic table entry {handle:#x} not in use")]
    GenTblNotInUse { handle: u64 },

    /// A write to a live generic table entry would orphan the RID
    /// flow allocated for it by the current call.
    #[error("generic table entry {handle:#x} already in use")]
    GenTblEntryBusy { handle: u64 },

    /// The RID flow is owned by a live generic table entry and is
    /// only torn down when that entry's last reference goes away.
    #[error("RID flow {fid} owned by generic table entry {handle:#x}")]
    RidInUse { fid: u32, handle: u64 },
}

impl MapperError {
    /// Convert to an errno value.
    pub fn to_errno(&self) -> c_int {
        use libc::*;

        match self {
            Self::FidExhausted => ENOSPC,
            Self::ResourceExhausted => ENOSPC,
            Self::GenTblFull { .. } => ENOSPC,
            Self::TemplateNotFound { .. } => ENOENT,
            Self::TemplateRejected { .. } => EINVAL,
            Self::NoSteps { .. } => EINVAL,
            Self::InvalidGoto { .. } => EINVAL,
            Self::StepReject { .. } => EINVAL,
            Self::ConflictReject { .. } => EINVAL,
            Self::Step { .. } => EINVAL,
            Self::Hw { .. } => EIO,
            Self::InvalidConfig(_) => EINVAL,
            Self::FlowNotFound { .. } => ENOENT,
            Self::Corrupt(_) => EFAULT,
            Self::ResourceFree { .. } => EIO,
            Self::GenTblNotInUse { .. } => ENOENT,
            Self::GenTblEntryBusy { .. } => EBUSY,
            Self::RidInUse { .. } => EBUSY,
        }
    }

    /// Is this an exhaustion of some finite resource?
    pub fn is_exhaustion(&self) -> bool {
        matches!(
            self,
            Self::FidExhausted
                | Self::ResourceExhausted
                | Self::GenTblFull { .. }
        )
    }
}
