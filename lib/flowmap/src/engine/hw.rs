// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The hardware table backend.
//!
//! These primitives are assumed to be atomic and already synchronized
//! by the layer implementing them. Every call is scoped by direction
//! and table type.

use super::Direction;
use alloc::vec::Vec;
use core::fmt;
use core::fmt::Display;

/// A failure reported by the hardware backend.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HwError {
    /// The table (or identifier pool) is full.
    NoSpace,
    /// No entry exists for the given handle.
    NotFound,
    /// The backend rejected the arguments.
    Invalid,
    /// Any other backend status code.
    Status(i32),
}

impl HwError {
    /// The errno-style status value of this error.
    pub fn status(&self) -> i32 {
        match self {
            Self::NoSpace => -28,
            Self::NotFound => -2,
            Self::Invalid => -22,
            Self::Status(s) => *s,
        }
    }
}

impl Display for HwError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoSpace => write!(f, "no space"),
            Self::NotFound => write!(f, "not found"),
            Self::Invalid => write!(f, "invalid argument"),
            Self::Status(s) => write!(f, "status {s}"),
        }
    }
}

/// The backend operation which failed, carried in errors and logs.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HwOp {
    AllocIdent,
    FreeIdent,
    AllocTcam,
    SetTcam,
    FreeTcam,
    InsertEm,
    DeleteEm,
    AllocTbl,
    SetTbl,
    GetTbl,
    FreeTbl,
    SetIfTbl,
    GetIfTbl,
    MarkAdd,
    MarkDel,
    CounterSet,
    CounterReset,
}

impl Display for HwOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::AllocIdent => "alloc_ident",
            Self::FreeIdent => "free_ident",
            Self::AllocTcam => "alloc_tcam",
            Self::SetTcam => "set_tcam",
            Self::FreeTcam => "free_tcam",
            Self::InsertEm => "insert_em",
            Self::DeleteEm => "delete_em",
            Self::AllocTbl => "alloc_tbl",
            Self::SetTbl => "set_tbl",
            Self::GetTbl => "get_tbl",
            Self::FreeTbl => "free_tbl",
            Self::SetIfTbl => "set_if_tbl",
            Self::GetIfTbl => "get_if_tbl",
            Self::MarkAdd => "mark_add",
            Self::MarkDel => "mark_del",
            Self::CounterSet => "counter_set",
            Self::CounterReset => "counter_reset",
        };
        write!(f, "{s}")
    }
}

/// A ternary match row: key and mask of equal width plus the result.
#[derive(Clone, Copy, Debug)]
pub struct TcamEntry<'a> {
    pub key: &'a [u8],
    pub mask: &'a [u8],
    pub key_bits: usize,
    pub result: &'a [u8],
    pub result_bits: usize,
}

/// An exact-match record. When the device merges the key into the
/// record, `record` holds both and `key` is only used for hashing.
#[derive(Clone, Copy, Debug)]
pub struct EmRecord<'a> {
    pub key: &'a [u8],
    pub key_bits: usize,
    pub record: &'a [u8],
    pub record_bits: usize,
}

pub trait HwTables: Send + Sync {
    fn alloc_ident(&self, dir: Direction, ident_type: u32)
    -> Result<u64, HwError>;

    fn free_ident(
        &self,
        dir: Direction,
        ident_type: u32,
        id: u64,
    ) -> Result<(), HwError>;

    /// Allocate a row able to hold a key of `key_bits`.
    fn alloc_tcam(
        &self,
        dir: Direction,
        tcam_type: u32,
        key_bits: usize,
    ) -> Result<u64, HwError>;

    fn set_tcam(
        &self,
        dir: Direction,
        tcam_type: u32,
        row: u64,
        entry: &TcamEntry<'_>,
    ) -> Result<(), HwError>;

    fn free_tcam(
        &self,
        dir: Direction,
        tcam_type: u32,
        row: u64,
    ) -> Result<(), HwError>;

    /// Insert a record and return the handle used to delete it.
    fn insert_em(
        &self,
        dir: Direction,
        em_type: u32,
        rec: &EmRecord<'_>,
    ) -> Result<u64, HwError>;

    fn delete_em(
        &self,
        dir: Direction,
        em_type: u32,
        handle: u64,
    ) -> Result<(), HwError>;

    fn alloc_tbl(&self, dir: Direction, tbl_type: u32) -> Result<u64, HwError>;

    fn set_tbl(
        &self,
        dir: Direction,
        tbl_type: u32,
        idx: u64,
        data: &[u8],
        bits: usize,
    ) -> Result<(), HwError>;

    fn get_tbl(
        &self,
        dir: Direction,
        tbl_type: u32,
        idx: u64,
        bits: usize,
    ) -> Result<Vec<u8>, HwError>;

    fn free_tbl(
        &self,
        dir: Direction,
        tbl_type: u32,
        idx: u64,
    ) -> Result<(), HwError>;

    fn set_if_tbl(
        &self,
        dir: Direction,
        if_type: u32,
        idx: u64,
        data: &[u8],
        bits: usize,
    ) -> Result<(), HwError>;

    fn get_if_tbl(
        &self,
        dir: Direction,
        if_type: u32,
        idx: u64,
        bits: usize,
    ) -> Result<Vec<u8>, HwError>;
}
