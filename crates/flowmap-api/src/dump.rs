// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Dump types handed to tooling for debugging or administrative
//! purposes.

use super::Direction;
use super::FlowType;
use super::ResourceFunc;
use alloc::string::String;
use alloc::vec::Vec;
use serde::Deserialize;
use serde::Serialize;

/// A single resource record attributed to a flow.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ResourceDump {
    pub direction: Direction,
    pub func: ResourceFunc,
    pub res_type: u32,
    pub subtype: u32,
    /// The opaque backend handle (row, index, identifier, ...).
    pub handle: u64,
    /// True when the record lives in the flow's head slot.
    pub critical: bool,
    pub shared: bool,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct FlowDump {
    pub fid: u32,
    pub flow_type: FlowType,
    pub func_id: u16,
    /// The flow's resources; the critical record (if any) first,
    /// followed by the chained records in allocation order.
    pub resources: Vec<ResourceDump>,
}

/// The response to a flow database dump.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct FlowDbDump {
    pub num_flows: u32,
    pub num_resources: u32,
    /// Next free flow id slot.
    pub head: u32,
    /// Last free chained resource slot.
    pub tail: u32,
    pub flows: Vec<FlowDump>,
}

impl FlowDbDump {
    /// The number of slots still available to either end of the arena.
    pub fn free_slots(&self) -> u32 {
        self.tail - self.head
    }
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct GenTblEntryDump {
    /// Entry index (direct tables) or hash index (hash tables).
    pub index: u32,
    pub ref_count: u32,
    pub bit_len: u32,
    pub data: Vec<u8>,
    pub key: Option<Vec<u8>>,
    pub nested_fid: Option<u32>,
}

/// The response to a generic table dump. Only live entries are
/// included.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct GenTblDump {
    pub name: String,
    pub subtype: u32,
    pub direction: Direction,
    pub num_entries: u32,
    pub entries: Vec<GenTblEntryDump>,
}
