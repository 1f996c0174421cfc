// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Collaborators invoked by the table-step processors at fixed
//! points. Their own state is opaque to the mapper.

use super::Direction;
use super::flow_info::ActionParams;
use super::flow_info::ParsedFlow;
use super::hw::HwError;
use crate::api::Fid;
use serde::Deserialize;
use serde::Serialize;

/// The mark/metadata side table, keyed by the hardware flow id of a
/// match or exact-match entry.
pub trait MarkDb: Send + Sync {
    fn mark_add(
        &self,
        dir: Direction,
        hw_fid: u64,
        mark: u32,
    ) -> Result<(), HwError>;

    fn mark_del(&self, dir: Direction, hw_fid: u64) -> Result<(), HwError>;
}

/// The attributes of a device port which templates may reference.
#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
pub enum PortAttr {
    Svif,
    Spif,
    Vnic,
    Vport,
    PhyPort,
    DefaultVnic,
}

pub trait PortDb: Send + Sync {
    fn port_attr(&self, port_id: u64, attr: PortAttr) -> Option<u64>;
}

/// The flow-counter accumulator. Counter entries are registered as
/// they are allocated for regular flows and unregistered when freed.
pub trait FlowCounters: Send + Sync {
    fn counter_set(
        &self,
        dir: Direction,
        tbl_type: u32,
        idx: u64,
        fid: Fid,
    ) -> Result<(), HwError>;

    fn counter_reset(
        &self,
        dir: Direction,
        tbl_type: u32,
        idx: u64,
    ) -> Result<(), HwError>;
}

/// Selects the class and action templates for a flow. The mapper
/// itself is only ever handed the resulting template ids.
pub trait TemplateMatcher {
    fn match_class(&self, flow: &ParsedFlow) -> Option<u32>;

    fn match_action(&self, act: &ActionParams) -> Option<u32>;
}
