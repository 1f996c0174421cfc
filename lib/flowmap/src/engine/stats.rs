// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Mapper statistics.

use crate::ddi::stat::StatProvider;
use crate::ddi::stat::StatU64;

/// Counters kept by every mapper instance, snapshotted by
/// [`crate::engine::mapper::Mapper::stats()`].
#[derive(StatProvider)]
pub struct MapperStats {
    /// Flow-create calls which returned a flow.
    pub flows_created: StatU64,
    /// Flow-create calls which failed, rolled back or not.
    pub flows_failed: StatU64,
    pub flows_destroyed: StatU64,
    /// Failed creates whose partial state was torn down.
    pub rollbacks: StatU64,
    /// Rollbacks which could not tear everything down.
    pub rollback_failures: StatU64,
    pub resources_freed: StatU64,
    /// Resources the backend refused to release.
    pub free_failures: StatU64,
    pub gen_tbl_hits: StatU64,
    pub gen_tbl_misses: StatU64,
}
