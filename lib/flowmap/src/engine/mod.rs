// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The flow mapper engine.
//!
//! The engine interprets table templates to program a flow into the
//! classification hardware, and tracks every resource it allocates on
//! the flow's behalf in the flow database so that the flow can later
//! be torn down exactly.

pub mod blob;
pub mod collab;
pub mod cond;
pub mod field;
pub mod flow_db;
pub mod flow_info;
pub mod gen_tbl;
pub mod hw;
pub mod mapper;
pub mod regfile;
pub mod stats;
pub mod template;

pub use flowmap_api::Direction;
