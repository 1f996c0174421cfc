// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

#![cfg_attr(not(feature = "std"), no_std)]
#![allow(clippy::len_without_is_empty)]
#![deny(unreachable_patterns)]
#![deny(unused_must_use)]

#[cfg_attr(feature = "engine", macro_use)]
extern crate alloc;

#[cfg(feature = "engine")]
#[macro_use]
extern crate cfg_if;

// This is needed so that the stat-macro (`#[derive(StatProvider)]`)
// can use fully-qualified type paths.
extern crate self as flowmap;

#[cfg(any(feature = "api", test))]
pub mod api;
#[cfg(any(feature = "engine", test))]
pub mod d_error;
#[cfg(any(feature = "engine", test))]
pub mod ddi;
#[cfg(any(feature = "engine", test))]
pub mod engine;
#[cfg(feature = "std")]
pub mod print;
#[cfg(any(feature = "engine", test))]
pub mod provider;

// ================================================================
// DTrace USDT Provider
//
// Probes fired by the mapper. When the `usdt` feature is disabled
// the probe sites compile down to nothing.
// ================================================================
#[cfg(feature = "usdt")]
#[usdt::provider]
mod flowmap_provider {
    fn flow__create__entry(
        mapper: &str,
        flow_type: &str,
        class_tid: u32,
        act_tid: u32,
    ) {
    }
    fn flow__create__return(mapper: &str, fid: u32, res: &str) {}
    fn flow__destroy(mapper: &str, flow_type: &str, fid: u32, res: &str) {}
    fn step__fail(mapper: &str, tmpl: &str, step: &str, err: &str) {}
    fn resource__free__fail(
        mapper: &str,
        fid: u32,
        resource: &str,
        err: &str,
    ) {
    }
}
