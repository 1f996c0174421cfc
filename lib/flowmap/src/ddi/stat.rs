// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Named 64-bit counters, modelled after illumos named kstats.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::string::ToString;
pub use stat_macro::StatProvider;

/// A provider of named counters.
///
/// Rather than implementing this trait manually, derive it.
///
/// # Example
///
/// To declare a new provider simply define a struct of named fields
/// with type [`StatU64`] and derive [`StatProvider`].
///
/// ```ignore
/// #[derive(StatProvider)]
/// struct SomeStats {
///     flows_created: StatU64,
///     flows_failed: StatU64,
/// }
/// ```
///
/// To update the values use the `+=` operator.
///
/// ```ignore
/// some_val.stats.flows_created += 1;
/// ```
pub trait StatProvider {
    const NUM_FIELDS: u32;
    type Snap;

    fn new() -> Self;

    fn num_fields(&self) -> u32 {
        Self::NUM_FIELDS
    }

    /// Return a snapshot of the stats. This is how you obtain a copy,
    /// as opposed to the traditional clone().
    fn snapshot(&self) -> Self::Snap;
}

/// A set of counters registered under a module and name.
pub struct StatNamed<T: StatProvider> {
    pub module: String,
    pub name: String,
    pub vals: Box<T>,
}

impl<T: StatProvider> StatNamed<T> {
    pub fn new(module: &str, name: &str, provider: T) -> Self {
        Self {
            module: module.to_string(),
            name: name.to_string(),
            vals: Box::new(provider),
        }
    }
}

/// A 64-bit unsigned named counter.
#[derive(Debug, Default)]
pub struct StatU64 {
    value: u64,
}

impl StatU64 {
    pub fn new() -> Self {
        Self { value: 0 }
    }

    pub fn set(&mut self, val: u64) {
        self.value = val;
    }

    pub fn val(&self) -> u64 {
        self.value
    }

    pub fn incr(&mut self, val: u64) {
        self.value = self.value.wrapping_add(val);
    }
}

impl core::ops::AddAssign<u64> for StatU64 {
    fn add_assign(&mut self, other: u64) {
        self.incr(other);
    }
}

impl core::ops::SubAssign<u64> for StatU64 {
    fn sub_assign(&mut self, other: u64) {
        self.value = self.value.wrapping_sub(other);
    }
}
