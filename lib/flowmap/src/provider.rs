// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Providers allow the mapper to work in different contexts by
//! plugging implementations of core services into the engine. The
//! logging destination is one such service; the hardware backend and
//! its side tables are the others (see [`crate::engine::hw`] and
//! [`crate::engine::collab`]).

use crate::engine::collab::FlowCounters;
use crate::engine::collab::MarkDb;
use crate::engine::collab::PortDb;
use crate::engine::hw::HwTables;
use alloc::boxed::Box;
use core::fmt;
use core::fmt::Display;

/// The set of all platform-specific providers required by a mapper.
pub struct Providers {
    pub log: Box<dyn LogProvider>,
    pub hw: Box<dyn HwTables>,
    pub mark: Box<dyn MarkDb>,
    pub port: Box<dyn PortDb>,
    pub counters: Box<dyn FlowCounters>,
}

/// The execution context handed down into the engine's components.
pub struct ExecCtx {
    pub log: Box<dyn LogProvider>,
}

/// A logging provider provides the means to log messages to some
/// destination based on the context in which the mapper is running.
///
/// For example, in a unit test this could map to `println!`. In a
/// driver it would map to the kernel's console log.
pub trait LogProvider: Send + Sync {
    /// Log a message at the specified level.
    fn log(&self, level: LogLevel, msg: &str);
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LogLevel {
    Note,
    Warn,
    Error,
}

impl Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let level_s = match self {
            Self::Note => "[NOTE]",
            Self::Warn => "[WARN]",
            Self::Error => "[ERROR]",
        };
        write!(f, "{level_s}")
    }
}

#[derive(Clone, Copy)]
pub struct PrintlnLog;

impl LogProvider for PrintlnLog {
    fn log(&self, level: LogLevel, msg: &str) {
        println!("{level} {msg}");
    }
}

/// A logger which discards everything, for callers which only care
/// about returned errors.
#[derive(Clone, Copy)]
pub struct NullLog;

impl LogProvider for NullLog {
    fn log(&self, _level: LogLevel, _msg: &str) {}
}
