// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

#![no_std]
#![deny(unreachable_patterns)]
#![deny(unused_must_use)]

#[cfg(any(feature = "std", test))]
#[macro_use]
extern crate std;

#[macro_use]
extern crate alloc;

use alloc::string::String;
use core::fmt;
use core::fmt::Display;
use serde::Deserialize;
use serde::Serialize;

pub mod dump;
pub mod error;

pub use dump::*;
pub use error::*;

/// The overall version of the API. Anytime a type in this crate is
/// added, removed, or modified, this number should increment.
pub const API_VERSION: u64 = 4;

/// Major version of the flowmap package.
pub const MAJOR_VERSION: u64 = 0;

/// The direction of the hardware tables a table step targets.
///
/// Every hardware table exists once per direction; `In` is the
/// receive side, `Out` the transmit side.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Deserialize,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
pub enum Direction {
    #[default]
    In = 1,
    Out = 2,
}

impl Direction {
    /// All directions, in table index order.
    pub const ALL: [Direction; 2] = [Direction::In, Direction::Out];

    /// The zero-based table index of this direction.
    pub const fn idx(&self) -> usize {
        match self {
            Direction::In => 0,
            Direction::Out => 1,
        }
    }
}

impl core::str::FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> core::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "in" | "rx" => Ok(Direction::In),
            "out" | "tx" => Ok(Direction::Out),
            _ => Err(format!("invalid direction: {}", s)),
        }
    }
}

impl Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let dirstr = match self {
            Direction::In => "IN",
            Direction::Out => "OUT",
        };

        write!(f, "{}", dirstr)
    }
}

/// The namespace a flow id belongs to.
///
/// All three namespaces share the same flow database arena. A
/// `Rid` flow is an internal handle used to tie a shared resource to
/// the same teardown machinery as an ordinary flow.
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
pub enum FlowType {
    Regular,
    Default,
    Rid,
}

impl core::str::FromStr for FlowType {
    type Err = String;

    fn from_str(s: &str) -> core::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "regular" | "reg" => Ok(FlowType::Regular),
            "default" | "dflt" => Ok(FlowType::Default),
            "rid" => Ok(FlowType::Rid),
            _ => Err(format!("invalid flow type: {}", s)),
        }
    }
}

impl Display for FlowType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            FlowType::Regular => "REG",
            FlowType::Default => "DFLT",
            FlowType::Rid => "RID",
        };
        write!(f, "{}", s)
    }
}

/// The kind of hardware (or bookkeeping) resource a flow database
/// record refers to. This selects the release path at teardown.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Deserialize,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
pub enum ResourceFunc {
    /// An empty record.
    #[default]
    Invalid,
    Identifier,
    TcamTable,
    EmTable,
    IndexTable,
    IfTable,
    GenericTable,
    CtrlTable,
    /// A mark/metadata entry keyed by a hardware flow id.
    HwFid,
}

impl Display for ResourceFunc {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Self::Invalid => "invalid",
            Self::Identifier => "ident",
            Self::TcamTable => "tcam",
            Self::EmTable => "em",
            Self::IndexTable => "index",
            Self::IfTable => "if",
            Self::GenericTable => "generic",
            Self::CtrlTable => "ctrl",
            Self::HwFid => "hw-fid",
        };
        write!(f, "{}", s)
    }
}

/// A flow identifier.
///
/// A fid names the head record of a flow's resource chain in the
/// flow database. The value zero is reserved and never handed out.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Deserialize,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
pub struct Fid(pub u32);

impl Fid {
    pub const fn new(val: u32) -> Self {
        Fid(val)
    }

    pub const fn val(&self) -> u32 {
        self.0
    }

    pub const fn idx(&self) -> usize {
        self.0 as usize
    }
}

impl Display for Fid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for Fid {
    fn from(val: u32) -> Self {
        Fid(val)
    }
}
