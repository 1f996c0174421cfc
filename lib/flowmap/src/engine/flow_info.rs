// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The parsed description of a flow handed to the mapper.
//!
//! The mapper never parses packets or flow-match descriptions itself;
//! it consumes the result of that work as opaque byte fields and
//! bitmaps addressed by index.

use alloc::vec::Vec;
use serde::Deserialize;
use serde::Serialize;

/// The computed field holding the flow's signature.
pub const CF_IDX_FLOW_SIG_ID: u16 = 0;

/// The computed field holding the device port the flow arrived on.
pub const CF_IDX_DEV_PORT_ID: u16 = 1;

/// A matched header field: the value to match and its mask, both as
/// big-endian byte images. An empty spec means the field was not
/// part of the match.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct HdrField {
    pub spec: Vec<u8>,
    pub mask: Vec<u8>,
}

impl HdrField {
    pub fn new(spec: Vec<u8>, mask: Vec<u8>) -> Self {
        Self { spec, mask }
    }

    /// A field matched exactly: every mask bit set.
    pub fn exact(spec: Vec<u8>) -> Self {
        let mask = vec![0xff; spec.len()];
        Self { spec, mask }
    }
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct ParsedFlow {
    #[serde(default)]
    pub hdr_fields: Vec<HdrField>,
    #[serde(default)]
    pub enc_fields: Vec<Vec<u8>>,
    #[serde(default)]
    pub comp_fields: Vec<u64>,
    /// The protocol headers present in the match.
    #[serde(default)]
    pub hdr_bitmap: u64,
    /// The header fields carrying a match value.
    #[serde(default)]
    pub fld_bitmap: u64,
    /// The encapsulation headers present in the match.
    #[serde(default)]
    pub enc_hdr_bitmap: u64,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct ActionParams {
    #[serde(default)]
    pub act_bitmap: u64,
    /// Action properties, each a big-endian byte image.
    #[serde(default)]
    pub act_props: Vec<Vec<u8>>,
}
