// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Bit-granular blob builder.
//!
//! Every key, mask and result handed to the hardware backend is built
//! as a [`Blob`]: a fixed-capacity bit buffer written front to back,
//! most significant bit first.

use crate::d_error::DError;
use alloc::vec::Vec;
use serde::Deserialize;
use serde::Serialize;

/// The byte order the hardware expects for a given table.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq, Serialize,
)]
pub enum ByteOrder {
    #[default]
    Big,
    Little,
}

#[derive(Clone, Copy, Debug, DError, Eq, PartialEq)]
#[derror(leaf_data = BlobError::data)]
pub enum BlobError {
    /// A write would exceed the blob's declared capacity.
    Overflow { cap: usize, need: usize },
    /// A read (or copy) outside of the written bits.
    OutOfRange { pos: usize, bits: usize },
    /// An integer operand wider than 64 bits.
    WideOperand { bits: usize },
}

impl BlobError {
    fn data(&self, data: &mut [u64]) {
        [data[0], data[1]] = match self {
            Self::Overflow { cap, need } => [*cap as u64, *need as u64],
            Self::OutOfRange { pos, bits } => [*pos as u64, *bits as u64],
            Self::WideOperand { bits } => [*bits as u64, 0],
        }
    }
}

#[inline]
fn get_bit(data: &[u8], pos: usize) -> bool {
    data.get(pos / 8).is_some_and(|b| (b >> (7 - (pos % 8))) & 1 == 1)
}

/// Copy `bits` bits starting at bit `pos` (MSB first) of `src` into a
/// right-aligned big-endian byte image.
pub fn extract_bits(src: &[u8], pos: usize, bits: usize) -> Vec<u8> {
    let nbytes = bits.div_ceil(8);
    let mut out = vec![0u8; nbytes];
    let shift = nbytes * 8 - bits;

    for i in 0..bits {
        if get_bit(src, pos + i) {
            let dst = shift + i;
            out[dst / 8] |= 0x80 >> (dst % 8);
        }
    }

    out
}

/// Convert a big-endian byte image of at most 8 bytes to a host
/// integer.
pub fn be_to_u64(bytes: &[u8]) -> Result<u64, BlobError> {
    if bytes.len() > 8 {
        return Err(BlobError::WideOperand { bits: bytes.len() * 8 });
    }

    Ok(bytes.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b)))
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Blob {
    data: Vec<u8>,
    cap: usize,
    write_idx: usize,
    order: ByteOrder,
}

impl Blob {
    /// Create an empty blob able to hold `cap` bits.
    pub fn new(cap: usize, order: ByteOrder) -> Self {
        Self { data: vec![0u8; cap.div_ceil(8)], cap, write_idx: 0, order }
    }

    /// Wrap bytes read back from the hardware (or the generic table
    /// cache) so that fields may be extracted from them.
    pub fn from_bytes(data: Vec<u8>, bits: usize, order: ByteOrder) -> Self {
        let cap = data.len() * 8;
        Self { data, cap, write_idx: bits.min(cap), order }
    }

    pub fn bit_len(&self) -> usize {
        self.write_idx
    }

    pub fn cap(&self) -> usize {
        self.cap
    }

    pub fn order(&self) -> ByteOrder {
        self.order
    }

    /// The written portion of the blob, rounded up to a whole byte.
    pub fn data(&self) -> &[u8] {
        &self.data[..self.write_idx.div_ceil(8)]
    }

    pub fn into_data(mut self) -> Vec<u8> {
        self.data.truncate(self.write_idx.div_ceil(8));
        self.data
    }

    fn reserve(&self, bits: usize) -> Result<(), BlobError> {
        let need = self.write_idx + bits;
        if need > self.cap {
            return Err(BlobError::Overflow { cap: self.cap, need });
        }
        Ok(())
    }

    #[inline]
    fn put_bit(&mut self, val: bool) {
        if val {
            self.data[self.write_idx / 8] |= 0x80 >> (self.write_idx % 8);
        }
        self.write_idx += 1;
    }

    /// Append the low-order `bits` bits of the big-endian image `src`.
    /// A source shorter than `bits` is zero extended.
    pub fn push(&mut self, bits: usize, src: &[u8]) -> Result<(), BlobError> {
        self.reserve(bits)?;
        let src_bits = src.len() * 8;

        for i in 0..bits {
            let val = match (src_bits + i).checked_sub(bits) {
                Some(pos) => get_bit(src, pos),
                None => false,
            };
            self.put_bit(val);
        }

        Ok(())
    }

    /// Append the leading `bits` bits of `src`. Used for values whose
    /// length is carried alongside them rather than fixed by the
    /// field.
    pub fn push_left(
        &mut self,
        bits: usize,
        src: &[u8],
    ) -> Result<(), BlobError> {
        self.reserve(bits)?;

        for i in 0..bits {
            self.put_bit(get_bit(src, i));
        }

        Ok(())
    }

    pub fn push_u64(&mut self, bits: usize, val: u64) -> Result<(), BlobError> {
        if bits > 64 {
            return Err(BlobError::WideOperand { bits });
        }
        self.push(bits, &val.to_be_bytes())
    }

    /// Append `bits` zero bits.
    pub fn pad(&mut self, bits: usize) -> Result<(), BlobError> {
        self.reserve(bits)?;
        self.write_idx += bits;
        Ok(())
    }

    /// Zero pad up to the next multiple of `align` bits.
    pub fn pad_align(&mut self, align: usize) -> Result<(), BlobError> {
        if align == 0 {
            return Ok(());
        }

        let rem = self.write_idx % align;
        if rem == 0 {
            return Ok(());
        }

        self.pad(align - rem)
    }

    /// Append `bits` bits of `other` starting at its bit `pos`.
    pub fn append_from(
        &mut self,
        other: &Blob,
        pos: usize,
        bits: usize,
    ) -> Result<(), BlobError> {
        if pos + bits > other.write_idx {
            return Err(BlobError::OutOfRange { pos, bits });
        }
        self.reserve(bits)?;

        for i in 0..bits {
            self.put_bit(get_bit(&other.data, pos + i));
        }

        Ok(())
    }

    /// Append every written bit of `other`.
    pub fn append(&mut self, other: &Blob) -> Result<(), BlobError> {
        self.append_from(other, 0, other.write_idx)
    }

    /// Append `other` in blocks of `block_bits`, each followed by
    /// `pad` zero bits. The final block may be short.
    pub fn merge_block(
        &mut self,
        other: &Blob,
        block_bits: usize,
        pad: usize,
    ) -> Result<(), BlobError> {
        if block_bits == 0 {
            return self.append(other);
        }

        let mut pos = 0;
        while pos < other.write_idx {
            let bits = block_bits.min(other.write_idx - pos);
            self.append_from(other, pos, bits)?;
            self.pad(pad)?;
            pos += bits;
        }

        Ok(())
    }

    /// Read back `bits` bits at `pos` as an integer.
    pub fn extract(&self, pos: usize, bits: usize) -> Result<u64, BlobError> {
        if bits > 64 {
            return Err(BlobError::WideOperand { bits });
        }

        if pos + bits > self.write_idx {
            return Err(BlobError::OutOfRange { pos, bits });
        }

        let mut val = 0u64;
        for i in 0..bits {
            val = (val << 1) | u64::from(get_bit(&self.data, pos + i));
        }
        Ok(val)
    }

    /// Reverse the byte order within each `chunk` bytes of the
    /// written data. A trailing partial chunk is reversed on its own.
    pub fn byte_reverse(&mut self, chunk: usize) {
        if chunk < 2 {
            return;
        }

        let len = self.write_idx.div_ceil(8);
        for c in self.data[..len].chunks_mut(chunk) {
            c.reverse();
        }
    }

    /// Apply the blob's byte order to the written data. Big-endian
    /// blobs are left untouched.
    pub fn finish_le(&mut self) {
        if self.order == ByteOrder::Little {
            let len = self.write_idx.div_ceil(8);
            self.byte_reverse(len);
        }
    }
}
