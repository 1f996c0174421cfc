// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The field evaluator.
//!
//! A field descriptor names up to three typed sources and an opcode
//! combining them. Evaluation is pure: for the same flow, actions and
//! register contents it always produces the same value. Writing a
//! field into a blob either appends exactly the field's bits or
//! appends nothing at all.

use super::Direction;
use super::blob::Blob;
use super::blob::BlobError;
use super::blob::be_to_u64;
use super::blob::extract_bits;
use super::collab::PortAttr;
use super::collab::PortDb;
use super::flow_info::ActionParams;
use super::flow_info::CF_IDX_DEV_PORT_ID;
use super::flow_info::ParsedFlow;
use super::regfile::GlobalRegFile;
use super::regfile::RegFile;
use crate::d_error::DError;
use alloc::string::String;
use alloc::string::ToString;
use alloc::vec::Vec;
use core::fmt;
use core::fmt::Display;
use serde::Deserialize;
use serde::Serialize;

/// Where the bits of an operand come from.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub enum FieldSrc {
    #[default]
    Zero,
    Ones,
    /// A big-endian literal.
    Const(Vec<u8>),
    CompField(u16),
    RegFile(u16),
    /// A global register of the step's direction.
    GlbRegFile(u16),
    ActProp(u16),
    /// An action property whose length in bytes is held by another
    /// property. Its bits are written left aligned.
    ActPropSized { prop: u16, size_prop: u16 },
    /// The spec of a header field when building a key, its mask
    /// otherwise.
    HdrField(u16),
    /// `bit_size` bits taken at bit `offset` of a header field.
    SubHdrField { field: u16, offset: u16 },
    EncField(u16),
    HdrBit(u8),
    ActBit(u8),
    FieldBit(u8),
    EncHdrBit(u8),
    /// An attribute of the port named by the dev-port computed field.
    PortTable(PortAttr),
    Skip,
    Reject,
}

#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq, Serialize,
)]
pub enum FieldOpc {
    #[default]
    Src1,
    Src1PlusSrc2,
    Src1MinusSrc2,
    Src1AndSrc2,
    Src1OrSrc2,
    Src1OrSrc2OrSrc3,
    Src1AndSrc2OrSrc3,
    Src1ThenSrc2ElseSrc3,
    Skip,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct FieldInfo {
    pub description: String,
    pub bit_size: u16,
    #[serde(default)]
    pub opcode: FieldOpc,
    pub src1: FieldSrc,
    #[serde(default)]
    pub src2: FieldSrc,
    #[serde(default)]
    pub src3: FieldSrc,
}

impl FieldInfo {
    /// A field copied straight from a single source.
    pub fn new(description: &str, bit_size: u16, src1: FieldSrc) -> Self {
        Self {
            description: description.to_string(),
            bit_size,
            opcode: FieldOpc::Src1,
            src1,
            src2: FieldSrc::Zero,
            src3: FieldSrc::Zero,
        }
    }

    pub fn with_op(
        description: &str,
        bit_size: u16,
        opcode: FieldOpc,
        srcs: [FieldSrc; 3],
    ) -> Self {
        let [src1, src2, src3] = srcs;
        Self {
            description: description.to_string(),
            bit_size,
            opcode,
            src1,
            src2,
            src3,
        }
    }
}

/// How an evaluated value is appended to a blob.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FieldEmit {
    /// The low-order `bit_size` bits.
    Low,
    /// The leading `bits` bits.
    Leading,
    Nothing,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FieldValue {
    /// Big-endian image of the value.
    pub bytes: Vec<u8>,
    pub bits: usize,
    /// The integer form, absent for values wider than 64 bits.
    pub int: Option<u64>,
    pub emit: FieldEmit,
}

impl FieldValue {
    fn from_int(bits: usize, val: u64) -> Self {
        Self {
            bytes: val.to_be_bytes().to_vec(),
            bits,
            int: Some(val),
            emit: FieldEmit::Low,
        }
    }

    fn from_bytes(bits: usize, bytes: Vec<u8>) -> Self {
        let int = be_to_u64(&bytes).ok();
        Self { bytes, bits, int, emit: FieldEmit::Low }
    }

    fn nothing() -> Self {
        Self { bytes: Vec::new(), bits: 0, int: None, emit: FieldEmit::Nothing }
    }

    fn is_nonzero(&self) -> bool {
        self.bytes.iter().any(|b| *b != 0)
    }
}

#[derive(Clone, Copy, Debug, DError, Eq, PartialEq)]
#[derror(leaf_data = FieldError::data)]
pub enum FieldError {
    BadIndex { src: &'static str, idx: u16 },
    Oversize { src: &'static str, bits: usize, max: usize },
    Rejected,
    MissingPortAttr { port: u64, attr: PortAttr },
    Blob(BlobError),
}

impl FieldError {
    fn data(&self, data: &mut [u64]) {
        [data[0], data[1]] = match self {
            Self::BadIndex { idx, .. } => [u64::from(*idx), 0],
            Self::Oversize { bits, max, .. } => [*bits as u64, *max as u64],
            Self::MissingPortAttr { port, .. } => [*port, 0],
            _ => [0, 0],
        }
    }
}

impl From<BlobError> for FieldError {
    fn from(e: BlobError) -> Self {
        Self::Blob(e)
    }
}

impl Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadIndex { src, idx } => {
                write!(f, "{src} index {idx} out of range")
            }
            Self::Oversize { src, bits, max } => {
                write!(f, "{src} operand of {bits} bits exceeds {max}")
            }
            Self::Rejected => write!(f, "field rejected"),
            Self::MissingPortAttr { port, attr } => {
                write!(f, "port {port} has no attribute {attr:?}")
            }
            Self::Blob(e) => write!(f, "blob: {e:?}"),
        }
    }
}

/// Everything a field (or condition) may read.
pub struct EvalCtx<'a> {
    pub dir: Direction,
    pub flow: &'a ParsedFlow,
    pub act: &'a ActionParams,
    pub regfile: &'a RegFile,
    pub glb: &'a GlobalRegFile,
    pub ports: &'a dyn PortDb,
}

impl EvalCtx<'_> {
    pub fn comp_field(&self, idx: u16) -> Result<u64, FieldError> {
        self.flow
            .comp_fields
            .get(usize::from(idx))
            .copied()
            .ok_or(FieldError::BadIndex { src: "comp_field", idx })
    }

    fn act_prop(&self, idx: u16) -> Result<&[u8], FieldError> {
        self.act
            .act_props
            .get(usize::from(idx))
            .map(|p| p.as_slice())
            .ok_or(FieldError::BadIndex { src: "act_prop", idx })
    }

    fn hdr_field(&self, idx: u16, is_key: bool) -> Result<&[u8], FieldError> {
        self.flow
            .hdr_fields
            .get(usize::from(idx))
            .map(|f| if is_key { f.spec.as_slice() } else { f.mask.as_slice() })
            .ok_or(FieldError::BadIndex { src: "hdr_field", idx })
    }
}

fn bitmap_bit(map: u64, bit: u8, src: &'static str) -> Result<u64, FieldError> {
    if bit >= 64 {
        return Err(FieldError::BadIndex { src, idx: u16::from(bit) });
    }
    Ok((map >> bit) & 1)
}

fn eval_src(
    ctx: &EvalCtx<'_>,
    src: &FieldSrc,
    bits: usize,
    is_key: bool,
) -> Result<FieldValue, FieldError> {
    use FieldSrc::*;

    let val = match src {
        Zero => FieldValue::from_int(bits, 0),

        Ones => FieldValue {
            bytes: vec![0xff; bits.div_ceil(8)],
            bits,
            int: Some(1),
            emit: FieldEmit::Low,
        },

        Const(v) => FieldValue::from_bytes(bits, v.clone()),

        CompField(idx) => FieldValue::from_int(bits, ctx.comp_field(*idx)?),

        RegFile(idx) => {
            let v = ctx.regfile.read(*idx).map_err(|_| {
                FieldError::BadIndex { src: "regfile", idx: *idx }
            })?;
            FieldValue::from_int(bits, v)
        }

        GlbRegFile(idx) => {
            let e = ctx.glb.read(ctx.dir, *idx).map_err(|_| {
                FieldError::BadIndex { src: "glb_regfile", idx: *idx }
            })?;
            FieldValue::from_int(bits, e.val)
        }

        ActProp(idx) => {
            let prop = ctx.act_prop(*idx)?;
            if bits > prop.len() * 8 {
                return Err(FieldError::Oversize {
                    src: "act_prop",
                    bits,
                    max: prop.len() * 8,
                });
            }
            FieldValue::from_bytes(bits, prop.to_vec())
        }

        ActPropSized { prop, size_prop } => {
            let size = be_to_u64(ctx.act_prop(*size_prop)?).map_err(|_| {
                FieldError::Oversize { src: "act_prop_size", bits: 0, max: 64 }
            })?;
            let p = ctx.act_prop(*prop)?;
            let nbits = usize::try_from(size)
                .ok()
                .and_then(|s| s.checked_mul(8))
                .filter(|n| *n <= p.len() * 8)
                .ok_or(FieldError::Oversize {
                    src: "act_prop_sized",
                    bits: size as usize,
                    max: p.len() * 8,
                })?;

            FieldValue {
                bytes: p.to_vec(),
                bits: nbits,
                int: None,
                emit: FieldEmit::Leading,
            }
        }

        HdrField(idx) => {
            let v = ctx.hdr_field(*idx, is_key)?;
            if v.is_empty() {
                FieldValue::from_int(bits, 0)
            } else {
                FieldValue::from_bytes(bits, v.to_vec())
            }
        }

        SubHdrField { field, offset } => {
            let v = ctx.hdr_field(*field, is_key)?;
            if v.is_empty() {
                FieldValue::from_int(bits, 0)
            } else {
                let off = usize::from(*offset);
                if off + bits > v.len() * 8 {
                    return Err(FieldError::Oversize {
                        src: "sub_hdr_field",
                        bits: off + bits,
                        max: v.len() * 8,
                    });
                }
                FieldValue::from_bytes(bits, extract_bits(v, off, bits))
            }
        }

        EncField(idx) => {
            let v = ctx
                .flow
                .enc_fields
                .get(usize::from(*idx))
                .ok_or(FieldError::BadIndex { src: "enc_field", idx: *idx })?;
            FieldValue::from_bytes(bits, v.clone())
        }

        HdrBit(b) => FieldValue::from_int(
            bits,
            bitmap_bit(ctx.flow.hdr_bitmap, *b, "hdr_bit")?,
        ),

        ActBit(b) => FieldValue::from_int(
            bits,
            bitmap_bit(ctx.act.act_bitmap, *b, "act_bit")?,
        ),

        FieldBit(b) => FieldValue::from_int(
            bits,
            bitmap_bit(ctx.flow.fld_bitmap, *b, "field_bit")?,
        ),

        EncHdrBit(b) => FieldValue::from_int(
            bits,
            bitmap_bit(ctx.flow.enc_hdr_bitmap, *b, "enc_hdr_bit")?,
        ),

        PortTable(attr) => {
            let port = ctx.comp_field(CF_IDX_DEV_PORT_ID)?;
            let v = ctx
                .ports
                .port_attr(port, *attr)
                .ok_or(FieldError::MissingPortAttr { port, attr: *attr })?;
            FieldValue::from_int(bits, v)
        }

        Skip => FieldValue::nothing(),

        Reject => return Err(FieldError::Rejected),
    };

    Ok(val)
}

fn int_of(v: &FieldValue) -> Result<u64, FieldError> {
    v.int.ok_or(FieldError::Oversize {
        src: "operand",
        bits: v.bytes.len() * 8,
        max: 64,
    })
}

/// Evaluate a field descriptor.
///
/// For the select opcode only the chosen branch is evaluated, so a
/// `Reject` source in the untaken branch never fires.
pub fn evaluate(
    ctx: &EvalCtx<'_>,
    fld: &FieldInfo,
    is_key: bool,
) -> Result<FieldValue, FieldError> {
    let bits = usize::from(fld.bit_size);
    let src = |s: &FieldSrc| eval_src(ctx, s, bits, is_key);
    let two = |op: fn(u64, u64) -> u64| -> Result<FieldValue, FieldError> {
        let a = int_of(&src(&fld.src1)?)?;
        let b = int_of(&src(&fld.src2)?)?;
        Ok(FieldValue::from_int(bits, op(a, b)))
    };
    let three =
        |op: fn(u64, u64, u64) -> u64| -> Result<FieldValue, FieldError> {
            let a = int_of(&src(&fld.src1)?)?;
            let b = int_of(&src(&fld.src2)?)?;
            let c = int_of(&src(&fld.src3)?)?;
            Ok(FieldValue::from_int(bits, op(a, b, c)))
        };

    match fld.opcode {
        FieldOpc::Skip => Ok(FieldValue::nothing()),
        FieldOpc::Src1 => src(&fld.src1),
        FieldOpc::Src1PlusSrc2 => two(|a, b| a.wrapping_add(b)),
        FieldOpc::Src1MinusSrc2 => two(|a, b| a.wrapping_sub(b)),
        FieldOpc::Src1AndSrc2 => two(|a, b| a & b),
        FieldOpc::Src1OrSrc2 => two(|a, b| a | b),
        FieldOpc::Src1OrSrc2OrSrc3 => three(|a, b, c| a | b | c),
        FieldOpc::Src1AndSrc2OrSrc3 => three(|a, b, c| (a & b) | c),
        FieldOpc::Src1ThenSrc2ElseSrc3 => {
            if src(&fld.src1)?.is_nonzero() {
                src(&fld.src2)
            } else {
                src(&fld.src3)
            }
        }
    }
}

/// Evaluate `fld` and append it to `blob`.
pub fn write(
    ctx: &EvalCtx<'_>,
    fld: &FieldInfo,
    is_key: bool,
    blob: &mut Blob,
) -> Result<(), FieldError> {
    let val = evaluate(ctx, fld, is_key)?;

    match val.emit {
        FieldEmit::Nothing => Ok(()),
        FieldEmit::Low => Ok(blob.push(usize::from(fld.bit_size), &val.bytes)?),
        FieldEmit::Leading => Ok(blob.push_left(val.bits, &val.bytes)?),
    }
}

/// Write a list of fields in order.
pub fn write_all(
    ctx: &EvalCtx<'_>,
    flds: &[FieldInfo],
    is_key: bool,
    blob: &mut Blob,
) -> Result<(), (usize, FieldError)> {
    for (i, fld) in flds.iter().enumerate() {
        write(ctx, fld, is_key, blob).map_err(|e| (i, e))?;
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::engine::blob::ByteOrder;
    use crate::engine::flow_info::HdrField;

    struct OnePort;

    impl PortDb for OnePort {
        fn port_attr(&self, port_id: u64, attr: PortAttr) -> Option<u64> {
            match (port_id, attr) {
                (3, PortAttr::Svif) => Some(0x42),
                _ => None,
            }
        }
    }

    struct Fixture {
        flow: ParsedFlow,
        act: ActionParams,
        regfile: RegFile,
        glb: GlobalRegFile,
    }

    impl Fixture {
        fn new() -> Self {
            let flow = ParsedFlow {
                hdr_fields: vec![
                    HdrField::exact(vec![0x0a, 0x00, 0x00, 0x01]),
                    HdrField::default(),
                    HdrField::new(vec![0x12, 0x34], vec![0xff, 0x00]),
                ],
                enc_fields: vec![vec![0x00, 0x00, 0x12, 0xb5]],
                comp_fields: vec![0x77, 3],
                hdr_bitmap: 0b101,
                fld_bitmap: 0b10,
                enc_hdr_bitmap: 0,
            };
            let act = ActionParams {
                act_bitmap: 1 << 4,
                act_props: vec![
                    vec![0xde, 0xad, 0xbe, 0xef],
                    vec![0x02],
                    vec![0x00, 0x10],
                ],
            };
            let mut regfile = RegFile::new();
            regfile.write(9, 100).unwrap();
            Self { flow, act, regfile, glb: GlobalRegFile::new() }
        }

        fn ctx(&self) -> EvalCtx<'_> {
            EvalCtx {
                dir: Direction::In,
                flow: &self.flow,
                act: &self.act,
                regfile: &self.regfile,
                glb: &self.glb,
                ports: &OnePort,
            }
        }
    }

    fn blob_of(ctx: &EvalCtx<'_>, fld: &FieldInfo, is_key: bool) -> Blob {
        let mut b = Blob::new(256, ByteOrder::Big);
        write(ctx, fld, is_key, &mut b).unwrap();
        b
    }

    #[test]
    fn copy_sources() {
        let fx = Fixture::new();
        let ctx = fx.ctx();

        let ip = FieldInfo::new("dst ip", 32, FieldSrc::HdrField(0));
        assert_eq!(blob_of(&ctx, &ip, true).data(), &[0x0a, 0, 0, 1]);
        assert_eq!(blob_of(&ctx, &ip, false).data(), &[0xff; 4]);

        let port = FieldInfo::new("port", 16, FieldSrc::HdrField(2));
        assert_eq!(blob_of(&ctx, &port, false).data(), &[0xff, 0x00]);

        let rf = FieldInfo::new("rf", 12, FieldSrc::RegFile(9));
        assert_eq!(evaluate(&ctx, &rf, true).unwrap().int, Some(100));

        let vni = FieldInfo::new("vni", 24, FieldSrc::EncField(0));
        assert_eq!(blob_of(&ctx, &vni, true).data(), &[0x00, 0x12, 0xb5]);

        let bit = FieldInfo::new("act bit", 1, FieldSrc::ActBit(4));
        assert_eq!(evaluate(&ctx, &bit, true).unwrap().int, Some(1));
        let bit = FieldInfo::new("hdr bit", 1, FieldSrc::HdrBit(1));
        assert_eq!(evaluate(&ctx, &bit, true).unwrap().int, Some(0));

        let ones = FieldInfo::new("ones", 4, FieldSrc::Ones);
        assert_eq!(blob_of(&ctx, &ones, true).data(), &[0xf0]);
    }

    #[test]
    fn undefined_header_field_is_zero() {
        let fx = Fixture::new();
        let ctx = fx.ctx();
        let fld = FieldInfo::new("absent", 16, FieldSrc::HdrField(1));
        let b = blob_of(&ctx, &fld, true);
        assert_eq!(b.bit_len(), 16);
        assert_eq!(b.data(), &[0, 0]);
    }

    #[test]
    fn sub_header_field() {
        let fx = Fixture::new();
        let ctx = fx.ctx();
        let fld = FieldInfo::new(
            "nibble",
            8,
            FieldSrc::SubHdrField { field: 2, offset: 4 },
        );
        assert_eq!(evaluate(&ctx, &fld, true).unwrap().int, Some(0x23));

        let fld = FieldInfo::new(
            "past end",
            16,
            FieldSrc::SubHdrField { field: 2, offset: 4 },
        );
        assert_eq!(
            evaluate(&ctx, &fld, true),
            Err(FieldError::Oversize {
                src: "sub_hdr_field",
                bits: 20,
                max: 16
            })
        );
    }

    #[test]
    fn sized_action_property_is_left_aligned() {
        let fx = Fixture::new();
        let ctx = fx.ctx();
        // Property 1 says property 0 is 2 bytes long.
        let fld = FieldInfo::new(
            "encap",
            64,
            FieldSrc::ActPropSized { prop: 0, size_prop: 1 },
        );
        let b = blob_of(&ctx, &fld, true);
        assert_eq!(b.bit_len(), 16);
        assert_eq!(b.data(), &[0xde, 0xad]);

        // Property 2 claims 16 bytes, longer than property 0.
        let fld = FieldInfo::new(
            "encap",
            64,
            FieldSrc::ActPropSized { prop: 0, size_prop: 2 },
        );
        assert!(matches!(
            evaluate(&ctx, &fld, true),
            Err(FieldError::Oversize { .. })
        ));
    }

    #[test]
    fn arithmetic_opcodes() {
        let fx = Fixture::new();
        let ctx = fx.ctx();

        let add = FieldInfo::with_op(
            "add",
            16,
            FieldOpc::Src1PlusSrc2,
            [FieldSrc::RegFile(9), FieldSrc::Const(vec![0x01]), FieldSrc::Zero],
        );
        assert_eq!(evaluate(&ctx, &add, true).unwrap().int, Some(101));
        assert_eq!(blob_of(&ctx, &add, true).data(), &[0x00, 0x65]);

        let sub = FieldInfo::with_op(
            "sub",
            8,
            FieldOpc::Src1MinusSrc2,
            [
                FieldSrc::CompField(0),
                FieldSrc::Const(vec![0x07]),
                FieldSrc::Zero,
            ],
        );
        assert_eq!(evaluate(&ctx, &sub, true).unwrap().int, Some(0x70));

        let and_or = FieldInfo::with_op(
            "and-or",
            8,
            FieldOpc::Src1AndSrc2OrSrc3,
            [
                FieldSrc::Const(vec![0xf0]),
                FieldSrc::Const(vec![0x3c]),
                FieldSrc::Const(vec![0x01]),
            ],
        );
        assert_eq!(evaluate(&ctx, &and_or, true).unwrap().int, Some(0x31));

        let or_or = FieldInfo::with_op(
            "or-or",
            8,
            FieldOpc::Src1OrSrc2OrSrc3,
            [
                FieldSrc::Const(vec![0x01]),
                FieldSrc::Const(vec![0x02]),
                FieldSrc::Const(vec![0x04]),
            ],
        );
        assert_eq!(evaluate(&ctx, &or_or, true).unwrap().int, Some(0x07));

        // A 128-bit operand cannot take part in arithmetic.
        let wide = FieldInfo::with_op(
            "wide",
            8,
            FieldOpc::Src1OrSrc2,
            [FieldSrc::Const(vec![0; 16]), FieldSrc::Zero, FieldSrc::Zero],
        );
        assert!(matches!(
            evaluate(&ctx, &wide, true),
            Err(FieldError::Oversize { .. })
        ));
    }

    #[test]
    fn select_evaluates_only_the_chosen_branch() {
        let fx = Fixture::new();
        let ctx = fx.ctx();

        let sel = FieldInfo::with_op(
            "sel",
            8,
            FieldOpc::Src1ThenSrc2ElseSrc3,
            [
                FieldSrc::ActBit(4),
                FieldSrc::Const(vec![0xaa]),
                FieldSrc::Reject,
            ],
        );
        assert_eq!(evaluate(&ctx, &sel, true).unwrap().int, Some(0xaa));

        let sel = FieldInfo::with_op(
            "sel",
            8,
            FieldOpc::Src1ThenSrc2ElseSrc3,
            [
                FieldSrc::ActBit(5),
                FieldSrc::Reject,
                FieldSrc::Const(vec![0xbb]),
            ],
        );
        assert_eq!(evaluate(&ctx, &sel, true).unwrap().int, Some(0xbb));
    }

    #[test]
    fn skip_writes_nothing() {
        let fx = Fixture::new();
        let ctx = fx.ctx();
        let fld = FieldInfo::new("skip", 32, FieldSrc::Skip);
        assert_eq!(blob_of(&ctx, &fld, true).bit_len(), 0);

        let mut fld = FieldInfo::new("skip op", 32, FieldSrc::Reject);
        fld.opcode = FieldOpc::Skip;
        assert_eq!(blob_of(&ctx, &fld, true).bit_len(), 0);
    }

    #[test]
    fn port_table_lookup() {
        let mut fx = Fixture::new();
        let fld =
            FieldInfo::new("svif", 16, FieldSrc::PortTable(PortAttr::Svif));
        assert_eq!(evaluate(&fx.ctx(), &fld, true).unwrap().int, Some(0x42));

        fx.flow.comp_fields[1] = 4;
        assert_eq!(
            evaluate(&fx.ctx(), &fld, true),
            Err(FieldError::MissingPortAttr { port: 4, attr: PortAttr::Svif })
        );
    }

    #[test]
    fn errors_write_nothing() {
        let fx = Fixture::new();
        let ctx = fx.ctx();
        let mut b = Blob::new(64, ByteOrder::Big);
        b.push_u64(8, 0xff).unwrap();

        for src in [
            FieldSrc::Reject,
            FieldSrc::CompField(40),
            FieldSrc::ActProp(9),
            FieldSrc::RegFile(1000),
            FieldSrc::HdrBit(64),
        ] {
            let fld = FieldInfo::new("bad", 8, src);
            assert!(write(&ctx, &fld, true, &mut b).is_err());
            assert_eq!(b.bit_len(), 8);
        }

        // Overflowing the blob is also all-or-nothing.
        let fld = FieldInfo::new("big", 64, FieldSrc::Zero);
        assert_eq!(
            write(&ctx, &fld, true, &mut b),
            Err(FieldError::Blob(BlobError::Overflow { cap: 64, need: 72 }))
        );
        assert_eq!(b.bit_len(), 8);
    }

    #[test]
    fn evaluation_is_deterministic() {
        let fx = Fixture::new();
        let ctx = fx.ctx();
        let fld = FieldInfo::with_op(
            "mix",
            32,
            FieldOpc::Src1AndSrc2OrSrc3,
            [FieldSrc::HdrField(0), FieldSrc::ActProp(0), FieldSrc::RegFile(9)],
        );
        let a = evaluate(&ctx, &fld, true).unwrap();
        let b = evaluate(&ctx, &fld, true).unwrap();
        assert_eq!(a, b);
        assert_eq!(blob_of(&ctx, &fld, true), blob_of(&ctx, &fld, true));
    }
}
