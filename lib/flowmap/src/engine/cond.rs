// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Conditional and control-transfer logic between table steps.

use super::field::EvalCtx;
use super::field::FieldError;
use super::flow_info::CF_IDX_FLOW_SIG_ID;
use super::regfile::RF_IDX_FLOW_SIG_ID;
use super::regfile::RF_IDX_GENERIC_TBL_MISS;
use super::regfile::RegFile;
use super::regfile::RegFileError;
use crate::d_error::DError;
use alloc::vec::Vec;
use serde::Deserialize;
use serde::Serialize;

#[derive(Clone, Copy, Debug, DError, Eq, PartialEq)]
pub enum CondError {
    Field(FieldError),
    RegFile(RegFileError),
    /// A goto produced a step before the first one, or one past any
    /// addressable step.
    InvalidGoto { step: usize, delta: i64 },
}

impl From<FieldError> for CondError {
    fn from(e: FieldError) -> Self {
        Self::Field(e)
    }
}

impl From<RegFileError> for CondError {
    fn from(e: RegFileError) -> Self {
        Self::RegFile(e)
    }
}

/// A single predicate over the flow, its actions and the registers.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum Cond {
    CfIsSet(u16),
    CfNotSet(u16),
    RfIsSet(u16),
    RfNotSet(u16),
    ActBitIsSet(u8),
    ActBitNotSet(u8),
    HdrBitIsSet(u8),
    HdrBitNotSet(u8),
    FieldBitIsSet(u8),
    FieldBitNotSet(u8),
    EncHdrBitIsSet(u8),
    EncHdrBitNotSet(u8),
    /// The flow signature computed field equals the value.
    FlowSigMatch(u64),
    /// Every bit of the pattern is set in the action bitmap.
    ActPatMatch(u64),
    /// Every bit of the pattern is set in the header bitmap.
    HdrPatMatch(u64),
}

fn bit_set(map: u64, bit: u8) -> Result<bool, CondError> {
    if bit >= 64 {
        return Err(CondError::Field(FieldError::BadIndex {
            src: "bitmap",
            idx: u16::from(bit),
        }));
    }
    Ok(map & (1 << bit) != 0)
}

impl Cond {
    pub fn eval(&self, ctx: &EvalCtx<'_>) -> Result<bool, CondError> {
        use Cond::*;

        let res = match self {
            CfIsSet(idx) => ctx.comp_field(*idx)? != 0,
            CfNotSet(idx) => ctx.comp_field(*idx)? == 0,
            RfIsSet(idx) => ctx.regfile.read(*idx)? != 0,
            RfNotSet(idx) => ctx.regfile.read(*idx)? == 0,
            ActBitIsSet(b) => bit_set(ctx.act.act_bitmap, *b)?,
            ActBitNotSet(b) => !bit_set(ctx.act.act_bitmap, *b)?,
            HdrBitIsSet(b) => bit_set(ctx.flow.hdr_bitmap, *b)?,
            HdrBitNotSet(b) => !bit_set(ctx.flow.hdr_bitmap, *b)?,
            FieldBitIsSet(b) => bit_set(ctx.flow.fld_bitmap, *b)?,
            FieldBitNotSet(b) => !bit_set(ctx.flow.fld_bitmap, *b)?,
            EncHdrBitIsSet(b) => bit_set(ctx.flow.enc_hdr_bitmap, *b)?,
            EncHdrBitNotSet(b) => !bit_set(ctx.flow.enc_hdr_bitmap, *b)?,
            FlowSigMatch(sig) => ctx.comp_field(CF_IDX_FLOW_SIG_ID)? == *sig,
            ActPatMatch(pat) => ctx.act.act_bitmap & pat == *pat,
            HdrPatMatch(pat) => ctx.flow.hdr_bitmap & pat == *pat,
        };

        Ok(res)
    }
}

#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq, Serialize,
)]
pub enum CondListOpc {
    #[default]
    True,
    False,
    /// All of `conds` hold.
    And,
    /// Any of `conds` holds.
    Or,
    /// All of the `nested` lists hold.
    ListAnd,
    /// Any of the `nested` lists holds.
    ListOr,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct CondList {
    #[serde(default)]
    pub opcode: CondListOpc,
    #[serde(default)]
    pub conds: Vec<Cond>,
    #[serde(default)]
    pub nested: Vec<CondList>,
}

impl CondList {
    pub fn always() -> Self {
        Self::default()
    }

    pub fn never() -> Self {
        Self { opcode: CondListOpc::False, ..Default::default() }
    }

    pub fn all(conds: Vec<Cond>) -> Self {
        Self { opcode: CondListOpc::And, conds, nested: Vec::new() }
    }

    pub fn any(conds: Vec<Cond>) -> Self {
        Self { opcode: CondListOpc::Or, conds, nested: Vec::new() }
    }

    /// Evaluate the list. Evaluation stops at the first condition
    /// deciding the outcome.
    pub fn eval(&self, ctx: &EvalCtx<'_>) -> Result<bool, CondError> {
        match self.opcode {
            CondListOpc::True => Ok(true),
            CondListOpc::False => Ok(false),

            CondListOpc::And => {
                for c in &self.conds {
                    if !c.eval(ctx)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }

            CondListOpc::Or => {
                for c in &self.conds {
                    if c.eval(ctx)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }

            CondListOpc::ListAnd => {
                for l in &self.nested {
                    if !l.eval(ctx)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }

            CondListOpc::ListOr => {
                for l in &self.nested {
                    if l.eval(ctx)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
        }
    }
}

#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq, Serialize,
)]
pub enum FuncOpc {
    #[default]
    Nop,
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    CopySrc1,
    Add,
    Sub,
    BitAnd,
    BitOr,
    Shl,
    Shr,
}

#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq, Serialize,
)]
pub enum FuncSrc {
    #[default]
    None,
    Const(u64),
    RegFile(u16),
    CompField(u16),
    GlbRegFile(u16),
}

/// A computation run before a step's execute list, its result stored
/// into local register `dst`.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct FuncInfo {
    pub opc: FuncOpc,
    #[serde(default)]
    pub src1: FuncSrc,
    #[serde(default)]
    pub src2: FuncSrc,
    #[serde(default)]
    pub dst: u16,
}

impl FuncSrc {
    fn val(&self, ctx: &EvalCtx<'_>) -> Result<u64, CondError> {
        match self {
            Self::None => Ok(0),
            Self::Const(v) => Ok(*v),
            Self::RegFile(idx) => Ok(ctx.regfile.read(*idx)?),
            Self::CompField(idx) => Ok(ctx.comp_field(*idx)?),
            Self::GlbRegFile(idx) => Ok(ctx.glb.read(ctx.dir, *idx)?.val),
        }
    }
}

impl FuncInfo {
    /// Compute the function's result. `None` for `Nop`.
    pub fn eval(&self, ctx: &EvalCtx<'_>) -> Result<Option<u64>, CondError> {
        if self.opc == FuncOpc::Nop {
            return Ok(None);
        }

        let a = self.src1.val(ctx)?;
        let b = self.src2.val(ctx)?;
        let shift = u32::try_from(b).unwrap_or(u32::MAX);

        let res = match self.opc {
            FuncOpc::Nop => return Ok(None),
            FuncOpc::Eq => u64::from(a == b),
            FuncOpc::Ne => u64::from(a != b),
            FuncOpc::Gt => u64::from(a > b),
            FuncOpc::Ge => u64::from(a >= b),
            FuncOpc::Lt => u64::from(a < b),
            FuncOpc::Le => u64::from(a <= b),
            FuncOpc::CopySrc1 => a,
            FuncOpc::Add => a.wrapping_add(b),
            FuncOpc::Sub => a.wrapping_sub(b),
            FuncOpc::BitAnd => a & b,
            FuncOpc::BitOr => a | b,
            FuncOpc::Shl => a.checked_shl(shift).unwrap_or(0),
            FuncOpc::Shr => a.checked_shr(shift).unwrap_or(0),
        };

        Ok(Some(res))
    }
}

/// Selects the step following the current one.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum Goto {
    /// Relative jump. Zero ends the template.
    Rel(i32),
    /// Reject the flow.
    Reject,
    /// Relative jump by the signed value held in a register.
    RegFile(u16),
}

impl Default for Goto {
    fn default() -> Self {
        Goto::Rel(1)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NextStep {
    Done,
    Reject,
    Step(usize),
}

impl Goto {
    /// Resolve this goto from step `cur` of a template of `len` steps.
    pub fn resolve(
        &self,
        cur: usize,
        len: usize,
        regfile: &RegFile,
    ) -> Result<NextStep, CondError> {
        let delta = match self {
            Goto::Reject => return Ok(NextStep::Reject),
            Goto::Rel(d) => i64::from(*d),
            Goto::RegFile(idx) => regfile.read(*idx)? as i64,
        };

        if delta == 0 {
            return Ok(NextStep::Done);
        }

        let invalid = CondError::InvalidGoto { step: cur, delta };
        let next = i64::try_from(cur)
            .ok()
            .and_then(|cur| cur.checked_add(delta))
            .filter(|next| *next >= 0)
            .and_then(|next| usize::try_from(next).ok())
            .ok_or(invalid)?;

        if next >= len { Ok(NextStep::Done) } else { Ok(NextStep::Step(next)) }
    }
}

/// The post-write acceptance test of a step.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq, Serialize,
)]
pub enum AcceptOpc {
    #[default]
    Always,
    /// Accept only if the flow's signature matches the one stored in
    /// [`RF_IDX_FLOW_SIG_ID`]. A generic table step which recorded a
    /// miss accepts without comparing.
    FlowSigIdMatch,
}

impl AcceptOpc {
    pub fn accept(
        &self,
        ctx: &EvalCtx<'_>,
        is_generic: bool,
    ) -> Result<bool, CondError> {
        match self {
            AcceptOpc::Always => Ok(true),
            AcceptOpc::FlowSigIdMatch => {
                if is_generic && ctx.regfile.read(RF_IDX_GENERIC_TBL_MISS)? != 0
                {
                    return Ok(true);
                }

                let stored = ctx.regfile.read(RF_IDX_FLOW_SIG_ID)?;
                Ok(ctx.comp_field(CF_IDX_FLOW_SIG_ID)? == stored)
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::engine::Direction;
    use crate::engine::collab::PortAttr;
    use crate::engine::collab::PortDb;
    use crate::engine::flow_info::ActionParams;
    use crate::engine::flow_info::ParsedFlow;
    use crate::engine::regfile::GlobalRegFile;

    struct NoPorts;

    impl PortDb for NoPorts {
        fn port_attr(&self, _: u64, _: PortAttr) -> Option<u64> {
            None
        }
    }

    fn with_ctx<R>(rf: &RegFile, f: impl FnOnce(&EvalCtx<'_>) -> R) -> R {
        let flow = ParsedFlow {
            comp_fields: vec![0xabcd, 1, 0],
            hdr_bitmap: 0b0110,
            fld_bitmap: 0b1,
            ..Default::default()
        };
        let act = ActionParams { act_bitmap: 0b1010, act_props: vec![] };
        let glb = GlobalRegFile::new();
        let ctx = EvalCtx {
            dir: Direction::Out,
            flow: &flow,
            act: &act,
            regfile: rf,
            glb: &glb,
            ports: &NoPorts,
        };
        f(&ctx)
    }

    #[test]
    fn cond_list_opcodes() {
        let rf = RegFile::new();
        with_ctx(&rf, |ctx| {
            assert!(CondList::always().eval(ctx).unwrap());
            assert!(!CondList::never().eval(ctx).unwrap());

            let l = CondList::all(vec![
                Cond::HdrBitIsSet(1),
                Cond::ActPatMatch(0b1000),
                Cond::CfNotSet(2),
            ]);
            assert!(l.eval(ctx).unwrap());

            let l =
                CondList::all(vec![Cond::HdrBitIsSet(1), Cond::HdrBitIsSet(0)]);
            assert!(!l.eval(ctx).unwrap());

            let l = CondList::any(vec![
                Cond::HdrBitIsSet(0),
                Cond::FlowSigMatch(0xabcd),
            ]);
            assert!(l.eval(ctx).unwrap());
            assert!(!CondList::any(vec![]).eval(ctx).unwrap());

            let l = CondList {
                opcode: CondListOpc::ListOr,
                conds: vec![],
                nested: vec![
                    CondList::never(),
                    CondList::all(vec![Cond::FieldBitIsSet(0)]),
                ],
            };
            assert!(l.eval(ctx).unwrap());

            let l = CondList {
                opcode: CondListOpc::ListAnd,
                conds: vec![],
                nested: vec![
                    CondList::always(),
                    CondList::any(vec![Cond::HdrPatMatch(0b1110)]),
                ],
            };
            assert!(!l.eval(ctx).unwrap());
        });
    }

    #[test]
    fn short_circuit_skips_bad_conditions() {
        let rf = RegFile::new();
        with_ctx(&rf, |ctx| {
            // The bad index is never reached.
            let l =
                CondList::any(vec![Cond::ActBitIsSet(1), Cond::CfIsSet(99)]);
            assert!(l.eval(ctx).unwrap());

            let l =
                CondList::all(vec![Cond::ActBitIsSet(1), Cond::CfIsSet(99)]);
            assert!(l.eval(ctx).is_err());
        });
    }

    #[test]
    fn functions() {
        let mut rf = RegFile::new();
        rf.write(4, 10).unwrap();
        with_ctx(&rf, |ctx| {
            let f = FuncInfo {
                opc: FuncOpc::Gt,
                src1: FuncSrc::RegFile(4),
                src2: FuncSrc::Const(3),
                dst: 7,
            };
            assert_eq!(f.eval(ctx).unwrap(), Some(1));

            let f = FuncInfo {
                opc: FuncOpc::Shl,
                src1: FuncSrc::CompField(1),
                src2: FuncSrc::Const(200),
                dst: 7,
            };
            assert_eq!(f.eval(ctx).unwrap(), Some(0));

            let f = FuncInfo {
                opc: FuncOpc::Sub,
                src1: FuncSrc::Const(1),
                src2: FuncSrc::RegFile(4),
                dst: 7,
            };
            assert_eq!(f.eval(ctx).unwrap(), Some(1u64.wrapping_sub(10)));

            assert_eq!(FuncInfo::default().eval(ctx).unwrap(), None);
        });
    }

    #[test]
    fn goto_resolution() {
        let mut rf = RegFile::new();
        rf.write(3, (-2i64) as u64).unwrap();
        rf.write(4, (-9i64) as u64).unwrap();

        assert_eq!(Goto::Rel(1).resolve(0, 3, &rf), Ok(NextStep::Step(1)));
        assert_eq!(Goto::Rel(0).resolve(1, 3, &rf), Ok(NextStep::Done));
        assert_eq!(Goto::Rel(5).resolve(1, 3, &rf), Ok(NextStep::Done));
        assert_eq!(Goto::Reject.resolve(1, 3, &rf), Ok(NextStep::Reject));
        assert_eq!(Goto::RegFile(3).resolve(2, 3, &rf), Ok(NextStep::Step(0)));
        assert_eq!(
            Goto::RegFile(4).resolve(2, 3, &rf),
            Err(CondError::InvalidGoto { step: 2, delta: -9 })
        );
        assert_eq!(
            Goto::Rel(-1).resolve(0, 3, &rf),
            Err(CondError::InvalidGoto { step: 0, delta: -1 })
        );

        // A register may hold any offset at all.
        rf.write(5, i64::MAX as u64).unwrap();
        rf.write(6, i64::MIN as u64).unwrap();
        assert_eq!(
            Goto::RegFile(5).resolve(3, 10, &rf),
            Err(CondError::InvalidGoto { step: 3, delta: i64::MAX })
        );
        assert_eq!(
            Goto::RegFile(6).resolve(3, 10, &rf),
            Err(CondError::InvalidGoto { step: 3, delta: i64::MIN })
        );
    }

    #[test]
    fn accept_flow_signature() {
        let mut rf = RegFile::new();
        rf.write(RF_IDX_FLOW_SIG_ID, 0x1234).unwrap();
        with_ctx(&rf, |ctx| {
            assert!(AcceptOpc::Always.accept(ctx, false).unwrap());
            assert!(!AcceptOpc::FlowSigIdMatch.accept(ctx, false).unwrap());
            assert!(!AcceptOpc::FlowSigIdMatch.accept(ctx, true).unwrap());
        });

        rf.write(RF_IDX_GENERIC_TBL_MISS, 1).unwrap();
        with_ctx(&rf, |ctx| {
            assert!(AcceptOpc::FlowSigIdMatch.accept(ctx, true).unwrap());
        });

        rf.write(RF_IDX_FLOW_SIG_ID, 0xabcd).unwrap();
        with_ctx(&rf, |ctx| {
            assert!(AcceptOpc::FlowSigIdMatch.accept(ctx, false).unwrap());
        });
    }
}
