// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The template database.
//!
//! A template is an ordered list of table steps which together program
//! one flow into the hardware. Class templates program the match side
//! of a flow and action templates its result side. The database is
//! plain configuration data; tooling loads it from RON.

use super::Direction;
use super::cond::AcceptOpc;
use super::cond::CondList;
use super::cond::FuncInfo;
use super::cond::Goto;
use super::field::FieldInfo;
use super::gen_tbl::GenTblParams;
use super::regfile::GLB_REGFILE_ENTRIES;
use super::regfile::REGFILE_ENTRIES;
use crate::api::MapperError;
use crate::api::ResourceFunc;
use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;
use core::fmt::Display;
use itertools::Itertools;
use serde::Deserialize;
use serde::Serialize;

/// The index table subtype whose entries are flow counters.
pub const INDEX_SUBTYPE_COUNTER: u32 = 1;

/// A table type available to a dynamically sized index step.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct SizeClass {
    pub res_type: u32,
    pub bits: u16,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct DynGroup {
    pub id: u16,
    /// Ordered from smallest to largest.
    pub classes: Vec<SizeClass>,
}

impl DynGroup {
    /// The smallest class able to hold `bits`.
    pub fn fit(&self, bits: usize) -> Option<SizeClass> {
        self.classes
            .iter()
            .filter(|c| usize::from(c.bits) >= bits)
            .min_by_key(|c| c.bits)
            .copied()
    }
}

/// Layout properties of the classification hardware.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct DeviceParams {
    /// Wildcard match keys are split into control-word-prefixed
    /// slices.
    pub wc_dynamic_pad: bool,
    pub wc_slice_bits: u16,
    pub wc_ctrl_bits: u16,
    /// Exact-match keys are merged into the record.
    pub em_dynamic_pad: bool,
    pub em_blk_size_bits: u16,
    pub em_blk_align_bits: u16,
    pub em_key_align_bytes: u16,
    /// Index tables are sized from the result.
    pub dynamic_sram: bool,
    pub dyn_groups: Vec<DynGroup>,
}

impl DeviceParams {
    pub fn dyn_group(&self, id: u16) -> Option<&DynGroup> {
        self.dyn_groups.iter().find(|g| g.id == id)
    }
}

/// How a step records what it allocated.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq, Serialize,
)]
pub enum FdbOpc {
    #[default]
    Nop,
    /// Against the flow being created.
    PushFid,
    /// Against the RID flow held in a local register.
    PushRidRegFile(u16),
    /// Allocate a RID flow into a local register.
    AllocRidRegFile(u16),
}

#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq, Serialize,
)]
pub enum MarkOpc {
    #[default]
    Nop,
    /// When action bit `act_bit` is set, tag the entry's hardware
    /// flow id with the mark held in action property `mark_prop`.
    SetIfMarkAction { act_bit: u8, mark_prop: u16 },
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub enum TcamOpc {
    /// Allocate a row, allocating the step's identifiers.
    AllocIdent,
    /// Allocate a row and store it in the operand register.
    AllocWrRegFile,
    /// Write the row held in the operand register.
    WrRegFile,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub enum IndexOpc {
    Alloc,
    AllocWr,
    Wr,
    AllocWrGlb,
    WrGlb,
    Rd,
}

impl IndexOpc {
    pub fn allocates(&self) -> bool {
        matches!(self, Self::Alloc | Self::AllocWr | Self::AllocWrGlb)
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub enum IfOpc {
    /// Write at the index held in a computed field.
    WrCompField,
    WrRegFile,
    WrConst,
    RdCompField,
    RdRegFile,
    NotUsed,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub enum GenOpc {
    Read,
    Write,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum StepKind {
    Tcam {
        opc: TcamOpc,
        res_type: u32,
        tbl_operand: u16,
        key_bits: u16,
        result_bits: u16,
        #[serde(default)]
        wildcard: bool,
    },
    Em {
        res_type: u32,
        key_bits: u16,
        result_bits: u16,
        #[serde(default)]
        internal: bool,
    },
    Index {
        opc: IndexOpc,
        res_type: u32,
        tbl_operand: u16,
        result_bits: u16,
        #[serde(default)]
        dyn_group: Option<u16>,
        /// Entries are flow counters, recorded with subtype
        /// [`INDEX_SUBTYPE_COUNTER`].
        #[serde(default)]
        counter: bool,
    },
    IfTbl {
        opc: IfOpc,
        res_type: u32,
        /// A computed field, register or constant index, by opcode.
        tbl_operand: u64,
        result_bits: u16,
    },
    Generic {
        opc: GenOpc,
        subtype: u32,
        /// Where to find the in-flight RID the new entry adopts.
        #[serde(default)]
        rid_regfile: Option<u16>,
        #[serde(default)]
        return_handle: bool,
    },
    Ctrl,
}

impl StepKind {
    pub fn func(&self) -> ResourceFunc {
        match self {
            Self::Tcam { .. } => ResourceFunc::TcamTable,
            Self::Em { .. } => ResourceFunc::EmTable,
            Self::Index { .. } => ResourceFunc::IndexTable,
            Self::IfTbl { .. } => ResourceFunc::IfTable,
            Self::Generic { .. } => ResourceFunc::GenericTable,
            Self::Ctrl => ResourceFunc::CtrlTable,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct KeyField {
    pub spec: FieldInfo,
    /// Absent for an exact match on the whole field.
    #[serde(default)]
    pub mask: Option<FieldInfo>,
}

impl KeyField {
    pub fn exact(spec: FieldInfo) -> Self {
        Self { spec, mask: None }
    }
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct IdentInfo {
    pub description: String,
    pub ident_type: u32,
    pub regfile_idx: u16,
    /// Read mode: where the identifier sits in the read-back result.
    #[serde(default)]
    pub bit_pos: u16,
    #[serde(default)]
    pub bit_size: u16,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct TableStep {
    pub description: String,
    pub direction: Direction,
    pub kind: StepKind,
    #[serde(default)]
    pub critical: bool,
    #[serde(default)]
    pub fdb: FdbOpc,
    #[serde(default)]
    pub accept: AcceptOpc,
    #[serde(default = "CondList::always")]
    pub execute: CondList,
    #[serde(default)]
    pub true_goto: Goto,
    #[serde(default)]
    pub false_goto: Goto,
    #[serde(default)]
    pub func: FuncInfo,
    #[serde(default)]
    pub key_fields: Vec<KeyField>,
    #[serde(default)]
    pub result_fields: Vec<FieldInfo>,
    #[serde(default)]
    pub idents: Vec<IdentInfo>,
    #[serde(default)]
    pub mark: MarkOpc,
}

impl TableStep {
    /// A step with no fields which always runs and falls through.
    pub fn new(
        description: &str,
        direction: Direction,
        kind: StepKind,
    ) -> Self {
        Self {
            description: description.into(),
            direction,
            kind,
            critical: false,
            fdb: FdbOpc::Nop,
            accept: AcceptOpc::Always,
            execute: CondList::always(),
            true_goto: Goto::default(),
            false_goto: Goto::default(),
            func: FuncInfo::default(),
            key_fields: Vec::new(),
            result_fields: Vec::new(),
            idents: Vec::new(),
            mark: MarkOpc::Nop,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TemplateKind {
    Class,
    Action,
}

impl Display for TemplateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Class => write!(f, "class"),
            Self::Action => write!(f, "action"),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Template {
    pub tid: u32,
    pub name: String,
    /// A flow for which this list is true is rejected before any step
    /// runs.
    #[serde(default = "CondList::never")]
    pub reject: CondList,
    pub steps: Vec<TableStep>,
}

/// A global register value set up when the mapper is created.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct GlbResource {
    pub direction: Direction,
    pub func: ResourceFunc,
    pub res_type: u32,
    pub regfile_idx: u16,
    /// The value comes from a session-wide allocation made elsewhere
    /// and is carried in `value`.
    #[serde(default)]
    pub shared: bool,
    #[serde(default)]
    pub value: Option<u64>,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct TemplateDb {
    pub device: DeviceParams,
    pub class_templates: Vec<Template>,
    pub act_templates: Vec<Template>,
    pub gen_tables: Vec<GenTblParams>,
    pub glb_resources: Vec<GlbResource>,
}

fn invalid(msg: String) -> MapperError {
    MapperError::InvalidConfig(msg)
}

impl TemplateDb {
    pub fn template(&self, kind: TemplateKind, tid: u32) -> Option<&Template> {
        let list = match kind {
            TemplateKind::Class => &self.class_templates,
            TemplateKind::Action => &self.act_templates,
        };
        list.iter().find(|t| t.tid == tid)
    }

    /// Check everything about the database which does not depend on
    /// the flow being programmed.
    pub fn validate(&self) -> Result<(), MapperError> {
        let dev = &self.device;

        if dev.wc_dynamic_pad
            && (dev.wc_slice_bits == 0 || dev.wc_ctrl_bits >= dev.wc_slice_bits)
        {
            return Err(invalid("wildcard slice geometry".into()));
        }

        if dev.em_dynamic_pad && dev.em_blk_align_bits < dev.em_blk_size_bits {
            let msg = "exact-match block align below block size";
            return Err(invalid(msg.into()));
        }

        for g in &dev.dyn_groups {
            if g.classes.is_empty() {
                return Err(invalid(format!("dynamic group {} is empty", g.id)));
            }
        }

        for r in &self.glb_resources {
            if usize::from(r.regfile_idx) >= GLB_REGFILE_ENTRIES {
                return Err(invalid(format!(
                    "global register {} out of range",
                    r.regfile_idx
                )));
            }
            match (r.shared, r.value, r.func) {
                (true, Some(_), _) => (),
                (true, None, _) => {
                    return Err(invalid(format!(
                        "shared global register {} has no value",
                        r.regfile_idx
                    )));
                }
                (
                    false,
                    _,
                    ResourceFunc::Identifier | ResourceFunc::IndexTable,
                ) => (),
                (false, _, func) => {
                    return Err(invalid(format!(
                        "cannot allocate global {func} resource"
                    )));
                }
            }
        }

        for (kind, list) in [
            (TemplateKind::Class, &self.class_templates),
            (TemplateKind::Action, &self.act_templates),
        ] {
            if let Some(tid) = list.iter().map(|t| t.tid).duplicates().next() {
                return Err(invalid(format!("duplicate {kind} template {tid}")));
            }

            for t in list {
                for step in &t.steps {
                    self.validate_step(step).map_err(|e| {
                        invalid(format!(
                            "{kind} template {} step {}: {e}",
                            t.tid, step.description
                        ))
                    })?;
                }
            }
        }

        Ok(())
    }

    fn validate_step(&self, step: &TableStep) -> Result<(), String> {
        let reg = |idx: u16| -> Result<(), String> {
            if usize::from(idx) >= REGFILE_ENTRIES {
                return Err(format!("register {idx} out of range"));
            }
            Ok(())
        };

        match step.fdb {
            FdbOpc::Nop | FdbOpc::PushFid => (),
            FdbOpc::PushRidRegFile(r) => reg(r)?,
            FdbOpc::AllocRidRegFile(r) => {
                reg(r)?;
                if step.kind != StepKind::Ctrl {
                    return Err("RID allocation outside a control step".into());
                }
            }
        }

        for id in &step.idents {
            reg(id.regfile_idx)?;
        }

        if step.func.opc != super::cond::FuncOpc::Nop {
            reg(step.func.dst)?;
        }

        match &step.kind {
            StepKind::Tcam { tbl_operand, key_bits, wildcard, .. } => {
                reg(*tbl_operand)?;
                if *wildcard && self.device.wc_dynamic_pad {
                    let slice = usize::from(self.device.wc_slice_bits)
                        - usize::from(self.device.wc_ctrl_bits);
                    if usize::from(*key_bits) > slice * 4 {
                        let msg = "key does not fit four wildcard slices";
                        return Err(msg.into());
                    }
                }
            }

            StepKind::Index { opc, tbl_operand, dyn_group, .. } => {
                match opc {
                    IndexOpc::AllocWrGlb | IndexOpc::WrGlb => {
                        if usize::from(*tbl_operand) >= GLB_REGFILE_ENTRIES {
                            return Err("global operand out of range".into());
                        }
                    }
                    _ => reg(*tbl_operand)?,
                }
                if *opc == IndexOpc::WrGlb && step.fdb != FdbOpc::Nop {
                    return Err("global write cannot record a resource".into());
                }
                if let Some(g) = dyn_group {
                    if self.device.dyn_group(*g).is_none() {
                        return Err(format!("unknown dynamic group {g}"));
                    }
                }
            }

            StepKind::IfTbl {
                opc: IfOpc::WrRegFile | IfOpc::RdRegFile,
                tbl_operand,
                ..
            } => {
                let r = u16::try_from(*tbl_operand).map_err(|_| {
                    format!("register {tbl_operand} out of range")
                })?;
                reg(r)?;
            }

            StepKind::Generic { subtype, rid_regfile, .. } => {
                let dir = step.direction;
                if !self
                    .gen_tables
                    .iter()
                    .any(|p| p.subtype == *subtype && p.direction == dir)
                {
                    return Err(format!("no generic table {subtype}/{dir}"));
                }
                if let Some(r) = rid_regfile {
                    reg(*r)?;
                }
            }

            StepKind::Em { .. } | StepKind::IfTbl { .. } | StepKind::Ctrl => (),
        }

        Ok(())
    }
}
