// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The flow resource database.
//!
//! Every hardware resource allocated on behalf of a flow is recorded
//! here so that the flow can be torn down exactly. The database is a
//! fixed arena of resource slots shared by flow heads and chained
//! records, handed out by a single two-ended stack: flow ids are
//! popped from the head end and chained slots from the tail end.
//!
//! ```text
//!  stack:  [ used fids | free ............... free | used chains ]
//!                       ^head                  tail^
//! ```
//!
//! The head record of a flow (the slot named by its fid) optionally
//! holds the flow's critical resource, plus the first and last links
//! of its chain. Chained records are kept in allocation order.

use super::Direction;
use crate::api::Fid;
use crate::api::FlowDbDump;
use crate::api::FlowDump;
use crate::api::FlowType;
use crate::api::ResourceDump;
use crate::api::ResourceFunc;
use crate::d_error::DError;
use alloc::vec::Vec;
use bitflags::bitflags;
use core::fmt;
use core::fmt::Display;
use serde::Deserialize;
use serde::Serialize;

bitflags! {
    /// The active bits of a flow id. A RID sets both bits.
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct FlowBits: u8 {
        const REGULAR = 0x1;
        const DEFAULT = 0x2;
    }
}

impl From<FlowType> for FlowBits {
    fn from(ft: FlowType) -> Self {
        match ft {
            FlowType::Regular => FlowBits::REGULAR,
            FlowType::Default => FlowBits::DEFAULT,
            FlowType::Rid => FlowBits::REGULAR | FlowBits::DEFAULT,
        }
    }
}

impl FlowBits {
    fn flow_type(&self) -> Option<FlowType> {
        if *self == FlowBits::REGULAR {
            Some(FlowType::Regular)
        } else if *self == FlowBits::DEFAULT {
            Some(FlowType::Default)
        } else if self.is_all() {
            Some(FlowType::Rid)
        } else {
            None
        }
    }
}

/// The geometry of a flow database.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct FlowDbCfg {
    /// One more than the largest flow id.
    pub num_flows: u32,
    /// The size of the slot arena, flow heads included.
    pub num_resources: u32,
    /// The number of function (owner) ids.
    pub num_funcs: u16,
}

/// A single hardware resource attributed to a flow.
///
/// The default value is the empty record.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ResourceRecord {
    pub direction: Direction,
    pub func: ResourceFunc,
    pub res_type: u32,
    pub subtype: u32,
    /// Opaque to the database: an identifier, a table index, a match
    /// row, an exact-match handle or a generic table hash index.
    pub handle: u64,
    pub critical: bool,
    pub shared: bool,
}

impl ResourceRecord {
    pub fn is_empty(&self) -> bool {
        self.func == ResourceFunc::Invalid
    }

    pub fn dump(&self) -> ResourceDump {
        ResourceDump {
            direction: self.direction,
            func: self.func,
            res_type: self.res_type,
            subtype: self.subtype,
            handle: self.handle,
            critical: self.critical,
            shared: self.shared,
        }
    }
}

impl Display for ResourceRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} type={} sub={} handle={:#x}",
            self.func, self.direction, self.res_type, self.subtype, self.handle
        )
    }
}

#[derive(Clone, Copy, Debug, Default)]
struct Slot {
    rec: ResourceRecord,
    next: Option<u32>,
    // Only meaningful for flow heads: the last record of the chain.
    last: Option<u32>,
}

#[derive(Clone, Copy, Debug, DError, Eq, PartialEq)]
#[derror(leaf_data = FlowDbError::data)]
pub enum FlowDbError {
    /// No flow id is available.
    Exhausted,
    /// No chained resource slot is available.
    ResourceExhausted,
    /// The fid is not active for the given flow type.
    Inactive { flow_type: FlowType, fid: u32 },
    /// The arena violates one of its invariants. The database must
    /// not be used any further.
    Corrupt { what: &'static str, idx: u32 },
    /// The configured geometry cannot hold a single flow.
    BadConfig,
}

impl FlowDbError {
    fn data(&self, data: &mut [u64]) {
        [data[0], data[1]] = match self {
            Self::Inactive { fid, .. } => [u64::from(*fid), 0],
            Self::Corrupt { idx, .. } => [u64::from(*idx), 0],
            _ => [0, 0],
        }
    }
}

impl Display for FlowDbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exhausted => write!(f, "no free flow ids"),
            Self::ResourceExhausted => write!(f, "no free resource slots"),
            Self::Inactive { flow_type, fid } => {
                write!(f, "{flow_type} flow {fid} not active")
            }
            Self::Corrupt { what, idx } => write!(f, "{what} (slot {idx})"),
            Self::BadConfig => write!(f, "invalid flow database geometry"),
        }
    }
}

pub struct FlowDb {
    cfg: FlowDbCfg,
    slots: Vec<Slot>,
    stack: Vec<u32>,
    head: u32,
    tail: u32,
    bits: Vec<FlowBits>,
    func_ids: Vec<u16>,
}

impl FlowDb {
    pub fn new(cfg: FlowDbCfg) -> Result<Self, FlowDbError> {
        // Slot zero is reserved; at least one fid and one chained
        // slot must fit.
        if cfg.num_flows < 2 || cfg.num_resources <= cfg.num_flows {
            return Err(FlowDbError::BadConfig);
        }

        let nres = cfg.num_resources as usize;
        let nflows = cfg.num_flows as usize;

        Ok(Self {
            cfg,
            slots: vec![Slot::default(); nres],
            stack: (0..cfg.num_resources).collect(),
            head: 1,
            tail: cfg.num_resources - 1,
            bits: vec![FlowBits::empty(); nflows],
            func_ids: vec![0; nflows],
        })
    }

    pub fn cfg(&self) -> &FlowDbCfg {
        &self.cfg
    }

    pub fn head(&self) -> u32 {
        self.head
    }

    pub fn tail(&self) -> u32 {
        self.tail
    }

    /// The number of slots between the two ends.
    pub fn free_slots(&self) -> u32 {
        self.tail - self.head
    }

    pub fn is_active(&self, flow_type: FlowType, fid: Fid) -> bool {
        self.bits
            .get(fid.idx())
            .is_some_and(|b| *b == FlowBits::from(flow_type))
    }

    /// The flow type a fid is currently active as, if any.
    pub fn flow_type_of(&self, fid: Fid) -> Option<FlowType> {
        self.bits.get(fid.idx()).and_then(|b| b.flow_type())
    }

    fn check_active(
        &self,
        flow_type: FlowType,
        fid: Fid,
    ) -> Result<(), FlowDbError> {
        if fid.val() == 0 || !self.is_active(flow_type, fid) {
            return Err(FlowDbError::Inactive { flow_type, fid: fid.val() });
        }
        Ok(())
    }

    fn slot(&self, idx: u32) -> Result<&Slot, FlowDbError> {
        self.slots
            .get(idx as usize)
            .ok_or(FlowDbError::Corrupt {
                what: "chain index out of range",
                idx,
            })
    }

    /// Allocate a flow id for `func_id`. Like a chained slot, a fid
    /// is refused if taking it would bring head up to tail.
    pub fn allocate_fid(
        &mut self,
        flow_type: FlowType,
        func_id: u16,
    ) -> Result<Fid, FlowDbError> {
        if self.head + 1 >= self.tail {
            return Err(FlowDbError::Exhausted);
        }

        let fid = self.stack[self.head as usize];
        // The free region may hold slots beyond the flow id range once
        // chained slots have cycled through it.
        if fid == 0 || fid >= self.cfg.num_flows {
            return Err(FlowDbError::Exhausted);
        }

        if !self.bits[fid as usize].is_empty() {
            return Err(FlowDbError::Corrupt {
                what: "free fid is active",
                idx: fid,
            });
        }

        self.head += 1;
        self.slots[fid as usize] = Slot::default();
        self.bits[fid as usize] = FlowBits::from(flow_type);
        self.func_ids[fid as usize] =
            if flow_type == FlowType::Regular { func_id } else { 0 };

        Ok(Fid::new(fid))
    }

    /// Attribute `rec` to the flow.
    ///
    /// The first critical record lives in the flow's head slot; a
    /// redundant critical record is downgraded and chained like any
    /// other. Returns whether the record ended up in the head.
    pub fn add_resource(
        &mut self,
        flow_type: FlowType,
        fid: Fid,
        mut rec: ResourceRecord,
    ) -> Result<bool, FlowDbError> {
        self.check_active(flow_type, fid)?;
        let fidx = fid.idx();

        if rec.critical {
            if self.slots[fidx].rec.is_empty() {
                self.slots[fidx].rec = rec;
                return Ok(true);
            }
            rec.critical = false;
        }

        if self.tail <= self.head + 1 {
            return Err(FlowDbError::ResourceExhausted);
        }

        let idx = self.stack[self.tail as usize];
        if idx == 0 || idx as usize >= self.slots.len() {
            return Err(FlowDbError::Corrupt { what: "bad free slot", idx });
        }
        self.tail -= 1;

        self.slots[idx as usize] = Slot { rec, next: None, last: None };
        match self.slots[fidx].last {
            Some(last) => self.slots[last as usize].next = Some(idx),
            None => self.slots[fidx].next = Some(idx),
        }
        self.slots[fidx].last = Some(idx);

        Ok(false)
    }

    fn release_slot(&mut self, idx: u32) -> Result<(), FlowDbError> {
        if self.tail + 1 >= self.cfg.num_resources {
            return Err(FlowDbError::Corrupt {
                what: "free stack overflow",
                idx,
            });
        }
        self.slots[idx as usize] = Slot::default();
        self.tail += 1;
        self.stack[self.tail as usize] = idx;
        Ok(())
    }

    /// Remove one record from the flow: the critical record held in
    /// the head slot when `want_critical` is set, otherwise the
    /// oldest chained record. `None` once there is nothing left of
    /// the requested kind.
    pub fn pop_resource(
        &mut self,
        flow_type: FlowType,
        fid: Fid,
        want_critical: bool,
    ) -> Result<Option<ResourceRecord>, FlowDbError> {
        self.check_active(flow_type, fid)?;
        let fidx = fid.idx();

        if want_critical {
            let rec = core::mem::take(&mut self.slots[fidx].rec);
            return Ok((!rec.is_empty()).then_some(rec));
        }

        let Some(idx) = self.slots[fidx].next else {
            return Ok(None);
        };

        let slot = *self.slot(idx)?;
        self.slots[fidx].next = slot.next;
        if slot.next.is_none() {
            self.slots[fidx].last = None;
        }
        self.release_slot(idx)?;

        Ok(Some(slot.rec))
    }

    /// Remove the newest chained record of the flow.
    pub fn pop_resource_last(
        &mut self,
        flow_type: FlowType,
        fid: Fid,
    ) -> Result<Option<ResourceRecord>, FlowDbError> {
        self.check_active(flow_type, fid)?;
        let fidx = fid.idx();

        let Some(last) = self.slots[fidx].last else {
            return Ok(None);
        };

        // Find the predecessor of the last record.
        let mut prev: Option<u32> = None;
        let mut cur = self.slots[fidx].next;
        let mut steps = 0;
        while let Some(idx) = cur {
            if idx == last {
                break;
            }
            steps += 1;
            if steps > self.cfg.num_resources {
                return Err(FlowDbError::Corrupt { what: "chain cycle", idx });
            }
            prev = Some(idx);
            cur = self.slot(idx)?.next;
        }

        if cur != Some(last) {
            return Err(FlowDbError::Corrupt {
                what: "chain tail unreachable",
                idx: last,
            });
        }

        let rec = self.slot(last)?.rec;
        match prev {
            Some(p) => self.slots[p as usize].next = None,
            None => self.slots[fidx].next = None,
        }
        self.slots[fidx].last = prev;
        self.release_slot(last)?;

        Ok(Some(rec))
    }

    /// Return a flow id to the pool. The flow must not hold any
    /// resources.
    pub fn free_fid(
        &mut self,
        flow_type: FlowType,
        fid: Fid,
    ) -> Result<(), FlowDbError> {
        if !self.is_active(flow_type, fid) {
            return Err(FlowDbError::Corrupt {
                what: "freeing inactive fid",
                idx: fid.val(),
            });
        }

        let fidx = fid.idx();
        let head = &self.slots[fidx];
        if head.next.is_some() || !head.rec.is_empty() {
            return Err(FlowDbError::Corrupt {
                what: "freeing fid with resources",
                idx: fid.val(),
            });
        }

        if self.head <= 1 {
            return Err(FlowDbError::Corrupt {
                what: "fid stack underflow",
                idx: fid.val(),
            });
        }

        self.head -= 1;
        self.stack[self.head as usize] = fid.val();
        self.bits[fidx] = FlowBits::empty();
        self.func_ids[fidx] = 0;
        self.slots[fidx] = Slot::default();
        Ok(())
    }

    /// Walk the flow's records: the critical record first, then the
    /// chain in allocation order.
    pub fn resources(&self, fid: Fid) -> ResourceIter<'_> {
        let (crit, next) = match self.slots.get(fid.idx()) {
            Some(s) if self.flow_type_of(fid).is_some() => {
                ((!s.rec.is_empty()).then_some(s.rec), s.next)
            }
            _ => (None, None),
        };

        ResourceIter { db: self, crit, next, seen: 0 }
    }

    /// Find the first record of the flow matching `func` and
    /// `subtype`.
    pub fn find_resource(
        &self,
        flow_type: FlowType,
        fid: Fid,
        func: ResourceFunc,
        subtype: u32,
    ) -> Result<Option<ResourceRecord>, FlowDbError> {
        self.check_active(flow_type, fid)?;
        Ok(self
            .resources(fid)
            .find(|r| r.func == func && r.subtype == subtype))
    }

    pub fn func_id(&self, fid: Fid) -> Option<u16> {
        self.func_ids.get(fid.idx()).copied()
    }

    /// All active fids of the given type, in ascending order.
    pub fn active_fids(&self, flow_type: FlowType) -> Vec<Fid> {
        let want = FlowBits::from(flow_type);
        self.bits
            .iter()
            .enumerate()
            .filter(|(_, b)| **b == want)
            .map(|(i, _)| Fid::new(i as u32))
            .collect()
    }

    /// All active regular flows owned by `func_id`.
    pub fn fids_for_func(&self, func_id: u16) -> Vec<Fid> {
        self.active_fids(FlowType::Regular)
            .into_iter()
            .filter(|fid| self.func_ids[fid.idx()] == func_id)
            .collect()
    }

    /// Check the arena invariants: the stack ends have not crossed,
    /// every chain terminates, and no slot is linked from more than
    /// one place.
    pub fn validate(&self) -> Result<(), FlowDbError> {
        if self.head < 1
            || self.head > self.tail
            || self.tail >= self.cfg.num_resources
        {
            return Err(FlowDbError::Corrupt {
                what: "stack ends crossed",
                idx: self.head,
            });
        }

        let mut owned = vec![false; self.slots.len()];
        let mut chained = 0u32;

        for (fidx, bits) in self.bits.iter().enumerate() {
            if bits.is_empty() {
                continue;
            }

            let fid = fidx as u32;
            if owned[fidx] {
                return Err(FlowDbError::Corrupt {
                    what: "fid slot also chained",
                    idx: fid,
                });
            }
            owned[fidx] = true;

            let mut cur = self.slots[fidx].next;
            let mut last = None;
            while let Some(idx) = cur {
                let slot = self.slot(idx)?;
                if owned[idx as usize] {
                    return Err(FlowDbError::Corrupt {
                        what: "slot owned twice",
                        idx,
                    });
                }
                owned[idx as usize] = true;
                chained += 1;
                last = Some(idx);
                cur = slot.next;
            }

            if last != self.slots[fidx].last {
                return Err(FlowDbError::Corrupt {
                    what: "chain tail mismatch",
                    idx: fid,
                });
            }
        }

        // Every chained slot was taken from the tail end.
        let tail_used = self.cfg.num_resources - 1 - self.tail;
        if chained != tail_used {
            return Err(FlowDbError::Corrupt {
                what: "chained slot count mismatch",
                idx: chained,
            });
        }

        Ok(())
    }

    pub fn dump(&self) -> FlowDbDump {
        let mut flows = Vec::new();
        for (fidx, bits) in self.bits.iter().enumerate() {
            let Some(flow_type) = bits.flow_type() else {
                continue;
            };
            let fid = Fid::new(fidx as u32);
            flows.push(FlowDump {
                fid: fid.val(),
                flow_type,
                func_id: self.func_ids[fidx],
                resources: self.resources(fid).map(|r| r.dump()).collect(),
            });
        }

        FlowDbDump {
            num_flows: self.cfg.num_flows,
            num_resources: self.cfg.num_resources,
            head: self.head,
            tail: self.tail,
            flows,
        }
    }
}

pub struct ResourceIter<'a> {
    db: &'a FlowDb,
    crit: Option<ResourceRecord>,
    next: Option<u32>,
    seen: u32,
}

impl Iterator for ResourceIter<'_> {
    type Item = ResourceRecord;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(rec) = self.crit.take() {
            return Some(rec);
        }

        let idx = self.next?;
        // A cycle ends the walk rather than spinning forever;
        // `validate()` reports it.
        self.seen += 1;
        if self.seen > self.db.cfg.num_resources {
            self.next = None;
            return None;
        }

        let slot = self.db.slots.get(idx as usize)?;
        self.next = slot.next;
        Some(slot.rec)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn db(num_flows: u32, num_resources: u32) -> FlowDb {
        FlowDb::new(FlowDbCfg { num_flows, num_resources, num_funcs: 4 })
            .unwrap()
    }

    fn rec(func: ResourceFunc, handle: u64) -> ResourceRecord {
        ResourceRecord {
            direction: Direction::In,
            func,
            handle,
            ..Default::default()
        }
    }

    #[test]
    fn bad_geometry() {
        let cfg = FlowDbCfg { num_flows: 8, num_resources: 8, num_funcs: 1 };
        assert_eq!(FlowDb::new(cfg).err(), Some(FlowDbError::BadConfig));
    }

    #[test]
    fn fid_alloc_and_free() {
        let mut db = db(4, 16);
        let a = db.allocate_fid(FlowType::Regular, 2).unwrap();
        let b = db.allocate_fid(FlowType::Default, 2).unwrap();
        let c = db.allocate_fid(FlowType::Rid, 2).unwrap();
        assert_eq!((a.val(), b.val(), c.val()), (1, 2, 3));
        assert_eq!(
            db.allocate_fid(FlowType::Regular, 0),
            Err(FlowDbError::Exhausted)
        );

        assert!(db.is_active(FlowType::Regular, a));
        assert!(!db.is_active(FlowType::Default, a));
        assert!(db.is_active(FlowType::Rid, c));
        assert!(!db.is_active(FlowType::Regular, c));
        assert_eq!(db.func_id(a), Some(2));
        assert_eq!(db.func_id(b), Some(0));

        db.free_fid(FlowType::Default, b).unwrap();
        assert_eq!(
            db.free_fid(FlowType::Default, b),
            Err(FlowDbError::Corrupt { what: "freeing inactive fid", idx: 2 })
        );
        // The freed fid is the next one handed out.
        assert_eq!(db.allocate_fid(FlowType::Regular, 1).unwrap(), b);
        db.validate().unwrap();
    }

    #[test]
    fn critical_in_head_and_chain_order() {
        let mut db = db(4, 16);
        let fid = db.allocate_fid(FlowType::Regular, 0).unwrap();
        let free = db.free_slots();

        let mut crit = rec(ResourceFunc::TcamTable, 100);
        crit.critical = true;
        assert!(db.add_resource(FlowType::Regular, fid, crit).unwrap());
        // Redundant critical is chained.
        assert!(!db.add_resource(FlowType::Regular, fid, crit).unwrap());
        for h in 1..=3 {
            let r = rec(ResourceFunc::IndexTable, h);
            db.add_resource(FlowType::Regular, fid, r).unwrap();
        }
        assert_eq!(db.free_slots(), free - 4);

        let handles: Vec<u64> = db.resources(fid).map(|r| r.handle).collect();
        assert_eq!(handles, vec![100, 100, 1, 2, 3]);
        let crits: Vec<bool> = db.resources(fid).map(|r| r.critical).collect();
        assert_eq!(crits, vec![true, false, false, false, false]);
        db.validate().unwrap();

        assert_eq!(
            db.find_resource(
                FlowType::Regular,
                fid,
                ResourceFunc::IndexTable,
                0,
            )
            .unwrap()
            .map(|r| r.handle),
            Some(1)
        );

        // Freeing with resources attached is refused.
        assert!(matches!(
            db.free_fid(FlowType::Regular, fid),
            Err(FlowDbError::Corrupt { .. })
        ));

        let c = db.pop_resource(FlowType::Regular, fid, true).unwrap().unwrap();
        assert_eq!(c.handle, 100);
        assert_eq!(
            db.pop_resource(FlowType::Regular, fid, true).unwrap(),
            None
        );

        let mut popped = vec![];
        while let Some(r) =
            db.pop_resource(FlowType::Regular, fid, false).unwrap()
        {
            popped.push(r.handle);
        }
        assert_eq!(popped, vec![100, 1, 2, 3]);
        assert_eq!(db.free_slots(), free);
        db.free_fid(FlowType::Regular, fid).unwrap();
        db.validate().unwrap();
    }

    #[test]
    fn reverse_pop() {
        let mut db = db(4, 16);
        let fid = db.allocate_fid(FlowType::Default, 0).unwrap();
        for h in 1..=3 {
            let r = rec(ResourceFunc::Identifier, h);
            db.add_resource(FlowType::Default, fid, r).unwrap();
        }

        let mut popped = vec![];
        while let Some(r) =
            db.pop_resource_last(FlowType::Default, fid).unwrap()
        {
            popped.push(r.handle);
            db.validate().unwrap();
        }
        assert_eq!(popped, vec![3, 2, 1]);
        db.free_fid(FlowType::Default, fid).unwrap();
    }

    #[test]
    fn resource_exhaustion() {
        // Slots 1..=5 are shared by fids and chains.
        let mut db = db(3, 6);
        let fid = db.allocate_fid(FlowType::Regular, 0).unwrap();
        let mut added = 0;
        loop {
            let r = rec(ResourceFunc::Identifier, added);
            match db.add_resource(FlowType::Regular, fid, r) {
                Ok(_) => added += 1,
                Err(e) => {
                    assert_eq!(e, FlowDbError::ResourceExhausted);
                    break;
                }
            }
        }
        assert_eq!(added, 2);
        assert_eq!(db.tail(), db.head() + 1);
        db.validate().unwrap();

        // Neither end may close the gap.
        assert_eq!(
            db.allocate_fid(FlowType::Regular, 0),
            Err(FlowDbError::Exhausted)
        );
        assert_eq!(db.tail(), db.head() + 1);

        // A returned chained slot makes room for one more fid.
        db.pop_resource(FlowType::Regular, fid, false).unwrap().unwrap();
        assert_eq!(db.allocate_fid(FlowType::Regular, 0), Ok(Fid::new(2)));
        assert_eq!(db.tail(), db.head() + 1);
        db.validate().unwrap();
    }

    #[test]
    fn inactive_flow_is_rejected() {
        let mut db = db(4, 16);
        let fid = Fid::new(2);
        assert_eq!(
            db.add_resource(
                FlowType::Regular,
                fid,
                rec(ResourceFunc::Identifier, 1),
            ),
            Err(FlowDbError::Inactive { flow_type: FlowType::Regular, fid: 2 })
        );
        assert!(db.pop_resource(FlowType::Rid, fid, false).is_err());
        assert_eq!(db.resources(fid).count(), 0);
    }

    #[test]
    fn flows_by_func_and_type() {
        let mut db = db(8, 32);
        let a = db.allocate_fid(FlowType::Regular, 1).unwrap();
        let b = db.allocate_fid(FlowType::Regular, 2).unwrap();
        let c = db.allocate_fid(FlowType::Regular, 1).unwrap();
        let d = db.allocate_fid(FlowType::Default, 1).unwrap();

        assert_eq!(db.fids_for_func(1), vec![a, c]);
        assert_eq!(db.fids_for_func(2), vec![b]);
        assert_eq!(db.active_fids(FlowType::Default), vec![d]);

        let dump = db.dump();
        assert_eq!(dump.flows.len(), 4);
        assert_eq!(dump.free_slots(), db.free_slots());
    }
}
