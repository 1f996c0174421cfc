// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Generic (shared) result tables.
//!
//! A generic table caches results which many flows have in common,
//! such as an encapsulation record or a source-property entry. The
//! first flow to need a result writes it; later flows find it and
//! take a reference. The entry is released only when the last
//! reference goes away.
//!
//! A table is addressed either directly, where the key is the index,
//! or through a hash of the key. The hash variant has `num_buckets`
//! rows of four slots; a slot holds the index of a key slot, and key
//! slots come from a free list. The handle of a hashed entry is its
//! bucket position: `(bucket << 2) | slot`.

use super::Direction;
use super::blob::ByteOrder;
use crate::api::Fid;
use crate::api::GenTblDump;
use crate::api::GenTblEntryDump;
use crate::d_error::DError;
use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;
use core::fmt::Display;
use serde::Deserialize;
use serde::Serialize;

/// The number of slots in a hash bucket.
pub const BUCKET_WAYS: usize = 4;

/// The largest direct-table key, in bytes.
pub const MAX_INDEX_KEY_BYTES: usize = 4;

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct HashParams {
    /// A power of two.
    pub num_buckets: u32,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct GenTblParams {
    pub name: String,
    pub subtype: u32,
    pub direction: Direction,
    pub num_entries: u32,
    pub result_bits: u16,
    #[serde(default)]
    pub byte_order: ByteOrder,
    /// The key width, in bytes. Hash tables only.
    #[serde(default)]
    pub key_bytes: u16,
    #[serde(default)]
    pub hash: Option<HashParams>,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct GenTblEntry {
    pub ref_count: u32,
    pub data: Vec<u8>,
    pub bit_len: usize,
    pub byte_order: ByteOrder,
    pub key: Option<Vec<u8>>,
    /// A RID flow owned by this entry, destroyed with it.
    pub nested_fid: Option<Fid>,
}

impl GenTblEntry {
    pub fn is_live(&self) -> bool {
        self.ref_count > 0
    }
}

#[derive(Clone, Copy, Debug, DError, Eq, PartialEq)]
#[derror(leaf_data = GenTblError::data)]
pub enum GenTblError {
    NoTable { subtype: u32, dir: Direction },
    BadIndex { idx: u64 },
    BadKey { len: usize },
    /// No bucket slot or key slot is available.
    Full,
    NotInUse { handle: u64 },
    /// The entry is live and cannot take the requested change.
    Busy { handle: u64 },
    BadConfig { what: &'static str, subtype: u32 },
}

impl GenTblError {
    fn data(&self, data: &mut [u64]) {
        [data[0], data[1]] = match self {
            Self::NoTable { subtype, .. } => [u64::from(*subtype), 0],
            Self::BadIndex { idx } => [*idx, 0],
            Self::BadKey { len } => [*len as u64, 0],
            Self::NotInUse { handle } | Self::Busy { handle } => [*handle, 0],
            Self::BadConfig { subtype, .. } => [u64::from(*subtype), 0],
            Self::Full => [0, 0],
        }
    }
}

impl Display for GenTblError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoTable { subtype, dir } => {
                write!(f, "no generic table {subtype}/{dir}")
            }
            Self::BadIndex { idx } => write!(f, "index {idx} out of range"),
            Self::BadKey { len } => write!(f, "bad key length {len}"),
            Self::Full => write!(f, "table full"),
            Self::NotInUse { handle } => {
                write!(f, "entry {handle:#x} not in use")
            }
            Self::Busy { handle } => write!(f, "entry {handle:#x} busy"),
            Self::BadConfig { what, subtype } => {
                write!(f, "table {subtype}: {what}")
            }
        }
    }
}

/// The outcome of a create-capable search.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SearchResult {
    /// A live entry holds the key.
    Found { handle: u64, key_idx: u32 },
    /// No live entry holds the key; `handle` names an empty entry
    /// reserved for it.
    Missed { handle: u64, key_idx: u32 },
    Full,
}

/// The result of dropping a reference.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Release {
    Retained,
    /// The last reference is gone. The owner must tear down
    /// `nested_fid` (if any) and then `reclaim()` the entry.
    Last { nested_fid: Option<Fid> },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct WriteOutcome {
    pub created: bool,
    pub ref_count: u32,
}

#[derive(Debug)]
struct HashTbl {
    buckets: Vec<[Option<u32>; BUCKET_WAYS]>,
    free_keys: Vec<u32>,
}

impl HashTbl {
    fn new(num_buckets: u32, num_entries: u32) -> Self {
        Self {
            buckets: vec![[None; BUCKET_WAYS]; num_buckets as usize],
            // Pop from the end so the lowest key slot goes first.
            free_keys: (0..num_entries).rev().collect(),
        }
    }

    fn bucket_of(&self, key: &[u8]) -> usize {
        let h = crc32fast::hash(key);
        let folded = (h >> 16) ^ (h & 0xffff);
        folded as usize & (self.buckets.len() - 1)
    }

    fn key_idx(&self, handle: u64) -> Option<u32> {
        let bucket = usize::try_from(handle >> 2).ok()?;
        let slot = (handle & 0x3) as usize;
        self.buckets.get(bucket)?[slot]
    }
}

#[derive(Debug)]
pub struct GenTbl {
    params: GenTblParams,
    entries: Vec<GenTblEntry>,
    hash: Option<HashTbl>,
}

impl GenTbl {
    fn new(params: &GenTblParams) -> Result<Self, GenTblError> {
        let subtype = params.subtype;
        let bad = |what| GenTblError::BadConfig { what, subtype };

        if params.num_entries == 0 {
            return Err(bad("no entries"));
        }

        let hash = match params.hash {
            Some(HashParams { num_buckets }) => {
                if num_buckets == 0 || !num_buckets.is_power_of_two() {
                    return Err(bad("bucket count not a power of two"));
                }
                if params.key_bytes == 0 {
                    return Err(bad("hash table without key width"));
                }
                Some(HashTbl::new(num_buckets, params.num_entries))
            }

            None => None,
        };

        let entry = GenTblEntry {
            byte_order: params.byte_order,
            ..Default::default()
        };

        Ok(Self {
            params: params.clone(),
            entries: vec![entry; params.num_entries as usize],
            hash,
        })
    }

    pub fn params(&self) -> &GenTblParams {
        &self.params
    }

    pub fn is_hashed(&self) -> bool {
        self.hash.is_some()
    }

    fn index_of(&self, key: &[u8]) -> Result<u32, GenTblError> {
        if key.is_empty() || key.len() > MAX_INDEX_KEY_BYTES {
            return Err(GenTblError::BadKey { len: key.len() });
        }

        let idx = key.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b));
        if idx >= u64::from(self.params.num_entries) {
            return Err(GenTblError::BadIndex { idx });
        }
        Ok(idx as u32)
    }

    fn check_key(&self, key: &[u8]) -> Result<(), GenTblError> {
        if key.len() != usize::from(self.params.key_bytes) {
            return Err(GenTblError::BadKey { len: key.len() });
        }
        Ok(())
    }

    /// Map a handle to the entry index backing it.
    pub fn key_idx(&self, handle: u64) -> Result<u32, GenTblError> {
        match &self.hash {
            Some(h) => {
                h.key_idx(handle).ok_or(GenTblError::NotInUse { handle })
            }
            None => {
                if handle >= u64::from(self.params.num_entries) {
                    return Err(GenTblError::BadIndex { idx: handle });
                }
                Ok(handle as u32)
            }
        }
    }

    pub fn entry(&self, handle: u64) -> Result<&GenTblEntry, GenTblError> {
        let idx = self.key_idx(handle)?;
        Ok(&self.entries[idx as usize])
    }

    fn entry_mut(
        &mut self,
        handle: u64,
    ) -> Result<&mut GenTblEntry, GenTblError> {
        let idx = self.key_idx(handle)?;
        Ok(&mut self.entries[idx as usize])
    }

    /// Search for a live entry holding `key`.
    pub fn lookup(
        &self,
        key: &[u8],
    ) -> Result<Option<(u64, u32)>, GenTblError> {
        let Some(hash) = &self.hash else {
            let idx = self.index_of(key)?;
            let live = self.entries[idx as usize].is_live();
            return Ok(live.then_some((u64::from(idx), idx)));
        };

        self.check_key(key)?;
        let bucket = hash.bucket_of(key);
        for (slot, kidx) in hash.buckets[bucket].iter().enumerate() {
            let Some(kidx) = kidx else {
                continue;
            };
            let ent = &self.entries[*kidx as usize];
            if ent.key.as_deref() == Some(key) && ent.is_live() {
                return Ok(Some((((bucket << 2) | slot) as u64, *kidx)));
            }
        }
        Ok(None)
    }

    /// Search for `key`, reserving an empty entry for it on a miss.
    pub fn lookup_or_create(
        &mut self,
        key: &[u8],
    ) -> Result<SearchResult, GenTblError> {
        let Some(hash) = &mut self.hash else {
            let idx = self.index_of(key)?;
            let handle = u64::from(idx);
            return Ok(if self.entries[idx as usize].is_live() {
                SearchResult::Found { handle, key_idx: idx }
            } else {
                SearchResult::Missed { handle, key_idx: idx }
            });
        };

        if key.len() != usize::from(self.params.key_bytes) {
            return Err(GenTblError::BadKey { len: key.len() });
        }

        let bucket = hash.bucket_of(key);
        let mut free_slot = None;
        for (slot, kidx) in hash.buckets[bucket].iter().enumerate() {
            match kidx {
                Some(kidx) => {
                    if self.entries[*kidx as usize].key.as_deref() == Some(key)
                    {
                        let handle = ((bucket << 2) | slot) as u64;
                        let key_idx = *kidx;
                        return Ok(if self.entries[key_idx as usize].is_live() {
                            SearchResult::Found { handle, key_idx }
                        } else {
                            SearchResult::Missed { handle, key_idx }
                        });
                    }
                }
                None => {
                    if free_slot.is_none() {
                        free_slot = Some(slot);
                    }
                }
            }
        }

        let Some(slot) = free_slot else {
            return Ok(SearchResult::Full);
        };
        let Some(key_idx) = hash.free_keys.pop() else {
            return Ok(SearchResult::Full);
        };

        hash.buckets[bucket][slot] = Some(key_idx);
        let ent = &mut self.entries[key_idx as usize];
        ent.key = Some(key.to_vec());
        ent.ref_count = 0;

        let handle = ((bucket << 2) | slot) as u64;
        Ok(SearchResult::Missed { handle, key_idx })
    }

    pub fn add_ref(&mut self, handle: u64) -> Result<u32, GenTblError> {
        let ent = self.entry_mut(handle)?;
        if !ent.is_live() {
            return Err(GenTblError::NotInUse { handle });
        }
        ent.ref_count += 1;
        Ok(ent.ref_count)
    }

    /// Write the result for `handle`.
    ///
    /// An empty entry is created with one reference and takes
    /// ownership of `nested_fid`. A live entry gains a reference and
    /// its result is overwritten; it cannot adopt a second RID.
    pub fn write_entry(
        &mut self,
        handle: u64,
        data: Vec<u8>,
        bit_len: usize,
        nested_fid: Option<Fid>,
    ) -> Result<WriteOutcome, GenTblError> {
        let ent = self.entry_mut(handle)?;

        if ent.is_live() {
            if nested_fid.is_some() {
                return Err(GenTblError::Busy { handle });
            }
            ent.data = data;
            ent.bit_len = bit_len;
            ent.ref_count += 1;
            return Ok(WriteOutcome {
                created: false,
                ref_count: ent.ref_count,
            });
        }

        ent.data = data;
        ent.bit_len = bit_len;
        ent.nested_fid = nested_fid;
        ent.ref_count = 1;
        Ok(WriteOutcome { created: true, ref_count: 1 })
    }

    pub fn release(&mut self, handle: u64) -> Result<Release, GenTblError> {
        let ent = self.entry_mut(handle)?;
        if !ent.is_live() {
            return Err(GenTblError::NotInUse { handle });
        }

        ent.ref_count -= 1;
        if ent.ref_count > 0 {
            return Ok(Release::Retained);
        }

        Ok(Release::Last { nested_fid: ent.nested_fid.take() })
    }

    /// Return an unreferenced entry to the empty state, dropping its
    /// hash node.
    pub fn reclaim(&mut self, handle: u64) -> Result<(), GenTblError> {
        let key_idx = self.key_idx(handle)?;
        let byte_order = self.params.byte_order;
        let ent = &mut self.entries[key_idx as usize];
        if ent.is_live() {
            return Err(GenTblError::Busy { handle });
        }
        *ent = GenTblEntry { byte_order, ..Default::default() };

        if let Some(hash) = &mut self.hash {
            let bucket = (handle >> 2) as usize;
            let slot = (handle & 0x3) as usize;
            hash.buckets[bucket][slot] = None;
            hash.free_keys.push(key_idx);
        }

        Ok(())
    }

    /// The key index of the live entry owning RID `fid`.
    pub fn owner_of(&self, fid: Fid) -> Option<u32> {
        self.entries
            .iter()
            .position(|e| e.is_live() && e.nested_fid == Some(fid))
            .map(|idx| idx as u32)
    }

    pub fn dump(&self) -> GenTblDump {
        let entry_dump = |index: u64, e: &GenTblEntry| GenTblEntryDump {
            index: index as u32,
            ref_count: e.ref_count,
            bit_len: e.bit_len as u32,
            data: e.data.clone(),
            key: e.key.clone(),
            nested_fid: e.nested_fid.map(|f| f.val()),
        };

        let entries = match &self.hash {
            None => self
                .entries
                .iter()
                .enumerate()
                .filter(|(_, e)| e.is_live())
                .map(|(i, e)| entry_dump(i as u64, e))
                .collect(),

            Some(h) => {
                let mut out = Vec::new();
                for (b, row) in h.buckets.iter().enumerate() {
                    for (s, kidx) in row.iter().enumerate() {
                        let Some(kidx) = kidx else {
                            continue;
                        };
                        let e = &self.entries[*kidx as usize];
                        if e.is_live() {
                            out.push(entry_dump(((b << 2) | s) as u64, e));
                        }
                    }
                }
                out
            }
        };

        GenTblDump {
            name: self.params.name.clone(),
            subtype: self.params.subtype,
            direction: self.params.direction,
            num_entries: self.params.num_entries,
            entries,
        }
    }
}

/// The table index of a generic table.
pub fn tbl_idx(subtype: u32, dir: Direction) -> u32 {
    (subtype << 1) | dir.idx() as u32
}

/// Every generic table of a mapper instance.
#[derive(Debug, Default)]
pub struct GenTables {
    tables: Vec<GenTbl>,
}

impl GenTables {
    pub fn new(params: &[GenTblParams]) -> Result<Self, GenTblError> {
        let mut tables: Vec<GenTbl> = Vec::with_capacity(params.len());

        for p in params {
            if tables.iter().any(|t| {
                t.params.subtype == p.subtype
                    && t.params.direction == p.direction
            }) {
                return Err(GenTblError::BadConfig {
                    what: "duplicate table",
                    subtype: p.subtype,
                });
            }
            tables.push(GenTbl::new(p)?);
        }

        Ok(Self { tables })
    }

    pub fn get_params(
        &self,
        subtype: u32,
        dir: Direction,
    ) -> Option<&GenTblParams> {
        self.get(subtype, dir).ok().map(|t| t.params())
    }

    pub fn get(
        &self,
        subtype: u32,
        dir: Direction,
    ) -> Result<&GenTbl, GenTblError> {
        self.tables
            .iter()
            .find(|t| t.params.subtype == subtype && t.params.direction == dir)
            .ok_or(GenTblError::NoTable { subtype, dir })
    }

    pub fn get_mut(
        &mut self,
        subtype: u32,
        dir: Direction,
    ) -> Result<&mut GenTbl, GenTblError> {
        self.tables
            .iter_mut()
            .find(|t| t.params.subtype == subtype && t.params.direction == dir)
            .ok_or(GenTblError::NoTable { subtype, dir })
    }

    pub fn iter(&self) -> impl Iterator<Item = &GenTbl> {
        self.tables.iter()
    }

    /// The shared handle, `(tbl_idx << 32) | key_idx`, of the entry
    /// owning RID `fid`.
    pub fn rid_owner(&self, fid: Fid) -> Option<u64> {
        self.tables.iter().find_map(|t| {
            let key_idx = t.owner_of(fid)?;
            let idx = tbl_idx(t.params.subtype, t.params.direction);
            Some((u64::from(idx) << 32) | u64::from(key_idx))
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn params(hash: Option<u32>) -> GenTblParams {
        GenTblParams {
            name: "encap".to_string(),
            subtype: 3,
            direction: Direction::Out,
            num_entries: 8,
            result_bits: 32,
            byte_order: ByteOrder::Big,
            key_bytes: if hash.is_some() { 6 } else { 0 },
            hash: hash.map(|num_buckets| HashParams { num_buckets }),
        }
    }

    #[test]
    fn table_index() {
        assert_eq!(tbl_idx(3, Direction::In), 6);
        assert_eq!(tbl_idx(3, Direction::Out), 7);
    }

    #[test]
    fn bad_params() {
        let mut p = params(Some(3));
        assert!(matches!(
            GenTables::new(&[p.clone()]),
            Err(GenTblError::BadConfig { .. })
        ));
        p.hash = Some(HashParams { num_buckets: 4 });
        p.key_bytes = 0;
        assert!(GenTables::new(&[p]).is_err());
        let p = params(None);
        assert!(GenTables::new(&[p.clone(), p]).is_err());
    }

    #[test]
    fn direct_refcount() {
        let mut tbls = GenTables::new(&[params(None)]).unwrap();
        let t = tbls.get_mut(3, Direction::Out).unwrap();

        assert_eq!(t.lookup(&[0x02]).unwrap(), None);
        assert_eq!(t.lookup(&[0x09]), Err(GenTblError::BadIndex { idx: 9 }));
        assert_eq!(
            t.lookup_or_create(&[0x00, 0x02]).unwrap(),
            SearchResult::Missed { handle: 2, key_idx: 2 }
        );

        let w =
            t.write_entry(2, vec![0xde, 0xad], 16, Some(Fid::new(5))).unwrap();
        assert_eq!(w, WriteOutcome { created: true, ref_count: 1 });
        assert_eq!(t.lookup(&[0x02]).unwrap(), Some((2, 2)));
        assert_eq!(t.add_ref(2), Ok(2));

        // A live entry cannot adopt another RID.
        assert_eq!(
            t.write_entry(2, vec![0; 2], 16, Some(Fid::new(6))),
            Err(GenTblError::Busy { handle: 2 })
        );
        assert_eq!(t.reclaim(2), Err(GenTblError::Busy { handle: 2 }));

        assert_eq!(t.release(2), Ok(Release::Retained));
        assert_eq!(
            t.release(2),
            Ok(Release::Last { nested_fid: Some(Fid::new(5)) })
        );
        assert_eq!(t.release(2), Err(GenTblError::NotInUse { handle: 2 }));
        t.reclaim(2).unwrap();
        assert!(t.entry(2).unwrap().data.is_empty());
    }

    #[test]
    fn hashed_share_and_reclaim() {
        let mut tbls = GenTables::new(&[params(Some(4))]).unwrap();
        let t = tbls.get_mut(3, Direction::Out).unwrap();
        let key = [0xa8, 0x40, 0x25, 0x00, 0x00, 0x01];

        let SearchResult::Missed { handle, key_idx } =
            t.lookup_or_create(&key).unwrap()
        else {
            panic!("expected a miss");
        };
        assert_eq!(key_idx, 0);
        // The reserved node is not a hit until written.
        assert_eq!(t.lookup(&key).unwrap(), None);
        assert_eq!(
            t.lookup_or_create(&key).unwrap(),
            SearchResult::Missed { handle, key_idx }
        );

        t.write_entry(handle, vec![1, 2, 3, 4], 32, None).unwrap();
        assert_eq!(
            t.lookup_or_create(&key).unwrap(),
            SearchResult::Found { handle, key_idx }
        );
        t.add_ref(handle).unwrap();
        assert_eq!(t.dump().entries.len(), 1);
        assert_eq!(t.dump().entries[0].ref_count, 2);

        assert_eq!(t.release(handle), Ok(Release::Retained));
        assert_eq!(t.release(handle), Ok(Release::Last { nested_fid: None }));
        t.reclaim(handle).unwrap();
        assert_eq!(t.key_idx(handle), Err(GenTblError::NotInUse { handle }));
        assert!(t.dump().entries.is_empty());

        // The key slot is reused.
        let res = t.lookup_or_create(&key).unwrap();
        assert!(matches!(res, SearchResult::Missed { key_idx: 0, .. }));
    }

    #[test]
    fn hashed_full() {
        let mut p = params(Some(1));
        p.num_entries = 16;
        let mut tbls = GenTables::new(&[p]).unwrap();
        let t = tbls.get_mut(3, Direction::Out).unwrap();

        // A single bucket holds four keys.
        for i in 0..4u8 {
            let res = t.lookup_or_create(&[0, 0, 0, 0, 0, i]).unwrap();
            assert!(matches!(res, SearchResult::Missed { .. }));
        }
        assert_eq!(
            t.lookup_or_create(&[0, 0, 0, 0, 1, 0]).unwrap(),
            SearchResult::Full
        );
        assert_eq!(t.lookup(&[0, 0]), Err(GenTblError::BadKey { len: 2 }));
    }

    #[test]
    fn rid_ownership() {
        let mut tbls = GenTables::new(&[params(None)]).unwrap();
        let rid = Fid::new(4);
        assert_eq!(tbls.rid_owner(rid), None);

        let t = tbls.get_mut(3, Direction::Out).unwrap();
        t.write_entry(5, vec![0xaa], 8, Some(rid)).unwrap();
        assert_eq!(t.owner_of(rid), Some(5));
        assert_eq!(tbls.rid_owner(rid), Some((7 << 32) | 5));
        assert_eq!(tbls.rid_owner(Fid::new(5)), None);

        // The last release hands the RID over to the caller.
        let t = tbls.get_mut(3, Direction::Out).unwrap();
        assert_eq!(t.release(5), Ok(Release::Last { nested_fid: Some(rid) }));
        assert_eq!(tbls.rid_owner(rid), None);
    }

    #[test]
    fn missing_table() {
        let tbls = GenTables::new(&[params(None)]).unwrap();
        assert!(tbls.get_params(3, Direction::In).is_none());
        assert_eq!(
            tbls.get(4, Direction::Out).err(),
            Some(GenTblError::NoTable { subtype: 4, dir: Direction::Out })
        );
    }
}
