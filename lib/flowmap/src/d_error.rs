// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Utility for converting nested enum errors into collections of
//! static strings to avoid paying the `fmt` tax when firing a probe.

use core::fmt;
pub use derror_macro::DError;
use heapless::Vec;

/// A trait used for walking chains of errors which store useful data in
/// a leaf node.
pub trait DError {
    /// Provide the name of an error's discriminant.
    fn discriminant(&self) -> &'static str;

    /// Provide a reference to the next error in the chain.
    fn child(&self) -> Option<&dyn DError>;

    /// Store data from a leaf error to be bundled with a probe.
    fn leaf_data(&self, _data: &mut [u64]) {}
}

/// An error trace holding the names of all `enum` discriminants
/// encountered when resolving an error, as well as the data from the
/// leaf node.
#[derive(Debug)]
pub struct ErrorBlock<const L: usize> {
    entries: Vec<&'static str, L>,
    more: bool,
    data: [u64; 2],
}

/// Signals that an [`ErrorBlock`] could not contain a new entry.
#[derive(Clone, Copy, Debug)]
pub struct ErrorBlockFull;

impl<const L: usize> Default for ErrorBlock<L> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const L: usize> ErrorBlock<L> {
    /// Create storage to hold at most `L` static string entries.
    pub fn new() -> Self {
        Self { entries: Vec::new(), more: false, data: [0; 2] }
    }

    /// Flatten a nested error into a static string list.
    ///
    /// This function will return an error if the provided `err` contains
    /// too many entries to include within this `ErrorBlock`.
    pub fn from_err(err: &dyn DError) -> Result<ErrorBlock<L>, ErrorBlock<L>> {
        let mut out = ErrorBlock::new();

        if out.append(err).is_err() { Err(out) } else { Ok(out) }
    }

    /// Push all layers (and data) of an error into a block.
    pub fn append(&mut self, err: &dyn DError) -> Result<(), ErrorBlockFull> {
        let mut top: Option<&dyn DError> = Some(err);
        while let Some(el) = top {
            self.append_name(el)?;
            top = el.child();

            if top.is_none() {
                el.leaf_data(&mut self.data[..]);
            }
        }
        Ok(())
    }

    /// Appends the top layer name of a given error.
    pub fn append_name(
        &mut self,
        err: &dyn DError,
    ) -> Result<(), ErrorBlockFull> {
        if self.entries.push(err.discriminant()).is_err() {
            self.more = true;
            return Err(ErrorBlockFull);
        }

        Ok(())
    }

    /// Return the number of stored strings entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Return whether this block contains no layer names.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Was the chain truncated?
    pub fn more(&self) -> bool {
        self.more
    }

    pub fn entries(&self) -> impl ExactSizeIterator<Item = &'static str> {
        self.entries.iter().copied()
    }

    /// Provides access to data stored in a leaf error.
    pub fn data(&self) -> &[u64] {
        &self.data[..]
    }
}

impl<const L: usize> fmt::Display for ErrorBlock<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, name) in self.entries.iter().enumerate() {
            if i > 0 {
                write!(f, "::")?;
            }
            write!(f, "{name}")?;
        }

        if self.more {
            write!(f, "::..")?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(DError)]
    enum TestEnum {
        A,
        B(TestChildEnum),
        #[leaf]
        C(u32),
    }

    #[derive(DError)]
    #[derror(leaf_data = TestChildEnum::data)]
    enum TestChildEnum {
        NoData,
        Data { a: u8, b: u8 },
    }

    impl TestChildEnum {
        fn data(&self, data: &mut [u64]) {
            match self {
                TestChildEnum::NoData => {}
                TestChildEnum::Data { a, b } => {
                    [data[0], data[1]] = [*a as u64, *b as u64]
                }
            }
        }
    }

    #[test]
    fn name_and_data_storage() {
        let err = TestEnum::A;
        let block: ErrorBlock<2> = ErrorBlock::from_err(&err).unwrap();
        let mut block_iter = block.entries();
        assert_eq!(block_iter.len(), 1);
        assert_eq!(block_iter.next(), Some("A"));
        assert_eq!(block_iter.next(), None);

        let err = TestEnum::B(TestChildEnum::NoData);
        let block: ErrorBlock<2> = ErrorBlock::from_err(&err).unwrap();
        let names = block.entries().collect::<std::vec::Vec<_>>();
        assert_eq!(&names[..], &["B", "NoData"][..]);

        let err = TestEnum::B(TestChildEnum::Data { a: 0xab, b: 0xcd });
        let block: ErrorBlock<2> = ErrorBlock::from_err(&err).unwrap();
        assert_eq!(block.to_string(), "B::Data");
        assert_eq!(block.data(), &[0xab, 0xcd]);

        let block: ErrorBlock<2> =
            ErrorBlock::from_err(&TestEnum::C(7)).unwrap();
        assert_eq!(block.len(), 1);
    }

    #[test]
    fn name_truncation() {
        let err = TestEnum::B(TestChildEnum::NoData);
        let block: ErrorBlock<1> = ErrorBlock::from_err(&err).unwrap_err();
        let mut block_iter = block.entries();
        assert_eq!(block_iter.len(), 1);
        assert_eq!(block_iter.next(), Some("B"));
        assert!(block.more());
        assert_eq!(block.to_string(), "B::..");
    }
}
