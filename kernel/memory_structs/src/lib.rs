//! This crate contains basic types used for memory management.
//!
//! The types of interest are divided into three categories:
//! 1. addresses: `VirtualAddress` and `PhysicalAddress`.
//! 2. "chunk" types: `Page` and `Frame` (a frame number is a Pfn).
//! 3. half-open ranges of chunks: `PageRange` and `FrameRange`.
//!
//! Physical memory is accounted numerically; none of these types
//! are ever dereferenced.

#![no_std]

#[cfg(test)]
mod test;

use core::{
    fmt,
    ops::{Add, AddAssign, Sub, SubAssign},
};
use derive_more::*;
use kernel_config::memory::{PAGE_SHIFT, PAGE_SIZE};
use paste::paste;

/// A macro for defining `VirtualAddress` and `PhysicalAddress` structs
/// and implementing their common traits, which are generally identical.
macro_rules! implement_address {
    ($TypeName:ident, $desc:literal, $prefix:literal, $chunk:ident) => {
        paste! { // using the paste crate's macro for easy concatenation

            #[doc = "A " $desc " memory address, which is a `usize` under the hood."]
            #[derive(
                Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default,
                Binary, Octal, LowerHex, UpperHex,
                BitAnd, BitOr, BitXor, BitAndAssign, BitOrAssign, BitXorAssign,
            )]
            #[repr(transparent)]
            pub struct $TypeName(usize);

            impl $TypeName {
                #[doc = "Creates a new `" $TypeName "` with the given value."]
                pub const fn new(addr: usize) -> $TypeName {
                    $TypeName(addr)
                }

                #[doc = "Creates a new `" $TypeName "` with a value 0."]
                pub const fn zero() -> $TypeName {
                    $TypeName(0)
                }

                #[doc = "Returns the underlying `usize` value for this `" $TypeName "`."]
                #[inline]
                pub const fn value(&self) -> usize {
                    self.0
                }

                #[doc = "Returns the offset from the " $chunk " boundary specified by this `" $TypeName "`."]
                pub const fn [<$chunk _offset>](&self) -> usize {
                    self.0 & (PAGE_SIZE - 1)
                }
            }
            impl fmt::Debug for $TypeName {
                fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                    write!(f, concat!($prefix, "{:#X}"), self.0)
                }
            }
            impl fmt::Display for $TypeName {
                fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                    write!(f, "{:?}", self)
                }
            }
            impl Add<usize> for $TypeName {
                type Output = $TypeName;
                fn add(self, rhs: usize) -> $TypeName {
                    $TypeName(self.0.saturating_add(rhs))
                }
            }
            impl AddAssign<usize> for $TypeName {
                fn add_assign(&mut self, rhs: usize) {
                    *self = *self + rhs;
                }
            }
            impl Sub<usize> for $TypeName {
                type Output = $TypeName;
                fn sub(self, rhs: usize) -> $TypeName {
                    $TypeName(self.0.saturating_sub(rhs))
                }
            }
            impl SubAssign<usize> for $TypeName {
                fn sub_assign(&mut self, rhs: usize) {
                    *self = *self - rhs;
                }
            }
        }
    };
}

implement_address!(VirtualAddress, "virtual", "v", page);
implement_address!(PhysicalAddress, "physical", "p", frame);


/// A macro for defining `Page` and `Frame` structs
/// and implementing their common traits, which are generally identical.
macro_rules! implement_page_frame {
    ($TypeName:ident, $desc:literal, $prefix:literal, $address:ident) => {
        paste! {

            #[doc = "A `" $TypeName "` is a chunk of **" $desc "** memory aligned to a [`PAGE_SIZE`] boundary."]
            #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
            pub struct $TypeName {
                number: usize,
            }

            impl $TypeName {
                #[doc = "Creates the `" $TypeName "` with the given number."]
                pub const fn new(number: usize) -> $TypeName {
                    $TypeName { number }
                }

                #[doc = "Returns the `" $address "` at the start of this `" $TypeName "`."]
                pub const fn start_address(&self) -> $address {
                    $address::new(self.number << PAGE_SHIFT)
                }

                #[doc = "Returns the number of this `" $TypeName "`."]
                #[inline(always)]
                pub const fn number(&self) -> usize {
                    self.number
                }

                #[doc = "Returns the `" $TypeName "` containing the given `" $address "`."]
                pub const fn containing_address(addr: $address) -> $TypeName {
                    $TypeName { number: addr.value() >> PAGE_SHIFT }
                }

                #[doc = "Returns the first `" $TypeName "` that starts at or above the given `" $address "`."]
                pub const fn round_up(addr: $address) -> $TypeName {
                    $TypeName { number: (addr.value() + PAGE_SIZE - 1) >> PAGE_SHIFT }
                }

                #[doc = "Returns true if this `" $TypeName "` is aligned to a block of `2^order` chunks."]
                pub const fn is_aligned(&self, order: usize) -> bool {
                    self.number & ((1 << order) - 1) == 0
                }

                #[doc = "Rounds this `" $TypeName "` down to a block of `2^order` chunks."]
                pub const fn align_down(&self, order: usize) -> $TypeName {
                    $TypeName { number: self.number & !((1 << order) - 1) }
                }
            }
            impl fmt::Debug for $TypeName {
                fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                    write!(f, concat!(stringify!($TypeName), "({})"), self.number)
                }
            }
            impl Add<usize> for $TypeName {
                type Output = $TypeName;
                fn add(self, rhs: usize) -> $TypeName {
                    $TypeName { number: self.number.saturating_add(rhs) }
                }
            }
            impl AddAssign<usize> for $TypeName {
                fn add_assign(&mut self, rhs: usize) {
                    *self = *self + rhs;
                }
            }
            impl Sub<usize> for $TypeName {
                type Output = $TypeName;
                fn sub(self, rhs: usize) -> $TypeName {
                    $TypeName { number: self.number.saturating_sub(rhs) }
                }
            }
            impl SubAssign<usize> for $TypeName {
                fn sub_assign(&mut self, rhs: usize) {
                    *self = *self - rhs;
                }
            }
            #[doc = "The distance in chunks between two `" $TypeName "`s, saturating at zero."]
            impl Sub<$TypeName> for $TypeName {
                type Output = usize;
                fn sub(self, rhs: $TypeName) -> usize {
                    self.number.saturating_sub(rhs.number)
                }
            }
        }
    };
}

implement_page_frame!(Page, "virtual", "v", VirtualAddress);
implement_page_frame!(Frame, "physical", "p", PhysicalAddress);


/// A macro for defining `PageRange` and `FrameRange` structs
/// and implementing their common traits, which are generally identical.
macro_rules! implement_page_frame_range {
    ($TypeName:ident, $desc:literal, $chunk:ident, $address:ident) => {
        paste! {

            #[doc = "A half-open range `[start, end)` of [`" $chunk "`]s that are contiguous in " $desc " memory."]
            #[derive(Clone, Copy, PartialEq, Eq, Hash)]
            pub struct $TypeName {
                start: $chunk,
                end: $chunk,
            }

            impl $TypeName {
                #[doc = "Creates a new range of [`" $chunk "`]s from `start` (inclusive) to `end` (exclusive).\n\n \
                    If `end` is below `start` the range is empty."]
                pub const fn new(start: $chunk, end: $chunk) -> $TypeName {
                    if end.number < start.number {
                        $TypeName { start, end: start }
                    } else {
                        $TypeName { start, end }
                    }
                }

                #[doc = "Creates a range of `count` [`" $chunk "`]s beginning at `start`."]
                pub const fn with_len(start: $chunk, count: usize) -> $TypeName {
                    $TypeName::new(start, $chunk::new(start.number + count))
                }

                #[doc = "Creates an empty `" $TypeName "`."]
                pub const fn empty() -> $TypeName {
                    $TypeName::new($chunk::new(0), $chunk::new(0))
                }

                pub const fn start(&self) -> $chunk {
                    self.start
                }

                /// Returns the exclusive end bound.
                pub const fn end(&self) -> $chunk {
                    self.end
                }

                #[doc = "Returns the number of [`" $chunk "`]s in this range."]
                pub const fn [<size_in_ $chunk:lower s>](&self) -> usize {
                    self.end.number - self.start.number
                }

                /// Returns the size of this range in number of bytes.
                pub const fn size_in_bytes(&self) -> usize {
                    self.[<size_in_ $chunk:lower s>]() * PAGE_SIZE
                }

                pub const fn is_empty(&self) -> bool {
                    self.end.number == self.start.number
                }

                #[doc = "Returns `true` if this `" $TypeName "` contains the given [`" $chunk "`]."]
                pub const fn contains(&self, chunk: $chunk) -> bool {
                    chunk.number >= self.start.number && chunk.number < self.end.number
                }

                #[doc = "Returns `true` if this `" $TypeName "` contains the given [`" $address "`]."]
                pub const fn contains_address(&self, addr: $address) -> bool {
                    self.contains($chunk::containing_address(addr))
                }

                #[doc = "Returns true if any [`" $chunk "`] lies in both ranges."]
                pub const fn overlaps(&self, other: &$TypeName) -> bool {
                    self.start.number < other.end.number && other.start.number < self.end.number
                }

                #[doc = "Returns an iterator over every [`" $chunk "`] in this range."]
                pub fn iter(&self) -> impl Iterator<Item = $chunk> {
                    (self.start.number..self.end.number).map($chunk::new)
                }
            }
            impl fmt::Debug for $TypeName {
                fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                    write!(f, "[{}, {})", self.start.number, self.end.number)
                }
            }
        }
    };
}

implement_page_frame_range!(PageRange, "virtual", Page, VirtualAddress);
implement_page_frame_range!(FrameRange, "physical", Frame, PhysicalAddress);


/// A NUMA node id.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display, Debug)]
#[display(fmt = "node{}", _0)]
pub struct Nid(u8);

impl Nid {
    /// Matches every node when passed to an allocator.
    pub const ANY: Nid = Nid(u8::MAX);

    pub const fn new(nid: u8) -> Nid {
        Nid(nid)
    }

    pub const fn value(&self) -> u8 {
        self.0
    }

    /// Returns this node's index into per-node tables.
    pub const fn index(&self) -> usize {
        self.0 as usize
    }

    pub const fn is_any(&self) -> bool {
        self.0 == u8::MAX
    }

    /// Returns true if memory on node `other` satisfies a request for this node.
    pub const fn accepts(&self, other: Nid) -> bool {
        self.is_any() || self.0 == other.0
    }
}

impl Default for Nid {
    fn default() -> Nid {
        Nid(0)
    }
}
