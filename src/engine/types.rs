//! Core Residency Types, Identifiers, and Address Layout
//!
//! This module defines the **fundamental identifiers, address encoding, and
//! small enums** shared by every residency subsystem: the registry, the
//! duplication policy engine, the rebasing protocol and the lifetime guard.
//!
//! ## Address Representation
//!
//! Every block of data lives in exactly one *address space*. Addresses are
//! encoded as a single 64-bit value:
//!
//! ```text
//! | 0 | space | offset (62 bits) |
//! ```
//!
//! - **Space** (bit 62) is `0` for the host and `1` for the device.
//! - **Offset** is the byte position inside that space.
//!
//! Because the space is part of the value, an address can never be mistaken
//! for an address of the other space. Backing stores reject foreign
//! addresses outright, which makes "free a device pointer on the host" a
//! reported error rather than silent corruption.
//!
//! Pointer members of composite data are stored inside element bytes as
//! 8-byte little-endian addresses ([`POINTER_SIZE`]); the null address is
//! `0` in both spaces.
//!
//! ## Identifiers
//!
//! Allocations, views and execution contexts are identified by small,
//! copyable numeric IDs that are never reused during the life of a manager.
//!
//! ## Ranges
//!
//! Partial transfers and dirty declarations use [`ElementRange`], an
//! `[offset, offset + count)` range measured in *elements* of the owning
//! allocation (the `A[2:3]` notation of update directives: start and
//! count, not start and end).

use std::fmt;

/// Identifier for a registered allocation.
pub type AllocationID = u32;
/// Identifier for a view.
pub type ViewID = u64;
/// Identifier for an execution context.
pub type ContextID = u32;

/// The host thread context created together with every manager.
pub const HOST_CONTEXT: ContextID = 0;

/// Bit tagging an address as belonging to the device space.
pub const DEVICE_SPACE_BIT: u64 = 1 << 62;
/// Mask selecting the offset portion of an [`Address`].
pub const OFFSET_MASK: u64 = DEVICE_SPACE_BIT - 1;

/// First address handed out in the host space.
pub const HOST_BASE: u64 = 0x0000_0001_0000_0000;
/// First address handed out in the device space.
pub const DEVICE_BASE: u64 = DEVICE_SPACE_BIT | 0x0000_0001_0000_0000;

/// Size in bytes of a pointer member stored inside composite data.
pub const POINTER_SIZE: usize = 8;
/// Alignment of every block returned by a backing store.
pub const BLOCK_ALIGN: u64 = 64;

const _: [(); 1] = [(); (HOST_BASE & DEVICE_SPACE_BIT == 0) as usize];
const _: [(); 1] = [(); (DEVICE_BASE & DEVICE_SPACE_BIT != 0) as usize];
const _: [(); 1] = [(); (BLOCK_ALIGN.is_power_of_two()) as usize];

/// Physical address space a block lives in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AddressSpace {
    /// Host memory, shared by all thread contexts.
    Host,
    /// Accelerator memory, disjoint from the host.
    Device,
}

impl fmt::Display for AddressSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressSpace::Host => f.write_str("host"),
            AddressSpace::Device => f.write_str("device"),
        }
    }
}

/// A tagged address in either the host or the device space.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Address(u64);

impl Address {
    /// The null address.
    pub const NULL: Address = Address(0);

    /// Wraps a raw 64-bit address value.
    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        Address(raw)
    }

    /// Returns the raw 64-bit value, as stored inside pointer members.
    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Returns `true` for the null address.
    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Address space encoded in this address.
    #[inline]
    pub const fn space(self) -> AddressSpace {
        if self.0 & DEVICE_SPACE_BIT != 0 { AddressSpace::Device } else { AddressSpace::Host }
    }

    /// Returns the address `bytes` past `self`.
    #[inline]
    pub const fn add(self, bytes: usize) -> Address {
        Address(self.0 + bytes as u64)
    }

    /// Byte distance from `base` to `self`, if `self` is not below `base`
    /// and both share an address space.
    #[inline]
    pub fn offset_from(self, base: Address) -> Option<usize> {
        if self.space() != base.space() || self.0 < base.0 {
            return None;
        }
        Some((self.0 - base.0) as usize)
    }

    /// Encodes the address as pointer-member bytes.
    #[inline]
    pub const fn to_le_bytes(self) -> [u8; POINTER_SIZE] {
        self.0.to_le_bytes()
    }

    /// Decodes an address from pointer-member bytes.
    #[inline]
    pub const fn from_le_bytes(bytes: [u8; POINTER_SIZE]) -> Self {
        Address(u64::from_le_bytes(bytes))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{:#x}", self.space(), self.0 & OFFSET_MASK)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Kind of execution context.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ContextKind {
    /// A worker thread sharing the host address space.
    Thread,
    /// An accelerator with its own address space.
    Device,
}

impl ContextKind {
    /// Address space private buffers of this context kind are allocated in.
    #[inline]
    pub const fn address_space(self) -> AddressSpace {
        match self {
            ContextKind::Thread => AddressSpace::Host,
            ContextKind::Device => AddressSpace::Device,
        }
    }
}

impl fmt::Display for ContextKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContextKind::Thread => f.write_str("thread"),
            ContextKind::Device => f.write_str("device"),
        }
    }
}

/// An execution locus that can hold views.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ExecutionContext {
    /// Stable context identifier.
    pub id: ContextID,
    /// Thread or device.
    pub kind: ContextKind,
}

impl ExecutionContext {
    /// Address space this context allocates private buffers in.
    #[inline]
    pub const fn address_space(&self) -> AddressSpace {
        self.kind.address_space()
    }
}

/// How a context's view of an allocation is produced at region entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DuplicationMode {
    /// One instance, the host address, visible to every thread context.
    Shared,
    /// Snapshot at entry, discarded at exit.
    CopyIn,
    /// Snapshot at entry, reconciled with the host at exit.
    CopyInOut,
    /// Fresh zero-filled buffer with no relation to the original value.
    PrivateUninitialized,
}

impl fmt::Display for DuplicationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DuplicationMode::Shared => f.write_str("shared"),
            DuplicationMode::CopyIn => f.write_str("copy-in"),
            DuplicationMode::CopyInOut => f.write_str("copy-in-out"),
            DuplicationMode::PrivateUninitialized => f.write_str("private-uninitialized"),
        }
    }
}

/// Synchronization state of a view relative to host storage.
///
/// Derived from the ranges callers declared dirty. For thread private
/// copies, "device" refers to the context-side copy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SyncState {
    /// No declared pending writes on either side.
    Clean,
    /// The host holds declared writes the view has not received.
    HostDirty,
    /// The view holds declared writes the host has not received.
    DeviceDirty,
}

/// Direction of an explicit transfer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Transfer {
    /// Host storage to the view's copy (`update device`).
    Push,
    /// The view's copy to host storage (`update self`).
    Pull,
}

impl fmt::Display for Transfer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transfer::Push => f.write_str("push"),
            Transfer::Pull => f.write_str("pull"),
        }
    }
}

/// A `[offset, offset + count)` range of elements.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ElementRange {
    /// First element.
    pub offset: usize,
    /// Number of elements.
    pub count: usize,
}

impl ElementRange {
    /// Creates a range of `count` elements starting at `offset`.
    #[inline]
    pub const fn new(offset: usize, count: usize) -> Self {
        Self { offset, count }
    }

    /// The whole extent of an allocation with `len` elements.
    #[inline]
    pub const fn full(len: usize) -> Self {
        Self { offset: 0, count: len }
    }

    /// One past the last element, saturating at `usize::MAX`.
    #[inline]
    pub const fn end(&self) -> usize {
        self.offset.saturating_add(self.count)
    }

    /// One past the last element, or `None` if that overflows.
    #[inline]
    pub const fn checked_end(&self) -> Option<usize> {
        self.offset.checked_add(self.count)
    }

    /// Returns `true` if the range covers no elements.
    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Returns `true` if the two ranges share at least one element.
    #[inline]
    pub fn overlaps(&self, other: &ElementRange) -> bool {
        self.offset < other.end() && other.offset < self.end()
    }
}

impl fmt::Display for ElementRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}:{}]", self.offset, self.count)
    }
}

/// A set of disjoint, sorted element ranges.
///
/// Used for caller-declared dirty regions. Inserting merges touching ranges;
/// removing splits them.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RangeSet {
    ranges: Vec<ElementRange>,
}

impl RangeSet {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if no element is marked.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Sorted, disjoint ranges in the set.
    #[inline]
    pub fn ranges(&self) -> &[ElementRange] {
        &self.ranges
    }

    /// Returns `true` if any marked element falls inside `range`.
    pub fn overlaps(&self, range: &ElementRange) -> bool {
        self.ranges.iter().any(|r| r.overlaps(range))
    }

    /// Marks every element of `range`.
    pub fn insert(&mut self, range: ElementRange) {
        if range.is_empty() {
            return;
        }
        let mut start = range.offset;
        let mut end = range.end();
        let mut merged = Vec::with_capacity(self.ranges.len() + 1);
        let mut placed = false;

        for r in self.ranges.drain(..) {
            if r.end() < start {
                merged.push(r);
            } else if end < r.offset {
                if !placed {
                    merged.push(ElementRange::new(start, end - start));
                    placed = true;
                }
                merged.push(r);
            } else {
                start = start.min(r.offset);
                end = end.max(r.end());
            }
        }
        if !placed {
            merged.push(ElementRange::new(start, end - start));
        }
        self.ranges = merged;
    }

    /// Unmarks every element of `range`.
    pub fn remove(&mut self, range: &ElementRange) {
        if range.is_empty() {
            return;
        }
        let mut kept = Vec::with_capacity(self.ranges.len() + 1);
        for r in self.ranges.drain(..) {
            if !r.overlaps(range) {
                kept.push(r);
                continue;
            }
            if r.offset < range.offset {
                kept.push(ElementRange::new(r.offset, range.offset - r.offset));
            }
            if r.end() > range.end() {
                kept.push(ElementRange::new(range.end(), r.end() - range.end()));
            }
        }
        self.ranges = kept;
    }

    /// Unmarks everything and returns what was marked.
    pub fn take(&mut self) -> Vec<ElementRange> {
        std::mem::take(&mut self.ranges)
    }

    /// Unmarks everything.
    pub fn clear(&mut self) {
        self.ranges.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_space_is_encoded_in_the_value() {
        assert_eq!(Address::from_raw(HOST_BASE).space(), AddressSpace::Host);
        assert_eq!(Address::from_raw(DEVICE_BASE).space(), AddressSpace::Device);
        assert!(Address::NULL.is_null());
        assert_eq!(Address::from_raw(DEVICE_BASE).offset_from(Address::from_raw(HOST_BASE)), None);
    }

    #[test]
    fn range_set_merges_adjacent_and_overlapping_ranges() {
        let mut set = RangeSet::new();
        set.insert(ElementRange::new(4, 2));
        set.insert(ElementRange::new(0, 2));
        set.insert(ElementRange::new(2, 2));
        assert_eq!(set.ranges(), &[ElementRange::new(0, 6)]);

        set.insert(ElementRange::new(10, 1));
        assert_eq!(set.ranges(), &[ElementRange::new(0, 6), ElementRange::new(10, 1)]);
    }

    #[test]
    fn range_set_remove_splits_a_range() {
        let mut set = RangeSet::new();
        set.insert(ElementRange::new(0, 10));
        set.remove(&ElementRange::new(2, 3));
        assert_eq!(set.ranges(), &[ElementRange::new(0, 2), ElementRange::new(5, 5)]);
        assert!(!set.overlaps(&ElementRange::new(2, 3)));
        assert!(set.overlaps(&ElementRange::new(4, 2)));
    }
}
