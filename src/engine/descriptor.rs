//! Allocation descriptors and composite layouts.
//!
//! An [`AllocationDescriptor`] names one logical block of host data: a
//! scalar, an array, or an array of composite elements. The
//! [`ElementLayout`] tells the rebasing protocol which bytes of each element
//! are plain values and which are pointers that must be rewritten when the
//! element is mirrored into another address space.
//!
//! ## Layout examples
//!
//! ```text
//! struct grid { int N; double *X; }        Composite[value(0, 8), owned_pointer(8)]
//! double **A  (row pointers)               Composite[owned_pointer(0)], one per row
//! class c_test { static long* dataset; }   Composite[static_shared(0, "c_test::dataset")]
//! long dataset[100]                        Plain
//! ```

use std::borrow::Cow;

use crate::engine::error::{ResidencyError, ResidencyResult};
use crate::engine::types::{Address, AllocationID, ContextID, ElementRange, POINTER_SIZE};

/// What a composite member holds.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum MemberKind {
    /// Plain bytes, copied verbatim.
    Value,

    /// Pointer to a separately allocated block; rebased when mirrored.
    OwnedPointer,

    /// Pointer to class-level state registered under `name`; never
    /// duplicated, only resolved per address space.
    StaticShared {
        /// Stable name of the static.
        name: Cow<'static, str>,
    },
}

/// One field of a composite element.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CompositeMember {
    /// Byte offset inside the element.
    pub offset: usize,
    /// Size in bytes.
    pub size: usize,
    /// Value, owned pointer or static.
    pub kind: MemberKind,
}

impl CompositeMember {
    /// A plain value member.
    pub fn value(offset: usize, size: usize) -> Self {
        Self { offset, size, kind: MemberKind::Value }
    }

    /// A pointer to a dynamically allocated block.
    pub fn owned_pointer(offset: usize) -> Self {
        Self { offset, size: POINTER_SIZE, kind: MemberKind::OwnedPointer }
    }

    /// A pointer to the static registered as `name`.
    pub fn static_shared(offset: usize, name: impl Into<Cow<'static, str>>) -> Self {
        Self {
            offset,
            size: POINTER_SIZE,
            kind: MemberKind::StaticShared { name: name.into() },
        }
    }

    /// Returns `true` for owned-pointer and static members.
    #[inline]
    pub fn is_pointer(&self) -> bool {
        !matches!(self.kind, MemberKind::Value)
    }

    #[inline]
    fn end(&self) -> usize {
        self.offset.saturating_add(self.size)
    }
}

/// Interpretation of each element's bytes.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum ElementLayout {
    /// Opaque bytes.
    #[default]
    Plain,

    /// Described member by member.
    Composite(Vec<CompositeMember>),
}

impl ElementLayout {
    /// Members of a composite layout; empty for plain data.
    pub fn members(&self) -> &[CompositeMember] {
        match self {
            ElementLayout::Plain => &[],
            ElementLayout::Composite(members) => members,
        }
    }

    /// Returns `true` if any member must be rebased or resolved.
    pub fn has_pointers(&self) -> bool {
        self.members().iter().any(CompositeMember::is_pointer)
    }

    /// Pointer members, in declaration order.
    pub fn pointer_members(&self) -> impl Iterator<Item = &CompositeMember> {
        self.members().iter().filter(|m| m.is_pointer())
    }

    /// Value members, in declaration order.
    pub fn value_members(&self) -> impl Iterator<Item = &CompositeMember> {
        self.members().iter().filter(|m| !m.is_pointer())
    }
}

/// Identifies one logical block of host data.
///
/// The `owner_context` is fixed when the descriptor is built; there is no
/// way to change it afterwards.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AllocationDescriptor {
    id: AllocationID,
    base_address: Address,
    element_count: usize,
    element_size: usize,
    owner_context: ContextID,
    layout: ElementLayout,
}

impl AllocationDescriptor {
    /// Describes `element_count` elements of `element_size` bytes at
    /// `base_address`, releasable only by `owner_context`.
    ///
    /// The ID is assigned when the descriptor is registered.
    pub fn new(
        base_address: Address,
        element_count: usize,
        element_size: usize,
        owner_context: ContextID,
    ) -> Self {
        Self {
            id: 0,
            base_address,
            element_count,
            element_size,
            owner_context,
            layout: ElementLayout::Plain,
        }
    }

    /// Attaches a per-element layout (builder-style).
    pub fn with_layout(mut self, layout: ElementLayout) -> Self {
        self.layout = layout;
        self
    }

    pub(crate) fn assign_id(&mut self, id: AllocationID) {
        self.id = id;
    }

    /// Registered ID.
    #[inline]
    pub fn id(&self) -> AllocationID {
        self.id
    }

    /// Host address of element 0.
    #[inline]
    pub fn base_address(&self) -> Address {
        self.base_address
    }

    /// Number of elements.
    #[inline]
    pub fn element_count(&self) -> usize {
        self.element_count
    }

    /// Size of one element in bytes.
    #[inline]
    pub fn element_size(&self) -> usize {
        self.element_size
    }

    /// The only context allowed to release this allocation.
    #[inline]
    pub fn owner_context(&self) -> ContextID {
        self.owner_context
    }

    /// Per-element layout.
    #[inline]
    pub fn layout(&self) -> &ElementLayout {
        &self.layout
    }

    /// Total size in bytes.
    #[inline]
    pub fn byte_len(&self) -> usize {
        self.element_count.saturating_mul(self.element_size)
    }

    /// Total size in bytes, or `None` if it does not fit in `usize`.
    pub fn checked_byte_len(&self) -> Option<usize> {
        self.element_count.checked_mul(self.element_size)
    }

    /// Returns `true` if `address` lies inside the host block.
    pub fn contains(&self, address: Address) -> bool {
        address
            .offset_from(self.base_address)
            .is_some_and(|offset| offset < self.byte_len())
    }

    /// Checks `range` against the element count.
    pub fn check_range(&self, range: &ElementRange) -> ResidencyResult<()> {
        let fits = match range.checked_end() {
            Some(end) => end <= self.element_count,
            None => false,
        };
        if !fits {
            return Err(ResidencyError::RangeOutOfBounds {
                allocation: self.id,
                offset: range.offset,
                count: range.count,
                len: self.element_count,
            });
        }
        Ok(())
    }

    /// Byte offset and length of `range`.
    pub fn byte_span(&self, range: &ElementRange) -> ResidencyResult<(usize, usize)> {
        self.check_range(range)?;
        match (range.offset.checked_mul(self.element_size), range.count.checked_mul(self.element_size)) {
            (Some(start), Some(len)) => Ok((start, len)),
            _ => Err(ResidencyError::RangeOutOfBounds {
                allocation: self.id,
                offset: range.offset,
                count: range.count,
                len: self.element_count,
            }),
        }
    }

    /// Checks that every member fits inside an element and that members
    /// do not overlap.
    pub fn validate_layout(&self) -> ResidencyResult<()> {
        let mut members: Vec<&CompositeMember> = self.layout.members().iter().collect();
        members.sort_by_key(|m| m.offset);

        let mut cursor = 0usize;
        for member in members {
            if member.offset < cursor || member.end() > self.element_size || member.size == 0 {
                return Err(ResidencyError::InvalidMember {
                    allocation: self.id,
                    offset: member.offset,
                });
            }
            cursor = member.end();
        }
        Ok(())
    }

    /// Pointer member at `offset`, if one exists.
    pub fn pointer_member(&self, offset: usize) -> ResidencyResult<&CompositeMember> {
        self.layout
            .pointer_members()
            .find(|m| m.offset == offset)
            .ok_or(ResidencyError::InvalidMember { allocation: self.id, offset })
    }
}
