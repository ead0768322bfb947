//! Error types for residency, duplication and lifetime operations.
//!
//! This module declares focused, composable error types used across the
//! registry, the duplication policy engine, the rebasing protocol and the
//! lifetime guard. Each error carries enough context to make a protocol
//! violation actionable, and converts into the aggregate [`ResidencyError`]
//! so higher-level code can use `?` throughout.
//!
//! ## Taxonomy
//! * **Ownership:** [`NotOwnerError`], [`DoubleReleaseError`],
//!   [`UseAfterReleaseError`]: lifetime guard violations.
//! * **Policy:** [`UnsupportedModeError`], a duplication mode the target
//!   context cannot honour (e.g. `Shared` on a device).
//! * **Synchronization:** [`StaleViewError`], a push/pull over a range never
//!   declared dirty in that direction.
//! * **Memory:** [`MemoryError`], failures reported by a backing store.
//!
//! None of these are transient. They indicate a caller-side protocol
//! violation and are never retried; the surrounding driver decides whether
//! to treat them as fatal.
//!
//! ## Display vs. Debug
//! * [`fmt::Display`] is short and suitable for logs.
//! * [`fmt::Debug`] (derived) retains full structure for diagnostics.

use std::borrow::Cow;
use std::fmt;

use crate::config::ConfigError;
use crate::engine::types::{
    Address, AddressSpace, AllocationID, ContextID, ContextKind, DuplicationMode, Transfer, ViewID,
};

/// Returned when a context other than the owner attempts to release an
/// allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotOwnerError {
    /// Allocation whose release was attempted.
    pub allocation: AllocationID,

    /// The only context allowed to release it.
    pub owner: ContextID,

    /// Context that attempted the release.
    pub caller: ContextID,
}

impl fmt::Display for NotOwnerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "context {} cannot release allocation {} owned by context {}",
            self.caller, self.allocation, self.owner
        )
    }
}

impl std::error::Error for NotOwnerError {}

/// Returned when an allocation is released a second time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DoubleReleaseError {
    /// Allocation that was already released.
    pub allocation: AllocationID,
}

impl fmt::Display for DoubleReleaseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "allocation {} was already released", self.allocation)
    }
}

impl std::error::Error for DoubleReleaseError {}

/// Returned when a view, mirror or member access targets an allocation
/// that has been released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UseAfterReleaseError {
    /// Released allocation.
    pub allocation: AllocationID,
}

impl fmt::Display for UseAfterReleaseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "allocation {} used after release", self.allocation)
    }
}

impl std::error::Error for UseAfterReleaseError {}

/// Returned when a context kind cannot honour a duplication mode or an
/// operation is meaningless for a view's mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnsupportedModeError {
    /// Requested or existing mode.
    pub mode: DuplicationMode,

    /// Kind of the context involved.
    pub kind: ContextKind,

    /// Operation that was refused.
    pub operation: &'static str,
}

impl fmt::Display for UnsupportedModeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} is not supported for {} views on a {} context",
            self.operation, self.mode, self.kind
        )
    }
}

impl std::error::Error for UnsupportedModeError {}

/// Returned when a push or pull is requested over a range that was never
/// declared dirty in that direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaleViewError {
    /// View the transfer targeted.
    pub view: ViewID,

    /// Requested direction.
    pub transfer: Transfer,
}

impl fmt::Display for StaleViewError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let side = match self.transfer {
            Transfer::Push => "host",
            Transfer::Pull => "device",
        };
        write!(
            f,
            "{} requested on view {} but nothing was marked {side}-dirty",
            self.transfer, self.view
        )
    }
}

impl std::error::Error for StaleViewError {}

/// Failures reported by a backing store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemoryError {
    /// The address belongs to the other address space.
    ForeignAddress {
        /// Offending address.
        address: Address,

        /// Space of the store that rejected it.
        store: AddressSpace,
    },

    /// No live block contains the address.
    UnknownAddress {
        /// Offending address.
        address: Address,
    },

    /// The access runs past the end of the containing block.
    OutOfBounds {
        /// Start of the access.
        address: Address,

        /// Length of the access in bytes.
        bytes: usize,

        /// Bytes available from `address` to the end of its block.
        available: usize,
    },

    /// `raw_free` was given an address inside a block rather than its base.
    NotBlockBase {
        /// Offending address.
        address: Address,
    },

    /// The store's capacity would be exceeded.
    OutOfMemory {
        /// Bytes requested.
        requested: usize,

        /// Bytes still available.
        available: usize,
    },

    /// The underlying device backend failed.
    Backend {
        /// Backend-specific description.
        message: Cow<'static, str>,
    },
}

impl fmt::Display for MemoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryError::ForeignAddress { address, store } => {
                write!(f, "address {address} does not belong to the {store} store")
            }
            MemoryError::UnknownAddress { address } => {
                write!(f, "no live block contains address {address}")
            }
            MemoryError::OutOfBounds { address, bytes, available } => write!(
                f,
                "access of {bytes} bytes at {address} exceeds block ({available} bytes available)"
            ),
            MemoryError::NotBlockBase { address } => {
                write!(f, "address {address} is not the base of a block")
            }
            MemoryError::OutOfMemory { requested, available } => write!(
                f,
                "out of memory ({requested} bytes requested; {available} available)"
            ),
            MemoryError::Backend { message } => write!(f, "backend failure: {message}"),
        }
    }
}

impl std::error::Error for MemoryError {}

/// Aggregate error for every residency operation.
///
/// Low-level errors convert into this type via `From`, so manager, policy
/// and rebasing code can bubble failures with `?` and callers can match on
/// the precise variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResidencyError {
    /// Release attempted by a non-owning context.
    NotOwner(NotOwnerError),

    /// Release attempted on an already released allocation.
    DoubleRelease(DoubleReleaseError),

    /// Access through a view or pointer whose allocation was released.
    UseAfterRelease(UseAfterReleaseError),

    /// Mode not supported by the context kind or operation.
    UnsupportedMode(UnsupportedModeError),

    /// Push/pull over a range never marked dirty in that direction.
    StaleView(StaleViewError),

    /// A device copy-in-out view was exited while still device-dirty.
    UnsyncedExit {
        /// View that still holds unsynchronized writes.
        view: ViewID,

        /// Allocation the view mirrors.
        allocation: AllocationID,
    },

    /// No allocation with this ID was ever registered.
    UnknownAllocation(AllocationID),

    /// No live view with this ID exists.
    UnknownView(ViewID),

    /// No context with this ID exists.
    UnknownContext(ContextID),

    /// A context still holding views was retired.
    ContextBusy {
        /// Context being retired.
        context: ContextID,

        /// Number of views it still holds.
        views: usize,
    },

    /// An element range fell outside the allocation.
    RangeOutOfBounds {
        /// Allocation addressed.
        allocation: AllocationID,

        /// First element requested.
        offset: usize,

        /// Number of elements requested.
        count: usize,

        /// Element count of the allocation.
        len: usize,
    },

    /// A typed access used a type whose size differs from the addressed slot.
    ElementSizeMismatch {
        /// Allocation addressed.
        allocation: AllocationID,

        /// Size of the slot in bytes.
        expected: usize,

        /// Size of the provided type in bytes.
        actual: usize,
    },

    /// A composite member does not fit its element or is not a pointer.
    InvalidMember {
        /// Allocation whose layout was addressed.
        allocation: AllocationID,

        /// Byte offset of the member inside the element.
        offset: usize,
    },

    /// A pointer member refers to memory no registered allocation contains.
    UnregisteredPointee {
        /// Allocation holding the pointer.
        allocation: AllocationID,

        /// Pointer value found.
        address: Address,
    },

    /// No static with this name was declared.
    UnknownStatic(Cow<'static, str>),

    /// A static with this name already exists.
    DuplicateStatic(Cow<'static, str>),

    /// A static was resolved for a device but never mirrored there.
    StaticNotMirrored(Cow<'static, str>),

    /// A device context or mirror was requested but no device store exists.
    NoDeviceStore,

    /// A backing store operation failed.
    Memory(MemoryError),

    /// The manager configuration was rejected.
    Config(ConfigError),
}

impl fmt::Display for ResidencyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResidencyError::NotOwner(e) => write!(f, "{e}"),
            ResidencyError::DoubleRelease(e) => write!(f, "{e}"),
            ResidencyError::UseAfterRelease(e) => write!(f, "{e}"),
            ResidencyError::UnsupportedMode(e) => write!(f, "{e}"),
            ResidencyError::StaleView(e) => write!(f, "{e}"),
            ResidencyError::UnsyncedExit { view, allocation } => write!(
                f,
                "view {view} of allocation {allocation} exited with unsynchronized device writes"
            ),
            ResidencyError::UnknownAllocation(id) => write!(f, "unknown allocation {id}"),
            ResidencyError::UnknownView(id) => write!(f, "unknown view {id}"),
            ResidencyError::UnknownContext(id) => write!(f, "unknown context {id}"),
            ResidencyError::ContextBusy { context, views } => {
                write!(f, "context {context} still holds {views} views")
            }
            ResidencyError::RangeOutOfBounds { allocation, offset, count, len } => write!(
                f,
                "range [{offset}:{count}] out of bounds for allocation {allocation} of {len} elements"
            ),
            ResidencyError::ElementSizeMismatch { allocation, expected, actual } => write!(
                f,
                "element size mismatch on allocation {allocation}: expected {expected} bytes, got {actual}"
            ),
            ResidencyError::InvalidMember { allocation, offset } => {
                write!(f, "no suitable member at offset {offset} in allocation {allocation}")
            }
            ResidencyError::UnregisteredPointee { allocation, address } => write!(
                f,
                "allocation {allocation} holds pointer {address} into unregistered memory"
            ),
            ResidencyError::UnknownStatic(name) => write!(f, "unknown static `{name}`"),
            ResidencyError::DuplicateStatic(name) => write!(f, "static `{name}` already declared"),
            ResidencyError::StaticNotMirrored(name) => {
                write!(f, "static `{name}` has no device mirror")
            }
            ResidencyError::NoDeviceStore => f.write_str("no device store configured"),
            ResidencyError::Memory(e) => write!(f, "{e}"),
            ResidencyError::Config(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for ResidencyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ResidencyError::Memory(e) => Some(e),
            ResidencyError::Config(e) => Some(e),
            _ => None,
        }
    }
}

impl From<NotOwnerError> for ResidencyError {
    fn from(e: NotOwnerError) -> Self { ResidencyError::NotOwner(e) }
}
impl From<DoubleReleaseError> for ResidencyError {
    fn from(e: DoubleReleaseError) -> Self { ResidencyError::DoubleRelease(e) }
}
impl From<UseAfterReleaseError> for ResidencyError {
    fn from(e: UseAfterReleaseError) -> Self { ResidencyError::UseAfterRelease(e) }
}
impl From<UnsupportedModeError> for ResidencyError {
    fn from(e: UnsupportedModeError) -> Self { ResidencyError::UnsupportedMode(e) }
}
impl From<StaleViewError> for ResidencyError {
    fn from(e: StaleViewError) -> Self { ResidencyError::StaleView(e) }
}
impl From<MemoryError> for ResidencyError {
    fn from(e: MemoryError) -> Self { ResidencyError::Memory(e) }
}
impl From<ConfigError> for ResidencyError {
    fn from(e: ConfigError) -> Self { ResidencyError::Config(e) }
}

/// Result alias used throughout the crate.
pub type ResidencyResult<T> = Result<T, ResidencyError>;
