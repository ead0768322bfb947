//! # Residency
//!
//! Composite memory residency manager for parallel execution contexts.
//!
//! Worker threads share one address space, accelerators have their own.
//! Composite data (structs with array members, pointer-to-pointer arrays,
//! class-level statics) must be duplicated into those contexts selectively:
//! some parts replicated per context, some parts left as one shared
//! instance. This crate tracks every such duplication so that:
//! - storage is released exactly once, and only by its owner
//! - pointers inside device copies point into device memory
//! - host and device copies are reconciled only through explicit transfers
//!
//! ## Quick tour
//!
//! ```
//! use residency::prelude::*;
//!
//! let config = ResidencyConfig::builder().device(DeviceBackend::Simulated).build().unwrap();
//! let manager = ResidencyManager::new(config).unwrap();
//!
//! // struct grid { int64 n; double *x; }
//! let x = manager.allocate_array(HOST_CONTEXT, &[0.5f64, 1.5, 2.5, 3.5]).unwrap();
//! let grid = manager
//!     .allocate_composite(HOST_CONTEXT, 1, 16, vec![
//!         CompositeMember::value(0, 8),
//!         CompositeMember::owned_pointer(8),
//!     ])
//!     .unwrap();
//! let x_addr = manager.address_of(x, 0).unwrap();
//! manager.write_host(grid, 0, &[[4u64, x_addr.raw()]]).unwrap();
//!
//! let gpu = manager.create_context(ContextKind::Device).unwrap();
//! let mirror = manager.mirror_composite(grid, gpu.id).unwrap();
//! assert_eq!(mirror.address().space(), AddressSpace::Device);
//! assert_eq!(manager.deref_member::<f64>(&mirror, 0, 8, 2).unwrap(), 2.5);
//! manager.remove_view(&mirror).unwrap();
//! ```
//!
//! This crate builds as both:
//! - `rlib` (for Rust usage & integration tests)
//! - `cdylib` (for FFI / DLL usage)

#![forbid(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![allow(clippy::module_inception)]

pub mod config;
pub mod engine;
pub mod profiling;

#[cfg(feature = "gpu")]
pub mod gpu;

pub use profiling::profiler;

// ─────────────────────────────────────────────────────────────────────────────
// Re-exports (Public API)
// ─────────────────────────────────────────────────────────────────────────────

// Façade

pub use engine::manager::{
    MatrixAllocation,
    ResidencyManager,
};

pub use engine::policy::{
    enter_region,
    exit_region,
    Region,
};

pub use engine::parallel::parallel_for;

// Building blocks

pub use engine::registry::{
    BlockOwner,
    Resolved,
    ResidencyRegistry,
    Stores,
    View,
};

pub use engine::descriptor::{
    AllocationDescriptor,
    CompositeMember,
    ElementLayout,
    MemberKind,
};

pub use engine::guard::{
    LifetimeGuard,
    Lifecycle,
};

pub use engine::memory::{
    BackingStore,
    BlockArena,
};

pub use config::{
    ConfigError,
    DeviceBackend,
    ResidencyConfig,
};

pub use engine::error::{
    ResidencyResult,
    ResidencyError,
    MemoryError,
    NotOwnerError,
    DoubleReleaseError,
    UseAfterReleaseError,
    UnsupportedModeError,
    StaleViewError,
};

pub use engine::types::{
    Address,
    AddressSpace,
    AllocationID,
    ContextID,
    ContextKind,
    DuplicationMode,
    ElementRange,
    ExecutionContext,
    SyncState,
    Transfer,
    ViewID,
    HOST_CONTEXT,
};

// ─────────────────────────────────────────────────────────────────────────────
// Prelude
// ─────────────────────────────────────────────────────────────────────────────

/// Commonly used residency types.
///
/// Import with:
/// ```rust
/// use residency::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{
        AddressSpace,
        CompositeMember,
        ContextKind,
        DeviceBackend,
        DuplicationMode,
        ElementRange,
        Region,
        ResidencyConfig,
        ResidencyError,
        ResidencyManager,
        ResidencyResult,
        SyncState,
        View,
        HOST_CONTEXT,
    };
}
