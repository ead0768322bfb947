//! # Engine Module
//!
//! Residency engine implementation.
//!
//! Layered leaves first:
//! - Types and errors
//! - Backing stores (host and device address spaces)
//! - Allocation descriptors and the lifetime guard
//! - Residency registry
//! - Rebasing protocol, duplication policy and statics
//! - Manager façade and the parallel loop driver
//!
//! Public API exposure is controlled by `lib.rs`.

pub mod types;
pub mod error;
pub mod memory;
pub mod descriptor;
pub mod guard;
pub mod registry;
pub mod rebase;
pub mod policy;
pub mod statics;
pub mod manager;
pub mod parallel;
