//! # Duplication Policy Engine
//!
//! Decides, per allocation and per context, what a context's view is at
//! region entry and what happens to it at region exit.
//!
//! ## Modes
//!
//! | Mode | Entry | Exit |
//! |------|-------|------|
//! | `Shared` | host address, threads only | drop one holder |
//! | `CopyIn` | snapshot in a context-owned buffer | discard |
//! | `CopyInOut` | snapshot in a context-owned buffer | threads: copy declared ranges back; devices: must be pulled first |
//! | `PrivateUninitialized` | zero-filled buffer, statics resolved | discard |
//!
//! Thread snapshots are shallow: pointer members keep pointing at the host
//! blocks they pointed at, and class-level statics are reached through the
//! host. Device snapshots of layouts with pointer or static members go
//! through [`mirror_composite`](crate::engine::rebase::mirror_composite),
//! because host addresses mean nothing in the device space.
//!
//! The engine never releases storage. Every view it hands out is removed
//! through [`ResidencyRegistry::remove_view`], which frees only the view's
//! own buffers.
//!
//! ## Regions
//!
//! [`Region`] gathers the views of one parallel region and exits them
//! together. Dropping a region that was not exited discards its views
//! without any copy-out and logs a warning.

use crate::engine::descriptor::MemberKind;
use crate::engine::error::{ResidencyError, ResidencyResult};
use crate::engine::memory;
use crate::engine::rebase::{self, write_pointer};
use crate::engine::registry::{RegistryState, ResidencyRegistry, View};
use crate::engine::types::{
    AllocationID, ContextID, ContextKind, DuplicationMode, ExecutionContext, Transfer,
};
use crate::profiler;

/// Produces `context`'s view of `allocation` under `mode`.
///
/// ## Errors
///
/// * `UnsupportedMode` for `Shared` on a device context.
/// * `UseAfterRelease` if the allocation was released.
/// * `UnregisteredPointee`, `StaticNotMirrored` while mirroring to a device.
pub fn enter_region(
    registry: &ResidencyRegistry,
    allocation: AllocationID,
    context: ContextID,
    mode: DuplicationMode,
) -> ResidencyResult<View> {
    let _span = profiler::span("enter_region")
        .arg("allocation", profiler::Arg::U64(allocation as u64))
        .arg("mode", profiler::Arg::Str(mode.to_string()));

    let mut state = registry.write();
    let context = state.context(context)?;
    let has_pointers = state.live_entry(allocation)?.descriptor.layout().has_pointers();

    let view = match mode {
        DuplicationMode::Shared => state.shared_view(context, allocation)?,
        DuplicationMode::CopyIn | DuplicationMode::CopyInOut
            if context.kind == ContextKind::Device && has_pointers =>
        {
            rebase::mirror_composite_locked(registry, &mut state, allocation, context, mode)?
        }
        DuplicationMode::CopyIn | DuplicationMode::CopyInOut => {
            snapshot(registry, &mut state, allocation, context, mode)?
        }
        DuplicationMode::PrivateUninitialized => fresh(registry, &mut state, allocation, context)?,
    };

    tracing::debug!(
        allocation,
        context = context.id,
        view = view.id(),
        %mode,
        address = %view.address(),
        "entered region"
    );
    Ok(view)
}

/// Byte-for-byte copy of host storage into a new buffer in the context's
/// space.
fn snapshot(
    registry: &ResidencyRegistry,
    state: &mut RegistryState,
    allocation: AllocationID,
    context: ExecutionContext,
    mode: DuplicationMode,
) -> ResidencyResult<View> {
    let descriptor = &state.live_entry(allocation)?.descriptor;
    let (base, len) = (descriptor.base_address(), descriptor.byte_len());

    let stores = registry.stores();
    let store = stores.for_space(context.address_space())?;
    let buffer = store.raw_alloc(len)?;
    if let Err(e) = memory::copy(store, buffer, stores.host(), base, len) {
        let _ = store.raw_free(buffer);
        return Err(e.into());
    }
    Ok(state.insert_view(context, allocation, mode, buffer, len))
}

/// Zero-filled buffer whose static slots point at the class-level state the
/// context sees.
fn fresh(
    registry: &ResidencyRegistry,
    state: &mut RegistryState,
    allocation: AllocationID,
    context: ExecutionContext,
) -> ResidencyResult<View> {
    let descriptor = state.live_entry(allocation)?.descriptor.clone();
    let store = registry.stores().for_space(context.address_space())?;
    let buffer = store.raw_alloc(descriptor.byte_len())?;

    let resolved: ResidencyResult<()> = (|| {
        for member in descriptor.layout().members() {
            let MemberKind::StaticShared { name } = &member.kind else { continue };
            let target = rebase::static_address_locked(state, name, context.address_space())?;
            for element in 0..descriptor.element_count() {
                let slot = buffer.add(element * descriptor.element_size() + member.offset);
                write_pointer(store, slot, target)?;
            }
        }
        Ok(())
    })();
    if let Err(e) = resolved {
        let _ = store.raw_free(buffer);
        return Err(e);
    }

    Ok(state.insert_view(
        context,
        allocation,
        DuplicationMode::PrivateUninitialized,
        buffer,
        descriptor.byte_len(),
    ))
}

/// Ends `view`'s participation in its region.
///
/// Thread `CopyInOut` views copy the ranges declared device-dirty back to
/// the host first (value members only). A device `CopyInOut` view, or any
/// of its mirrored children, that still holds declared device writes fails
/// with `UnsyncedExit` and is left in place so the caller can pull and exit
/// again.
pub fn exit_region(registry: &ResidencyRegistry, view: &View) -> ResidencyResult<()> {
    let _span = profiler::span("exit_region").arg("view", profiler::Arg::U64(view.id()));

    let mut state = registry.write();
    let record = state.record(view.id())?;
    let (mode, kind, invalidated) = (record.view.mode(), record.view.context_kind(), record.invalidated);

    if mode == DuplicationMode::CopyInOut && !invalidated {
        match kind {
            ContextKind::Thread => {
                let ranges = record.device_dirty.ranges().to_vec();
                if !ranges.is_empty() {
                    let descriptor = state.live_entry(view.allocation())?.descriptor.clone();
                    let moved = rebase::transfer_ranges(
                        registry,
                        &descriptor,
                        record.view.address(),
                        &ranges,
                        Transfer::Pull,
                    )?;
                    tracing::debug!(view = view.id(), bytes = moved, "copied out");
                }
            }
            ContextKind::Device => {
                let unsynced = !record.device_dirty.is_empty()
                    || record
                        .children
                        .iter()
                        .filter_map(|c| state.views.get(c))
                        .any(|c| !c.device_dirty.is_empty());
                if unsynced {
                    return Err(ResidencyError::UnsyncedExit {
                        view: view.id(),
                        allocation: view.allocation(),
                    });
                }
            }
        }
    } else if mode == DuplicationMode::CopyInOut {
        tracing::warn!(
            view = view.id(),
            allocation = view.allocation(),
            "allocation released inside the region; copy-out skipped"
        );
    }

    registry.remove_view_locked(&mut state, view.id(), view.context())?;
    tracing::debug!(view = view.id(), %mode, "exited region");
    Ok(())
}

/// Scope collecting the views of one parallel region.
///
/// ```
/// use residency::prelude::*;
///
/// let manager = ResidencyManager::new(ResidencyConfig::default()).unwrap();
/// let data = manager.allocate_array(HOST_CONTEXT, &[1u32, 2, 3]).unwrap();
/// let worker = manager.create_context(ContextKind::Thread).unwrap();
///
/// let mut region = manager.region();
/// let view = region.enter(data, worker.id, DuplicationMode::CopyIn).unwrap();
/// assert_ne!(view.address(), manager.address_of(data, 0).unwrap());
/// region.exit().unwrap();
/// ```
pub struct Region<'r> {
    registry: &'r ResidencyRegistry,
    views: Vec<View>,
}

impl<'r> Region<'r> {
    /// Opens an empty region.
    pub fn new(registry: &'r ResidencyRegistry) -> Self {
        Self { registry, views: Vec::new() }
    }

    /// Enters `allocation` for `context` and keeps the view for exit.
    pub fn enter(
        &mut self,
        allocation: AllocationID,
        context: ContextID,
        mode: DuplicationMode,
    ) -> ResidencyResult<View> {
        let view = enter_region(self.registry, allocation, context, mode)?;
        self.views.push(view);
        Ok(view)
    }

    /// Views entered and not yet exited.
    #[inline]
    pub fn views(&self) -> &[View] {
        &self.views
    }

    /// Exits every view, most recent first.
    ///
    /// Views whose exit fails stay in the region; the first error is
    /// returned. Calling `exit` again retries them.
    pub fn exit(&mut self) -> ResidencyResult<()> {
        let mut first_error = None;
        let mut kept = Vec::new();
        while let Some(view) = self.views.pop() {
            if let Err(e) = exit_region(self.registry, &view) {
                first_error.get_or_insert(e);
                kept.push(view);
            }
        }
        kept.reverse();
        self.views = kept;
        first_error.map_or(Ok(()), Err)
    }
}

impl Drop for Region<'_> {
    fn drop(&mut self) {
        if self.views.is_empty() {
            return;
        }
        tracing::warn!(views = self.views.len(), "region dropped without exit; discarding views");
        for view in self.views.drain(..).rev() {
            if let Err(e) = self.registry.remove_view(&view) {
                tracing::warn!(view = view.id(), error = %e, "failed to discard view");
            }
        }
    }
}
