//! # Nested-Pointer Rebasing Protocol
//!
//! Mirrors composite data into another address space and keeps the mirror
//! in sync through explicit transfers.
//!
//! ## Mirroring
//!
//! [`mirror_composite`] produces a deep copy of an allocation for one
//! context:
//!
//! 1. allocate a same-shaped block in the context's address space,
//! 2. copy the host bytes verbatim,
//! 3. for every `OwnedPointer` slot, resolve the pointee allocation, mirror
//!    it (once per call, however many pointers lead into it) and rewrite the
//!    slot to `mirror_base + (pointer - host_base)`,
//! 4. for every `StaticShared` slot, substitute the static's device mirror
//!    (device contexts) or keep the host address (thread contexts).
//!
//! Interior pointers keep their offset, so the row pointers of a
//! pointer-to-pointer array land inside the mirror of the contiguous inner
//! block. Pointee mirrors become child views of the returned root view and
//! are removed together with it.
//!
//! ## Transfers
//!
//! [`push`] (host → view) and [`pull`] (view → host) move element ranges.
//! For layouts with pointer members only value members are moved, so a
//! rebased pointer is never overwritten by its host value and vice versa.
//!
//! Transfers are driven by caller-declared dirty ranges. Asking for a
//! transfer that nothing was declared dirty for is a `StaleView` error in
//! strict mode, and a warning otherwise.

use std::collections::HashMap;

use crate::engine::descriptor::{AllocationDescriptor, MemberKind};
use crate::engine::error::{
    ResidencyError, ResidencyResult, StaleViewError, UnsupportedModeError,
};
use crate::engine::memory::{self, BackingStore};
use crate::engine::registry::{BlockOwner, RegistryState, ResidencyRegistry, View};
use crate::engine::types::{
    Address, AddressSpace, AllocationID, ContextID, DuplicationMode, ElementRange,
    ExecutionContext, Transfer, ViewID, POINTER_SIZE,
};
use crate::profiler;

/// Reads a pointer slot.
pub(crate) fn read_pointer(store: &dyn BackingStore, slot: Address) -> ResidencyResult<Address> {
    let mut bytes = [0u8; POINTER_SIZE];
    store.read(slot, &mut bytes)?;
    Ok(Address::from_le_bytes(bytes))
}

/// Writes a pointer slot.
pub(crate) fn write_pointer(
    store: &dyn BackingStore,
    slot: Address,
    value: Address,
) -> ResidencyResult<()> {
    store.write(slot, &value.to_le_bytes())?;
    Ok(())
}

/// Resolves a static by name to the address `space` sees it at.
pub(crate) fn static_address_locked(
    state: &RegistryState,
    name: &str,
    space: AddressSpace,
) -> ResidencyResult<Address> {
    let id = *state
        .statics
        .get(name)
        .ok_or_else(|| ResidencyError::UnknownStatic(name.to_owned().into()))?;
    let entry = state.live_entry(id)?;
    match space {
        AddressSpace::Host => Ok(entry.descriptor.base_address()),
        AddressSpace::Device => entry
            .device_mirror
            .ok_or_else(|| ResidencyError::StaticNotMirrored(name.to_owned().into())),
    }
}

struct Mirroring<'r> {
    registry: &'r ResidencyRegistry,
    context: ExecutionContext,
    mode: DuplicationMode,
    mirrors: HashMap<AllocationID, (ViewID, Address)>,
    pending: Vec<AllocationID>,
    root: Option<ViewID>,
}

impl<'r> Mirroring<'r> {
    /// Allocates and fills the mirror of one allocation, or returns the one
    /// already made during this call.
    fn mirror(&mut self, state: &mut RegistryState, allocation: AllocationID) -> ResidencyResult<Address> {
        if let Some(&(_, base)) = self.mirrors.get(&allocation) {
            return Ok(base);
        }

        let (host_base, len) = {
            let entry = state.live_entry(allocation)?;
            (entry.descriptor.base_address(), entry.descriptor.byte_len())
        };
        let registry = self.registry;
        let stores = registry.stores();
        let store = stores.for_space(self.context.address_space())?;
        let buffer = store.raw_alloc(len)?;
        if let Err(e) = memory::copy(store, buffer, stores.host(), host_base, len) {
            let _ = store.raw_free(buffer);
            return Err(e.into());
        }

        let view = state.insert_view(self.context, allocation, self.mode, buffer, len);
        match self.root {
            None => self.root = Some(view.id()),
            Some(root) => state.adopt(root, view.id())?,
        }
        self.mirrors.insert(allocation, (view.id(), buffer));
        self.pending.push(allocation);
        Ok(buffer)
    }

    /// Rewrites every pointer slot of the mirror of `allocation`.
    fn rebase(&mut self, state: &mut RegistryState, allocation: AllocationID) -> ResidencyResult<()> {
        let descriptor = state.live_entry(allocation)?.descriptor.clone();
        let Some(&(_, mirror_base)) = self.mirrors.get(&allocation) else {
            return Ok(());
        };
        let registry = self.registry;
        let stores = registry.stores();
        let space = self.context.address_space();
        let store = stores.for_space(space)?;

        for element in 0..descriptor.element_count() {
            let element_offset = element * descriptor.element_size();
            for member in descriptor.layout().pointer_members() {
                let slot = element_offset + member.offset;
                let rebased = match &member.kind {
                    MemberKind::OwnedPointer => {
                        let pointer = read_pointer(stores.host(), descriptor.base_address().add(slot))?;
                        if pointer.is_null() {
                            continue;
                        }
                        let pointee = ResidencyRegistry::resolve_locked(state, pointer).map_err(|e| match e {
                            ResidencyError::Memory(_) => ResidencyError::UnregisteredPointee {
                                allocation,
                                address: pointer,
                            },
                            other => other,
                        })?;
                        if pointee.owner != BlockOwner::Allocation(pointee.allocation) {
                            return Err(ResidencyError::UnregisteredPointee { allocation, address: pointer });
                        }
                        self.mirror(state, pointee.allocation)?.add(pointee.offset)
                    }
                    MemberKind::StaticShared { name } => {
                        if space == AddressSpace::Host {
                            continue;
                        }
                        static_address_locked(state, name, space)?
                    }
                    MemberKind::Value => continue,
                };
                write_pointer(store, mirror_base.add(slot), rebased)?;
            }
        }
        Ok(())
    }

    fn run(&mut self, state: &mut RegistryState, allocation: AllocationID) -> ResidencyResult<()> {
        self.mirror(state, allocation)?;
        while let Some(next) = self.pending.pop() {
            self.rebase(state, next)?;
        }
        Ok(())
    }
}

/// Deep-copies `allocation` and everything its pointer members reach into
/// `context`'s address space.
///
/// Returns the root view; pointee mirrors are its children (see
/// [`mirrored_child`]). On failure every block allocated by the call is
/// returned to its store.
pub fn mirror_composite(
    registry: &ResidencyRegistry,
    allocation: AllocationID,
    context: ContextID,
    mode: DuplicationMode,
) -> ResidencyResult<View> {
    let mut state = registry.write();
    let context = state.context(context)?;
    mirror_composite_locked(registry, &mut state, allocation, context, mode)
}

pub(crate) fn mirror_composite_locked(
    registry: &ResidencyRegistry,
    state: &mut RegistryState,
    allocation: AllocationID,
    context: ExecutionContext,
    mode: DuplicationMode,
) -> ResidencyResult<View> {
    if mode == DuplicationMode::Shared {
        return Err(UnsupportedModeError { mode, kind: context.kind, operation: "mirror_composite" }.into());
    }
    let _span = profiler::span("mirror_composite").arg("allocation", profiler::Arg::U64(allocation as u64));

    let mut job = Mirroring {
        registry,
        context,
        mode,
        mirrors: HashMap::new(),
        pending: Vec::new(),
        root: None,
    };

    let result = job.run(state, allocation);
    let root = match (result, job.root) {
        (Ok(()), Some(root)) => root,
        (Err(e), Some(root)) => {
            let _ = registry.remove_view_locked(state, root, context.id);
            return Err(e);
        }
        (Err(e), None) => return Err(e),
        (Ok(()), None) => return Err(ResidencyError::UnknownAllocation(allocation)),
    };

    tracing::debug!(
        allocation,
        context = context.id,
        mirrored = job.mirrors.len(),
        "mirrored composite"
    );
    Ok(state.record(root)?.view)
}

/// Mirror of `allocation` made by the same [`mirror_composite`] call as
/// `root` (the root itself if `allocation` is the root's allocation).
pub fn mirrored_child(
    registry: &ResidencyRegistry,
    root: &View,
    allocation: AllocationID,
) -> ResidencyResult<View> {
    let state = registry.read();
    let record = state.valid_record(root.id())?;
    if record.view.allocation() == allocation {
        return Ok(record.view);
    }
    record
        .children
        .iter()
        .filter_map(|id| state.views.get(id))
        .find(|child| child.view.allocation() == allocation)
        .map(|child| child.view)
        .ok_or(ResidencyError::UnknownAllocation(allocation))
}

/// Copies `ranges` between host storage and a view's copy of `descriptor`.
///
/// Pointer-bearing layouts move value members only. Returns the number of
/// bytes moved.
pub(crate) fn transfer_ranges(
    registry: &ResidencyRegistry,
    descriptor: &AllocationDescriptor,
    view_base: Address,
    ranges: &[ElementRange],
    direction: Transfer,
) -> ResidencyResult<usize> {
    let stores = registry.stores();
    let host = stores.host();
    let view_store = stores.for_space(view_base.space())?;
    let (dst_store, src_store) = match direction {
        Transfer::Push => (view_store, host),
        Transfer::Pull => (host, view_store),
    };
    let host_base = descriptor.base_address();
    let (dst_base, src_base) = match direction {
        Transfer::Push => (view_base, host_base),
        Transfer::Pull => (host_base, view_base),
    };

    let mut moved = 0usize;
    for range in ranges {
        let (start, len) = descriptor.byte_span(range)?;
        if !descriptor.layout().has_pointers() {
            memory::copy(dst_store, dst_base.add(start), src_store, src_base.add(start), len)?;
            moved += len;
            continue;
        }
        for element in range.offset..range.end() {
            let element_offset = element * descriptor.element_size();
            for member in descriptor.layout().value_members() {
                let at = element_offset + member.offset;
                memory::copy(dst_store, dst_base.add(at), src_store, src_base.add(at), member.size)?;
                moved += member.size;
            }
        }
    }
    Ok(moved)
}

fn transfer(
    registry: &ResidencyRegistry,
    view: &View,
    range: Option<ElementRange>,
    direction: Transfer,
    strict: bool,
) -> ResidencyResult<usize> {
    let mut state = registry.write();
    let record = state.valid_record(view.id())?;
    if record.view.mode() == DuplicationMode::Shared {
        return Err(UnsupportedModeError {
            mode: DuplicationMode::Shared,
            kind: view.context_kind(),
            operation: match direction {
                Transfer::Push => "push",
                Transfer::Pull => "pull",
            },
        }
        .into());
    }
    let view_base = record.view.address();
    let dirty = match direction {
        Transfer::Push => &record.host_dirty,
        Transfer::Pull => &record.device_dirty,
    };
    let descriptor = state.live_entry(view.allocation())?.descriptor.clone();

    let declared = match range {
        None => !dirty.is_empty(),
        Some(r) => {
            descriptor.check_range(&r)?;
            dirty.overlaps(&r)
        }
    };
    let ranges = match range {
        Some(r) => vec![r],
        None if declared => dirty.ranges().to_vec(),
        None => vec![ElementRange::full(descriptor.element_count())],
    };

    if !declared {
        if strict {
            return Err(StaleViewError { view: view.id(), transfer: direction }.into());
        }
        tracing::warn!(view = view.id(), %direction, "transfer over a range never marked dirty");
    }

    let _span = profiler::span(match direction {
        Transfer::Push => "push",
        Transfer::Pull => "pull",
    })
    .arg("view", profiler::Arg::U64(view.id()))
    .arg("strict", profiler::Arg::Bool(strict));

    let moved = transfer_ranges(registry, &descriptor, view_base, &ranges, direction)?;

    let record = state.record_mut(view.id())?;
    for r in &ranges {
        record.host_dirty.remove(r);
        record.device_dirty.remove(r);
    }
    tracing::debug!(view = view.id(), %direction, ranges = ranges.len(), bytes = moved, "transfer");
    Ok(moved)
}

/// Copies host storage into the view's copy (`update device`).
///
/// `range` is `[offset, count)` in elements; `None` transfers every range
/// declared host-dirty. Returns the number of bytes moved.
pub fn push(
    registry: &ResidencyRegistry,
    view: &View,
    range: Option<ElementRange>,
    strict: bool,
) -> ResidencyResult<usize> {
    transfer(registry, view, range, Transfer::Push, strict)
}

/// Copies the view's copy back to host storage (`update self`).
///
/// `range` is `[offset, count)` in elements; `None` transfers every range
/// declared device-dirty. Returns the number of bytes moved.
pub fn pull(
    registry: &ResidencyRegistry,
    view: &View,
    range: Option<ElementRange>,
    strict: bool,
) -> ResidencyResult<usize> {
    transfer(registry, view, range, Transfer::Pull, strict)
}
