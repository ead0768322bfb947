//! Residency manager: the single entry point of the crate.
//!
//! [`ResidencyManager`] owns the backing stores, the registry and the
//! configuration, and exposes every residency operation as a method:
//!
//! * allocation helpers (`allocate_array`, `allocate_composite`,
//!   `allocate_matrix`) that reserve host storage and register it,
//! * region entry/exit and [`Region`] scopes,
//! * composite mirroring and explicit push/pull,
//! * class-level statics,
//! * typed element and member access through views.
//!
//! ## Typed access
//!
//! Element types are plain-old-data (`bytemuck::Pod`). The size of the type
//! must equal the element size of the allocation (or of the member, for
//! member access); a mismatch is reported as `ElementSizeMismatch` rather
//! than reinterpreted. Access goes through the view's own address, so a
//! thread `CopyIn` view reads its snapshot, a `Shared` view reads host
//! storage, and a device mirror reads device memory.
//!
//! Writes never mark anything dirty. Callers declare what they changed with
//! [`ResidencyManager::mark_device_dirty`] / [`ResidencyManager::mark_host_dirty`].
//!
//! ## Concurrency model
//!
//! The manager is `Sync`. Thread contexts may read and write through their
//! views from many rayon workers at once; structural operations (region
//! entry/exit, release) serialize on the registry's write lock.

use std::mem::size_of;
use std::sync::Arc;

use bytemuck::Pod;

use crate::config::{DeviceBackend, ResidencyConfig};
use crate::engine::descriptor::{AllocationDescriptor, CompositeMember, ElementLayout};
use crate::engine::error::{MemoryError, ResidencyError, ResidencyResult};
use crate::engine::guard::Lifecycle;
use crate::engine::memory::{BackingStore, BlockArena};
use crate::engine::policy::{self, Region};
use crate::engine::rebase::{self, read_pointer};
use crate::engine::registry::{RegistryState, ResidencyRegistry, Stores, View};
use crate::engine::statics::{self, StaticDecl};
use crate::engine::types::{
    Address, AllocationID, ContextID, ContextKind, DuplicationMode, ElementRange,
    ExecutionContext, SyncState, POINTER_SIZE,
};

/// A pointer-to-pointer matrix: `rows` holds one pointer per row into the
/// contiguous `data` block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MatrixAllocation {
    /// Row pointer array (`Composite[owned_pointer(0)]`, one element per row).
    pub rows: AllocationID,
    /// Contiguous `rows * cols` element block.
    pub data: AllocationID,
    /// Elements per row.
    pub cols: usize,
}

/// Owner of all residency state.
pub struct ResidencyManager {
    config: ResidencyConfig,
    registry: ResidencyRegistry,
}

impl ResidencyManager {
    /// Creates a manager with stores built from `config`.
    ///
    /// ## Errors
    /// * `Config` if the configuration does not validate.
    /// * `Memory(Backend)` if the wgpu device cannot be opened.
    pub fn new(config: ResidencyConfig) -> ResidencyResult<Self> {
        config.validate()?;
        let host = BlockArena::host(config.host_capacity);
        let device: Option<Arc<dyn BackingStore>> = match config.device {
            DeviceBackend::None => None,
            DeviceBackend::Simulated => Some(BlockArena::device(config.device_capacity)),
            #[cfg(feature = "gpu")]
            DeviceBackend::Wgpu => Some(Arc::new(crate::gpu::WgpuMemory::open(config.device_capacity)?)),
            #[cfg(not(feature = "gpu"))]
            DeviceBackend::Wgpu => None,
        };
        Self::with_stores(config, Stores::new(host, device))
    }

    /// Creates a manager over caller-provided stores.
    pub fn with_stores(config: ResidencyConfig, stores: Stores) -> ResidencyResult<Self> {
        config.validate()?;
        tracing::debug!(
            host = stores.host().label(),
            device = stores.device().map(|d| d.label()).unwrap_or("none"),
            strict_sync = config.strict_sync,
            "residency manager created"
        );
        Ok(Self { config, registry: ResidencyRegistry::new(stores) })
    }

    /// Active configuration.
    #[inline]
    pub fn config(&self) -> &ResidencyConfig {
        &self.config
    }

    /// Underlying registry.
    #[inline]
    pub fn registry(&self) -> &ResidencyRegistry {
        &self.registry
    }

    // ─────────────────────────────────────────────────────────────────────
    // Contexts
    // ─────────────────────────────────────────────────────────────────────

    /// Creates a thread or device context.
    pub fn create_context(&self, kind: ContextKind) -> ResidencyResult<ExecutionContext> {
        self.registry.create_context(kind)
    }

    /// Looks up a context.
    pub fn context(&self, id: ContextID) -> ResidencyResult<ExecutionContext> {
        self.registry.context(id)
    }

    /// Retires a context that no longer holds views.
    pub fn retire_context(&self, id: ContextID) -> ResidencyResult<()> {
        self.registry.retire_context(id)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Allocation
    // ─────────────────────────────────────────────────────────────────────

    /// Registers a descriptor of host storage the caller allocated from
    /// the host store.
    pub fn register(&self, descriptor: AllocationDescriptor) -> ResidencyResult<AllocationID> {
        self.registry.register(descriptor)
    }

    /// Reserves zero-filled host storage and registers it.
    pub fn allocate(
        &self,
        owner: ContextID,
        element_count: usize,
        element_size: usize,
        layout: ElementLayout,
    ) -> ResidencyResult<AllocationID> {
        let host = self.registry.stores().host();
        let bytes = element_count
            .checked_mul(element_size)
            .ok_or(MemoryError::OutOfMemory { requested: usize::MAX, available: 0 })?;
        let base = host.raw_alloc(bytes)?;
        let descriptor = AllocationDescriptor::new(base, element_count, element_size, owner).with_layout(layout);
        self.registry.register(descriptor).map_err(|e| {
            let _ = host.raw_free(base);
            e
        })
    }

    /// Allocates and registers an array initialised from `values`.
    pub fn allocate_array<T: Pod>(&self, owner: ContextID, values: &[T]) -> ResidencyResult<AllocationID> {
        let id = self.allocate(owner, values.len(), size_of::<T>(), ElementLayout::Plain)?;
        let base = self.registry.lookup(id)?.base_address();
        self.registry.stores().host().write(base, bytemuck::cast_slice(values))?;
        Ok(id)
    }

    /// Allocates `count` zero-filled composite elements described by
    /// `members`.
    pub fn allocate_composite(
        &self,
        owner: ContextID,
        count: usize,
        element_size: usize,
        members: Vec<CompositeMember>,
    ) -> ResidencyResult<AllocationID> {
        self.allocate(owner, count, element_size, ElementLayout::Composite(members))
    }

    /// Allocates a `rows x cols` matrix as a row pointer array into one
    /// contiguous zero-filled block.
    pub fn allocate_matrix<T: Pod>(
        &self,
        owner: ContextID,
        rows: usize,
        cols: usize,
    ) -> ResidencyResult<MatrixAllocation> {
        let data = self.allocate(owner, rows * cols, size_of::<T>(), ElementLayout::Plain)?;
        let row_ptrs = self.allocate_composite(owner, rows, POINTER_SIZE, vec![CompositeMember::owned_pointer(0)])?;

        let data_base = self.registry.lookup(data)?.base_address();
        let pointers: Vec<u64> = (0..rows)
            .map(|r| data_base.add(r * cols * size_of::<T>()).raw())
            .collect();
        self.write_host(row_ptrs, 0, &pointers)?;
        Ok(MatrixAllocation { rows: row_ptrs, data, cols })
    }

    /// Descriptor of a live allocation.
    pub fn lookup(&self, id: AllocationID) -> ResidencyResult<AllocationDescriptor> {
        self.registry.lookup(id)
    }

    /// Lifecycle state of an allocation.
    pub fn lifecycle(&self, id: AllocationID) -> ResidencyResult<Lifecycle> {
        self.registry.lifecycle(id)
    }

    /// Releases an allocation on behalf of `caller`.
    pub fn release(&self, id: AllocationID, caller: ContextID) -> ResidencyResult<()> {
        self.registry.release(id, caller)
    }

    /// Host address of `element`.
    pub fn address_of(&self, id: AllocationID, element: usize) -> ResidencyResult<Address> {
        let state = self.registry.read();
        let descriptor = &state.live_entry(id)?.descriptor;
        let (start, _) = descriptor.byte_span(&ElementRange::new(element, 1))?;
        Ok(descriptor.base_address().add(start))
    }

    // ─────────────────────────────────────────────────────────────────────
    // Host access
    // ─────────────────────────────────────────────────────────────────────

    /// Reads `range` of an allocation's host storage.
    pub fn read_host<T: Pod>(&self, id: AllocationID, range: ElementRange) -> ResidencyResult<Vec<T>> {
        let state = self.registry.read();
        let descriptor = &state.live_entry(id)?.descriptor;
        check_size::<T>(id, descriptor.element_size())?;
        let (start, len) = descriptor.byte_span(&range)?;
        read_pods(self.registry.stores().host(), descriptor.base_address().add(start), len)
    }

    /// Writes `values` into host storage starting at element `offset`.
    pub fn write_host<T: Pod>(&self, id: AllocationID, offset: usize, values: &[T]) -> ResidencyResult<()> {
        let state = self.registry.read();
        let descriptor = &state.live_entry(id)?.descriptor;
        check_size::<T>(id, descriptor.element_size())?;
        let (start, _) = descriptor.byte_span(&ElementRange::new(offset, values.len()))?;
        self.registry
            .stores()
            .host()
            .write(descriptor.base_address().add(start), bytemuck::cast_slice(values))?;
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Regions and views
    // ─────────────────────────────────────────────────────────────────────

    /// Opens a region scope.
    pub fn region(&self) -> Region<'_> {
        Region::new(&self.registry)
    }

    /// Produces `context`'s view of `allocation` under `mode`.
    pub fn enter_region(
        &self,
        allocation: AllocationID,
        context: ContextID,
        mode: DuplicationMode,
    ) -> ResidencyResult<View> {
        policy::enter_region(&self.registry, allocation, context, mode)
    }

    /// Ends a view's participation in its region.
    pub fn exit_region(&self, view: &View) -> ResidencyResult<()> {
        policy::exit_region(&self.registry, view)
    }

    /// Removes a view without any copy-out.
    pub fn remove_view(&self, view: &View) -> ResidencyResult<()> {
        self.registry.remove_view(view)
    }

    /// Synchronization state of a view.
    pub fn sync_state(&self, view: &View) -> ResidencyResult<SyncState> {
        self.registry.sync_state(view)
    }

    /// Declares host writes in `range` the view has not received.
    pub fn mark_host_dirty(&self, view: &View, range: Option<ElementRange>) -> ResidencyResult<()> {
        self.registry.mark_host_dirty(view, range)
    }

    /// Declares view writes in `range` the host has not received.
    pub fn mark_device_dirty(&self, view: &View, range: Option<ElementRange>) -> ResidencyResult<()> {
        self.registry.mark_device_dirty(view, range)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Mirroring and transfers
    // ─────────────────────────────────────────────────────────────────────

    /// Deep-copies an allocation and everything it points to into
    /// `context`'s space (`enter data copyin` with `create` for pointees).
    pub fn mirror_composite(&self, allocation: AllocationID, context: ContextID) -> ResidencyResult<View> {
        rebase::mirror_composite(&self.registry, allocation, context, DuplicationMode::CopyIn)
    }

    /// Mirror of a pointee made together with `root`.
    pub fn mirrored_child(&self, root: &View, allocation: AllocationID) -> ResidencyResult<View> {
        rebase::mirrored_child(&self.registry, root, allocation)
    }

    /// Host to view transfer; see [`rebase::push`].
    pub fn push(&self, view: &View, range: Option<ElementRange>) -> ResidencyResult<usize> {
        rebase::push(&self.registry, view, range, self.config.strict_sync)
    }

    /// View to host transfer; see [`rebase::pull`].
    pub fn pull(&self, view: &View, range: Option<ElementRange>) -> ResidencyResult<usize> {
        rebase::pull(&self.registry, view, range, self.config.strict_sync)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Statics
    // ─────────────────────────────────────────────────────────────────────

    /// Declares a class-level static initialised from `values`.
    pub fn declare_static<T: Pod>(
        &self,
        name: &str,
        owner: ContextID,
        values: &[T],
        mirror_on_device: bool,
    ) -> ResidencyResult<AllocationID> {
        statics::declare_static(
            &self.registry,
            StaticDecl {
                name,
                owner,
                bytes: bytemuck::cast_slice(values),
                element_size: size_of::<T>(),
                mirror_on_device,
            },
        )
    }

    /// Allocation registered under `name`.
    pub fn static_allocation(&self, name: &str) -> ResidencyResult<AllocationID> {
        statics::static_allocation(&self.registry, name)
    }

    /// Address at which `context` sees the static.
    pub fn static_address(&self, name: &str, context: ContextID) -> ResidencyResult<Address> {
        statics::static_address(&self.registry, name, context)
    }

    /// `update device` of a static.
    pub fn update_static_device(&self, name: &str, range: Option<ElementRange>) -> ResidencyResult<usize> {
        statics::update_static_device(&self.registry, name, range)
    }

    /// `update self` of a static.
    pub fn update_static_host(&self, name: &str, range: Option<ElementRange>) -> ResidencyResult<usize> {
        statics::update_static_host(&self.registry, name, range)
    }

    /// Reads element `index` of a static as `context` sees it.
    pub fn read_static<T: Pod>(&self, name: &str, context: ContextID, index: usize) -> ResidencyResult<T> {
        let (state, base) = self.static_slot::<T>(name, context, index)?;
        let store = self.registry.stores().for_space(base.space())?;
        let value = read_pod(store, base)?;
        drop(state);
        Ok(value)
    }

    /// Writes element `index` of a static as `context` sees it.
    pub fn write_static<T: Pod>(
        &self,
        name: &str,
        context: ContextID,
        index: usize,
        value: T,
    ) -> ResidencyResult<()> {
        let (state, at) = self.static_slot::<T>(name, context, index)?;
        self.registry.stores().for_space(at.space())?.write(at, bytemuck::bytes_of(&value))?;
        drop(state);
        Ok(())
    }

    fn static_slot<T: Pod>(
        &self,
        name: &str,
        context: ContextID,
        index: usize,
    ) -> ResidencyResult<(parking_lot::RwLockReadGuard<'_, RegistryState>, Address)> {
        let state = self.registry.read();
        let space = state.context(context)?.address_space();
        let id = *state
            .statics
            .get(name)
            .ok_or_else(|| ResidencyError::UnknownStatic(name.to_owned().into()))?;
        let base = rebase::static_address_locked(&state, name, space)?;
        let descriptor = &state.live_entry(id)?.descriptor;
        check_size::<T>(id, descriptor.element_size())?;
        let (start, _) = descriptor.byte_span(&ElementRange::new(index, 1))?;
        Ok((state, base.add(start)))
    }

    // ─────────────────────────────────────────────────────────────────────
    // Typed access through views
    // ─────────────────────────────────────────────────────────────────────

    /// Reads one element through a view.
    pub fn read_element<T: Pod>(&self, view: &View, index: usize) -> ResidencyResult<T> {
        self.with_view_span::<T, _>(view, ElementRange::new(index, 1), |store, at, _| read_pod(store, at))
    }

    /// Writes one element through a view.
    pub fn write_element<T: Pod>(&self, view: &View, index: usize, value: T) -> ResidencyResult<()> {
        self.with_view_span::<T, _>(view, ElementRange::new(index, 1), |store, at, _| {
            store.write(at, bytemuck::bytes_of(&value))?;
            Ok(())
        })
    }

    /// Reads `range` through a view.
    pub fn read_elements<T: Pod>(&self, view: &View, range: ElementRange) -> ResidencyResult<Vec<T>> {
        self.with_view_span::<T, _>(view, range, read_pods)
    }

    /// Writes `values` through a view starting at element `offset`.
    pub fn write_elements<T: Pod>(&self, view: &View, offset: usize, values: &[T]) -> ResidencyResult<()> {
        self.with_view_span::<T, _>(view, ElementRange::new(offset, values.len()), |store, at, _| {
            store.write(at, bytemuck::cast_slice(values))?;
            Ok(())
        })
    }

    /// Reads the composite member at `member_offset` of `element`.
    pub fn read_member<T: Pod>(&self, view: &View, element: usize, member_offset: usize) -> ResidencyResult<T> {
        self.with_member::<T, _>(view, element, member_offset, |_, store, at| read_pod(store, at))
    }

    /// Writes the composite member at `member_offset` of `element`.
    pub fn write_member<T: Pod>(
        &self,
        view: &View,
        element: usize,
        member_offset: usize,
        value: T,
    ) -> ResidencyResult<()> {
        self.with_member::<T, _>(view, element, member_offset, |_, store, at| {
            store.write(at, bytemuck::bytes_of(&value))?;
            Ok(())
        })
    }

    /// Follows the pointer member at `member_offset` of `element` and reads
    /// element `index` of the pointee, in the view's address space.
    pub fn deref_member<T: Pod>(
        &self,
        view: &View,
        element: usize,
        member_offset: usize,
        index: usize,
    ) -> ResidencyResult<T> {
        self.with_pointee::<T, _>(view, element, member_offset, index, |store, at| read_pod(store, at))
    }

    /// Follows the pointer member at `member_offset` of `element` and writes
    /// element `index` of the pointee, in the view's address space.
    pub fn write_through_member<T: Pod>(
        &self,
        view: &View,
        element: usize,
        member_offset: usize,
        index: usize,
        value: T,
    ) -> ResidencyResult<()> {
        self.with_pointee::<T, _>(view, element, member_offset, index, |store, at| {
            store.write(at, bytemuck::bytes_of(&value))?;
            Ok(())
        })
    }

    /// Validates a view, the element size and `range`, then hands the
    /// view's store and the span's start address to `f` under the read lock.
    fn with_view_span<T: Pod, R>(
        &self,
        view: &View,
        range: ElementRange,
        f: impl FnOnce(&dyn BackingStore, Address, usize) -> ResidencyResult<R>,
    ) -> ResidencyResult<R> {
        let state = self.registry.read();
        let record = state.valid_record(view.id())?;
        let descriptor = &state.live_entry(record.view.allocation())?.descriptor;
        check_size::<T>(descriptor.id(), descriptor.element_size())?;
        let (start, len) = descriptor.byte_span(&range)?;
        let base = record.view.address();
        f(self.registry.stores().for_space(base.space())?, base.add(start), len)
    }

    fn with_member<T: Pod, R>(
        &self,
        view: &View,
        element: usize,
        member_offset: usize,
        f: impl FnOnce(&RegistryState, &dyn BackingStore, Address) -> ResidencyResult<R>,
    ) -> ResidencyResult<R> {
        let state = self.registry.read();
        let record = state.valid_record(view.id())?;
        let descriptor = &state.live_entry(record.view.allocation())?.descriptor;
        let member = descriptor
            .layout()
            .members()
            .iter()
            .find(|m| m.offset == member_offset)
            .ok_or(ResidencyError::InvalidMember { allocation: descriptor.id(), offset: member_offset })?;
        check_size::<T>(descriptor.id(), member.size)?;
        let (start, _) = descriptor.byte_span(&ElementRange::new(element, 1))?;
        let base = record.view.address();
        let store = self.registry.stores().for_space(base.space())?;
        f(&state, store, base.add(start + member_offset))
    }

    fn with_pointee<T: Pod, R>(
        &self,
        view: &View,
        element: usize,
        member_offset: usize,
        index: usize,
        f: impl FnOnce(&dyn BackingStore, Address) -> ResidencyResult<R>,
    ) -> ResidencyResult<R> {
        let state = self.registry.read();
        let record = state.valid_record(view.id())?;
        let descriptor = &state.live_entry(record.view.allocation())?.descriptor;
        descriptor.pointer_member(member_offset)?;
        let (start, _) = descriptor.byte_span(&ElementRange::new(element, 1))?;
        let base = record.view.address();
        let pointer = read_pointer(
            self.registry.stores().for_space(base.space())?,
            base.add(start + member_offset),
        )?;
        if pointer.is_null() {
            return Err(ResidencyError::UnregisteredPointee {
                allocation: descriptor.id(),
                address: pointer,
            });
        }

        if pointer.space() != base.space() {
            return Err(MemoryError::ForeignAddress { address: pointer, store: base.space() }.into());
        }

        // The pointer fixes the pointee block; the index must stay inside it.
        let pointee = ResidencyRegistry::resolve_locked(&state, pointer).map_err(|e| match e {
            ResidencyError::Memory(_) => ResidencyError::UnregisteredPointee {
                allocation: descriptor.id(),
                address: pointer,
            },
            other => other,
        })?;
        let target_descriptor = &state.entry(pointee.allocation)?.descriptor;
        check_size::<T>(pointee.allocation, target_descriptor.element_size())?;
        let offset = index
            .checked_mul(size_of::<T>())
            .and_then(|bytes| bytes.checked_add(pointee.offset))
            .filter(|offset| offset.saturating_add(size_of::<T>()) <= target_descriptor.byte_len())
            .ok_or(ResidencyError::RangeOutOfBounds {
                allocation: pointee.allocation,
                offset: (pointee.offset / size_of::<T>().max(1)).saturating_add(index),
                count: 1,
                len: target_descriptor.element_count(),
            })?;
        let target = pointee.base.add(offset);
        f(self.registry.stores().for_space(target.space())?, target)
    }
}

#[inline]
fn check_size<T>(allocation: AllocationID, expected: usize) -> ResidencyResult<()> {
    if size_of::<T>() != expected {
        return Err(ResidencyError::ElementSizeMismatch { allocation, expected, actual: size_of::<T>() });
    }
    Ok(())
}

fn read_pod<T: Pod>(store: &dyn BackingStore, at: Address) -> ResidencyResult<T> {
    let mut value = T::zeroed();
    store.read(at, bytemuck::bytes_of_mut(&mut value))?;
    Ok(value)
}

fn read_pods<T: Pod>(store: &dyn BackingStore, at: Address, len: usize) -> ResidencyResult<Vec<T>> {
    let mut bytes = vec![0u8; len];
    store.read(at, &mut bytes)?;
    Ok(bytes
        .chunks_exact(size_of::<T>().max(1))
        .map(bytemuck::pod_read_unaligned)
        .collect())
}
