//! # Residency Registry
//!
//! Process-wide table mapping every registered allocation to the views
//! execution contexts hold of it, and every known block address back to its
//! owner.
//!
//! ## Tables
//!
//! | Table | Key | Holds |
//! |-------|-----|-------|
//! | allocations | [`AllocationID`] | descriptor, lifetime guard, view list, device mirror |
//! | views | [`ViewID`] | resolved address, mode, owned buffers, dirty ranges |
//! | contexts | [`ContextID`] | thread/device kind |
//! | blocks | block base address | owning allocation or view |
//! | statics | stable name | allocation of a class-level static |
//!
//! The block index lets any address (including interior addresses such as
//! row pointers into a contiguous block) be resolved to the allocation or
//! view that owns it, which the rebasing protocol relies on.
//!
//! ## Locking
//!
//! All tables sit behind one `parking_lot::RwLock`. Element access takes the
//! read lock; anything that creates, removes or re-states a view or an
//! allocation takes the write lock. Backing stores have their own locks, so
//! many thread contexts can read and write through their views at once.
//!
//! ## Release
//!
//! Releasing an allocation frees its host block and device mirror and marks
//! every outstanding view *invalidated*. Invalidated views keep their own
//! buffers until [`ResidencyRegistry::remove_view`] is called for them;
//! every other access through them fails with `UseAfterRelease`.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::engine::descriptor::AllocationDescriptor;
use crate::engine::error::{
    MemoryError, ResidencyError, ResidencyResult, UnsupportedModeError, UseAfterReleaseError,
};
use crate::engine::guard::{LifetimeGuard, Lifecycle};
use crate::engine::memory::BackingStore;
use crate::engine::types::{
    Address, AddressSpace, AllocationID, ContextID, ContextKind, DuplicationMode, ElementRange,
    ExecutionContext, RangeSet, SyncState, ViewID, HOST_CONTEXT,
};

/// A resolved address plus mode through which a context accesses an
/// allocation.
///
/// `View` is a non-owning handle: dropping it does nothing, and removing it
/// through the registry frees only the view's own buffers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct View {
    id: ViewID,
    allocation: AllocationID,
    context: ContextID,
    kind: ContextKind,
    address: Address,
    mode: DuplicationMode,
}

impl View {
    /// View identifier.
    #[inline]
    pub fn id(&self) -> ViewID { self.id }

    /// Allocation this view refers to.
    #[inline]
    pub fn allocation(&self) -> AllocationID { self.allocation }

    /// Context holding the view.
    #[inline]
    pub fn context(&self) -> ContextID { self.context }

    /// Kind of the holding context.
    #[inline]
    pub fn context_kind(&self) -> ContextKind { self.kind }

    /// Address of element 0 as seen by the holding context.
    #[inline]
    pub fn address(&self) -> Address { self.address }

    /// Duplication mode the view was created with.
    #[inline]
    pub fn mode(&self) -> DuplicationMode { self.mode }
}

/// Owner of an indexed block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockOwner {
    /// Host storage of an allocation.
    Allocation(AllocationID),
    /// Private buffer of a view.
    View(ViewID),
    /// Declared device mirror of an allocation.
    DeviceMirror(AllocationID),
}

/// Result of resolving an address through the block index.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Resolved {
    /// Block owner.
    pub owner: BlockOwner,
    /// Allocation the block holds data of.
    pub allocation: AllocationID,
    /// Base address of the block.
    pub base: Address,
    /// Byte offset of the resolved address inside the block.
    pub offset: usize,
}

#[derive(Clone, Copy, Debug)]
struct IndexedBlock {
    len: usize,
    owner: BlockOwner,
    allocation: AllocationID,
}

pub(crate) struct AllocationEntry {
    pub(crate) descriptor: AllocationDescriptor,
    pub(crate) guard: LifetimeGuard,
    pub(crate) views: Vec<ViewID>,
    pub(crate) shared_view: Option<ViewID>,
    pub(crate) device_mirror: Option<Address>,
    pub(crate) static_name: Option<String>,
}

pub(crate) struct ViewRecord {
    pub(crate) view: View,
    pub(crate) buffers: Vec<Address>,
    pub(crate) parent: Option<ViewID>,
    pub(crate) children: Vec<ViewID>,
    pub(crate) host_dirty: RangeSet,
    pub(crate) device_dirty: RangeSet,
    pub(crate) invalidated: bool,
    /// Contexts holding a `Shared` record, one entry per entry into it.
    pub(crate) holders: Vec<ContextID>,
}

impl ViewRecord {
    pub(crate) fn sync_state(&self) -> SyncState {
        if !self.device_dirty.is_empty() {
            SyncState::DeviceDirty
        } else if !self.host_dirty.is_empty() {
            SyncState::HostDirty
        } else {
            SyncState::Clean
        }
    }

    pub(crate) fn ensure_valid(&self) -> Result<(), UseAfterReleaseError> {
        if self.invalidated {
            return Err(UseAfterReleaseError { allocation: self.view.allocation });
        }
        Ok(())
    }
}

pub(crate) struct RegistryState {
    pub(crate) allocations: HashMap<AllocationID, AllocationEntry>,
    pub(crate) views: HashMap<ViewID, ViewRecord>,
    pub(crate) contexts: HashMap<ContextID, ExecutionContext>,
    pub(crate) statics: HashMap<String, AllocationID>,
    blocks: BTreeMap<u64, IndexedBlock>,
    next_allocation: AllocationID,
    next_view: ViewID,
    next_context: ContextID,
}

impl RegistryState {
    fn new() -> Self {
        let mut contexts = HashMap::new();
        contexts.insert(HOST_CONTEXT, ExecutionContext { id: HOST_CONTEXT, kind: ContextKind::Thread });
        Self {
            allocations: HashMap::new(),
            views: HashMap::new(),
            contexts,
            statics: HashMap::new(),
            blocks: BTreeMap::new(),
            next_allocation: 1,
            next_view: 1,
            next_context: HOST_CONTEXT + 1,
        }
    }

    pub(crate) fn context(&self, id: ContextID) -> ResidencyResult<ExecutionContext> {
        self.contexts.get(&id).copied().ok_or(ResidencyError::UnknownContext(id))
    }

    pub(crate) fn entry(&self, id: AllocationID) -> ResidencyResult<&AllocationEntry> {
        self.allocations.get(&id).ok_or(ResidencyError::UnknownAllocation(id))
    }

    pub(crate) fn entry_mut(&mut self, id: AllocationID) -> ResidencyResult<&mut AllocationEntry> {
        self.allocations.get_mut(&id).ok_or(ResidencyError::UnknownAllocation(id))
    }

    /// Entry of a live allocation; `UseAfterRelease` otherwise.
    pub(crate) fn live_entry(&self, id: AllocationID) -> ResidencyResult<&AllocationEntry> {
        let entry = self.entry(id)?;
        entry.guard.ensure_live()?;
        Ok(entry)
    }

    pub(crate) fn record(&self, id: ViewID) -> ResidencyResult<&ViewRecord> {
        self.views.get(&id).ok_or(ResidencyError::UnknownView(id))
    }

    pub(crate) fn record_mut(&mut self, id: ViewID) -> ResidencyResult<&mut ViewRecord> {
        self.views.get_mut(&id).ok_or(ResidencyError::UnknownView(id))
    }

    /// Record of a view that is still valid; `UseAfterRelease` otherwise.
    pub(crate) fn valid_record(&self, id: ViewID) -> ResidencyResult<&ViewRecord> {
        let record = self.record(id)?;
        record.ensure_valid()?;
        Ok(record)
    }

    fn index_block(&mut self, base: Address, len: usize, owner: BlockOwner, allocation: AllocationID) {
        self.blocks.insert(base.raw(), IndexedBlock { len: len.max(1), owner, allocation });
    }

    fn unindex_block(&mut self, base: Address) {
        self.blocks.remove(&base.raw());
    }

    /// Resolves `address` to its owning block without liveness checks.
    pub(crate) fn locate(&self, address: Address) -> Option<Resolved> {
        let (&base, block) = self.blocks.range(..=address.raw()).next_back()?;
        let base = Address::from_raw(base);
        let offset = address.offset_from(base)?;
        if offset >= block.len {
            return None;
        }
        Some(Resolved { owner: block.owner, allocation: block.allocation, base, offset })
    }

    pub(crate) fn next_view_id(&mut self) -> ViewID {
        let id = self.next_view;
        self.next_view += 1;
        id
    }

    /// Inserts a non-shared view record owning `buffers`.
    pub(crate) fn insert_view(
        &mut self,
        context: ExecutionContext,
        allocation: AllocationID,
        mode: DuplicationMode,
        buffer: Address,
        byte_len: usize,
    ) -> View {
        let id = self.next_view_id();
        let view = View {
            id,
            allocation,
            context: context.id,
            kind: context.kind,
            address: buffer,
            mode,
        };
        self.views.insert(
            id,
            ViewRecord {
                view,
                buffers: vec![buffer],
                parent: None,
                children: Vec::new(),
                host_dirty: RangeSet::new(),
                device_dirty: RangeSet::new(),
                invalidated: false,
                holders: vec![context.id],
            },
        );
        self.index_block(buffer, byte_len, BlockOwner::View(id), allocation);
        if let Some(entry) = self.allocations.get_mut(&allocation) {
            entry.views.push(id);
        }
        view
    }

    /// Returns (creating if needed) the single shared view of `allocation`.
    pub(crate) fn shared_view(
        &mut self,
        context: ExecutionContext,
        allocation: AllocationID,
    ) -> ResidencyResult<View> {
        if context.kind == ContextKind::Device {
            return Err(UnsupportedModeError {
                mode: DuplicationMode::Shared,
                kind: context.kind,
                operation: "enter_region",
            }
            .into());
        }
        let (existing, base) = {
            let entry = self.live_entry(allocation)?;
            (entry.shared_view, entry.descriptor.base_address())
        };

        if let Some(id) = existing {
            let record = self.record_mut(id)?;
            record.holders.push(context.id);
            return Ok(View { context: context.id, kind: context.kind, ..record.view });
        }

        let id = self.next_view_id();
        let view = View {
            id,
            allocation,
            context: context.id,
            kind: context.kind,
            address: base,
            mode: DuplicationMode::Shared,
        };
        self.views.insert(
            id,
            ViewRecord {
                view,
                buffers: Vec::new(),
                parent: None,
                children: Vec::new(),
                host_dirty: RangeSet::new(),
                device_dirty: RangeSet::new(),
                invalidated: false,
                holders: vec![context.id],
            },
        );
        let entry = self.entry_mut(allocation)?;
        entry.shared_view = Some(id);
        entry.views.push(id);
        Ok(view)
    }

    /// Links `child` under `parent` so both are removed together.
    pub(crate) fn adopt(&mut self, parent: ViewID, child: ViewID) -> ResidencyResult<()> {
        self.record_mut(child)?.parent = Some(parent);
        self.record_mut(parent)?.children.push(child);
        Ok(())
    }

    /// Number of views (shared holders excluded) held by `context`.
    fn views_held_by(&self, context: ContextID) -> usize {
        self.views
            .values()
            .filter(|r| r.view.context == context && r.view.mode != DuplicationMode::Shared)
            .count()
    }
}

/// Host and device backing stores.
#[derive(Clone)]
pub struct Stores {
    host: Arc<dyn BackingStore>,
    device: Option<Arc<dyn BackingStore>>,
}

impl Stores {
    /// Creates a store pair; `device` is optional.
    pub fn new(host: Arc<dyn BackingStore>, device: Option<Arc<dyn BackingStore>>) -> Self {
        debug_assert_eq!(host.space(), AddressSpace::Host);
        debug_assert!(device.as_ref().map_or(true, |d| d.space() == AddressSpace::Device));
        Self { host, device }
    }

    /// Host store.
    #[inline]
    pub fn host(&self) -> &dyn BackingStore {
        &*self.host
    }

    /// Device store, if configured.
    #[inline]
    pub fn device(&self) -> ResidencyResult<&dyn BackingStore> {
        self.device.as_deref().ok_or(ResidencyError::NoDeviceStore)
    }

    /// Store serving `space`.
    #[inline]
    pub fn for_space(&self, space: AddressSpace) -> ResidencyResult<&dyn BackingStore> {
        match space {
            AddressSpace::Host => Ok(self.host()),
            AddressSpace::Device => self.device(),
        }
    }

    /// Returns `true` if a device store is configured.
    #[inline]
    pub fn has_device(&self) -> bool {
        self.device.is_some()
    }
}

/// Process-wide residency table.
pub struct ResidencyRegistry {
    stores: Stores,
    state: RwLock<RegistryState>,
}

impl ResidencyRegistry {
    /// Creates an empty registry over `stores`. The host thread context
    /// ([`HOST_CONTEXT`]) exists from the start.
    pub fn new(stores: Stores) -> Self {
        Self { stores, state: RwLock::new(RegistryState::new()) }
    }

    /// Backing stores.
    #[inline]
    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    #[inline]
    pub(crate) fn read(&self) -> RwLockReadGuard<'_, RegistryState> {
        self.state.read()
    }

    #[inline]
    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, RegistryState> {
        self.state.write()
    }

    // ── contexts ────────────────────────────────────────────────────────────

    /// Creates a new execution context.
    pub fn create_context(&self, kind: ContextKind) -> ResidencyResult<ExecutionContext> {
        if kind == ContextKind::Device && !self.stores.has_device() {
            return Err(ResidencyError::NoDeviceStore);
        }
        let mut state = self.write();
        let id = state.next_context;
        state.next_context += 1;
        let context = ExecutionContext { id, kind };
        state.contexts.insert(id, context);
        Ok(context)
    }

    /// Looks up a context.
    pub fn context(&self, id: ContextID) -> ResidencyResult<ExecutionContext> {
        self.read().context(id)
    }

    /// Removes a context that holds no views.
    pub fn retire_context(&self, id: ContextID) -> ResidencyResult<()> {
        let mut state = self.write();
        state.context(id)?;
        let views = state.views_held_by(id);
        if views > 0 {
            return Err(ResidencyError::ContextBusy { context: id, views });
        }
        state.contexts.remove(&id);
        Ok(())
    }

    // ── allocations ─────────────────────────────────────────────────────────

    /// Registers a descriptor of existing host storage and returns its ID.
    ///
    /// The registry takes over the storage: it is freed by [`Self::release`].
    pub fn register(&self, mut descriptor: AllocationDescriptor) -> ResidencyResult<AllocationID> {
        let base = descriptor.base_address();
        if base.space() != AddressSpace::Host {
            return Err(MemoryError::ForeignAddress { address: base, store: AddressSpace::Host }.into());
        }

        if descriptor.checked_byte_len().is_none() {
            return Err(MemoryError::OutOfMemory { requested: usize::MAX, available: 0 }.into());
        }

        let mut state = self.write();
        state.context(descriptor.owner_context())?;

        let id = state.next_allocation;
        descriptor.assign_id(id);
        descriptor.validate_layout()?;
        state.next_allocation += 1;

        let owner = descriptor.owner_context();
        let len = descriptor.byte_len();
        state.allocations.insert(
            id,
            AllocationEntry {
                descriptor,
                guard: LifetimeGuard::new(id, owner),
                views: Vec::new(),
                shared_view: None,
                device_mirror: None,
                static_name: None,
            },
        );
        state.index_block(base, len, BlockOwner::Allocation(id), id);
        tracing::debug!(allocation = id, %base, bytes = len, owner, "registered allocation");
        Ok(id)
    }

    /// Descriptor of a live allocation.
    pub fn lookup(&self, id: AllocationID) -> ResidencyResult<AllocationDescriptor> {
        Ok(self.read().live_entry(id)?.descriptor.clone())
    }

    /// Lifecycle state of an allocation, released or not.
    pub fn lifecycle(&self, id: AllocationID) -> ResidencyResult<Lifecycle> {
        Ok(self.read().entry(id)?.guard.state())
    }

    /// Number of allocations ever registered and not yet released.
    pub fn live_allocations(&self) -> usize {
        self.read().allocations.values().filter(|e| !e.guard.is_released()).count()
    }

    // ── views ───────────────────────────────────────────────────────────────

    /// Adds a view of `allocation` for `context`.
    ///
    /// `Shared` views take no buffer and resolve to the single shared record.
    /// Every other mode must provide the context-owned `buffer` holding the
    /// view's copy; the view takes ownership of it.
    pub fn add_view(
        &self,
        allocation: AllocationID,
        context: ContextID,
        mode: DuplicationMode,
        buffer: Option<Address>,
    ) -> ResidencyResult<View> {
        let mut state = self.write();
        let context = state.context(context)?;
        let byte_len = state.live_entry(allocation)?.descriptor.byte_len();

        match (mode, buffer) {
            (DuplicationMode::Shared, _) => state.shared_view(context, allocation),
            (_, Some(buffer)) => {
                if buffer.space() != context.address_space() {
                    return Err(MemoryError::ForeignAddress {
                        address: buffer,
                        store: context.address_space(),
                    }
                    .into());
                }
                Ok(state.insert_view(context, allocation, mode, buffer, byte_len))
            }
            (_, None) => Err(UnsupportedModeError {
                mode,
                kind: context.kind,
                operation: "add_view without a buffer",
            }
            .into()),
        }
    }

    /// Current view handle for `id`.
    pub fn view(&self, id: ViewID) -> ResidencyResult<View> {
        Ok(self.read().record(id)?.view)
    }

    /// Views currently registered for `allocation`.
    pub fn views_of(&self, allocation: AllocationID) -> ResidencyResult<Vec<View>> {
        let state = self.read();
        let entry = state.entry(allocation)?;
        Ok(entry
            .views
            .iter()
            .filter_map(|id| state.views.get(id).map(|r| r.view))
            .collect())
    }

    /// Number of view records alive.
    pub fn live_views(&self) -> usize {
        self.read().views.len()
    }

    /// Returns `true` if the view's allocation was released under it.
    pub fn is_invalidated(&self, view: &View) -> ResidencyResult<bool> {
        Ok(self.read().record(view.id)?.invalidated)
    }

    /// Removes a view and frees the buffers it owns.
    ///
    /// Never releases the allocation. Child mirrors are removed with their
    /// parent. Removing a `Shared` view drops the hold of the view's
    /// context; the shared record disappears with its last holder. A context
    /// that no longer holds the record gets `UnknownView`.
    pub fn remove_view(&self, view: &View) -> ResidencyResult<()> {
        let mut state = self.write();
        self.remove_view_locked(&mut state, view.id, view.context)
    }

    pub(crate) fn remove_view_locked(
        &self,
        state: &mut RegistryState,
        id: ViewID,
        holder: ContextID,
    ) -> ResidencyResult<()> {
        let record = state.record_mut(id)?;
        if record.view.mode == DuplicationMode::Shared {
            let position = record
                .holders
                .iter()
                .position(|c| *c == holder)
                .ok_or(ResidencyError::UnknownView(id))?;
            record.holders.swap_remove(position);
            if !record.holders.is_empty() {
                return Ok(());
            }
        }

        let mut first_error = None;
        let mut pending = vec![id];
        let detach_from = state.record(id)?.parent;

        while let Some(next) = pending.pop() {
            let Some(record) = state.views.remove(&next) else { continue };
            pending.extend(record.children.iter().copied());

            let store = self.stores.for_space(record.view.address.space())?;
            for buffer in &record.buffers {
                state.unindex_block(*buffer);
                if let Err(e) = store.raw_free(*buffer) {
                    first_error.get_or_insert(ResidencyError::from(e));
                }
            }

            if let Some(entry) = state.allocations.get_mut(&record.view.allocation) {
                entry.views.retain(|v| *v != next);
                if entry.shared_view == Some(next) {
                    entry.shared_view = None;
                }
            }
        }

        if let Some(parent) = detach_from {
            if let Some(parent) = state.views.get_mut(&parent) {
                parent.children.retain(|c| *c != id);
            }
        }

        first_error.map_or(Ok(()), Err)
    }

    // ── release ─────────────────────────────────────────────────────────────

    /// Releases an allocation's storage on behalf of `caller`.
    ///
    /// Fails with `DoubleRelease` if already released and `NotOwner` if
    /// `caller` is not the owner context. On success the host block and any
    /// device mirror are freed and every outstanding view is invalidated.
    /// A failure to free the device mirror is returned after the allocation
    /// is already released.
    pub fn release(&self, allocation: AllocationID, caller: ContextID) -> ResidencyResult<()> {
        let mut state = self.write();
        let (base, mirror, views, static_name) = {
            let entry = state.entry(allocation)?;
            entry.guard.authorize_release(caller)?;
            (
                entry.descriptor.base_address(),
                entry.device_mirror,
                entry.views.clone(),
                entry.static_name.clone(),
            )
        };

        // Freed blocks stay indexed. Addresses are never reused, so a stale
        // pointer still resolves to this allocation and reports the release.
        self.stores.host().raw_free(base)?;
        {
            let entry = state.entry_mut(allocation)?;
            entry.guard.seal();
            entry.device_mirror = None;
        }
        let mirror_freed = match mirror {
            Some(mirror) => self.stores.device().and_then(|d| d.raw_free(mirror).map_err(Into::into)),
            None => Ok(()),
        };
        for id in &views {
            if let Some(record) = state.views.get_mut(id) {
                record.invalidated = true;
            }
        }
        if let Some(name) = static_name {
            state.statics.remove(&name);
        }

        tracing::debug!(allocation, caller, invalidated = views.len(), "released allocation");
        mirror_freed
    }

    // ── synchronization bookkeeping ─────────────────────────────────────────

    /// Synchronization state of a view.
    pub fn sync_state(&self, view: &View) -> ResidencyResult<SyncState> {
        Ok(self.read().record(view.id)?.sync_state())
    }

    /// Declares that host storage changed in `range` (whole extent if `None`)
    /// and the view's copy has not received it.
    pub fn mark_host_dirty(&self, view: &View, range: Option<ElementRange>) -> ResidencyResult<()> {
        self.mark(view, range, |record, range| record.host_dirty.insert(range))
    }

    /// Declares that the view's copy changed in `range` (whole extent if
    /// `None`) and the host has not received it.
    pub fn mark_device_dirty(&self, view: &View, range: Option<ElementRange>) -> ResidencyResult<()> {
        self.mark(view, range, |record, range| record.device_dirty.insert(range))
    }

    fn mark(
        &self,
        view: &View,
        range: Option<ElementRange>,
        apply: impl FnOnce(&mut ViewRecord, ElementRange),
    ) -> ResidencyResult<()> {
        let mut state = self.write();
        let record = state.valid_record(view.id)?;
        if record.view.mode == DuplicationMode::Shared {
            return Err(UnsupportedModeError {
                mode: DuplicationMode::Shared,
                kind: view.kind,
                operation: "dirty tracking",
            }
            .into());
        }
        let descriptor = &state.entry(record.view.allocation)?.descriptor;
        let range = range.unwrap_or(ElementRange::full(descriptor.element_count()));
        descriptor.check_range(&range)?;
        apply(state.record_mut(view.id)?, range);
        Ok(())
    }

    // ── address resolution ──────────────────────────────────────────────────

    /// Resolves an address to the allocation or view block containing it.
    ///
    /// Fails with `UseAfterRelease` if the block belongs to a released
    /// allocation or an invalidated view.
    pub fn resolve(&self, address: Address) -> ResidencyResult<Resolved> {
        let state = self.read();
        Self::resolve_locked(&state, address)
    }

    pub(crate) fn resolve_locked(state: &RegistryState, address: Address) -> ResidencyResult<Resolved> {
        let resolved = state
            .locate(address)
            .ok_or(MemoryError::UnknownAddress { address })?;
        match resolved.owner {
            BlockOwner::View(view) => {
                state.valid_record(view)?;
            }
            BlockOwner::Allocation(id) | BlockOwner::DeviceMirror(id) => {
                state.live_entry(id)?;
            }
        }
        Ok(resolved)
    }

    // ── declared device mirrors ─────────────────────────────────────────────

    /// Creates the persistent device mirror of an allocation
    /// (`declare create`). Returns the existing mirror if there is one.
    pub(crate) fn ensure_device_mirror(
        &self,
        state: &mut RegistryState,
        allocation: AllocationID,
    ) -> ResidencyResult<Address> {
        let entry = state.live_entry(allocation)?;
        if let Some(mirror) = entry.device_mirror {
            return Ok(mirror);
        }
        let len = entry.descriptor.byte_len();
        let mirror = self.stores.device()?.raw_alloc(len)?;
        state.entry_mut(allocation)?.device_mirror = Some(mirror);
        state.index_block(mirror, len, BlockOwner::DeviceMirror(allocation), allocation);
        Ok(mirror)
    }
}
