//! Class-level static members.
//!
//! A static is one shared allocation registered under a stable name, such as
//! `c_test::dataset`. Composite members of kind
//! [`MemberKind::StaticShared`](crate::engine::descriptor::MemberKind) refer
//! to it by that name: every thread context resolves it to the same host
//! address, and device contexts resolve it to a declared device mirror.
//!
//! The device mirror is created zero-filled and is brought in sync only by
//! [`update_static_device`]; results computed on the device come back with
//! [`update_static_host`]. These updates are unconditional: they do not
//! consult dirty ranges.

use crate::engine::descriptor::AllocationDescriptor;
use crate::engine::error::{ResidencyError, ResidencyResult};
use crate::engine::memory;
use crate::engine::rebase::static_address_locked;
use crate::engine::registry::ResidencyRegistry;
use crate::engine::types::{
    Address, AllocationID, ContextID, ElementRange, Transfer,
};

/// Storage and shape of a static to declare.
pub struct StaticDecl<'a> {
    /// Stable name members refer to.
    pub name: &'a str,
    /// Owning context; the only one allowed to release the static.
    pub owner: ContextID,
    /// Initial host contents.
    pub bytes: &'a [u8],
    /// Size of one element in bytes.
    pub element_size: usize,
    /// Also create a (zero-filled) device mirror.
    pub mirror_on_device: bool,
}

/// Registers a static and returns its allocation.
///
/// Fails with `DuplicateStatic` if the name is taken, and `NoDeviceStore`
/// if a mirror is requested without a device store.
pub fn declare_static(registry: &ResidencyRegistry, decl: StaticDecl<'_>) -> ResidencyResult<AllocationID> {
    if registry.read().statics.contains_key(decl.name) {
        return Err(ResidencyError::DuplicateStatic(decl.name.to_owned().into()));
    }
    if decl.mirror_on_device && !registry.stores().has_device() {
        return Err(ResidencyError::NoDeviceStore);
    }

    let element_size = decl.element_size.max(1);
    let count = decl.bytes.len() / element_size;
    let host = registry.stores().host();
    let base = host.raw_alloc(decl.bytes.len())?;
    let registered = host
        .write(base, decl.bytes)
        .map_err(ResidencyError::from)
        .and_then(|_| registry.register(AllocationDescriptor::new(base, count, element_size, decl.owner)));
    let id = match registered {
        Ok(id) => id,
        Err(e) => {
            let _ = host.raw_free(base);
            return Err(e);
        }
    };

    let attached = {
        let mut state = registry.write();
        if state.statics.contains_key(decl.name) {
            Err(ResidencyError::DuplicateStatic(decl.name.to_owned().into()))
        } else {
            let mirrored = if decl.mirror_on_device {
                registry.ensure_device_mirror(&mut state, id).map(Some)
            } else {
                Ok(None)
            };
            mirrored.and_then(|_| {
                state.statics.insert(decl.name.to_owned(), id);
                state.entry_mut(id)?.static_name = Some(decl.name.to_owned());
                Ok(())
            })
        }
    };

    if let Err(e) = attached {
        registry.release(id, decl.owner)?;
        return Err(e);
    }

    tracing::debug!(name = decl.name, allocation = id, mirrored = decl.mirror_on_device, "declared static");
    Ok(id)
}

/// Allocation registered under `name`.
pub fn static_allocation(registry: &ResidencyRegistry, name: &str) -> ResidencyResult<AllocationID> {
    registry
        .read()
        .statics
        .get(name)
        .copied()
        .ok_or_else(|| ResidencyError::UnknownStatic(name.to_owned().into()))
}

/// Address at which `context` sees the static.
pub fn static_address(
    registry: &ResidencyRegistry,
    name: &str,
    context: ContextID,
) -> ResidencyResult<Address> {
    let state = registry.read();
    let context = state.context(context)?;
    static_address_locked(&state, name, context.address_space())
}

fn update(
    registry: &ResidencyRegistry,
    name: &str,
    range: Option<ElementRange>,
    direction: Transfer,
) -> ResidencyResult<usize> {
    let state = registry.read();
    let id = *state
        .statics
        .get(name)
        .ok_or_else(|| ResidencyError::UnknownStatic(name.to_owned().into()))?;
    let entry = state.live_entry(id)?;
    let mirror = entry
        .device_mirror
        .ok_or_else(|| ResidencyError::StaticNotMirrored(name.to_owned().into()))?;

    let descriptor = &entry.descriptor;
    let range = range.unwrap_or(ElementRange::full(descriptor.element_count()));
    let (start, len) = descriptor.byte_span(&range)?;

    let stores = registry.stores();
    let (host, device) = (stores.host(), stores.device()?);
    let host_at = descriptor.base_address().add(start);
    match direction {
        Transfer::Push => memory::copy(device, mirror.add(start), host, host_at, len)?,
        Transfer::Pull => memory::copy(host, host_at, device, mirror.add(start), len)?,
    }
    tracing::debug!(name, %direction, %range, bytes = len, "static update");
    Ok(len)
}

/// Copies host contents of the static to its device mirror
/// (`update device`). `None` updates every element.
pub fn update_static_device(
    registry: &ResidencyRegistry,
    name: &str,
    range: Option<ElementRange>,
) -> ResidencyResult<usize> {
    update(registry, name, range, Transfer::Push)
}

/// Copies the static's device mirror back to the host (`update self`).
/// `None` updates every element.
pub fn update_static_host(
    registry: &ResidencyRegistry,
    name: &str,
    range: Option<ElementRange>,
) -> ResidencyResult<usize> {
    update(registry, name, range, Transfer::Pull)
}
