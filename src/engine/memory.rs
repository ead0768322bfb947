//! # Backing Stores
//!
//! The allocation layer every residency operation sits on. A backing store
//! owns one address space and provides the four raw operations the rest of
//! the crate depends on:
//!
//! | Operation | Meaning |
//! |-----------|---------|
//! | `raw_alloc(bytes)` | reserve a zero-filled block, return its base |
//! | `raw_free(base)` | return a block; `base` must be a block base |
//! | `read(src, out)` | copy bytes out of the space |
//! | `write(dst, bytes)` | copy bytes into the space |
//!
//! Cross-space transfers go through [`copy`], which stages through host
//! memory exactly like an explicit update directive would.
//!
//! ## Address space discipline
//!
//! A store only accepts addresses of its own space. Passing a device address
//! to the host store (or vice versa) is reported as
//! [`MemoryError::ForeignAddress`] instead of being interpreted, so a mirror
//! address can never be used to free host storage.
//!
//! ## BlockArena
//!
//! [`BlockArena`] is the default store for both spaces. It hands out
//! monotonically increasing, [`BLOCK_ALIGN`]-aligned addresses and never
//! reuses them, so a stale address always fails instead of aliasing a newer
//! block. Interior addresses (`base + offset`) resolve to their containing
//! block, which is what pointer-into-block members (row pointers of a
//! multi-dimensional array) require.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::engine::error::MemoryError;
use crate::engine::types::{Address, AddressSpace, BLOCK_ALIGN, DEVICE_BASE, HOST_BASE};

/// One address space's allocation primitives.
///
/// Implementations must be safe to call from many threads at once.
pub trait BackingStore: Send + Sync {
    /// Address space served by this store.
    fn space(&self) -> AddressSpace;

    /// Human-readable name for diagnostics.
    fn label(&self) -> &'static str;

    /// Reserves a zero-filled block of `bytes` bytes.
    fn raw_alloc(&self, bytes: usize) -> Result<Address, MemoryError>;

    /// Returns the block starting at `address`.
    fn raw_free(&self, address: Address) -> Result<(), MemoryError>;

    /// Copies `out.len()` bytes starting at `src` into `out`.
    fn read(&self, src: Address, out: &mut [u8]) -> Result<(), MemoryError>;

    /// Copies `bytes` into the space starting at `dst`.
    fn write(&self, dst: Address, bytes: &[u8]) -> Result<(), MemoryError>;

    /// Number of live blocks.
    fn live_blocks(&self) -> usize;

    /// Total bytes held by live blocks.
    fn live_bytes(&self) -> usize;
}

/// Copies `bytes` bytes from `src` in `src_store` to `dst` in `dst_store`.
///
/// Works within one space or across spaces; the transfer is staged through
/// a host buffer.
pub fn copy(
    dst_store: &dyn BackingStore,
    dst: Address,
    src_store: &dyn BackingStore,
    src: Address,
    bytes: usize,
) -> Result<(), MemoryError> {
    if bytes == 0 {
        return Ok(());
    }
    let mut staging = vec![0u8; bytes];
    src_store.read(src, &mut staging)?;
    dst_store.write(dst, &staging)
}

struct ArenaState {
    blocks: BTreeMap<u64, Box<[u8]>>,
    next: u64,
    live_bytes: usize,
}

/// Simulated address space backed by heap blocks.
pub struct BlockArena {
    space: AddressSpace,
    label: &'static str,
    capacity: usize,
    state: Mutex<ArenaState>,
}

impl BlockArena {
    /// Creates an arena for `space`. A `capacity` of `0` means unlimited.
    pub fn new(space: AddressSpace, capacity: usize) -> Self {
        let (base, label) = match space {
            AddressSpace::Host => (HOST_BASE, "host-arena"),
            AddressSpace::Device => (DEVICE_BASE, "device-arena"),
        };
        Self {
            space,
            label,
            capacity,
            state: Mutex::new(ArenaState {
                blocks: BTreeMap::new(),
                next: base,
                live_bytes: 0,
            }),
        }
    }

    /// Shorthand for a host arena behind an `Arc`.
    pub fn host(capacity: usize) -> Arc<dyn BackingStore> {
        Arc::new(Self::new(AddressSpace::Host, capacity))
    }

    /// Shorthand for a device arena behind an `Arc`.
    pub fn device(capacity: usize) -> Arc<dyn BackingStore> {
        Arc::new(Self::new(AddressSpace::Device, capacity))
    }

    #[inline]
    fn check_space(&self, address: Address) -> Result<(), MemoryError> {
        if address.space() != self.space {
            return Err(MemoryError::ForeignAddress { address, store: self.space });
        }
        Ok(())
    }

    /// Finds the block containing `address` and the offset inside it.
    fn locate(state: &ArenaState, address: Address) -> Result<(u64, usize), MemoryError> {
        let (&base, block) = state
            .blocks
            .range(..=address.raw())
            .next_back()
            .ok_or(MemoryError::UnknownAddress { address })?;
        let offset = (address.raw() - base) as usize;
        if offset >= block.len() {
            return Err(MemoryError::UnknownAddress { address });
        }
        Ok((base, offset))
    }
}

impl BackingStore for BlockArena {
    fn space(&self) -> AddressSpace {
        self.space
    }

    fn label(&self) -> &'static str {
        self.label
    }

    fn raw_alloc(&self, bytes: usize) -> Result<Address, MemoryError> {
        // Zero-sized requests still get a distinct one-byte block.
        let reserved = bytes.max(1);
        let mut state = self.state.lock();
        if self.capacity != 0 && state.live_bytes + reserved > self.capacity {
            return Err(MemoryError::OutOfMemory {
                requested: bytes,
                available: self.capacity.saturating_sub(state.live_bytes),
            });
        }

        let base = state.next;
        let span = (reserved as u64 + BLOCK_ALIGN - 1) & !(BLOCK_ALIGN - 1);
        state.next = base + span;
        state.blocks.insert(base, vec![0u8; reserved].into_boxed_slice());
        state.live_bytes += reserved;
        Ok(Address::from_raw(base))
    }

    fn raw_free(&self, address: Address) -> Result<(), MemoryError> {
        self.check_space(address)?;
        let mut state = self.state.lock();
        let (base, offset) = Self::locate(&state, address)?;
        if offset != 0 {
            return Err(MemoryError::NotBlockBase { address });
        }
        if let Some(block) = state.blocks.remove(&base) {
            state.live_bytes -= block.len();
        }
        Ok(())
    }

    fn read(&self, src: Address, out: &mut [u8]) -> Result<(), MemoryError> {
        self.check_space(src)?;
        if out.is_empty() {
            return Ok(());
        }
        let state = self.state.lock();
        let (base, offset) = Self::locate(&state, src)?;
        let block = &state.blocks[&base];
        let available = block.len() - offset;
        if out.len() > available {
            return Err(MemoryError::OutOfBounds { address: src, bytes: out.len(), available });
        }
        out.copy_from_slice(&block[offset..offset + out.len()]);
        Ok(())
    }

    fn write(&self, dst: Address, bytes: &[u8]) -> Result<(), MemoryError> {
        self.check_space(dst)?;
        if bytes.is_empty() {
            return Ok(());
        }
        let mut state = self.state.lock();
        let (base, offset) = Self::locate(&state, dst)?;
        let block = state
            .blocks
            .get_mut(&base)
            .ok_or(MemoryError::UnknownAddress { address: dst })?;
        let available = block.len() - offset;
        if bytes.len() > available {
            return Err(MemoryError::OutOfBounds { address: dst, bytes: bytes.len(), available });
        }
        block[offset..offset + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    fn live_blocks(&self) -> usize {
        self.state.lock().blocks.len()
    }

    fn live_bytes(&self) -> usize {
        self.state.lock().live_bytes
    }
}
