#![cfg(test)]
#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use residency::prelude::*;
use residency::{Address, AllocationID, BackingStore, BlockArena, ContextID, MemoryError, Stores};

/// Host-only manager with a fixed chunk count.
pub fn host_manager() -> ResidencyManager {
    let config = ResidencyConfig::builder().worker_chunks(4).build().unwrap();
    ResidencyManager::new(config).unwrap()
}

/// Manager with a simulated device address space and strict transfers.
pub fn device_manager() -> ResidencyManager {
    let config = ResidencyConfig::builder()
        .device(DeviceBackend::Simulated)
        .worker_chunks(4)
        .build()
        .unwrap();
    ResidencyManager::new(config).unwrap()
}

/// Like [`device_manager`] but transfers over undeclared ranges only warn.
pub fn lax_device_manager() -> ResidencyManager {
    let config = ResidencyConfig::builder()
        .device(DeviceBackend::Simulated)
        .strict_sync(false)
        .build()
        .unwrap();
    ResidencyManager::new(config).unwrap()
}

pub fn thread(m: &ResidencyManager) -> ContextID {
    m.create_context(ContextKind::Thread).unwrap().id
}

pub fn gpu(m: &ResidencyManager) -> ContextID {
    m.create_context(ContextKind::Device).unwrap().id
}

/// `struct grid { int64 n; double *x; }` pointing at a fresh `x[len]`
/// holding `0.0, 1.0, 2.0, ...`.
pub struct Grid {
    pub grid: AllocationID,
    pub x: AllocationID,
}

pub const GRID_N: usize = 0;
pub const GRID_X: usize = 8;

pub fn grid(m: &ResidencyManager, len: usize) -> Grid {
    let values: Vec<f64> = (0..len).map(|i| i as f64).collect();
    let x = m.allocate_array(HOST_CONTEXT, &values).unwrap();
    let grid = m
        .allocate_composite(HOST_CONTEXT, 1, 16, vec![
            CompositeMember::value(GRID_N, 8),
            CompositeMember::owned_pointer(GRID_X),
        ])
        .unwrap();
    let x_addr = m.address_of(x, 0).unwrap();
    m.write_host(grid, 0, &[[len as u64, x_addr.raw()]]).unwrap();
    Grid { grid, x }
}

pub fn device_blocks(m: &ResidencyManager) -> usize {
    m.registry().stores().device().unwrap().live_blocks()
}

pub fn host_blocks(m: &ResidencyManager) -> usize {
    m.registry().stores().host().live_blocks()
}

/// Arena whose writes or frees can be made to fail on demand.
pub struct FaultyStore {
    inner: BlockArena,
    pub fail_writes: AtomicBool,
    pub fail_frees: AtomicBool,
}

impl FaultyStore {
    pub fn new(space: AddressSpace) -> Arc<Self> {
        Arc::new(Self {
            inner: BlockArena::new(space, 0),
            fail_writes: AtomicBool::new(false),
            fail_frees: AtomicBool::new(false),
        })
    }

    fn injected(flag: &AtomicBool, what: &'static str) -> Result<(), MemoryError> {
        if flag.load(Ordering::SeqCst) {
            return Err(MemoryError::Backend { message: what.into() });
        }
        Ok(())
    }
}

impl BackingStore for FaultyStore {
    fn space(&self) -> AddressSpace {
        self.inner.space()
    }

    fn label(&self) -> &'static str {
        "faulty-arena"
    }

    fn raw_alloc(&self, bytes: usize) -> Result<Address, MemoryError> {
        self.inner.raw_alloc(bytes)
    }

    fn raw_free(&self, address: Address) -> Result<(), MemoryError> {
        Self::injected(&self.fail_frees, "free failed")?;
        self.inner.raw_free(address)
    }

    fn read(&self, src: Address, out: &mut [u8]) -> Result<(), MemoryError> {
        self.inner.read(src, out)
    }

    fn write(&self, dst: Address, bytes: &[u8]) -> Result<(), MemoryError> {
        Self::injected(&self.fail_writes, "write failed")?;
        self.inner.write(dst, bytes)
    }

    fn live_blocks(&self) -> usize {
        self.inner.live_blocks()
    }

    fn live_bytes(&self) -> usize {
        self.inner.live_bytes()
    }
}

/// Manager over faulty stores, running `parallel_for` as one chunk.
pub fn faulty_manager(host: &Arc<FaultyStore>, device: Option<&Arc<FaultyStore>>) -> ResidencyManager {
    let config = ResidencyConfig::builder().worker_chunks(1).build().unwrap();
    let device = device.map(|d| d.clone() as Arc<dyn BackingStore>);
    ResidencyManager::with_stores(config, Stores::new(host.clone(), device)).unwrap()
}
