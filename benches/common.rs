#![allow(dead_code)]

use residency::prelude::*;
use residency::{AllocationID, ResidencyResult as Result};

pub const ELEMENTS_SMALL: usize = 1_000;
pub const ELEMENTS_MED: usize = 100_000;
pub const ELEMENTS_LARGE: usize = 1_000_000;

pub fn setup_manager(chunks: usize) -> Result<ResidencyManager> {
    let config = ResidencyConfig::builder()
        .device(DeviceBackend::Simulated)
        .worker_chunks(chunks)
        .build()?;
    ResidencyManager::new(config)
}

pub fn setup_array(manager: &ResidencyManager, len: usize) -> Result<AllocationID> {
    let values: Vec<f64> = (0..len).map(|i| i as f64).collect();
    manager.allocate_array(HOST_CONTEXT, &values)
}

/// `struct grid { int64 n; double *x; }` over `len` doubles.
pub fn setup_grid(manager: &ResidencyManager, len: usize) -> Result<(AllocationID, AllocationID)> {
    let x = setup_array(manager, len)?;
    let grid = manager.allocate_composite(HOST_CONTEXT, 1, 16, vec![
        CompositeMember::value(0, 8),
        CompositeMember::owned_pointer(8),
    ])?;
    let x_addr = manager.address_of(x, 0)?;
    manager.write_host(grid, 0, &[[len as u64, x_addr.raw()]])?;
    Ok((grid, x))
}
