// Run with the GPU backend enabled:
//   cargo test --features gpu --test wgpu_store -- --nocapture
//
// Skips (with a message) when no adapter is available.

#![cfg(feature = "gpu")]

use std::sync::Arc;

use residency::gpu::WgpuMemory;
use residency::prelude::*;
use residency::{BackingStore, BlockArena, Stores};

fn wgpu_manager() -> Option<ResidencyManager> {
    let device = match WgpuMemory::open(0) {
        Ok(device) => device,
        Err(e) => {
            eprintln!("skipping: {e}");
            return None;
        }
    };
    let stores = Stores::new(BlockArena::host(0), Some(Arc::new(device)));
    Some(ResidencyManager::with_stores(ResidencyConfig::default(), stores).unwrap())
}

#[test]
fn unaligned_reads_and_writes_round_trip() {
    let Some(m) = wgpu_manager() else { return };
    let store = m.registry().stores().device().unwrap();

    let block = store.raw_alloc(7).unwrap();
    store.write(block.add(1), &[1, 2, 3]).unwrap();
    let mut out = [0u8; 7];
    store.read(block, &mut out).unwrap();
    assert_eq!(out, [0, 1, 2, 3, 0, 0, 0]);

    store.raw_free(block).unwrap();
    assert_eq!(store.live_blocks(), 0);
}

#[test]
fn grid_mirror_on_a_real_device() {
    let Some(m) = wgpu_manager() else { return };
    let x = m.allocate_array(HOST_CONTEXT, &[0.5f64, 1.5, 2.5]).unwrap();
    let grid = m
        .allocate_composite(HOST_CONTEXT, 1, 16, vec![
            CompositeMember::value(0, 8),
            CompositeMember::owned_pointer(8),
        ])
        .unwrap();
    let x_addr = m.address_of(x, 0).unwrap();
    m.write_host(grid, 0, &[[3u64, x_addr.raw()]]).unwrap();

    let gpu = m.create_context(ContextKind::Device).unwrap();
    let mirror = m.mirror_composite(grid, gpu.id).unwrap();
    assert_eq!(m.deref_member::<f64>(&mirror, 0, 8, 2).unwrap(), 2.5);

    m.write_through_member(&mirror, 0, 8, 0, 9.0f64).unwrap();
    let child = m.mirrored_child(&mirror, x).unwrap();
    m.mark_device_dirty(&child, Some(ElementRange::new(0, 1))).unwrap();
    m.pull(&child, None).unwrap();
    assert_eq!(m.read_host::<f64>(x, ElementRange::full(3)).unwrap(), vec![9.0, 1.5, 2.5]);

    m.exit_region(&mirror).unwrap();
}
