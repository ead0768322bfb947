// Run:
//   cargo test --test rebase -- --nocapture
//
// Deep copies into the device space and explicit push/pull.

mod support;

use residency::prelude::*;
use residency::{Address, BackingStore, MemoryError, StaleViewError, Transfer};
use support::*;

#[test]
fn mirrored_pointers_land_in_the_device_copy_of_the_pointee() {
    let m = device_manager();
    let Grid { grid, x } = grid(&m, 6);
    let g = gpu(&m);

    let mirror = m.mirror_composite(grid, g).unwrap();
    assert_eq!(mirror.address().space(), AddressSpace::Device);

    let child = m.mirrored_child(&mirror, x).unwrap();
    let pointer = Address::from_raw(m.read_member::<u64>(&mirror, 0, GRID_X).unwrap());
    assert_eq!(pointer.space(), AddressSpace::Device);
    assert_eq!(pointer, child.address());

    for k in 0..6 {
        assert_eq!(m.deref_member::<f64>(&mirror, 0, GRID_X, k).unwrap(), k as f64);
    }
    assert_eq!(m.read_member::<u64>(&mirror, 0, GRID_N).unwrap(), 6);

    // The host struct still points at the host array.
    let host = m.read_host::<[u64; 2]>(grid, ElementRange::full(1)).unwrap();
    assert_eq!(host[0][1], m.address_of(x, 0).unwrap().raw());
}

#[test]
fn null_pointers_stay_null() {
    let m = device_manager();
    let Grid { grid, x } = grid(&m, 2);
    m.write_host(grid, 0, &[[2u64, 0]]).unwrap();
    let g = gpu(&m);

    let mirror = m.mirror_composite(grid, g).unwrap();
    assert_eq!(m.read_member::<u64>(&mirror, 0, GRID_X).unwrap(), 0);
    assert_eq!(
        m.mirrored_child(&mirror, x).unwrap_err(),
        ResidencyError::UnknownAllocation(x)
    );
    assert!(matches!(
        m.deref_member::<f64>(&mirror, 0, GRID_X, 0),
        Err(ResidencyError::UnregisteredPointee { .. })
    ));
    assert_eq!(device_blocks(&m), 1);
}

#[test]
fn pointers_into_unregistered_memory_fail_without_leaking() {
    let m = device_manager();
    let Grid { grid, .. } = grid(&m, 2);
    let stray = m.registry().stores().host().raw_alloc(16).unwrap();
    m.write_host(grid, 0, &[[2u64, stray.raw()]]).unwrap();
    let g = gpu(&m);

    assert_eq!(
        m.mirror_composite(grid, g).unwrap_err(),
        ResidencyError::UnregisteredPointee { allocation: grid, address: stray }
    );
    assert_eq!(device_blocks(&m), 0);
    assert_eq!(m.registry().live_views(), 0);
}

#[test]
fn pointers_to_released_allocations_are_use_after_release() {
    let m = device_manager();
    let Grid { grid, x } = grid(&m, 2);
    m.release(x, HOST_CONTEXT).unwrap();
    let g = gpu(&m);

    assert!(matches!(
        m.mirror_composite(grid, g),
        Err(ResidencyError::UseAfterRelease(_))
    ));
    assert_eq!(device_blocks(&m), 0);
}

#[test]
fn a_pointee_reached_twice_is_mirrored_once() {
    let m = device_manager();
    let x = m.allocate_array(HOST_CONTEXT, &[1.0f64, 2.0, 3.0, 4.0]).unwrap();
    let pair = m
        .allocate_composite(HOST_CONTEXT, 2, 8, vec![CompositeMember::owned_pointer(0)])
        .unwrap();
    let (x0, x2) = (m.address_of(x, 0).unwrap(), m.address_of(x, 2).unwrap());
    m.write_host(pair, 0, &[x0.raw(), x2.raw()]).unwrap();
    let g = gpu(&m);

    let mirror = m.mirror_composite(pair, g).unwrap();
    let views = m.registry().views_of(x).unwrap();
    assert_eq!(views.len(), 1);

    let child = m.mirrored_child(&mirror, x).unwrap();
    let second: u64 = m.read_member(&mirror, 1, 0).unwrap();
    assert_eq!(Address::from_raw(second), child.address().add(16));
    assert_eq!(m.deref_member::<f64>(&mirror, 1, 0, 0).unwrap(), 3.0);
    assert_eq!(device_blocks(&m), 2);
}

#[test]
fn removing_the_root_removes_every_mirrored_child() {
    let m = device_manager();
    let Grid { grid, .. } = grid(&m, 4);
    let g = gpu(&m);

    let mirror = m.mirror_composite(grid, g).unwrap();
    assert_eq!(device_blocks(&m), 2);
    assert_eq!(m.registry().live_views(), 2);

    m.remove_view(&mirror).unwrap();
    assert_eq!(device_blocks(&m), 0);
    assert_eq!(m.registry().live_views(), 0);
}

#[test]
fn partial_push_moves_exactly_the_requested_elements() {
    let m = device_manager();
    let values: Vec<f64> = (0..10).map(|i| i as f64).collect();
    let a = m.allocate_array(HOST_CONTEXT, &values).unwrap();
    let g = gpu(&m);
    let view = m.enter_region(a, g, DuplicationMode::CopyIn).unwrap();

    m.write_host(a, 0, &[-1.0f64]).unwrap();
    m.write_host(a, 2, &[100.0f64, 101.0, 102.0]).unwrap();
    m.mark_host_dirty(&view, Some(ElementRange::new(2, 3))).unwrap();

    // update device(A[2:3])
    assert_eq!(m.push(&view, Some(ElementRange::new(2, 3))).unwrap(), 24);

    let device = m.read_elements::<f64>(&view, ElementRange::full(10)).unwrap();
    assert_eq!(device, vec![0.0, 1.0, 100.0, 101.0, 102.0, 5.0, 6.0, 7.0, 8.0, 9.0]);
    assert_eq!(m.sync_state(&view).unwrap(), SyncState::Clean);
}

#[test]
fn strict_transfers_require_a_dirty_declaration() {
    let m = device_manager();
    let a = m.allocate_array(HOST_CONTEXT, &[0u32; 4]).unwrap();
    let g = gpu(&m);
    let view = m.enter_region(a, g, DuplicationMode::CopyIn).unwrap();

    let stale = ResidencyError::StaleView(StaleViewError { view: view.id(), transfer: Transfer::Push });
    assert_eq!(m.push(&view, None).unwrap_err(), stale);
    assert_eq!(m.push(&view, Some(ElementRange::new(0, 1))).unwrap_err(), stale);

    m.mark_host_dirty(&view, Some(ElementRange::new(3, 1))).unwrap();
    assert_eq!(m.push(&view, Some(ElementRange::new(0, 1))).unwrap_err(), stale);
    assert_eq!(m.push(&view, None).unwrap(), 4);

    assert!(matches!(
        m.pull(&view, None),
        Err(ResidencyError::StaleView(StaleViewError { transfer: Transfer::Pull, .. }))
    ));
}

#[test]
fn lax_transfers_proceed_over_the_full_extent() {
    let m = lax_device_manager();
    let a = m.allocate_array(HOST_CONTEXT, &[0u32; 4]).unwrap();
    let g = gpu(&m);
    let view = m.enter_region(a, g, DuplicationMode::CopyIn).unwrap();

    m.write_host(a, 0, &[1u32, 2, 3, 4]).unwrap();
    assert_eq!(m.push(&view, None).unwrap(), 16);
    assert_eq!(m.read_elements::<u32>(&view, ElementRange::full(4)).unwrap(), vec![1, 2, 3, 4]);
}

#[test]
fn out_of_range_transfers_are_rejected() {
    let m = device_manager();
    let a = m.allocate_array(HOST_CONTEXT, &[0u32; 4]).unwrap();
    let g = gpu(&m);
    let view = m.enter_region(a, g, DuplicationMode::CopyIn).unwrap();

    assert!(matches!(
        m.push(&view, Some(ElementRange::new(2, 3))),
        Err(ResidencyError::RangeOutOfBounds { .. })
    ));
}

#[test]
fn shared_views_have_nothing_to_transfer() {
    let m = host_manager();
    let a = m.allocate_array(HOST_CONTEXT, &[0u32; 4]).unwrap();
    let view = m.enter_region(a, thread(&m), DuplicationMode::Shared).unwrap();

    assert!(matches!(m.push(&view, None), Err(ResidencyError::UnsupportedMode(_))));
    assert!(matches!(m.pull(&view, None), Err(ResidencyError::UnsupportedMode(_))));
}

#[test]
fn composite_transfers_never_touch_pointer_members() {
    let m = device_manager();
    let Grid { grid, x } = grid(&m, 4);
    let g = gpu(&m);
    let mirror = m.mirror_composite(grid, g).unwrap();
    let device_pointer: u64 = m.read_member(&mirror, 0, GRID_X).unwrap();

    let x_addr = m.address_of(x, 0).unwrap();
    m.write_host(grid, 0, &[[99u64, x_addr.raw()]]).unwrap();
    m.mark_host_dirty(&mirror, None).unwrap();
    assert_eq!(m.push(&mirror, None).unwrap(), 8);

    assert_eq!(m.read_member::<u64>(&mirror, 0, GRID_N).unwrap(), 99);
    assert_eq!(m.read_member::<u64>(&mirror, 0, GRID_X).unwrap(), device_pointer);

    m.mark_device_dirty(&mirror, None).unwrap();
    assert_eq!(m.pull(&mirror, None).unwrap(), 8);
    let host = m.read_host::<[u64; 2]>(grid, ElementRange::full(1)).unwrap();
    assert_eq!(host[0], [99, x_addr.raw()]);
}

#[test]
fn device_writes_through_a_member_come_back_with_pull() {
    let m = device_manager();
    let Grid { grid, x } = grid(&m, 4);
    let g = gpu(&m);
    let mirror = m.mirror_composite(grid, g).unwrap();

    m.write_through_member(&mirror, 0, GRID_X, 1, 7.5f64).unwrap();
    assert_eq!(m.read_host::<f64>(x, ElementRange::new(1, 1)).unwrap(), vec![1.0]);

    let child = m.mirrored_child(&mirror, x).unwrap();
    m.mark_device_dirty(&child, Some(ElementRange::new(1, 1))).unwrap();
    assert_eq!(m.pull(&child, None).unwrap(), 8);
    assert_eq!(m.read_host::<f64>(x, ElementRange::full(4)).unwrap(), vec![0.0, 7.5, 2.0, 3.0]);
}

#[test]
fn device_copy_in_of_a_composite_is_a_mirror() {
    let m = device_manager();
    let Grid { grid, x } = grid(&m, 3);
    let g = gpu(&m);

    let view = m.enter_region(grid, g, DuplicationMode::CopyIn).unwrap();
    assert_eq!(m.deref_member::<f64>(&view, 0, GRID_X, 2).unwrap(), 2.0);
    assert_eq!(m.mirrored_child(&view, x).unwrap().context(), g);
    m.exit_region(&view).unwrap();
    assert_eq!(device_blocks(&m), 0);
}

#[test]
fn stores_never_hand_out_a_freed_address_again() {
    let m = device_manager();
    let store = m.registry().stores().device().unwrap();
    let first = store.raw_alloc(8).unwrap();
    store.raw_free(first).unwrap();
    let second = store.raw_alloc(8).unwrap();
    assert_ne!(first, second);
}

#[test]
fn dereferencing_past_the_pointee_is_out_of_bounds() {
    let m = host_manager();
    let a = m.allocate_array(HOST_CONTEXT, &[1i64; 8]).unwrap();
    let b = m.allocate_array(HOST_CONTEXT, &[2i64; 8]).unwrap();
    // 64-byte blocks are packed back to back.
    assert_eq!(m.address_of(b, 0).unwrap(), m.address_of(a, 0).unwrap().add(64));

    let holder = m
        .allocate_composite(HOST_CONTEXT, 1, 8, vec![CompositeMember::owned_pointer(0)])
        .unwrap();
    m.write_host(holder, 0, &[m.address_of(a, 0).unwrap().raw()]).unwrap();
    let view = m.enter_region(holder, thread(&m), DuplicationMode::Shared).unwrap();

    assert_eq!(m.deref_member::<i64>(&view, 0, 0, 7).unwrap(), 1);
    assert!(matches!(
        m.deref_member::<i64>(&view, 0, 0, 8),
        Err(ResidencyError::RangeOutOfBounds { allocation, offset: 8, count: 1, len: 8 }) if allocation == a
    ));
    assert!(matches!(
        m.write_through_member(&view, 0, 0, 8, 99i64),
        Err(ResidencyError::RangeOutOfBounds { .. })
    ));
    assert!(matches!(
        m.deref_member::<i64>(&view, 0, 0, usize::MAX),
        Err(ResidencyError::RangeOutOfBounds { .. })
    ));
    assert_eq!(m.read_host::<i64>(b, ElementRange::full(8)).unwrap(), vec![2; 8]);

    // An interior pointer is bounded by the same extent.
    m.write_host(holder, 0, &[m.address_of(a, 6).unwrap().raw()]).unwrap();
    assert_eq!(m.deref_member::<i64>(&view, 0, 0, 1).unwrap(), 1);
    assert!(matches!(
        m.deref_member::<i64>(&view, 0, 0, 2),
        Err(ResidencyError::RangeOutOfBounds { offset: 8, .. })
    ));
    m.exit_region(&view).unwrap();
}

#[test]
fn device_views_refuse_host_pointers() {
    let m = device_manager();
    let Grid { grid, x } = grid(&m, 4);
    let mirror = m.mirror_composite(grid, gpu(&m)).unwrap();

    m.write_member(&mirror, 0, GRID_X, m.address_of(x, 0).unwrap().raw()).unwrap();
    assert!(matches!(
        m.deref_member::<f64>(&mirror, 0, GRID_X, 0),
        Err(ResidencyError::Memory(MemoryError::ForeignAddress { store: AddressSpace::Device, .. }))
    ));
    m.remove_view(&mirror).unwrap();
}
