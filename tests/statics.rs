// Run:
//   cargo test --test statics -- --nocapture

mod support;

use residency::prelude::*;
use residency::Lifecycle;
use support::*;

#[test]
fn every_thread_context_sees_the_same_static() {
    let m = host_manager();
    let id = m.declare_static("counter::n", HOST_CONTEXT, &[5i64], false).unwrap();
    let (t1, t2) = (thread(&m), thread(&m));

    assert_eq!(m.static_allocation("counter::n").unwrap(), id);
    let address = m.static_address("counter::n", t1).unwrap();
    assert_eq!(address, m.static_address("counter::n", t2).unwrap());
    assert_eq!(address, m.address_of(id, 0).unwrap());

    m.write_static("counter::n", t1, 0, 6i64).unwrap();
    assert_eq!(m.read_static::<i64>("counter::n", t2, 0).unwrap(), 6);
}

#[test]
fn names_are_unique_until_released() {
    let m = host_manager();
    let id = m.declare_static("c::table", HOST_CONTEXT, &[1u32, 2], false).unwrap();

    assert!(matches!(
        m.declare_static("c::table", HOST_CONTEXT, &[3u32], false),
        Err(ResidencyError::DuplicateStatic(_))
    ));
    assert_eq!(host_blocks(&m), 1);

    m.release(id, HOST_CONTEXT).unwrap();
    assert!(matches!(
        m.static_allocation("c::table"),
        Err(ResidencyError::UnknownStatic(_))
    ));

    let again = m.declare_static("c::table", HOST_CONTEXT, &[3u32], false).unwrap();
    assert_ne!(again, id);
    assert_eq!(m.lifecycle(id).unwrap(), Lifecycle::Released);
}

#[test]
fn unknown_statics_are_reported_by_name() {
    let m = host_manager();
    let err = m.static_address("nobody::here", HOST_CONTEXT).unwrap_err();
    assert_eq!(err, ResidencyError::UnknownStatic("nobody::here".into()));
    assert!(matches!(
        m.update_static_device("nobody::here", None),
        Err(ResidencyError::UnknownStatic(_))
    ));
}

#[test]
fn device_mirrors_need_a_device_store() {
    let m = host_manager();
    assert_eq!(
        m.declare_static("c::x", HOST_CONTEXT, &[0u8; 4], true).unwrap_err(),
        ResidencyError::NoDeviceStore
    );
    assert_eq!(host_blocks(&m), 0);
    assert!(m.static_allocation("c::x").is_err());
}

#[test]
fn device_contexts_need_a_declared_mirror() {
    let m = device_manager();
    m.declare_static("c::host_only", HOST_CONTEXT, &[1u16], false).unwrap();
    let g = gpu(&m);

    assert!(matches!(
        m.static_address("c::host_only", g),
        Err(ResidencyError::StaticNotMirrored(_))
    ));
    assert!(matches!(
        m.update_static_device("c::host_only", None),
        Err(ResidencyError::StaticNotMirrored(_))
    ));
}

#[test]
fn device_mirror_reads_zeros_until_updated() {
    let m = device_manager();
    let id = m.declare_static("c::dataset", HOST_CONTEXT, &[1i64, 2, 3], true).unwrap();
    let g = gpu(&m);

    let device = m.static_address("c::dataset", g).unwrap();
    assert_eq!(device.space(), AddressSpace::Device);
    assert_eq!(m.read_static::<i64>("c::dataset", g, 1).unwrap(), 0);

    assert_eq!(m.update_static_device("c::dataset", None).unwrap(), 24);
    assert_eq!(m.read_static::<i64>("c::dataset", g, 1).unwrap(), 2);

    m.write_host(id, 0, &[10i64]).unwrap();
    assert_eq!(m.update_static_device("c::dataset", Some(ElementRange::new(0, 1))).unwrap(), 8);
    assert_eq!(m.read_static::<i64>("c::dataset", g, 0).unwrap(), 10);
}

#[test]
fn device_results_come_back_with_update_host() {
    let m = device_manager();
    let id = m.declare_static("c::out", HOST_CONTEXT, &[0i32; 4], true).unwrap();
    let g = gpu(&m);

    m.write_static("c::out", g, 2, 33i32).unwrap();
    m.write_static("c::out", g, 3, 44i32).unwrap();
    assert_eq!(m.update_static_host("c::out", Some(ElementRange::new(2, 1))).unwrap(), 4);
    assert_eq!(m.read_host::<i32>(id, ElementRange::full(4)).unwrap(), vec![0, 0, 33, 0]);
}

#[test]
fn releasing_a_static_frees_its_device_mirror() {
    let m = device_manager();
    let id = m.declare_static("c::tmp", HOST_CONTEXT, &[0u64; 2], true).unwrap();
    assert_eq!(device_blocks(&m), 1);

    m.release(id, HOST_CONTEXT).unwrap();
    assert_eq!(device_blocks(&m), 0);
    assert_eq!(host_blocks(&m), 0);
}

#[test]
fn static_members_resolve_per_address_space() {
    let m = device_manager();
    m.declare_static("c::weights", HOST_CONTEXT, &[0.25f32, 0.75], true).unwrap();
    let holder = m
        .allocate_composite(HOST_CONTEXT, 3, 8, vec![CompositeMember::static_shared(0, "c::weights")])
        .unwrap();
    let (t, g) = (thread(&m), gpu(&m));

    let host_view = m.enter_region(holder, t, DuplicationMode::PrivateUninitialized).unwrap();
    let device_view = m.enter_region(holder, g, DuplicationMode::PrivateUninitialized).unwrap();
    for element in 0..3 {
        assert_eq!(
            m.read_member::<u64>(&host_view, element, 0).unwrap(),
            m.static_address("c::weights", t).unwrap().raw()
        );
        assert_eq!(
            m.read_member::<u64>(&device_view, element, 0).unwrap(),
            m.static_address("c::weights", g).unwrap().raw()
        );
    }

    m.update_static_device("c::weights", None).unwrap();
    assert_eq!(m.deref_member::<f32>(&host_view, 2, 0, 1).unwrap(), 0.75);
    assert_eq!(m.deref_member::<f32>(&device_view, 2, 0, 1).unwrap(), 0.75);

    // A device copy-in rebases the static slot to the mirror as well.
    let mirrored = m.enter_region(holder, g, DuplicationMode::CopyIn).unwrap();
    assert_eq!(
        m.read_member::<u64>(&mirrored, 0, 0).unwrap(),
        m.static_address("c::weights", g).unwrap().raw()
    );
}
