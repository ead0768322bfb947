// Run:
//   cargo test --test present_grid -- --nocapture
//
//   struct grid { int64 n; double *x; } g;
//   #pragma acc enter data copyin(g) create(g.x[0:n])
//   #pragma acc parallel loop present(g)   g.x[i] = i * 0.5
//   #pragma acc update self(g.x[0:n])

mod support;

use residency::prelude::*;
use support::*;

const N: usize = 16;

#[test]
fn device_fill_is_visible_after_update_self() {
    let m = device_manager();
    let Grid { grid, x } = grid(&m, N);
    let g = gpu(&m);

    let mirror = m.enter_region(grid, g, DuplicationMode::CopyIn).unwrap();

    // present(g): the pointee is already resident for this context.
    let resident = m.registry().views_of(x).unwrap();
    assert_eq!(resident.len(), 1);
    assert_eq!(resident[0].context(), g);

    let n = m.read_member::<u64>(&mirror, 0, GRID_N).unwrap() as usize;
    assert_eq!(n, N);
    for i in 0..n {
        m.write_through_member(&mirror, 0, GRID_X, i, i as f64 * 0.5).unwrap();
    }

    let x_mirror = m.mirrored_child(&mirror, x).unwrap();
    m.mark_device_dirty(&x_mirror, None).unwrap();
    assert_eq!(m.pull(&x_mirror, Some(ElementRange::full(N))).unwrap(), N * 8);

    let expected: Vec<f64> = (0..N).map(|i| i as f64 * 0.5).collect();
    assert_eq!(m.read_host::<f64>(x, ElementRange::full(N)).unwrap(), expected);

    // Host struct keeps its host pointer.
    let host = m.read_host::<[u64; 2]>(grid, ElementRange::full(1)).unwrap();
    assert_eq!(host[0], [N as u64, m.address_of(x, 0).unwrap().raw()]);

    m.exit_region(&mirror).unwrap();
    assert_eq!(device_blocks(&m), 0);
}

#[test]
fn partial_update_self_moves_only_the_slice() {
    let m = device_manager();
    let Grid { grid, x } = grid(&m, N);
    let g = gpu(&m);
    let mirror = m.mirror_composite(grid, g).unwrap();

    for i in 0..N {
        m.write_through_member(&mirror, 0, GRID_X, i, -1.0f64).unwrap();
    }
    let x_mirror = m.mirrored_child(&mirror, x).unwrap();
    m.mark_device_dirty(&x_mirror, None).unwrap();

    // update self(g.x[4:2])
    assert_eq!(m.pull(&x_mirror, Some(ElementRange::new(4, 2))).unwrap(), 16);
    let host = m.read_host::<f64>(x, ElementRange::full(N)).unwrap();
    for (i, v) in host.iter().enumerate() {
        let expected = if (4..6).contains(&i) { -1.0 } else { i as f64 };
        assert_eq!(*v, expected);
    }

    // The rest is still declared device-dirty.
    assert_eq!(m.sync_state(&x_mirror).unwrap(), SyncState::DeviceDirty);
    m.remove_view(&mirror).unwrap();
}
