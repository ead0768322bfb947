// Run:
//   cargo test --test static_dataset -- --nocapture
//
// Run with profiling:
//   cargo test --features profiling --test static_dataset -- --nocapture
//
// A class whose only member is a pointer to a class-level static dataset.
// Each of N loop iterations gets its own private, uninitialized instance;
// every instance must still reach the one shared dataset:
//
//   class c_test { static long *dataset; long report_number(int i); };
//   #pragma omp parallel for private(obj)
//   for (i = 0; i < N; i++) dataset2[i] = obj.report_number(i);

mod support;

use residency::prelude::*;
use support::*;

const N: usize = 100;
const DATASET: &str = "c_test::dataset";
const REPORT_NUMBER: usize = 0;

fn dataset() -> Vec<i64> {
    (0..N as i64).collect()
}

#[test]
fn private_instances_report_from_the_shared_dataset() {
    let m = host_manager();
    let ds = m.declare_static(DATASET, HOST_CONTEXT, &dataset(), false).unwrap();
    let c_test = m
        .allocate_composite(HOST_CONTEXT, 1, 8, vec![CompositeMember::static_shared(REPORT_NUMBER, DATASET)])
        .unwrap();
    let dataset2 = m.allocate_array(HOST_CONTEXT, &[0i64; N]).unwrap();

    m.parallel_for(c_test, DuplicationMode::PrivateUninitialized, N, |m, obj, i| {
        let n: i64 = m.deref_member(obj, 0, REPORT_NUMBER, i)?;
        m.write_host(dataset2, i, &[n])
    })
    .unwrap();

    assert_eq!(m.read_host::<i64>(dataset2, ElementRange::full(N)).unwrap(), dataset());
    assert_eq!(m.registry().live_views(), 0);

    // The dataset outlives every instance and is released exactly once.
    m.release(ds, HOST_CONTEXT).unwrap();
    assert!(matches!(m.release(ds, HOST_CONTEXT), Err(ResidencyError::DoubleRelease(_))));
}

#[test]
fn one_instance_per_iteration() {
    let m = host_manager();
    m.declare_static(DATASET, HOST_CONTEXT, &dataset(), false).unwrap();
    let c_test = m
        .allocate_composite(HOST_CONTEXT, 1, 8, vec![CompositeMember::static_shared(REPORT_NUMBER, DATASET)])
        .unwrap();
    let dataset2 = m.allocate_array(HOST_CONTEXT, &[0i64; N]).unwrap();

    m.parallel_for(dataset2, DuplicationMode::Shared, N, |m, out, i| {
        let obj = m.enter_region(c_test, out.context(), DuplicationMode::PrivateUninitialized)?;
        let n: i64 = m.deref_member(&obj, 0, REPORT_NUMBER, i)?;
        m.exit_region(&obj)?;
        m.write_element(out, i, n)
    })
    .unwrap();

    assert_eq!(m.read_host::<i64>(dataset2, ElementRange::full(N)).unwrap(), dataset());
    assert_eq!(m.registry().live_views(), 0);
    assert_eq!(host_blocks(&m), 3);
}

#[test]
fn device_instances_read_the_declared_mirror() {
    let m = device_manager();
    m.declare_static(DATASET, HOST_CONTEXT, &dataset(), true).unwrap();
    let c_test = m
        .allocate_composite(HOST_CONTEXT, 1, 8, vec![CompositeMember::static_shared(REPORT_NUMBER, DATASET)])
        .unwrap();
    let g = gpu(&m);

    let obj = m.enter_region(c_test, g, DuplicationMode::PrivateUninitialized).unwrap();
    assert_eq!(m.deref_member::<i64>(&obj, 0, REPORT_NUMBER, 7).unwrap(), 0);

    m.update_static_device(DATASET, None).unwrap();
    let expected = dataset();
    for i in 0..N {
        assert_eq!(m.deref_member::<i64>(&obj, 0, REPORT_NUMBER, i).unwrap(), expected[i]);
    }
    m.exit_region(&obj).unwrap();
}
