extern crate std;

use super::*;
use std::format;

#[test]
fn static_ids_keep_their_order() {
    let ids = [
        PAGE_ALLOCATOR_ID, GP_ALLOCATOR_ID, LOCAL_ID_MAP_ID, EBB_ALLOCATOR_ID,
        EVENT_MANAGER_ID, VMEM_ALLOCATOR_ID, TIMER_ID, GLOBAL_ID_MAP_ID,
    ];
    for (i, id) in ids.iter().enumerate() {
        assert_eq!(id.value(), i as u32);
        assert!(id.is_static());
    }
    assert_eq!(FIRST_FREE_ID, 8);
    assert!(!EbbId::new(FIRST_FREE_ID).is_static());
}

#[test]
fn debug_names_static_ids() {
    assert_eq!(format!("{:?}", TIMER_ID), "EbbId(6:TIMER_ID)");
    assert_eq!(format!("{:?}", EbbId::new(42)), "EbbId(42)");
    assert_eq!(format!("{}", EbbId::new(42)), "ebb42");
}

#[test]
fn global_ranges() {
    let (lo, hi) = global_id_range(1);
    assert_eq!((lo.value(), hi.value()), (1 << 16, (2 << 16) - 1));
    assert_eq!(lo.id_space(), Some(1));
    assert_eq!(hi.id_space(), Some(1));
    assert!(EbbId::new(LAST_LOCAL_ID).is_local());
    assert_eq!(EbbId::new(LAST_LOCAL_ID).id_space(), None);
}
