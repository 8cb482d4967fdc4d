//! Tests for the early page allocator

use super::*;
use proptest::prelude::*;
use std::vec;

fn range(start: usize, end: usize) -> FrameRange {
    FrameRange::new(Frame::new(start), Frame::new(end))
}

fn two_node_allocator() -> EarlyPageAllocator {
    let alloc = EarlyPageAllocator::new();
    alloc.free_page_range(range(0, 100), Nid::new(0)).unwrap();
    alloc.free_page_range(range(100, 150), Nid::new(1)).unwrap();
    alloc
}

#[test]
fn carve_from_high_end_of_requested_node() {
    let alloc = two_node_allocator();
    let frame = alloc.allocate_page(10, Nid::new(0));
    assert_eq!(frame, Frame::new(90));
    assert_eq!(
        alloc.free_ranges(),
        vec![(range(0, 90), Nid::new(0)), (range(100, 150), Nid::new(1))]
    );
}

#[test]
fn other_node_is_skipped() {
    let alloc = two_node_allocator();
    assert_eq!(alloc.allocate_page(20, Nid::new(1)), Frame::new(130));
    assert_eq!(alloc.free_page_count(Nid::new(0)), 100);
    assert_eq!(alloc.free_page_count(Nid::new(1)), 30);
}

#[test]
fn any_node_takes_first_fit_in_address_order() {
    let alloc = two_node_allocator();
    assert_eq!(alloc.allocate_page(100, Nid::ANY), Frame::new(0));
    assert_eq!(alloc.free_ranges(), vec![(range(100, 150), Nid::new(1))]);
    assert_eq!(alloc.allocate_page(1, Nid::ANY), Frame::new(149));
}

#[test]
fn exact_fit_removes_range() {
    let alloc = two_node_allocator();
    alloc.allocate_page(50, Nid::new(1));
    assert_eq!(alloc.free_ranges(), vec![(range(0, 100), Nid::new(0))]);
}

#[test]
fn exhaustion_is_reported() {
    let alloc = two_node_allocator();
    assert_eq!(
        alloc.try_allocate_page(60, Nid::new(1)),
        Err(AllocationError::OutOfMemory { npages: 60, nid: Nid::new(1) })
    );
}

#[test]
#[should_panic]
fn exhaustion_is_fatal() {
    let alloc = two_node_allocator();
    alloc.allocate_page(101, Nid::new(0));
}

#[test]
fn free_coalesces_both_sides() {
    let alloc = EarlyPageAllocator::new();
    alloc.free_page_range(range(0, 10), Nid::new(0)).unwrap();
    alloc.free_page_range(range(20, 30), Nid::new(0)).unwrap();
    alloc.free_page_range(range(10, 20), Nid::new(0)).unwrap();
    assert_eq!(alloc.free_ranges(), vec![(range(0, 30), Nid::new(0))]);
}

#[test]
fn free_does_not_coalesce_across_nodes() {
    let alloc = EarlyPageAllocator::new();
    alloc.free_page_range(range(0, 10), Nid::new(0)).unwrap();
    alloc.free_page_range(range(10, 20), Nid::new(1)).unwrap();
    assert_eq!(alloc.free_ranges().len(), 2);
}

#[test]
fn double_free_is_rejected() {
    let alloc = two_node_allocator();
    assert!(alloc.free_page_range(range(40, 45), Nid::new(0)).is_err());
    assert!(alloc.free_page_range(range(95, 105), Nid::new(0)).is_err());
    assert!(alloc.free_page_range(range(150, 160), Nid::new(1)).is_ok());
}

#[test]
fn reserved_ranges_are_skipped() {
    let alloc = EarlyPageAllocator::new();
    alloc.reserve_range(PhysicalAddress::new(4 * PAGE_SIZE), PhysicalAddress::new(6 * PAGE_SIZE));
    alloc.reserve_range(PhysicalAddress::new(20 * PAGE_SIZE), PhysicalAddress::new(40 * PAGE_SIZE));
    alloc.free_memory_range(PhysicalAddress::new(0), 32 * PAGE_SIZE, Nid::new(0)).unwrap();
    assert_eq!(
        alloc.free_ranges(),
        vec![(range(0, 4), Nid::new(0)), (range(6, 20), Nid::new(0))]
    );
}

#[test]
fn partial_frames_are_dropped() {
    let alloc = EarlyPageAllocator::new();
    alloc.free_memory_range(PhysicalAddress::new(100), 3 * PAGE_SIZE, Nid::new(0)).unwrap();
    assert_eq!(alloc.free_ranges(), vec![(range(1, 3), Nid::new(0))]);
    alloc.free_memory_range(PhysicalAddress::new(10 * PAGE_SIZE), PAGE_SIZE - 1, Nid::new(0)).unwrap();
    assert_eq!(alloc.free_page_count(Nid::ANY), 2);
}

#[test]
fn set_nid_splits_straddling_ranges() {
    let alloc = EarlyPageAllocator::new();
    alloc.free_page_range(range(0, 100), Nid::new(0)).unwrap();
    alloc.set_nid_range(range(40, 60), Nid::new(1)).unwrap();
    assert_eq!(
        alloc.free_ranges(),
        vec![
            (range(0, 40), Nid::new(0)),
            (range(40, 60), Nid::new(1)),
            (range(60, 100), Nid::new(0)),
        ]
    );
    // mapping the whole thing back merges it again
    alloc.set_nid_range(range(0, 100), Nid::new(0)).unwrap();
    assert_eq!(alloc.free_ranges(), vec![(range(0, 100), Nid::new(0))]);
}

#[test]
fn release_drains_in_address_order() {
    let alloc = two_node_allocator();
    let mut seen = vec![];
    alloc.release_free_pages(|r, nid| seen.push((r, nid)));
    assert_eq!(seen, vec![(range(0, 100), Nid::new(0)), (range(100, 150), Nid::new(1))]);
    assert!(alloc.free_ranges().is_empty());
}

fn sizes_and_free_order() -> impl Strategy<Value = (std::vec::Vec<(usize, u8)>, std::vec::Vec<usize>)> {
    prop::collection::vec((1usize..12, 0u8..2), 1..30).prop_flat_map(|requests| {
        let n = requests.len();
        (Just(requests), Just((0..n).collect::<std::vec::Vec<_>>()).prop_shuffle())
    })
}

proptest! {
    #[test]
    fn balanced_alloc_free_restores_free_set((requests, order) in sizes_and_free_order()) {
        let alloc = EarlyPageAllocator::new();
        alloc.free_page_range(range(0, 400), Nid::new(0)).unwrap();
        alloc.free_page_range(range(400, 800), Nid::new(1)).unwrap();
        let before = alloc.free_ranges();

        let mut live: std::vec::Vec<(FrameRange, Nid)> = std::vec::Vec::new();
        for &(npages, node) in requests.iter() {
            let nid = Nid::new(node);
            let start = alloc.allocate_page(npages, nid);
            let got = FrameRange::with_len(start, npages);
            for (other, _) in live.iter() {
                prop_assert!(!got.overlaps(other));
            }
            for (free, _) in alloc.free_ranges() {
                prop_assert!(!got.overlaps(&free));
            }
            live.push((got, nid));
        }

        for i in order {
            let (r, nid) = live[i];
            alloc.free_page_range(r, nid).unwrap();
            let ranges = alloc.free_ranges();
            for pair in ranges.windows(2) {
                prop_assert!(pair[0].0.end() <= pair[1].0.start());
                prop_assert!(!(pair[0].0.end() == pair[1].0.start() && pair[0].1 == pair[1].1));
            }
        }
        prop_assert_eq!(alloc.free_ranges(), before);
    }
}
