extern crate std;

use super::*;
use cpu::CpuId;
use mem_map::MemMap;
use memory_structs::{Frame, FrameRange};

fn page_allocator(node0: usize, node1: usize) -> Arc<PageAllocator> {
    let ranges = [
        (FrameRange::new(Frame::new(0), Frame::new(node0)), Nid::new(0)),
        (FrameRange::new(Frame::new(node0), Frame::new(node0 + node1)), Nid::new(1)),
    ];
    let map = MemMap::new(ranges).unwrap();
    let pa = PageAllocator::new(Arc::new(map), 2);
    for (range, nid) in ranges {
        pa.add_free_range(range, nid).unwrap();
    }
    Arc::new(pa)
}

fn bind() {
    cpu::bind_current(CpuId::new(0).unwrap(), Nid::new(0)).unwrap();
}

#[test]
fn smallest_fitting_class_is_chosen() {
    let gp = GpAllocator::with_default_classes(page_allocator(64, 64), &[Nid::new(0)]).unwrap();
    let class = |size| gp.class_size(gp.size_class(size).unwrap()).unwrap();
    assert_eq!(class(1), 8);
    assert_eq!(class(8), 8);
    assert_eq!(class(9), 16);
    assert_eq!(class(65), 96);
    assert_eq!(class(97), 128);
    assert_eq!(class(600), 1024);
    assert_eq!(class(1 << 23), 1 << 23);
    assert_eq!(gp.size_class((1 << 23) + 1), Err(AllocationError::TooLarge { size: (1 << 23) + 1 }));
}

#[test]
fn invalid_tables_are_rejected() {
    let pa = page_allocator(64, 64);
    assert!(GpAllocator::new(&[], pa.clone(), &[Nid::new(0)]).is_err());
    assert!(GpAllocator::new(&[16, 8], pa.clone(), &[Nid::new(0)]).is_err());
    assert!(GpAllocator::new(&[8, MAX_SLAB_SIZE + 8], pa, &[Nid::new(0)]).is_err());
}

#[test]
fn falls_back_to_the_next_node() {
    bind();
    let pa = page_allocator(16, 64);
    let gp = GpAllocator::new(&[1 << 16], pa.clone(), &[Nid::new(0)]).unwrap();
    let first = gp.alloc(1 << 16, Nid::new(0));
    assert_eq!(pa.mem_map().nid(Frame::containing_address(first)), Some(Nid::new(0)));
    let second = gp.alloc(1 << 16, Nid::new(0));
    assert_eq!(pa.mem_map().nid(Frame::containing_address(second)), Some(Nid::new(1)));
    for _ in 0..3 {
        gp.alloc(1 << 16, Nid::ANY);
    }
    assert_eq!(
        gp.try_alloc(1 << 16, Nid::new(0)),
        Err(AllocationError::OutOfMemory { size: 1 << 16, nid: Nid::new(0) })
    );
}

#[test]
#[should_panic]
fn exhaustion_is_fatal() {
    bind();
    let gp = GpAllocator::new(&[1 << 16], page_allocator(16, 0), &[Nid::new(0)]).unwrap();
    gp.alloc(1 << 16, Nid::new(0));
    gp.alloc(1 << 16, Nid::new(0));
}

#[test]
fn oversized_request_is_an_error() {
    bind();
    let gp = GpAllocator::with_default_classes(page_allocator(64, 64), &[Nid::new(0)]).unwrap();
    assert!(matches!(gp.try_alloc(MAX_SLAB_SIZE + 1, Nid::new(0)), Err(AllocationError::TooLarge { .. })));
}

#[test]
fn free_finds_the_size_class() {
    bind();
    let pa = page_allocator(256, 256);
    let gp = GpAllocator::with_default_classes(pa.clone(), &[Nid::new(0)]).unwrap();
    let small = gp.alloc(24, Nid::new(0));
    let big = gp.alloc(5000, Nid::new(1));
    assert_eq!(gp.usable_size(small), Ok(32));
    assert_eq!(gp.usable_size(big), Ok(8192));
    gp.free(small).unwrap();
    gp.free(big).unwrap();
    assert!(gp.free(PhysicalAddress::new(1 << 40)).is_err());
    gp.drain();
    assert_eq!(pa.free_page_count(Nid::ANY), 512);
}

#[test]
fn double_free_is_refused() {
    bind();
    let gp = GpAllocator::with_default_classes(page_allocator(64, 64), &[Nid::new(0)]).unwrap();
    let a = gp.alloc(64, Nid::new(0));
    assert_eq!(gp.free(a), Ok(()));
    assert!(gp.free(a).is_err());
    assert!(gp.usable_size(a).is_err());
    let x = gp.alloc(64, Nid::new(0));
    let y = gp.alloc(64, Nid::new(0));
    assert_ne!(x, y);
    // interior addresses are not objects
    assert!(gp.free(x + 8).is_err());
    assert_eq!(gp.usable_size(x), Ok(64));
}

#[test]
fn released_slabs_forget_their_objects() {
    bind();
    let pa = page_allocator(64, 64);
    let gp = GpAllocator::new(&[1 << 16], pa.clone(), &[Nid::new(0)]).unwrap();
    let obj = gp.alloc(1 << 16, Nid::new(0));
    assert_eq!((gp.live_count(), gp.slab_pages()), (1, 16));
    gp.free(obj).unwrap();
    assert_eq!(gp.live_count(), 0);
    gp.drain();
    assert_eq!(gp.slab_pages(), 0);
    assert_eq!(pa.free_page_count(Nid::ANY), 128);
    assert!(pa.mem_map().addr_to_page(obj + 4096).unwrap().slab().is_none());
    assert!(gp.usable_size(obj).is_err());
    assert!(gp.usable_size(obj + 4096).is_err());
    assert!(gp.free(obj).is_err());
}
