extern crate std;

use super::*;
use cpu::CpuId;
use memory_structs::{Frame, FrameRange};
use std::{thread, vec::Vec as StdVec};

const NODE_FRAMES: usize = 4096;

fn page_allocator() -> Arc<PageAllocator> {
    let ranges = [
        (FrameRange::new(Frame::new(0), Frame::new(NODE_FRAMES)), Nid::new(0)),
        (FrameRange::new(Frame::new(NODE_FRAMES), Frame::new(2 * NODE_FRAMES)), Nid::new(1)),
    ];
    let map = MemMap::new(ranges).unwrap();
    let pa = PageAllocator::new(Arc::new(map), 2);
    for (range, nid) in ranges {
        pa.add_free_range(range, nid).unwrap();
    }
    Arc::new(pa)
}

fn root(id: usize, size: usize, pa: &Arc<PageAllocator>) -> Arc<SlabAllocatorRoot> {
    Arc::new(SlabAllocatorRoot::new(id, size, 0, pa.clone(), &[Nid::new(0), Nid::new(1)]).unwrap())
}

fn bind(cpu: u32, node: u8) {
    cpu::bind_current(CpuId::new(cpu).unwrap(), Nid::new(node)).unwrap();
}

#[test]
fn geometry_follows_object_size() {
    let pa = page_allocator();
    let r = root(0, 8, &pa);
    assert_eq!((r.size(), r.align(), r.order()), (8, 8, 0));
    assert_eq!((r.free_batch(), r.hiwater(), r.objects_per_slab()), (2048, 8192, 512));

    assert_eq!(root(0, 10, &pa).size(), 16);
    let r = SlabAllocatorRoot::new(0, 10, 24, pa.clone(), &[Nid::new(0)]).unwrap();
    assert_eq!((r.align(), r.size()), (24, 24));

    let r = root(0, 96, &pa);
    assert_eq!((r.order(), r.objects_per_slab()), (0, 42));

    let r = root(0, 8192, &pa);
    assert_eq!((r.order(), r.objects_per_slab(), r.free_batch()), (1, 1, 32));

    // a quarter of waste is too much for a small slab, so the minimal order wins
    assert_eq!(root(0, 3000, &pa).order(), 0);

    let r = root(0, 1 << 23, &pa);
    assert_eq!((r.order(), r.free_batch(), r.hiwater()), (11, 1, 4));

    assert!(SlabAllocatorRoot::new(0, (1 << 23) + 1, 0, pa, &[Nid::new(0)]).is_err());
}

#[test]
fn local_allocations_are_tagged() {
    bind(0, 0);
    let pa = page_allocator();
    let r = root(7, 64, &pa);
    let a = r.alloc().unwrap();
    let b = r.alloc().unwrap();
    assert_eq!(a, PhysicalAddress::new(0));
    assert_eq!(b, PhysicalAddress::new(64));
    let tag = r.mem_map().addr_to_page(b).unwrap().slab().unwrap();
    assert_eq!(tag.root, 7);
    assert_eq!(tag.owner, CacheOwner::Cpu(CpuId::new(0).unwrap()));
    assert_eq!(r.slab_count(), 1);
}

#[test]
fn freed_object_is_reused_first() {
    bind(0, 0);
    let pa = page_allocator();
    let r = root(1, 128, &pa);
    let _a = r.alloc().unwrap();
    let b = r.alloc().unwrap();
    r.free(b).unwrap();
    assert_eq!(r.alloc(), Some(b));
}

#[test]
fn foreign_node_allocations_use_the_node_allocator() {
    bind(0, 0);
    let pa = page_allocator();
    let r = root(2, 64, &pa);
    let obj = r.alloc_on(Nid::new(1)).unwrap();
    let page = r.mem_map().addr_to_page(obj).unwrap();
    assert_eq!(page.nid(), Nid::new(1));
    assert_eq!(page.slab().unwrap().owner, CacheOwner::Node(Nid::new(1)));
    assert!(r.node_allocator(Nid::new(1)).is_some());
    assert_eq!(r.alloc_on(Nid::new(0)).map(|o| r.mem_map().nid(Frame::containing_address(o))), Some(Some(Nid::new(0))));
}

#[test]
fn empty_slabs_return_to_the_page_allocator() {
    bind(0, 0);
    let pa = page_allocator();
    let r = root(3, 1 << 16, &pa);
    assert_eq!((r.order(), r.free_batch(), r.hiwater()), (4, 4, 16));

    let objs: StdVec<_> = (0..20).map(|_| r.alloc().unwrap()).collect();
    assert_eq!(pa.free_page_count(Nid::new(0)), NODE_FRAMES - 20 * 16);
    for obj in objs {
        r.free(obj).unwrap();
    }
    // crossing the high watermark flushed one batch back to the slabs
    assert_eq!(r.slab_count(), 16);
    assert_eq!(pa.free_page_count(Nid::new(0)), NODE_FRAMES - 16 * 16);

    r.drain();
    assert_eq!(r.slab_count(), 0);
    assert_eq!(pa.free_page_count(Nid::new(0)), NODE_FRAMES);
}

#[test]
fn remote_frees_are_batched_to_the_owner() {
    bind(0, 0);
    let pa = page_allocator();
    let r = root(4, 1 << 16, &pa);

    let remote_root = r.clone();
    let objs = thread::spawn(move || {
        bind(1, 1);
        (0..6).map(|_| remote_root.alloc().unwrap()).collect::<StdVec<_>>()
    }).join().unwrap();

    for &obj in objs.iter() {
        r.free(obj).unwrap();
    }
    let cpu0 = r.cpu_allocator(CpuId::new(0).unwrap()).unwrap();
    let cpu1 = r.cpu_allocator(CpuId::new(1).unwrap()).unwrap();
    assert_eq!(cpu1.cache.remote_len(), 5);
    assert_eq!(cpu0.remote.lock().objects.len(), 1);

    let remote_root = r.clone();
    let reused = thread::spawn(move || {
        bind(1, 1);
        remote_root.alloc().unwrap()
    }).join().unwrap();
    assert!(objs.contains(&reused));
    assert_eq!(cpu1.cache.remote_len(), 0);
    assert_eq!(cpu1.cache.free_object_count(), 4);
    // no new slab was needed
    assert_eq!(pa.free_page_count(Nid::new(1)), NODE_FRAMES - 6 * 16);
}

#[test]
fn drain_returns_everything() {
    bind(0, 0);
    let pa = page_allocator();
    let r = root(5, 256, &pa);
    let mut objs: StdVec<_> = (0..100).map(|_| r.alloc().unwrap()).collect();
    objs.extend((0..50).map(|_| r.alloc_on(Nid::new(1)).unwrap()));
    for obj in objs {
        r.free(obj).unwrap();
    }
    r.drain();
    assert_eq!(pa.free_page_count(Nid::ANY), 2 * NODE_FRAMES);
}

#[test]
fn bad_frees_are_rejected() {
    bind(0, 0);
    let pa = page_allocator();
    let r = root(6, 64, &pa);
    let other = root(8, 64, &pa);
    assert!(r.free(PhysicalAddress::new(0x10)).is_err());
    assert!(r.free(PhysicalAddress::new(1 << 40)).is_err());
    let obj = other.alloc().unwrap();
    assert!(r.free(obj).is_err());
    assert!(other.free(obj).is_ok());
}

#[test]
fn double_free_is_refused() {
    bind(0, 0);
    let pa = page_allocator();
    let r = root(9, 64, &pa);
    let a = r.alloc().unwrap();
    assert!(r.is_live(a));
    r.free(a).unwrap();
    assert!(!r.is_live(a));
    assert!(r.free(a).is_err());
    let x = r.alloc().unwrap();
    let y = r.alloc().unwrap();
    assert_ne!(x, y);
    assert!(r.is_live(x) && r.is_live(y));
    assert_eq!(r.live_count(), 2);
}

#[test]
fn double_free_on_another_core_is_refused() {
    bind(0, 0);
    let pa = page_allocator();
    let r = root(10, 64, &pa);
    let obj = r.alloc().unwrap();
    r.free(obj).unwrap();
    let remote_root = r.clone();
    let second = thread::spawn(move || {
        bind(1, 1);
        remote_root.free(obj)
    }).join().unwrap();
    assert!(second.is_err());
    assert_eq!(r.cpu_allocator(CpuId::new(1).unwrap()).unwrap().remote.lock().objects.len(), 0);
}

#[test]
fn released_slabs_are_untagged() {
    bind(0, 0);
    let pa = page_allocator();
    let r = root(11, 1 << 16, &pa);
    let obj = r.alloc().unwrap();
    r.free(obj).unwrap();
    r.drain();
    for n in 0..16 {
        let page = r.mem_map().addr_to_page(obj + n * PAGE_SIZE).unwrap();
        assert!(page.slab().is_none());
    }
    assert!(!r.is_live(obj));
    assert!(r.free(obj).is_err());
}
