//! Tests for the address, chunk and range types

extern crate std;

use super::*;

#[test]
fn frame_address_round_trip() {
    let frame = Frame::containing_address(PhysicalAddress::new(0x5123));
    assert_eq!(frame.number(), 5);
    assert_eq!(frame.start_address(), PhysicalAddress::new(0x5000));
    assert_eq!(PhysicalAddress::new(0x5123).frame_offset(), 0x123);
}

#[test]
fn round_up_and_down() {
    assert_eq!(Frame::round_up(PhysicalAddress::new(0x5000)).number(), 5);
    assert_eq!(Frame::round_up(PhysicalAddress::new(0x5001)).number(), 6);
    assert_eq!(Frame::containing_address(PhysicalAddress::new(0x5fff)).number(), 5);
}

#[test]
fn alignment() {
    assert!(Frame::new(16).is_aligned(4));
    assert!(!Frame::new(18).is_aligned(2));
    assert_eq!(Frame::new(19).align_down(2), Frame::new(16));
}

#[test]
fn range_size_and_contains() {
    let r = FrameRange::new(Frame::new(10), Frame::new(20));
    assert_eq!(r.size_in_frames(), 10);
    assert_eq!(r.size_in_bytes(), 10 * PAGE_SIZE);
    assert!(r.contains(Frame::new(10)));
    assert!(!r.contains(Frame::new(20)));
    assert!(r.contains_address(PhysicalAddress::new(19 * PAGE_SIZE + 7)));
    assert_eq!(r.iter().count(), 10);
}

#[test]
fn inverted_range_is_empty() {
    let r = PageRange::new(Page::new(8), Page::new(3));
    assert!(r.is_empty());
    assert_eq!(r.size_in_pages(), 0);
}

#[test]
fn overlap() {
    let a = FrameRange::new(Frame::new(0), Frame::new(10));
    let b = FrameRange::new(Frame::new(10), Frame::new(12));
    let c = FrameRange::with_len(Frame::new(9), 2);
    assert!(!a.overlaps(&b));
    assert!(a.overlaps(&c));
    assert!(b.overlaps(&c));
}

#[test]
fn nid_any_accepts_everything() {
    assert!(Nid::ANY.accepts(Nid::new(3)));
    assert!(Nid::new(1).accepts(Nid::new(1)));
    assert!(!Nid::new(1).accepts(Nid::new(0)));
    assert_eq!(std::format!("{}", Nid::new(2)), "node2");
}
