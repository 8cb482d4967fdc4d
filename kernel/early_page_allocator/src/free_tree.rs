use alloc::boxed::Box;
use core::cell::Cell;
use intrusive_collections::{intrusive_adapter, KeyAdapter, RBTreeLink};
use memory_structs::{Frame, FrameRange, Nid};

/// One free range of page frames stored in the address-ordered tree.
///
/// The tree is keyed by `start`, which never changes while the node is in the tree;
/// only the end may be adjusted in place.
#[derive(Debug)]
pub(crate) struct RangeNode {
    link: RBTreeLink,
    start: Frame,
    end: Cell<Frame>,
    nid: Nid,
}

intrusive_adapter!(pub(crate) RangeAdapter = Box<RangeNode>: RangeNode { link: RBTreeLink });

impl<'a> KeyAdapter<'a> for RangeAdapter {
    type Key = Frame;
    fn get_key(&self, value: &'a RangeNode) -> Frame {
        value.start
    }
}

impl RangeNode {
    pub(crate) fn new_link(range: FrameRange, nid: Nid) -> Box<RangeNode> {
        Box::new(RangeNode {
            link: RBTreeLink::new(),
            start: range.start(),
            end: Cell::new(range.end()),
            nid,
        })
    }

    pub(crate) fn start(&self) -> Frame {
        self.start
    }

    pub(crate) fn end(&self) -> Frame {
        self.end.get()
    }

    pub(crate) fn set_end(&self, end: Frame) {
        self.end.set(end)
    }

    pub(crate) fn nid(&self) -> Nid {
        self.nid
    }

    pub(crate) fn range(&self) -> FrameRange {
        FrameRange::new(self.start, self.end.get())
    }

    pub(crate) fn npages(&self) -> usize {
        self.end.get() - self.start
    }
}
