//! A hash table that readers walk without taking any lock.
//!
//! Each bucket is a singly linked list of heap nodes. Writers serialize on a
//! lock and publish a node by storing it into its predecessor's link with
//! release ordering. A removed node is unlinked at once, but its memory is
//! handed to [`EventManager::do_rcu()`](crate::EventManager::do_rcu) and only
//! freed once every core has passed a quiescent point, so a reader that was
//! already standing on it keeps a valid node and can still follow its link.
//!
//! Readers get borrowed access inside a closure. The closure runs within the
//! calling task, and a core is not quiescent while a task runs, so nothing
//! a reader can see is freed before it returns. Reads and writes must happen
//! on cores of the runtime.

use crate::EVENT_MANAGER;
use core::{
    borrow::Borrow,
    hash::{BuildHasher, Hash, Hasher},
    ptr,
    sync::atomic::{AtomicPtr, AtomicUsize, Ordering},
};
use hashbrown::hash_map::DefaultHashBuilder;
use spin::Mutex;

struct Node<K, V> {
    key: K,
    value: V,
    next: AtomicPtr<Node<K, V>>,
}

pub struct RcuHashTable<K, V> {
    buckets: Box<[AtomicPtr<Node<K, V>>]>,
    hasher: DefaultHashBuilder,
    writer: Mutex<()>,
    len: AtomicUsize,
}

// The table owns its nodes and hands out only shared references to them.
unsafe impl<K: Send + Sync, V: Send + Sync> Send for RcuHashTable<K, V> {}
unsafe impl<K: Send + Sync, V: Send + Sync> Sync for RcuHashTable<K, V> {}

impl<K: Hash + Eq, V> RcuHashTable<K, V> {
    /// Creates an empty table with `buckets` buckets, rounded up to a power of two.
    pub fn new(buckets: usize) -> RcuHashTable<K, V> {
        let buckets = buckets.max(1).next_power_of_two();
        RcuHashTable {
            buckets: (0..buckets).map(|_| AtomicPtr::new(ptr::null_mut())).collect(),
            hasher: DefaultHashBuilder::default(),
            writer: Mutex::new(()),
            len: AtomicUsize::new(0),
        }
    }

    fn bucket<Q: Hash + ?Sized>(&self, key: &Q) -> &AtomicPtr<Node<K, V>> {
        let mut hasher = self.hasher.build_hasher();
        key.hash(&mut hasher);
        let index = hasher.finish() as usize & (self.buckets.len() - 1);
        &self.buckets[index]
    }

    /// Runs `f` on the value stored under `key`.
    pub fn find<Q, R>(&self, key: &Q, f: impl FnOnce(&V) -> R) -> Option<R>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        debug_assert!(cpu::try_current_cpu().is_some(), "RCU table read off a runtime core");
        let mut node = self.bucket(key).load(Ordering::Acquire);
        // SAFETY: published nodes are freed only after a grace period, which
        // cannot end while this task is running.
        while let Some(n) = unsafe { node.as_ref() } {
            if n.key.borrow() == key {
                return Some(f(&n.value));
            }
            node = n.next.load(Ordering::Acquire);
        }
        None
    }

    pub fn contains<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.find(key, |_| ()).is_some()
    }

    /// Calls `f` on every entry, in no particular order.
    pub fn for_each(&self, mut f: impl FnMut(&K, &V)) {
        debug_assert!(cpu::try_current_cpu().is_some(), "RCU table read off a runtime core");
        for bucket in self.buckets.iter() {
            let mut node = bucket.load(Ordering::Acquire);
            // SAFETY: as in `find()`.
            while let Some(n) = unsafe { node.as_ref() } {
                f(&n.key, &n.value);
                node = n.next.load(Ordering::Acquire);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the link that points at the node holding `key`, if any.
    ///
    /// Must be called with the writer lock held.
    fn link_to<Q>(&self, key: &Q) -> Option<&AtomicPtr<Node<K, V>>>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let mut link = self.bucket(key);
        loop {
            // SAFETY: the writer lock keeps every linked node in place.
            let node = unsafe { link.load(Ordering::Relaxed).as_ref() }?;
            if node.key.borrow() == key {
                return Some(link);
            }
            link = &node.next;
        }
    }

    /// Adds `value` under `key` unless the key is already present.
    ///
    /// Returns true if the entry was added.
    pub fn insert(&self, key: K, value: V) -> bool {
        let _writer = self.writer.lock();
        if self.link_to(&key).is_some() {
            return false;
        }
        let bucket = self.bucket(&key);
        let head = bucket.load(Ordering::Relaxed);
        let node = Box::into_raw(Box::new(Node { key, value, next: AtomicPtr::new(head) }));
        bucket.store(node, Ordering::Release);
        self.len.fetch_add(1, Ordering::Relaxed);
        true
    }
}

impl<K: Hash + Eq + 'static, V: 'static> RcuHashTable<K, V> {
    /// Unlinks the entry under `key`. Its memory is freed after a grace period.
    ///
    /// Returns false if there was no such entry.
    pub fn remove<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let _writer = self.writer.lock();
        let link = match self.link_to(key) {
            Some(link) => link,
            None => return false,
        };
        let node = link.load(Ordering::Relaxed);
        // SAFETY: `link_to()` found a live node behind `link`.
        let next = unsafe { (*node).next.load(Ordering::Relaxed) };
        link.store(next, Ordering::Release);
        self.len.fetch_sub(1, Ordering::Relaxed);
        retire(node);
        true
    }

    /// Replaces the value under `key`, freeing the old one after a grace period.
    ///
    /// Readers see either the old or the new value. Returns false, dropping
    /// `value`, if there was no such entry.
    pub fn replace(&self, key: K, value: V) -> bool {
        let _writer = self.writer.lock();
        let link = match self.link_to(&key) {
            Some(link) => link,
            None => return false,
        };
        let old = link.load(Ordering::Relaxed);
        // SAFETY: as in `remove()`.
        let next = unsafe { (*old).next.load(Ordering::Relaxed) };
        let node = Box::into_raw(Box::new(Node { key, value, next: AtomicPtr::new(next) }));
        link.store(node, Ordering::Release);
        retire(old);
        true
    }
}

/// Frees an unlinked node once no reader can still be standing on it.
fn retire<K: 'static, V: 'static>(node: *mut Node<K, V>) {
    EVENT_MANAGER.with(|em| em.do_rcu(move || {
        // SAFETY: the node was unlinked before the grace period began and
        // nothing else owns it.
        drop(unsafe { Box::from_raw(node) });
    }));
}

impl<K, V> Drop for RcuHashTable<K, V> {
    fn drop(&mut self) {
        for bucket in self.buckets.iter() {
            let mut node = bucket.swap(ptr::null_mut(), Ordering::Relaxed);
            while !node.is_null() {
                // SAFETY: with `&mut self` there are no readers, and unlinked
                // nodes are no longer reachable from the buckets.
                let owned = unsafe { Box::from_raw(node) };
                node = owned.next.load(Ordering::Relaxed);
            }
        }
    }
}
