//! Offers [`CpuLocal`], a table holding one value per core.
//!
//! Each core reaches its own instance through [`CpuLocal::with()`], which
//! indexes the table by [`cpu::current_cpu()`]. Other cores may look up any
//! instance by [`CpuId`], so the contents must be `Sync` if the table is shared.

#![no_std]

extern crate alloc;

use alloc::{boxed::Box, vec::Vec};
use cpu::CpuId;


pub struct CpuLocal<T> {
    slots: Box<[(CpuId, T)]>,
}

impl<T> CpuLocal<T> {
    /// Creates a table for `count` cores, initializing each slot with `init(cpu)`.
    pub fn new_with<F>(count: usize, mut init: F) -> Result<CpuLocal<T>, &'static str>
    where
        F: FnMut(CpuId) -> T,
    {
        let mut slots = Vec::with_capacity(count);
        for i in 0..count {
            let cpu = CpuId::new(i as u32).ok_or("CpuLocal::new_with(): too many cores")?;
            slots.push((cpu, init(cpu)));
        }
        Ok(CpuLocal { slots: slots.into_boxed_slice() })
    }

    /// Returns the number of cores this table covers.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Returns the instance belonging to `cpu`.
    pub fn get(&self, cpu: CpuId) -> Option<&T> {
        self.slots.get(cpu.index()).map(|(_, slot)| slot)
    }

    /// Invokes `func` with the current core's instance.
    ///
    /// Panics if the current core is not covered by this table,
    /// which means the table was built for a different runtime.
    pub fn with<F, R>(&self, func: F) -> R
    where
        F: FnOnce(&T) -> R,
    {
        let cpu = cpu::current_cpu();
        match self.slots.get(cpu.index()) {
            Some((_, slot)) => func(slot),
            None => panic!("CpuLocal::with(): {:?} has no slot in a table of {}", cpu, self.slots.len()),
        }
    }

    /// Iterates over every core's instance in core order.
    pub fn iter(&self) -> impl Iterator<Item = (CpuId, &T)> {
        self.slots.iter().map(|(cpu, slot)| (*cpu, slot))
    }
}
