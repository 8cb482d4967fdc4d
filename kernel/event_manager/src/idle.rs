use crate::local;
use core::sync::atomic::{AtomicBool, Ordering};
use cpu::CpuId;
use spin::{Mutex, Once};
use std::sync::Arc;

pub(crate) type IdleFn = Arc<Mutex<dyn FnMut() + Send>>;

/// A function the event loop calls whenever its core has no task to run.
///
/// While an idle callback is started its core polls instead of halting, which
/// is how drivers poll devices. A core runs at most one idle callback.
pub struct IdleCallback {
    f: IdleFn,
    started: AtomicBool,
    cpu: Once<CpuId>,
}

impl IdleCallback {
    pub fn new<F: FnMut() + Send + 'static>(f: F) -> IdleCallback {
        IdleCallback { f: Arc::new(Mutex::new(f)), started: AtomicBool::new(false), cpu: Once::new() }
    }

    /// Starts calling this callback on the current core.
    ///
    /// Starting a second callback on a core that already has one is a bug.
    pub fn start(&self) {
        if self.started.load(Ordering::SeqCst) {
            return;
        }
        let cpu = cpu::current_cpu();
        let clash = local::with_local(|l| {
            if l.idle.is_some() {
                return true;
            }
            l.idle = Some(self.f.clone());
            false
        });
        if clash {
            error!("multiple idle callbacks on {:?}", cpu);
            panic!("event manager: multiple idle callbacks");
        }
        self.cpu.call_once(|| cpu);
        self.started.store(true, Ordering::SeqCst);
    }

    /// Stops calling this callback. Must run on the core that started it.
    pub fn stop(&self) {
        if !self.started.swap(false, Ordering::SeqCst) {
            return;
        }
        if self.cpu.get() != Some(&cpu::current_cpu()) {
            error!("idle callback of {:?} stopped on {:?}", self.cpu.get(), cpu::current_cpu());
            panic!("event manager: idle callback stopped on the wrong core");
        }
        local::try_with_local(|l| {
            if l.idle.as_ref().map_or(false, |f| Arc::ptr_eq(f, &self.f)) {
                l.idle = None;
            }
        });
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }
}
