//! Saving and reactivating the context of a running event.
//!
//! An event that has to wait for something, such as a reply from another
//! core, creates an [`EventContext`], hands its [`Activator`] to whoever
//! will finish the work, and awaits [`EventContext::save()`]. The core runs
//! other events meanwhile. [`Activator::activate()`] makes the saved event
//! runnable again on the core it was saved on; if it is called before the
//! event saves, the save completes immediately.

use core::{
    future::Future,
    pin::Pin,
    task::{Context, Poll, Waker},
};
use cpu::CpuId;
use spin::Mutex;
use std::sync::Arc;

#[derive(Default)]
struct ContextState {
    activated: bool,
    waker: Option<Waker>,
}

pub struct EventContext {
    cpu: CpuId,
    event_id: u32,
    state: Arc<Mutex<ContextState>>,
}

impl EventContext {
    /// Creates a context for the calling event.
    pub fn new() -> EventContext {
        EventContext {
            cpu: cpu::current_cpu(),
            event_id: crate::event_id(),
            state: Arc::new(Mutex::new(ContextState::default())),
        }
    }

    /// The core the event runs on, and is reactivated on.
    pub fn cpu(&self) -> CpuId {
        self.cpu
    }

    pub fn event_id(&self) -> u32 {
        self.event_id
    }

    pub fn activator(&self) -> Activator {
        Activator { cpu: self.cpu, state: self.state.clone() }
    }

    /// Suspends the calling event until the context is activated.
    pub fn save(&self) -> SaveContext<'_> {
        SaveContext { context: self }
    }
}

impl Default for EventContext {
    fn default() -> Self {
        Self::new()
    }
}

#[must_use = "futures do nothing unless you `.await` or poll them"]
pub struct SaveContext<'a> {
    context: &'a EventContext,
}

impl Future for SaveContext<'_> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let mut state = self.context.state.lock();
        if state.activated {
            state.activated = false;
            Poll::Ready(())
        } else {
            state.waker = Some(cx.waker().clone());
            Poll::Pending
        }
    }
}

/// Reactivates a saved [`EventContext`]. May be sent to and used on any core.
#[derive(Clone)]
pub struct Activator {
    cpu: CpuId,
    state: Arc<Mutex<ContextState>>,
}

impl Activator {
    /// The core the context will resume on.
    pub fn cpu(&self) -> CpuId {
        self.cpu
    }

    pub fn activate(self) {
        let waker = {
            let mut state = self.state.lock();
            state.activated = true;
            state.waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}
