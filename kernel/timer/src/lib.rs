//! Per-core timers.
//!
//! Each core keeps its pending hooks ordered by fire time and arms the event
//! manager's alarm for the earliest one. When the alarm's vector fires, every
//! hook that is due runs on the core that started it; repeating hooks are
//! re-armed one interval after they fire.

#[macro_use] extern crate log;


use core::time::Duration;
use ebb::{multicore, Ebb, EbbId, EbbRef, LocalIdMap};
use ebb_id::TIMER_ID;
use event_manager::{EventContext, EVENT_MANAGER};
use hashbrown::HashMap;
use spin::{Mutex, Once};
use std::{collections::BTreeMap, sync::Arc};
use time::Instant;

pub const TIMER: EbbRef<Timer> = EbbRef::new(TIMER_ID);

/// Registers the timer, whose representatives are created per core on first use.
pub fn init(map: &LocalIdMap) -> Result<EbbRef<Timer>, &'static str> {
    multicore::create_static::<Timer>(map, TIMER_ID)
}

/// Identifies a started hook on the core that started it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HookId(u64);

type HookFn = Arc<Mutex<dyn FnMut() + Send>>;

struct Hook {
    f: HookFn,
    repeat: Option<Duration>,
}

#[derive(Default)]
struct TimerState {
    hooks: BTreeMap<(Instant, HookId), Hook>,
    fire_times: HashMap<HookId, Instant>,
    next_id: u64,
}

impl TimerState {
    fn insert(&mut self, id: HookId, when: Instant, hook: Hook) {
        self.hooks.insert((when, id), hook);
        self.fire_times.insert(id, when);
    }

    fn earliest(&self) -> Option<Instant> {
        self.hooks.keys().next().map(|(when, _)| *when)
    }
}

/// A core's timer.
pub struct Timer {
    state: Mutex<TimerState>,
    vector: Once<u8>,
}

impl Default for Timer {
    fn default() -> Self {
        Timer { state: Mutex::new(TimerState::default()), vector: Once::new() }
    }
}

impl Ebb for Timer {
    fn handle_fault(id: EbbId) -> Arc<Timer> {
        multicore::handle_static_fault(id)
    }
}

impl Timer {
    /// Runs `f` on this core once `timeout` has passed, and every `timeout`
    /// after that if `repeat` is set.
    pub fn start<F: FnMut() + Send + 'static>(&self, timeout: Duration, repeat: bool, f: F) -> HookId {
        let when = Instant::now() + timeout;
        let id = {
            let mut state = self.state.lock();
            let id = HookId(state.next_id);
            state.next_id += 1;
            let hook = Hook { f: Arc::new(Mutex::new(f)), repeat: repeat.then_some(timeout) };
            state.insert(id, when, hook);
            id
        };
        trace!("timer: hook {:?} due in {:?}", id, timeout);
        self.rearm();
        id
    }

    /// Cancels hook `id`. Returns false if it already fired or was stopped.
    pub fn stop(&self, id: HookId) -> bool {
        let removed = {
            let mut state = self.state.lock();
            match state.fire_times.remove(&id) {
                Some(when) => state.hooks.remove(&(when, id)).is_some(),
                None => false,
            }
        };
        if removed {
            self.rearm();
        }
        removed
    }

    /// The fire time of the earliest pending hook, which is when this core's alarm goes off.
    pub fn deadline(&self) -> Option<Instant> {
        self.state.lock().earliest()
    }

    pub fn pending(&self) -> usize {
        self.state.lock().hooks.len()
    }

    fn vector(&self) -> u8 {
        *self.vector.call_once(|| EVENT_MANAGER.with(|em| em.allocate_vector(|| TIMER.with(|timer| timer.fire()))))
    }

    fn rearm(&self) {
        let vector = self.vector();
        let deadline = self.deadline();
        EVENT_MANAGER.with(|em| match deadline {
            Some(deadline) => em.set_alarm(vector, deadline),
            None => em.clear_alarm(),
        })
    }

    /// Runs every hook that is due. Hooks run without the timer locked, so
    /// they may start and stop hooks themselves.
    fn fire(&self) {
        let now = Instant::now();
        let due: Vec<HookFn> = {
            let mut state = self.state.lock();
            let keys: Vec<(Instant, HookId)> = state.hooks
                .range(..=(now, HookId(u64::MAX)))
                .map(|(key, _)| *key)
                .collect();
            keys.into_iter()
                .filter_map(|key| {
                    let hook = state.hooks.remove(&key)?;
                    state.fire_times.remove(&key.1);
                    let f = hook.f.clone();
                    if let Some(interval) = hook.repeat {
                        state.insert(key.1, now + interval, hook);
                    }
                    Some(f)
                })
                .collect()
        };
        for f in due {
            (&mut *f.lock())();
        }
        self.rearm();
    }
}

/// Suspends the calling event for at least `duration`. The core runs other events meanwhile.
pub async fn sleep(duration: Duration) {
    let context = EventContext::new();
    let mut activator = Some(context.activator());
    TIMER.get().start(duration, false, move || {
        if let Some(activator) = activator.take() {
            activator.activate();
        }
    });
    context.save().await;
}
