//! Tests for the event loop, run on real threads standing in for cores

use super::*;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use kernel_config::scheduler::{EVENT_ID_CPU_SHIFT, FIRST_FREE_VECTOR};
use memory_structs::{Frame, FrameRange, Nid};
use std::{
    sync::{mpsc, Mutex},
    thread::{self, JoinHandle},
    time::Duration as StdDuration,
    vec::Vec,
};

const WAIT: StdDuration = StdDuration::from_secs(10);

struct Cores {
    root: Arc<EventManagerRoot>,
    threads: Vec<JoinHandle<()>>,
}

fn boot(root: EventManagerRoot) -> Cores {
    let map = Arc::new(LocalIdMap::new());
    let n = root.num_cores();
    let root = init(&map, root).unwrap();
    let threads = (0..n as u32).map(|i| {
        let map = map.clone();
        thread::spawn(move || {
            cpu::bind_current(CpuId::new(i).unwrap(), Nid::new(0)).unwrap();
            ebb::bind_core(map).unwrap();
            start_processing_events();
            ebb::unbind_core();
        })
    }).collect();
    Cores { root, threads }
}

fn start(n: usize) -> Cores {
    boot(EventManagerRoot::new(n).unwrap())
}

fn cpu(n: u32) -> CpuId {
    CpuId::new(n).unwrap()
}

impl Cores {
    /// Runs `f` as a task on core `on` and returns its output.
    fn run<T, F, Fut>(&self, on: u32, f: F) -> T
    where
        T: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        self.root.spawn_remote(async move {
            let _ = tx.send(f().await);
        }, cpu(on));
        rx.recv_timeout(WAIT).unwrap()
    }

    fn stop(self) {
        self.root.shutdown();
        for t in self.threads {
            t.join().unwrap();
        }
    }
}

#[test]
fn remote_spawn_runs_on_target_core() {
    let cores = start(3);
    for n in 0..3 {
        assert_eq!(cores.run(n, || async { cpu::current_cpu() }), cpu(n));
    }
    cores.stop();
}

#[test]
fn synchronous_spawn_runs_before_returning() {
    let cores = start(1);
    let (ran_inline, deferred_later) = cores.run(0, || async {
        let em = EVENT_MANAGER.get();
        let flag = Arc::new(AtomicBool::new(false));
        let f = flag.clone();
        em.spawn(async move { f.store(true, Ordering::SeqCst) });
        let ran_inline = flag.load(Ordering::SeqCst);

        let deferred = Arc::new(AtomicBool::new(false));
        let d = deferred.clone();
        let handle = em.spawn_local(async move { d.store(true, Ordering::SeqCst) }, true);
        assert!(!deferred.load(Ordering::SeqCst));
        assert_eq!(handle.state(), TaskState::Runnable);
        yield_now().await;
        (ran_inline, deferred.load(Ordering::SeqCst))
    });
    assert!(ran_inline);
    assert!(deferred_later);
    cores.stop();
}

#[test]
fn local_tasks_run_in_fifo_order() {
    let cores = start(1);
    let order = cores.run(0, || async {
        let em = EVENT_MANAGER.get();
        let log = Arc::new(Mutex::new(Vec::new()));
        let (done, finished) = promise();
        for i in 0..5 {
            let log = log.clone();
            em.spawn_local(async move { log.lock().unwrap().push(i) }, true);
        }
        em.spawn_local(async move { done.set_value(()) }, true);
        finished.await;
        let order = log.lock().unwrap().clone();
        order
    });
    assert_eq!(order, vec![0, 1, 2, 3, 4]);
    cores.stop();
}

#[test]
fn saved_context_resumes_with_locals_intact() {
    let cores = start(2);
    let (before, after) = cores.run(0, || async {
        let canary: u64 = 0xDEAD_BEEF_CAFE_F00D;
        let numbers = vec![1, 2, 3];
        let context = EventContext::new();
        let activator = context.activator();
        let id = event_id();
        EVENT_MANAGER.get().spawn_remote(async move {
            assert_eq!(cpu::current_cpu(), CpuId::new(1).unwrap());
            activator.activate();
        }, CpuId::new(1).unwrap());
        context.save().await;
        assert_eq!(canary, 0xDEAD_BEEF_CAFE_F00D);
        assert_eq!(numbers, vec![1, 2, 3]);
        assert_eq!(event_id(), id);
        (context.cpu(), cpu::current_cpu())
    });
    assert_eq!(before, cpu(0));
    assert_eq!(after, cpu(0));
    cores.stop();
}

#[test]
fn activation_before_save_does_not_suspend() {
    let cores = start(1);
    let state = cores.run(0, || async {
        let context = EventContext::new();
        context.activator().activate();
        context.save().await;
        // a second save needs a second activation
        let context2 = EventContext::new();
        let act = context2.activator();
        let handle = EVENT_MANAGER.get().spawn(async move {
            context2.save().await;
        });
        let suspended = handle.state();
        act.activate();
        yield_now().await;
        (suspended, handle.state())
    });
    assert_eq!(state, (TaskState::Suspended, TaskState::Completed));
    cores.stop();
}

#[test]
fn activation_from_a_foreign_thread() {
    let cores = start(1);
    let (tx, rx) = mpsc::channel();
    let (done_tx, done_rx) = mpsc::channel();
    cores.root.spawn_remote(async move {
        let context = EventContext::new();
        tx.send(context.activator()).unwrap();
        context.save().await;
        done_tx.send(cpu::current_cpu()).unwrap();
    }, cpu(0));
    let activator: Activator = rx.recv_timeout(WAIT).unwrap();
    assert_eq!(activator.cpu(), cpu(0));
    activator.activate();
    assert_eq!(done_rx.recv_timeout(WAIT).unwrap(), cpu(0));
    cores.stop();
}

#[test]
fn event_ids_carry_the_core() {
    let cores = start(2);
    let a = cores.run(1, || async { event_id() });
    let b = cores.run(1, || async { event_id() });
    assert_eq!(a >> EVENT_ID_CPU_SHIFT, 1);
    assert_eq!(b >> EVENT_ID_CPU_SHIFT, 1);
    assert_ne!(a, b);
    assert_eq!(cores.run(0, || async { event_id() }) >> EVENT_ID_CPU_SHIFT, 0);
    cores.stop();
}

#[test]
fn tls_map_is_per_task() {
    let cores = start(1);
    let (mine, other) = cores.run(0, || async {
        with_tls_map(|map| map.insert(7, Box::new(String::from("seven"))));
        let (p, f) = promise();
        EVENT_MANAGER.get().spawn(async move {
            p.set_value(with_tls_map(|map| map.contains_key(&7)));
        });
        let other = f.await.unwrap();
        yield_now().await;
        let mine = with_tls_map(|map| map.get(&7).and_then(|v| v.downcast_ref::<String>()).cloned());
        (mine, other)
    });
    assert_eq!(mine.as_deref(), Some("seven"));
    assert!(!other);
    cores.stop();
}

#[test]
fn interrupts_reach_the_vector_callback() {
    let cores = start(2);
    let (tx, rx) = mpsc::channel();
    let vector = cores.run(1, move || async move {
        EVENT_MANAGER.get().allocate_vector(move || {
            tx.send(cpu::current_cpu()).unwrap();
        })
    });
    assert_eq!(vector, FIRST_FREE_VECTOR);
    cores.root.raise_interrupt(cpu(1), vector).unwrap();
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), cpu(1));
    cores.root.raise_interrupt(cpu(1), vector).unwrap();
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), cpu(1));
    assert!(cores.root.raise_interrupt(cpu(5), vector).is_err());
    cores.stop();
}

#[test]
fn alarm_raises_its_vector() {
    let cores = start(1);
    let (tx, rx) = mpsc::channel();
    let armed = cores.run(0, move || async move {
        let em = EVENT_MANAGER.get();
        let vector = em.allocate_vector(move || tx.send(time::now()).unwrap());
        let deadline = time::now() + Duration::from_millis(20);
        em.set_alarm(vector, deadline);
        deadline
    });
    let fired = rx.recv_timeout(WAIT).unwrap();
    assert!(fired >= armed);
    assert_eq!(cores.run(0, || async { EVENT_MANAGER.get().alarm() }), None);
    cores.stop();
}

#[test]
fn idle_callback_runs_while_idle() {
    let cores = start(1);
    let calls = cores.run(0, || async {
        let count = Arc::new(AtomicUsize::new(0));
        let (p, f) = promise();
        let mut p = Some(p);
        let c = count.clone();
        let idle = IdleCallback::new(move || {
            if c.fetch_add(1, Ordering::SeqCst) == 2 {
                if let Some(p) = p.take() {
                    p.set_value(());
                }
            }
        });
        idle.start();
        assert!(idle.is_started());
        f.await;
        idle.stop();
        count.load(Ordering::SeqCst)
    });
    assert!(calls >= 3);
    cores.stop();
}

#[test]
#[should_panic]
fn second_idle_callback_is_fatal() {
    let map = Arc::new(LocalIdMap::new());
    init(&map, EventManagerRoot::new(1).unwrap()).unwrap();
    cpu::bind_current(cpu(0), Nid::new(0)).unwrap();
    ebb::bind_core(map).unwrap();
    EVENT_MANAGER.get();
    let a = IdleCallback::new(|| {});
    let b = IdleCallback::new(|| {});
    a.start();
    a.start();
    b.start();
}

#[test]
fn rcu_waits_for_busy_cores() {
    let cores = start(2);
    let release = Arc::new(AtomicBool::new(false));
    let (busy_tx, busy_rx) = mpsc::channel();
    let r = release.clone();
    cores.root.spawn_remote(async move {
        busy_tx.send(()).unwrap();
        while !r.load(Ordering::SeqCst) {
            std::hint::spin_loop();
        }
    }, cpu(1));
    busy_rx.recv_timeout(WAIT).unwrap();

    let ran = Arc::new(AtomicBool::new(false));
    let flag = ran.clone();
    cores.run(0, move || async move {
        EVENT_MANAGER.get().do_rcu(move || flag.store(true, Ordering::SeqCst));
    });
    thread::sleep(StdDuration::from_millis(30));
    assert!(!ran.load(Ordering::SeqCst), "callback ran while core 1 was inside a task");

    release.store(true, Ordering::SeqCst);
    let start = std::time::Instant::now();
    while !ran.load(Ordering::SeqCst) {
        assert!(start.elapsed() < WAIT);
        thread::sleep(StdDuration::from_millis(1));
    }
    cores.stop();
}

/// Records when it is dropped.
struct Tracked {
    value: u32,
    dropped: Arc<AtomicBool>,
}

impl Drop for Tracked {
    fn drop(&mut self) {
        self.dropped.store(true, Ordering::SeqCst);
    }
}

#[test]
fn rcu_table_keeps_unlinked_entries_for_readers() {
    let cores = start(2);
    let table = Arc::new(RcuHashTable::new(16));
    let dropped = Arc::new(AtomicBool::new(false));
    let t = table.clone();
    let d = dropped.clone();
    assert!(cores.run(0, move || async move { t.insert(7u32, Tracked { value: 70, dropped: d }) }));

    // a reader on core 1 stands on the entry until it is told the entry is gone
    let unlinked = Arc::new(AtomicBool::new(false));
    let (holding_tx, holding_rx) = mpsc::channel();
    let (read_tx, read_rx) = mpsc::channel();
    let (t, u, d) = (table.clone(), unlinked.clone(), dropped.clone());
    cores.root.spawn_remote(async move {
        let seen = t.find(&7, |entry| {
            holding_tx.send(()).unwrap();
            while !u.load(Ordering::SeqCst) {
                std::hint::spin_loop();
            }
            (entry.value, d.load(Ordering::SeqCst))
        });
        read_tx.send(seen).unwrap();
    }, cpu(1));
    holding_rx.recv_timeout(WAIT).unwrap();

    let t = table.clone();
    let (removed, still_there) = cores.run(0, move || async move { (t.remove(&7), t.contains(&7)) });
    assert!(removed);
    assert!(!still_there);
    assert_eq!(table.len(), 0);
    thread::sleep(StdDuration::from_millis(30));
    assert!(!dropped.load(Ordering::SeqCst), "entry freed under a reader");

    unlinked.store(true, Ordering::SeqCst);
    assert_eq!(read_rx.recv_timeout(WAIT).unwrap(), Some((70, false)));
    let start = std::time::Instant::now();
    while !dropped.load(Ordering::SeqCst) {
        assert!(start.elapsed() < WAIT);
        thread::sleep(StdDuration::from_millis(1));
    }
    cores.stop();
}

#[test]
fn rcu_table_updates() {
    let cores = start(2);
    let table: Arc<RcuHashTable<String, u32>> = Arc::new(RcuHashTable::new(2));
    let t = table.clone();
    let (sum, replaced, missing) = cores.run(0, move || async move {
        for (i, name) in ["a", "b", "c", "d", "e"].iter().enumerate() {
            assert!(t.insert(name.to_string(), i as u32));
        }
        assert!(!t.insert("a".to_string(), 99));
        let replaced = t.replace("c".to_string(), 30);
        let missing = t.replace("z".to_string(), 1);
        assert!(t.remove("b"));
        assert!(!t.remove("b"));
        let mut sum = 0;
        t.for_each(|_, v| sum += *v);
        (sum, replaced, missing)
    });
    assert_eq!(sum, 30 + 3 + 4);
    assert!(replaced);
    assert!(!missing);
    assert_eq!(table.len(), 4);
    // readable from any core
    let t = table.clone();
    assert_eq!(cores.run(1, move || async move { t.find("c", |v| *v) }), Some(30));
    cores.stop();
}

#[test]
fn call_rcu_returns_the_result() {
    let cores = start(2);
    let v = cores.run(1, || async {
        EVENT_MANAGER.get().call_rcu(|| 40 + 2).await
    });
    assert_eq!(v, Some(42));
    cores.stop();
}

#[test]
fn dropped_promise_resolves_to_none() {
    let cores = start(1);
    let v = cores.run(0, || async {
        let (p, f) = promise::<u32>();
        EVENT_MANAGER.get().spawn_local(async move { drop(p) }, true);
        f.await
    });
    assert_eq!(v, None);
    cores.stop();
}

#[test]
fn cores_get_lazily_mapped_stacks() {
    let frames = FrameRange::new(Frame::new(0), Frame::new(1024));
    let mem_map = Arc::new(mem_map::MemMap::new([(frames, Nid::new(0))]).unwrap());
    let pages = Arc::new(page_allocator::PageAllocator::new(mem_map, 1));
    pages.add_free_range(frames, Nid::new(0)).unwrap();
    let page_table = Arc::new(vmem_allocator::PageTable::new());
    let root = EventManagerRoot::new(2).unwrap().with_stacks(StackSource {
        vmem: Arc::new(vmem_allocator::VMemAllocator::new()),
        page_table: page_table.clone(),
        page_allocator: pages.clone(),
    });
    let cores = boot(root);
    // wait until both cores are up
    cores.run(0, || async {});
    cores.run(1, || async {});

    let s0 = cores.root.event_stack(cpu(0)).unwrap();
    let s1 = cores.root.event_stack(cpu(1)).unwrap();
    assert_eq!(s0.size_in_pages(), STACK_PAGES);
    assert!(!s0.overlaps(&s1));
    assert_eq!(page_table.mapped_pages(), 2);
    assert_eq!(pages.free_page_count(Nid::new(0)), 1022);
    cores.stop();
}
