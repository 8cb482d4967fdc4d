extern crate std;

use super::*;
use alloc::{format, string::String};
use log::{Level, LevelFilter, Log, Metadata, Record};
use std::{
    sync::{Barrier, Mutex, Once},
    thread,
    vec::Vec,
};

/// Keeps every message logged by this crate.
struct Capture(Mutex<Vec<String>>);

impl Log for Capture {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= Level::Debug
    }

    fn log(&self, record: &Record) {
        if record.target().starts_with("local_id_map") {
            self.0.lock().unwrap().push(format!("{}", record.args()));
        }
    }

    fn flush(&self) {}
}

static CAPTURE: Capture = Capture(Mutex::new(Vec::new()));

fn captured() -> &'static Capture {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        log::set_logger(&CAPTURE).unwrap();
        log::set_max_level(LevelFilter::Debug);
    });
    &CAPTURE
}

#[test]
fn first_insert_wins() {
    let map = LocalIdMap::new();
    let id = EbbId::new(100);
    assert!(map.insert(id, Arc::new(1u32)));
    assert!(!map.insert(id, Arc::new(2u32)));
    assert_eq!(map.find_as::<u32>(id).as_deref(), Some(&1));
}

#[test]
fn find_as_checks_the_type() {
    let map = LocalIdMap::new();
    let id = EbbId::new(7);
    map.insert(id, Arc::new(String::from("root")));
    assert!(map.find_as::<u32>(id).is_none());
    assert_eq!(map.find_as::<String>(id).unwrap().as_str(), "root");
    assert!(map.find(EbbId::new(8)).is_none());
}

#[test]
fn insert_or_get_returns_the_winner() {
    let map = LocalIdMap::new();
    let id = EbbId::new(9);
    let (first, won) = map.insert_or_get(id, Arc::new(10u64));
    assert!(won);
    let (second, won) = map.insert_or_get(id, Arc::new(20u64));
    assert!(!won);
    assert!(Arc::ptr_eq(&first, &second));
}

#[test]
fn refused_inserts_are_logged() {
    let log = captured();
    let map = LocalIdMap::new();
    let id = EbbId::new(0x4242);
    map.insert_or_get(id, Arc::new(1u8));
    map.insert_or_get(id, Arc::new(2u8));
    map.insert(id, Arc::new(3u8));
    let mentions = log.0.lock().unwrap().iter()
        .filter(|msg| msg.contains(&format!("{:?}", id)))
        .count();
    assert_eq!(mentions, 2);
}

#[test]
fn erase_allows_reinsert() {
    let map = LocalIdMap::new();
    let id = EbbId::new(3);
    map.insert(id, Arc::new(()));
    assert!(map.erase(id).is_some());
    assert!(map.is_empty());
    assert!(map.insert(id, Arc::new(())));
}

#[test]
fn concurrent_inserts_have_one_winner() {
    let map = Arc::new(LocalIdMap::new());
    let barrier = Arc::new(Barrier::new(8));
    let handles: Vec<_> = (0..8u32).map(|i| {
        let map = map.clone();
        let barrier = barrier.clone();
        thread::spawn(move || {
            barrier.wait();
            map.insert(EbbId::new(55), Arc::new(i))
        })
    }).collect();
    let winners = handles.into_iter().map(|h| h.join().unwrap()).filter(|won| *won).count();
    assert_eq!(winners, 1);
    assert_eq!(map.len(), 1);
}
