extern crate std;

use super::*;
use std::thread;

#[test]
fn unbound_thread_has_no_cpu() {
    thread::spawn(|| {
        assert_eq!(try_current_cpu(), None);
        assert!(!is_bootstrap_cpu());
    }).join().unwrap();
}

#[test]
fn bind_and_query() {
    thread::spawn(|| {
        let cpu = CpuId::new(3).unwrap();
        bind_current(cpu, Nid::new(1)).unwrap();
        assert_eq!(current_cpu(), cpu);
        assert_eq!(current_node(), Nid::new(1));
        // rebinding to the same core is fine, another core is not
        assert!(bind_current(cpu, Nid::new(1)).is_ok());
        assert!(bind_current(CpuId::new(4).unwrap(), Nid::new(1)).is_err());
        unbind_current();
        assert_eq!(try_current_cpu(), None);
    }).join().unwrap();
}

#[test]
fn cpu_id_bounds() {
    assert!(CpuId::new(MAX_CPUS as u32 - 1).is_some());
    assert!(CpuId::new(MAX_CPUS as u32).is_none());
    assert_eq!(std::format!("{:?}", CpuId::bootstrap()), "cpu0");
}

#[test]
#[should_panic]
fn current_cpu_panics_off_core() {
    unbind_current();
    current_cpu();
}
