use super::*;

#[test]
fn monotonic_never_goes_backwards() {
    let mut last = now();
    for _ in 0..1000 {
        let t = now();
        assert!(t >= last);
        last = t;
    }
}

#[test]
fn readings_are_comparable_across_threads() {
    let before = now();
    let other = std::thread::spawn(now).join().unwrap();
    let after = now();
    assert!(before <= other && other <= after);
}

#[test]
fn instant_arithmetic_saturates() {
    let t = Instant::ZERO + Duration::from_millis(5);
    assert_eq!(t - Instant::ZERO, Duration::from_millis(5));
    assert_eq!(Instant::ZERO - t, Duration::ZERO);
    assert_eq!(t.since_boot(), Duration::from_millis(5));
}

#[test]
fn real_time_is_after_2020() {
    assert!(real_time() > Duration::from_secs(1_577_836_800));
}
