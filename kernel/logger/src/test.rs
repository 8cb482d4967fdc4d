use super::*;

#[test]
fn init_twice_is_ok() {
    assert!(init(LevelFilter::Warn).is_ok());
    assert!(init(LevelFilter::Info).is_ok());
    assert!(log::max_level() >= LevelFilter::Warn);
}

#[test]
fn records_are_tagged_with_the_core() {
    let line = std::thread::spawn(|| {
        cpu::bind_current(cpu::CpuId::new(2).unwrap(), Default::default()).unwrap();
        Logger::format(
            &Record::builder()
                .args(format_args!("hello"))
                .level(log::Level::Info)
                .build(),
        )
    }).join().unwrap();
    assert_eq!(line, "[cpu2] INFO - hello");
}

#[test]
fn host_records_are_tagged_as_host() {
    let line = Logger::format(
        &Record::builder()
            .args(format_args!("boot"))
            .level(log::Level::Warn)
            .build(),
    );
    assert_eq!(line, "[host] WARN - boot");
}
