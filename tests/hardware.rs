//! Hardware-backed scenarios. These need an Intel machine and root
//! access to the MSR and PCI device files, so they are ignored by
//! default:
//!
//! ```sh
//! sudo -E cargo test --test hardware -- --ignored --test-threads 1
//! ```

use std::time::Duration;

use pmu_counters::{metrics, MemoryMetrics, Monitor, ProgramMode};

#[test]
#[ignore = "requires root and Intel PMU hardware"]
fn default_mode_ipc_is_sane() {
    let monitor = Monitor::instance().expect("monitor");
    monitor.program(ProgramMode::Default).expect("program");

    let (before, _, before_cores) = monitor.get_all_counter_states().expect("snapshot");
    std::thread::sleep(Duration::from_secs(1));
    let (after, _, after_cores) = monitor.get_all_counter_states().expect("snapshot");

    let ipc = metrics::get_ipc(&before, &after);
    assert!((0.0..=10.0).contains(&ipc), "system IPC {ipc}");

    // One second of TSC should be within 10% of nominal on any machine
    // with an invariant TSC.
    let nominal = monitor.nominal_frequency() as f64;
    let cores = before_cores.len() as f64;
    let tsc = metrics::get_invariant_tsc(&before, &after) as f64 / cores;
    assert!(
        (tsc - nominal).abs() < nominal * 0.1,
        "TSC delta {tsc} vs nominal {nominal}"
    );

    for (b, a) in before_cores.iter().zip(&after_cores) {
        let mut total = 0.0;
        for state in 0..=10 {
            let r = metrics::get_core_c_state_residency(state, b, a);
            assert!((0.0..=1.0).contains(&r));
            total += r;
        }
        assert!((total - 1.0).abs() < 0.05, "residency sum {total}");
    }

    monitor.cleanup();
}

#[test]
#[ignore = "requires root and Intel server uncore hardware"]
fn streaming_writer_shows_write_bandwidth() {
    let monitor = Monitor::instance().expect("monitor");
    monitor
        .program_server_uncore_memory_metrics(MemoryMetrics::PartialWrites, None, None)
        .expect("program memory metrics");

    // A streaming writer large enough to spill every cache level.
    let stop = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
    let writer_stop = std::sync::Arc::clone(&stop);
    let writer = std::thread::spawn(move || {
        let mut buffer = vec![0u8; 1 << 28];
        let mut value = 0u8;
        while !writer_stop.load(std::sync::atomic::Ordering::Relaxed) {
            value = value.wrapping_add(1);
            buffer.iter_mut().for_each(|b| *b = value);
        }
        buffer.len()
    });

    let (before, before_sockets, _) = monitor.get_all_counter_states().expect("snapshot");
    std::thread::sleep(Duration::from_secs(1));
    let (after, after_sockets, _) = monitor.get_all_counter_states().expect("snapshot");
    stop.store(true, std::sync::atomic::Ordering::Relaxed);
    writer.join().expect("writer thread");

    let written = metrics::get_bytes_written_to_mc(&before, &after);
    let read = metrics::get_bytes_read_from_mc(&before, &after);
    assert!(
        written > 100_000_000,
        "expected >100 MB/s of writes, saw {written}"
    );
    assert!(written > read / 4, "writes {written} vs reads {read}");
    let _ = (before_sockets, after_sockets);

    monitor.cleanup();
}

#[test]
#[ignore = "requires root and Intel PMU hardware"]
fn cleanup_releases_the_pmu_for_reprogramming() {
    let monitor = Monitor::instance().expect("monitor");
    monitor.program(ProgramMode::Default).expect("first program");

    // A second program without reset is an invariant violation, not a
    // hang or a double-programming.
    assert!(monitor.program(ProgramMode::Default).is_err());

    monitor.cleanup();
    monitor.cleanup(); // idempotent

    monitor
        .program(ProgramMode::Default)
        .expect("program after cleanup");
    monitor.cleanup();
}
