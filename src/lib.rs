//! In-process access to Intel core and uncore performance monitoring
//! counters.
//!
//! The entry point is [`Monitor::instance`]: a process-wide engine that
//! discovers the CPU topology and the uncore PMUs of the running
//! microarchitecture, programs fixed and general-purpose counters over
//! MSR, PCI config, MMIO and perf transports, and takes coherent
//! snapshots of all counter banks. Pairs of snapshots feed the pure
//! metric helpers in [`counters::metrics`].
//!
//! ```no_run
//! use pmu_counters::{metrics, Monitor, ProgramMode};
//!
//! # fn main() -> pmu_counters::Result<()> {
//! let monitor = Monitor::instance()?;
//! monitor.program(ProgramMode::Default)?;
//! let (before, ..) = monitor.get_all_counter_states()?;
//! std::thread::sleep(std::time::Duration::from_secs(1));
//! let (after, ..) = monitor.get_all_counter_states()?;
//! println!("IPC: {:.2}", metrics::get_ipc(&before, &after));
//! println!(
//!     "memory read bandwidth: {} MB/s",
//!     metrics::get_bytes_read_from_mc(&before, &after) / 1_000_000
//! );
//! monitor.cleanup();
//! # Ok(())
//! # }
//! ```
//!
//! Programming requires root (or equivalent capabilities) for the MSR
//! and PCI device files. `PCM_NO_MSR=1` switches the core counters to
//! the Linux perf backend.

pub mod affinity;
pub mod counters;
pub mod error;
pub mod events;
pub mod instance_lock;
pub mod model;
pub mod monitor;
pub mod msrs;
pub mod registers;
pub mod resctrl;
pub mod topology;
pub mod uncore;
pub mod updater;

pub use counters::metrics;
pub use counters::{
    CoreCounterState, SocketCounterState, SystemCounterState, UncoreCounterState,
};
pub use error::{Error, ErrorCode, Result};
pub use model::{CpuIdentity, CpuModel};
pub use monitor::modes::{
    CoreEvent, CxlConfig, ExtCoreEventSet, IioConfig, IioEvent, LatencyConfig, MemoryMetrics,
    PcieConfig, PowerProfile, ProgramMode, RawPmuConfig,
};
pub use monitor::Monitor;
pub use topology::SystemTopology;
pub use updater::AsyncUpdater;
