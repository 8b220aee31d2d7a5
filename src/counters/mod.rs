//! Counter state value types.
//!
//! A snapshot materializes into per-thread core states, per-socket states
//! (core aggregate plus uncore) and one system state. Every field stores
//! the raw widened count as captured; rate conversion happens only in the
//! pure metric helpers. Aggregation is element-wise addition from core to
//! socket to system.

pub mod metrics;

use crate::msrs::MAX_C_STATE;

pub const MAX_CUSTOM_EVENTS: usize = 8;

pub const INVALID_THERMAL_HEADROOM: i32 = i32::MIN;

/// Which positions of the custom-event slots carry the cache events; the
/// mapping differs between pre-Skylake big cores, Skylake and later, and
/// parts that only expose the architectural LLC events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EventFamily {
    #[default]
    Legacy,
    Skylake,
    ArchLlcOnly,
}

/// Wraparound-aware difference between two raw counter captures of the
/// given hardware width. Values that went through the width extender use
/// width 64, where at most benign wrapping arithmetic applies.
pub fn wrapped_delta(width: u32, before: u64, after: u64) -> u64 {
    if after >= before {
        after - before
    } else if width >= 64 {
        after.wrapping_sub(before)
    } else {
        ((1u64 << width) - before) + after
    }
}

#[derive(Debug, Clone)]
pub struct CoreCounterState {
    pub inst_retired: u64,
    pub cpu_clk_unhalted: u64,
    pub cpu_clk_unhalted_ref: u64,
    pub events: [u64; MAX_CUSTOM_EVENTS],
    /// How many of the event slots were programmed.
    pub num_events: usize,
    pub invariant_tsc: u64,
    pub c_state_residency: [u64; MAX_C_STATE + 1],
    pub thermal_headroom: i32,
    pub l3_occupancy: u64,
    pub memory_bw_local: u64,
    pub memory_bw_total: u64,
    pub smi_count: u64,
    // Capture-time constants, so metric helpers stay pure functions of
    // two states.
    pub nominal_frequency: u64,
    pub event_family: EventFamily,
}

impl Default for CoreCounterState {
    fn default() -> Self {
        CoreCounterState {
            inst_retired: 0,
            cpu_clk_unhalted: 0,
            cpu_clk_unhalted_ref: 0,
            events: [0; MAX_CUSTOM_EVENTS],
            num_events: 0,
            invariant_tsc: 0,
            c_state_residency: [0; MAX_C_STATE + 1],
            thermal_headroom: INVALID_THERMAL_HEADROOM,
            l3_occupancy: 0,
            memory_bw_local: 0,
            memory_bw_total: 0,
            smi_count: 0,
            nominal_frequency: 0,
            event_family: EventFamily::default(),
        }
    }
}

impl CoreCounterState {
    /// Element-wise accumulation for socket and system aggregates.
    pub fn accumulate(&mut self, other: &CoreCounterState) {
        self.inst_retired += other.inst_retired;
        self.cpu_clk_unhalted += other.cpu_clk_unhalted;
        self.cpu_clk_unhalted_ref += other.cpu_clk_unhalted_ref;
        for (dst, src) in self.events.iter_mut().zip(other.events.iter()) {
            *dst += *src;
        }
        self.num_events = self.num_events.max(other.num_events);
        self.invariant_tsc += other.invariant_tsc;
        for (dst, src) in self
            .c_state_residency
            .iter_mut()
            .zip(other.c_state_residency.iter())
        {
            *dst += *src;
        }
        self.l3_occupancy += other.l3_occupancy;
        self.memory_bw_local += other.memory_bw_local;
        self.memory_bw_total += other.memory_bw_total;
        self.smi_count += other.smi_count;
        if self.thermal_headroom == INVALID_THERMAL_HEADROOM {
            self.thermal_headroom = other.thermal_headroom;
        }
        if self.nominal_frequency == 0 {
            self.nominal_frequency = other.nominal_frequency;
        }
        // Homogeneous across cores.
        self.event_family = other.event_family;
    }
}

#[derive(Debug, Clone, Default)]
pub struct UncoreCounterState {
    pub mc_normal_reads: u64,
    pub mc_full_writes: u64,
    pub mc_partial_writes: u64,
    pub ha_requests: u64,
    pub ha_local_requests: u64,
    pub pmm_reads: u64,
    pub pmm_writes: u64,
    pub edc_normal_reads: u64,
    pub edc_full_writes: u64,
    pub mc_io_requests: u64,
    pub package_energy: u64,
    pub dram_energy: u64,
    pub tor_occupancy_ia_miss: u64,
    pub tor_inserts_ia_miss: u64,
    pub uncore_clocks: u64,
    pub c_state_residency: [u64; MAX_C_STATE + 1],
    // Capture-time constants.
    pub joules_per_energy_unit: f64,
    pub dram_joules_per_energy_unit: f64,
    /// HBM CAS transfer size divided by the 64-byte line; 1.0 where EDC
    /// counters count full lines.
    pub edc_scale: f64,
    pub threads_per_socket: u32,
}

impl UncoreCounterState {
    pub fn accumulate(&mut self, other: &UncoreCounterState) {
        self.mc_normal_reads += other.mc_normal_reads;
        self.mc_full_writes += other.mc_full_writes;
        self.mc_partial_writes += other.mc_partial_writes;
        self.ha_requests += other.ha_requests;
        self.ha_local_requests += other.ha_local_requests;
        self.pmm_reads += other.pmm_reads;
        self.pmm_writes += other.pmm_writes;
        self.edc_normal_reads += other.edc_normal_reads;
        self.edc_full_writes += other.edc_full_writes;
        self.mc_io_requests += other.mc_io_requests;
        self.package_energy += other.package_energy;
        self.dram_energy += other.dram_energy;
        self.tor_occupancy_ia_miss += other.tor_occupancy_ia_miss;
        self.tor_inserts_ia_miss += other.tor_inserts_ia_miss;
        self.uncore_clocks += other.uncore_clocks;
        for (dst, src) in self
            .c_state_residency
            .iter_mut()
            .zip(other.c_state_residency.iter())
        {
            *dst += *src;
        }
        if self.joules_per_energy_unit == 0.0 {
            self.joules_per_energy_unit = other.joules_per_energy_unit;
        }
        if self.dram_joules_per_energy_unit == 0.0 {
            self.dram_joules_per_energy_unit = other.dram_joules_per_energy_unit;
        }
        if self.edc_scale == 0.0 {
            self.edc_scale = other.edc_scale;
        }
        if self.threads_per_socket == 0 {
            self.threads_per_socket = other.threads_per_socket;
        }
    }
}

/// Per-socket snapshot: the aggregate of the socket's thread states plus
/// the socket's uncore banks.
#[derive(Debug, Clone, Default)]
pub struct SocketCounterState {
    pub socket_id: u32,
    pub core: CoreCounterState,
    pub uncore: UncoreCounterState,
}

/// How outgoing link counters are interpreted per interconnect
/// generation.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct LinkGeometry {
    /// Bytes carried per flit (8 for QPI, 21.5 = 172 bits for UPI).
    pub bytes_per_flit: f64,
    /// Data flits per 64-byte transfer.
    pub flits_per_transfer: u64,
}

/// System-wide snapshot: aggregates plus the per-socket, per-link
/// interconnect counters.
#[derive(Debug, Clone, Default)]
pub struct SystemCounterState {
    pub core: CoreCounterState,
    pub uncore: UncoreCounterState,
    /// Incoming data traffic per socket and link, in 64-byte packets.
    pub incoming_qpi_packets: Vec<Vec<u64>>,
    /// Outgoing flits (data+non-data) per socket and link.
    pub outgoing_qpi_flits: Vec<Vec<u64>>,
    /// Cycles the transmit side spent in L0p per socket and link.
    pub tx_l0_cycles: Vec<Vec<u64>>,
    /// Link speed in bytes per second, per socket and link.
    pub qpi_link_speed: Vec<Vec<u64>>,
    pub link_geometry: LinkGeometry,
    pub num_cores: usize,
    pub num_sockets: usize,
    pub threads_per_core: usize,
    /// Whether every configured CPU was online at capture; the
    /// SMT-combining metrics are only meaningful then.
    pub all_cores_online: bool,
}

impl SystemCounterState {
    pub fn qpi_links_per_socket(&self) -> usize {
        self.incoming_qpi_packets
            .first()
            .map(|v| v.len())
            .unwrap_or(0)
    }

    pub fn accumulate_socket(&mut self, socket: &SocketCounterState) {
        self.core.accumulate(&socket.core);
        self.uncore.accumulate(&socket.uncore);
    }
}

/// Access to the core-counter portion of a state; lets the metric
/// helpers accept thread, socket and system states alike.
pub trait CoreCounters {
    fn core(&self) -> &CoreCounterState;
}

/// Access to the uncore portion. The core portion is still needed for
/// time normalization (invariant TSC).
pub trait UncoreCounters: CoreCounters {
    fn uncore(&self) -> &UncoreCounterState;
}

impl CoreCounters for CoreCounterState {
    fn core(&self) -> &CoreCounterState {
        self
    }
}

impl CoreCounters for SocketCounterState {
    fn core(&self) -> &CoreCounterState {
        &self.core
    }
}

impl UncoreCounters for SocketCounterState {
    fn uncore(&self) -> &UncoreCounterState {
        &self.uncore
    }
}

impl CoreCounters for SystemCounterState {
    fn core(&self) -> &CoreCounterState {
        &self.core
    }
}

impl UncoreCounters for SystemCounterState {
    fn uncore(&self) -> &UncoreCounterState {
        &self.uncore
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrapped_delta_handles_narrow_wrap() {
        assert_eq!(wrapped_delta(32, 10, 20), 10);
        // Wrapped once: (2^32 - before) + after.
        assert_eq!(wrapped_delta(32, 0xFFFF_FFF0, 0x10), 0x20);
        assert_eq!(wrapped_delta(48, (1 << 48) - 1, 0), 1);
        assert_eq!(wrapped_delta(64, 5, 5), 0);
    }

    #[test]
    fn aggregation_is_element_wise() {
        let mut a = CoreCounterState {
            inst_retired: 100,
            cpu_clk_unhalted: 50,
            invariant_tsc: 1000,
            ..Default::default()
        };
        let b = CoreCounterState {
            inst_retired: 23,
            cpu_clk_unhalted: 7,
            invariant_tsc: 1000,
            nominal_frequency: 2_000_000_000,
            ..Default::default()
        };
        a.accumulate(&b);
        assert_eq!(a.inst_retired, 123);
        assert_eq!(a.cpu_clk_unhalted, 57);
        assert_eq!(a.invariant_tsc, 2000);
        // The capture constant propagates into the aggregate.
        assert_eq!(a.nominal_frequency, 2_000_000_000);
    }

    #[test]
    fn socket_accumulates_into_system() {
        let mut system = SystemCounterState::default();
        let mut socket = SocketCounterState::default();
        socket.uncore.mc_normal_reads = 11;
        socket.uncore.package_energy = 7;
        system.accumulate_socket(&socket);
        system.accumulate_socket(&socket);
        assert_eq!(system.uncore.mc_normal_reads, 22);
        assert_eq!(system.uncore.package_energy, 14);
    }
}
