//! Pure metric derivation from pairs of counter states.
//!
//! Every function takes `(before, after)` captured in the same session
//! and returns a scalar. Helpers never fail: float metrics return `-1.0`
//! when the metric is not supported or the denominator is empty, byte
//! counters return 0, so formatting code can detect "not available"
//! uniformly.

use super::{CoreCounters, EventFamily, SystemCounterState, UncoreCounters};

pub const CACHE_LINE_SIZE: u64 = 64;

fn d(before: u64, after: u64) -> u64 {
    after.saturating_sub(before)
}

/// Instructions retired per unhalted core cycle.
pub fn get_ipc<T: CoreCounters>(before: &T, after: &T) -> f64 {
    let clocks = get_cycles(before, after);
    if clocks == 0 {
        return -1.0;
    }
    get_instructions_retired(before, after) as f64 / clocks as f64
}

pub fn get_instructions_retired<T: CoreCounters>(before: &T, after: &T) -> u64 {
    d(before.core().inst_retired, after.core().inst_retired)
}

pub fn get_cycles<T: CoreCounters>(before: &T, after: &T) -> u64 {
    d(before.core().cpu_clk_unhalted, after.core().cpu_clk_unhalted)
}

pub fn get_ref_cycles<T: CoreCounters>(before: &T, after: &T) -> u64 {
    d(
        before.core().cpu_clk_unhalted_ref,
        after.core().cpu_clk_unhalted_ref,
    )
}

pub fn get_invariant_tsc<T: CoreCounters>(before: &T, after: &T) -> u64 {
    d(before.core().invariant_tsc, after.core().invariant_tsc)
}

/// Instructions retired per invariant TSC tick.
pub fn get_exec_usage<T: CoreCounters>(before: &T, after: &T) -> f64 {
    let ticks = get_invariant_tsc(before, after);
    if ticks == 0 {
        return -1.0;
    }
    get_instructions_retired(before, after) as f64 / ticks as f64
}

/// Average core frequency in Hz, Turbo included.
pub fn get_average_frequency<T: CoreCounters>(before: &T, after: &T) -> f64 {
    let ticks = get_invariant_tsc(before, after);
    let nominal = after.core().nominal_frequency;
    if ticks == 0 || nominal == 0 {
        return -1.0;
    }
    nominal as f64 * get_cycles(before, after) as f64 / ticks as f64
}

/// Average core frequency in Hz while not idling.
pub fn get_active_average_frequency<T: CoreCounters>(before: &T, after: &T) -> f64 {
    let ref_clocks = get_ref_cycles(before, after);
    let nominal = after.core().nominal_frequency;
    if ref_clocks == 0 || nominal == 0 {
        return -1.0;
    }
    nominal as f64 * get_cycles(before, after) as f64 / ref_clocks as f64
}

/// Core clock over TSC, as a fraction of nominal frequency.
pub fn get_relative_frequency<T: CoreCounters>(before: &T, after: &T) -> f64 {
    let ticks = get_invariant_tsc(before, after);
    if ticks == 0 {
        return -1.0;
    }
    get_cycles(before, after) as f64 / ticks as f64
}

/// Core clock over reference clock; above 1.0 means Turbo was active.
pub fn get_active_relative_frequency<T: CoreCounters>(before: &T, after: &T) -> f64 {
    let ref_clocks = get_ref_cycles(before, after);
    if ref_clocks == 0 {
        return -1.0;
    }
    get_cycles(before, after) as f64 / ref_clocks as f64
}

/// IPC combined from logical to physical cores; the number to compare
/// when evaluating SMT on against SMT off.
pub fn get_core_ipc(before: &SystemCounterState, after: &SystemCounterState) -> f64 {
    let ipc = get_ipc(before, after);
    if ipc >= 0.0 && after.all_cores_online && after.threads_per_core > 0 {
        ipc * after.threads_per_core as f64
    } else {
        -1.0
    }
}

/// Exec usage combined from logical to physical cores.
pub fn get_total_exec_usage(before: &SystemCounterState, after: &SystemCounterState) -> f64 {
    let usage = get_exec_usage(before, after);
    if usage >= 0.0 && after.all_cores_online && after.threads_per_core > 0 {
        usage * after.threads_per_core as f64
    } else {
        -1.0
    }
}

/// Raw delta of one custom event slot; zero for slots that were not
/// programmed.
pub fn get_number_of_custom_events<T: CoreCounters>(slot: usize, before: &T, after: &T) -> u64 {
    if slot >= after.core().num_events || slot >= after.core().events.len() {
        return 0;
    }
    d(before.core().events[slot], after.core().events[slot])
}

fn event_delta<T: CoreCounters>(before: &T, after: &T, pos: usize) -> u64 {
    d(before.core().events[pos], after.core().events[pos])
}

// Custom-event slot positions per event family. Slot 0 always carries the
// L3 (or architectural LLC) miss event.
const L3_MISS_POS: usize = 0;
const L3_UNSHARED_HIT_POS: usize = 1;
const SKL_L3_HIT_POS: usize = 1;
const ARCH_LLC_REF_POS: usize = 1;
const L2_HITM_POS: usize = 2;
const SKL_L2_MISS_POS: usize = 2;
const L2_HIT_POS: usize = 3;
const SKL_L2_REF_POS: usize = 3;

pub fn get_l3_cache_misses<T: CoreCounters>(before: &T, after: &T) -> u64 {
    event_delta(before, after, L3_MISS_POS)
}

pub fn get_l2_cache_misses<T: CoreCounters>(before: &T, after: &T) -> u64 {
    match after.core().event_family {
        EventFamily::Skylake => event_delta(before, after, SKL_L2_MISS_POS),
        EventFamily::ArchLlcOnly => event_delta(before, after, L3_MISS_POS),
        EventFamily::Legacy => {
            event_delta(before, after, L3_MISS_POS)
                + event_delta(before, after, L3_UNSHARED_HIT_POS)
                + event_delta(before, after, L2_HITM_POS)
        }
    }
}

pub fn get_l2_cache_hits<T: CoreCounters>(before: &T, after: &T) -> u64 {
    match after.core().event_family {
        EventFamily::ArchLlcOnly => {
            let misses = event_delta(before, after, L3_MISS_POS);
            let refs = event_delta(before, after, ARCH_LLC_REF_POS);
            refs.saturating_sub(misses)
        }
        EventFamily::Skylake => {
            let refs = event_delta(before, after, SKL_L2_REF_POS);
            refs.saturating_sub(event_delta(before, after, SKL_L2_MISS_POS))
        }
        EventFamily::Legacy => event_delta(before, after, L2_HIT_POS),
    }
}

/// L3 hits that required snooping a sibling L2.
pub fn get_l3_cache_hits_snoop<T: CoreCounters>(before: &T, after: &T) -> u64 {
    match after.core().event_family {
        EventFamily::Skylake => event_delta(before, after, SKL_L3_HIT_POS),
        EventFamily::Legacy => event_delta(before, after, L2_HITM_POS),
        EventFamily::ArchLlcOnly => 0,
    }
}

pub fn get_l3_cache_hits_no_snoop<T: CoreCounters>(before: &T, after: &T) -> u64 {
    match after.core().event_family {
        EventFamily::Legacy => event_delta(before, after, L3_UNSHARED_HIT_POS),
        _ => 0,
    }
}

pub fn get_l3_cache_hits<T: CoreCounters>(before: &T, after: &T) -> u64 {
    get_l3_cache_hits_snoop(before, after) + get_l3_cache_hits_no_snoop(before, after)
}

pub fn get_l3_cache_hit_ratio<T: CoreCounters>(before: &T, after: &T) -> f64 {
    if after.core().event_family == EventFamily::ArchLlcOnly {
        return -1.0;
    }
    let hits = get_l3_cache_hits(before, after);
    let misses = get_l3_cache_misses(before, after);
    if hits + misses == 0 {
        return -1.0;
    }
    hits as f64 / (hits + misses) as f64
}

pub fn get_l2_cache_hit_ratio<T: CoreCounters>(before: &T, after: &T) -> f64 {
    let hits = get_l2_cache_hits(before, after);
    let misses = get_l2_cache_misses(before, after);
    if hits + misses == 0 {
        return -1.0;
    }
    hits as f64 / (hits + misses) as f64
}

/// Current L3 occupancy in bytes (resctrl or QOS sourced).
pub fn get_l3_cache_occupancy<T: CoreCounters>(now: &T) -> u64 {
    now.core().l3_occupancy
}

pub fn get_local_memory_bw<T: CoreCounters>(before: &T, after: &T) -> u64 {
    d(before.core().memory_bw_local, after.core().memory_bw_local)
}

pub fn get_remote_memory_bw<T: CoreCounters>(before: &T, after: &T) -> u64 {
    let total = d(before.core().memory_bw_total, after.core().memory_bw_total);
    let local = get_local_memory_bw(before, after);
    total.saturating_sub(local)
}

pub fn get_smi_count<T: CoreCounters>(before: &T, after: &T) -> u64 {
    d(before.core().smi_count, after.core().smi_count)
}

/// Thermal headroom below the TjMax throttling point, in degrees Celsius.
pub fn get_thermal_headroom<T: CoreCounters>(now: &T) -> i32 {
    now.core().thermal_headroom
}

/// Residency in a core C-state, in [0, 1].
///
/// C0 is the active state (reference cycles over TSC); C1 is everything
/// not accounted for by C0 and the deeper states, clamped against counter
/// desynchronization.
pub fn get_core_c_state_residency<T: CoreCounters>(state: usize, before: &T, after: &T) -> f64 {
    let tsc = get_invariant_tsc(before, after) as f64;
    if tsc == 0.0 {
        return -1.0;
    }
    let res = |s: usize| {
        d(
            before.core().c_state_residency[s],
            after.core().c_state_residency[s],
        ) as f64
            / tsc
    };
    let value = match state {
        0 => get_ref_cycles(before, after) as f64 / tsc,
        1 => {
            let mut left = 1.0 - get_ref_cycles(before, after) as f64 / tsc;
            for s in 2..before.core().c_state_residency.len() {
                left -= res(s);
            }
            left
        }
        s if s < before.core().c_state_residency.len() => res(s),
        _ => return -1.0,
    };
    value.clamp(0.0, 1.0)
}

/// Residency in a package C-state, in [0, 1]. Package C0 is everything
/// not spent in the deeper states.
pub fn get_package_c_state_residency<T: UncoreCounters>(state: usize, before: &T, after: &T) -> f64 {
    let tsc = get_invariant_tsc(before, after) as f64
        / after.uncore().threads_per_socket.max(1) as f64;
    if tsc == 0.0 {
        return -1.0;
    }
    let res = |s: usize| {
        d(
            before.uncore().c_state_residency[s],
            after.uncore().c_state_residency[s],
        ) as f64
            / tsc
    };
    let value = match state {
        0 => {
            let mut left = 1.0;
            for s in 1..before.uncore().c_state_residency.len() {
                left -= res(s);
            }
            left
        }
        s if s < before.uncore().c_state_residency.len() => res(s),
        _ => return -1.0,
    };
    value.clamp(0.0, 1.0)
}

pub fn get_bytes_read_from_mc<T: UncoreCounters>(before: &T, after: &T) -> u64 {
    d(before.uncore().mc_normal_reads, after.uncore().mc_normal_reads) * CACHE_LINE_SIZE
}

pub fn get_bytes_written_to_mc<T: UncoreCounters>(before: &T, after: &T) -> u64 {
    d(before.uncore().mc_full_writes, after.uncore().mc_full_writes) * CACHE_LINE_SIZE
}

pub fn get_partial_write_bytes_to_mc<T: UncoreCounters>(before: &T, after: &T) -> u64 {
    d(
        before.uncore().mc_partial_writes,
        after.uncore().mc_partial_writes,
    ) * CACHE_LINE_SIZE
}

pub fn get_bytes_read_from_pmm<T: UncoreCounters>(before: &T, after: &T) -> u64 {
    d(before.uncore().pmm_reads, after.uncore().pmm_reads) * CACHE_LINE_SIZE
}

pub fn get_bytes_written_to_pmm<T: UncoreCounters>(before: &T, after: &T) -> u64 {
    d(before.uncore().pmm_writes, after.uncore().pmm_writes) * CACHE_LINE_SIZE
}

/// EDC/HBM traffic; the per-model scale factor folds in CAS transfer
/// sizes different from the 64-byte line.
pub fn get_bytes_read_from_edc<T: UncoreCounters>(before: &T, after: &T) -> u64 {
    let lines = d(
        before.uncore().edc_normal_reads,
        after.uncore().edc_normal_reads,
    );
    (lines as f64 * CACHE_LINE_SIZE as f64 * after.uncore().edc_scale.max(1.0)) as u64
}

pub fn get_bytes_written_to_edc<T: UncoreCounters>(before: &T, after: &T) -> u64 {
    let lines = d(
        before.uncore().edc_full_writes,
        after.uncore().edc_full_writes,
    );
    (lines as f64 * CACHE_LINE_SIZE as f64 * after.uncore().edc_scale.max(1.0)) as u64
}

pub fn get_io_request_bytes_from_mc<T: UncoreCounters>(before: &T, after: &T) -> u64 {
    d(before.uncore().mc_io_requests, after.uncore().mc_io_requests) * CACHE_LINE_SIZE
}

/// Fraction of home-agent requests that were satisfied locally.
pub fn get_local_memory_request_ratio<T: UncoreCounters>(before: &T, after: &T) -> f64 {
    let requests = d(before.uncore().ha_requests, after.uncore().ha_requests);
    if requests == 0 {
        return -1.0;
    }
    d(
        before.uncore().ha_local_requests,
        after.uncore().ha_local_requests,
    ) as f64
        / requests as f64
}

pub fn get_consumed_energy<T: UncoreCounters>(before: &T, after: &T) -> u64 {
    d(before.uncore().package_energy, after.uncore().package_energy)
}

pub fn get_dram_consumed_energy<T: UncoreCounters>(before: &T, after: &T) -> u64 {
    d(before.uncore().dram_energy, after.uncore().dram_energy)
}

pub fn get_consumed_joules<T: UncoreCounters>(before: &T, after: &T) -> f64 {
    let unit = after.uncore().joules_per_energy_unit;
    if unit <= 0.0 {
        return -1.0;
    }
    get_consumed_energy(before, after) as f64 * unit
}

pub fn get_dram_consumed_joules<T: UncoreCounters>(before: &T, after: &T) -> f64 {
    let unit = after.uncore().dram_joules_per_energy_unit;
    if unit <= 0.0 {
        return -1.0;
    }
    get_dram_consumed_energy(before, after) as f64 * unit
}

pub fn get_uncore_clocks<T: UncoreCounters>(before: &T, after: &T) -> u64 {
    d(before.uncore().uncore_clocks, after.uncore().uncore_clocks)
}

/// Average latency of LLC-missing reads and prefetches, in nanoseconds,
/// measured through TOR occupancy over inserts in DRAM clock units and
/// rescaled to wall time.
pub fn get_llc_read_miss_latency<T: UncoreCounters>(before: &T, after: &T) -> f64 {
    let occupancy = d(
        before.uncore().tor_occupancy_ia_miss,
        after.uncore().tor_occupancy_ia_miss,
    ) as f64;
    let inserts = d(
        before.uncore().tor_inserts_ia_miss,
        after.uncore().tor_inserts_ia_miss,
    ) as f64;
    let unc_clocks = get_uncore_clocks(before, after) as f64;
    let threads_per_socket = after.uncore().threads_per_socket;
    let nominal = after.core().nominal_frequency;
    if inserts == 0.0 || unc_clocks == 0.0 || threads_per_socket == 0 || nominal == 0 {
        return -1.0;
    }
    let seconds =
        get_invariant_tsc(before, after) as f64 / threads_per_socket as f64 / nominal as f64;
    1e9 * seconds * (occupancy / inserts) / unc_clocks
}

/// Incoming data traffic on one interconnect link, in bytes.
pub fn get_incoming_qpi_link_bytes(
    socket: usize,
    link: usize,
    before: &SystemCounterState,
    after: &SystemCounterState,
) -> u64 {
    let b = before
        .incoming_qpi_packets
        .get(socket)
        .and_then(|v| v.get(link))
        .copied()
        .unwrap_or(0);
    let a = after
        .incoming_qpi_packets
        .get(socket)
        .and_then(|v| v.get(link))
        .copied()
        .unwrap_or(0);
    d(b, a) * CACHE_LINE_SIZE
}

pub fn get_all_incoming_qpi_link_bytes(
    before: &SystemCounterState,
    after: &SystemCounterState,
) -> u64 {
    let mut total = 0;
    for socket in 0..after.num_sockets {
        for link in 0..after.qpi_links_per_socket() {
            total += get_incoming_qpi_link_bytes(socket, link, before, after);
        }
    }
    total
}

pub fn get_outgoing_qpi_link_bytes(
    socket: usize,
    link: usize,
    before: &SystemCounterState,
    after: &SystemCounterState,
) -> u64 {
    let b = before
        .outgoing_qpi_flits
        .get(socket)
        .and_then(|v| v.get(link))
        .copied()
        .unwrap_or(0);
    let a = after
        .outgoing_qpi_flits
        .get(socket)
        .and_then(|v| v.get(link))
        .copied()
        .unwrap_or(0);
    (d(b, a) as f64 * after.link_geometry.bytes_per_flit) as u64
}

/// Outgoing link utilization in [0, 1]: transferred flits against the
/// theoretical flit capacity of the link over the measured interval.
pub fn get_outgoing_qpi_link_utilization(
    socket: usize,
    link: usize,
    before: &SystemCounterState,
    after: &SystemCounterState,
) -> f64 {
    let bytes_per_flit = after.link_geometry.bytes_per_flit;
    let speed = after
        .qpi_link_speed
        .get(socket)
        .and_then(|v| v.get(link))
        .copied()
        .unwrap_or(0);
    let nominal = after.core().nominal_frequency;
    if bytes_per_flit <= 0.0 || speed == 0 || nominal == 0 || after.num_cores == 0 {
        return -1.0;
    }
    let b = before
        .outgoing_qpi_flits
        .get(socket)
        .and_then(|v| v.get(link))
        .copied()
        .unwrap_or(0);
    let a = after
        .outgoing_qpi_flits
        .get(socket)
        .and_then(|v| v.get(link))
        .copied()
        .unwrap_or(0);
    let flits = d(b, a) as f64;
    // The system TSC delta is aggregated over all logical cores; dividing
    // by their count recovers wall time in nominal clocks.
    let max_flits = get_invariant_tsc(before, after) as f64 * speed as f64
        / bytes_per_flit
        / nominal as f64
        / after.num_cores as f64;
    if max_flits <= 0.0 {
        return -1.0;
    }
    (flits / max_flits).clamp(0.0, 1.0)
}

/// Ratio of interconnect traffic to memory-controller read traffic; a
/// coarse NUMA-balance indicator.
pub fn get_qpi_to_mc_traffic_ratio(before: &SystemCounterState, after: &SystemCounterState) -> f64 {
    let mc = get_bytes_read_from_mc(before, after);
    if mc == 0 {
        return -1.0;
    }
    get_all_incoming_qpi_link_bytes(before, after) as f64 / mc as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counters::{CoreCounterState, LinkGeometry, SocketCounterState};

    fn core_pair() -> (CoreCounterState, CoreCounterState) {
        let before = CoreCounterState {
            nominal_frequency: 2_500_000_000,
            ..Default::default()
        };
        let mut after = before.clone();
        after.inst_retired = 3_000;
        after.cpu_clk_unhalted = 1_000;
        after.cpu_clk_unhalted_ref = 2_000;
        after.invariant_tsc = 4_000;
        (before, after)
    }

    #[test]
    fn ipc_and_frequencies() {
        let (before, after) = core_pair();
        assert_eq!(get_ipc(&before, &after), 3.0);
        assert_eq!(get_exec_usage(&before, &after), 0.75);
        // 2.5 GHz * 1000/4000
        assert_eq!(get_average_frequency(&before, &after), 625_000_000.0);
        assert_eq!(get_active_relative_frequency(&before, &after), 0.5);
        // Sentinel when no cycles elapsed.
        assert_eq!(get_ipc(&before, &before), -1.0);
    }

    #[test]
    fn deltas_are_non_negative() {
        let (before, after) = core_pair();
        assert!(get_instructions_retired(&after, &before) == 0);
        assert!(get_cycles(&after, &before) == 0);
    }

    #[test]
    fn skylake_cache_ratios() {
        let mut before = CoreCounterState {
            event_family: EventFamily::Skylake,
            num_events: 4,
            ..Default::default()
        };
        let mut after = before.clone();
        // misses=100, l3 hits=900, l2 misses=1000, l2 refs=5000
        after.events[0] = 100;
        after.events[1] = 900;
        after.events[2] = 1_000;
        after.events[3] = 5_000;
        before.events = [0; crate::counters::MAX_CUSTOM_EVENTS];
        assert_eq!(get_l3_cache_misses(&before, &after), 100);
        assert_eq!(get_l3_cache_hits(&before, &after), 900);
        assert_eq!(get_l3_cache_hit_ratio(&before, &after), 0.9);
        assert_eq!(get_l2_cache_misses(&before, &after), 1_000);
        assert_eq!(get_l2_cache_hits(&before, &after), 4_000);
        assert_eq!(get_l2_cache_hit_ratio(&before, &after), 0.8);
    }

    #[test]
    fn arch_llc_only_has_no_l3_ratio() {
        let before = CoreCounterState {
            event_family: EventFamily::ArchLlcOnly,
            num_events: 2,
            ..Default::default()
        };
        let mut after = before.clone();
        after.events[0] = 10;
        after.events[1] = 100;
        assert_eq!(get_l3_cache_hit_ratio(&before, &after), -1.0);
        assert_eq!(get_l2_cache_hits(&before, &after), 90);
    }

    #[test]
    fn core_c_state_residencies_sum_to_one() {
        let before = CoreCounterState::default();
        let mut after = CoreCounterState::default();
        after.invariant_tsc = 10_000;
        after.cpu_clk_unhalted_ref = 4_000; // C0 = 0.4
        after.c_state_residency[6] = 3_000; // C6 = 0.3
        after.c_state_residency[7] = 1_000; // C7 = 0.1
        let mut total = 0.0;
        for state in 0..=crate::msrs::MAX_C_STATE {
            let r = get_core_c_state_residency(state, &before, &after);
            assert!((0.0..=1.0).contains(&r), "state {state} residency {r}");
            total += r;
        }
        assert!((total - 1.0).abs() < 1e-9, "residencies sum to {total}");
        assert_eq!(get_core_c_state_residency(1, &before, &after), 0.2);
    }

    #[test]
    fn package_c_state_c0_complements_deeper_states() {
        let mut before = SocketCounterState::default();
        let mut after = SocketCounterState::default();
        before.uncore.threads_per_socket = 2;
        after.uncore.threads_per_socket = 2;
        // Two threads aggregate 2x the wall TSC.
        after.core.invariant_tsc = 20_000;
        after.uncore.c_state_residency[2] = 2_500; // 0.25
        after.uncore.c_state_residency[6] = 5_000; // 0.5
        assert_eq!(get_package_c_state_residency(2, &before, &after), 0.25);
        assert_eq!(get_package_c_state_residency(6, &before, &after), 0.5);
        assert_eq!(get_package_c_state_residency(0, &before, &after), 0.25);
    }

    #[test]
    fn memory_bandwidth_in_bytes() {
        let before = SocketCounterState::default();
        let mut after = SocketCounterState::default();
        after.uncore.mc_normal_reads = 1_000;
        after.uncore.mc_full_writes = 500;
        after.uncore.pmm_reads = 10;
        assert_eq!(get_bytes_read_from_mc(&before, &after), 64_000);
        assert_eq!(get_bytes_written_to_mc(&before, &after), 32_000);
        assert_eq!(get_bytes_read_from_pmm(&before, &after), 640);
    }

    #[test]
    fn rapl_joules_use_capture_units() {
        let mut before = SocketCounterState::default();
        let mut after = SocketCounterState::default();
        for s in [&mut before, &mut after] {
            s.uncore.joules_per_energy_unit = 1.0 / 65536.0;
            s.uncore.dram_joules_per_energy_unit = 0.0000153;
        }
        after.uncore.package_energy = 65536;
        after.uncore.dram_energy = 1_000_000;
        assert_eq!(get_consumed_joules(&before, &after), 1.0);
        assert!((get_dram_consumed_joules(&before, &after) - 15.3).abs() < 1e-9);
        // Unknown units surface the sentinel.
        let plain = SocketCounterState::default();
        assert_eq!(get_consumed_joules(&plain, &plain), -1.0);
    }

    #[test]
    fn llc_read_miss_latency_formula() {
        let mut before = SocketCounterState::default();
        let mut after = SocketCounterState::default();
        for s in [&mut before, &mut after] {
            s.uncore.threads_per_socket = 32;
            s.core.nominal_frequency = 2_500_000_000;
        }
        after.uncore.tor_occupancy_ia_miss = 1_000_000;
        after.uncore.tor_inserts_ia_miss = 50_000;
        after.uncore.uncore_clocks = 2_000_000_000;
        // TSC delta equivalent to one second on one thread.
        after.core.invariant_tsc = 2_500_000_000;
        let latency = get_llc_read_miss_latency(&before, &after);
        let expected = 1e9 * (1.0 / 32.0) * (1_000_000.0 / 50_000.0) / 2_000_000_000.0;
        assert!((latency - expected).abs() < 1e-12);
        assert!((latency - 0.3125).abs() < 1e-9);
    }

    #[test]
    fn qpi_utilization_stays_in_unit_interval() {
        let mut before = SystemCounterState::default();
        let mut after = SystemCounterState::default();
        for s in [&mut before, &mut after] {
            s.num_cores = 4;
            s.num_sockets = 2;
            s.core.nominal_frequency = 2_000_000_000;
            s.link_geometry = LinkGeometry {
                bytes_per_flit: 8.0,
                flits_per_transfer: 8,
            };
            s.qpi_link_speed = vec![vec![16_000_000_000; 2]; 2];
            s.outgoing_qpi_flits = vec![vec![0; 2]; 2];
            s.incoming_qpi_packets = vec![vec![0; 2]; 2];
            s.tx_l0_cycles = vec![vec![0; 2]; 2];
        }
        // One second of wall time aggregated over 4 cores.
        after.core.invariant_tsc = 8_000_000_000;
        // Half the theoretical capacity: max = 2e9 flits/s.
        after.outgoing_qpi_flits[0][0] = 1_000_000_000;
        let util = get_outgoing_qpi_link_utilization(0, 0, &before, &after);
        assert!((util - 0.5).abs() < 1e-9, "utilization {util}");
        // Saturated counters clamp to 1.0.
        after.outgoing_qpi_flits[0][0] = u64::MAX / 2;
        let util = get_outgoing_qpi_link_utilization(0, 0, &before, &after);
        assert_eq!(util, 1.0);
    }

    #[test]
    fn incoming_qpi_bytes() {
        let mut before = SystemCounterState::default();
        let mut after = SystemCounterState::default();
        for s in [&mut before, &mut after] {
            s.num_sockets = 1;
            s.incoming_qpi_packets = vec![vec![0; 1]];
        }
        after.incoming_qpi_packets[0][0] = 1_000;
        assert_eq!(get_incoming_qpi_link_bytes(0, 0, &before, &after), 64_000);
        assert_eq!(get_all_incoming_qpi_link_bytes(&before, &after), 64_000);
    }
}
