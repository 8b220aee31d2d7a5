//! CPUID-driven topology discovery.
//!
//! A probe thread is pinned to each OS CPU in turn; the x2APIC topology
//! leaf yields the (socket, core, thread) split and the deterministic
//! cache leaf yields the L2 sharing width that defines tiles. CPUs that
//! cannot be pinned are offline and are skipped, not errors.

use crate::error::{Error, Result};
use crate::model::{CpuIdentity, CpuModel};
use crate::topology::{CpuLocation, SystemTopology};

/// Composes the displayed family/model from the raw CPUID leaf-1 fields.
fn display_family_model(
    base_family: u32,
    ext_family: u32,
    base_model: u32,
    ext_model: u32,
) -> (u32, u32) {
    let family = if base_family == 0xF {
        base_family + ext_family
    } else {
        base_family
    };
    let model = if base_family == 6 || base_family == 0xF {
        (ext_model << 4) + base_model
    } else {
        base_model
    };
    (family, model)
}

/// Splits an x2APIC id into the tree coordinates. `smt_shift` is the
/// width of the thread field, `core_shift` the combined width of the
/// thread and core fields, `l2_shift` the width of the APIC id span
/// sharing one L2 cache.
fn location_from_apic_id(
    os_id: u32,
    x2apic_id: u32,
    smt_shift: u32,
    core_shift: u32,
    l2_shift: u32,
) -> CpuLocation {
    let within_mask = (1u32 << core_shift) - 1;
    let within = x2apic_id & within_mask;
    CpuLocation {
        os_id,
        socket: x2apic_id >> core_shift,
        tile: within >> l2_shift,
        core: within >> smt_shift,
        thread: x2apic_id & ((1u32 << smt_shift) - 1),
    }
}

fn ceil_log2(value: u32) -> u32 {
    if value <= 1 {
        0
    } else {
        32 - (value - 1).leading_zeros()
    }
}

cfg_if::cfg_if! {
    if #[cfg(all(unix, any(target_arch = "x86", target_arch = "x86_64")))] {
        use std::thread;
        use std::time::{Duration, Instant};

        use x86::cpuid::{CpuId, TopologyType};

        use crate::affinity::ScopedAffinity;

        fn num_configured_cpus() -> usize {
            let n = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_CONF) };
            if n < 1 {
                1
            } else {
                n as usize
            }
        }

        /// TSC ticks per second, measured against the monotonic clock when
        /// CPUID does not report the base frequency.
        fn measure_tsc_frequency() -> u64 {
            let started = Instant::now();
            let tsc_start = unsafe { x86::time::rdtsc() };
            thread::sleep(Duration::from_millis(20));
            let tsc_end = unsafe { x86::time::rdtsc() };
            let elapsed = started.elapsed().as_secs_f64();
            ((tsc_end.wrapping_sub(tsc_start)) as f64 / elapsed) as u64
        }

        fn nominal_frequency(cpuid: &CpuId) -> u64 {
            if let Some(info) = cpuid.get_processor_frequency_info() {
                let mhz = info.processor_base_frequency();
                if mhz > 0 {
                    return u64::from(mhz) * 1_000_000;
                }
            }
            measure_tsc_frequency()
        }

        fn read_microcode_revision() -> u64 {
            #[cfg(any(target_os = "android", target_os = "linux"))]
            {
                if let Ok(text) =
                    std::fs::read_to_string("/sys/devices/system/cpu/cpu0/microcode/version")
                {
                    let text = text.trim().trim_start_matches("0x");
                    if let Ok(v) = u64::from_str_radix(text, 16) {
                        return v;
                    }
                }
            }
            0
        }

        /// The shifts of the SMT and SMT+core fields in the x2APIC id, and
        /// the id itself, for the CPU the caller is pinned to.
        fn topology_shifts(cpuid: &CpuId) -> Option<(u32, u32, u32)> {
            let mut smt_shift = None;
            let mut core_shift = None;
            let mut x2apic_id = None;
            for level in cpuid.get_extended_topology_info()? {
                x2apic_id = Some(level.x2apic_id());
                match level.level_type() {
                    TopologyType::SMT => smt_shift = Some(level.shift_right_for_next_apic_id()),
                    TopologyType::Core => core_shift = Some(level.shift_right_for_next_apic_id()),
                    _ => {}
                }
            }
            Some((smt_shift?, core_shift?, x2apic_id?))
        }

        /// Width of the APIC-id span sharing the L2 cache, from the
        /// deterministic cache leaf.
        fn l2_sharing_shift(cpuid: &CpuId, smt_shift: u32) -> u32 {
            if let Some(params) = cpuid.get_cache_parameters() {
                for cache in params {
                    if cache.level() == 2 {
                        return ceil_log2(cache.max_cores_for_cache() as u32);
                    }
                }
            }
            // Without the cache leaf, one tile per core.
            smt_shift
        }

        pub fn discover() -> Result<(CpuIdentity, SystemTopology)> {
            let cpuid = CpuId::new();
            match cpuid.get_vendor_info() {
                Some(v) if v.as_str() == "GenuineIntel" => {}
                _ => return Err(Error::Unsupported("not an Intel processor")),
            }

            let features = cpuid
                .get_feature_info()
                .ok_or(Error::Unsupported("CPUID feature leaf unavailable"))?;
            let (family, model_id) = display_family_model(
                features.family_id() as u32,
                features.extended_family_id() as u32,
                features.model_id() as u32,
                features.extended_model_id() as u32,
            );
            let stepping = features.stepping_id() as u32;
            let model = CpuModel::from_family_model(family, model_id);
            if model.is_none() {
                log::warn!(
                    "unrecognized processor model (family {family:#x}, model {model_id:#x}); \
                     only topology and core counters will be available"
                );
            }

            let num_programmable_counters = cpuid
                .get_performance_monitoring_info()
                .map(|p| u32::from(p.number_of_counters()))
                .filter(|n| *n > 0)
                .unwrap_or(4)
                .min(crate::msrs::MAX_CORE_GEN_COUNTERS as u32);

            let identity = CpuIdentity {
                family,
                model_id,
                stepping,
                model,
                nominal_frequency: nominal_frequency(&cpuid),
                microcode: read_microcode_revision(),
                num_programmable_counters,
            };

            let configured = num_configured_cpus();
            #[cfg(any(target_os = "android", target_os = "linux"))]
            log::debug!("{} of {configured} configured CPUs online", num_cpus::get());

            let mut locations = Vec::new();
            for os_id in 0..configured {
                // Pinning fails for offline CPUs; skip them.
                let _pin = match ScopedAffinity::pin_to(os_id) {
                    Ok(guard) => guard,
                    Err(_) => continue,
                };
                let cpuid = CpuId::new();
                match topology_shifts(&cpuid) {
                    Some((smt_shift, core_shift, x2apic_id)) => {
                        let l2_shift = l2_sharing_shift(&cpuid, smt_shift).clamp(smt_shift, core_shift);
                        locations.push(location_from_apic_id(
                            os_id as u32,
                            x2apic_id,
                            smt_shift,
                            core_shift,
                            l2_shift,
                        ));
                    }
                    None => {
                        // Very old parts without leaf 0xB: flat topology.
                        locations.push(CpuLocation {
                            os_id: os_id as u32,
                            socket: 0,
                            tile: os_id as u32,
                            core: os_id as u32,
                            thread: 0,
                        });
                    }
                }
            }

            if locations.is_empty() {
                return Err(Error::Invariant("no online CPUs discovered"));
            }
            Ok((identity, SystemTopology::from_locations(locations)))
        }
    } else {
        pub fn discover() -> Result<(CpuIdentity, SystemTopology)> {
            Err(Error::Unsupported("topology discovery on this platform"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn family_model_composition() {
        // Plain family 6 keeps the base family and composes the model.
        assert_eq!(display_family_model(6, 0, 5, 5), (6, 85)); // SKX
        assert_eq!(display_family_model(6, 0, 0xF, 8), (6, 143)); // SPR
        // Family 0xF adds the extended family.
        assert_eq!(display_family_model(0xF, 1, 2, 0), (0x10, 2));
        // Other families ignore the extended model.
        assert_eq!(display_family_model(5, 0, 4, 7), (5, 4));
    }

    #[test]
    fn apic_id_split() {
        // smt_shift=1 (2 threads/core), core_shift=6 (32 logical per
        // socket), l2 spans 4 APIC ids (2 cores per tile).
        let loc = location_from_apic_id(17, 0b10_10110, 1, 6, 2);
        assert_eq!(loc.os_id, 17);
        assert_eq!(loc.socket, 1);
        assert_eq!(loc.thread, 0);
        assert_eq!(loc.core, 0b1011);
        assert_eq!(loc.tile, 0b101);
    }

    #[test]
    fn ceil_log2_rounds_up() {
        assert_eq!(ceil_log2(1), 0);
        assert_eq!(ceil_log2(2), 1);
        assert_eq!(ceil_log2(3), 2);
        assert_eq!(ceil_log2(4), 2);
        assert_eq!(ceil_log2(20), 5);
    }
}
