//! Programming modes and their payloads.

use rustc_hash::FxHashMap;

use crate::error::{Error, Result};
use crate::events::CoreEventSelect;

/// A custom core event: selector plus optional offcore-response MSR
/// values for the offcore events.
#[derive(Debug, Clone, Copy, Default)]
pub struct CoreEvent {
    pub select: CoreEventSelect,
    pub offcore_response0: Option<u64>,
    pub offcore_response1: Option<u64>,
}

/// Extended custom-core payload: up to the full programmable-counter
/// budget plus fixed-counter behavior control.
#[derive(Debug, Clone, Default)]
pub struct ExtCoreEventSet {
    pub events: Vec<CoreEvent>,
    /// Custom IA32_FIXED_CTR_CTRL value; `None` keeps the default
    /// os+user counting.
    pub fixed_ctr_ctrl: Option<u64>,
}

/// Which memory-controller metrics to program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MemoryMetrics {
    #[default]
    ReadsWrites,
    PartialWrites,
    Pmem,
    PmemMemoryMode,
}

/// PCU profile plus the three frequency bands (in 100 MHz units) fed to
/// the PCU filter.
#[derive(Debug, Clone, Copy, Default)]
pub struct PowerProfile {
    pub pcu_profile: u32,
    pub freq_bands: [u32; 3],
    pub imc_profile: i32,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LatencyConfig {
    /// Also program the persistent-memory pending queues.
    pub pmm: bool,
}

/// One IIO/CXL counter setup: event selector with channel and function
/// masks. The channel-mask width is model-dependent; values wider than
/// the hardware mask are rejected at programming time.
#[derive(Debug, Clone, Copy, Default)]
pub struct IioEvent {
    pub event: u8,
    pub umask: u8,
    pub ch_mask: u16,
    pub fc_mask: u8,
}

#[derive(Debug, Clone, Default)]
pub struct IioConfig {
    pub events: Vec<IioEvent>,
}

#[derive(Debug, Clone, Default)]
pub struct CxlConfig {
    pub events: Vec<IioEvent>,
}

/// CHA/CBO opcode-filtered setup used for PCIe traffic accounting.
#[derive(Debug, Clone, Default)]
pub struct PcieConfig {
    pub events: Vec<crate::uncore::registry::EventSpec>,
    pub opcode: Option<u64>,
    pub tid_filter: Option<u32>,
}

/// Raw per-PMU programming: map from PMU name ("imc", "cha", "upi",
/// "m2m", "pcu", "iio", "ubox") to event control words.
#[derive(Debug, Clone, Default)]
pub struct RawPmuConfig {
    pub programmable: FxHashMap<String, Vec<u64>>,
    pub fixed: FxHashMap<String, u64>,
}

impl RawPmuConfig {
    /// Validates the per-PMU counter budgets before anything is written.
    pub fn validate(&self, budget: impl Fn(&str) -> Option<usize>) -> Result<()> {
        for (pmu, events) in &self.programmable {
            match budget(pmu) {
                Some(limit) if events.len() <= limit => {}
                Some(_) => {
                    return Err(Error::Invariant("raw PMU event list exceeds counter budget"))
                }
                None => return Err(Error::Invariant("unknown PMU name in raw config")),
            }
        }
        Ok(())
    }
}

/// What to program. Each variant carries its full payload so `program`
/// takes a single argument.
#[derive(Debug, Clone, Default)]
pub enum ProgramMode {
    #[default]
    Default,
    CustomCore([CoreEvent; 4]),
    ExtCustomCore(ExtCoreEventSet),
    RawPmu(RawPmuConfig),
    UncoreMemory {
        metrics: MemoryMetrics,
        rank_a: Option<u32>,
        rank_b: Option<u32>,
    },
    UncorePower(PowerProfile),
    UncoreLatency(LatencyConfig),
    UncoreIio(IioConfig),
    UncoreCxl(CxlConfig),
    UncorePcie(PcieConfig),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_config_budget_validation() {
        let mut config = RawPmuConfig::default();
        config
            .programmable
            .insert("imc".to_owned(), vec![0x400304, 0x400C04]);
        let budget = |name: &str| match name {
            "imc" => Some(4),
            _ => None,
        };
        assert!(config.validate(budget).is_ok());

        config
            .programmable
            .insert("imc".to_owned(), vec![0; 5]);
        assert!(config.validate(budget).is_err());

        let mut unknown = RawPmuConfig::default();
        unknown.programmable.insert("nope".to_owned(), vec![1]);
        assert!(unknown.validate(budget).is_err());
    }
}
