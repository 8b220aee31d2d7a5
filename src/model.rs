//! Microarchitecture identification and per-model dispatch.
//!
//! All model-dependent behavior is selected once, at construction time,
//! from the (family, model, stepping) triple; nothing downstream switches
//! on raw CPUID output.

use crate::events::CoreEventSelect;
use crate::msrs;

/// Supported Intel microarchitectures, named by their server codenames
/// where a server uncore exists. The discriminants are the family-6 model
/// numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum CpuModel {
    NehalemEp = 26,
    Nehalem = 30,
    Atom = 28,
    Clarkdale = 37,
    WestmereEp = 44,
    NehalemEx = 46,
    WestmereEx = 47,
    SandyBridge = 42,
    Jaketown = 45,
    IvyBridge = 58,
    Ivytown = 62,
    Haswell = 60,
    HaswellUlt = 69,
    HaswellX = 63,
    Broadwell = 61,
    BdxDe = 86,
    Bdx = 79,
    ApolloLake = 92,
    Denverton = 95,
    Knl = 87,
    SklUy = 78,
    Skl = 94,
    Kbl = 158,
    Cml = 166,
    Icl = 126,
    Tgl = 140,
    Adl = 151,
    Rpl = 183,
    Skx = 85,
    Icx = 106,
    IcxD = 108,
    Snowridge = 134,
    Spr = 143,
    Emr = 207,
    Gnr = 173,
    GnrD = 174,
    Srf = 175,
    Grr = 182,
}

/// Variant of the SKX server die, distinguished only by stepping. The
/// stepping thresholds track published microcode revisions and are kept
/// here so a shift only needs one edit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkxVariant {
    Skx,
    CascadeLake,
    CooperLake,
}

impl CpuModel {
    /// Looks up a model by CPUID family/model. Returns `None` for
    /// processors the registry does not know; callers may still use
    /// topology-only functionality.
    pub fn from_family_model(family: u32, model: u32) -> Option<CpuModel> {
        if family != 6 {
            return None;
        }
        use CpuModel::*;
        Some(match model {
            26 => NehalemEp,
            30 => Nehalem,
            28 => Atom,
            37 => Clarkdale,
            44 => WestmereEp,
            46 => NehalemEx,
            47 => WestmereEx,
            42 => SandyBridge,
            45 => Jaketown,
            58 => IvyBridge,
            62 => Ivytown,
            60 => Haswell,
            69 => HaswellUlt,
            63 => HaswellX,
            61 => Broadwell,
            86 => BdxDe,
            79 => Bdx,
            92 => ApolloLake,
            95 => Denverton,
            87 => Knl,
            78 => SklUy,
            94 => Skl,
            158 => Kbl,
            166 => Cml,
            126 => Icl,
            140 => Tgl,
            151 => Adl,
            183 => Rpl,
            85 => Skx,
            106 => Icx,
            108 => IcxD,
            134 => Snowridge,
            143 => Spr,
            207 => Emr,
            173 => Gnr,
            174 => GnrD,
            175 => Srf,
            182 => Grr,
            _ => return None,
        })
    }

    pub fn skx_variant(self, stepping: u32) -> Option<SkxVariant> {
        if self != CpuModel::Skx {
            return None;
        }
        Some(match stepping {
            5..=7 => SkxVariant::CascadeLake,
            s if s >= 10 => SkxVariant::CooperLake,
            _ => SkxVariant::Skx,
        })
    }

    /// Whether the model carries a server uncore addressed through PCI
    /// config space and/or MMIO (as opposed to client free-running
    /// counters or the Nehalem-era MSR-only uncore).
    pub fn has_server_uncore(self) -> bool {
        use CpuModel::*;
        matches!(
            self,
            Jaketown
                | Ivytown
                | HaswellX
                | Bdx
                | BdxDe
                | Knl
                | Skx
                | Icx
                | IcxD
                | Snowridge
                | Spr
                | Emr
                | Gnr
                | GnrD
                | Srf
                | Grr
        )
    }

    /// iMC counter banks move from PCI config space to MMIO starting with
    /// the Snowridge/Icelake server generation.
    pub fn has_mmio_imc(self) -> bool {
        use CpuModel::*;
        matches!(
            self,
            Icx | IcxD | Snowridge | Spr | Emr | Gnr | GnrD | Srf | Grr
        )
    }

    /// Models whose iMC CAS counters split reads/writes over two counter
    /// positions that must be summed (READ+READ2, WRITE+WRITE2).
    pub fn has_split_cas_counters(self) -> bool {
        use CpuModel::*;
        matches!(self, Spr | Emr | Gnr | GnrD | Srf | Grr)
    }

    /// UPI links (SKX onwards) versus QPI links.
    pub fn has_upi(self) -> bool {
        use CpuModel::*;
        matches!(self, Skx | Icx | IcxD | Spr | Emr | Gnr | GnrD)
    }

    pub fn is_atom(self) -> bool {
        use CpuModel::*;
        matches!(self, Atom | ApolloLake | Denverton | Snowridge | Srf | Grr)
    }

    /// Big cores from Skylake onwards use the SKL cache-event positions.
    pub fn use_skylake_events(self) -> bool {
        use CpuModel::*;
        matches!(
            self,
            SklUy | Skl | Kbl | Cml | Icl | Tgl | Adl | Rpl | Skx | Icx | IcxD | Spr | Emr | Gnr
                | GnrD
        )
    }

    /// Default number of QPI/UPI links per socket; a numeric override is
    /// taken from the hardware when the link PMUs are enumerable.
    pub fn qpi_links_per_socket(self) -> usize {
        use CpuModel::*;
        match self {
            Jaketown | Ivytown => 2,
            HaswellX | Bdx => 3,
            Skx | Icx | IcxD => 3,
            Spr | Emr => 4,
            Gnr | GnrD => 6,
            _ => 0,
        }
    }

    /// Counter width of the programmable core counters.
    pub fn core_counter_width(self) -> u32 {
        48
    }

    /// The DRAM RAPL energy unit is fixed at 15.3 uJ on these server
    /// parts; everywhere else the package unit from MSR_RAPL_POWER_UNIT
    /// applies.
    pub fn has_fixed_dram_energy_unit(self) -> bool {
        use CpuModel::*;
        matches!(self, HaswellX | Bdx | BdxDe | Skx | Knl)
    }

    /// MSR indices of the core C-state residency counters, indexed by
    /// C-state number. `None` means the state does not exist on the model.
    pub fn core_c_state_msrs(self) -> [Option<u32>; msrs::MAX_C_STATE + 1] {
        let mut t = [None; msrs::MAX_C_STATE + 1];
        // C0 and C1 are derived, not read from MSRs.
        t[3] = Some(msrs::MSR_CORE_C3_RESIDENCY);
        t[6] = Some(msrs::MSR_CORE_C6_RESIDENCY);
        t[7] = Some(msrs::MSR_CORE_C7_RESIDENCY);
        if self.is_atom() {
            t[3] = None;
            t[7] = None;
        }
        t
    }

    /// MSR indices of the package C-state residency counters.
    pub fn pkg_c_state_msrs(self) -> [Option<u32>; msrs::MAX_C_STATE + 1] {
        use CpuModel::*;
        let mut t = [None; msrs::MAX_C_STATE + 1];
        t[2] = Some(msrs::MSR_PKG_C2_RESIDENCY);
        t[3] = Some(msrs::MSR_PKG_C3_RESIDENCY);
        t[6] = Some(msrs::MSR_PKG_C6_RESIDENCY);
        t[7] = Some(msrs::MSR_PKG_C7_RESIDENCY);
        match self {
            // Client low-power states.
            Haswell | HaswellUlt | Broadwell | SklUy | Skl | Kbl | Cml | Icl | Tgl | Adl | Rpl => {
                t[8] = Some(msrs::MSR_PKG_C8_RESIDENCY);
                t[9] = Some(msrs::MSR_PKG_C9_RESIDENCY);
                t[10] = Some(msrs::MSR_PKG_C10_RESIDENCY);
            }
            // Servers do not implement package C3/C7 from SKX onwards.
            Skx | Icx | IcxD | Snowridge | Spr | Emr | Gnr | GnrD | Srf | Grr => {
                t[3] = None;
                t[7] = None;
            }
            _ => {}
        }
        t
    }

    /// The default-mode core event set. Slot positions are significant:
    /// the cache-metric helpers read fixed positions per event family.
    pub fn default_core_events(self) -> Vec<CoreEventSelect> {
        if self.is_atom() || self == CpuModel::Knl {
            // Architectural LLC events only: misses in slot 0, references
            // in slot 1.
            vec![
                CoreEventSelect::counting(0x2E, 0x41),
                CoreEventSelect::counting(0x2E, 0x4F),
            ]
        } else if self.use_skylake_events() {
            vec![
                // LONGEST_LAT_CACHE.MISS (L3 misses)
                CoreEventSelect::counting(0x2E, 0x41),
                // MEM_LOAD_RETIRED.L3_HIT
                CoreEventSelect::counting(0xD1, 0x04),
                // L2_RQSTS.MISS
                CoreEventSelect::counting(0x24, 0x3F),
                // L2_RQSTS.REFERENCES
                CoreEventSelect::counting(0x24, 0xFF),
            ]
        } else {
            vec![
                // LONGEST_LAT_CACHE.MISS
                CoreEventSelect::counting(0x2E, 0x41),
                // MEM_LOAD_UOPS_RETIRED.L3_HIT (no cross-core snoop)
                CoreEventSelect::counting(0xD1, 0x04),
                // MEM_LOAD_UOPS_LLC_HIT_RETIRED.XSNP_HITM
                CoreEventSelect::counting(0xD2, 0x04),
                // MEM_LOAD_UOPS_RETIRED.L2_HIT
                CoreEventSelect::counting(0xD1, 0x02),
            ]
        }
    }
}

/// Identification of the running processor, latched at discovery time.
#[derive(Debug, Clone, Copy)]
pub struct CpuIdentity {
    pub family: u32,
    pub model_id: u32,
    pub stepping: u32,
    pub model: Option<CpuModel>,
    /// Nominal (base) frequency in Hz, from CPUID or measured.
    pub nominal_frequency: u64,
    /// Microcode revision when readable; zero otherwise.
    pub microcode: u64,
    /// Number of programmable core counters per logical thread.
    pub num_programmable_counters: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_lookup_covers_servers() {
        assert_eq!(CpuModel::from_family_model(6, 85), Some(CpuModel::Skx));
        assert_eq!(CpuModel::from_family_model(6, 143), Some(CpuModel::Spr));
        assert_eq!(CpuModel::from_family_model(6, 175), Some(CpuModel::Srf));
        assert_eq!(CpuModel::from_family_model(6, 9999), None);
        assert_eq!(CpuModel::from_family_model(15, 85), None);
    }

    #[test]
    fn skx_variant_by_stepping() {
        assert_eq!(CpuModel::Skx.skx_variant(4), Some(SkxVariant::Skx));
        assert_eq!(
            CpuModel::Skx.skx_variant(6),
            Some(SkxVariant::CascadeLake)
        );
        assert_eq!(CpuModel::Skx.skx_variant(11), Some(SkxVariant::CooperLake));
        assert_eq!(CpuModel::Icx.skx_variant(6), None);
    }

    #[test]
    fn split_cas_is_spr_generation_only() {
        assert!(CpuModel::Spr.has_split_cas_counters());
        assert!(CpuModel::Grr.has_split_cas_counters());
        assert!(!CpuModel::Icx.has_split_cas_counters());
        assert!(!CpuModel::Skx.has_split_cas_counters());
    }

    #[test]
    fn default_events_fill_expected_slots() {
        let skx = CpuModel::Skx.default_core_events();
        assert_eq!(skx.len(), 4);
        assert_eq!(skx[0].event, 0x2E);
        let atom = CpuModel::Denverton.default_core_events();
        assert_eq!(atom.len(), 2);
        assert_eq!(atom[1].umask, 0x4F);
    }

    #[test]
    fn server_pkg_cstates_drop_c3_c7() {
        let t = CpuModel::Icx.pkg_c_state_msrs();
        assert!(t[2].is_some());
        assert!(t[3].is_none());
        assert!(t[6].is_some());
        assert!(t[7].is_none());
    }
}
