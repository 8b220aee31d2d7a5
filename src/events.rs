//! Encoding and decoding of performance-event control words.
//!
//! A core event-select register (IA32_PERFEVTSELx) is a 64-bit word whose
//! layout is architectural; uncore boxes use a related but model-dependent
//! layout with the enable bit at the same position and an optional extended
//! umask in the high half.

const EVENT_SHIFT: u32 = 0;
const UMASK_SHIFT: u32 = 8;
const USR_BIT: u32 = 16;
const OS_BIT: u32 = 17;
const EDGE_BIT: u32 = 18;
const PIN_CONTROL_BIT: u32 = 19;
const APIC_INT_BIT: u32 = 20;
const ANY_THREAD_BIT: u32 = 21;
const ENABLE_BIT: u32 = 22;
const INVERT_BIT: u32 = 23;
const CMASK_SHIFT: u32 = 24;
const IN_TX_BIT: u32 = 32;
const IN_TXCP_BIT: u32 = 33;

/// Bitfield view of an IA32_PERFEVTSELx control word.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CoreEventSelect {
    pub event: u8,
    pub umask: u8,
    pub user: bool,
    pub os: bool,
    pub edge: bool,
    pub pin_control: bool,
    pub apic_int: bool,
    pub any_thread: bool,
    pub enable: bool,
    pub invert: bool,
    pub cmask: u8,
    pub in_tx: bool,
    pub in_txcp: bool,
}

impl CoreEventSelect {
    /// An enabled user+os counting configuration for (event, umask), the
    /// shape used for all default-mode core events.
    pub fn counting(event: u8, umask: u8) -> Self {
        CoreEventSelect {
            event,
            umask,
            user: true,
            os: true,
            enable: true,
            ..Default::default()
        }
    }

    pub fn encode(&self) -> u64 {
        let mut w = 0u64;
        w |= (self.event as u64) << EVENT_SHIFT;
        w |= (self.umask as u64) << UMASK_SHIFT;
        w |= (self.user as u64) << USR_BIT;
        w |= (self.os as u64) << OS_BIT;
        w |= (self.edge as u64) << EDGE_BIT;
        w |= (self.pin_control as u64) << PIN_CONTROL_BIT;
        w |= (self.apic_int as u64) << APIC_INT_BIT;
        w |= (self.any_thread as u64) << ANY_THREAD_BIT;
        w |= (self.enable as u64) << ENABLE_BIT;
        w |= (self.invert as u64) << INVERT_BIT;
        w |= (self.cmask as u64) << CMASK_SHIFT;
        w |= (self.in_tx as u64) << IN_TX_BIT;
        w |= (self.in_txcp as u64) << IN_TXCP_BIT;
        w
    }

    pub fn decode(w: u64) -> Self {
        CoreEventSelect {
            event: (w >> EVENT_SHIFT) as u8,
            umask: (w >> UMASK_SHIFT) as u8,
            user: w & (1 << USR_BIT) != 0,
            os: w & (1 << OS_BIT) != 0,
            edge: w & (1 << EDGE_BIT) != 0,
            pin_control: w & (1 << PIN_CONTROL_BIT) != 0,
            apic_int: w & (1 << APIC_INT_BIT) != 0,
            any_thread: w & (1 << ANY_THREAD_BIT) != 0,
            enable: w & (1 << ENABLE_BIT) != 0,
            invert: w & (1 << INVERT_BIT) != 0,
            cmask: (w >> CMASK_SHIFT) as u8,
            in_tx: w & (1u64 << IN_TX_BIT) != 0,
            in_txcp: w & (1u64 << IN_TXCP_BIT) != 0,
        }
    }

    /// The same word with the enable bit cleared. Control registers are
    /// written disabled first, then enabled, so a half-programmed counter
    /// never counts with a stale configuration.
    pub fn disabled(&self) -> u64 {
        self.encode() & !(1u64 << ENABLE_BIT)
    }
}

/// IA32_FIXED_CTR_CTRL word enabling the three architectural fixed
/// counters for both user and kernel rings, no PMI.
pub const FIXED_CTR_CTRL_ENABLE_OS_USR: u64 = 0x333;

/// IA32_PERF_GLOBAL_CTRL word enabling `num_gen` programmable counters and
/// the three fixed counters.
pub fn global_ctrl_enable(num_gen: u32) -> u64 {
    let gen_mask = if num_gen >= 64 {
        u64::MAX
    } else {
        (1u64 << num_gen) - 1
    };
    gen_mask | (0b111u64 << 32)
}

/// Generic uncore box control word. The enable, edge and invert bits sit
/// at the architectural positions; `umask_ext` lands in the high 32 bits
/// on the generations that define it (ICX and later CHA, SPR iMC).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UncoreEventSelect {
    pub event: u8,
    pub umask: u8,
    pub umask_ext: u32,
    pub edge: bool,
    pub tid_en: bool,
    pub invert: bool,
    pub thresh: u8,
}

impl UncoreEventSelect {
    pub fn counting(event: u8, umask: u8) -> Self {
        UncoreEventSelect {
            event,
            umask,
            ..Default::default()
        }
    }

    pub fn with_umask_ext(mut self, ext: u32) -> Self {
        self.umask_ext = ext;
        self
    }

    /// Encodes with the enable bit set.
    pub fn encode(&self) -> u64 {
        let mut w = 0u64;
        w |= self.event as u64;
        w |= (self.umask as u64) << 8;
        w |= (self.edge as u64) << 18;
        w |= (self.tid_en as u64) << 19;
        w |= 1u64 << 22; // enable
        w |= (self.invert as u64) << 23;
        w |= (self.thresh as u64) << 24;
        w |= (self.umask_ext as u64) << 32;
        w
    }
}

/// PCU event-select words use an occupancy sub-select instead of a umask.
pub fn pcu_event(event: u8, occ_sel: u8) -> u64 {
    (event as u64) | ((occ_sel as u64) << 14) | (1u64 << 22)
}

/// PCU filter word holding up to four frequency-band thresholds in units
/// of 100 MHz.
pub fn pcu_filter(bands: [u32; 3]) -> u64 {
    ((bands[0] as u64) & 0xff) | (((bands[1] as u64) & 0xff) << 8) | (((bands[2] as u64) & 0xff) << 16)
}

/// iMC fixed counter (DCLK) control: reset then enable.
pub const MC_FIXED_CTL_RST: u32 = 1 << 19;
pub const MC_FIXED_CTL_EN: u32 = 1 << 22;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_event_select_roundtrip() {
        for &(event, umask, edge, cmask, invert) in &[
            (0x2Eu8, 0x41u8, false, 0u8, false),
            (0xD1, 0x04, false, 0, false),
            (0x24, 0x3F, true, 1, false),
            (0xB7, 0x01, false, 0, true),
            (0x3C, 0x00, true, 0xFF, true),
        ] {
            let reg = CoreEventSelect {
                event,
                umask,
                edge,
                cmask,
                invert,
                user: true,
                os: true,
                enable: true,
                ..Default::default()
            };
            assert_eq!(CoreEventSelect::decode(reg.encode()), reg);
        }
    }

    #[test]
    fn disabled_word_differs_only_in_enable() {
        let reg = CoreEventSelect::counting(0x2E, 0x4F);
        let enabled = reg.encode();
        let disabled = reg.disabled();
        assert_eq!(enabled & !(1 << 22), disabled);
        assert!(!CoreEventSelect::decode(disabled).enable);
    }

    #[test]
    fn global_ctrl_includes_fixed_counters() {
        assert_eq!(global_ctrl_enable(4), 0x7_0000_000F);
        assert_eq!(global_ctrl_enable(8), 0x7_0000_00FF);
    }

    #[test]
    fn uncore_event_select_sets_enable() {
        let w = UncoreEventSelect::counting(0x04, 0x03).encode();
        assert_eq!(w & 0xff, 0x04);
        assert_eq!((w >> 8) & 0xff, 0x03);
        assert_ne!(w & (1 << 22), 0);
    }

    #[test]
    fn umask_ext_lands_in_high_half() {
        let w = UncoreEventSelect::counting(0x35, 0x21)
            .with_umask_ext(0xC817FE)
            .encode();
        assert_eq!(w >> 32, 0xC817FE);
    }
}
