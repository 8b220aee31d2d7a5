//! Uncore PMU unit bundles.
//!
//! A unit is one PMON box: a unit control register, up to four counter
//! control/value pairs, an optional fixed counter pair and up to two
//! filter registers. A unit is valid iff its unit control is present;
//! everything else degrades gracefully because box population varies per
//! SKU.

pub mod registry;
pub mod server;

use crate::error::{Error, Result};
use crate::registers::HwRegisterPtr;

/// Bit layout of the PMON unit control word. The classic layout is shared
/// by every generation up to ICX; SPR and later moved the freeze bit to
/// bit zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnitCtlLayout {
    pub freeze: u32,
    pub freeze_en: u32,
    pub rst_counters: u32,
    pub rst_control: u32,
    /// Bits that read back as written; used to detect a unit owned by
    /// another agent.
    pub valid_mask: u32,
}

pub const CLASSIC_UNIT_CTL: UnitCtlLayout = UnitCtlLayout {
    freeze: 1 << 8,
    freeze_en: 1 << 16,
    rst_counters: 1 << 1,
    rst_control: 1 << 0,
    valid_mask: (1 << 17) - 1,
};

pub const SPR_UNIT_CTL: UnitCtlLayout = UnitCtlLayout {
    freeze: 1 << 0,
    freeze_en: 0,
    rst_counters: 1 << 9,
    rst_control: 1 << 8,
    valid_mask: 0x3,
};

pub struct UncorePmu {
    layout: UnitCtlLayout,
    unit_control: Option<HwRegisterPtr>,
    counter_control: Vec<HwRegisterPtr>,
    counter_value: Vec<HwRegisterPtr>,
    fixed_counter_control: Option<HwRegisterPtr>,
    fixed_counter_value: Option<HwRegisterPtr>,
    filters: [Option<HwRegisterPtr>; 2],
}

impl UncorePmu {
    pub fn new(
        layout: UnitCtlLayout,
        unit_control: Option<HwRegisterPtr>,
        counter_control: Vec<HwRegisterPtr>,
        counter_value: Vec<HwRegisterPtr>,
    ) -> UncorePmu {
        UncorePmu {
            layout,
            unit_control,
            counter_control,
            counter_value,
            fixed_counter_control: None,
            fixed_counter_value: None,
            filters: [None, None],
        }
    }

    pub fn with_fixed(mut self, control: HwRegisterPtr, value: HwRegisterPtr) -> UncorePmu {
        self.fixed_counter_control = Some(control);
        self.fixed_counter_value = Some(value);
        self
    }

    pub fn with_filters(
        mut self,
        filter0: Option<HwRegisterPtr>,
        filter1: Option<HwRegisterPtr>,
    ) -> UncorePmu {
        self.filters = [filter0, filter1];
        self
    }

    pub fn valid(&self) -> bool {
        self.unit_control.is_some()
    }

    /// Number of general-purpose counters in the box.
    pub fn size(&self) -> usize {
        self.counter_control.len().min(self.counter_value.len())
    }

    fn unit_control_reg(&self) -> Result<&HwRegisterPtr> {
        self.unit_control
            .as_ref()
            .ok_or(Error::HardwareAbsent("uncore unit control"))
    }

    /// Freezes the unit and verifies ownership: a unit-control word that
    /// does not read back as written belongs to another agent (the
    /// hardware PMU_IN_USE case). Returns `false` in that case and leaves
    /// the unit untouched.
    pub fn init_freeze(&self) -> Result<bool> {
        let ctl = self.unit_control_reg()?;
        let word = u64::from(self.layout.freeze | self.layout.freeze_en);
        ctl.write(word)?;
        let read_back = ctl.read()? & u64::from(self.layout.valid_mask);
        if read_back != word & u64::from(self.layout.valid_mask) {
            log::warn!(
                "uncore unit control reads back {read_back:#x} after writing {word:#x}; \
                 the unit is likely in use by another agent"
            );
            return Ok(false);
        }
        Ok(true)
    }

    pub fn freeze(&self) -> Result<()> {
        self.unit_control_reg()?
            .write(u64::from(self.layout.freeze | self.layout.freeze_en))
    }

    pub fn unfreeze(&self) -> Result<()> {
        self.unit_control_reg()?.write(u64::from(self.layout.freeze_en))
    }

    /// Resets counters and control state, then unfreezes.
    pub fn reset_and_unfreeze(&self) -> Result<()> {
        let ctl = self.unit_control_reg()?;
        ctl.write(u64::from(
            self.layout.rst_counters | self.layout.rst_control | self.layout.freeze_en,
        ))?;
        ctl.write(u64::from(self.layout.freeze_en))
    }

    /// Writes one counter control with the disable-then-enable
    /// discipline: the enable bit (bit 22 on every PMON generation) is
    /// cleared in the first write.
    pub fn program_counter(&self, index: usize, control: u64) -> Result<()> {
        let reg = self
            .counter_control
            .get(index)
            .ok_or(Error::Invariant("uncore counter index out of range"))?;
        reg.write(control & !(1u64 << 22))?;
        reg.write(control)
    }

    pub fn write_filter(&self, index: usize, value: u64) -> Result<()> {
        match self.filters.get(index).and_then(|f| f.as_ref()) {
            Some(reg) => reg.write(value),
            None => Ok(()), // no filter on this generation
        }
    }

    pub fn enable_fixed(&self, control: u64) -> Result<()> {
        match &self.fixed_counter_control {
            Some(reg) => reg.write(control),
            None => Ok(()),
        }
    }

    pub fn read_counter(&self, index: usize) -> Result<u64> {
        self.counter_value
            .get(index)
            .ok_or(Error::Invariant("uncore counter index out of range"))?
            .read()
    }

    pub fn read_fixed(&self) -> Result<u64> {
        match &self.fixed_counter_value {
            Some(reg) => reg.read(),
            None => Ok(0),
        }
    }

    /// Clears every control register of the box; used by reset and
    /// cleanup paths. Read-side registers are left alone.
    pub fn cleanup(&self) -> Result<()> {
        for reg in &self.counter_control {
            reg.write(0)?;
        }
        if let Some(reg) = &self.fixed_counter_control {
            reg.write(0)?;
        }
        for reg in self.filters.iter().flatten() {
            reg.write(0)?;
        }
        if let Some(ctl) = &self.unit_control {
            ctl.write(0)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::registers::HwRegister;

    /// A register backed by plain memory, recording the last written
    /// value.
    pub(crate) struct MemRegister(AtomicU64);

    impl MemRegister {
        pub(crate) fn shared() -> Arc<MemRegister> {
            Arc::new(MemRegister(AtomicU64::new(0)))
        }

        pub(crate) fn value(&self) -> u64 {
            self.0.load(Ordering::SeqCst)
        }
    }

    impl HwRegister for MemRegister {
        fn read(&self) -> Result<u64> {
            Ok(self.0.load(Ordering::SeqCst))
        }

        fn write(&self, value: u64) -> Result<()> {
            self.0.store(value, Ordering::SeqCst);
            Ok(())
        }
    }

    fn pmu_with_registers() -> (UncorePmu, Arc<MemRegister>, Vec<Arc<MemRegister>>) {
        let unit = MemRegister::shared();
        let ctls: Vec<Arc<MemRegister>> = (0..4).map(|_| MemRegister::shared()).collect();
        let ctrs: Vec<Arc<MemRegister>> = (0..4).map(|_| MemRegister::shared()).collect();
        let pmu = UncorePmu::new(
            CLASSIC_UNIT_CTL,
            Some(unit.clone() as HwRegisterPtr),
            ctls.iter().map(|r| r.clone() as HwRegisterPtr).collect(),
            ctrs.iter().map(|r| r.clone() as HwRegisterPtr).collect(),
        );
        (pmu, unit, ctls)
    }

    #[test]
    fn invalid_unit_has_no_control() {
        let pmu = UncorePmu::new(CLASSIC_UNIT_CTL, None, Vec::new(), Vec::new());
        assert!(!pmu.valid());
        assert!(matches!(
            pmu.freeze(),
            Err(Error::HardwareAbsent(_))
        ));
    }

    #[test]
    fn init_freeze_detects_foreign_owner() {
        let (pmu, unit, _) = pmu_with_registers();
        assert!(pmu.init_freeze().expect("init freeze"));
        assert_eq!(unit.value(), u64::from((1u32 << 8) | (1u32 << 16)));
    }

    #[test]
    fn program_counter_writes_disabled_then_enabled() {
        let (pmu, _, ctls) = pmu_with_registers();
        let control = (0x04u64) | (0x03 << 8) | (1 << 22);
        pmu.program_counter(0, control).expect("program");
        // The final value has the enable bit; the intermediate disabled
        // write is observable only through hardware, so assert the end
        // state and the index bounds.
        assert_eq!(ctls[0].value(), control);
        assert!(pmu.program_counter(7, control).is_err());
    }

    #[test]
    fn cleanup_zeroes_all_controls() {
        let (pmu, unit, ctls) = pmu_with_registers();
        pmu.init_freeze().expect("freeze");
        pmu.program_counter(1, 0xdead_beef | (1 << 22)).expect("program");
        pmu.cleanup().expect("cleanup");
        assert_eq!(unit.value(), 0);
        for ctl in ctls {
            assert_eq!(ctl.value(), 0);
        }
    }
}
