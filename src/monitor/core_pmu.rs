//! The per-thread core PMU register bank.
//!
//! Control registers are addressed through the `HwRegister` capability,
//! so the programming discipline (global disable, selector written
//! disabled, counter zeroed, selector re-written enabled, then fixed and
//! global enables) is the same code whether it talks to `/dev/cpu/N/msr`
//! or to a test double.

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::events::{global_ctrl_enable, CoreEventSelect};
use crate::monitor::modes::CoreEvent;
use crate::msrs;
use crate::registers::msr::SafeMsrHandle;
use crate::registers::{HwRegisterPtr, MsrRegister};

pub(crate) struct CorePmu {
    global_ctrl: HwRegisterPtr,
    fixed_ctr_ctrl: HwRegisterPtr,
    ovf_ctrl: HwRegisterPtr,
    evtsel: Vec<HwRegisterPtr>,
    pmc: Vec<HwRegisterPtr>,
    offcore_rsp: [Option<HwRegisterPtr>; 2],
}

impl CorePmu {
    pub(crate) fn new(
        global_ctrl: HwRegisterPtr,
        fixed_ctr_ctrl: HwRegisterPtr,
        ovf_ctrl: HwRegisterPtr,
        evtsel: Vec<HwRegisterPtr>,
        pmc: Vec<HwRegisterPtr>,
        offcore_rsp: [Option<HwRegisterPtr>; 2],
    ) -> CorePmu {
        CorePmu {
            global_ctrl,
            fixed_ctr_ctrl,
            ovf_ctrl,
            evtsel,
            pmc,
            offcore_rsp,
        }
    }

    pub(crate) fn from_msr(msr: &Arc<SafeMsrHandle>, num_counters: u32) -> CorePmu {
        CorePmu::new(
            MsrRegister::shared(msr, msrs::IA32_CR_PERF_GLOBAL_CTRL),
            MsrRegister::shared(msr, msrs::IA32_CR_FIXED_CTR_CTRL),
            MsrRegister::shared(msr, msrs::IA32_CR_PERF_GLOBAL_OVF_CTRL),
            (0..num_counters)
                .map(|i| MsrRegister::shared(msr, msrs::IA32_PERFEVTSEL0_ADDR + i))
                .collect(),
            (0..num_counters)
                .map(|i| MsrRegister::shared(msr, msrs::IA32_PMC0 + i))
                .collect(),
            [
                Some(MsrRegister::shared(msr, msrs::MSR_OFFCORE_RSP0)),
                Some(MsrRegister::shared(msr, msrs::MSR_OFFCORE_RSP1)),
            ],
        )
    }

    /// Number of programmable counters in the bank.
    pub(crate) fn size(&self) -> usize {
        self.evtsel.len().min(self.pmc.len())
    }

    /// An enabled IA32_PERFEVTSEL0 before anything was programmed means
    /// another agent owns the core counters.
    pub(crate) fn in_use(&self) -> Result<bool> {
        let Some(evtsel0) = self.evtsel.first() else {
            return Ok(false);
        };
        Ok(CoreEventSelect::decode(evtsel0.read()?).enable)
    }

    /// Programs the event set. Every selector is written with its enable
    /// bit clear first and its counter zeroed, so a half-programmed
    /// counter never counts with a stale configuration.
    pub(crate) fn program(&self, events: &[CoreEvent], fixed_ctrl: u64) -> Result<()> {
        if events.len() > self.size() {
            return Err(Error::Invariant("custom core event set exceeds counter budget"));
        }
        self.global_ctrl.write(0)?;
        for (i, event) in events.iter().enumerate() {
            self.evtsel[i].write(event.select.disabled())?;
            self.pmc[i].write(0)?;
            if let (Some(rsp0), Some(reg)) = (event.offcore_response0, &self.offcore_rsp[0]) {
                reg.write(rsp0)?;
            }
            if let (Some(rsp1), Some(reg)) = (event.offcore_response1, &self.offcore_rsp[1]) {
                reg.write(rsp1)?;
            }
            self.evtsel[i].write(event.select.encode())?;
        }
        self.fixed_ctr_ctrl.write(fixed_ctrl)?;
        self.global_ctrl.write(global_ctrl_enable(events.len() as u32))
    }

    /// Same discipline for raw control words.
    pub(crate) fn program_raw(&self, words: &[u64], fixed_ctrl: u64) -> Result<()> {
        if words.len() > self.size() {
            return Err(Error::Invariant("raw PMU event list exceeds counter budget"));
        }
        self.global_ctrl.write(0)?;
        for (i, word) in words.iter().enumerate() {
            self.evtsel[i].write(word & !(1u64 << 22))?;
            self.pmc[i].write(0)?;
            self.evtsel[i].write(*word)?;
        }
        self.fixed_ctr_ctrl.write(fixed_ctrl)?;
        self.global_ctrl.write(global_ctrl_enable(words.len() as u32))
    }

    /// Clears every control register and any sticky overflow state.
    pub(crate) fn reset(&self) -> Result<()> {
        self.global_ctrl.write(0)?;
        self.fixed_ctr_ctrl.write(0)?;
        for evtsel in &self.evtsel {
            evtsel.write(0)?;
        }
        self.ovf_ctrl
            .write(global_ctrl_enable(self.evtsel.len() as u32))
    }

    /// Best-effort `reset` for release paths that must not fail.
    pub(crate) fn quiet_reset(&self) {
        let _ = self.global_ctrl.write(0);
        let _ = self.fixed_ctr_ctrl.write(0);
        for evtsel in &self.evtsel {
            let _ = evtsel.write(0);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};

    use parking_lot::Mutex;

    use super::*;
    use crate::events::{CoreEventSelect, FIXED_CTR_CTRL_ENABLE_OS_USR};
    use crate::registers::HwRegister;

    /// A register double that appends every write to a shared journal.
    struct RecordingRegister {
        name: &'static str,
        journal: Arc<Mutex<Vec<(&'static str, u64)>>>,
        value: AtomicU64,
    }

    impl RecordingRegister {
        fn shared(
            name: &'static str,
            journal: &Arc<Mutex<Vec<(&'static str, u64)>>>,
        ) -> Arc<RecordingRegister> {
            Arc::new(RecordingRegister {
                name,
                journal: Arc::clone(journal),
                value: AtomicU64::new(0),
            })
        }
    }

    impl HwRegister for RecordingRegister {
        fn read(&self) -> Result<u64> {
            Ok(self.value.load(Ordering::SeqCst))
        }

        fn write(&self, value: u64) -> Result<()> {
            self.journal.lock().push((self.name, value));
            self.value.store(value, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Bank {
        pmu: CorePmu,
        journal: Arc<Mutex<Vec<(&'static str, u64)>>>,
        evtsel: Vec<Arc<RecordingRegister>>,
        global_ctrl: Arc<RecordingRegister>,
    }

    fn bank_with_counters(n: usize) -> Bank {
        let journal = Arc::new(Mutex::new(Vec::new()));
        let global_ctrl = RecordingRegister::shared("global_ctrl", &journal);
        let evtsel_names = ["evtsel0", "evtsel1", "evtsel2", "evtsel3"];
        let pmc_names = ["pmc0", "pmc1", "pmc2", "pmc3"];
        let evtsel: Vec<Arc<RecordingRegister>> = (0..n)
            .map(|i| RecordingRegister::shared(evtsel_names[i], &journal))
            .collect();
        let pmu = CorePmu::new(
            global_ctrl.clone() as HwRegisterPtr,
            RecordingRegister::shared("fixed_ctrl", &journal) as HwRegisterPtr,
            RecordingRegister::shared("ovf_ctrl", &journal) as HwRegisterPtr,
            evtsel.iter().map(|r| r.clone() as HwRegisterPtr).collect(),
            (0..n)
                .map(|i| RecordingRegister::shared(pmc_names[i], &journal) as HwRegisterPtr)
                .collect(),
            [
                Some(RecordingRegister::shared("offcore_rsp0", &journal) as HwRegisterPtr),
                Some(RecordingRegister::shared("offcore_rsp1", &journal) as HwRegisterPtr),
            ],
        );
        Bank {
            pmu,
            journal,
            evtsel,
            global_ctrl,
        }
    }

    #[test]
    fn program_writes_disabled_then_zero_then_enabled() {
        let bank = bank_with_counters(2);
        let event = CoreEvent {
            select: CoreEventSelect::counting(0x2E, 0x41),
            offcore_response0: None,
            offcore_response1: None,
        };
        bank.pmu
            .program(&[event], FIXED_CTR_CTRL_ENABLE_OS_USR)
            .expect("program");

        let journal = bank.journal.lock();
        let disabled = event.select.disabled();
        let enabled = event.select.encode();
        assert_eq!(
            *journal,
            vec![
                ("global_ctrl", 0),
                ("evtsel0", disabled),
                ("pmc0", 0),
                ("evtsel0", enabled),
                ("fixed_ctrl", FIXED_CTR_CTRL_ENABLE_OS_USR),
                ("global_ctrl", global_ctrl_enable(1)),
            ]
        );
        assert_eq!(disabled & (1 << 22), 0);
        assert_ne!(enabled & (1 << 22), 0);
    }

    #[test]
    fn offcore_events_configure_response_msrs() {
        let bank = bank_with_counters(2);
        let event = CoreEvent {
            select: CoreEventSelect::counting(0xB7, 0x01),
            offcore_response0: Some(0x3F80400091),
            offcore_response1: None,
        };
        bank.pmu
            .program(&[event], FIXED_CTR_CTRL_ENABLE_OS_USR)
            .expect("program");
        let journal = bank.journal.lock();
        assert!(journal.contains(&("offcore_rsp0", 0x3F80400091)));
        assert!(!journal.iter().any(|(name, _)| *name == "offcore_rsp1"));
    }

    #[test]
    fn oversized_event_sets_are_rejected_before_any_write() {
        let bank = bank_with_counters(2);
        let events = vec![CoreEvent::default(); 3];
        assert!(matches!(
            bank.pmu.program(&events, FIXED_CTR_CTRL_ENABLE_OS_USR),
            Err(Error::Invariant(_))
        ));
        assert!(bank.journal.lock().is_empty());

        assert!(matches!(
            bank.pmu.program_raw(&[0, 0, 0], 0),
            Err(Error::Invariant(_))
        ));
        assert!(bank.journal.lock().is_empty());
    }

    #[test]
    fn reset_clears_controls_and_overflow_state() {
        let bank = bank_with_counters(2);
        let event = CoreEvent {
            select: CoreEventSelect::counting(0xD1, 0x04),
            offcore_response0: None,
            offcore_response1: None,
        };
        bank.pmu
            .program(&[event], FIXED_CTR_CTRL_ENABLE_OS_USR)
            .expect("program");
        bank.pmu.reset().expect("reset");
        for evtsel in &bank.evtsel {
            assert_eq!(evtsel.value.load(Ordering::SeqCst), 0);
        }
        assert_eq!(bank.global_ctrl.value.load(Ordering::SeqCst), 0);
        let journal = bank.journal.lock();
        assert!(journal
            .iter()
            .any(|(name, value)| *name == "ovf_ctrl" && *value == global_ctrl_enable(2)));
    }

    #[test]
    fn foreign_owner_is_detected_through_evtsel0() {
        let bank = bank_with_counters(2);
        assert!(!bank.pmu.in_use().expect("in_use"));
        bank.evtsel[0]
            .write(CoreEventSelect::counting(0x3C, 0x00).encode())
            .expect("write");
        assert!(bank.pmu.in_use().expect("in_use"));
    }
}
