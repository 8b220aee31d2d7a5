//! Per-socket server uncore: construction and programming.
//!
//! A `ServerUncore` owns every PMON box of one socket, built from the
//! registry descriptor over the socket's PCI bus, MMIO windows and the
//! socket reference core's MSR handle. Boxes that do not enumerate on
//! this SKU become invalid units and are skipped everywhere.

use std::sync::Arc;

use crate::counters::UncoreCounterState;
use crate::error::{Error, Result};
use crate::events::{UncoreEventSelect, MC_FIXED_CTL_EN, MC_FIXED_CTL_RST};
use crate::monitor::modes::{IioConfig, IioEvent, LatencyConfig, MemoryMetrics, PowerProfile};
use crate::registers::mmio::MmioRange;
use crate::registers::msr::SafeMsrHandle;
use crate::registers::pci::PciHandle;
use crate::registers::{
    Mmio32Register, Mmio64Register, MsrRegister, Pci32Register, Pci64Register,
};
use crate::uncore::registry::{
    ChaFilterKind, EventSpec, ImcDesc, MsrPmonLayout, PciPmonLayout, PciUnitLoc,
    UncoreRegistryEntry,
};
use crate::uncore::UncorePmu;

/// What the iMC counter positions mean after programming; read-side
/// interpretation follows this record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum ImcProgramming {
    #[default]
    ReadsWrites,
    SplitReadsWrites,
    PartialWrites,
    Pmem,
    Ranks,
    PendingQueues,
}

pub struct ServerUncore {
    socket: u32,
    entry: UncoreRegistryEntry,
    imc_pmus: Vec<UncorePmu>,
    edc_pmus: Vec<UncorePmu>,
    ha_pmus: Vec<UncorePmu>,
    m2m_pmus: Vec<UncorePmu>,
    xpi_pmus: Vec<UncorePmu>,
    m3upi_pmus: Vec<UncorePmu>,
    cha_pmus: Vec<UncorePmu>,
    iio_pmus: Vec<UncorePmu>,
    irp_pmus: Vec<UncorePmu>,
    pcu_pmu: Option<UncorePmu>,
    ubox_pmu: Option<UncorePmu>,
    cxl_pmus: Vec<UncorePmu>,
    qpi_speed: Vec<u64>,
    imc_programming: ImcProgramming,
}

/// Scans the PCI buses of group 0 for the registry's probe function and
/// returns one uncore bus per socket, in ascending bus order (matching
/// ascending socket numbering on all supported platforms).
pub fn discover_socket_buses(entry: &UncoreRegistryEntry, num_sockets: usize) -> Vec<u32> {
    let mut buses = Vec::new();
    for bus in 0..=255u32 {
        if !PciHandle::exists(0, bus, entry.bus_probe.device, entry.bus_probe.function) {
            continue;
        }
        match PciHandle::new(0, bus, entry.bus_probe.device, entry.bus_probe.function) {
            Ok(handle) if handle.is_intel_device() => buses.push(bus),
            _ => {}
        }
        if buses.len() == num_sockets {
            break;
        }
    }
    buses
}

fn pci_pmu(
    entry: &UncoreRegistryEntry,
    bus: u32,
    unit: PciUnitLoc,
    layout: &PciPmonLayout,
) -> Option<UncorePmu> {
    if !PciHandle::exists(0, bus, unit.device, unit.function) {
        return None;
    }
    let handle = match PciHandle::new(0, bus, unit.device, unit.function) {
        Ok(h) => Arc::new(h),
        Err(e) => {
            log::debug!(
                "uncore unit at bus {bus:#x} dev {} fn {} not usable: {e}",
                unit.device,
                unit.function
            );
            return None;
        }
    };
    if !handle.is_intel_device() {
        return None;
    }
    let n = entry.num_box_counters as u64;
    let controls = (0..n)
        .map(|i| Pci32Register::shared(&handle, layout.ctl0 + 4 * i))
        .collect();
    let values = (0..n)
        .map(|i| Pci64Register::shared(&handle, layout.ctr0 + 8 * i))
        .collect();
    let mut pmu = UncorePmu::new(
        entry.unit_ctl_layout,
        Some(Pci32Register::shared(&handle, layout.box_ctl)),
        controls,
        values,
    );
    if let (Some(fixed_ctl), Some(fixed_ctr)) = (layout.fixed_ctl, layout.fixed_ctr) {
        pmu = pmu.with_fixed(
            Pci32Register::shared(&handle, fixed_ctl),
            Pci64Register::shared(&handle, fixed_ctr),
        );
    }
    Some(pmu)
}

fn msr_pmu(
    entry: &UncoreRegistryEntry,
    msr: &Arc<SafeMsrHandle>,
    layout: &MsrPmonLayout,
    index: usize,
) -> Option<UncorePmu> {
    let base = layout.units.unit_base(index)?;
    let n = entry.num_box_counters as u32;
    let controls = (0..n)
        .map(|i| MsrRegister::shared(msr, base + layout.ctl_offset + i))
        .collect();
    let values = (0..n)
        .map(|i| MsrRegister::shared(msr, base + layout.ctr_offset + i))
        .collect();
    let pmu = UncorePmu::new(
        entry.unit_ctl_layout,
        Some(MsrRegister::shared(msr, base)),
        controls,
        values,
    );
    let filter0 = layout.filter0_offset.map(|o| MsrRegister::shared(msr, base + o));
    let filter1 = layout.filter1_offset.map(|o| MsrRegister::shared(msr, base + o));
    Some(pmu.with_filters(filter0, filter1))
}

fn mmio_pmu(
    entry: &UncoreRegistryEntry,
    range: &Arc<MmioRange>,
    box_ctl: u64,
    ctl0: u64,
    ctr0: u64,
    fixed: Option<(u64, u64)>,
) -> UncorePmu {
    let n = entry.num_box_counters as u64;
    let controls = (0..n)
        .map(|i| Mmio32Register::shared(range, (ctl0 + 4 * i) as usize))
        .collect();
    let values = (0..n)
        .map(|i| Mmio64Register::shared(range, (ctr0 + 8 * i) as usize))
        .collect();
    let mut pmu = UncorePmu::new(
        entry.unit_ctl_layout,
        Some(Mmio32Register::shared(range, box_ctl as usize)),
        controls,
        values,
    );
    if let Some((fixed_ctl, fixed_ctr)) = fixed {
        pmu = pmu.with_fixed(
            Mmio32Register::shared(range, fixed_ctl as usize),
            Mmio64Register::shared(range, fixed_ctr as usize),
        );
    }
    pmu
}

fn link_speed_from_rate_status(code: u32, is_upi: bool) -> u64 {
    // Transfer rate in GT/s from the rate-status field, times two bytes
    // per transfer.
    let gt = match code & 0x7 {
        2 => 5_600,
        3 => 6_400,
        4 => 8_000,
        5 => 9_600,
        6 => 10_400,
        7 => 11_200,
        _ if is_upi => 10_400,
        _ => 8_000,
    };
    gt * 1_000_000 * 2
}

impl ServerUncore {
    pub fn new(
        socket: u32,
        bus: u32,
        entry: UncoreRegistryEntry,
        msr: Arc<SafeMsrHandle>,
        num_cha_hint: usize,
    ) -> Result<ServerUncore> {
        let mut uncore = ServerUncore {
            socket,
            imc_pmus: Vec::new(),
            edc_pmus: Vec::new(),
            ha_pmus: Vec::new(),
            m2m_pmus: Vec::new(),
            xpi_pmus: Vec::new(),
            m3upi_pmus: Vec::new(),
            cha_pmus: Vec::new(),
            iio_pmus: Vec::new(),
            irp_pmus: Vec::new(),
            pcu_pmu: None,
            ubox_pmu: None,
            cxl_pmus: Vec::new(),
            qpi_speed: Vec::new(),
            imc_programming: ImcProgramming::default(),
            entry,
        };
        uncore.build_imc(bus)?;
        uncore.build_pci_units(bus);
        uncore.build_msr_units(&msr, num_cha_hint);
        uncore.read_link_speeds(bus);
        log::debug!(
            "socket {socket}: {} iMC channels, {} links, {} CHAs",
            uncore.imc_pmus.len(),
            uncore.xpi_pmus.len(),
            uncore.cha_pmus.len()
        );
        Ok(uncore)
    }

    fn build_imc(&mut self, bus: u32) -> Result<()> {
        match &self.entry.imc {
            ImcDesc::Pci {
                controllers,
                layout,
            } => {
                // Channel indices flatten across controllers in
                // socket-local order.
                for unit in controllers.iter().flatten() {
                    if let Some(pmu) = pci_pmu(&self.entry, bus, *unit, layout) {
                        self.imc_pmus.push(pmu);
                    }
                }
            }
            ImcDesc::Mmio {
                bar_unit,
                membar_lo_offset,
                membar_lo_shift,
                mem_offsets,
                mem_shift,
                channel_base,
                channel_step,
                channel_size,
                box_ctl_offset,
                ctl0_offset,
                ctr0_offset,
                fixed_ctl_offset,
                fixed_ctr_offset,
                channels_per_controller,
            } => {
                if !PciHandle::exists(0, bus, bar_unit.device, bar_unit.function) {
                    return Ok(());
                }
                let bar = PciHandle::new(0, bus, bar_unit.device, bar_unit.function)?;
                let base =
                    (u64::from(bar.read32(*membar_lo_offset)?) & 0x1FFF_FFFF) << membar_lo_shift;
                if base == 0 {
                    return Ok(());
                }
                for (controller, channels) in channels_per_controller.iter().enumerate() {
                    let mem_offset = mem_offsets.get(controller).copied().unwrap_or(0);
                    let mem = (u64::from(bar.read32(mem_offset)?) & 0x7FF) << mem_shift;
                    for channel in 0..*channels {
                        let addr = base + mem + channel_base + channel_step * channel as u64;
                        match MmioRange::shared(addr, *channel_size as usize, true) {
                            Ok(range) => self.imc_pmus.push(
                                mmio_pmu(
                                    &self.entry,
                                    &range,
                                    *box_ctl_offset,
                                    *ctl0_offset,
                                    *ctr0_offset,
                                    Some((*fixed_ctl_offset, *fixed_ctr_offset)),
                                ),
                            ),
                            Err(e) => {
                                log::debug!(
                                    "iMC channel {channel} of controller {controller} \
                                     not mappable: {e}"
                                );
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn build_pci_units(&mut self, bus: u32) {
        let entry = self.entry.clone();
        for unit in &entry.ha {
            if let Some(pmu) = pci_pmu(&entry, bus, *unit, &crate::uncore::registry::XPF_PCI_PMON) {
                self.ha_pmus.push(pmu);
            }
        }
        for unit in &entry.m2m {
            if let Some(pmu) = pci_pmu(&entry, bus, *unit, &crate::uncore::registry::XPF_PCI_PMON) {
                self.m2m_pmus.push(pmu);
            }
        }
        if let Some(xpi) = &entry.xpi {
            for unit in &xpi.locs {
                if let Some(pmu) = pci_pmu(&entry, bus, *unit, &xpi.layout) {
                    self.xpi_pmus.push(pmu);
                }
            }
        }
        for unit in &entry.m3upi {
            if let Some(pmu) = pci_pmu(&entry, bus, *unit, &crate::uncore::registry::XPF_PCI_PMON) {
                self.m3upi_pmus.push(pmu);
            }
        }
        if let Some((edc_locs, edc_layout)) = &entry.edc {
            for unit in edc_locs {
                if let Some(pmu) = pci_pmu(&entry, bus, *unit, edc_layout) {
                    self.edc_pmus.push(pmu);
                }
            }
        }
        if let Some(cxl) = &entry.cxl {
            self.build_cxl(bus, cxl);
        }
    }

    fn build_cxl(&mut self, bus: u32, cxl: &crate::uncore::registry::CxlDesc) {
        if !PciHandle::exists(0, bus, cxl.bar_unit.device, cxl.bar_unit.function) {
            return;
        }
        let bar = match PciHandle::new(0, bus, cxl.bar_unit.device, cxl.bar_unit.function) {
            Ok(b) => b,
            Err(_) => return,
        };
        let base = match bar.read32(cxl.membar_lo_offset) {
            Ok(w) => (u64::from(w) & 0x1FFF_FFFF) << cxl.membar_lo_shift,
            Err(_) => return,
        };
        if base == 0 {
            return;
        }
        // One PMON window per port; ports that do not decode fail the
        // mapping and are skipped.
        for port in 0..8u64 {
            let addr = base + cxl.port_step * port;
            match MmioRange::shared(addr, cxl.pmon_size as usize, true) {
                Ok(range) => self.cxl_pmus.push(mmio_pmu(
                    &self.entry,
                    &range,
                    cxl.box_ctl_offset,
                    cxl.ctl0_offset,
                    cxl.ctr0_offset,
                    None,
                )),
                Err(_) => break,
            }
        }
    }

    fn build_msr_units(&mut self, msr: &Arc<SafeMsrHandle>, num_cha_hint: usize) {
        let entry = self.entry.clone();
        if let Some(cha) = &entry.cha {
            let count = cha.layout.units.count().min(num_cha_hint.max(1));
            for i in 0..count {
                if let Some(pmu) = msr_pmu(&entry, msr, &cha.layout, i) {
                    self.cha_pmus.push(pmu);
                }
            }
        }
        if let Some(iio) = &entry.iio {
            for i in 0..iio.layout.units.count() {
                if let Some(pmu) = msr_pmu(&entry, msr, &iio.layout, i) {
                    self.iio_pmus.push(pmu);
                }
            }
        }
        if let Some(irp) = &entry.irp {
            for i in 0..irp.layout.units.count() {
                if let Some(pmu) = msr_pmu(&entry, msr, &irp.layout, i) {
                    self.irp_pmus.push(pmu);
                }
            }
        }
        if let Some(pcu) = &entry.pcu {
            let n = entry.num_box_counters as u32;
            let controls = (0..n).map(|i| MsrRegister::shared(msr, pcu.ctl0 + i)).collect();
            let values = (0..n).map(|i| MsrRegister::shared(msr, pcu.ctr0 + i)).collect();
            let pmu = UncorePmu::new(
                entry.unit_ctl_layout,
                Some(MsrRegister::shared(msr, pcu.box_ctl)),
                controls,
                values,
            );
            let filter = pcu.filter.map(|f| MsrRegister::shared(msr, f));
            self.pcu_pmu = Some(pmu.with_filters(filter, None));
        }
        if let Some(ubox) = &entry.ubox {
            let controls = ubox.ctl.iter().map(|c| MsrRegister::shared(msr, *c)).collect();
            let values = ubox.ctr.iter().map(|c| MsrRegister::shared(msr, *c)).collect();
            let unit_control = ubox.box_ctl.map(|c| MsrRegister::shared(msr, c));
            self.ubox_pmu = Some(
                UncorePmu::new(entry.unit_ctl_layout, unit_control, controls, values).with_fixed(
                    MsrRegister::shared(msr, ubox.fixed_ctl),
                    MsrRegister::shared(msr, ubox.fixed_ctr),
                ),
            );
        }
    }

    fn read_link_speeds(&mut self, bus: u32) {
        let Some(xpi) = &self.entry.xpi else {
            return;
        };
        for unit in &xpi.locs {
            let speed = xpi
                .rate_status_offset
                .and_then(|offset| {
                    PciHandle::new(0, bus, unit.device, 0)
                        .ok()
                        .and_then(|misc| misc.read32(offset).ok())
                })
                .map(|code| link_speed_from_rate_status(code, xpi.is_upi))
                .unwrap_or_else(|| link_speed_from_rate_status(0, xpi.is_upi));
            self.qpi_speed.push(speed);
        }
    }

    fn control_word(&self, spec: EventSpec) -> u64 {
        UncoreEventSelect::counting(spec.event, spec.umask)
            .with_umask_ext(spec.umask_ext)
            .encode()
    }

    pub fn num_channels(&self) -> usize {
        self.imc_pmus.len()
    }

    pub fn num_links(&self) -> usize {
        self.xpi_pmus.len()
    }

    pub fn num_cha(&self) -> usize {
        self.cha_pmus.len()
    }

    pub fn num_iio_stacks(&self) -> usize {
        self.iio_pmus.len()
    }

    pub fn num_cxl_ports(&self) -> usize {
        self.cxl_pmus.len()
    }

    pub fn qpi_speeds(&self) -> &[u64] {
        &self.qpi_speed
    }

    pub fn counter_budget(&self, pmu: &str) -> Option<usize> {
        let n = self.entry.num_box_counters;
        match pmu {
            "imc" | "cha" | "cbo" | "m2m" | "upi" | "qpi" | "xpi" | "pcu" | "iio" | "irp"
            | "cxl" | "ha" | "m3upi" | "edc" => Some(n),
            "ubox" => Some(2),
            _ => None,
        }
    }

    /// Freezes every valid box and verifies no other agent owns them.
    pub fn init_freeze_all(&self) -> Result<()> {
        for pmu in self.all_pmus() {
            if !pmu.valid() {
                continue;
            }
            if !pmu.init_freeze()? {
                return Err(Error::Busy);
            }
        }
        Ok(())
    }

    pub fn unfreeze_all(&self) -> Result<()> {
        for pmu in self.all_pmus() {
            if pmu.valid() {
                pmu.reset_and_unfreeze()?;
            }
        }
        Ok(())
    }

    fn all_pmus(&self) -> impl Iterator<Item = &UncorePmu> {
        self.imc_pmus
            .iter()
            .chain(self.edc_pmus.iter())
            .chain(self.ha_pmus.iter())
            .chain(self.m2m_pmus.iter())
            .chain(self.xpi_pmus.iter())
            .chain(self.m3upi_pmus.iter())
            .chain(self.cha_pmus.iter())
            .chain(self.iio_pmus.iter())
            .chain(self.irp_pmus.iter())
            .chain(self.cxl_pmus.iter())
            .chain(self.pcu_pmu.iter())
            .chain(self.ubox_pmu.iter())
    }

    /// The default uncore setup: memory read/write CAS counts, link
    /// traffic, home-agent requests, TOR latency events and the uncore
    /// clock, everything the default counter states expose.
    pub fn program_default(&mut self) -> Result<()> {
        self.program_memory(MemoryMetrics::ReadsWrites, None, None)?;
        self.program_xpi()?;
        self.program_ha()?;
        self.program_llc_miss_latency()?;
        self.program_uclk()?;
        Ok(())
    }

    pub fn program_memory(
        &mut self,
        metrics: MemoryMetrics,
        rank_a: Option<u32>,
        rank_b: Option<u32>,
    ) -> Result<()> {
        let cas = self.entry.cas;
        let split = cas.read2.is_some();
        self.imc_programming = match (rank_a.or(rank_b).is_some(), metrics) {
            (true, _) => ImcProgramming::Ranks,
            (false, MemoryMetrics::ReadsWrites) if split => ImcProgramming::SplitReadsWrites,
            (false, MemoryMetrics::ReadsWrites) => ImcProgramming::ReadsWrites,
            (false, MemoryMetrics::PartialWrites) => ImcProgramming::PartialWrites,
            (false, MemoryMetrics::Pmem | MemoryMetrics::PmemMemoryMode) => ImcProgramming::Pmem,
        };
        if matches!(metrics, MemoryMetrics::Pmem | MemoryMetrics::PmemMemoryMode)
            && cas.pmm_read.is_none()
        {
            return Err(Error::HardwareAbsent("persistent memory counters"));
        }

        for pmu in &self.imc_pmus {
            if !pmu.valid() {
                continue;
            }
            pmu.freeze()?;
            match self.imc_programming {
                ImcProgramming::Ranks => {
                    // Per-rank CAS events trade channel observability for
                    // rank visibility: both ranks share the channel's
                    // counters.
                    let rank_a = rank_a.unwrap_or(0) as u8;
                    let rank_b = rank_b.unwrap_or(1) as u8;
                    pmu.program_counter(0, self.control_word(ev_rank_read(rank_a)))?;
                    pmu.program_counter(1, self.control_word(ev_rank_write(rank_a)))?;
                    pmu.program_counter(2, self.control_word(ev_rank_read(rank_b)))?;
                    pmu.program_counter(3, self.control_word(ev_rank_write(rank_b)))?;
                }
                ImcProgramming::SplitReadsWrites => {
                    pmu.program_counter(0, self.control_word(cas.read))?;
                    pmu.program_counter(1, self.control_word(cas.write))?;
                    // READ2/WRITE2 positions are summed with READ/WRITE at
                    // read time.
                    if let (Some(read2), Some(write2)) = (cas.read2, cas.write2) {
                        pmu.program_counter(2, self.control_word(read2))?;
                        pmu.program_counter(3, self.control_word(write2))?;
                    }
                }
                ImcProgramming::ReadsWrites => {
                    pmu.program_counter(0, self.control_word(cas.read))?;
                    pmu.program_counter(1, self.control_word(cas.write))?;
                }
                ImcProgramming::PartialWrites => {
                    pmu.program_counter(0, self.control_word(cas.read))?;
                    pmu.program_counter(1, self.control_word(cas.write))?;
                    pmu.program_counter(2, self.control_word(cas.partial))?;
                }
                ImcProgramming::Pmem => {
                    pmu.program_counter(0, self.control_word(cas.read))?;
                    pmu.program_counter(1, self.control_word(cas.write))?;
                    if let (Some(pmm_read), Some(pmm_write)) = (cas.pmm_read, cas.pmm_write) {
                        pmu.program_counter(2, self.control_word(pmm_read))?;
                        pmu.program_counter(3, self.control_word(pmm_write))?;
                    }
                }
                ImcProgramming::PendingQueues => unreachable!("set only by program_latency"),
            }
            // DCLK ticks on the fixed counter.
            pmu.enable_fixed(u64::from(MC_FIXED_CTL_RST))?;
            pmu.enable_fixed(u64::from(MC_FIXED_CTL_EN))?;
            pmu.unfreeze()?;
        }

        if metrics == MemoryMetrics::PmemMemoryMode {
            self.program_memory_mode()?;
        }
        self.program_edc()?;
        Ok(())
    }

    fn program_memory_mode(&mut self) -> Result<()> {
        let Some(mode) = self.entry.memory_mode else {
            return Err(Error::HardwareAbsent("memory-mode tag counters"));
        };
        let words = [
            self.control_word(mode.nm_hit),
            self.control_word(mode.nm_miss_clean),
            self.control_word(mode.nm_miss_dirty),
        ];
        for pmu in &self.m2m_pmus {
            if !pmu.valid() {
                continue;
            }
            pmu.freeze()?;
            for (i, word) in words.iter().enumerate() {
                pmu.program_counter(i, *word)?;
            }
            pmu.unfreeze()?;
        }
        Ok(())
    }

    fn program_edc(&mut self) -> Result<()> {
        if self.edc_pmus.is_empty() {
            return Ok(());
        }
        // EDC read/write CAS on the embedded-DRAM channels.
        let read = self.control_word(EventSpec {
            event: 0x01,
            umask: 0x01,
            umask_ext: 0,
        });
        let write = self.control_word(EventSpec {
            event: 0x02,
            umask: 0x01,
            umask_ext: 0,
        });
        for pmu in &self.edc_pmus {
            pmu.freeze()?;
            pmu.program_counter(0, read)?;
            pmu.program_counter(1, write)?;
            pmu.enable_fixed(u64::from(MC_FIXED_CTL_EN))?;
            pmu.unfreeze()?;
        }
        Ok(())
    }

    fn program_xpi(&mut self) -> Result<()> {
        let Some(xpi) = self.entry.xpi.clone() else {
            return Ok(());
        };
        for pmu in &self.xpi_pmus {
            if !pmu.valid() {
                continue;
            }
            pmu.freeze()?;
            pmu.program_counter(0, self.control_word(xpi.incoming))?;
            pmu.program_counter(1, self.control_word(xpi.outgoing))?;
            pmu.program_counter(2, self.control_word(xpi.tx_l0p_cycles))?;
            pmu.unfreeze()?;
        }
        Ok(())
    }

    fn program_ha(&mut self) -> Result<()> {
        let requests = self.control_word(self.entry.ha_requests);
        let local = self.control_word(self.entry.ha_local_requests);
        for pmu in &self.ha_pmus {
            if !pmu.valid() {
                continue;
            }
            pmu.freeze()?;
            pmu.program_counter(0, requests)?;
            pmu.program_counter(1, local)?;
            pmu.unfreeze()?;
        }
        Ok(())
    }

    /// TOR occupancy (counter 0) and inserts (counter 1) restricted to IA
    /// LLC-miss reads, plus uncore clockticks (counter 2); the LLC miss
    /// latency derivation reads exactly these positions.
    fn program_llc_miss_latency(&mut self) -> Result<()> {
        let Some(cha) = self.entry.cha.clone() else {
            return Ok(());
        };
        for pmu in &self.cha_pmus {
            if !pmu.valid() {
                continue;
            }
            pmu.freeze()?;
            if cha.filter_kind != ChaFilterKind::UmaskExt {
                let filter_index = match cha.filter_kind {
                    ChaFilterKind::Jkt => 0,
                    _ => 1,
                };
                pmu.write_filter(filter_index, cha.llc_miss_filter)?;
            }
            pmu.program_counter(0, self.control_word(cha.tor_occupancy))?;
            pmu.program_counter(1, self.control_word(cha.tor_inserts))?;
            pmu.program_counter(2, self.control_word(cha.clockticks))?;
            pmu.unfreeze()?;
        }
        Ok(())
    }

    /// Generic CBO/CHA programming with an opcode filter, used by the
    /// PCIe traffic mode and exposed to clients.
    pub fn program_cha(
        &mut self,
        events: &[EventSpec],
        opcode: Option<u64>,
        tid_filter: Option<u32>,
    ) -> Result<()> {
        let Some(cha) = self.entry.cha.clone() else {
            return Err(Error::HardwareAbsent("CHA/CBO units"));
        };
        if events.len() > self.entry.num_box_counters {
            return Err(Error::Invariant("too many CHA events for counter budget"));
        }
        for pmu in &self.cha_pmus {
            if !pmu.valid() {
                continue;
            }
            pmu.freeze()?;
            if let Some(opcode) = opcode {
                let (index, word) = match cha.filter_kind {
                    ChaFilterKind::Jkt => (0, opcode << 23),
                    ChaFilterKind::IvtHsx => (1, opcode << 20),
                    ChaFilterKind::Skx => (1, (opcode << 9) | 0x33),
                    // Opcode folds into the extended umask on ICX+.
                    ChaFilterKind::UmaskExt => (0, 0),
                };
                if cha.filter_kind != ChaFilterKind::UmaskExt {
                    pmu.write_filter(index, word)?;
                }
            }
            if let Some(tid) = tid_filter {
                // The TID filter shares filter0 on every generation that
                // supports it.
                pmu.write_filter(0, u64::from(tid))?;
            }
            for (i, spec) in events.iter().enumerate() {
                let mut select = UncoreEventSelect::counting(spec.event, spec.umask)
                    .with_umask_ext(spec.umask_ext);
                select.tid_en = tid_filter.is_some();
                pmu.program_counter(i, select.encode())?;
            }
            pmu.unfreeze()?;
        }
        Ok(())
    }

    fn program_uclk(&self) -> Result<()> {
        if let Some(ubox) = &self.ubox_pmu {
            // UCLK fixed counter: enable bit only.
            ubox.enable_fixed(1 << 22)?;
        }
        Ok(())
    }

    pub fn program_power(&mut self, profile: &PowerProfile) -> Result<()> {
        let Some(pcu) = &self.pcu_pmu else {
            return Err(Error::HardwareAbsent("power control unit PMU"));
        };
        let events = pcu_profile_events(profile.pcu_profile)
            .ok_or(Error::Invariant("unknown PCU profile"))?;
        pcu.freeze()?;
        pcu.write_filter(0, crate::events::pcu_filter(profile.freq_bands))?;
        for (i, event) in events.iter().enumerate() {
            pcu.program_counter(i, crate::events::pcu_event(*event, 0))?;
        }
        pcu.unfreeze()?;
        self.program_uclk()?;
        // The iMC side of the power mode only needs DCLK ticks.
        for pmu in &self.imc_pmus {
            if pmu.valid() {
                pmu.enable_fixed(u64::from(MC_FIXED_CTL_EN))?;
            }
        }
        Ok(())
    }

    pub fn program_latency(&mut self, config: &LatencyConfig) -> Result<()> {
        let pq = self.entry.pending_queue;
        let (occ, ins) = if config.pmm {
            match (pq.pmm_rpq_occupancy, pq.pmm_rpq_inserts) {
                (Some(o), Some(i)) => (o, i),
                _ => return Err(Error::HardwareAbsent("PMM pending-queue counters")),
            }
        } else {
            (pq.rpq_occupancy, pq.rpq_inserts)
        };
        self.imc_programming = ImcProgramming::PendingQueues;
        for pmu in &self.imc_pmus {
            if !pmu.valid() {
                continue;
            }
            pmu.freeze()?;
            pmu.program_counter(0, self.control_word(occ))?;
            pmu.program_counter(1, self.control_word(ins))?;
            pmu.program_counter(2, self.control_word(pq.wpq_occupancy))?;
            pmu.program_counter(3, self.control_word(pq.wpq_inserts))?;
            pmu.enable_fixed(u64::from(MC_FIXED_CTL_RST))?;
            pmu.enable_fixed(u64::from(MC_FIXED_CTL_EN))?;
            pmu.unfreeze()?;
        }
        self.program_llc_miss_latency()?;
        self.program_uclk()
    }

    pub fn program_iio(&mut self, config: &IioConfig) -> Result<()> {
        let Some(iio) = self.entry.iio.clone() else {
            return Err(Error::HardwareAbsent("IIO stack PMUs"));
        };
        if config.events.len() > self.entry.num_box_counters {
            return Err(Error::Invariant("too many IIO events for counter budget"));
        }
        for pmu in &self.iio_pmus {
            self.program_iio_like(pmu, iio.ch_mask_shift, iio.ch_mask_width, iio.fc_mask_shift, &config.events)?;
        }
        Ok(())
    }

    pub fn program_cxl(&mut self, events: &[IioEvent]) -> Result<()> {
        if self.cxl_pmus.is_empty() {
            return Err(Error::HardwareAbsent("CXL port PMUs"));
        }
        if events.len() > self.entry.num_box_counters {
            return Err(Error::Invariant("too many CXL events for counter budget"));
        }
        for pmu in &self.cxl_pmus {
            self.program_iio_like(pmu, 36, 12, 48, events)?;
        }
        Ok(())
    }

    fn program_iio_like(
        &self,
        pmu: &UncorePmu,
        ch_mask_shift: u32,
        ch_mask_width: u32,
        fc_mask_shift: u32,
        events: &[IioEvent],
    ) -> Result<()> {
        if !pmu.valid() {
            return Ok(());
        }
        pmu.freeze()?;
        for (i, event) in events.iter().enumerate() {
            if u32::from(event.ch_mask) >= (1u32 << ch_mask_width) {
                return Err(Error::Invariant("IIO channel mask wider than hardware mask"));
            }
            let word = u64::from(event.event)
                | (u64::from(event.umask) << 8)
                | (1u64 << 22)
                | (u64::from(event.ch_mask) << ch_mask_shift)
                | (u64::from(event.fc_mask) << fc_mask_shift);
            pmu.program_counter(i, word)?;
        }
        pmu.unfreeze()?;
        Ok(())
    }

    /// Programs raw control words on every unit of the named PMU class.
    pub fn program_raw(&mut self, pmu_name: &str, words: &[u64], fixed: Option<u64>) -> Result<()> {
        let pmus: Vec<&UncorePmu> = match pmu_name {
            "imc" => self.imc_pmus.iter().collect(),
            "edc" => self.edc_pmus.iter().collect(),
            "ha" => self.ha_pmus.iter().collect(),
            "m2m" => self.m2m_pmus.iter().collect(),
            "upi" | "qpi" | "xpi" => self.xpi_pmus.iter().collect(),
            "m3upi" => self.m3upi_pmus.iter().collect(),
            "cha" | "cbo" => self.cha_pmus.iter().collect(),
            "iio" => self.iio_pmus.iter().collect(),
            "irp" => self.irp_pmus.iter().collect(),
            "cxl" => self.cxl_pmus.iter().collect(),
            "pcu" => self.pcu_pmu.iter().collect(),
            "ubox" => self.ubox_pmu.iter().collect(),
            _ => return Err(Error::Invariant("unknown PMU name in raw config")),
        };
        for pmu in pmus {
            if !pmu.valid() {
                continue;
            }
            pmu.freeze()?;
            for (i, word) in words.iter().enumerate() {
                pmu.program_counter(i, *word)?;
            }
            if let Some(fixed) = fixed {
                pmu.enable_fixed(fixed)?;
            }
            pmu.unfreeze()?;
        }
        Ok(())
    }

    /// Reads every programmed bank into the socket's uncore state, in a
    /// fixed order (iMC channels ascending, then HA, M2M, CHA, UBox) so
    /// consecutive snapshots produce coherent deltas.
    pub fn read_into(&self, state: &mut UncoreCounterState) {
        let split = self.imc_programming == ImcProgramming::SplitReadsWrites;
        for pmu in &self.imc_pmus {
            if !pmu.valid() {
                continue;
            }
            match self.imc_programming {
                ImcProgramming::ReadsWrites | ImcProgramming::SplitReadsWrites => {
                    state.mc_normal_reads += read_or_zero(pmu, 0);
                    state.mc_full_writes += read_or_zero(pmu, 1);
                    if split {
                        state.mc_normal_reads += read_or_zero(pmu, 2);
                        state.mc_full_writes += read_or_zero(pmu, 3);
                    }
                }
                ImcProgramming::Ranks => {
                    state.mc_normal_reads += read_or_zero(pmu, 0) + read_or_zero(pmu, 2);
                    state.mc_full_writes += read_or_zero(pmu, 1) + read_or_zero(pmu, 3);
                }
                ImcProgramming::PartialWrites => {
                    state.mc_normal_reads += read_or_zero(pmu, 0);
                    state.mc_full_writes += read_or_zero(pmu, 1);
                    state.mc_partial_writes += read_or_zero(pmu, 2);
                }
                ImcProgramming::Pmem => {
                    state.mc_normal_reads += read_or_zero(pmu, 0);
                    state.mc_full_writes += read_or_zero(pmu, 1);
                    state.pmm_reads += read_or_zero(pmu, 2);
                    state.pmm_writes += read_or_zero(pmu, 3);
                }
                ImcProgramming::PendingQueues => {
                    // Queue occupancy/inserts are read per channel via
                    // read_mc_counter; nothing aggregates here.
                }
            }
        }
        for pmu in &self.edc_pmus {
            state.edc_normal_reads += read_or_zero(pmu, 0);
            state.edc_full_writes += read_or_zero(pmu, 1);
        }
        for pmu in &self.ha_pmus {
            state.ha_requests += read_or_zero(pmu, 0);
            state.ha_local_requests += read_or_zero(pmu, 1);
        }
        for pmu in &self.cha_pmus {
            state.tor_occupancy_ia_miss += read_or_zero(pmu, 0);
            state.tor_inserts_ia_miss += read_or_zero(pmu, 1);
        }
        if let Some(ubox) = &self.ubox_pmu {
            state.uncore_clocks += ubox.read_fixed().unwrap_or(0);
        }
        state.edc_scale = self.entry.edc_scale;
    }

    /// Reads the per-channel counter at `slot` for one iMC channel; used
    /// by the latency surface (pending-queue occupancy over inserts).
    pub fn read_mc_counter(&self, channel: usize, slot: usize) -> u64 {
        self.imc_pmus
            .get(channel)
            .map(|pmu| read_or_zero(pmu, slot))
            .unwrap_or(0)
    }

    pub fn read_mc_dclk(&self, channel: usize) -> u64 {
        self.imc_pmus
            .get(channel)
            .and_then(|pmu| pmu.read_fixed().ok())
            .unwrap_or(0)
    }

    pub fn read_iio_counter(&self, stack: usize, slot: usize) -> u64 {
        self.iio_pmus
            .get(stack)
            .map(|pmu| read_or_zero(pmu, slot))
            .unwrap_or(0)
    }

    pub fn read_cxl_counter(&self, port: usize, slot: usize) -> u64 {
        self.cxl_pmus
            .get(port)
            .map(|pmu| read_or_zero(pmu, slot))
            .unwrap_or(0)
    }

    pub fn read_pcu_counter(&self, slot: usize) -> u64 {
        self.pcu_pmu
            .as_ref()
            .map(|pmu| read_or_zero(pmu, slot))
            .unwrap_or(0)
    }

    /// Per-link (incoming packets, outgoing flits, L0p cycles).
    pub fn read_links(&self) -> (Vec<u64>, Vec<u64>, Vec<u64>) {
        let flits_per_transfer = self
            .entry
            .xpi
            .as_ref()
            .map(|x| x.flits_per_transfer)
            .unwrap_or(8)
            .max(1);
        let mut incoming = Vec::new();
        let mut outgoing = Vec::new();
        let mut l0p = Vec::new();
        for pmu in &self.xpi_pmus {
            incoming.push(read_or_zero(pmu, 0) / flits_per_transfer);
            outgoing.push(read_or_zero(pmu, 1));
            l0p.push(read_or_zero(pmu, 2));
        }
        (incoming, outgoing, l0p)
    }

    /// Clears all control state; used by reset and cleanup. Never fails:
    /// a box that stopped decoding mid-session is simply skipped.
    pub fn cleanup(&self) {
        for pmu in self.all_pmus() {
            if pmu.valid() {
                if let Err(e) = pmu.cleanup() {
                    log::debug!("uncore cleanup on socket {}: {e}", self.socket);
                }
            }
        }
    }
}

fn read_or_zero(pmu: &UncorePmu, index: usize) -> u64 {
    pmu.read_counter(index).unwrap_or(0)
}

fn ev_rank_read(rank: u8) -> EventSpec {
    EventSpec {
        event: 0xB0 + rank,
        umask: 0xFF,
        umask_ext: 0,
    }
}

fn ev_rank_write(rank: u8) -> EventSpec {
    EventSpec {
        event: 0xB8 + rank,
        umask: 0xFF,
        umask_ext: 0,
    }
}

/// PCU event sets by profile number; the filter word supplies frequency
/// bands for the band profiles.
pub fn pcu_profile_events(profile: u32) -> Option<[u8; 4]> {
    Some(match profile {
        // Frequency-band residency cycles.
        0 => [0x0B, 0x0C, 0x0D, 0x00],
        // Frequency-limit causes.
        1 => [0x04, 0x05, 0x06, 0x07],
        // Package sleep-state transitions.
        2 => [0x2B, 0x2D, 0x00, 0x00],
        // PROCHOT assertion cycles.
        3 => [0x09, 0x0A, 0x00, 0x00],
        // Frequency transition cycles.
        4 => [0x60, 0x00, 0x00, 0x00],
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pcu_profiles_are_closed() {
        assert!(pcu_profile_events(0).is_some());
        assert!(pcu_profile_events(4).is_some());
        assert!(pcu_profile_events(5).is_none());
    }

    #[test]
    fn link_speed_decoding() {
        assert_eq!(link_speed_from_rate_status(4, false), 16_000_000_000);
        assert_eq!(link_speed_from_rate_status(6, true), 20_800_000_000);
        // Unknown codes fall back to the generation default.
        assert_eq!(link_speed_from_rate_status(0, true), 20_800_000_000);
        assert_eq!(link_speed_from_rate_status(0, false), 16_000_000_000);
    }

    #[test]
    fn rank_events_encode_rank_in_event_number(){
        assert_eq!(ev_rank_read(0).event, 0xB0);
        assert_eq!(ev_rank_read(3).event, 0xB3);
        assert_eq!(ev_rank_write(1).event, 0xB9);
    }
}
