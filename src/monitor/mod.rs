//! The PMU programming and sampling engine.
//!
//! One `Monitor` exists per process. It owns every OS handle the crate
//! touches (MSR descriptors, PCI config handles, MMIO windows, the
//! exclusion semaphore) and routes all release paths through `cleanup`,
//! which is also what the Ctrl+C handler runs so an aborted session
//! leaves the host PMU usable.

pub(crate) mod core_pmu;
pub mod modes;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::counters::{
    CoreCounterState, LinkGeometry, SocketCounterState, SystemCounterState, UncoreCounterState,
    INVALID_THERMAL_HEADROOM,
};
use crate::error::{Error, Result};
use crate::events::FIXED_CTR_CTRL_ENABLE_OS_USR;
use crate::instance_lock::InstanceLock;
use crate::model::{CpuIdentity, CpuModel};
use crate::msrs;
use crate::registers::extender::{CounterWidthExtender, DEFAULT_PERIOD_32BIT};
use crate::registers::msr::SafeMsrHandle;
use crate::registers::{HwRegister, HwRegisterPtr};
use crate::resctrl::Resctrl;
use crate::topology::{discovery, SystemTopology};
use crate::uncore::registry;
use crate::uncore::server::{discover_socket_buses, ServerUncore};
use core_pmu::CorePmu;
use modes::{CoreEvent, ProgramMode};

#[cfg(any(target_os = "android", target_os = "linux"))]
use crate::registers::perf::{
    PerfEventGroup, PerfRegister, PERF_COUNT_HW_CPU_CYCLES, PERF_COUNT_HW_INSTRUCTIONS,
    PERF_COUNT_HW_REF_CPU_CYCLES, PERF_TYPE_HARDWARE,
};

static INSTANCE: OnceLock<Arc<Monitor>> = OnceLock::new();

/// Chicken bit for the SNB-EP LLC-event erratum; counting is only
/// correct with the bit set, at a documented latency cost.
const MSR_JKT_WORKAROUND: u32 = 0x39C;

struct EngineState {
    programmed: bool,
    mode: ProgramMode,
    num_events: usize,
    uncores: Vec<ServerUncore>,
    resctrl: Option<Resctrl>,
    mbl: FxHashMap<u32, Arc<CounterWidthExtender>>,
    mbt: FxHashMap<u32, Arc<CounterWidthExtender>>,
    /// Per-CPU {instructions, core cycles, reference cycles} registers
    /// backed by one perf event group each.
    #[cfg(any(target_os = "android", target_os = "linux"))]
    perf_fixed: FxHashMap<u32, [HwRegisterPtr; 3]>,
    nmi_watchdog_prev: Option<String>,
}

impl EngineState {
    fn new() -> EngineState {
        EngineState {
            programmed: false,
            mode: ProgramMode::Default,
            num_events: 0,
            uncores: Vec::new(),
            resctrl: None,
            mbl: FxHashMap::default(),
            mbt: FxHashMap::default(),
            #[cfg(any(target_os = "android", target_os = "linux"))]
            perf_fixed: FxHashMap::default(),
            nmi_watchdog_prev: None,
        }
    }
}

pub struct Monitor {
    identity: CpuIdentity,
    topology: SystemTopology,
    msr_handles: FxHashMap<u32, Arc<SafeMsrHandle>>,
    instance_lock: InstanceLock,
    allow_multiple: AtomicBool,
    use_perf: bool,
    joules_per_unit: f64,
    dram_joules_per_unit: f64,
    state: Mutex<EngineState>,
}

impl Monitor {
    /// The process-wide engine handle, created lazily on first call. The
    /// first successful call installs a Ctrl+C handler that runs
    /// `cleanup` before terminating.
    pub fn instance() -> Result<Arc<Monitor>> {
        if let Some(monitor) = INSTANCE.get() {
            return Ok(Arc::clone(monitor));
        }
        static INIT: Mutex<()> = Mutex::new(());
        let _guard = INIT.lock();
        if let Some(monitor) = INSTANCE.get() {
            return Ok(Arc::clone(monitor));
        }
        let monitor = Arc::new(Monitor::new()?);
        install_exit_handler(&monitor);
        let _ = INSTANCE.set(Arc::clone(&monitor));
        Ok(monitor)
    }

    fn new() -> Result<Monitor> {
        let (identity, topology) = discovery::discover()?;
        log::info!(
            "detected family {:#x} model {:#x} stepping {} ({:?}), {} sockets, {} online CPUs, \
             nominal {} MHz",
            identity.family,
            identity.model_id,
            identity.stepping,
            identity.model,
            topology.num_sockets(),
            topology.num_online_threads(),
            identity.nominal_frequency / 1_000_000
        );

        let mut msr_handles = FxHashMap::default();
        for os_id in topology.os_ids() {
            match SafeMsrHandle::new(os_id) {
                Ok(handle) => {
                    msr_handles.insert(os_id, Arc::new(handle));
                }
                Err(e) => {
                    log::warn!("MSR backend unavailable ({e}); core counters degrade to perf");
                    msr_handles.clear();
                    break;
                }
            }
        }

        let use_perf = msr_handles.is_empty()
            || std::env::var("PCM_USE_PERF").map(|v| v == "1").unwrap_or(false);

        // RAPL energy units from the reference core.
        let mut joules_per_unit = 0.0;
        if let Some(ref_cpu) = topology.socket_ref_cpu(0) {
            if let Some(msr) = msr_handles.get(&ref_cpu) {
                if let Ok(unit_word) = msr.read(msrs::MSR_RAPL_POWER_UNIT) {
                    let esu = (unit_word >> 8) & 0x1F;
                    if esu != 0 || unit_word != 0 {
                        joules_per_unit = 1.0 / f64::from(1u32 << esu);
                    }
                }
            }
        }
        let dram_joules_per_unit = match identity.model {
            Some(model) if model.has_fixed_dram_energy_unit() => 0.0000153,
            _ => joules_per_unit,
        };

        Ok(Monitor {
            identity,
            topology,
            msr_handles,
            instance_lock: InstanceLock::new()?,
            allow_multiple: AtomicBool::new(false),
            use_perf,
            joules_per_unit,
            dram_joules_per_unit,
            state: Mutex::new(EngineState::new()),
        })
    }

    pub fn get_system_topology(&self) -> SystemTopology {
        self.topology.clone()
    }

    pub fn identity(&self) -> &CpuIdentity {
        &self.identity
    }

    pub fn nominal_frequency(&self) -> u64 {
        self.identity.nominal_frequency
    }

    pub fn joules_per_energy_unit(&self) -> f64 {
        self.joules_per_unit
    }

    /// Call before `program` to allow several clients on the same host.
    pub fn allow_multiple_instances(&self) {
        self.allow_multiple.store(true, Ordering::SeqCst);
    }

    /// The active programming mode, if `program` succeeded.
    pub fn programmed_mode(&self) -> Option<ProgramMode> {
        let state = self.state.lock();
        state.programmed.then(|| state.mode.clone())
    }

    fn model(&self) -> Result<CpuModel> {
        self.identity.model.ok_or(Error::UnsupportedProcessor {
            family: self.identity.family,
            model: self.identity.model_id,
        })
    }

    fn event_family(&self) -> crate::counters::EventFamily {
        use crate::counters::EventFamily;
        match self.identity.model {
            Some(m) if m.is_atom() || m == CpuModel::Knl => EventFamily::ArchLlcOnly,
            Some(m) if m.use_skylake_events() => EventFamily::Skylake,
            _ => EventFamily::Legacy,
        }
    }

    /// Programs the engine for `mode`. At most one successful `program`
    /// per session; call `reset_pmu` to start over.
    pub fn program(&self, mode: ProgramMode) -> Result<()> {
        let mut state = self.state.lock();
        if state.programmed {
            return Err(Error::Invariant(
                "already programmed; call reset_pmu before programming again",
            ));
        }

        self.instance_lock
            .acquire(self.allow_multiple.load(Ordering::SeqCst))?;
        if let Err(e) = self.program_locked(&mut state, mode) {
            // Leave nothing half-programmed behind.
            self.release_locked(&mut state);
            return Err(e);
        }
        state.programmed = true;
        Ok(())
    }

    /// Programs the memory-controller channels for bandwidth metrics.
    /// Passing rank numbers switches to per-rank CAS events at the cost
    /// of per-channel observability.
    pub fn program_server_uncore_memory_metrics(
        &self,
        metrics: modes::MemoryMetrics,
        rank_a: Option<u32>,
        rank_b: Option<u32>,
    ) -> Result<()> {
        self.program(ProgramMode::UncoreMemory {
            metrics,
            rank_a,
            rank_b,
        })
    }

    pub fn program_server_uncore_power_metrics(
        &self,
        imc_profile: i32,
        pcu_profile: u32,
        freq_bands: [u32; 3],
    ) -> Result<()> {
        self.program(ProgramMode::UncorePower(modes::PowerProfile {
            pcu_profile,
            freq_bands,
            imc_profile,
        }))
    }

    pub fn program_server_uncore_latency_metrics(&self, pmm: bool) -> Result<()> {
        self.program(ProgramMode::UncoreLatency(modes::LatencyConfig { pmm }))
    }

    pub fn program_iio_counters(&self, events: Vec<modes::IioEvent>) -> Result<()> {
        self.program(ProgramMode::UncoreIio(modes::IioConfig { events }))
    }

    /// CHA/CBO programming with an optional opcode filter and TID
    /// filter; the PCIe traffic accounting runs on top of this.
    pub fn program_cbo(
        &self,
        events: Vec<crate::uncore::registry::EventSpec>,
        opcode: Option<u64>,
        tid_filter: Option<u32>,
    ) -> Result<()> {
        self.program(ProgramMode::UncorePcie(modes::PcieConfig {
            events,
            opcode,
            tid_filter,
        }))
    }

    fn program_locked(&self, state: &mut EngineState, mode: ProgramMode) -> Result<()> {
        self.disable_nmi_watchdog(state);
        self.check_core_pmu_free()?;

        // Core side.
        let core_events: Vec<CoreEvent> = match &mode {
            ProgramMode::Default
            | ProgramMode::UncoreMemory { .. }
            | ProgramMode::UncorePower(_)
            | ProgramMode::UncoreLatency(_)
            | ProgramMode::UncoreIio(_)
            | ProgramMode::UncoreCxl(_)
            | ProgramMode::UncorePcie(_) => {
                let model_events = match self.identity.model {
                    Some(model) => model.default_core_events(),
                    None => Vec::new(),
                };
                model_events
                    .into_iter()
                    .map(|select| CoreEvent {
                        select,
                        offcore_response0: None,
                        offcore_response1: None,
                    })
                    .collect()
            }
            ProgramMode::CustomCore(events) => events.to_vec(),
            ProgramMode::ExtCustomCore(set) => set.events.clone(),
            ProgramMode::RawPmu(_) => Vec::new(),
        };
        let budget = self.identity.num_programmable_counters as usize;
        if core_events.len() > budget {
            return Err(Error::Invariant("custom core event set exceeds counter budget"));
        }
        let fixed_ctrl = match &mode {
            ProgramMode::ExtCustomCore(set) => {
                set.fixed_ctr_ctrl.unwrap_or(FIXED_CTR_CTRL_ENABLE_OS_USR)
            }
            _ => FIXED_CTR_CTRL_ENABLE_OS_USR,
        };
        if self.use_perf {
            self.open_perf_groups(state)?;
        } else {
            self.program_core_counters(&core_events, fixed_ctrl)?;
        }
        state.num_events = core_events.len();

        if matches!(std::env::var("PCM_ENABLE_JKT_WORKAROUND").as_deref(), Ok("1")) {
            self.set_jkt_workaround(true);
        }

        // Uncore side.
        if let Some(model) = self.identity.model {
            if model.has_server_uncore() {
                self.build_uncores(state, model)?;
                for uncore in &state.uncores {
                    uncore.init_freeze_all()?;
                }
                for uncore in &mut state.uncores {
                    match &mode {
                        ProgramMode::Default | ProgramMode::CustomCore(_)
                        | ProgramMode::ExtCustomCore(_) => uncore.program_default()?,
                        ProgramMode::UncoreMemory {
                            metrics,
                            rank_a,
                            rank_b,
                        } => uncore.program_memory(*metrics, *rank_a, *rank_b)?,
                        ProgramMode::UncorePower(profile) => uncore.program_power(profile)?,
                        ProgramMode::UncoreLatency(config) => uncore.program_latency(config)?,
                        ProgramMode::UncoreIio(config) => uncore.program_iio(config)?,
                        ProgramMode::UncoreCxl(config) => uncore.program_cxl(&config.events)?,
                        ProgramMode::UncorePcie(config) => uncore.program_cha(
                            &config.events,
                            config.opcode,
                            config.tid_filter,
                        )?,
                        ProgramMode::RawPmu(raw) => {
                            raw.validate(|name| {
                                if name == "core" {
                                    Some(budget)
                                } else {
                                    uncore.counter_budget(name)
                                }
                            })?;
                            for (pmu, words) in &raw.programmable {
                                if pmu.as_str() == "core" {
                                    continue;
                                }
                                uncore.program_raw(pmu, words, raw.fixed.get(pmu).copied())?;
                            }
                        }
                    }
                }
            } else if requires_server_uncore(&mode) {
                return Err(Error::UnsupportedProcessor {
                    family: self.identity.family,
                    model: self.identity.model_id,
                });
            }
        } else if requires_server_uncore(&mode) {
            return self.model().map(|_| ());
        }

        // Raw core events are written directly; the per-thread bank
        // enforces the counter budget.
        if let ProgramMode::RawPmu(raw) = &mode {
            if let Some(words) = raw.programmable.get("core") {
                self.program_raw_core(words, raw.fixed.get("core").copied())?;
                state.num_events = words.len();
            }
        }

        self.init_rdt_monitoring(state);
        state.mode = mode;
        Ok(())
    }

    fn build_uncores(&self, state: &mut EngineState, model: CpuModel) -> Result<()> {
        if !state.uncores.is_empty() {
            return Ok(());
        }
        let Some(entry) = registry::registry_entry(model, self.identity.stepping) else {
            return Ok(());
        };
        let num_sockets = self.topology.num_sockets();
        let buses = discover_socket_buses(&entry, num_sockets);
        if buses.len() < num_sockets {
            log::warn!(
                "found uncore buses for {} of {num_sockets} sockets; \
                 uncore metrics will be partial",
                buses.len()
            );
        }
        for (socket, bus) in buses.iter().enumerate() {
            let Some(ref_cpu) = self.topology.socket_ref_cpu(socket as u32) else {
                continue;
            };
            let Some(msr) = self.msr_handles.get(&ref_cpu) else {
                continue;
            };
            let num_cha = self
                .topology
                .os_ids_of_socket(socket as u32)
                .len()
                .max(1);
            match ServerUncore::new(
                socket as u32,
                *bus,
                entry.clone(),
                Arc::clone(msr),
                num_cha,
            ) {
                Ok(uncore) => state.uncores.push(uncore),
                Err(e) => log::warn!("socket {socket} uncore construction failed: {e}"),
            }
        }
        Ok(())
    }

    /// A foreign agent owning the core counters shows up as an enabled
    /// event-select register before we programmed anything.
    fn check_core_pmu_free(&self) -> Result<()> {
        let Some(msr) = self.first_msr() else {
            return Ok(());
        };
        if self.core_pmu(msr).in_use()? {
            log::error!(
                "core PMU is in use by another agent; \
                 run reset_pmu to force-clear a stale configuration"
            );
            return Err(Error::Busy);
        }
        Ok(())
    }

    fn first_msr(&self) -> Option<&Arc<SafeMsrHandle>> {
        self.topology
            .os_ids()
            .first()
            .and_then(|id| self.msr_handles.get(id))
    }

    fn core_pmu(&self, msr: &Arc<SafeMsrHandle>) -> CorePmu {
        CorePmu::from_msr(msr, self.identity.num_programmable_counters)
    }

    fn program_core_counters(&self, events: &[CoreEvent], fixed_ctrl: u64) -> Result<()> {
        for os_id in self.topology.os_ids() {
            let Some(msr) = self.msr_handles.get(&os_id) else {
                continue;
            };
            self.core_pmu(msr).program(events, fixed_ctrl)?;
        }
        Ok(())
    }

    fn program_raw_core(&self, words: &[u64], fixed: Option<u64>) -> Result<()> {
        for os_id in self.topology.os_ids() {
            let Some(msr) = self.msr_handles.get(&os_id) else {
                continue;
            };
            self.core_pmu(msr)
                .program_raw(words, fixed.unwrap_or(FIXED_CTR_CTRL_ENABLE_OS_USR))?;
        }
        Ok(())
    }

    #[cfg(any(target_os = "android", target_os = "linux"))]
    fn open_perf_groups(&self, state: &mut EngineState) -> Result<()> {
        for os_id in self.topology.os_ids() {
            let mut group = PerfEventGroup::new(os_id);
            let instructions = group.add_counter(PERF_TYPE_HARDWARE, PERF_COUNT_HW_INSTRUCTIONS)?;
            let cycles = group.add_counter(PERF_TYPE_HARDWARE, PERF_COUNT_HW_CPU_CYCLES)?;
            let ref_cycles = group.add_counter(PERF_TYPE_HARDWARE, PERF_COUNT_HW_REF_CPU_CYCLES)?;
            group.reset()?;
            group.enable()?;
            let group = Arc::new(Mutex::new(group));
            state.perf_fixed.insert(
                os_id,
                [
                    Arc::new(PerfRegister::new(Arc::clone(&group), instructions))
                        as HwRegisterPtr,
                    Arc::new(PerfRegister::new(Arc::clone(&group), cycles)) as HwRegisterPtr,
                    Arc::new(PerfRegister::new(Arc::clone(&group), ref_cycles))
                        as HwRegisterPtr,
                ],
            );
        }
        Ok(())
    }

    #[cfg(not(any(target_os = "android", target_os = "linux")))]
    fn open_perf_groups(&self, _state: &mut EngineState) -> Result<()> {
        Err(Error::Unsupported("perf backend on this OS"))
    }

    /// The NMI watchdog occupies one fixed counter; park it for the
    /// session unless the user asked to keep it.
    fn disable_nmi_watchdog(&self, state: &mut EngineState) {
        #[cfg(any(target_os = "android", target_os = "linux"))]
        {
            if matches!(std::env::var("PCM_KEEP_NMI_WATCHDOG").as_deref(), Ok("1")) {
                return;
            }
            const PATH: &str = "/proc/sys/kernel/nmi_watchdog";
            match std::fs::read_to_string(PATH) {
                Ok(prev) if prev.trim() == "1" => {
                    if std::fs::write(PATH, "0").is_ok() {
                        log::debug!("disabled the NMI watchdog for this session");
                        state.nmi_watchdog_prev = Some(prev);
                    }
                }
                _ => {}
            }
        }
        #[cfg(not(any(target_os = "android", target_os = "linux")))]
        let _ = state;
    }

    fn restore_nmi_watchdog(&self, state: &mut EngineState) {
        #[cfg(any(target_os = "android", target_os = "linux"))]
        if let Some(prev) = state.nmi_watchdog_prev.take() {
            let _ = std::fs::write("/proc/sys/kernel/nmi_watchdog", prev);
        }
        #[cfg(not(any(target_os = "android", target_os = "linux")))]
        let _ = state;
    }

    fn set_jkt_workaround(&self, enable: bool) {
        for os_id in self.topology.os_ids() {
            if let Some(msr) = self.msr_handles.get(&os_id) {
                let result = msr.with_lock(|handle| {
                    let mut word = handle.read(MSR_JKT_WORKAROUND)?;
                    if enable {
                        word |= 1;
                    } else {
                        word &= !1;
                    }
                    handle.write(MSR_JKT_WORKAROUND, word)
                });
                if let Err(e) = result {
                    log::debug!("JKT workaround toggle failed on cpu {os_id}: {e}");
                }
            }
        }
    }

    /// Cache-occupancy and memory-bandwidth monitoring: resctrl when the
    /// kernel has it mounted, the QOS MSR interface otherwise. The MBM
    /// counters are 24 bits wide and go through width extenders.
    fn init_rdt_monitoring(&self, state: &mut EngineState) {
        if Resctrl::is_mounted(Resctrl::DEFAULT_ROOT) {
            let mut resctrl = Resctrl::new(Resctrl::DEFAULT_ROOT, &self.topology);
            match resctrl.init() {
                Ok(()) => {
                    state.resctrl = Some(resctrl);
                    return;
                }
                Err(e) => log::warn!("resctrl setup failed: {e}"),
            }
        }
        if self.use_perf {
            return;
        }
        for os_id in self.topology.os_ids() {
            let Some(msr) = self.msr_handles.get(&os_id) else {
                continue;
            };
            // One RMID per logical CPU; zero is reserved for the default
            // group.
            let rmid = u64::from(os_id) + 1;
            if msr.write(msrs::IA32_PQR_ASSOC, rmid).is_err() {
                return;
            }
            let mbl = QmCounterRegister::shared(msr, rmid, msrs::QM_EVENT_LOCAL_MEM_BW);
            let mbt = QmCounterRegister::shared(msr, rmid, msrs::QM_EVENT_TOTAL_MEM_BW);
            match (
                CounterWidthExtender::new(mbl, 24, DEFAULT_PERIOD_32BIT),
                CounterWidthExtender::new(mbt, 24, DEFAULT_PERIOD_32BIT),
            ) {
                (Ok(mbl), Ok(mbt)) => {
                    state.mbl.insert(os_id, mbl);
                    state.mbt.insert(os_id, mbt);
                }
                _ => return,
            }
        }
    }

    /// Reads one logical CPU's counters. MSR reads are positioned I/O
    /// against the per-CPU device and need no pinning.
    fn read_core_state(&self, os_id: u32, state: &EngineState) -> CoreCounterState {
        let mut s = CoreCounterState {
            nominal_frequency: self.identity.nominal_frequency,
            event_family: self.event_family(),
            num_events: state.num_events,
            ..Default::default()
        };

        #[cfg(any(target_os = "android", target_os = "linux"))]
        if let Some(regs) = state.perf_fixed.get(&os_id) {
            s.inst_retired = regs[0].read().unwrap_or(0);
            s.cpu_clk_unhalted = regs[1].read().unwrap_or(0);
            s.cpu_clk_unhalted_ref = regs[2].read().unwrap_or(0);
        }

        if let Some(msr) = self.msr_handles.get(&os_id) {
            if !self.use_perf {
                s.inst_retired = msr.read(msrs::INST_RETIRED_ANY_ADDR).unwrap_or(0);
                s.cpu_clk_unhalted = msr.read(msrs::CPU_CLK_UNHALTED_THREAD_ADDR).unwrap_or(0);
                s.cpu_clk_unhalted_ref = msr.read(msrs::CPU_CLK_UNHALTED_REF_ADDR).unwrap_or(0);
                for i in 0..state.num_events.min(crate::counters::MAX_CUSTOM_EVENTS) {
                    s.events[i] = msr.read(msrs::IA32_PMC0 + i as u32).unwrap_or(0);
                }
            }
            s.invariant_tsc = msr.read(msrs::IA32_TIME_STAMP_COUNTER).unwrap_or(0);
            if let Some(model) = self.identity.model {
                for (cstate, addr) in model.core_c_state_msrs().iter().enumerate() {
                    if let Some(addr) = addr {
                        s.c_state_residency[cstate] = msr.read(*addr).unwrap_or(0);
                    }
                }
            }
            if let Ok(therm) = msr.read(msrs::IA32_THERM_STATUS) {
                let readout = ((therm >> 16) & 0x7F) as i32;
                if therm & (1 << 31) != 0 {
                    s.thermal_headroom = readout;
                } else {
                    s.thermal_headroom = INVALID_THERMAL_HEADROOM;
                }
            }
            s.smi_count = msr.read(msrs::MSR_SMI_COUNT).unwrap_or(0);
        }

        #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
        if s.invariant_tsc == 0 {
            s.invariant_tsc = unsafe { x86::time::rdtsc() };
        }

        if let Some(resctrl) = &state.resctrl {
            s.l3_occupancy = resctrl.get_l3_occupancy(os_id);
            s.memory_bw_local = resctrl.get_mbl(os_id);
            s.memory_bw_total = resctrl.get_mbt(os_id);
        } else {
            if let Some(mbl) = state.mbl.get(&os_id) {
                s.memory_bw_local = mbl.read();
            }
            if let Some(mbt) = state.mbt.get(&os_id) {
                s.memory_bw_total = mbt.read();
            }
            if let Some(msr) = self.msr_handles.get(&os_id) {
                let occ = msr.with_lock(|handle| {
                    let rmid = u64::from(os_id) + 1;
                    handle.write(
                        msrs::IA32_QM_EVTSEL,
                        (rmid << 32) | msrs::QM_EVENT_L3_OCCUPANCY,
                    )?;
                    handle.read(msrs::IA32_QM_CTR)
                });
                if let Ok(value) = occ {
                    if value & (0b11 << msrs::QM_CTR_DATA_WIDTH) == 0 {
                        // Occupancy is reported in 64-byte units.
                        s.l3_occupancy = (value & ((1 << msrs::QM_CTR_DATA_WIDTH) - 1)) * 64;
                    }
                }
            }
        }
        s
    }

    fn read_socket_uncore(&self, socket: u32, state: &EngineState) -> UncoreCounterState {
        let mut uncore = UncoreCounterState {
            joules_per_energy_unit: self.joules_per_unit,
            dram_joules_per_energy_unit: self.dram_joules_per_unit,
            edc_scale: 1.0,
            threads_per_socket: self.topology.threads_per_socket() as u32,
            ..Default::default()
        };
        if let Some(ref_cpu) = self.topology.socket_ref_cpu(socket) {
            if let Some(msr) = self.msr_handles.get(&ref_cpu) {
                // RAPL counters are 32 bits wide.
                uncore.package_energy =
                    msr.read(msrs::MSR_PKG_ENERGY_STATUS).unwrap_or(0) & 0xFFFF_FFFF;
                uncore.dram_energy =
                    msr.read(msrs::MSR_DRAM_ENERGY_STATUS).unwrap_or(0) & 0xFFFF_FFFF;
                if let Some(model) = self.identity.model {
                    for (cstate, addr) in model.pkg_c_state_msrs().iter().enumerate() {
                        if let Some(addr) = addr {
                            uncore.c_state_residency[cstate] = msr.read(*addr).unwrap_or(0);
                        }
                    }
                }
            }
        }
        if let Some(server) = state.uncores.get(socket as usize) {
            server.read_into(&mut uncore);
        }
        uncore
    }

    /// Takes a full snapshot: per-thread core states in ascending OS CPU
    /// order, then per-socket uncore banks in socket order, then the
    /// system aggregate. The deterministic order keeps deltas between
    /// two snapshots coherent.
    pub fn get_all_counter_states(
        &self,
    ) -> Result<(SystemCounterState, Vec<SocketCounterState>, Vec<CoreCounterState>)> {
        let state = self.state.lock();

        let mut core_states = Vec::new();
        let mut socket_states: Vec<SocketCounterState> = (0..self.topology.num_sockets())
            .map(|socket| SocketCounterState {
                socket_id: socket as u32,
                ..Default::default()
            })
            .collect();

        for os_id in self.topology.os_ids() {
            let core_state = self.read_core_state(os_id, &state);
            if let Some(socket) = self.topology.socket_of(os_id) {
                if let Some(socket_state) = socket_states.get_mut(socket as usize) {
                    socket_state.core.accumulate(&core_state);
                }
            }
            core_states.push(core_state);
        }

        for socket_state in socket_states.iter_mut() {
            socket_state.uncore = self.read_socket_uncore(socket_state.socket_id, &state);
        }

        #[cfg(unix)]
        let num_configured = {
            let n = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_CONF) };
            if n < 1 {
                self.topology.num_online_threads()
            } else {
                n as usize
            }
        };
        #[cfg(not(unix))]
        let num_configured = self.topology.num_online_threads();
        let mut system = SystemCounterState {
            num_cores: self.topology.num_online_threads(),
            num_sockets: self.topology.num_sockets(),
            threads_per_core: self.topology.threads_per_core(),
            all_cores_online: self.topology.num_online_threads() == num_configured,
            ..Default::default()
        };
        for socket_state in &socket_states {
            system.accumulate_socket(socket_state);
        }
        for (socket, server) in state.uncores.iter().enumerate() {
            let (incoming, outgoing, l0p) = server.read_links();
            system.incoming_qpi_packets.push(incoming);
            system.outgoing_qpi_flits.push(outgoing);
            system.tx_l0_cycles.push(l0p);
            system.qpi_link_speed.push(server.qpi_speeds().to_vec());
            if socket == 0 {
                if let Some(model) = self.identity.model {
                    system.link_geometry = if model.has_upi() {
                        LinkGeometry {
                            bytes_per_flit: 172.0 / 8.0,
                            flits_per_transfer: 9,
                        }
                    } else {
                        LinkGeometry {
                            bytes_per_flit: 8.0,
                            flits_per_transfer: 8,
                        }
                    };
                }
            }
        }
        Ok((system, socket_states, core_states))
    }

    pub fn get_core_counter_state(&self, os_id: u32) -> Result<CoreCounterState> {
        if !self.topology.is_online(os_id) {
            return Err(Error::Invariant("CPU id is offline or out of range"));
        }
        let state = self.state.lock();
        Ok(self.read_core_state(os_id, &state))
    }

    pub fn get_socket_counter_state(&self, socket: u32) -> Result<SocketCounterState> {
        if socket as usize >= self.topology.num_sockets() {
            return Err(Error::Invariant("socket id out of range"));
        }
        let state = self.state.lock();
        let mut socket_state = SocketCounterState {
            socket_id: socket,
            ..Default::default()
        };
        for os_id in self.topology.os_ids_of_socket(socket) {
            let core_state = self.read_core_state(os_id, &state);
            socket_state.core.accumulate(&core_state);
        }
        socket_state.uncore = self.read_socket_uncore(socket, &state);
        Ok(socket_state)
    }

    /// The socket's uncore bank alone, in a fixed read order.
    pub fn get_server_uncore_counter_state(&self, socket: u32) -> Result<UncoreCounterState> {
        if socket as usize >= self.topology.num_sockets() {
            return Err(Error::Invariant("socket id out of range"));
        }
        let state = self.state.lock();
        Ok(self.read_socket_uncore(socket, &state))
    }

    /// Clears all core counter controls and restores the uncore boxes to
    /// their architectural defaults. Safe without a prior `program`.
    pub fn reset_pmu(&self) -> Result<()> {
        for os_id in self.topology.os_ids() {
            let Some(msr) = self.msr_handles.get(&os_id) else {
                continue;
            };
            self.core_pmu(msr).reset()?;
        }
        let mut state = self.state.lock();
        for uncore in &state.uncores {
            uncore.cleanup();
            let _ = uncore.unfreeze_all();
        }
        state.programmed = false;
        Ok(())
    }

    /// Idempotent inverse of `program`. Always decrements the exclusion
    /// semaphore; safe to call from the signal path: every handle it
    /// touches was created during `program`.
    pub fn cleanup(&self) {
        let mut state = self.state.lock();
        self.release_locked(&mut state);
    }

    fn release_locked(&self, state: &mut EngineState) {
        if state.programmed {
            for os_id in self.topology.os_ids() {
                if let Some(msr) = self.msr_handles.get(&os_id) {
                    self.core_pmu(msr).quiet_reset();
                }
            }
            if matches!(std::env::var("PCM_ENABLE_JKT_WORKAROUND").as_deref(), Ok("1")) {
                self.set_jkt_workaround(false);
            }
        }
        for uncore in &state.uncores {
            uncore.cleanup();
        }
        state.uncores.clear();
        if let Some(resctrl) = state.resctrl.take() {
            resctrl.cleanup();
        }
        state.mbl.clear();
        state.mbt.clear();
        #[cfg(any(target_os = "android", target_os = "linux"))]
        state.perf_fixed.clear();
        self.restore_nmi_watchdog(state);
        self.instance_lock.release();
        state.programmed = false;
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        self.cleanup();
    }
}

fn requires_server_uncore(mode: &ProgramMode) -> bool {
    matches!(
        mode,
        ProgramMode::UncoreMemory { .. }
            | ProgramMode::UncorePower(_)
            | ProgramMode::UncoreLatency(_)
            | ProgramMode::UncoreIio(_)
            | ProgramMode::UncoreCxl(_)
            | ProgramMode::UncorePcie(_)
    )
}

fn install_exit_handler(monitor: &Arc<Monitor>) {
    let weak: Weak<Monitor> = Arc::downgrade(monitor);
    let result = ctrlc::set_handler(move || {
        if let Some(monitor) = weak.upgrade() {
            monitor.cleanup();
        }
        // 128 + SIGINT, the conventional interrupted-exit status.
        std::process::exit(130);
    });
    if let Err(e) = result {
        log::warn!("could not install Ctrl+C cleanup handler: {e}");
    }
}

/// A QOS monitoring counter behind the IA32_QM_EVTSEL/IA32_QM_CTR pair.
/// The select-then-read sequence runs under the MSR handle lock so
/// concurrent QOS users on the same CPU cannot interleave.
struct QmCounterRegister {
    msr: Arc<SafeMsrHandle>,
    rmid: u64,
    event: u64,
}

impl QmCounterRegister {
    fn shared(msr: &Arc<SafeMsrHandle>, rmid: u64, event: u64) -> HwRegisterPtr {
        Arc::new(QmCounterRegister {
            msr: Arc::clone(msr),
            rmid,
            event,
        })
    }
}

impl HwRegister for QmCounterRegister {
    fn read(&self) -> Result<u64> {
        self.msr.with_lock(|handle| {
            handle.write(msrs::IA32_QM_EVTSEL, (self.rmid << 32) | self.event)?;
            let value = handle.read(msrs::IA32_QM_CTR)?;
            if value & (0b11 << msrs::QM_CTR_DATA_WIDTH) != 0 {
                // Error or Unavailable bit set.
                return Err(Error::HardwareAbsent("QOS monitoring event"));
            }
            Ok(value & ((1u64 << msrs::QM_CTR_DATA_WIDTH) - 1))
        })
    }

    fn write(&self, value: u64) -> Result<()> {
        if value == 0 {
            Ok(())
        } else {
            Err(Error::Invariant("QOS counters accept only zero writes"))
        }
    }
}
