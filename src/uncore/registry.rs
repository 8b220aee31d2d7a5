//! Per-microarchitecture description of the server uncore.
//!
//! A registry entry is a value-typed descriptor: where every PMON box of
//! a socket lives (MSR index, PCI device/function, or MMIO offset), how
//! wide its counters are, and which event encodings drive the canonical
//! metrics. The table is closed; an unknown model yields `None` and the
//! engine degrades to core counters.
//!
//! Register locations follow the Intel uncore performance monitoring
//! reference manuals per generation; the dispatch happens once here, at
//! construction time, never downstream.

use crate::model::{CpuModel, SkxVariant};
use crate::uncore::{UnitCtlLayout, CLASSIC_UNIT_CTL, SPR_UNIT_CTL};

/// PCI (device, function) of one uncore unit on the socket's uncore bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PciUnitLoc {
    pub device: u32,
    pub function: u32,
}

const fn loc(device: u32, function: u32) -> PciUnitLoc {
    PciUnitLoc { device, function }
}

/// Register offsets of a PCI-space PMON box.
#[derive(Debug, Clone, Copy)]
pub struct PciPmonLayout {
    pub box_ctl: u64,
    pub ctl0: u64,
    pub ctr0: u64,
    pub fixed_ctl: Option<u64>,
    pub fixed_ctr: Option<u64>,
}

/// The Xeon PCI PMON layout shared by iMC, HA and QPI boxes up to SKX.
pub const XPF_PCI_PMON: PciPmonLayout = PciPmonLayout {
    box_ctl: 0xF4,
    ctl0: 0xD8,
    ctr0: 0xA0,
    fixed_ctl: Some(0xF0),
    fixed_ctr: Some(0xD0),
};

pub const SKX_UPI_PCI_PMON: PciPmonLayout = PciPmonLayout {
    box_ctl: 0x378,
    ctl0: 0x350,
    ctr0: 0x318,
    fixed_ctl: None,
    fixed_ctr: None,
};

pub const SPR_UPI_PCI_PMON: PciPmonLayout = PciPmonLayout {
    box_ctl: 0x318,
    ctl0: 0x350,
    ctr0: 0x320,
    fixed_ctl: None,
    fixed_ctr: None,
};

pub const KNX_MC_PCI_PMON: PciPmonLayout = PciPmonLayout {
    box_ctl: 0xB30,
    ctl0: 0xB20,
    ctr0: 0xB00,
    fixed_ctl: Some(0xB44),
    fixed_ctr: Some(0xB3C),
};

pub const KNX_EDC_PCI_PMON: PciPmonLayout = PciPmonLayout {
    box_ctl: 0xA30,
    ctl0: 0xA20,
    ctr0: 0xA00,
    fixed_ctl: Some(0xA44),
    fixed_ctr: Some(0xA3C),
};

/// Placement of a family of MSR-space PMON boxes.
#[derive(Debug, Clone)]
pub enum MsrUnits {
    Stride { base: u32, step: u32, count: usize },
    Table(Vec<u32>),
}

impl MsrUnits {
    pub fn unit_base(&self, index: usize) -> Option<u32> {
        match self {
            MsrUnits::Stride { base, step, count } => {
                (index < *count).then(|| base + step * index as u32)
            }
            MsrUnits::Table(table) => table.get(index).copied(),
        }
    }

    pub fn count(&self) -> usize {
        match self {
            MsrUnits::Stride { count, .. } => *count,
            MsrUnits::Table(table) => table.len(),
        }
    }
}

/// Offsets of controls and counters relative to a box's unit control.
#[derive(Debug, Clone)]
pub struct MsrPmonLayout {
    pub units: MsrUnits,
    pub ctl_offset: u32,
    pub ctr_offset: u32,
    pub filter0_offset: Option<u32>,
    pub filter1_offset: Option<u32>,
}

/// An event selector as stored in the table: event, umask and the
/// extended umask used by ICX-and-later boxes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventSpec {
    pub event: u8,
    pub umask: u8,
    pub umask_ext: u32,
}

const fn ev(event: u8, umask: u8) -> EventSpec {
    EventSpec {
        event,
        umask,
        umask_ext: 0,
    }
}

const fn ev_ext(event: u8, umask: u8, umask_ext: u32) -> EventSpec {
    EventSpec {
        event,
        umask,
        umask_ext,
    }
}

/// iMC CAS selectors. The SPR generation splits reads and writes over
/// two positions (per pseudo-channel) that are summed at read time.
#[derive(Debug, Clone, Copy)]
pub struct CasEvents {
    pub read: EventSpec,
    pub write: EventSpec,
    pub read2: Option<EventSpec>,
    pub write2: Option<EventSpec>,
    /// Partial-line CAS transfers (underfill), the PartialWrites metric.
    pub partial: EventSpec,
    pub pmm_read: Option<EventSpec>,
    pub pmm_write: Option<EventSpec>,
}

/// iMC pending-queue selectors for the latency mode.
#[derive(Debug, Clone, Copy)]
pub struct PendingQueueEvents {
    pub rpq_occupancy: EventSpec,
    pub rpq_inserts: EventSpec,
    pub wpq_occupancy: EventSpec,
    pub wpq_inserts: EventSpec,
    pub pmm_rpq_occupancy: Option<EventSpec>,
    pub pmm_rpq_inserts: Option<EventSpec>,
}

/// Memory-mode tag events on the mesh-to-memory boxes.
#[derive(Debug, Clone, Copy)]
pub struct MemoryModeEvents {
    pub nm_hit: EventSpec,
    pub nm_miss_clean: EventSpec,
    pub nm_miss_dirty: EventSpec,
}

#[derive(Debug, Clone)]
pub enum ImcDesc {
    /// Channels hang off the uncore bus in PCI config space;
    /// `controllers[c]` lists the channel locations of controller `c`.
    Pci {
        controllers: Vec<Vec<PciUnitLoc>>,
        layout: PciPmonLayout,
    },
    /// Channel PMON banks live in an MMIO window whose base is read from
    /// two PCI scratch registers on the UBox device.
    Mmio {
        bar_unit: PciUnitLoc,
        membar_lo_offset: u64,
        membar_lo_shift: u32,
        mem_offsets: Vec<u64>,
        mem_shift: u32,
        channel_base: u64,
        channel_step: u64,
        channel_size: u64,
        box_ctl_offset: u64,
        ctl0_offset: u64,
        ctr0_offset: u64,
        fixed_ctl_offset: u64,
        fixed_ctr_offset: u64,
        channels_per_controller: Vec<usize>,
    },
}

impl ImcDesc {
    pub fn num_channels(&self) -> usize {
        match self {
            ImcDesc::Pci { controllers, .. } => controllers.iter().map(Vec::len).sum(),
            ImcDesc::Mmio {
                channels_per_controller,
                ..
            } => channels_per_controller.iter().sum(),
        }
    }
}

/// How the CHA/CBO opcode filter is expressed per generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChaFilterKind {
    /// Opcode in filter0 bits 23+.
    Jkt,
    /// Opcode in filter1 bits 20+.
    IvtHsx,
    /// Opcode pair in filter1 bits 9+/19+, with local/remote/near-memory
    /// selection bits.
    Skx,
    /// No filter registers; the opcode folds into the extended umask.
    UmaskExt,
}

#[derive(Debug, Clone)]
pub struct ChaDesc {
    pub layout: MsrPmonLayout,
    pub filter_kind: ChaFilterKind,
    /// TOR occupancy/inserts restricted to IA LLC-miss reads; clockticks
    /// is programmed alongside for DRAM-clock normalization.
    pub tor_occupancy: EventSpec,
    pub tor_inserts: EventSpec,
    pub clockticks: EventSpec,
    /// Value for the opcode filter register in the latency setup, when
    /// `filter_kind` uses a filter register.
    pub llc_miss_filter: u64,
}

#[derive(Debug, Clone)]
pub struct XpiDesc {
    pub locs: Vec<PciUnitLoc>,
    pub layout: PciPmonLayout,
    pub is_upi: bool,
    /// Incoming data flits.
    pub incoming: EventSpec,
    /// Outgoing data+non-data flits.
    pub outgoing: EventSpec,
    /// Transmit-side low-power cycles.
    pub tx_l0p_cycles: EventSpec,
    /// Data flits per 64-byte transfer.
    pub flits_per_transfer: u64,
    pub bytes_per_flit: f64,
    /// Offset of the link rate status register on the misc function.
    pub rate_status_offset: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct PcuDesc {
    pub box_ctl: u32,
    pub ctl0: u32,
    pub ctr0: u32,
    pub filter: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct UboxDesc {
    pub box_ctl: Option<u32>,
    pub ctl: [u32; 2],
    pub ctr: [u32; 2],
    pub fixed_ctl: u32,
    pub fixed_ctr: u32,
}

#[derive(Debug, Clone)]
pub struct IioDesc {
    pub layout: MsrPmonLayout,
    /// Bit position of the channel mask in the control word.
    pub ch_mask_shift: u32,
    pub ch_mask_width: u32,
    pub fc_mask_shift: u32,
}

#[derive(Debug, Clone)]
pub struct CxlDesc {
    pub bar_unit: PciUnitLoc,
    pub membar_lo_offset: u64,
    pub membar_lo_shift: u32,
    pub port_step: u64,
    pub pmon_size: u64,
    pub box_ctl_offset: u64,
    pub ctl0_offset: u64,
    pub ctr0_offset: u64,
}

#[derive(Debug, Clone)]
pub struct UncoreRegistryEntry {
    pub unit_ctl_layout: UnitCtlLayout,
    pub counter_width: u32,
    pub num_box_counters: usize,
    /// PCI device probed across buses to find each socket's uncore bus.
    pub bus_probe: PciUnitLoc,
    pub imc: ImcDesc,
    pub cas: CasEvents,
    pub pending_queue: PendingQueueEvents,
    pub edc: Option<(Vec<PciUnitLoc>, PciPmonLayout)>,
    pub edc_scale: f64,
    pub ha: Vec<PciUnitLoc>,
    pub ha_requests: EventSpec,
    pub ha_local_requests: EventSpec,
    pub m2m: Vec<PciUnitLoc>,
    pub memory_mode: Option<MemoryModeEvents>,
    pub xpi: Option<XpiDesc>,
    pub m3upi: Vec<PciUnitLoc>,
    pub cha: Option<ChaDesc>,
    pub pcu: Option<PcuDesc>,
    pub ubox: Option<UboxDesc>,
    pub iio: Option<IioDesc>,
    pub irp: Option<IioDesc>,
    pub cxl: Option<CxlDesc>,
    /// SNB-EP erratum: counting certain LLC events needs an extra chicken
    /// bit with a documented latency penalty; opt-in only.
    pub has_jkt_workaround: bool,
}

const UPI_BYTES_PER_FLIT: f64 = 172.0 / 8.0;
const QPI_BYTES_PER_FLIT: f64 = 8.0;

fn classic_cha(units: MsrUnits, filter_kind: ChaFilterKind) -> ChaDesc {
    let (filter0, filter1, ctl, ctr) = match filter_kind {
        // JKT/IVT boxes: ctl at +0xC, ctr at +0x12, filters at
        // +0x10/+0x16 relative to the box control.
        ChaFilterKind::Jkt => (Some(0x10), None, 0xC, 0x12),
        ChaFilterKind::IvtHsx if matches!(units, MsrUnits::Stride { step: 0x20, .. }) => {
            (Some(0x10), Some(0x16), 0xC, 0x12)
        }
        // HSX and later: ctl at +1, ctr at +8, filters at +5/+6.
        _ => (Some(5), Some(6), 1, 8),
    };
    let llc_miss_filter = match filter_kind {
        // Demand data read opcode in the generation's filter position.
        ChaFilterKind::Jkt => 0x182u64 << 23,
        ChaFilterKind::IvtHsx => 0x182u64 << 20,
        // FILTER1: remote|local|near-memory|not-near-memory plus DRd in
        // the first opcode slot.
        ChaFilterKind::Skx => 0x3 | (0x3 << 4) | (0x202 << 9),
        ChaFilterKind::UmaskExt => 0,
    };
    let (tor_occupancy, tor_inserts) = match filter_kind {
        ChaFilterKind::Skx => (ev(0x36, 0x21), ev(0x35, 0x21)),
        ChaFilterKind::UmaskExt => (
            ev_ext(0x36, 0x21, 0xC817FE),
            ev_ext(0x35, 0x21, 0xC817FE),
        ),
        _ => (ev(0x36, 0x03), ev(0x35, 0x03)),
    };
    ChaDesc {
        layout: MsrPmonLayout {
            units,
            ctl_offset: ctl,
            ctr_offset: ctr,
            filter0_offset: filter0,
            filter1_offset: filter1,
        },
        filter_kind,
        tor_occupancy,
        tor_inserts,
        clockticks: ev(0x00, 0x00),
        llc_miss_filter,
    }
}

fn classic_pcu(base: u32) -> PcuDesc {
    // HSX-style PCU block: box ctl, then controls, filter, counters.
    PcuDesc {
        box_ctl: base,
        ctl0: base + 1,
        ctr0: base + 7,
        filter: Some(base + 5),
    }
}

fn classic_cas() -> CasEvents {
    CasEvents {
        read: ev(0x04, 0x03),
        write: ev(0x04, 0x0C),
        read2: None,
        write2: None,
        partial: ev(0x04, 0x02),
        pmm_read: None,
        pmm_write: None,
    }
}

fn classic_pending_queue() -> PendingQueueEvents {
    PendingQueueEvents {
        rpq_occupancy: ev(0x80, 0x00),
        rpq_inserts: ev(0x10, 0x00),
        wpq_occupancy: ev(0x81, 0x00),
        wpq_inserts: ev(0x20, 0x00),
        pmm_rpq_occupancy: None,
        pmm_rpq_inserts: None,
    }
}

fn server_mmio_imc(channels_per_controller: Vec<usize>) -> ImcDesc {
    let mem_offsets = (0..channels_per_controller.len() as u64)
        .map(|c| 0xD8 + 4 * c)
        .collect();
    ImcDesc::Mmio {
        bar_unit: loc(0, 1),
        membar_lo_offset: 0xD0,
        membar_lo_shift: 23,
        mem_offsets,
        mem_shift: 12,
        channel_base: 0x22800,
        channel_step: 0x4000,
        channel_size: 0x1000,
        box_ctl_offset: 0x00,
        ctl0_offset: 0x40,
        ctr0_offset: 0x08,
        fixed_ctl_offset: 0x54,
        fixed_ctr_offset: 0x38,
        channels_per_controller,
    }
}

/// Builds the descriptor for a detected model. `stepping` feeds the
/// SKX variant split (CLX gains PMM events, CPX gains three more UPI
/// links).
pub fn registry_entry(model: CpuModel, stepping: u32) -> Option<UncoreRegistryEntry> {
    use CpuModel::*;

    let mut entry = UncoreRegistryEntry {
        unit_ctl_layout: CLASSIC_UNIT_CTL,
        counter_width: 48,
        num_box_counters: 4,
        bus_probe: loc(0, 1),
        imc: ImcDesc::Pci {
            controllers: Vec::new(),
            layout: XPF_PCI_PMON,
        },
        cas: classic_cas(),
        pending_queue: classic_pending_queue(),
        edc: None,
        edc_scale: 1.0,
        ha: Vec::new(),
        ha_requests: ev(0x01, 0x03),
        ha_local_requests: ev(0x01, 0x01),
        m2m: Vec::new(),
        memory_mode: None,
        xpi: None,
        m3upi: Vec::new(),
        cha: None,
        pcu: None,
        ubox: None,
        iio: None,
        irp: None,
        cxl: None,
        has_jkt_workaround: false,
    };

    match model {
        Jaketown | Ivytown => {
            entry.bus_probe = loc(16, 4);
            entry.imc = ImcDesc::Pci {
                controllers: vec![
                    vec![loc(16, 4), loc(16, 5), loc(16, 0), loc(16, 1)],
                    vec![loc(30, 4), loc(30, 5), loc(30, 0), loc(30, 1)],
                ],
                layout: XPF_PCI_PMON,
            };
            entry.ha = vec![loc(14, 1)];
            entry.xpi = Some(XpiDesc {
                locs: vec![loc(8, 2), loc(9, 2), loc(24, 2)],
                layout: XPF_PCI_PMON,
                is_upi: false,
                incoming: ev(0x02, 0x08),
                outgoing: ev(0x00, 0x06),
                tx_l0p_cycles: ev(0x0D, 0x00),
                flits_per_transfer: 8,
                bytes_per_flit: QPI_BYTES_PER_FLIT,
                rate_status_offset: Some(0xD4),
            });
            let filter_kind = if model == Jaketown {
                ChaFilterKind::Jkt
            } else {
                ChaFilterKind::IvtHsx
            };
            entry.cha = Some(classic_cha(
                MsrUnits::Stride {
                    base: 0x0D04,
                    step: 0x20,
                    count: 15,
                },
                filter_kind,
            ));
            entry.pcu = Some(PcuDesc {
                box_ctl: 0x0C24,
                ctl0: 0x0C30,
                ctr0: 0x0C36,
                filter: Some(0x0C34),
            });
            entry.ubox = Some(UboxDesc {
                box_ctl: None,
                ctl: [0x0C10, 0x0C11],
                ctr: [0x0C16, 0x0C17],
                fixed_ctl: 0x0C08,
                fixed_ctr: 0x0C09,
            });
            entry.has_jkt_workaround = model == Jaketown;
        }
        HaswellX | Bdx | BdxDe => {
            entry.bus_probe = loc(20, 0);
            let controllers = if model == BdxDe {
                vec![vec![loc(20, 0), loc(20, 1)]]
            } else {
                vec![
                    vec![loc(20, 0), loc(20, 1), loc(21, 0), loc(21, 1)],
                    vec![loc(23, 0), loc(23, 1), loc(24, 0), loc(24, 1)],
                ]
            };
            entry.imc = ImcDesc::Pci {
                controllers,
                layout: XPF_PCI_PMON,
            };
            entry.ha = vec![loc(18, 1), loc(18, 5)];
            if model != BdxDe {
                entry.xpi = Some(XpiDesc {
                    locs: vec![loc(8, 2), loc(9, 2), loc(10, 2)],
                    layout: XPF_PCI_PMON,
                    is_upi: false,
                    incoming: ev(0x02, 0x08),
                    outgoing: ev(0x00, 0x06),
                    tx_l0p_cycles: ev(0x0D, 0x00),
                    flits_per_transfer: 8,
                    bytes_per_flit: QPI_BYTES_PER_FLIT,
                    rate_status_offset: Some(0xD4),
                });
            }
            entry.cha = Some(classic_cha(
                MsrUnits::Stride {
                    base: 0x0E00,
                    step: 0x10,
                    count: 24,
                },
                ChaFilterKind::IvtHsx,
            ));
            entry.pcu = Some(classic_pcu(0x0710));
            entry.ubox = Some(UboxDesc {
                box_ctl: None,
                ctl: [0x0705, 0x0706],
                ctr: [0x0709, 0x070A],
                fixed_ctl: 0x0703,
                fixed_ctr: 0x0704,
            });
        }
        Knl => {
            entry.bus_probe = loc(8, 2);
            entry.imc = ImcDesc::Pci {
                controllers: vec![
                    vec![loc(8, 2), loc(8, 3), loc(8, 4)],
                    vec![loc(9, 2), loc(9, 3), loc(9, 4)],
                ],
                layout: KNX_MC_PCI_PMON,
            };
            entry.cas = CasEvents {
                read: ev(0x03, 0x01),
                write: ev(0x03, 0x02),
                read2: None,
                write2: None,
                partial: ev(0x03, 0x04),
                pmm_read: None,
                pmm_write: None,
            };
            // Eight EDC (MCDRAM) channels behind devices 24..31.
            entry.edc = Some((
                (24u32..32u32).map(|d| loc(d, 2)).collect(),
                KNX_EDC_PCI_PMON,
            ));
            // MCDRAM CAS transfers are 32 bytes.
            entry.edc_scale = 0.5;
            entry.cha = Some(classic_cha(
                MsrUnits::Stride {
                    base: 0x0E00,
                    step: 0x0C,
                    count: 38,
                },
                ChaFilterKind::IvtHsx,
            ));
            entry.ubox = Some(UboxDesc {
                box_ctl: None,
                ctl: [0x0705, 0x0706],
                ctr: [0x0709, 0x070A],
                fixed_ctl: 0x0703,
                fixed_ctr: 0x0704,
            });
        }
        Skx => {
            let variant = model.skx_variant(stepping).unwrap_or(SkxVariant::Skx);
            entry.bus_probe = loc(10, 2);
            entry.imc = ImcDesc::Pci {
                controllers: vec![
                    vec![loc(10, 2), loc(10, 6), loc(11, 2)],
                    vec![loc(12, 2), loc(12, 6), loc(13, 2)],
                ],
                layout: XPF_PCI_PMON,
            };
            if variant != SkxVariant::Skx {
                // Optane DC support arrived with Cascade Lake.
                entry.cas.pmm_read = Some(ev(0xE3, 0x00));
                entry.cas.pmm_write = Some(ev(0xE7, 0x00));
                entry.pending_queue.pmm_rpq_occupancy = Some(ev(0xE0, 0x01));
                entry.pending_queue.pmm_rpq_inserts = Some(ev(0xE3, 0x00));
                entry.memory_mode = Some(MemoryModeEvents {
                    nm_hit: ev(0x2C, 0x03),
                    nm_miss_clean: ev(0x2D, 0x01),
                    nm_miss_dirty: ev(0x2D, 0x02),
                });
            }
            entry.m2m = vec![loc(8, 0), loc(9, 0)];
            let mut upi_locs = vec![loc(14, 0), loc(15, 0), loc(16, 0)];
            let mut m3upi = vec![loc(0x12, 1), loc(0x12, 2), loc(0x12, 5)];
            if variant == SkxVariant::CooperLake {
                upi_locs.extend([loc(14, 4), loc(15, 4), loc(16, 4)]);
                m3upi = vec![
                    loc(0x12, 1),
                    loc(0x12, 2),
                    loc(0x13, 1),
                    loc(0x13, 2),
                    loc(0x14, 1),
                    loc(0x14, 2),
                ];
            }
            entry.xpi = Some(XpiDesc {
                locs: upi_locs,
                layout: SKX_UPI_PCI_PMON,
                is_upi: true,
                incoming: ev(0x03, 0x0F),
                outgoing: ev(0x02, 0x0F),
                tx_l0p_cycles: ev(0x27, 0x00),
                flits_per_transfer: 9,
                bytes_per_flit: UPI_BYTES_PER_FLIT,
                rate_status_offset: Some(0xD4),
            });
            entry.m3upi = m3upi;
            entry.cha = Some(classic_cha(
                MsrUnits::Stride {
                    base: 0x0E00,
                    step: 0x10,
                    count: 28,
                },
                ChaFilterKind::Skx,
            ));
            entry.pcu = Some(classic_pcu(0x0710));
            entry.ubox = Some(UboxDesc {
                box_ctl: None,
                ctl: [0x0705, 0x0706],
                ctr: [0x0709, 0x070A],
                fixed_ctl: 0x0703,
                fixed_ctr: 0x0704,
            });
            entry.iio = Some(IioDesc {
                layout: MsrPmonLayout {
                    units: MsrUnits::Stride {
                        base: 0x0A40,
                        step: 0x20,
                        count: 6,
                    },
                    ctl_offset: 8,
                    ctr_offset: 1,
                    filter0_offset: None,
                    filter1_offset: None,
                },
                ch_mask_shift: 36,
                ch_mask_width: 8,
                fc_mask_shift: 44,
            });
            entry.irp = Some(IioDesc {
                layout: MsrPmonLayout {
                    units: MsrUnits::Table(vec![0x0A58, 0x0A78, 0x0A98, 0x0AB8, 0x0AD8, 0x0AF8]),
                    ctl_offset: 3,
                    ctr_offset: 1,
                    filter0_offset: None,
                    filter1_offset: None,
                },
                ch_mask_shift: 36,
                ch_mask_width: 8,
                fc_mask_shift: 44,
            });
        }
        Icx | IcxD => {
            entry.imc = server_mmio_imc(vec![2, 2, 2, 2]);
            entry.cas = CasEvents {
                read: ev(0x04, 0x0F),
                write: ev(0x04, 0x30),
                read2: None,
                write2: None,
                partial: ev(0x04, 0x0C),
                pmm_read: Some(ev(0xE3, 0x00)),
                pmm_write: Some(ev(0xE7, 0x00)),
            };
            entry.pending_queue.pmm_rpq_occupancy = Some(ev(0xE0, 0x01));
            entry.pending_queue.pmm_rpq_inserts = Some(ev(0xE3, 0x00));
            entry.m2m = vec![loc(12, 0), loc(13, 0), loc(14, 0), loc(15, 0)];
            entry.memory_mode = Some(MemoryModeEvents {
                nm_hit: ev(0x2C, 0x03),
                nm_miss_clean: ev(0x2D, 0x01),
                nm_miss_dirty: ev(0x2D, 0x02),
            });
            entry.xpi = Some(XpiDesc {
                locs: vec![loc(2, 1), loc(3, 1), loc(4, 1)],
                layout: SKX_UPI_PCI_PMON,
                is_upi: true,
                incoming: ev(0x03, 0x0F),
                outgoing: ev(0x02, 0x0F),
                tx_l0p_cycles: ev(0x27, 0x00),
                flits_per_transfer: 9,
                bytes_per_flit: UPI_BYTES_PER_FLIT,
                rate_status_offset: Some(0xD4),
            });
            entry.m3upi = vec![loc(5, 1), loc(6, 1), loc(7, 1)];
            entry.cha = Some(classic_cha(
                MsrUnits::Table(vec![
                    0x0E00, 0x0E0E, 0x0E1C, 0x0E2A, 0x0E38, 0x0E46, 0x0E54, 0x0E62, 0x0E70,
                    0x0E7E, 0x0E8C, 0x0E9A, 0x0EA8, 0x0EB6, 0x0EC4, 0x0ED2, 0x0EE0, 0x0EEE,
                    0x0F0A, 0x0F18, 0x0F26, 0x0F34, 0x0F42, 0x0F50, 0x0F5E, 0x0F6C, 0x0F7A,
                    0x0F88, 0x0F96, 0x0FA4, 0x0FB2, 0x0FC0, 0x0FCE, 0x0FDC, 0x0B60, 0x0B6E,
                    0x0B7C, 0x0B8A, 0x0B98, 0x0BA6, 0x0BB4, 0x0BC2,
                ]),
                ChaFilterKind::UmaskExt,
            ));
            entry.pcu = Some(classic_pcu(0x0710));
            entry.ubox = Some(UboxDesc {
                box_ctl: None,
                ctl: [0x0705, 0x0706],
                ctr: [0x0709, 0x070A],
                fixed_ctl: 0x0703,
                fixed_ctr: 0x0704,
            });
            entry.iio = Some(IioDesc {
                layout: MsrPmonLayout {
                    units: MsrUnits::Table(vec![0x0A50, 0x0A70, 0x0A90, 0x0AE0, 0x0B00, 0x0B20]),
                    ctl_offset: 8,
                    ctr_offset: 1,
                    filter0_offset: None,
                    filter1_offset: None,
                },
                ch_mask_shift: 36,
                ch_mask_width: 12,
                fc_mask_shift: 48,
            });
            entry.irp = Some(IioDesc {
                layout: MsrPmonLayout {
                    units: MsrUnits::Table(vec![0x0A4A, 0x0A6A, 0x0A8A, 0x0ADA, 0x0AFA, 0x0B1A]),
                    ctl_offset: 3,
                    ctr_offset: 1,
                    filter0_offset: None,
                    filter1_offset: None,
                },
                ch_mask_shift: 36,
                ch_mask_width: 12,
                fc_mask_shift: 48,
            });
        }
        Snowridge => {
            entry.imc = server_mmio_imc(vec![2]);
            entry.cas = CasEvents {
                read: ev(0x04, 0x0F),
                write: ev(0x04, 0x30),
                read2: None,
                write2: None,
                partial: ev(0x04, 0x0C),
                pmm_read: None,
                pmm_write: None,
            };
            entry.m2m = vec![loc(12, 0), loc(13, 0), loc(14, 0), loc(15, 0)];
            entry.cha = Some(classic_cha(
                MsrUnits::Table(vec![0x1C00, 0x1C10, 0x1C20, 0x1C30, 0x1C40, 0x1C50]),
                ChaFilterKind::UmaskExt,
            ));
            entry.pcu = Some(classic_pcu(0x0710));
            entry.ubox = Some(UboxDesc {
                box_ctl: None,
                ctl: [0x0705, 0x0706],
                ctr: [0x0709, 0x070A],
                fixed_ctl: 0x0703,
                fixed_ctr: 0x0704,
            });
            entry.iio = Some(IioDesc {
                layout: MsrPmonLayout {
                    units: MsrUnits::Stride {
                        base: 0x1E00,
                        step: 0x10,
                        count: 5,
                    },
                    ctl_offset: 8,
                    ctr_offset: 1,
                    filter0_offset: None,
                    filter1_offset: None,
                },
                ch_mask_shift: 36,
                ch_mask_width: 12,
                fc_mask_shift: 48,
            });
            entry.irp = Some(IioDesc {
                layout: MsrPmonLayout {
                    units: MsrUnits::Table(vec![0x1EA0, 0x1EB0, 0x1EC0, 0x1ED0, 0x1EE0]),
                    ctl_offset: 8,
                    ctr_offset: 1,
                    filter0_offset: None,
                    filter1_offset: None,
                },
                ch_mask_shift: 36,
                ch_mask_width: 12,
                fc_mask_shift: 48,
            });
        }
        Spr | Emr | Gnr | GnrD | Srf | Grr => {
            entry.unit_ctl_layout = SPR_UNIT_CTL;
            let bhs = matches!(model, Gnr | GnrD | Srf | Grr);
            entry.imc = match model {
                Spr | Emr => server_mmio_imc(vec![2, 2, 2, 2]),
                Gnr | GnrD => server_mmio_imc(vec![3, 3, 3, 3]),
                Srf => server_mmio_imc(vec![2, 2]),
                _ => server_mmio_imc(vec![2]),
            };
            // Per-pseudo-channel CAS counting: the engine sums the
            // READ/READ2 and WRITE/WRITE2 positions.
            entry.cas = CasEvents {
                read: ev(0x05, 0xCF),
                write: ev(0x05, 0xF0),
                read2: Some(ev(0x06, 0xCF)),
                write2: Some(ev(0x06, 0xF0)),
                partial: ev(0x05, 0x30),
                pmm_read: if model == Spr { Some(ev(0xE3, 0x00)) } else { None },
                pmm_write: if model == Spr { Some(ev(0xE7, 0x00)) } else { None },
            };
            entry.m2m = vec![loc(12, 0), loc(13, 0), loc(14, 0), loc(15, 0)];
            if model == Spr {
                entry.memory_mode = Some(MemoryModeEvents {
                    nm_hit: ev(0x2C, 0x03),
                    nm_miss_clean: ev(0x2D, 0x01),
                    nm_miss_dirty: ev(0x2D, 0x02),
                });
            }
            if !matches!(model, Srf | Grr) {
                let locs = if bhs {
                    (16..22).map(|d| loc(d, 1)).collect()
                } else {
                    vec![loc(1, 1), loc(2, 1), loc(3, 1), loc(4, 1)]
                };
                entry.xpi = Some(XpiDesc {
                    locs,
                    layout: SPR_UPI_PCI_PMON,
                    is_upi: true,
                    incoming: ev(0x03, 0x0F),
                    outgoing: ev(0x02, 0x0F),
                    tx_l0p_cycles: ev(0x27, 0x00),
                    flits_per_transfer: 9,
                    bytes_per_flit: UPI_BYTES_PER_FLIT,
                    rate_status_offset: Some(0xD4),
                });
                entry.m3upi = vec![loc(5, 1), loc(6, 1), loc(7, 1), loc(8, 1)];
            }
            entry.cha = Some(ChaDesc {
                layout: MsrPmonLayout {
                    units: MsrUnits::Stride {
                        base: 0x2000,
                        step: 0x10,
                        count: 60,
                    },
                    ctl_offset: 2,
                    ctr_offset: 8,
                    filter0_offset: Some(0xE),
                    filter1_offset: None,
                },
                filter_kind: ChaFilterKind::UmaskExt,
                tor_occupancy: ev_ext(0x36, 0x21, 0xC817FE),
                tor_inserts: ev_ext(0x35, 0x21, 0xC817FE),
                clockticks: ev(0x00, 0x00),
                llc_miss_filter: 0,
            });
            entry.pcu = Some(PcuDesc {
                box_ctl: 0x2FC0,
                ctl0: 0x2FC2,
                ctr0: 0x2FC8,
                filter: None,
            });
            entry.ubox = if bhs && model == Grr {
                Some(UboxDesc {
                    box_ctl: Some(0x3F50),
                    ctl: [0x3F52, 0x3F53],
                    ctr: [0x3F58, 0x3F59],
                    fixed_ctl: 0x3F5E,
                    fixed_ctr: 0x3F5F,
                })
            } else if bhs {
                Some(UboxDesc {
                    box_ctl: Some(0x3FF0),
                    ctl: [0x3FF2, 0x3FF3],
                    ctr: [0x3FF8, 0x3FF9],
                    fixed_ctl: 0x3FFE,
                    fixed_ctr: 0x3FFD,
                })
            } else {
                Some(UboxDesc {
                    box_ctl: Some(0x2FD0),
                    ctl: [0x2FD2, 0x2FD3],
                    ctr: [0x2FD8, 0x2FD9],
                    fixed_ctl: 0x2FDE,
                    fixed_ctr: 0x2FDF,
                })
            };
            let (iio_base, iio_count) = if model == Grr {
                (0x2900, 3)
            } else if bhs {
                (0x2900, 16)
            } else {
                (0x3000, 12)
            };
            entry.iio = Some(IioDesc {
                layout: MsrPmonLayout {
                    units: MsrUnits::Stride {
                        base: iio_base,
                        step: 0x10,
                        count: iio_count,
                    },
                    ctl_offset: 2,
                    ctr_offset: 8,
                    filter0_offset: None,
                    filter1_offset: None,
                },
                ch_mask_shift: 36,
                ch_mask_width: 12,
                fc_mask_shift: 48,
            });
            let irp_units = if model == Grr {
                MsrUnits::Table(vec![0x2A00, 0x2A10, 0x2A20])
            } else if bhs {
                MsrUnits::Stride {
                    base: 0x2A00,
                    step: 0x10,
                    count: 16,
                }
            } else {
                MsrUnits::Stride {
                    base: 0x3400,
                    step: 0x10,
                    count: 12,
                }
            };
            entry.irp = Some(IioDesc {
                layout: MsrPmonLayout {
                    units: irp_units,
                    ctl_offset: 2,
                    ctr_offset: 8,
                    filter0_offset: None,
                    filter1_offset: None,
                },
                ch_mask_shift: 36,
                ch_mask_width: 12,
                fc_mask_shift: 48,
            });
            if matches!(model, Spr | Emr | Gnr | GnrD) {
                entry.cxl = Some(CxlDesc {
                    bar_unit: loc(0, 1),
                    membar_lo_offset: 0xD0,
                    membar_lo_shift: 23,
                    port_step: 0x1000,
                    pmon_size: 0x1000,
                    box_ctl_offset: 0x00,
                    ctl0_offset: 0x40,
                    ctr0_offset: 0x08,
                })
            }
        }
        _ => return None,
    }

    Some(entry)
}

/// Default QPI/UPI link count, overridden at runtime when the link PMUs
/// enumerate differently.
pub fn default_qpi_links(model: CpuModel, stepping: u32) -> usize {
    if model == CpuModel::Skx && model.skx_variant(stepping) == Some(SkxVariant::CooperLake) {
        return 6;
    }
    model.qpi_links_per_socket()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_models_have_no_entry() {
        assert!(registry_entry(CpuModel::Skl, 0).is_none());
        assert!(registry_entry(CpuModel::SandyBridge, 0).is_none());
    }

    #[test]
    fn skx_channel_layout_flattens_across_controllers() {
        let entry = registry_entry(CpuModel::Skx, 4).expect("SKX entry");
        assert_eq!(entry.imc.num_channels(), 6);
        match &entry.imc {
            ImcDesc::Pci { controllers, .. } => {
                assert_eq!(controllers.len(), 2);
                assert_eq!(controllers[0][0], loc(10, 2));
                assert_eq!(controllers[1][2], loc(13, 2));
            }
            _ => panic!("SKX iMC is PCI-based"),
        }
        // Plain SKX has no PMM events; Cascade Lake does.
        assert!(entry.cas.pmm_read.is_none());
        let clx = registry_entry(CpuModel::Skx, 6).expect("CLX entry");
        assert!(clx.cas.pmm_read.is_some());
        assert!(clx.memory_mode.is_some());
    }

    #[test]
    fn cooper_lake_gains_upi_links() {
        let skx = registry_entry(CpuModel::Skx, 4).expect("SKX");
        let cpx = registry_entry(CpuModel::Skx, 11).expect("CPX");
        assert_eq!(skx.xpi.as_ref().map(|x| x.locs.len()), Some(3));
        assert_eq!(cpx.xpi.as_ref().map(|x| x.locs.len()), Some(6));
        assert_eq!(default_qpi_links(CpuModel::Skx, 11), 6);
        assert_eq!(default_qpi_links(CpuModel::Skx, 4), 3);
    }

    #[test]
    fn spr_generation_splits_cas_and_moves_freeze_bit() {
        let spr = registry_entry(CpuModel::Spr, 0).expect("SPR");
        assert_eq!(spr.unit_ctl_layout, SPR_UNIT_CTL);
        assert!(spr.cas.read2.is_some());
        assert!(spr.cas.write2.is_some());
        assert!(matches!(spr.imc, ImcDesc::Mmio { .. }));
        assert!(spr.cxl.is_some());
    }

    #[test]
    fn icx_iio_uses_wide_channel_mask() {
        let icx = registry_entry(CpuModel::Icx, 0).expect("ICX");
        let iio = icx.iio.expect("ICX has IIO PMUs");
        assert_eq!(iio.ch_mask_width, 12);
        assert_eq!(iio.fc_mask_shift, 48);
        let skx = registry_entry(CpuModel::Skx, 4).expect("SKX");
        assert_eq!(skx.iio.expect("SKX IIO").ch_mask_width, 8);
    }

    #[test]
    fn msr_units_enumerate_in_order() {
        let stride = MsrUnits::Stride {
            base: 0x0E00,
            step: 0x10,
            count: 3,
        };
        assert_eq!(stride.unit_base(0), Some(0x0E00));
        assert_eq!(stride.unit_base(2), Some(0x0E20));
        assert_eq!(stride.unit_base(3), None);
        let table = MsrUnits::Table(vec![0x1C00, 0x1C10]);
        assert_eq!(table.unit_base(1), Some(0x1C10));
        assert_eq!(table.count(), 2);
    }

    #[test]
    fn jkt_workaround_is_jaketown_only() {
        assert!(registry_entry(CpuModel::Jaketown, 0)
            .expect("JKT")
            .has_jkt_workaround);
        assert!(!registry_entry(CpuModel::Ivytown, 0)
            .expect("IVT")
            .has_jkt_workaround);
    }
}
