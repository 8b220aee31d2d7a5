#![allow(unused)]

//! Architectural and model-specific MSR indices used by the engine.
//!
//! Uncore PMON register locations are model-dependent and live in the
//! uncore registry; this module only carries indices that are stable
//! across the supported microarchitectures.

// Fixed-function core counters (read through IA32_FIXED_CTRx aliases).
pub const INST_RETIRED_ANY_ADDR: u32 = 0x309;
pub const CPU_CLK_UNHALTED_THREAD_ADDR: u32 = 0x30A;
pub const CPU_CLK_UNHALTED_REF_ADDR: u32 = 0x30B;

// Core PMU control.
pub const IA32_CR_PERF_GLOBAL_CTRL: u32 = 0x38F;
pub const IA32_CR_PERF_GLOBAL_STATUS: u32 = 0x38E;
pub const IA32_CR_PERF_GLOBAL_OVF_CTRL: u32 = 0x390;
pub const IA32_CR_FIXED_CTR_CTRL: u32 = 0x38D;
pub const IA32_PERFEVTSEL0_ADDR: u32 = 0x186;
pub const IA32_PMC0: u32 = 0xC1;

pub const IA32_TIME_STAMP_COUNTER: u32 = 0x10;

// Offcore-response event configuration.
pub const MSR_OFFCORE_RSP0: u32 = 0x1A6;
pub const MSR_OFFCORE_RSP1: u32 = 0x1A7;

pub const MSR_SMI_COUNT: u32 = 0x34;

// Thermal.
pub const IA32_THERM_STATUS: u32 = 0x19C;
pub const IA32_PACKAGE_THERM_STATUS: u32 = 0x1B1;
pub const MSR_TEMPERATURE_TARGET: u32 = 0x1A2;

// RAPL energy.
pub const MSR_RAPL_POWER_UNIT: u32 = 0x606;
pub const MSR_PKG_ENERGY_STATUS: u32 = 0x611;
pub const MSR_DRAM_ENERGY_STATUS: u32 = 0x619;

// Core C-state residency counters.
pub const MSR_CORE_C3_RESIDENCY: u32 = 0x3FC;
pub const MSR_CORE_C6_RESIDENCY: u32 = 0x3FD;
pub const MSR_CORE_C7_RESIDENCY: u32 = 0x3FE;

// Package C-state residency counters.
pub const MSR_PKG_C2_RESIDENCY: u32 = 0x60D;
pub const MSR_PKG_C3_RESIDENCY: u32 = 0x3F8;
pub const MSR_PKG_C6_RESIDENCY: u32 = 0x3F9;
pub const MSR_PKG_C7_RESIDENCY: u32 = 0x3FA;
pub const MSR_PKG_C8_RESIDENCY: u32 = 0x630;
pub const MSR_PKG_C9_RESIDENCY: u32 = 0x631;
pub const MSR_PKG_C10_RESIDENCY: u32 = 0x632;

// RDT monitoring (QOS) interface, used when resctrl is not mounted.
pub const IA32_QM_EVTSEL: u32 = 0xC8D;
pub const IA32_QM_CTR: u32 = 0xC8E;
pub const IA32_PQR_ASSOC: u32 = 0xC8F;

// IA32_QM_EVTSEL event ids.
pub const QM_EVENT_L3_OCCUPANCY: u64 = 1;
pub const QM_EVENT_TOTAL_MEM_BW: u64 = 2;
pub const QM_EVENT_LOCAL_MEM_BW: u64 = 3;

/// Width of the IA32_QM_CTR data field; bits above it are status.
pub const QM_CTR_DATA_WIDTH: u32 = 62;

/// Number of programmable core counters the engine will use at most.
pub const MAX_CORE_GEN_COUNTERS: usize = 8;

/// Highest C-state number tracked by the counter states.
pub const MAX_C_STATE: usize = 10;
