//! Uniform access to hardware counter registers.
//!
//! Four transports exist: per-core MSRs, PCI configuration space, MMIO
//! ranges and (on Linux) kernel perf event descriptors. All of them, plus
//! the width extender, present the same `HwRegister` capability so the
//! programming engine can address counter banks without knowing how a
//! particular box is wired up.

pub mod extender;
pub mod mmio;
pub mod msr;
pub mod pci;
#[cfg(any(target_os = "android", target_os = "linux"))]
pub mod perf;

use std::sync::Arc;

use crate::error::{Error, Result};

pub trait HwRegister: Send + Sync {
    fn read(&self) -> Result<u64>;
    fn write(&self, value: u64) -> Result<()>;
}

pub type HwRegisterPtr = Arc<dyn HwRegister>;

/// A 64-bit MSR slot on a fixed CPU.
pub struct MsrRegister {
    msr: Arc<msr::SafeMsrHandle>,
    addr: u32,
}

impl MsrRegister {
    pub fn new(msr: Arc<msr::SafeMsrHandle>, addr: u32) -> MsrRegister {
        MsrRegister { msr, addr }
    }

    pub fn shared(msr: &Arc<msr::SafeMsrHandle>, addr: u32) -> HwRegisterPtr {
        Arc::new(MsrRegister::new(Arc::clone(msr), addr))
    }
}

impl HwRegister for MsrRegister {
    fn read(&self) -> Result<u64> {
        self.msr.read(self.addr)
    }

    fn write(&self, value: u64) -> Result<()> {
        self.msr.write(self.addr, value)
    }
}

/// A 32-bit slot in PCI configuration space.
pub struct Pci32Register {
    handle: Arc<pci::PciHandle>,
    offset: u64,
}

impl Pci32Register {
    pub fn shared(handle: &Arc<pci::PciHandle>, offset: u64) -> HwRegisterPtr {
        Arc::new(Pci32Register {
            handle: Arc::clone(handle),
            offset,
        })
    }
}

impl HwRegister for Pci32Register {
    fn read(&self) -> Result<u64> {
        self.handle.read32(self.offset).map(u64::from)
    }

    fn write(&self, value: u64) -> Result<()> {
        self.handle.write32(self.offset, value as u32)
    }
}

/// A 64-bit slot in PCI configuration space, composed of two 32-bit
/// operations, low half first.
pub struct Pci64Register {
    handle: Arc<pci::PciHandle>,
    offset: u64,
}

impl Pci64Register {
    pub fn shared(handle: &Arc<pci::PciHandle>, offset: u64) -> HwRegisterPtr {
        Arc::new(Pci64Register {
            handle: Arc::clone(handle),
            offset,
        })
    }
}

impl HwRegister for Pci64Register {
    fn read(&self) -> Result<u64> {
        self.handle.read64(self.offset)
    }

    fn write(&self, value: u64) -> Result<()> {
        self.handle.write32(self.offset, value as u32)?;
        self.handle.write32(self.offset + 4, (value >> 32) as u32)
    }
}

/// A 32-bit word inside a mapped MMIO range.
pub struct Mmio32Register {
    range: Arc<mmio::MmioRange>,
    offset: usize,
}

impl Mmio32Register {
    pub fn shared(range: &Arc<mmio::MmioRange>, offset: usize) -> HwRegisterPtr {
        Arc::new(Mmio32Register {
            range: Arc::clone(range),
            offset,
        })
    }
}

impl HwRegister for Mmio32Register {
    fn read(&self) -> Result<u64> {
        self.range.read32(self.offset).map(u64::from)
    }

    fn write(&self, value: u64) -> Result<()> {
        self.range.write32(self.offset, value as u32)
    }
}

/// A 64-bit word inside a mapped MMIO range.
pub struct Mmio64Register {
    range: Arc<mmio::MmioRange>,
    offset: usize,
}

impl Mmio64Register {
    pub fn shared(range: &Arc<mmio::MmioRange>, offset: usize) -> HwRegisterPtr {
        Arc::new(Mmio64Register {
            range: Arc::clone(range),
            offset,
        })
    }
}

impl HwRegister for Mmio64Register {
    fn read(&self) -> Result<u64> {
        self.range.read64(self.offset)
    }

    fn write(&self, value: u64) -> Result<()> {
        self.range.write64(self.offset, value)
    }
}

/// A monotonically growing 64-bit view over a narrow hardware counter.
/// Writing zero resets the extender; any other write is rejected.
pub struct WidenedRegister {
    extender: Arc<extender::CounterWidthExtender>,
}

impl WidenedRegister {
    pub fn shared(extender: Arc<extender::CounterWidthExtender>) -> HwRegisterPtr {
        Arc::new(WidenedRegister { extender })
    }
}

impl HwRegister for WidenedRegister {
    fn read(&self) -> Result<u64> {
        Ok(self.extender.read())
    }

    fn write(&self, value: u64) -> Result<()> {
        if value == 0 {
            self.extender.reset();
            Ok(())
        } else {
            Err(Error::Invariant(
                "widened registers accept only zero writes (reset)",
            ))
        }
    }
}
