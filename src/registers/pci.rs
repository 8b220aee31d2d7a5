//! PCI configuration space access.
//!
//! Registers are addressed by (group, bus, device, function) plus a byte
//! offset. The primary path is the per-device sysfs `config` file; the
//! procfs tree is the fallback on systems without sysfs. Probing for a
//! device never fails: a missing function reports "absent" instead of
//! erroring, because uncore units legitimately vary per SKU.

use std::fs::OpenOptions;
use std::path::Path;

use crate::error::{Error, Result};

pub const PCI_VENDOR_ID_INTEL: u32 = 0x8086;

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "android", target_os = "linux"))] {
        use std::fs::File;
        use std::os::unix::fs::FileExt;

        pub struct PciHandle {
            file: File,
            group: u32,
            bus: u32,
            device: u32,
            function: u32,
        }

        fn sysfs_path(group: u32, bus: u32, device: u32, function: u32) -> String {
            format!("/sys/bus/pci/devices/{group:04x}:{bus:02x}:{device:02x}.{function}/config")
        }

        fn procfs_path(bus: u32, device: u32, function: u32) -> String {
            format!("/proc/bus/pci/{bus:02x}/{device:02x}.{function}")
        }

        impl PciHandle {
            pub fn new(group: u32, bus: u32, device: u32, function: u32) -> Result<PciHandle> {
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .open(sysfs_path(group, bus, device, function))
                    .or_else(|_| {
                        OpenOptions::new()
                            .read(true)
                            .write(true)
                            .open(procfs_path(bus, device, function))
                    })
                    .map_err(|e| Error::from_backend("PCI config space", e))?;
                Ok(PciHandle {
                    file,
                    group,
                    bus,
                    device,
                    function,
                })
            }

            /// Non-throwing existence probe.
            pub fn exists(group: u32, bus: u32, device: u32, function: u32) -> bool {
                Path::new(&sysfs_path(group, bus, device, function)).exists()
                    || Path::new(&procfs_path(bus, device, function)).exists()
            }

            pub fn read32(&self, offset: u64) -> Result<u32> {
                let mut buf = [0u8; 4];
                self.file
                    .read_exact_at(&mut buf, offset)
                    .map_err(|e| Error::from_backend("PCI config read", e))?;
                Ok(u32::from_le_bytes(buf))
            }

            pub fn write32(&self, offset: u64, value: u32) -> Result<()> {
                self.file
                    .write_all_at(&value.to_le_bytes(), offset)
                    .map_err(|e| Error::from_backend("PCI config write", e))
            }

            /// 64-bit read composed of two 32-bit reads, low half first.
            pub fn read64(&self, offset: u64) -> Result<u64> {
                let lo = self.read32(offset)? as u64;
                let hi = self.read32(offset + 4)? as u64;
                Ok(lo | (hi << 32))
            }

            /// Whether the function decodes as an Intel device. An
            /// all-ones vendor id means nothing is listening there.
            pub fn is_intel_device(&self) -> bool {
                matches!(self.read32(0), Ok(w) if w & 0xffff == PCI_VENDOR_ID_INTEL)
            }

            pub fn address(&self) -> (u32, u32, u32, u32) {
                (self.group, self.bus, self.device, self.function)
            }
        }
    } else {
        pub struct PciHandle {
            group: u32,
            bus: u32,
            device: u32,
            function: u32,
        }

        impl PciHandle {
            pub fn new(_group: u32, _bus: u32, _device: u32, _function: u32) -> Result<PciHandle> {
                let _ = OpenOptions::new();
                let _ = Path::new("/");
                Err(Error::Unsupported("PCI config access on this OS"))
            }

            pub fn exists(_group: u32, _bus: u32, _device: u32, _function: u32) -> bool {
                false
            }

            pub fn read32(&self, _offset: u64) -> Result<u32> {
                Err(Error::Unsupported("PCI config access on this OS"))
            }

            pub fn write32(&self, _offset: u64, _value: u32) -> Result<()> {
                Err(Error::Unsupported("PCI config access on this OS"))
            }

            pub fn read64(&self, _offset: u64) -> Result<u64> {
                Err(Error::Unsupported("PCI config access on this OS"))
            }

            pub fn is_intel_device(&self) -> bool {
                false
            }

            pub fn address(&self) -> (u32, u32, u32, u32) {
                (self.group, self.bus, self.device, self.function)
            }
        }
    }
}
