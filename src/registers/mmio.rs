//! Memory-mapped I/O ranges over `/dev/mem`.
//!
//! A range maps a page-aligned window around the requested physical base
//! and serves volatile 32- and 64-bit accesses at offsets within it. The
//! mapping is released when the range drops.

use std::fs::OpenOptions;
use std::ptr;
use std::sync::Arc;

use memmap2::{MmapOptions, MmapRaw};

use crate::error::{Error, Result};

pub struct MmioRange {
    map: MmapRaw,
    /// Offset of the requested base within the page-aligned mapping.
    delta: usize,
    size: usize,
    writable: bool,
}

fn page_size() -> u64 {
    // _SC_PAGESIZE is positive on every supported platform.
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as u64 }
}

impl MmioRange {
    pub fn new(base: u64, size: usize, writable: bool) -> Result<MmioRange> {
        let file = OpenOptions::new()
            .read(true)
            .write(writable)
            .open("/dev/mem")
            .map_err(|e| Error::from_backend("/dev/mem", e))?;
        let page = page_size();
        let aligned = base & !(page - 1);
        let delta = (base - aligned) as usize;
        let mut options = MmapOptions::new();
        options.offset(aligned).len(size + delta);
        let map = if writable {
            options.map_raw(&file)
        } else {
            options.map_raw_read_only(&file)
        }
        .map_err(|e| Error::from_backend("MMIO mapping", e))?;
        Ok(MmioRange {
            map,
            delta,
            size,
            writable,
        })
    }

    pub fn shared(base: u64, size: usize, writable: bool) -> Result<Arc<MmioRange>> {
        Ok(Arc::new(MmioRange::new(base, size, writable)?))
    }

    fn check(&self, offset: usize, width: usize) -> Result<()> {
        if offset + width > self.size {
            return Err(Error::Invariant("MMIO access out of mapped range"));
        }
        Ok(())
    }

    pub fn read32(&self, offset: usize) -> Result<u32> {
        self.check(offset, 4)?;
        let p = unsafe { self.map.as_ptr().add(self.delta + offset) } as *const u32;
        Ok(unsafe { ptr::read_volatile(p) })
    }

    pub fn read64(&self, offset: usize) -> Result<u64> {
        self.check(offset, 8)?;
        let p = unsafe { self.map.as_ptr().add(self.delta + offset) } as *const u64;
        Ok(unsafe { ptr::read_volatile(p) })
    }

    pub fn write32(&self, offset: usize, value: u32) -> Result<()> {
        if !self.writable {
            return Err(Error::Invariant("write to read-only MMIO range"));
        }
        self.check(offset, 4)?;
        let p = unsafe { self.map.as_mut_ptr().add(self.delta + offset) } as *mut u32;
        unsafe { ptr::write_volatile(p, value) };
        Ok(())
    }

    pub fn write64(&self, offset: usize, value: u64) -> Result<()> {
        if !self.writable {
            return Err(Error::Invariant("write to read-only MMIO range"));
        }
        self.check(offset, 8)?;
        let p = unsafe { self.map.as_mut_ptr().add(self.delta + offset) } as *mut u64;
        unsafe { ptr::write_volatile(p, value) };
        Ok(())
    }
}
