//! Counting-mode perf events (Linux).
//!
//! This backend exists so the architectural core counters keep working
//! when the MSR device is unavailable (`PCM_NO_MSR=1`) or undesirable
//! (`PCM_USE_PERF=1`). One event group is opened per CPU; all members are
//! read atomically with the group-read protocol.

use std::io;
use std::mem;
use std::os::unix::io::RawFd;
use std::sync::Arc;

use libc::{c_int, c_ulong, pid_t, syscall, SYS_perf_event_open};
use parking_lot::Mutex;

use crate::error::{Error, Result};

pub const PERF_TYPE_HARDWARE: u32 = 0;

pub const PERF_COUNT_HW_CPU_CYCLES: u64 = 0;
pub const PERF_COUNT_HW_INSTRUCTIONS: u64 = 1;
pub const PERF_COUNT_HW_REF_CPU_CYCLES: u64 = 9;

pub const PERF_FORMAT_GROUP: u64 = 1 << 3;

pub const PERF_FLAG_FD_CLOEXEC: c_ulong = 1 << 3;

pub const PERF_ATTR_FLAG_DISABLED: u64 = 1 << 0;

const PERF_EVENT_IOC_ENABLE: c_ulong = 0x2400;
const PERF_EVENT_IOC_DISABLE: c_ulong = 0x2401;
const PERF_EVENT_IOC_RESET: c_ulong = 0x2403;
const PERF_IOC_FLAG_GROUP: c_int = 1;

// The kernel reads the attribute block through the syscall pointer; no
// field is read back on this side.
#[allow(dead_code)]
#[repr(C)]
#[derive(Clone, Copy, Default)]
struct PerfEventAttr {
    kind: u32,
    size: u32,
    config: u64,
    sample_period_or_freq: u64,
    sample_type: u64,
    read_format: u64,
    flags: u64,
    wakeup_events_or_watermark: u32,
    bp_type: u32,
    config1: u64,
    config2: u64,
    branch_sample_type: u64,
    sample_regs_user: u64,
    sample_stack_user: u32,
    clockid: i32,
    sample_regs_intr: u64,
    aux_watermark: u32,
    sample_max_stack: u16,
    reserved_2: u16,
}

fn perf_event_open(
    attr: &PerfEventAttr,
    pid: pid_t,
    cpu: c_int,
    group_fd: c_int,
    flags: c_ulong,
) -> io::Result<RawFd> {
    let fd = unsafe {
        syscall(
            SYS_perf_event_open,
            attr as *const PerfEventAttr,
            pid,
            cpu,
            group_fd,
            flags,
        )
    };
    if fd < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(fd as RawFd)
    }
}

/// A group of counting events pinned to one CPU, read together.
pub struct PerfEventGroup {
    cpu: u32,
    fds: Vec<RawFd>,
}

impl PerfEventGroup {
    pub fn new(cpu: u32) -> PerfEventGroup {
        PerfEventGroup {
            cpu,
            fds: Vec::new(),
        }
    }

    /// Adds a counter for (type, config) and returns its index within the
    /// group read.
    pub fn add_counter(&mut self, kind: u32, config: u64) -> Result<usize> {
        let mut attr = PerfEventAttr {
            kind,
            size: mem::size_of::<PerfEventAttr>() as u32,
            config,
            read_format: PERF_FORMAT_GROUP,
            ..Default::default()
        };
        let leader = self.fds.first().copied().unwrap_or(-1);
        if leader == -1 {
            attr.flags |= PERF_ATTR_FLAG_DISABLED;
        }
        let fd = perf_event_open(&attr, -1, self.cpu as c_int, leader, PERF_FLAG_FD_CLOEXEC)
            .map_err(|e| Error::from_backend("perf_event_open", e))?;
        self.fds.push(fd);
        Ok(self.fds.len() - 1)
    }

    pub fn len(&self) -> usize {
        self.fds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fds.is_empty()
    }

    fn leader_ioctl(&self, request: c_ulong) -> Result<()> {
        let leader = self
            .fds
            .first()
            .copied()
            .ok_or(Error::Invariant("empty perf event group"))?;
        let rc = unsafe { libc::ioctl(leader, request, PERF_IOC_FLAG_GROUP) };
        if rc < 0 {
            return Err(Error::from_backend(
                "perf ioctl",
                io::Error::last_os_error(),
            ));
        }
        Ok(())
    }

    pub fn enable(&self) -> Result<()> {
        self.leader_ioctl(PERF_EVENT_IOC_ENABLE)
    }

    pub fn disable(&self) -> Result<()> {
        self.leader_ioctl(PERF_EVENT_IOC_DISABLE)
    }

    pub fn reset(&self) -> Result<()> {
        self.leader_ioctl(PERF_EVENT_IOC_RESET)
    }

    /// Reads all group members at once. The kernel layout with
    /// PERF_FORMAT_GROUP is `{ nr, values[nr] }`.
    pub fn read_all(&self) -> Result<Vec<u64>> {
        let leader = self
            .fds
            .first()
            .copied()
            .ok_or(Error::Invariant("empty perf event group"))?;
        let mut buf = vec![0u64; 1 + self.fds.len()];
        let bytes = (buf.len() * mem::size_of::<u64>()) as usize;
        let rc = unsafe { libc::read(leader, buf.as_mut_ptr() as *mut libc::c_void, bytes) };
        if rc < 0 {
            return Err(Error::from_backend(
                "perf group read",
                io::Error::last_os_error(),
            ));
        }
        let nr = buf[0] as usize;
        if nr != self.fds.len() {
            return Err(Error::Invariant("perf group read returned wrong count"));
        }
        buf.remove(0);
        Ok(buf)
    }
}

impl Drop for PerfEventGroup {
    fn drop(&mut self) {
        for fd in self.fds.drain(..) {
            unsafe {
                libc::close(fd);
            }
        }
    }
}

/// One slot of a shared perf event group, exposed as a hardware register.
pub struct PerfRegister {
    group: Arc<Mutex<PerfEventGroup>>,
    index: usize,
}

impl PerfRegister {
    pub fn new(group: Arc<Mutex<PerfEventGroup>>, index: usize) -> PerfRegister {
        PerfRegister { group, index }
    }
}

impl super::HwRegister for PerfRegister {
    fn read(&self) -> Result<u64> {
        let group = self.group.lock();
        let values = group.read_all()?;
        values
            .get(self.index)
            .copied()
            .ok_or(Error::Invariant("perf register index out of range"))
    }

    fn write(&self, value: u64) -> Result<()> {
        if value == 0 {
            self.group.lock().reset()
        } else {
            Err(Error::Invariant("perf counters accept only zero writes"))
        }
    }
}
