//! Per-CPU model-specific register access.
//!
//! On Linux the handle owns a descriptor for `/dev/cpu/N/msr` (Android
//! ships the same driver as `/dev/msrN`); on FreeBSD and DragonFly it
//! talks to `/dev/cpuctlN` through ioctls. Setting `PCM_NO_MSR=1` opens
//! every handle in a disabled state where reads yield zero and writes are
//! dropped, which lets the perf backend carry the core counters instead.

use std::sync::OnceLock;

use parking_lot::Mutex;

use crate::affinity::ScopedAffinity;
use crate::error::{Error, Result};

const IO_RETRIES: u32 = 3;

fn no_msr_mode() -> bool {
    static NO_MSR: OnceLock<bool> = OnceLock::new();
    *NO_MSR.get_or_init(|| {
        let disabled = std::env::var("PCM_NO_MSR").map(|v| v == "1").unwrap_or(false);
        if disabled {
            log::warn!("PCM_NO_MSR=1: MSR backend disabled, reads return zero");
        }
        disabled
    })
}

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "android", target_os = "linux"))] {
        use std::fs::{File, OpenOptions};
        use std::os::unix::fs::FileExt;

        pub struct MsrHandle {
            cpu: u32,
            fd: Option<File>,
        }

        /// The kernel msr module rejects writes by default on lockdown
        /// kernels; flipping the module parameter once per process is
        /// enough.
        fn enable_msr_writes() {
            static ONCE: std::sync::Once = std::sync::Once::new();
            ONCE.call_once(|| {
                const PARAM: &str = "/sys/module/msr/parameters/allow_writes";
                if std::fs::read_to_string(PARAM).is_ok() {
                    if let Err(e) = std::fs::write(PARAM, "on") {
                        log::debug!("could not enable {PARAM}: {e}");
                    }
                }
            });
        }

        impl MsrHandle {
            pub fn new(cpu: u32) -> Result<MsrHandle> {
                if no_msr_mode() {
                    return Ok(MsrHandle { cpu, fd: None });
                }
                enable_msr_writes();
                let primary = format!("/dev/cpu/{cpu}/msr");
                let fd = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .open(&primary)
                    .or_else(|_| {
                        OpenOptions::new()
                            .read(true)
                            .write(true)
                            .open(format!("/dev/msr{cpu}"))
                    })
                    .map_err(|e| {
                        log::error!(
                            "can't open MSR handle for core {cpu} ({e}); \
                             try no-MSR mode by setting PCM_NO_MSR=1"
                        );
                        Error::from_backend("/dev/cpu/N/msr", e)
                    })?;
                Ok(MsrHandle { cpu, fd: Some(fd) })
            }

            pub fn cpu(&self) -> u32 {
                self.cpu
            }

            pub fn read(&self, index: u32) -> Result<u64> {
                let fd = match &self.fd {
                    Some(fd) => fd,
                    None => return Ok(0),
                };
                let mut buf = [0u8; 8];
                let mut last = None;
                for _ in 0..IO_RETRIES {
                    match fd.read_at(&mut buf, index as u64) {
                        Ok(8) => return Ok(u64::from_ne_bytes(buf)),
                        Ok(_) => continue, // short read
                        Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {
                            last = Some(e);
                        }
                        Err(e) => return Err(Error::from_backend("MSR read", e)),
                    }
                }
                Err(Error::TransientIo(last.unwrap_or_else(|| {
                    std::io::Error::from(std::io::ErrorKind::UnexpectedEof)
                })))
            }

            pub fn write(&self, index: u32, value: u64) -> Result<()> {
                let fd = match &self.fd {
                    Some(fd) => fd,
                    None => return Ok(()),
                };
                // The write must take effect on the owning CPU.
                let _pin = ScopedAffinity::pin_to(self.cpu as usize)?;
                let buf = value.to_ne_bytes();
                let mut last = None;
                for _ in 0..IO_RETRIES {
                    match fd.write_at(&buf, index as u64) {
                        Ok(8) => return Ok(()),
                        Ok(_) => continue,
                        Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {
                            last = Some(e);
                        }
                        Err(e) => return Err(Error::from_backend("MSR write", e)),
                    }
                }
                Err(Error::TransientIo(last.unwrap_or_else(|| {
                    std::io::Error::from(std::io::ErrorKind::WriteZero)
                })))
            }
        }
    } else if #[cfg(any(target_os = "freebsd", target_os = "dragonfly"))] {
        use std::fs::{File, OpenOptions};
        use std::os::fd::AsRawFd;

        #[repr(C)]
        struct CpuctlMsrArgs {
            msr: libc::c_int,
            data: u64,
        }

        // _IOWR('c', 1/2, sizeof(cpuctl_msr_args_t))
        const CPUCTL_RDMSR: libc::c_ulong = 0xC010_6301;
        const CPUCTL_WRMSR: libc::c_ulong = 0xC010_6302;

        pub struct MsrHandle {
            cpu: u32,
            fd: Option<File>,
        }

        impl MsrHandle {
            pub fn new(cpu: u32) -> Result<MsrHandle> {
                if no_msr_mode() {
                    return Ok(MsrHandle { cpu, fd: None });
                }
                let fd = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .open(format!("/dev/cpuctl{cpu}"))
                    .map_err(|e| Error::from_backend("/dev/cpuctlN", e))?;
                Ok(MsrHandle { cpu, fd: Some(fd) })
            }

            pub fn cpu(&self) -> u32 {
                self.cpu
            }

            pub fn read(&self, index: u32) -> Result<u64> {
                let fd = match &self.fd {
                    Some(fd) => fd,
                    None => return Ok(0),
                };
                let mut args = CpuctlMsrArgs { msr: index as libc::c_int, data: 0 };
                let rc = unsafe { libc::ioctl(fd.as_raw_fd(), CPUCTL_RDMSR, &mut args) };
                if rc != 0 {
                    return Err(Error::from_backend(
                        "CPUCTL_RDMSR",
                        std::io::Error::last_os_error(),
                    ));
                }
                Ok(args.data)
            }

            pub fn write(&self, index: u32, value: u64) -> Result<()> {
                let fd = match &self.fd {
                    Some(fd) => fd,
                    None => return Ok(()),
                };
                let _pin = ScopedAffinity::pin_to(self.cpu as usize)?;
                let mut args = CpuctlMsrArgs { msr: index as libc::c_int, data: value };
                let rc = unsafe { libc::ioctl(fd.as_raw_fd(), CPUCTL_WRMSR, &mut args) };
                if rc != 0 {
                    return Err(Error::from_backend(
                        "CPUCTL_WRMSR",
                        std::io::Error::last_os_error(),
                    ));
                }
                Ok(())
            }
        }
    } else {
        // The macOS kext and Windows driver surfaces are out of scope.
        pub struct MsrHandle {
            cpu: u32,
        }

        impl MsrHandle {
            pub fn new(_cpu: u32) -> Result<MsrHandle> {
                Err(Error::Unsupported("MSR access on this OS"))
            }

            pub fn cpu(&self) -> u32 {
                self.cpu
            }

            pub fn read(&self, _index: u32) -> Result<u64> {
                Err(Error::Unsupported("MSR access on this OS"))
            }

            pub fn write(&self, _index: u32, _value: u64) -> Result<()> {
                Err(Error::Unsupported("MSR access on this OS"))
            }
        }
    }
}

/// Shared-ownership MSR handle. The mutex makes multi-register sequences
/// (select-then-read protocols like IA32_QM_EVTSEL/IA32_QM_CTR) atomic
/// with respect to other users of the same handle.
pub struct SafeMsrHandle {
    inner: MsrHandle,
    lock: Mutex<()>,
}

impl SafeMsrHandle {
    pub fn new(cpu: u32) -> Result<SafeMsrHandle> {
        Ok(SafeMsrHandle {
            inner: MsrHandle::new(cpu)?,
            lock: Mutex::new(()),
        })
    }

    pub fn cpu(&self) -> u32 {
        self.inner.cpu()
    }

    pub fn read(&self, index: u32) -> Result<u64> {
        let _guard = self.lock.lock();
        self.inner.read(index)
    }

    pub fn write(&self, index: u32, value: u64) -> Result<()> {
        let _guard = self.lock.lock();
        self.inner.write(index, value)
    }

    /// Runs a multi-register sequence under the handle lock.
    pub fn with_lock<T>(&self, f: impl FnOnce(&MsrHandle) -> Result<T>) -> Result<T> {
        let _guard = self.lock.lock();
        f(&self.inner)
    }
}
