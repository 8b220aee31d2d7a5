//! Host-wide accounting of PMU clients.
//!
//! Only one process may program the PMU at a time unless every client
//! opts into shared ownership. The count lives in a POSIX named semaphore
//! so it survives the process and can be inspected by other clients. On
//! targets where `sem_getvalue` is not usable (macOS returns ENOSYS) a
//! lock file stands in.
//!
//! `release` is written to be async-signal-safe: it performs no
//! allocation and only touches handles created in `acquire`.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{Error, Result};

pub struct InstanceLock {
    held: AtomicBool,
    imp: Imp,
}

impl InstanceLock {
    pub fn new() -> Result<InstanceLock> {
        Ok(InstanceLock {
            held: AtomicBool::new(false),
            imp: Imp::new()?,
        })
    }

    /// Registers this process as a PMU client. Fails with `Error::Busy`
    /// when another client is registered and shared ownership was not
    /// requested.
    pub fn acquire(&self, allow_multiple: bool) -> Result<()> {
        if self.held.load(Ordering::SeqCst) {
            return Err(Error::Invariant("instance lock acquired twice"));
        }
        self.imp.acquire(allow_multiple)?;
        self.held.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Deregisters this process. Idempotent; safe to call from a signal
    /// handler.
    pub fn release(&self) {
        if self.held.swap(false, Ordering::SeqCst) {
            self.imp.release();
        }
    }

    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::SeqCst)
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        self.release();
    }
}

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "android", target_os = "linux", target_os = "freebsd", target_os = "dragonfly"))] {
        use std::ffi::CStr;

        const SEM_NAME: &CStr = c"/pmu-counters-num-instances";

        struct Imp {
            sem: *mut libc::sem_t,
        }

        // The semaphore handle is only ever used through async-signal-safe
        // sem_* calls, which are safe to issue from any thread.
        unsafe impl Send for Imp {}
        unsafe impl Sync for Imp {}

        impl Imp {
            fn new() -> Result<Imp> {
                let sem = unsafe {
                    libc::sem_open(SEM_NAME.as_ptr(), libc::O_CREAT, 0o666 as libc::c_uint, 0)
                };
                if sem == libc::SEM_FAILED {
                    let e = std::io::Error::last_os_error();
                    return Err(Error::from_backend("named semaphore", e));
                }
                Ok(Imp { sem })
            }

            fn acquire(&self, allow_multiple: bool) -> Result<()> {
                unsafe {
                    if libc::sem_post(self.sem) != 0 {
                        return Err(Error::Io(std::io::Error::last_os_error()));
                    }
                    let mut value: libc::c_int = 0;
                    if libc::sem_getvalue(self.sem, &mut value) != 0 {
                        // Undo our increment before reporting.
                        libc::sem_trywait(self.sem);
                        return Err(Error::Io(std::io::Error::last_os_error()));
                    }
                    if value > 1 && !allow_multiple {
                        libc::sem_trywait(self.sem);
                        return Err(Error::Busy);
                    }
                }
                Ok(())
            }

            fn release(&self) {
                unsafe {
                    libc::sem_trywait(self.sem);
                }
            }
        }

        impl Drop for Imp {
            fn drop(&mut self) {
                unsafe {
                    libc::sem_close(self.sem);
                }
            }
        }
    } else {
        use std::fs::{File, OpenOptions};
        use std::path::PathBuf;

        use fs4::fs_std::FileExt;
        use fs4::lock_contended_error;

        struct Imp {
            file: File,
        }

        impl Imp {
            fn new() -> Result<Imp> {
                let path: PathBuf = std::env::temp_dir().join("pmu-counters.lock");
                let file = OpenOptions::new()
                    .create(true)
                    .read(true)
                    .write(true)
                    .open(&path)?;
                Ok(Imp { file })
            }

            fn acquire(&self, allow_multiple: bool) -> Result<()> {
                let res = if allow_multiple {
                    self.file.lock_shared()
                } else {
                    self.file.try_lock_exclusive()
                };
                match res {
                    Ok(()) => Ok(()),
                    Err(e) if e.raw_os_error() == lock_contended_error().raw_os_error() => {
                        Err(Error::Busy)
                    }
                    Err(e) => Err(Error::Io(e)),
                }
            }

            fn release(&self) {
                let _ = self.file.unlock();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// The tests share one kernel-side semaphore (that is the point of a
    /// named semaphore), so they must not interleave.
    static SERIAL: parking_lot::Mutex<()> = parking_lot::Mutex::new(());

    /// Brings the shared count back to zero, clearing anything a killed
    /// earlier run may have leaked in the named semaphore.
    fn drain(lock: &InstanceLock) {
        for _ in 0..64 {
            lock.imp.release();
        }
    }

    #[test]
    fn double_release_is_idempotent() {
        let _serial = SERIAL.lock();
        let lock = InstanceLock::new().expect("create lock");
        drain(&lock);
        lock.acquire(true).expect("acquire");
        assert!(lock.is_held());
        lock.release();
        assert!(!lock.is_held());
        // A second release must not decrement anything further; acquiring
        // again afterwards must succeed.
        lock.release();
        lock.acquire(true).expect("re-acquire after release");
        lock.release();
    }

    #[test]
    fn acquire_twice_is_an_invariant_violation() {
        let _serial = SERIAL.lock();
        let lock = InstanceLock::new().expect("create lock");
        drain(&lock);
        lock.acquire(true).expect("acquire");
        assert!(matches!(lock.acquire(true), Err(Error::Invariant(_))));
        lock.release();
    }

    #[test]
    fn second_client_is_busy_until_first_releases() {
        let _serial = SERIAL.lock();
        // Two locks on the same name stand in for two processes: the
        // named semaphore is shared kernel state either way.
        let first = InstanceLock::new().expect("create first client");
        drain(&first);
        let second = InstanceLock::new().expect("create second client");

        first.acquire(false).expect("first client registers");
        assert!(matches!(second.acquire(false), Err(Error::Busy)));
        assert!(!second.is_held());
        // The rejected attempt must not have leaked a count: after the
        // first client deregisters, a fresh acquire succeeds.
        first.release();
        second.acquire(false).expect("second client after release");
        second.release();
    }
}
