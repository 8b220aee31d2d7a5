//! Scoped thread-affinity pinning.
//!
//! Per-core MSR and CPUID access must execute on the target CPU. The guard
//! saves the calling thread's affinity mask, pins it to one CPU, and
//! restores the saved mask on every exit path, including unwinding.

use crate::error::Result;

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "android", target_os = "linux"))] {
        use nix::sched::{sched_getaffinity, sched_setaffinity, CpuSet};
        use nix::unistd::Pid;

        use crate::error::Error;

        pub struct ScopedAffinity {
            saved: CpuSet,
        }

        impl ScopedAffinity {
            /// Pins the calling thread to `cpu` until the guard drops.
            pub fn pin_to(cpu: usize) -> Result<Self> {
                let saved = sched_getaffinity(Pid::from_raw(0)).map_err(errno_to_error)?;
                let mut target = CpuSet::new();
                target.set(cpu).map_err(errno_to_error)?;
                sched_setaffinity(Pid::from_raw(0), &target).map_err(errno_to_error)?;
                Ok(ScopedAffinity { saved })
            }
        }

        impl Drop for ScopedAffinity {
            fn drop(&mut self) {
                if let Err(e) = sched_setaffinity(Pid::from_raw(0), &self.saved) {
                    log::warn!("could not restore thread affinity: {e}");
                }
            }
        }

        fn errno_to_error(e: nix::errno::Errno) -> Error {
            Error::Io(std::io::Error::from_raw_os_error(e as i32))
        }
    } else {
        /// On platforms without a per-thread affinity interface the guard
        /// is a no-op; device-level addressing selects the target CPU.
        pub struct ScopedAffinity;

        impl ScopedAffinity {
            pub fn pin_to(_cpu: usize) -> Result<Self> {
                Ok(ScopedAffinity)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pin_and_restore() {
        // Pin to the CPU we are presumably allowed to run on; the guard
        // must restore the original mask when dropped.
        {
            let _guard = ScopedAffinity::pin_to(0).expect("pin to cpu 0");
        }
        // After the guard is gone, pinning to any other allowed CPU must
        // still work, which it would not if the mask had stayed narrowed.
        let second = ScopedAffinity::pin_to(0);
        assert!(second.is_ok());
    }
}
