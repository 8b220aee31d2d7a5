//! 64-bit widening of narrow hardware counters.
//!
//! A `CounterWidthExtender` tracks `(extended, last_raw)` for one counter
//! of width W. Every sample folds the raw delta into the extended value,
//! accounting for at most one wraparound; the watchdog thread samples at a
//! period strictly shorter than the minimum wraparound interval so that a
//! second wrap between samples is impossible. This is the only mechanism
//! in the crate that guarantees 64-bit monotonicity over a session.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;

use super::HwRegisterPtr;
use crate::error::Result;

/// After this many consecutive read failures the counter is marked
/// unreliable; sampling continues in case the failure is transient.
const UNRELIABLE_AFTER: u32 = 10;

/// Default watchdog period for 32-bit free-running counters: a 32-bit
/// counter at one increment per DRAM clock wraps in just over a second at
/// 3.2 GHz.
pub const DEFAULT_PERIOD_32BIT: Duration = Duration::from_millis(500);

/// 48-bit counters wrap after days at any plausible rate; ten seconds is
/// already very conservative.
pub const DEFAULT_PERIOD_48BIT: Duration = Duration::from_secs(10);

struct ExtenderState {
    raw: HwRegisterPtr,
    width: u32,
    extended: u64,
    last_raw: u64,
    failures: u32,
}

impl ExtenderState {
    fn fold(&mut self, new_raw: u64) -> u64 {
        let new_raw = mask_width(new_raw, self.width);
        if self.width >= 64 {
            self.extended = self
                .extended
                .wrapping_add(new_raw.wrapping_sub(self.last_raw));
        } else if new_raw < self.last_raw {
            self.extended += ((1u64 << self.width) - self.last_raw) + new_raw;
        } else {
            self.extended += new_raw - self.last_raw;
        }
        self.last_raw = new_raw;
        self.extended
    }
}

fn mask_width(value: u64, width: u32) -> u64 {
    if width >= 64 {
        value
    } else {
        value & ((1u64 << width) - 1)
    }
}

pub struct CounterWidthExtender {
    state: Mutex<ExtenderState>,
    published: AtomicU64,
    unreliable: AtomicBool,
    stop: Arc<AtomicBool>,
    watchdog: Mutex<Option<JoinHandle<()>>>,
}

impl CounterWidthExtender {
    /// Creates the extender and starts its watchdog thread. The initial
    /// raw read seeds both `extended` and `last_raw`.
    pub fn new(raw: HwRegisterPtr, width: u32, period: Duration) -> Result<Arc<Self>> {
        let initial = mask_width(raw.read()?, width);
        let extender = Arc::new(CounterWidthExtender {
            state: Mutex::new(ExtenderState {
                raw,
                width,
                extended: initial,
                last_raw: initial,
                failures: 0,
            }),
            published: AtomicU64::new(initial),
            unreliable: AtomicBool::new(false),
            stop: Arc::new(AtomicBool::new(false)),
            watchdog: Mutex::new(None),
        });

        let weak = Arc::downgrade(&extender);
        let stop = Arc::clone(&extender.stop);
        let handle = thread::Builder::new()
            .name("pmu-width-extender".into())
            .spawn(move || watchdog_loop(weak, stop, period))?;
        *extender.watchdog.lock() = Some(handle);
        Ok(extender)
    }

    fn sample(&self) {
        let mut state = self.state.lock();
        match state.raw.read() {
            Ok(new_raw) => {
                state.failures = 0;
                let extended = state.fold(new_raw);
                self.published.store(extended, Ordering::Release);
            }
            Err(e) => {
                state.failures += 1;
                if state.failures == UNRELIABLE_AFTER {
                    self.unreliable.store(true, Ordering::Release);
                    log::warn!("width extender marked unreliable after repeated failures: {e}");
                }
            }
        }
    }

    /// Takes a fresh sample and returns the extended value. Monotonic for
    /// any two calls `t1 < t2` on the same extender.
    pub fn read(&self) -> u64 {
        self.sample();
        self.published.load(Ordering::Acquire)
    }

    /// The last published value, without touching the hardware.
    pub fn peek(&self) -> u64 {
        self.published.load(Ordering::Acquire)
    }

    /// Re-seeds `extended` and `last_raw` from the raw counter.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        if let Ok(raw) = state.raw.read() {
            let raw = mask_width(raw, state.width);
            state.extended = raw;
            state.last_raw = raw;
            state.failures = 0;
            self.unreliable.store(false, Ordering::Release);
            self.published.store(raw, Ordering::Release);
        }
    }

    pub fn is_reliable(&self) -> bool {
        !self.unreliable.load(Ordering::Acquire)
    }
}

impl Drop for CounterWidthExtender {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.watchdog.lock().take() {
            // The final upgrade in the watchdog can make it the thread
            // that runs this drop; joining ourselves would deadlock.
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

fn watchdog_loop(extender: Weak<CounterWidthExtender>, stop: Arc<AtomicBool>, period: Duration) {
    // Sleep in short slices so drop can join within one slice rather than
    // one full period.
    let slice = Duration::from_millis(50).min(period);
    'outer: loop {
        let mut waited = Duration::ZERO;
        while waited < period {
            if stop.load(Ordering::Relaxed) {
                break 'outer;
            }
            let step = slice.min(period - waited);
            thread::sleep(step);
            waited += step;
        }
        match extender.upgrade() {
            Some(ext) => ext.sample(),
            None => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU64;

    use super::*;
    use crate::error::Error;
    use crate::registers::HwRegister;

    /// A synthetic counter that advances by a fixed step per read and
    /// wraps at the given width.
    struct SyntheticCounter {
        value: AtomicU64,
        step: u64,
        width: u32,
    }

    impl HwRegister for SyntheticCounter {
        fn read(&self) -> Result<u64> {
            let v = self.value.fetch_add(self.step, Ordering::SeqCst);
            Ok(mask_width(v, self.width))
        }

        fn write(&self, _value: u64) -> Result<()> {
            Err(Error::Invariant("read-only synthetic counter"))
        }
    }

    /// The watchdog logs when a counter turns unreliable; run with
    /// RUST_LOG=debug to see it.
    fn init_logging() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn synthetic(step: u64, width: u32) -> HwRegisterPtr {
        Arc::new(SyntheticCounter {
            value: AtomicU64::new(0),
            step,
            width,
        })
    }

    #[test]
    fn monotonic_across_wraparounds() {
        init_logging();
        // Each read advances by nearly half the 32-bit range, so every
        // second sample wraps.
        let ext = CounterWidthExtender::new(
            synthetic(0x9000_0000, 32),
            32,
            Duration::from_secs(3600),
        )
        .expect("create extender");
        let mut last = ext.read();
        for _ in 0..16 {
            let v = ext.read();
            assert!(v >= last, "extended value went backwards: {v} < {last}");
            last = v;
        }
        // Ten steps of 0x9000_0000 must be preserved exactly despite the
        // 32-bit wraps in between.
        assert_eq!(last % 0x9000_0000, 0);
    }

    #[test]
    fn wraparound_slope_is_preserved() {
        // Synthetic wrap at 2^32 with step 2^31: after 8 reads the
        // logical value is 8 * 2^31 even though the raw counter wrapped
        // four times.
        let ext =
            CounterWidthExtender::new(synthetic(1 << 31, 32), 32, Duration::from_secs(3600))
                .expect("create extender");
        for _ in 0..8 {
            ext.read();
        }
        assert_eq!(ext.peek(), 8u64 << 31);
    }

    #[test]
    fn reset_reseeds_from_raw() {
        let ext = CounterWidthExtender::new(synthetic(100, 48), 48, Duration::from_secs(3600))
            .expect("create extender");
        ext.read();
        ext.read();
        ext.reset();
        let after_reset = ext.peek();
        let next = ext.read();
        assert!(next >= after_reset);
        assert_eq!(next - after_reset, 100);
    }

    #[test]
    fn widened_register_rejects_nonzero_writes() {
        let ext = CounterWidthExtender::new(synthetic(1, 32), 32, Duration::from_secs(3600))
            .expect("create extender");
        let reg = crate::registers::WidenedRegister::shared(ext);
        assert!(reg.write(0).is_ok());
        assert!(matches!(reg.write(5), Err(Error::Invariant(_))));
    }

    #[test]
    fn watchdog_joins_on_drop() {
        init_logging();
        let ext = CounterWidthExtender::new(
            synthetic(1, 32),
            32,
            Duration::from_millis(10),
        )
        .expect("create extender");
        thread::sleep(Duration::from_millis(50));
        assert!(ext.peek() > 0);
        drop(ext);
        // Nothing to assert beyond "drop returned"; a leaked thread would
        // keep the process alive under test runners that detect it.
    }
}
