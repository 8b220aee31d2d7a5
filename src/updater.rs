//! Background snapshot refresher.
//!
//! An `AsyncUpdater` takes a full snapshot at a fixed cadence and
//! publishes the (previous, current) pair under a mutex. Readers get the
//! pair by value and derive metrics without ever touching the hardware
//! themselves. The task observes a stop flag every tick and is joined on
//! drop within one cadence.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;

use crate::counters::{CoreCounterState, SocketCounterState, SystemCounterState};
use crate::error::Result;
use crate::monitor::Monitor;

pub const DEFAULT_PERIOD: Duration = Duration::from_secs(1);

#[derive(Default)]
struct Published {
    previous: Option<SnapshotSet>,
    current: Option<SnapshotSet>,
}

#[derive(Clone)]
struct SnapshotSet {
    system: SystemCounterState,
    sockets: Vec<SocketCounterState>,
    cores: Vec<CoreCounterState>,
}

pub struct AsyncUpdater {
    published: Arc<Mutex<Published>>,
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl AsyncUpdater {
    pub fn start(monitor: Arc<Monitor>, period: Duration) -> Result<AsyncUpdater> {
        let published = Arc::new(Mutex::new(Published::default()));
        let stop = Arc::new(AtomicBool::new(false));

        let published_for_worker = Arc::clone(&published);
        let stop_for_worker = Arc::clone(&stop);
        let worker = thread::Builder::new()
            .name("pmu-async-updater".into())
            .spawn(move || {
                let slice = Duration::from_millis(50).min(period);
                loop {
                    match monitor.get_all_counter_states() {
                        Ok((system, sockets, cores)) => {
                            let mut published = published_for_worker.lock();
                            published.previous = published.current.take();
                            published.current = Some(SnapshotSet {
                                system,
                                sockets,
                                cores,
                            });
                        }
                        Err(e) => log::warn!("background snapshot failed: {e}"),
                    }
                    let mut waited = Duration::ZERO;
                    while waited < period {
                        if stop_for_worker.load(Ordering::Relaxed) {
                            return;
                        }
                        let step = slice.min(period - waited);
                        thread::sleep(step);
                        waited += step;
                    }
                }
            })?;

        Ok(AsyncUpdater {
            published,
            stop,
            worker: Some(worker),
        })
    }

    /// (previous, current) system states, by value. `None` until two
    /// ticks have completed.
    pub fn system_pair(&self) -> Option<(SystemCounterState, SystemCounterState)> {
        let published = self.published.lock();
        match (&published.previous, &published.current) {
            (Some(prev), Some(cur)) => Some((prev.system.clone(), cur.system.clone())),
            _ => None,
        }
    }

    pub fn socket_pair(&self, socket: usize) -> Option<(SocketCounterState, SocketCounterState)> {
        let published = self.published.lock();
        match (&published.previous, &published.current) {
            (Some(prev), Some(cur)) => Some((
                prev.sockets.get(socket)?.clone(),
                cur.sockets.get(socket)?.clone(),
            )),
            _ => None,
        }
    }

    pub fn core_pair(&self, core: usize) -> Option<(CoreCounterState, CoreCounterState)> {
        let published = self.published.lock();
        match (&published.previous, &published.current) {
            (Some(prev), Some(cur)) => Some((
                prev.cores.get(core)?.clone(),
                cur.cores.get(core)?.clone(),
            )),
            _ => None,
        }
    }
}

impl Drop for AsyncUpdater {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}
