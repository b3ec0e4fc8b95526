//! Lease watchdog.
//!
//! A background thread that periodically runs the queue's lease reaper, so
//! slots left behind by dead workers or abandoned waits are recovered even
//! when nobody is submitting.

use crate::error::Result;
use crate::queue::{TaskQueue, now_millis};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Longest single sleep, so shutdown is noticed promptly.
const SLEEP_SLICE: Duration = Duration::from_millis(50);

const MIN_SCAN_INTERVAL: Duration = Duration::from_millis(5);
const MAX_SCAN_INTERVAL: Duration = Duration::from_secs(1);

/// Scan interval for a given lease: a quarter of it, clamped.
pub fn scan_interval_for(lease: Duration) -> Duration {
    (lease / 4).clamp(MIN_SCAN_INTERVAL, MAX_SCAN_INTERVAL)
}

/// Runs [`TaskQueue::reap_expired`] on a timer.
pub struct LeaseWatchdog {
    shutdown: Arc<AtomicBool>,
    reaped: Arc<AtomicU64>,
    thread: Option<JoinHandle<()>>,
}

impl LeaseWatchdog {
    /// Create and start a new watchdog.
    pub fn start(queue: TaskQueue, interval: Duration) -> Result<Self> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let reaped = Arc::new(AtomicU64::new(0));

        let thread = {
            let shutdown = shutdown.clone();
            let reaped = reaped.clone();
            thread::Builder::new()
                .name("lease-reaper".to_string())
                .spawn(move || watchdog_loop(queue, interval, shutdown, reaped))?
        };

        Ok(Self {
            shutdown,
            reaped,
            thread: Some(thread),
        })
    }

    /// Slots recovered so far.
    pub fn reaped(&self) -> u64 {
        self.reaped.load(Ordering::Relaxed)
    }

    /// Stop the watchdog thread and wait for it.
    pub fn shutdown(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for LeaseWatchdog {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn watchdog_loop(
    queue: TaskQueue,
    interval: Duration,
    shutdown: Arc<AtomicBool>,
    reaped: Arc<AtomicU64>,
) {
    tracing::debug!(interval_ms = interval.as_millis() as u64, "Lease reaper started");

    while !shutdown.load(Ordering::Relaxed) {
        let report = queue.reap_expired(now_millis());
        if !report.is_empty() {
            let n = (report.expired.len() + report.reclaimed.len()) as u64;
            reaped.fetch_add(n, Ordering::Relaxed);
            tracing::info!(
                expired = report.expired.len(),
                reclaimed = report.reclaimed.len(),
                "Recovered slots past their lease"
            );
        }

        let mut slept = Duration::ZERO;
        while slept < interval && !shutdown.load(Ordering::Relaxed) {
            let step = SLEEP_SLICE.min(interval - slept);
            thread::sleep(step);
            slept += step;
        }
    }

    tracing::debug!("Lease reaper stopped");
}
