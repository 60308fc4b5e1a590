//! Background heartbeat thread.
//!
//! Ticks at a fixed interval and runs a caller-supplied beat action,
//! keeping a knowledge base's caches warm and its last-access time fresh.
//! Start and stop are idempotent; stop joins the thread promptly by polling
//! a shared flag in sub-second slices rather than sleeping the full
//! interval.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::debug;

/// Granularity of the stop-flag poll.
const POLL_SLICE: Duration = Duration::from_millis(100);

/// Heartbeat status snapshot.
#[derive(Debug, Clone, serde::Serialize)]
pub struct HeartbeatStatus {
    /// Whether the background thread is running.
    pub running: bool,
    /// Tick interval in seconds.
    pub interval_secs: u64,
    /// Beats executed since start.
    pub beats: u64,
}

/// A stoppable background ticker.
pub struct Heartbeat {
    interval: Duration,
    running: Arc<AtomicBool>,
    beats: Arc<AtomicU64>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Heartbeat {
    /// Creates a stopped heartbeat with the given interval.
    #[must_use]
    pub fn new(interval_secs: u64) -> Self {
        Self {
            interval: Duration::from_secs(interval_secs),
            running: Arc::new(AtomicBool::new(false)),
            beats: Arc::new(AtomicU64::new(0)),
            handle: Mutex::new(None),
        }
    }

    /// Starts the background thread. A second start while running is a
    /// no-op.
    pub fn start<F>(&self, mut on_beat: F)
    where
        F: FnMut() + Send + 'static,
    {
        if self.running.swap(true, Ordering::AcqRel) {
            return;
        }

        let running = Arc::clone(&self.running);
        let beats = Arc::clone(&self.beats);
        let interval = self.interval;

        let handle = std::thread::spawn(move || {
            let mut next_beat = Instant::now() + interval;
            while running.load(Ordering::Acquire) {
                std::thread::sleep(POLL_SLICE.min(interval));
                if !running.load(Ordering::Acquire) {
                    break;
                }
                if Instant::now() >= next_beat {
                    on_beat();
                    beats.fetch_add(1, Ordering::Relaxed);
                    debug!("heartbeat");
                    next_beat = Instant::now() + interval;
                }
            }
        });
        *self.handle.lock() = Some(handle);
    }

    /// Stops and joins the background thread. Idempotent.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> HeartbeatStatus {
        HeartbeatStatus {
            running: self.running.load(Ordering::Acquire),
            interval_secs: self.interval.as_secs(),
            beats: self.beats.load(Ordering::Relaxed),
        }
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.stop();
    }
}
