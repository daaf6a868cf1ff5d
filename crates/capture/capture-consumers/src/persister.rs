use capture_buffers::{CallbackMeta, DataCallback, DbConsumer, ReadySlot};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use stratum_mem::Sample;
use tracing::{info, warn};

/// Idle backoff while no slot is ready.
const IDLE_SLEEP: Duration = Duration::from_millis(1);

/// Thread draining one double buffer: ready slot → data callback →
/// release. The stop flag is only checked between slots, never
/// mid-callback, and the slot is released whether or not the callback
/// panicked.
pub struct Persister {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Persister {
    pub fn spawn<T, F>(
        name: &str,
        mut db: DbConsumer<T>,
        mut callback: Option<DataCallback>,
        mut meta: F,
    ) -> Self
    where
        T: Sample,
        F: FnMut(&ReadySlot<'_, T>) -> (CallbackMeta, u16, u16) + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = stop.clone();
        let thread_name = name.to_string();
        let handle = std::thread::Builder::new()
            .name(format!("persister-{name}"))
            .spawn(move || {
                info!(persister = thread_name, "persister thread started");
                loop {
                    match db.read_buffer() {
                        Some(slot) => {
                            let (m, tile, channel) = meta(&slot);
                            if let Some(cb) = callback.as_mut() {
                                let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
                                    cb.invoke(slot.as_bytes(), slot.ref_time(), tile, channel, &m);
                                }));
                                if outcome.is_err() {
                                    warn!(
                                        persister = thread_name,
                                        seq = slot.seq(),
                                        "data callback panicked; slot released regardless"
                                    );
                                }
                            }
                            // Dropping the slot releases it to the producer.
                            drop(slot);
                            std::thread::yield_now();
                        }
                        None => {
                            // Checked only while idle: a stop drains the
                            // remaining ready slots before exiting.
                            if thread_stop.load(Ordering::Acquire) {
                                break;
                            }
                            std::thread::sleep(IDLE_SLEEP);
                        }
                    }
                }
            })
            .expect("failed to spawn persister thread");
        Self {
            stop,
            handle: Some(handle),
        }
    }

    /// Raises the stop flag and joins; remaining ready slots are drained
    /// first so a stop never discards a finished epoch.
    pub fn stop(mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
