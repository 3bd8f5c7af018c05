//! # Background Writer
//!
//! A daemon-style thread that periodically persists committed but unsaved
//! changes. It ticks at a tenth of the write delay and asks the store to
//! flush when the delay has elapsed since the last store operation. Data
//! flushed this way is tagged as temporary, so anything not yet committed is
//! rolled back when the store is reopened after a crash.
//!
//! Errors never reach a foreground caller; they go to the configured
//! background exception handler (and the log).

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use super::StoreState;

struct Shared {
    stop: Mutex<bool>,
    wake: Condvar,
}

pub(crate) struct BackgroundWriter {
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
}

impl BackgroundWriter {
    pub(crate) fn start(state: Arc<StoreState>, sleep_ms: u64) -> BackgroundWriter {
        let shared = Arc::new(Shared {
            stop: Mutex::new(false),
            wake: Condvar::new(),
        });
        let thread_shared = shared.clone();
        let handle = std::thread::Builder::new()
            .name("thicketdb-writer".to_owned())
            .spawn(move || loop {
                {
                    let mut stop = thread_shared.stop.lock();
                    if *stop {
                        return;
                    }
                    thread_shared
                        .wake
                        .wait_for(&mut stop, Duration::from_millis(sleep_ms));
                    if *stop {
                        return;
                    }
                }
                state.store_in_background();
            })
            .expect("spawning the background writer");
        BackgroundWriter {
            shared,
            handle: Some(handle),
        }
    }

    /// Signals the thread to stop and waits for it to finish.
    pub(crate) fn stop(&mut self) {
        *self.shared.stop.lock() = true;
        self.shared.wake.notify_all();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for BackgroundWriter {
    fn drop(&mut self) {
        self.stop();
    }
}
