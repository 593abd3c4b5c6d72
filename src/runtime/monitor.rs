//! Background event monitor
//!
//! A single long-lived thread started at backend initialization. Each tick
//! it sweeps every context's tracked events (running completion duties for
//! those that finished) and services one pending host-callback record. On
//! stop-request it drains outstanding work, bounded by a diagnostic
//! timeout, so teardown cannot hang on a wedged stream.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::runtime::backend::{CallbackQueue, CallbackRecord};
use crate::runtime::context::Context;

const MONITOR_TICK: Duration = Duration::from_micros(200);
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Handle to the monitor thread
pub struct EventMonitor {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl EventMonitor {
    /// Spawn the monitor over the given contexts and callback FIFO
    pub fn start(contexts: Vec<Arc<Context>>, callbacks: Arc<CallbackQueue>) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();
        let handle = std::thread::Builder::new()
            .name("zf-event-monitor".to_string())
            .spawn(move || monitor_loop(contexts, callbacks, stop_flag))
            .expect("failed to spawn event monitor thread");
        EventMonitor {
            stop,
            handle: Some(handle),
        }
    }

    /// Request stop and wait for the drain to complete
    pub fn stop_and_join(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for EventMonitor {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}

fn monitor_loop(contexts: Vec<Arc<Context>>, callbacks: Arc<CallbackQueue>, stop: Arc<AtomicBool>) {
    tracing::debug!("event monitor started");
    loop {
        for ctx in &contexts {
            ctx.sweep_events();
        }
        if let Some(record) = callbacks.pop() {
            process_callback(record);
        }
        if stop.load(Ordering::Acquire) {
            drain(&contexts, &callbacks);
            break;
        }
        std::thread::sleep(MONITOR_TICK);
    }
    tracing::debug!("event monitor exited");
}

/// Drive outstanding events and callbacks to completion before exiting
fn drain(contexts: &[Arc<Context>], callbacks: &Arc<CallbackQueue>) {
    let deadline = Instant::now() + DRAIN_TIMEOUT;
    loop {
        while let Some(record) = callbacks.pop() {
            process_callback(record);
        }
        let pending: usize = contexts.iter().map(|ctx| ctx.sweep_events()).sum();
        if pending == 0 && callbacks.is_empty() {
            return;
        }
        if Instant::now() > deadline {
            tracing::warn!(pending, "event monitor stop timed out with outstanding events");
            return;
        }
        std::thread::sleep(MONITOR_TICK);
    }
}

/// The host-callback protocol: wait for the stream to reach the marker, run
/// the user function, release the stream, confirm it moved past the barrier.
fn process_callback(record: CallbackRecord) {
    if let Err(e) = record.gpu_ready.wait() {
        tracing::warn!(error = %e, "callback gpu_ready wait failed");
    }
    let status = match record.gpu_ready.error() {
        Some(err) => Err(err),
        None => Ok(()),
    };

    let callback = record.callback;
    // a panicking user callback must not take the monitor down, and the
    // stream must still be released
    if catch_unwind(AssertUnwindSafe(move || callback(status))).is_err() {
        tracing::warn!("stream callback panicked");
    }

    if let Err(e) = record.cpu_done.host_signal() {
        tracing::warn!(error = %e, "failed to signal callback completion");
    }
    if let Err(e) = record.gpu_ack.wait() {
        tracing::warn!(error = %e, "callback gpu_ack wait failed");
    }
}
