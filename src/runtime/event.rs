//! Completion events and event pools
//!
//! An [`Event`] is the fundamental synchronization primitive: a
//! pool-recycled native completion token carrying timestamps, deferred
//! actions and (in regular command-list mode) the command list to return
//! once the event fires.
//!
//! Events are shared via `Arc`. The runtime keeps every in-flight event
//! reachable until its Finished transition by making each submission's
//! event hold strong references to the events it waits on; once the last
//! owner drops its `Arc`, the slot is reset and pushed back onto the pool's
//! free stack.

use std::sync::{Arc, Mutex, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::driver::{CmdListHandle, CtxHandle, EventHandle, EventPoolHandle, NativeDriver};
use crate::error::{ZeroForgeError, ZfResult};
use crate::runtime::context::Context;

/// A deferred action run exactly once when the event first becomes Finished
pub type Action = Box<dyn FnOnce() + Send>;

/// Event lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventStatus {
    /// Freshly acquired from the pool
    Init,
    /// A queue operation has started signaling it
    Recording,
    /// The operation has been submitted
    Recorded,
    /// The native handle reported completion
    Finished,
}

struct AssignedList {
    // non-owning: the backend keeps contexts alive for the process lifetime
    ctx: Weak<Context>,
    cmd_list: CmdListHandle,
}

struct EventInner {
    status: EventStatus,
    error: Option<ZeroForgeError>,
    device_timestamp: u64,
    host_timestamp_ns: u64,
    actions: Vec<Action>,
    assigned: Option<AssignedList>,
    /// Events this event waits on; released on the Finished transition
    deps: Vec<Arc<Event>>,
}

/// A pool-recycled completion token
pub struct Event {
    driver: Arc<dyn NativeDriver>,
    handle: EventHandle,
    pool: Weak<EventPool>,
    pool_index: usize,
    timer_resolution_ns: u64,
    timestamp_valid_bits: u32,
    inner: Mutex<EventInner>,
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Event")
            .field("handle", &self.handle)
            .field("status", &self.status())
            .finish()
    }
}

fn host_now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

impl Event {
    pub fn handle(&self) -> EventHandle {
        self.handle
    }

    pub fn status(&self) -> EventStatus {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).status
    }

    pub fn is_finished(&self) -> bool {
        self.status() == EventStatus::Finished
    }

    /// Error latched when the originating operation failed
    pub fn error(&self) -> Option<ZeroForgeError> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .error
            .clone()
    }

    pub(crate) fn set_error(&self, err: ZeroForgeError) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.error.is_none() {
            inner.error = Some(err);
        }
    }

    pub(crate) fn mark_recording(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.status == EventStatus::Init {
            inner.status = EventStatus::Recording;
        }
    }

    pub(crate) fn mark_recorded(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.status != EventStatus::Finished {
            inner.status = EventStatus::Recorded;
        }
    }

    /// Retain an event this one waits on, released once this event finishes
    pub(crate) fn add_dep(&self, dep: Arc<Event>) {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .deps
            .push(dep);
    }

    /// Bind an action which is promised to run when the event finishes.
    /// Actions must not panic.
    pub fn add_action(&self, action: Action) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.status == EventStatus::Finished {
            // already finished: honor the run-exactly-once promise now
            drop(inner);
            action();
        } else {
            inner.actions.push(action);
        }
    }

    /// Record a command list to return to `ctx`'s pool when finished
    pub(crate) fn assign_cmd_list(&self, ctx: &Arc<Context>, cmd_list: CmdListHandle) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.assigned = Some(AssignedList {
            ctx: Arc::downgrade(ctx),
            cmd_list,
        });
    }

    /// Block the caller until the event reaches Finished
    pub fn wait(&self) -> ZfResult<()> {
        if self.is_finished() {
            return Ok(());
        }
        self.driver.event_host_wait(self.handle)?;
        self.finish_transition();
        Ok(())
    }

    /// Probe the native handle and update status.
    ///
    /// Returns whether the event is Finished. With `throw_if_not_ready`, a
    /// still-pending event fails with `NotReady` instead.
    pub fn update_finish_status(&self, throw_if_not_ready: bool) -> ZfResult<bool> {
        if self.is_finished() {
            return Ok(true);
        }
        if self.driver.event_query(self.handle)? {
            self.finish_transition();
            return Ok(true);
        }
        if throw_if_not_ready {
            return Err(ZeroForgeError::NotReady(
                "event has not completed".to_string(),
            ));
        }
        Ok(false)
    }

    /// Force the event into Finished as if a host-side signaler had fired
    pub fn host_signal(&self) -> ZfResult<()> {
        self.driver.event_host_signal(self.handle)?;
        self.finish_transition();
        Ok(())
    }

    /// The Init→Finished transition. Runs exactly once: returns the assigned
    /// command list, drains actions in insertion order, then releases the
    /// wait-set references.
    fn finish_transition(&self) {
        let (actions, assigned, deps) = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            if inner.status == EventStatus::Finished {
                return;
            }
            inner.status = EventStatus::Finished;
            inner.device_timestamp = self.driver.event_timestamp(self.handle).unwrap_or(0);
            inner.host_timestamp_ns = host_now_ns();
            (
                std::mem::take(&mut inner.actions),
                inner.assigned.take(),
                std::mem::take(&mut inner.deps),
            )
        };
        if let Some(assigned) = assigned {
            if let Some(ctx) = assigned.ctx.upgrade() {
                ctx.return_cmd_list(assigned.cmd_list);
            }
        }
        for action in actions {
            action();
        }
        drop(deps);
    }

    /// Device timestamp captured on completion, in device ticks
    pub fn device_timestamp(&self) -> u64 {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .device_timestamp
    }

    /// Host timestamp captured on completion, in nanoseconds
    pub fn host_timestamp_ns(&self) -> u64 {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .host_timestamp_ns
    }

    /// Elapsed milliseconds between two finished events (`self` → `end`).
    ///
    /// Device timestamps are masked to the device's valid bit width before
    /// subtraction. When the device delta would be negative (counter
    /// wraparound), the host timestamps captured on completion are used
    /// instead.
    pub fn elapsed_time(&self, end: &Event) -> ZfResult<f32> {
        if std::ptr::eq(self, end) {
            if !self.is_finished() {
                return Err(ZeroForgeError::NotReady(
                    "event has not completed".to_string(),
                ));
            }
            return Ok(0.0);
        }
        let (start_dev, start_host) = {
            let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            if inner.status != EventStatus::Finished {
                return Err(ZeroForgeError::NotReady(
                    "start event has not completed".to_string(),
                ));
            }
            (inner.device_timestamp, inner.host_timestamp_ns)
        };
        let (end_dev, end_host) = {
            let inner = end.inner.lock().unwrap_or_else(|e| e.into_inner());
            if inner.status != EventStatus::Finished {
                return Err(ZeroForgeError::NotReady(
                    "end event has not completed".to_string(),
                ));
            }
            (inner.device_timestamp, inner.host_timestamp_ns)
        };

        let mask = if self.timestamp_valid_bits >= 64 {
            u64::MAX
        } else {
            (1u64 << self.timestamp_valid_bits) - 1
        };
        let start_ticks = start_dev & mask;
        let end_ticks = end_dev & mask;
        if end_ticks >= start_ticks {
            let ns = (end_ticks - start_ticks) * self.timer_resolution_ns;
            Ok(ns as f64 as f32 / 1_000_000.0)
        } else {
            tracing::debug!(
                start = start_ticks,
                end = end_ticks,
                "device timestamp wraparound, falling back to host clock"
            );
            Ok(end_host.saturating_sub(start_host) as f64 as f32 / 1_000_000.0)
        }
    }
}

impl Drop for Event {
    fn drop(&mut self) {
        // the last owner is responsible for any outstanding completion
        // duties the monitor did not get to
        if self.driver.event_query(self.handle).unwrap_or(false) {
            self.finish_transition();
        }
        if let Some(pool) = self.pool.upgrade() {
            if let Err(e) = self.driver.event_reset(self.handle) {
                tracing::warn!(error = %e, "failed to reset event before pool return");
            }
            pool.return_slot(self.pool_index);
        }
    }
}

/// Fixed-capacity allocator of events backed by a single native event pool
pub struct EventPool {
    driver: Arc<dyn NativeDriver>,
    handle: EventPoolHandle,
    slots: Vec<EventHandle>,
    free: Mutex<Vec<usize>>,
    timer_resolution_ns: u64,
    timestamp_valid_bits: u32,
}

impl EventPool {
    pub(crate) fn new(
        driver: Arc<dyn NativeDriver>,
        ctx: CtxHandle,
        capacity: u32,
        timer_resolution_ns: u64,
        timestamp_valid_bits: u32,
    ) -> ZfResult<Arc<Self>> {
        let handle = driver.event_pool_create(ctx, capacity)?;
        let mut slots = Vec::with_capacity(capacity as usize);
        for index in 0..capacity {
            slots.push(driver.event_create(handle, index)?);
        }
        tracing::debug!(capacity, "created event pool");
        Ok(Arc::new(EventPool {
            driver,
            handle,
            slots,
            free: Mutex::new((0..capacity as usize).rev().collect()),
            timer_resolution_ns,
            timestamp_valid_bits,
        }))
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn free_count(&self) -> usize {
        self.free.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// True when every slot has been returned
    pub fn is_full(&self) -> bool {
        self.free_count() == self.capacity()
    }

    /// Hand out an event if a slot is free
    pub(crate) fn try_acquire(self: &Arc<Self>) -> Option<Arc<Event>> {
        let index = self.free.lock().unwrap_or_else(|e| e.into_inner()).pop()?;
        Some(Arc::new(Event {
            driver: self.driver.clone(),
            handle: self.slots[index],
            pool: Arc::downgrade(self),
            pool_index: index,
            timer_resolution_ns: self.timer_resolution_ns,
            timestamp_valid_bits: self.timestamp_valid_bits,
            inner: Mutex::new(EventInner {
                status: EventStatus::Init,
                error: None,
                device_timestamp: 0,
                host_timestamp_ns: 0,
                actions: Vec::new(),
                assigned: None,
                deps: Vec::new(),
            }),
        }))
    }

    fn return_slot(&self, index: usize) {
        self.free.lock().unwrap_or_else(|e| e.into_inner()).push(index);
    }
}

impl Drop for EventPool {
    fn drop(&mut self) {
        if self.free.lock().unwrap_or_else(|e| e.into_inner()).len() != self.slots.len() {
            tracing::warn!("event pool dropped with outstanding events");
        }
        for slot in &self.slots {
            let _ = self.driver.event_destroy(*slot);
        }
        let _ = self.driver.event_pool_destroy(self.handle);
    }
}
