//! Runtime context
//!
//! A context owns the native context handle, a growing set of event pools,
//! and the pool of recyclable regular command lists shared by every queue
//! on the context. It is also the allocation front door: reservations go
//! through the device's tracker before the native allocator is invoked.

use std::sync::{Arc, Mutex, Weak};

use crate::driver::{CmdListHandle, CtxHandle, DevHandle, DevicePtr, MemKind, NativeDriver};
use crate::error::{ZeroForgeError, ZfResult};
use crate::runtime::event::{Event, EventPool};
use crate::runtime::tracker::AllocationTracker;

/// Command-list pool counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CmdListStats {
    pub requested: u64,
    pub reused: u64,
    /// Reset lists currently sitting in the pool
    pub available: usize,
}

impl CmdListStats {
    /// Lists created through the native driver (requests not served by reuse)
    pub fn created(&self) -> u64 {
        self.requested - self.reused
    }
}

/// Event acquisition counters and per-pool occupancy
#[derive(Debug, Clone)]
pub struct EventStats {
    pub requested: u64,
    pub reused: u64,
    /// (capacity, free) per pool, in creation order
    pub pools: Vec<(usize, usize)>,
}

impl EventStats {
    /// Total native events backing this context
    pub fn total_capacity(&self) -> usize {
        self.pools.iter().map(|(capacity, _)| capacity).sum()
    }

    /// True when every pool has all slots returned
    pub fn all_full(&self) -> bool {
        self.pools.iter().all(|(capacity, free)| capacity == free)
    }
}

struct ContextInner {
    event_pools: Vec<Arc<EventPool>>,
    /// Capacity for the next pool; doubles after each creation
    next_pool_size: u32,
    cmd_lists: Vec<CmdListHandle>,
    cmd_lists_requested: u64,
    cmd_lists_reused: u64,
    events_requested: u64,
    events_reused: u64,
    /// Events the monitor still needs to transition
    tracked_events: Vec<Weak<Event>>,
    /// Events that must stay alive until the native handle fires, even
    /// with no other owner (wait sets of force-finished operations)
    retained_events: Vec<Arc<Event>>,
}

/// Owns the native context, its event pools and the command-list pool
pub struct Context {
    driver: Arc<dyn NativeDriver>,
    handle: CtxHandle,
    owns_handle: bool,
    timer_resolution_ns: u64,
    timestamp_valid_bits: u32,
    inner: Mutex<ContextInner>,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context").field("handle", &self.handle).finish()
    }
}

impl Context {
    /// Create a context owning a fresh native handle.
    ///
    /// Event timing parameters come from the device whose queues will
    /// signal the events in this context's pools.
    pub fn new(
        driver: Arc<dyn NativeDriver>,
        timer_resolution_ns: u64,
        timestamp_valid_bits: u32,
    ) -> ZfResult<Arc<Self>> {
        let handle = driver.context_create()?;
        Ok(Arc::new(Context {
            driver,
            handle,
            owns_handle: true,
            timer_resolution_ns,
            timestamp_valid_bits,
            inner: Mutex::new(ContextInner {
                event_pools: Vec::new(),
                next_pool_size: 1,
                cmd_lists: Vec::new(),
                cmd_lists_requested: 0,
                cmd_lists_reused: 0,
                events_requested: 0,
                events_reused: 0,
                tracked_events: Vec::new(),
                retained_events: Vec::new(),
            }),
        }))
    }

    pub fn handle(&self) -> CtxHandle {
        self.handle
    }

    /// Acquire a fresh event, growing the pool set when every known pool is
    /// exhausted. New pools double in capacity.
    pub fn get_event(self: &Arc<Self>) -> ZfResult<Arc<Event>> {
        let mut inner = self.inner.lock()?;
        inner.events_requested += 1;

        let mut acquired = None;
        for pool in inner.event_pools.iter() {
            if let Some(event) = pool.try_acquire() {
                acquired = Some(event);
                break;
            }
        }
        if let Some(event) = acquired {
            inner.events_reused += 1;
            inner.tracked_events.push(Arc::downgrade(&event));
            return Ok(event);
        }

        let size = inner.next_pool_size;
        tracing::debug!(
            pools = inner.event_pools.len(),
            new_pool_size = size,
            "no free events, growing pool set"
        );
        let pool = EventPool::new(
            self.driver.clone(),
            self.handle,
            size,
            self.timer_resolution_ns,
            self.timestamp_valid_bits,
        )?;
        inner.next_pool_size = size.saturating_mul(2);
        let event = pool
            .try_acquire()
            .expect("freshly created pool has a free slot");
        inner.event_pools.push(pool);
        inner.tracked_events.push(Arc::downgrade(&event));
        Ok(event)
    }

    /// Keep the given events alive until their native handles fire. Used
    /// when an operation is force-finished on failure: its wait set may
    /// still be referenced by in-flight native work.
    pub(crate) fn retain_until_finished(&self, events: Vec<Arc<Event>>) {
        let live: Vec<Arc<Event>> = events.into_iter().filter(|e| !e.is_finished()).collect();
        if live.is_empty() {
            return;
        }
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retained_events
            .extend(live);
    }

    /// Update the status of every tracked event, running completion duties
    /// for those that finished. Returns how many tracked events are still
    /// pending.
    pub fn sweep_events(&self) -> usize {
        let (snapshot, retained) = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            let tracked = std::mem::take(&mut inner.tracked_events);
            let retained = std::mem::take(&mut inner.retained_events);
            (
                tracked.iter().filter_map(Weak::upgrade).collect::<Vec<_>>(),
                retained,
            )
        };

        let mut pending = 0;
        let mut keep: Vec<Weak<Event>> = Vec::new();
        for event in snapshot {
            match event.update_finish_status(false) {
                Ok(true) => {}
                Ok(false) => {
                    pending += 1;
                    keep.push(Arc::downgrade(&event));
                }
                Err(e) => {
                    tracing::warn!(error = %e, "event status probe failed during sweep");
                    keep.push(Arc::downgrade(&event));
                }
            }
        }

        let mut keep_retained: Vec<Arc<Event>> = Vec::new();
        for event in retained {
            if !event.update_finish_status(false).unwrap_or(false) {
                pending += 1;
                keep_retained.push(event);
            }
        }

        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.tracked_events.extend(keep);
        inner.retained_events.extend(keep_retained);
        pending
    }

    /// Pop a reset command list from the pool, creating one if none are
    /// available.
    pub fn acquire_cmd_list(&self, dev: DevHandle, ordinal: u32) -> ZfResult<CmdListHandle> {
        let mut inner = self.inner.lock()?;
        inner.cmd_lists_requested += 1;
        if let Some(cmd_list) = inner.cmd_lists.pop() {
            inner.cmd_lists_reused += 1;
            return Ok(cmd_list);
        }
        drop(inner);
        tracing::trace!("command list pool empty, creating");
        Ok(self.driver.cmd_list_create(self.handle, dev, ordinal)?)
    }

    /// Reset the given command list and push it back onto the pool
    pub fn return_cmd_list(&self, cmd_list: CmdListHandle) {
        if let Err(e) = self.driver.cmd_list_reset(cmd_list) {
            tracing::warn!(error = %e, "failed to reset returned command list");
            return;
        }
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .cmd_lists
            .push(cmd_list);
    }

    pub fn cmd_list_stats(&self) -> CmdListStats {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        CmdListStats {
            requested: inner.cmd_lists_requested,
            reused: inner.cmd_lists_reused,
            available: inner.cmd_lists.len(),
        }
    }

    pub fn event_stats(&self) -> EventStats {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        EventStats {
            requested: inner.events_requested,
            reused: inner.events_reused,
            pools: inner
                .event_pools
                .iter()
                .map(|p| (p.capacity(), p.free_count()))
                .collect(),
        }
    }

    /// Allocate device-visible memory with quota enforcement.
    ///
    /// The reservation is rolled back if the native allocator fails.
    pub fn allocate_with(
        &self,
        tracker: &AllocationTracker,
        dev: DevHandle,
        kind: MemKind,
        size: usize,
        alignment: usize,
    ) -> ZfResult<DevicePtr> {
        tracker.reserve(size)?;
        match self.driver.mem_alloc(self.handle, dev, kind, size, alignment) {
            Ok(ptr) => {
                tracker.record(ptr, size);
                Ok(ptr)
            }
            Err(e) => {
                tracker.release(size);
                Err(e.into())
            }
        }
    }

    /// Free a recorded allocation and return its quota.
    ///
    /// Fails with `InvalidDevicePointer` for addresses no allocation owns.
    pub fn free_with(&self, tracker: &AllocationTracker, ptr: DevicePtr) -> ZfResult<()> {
        let info = tracker.get_by_dev(ptr).ok_or_else(|| {
            ZeroForgeError::InvalidDevicePointer(format!("free of unknown pointer {}", ptr))
        })?;
        tracker.release(info.size);
        tracker.remove(info.base);
        self.driver.mem_free(self.handle, info.base)?;
        Ok(())
    }

    /// Destroy pooled resources and, if owned, the native context.
    ///
    /// Fails with `ResourceBusy` while events are still outstanding.
    pub fn teardown(&self) -> ZfResult<()> {
        let mut inner = self.inner.lock()?;
        for pool in &inner.event_pools {
            if !pool.is_full() {
                return Err(ZeroForgeError::ResourceBusy(format!(
                    "event pool has {} outstanding events",
                    pool.capacity() - pool.free_count()
                )));
            }
        }
        // dropping the pools destroys their native resources
        inner.event_pools.clear();
        for cmd_list in inner.cmd_lists.drain(..) {
            self.driver.cmd_list_destroy(cmd_list)?;
        }
        drop(inner);
        if self.owns_handle {
            self.driver.context_destroy(self.handle)?;
        }
        Ok(())
    }
}
