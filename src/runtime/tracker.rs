//! Per-device allocation accounting
//!
//! Tracks every live device allocation as `(base, size)`, enforces the
//! device's global capacity on reservation, and resolves host-pinned
//! aliases. Reservation and recording are separate steps so the allocator
//! can roll a failed native allocation back without losing quota.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use crate::driver::DevicePtr;
use crate::error::{ZeroForgeError, ZfResult};

/// One live allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationInfo {
    pub base: DevicePtr,
    pub size: usize,
}

struct TrackerInner {
    total_used: usize,
    peak_used: usize,
    dev_map: BTreeMap<u64, AllocationInfo>,
    host_to_dev: HashMap<u64, u64>,
}

/// Device pointer bookkeeping and quota enforcement
pub struct AllocationTracker {
    name: String,
    global_capacity: usize,
    inner: Mutex<TrackerInner>,
}

impl AllocationTracker {
    pub fn new(global_capacity: usize, name: impl Into<String>) -> Self {
        AllocationTracker {
            name: name.into(),
            global_capacity,
            inner: Mutex::new(TrackerInner {
                total_used: 0,
                peak_used: 0,
                dev_map: BTreeMap::new(),
                host_to_dev: HashMap::new(),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.global_capacity
    }

    pub fn total_used(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).total_used
    }

    pub fn peak_used(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).peak_used
    }

    /// Atomically admit or reject `bytes` against remaining capacity.
    /// A rejected reservation leaves all state unchanged.
    pub fn reserve(&self, bytes: usize) -> ZfResult<()> {
        let mut inner = self.inner.lock()?;
        if bytes > self.global_capacity - inner.total_used {
            return Err(ZeroForgeError::OutOfMemory(format!(
                "device {}: {} bytes requested, {} of {} in use",
                self.name, bytes, inner.total_used, self.global_capacity
            )));
        }
        inner.total_used += bytes;
        if inner.total_used > inner.peak_used {
            inner.peak_used = inner.total_used;
        }
        tracing::debug!(
            device = %self.name,
            used_mb = inner.total_used >> 20,
            "reserved device memory"
        );
        Ok(())
    }

    /// Return quota taken by a prior reservation
    pub fn release(&self, bytes: usize) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.total_used >= bytes {
            inner.total_used -= bytes;
            true
        } else {
            false
        }
    }

    /// Record a successful allocation
    pub fn record(&self, dev_ptr: DevicePtr, size: usize) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.dev_map.insert(
            dev_ptr.0,
            AllocationInfo {
                base: dev_ptr,
                size,
            },
        );
    }

    /// Record a host-pinned alias resolving to a device pointer
    pub fn record_host_alias(&self, host_ptr: DevicePtr, dev_ptr: DevicePtr) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.host_to_dev.insert(host_ptr.0, dev_ptr.0);
    }

    /// The allocation containing `ptr`, not only exact base matches
    pub fn get_by_dev(&self, ptr: DevicePtr) -> Option<AllocationInfo> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let (_, info) = inner.dev_map.range(..=ptr.0).next_back()?;
        if ptr.0 < info.base.0 + info.size as u64 {
            Some(*info)
        } else {
            None
        }
    }

    /// Resolve a host-pinned alias to its allocation record
    pub fn get_by_host(&self, host_ptr: DevicePtr) -> ZfResult<AllocationInfo> {
        let dev = {
            let inner = self.inner.lock()?;
            inner.host_to_dev.get(&host_ptr.0).copied()
        };
        let dev = dev.ok_or_else(|| {
            ZeroForgeError::InvalidSymbol(format!(
                "no allocation registered for host pointer {}",
                host_ptr
            ))
        })?;
        self.get_by_dev(DevicePtr(dev)).ok_or_else(|| {
            ZeroForgeError::InvalidDevicePointer(format!(
                "host alias {} resolves to unknown device pointer",
                host_ptr
            ))
        })
    }

    /// Drop the record for an allocation base; returns the record if present
    pub fn remove(&self, dev_ptr: DevicePtr) -> Option<AllocationInfo> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.host_to_dev.retain(|_, dev| *dev != dev_ptr.0);
        inner.dev_map.remove(&dev_ptr.0)
    }

    /// Take every recorded allocation and reset usage, for teardown
    pub fn drain(&self) -> Vec<AllocationInfo> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.host_to_dev.clear();
        inner.total_used = 0;
        let map = std::mem::take(&mut inner.dev_map);
        map.into_values().collect()
    }
}
