//! Device management
//!
//! A device owns its queues and modules and the per-device allocation
//! tracker. Queue creation distributes physical queue indices round-robin
//! within the chosen queue group; memory operations fall back to the
//! compute group when the device exposes no copy engines.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::driver::{
    DevHandle, DeviceProperties, DevicePtr, MemKind, NativeDriver, QueueGroupProperties, QueueKind,
};
use crate::error::{ZeroForgeError, ZfResult};
use crate::runtime::backend::{BackendConfig, CallbackQueue, ModuleId};
use crate::runtime::context::Context;
use crate::runtime::module::{DeviceVar, Kernel, Module};
use crate::runtime::queue::{Queue, QueueFlags};
use crate::runtime::tracker::AllocationTracker;

struct RoundRobin {
    compute: u32,
    copy: u32,
}

struct DeviceInner {
    queues: Vec<Arc<Queue>>,
    modules: HashMap<ModuleId, Arc<Module>>,
    /// host pointer -> owning module + variable
    var_lookup: HashMap<usize, (ModuleId, Arc<DeviceVar>)>,
}

/// One GPU as seen by the runtime
pub struct Device {
    driver: Arc<dyn NativeDriver>,
    ctx: Arc<Context>,
    handle: DevHandle,
    index: u32,
    props: DeviceProperties,
    compute_group: QueueGroupProperties,
    copy_group: Option<QueueGroupProperties>,
    jit_flags: String,
    use_imm_lists: bool,
    tracker: AllocationTracker,
    callbacks: Arc<CallbackQueue>,
    round_robin: Mutex<RoundRobin>,
    inner: Mutex<DeviceInner>,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("index", &self.index)
            .field("name", &self.props.name)
            .finish()
    }
}

impl Device {
    pub(crate) fn new(
        driver: Arc<dyn NativeDriver>,
        ctx: Arc<Context>,
        index: u32,
        callbacks: Arc<CallbackQueue>,
        config: &BackendConfig,
    ) -> ZfResult<Arc<Self>> {
        let handle = driver.device_handle(index)?;
        let props = driver.device_properties(handle)?;
        let groups = driver.queue_group_properties(handle)?;
        let compute_group = groups
            .iter()
            .find(|g| g.kind == QueueKind::Compute)
            .cloned()
            .ok_or_else(|| {
                ZeroForgeError::InitializationError(format!(
                    "device {} exposes no compute queue group",
                    props.name
                ))
            })?;
        let copy_group = groups.iter().find(|g| g.kind == QueueKind::Copy).cloned();
        let use_imm_lists = config.use_immediate_cmd_lists && props.immediate_cmd_lists;

        tracing::info!(
            device = %props.name,
            index,
            total_mem_mb = props.total_mem_bytes >> 20,
            copy_engines = copy_group.as_ref().map(|g| g.num_queues).unwrap_or(0),
            immediate_lists = use_imm_lists,
            "initialized device"
        );

        Ok(Arc::new(Device {
            driver,
            ctx,
            handle,
            index,
            tracker: AllocationTracker::new(props.total_mem_bytes as usize, props.name.clone()),
            props,
            compute_group,
            copy_group,
            jit_flags: config.jit_flags.clone().unwrap_or_default(),
            use_imm_lists,
            callbacks,
            round_robin: Mutex::new(RoundRobin { compute: 0, copy: 0 }),
            inner: Mutex::new(DeviceInner {
                queues: Vec::new(),
                modules: HashMap::new(),
                var_lookup: HashMap::new(),
            }),
        }))
    }

    pub fn handle(&self) -> DevHandle {
        self.handle
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn name(&self) -> &str {
        &self.props.name
    }

    pub fn properties(&self) -> &DeviceProperties {
        &self.props
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.ctx
    }

    pub fn tracker(&self) -> &AllocationTracker {
        &self.tracker
    }

    pub fn used_global_mem(&self) -> usize {
        self.tracker.total_used()
    }

    /// Create a queue, choosing the next physical index within the group
    /// round-robin. A copy-queue request on a device with no copy group
    /// falls back to the compute group.
    pub fn create_queue(
        self: &Arc<Self>,
        flags: QueueFlags,
        priority: i32,
        kind: QueueKind,
    ) -> ZfResult<Arc<Queue>> {
        let (group, index, actual_kind) = self.next_queue_slot(kind);
        let queue = Queue::new(
            self.driver.clone(),
            self.ctx.clone(),
            self.handle,
            Arc::downgrade(self),
            self.callbacks.clone(),
            actual_kind,
            group.ordinal,
            index,
            priority,
            flags,
            self.use_imm_lists,
            group.max_fill_pattern_size,
        )?;
        self.inner.lock()?.queues.push(queue.clone());
        Ok(queue)
    }

    fn next_queue_slot(&self, kind: QueueKind) -> (QueueGroupProperties, u32, QueueKind) {
        let mut rr = self.round_robin.lock().unwrap_or_else(|e| e.into_inner());
        match (&self.copy_group, kind) {
            (Some(copy), QueueKind::Copy) => {
                let index = rr.copy % copy.num_queues;
                rr.copy = rr.copy.wrapping_add(1);
                (copy.clone(), index, QueueKind::Copy)
            }
            _ => {
                let index = rr.compute % self.compute_group.num_queues;
                rr.compute = rr.compute.wrapping_add(1);
                (self.compute_group.clone(), index, QueueKind::Compute)
            }
        }
    }

    /// The default queue, created first at backend initialization
    pub fn default_queue(&self) -> Option<Arc<Queue>> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .queues
            .first()
            .cloned()
    }

    pub fn queues(&self) -> Vec<Arc<Queue>> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .queues
            .clone()
    }

    /// Allocate device-visible memory against this device's quota
    pub fn allocate(&self, size: usize, alignment: usize, kind: MemKind) -> ZfResult<DevicePtr> {
        self.ctx
            .allocate_with(&self.tracker, self.handle, kind, size, alignment)
    }

    /// Free a device allocation made through [`Device::allocate`]
    pub fn free(&self, ptr: DevicePtr) -> ZfResult<()> {
        self.ctx.free_with(&self.tracker, ptr)
    }

    pub(crate) fn register_module(&self, id: ModuleId, il: Arc<Vec<u8>>) -> ZfResult<()> {
        let module = Module::new(self.driver.clone(), il)?;
        self.inner.lock()?.modules.insert(id, Arc::new(module));
        Ok(())
    }

    pub fn module(&self, id: ModuleId) -> ZfResult<Arc<Module>> {
        self.inner
            .lock()?
            .modules
            .get(&id)
            .cloned()
            .ok_or_else(|| {
                ZeroForgeError::InvalidHandle(format!("module {} is not registered", id))
            })
    }

    pub(crate) fn unregister_module(&self, id: ModuleId) -> ZfResult<()> {
        let module = {
            let mut inner = self.inner.lock()?;
            inner.var_lookup.retain(|_, (owner, _)| *owner != id);
            inner.modules.remove(&id)
        };
        if let Some(module) = module {
            module.deallocate_device_variables(self)?;
        }
        Ok(())
    }

    /// Compile the module for this device (at most once) and bind the host
    /// function pointer to the named kernel
    pub fn register_function_as_kernel(
        &self,
        id: ModuleId,
        host_ptr: usize,
        name: &str,
    ) -> ZfResult<()> {
        let module = self.module(id)?;
        module.compile_once(self.ctx.handle(), self.handle, &self.jit_flags)?;
        let kernel = module.get_kernel(name)?;
        kernel.set_host_ptr(host_ptr);
        tracing::debug!(
            device = %self.props.name,
            kernel = name,
            "registered host function as kernel"
        );
        Ok(())
    }

    pub fn register_device_variable(
        &self,
        id: ModuleId,
        host_ptr: usize,
        name: &str,
        size: usize,
    ) -> ZfResult<()> {
        let module = self.module(id)?;
        let var = Arc::new(DeviceVar::new(name, size));
        module.add_device_variable(var.clone());
        self.inner.lock()?.var_lookup.insert(host_ptr, (id, var));
        Ok(())
    }

    /// Drive the module's one-shot native compilation for this device
    pub(crate) fn ensure_compiled(&self, module: &Module) -> ZfResult<()> {
        module.compile_once(self.ctx.handle(), self.handle, &self.jit_flags)
    }

    pub fn find_kernel_by_host_ptr(&self, host_ptr: usize) -> ZfResult<Arc<Kernel>> {
        let modules: Vec<Arc<Module>> = {
            let inner = self.inner.lock()?;
            inner.modules.values().cloned().collect()
        };
        for module in modules {
            if let Some(kernel) = module.find_kernel_by_host_ptr(host_ptr) {
                return Ok(kernel);
            }
        }
        Err(ZeroForgeError::LaunchFailure(format!(
            "no kernel registered for host pointer 0x{:x}",
            host_ptr
        )))
    }

    pub fn get_global_var(&self, host_ptr: usize) -> Option<Arc<DeviceVar>> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .var_lookup
            .get(&host_ptr)
            .map(|(_, var)| var.clone())
    }

    fn modules_snapshot(&self) -> Vec<Arc<Module>> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .modules
            .values()
            .cloned()
            .collect()
    }

    fn active_queue(&self) -> ZfResult<Arc<Queue>> {
        self.default_queue().ok_or_else(|| {
            ZeroForgeError::Unknown("device has no queues".to_string())
        })
    }

    /// Allocate storage for every module's device variables
    pub fn allocate_device_variables(&self) -> ZfResult<()> {
        let queue = self.active_queue()?;
        for module in self.modules_snapshot() {
            module.allocate_device_variables(self, &queue)?;
        }
        Ok(())
    }

    /// Allocate and initialize every module's device variables
    pub fn initialize_device_variables(&self) -> ZfResult<()> {
        let queue = self.active_queue()?;
        for module in self.modules_snapshot() {
            module.initialize_device_variables(self, &queue)?;
        }
        Ok(())
    }

    /// Mark every module's variables uninitialized without freeing storage
    pub fn invalidate_device_variables(&self) {
        for module in self.modules_snapshot() {
            module.invalidate_device_variables();
        }
    }

    /// Free variable storage across all modules
    pub fn deallocate_device_variables(&self) -> ZfResult<()> {
        for module in self.modules_snapshot() {
            module.deallocate_device_variables(self)?;
        }
        Ok(())
    }

    /// Block until every queue on this device is idle
    pub fn finish_all(&self) -> ZfResult<()> {
        for queue in self.queues() {
            queue.finish()?;
        }
        Ok(())
    }

    /// Finish queues, release variables and remaining allocations
    pub(crate) fn teardown(&self) {
        for queue in self.queues() {
            if let Err(e) = queue.finish() {
                tracing::warn!(error = %e, "queue finish failed during teardown");
            }
        }
        if let Err(e) = self.deallocate_device_variables() {
            tracing::warn!(error = %e, "device variable teardown failed");
        }
        for info in self.tracker.drain() {
            if let Err(e) = self.driver.mem_free(self.ctx.handle(), info.base) {
                tracing::warn!(ptr = %info.base, error = %e, "leak: failed to free allocation");
            }
        }
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.modules.clear();
        inner.var_lookup.clear();
        inner.queues.clear();
    }
}
