//! Process-wide backend
//!
//! The root of the runtime object graph: owns the contexts and devices,
//! tracks the active device, holds the pending host-callback FIFO and the
//! in-construction launch stack for the configure-call convention, and runs
//! the event monitor. A lazily initialized process-wide instance is
//! available through [`Backend::global`]; isolated instances can be built
//! directly for embedding and tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::driver::soft::SoftDriver;
use crate::driver::{DevicePtr, MemKind, NativeDriver, QueueKind};
use crate::error::{ZeroForgeError, ZfResult};
use crate::runtime::context::Context;
use crate::runtime::device::Device;
use crate::runtime::event::Event;
use crate::runtime::exec_item::{Dim3, ExecItem};
use crate::runtime::monitor::EventMonitor;
use crate::runtime::queue::{Queue, QueueFlags};

/// Identifier handed out when a module blob is registered
pub type ModuleId = u64;

/// A host function run by the event monitor once its stream is ready.
/// Receives the stream status at the callback point.
pub type CallbackFn = Box<dyn FnOnce(ZfResult<()>) + Send + 'static>;

/// One pending host callback and its choreography events
pub struct CallbackRecord {
    pub callback: CallbackFn,
    pub gpu_ready: Arc<Event>,
    pub cpu_done: Arc<Event>,
    pub gpu_ack: Arc<Event>,
}

/// FIFO of pending host callbacks, drained by the event monitor
pub struct CallbackQueue {
    inner: Mutex<VecDeque<CallbackRecord>>,
}

impl Default for CallbackQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl CallbackQueue {
    pub fn new() -> Self {
        CallbackQueue {
            inner: Mutex::new(VecDeque::new()),
        }
    }

    pub fn push(&self, record: CallbackRecord) {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(record);
    }

    pub fn pop(&self) -> Option<CallbackRecord> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).is_empty()
    }
}

/// Backend settings, read once at initialization
#[derive(Debug, Clone)]
pub struct BackendConfig {
    /// Use immediate command lists when the device supports them
    pub use_immediate_cmd_lists: bool,
    /// JIT compiler flag override for module builds
    pub jit_flags: Option<String>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig {
            use_immediate_cmd_lists: true,
            jit_flags: None,
        }
    }
}

impl BackendConfig {
    /// Read `ZEROFORGE_IMM_CMD_LISTS` and `ZEROFORGE_JIT_FLAGS`
    pub fn from_env() -> Self {
        let use_immediate_cmd_lists = match std::env::var("ZEROFORGE_IMM_CMD_LISTS") {
            Ok(value) => !matches!(value.to_lowercase().as_str(), "0" | "false" | "off"),
            Err(_) => true,
        };
        let jit_flags = std::env::var("ZEROFORGE_JIT_FLAGS").ok();
        BackendConfig {
            use_immediate_cmd_lists,
            jit_flags,
        }
    }
}

static GLOBAL_BACKEND: Mutex<Option<Arc<Backend>>> = Mutex::new(None);
static GLOBAL_INIT_CALLED: AtomicBool = AtomicBool::new(false);

/// Process-wide runtime root
pub struct Backend {
    driver: Arc<dyn NativeDriver>,
    contexts: Vec<Arc<Context>>,
    devices: Vec<Arc<Device>>,
    callbacks: Arc<CallbackQueue>,
    active_device: Mutex<usize>,
    exec_stack: Mutex<Vec<ExecItem>>,
    next_module_id: AtomicU64,
    modules: Mutex<HashMap<ModuleId, Arc<Vec<u8>>>>,
    monitor: Mutex<Option<EventMonitor>>,
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend")
            .field("devices", &self.devices.len())
            .finish()
    }
}

impl Backend {
    /// Build a backend over the given driver: enumerate devices, create one
    /// context and a default queue per device, start the event monitor.
    pub fn initialize(driver: Arc<dyn NativeDriver>, config: BackendConfig) -> ZfResult<Arc<Self>> {
        crate::logging::init_logging_from_env();
        driver.init()?;

        let count = driver.device_count()?;
        if count == 0 {
            return Err(ZeroForgeError::InitializationError(
                "no devices were initialized".to_string(),
            ));
        }
        let first = driver.device_properties(driver.device_handle(0)?)?;
        let ctx = Context::new(
            driver.clone(),
            first.timer_resolution_ns,
            first.timestamp_valid_bits,
        )?;

        let callbacks = Arc::new(CallbackQueue::new());
        let mut devices = Vec::with_capacity(count as usize);
        for index in 0..count {
            let device = Device::new(
                driver.clone(),
                ctx.clone(),
                index,
                callbacks.clone(),
                &config,
            )?;
            // the default queue is always first in the device's queue list
            device.create_queue(QueueFlags::default(), 0, QueueKind::Compute)?;
            devices.push(device);
        }

        let monitor = EventMonitor::start(vec![ctx.clone()], callbacks.clone());
        tracing::info!(devices = devices.len(), "backend initialized");
        Ok(Arc::new(Backend {
            driver,
            contexts: vec![ctx],
            devices,
            callbacks,
            active_device: Mutex::new(0),
            exec_stack: Mutex::new(Vec::new()),
            next_module_id: AtomicU64::new(1),
            modules: Mutex::new(HashMap::new()),
            monitor: Mutex::new(Some(monitor)),
        }))
    }

    /// The process-wide backend, lazily initialized on first use over the
    /// software driver with environment configuration.
    pub fn global() -> ZfResult<Arc<Backend>> {
        if GLOBAL_INIT_CALLED.load(Ordering::Acquire) {
            return Ok(GLOBAL_BACKEND
                .lock()?
                .as_ref()
                .map(Arc::clone)
                .expect("global backend initialized but not set"));
        }
        let mut guard = GLOBAL_BACKEND.lock()?;
        if let Some(backend) = guard.as_ref() {
            return Ok(backend.clone());
        }
        let backend = Self::initialize(Arc::new(SoftDriver::new()), BackendConfig::from_env())?;
        *guard = Some(backend.clone());
        GLOBAL_INIT_CALLED.store(true, Ordering::Release);
        Ok(backend)
    }

    pub fn driver(&self) -> &Arc<dyn NativeDriver> {
        &self.driver
    }

    pub fn devices(&self) -> &[Arc<Device>] {
        &self.devices
    }

    pub fn num_devices(&self) -> usize {
        self.devices.len()
    }

    pub fn callback_queue(&self) -> &Arc<CallbackQueue> {
        &self.callbacks
    }

    pub fn set_active_device(&self, index: usize) -> ZfResult<()> {
        if index >= self.devices.len() {
            return Err(ZeroForgeError::InvalidValue(format!(
                "device index {} out of range ({} devices)",
                index,
                self.devices.len()
            )));
        }
        *self.active_device.lock()? = index;
        Ok(())
    }

    pub fn active_device(&self) -> Arc<Device> {
        let index = *self.active_device.lock().unwrap_or_else(|e| e.into_inner());
        self.devices[index].clone()
    }

    pub fn active_context(&self) -> Arc<Context> {
        self.active_device().context().clone()
    }

    pub fn active_queue(&self) -> ZfResult<Arc<Queue>> {
        self.active_device().default_queue().ok_or_else(|| {
            ZeroForgeError::Unknown("active device has no queues".to_string())
        })
    }

    /// Acquire a user-visible event from the active context's pools
    pub fn create_event(&self) -> ZfResult<Arc<Event>> {
        self.active_context().get_event()
    }

    /// Register a compiled module blob with every device
    pub fn register_module(&self, il: Vec<u8>) -> ZfResult<ModuleId> {
        let id = self.next_module_id.fetch_add(1, Ordering::Relaxed);
        let il = Arc::new(il);
        for device in &self.devices {
            device.register_module(id, il.clone())?;
        }
        self.modules.lock()?.insert(id, il);
        tracing::debug!(module = id, "registered module");
        Ok(id)
    }

    pub fn unregister_module(&self, id: ModuleId) -> ZfResult<()> {
        if self.modules.lock()?.remove(&id).is_none() {
            tracing::warn!(module = id, "unregister of unknown module");
            return Ok(());
        }
        for device in &self.devices {
            device.unregister_module(id)?;
        }
        Ok(())
    }

    /// Bind a host function pointer to the named kernel on every device,
    /// compiling the module where needed
    pub fn register_function_as_kernel(
        &self,
        id: ModuleId,
        host_ptr: usize,
        name: &str,
    ) -> ZfResult<()> {
        for device in &self.devices {
            device.register_function_as_kernel(id, host_ptr, name)?;
        }
        Ok(())
    }

    /// Declare a device-resident global variable on every device
    pub fn register_device_variable(
        &self,
        id: ModuleId,
        host_ptr: usize,
        name: &str,
        size: usize,
    ) -> ZfResult<()> {
        for device in &self.devices {
            device.register_device_variable(id, host_ptr, name, size)?;
        }
        Ok(())
    }

    /// Run the device-variable lifecycle protocol on every device
    pub fn initialize_device_variables(&self) -> ZfResult<()> {
        for device in &self.devices {
            device.initialize_device_variables()?;
        }
        Ok(())
    }

    /// Push an in-construction launch descriptor (configure-call convention)
    pub fn configure_call(
        &self,
        grid: Dim3,
        block: Dim3,
        shared_mem: usize,
        queue: Option<Arc<Queue>>,
    ) -> ZfResult<()> {
        tracing::debug!(?grid, ?block, shared_mem, "configure_call");
        let mut item = ExecItem::new(grid, block, shared_mem);
        if let Some(queue) = queue {
            item.set_queue(queue);
        }
        self.exec_stack.lock()?.push(item);
        Ok(())
    }

    /// Append an argument to the launch descriptor on top of the stack
    pub fn set_arg(&self, data: &[u8], offset: usize) -> ZfResult<()> {
        let mut stack = self.exec_stack.lock()?;
        let item = stack.last_mut().ok_or_else(|| {
            ZeroForgeError::InvalidValue("set_arg without a configured call".to_string())
        })?;
        item.set_arg(data, offset);
        Ok(())
    }

    /// Pop the launch descriptor and dispatch the kernel registered for the
    /// given host function pointer
    pub fn launch_from_stack(&self, host_ptr: usize) -> ZfResult<Arc<Event>> {
        let mut item = self.exec_stack.lock()?.pop().ok_or_else(|| {
            ZeroForgeError::InvalidValue("launch without a configured call".to_string())
        })?;
        let device = self.active_device();
        let kernel = device.find_kernel_by_host_ptr(host_ptr)?;
        item.set_kernel(kernel);
        let queue = match item.queue() {
            Some(queue) => queue.clone(),
            None => self.active_queue()?,
        };
        queue.launch(item)
    }

    /// Allocate shared memory on the active device
    pub fn allocate(&self, size: usize) -> ZfResult<DevicePtr> {
        self.allocate_with(size, 0, MemKind::Shared)
    }

    pub fn allocate_with(
        &self,
        size: usize,
        alignment: usize,
        kind: MemKind,
    ) -> ZfResult<DevicePtr> {
        self.active_device().allocate(size, alignment, kind)
    }

    /// Free an allocation on the active device.
    /// Unknown pointers fail with `InvalidDevicePointer`.
    pub fn free(&self, ptr: DevicePtr) -> ZfResult<()> {
        self.active_device().free(ptr)
    }

    /// Block until every queue on every device is idle
    pub fn finish_all(&self) -> ZfResult<()> {
        for device in &self.devices {
            device.finish_all()?;
        }
        Ok(())
    }

    /// Tear down the runtime: join the monitor, finish every queue, release
    /// allocations, destroy contexts in reverse creation order.
    pub fn uninitialize(&self) -> ZfResult<()> {
        tracing::info!("backend uninitialize");
        if let Some(mut monitor) = self.monitor.lock()?.take() {
            monitor.stop_and_join();
        }
        for device in &self.devices {
            device.teardown();
        }
        for ctx in self.contexts.iter().rev() {
            if let Err(e) = ctx.teardown() {
                tracing::warn!(error = %e, "context teardown failed");
            }
        }
        Ok(())
    }
}

impl Drop for Backend {
    fn drop(&mut self) {
        let _ = self.uninitialize();
    }
}
