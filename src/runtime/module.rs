//! Modules, kernels and device variables
//!
//! A module wraps an immutable SPIR-V blob. Parameter metadata is parsed
//! once at construction; native compilation happens at most once per device
//! binding, behind a one-shot gate shared by concurrent callers.
//!
//! Device-resident global variables are discovered, sized, bound and
//! initialized by compiler-emitted shadow kernels: for a variable `V` the
//! module carries `__zf_var_info_V`, `__zf_var_bind_V` and
//! `__zf_var_init_V` entry points which the runtime invokes on the device
//! before any user kernel runs.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use once_cell::sync::OnceCell;

use crate::driver::{
    CtxHandle, DevHandle, DevicePtr, KernelHandle, KernelProperties, MemKind, NativeDriver,
};
use crate::error::{ZeroForgeError, ZfResult};
use crate::runtime::device::Device;
use crate::runtime::exec_item::{Dim3, ExecItem};
use crate::runtime::queue::Queue;
use crate::spirv::{self, KernelInfo};

/// Shadow kernel writing `{size, alignment, has_initializer}` for a variable
pub const VAR_INFO_PREFIX: &str = "__zf_var_info_";
/// Shadow kernel binding allocated storage to a variable
pub const VAR_BIND_PREFIX: &str = "__zf_var_bind_";
/// Shadow kernel running a variable's constant initializer
pub const VAR_INIT_PREFIX: &str = "__zf_var_init_";

/// Bytes the info shadow kernel writes per variable: three u64 fields
pub const VAR_INFO_SIZE: usize = 24;

/// A compiled kernel bound to one module and one device
pub struct Kernel {
    driver: Arc<dyn NativeDriver>,
    name: String,
    handle: KernelHandle,
    func_info: Arc<KernelInfo>,
    props: KernelProperties,
    host_ptr: Mutex<Option<usize>>,
}

impl std::fmt::Debug for Kernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kernel")
            .field("name", &self.name)
            .field("handle", &self.handle)
            .finish()
    }
}

impl Kernel {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn handle(&self) -> KernelHandle {
        self.handle
    }

    pub fn func_info(&self) -> &Arc<KernelInfo> {
        &self.func_info
    }

    pub fn properties(&self) -> KernelProperties {
        self.props
    }

    /// Host-function pointer used by host code to refer to this kernel
    pub fn host_ptr(&self) -> Option<usize> {
        *self.host_ptr.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_host_ptr(&self, ptr: usize) {
        *self.host_ptr.lock().unwrap_or_else(|e| e.into_inner()) = Some(ptr);
    }
}

impl Drop for Kernel {
    fn drop(&mut self) {
        let _ = self.driver.kernel_destroy(self.handle);
    }
}

/// A device-resident global variable
#[derive(Debug)]
pub struct DeviceVar {
    name: String,
    size: usize,
    state: Mutex<VarState>,
}

#[derive(Debug, Default)]
struct VarState {
    dev_addr: Option<DevicePtr>,
    alignment: usize,
    has_initializer: bool,
}

impl DeviceVar {
    pub fn new(name: impl Into<String>, size: usize) -> Self {
        DeviceVar {
            name: name.into(),
            size,
            state: Mutex::new(VarState::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// None iff storage is unallocated
    pub fn dev_addr(&self) -> Option<DevicePtr> {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).dev_addr
    }

    /// Alignment reported by the info shadow kernel; zero before binding
    pub fn alignment(&self) -> usize {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).alignment
    }

    pub fn has_initializer(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .has_initializer
    }

    fn bind(&self, addr: DevicePtr, alignment: usize, has_initializer: bool) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.dev_addr = Some(addr);
        state.alignment = alignment;
        state.has_initializer = has_initializer;
    }

    fn take_addr(&self) -> Option<DevicePtr> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .dev_addr
            .take()
    }
}

#[derive(Clone)]
struct Compiled {
    handle: crate::driver::ModuleHandle,
    kernels: Vec<Arc<Kernel>>,
}

struct VarTable {
    vars: Vec<Arc<DeviceVar>>,
    allocated: bool,
    initialized: bool,
}

/// An immutable compiled binary plus its kernels and device variables
pub struct Module {
    driver: Arc<dyn NativeDriver>,
    il: Arc<Vec<u8>>,
    func_infos: HashMap<String, Arc<KernelInfo>>,
    compiled: OnceCell<ZfResult<Compiled>>,
    vars: Mutex<VarTable>,
}

impl std::fmt::Debug for Module {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Module")
            .field("il_bytes", &self.il.len())
            .field("entry_points", &self.func_infos.len())
            .finish()
    }
}

impl Module {
    /// Wrap a SPIR-V blob, parsing kernel metadata once
    pub fn new(driver: Arc<dyn NativeDriver>, il: Arc<Vec<u8>>) -> ZfResult<Self> {
        let func_infos = spirv::parse_kernel_info(&il)?;
        Ok(Module {
            driver,
            il,
            func_infos,
            compiled: OnceCell::new(),
            vars: Mutex::new(VarTable {
                vars: Vec::new(),
                allocated: false,
                initialized: false,
            }),
        })
    }

    /// Idempotent native compilation: the first caller drives it, concurrent
    /// callers block on the gate and observe the same outcome.
    pub fn compile_once(
        &self,
        ctx: CtxHandle,
        dev: DevHandle,
        build_flags: &str,
    ) -> ZfResult<()> {
        let outcome = self
            .compiled
            .get_or_init(|| self.compile_impl(ctx, dev, build_flags));
        outcome.as_ref().map(|_| ()).map_err(|e| e.clone())
    }

    fn compile_impl(&self, ctx: CtxHandle, dev: DevHandle, build_flags: &str) -> ZfResult<Compiled> {
        tracing::debug!(il_bytes = self.il.len(), "compiling module");
        let handle = self.driver.module_create(ctx, dev, &self.il, build_flags)?;
        let names = self.driver.module_kernel_names(handle)?;
        let mut kernels = Vec::with_capacity(names.len());
        for name in names {
            let info = self.func_infos.get(&name).ok_or_else(|| {
                ZeroForgeError::InvalidSymbol(format!(
                    "kernel '{}' has no parameter metadata in the IL",
                    name
                ))
            })?;
            let kernel_handle = self.driver.kernel_create(handle, &name)?;
            let props = self.driver.kernel_properties(kernel_handle)?;
            kernels.push(Arc::new(Kernel {
                driver: self.driver.clone(),
                name,
                handle: kernel_handle,
                func_info: info.clone(),
                props,
                host_ptr: Mutex::new(None),
            }));
        }
        tracing::debug!(kernels = kernels.len(), "module compiled");
        Ok(Compiled { handle, kernels })
    }

    pub fn is_compiled(&self) -> bool {
        matches!(self.compiled.get(), Some(Ok(_)))
    }

    /// Kernels enumerated from the native module; empty before compilation
    pub fn kernels(&self) -> Vec<Arc<Kernel>> {
        match self.compiled.get() {
            Some(Ok(compiled)) => compiled.kernels.clone(),
            _ => Vec::new(),
        }
    }

    pub fn get_kernel(&self, name: &str) -> ZfResult<Arc<Kernel>> {
        self.kernels()
            .into_iter()
            .find(|k| k.name() == name)
            .ok_or_else(|| {
                ZeroForgeError::LaunchFailure(format!("failed to find kernel by name: {}", name))
            })
    }

    pub fn find_kernel_by_host_ptr(&self, host_ptr: usize) -> Option<Arc<Kernel>> {
        self.kernels()
            .into_iter()
            .find(|k| k.host_ptr() == Some(host_ptr))
    }

    pub fn add_device_variable(&self, var: Arc<DeviceVar>) {
        self.vars
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .vars
            .push(var);
    }

    pub fn get_global_var(&self, name: &str) -> Option<Arc<DeviceVar>> {
        self.vars
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .vars
            .iter()
            .find(|v| v.name() == name)
            .cloned()
    }

    pub fn vars_allocated(&self) -> bool {
        self.vars.lock().unwrap_or_else(|e| e.into_inner()).allocated
    }

    pub fn vars_initialized(&self) -> bool {
        self.vars.lock().unwrap_or_else(|e| e.into_inner()).initialized
    }

    /// Allocate and bind storage for every device variable in this module
    pub fn allocate_device_variables(&self, device: &Device, queue: &Arc<Queue>) -> ZfResult<()> {
        let mut table = self.vars.lock()?;
        self.allocate_locked(&mut table, device, queue)
    }

    /// Allocate (if needed) and run constant initializers for variables that
    /// declare one
    pub fn initialize_device_variables(&self, device: &Device, queue: &Arc<Queue>) -> ZfResult<()> {
        let mut table = self.vars.lock()?;
        self.allocate_locked(&mut table, device, queue)?;

        if table.initialized {
            return Ok(());
        }
        tracing::trace!("initializing device variables");

        let mut queued = false;
        for var in table.vars.clone() {
            if !var.has_initializer() {
                continue;
            }
            let kernel = self.get_kernel(&format!("{}{}", VAR_INIT_PREFIX, var.name()))?;
            queue_shadow_kernel(queue, kernel, None)?;
            queued = true;
        }
        if queued {
            queue.finish()?;
        }
        table.initialized = true;
        Ok(())
    }

    fn allocate_locked(
        &self,
        table: &mut VarTable,
        device: &Device,
        queue: &Arc<Queue>,
    ) -> ZfResult<()> {
        // a module without variables is trivially allocated and initialized
        if table.vars.is_empty() {
            table.allocated = true;
            table.initialized = true;
            return Ok(());
        }
        if table.allocated {
            return Ok(());
        }
        // shadow kernels live in this module; make sure it is compiled
        device.ensure_compiled(self)?;
        tracing::trace!(vars = table.vars.len(), "allocating device variable storage");

        let count = table.vars.len();
        let scratch_size = count * VAR_INFO_SIZE;
        let scratch = device.allocate(scratch_size, 8, MemKind::Shared)?;

        // gather size/alignment/initializer info via the info shadow kernels
        for (i, var) in table.vars.iter().enumerate() {
            let kernel = self.get_kernel(&format!("{}{}", VAR_INFO_PREFIX, var.name()))?;
            queue_shadow_kernel(queue, kernel, Some(scratch.offset(i * VAR_INFO_SIZE)))?;
        }
        let mut host_info = vec![0u8; scratch_size];
        queue.mem_copy_async(
            DevicePtr::from_host_slice_mut(&mut host_info),
            scratch,
            scratch_size,
        )?;
        queue.finish()?;

        // allocate storage and bind it on the device
        for (i, var) in table.vars.iter().enumerate() {
            let info = &host_info[i * VAR_INFO_SIZE..(i + 1) * VAR_INFO_SIZE];
            let size = u64::from_le_bytes(info[0..8].try_into().expect("8-byte field")) as usize;
            let alignment =
                u64::from_le_bytes(info[8..16].try_into().expect("8-byte field")) as usize;
            let has_initializer =
                u64::from_le_bytes(info[16..24].try_into().expect("8-byte field")) != 0;
            if size == 0 || alignment == 0 {
                return Err(ZeroForgeError::InvalidValue(format!(
                    "device variable '{}' reported size {} alignment {}",
                    var.name(),
                    size,
                    alignment
                )));
            }
            if size != var.size() {
                tracing::warn!(
                    var = var.name(),
                    registered = var.size(),
                    reported = size,
                    "device variable size discrepancy"
                );
            }

            let storage = device.allocate(size, alignment, MemKind::Shared)?;
            var.bind(storage, alignment, has_initializer);

            let kernel = self.get_kernel(&format!("{}{}", VAR_BIND_PREFIX, var.name()))?;
            queue_shadow_kernel(queue, kernel, Some(storage))?;
        }
        queue.finish()?;
        table.allocated = true;

        device.free(scratch)?;
        Ok(())
    }

    /// Drop the initialized flag without freeing storage
    pub fn invalidate_device_variables(&self) {
        self.vars
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .initialized = false;
    }

    /// Free variable storage and clear both lifecycle flags
    pub fn deallocate_device_variables(&self, device: &Device) -> ZfResult<()> {
        let mut table = self.vars.lock()?;
        table.initialized = false;
        for var in &table.vars {
            if let Some(addr) = var.take_addr() {
                device.free(addr)?;
            }
        }
        table.allocated = false;
        Ok(())
    }
}

impl Drop for Module {
    fn drop(&mut self) {
        if let Some(Ok(compiled)) = self.compiled.get() {
            let _ = self.driver.module_destroy(compiled.handle);
        }
    }
}

/// Launch a shadow kernel with a single-thread grid
fn queue_shadow_kernel(
    queue: &Arc<Queue>,
    kernel: Arc<Kernel>,
    arg: Option<DevicePtr>,
) -> ZfResult<()> {
    let mut item = ExecItem::new(Dim3::new(1, 1, 1), Dim3::new(1, 1, 1), 0);
    if let Some(ptr) = arg {
        item.set_arg(&ptr.0.to_le_bytes(), 0);
    }
    item.set_kernel(kernel);
    queue.launch(item)?;
    Ok(())
}
