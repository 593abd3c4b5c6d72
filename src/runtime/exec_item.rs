//! Kernel-launch descriptors
//!
//! An [`ExecItem`] bundles everything one dispatch needs: grid and block
//! dimensions, dynamic shared memory, the target kernel, and a packed
//! argument buffer together with the `(offset, size)` tuples recording how
//! it was built. The item is consumed by `Queue::launch`.

use std::sync::Arc;

use crate::driver::NativeDriver;
use crate::error::{ZeroForgeError, ZfResult};
use crate::runtime::module::Kernel;
use crate::runtime::queue::Queue;

/// Grid or block dimensions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dim3 {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl Dim3 {
    pub fn new(x: u32, y: u32, z: u32) -> Self {
        Dim3 { x, y, z }
    }

    pub fn total(&self) -> u64 {
        self.x as u64 * self.y as u64 * self.z as u64
    }
}

impl From<u32> for Dim3 {
    fn from(x: u32) -> Self {
        Dim3 { x, y: 1, z: 1 }
    }
}

impl From<(u32, u32, u32)> for Dim3 {
    fn from((x, y, z): (u32, u32, u32)) -> Self {
        Dim3 { x, y, z }
    }
}

/// One-shot launch descriptor
#[derive(Default)]
pub struct ExecItem {
    grid: Dim3,
    block: Dim3,
    shared_mem: usize,
    queue: Option<Arc<Queue>>,
    kernel: Option<Arc<Kernel>>,
    arg_data: Vec<u8>,
    offset_sizes: Vec<(usize, usize)>,
}

impl Default for Dim3 {
    fn default() -> Self {
        Dim3 { x: 1, y: 1, z: 1 }
    }
}

impl ExecItem {
    pub fn new(grid: Dim3, block: Dim3, shared_mem: usize) -> Self {
        ExecItem {
            grid,
            block,
            shared_mem,
            queue: None,
            kernel: None,
            arg_data: Vec::new(),
            offset_sizes: Vec::new(),
        }
    }

    /// Target queue for the configure-call convention; launches fall back
    /// to the active queue when unset
    pub fn set_queue(&mut self, queue: Arc<Queue>) {
        self.queue = Some(queue);
    }

    pub fn queue(&self) -> Option<&Arc<Queue>> {
        self.queue.as_ref()
    }

    pub fn grid(&self) -> Dim3 {
        self.grid
    }

    pub fn block(&self) -> Dim3 {
        self.block
    }

    pub fn shared_mem(&self) -> usize {
        self.shared_mem
    }

    pub fn set_kernel(&mut self, kernel: Arc<Kernel>) {
        self.kernel = Some(kernel);
    }

    pub fn kernel(&self) -> Option<&Arc<Kernel>> {
        self.kernel.as_ref()
    }

    /// Copy an argument value into the packed buffer at `offset`.
    ///
    /// The buffer is grown exactly to the maximum `offset + size` observed.
    pub fn set_arg(&mut self, data: &[u8], offset: usize) {
        let end = offset + data.len();
        if end > self.arg_data.len() {
            self.arg_data.resize(end, 0);
        }
        self.arg_data[offset..end].copy_from_slice(data);
        tracing::debug!(size = data.len(), offset, "ExecItem::set_arg");
        self.offset_sizes.push((offset, data.len()));
    }

    pub fn arg_data(&self) -> &[u8] {
        &self.arg_data
    }

    pub fn num_args(&self) -> usize {
        self.offset_sizes.len()
    }

    /// Bind the packed arguments into the kernel handle per its
    /// parameter-layout record, setting each parameter by index.
    ///
    /// Fails with `LaunchFailure` when the buffer does not match the
    /// kernel's declared parameters.
    pub(crate) fn bind_args(&self, driver: &dyn NativeDriver) -> ZfResult<()> {
        let kernel = self.kernel.as_ref().ok_or_else(|| {
            ZeroForgeError::LaunchFailure("launch descriptor has no kernel".to_string())
        })?;
        let info = kernel.func_info();

        let mut tuples = self.offset_sizes.clone();
        tuples.sort_by_key(|(offset, _)| *offset);

        if tuples.len() != info.num_args() {
            return Err(ZeroForgeError::LaunchFailure(format!(
                "kernel '{}' expects {} arguments, launch supplied {}",
                kernel.name(),
                info.num_args(),
                tuples.len()
            )));
        }

        for (index, (offset, size)) in tuples.iter().enumerate() {
            let expected = info.args[index].size;
            if *size != expected {
                return Err(ZeroForgeError::LaunchFailure(format!(
                    "kernel '{}' argument {}: got {} bytes, expected {}",
                    kernel.name(),
                    index,
                    size,
                    expected
                )));
            }
            let end = offset + size;
            if end > self.arg_data.len() {
                return Err(ZeroForgeError::LaunchFailure(format!(
                    "kernel '{}' argument {} overruns the packed buffer",
                    kernel.name(),
                    index
                )));
            }
            driver.kernel_set_arg(kernel.handle(), index as u32, &self.arg_data[*offset..end])?;
        }
        Ok(())
    }
}
