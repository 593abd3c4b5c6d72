//! Native driver interface
//!
//! The runtime core talks to device hardware through this capability trait,
//! modeled on a Level-Zero-shaped command-submission API: contexts, command
//! queues and lists (regular and immediate), event pools, fences, modules
//! and kernels. The core never knows which concrete driver sits behind the
//! trait object.

pub mod soft;

use std::fmt;

/// Native driver error types
#[derive(Debug, Clone, thiserror::Error)]
pub enum DriverError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("invalid handle: {0}")]
    InvalidHandle(String),
    #[error("out of device memory: {0}")]
    OutOfMemory(String),
    #[error("not ready")]
    NotReady,
    #[error("not found: {0}")]
    NotFound(String),
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("device lost: {0}")]
    DeviceLost(String),
}

/// Native driver result type
pub type DriverResult<T> = std::result::Result<T, DriverError>;

/// Opaque native context handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CtxHandle(pub u64);

/// Opaque native device handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DevHandle(pub u32);

/// Opaque native command queue handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueueHandle(pub u64);

/// Opaque native command list handle (regular or immediate)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CmdListHandle(pub u64);

/// Opaque native event pool handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventPoolHandle(pub u64);

/// Opaque native event handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventHandle(pub u64);

/// Opaque native fence handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FenceHandle(pub u64);

/// Opaque native module handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModuleHandle(pub u64);

/// Opaque native kernel handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KernelHandle(pub u64);

/// Opaque native image handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageHandle(pub u64);

/// A device-visible address.
///
/// Memory operations accept any address the driver can reach: device
/// allocations, shared allocations and plain host memory alike.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DevicePtr(pub u64);

impl DevicePtr {
    pub const NULL: DevicePtr = DevicePtr(0);

    pub fn is_null(&self) -> bool {
        self.0 == 0
    }

    /// Address of a host slice, for host-side endpoints of memory operations
    pub fn from_host_slice<T>(slice: &[T]) -> Self {
        DevicePtr(slice.as_ptr() as u64)
    }

    /// Address of a mutable host slice
    pub fn from_host_slice_mut<T>(slice: &mut [T]) -> Self {
        DevicePtr(slice.as_mut_ptr() as u64)
    }

    /// Byte offset from this address
    pub fn offset(&self, bytes: usize) -> Self {
        DevicePtr(self.0 + bytes as u64)
    }
}

impl fmt::Display for DevicePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

/// Memory allocation kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemKind {
    /// Host-resident, device-accessible
    Host,
    /// Device-resident
    Device,
    /// Migratable between host and device
    Shared,
}

/// Physical queue group kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    Compute,
    Copy,
}

/// Properties of one physical queue group on a device
#[derive(Debug, Clone)]
pub struct QueueGroupProperties {
    pub kind: QueueKind,
    /// Queue group ordinal used when creating queues and command lists
    pub ordinal: u32,
    /// Number of independent physical queues in this group
    pub num_queues: u32,
    /// Largest fill pattern the group accepts, in bytes
    pub max_fill_pattern_size: usize,
}

/// Device properties reported by the native driver
#[derive(Debug, Clone)]
pub struct DeviceProperties {
    pub name: String,
    pub total_mem_bytes: u64,
    /// Nanoseconds per device timestamp tick
    pub timer_resolution_ns: u64,
    /// Number of valid bits in device timestamps; values wrap above this
    pub timestamp_valid_bits: u32,
    pub max_group_size: u32,
    pub on_demand_paging: bool,
    pub float_atomics: bool,
    /// Whether the device supports immediate command lists
    pub immediate_cmd_lists: bool,
}

/// Kernel properties reported after native compilation
#[derive(Debug, Clone, Copy)]
pub struct KernelProperties {
    pub max_group_size: u32,
    pub private_mem_size: usize,
    pub local_mem_size: usize,
}

/// Descriptor for command queue / immediate list creation
#[derive(Debug, Clone, Copy)]
pub struct QueueDesc {
    /// Queue group ordinal
    pub ordinal: u32,
    /// Physical queue index within the group
    pub index: u32,
    pub priority: i32,
}

/// Image creation descriptor
#[derive(Debug, Clone, Copy)]
pub struct ImageDesc {
    pub width: usize,
    pub height: usize,
    pub depth: usize,
    pub bytes_per_pixel: usize,
}

/// A region within an image, in pixels
#[derive(Debug, Clone, Copy)]
pub struct ImageRegion {
    pub origin: [usize; 3],
    pub extent: [usize; 3],
}

/// The native driver capability set.
///
/// All appends take an optional signal event plus a wait-event list; the
/// appended operation must not begin until every wait event is signaled and
/// must signal its event on completion.
pub trait NativeDriver: Send + Sync + 'static {
    fn init(&self) -> DriverResult<()>;

    // Contexts and devices
    fn context_create(&self) -> DriverResult<CtxHandle>;
    fn context_destroy(&self, ctx: CtxHandle) -> DriverResult<()>;
    fn device_count(&self) -> DriverResult<u32>;
    fn device_handle(&self, index: u32) -> DriverResult<DevHandle>;
    fn device_properties(&self, dev: DevHandle) -> DriverResult<DeviceProperties>;
    fn queue_group_properties(&self, dev: DevHandle) -> DriverResult<Vec<QueueGroupProperties>>;

    // Command queues and fences
    fn queue_create(
        &self,
        ctx: CtxHandle,
        dev: DevHandle,
        desc: &QueueDesc,
    ) -> DriverResult<QueueHandle>;
    fn queue_destroy(&self, queue: QueueHandle) -> DriverResult<()>;
    fn queue_submit(
        &self,
        queue: QueueHandle,
        cmd_list: CmdListHandle,
        fence: Option<FenceHandle>,
    ) -> DriverResult<()>;
    fn queue_synchronize(&self, queue: QueueHandle) -> DriverResult<()>;
    fn fence_create(&self, queue: QueueHandle) -> DriverResult<FenceHandle>;
    fn fence_reset(&self, fence: FenceHandle) -> DriverResult<()>;
    fn fence_host_wait(&self, fence: FenceHandle) -> DriverResult<()>;
    fn fence_destroy(&self, fence: FenceHandle) -> DriverResult<()>;

    // Command lists
    fn cmd_list_create(
        &self,
        ctx: CtxHandle,
        dev: DevHandle,
        ordinal: u32,
    ) -> DriverResult<CmdListHandle>;
    fn cmd_list_create_immediate(
        &self,
        ctx: CtxHandle,
        dev: DevHandle,
        desc: &QueueDesc,
    ) -> DriverResult<CmdListHandle>;
    fn cmd_list_close(&self, cmd_list: CmdListHandle) -> DriverResult<()>;
    fn cmd_list_reset(&self, cmd_list: CmdListHandle) -> DriverResult<()>;
    fn cmd_list_destroy(&self, cmd_list: CmdListHandle) -> DriverResult<()>;

    // Events
    fn event_pool_create(&self, ctx: CtxHandle, capacity: u32) -> DriverResult<EventPoolHandle>;
    fn event_pool_destroy(&self, pool: EventPoolHandle) -> DriverResult<()>;
    fn event_create(&self, pool: EventPoolHandle, index: u32) -> DriverResult<EventHandle>;
    fn event_destroy(&self, event: EventHandle) -> DriverResult<()>;
    /// True when the event has been signaled
    fn event_query(&self, event: EventHandle) -> DriverResult<bool>;
    fn event_host_wait(&self, event: EventHandle) -> DriverResult<()>;
    fn event_host_signal(&self, event: EventHandle) -> DriverResult<()>;
    fn event_reset(&self, event: EventHandle) -> DriverResult<()>;
    /// Device timestamp captured when the event was signaled, in device ticks
    fn event_timestamp(&self, event: EventHandle) -> DriverResult<u64>;

    // Appends
    fn append_barrier(
        &self,
        cmd_list: CmdListHandle,
        signal: Option<EventHandle>,
        waits: &[EventHandle],
    ) -> DriverResult<()>;
    fn append_copy(
        &self,
        cmd_list: CmdListHandle,
        dst: DevicePtr,
        src: DevicePtr,
        size: usize,
        signal: Option<EventHandle>,
        waits: &[EventHandle],
    ) -> DriverResult<()>;
    #[allow(clippy::too_many_arguments)]
    fn append_copy_region(
        &self,
        cmd_list: CmdListHandle,
        dst: DevicePtr,
        dst_pitch: usize,
        dst_slice_pitch: usize,
        src: DevicePtr,
        src_pitch: usize,
        src_slice_pitch: usize,
        width: usize,
        height: usize,
        depth: usize,
        signal: Option<EventHandle>,
        waits: &[EventHandle],
    ) -> DriverResult<()>;
    fn append_fill(
        &self,
        cmd_list: CmdListHandle,
        dst: DevicePtr,
        pattern: &[u8],
        size: usize,
        signal: Option<EventHandle>,
        waits: &[EventHandle],
    ) -> DriverResult<()>;
    fn append_dispatch(
        &self,
        cmd_list: CmdListHandle,
        kernel: KernelHandle,
        group_counts: [u32; 3],
        signal: Option<EventHandle>,
        waits: &[EventHandle],
    ) -> DriverResult<()>;
    /// Advisory residency hint; carries no events
    fn append_prefetch(
        &self,
        cmd_list: CmdListHandle,
        ptr: DevicePtr,
        size: usize,
    ) -> DriverResult<()>;
    fn append_image_copy_from_memory(
        &self,
        cmd_list: CmdListHandle,
        image: ImageHandle,
        src: DevicePtr,
        region: ImageRegion,
        signal: Option<EventHandle>,
        waits: &[EventHandle],
    ) -> DriverResult<()>;

    // Images
    fn image_create(
        &self,
        ctx: CtxHandle,
        dev: DevHandle,
        desc: &ImageDesc,
    ) -> DriverResult<ImageHandle>;
    fn image_destroy(&self, image: ImageHandle) -> DriverResult<()>;

    // Memory
    fn mem_alloc(
        &self,
        ctx: CtxHandle,
        dev: DevHandle,
        kind: MemKind,
        size: usize,
        alignment: usize,
    ) -> DriverResult<DevicePtr>;
    fn mem_free(&self, ctx: CtxHandle, ptr: DevicePtr) -> DriverResult<()>;

    // Modules and kernels
    fn module_create(
        &self,
        ctx: CtxHandle,
        dev: DevHandle,
        il: &[u8],
        build_flags: &str,
    ) -> DriverResult<ModuleHandle>;
    fn module_destroy(&self, module: ModuleHandle) -> DriverResult<()>;
    fn module_kernel_names(&self, module: ModuleHandle) -> DriverResult<Vec<String>>;
    fn kernel_create(&self, module: ModuleHandle, name: &str) -> DriverResult<KernelHandle>;
    fn kernel_destroy(&self, kernel: KernelHandle) -> DriverResult<()>;
    fn kernel_set_arg(&self, kernel: KernelHandle, index: u32, data: &[u8]) -> DriverResult<()>;
    fn kernel_set_group_size(&self, kernel: KernelHandle, x: u32, y: u32, z: u32)
        -> DriverResult<()>;
    fn kernel_properties(&self, kernel: KernelHandle) -> DriverResult<KernelProperties>;
}
