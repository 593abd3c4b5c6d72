//! In-process software driver
//!
//! A complete implementation of the native driver interface backed by host
//! memory and per-queue worker threads. Each command queue (and each
//! immediate command list) owns a worker that executes operations strictly
//! in submission order: wait on the op's wait events, run the body, signal
//! the op's event with a completion timestamp. This reproduces the
//! asynchronous semantics of real hardware closely enough to exercise the
//! whole runtime, and is what the test suite runs against.
//!
//! Kernels dispatch to named behaviors registered by the embedder via
//! [`SoftDriver::register_kernel`]. Kernel arguments are latched at append
//! time, as the native API requires.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::time::Instant;

use crate::driver::{
    CmdListHandle, CtxHandle, DevHandle, DeviceProperties, DriverError, DriverResult, DevicePtr,
    EventHandle, EventPoolHandle, FenceHandle, ImageDesc, ImageHandle, ImageRegion, KernelHandle,
    KernelProperties, MemKind, ModuleHandle, NativeDriver, QueueDesc, QueueGroupProperties,
    QueueHandle, QueueKind,
};
use crate::spirv;

/// Everything a kernel behavior sees for one dispatch
pub struct Dispatch {
    /// Argument slots as latched at append time
    pub args: Vec<Vec<u8>>,
    pub group_counts: [u32; 3],
    pub group_size: [u32; 3],
}

impl Dispatch {
    /// Total number of work items in the dispatch
    pub fn total_threads(&self) -> usize {
        let groups =
            self.group_counts[0] as usize * self.group_counts[1] as usize * self.group_counts[2] as usize;
        let per_group =
            self.group_size[0] as usize * self.group_size[1] as usize * self.group_size[2] as usize;
        groups * per_group
    }

    /// Read argument slot `i` as a pointer value
    pub fn arg_ptr(&self, i: usize) -> *mut u8 {
        let mut bytes = [0u8; 8];
        let slot = &self.args[i];
        bytes[..slot.len().min(8)].copy_from_slice(&slot[..slot.len().min(8)]);
        u64::from_le_bytes(bytes) as *mut u8
    }

    /// Read argument slot `i` as a u32 value
    pub fn arg_u32(&self, i: usize) -> u32 {
        let mut bytes = [0u8; 4];
        let slot = &self.args[i];
        bytes[..slot.len().min(4)].copy_from_slice(&slot[..slot.len().min(4)]);
        u32::from_le_bytes(bytes)
    }
}

/// A registered kernel behavior
pub type KernelBehavior = Arc<dyn Fn(&Dispatch) + Send + Sync>;

struct EventCell {
    signaled: Mutex<bool>,
    cond: Condvar,
    timestamp: AtomicU64,
}

impl EventCell {
    fn new() -> Arc<Self> {
        Arc::new(EventCell {
            signaled: Mutex::new(false),
            cond: Condvar::new(),
            timestamp: AtomicU64::new(0),
        })
    }

    fn signal(&self, ticks: u64) {
        let mut guard = self.signaled.lock().unwrap_or_else(|e| e.into_inner());
        // first signal wins the timestamp
        if !*guard {
            self.timestamp.store(ticks, Ordering::Release);
        }
        *guard = true;
        self.cond.notify_all();
    }

    fn wait(&self) {
        let mut guard = self.signaled.lock().unwrap_or_else(|e| e.into_inner());
        while !*guard {
            guard = self.cond.wait(guard).unwrap_or_else(|e| e.into_inner());
        }
    }

    fn query(&self) -> bool {
        *self.signaled.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn reset(&self) {
        let mut guard = self.signaled.lock().unwrap_or_else(|e| e.into_inner());
        *guard = false;
        self.timestamp.store(0, Ordering::Release);
    }
}

#[derive(Clone)]
enum OpKind {
    Barrier,
    Copy {
        dst: u64,
        src: u64,
        size: usize,
    },
    CopyRegion {
        dst: u64,
        dst_pitch: usize,
        dst_slice_pitch: usize,
        src: u64,
        src_pitch: usize,
        src_slice_pitch: usize,
        width: usize,
        height: usize,
        depth: usize,
    },
    Fill {
        dst: u64,
        pattern: Vec<u8>,
        size: usize,
    },
    Dispatch {
        name: String,
        behavior: KernelBehavior,
        args: Vec<Vec<u8>>,
        group_counts: [u32; 3],
        group_size: [u32; 3],
    },
    Prefetch,
    ImageCopy {
        data: Arc<Mutex<Vec<u8>>>,
        desc: ImageDesc,
        src: u64,
        region: ImageRegion,
    },
}

#[derive(Clone)]
struct Op {
    waits: Vec<Arc<EventCell>>,
    kind: OpKind,
    signal: Option<Arc<EventCell>>,
}

struct Batch {
    ops: Vec<Op>,
    fence: Option<Arc<EventCell>>,
}

struct QueueState {
    sender: Sender<Batch>,
}

enum CmdListState {
    Regular {
        ops: Vec<Op>,
        closed: bool,
    },
    /// Immediate lists feed a dedicated worker directly
    Immediate {
        sender: Sender<Batch>,
    },
}

struct PoolState {
    capacity: u32,
    events: Vec<EventHandle>,
}

struct KernelState {
    name: String,
    args: Vec<Vec<u8>>,
    group_size: [u32; 3],
}

struct Allocation {
    // Box keeps the storage address stable for the lifetime of the entry
    _backing: Box<[u8]>,
    size: usize,
}

struct ImageState {
    desc: ImageDesc,
    data: Arc<Mutex<Vec<u8>>>,
}

#[derive(Default)]
struct State {
    contexts: Vec<u64>,
    queues: HashMap<u64, QueueState>,
    cmd_lists: HashMap<u64, CmdListState>,
    event_pools: HashMap<u64, PoolState>,
    events: HashMap<u64, Arc<EventCell>>,
    fences: HashMap<u64, Arc<EventCell>>,
    modules: HashMap<u64, Vec<String>>,
    kernels: HashMap<u64, KernelState>,
    allocations: BTreeMap<u64, Allocation>,
    images: HashMap<u64, ImageState>,
}

/// The software driver
pub struct SoftDriver {
    next_handle: AtomicU64,
    epoch: Instant,
    state: Mutex<State>,
    behaviors: RwLock<HashMap<String, KernelBehavior>>,
    device_props: DeviceProperties,
}

impl fmt::Debug for SoftDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SoftDriver")
            .field("device", &self.device_props.name)
            .finish()
    }
}

impl Default for SoftDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl SoftDriver {
    pub fn new() -> Self {
        SoftDriver {
            next_handle: AtomicU64::new(1),
            epoch: Instant::now(),
            state: Mutex::new(State::default()),
            behaviors: RwLock::new(HashMap::new()),
            device_props: DeviceProperties {
                name: "ZeroForge Soft Device".to_string(),
                total_mem_bytes: 4 * 1024 * 1024 * 1024,
                timer_resolution_ns: 1,
                timestamp_valid_bits: 48,
                max_group_size: 1024,
                on_demand_paging: true,
                float_atomics: false,
                immediate_cmd_lists: true,
            },
        }
    }

    /// Register the behavior executed when a kernel with this name is
    /// dispatched. Later registrations replace earlier ones.
    pub fn register_kernel<F>(&self, name: &str, behavior: F)
    where
        F: Fn(&Dispatch) + Send + Sync + 'static,
    {
        self.behaviors
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_string(), Arc::new(behavior));
    }

    /// Snapshot an image's backing bytes
    pub fn image_contents(&self, image: ImageHandle) -> Option<Vec<u8>> {
        let data = self.lock_state().images.get(&image.0)?.data.clone();
        let bytes = data.lock().unwrap_or_else(|e| e.into_inner()).clone();
        Some(bytes)
    }

    fn alloc_handle(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    fn now_ticks(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }

    fn spawn_worker(&self, tag: u64) -> Sender<Batch> {
        let (tx, rx): (Sender<Batch>, Receiver<Batch>) = mpsc::channel();
        let epoch = self.epoch;
        std::thread::Builder::new()
            .name(format!("zf-soft-queue-{}", tag))
            .spawn(move || worker_loop(rx, epoch))
            .expect("failed to spawn soft queue worker");
        tx
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn event_cell(&self, event: EventHandle) -> DriverResult<Arc<EventCell>> {
        self.lock_state()
            .events
            .get(&event.0)
            .cloned()
            .ok_or_else(|| DriverError::InvalidHandle(format!("event {}", event.0)))
    }

    fn resolve_waits(state: &State, waits: &[EventHandle]) -> DriverResult<Vec<Arc<EventCell>>> {
        waits
            .iter()
            .map(|w| {
                state
                    .events
                    .get(&w.0)
                    .cloned()
                    .ok_or_else(|| DriverError::InvalidHandle(format!("wait event {}", w.0)))
            })
            .collect()
    }

    fn resolve_signal(
        state: &State,
        signal: Option<EventHandle>,
    ) -> DriverResult<Option<Arc<EventCell>>> {
        match signal {
            None => Ok(None),
            Some(ev) => state
                .events
                .get(&ev.0)
                .cloned()
                .map(Some)
                .ok_or_else(|| DriverError::InvalidHandle(format!("signal event {}", ev.0))),
        }
    }

    /// Route an op: record into a regular list, or hand straight to the
    /// immediate list's worker.
    fn push_op(&self, cmd_list: CmdListHandle, op: Op) -> DriverResult<()> {
        let mut state = self.lock_state();
        match state.cmd_lists.get_mut(&cmd_list.0) {
            None => Err(DriverError::InvalidHandle(format!("command list {}", cmd_list.0))),
            Some(CmdListState::Regular { ops, closed }) => {
                if *closed {
                    return Err(DriverError::InvalidArgument(
                        "append to a closed command list".to_string(),
                    ));
                }
                ops.push(op);
                Ok(())
            }
            Some(CmdListState::Immediate { sender }) => sender
                .send(Batch {
                    ops: vec![op],
                    fence: None,
                })
                .map_err(|_| DriverError::DeviceLost("immediate list worker gone".to_string())),
        }
    }
}

fn worker_loop(rx: Receiver<Batch>, epoch: Instant) {
    while let Ok(batch) = rx.recv() {
        for op in batch.ops {
            for wait in &op.waits {
                wait.wait();
            }
            execute_op(&op.kind);
            if let Some(signal) = &op.signal {
                signal.signal(epoch.elapsed().as_nanos() as u64);
            }
        }
        if let Some(fence) = batch.fence {
            fence.signal(epoch.elapsed().as_nanos() as u64);
        }
    }
}

fn execute_op(kind: &OpKind) {
    match kind {
        OpKind::Barrier | OpKind::Prefetch => {}
        OpKind::Copy { dst, src, size } => unsafe {
            std::ptr::copy(*src as *const u8, *dst as *mut u8, *size);
        },
        OpKind::CopyRegion {
            dst,
            dst_pitch,
            dst_slice_pitch,
            src,
            src_pitch,
            src_slice_pitch,
            width,
            height,
            depth,
        } => {
            for z in 0..*depth {
                for y in 0..*height {
                    let src_off = z * src_slice_pitch + y * src_pitch;
                    let dst_off = z * dst_slice_pitch + y * dst_pitch;
                    unsafe {
                        std::ptr::copy(
                            (*src as usize + src_off) as *const u8,
                            (*dst as usize + dst_off) as *mut u8,
                            *width,
                        );
                    }
                }
            }
        }
        OpKind::Fill { dst, pattern, size } => {
            let mut off = 0;
            while off < *size {
                let chunk = pattern.len().min(*size - off);
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        pattern.as_ptr(),
                        (*dst as usize + off) as *mut u8,
                        chunk,
                    );
                }
                off += chunk;
            }
        }
        OpKind::Dispatch {
            name,
            behavior,
            args,
            group_counts,
            group_size,
        } => {
            tracing::trace!(kernel = %name, ?group_counts, "soft dispatch");
            let dispatch = Dispatch {
                args: args.clone(),
                group_counts: *group_counts,
                group_size: *group_size,
            };
            behavior(&dispatch);
        }
        OpKind::ImageCopy {
            data,
            desc,
            src,
            region,
        } => {
            let mut image = data.lock().unwrap_or_else(|e| e.into_inner());
            let bpp = desc.bytes_per_pixel;
            let row_bytes = region.extent[0] * bpp;
            for z in 0..region.extent[2] {
                for y in 0..region.extent[1] {
                    let src_off = (z * region.extent[1] + y) * row_bytes;
                    let dst_pixel = ((region.origin[2] + z) * desc.height
                        + (region.origin[1] + y))
                        * desc.width
                        + region.origin[0];
                    let dst_off = dst_pixel * bpp;
                    let src_slice = unsafe {
                        std::slice::from_raw_parts((*src as usize + src_off) as *const u8, row_bytes)
                    };
                    image[dst_off..dst_off + row_bytes].copy_from_slice(src_slice);
                }
            }
        }
    }
}

impl NativeDriver for SoftDriver {
    fn init(&self) -> DriverResult<()> {
        Ok(())
    }

    fn context_create(&self) -> DriverResult<CtxHandle> {
        let handle = self.alloc_handle();
        self.lock_state().contexts.push(handle);
        Ok(CtxHandle(handle))
    }

    fn context_destroy(&self, ctx: CtxHandle) -> DriverResult<()> {
        self.lock_state().contexts.retain(|c| *c != ctx.0);
        Ok(())
    }

    fn device_count(&self) -> DriverResult<u32> {
        Ok(1)
    }

    fn device_handle(&self, index: u32) -> DriverResult<DevHandle> {
        if index != 0 {
            return Err(DriverError::InvalidArgument(format!(
                "device index {} out of range",
                index
            )));
        }
        Ok(DevHandle(0))
    }

    fn device_properties(&self, _dev: DevHandle) -> DriverResult<DeviceProperties> {
        Ok(self.device_props.clone())
    }

    fn queue_group_properties(&self, _dev: DevHandle) -> DriverResult<Vec<QueueGroupProperties>> {
        Ok(vec![
            QueueGroupProperties {
                kind: QueueKind::Compute,
                ordinal: 0,
                num_queues: 2,
                max_fill_pattern_size: 128,
            },
            QueueGroupProperties {
                kind: QueueKind::Copy,
                ordinal: 1,
                num_queues: 2,
                max_fill_pattern_size: 16,
            },
        ])
    }

    fn queue_create(
        &self,
        _ctx: CtxHandle,
        _dev: DevHandle,
        desc: &QueueDesc,
    ) -> DriverResult<QueueHandle> {
        if desc.ordinal > 1 {
            return Err(DriverError::InvalidArgument(format!(
                "queue group ordinal {} out of range",
                desc.ordinal
            )));
        }
        let handle = self.alloc_handle();
        let sender = self.spawn_worker(handle);
        self.lock_state().queues.insert(handle, QueueState { sender });
        Ok(QueueHandle(handle))
    }

    fn queue_destroy(&self, queue: QueueHandle) -> DriverResult<()> {
        // dropping the sender ends the worker
        self.lock_state().queues.remove(&queue.0);
        Ok(())
    }

    fn queue_submit(
        &self,
        queue: QueueHandle,
        cmd_list: CmdListHandle,
        fence: Option<FenceHandle>,
    ) -> DriverResult<()> {
        let state = self.lock_state();
        let ops = match state.cmd_lists.get(&cmd_list.0) {
            Some(CmdListState::Regular { ops, closed }) => {
                if !*closed {
                    return Err(DriverError::InvalidArgument(
                        "submit of an unclosed command list".to_string(),
                    ));
                }
                ops.clone()
            }
            Some(CmdListState::Immediate { .. }) => {
                return Err(DriverError::InvalidArgument(
                    "immediate command lists are not submitted".to_string(),
                ))
            }
            None => {
                return Err(DriverError::InvalidHandle(format!("command list {}", cmd_list.0)))
            }
        };
        let fence_cell = match fence {
            None => None,
            Some(f) => Some(
                state
                    .fences
                    .get(&f.0)
                    .cloned()
                    .ok_or_else(|| DriverError::InvalidHandle(format!("fence {}", f.0)))?,
            ),
        };
        let q = state
            .queues
            .get(&queue.0)
            .ok_or_else(|| DriverError::InvalidHandle(format!("queue {}", queue.0)))?;
        q.sender
            .send(Batch {
                ops,
                fence: fence_cell,
            })
            .map_err(|_| DriverError::DeviceLost("queue worker gone".to_string()))
    }

    fn queue_synchronize(&self, queue: QueueHandle) -> DriverResult<()> {
        let marker = EventCell::new();
        {
            let state = self.lock_state();
            let q = state
                .queues
                .get(&queue.0)
                .ok_or_else(|| DriverError::InvalidHandle(format!("queue {}", queue.0)))?;
            q.sender
                .send(Batch {
                    ops: Vec::new(),
                    fence: Some(marker.clone()),
                })
                .map_err(|_| DriverError::DeviceLost("queue worker gone".to_string()))?;
        }
        marker.wait();
        Ok(())
    }

    fn fence_create(&self, _queue: QueueHandle) -> DriverResult<FenceHandle> {
        let handle = self.alloc_handle();
        self.lock_state().fences.insert(handle, EventCell::new());
        Ok(FenceHandle(handle))
    }

    fn fence_reset(&self, fence: FenceHandle) -> DriverResult<()> {
        self.lock_state()
            .fences
            .get(&fence.0)
            .ok_or_else(|| DriverError::InvalidHandle(format!("fence {}", fence.0)))?
            .reset();
        Ok(())
    }

    fn fence_host_wait(&self, fence: FenceHandle) -> DriverResult<()> {
        let cell = self
            .lock_state()
            .fences
            .get(&fence.0)
            .cloned()
            .ok_or_else(|| DriverError::InvalidHandle(format!("fence {}", fence.0)))?;
        cell.wait();
        Ok(())
    }

    fn fence_destroy(&self, fence: FenceHandle) -> DriverResult<()> {
        self.lock_state().fences.remove(&fence.0);
        Ok(())
    }

    fn cmd_list_create(
        &self,
        _ctx: CtxHandle,
        _dev: DevHandle,
        ordinal: u32,
    ) -> DriverResult<CmdListHandle> {
        if ordinal > 1 {
            return Err(DriverError::InvalidArgument(format!(
                "queue group ordinal {} out of range",
                ordinal
            )));
        }
        let handle = self.alloc_handle();
        self.lock_state().cmd_lists.insert(
            handle,
            CmdListState::Regular {
                ops: Vec::new(),
                closed: false,
            },
        );
        Ok(CmdListHandle(handle))
    }

    fn cmd_list_create_immediate(
        &self,
        _ctx: CtxHandle,
        _dev: DevHandle,
        desc: &QueueDesc,
    ) -> DriverResult<CmdListHandle> {
        if desc.ordinal > 1 {
            return Err(DriverError::InvalidArgument(format!(
                "queue group ordinal {} out of range",
                desc.ordinal
            )));
        }
        let handle = self.alloc_handle();
        let sender = self.spawn_worker(handle);
        self.lock_state()
            .cmd_lists
            .insert(handle, CmdListState::Immediate { sender });
        Ok(CmdListHandle(handle))
    }

    fn cmd_list_close(&self, cmd_list: CmdListHandle) -> DriverResult<()> {
        match self.lock_state().cmd_lists.get_mut(&cmd_list.0) {
            Some(CmdListState::Regular { closed, .. }) => {
                *closed = true;
                Ok(())
            }
            Some(CmdListState::Immediate { .. }) => Err(DriverError::InvalidArgument(
                "immediate command lists cannot be closed".to_string(),
            )),
            None => Err(DriverError::InvalidHandle(format!("command list {}", cmd_list.0))),
        }
    }

    fn cmd_list_reset(&self, cmd_list: CmdListHandle) -> DriverResult<()> {
        match self.lock_state().cmd_lists.get_mut(&cmd_list.0) {
            Some(CmdListState::Regular { ops, closed }) => {
                ops.clear();
                *closed = false;
                Ok(())
            }
            Some(CmdListState::Immediate { .. }) => Ok(()),
            None => Err(DriverError::InvalidHandle(format!("command list {}", cmd_list.0))),
        }
    }

    fn cmd_list_destroy(&self, cmd_list: CmdListHandle) -> DriverResult<()> {
        self.lock_state().cmd_lists.remove(&cmd_list.0);
        Ok(())
    }

    fn event_pool_create(&self, _ctx: CtxHandle, capacity: u32) -> DriverResult<EventPoolHandle> {
        if capacity == 0 {
            return Err(DriverError::InvalidArgument(
                "zero-capacity event pool".to_string(),
            ));
        }
        let handle = self.alloc_handle();
        self.lock_state().event_pools.insert(
            handle,
            PoolState {
                capacity,
                events: Vec::new(),
            },
        );
        Ok(EventPoolHandle(handle))
    }

    fn event_pool_destroy(&self, pool: EventPoolHandle) -> DriverResult<()> {
        let mut state = self.lock_state();
        if let Some(pool_state) = state.event_pools.remove(&pool.0) {
            for ev in pool_state.events {
                state.events.remove(&ev.0);
            }
        }
        Ok(())
    }

    fn event_create(&self, pool: EventPoolHandle, index: u32) -> DriverResult<EventHandle> {
        let mut state = self.lock_state();
        let pool_state = state
            .event_pools
            .get_mut(&pool.0)
            .ok_or_else(|| DriverError::InvalidHandle(format!("event pool {}", pool.0)))?;
        if index >= pool_state.capacity {
            return Err(DriverError::InvalidArgument(format!(
                "event index {} exceeds pool capacity {}",
                index, pool_state.capacity
            )));
        }
        let handle = EventHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        state
            .event_pools
            .get_mut(&pool.0)
            .expect("pool checked above")
            .events
            .push(handle);
        state.events.insert(handle.0, EventCell::new());
        Ok(handle)
    }

    fn event_destroy(&self, event: EventHandle) -> DriverResult<()> {
        self.lock_state().events.remove(&event.0);
        Ok(())
    }

    fn event_query(&self, event: EventHandle) -> DriverResult<bool> {
        Ok(self.event_cell(event)?.query())
    }

    fn event_host_wait(&self, event: EventHandle) -> DriverResult<()> {
        let cell = self.event_cell(event)?;
        cell.wait();
        Ok(())
    }

    fn event_host_signal(&self, event: EventHandle) -> DriverResult<()> {
        let cell = self.event_cell(event)?;
        cell.signal(self.now_ticks());
        Ok(())
    }

    fn event_reset(&self, event: EventHandle) -> DriverResult<()> {
        self.event_cell(event)?.reset();
        Ok(())
    }

    fn event_timestamp(&self, event: EventHandle) -> DriverResult<u64> {
        let cell = self.event_cell(event)?;
        if !cell.query() {
            return Err(DriverError::NotReady);
        }
        Ok(cell.timestamp.load(Ordering::Acquire))
    }

    fn append_barrier(
        &self,
        cmd_list: CmdListHandle,
        signal: Option<EventHandle>,
        waits: &[EventHandle],
    ) -> DriverResult<()> {
        let (waits, signal) = {
            let state = self.lock_state();
            (
                Self::resolve_waits(&state, waits)?,
                Self::resolve_signal(&state, signal)?,
            )
        };
        self.push_op(
            cmd_list,
            Op {
                waits,
                kind: OpKind::Barrier,
                signal,
            },
        )
    }

    fn append_copy(
        &self,
        cmd_list: CmdListHandle,
        dst: DevicePtr,
        src: DevicePtr,
        size: usize,
        signal: Option<EventHandle>,
        waits: &[EventHandle],
    ) -> DriverResult<()> {
        if dst.is_null() || src.is_null() {
            return Err(DriverError::InvalidArgument("null copy endpoint".to_string()));
        }
        let (waits, signal) = {
            let state = self.lock_state();
            (
                Self::resolve_waits(&state, waits)?,
                Self::resolve_signal(&state, signal)?,
            )
        };
        self.push_op(
            cmd_list,
            Op {
                waits,
                kind: OpKind::Copy {
                    dst: dst.0,
                    src: src.0,
                    size,
                },
                signal,
            },
        )
    }

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
    ) -> DriverResult<()> {
        if dst.is_null() || src.is_null() {
            return Err(DriverError::InvalidArgument("null copy endpoint".to_string()));
        }
        if width > dst_pitch || width > src_pitch {
            return Err(DriverError::InvalidArgument(format!(
                "row width {} exceeds pitch (dst {}, src {})",
                width, dst_pitch, src_pitch
            )));
        }
        let (waits, signal) = {
            let state = self.lock_state();
            (
                Self::resolve_waits(&state, waits)?,
                Self::resolve_signal(&state, signal)?,
            )
        };
        self.push_op(
            cmd_list,
            Op {
                waits,
                kind: OpKind::CopyRegion {
                    dst: dst.0,
                    dst_pitch,
                    dst_slice_pitch,
                    src: src.0,
                    src_pitch,
                    src_slice_pitch,
                    width,
                    height,
                    depth,
                },
                signal,
            },
        )
    }

    fn append_fill(
        &self,
        cmd_list: CmdListHandle,
        dst: DevicePtr,
        pattern: &[u8],
        size: usize,
        signal: Option<EventHandle>,
        waits: &[EventHandle],
    ) -> DriverResult<()> {
        if pattern.is_empty() {
            return Err(DriverError::InvalidArgument("empty fill pattern".to_string()));
        }
        if size % pattern.len() != 0 {
            return Err(DriverError::InvalidArgument(format!(
                "fill size {} is not a multiple of pattern size {}",
                size,
                pattern.len()
            )));
        }
        let (waits, signal) = {
            let state = self.lock_state();
            (
                Self::resolve_waits(&state, waits)?,
                Self::resolve_signal(&state, signal)?,
            )
        };
        self.push_op(
            cmd_list,
            Op {
                waits,
                kind: OpKind::Fill {
                    dst: dst.0,
                    pattern: pattern.to_vec(),
                    size,
                },
                signal,
            },
        )
    }

    fn append_dispatch(
        &self,
        cmd_list: CmdListHandle,
        kernel: KernelHandle,
        group_counts: [u32; 3],
        signal: Option<EventHandle>,
        waits: &[EventHandle],
    ) -> DriverResult<()> {
        let (name, args, group_size, waits, signal) = {
            let state = self.lock_state();
            let k = state
                .kernels
                .get(&kernel.0)
                .ok_or_else(|| DriverError::InvalidHandle(format!("kernel {}", kernel.0)))?;
            (
                k.name.clone(),
                k.args.clone(),
                k.group_size,
                Self::resolve_waits(&state, waits)?,
                Self::resolve_signal(&state, signal)?,
            )
        };
        let behavior = self
            .behaviors
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&name)
            .cloned()
            .ok_or_else(|| DriverError::NotFound(format!("no behavior for kernel '{}'", name)))?;
        self.push_op(
            cmd_list,
            Op {
                waits,
                kind: OpKind::Dispatch {
                    name,
                    behavior,
                    args,
                    group_counts,
                    group_size,
                },
                signal,
            },
        )
    }

    fn append_prefetch(
        &self,
        cmd_list: CmdListHandle,
        _ptr: DevicePtr,
        _size: usize,
    ) -> DriverResult<()> {
        self.push_op(
            cmd_list,
            Op {
                waits: Vec::new(),
                kind: OpKind::Prefetch,
                signal: None,
            },
        )
    }

    fn append_image_copy_from_memory(
        &self,
        cmd_list: CmdListHandle,
        image: ImageHandle,
        src: DevicePtr,
        region: ImageRegion,
        signal: Option<EventHandle>,
        waits: &[EventHandle],
    ) -> DriverResult<()> {
        let (data, desc, waits, signal) = {
            let state = self.lock_state();
            let img = state
                .images
                .get(&image.0)
                .ok_or_else(|| DriverError::InvalidHandle(format!("image {}", image.0)))?;
            (
                img.data.clone(),
                img.desc,
                Self::resolve_waits(&state, waits)?,
                Self::resolve_signal(&state, signal)?,
            )
        };
        if region.origin[0] + region.extent[0] > desc.width
            || region.origin[1] + region.extent[1] > desc.height.max(1)
            || region.origin[2] + region.extent[2] > desc.depth.max(1)
        {
            return Err(DriverError::InvalidArgument(
                "image region out of bounds".to_string(),
            ));
        }
        self.push_op(
            cmd_list,
            Op {
                waits,
                kind: OpKind::ImageCopy {
                    data,
                    desc,
                    src: src.0,
                    region,
                },
                signal,
            },
        )
    }

    fn image_create(
        &self,
        _ctx: CtxHandle,
        _dev: DevHandle,
        desc: &ImageDesc,
    ) -> DriverResult<ImageHandle> {
        // normalize degenerate dimensions so region math stays uniform
        let desc = ImageDesc {
            width: desc.width,
            height: desc.height.max(1),
            depth: desc.depth.max(1),
            bytes_per_pixel: desc.bytes_per_pixel,
        };
        let pixels = desc.width * desc.height * desc.depth;
        let handle = self.alloc_handle();
        self.lock_state().images.insert(
            handle,
            ImageState {
                desc,
                data: Arc::new(Mutex::new(vec![0u8; pixels * desc.bytes_per_pixel])),
            },
        );
        Ok(ImageHandle(handle))
    }

    fn image_destroy(&self, image: ImageHandle) -> DriverResult<()> {
        self.lock_state().images.remove(&image.0);
        Ok(())
    }

    fn mem_alloc(
        &self,
        _ctx: CtxHandle,
        _dev: DevHandle,
        _kind: MemKind,
        size: usize,
        alignment: usize,
    ) -> DriverResult<DevicePtr> {
        if size == 0 {
            return Err(DriverError::InvalidArgument("zero-size allocation".to_string()));
        }
        let align = alignment.max(1);
        let backing = vec![0u8; size + align].into_boxed_slice();
        let base = backing.as_ptr() as u64;
        let addr = (base + align as u64 - 1) / align as u64 * align as u64;
        self.lock_state().allocations.insert(
            addr,
            Allocation {
                _backing: backing,
                size,
            },
        );
        Ok(DevicePtr(addr))
    }

    fn mem_free(&self, _ctx: CtxHandle, ptr: DevicePtr) -> DriverResult<()> {
        match self.lock_state().allocations.remove(&ptr.0) {
            Some(allocation) => {
                tracing::trace!(ptr = %ptr, size = allocation.size, "freed allocation");
                Ok(())
            }
            None => Err(DriverError::InvalidHandle(format!(
                "free of unknown pointer {}",
                ptr
            ))),
        }
    }

    fn module_create(
        &self,
        _ctx: CtxHandle,
        _dev: DevHandle,
        il: &[u8],
        _build_flags: &str,
    ) -> DriverResult<ModuleHandle> {
        let infos = spirv::parse_kernel_info(il)
            .map_err(|e| DriverError::InvalidArgument(format!("module build failed: {}", e)))?;
        let handle = self.alloc_handle();
        self.lock_state()
            .modules
            .insert(handle, infos.keys().cloned().collect());
        Ok(ModuleHandle(handle))
    }

    fn module_destroy(&self, module: ModuleHandle) -> DriverResult<()> {
        self.lock_state().modules.remove(&module.0);
        Ok(())
    }

    fn module_kernel_names(&self, module: ModuleHandle) -> DriverResult<Vec<String>> {
        self.lock_state()
            .modules
            .get(&module.0)
            .cloned()
            .ok_or_else(|| DriverError::InvalidHandle(format!("module {}", module.0)))
    }

    fn kernel_create(&self, module: ModuleHandle, name: &str) -> DriverResult<KernelHandle> {
        let mut state = self.lock_state();
        let names = state
            .modules
            .get(&module.0)
            .ok_or_else(|| DriverError::InvalidHandle(format!("module {}", module.0)))?;
        if !names.iter().any(|n| n == name) {
            return Err(DriverError::NotFound(format!(
                "kernel '{}' not in module",
                name
            )));
        }
        let handle = self.alloc_handle();
        state.kernels.insert(
            handle,
            KernelState {
                name: name.to_string(),
                args: Vec::new(),
                group_size: [1, 1, 1],
            },
        );
        Ok(KernelHandle(handle))
    }

    fn kernel_destroy(&self, kernel: KernelHandle) -> DriverResult<()> {
        self.lock_state().kernels.remove(&kernel.0);
        Ok(())
    }

    fn kernel_set_arg(&self, kernel: KernelHandle, index: u32, data: &[u8]) -> DriverResult<()> {
        let mut state = self.lock_state();
        let k = state
            .kernels
            .get_mut(&kernel.0)
            .ok_or_else(|| DriverError::InvalidHandle(format!("kernel {}", kernel.0)))?;
        let index = index as usize;
        if index >= k.args.len() {
            k.args.resize(index + 1, Vec::new());
        }
        k.args[index] = data.to_vec();
        Ok(())
    }

    fn kernel_set_group_size(
        &self,
        kernel: KernelHandle,
        x: u32,
        y: u32,
        z: u32,
    ) -> DriverResult<()> {
        if x == 0 || y == 0 || z == 0 {
            return Err(DriverError::InvalidArgument("zero group dimension".to_string()));
        }
        let mut state = self.lock_state();
        let k = state
            .kernels
            .get_mut(&kernel.0)
            .ok_or_else(|| DriverError::InvalidHandle(format!("kernel {}", kernel.0)))?;
        k.group_size = [x, y, z];
        Ok(())
    }

    fn kernel_properties(&self, kernel: KernelHandle) -> DriverResult<KernelProperties> {
        let state = self.lock_state();
        state
            .kernels
            .get(&kernel.0)
            .ok_or_else(|| DriverError::InvalidHandle(format!("kernel {}", kernel.0)))?;
        Ok(KernelProperties {
            max_group_size: self.device_props.max_group_size,
            private_mem_size: 0,
            local_mem_size: 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn driver() -> SoftDriver {
        SoftDriver::new()
    }

    #[test]
    fn test_alloc_respects_alignment() {
        let d = driver();
        let ctx = d.context_create().unwrap();
        let ptr = d.mem_alloc(ctx, DevHandle(0), MemKind::Shared, 100, 64).unwrap();
        assert_eq!(ptr.0 % 64, 0);
        d.mem_free(ctx, ptr).unwrap();
        assert!(d.mem_free(ctx, ptr).is_err());
    }

    #[test]
    fn test_immediate_copy_executes() {
        let d = driver();
        let ctx = d.context_create().unwrap();
        let desc = QueueDesc {
            ordinal: 0,
            index: 0,
            priority: 0,
        };
        let cl = d.cmd_list_create_immediate(ctx, DevHandle(0), &desc).unwrap();
        let pool = d.event_pool_create(ctx, 1).unwrap();
        let ev = d.event_create(pool, 0).unwrap();

        let src = [7u8; 32];
        let mut dst = [0u8; 32];
        d.append_copy(
            cl,
            DevicePtr::from_host_slice_mut(&mut dst),
            DevicePtr::from_host_slice(&src),
            32,
            Some(ev),
            &[],
        )
        .unwrap();
        d.event_host_wait(ev).unwrap();
        assert_eq!(dst, [7u8; 32]);
        assert!(d.event_timestamp(ev).unwrap() > 0);
    }

    #[test]
    fn test_regular_list_requires_close_before_submit() {
        let d = driver();
        let ctx = d.context_create().unwrap();
        let desc = QueueDesc {
            ordinal: 0,
            index: 0,
            priority: 0,
        };
        let q = d.queue_create(ctx, DevHandle(0), &desc).unwrap();
        let cl = d.cmd_list_create(ctx, DevHandle(0), 0).unwrap();
        d.append_barrier(cl, None, &[]).unwrap();
        assert!(d.queue_submit(q, cl, None).is_err());
        d.cmd_list_close(cl).unwrap();
        d.queue_submit(q, cl, None).unwrap();
        d.queue_synchronize(q).unwrap();
    }

    #[test]
    fn test_fill_pattern_validated() {
        let d = driver();
        let ctx = d.context_create().unwrap();
        let desc = QueueDesc {
            ordinal: 0,
            index: 0,
            priority: 0,
        };
        let cl = d.cmd_list_create_immediate(ctx, DevHandle(0), &desc).unwrap();
        let mut dst = [0u8; 8];
        let err = d.append_fill(
            cl,
            DevicePtr::from_host_slice_mut(&mut dst),
            &[1, 2, 3],
            8,
            None,
            &[],
        );
        assert!(err.is_err());
    }

    #[test]
    fn test_image_region_copy() {
        let d = driver();
        let ctx = d.context_create().unwrap();
        let desc = QueueDesc {
            ordinal: 0,
            index: 0,
            priority: 0,
        };
        let cl = d.cmd_list_create_immediate(ctx, DevHandle(0), &desc).unwrap();
        let image = d
            .image_create(
                ctx,
                DevHandle(0),
                &ImageDesc {
                    width: 4,
                    height: 4,
                    depth: 1,
                    bytes_per_pixel: 1,
                },
            )
            .unwrap();
        let pool = d.event_pool_create(ctx, 1).unwrap();
        let done = d.event_create(pool, 0).unwrap();

        // write a 2x2 block at (1, 1)
        let src = [9u8, 8, 7, 6];
        d.append_image_copy_from_memory(
            cl,
            image,
            DevicePtr::from_host_slice(&src),
            ImageRegion {
                origin: [1, 1, 0],
                extent: [2, 2, 1],
            },
            Some(done),
            &[],
        )
        .unwrap();
        d.event_host_wait(done).unwrap();

        let bytes = d.image_contents(image).unwrap();
        assert_eq!(bytes[4 + 1], 9);
        assert_eq!(bytes[4 + 2], 8);
        assert_eq!(bytes[8 + 1], 7);
        assert_eq!(bytes[8 + 2], 6);
        assert_eq!(bytes[0], 0);
    }

    #[test]
    fn test_wait_event_gates_execution() {
        let d = driver();
        let ctx = d.context_create().unwrap();
        let desc = QueueDesc {
            ordinal: 0,
            index: 0,
            priority: 0,
        };
        let cl = d.cmd_list_create_immediate(ctx, DevHandle(0), &desc).unwrap();
        let pool = d.event_pool_create(ctx, 2).unwrap();
        let gate = d.event_create(pool, 0).unwrap();
        let done = d.event_create(pool, 1).unwrap();

        let src = [9u8; 4];
        let mut dst = [0u8; 4];
        d.append_copy(
            cl,
            DevicePtr::from_host_slice_mut(&mut dst),
            DevicePtr::from_host_slice(&src),
            4,
            Some(done),
            &[gate],
        )
        .unwrap();

        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(!d.event_query(done).unwrap());
        d.event_host_signal(gate).unwrap();
        d.event_host_wait(done).unwrap();
        assert_eq!(dst, [9u8; 4]);
    }
}
