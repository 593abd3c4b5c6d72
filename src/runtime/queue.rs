//! Queue submission engine
//!
//! Serializes work onto a device. Every enqueue acquires a command list
//! (the queue's immediate list, or a regular list borrowed from the
//! context pool), waits on the queue's `LastEvent` plus any caller-supplied
//! events, emits the operation, and signals a fresh event which becomes the
//! new `LastEvent`. Once that event is finished, every previously enqueued
//! operation is finished too; this wait chain is what enforces stream
//! order.
//!
//! Native failures do not stall the stream: the operation's event is forced
//! into Finished with the error latched, `LastEvent` still advances, and
//! the first error observed is surfaced by the next `finish()`.

use std::sync::{Arc, Mutex, Weak};

use crate::driver::{
    CmdListHandle, DevHandle, EventHandle, FenceHandle, ImageHandle, ImageRegion, NativeDriver,
    QueueDesc, QueueHandle, QueueKind,
};
use crate::driver::DevicePtr;
use crate::error::{ZeroForgeError, ZfResult};
use crate::runtime::backend::{CallbackFn, CallbackQueue, CallbackRecord};
use crate::runtime::context::Context;
use crate::runtime::device::Device;
use crate::runtime::event::Event;
use crate::runtime::exec_item::ExecItem;

/// Stream behavior flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFlags {
    /// Whether the stream synchronizes with the default stream
    pub blocking: bool,
}

impl Default for QueueFlags {
    fn default() -> Self {
        QueueFlags { blocking: true }
    }
}

impl QueueFlags {
    pub fn non_blocking() -> Self {
        QueueFlags { blocking: false }
    }
}

enum QueueMode {
    /// Appends are eligible for immediate execution
    Immediate { cmd_list: CmdListHandle },
    /// Appends are recorded into pooled lists and submitted explicitly
    Regular {
        queue: QueueHandle,
        fence: FenceHandle,
    },
}

struct QueueInner {
    last_event: Option<Arc<Event>>,
    /// First error observed, surfaced by the next finish()
    latched_error: Option<ZeroForgeError>,
    /// Whether the per-queue fence was armed by the most recent submit;
    /// a reset fence that was never submitted must not be waited on
    fence_in_flight: bool,
}

/// A logical stream of device work
pub struct Queue {
    driver: Arc<dyn NativeDriver>,
    ctx: Arc<Context>,
    dev: DevHandle,
    device: Weak<Device>,
    callbacks: Arc<CallbackQueue>,
    kind: QueueKind,
    ordinal: u32,
    priority: i32,
    flags: QueueFlags,
    max_fill_pattern_size: usize,
    mode: QueueMode,
    inner: Mutex<QueueInner>,
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("kind", &self.kind)
            .field("ordinal", &self.ordinal)
            .finish()
    }
}

impl Queue {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        driver: Arc<dyn NativeDriver>,
        ctx: Arc<Context>,
        dev: DevHandle,
        device: Weak<Device>,
        callbacks: Arc<CallbackQueue>,
        kind: QueueKind,
        ordinal: u32,
        index: u32,
        priority: i32,
        flags: QueueFlags,
        use_immediate: bool,
        max_fill_pattern_size: usize,
    ) -> ZfResult<Arc<Self>> {
        let desc = QueueDesc {
            ordinal,
            index,
            priority,
        };
        let mode = if use_immediate {
            let cmd_list = driver.cmd_list_create_immediate(ctx.handle(), dev, &desc)?;
            tracing::debug!(?kind, ordinal, index, "created queue with immediate command list");
            QueueMode::Immediate { cmd_list }
        } else {
            let queue = driver.queue_create(ctx.handle(), dev, &desc)?;
            let fence = driver.fence_create(queue).map_err(|e| {
                // no Queue exists yet, so no Drop will release the handle
                let _ = driver.queue_destroy(queue);
                e
            })?;
            tracing::debug!(?kind, ordinal, index, "created queue with regular command lists");
            QueueMode::Regular { queue, fence }
        };
        Ok(Arc::new(Queue {
            driver,
            ctx,
            dev,
            device,
            callbacks,
            kind,
            ordinal,
            priority,
            flags,
            max_fill_pattern_size,
            mode,
            inner: Mutex::new(QueueInner {
                last_event: None,
                latched_error: None,
                fence_in_flight: false,
            }),
        }))
    }

    pub fn kind(&self) -> QueueKind {
        self.kind
    }

    pub fn flags(&self) -> QueueFlags {
        self.flags
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.ctx
    }

    /// Completion token of the most recently enqueued operation
    pub fn last_event(&self) -> Option<Arc<Event>> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .last_event
            .clone()
    }

    /// The largest fill pattern this queue's group accepts
    pub fn max_fill_pattern_size(&self) -> usize {
        self.max_fill_pattern_size
    }

    /// The central enqueue protocol: acquire event, build the wait set from
    /// `LastEvent` plus `extra_waits`, emit via `append`, publish the event.
    fn enqueue<F>(&self, label: &str, extra_waits: &[Arc<Event>], append: F) -> ZfResult<Arc<Event>>
    where
        F: FnOnce(&dyn NativeDriver, CmdListHandle, EventHandle, &[EventHandle]) -> ZfResult<()>,
    {
        // event acquisition takes the context lock; do it before the queue
        // lock so lock order stays queue-free below context
        let event = self.ctx.get_event()?;

        let mut inner = self.inner.lock()?;
        let mut waits: Vec<Arc<Event>> = Vec::with_capacity(extra_waits.len() + 1);
        if let Some(last) = &inner.last_event {
            waits.push(last.clone());
        }
        waits.extend(extra_waits.iter().cloned());
        let wait_handles: Vec<EventHandle> = waits.iter().map(|w| w.handle()).collect();
        // the new event retains its wait set until it finishes, keeping
        // every handle the native op references alive
        for wait in &waits {
            event.add_dep(wait.clone());
        }
        event.mark_recording();

        let result = match &self.mode {
            QueueMode::Immediate { cmd_list } => {
                append(self.driver.as_ref(), *cmd_list, event.handle(), &wait_handles)
            }
            QueueMode::Regular { queue, fence } => {
                match self.ctx.acquire_cmd_list(self.dev, self.ordinal) {
                    Err(e) => Err(e),
                    Ok(cmd_list) => {
                        let submitted = append(
                            self.driver.as_ref(),
                            cmd_list,
                            event.handle(),
                            &wait_handles,
                        )
                        .and_then(|_| Ok(self.driver.cmd_list_close(cmd_list)?))
                        .and_then(|_| Ok(self.driver.fence_reset(*fence)?))
                        .and_then(|_| Ok(self.driver.queue_submit(*queue, cmd_list, Some(*fence))?));
                        match submitted {
                            Ok(()) => {
                                // the monitor returns the list to the pool
                                // once the event fires
                                event.assign_cmd_list(&self.ctx, cmd_list);
                                Ok(())
                            }
                            Err(e) => {
                                self.ctx.return_cmd_list(cmd_list);
                                Err(e)
                            }
                        }
                    }
                }
            }
        };

        match result {
            Ok(()) => {
                event.mark_recorded();
                if matches!(self.mode, QueueMode::Regular { .. }) {
                    inner.fence_in_flight = true;
                }
                inner.last_event = Some(event.clone());
                tracing::trace!(op = label, "enqueued");
                Ok(event)
            }
            Err(err) => {
                tracing::error!(op = label, error = %err, "enqueue failed");
                event.set_error(err.clone());
                // the fence may have been reset without a matching submit
                inner.fence_in_flight = false;
                // the wait set may still be referenced by in-flight native
                // work; park it with the context until it fires
                self.ctx.retain_until_finished(waits);
                // force completion so downstream waits do not deadlock
                if let Err(signal_err) = event.host_signal() {
                    tracing::warn!(error = %signal_err, "failed to host-signal errored event");
                }
                inner.last_event = Some(event.clone());
                if inner.latched_error.is_none() {
                    inner.latched_error = Some(err.clone());
                }
                Err(err)
            }
        }
    }

    /// Barrier against peer streams when default-queue synchronization is
    /// compiled in. The default queue waits on all blocking queues' last
    /// events; blocking queues wait on the default queue's.
    fn sync_queues(&self) -> ZfResult<()> {
        if !cfg!(feature = "queue-sync") {
            return Ok(());
        }
        let device = match self.device.upgrade() {
            Some(device) => device,
            None => return Ok(()),
        };
        let default_queue = match device.default_queue() {
            Some(queue) => queue,
            None => return Ok(()),
        };
        let is_default = std::ptr::eq(self as *const Queue, Arc::as_ptr(&default_queue));

        let peers: Vec<Arc<Event>> = if is_default {
            device
                .queues()
                .iter()
                .filter(|q| !std::ptr::eq(self as *const Queue, Arc::as_ptr(q)))
                .filter(|q| q.flags().blocking)
                .filter_map(|q| q.last_event())
                .collect()
        } else if self.flags.blocking {
            default_queue.last_event().into_iter().collect()
        } else {
            Vec::new()
        };
        if peers.is_empty() {
            return Ok(());
        }
        self.enqueue("syncQueues", &peers, |d, cl, signal, waits| {
            Ok(d.append_barrier(cl, Some(signal), waits)?)
        })
        .map(|_| ())
    }

    /// Asynchronous memory copy
    pub fn mem_copy_async(
        &self,
        dst: DevicePtr,
        src: DevicePtr,
        size: usize,
    ) -> ZfResult<Arc<Event>> {
        self.sync_queues()?;
        self.enqueue("memCopyAsync", &[], |d, cl, signal, waits| {
            Ok(d.append_copy(cl, dst, src, size, Some(signal), waits)?)
        })
    }

    /// Blocking memory copy
    pub fn mem_copy(&self, dst: DevicePtr, src: DevicePtr, size: usize) -> ZfResult<Arc<Event>> {
        let event = self.mem_copy_async(dst, src, size)?;
        self.finish()?;
        Ok(event)
    }

    /// Asynchronous pattern fill
    pub fn mem_fill_async(
        &self,
        dst: DevicePtr,
        size: usize,
        pattern: &[u8],
    ) -> ZfResult<Arc<Event>> {
        if pattern.is_empty() {
            return Err(ZeroForgeError::InvalidValue("empty fill pattern".to_string()));
        }
        if pattern.len() > self.max_fill_pattern_size {
            return Err(ZeroForgeError::InvalidValue(format!(
                "fill pattern of {} bytes exceeds queue maximum {}",
                pattern.len(),
                self.max_fill_pattern_size
            )));
        }
        self.sync_queues()?;
        let pattern = pattern.to_vec();
        self.enqueue("memFillAsync", &[], move |d, cl, signal, waits| {
            Ok(d.append_fill(cl, dst, &pattern, size, Some(signal), waits)?)
        })
    }

    /// Blocking pattern fill
    pub fn mem_fill(&self, dst: DevicePtr, size: usize, pattern: &[u8]) -> ZfResult<Arc<Event>> {
        let event = self.mem_fill_async(dst, size, pattern)?;
        self.finish()?;
        Ok(event)
    }

    /// Asynchronous pitched 2D copy
    pub fn mem_copy_2d_async(
        &self,
        dst: DevicePtr,
        dst_pitch: usize,
        src: DevicePtr,
        src_pitch: usize,
        width: usize,
        height: usize,
    ) -> ZfResult<Arc<Event>> {
        self.sync_queues()?;
        self.enqueue("memCopy2DAsync", &[], move |d, cl, signal, waits| {
            Ok(d.append_copy_region(
                cl,
                dst,
                dst_pitch,
                dst_pitch * height,
                src,
                src_pitch,
                src_pitch * height,
                width,
                height,
                1,
                Some(signal),
                waits,
            )?)
        })
    }

    /// Blocking pitched 2D copy
    #[allow(clippy::too_many_arguments)]
    pub fn mem_copy_2d(
        &self,
        dst: DevicePtr,
        dst_pitch: usize,
        src: DevicePtr,
        src_pitch: usize,
        width: usize,
        height: usize,
    ) -> ZfResult<Arc<Event>> {
        let event = self.mem_copy_2d_async(dst, dst_pitch, src, src_pitch, width, height)?;
        self.finish()?;
        Ok(event)
    }

    /// Asynchronous pitched 3D copy
    #[allow(clippy::too_many_arguments)]
    pub fn mem_copy_3d_async(
        &self,
        dst: DevicePtr,
        dst_pitch: usize,
        dst_slice_pitch: usize,
        src: DevicePtr,
        src_pitch: usize,
        src_slice_pitch: usize,
        width: usize,
        height: usize,
        depth: usize,
    ) -> ZfResult<Arc<Event>> {
        self.sync_queues()?;
        self.enqueue("memCopy3DAsync", &[], move |d, cl, signal, waits| {
            Ok(d.append_copy_region(
                cl,
                dst,
                dst_pitch,
                dst_slice_pitch,
                src,
                src_pitch,
                src_slice_pitch,
                width,
                height,
                depth,
                Some(signal),
                waits,
            )?)
        })
    }

    /// Blocking pitched 3D copy
    #[allow(clippy::too_many_arguments)]
    pub fn mem_copy_3d(
        &self,
        dst: DevicePtr,
        dst_pitch: usize,
        dst_slice_pitch: usize,
        src: DevicePtr,
        src_pitch: usize,
        src_slice_pitch: usize,
        width: usize,
        height: usize,
        depth: usize,
    ) -> ZfResult<Arc<Event>> {
        let event = self.mem_copy_3d_async(
            dst,
            dst_pitch,
            dst_slice_pitch,
            src,
            src_pitch,
            src_slice_pitch,
            width,
            height,
            depth,
        )?;
        self.finish()?;
        Ok(event)
    }

    /// Copy host memory into an image region
    pub fn mem_copy_to_texture(
        &self,
        image: ImageHandle,
        src: DevicePtr,
        region: ImageRegion,
    ) -> ZfResult<Arc<Event>> {
        self.sync_queues()?;
        self.enqueue("memCopyToTexture", &[], move |d, cl, signal, waits| {
            Ok(d.append_image_copy_from_memory(cl, image, src, region, Some(signal), waits)?)
        })
    }

    /// Asynchronous residency prefetch hint
    pub fn mem_prefetch_async(&self, ptr: DevicePtr, size: usize) -> ZfResult<Arc<Event>> {
        self.sync_queues()?;
        self.enqueue("memPrefetchAsync", &[], move |d, cl, signal, waits| {
            d.append_barrier(cl, None, waits)?;
            d.append_prefetch(cl, ptr, size)?;
            Ok(d.append_barrier(cl, Some(signal), &[])?)
        })
    }

    /// Blocking residency prefetch hint
    pub fn mem_prefetch(&self, ptr: DevicePtr, size: usize) -> ZfResult<Arc<Event>> {
        let event = self.mem_prefetch_async(ptr, size)?;
        self.finish()?;
        Ok(event)
    }

    /// Dispatch a kernel. The launch descriptor is consumed.
    ///
    /// A descriptor whose argument buffer does not match the kernel's
    /// declared parameters fails synchronously with `LaunchFailure`; the
    /// stream still advances past the failed operation.
    pub fn launch(&self, exec_item: ExecItem) -> ZfResult<Arc<Event>> {
        self.sync_queues()?;
        self.enqueue("launch", &[], move |d, cl, signal, waits| {
            let kernel = exec_item
                .kernel()
                .cloned()
                .ok_or_else(|| {
                    ZeroForgeError::LaunchFailure("launch descriptor has no kernel".to_string())
                })?;
            exec_item.bind_args(d)?;
            let block = exec_item.block();
            let grid = exec_item.grid();
            d.kernel_set_group_size(kernel.handle(), block.x, block.y, block.z)?;
            Ok(d.append_dispatch(
                cl,
                kernel.handle(),
                [grid.x, grid.y, grid.z],
                Some(signal),
                waits,
            )?)
        })
    }

    /// Barrier waiting on the supplied events in addition to `LastEvent`
    pub fn enqueue_barrier(&self, waits_for: &[Arc<Event>]) -> ZfResult<Arc<Event>> {
        self.enqueue("enqueueBarrier", waits_for, |d, cl, signal, waits| {
            Ok(d.append_barrier(cl, Some(signal), waits)?)
        })
    }

    /// Barrier with an empty additional wait set
    pub fn enqueue_marker(&self) -> ZfResult<Arc<Event>> {
        self.enqueue("enqueueMarker", &[], |d, cl, signal, waits| {
            Ok(d.append_barrier(cl, Some(signal), waits)?)
        })
    }

    /// Block until every enqueued operation has finished and its command
    /// list has been released, then surface the first latched error.
    ///
    /// With an immediate list this waits on `LastEvent`; with regular
    /// lists it also waits on the per-queue fence last signaled.
    pub fn finish(&self) -> ZfResult<()> {
        let (last, fence_armed) = {
            let inner = self.inner.lock()?;
            (inner.last_event.clone(), inner.fence_in_flight)
        };
        if let Some(event) = last {
            event.wait()?;
        }
        if fence_armed {
            if let QueueMode::Regular { fence, .. } = &self.mode {
                self.driver.fence_host_wait(*fence)?;
            }
        }
        // release command lists and dependency chains promptly rather than
        // waiting for the next monitor tick
        self.ctx.sweep_events();

        let latched = self.inner.lock()?.latched_error.take();
        match latched {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Run a host function once the stream reaches this point; the stream
    /// does not advance past it until the function returns.
    ///
    /// Three events choreograph the handoff with the event monitor:
    /// `gpu_ready` marks the stream position, `cpu_done` blocks the stream
    /// until host-signaled after the function runs, `gpu_ack` confirms the
    /// stream has moved past the barrier.
    pub fn add_callback(&self, callback: CallbackFn) -> ZfResult<()> {
        let gpu_ready = self.enqueue_marker()?;
        let cpu_done = self.ctx.get_event()?;
        self.enqueue_barrier(std::slice::from_ref(&cpu_done))?;
        let gpu_ack = self.enqueue_marker()?;
        self.callbacks.push(CallbackRecord {
            callback,
            gpu_ready,
            cpu_done,
            gpu_ack,
        });
        Ok(())
    }
}

impl Drop for Queue {
    fn drop(&mut self) {
        let _ = self.finish();
        match &self.mode {
            QueueMode::Immediate { cmd_list } => {
                let _ = self.driver.cmd_list_destroy(*cmd_list);
            }
            QueueMode::Regular { queue, fence } => {
                let _ = self.driver.fence_destroy(*fence);
                let _ = self.driver.queue_destroy(*queue);
            }
        }
    }
}
