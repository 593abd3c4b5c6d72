//! Runtime core
//!
//! The layered object graph behind the public API: a process-wide Backend
//! owning contexts, devices and the event monitor; devices owning queues
//! and modules; contexts owning event pools and the command-list pool.

pub mod backend;
pub mod context;
pub mod device;
pub mod event;
pub mod exec_item;
pub mod module;
pub mod monitor;
pub mod queue;
pub mod tracker;

pub use backend::{Backend, BackendConfig, CallbackFn, CallbackQueue, ModuleId};
pub use context::{CmdListStats, Context, EventStats};
pub use device::Device;
pub use event::{Event, EventPool, EventStatus};
pub use exec_item::{Dim3, ExecItem};
pub use module::{DeviceVar, Kernel, Module, VAR_BIND_PREFIX, VAR_INFO_PREFIX, VAR_INIT_PREFIX};
pub use monitor::EventMonitor;
pub use queue::{Queue, QueueFlags};
pub use tracker::{AllocationInfo, AllocationTracker};
