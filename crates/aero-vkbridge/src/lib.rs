//! Guest-to-host graphics API bridge.
//!
//! Guest applications call a graphics API whose semantics differ from the host driver's in a few
//! places that matter for interop: cross-process handle sharing, keyed mutexes on shared memory and
//! fences whose counters may move backwards. This crate virtualizes guest objects on top of a
//! [`HostDriver`] and emulates those semantics:
//!
//! - [`object`]: per-context handle table mapping guest handles to host objects.
//! - [`conversion`]: call-scoped scratch memory for translated parameters.
//! - [`external`]: guest kernel handles ⇄ host transferable descriptors.
//! - [`keyed_mutex`]: key-ordered ownership of shared allocations.
//! - fence-compatible timeline semaphores and the per-device Signaller thread.
//! - [`Device::queue_submit`]: rewrites submissions so all of the above reaches the host.
//!
//! Each [`Instance`] is one guest context. Contexts that exchange resources share a [`Kernel`] (the
//! handle namespace) and a host driver.

pub mod config;
pub mod conversion;
pub mod device;
pub mod error;
pub mod external;
mod fence;
pub mod host;
pub mod instance;
pub mod kernel;
pub mod keyed_mutex;
pub mod object;
pub mod stats;
mod sync;

pub use config::{BridgeConfig, ConfigError};
pub use device::{
    Device, KeyedMutexSyncInfo, MemoryAllocateInfo, MemoryImportInfo, SemaphoreCreateInfo,
    SemaphoreSubmitInfo, SubmitInfo, SubmitInfo2,
};
pub use error::{BridgeError, Result, Status};
pub use external::{
    ExportInfo, ExternalResourceBroker, GuestMemoryHandleTypes, GuestSemaphoreHandleTypes,
    ImportSource,
};
pub use host::{HostDriver, HostHandle, SemaphoreType, SoftDriver, SoftDriverConfig, WaitMode};
pub use instance::{DebugCallback, DebugMessage, Instance};
pub use kernel::{AccessRights, Kernel, KernelHandle, ObjectAttributes};
pub use keyed_mutex::KeyedMutex;
pub use object::{ContextId, GuestHandle, ObjectKind};
pub use stats::{BridgeStats, BridgeStatsSnapshot};
