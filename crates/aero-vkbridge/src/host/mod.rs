//! The host graphics driver seam.
//!
//! [`HostDriver`] is the subset of the host API the translation layer consumes. Host objects are
//! identified by [`HostHandle`]s whose values the driver may recycle as soon as an object is
//! destroyed; guest code never sees them directly (see [`crate::object`]).

use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;
use std::time::Duration;

use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};

use crate::error::Status;
use crate::object::ObjectKind;

mod soft;

pub use soft::{SoftDriver, SoftDriverConfig};

#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Pod, Zeroable)]
#[repr(transparent)]
pub struct HostHandle(pub u64);

impl HostHandle {
    pub const NULL: Self = Self(0);

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for HostHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HostHandle({:#x})", self.0)
    }
}

/// One semaphore wait or signal as consumed by the host (`{semaphore, value}`).
///
/// Binary semaphores ignore `value`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct HostSemaphoreOp {
    pub semaphore: HostHandle,
    pub value: u64,
}

impl HostSemaphoreOp {
    pub fn new(semaphore: HostHandle, value: u64) -> Self {
        Self { semaphore, value }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct HostSubmitInfo<'a> {
    pub waits: &'a [HostSemaphoreOp],
    pub command_buffers: &'a [HostHandle],
    pub signals: &'a [HostSemaphoreOp],
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SemaphoreType {
    Binary,
    Timeline,
}

bitflags! {
    /// Host-native transferable descriptor kinds.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct HostHandleTypes: u32 {
        const OPAQUE_FD = 1 << 0;
        const SYNC_FD = 1 << 1;
        const DMA_BUF = 1 << 2;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HostSemaphoreInfo {
    pub ty: SemaphoreType,
    pub initial_value: u64,
    /// Handle types the semaphore may later be exported as.
    pub export: HostHandleTypes,
}

impl HostSemaphoreInfo {
    pub fn timeline(initial_value: u64) -> Self {
        Self {
            ty: SemaphoreType::Timeline,
            initial_value,
            export: HostHandleTypes::empty(),
        }
    }

    pub fn binary() -> Self {
        Self {
            ty: SemaphoreType::Binary,
            initial_value: 0,
            export: HostHandleTypes::empty(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HostMemoryInfo {
    pub size: u64,
    pub export: HostHandleTypes,
}

/// A host-transferable descriptor (an fd on the reference driver).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HostDescriptor(pub i32);

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HostExternalCaps {
    pub memory: HostHandleTypes,
    pub semaphore: HostHandleTypes,
    pub placed_mapping: bool,
    pub timeline_semaphore: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HostPhysicalDeviceProperties {
    pub name: String,
    pub vendor_id: u32,
    pub device_id: u32,
    pub external: HostExternalCaps,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitMode {
    Any,
    All,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitOutcome {
    Satisfied,
    TimedOut,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImportedMemory {
    pub memory: HostHandle,
    /// Size reported by the driver; may differ from the size asked for.
    pub size: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum DebugSeverity {
    Verbose,
    Info,
    Warning,
    Error,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HostDebugMessage {
    pub severity: DebugSeverity,
    pub message: String,
    /// Host objects the message refers to.
    pub objects: Vec<(ObjectKind, HostHandle)>,
}

/// Debug sink installed on a host instance. May be invoked from any driver thread.
pub type HostDebugSink = Arc<dyn Fn(&HostDebugMessage) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HostError {
    #[error("out of host memory")]
    OutOfHostMemory,
    #[error("out of device memory")]
    OutOfDeviceMemory,
    #[error("device lost")]
    DeviceLost,
    #[error("invalid external handle")]
    InvalidExternalHandle,
    #[error("feature not present")]
    FeatureNotPresent,
    #[error("memory map failed")]
    MemoryMapFailed,
    #[error("too many objects")]
    TooManyObjects,
    #[error("invalid usage: {0}")]
    InvalidUsage(&'static str),
}

impl HostError {
    pub fn status(&self) -> Status {
        match self {
            Self::OutOfHostMemory => Status::ErrorOutOfHostMemory,
            Self::OutOfDeviceMemory => Status::ErrorOutOfDeviceMemory,
            Self::DeviceLost => Status::ErrorDeviceLost,
            Self::InvalidExternalHandle => Status::ErrorInvalidExternalHandle,
            Self::FeatureNotPresent => Status::ErrorFeatureNotPresent,
            Self::MemoryMapFailed => Status::ErrorMemoryMapFailed,
            Self::TooManyObjects => Status::ErrorTooManyObjects,
            Self::InvalidUsage(_) => Status::ErrorValidationFailed,
        }
    }
}

pub type HostResult<T> = std::result::Result<T, HostError>;

/// Host driver entry points.
///
/// Destroy/free calls are infallible, as in the host API; passing an unknown handle is a no-op.
pub trait HostDriver: Send + Sync {
    fn create_instance(&self) -> HostResult<HostHandle>;
    fn destroy_instance(&self, instance: HostHandle);
    /// Installs (or with `None`, removes) the debug sink of `instance`.
    fn set_debug_sink(&self, instance: HostHandle, sink: Option<HostDebugSink>) -> HostResult<()>;

    fn enumerate_physical_devices(&self, instance: HostHandle) -> HostResult<Vec<HostHandle>>;
    fn physical_device_properties(
        &self,
        physical_device: HostHandle,
    ) -> HostResult<HostPhysicalDeviceProperties>;

    fn create_device(&self, physical_device: HostHandle) -> HostResult<HostHandle>;
    /// Destroys the device and everything created from it. Outstanding queue work is abandoned.
    fn destroy_device(&self, device: HostHandle);
    fn get_queue(&self, device: HostHandle, index: u32) -> HostResult<HostHandle>;
    fn queue_submit(&self, queue: HostHandle, submits: &[HostSubmitInfo<'_>]) -> HostResult<()>;
    fn queue_wait_idle(&self, queue: HostHandle) -> HostResult<()>;

    fn allocate_command_buffer(&self, device: HostHandle) -> HostResult<HostHandle>;
    fn free_command_buffer(&self, device: HostHandle, command_buffer: HostHandle);

    fn create_semaphore(&self, device: HostHandle, info: &HostSemaphoreInfo)
        -> HostResult<HostHandle>;
    fn destroy_semaphore(&self, device: HostHandle, semaphore: HostHandle);
    /// CPU-side signal of a timeline semaphore.
    fn signal_semaphore(&self, device: HostHandle, semaphore: HostHandle, value: u64)
        -> HostResult<()>;
    fn semaphore_counter_value(&self, device: HostHandle, semaphore: HostHandle)
        -> HostResult<u64>;
    /// Waits on timeline semaphores. `None` waits forever.
    fn wait_semaphores(
        &self,
        device: HostHandle,
        waits: &[HostSemaphoreOp],
        mode: WaitMode,
        timeout: Option<Duration>,
    ) -> HostResult<WaitOutcome>;

    fn allocate_memory(&self, device: HostHandle, info: &HostMemoryInfo) -> HostResult<HostHandle>;
    fn free_memory(&self, device: HostHandle, memory: HostHandle);
    /// Maps `memory`. With `placed`, the mapping lands at that address.
    ///
    /// # Safety
    ///
    /// A `placed` address must be valid for writes of the allocation's size until unmapped.
    unsafe fn map_memory(
        &self,
        device: HostHandle,
        memory: HostHandle,
        placed: Option<NonNull<u8>>,
    ) -> HostResult<NonNull<u8>>;
    fn unmap_memory(&self, device: HostHandle, memory: HostHandle);

    fn export_memory(
        &self,
        device: HostHandle,
        memory: HostHandle,
        ty: HostHandleTypes,
    ) -> HostResult<HostDescriptor>;
    /// Imports memory from `descriptor`. On success the descriptor is consumed; on failure it is
    /// left open and still owned by the caller.
    fn import_memory(
        &self,
        device: HostHandle,
        descriptor: HostDescriptor,
        ty: HostHandleTypes,
        size: u64,
    ) -> HostResult<ImportedMemory>;

    fn export_semaphore(
        &self,
        device: HostHandle,
        semaphore: HostHandle,
        ty: HostHandleTypes,
    ) -> HostResult<HostDescriptor>;
    /// Replaces the payload of `semaphore` with the one behind `descriptor`. Descriptor
    /// ownership follows [`HostDriver::import_memory`].
    fn import_semaphore(
        &self,
        device: HostHandle,
        semaphore: HostHandle,
        descriptor: HostDescriptor,
        ty: HostHandleTypes,
    ) -> HostResult<()>;

    fn duplicate_descriptor(&self, descriptor: HostDescriptor) -> HostResult<HostDescriptor>;
    fn close_descriptor(&self, descriptor: HostDescriptor);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn semaphore_op_layout_matches_host_records() {
        assert_eq!(core::mem::size_of::<HostSemaphoreOp>(), 16);
        let ops = [HostSemaphoreOp::new(HostHandle(0x10), 3)];
        let words: &[u64] = bytemuck::cast_slice(&ops);
        assert_eq!(words, &[0x10, 3]);
    }

    #[test]
    fn host_error_statuses() {
        assert_eq!(
            HostError::InvalidExternalHandle.status(),
            Status::ErrorInvalidExternalHandle
        );
        assert_eq!(
            HostError::InvalidUsage("x").status(),
            Status::ErrorValidationFailed
        );
    }
}
