use aero_sync_shared::LayoutError;

use crate::host::HostError;
use crate::kernel::KernelError;
use crate::object::GuestHandle;

pub type Result<T> = std::result::Result<T, BridgeError>;

/// Guest-visible status codes (numerically compatible with `VkResult`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum Status {
    Success = 0,
    Timeout = 2,
    ErrorOutOfHostMemory = -1,
    ErrorOutOfDeviceMemory = -2,
    ErrorInitializationFailed = -3,
    ErrorDeviceLost = -4,
    ErrorMemoryMapFailed = -5,
    ErrorFeatureNotPresent = -8,
    ErrorTooManyObjects = -10,
    ErrorUnknown = -13,
    ErrorInvalidExternalHandle = -1_000_072_003,
    ErrorValidationFailed = -1_000_011_001,
}

impl Status {
    pub fn as_raw(self) -> i32 {
        self as i32
    }

    /// `Success` and `Timeout` are non-error statuses.
    pub fn is_error(self) -> bool {
        self.as_raw() < 0
    }
}

/// Unified error type for the translation layer.
///
/// Variants fall into four groups: capability mismatches (never retried), resource exhaustion,
/// contention timeouts (reported with the non-error [`Status::Timeout`]) and protocol violations.
/// Host driver errors pass through unchanged in [`BridgeError::Host`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BridgeError {
    #[error("out of host memory")]
    OutOfHostMemory,

    #[error("too many objects")]
    TooManyObjects,

    #[error("no host-supported handle type for guest handle types {requested:#x}")]
    UnsupportedExternalHandle { requested: u32 },

    #[error("feature not present: {0}")]
    FeatureNotPresent(&'static str),

    #[error("timed out")]
    Timeout,

    #[error("keyed mutex is already acquired by this context")]
    KeyedMutexAlreadyAcquired,

    #[error("keyed mutex is not held by this context")]
    KeyedMutexNotOwned,

    /// A wait depends on a reset checkpoint that was evicted from the shared backlog.
    #[error(
        "wait for value {value} cannot be resolved: reset history dropped at physical value {dropped_physical}"
    )]
    ResetBacklogOverflow { value: u64, dropped_physical: u64 },

    #[error("invalid handle {0:?}")]
    InvalidHandle(GuestHandle),

    #[error("owning context was destroyed")]
    ContextDestroyed,

    #[error("invalid parameter: {0}")]
    InvalidParameter(&'static str),

    #[error("invalid external handle: {0}")]
    InvalidExternalHandle(&'static str),

    #[error("host driver error: {0}")]
    Host(#[from] HostError),

    #[error("kernel object error: {0}")]
    Kernel(#[from] KernelError),

    #[error("shared section error: {0}")]
    Layout(#[from] LayoutError),
}

impl BridgeError {
    pub fn status(&self) -> Status {
        match self {
            Self::OutOfHostMemory => Status::ErrorOutOfHostMemory,
            Self::TooManyObjects => Status::ErrorTooManyObjects,
            Self::UnsupportedExternalHandle { .. } | Self::InvalidExternalHandle(_) => {
                Status::ErrorInvalidExternalHandle
            }
            Self::FeatureNotPresent(_) => Status::ErrorFeatureNotPresent,
            Self::Timeout => Status::Timeout,
            Self::KeyedMutexAlreadyAcquired
            | Self::KeyedMutexNotOwned
            | Self::ResetBacklogOverflow { .. } => Status::ErrorUnknown,
            Self::InvalidHandle(_) | Self::InvalidParameter(_) => Status::ErrorValidationFailed,
            Self::ContextDestroyed => Status::ErrorDeviceLost,
            Self::Host(err) => err.status(),
            Self::Kernel(err) => err.status(),
            Self::Layout(LayoutError::OutOfMemory { .. }) => Status::ErrorOutOfHostMemory,
            Self::Layout(_) => Status::ErrorInvalidExternalHandle,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_is_a_non_error_status() {
        assert_eq!(BridgeError::Timeout.status(), Status::Timeout);
        assert!(!BridgeError::Timeout.status().is_error());
        assert!(BridgeError::KeyedMutexAlreadyAcquired.status().is_error());
    }

    #[test]
    fn capability_mismatch_maps_to_invalid_external_handle() {
        let err = BridgeError::UnsupportedExternalHandle { requested: 0x8 };
        assert_eq!(err.status(), Status::ErrorInvalidExternalHandle);
        assert_eq!(err.status().as_raw(), -1_000_072_003);
    }

    #[test]
    fn host_errors_pass_through() {
        let err = BridgeError::from(HostError::DeviceLost);
        assert_eq!(err.status(), Status::ErrorDeviceLost);
        let err = BridgeError::from(HostError::OutOfDeviceMemory);
        assert_eq!(err.status(), Status::ErrorOutOfDeviceMemory);
    }

    #[test]
    fn section_allocation_failure_is_out_of_memory() {
        let err = BridgeError::from(LayoutError::OutOfMemory { bytes: 384 });
        assert_eq!(err.status(), Status::ErrorOutOfHostMemory);
        let err = BridgeError::from(LayoutError::BadMagic(0));
        assert_eq!(err.status(), Status::ErrorInvalidExternalHandle);
    }
}
