//! In-process kernel object namespace.
//!
//! Stands in for the OS facility that makes resources shareable across processes: kernel objects
//! carry a transferable payload (a host descriptor), optional name, access rights and a few
//! indexed attachments. Handles are issued from one table shared by every context created on the
//! same [`Kernel`], mirroring handles that were duplicated into the consuming process.
//!
//! Dropping the last reference to an object closes every host descriptor it owns.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use aero_sync_shared::SharedSection;
use bitflags::bitflags;
use tracing::debug;

use crate::error::Status;
use crate::host::{HostDescriptor, HostDriver, HostError};
use crate::sync::lock;

/// Number of attachment slots per kernel object.
pub const ATTACHMENT_SLOTS: usize = 4;

const DEFAULT_HANDLE_LIMIT: usize = 16 * 1024;

/// Kernel handle value. Valid handles are non-zero multiples of four.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KernelHandle(u32);

impl KernelHandle {
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn as_raw(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for KernelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KernelHandle({:#x})", self.0)
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct AccessRights: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const SYNCHRONIZE = 1 << 2;
        const ALL = Self::READ.bits() | Self::WRITE.bits() | Self::SYNCHRONIZE.bits();
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ObjectAttributes {
    /// Rights granted to handles opened by name.
    pub access: AccessRights,
    pub inherit: bool,
}

impl Default for ObjectAttributes {
    fn default() -> Self {
        Self {
            access: AccessRights::ALL,
            inherit: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KernelError {
    #[error("invalid kernel handle {0:?}")]
    InvalidHandle(KernelHandle),
    #[error("no kernel object named {0:?}")]
    NameNotFound(String),
    #[error("a kernel object named {0:?} already exists")]
    NameCollision(String),
    #[error("kernel handle table is full")]
    TableFull,
    #[error("requested access {requested:?} exceeds granted {granted:?}")]
    AccessDenied {
        requested: AccessRights,
        granted: AccessRights,
    },
    #[error("attachment index {0} out of range")]
    InvalidAttachmentIndex(usize),
}

impl KernelError {
    pub fn status(&self) -> Status {
        match self {
            Self::InvalidHandle(_) | Self::NameNotFound(_) | Self::AccessDenied { .. } => {
                Status::ErrorInvalidExternalHandle
            }
            Self::NameCollision(_) => Status::ErrorInitializationFailed,
            Self::TableFull => Status::ErrorTooManyObjects,
            Self::InvalidAttachmentIndex(_) => Status::ErrorValidationFailed,
        }
    }
}

/// A host descriptor closed on drop.
pub struct OwnedDescriptor {
    host: Arc<dyn HostDriver>,
    descriptor: HostDescriptor,
}

impl OwnedDescriptor {
    pub fn new(host: Arc<dyn HostDriver>, descriptor: HostDescriptor) -> Self {
        Self { host, descriptor }
    }

    pub fn raw(&self) -> HostDescriptor {
        self.descriptor
    }

    pub fn try_clone(&self) -> Result<Self, HostError> {
        let descriptor = self.host.duplicate_descriptor(self.descriptor)?;
        Ok(Self::new(Arc::clone(&self.host), descriptor))
    }

    /// Gives up ownership without closing.
    pub fn into_raw(self) -> HostDescriptor {
        let descriptor = self.descriptor;
        std::mem::forget(self);
        descriptor
    }
}

impl Drop for OwnedDescriptor {
    fn drop(&mut self) {
        self.host.close_descriptor(self.descriptor);
    }
}

impl fmt::Debug for OwnedDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("OwnedDescriptor").field(&self.descriptor.0).finish()
    }
}

#[derive(Debug)]
pub enum KernelPayload {
    Memory {
        descriptor: OwnedDescriptor,
        size: u64,
    },
    Semaphore {
        descriptor: OwnedDescriptor,
    },
}

#[derive(Debug)]
pub enum Attachment {
    Descriptor(OwnedDescriptor),
    Section(SharedSection),
}

#[derive(Debug)]
pub struct KernelObject {
    name: Option<String>,
    payload: KernelPayload,
    attributes: ObjectAttributes,
    attachments: Mutex<[Option<Attachment>; ATTACHMENT_SLOTS]>,
}

impl KernelObject {
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn payload(&self) -> &KernelPayload {
        &self.payload
    }

    pub fn attributes(&self) -> ObjectAttributes {
        self.attributes
    }

    /// Stores `attachment` at `index`, replacing (and releasing) whatever was there.
    pub fn set_associated(&self, index: usize, attachment: Attachment) -> Result<(), KernelError> {
        let previous = {
            let mut slots = self.attachments();
            let slot = slots
                .get_mut(index)
                .ok_or(KernelError::InvalidAttachmentIndex(index))?;
            slot.replace(attachment)
        };
        drop(previous);
        Ok(())
    }

    /// Duplicates the descriptor attached at `index`, if any.
    pub fn associated_descriptor(&self, index: usize) -> Result<Option<OwnedDescriptor>, HostError> {
        match self.attachments().get(index) {
            Some(Some(Attachment::Descriptor(descriptor))) => descriptor.try_clone().map(Some),
            _ => Ok(None),
        }
    }

    pub fn associated_section(&self, index: usize) -> Option<SharedSection> {
        match self.attachments().get(index) {
            Some(Some(Attachment::Section(section))) => Some(section.clone()),
            _ => None,
        }
    }

    fn attachments(&self) -> MutexGuard<'_, [Option<Attachment>; ATTACHMENT_SLOTS]> {
        lock(&self.attachments)
    }
}

struct HandleEntry {
    object: Arc<KernelObject>,
    access: AccessRights,
}

struct KernelState {
    handles: HashMap<KernelHandle, HandleEntry>,
    names: HashMap<String, Weak<KernelObject>>,
    free: Vec<KernelHandle>,
    next: u32,
}

impl KernelState {
    fn insert(&mut self, entry: HandleEntry, limit: usize) -> Result<KernelHandle, KernelError> {
        if self.handles.len() >= limit {
            return Err(KernelError::TableFull);
        }
        let handle = match self.free.pop() {
            Some(handle) => handle,
            None => {
                let next = self.next.checked_add(4).ok_or(KernelError::TableFull)?;
                self.next = next;
                KernelHandle(next)
            }
        };
        self.handles.insert(handle, entry);
        Ok(handle)
    }
}

pub struct Kernel {
    state: Mutex<KernelState>,
    handle_limit: usize,
}

impl Kernel {
    pub fn new() -> Self {
        Self::with_handle_limit(DEFAULT_HANDLE_LIMIT)
    }

    pub fn with_handle_limit(handle_limit: usize) -> Self {
        Self {
            state: Mutex::new(KernelState {
                handles: HashMap::new(),
                names: HashMap::new(),
                free: Vec::new(),
                next: 0,
            }),
            handle_limit,
        }
    }

    /// Creates a kernel object and returns a handle with full access to it.
    ///
    /// On failure `payload` is dropped, closing its descriptor.
    pub fn create(
        &self,
        payload: KernelPayload,
        name: Option<&str>,
        attributes: ObjectAttributes,
    ) -> Result<KernelHandle, KernelError> {
        let object = Arc::new(KernelObject {
            name: name.map(str::to_owned),
            payload,
            attributes,
            attachments: Mutex::new(Default::default()),
        });

        let mut state = lock(&self.state);
        if let Some(name) = name {
            let taken = state
                .names
                .get(name)
                .is_some_and(|existing| existing.strong_count() > 0);
            if taken {
                drop(state);
                return Err(KernelError::NameCollision(name.to_owned()));
            }
        }
        let handle = match state.insert(
            HandleEntry {
                object: Arc::clone(&object),
                access: AccessRights::ALL,
            },
            self.handle_limit,
        ) {
            Ok(handle) => handle,
            Err(err) => {
                drop(state);
                return Err(err);
            }
        };
        if let Some(name) = name {
            state.names.insert(name.to_owned(), Arc::downgrade(&object));
        }
        debug!(?handle, name, "kernel: object created");
        Ok(handle)
    }

    /// Opens a named object with the requested access.
    pub fn open(&self, name: &str, access: AccessRights) -> Result<KernelHandle, KernelError> {
        let mut state = lock(&self.state);
        let object = state
            .names
            .get(name)
            .and_then(Weak::upgrade)
            .ok_or_else(|| KernelError::NameNotFound(name.to_owned()))?;
        let granted = object.attributes.access;
        if !granted.contains(access) {
            return Err(KernelError::AccessDenied {
                requested: access,
                granted,
            });
        }
        state.insert(HandleEntry { object, access }, self.handle_limit)
    }

    pub fn duplicate(&self, handle: KernelHandle) -> Result<KernelHandle, KernelError> {
        let mut state = lock(&self.state);
        let entry = state
            .handles
            .get(&handle)
            .ok_or(KernelError::InvalidHandle(handle))?;
        let duplicate = HandleEntry {
            object: Arc::clone(&entry.object),
            access: entry.access,
        };
        state.insert(duplicate, self.handle_limit)
    }

    /// Closes `handle`. The object goes away with its last handle (or outstanding reference).
    pub fn close(&self, handle: KernelHandle) -> Result<(), KernelError> {
        let entry = {
            let mut state = lock(&self.state);
            let entry = state
                .handles
                .remove(&handle)
                .ok_or(KernelError::InvalidHandle(handle))?;
            state.free.push(handle);
            if let Some(name) = entry.object.name() {
                if Arc::strong_count(&entry.object) == 1 {
                    state.names.remove(name);
                }
            }
            entry
        };
        // Descriptors are closed outside the table lock.
        drop(entry);
        Ok(())
    }

    pub fn object(&self, handle: KernelHandle) -> Result<Arc<KernelObject>, KernelError> {
        lock(&self.state)
            .handles
            .get(&handle)
            .map(|entry| Arc::clone(&entry.object))
            .ok_or(KernelError::InvalidHandle(handle))
    }

    /// Access granted to `handle`.
    pub fn access(&self, handle: KernelHandle) -> Result<AccessRights, KernelError> {
        lock(&self.state)
            .handles
            .get(&handle)
            .map(|entry| entry.access)
            .ok_or(KernelError::InvalidHandle(handle))
    }

    pub fn handle_count(&self) -> usize {
        lock(&self.state).handles.len()
    }
}

impl Default for Kernel {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use aero_sync_shared::RecordKind;

    use crate::host::{HostHandleTypes, HostMemoryInfo, SoftDriver};

    fn exported_memory(driver: &Arc<SoftDriver>) -> OwnedDescriptor {
        let instance = driver.create_instance().unwrap();
        let physical = driver.enumerate_physical_devices(instance).unwrap()[0];
        let device = driver.create_device(physical).unwrap();
        let memory = driver
            .allocate_memory(
                device,
                &HostMemoryInfo {
                    size: 64,
                    export: HostHandleTypes::OPAQUE_FD,
                },
            )
            .unwrap();
        let fd = driver
            .export_memory(device, memory, HostHandleTypes::OPAQUE_FD)
            .unwrap();
        OwnedDescriptor::new(driver.clone(), fd)
    }

    #[test]
    fn handles_are_multiples_of_four() {
        let driver = Arc::new(SoftDriver::new());
        let kernel = Kernel::new();
        let handle = kernel
            .create(
                KernelPayload::Memory {
                    descriptor: exported_memory(&driver),
                    size: 64,
                },
                None,
                ObjectAttributes::default(),
            )
            .unwrap();
        assert_eq!(handle.as_raw() % 4, 0);
        assert_ne!(handle.as_raw(), 0);
    }

    #[test]
    fn last_close_releases_descriptors() {
        let driver = Arc::new(SoftDriver::new());
        let kernel = Kernel::new();
        let handle = kernel
            .create(
                KernelPayload::Memory {
                    descriptor: exported_memory(&driver),
                    size: 64,
                },
                Some("surface"),
                ObjectAttributes::default(),
            )
            .unwrap();
        let object = kernel.object(handle).unwrap();
        object
            .set_associated(1, Attachment::Section(SharedSection::create(RecordKind::KeyedMutex).unwrap()))
            .unwrap();
        drop(object);

        let dup = kernel.duplicate(handle).unwrap();
        assert_eq!(driver.live_descriptors(), 1);
        kernel.close(handle).unwrap();
        assert_eq!(driver.live_descriptors(), 1);
        kernel.close(dup).unwrap();
        assert_eq!(driver.live_descriptors(), 0);
        assert_eq!(
            kernel.open("surface", AccessRights::READ),
            Err(KernelError::NameNotFound("surface".into()))
        );
    }

    #[test]
    fn name_collision_closes_the_new_payload() {
        let driver = Arc::new(SoftDriver::new());
        let kernel = Kernel::new();
        kernel
            .create(
                KernelPayload::Memory {
                    descriptor: exported_memory(&driver),
                    size: 64,
                },
                Some("shared"),
                ObjectAttributes::default(),
            )
            .unwrap();
        let err = kernel.create(
            KernelPayload::Memory {
                descriptor: exported_memory(&driver),
                size: 64,
            },
            Some("shared"),
            ObjectAttributes::default(),
        );
        assert_eq!(err, Err(KernelError::NameCollision("shared".into())));
        assert_eq!(driver.live_descriptors(), 1);
    }

    #[test]
    fn open_respects_granted_access() {
        let driver = Arc::new(SoftDriver::new());
        let kernel = Kernel::new();
        kernel
            .create(
                KernelPayload::Memory {
                    descriptor: exported_memory(&driver),
                    size: 64,
                },
                Some("ro"),
                ObjectAttributes {
                    access: AccessRights::READ,
                    inherit: false,
                },
            )
            .unwrap();

        let handle = kernel.open("ro", AccessRights::READ).unwrap();
        assert_eq!(kernel.access(handle), Ok(AccessRights::READ));
        assert_eq!(
            kernel.open("ro", AccessRights::WRITE),
            Err(KernelError::AccessDenied {
                requested: AccessRights::WRITE,
                granted: AccessRights::READ,
            })
        );
    }

    #[test]
    fn attachment_index_is_bounded() {
        let driver = Arc::new(SoftDriver::new());
        let kernel = Kernel::new();
        let handle = kernel
            .create(
                KernelPayload::Memory {
                    descriptor: exported_memory(&driver),
                    size: 64,
                },
                None,
                ObjectAttributes::default(),
            )
            .unwrap();
        let object = kernel.object(handle).unwrap();
        let section = SharedSection::create(RecordKind::SyncBlock).unwrap();
        assert_eq!(
            object.set_associated(ATTACHMENT_SLOTS, Attachment::Section(section)),
            Err(KernelError::InvalidAttachmentIndex(ATTACHMENT_SLOTS))
        );
        assert!(object.associated_section(0).is_none());
    }
}
