//! External Resource Broker: guest cross-process handles ⇄ host transferable descriptors.
//!
//! Guest handles are kernel objects (see [`crate::kernel`]) wrapping a host descriptor plus
//! optional attachments. Guest handle-type flags are narrowed to what the host supports; every
//! guest kind collapses onto the host's opaque descriptor.
//!
//! Descriptor ownership on import: the broker duplicates the kernel object's descriptor and hands
//! the duplicate to the driver. A successful import consumes it; a failed one is closed here.

use std::sync::Arc;

use bitflags::bitflags;
use tracing::{debug, warn};

use crate::error::{BridgeError, Result};
use crate::host::{
    HostDriver, HostExternalCaps, HostHandle, HostHandleTypes, ImportedMemory,
};
use crate::kernel::{
    AccessRights, Attachment, Kernel, KernelHandle, KernelObject, KernelPayload,
    ObjectAttributes, OwnedDescriptor,
};

bitflags! {
    /// Guest memory handle types (`VkExternalMemoryHandleTypeFlagBits` values).
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct GuestMemoryHandleTypes: u32 {
        const OPAQUE_FD = 0x1;
        const OPAQUE_WIN32 = 0x2;
        const OPAQUE_WIN32_KMT = 0x4;
        const D3D11_TEXTURE = 0x8;
        const D3D11_TEXTURE_KMT = 0x10;
        const D3D12_HEAP = 0x20;
        const D3D12_RESOURCE = 0x40;
    }
}

bitflags! {
    /// Guest semaphore handle types (`VkExternalSemaphoreHandleTypeFlagBits` values).
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct GuestSemaphoreHandleTypes: u32 {
        const OPAQUE_FD = 0x1;
        const OPAQUE_WIN32 = 0x2;
        const OPAQUE_WIN32_KMT = 0x4;
        const D3D12_FENCE = 0x8;
        const SYNC_FD = 0x10;
    }
}

/// Guest memory kinds carried by kernel handles.
const KERNEL_MEMORY_TYPES: GuestMemoryHandleTypes = GuestMemoryHandleTypes::OPAQUE_WIN32
    .union(GuestMemoryHandleTypes::OPAQUE_WIN32_KMT)
    .union(GuestMemoryHandleTypes::D3D11_TEXTURE)
    .union(GuestMemoryHandleTypes::D3D11_TEXTURE_KMT)
    .union(GuestMemoryHandleTypes::D3D12_HEAP)
    .union(GuestMemoryHandleTypes::D3D12_RESOURCE);

const KERNEL_SEMAPHORE_TYPES: GuestSemaphoreHandleTypes = GuestSemaphoreHandleTypes::OPAQUE_WIN32
    .union(GuestSemaphoreHandleTypes::OPAQUE_WIN32_KMT)
    .union(GuestSemaphoreHandleTypes::D3D12_FENCE);

/// Narrows guest memory handle types to the host-supported set. An empty request stays empty.
pub fn negotiate_memory_types(
    requested: GuestMemoryHandleTypes,
    caps: &HostExternalCaps,
) -> Result<HostHandleTypes> {
    if requested.is_empty() {
        return Ok(HostHandleTypes::empty());
    }
    let mut host = HostHandleTypes::empty();
    if requested.intersects(KERNEL_MEMORY_TYPES) {
        host |= HostHandleTypes::OPAQUE_FD;
    }
    let host = host & caps.memory;
    if host.is_empty() {
        return Err(BridgeError::UnsupportedExternalHandle {
            requested: requested.bits(),
        });
    }
    Ok(host)
}

/// Narrows guest semaphore handle types to the host-supported set. An empty request stays empty.
pub fn negotiate_semaphore_types(
    requested: GuestSemaphoreHandleTypes,
    caps: &HostExternalCaps,
) -> Result<HostHandleTypes> {
    if requested.is_empty() {
        return Ok(HostHandleTypes::empty());
    }
    let mut host = HostHandleTypes::empty();
    if requested.intersects(KERNEL_SEMAPHORE_TYPES) {
        host |= HostHandleTypes::OPAQUE_FD;
    }
    let host = host & caps.semaphore;
    if host.is_empty() {
        return Err(BridgeError::UnsupportedExternalHandle {
            requested: requested.bits(),
        });
    }
    Ok(host)
}

/// Picks the single host type used for a transfer.
fn transfer_type(types: HostHandleTypes) -> HostHandleTypes {
    types
        .iter()
        .next()
        .unwrap_or(HostHandleTypes::OPAQUE_FD)
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExportInfo {
    pub name: Option<String>,
    pub attributes: ObjectAttributes,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ImportSource {
    Handle(KernelHandle),
    Name(String),
}

pub struct ExternalResourceBroker {
    host: Arc<dyn HostDriver>,
    kernel: Arc<Kernel>,
    device: HostHandle,
    caps: HostExternalCaps,
}

impl ExternalResourceBroker {
    pub fn new(
        host: Arc<dyn HostDriver>,
        kernel: Arc<Kernel>,
        device: HostHandle,
        caps: HostExternalCaps,
    ) -> Self {
        Self {
            host,
            kernel,
            device,
            caps,
        }
    }

    pub fn caps(&self) -> &HostExternalCaps {
        &self.caps
    }

    pub fn kernel(&self) -> &Arc<Kernel> {
        &self.kernel
    }

    pub fn negotiate_memory(&self, requested: GuestMemoryHandleTypes) -> Result<HostHandleTypes> {
        negotiate_memory_types(requested, &self.caps)
    }

    pub fn negotiate_semaphore(
        &self,
        requested: GuestSemaphoreHandleTypes,
    ) -> Result<HostHandleTypes> {
        negotiate_semaphore_types(requested, &self.caps)
    }

    /// Exports `memory` as a new kernel object carrying `attachments`.
    pub fn export_memory(
        &self,
        memory: HostHandle,
        size: u64,
        exportable: HostHandleTypes,
        info: &ExportInfo,
        attachments: Vec<(usize, Attachment)>,
    ) -> Result<KernelHandle> {
        let descriptor = self
            .host
            .export_memory(self.device, memory, transfer_type(exportable))?;
        let payload = KernelPayload::Memory {
            descriptor: OwnedDescriptor::new(Arc::clone(&self.host), descriptor),
            size,
        };
        self.publish(payload, info, attachments)
    }

    pub fn export_semaphore(
        &self,
        semaphore: HostHandle,
        exportable: HostHandleTypes,
        info: &ExportInfo,
        attachments: Vec<(usize, Attachment)>,
    ) -> Result<KernelHandle> {
        let descriptor = self
            .host
            .export_semaphore(self.device, semaphore, transfer_type(exportable))?;
        let payload = KernelPayload::Semaphore {
            descriptor: OwnedDescriptor::new(Arc::clone(&self.host), descriptor),
        };
        self.publish(payload, info, attachments)
    }

    /// Exports a semaphore to a bare owned descriptor, for use as an attachment.
    pub fn export_semaphore_descriptor(
        &self,
        semaphore: HostHandle,
        exportable: HostHandleTypes,
    ) -> Result<OwnedDescriptor> {
        let descriptor = self
            .host
            .export_semaphore(self.device, semaphore, transfer_type(exportable))?;
        Ok(OwnedDescriptor::new(Arc::clone(&self.host), descriptor))
    }

    fn publish(
        &self,
        payload: KernelPayload,
        info: &ExportInfo,
        attachments: Vec<(usize, Attachment)>,
    ) -> Result<KernelHandle> {
        let handle = self
            .kernel
            .create(payload, info.name.as_deref(), info.attributes)?;
        let attach = || -> Result<()> {
            let object = self.kernel.object(handle)?;
            for (index, attachment) in attachments {
                object.set_associated(index, attachment)?;
            }
            Ok(())
        };
        if let Err(err) = attach() {
            let _ = self.kernel.close(handle);
            return Err(err);
        }
        debug!(?handle, name = info.name.as_deref(), "broker: exported");
        Ok(handle)
    }

    /// Resolves an import source to its kernel object.
    pub fn resolve(&self, source: &ImportSource) -> Result<Arc<KernelObject>> {
        match source {
            ImportSource::Handle(handle) => Ok(self.kernel.object(*handle)?),
            ImportSource::Name(name) => {
                let handle = self
                    .kernel
                    .open(name, AccessRights::READ | AccessRights::WRITE)?;
                let object = self.kernel.object(handle);
                let _ = self.kernel.close(handle);
                Ok(object?)
            }
        }
    }

    /// Imports the memory behind `object`, requiring at least `size` bytes.
    pub fn import_memory(
        &self,
        object: &KernelObject,
        requested: GuestMemoryHandleTypes,
        size: u64,
    ) -> Result<ImportedMemory> {
        let ty = transfer_type(self.negotiate_memory(requested)?);
        let KernelPayload::Memory { descriptor, .. } = object.payload() else {
            return Err(BridgeError::InvalidExternalHandle("not a memory object"));
        };
        let duplicate = descriptor.try_clone()?;

        let imported = match self
            .host
            .import_memory(self.device, duplicate.raw(), ty, size)
        {
            Ok(imported) => {
                // Consumed by the driver.
                duplicate.into_raw();
                imported
            }
            Err(err) => {
                drop(duplicate);
                return Err(err.into());
            }
        };

        if imported.size < size {
            warn!(
                requested = size,
                actual = imported.size,
                "broker: imported allocation is smaller than requested"
            );
            self.host.free_memory(self.device, imported.memory);
            return Err(BridgeError::InvalidExternalHandle(
                "imported allocation is smaller than requested",
            ));
        }
        Ok(imported)
    }

    /// Replaces the payload of `semaphore` with the one behind `object`.
    pub fn import_semaphore(
        &self,
        object: &KernelObject,
        semaphore: HostHandle,
        requested: GuestSemaphoreHandleTypes,
    ) -> Result<()> {
        let ty = transfer_type(self.negotiate_semaphore(requested)?);
        let KernelPayload::Semaphore { descriptor } = object.payload() else {
            return Err(BridgeError::InvalidExternalHandle("not a semaphore object"));
        };
        self.import_semaphore_descriptor(descriptor, semaphore, ty)
    }

    /// Imports a duplicate of `descriptor` into `semaphore`.
    pub fn import_semaphore_descriptor(
        &self,
        descriptor: &OwnedDescriptor,
        semaphore: HostHandle,
        ty: HostHandleTypes,
    ) -> Result<()> {
        let duplicate = descriptor.try_clone()?;
        match self
            .host
            .import_semaphore(self.device, semaphore, duplicate.raw(), ty)
        {
            Ok(()) => {
                duplicate.into_raw();
                Ok(())
            }
            Err(err) => {
                drop(duplicate);
                Err(err.into())
            }
        }
    }
}
