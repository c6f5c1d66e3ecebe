//! Guest devices and the objects created from them.
//!
//! A [`Device`] owns one host device, its fence runtime (and therefore its Signaller thread) and
//! an [`ExternalResourceBroker`]. Every object it creates is registered in the owning instance's
//! [`ObjectRegistry`] with the device as parent, so destroying either tears the object down.

mod submit;

pub use submit::{KeyedMutexSyncInfo, SemaphoreSubmitInfo, SubmitInfo, SubmitInfo2};

use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use aero_sync_shared::WaitResolution;
use tracing::{debug, error};

use crate::error::{BridgeError, Result};
use crate::external::{
    ExportInfo, ExternalResourceBroker, GuestMemoryHandleTypes, GuestSemaphoreHandleTypes,
    ImportSource,
};
use crate::fence::{FenceRuntime, FenceSemaphore};
use crate::host::{
    HostDriver, HostHandle, HostHandleTypes, HostMemoryInfo, HostPhysicalDeviceProperties,
    HostSemaphoreInfo, HostSemaphoreOp, SemaphoreType, WaitMode,
};
use crate::instance::InstanceShared;
use crate::kernel::{Attachment, KernelHandle};
use crate::keyed_mutex::KeyedMutex;
use crate::object::{ContextId, GuestHandle, ObjectKind, ObjectRegistry, Wrapper};
use crate::stats::{BridgeStats, BridgeStatsSnapshot};
use crate::sync::{lock, read, write};

/// Attachment slot carrying the shared block of an exported fence-compatible semaphore.
pub const FENCE_SECTION_SLOT: usize = 1;

/// Per-kind state stored next to each registry entry.
#[derive(Clone)]
pub(crate) enum ObjectPayload {
    None,
    Device(Arc<FenceRuntime>),
    Semaphore(Arc<SemaphoreObject>),
    Memory(Arc<MemoryObject>),
}

#[derive(Clone)]
pub(crate) enum SemaphoreBacking {
    Host(HostHandle),
    Fence(FenceSemaphore),
}

pub(crate) struct SemaphoreObject {
    ty: SemaphoreType,
    export: HostHandleTypes,
    backing: RwLock<SemaphoreBacking>,
}

impl SemaphoreObject {
    fn backing(&self) -> SemaphoreBacking {
        read(&self.backing).clone()
    }
}

pub(crate) struct MemoryObject {
    size: u64,
    export: HostHandleTypes,
    keyed_mutex: Option<Arc<KeyedMutex>>,
    mapped: AtomicBool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SemaphoreCreateInfo {
    pub ty: SemaphoreType,
    pub initial_value: u64,
    /// Guest handle types the semaphore may be exported as. Including
    /// [`GuestSemaphoreHandleTypes::D3D12_FENCE`] makes it fence-compatible.
    pub export: GuestSemaphoreHandleTypes,
}

impl SemaphoreCreateInfo {
    pub fn binary() -> Self {
        Self {
            ty: SemaphoreType::Binary,
            initial_value: 0,
            export: GuestSemaphoreHandleTypes::empty(),
        }
    }

    pub fn timeline(initial_value: u64) -> Self {
        Self {
            ty: SemaphoreType::Timeline,
            initial_value,
            export: GuestSemaphoreHandleTypes::empty(),
        }
    }

    /// A fence-compatible timeline semaphore.
    pub fn fence(initial_value: u64) -> Self {
        Self {
            export: GuestSemaphoreHandleTypes::D3D12_FENCE,
            ..Self::timeline(initial_value)
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryAllocateInfo {
    pub size: u64,
    pub export: GuestMemoryHandleTypes,
    /// Attach a keyed mutex; requires a non-empty `export`.
    pub keyed_mutex: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemoryImportInfo {
    pub source: ImportSource,
    pub handle_types: GuestMemoryHandleTypes,
    pub size: u64,
}

pub struct Device {
    instance: Arc<InstanceShared>,
    handle: GuestHandle,
    host_device: HostHandle,
    properties: HostPhysicalDeviceProperties,
    runtime: Arc<FenceRuntime>,
    broker: ExternalResourceBroker,
    stats: Arc<BridgeStats>,
    queues: Mutex<HashMap<u32, GuestHandle>>,
}

impl Device {
    pub(crate) fn new(instance: Arc<InstanceShared>, physical: GuestHandle) -> Result<Self> {
        let host = Arc::clone(&instance.host);
        let host_physical = instance
            .registry
            .unwrap_kind(physical, ObjectKind::PhysicalDevice)?;
        let properties = host.physical_device_properties(host_physical)?;
        let host_device = host.create_device(host_physical)?;

        let stats = Arc::new(BridgeStats::new());
        let runtime = Arc::new(FenceRuntime::new(
            Arc::clone(&host),
            host_device,
            Arc::clone(&stats),
            instance.config.signaller_timeout,
        ));
        let handle = match instance.registry.wrap(
            host_device,
            ObjectKind::Device,
            physical,
            ObjectPayload::Device(Arc::clone(&runtime)),
        ) {
            Ok(handle) => handle,
            Err(err) => {
                host.destroy_device(host_device);
                return Err(err);
            }
        };
        let broker = ExternalResourceBroker::new(
            host,
            Arc::clone(&instance.kernel),
            host_device,
            properties.external,
        );

        debug!(
            device = ?handle,
            host = ?host_device,
            context = ?instance.registry.context(),
            "device: created"
        );
        Ok(Self {
            instance,
            handle,
            host_device,
            properties,
            runtime,
            broker,
            stats,
            queues: Mutex::new(HashMap::new()),
        })
    }

    pub fn handle(&self) -> GuestHandle {
        self.handle
    }

    pub fn context(&self) -> ContextId {
        self.registry().context()
    }

    pub fn properties(&self) -> &HostPhysicalDeviceProperties {
        &self.properties
    }

    pub fn stats(&self) -> BridgeStatsSnapshot {
        self.stats.snapshot()
    }

    fn host(&self) -> &dyn HostDriver {
        self.instance.host.as_ref()
    }

    fn registry(&self) -> &ObjectRegistry<ObjectPayload> {
        &self.instance.registry
    }

    /// Looks up an object of `kind` created from this device.
    fn owned(&self, handle: GuestHandle, kind: ObjectKind) -> Result<Wrapper<ObjectPayload>> {
        let wrapper = self.registry().get(handle, kind)?;
        if wrapper.parent != self.handle {
            return Err(BridgeError::InvalidHandle(handle));
        }
        Ok(wrapper)
    }

    fn semaphore(&self, handle: GuestHandle) -> Result<Arc<SemaphoreObject>> {
        match self.owned(handle, ObjectKind::Semaphore)?.payload {
            ObjectPayload::Semaphore(semaphore) => Ok(semaphore),
            _ => Err(BridgeError::InvalidHandle(handle)),
        }
    }

    fn memory(&self, handle: GuestHandle) -> Result<(HostHandle, Arc<MemoryObject>)> {
        let wrapper = self.owned(handle, ObjectKind::DeviceMemory)?;
        match wrapper.payload {
            ObjectPayload::Memory(memory) => Ok((wrapper.host, memory)),
            _ => Err(BridgeError::InvalidHandle(handle)),
        }
    }

    fn keyed_mutex(&self, memory: GuestHandle) -> Result<Arc<KeyedMutex>> {
        self.memory(memory)?
            .1
            .keyed_mutex
            .clone()
            .ok_or(BridgeError::InvalidParameter("memory has no keyed mutex"))
    }

    pub fn get_queue(&self, index: u32) -> Result<GuestHandle> {
        let mut queues = lock(&self.queues);
        if let Some(&queue) = queues.get(&index) {
            return Ok(queue);
        }
        let host_queue = self.host().get_queue(self.host_device, index)?;
        let queue = self.registry().wrap(
            host_queue,
            ObjectKind::Queue,
            self.handle,
            ObjectPayload::None,
        )?;
        queues.insert(index, queue);
        Ok(queue)
    }

    pub fn queue_wait_idle(&self, queue: GuestHandle) -> Result<()> {
        let host_queue = self.owned(queue, ObjectKind::Queue)?.host;
        Ok(self.host().queue_wait_idle(host_queue)?)
    }

    pub fn allocate_command_buffer(&self) -> Result<GuestHandle> {
        let cb = self.host().allocate_command_buffer(self.host_device)?;
        self.registry()
            .wrap(cb, ObjectKind::CommandBuffer, self.handle, ObjectPayload::None)
            .map_err(|err| {
                self.host().free_command_buffer(self.host_device, cb);
                err
            })
    }

    pub fn free_command_buffer(&self, command_buffer: GuestHandle) -> Result<()> {
        self.owned(command_buffer, ObjectKind::CommandBuffer)?;
        let wrapper = self.registry().remove(command_buffer)?;
        self.host().free_command_buffer(self.host_device, wrapper.host);
        Ok(())
    }

    pub fn create_semaphore(&self, info: &SemaphoreCreateInfo) -> Result<GuestHandle> {
        if info.ty == SemaphoreType::Timeline && !self.broker.caps().timeline_semaphore {
            return Err(BridgeError::FeatureNotPresent("timeline semaphores"));
        }
        let fence_compatible = info.export.contains(GuestSemaphoreHandleTypes::D3D12_FENCE);
        if fence_compatible && info.ty != SemaphoreType::Timeline {
            return Err(BridgeError::InvalidParameter(
                "fence-compatible semaphores must be timeline semaphores",
            ));
        }
        let export = self.broker.negotiate_semaphore(info.export)?;

        let backing = if fence_compatible {
            SemaphoreBacking::Fence(self.runtime.create_semaphore(info.initial_value, export)?)
        } else {
            SemaphoreBacking::Host(self.host().create_semaphore(
                self.host_device,
                &HostSemaphoreInfo {
                    ty: info.ty,
                    initial_value: info.initial_value,
                    export,
                },
            )?)
        };
        let host = match &backing {
            SemaphoreBacking::Host(semaphore) => *semaphore,
            SemaphoreBacking::Fence(fence) => fence.real,
        };

        let object = Arc::new(SemaphoreObject {
            ty: info.ty,
            export,
            backing: RwLock::new(backing),
        });
        match self.registry().wrap(
            host,
            ObjectKind::Semaphore,
            self.handle,
            ObjectPayload::Semaphore(Arc::clone(&object)),
        ) {
            Ok(handle) => {
                debug!(semaphore = ?handle, ?host, fence_compatible, "device: semaphore created");
                Ok(handle)
            }
            Err(err) => {
                self.release_backing(object.backing());
                Err(err)
            }
        }
    }

    fn release_backing(&self, backing: SemaphoreBacking) {
        match backing {
            SemaphoreBacking::Host(semaphore) => {
                self.host().destroy_semaphore(self.host_device, semaphore)
            }
            SemaphoreBacking::Fence(fence) => self.runtime.destroy_semaphore(&fence),
        }
    }

    pub fn destroy_semaphore(&self, semaphore: GuestHandle) -> Result<()> {
        let object = self.semaphore(semaphore)?;
        self.registry().remove(semaphore)?;
        self.release_backing(object.backing());
        Ok(())
    }

    /// Host-side signal of a timeline semaphore.
    pub fn signal_semaphore(&self, semaphore: GuestHandle, value: u64) -> Result<()> {
        let object = self.semaphore(semaphore)?;
        match object.backing() {
            SemaphoreBacking::Fence(fence) => self.runtime.signal_from_host(&fence, value),
            SemaphoreBacking::Host(_) if object.ty == SemaphoreType::Binary => Err(
                BridgeError::InvalidParameter("binary semaphores cannot be signalled from the host"),
            ),
            SemaphoreBacking::Host(host) => {
                Ok(self.host().signal_semaphore(self.host_device, host, value)?)
            }
        }
    }

    pub fn semaphore_counter_value(&self, semaphore: GuestHandle) -> Result<u64> {
        let object = self.semaphore(semaphore)?;
        match object.backing() {
            SemaphoreBacking::Fence(fence) => self.runtime.query(&fence),
            SemaphoreBacking::Host(_) if object.ty == SemaphoreType::Binary => Err(
                BridgeError::InvalidParameter("binary semaphores have no counter"),
            ),
            SemaphoreBacking::Host(host) => {
                Ok(self.host().semaphore_counter_value(self.host_device, host)?)
            }
        }
    }

    /// Blocks until any or all of `waits` are reached. Returns [`BridgeError::Timeout`] once
    /// `timeout` (`None` waits forever) expires.
    pub fn wait_semaphores(
        &self,
        waits: &[SemaphoreSubmitInfo],
        mode: WaitMode,
        timeout: Option<Duration>,
    ) -> Result<()> {
        enum Target {
            Host(HostHandle, u64),
            Fence {
                fence: FenceSemaphore,
                value: u64,
                since: u64,
            },
        }

        let mut targets = Vec::with_capacity(waits.len());
        for wait in waits {
            let object = self.semaphore(wait.semaphore)?;
            if object.ty == SemaphoreType::Binary {
                return Err(BridgeError::InvalidParameter(
                    "binary semaphores cannot be waited on from the host",
                ));
            }
            targets.push(match object.backing() {
                SemaphoreBacking::Host(host) => Target::Host(host, wait.value),
                SemaphoreBacking::Fence(fence) => {
                    let since = self.runtime.physical(&fence)?;
                    Target::Fence {
                        fence,
                        value: wait.value,
                        since,
                    }
                }
            });
        }
        if targets.is_empty() {
            return Ok(());
        }

        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut blockers = Vec::with_capacity(targets.len());
        loop {
            blockers.clear();
            let mut satisfied = 0;
            // Failing target, its error, and whether the error was latched by the Signaller.
            let mut failure: Option<(&FenceSemaphore, BridgeError, bool)> = None;
            for target in &targets {
                match target {
                    Target::Host(semaphore, value) => {
                        if self.host().semaphore_counter_value(self.host_device, *semaphore)?
                            >= *value
                        {
                            satisfied += 1;
                        } else {
                            blockers.push(HostSemaphoreOp::new(*semaphore, *value));
                        }
                    }
                    Target::Fence {
                        fence,
                        value,
                        since,
                    } => {
                        // Read before resolving so an apply racing the check still wakes us.
                        let physical = self.runtime.physical(fence)?;
                        match self.runtime.resolve(fence, *value, *since) {
                            Ok(WaitResolution::Satisfied) => satisfied += 1,
                            Ok(WaitResolution::Pending) => {
                                blockers.push(HostSemaphoreOp::new(fence.real, physical + 1));
                            }
                            Ok(WaitResolution::Unresolvable { dropped_physical }) => {
                                error!(
                                    semaphore = ?fence.real,
                                    value = *value,
                                    since = *since,
                                    dropped_physical,
                                    "device: host wait depends on a dropped reset"
                                );
                                failure.get_or_insert((
                                    fence,
                                    BridgeError::ResetBacklogOverflow {
                                        value: *value,
                                        dropped_physical,
                                    },
                                    false,
                                ));
                            }
                            Err(err @ BridgeError::ResetBacklogOverflow { .. }) => {
                                failure.get_or_insert((fence, err, true));
                            }
                            Err(err) => return Err(err),
                        }
                    }
                }
            }

            // Any-mode succeeds on one satisfied target even if another can never complete.
            let done = match mode {
                WaitMode::Any => satisfied > 0,
                WaitMode::All => blockers.is_empty() && failure.is_none(),
            };
            if done {
                return Ok(());
            }
            if let Some((fence, err, latched)) = failure {
                if latched {
                    self.runtime.clear_latched(fence);
                } else {
                    self.stats.inc_unresolvable_waits();
                }
                return Err(err);
            }

            let remaining = match deadline {
                None => None,
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(BridgeError::Timeout);
                    }
                    Some(deadline - now)
                }
            };
            self.host()
                .wait_semaphores(self.host_device, &blockers, WaitMode::Any, remaining)?;
        }
    }

    pub fn allocate_memory(&self, info: &MemoryAllocateInfo) -> Result<GuestHandle> {
        if info.size == 0 {
            return Err(BridgeError::InvalidParameter("allocation size must be non-zero"));
        }
        if info.keyed_mutex && info.export.is_empty() {
            return Err(BridgeError::InvalidParameter(
                "keyed-mutex memory must be exportable",
            ));
        }
        let export = self.broker.negotiate_memory(info.export)?;
        let memory = self.host().allocate_memory(
            self.host_device,
            &HostMemoryInfo {
                size: info.size,
                export,
            },
        )?;

        let keyed_mutex = if info.keyed_mutex {
            match KeyedMutex::create(self.host(), self.host_device) {
                Ok(keyed_mutex) => Some(Arc::new(keyed_mutex)),
                Err(err) => {
                    self.host().free_memory(self.host_device, memory);
                    return Err(err);
                }
            }
        } else {
            None
        };
        self.register_memory(
            memory,
            MemoryObject {
                size: info.size,
                export,
                keyed_mutex,
                mapped: AtomicBool::new(false),
            },
        )
    }

    fn register_memory(&self, memory: HostHandle, object: MemoryObject) -> Result<GuestHandle> {
        let object = Arc::new(object);
        self.registry()
            .wrap(
                memory,
                ObjectKind::DeviceMemory,
                self.handle,
                ObjectPayload::Memory(Arc::clone(&object)),
            )
            .map_err(|err| {
                release_memory(self.host(), self.host_device, memory, &object);
                err
            })
    }

    pub fn free_memory(&self, memory: GuestHandle) -> Result<()> {
        let (host, object) = self.memory(memory)?;
        self.registry().remove(memory)?;
        release_memory(self.host(), self.host_device, host, &object);
        Ok(())
    }

    /// Maps `memory`, at `placed` when given.
    ///
    /// # Safety
    ///
    /// A `placed` address must be valid for reads and writes of the allocation's size until the
    /// memory is unmapped or freed.
    pub unsafe fn map_memory(
        &self,
        memory: GuestHandle,
        placed: Option<NonNull<u8>>,
    ) -> Result<NonNull<u8>> {
        let (host, object) = self.memory(memory)?;
        if placed.is_some() && !self.broker.caps().placed_mapping {
            return Err(BridgeError::FeatureNotPresent("placed memory mapping"));
        }
        // SAFETY: forwarded from the caller's contract.
        let address = unsafe { self.host().map_memory(self.host_device, host, placed)? };
        object.mapped.store(true, Ordering::Release);
        Ok(address)
    }

    pub fn unmap_memory(&self, memory: GuestHandle) -> Result<()> {
        let (host, object) = self.memory(memory)?;
        self.host().unmap_memory(self.host_device, host);
        object.mapped.store(false, Ordering::Release);
        Ok(())
    }

    /// Exports `memory` (and its keyed mutex, if any) as a kernel object.
    pub fn export_memory(&self, memory: GuestHandle, info: &ExportInfo) -> Result<KernelHandle> {
        let (host, object) = self.memory(memory)?;
        if object.export.is_empty() {
            return Err(BridgeError::InvalidParameter(
                "memory was not allocated as exportable",
            ));
        }
        let attachments = match &object.keyed_mutex {
            Some(keyed_mutex) => keyed_mutex.attachments(&self.broker)?,
            None => Vec::new(),
        };
        self.broker
            .export_memory(host, object.size, object.export, info, attachments)
    }

    pub fn import_memory(&self, info: &MemoryImportInfo) -> Result<GuestHandle> {
        let export = self.broker.negotiate_memory(info.handle_types)?;
        let object = self.broker.resolve(&info.source)?;
        let imported = self
            .broker
            .import_memory(&object, info.handle_types, info.size)?;

        let keyed_mutex =
            match KeyedMutex::import(self.host(), self.host_device, &self.broker, &object) {
                Ok(keyed_mutex) => keyed_mutex.map(Arc::new),
                Err(err) => {
                    self.host().free_memory(self.host_device, imported.memory);
                    return Err(err);
                }
            };
        debug!(
            memory = ?imported.memory,
            size = imported.size,
            keyed_mutex = keyed_mutex.is_some(),
            "device: memory imported"
        );
        self.register_memory(
            imported.memory,
            MemoryObject {
                size: imported.size,
                export,
                keyed_mutex,
                mapped: AtomicBool::new(false),
            },
        )
    }

    /// Exports `semaphore`. A fence-compatible semaphore carries its shared block along.
    pub fn export_semaphore(
        &self,
        semaphore: GuestHandle,
        info: &ExportInfo,
    ) -> Result<KernelHandle> {
        let object = self.semaphore(semaphore)?;
        if object.export.is_empty() {
            return Err(BridgeError::InvalidParameter(
                "semaphore was not created as exportable",
            ));
        }
        match object.backing() {
            SemaphoreBacking::Host(host) => {
                self.broker
                    .export_semaphore(host, object.export, info, Vec::new())
            }
            SemaphoreBacking::Fence(fence) => self.broker.export_semaphore(
                fence.real,
                object.export,
                info,
                vec![(FENCE_SECTION_SLOT, Attachment::Section(fence.section.clone()))],
            ),
        }
    }

    /// Replaces the payload of `semaphore` with an exported one.
    ///
    /// Importing a fence (a D3D12-fence handle type, or an object carrying a shared block) makes
    /// the semaphore fence-compatible: it gets a new real semaphore sharing the exporter's
    /// payload, registered with this device's Signaller. The guest handle stays the same.
    pub fn import_semaphore(
        &self,
        semaphore: GuestHandle,
        source: &ImportSource,
        handle_types: GuestSemaphoreHandleTypes,
    ) -> Result<()> {
        let object = self.semaphore(semaphore)?;
        let kernel_object = self.broker.resolve(source)?;
        let section = kernel_object.associated_section(FENCE_SECTION_SLOT);

        if !handle_types.contains(GuestSemaphoreHandleTypes::D3D12_FENCE) && section.is_none() {
            return match object.backing() {
                SemaphoreBacking::Host(host) => {
                    self.broker
                        .import_semaphore(&kernel_object, host, handle_types)
                }
                SemaphoreBacking::Fence(_) => Err(BridgeError::InvalidParameter(
                    "fence-compatible semaphores only import fence handles",
                )),
            };
        }

        if object.ty != SemaphoreType::Timeline {
            return Err(BridgeError::InvalidParameter(
                "fence handles import into timeline semaphores only",
            ));
        }
        let section =
            section.ok_or(BridgeError::InvalidExternalHandle("fence shared block missing"))?;
        let real = self.host().create_semaphore(
            self.host_device,
            &HostSemaphoreInfo {
                export: object.export,
                ..HostSemaphoreInfo::timeline(0)
            },
        )?;
        if let Err(err) = self
            .broker
            .import_semaphore(&kernel_object, real, handle_types)
        {
            self.host().destroy_semaphore(self.host_device, real);
            return Err(err);
        }
        let fence = match self.runtime.adopt(real, section) {
            Ok(fence) => fence,
            Err(err) => {
                self.host().destroy_semaphore(self.host_device, real);
                return Err(err);
            }
        };
        if let Err(err) = self.registry().rebind(semaphore, real) {
            self.runtime.destroy_semaphore(&fence);
            return Err(err);
        }

        let previous = std::mem::replace(
            &mut *write(&object.backing),
            SemaphoreBacking::Fence(fence),
        );
        self.release_backing(previous);
        debug!(?semaphore, host = ?real, "device: fence imported");
        Ok(())
    }

    /// Acquires the keyed mutex of `memory` outside of a submission.
    pub fn acquire_keyed_mutex(
        &self,
        memory: GuestHandle,
        key: u64,
        timeout: Option<Duration>,
    ) -> Result<()> {
        self.keyed_mutex(memory)?
            .acquire(self.host(), self.host_device, self.context(), key, timeout)
    }

    /// Releases the keyed mutex of `memory` immediately.
    pub fn release_keyed_mutex(&self, memory: GuestHandle, key: u64) -> Result<()> {
        self.keyed_mutex(memory)?
            .release(self.host(), self.host_device, self.context(), key)
    }

    /// Destroys the device and every object created from it.
    pub fn destroy(self) {
        drop(self);
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        self.runtime.shutdown();
        let removed = self.registry().remove_children(self.handle);
        release_objects(
            self.host(),
            &[(self.handle, self.host_device)],
            &removed,
        );
        // Already gone if the instance was destroyed first.
        if self.registry().remove(self.handle).is_ok() {
            self.host().destroy_device(self.host_device);
        }
        debug!(device = ?self.handle, "device: destroyed");
    }
}

fn release_memory(host: &dyn HostDriver, device: HostHandle, memory: HostHandle, object: &MemoryObject) {
    if object.mapped.swap(false, Ordering::AcqRel) {
        host.unmap_memory(device, memory);
    }
    if let Some(keyed_mutex) = &object.keyed_mutex {
        host.destroy_semaphore(device, keyed_mutex.semaphore());
    }
    host.free_memory(device, memory);
}

/// Destroys the host side of registry entries removed in one sweep (deepest first).
///
/// Each object's host device is found through its parent among `known` and `removed`. Device
/// runtimes are stopped before anything else so no Signaller touches objects being destroyed.
pub(crate) fn release_objects(
    host: &dyn HostDriver,
    known: &[(GuestHandle, HostHandle)],
    removed: &[(GuestHandle, Wrapper<ObjectPayload>)],
) {
    let hosts: HashMap<GuestHandle, HostHandle> = known
        .iter()
        .copied()
        .chain(removed.iter().map(|(handle, wrapper)| (*handle, wrapper.host)))
        .collect();

    for (_, wrapper) in removed {
        if let ObjectPayload::Device(runtime) = &wrapper.payload {
            runtime.shutdown();
        }
    }

    for (handle, wrapper) in removed {
        let device = hosts
            .get(&wrapper.parent)
            .copied()
            .unwrap_or(HostHandle::NULL);
        match (&wrapper.kind, &wrapper.payload) {
            (ObjectKind::CommandBuffer, _) => host.free_command_buffer(device, wrapper.host),
            (ObjectKind::Semaphore, ObjectPayload::Semaphore(object)) => {
                // The runtime is stopped; only the real semaphore is left to destroy.
                let semaphore = match object.backing() {
                    SemaphoreBacking::Host(semaphore) => semaphore,
                    SemaphoreBacking::Fence(fence) => fence.real,
                };
                host.destroy_semaphore(device, semaphore);
            }
            (ObjectKind::DeviceMemory, ObjectPayload::Memory(object)) => {
                release_memory(host, device, wrapper.host, object)
            }
            (ObjectKind::Device, _) => host.destroy_device(wrapper.host),
            _ => {}
        }
        debug!(object = ?handle, kind = wrapper.kind.as_str(), "device: object released");
    }
}
