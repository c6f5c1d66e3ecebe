//! Software reference implementation of [`HostDriver`].
//!
//! Semantics follow the host API closely enough to exercise the translation layer end to end:
//!
//! - timeline semaphores have monotonically increasing 64-bit payloads; binary semaphores are
//!   signalled by submissions and consumed by the submission that waits on them,
//! - every queue runs its submissions in order on a dedicated worker thread, blocking each batch
//!   until its waits are satisfied,
//! - memory and semaphores can be exported to descriptors, descriptors duplicated and imported
//!   (import shares the payload, like an fd import),
//! - validation problems are reported through the owning instance's debug sink.
//!
//! All object state lives behind one mutex; a condition variable is notified whenever a semaphore
//! payload changes.

use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::{
    DebugSeverity, HostDebugMessage, HostDebugSink, HostDescriptor, HostDriver, HostError,
    HostExternalCaps, HostHandle, HostHandleTypes, HostMemoryInfo, HostPhysicalDeviceProperties,
    HostResult, HostSemaphoreInfo, HostSemaphoreOp, HostSubmitInfo, ImportedMemory,
    SemaphoreType, WaitMode, WaitOutcome,
};
use crate::object::ObjectKind;
use crate::sync::{lock, wait, wait_timeout};

const FIRST_HANDLE: u64 = 0x1000;
const FIRST_DESCRIPTOR: i32 = 3;

#[derive(Clone, Debug)]
pub struct SoftDriverConfig {
    pub caps: HostExternalCaps,
    /// Physical devices reported per instance.
    pub physical_devices: usize,
    pub device_memory_budget: u64,
    pub max_objects: usize,
}

impl Default for SoftDriverConfig {
    fn default() -> Self {
        Self {
            caps: HostExternalCaps {
                memory: HostHandleTypes::OPAQUE_FD | HostHandleTypes::DMA_BUF,
                semaphore: HostHandleTypes::OPAQUE_FD | HostHandleTypes::SYNC_FD,
                placed_mapping: true,
                timeline_semaphore: true,
            },
            physical_devices: 1,
            device_memory_budget: 256 * 1024 * 1024,
            max_objects: 64 * 1024,
        }
    }
}

struct SemaphorePayload {
    ty: SemaphoreType,
    value: AtomicU64,
}

impl SemaphorePayload {
    fn is_signalled(&self, target: u64) -> bool {
        match self.ty {
            SemaphoreType::Timeline => self.value.load(Ordering::Acquire) >= target,
            SemaphoreType::Binary => self.value.load(Ordering::Acquire) != 0,
        }
    }

    fn signal(&self, value: u64) {
        match self.ty {
            SemaphoreType::Timeline => {
                self.value.fetch_max(value, Ordering::AcqRel);
            }
            SemaphoreType::Binary => self.value.store(1, Ordering::Release),
        }
    }

    fn consume(&self) {
        if self.ty == SemaphoreType::Binary {
            self.value.store(0, Ordering::Release);
        }
    }
}

/// Backing bytes of a memory allocation, shared by every import of it.
struct MemoryStorage {
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: the bytes are only reached through raw pointers; the driver never creates references
// into them, so concurrent mappings cannot alias Rust references.
unsafe impl Send for MemoryStorage {}
unsafe impl Sync for MemoryStorage {}

impl MemoryStorage {
    fn new(len: usize) -> HostResult<Self> {
        let mut bytes: Vec<u8> = Vec::new();
        bytes
            .try_reserve_exact(len)
            .map_err(|_| HostError::OutOfHostMemory)?;
        bytes.resize(len, 0);
        let ptr = NonNull::from(Box::leak(bytes.into_boxed_slice())).cast::<u8>();
        Ok(Self { ptr, len })
    }
}

impl Drop for MemoryStorage {
    fn drop(&mut self) {
        let slice = core::ptr::slice_from_raw_parts_mut(self.ptr.as_ptr(), self.len);
        // SAFETY: allocated by `Box::leak` in `new` with exactly this length.
        drop(unsafe { Box::from_raw(slice) });
    }
}

struct Mapping {
    /// Address handed out, stored as an integer so the state stays `Send`.
    address: usize,
    placed: bool,
}

enum QueueJob {
    Submit(Vec<Batch>),
    Idle(mpsc::Sender<()>),
}

struct Batch {
    waits: Vec<Arc<SemaphorePayload>>,
    wait_values: Vec<u64>,
    command_buffers: Vec<HostHandle>,
    signals: Vec<(Arc<SemaphorePayload>, u64)>,
}

enum Object {
    Instance {
        sink: Option<HostDebugSink>,
        physical_devices: Vec<u64>,
    },
    PhysicalDevice,
    Device {
        instance: u64,
        queue: u64,
    },
    Queue {
        device: u64,
        jobs: mpsc::Sender<QueueJob>,
        stop: Arc<AtomicBool>,
        worker: Option<JoinHandle<()>>,
    },
    CommandBuffer {
        device: u64,
    },
    Semaphore {
        device: u64,
        payload: Arc<SemaphorePayload>,
        export: HostHandleTypes,
    },
    Memory {
        device: u64,
        storage: Arc<MemoryStorage>,
        export: HostHandleTypes,
        accounted: u64,
        mapping: Option<Mapping>,
    },
}

impl Object {
    fn owner_device(&self) -> Option<u64> {
        match self {
            Self::Queue { device, .. }
            | Self::CommandBuffer { device }
            | Self::Semaphore { device, .. }
            | Self::Memory { device, .. } => Some(*device),
            _ => None,
        }
    }
}

enum DescriptorTarget {
    Memory(Arc<MemoryStorage>),
    Semaphore(Arc<SemaphorePayload>),
}

impl Clone for DescriptorTarget {
    fn clone(&self) -> Self {
        match self {
            Self::Memory(storage) => Self::Memory(Arc::clone(storage)),
            Self::Semaphore(payload) => Self::Semaphore(Arc::clone(payload)),
        }
    }
}

struct SoftState {
    objects: HashMap<u64, Object>,
    free_handles: Vec<u64>,
    next_handle: u64,
    descriptors: HashMap<i32, (DescriptorTarget, HostHandleTypes)>,
    next_descriptor: i32,
    memory_in_use: u64,
    executed: HashMap<u64, Vec<HostHandle>>,
    injected_submit_failure: Option<HostError>,
}

impl SoftState {
    fn insert(&mut self, object: Object, max_objects: usize) -> HostResult<u64> {
        if self.objects.len() >= max_objects {
            return Err(HostError::TooManyObjects);
        }
        let handle = self.free_handles.pop().unwrap_or_else(|| {
            let handle = self.next_handle;
            self.next_handle += 1;
            handle
        });
        self.objects.insert(handle, object);
        Ok(handle)
    }

    fn remove(&mut self, handle: u64) -> Option<Object> {
        let object = self.objects.remove(&handle)?;
        self.free_handles.push(handle);
        Some(object)
    }

    fn new_descriptor(&mut self, target: DescriptorTarget, ty: HostHandleTypes) -> HostDescriptor {
        let fd = self.next_descriptor;
        self.next_descriptor += 1;
        self.descriptors.insert(fd, (target, ty));
        HostDescriptor(fd)
    }

    fn semaphore(&self, device: u64, semaphore: HostHandle) -> HostResult<&Arc<SemaphorePayload>> {
        match self.objects.get(&semaphore.0) {
            Some(Object::Semaphore {
                device: owner,
                payload,
                ..
            }) if *owner == device => Ok(payload),
            _ => Err(HostError::InvalidUsage("unknown semaphore")),
        }
    }

    fn sink_for_device(&self, device: u64) -> Option<HostDebugSink> {
        match self.objects.get(&device) {
            Some(Object::Device { instance, .. }) => self.sink_for_instance(*instance),
            _ => None,
        }
    }

    fn sink_for_instance(&self, instance: u64) -> Option<HostDebugSink> {
        match self.objects.get(&instance) {
            Some(Object::Instance { sink, .. }) => sink.clone(),
            _ => None,
        }
    }
}

struct Shared {
    state: Mutex<SoftState>,
    changed: Condvar,
}

pub struct SoftDriver {
    shared: Arc<Shared>,
    config: SoftDriverConfig,
}

impl SoftDriver {
    pub fn new() -> Self {
        Self::with_config(SoftDriverConfig::default())
    }

    pub fn with_caps(caps: HostExternalCaps) -> Self {
        Self::with_config(SoftDriverConfig {
            caps,
            ..SoftDriverConfig::default()
        })
    }

    pub fn with_config(config: SoftDriverConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(SoftState {
                    objects: HashMap::new(),
                    free_handles: Vec::new(),
                    next_handle: FIRST_HANDLE,
                    descriptors: HashMap::new(),
                    next_descriptor: FIRST_DESCRIPTOR,
                    memory_in_use: 0,
                    executed: HashMap::new(),
                    injected_submit_failure: None,
                }),
                changed: Condvar::new(),
            }),
            config,
        }
    }

    fn state(&self) -> MutexGuard<'_, SoftState> {
        lock(&self.shared.state)
    }

    /// Descriptors currently open (exported, duplicated and not yet imported or closed).
    pub fn live_descriptors(&self) -> usize {
        self.state().descriptors.len()
    }

    /// Objects of `kind` currently alive across all instances.
    pub fn live_objects(&self, kind: ObjectKind) -> usize {
        self.state()
            .objects
            .values()
            .filter(|object| {
                matches!(
                    (kind, object),
                    (ObjectKind::Instance, Object::Instance { .. })
                        | (ObjectKind::PhysicalDevice, Object::PhysicalDevice)
                        | (ObjectKind::Device, Object::Device { .. })
                        | (ObjectKind::Queue, Object::Queue { .. })
                        | (ObjectKind::CommandBuffer, Object::CommandBuffer { .. })
                        | (ObjectKind::Semaphore, Object::Semaphore { .. })
                        | (ObjectKind::DeviceMemory, Object::Memory { .. })
                )
            })
            .count()
    }

    /// Command buffers executed by `queue` so far, in execution order.
    pub fn executed_command_buffers(&self, queue: HostHandle) -> Vec<HostHandle> {
        self.state()
            .executed
            .get(&queue.0)
            .cloned()
            .unwrap_or_default()
    }

    /// Makes the next `queue_submit` fail with `err` before any work is queued.
    pub fn fail_next_submit(&self, err: HostError) {
        self.state().injected_submit_failure = Some(err);
    }

    /// Delivers `message` through the debug sink of `instance`, as a driver-internal thread would.
    pub fn emit_debug_message(&self, instance: HostHandle, message: &HostDebugMessage) {
        let sink = self.state().sink_for_instance(instance.0);
        if let Some(sink) = sink {
            sink(message);
        }
    }

    fn report(sink: Option<HostDebugSink>, message: &'static str, objects: Vec<(ObjectKind, HostHandle)>) {
        warn!(reason = message, ?objects, "soft driver: validation error");
        if let Some(sink) = sink {
            sink(&HostDebugMessage {
                severity: DebugSeverity::Error,
                message: message.to_string(),
                objects,
            });
        }
    }

    fn notify(&self) {
        self.shared.changed.notify_all();
    }

    fn spawn_queue(&self, state: &mut SoftState, device: u64) -> HostResult<u64> {
        let (jobs, receiver) = mpsc::channel();
        let stop = Arc::new(AtomicBool::new(false));
        let queue = state.insert(
            Object::Queue {
                device,
                jobs,
                stop: Arc::clone(&stop),
                worker: None,
            },
            self.config.max_objects,
        )?;

        let shared = Arc::clone(&self.shared);
        let worker = std::thread::Builder::new()
            .name(format!("soft-queue-{queue:#x}"))
            .spawn(move || run_queue(&shared, queue, &stop, receiver));
        match worker {
            Ok(handle) => {
                if let Some(Object::Queue { worker, .. }) = state.objects.get_mut(&queue) {
                    *worker = Some(handle);
                }
                Ok(queue)
            }
            Err(_) => {
                state.remove(queue);
                Err(HostError::OutOfHostMemory)
            }
        }
    }
}

impl Default for SoftDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SoftDriver {
    fn drop(&mut self) {
        let devices: Vec<u64> = self
            .state()
            .objects
            .iter()
            .filter(|(_, object)| matches!(object, Object::Device { .. }))
            .map(|(handle, _)| *handle)
            .collect();
        for device in devices {
            self.destroy_device(HostHandle(device));
        }
    }
}

fn run_queue(shared: &Shared, queue: u64, stop: &AtomicBool, jobs: mpsc::Receiver<QueueJob>) {
    while let Ok(job) = jobs.recv() {
        let batches = match job {
            QueueJob::Idle(done) => {
                let _ = done.send(());
                continue;
            }
            QueueJob::Submit(batches) => batches,
        };

        for batch in batches {
            let mut state = lock(&shared.state);
            loop {
                if stop.load(Ordering::Acquire) {
                    return;
                }
                let ready = batch
                    .waits
                    .iter()
                    .zip(&batch.wait_values)
                    .all(|(payload, value)| payload.is_signalled(*value));
                if ready {
                    break;
                }
                state = wait(&shared.changed, state);
            }

            for payload in &batch.waits {
                payload.consume();
            }
            state
                .executed
                .entry(queue)
                .or_default()
                .extend_from_slice(&batch.command_buffers);
            for (payload, value) in &batch.signals {
                payload.signal(*value);
            }
            drop(state);
            shared.changed.notify_all();
        }
    }
}

impl HostDriver for SoftDriver {
    fn create_instance(&self) -> HostResult<HostHandle> {
        let mut state = self.state();
        let mut physical_devices = Vec::with_capacity(self.config.physical_devices);
        for _ in 0..self.config.physical_devices {
            physical_devices.push(state.insert(Object::PhysicalDevice, self.config.max_objects)?);
        }
        let instance = state.insert(
            Object::Instance {
                sink: None,
                physical_devices,
            },
            self.config.max_objects,
        )?;
        Ok(HostHandle(instance))
    }

    fn destroy_instance(&self, instance: HostHandle) {
        let devices: Vec<u64> = {
            let state = self.state();
            if !matches!(state.objects.get(&instance.0), Some(Object::Instance { .. })) {
                return;
            }
            state
                .objects
                .iter()
                .filter(|(_, object)| matches!(object, Object::Device { instance: owner, .. } if *owner == instance.0))
                .map(|(handle, _)| *handle)
                .collect()
        };
        for device in devices {
            self.destroy_device(HostHandle(device));
        }

        let mut state = self.state();
        if let Some(Object::Instance {
            physical_devices, ..
        }) = state.remove(instance.0)
        {
            for physical in physical_devices {
                state.remove(physical);
            }
        }
    }

    fn set_debug_sink(&self, instance: HostHandle, sink: Option<HostDebugSink>) -> HostResult<()> {
        let mut state = self.state();
        match state.objects.get_mut(&instance.0) {
            Some(Object::Instance { sink: slot, .. }) => {
                *slot = sink;
                Ok(())
            }
            _ => Err(HostError::InvalidUsage("unknown instance")),
        }
    }

    fn enumerate_physical_devices(&self, instance: HostHandle) -> HostResult<Vec<HostHandle>> {
        match self.state().objects.get(&instance.0) {
            Some(Object::Instance {
                physical_devices, ..
            }) => Ok(physical_devices.iter().copied().map(HostHandle).collect()),
            _ => Err(HostError::InvalidUsage("unknown instance")),
        }
    }

    fn physical_device_properties(
        &self,
        physical_device: HostHandle,
    ) -> HostResult<HostPhysicalDeviceProperties> {
        match self.state().objects.get(&physical_device.0) {
            Some(Object::PhysicalDevice) => Ok(HostPhysicalDeviceProperties {
                name: "aero soft device".to_string(),
                vendor_id: 0x1af4,
                device_id: 0x0001,
                external: self.config.caps,
            }),
            _ => Err(HostError::InvalidUsage("unknown physical device")),
        }
    }

    fn create_device(&self, physical_device: HostHandle) -> HostResult<HostHandle> {
        let mut state = self.state();
        let instance = state
            .objects
            .iter()
            .find_map(|(handle, object)| match object {
                Object::Instance {
                    physical_devices, ..
                } if physical_devices.contains(&physical_device.0) => Some(*handle),
                _ => None,
            })
            .ok_or(HostError::InvalidUsage("unknown physical device"))?;

        let device = state.insert(
            Object::Device {
                instance,
                queue: 0,
            },
            self.config.max_objects,
        )?;
        let queue = match self.spawn_queue(&mut state, device) {
            Ok(queue) => queue,
            Err(err) => {
                state.remove(device);
                return Err(err);
            }
        };
        if let Some(Object::Device { queue: slot, .. }) = state.objects.get_mut(&device) {
            *slot = queue;
        }
        debug!(device = ?HostHandle(device), "soft driver: device created");
        Ok(HostHandle(device))
    }

    fn destroy_device(&self, device: HostHandle) {
        let mut workers = Vec::new();
        {
            let mut state = self.state();
            if !matches!(state.objects.get(&device.0), Some(Object::Device { .. })) {
                return;
            }
            let owned: Vec<u64> = state
                .objects
                .iter()
                .filter(|(_, object)| object.owner_device() == Some(device.0))
                .map(|(handle, _)| *handle)
                .collect();
            for handle in owned {
                match state.remove(handle) {
                    Some(Object::Queue {
                        jobs, stop, worker, ..
                    }) => {
                        stop.store(true, Ordering::Release);
                        workers.push((jobs, worker));
                        state.executed.remove(&handle);
                    }
                    Some(Object::Memory { accounted, .. }) => {
                        state.memory_in_use -= accounted;
                    }
                    _ => {}
                }
            }
            state.remove(device.0);
        }
        self.notify();

        for (jobs, worker) in workers {
            drop(jobs);
            if let Some(worker) = worker {
                let _ = worker.join();
            }
        }
        debug!(device = ?device, "soft driver: device destroyed");
    }

    fn get_queue(&self, device: HostHandle, index: u32) -> HostResult<HostHandle> {
        match self.state().objects.get(&device.0) {
            Some(Object::Device { queue, .. }) if index == 0 => Ok(HostHandle(*queue)),
            Some(Object::Device { .. }) => Err(HostError::InvalidUsage("queue index out of range")),
            _ => Err(HostError::InvalidUsage("unknown device")),
        }
    }

    fn queue_submit(&self, queue: HostHandle, submits: &[HostSubmitInfo<'_>]) -> HostResult<()> {
        let mut state = self.state();
        let device = match state.objects.get(&queue.0) {
            Some(Object::Queue { device, .. }) => *device,
            _ => return Err(HostError::InvalidUsage("unknown queue")),
        };
        if let Some(err) = state.injected_submit_failure.take() {
            return Err(err);
        }

        let mut batches = Vec::with_capacity(submits.len());
        let mut invalid = None;
        'resolve: for submit in submits {
            let mut batch = Batch {
                waits: Vec::with_capacity(submit.waits.len()),
                wait_values: Vec::with_capacity(submit.waits.len()),
                command_buffers: submit.command_buffers.to_vec(),
                signals: Vec::with_capacity(submit.signals.len()),
            };
            for op in submit.waits {
                match state.semaphore(device, op.semaphore) {
                    Ok(payload) => {
                        batch.waits.push(Arc::clone(payload));
                        batch.wait_values.push(op.value);
                    }
                    Err(_) => {
                        invalid = Some((ObjectKind::Semaphore, op.semaphore));
                        break 'resolve;
                    }
                }
            }
            for op in submit.signals {
                match state.semaphore(device, op.semaphore) {
                    Ok(payload) => batch.signals.push((Arc::clone(payload), op.value)),
                    Err(_) => {
                        invalid = Some((ObjectKind::Semaphore, op.semaphore));
                        break 'resolve;
                    }
                }
            }
            for cb in submit.command_buffers {
                if !matches!(state.objects.get(&cb.0), Some(Object::CommandBuffer { device: owner }) if *owner == device)
                {
                    invalid = Some((ObjectKind::CommandBuffer, *cb));
                    break 'resolve;
                }
            }
            batches.push(batch);
        }

        if let Some(object) = invalid {
            let sink = state.sink_for_device(device);
            drop(state);
            Self::report(sink, "queue submission references an unknown object", vec![object]);
            return Err(HostError::InvalidUsage("queue submission references an unknown object"));
        }

        match state.objects.get(&queue.0) {
            Some(Object::Queue { jobs, .. }) => jobs
                .send(QueueJob::Submit(batches))
                .map_err(|_| HostError::DeviceLost),
            _ => Err(HostError::DeviceLost),
        }
    }

    fn queue_wait_idle(&self, queue: HostHandle) -> HostResult<()> {
        let (done, idle) = mpsc::channel();
        match self.state().objects.get(&queue.0) {
            Some(Object::Queue { jobs, .. }) => jobs
                .send(QueueJob::Idle(done))
                .map_err(|_| HostError::DeviceLost)?,
            _ => return Err(HostError::InvalidUsage("unknown queue")),
        }
        idle.recv().map_err(|_| HostError::DeviceLost)
    }

    fn allocate_command_buffer(&self, device: HostHandle) -> HostResult<HostHandle> {
        let mut state = self.state();
        if !matches!(state.objects.get(&device.0), Some(Object::Device { .. })) {
            return Err(HostError::InvalidUsage("unknown device"));
        }
        let cb = state.insert(
            Object::CommandBuffer { device: device.0 },
            self.config.max_objects,
        )?;
        Ok(HostHandle(cb))
    }

    fn free_command_buffer(&self, device: HostHandle, command_buffer: HostHandle) {
        let mut state = self.state();
        if matches!(state.objects.get(&command_buffer.0), Some(Object::CommandBuffer { device: owner }) if *owner == device.0)
        {
            state.remove(command_buffer.0);
        }
    }

    fn create_semaphore(
        &self,
        device: HostHandle,
        info: &HostSemaphoreInfo,
    ) -> HostResult<HostHandle> {
        if info.ty == SemaphoreType::Timeline && !self.config.caps.timeline_semaphore {
            return Err(HostError::FeatureNotPresent);
        }
        if !self.config.caps.semaphore.contains(info.export) {
            return Err(HostError::InvalidExternalHandle);
        }
        let mut state = self.state();
        if !matches!(state.objects.get(&device.0), Some(Object::Device { .. })) {
            return Err(HostError::InvalidUsage("unknown device"));
        }
        let initial = match info.ty {
            SemaphoreType::Timeline => info.initial_value,
            SemaphoreType::Binary => 0,
        };
        let semaphore = state.insert(
            Object::Semaphore {
                device: device.0,
                payload: Arc::new(SemaphorePayload {
                    ty: info.ty,
                    value: AtomicU64::new(initial),
                }),
                export: info.export,
            },
            self.config.max_objects,
        )?;
        Ok(HostHandle(semaphore))
    }

    fn destroy_semaphore(&self, device: HostHandle, semaphore: HostHandle) {
        let mut state = self.state();
        if state.semaphore(device.0, semaphore).is_ok() {
            state.remove(semaphore.0);
        }
    }

    fn signal_semaphore(
        &self,
        device: HostHandle,
        semaphore: HostHandle,
        value: u64,
    ) -> HostResult<()> {
        let state = self.state();
        let payload = state.semaphore(device.0, semaphore)?;
        if payload.ty != SemaphoreType::Timeline {
            return Err(HostError::InvalidUsage("host signal of a binary semaphore"));
        }
        if payload.value.load(Ordering::Acquire) >= value {
            let sink = state.sink_for_device(device.0);
            drop(state);
            Self::report(
                sink,
                "timeline semaphore signalled with a non-increasing value",
                vec![(ObjectKind::Semaphore, semaphore)],
            );
            return Err(HostError::InvalidUsage(
                "timeline semaphore signalled with a non-increasing value",
            ));
        }
        payload.signal(value);
        drop(state);
        self.notify();
        Ok(())
    }

    fn semaphore_counter_value(&self, device: HostHandle, semaphore: HostHandle) -> HostResult<u64> {
        let state = self.state();
        let payload = state.semaphore(device.0, semaphore)?;
        match payload.ty {
            SemaphoreType::Timeline => Ok(payload.value.load(Ordering::Acquire)),
            SemaphoreType::Binary => Err(HostError::InvalidUsage("counter of a binary semaphore")),
        }
    }

    fn wait_semaphores(
        &self,
        device: HostHandle,
        waits: &[HostSemaphoreOp],
        mode: WaitMode,
        timeout: Option<Duration>,
    ) -> HostResult<WaitOutcome> {
        let deadline = timeout.and_then(|timeout| Instant::now().checked_add(timeout));
        let mut state = self.state();

        let mut payloads = Vec::with_capacity(waits.len());
        for op in waits {
            let payload = state.semaphore(device.0, op.semaphore)?;
            if payload.ty != SemaphoreType::Timeline {
                return Err(HostError::InvalidUsage("host wait on a binary semaphore"));
            }
            payloads.push((Arc::clone(payload), op.value));
        }
        if payloads.is_empty() {
            return Ok(WaitOutcome::Satisfied);
        }

        loop {
            let mut signalled = payloads
                .iter()
                .map(|(payload, value)| payload.is_signalled(*value));
            let satisfied = match mode {
                WaitMode::Any => signalled.any(|s| s),
                WaitMode::All => signalled.all(|s| s),
            };
            if satisfied {
                return Ok(WaitOutcome::Satisfied);
            }
            if !matches!(state.objects.get(&device.0), Some(Object::Device { .. })) {
                return Err(HostError::DeviceLost);
            }

            match (timeout, deadline) {
                (Some(_), Some(deadline)) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(WaitOutcome::TimedOut);
                    }
                    state = wait_timeout(&self.shared.changed, state, deadline - now).0;
                }
                _ => state = wait(&self.shared.changed, state),
            }
        }
    }

    fn allocate_memory(&self, device: HostHandle, info: &HostMemoryInfo) -> HostResult<HostHandle> {
        if !self.config.caps.memory.contains(info.export) {
            return Err(HostError::InvalidExternalHandle);
        }
        let mut state = self.state();
        if !matches!(state.objects.get(&device.0), Some(Object::Device { .. })) {
            return Err(HostError::InvalidUsage("unknown device"));
        }
        if info.size == 0 {
            return Err(HostError::InvalidUsage("zero-sized allocation"));
        }
        if state.memory_in_use.saturating_add(info.size) > self.config.device_memory_budget {
            return Err(HostError::OutOfDeviceMemory);
        }
        let len = usize::try_from(info.size).map_err(|_| HostError::OutOfDeviceMemory)?;
        let storage = Arc::new(MemoryStorage::new(len)?);

        let memory = state.insert(
            Object::Memory {
                device: device.0,
                storage,
                export: info.export,
                accounted: info.size,
                mapping: None,
            },
            self.config.max_objects,
        )?;
        state.memory_in_use += info.size;
        Ok(HostHandle(memory))
    }

    fn free_memory(&self, device: HostHandle, memory: HostHandle) {
        self.unmap_memory(device, memory);
        let mut state = self.state();
        if matches!(state.objects.get(&memory.0), Some(Object::Memory { device: owner, .. }) if *owner == device.0)
        {
            if let Some(Object::Memory { accounted, .. }) = state.remove(memory.0) {
                state.memory_in_use -= accounted;
            }
        }
    }

    unsafe fn map_memory(
        &self,
        device: HostHandle,
        memory: HostHandle,
        placed: Option<NonNull<u8>>,
    ) -> HostResult<NonNull<u8>> {
        let placed_supported = self.config.caps.placed_mapping;
        let mut state = self.state();
        let (storage, mapping) = match state.objects.get_mut(&memory.0) {
            Some(Object::Memory {
                device: owner,
                storage,
                mapping,
                ..
            }) if *owner == device.0 => (storage, mapping),
            _ => return Err(HostError::InvalidUsage("unknown memory")),
        };
        if mapping.is_some() {
            return Err(HostError::MemoryMapFailed);
        }

        let address = match placed {
            Some(_) if !placed_supported => return Err(HostError::FeatureNotPresent),
            Some(address) => {
                // SAFETY: the caller guarantees `address` is valid for `storage.len` bytes; the
                // storage is live for as long as `storage` is.
                unsafe {
                    core::ptr::copy_nonoverlapping(
                        storage.ptr.as_ptr(),
                        address.as_ptr(),
                        storage.len,
                    );
                }
                address
            }
            None => storage.ptr,
        };
        *mapping = Some(Mapping {
            address: address.as_ptr() as usize,
            placed: placed.is_some(),
        });
        Ok(address)
    }

    fn unmap_memory(&self, device: HostHandle, memory: HostHandle) {
        let mut state = self.state();
        if let Some(Object::Memory {
            device: owner,
            storage,
            mapping,
            ..
        }) = state.objects.get_mut(&memory.0)
        {
            if *owner != device.0 {
                return;
            }
            if let Some(Mapping {
                address,
                placed: true,
            }) = mapping.take()
            {
                // SAFETY: `address` was validated by the caller of `map_memory` for the length of
                // the allocation and stays valid until this unmap.
                unsafe {
                    core::ptr::copy_nonoverlapping(
                        address as *const u8,
                        storage.ptr.as_ptr(),
                        storage.len,
                    );
                }
            }
        }
    }

    fn export_memory(
        &self,
        device: HostHandle,
        memory: HostHandle,
        ty: HostHandleTypes,
    ) -> HostResult<HostDescriptor> {
        let mut state = self.state();
        let storage = match state.objects.get(&memory.0) {
            Some(Object::Memory {
                device: owner,
                storage,
                export,
                ..
            }) if *owner == device.0 => {
                if ty.bits().count_ones() != 1 || !export.contains(ty) {
                    return Err(HostError::InvalidExternalHandle);
                }
                Arc::clone(storage)
            }
            _ => return Err(HostError::InvalidUsage("unknown memory")),
        };
        Ok(state.new_descriptor(DescriptorTarget::Memory(storage), ty))
    }

    fn import_memory(
        &self,
        device: HostHandle,
        descriptor: HostDescriptor,
        ty: HostHandleTypes,
        size: u64,
    ) -> HostResult<ImportedMemory> {
        if !self.config.caps.memory.contains(ty) || ty.is_empty() {
            return Err(HostError::InvalidExternalHandle);
        }
        let mut state = self.state();
        if !matches!(state.objects.get(&device.0), Some(Object::Device { .. })) {
            return Err(HostError::InvalidUsage("unknown device"));
        }
        let storage = match state.descriptors.get(&descriptor.0) {
            Some((DescriptorTarget::Memory(storage), exported)) if *exported == ty => {
                Arc::clone(storage)
            }
            _ => return Err(HostError::InvalidExternalHandle),
        };
        if size == 0 {
            return Err(HostError::InvalidUsage("zero-sized import"));
        }

        let actual = storage.len as u64;
        let memory = state.insert(
            Object::Memory {
                device: device.0,
                storage,
                export: ty,
                accounted: 0,
                mapping: None,
            },
            self.config.max_objects,
        )?;
        state.descriptors.remove(&descriptor.0);
        Ok(ImportedMemory {
            memory: HostHandle(memory),
            size: actual,
        })
    }

    fn export_semaphore(
        &self,
        device: HostHandle,
        semaphore: HostHandle,
        ty: HostHandleTypes,
    ) -> HostResult<HostDescriptor> {
        let mut state = self.state();
        let payload = match state.objects.get(&semaphore.0) {
            Some(Object::Semaphore {
                device: owner,
                payload,
                export,
            }) if *owner == device.0 => {
                if ty.bits().count_ones() != 1 || !export.contains(ty) {
                    return Err(HostError::InvalidExternalHandle);
                }
                Arc::clone(payload)
            }
            _ => return Err(HostError::InvalidUsage("unknown semaphore")),
        };
        Ok(state.new_descriptor(DescriptorTarget::Semaphore(payload), ty))
    }

    fn import_semaphore(
        &self,
        device: HostHandle,
        semaphore: HostHandle,
        descriptor: HostDescriptor,
        ty: HostHandleTypes,
    ) -> HostResult<()> {
        if !self.config.caps.semaphore.contains(ty) || ty.is_empty() {
            return Err(HostError::InvalidExternalHandle);
        }
        let mut state = self.state();
        let imported = match state.descriptors.get(&descriptor.0) {
            Some((DescriptorTarget::Semaphore(payload), exported)) if *exported == ty => {
                Arc::clone(payload)
            }
            _ => return Err(HostError::InvalidExternalHandle),
        };
        match state.objects.get_mut(&semaphore.0) {
            Some(Object::Semaphore {
                device: owner,
                payload,
                ..
            }) if *owner == device.0 => {
                if payload.ty != imported.ty {
                    return Err(HostError::InvalidExternalHandle);
                }
                *payload = imported;
            }
            _ => return Err(HostError::InvalidUsage("unknown semaphore")),
        }
        state.descriptors.remove(&descriptor.0);
        Ok(())
    }

    fn duplicate_descriptor(&self, descriptor: HostDescriptor) -> HostResult<HostDescriptor> {
        let mut state = self.state();
        let (target, ty) = state
            .descriptors
            .get(&descriptor.0)
            .cloned()
            .ok_or(HostError::InvalidExternalHandle)?;
        Ok(state.new_descriptor(target, ty))
    }

    fn close_descriptor(&self, descriptor: HostDescriptor) {
        self.state().descriptors.remove(&descriptor.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Mutex as StdMutex;

    fn device(driver: &SoftDriver) -> (HostHandle, HostHandle) {
        let instance = driver.create_instance().unwrap();
        let physical = driver.enumerate_physical_devices(instance).unwrap()[0];
        (instance, driver.create_device(physical).unwrap())
    }

    #[test]
    fn timeline_wait_times_out_then_succeeds() {
        let driver = SoftDriver::new();
        let (_, dev) = device(&driver);
        let sem = driver
            .create_semaphore(dev, &HostSemaphoreInfo::timeline(0))
            .unwrap();
        let op = [HostSemaphoreOp::new(sem, 2)];

        assert_eq!(
            driver.wait_semaphores(dev, &op, WaitMode::All, Some(Duration::ZERO)),
            Ok(WaitOutcome::TimedOut)
        );
        driver.signal_semaphore(dev, sem, 2).unwrap();
        assert_eq!(
            driver.wait_semaphores(dev, &op, WaitMode::All, Some(Duration::ZERO)),
            Ok(WaitOutcome::Satisfied)
        );
    }

    #[test]
    fn queue_orders_batches_behind_waits() {
        let driver = SoftDriver::new();
        let (_, dev) = device(&driver);
        let queue = driver.get_queue(dev, 0).unwrap();
        let gate = driver
            .create_semaphore(dev, &HostSemaphoreInfo::timeline(0))
            .unwrap();
        let done = driver
            .create_semaphore(dev, &HostSemaphoreInfo::timeline(0))
            .unwrap();
        let cb = driver.allocate_command_buffer(dev).unwrap();

        let waits = [HostSemaphoreOp::new(gate, 1)];
        let signals = [HostSemaphoreOp::new(done, 5)];
        driver
            .queue_submit(
                queue,
                &[HostSubmitInfo {
                    waits: &waits,
                    command_buffers: &[cb],
                    signals: &signals,
                }],
            )
            .unwrap();

        let done_op = [HostSemaphoreOp::new(done, 5)];
        assert_eq!(
            driver.wait_semaphores(dev, &done_op, WaitMode::All, Some(Duration::from_millis(20))),
            Ok(WaitOutcome::TimedOut)
        );
        assert!(driver.executed_command_buffers(queue).is_empty());

        driver.signal_semaphore(dev, gate, 1).unwrap();
        driver.queue_wait_idle(queue).unwrap();
        assert_eq!(driver.semaphore_counter_value(dev, done), Ok(5));
        assert_eq!(driver.executed_command_buffers(queue), vec![cb]);
    }

    #[test]
    fn binary_semaphores_are_consumed_by_waits() {
        let driver = SoftDriver::new();
        let (_, dev) = device(&driver);
        let queue = driver.get_queue(dev, 0).unwrap();
        let binary = driver
            .create_semaphore(dev, &HostSemaphoreInfo::binary())
            .unwrap();
        let done = driver
            .create_semaphore(dev, &HostSemaphoreInfo::timeline(0))
            .unwrap();

        let signal_binary = [HostSemaphoreOp::new(binary, 0)];
        let wait_binary = [HostSemaphoreOp::new(binary, 0)];
        let signal_done = [HostSemaphoreOp::new(done, 1)];
        driver
            .queue_submit(
                queue,
                &[
                    HostSubmitInfo {
                        signals: &signal_binary,
                        ..Default::default()
                    },
                    HostSubmitInfo {
                        waits: &wait_binary,
                        signals: &signal_done,
                        ..Default::default()
                    },
                ],
            )
            .unwrap();
        driver.queue_wait_idle(queue).unwrap();
        assert_eq!(driver.semaphore_counter_value(dev, done), Ok(1));
        assert!(driver.semaphore_counter_value(dev, binary).is_err());
    }

    #[test]
    fn import_consumes_descriptor_and_shares_payload() {
        let driver = SoftDriver::new();
        let (_, dev_a) = device(&driver);
        let (_, dev_b) = device(&driver);

        let info = HostSemaphoreInfo {
            export: HostHandleTypes::OPAQUE_FD,
            ..HostSemaphoreInfo::timeline(0)
        };
        let exported = driver.create_semaphore(dev_a, &info).unwrap();
        let fd = driver
            .export_semaphore(dev_a, exported, HostHandleTypes::OPAQUE_FD)
            .unwrap();
        let local = driver.create_semaphore(dev_b, &info).unwrap();

        // Wrong type leaves the descriptor with the caller.
        assert_eq!(
            driver.import_semaphore(dev_b, local, fd, HostHandleTypes::SYNC_FD),
            Err(HostError::InvalidExternalHandle)
        );
        assert_eq!(driver.live_descriptors(), 1);

        driver
            .import_semaphore(dev_b, local, fd, HostHandleTypes::OPAQUE_FD)
            .unwrap();
        assert_eq!(driver.live_descriptors(), 0);

        driver.signal_semaphore(dev_a, exported, 9).unwrap();
        assert_eq!(driver.semaphore_counter_value(dev_b, local), Ok(9));
    }

    #[test]
    fn imported_memory_reports_actual_size() {
        let driver = SoftDriver::new();
        let (_, dev) = device(&driver);
        let memory = driver
            .allocate_memory(
                dev,
                &HostMemoryInfo {
                    size: 64,
                    export: HostHandleTypes::OPAQUE_FD,
                },
            )
            .unwrap();
        let fd = driver
            .export_memory(dev, memory, HostHandleTypes::OPAQUE_FD)
            .unwrap();
        let dup = driver.duplicate_descriptor(fd).unwrap();
        driver.close_descriptor(fd);

        let imported = driver
            .import_memory(dev, dup, HostHandleTypes::OPAQUE_FD, 128)
            .unwrap();
        assert_eq!(imported.size, 64);
        assert_eq!(driver.live_descriptors(), 0);
    }

    #[test]
    fn placed_mapping_round_trips_contents() {
        let driver = SoftDriver::new();
        let (_, dev) = device(&driver);
        let memory = driver
            .allocate_memory(
                dev,
                &HostMemoryInfo {
                    size: 16,
                    export: HostHandleTypes::empty(),
                },
            )
            .unwrap();

        let mut placed = [0u8; 16];
        let at = NonNull::new(placed.as_mut_ptr()).unwrap();
        // SAFETY: `placed` outlives the mapping and is 16 bytes long.
        let ptr = unsafe { driver.map_memory(dev, memory, Some(at)) }.unwrap();
        assert_eq!(ptr, at);
        placed[3] = 0xAB;
        driver.unmap_memory(dev, memory);

        // SAFETY: unplaced mappings point at the driver's own storage.
        let ptr = unsafe { driver.map_memory(dev, memory, None) }.unwrap();
        assert_eq!(unsafe { *ptr.as_ptr().add(3) }, 0xAB);
        driver.unmap_memory(dev, memory);
    }

    #[test]
    fn validation_errors_reach_the_debug_sink() {
        let driver = SoftDriver::new();
        let (instance, dev) = device(&driver);
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink_seen = Arc::clone(&seen);
        driver
            .set_debug_sink(
                instance,
                Some(Arc::new(move |msg: &HostDebugMessage| {
                    sink_seen.lock().unwrap().push(msg.clone());
                })),
            )
            .unwrap();

        let sem = driver
            .create_semaphore(dev, &HostSemaphoreInfo::timeline(4))
            .unwrap();
        assert!(driver.signal_semaphore(dev, sem, 4).is_err());

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].severity, DebugSeverity::Error);
        assert_eq!(seen[0].objects, vec![(ObjectKind::Semaphore, sem)]);
    }

    #[test]
    fn destroying_a_device_abandons_blocked_work() {
        let driver = SoftDriver::new();
        let (_, dev) = device(&driver);
        let queue = driver.get_queue(dev, 0).unwrap();
        let never = driver
            .create_semaphore(dev, &HostSemaphoreInfo::timeline(0))
            .unwrap();
        let waits = [HostSemaphoreOp::new(never, 1)];
        driver
            .queue_submit(
                queue,
                &[HostSubmitInfo {
                    waits: &waits,
                    ..Default::default()
                }],
            )
            .unwrap();

        driver.destroy_device(dev);
        assert_eq!(driver.live_objects(ObjectKind::Queue), 0);
        assert_eq!(driver.live_objects(ObjectKind::Semaphore), 0);
    }

    #[test]
    fn memory_budget_is_enforced() {
        let driver = SoftDriver::with_config(SoftDriverConfig {
            device_memory_budget: 100,
            ..SoftDriverConfig::default()
        });
        let (_, dev) = device(&driver);
        let info = HostMemoryInfo {
            size: 64,
            export: HostHandleTypes::empty(),
        };
        let first = driver.allocate_memory(dev, &info).unwrap();
        assert_eq!(
            driver.allocate_memory(dev, &info),
            Err(HostError::OutOfDeviceMemory)
        );
        driver.free_memory(dev, first);
        assert!(driver.allocate_memory(dev, &info).is_ok());
    }
}
