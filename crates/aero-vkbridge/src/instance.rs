//! Guest instances: one per simulated process context.
//!
//! An [`Instance`] owns the context's [`ObjectRegistry`]; every device and device object created
//! through it is registered there. Destroying the instance closes the registry and releases
//! whatever is still alive.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use tracing::{debug, warn};

use crate::config::BridgeConfig;
use crate::device::{self, Device, ObjectPayload};
use crate::error::Result;
use crate::host::{
    DebugSeverity, HostDebugMessage, HostDebugSink, HostDriver, HostHandle,
    HostPhysicalDeviceProperties,
};
use crate::kernel::Kernel;
use crate::object::{ContextId, GuestHandle, ObjectKind, ObjectRegistry};
use crate::sync::{lock, read, write};

/// A host debug message with its objects translated to guest handles.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DebugMessage {
    pub severity: DebugSeverity,
    pub message: String,
    /// Objects the message refers to; [`GuestHandle::NULL`] for objects this context never
    /// handed out.
    pub objects: Vec<(ObjectKind, GuestHandle)>,
}

/// Guest diagnostics callback. May run on host driver threads.
pub type DebugCallback = Arc<dyn Fn(&DebugMessage) + Send + Sync>;

pub(crate) struct InstanceShared {
    pub(crate) host: Arc<dyn HostDriver>,
    pub(crate) kernel: Arc<Kernel>,
    pub(crate) config: BridgeConfig,
    pub(crate) registry: ObjectRegistry<ObjectPayload>,
    host_instance: HostHandle,
    handle: GuestHandle,
    physical_devices: Mutex<Vec<(HostHandle, GuestHandle)>>,
    callback: RwLock<Option<DebugCallback>>,
    destroyed: AtomicBool,
}

impl InstanceShared {
    fn deliver(&self, message: &HostDebugMessage) {
        let Some(callback) = read(&self.callback).clone() else {
            return;
        };
        let objects = message
            .objects
            .iter()
            .map(|&(kind, host)| {
                let guest = self
                    .registry
                    .lookup_host(kind, host)
                    .unwrap_or(GuestHandle::NULL);
                (kind, guest)
            })
            .collect();
        callback(&DebugMessage {
            severity: message.severity,
            message: message.message.clone(),
            objects,
        });
    }
}

pub struct Instance {
    shared: Arc<InstanceShared>,
}

impl Instance {
    /// Creates a context on `host`. Every instance sharing `kernel` can exchange external
    /// resources with this one.
    pub fn new(host: Arc<dyn HostDriver>, kernel: Arc<Kernel>, config: BridgeConfig) -> Result<Self> {
        let host_instance = host.create_instance()?;
        let registry = ObjectRegistry::new(ContextId::next(), config.always_track_host_objects);
        let handle = match registry.wrap(
            host_instance,
            ObjectKind::Instance,
            GuestHandle::NULL,
            ObjectPayload::None,
        ) {
            Ok(handle) => handle,
            Err(err) => {
                host.destroy_instance(host_instance);
                return Err(err);
            }
        };
        debug!(instance = ?handle, context = ?registry.context(), "instance: created");

        Ok(Self {
            shared: Arc::new(InstanceShared {
                host,
                kernel,
                config,
                registry,
                host_instance,
                handle,
                physical_devices: Mutex::new(Vec::new()),
                callback: RwLock::new(None),
                destroyed: AtomicBool::new(false),
            }),
        })
    }

    pub fn handle(&self) -> GuestHandle {
        self.shared.handle
    }

    pub fn context(&self) -> ContextId {
        self.shared.registry.context()
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.shared.config
    }

    /// Live objects registered in this context, the instance itself included.
    pub fn object_count(&self) -> usize {
        self.shared.registry.len()
    }

    /// Physical devices, wrapped once and cached for the instance's lifetime.
    pub fn enumerate_physical_devices(&self) -> Result<Vec<GuestHandle>> {
        let hosts = self
            .shared
            .host
            .enumerate_physical_devices(self.shared.host_instance)?;
        let mut known = lock(&self.shared.physical_devices);
        let mut handles = Vec::with_capacity(hosts.len());
        for host in hosts {
            let handle = match known.iter().find(|(h, _)| *h == host) {
                Some(&(_, handle)) => handle,
                None => {
                    let handle = self.shared.registry.wrap(
                        host,
                        ObjectKind::PhysicalDevice,
                        self.shared.handle,
                        ObjectPayload::None,
                    )?;
                    known.push((host, handle));
                    handle
                }
            };
            handles.push(handle);
        }
        Ok(handles)
    }

    pub fn physical_device_properties(
        &self,
        physical_device: GuestHandle,
    ) -> Result<HostPhysicalDeviceProperties> {
        let host = self
            .shared
            .registry
            .unwrap_kind(physical_device, ObjectKind::PhysicalDevice)?;
        Ok(self.shared.host.physical_device_properties(host)?)
    }

    pub fn create_device(&self, physical_device: GuestHandle) -> Result<Device> {
        Device::new(Arc::clone(&self.shared), physical_device)
    }

    /// Installs or (with `None`) removes the diagnostics callback.
    ///
    /// While a callback is installed the registry keeps its host → guest index so host messages
    /// can name guest objects.
    pub fn set_debug_callback(&self, callback: Option<DebugCallback>) -> Result<()> {
        let enabled = callback.is_some();
        if enabled {
            self.shared.registry.set_tracking(true);
            *write(&self.shared.callback) = callback;

            let weak: Weak<InstanceShared> = Arc::downgrade(&self.shared);
            let sink: HostDebugSink = Arc::new(move |message: &HostDebugMessage| {
                if let Some(shared) = weak.upgrade() {
                    shared.deliver(message);
                }
            });
            self.shared
                .host
                .set_debug_sink(self.shared.host_instance, Some(sink))?;
        } else {
            self.shared
                .host
                .set_debug_sink(self.shared.host_instance, None)?;
            *write(&self.shared.callback) = None;
            self.shared.registry.set_tracking(false);
        }
        debug!(instance = ?self.shared.handle, enabled, "instance: debug callback updated");
        Ok(())
    }

    /// Destroys the instance and every object still alive in it.
    pub fn destroy(self) {
        drop(self);
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        let shared = &self.shared;
        if shared.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(err) = shared.host.set_debug_sink(shared.host_instance, None) {
            warn!(%err, "instance: failed to remove debug sink");
        }
        let removed = shared.registry.close();
        if removed.len() > 1 {
            debug!(
                instance = ?shared.handle,
                leaked = removed.len() - 1,
                "instance: destroying objects still alive"
            );
        }
        device::release_objects(shared.host.as_ref(), &[], &removed);
        shared.host.destroy_instance(shared.host_instance);
        debug!(instance = ?shared.handle, "instance: destroyed");
    }
}
