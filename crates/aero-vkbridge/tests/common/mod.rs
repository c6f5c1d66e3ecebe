//! Shared helpers for `aero-vkbridge` integration tests.
//!
//! A "process" here is one [`Instance`] plus a device. Processes built from the same
//! [`SoftDriver`] and [`Kernel`] can exchange resources the way two guest processes on one host
//! would.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use aero_vkbridge::{
    BridgeConfig, Device, GuestHandle, GuestMemoryHandleTypes, Instance, Kernel,
    MemoryAllocateInfo, SoftDriver,
};

/// Installs a test-writer subscriber once per binary. `RUST_LOG` controls verbosity.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub struct Process {
    // The device must go before its instance.
    pub device: Device,
    pub instance: Instance,
}

impl Process {
    pub fn new(driver: &Arc<SoftDriver>, kernel: &Arc<Kernel>) -> Self {
        let instance = Instance::new(driver.clone(), Arc::clone(kernel), BridgeConfig::default())
            .expect("create instance");
        let physical = instance.enumerate_physical_devices().expect("enumerate")[0];
        let device = instance.create_device(physical).expect("create device");
        Self { device, instance }
    }

    pub fn queue(&self) -> GuestHandle {
        self.device.get_queue(0).expect("queue 0")
    }

    pub fn keyed_memory(&self, size: u64) -> GuestHandle {
        self.device
            .allocate_memory(&MemoryAllocateInfo {
                size,
                export: GuestMemoryHandleTypes::OPAQUE_WIN32,
                keyed_mutex: true,
            })
            .expect("allocate keyed-mutex memory")
    }
}

pub struct World {
    pub driver: Arc<SoftDriver>,
    pub kernel: Arc<Kernel>,
}

impl World {
    pub fn new() -> Self {
        init_tracing();
        Self {
            driver: Arc::new(SoftDriver::new()),
            kernel: Arc::new(Kernel::new()),
        }
    }

    pub fn with_driver(driver: SoftDriver) -> Self {
        init_tracing();
        Self {
            driver: Arc::new(driver),
            kernel: Arc::new(Kernel::new()),
        }
    }

    pub fn process(&self) -> Process {
        Process::new(&self.driver, &self.kernel)
    }
}

/// Polls `cond` until it holds, failing the test after five seconds.
pub fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(1));
    }
}
