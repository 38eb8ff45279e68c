//! Runtime handle and device registry
//!
//! A [`Runtime`] owns the driver and a registry of the devices it exposes. Discovery is
//! lazy and happens once: the first call that needs a device initializes the vendor
//! runtime, counts devices and opens each of them. Later calls reuse the cached result
//! through a read lock. A failed discovery is cached too and reported as
//! [`CalError::RuntimeInit`] until [`Runtime::shutdown`] resets the registry.
//!
//! ```text
//!   Uninitialized ──first use──▶ Ready { devices }
//!        ▲    │                      │
//!        │    └──discovery fails──▶ Failed(err)
//!        └────────── shutdown() ─────┘
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::config::RuntimeConfig;
use crate::driver::{DeviceId, DeviceInfo, Driver};
use crate::error::{CalError, Result};

/// One opened compute device
///
/// Cheap to clone. A `Device` belongs to the discovery that produced it; after a
/// shutdown it is rejected by every runtime operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    index: u32,
    id: DeviceId,
    info: DeviceInfo,
    generation: u64,
}

impl Device {
    /// Ordinal of the device in discovery order
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn id(&self) -> DeviceId {
        self.id
    }

    /// Capability info reported at discovery
    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "device{} ({})", self.index, self.id)
    }
}

enum Registry {
    Uninitialized,
    Ready { devices: Vec<Device> },
    Failed(CalError),
}

/// Process-scoped entry point to the vendor runtime
pub struct Runtime {
    pub(crate) driver: Arc<dyn Driver>,
    pub(crate) config: RuntimeConfig,
    registry: RwLock<Registry>,
    generations: AtomicU64,
    pub(crate) next_execution: AtomicU64,
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &*self.registry.read() {
            Registry::Uninitialized => "uninitialized".to_string(),
            Registry::Ready { devices } => format!("ready ({} devices)", devices.len()),
            Registry::Failed(err) => format!("failed ({err})"),
        };
        f.debug_struct("Runtime")
            .field("config", &self.config)
            .field("registry", &state)
            .finish()
    }
}

impl Runtime {
    /// Create a runtime over `driver`; no driver call is made until a device is needed
    pub fn new(driver: Arc<dyn Driver>, config: RuntimeConfig) -> Self {
        Self {
            driver,
            config,
            registry: RwLock::new(Registry::Uninitialized),
            generations: AtomicU64::new(0),
            next_execution: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// The driver this runtime issues calls to
    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }

    /// Number of devices, discovering them on first use
    pub fn device_count(&self) -> Result<u32> {
        self.with_devices(|devices| Ok(devices.len() as u32))
    }

    /// Device `index`, discovering devices on first use
    pub fn device(&self, index: u32) -> Result<Device> {
        self.with_devices(|devices| {
            devices.get(index as usize).cloned().ok_or(CalError::InvalidDevice {
                index,
                count: devices.len() as u32,
            })
        })
    }

    /// Reject devices from an earlier discovery
    pub(crate) fn check_device(&self, device: &Device) -> Result<()> {
        self.with_devices(|devices| match devices.get(device.index as usize) {
            Some(current) if current.generation == device.generation && current.id == device.id => Ok(()),
            _ => Err(CalError::InvalidDevice {
                index: device.index,
                count: devices.len() as u32,
            }),
        })
    }

    /// Close every device and shut the vendor runtime down
    ///
    /// Every step is attempted; the first failure is returned. The registry is reset
    /// either way, so the next device query rediscovers. Executions still in flight
    /// must be joined before calling this.
    pub fn shutdown(&self) -> Result<()> {
        let mut registry = self.registry.write();
        let previous = std::mem::replace(&mut *registry, Registry::Uninitialized);

        let devices = match previous {
            Registry::Ready { devices } => devices,
            Registry::Uninitialized | Registry::Failed(_) => return Ok(()),
        };

        let mut first_error = None;
        for device in &devices {
            if let Err(err) = self.driver.device_close(device.id) {
                tracing::warn!(device = %device.id, error = %err, "failed to close device");
                first_error.get_or_insert(CalError::runtime_init(err));
            }
        }
        if let Err(err) = self.driver.shutdown() {
            tracing::warn!(error = %err, "runtime shutdown failed");
            first_error.get_or_insert(CalError::runtime_init(err));
        }

        tracing::info!(devices = devices.len(), "runtime shut down");
        first_error.map_or(Ok(()), Err)
    }

    fn with_devices<T>(&self, f: impl FnOnce(&[Device]) -> Result<T>) -> Result<T> {
        {
            let registry = self.registry.read();
            match &*registry {
                Registry::Ready { devices } => return f(devices),
                Registry::Failed(err) => return Err(err.clone()),
                Registry::Uninitialized => {}
            }
        }

        let mut registry = self.registry.write();
        // Another thread may have finished discovery while we waited for the write lock
        if let Registry::Uninitialized = &*registry {
            *registry = match self.discover() {
                Ok(devices) => Registry::Ready { devices },
                Err(err) => {
                    tracing::warn!(error = %err, "device discovery failed");
                    Registry::Failed(err)
                }
            };
        }

        match &*registry {
            Registry::Ready { devices } => f(devices),
            Registry::Failed(err) => Err(err.clone()),
            Registry::Uninitialized => Err(CalError::RuntimeInit {
                operation: "discover",
                message: "device registry not initialized".into(),
            }),
        }
    }

    fn discover(&self) -> Result<Vec<Device>> {
        let generation = self.generations.fetch_add(1, Ordering::AcqRel) + 1;
        self.driver.init().map_err(CalError::runtime_init)?;

        let count = match self.driver.device_count() {
            Ok(count) => count,
            Err(err) => {
                let _ = self.driver.shutdown();
                return Err(CalError::runtime_init(err));
            }
        };

        let mut devices = Vec::with_capacity(count as usize);
        for index in 0..count {
            let opened = self
                .driver
                .device_info(index)
                .and_then(|info| self.driver.device_open(index).map(|id| (id, info)));
            match opened {
                Ok((id, info)) => {
                    tracing::debug!(
                        index,
                        device = %id,
                        target = info.target.0,
                        max_1d = info.max_resource_1d_width,
                        max_2d_width = info.max_resource_2d_width,
                        max_2d_height = info.max_resource_2d_height,
                        "opened device"
                    );
                    devices.push(Device {
                        index,
                        id,
                        info,
                        generation,
                    });
                }
                Err(err) => {
                    for device in devices.iter().rev() {
                        let _ = self.driver.device_close(device.id);
                    }
                    let _ = self.driver.shutdown();
                    return Err(CalError::runtime_init(err));
                }
            }
        }

        tracing::info!(count, "discovered compute devices");
        Ok(devices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::fake::{DriverCall, FakeDriver};
    use crate::driver::ops;

    fn runtime(fake: &Arc<FakeDriver>) -> Runtime {
        Runtime::new(fake.clone(), RuntimeConfig::default())
    }

    #[test]
    fn discovery_is_lazy_and_runs_once() {
        let fake = Arc::new(FakeDriver::new().with_devices(2));
        let rt = runtime(&fake);
        assert!(fake.calls().is_empty());

        assert_eq!(rt.device_count().unwrap(), 2);
        assert_eq!(rt.device(1).unwrap().index(), 1);
        assert_eq!(rt.device_count().unwrap(), 2);
        assert_eq!(fake.call_count(ops::INIT), 1);
        assert_eq!(fake.call_count(ops::DEVICE_OPEN), 2);
    }

    #[test]
    fn out_of_range_device_is_rejected() {
        let fake = Arc::new(FakeDriver::new());
        let rt = runtime(&fake);
        assert_eq!(rt.device(3).unwrap_err(), CalError::InvalidDevice { index: 3, count: 1 });
    }

    #[test]
    fn failed_discovery_is_cached_until_shutdown() {
        let fake = Arc::new(FakeDriver::new());
        fake.fail_on(ops::INIT, 1);
        let rt = runtime(&fake);

        let err = rt.device_count().unwrap_err();
        assert!(matches!(err, CalError::RuntimeInit { operation: "calInit", .. }));
        assert_eq!(rt.device_count().unwrap_err(), err);
        assert_eq!(fake.call_count(ops::INIT), 1);

        rt.shutdown().unwrap();
        assert_eq!(rt.device_count().unwrap(), 1);
    }

    #[test]
    fn open_failure_closes_already_opened_devices() {
        let fake = Arc::new(FakeDriver::new().with_devices(3));
        fake.fail_on(ops::DEVICE_OPEN, 3);
        let rt = runtime(&fake);

        assert!(rt.device_count().is_err());
        assert_eq!(fake.call_count(ops::DEVICE_CLOSE), 2);
        assert_eq!(fake.call_count(ops::SHUTDOWN), 1);
    }

    #[test]
    fn shutdown_closes_devices_and_invalidates_handles() {
        let fake = Arc::new(FakeDriver::new());
        let rt = runtime(&fake);
        let device = rt.device(0).unwrap();

        rt.shutdown().unwrap();
        let closes: Vec<_> = fake
            .calls()
            .into_iter()
            .filter(|call| matches!(call, DriverCall::DeviceClose(_)))
            .collect();
        assert_eq!(closes, vec![DriverCall::DeviceClose(device.id())]);

        assert!(matches!(rt.check_device(&device), Err(CalError::InvalidDevice { .. })));
        let fresh = rt.device(0).unwrap();
        assert!(rt.check_device(&fresh).is_ok());
    }
}
