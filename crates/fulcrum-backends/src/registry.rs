//! Backend registry
//!
//! Collects every compiled-in backend and the devices it exposes, in
//! priority order (GPU-class first, CPU last), and answers lookups by name
//! or device type. The process-wide instance is built on first access to
//! [`registry()`], reading [`RuntimeConfig::from_env`] exactly once.
//!
//! ```rust
//! use fulcrum_backends::backend::DeviceType;
//! use fulcrum_backends::config::RuntimeConfig;
//! use fulcrum_backends::registry::Registry;
//!
//! let registry = Registry::with_config(&RuntimeConfig::default());
//! let cpu = registry.device_by_type(DeviceType::Cpu).unwrap();
//! assert_eq!(cpu.name(), "CPU");
//! assert!(registry.device_by_name("TPU0").is_none());
//! ```

use crate::backend::{Backend, BackendRegRef, DeviceProps, DeviceRef, DeviceType, Feature};
use crate::backends::cpu::CpuBackendReg;
use crate::config::RuntimeConfig;
use crate::error::Result;
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::{Arc, OnceLock};

#[derive(Default)]
struct Entries {
    backends: Vec<BackendRegRef>,
    devices: Vec<DeviceRef>,
}

/// Registered backends and the flat list of their devices.
///
/// Lists only grow. Reads take a shared lock; registration takes the write
/// lock only to append.
#[derive(Default)]
pub struct Registry {
    entries: RwLock<Entries>,
    config: Option<RuntimeConfig>,
}

impl Registry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every compiled-in backend, configured by `config`.
    pub fn with_config(config: &RuntimeConfig) -> Self {
        let registry = Self {
            entries: RwLock::default(),
            config: Some(config.clone()),
        };
        #[cfg(feature = "gpu")]
        registry.register_backend(Some(Arc::new(crate::backends::gpu::GpuBackendReg::new(config))));
        registry.register_backend(Some(Arc::new(CpuBackendReg::new(config.cpu.clone()))));
        registry
    }

    /// Configuration the compiled-in backends were built with, if any.
    pub fn config(&self) -> Option<&RuntimeConfig> {
        self.config.as_ref()
    }

    /// Append `reg` and every device it exposes. `None` is a no-op.
    pub fn register_backend(&self, reg: Option<BackendRegRef>) {
        let Some(reg) = reg else {
            tracing::debug!("register_backend(None) ignored");
            return;
        };
        let devices: Vec<DeviceRef> = (0..reg.device_count()).map(|i| reg.device(i)).collect();
        tracing::debug!(backend = reg.name(), devices = devices.len(), "registered backend");
        let mut entries = self.entries.write();
        entries.backends.push(reg);
        for device in devices {
            tracing::debug!(device = device.name(), description = device.description(), "registered device");
            entries.devices.push(device);
        }
    }

    /// Append a single device.
    pub fn register_device(&self, device: DeviceRef) {
        tracing::debug!(device = device.name(), "registered device");
        self.entries.write().devices.push(device);
    }

    pub fn backend_count(&self) -> usize {
        self.entries.read().backends.len()
    }

    /// Backend `index`.
    ///
    /// # Panics
    ///
    /// Aborts when `index >= backend_count()`.
    pub fn backend(&self, index: usize) -> BackendRegRef {
        let entries = self.entries.read();
        match entries.backends.get(index) {
            Some(reg) => Arc::clone(reg),
            None => crate::fatal!(
                "backend index {index} out of range ({} registered)",
                entries.backends.len()
            ),
        }
    }

    pub fn device_count(&self) -> usize {
        self.entries.read().devices.len()
    }

    /// Device `index` of the flat device list.
    ///
    /// # Panics
    ///
    /// Aborts when `index >= device_count()`.
    pub fn device(&self, index: usize) -> DeviceRef {
        let entries = self.entries.read();
        match entries.devices.get(index) {
            Some(device) => Arc::clone(device),
            None => crate::fatal!(
                "device index {index} out of range ({} registered)",
                entries.devices.len()
            ),
        }
    }

    pub fn backends(&self) -> Vec<BackendRegRef> {
        self.entries.read().backends.clone()
    }

    pub fn devices(&self) -> Vec<DeviceRef> {
        self.entries.read().devices.clone()
    }

    /// First backend named `name`, ignoring ASCII case.
    pub fn backend_by_name(&self, name: &str) -> Option<BackendRegRef> {
        self.entries
            .read()
            .backends
            .iter()
            .find(|reg| reg.name().eq_ignore_ascii_case(name))
            .cloned()
    }

    /// First device named `name`, ignoring ASCII case.
    pub fn device_by_name(&self, name: &str) -> Option<DeviceRef> {
        self.entries
            .read()
            .devices
            .iter()
            .find(|device| device.name().eq_ignore_ascii_case(name))
            .cloned()
    }

    /// First device of type `ty`, in registration order.
    pub fn device_by_type(&self, ty: DeviceType) -> Option<DeviceRef> {
        self.entries
            .read()
            .devices
            .iter()
            .find(|device| device.device_type() == ty)
            .cloned()
    }

    /// Execution context on the device named `name`.
    pub fn init_by_name(&self, name: &str, params: Option<&str>) -> Option<Box<dyn Backend>> {
        init(self.device_by_name(name)?, params)
    }

    /// Execution context on the first device of type `ty`.
    pub fn init_by_type(&self, ty: DeviceType, params: Option<&str>) -> Option<Box<dyn Backend>> {
        init(self.device_by_type(ty)?, params)
    }

    /// Execution context on the first GPU, else the CPU, else `None`.
    pub fn init_best(&self) -> Option<Box<dyn Backend>> {
        let device = self
            .device_by_type(DeviceType::Gpu)
            .or_else(|| self.device_by_type(DeviceType::Cpu))?;
        init(device, None)
    }

    /// Serializable snapshot of everything registered.
    pub fn inventory(&self) -> Inventory {
        let entries = self.entries.read();
        Inventory {
            backends: entries
                .backends
                .iter()
                .map(|reg| BackendInfo {
                    name: reg.name().to_string(),
                    features: reg.features(),
                    devices: (0..reg.device_count()).map(|i| reg.device(i).name().to_string()).collect(),
                })
                .collect(),
            devices: entries.devices.iter().map(|device| device.props()).collect(),
            config: self.config.clone(),
        }
    }
}

fn init(device: DeviceRef, params: Option<&str>) -> Option<Box<dyn Backend>> {
    let result: Result<Box<dyn Backend>> = device.init_backend(params);
    result
        .inspect_err(|err| tracing::warn!(device = device.name(), error = %err, "failed to initialize backend"))
        .ok()
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let entries = self.entries.read();
        f.debug_struct("Registry")
            .field("backends", &entries.backends.iter().map(|r| r.name().to_string()).collect::<Vec<_>>())
            .field("devices", &entries.devices.iter().map(|d| d.name().to_string()).collect::<Vec<_>>())
            .finish()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BackendInfo {
    pub name: String,
    pub features: Vec<Feature>,
    pub devices: Vec<String>,
}

/// Snapshot produced by [`Registry::inventory`].
#[derive(Debug, Clone, Serialize)]
pub struct Inventory {
    pub backends: Vec<BackendInfo>,
    pub devices: Vec<DeviceProps>,
    pub config: Option<RuntimeConfig>,
}

impl Inventory {
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|err| crate::BackendError::Other(format!("inventory: {err}")))
    }
}

static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// The process-wide registry, built on first call.
///
/// An unparsable environment override is logged and the defaults are used.
pub fn registry() -> &'static Registry {
    REGISTRY.get_or_init(|| {
        let config = RuntimeConfig::from_env().unwrap_or_else(|err| {
            tracing::warn!(error = %err, "ignoring invalid runtime configuration");
            RuntimeConfig::default()
        });
        let _span = fulcrum_tracing::perf_span!("registry_init", gpu_devices = config.gpu_devices);
        let registry = Registry::with_config(&config);
        tracing::debug!(
            backends = registry.backend_count(),
            devices = registry.device_count(),
            "global registry ready"
        );
        registry
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::cpu::CpuBackendReg;
    use crate::config::CpuConfig;

    #[test]
    fn test_empty_registry_lookups() {
        let registry = Registry::new();
        assert_eq!(registry.backend_count(), 0);
        assert!(registry.backend_by_name("CPU").is_none());
        assert!(registry.device_by_type(DeviceType::Gpu).is_none());
        assert!(registry.init_best().is_none());
    }

    #[test]
    fn test_register_none_is_noop() {
        let registry = Registry::new();
        registry.register_backend(None);
        assert_eq!(registry.backend_count(), 0);
        assert_eq!(registry.device_count(), 0);
    }

    #[test]
    fn test_register_backend_adds_devices() {
        let registry = Registry::new();
        registry.register_backend(Some(Arc::new(CpuBackendReg::new(CpuConfig::default()))));
        assert_eq!(registry.backend_count(), 1);
        assert_eq!(registry.device_count(), 1);
        assert_eq!(registry.device(0).name(), "CPU");
        assert!(registry.backend_by_name("cpu").is_some());
        assert!(registry.init_by_name("CPU", None).is_some());
        assert!(registry.init_by_type(DeviceType::Accel, None).is_none());
    }

    #[test]
    #[should_panic(expected = "backend index 2 out of range")]
    fn test_backend_index_out_of_range() {
        Registry::new().backend(2);
    }

    #[test]
    #[should_panic(expected = "device index 0 out of range")]
    fn test_device_index_out_of_range() {
        Registry::new().device(0);
    }

    #[test]
    fn test_register_device_directly() {
        let registry = Registry::new();
        let reg = CpuBackendReg::new(CpuConfig::default());
        registry.register_device(crate::backend::BackendReg::device(&reg, 0));
        assert_eq!(registry.backend_count(), 0);
        assert!(registry.device_by_name("CPU").is_some());
    }
}
