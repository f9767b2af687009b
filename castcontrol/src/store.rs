//! Device-store collaborator. Persistence itself is external; the registry
//! only needs lookup and update entry points.

use std::collections::HashMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use castssdp::ServiceAnnouncement;

use crate::model::Device;

/// Persisted per-service pairing state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// uuid of the service instance this config belongs to.
    pub service_uuid: String,
    /// Credential issued by the device at pairing.
    pub client_key: Option<String>,
    /// Pinned server public key (base64 SPKI).
    pub pinned_key: Option<String>,
    /// Device uuid adopted from the server hello.
    pub paired_device_uuid: Option<String>,
}

/// Lookup and persistence seam consumed by the registry.
pub trait DeviceStore: Send + Sync {
    /// Rehydrate a previously known device by its stable uuid.
    fn get_device(&self, uuid: &str) -> Option<Device>;
    fn get_service_config(&self, announcement: &ServiceAnnouncement) -> Option<ServiceConfig>;
    fn update_device(&self, device: &Device);
}

/// In-memory store for hosts without persistence and for tests.
#[derive(Default)]
pub struct MemoryDeviceStore {
    devices: Mutex<HashMap<String, Device>>,
    configs: Mutex<HashMap<String, ServiceConfig>>,
}

impl MemoryDeviceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_service_config(&self, uuid: &str, config: ServiceConfig) {
        self.configs.lock().insert(uuid.to_string(), config);
    }
}

impl DeviceStore for MemoryDeviceStore {
    fn get_device(&self, uuid: &str) -> Option<Device> {
        self.devices.lock().get(uuid).cloned()
    }

    fn get_service_config(&self, announcement: &ServiceAnnouncement) -> Option<ServiceConfig> {
        self.configs.lock().get(&announcement.uuid).cloned()
    }

    fn update_device(&self, device: &Device) {
        self.devices
            .lock()
            .insert(device.id.clone(), device.clone());
    }
}
