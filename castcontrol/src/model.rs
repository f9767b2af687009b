//! The consolidated device aggregate owned by the registry.

use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::SystemTime;

use castssdp::ServiceAnnouncement;

use crate::services::DeviceService;

/// One attached service of a device.
#[derive(Clone)]
pub struct DeviceServiceEntry {
    pub announcement: ServiceAnnouncement,
    pub service: Arc<dyn DeviceService>,
}

impl fmt::Debug for DeviceServiceEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceServiceEntry")
            .field("service_id", &self.service.service_id())
            .field("uuid", &self.announcement.uuid)
            .finish()
    }
}

/// A physical device consolidated from one or more announcements.
///
/// The registry is the sole owner; observers receive clones. One physical
/// device can run several discovery transports on one address, so raw
/// announcements key on the IP alone while the consolidated set keys on
/// (friendly name, IP).
#[derive(Debug, Clone)]
pub struct Device {
    /// Stable device uuid, taken from the first announcement.
    pub id: String,
    pub friendly_name: String,
    pub model_name: String,
    pub ip: IpAddr,
    pub last_known_ip: Option<IpAddr>,
    pub last_detection: SystemTime,
    /// Attached services, keyed by service identifier.
    pub services: HashMap<String, DeviceServiceEntry>,
}

impl Device {
    pub fn from_announcement(announcement: &ServiceAnnouncement) -> Self {
        Self {
            id: announcement.uuid.clone(),
            friendly_name: announcement.friendly_name.clone(),
            model_name: announcement.model_name.clone(),
            ip: announcement.ip,
            last_known_ip: None,
            last_detection: announcement.last_detection,
            services: HashMap::new(),
        }
    }

    /// Key of the raw-announcement map.
    pub fn raw_key(announcement: &ServiceAnnouncement) -> String {
        announcement.ip.to_string()
    }

    /// Key of the consolidated (compatible) map.
    pub fn compatible_key(&self) -> String {
        format!("{}{}", self.friendly_name, self.ip)
    }

    /// Refresh identity fields from a newer announcement.
    pub fn absorb(&mut self, announcement: &ServiceAnnouncement) {
        if !announcement.friendly_name.is_empty() {
            self.friendly_name = announcement.friendly_name.clone();
        }
        if !announcement.model_name.is_empty() {
            self.model_name = announcement.model_name.clone();
        }
        if self.ip != announcement.ip {
            self.last_known_ip = Some(self.ip);
            self.ip = announcement.ip;
        }
        self.last_detection = announcement.last_detection;
    }

    pub fn attach_service(&mut self, entry: DeviceServiceEntry) {
        self.services
            .insert(entry.service.service_id().to_string(), entry);
    }

    /// Detach a service, handing the entry back so the caller can close it.
    pub fn remove_service(&mut self, service_id: &str) -> Option<DeviceServiceEntry> {
        self.services.remove(service_id)
    }
}
