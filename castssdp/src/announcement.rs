//! Discovery vocabulary shared between providers and the device registry.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::SystemTime;

use crate::description::DescribedService;

/// One discovered network service, as reported by a discovery provider.
///
/// Created on the first multicast response for a given uuid, completed once
/// the description document resolves, refreshed on repeat announcements and
/// dropped on an explicit byebye or provider reset.
#[derive(Debug, Clone)]
pub struct ServiceAnnouncement {
    /// Stable service instance uuid (from the USN header).
    pub uuid: String,
    /// SSDP filter token (ST/NT) this announcement matched.
    pub service_filter: String,
    /// Service identifier of the device-service registration this event is
    /// addressed to. Set per-filter when the provider fans out.
    pub service_id: String,
    pub ip: IpAddr,
    pub port: u16,
    pub friendly_name: String,
    pub model_name: String,
    pub model_number: String,
    pub model_description: String,
    pub manufacturer: String,
    /// Application URL advertised by the description document, if any.
    pub application_url: Option<String>,
    /// Embedded services from the description document.
    pub service_list: Vec<DescribedService>,
    /// Raw response headers of the description fetch.
    pub response_headers: String,
    /// Description document URL (LOCATION header).
    pub location: Option<String>,
    pub last_detection: SystemTime,
}

impl ServiceAnnouncement {
    /// A bare announcement as known before its description document resolves.
    pub fn pending(uuid: String, service_filter: String, ip: IpAddr, port: u16) -> Self {
        Self {
            uuid,
            service_filter,
            service_id: String::new(),
            ip,
            port,
            friendly_name: String::new(),
            model_name: String::new(),
            model_number: String::new(),
            model_description: String::new(),
            manufacturer: String::new(),
            application_url: None,
            service_list: Vec::new(),
            response_headers: String::new(),
            location: None,
            last_detection: SystemTime::now(),
        }
    }

    /// Refresh the last-seen timestamp.
    pub fn touch(&mut self) {
        self.last_detection = SystemTime::now();
    }
}

/// Pairing of a device-service identifier with the provider-specific filter
/// token it is discovered through. Equality is structural on both fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryFilter {
    pub service_id: String,
    pub ssdp_filter: String,
}

impl DiscoveryFilter {
    pub fn new(service_id: impl Into<String>, ssdp_filter: impl Into<String>) -> Self {
        Self {
            service_id: service_id.into(),
            ssdp_filter: ssdp_filter.into(),
        }
    }
}

/// Receives service-level events from a [`DiscoveryProvider`].
pub trait DiscoveryProviderListener: Send + Sync {
    fn service_added(&self, announcement: &ServiceAnnouncement);
    fn service_removed(&self, announcement: &ServiceAnnouncement);
    fn discovery_failed(&self, message: &str);
}

/// A discovery transport engine the registry composes.
pub trait DiscoveryProvider: Send + Sync {
    /// Idempotent; opens sockets and starts the receive loops.
    fn start(&self);
    /// Interrupts the receive loops and closes the socket. Keeps discovery
    /// state so a transient network loss can resume.
    fn stop(&self);
    /// `stop` followed by `start`.
    fn restart(&self) {
        self.stop();
        self.start();
    }
    /// `stop` plus clearing of all discovery state.
    fn reset(&self);
    /// Issue one search round for every registered filter.
    fn scan(&self);

    fn add_filter(&self, filter: DiscoveryFilter);
    fn remove_filter(&self, filter: &DiscoveryFilter);
    fn is_empty(&self) -> bool;

    fn add_listener(&self, listener: Arc<dyn DiscoveryProviderListener>);
}
