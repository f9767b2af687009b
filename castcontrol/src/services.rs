//! Device-service registration table.
//!
//! Services are registered explicitly through [`DeviceServiceFactory`]
//! implementations resolved at startup; there is no runtime class lookup.

use std::sync::Arc;

use tracing::debug;

use castssdp::{DiscoveryFilter, ServiceAnnouncement};

use crate::session::{Command, ControlSession, SessionConfig, SessionListener};
use crate::store::ServiceConfig;

pub const WEBOS_TV_SERVICE_ID: &str = "webOS TV";
pub const WEBOS_TV_FILTER: &str = "urn:lge-com:service:webos-second-screen:1";

pub const MEDIA_RENDERER_SERVICE_ID: &str = "MediaRenderer";
pub const MEDIA_RENDERER_FILTER: &str = "urn:schemas-upnp-org:device:MediaRenderer:1";

/// A concrete control-capability attachment on a device.
pub trait DeviceService: Send + Sync {
    fn service_id(&self) -> &str;
    fn announcement(&self) -> ServiceAnnouncement;
    /// Close any open control session. Passive services no-op.
    fn disconnect(&self);
}

/// Constructs [`DeviceService`] instances for announcements matching one
/// discovery filter.
pub trait DeviceServiceFactory: Send + Sync {
    fn service_id(&self) -> &'static str;
    fn discovery_filter(&self) -> DiscoveryFilter;
    /// Announcement validation. Default is unconditional acceptance;
    /// rejection here is what makes a device end up with no services and be
    /// discarded by the registry.
    fn accepts(&self, _announcement: &ServiceAnnouncement) -> bool {
        true
    }
    fn create(
        &self,
        announcement: &ServiceAnnouncement,
        config: Option<ServiceConfig>,
    ) -> Arc<dyn DeviceService>;
}

/// The pairing/pinning control family: a WebSocket session to the TV's
/// second-screen endpoint.
pub struct WebSocketTvService {
    announcement: ServiceAnnouncement,
    session: Arc<ControlSession>,
}

impl WebSocketTvService {
    pub fn session(&self) -> &Arc<ControlSession> {
        &self.session
    }

    pub fn connect(&self) {
        self.session.connect();
    }

    pub fn send_command(&self, command: Command) -> Option<u64> {
        self.session.send_command(command)
    }

    pub fn send_pairing_key(&self, pin: &str) {
        self.session.send_pairing_key(pin);
    }

    pub fn add_listener(&self, listener: Arc<dyn SessionListener>) {
        self.session.add_listener(listener);
    }
}

impl DeviceService for WebSocketTvService {
    fn service_id(&self) -> &str {
        WEBOS_TV_SERVICE_ID
    }

    fn announcement(&self) -> ServiceAnnouncement {
        self.announcement.clone()
    }

    fn disconnect(&self) {
        self.session.disconnect();
    }
}

#[derive(Default)]
pub struct WebSocketTvFactory {
    pub session_config: SessionConfig,
}

impl DeviceServiceFactory for WebSocketTvFactory {
    fn service_id(&self) -> &'static str {
        WEBOS_TV_SERVICE_ID
    }

    fn discovery_filter(&self) -> DiscoveryFilter {
        DiscoveryFilter::new(WEBOS_TV_SERVICE_ID, WEBOS_TV_FILTER)
    }

    fn create(
        &self,
        announcement: &ServiceAnnouncement,
        config: Option<ServiceConfig>,
    ) -> Arc<dyn DeviceService> {
        debug!(
            "Creating TV control service for {} at {}",
            announcement.friendly_name, announcement.ip
        );
        let session = ControlSession::new(
            announcement.ip,
            announcement.port,
            self.session_config.clone(),
            config.as_ref(),
        );
        Arc::new(WebSocketTvService {
            announcement: announcement.clone(),
            session,
        })
    }
}

/// Passive record of a UPnP media renderer. Rendering control itself is out
/// of scope; the attachment only marks the capability on the device.
pub struct MediaRendererService {
    announcement: ServiceAnnouncement,
}

impl DeviceService for MediaRendererService {
    fn service_id(&self) -> &str {
        MEDIA_RENDERER_SERVICE_ID
    }

    fn announcement(&self) -> ServiceAnnouncement {
        self.announcement.clone()
    }

    fn disconnect(&self) {}
}

#[derive(Debug, Default)]
pub struct MediaRendererFactory;

impl DeviceServiceFactory for MediaRendererFactory {
    fn service_id(&self) -> &'static str {
        MEDIA_RENDERER_SERVICE_ID
    }

    fn discovery_filter(&self) -> DiscoveryFilter {
        DiscoveryFilter::new(MEDIA_RENDERER_SERVICE_ID, MEDIA_RENDERER_FILTER)
    }

    // A renderer without a resolved service list is unusable.
    fn accepts(&self, announcement: &ServiceAnnouncement) -> bool {
        !announcement.service_list.is_empty()
    }

    fn create(
        &self,
        announcement: &ServiceAnnouncement,
        _config: Option<ServiceConfig>,
    ) -> Arc<dyn DeviceService> {
        Arc::new(MediaRendererService {
            announcement: announcement.clone(),
        })
    }
}
