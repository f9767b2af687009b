//! # castcontrol - device registry and control protocol for CastLink
//!
//! Consolidates multi-transport discovery announcements into unified device
//! records and maintains authenticated control sessions to the devices that
//! need one.
//!
//! ## Architecture
//!
//! - [`DeviceRegistry`] : owns the device map, composes discovery providers,
//!   fans out ordered observer events
//! - [`ControlSession`] : the stateful pairing/pinning WebSocket client
//! - [`DeviceServiceFactory`] : explicit registration table pairing a control
//!   implementation with its discovery filter
//! - [`DeviceStore`] : persistence seam for paired-device credentials
//!
//! The registry is a plain value created by the host (typically one per
//! process) and injected where needed; there is no global singleton.

mod channel;
mod dispatch;
mod errors;
mod model;
mod protocol;
mod registry;
mod services;
mod session;
mod store;
mod verify;

pub use channel::{ChannelEvent, ChannelFactory, ControlChannel, WsChannel, WsChannelFactory};
pub use dispatch::Dispatcher;
pub use errors::ControlError;
pub use model::{Device, DeviceServiceEntry};
pub use protocol::{
    ClientIdentity, CommandError, Frame, Manifest, PAIRING_SET_PIN_URI, PairingType,
    default_permissions,
};
pub use registry::{
    DeviceRegistry, IfAddrsMonitor, NetworkMonitor, RegistryObserver, SSDP_PROVIDER_KEY,
};
pub use services::{
    DeviceService, DeviceServiceFactory, MEDIA_RENDERER_FILTER, MEDIA_RENDERER_SERVICE_ID,
    MediaRendererFactory, MediaRendererService, WEBOS_TV_FILTER, WEBOS_TV_SERVICE_ID,
    WebSocketTvFactory, WebSocketTvService,
};
pub use session::{
    Command, ControlSession, ResponseHandler, SessionConfig, SessionListener, SessionState,
};
pub use store::{DeviceStore, MemoryDeviceStore, ServiceConfig};
pub use verify::{CertVerifier, PinnedCertVerifier, verification_outcome};
